use super::{NativeSizeFunction, QueuingStrategy, SizeFunction};

/// Measures chunks by their byte length. Chunks must be [`brook_utils::Value::Bytes`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        // Set this.[[highWaterMark]] to init["highWaterMark"].
        Self { high_water_mark }
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl From<ByteLengthQueuingStrategy> for QueuingStrategy {
    fn from(strategy: ByteLengthQueuingStrategy) -> Self {
        QueuingStrategy {
            high_water_mark: Some(strategy.high_water_mark),
            size: Some(SizeFunction::Native(NativeSizeFunction::ByteLength)),
        }
    }
}
