use super::{NativeSizeFunction, QueuingStrategy, SizeFunction};

/// Counts every chunk as one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        // Set this.[[highWaterMark]] to init["highWaterMark"].
        Self { high_water_mark }
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl From<CountQueuingStrategy> for QueuingStrategy {
    fn from(strategy: CountQueuingStrategy) -> Self {
        QueuingStrategy {
            high_water_mark: Some(strategy.high_water_mark),
            size: Some(SizeFunction::Native(NativeSizeFunction::Count)),
        }
    }
}
