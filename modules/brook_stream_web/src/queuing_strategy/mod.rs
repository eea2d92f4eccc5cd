use std::{fmt, rc::Rc};

use brook_utils::{Error, Result, Value};

pub use byte_length::ByteLengthQueuingStrategy;
pub use count::CountQueuingStrategy;

mod byte_length;
mod count;

type SizeFn = dyn Fn(&Value) -> Result<f64>;

/// QueuingStrategy describes how backpressure should be signalled for a stream.
#[derive(Clone, Default)]
pub struct QueuingStrategy {
    high_water_mark: Option<f64>,
    size: Option<SizeFunction>,
}

impl QueuingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_water_mark(mut self, high_water_mark: f64) -> Self {
        self.high_water_mark = Some(high_water_mark);
        self
    }

    /// Sets the callback that measures each chunk. An error returned from it errors the
    /// stream the chunk was offered to.
    pub fn with_size(mut self, size: impl Fn(&Value) -> Result<f64> + 'static) -> Self {
        self.size = Some(SizeFunction::Rust(Rc::new(size)));
        self
    }

    pub fn high_water_mark(&self) -> Option<f64> {
        self.high_water_mark
    }

    pub(crate) fn has_size(&self) -> bool {
        self.size.is_some()
    }

    pub(crate) fn extract_high_water_mark(&self, default_hwm: f64) -> Result<f64> {
        match self.high_water_mark {
            // If strategy["highWaterMark"] does not exist, return defaultHWM.
            None => Ok(default_hwm),
            // If highWaterMark is NaN or highWaterMark < 0, throw a RangeError exception.
            Some(high_water_mark) if high_water_mark.is_nan() || high_water_mark < 0.0 => {
                Err(Error::validation("Invalid highWaterMark"))
            },
            // Return highWaterMark.
            Some(high_water_mark) => Ok(high_water_mark),
        }
    }

    pub(crate) fn extract_size_algorithm(&self) -> SizeAlgorithm {
        // If strategy["size"] does not exist, return an algorithm that returns 1.
        match &self.size {
            None => SizeAlgorithm::AlwaysOne,
            Some(size) => SizeAlgorithm::SizeFunction(size.clone()),
        }
    }
}

impl fmt::Debug for QueuingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .field("size", &self.size.is_some())
            .finish()
    }
}

/// SizeAlgorithm represents the two ways we might generate sizes - by calling a function or by simply returning 1.0 (the default)
#[derive(Clone)]
pub(crate) enum SizeAlgorithm {
    AlwaysOne,
    SizeFunction(SizeFunction),
}

impl SizeAlgorithm {
    pub(crate) fn call(&self, chunk: &Value) -> Result<f64> {
        match self {
            Self::AlwaysOne | Self::SizeFunction(SizeFunction::Native(NativeSizeFunction::Count)) => {
                Ok(1.0)
            },
            Self::SizeFunction(SizeFunction::Native(NativeSizeFunction::ByteLength)) => {
                byte_length_queuing_strategy_size_function(chunk)
            },
            Self::SizeFunction(SizeFunction::Rust(f)) => f(chunk),
        }
    }
}

/// SizeFunction abstracts over user-provided size functions and the ones provided by the built-in strategies.
#[derive(Clone)]
pub(crate) enum SizeFunction {
    Rust(Rc<SizeFn>),
    Native(NativeSizeFunction),
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum NativeSizeFunction {
    ByteLength,
    Count,
}

fn byte_length_queuing_strategy_size_function(chunk: &Value) -> Result<f64> {
    match chunk {
        Value::Bytes(view) => Ok(view.byte_length() as f64),
        other => Err(Error::validation(format!(
            "ByteLengthQueuingStrategy argument 'chunk' must be bytes, got {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use brook_utils::ArrayBufferView;

    use super::*;

    #[test]
    fn extracts_high_water_mark() {
        assert_eq!(QueuingStrategy::new().extract_high_water_mark(1.0), Ok(1.0));
        assert_eq!(
            QueuingStrategy::new()
                .with_high_water_mark(4.0)
                .extract_high_water_mark(1.0),
            Ok(4.0)
        );
        for invalid in [-1.0, f64::NAN] {
            assert!(QueuingStrategy::new()
                .with_high_water_mark(invalid)
                .extract_high_water_mark(1.0)
                .unwrap_err()
                .is_validation());
        }
    }

    #[test]
    fn size_algorithms() {
        let chunk = Value::from(ArrayBufferView::from_bytes(vec![0; 5]));
        assert_eq!(
            QueuingStrategy::new().extract_size_algorithm().call(&chunk),
            Ok(1.0)
        );
        let strategy: QueuingStrategy = ByteLengthQueuingStrategy::new(16.0).into();
        assert_eq!(strategy.extract_size_algorithm().call(&chunk), Ok(5.0));
        assert!(strategy
            .extract_size_algorithm()
            .call(&Value::from("text"))
            .unwrap_err()
            .is_validation());
        let strategy: QueuingStrategy = CountQueuingStrategy::new(2.0).into();
        assert_eq!(strategy.extract_size_algorithm().call(&chunk), Ok(1.0));
        assert_eq!(strategy.high_water_mark(), Some(2.0));
    }
}
