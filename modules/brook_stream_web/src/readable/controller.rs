use brook_utils::{Promise, Value};

use super::{
    ReadableByteStreamController, ReadableStreamDefaultController, ReadableStreamReadRequest,
};

/// The controller behind a readable stream, tagged by kind.
#[derive(Clone)]
pub enum ReadableStreamController {
    Default(ReadableStreamDefaultController),
    Byte(ReadableByteStreamController),
}

impl ReadableStreamController {
    pub fn desired_size(&self) -> Option<f64> {
        match self {
            Self::Default(c) => c.desired_size(),
            Self::Byte(c) => c.desired_size(),
        }
    }

    pub(crate) fn pull_steps(&self, read_request: Box<dyn ReadableStreamReadRequest>) {
        match self {
            Self::Default(c) => c.pull_steps(read_request),
            Self::Byte(c) => c.pull_steps(read_request),
        }
    }

    pub(crate) fn cancel_steps(&self, reason: Value) -> Promise<()> {
        match self {
            Self::Default(c) => c.cancel_steps(reason),
            Self::Byte(c) => c.cancel_steps(reason),
        }
    }

    pub(crate) fn release_steps(&self) {
        match self {
            Self::Default(c) => c.release_steps(),
            Self::Byte(c) => c.release_steps(),
        }
    }
}

impl From<ReadableStreamDefaultController> for ReadableStreamController {
    fn from(value: ReadableStreamDefaultController) -> Self {
        Self::Default(value)
    }
}

impl From<ReadableByteStreamController> for ReadableStreamController {
    fn from(value: ReadableByteStreamController) -> Self {
        Self::Byte(value)
    }
}
