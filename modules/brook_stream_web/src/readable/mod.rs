use brook_utils::{ArrayBufferView, Value};

mod byob_reader;
mod byte_controller;
mod controller;
mod default_controller;
mod default_reader;
mod iterator;
mod pipe;
mod reader;
mod stream;

pub use byob_reader::ReadableStreamBYOBReader;
pub use byte_controller::{ReadableByteStreamController, ReadableStreamBYOBRequest};
pub use controller::ReadableStreamController;
pub use default_controller::ReadableStreamDefaultController;
pub use default_reader::ReadableStreamDefaultReader;
pub use iterator::ReadableStreamAsyncIterator;
pub use pipe::StreamPipeOptions;
pub use reader::ReadableStreamReader;
pub use stream::{
    ReadableStream, ReadableStreamState, UnderlyingByteSource, UnderlyingSource,
};

pub(crate) use stream::{
    algorithms::{flatten, CancelAlgorithm, PullAlgorithm, StartAlgorithm},
    ReadableStreamWeak,
};

/// The value a read settles with.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadableStreamReadResult {
    pub value: Value,
    pub done: bool,
}

impl ReadableStreamReadResult {
    pub(crate) fn chunk(value: Value) -> Self {
        Self { value, done: false }
    }

    pub(crate) fn done() -> Self {
        Self {
            value: Value::Undefined,
            done: true,
        }
    }
}

/// The value a BYOB read settles with. `value` is the filled view, or `None` when the stream
/// was cancelled before the view could be handed back.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadableStreamBYOBReadResult {
    pub value: Option<ArrayBufferView>,
    pub done: bool,
}

pub(crate) trait ReadableStreamReadRequest {
    fn chunk_steps(self: Box<Self>, chunk: Value);

    fn close_steps(self: Box<Self>);

    fn error_steps(self: Box<Self>, reason: Value);
}

pub(crate) trait ReadableStreamReadIntoRequest {
    fn chunk_steps(self: Box<Self>, chunk: ArrayBufferView);

    fn close_steps(self: Box<Self>, chunk: Option<ArrayBufferView>);

    fn error_steps(self: Box<Self>, reason: Value);
}
