//! Readable, writable and transform streams with the WHATWG semantics, driven by a
//! single-threaded [`Ctx`](brook_utils::Ctx) job queue.
//!
//! https://streams.spec.whatwg.org/
pub use self::{
    queuing_strategy::{ByteLengthQueuingStrategy, CountQueuingStrategy, QueuingStrategy},
    readable::{
        ReadableByteStreamController, ReadableStream, ReadableStreamAsyncIterator,
        ReadableStreamBYOBReadResult, ReadableStreamBYOBReader, ReadableStreamBYOBRequest,
        ReadableStreamController, ReadableStreamDefaultController, ReadableStreamDefaultReader,
        ReadableStreamReadResult, ReadableStreamReader, ReadableStreamState, StreamPipeOptions,
        UnderlyingByteSource, UnderlyingSource,
    },
    readable_writable_pair::ReadableWritablePair,
    transform::{TransformStream, TransformStreamDefaultController, Transformer},
    writable::{
        UnderlyingSink, WritableStream, WritableStreamDefaultController,
        WritableStreamDefaultWriter, WritableStreamState,
    },
};

mod queuing_strategy;
mod readable;
mod readable_writable_pair;
mod transform;
mod utils;
mod writable;
