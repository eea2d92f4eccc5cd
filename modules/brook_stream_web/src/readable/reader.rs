use brook_utils::{promise::promise_rejected_with, Ctx, Error, Promise, ResolveablePromise, Value};

use super::{ReadableStream, ReadableStreamBYOBReader, ReadableStreamDefaultReader, ReadableStreamState};

// typedef (ReadableStreamDefaultReader or ReadableStreamBYOBReader) ReadableStreamReader;
/// The lock holder of a readable stream, tagged by kind.
#[derive(Clone)]
pub enum ReadableStreamReader {
    Default(ReadableStreamDefaultReader),
    Byob(ReadableStreamBYOBReader),
}

impl ReadableStreamReader {
    pub fn closed(&self) -> Promise<()> {
        self.with_generic(|generic| generic.closed_promise.promise.clone())
    }

    pub fn cancel(&self, reason: impl Into<Value>) -> Promise<()> {
        match self {
            Self::Default(r) => r.cancel(reason),
            Self::Byob(r) => r.cancel(reason),
        }
    }

    pub fn release_lock(&self) {
        match self {
            Self::Default(r) => r.release_lock(),
            Self::Byob(r) => r.release_lock(),
        }
    }

    pub(crate) fn with_generic<R>(&self, f: impl FnOnce(&mut ReadableStreamGenericReader) -> R) -> R {
        match self {
            Self::Default(r) => f(&mut r.0.borrow_mut().generic),
            Self::Byob(r) => f(&mut r.0.borrow_mut().generic),
        }
    }

    pub(crate) fn stream(&self) -> Option<ReadableStream> {
        self.with_generic(|generic| generic.stream.clone())
    }

    pub(crate) fn ptr_eq(&self, other: &ReadableStreamReader) -> bool {
        match (self, other) {
            (Self::Default(a), Self::Default(b)) => a.ptr_eq(b),
            (Self::Byob(a), Self::Byob(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub(crate) fn resolve_closed_promise(&self) {
        self.with_generic(|generic| generic.closed_promise.resolve_undefined())
    }

    pub(crate) fn reject_closed_promise(&self, e: Value) {
        self.with_generic(|generic| {
            generic.closed_promise.reject(e);
            generic.closed_promise.set_is_handled();
        })
    }
}

impl From<ReadableStreamDefaultReader> for ReadableStreamReader {
    fn from(value: ReadableStreamDefaultReader) -> Self {
        Self::Default(value)
    }
}

impl From<ReadableStreamBYOBReader> for ReadableStreamReader {
    fn from(value: ReadableStreamBYOBReader) -> Self {
        Self::Byob(value)
    }
}

pub(crate) struct ReadableStreamGenericReader {
    pub(crate) closed_promise: ResolveablePromise<()>,
    pub(crate) stream: Option<ReadableStream>,
    pub(crate) ctx: Ctx,
}

impl ReadableStreamGenericReader {
    pub(crate) fn readable_stream_reader_generic_initialize(stream: &ReadableStream) -> Self {
        let ctx = stream.ctx();
        let closed_promise = match stream.state() {
            // If stream.[[state]] is "readable",
            // Set reader.[[closedPromise]] to a new promise.
            ReadableStreamState::Readable => ResolveablePromise::new(&ctx),
            // Otherwise, if stream.[[state]] is "closed",
            // Set reader.[[closedPromise]] to a promise resolved with undefined.
            ReadableStreamState::Closed => ResolveablePromise::resolved(&ctx, ()),
            // Otherwise,
            ReadableStreamState::Errored(stored_error) => {
                // Set reader.[[closedPromise]] to a promise rejected with stream.[[storedError]].
                let promise = ResolveablePromise::rejected(&ctx, stored_error);
                // Set reader.[[closedPromise]].[[PromiseIsHandled]] to true.
                promise.set_is_handled();
                promise
            },
        };

        Self {
            // Set reader.[[stream]] to stream.
            stream: Some(stream.clone()),
            closed_promise,
            ctx,
        }
    }

    pub(crate) fn readable_stream_reader_generic_release(reader: &ReadableStreamReader) {
        // Let stream be reader.[[stream]].
        // Assert: stream is not undefined.
        let Some(stream) = reader.stream() else {
            return;
        };

        let ctx = stream.ctx();
        let released = || -> Value {
            Error::state(
                "Reader was released and can no longer be used to monitor the stream's closedness",
            )
            .into()
        };

        let readable = stream.is_readable();
        reader.with_generic(|generic| {
            if readable {
                // If stream.[[state]] is "readable", reject reader.[[closedPromise]] with a TypeError exception.
                generic.closed_promise.reject(released());
            } else {
                // Otherwise, set reader.[[closedPromise]] to a promise rejected with a TypeError exception.
                generic.closed_promise = ResolveablePromise::rejected(&ctx, released());
            }
            // Set reader.[[closedPromise]].[[PromiseIsHandled]] to true.
            generic.closed_promise.set_is_handled();
        });

        // Perform ! stream.[[controller]].[[ReleaseSteps]]().
        stream.controller().release_steps();

        // Set stream.[[reader]] to undefined.
        stream.0.borrow_mut().reader = None;

        // Set reader.[[stream]] to undefined.
        reader.with_generic(|generic| generic.stream = None);
    }

    pub(crate) fn readable_stream_reader_generic_cancel(
        reader: &ReadableStreamReader,
        reason: Value,
    ) -> Promise<()> {
        // Let stream be reader.[[stream]].
        match reader.stream() {
            // Return ! ReadableStreamCancel(stream, reason).
            Some(stream) => stream.readable_stream_cancel(reason),
            None => {
                let ctx = reader.with_generic(|generic| generic.ctx.clone());
                promise_rejected_with(
                    &ctx,
                    Error::state("Cannot cancel a stream using a released reader"),
                )
            },
        }
    }
}
