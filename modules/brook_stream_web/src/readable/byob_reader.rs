use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use brook_utils::{
    promise::promise_rejected_with, ArrayBufferView, Ctx, Error, Promise, ResolveablePromise,
    Result, Value,
};

use super::{
    reader::ReadableStreamGenericReader, ReadableStream, ReadableStreamBYOBReadResult,
    ReadableStreamController, ReadableStreamReadIntoRequest, ReadableStreamReader,
    ReadableStreamState,
};

/// Reads from a byte stream into caller supplied buffers.
///
/// The buffer behind every view passed to [`ReadableStreamBYOBReader::read`] is transferred
/// into the stream; the caller's view is left detached and the filled bytes come back in a new
/// view over the same storage.
#[derive(Clone)]
pub struct ReadableStreamBYOBReader(pub(crate) Rc<RefCell<ReadableStreamBYOBReaderInner>>);

pub(crate) struct ReadableStreamBYOBReaderInner {
    pub(crate) generic: ReadableStreamGenericReader,
    read_into_requests: VecDeque<Box<dyn ReadableStreamReadIntoRequest>>,
}

impl ReadableStreamBYOBReader {
    /// Locks the byte stream `stream` to a new BYOB reader.
    pub fn new(stream: &ReadableStream) -> Result<Self> {
        Self::set_up_readable_stream_byob_reader(stream)
    }

    /// Reads at least one element into `view`.
    pub fn read(&self, view: ArrayBufferView) -> Promise<ReadableStreamBYOBReadResult> {
        self.read_with_min(view, 1)
    }

    /// Reads into `view`, waiting until at least `min` elements are filled unless the stream
    /// closes first.
    pub fn read_with_min(
        &self,
        view: ArrayBufferView,
        min: usize,
    ) -> Promise<ReadableStreamBYOBReadResult> {
        let ctx = self.ctx();

        // If IsDetachedBuffer(view.[[ViewedArrayBuffer]]) is true, return a promise rejected with a TypeError exception.
        if view.buffer().is_detached() {
            return promise_rejected_with(
                &ctx,
                Error::detached("view's buffer has been detached"),
            );
        }

        // If view.[[ByteLength]] is 0, return a promise rejected with a TypeError exception.
        if view.byte_length() == 0 {
            return promise_rejected_with(
                &ctx,
                Error::validation("view must have non-zero byteLength"),
            );
        }

        // If view.[[ViewedArrayBuffer]].[[ArrayBufferByteLength]] is 0, return a promise rejected with a TypeError exception.
        if view.buffer().byte_length() == 0 {
            return promise_rejected_with(
                &ctx,
                Error::validation("view's buffer must have non-zero byteLength"),
            );
        }

        // If options["min"] is 0, return a promise rejected with a TypeError exception.
        if min == 0 {
            return promise_rejected_with(
                &ctx,
                Error::validation("options.min must be greater than 0"),
            );
        }

        // If view has a [[TypedArrayName]] internal slot,
        // If options["min"] > view.[[ArrayLength]], return a promise rejected with a RangeError exception.
        // Otherwise (i.e., it is a DataView),
        // If options["min"] > view.[[ByteLength]], return a promise rejected with a RangeError exception.
        if min > view.length() {
            return promise_rejected_with(
                &ctx,
                Error::validation(format!(
                    "options.min must be less than or equal to the view's length of {}",
                    view.length()
                )),
            );
        }

        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        if self.stream().is_none() {
            return promise_rejected_with(
                &ctx,
                Error::state("Cannot read from a stream using a released reader"),
            );
        }

        // Let promise be a new promise.
        let promise = ResolveablePromise::new(&ctx);

        // Let readIntoRequest be a new read-into request with the following items:
        struct ReadIntoRequest {
            promise: ResolveablePromise<ReadableStreamBYOBReadResult>,
        }

        impl ReadableStreamReadIntoRequest for ReadIntoRequest {
            // chunk steps, given chunk
            fn chunk_steps(self: Box<Self>, chunk: ArrayBufferView) {
                // Resolve promise with «[ "value" → chunk, "done" → false ]».
                self.promise.resolve(ReadableStreamBYOBReadResult {
                    value: Some(chunk),
                    done: false,
                })
            }

            // close steps, given chunk
            fn close_steps(self: Box<Self>, chunk: Option<ArrayBufferView>) {
                // Resolve promise with «[ "value" → chunk, "done" → true ]».
                self.promise.resolve(ReadableStreamBYOBReadResult {
                    value: chunk,
                    done: true,
                })
            }

            // error steps, given e
            fn error_steps(self: Box<Self>, reason: Value) {
                // Reject promise with e.
                self.promise.reject(reason)
            }
        }

        // Perform ! ReadableStreamBYOBReaderRead(this, view, options["min"], readIntoRequest).
        self.readable_stream_byob_reader_read(
            view,
            min,
            Box::new(ReadIntoRequest {
                promise: promise.clone(),
            }),
        );

        // Return promise.
        promise.promise
    }

    pub fn release_lock(&self) {
        // If this.[[stream]] is undefined, return.
        if self.stream().is_none() {
            return;
        }

        // Perform ! ReadableStreamBYOBReaderRelease(this).
        self.readable_stream_byob_reader_release()
    }

    pub fn closed(&self) -> Promise<()> {
        self.0.borrow().generic.closed_promise.promise.clone()
    }

    pub fn cancel(&self, reason: impl Into<Value>) -> Promise<()> {
        // Return ! ReadableStreamReaderGenericCancel(this, reason).
        ReadableStreamGenericReader::readable_stream_reader_generic_cancel(
            &self.clone().into(),
            reason.into(),
        )
    }

    pub(crate) fn set_up_readable_stream_byob_reader(stream: &ReadableStream) -> Result<Self> {
        // If ! IsReadableStreamLocked(stream) is true, throw a TypeError exception.
        if stream.is_readable_stream_locked() {
            return Err(Error::state(
                "This stream has already been locked for exclusive reading by another reader",
            ));
        }

        // If stream.[[controller]] does not implement ReadableByteStreamController, throw a TypeError exception.
        if !matches!(stream.controller(), ReadableStreamController::Byte(_)) {
            return Err(Error::validation(
                "Cannot construct a ReadableStreamBYOBReader for a stream not constructed with a byte source",
            ));
        }

        // Perform ! ReadableStreamReaderGenericInitialize(reader, stream).
        let reader = Self(Rc::new(RefCell::new(ReadableStreamBYOBReaderInner {
            generic: ReadableStreamGenericReader::readable_stream_reader_generic_initialize(stream),
            // Set reader.[[readIntoRequests]] to a new empty list.
            read_into_requests: VecDeque::new(),
        })));

        // Set stream.[[reader]] to reader.
        stream.0.borrow_mut().reader = Some(ReadableStreamReader::Byob(reader.clone()));

        Ok(reader)
    }

    pub(crate) fn readable_stream_byob_reader_read(
        &self,
        view: ArrayBufferView,
        min: usize,
        read_into_request: Box<dyn ReadableStreamReadIntoRequest>,
    ) {
        // Let stream be reader.[[stream]].
        let Some(stream) = self.stream() else {
            read_into_request.error_steps(
                Error::state("Cannot read from a stream using a released reader").into(),
            );
            return;
        };

        let (state, controller) = {
            let mut stream = stream.0.borrow_mut();
            // Set stream.[[disturbed]] to true.
            stream.disturbed = true;
            (stream.state.clone(), stream.controller.clone())
        };

        // If stream.[[state]] is "errored", perform readIntoRequest’s error steps given stream.[[storedError]].
        if let ReadableStreamState::Errored(stored_error) = state {
            read_into_request.error_steps(stored_error);
            return;
        }

        match controller {
            // Otherwise, perform ! ReadableByteStreamControllerPullInto(stream.[[controller]], view, min, readIntoRequest).
            ReadableStreamController::Byte(controller) => {
                controller.readable_byte_stream_controller_pull_into(view, min, read_into_request)
            },
            ReadableStreamController::Default(_) => read_into_request.error_steps(
                Error::validation("BYOB reads need a byte stream").into(),
            ),
        }
    }

    pub(crate) fn readable_stream_byob_reader_release(&self) {
        // Perform ! ReadableStreamReaderGenericRelease(reader).
        ReadableStreamGenericReader::readable_stream_reader_generic_release(&self.clone().into());

        // Let e be a new TypeError exception.
        let e: Value = Error::state("Reader was released").into();

        // Perform ! ReadableStreamBYOBReaderErrorReadIntoRequests(reader, e).
        self.readable_stream_byob_reader_error_read_into_requests(e)
    }

    pub(crate) fn readable_stream_byob_reader_error_read_into_requests(&self, e: Value) {
        // Let readIntoRequests be reader.[[readIntoRequests]].
        // Set reader.[[readIntoRequests]] to a new empty list.
        let read_into_requests = self.take_read_into_requests();

        // For each readIntoRequest of readIntoRequests,
        for read_into_request in read_into_requests {
            // Perform readIntoRequest’s error steps, given e.
            read_into_request.error_steps(e.clone());
        }
    }

    pub(crate) fn stream(&self) -> Option<ReadableStream> {
        self.0.borrow().generic.stream.clone()
    }

    pub(crate) fn ctx(&self) -> Ctx {
        self.0.borrow().generic.ctx.clone()
    }

    pub(crate) fn ptr_eq(&self, other: &ReadableStreamBYOBReader) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn take_read_into_requests(
        &self,
    ) -> VecDeque<Box<dyn ReadableStreamReadIntoRequest>> {
        std::mem::take(&mut self.0.borrow_mut().read_into_requests)
    }

    pub(crate) fn push_read_into_request(
        &self,
        read_into_request: Box<dyn ReadableStreamReadIntoRequest>,
    ) {
        self.0
            .borrow_mut()
            .read_into_requests
            .push_back(read_into_request)
    }

    pub(crate) fn pop_read_into_request(&self) -> Option<Box<dyn ReadableStreamReadIntoRequest>> {
        self.0.borrow_mut().read_into_requests.pop_front()
    }

    pub(crate) fn num_read_into_requests(&self) -> usize {
        self.0.borrow().read_into_requests.len()
    }
}

#[cfg(test)]
mod tests {
    use brook_test::test_async_with;
    use brook_utils::{ArrayBuffer, ViewKind};

    use super::*;
    use crate::{
        queuing_strategy::QueuingStrategy,
        readable::{UnderlyingByteSource, UnderlyingSource},
    };

    fn byte_stream(ctx: &Ctx) -> ReadableStream {
        ReadableStream::new_bytes(ctx, UnderlyingByteSource::new(), QueuingStrategy::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_validation() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = byte_stream(&ctx);
                let reader = stream.get_byob_reader().unwrap();

                let empty = ArrayBufferView::with_length(ViewKind::Uint8, 0);
                let err = Error::from(ctx.settle(&reader.read(empty)).await.unwrap_err());
                assert!(err.is_validation());

                let buffer = ArrayBuffer::new(4);
                let view = ArrayBufferView::new(ViewKind::Uint8, buffer.clone(), 0, 4).unwrap();
                buffer.transfer().unwrap();
                let err = Error::from(ctx.settle(&reader.read(view)).await.unwrap_err());
                assert!(err.is_buffer_ownership());

                let view = ArrayBufferView::with_length(ViewKind::Uint16, 2);
                let err = Error::from(
                    ctx.settle(&reader.read_with_min(view.clone(), 0))
                        .await
                        .unwrap_err(),
                );
                assert!(err.is_validation());
                let err = Error::from(
                    ctx.settle(&reader.read_with_min(view.clone(), 3))
                        .await
                        .unwrap_err(),
                );
                assert!(err.is_validation());

                // None of the rejected reads took ownership of the buffer.
                assert!(!view.buffer().is_detached());
                assert!(!stream.0.borrow().disturbed);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_requires_byte_stream() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream =
                    ReadableStream::new(&ctx, UnderlyingSource::new(), QueuingStrategy::default())
                        .unwrap();
                assert!(stream.get_byob_reader().unwrap_err().is_validation());

                let bytes = byte_stream(&ctx);
                let _reader = bytes.get_byob_reader().unwrap();
                assert!(bytes.get_byob_reader().unwrap_err().is_state());
                assert!(bytes.get_reader().unwrap_err().is_state());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_read_on_closed_stream_returns_empty_view() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = byte_stream(&ctx);
                ctx.settle(&stream.cancel(Value::Undefined)).await.unwrap();
                let reader = stream.get_byob_reader().unwrap();

                let view = ArrayBufferView::with_length(ViewKind::Uint32, 2);
                let result = ctx.settle(&reader.read(view.clone())).await.unwrap();
                assert!(result.done);
                let value = result.value.unwrap();
                assert_eq!(value.kind(), ViewKind::Uint32);
                assert_eq!(value.byte_length(), 0);
                assert_eq!(value.buffer().byte_length(), 8);
                assert!(view.buffer().is_detached());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_release_errors_pending_reads() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = byte_stream(&ctx);
                let reader = stream.get_byob_reader().unwrap();
                let pending = reader.read(ArrayBufferView::with_length(ViewKind::Uint8, 4));

                reader.release_lock();

                let err = Error::from(ctx.settle(&pending).await.unwrap_err());
                assert!(err.is_state());
                assert!(!stream.locked());
            })
        })
        .await;
    }
}

impl std::fmt::Debug for ReadableStreamBYOBReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadableStreamBYOBReader").finish_non_exhaustive()
    }
}
