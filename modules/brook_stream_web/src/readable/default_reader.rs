use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use brook_utils::{promise::promise_rejected_with, Ctx, Error, Promise, ResolveablePromise, Result, Value};

use super::{
    reader::ReadableStreamGenericReader, ReadableStream, ReadableStreamReadRequest,
    ReadableStreamReadResult, ReadableStreamReader, ReadableStreamState,
};

/// Reads whole chunks from a readable stream.
#[derive(Clone)]
pub struct ReadableStreamDefaultReader(pub(crate) Rc<RefCell<ReadableStreamDefaultReaderInner>>);

pub(crate) struct ReadableStreamDefaultReaderInner {
    pub(crate) generic: ReadableStreamGenericReader,
    read_requests: VecDeque<Box<dyn ReadableStreamReadRequest>>,
}

impl ReadableStreamDefaultReader {
    /// Locks `stream` to a new reader. Fails if the stream is already locked.
    pub fn new(stream: &ReadableStream) -> Result<Self> {
        Self::set_up_readable_stream_default_reader(stream)
    }

    pub fn read(&self) -> Promise<ReadableStreamReadResult> {
        let ctx = self.ctx();

        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        if self.stream().is_none() {
            return promise_rejected_with(
                &ctx,
                Error::state("Cannot read from a stream using a released reader"),
            );
        }

        // Let promise be a new promise.
        let promise = ResolveablePromise::new(&ctx);

        // Let readRequest be a new read request with the following items:
        struct ReadRequest {
            promise: ResolveablePromise<ReadableStreamReadResult>,
        }

        impl ReadableStreamReadRequest for ReadRequest {
            // chunk steps, given chunk
            fn chunk_steps(self: Box<Self>, chunk: Value) {
                // Resolve promise with «[ "value" → chunk, "done" → false ]».
                self.promise.resolve(ReadableStreamReadResult::chunk(chunk))
            }

            // close steps
            fn close_steps(self: Box<Self>) {
                // Resolve promise with «[ "value" → undefined, "done" → true ]».
                self.promise.resolve(ReadableStreamReadResult::done())
            }

            // error steps, given e
            fn error_steps(self: Box<Self>, reason: Value) {
                // Reject promise with e.
                self.promise.reject(reason)
            }
        }

        // Perform ! ReadableStreamDefaultReaderRead(this, readRequest).
        self.readable_stream_default_reader_read(Box::new(ReadRequest {
            promise: promise.clone(),
        }));

        // Return promise.
        promise.promise
    }

    pub fn release_lock(&self) {
        // If this.[[stream]] is undefined, return.
        if self.stream().is_none() {
            return;
        }

        // Perform ! ReadableStreamDefaultReaderRelease(this).
        self.readable_stream_default_reader_release()
    }

    pub fn closed(&self) -> Promise<()> {
        self.0.borrow().generic.closed_promise.promise.clone()
    }

    pub fn cancel(&self, reason: impl Into<Value>) -> Promise<()> {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        // Return ! ReadableStreamReaderGenericCancel(this, reason).
        ReadableStreamGenericReader::readable_stream_reader_generic_cancel(
            &self.clone().into(),
            reason.into(),
        )
    }

    pub(crate) fn set_up_readable_stream_default_reader(stream: &ReadableStream) -> Result<Self> {
        // If ! IsReadableStreamLocked(stream) is true, throw a TypeError exception.
        if stream.is_readable_stream_locked() {
            return Err(Error::state(
                "This stream has already been locked for exclusive reading by another reader",
            ));
        }

        // Perform ! ReadableStreamReaderGenericInitialize(reader, stream).
        let reader = Self(Rc::new(RefCell::new(ReadableStreamDefaultReaderInner {
            generic: ReadableStreamGenericReader::readable_stream_reader_generic_initialize(stream),
            // Set reader.[[readRequests]] to a new empty list.
            read_requests: VecDeque::new(),
        })));

        // Set stream.[[reader]] to reader.
        stream.0.borrow_mut().reader = Some(ReadableStreamReader::Default(reader.clone()));

        Ok(reader)
    }

    pub(crate) fn readable_stream_default_reader_read(
        &self,
        read_request: Box<dyn ReadableStreamReadRequest>,
    ) {
        // Let stream be reader.[[stream]].
        let Some(stream) = self.stream() else {
            read_request.error_steps(
                Error::state("Cannot read from a stream using a released reader").into(),
            );
            return;
        };

        let state = {
            let mut stream = stream.0.borrow_mut();
            // Set stream.[[disturbed]] to true.
            stream.disturbed = true;
            stream.state.clone()
        };

        match state {
            // If stream.[[state]] is "closed", perform readRequest’s close steps.
            ReadableStreamState::Closed => read_request.close_steps(),
            // Otherwise, if stream.[[state]] is "errored", perform readRequest’s error steps given stream.[[storedError]].
            ReadableStreamState::Errored(stored_error) => read_request.error_steps(stored_error),
            // Otherwise,
            // Perform ! stream.[[controller]].[[PullSteps]](readRequest).
            ReadableStreamState::Readable => stream.controller().pull_steps(read_request),
        }
    }

    pub(crate) fn readable_stream_default_reader_release(&self) {
        // Perform ! ReadableStreamReaderGenericRelease(reader).
        ReadableStreamGenericReader::readable_stream_reader_generic_release(&self.clone().into());

        // Let e be a new TypeError exception.
        let e: Value = Error::state("Reader was released").into();

        // Perform ! ReadableStreamDefaultReaderErrorReadRequests(reader, e).
        self.readable_stream_default_reader_error_read_requests(e)
    }

    pub(crate) fn readable_stream_default_reader_error_read_requests(&self, e: Value) {
        // Let readRequests be reader.[[readRequests]].
        // Set reader.[[readRequests]] to a new empty list.
        let read_requests = self.take_read_requests();

        // For each readRequest of readRequests,
        for read_request in read_requests {
            // Perform readRequest’s error steps, given e.
            read_request.error_steps(e.clone());
        }
    }

    pub(crate) fn stream(&self) -> Option<ReadableStream> {
        self.0.borrow().generic.stream.clone()
    }

    pub(crate) fn ctx(&self) -> Ctx {
        self.0.borrow().generic.ctx.clone()
    }

    pub(crate) fn ptr_eq(&self, other: &ReadableStreamDefaultReader) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn take_read_requests(&self) -> VecDeque<Box<dyn ReadableStreamReadRequest>> {
        std::mem::take(&mut self.0.borrow_mut().read_requests)
    }

    pub(crate) fn push_read_request(&self, read_request: Box<dyn ReadableStreamReadRequest>) {
        self.0.borrow_mut().read_requests.push_back(read_request)
    }

    pub(crate) fn pop_read_request(&self) -> Option<Box<dyn ReadableStreamReadRequest>> {
        self.0.borrow_mut().read_requests.pop_front()
    }

    pub(crate) fn num_read_requests(&self) -> usize {
        self.0.borrow().read_requests.len()
    }
}

#[cfg(test)]
mod tests {
    use brook_test::test_async_with;

    use super::*;
    use crate::{queuing_strategy::QueuingStrategy, readable::UnderlyingSource};

    #[tokio::test]
    async fn test_release_fails_pending_reads() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream =
                    ReadableStream::new(&ctx, UnderlyingSource::new(), QueuingStrategy::default())
                        .unwrap();
                let reader = stream.get_reader().unwrap();
                let closed = reader.closed();
                let pending = reader.read();

                reader.release_lock();
                reader.release_lock();

                let reason = Error::from(ctx.settle(&pending).await.unwrap_err());
                assert!(reason.is_state());
                let reason = Error::from(ctx.settle(&closed).await.unwrap_err());
                assert!(reason.is_state());
                assert!(!stream.locked());
                assert_eq!(stream.state(), ReadableStreamState::Readable);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_reader_on_settled_streams() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let closed =
                    ReadableStream::new(&ctx, UnderlyingSource::new(), QueuingStrategy::default())
                        .unwrap();
                ctx.settle(&closed.cancel("done")).await.unwrap();
                let reader = closed.get_reader().unwrap();
                ctx.settle(&reader.closed()).await.unwrap();
                assert!(ctx.settle(&reader.read()).await.unwrap().done);

                // Released after close: the closed promise is replaced by a rejected one.
                reader.release_lock();
                let reason = Error::from(ctx.settle(&reader.closed()).await.unwrap_err());
                assert!(reason.is_state());
            })
        })
        .await;
    }
}

impl std::fmt::Debug for ReadableStreamDefaultReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadableStreamDefaultReader").finish_non_exhaustive()
    }
}
