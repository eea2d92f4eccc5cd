use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use brook_utils::{
    promise::{promise_rejected_with, upon_promise_fulfilment},
    ArrayBufferView, Ctx, Error, Promise, Result, Value,
};
use tracing::debug;

use super::{
    ReadableByteStreamController, ReadableStreamBYOBReader, ReadableStreamController,
    ReadableStreamDefaultController, ReadableStreamDefaultReader, ReadableStreamReadIntoRequest,
    ReadableStreamReadRequest, ReadableStreamReader,
};
use crate::queuing_strategy::{QueuingStrategy, SizeAlgorithm};

use algorithms::{CancelAlgorithm, PullAlgorithm, StartAlgorithm};
pub use source::{UnderlyingByteSource, UnderlyingSource};

pub(crate) mod algorithms;
mod source;
mod tee;

pub(crate) type ReadableStreamWeak = Weak<RefCell<ReadableStreamInner>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ReadableStreamState {
    Readable,
    Closed,
    Errored(Value),
}

pub(crate) struct ReadableStreamInner {
    pub(crate) controller: ReadableStreamController,
    pub(crate) disturbed: bool,
    pub(crate) state: ReadableStreamState,
    pub(crate) reader: Option<ReadableStreamReader>,
    pub(crate) ctx: Ctx,
}

/// A source of chunks that is consumed through a single reader at a time.
#[derive(Clone)]
pub struct ReadableStream(pub(crate) Rc<RefCell<ReadableStreamInner>>);

impl ReadableStream {
    // Streams Spec: 4.2.4: https://streams.spec.whatwg.org/#rs-prototype
    // constructor(optional object underlyingSource, optional QueuingStrategy strategy = {});
    pub fn new(
        ctx: &Ctx,
        underlying_source: UnderlyingSource,
        queuing_strategy: QueuingStrategy,
    ) -> Result<Self> {
        // Let sizeAlgorithm be ! ExtractSizeAlgorithm(strategy).
        let size_algorithm = queuing_strategy.extract_size_algorithm();

        // Let highWaterMark be ? ExtractHighWaterMark(strategy, 1).
        let high_water_mark = queuing_strategy.extract_high_water_mark(1.0)?;

        let (start_algorithm, pull_algorithm, cancel_algorithm) =
            underlying_source.into_algorithms();

        // Perform ? SetUpReadableStreamDefaultControllerFromUnderlyingSource(this, underlyingSource, underlyingSourceDict, highWaterMark, sizeAlgorithm).
        Self::create_readable_stream(
            ctx,
            start_algorithm,
            pull_algorithm,
            cancel_algorithm,
            high_water_mark,
            size_algorithm,
        )
    }

    /// Creates a byte stream, the only kind of stream that can hand out BYOB readers.
    pub fn new_bytes(
        ctx: &Ctx,
        underlying_source: UnderlyingByteSource,
        queuing_strategy: QueuingStrategy,
    ) -> Result<Self> {
        // If strategy["size"] exists, throw a RangeError exception.
        if queuing_strategy.has_size() {
            return Err(Error::validation(
                "The strategy for a byte stream cannot have a size function",
            ));
        }

        // Let highWaterMark be ? ExtractHighWaterMark(strategy, 0).
        let high_water_mark = queuing_strategy.extract_high_water_mark(0.0)?;

        // Let autoAllocateChunkSize be underlyingSourceDict["autoAllocateChunkSize"], if it exists, or undefined otherwise.
        let auto_allocate_chunk_size = underlying_source.auto_allocate_chunk_size;

        // If autoAllocateChunkSize is 0, then throw a TypeError exception.
        if auto_allocate_chunk_size == Some(0) {
            return Err(Error::validation(
                "autoAllocateChunkSize must be greater than 0",
            ));
        }

        let (start_algorithm, pull_algorithm, cancel_algorithm) =
            underlying_source.into_algorithms();

        Self::create_readable_byte_stream(
            ctx,
            start_algorithm,
            pull_algorithm,
            cancel_algorithm,
            high_water_mark,
            auto_allocate_chunk_size,
        )
    }

    /// Builds a stream that yields the items of `iter` one pull at a time and closes when it
    /// runs out. Cancelling the stream drops the iterator.
    pub fn from_iter<I>(ctx: &Ctx, iter: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
        I::IntoIter: 'static,
    {
        let iterator = Rc::new(RefCell::new(Some(iter.into_iter())));

        let pull_algorithm = PullAlgorithm::from_fn({
            let ctx = ctx.clone();
            let iterator = iterator.clone();
            move |controller: ReadableStreamDefaultController| {
                // Let nextResult be IteratorNext(iteratorRecord).
                let next = iterator.borrow_mut().as_mut().and_then(Iterator::next);
                match next {
                    // If done is true:
                    // Perform ! ReadableStreamDefaultControllerClose(stream.[[controller]]).
                    None => controller.close()?,
                    // Perform ! ReadableStreamDefaultControllerEnqueue(stream.[[controller]], value).
                    Some(value) => controller.enqueue(value)?,
                }
                Ok(Promise::resolved(&ctx, ()))
            }
        });

        let cancel_algorithm = CancelAlgorithm::from_fn({
            let ctx = ctx.clone();
            move |_reason| {
                iterator.borrow_mut().take();
                Ok(Promise::resolved(&ctx, ()))
            }
        });

        // Set stream to ! CreateReadableStream(startAlgorithm, pullAlgorithm, cancelAlgorithm, 0).
        Self::create_readable_stream(
            ctx,
            StartAlgorithm::ReturnUndefined,
            pull_algorithm,
            cancel_algorithm,
            0.0,
            SizeAlgorithm::AlwaysOne,
        )
    }

    pub fn locked(&self) -> bool {
        // Return ! IsReadableStreamLocked(this).
        self.is_readable_stream_locked()
    }

    pub fn state(&self) -> ReadableStreamState {
        self.0.borrow().state.clone()
    }

    pub fn cancel(&self, reason: impl Into<Value>) -> Promise<()> {
        // If ! IsReadableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_readable_stream_locked() {
            return promise_rejected_with(
                &self.ctx(),
                Error::state("Cannot cancel a stream that already has a reader"),
            );
        }

        // Return ! ReadableStreamCancel(this, reason).
        self.readable_stream_cancel(reason.into())
    }

    pub fn get_reader(&self) -> Result<ReadableStreamDefaultReader> {
        // If options["mode"] does not exist, return ? AcquireReadableStreamDefaultReader(this).
        ReadableStreamDefaultReader::new(self)
    }

    pub fn get_byob_reader(&self) -> Result<ReadableStreamBYOBReader> {
        // Return ? AcquireReadableStreamBYOBReader(this).
        ReadableStreamBYOBReader::new(self)
    }

    pub(crate) fn create_readable_stream(
        ctx: &Ctx,
        start_algorithm: StartAlgorithm<ReadableStreamDefaultController>,
        pull_algorithm: PullAlgorithm<ReadableStreamDefaultController>,
        cancel_algorithm: CancelAlgorithm,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm,
    ) -> Result<Self> {
        // Let controller be a new ReadableStreamDefaultController.
        let controller = ReadableStreamDefaultController::new(
            ctx,
            pull_algorithm,
            cancel_algorithm,
            high_water_mark,
            size_algorithm,
        );

        // Perform ! InitializeReadableStream(stream).
        let stream = Self::initialize(
            ctx,
            ReadableStreamController::Default(controller.clone()),
        );

        // Perform ? SetUpReadableStreamDefaultController(stream, controller, startAlgorithm, pullAlgorithm, cancelAlgorithm, highWaterMark, sizeAlgorithm).
        controller.set_up(&stream, start_algorithm)?;

        Ok(stream)
    }

    pub(crate) fn create_readable_byte_stream(
        ctx: &Ctx,
        start_algorithm: StartAlgorithm<ReadableByteStreamController>,
        pull_algorithm: PullAlgorithm<ReadableByteStreamController>,
        cancel_algorithm: CancelAlgorithm,
        high_water_mark: f64,
        auto_allocate_chunk_size: Option<usize>,
    ) -> Result<Self> {
        // Let controller be a new ReadableByteStreamController.
        let controller = ReadableByteStreamController::new(
            ctx,
            pull_algorithm,
            cancel_algorithm,
            high_water_mark,
            auto_allocate_chunk_size,
        );

        // Perform ! InitializeReadableStream(stream).
        let stream = Self::initialize(ctx, ReadableStreamController::Byte(controller.clone()));

        // Perform ? SetUpReadableByteStreamController(stream, controller, startAlgorithm, pullAlgorithm, cancelAlgorithm, highWaterMark, autoAllocateChunkSize).
        controller.set_up(&stream, start_algorithm)?;

        Ok(stream)
    }

    fn initialize(ctx: &Ctx, controller: ReadableStreamController) -> Self {
        Self(Rc::new(RefCell::new(ReadableStreamInner {
            controller,
            // Set stream.[[state]] to "readable".
            state: ReadableStreamState::Readable,
            // Set stream.[[reader]] and stream.[[storedError]] to undefined.
            reader: None,
            // Set stream.[[disturbed]] to false.
            disturbed: false,
            ctx: ctx.clone(),
        })))
    }

    pub(crate) fn ctx(&self) -> Ctx {
        self.0.borrow().ctx.clone()
    }

    pub(crate) fn controller(&self) -> ReadableStreamController {
        self.0.borrow().controller.clone()
    }

    pub(crate) fn reader(&self) -> Option<ReadableStreamReader> {
        self.0.borrow().reader.clone()
    }

    pub(crate) fn downgrade(&self) -> ReadableStreamWeak {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn ptr_eq(&self, other: &ReadableStream) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn is_readable(&self) -> bool {
        matches!(self.0.borrow().state, ReadableStreamState::Readable)
    }

    pub(crate) fn stored_error(&self) -> Option<Value> {
        match &self.0.borrow().state {
            ReadableStreamState::Errored(stored_error) => Some(stored_error.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_readable_stream_locked(&self) -> bool {
        // If stream.[[reader]] is undefined, return false.
        // Return true.
        self.0.borrow().reader.is_some()
    }

    pub(crate) fn readable_stream_cancel(&self, reason: Value) -> Promise<()> {
        let ctx = self.ctx();
        let state = {
            let mut inner = self.0.borrow_mut();
            // Set stream.[[disturbed]] to true.
            inner.disturbed = true;
            inner.state.clone()
        };

        match state {
            // If stream.[[state]] is "closed", return a promise resolved with undefined.
            ReadableStreamState::Closed => return Promise::resolved(&ctx, ()),
            // If stream.[[state]] is "errored", return a promise rejected with stream.[[storedError]].
            ReadableStreamState::Errored(stored_error) => {
                return promise_rejected_with(&ctx, stored_error)
            },
            ReadableStreamState::Readable => {},
        }

        debug!("Cancelling readable stream");

        // Perform ! ReadableStreamClose(stream).
        self.readable_stream_close();

        // Let reader be stream.[[reader]].
        // If reader is not undefined and reader implements ReadableStreamBYOBReader,
        if let Some(ReadableStreamReader::Byob(reader)) = self.reader() {
            // Let readIntoRequests be reader.[[readIntoRequests]].
            // Set reader.[[readIntoRequests]] to an empty list.
            let read_into_requests = reader.take_read_into_requests();
            // For each readIntoRequest of readIntoRequests,
            for read_into_request in read_into_requests {
                // Perform readIntoRequest’s close steps, given undefined.
                read_into_request.close_steps(None);
            }
        }

        // Let sourceCancelPromise be ! stream.[[controller]].[[CancelSteps]](reason).
        let source_cancel_promise = self.controller().cancel_steps(reason);

        // Return the result of reacting to sourceCancelPromise with a fulfillment step that returns undefined.
        upon_promise_fulfilment(&source_cancel_promise, |()| Ok(()))
    }

    pub(crate) fn readable_stream_close(&self) {
        let reader = {
            let mut inner = self.0.borrow_mut();
            // Set stream.[[state]] to "closed".
            inner.state = ReadableStreamState::Closed;
            // Let reader be stream.[[reader]].
            inner.reader.clone()
        };

        debug!("Readable stream closed");

        // If reader is undefined, return.
        let Some(reader) = reader else {
            return;
        };

        // Resolve reader.[[closedPromise]] with undefined.
        reader.resolve_closed_promise();

        // If reader implements ReadableStreamDefaultReader,
        if let ReadableStreamReader::Default(reader) = reader {
            // Let readRequests be reader.[[readRequests]].
            // Set reader.[[readRequests]] to an empty list.
            let read_requests = reader.take_read_requests();
            // For each readRequest of readRequests,
            for read_request in read_requests {
                // Perform readRequest’s close steps.
                read_request.close_steps();
            }
        }
    }

    pub(crate) fn readable_stream_error(&self, e: Value) {
        let reader = {
            let mut inner = self.0.borrow_mut();
            // Set stream.[[state]] to "errored".
            // Set stream.[[storedError]] to e.
            inner.state = ReadableStreamState::Errored(e.clone());
            // Let reader be stream.[[reader]].
            inner.reader.clone()
        };

        debug!("Readable stream errored: {}", e);

        // If reader is undefined, return.
        let Some(reader) = reader else {
            return;
        };

        // Reject reader.[[closedPromise]] with e.
        // Set reader.[[closedPromise]].[[PromiseIsHandled]] to true.
        reader.reject_closed_promise(e.clone());

        match reader {
            // If reader implements ReadableStreamDefaultReader,
            // Perform ! ReadableStreamDefaultReaderErrorReadRequests(reader, e).
            ReadableStreamReader::Default(reader) => {
                reader.readable_stream_default_reader_error_read_requests(e)
            },
            // Otherwise, Perform ! ReadableStreamBYOBReaderErrorReadIntoRequests(reader, e).
            ReadableStreamReader::Byob(reader) => {
                reader.readable_stream_byob_reader_error_read_into_requests(e)
            },
        }
    }

    pub(crate) fn readable_stream_add_read_request(
        &self,
        read_request: Box<dyn ReadableStreamReadRequest>,
    ) {
        // Append readRequest to stream.[[reader]].[[readRequests]].
        match self.reader() {
            Some(ReadableStreamReader::Default(reader)) => reader.push_read_request(read_request),
            _ => read_request.error_steps(Error::state("Stream has no default reader").into()),
        }
    }

    pub(crate) fn readable_stream_add_read_into_request(
        &self,
        read_into_request: Box<dyn ReadableStreamReadIntoRequest>,
    ) {
        // Append readRequest to stream.[[reader]].[[readIntoRequests]].
        match self.reader() {
            Some(ReadableStreamReader::Byob(reader)) => {
                reader.push_read_into_request(read_into_request)
            },
            _ => read_into_request.error_steps(Error::state("Stream has no BYOB reader").into()),
        }
    }

    pub(crate) fn readable_stream_fulfill_read_request(&self, chunk: Value, done: bool) {
        // Let reader be stream.[[reader]].
        let Some(ReadableStreamReader::Default(reader)) = self.reader() else {
            return;
        };

        // Let readRequest be reader.[[readRequests]][0].
        // Remove readRequest from reader.[[readRequests]].
        let Some(read_request) = reader.pop_read_request() else {
            return;
        };

        if done {
            // If done is true, perform readRequest’s close steps.
            read_request.close_steps();
        } else {
            // Otherwise, perform readRequest’s chunk steps, given chunk.
            read_request.chunk_steps(chunk);
        }
    }

    pub(crate) fn readable_stream_fulfill_read_into_request(
        &self,
        chunk: ArrayBufferView,
        done: bool,
    ) {
        // Let reader be stream.[[reader]].
        let Some(ReadableStreamReader::Byob(reader)) = self.reader() else {
            return;
        };

        // Let readIntoRequest be reader.[[readIntoRequests]][0].
        // Remove readIntoRequest from reader.[[readIntoRequests]].
        let Some(read_into_request) = reader.pop_read_into_request() else {
            return;
        };

        if done {
            // If done is true, perform readIntoRequest’s close steps, given chunk.
            read_into_request.close_steps(Some(chunk));
        } else {
            // Otherwise, perform readIntoRequest’s chunk steps, given chunk.
            read_into_request.chunk_steps(chunk);
        }
    }

    pub(crate) fn readable_stream_get_num_read_requests(&self) -> usize {
        match self.reader() {
            Some(ReadableStreamReader::Default(reader)) => reader.num_read_requests(),
            _ => 0,
        }
    }

    pub(crate) fn readable_stream_get_num_read_into_requests(&self) -> usize {
        match self.reader() {
            Some(ReadableStreamReader::Byob(reader)) => reader.num_read_into_requests(),
            _ => 0,
        }
    }

    pub(crate) fn readable_stream_has_default_reader(&self) -> bool {
        matches!(self.reader(), Some(ReadableStreamReader::Default(_)))
    }

    pub(crate) fn readable_stream_has_byob_reader(&self) -> bool {
        matches!(self.reader(), Some(ReadableStreamReader::Byob(_)))
    }
}

impl fmt::Debug for ReadableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("ReadableStream")
            .field("state", &inner.state)
            .field("locked", &inner.reader.is_some())
            .field("disturbed", &inner.disturbed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use brook_test::{test_async_with, test_sync_with};

    use super::*;
    use crate::readable::ReadableStreamReadResult;

    #[tokio::test]
    async fn test_enqueue_close_read() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_start({
                        let ctx = ctx.clone();
                        move |controller: ReadableStreamDefaultController| {
                            controller.enqueue("A")?;
                            controller.enqueue("B")?;
                            controller.close()?;
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let reader = stream.get_reader().unwrap();
                assert_eq!(
                    ctx.settle(&reader.read()).await.unwrap(),
                    ReadableStreamReadResult::chunk("A".into())
                );
                assert_eq!(
                    ctx.settle(&reader.read()).await.unwrap(),
                    ReadableStreamReadResult::chunk("B".into())
                );
                assert_eq!(
                    ctx.settle(&reader.read()).await.unwrap(),
                    ReadableStreamReadResult::done()
                );
                assert_eq!(stream.state(), ReadableStreamState::Closed);
                ctx.settle(&reader.closed()).await.unwrap();
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_close_and_cancel_are_idempotent() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let cancelled = Rc::new(Cell::new(0));
                let controller = Rc::new(RefCell::new(None));
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new()
                        .with_start({
                            let ctx = ctx.clone();
                            let controller = controller.clone();
                            move |c| {
                                controller.replace(Some(c));
                                Ok(Promise::resolved(&ctx, ()))
                            }
                        })
                        .with_cancel({
                            let ctx = ctx.clone();
                            let cancelled = cancelled.clone();
                            move |_| {
                                cancelled.set(cancelled.get() + 1);
                                Ok(Promise::resolved(&ctx, ()))
                            }
                        }),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let controller: ReadableStreamDefaultController =
                    controller.borrow().clone().unwrap();
                controller.close().unwrap();
                controller.close().unwrap();
                controller.enqueue("late").unwrap();

                ctx.settle(&stream.cancel("why")).await.unwrap();
                ctx.settle(&stream.cancel("again")).await.unwrap();
                assert_eq!(cancelled.get(), 0);
                assert_eq!(stream.state(), ReadableStreamState::Closed);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_cancel_runs_source_cancel_once() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let reasons = Rc::new(RefCell::new(Vec::new()));
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_cancel({
                        let ctx = ctx.clone();
                        let reasons = reasons.clone();
                        move |reason| {
                            reasons.borrow_mut().push(reason);
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let reader = stream.get_reader().unwrap();
                let pending = reader.read();
                ctx.settle(&reader.cancel("stop")).await.unwrap();
                assert_eq!(
                    ctx.settle(&pending).await.unwrap(),
                    ReadableStreamReadResult::done()
                );
                ctx.settle(&reader.cancel("again")).await.unwrap();
                assert_eq!(*reasons.borrow(), vec![Value::from("stop")]);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_locking() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream =
                    ReadableStream::new(&ctx, UnderlyingSource::new(), QueuingStrategy::default())
                        .unwrap();
                assert!(!stream.locked());
                let reader = stream.get_reader().unwrap();
                assert!(stream.locked());
                assert!(stream.get_reader().unwrap_err().is_state());

                let cancel = stream.cancel(Value::Undefined);
                let reason = Error::from(ctx.settle(&cancel).await.unwrap_err());
                assert!(reason.is_state());

                reader.release_lock();
                assert!(!stream.locked());
                let reason = Error::from(ctx.settle(&reader.read()).await.unwrap_err());
                assert!(reason.is_state());
                stream.get_reader().unwrap();
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_construction_failures() {
        test_sync_with(|ctx| {
            let failing = ReadableStream::new(
                &ctx,
                UnderlyingSource::new().with_start(|_| Err(Error::thrown("boom"))),
                QueuingStrategy::default(),
            );
            assert_eq!(failing.unwrap_err(), Error::thrown("boom"));

            let invalid_hwm = ReadableStream::new(
                &ctx,
                UnderlyingSource::new(),
                QueuingStrategy::new().with_high_water_mark(-1.0),
            );
            assert!(invalid_hwm.unwrap_err().is_validation());

            let sized_bytes = ReadableStream::new_bytes(
                &ctx,
                UnderlyingByteSource::new(),
                QueuingStrategy::new().with_size(|_| Ok(1.0)),
            );
            assert!(sized_bytes.unwrap_err().is_validation());

            let zero_chunk = ReadableStream::new_bytes(
                &ctx,
                UnderlyingByteSource::new().with_auto_allocate_chunk_size(0),
                QueuingStrategy::default(),
            );
            assert!(zero_chunk.unwrap_err().is_validation());
            Ok(())
        })
        .await;
    }

    #[tokio::test]
    async fn test_start_rejection_errors_stream() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_start({
                        let ctx = ctx.clone();
                        move |_| Ok(Promise::rejected(&ctx, "failed start"))
                    }),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let reader = stream.get_reader().unwrap();
                let reason = ctx.settle(&reader.read()).await.unwrap_err();
                assert_eq!(reason, Value::from("failed start"));
                assert_eq!(
                    stream.state(),
                    ReadableStreamState::Errored("failed start".into())
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_from_iter() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = ReadableStream::from_iter(&ctx, vec![1, 2, 3]).unwrap();
                let reader = stream.get_reader().unwrap();
                let mut values = Vec::new();
                loop {
                    let result = ctx.settle(&reader.read()).await.unwrap();
                    if result.done {
                        break;
                    }
                    values.push(result.value);
                }
                assert_eq!(values, vec![Value::from(1), Value::from(2), Value::from(3)]);
            })
        })
        .await;
    }
}
