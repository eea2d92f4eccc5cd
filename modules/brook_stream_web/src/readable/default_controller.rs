use std::{cell::RefCell, fmt, rc::Rc};

use brook_utils::{Ctx, Promise, Result, Value};
use tracing::trace;

use super::{
    CancelAlgorithm, PullAlgorithm, ReadableStream, ReadableStreamReadRequest,
    ReadableStreamWeak, StartAlgorithm,
};
use crate::{
    queuing_strategy::SizeAlgorithm,
    readable::ReadableStreamState,
    utils::{queue::QueueWithSizes, OperationState},
};

/// Lets a [`crate::readable::UnderlyingSource`] feed chunks into its stream.
#[derive(Clone)]
pub struct ReadableStreamDefaultController(Rc<RefCell<ReadableStreamDefaultControllerInner>>);

struct ReadableStreamDefaultControllerInner {
    cancel_algorithm: Option<CancelAlgorithm>,
    close_requested: bool,
    pull_state: OperationState,
    pull_algorithm: Option<PullAlgorithm<ReadableStreamDefaultController>>,
    queue: QueueWithSizes<Value>,
    started: bool,
    strategy_hwm: f64,
    strategy_size_algorithm: Option<SizeAlgorithm>,
    stream: ReadableStreamWeak,
    ctx: Ctx,
}

impl ReadableStreamDefaultController {
    pub(super) fn new(
        ctx: &Ctx,
        pull_algorithm: PullAlgorithm<Self>,
        cancel_algorithm: CancelAlgorithm,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm,
    ) -> Self {
        Self(Rc::new(RefCell::new(ReadableStreamDefaultControllerInner {
            // Perform ! ResetQueue(controller).
            queue: QueueWithSizes::new(),
            // Set controller.[[started]], controller.[[closeRequested]], controller.[[pullAgain]], and controller.[[pulling]] to false.
            started: false,
            close_requested: false,
            pull_state: OperationState::Idle,
            // Set controller.[[strategySizeAlgorithm]] to sizeAlgorithm and controller.[[strategyHWM]] to highWaterMark.
            strategy_size_algorithm: Some(size_algorithm),
            strategy_hwm: high_water_mark,
            // Set controller.[[pullAlgorithm]] to pullAlgorithm.
            pull_algorithm: Some(pull_algorithm),
            // Set controller.[[cancelAlgorithm]] to cancelAlgorithm.
            cancel_algorithm: Some(cancel_algorithm),
            stream: ReadableStreamWeak::new(),
            ctx: ctx.clone(),
        })))
    }

    pub(super) fn set_up(
        &self,
        stream: &ReadableStream,
        start_algorithm: StartAlgorithm<Self>,
    ) -> Result<()> {
        // Set controller.[[stream]] to stream.
        self.0.borrow_mut().stream = stream.downgrade();

        let ctx = self.ctx();

        // Let startResult be the result of performing startAlgorithm. (This might throw an exception.)
        let start_result = start_algorithm.call(&ctx, self.clone())?;

        // Let startPromise be a promise resolved with startResult.
        // Upon fulfillment of startPromise,
        // Upon rejection of startPromise with reason r,
        let controller = self.clone();
        start_result.react(move |result| match result {
            Ok(()) => {
                // Set controller.[[started]] to true.
                controller.0.borrow_mut().started = true;
                // Perform ! ReadableStreamDefaultControllerCallPullIfNeeded(controller).
                controller.readable_stream_default_controller_call_pull_if_needed();
            },
            // Perform ! ReadableStreamDefaultControllerError(controller, r).
            Err(r) => controller.readable_stream_default_controller_error(r),
        });

        Ok(())
    }

    /// `None` once the stream has errored, `Some(0.0)` once it is closed.
    pub fn desired_size(&self) -> Option<f64> {
        self.readable_stream_default_controller_get_desired_size()
    }

    /// Requests the stream close once the queued chunks are read. Does nothing if the stream
    /// is already closing or no longer readable.
    pub fn close(&self) -> Result<()> {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(this) is false, return.
        if !self.readable_stream_default_controller_can_close_or_enqueue() {
            return Ok(());
        }

        // Perform ! ReadableStreamDefaultControllerClose(this).
        self.readable_stream_default_controller_close();
        Ok(())
    }

    /// Queues `chunk`, or hands it straight to a waiting read. An error from the size
    /// function errors the stream and is returned here as well.
    pub fn enqueue(&self, chunk: impl Into<Value>) -> Result<()> {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(this) is false, return.
        if !self.readable_stream_default_controller_can_close_or_enqueue() {
            return Ok(());
        }

        // Perform ? ReadableStreamDefaultControllerEnqueue(this, chunk).
        self.readable_stream_default_controller_enqueue(chunk.into())
    }

    pub fn error(&self, e: impl Into<Value>) {
        // Perform ! ReadableStreamDefaultControllerError(this, e).
        self.readable_stream_default_controller_error(e.into())
    }

    fn ctx(&self) -> Ctx {
        self.0.borrow().ctx.clone()
    }

    fn stream(&self) -> Option<ReadableStream> {
        self.0.borrow().stream.upgrade().map(ReadableStream)
    }

    pub(crate) fn readable_stream_default_controller_call_pull_if_needed(&self) {
        // Let shouldPull be ! ReadableStreamDefaultControllerShouldCallPull(controller).
        // If shouldPull is false, return.
        if !self.readable_stream_default_controller_should_call_pull() {
            return;
        }

        let pull_algorithm = {
            let mut inner = self.0.borrow_mut();
            // If controller.[[pulling]] is true,
            // Set controller.[[pullAgain]] to true.
            // Return.
            if !inner.pull_state.begin() {
                trace!("Pull already in flight, coalescing");
                return;
            }
            // Set controller.[[pulling]] to true.
            inner.pull_algorithm.clone()
        };

        let Some(pull_algorithm) = pull_algorithm else {
            self.0.borrow_mut().pull_state.finish();
            return;
        };

        trace!("Pulling from underlying source");

        // Let pullPromise be the result of performing controller.[[pullAlgorithm]].
        let pull_promise = pull_algorithm.call(&self.ctx(), self.clone());

        let controller = self.clone();
        pull_promise.react(move |result| match result {
            // Upon fulfillment of pullPromise,
            Ok(()) => {
                // Set controller.[[pulling]] to false.
                // If controller.[[pullAgain]] is true,
                let pull_again = controller.0.borrow_mut().pull_state.finish();
                if pull_again {
                    // Set controller.[[pullAgain]] to false.
                    // Perform ! ReadableStreamDefaultControllerCallPullIfNeeded(controller).
                    controller.readable_stream_default_controller_call_pull_if_needed();
                }
            },
            // Upon rejection of pullPromise with reason e,
            // Perform ! ReadableStreamDefaultControllerError(controller, e).
            Err(e) => controller.readable_stream_default_controller_error(e),
        });
    }

    fn readable_stream_default_controller_should_call_pull(&self) -> bool {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return false;
        };

        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(controller) is false, return false.
        if !self.readable_stream_default_controller_can_close_or_enqueue() {
            return false;
        }

        // If controller.[[started]] is false, return false.
        if !self.0.borrow().started {
            return false;
        }

        // If ! IsReadableStreamLocked(stream) is true and ! ReadableStreamGetNumReadRequests(stream) > 0, return true.
        if stream.is_readable_stream_locked() && stream.readable_stream_get_num_read_requests() > 0
        {
            return true;
        }

        // Let desiredSize be ! ReadableStreamDefaultControllerGetDesiredSize(controller).
        let desired_size = self.readable_stream_default_controller_get_desired_size();

        // If desiredSize > 0, return true.
        // Return false.
        desired_size.is_some_and(|desired_size| desired_size > 0.0)
    }

    fn readable_stream_default_controller_clear_algorithms(&self) {
        let mut inner = self.0.borrow_mut();
        // Set controller.[[pullAlgorithm]] to undefined.
        inner.pull_algorithm = None;
        // Set controller.[[cancelAlgorithm]] to undefined.
        inner.cancel_algorithm = None;
        // Set controller.[[strategySizeAlgorithm]] to undefined.
        inner.strategy_size_algorithm = None;
    }

    pub(crate) fn readable_stream_default_controller_close(&self) {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(controller) is false, return.
        if !self.readable_stream_default_controller_can_close_or_enqueue() {
            return;
        }

        let queue_empty = {
            let mut inner = self.0.borrow_mut();
            // Set controller.[[closeRequested]] to true.
            inner.close_requested = true;
            inner.queue.is_empty()
        };

        // If controller.[[queue]] is empty,
        if queue_empty {
            // Perform ! ReadableStreamDefaultControllerClearAlgorithms(controller).
            self.readable_stream_default_controller_clear_algorithms();
            // Perform ! ReadableStreamClose(stream).
            if let Some(stream) = self.stream() {
                stream.readable_stream_close();
            }
        }
    }

    pub(crate) fn readable_stream_default_controller_enqueue(&self, chunk: Value) -> Result<()> {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(controller) is false, return.
        if !self.readable_stream_default_controller_can_close_or_enqueue() {
            return Ok(());
        }

        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return Ok(());
        };

        // If ! IsReadableStreamLocked(stream) is true and ! ReadableStreamGetNumReadRequests(stream) > 0, perform ! ReadableStreamFulfillReadRequest(stream, chunk, false).
        if stream.is_readable_stream_locked() && stream.readable_stream_get_num_read_requests() > 0
        {
            stream.readable_stream_fulfill_read_request(chunk, false);
        } else {
            // Let result be the result of performing controller.[[strategySizeAlgorithm]], passing in chunk, and interpreting the result as a completion record.
            let size_algorithm = self.0.borrow().strategy_size_algorithm.clone();
            let result = match size_algorithm {
                Some(size_algorithm) => size_algorithm.call(&chunk),
                None => Ok(1.0),
            };

            // If result is an abrupt completion,
            // Perform ! ReadableStreamDefaultControllerError(controller, result.[[Value]]).
            // Return result.
            let chunk_size = match result {
                Ok(chunk_size) => chunk_size,
                Err(err) => {
                    self.readable_stream_default_controller_error(err.clone().into());
                    return Err(err);
                },
            };

            // Let enqueueResult be EnqueueValueWithSize(controller, chunk, chunkSize).
            let enqueue_result = self
                .0
                .borrow_mut()
                .queue
                .enqueue_value_with_size(chunk, chunk_size);

            // If enqueueResult is an abrupt completion,
            if let Err(err) = enqueue_result {
                // Perform ! ReadableStreamDefaultControllerError(controller, enqueueResult.[[Value]]).
                self.readable_stream_default_controller_error(err.clone().into());
                // Return enqueueResult.
                return Err(err);
            }
        }

        // Perform ! ReadableStreamDefaultControllerCallPullIfNeeded(controller).
        self.readable_stream_default_controller_call_pull_if_needed();
        Ok(())
    }

    pub(crate) fn readable_stream_default_controller_error(&self, e: Value) {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // If stream.[[state]] is not "readable", return.
        if !stream.is_readable() {
            return;
        }

        // Perform ! ResetQueue(controller).
        self.0.borrow_mut().queue.reset_queue();

        // Perform ! ReadableStreamDefaultControllerClearAlgorithms(controller).
        self.readable_stream_default_controller_clear_algorithms();

        // Perform ! ReadableStreamError(stream, e).
        stream.readable_stream_error(e);
    }

    pub(crate) fn readable_stream_default_controller_get_desired_size(&self) -> Option<f64> {
        let state = self.stream()?.state();

        match state {
            // If state is "errored", return null.
            ReadableStreamState::Errored(_) => None,
            // If state is "closed", return 0.
            ReadableStreamState::Closed => Some(0.0),
            // Return controller.[[strategyHWM]] − controller.[[queueTotalSize]].
            ReadableStreamState::Readable => {
                let inner = self.0.borrow();
                Some(inner.strategy_hwm - inner.queue.queue_total_size)
            },
        }
    }

    // The return value of this is also used by TransformStream to decide backpressure.
    pub(crate) fn readable_stream_default_controller_has_backpressure(&self) -> bool {
        // If ! ReadableStreamDefaultControllerShouldCallPull(controller) is true, return false.
        // Otherwise, return true.
        !self.readable_stream_default_controller_should_call_pull()
    }

    pub(crate) fn readable_stream_default_controller_can_close_or_enqueue(&self) -> bool {
        // Let state be controller.[[stream]].[[state]].
        let Some(stream) = self.stream() else {
            return false;
        };

        // If controller.[[closeRequested]] is false and state is "readable", return true.
        // Otherwise, return false.
        !self.0.borrow().close_requested && stream.is_readable()
    }

    pub(super) fn pull_steps(&self, read_request: Box<dyn ReadableStreamReadRequest>) {
        // Let stream be this.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // If this.[[queue]] is not empty,
        let (chunk, close_now) = {
            let mut inner = self.0.borrow_mut();
            // Let chunk be ! DequeueValue(this).
            let chunk = inner.queue.dequeue_value();
            let close_now = inner.close_requested && inner.queue.is_empty();
            (chunk, close_now)
        };

        match chunk {
            Some(chunk) => {
                // If this.[[closeRequested]] is true and this.[[queue]] is empty,
                if close_now {
                    // Perform ! ReadableStreamDefaultControllerClearAlgorithms(this).
                    self.readable_stream_default_controller_clear_algorithms();
                    // Perform ! ReadableStreamClose(stream).
                    stream.readable_stream_close();
                } else {
                    // Otherwise, perform ! ReadableStreamDefaultControllerCallPullIfNeeded(this).
                    self.readable_stream_default_controller_call_pull_if_needed();
                }

                // Perform readRequest’s chunk steps, given chunk.
                read_request.chunk_steps(chunk);
            },
            // Otherwise,
            None => {
                // Perform ! ReadableStreamAddReadRequest(stream, readRequest).
                stream.readable_stream_add_read_request(read_request);
                // Perform ! ReadableStreamDefaultControllerCallPullIfNeeded(this).
                self.readable_stream_default_controller_call_pull_if_needed();
            },
        }
    }

    pub(super) fn cancel_steps(&self, reason: Value) -> Promise<()> {
        let cancel_algorithm = {
            let mut inner = self.0.borrow_mut();
            // Perform ! ResetQueue(this).
            inner.queue.reset_queue();
            // Let result be the result of performing this.[[cancelAlgorithm]], passing reason.
            inner.cancel_algorithm.clone()
        };

        // Perform ! ReadableStreamDefaultControllerClearAlgorithms(this).
        self.readable_stream_default_controller_clear_algorithms();

        // Return result.
        cancel_algorithm
            .unwrap_or(CancelAlgorithm::ReturnPromiseUndefined)
            .call(&self.ctx(), reason)
    }

    pub(super) fn release_steps(&self) {}

    #[cfg(test)]
    pub(crate) fn queue_total_size(&self) -> f64 {
        self.0.borrow().queue.queue_total_size
    }
}

impl fmt::Debug for ReadableStreamDefaultController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("ReadableStreamDefaultController")
            .field("queue_total_size", &inner.queue.queue_total_size)
            .field("close_requested", &inner.close_requested)
            .field("started", &inner.started)
            .field("pull_state", &inner.pull_state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use brook_test::test_async_with;
    use brook_utils::{Error, ResolveablePromise};

    use super::*;
    use crate::{
        queuing_strategy::QueuingStrategy,
        readable::{ReadableStreamReadResult, UnderlyingSource},
    };

    fn capture(
        ctx: &Ctx,
        slot: &Rc<RefCell<Option<ReadableStreamDefaultController>>>,
    ) -> impl Fn(ReadableStreamDefaultController) -> Result<Promise<()>> + 'static {
        let ctx = ctx.clone();
        let slot = slot.clone();
        move |controller| {
            slot.replace(Some(controller));
            Ok(Promise::resolved(&ctx, ()))
        }
    }

    #[tokio::test]
    async fn test_desired_size_tracks_queue() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let slot = Rc::new(RefCell::new(None));
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_start(capture(&ctx, &slot)),
                    QueuingStrategy::new()
                        .with_high_water_mark(10.0)
                        .with_size(|chunk| Ok(chunk.as_str().map_or(1, str::len) as f64)),
                )
                .unwrap();
                let controller = slot.borrow().clone().unwrap();

                assert_eq!(controller.desired_size(), Some(10.0));
                controller.enqueue("abc").unwrap();
                assert_eq!(controller.desired_size(), Some(7.0));
                controller.enqueue("defg").unwrap();
                assert_eq!(controller.desired_size(), Some(3.0));
                assert_eq!(controller.queue_total_size(), 7.0);

                let reader = stream.get_reader().unwrap();
                ctx.settle(&reader.read()).await.unwrap();
                assert_eq!(controller.desired_size(), Some(6.0));
                ctx.settle(&reader.read()).await.unwrap();
                assert_eq!(controller.desired_size(), Some(10.0));
                assert_eq!(controller.queue_total_size(), 0.0);

                controller.close().unwrap();
                assert_eq!(controller.desired_size(), Some(0.0));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_pull_is_coalesced() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let pulls = Rc::new(Cell::new(0));
                let pending = Rc::new(RefCell::new(None::<ResolveablePromise>));
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_pull({
                        let ctx = ctx.clone();
                        let pulls = pulls.clone();
                        let pending = pending.clone();
                        move |controller: ReadableStreamDefaultController| {
                            pulls.set(pulls.get() + 1);
                            controller.enqueue(pulls.get() as f64)?;
                            let promise = ResolveablePromise::new(&ctx);
                            pending.replace(Some(promise.clone()));
                            Ok(promise.promise)
                        }
                    }),
                    QueuingStrategy::new().with_high_water_mark(0.0),
                )
                .unwrap();

                let reader = stream.get_reader().unwrap();
                let first = reader.read();
                let second = reader.read();
                let third = reader.read();
                ctx.execute_pending_jobs();

                // The first pull answered the first read and is still pending.
                assert_eq!(pulls.get(), 1);
                assert_eq!(
                    ctx.settle(&first).await.unwrap(),
                    ReadableStreamReadResult::chunk(1.0.into())
                );

                pending.borrow().clone().unwrap().resolve_undefined();
                ctx.execute_pending_jobs();
                assert_eq!(pulls.get(), 2);
                assert_eq!(
                    ctx.settle(&second).await.unwrap(),
                    ReadableStreamReadResult::chunk(2.0.into())
                );

                pending.borrow().clone().unwrap().resolve_undefined();
                assert_eq!(
                    ctx.settle(&third).await.unwrap(),
                    ReadableStreamReadResult::chunk(3.0.into())
                );
                pending.borrow().clone().unwrap().resolve_undefined();
                ctx.execute_pending_jobs();
                assert_eq!(pulls.get(), 3);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_pull_only_when_desired() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let pulls = Rc::new(Cell::new(0));
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_pull({
                        let ctx = ctx.clone();
                        let pulls = pulls.clone();
                        move |controller: ReadableStreamDefaultController| {
                            pulls.set(pulls.get() + 1);
                            controller.enqueue("chunk")?;
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::new().with_high_water_mark(2.0),
                )
                .unwrap();
                ctx.execute_pending_jobs();
                // Filled up to the high water mark and stopped.
                assert_eq!(pulls.get(), 2);

                let reader = stream.get_reader().unwrap();
                ctx.settle(&reader.read()).await.unwrap();
                ctx.execute_pending_jobs();
                assert_eq!(pulls.get(), 3);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_size_error_errors_stream() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let slot = Rc::new(RefCell::new(None));
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_start(capture(&ctx, &slot)),
                    QueuingStrategy::new().with_size(|_| Err(Error::thrown("bad size"))),
                )
                .unwrap();
                let controller = slot.borrow().clone().unwrap();

                let err = controller.enqueue("x").unwrap_err();
                assert_eq!(err, Error::thrown("bad size"));
                assert_eq!(
                    stream.state(),
                    ReadableStreamState::Errored("bad size".into())
                );
                assert_eq!(controller.desired_size(), None);

                let reader = stream.get_reader().unwrap();
                let reason = ctx.settle(&reader.closed()).await.unwrap_err();
                assert_eq!(reason, Value::from("bad size"));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_invalid_size_errors_stream() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let slot = Rc::new(RefCell::new(None));
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_start(capture(&ctx, &slot)),
                    QueuingStrategy::new().with_size(|_| Ok(f64::NAN)),
                )
                .unwrap();
                let controller = slot.borrow().clone().unwrap();

                assert!(controller.enqueue("x").unwrap_err().is_validation());
                assert!(matches!(stream.state(), ReadableStreamState::Errored(_)));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_error_fails_pending_reads() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let slot = Rc::new(RefCell::new(None));
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_start(capture(&ctx, &slot)),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let controller = slot.borrow().clone().unwrap();
                let reader = stream.get_reader().unwrap();
                let first = reader.read();
                let second = reader.read();

                controller.error("broken");
                controller.error("ignored");

                assert_eq!(ctx.settle(&first).await.unwrap_err(), Value::from("broken"));
                assert_eq!(ctx.settle(&second).await.unwrap_err(), Value::from("broken"));
                assert_eq!(
                    ctx.settle(&reader.read()).await.unwrap_err(),
                    Value::from("broken")
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_enqueue_fulfils_waiting_read_directly() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let slot = Rc::new(RefCell::new(None));
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_start(capture(&ctx, &slot)),
                    QueuingStrategy::new().with_high_water_mark(0.0),
                )
                .unwrap();
                let controller = slot.borrow().clone().unwrap();
                let reader = stream.get_reader().unwrap();
                let read = reader.read();

                controller.enqueue("direct").unwrap();
                assert_eq!(controller.queue_total_size(), 0.0);
                assert_eq!(
                    ctx.settle(&read).await.unwrap(),
                    ReadableStreamReadResult::chunk("direct".into())
                );
            })
        })
        .await;
    }
}
