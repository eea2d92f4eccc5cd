use std::{cell::RefCell, fmt, rc::Rc};

use brook_abort::{AbortController, AbortSignal};
use brook_utils::{Ctx, Promise, Result, Value};
use tracing::trace;

use super::{WritableStream, WritableStreamState, WritableStreamWeak};
use crate::{
    queuing_strategy::SizeAlgorithm,
    readable::{flatten, StartAlgorithm},
    utils::queue::QueueWithSizes,
};

pub(super) type WriteFn = dyn Fn(Value, WritableStreamDefaultController) -> Result<Promise<()>>;
pub(super) type CloseFn = dyn Fn() -> Result<Promise<()>>;
pub(super) type AbortFn = dyn Fn(Value) -> Result<Promise<()>>;

/// Lets a [`crate::writable::UnderlyingSink`] error its stream and observe aborts.
#[derive(Clone)]
pub struct WritableStreamDefaultController(Rc<RefCell<WritableStreamDefaultControllerInner>>);

struct WritableStreamDefaultControllerInner {
    abort_algorithm: Option<AbortAlgorithm>,
    close_algorithm: Option<CloseAlgorithm>,
    queue: QueueWithSizes<WriteQueueEntry>,
    started: bool,
    strategy_hwm: f64,
    strategy_size_algorithm: Option<SizeAlgorithm>,
    write_algorithm: Option<WriteAlgorithm>,
    abort_controller: AbortController,
    stream: WritableStreamWeak,
    ctx: Ctx,
}

// The close sentinel shares the queue with chunks so that close runs after every queued write.
#[derive(Clone, Debug)]
enum WriteQueueEntry {
    Chunk(Value),
    Close,
}

impl WritableStreamDefaultController {
    pub(super) fn new(
        ctx: &Ctx,
        write_algorithm: WriteAlgorithm,
        close_algorithm: CloseAlgorithm,
        abort_algorithm: AbortAlgorithm,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm,
    ) -> Self {
        Self(Rc::new(RefCell::new(WritableStreamDefaultControllerInner {
            // Perform ! ResetQueue(controller).
            queue: QueueWithSizes::new(),
            // Set controller.[[abortController]] to a new AbortController.
            abort_controller: AbortController::new(),
            // Set controller.[[started]] to false.
            started: false,
            // Set controller.[[strategySizeAlgorithm]] to sizeAlgorithm.
            strategy_size_algorithm: Some(size_algorithm),
            // Set controller.[[strategyHWM]] to highWaterMark.
            strategy_hwm: high_water_mark,
            // Set controller.[[writeAlgorithm]] to writeAlgorithm.
            write_algorithm: Some(write_algorithm),
            // Set controller.[[closeAlgorithm]] to closeAlgorithm.
            close_algorithm: Some(close_algorithm),
            // Set controller.[[abortAlgorithm]] to abortAlgorithm.
            abort_algorithm: Some(abort_algorithm),
            stream: WritableStreamWeak::new(),
            ctx: ctx.clone(),
        })))
    }

    pub(super) fn set_up(
        &self,
        stream: &WritableStream,
        start_algorithm: StartAlgorithm<Self>,
    ) -> Result<()> {
        // Set controller.[[stream]] to stream.
        self.0.borrow_mut().stream = stream.downgrade();

        // Let backpressure be ! WritableStreamDefaultControllerGetBackpressure(controller).
        let backpressure = self.writable_stream_default_controller_get_backpressure();

        // Perform ! WritableStreamUpdateBackpressure(stream, backpressure).
        stream.writable_stream_update_backpressure(backpressure);

        // Let startResult be the result of performing startAlgorithm. (This may throw an exception.)
        let start_result = start_algorithm.call(&self.ctx(), self.clone())?;

        // Let startPromise be a promise resolved with startResult.
        let controller = self.clone();
        start_result.react(move |result| {
            // Set controller.[[started]] to true.
            controller.0.borrow_mut().started = true;
            match result {
                // Upon fulfillment of startPromise,
                // Perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
                Ok(()) => controller.writable_stream_default_controller_advance_queue_if_needed(),
                // Upon rejection of startPromise with reason r,
                // Perform ! WritableStreamDealWithRejection(stream, r).
                Err(r) => {
                    if let Some(stream) = controller.stream() {
                        stream.writable_stream_deal_with_rejection(r)
                    }
                },
            }
        });

        Ok(())
    }

    /// Signalled when the stream is aborted, so a long running write can give up early.
    pub fn signal(&self) -> AbortSignal {
        self.0.borrow().abort_controller.signal()
    }

    /// Errors the stream unless it has already started closing down.
    pub fn error(&self, e: impl Into<Value>) {
        // Let state be this.[[stream]].[[state]].
        // If state is not "writable", return.
        let Some(stream) = self.stream() else {
            return;
        };
        if !stream.is_writable() {
            return;
        }

        // Perform ! WritableStreamDefaultControllerError(this, e).
        self.writable_stream_default_controller_error(&stream, e.into())
    }

    fn ctx(&self) -> Ctx {
        self.0.borrow().ctx.clone()
    }

    fn stream(&self) -> Option<WritableStream> {
        self.0.borrow().stream.upgrade().map(WritableStream)
    }

    pub(super) fn started(&self) -> bool {
        self.0.borrow().started
    }

    pub(super) fn signal_abort(&self, reason: Value) {
        let abort_controller = self.0.borrow().abort_controller.clone();
        abort_controller.abort(Some(reason));
    }

    // [[AbortSteps]]
    pub(super) fn abort_steps(&self, reason: Value) -> Promise<()> {
        // Let result be the result of performing this.[[abortAlgorithm]], passing reason.
        let abort_algorithm = self.0.borrow().abort_algorithm.clone();
        let result = match abort_algorithm {
            Some(abort_algorithm) => abort_algorithm.call(&self.ctx(), reason),
            None => Promise::resolved(&self.ctx(), ()),
        };

        // Perform ! WritableStreamDefaultControllerClearAlgorithms(this).
        self.writable_stream_default_controller_clear_algorithms();

        // Return result.
        result
    }

    // [[ErrorSteps]]
    pub(super) fn error_steps(&self) {
        // Perform ! ResetQueue(this).
        self.0.borrow_mut().queue.reset_queue();
    }

    pub(super) fn writable_stream_default_controller_close(&self) {
        // Perform ! EnqueueValueWithSize(controller, close sentinel, 0).
        let enqueued = self
            .0
            .borrow_mut()
            .queue
            .enqueue_value_with_size(WriteQueueEntry::Close, 0.0);
        debug_assert!(enqueued.is_ok());

        // Perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
        self.writable_stream_default_controller_advance_queue_if_needed();
    }

    pub(super) fn writable_stream_default_controller_get_chunk_size(&self, chunk: &Value) -> f64 {
        // If controller.[[strategySizeAlgorithm]] is undefined, then:
        // Assert: controller.[[stream]].[[state]] is not "writable".
        // Return 1.
        let Some(size_algorithm) = self.0.borrow().strategy_size_algorithm.clone() else {
            return 1.0;
        };

        // Let returnValue be the result of performing controller.[[strategySizeAlgorithm]], passing in chunk, and interpreting the result as a completion record.
        match size_algorithm.call(chunk) {
            Ok(size) => size,
            // If returnValue is an abrupt completion,
            Err(err) => {
                // Perform ! WritableStreamDefaultControllerErrorIfNeeded(controller, returnValue.[[Value]]).
                self.writable_stream_default_controller_error_if_needed(err.into());
                // Return 1.
                1.0
            },
        }
    }

    pub(super) fn writable_stream_default_controller_get_desired_size(&self) -> f64 {
        let inner = self.0.borrow();
        // Return controller.[[strategyHWM]] − controller.[[queueTotalSize]].
        inner.strategy_hwm - inner.queue.queue_total_size
    }

    pub(super) fn writable_stream_default_controller_get_backpressure(&self) -> bool {
        // Let desiredSize be ! WritableStreamDefaultControllerGetDesiredSize(controller).
        // Return true if desiredSize ≤ 0, or false otherwise.
        self.writable_stream_default_controller_get_desired_size() <= 0.0
    }

    pub(super) fn writable_stream_default_controller_write(&self, chunk: Value, chunk_size: f64) {
        // Let enqueueResult be EnqueueValueWithSize(controller, chunk, chunkSize).
        let enqueue_result = self
            .0
            .borrow_mut()
            .queue
            .enqueue_value_with_size(WriteQueueEntry::Chunk(chunk), chunk_size);

        // If enqueueResult is an abrupt completion,
        if let Err(err) = enqueue_result {
            // Perform ! WritableStreamDefaultControllerErrorIfNeeded(controller, enqueueResult.[[Value]]).
            self.writable_stream_default_controller_error_if_needed(err.into());
            // Return.
            return;
        }

        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // If ! WritableStreamCloseQueuedOrInFlight(stream) is false and stream.[[state]] is "writable",
        if !stream.writable_stream_close_queued_or_in_flight() && stream.is_writable() {
            // Let backpressure be ! WritableStreamDefaultControllerGetBackpressure(controller).
            let backpressure = self.writable_stream_default_controller_get_backpressure();
            // Perform ! WritableStreamUpdateBackpressure(stream, backpressure).
            stream.writable_stream_update_backpressure(backpressure);
        }

        // Perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
        self.writable_stream_default_controller_advance_queue_if_needed();
    }

    fn writable_stream_default_controller_advance_queue_if_needed(&self) {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // If controller.[[started]] is false, return.
        // If stream.[[inFlightWriteRequest]] is not undefined, return.
        if !self.started() || stream.has_in_flight_write_request() {
            return;
        }

        // Let state be stream.[[state]].
        // If state is "erroring",
        if let WritableStreamState::Erroring(_) = stream.state() {
            // Perform ! WritableStreamFinishErroring(stream).
            // Return.
            stream.writable_stream_finish_erroring();
            return;
        }

        // Let value be ! PeekQueueValue(controller).
        let value = self.0.borrow().queue.peek_queue_value().cloned();
        match value {
            // If controller.[[queue]] is empty, return.
            None => {},
            // If value is the close sentinel, perform ! WritableStreamDefaultControllerProcessClose(controller).
            Some(WriteQueueEntry::Close) => {
                self.writable_stream_default_controller_process_close(stream)
            },
            // Otherwise, perform ! WritableStreamDefaultControllerProcessWrite(controller, value).
            Some(WriteQueueEntry::Chunk(chunk)) => {
                self.writable_stream_default_controller_process_write(stream, chunk)
            },
        }
    }

    fn writable_stream_default_controller_error_if_needed(&self, error: Value) {
        // If controller.[[stream]].[[state]] is "writable", perform ! WritableStreamDefaultControllerError(controller, error).
        if let Some(stream) = self.stream() {
            if stream.is_writable() {
                self.writable_stream_default_controller_error(&stream, error)
            }
        }
    }

    fn writable_stream_default_controller_error(&self, stream: &WritableStream, error: Value) {
        // Perform ! WritableStreamDefaultControllerClearAlgorithms(controller).
        self.writable_stream_default_controller_clear_algorithms();
        // Perform ! WritableStreamStartErroring(stream, error).
        stream.writable_stream_start_erroring(error);
    }

    fn writable_stream_default_controller_clear_algorithms(&self) {
        let mut inner = self.0.borrow_mut();
        // Set controller.[[writeAlgorithm]] to undefined.
        inner.write_algorithm = None;
        // Set controller.[[closeAlgorithm]] to undefined.
        inner.close_algorithm = None;
        // Set controller.[[abortAlgorithm]] to undefined.
        inner.abort_algorithm = None;
        // Set controller.[[strategySizeAlgorithm]] to undefined.
        inner.strategy_size_algorithm = None;
    }

    fn writable_stream_default_controller_process_close(&self, stream: WritableStream) {
        // Perform ! WritableStreamMarkCloseRequestInFlight(stream).
        stream.writable_stream_mark_close_request_in_flight();

        // Perform ! DequeueValue(controller).
        let close_algorithm = {
            let mut inner = self.0.borrow_mut();
            inner.queue.dequeue_value();
            inner.close_algorithm.clone()
        };

        trace!("Closing underlying sink");

        // Let sinkClosePromise be the result of performing controller.[[closeAlgorithm]].
        let sink_close_promise = match close_algorithm {
            Some(close_algorithm) => close_algorithm.call(&self.ctx()),
            None => Promise::resolved(&self.ctx(), ()),
        };

        // Perform ! WritableStreamDefaultControllerClearAlgorithms(controller).
        self.writable_stream_default_controller_clear_algorithms();

        sink_close_promise.react(move |result| match result {
            // Upon fulfillment of sinkClosePromise,
            // Perform ! WritableStreamFinishInFlightClose(stream).
            Ok(()) => stream.writable_stream_finish_in_flight_close(),
            // Upon rejection of sinkClosePromise with reason reason,
            // Perform ! WritableStreamFinishInFlightCloseWithError(stream, reason).
            Err(reason) => stream.writable_stream_finish_in_flight_close_with_error(reason),
        });
    }

    fn writable_stream_default_controller_process_write(&self, stream: WritableStream, chunk: Value) {
        // Perform ! WritableStreamMarkFirstWriteRequestInFlight(stream).
        stream.writable_stream_mark_first_write_request_in_flight();

        trace!("Writing chunk to underlying sink");

        // Let sinkWritePromise be the result of performing controller.[[writeAlgorithm]], passing in chunk.
        let write_algorithm = self.0.borrow().write_algorithm.clone();
        let sink_write_promise = match write_algorithm {
            Some(write_algorithm) => write_algorithm.call(&self.ctx(), self.clone(), chunk),
            None => Promise::resolved(&self.ctx(), ()),
        };

        let controller = self.clone();
        sink_write_promise.react(move |result| match result {
            // Upon fulfillment of sinkWritePromise,
            Ok(()) => {
                // Perform ! WritableStreamFinishInFlightWrite(stream).
                stream.writable_stream_finish_in_flight_write();

                // Let state be stream.[[state]].
                let writable = stream.is_writable();

                // Perform ! DequeueValue(controller).
                controller.0.borrow_mut().queue.dequeue_value();

                // If ! WritableStreamCloseQueuedOrInFlight(stream) is false and state is "writable",
                if !stream.writable_stream_close_queued_or_in_flight() && writable {
                    // Let backpressure be ! WritableStreamDefaultControllerGetBackpressure(controller).
                    let backpressure =
                        controller.writable_stream_default_controller_get_backpressure();
                    // Perform ! WritableStreamUpdateBackpressure(stream, backpressure).
                    stream.writable_stream_update_backpressure(backpressure);
                }

                // Perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
                controller.writable_stream_default_controller_advance_queue_if_needed();
            },
            // Upon rejection of sinkWritePromise with reason,
            Err(reason) => {
                // If stream.[[state]] is "writable", perform ! WritableStreamDefaultControllerClearAlgorithms(controller).
                if stream.is_writable() {
                    controller.writable_stream_default_controller_clear_algorithms();
                }
                // Perform ! WritableStreamFinishInFlightWriteWithError(stream, reason).
                stream.writable_stream_finish_in_flight_write_with_error(reason);
            },
        });
    }

    #[cfg(test)]
    pub(super) fn queue_len(&self) -> usize {
        self.0.borrow().queue.queue.len()
    }
}

impl fmt::Debug for WritableStreamDefaultController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("WritableStreamDefaultController")
            .field("started", &inner.started)
            .field("queue_total_size", &inner.queue.queue_total_size)
            .field("strategy_hwm", &inner.strategy_hwm)
            .finish()
    }
}

#[derive(Clone)]
pub(crate) enum WriteAlgorithm {
    ReturnPromiseUndefined,
    Function(Rc<WriteFn>),
}

impl WriteAlgorithm {
    pub(crate) fn from_fn(
        f: impl Fn(Value, WritableStreamDefaultController) -> Result<Promise<()>> + 'static,
    ) -> Self {
        Self::Function(Rc::new(f))
    }

    fn call(
        &self,
        ctx: &Ctx,
        controller: WritableStreamDefaultController,
        chunk: Value,
    ) -> Promise<()> {
        match self {
            WriteAlgorithm::ReturnPromiseUndefined => Promise::resolved(ctx, ()),
            WriteAlgorithm::Function(f) => flatten(ctx, f(chunk, controller)),
        }
    }
}

#[derive(Clone)]
pub(crate) enum CloseAlgorithm {
    ReturnPromiseUndefined,
    Function(Rc<CloseFn>),
}

impl CloseAlgorithm {
    pub(crate) fn from_fn(f: impl Fn() -> Result<Promise<()>> + 'static) -> Self {
        Self::Function(Rc::new(f))
    }

    fn call(&self, ctx: &Ctx) -> Promise<()> {
        match self {
            CloseAlgorithm::ReturnPromiseUndefined => Promise::resolved(ctx, ()),
            CloseAlgorithm::Function(f) => flatten(ctx, f()),
        }
    }
}

#[derive(Clone)]
pub(crate) enum AbortAlgorithm {
    ReturnPromiseUndefined,
    Function(Rc<AbortFn>),
}

impl AbortAlgorithm {
    pub(crate) fn from_fn(f: impl Fn(Value) -> Result<Promise<()>> + 'static) -> Self {
        Self::Function(Rc::new(f))
    }

    fn call(&self, ctx: &Ctx, reason: Value) -> Promise<()> {
        match self {
            AbortAlgorithm::ReturnPromiseUndefined => Promise::resolved(ctx, ()),
            AbortAlgorithm::Function(f) => flatten(ctx, f(reason)),
        }
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
        writable::{UnderlyingSink, WritableStreamDefaultWriter},
    };

    #[tokio::test]
    async fn test_size_error_errors_stream() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = WritableStream::new(
                    &ctx,
                    UnderlyingSink::new(),
                    QueuingStrategy::new()
                        .with_size(|_chunk: &Value| Err(Error::thrown("no size"))),
                )
                .unwrap();
                let writer = WritableStreamDefaultWriter::new(&stream).unwrap();

                let reason = ctx.settle(&writer.write("a")).await.unwrap_err();
                assert_eq!(reason, Value::from("no size"));
                assert_eq!(
                    stream.state(),
                    WritableStreamState::Errored(Value::from("no size"))
                );
                assert!(ctx.settle(&writer.closed()).await.is_err());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_controller_error_rejects_queued_writes() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let captured = Rc::new(RefCell::new(None));
                let pending = ResolveablePromise::new(&ctx);
                let stream = WritableStream::new(
                    &ctx,
                    UnderlyingSink::new()
                        .with_start({
                            let captured = captured.clone();
                            let ctx = ctx.clone();
                            move |controller| {
                                captured.replace(Some(controller));
                                Ok(Promise::resolved(&ctx, ()))
                            }
                        })
                        .with_write({
                            let pending = pending.clone();
                            move |_chunk, _controller| Ok(pending.promise.clone())
                        }),
                    QueuingStrategy::new().with_high_water_mark(4.0),
                )
                .unwrap();
                let writer = WritableStreamDefaultWriter::new(&stream).unwrap();
                let first = writer.write(1);
                let second = writer.write(2);
                second.set_is_handled();
                ctx.execute_pending_jobs();

                let controller = captured.borrow().clone().unwrap();
                assert_eq!(controller.queue_len(), 2);
                controller.error("broken");
                assert!(matches!(stream.state(), WritableStreamState::Erroring(_)));

                // The in-flight write finishes before the stream errors.
                pending.resolve_undefined();
                assert_eq!(ctx.settle(&first).await, Ok(()));
                assert_eq!(ctx.settle(&second).await, Err(Value::from("broken")));
                assert_eq!(controller.queue_len(), 0);
                assert_eq!(
                    stream.state(),
                    WritableStreamState::Errored(Value::from("broken"))
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_abort_signals_controller() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let observed = Rc::new(Cell::new(false));
                let stream = WritableStream::new(
                    &ctx,
                    UnderlyingSink::new().with_start({
                        let observed = observed.clone();
                        let ctx = ctx.clone();
                        move |controller| {
                            let observed = observed.clone();
                            controller.signal().add_algorithm(move |signal| {
                                observed.set(signal.reason() == Some(Value::from("stop")));
                            });
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::default(),
                )
                .unwrap();
                ctx.execute_pending_jobs();

                assert_eq!(ctx.settle(&stream.abort("stop")).await, Ok(()));
                assert!(observed.get());
                assert_eq!(
                    stream.state(),
                    WritableStreamState::Errored(Value::from("stop"))
                );
            })
        })
        .await;
    }
}
