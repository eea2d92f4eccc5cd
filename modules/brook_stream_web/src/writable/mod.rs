use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
};

use brook_utils::{promise::promise_rejected_with, Ctx, Error, Promise, ResolveablePromise, Result, Value};
use tracing::debug;

use crate::{
    queuing_strategy::{QueuingStrategy, SizeAlgorithm},
    readable::StartAlgorithm,
};

pub(crate) use default_controller::{AbortAlgorithm, CloseAlgorithm, WriteAlgorithm};
pub use default_controller::WritableStreamDefaultController;
pub use default_writer::WritableStreamDefaultWriter;
pub use sink::UnderlyingSink;

mod default_controller;
mod default_writer;
mod sink;

pub(crate) type WritableStreamWeak = Weak<RefCell<WritableStreamInner>>;

#[derive(Debug, Clone, PartialEq)]
pub enum WritableStreamState {
    Writable,
    Erroring(Value),
    Closed,
    Errored(Value),
}

struct PendingAbortRequest {
    promise: ResolveablePromise<()>,
    reason: Value,
    was_already_erroring: bool,
}

pub(crate) struct WritableStreamInner {
    backpressure: bool,
    close_request: Option<ResolveablePromise<()>>,
    controller: WritableStreamDefaultController,
    in_flight_write_request: Option<ResolveablePromise<()>>,
    in_flight_close_request: Option<ResolveablePromise<()>>,
    pending_abort_request: Option<PendingAbortRequest>,
    state: WritableStreamState,
    writer: Option<WritableStreamDefaultWriter>,
    write_requests: VecDeque<ResolveablePromise<()>>,
    ctx: Ctx,
}

/// A destination for chunks, written through a single writer at a time.
#[derive(Clone)]
pub struct WritableStream(pub(crate) Rc<RefCell<WritableStreamInner>>);

impl WritableStream {
    // Streams Spec: 5.2.4: https://streams.spec.whatwg.org/#ws-prototype
    // constructor(optional object underlyingSink, optional QueuingStrategy strategy = {});
    pub fn new(
        ctx: &Ctx,
        underlying_sink: UnderlyingSink,
        queuing_strategy: QueuingStrategy,
    ) -> Result<Self> {
        // Let sizeAlgorithm be ! ExtractSizeAlgorithm(strategy).
        let size_algorithm = queuing_strategy.extract_size_algorithm();

        // Let highWaterMark be ? ExtractHighWaterMark(strategy, 1).
        let high_water_mark = queuing_strategy.extract_high_water_mark(1.0)?;

        let (start_algorithm, write_algorithm, close_algorithm, abort_algorithm) =
            underlying_sink.into_algorithms();

        // Perform ? SetUpWritableStreamDefaultControllerFromUnderlyingSink(this, underlyingSink, underlyingSinkDict, highWaterMark, sizeAlgorithm).
        Self::create_writable_stream(
            ctx,
            start_algorithm,
            write_algorithm,
            close_algorithm,
            abort_algorithm,
            high_water_mark,
            size_algorithm,
        )
    }

    pub fn locked(&self) -> bool {
        // Return ! IsWritableStreamLocked(this).
        self.is_writable_stream_locked()
    }

    pub fn state(&self) -> WritableStreamState {
        self.0.borrow().state.clone()
    }

    pub fn abort(&self, reason: impl Into<Value>) -> Promise<()> {
        // If ! IsWritableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_writable_stream_locked() {
            return promise_rejected_with(
                &self.ctx(),
                Error::state("Cannot abort a stream that already has a writer"),
            );
        }

        // Return ! WritableStreamAbort(this, reason).
        self.writable_stream_abort(reason.into())
    }

    pub fn close(&self) -> Promise<()> {
        // If ! IsWritableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_writable_stream_locked() {
            return promise_rejected_with(
                &self.ctx(),
                Error::state("Cannot close a stream that already has a writer"),
            );
        }

        // If ! WritableStreamCloseQueuedOrInFlight(this) is true, return a promise rejected with a TypeError exception.
        if self.writable_stream_close_queued_or_in_flight() {
            return promise_rejected_with(
                &self.ctx(),
                Error::state("Cannot close an already-closing stream"),
            );
        }

        // Return ! WritableStreamClose(this).
        self.writable_stream_close()
    }

    pub fn get_writer(&self) -> Result<WritableStreamDefaultWriter> {
        // Return ? AcquireWritableStreamDefaultWriter(this).
        WritableStreamDefaultWriter::new(self)
    }

    pub(crate) fn create_writable_stream(
        ctx: &Ctx,
        start_algorithm: StartAlgorithm<WritableStreamDefaultController>,
        write_algorithm: WriteAlgorithm,
        close_algorithm: CloseAlgorithm,
        abort_algorithm: AbortAlgorithm,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm,
    ) -> Result<Self> {
        // Let controller be a new WritableStreamDefaultController.
        let controller = WritableStreamDefaultController::new(
            ctx,
            write_algorithm,
            close_algorithm,
            abort_algorithm,
            high_water_mark,
            size_algorithm,
        );

        // Perform ! InitializeWritableStream(stream).
        let stream = Self(Rc::new(RefCell::new(WritableStreamInner {
            // Set stream.[[state]] to "writable".
            state: WritableStreamState::Writable,
            // Set stream.[[storedError]], stream.[[writer]], stream.[[controller]], stream.[[inFlightWriteRequest]], stream.[[closeRequest]], stream.[[inFlightCloseRequest]], and stream.[[pendingAbortRequest]] to undefined.
            writer: None,
            controller: controller.clone(),
            in_flight_write_request: None,
            close_request: None,
            in_flight_close_request: None,
            pending_abort_request: None,
            // Set stream.[[writeRequests]] to a new empty list.
            write_requests: VecDeque::new(),
            // Set stream.[[backpressure]] to false.
            backpressure: false,
            ctx: ctx.clone(),
        })));

        // Perform ? SetUpWritableStreamDefaultController(stream, controller, startAlgorithm, writeAlgorithm, closeAlgorithm, abortAlgorithm, highWaterMark, sizeAlgorithm).
        controller.set_up(&stream, start_algorithm)?;

        Ok(stream)
    }

    pub(crate) fn ctx(&self) -> Ctx {
        self.0.borrow().ctx.clone()
    }

    pub(crate) fn controller(&self) -> WritableStreamDefaultController {
        self.0.borrow().controller.clone()
    }

    pub(crate) fn downgrade(&self) -> WritableStreamWeak {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn ptr_eq(&self, other: &WritableStream) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn is_writable(&self) -> bool {
        matches!(self.0.borrow().state, WritableStreamState::Writable)
    }

    pub(crate) fn backpressure(&self) -> bool {
        self.0.borrow().backpressure
    }

    /// The error a stream was aborted or errored with, once it is erroring.
    pub(crate) fn stored_error(&self) -> Option<Value> {
        match &self.0.borrow().state {
            WritableStreamState::Erroring(stored_error)
            | WritableStreamState::Errored(stored_error) => Some(stored_error.clone()),
            _ => None,
        }
    }

    pub(crate) fn has_in_flight_write_request(&self) -> bool {
        self.0.borrow().in_flight_write_request.is_some()
    }

    pub(crate) fn is_writable_stream_locked(&self) -> bool {
        // If stream.[[writer]] is undefined, return false.
        // Return true.
        self.0.borrow().writer.is_some()
    }

    pub(crate) fn writable_stream_abort(&self, reason: Value) -> Promise<()> {
        let ctx = self.ctx();

        // If stream.[[state]] is "closed" or "errored", return a promise resolved with undefined.
        if matches!(
            self.state(),
            WritableStreamState::Closed | WritableStreamState::Errored(_)
        ) {
            return Promise::resolved(&ctx, ());
        }

        debug!("Aborting writable stream: {}", reason);

        // Signal abort on stream.[[controller]].[[abortController]] with reason.
        self.controller().signal_abort(reason.clone());

        // Let state be stream.[[state]].
        let state = self.state();

        // If state is "closed" or "errored", return a promise resolved with undefined.
        if matches!(
            state,
            WritableStreamState::Closed | WritableStreamState::Errored(_)
        ) {
            return Promise::resolved(&ctx, ());
        }

        // If stream.[[pendingAbortRequest]] is not undefined, return stream.[[pendingAbortRequest]]'s promise.
        if let Some(pending_abort_request) = &self.0.borrow().pending_abort_request {
            return pending_abort_request.promise.promise.clone();
        }

        // Let wasAlreadyErroring be false.
        // If state is "erroring",
        // Set wasAlreadyErroring to true.
        // Set reason to undefined.
        let (was_already_erroring, reason) = match state {
            WritableStreamState::Erroring(_) => (true, Value::Undefined),
            _ => (false, reason),
        };

        // Let promise be a new promise.
        let promise = ResolveablePromise::new(&ctx);

        // Set stream.[[pendingAbortRequest]] to a new pending abort request whose promise is promise, reason is reason, and was already erroring is wasAlreadyErroring.
        self.0.borrow_mut().pending_abort_request = Some(PendingAbortRequest {
            promise: promise.clone(),
            reason: reason.clone(),
            was_already_erroring,
        });

        // If wasAlreadyErroring is false, perform ! WritableStreamStartErroring(stream, reason).
        if !was_already_erroring {
            self.writable_stream_start_erroring(reason);
        }

        // Return promise.
        promise.promise
    }

    pub(crate) fn writable_stream_close(&self) -> Promise<()> {
        let ctx = self.ctx();

        // Let state be stream.[[state]].
        let state = self.state();

        // If state is "closed" or "errored", return a promise rejected with a TypeError exception.
        if matches!(
            state,
            WritableStreamState::Closed | WritableStreamState::Errored(_)
        ) {
            return promise_rejected_with(
                &ctx,
                Error::state("The stream is not in the writable state and cannot be closed"),
            );
        }

        // Let promise be a new promise.
        let promise = ResolveablePromise::new(&ctx);

        let (writer, backpressure, controller) = {
            let mut inner = self.0.borrow_mut();
            // Set stream.[[closeRequest]] to promise.
            inner.close_request = Some(promise.clone());
            // Let writer be stream.[[writer]].
            (
                inner.writer.clone(),
                inner.backpressure,
                inner.controller.clone(),
            )
        };

        // If writer is not undefined, and stream.[[backpressure]] is true, and state is "writable", resolve writer.[[readyPromise]] with undefined.
        if let Some(writer) = writer {
            if backpressure && matches!(state, WritableStreamState::Writable) {
                writer.resolve_ready_promise();
            }
        }

        // Perform ! WritableStreamDefaultControllerClose(stream.[[controller]]).
        controller.writable_stream_default_controller_close();

        // Return promise.
        promise.promise
    }

    pub(crate) fn writable_stream_add_write_request(&self) -> Promise<()> {
        let mut inner = self.0.borrow_mut();
        // Let promise be a new promise.
        let promise = ResolveablePromise::new(&inner.ctx);
        // Append promise to stream.[[writeRequests]].
        inner.write_requests.push_back(promise.clone());
        // Return promise.
        promise.promise
    }

    pub(crate) fn writable_stream_close_queued_or_in_flight(&self) -> bool {
        let inner = self.0.borrow();
        // If stream.[[closeRequest]] is undefined and stream.[[inFlightCloseRequest]] is undefined, return false.
        // Return true.
        inner.close_request.is_some() || inner.in_flight_close_request.is_some()
    }

    fn writable_stream_has_operation_marked_in_flight(&self) -> bool {
        let inner = self.0.borrow();
        // If stream.[[inFlightWriteRequest]] is undefined and stream.[[inFlightCloseRequest]] is undefined, return false.
        // Return true.
        inner.in_flight_write_request.is_some() || inner.in_flight_close_request.is_some()
    }

    fn writable_stream_deal_with_rejection(&self, error: Value) {
        // Let state be stream.[[state]].
        // If state is "writable",
        if self.is_writable() {
            // Perform ! WritableStreamStartErroring(stream, error).
            // Return.
            self.writable_stream_start_erroring(error);
            return;
        }

        // Assert: state is "erroring".
        // Perform ! WritableStreamFinishErroring(stream).
        self.writable_stream_finish_erroring()
    }

    fn writable_stream_start_erroring(&self, reason: Value) {
        debug!("Writable stream erroring: {}", reason);

        let (controller, writer) = {
            let mut inner = self.0.borrow_mut();
            // Set stream.[[state]] to "erroring".
            // Set stream.[[storedError]] to reason.
            inner.state = WritableStreamState::Erroring(reason.clone());
            // Let controller be stream.[[controller]].
            // Let writer be stream.[[writer]].
            (inner.controller.clone(), inner.writer.clone())
        };

        // If writer is not undefined, perform ! WritableStreamDefaultWriterEnsureReadyPromiseRejected(writer, reason).
        if let Some(writer) = writer {
            writer.writable_stream_default_writer_ensure_ready_promise_rejected(reason);
        }

        // If ! WritableStreamHasOperationMarkedInFlight(stream) is false and controller.[[started]] is true, perform ! WritableStreamFinishErroring(stream).
        if !self.writable_stream_has_operation_marked_in_flight() && controller.started() {
            self.writable_stream_finish_erroring();
        }
    }

    fn writable_stream_finish_erroring(&self) {
        let (stored_error, write_requests, controller) = {
            let mut inner = self.0.borrow_mut();
            // Assert: stream.[[state]] is "erroring".
            let WritableStreamState::Erroring(stored_error) = inner.state.clone() else {
                return;
            };
            // Set stream.[[state]] to "errored".
            inner.state = WritableStreamState::Errored(stored_error.clone());
            (
                stored_error,
                std::mem::take(&mut inner.write_requests),
                inner.controller.clone(),
            )
        };

        debug!("Writable stream errored: {}", stored_error);

        // Perform ! stream.[[controller]].[[ErrorSteps]]().
        controller.error_steps();

        // Let storedError be stream.[[storedError]].
        // For each writeRequest of stream.[[writeRequests]]:
        for write_request in write_requests {
            // Reject writeRequest with storedError.
            write_request.reject(stored_error.clone());
        }

        // Set stream.[[writeRequests]] to an empty list.
        // If stream.[[pendingAbortRequest]] is undefined,
        let pending_abort_request = self.0.borrow_mut().pending_abort_request.take();
        let Some(abort_request) = pending_abort_request else {
            // Perform ! WritableStreamRejectCloseAndClosedPromiseIfNeeded(stream).
            // Return.
            self.writable_stream_reject_close_and_closed_promise_if_needed();
            return;
        };

        // Let abortRequest be stream.[[pendingAbortRequest]].
        // Set stream.[[pendingAbortRequest]] to undefined.
        // If abortRequest’s was already erroring is true,
        if abort_request.was_already_erroring {
            // Reject abortRequest’s promise with storedError.
            abort_request.promise.reject(stored_error);
            // Perform ! WritableStreamRejectCloseAndClosedPromiseIfNeeded(stream).
            // Return.
            self.writable_stream_reject_close_and_closed_promise_if_needed();
            return;
        }

        // Let promise be ! stream.[[controller]].[[AbortSteps]](abortRequest’s reason).
        let promise = controller.abort_steps(abort_request.reason);

        let stream = self.clone();
        promise.react(move |result| {
            match result {
                // Upon fulfillment of promise,
                // Resolve abortRequest’s promise with undefined.
                Ok(()) => abort_request.promise.resolve_undefined(),
                // Upon rejection of promise with reason reason,
                // Reject abortRequest’s promise with reason.
                Err(reason) => abort_request.promise.reject(reason),
            }
            // Perform ! WritableStreamRejectCloseAndClosedPromiseIfNeeded(stream).
            stream.writable_stream_reject_close_and_closed_promise_if_needed();
        });
    }

    fn writable_stream_finish_in_flight_write(&self) {
        // Assert: stream.[[inFlightWriteRequest]] is not undefined.
        // Resolve stream.[[inFlightWriteRequest]] with undefined.
        // Set stream.[[inFlightWriteRequest]] to undefined.
        let request = self.0.borrow_mut().in_flight_write_request.take();
        if let Some(request) = request {
            request.resolve_undefined();
        }
    }

    fn writable_stream_finish_in_flight_write_with_error(&self, error: Value) {
        // Reject stream.[[inFlightWriteRequest]] with error.
        // Set stream.[[inFlightWriteRequest]] to undefined.
        let request = self.0.borrow_mut().in_flight_write_request.take();
        if let Some(request) = request {
            request.reject(error.clone());
        }

        // Perform ! WritableStreamDealWithRejection(stream, error).
        self.writable_stream_deal_with_rejection(error)
    }

    fn writable_stream_finish_in_flight_close(&self) {
        let (request, abort_request, writer) = {
            let mut inner = self.0.borrow_mut();
            // Resolve stream.[[inFlightCloseRequest]] with undefined.
            // Set stream.[[inFlightCloseRequest]] to undefined.
            let request = inner.in_flight_close_request.take();
            // If state is "erroring",
            // Set stream.[[storedError]] to undefined.
            // If stream.[[pendingAbortRequest]] is not undefined, resolve it and set it to undefined.
            let abort_request = match inner.state {
                WritableStreamState::Erroring(_) => inner.pending_abort_request.take(),
                _ => None,
            };
            // Set stream.[[state]] to "closed".
            inner.state = WritableStreamState::Closed;
            // Let writer be stream.[[writer]].
            (request, abort_request, inner.writer.clone())
        };

        debug!("Writable stream closed");

        if let Some(request) = request {
            request.resolve_undefined();
        }
        if let Some(abort_request) = abort_request {
            abort_request.promise.resolve_undefined();
        }

        // If writer is not undefined, resolve writer.[[closedPromise]] with undefined.
        if let Some(writer) = writer {
            writer.resolve_closed_promise();
        }
    }

    fn writable_stream_finish_in_flight_close_with_error(&self, error: Value) {
        let (request, abort_request) = {
            let mut inner = self.0.borrow_mut();
            // Set stream.[[inFlightCloseRequest]] to undefined.
            // If stream.[[pendingAbortRequest]] is not undefined, set it to undefined.
            (
                inner.in_flight_close_request.take(),
                inner.pending_abort_request.take(),
            )
        };

        // Reject stream.[[inFlightCloseRequest]] with error.
        if let Some(request) = request {
            request.reject(error.clone());
        }

        // Reject stream.[[pendingAbortRequest]]’s promise with error.
        if let Some(abort_request) = abort_request {
            abort_request.promise.reject(error.clone());
        }

        // Perform ! WritableStreamDealWithRejection(stream, error).
        self.writable_stream_deal_with_rejection(error)
    }

    fn writable_stream_mark_close_request_in_flight(&self) {
        let mut inner = self.0.borrow_mut();
        // Set stream.[[inFlightCloseRequest]] to stream.[[closeRequest]].
        // Set stream.[[closeRequest]] to undefined.
        inner.in_flight_close_request = inner.close_request.take();
    }

    fn writable_stream_mark_first_write_request_in_flight(&self) {
        let mut inner = self.0.borrow_mut();
        // Let writeRequest be stream.[[writeRequests]][0].
        // Remove writeRequest from stream.[[writeRequests]].
        // Set stream.[[inFlightWriteRequest]] to writeRequest.
        inner.in_flight_write_request = inner.write_requests.pop_front();
    }

    fn writable_stream_reject_close_and_closed_promise_if_needed(&self) {
        let (stored_error, close_request, writer) = {
            let mut inner = self.0.borrow_mut();
            // Assert: stream.[[state]] is "errored".
            let WritableStreamState::Errored(stored_error) = inner.state.clone() else {
                return;
            };
            // If stream.[[closeRequest]] is not undefined, set stream.[[closeRequest]] to undefined.
            (stored_error, inner.close_request.take(), inner.writer.clone())
        };

        // Reject stream.[[closeRequest]] with stream.[[storedError]].
        if let Some(close_request) = close_request {
            close_request.reject(stored_error.clone());
        }

        // Let writer be stream.[[writer]].
        // If writer is not undefined,
        // Reject writer.[[closedPromise]] with stream.[[storedError]].
        // Set writer.[[closedPromise]].[[PromiseIsHandled]] to true.
        if let Some(writer) = writer {
            writer.reject_closed_promise(stored_error);
        }
    }

    fn writable_stream_update_backpressure(&self, backpressure: bool) {
        let (writer, changed) = {
            let mut inner = self.0.borrow_mut();
            let changed = inner.backpressure != backpressure;
            // Set stream.[[backpressure]] to backpressure.
            inner.backpressure = backpressure;
            // Let writer be stream.[[writer]].
            (inner.writer.clone(), changed)
        };

        // If writer is not undefined and backpressure is not stream.[[backpressure]],
        let Some(writer) = writer.filter(|_| changed) else {
            return;
        };

        if backpressure {
            // If backpressure is true, set writer.[[readyPromise]] to a new promise.
            writer.reset_ready_promise();
        } else {
            // Otherwise, resolve writer.[[readyPromise]] with undefined.
            writer.resolve_ready_promise();
        }
    }
}

impl fmt::Debug for WritableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("WritableStream")
            .field("state", &inner.state)
            .field("backpressure", &inner.backpressure)
            .field("locked", &inner.writer.is_some())
            .field("controller", &inner.controller)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use brook_test::test_async_with;
    use brook_utils::PromiseState;

    use super::*;

    // Records every sink call and leaves each write pending until the test releases it.
    #[derive(Clone, Default)]
    struct RecordingSink {
        log: Rc<RefCell<Vec<String>>>,
        pending: Rc<RefCell<VecDeque<ResolveablePromise<()>>>>,
    }

    impl RecordingSink {
        fn sink(&self, ctx: &Ctx) -> UnderlyingSink {
            UnderlyingSink::new()
                .with_write({
                    let this = self.clone();
                    let ctx = ctx.clone();
                    move |chunk, _controller| {
                        this.log.borrow_mut().push(format!("write {chunk}"));
                        let promise = ResolveablePromise::new(&ctx);
                        this.pending.borrow_mut().push_back(promise.clone());
                        Ok(promise.promise)
                    }
                })
                .with_close({
                    let this = self.clone();
                    let ctx = ctx.clone();
                    move || {
                        this.log.borrow_mut().push("close".into());
                        Ok(Promise::resolved(&ctx, ()))
                    }
                })
                .with_abort({
                    let this = self.clone();
                    let ctx = ctx.clone();
                    move |reason| {
                        this.log.borrow_mut().push(format!("abort {reason}"));
                        Ok(Promise::resolved(&ctx, ()))
                    }
                })
        }

        fn finish_next_write(&self) {
            let next = self.pending.borrow_mut().pop_front();
            next.expect("no write in flight").resolve_undefined();
        }

        fn log(&self) -> Vec<String> {
            self.log.borrow().clone()
        }
    }

    #[tokio::test]
    async fn test_writes_are_serialized() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let recorder = RecordingSink::default();
                let stream = WritableStream::new(
                    &ctx,
                    recorder.sink(&ctx),
                    QueuingStrategy::new().with_high_water_mark(1.0),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();

                let first = writer.write("a");
                let second = writer.write("b");
                let close = writer.close();
                ctx.execute_pending_jobs();

                // Only one write reaches the sink until it settles.
                assert_eq!(recorder.log(), ["write a"]);
                assert_eq!(writer.desired_size(), Ok(Some(-1.0)));
                assert!(stream.backpressure());

                recorder.finish_next_write();
                assert_eq!(ctx.settle(&first).await, Ok(()));
                assert_eq!(recorder.log(), ["write a", "write b"]);
                assert_eq!(second.state(), PromiseState::Pending);

                recorder.finish_next_write();
                assert_eq!(ctx.settle(&second).await, Ok(()));
                assert_eq!(ctx.settle(&close).await, Ok(()));
                assert_eq!(recorder.log(), ["write a", "write b", "close"]);
                assert_eq!(stream.state(), WritableStreamState::Closed);
                assert_eq!(ctx.settle(&writer.closed()).await, Ok(()));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_abort_during_in_flight_write() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let recorder = RecordingSink::default();
                let stream = WritableStream::new(
                    &ctx,
                    recorder.sink(&ctx),
                    QueuingStrategy::new().with_high_water_mark(2.0),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();

                let first = writer.write("a");
                let second = writer.write("b");
                second.set_is_handled();
                ctx.execute_pending_jobs();
                assert_eq!(recorder.log(), ["write a"]);

                let abort = writer.abort("stop");
                assert_eq!(
                    stream.state(),
                    WritableStreamState::Erroring(Value::from("stop"))
                );
                // Aborting again while erroring returns the same request.
                assert!(abort.ptr_eq(&writer.abort("again")));
                ctx.execute_pending_jobs();
                assert_eq!(abort.state(), PromiseState::Pending);
                assert!(ctx.settle(&writer.ready()).await.is_err());

                // The sink's abort runs only after the in-flight write settles.
                recorder.finish_next_write();
                assert_eq!(ctx.settle(&first).await, Ok(()));
                assert_eq!(ctx.settle(&abort).await, Ok(()));
                assert_eq!(ctx.settle(&second).await, Err(Value::from("stop")));
                assert_eq!(recorder.log(), ["write a", "abort stop"]);
                assert_eq!(
                    stream.state(),
                    WritableStreamState::Errored(Value::from("stop"))
                );
                assert_eq!(
                    ctx.settle(&writer.closed()).await,
                    Err(Value::from("stop"))
                );
                assert_eq!(writer.desired_size(), Ok(None));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_start_rejection_errors_stream() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let sink = UnderlyingSink::new().with_start({
                    let ctx = ctx.clone();
                    move |_controller| Ok(Promise::rejected(&ctx, "bad start"))
                });
                let stream =
                    WritableStream::new(&ctx, sink, QueuingStrategy::default()).unwrap();
                let writer = stream.get_writer().unwrap();

                let write = writer.write("a");
                assert_eq!(ctx.settle(&write).await, Err(Value::from("bad start")));
                assert_eq!(stream.stored_error(), Some(Value::from("bad start")));
                assert!(ctx.settle(&writer.closed()).await.is_err());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_close_rejection_errors_stream() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let closed = Rc::new(Cell::new(0));
                let sink = UnderlyingSink::new().with_close({
                    let closed = closed.clone();
                    move || {
                        closed.set(closed.get() + 1);
                        Err(Error::thrown("close failed"))
                    }
                });
                let stream =
                    WritableStream::new(&ctx, sink, QueuingStrategy::default()).unwrap();

                let reason = ctx.settle(&stream.close()).await.unwrap_err();
                assert_eq!(reason, Value::from("close failed"));
                assert_eq!(closed.get(), 1);
                assert_eq!(
                    stream.state(),
                    WritableStreamState::Errored(Value::from("close failed"))
                );

                // Aborting or closing an errored stream does not reach the sink again.
                assert_eq!(ctx.settle(&stream.abort("late")).await, Ok(()));
                let reason = ctx.settle(&stream.close()).await.unwrap_err();
                assert!(Error::from(reason).is_state());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_locked_stream_rejects_abort_and_close() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream =
                    WritableStream::new(&ctx, UnderlyingSink::new(), QueuingStrategy::default())
                        .unwrap();
                let _writer = stream.get_writer().unwrap();

                let reason = ctx.settle(&stream.abort("x")).await.unwrap_err();
                assert!(Error::from(reason).is_state());
                let reason = ctx.settle(&stream.close()).await.unwrap_err();
                assert!(Error::from(reason).is_state());
                assert!(stream.is_writable());

                let invalid = WritableStream::new(
                    &ctx,
                    UnderlyingSink::new(),
                    QueuingStrategy::new().with_high_water_mark(-1.0),
                );
                assert!(invalid.unwrap_err().is_validation());
            })
        })
        .await;
    }
}
