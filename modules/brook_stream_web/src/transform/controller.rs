use std::{cell::RefCell, fmt, rc::Rc};

use brook_utils::{
    promise::{promise_rejected_with, promise_resolved_with, upon_promise, upon_promise_chain},
    result::ResultExt,
    Error, Promise, ResolveablePromise, Result, Value,
};
use tracing::debug;

use super::stream::TransformStreamRef;
use crate::{
    readable::{flatten, CancelAlgorithm},
    writable::WritableStreamState,
};

pub(super) type TransformFn =
    dyn Fn(Value, TransformStreamDefaultController) -> Result<Promise<()>>;
pub(super) type FlushFn = dyn Fn(TransformStreamDefaultController) -> Result<Promise<()>>;

/// Handed to a [`Transformer`](super::Transformer) to feed the readable side or tear the
/// whole stream down.
#[derive(Clone)]
pub struct TransformStreamDefaultController(Rc<RefCell<TransformStreamDefaultControllerInner>>);

struct TransformStreamDefaultControllerInner {
    stream: TransformStreamRef,
    transform_algorithm: Option<TransformAlgorithm>,
    flush_algorithm: Option<FlushAlgorithm>,
    cancel_algorithm: Option<CancelAlgorithm>,
    finish_promise: Option<Promise<()>>,
}

impl TransformStreamDefaultController {
    pub(super) fn new(
        stream: TransformStreamRef,
        transform_algorithm: TransformAlgorithm,
        flush_algorithm: FlushAlgorithm,
        cancel_algorithm: CancelAlgorithm,
    ) -> Self {
        Self(Rc::new(RefCell::new(TransformStreamDefaultControllerInner {
            stream,
            transform_algorithm: Some(transform_algorithm),
            flush_algorithm: Some(flush_algorithm),
            cancel_algorithm: Some(cancel_algorithm),
            finish_promise: None,
        })))
    }

    /// The desired size of the readable side's queue.
    pub fn desired_size(&self) -> Option<f64> {
        // Let readableController be this.[[stream]].[[readable]].[[controller]].
        // Return ! ReadableStreamDefaultControllerGetDesiredSize(readableController).
        self.stream()
            .readable_controller()?
            .readable_stream_default_controller_get_desired_size()
    }

    /// Enqueues `chunk` on the readable side.
    pub fn enqueue(&self, chunk: impl Into<Value>) -> Result<()> {
        // Perform ? TransformStreamDefaultControllerEnqueue(this, chunk).
        self.transform_stream_default_controller_enqueue(chunk.into())
    }

    /// Errors both sides.
    pub fn error(&self, e: impl Into<Value>) {
        // Perform ? TransformStreamDefaultControllerError(this, e).
        self.transform_stream_error(e.into())
    }

    /// Closes the readable side and errors the writable side.
    pub fn terminate(&self) {
        // Perform ? TransformStreamDefaultControllerTerminate(this).
        let stream = self.stream();

        // Perform ! ReadableStreamDefaultControllerClose(readableController).
        if let Some(readable_controller) = stream.readable_controller() {
            readable_controller.readable_stream_default_controller_close();
        }

        debug!("Transform stream terminated");

        // Let error be a TypeError exception indicating that the stream has been terminated.
        let error = Error::state("The transform stream has been terminated");

        // Perform ! TransformStreamErrorWritableAndUnblockWrite(stream, error).
        self.transform_stream_error_writable_and_unblock_write(error.into());
    }

    fn stream(&self) -> TransformStreamRef {
        self.0.borrow().stream.clone()
    }

    fn finish_promise(&self) -> Option<Promise<()>> {
        self.0.borrow().finish_promise.clone()
    }

    fn new_finish_promise(&self) -> ResolveablePromise<()> {
        let finish_promise = ResolveablePromise::new(&self.stream().ctx());
        self.0.borrow_mut().finish_promise = Some(finish_promise.promise.clone());
        finish_promise
    }

    fn clear_algorithms(&self) {
        let mut inner = self.0.borrow_mut();
        // Set controller.[[transformAlgorithm]] to undefined.
        inner.transform_algorithm = None;
        // Set controller.[[flushAlgorithm]] to undefined.
        inner.flush_algorithm = None;
        // Set controller.[[cancelAlgorithm]] to undefined.
        inner.cancel_algorithm = None;
    }

    fn call_cancel_algorithm(&self, reason: Value) -> Promise<()> {
        let ctx = self.stream().ctx();
        let cancel_algorithm = self.0.borrow().cancel_algorithm.clone();
        match cancel_algorithm {
            Some(cancel_algorithm) => cancel_algorithm.call(&ctx, reason),
            None => Promise::resolved(&ctx, ()),
        }
    }

    fn transform_stream_default_controller_enqueue(&self, chunk: Value) -> Result<()> {
        // Let stream be controller.[[stream]].
        // Let readableController be stream.[[readable]].[[controller]].
        let stream = self.stream();
        let readable_controller = stream
            .readable_controller()
            .or_throw_state("The readable side is not set up")?;

        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(readableController) is false, throw a TypeError exception.
        if !readable_controller.readable_stream_default_controller_can_close_or_enqueue() {
            return Err(Error::state(
                "Readable side is not in a state that permits enqueue",
            ));
        }

        // Let enqueueResult be ReadableStreamDefaultControllerEnqueue(readableController, chunk).
        // If enqueueResult is an abrupt completion,
        if let Err(err) = readable_controller.readable_stream_default_controller_enqueue(chunk) {
            // Perform ! TransformStreamErrorWritableAndUnblockWrite(stream, enqueueResult.[[Value]]).
            self.transform_stream_error_writable_and_unblock_write(err.clone().into());
            // Throw stream.[[readable]].[[storedError]].
            return Err(stream
                .readable()
                .and_then(|readable| readable.stored_error())
                .map(Error::from)
                .unwrap_or(err));
        }

        // Let backpressure be ! ReadableStreamDefaultControllerHasBackpressure(readableController).
        let backpressure = readable_controller.readable_stream_default_controller_has_backpressure();

        // If backpressure is not stream.[[backpressure]],
        if backpressure != stream.backpressure() {
            // Assert: backpressure is true.
            // Perform ! TransformStreamSetBackpressure(stream, true).
            stream.set_backpressure(true);
        }

        Ok(())
    }

    fn transform_stream_error(&self, e: Value) {
        debug!("Transform stream errored: {}", e);

        // Perform ! ReadableStreamDefaultControllerError(stream.[[readable]].[[controller]], e).
        if let Some(readable_controller) = self.stream().readable_controller() {
            readable_controller.readable_stream_default_controller_error(e.clone());
        }

        // Perform ! TransformStreamErrorWritableAndUnblockWrite(stream, e).
        self.transform_stream_error_writable_and_unblock_write(e)
    }

    fn transform_stream_error_writable_and_unblock_write(&self, e: Value) {
        // Perform ! TransformStreamDefaultControllerClearAlgorithms(stream.[[controller]]).
        self.clear_algorithms();

        let stream = self.stream();

        // Perform ! WritableStreamDefaultControllerErrorIfNeeded(stream.[[writable]].[[controller]], e).
        if let Some(writable) = stream.writable() {
            writable.controller().error(e);
        }

        // Perform ! TransformStreamUnblockWrite(stream).
        stream.unblock_write();
    }

    fn perform_transform(&self, chunk: Value) -> Promise<()> {
        let ctx = self.stream().ctx();
        let transform_algorithm = self.0.borrow().transform_algorithm.clone();

        // Let transformPromise be the result of performing controller.[[transformAlgorithm]], passing chunk.
        let transform_promise = match transform_algorithm {
            // Let result be TransformStreamDefaultControllerEnqueue(controller, chunk).
            // If result is an abrupt completion, return a promise rejected with result.[[Value]].
            // Otherwise, return a promise resolved with undefined.
            Some(TransformAlgorithm::Identity) => promise_resolved_with(
                &ctx,
                self.transform_stream_default_controller_enqueue(chunk),
            ),
            Some(TransformAlgorithm::Function(transform)) => {
                flatten(&ctx, transform(chunk, self.clone()))
            },
            None => promise_rejected_with(
                &ctx,
                Error::state("The transform stream has been torn down"),
            ),
        };

        let controller = self.clone();
        // Return the result of reacting to transformPromise with the following rejection steps given the argument r:
        upon_promise(&transform_promise, move |result| {
            if let Err(r) = &result {
                // Perform ! TransformStreamError(controller.[[stream]], r).
                controller.transform_stream_error(r.clone());
            }
            // Throw r.
            result.map_err(Error::from)
        })
    }

    pub(super) fn sink_write(&self, chunk: Value) -> Promise<()> {
        let stream = self.stream();

        // If stream.[[backpressure]] is true,
        if stream.backpressure() {
            // Let backpressureChangePromise be stream.[[backpressureChangePromise]].
            let backpressure_change_promise = stream.backpressure_change_promise();
            let controller = self.clone();

            // Return the result of reacting to backpressureChangePromise with the following fulfillment steps:
            return upon_promise_chain(&backpressure_change_promise, move |result| {
                result.map_err(Error::from)?;

                // Let writable be stream.[[writable]].
                // Let state be writable.[[state]].
                // If state is "erroring", throw writable.[[storedError]].
                if let Some(WritableStreamState::Erroring(stored_error)) =
                    stream.writable().map(|writable| writable.state())
                {
                    return Err(stored_error.into());
                }

                // Return ! TransformStreamDefaultControllerPerformTransform(controller, chunk).
                Ok(controller.perform_transform(chunk))
            });
        }

        // Return ! TransformStreamDefaultControllerPerformTransform(controller, chunk).
        self.perform_transform(chunk)
    }

    pub(super) fn sink_abort(&self, reason: Value) -> Promise<()> {
        // If controller.[[finishPromise]] is not undefined, return controller.[[finishPromise]].
        if let Some(finish_promise) = self.finish_promise() {
            return finish_promise;
        }

        debug!("Transform stream writable side aborted");

        // Let readable be stream.[[readable]].
        let stream = self.stream();

        // Let controller.[[finishPromise]] be a new promise.
        let finish_promise = self.new_finish_promise();

        // Let cancelPromise be the result of performing controller.[[cancelAlgorithm]], passing reason.
        let cancel_promise = self.call_cancel_algorithm(reason.clone());

        // Perform ! TransformStreamDefaultControllerClearAlgorithms(controller).
        self.clear_algorithms();

        // React to cancelPromise:
        cancel_promise.react({
            let finish_promise = finish_promise.clone();
            move |result| {
                let readable_controller = stream.readable_controller();
                match result {
                    // If cancelPromise was fulfilled, then:
                    Ok(()) => {
                        // If readable.[[state]] is "errored", reject controller.[[finishPromise]] with readable.[[storedError]].
                        if let Some(stored_error) =
                            stream.readable().and_then(|readable| readable.stored_error())
                        {
                            finish_promise.reject(stored_error);
                            return;
                        }
                        // Perform ! ReadableStreamDefaultControllerError(readable.[[controller]], reason).
                        if let Some(readable_controller) = readable_controller {
                            readable_controller.readable_stream_default_controller_error(reason);
                        }
                        // Resolve controller.[[finishPromise]] with undefined.
                        finish_promise.resolve_undefined();
                    },
                    // If cancelPromise was rejected with reason r, then:
                    Err(r) => {
                        // Perform ! ReadableStreamDefaultControllerError(readable.[[controller]], r).
                        if let Some(readable_controller) = readable_controller {
                            readable_controller.readable_stream_default_controller_error(r.clone());
                        }
                        // Reject controller.[[finishPromise]] with r.
                        finish_promise.reject(r);
                    },
                }
            }
        });

        // Return controller.[[finishPromise]].
        finish_promise.promise
    }

    pub(super) fn sink_close(&self) -> Promise<()> {
        // If controller.[[finishPromise]] is not undefined, return controller.[[finishPromise]].
        if let Some(finish_promise) = self.finish_promise() {
            return finish_promise;
        }

        // Let readable be stream.[[readable]].
        let stream = self.stream();
        let ctx = stream.ctx();

        // Let controller.[[finishPromise]] be a new promise.
        let finish_promise = self.new_finish_promise();

        // Let flushPromise be the result of performing controller.[[flushAlgorithm]].
        let flush_algorithm = self.0.borrow().flush_algorithm.clone();
        let flush_promise = match flush_algorithm {
            Some(FlushAlgorithm::Function(flush)) => flatten(&ctx, flush(self.clone())),
            _ => Promise::resolved(&ctx, ()),
        };

        // Perform ! TransformStreamDefaultControllerClearAlgorithms(controller).
        self.clear_algorithms();

        // React to flushPromise:
        flush_promise.react({
            let finish_promise = finish_promise.clone();
            move |result| {
                let readable_controller = stream.readable_controller();
                match result {
                    // If flushPromise was fulfilled, then:
                    Ok(()) => {
                        // If readable.[[state]] is "errored", reject controller.[[finishPromise]] with readable.[[storedError]].
                        if let Some(stored_error) =
                            stream.readable().and_then(|readable| readable.stored_error())
                        {
                            finish_promise.reject(stored_error);
                            return;
                        }
                        // Perform ! ReadableStreamDefaultControllerClose(readable.[[controller]]).
                        if let Some(readable_controller) = readable_controller {
                            readable_controller.readable_stream_default_controller_close();
                        }
                        // Resolve controller.[[finishPromise]] with undefined.
                        finish_promise.resolve_undefined();
                    },
                    // If flushPromise was rejected with reason r, then:
                    Err(r) => {
                        // Perform ! ReadableStreamDefaultControllerError(readable.[[controller]], r).
                        if let Some(readable_controller) = readable_controller {
                            readable_controller.readable_stream_default_controller_error(r.clone());
                        }
                        // Reject controller.[[finishPromise]] with r.
                        finish_promise.reject(r);
                    },
                }
            }
        });

        // Return controller.[[finishPromise]].
        finish_promise.promise
    }

    pub(super) fn source_pull(&self) -> Promise<()> {
        let stream = self.stream();

        // Assert: stream.[[backpressure]] is true.
        // Perform ! TransformStreamSetBackpressure(stream, false).
        stream.set_backpressure(false);

        // Return stream.[[backpressureChangePromise]].
        stream.backpressure_change_promise()
    }

    pub(super) fn source_cancel(&self, reason: Value) -> Promise<()> {
        // If controller.[[finishPromise]] is not undefined, return controller.[[finishPromise]].
        if let Some(finish_promise) = self.finish_promise() {
            return finish_promise;
        }

        debug!("Transform stream readable side cancelled");

        // Let writable be stream.[[writable]].
        let stream = self.stream();

        // Let controller.[[finishPromise]] be a new promise.
        let finish_promise = self.new_finish_promise();

        // Let cancelPromise be the result of performing controller.[[cancelAlgorithm]], passing reason.
        let cancel_promise = self.call_cancel_algorithm(reason.clone());

        // Perform ! TransformStreamDefaultControllerClearAlgorithms(controller).
        self.clear_algorithms();

        // React to cancelPromise:
        cancel_promise.react({
            let finish_promise = finish_promise.clone();
            move |result| {
                let writable = stream.writable();
                match result {
                    // If cancelPromise was fulfilled, then:
                    Ok(()) => {
                        // If writable.[[state]] is "errored", reject controller.[[finishPromise]] with writable.[[storedError]].
                        if let Some(WritableStreamState::Errored(stored_error)) =
                            writable.as_ref().map(|writable| writable.state())
                        {
                            finish_promise.reject(stored_error);
                            return;
                        }
                        // Perform ! WritableStreamDefaultControllerErrorIfNeeded(writable.[[controller]], reason).
                        if let Some(writable) = writable {
                            writable.controller().error(reason);
                        }
                        // Perform ! TransformStreamUnblockWrite(stream).
                        stream.unblock_write();
                        // Resolve controller.[[finishPromise]] with undefined.
                        finish_promise.resolve_undefined();
                    },
                    // If cancelPromise was rejected with reason r, then:
                    Err(r) => {
                        // Perform ! WritableStreamDefaultControllerErrorIfNeeded(writable.[[controller]], r).
                        if let Some(writable) = writable {
                            writable.controller().error(r.clone());
                        }
                        // Perform ! TransformStreamUnblockWrite(stream).
                        stream.unblock_write();
                        // Reject controller.[[finishPromise]] with r.
                        finish_promise.reject(r);
                    },
                }
            }
        });

        // Return controller.[[finishPromise]].
        finish_promise.promise
    }
}

impl fmt::Debug for TransformStreamDefaultController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("TransformStreamDefaultController")
            .field("backpressure", &inner.stream.backpressure())
            .field("finishing", &inner.finish_promise.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub(super) enum TransformAlgorithm {
    Identity,
    Function(Rc<TransformFn>),
}

#[derive(Clone)]
pub(super) enum FlushAlgorithm {
    ReturnPromiseUndefined,
    Function(Rc<FlushFn>),
}
