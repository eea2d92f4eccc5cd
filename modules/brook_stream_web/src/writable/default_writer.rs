use std::{cell::RefCell, fmt, rc::Rc};

use brook_utils::{
    promise::promise_rejected_with, result::ResultExt, Ctx, Error, Promise, ResolveablePromise,
    Result, Value,
};

use super::{WritableStream, WritableStreamState};

/// Writes chunks into a writable stream it holds locked.
#[derive(Clone)]
pub struct WritableStreamDefaultWriter(Rc<RefCell<WritableStreamDefaultWriterInner>>);

struct WritableStreamDefaultWriterInner {
    closed_promise: ResolveablePromise<()>,
    ready_promise: ResolveablePromise<()>,
    stream: Option<WritableStream>,
    ctx: Ctx,
}

impl WritableStreamDefaultWriter {
    /// Locks `stream` to a new writer. Fails if the stream is already locked.
    pub fn new(stream: &WritableStream) -> Result<Self> {
        Self::set_up_writable_stream_default_writer(stream)
    }

    /// Settles once the stream is closed, or rejects when it errors or the writer is released.
    pub fn closed(&self) -> Promise<()> {
        self.0.borrow().closed_promise.promise.clone()
    }

    /// Pending while the stream applies backpressure.
    pub fn ready(&self) -> Promise<()> {
        self.0.borrow().ready_promise.promise.clone()
    }

    /// `None` while the stream is erroring or errored.
    pub fn desired_size(&self) -> Result<Option<f64>> {
        // If this.[[stream]] is undefined, throw a TypeError exception.
        let stream = self
            .stream()
            .or_throw_state("Cannot get the desired size of a released writer")?;

        // Return ! WritableStreamDefaultWriterGetDesiredSize(this).
        Ok(Self::writable_stream_default_writer_get_desired_size(
            &stream,
        ))
    }

    pub fn abort(&self, reason: impl Into<Value>) -> Promise<()> {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        let Some(stream) = self.stream() else {
            return promise_rejected_with(
                &self.ctx(),
                Error::state("Cannot abort a stream using a released writer"),
            );
        };

        // Return ! WritableStreamDefaultWriterAbort(this, reason).
        stream.writable_stream_abort(reason.into())
    }

    pub fn close(&self) -> Promise<()> {
        // Let stream be this.[[stream]].
        // If stream is undefined, return a promise rejected with a TypeError exception.
        let Some(stream) = self.stream() else {
            return promise_rejected_with(
                &self.ctx(),
                Error::state("Cannot close a stream using a released writer"),
            );
        };

        // If ! WritableStreamCloseQueuedOrInFlight(stream) is true, return a promise rejected with a TypeError exception.
        if stream.writable_stream_close_queued_or_in_flight() {
            return promise_rejected_with(
                &self.ctx(),
                Error::state("Cannot close an already-closing stream"),
            );
        }

        // Return ! WritableStreamDefaultWriterClose(this).
        stream.writable_stream_close()
    }

    pub fn release_lock(&self) {
        // Let stream be this.[[stream]].
        // If stream is undefined, return.
        if self.stream().is_none() {
            return;
        }

        // Perform ! WritableStreamDefaultWriterRelease(this).
        self.writable_stream_default_writer_release()
    }

    /// Queues `chunk`. The promise settles once the sink has processed it.
    pub fn write(&self, chunk: impl Into<Value>) -> Promise<()> {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        if self.stream().is_none() {
            return promise_rejected_with(
                &self.ctx(),
                Error::state("Cannot write to a stream using a released writer"),
            );
        }

        // Return ! WritableStreamDefaultWriterWrite(this, chunk).
        self.writable_stream_default_writer_write(chunk.into())
    }

    fn set_up_writable_stream_default_writer(stream: &WritableStream) -> Result<Self> {
        // If ! IsWritableStreamLocked(stream) is true, throw a TypeError exception.
        if stream.is_writable_stream_locked() {
            return Err(Error::state(
                "This stream has already been locked for exclusive writing by another writer",
            ));
        }

        let ctx = stream.ctx();

        // Let state be stream.[[state]].
        let (ready_promise, closed_promise) = match stream.state() {
            // If state is "writable",
            WritableStreamState::Writable => {
                // If ! WritableStreamCloseQueuedOrInFlight(stream) is false and stream.[[backpressure]] is true, set writer.[[readyPromise]] to a new promise.
                let ready_promise = if !stream.writable_stream_close_queued_or_in_flight()
                    && stream.backpressure()
                {
                    ResolveablePromise::new(&ctx)
                } else {
                    // Otherwise, set writer.[[readyPromise]] to a promise resolved with undefined.
                    ResolveablePromise::resolved(&ctx, ())
                };
                // Set writer.[[closedPromise]] to a new promise.
                (ready_promise, ResolveablePromise::new(&ctx))
            },
            // Otherwise, if state is "erroring",
            WritableStreamState::Erroring(stored_error) => {
                // Set writer.[[readyPromise]] to a promise rejected with stream.[[storedError]].
                // Set writer.[[readyPromise]].[[PromiseIsHandled]] to true.
                let ready_promise = ResolveablePromise::rejected(&ctx, stored_error);
                ready_promise.set_is_handled();
                // Set writer.[[closedPromise]] to a new promise.
                (ready_promise, ResolveablePromise::new(&ctx))
            },
            // Otherwise, if state is "closed",
            // Set writer.[[readyPromise]] to a promise resolved with undefined.
            // Set writer.[[closedPromise]] to a promise resolved with undefined.
            WritableStreamState::Closed => (
                ResolveablePromise::resolved(&ctx, ()),
                ResolveablePromise::resolved(&ctx, ()),
            ),
            // Otherwise,
            WritableStreamState::Errored(stored_error) => {
                // Set writer.[[readyPromise]] to a promise rejected with storedError.
                // Set writer.[[readyPromise]].[[PromiseIsHandled]] to true.
                let ready_promise = ResolveablePromise::rejected(&ctx, stored_error.clone());
                ready_promise.set_is_handled();
                // Set writer.[[closedPromise]] to a promise rejected with storedError.
                // Set writer.[[closedPromise]].[[PromiseIsHandled]] to true.
                let closed_promise = ResolveablePromise::rejected(&ctx, stored_error);
                closed_promise.set_is_handled();
                (ready_promise, closed_promise)
            },
        };

        // Set writer.[[stream]] to stream.
        let writer = Self(Rc::new(RefCell::new(WritableStreamDefaultWriterInner {
            closed_promise,
            ready_promise,
            stream: Some(stream.clone()),
            ctx,
        })));

        // Set stream.[[writer]] to writer.
        stream.0.borrow_mut().writer = Some(writer.clone());

        Ok(writer)
    }

    fn ctx(&self) -> Ctx {
        self.0.borrow().ctx.clone()
    }

    pub(crate) fn stream(&self) -> Option<WritableStream> {
        self.0.borrow().stream.clone()
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(super) fn resolve_ready_promise(&self) {
        self.0.borrow().ready_promise.resolve_undefined()
    }

    // Backpressure was applied, so the next `ready` must wait for it to be relieved.
    pub(super) fn reset_ready_promise(&self) {
        let mut inner = self.0.borrow_mut();
        inner.ready_promise = ResolveablePromise::new(&inner.ctx);
    }

    pub(super) fn resolve_closed_promise(&self) {
        self.0.borrow().closed_promise.resolve_undefined()
    }

    pub(super) fn reject_closed_promise(&self, reason: Value) {
        let inner = self.0.borrow();
        inner.closed_promise.reject(reason);
        inner.closed_promise.set_is_handled();
    }

    pub(crate) fn writable_stream_default_writer_close_with_error_propagation(&self) -> Promise<()> {
        let ctx = self.ctx();

        // Let stream be writer.[[stream]].
        let Some(stream) = self.stream() else {
            return promise_rejected_with(
                &ctx,
                Error::state("Cannot close a stream using a released writer"),
            );
        };

        // Let state be stream.[[state]].
        let state = stream.state();

        // If ! WritableStreamCloseQueuedOrInFlight(stream) is true or state is "closed", return a promise resolved with undefined.
        if stream.writable_stream_close_queued_or_in_flight()
            || matches!(state, WritableStreamState::Closed)
        {
            return Promise::resolved(&ctx, ());
        }

        // If state is "errored", return a promise rejected with stream.[[storedError]].
        if let WritableStreamState::Errored(stored_error) = state {
            return promise_rejected_with(&ctx, stored_error);
        }

        // Return ! WritableStreamDefaultWriterClose(writer).
        stream.writable_stream_close()
    }

    pub(super) fn writable_stream_default_writer_ensure_closed_promise_rejected(
        &self,
        error: Value,
    ) {
        let mut inner = self.0.borrow_mut();
        // If writer.[[closedPromise]].[[PromiseState]] is "pending", reject writer.[[closedPromise]] with error.
        if inner.closed_promise.is_pending() {
            inner.closed_promise.reject(error);
        } else {
            // Otherwise, set writer.[[closedPromise]] to a promise rejected with error.
            inner.closed_promise = ResolveablePromise::rejected(&inner.ctx, error);
        }

        // Set writer.[[closedPromise]].[[PromiseIsHandled]] to true.
        inner.closed_promise.set_is_handled();
    }

    pub(super) fn writable_stream_default_writer_ensure_ready_promise_rejected(&self, error: Value) {
        let mut inner = self.0.borrow_mut();
        // If writer.[[readyPromise]].[[PromiseState]] is "pending", reject writer.[[readyPromise]] with error.
        if inner.ready_promise.is_pending() {
            inner.ready_promise.reject(error);
        } else {
            // Otherwise, set writer.[[readyPromise]] to a promise rejected with error.
            inner.ready_promise = ResolveablePromise::rejected(&inner.ctx, error);
        }

        // Set writer.[[readyPromise]].[[PromiseIsHandled]] to true.
        inner.ready_promise.set_is_handled();
    }

    fn writable_stream_default_writer_get_desired_size(stream: &WritableStream) -> Option<f64> {
        // Let state be stream.[[state]].
        match stream.state() {
            // If state is "errored" or "erroring", return null.
            WritableStreamState::Errored(_) | WritableStreamState::Erroring(_) => None,
            // If state is "closed", return 0.
            WritableStreamState::Closed => Some(0.0),
            // Return ! WritableStreamDefaultControllerGetDesiredSize(stream.[[controller]]).
            WritableStreamState::Writable => Some(
                stream
                    .controller()
                    .writable_stream_default_controller_get_desired_size(),
            ),
        }
    }

    pub(crate) fn writable_stream_default_writer_release(&self) {
        // Let stream be writer.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // Let releasedError be a new TypeError.
        let released_error: Value =
            Error::state("Writer was released and can no longer be used to monitor the stream's closedness").into();

        // Perform ! WritableStreamDefaultWriterEnsureReadyPromiseRejected(writer, releasedError).
        self.writable_stream_default_writer_ensure_ready_promise_rejected(released_error.clone());

        // Perform ! WritableStreamDefaultWriterEnsureClosedPromiseRejected(writer, releasedError).
        self.writable_stream_default_writer_ensure_closed_promise_rejected(released_error);

        // Set stream.[[writer]] to undefined.
        stream.0.borrow_mut().writer = None;

        // Set writer.[[stream]] to undefined.
        self.0.borrow_mut().stream = None;
    }

    pub(crate) fn writable_stream_default_writer_write(&self, chunk: Value) -> Promise<()> {
        let ctx = self.ctx();

        // Let stream be writer.[[stream]].
        let Some(stream) = self.stream() else {
            return promise_rejected_with(
                &ctx,
                Error::state("Cannot write to a stream using a released writer"),
            );
        };

        // Let controller be stream.[[controller]].
        let controller = stream.controller();

        // Let chunkSize be ! WritableStreamDefaultControllerGetChunkSize(controller, chunk).
        let chunk_size = controller.writable_stream_default_controller_get_chunk_size(&chunk);

        // If stream is not equal to writer.[[stream]], return a promise rejected with a TypeError exception.
        if !self.stream().is_some_and(|current| current.ptr_eq(&stream)) {
            return promise_rejected_with(
                &ctx,
                Error::state("Writer was released while sizing the chunk"),
            );
        }

        // Let state be stream.[[state]].
        match stream.state() {
            // If state is "errored", return a promise rejected with stream.[[storedError]].
            WritableStreamState::Errored(stored_error) => {
                return promise_rejected_with(&ctx, stored_error)
            },
            // If ! WritableStreamCloseQueuedOrInFlight(stream) is true or state is "closed", return a promise rejected with a TypeError exception indicating that the stream is closing or closed.
            WritableStreamState::Closed => {
                return promise_rejected_with(
                    &ctx,
                    Error::state("The stream is closing or closed and cannot be written to"),
                )
            },
            _ if stream.writable_stream_close_queued_or_in_flight() => {
                return promise_rejected_with(
                    &ctx,
                    Error::state("The stream is closing or closed and cannot be written to"),
                )
            },
            // If state is "erroring", return a promise rejected with stream.[[storedError]].
            WritableStreamState::Erroring(stored_error) => {
                return promise_rejected_with(&ctx, stored_error)
            },
            WritableStreamState::Writable => {},
        }

        // Let promise be ! WritableStreamAddWriteRequest(stream).
        let promise = stream.writable_stream_add_write_request();

        // Perform ! WritableStreamDefaultControllerWrite(controller, chunk, chunkSize).
        controller.writable_stream_default_controller_write(chunk, chunk_size);

        // Return promise.
        promise
    }
}

impl fmt::Debug for WritableStreamDefaultWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStreamDefaultWriter")
            .field("released", &self.0.borrow().stream.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use brook_test::test_async_with;
    use brook_utils::PromiseState;

    use super::*;
    use crate::{queuing_strategy::QueuingStrategy, writable::UnderlyingSink};

    #[tokio::test]
    async fn test_ready_tracks_backpressure() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let pending = ResolveablePromise::new(&ctx);
                let stream = WritableStream::new(
                    &ctx,
                    UnderlyingSink::new().with_write({
                        let pending = pending.clone();
                        move |_chunk, _controller| Ok(pending.promise.clone())
                    }),
                    QueuingStrategy::new().with_high_water_mark(1.0),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                assert_eq!(writer.desired_size(), Ok(Some(1.0)));
                assert_eq!(ctx.settle(&writer.ready()).await, Ok(()));

                let write = writer.write("a");
                assert_eq!(writer.desired_size(), Ok(Some(0.0)));
                let ready = writer.ready();
                ctx.execute_pending_jobs();
                assert_eq!(ready.state(), PromiseState::Pending);

                pending.resolve_undefined();
                assert_eq!(ctx.settle(&write).await, Ok(()));
                assert_eq!(ctx.settle(&ready).await, Ok(()));
                assert_eq!(writer.desired_size(), Ok(Some(1.0)));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_release_rejects_closed_and_ready() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream =
                    WritableStream::new(&ctx, UnderlyingSink::new(), QueuingStrategy::default())
                        .unwrap();
                let writer = stream.get_writer().unwrap();
                assert!(stream.locked());
                assert!(stream.get_writer().unwrap_err().is_state());

                writer.release_lock();
                assert!(!stream.locked());
                assert!(ctx.settle(&writer.closed()).await.is_err());
                assert!(ctx.settle(&writer.ready()).await.is_err());
                assert!(writer.desired_size().unwrap_err().is_state());

                let reason = ctx.settle(&writer.write("a")).await.unwrap_err();
                assert!(Error::from(reason).is_state());

                // Releasing twice is a no-op.
                writer.release_lock();
                let writer = stream.get_writer().unwrap();
                assert_eq!(ctx.settle(&writer.close()).await, Ok(()));
                assert_eq!(ctx.settle(&writer.closed()).await, Ok(()));
                assert_eq!(writer.desired_size(), Ok(Some(0.0)));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_writes_after_close_are_rejected() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream =
                    WritableStream::new(&ctx, UnderlyingSink::new(), QueuingStrategy::default())
                        .unwrap();
                let writer = stream.get_writer().unwrap();
                let close = writer.close();

                let reason = ctx.settle(&writer.write("late")).await.unwrap_err();
                assert!(Error::from(reason).is_state());
                let reason = ctx.settle(&writer.close()).await.unwrap_err();
                assert!(Error::from(reason).is_state());
                let propagated = writer.writable_stream_default_writer_close_with_error_propagation();
                assert_eq!(ctx.settle(&propagated).await, Ok(()));
                assert_eq!(ctx.settle(&close).await, Ok(()));
                assert_eq!(stream.state(), WritableStreamState::Closed);
            })
        })
        .await;
    }
}
