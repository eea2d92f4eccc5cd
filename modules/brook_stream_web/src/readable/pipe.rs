use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use brook_abort::{AbortAlgorithmId, AbortSignal};
use brook_utils::{
    promise::{promise_rejected_with, upon_promise, upon_promise_chain, upon_promise_fulfilment},
    Ctx, Error, Promise, ResolveablePromise, Result, Value,
};
use tracing::{debug, trace};

use super::{
    ReadableStream, ReadableStreamDefaultReader, ReadableStreamReadRequest, ReadableStreamState,
};
use crate::{
    readable_writable_pair::ReadableWritablePair,
    writable::{WritableStream, WritableStreamDefaultWriter, WritableStreamState},
};

/// How [`ReadableStream::pipe_to`] reacts when either end finishes early.
#[derive(Clone, Default)]
pub struct StreamPipeOptions {
    /// Leave the destination open when the source closes.
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination errors or closes.
    pub prevent_cancel: bool,
    pub signal: Option<AbortSignal>,
}

impl ReadableStream {
    // Promise<undefined> pipeTo(WritableStream destination, optional StreamPipeOptions options = {});
    pub fn pipe_to(&self, destination: &WritableStream, options: StreamPipeOptions) -> Promise<()> {
        // If ! IsReadableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_readable_stream_locked() {
            return promise_rejected_with(
                &self.ctx(),
                Error::state("Cannot pipe a locked ReadableStream"),
            );
        }

        // If ! IsWritableStreamLocked(destination) is true, return a promise rejected with a TypeError exception.
        if destination.is_writable_stream_locked() {
            return promise_rejected_with(
                &self.ctx(),
                Error::state("Cannot pipe to a locked WritableStream"),
            );
        }

        // Return ! ReadableStreamPipeTo(this, destination, options["preventClose"], options["preventAbort"], options["preventCancel"], signal).
        self.readable_stream_pipe_to(destination, options)
    }

    // ReadableStream pipeThrough(ReadableWritablePair transform, optional StreamPipeOptions options = {});
    pub fn pipe_through(
        &self,
        transform: impl Into<ReadableWritablePair>,
        options: StreamPipeOptions,
    ) -> Result<ReadableStream> {
        let transform = transform.into();

        // If ! IsReadableStreamLocked(this) is true, throw a TypeError exception.
        if self.is_readable_stream_locked() {
            return Err(Error::state("Cannot pipe a locked ReadableStream"));
        }

        // If ! IsWritableStreamLocked(transform["writable"]) is true, throw a TypeError exception.
        if transform.writable.is_writable_stream_locked() {
            return Err(Error::state("Cannot pipe to a locked WritableStream"));
        }

        // Let promise be ! ReadableStreamPipeTo(this, transform["writable"], options["preventClose"], options["preventAbort"], options["preventCancel"], signal).
        let promise = self.readable_stream_pipe_to(&transform.writable, options);

        // Set promise.[[PromiseIsHandled]] to true.
        promise.set_is_handled();

        // Return transform["readable"].
        Ok(transform.readable)
    }

    pub(crate) fn readable_stream_pipe_to(
        &self,
        dest: &WritableStream,
        options: StreamPipeOptions,
    ) -> Promise<()> {
        let ctx = self.ctx();

        // Let reader be ! AcquireReadableStreamDefaultReader(source).
        let reader = match ReadableStreamDefaultReader::new(self) {
            Ok(reader) => reader,
            Err(err) => return promise_rejected_with(&ctx, err),
        };

        // Let writer be ! AcquireWritableStreamDefaultWriter(dest).
        let writer = match WritableStreamDefaultWriter::new(dest) {
            Ok(writer) => writer,
            Err(err) => {
                reader.release_lock();
                return promise_rejected_with(&ctx, err);
            },
        };

        // Set source.[[disturbed]] to true.
        self.0.borrow_mut().disturbed = true;

        let pipe = PipeTo(Rc::new(PipeToInner {
            source: self.clone(),
            dest: dest.clone(),
            reader: reader.clone(),
            writer: writer.clone(),
            current_write: RefCell::new(Promise::resolved(&ctx, ())),
            // Let shuttingDown be false.
            shutting_down: Cell::new(false),
            prevent_close: options.prevent_close,
            prevent_abort: options.prevent_abort,
            prevent_cancel: options.prevent_cancel,
            signal: options.signal.clone(),
            abort_algorithm: Cell::new(None),
            // Let promise be a new promise.
            promise: ResolveablePromise::new(&ctx),
            ctx: ctx.clone(),
        }));

        // If signal is not undefined,
        if let Some(signal) = options.signal {
            // If signal is aborted, perform abortAlgorithm and return promise.
            if signal.aborted() {
                pipe.abort(signal.reason().unwrap_or_default());
                return pipe.0.promise.promise.clone();
            }

            // Add abortAlgorithm to signal.
            let id = signal.add_algorithm({
                let pipe = pipe.clone();
                move |signal| pipe.abort(signal.reason().unwrap_or_default())
            });
            pipe.0.abort_algorithm.set(Some(id));
        }

        debug!("Piping readable stream to writable stream");

        // Errors must be propagated forward
        PipeTo::is_or_becomes_errored(self.stored_error(), reader.closed(), {
            let pipe = pipe.clone();
            move |stored_error| pipe.on_source_errored(stored_error)
        });

        // Errors must be propagated backward
        let dest_stored_error = match dest.state() {
            WritableStreamState::Errored(stored_error) => Some(stored_error),
            _ => None,
        };
        PipeTo::is_or_becomes_errored(dest_stored_error, writer.closed(), {
            let pipe = pipe.clone();
            move |stored_error| pipe.on_dest_errored(stored_error)
        });

        // Closing must be propagated forward
        let source_closed = matches!(self.state(), ReadableStreamState::Closed);
        PipeTo::is_or_becomes_closed(source_closed, reader.closed(), {
            let pipe = pipe.clone();
            move || pipe.on_source_closed()
        });

        // Closing must be propagated backward
        if dest.writable_stream_close_queued_or_in_flight()
            || matches!(dest.state(), WritableStreamState::Closed)
        {
            pipe.on_dest_closed();
        }

        let promise = pipe.0.promise.promise.clone();
        pipe.pipe_loop();
        promise
    }
}

#[derive(Clone)]
struct PipeTo(Rc<PipeToInner>);

struct PipeToInner {
    source: ReadableStream,
    dest: WritableStream,
    reader: ReadableStreamDefaultReader,
    writer: WritableStreamDefaultWriter,
    current_write: RefCell<Promise<()>>,
    shutting_down: Cell<bool>,
    prevent_close: bool,
    prevent_abort: bool,
    prevent_cancel: bool,
    signal: Option<AbortSignal>,
    abort_algorithm: Cell<Option<AbortAlgorithmId>>,
    promise: ResolveablePromise<()>,
    ctx: Ctx,
}

type ShutdownAction = Box<dyn FnOnce() -> Promise<()>>;

impl PipeTo {
    fn abort(&self, error: Value) {
        let ctx = self.0.ctx.clone();

        // Let actions be an empty ordered set.
        let mut actions: Vec<ShutdownAction> = Vec::new();

        // If preventAbort is false, append the following action to actions:
        if !self.0.prevent_abort {
            let dest = self.0.dest.clone();
            let error = error.clone();
            let ctx = ctx.clone();
            actions.push(Box::new(move || {
                // If dest.[[state]] is "writable", return ! WritableStreamAbort(dest, error).
                if dest.is_writable() {
                    dest.writable_stream_abort(error)
                } else {
                    // Otherwise, return a promise resolved with undefined.
                    Promise::resolved(&ctx, ())
                }
            }));
        }

        // If preventCancel is false, append the following action action to actions:
        if !self.0.prevent_cancel {
            let source = self.0.source.clone();
            let error = error.clone();
            let ctx = ctx.clone();
            actions.push(Box::new(move || {
                // If source.[[state]] is "readable", return ! ReadableStreamCancel(source, error).
                if source.is_readable() {
                    source.readable_stream_cancel(error)
                } else {
                    // Otherwise, return a promise resolved with undefined.
                    Promise::resolved(&ctx, ())
                }
            }));
        }

        debug!("Pipe aborted: {}", error);

        // Shutdown with an action consisting of getting a promise to wait for all of the actions in actions, and with error.
        self.shutdown_with_action(
            move || {
                let promises = actions.into_iter().map(|action| action()).collect();
                upon_promise_fulfilment(&Promise::all(&ctx, promises), |_| Ok(()))
            },
            Some(error),
        )
    }

    fn on_source_errored(&self, stored_error: Value) {
        // If preventAbort is false, shutdown with an action of ! WritableStreamAbort(dest, source.[[storedError]]) and with source.[[storedError]].
        if !self.0.prevent_abort {
            let dest = self.0.dest.clone();
            let error = stored_error.clone();
            self.shutdown_with_action(move || dest.writable_stream_abort(error), Some(stored_error))
        } else {
            // Otherwise, shutdown with source.[[storedError]].
            self.shutdown(Some(stored_error))
        }
    }

    fn on_dest_errored(&self, stored_error: Value) {
        // If preventCancel is false, shutdown with an action of ! ReadableStreamCancel(source, dest.[[storedError]]) and with dest.[[storedError]].
        if !self.0.prevent_cancel {
            let source = self.0.source.clone();
            let error = stored_error.clone();
            self.shutdown_with_action(
                move || source.readable_stream_cancel(error),
                Some(stored_error),
            )
        } else {
            // Otherwise, shutdown with dest.[[storedError]].
            self.shutdown(Some(stored_error))
        }
    }

    fn on_source_closed(&self) {
        // If preventClose is false, shutdown with an action of ! WritableStreamDefaultWriterCloseWithErrorPropagation(writer).
        if !self.0.prevent_close {
            let writer = self.0.writer.clone();
            self.shutdown_with_action(
                move || writer.writable_stream_default_writer_close_with_error_propagation(),
                None,
            )
        } else {
            // Otherwise, shutdown.
            self.shutdown(None)
        }
    }

    fn on_dest_closed(&self) {
        // Let destClosed be a new TypeError.
        let dest_closed: Value = Error::state(
            "The destination writable stream closed before all data could be piped to it",
        )
        .into();

        // If preventCancel is false, shutdown with an action of ! ReadableStreamCancel(source, destClosed) and with destClosed.
        if !self.0.prevent_cancel {
            let source = self.0.source.clone();
            let error = dest_closed.clone();
            self.shutdown_with_action(move || source.readable_stream_cancel(error), Some(dest_closed))
        } else {
            // Otherwise, shutdown with destClosed.
            self.shutdown(Some(dest_closed))
        }
    }

    // Using reader and writer, read all chunks from this and write them to dest
    // - Backpressure must be enforced
    // - Shutdown must stop all activity
    fn pipe_loop(&self) {
        let pipe = self.clone();
        self.pipe_step().react(move |result| {
            if let Ok(false) = result {
                pipe.pipe_loop()
            }
        });
    }

    // Resolves with true once there is nothing more to read.
    fn pipe_step(&self) -> Promise<bool> {
        let ctx = self.0.ctx.clone();

        if self.0.shutting_down.get() {
            return Promise::resolved(&ctx, true);
        }

        let pipe = self.clone();
        upon_promise_chain(&self.0.writer.ready(), move |result| {
            result?;

            if pipe.0.shutting_down.get() {
                return Ok(Promise::resolved(&ctx, true));
            }

            let read_promise = ResolveablePromise::new(&ctx);

            struct ReadRequest {
                pipe: PipeTo,
                read_promise: ResolveablePromise<bool>,
            }

            impl ReadableStreamReadRequest for ReadRequest {
                fn chunk_steps(self: Box<Self>, chunk: Value) {
                    trace!("Piping chunk");
                    let write = self
                        .pipe
                        .0
                        .writer
                        .writable_stream_default_writer_write(chunk);
                    // Write failures surface through the destination's closed promise.
                    let write = upon_promise(&write, |_| Ok(()));
                    self.pipe.0.current_write.replace(write);
                    self.read_promise.resolve(false)
                }

                fn close_steps(self: Box<Self>) {
                    self.read_promise.resolve(true)
                }

                fn error_steps(self: Box<Self>, reason: Value) {
                    self.read_promise.reject(reason)
                }
            }

            pipe.0
                .reader
                .readable_stream_default_reader_read(Box::new(ReadRequest {
                    pipe: pipe.clone(),
                    read_promise: read_promise.clone(),
                }));

            Ok(read_promise.promise)
        })
    }

    fn is_or_becomes_errored(
        stored_error: Option<Value>,
        promise: Promise<()>,
        action: impl FnOnce(Value) + 'static,
    ) {
        match stored_error {
            Some(stored_error) => action(stored_error),
            None => promise.react(move |result| {
                if let Err(stored_error) = result {
                    action(stored_error)
                }
            }),
        }
    }

    fn is_or_becomes_closed(
        already_closed: bool,
        promise: Promise<()>,
        action: impl FnOnce() + 'static,
    ) {
        if already_closed {
            action()
        } else {
            promise.react(move |result| {
                if result.is_ok() {
                    action()
                }
            })
        }
    }

    fn dest_is_writable_and_open(&self) -> bool {
        self.0.dest.is_writable() && !self.0.dest.writable_stream_close_queued_or_in_flight()
    }

    fn shutdown_with_action(
        &self,
        action: impl FnOnce() -> Promise<()> + 'static,
        original_error: Option<Value>,
    ) {
        // If shuttingDown is true, abort these substeps.
        // Set shuttingDown to true.
        if self.0.shutting_down.replace(true) {
            return;
        }

        debug!("Pipe shutting down with action");

        let do_the_rest = {
            let pipe = self.clone();
            move || {
                // Let p be the result of performing action.
                let p = action();
                // Upon fulfillment of p, finalize, passing along originalError if it was given.
                // Upon rejection of p with reason newError, finalize with newError.
                p.react(move |result| match result {
                    Ok(()) => pipe.finalize(original_error),
                    Err(new_error) => pipe.finalize(Some(new_error)),
                });
            }
        };

        // If dest.[[state]] is "writable" and ! WritableStreamCloseQueuedOrInFlight(dest) is false,
        if self.dest_is_writable_and_open() {
            // If any chunks have been read but not yet written, write them to dest.
            // Wait until every chunk that has been read has been written (i.e. the corresponding promises have settled).
            self.wait_for_writes_to_finish()
                .react(move |_| do_the_rest());
        } else {
            do_the_rest()
        }
    }

    fn shutdown(&self, error: Option<Value>) {
        // If shuttingDown is true, abort these substeps.
        // Set shuttingDown to true.
        if self.0.shutting_down.replace(true) {
            return;
        }

        debug!("Pipe shutting down");

        if self.dest_is_writable_and_open() {
            let pipe = self.clone();
            self.wait_for_writes_to_finish()
                .react(move |_| pipe.finalize(error));
        } else {
            self.finalize(error)
        }
    }

    fn wait_for_writes_to_finish(&self) -> Promise<()> {
        let old_current_write = self.0.current_write.borrow().clone();
        let pipe = self.clone();
        upon_promise_chain(&old_current_write.clone(), move |_| {
            // A write issued while waiting must also be waited for.
            if old_current_write.ptr_eq(&pipe.0.current_write.borrow()) {
                Ok(Promise::resolved(&pipe.0.ctx, ()))
            } else {
                Ok(pipe.wait_for_writes_to_finish())
            }
        })
    }

    fn finalize(&self, error: Option<Value>) {
        // Perform ! WritableStreamDefaultWriterRelease(writer).
        self.0.writer.writable_stream_default_writer_release();

        // If reader implements ReadableStreamBYOBReader, perform ! ReadableStreamBYOBReaderRelease(reader).
        // Otherwise, perform ! ReadableStreamDefaultReaderRelease(reader).
        self.0.reader.readable_stream_default_reader_release();

        // If signal is not undefined, remove abortAlgorithm from signal.
        if let (Some(signal), Some(id)) = (&self.0.signal, self.0.abort_algorithm.take()) {
            signal.remove_algorithm(id);
        }

        match error {
            // If error was given, reject promise with error.
            Some(error) => {
                debug!("Pipe finished with error: {}", error);
                self.0.promise.reject(error)
            },
            // Otherwise, resolve promise with undefined.
            None => {
                debug!("Pipe finished");
                self.0.promise.resolve_undefined()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use brook_abort::AbortController;
    use brook_test::test_async_with;

    use super::*;
    use crate::{
        queuing_strategy::QueuingStrategy,
        readable::{ReadableStreamDefaultController, UnderlyingSource},
        writable::UnderlyingSink,
    };

    fn collecting_sink(ctx: &Ctx, log: &Rc<RefCell<Vec<String>>>) -> UnderlyingSink {
        UnderlyingSink::new()
            .with_write({
                let ctx = ctx.clone();
                let log = log.clone();
                move |chunk, _controller| {
                    log.borrow_mut().push(chunk.to_string());
                    Ok(Promise::resolved(&ctx, ()))
                }
            })
            .with_close({
                let ctx = ctx.clone();
                let log = log.clone();
                move || {
                    log.borrow_mut().push("close".into());
                    Ok(Promise::resolved(&ctx, ()))
                }
            })
            .with_abort({
                let ctx = ctx.clone();
                let log = log.clone();
                move |reason| {
                    log.borrow_mut().push(format!("abort {reason}"));
                    Ok(Promise::resolved(&ctx, ()))
                }
            })
    }

    fn cancel_tracking_source(ctx: &Ctx, log: &Rc<RefCell<Vec<String>>>) -> UnderlyingSource {
        let ctx = ctx.clone();
        let log = log.clone();
        UnderlyingSource::new().with_cancel(move |reason| {
            log.borrow_mut().push(format!("cancel {reason}"));
            Ok(Promise::resolved(&ctx, ()))
        })
    }

    #[tokio::test]
    async fn test_pipes_chunks_and_closes() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let log = Rc::new(RefCell::new(Vec::new()));
                let source = ReadableStream::from_iter(&ctx, ["a", "b", "c"]).unwrap();
                let dest = WritableStream::new(
                    &ctx,
                    collecting_sink(&ctx, &log),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let pipe = source.pipe_to(&dest, StreamPipeOptions::default());
                assert!(source.locked());
                assert!(dest.locked());

                assert_eq!(ctx.settle(&pipe).await, Ok(()));
                assert_eq!(*log.borrow(), ["a", "b", "c", "close"]);
                assert_eq!(dest.state(), WritableStreamState::Closed);
                assert!(!source.locked());
                assert!(!dest.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_prevent_close_leaves_dest_open() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let log = Rc::new(RefCell::new(Vec::new()));
                let source = ReadableStream::from_iter(&ctx, [1, 2]).unwrap();
                let dest = WritableStream::new(
                    &ctx,
                    collecting_sink(&ctx, &log),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let options = StreamPipeOptions {
                    prevent_close: true,
                    ..Default::default()
                };
                assert_eq!(ctx.settle(&source.pipe_to(&dest, options)).await, Ok(()));
                assert_eq!(*log.borrow(), ["1", "2"]);
                assert_eq!(dest.state(), WritableStreamState::Writable);
                assert!(!dest.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_source_error_aborts_dest() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let log = Rc::new(RefCell::new(Vec::new()));
                let source = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_pull({
                        let ctx = ctx.clone();
                        move |controller: ReadableStreamDefaultController| {
                            controller.error("boom");
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let dest = WritableStream::new(
                    &ctx,
                    collecting_sink(&ctx, &log),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let pipe = source.pipe_to(&dest, StreamPipeOptions::default());
                assert_eq!(ctx.settle(&pipe).await, Err(Value::from("boom")));
                assert_eq!(*log.borrow(), ["abort boom"]);
                assert_eq!(
                    dest.state(),
                    WritableStreamState::Errored(Value::from("boom"))
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_dest_error_cancels_source() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let log = Rc::new(RefCell::new(Vec::new()));
                let source = ReadableStream::new(
                    &ctx,
                    cancel_tracking_source(&ctx, &log).with_start({
                        let ctx = ctx.clone();
                        move |controller: ReadableStreamDefaultController| {
                            controller.enqueue("a")?;
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let dest = WritableStream::new(
                    &ctx,
                    UnderlyingSink::new()
                        .with_write(|_chunk, _controller| Err(Error::thrown("sink failed"))),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let pipe = source.pipe_to(&dest, StreamPipeOptions::default());
                assert_eq!(ctx.settle(&pipe).await, Err(Value::from("sink failed")));
                assert_eq!(*log.borrow(), ["cancel sink failed"]);
                assert_eq!(source.state(), ReadableStreamState::Closed);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_abort_signal_stops_pipe() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let log = Rc::new(RefCell::new(Vec::new()));
                let source = ReadableStream::new(
                    &ctx,
                    cancel_tracking_source(&ctx, &log),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let dest = WritableStream::new(
                    &ctx,
                    collecting_sink(&ctx, &log),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let controller = AbortController::new();
                let options = StreamPipeOptions {
                    signal: Some(controller.signal()),
                    ..Default::default()
                };
                let pipe = source.pipe_to(&dest, options);
                ctx.execute_pending_jobs();
                assert!(pipe.is_pending());

                controller.abort(Some("stop".into()));
                assert_eq!(ctx.settle(&pipe).await, Err(Value::from("stop")));
                assert_eq!(*log.borrow(), ["abort stop", "cancel stop"]);
                assert!(!source.locked());
                assert!(!dest.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_closed_dest_cancels_source() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let log = Rc::new(RefCell::new(Vec::new()));
                let source = ReadableStream::new(
                    &ctx,
                    cancel_tracking_source(&ctx, &log),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let dest =
                    WritableStream::new(&ctx, UnderlyingSink::new(), QueuingStrategy::default())
                        .unwrap();
                assert_eq!(ctx.settle(&dest.close()).await, Ok(()));

                let reason = ctx
                    .settle(&source.pipe_to(&dest, StreamPipeOptions::default()))
                    .await
                    .unwrap_err();
                assert!(Error::from(reason).is_state());
                assert_eq!(log.borrow().len(), 1);
                assert!(log.borrow()[0].starts_with("cancel StateError"));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_locked_streams_are_rejected() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let source = ReadableStream::from_iter(&ctx, [1]).unwrap();
                let dest =
                    WritableStream::new(&ctx, UnderlyingSink::new(), QueuingStrategy::default())
                        .unwrap();

                let writer = dest.get_writer().unwrap();
                let reason = ctx
                    .settle(&source.pipe_to(&dest, StreamPipeOptions::default()))
                    .await
                    .unwrap_err();
                assert!(Error::from(reason).is_state());
                assert!(!source.locked());
                writer.release_lock();

                let _reader = source.get_reader().unwrap();
                let reason = ctx
                    .settle(&source.pipe_to(&dest, StreamPipeOptions::default()))
                    .await
                    .unwrap_err();
                assert!(Error::from(reason).is_state());
                assert!(!dest.locked());
            })
        })
        .await;
    }
}
