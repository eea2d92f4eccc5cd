use std::{cell::RefCell, fmt, rc::Rc};

use brook_utils::{Ctx, Promise, ResolveablePromise, Result};

use super::{transformer::Transformer, TransformStreamDefaultController};
use crate::{
    queuing_strategy::QueuingStrategy,
    readable::{
        CancelAlgorithm, PullAlgorithm, ReadableStream, ReadableStreamDefaultController,
        StartAlgorithm,
    },
    readable_writable_pair::ReadableWritablePair,
    writable::{AbortAlgorithm, CloseAlgorithm, WritableStream, WriteAlgorithm},
};

/// A writable side and a readable side joined by a [`Transformer`].
///
/// Chunks written to [`TransformStream::writable`] pass through the transformer and come out
/// of [`TransformStream::readable`]. Writes wait while the readable side is backed up.
#[derive(Clone)]
pub struct TransformStream {
    readable: ReadableStream,
    writable: WritableStream,
}

impl TransformStream {
    // Streams Spec: 6.2.3: https://streams.spec.whatwg.org/#ts-prototype
    // constructor(optional object transformer, optional QueuingStrategy writableStrategy = {}, optional QueuingStrategy readableStrategy = {});
    pub fn new(
        ctx: &Ctx,
        transformer: Transformer,
        writable_strategy: QueuingStrategy,
        readable_strategy: QueuingStrategy,
    ) -> Result<Self> {
        // Let readableHighWaterMark be ? ExtractHighWaterMark(readableStrategy, 0).
        let readable_high_water_mark = readable_strategy.extract_high_water_mark(0.0)?;
        // Let readableSizeAlgorithm be ! ExtractSizeAlgorithm(readableStrategy).
        let readable_size_algorithm = readable_strategy.extract_size_algorithm();
        // Let writableHighWaterMark be ? ExtractHighWaterMark(writableStrategy, 1).
        let writable_high_water_mark = writable_strategy.extract_high_water_mark(1.0)?;
        // Let writableSizeAlgorithm be ! ExtractSizeAlgorithm(writableStrategy).
        let writable_size_algorithm = writable_strategy.extract_size_algorithm();

        let (start, transform_algorithm, flush_algorithm, cancel_algorithm) =
            transformer.into_algorithms();

        // Let startPromise be a new promise.
        let start_promise = ResolveablePromise::new(ctx);

        // Perform ! InitializeTransformStream(this, startPromise, writableHighWaterMark, writableSizeAlgorithm, readableHighWaterMark, readableSizeAlgorithm).
        let stream = TransformStreamRef::new(ctx);

        // Perform ? SetUpTransformStreamDefaultControllerFromTransformer(this, transformer, transformerDict).
        // The controller exists before either side so their algorithms can reach it.
        let controller = TransformStreamDefaultController::new(
            stream.clone(),
            transform_algorithm,
            flush_algorithm,
            cancel_algorithm,
        );

        // Set stream.[[writable]] to ! CreateWritableStream(startAlgorithm, writeAlgorithm, closeAlgorithm, abortAlgorithm, writableHighWaterMark, writableSizeAlgorithm).
        let writable = WritableStream::create_writable_stream(
            ctx,
            // Let startAlgorithm be an algorithm that returns startPromise.
            StartAlgorithm::from_fn({
                let start_promise = start_promise.promise.clone();
                move |_| Ok(start_promise.clone())
            }),
            // Return ! TransformStreamDefaultSinkWriteAlgorithm(stream, chunk).
            WriteAlgorithm::from_fn({
                let controller = controller.clone();
                move |chunk, _| Ok(controller.sink_write(chunk))
            }),
            // Return ! TransformStreamDefaultSinkCloseAlgorithm(stream).
            CloseAlgorithm::from_fn({
                let controller = controller.clone();
                move || Ok(controller.sink_close())
            }),
            // Return ! TransformStreamDefaultSinkAbortAlgorithm(stream, reason).
            AbortAlgorithm::from_fn({
                let controller = controller.clone();
                move |reason| Ok(controller.sink_abort(reason))
            }),
            writable_high_water_mark,
            writable_size_algorithm,
        )?;

        // Set stream.[[readable]] to ! CreateReadableStream(startAlgorithm, pullAlgorithm, cancelAlgorithm, readableHighWaterMark, readableSizeAlgorithm).
        let readable = ReadableStream::create_readable_stream(
            ctx,
            StartAlgorithm::from_fn({
                let stream = stream.clone();
                let start_promise = start_promise.promise.clone();
                move |readable_controller: ReadableStreamDefaultController| {
                    stream.0.borrow_mut().readable_controller = Some(readable_controller);
                    Ok(start_promise.clone())
                }
            }),
            // Return ! TransformStreamDefaultSourcePullAlgorithm(stream).
            PullAlgorithm::from_fn({
                let controller = controller.clone();
                move |_| Ok(controller.source_pull())
            }),
            // Return ! TransformStreamDefaultSourceCancelAlgorithm(stream, reason).
            CancelAlgorithm::from_fn({
                let controller = controller.clone();
                move |reason| Ok(controller.source_cancel(reason))
            }),
            readable_high_water_mark,
            readable_size_algorithm,
        )?;

        {
            let mut inner = stream.0.borrow_mut();
            inner.readable = Some(readable.clone());
            inner.writable = Some(writable.clone());
        }

        match start {
            // If transformerDict["start"] exists, then resolve startPromise with the result of invoking transformerDict["start"] with argument list « this.[[controller]] »
            Some(start) => {
                let start_result = start(controller)?;
                start_result.react(move |result| start_promise.settle_with(result));
            },
            // Otherwise, resolve startPromise with undefined.
            None => start_promise.resolve_undefined(),
        }

        Ok(Self { readable, writable })
    }

    pub fn readable(&self) -> ReadableStream {
        self.readable.clone()
    }

    pub fn writable(&self) -> WritableStream {
        self.writable.clone()
    }
}

impl fmt::Debug for TransformStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStream")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}

impl From<TransformStream> for ReadableWritablePair {
    fn from(stream: TransformStream) -> Self {
        Self {
            readable: stream.readable,
            writable: stream.writable,
        }
    }
}

impl From<&TransformStream> for ReadableWritablePair {
    fn from(stream: &TransformStream) -> Self {
        stream.clone().into()
    }
}

/// The state both sides of a transform stream share. The sides are filled in once they exist.
#[derive(Clone)]
pub(super) struct TransformStreamRef(Rc<RefCell<TransformStreamInner>>);

struct TransformStreamInner {
    backpressure: bool,
    backpressure_change_promise: ResolveablePromise<()>,
    readable: Option<ReadableStream>,
    readable_controller: Option<ReadableStreamDefaultController>,
    writable: Option<WritableStream>,
    ctx: Ctx,
}

impl TransformStreamRef {
    fn new(ctx: &Ctx) -> Self {
        Self(Rc::new(RefCell::new(TransformStreamInner {
            // Perform ! TransformStreamSetBackpressure(stream, true).
            backpressure: true,
            backpressure_change_promise: ResolveablePromise::new(ctx),
            readable: None,
            readable_controller: None,
            writable: None,
            ctx: ctx.clone(),
        })))
    }

    pub(super) fn ctx(&self) -> Ctx {
        self.0.borrow().ctx.clone()
    }

    pub(super) fn readable(&self) -> Option<ReadableStream> {
        self.0.borrow().readable.clone()
    }

    pub(super) fn readable_controller(&self) -> Option<ReadableStreamDefaultController> {
        self.0.borrow().readable_controller.clone()
    }

    pub(super) fn writable(&self) -> Option<WritableStream> {
        self.0.borrow().writable.clone()
    }

    pub(super) fn backpressure(&self) -> bool {
        self.0.borrow().backpressure
    }

    pub(super) fn backpressure_change_promise(&self) -> Promise<()> {
        self.0.borrow().backpressure_change_promise.promise.clone()
    }

    pub(super) fn set_backpressure(&self, backpressure: bool) {
        let mut inner = self.0.borrow_mut();
        // If stream.[[backpressureChangePromise]] is not undefined, resolve stream.[[backpressureChangePromise]] with undefined.
        inner.backpressure_change_promise.resolve_undefined();
        // Set stream.[[backpressureChangePromise]] to a new promise.
        inner.backpressure_change_promise = ResolveablePromise::new(&inner.ctx);
        // Set stream.[[backpressure]] to backpressure.
        inner.backpressure = backpressure;
    }

    pub(super) fn unblock_write(&self) {
        // If stream.[[backpressure]] is true, perform ! TransformStreamSetBackpressure(stream, false).
        if self.backpressure() {
            self.set_backpressure(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use brook_test::test_async_with;
    use brook_utils::{Error, Promise, Value};

    use super::*;
    use crate::{
        readable::{ReadableStreamReadResult, ReadableStreamState},
        writable::WritableStreamState,
    };

    fn identity(ctx: &Ctx) -> TransformStream {
        TransformStream::new(
            ctx,
            Transformer::new(),
            QueuingStrategy::default(),
            QueuingStrategy::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_identity_passes_chunks_through() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let transform = identity(&ctx);
                let writer = transform.writable().get_writer().unwrap();
                let reader = transform.readable().get_reader().unwrap();

                let write = writer.write("a");
                let read = reader.read();
                assert_eq!(
                    ctx.settle(&read).await.unwrap(),
                    ReadableStreamReadResult::chunk("a".into())
                );
                ctx.settle(&write).await.unwrap();

                let close = writer.close();
                assert!(ctx.settle(&reader.read()).await.unwrap().done);
                ctx.settle(&close).await.unwrap();
                assert_eq!(transform.writable().state(), WritableStreamState::Closed);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_write_waits_for_backpressure_to_lift() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let transformed = Rc::new(RefCell::new(Vec::new()));
                let transform = TransformStream::new(
                    &ctx,
                    Transformer::new().with_transform({
                        let ctx = ctx.clone();
                        let transformed = transformed.clone();
                        move |chunk: Value, controller: TransformStreamDefaultController| {
                            transformed.borrow_mut().push(chunk.clone());
                            controller.enqueue(chunk)?;
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let writer = transform.writable().get_writer().unwrap();

                let write = writer.write(1);
                ctx.execute_pending_jobs();
                assert!(write.is_pending());
                assert!(transformed.borrow().is_empty());

                let reader = transform.readable().get_reader().unwrap();
                assert_eq!(
                    ctx.settle(&reader.read()).await.unwrap(),
                    ReadableStreamReadResult::chunk(1.into())
                );
                ctx.settle(&write).await.unwrap();
                assert_eq!(*transformed.borrow(), vec![Value::from(1)]);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_transform_and_flush_enqueue() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let transform = TransformStream::new(
                    &ctx,
                    Transformer::new()
                        .with_transform({
                            let ctx = ctx.clone();
                            move |chunk: Value, controller: TransformStreamDefaultController| {
                                controller.enqueue(chunk.clone())?;
                                controller.enqueue(chunk)?;
                                Ok(Promise::resolved(&ctx, ()))
                            }
                        })
                        .with_flush({
                            let ctx = ctx.clone();
                            move |controller: TransformStreamDefaultController| {
                                controller.enqueue("end")?;
                                Ok(Promise::resolved(&ctx, ()))
                            }
                        }),
                    QueuingStrategy::default(),
                    QueuingStrategy::new().with_high_water_mark(8.0),
                )
                .unwrap();

                let writer = transform.writable().get_writer().unwrap();
                ctx.settle(&writer.write("x")).await.unwrap();
                ctx.settle(&writer.close()).await.unwrap();

                let reader = transform.readable().get_reader().unwrap();
                for expected in ["x", "x", "end"] {
                    assert_eq!(
                        ctx.settle(&reader.read()).await.unwrap(),
                        ReadableStreamReadResult::chunk(expected.into())
                    );
                }
                assert!(ctx.settle(&reader.read()).await.unwrap().done);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_transform_error_errors_both_sides() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let transform = TransformStream::new(
                    &ctx,
                    Transformer::new().with_transform(|_, _| Err(Error::validation("bad chunk"))),
                    QueuingStrategy::default(),
                    QueuingStrategy::new().with_high_water_mark(1.0),
                )
                .unwrap();

                let writer = transform.writable().get_writer().unwrap();
                let err = ctx.settle(&writer.write("x")).await.unwrap_err();
                assert!(Error::from(err).is_validation());

                assert!(matches!(
                    transform.readable().state(),
                    ReadableStreamState::Errored(_)
                ));
                assert!(matches!(
                    transform.writable().state(),
                    WritableStreamState::Errored(_)
                ));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_readable_cancel_runs_cancel_and_errors_writable() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let reasons = Rc::new(RefCell::new(Vec::new()));
                let transform = TransformStream::new(
                    &ctx,
                    Transformer::new().with_cancel({
                        let ctx = ctx.clone();
                        let reasons = reasons.clone();
                        move |reason| {
                            reasons.borrow_mut().push(reason);
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();
                ctx.execute_pending_jobs();

                ctx.settle(&transform.readable().cancel("stop"))
                    .await
                    .unwrap();
                assert_eq!(*reasons.borrow(), vec![Value::from("stop")]);
                assert_eq!(
                    transform.writable().state(),
                    WritableStreamState::Errored("stop".into())
                );

                // The writable side is already finished, so aborting it does not cancel again.
                let abort = transform.writable().abort("again");
                abort.set_is_handled();
                ctx.execute_pending_jobs();
                assert_eq!(reasons.borrow().len(), 1);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_terminate_closes_readable_and_errors_writable() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let controller = Rc::new(RefCell::new(None));
                let transform = TransformStream::new(
                    &ctx,
                    Transformer::new().with_start({
                        let ctx = ctx.clone();
                        let controller = controller.clone();
                        move |c: TransformStreamDefaultController| {
                            controller.replace(Some(c));
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();
                ctx.execute_pending_jobs();

                let controller = controller.borrow().clone().unwrap();
                assert_eq!(controller.desired_size(), Some(0.0));
                controller.terminate();

                assert_eq!(transform.readable().state(), ReadableStreamState::Closed);
                let WritableStreamState::Errored(reason) = transform.writable().state() else {
                    panic!("writable side should be errored");
                };
                assert!(Error::from(reason).is_state());
                assert!(controller.enqueue("late").unwrap_err().is_state());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_pipe_through_transform() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let source = ReadableStream::from_iter(&ctx, [1, 2, 3]).unwrap();
                let doubled = TransformStream::new(
                    &ctx,
                    Transformer::new().with_transform({
                        let ctx = ctx.clone();
                        move |chunk: Value, controller: TransformStreamDefaultController| {
                            let Value::Number(n) = chunk else {
                                return Err(Error::validation("expected a number"));
                            };
                            controller.enqueue(n * 2.0)?;
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();

                let readable = source
                    .pipe_through(&doubled, Default::default())
                    .unwrap();
                assert!(source.locked());

                let reader = readable.get_reader().unwrap();
                for expected in [2.0, 4.0, 6.0] {
                    assert_eq!(
                        ctx.settle(&reader.read()).await.unwrap(),
                        ReadableStreamReadResult::chunk(expected.into())
                    );
                }
                assert!(ctx.settle(&reader.read()).await.unwrap().done);
            })
        })
        .await;
    }
}
