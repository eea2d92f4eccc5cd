use std::{cell::RefCell, rc::Rc};

use brook_utils::{
    promise::{upon_promise, upon_promise_chain, upon_promise_fulfilment},
    Promise, ResolveablePromise, Result, Value,
};

use super::{
    ReadableStream, ReadableStreamDefaultReader, ReadableStreamReadRequest,
    ReadableStreamReadResult,
};

/// Pulls chunks out of a stream one `next` at a time.
///
/// Calls are serialized: a `next` or `return_value` issued while an earlier one is still
/// pending runs only after it settles.
#[derive(Clone)]
pub struct ReadableStreamAsyncIterator(Rc<RefCell<ReadableStreamAsyncIteratorInner>>);

struct ReadableStreamAsyncIteratorInner {
    reader: ReadableStreamDefaultReader,
    prevent_cancel: bool,
    is_finished: bool,
    ongoing_promise: Option<Promise<ReadableStreamReadResult>>,
}

impl ReadableStream {
    /// Locks the stream to a new iterator. Unless `prevent_cancel` is set, returning early
    /// from the iterator cancels the stream.
    pub fn values(&self, prevent_cancel: bool) -> Result<ReadableStreamAsyncIterator> {
        // Let reader be ? AcquireReadableStreamDefaultReader(stream).
        let reader = ReadableStreamDefaultReader::new(self)?;

        // Set iterator’s reader to reader.
        // Let preventCancel be args[0]["preventCancel"].
        // Set iterator’s prevent cancel to preventCancel.
        Ok(ReadableStreamAsyncIterator(Rc::new(RefCell::new(
            ReadableStreamAsyncIteratorInner {
                reader,
                prevent_cancel,
                is_finished: false,
                ongoing_promise: None,
            },
        ))))
    }
}

impl ReadableStreamAsyncIterator {
    pub fn next(&self) -> Promise<ReadableStreamReadResult> {
        let next_steps = |iterator: ReadableStreamAsyncIterator| {
            let ctx = iterator.reader().ctx();
            if iterator.0.borrow().is_finished {
                return Promise::resolved(&ctx, ReadableStreamReadResult::done());
            }

            let next_promise = iterator.next_steps();

            upon_promise(&next_promise, move |result| {
                let mut inner = iterator.0.borrow_mut();
                inner.ongoing_promise = None;
                match result {
                    Ok(Some(chunk)) => Ok(ReadableStreamReadResult::chunk(chunk)),
                    // end of iteration
                    Ok(None) => {
                        inner.is_finished = true;
                        Ok(ReadableStreamReadResult::done())
                    },
                    Err(reason) => {
                        inner.is_finished = true;
                        Err(reason.into())
                    },
                }
            })
        };

        let ongoing_promise = self.0.borrow_mut().ongoing_promise.take();

        let ongoing_promise = match ongoing_promise {
            Some(ongoing_promise) => {
                let iterator = self.clone();
                upon_promise_chain(&ongoing_promise, move |_| Ok(next_steps(iterator)))
            },
            None => next_steps(self.clone()),
        };

        self.0.borrow_mut().ongoing_promise = Some(ongoing_promise.clone());
        ongoing_promise
    }

    /// Finishes iteration early, settling with `value` once the stream is released.
    pub fn return_value(&self, value: impl Into<Value>) -> Promise<ReadableStreamReadResult> {
        let value = value.into();

        let return_steps = {
            let value = value.clone();
            move |iterator: ReadableStreamAsyncIterator| {
                let finished = std::mem::replace(&mut iterator.0.borrow_mut().is_finished, true);
                if finished {
                    return Promise::resolved(&iterator.reader().ctx(), ());
                }
                iterator.return_steps(value)
            }
        };

        let ongoing_promise = self.0.borrow_mut().ongoing_promise.take();

        let return_promise = match ongoing_promise {
            Some(ongoing_promise) => {
                let iterator = self.clone();
                upon_promise_chain(&ongoing_promise, move |_| Ok(return_steps(iterator)))
            },
            None => return_steps(self.clone()),
        };

        let result = upon_promise_fulfilment(&return_promise, move |()| {
            Ok(ReadableStreamReadResult { value, done: true })
        });

        self.0.borrow_mut().ongoing_promise = Some(result.clone());
        result
    }

    fn reader(&self) -> ReadableStreamDefaultReader {
        self.0.borrow().reader.clone()
    }

    // The get the next iteration result steps. `None` marks the end of iteration.
    fn next_steps(&self) -> Promise<Option<Value>> {
        // Let reader be iterator’s reader.
        let reader = self.reader();

        // Let promise be a new promise.
        let promise = ResolveablePromise::new(&reader.ctx());

        // Let readRequest be a new read request with the following items:
        struct ReadRequest {
            promise: ResolveablePromise<Option<Value>>,
            reader: ReadableStreamDefaultReader,
        }

        impl ReadableStreamReadRequest for ReadRequest {
            fn chunk_steps(self: Box<Self>, chunk: Value) {
                // Resolve promise with chunk.
                self.promise.resolve(Some(chunk))
            }

            fn close_steps(self: Box<Self>) {
                // Perform ! ReadableStreamDefaultReaderRelease(reader).
                self.reader.readable_stream_default_reader_release();

                // Resolve promise with end of iteration.
                self.promise.resolve(None)
            }

            fn error_steps(self: Box<Self>, reason: Value) {
                // Perform ! ReadableStreamDefaultReaderRelease(reader).
                self.reader.readable_stream_default_reader_release();

                // Reject promise with e.
                self.promise.reject(reason)
            }
        }

        // Perform ! ReadableStreamDefaultReaderRead(this, readRequest).
        reader.readable_stream_default_reader_read(Box::new(ReadRequest {
            promise: promise.clone(),
            reader: reader.clone(),
        }));

        // Return promise.
        promise.promise
    }

    // The asynchronous iterator return steps.
    fn return_steps(&self, arg: Value) -> Promise<()> {
        // Let reader be iterator’s reader.
        let (reader, prevent_cancel) = {
            let inner = self.0.borrow();
            (inner.reader.clone(), inner.prevent_cancel)
        };

        // If iterator’s prevent cancel is false:
        if !prevent_cancel {
            // Let result be ! ReadableStreamReaderGenericCancel(reader, arg).
            let result = reader.cancel(arg);

            // Perform ! ReadableStreamDefaultReaderRelease(reader).
            reader.release_lock();

            // Return result.
            return result;
        }

        // Perform ! ReadableStreamDefaultReaderRelease(reader).
        reader.release_lock();

        // Return a promise resolved with undefined.
        Promise::resolved(&reader.ctx(), ())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use brook_test::test_async_with;
    use brook_utils::{Ctx, Error};

    use super::*;
    use crate::{
        queuing_strategy::QueuingStrategy,
        readable::{ReadableStreamDefaultController, ReadableStreamState, UnderlyingSource},
    };

    #[tokio::test]
    async fn test_iterates_to_completion() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = ReadableStream::from_iter(&ctx, ["a", "b"]).unwrap();
                let iterator = stream.values(false).unwrap();
                assert!(stream.locked());

                // Both calls are issued before either settles.
                let first = iterator.next();
                let second = iterator.next();
                let third = iterator.next();
                assert_eq!(
                    ctx.settle(&first).await.unwrap(),
                    ReadableStreamReadResult::chunk("a".into())
                );
                assert_eq!(
                    ctx.settle(&second).await.unwrap(),
                    ReadableStreamReadResult::chunk("b".into())
                );
                assert!(ctx.settle(&third).await.unwrap().done);
                assert!(!stream.locked());
                assert!(ctx.settle(&iterator.next()).await.unwrap().done);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_return_cancels_unless_prevented() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let cancelled = Rc::new(Cell::new(false));
                let source = |ctx: &Ctx, cancelled: &Rc<Cell<bool>>| {
                    let ctx = ctx.clone();
                    let cancelled = cancelled.clone();
                    UnderlyingSource::new().with_cancel(move |_reason| {
                        cancelled.set(true);
                        Ok(Promise::resolved(&ctx, ()))
                    })
                };

                let stream =
                    ReadableStream::new(&ctx, source(&ctx, &cancelled), QueuingStrategy::default())
                        .unwrap();
                let iterator = stream.values(true).unwrap();
                let result = ctx.settle(&iterator.return_value(5)).await.unwrap();
                assert_eq!(result, ReadableStreamReadResult { value: 5.into(), done: true });
                assert!(!cancelled.get());
                assert!(!stream.locked());
                assert_eq!(stream.state(), ReadableStreamState::Readable);

                let iterator = stream.values(false).unwrap();
                ctx.settle(&iterator.return_value(Value::Undefined))
                    .await
                    .unwrap();
                assert!(cancelled.get());
                assert_eq!(stream.state(), ReadableStreamState::Closed);
                assert!(ctx.settle(&iterator.next()).await.unwrap().done);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_error_finishes_iteration() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_pull(
                        |controller: ReadableStreamDefaultController| {
                            Err(Error::thrown(format!(
                                "pull failed at {:?}",
                                controller.desired_size()
                            )))
                        },
                    ),
                    QueuingStrategy::new().with_high_water_mark(0.0),
                )
                .unwrap();
                let iterator = stream.values(false).unwrap();

                let reason = ctx.settle(&iterator.next()).await.unwrap_err();
                assert_eq!(reason, Value::from("pull failed at Some(0.0)"));
                assert!(!stream.locked());
                assert!(ctx.settle(&iterator.next()).await.unwrap().done);
            })
        })
        .await;
    }
}
