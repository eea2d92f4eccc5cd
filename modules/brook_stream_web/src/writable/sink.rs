use std::rc::Rc;

use brook_utils::{Promise, Result, Value};

use super::{
    default_controller::{
        AbortAlgorithm, AbortFn, CloseAlgorithm, CloseFn, WriteAlgorithm, WriteFn,
    },
    WritableStreamDefaultController,
};
use crate::readable::StartAlgorithm;

type StartFn = dyn Fn(WritableStreamDefaultController) -> Result<Promise<()>>;

/// The consumer callbacks behind a writable stream.
///
/// `write` is never called again until the promise from the previous call settles.
/// `close` runs after every queued write has finished; `abort` replaces it when the
/// stream is aborted instead.
#[derive(Default)]
pub struct UnderlyingSink {
    start: Option<Rc<StartFn>>,
    write: Option<Rc<WriteFn>>,
    close: Option<Rc<CloseFn>>,
    abort: Option<Rc<AbortFn>>,
}

impl UnderlyingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start(
        mut self,
        start: impl Fn(WritableStreamDefaultController) -> Result<Promise<()>> + 'static,
    ) -> Self {
        self.start = Some(Rc::new(start));
        self
    }

    pub fn with_write(
        mut self,
        write: impl Fn(Value, WritableStreamDefaultController) -> Result<Promise<()>> + 'static,
    ) -> Self {
        self.write = Some(Rc::new(write));
        self
    }

    pub fn with_close(mut self, close: impl Fn() -> Result<Promise<()>> + 'static) -> Self {
        self.close = Some(Rc::new(close));
        self
    }

    pub fn with_abort(mut self, abort: impl Fn(Value) -> Result<Promise<()>> + 'static) -> Self {
        self.abort = Some(Rc::new(abort));
        self
    }

    pub(super) fn into_algorithms(
        self,
    ) -> (
        StartAlgorithm<WritableStreamDefaultController>,
        WriteAlgorithm,
        CloseAlgorithm,
        AbortAlgorithm,
    ) {
        (
            // If underlyingSinkDict["start"] exists, then set startAlgorithm to an algorithm which returns the result of invoking underlyingSinkDict["start"]
            self.start
                .map(StartAlgorithm::Function)
                .unwrap_or(StartAlgorithm::ReturnUndefined),
            // If underlyingSinkDict["write"] exists, then set writeAlgorithm to an algorithm which takes an argument chunk and returns the result of invoking underlyingSinkDict["write"]
            self.write
                .map(WriteAlgorithm::Function)
                .unwrap_or(WriteAlgorithm::ReturnPromiseUndefined),
            // If underlyingSinkDict["close"] exists, then set closeAlgorithm to an algorithm which returns the result of invoking underlyingSinkDict["close"]
            self.close
                .map(CloseAlgorithm::Function)
                .unwrap_or(CloseAlgorithm::ReturnPromiseUndefined),
            // If underlyingSinkDict["abort"] exists, then set abortAlgorithm to an algorithm which takes an argument reason and returns the result of invoking underlyingSinkDict["abort"]
            self.abort
                .map(AbortAlgorithm::Function)
                .unwrap_or(AbortAlgorithm::ReturnPromiseUndefined),
        )
    }
}
