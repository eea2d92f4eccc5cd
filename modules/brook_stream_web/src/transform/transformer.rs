use std::rc::Rc;

use brook_utils::{Promise, Result, Value};

use super::{
    controller::{FlushAlgorithm, FlushFn, TransformAlgorithm, TransformFn},
    TransformStreamDefaultController,
};
use crate::readable::CancelAlgorithm;

type StartFn = dyn Fn(TransformStreamDefaultController) -> Result<Promise<()>>;
type CancelFn = dyn Fn(Value) -> Result<Promise<()>>;

/// The callbacks behind a transform stream.
///
/// Without `transform` every written chunk is enqueued on the readable side unchanged.
/// `flush` runs once the writable side closes, before the readable side closes. `cancel` runs
/// at most once, when either side is torn down early.
#[derive(Default)]
pub struct Transformer {
    start: Option<Rc<StartFn>>,
    transform: Option<Rc<TransformFn>>,
    flush: Option<Rc<FlushFn>>,
    cancel: Option<Rc<CancelFn>>,
}

impl Transformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start(
        mut self,
        start: impl Fn(TransformStreamDefaultController) -> Result<Promise<()>> + 'static,
    ) -> Self {
        self.start = Some(Rc::new(start));
        self
    }

    pub fn with_transform(
        mut self,
        transform: impl Fn(Value, TransformStreamDefaultController) -> Result<Promise<()>> + 'static,
    ) -> Self {
        self.transform = Some(Rc::new(transform));
        self
    }

    pub fn with_flush(
        mut self,
        flush: impl Fn(TransformStreamDefaultController) -> Result<Promise<()>> + 'static,
    ) -> Self {
        self.flush = Some(Rc::new(flush));
        self
    }

    pub fn with_cancel(mut self, cancel: impl Fn(Value) -> Result<Promise<()>> + 'static) -> Self {
        self.cancel = Some(Rc::new(cancel));
        self
    }

    pub(super) fn into_algorithms(
        self,
    ) -> (
        Option<Rc<StartFn>>,
        TransformAlgorithm,
        FlushAlgorithm,
        CancelAlgorithm,
    ) {
        (
            self.start,
            // If transformerDict["transform"] exists, set transformAlgorithm to an algorithm which takes an argument chunk and returns the result of invoking transformerDict["transform"]
            self.transform
                .map(TransformAlgorithm::Function)
                .unwrap_or(TransformAlgorithm::Identity),
            // If transformerDict["flush"] exists, set flushAlgorithm to an algorithm which returns the result of invoking transformerDict["flush"]
            self.flush
                .map(FlushAlgorithm::Function)
                .unwrap_or(FlushAlgorithm::ReturnPromiseUndefined),
            // If transformerDict["cancel"] exists, set cancelAlgorithm to an algorithm which takes an argument reason and returns the result of invoking transformerDict["cancel"]
            self.cancel
                .map(CancelAlgorithm::Function)
                .unwrap_or(CancelAlgorithm::ReturnPromiseUndefined),
        )
    }
}
