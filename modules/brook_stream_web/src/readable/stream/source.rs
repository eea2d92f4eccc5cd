use std::rc::Rc;

use brook_utils::{Promise, Result, Value};

use super::algorithms::{CancelAlgorithm, PullAlgorithm, StartAlgorithm};
use crate::readable::{ReadableByteStreamController, ReadableStreamDefaultController};

type ControllerFn<C> = dyn Fn(C) -> Result<Promise<()>>;
type ReasonFn = dyn Fn(Value) -> Result<Promise<()>>;

/// The producer callbacks behind a readable stream.
///
/// `start` runs once during construction; an error returned from it fails construction.
/// `pull` is called whenever the stream wants more data, never while a previous pull is
/// still pending. `cancel` is called at most once when the consumer gives up.
pub struct UnderlyingSource<C = ReadableStreamDefaultController> {
    pub(crate) start: Option<Rc<ControllerFn<C>>>,
    pub(crate) pull: Option<Rc<ControllerFn<C>>>,
    pub(crate) cancel: Option<Rc<ReasonFn>>,
    pub(crate) auto_allocate_chunk_size: Option<usize>,
}

/// Source for a byte stream; its callbacks receive a [`ReadableByteStreamController`].
pub type UnderlyingByteSource = UnderlyingSource<ReadableByteStreamController>;

impl<C> Default for UnderlyingSource<C> {
    fn default() -> Self {
        Self {
            start: None,
            pull: None,
            cancel: None,
            auto_allocate_chunk_size: None,
        }
    }
}

impl<C: 'static> UnderlyingSource<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start(mut self, start: impl Fn(C) -> Result<Promise<()>> + 'static) -> Self {
        self.start = Some(Rc::new(start));
        self
    }

    pub fn with_pull(mut self, pull: impl Fn(C) -> Result<Promise<()>> + 'static) -> Self {
        self.pull = Some(Rc::new(pull));
        self
    }

    pub fn with_cancel(mut self, cancel: impl Fn(Value) -> Result<Promise<()>> + 'static) -> Self {
        self.cancel = Some(Rc::new(cancel));
        self
    }

    pub(crate) fn into_algorithms(self) -> (StartAlgorithm<C>, PullAlgorithm<C>, CancelAlgorithm) {
        let start = match self.start {
            // If underlyingSourceDict["start"] exists, then set startAlgorithm to an algorithm which returns the result of invoking underlyingSourceDict["start"]
            Some(start) => StartAlgorithm::Function(start),
            // Let startAlgorithm be an algorithm that returns undefined.
            None => StartAlgorithm::ReturnUndefined,
        };
        let pull = match self.pull {
            Some(pull) => PullAlgorithm::Function(pull),
            // Let pullAlgorithm be an algorithm that returns a promise resolved with undefined.
            None => PullAlgorithm::ReturnPromiseUndefined,
        };
        let cancel = match self.cancel {
            Some(cancel) => CancelAlgorithm::Function(cancel),
            // Let cancelAlgorithm be an algorithm that returns a promise resolved with undefined.
            None => CancelAlgorithm::ReturnPromiseUndefined,
        };
        (start, pull, cancel)
    }
}

impl UnderlyingByteSource {
    /// Lets default readers on the byte stream receive freshly allocated buffers of this size
    /// that the source fills through the BYOB request.
    pub fn with_auto_allocate_chunk_size(mut self, size: usize) -> Self {
        self.auto_allocate_chunk_size = Some(size);
        self
    }
}
