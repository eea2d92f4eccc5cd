use std::rc::Rc;

use brook_utils::{promise::promise_resolved_with, Ctx, Promise, Result, Value};

type StartFn<C> = dyn Fn(C) -> Result<Promise<()>>;
type PullFn<C> = dyn Fn(C) -> Result<Promise<()>>;
type CancelFn = dyn Fn(Value) -> Result<Promise<()>>;

pub(crate) enum StartAlgorithm<C> {
    ReturnUndefined,
    Function(Rc<StartFn<C>>),
}

impl<C> StartAlgorithm<C> {
    pub(crate) fn from_fn(f: impl Fn(C) -> Result<Promise<()>> + 'static) -> Self {
        Self::Function(Rc::new(f))
    }

    /// Errors are returned to the caller setting the stream up.
    pub(crate) fn call(&self, ctx: &Ctx, controller: C) -> Result<Promise<()>> {
        match self {
            StartAlgorithm::ReturnUndefined => Ok(Promise::resolved(ctx, ())),
            StartAlgorithm::Function(f) => f(controller),
        }
    }
}

pub(crate) enum PullAlgorithm<C> {
    ReturnPromiseUndefined,
    Function(Rc<PullFn<C>>),
}

impl<C> Clone for PullAlgorithm<C> {
    fn clone(&self) -> Self {
        match self {
            Self::ReturnPromiseUndefined => Self::ReturnPromiseUndefined,
            Self::Function(f) => Self::Function(f.clone()),
        }
    }
}

impl<C> PullAlgorithm<C> {
    pub(crate) fn from_fn(f: impl Fn(C) -> Result<Promise<()>> + 'static) -> Self {
        Self::Function(Rc::new(f))
    }

    pub(crate) fn call(&self, ctx: &Ctx, controller: C) -> Promise<()> {
        match self {
            PullAlgorithm::ReturnPromiseUndefined => Promise::resolved(ctx, ()),
            PullAlgorithm::Function(f) => flatten(ctx, f(controller)),
        }
    }
}

#[derive(Clone)]
pub(crate) enum CancelAlgorithm {
    ReturnPromiseUndefined,
    Function(Rc<CancelFn>),
}

impl CancelAlgorithm {
    pub(crate) fn from_fn(f: impl Fn(Value) -> Result<Promise<()>> + 'static) -> Self {
        Self::Function(Rc::new(f))
    }

    pub(crate) fn call(&self, ctx: &Ctx, reason: Value) -> Promise<()> {
        match self {
            CancelAlgorithm::ReturnPromiseUndefined => Promise::resolved(ctx, ()),
            CancelAlgorithm::Function(f) => flatten(ctx, f(reason)),
        }
    }
}

/// A thrown error becomes a rejected promise.
pub(crate) fn flatten(ctx: &Ctx, result: Result<Promise<()>>) -> Promise<()> {
    match result {
        Ok(promise) => promise,
        Err(err) => promise_resolved_with(ctx, Err(err)),
    }
}
