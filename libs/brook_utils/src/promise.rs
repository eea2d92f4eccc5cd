// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, fmt, rc::Rc};

use crate::{
    ctx::{Ctx, RejectionTracker},
    error::Result,
    value::Value,
};

type Reaction<T> = Box<dyn FnOnce(std::result::Result<T, Value>)>;

#[derive(Clone, Debug, PartialEq)]
pub enum PromiseState<T> {
    Pending,
    Fulfilled(T),
    Rejected(Value),
}

struct PromiseInner<T> {
    state: PromiseState<T>,
    reactions: Vec<Reaction<T>>,
    handled: bool,
}

impl<T: Clone> RejectionTracker for RefCell<PromiseInner<T>> {
    fn unhandled_reason(&self) -> Option<Value> {
        match &*self.borrow() {
            PromiseInner {
                state: PromiseState::Rejected(reason),
                handled: false,
                ..
            } => Some(reason.clone()),
            _ => None,
        }
    }
}

/// A single-resolution completion handle.
///
/// Reactions registered with [`Promise::react`] (or the `upon_promise` helpers) always run as
/// jobs on the owning [`Ctx`], never synchronously from the code that settled the promise.
#[derive(Clone)]
pub struct Promise<T: Clone + 'static = ()> {
    inner: Rc<RefCell<PromiseInner<T>>>,
    ctx: Ctx,
}

impl<T: Clone + 'static> Promise<T> {
    fn pending(ctx: &Ctx) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PromiseInner {
                state: PromiseState::Pending,
                reactions: Vec::new(),
                handled: false,
            })),
            ctx: ctx.clone(),
        }
    }

    pub fn resolved(ctx: &Ctx, value: T) -> Self {
        let promise = Self::pending(ctx);
        promise.settle(Ok(value));
        promise
    }

    pub fn rejected(ctx: &Ctx, reason: impl Into<Value>) -> Self {
        let promise = Self::pending(ctx);
        promise.settle(Err(reason.into()));
        promise
    }

    pub fn ctx(&self) -> &Ctx {
        &self.ctx
    }

    pub fn state(&self) -> PromiseState<T> {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, PromiseState::Pending)
    }

    /// Marks the promise so a rejection is never reported as unhandled.
    pub fn set_is_handled(&self) {
        self.inner.borrow_mut().handled = true;
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers a fire-and-forget reaction.
    pub fn react(&self, reaction: impl FnOnce(std::result::Result<T, Value>) + 'static) {
        let mut inner = self.inner.borrow_mut();
        inner.handled = true;
        let settled = match &inner.state {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(value) => Some(Ok(value.clone())),
            PromiseState::Rejected(reason) => Some(Err(reason.clone())),
        };
        match settled {
            None => inner.reactions.push(Box::new(reaction)),
            Some(result) => {
                drop(inner);
                self.ctx.enqueue_job(move || reaction(result));
            },
        }
    }

    fn settle(&self, result: std::result::Result<T, Value>) -> bool {
        let mut inner = self.inner.borrow_mut();
        if !matches!(inner.state, PromiseState::Pending) {
            return false;
        }
        inner.state = match &result {
            Ok(value) => PromiseState::Fulfilled(value.clone()),
            Err(reason) => PromiseState::Rejected(reason.clone()),
        };
        let reactions = std::mem::take(&mut inner.reactions);
        let untracked = result.is_err() && reactions.is_empty() && !inner.handled;
        drop(inner);

        if untracked {
            let tracker: std::rc::Weak<dyn RejectionTracker> = Rc::downgrade(&self.inner) as std::rc::Weak<RefCell<PromiseInner<T>>>;
            self.ctx.track_rejection(tracker);
        }
        for reaction in reactions {
            let result = result.clone();
            self.ctx.enqueue_job(move || reaction(result));
        }
        self.ctx.wake();
        true
    }

    /// Waits for every promise to fulfil, rejecting with the first rejection.
    pub fn all(ctx: &Ctx, promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
        let result = ResolveablePromise::new(ctx);
        if promises.is_empty() {
            result.resolve(Vec::new());
            return result.promise;
        }
        let values = Rc::new(RefCell::new(vec![None; promises.len()]));
        let remaining = Rc::new(RefCell::new(promises.len()));
        for (index, promise) in promises.into_iter().enumerate() {
            let result = result.clone();
            let values = values.clone();
            let remaining = remaining.clone();
            promise.react(move |outcome| match outcome {
                Ok(value) => {
                    values.borrow_mut()[index] = Some(value);
                    *remaining.borrow_mut() -= 1;
                    if *remaining.borrow() == 0 {
                        let values = values.take().into_iter().flatten().collect();
                        result.resolve(values);
                    }
                },
                Err(reason) => result.reject(reason),
            });
        }
        result.promise
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Promise").field(&self.state()).finish()
    }
}

/// A promise together with the ability to settle it.
#[derive(Clone)]
pub struct ResolveablePromise<T: Clone + 'static = ()> {
    pub promise: Promise<T>,
}

impl<T: Clone + 'static> ResolveablePromise<T> {
    pub fn new(ctx: &Ctx) -> Self {
        Self {
            promise: Promise::pending(ctx),
        }
    }

    pub fn resolved(ctx: &Ctx, value: T) -> Self {
        Self {
            promise: Promise::resolved(ctx, value),
        }
    }

    pub fn rejected(ctx: &Ctx, reason: impl Into<Value>) -> Self {
        Self {
            promise: Promise::rejected(ctx, reason),
        }
    }

    /// Settling an already settled promise is a no-op.
    pub fn resolve(&self, value: T) {
        self.promise.settle(Ok(value));
    }

    pub fn reject(&self, reason: impl Into<Value>) {
        self.promise.settle(Err(reason.into()));
    }

    pub fn settle_with(&self, result: std::result::Result<T, Value>) {
        self.promise.settle(result);
    }

    pub fn is_pending(&self) -> bool {
        self.promise.is_pending()
    }

    pub fn set_is_handled(&self) {
        self.promise.set_is_handled()
    }
}

impl ResolveablePromise<()> {
    pub fn resolve_undefined(&self) {
        self.resolve(())
    }
}

pub fn promise_resolved_with<T: Clone + 'static>(ctx: &Ctx, value: Result<T>) -> Promise<T> {
    match value {
        Ok(value) => Promise::resolved(ctx, value),
        Err(err) => Promise::rejected(ctx, err),
    }
}

pub fn promise_rejected_with<T: Clone + 'static>(ctx: &Ctx, reason: impl Into<Value>) -> Promise<T> {
    Promise::rejected(ctx, reason)
}

// https://webidl.spec.whatwg.org/#dfn-perform-steps-once-promise-is-settled
pub fn upon_promise<Input: Clone + 'static, Output: Clone + 'static>(
    promise: &Promise<Input>,
    then: impl FnOnce(std::result::Result<Input, Value>) -> Result<Output> + 'static,
) -> Promise<Output> {
    let result = ResolveablePromise::new(promise.ctx());
    promise.react({
        let result = result.clone();
        move |outcome| result.settle_with(then(outcome).map_err(Value::from))
    });
    result.promise
}

pub fn upon_promise_fulfilment<Input: Clone + 'static, Output: Clone + 'static>(
    promise: &Promise<Input>,
    then: impl FnOnce(Input) -> Result<Output> + 'static,
) -> Promise<Output> {
    upon_promise(promise, move |outcome| match outcome {
        Ok(value) => then(value),
        Err(reason) => Err(reason.into()),
    })
}

/// Like [`upon_promise`], but the reaction returns a promise whose outcome is adopted.
pub fn upon_promise_chain<Input: Clone + 'static, Output: Clone + 'static>(
    promise: &Promise<Input>,
    then: impl FnOnce(std::result::Result<Input, Value>) -> Result<Promise<Output>> + 'static,
) -> Promise<Output> {
    let result = ResolveablePromise::new(promise.ctx());
    promise.react({
        let result = result.clone();
        move |outcome| match then(outcome) {
            Ok(inner) => inner.react(move |outcome| result.settle_with(outcome)),
            Err(err) => result.reject(err),
        }
    });
    result.promise
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn reactions_never_run_synchronously() {
        let ctx = Ctx::new();
        let ran = Rc::new(RefCell::new(false));
        let promise = Promise::resolved(&ctx, 1);
        promise.react({
            let ran = ran.clone();
            move |_| *ran.borrow_mut() = true
        });
        assert!(!*ran.borrow());
        ctx.execute_pending_jobs();
        assert!(*ran.borrow());
    }

    #[test]
    fn settles_only_once() {
        let ctx = Ctx::new();
        let resolver = ResolveablePromise::new(&ctx);
        resolver.resolve(1);
        resolver.reject("late");
        resolver.resolve(2);
        assert_eq!(resolver.promise.state(), PromiseState::Fulfilled(1));
    }

    #[tokio::test]
    async fn chains_and_maps_errors() {
        let ctx = Ctx::new();
        let source = Promise::resolved(&ctx, 2);
        let doubled = upon_promise_fulfilment(&source, |n| Ok(n * 2));
        let failed: Promise<()> =
            upon_promise_fulfilment(&doubled, |_| Err(Error::state("nope")));
        let adopted = upon_promise_chain(&doubled, {
            let ctx = ctx.clone();
            move |n| Ok(Promise::resolved(&ctx, n.unwrap_or_default() + 1))
        });

        assert_eq!(ctx.settle(&doubled).await.unwrap(), 4);
        assert_eq!(ctx.settle(&adopted).await.unwrap(), 5);
        let reason = ctx.settle(&failed).await.unwrap_err();
        assert!(Error::from(reason).is_state());
    }

    #[tokio::test]
    async fn all_collects_in_order() {
        let ctx = Ctx::new();
        let first = ResolveablePromise::new(&ctx);
        let second = Promise::resolved(&ctx, "b");
        let all = Promise::all(&ctx, vec![first.promise.clone(), second]);
        ctx.execute_pending_jobs();
        assert!(all.is_pending());
        first.resolve("a");
        assert_eq!(ctx.settle(&all).await.unwrap(), vec!["a", "b"]);

        let failing = Promise::all(
            &ctx,
            vec![Promise::<()>::rejected(&ctx, "x"), Promise::resolved(&ctx, ())],
        );
        assert_eq!(ctx.settle(&failing).await.unwrap_err(), Value::from("x"));
    }
}
