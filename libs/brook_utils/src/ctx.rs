// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    cell::RefCell,
    collections::VecDeque,
    future::poll_fn,
    rc::{Rc, Weak},
    task::{Poll, Waker},
};

use tracing::{trace, warn};

use crate::{
    promise::{Promise, PromiseState},
    value::Value,
};

type Job = Box<dyn FnOnce()>;

pub(crate) trait RejectionTracker {
    fn unhandled_reason(&self) -> Option<Value>;
}

/// The deferred continuation queue that every promise reaction runs on.
///
/// Jobs never run synchronously from the code that enqueued them; the owner drains the
/// queue with [`Ctx::execute_pending_jobs`] or by awaiting [`Ctx::settle`].
#[derive(Clone, Default)]
pub struct Ctx(Rc<CtxInner>);

#[derive(Default)]
struct CtxInner {
    jobs: RefCell<VecDeque<Job>>,
    rejections: RefCell<Vec<Weak<dyn RejectionTracker>>>,
    unhandled: RefCell<Vec<Value>>,
    waker: RefCell<Option<Waker>>,
}

impl Ctx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_job(&self, job: impl FnOnce() + 'static) {
        self.0.jobs.borrow_mut().push_back(Box::new(job));
        self.wake();
    }

    pub fn is_job_pending(&self) -> bool {
        !self.0.jobs.borrow().is_empty()
    }

    /// Runs the oldest pending job, returning false when the queue was empty.
    pub fn execute_pending_job(&self) -> bool {
        let job = self.0.jobs.borrow_mut().pop_front();
        match job {
            Some(job) => {
                job();
                true
            },
            None => false,
        }
    }

    /// Runs jobs until the queue is empty, including jobs enqueued while draining.
    pub fn execute_pending_jobs(&self) {
        let mut count = 0usize;
        while self.execute_pending_job() {
            count += 1;
        }
        if count > 0 {
            trace!("Executed {} pending jobs", count);
        }
        self.check_rejections();
    }

    /// Drives the job queue until `promise` settles.
    pub async fn settle<T: Clone + 'static>(&self, promise: &Promise<T>) -> Result<T, Value> {
        promise.set_is_handled();
        poll_fn(|cx| {
            self.execute_pending_jobs();
            match promise.state() {
                PromiseState::Pending => {
                    self.0.waker.replace(Some(cx.waker().clone()));
                    Poll::Pending
                },
                PromiseState::Fulfilled(value) => Poll::Ready(Ok(value)),
                PromiseState::Rejected(reason) => Poll::Ready(Err(reason)),
            }
        })
        .await
    }

    /// Rejections that were still unhandled when the job queue last ran dry.
    pub fn take_unhandled_rejections(&self) -> Vec<Value> {
        self.0.unhandled.take()
    }

    pub(crate) fn track_rejection(&self, tracker: Weak<dyn RejectionTracker>) {
        self.0.rejections.borrow_mut().push(tracker);
    }

    pub(crate) fn wake(&self) {
        if let Some(waker) = self.0.waker.take() {
            waker.wake();
        }
    }

    fn check_rejections(&self) {
        let rejections = self.0.rejections.take();
        for tracker in rejections.iter().filter_map(Weak::upgrade) {
            if let Some(reason) = tracker.unhandled_reason() {
                warn!("Unhandled promise rejection: {}", reason);
                self.0.unhandled.borrow_mut().push(reason);
            }
        }
    }
}
