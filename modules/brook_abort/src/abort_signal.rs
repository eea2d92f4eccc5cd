// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, rc::Rc};

use brook_utils::{Error, Result, Value};
use tracing::trace;

type AbortAlgorithm = Rc<dyn Fn(&AbortSignal)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbortAlgorithmId(u64);

#[derive(Default)]
struct AbortSignalInner {
    aborted: bool,
    reason: Option<Value>,
    algorithms: Vec<(AbortAlgorithmId, AbortAlgorithm)>,
    next_id: u64,
}

/// An externally settable `(aborted, reason)` pair with listeners.
#[derive(Clone)]
pub struct AbortSignal(Rc<RefCell<AbortSignalInner>>);

impl AbortSignal {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(AbortSignalInner::default())))
    }

    pub fn aborted(&self) -> bool {
        self.0.borrow().aborted
    }

    pub fn reason(&self) -> Option<Value> {
        self.0.borrow().reason.clone()
    }

    pub fn throw_if_aborted(&self) -> Result<()> {
        let inner = self.0.borrow();
        if inner.aborted {
            return Err(inner.reason.clone().unwrap_or_default().into());
        }
        Ok(())
    }

    /// Registers `algorithm` to run once when the signal aborts.
    pub fn add_algorithm(&self, algorithm: impl Fn(&AbortSignal) + 'static) -> AbortAlgorithmId {
        let mut inner = self.0.borrow_mut();
        let id = AbortAlgorithmId(inner.next_id);
        inner.next_id += 1;
        inner.algorithms.push((id, Rc::new(algorithm)));
        id
    }

    pub fn remove_algorithm(&self, id: AbortAlgorithmId) {
        self.0
            .borrow_mut()
            .algorithms
            .retain(|(algorithm_id, _)| *algorithm_id != id);
    }

    pub fn ptr_eq(&self, other: &AbortSignal) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// A signal that aborts as soon as any of `signals` does.
    pub fn any(signals: &[AbortSignal]) -> Self {
        let new_signal = AbortSignal::new();

        if let Some(aborted) = signals.iter().find(|signal| signal.aborted()) {
            let mut inner = new_signal.0.borrow_mut();
            inner.aborted = true;
            inner.reason = aborted.reason();
            drop(inner);
            return new_signal;
        }

        for signal in signals {
            let new_signal = new_signal.clone();
            signal.add_algorithm(move |signal| {
                if !new_signal.aborted() {
                    new_signal.send_aborted(signal.reason());
                }
            });
        }

        new_signal
    }

    /// A signal that is already aborted with `reason`.
    pub fn abort(reason: Option<Value>) -> Self {
        let signal = Self::new();
        signal.send_aborted(reason);
        signal
    }

    pub(crate) fn send_aborted(&self, reason: Option<Value>) {
        let mut inner = self.0.borrow_mut();
        inner.aborted = true;
        let reason = match reason {
            Some(reason) if !reason.is_undefined() => reason,
            _ => Error::aborted("This operation was aborted").into(),
        };
        inner.reason = Some(reason);
        let algorithms = std::mem::take(&mut inner.algorithms);
        drop(inner);

        trace!("Signal aborted, running {} algorithms", algorithms.len());
        for (_, algorithm) in algorithms {
            algorithm(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use brook_test::test_sync_with;

    use super::*;
    use crate::AbortController;

    #[tokio::test]
    async fn test_abort_signal() {
        test_sync_with(|_ctx| {
            let controller = AbortController::new();
            let signal = controller.signal();
            let calls = Rc::new(Cell::new(0));
            let removed = signal.add_algorithm(|_| panic!("removed algorithm ran"));
            signal.add_algorithm({
                let calls = calls.clone();
                move |signal| {
                    assert!(signal.aborted());
                    calls.set(calls.get() + 1);
                }
            });
            signal.remove_algorithm(removed);

            assert!(signal.throw_if_aborted().is_ok());
            controller.abort(Some("stop".into()));
            controller.abort(Some("again".into()));

            assert_eq!(calls.get(), 1);
            assert_eq!(signal.reason(), Some(Value::from("stop")));
            assert_eq!(signal.throw_if_aborted(), Err(Error::thrown("stop")));
            Ok(())
        })
        .await;
    }

    #[tokio::test]
    async fn test_default_reason_and_any() {
        test_sync_with(|_ctx| {
            let first = AbortController::new();
            let second = AbortController::new();
            let combined = AbortSignal::any(&[first.signal(), second.signal()]);
            assert!(!combined.aborted());

            second.abort(None);
            assert!(combined.aborted());
            let reason = combined.reason().unwrap();
            assert!(reason.as_error().unwrap().is_aborted());

            let already = AbortSignal::any(&[AbortSignal::abort(Some(1.into()))]);
            assert_eq!(already.reason(), Some(Value::from(1)));
            Ok(())
        })
        .await;
    }
}
