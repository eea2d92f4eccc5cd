// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{borrow::Cow, rc::Rc};

use crate::value::Value;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by stream operations.
///
/// Every variant can travel as a rejection reason: converting an [`Error`] into a
/// [`Value`] and back yields the same error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Inconsistent caller arguments. The stream is left untouched.
    #[error("ValidationError: {0}")]
    Validation(Cow<'static, str>),
    /// Operation on a closed, errored, released or locked stream.
    #[error("StateError: {0}")]
    State(Cow<'static, str>),
    /// Use of a buffer whose storage has already been transferred.
    #[error("BufferOwnershipError: {0}")]
    BufferOwnership(Cow<'static, str>),
    #[error("AbortError: {0}")]
    Aborted(Cow<'static, str>),
    /// A user supplied algorithm failed with this value.
    #[error("{0}")]
    Thrown(Value),
}

impl Error {
    pub fn validation(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn state(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::State(msg.into())
    }

    pub fn detached(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::BufferOwnership(msg.into())
    }

    pub fn aborted(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Aborted(msg.into())
    }

    pub fn thrown(value: impl Into<Value>) -> Self {
        Self::Thrown(value.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_state(&self) -> bool {
        matches!(self, Self::State(_))
    }

    pub fn is_buffer_ownership(&self) -> bool {
        matches!(self, Self::BufferOwnership(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

impl From<Error> for Value {
    fn from(err: Error) -> Self {
        match err {
            Error::Thrown(value) => value,
            err => Value::Error(Rc::new(err)),
        }
    }
}

impl From<Value> for Error {
    fn from(value: Value) -> Self {
        match value {
            Value::Error(err) => Rc::unwrap_or_clone(err),
            value => Error::Thrown(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_through_value() {
        let err = Error::state("stream is locked");
        let value: Value = err.clone().into();
        assert!(matches!(value, Value::Error(_)));
        assert_eq!(Error::from(value), err);

        let thrown = Error::thrown("boom");
        assert_eq!(Value::from(thrown), Value::from("boom"));
        assert_eq!(Error::from(Value::from(1.0)), Error::Thrown(Value::Number(1.0)));
    }

    #[test]
    fn displays_kind_and_message() {
        assert_eq!(
            Error::validation("view is empty").to_string(),
            "ValidationError: view is empty"
        );
        assert_eq!(Error::thrown("boom").to_string(), "boom");
    }
}
