// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{fmt::Display, result::Result as StdResult};

use crate::error::{Error, Result};

pub trait ResultExt<T> {
    fn or_throw_validation(self, msg: &str) -> Result<T>;
    fn or_throw_state(self, msg: &str) -> Result<T>;
    fn or_throw_detached(self, msg: &str) -> Result<T>;
}

fn message(msg: &str, err: impl Display) -> String {
    if msg.is_empty() {
        err.to_string()
    } else {
        format!("{msg}. {err}")
    }
}

impl<T, E: Display> ResultExt<T> for StdResult<T, E> {
    fn or_throw_validation(self, msg: &str) -> Result<T> {
        self.map_err(|e| Error::validation(message(msg, e)))
    }

    fn or_throw_state(self, msg: &str) -> Result<T> {
        self.map_err(|e| Error::state(message(msg, e)))
    }

    fn or_throw_detached(self, msg: &str) -> Result<T> {
        self.map_err(|e| Error::detached(message(msg, e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn or_throw_validation(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| Error::validation(msg.to_string()))
    }

    fn or_throw_state(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| Error::state(msg.to_string()))
    }

    fn or_throw_detached(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| Error::detached(msg.to_string()))
    }
}
