// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use brook_utils::Value;

use super::AbortSignal;

/// Owns an [`AbortSignal`] and is the only way to trigger it, apart from
/// [`AbortSignal::abort`].
#[derive(Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self, reason: Option<Value>) {
        if self.signal.aborted() {
            //only once
            return;
        }
        self.signal.send_aborted(reason);
    }
}
