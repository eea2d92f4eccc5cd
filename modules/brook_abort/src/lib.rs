// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#![allow(clippy::new_without_default)]
pub use self::{
    abort_controller::AbortController,
    abort_signal::{AbortAlgorithmId, AbortSignal},
};

mod abort_controller;
mod abort_signal;
