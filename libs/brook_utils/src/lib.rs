// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
pub mod buffer;
pub mod ctx;
pub mod error;
pub mod promise;
pub mod result;
pub mod value;

pub use self::{
    buffer::{ArrayBuffer, ArrayBufferView, ViewKind},
    ctx::Ctx,
    error::{Error, Result},
    promise::{Promise, PromiseState, ResolveablePromise},
    value::Value,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
