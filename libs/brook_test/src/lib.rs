use std::{future::Future, pin::Pin};

use brook_utils::{Ctx, Result};

pub async fn given_ctx() -> Ctx {
    Ctx::new()
}

pub async fn test_async_with<F>(func: F)
where
    F: FnOnce(Ctx) -> Pin<Box<dyn Future<Output = ()>>>,
{
    test_async_with_opts(func, TestOptions::default()).await;
}

#[derive(Default)]
pub struct TestOptions {
    no_pending_jobs: bool,
    allow_unhandled_rejections: bool,
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_pending_jobs(mut self) -> Self {
        self.no_pending_jobs = true;
        self
    }

    pub fn allow_unhandled_rejections(mut self) -> Self {
        self.allow_unhandled_rejections = true;
        self
    }
}

pub async fn test_async_with_opts<F>(func: F, options: TestOptions)
where
    F: FnOnce(Ctx) -> Pin<Box<dyn Future<Output = ()>>>,
{
    let ctx = given_ctx().await;

    func(ctx.clone()).await;

    if options.no_pending_jobs {
        assert!(!ctx.is_job_pending());
    }

    ctx.execute_pending_jobs();
    if !options.allow_unhandled_rejections {
        let unhandled = ctx.take_unhandled_rejections();
        assert!(unhandled.is_empty(), "unhandled rejections: {unhandled:?}");
    }
}

pub async fn test_sync_with<F>(func: F)
where
    F: FnOnce(Ctx) -> Result<()>,
{
    let ctx = given_ctx().await;

    func(ctx.clone()).unwrap();

    ctx.execute_pending_jobs();
    let unhandled = ctx.take_unhandled_rejections();
    assert!(unhandled.is_empty(), "unhandled rejections: {unhandled:?}");
}
