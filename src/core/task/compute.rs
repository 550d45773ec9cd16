use actix::prelude::*;

use super::actor::{CooperativeTask, TaskCore};
use super::messages::CancelTask;
use super::state::TaskId;

#[derive(Debug, Clone)]
pub struct ComputeOutcome<R> {
    pub task_id: TaskId,
    pub value: Option<R>,
}

/// 在计算工作线程上执行一段同步闭包的任务
///
/// 闭包在 `on_start` 中一次执行完毕；被取消时 `value` 为 `None`。
pub struct ComputeJob<R: Send + Unpin + 'static> {
    core: TaskCore<ComputeOutcome<R>>,
    job: Option<Box<dyn FnOnce() -> R + Send>>,
    value: Option<R>,
}

impl<R: Send + Unpin + 'static> ComputeJob<R> {
    pub fn new<F>(job: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
    {
        Self {
            core: TaskCore::new("compute"),
            job: Some(Box::new(job)),
            value: None,
        }
    }
}

impl<R: Send + Unpin + 'static> Actor for ComputeJob<R> {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.begin(ctx);
    }
}

impl<R: Send + Unpin + 'static> Handler<CancelTask> for ComputeJob<R> {
    type Result = ();
    fn handle(&mut self, _msg: CancelTask, ctx: &mut Self::Context) {
        self.cancel(ctx);
    }
}

impl<R: Send + Unpin + 'static> CooperativeTask for ComputeJob<R> {
    type Output = ComputeOutcome<R>;

    fn core(&self) -> &TaskCore<Self::Output> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore<Self::Output> {
        &mut self.core
    }

    fn on_start(&mut self, ctx: &mut Context<Self>) {
        if let Some(job) = self.job.take() {
            self.value = Some(job());
        }
        self.finish(None, ctx);
    }

    fn output(&mut self) -> Self::Output {
        ComputeOutcome { task_id: self.id(), value: self.value.take() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::run_task;

    #[actix_rt::test]
    async fn test_runs_closure_once() {
        let outcome = run_task(ComputeJob::new(|| (1..=10).sum::<u32>())).await;
        assert_eq!(outcome.value, Some(55));
    }

    #[actix_rt::test]
    async fn test_cancelled_before_start_skips_closure() {
        let job = ComputeJob::new(|| -> u32 { panic!("不应执行") });
        job.handle().cancel();
        let outcome = run_task(job).await;
        assert!(outcome.value.is_none());
    }
}
