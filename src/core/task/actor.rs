//! 协作任务的基础抽象
//!
//! 每个任务都是绑定到唯一事件循环线程（`Arbiter`）的 actor。
//! 子类型通过 `on_start` / `on_will_finish` 两个钩子接入生命周期，
//! `finish` 是唯一的结束路径。

use actix::dev::ToEnvelope;
use actix::prelude::*;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use tokio::sync::oneshot;

use crate::core::error::TaskError;
use super::messages::CancelTask;
use super::state::{TaskId, TaskState};

/// 任务句柄，可在任意线程克隆和取消
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    cancel_requested: Arc<AtomicBool>,
    mailbox: Arc<Mutex<Option<Recipient<CancelTask>>>>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            id: TaskId::new(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            mailbox: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// 标记取消；真正的结束发生在任务自己的事件循环上
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        let mailbox = self.mailbox.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(recipient) = mailbox.as_ref() {
            recipient.do_send(CancelTask);
        }
    }

    /// 任务被调度到事件循环后绑定其邮箱
    pub(crate) fn bind<A>(&self, addr: &Addr<A>)
    where
        A: Actor<Context = Context<A>> + Handler<CancelTask>,
        A::Context: ToEnvelope<A, CancelTask>,
    {
        let recipient = addr.clone().recipient();
        let mut mailbox = self.mailbox.lock().unwrap_or_else(PoisonError::into_inner);
        *mailbox = Some(recipient.clone());
        drop(mailbox);
        // cancel() 可能在绑定之前已经设置了标志
        if self.is_cancel_requested() {
            recipient.do_send(CancelTask);
        }
    }
}

/// 每个协作任务共有的状态：生命周期、错误槽、事件循环归属
pub struct TaskCore<O> {
    handle: TaskHandle,
    label: &'static str,
    state: TaskState,
    error: Option<TaskError>,
    event_loop: Option<ArbiterHandle>,
    thread: Option<ThreadId>,
    completion: Option<oneshot::Sender<O>>,
}

impl<O> TaskCore<O> {
    pub fn new(label: &'static str) -> Self {
        Self {
            handle: TaskHandle::new(),
            label,
            state: TaskState::Idle,
            error: None,
            event_loop: None,
            thread: None,
            completion: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    pub fn event_loop(&self) -> Option<&ArbiterHandle> {
        self.event_loop.as_ref()
    }

    /// 只能在调度之前设置
    pub fn set_event_loop(&mut self, event_loop: ArbiterHandle) {
        debug_assert_eq!(self.state, TaskState::Idle, "调度后不能修改事件循环");
        if self.state == TaskState::Idle {
            self.event_loop = Some(event_loop);
        }
    }

    /// 订阅任务结束时产生的输出
    pub(crate) fn completion(&mut self) -> oneshot::Receiver<O> {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        rx
    }

    pub fn is_on_event_loop(&self) -> bool {
        self.thread.map_or(true, |t| t == thread::current().id())
    }
}

/// 协作任务的能力接口
///
/// 实现者需要在 `Actor::started` 中调用 [`CooperativeTask::begin`]，
/// 并在 `Handler<CancelTask>` 中调用 [`CooperativeTask::cancel`]。
pub trait CooperativeTask: Actor<Context = Context<Self>> + Handler<CancelTask> {
    type Output: Send + 'static;

    /// 任务自己会向传输队列提交嵌套尝试；这类任务不能占用传输队列的槽位
    const SUBMITS_NESTED_TRANSFERS: bool = false;

    fn core(&self) -> &TaskCore<Self::Output>;
    fn core_mut(&mut self) -> &mut TaskCore<Self::Output>;

    /// 在事件循环线程上调用，用于注册事件源；允许同步调用 `finish`
    fn on_start(&mut self, ctx: &mut Context<Self>);

    /// 状态正式变为 Finished 之前调用，此时仍可读取错误槽
    fn on_will_finish(&mut self, _ctx: &mut Context<Self>) {}

    /// 任务结束时交给完成回调的结果
    fn output(&mut self) -> Self::Output;

    fn id(&self) -> TaskId {
        self.core().id()
    }

    fn handle(&self) -> TaskHandle {
        self.core().handle()
    }

    fn state(&self) -> TaskState {
        self.core().state()
    }

    fn error(&self) -> Option<&TaskError> {
        self.core().error()
    }

    /// Idle → Running
    fn begin(&mut self, ctx: &mut Context<Self>) {
        let core = self.core_mut();
        if !core.state.advance(TaskState::Running) {
            warn!("[task {}] 重复启动被忽略", core.id());
            return;
        }
        core.thread = Some(thread::current().id());
        debug!("[task {}] {} 开始", core.id(), core.label);

        if core.handle.is_cancel_requested() {
            self.finish(Some(TaskError::Cancelled), ctx);
            return;
        }
        self.on_start(ctx);
    }

    /// 在事件循环上应用取消；已结束的任务忽略
    fn cancel(&mut self, ctx: &mut Context<Self>) {
        if self.state() == TaskState::Running {
            debug!("[task {}] 取消", self.id());
            self.finish(Some(TaskError::Cancelled), ctx);
        }
    }

    /// 唯一的结束路径：Running → Finished
    fn finish(&mut self, error: Option<TaskError>, ctx: &mut Context<Self>) {
        if self.state() != TaskState::Running {
            return;
        }
        assert!(self.core().is_on_event_loop(), "finish 必须在任务的事件循环线程上调用");

        let core = self.core_mut();
        if core.error.is_none() {
            core.error = error;
        }
        self.on_will_finish(ctx);

        let core = self.core_mut();
        core.state.advance(TaskState::Finished);
        match &core.error {
            None => debug!("[task {}] {} 完成", core.id(), core.label),
            Some(e) => debug!("[task {}] {} 结束: {}", core.id(), core.label, e),
        }

        let output = self.output();
        if let Some(tx) = self.core_mut().completion.take() {
            let _ = tx.send(output);
        }
        ctx.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// 在 on_start 中同步结束或等待取消的最小任务
    struct RecordingTask {
        core: TaskCore<(TaskState, Option<TaskError>, Vec<TaskState>)>,
        fail_fast: bool,
        seen: Vec<TaskState>,
    }

    impl RecordingTask {
        fn new(fail_fast: bool) -> Self {
            Self { core: TaskCore::new("recording"), fail_fast, seen: Vec::new() }
        }
    }

    impl Actor for RecordingTask {
        type Context = Context<Self>;
        fn started(&mut self, ctx: &mut Self::Context) {
            self.begin(ctx);
        }
    }

    impl Handler<CancelTask> for RecordingTask {
        type Result = ();
        fn handle(&mut self, _msg: CancelTask, ctx: &mut Self::Context) {
            self.cancel(ctx);
        }
    }

    impl CooperativeTask for RecordingTask {
        type Output = (TaskState, Option<TaskError>, Vec<TaskState>);

        fn core(&self) -> &TaskCore<Self::Output> { &self.core }
        fn core_mut(&mut self) -> &mut TaskCore<Self::Output> { &mut self.core }

        fn on_start(&mut self, ctx: &mut Context<Self>) {
            self.seen.push(self.state());
            if self.fail_fast {
                self.finish(Some(TaskError::InvalidRequest("fast".into())), ctx);
            }
        }

        fn on_will_finish(&mut self, _ctx: &mut Context<Self>) {
            // 错误槽已写入，但状态尚未变为 Finished
            self.seen.push(self.state());
            assert!(self.error().is_some());
        }

        fn output(&mut self) -> Self::Output {
            (self.state(), self.error().cloned(), self.seen.clone())
        }
    }

    #[actix_rt::test]
    async fn test_on_start_may_finish_synchronously() {
        let mut task = RecordingTask::new(true);
        let done = task.core_mut().completion();
        let _addr = task.start();

        let (state, error, seen) = done.await.unwrap();
        assert_eq!(state, TaskState::Finished);
        assert_eq!(error, Some(TaskError::InvalidRequest("fast".into())));
        assert_eq!(seen, vec![TaskState::Running, TaskState::Running]);
    }

    #[actix_rt::test]
    async fn test_cancel_finishes_with_cancelled() {
        let mut task = RecordingTask::new(false);
        let done = task.core_mut().completion();
        let handle = task.handle();
        let addr = task.start();
        handle.bind(&addr);

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        // 重复取消是无操作
        handle.cancel();

        let (state, error, _) = done.await.unwrap();
        assert_eq!(state, TaskState::Finished);
        assert_eq!(error, Some(TaskError::Cancelled));
    }

    #[actix_rt::test]
    async fn test_cancel_before_start_never_runs_on_start() {
        let mut task = RecordingTask::new(false);
        let done = task.core_mut().completion();
        task.handle().cancel();
        let _addr = task.start();

        let (_, error, seen) = done.await.unwrap();
        assert_eq!(error, Some(TaskError::Cancelled));
        // on_start 没有被调用，只有 on_will_finish 记录了一次
        assert_eq!(seen, vec![TaskState::Running]);
    }
}
