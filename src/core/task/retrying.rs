//! 带重试的传输任务
//!
//! 每次尝试是一个提交到传输队列的 `HttpTransfer`。可重试的失败进入等待状态，
//! 由退避定时器、主机重新可达、同主机其他请求成功三者中最先发生的一个唤醒。
//! 状态的客户端镜像通过 UI 线程上的 `watch` 通道发布。

use actix::prelude::*;
use bytes::Bytes;
use futures::future;
use futures::StreamExt;
use log::{debug, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::core::error::TaskError;
use crate::core::manager::{QueueClass, TaskManager};
use super::actor::{CooperativeTask, TaskCore};
use super::auth::Authenticator;
use super::http::HttpOutcome;
use super::messages::{AttemptFinished, CancelTask, ReachabilityFinished};
use super::reachability::ReachabilityOutcome;
use super::request::{ContentTypes, HttpRequest, ResponseDestination, ResponseHead, StatusCodes};
use super::retry::RetryPolicy;
use super::state::{RetryState, TaskId, TaskState};
use super::util::ResponseBody;

/// UI 线程上可见的重试状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStatus {
    pub state: RetryState,
    pub has_had_retryable_failure: bool,
}

impl Default for RetryStatus {
    fn default() -> Self {
        Self { state: RetryState::NotStarted, has_had_retryable_failure: false }
    }
}

/// 成功获取的内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseContent {
    Memory(Bytes),
    File(PathBuf),
}

/// 交给持久化方的结果
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub content: ResponseContent,
    pub mime_type: Option<String>,
    pub final_request: HttpRequest,
    pub final_response: ResponseHead,
}

impl FetchedResponse {
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.content {
            ResponseContent::Memory(bytes) => Some(bytes),
            ResponseContent::File(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub task_id: TaskId,
    pub request: HttpRequest,
    pub retry_count: u32,
    pub result: Result<FetchedResponse, TaskError>,
}

/// 唤醒等待中重试的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeSource {
    Timer,
    Reachability,
    SiblingSuccess,
}

impl fmt::Display for WakeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WakeSource::Timer => "退避定时器",
            WakeSource::Reachability => "主机重新可达",
            WakeSource::SiblingSuccess => "同主机请求成功",
        };
        f.write_str(name)
    }
}

/// 同主机的其他请求刚刚成功
struct SiblingSucceeded;

pub struct RetryingTransfer {
    core: TaskCore<RetryOutcome>,
    manager: TaskManager,
    request: HttpRequest,
    acceptable_status_codes: StatusCodes,
    acceptable_content_types: ContentTypes,
    response_file_path: Option<PathBuf>,
    authenticator: Option<Arc<dyn Authenticator>>,
    policy: RetryPolicy,

    retry_state: RetryState,
    retry_count: u32,
    client: Arc<watch::Sender<RetryStatus>>,

    attempt: Option<TaskId>,
    reachability: Option<TaskId>,
    timer: Option<SpawnHandle>,
    listener: Option<SpawnHandle>,
    response: Option<FetchedResponse>,
}

impl RetryingTransfer {
    pub fn new(manager: TaskManager, request: HttpRequest) -> Self {
        let (client, _) = watch::channel(RetryStatus::default());
        Self {
            core: TaskCore::new("retrying"),
            manager,
            request,
            acceptable_status_codes: StatusCodes::default(),
            acceptable_content_types: ContentTypes::any(),
            response_file_path: None,
            authenticator: None,
            policy: RetryPolicy::default(),
            retry_state: RetryState::NotStarted,
            retry_count: 0,
            client: Arc::new(client),
            attempt: None,
            reachability: None,
            timer: None,
            listener: None,
            response: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_acceptable_status_codes(mut self, codes: StatusCodes) -> Self {
        self.acceptable_status_codes = codes;
        self
    }

    pub fn with_acceptable_content_types(mut self, types: ContentTypes) -> Self {
        self.acceptable_content_types = types;
        self
    }

    /// 设置后每次尝试都把回应体写入该文件（截断重写）
    pub fn with_response_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.response_file_path = Some(path.into());
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry_state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// 订阅客户端状态镜像；只应在 UI 线程上读取
    pub fn status(&self) -> watch::Receiver<RetryStatus> {
        self.client.subscribe()
    }

    /// 状态迁移，同时把镜像更新投递到 UI 线程
    fn set_retry_state(&mut self, state: RetryState, retryable_failure: bool) {
        debug!("[task {}] 重试状态 {:?} -> {:?}", self.id(), self.retry_state, state);
        self.retry_state = state;
        let client = Arc::clone(&self.client);
        self.manager.ui().spawn_fn(move || {
            client.send_modify(|status| {
                status.state = state;
                if retryable_failure {
                    status.has_had_retryable_failure = true;
                }
            });
        });
    }

    fn start_attempt(&mut self, ctx: &mut Context<Self>) {
        let mut transfer = self
            .manager
            .http_transfer(self.request.clone())
            .with_acceptable_status_codes(self.acceptable_status_codes.clone())
            .with_acceptable_content_types(self.acceptable_content_types.clone());
        if let Some(path) = &self.response_file_path {
            transfer = transfer.with_destination(ResponseDestination::File(path.clone()));
        }
        if let Some(authenticator) = &self.authenticator {
            transfer = transfer.with_authenticator(Arc::clone(authenticator));
        }

        let addr = ctx.address();
        let handle = self.manager.submit(transfer, QueueClass::Transfer, Arbiter::current(), move |outcome: HttpOutcome| {
            addr.do_send(AttemptFinished { task_id: outcome.task_id, outcome });
        });
        debug!("[task {}] 第 {} 次尝试: {}", self.id(), self.retry_count + 1, handle.id());
        self.attempt = Some(handle.id());
    }

    fn wait_to_retry(&mut self, ctx: &mut Context<Self>) {
        self.set_retry_state(RetryState::WaitingToRetry, true);

        let delay = self.policy.delay(self.retry_count);
        info!("[task {}] {:.1} 秒后重试 {}", self.id(), delay.as_secs_f64(), self.request);
        self.timer = Some(ctx.run_later(delay, |act, ctx| {
            act.timer = None;
            act.wake(WakeSource::Timer, ctx);
        }));

        let addr = ctx.address();
        let monitor = self.manager.monitor_reachability(self.request.host(), self.request.port());
        let handle = self.manager.submit(monitor, QueueClass::Management, Arbiter::current(), move |outcome: ReachabilityOutcome| {
            addr.do_send(ReachabilityFinished { task_id: outcome.task_id, outcome });
        });
        self.reachability = Some(handle.id());

        let host = self.request.host().to_ascii_lowercase();
        let siblings = self.manager.success_notifier().subscribe().filter_map(move |item| {
            let hit = matches!(&item, Ok(succeeded) if *succeeded == host);
            future::ready(hit.then_some(SiblingSucceeded))
        });
        self.listener = Some(ctx.add_stream(siblings));
    }

    /// 撤掉等待期间的三个唤醒源
    fn stop_waiting(&mut self, ctx: &mut Context<Self>) {
        if let Some(timer) = self.timer.take() {
            ctx.cancel_future(timer);
        }
        if let Some(listener) = self.listener.take() {
            ctx.cancel_future(listener);
        }
        if let Some(id) = self.reachability.take() {
            self.manager.cancel(id);
        }
    }

    /// 最先到达的唤醒源生效，其余的被撤掉或忽略
    fn wake(&mut self, source: WakeSource, ctx: &mut Context<Self>) {
        if self.state() != TaskState::Running || self.retry_state != RetryState::WaitingToRetry {
            return;
        }
        info!("[task {}] {} 唤醒重试", self.id(), source);
        self.stop_waiting(ctx);
        self.set_retry_state(RetryState::Retrying, false);
        self.retry_count += 1;
        self.set_retry_state(RetryState::Fetching, false);
        self.start_attempt(ctx);
    }

    fn did_succeed(&mut self, outcome: HttpOutcome, body: ResponseBody, ctx: &mut Context<Self>) {
        let mime_type = outcome.mime_type();
        let (Some(final_request), Some(final_response)) = (outcome.last_request, outcome.last_response) else {
            self.finish(Some(TaskError::Failed("传输成功但缺少回应信息".into())), ctx);
            return;
        };
        let content = match (body, &self.response_file_path) {
            (ResponseBody::Memory(bytes), _) => ResponseContent::Memory(bytes),
            (ResponseBody::Streamed { .. }, Some(path)) => ResponseContent::File(path.clone()),
            (ResponseBody::Streamed { .. }, None) => {
                self.finish(Some(TaskError::Failed("回应体写入了未知的输出流".into())), ctx);
                return;
            }
        };
        self.response = Some(FetchedResponse { content, mime_type, final_request, final_response });
        self.manager.success_notifier().publish(self.request.host());
        self.finish(None, ctx);
    }
}

impl Actor for RetryingTransfer {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.begin(ctx);
    }
}

impl Handler<CancelTask> for RetryingTransfer {
    type Result = ();
    fn handle(&mut self, _msg: CancelTask, ctx: &mut Self::Context) {
        self.cancel(ctx);
    }
}

impl Handler<AttemptFinished> for RetryingTransfer {
    type Result = ();

    fn handle(&mut self, msg: AttemptFinished, ctx: &mut Self::Context) {
        if self.state() != TaskState::Running || self.attempt != Some(msg.task_id) {
            return;
        }
        self.attempt = None;
        let mut outcome = msg.outcome;
        let result = std::mem::replace(&mut outcome.result, Err(TaskError::Cancelled));
        match result {
            Ok(body) => self.did_succeed(outcome, body, ctx),
            Err(error) if self.policy.should_retry(&error) => {
                warn!("[task {}] 可重试的失败: {}", self.id(), error);
                self.wait_to_retry(ctx);
            }
            Err(error) => {
                warn!("[task {}] 不可重试的失败: {}", self.id(), error);
                self.finish(Some(error), ctx);
            }
        }
    }
}

impl Handler<ReachabilityFinished> for RetryingTransfer {
    type Result = ();

    fn handle(&mut self, msg: ReachabilityFinished, ctx: &mut Self::Context) {
        if self.reachability != Some(msg.task_id) {
            return;
        }
        self.reachability = None;
        match msg.outcome.result {
            Ok(()) => self.wake(WakeSource::Reachability, ctx),
            // 监视失败时只剩定时器和同主机通知
            Err(e) => debug!("[task {}] 可达性监视结束: {}", self.id(), e),
        }
    }
}

impl StreamHandler<SiblingSucceeded> for RetryingTransfer {
    fn handle(&mut self, _item: SiblingSucceeded, ctx: &mut Self::Context) {
        self.wake(WakeSource::SiblingSuccess, ctx);
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        self.listener = None;
    }
}

impl CooperativeTask for RetryingTransfer {
    type Output = RetryOutcome;

    const SUBMITS_NESTED_TRANSFERS: bool = true;

    fn core(&self) -> &TaskCore<RetryOutcome> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore<RetryOutcome> {
        &mut self.core
    }

    fn on_start(&mut self, ctx: &mut Context<Self>) {
        self.set_retry_state(RetryState::Fetching, false);
        self.start_attempt(ctx);
    }

    fn on_will_finish(&mut self, ctx: &mut Context<Self>) {
        self.stop_waiting(ctx);
        if let Some(id) = self.attempt.take() {
            self.manager.cancel(id);
        }
        self.set_retry_state(RetryState::Finished, false);
    }

    fn output(&mut self) -> RetryOutcome {
        let result = match self.error() {
            Some(e) => Err(e.clone()),
            None => self
                .response
                .take()
                .ok_or_else(|| TaskError::Failed("没有回应".into())),
        };
        RetryOutcome {
            task_id: self.id(),
            request: self.request.clone(),
            retry_count: self.retry_count,
            result,
        }
    }
}
