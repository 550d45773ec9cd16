//! 相册同步
//!
//! `GallerySync` 依次经过 获取 → 解析 → 提交 三步：清单由带重试的传输任务获取，
//! 原始字节交给注入的解析器在计算队列上解析，记录连同回应信息交给注入的存储提交。

use actix::prelude::*;
use chrono::{DateTime, Local};
use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

use crate::core::error::TaskError;
use crate::core::manager::{QueueClass, TaskManager};
use crate::core::task::actor::CooperativeTask;
use crate::core::task::compute::ComputeJob;
use crate::core::task::request::ContentTypes;
use crate::core::task::retrying::{FetchedResponse, RetryOutcome, RetryStatus};
use crate::core::task::state::{RetryState, TaskId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GalleryError {
    #[error("获取清单失败: {0}")]
    Fetch(#[from] TaskError),

    #[error("清单解析失败: {0}")]
    Parse(String),

    #[error("提交失败: {0}")]
    Store(String),
}

/// 同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Stopped,
    Getting,
    Parsing,
    Committing,
}

/// 清单中的一张照片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryRecord {
    pub photo_id: String,
    pub display_name: String,
    pub image_url: Url,
    pub thumbnail_url: Option<Url>,
}

/// 清单解析能力，在计算线程上调用
pub trait ManifestParser: Send + Sync + 'static {
    fn parse(&self, manifest: &[u8], base: &Url) -> Result<Vec<GalleryRecord>, GalleryError>;
}

/// 持久化能力，在同步 actor 的线程上调用
pub trait GalleryStore: 'static {
    /// 返回新增和删除的记录数
    fn commit(&mut self, records: Vec<GalleryRecord>, response: &FetchedResponse) -> Result<(usize, usize), GalleryError>;
}

/// 同步状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub state: SyncState,
    pub status: String,
    pub last_sync_date: Option<DateTime<Local>>,
    pub last_sync_error: Option<GalleryError>,
}

/// 立即开始同步；正在同步时无操作
pub struct StartSync;
impl Message for StartSync { type Result = (); }

/// 停止正在进行的同步；没有同步时无操作
pub struct StopSync;
impl Message for StopSync { type Result = (); }

pub struct GetSyncReport;
impl Message for GetSyncReport { type Result = SyncReport; }

struct ManifestFetched(RetryOutcome);
impl Message for ManifestFetched { type Result = (); }

struct ManifestParsed {
    task_id: TaskId,
    result: Result<Vec<GalleryRecord>, GalleryError>,
    response: FetchedResponse,
}
impl Message for ManifestParsed { type Result = (); }

pub struct GallerySync {
    manager: TaskManager,
    url: String,
    parser: Arc<dyn ManifestParser>,
    store: Box<dyn GalleryStore>,
    content_types: ContentTypes,

    state: SyncState,
    get_task: Option<TaskId>,
    parse_task: Option<TaskId>,
    retry_status: Option<watch::Receiver<RetryStatus>>,
    last_sync_date: Option<DateTime<Local>>,
    last_sync_error: Option<GalleryError>,
}

impl GallerySync {
    pub fn new(manager: TaskManager, url: impl Into<String>, parser: Arc<dyn ManifestParser>, store: Box<dyn GalleryStore>) -> Self {
        Self {
            manager,
            url: url.into(),
            parser,
            store,
            content_types: ContentTypes::only(["text/xml", "application/xml"]),
            state: SyncState::Stopped,
            get_task: None,
            parse_task: None,
            retry_status: None,
            last_sync_date: None,
            last_sync_error: None,
        }
    }

    pub fn with_content_types(mut self, types: ContentTypes) -> Self {
        self.content_types = types;
        self
    }

    pub fn is_syncing(&self) -> bool {
        self.state != SyncState::Stopped
    }

    /// 给用户看的同步状态
    pub fn sync_status(&self) -> String {
        match self.state {
            SyncState::Stopped => match (&self.last_sync_error, &self.last_sync_date) {
                (Some(e), _) => format!("更新失败: {}", e),
                (None, Some(date)) => format!("已更新: {}", date.format("%Y-%m-%d %H:%M")),
                (None, None) => "尚未更新".to_string(),
            },
            SyncState::Getting => {
                let waiting = self.retry_status.as_ref().map_or(false, |rx| {
                    let status = *rx.borrow();
                    status.state == RetryState::WaitingToRetry || status.has_had_retryable_failure
                });
                if waiting { "等待网络…".to_string() } else { "更新中…".to_string() }
            }
            SyncState::Parsing | SyncState::Committing => "更新中…".to_string(),
        }
    }

    fn report(&self) -> SyncReport {
        SyncReport {
            state: self.state,
            status: self.sync_status(),
            last_sync_date: self.last_sync_date,
            last_sync_error: self.last_sync_error.clone(),
        }
    }

    fn start_get(&mut self, ctx: &mut Context<Self>) -> Result<(), GalleryError> {
        let request = self.manager.request_to_get(&self.url)?;
        let task = self
            .manager
            .retrying_transfer(request)
            .with_acceptable_content_types(self.content_types.clone());
        self.retry_status = Some(task.status());

        let addr = ctx.address();
        let handle = self.manager.submit(task, QueueClass::Management, Arbiter::current(), move |outcome| {
            addr.do_send(ManifestFetched(outcome));
        });
        self.get_task = Some(handle.id());
        self.state = SyncState::Getting;
        Ok(())
    }

    fn start_parse(&mut self, response: FetchedResponse, ctx: &mut Context<Self>) -> Result<(), GalleryError> {
        let Some(manifest) = response.bytes().cloned() else {
            return Err(GalleryError::Parse("清单没有保存在内存中".into()));
        };
        let base = response.final_response.url.clone();
        let parser = Arc::clone(&self.parser);
        let addr = ctx.address();

        let job = ComputeJob::new(move || parser.parse(&manifest, &base));
        let task_id = job.id();
        let handle = self.manager.submit(job, QueueClass::Compute, Arbiter::current(), move |outcome| {
            // 被取消的解析没有结果
            if let Some(result) = outcome.value {
                addr.do_send(ManifestParsed { task_id, result, response });
            }
        });
        self.parse_task = Some(handle.id());
        self.state = SyncState::Parsing;
        Ok(())
    }

    fn stop_with(&mut self, error: Option<GalleryError>) {
        match &error {
            None => {
                self.last_sync_date = Some(Local::now());
                info!("相册 {} 同步完成", self.url);
            }
            Some(e) => warn!("相册 {} 同步失败: {}", self.url, e),
        }
        self.last_sync_error = error;
        self.state = SyncState::Stopped;
        self.get_task = None;
        self.parse_task = None;
        self.retry_status = None;
    }
}

impl Actor for GallerySync {
    type Context = Context<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        for id in self.get_task.take().into_iter().chain(self.parse_task.take()) {
            self.manager.cancel(id);
        }
    }
}

impl Handler<StartSync> for GallerySync {
    type Result = ();

    fn handle(&mut self, _msg: StartSync, ctx: &mut Self::Context) {
        if self.is_syncing() {
            return;
        }
        info!("相册 {} 开始同步", self.url);
        if let Err(e) = self.start_get(ctx) {
            self.stop_with(Some(e));
        }
    }
}

impl Handler<StopSync> for GallerySync {
    type Result = ();

    fn handle(&mut self, _msg: StopSync, _ctx: &mut Self::Context) {
        if !self.is_syncing() {
            return;
        }
        for id in self.get_task.take().into_iter().chain(self.parse_task.take()) {
            self.manager.cancel(id);
        }
        info!("相册 {} 同步已停止", self.url);
        self.state = SyncState::Stopped;
        self.retry_status = None;
    }
}

impl Handler<GetSyncReport> for GallerySync {
    type Result = MessageResult<GetSyncReport>;

    fn handle(&mut self, _msg: GetSyncReport, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.report())
    }
}

impl Handler<ManifestFetched> for GallerySync {
    type Result = ();

    fn handle(&mut self, msg: ManifestFetched, ctx: &mut Self::Context) {
        let outcome = msg.0;
        if self.state != SyncState::Getting || self.get_task != Some(outcome.task_id) {
            return;
        }
        self.get_task = None;
        let result = outcome
            .result
            .map_err(GalleryError::from)
            .and_then(|response| self.start_parse(response, ctx));
        if let Err(e) = result {
            self.stop_with(Some(e));
        }
    }
}

impl Handler<ManifestParsed> for GallerySync {
    type Result = ();

    fn handle(&mut self, msg: ManifestParsed, _ctx: &mut Self::Context) {
        if self.state != SyncState::Parsing || self.parse_task != Some(msg.task_id) {
            return;
        }
        self.parse_task = None;
        self.state = SyncState::Committing;
        let result = msg
            .result
            .and_then(|records| self.store.commit(records, &msg.response))
            .map(|(added, removed)| info!("相册 {}: 新增 {} 张, 删除 {} 张", self.url, added, removed));
        self.stop_with(result.err());
    }
}
