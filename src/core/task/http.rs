//! 单次 HTTP 交换任务
//!
//! 在任务的事件循环上打开连接，逐跳处理重定向与认证质询，
//! 校验状态码和内容类型，把回应体累积在内存里或写入输出流。

use actix::prelude::*;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use std::sync::Arc;

use crate::core::error::{TaskError, TransportError, TransportErrorKind};
use super::actor::{CooperativeTask, TaskCore};
use super::auth::{AuthChallenge, Authenticator, ChallengeDisposition};
use super::messages::CancelTask;
use super::request::{ContentTypes, HttpRequest, ResponseDestination, ResponseHead, StatusCodes};
use super::state::{TaskId, TaskState};
use super::transport::{Transport, TransportEvent};
use super::util::{BufferManager, ResponseBody, ResponseSink};

pub const DEFAULT_RESPONSE_SIZE: usize = 1024 * 1024;
pub const MAXIMUM_RESPONSE_SIZE: usize = 4 * 1024 * 1024;
/// 重定向与认证重发合计的跳数上限
const MAX_HOPS: u32 = 16;
const FILE_BUFFER_SIZE: usize = 64 * 1024;
/// 不可接受回应的回应体最多保留这么多字节
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// 连接事件；代次用于丢弃已被替换的连接上残留的事件，`None` 表示加载完成
struct ConnectionEvent {
    generation: u32,
    event: Option<Result<TransportEvent, TransportError>>,
}

/// 传输任务结束时的结果
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub task_id: TaskId,
    pub request: HttpRequest,
    pub last_request: Option<HttpRequest>,
    pub last_response: Option<ResponseHead>,
    pub result: Result<ResponseBody, TaskError>,
    /// 状态码或内容类型不可接受时服务器返回的回应体（截断）
    pub error_body: Option<Bytes>,
}

impl HttpOutcome {
    pub fn status(&self) -> Option<u16> {
        self.last_response.as_ref().map(|r| r.status)
    }

    pub fn mime_type(&self) -> Option<String> {
        self.last_response.as_ref().and_then(ResponseHead::mime_type)
    }
}

/// HTTP 传输任务
pub struct HttpTransfer {
    core: TaskCore<HttpOutcome>,
    request: HttpRequest,
    transport: Arc<dyn Transport>,
    acceptable_status_codes: StatusCodes,
    acceptable_content_types: ContentTypes,
    authenticator: Option<Arc<dyn Authenticator>>,
    destination: Option<ResponseDestination>,
    default_response_size: usize,
    maximum_response_size: usize,

    last_request: Option<HttpRequest>,
    last_response: Option<ResponseHead>,
    sink: Option<ResponseSink>,
    body: Option<ResponseBody>,
    error_body: Option<Bytes>,
    connection: Option<SpawnHandle>,
    generation: u32,
    hops: u32,
    auth_failures: u32,
}

impl HttpTransfer {
    pub fn new(request: HttpRequest, transport: Arc<dyn Transport>) -> Self {
        Self {
            core: TaskCore::new("http"),
            request,
            transport,
            acceptable_status_codes: StatusCodes::default(),
            acceptable_content_types: ContentTypes::any(),
            authenticator: None,
            destination: Some(ResponseDestination::Memory),
            default_response_size: DEFAULT_RESPONSE_SIZE,
            maximum_response_size: MAXIMUM_RESPONSE_SIZE,
            last_request: None,
            last_response: None,
            sink: None,
            body: None,
            error_body: None,
            connection: None,
            generation: 0,
            hops: 0,
            auth_failures: 0,
        }
    }

    pub fn with_acceptable_status_codes(mut self, codes: StatusCodes) -> Self {
        self.acceptable_status_codes = codes;
        self
    }

    pub fn with_acceptable_content_types(mut self, types: ContentTypes) -> Self {
        self.acceptable_content_types = types;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_destination(mut self, destination: ResponseDestination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_response_sizes(mut self, default_size: usize, maximum_size: usize) -> Self {
        self.default_response_size = default_size;
        self.maximum_response_size = maximum_size;
        self
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn last_request(&self) -> Option<&HttpRequest> {
        self.last_request.as_ref()
    }

    pub fn last_response(&self) -> Option<&ResponseHead> {
        self.last_response.as_ref()
    }

    /// 只有在收到回应头之后才有意义
    pub fn is_status_code_acceptable(&self) -> bool {
        self.last_response
            .as_ref()
            .map_or(false, |r| self.acceptable_status_codes.contains(r.status))
    }

    pub fn is_content_type_acceptable(&self) -> bool {
        self.last_response
            .as_ref()
            .map_or(false, |r| self.acceptable_content_types.accepts(r.mime_type().as_deref()))
    }

    /// 为下一跳打开连接，替换掉当前连接
    fn open(&mut self, request: HttpRequest, ctx: &mut Context<Self>) {
        if let Some(handle) = self.connection.take() {
            ctx.cancel_future(handle);
        }
        self.generation += 1;
        let generation = self.generation;
        debug!("[task {}] 打开连接 {}", self.id(), request);

        let events = self
            .transport
            .open(&request)
            .map(Some)
            .chain(stream::once(async { None }))
            .map(move |event| ConnectionEvent { generation, event });
        self.last_request = Some(request);
        self.connection = Some(ctx.add_stream(events));
    }

    fn current_request(&self) -> HttpRequest {
        self.last_request.clone().unwrap_or_else(|| self.request.clone())
    }

    fn did_receive_response(&mut self, head: ResponseHead, ctx: &mut Context<Self>) {
        debug!("[task {}] 回应 {} {}", self.id(), head.status, head.url);
        self.last_response = Some(head.clone());

        if head.is_redirect() {
            if let Some(location) = head.location() {
                let next = self.current_request().redirected(location, head.status);
                let follow = self
                    .authenticator
                    .as_ref()
                    .map_or(true, |auth| auth.should_follow_redirect(&head, &next));
                if follow {
                    if self.hops >= MAX_HOPS {
                        let error = TransportError::new(TransportErrorKind::Protocol, "重定向次数过多");
                        self.finish(Some(error.into()), ctx);
                        return;
                    }
                    self.hops += 1;
                    self.open(next, ctx);
                    return;
                }
                debug!("[task {}] 认证器拒绝跟随重定向", self.id());
            }
        }

        let current = self.current_request();
        if let Some(challenge) = AuthChallenge::from_response(&current, &head, self.auth_failures) {
            let disposition = match &self.authenticator {
                Some(auth) if auth.can_authenticate(&challenge.protection_space) => auth.handle(&challenge),
                _ => ChallengeDisposition::Cancel,
            };
            match disposition {
                ChallengeDisposition::UseCredential(credential) if self.hops < MAX_HOPS => {
                    self.hops += 1;
                    self.auth_failures += 1;
                    let mut next = current;
                    credential.apply(&mut next, challenge.protection_space.proxy);
                    self.open(next, ctx);
                }
                other => {
                    debug!("[task {}] 认证质询未处理: {:?}", self.id(), other);
                }
            }
        }
    }

    /// 第一个数据块到达时决定回应体去向
    ///
    /// 不可接受的回应不占用输出流，也不受最大长度限制，结束时按状态码或内容类型报错。
    fn make_sink(&mut self) -> Result<ResponseSink, TaskError> {
        if !self.is_status_code_acceptable() || !self.is_content_type_acceptable() {
            return Ok(ResponseSink::Capped {
                buffer: BytesMut::new(),
                limit: ERROR_BODY_LIMIT.min(self.default_response_size),
            });
        }
        match self.destination.take().unwrap_or_default() {
            ResponseDestination::Memory => {
                let expected = self.last_response.as_ref().and_then(ResponseHead::content_length);
                let capacity = match expected {
                    Some(length) if length > self.maximum_response_size as u64 => {
                        return Err(TaskError::ResponseTooLarge { limit: self.maximum_response_size });
                    }
                    Some(length) => length as usize,
                    None => self.default_response_size.min(self.maximum_response_size),
                };
                Ok(ResponseSink::Memory {
                    buffer: BytesMut::with_capacity(capacity),
                    limit: self.maximum_response_size,
                })
            }
            ResponseDestination::File(path) => {
                let writer = BufferManager::create(&path, FILE_BUFFER_SIZE)
                    .map_err(|e| TaskError::OnOutputStream(format!("{}: {}", path.display(), e)))?;
                Ok(ResponseSink::Stream { writer: Box::new(writer), written: 0 })
            }
            ResponseDestination::Writer(writer) => Ok(ResponseSink::Stream { writer, written: 0 }),
        }
    }

    fn did_receive_data(&mut self, data: Bytes, ctx: &mut Context<Self>) {
        if self.sink.is_none() {
            match self.make_sink() {
                Ok(sink) => self.sink = Some(sink),
                Err(e) => {
                    self.finish(Some(e), ctx);
                    return;
                }
            }
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.append(&data) {
                self.finish(Some(e), ctx);
            }
        }
    }

    fn did_finish_loading(&mut self, ctx: &mut Context<Self>) {
        self.connection = None;
        let Some(response) = self.last_response.clone() else {
            let error = TransportError::new(TransportErrorKind::Protocol, "连接结束但没有收到回应");
            self.finish(Some(error.into()), ctx);
            return;
        };

        let rejected = if !self.is_status_code_acceptable() {
            Some(TaskError::Status(response.status))
        } else if !self.is_content_type_acceptable() {
            Some(TaskError::BadContentType(response.mime_type().unwrap_or_default()))
        } else {
            None
        };
        if let Some(error) = rejected {
            if let Some(body) = self.sink.take().map(ResponseSink::into_body) {
                self.error_body = body.bytes().cloned();
            }
            self.finish(Some(error), ctx);
            return;
        }

        // 没有任何数据时也要落实去向，保证结果里恰好有一个回应体
        let sink = match self.sink.take() {
            Some(sink) => Ok(sink),
            None => self.make_sink(),
        };
        match sink.and_then(|mut sink| sink.close().map(|_| sink)) {
            Ok(sink) => {
                self.body = Some(sink.into_body());
                self.finish(None, ctx);
            }
            Err(e) => self.finish(Some(e), ctx),
        }
    }
}

impl Actor for HttpTransfer {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.begin(ctx);
    }
}

impl Handler<CancelTask> for HttpTransfer {
    type Result = ();
    fn handle(&mut self, _msg: CancelTask, ctx: &mut Self::Context) {
        self.cancel(ctx);
    }
}

impl StreamHandler<ConnectionEvent> for HttpTransfer {
    fn handle(&mut self, item: ConnectionEvent, ctx: &mut Self::Context) {
        if item.generation != self.generation || self.state() != TaskState::Running {
            return;
        }
        match item.event {
            Some(Ok(TransportEvent::Response(head))) => self.did_receive_response(head, ctx),
            Some(Ok(TransportEvent::Data(data))) => self.did_receive_data(data, ctx),
            Some(Err(e)) => {
                warn!("[task {}] 传输失败: {}", self.id(), e);
                self.finish(Some(TaskError::Transport(e)), ctx);
            }
            None => self.did_finish_loading(ctx),
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        // 加载完成由流末尾的 None 事件驱动
    }
}

impl CooperativeTask for HttpTransfer {
    type Output = HttpOutcome;

    fn core(&self) -> &TaskCore<HttpOutcome> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore<HttpOutcome> {
        &mut self.core
    }

    fn on_start(&mut self, ctx: &mut Context<Self>) {
        let request = self.request.clone();
        self.open(request, ctx);
    }

    fn on_will_finish(&mut self, ctx: &mut Context<Self>) {
        if let Some(handle) = self.connection.take() {
            ctx.cancel_future(handle);
        }
        // 丢弃输出流时缓冲写入器会刷盘
        self.sink = None;
    }

    fn output(&mut self) -> HttpOutcome {
        let result = match self.error() {
            Some(e) => Err(e.clone()),
            None => Ok(self.body.take().unwrap_or(ResponseBody::Memory(Bytes::new()))),
        };
        HttpOutcome {
            task_id: self.id(),
            request: self.request.clone(),
            last_request: self.last_request.clone(),
            last_response: self.last_response.clone(),
            result,
            error_body: self.error_body.take(),
        }
    }
}
