//! 测试用的传输与可达性替身，按脚本回放事件，不访问网络

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix::prelude::*;
use awc::http::header::{self, HeaderName};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::core::error::TransportError;
use crate::core::task::actor::CooperativeTask;
use crate::core::task::reachability::{Reachability, ReachabilityMonitor};
use crate::core::task::request::{HttpRequest, ResponseHead};
use crate::core::task::transport::{Transport, TransportEvent, TransportStream};

/// 一次连接的脚本
#[derive(Debug, Clone)]
pub enum Script {
    Respond {
        status: u16,
        headers: Vec<(HeaderName, String)>,
        chunks: Vec<Bytes>,
        error_after: Option<TransportError>,
    },
    Fail(TransportError),
    /// 永远不产生事件，直到被取消
    Hang,
}

impl Script {
    pub fn ok(content_type: &str, chunks: &[&[u8]]) -> Self {
        Script::Respond {
            status: 200,
            headers: vec![(header::CONTENT_TYPE, content_type.to_string())],
            chunks: chunks.iter().map(|c| Bytes::copy_from_slice(c)).collect(),
            error_after: None,
        }
    }

    pub fn status(status: u16, chunks: &[&[u8]]) -> Self {
        Script::Respond {
            status,
            headers: vec![(header::CONTENT_TYPE, "text/plain".to_string())],
            chunks: chunks.iter().map(|c| Bytes::copy_from_slice(c)).collect(),
            error_after: None,
        }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Script::Respond {
            status,
            headers: vec![(header::LOCATION, location.to_string())],
            chunks: vec![Bytes::from_static(b"moved")],
            error_after: None,
        }
    }

    pub fn challenge(realm: &str) -> Self {
        Script::Respond {
            status: 401,
            headers: vec![(header::WWW_AUTHENTICATE, format!(r#"Basic realm="{}""#, realm))],
            chunks: vec![Bytes::from_static(b"unauthorized")],
            error_after: None,
        }
    }
}

/// 按顺序为每次 `open` 回放一个脚本；脚本用完后连接挂起
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, request: &HttpRequest) -> TransportStream {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Script::Hang);
        match script {
            Script::Respond { status, headers, chunks, error_after } => {
                let mut head = ResponseHead::new(request.url.clone(), status);
                for (name, value) in headers {
                    head = head.with_header(name, &value);
                }
                let mut events = vec![Ok(TransportEvent::Response(head))];
                events.extend(chunks.into_iter().map(|c| Ok(TransportEvent::Data(c))));
                if let Some(error) = error_after {
                    events.push(Err(error));
                }
                stream::iter(events).boxed_local()
            }
            Script::Fail(error) => stream::iter(vec![Err(error)]).boxed_local(),
            Script::Hang => stream::pending().boxed_local(),
        }
    }
}

/// 手动驱动的可达性监视器
#[derive(Default)]
pub struct ScriptedReachability {
    watchers: Mutex<Vec<mpsc::UnboundedSender<Reachability>>>,
}

impl ScriptedReachability {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, observed: Reachability) {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|tx| tx.send(observed).is_ok());
    }

    /// 结束所有观测流
    pub fn close(&self) {
        self.watchers.lock().unwrap().clear();
    }

    pub fn watcher_count(&self) -> usize {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|tx| !tx.is_closed());
        watchers.len()
    }

    pub async fn wait_for_watchers(&self, count: usize) {
        eventually(|| self.watcher_count() >= count).await;
    }
}

impl ReachabilityMonitor for ScriptedReachability {
    fn watch(&self, _host: &str, _port: u16) -> BoxStream<'static, Reachability> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().push(tx);
        UnboundedReceiverStream::new(rx).boxed()
    }
}

/// 在当前 arbiter 上直接运行任务并等待其输出
pub async fn run_task<T: CooperativeTask>(mut task: T) -> T::Output {
    let done = task.core_mut().completion();
    let handle = task.handle();
    let addr = task.start();
    handle.bind(&addr);
    done.await.expect("任务没有产生输出")
}

/// 轮询等待条件成立，超过两秒视为失败
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("等待条件超时");
}
