use std::time::Duration;

use bytes::Bytes;
use futures::future;
use futures::stream::{self, LocalBoxStream, StreamExt};

use crate::core::error::TransportError;
use super::request::{HttpRequest, ResponseHead};

/// 一次连接上依次发生的事件：先是回应头，然后是若干数据块，流结束即加载完成
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Response(ResponseHead),
    Data(Bytes),
}

pub type TransportStream = LocalBoxStream<'static, Result<TransportEvent, TransportError>>;

/// 传输层能力：为单跳请求打开一条连接，不自动跟随重定向
///
/// `open` 总是在调用任务的事件循环线程上被调用，返回的流也只在该线程上轮询；
/// 丢弃流即关闭连接。
pub trait Transport: Send + Sync + 'static {
    fn open(&self, request: &HttpRequest) -> TransportStream;
}

/// 基于 awc 的默认传输实现
#[derive(Debug, Clone)]
pub struct AwcTransport {
    timeout: Duration,
}

impl AwcTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for AwcTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl Transport for AwcTransport {
    fn open(&self, request: &HttpRequest) -> TransportStream {
        // awc::Client 不是 Send，只能在事件循环线程上按需创建
        let client = awc::Client::builder()
            .disable_redirects()
            .timeout(self.timeout)
            .finish();

        let mut builder = client.request(request.method.clone(), request.url.as_str());
        for (name, value) in request.headers.iter() {
            builder = builder.insert_header((name.clone(), value.clone()));
        }
        let url = request.url.clone();
        let send = builder.send_body(request.body.clone());

        stream::once(send)
            .flat_map(move |result| match result {
                Ok(response) => {
                    let mut head = ResponseHead::new(url.clone(), response.status().as_u16());
                    for (name, value) in response.headers().iter() {
                        head.headers.append(name.clone(), value.clone());
                    }
                    let body = response.map(|chunk| chunk.map(TransportEvent::Data).map_err(TransportError::from));
                    stream::once(future::ready(Ok(TransportEvent::Response(head))))
                        .chain(body)
                        .boxed_local()
                }
                Err(e) => stream::once(future::ready(Err(TransportError::from(e)))).boxed_local(),
            })
            .boxed_local()
    }
}
