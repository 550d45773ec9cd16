use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use awc::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use awc::http::Method;
use bytes::Bytes;
use url::Url;

use crate::core::error::TaskError;

/// 一次 HTTP 请求的描述，可跨线程传递
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn get(url: &str) -> Result<Self, TaskError> {
        let url = Url::parse(url).map_err(|e| TaskError::InvalidRequest(format!("{}: {}", url, e)))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(TaskError::InvalidRequest(format!("不支持的协议: {}", other))),
        }
        if url.host_str().is_none() {
            return Err(TaskError::InvalidRequest(format!("缺少主机名: {}", url)));
        }
        Ok(Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// 仅在请求中还没有该头时设置
    pub fn set_default_header(&mut self, name: HeaderName, value: HeaderValue) {
        if !self.headers.contains_key(&name) {
            self.headers.insert(name, value);
        }
    }

    /// 根据重定向回应构造下一跳请求
    pub fn redirected(&self, location: Url, status: u16) -> Self {
        let mut next = self.clone();
        next.url = location;
        // 303 总是改为 GET；301/302 对非 GET/HEAD 请求按浏览器惯例也改为 GET
        let to_get = status == 303
            || (matches!(status, 301 | 302) && self.method != Method::GET && self.method != Method::HEAD);
        if to_get {
            next.method = Method::GET;
            next.body = Bytes::new();
            next.headers.remove(header::CONTENT_TYPE);
            next.headers.remove(header::CONTENT_LENGTH);
        }
        if next.url.host_str() != self.url.host_str() {
            next.headers.remove(header::AUTHORIZATION);
        }
        next
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// 服务器回应头
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub url: Url,
    pub status: u16,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(url: Url, status: u16) -> Self {
        Self { url, status, headers: HeaderMap::new() }
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.append(name, value);
        }
        self
    }

    fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// 去掉参数并转为小写的 MIME 类型
    pub fn mime_type(&self) -> Option<String> {
        self.header_str(&header::CONTENT_TYPE)
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header_str(&header::CONTENT_LENGTH).and_then(|v| v.trim().parse().ok())
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    /// 解析 Location，相对地址基于本次回应的 URL
    pub fn location(&self) -> Option<Url> {
        self.header_str(&header::LOCATION).and_then(|loc| self.url.join(loc).ok())
    }
}

/// 可接受的状态码集合，默认 200–299
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCodes(Vec<RangeInclusive<u16>>);

impl StatusCodes {
    pub fn new(ranges: impl IntoIterator<Item = RangeInclusive<u16>>) -> Self {
        Self(ranges.into_iter().collect())
    }

    pub fn contains(&self, status: u16) -> bool {
        self.0.iter().any(|r| r.contains(&status))
    }
}

impl Default for StatusCodes {
    fn default() -> Self {
        Self(vec![200..=299])
    }
}

/// 可接受的内容类型集合，默认接受任何类型
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentTypes(Option<HashSet<String>>);

impl ContentTypes {
    pub fn any() -> Self {
        Self(None)
    }

    pub fn only<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(Some(types.into_iter().map(|t| t.as_ref().trim().to_ascii_lowercase()).collect()))
    }

    pub fn is_any(&self) -> bool {
        self.0.is_none()
    }

    pub fn accepts(&self, mime_type: Option<&str>) -> bool {
        match (&self.0, mime_type) {
            (None, _) => true,
            (Some(set), Some(mime)) => set.contains(mime),
            (Some(_), None) => false,
        }
    }
}

/// 回应体的去向：内存或输出流，在收到第一个字节时确定
pub enum ResponseDestination {
    Memory,
    File(PathBuf),
    Writer(Box<dyn Write + Send>),
}

impl Default for ResponseDestination {
    fn default() -> Self {
        ResponseDestination::Memory
    }
}

impl fmt::Debug for ResponseDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseDestination::Memory => f.write_str("Memory"),
            ResponseDestination::File(path) => write!(f, "File({})", path.display()),
            ResponseDestination::Writer(_) => f.write_str("Writer"),
        }
    }
}
