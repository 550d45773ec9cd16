use std::fmt;
use std::io;

use awc::error::{ConnectError, PayloadError, SendRequestError};
use thiserror::Error;

/// 传输层错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// DNS 解析失败
    Dns,
    /// 建立连接失败（拒绝、重置、网络不可达）
    Connect,
    /// TLS 握手失败
    Tls,
    /// 超时
    Timeout,
    /// 连接在传输过程中断开
    Disconnected,
    /// 服务器回应无法解析
    Protocol,
    /// 请求本身无效（URL 等），重试也不会成功
    InvalidRequest,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Dns => "DNS",
            TransportErrorKind::Connect => "连接",
            TransportErrorKind::Tls => "TLS",
            TransportErrorKind::Timeout => "超时",
            TransportErrorKind::Disconnected => "断开",
            TransportErrorKind::Protocol => "协议",
            TransportErrorKind::InvalidRequest => "无效请求",
            TransportErrorKind::Other => "其他",
        };
        f.write_str(name)
    }
}

/// 底层 HTTP 栈上报的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{kind}] {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn timeout() -> Self {
        Self::new(TransportErrorKind::Timeout, "请求超时")
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, TransportErrorKind::InvalidRequest)
    }
}

impl From<SendRequestError> for TransportError {
    fn from(error: SendRequestError) -> Self {
        let message = error.to_string();
        let kind = match &error {
            SendRequestError::Url(_) => TransportErrorKind::InvalidRequest,
            SendRequestError::Timeout => TransportErrorKind::Timeout,
            SendRequestError::Connect(connect) => match connect {
                ConnectError::Resolver(_) | ConnectError::NoRecords | ConnectError::Unresolved => {
                    TransportErrorKind::Dns
                }
                ConnectError::Timeout => TransportErrorKind::Timeout,
                ConnectError::SslIsNotSupported => TransportErrorKind::Tls,
                ConnectError::Disconnected => TransportErrorKind::Disconnected,
                _ => TransportErrorKind::Connect,
            },
            SendRequestError::Send(_) => TransportErrorKind::Disconnected,
            SendRequestError::Response(_) => TransportErrorKind::Protocol,
            _ => TransportErrorKind::Other,
        };
        Self { kind, message }
    }
}

impl From<PayloadError> for TransportError {
    fn from(error: PayloadError) -> Self {
        let kind = match &error {
            PayloadError::Incomplete(_) | PayloadError::Io(_) => TransportErrorKind::Disconnected,
            _ => TransportErrorKind::Protocol,
        };
        Self::new(kind, error.to_string())
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        let kind = match error.kind() {
            io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportErrorKind::Disconnected,
            io::ErrorKind::InvalidInput => TransportErrorKind::InvalidRequest,
            _ => TransportErrorKind::Connect,
        };
        Self::new(kind, error.to_string())
    }
}

/// 任务错误槽中保存的错误
///
/// 数值错误码与传输任务的错误域一致：正数为不可接受的 HTTP 状态码，
/// 负数为本模块自身的错误。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("任务已取消")]
    Cancelled,

    #[error("HTTP 状态码不可接受: {0}")]
    Status(u16),

    #[error("响应内容类型不可接受: {0}")]
    BadContentType(String),

    #[error("响应超过最大长度 {limit} 字节")]
    ResponseTooLarge { limit: usize },

    #[error("输出流写入失败: {0}")]
    OnOutputStream(String),

    #[error("传输错误: {0}")]
    Transport(#[from] TransportError),

    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    #[error("可达性监视已结束: {0}")]
    MonitorEnded(String),

    #[error("任务执行失败: {0}")]
    Failed(String),
}

pub const ERROR_RESPONSE_TOO_LARGE: i64 = -1;
pub const ERROR_ON_OUTPUT_STREAM: i64 = -2;
pub const ERROR_BAD_CONTENT_TYPE: i64 = -3;

impl TaskError {
    /// 传输任务错误域中的错误码，不属于该错误域时返回 `None`
    pub fn code(&self) -> Option<i64> {
        match self {
            TaskError::Status(status) => Some(i64::from(*status)),
            TaskError::ResponseTooLarge { .. } => Some(ERROR_RESPONSE_TOO_LARGE),
            TaskError::OnOutputStream(_) => Some(ERROR_ON_OUTPUT_STREAM),
            TaskError::BadContentType(_) => Some(ERROR_BAD_CONTENT_TYPE),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    /// 判断该错误在稍后重试时是否可能成功
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Transport(e) => e.is_retryable(),
            TaskError::Status(status) => (500..=599).contains(status),
            TaskError::Cancelled
            | TaskError::BadContentType(_)
            | TaskError::ResponseTooLarge { .. }
            | TaskError::OnOutputStream(_)
            | TaskError::InvalidRequest(_)
            | TaskError::MonitorEnded(_)
            | TaskError::Failed(_) => false,
        }
    }
}

/// 配置文件相关错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO错误: {0}")]
    Io(#[from] io::Error),

    #[error("配置文件格式错误: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("无法序列化配置: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("配置无效: {0}")]
    Invalid(String),
}
