//! `task` 模块包含所有协作任务
//!
//! - `actor`: 任务基础抽象 `CooperativeTask`、`TaskCore` 与 `TaskHandle`
//! - `state`: 生命周期状态与重试状态
//! - `messages`: 任务之间传递的消息
//! - `request`: 请求、回应头与可接受集合
//! - `transport`: 传输层能力与 awc 实现
//! - `auth`: 可插拔的认证能力
//! - `util`: 回应体的缓冲与输出流
//! - `http`: 单次 HTTP 传输任务
//! - `retry`: 退避策略
//! - `retrying`: 带重试的传输任务
//! - `reachability`: 主机可达性监视
//! - `notify`: 同主机成功通知
//! - `compute`: 计算任务

pub mod actor;
pub mod state;
pub mod messages;
pub mod request;
pub mod transport;
pub mod auth;
pub mod util;
pub mod http;
pub mod retry;
pub mod retrying;
pub mod reachability;
pub mod notify;
pub mod compute;

pub use actor::{CooperativeTask, TaskCore, TaskHandle};
pub use auth::{AuthChallenge, Authenticator, ChallengeDisposition, Credential, ProtectionSpace, StaticCredentials};
pub use compute::{ComputeJob, ComputeOutcome};
pub use http::{HttpOutcome, HttpTransfer};
pub use notify::SuccessNotifier;
pub use reachability::{Reachability, ReachabilityMonitor, ReachabilityOutcome, ReachabilityTask, TcpConnectMonitor};
pub use request::{ContentTypes, HttpRequest, ResponseDestination, ResponseHead, StatusCodes};
pub use retry::RetryPolicy;
pub use retrying::{FetchedResponse, ResponseContent, RetryOutcome, RetryStatus, RetryingTransfer};
pub use state::{RetryState, TaskId, TaskState};
pub use transport::{AwcTransport, Transport, TransportEvent};
pub use util::ResponseBody;
