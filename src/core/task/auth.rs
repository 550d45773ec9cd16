//! 可插拔的认证能力
//!
//! 传输任务在收到 401/407 质询时同步询问认证器。没有认证器时质询被取消，
//! 质询回应本身成为最终回应。服务器证书信任由 rustls 在传输层完成，不经过这里。

use std::sync::OnceLock;

use awc::http::header::{self, HeaderName, HeaderValue};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;

use super::request::{HttpRequest, ResponseHead};

/// 质询所属的保护空间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionSpace {
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub realm: Option<String>,
    pub proxy: bool,
}

/// 一次认证质询
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub protection_space: ProtectionSpace,
    pub previous_failure_count: u32,
    pub failure_response: ResponseHead,
}

impl AuthChallenge {
    /// 从 401/407 回应中解析质询，没有质询头时返回 `None`
    pub fn from_response(request: &HttpRequest, response: &ResponseHead, previous_failure_count: u32) -> Option<Self> {
        let (name, proxy) = match response.status {
            401 => (header::WWW_AUTHENTICATE, false),
            407 => (header::PROXY_AUTHENTICATE, true),
            _ => return None,
        };
        let value = response.headers.get(&name)?.to_str().ok()?;
        let scheme = value.split_whitespace().next()?.to_ascii_lowercase();

        static REALM: OnceLock<Regex> = OnceLock::new();
        let realm = REALM
            .get_or_init(|| Regex::new(r#"(?i)realm\s*=\s*"([^"]*)""#).expect("静态正则"))
            .captures(value)
            .map(|c| c[1].to_string());

        Some(Self {
            protection_space: ProtectionSpace {
                host: request.host().to_string(),
                port: request.port(),
                scheme,
                realm,
                proxy,
            },
            previous_failure_count,
            failure_response: response.clone(),
        })
    }
}

/// 凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { user: String, password: String },
    Bearer(String),
}

impl Credential {
    pub(crate) fn apply(&self, request: &mut HttpRequest, proxy: bool) {
        let value = match self {
            Credential::Basic { user, password } => {
                format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
            }
            Credential::Bearer(token) => format!("Bearer {}", token),
        };
        let name: HeaderName = if proxy { header::PROXY_AUTHORIZATION } else { header::AUTHORIZATION };
        if let Ok(value) = HeaderValue::from_str(&value) {
            request.headers.insert(name, value);
        }
    }
}

/// 认证器对质询的处置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeDisposition {
    UseCredential(Credential),
    /// 放弃认证，质询回应成为最终回应
    Cancel,
    RejectProtectionSpace,
}

/// 认证能力；所有方法都在传输任务的事件循环线程上同步调用
pub trait Authenticator: Send + Sync + 'static {
    fn can_authenticate(&self, space: &ProtectionSpace) -> bool;

    fn handle(&self, challenge: &AuthChallenge) -> ChallengeDisposition;

    fn should_follow_redirect(&self, _redirect: &ResponseHead, _next: &HttpRequest) -> bool {
        true
    }
}

/// 固定凭据的认证器，失败超过一次后放弃
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    pub credential: Credential,
    pub realm: Option<String>,
}

impl Authenticator for StaticCredentials {
    fn can_authenticate(&self, space: &ProtectionSpace) -> bool {
        self.realm.is_none() || self.realm == space.realm
    }

    fn handle(&self, challenge: &AuthChallenge) -> ChallengeDisposition {
        if challenge.previous_failure_count > 0 {
            ChallengeDisposition::Cancel
        } else {
            ChallengeDisposition::UseCredential(self.credential.clone())
        }
    }
}
