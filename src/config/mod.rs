use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::error::ConfigError;
use crate::core::task::request::ContentTypes;
use crate::core::task::retry::RetryPolicy;

/// 单次退避上限的最大值（秒），30 天
pub const MAX_RETRY_DELAY_SECS: f64 = 30.0 * 24.0 * 3600.0;

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 下载目录
    pub download_dir: String,
    /// 传输队列宽度（同时进行的 HTTP 传输数）
    pub max_concurrent_transfers: usize,
    /// 计算线程数，0 表示使用可用并行度
    pub compute_workers: usize,
    /// 传输超时时间（秒）
    pub timeout: u64,
    /// User-Agent
    pub user_agent: String,
    /// 内存缓冲的默认预分配大小（字节）
    pub default_response_size: usize,
    /// 内存缓冲的最大长度（字节）
    pub maximum_response_size: usize,
    /// 退避上限表（秒）
    pub retry_delays: Vec<f64>,
    /// 可达性探测间隔（秒）
    pub reachability_interval: u64,
    /// 可达性探测超时（秒）
    pub reachability_timeout: u64,
    /// 可接受的内容类型，为空表示接受任何类型
    pub acceptable_content_types: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            max_concurrent_transfers: 4,
            compute_workers: 0,
            timeout: 60,
            user_agent: format!("GalleryNet/{}", env!("CARGO_PKG_VERSION")),
            default_response_size: 1024 * 1024,
            maximum_response_size: 4 * 1024 * 1024,
            retry_delays: vec![1.0, 60.0, 3600.0, 21600.0],
            reachability_interval: 10,
            reachability_timeout: 5,
            acceptable_content_types: Vec::new(),
        }
    }
}

impl Config {
    /// 加载配置文件，不存在时写入默认配置
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            Ok(config)
        }
    }

    /// 保存带说明的配置文件（唯一写入方法）
    pub fn save_with_tutorial(&self, path: &str) -> Result<(), ConfigError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let config_content = toml::to_string_pretty(self)?;
        let full_content = format!("{}\n\n{}", Config::generate_tutorial_content(), config_content);
        fs::write(path, full_content)?;
        Ok(())
    }

    fn generate_tutorial_content() -> String {
        r#"# GalleryNet 配置文件
# ====================
#
# TOML 格式。命令行参数会覆盖这里的设置，优先级：命令行 > 配置文件 > 默认值
#
# 配置文件位置：
# - Windows: %APPDATA%/gallerynet/gallerynet.conf
# - macOS: ~/Library/Application Support/gallerynet/gallerynet.conf
# - Linux: ~/.config/gallerynet/gallerynet.conf
#
# 使用示例：
#   gallerynet https://example.com/gallery.xml
#   gallerynet -t 2 -f urls.txt
#   gallerynet -a text/xml -a application/xml https://example.com/gallery.xml
#
# ==================== 配置项说明 ====================
#
# download_dir              下载目录
# max_concurrent_transfers  同时进行的 HTTP 传输数，建议 2-8
# compute_workers           计算线程数，0 表示按 CPU 核数
# timeout                   单次传输超时（秒）
# user_agent                所有请求使用的 User-Agent
# default_response_size     内存缓冲的预分配大小（字节）
# maximum_response_size     内存缓冲的最大长度（字节），超过即失败且不重试
# retry_delays              第 n 次重试前等待时间的上限（秒），实际等待在 [0, 上限] 内随机，
#                           超出表长的重试使用最后一项
# reachability_interval     失败后探测主机可达性的间隔（秒）
# reachability_timeout      单次探测的超时（秒）
# acceptable_content_types  可接受的内容类型，为空表示不限制
#
# ==================== 故障排除 ====================
#
# 问题：一直显示“等待重试”
# 解决：检查网络连接；主机恢复可达后会立即重试，无需等待退避结束
#
# 问题：提示回应过大
# 解决：增大 maximum_response_size
"#
        .to_string()
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_transfers == 0 {
            return Err(ConfigError::Invalid("传输队列宽度必须大于0".into()));
        }
        if self.timeout == 0 {
            return Err(ConfigError::Invalid("超时时间必须大于0".into()));
        }
        if self.download_dir.is_empty() {
            return Err(ConfigError::Invalid("下载目录不能为空".into()));
        }
        if self.maximum_response_size == 0 {
            return Err(ConfigError::Invalid("最大回应长度必须大于0".into()));
        }
        if self.retry_delays.is_empty() {
            return Err(ConfigError::Invalid("退避表不能为空".into()));
        }
        if self.retry_delays.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(ConfigError::Invalid("退避时间必须是非负数".into()));
        }
        if self.retry_delays.iter().any(|d| *d > MAX_RETRY_DELAY_SECS) {
            return Err(ConfigError::Invalid(format!("退避时间不能超过 {} 秒", MAX_RETRY_DELAY_SECS)));
        }
        if self.retry_delays.windows(2).any(|w| w[1] < w[0]) {
            return Err(ConfigError::Invalid("退避表必须单调不减".into()));
        }
        if self.reachability_interval == 0 || self.reachability_timeout == 0 {
            return Err(ConfigError::Invalid("可达性探测间隔和超时必须大于0".into()));
        }
        Ok(())
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        if let Some(dir) = &args.download_dir {
            self.download_dir = dir.clone();
        }
        if let Some(width) = args.transfers {
            self.max_concurrent_transfers = width;
        }
        if !args.content_types.is_empty() {
            self.acceptable_content_types = args.content_types.clone();
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_delays
                .iter()
                .map(|secs| {
                    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_RETRY_DELAY_SECS))
                        .unwrap_or(Duration::ZERO)
                })
                .collect(),
        )
    }

    pub fn content_types(&self) -> ContentTypes {
        if self.acceptable_content_types.is_empty() {
            ContentTypes::any()
        } else {
            ContentTypes::only(&self.acceptable_content_types)
        }
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 下载目录: {}\n\
            - 传输队列宽度: {}\n\
            - 计算线程: {}\n\
            - 超时时间: {} 秒\n\
            - 最大回应长度: {} 字节\n\
            - 退避上限: {:?} 秒\n\
            - 内容类型: {}",
            self.download_dir,
            self.max_concurrent_transfers,
            if self.compute_workers == 0 { "自动".to_string() } else { self.compute_workers.to_string() },
            self.timeout,
            self.maximum_response_size,
            self.retry_delays,
            if self.acceptable_content_types.is_empty() {
                "不限".to_string()
            } else {
                self.acceptable_content_types.join(", ")
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_transfers, 4);
        assert_eq!(config.timeout, 60);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config.content_types().is_any());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.max_concurrent_transfers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config = Config::default();
        config.retry_delays = vec![60.0, 1.0];
        assert!(config.validate().is_err());

        config = Config::default();
        config.retry_delays.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/gallerynet.conf");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.max_concurrent_transfers = 2;
        config.acceptable_content_types = vec!["text/xml".into()];
        config.save_with_tutorial(path).expect("保存配置失败");

        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("GalleryNet 配置文件"));
        assert!(content.contains("故障排除"));

        let loaded = Config::load(path).expect("加载配置失败");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.conf");
        let loaded = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.conf");
        fs::write(&path, "timeout = 5\n").unwrap();
        let loaded = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.timeout, 5);
        assert_eq!(loaded.max_concurrent_transfers, 4);
    }

    #[test]
    fn test_broken_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.conf");
        fs::write(&path, "timeout = \"soon").unwrap();
        assert!(matches!(Config::load(path.to_str().unwrap()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_huge_retry_delay_is_rejected() {
        let mut config = Config::default();
        config.retry_delays = vec![1.0, 1e30];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // 未经校验的配置也不会在构造退避策略时崩溃
        let policy = config.retry_policy();
        assert_eq!(policy.max_delay(1), Duration::from_secs_f64(MAX_RETRY_DELAY_SECS));
    }

    #[test]
    fn test_config_summary() {
        let summary = Config::default().get_summary();
        assert!(summary.contains("配置摘要"));
        assert!(summary.contains("传输队列宽度"));
        assert!(summary.contains("不限"));
    }
}
