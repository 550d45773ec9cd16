//! CLI: 命令行接口和参数解析模块
//!
//! ## 支持的命令
//!
//! - 获取单个地址：`gallerynet <url>`
//! - 批量获取：`gallerynet -f urls.txt`
//! - 编辑配置：`gallerynet -e`
//! - 指定配置：`gallerynet -c config.conf <url>`
//! - 限制内容类型：`gallerynet -a text/xml <url>`
//!
//! ## 平台支持
//!
//! - Windows: `%APPDATA%/gallerynet/gallerynet.conf`
//! - macOS: `~/Library/Application Support/gallerynet/gallerynet.conf`
//! - Linux: `~/.config/gallerynet/gallerynet.conf`

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::env;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::utils::validator;

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/gallerynet/gallerynet.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/gallerynet/gallerynet.conf", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/gallerynet/gallerynet.conf", home)
    }
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 xdg-open，否则 nano
        if std::process::Command::new("xdg-open").arg(config_path).status().is_err() {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

/// GalleryNet 命令行参数
///
/// 示例用法：
///   gallerynet https://example.com/gallery.xml
///   gallerynet -e  # 编辑配置文件
///   gallerynet -t 2 -f urls.txt
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gallerynet",
    author = "panzhifu",
    version = env!("CARGO_PKG_VERSION"),
    about = "带自动重试的相册获取工具",
    long_about = "按地址获取相册清单和图片，遇到网络故障时按随机指数退避自动重试，\n主机恢复可达或同主机其他请求成功时立即重试。\n\n示例：\n  gallerynet https://example.com/gallery.xml\n  gallerynet -e\n  gallerynet -c /path/to/config.conf -f urls.txt\n"
)]
pub struct Args {
    /// 要获取的URL列表
    #[arg(required = false, help = "要获取的URL列表，可以同时指定多个URL。")]
    pub urls: Vec<String>,

    /// 包含URL列表的文件路径
    #[arg(short, long, help = "包含URL列表的文件路径，每行一个URL，# 开头为注释。")]
    pub file: Option<String>,

    /// 配置文件路径，默认为平台推荐路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    /// 编辑配置文件
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    /// 下载目录
    #[arg(long, short = 'd', help = "指定下载目录，覆盖配置文件中的设置。")]
    pub download_dir: Option<String>,

    /// 传输队列宽度
    #[arg(long, short = 't', help = "同时进行的传输数，覆盖配置文件中的设置。")]
    pub transfers: Option<usize>,

    /// 可接受的内容类型
    #[arg(long = "accept", short = 'a', help = "可接受的内容类型，可重复指定；默认不限制。")]
    pub content_types: Vec<String>,

    /// 输出调试日志
    #[arg(long, short = 'v', help = "输出调试日志。")]
    pub verbose: bool,
}

impl Args {
    /// 解析命令行参数并加载配置；`-e` 时打开编辑器后退出
    pub fn parse_args() -> Result<(Self, Config)> {
        let args = Args::parse();

        if args.edit_config {
            if !Path::new(&args.config).exists() {
                Config::default()
                    .save_with_tutorial(&args.config)
                    .with_context(|| format!("无法保存配置文件: {}", args.config))?;
            }
            open_config_in_editor(&args.config);
            std::process::exit(0);
        }

        let config = args.load_config()?;
        Ok((args, config))
    }

    /// 加载或创建配置文件，合并命令行参数并校验
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(&self.config)
            .with_context(|| format!("无法读取配置文件: {}", self.config))?;
        config.merge_from_args(self);
        validator::validate_config(&config)?;
        Ok(config)
    }

    /// 汇总命令行与文件中的URL
    pub fn get_urls(&self) -> Result<Vec<String>> {
        let mut urls = Vec::new();
        urls.extend_from_slice(&self.urls);

        if let Some(file_path) = &self.file {
            let content = fs::read_to_string(file_path)
                .with_context(|| format!("无法读取URL文件: {}", file_path))?;

            // 按行读取URL，忽略空行和注释
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    urls.push(line.to_string());
                }
            }
        }

        if urls.is_empty() {
            bail!("未提供任何URL。请通过命令行参数或文件提供至少一个URL。");
        }
        validator::validate_urls(&urls)?;
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::try_parse_from(["gallerynet", "-t", "2", "-a", "text/xml", "-a", "application/xml", "https://example.com/gallery.xml"]).unwrap();
        assert_eq!(args.transfers, Some(2));
        assert_eq!(args.content_types, vec!["text/xml", "application/xml"]);
        assert_eq!(args.urls, vec!["https://example.com/gallery.xml"]);
        assert!(!args.verbose);
    }

    #[test]
    fn test_config_merge() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("gallerynet.conf");
        let args = Args::try_parse_from([
            "gallerynet",
            "-c",
            config_path.to_str().unwrap(),
            "-d",
            "/tmp/gallery",
            "-t",
            "3",
            "https://example.com/gallery.xml",
        ])
        .unwrap();

        let config = args.load_config().unwrap();
        assert!(config_path.exists());
        assert_eq!(config.download_dir, "/tmp/gallery");
        assert_eq!(config.max_concurrent_transfers, 3);
    }

    #[test]
    fn test_zero_width_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("gallerynet.conf");
        let args = Args::try_parse_from(["gallerynet", "-c", config_path.to_str().unwrap(), "-t", "0"]).unwrap();
        assert!(args.load_config().is_err());
    }

    #[test]
    fn test_url_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let url_file = dir.path().join("urls.txt");
        fs::write(&url_file, "# 这是一个注释\nhttps://example.com/a.jpg\n\nhttps://example.com/b.jpg\n").unwrap();

        let args = Args::try_parse_from(["gallerynet", "-f", url_file.to_str().unwrap()]).unwrap();
        let urls = args.get_urls().unwrap();
        assert_eq!(urls, vec!["https://example.com/a.jpg", "https://example.com/b.jpg"]);
    }

    #[test]
    fn test_invalid_url_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let url_file = dir.path().join("urls.txt");
        fs::write(&url_file, "ftp://example.com/a.jpg\n").unwrap();

        let args = Args::try_parse_from(["gallerynet", "-f", url_file.to_str().unwrap()]).unwrap();
        assert!(args.get_urls().is_err());
    }

    #[test]
    fn test_no_urls() {
        let args = Args::try_parse_from(["gallerynet"]).unwrap();
        assert!(args.get_urls().is_err());
    }
}
