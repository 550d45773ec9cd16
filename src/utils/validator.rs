use anyhow::Result;

use crate::config::Config;
use crate::core::task::request::HttpRequest;

/// 只接受带主机名的 http/https 地址
pub fn is_valid_url(url: &str) -> bool {
    HttpRequest::get(url).is_ok()
}

pub fn validate_urls(urls: &[String]) -> Result<()> {
    if urls.is_empty() {
        anyhow::bail!("URL列表不能为空");
    }
    if let Some(bad) = urls.iter().find(|url| !is_valid_url(url)) {
        anyhow::bail!("无效的URL: {}", bad);
    }
    Ok(())
}

pub fn validate_config(config: &Config) -> Result<()> {
    config.validate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(is_valid_url("https://example.com"));
        assert!(is_valid_url("http://example.com/gallery.xml"));
        assert!(!is_valid_url("ftp://example.com/a"));
        assert!(!is_valid_url("invalid-url"));
    }

    #[test]
    fn test_urls_validation() {
        let valid_urls = vec!["https://example.com".to_string(), "http://example.com".to_string()];
        assert!(validate_urls(&valid_urls).is_ok());

        let invalid_urls = vec!["invalid-url".to_string(), "https://example.com".to_string()];
        assert!(validate_urls(&invalid_urls).is_err());
        assert!(validate_urls(&[]).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(validate_config(&config).is_ok());
        config.timeout = 0;
        assert!(validate_config(&config).is_err());
    }
}
