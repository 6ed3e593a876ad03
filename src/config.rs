use std::{path::PathBuf, time::Duration};

pub const COOKIES_ENV: &str = "YOUTUBE_COOKIES_BASE64";

const DEFAULT_COOKIES_FILE: &str = "cookies.txt";
const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
const DEFAULT_CLEANUP_DELAY_SECONDS: u64 = 10;
const DEFAULT_YT_DLP: &str = "yt-dlp";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub download_dir: PathBuf,
    pub cookies_file: PathBuf,
    pub cookies_base64: Option<String>,
    pub proxy_url: Option<String>,
    pub cleanup_delay: Duration,
    pub yt_dlp_path: String,
    pub allowed_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: resolve_bind_addr(),
            download_dir: read_string_env("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
            cookies_file: read_string_env("COOKIES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_COOKIES_FILE)),
            cookies_base64: read_string_env(COOKIES_ENV),
            proxy_url: read_string_env("PROXY_URL"),
            cleanup_delay: Duration::from_secs(
                read_u64_env("CLEANUP_DELAY_SECONDS").unwrap_or(DEFAULT_CLEANUP_DELAY_SECONDS),
            ),
            yt_dlp_path: read_string_env("YT_DLP_PATH")
                .unwrap_or_else(|| DEFAULT_YT_DLP.to_string()),
            allowed_origins: read_string_env("ALLOWED_ORIGINS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
        }
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_drops_blank_entries() {
        assert_eq!(
            split_list(" https://a.test , ,https://b.test,"),
            vec!["https://a.test".to_string(), "https://b.test".to_string()]
        );
    }

    #[test]
    fn non_empty_trims_whitespace() {
        assert_eq!(non_empty("  value "), Some("value"));
        assert_eq!(non_empty("   "), None);
    }
}
