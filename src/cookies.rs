use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose};
use tracing::{error, info, warn};

use crate::config::COOKIES_ENV;

#[derive(Debug, thiserror::Error)]
pub enum CookiesError {
    #[error("cookie blob is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("decoded cookie blob is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("could not write cookie file: {0}")]
    Write(#[from] std::io::Error),
}

pub async fn provision_cookies(blob: Option<&str>, path: &Path) -> Option<PathBuf> {
    let Some(blob) = blob else {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            info!("{COOKIES_ENV} not set, using existing cookie file {:?}", path);
            return Some(path.to_path_buf());
        }
        warn!("{COOKIES_ENV} not set. The engine may run into bot detection without cookies.");
        return None;
    };

    match write_cookies(blob, path).await {
        Ok(()) => {
            info!("Cookie file {:?} created from {COOKIES_ENV}", path);
            Some(path.to_path_buf())
        }
        Err(err) => {
            error!("Failed to provision cookie file: {err}. {COOKIES_ENV} must hold a base64 encoded cookies.txt.");
            None
        }
    }
}

async fn write_cookies(blob: &str, path: &Path) -> Result<(), CookiesError> {
    let bytes = general_purpose::STANDARD.decode(blob.trim())?;
    let text = String::from_utf8(bytes)?;
    tokio::fs::write(path, text).await?;
    Ok(())
}
