mod config;
mod cookies;
mod engine;
mod error;
mod files;
mod formats;
mod handlers;

use std::{collections::HashSet, sync::Arc};

use axum::http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::AppConfig,
    cookies::provision_cookies,
    engine::YtDlp,
    error::ApiError,
    files::{DOWNLOAD_FILENAME_HEADER, STALE_FILE_AGE, sweep_stale_files},
    handlers::{AppState, router},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidgrab=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create download directory {:?}: {error}",
                config.download_dir
            ))
        })?;
    sweep_stale_files(
        &config.download_dir,
        STALE_FILE_AGE,
        Some(config.cookies_file.as_path()),
    )
    .await;

    let cookies_file =
        provision_cookies(config.cookies_base64.as_deref(), &config.cookies_file).await;

    let mut http_client = reqwest::Client::builder();
    if let Some(proxy_url) = &config.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|error| ApiError::internal(format!("Invalid PROXY_URL: {error}")))?;
        http_client = http_client.proxy(proxy);
        info!("Outbound requests go through proxy {proxy_url}");
    }
    let http_client = http_client
        .build()
        .map_err(|error| ApiError::internal(format!("Could not create HTTP client: {error}")))?;

    let state = AppState {
        engine: Arc::new(YtDlp::new(config.yt_dlp_path.clone())),
        http_client,
        download_dir: config.download_dir.clone(),
        cookies_file,
        proxy_url: config.proxy_url.clone(),
        cleanup_delay: config.cleanup_delay,
    };

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!("Backend ready on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]);

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Requests from any origin are accepted.");
        return Ok(layer.allow_origin(Any));
    }

    let allowed_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allowed_origins = Arc::new(allowed_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    Ok(layer.allow_origin(allow_origin))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
