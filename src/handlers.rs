use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    response::{Html, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};

use crate::{
    config::non_empty,
    engine::{EngineOptions, MediaEngine, PostStep, Thumbnail},
    error::{ApiError, Operation},
    files::{
        PartialOutputGuard, STALE_FILE_AGE, attachment_response, discard_partial,
        is_valid_extension, remove_quietly, resolve_output, sanitize_title, schedule_removal,
        sweep_stale_files, thumbnail_extension, unique_suffix,
    },
    formats::{FormatOption, classify_formats},
};

const PLACEHOLDER: &str = "N/A";
const SEGMENT_SELECTOR: &str = "bestvideo+bestaudio/best";
const MP3_QUALITY: &str = "192K";
const THUMBNAIL_CHUNK_SIZE: usize = 8192;

const LANDING_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>vidgrab</title></head>
<body>
<h1>vidgrab</h1>
<p>POST a JSON body to <code>/get_video_info</code>, <code>/download_video</code>,
<code>/download_timestamped_video</code> or <code>/download_thumbnail</code>.</p>
</body>
</html>
"#;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn MediaEngine>,
    pub http_client: reqwest::Client,
    pub download_dir: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub proxy_url: Option<String>,
    pub cleanup_delay: Duration,
}

impl AppState {
    fn engine_options(&self) -> EngineOptions {
        EngineOptions::new(self.cookies_file.as_deref(), self.proxy_url.as_deref())
    }

    fn output_template(&self, stem: &str) -> String {
        self.download_dir
            .join(format!("{stem}.%(ext)s"))
            .to_string_lossy()
            .into_owned()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing_page))
        .route("/health", get(health))
        .route("/get_video_info", post(get_video_info))
        .route("/download_video", post(download_video))
        .route(
            "/download_timestamped_video",
            post(download_timestamped_video),
        )
        .route("/download_thumbnail", post(download_thumbnail))
        .with_state(state)
}

async fn landing_page() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Default, Deserialize)]
pub struct InfoRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    title: String,
    thumbnail: String,
    hd_thumbnail: String,
    channel: String,
    duration: serde_json::Number,
    views: u64,
    video_formats: Vec<FormatOption>,
    audio_formats: Vec<FormatOption>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadRequest {
    url: Option<String>,
    format_id: Option<String>,
    ext: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SegmentRequest {
    url: Option<String>,
    start_time: Option<TimeOffset>,
    end_time: Option<TimeOffset>,
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ThumbnailRequest {
    thumbnail_url: Option<String>,
    video_title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TimeOffset {
    Text(String),
    Seconds(f64),
}

impl TimeOffset {
    fn as_arg(&self) -> Option<String> {
        let value = match self {
            Self::Text(text) => non_empty(text)?.to_string(),
            Self::Seconds(seconds) if seconds.is_finite() && *seconds >= 0.0 => {
                seconds.to_string()
            }
            Self::Seconds(_) => return None,
        };

        value
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, ':' | '.'))
            .then_some(value)
    }
}

fn required(value: &Option<String>) -> Option<&str> {
    value.as_deref().and_then(non_empty)
}

async fn get_video_info(
    State(state): State<AppState>,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> Result<Json<InfoResponse>, ApiError> {
    let Json(payload) = payload?;
    let url = required(&payload.url).ok_or_else(|| ApiError::bad_request("No URL provided"))?;

    let info = state
        .engine
        .probe(url, &state.engine_options())
        .await
        .map_err(|error| Operation::Info.engine_error(&error))?;

    let thumbnail = info.thumbnail.unwrap_or_else(|| PLACEHOLDER.to_string());
    let hd_thumbnail = best_thumbnail(info.thumbnails.as_deref().unwrap_or_default(), &thumbnail);
    let classified = classify_formats(info.formats.as_deref().unwrap_or_default());

    Ok(Json(InfoResponse {
        title: info.title.unwrap_or_else(|| PLACEHOLDER.to_string()),
        thumbnail,
        hd_thumbnail,
        channel: info.uploader.unwrap_or_else(|| PLACEHOLDER.to_string()),
        duration: info.duration.unwrap_or_else(|| 0.into()),
        views: info.view_count.unwrap_or(0),
        video_formats: classified.video,
        audio_formats: classified.audio,
    }))
}

fn best_thumbnail(thumbnails: &[Thumbnail], fallback: &str) -> String {
    let mut best: Option<(u64, &Thumbnail)> = None;

    for thumbnail in thumbnails {
        let area = u64::from(thumbnail.width.unwrap_or(0)) * u64::from(thumbnail.height.unwrap_or(0));
        if best.is_none_or(|(best_area, _)| area > best_area) {
            best = Some((area, thumbnail));
        }
    }

    best.and_then(|(_, thumbnail)| thumbnail.url.clone())
        .unwrap_or_else(|| fallback.to_string())
}

async fn download_video(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload?;
    let (Some(url), Some(format_id), Some(ext)) = (
        required(&payload.url),
        required(&payload.format_id),
        required(&payload.ext),
    ) else {
        return Err(ApiError::bad_request(
            "Missing URL, format_id, or file extension",
        ));
    };
    if !is_valid_extension(ext) {
        return Err(ApiError::bad_request(format!(
            "Unsupported file extension: {ext}"
        )));
    }

    let title = payload.title.as_deref().unwrap_or("video");
    let stem = format!("{}_{}", sanitize_title(title, "download"), unique_suffix());
    let filename = format!("{stem}.{ext}");

    let options = download_options(state.engine_options(), format_id, ext)
        .with_output_template(state.output_template(&stem));

    serve_download(&state, Operation::Download, url, &options, &stem, &filename).await
}

fn download_options(base: EngineOptions, format_id: &str, ext: &str) -> EngineOptions {
    match ext {
        "mp4" => base
            .with_format(format!("{format_id}+bestaudio[ext=m4a]/best"))
            .with_merge_output_format("mp4")
            .with_post_step(PostStep::RecodeVideo {
                format: "mp4".to_string(),
            }),
        "mp3" => {
            let selector = if format_id.to_lowercase().contains("audio") {
                format_id
            } else {
                "bestaudio/best"
            };
            base.with_format(selector)
                .with_merge_output_format("mp3")
                .with_post_step(PostStep::ExtractAudio {
                    codec: "mp3".to_string(),
                    quality: MP3_QUALITY.to_string(),
                })
        }
        other => base.with_format(format_id).with_merge_output_format(other),
    }
}

async fn download_timestamped_video(
    State(state): State<AppState>,
    payload: Result<Json<SegmentRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload?;
    let (Some(url), Some(start), Some(end)) = (
        required(&payload.url),
        payload.start_time.as_ref(),
        payload.end_time.as_ref(),
    ) else {
        return Err(ApiError::bad_request(
            "Missing URL, start time, or end time",
        ));
    };
    let (Some(start), Some(end)) = (start.as_arg(), end.as_arg()) else {
        return Err(ApiError::bad_request(
            "Start and end times must be seconds or [HH:]MM:SS offsets",
        ));
    };

    let title = payload.title.as_deref().unwrap_or("video");
    let stem = format!(
        "{}_segment_{}",
        sanitize_title(title, "download"),
        unique_suffix()
    );
    let filename = format!("{stem}.mp4");

    let options = state
        .engine_options()
        .with_format(SEGMENT_SELECTOR)
        .with_merge_output_format("mp4")
        .with_output_template(state.output_template(&stem))
        .with_post_step(PostStep::Trim { start, end });

    serve_download(&state, Operation::Segment, url, &options, &stem, &filename).await
}

async fn serve_download(
    state: &AppState,
    operation: Operation,
    url: &str,
    options: &EngineOptions,
    stem: &str,
    filename: &str,
) -> Result<Response, ApiError> {
    sweep_stale_files(
        &state.download_dir,
        STALE_FILE_AGE,
        state.cookies_file.as_deref(),
    )
    .await;

    let guard = PartialOutputGuard::new(&state.download_dir, stem, state.cleanup_delay);
    let result = async {
        let reported = state
            .engine
            .download(url, options)
            .await
            .map_err(|error| operation.engine_error(&error))?;

        let path = resolve_output(&state.download_dir, stem, reported.as_deref())
            .await
            .ok_or_else(|| {
                warn!("{operation:?} finished but no file named {stem}.* was found");
                ApiError::not_found("Downloaded file not found on server.")
            })?;

        let response = attachment_response(&path, filename).await?;
        Ok::<_, ApiError>((path, response))
    }
    .await;

    guard.disarm();
    match result {
        Ok((path, response)) => {
            info!("Serving {:?} as {filename}", path);
            schedule_removal(path, state.cleanup_delay);
            Ok(response)
        }
        Err(error) => {
            discard_partial(&state.download_dir, stem).await;
            Err(error)
        }
    }
}

async fn download_thumbnail(
    State(state): State<AppState>,
    payload: Result<Json<ThumbnailRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload?;
    let thumbnail_url = required(&payload.thumbnail_url)
        .ok_or_else(|| ApiError::bad_request("No thumbnail URL provided"))?;

    let title = payload.video_title.as_deref().unwrap_or("thumbnail");
    let stem = format!(
        "{}_HD_Thumbnail_{}",
        sanitize_title(title, "thumbnail"),
        unique_suffix()
    );
    let filename = format!("{stem}.{}", thumbnail_extension(thumbnail_url));
    let path = state.download_dir.join(&filename);

    let guard = PartialOutputGuard::new(&state.download_dir, &stem, state.cleanup_delay);
    let result = async {
        fetch_to_file(&state.http_client, thumbnail_url, &path).await?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ApiError::internal(
                "An unexpected error occurred during thumbnail download: file not written",
            ));
        }
        attachment_response(&path, &filename).await
    }
    .await;

    guard.disarm();
    match result {
        Ok(response) => {
            info!("Serving thumbnail {:?}", path);
            schedule_removal(path, state.cleanup_delay);
            Ok(response)
        }
        Err(error) => {
            remove_quietly(&path).await;
            Err(error)
        }
    }
}

async fn fetch_to_file(client: &reqwest::Client, url: &str, path: &Path) -> Result<(), ApiError> {
    let fetch_error = |error: reqwest::Error| {
        warn!("Error downloading thumbnail from {url}: {error}");
        ApiError::internal(format!("Failed to fetch thumbnail from URL: {error}"))
    };
    let write_error = |error: std::io::Error| {
        ApiError::internal(format!(
            "An unexpected error occurred during thumbnail download: {error}"
        ))
    };

    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(fetch_error)?;

    let file = tokio::fs::File::create(path).await.map_err(write_error)?;
    let mut writer = BufWriter::with_capacity(THUMBNAIL_CHUNK_SIZE, file);
    while let Some(chunk) = response.chunk().await.map_err(fetch_error)? {
        writer.write_all(&chunk).await.map_err(write_error)?;
    }
    writer.flush().await.map_err(write_error)?;

    Ok(())
}
