use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::ApiError;

pub const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

const MAX_EXTENSION_LEN: usize = 5;
// Leaves room for the suffix and extension under the 255 byte name limit.
const MAX_SLUG_BYTES: usize = 150;

pub const STALE_FILE_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// Filesystem-safe slug of a display title, or `fallback` when nothing survives.
pub fn sanitize_title(title: &str, fallback: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|character| {
            character.is_alphanumeric()
                || character.is_whitespace()
                || matches!(character, '_' | '-')
        })
        .collect();

    let mut slug: String = kept
        .trim()
        .chars()
        .map(|character| if character.is_whitespace() { '_' } else { character })
        .collect();

    if slug.len() > MAX_SLUG_BYTES {
        let mut end = MAX_SLUG_BYTES;
        while !slug.is_char_boundary(end) {
            end -= 1;
        }
        slug.truncate(end);
        slug.truncate(slug.trim_end_matches(['_', '-']).len());
    }

    if slug.is_empty() {
        fallback.to_string()
    } else {
        slug
    }
}

pub fn unique_suffix() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

pub fn is_valid_extension(ext: &str) -> bool {
    !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

pub fn thumbnail_extension(thumbnail_url: &str) -> String {
    let path = match Url::parse(thumbnail_url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => thumbnail_url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };

    path.rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| ext.len() <= MAX_EXTENSION_LEN && is_valid_extension(ext))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "jpg".to_string())
}

/// Path the engine reported if it is a file inside `dir`, else the first `<stem>.*` file.
pub async fn resolve_output(dir: &Path, stem: &str, reported: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = reported
        && is_file_in(dir, path).await
    {
        return Some(path.to_path_buf());
    }

    stem_matches(dir, stem).await.into_iter().next()
}

async fn is_file_in(dir: &Path, path: &Path) -> bool {
    let (Ok(dir), Ok(path)) = (
        tokio::fs::canonicalize(dir).await,
        tokio::fs::canonicalize(path).await,
    ) else {
        return false;
    };

    if !path.starts_with(&dir) {
        warn!("Ignoring engine output outside the download directory: {:?}", path);
        return false;
    }

    tokio::fs::metadata(&path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

async fn stem_matches(dir: &Path, stem: &str) -> Vec<PathBuf> {
    let prefix = format!("{stem}.");
    let mut matches = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            warn!("Could not read download directory {:?}: {error}", dir);
            return matches;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate download directory {:?}: {error}", dir);
                break;
            }
        };

        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(&prefix))
        {
            matches.push(entry.path());
        }
    }

    matches.sort();
    matches
}

pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Cleaned up {:?}", path),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            debug!("{:?} already removed", path);
        }
        Err(error) => warn!("Error cleaning up file {:?}: {error}", path),
    }
}

pub async fn discard_partial(dir: &Path, stem: &str) {
    for path in stem_matches(dir, stem).await {
        remove_quietly(&path).await;
    }
}

pub fn schedule_removal(path: PathBuf, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        remove_quietly(&path).await;
    })
}

/// Discards `<stem>.*` when dropped before `disarm`, i.e. on a cancelled request.
pub struct PartialOutputGuard {
    dir: PathBuf,
    stem: String,
    delay: Duration,
    armed: bool,
}

impl PartialOutputGuard {
    pub fn new(dir: &Path, stem: &str, delay: Duration) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stem: stem.to_string(),
            delay,
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialOutputGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime left to discard {}.* in {:?}", self.stem, self.dir);
            return;
        };

        info!("Request for {} was cancelled, discarding its output", self.stem);
        let dir = std::mem::take(&mut self.dir);
        let stem = std::mem::take(&mut self.stem);
        let delay = self.delay;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            discard_partial(&dir, &stem).await;
        });
    }
}

pub async fn sweep_stale_files(dir: &Path, max_age: Duration, keep: Option<&Path>) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open download directory for cleanup: {error}");
            }
            return;
        }
    };

    let keep = match keep {
        Some(path) => tokio::fs::canonicalize(path).await.ok(),
        None => None,
    };
    let now = SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate download directory for cleanup: {error}");
                break;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        if let Some(keep) = &keep
            && tokio::fs::canonicalize(&path).await.ok().as_ref() == Some(keep)
        {
            continue;
        }

        remove_quietly(&path).await;
    }
}

pub async fn attachment_response(path: &Path, filename: &str) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(path).await.map_err(|error| {
        ApiError::internal(format!("Could not open downloaded file: {error}"))
    })?;
    let metadata = file.metadata().await.map_err(|error| {
        ApiError::internal(format!("Could not read downloaded file metadata: {error}"))
    })?;

    let content_type = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream");

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(filename))
            .map_err(|_| ApiError::internal("Could not build the file name header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "download.bin".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_title_strips_punctuation_and_joins_words() {
        assert_eq!(
            sanitize_title("  Rick Astley - Never Gonna (Official) ", "download"),
            "Rick_Astley_-_Never_Gonna_Official"
        );
        assert_eq!(sanitize_title("Café del\tMar", "download"), "Café_del_Mar");
    }

    #[test]
    fn punctuation_only_title_falls_back() {
        assert_eq!(sanitize_title("?!. ... ;:", "download"), "download");
        assert_eq!(sanitize_title("", "thumbnail"), "thumbnail");
    }

    #[test]
    fn long_multibyte_title_fits_file_name_limit() {
        let title = "日本語のタイトル".repeat(12);

        let slug = sanitize_title(&title, "thumbnail");

        assert!(slug.len() <= 150, "{}", slug.len());
        assert!(!slug.is_empty());
        assert!(title.starts_with(&slug));

        let name = format!("{slug}_HD_Thumbnail_{}.webp", unique_suffix());
        assert!(name.len() < 255);
    }

    #[test]
    fn truncated_slug_does_not_end_in_separator() {
        let title = format!("{} tail", "a".repeat(149));

        assert_eq!(sanitize_title(&title, "download"), "a".repeat(149));
    }

    #[test]
    fn unique_suffix_is_eight_hex_chars() {
        let suffix = unique_suffix();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(suffix, unique_suffix());
    }

    #[test]
    fn thumbnail_extension_from_url_path() {
        assert_eq!(
            thumbnail_extension("https://i.ytimg.com/vi/abc/maxresdefault.webp?v=12"),
            "webp"
        );
        assert_eq!(
            thumbnail_extension("https://i.ytimg.com/vi/abc/hqdefault.JPG"),
            "jpg"
        );
        assert_eq!(thumbnail_extension("https://i.ytimg.com/vi/abc/default"), "jpg");
        assert_eq!(
            thumbnail_extension("https://cdn.test/img/thumb.original-size"),
            "jpg"
        );
        assert_eq!(thumbnail_extension("not a url/thumb.png?x=1"), "png");
    }

    #[test]
    fn extension_validation_rejects_paths() {
        assert!(is_valid_extension("mp4"));
        assert!(is_valid_extension("webm"));
        assert!(!is_valid_extension(""));
        assert!(!is_valid_extension("../mp4"));
        assert!(!is_valid_extension("mp 4"));
    }

    #[test]
    fn content_disposition_carries_utf8_name() {
        assert_eq!(
            build_content_disposition("Café_1a2b3c4d.mp4"),
            "attachment; filename=\"Caf__1a2b3c4d.mp4\"; filename*=UTF-8''Caf%C3%A9_1a2b3c4d.mp4"
        );
    }

    #[tokio::test]
    async fn scheduled_removal_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip_00000000.mp4");
        std::fs::write(&path, b"data").unwrap();

        schedule_removal(path.clone(), Duration::from_millis(20))
            .await
            .unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn scheduled_removal_of_missing_file_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip_00000000.mp4");
        std::fs::write(&path, b"data").unwrap();

        let handle = schedule_removal(path.clone(), Duration::from_millis(20));
        std::fs::remove_file(&path).unwrap();

        assert!(handle.await.is_ok());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn discard_partial_only_touches_matching_stem() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("clip_deadbeef.f137.mp4.part");
        let merged = dir.path().join("clip_deadbeef.mp4");
        let other = dir.path().join("clip_cafebabe.mp4");
        for path in [&partial, &merged, &other] {
            std::fs::write(path, b"x").unwrap();
        }

        discard_partial(dir.path(), "clip_deadbeef").await;

        assert!(!partial.exists());
        assert!(!merged.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn dropped_guard_discards_stem_output() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("video_1a2b3c4d.mp4.part");
        let other = dir.path().join("video_99999999.mp4");
        std::fs::write(&partial, b"x").unwrap();
        std::fs::write(&other, b"x").unwrap();

        drop(PartialOutputGuard::new(
            dir.path(),
            "video_1a2b3c4d",
            Duration::from_millis(10),
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!partial.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn disarmed_guard_leaves_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("video_1a2b3c4d.mp4");
        std::fs::write(&output, b"x").unwrap();

        PartialOutputGuard::new(dir.path(), "video_1a2b3c4d", Duration::from_millis(10))
            .disarm();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(output.exists());
    }

    #[tokio::test]
    async fn sweep_removes_old_files_but_keeps_cookies() {
        let dir = tempfile::tempdir().unwrap();
        let leftover = dir.path().join("video_1a2b3c4d.mp4");
        let cookies = dir.path().join("cookies.txt");
        let nested = dir.path().join("nested");
        std::fs::write(&leftover, b"x").unwrap();
        std::fs::write(&cookies, b"x").unwrap();
        std::fs::create_dir(&nested).unwrap();

        sweep_stale_files(dir.path(), STALE_FILE_AGE, Some(&cookies)).await;
        assert!(leftover.exists());

        sweep_stale_files(dir.path(), Duration::ZERO, Some(&cookies)).await;
        assert!(!leftover.exists());
        assert!(cookies.exists());
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn sweep_of_missing_directory_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        sweep_stale_files(&dir.path().join("absent"), Duration::ZERO, None).await;
    }

    #[tokio::test]
    async fn resolve_output_prefers_reported_path() {
        let dir = tempfile::tempdir().unwrap();
        let reported = dir.path().join("song_0badf00d.mp3");
        std::fs::write(&reported, b"x").unwrap();
        std::fs::write(dir.path().join("song_0badf00d.a.webm"), b"x").unwrap();

        let resolved = resolve_output(dir.path(), "song_0badf00d", Some(&reported)).await;

        assert_eq!(
            resolved.map(|path| path.file_name().unwrap().to_owned()),
            Some(reported.file_name().unwrap().to_owned())
        );
    }

    #[tokio::test]
    async fn resolve_output_falls_back_to_stem_scan() {
        let dir = tempfile::tempdir().unwrap();
        let produced = dir.path().join("song_0badf00d.m4a");
        std::fs::write(&produced, b"x").unwrap();
        let outside = tempfile::NamedTempFile::new().unwrap();

        let resolved = resolve_output(dir.path(), "song_0badf00d", Some(outside.path())).await;
        assert_eq!(resolved, Some(produced));

        assert_eq!(resolve_output(dir.path(), "missing_12345678", None).await, None);
    }
}
