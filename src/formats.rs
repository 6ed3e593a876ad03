use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub const BEST_VIDEO_SELECTOR: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best";
pub const BEST_MP3_SELECTOR: &str = "bestaudio[ext=mp3]/bestaudio";
pub const BEST_AUDIO_SELECTOR: &str = "bestaudio";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDescriptor {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub filesize: Option<f64>,
}

impl StreamDescriptor {
    // yt-dlp spells a missing track as "none"; an absent field is not that sentinel.
    fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some("none")
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    fn height(&self) -> Option<u32> {
        self.height.filter(|height| *height > 0)
    }

    fn size(&self) -> Option<u64> {
        self.filesize
            .filter(|size| size.is_finite() && *size >= 0.0)
            .map(|size| size as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatOption {
    pub format_id: Option<String>,
    pub quality: String,
    pub ext: Option<String>,
    pub filesize: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedFormats {
    pub video: Vec<FormatOption>,
    pub audio: Vec<FormatOption>,
}

pub fn classify_formats(formats: &[StreamDescriptor]) -> ClassifiedFormats {
    let mut video = Vec::new();
    let mut audio = Vec::new();
    let mut seen_video = HashSet::new();
    let mut seen_audio = HashSet::new();

    for format in formats {
        if let Some(option) = video_option(format) {
            if seen_video.insert(option.quality.clone()) {
                video.push(option);
            }
        } else if let Some(option) = audio_option(format)
            && seen_audio.insert(option.quality.clone())
        {
            audio.push(option);
        }
    }

    if video.is_empty() {
        video.push(FormatOption {
            format_id: Some(BEST_VIDEO_SELECTOR.to_string()),
            quality: "Best Quality (MP4)".to_string(),
            ext: Some("mp4".to_string()),
            filesize: None,
        });
    }

    if audio.is_empty() {
        audio.push(FormatOption {
            format_id: Some(BEST_MP3_SELECTOR.to_string()),
            quality: "Best Audio (MP3)".to_string(),
            ext: Some("mp3".to_string()),
            filesize: None,
        });
        audio.push(FormatOption {
            format_id: Some(BEST_AUDIO_SELECTOR.to_string()),
            quality: "Best Audio (Original)".to_string(),
            ext: Some("m4a".to_string()),
            filesize: None,
        });
    }

    // Both sorts are stable, so equal keys keep their first-seen order.
    video.sort_by(|a, b| height_rank(&b.quality).cmp(&height_rank(&a.quality)));
    audio.sort_by(|a, b| a.quality.cmp(&b.quality));

    ClassifiedFormats { video, audio }
}

fn video_option(format: &StreamDescriptor) -> Option<FormatOption> {
    if !format.has_video() {
        return None;
    }
    let height = format.height()?;

    let (quality, ext) = if format.has_audio() {
        (
            format!("{height}p MP4 (Combined)"),
            format.ext.clone().unwrap_or_else(|| "mp4".to_string()),
        )
    } else {
        // merged with an audio track into mp4 at download time
        (format!("{height}p MP4"), "mp4".to_string())
    };

    Some(FormatOption {
        format_id: format.format_id.clone(),
        quality,
        ext: Some(ext),
        filesize: format.size(),
    })
}

fn audio_option(format: &StreamDescriptor) -> Option<FormatOption> {
    if format.has_video() || !format.has_audio() {
        return None;
    }

    let quality = match (format.ext.as_deref(), format.acodec.as_deref()) {
        (Some("mp3"), _) => "Audio Only MP3",
        (Some("m4a"), _) => "Audio Only M4A",
        (Some("webm"), Some("opus")) => "Audio Only Opus (WebM)",
        _ => return None,
    };

    Some(FormatOption {
        format_id: format.format_id.clone(),
        quality: quality.to_string(),
        ext: format.ext.clone(),
        filesize: format.size(),
    })
}

/// Leading integer before the first `p` of a label, or -1.
fn height_rank(quality: &str) -> i64 {
    quality
        .split_once('p')
        .and_then(|(height, _)| height.trim().parse::<i64>().ok())
        .unwrap_or(-1)
}
