use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::formats::StreamDescriptor;

// Containers yt-dlp accepts for --merge-output-format.
const MERGE_CONTAINERS: [&str; 6] = ["avi", "flv", "mkv", "mov", "mp4", "webm"];

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Failed(String),
    #[error("could not run yt-dlp: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("unreadable yt-dlp output: {0}")]
    Output(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<serde_json::Number>,
    pub view_count: Option<u64>,
    pub thumbnails: Option<Vec<Thumbnail>>,
    pub formats: Option<Vec<StreamDescriptor>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Thumbnail {
    pub url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostStep {
    RecodeVideo { format: String },
    ExtractAudio { codec: String, quality: String },
    Trim { start: String, end: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOptions {
    pub cookies_file: Option<PathBuf>,
    pub proxy: Option<String>,
    pub format: Option<String>,
    pub merge_output_format: Option<String>,
    pub output_template: Option<String>,
    pub post_steps: Vec<PostStep>,
}

impl EngineOptions {
    pub fn new(cookies_file: Option<&Path>, proxy: Option<&str>) -> Self {
        if let Some(path) = cookies_file {
            debug!("Using cookies file {:?}", path);
        }
        if let Some(proxy) = proxy {
            debug!("Using proxy {proxy}");
        }

        Self {
            cookies_file: cookies_file.map(Path::to_path_buf),
            proxy: proxy.map(ToString::to_string),
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_merge_output_format(mut self, ext: impl Into<String>) -> Self {
        self.merge_output_format = Some(ext.into());
        self
    }

    pub fn with_output_template(mut self, template: impl Into<String>) -> Self {
        self.output_template = Some(template.into());
        self
    }

    pub fn with_post_step(mut self, step: PostStep) -> Self {
        self.post_steps.push(step);
        self
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
            "--no-cache-dir".to_string(),
        ];

        if let Some(path) = &self.cookies_file {
            args.push("--cookies".to_string());
            args.push(path.to_string_lossy().into_owned());
        }
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }

        args
    }

    pub fn probe_args(&self, url: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.push("-J".to_string());
        args.push("--skip-download".to_string());
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    pub fn download_args(&self, url: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.push("--newline".to_string());
        args.push("--print".to_string());
        args.push("after_move:filepath".to_string());

        if let Some(format) = &self.format {
            args.push("-f".to_string());
            args.push(format.clone());
        }
        if let Some(ext) = self
            .merge_output_format
            .as_ref()
            .filter(|ext| MERGE_CONTAINERS.contains(&ext.as_str()))
        {
            args.push("--merge-output-format".to_string());
            args.push(ext.clone());
        }
        if let Some(template) = &self.output_template {
            args.push("-o".to_string());
            args.push(template.clone());
        }

        for step in &self.post_steps {
            match step {
                PostStep::RecodeVideo { format } => {
                    args.push("--recode-video".to_string());
                    args.push(format.clone());
                }
                PostStep::ExtractAudio { codec, quality } => {
                    args.push("-x".to_string());
                    args.push("--audio-format".to_string());
                    args.push(codec.clone());
                    args.push("--audio-quality".to_string());
                    args.push(quality.clone());
                }
                PostStep::Trim { start, end } => {
                    args.push("--download-sections".to_string());
                    args.push(format!("*{start}-{end}"));
                    args.push("--force-keyframes-at-cuts".to_string());
                }
            }
        }

        args.push("--".to_string());
        args.push(url.to_string());
        args
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn probe(&self, url: &str, options: &EngineOptions) -> Result<VideoInfo, EngineError>;

    async fn download(
        &self,
        url: &str,
        options: &EngineOptions,
    ) -> Result<Option<PathBuf>, EngineError>;
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: String,
}

impl YtDlp {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, EngineError> {
        debug!("Running {} {:?}", self.program, args);
        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    warn!("{} is not installed or not on PATH", self.program);
                }
                EngineError::Spawn(error)
            })?;

        if !output.status.success() {
            return Err(EngineError::Failed(failure_message(&output.stderr)));
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaEngine for YtDlp {
    async fn probe(&self, url: &str, options: &EngineOptions) -> Result<VideoInfo, EngineError> {
        let output = self.run(options.probe_args(url)).await?;
        serde_json::from_slice(&output.stdout).map_err(|error| EngineError::Output(error.to_string()))
    }

    async fn download(
        &self,
        url: &str,
        options: &EngineOptions,
    ) -> Result<Option<PathBuf>, EngineError> {
        let output = self.run(options.download_args(url)).await?;
        Ok(extract_printed_path(&output.stdout).map(PathBuf::from))
    }
}

fn failure_message(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let errors: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| line.starts_with("ERROR:"))
        .collect();

    if !errors.is_empty() {
        return errors.join("\n");
    }

    lines
        .last()
        .map(|line| (*line).to_string())
        .unwrap_or_else(|| "yt-dlp exited without an error message".to_string())
}

fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}
