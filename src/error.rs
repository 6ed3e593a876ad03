use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::warn;

use crate::engine::EngineError;

const BOT_DETECTION_MESSAGE: &str = "YouTube detected bot activity. This might be due to missing or expired cookies. Please ensure the YOUTUBE_COOKIES_BASE64 environment variable is set with fresh cookies.";

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub detail: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
            detail: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            detail: self.detail,
        });

        (self.status, body).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("Invalid JSON request body: {}", rejection.body_text()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailure {
    BotDetection,
    ToolMissing,
    AgeRestricted,
    Private,
    Unavailable,
    UnsupportedFormat,
}

impl UpstreamFailure {
    pub fn code(self) -> &'static str {
        match self {
            Self::BotDetection => "BOT_DETECTION",
            Self::ToolMissing => "TRANSCODER_MISSING",
            Self::AgeRestricted => "AGE_RESTRICTED",
            Self::Private => "PRIVATE",
            Self::Unavailable => "UNAVAILABLE",
            Self::UnsupportedFormat => "UNSUPPORTED_FORMAT",
        }
    }
}

struct Rule {
    patterns: &'static [&'static str],
    failure: UpstreamFailure,
}

const BOT_DETECTION: Rule = Rule {
    patterns: &[
        "Sign in to confirm you’re not a bot",
        "Sign in to confirm you're not a bot",
        "Unable to extract video data",
        "Please use --cookies-from-browser",
    ],
    failure: UpstreamFailure::BotDetection,
};
const TOOL_MISSING: Rule = Rule {
    patterns: &["FFmpeg", "ffmpeg is not installed", "ffmpeg not found"],
    failure: UpstreamFailure::ToolMissing,
};
const AGE_RESTRICTED: Rule = Rule {
    patterns: &["age-restricted"],
    failure: UpstreamFailure::AgeRestricted,
};
const PRIVATE: Rule = Rule {
    patterns: &["private", "Private video"],
    failure: UpstreamFailure::Private,
};
const UNAVAILABLE: Rule = Rule {
    patterns: &["unavailable", "deleted"],
    failure: UpstreamFailure::Unavailable,
};
const UNSUPPORTED_FORMAT: Rule = Rule {
    patterns: &["No such format", "Requested format is not available"],
    failure: UpstreamFailure::UnsupportedFormat,
};

const INFO_RULES: &[Rule] = &[BOT_DETECTION, AGE_RESTRICTED, PRIVATE, UNAVAILABLE];
const DOWNLOAD_RULES: &[Rule] = &[
    BOT_DETECTION,
    TOOL_MISSING,
    AGE_RESTRICTED,
    PRIVATE,
    UNAVAILABLE,
    UNSUPPORTED_FORMAT,
];
const SEGMENT_RULES: &[Rule] = &[
    BOT_DETECTION,
    TOOL_MISSING,
    AGE_RESTRICTED,
    PRIVATE,
    UNAVAILABLE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Info,
    Download,
    Segment,
}

impl Operation {
    fn rules(self) -> &'static [Rule] {
        match self {
            Self::Info => INFO_RULES,
            Self::Download => DOWNLOAD_RULES,
            Self::Segment => SEGMENT_RULES,
        }
    }

    pub fn classify(self, message: &str) -> Option<UpstreamFailure> {
        self.rules()
            .iter()
            .find(|rule| rule.patterns.iter().any(|pattern| message.contains(pattern)))
            .map(|rule| rule.failure)
    }

    fn failure_error(self, failure: UpstreamFailure) -> ApiError {
        let error = match failure {
            UpstreamFailure::BotDetection => ApiError::internal(BOT_DETECTION_MESSAGE),
            UpstreamFailure::ToolMissing => ApiError::internal(match self {
                Self::Segment => {
                    "FFmpeg is required for timestamped downloads. Please ensure it's installed and in your system PATH."
                }
                _ => {
                    "FFmpeg is required for this download. Please ensure it's installed and in your system PATH."
                }
            }),
            UpstreamFailure::AgeRestricted => ApiError::new(
                StatusCode::FORBIDDEN,
                "This video is age-restricted and cannot be downloaded directly.",
            ),
            UpstreamFailure::Private => ApiError::new(
                StatusCode::FORBIDDEN,
                "This video is private and cannot be accessed.",
            ),
            UpstreamFailure::Unavailable => {
                ApiError::not_found("This video is unavailable or has been deleted.")
            }
            UpstreamFailure::UnsupportedFormat => {
                ApiError::bad_request("The requested format is not available for this video.")
            }
        };
        error.with_code(failure.code())
    }

    fn generic_failure(self, detail: &str) -> ApiError {
        let message = match self {
            Self::Info => format!(
                "Could not retrieve video information. Please check the URL or try another one. Details: {detail}"
            ),
            Self::Download => format!("Failed to download video. Details: {detail}"),
            Self::Segment => format!("Failed to download video segment. Details: {detail}"),
        };
        ApiError::internal(message).with_code("UPSTREAM_ERROR")
    }

    fn unexpected(self, detail: &str) -> ApiError {
        let message = match self {
            Self::Info => format!("An unexpected error occurred: {detail}"),
            Self::Download => format!("An unexpected error occurred during download: {detail}"),
            Self::Segment => {
                format!("An unexpected error occurred during segment download: {detail}")
            }
        };
        ApiError::internal(message).with_code("UNEXPECTED")
    }

    pub fn engine_error(self, error: &EngineError) -> ApiError {
        match error {
            EngineError::Failed(message) => {
                let api_error = match self.classify(message) {
                    Some(failure) => {
                        warn!("{self:?} failed upstream ({}): {message}", failure.code());
                        self.failure_error(failure)
                    }
                    None => {
                        warn!("{self:?} failed upstream: {message}");
                        self.generic_failure(message)
                    }
                };
                api_error.with_detail(message.clone())
            }
            other => {
                let detail = other.to_string();
                warn!("{self:?} failed: {detail}");
                self.unexpected(&detail).with_detail(detail)
            }
        }
    }
}
