use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadErrorCode {
    Unknown,
    InvalidArgument,
    Network,
    RequestFailed,
    SessionStale,
    SessionTerminated,
    ContentDrift,
    RetryExhausted,
    Aborted,
    InternalError,
}

impl UploadErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadErrorCode::Unknown => "upload/unknown",
            UploadErrorCode::InvalidArgument => "upload/invalid-argument",
            UploadErrorCode::Network => "upload/network-error",
            UploadErrorCode::RequestFailed => "upload/request-failed",
            UploadErrorCode::SessionStale => "upload/session-stale",
            UploadErrorCode::SessionTerminated => "upload/session-terminated",
            UploadErrorCode::ContentDrift => "upload/content-drift",
            UploadErrorCode::RetryExhausted => "upload/retry-limit-exceeded",
            UploadErrorCode::Aborted => "upload/aborted",
            UploadErrorCode::InternalError => "upload/internal-error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadError {
    pub code: UploadErrorCode,
    message: String,
    pub status: Option<u16>,
    pub server_response: Option<String>,
}

impl UploadError {
    pub fn new(code: UploadErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            server_response: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_server_response(mut self, response: impl Into<String>) -> Self {
        self.server_response = Some(response.into());
        self
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }
}

impl Display for UploadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(server) = &self.server_response {
            write!(f, "{} ({}): {}", self.message, self.code_str(), server)
        } else {
            write!(f, "{} ({})", self.message, self.code_str())
        }
    }
}

impl Error for UploadError {}

pub type UploadResult<T> = Result<T, UploadError>;

pub fn unknown_error() -> UploadError {
    UploadError::new(
        UploadErrorCode::Unknown,
        "An unknown error occurred; check the error payload for details.",
    )
}

pub fn invalid_argument(message: impl Into<String>) -> UploadError {
    UploadError::new(UploadErrorCode::InvalidArgument, message)
}

pub fn network_error(message: impl Into<String>) -> UploadError {
    UploadError::new(UploadErrorCode::Network, message)
}

pub fn request_failed(status: u16) -> UploadError {
    UploadError::new(
        UploadErrorCode::RequestFailed,
        format!("upload request failed with status {status}"),
    )
    .with_status(status)
}

pub fn session_stale() -> UploadError {
    UploadError::new(
        UploadErrorCode::SessionStale,
        "The resumable upload session is no longer known to the server.",
    )
    .with_status(404)
}

pub fn session_terminated() -> UploadError {
    UploadError::new(
        UploadErrorCode::SessionTerminated,
        "The resumable upload session has been terminated by the server.",
    )
    .with_status(410)
}

pub fn content_drift() -> UploadError {
    UploadError::new(
        UploadErrorCode::ContentDrift,
        "The content being uploaded does not match the content the session was created for.",
    )
}

pub fn aborted() -> UploadError {
    UploadError::new(UploadErrorCode::Aborted, "The upload was aborted by the caller.")
}

pub fn internal_error(message: impl Into<String>) -> UploadError {
    UploadError::new(UploadErrorCode::InternalError, message)
}
