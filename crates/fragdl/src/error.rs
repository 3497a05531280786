use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("{reason}")]
    Backend { reason: String },

    #[error("{reason}")]
    SegmentState { reason: String },

    #[error(
        "Filesize mismatch for segment {segment_id}: Expected {expected} bytes, got {actual} bytes"
    )]
    LengthMismatch {
        segment_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Multiple sequence files found for segment {segment_id}")]
    AmbiguousSequence { segment_id: String },

    #[error("{reason}")]
    InvalidResumeState { reason: String },

    #[error("state file error: {reason}")]
    StateFile { reason: String },

    #[error("bookkeeping file error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("fragment {index} not found, unable to continue")]
    FragmentUnavailable { index: u64 },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    #[error("The downloaded file is empty")]
    EmptyOutput,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn proxy_configuration(reason: impl Into<String>) -> Self {
        Self::ProxyConfiguration {
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    pub fn segment_state(reason: impl Into<String>) -> Self {
        Self::SegmentState {
            reason: reason.into(),
        }
    }

    pub fn invalid_resume_state(reason: impl Into<String>) -> Self {
        Self::InvalidResumeState {
            reason: reason.into(),
        }
    }

    pub fn state_file(reason: impl Into<String>) -> Self {
        Self::StateFile {
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    /// Classify a failed request or body read. An expired request timeout
    /// becomes `Timeout` so it is reported with the URL that stalled.
    pub fn request(source: reqwest::Error, url: &str) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                reason: format!("request to {url} timed out"),
            }
        } else {
            Self::Network { source }
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Transient failures that a retry loop may attempt again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { source } => {
                source.is_connect()
                    || source.is_timeout()
                    || source.is_request()
                    || source.is_body()
                    || source.is_decode()
            }
            Self::Timeout { .. } | Self::Io { .. } => true,
            _ => false,
        }
    }

    /// Errors that corrupt the assembled output if ignored. These always abort.
    pub fn is_fatal_integrity(&self) -> bool {
        matches!(
            self,
            Self::LengthMismatch { .. }
                | Self::AmbiguousSequence { .. }
                | Self::SegmentState { .. }
                | Self::Backend { .. }
        )
    }

    /// Errors that only invalidate a piece of resume state; the affected unit
    /// is discarded and downloaded again.
    pub fn is_resume_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidResumeState { .. } | Self::StateFile { .. } | Self::Json { .. }
        )
    }

    /// The server reported that the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::HttpStatus { status, .. } => {
                *status == StatusCode::NOT_FOUND || *status == StatusCode::GONE
            }
            Self::Io { source } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<prost::DecodeError> for DownloadError {
    fn from(err: prost::DecodeError) -> Self {
        Self::state_file(format!("failed to decode state: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        let server = DownloadError::http_status(StatusCode::BAD_GATEWAY, "http://a", "fragment");
        assert!(server.is_retryable());
        assert!(!server.is_not_found());

        let missing = DownloadError::http_status(StatusCode::NOT_FOUND, "http://a", "fragment");
        assert!(!missing.is_retryable());
        assert!(missing.is_not_found());

        let throttled =
            DownloadError::http_status(StatusCode::TOO_MANY_REQUESTS, "http://a", "fragment");
        assert!(throttled.is_retryable());
    }

    #[test]
    fn integrity_errors_are_fatal() {
        let mismatch = DownloadError::LengthMismatch {
            segment_id: "1".to_string(),
            expected: 2048,
            actual: 2047,
        };
        assert!(mismatch.is_fatal_integrity());
        assert!(!mismatch.is_resume_recoverable());
        assert_eq!(
            mismatch.to_string(),
            "Filesize mismatch for segment 1: Expected 2048 bytes, got 2047 bytes"
        );

        let resume = DownloadError::invalid_resume_state("Cannot find existing sequence 1 file");
        assert!(resume.is_resume_recoverable());
        assert!(!resume.is_fatal_integrity());
    }

    #[test]
    fn fragment_unavailable_message() {
        let err = DownloadError::FragmentUnavailable { index: 3 };
        assert_eq!(err.to_string(), "fragment 3 not found, unable to continue");
    }
}
