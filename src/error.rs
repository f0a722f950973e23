use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid dataset master id: {0}")]
    InvalidMasterId(String),

    #[error("invalid variant label: {0}")]
    InvalidVariantLabel(String),

    #[error("invalid CMIP6 filename: {0}")]
    InvalidFilename(String),

    #[error("malformed catalog row: {0}")]
    MalformedRow(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("index node request failed: {0}")]
    SearchHttp(String),

    #[error("index node returned status {status}: {message}")]
    SearchStatus { status: u16, message: String },

    #[error("index node request timed out: {0}")]
    SearchTimeout(String),

    #[error("failed to decode index node response: {0}")]
    SearchDecode(String),

    #[error("download request failed: {0}")]
    DownloadHttp(String),

    #[error("download returned status {status} for {url}")]
    DownloadStatus { status: u16, url: String },

    #[error("download timed out: {0}")]
    DownloadTimeout(String),

    #[error("incomplete transfer from {url}: expected {expected} bytes, got {received}")]
    IncompleteTransfer {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("query protocol request failed: {0}")]
    QueryProtocol(String),
}

impl HarvestError {
    /// Errors worth retrying against the same endpoint.
    pub fn is_transient(&self) -> bool {
        match self {
            HarvestError::SearchStatus { status, .. }
            | HarvestError::DownloadStatus { status, .. } => is_retryable_status(*status),
            HarvestError::SearchTimeout(_)
            | HarvestError::DownloadTimeout(_)
            | HarvestError::IncompleteTransfer { .. } => true,
            _ => false,
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}
