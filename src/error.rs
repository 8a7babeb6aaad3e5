use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: Box<RecorderError>,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Sequence gap for {symbol}: expected U={expected}, got U={got}")]
    SequenceGap { symbol: String, expected: u64, got: u64 },

    #[error("Snapshot fetch for {symbol} failed after {attempts} attempts: {reason}")]
    SnapshotFetch {
        symbol: String,
        attempts: u32,
        reason: String,
    },

    #[error("{what}: gave up after {attempts} attempts")]
    RetriesExhausted { what: String, attempts: u32 },

    #[error("Final flush did not finish within {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Pipelines failed for: {}", .0.join(", "))]
    Pipelines(Vec<String>),
}

impl RecorderError {
    /// Wrap a write-path error with the file it concerns.
    pub fn filesystem(path: impl Into<PathBuf>, source: impl Into<RecorderError>) -> Self {
        RecorderError::Filesystem {
            path: path.into(),
            source: Box::new(source.into()),
        }
    }

    /// Errors worth retrying in place (network hiccups, 5xx, 429).
    pub fn is_transient(&self) -> bool {
        match self {
            RecorderError::WebSocket(_) | RecorderError::ConnectionClosed => true,
            RecorderError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().map_or(false, |s| s.is_server_error() || s.as_u16() == 429)
            }
            RecorderError::ApiError(_) => true,
            _ => false,
        }
    }

    /// Errors that terminate the symbol's pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RecorderError::Filesystem { .. }
                | RecorderError::RetriesExhausted { .. }
                | RecorderError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RecorderError>;
