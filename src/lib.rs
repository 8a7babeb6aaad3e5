pub mod backoff;
pub mod capture_task;
pub mod codec;
pub mod config;
pub mod error;
pub mod rest;
pub mod sequencer;
pub mod types;
pub mod websocket;
pub mod writer;

// Re-export commonly used types
pub use backoff::Backoff;
pub use capture_task::{run_capture_task, run_recorder, PipelineStats};
pub use codec::{BatchCodec, CsvCodec, JsonLinesCodec, OutputFormat, ParquetCodec};
pub use config::{BackoffConfig, CaptureDepth, RecorderConfig};
pub use error::{RecorderError, Result};
pub use rest::RestClient;
pub use sequencer::{SequenceValidator, Step, SyncState, ValidatorStats};
pub use types::{
    DiffEvent, PriceLevel, RestDepthSnapshot, RotationKey, Snapshot, SubscribeRequest, ValidatedRecord,
    WsPartialDepthMessage,
};
pub use websocket::{DepthStreamClient, StreamEvent};
pub use writer::{BatchRecord, FlushedFile, RotatingWriter, SealedBatch, StreamKind};

use tracing_subscriber::EnvFilter;

/// Initialize logging for the library. `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .init();
}
