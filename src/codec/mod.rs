//! Output codecs
//!
//! Every codec writes the same columns:
//! - depth updates: `e, E, s, U, u, b, a, usable, gap_detected, snapshot_update_id`
//! - snapshots: `lastUpdateId, bids, asks, capturedAt`
//!
//! and can read its own files back.

mod columnar;
mod delimited;
mod json_lines;

pub use columnar::ParquetCodec;
pub use delimited::CsvCodec;
pub use json_lines::JsonLinesCodec;

use crate::error::Result;
use crate::types::{Snapshot, ValidatedRecord};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    #[default]
    Parquet,
    Jsonl,
}

impl OutputFormat {
    pub fn codec(&self) -> Arc<dyn BatchCodec> {
        match self {
            OutputFormat::Csv => Arc::new(CsvCodec),
            OutputFormat::Parquet => Arc::new(ParquetCodec::default()),
            OutputFormat::Jsonl => Arc::new(JsonLinesCodec),
        }
    }
}

/// Serializes one batch into one file.
pub trait BatchCodec: Send + Sync {
    fn extension(&self) -> &'static str;

    fn write_depth_updates(&self, records: &[ValidatedRecord], out: &mut File) -> Result<()>;

    fn write_snapshots(&self, snapshots: &[Snapshot], out: &mut File) -> Result<()>;

    fn read_depth_updates(&self, path: &Path) -> Result<Vec<ValidatedRecord>>;

    /// Snapshot files do not store the symbol; the caller supplies it from the path.
    fn read_snapshots(&self, path: &Path, symbol: &str) -> Result<Vec<Snapshot>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::{DiffEvent, PriceLevel, Snapshot, ValidatedRecord};
    use chrono::{DateTime, Utc};

    pub fn records() -> Vec<ValidatedRecord> {
        let event = |first: u64, last: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>| DiffEvent {
            event_type: "depthUpdate".to_string(),
            event_time: 1_706_745_599_900 + last as i64,
            symbol: "DOGEUSDT".to_string(),
            first_update_id: first,
            final_update_id: last,
            bids,
            asks,
        };
        vec![
            ValidatedRecord::usable(
                event(
                    100,
                    105,
                    vec![PriceLevel::new("0.08123", "1500.0"), PriceLevel::new("0.08120", "0.0")],
                    vec![PriceLevel::new("0.08130", "2000.5")],
                ),
                104,
            ),
            ValidatedRecord::usable(event(106, 110, vec![], vec![PriceLevel::new("0.08131", "10")]), 104),
            ValidatedRecord::gap(event(120, 121, vec![PriceLevel::new("0.08100", "3")], vec![])),
        ]
    }

    pub fn snapshots() -> Vec<Snapshot> {
        let captured_at = DateTime::parse_from_rfc3339("2024-01-31T23:59:58.250001Z")
            .unwrap()
            .with_timezone(&Utc);
        vec![Snapshot {
            symbol: "DOGEUSDT".to_string(),
            last_update_id: 104,
            bids: vec![PriceLevel::new("0.08123", "1500.0"), PriceLevel::new("0.08122", "7")],
            asks: vec![PriceLevel::new("0.08130", "2000.5")],
            captured_at,
        }]
    }
}
