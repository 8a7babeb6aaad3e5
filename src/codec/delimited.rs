use super::BatchCodec;
use crate::error::{RecorderError, Result};
use crate::types::{captured_at_format, DiffEvent, PriceLevel, Snapshot, ValidatedRecord};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

/// Comma-separated text. Price level lists are stored as JSON arrays inside
/// their cell, e.g. `"[[""0.081"",""1500""]]"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvCodec;

#[derive(Debug, Serialize, Deserialize)]
struct DepthUpdateRow {
    e: String,
    #[serde(rename = "E")]
    event_time: i64,
    s: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    b: String,
    a: String,
    usable: bool,
    gap_detected: bool,
    snapshot_update_id: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRow {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: String,
    asks: String,
    #[serde(rename = "capturedAt")]
    captured_at: String,
}

fn parse_levels(cell: &str) -> Result<Vec<PriceLevel>> {
    Ok(serde_json::from_str(cell)?)
}

impl BatchCodec for CsvCodec {
    fn extension(&self) -> &'static str {
        "csv"
    }

    fn write_depth_updates(&self, records: &[ValidatedRecord], out: &mut File) -> Result<()> {
        let mut writer = WriterBuilder::new().has_headers(true).from_writer(out);
        for record in records {
            let event = &record.event;
            writer.serialize(DepthUpdateRow {
                e: event.event_type.clone(),
                event_time: event.event_time,
                s: event.symbol.clone(),
                first_update_id: event.first_update_id,
                final_update_id: event.final_update_id,
                b: serde_json::to_string(&event.bids)?,
                a: serde_json::to_string(&event.asks)?,
                usable: record.usable,
                gap_detected: record.gap_detected,
                snapshot_update_id: record.snapshot_update_id,
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    fn write_snapshots(&self, snapshots: &[Snapshot], out: &mut File) -> Result<()> {
        let mut writer = WriterBuilder::new().has_headers(true).from_writer(out);
        for snapshot in snapshots {
            writer.serialize(SnapshotRow {
                last_update_id: snapshot.last_update_id,
                bids: serde_json::to_string(&snapshot.bids)?,
                asks: serde_json::to_string(&snapshot.asks)?,
                captured_at: captured_at_format::format(&snapshot.captured_at),
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    fn read_depth_updates(&self, path: &Path) -> Result<Vec<ValidatedRecord>> {
        let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let mut records = Vec::new();
        for row in reader.deserialize::<DepthUpdateRow>() {
            let row = row?;
            records.push(ValidatedRecord {
                event: DiffEvent {
                    event_type: row.e,
                    event_time: row.event_time,
                    symbol: row.s,
                    first_update_id: row.first_update_id,
                    final_update_id: row.final_update_id,
                    bids: parse_levels(&row.b)?,
                    asks: parse_levels(&row.a)?,
                },
                usable: row.usable,
                gap_detected: row.gap_detected,
                snapshot_update_id: row.snapshot_update_id,
            });
        }
        Ok(records)
    }

    fn read_snapshots(&self, path: &Path, symbol: &str) -> Result<Vec<Snapshot>> {
        let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let mut snapshots = Vec::new();
        for row in reader.deserialize::<SnapshotRow>() {
            let row = row?;
            let captured_at = captured_at_format::parse(&row.captured_at)
                .map_err(|e| RecorderError::Protocol(format!("bad capturedAt '{}': {}", row.captured_at, e)))?;
            snapshots.push(Snapshot {
                symbol: symbol.to_string(),
                last_update_id: row.last_update_id,
                bids: parse_levels(&row.bids)?,
                asks: parse_levels(&row.asks)?,
                captured_at,
            });
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_depth_updates_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("updates.csv");
        let records = test_support::records();

        let mut file = File::create(&path).unwrap();
        CsvCodec.write_depth_updates(&records, &mut file).unwrap();
        drop(file);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("e,E,s,U,u,b,a,usable,gap_detected,snapshot_update_id\n"));

        assert_eq!(CsvCodec.read_depth_updates(&path).unwrap(), records);
    }

    #[test]
    fn test_snapshots_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.csv");
        let snapshots = test_support::snapshots();

        let mut file = File::create(&path).unwrap();
        CsvCodec.write_snapshots(&snapshots, &mut file).unwrap();
        drop(file);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("lastUpdateId,bids,asks,capturedAt\n"));
        assert!(text.contains("2024-01-31 23:59:58.250001+00:00"));

        assert_eq!(CsvCodec.read_snapshots(&path, "DOGEUSDT").unwrap(), snapshots);
    }
}
