use super::BatchCodec;
use crate::error::Result;
use crate::types::{Snapshot, ValidatedRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// One JSON object per line, same field names as the exchange frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesCodec;

fn write_lines<T: Serialize>(items: &[T], out: &mut File) -> Result<()> {
    let mut writer = BufWriter::with_capacity(64 * 1024, out);
    for item in items {
        serde_json::to_writer(&mut writer, item)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let reader = BufReader::new(File::open(path)?);
    let mut items = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        items.push(serde_json::from_str(&line)?);
    }
    Ok(items)
}

impl BatchCodec for JsonLinesCodec {
    fn extension(&self) -> &'static str {
        "jsonl"
    }

    fn write_depth_updates(&self, records: &[ValidatedRecord], out: &mut File) -> Result<()> {
        write_lines(records, out)
    }

    fn write_snapshots(&self, snapshots: &[Snapshot], out: &mut File) -> Result<()> {
        write_lines(snapshots, out)
    }

    fn read_depth_updates(&self, path: &Path) -> Result<Vec<ValidatedRecord>> {
        read_lines(path)
    }

    fn read_snapshots(&self, path: &Path, symbol: &str) -> Result<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = read_lines(path)?;
        for snapshot in &mut snapshots {
            snapshot.symbol = symbol.to_string();
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
        let path = tmp.path().join("updates.jsonl");
        let records = test_support::records();

        let mut file = File::create(&path).unwrap();
        JsonLinesCodec.write_depth_updates(&records, &mut file).unwrap();
        drop(file);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["e"], "depthUpdate");
        assert_eq!(first["b"][0][0], "0.08123");

        assert_eq!(JsonLinesCodec.read_depth_updates(&path).unwrap(), records);
    }

    #[test]
    fn test_snapshots_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.jsonl");
        let snapshots = test_support::snapshots();

        let mut file = File::create(&path).unwrap();
        JsonLinesCodec.write_snapshots(&snapshots, &mut file).unwrap();
        drop(file);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains(r#""lastUpdateId":104"#));
        assert!(!text.contains("DOGEUSDT"));

        assert_eq!(JsonLinesCodec.read_snapshots(&path, "DOGEUSDT").unwrap(), snapshots);
    }
}
