use super::BatchCodec;
use crate::error::{RecorderError, Result};
use crate::types::{captured_at_format, DiffEvent, PriceLevel, Snapshot, ValidatedRecord};
use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Int64Array, Int64Builder, ListArray, ListBuilder,
    StringArray, StringBuilder,
};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

type LevelsBuilder = ListBuilder<ListBuilder<StringBuilder>>;

/// Parquet, snappy-compressed. Price levels are `list<list<utf8>>`, update
/// ids are int64.
#[derive(Debug, Clone)]
pub struct ParquetCodec {
    max_row_group_size: usize,
}

impl Default for ParquetCodec {
    fn default() -> Self {
        Self {
            max_row_group_size: 100_000,
        }
    }
}

impl ParquetCodec {
    fn write_batch(&self, batch: &RecordBatch, out: &mut File) -> Result<()> {
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(self.max_row_group_size)
            .set_created_by("depth-recorder".to_string())
            .build();

        let mut writer = ArrowWriter::try_new(out, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;
        Ok(())
    }

    fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
        let file = File::open(path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(batches)
    }
}

fn levels_builder() -> LevelsBuilder {
    ListBuilder::new(ListBuilder::new(StringBuilder::new()))
}

fn append_levels(builder: &mut LevelsBuilder, levels: &[PriceLevel]) {
    for level in levels {
        let pair = builder.values();
        pair.values().append_value(level.price());
        pair.values().append_value(level.quantity());
        pair.append(true);
    }
    builder.append(true);
}

fn to_i64(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| RecorderError::Protocol(format!("parquet column '{}' missing or mistyped", name)))
}

fn read_levels(column: &ListArray, row: usize) -> Result<Vec<PriceLevel>> {
    let pairs = column.value(row);
    let pairs = pairs
        .as_any()
        .downcast_ref::<ListArray>()
        .ok_or_else(|| RecorderError::Protocol("price levels are not a list of lists".to_string()))?;

    let mut levels = Vec::with_capacity(pairs.len());
    for i in 0..pairs.len() {
        let pair = pairs.value(i);
        let pair = pair
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| RecorderError::Protocol("price level is not a string list".to_string()))?;
        if pair.len() != 2 {
            return Err(RecorderError::Protocol(format!(
                "price level has {} entries, expected 2",
                pair.len()
            )));
        }
        levels.push(PriceLevel::new(pair.value(0), pair.value(1)));
    }
    Ok(levels)
}

fn to_u64(value: i64, name: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| RecorderError::Protocol(format!("negative {}: {}", name, value)))
}

impl BatchCodec for ParquetCodec {
    fn extension(&self) -> &'static str {
        "parquet"
    }

    fn write_depth_updates(&self, records: &[ValidatedRecord], out: &mut File) -> Result<()> {
        let mut event_type = StringBuilder::new();
        let mut event_time = Int64Builder::new();
        let mut symbol = StringBuilder::new();
        let mut first_update_id = Int64Builder::new();
        let mut final_update_id = Int64Builder::new();
        let mut bids = levels_builder();
        let mut asks = levels_builder();
        let mut usable = BooleanBuilder::new();
        let mut gap_detected = BooleanBuilder::new();
        let mut snapshot_update_id = Int64Builder::new();

        for record in records {
            let event = &record.event;
            event_type.append_value(&event.event_type);
            event_time.append_value(event.event_time);
            symbol.append_value(&event.symbol);
            first_update_id.append_value(to_i64(event.first_update_id));
            final_update_id.append_value(to_i64(event.final_update_id));
            append_levels(&mut bids, &event.bids);
            append_levels(&mut asks, &event.asks);
            usable.append_value(record.usable);
            gap_detected.append_value(record.gap_detected);
            snapshot_update_id.append_option(record.snapshot_update_id.map(to_i64));
        }

        let batch = RecordBatch::try_from_iter(vec![
            ("e", Arc::new(event_type.finish()) as ArrayRef),
            ("E", Arc::new(event_time.finish()) as ArrayRef),
            ("s", Arc::new(symbol.finish()) as ArrayRef),
            ("U", Arc::new(first_update_id.finish()) as ArrayRef),
            ("u", Arc::new(final_update_id.finish()) as ArrayRef),
            ("b", Arc::new(bids.finish()) as ArrayRef),
            ("a", Arc::new(asks.finish()) as ArrayRef),
            ("usable", Arc::new(usable.finish()) as ArrayRef),
            ("gap_detected", Arc::new(gap_detected.finish()) as ArrayRef),
            ("snapshot_update_id", Arc::new(snapshot_update_id.finish()) as ArrayRef),
        ])?;

        self.write_batch(&batch, out)
    }

    fn write_snapshots(&self, snapshots: &[Snapshot], out: &mut File) -> Result<()> {
        let mut last_update_id = Int64Builder::new();
        let mut bids = levels_builder();
        let mut asks = levels_builder();
        let mut captured_at = StringBuilder::new();

        for snapshot in snapshots {
            last_update_id.append_value(to_i64(snapshot.last_update_id));
            append_levels(&mut bids, &snapshot.bids);
            append_levels(&mut asks, &snapshot.asks);
            captured_at.append_value(captured_at_format::format(&snapshot.captured_at));
        }

        let batch = RecordBatch::try_from_iter(vec![
            ("lastUpdateId", Arc::new(last_update_id.finish()) as ArrayRef),
            ("bids", Arc::new(bids.finish()) as ArrayRef),
            ("asks", Arc::new(asks.finish()) as ArrayRef),
            ("capturedAt", Arc::new(captured_at.finish()) as ArrayRef),
        ])?;

        self.write_batch(&batch, out)
    }

    fn read_depth_updates(&self, path: &Path) -> Result<Vec<ValidatedRecord>> {
        let mut records = Vec::new();
        for batch in Self::read_batches(path)? {
            let event_type = column::<StringArray>(&batch, "e")?;
            let event_time = column::<Int64Array>(&batch, "E")?;
            let symbol = column::<StringArray>(&batch, "s")?;
            let first_update_id = column::<Int64Array>(&batch, "U")?;
            let final_update_id = column::<Int64Array>(&batch, "u")?;
            let bids = column::<ListArray>(&batch, "b")?;
            let asks = column::<ListArray>(&batch, "a")?;
            let usable = column::<BooleanArray>(&batch, "usable")?;
            let gap_detected = column::<BooleanArray>(&batch, "gap_detected")?;
            let snapshot_update_id = column::<Int64Array>(&batch, "snapshot_update_id")?;

            for row in 0..batch.num_rows() {
                let snapshot_id = if snapshot_update_id.is_null(row) {
                    None
                } else {
                    Some(to_u64(snapshot_update_id.value(row), "snapshot_update_id")?)
                };
                records.push(ValidatedRecord {
                    event: DiffEvent {
                        event_type: event_type.value(row).to_string(),
                        event_time: event_time.value(row),
                        symbol: symbol.value(row).to_string(),
                        first_update_id: to_u64(first_update_id.value(row), "U")?,
                        final_update_id: to_u64(final_update_id.value(row), "u")?,
                        bids: read_levels(bids, row)?,
                        asks: read_levels(asks, row)?,
                    },
                    usable: usable.value(row),
                    gap_detected: gap_detected.value(row),
                    snapshot_update_id: snapshot_id,
                });
            }
        }
        Ok(records)
    }

    fn read_snapshots(&self, path: &Path, symbol: &str) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        for batch in Self::read_batches(path)? {
            let last_update_id = column::<Int64Array>(&batch, "lastUpdateId")?;
            let bids = column::<ListArray>(&batch, "bids")?;
            let asks = column::<ListArray>(&batch, "asks")?;
            let captured_at = column::<StringArray>(&batch, "capturedAt")?;

            for row in 0..batch.num_rows() {
                let captured = captured_at_format::parse(captured_at.value(row)).map_err(|e| {
                    RecorderError::Protocol(format!("bad capturedAt '{}': {}", captured_at.value(row), e))
                })?;
                snapshots.push(Snapshot {
                    symbol: symbol.to_string(),
                    last_update_id: to_u64(last_update_id.value(row), "lastUpdateId")?,
                    bids: read_levels(bids, row)?,
                    asks: read_levels(asks, row)?,
                    captured_at: captured,
                });
            }
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support;
    use tempfile::TempDir;

    #[test]
    fn test_depth_updates_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("updates.parquet");
        let records = test_support::records();
        let codec = ParquetCodec::default();

        let mut file = File::create(&path).unwrap();
        codec.write_depth_updates(&records, &mut file).unwrap();
        drop(file);

        let batches = ParquetCodec::read_batches(&path).unwrap();
        let names: Vec<String> = batches[0]
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(
            names,
            vec!["e", "E", "s", "U", "u", "b", "a", "usable", "gap_detected", "snapshot_update_id"]
        );

        assert_eq!(codec.read_depth_updates(&path).unwrap(), records);
    }

    #[test]
    fn test_snapshots_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.parquet");
        let snapshots = test_support::snapshots();
        let codec = ParquetCodec::default();

        let mut file = File::create(&path).unwrap();
        codec.write_snapshots(&snapshots, &mut file).unwrap();
        drop(file);

        assert_eq!(codec.read_snapshots(&path, "DOGEUSDT").unwrap(), snapshots);
    }

    #[test]
    fn test_rejects_foreign_schema() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snapshot.parquet");
        let codec = ParquetCodec::default();

        let mut file = File::create(&path).unwrap();
        codec.write_snapshots(&test_support::snapshots(), &mut file).unwrap();
        drop(file);

        assert!(matches!(codec.read_depth_updates(&path), Err(RecorderError::Protocol(_))));
    }
}
