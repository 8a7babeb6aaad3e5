//! Batching writer with count, age and date-boundary rotation.
//!
//! A `RotatingWriter` only decides *when* a batch is complete. Completed
//! batches come out as `SealedBatch`es, which are written by the caller
//! (usually on the blocking pool) to `<path>.tmp` and renamed into place.

use crate::codec::BatchCodec;
use crate::error::{RecorderError, Result};
use crate::types::{RotationKey, Snapshot, ValidatedRecord};
use chrono::{DateTime, NaiveDate, Utc};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A record type the writer can batch.
pub trait BatchRecord: Send + Sized + 'static {
    /// UTC time that decides which date partition the record belongs to.
    fn timestamp(&self) -> DateTime<Utc>;

    fn encode(codec: &dyn BatchCodec, batch: &[Self], out: &mut File) -> Result<()>;
}

impl BatchRecord for ValidatedRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        match self.event.event_time_utc() {
            Some(event_time) => event_time,
            None => {
                warn!(
                    symbol = %self.event.symbol,
                    event_time = self.event.event_time,
                    final_update_id = self.event.final_update_id,
                    "Event time out of range, partitioning by receipt time"
                );
                Utc::now()
            }
        }
    }

    fn encode(codec: &dyn BatchCodec, batch: &[Self], out: &mut File) -> Result<()> {
        codec.write_depth_updates(batch, out)
    }
}

impl BatchRecord for Snapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.captured_at
    }

    fn encode(codec: &dyn BatchCodec, batch: &[Self], out: &mut File) -> Result<()> {
        codec.write_snapshots(batch, out)
    }
}

/// Which stream a writer persists; decides directory and file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    DepthUpdates,
    Snapshots,
    PartialDepth(u16),
}

impl StreamKind {
    pub fn dir_name(&self) -> String {
        match self {
            StreamKind::DepthUpdates => "depth-updates".to_string(),
            StreamKind::Snapshots => "snapshots".to_string(),
            StreamKind::PartialDepth(n) => format!("depth{}", n),
        }
    }

    pub fn file_stem(&self) -> String {
        match self {
            StreamKind::DepthUpdates => "depth-updates".to_string(),
            StreamKind::Snapshots => "snapshot".to_string(),
            StreamKind::PartialDepth(n) => format!("depth{}", n),
        }
    }
}

/// A file that was written and renamed into place
#[derive(Debug, Clone)]
pub struct FlushedFile {
    pub key: RotationKey,
    pub path: PathBuf,
    pub records: usize,
}

/// A completed batch with its final path, ready to be written.
pub struct SealedBatch<T: BatchRecord> {
    pub key: RotationKey,
    pub path: PathBuf,
    records: Vec<T>,
    codec: Arc<dyn BatchCodec>,
}

impl<T: BatchRecord> SealedBatch<T> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    /// Write to `<path>.tmp`, fsync, then rename to `<path>`.
    ///
    /// Blocking; the final path either does not exist or holds the whole batch.
    pub fn write(self) -> Result<FlushedFile> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| RecorderError::filesystem(parent, e))?;

        let tmp_path = tmp_path_for(&self.path);
        if let Err(e) = self.write_tmp(&tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(RecorderError::filesystem(&tmp_path, e));
        }
        // never replace a file left by an earlier run
        let path = vacant_path(&self.path);
        fs::rename(&tmp_path, &path).map_err(|e| RecorderError::filesystem(&path, e))?;

        info!(
            key = %self.key,
            path = %path.display(),
            records = self.records.len(),
            "Flushed batch"
        );

        Ok(FlushedFile {
            key: self.key,
            path,
            records: self.records.len(),
        })
    }

    /// Run `write` on the blocking pool.
    pub async fn write_blocking(self) -> Result<FlushedFile> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || self.write())
            .await
            .map_err(|e| RecorderError::filesystem(path, std::io::Error::other(e)))?
    }

    fn write_tmp(&self, tmp_path: &Path) -> Result<()> {
        let mut file = File::create(tmp_path)?;
        T::encode(self.codec.as_ref(), &self.records, &mut file)?;
        file.sync_all()?;
        Ok(())
    }
}

/// `path`, or `<stem>_<n>.<ext>` with the first `n` that does not exist yet.
fn vacant_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 1u32;
    loop {
        let name = match &extension {
            Some(ext) => format!("{}_{}.{}", stem, n, ext),
            None => format!("{}_{}", stem, n),
        };
        let candidate = path.with_file_name(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Open batch state
struct OpenBatch<T> {
    records: Vec<T>,
    date: NaiveDate,
    first_timestamp: DateTime<Utc>,
    started_at: DateTime<Utc>,
}

/// Batches records for one `(symbol, stream)` and decides rotation.
pub struct RotatingWriter<T: BatchRecord> {
    root: PathBuf,
    symbol: String,
    kind: StreamKind,
    codec: Arc<dyn BatchCodec>,
    max_records: usize,
    max_age: Duration,
    batch: Option<OpenBatch<T>>,
    batch_index: u64,
    last_file_name: Option<String>,
}

impl<T: BatchRecord> RotatingWriter<T> {
    pub fn new(
        root: &Path,
        symbol: &str,
        kind: StreamKind,
        codec: Arc<dyn BatchCodec>,
        max_records: usize,
        max_age: Duration,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            symbol: symbol.to_uppercase(),
            kind,
            codec,
            max_records: max_records.max(1),
            max_age,
            batch: None,
            batch_index: 0,
            last_file_name: None,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Records waiting in the open batch
    pub fn pending(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.records.len())
    }

    /// Add a record. Returns the batches completed by this push: the previous
    /// batch if the record starts a new UTC date, and the current one if it
    /// reached the record limit.
    pub fn push(&mut self, record: T, now: DateTime<Utc>) -> Vec<SealedBatch<T>> {
        let mut sealed = Vec::new();
        let timestamp = record.timestamp();
        let record_date = timestamp.date_naive();

        if self.batch.as_ref().is_some_and(|b| b.date != record_date) {
            debug!(symbol = %self.symbol, date = %record_date, "Date boundary, rotating");
            sealed.extend(self.seal());
        }

        let batch = self.batch.get_or_insert_with(|| OpenBatch {
            records: Vec::with_capacity(self.max_records.min(8192)),
            date: record_date,
            first_timestamp: timestamp,
            started_at: now,
        });
        batch.records.push(record);

        if batch.records.len() >= self.max_records {
            sealed.extend(self.seal());
        }
        sealed
    }

    /// Time-based rotation: seal the open batch if it is older than the age
    /// limit or if `now` is past the batch's UTC date.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<SealedBatch<T>> {
        let batch = self.batch.as_ref()?;
        let age = (now - batch.started_at).to_std().unwrap_or_default();
        if age >= self.max_age || now.date_naive() > batch.date {
            self.seal()
        } else {
            None
        }
    }

    /// Seal whatever is buffered, regardless of triggers.
    pub fn seal(&mut self) -> Option<SealedBatch<T>> {
        let batch = self.batch.take()?;
        if batch.records.is_empty() {
            return None;
        }

        let key = RotationKey {
            symbol: self.symbol.clone(),
            date: batch.date,
            batch_index: self.batch_index,
        };
        self.batch_index += 1;

        let path = self.path_for(&key, batch.first_timestamp);
        Some(SealedBatch {
            key,
            path,
            records: batch.records,
            codec: self.codec.clone(),
        })
    }

    fn path_for(&mut self, key: &RotationKey, first_timestamp: DateTime<Utc>) -> PathBuf {
        let mut file_name = format!(
            "{}-{}-{}",
            self.symbol.to_lowercase(),
            self.kind.file_stem(),
            first_timestamp.format("%Y%m%d_%H%M%S_%3f")
        );
        // two batches starting in the same millisecond
        if self.last_file_name.as_deref() == Some(file_name.as_str()) {
            file_name = format!("{}_{}", file_name, key.batch_index);
        } else {
            self.last_file_name = Some(file_name.clone());
        }

        self.root
            .join(&self.symbol)
            .join(key.date.format("%Y%m%d").to_string())
            .join(self.kind.dir_name())
            .join(format!("{}.{}", file_name, self.codec.extension()))
    }
}
