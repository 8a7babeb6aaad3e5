//! Capture pipeline
//!
//! One pipeline per symbol, made of four tasks:
//! 1. the depth stream, feeding a bounded channel
//! 2. the snapshot fetcher, serving resync, rotation and periodic requests
//! 3. the sequence validator loop (this task), sole owner of sync state
//! 4. the writer, which flushes one batch at a time
//!
//! `run_recorder` runs one pipeline per configured symbol and keeps them
//! isolated from each other's failures.

use crate::config::{CaptureDepth, RecorderConfig};
use crate::error::{RecorderError, Result};
use crate::rest::RestClient;
use crate::sequencer::{SequenceValidator, Step};
use crate::types::{Snapshot, ValidatedRecord};
use crate::websocket::{DepthStreamClient, StreamEvent};
use crate::writer::{BatchRecord, RotatingWriter, SealedBatch, StreamKind};
use chrono::Utc;
use futures_util::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WRITER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const FETCH_QUEUE: usize = 8;

/// Counters reported when a pipeline stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Diff records (or partial-depth frames) persisted
    pub records_written: u64,
    pub gap_markers: u64,
    pub snapshots_written: u64,
    pub discontinuities: u64,
    pub files_flushed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchReason {
    Resync,
    Rotation,
    Periodic,
}

impl fmt::Display for FetchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchReason::Resync => write!(f, "resync"),
            FetchReason::Rotation => write!(f, "rotation"),
            FetchReason::Periodic => write!(f, "periodic"),
        }
    }
}

enum SnapshotOutcome {
    Fetched { snapshot: Snapshot, reason: FetchReason },
    Failed { reason: FetchReason },
}

enum WriterCommand {
    Records(Vec<ValidatedRecord>),
    Snapshot(Snapshot),
}

/// Run every configured symbol until `cancel` fires or all pipelines stop.
///
/// A pipeline that fails is logged and left stopped; its siblings keep running.
pub async fn run_recorder(config: RecorderConfig, cancel: CancellationToken) -> Result<()> {
    config.validate()?;
    info!(
        symbols = ?config.symbols,
        format = ?config.output_format,
        depth = ?config.capture_depth,
        data_directory = %config.data_directory.display(),
        "Starting depth recorder"
    );

    let mut pipelines = JoinSet::new();
    for symbol in &config.symbols {
        let symbol = symbol.to_uppercase();
        let task = run_capture_task(config.clone(), symbol.clone(), cancel.child_token());
        pipelines.spawn(async move { (symbol, AssertUnwindSafe(task).catch_unwind().await) });
    }

    let mut failed = Vec::new();
    while let Some(joined) = pipelines.join_next().await {
        match joined {
            Ok((symbol, Ok(Ok(stats)))) => {
                info!(
                    symbol = %symbol,
                    records_written = stats.records_written,
                    gap_markers = stats.gap_markers,
                    snapshots_written = stats.snapshots_written,
                    discontinuities = stats.discontinuities,
                    files_flushed = stats.files_flushed,
                    "Pipeline finished"
                );
            }
            Ok((symbol, Ok(Err(e)))) => {
                error!(symbol = %symbol, error = %e, fatal = e.is_fatal(), "Pipeline terminated");
                failed.push(symbol);
            }
            Ok((symbol, Err(_))) => {
                error!(symbol = %symbol, "Pipeline panicked");
                failed.push(symbol);
            }
            Err(e) => {
                error!(error = %e, "Pipeline task aborted");
                failed.push("<unknown>".to_string());
            }
        }
    }

    if failed.is_empty() {
        info!("All pipelines stopped");
        Ok(())
    } else {
        failed.sort();
        Err(RecorderError::Pipelines(failed))
    }
}

/// Run the capture pipeline for one symbol until cancelled or a fatal error.
pub async fn run_capture_task(
    config: RecorderConfig,
    symbol: String,
    cancel: CancellationToken,
) -> Result<PipelineStats> {
    let symbol = symbol.to_uppercase();
    info!(symbol = %symbol, depth = ?config.capture_depth, "Starting capture pipeline");

    // stopping the pipeline must not touch siblings sharing the parent token
    let pipeline = cancel.child_token();
    let codec = config.output_format.codec();

    let (event_tx, mut event_rx) = mpsc::channel(config.channel_capacity);
    let (write_tx, write_rx) = mpsc::channel(config.channel_capacity);
    let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_QUEUE);
    let (outcome_tx, mut outcome_rx) = mpsc::channel(FETCH_QUEUE);
    let (progress_tx, progress_rx) = watch::channel(PipelineStats::default());

    let fetcher = match config.capture_depth {
        CaptureDepth::Full => Some(SnapshotFetcher {
            rest: RestClient::new(
                &config.rest_base_url,
                RestClient::default_retry(config.snapshot_retry_attempts),
            )?,
            symbol: symbol.clone(),
            depth_limit: config.depth_limit,
            period: config.snapshot_interval(),
            retry_delay: config.snapshot_retry_delay(),
        }),
        CaptureDepth::Levels(_) => None,
    };

    let (snapshot_kind, snapshot_batch) = match config.capture_depth {
        CaptureDepth::Full => (StreamKind::Snapshots, config.snapshots_per_file),
        CaptureDepth::Levels(n) => (StreamKind::PartialDepth(n), config.batch_max_records),
    };
    let writer = WriterTask {
        symbol: symbol.clone(),
        updates: RotatingWriter::new(
            &config.data_directory,
            &symbol,
            StreamKind::DepthUpdates,
            codec.clone(),
            config.batch_max_records,
            config.batch_max_age(),
        ),
        snapshots: RotatingWriter::new(
            &config.data_directory,
            &symbol,
            snapshot_kind,
            codec,
            snapshot_batch,
            config.batch_max_age(),
        ),
        rotation_tx: match config.capture_depth {
            CaptureDepth::Full => Some(fetch_tx.clone()),
            CaptureDepth::Levels(_) => None,
        },
        stats: PipelineStats::default(),
        progress: progress_tx,
    };
    let mut writer_handle = tokio::spawn(writer.run(write_rx));

    let stream = DepthStreamClient::new(
        &config.ws_base_url,
        &symbol,
        config.capture_depth,
        config.reconnect.clone(),
    );
    let mut stream_handle = tokio::spawn({
        let cancel = pipeline.clone();
        async move { stream.run(event_tx, cancel).await }
    });

    let fetch_handle = fetcher.map(|fetcher| tokio::spawn(fetcher.run(fetch_rx, outcome_tx, pipeline.clone())));

    let mut validator = SequenceValidator::new(&symbol, config.max_buffered_events);
    let mut stats_tick = interval_at(Instant::now() + config.stats_interval(), config.stats_interval());
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut writer_result: Option<Result<PipelineStats>> = None;
    let mut stream_finished = false;

    let outcome: Result<()> = loop {
        tokio::select! {
            _ = pipeline.cancelled() => {
                info!(symbol = %symbol, "Shutdown requested");
                break Ok(());
            }

            joined = &mut writer_handle, if writer_result.is_none() => {
                writer_result = Some(joined.map_err(RecorderError::from).and_then(|r| r));
                break Ok(());
            }

            event = event_rx.recv() => match event {
                Some(event) => {
                    if !handle_event(&symbol, event, &mut validator, &write_tx, &fetch_tx).await {
                        break Ok(());
                    }
                }
                None => {
                    stream_finished = true;
                    let result = (&mut stream_handle).await.map_err(RecorderError::from).and_then(|r| r);
                    if let Err(e) = &result {
                        error!(symbol = %symbol, error = %e, "Depth stream failed");
                    }
                    break result;
                }
            },

            Some(outcome) = outcome_rx.recv() => match outcome {
                SnapshotOutcome::Fetched { snapshot, reason } => {
                    debug!(symbol = %symbol, %reason, last_update_id = snapshot.last_update_id, "Snapshot received");
                    if write_tx.send(WriterCommand::Snapshot(snapshot.clone())).await.is_err() {
                        break Ok(());
                    }
                    let step = validator.on_snapshot(&snapshot);
                    if !forward_step(step, &write_tx, &fetch_tx).await {
                        break Ok(());
                    }
                }
                SnapshotOutcome::Failed { reason } => {
                    warn!(symbol = %symbol, %reason, state = %validator.state(), "Snapshot cycle failed, will retry");
                    validator.on_snapshot_failed();
                }
            },

            _ = stats_tick.tick() => {
                let s = validator.stats();
                info!(
                    symbol = %symbol,
                    state = %validator.state(),
                    usable = s.usable,
                    gaps = s.gaps,
                    discarded = s.discarded,
                    discontinuities = s.discontinuities,
                    buffered = validator.buffered(),
                    "Pipeline stats"
                );
            }
        }
    };

    // Shutdown: stop the stream and fetcher, push frames already received
    // through the validator, then give the writer a bounded window to flush.
    pipeline.cancel();
    if writer_result.is_none() && !stream_finished {
        let drained = drain_events(&symbol, &mut event_rx, &mut validator, &write_tx, &fetch_tx).await;
        if drained > 0 {
            debug!(symbol = %symbol, drained, "Queued frames handled before final flush");
        }
    }
    validator.finish();
    drop(write_tx);
    drop(fetch_tx);
    drop(event_rx);

    let writer_result = match writer_result {
        Some(result) => result,
        None => await_writer(&symbol, &mut writer_handle, config.shutdown_timeout(), &progress_rx).await,
    };

    if !stream_finished {
        if let Ok(Err(e)) = stream_handle.await {
            debug!(symbol = %symbol, error = %e, "Depth stream ended with error during shutdown");
        }
    }
    if let Some(handle) = fetch_handle {
        let _ = handle.await;
    }

    outcome?;
    let mut stats = writer_result?;
    stats.discontinuities = validator.stats().discontinuities;

    info!(
        symbol = %symbol,
        records_written = stats.records_written,
        gap_markers = stats.gap_markers,
        snapshots_written = stats.snapshots_written,
        files_flushed = stats.files_flushed,
        "Capture pipeline stopped"
    );
    Ok(stats)
}

/// Route one stream event. Returns false once the writer is gone.
async fn handle_event(
    symbol: &str,
    event: StreamEvent,
    validator: &mut SequenceValidator,
    write_tx: &mpsc::Sender<WriterCommand>,
    fetch_tx: &mpsc::Sender<FetchReason>,
) -> bool {
    match event {
        StreamEvent::Diff(diff) => {
            let step = validator.on_diff(diff);
            forward_step(step, write_tx, fetch_tx).await
        }
        StreamEvent::PartialDepth(frame) => write_tx.send(WriterCommand::Snapshot(frame)).await.is_ok(),
        StreamEvent::Discontinuity { reason } => {
            debug!(symbol = %symbol, %reason, "Discontinuity received");
            validator.on_discontinuity();
            true
        }
    }
}

/// Close the event channel and handle whatever is still queued in it.
/// Returns the number of events handled.
async fn drain_events(
    symbol: &str,
    events: &mut mpsc::Receiver<StreamEvent>,
    validator: &mut SequenceValidator,
    write_tx: &mpsc::Sender<WriterCommand>,
    fetch_tx: &mpsc::Sender<FetchReason>,
) -> usize {
    events.close();
    let mut handled = 0;
    while let Ok(event) = events.try_recv() {
        if !handle_event(symbol, event, validator, write_tx, fetch_tx).await {
            warn!(symbol = %symbol, "Writer gone while draining queued frames");
            break;
        }
        handled += 1;
    }
    handled
}

/// Wait up to `limit` for the writer's final flush. On timeout the writer is
/// aborted and the counters it last published are returned.
async fn await_writer(
    symbol: &str,
    handle: &mut JoinHandle<Result<PipelineStats>>,
    limit: Duration,
    progress: &watch::Receiver<PipelineStats>,
) -> Result<PipelineStats> {
    match tokio::time::timeout(limit, &mut *handle).await {
        Ok(joined) => joined.map_err(RecorderError::from).and_then(|r| r),
        Err(_) => {
            handle.abort();
            let stats = *progress.borrow();
            let err = RecorderError::ShutdownTimeout(limit);
            warn!(
                symbol = %symbol,
                error = %err,
                records_written = stats.records_written,
                files_flushed = stats.files_flushed,
                "Unflushed records discarded"
            );
            Ok(stats)
        }
    }
}

/// Hand validator output on. Returns false once the writer is gone.
async fn forward_step(
    step: Step,
    write_tx: &mpsc::Sender<WriterCommand>,
    fetch_tx: &mpsc::Sender<FetchReason>,
) -> bool {
    if step.request_snapshot {
        // a full queue already holds a pending fetch
        let _ = fetch_tx.try_send(FetchReason::Resync);
    }
    if step.records.is_empty() {
        return true;
    }
    write_tx.send(WriterCommand::Records(step.records)).await.is_ok()
}

struct SnapshotFetcher {
    rest: RestClient,
    symbol: String,
    depth_limit: u32,
    period: Duration,
    retry_delay: Duration,
}

impl SnapshotFetcher {
    /// One fetch at a time. Requests that queue up while idle are served by a
    /// single fetch. A failed cycle is reported after `retry_delay`.
    async fn run(
        self,
        mut requests: mpsc::Receiver<FetchReason>,
        outcomes: mpsc::Sender<SnapshotOutcome>,
        cancel: CancellationToken,
    ) {
        let mut schedule = interval_at(Instant::now() + self.period, self.period);
        schedule.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reason = tokio::select! {
                _ = cancel.cancelled() => return,
                Some(reason) = requests.recv() => reason,
                _ = schedule.tick() => FetchReason::Periodic,
            };
            while requests.try_recv().is_ok() {}

            debug!(symbol = %self.symbol, %reason, "Fetching snapshot");
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return,
                fetched = self.rest.get_depth_snapshot(&self.symbol, self.depth_limit) => fetched,
            };

            let outcome = match fetched {
                Ok(snapshot) => SnapshotOutcome::Fetched { snapshot, reason },
                Err(e) => {
                    error!(symbol = %self.symbol, %reason, error = %e, "Snapshot fetch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                    SnapshotOutcome::Failed { reason }
                }
            };

            if outcomes.send(outcome).await.is_err() {
                return;
            }
        }
    }
}

/// Owns both rotating writers of a pipeline. Commands are handled one at a
/// time, so at most one flush per symbol is in flight.
struct WriterTask {
    symbol: String,
    updates: RotatingWriter<ValidatedRecord>,
    snapshots: RotatingWriter<Snapshot>,
    rotation_tx: Option<mpsc::Sender<FetchReason>>,
    stats: PipelineStats,
    /// Counters as of the last completed flush
    progress: watch::Sender<PipelineStats>,
}

impl WriterTask {
    async fn run(mut self, mut commands: mpsc::Receiver<WriterCommand>) -> Result<PipelineStats> {
        let mut tick = interval(WRITER_POLL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(WriterCommand::Records(records)) => {
                        for record in records {
                            for sealed in self.updates.push(record, Utc::now()) {
                                self.flush_updates(sealed, true).await?;
                            }
                        }
                    }
                    Some(WriterCommand::Snapshot(snapshot)) => {
                        for sealed in self.snapshots.push(snapshot, Utc::now()) {
                            self.flush_snapshots(sealed).await?;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    let now = Utc::now();
                    if let Some(sealed) = self.updates.poll(now) {
                        self.flush_updates(sealed, true).await?;
                    }
                    if let Some(sealed) = self.snapshots.poll(now) {
                        self.flush_snapshots(sealed).await?;
                    }
                }
            }
        }

        let pending = self.updates.pending() + self.snapshots.pending();
        if pending > 0 {
            info!(symbol = %self.symbol, pending, "Final flush");
        }
        if let Some(sealed) = self.updates.seal() {
            self.flush_updates(sealed, false).await?;
        }
        if let Some(sealed) = self.snapshots.seal() {
            self.flush_snapshots(sealed).await?;
        }
        Ok(self.stats)
    }

    async fn flush_updates(&mut self, sealed: SealedBatch<ValidatedRecord>, pair_snapshot: bool) -> Result<()> {
        let gaps = sealed.records().iter().filter(|r| r.gap_detected).count() as u64;
        let flushed = self.write(sealed).await?;
        self.stats.records_written += flushed as u64;
        self.stats.gap_markers += gaps;
        self.progress.send_replace(self.stats);

        // every diff file gets a snapshot taken right after it
        if pair_snapshot {
            if let Some(tx) = &self.rotation_tx {
                let _ = tx.try_send(FetchReason::Rotation);
            }
        }
        Ok(())
    }

    async fn flush_snapshots(&mut self, sealed: SealedBatch<Snapshot>) -> Result<()> {
        let flushed = self.write(sealed).await? as u64;
        match self.snapshots.kind() {
            StreamKind::PartialDepth(_) => self.stats.records_written += flushed,
            _ => self.stats.snapshots_written += flushed,
        }
        self.progress.send_replace(self.stats);
        Ok(())
    }

    async fn write<T: BatchRecord>(&mut self, sealed: SealedBatch<T>) -> Result<usize> {
        match sealed.write_blocking().await {
            Ok(flushed) => {
                self.stats.files_flushed += 1;
                Ok(flushed.records)
            }
            Err(e) => {
                error!(symbol = %self.symbol, error = %e, "Flush failed, stopping pipeline");
                Err(e)
            }
        }
    }
}
