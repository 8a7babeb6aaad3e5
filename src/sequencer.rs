//! Update-id sequence validation
//!
//! Stitches the diff stream onto REST snapshots and classifies every diff as
//! usable or as a gap marker. Nothing downstream re-checks continuity, so this
//! is the only place that decides whether a record may be replayed.
//!
//! Rules (`U` = first update id, `u` = final update id of a diff):
//! - A snapshot reconciles at the first buffered diff with `U <= lastUpdateId + 1 <= u`.
//!   Earlier diffs are already reflected in the snapshot and are dropped.
//! - After that, every diff must satisfy `U == previous u + 1`.
//! - Anything else is a gap: a marker is emitted, unsynced state is dropped
//!   and a fresh snapshot is requested.

use crate::error::RecorderError;
use crate::types::{DiffEvent, Snapshot, ValidatedRecord};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Validator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Buffering diffs, no snapshot yet
    AwaitingSnapshot,
    /// Holding a snapshot newer than everything buffered, waiting for the diff that covers it
    Reconciling,
    /// Emitting contiguous diffs
    Synced,
    /// Gap seen while synced, buffering until the requested snapshot arrives
    Resyncing,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingSnapshot => write!(f, "AWAITING_SNAPSHOT"),
            Self::Reconciling => write!(f, "RECONCILING"),
            Self::Synced => write!(f, "SYNCED"),
            Self::Resyncing => write!(f, "RESYNCING"),
        }
    }
}

/// Result of feeding one input to the validator
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Step {
    pub records: Vec<ValidatedRecord>,
    /// A snapshot should be fetched and fed back through `on_snapshot`
    pub request_snapshot: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorStats {
    pub usable: u64,
    pub gaps: u64,
    pub discarded: u64,
    pub snapshots_used: u64,
    pub discontinuities: u64,
}

pub struct SequenceValidator {
    symbol: String,
    state: SyncState,
    buffer: VecDeque<DiffEvent>,
    max_buffered: usize,
    /// `lastUpdateId` of the snapshot held while reconciling
    pending_snapshot: Option<u64>,
    /// `lastUpdateId` of the snapshot the current synced stretch is anchored on
    anchor: Option<u64>,
    last_emitted_u: Option<u64>,
    snapshot_outstanding: bool,
    stats: ValidatorStats,
}

impl SequenceValidator {
    pub fn new(symbol: &str, max_buffered: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            state: SyncState::AwaitingSnapshot,
            buffer: VecDeque::new(),
            max_buffered: max_buffered.max(1),
            pending_snapshot: None,
            anchor: None,
            last_emitted_u: None,
            snapshot_outstanding: false,
            stats: ValidatorStats::default(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn stats(&self) -> ValidatorStats {
        self.stats
    }

    pub fn last_emitted_u(&self) -> Option<u64> {
        self.last_emitted_u
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn snapshot_outstanding(&self) -> bool {
        self.snapshot_outstanding
    }

    pub fn on_diff(&mut self, event: DiffEvent) -> Step {
        let mut step = Step::default();

        match self.state {
            SyncState::AwaitingSnapshot | SyncState::Resyncing => {
                self.buffer_event(event);
                self.request_snapshot(&mut step);
            }
            SyncState::Reconciling => {
                let last_update_id = self.pending_snapshot.unwrap_or_default();
                let target = last_update_id + 1;
                if event.final_update_id < target {
                    debug!(
                        symbol = %self.symbol,
                        first_update_id = event.first_update_id,
                        final_update_id = event.final_update_id,
                        last_update_id,
                        "Dropping diff already reflected in snapshot"
                    );
                    self.stats.discarded += 1;
                } else if event.covers(target) {
                    self.pending_snapshot = None;
                    self.start_synced(event, last_update_id, &mut step);
                } else {
                    warn!(
                        symbol = %self.symbol,
                        first_update_id = event.first_update_id,
                        last_update_id,
                        "Diff stream moved past snapshot before reconciliation"
                    );
                    self.pending_snapshot = None;
                    self.emit_gap(event, SyncState::AwaitingSnapshot, &mut step);
                }
            }
            SyncState::Synced => self.synced_diff(event, &mut step),
        }

        step
    }

    pub fn on_snapshot(&mut self, snapshot: &Snapshot) -> Step {
        let mut step = Step::default();
        self.snapshot_outstanding = false;

        if self.state == SyncState::Synced {
            debug!(
                symbol = %self.symbol,
                last_update_id = snapshot.last_update_id,
                "Already synced, snapshot not needed for reconciliation"
            );
            return step;
        }

        let last_update_id = snapshot.last_update_id;
        let target = last_update_id + 1;
        self.transition(SyncState::Reconciling);

        if let Some(pos) = self.buffer.iter().position(|e| e.covers(target)) {
            self.stats.discarded += pos as u64;
            self.buffer.drain(..pos);
            let mut pending = std::mem::take(&mut self.buffer);
            if let Some(first) = pending.pop_front() {
                info!(
                    symbol = %self.symbol,
                    last_update_id,
                    first_update_id = first.first_update_id,
                    final_update_id = first.final_update_id,
                    dropped = pos,
                    "Reconciled snapshot with buffered diffs"
                );
                self.start_synced(first, last_update_id, &mut step);
            }
            for event in pending {
                if self.state != SyncState::Synced {
                    // a gap inside the buffer: the remainder is unverifiable
                    self.stats.discarded += 1;
                    continue;
                }
                self.synced_diff(event, &mut step);
            }
            return step;
        }

        if let Some(pos) = self.buffer.iter().position(|e| e.first_update_id > target) {
            // diffs past the snapshot exist but none covers it
            self.stats.discarded += (self.buffer.len() - 1) as u64;
            let mut buffer = std::mem::take(&mut self.buffer);
            if let Some(first_after) = buffer.remove(pos) {
                warn!(
                    symbol = %self.symbol,
                    last_update_id,
                    first_update_id = first_after.first_update_id,
                    "Snapshot too old for buffered diffs"
                );
                self.emit_gap(first_after, SyncState::AwaitingSnapshot, &mut step);
            }
            return step;
        }

        // snapshot is ahead of every buffered diff: drop them and wait for the covering one
        self.stats.discarded += self.buffer.len() as u64;
        self.buffer.clear();
        self.pending_snapshot = Some(last_update_id);
        debug!(symbol = %self.symbol, last_update_id, "Snapshot ahead of buffered diffs, waiting");
        step
    }

    /// The consumer lost its connection. Everything not yet emitted is dropped.
    pub fn on_discontinuity(&mut self) {
        self.stats.discontinuities += 1;
        self.stats.discarded += self.buffer.len() as u64;
        warn!(
            symbol = %self.symbol,
            state = %self.state,
            buffered = self.buffer.len(),
            last_emitted_u = ?self.last_emitted_u,
            "Stream discontinuity, resetting sequence state"
        );
        self.buffer.clear();
        self.pending_snapshot = None;
        self.anchor = None;
        self.last_emitted_u = None;
        self.transition(SyncState::AwaitingSnapshot);
    }

    /// A requested snapshot could not be fetched; the next diff asks again.
    pub fn on_snapshot_failed(&mut self) {
        self.snapshot_outstanding = false;
    }

    /// Final pass on shutdown: drop anything that never reconciled.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            warn!(symbol = %self.symbol, state = %self.state, dropped, "Discarding unreconciled diffs at shutdown");
        }
        self.stats.discarded += dropped as u64;
        self.buffer.clear();
        dropped
    }

    fn synced_diff(&mut self, event: DiffEvent, step: &mut Step) {
        let expected = self.last_emitted_u.unwrap_or_default() + 1;
        if event.first_update_id == expected {
            self.last_emitted_u = Some(event.final_update_id);
            self.stats.usable += 1;
            step.records
                .push(ValidatedRecord::usable(event, self.anchor.unwrap_or_default()));
        } else {
            let gap = RecorderError::SequenceGap {
                symbol: self.symbol.clone(),
                expected,
                got: event.first_update_id,
            };
            warn!(
                symbol = %self.symbol,
                first_update_id = event.first_update_id,
                final_update_id = event.final_update_id,
                error = %gap,
                "Sequence gap"
            );
            self.emit_gap(event, SyncState::Resyncing, step);
        }
    }

    fn start_synced(&mut self, event: DiffEvent, last_update_id: u64, step: &mut Step) {
        self.anchor = Some(last_update_id);
        self.last_emitted_u = Some(event.final_update_id);
        self.stats.usable += 1;
        self.stats.snapshots_used += 1;
        step.records.push(ValidatedRecord::usable(event, last_update_id));
        self.transition(SyncState::Synced);
    }

    fn emit_gap(&mut self, event: DiffEvent, next: SyncState, step: &mut Step) {
        self.stats.gaps += 1;
        step.records.push(ValidatedRecord::gap(event));
        self.buffer.clear();
        self.anchor = None;
        self.last_emitted_u = None;
        self.transition(next);
        self.request_snapshot(step);
    }

    fn buffer_event(&mut self, event: DiffEvent) {
        if self.buffer.len() >= self.max_buffered {
            if self.buffer.pop_front().is_some() {
                self.stats.discarded += 1;
            }
            if self.stats.discarded % 1000 == 1 {
                warn!(symbol = %self.symbol, max = self.max_buffered, "Diff buffer full while awaiting snapshot, dropping oldest");
            }
        }
        self.buffer.push_back(event);
    }

    fn request_snapshot(&mut self, step: &mut Step) {
        if !self.snapshot_outstanding {
            self.snapshot_outstanding = true;
            step.request_snapshot = true;
        }
    }

    fn transition(&mut self, to: SyncState) {
        if self.state != to {
            info!(symbol = %self.symbol, from = %self.state, to = %to, "Sequence state transition");
            self.state = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceLevel;
    use chrono::Utc;

    fn diff(first: u64, last: u64) -> DiffEvent {
        DiffEvent {
            event_type: "depthUpdate".to_string(),
            event_time: 1_700_000_000_000 + last as i64,
            symbol: "BTCUSDT".to_string(),
            first_update_id: first,
            final_update_id: last,
            bids: vec![PriceLevel::new("100.0", "1.0")],
            asks: vec![],
        }
    }

    fn snapshot(last_update_id: u64) -> Snapshot {
        Snapshot {
            symbol: "BTCUSDT".to_string(),
            last_update_id,
            bids: vec![],
            asks: vec![],
            captured_at: Utc::now(),
        }
    }

    fn ids(step: &Step) -> Vec<(u64, u64, bool, bool)> {
        step.records
            .iter()
            .map(|r| (r.event.first_update_id, r.event.final_update_id, r.usable, r.gap_detected))
            .collect()
    }

    /// Every usable stretch must be contiguous and start on its snapshot.
    fn assert_contiguous(records: &[ValidatedRecord]) {
        let mut prev: Option<&ValidatedRecord> = None;
        for record in records {
            if !record.usable {
                prev = None;
                continue;
            }
            match prev {
                Some(p) if p.snapshot_update_id == record.snapshot_update_id => {
                    assert_eq!(record.event.first_update_id, p.event.final_update_id + 1);
                }
                _ => {
                    let anchor = record.snapshot_update_id.unwrap();
                    assert!(record.event.covers(anchor + 1));
                }
            }
            prev = Some(record);
        }
    }

    #[test]
    fn test_buffers_until_snapshot() {
        let mut v = SequenceValidator::new("BTCUSDT", 100);
        let step = v.on_diff(diff(100, 105));
        assert!(step.records.is_empty());
        assert!(step.request_snapshot);
        let step = v.on_diff(diff(106, 110));
        assert!(step.records.is_empty());
        assert!(!step.request_snapshot, "only one outstanding request");
        assert_eq!(v.state(), SyncState::AwaitingSnapshot);
        assert_eq!(v.buffered(), 2);
    }

    #[test]
    fn test_scenario_a_reconciles_on_first_covering_event() {
        let mut v = SequenceValidator::new("BTCUSDT", 100);
        v.on_diff(diff(100, 105));
        v.on_diff(diff(106, 110));

        let step = v.on_snapshot(&snapshot(104));
        assert_eq!(ids(&step), vec![(100, 105, true, false), (106, 110, true, false)]);
        assert!(step.records.iter().all(|r| r.snapshot_update_id == Some(104)));
        assert!(!step.request_snapshot);
        assert_eq!(v.state(), SyncState::Synced);
        assert_eq!(v.last_emitted_u(), Some(110));
        assert_eq!(v.stats().discarded, 0);
        assert_contiguous(&step.records);
    }

    #[test]
    fn test_reconcile_drops_events_before_snapshot() {
        let mut v = SequenceValidator::new("BTCUSDT", 100);
        v.on_diff(diff(90, 95));
        v.on_diff(diff(96, 99));
        v.on_diff(diff(100, 103));
        v.on_diff(diff(104, 108));

        let step = v.on_snapshot(&snapshot(101));
        assert_eq!(ids(&step), vec![(100, 103, true, false), (104, 108, true, false)]);
        assert_eq!(v.stats().discarded, 2);
    }

    #[test]
    fn test_scenario_b_snapshot_too_old() {
        let mut v = SequenceValidator::new("BTCUSDT", 100);
        v.on_diff(diff(105, 110));
        v.on_diff(diff(111, 115));

        let step = v.on_snapshot(&snapshot(99));
        assert_eq!(ids(&step), vec![(105, 110, false, true)]);
        assert!(step.request_snapshot);
        assert_eq!(v.state(), SyncState::AwaitingSnapshot);
        assert_eq!(v.buffered(), 0);

        // the re-request is not repeated while it is outstanding
        let step = v.on_diff(diff(116, 120));
        assert!(!step.request_snapshot);
        assert!(step.records.is_empty());

        let step = v.on_snapshot(&snapshot(117));
        assert_eq!(ids(&step), vec![(116, 120, true, false)]);
        assert_eq!(v.state(), SyncState::Synced);
    }

    #[test]
    fn test_scenario_c_gap_while_synced() {
        let mut v = SequenceValidator::new("BTCUSDT", 100);
        v.on_diff(diff(200, 205));
        v.on_snapshot(&snapshot(199));
        assert_eq!(v.state(), SyncState::Synced);
        assert_eq!(v.last_emitted_u(), Some(205));

        let step = v.on_diff(diff(210, 215));
        assert_eq!(ids(&step), vec![(210, 215, false, true)]);
        assert!(step.request_snapshot);
        assert_eq!(v.state(), SyncState::Resyncing);
        assert_eq!(v.stats().gaps, 1);

        // buffered while resyncing, nothing emitted
        let step = v.on_diff(diff(216, 220));
        assert!(step.records.is_empty());
        assert!(!step.request_snapshot);

        let step = v.on_snapshot(&snapshot(217));
        assert_eq!(ids(&step), vec![(216, 220, true, false)]);
        assert_eq!(v.state(), SyncState::Synced);
    }

    #[test]
    fn test_discontinuity_resets_to_awaiting_snapshot() {
        let mut v = SequenceValidator::new("BTCUSDT", 100);
        v.on_diff(diff(100, 105));
        v.on_snapshot(&snapshot(102));
        assert_eq!(v.state(), SyncState::Synced);

        v.on_discontinuity();
        assert_eq!(v.state(), SyncState::AwaitingSnapshot);
        assert_eq!(v.last_emitted_u(), None);

        // a diff that would have been contiguous is only buffered now
        let step = v.on_diff(diff(106, 110));
        assert!(step.records.is_empty());
        assert_eq!(v.buffered(), 1);

        v.on_discontinuity();
        assert_eq!(v.buffered(), 0);
        assert_eq!(v.stats().discontinuities, 2);
    }

    #[test]
    fn test_snapshot_ahead_of_buffer_waits_for_covering_diff() {
        let mut v = SequenceValidator::new("BTCUSDT", 100);
        v.on_diff(diff(100, 105));

        let step = v.on_snapshot(&snapshot(107));
        assert!(step.records.is_empty());
        assert_eq!(v.state(), SyncState::Reconciling);

        let step = v.on_diff(diff(106, 107));
        assert!(step.records.is_empty(), "u=107 is inside the snapshot");

        let step = v.on_diff(diff(108, 112));
        assert_eq!(ids(&step), vec![(108, 112, true, false)]);
        assert_eq!(v.state(), SyncState::Synced);
    }

    #[test]
    fn test_reconciling_gap_requests_new_snapshot() {
        let mut v = SequenceValidator::new("BTCUSDT", 100);
        v.on_diff(diff(100, 105));
        v.on_snapshot(&snapshot(107));

        let step = v.on_diff(diff(120, 125));
        assert_eq!(ids(&step), vec![(120, 125, false, true)]);
        assert!(step.request_snapshot);
        assert_eq!(v.state(), SyncState::AwaitingSnapshot);
    }

    #[test]
    fn test_gap_inside_buffer_after_reconciliation() {
        let mut v = SequenceValidator::new("BTCUSDT", 100);
        v.on_diff(diff(100, 105));
        v.on_diff(diff(106, 110));
        v.on_diff(diff(115, 120));
        v.on_diff(diff(121, 125));

        let step = v.on_snapshot(&snapshot(104));
        assert_eq!(
            ids(&step),
            vec![(100, 105, true, false), (106, 110, true, false), (115, 120, false, true)]
        );
        assert!(step.request_snapshot);
        assert_eq!(v.state(), SyncState::Resyncing);
        assert_eq!(v.buffered(), 0);
    }

    #[test]
    fn test_snapshot_failure_allows_new_request() {
        let mut v = SequenceValidator::new("BTCUSDT", 100);
        assert!(v.on_diff(diff(1, 2)).request_snapshot);
        assert!(!v.on_diff(diff(3, 4)).request_snapshot);
        v.on_snapshot_failed();
        assert!(v.on_diff(diff(5, 6)).request_snapshot);
    }

    #[test]
    fn test_buffer_cap_drops_oldest() {
        let mut v = SequenceValidator::new("BTCUSDT", 2);
        v.on_diff(diff(1, 2));
        v.on_diff(diff(3, 4));
        v.on_diff(diff(5, 6));
        assert_eq!(v.buffered(), 2);
        assert_eq!(v.stats().discarded, 1);

        let step = v.on_snapshot(&snapshot(4));
        assert_eq!(ids(&step), vec![(5, 6, true, false)]);
    }

    #[test]
    fn test_snapshot_while_synced_is_ignored() {
        let mut v = SequenceValidator::new("BTCUSDT", 100);
        v.on_diff(diff(100, 105));
        v.on_snapshot(&snapshot(102));
        let step = v.on_snapshot(&snapshot(300));
        assert!(step.records.is_empty());
        assert_eq!(v.state(), SyncState::Synced);
        assert_eq!(v.stats().snapshots_used, 1);
    }

    #[test]
    fn test_accepted_records_are_contiguous_over_long_stream() {
        let mut v = SequenceValidator::new("BTCUSDT", 1000);
        let mut all = Vec::new();
        let mut next = 1000u64;
        let mut snapshot_due = false;
        for i in 0..200u64 {
            // a hole every 50 events
            if i % 50 == 49 {
                next += 7;
            }
            let event = diff(next, next + 2);
            let inside = next;
            next += 3;

            let step = v.on_diff(event);
            let requested = step.request_snapshot;
            all.extend(step.records);

            // requested snapshots arrive one event later, landing inside that event
            if snapshot_due {
                let step = v.on_snapshot(&snapshot(inside));
                snapshot_due = step.request_snapshot;
                all.extend(step.records);
            }
            snapshot_due |= requested;
        }
        assert_eq!(all.iter().filter(|r| r.usable).count(), 195);
        assert_eq!(v.stats().gaps, 4);
        assert_contiguous(&all);
    }
}
