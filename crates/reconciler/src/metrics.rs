//! In-process metrics registry.
//!
//! Implements the [`MetricsSink`] port with lock-free counters and exposes
//! a serializable snapshot for the CLI and any exposition layer. The
//! format-agnostic boundary lives here: Prometheus/StatsD adapters consume
//! [`MetricsSnapshot`], this crate never formats.

use palisade_core::{AttemptOutcome, DriftClass, MetricsSink};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Atomic counter/gauge registry for one reconciler instance.
#[derive(Debug, Default)]
pub struct InProcessMetrics {
    drift_ok: AtomicU64,
    drift_unmanaged: AtomicU64,
    drift_missing: AtomicU64,
    drift_mismatched: AtomicU64,
    drift_orphaned: AtomicU64,

    attempts_success: AtomicU64,
    attempts_duplicate: AtomicU64,
    attempts_rejected: AtomicU64,
    attempts_timed_out: AtomicU64,

    cycles_completed: AtomicU64,
    cycles_aborted: AtomicU64,
    ticks_skipped: AtomicU64,

    symbols_in_drift: AtomicU64,
    degraded: AtomicBool,
}

impl InProcessMetrics {
    /// Creates a zeroed registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the current values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            drift_ok: self.drift_ok.load(Ordering::Relaxed),
            drift_unmanaged: self.drift_unmanaged.load(Ordering::Relaxed),
            drift_missing: self.drift_missing.load(Ordering::Relaxed),
            drift_mismatched: self.drift_mismatched.load(Ordering::Relaxed),
            drift_orphaned: self.drift_orphaned.load(Ordering::Relaxed),
            attempts_success: self.attempts_success.load(Ordering::Relaxed),
            attempts_duplicate: self.attempts_duplicate.load(Ordering::Relaxed),
            attempts_rejected: self.attempts_rejected.load(Ordering::Relaxed),
            attempts_timed_out: self.attempts_timed_out.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_aborted: self.cycles_aborted.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            symbols_in_drift: self.symbols_in_drift.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for InProcessMetrics {
    fn drift_detected(&self, class: DriftClass) {
        let counter = match class {
            DriftClass::Ok => &self.drift_ok,
            DriftClass::Unmanaged => &self.drift_unmanaged,
            DriftClass::Missing => &self.drift_missing,
            DriftClass::Mismatched => &self.drift_mismatched,
            DriftClass::Orphaned => &self.drift_orphaned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn attempt_recorded(&self, outcome: &AttemptOutcome) {
        let counter = match outcome {
            AttemptOutcome::Success => &self.attempts_success,
            AttemptOutcome::Duplicate => &self.attempts_duplicate,
            AttemptOutcome::Rejected { .. } => &self.attempts_rejected,
            AttemptOutcome::TimedOut => &self.attempts_timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn cycle_completed(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn cycle_aborted(&self) {
        self.cycles_aborted.fetch_add(1, Ordering::Relaxed);
    }

    fn tick_skipped(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn set_symbols_in_drift(&self, count: u64) {
        self.symbols_in_drift.store(count, Ordering::Relaxed);
    }

    fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }
}

/// Point-in-time metric values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Positions classified ok, cumulative.
    pub drift_ok: u64,
    /// Positions skipped as unmanaged, cumulative.
    pub drift_unmanaged: u64,
    /// Missing-protection detections, cumulative.
    pub drift_missing: u64,
    /// Mismatched-protection detections, cumulative.
    pub drift_mismatched: u64,
    /// Orphaned-order detections, cumulative.
    pub drift_orphaned: u64,
    /// Repair attempts accepted by the exchange.
    pub attempts_success: u64,
    /// Repair attempts deduplicated by client oid.
    pub attempts_duplicate: u64,
    /// Repair attempts rejected outright.
    pub attempts_rejected: u64,
    /// Repair attempts with unknown terminal state.
    pub attempts_timed_out: u64,
    /// Cycles that ran to completion.
    pub cycles_completed: u64,
    /// Cycles aborted at the deadline.
    pub cycles_aborted: u64,
    /// Scheduler ticks skipped because a cycle was still running.
    pub ticks_skipped: u64,
    /// Symbols in a non-ok state after the last cycle (gauge).
    pub symbols_in_drift: u64,
    /// Whether the loop is in degraded (detection-only) mode.
    pub degraded: bool,
}
