//! Consecutive-drift alerting.
//!
//! A position that stays in a non-ok state for one cycle is routine (the
//! next pass usually fixes it); one that stays drifted across several
//! cycles means repairs are failing and an operator must look. The alerter
//! tracks per-symbol streaks, fires once per episode when the configured
//! threshold is crossed, and emits a recovery notice when the symbol
//! converges again.

use chrono::{DateTime, Utc};
use palisade_core::{
    DriftClass, DriftNotice, DriftRecord, NoticeSeverity, NotificationSink, TargetKind,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
struct Streak {
    consecutive: u32,
    alerted: bool,
}

/// Tracks drift streaks and escalates past the threshold.
pub struct DriftAlerter {
    notifier: Arc<dyn NotificationSink>,
    threshold: u32,
    streaks: Mutex<HashMap<String, Streak>>,
}

impl DriftAlerter {
    /// Creates an alerter that escalates after `threshold` consecutive
    /// non-ok cycles for a symbol.
    #[must_use]
    pub fn new(notifier: Arc<dyn NotificationSink>, threshold: u32) -> Self {
        Self {
            notifier,
            threshold: threshold.max(1),
            streaks: Mutex::new(HashMap::new()),
        }
    }

    /// Feeds one cycle's drift records through the streak tracker.
    ///
    /// Unmanaged records do not participate: a position the system never
    /// protected cannot "stay broken".
    pub async fn observe_cycle(&self, records: &[DriftRecord]) {
        let mut to_notify: Vec<DriftNotice> = Vec::new();

        {
            let mut streaks = self.streaks.lock();
            let mut seen: HashMap<&str, &DriftRecord> = HashMap::new();
            for record in records {
                seen.insert(record.symbol.as_str(), record);
            }

            // Symbols that recovered or disappeared this cycle.
            let tracked: Vec<String> = streaks.keys().cloned().collect();
            for symbol in tracked {
                let still_drifted = seen
                    .get(symbol.as_str())
                    .is_some_and(|r| r.classification.needs_remediation());
                if !still_drifted {
                    if let Some(streak) = streaks.remove(&symbol) {
                        if streak.alerted {
                            to_notify.push(DriftNotice {
                                severity: NoticeSeverity::Info,
                                symbol: symbol.clone(),
                                classification: DriftClass::Ok,
                                detail: format!(
                                    "protection converged after {} drifted cycles",
                                    streak.consecutive
                                ),
                            });
                        }
                    }
                }
            }

            // Symbols drifted this cycle.
            for record in records {
                if !record.classification.needs_remediation() {
                    continue;
                }
                let streak = streaks.entry(record.symbol.clone()).or_default();
                streak.consecutive += 1;

                if streak.consecutive >= self.threshold && !streak.alerted {
                    streak.alerted = true;
                    to_notify.push(DriftNotice {
                        severity: severity_for(record.classification),
                        symbol: record.symbol.clone(),
                        classification: record.classification,
                        detail: describe(record, streak.consecutive),
                    });
                }
            }
        }

        for notice in to_notify {
            if let Err(e) = self.notifier.notify(notice).await {
                warn!(error = %e, "notification sink failed");
            }
        }
    }

    /// Current streak length for a symbol (0 when converged).
    #[must_use]
    pub fn streak(&self, symbol: &str) -> u32 {
        self.streaks
            .lock()
            .get(symbol)
            .map_or(0, |s| s.consecutive)
    }
}

fn severity_for(class: DriftClass) -> NoticeSeverity {
    match class {
        // A position with no stop-loss is unprotected capital.
        DriftClass::Missing => NoticeSeverity::Critical,
        DriftClass::Mismatched | DriftClass::Orphaned => NoticeSeverity::Warning,
        DriftClass::Ok | DriftClass::Unmanaged => NoticeSeverity::Info,
    }
}

fn describe(record: &DriftRecord, cycles: u32) -> String {
    let kinds: Vec<String> = record.missing.iter().map(TargetKind::to_string).collect();
    if kinds.is_empty() {
        format!(
            "{} drift unresolved for {cycles} cycles ({} issues)",
            record.classification,
            record.issue_count()
        )
    } else {
        format!(
            "missing {} for {cycles} consecutive cycles",
            kinds.join(", ")
        )
    }
}

// =============================================================================
// Tracing-backed notifier
// =============================================================================

/// Default notification sink: structured log lines.
///
/// Real deployments plug a Telegram/webhook transport into the
/// [`NotificationSink`] port; the reconciler itself stays transport-blind.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl TracingNotifier {
    /// Creates the notifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(&self, notice: DriftNotice) -> anyhow::Result<()> {
        match notice.severity {
            NoticeSeverity::Info => info!(
                symbol = %notice.symbol,
                classification = %notice.classification,
                detail = %notice.detail,
                "protection notice"
            ),
            NoticeSeverity::Warning | NoticeSeverity::Critical => warn!(
                symbol = %notice.symbol,
                classification = %notice.classification,
                severity = ?notice.severity,
                detail = %notice.detail,
                "protection alert"
            ),
        }
        Ok(())
    }
}

/// Timestamped notice captured by [`CapturingNotifier`].
#[derive(Debug, Clone)]
pub struct CapturedNotice {
    /// The notice.
    pub notice: DriftNotice,
    /// When it was received.
    pub at: DateTime<Utc>,
}

/// Notification sink that records notices; for tests.
#[derive(Debug, Default)]
pub struct CapturingNotifier {
    notices: Mutex<Vec<CapturedNotice>>,
}

impl CapturingNotifier {
    /// Creates an empty capture sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured notices in arrival order.
    #[must_use]
    pub fn notices(&self) -> Vec<CapturedNotice> {
        self.notices.lock().clone()
    }
}

#[async_trait::async_trait]
impl NotificationSink for CapturingNotifier {
    async fn notify(&self, notice: DriftNotice) -> anyhow::Result<()> {
        self.notices.lock().push(CapturedNotice {
            notice,
            at: Utc::now(),
        });
        Ok(())
    }
}
