//! Append-only audit stores.
//!
//! Every drift detection and every remediation attempt is recorded so any
//! repair can be explained after the fact. The drift record is written
//! *before* its remediation begins: a crash between detection and repair
//! must not lose the reason a repair happened.
//!
//! Storage engine internals stay external to this system; the default
//! implementation is a line-delimited JSON file behind the [`AuditSink`]
//! port, with an in-memory store for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use palisade_core::{AuditSink, DriftRecord, RemediationAttempt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A drift detection.
    Drift {
        /// The detected drift.
        record: DriftRecord,
        /// When the event was appended.
        logged_at: DateTime<Utc>,
    },
    /// A remediation attempt.
    Attempt {
        /// The attempt and its outcome.
        attempt: RemediationAttempt,
        /// When the event was appended.
        logged_at: DateTime<Utc>,
    },
}

// =============================================================================
// JSONL file store
// =============================================================================

/// Append-only JSONL audit log.
///
/// Each event is one JSON line, flushed on write so the drift-before-repair
/// ordering survives a crash.
pub struct JsonlAuditStore {
    file: Mutex<File>,
    path: PathBuf,
}

impl JsonlAuditStore {
    /// Opens (or creates) the log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Path of the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = self.file.lock();
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for JsonlAuditStore {
    async fn record_drift(&self, record: &DriftRecord) -> anyhow::Result<()> {
        self.append(&AuditEvent::Drift {
            record: record.clone(),
            logged_at: Utc::now(),
        })
    }

    async fn record_attempt(&self, attempt: &RemediationAttempt) -> anyhow::Result<()> {
        self.append(&AuditEvent::Attempt {
            attempt: attempt.clone(),
            logged_at: Utc::now(),
        })
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// In-memory audit store for tests; preserves append order across both
/// event kinds.
#[derive(Default)]
pub struct MemoryAuditStore {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in append order.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Recorded drift records, in order.
    #[must_use]
    pub fn drifts(&self) -> Vec<DriftRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                AuditEvent::Drift { record, .. } => Some(record.clone()),
                AuditEvent::Attempt { .. } => None,
            })
            .collect()
    }

    /// Recorded attempts, in order.
    #[must_use]
    pub fn attempts(&self) -> Vec<RemediationAttempt> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                AuditEvent::Attempt { attempt, .. } => Some(attempt.clone()),
                AuditEvent::Drift { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditStore {
    async fn record_drift(&self, record: &DriftRecord) -> anyhow::Result<()> {
        self.events.lock().push(AuditEvent::Drift {
            record: record.clone(),
            logged_at: Utc::now(),
        });
        Ok(())
    }

    async fn record_attempt(&self, attempt: &RemediationAttempt) -> anyhow::Result<()> {
        self.events.lock().push(AuditEvent::Attempt {
            attempt: attempt.clone(),
            logged_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::{
        AttemptOutcome, ClientOid, DriftClass, PositionSide, RemediationAction, TargetKind,
    };
    use rust_decimal_macros::dec;

    fn drift() -> DriftRecord {
        DriftRecord {
            symbol: "BTCUSDT".to_string(),
            classification: DriftClass::Missing,
            missing: vec![TargetKind::StopLoss],
            mismatched: Vec::new(),
            orphaned: Vec::new(),
            detected_at: Utc::now(),
        }
    }

    fn attempt() -> RemediationAttempt {
        RemediationAttempt {
            symbol: "BTCUSDT".to_string(),
            action: RemediationAction::Place {
                kind: TargetKind::StopLoss,
                trigger_price: dec!(58800),
                size: dec!(0.5),
                client_oid: ClientOid::derive(
                    "BTCUSDT",
                    PositionSide::Long,
                    Utc::now(),
                    TargetKind::StopLoss,
                ),
            },
            outcome: AttemptOutcome::Success,
            attempted_at: Utc::now(),
        }
    }

    // ==================== Memory Store Tests ====================

    #[tokio::test]
    async fn test_memory_store_preserves_order() {
        let store = MemoryAuditStore::new();
        store.record_drift(&drift()).await.unwrap();
        store.record_attempt(&attempt()).await.unwrap();

        let events = store.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AuditEvent::Drift { .. }));
        assert!(matches!(events[1], AuditEvent::Attempt { .. }));
        assert_eq!(store.drifts().len(), 1);
        assert_eq!(store.attempts().len(), 1);
    }

    // ==================== JSONL Store Tests ====================

    #[tokio::test]
    async fn test_jsonl_store_appends_parseable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let store = JsonlAuditStore::open(&path).unwrap();

        store.record_drift(&drift()).await.unwrap();
        store.record_attempt(&attempt()).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert!(matches!(first, AuditEvent::Drift { .. }));
        let second: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert!(matches!(second, AuditEvent::Attempt { .. }));
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let store = JsonlAuditStore::open(&path).unwrap();
            store.record_drift(&drift()).await.unwrap();
        }
        {
            let store = JsonlAuditStore::open(&path).unwrap();
            store.record_drift(&drift()).await.unwrap();
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn test_jsonl_store_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/audit.jsonl");
        let store = JsonlAuditStore::open(&path).unwrap();
        assert_eq!(store.path(), path);
    }
}
