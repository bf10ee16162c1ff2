//! Accepted-signal stores.
//!
//! The signal pipeline owns signal persistence; the reconciler only needs a
//! read path keyed by symbol and position-open time. Two implementations
//! are provided: a JSON-file snapshot for deployments where the pipeline
//! exports accepted signals, and an in-memory store for tests and embedded
//! use.
//!
//! Lookup semantics: the *closest* signal accepted at or before the
//! position open time wins (a small forward skew is tolerated because
//! exchange fill timestamps can precede the store's commit timestamp).

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use palisade_core::{AcceptedSignal, TargetStore};
use parking_lot::RwLock;
use std::path::Path;

/// Clock skew tolerated between signal acceptance and position open.
const LOOKUP_SKEW_SECS: i64 = 2;

fn closest_preceding(
    signals: &[AcceptedSignal],
    symbol: &str,
    opened_at: DateTime<Utc>,
) -> Option<AcceptedSignal> {
    let horizon = opened_at + ChronoDuration::seconds(LOOKUP_SKEW_SECS);
    signals
        .iter()
        .filter(|s| s.symbol == symbol && s.accepted_at <= horizon)
        .max_by_key(|s| s.accepted_at)
        .cloned()
}

// =============================================================================
// File-backed store
// =============================================================================

/// Read-only store over a JSON export of accepted signals.
///
/// The file is a JSON array of [`AcceptedSignal`] records; it is read once
/// at construction. Re-create the store to pick up a fresh export.
pub struct FileTargetStore {
    signals: Vec<AcceptedSignal>,
}

impl FileTargetStore {
    /// Loads the store from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        let signals: Vec<AcceptedSignal> = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            count = signals.len(),
            "loaded accepted-signal export"
        );
        Ok(Self { signals })
    }

    /// Number of signals loaded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Returns true if the store holds no signals.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

#[async_trait]
impl TargetStore for FileTargetStore {
    async fn lookup_expected_target(
        &self,
        symbol: &str,
        opened_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<AcceptedSignal>> {
        Ok(closest_preceding(&self.signals, symbol, opened_at))
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Mutable in-memory store, used by tests and embedded deployments.
#[derive(Default)]
pub struct MemoryTargetStore {
    signals: RwLock<Vec<AcceptedSignal>>,
}

impl MemoryTargetStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a signal.
    pub fn insert(&self, signal: AcceptedSignal) {
        self.signals.write().push(signal);
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn lookup_expected_target(
        &self,
        symbol: &str,
        opened_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<AcceptedSignal>> {
        Ok(closest_preceding(&self.signals.read(), symbol, opened_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use palisade_core::{PositionSide, TakeProfitLeg};
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0).unwrap()
    }

    fn signal(symbol: &str, accepted_at: DateTime<Utc>, stop_loss: rust_decimal::Decimal) -> AcceptedSignal {
        AcceptedSignal {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            entry_price: dec!(60000),
            stop_loss,
            take_profits: vec![TakeProfitLeg { price: dec!(61800), fraction: dec!(1) }],
            accepted_at,
        }
    }

    // ==================== Lookup Tests ====================

    #[tokio::test]
    async fn test_closest_preceding_wins() {
        let store = MemoryTargetStore::new();
        store.insert(signal("BTCUSDT", at(0), dec!(58000)));
        store.insert(signal("BTCUSDT", at(10), dec!(58800)));
        store.insert(signal("BTCUSDT", at(20), dec!(59500)));

        let hit = store
            .lookup_expected_target("BTCUSDT", at(15))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.stop_loss, dec!(58800));
    }

    #[tokio::test]
    async fn test_future_signals_ignored() {
        let store = MemoryTargetStore::new();
        store.insert(signal("BTCUSDT", at(30), dec!(59500)));

        let hit = store.lookup_expected_target("BTCUSDT", at(15)).await.unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn test_small_forward_skew_tolerated() {
        let store = MemoryTargetStore::new();
        let opened = at(15);
        store.insert(signal("BTCUSDT", opened + ChronoDuration::seconds(1), dec!(58800)));

        let hit = store.lookup_expected_target("BTCUSDT", opened).await.unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn test_symbol_filter() {
        let store = MemoryTargetStore::new();
        store.insert(signal("ETHUSDT", at(10), dec!(2900)));

        let hit = store.lookup_expected_target("BTCUSDT", at(15)).await.unwrap();
        assert!(hit.is_none());
    }

    // ==================== File Store Tests ====================

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let signals = vec![signal("BTCUSDT", at(10), dec!(58800))];
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&signals).unwrap().as_bytes())
            .unwrap();

        let store = FileTargetStore::load(file.path()).unwrap();
        assert_eq!(store.len(), 1);

        let hit = store
            .lookup_expected_target("BTCUSDT", at(15))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.stop_loss, dec!(58800));
    }

    #[test]
    fn test_file_store_missing_file() {
        assert!(FileTargetStore::load("/does/not/exist.json").is_err());
    }
}
