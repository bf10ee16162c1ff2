//! Domain types for position-protection reconciliation.
//!
//! The reconciler compares the protective plan orders a position *should*
//! carry ([`ExpectedTarget`]) against what the exchange actually has open
//! ([`LivePlanOrder`]) and records the discrepancy as a [`DriftRecord`].
//! Every repair action is captured as an append-only [`RemediationAttempt`].
//!
//! All prices and sizes are [`Decimal`]; timestamps are UTC.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Positions
// =============================================================================

/// Direction of a futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    /// Long position, protected by a sell-side stop below entry.
    Long,
    /// Short position, protected by a buy-side stop above entry.
    Short,
}

impl PositionSide {
    /// Returns the exchange hold-side string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of an open exchange position.
///
/// Owned by the exchange; the reconciler only reads it. `opened_at` is part
/// of the position's identity for idempotency-key derivation, so two
/// positions on the same symbol opened at different times never share keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Instrument symbol, exchange format (e.g. `BTCUSDT`).
    pub symbol: String,

    /// Position direction.
    pub side: PositionSide,

    /// Current (possibly partially reduced) position size in contracts.
    pub size: Decimal,

    /// Average entry price.
    pub entry_price: Decimal,

    /// When the position was opened on the exchange.
    pub opened_at: DateTime<Utc>,
}

// =============================================================================
// Expected protection
// =============================================================================

/// One take-profit leg: trigger price and the fraction of the *original*
/// position size it closes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLeg {
    /// Trigger price for this leg.
    pub price: Decimal,

    /// Fraction of original position size, in `(0, 1]`.
    pub fraction: Decimal,
}

/// The protection a position is supposed to carry.
///
/// Derived once per position from the accepted signal at open time;
/// immutable for the life of the position unless the signal source
/// explicitly updates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedTarget {
    /// Instrument symbol.
    pub symbol: String,

    /// Position direction the protection belongs to.
    pub side: PositionSide,

    /// Stop-loss trigger price.
    pub stop_loss: Decimal,

    /// Take-profit legs, ordered nearest-first.
    pub take_profits: Vec<TakeProfitLeg>,
}

impl ExpectedTarget {
    /// Sum of all take-profit fractions.
    #[must_use]
    pub fn fraction_sum(&self) -> Decimal {
        self.take_profits.iter().map(|leg| leg.fraction).sum()
    }

    /// Returns true if every fraction is positive and they sum to at most 1.
    #[must_use]
    pub fn fractions_valid(&self) -> bool {
        self.take_profits
            .iter()
            .all(|leg| leg.fraction > Decimal::ZERO)
            && self.fraction_sum() <= Decimal::ONE
    }
}

/// An accepted-signal record as stored by the signal pipeline.
///
/// The reconciler treats these as its source of truth for expected targets;
/// it never writes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedSignal {
    /// Instrument symbol.
    pub symbol: String,

    /// Signal direction.
    pub side: PositionSide,

    /// Entry price the signal was accepted at.
    pub entry_price: Decimal,

    /// Stop-loss price.
    pub stop_loss: Decimal,

    /// Take-profit legs.
    pub take_profits: Vec<TakeProfitLeg>,

    /// When the signal was accepted.
    pub accepted_at: DateTime<Utc>,
}

// =============================================================================
// Target kinds and idempotency keys
// =============================================================================

/// Identifies one protective slot of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// The single stop-loss.
    StopLoss,
    /// Take-profit leg, 1-based index.
    TakeProfit(u8),
}

impl TargetKind {
    /// Short prefix used in client order ids (`sl`, `tp1`, `tp2`, ...).
    #[must_use]
    pub fn oid_prefix(self) -> String {
        match self {
            Self::StopLoss => "sl".to_string(),
            Self::TakeProfit(i) => format!("tp{i}"),
        }
    }

    /// Returns the live order kind this slot is filled by.
    #[must_use]
    pub fn plan_kind(self) -> PlanOrderKind {
        match self {
            Self::StopLoss => PlanOrderKind::StopLoss,
            Self::TakeProfit(_) => PlanOrderKind::TakeProfit,
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "stop_loss"),
            Self::TakeProfit(i) => write!(f, "take_profit_{i}"),
        }
    }
}

/// Deterministic client order id for idempotent plan-order placement.
///
/// Derived from `(symbol, position opened_at, target kind)` so the same
/// expected target always yields the same id and a retried placement after a
/// timeout is deduplicated by the exchange. Bitget accepts at most 32
/// alphanumeric characters, so every component is sanitized and truncated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOid(String);

impl ClientOid {
    /// Maximum length accepted by the exchange.
    pub const MAX_LEN: usize = 32;

    /// Derives the idempotency key for one protective slot.
    #[must_use]
    pub fn derive(symbol: &str, side: PositionSide, opened_at: DateTime<Utc>, kind: TargetKind) -> Self {
        let prefix = kind.oid_prefix();
        let side_part = match side {
            PositionSide::Long => "lg",
            PositionSide::Short => "sh",
        };
        let symbol_clean: String = symbol
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        let symbol_part: String = symbol_clean
            .chars()
            .rev()
            .take(10)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let millis = opened_at.timestamp_millis().unsigned_abs().to_string();
        let millis_part: &str = if millis.len() > 13 {
            &millis[millis.len() - 13..]
        } else {
            &millis
        };

        let mut oid = format!("{prefix}{side_part}{symbol_part}{millis_part}");
        if oid.len() > Self::MAX_LEN {
            oid = oid[oid.len() - Self::MAX_LEN..].to_string();
        }
        Self(oid)
    }

    /// Wraps an id received from the exchange.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientOid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Live plan orders
// =============================================================================

/// Kind of a conditional plan order on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrderKind {
    /// `pos_loss` plan order.
    StopLoss,
    /// `pos_profit` plan order.
    TakeProfit,
}

/// Lifecycle state of a live plan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrderStatus {
    /// Waiting for its trigger price.
    Live,
    /// Trigger fired, execution in progress.
    Executing,
    /// Cancelled on the exchange.
    Cancelled,
}

/// A conditional protective order currently open on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePlanOrder {
    /// Exchange order id.
    pub id: String,

    /// Instrument symbol.
    pub symbol: String,

    /// Hold side the order reduces.
    pub side: PositionSide,

    /// Stop-loss or take-profit.
    pub kind: PlanOrderKind,

    /// Trigger price.
    pub trigger_price: Decimal,

    /// Order size in contracts.
    pub size: Decimal,

    /// Client order id, if the order was placed with one.
    pub client_oid: Option<String>,

    /// Lifecycle state.
    pub status: PlanOrderStatus,
}

impl LivePlanOrder {
    /// Returns true if the order still provides protection.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self.status, PlanOrderStatus::Live | PlanOrderStatus::Executing)
    }
}

/// Parameters for placing a new plan order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOrderSpec {
    /// Instrument symbol.
    pub symbol: String,

    /// Hold side the order protects.
    pub side: PositionSide,

    /// Stop-loss or take-profit.
    pub kind: PlanOrderKind,

    /// Trigger price.
    pub trigger_price: Decimal,

    /// Order size in contracts.
    pub size: Decimal,

    /// Deterministic idempotency key.
    pub client_oid: ClientOid,
}

// =============================================================================
// Drift
// =============================================================================

/// Classification of one position's protection state.
///
/// When multiple issues exist the most severe wins:
/// `Missing > Mismatched > Orphaned > Ok`. `Unmanaged` positions (no
/// resolvable expected target) are outside the precedence chain entirely and
/// are never remediated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftClass {
    /// Protection matches the expected target within tolerance.
    Ok,
    /// No expected target could be resolved; position is skipped.
    Unmanaged,
    /// At least one extra live order has no expected counterpart.
    Orphaned,
    /// At least one live order deviates from its expected counterpart.
    Mismatched,
    /// At least one expected protective order has no live counterpart.
    Missing,
}

impl DriftClass {
    /// Precedence rank; higher is more severe.
    #[must_use]
    pub fn severity(self) -> u8 {
        match self {
            Self::Ok | Self::Unmanaged => 0,
            Self::Orphaned => 1,
            Self::Mismatched => 2,
            Self::Missing => 3,
        }
    }

    /// Returns true if the classification calls for remediation.
    #[must_use]
    pub fn needs_remediation(self) -> bool {
        self.severity() > 0
    }

    /// Stable label used in metrics and audit records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Unmanaged => "unmanaged",
            Self::Orphaned => "orphaned",
            Self::Mismatched => "mismatched",
            Self::Missing => "missing",
        }
    }
}

impl std::fmt::Display for DriftClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which field of a live order deviates from its expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchField {
    /// Trigger price differs beyond tolerance.
    TriggerPrice,
    /// Order size differs beyond the instrument size step.
    Size,
}

/// A live order whose trigger price or size deviates from the expected value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    /// The protective slot that deviates.
    pub kind: TargetKind,

    /// Exchange id of the deviating order.
    pub order_id: String,

    /// The deviating field.
    pub field: MismatchField,

    /// Value the slot should have.
    pub expected: Decimal,

    /// Value the live order actually has.
    pub actual: Decimal,
}

/// Result of comparing one position against its expected protection.
///
/// Cycle-scoped: each reconciliation pass produces fresh records which
/// supersede the previous pass. History lives only in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftRecord {
    /// Instrument symbol.
    pub symbol: String,

    /// Most severe classification for this position.
    pub classification: DriftClass,

    /// Protective slots with no live counterpart.
    pub missing: Vec<TargetKind>,

    /// Live orders deviating from their expected slot.
    pub mismatched: Vec<Mismatch>,

    /// Exchange ids of live orders with no expected counterpart.
    pub orphaned: Vec<String>,

    /// When the comparison ran.
    pub detected_at: DateTime<Utc>,
}

impl DriftRecord {
    /// Creates an all-clear record for a symbol.
    #[must_use]
    pub fn ok(symbol: impl Into<String>, detected_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            classification: DriftClass::Ok,
            missing: Vec::new(),
            mismatched: Vec::new(),
            orphaned: Vec::new(),
            detected_at,
        }
    }

    /// Creates an unmanaged-skip record for a symbol.
    #[must_use]
    pub fn unmanaged(symbol: impl Into<String>, detected_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            classification: DriftClass::Unmanaged,
            missing: Vec::new(),
            mismatched: Vec::new(),
            orphaned: Vec::new(),
            detected_at,
        }
    }

    /// Total number of issues across all categories.
    #[must_use]
    pub fn issue_count(&self) -> usize {
        self.missing.len() + self.mismatched.len() + self.orphaned.len()
    }
}

// =============================================================================
// Remediation
// =============================================================================

/// One repair action derived from a drift record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationAction {
    /// Place a protective plan order.
    Place {
        /// Slot being filled.
        kind: TargetKind,
        /// Trigger price.
        trigger_price: Decimal,
        /// Order size in contracts.
        size: Decimal,
        /// Idempotency key the order is placed with.
        client_oid: ClientOid,
    },
    /// Cancel a live plan order by exchange id.
    Cancel {
        /// Exchange order id.
        order_id: String,
        /// Slot the cancelled order occupied, when known.
        kind: Option<TargetKind>,
    },
}

impl RemediationAction {
    /// Returns true for placement actions.
    #[must_use]
    pub fn is_place(&self) -> bool {
        matches!(self, Self::Place { .. })
    }
}

/// Terminal outcome of one remediation action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Exchange accepted the action.
    Success,
    /// Exchange rejected the client oid as already used; the protective
    /// order from a prior attempt is in place, so this counts as success.
    Duplicate,
    /// Exchange rejected the action; retrying the same request is futile.
    Rejected {
        /// Exchange error code, when available.
        code: String,
        /// Human-readable rejection reason.
        message: String,
    },
    /// The request did not complete within its deadline; actual exchange
    /// state is unknown until the next reconciliation pass.
    TimedOut,
}

impl AttemptOutcome {
    /// Returns true if the protective order is known to be in place.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::Duplicate)
    }
}

/// Append-only audit fact: one remediation action and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAttempt {
    /// Instrument symbol.
    pub symbol: String,

    /// The action attempted.
    pub action: RemediationAction,

    /// How the attempt ended.
    pub outcome: AttemptOutcome,

    /// When the attempt was made.
    pub attempted_at: DateTime<Utc>,
}

// =============================================================================
// Notifications
// =============================================================================

/// Severity of an operator notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeSeverity {
    /// Informational (e.g. recovery).
    Info,
    /// Needs attention soon.
    Warning,
    /// Position is unprotected and repairs are failing.
    Critical,
}

/// Payload handed to the notification sink when a position stays in drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftNotice {
    /// Notification severity.
    pub severity: NoticeSeverity,

    /// Instrument symbol.
    pub symbol: String,

    /// Current drift classification.
    pub classification: DriftClass,

    /// Free-form detail naming the missing protection kinds.
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn opened_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap()
    }

    // ==================== ClientOid Tests ====================

    #[test]
    fn test_client_oid_is_deterministic() {
        let a = ClientOid::derive("BTCUSDT", PositionSide::Long, opened_at(), TargetKind::StopLoss);
        let b = ClientOid::derive("BTCUSDT", PositionSide::Long, opened_at(), TargetKind::StopLoss);
        assert_eq!(a, b);
    }

    #[test]
    fn test_client_oid_differs_per_kind() {
        let sl = ClientOid::derive("BTCUSDT", PositionSide::Long, opened_at(), TargetKind::StopLoss);
        let tp1 =
            ClientOid::derive("BTCUSDT", PositionSide::Long, opened_at(), TargetKind::TakeProfit(1));
        let tp2 =
            ClientOid::derive("BTCUSDT", PositionSide::Long, opened_at(), TargetKind::TakeProfit(2));
        assert_ne!(sl, tp1);
        assert_ne!(tp1, tp2);
    }

    #[test]
    fn test_client_oid_differs_per_open_time() {
        let later = opened_at() + chrono::Duration::seconds(1);
        let a = ClientOid::derive("BTCUSDT", PositionSide::Long, opened_at(), TargetKind::StopLoss);
        let b = ClientOid::derive("BTCUSDT", PositionSide::Long, later, TargetKind::StopLoss);
        assert_ne!(a, b);
    }

    #[test]
    fn test_client_oid_fits_exchange_limit() {
        let oid = ClientOid::derive(
            "1000000BABYDOGEUSDT",
            PositionSide::Short,
            opened_at(),
            TargetKind::TakeProfit(2),
        );
        assert!(oid.as_str().len() <= ClientOid::MAX_LEN);
        assert!(oid.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_client_oid_strips_symbol_separators() {
        let oid = ClientOid::derive(
            "BTC/USDT:USDT",
            PositionSide::Long,
            opened_at(),
            TargetKind::StopLoss,
        );
        assert!(oid.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    // ==================== TargetKind Tests ====================

    #[test]
    fn test_target_kind_display() {
        assert_eq!(TargetKind::StopLoss.to_string(), "stop_loss");
        assert_eq!(TargetKind::TakeProfit(1).to_string(), "take_profit_1");
        assert_eq!(TargetKind::TakeProfit(2).to_string(), "take_profit_2");
    }

    #[test]
    fn test_target_kind_plan_kind() {
        assert_eq!(TargetKind::StopLoss.plan_kind(), PlanOrderKind::StopLoss);
        assert_eq!(TargetKind::TakeProfit(3).plan_kind(), PlanOrderKind::TakeProfit);
    }

    // ==================== ExpectedTarget Tests ====================

    #[test]
    fn test_fraction_sum() {
        let target = ExpectedTarget {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            stop_loss: dec!(58800),
            take_profits: vec![
                TakeProfitLeg { price: dec!(61800), fraction: dec!(0.5) },
                TakeProfitLeg { price: dec!(63000), fraction: dec!(0.5) },
            ],
        };
        assert_eq!(target.fraction_sum(), dec!(1.0));
        assert!(target.fractions_valid());
    }

    #[test]
    fn test_fractions_over_one_invalid() {
        let target = ExpectedTarget {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            stop_loss: dec!(58800),
            take_profits: vec![
                TakeProfitLeg { price: dec!(61800), fraction: dec!(0.7) },
                TakeProfitLeg { price: dec!(63000), fraction: dec!(0.5) },
            ],
        };
        assert!(!target.fractions_valid());
    }

    #[test]
    fn test_zero_fraction_invalid() {
        let target = ExpectedTarget {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            stop_loss: dec!(58800),
            take_profits: vec![TakeProfitLeg { price: dec!(61800), fraction: dec!(0) }],
        };
        assert!(!target.fractions_valid());
    }

    // ==================== DriftClass Tests ====================

    #[test]
    fn test_drift_class_precedence() {
        assert!(DriftClass::Missing.severity() > DriftClass::Mismatched.severity());
        assert!(DriftClass::Mismatched.severity() > DriftClass::Orphaned.severity());
        assert!(DriftClass::Orphaned.severity() > DriftClass::Ok.severity());
        assert_eq!(DriftClass::Unmanaged.severity(), DriftClass::Ok.severity());
    }

    #[test]
    fn test_drift_class_needs_remediation() {
        assert!(DriftClass::Missing.needs_remediation());
        assert!(DriftClass::Mismatched.needs_remediation());
        assert!(DriftClass::Orphaned.needs_remediation());
        assert!(!DriftClass::Ok.needs_remediation());
        assert!(!DriftClass::Unmanaged.needs_remediation());
    }

    // ==================== DriftRecord Tests ====================

    #[test]
    fn test_drift_record_ok() {
        let record = DriftRecord::ok("BTCUSDT", opened_at());
        assert_eq!(record.classification, DriftClass::Ok);
        assert_eq!(record.issue_count(), 0);
    }

    #[test]
    fn test_drift_record_issue_count() {
        let record = DriftRecord {
            symbol: "BTCUSDT".to_string(),
            classification: DriftClass::Missing,
            missing: vec![TargetKind::StopLoss, TargetKind::TakeProfit(1)],
            mismatched: Vec::new(),
            orphaned: vec!["123".to_string()],
            detected_at: opened_at(),
        };
        assert_eq!(record.issue_count(), 3);
    }

    // ==================== AttemptOutcome Tests ====================

    #[test]
    fn test_duplicate_counts_as_success() {
        assert!(AttemptOutcome::Success.is_success());
        assert!(AttemptOutcome::Duplicate.is_success());
        assert!(!AttemptOutcome::TimedOut.is_success());
        assert!(!AttemptOutcome::Rejected {
            code: "40020".to_string(),
            message: "price out of range".to_string()
        }
        .is_success());
    }

    // ==================== Serde Tests ====================

    #[test]
    fn test_drift_record_round_trips_through_json() {
        let record = DriftRecord {
            symbol: "ETHUSDT".to_string(),
            classification: DriftClass::Mismatched,
            missing: Vec::new(),
            mismatched: vec![Mismatch {
                kind: TargetKind::StopLoss,
                order_id: "987".to_string(),
                field: MismatchField::TriggerPrice,
                expected: dec!(58800),
                actual: dec!(58000),
            }],
            orphaned: Vec::new(),
            detected_at: opened_at(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: DriftRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_remediation_action_serde_tag() {
        let action = RemediationAction::Cancel {
            order_id: "42".to_string(),
            kind: Some(TargetKind::StopLoss),
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"action\":\"cancel\""));
    }
}
