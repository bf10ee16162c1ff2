//! Drift detection.
//!
//! Pure comparison of a position's live plan orders against its expected
//! protection. No I/O: the runner feeds in snapshots and a config
//! snapshot, and gets back a cycle-scoped [`DriftRecord`].
//!
//! Tolerances are tick-aware rather than percentage-based so exchange-side
//! price rounding cannot oscillate between "mismatched" and "ok" across
//! cycles.

use crate::resolver::take_profit_sizes;
use chrono::{DateTime, Utc};
use palisade_core::{
    DriftClass, DriftRecord, ExpectedTarget, LivePlanOrder, Mismatch, MismatchField,
    PlanOrderKind, Position, SymbolSettings, TakeProfitPolicy, TargetKind,
};
use rust_decimal::Decimal;

/// Classifies positions by comparing live protection against expectations.
#[derive(Debug, Clone)]
pub struct DriftDetector {
    policy: TakeProfitPolicy,
}

impl DriftDetector {
    /// Creates a detector with the configured take-profit sizing policy.
    #[must_use]
    pub fn new(policy: TakeProfitPolicy) -> Self {
        Self { policy }
    }

    /// Compares one position against its expected target.
    ///
    /// `now` is injected for deterministic records. A vanished position
    /// (size zero between snapshot and detection) is `Ok`: it needs no
    /// protection.
    #[must_use]
    pub fn detect(
        &self,
        position: &Position,
        expected: &ExpectedTarget,
        live_orders: &[LivePlanOrder],
        settings: &SymbolSettings,
        now: DateTime<Utc>,
    ) -> DriftRecord {
        if position.size <= Decimal::ZERO {
            return DriftRecord::ok(position.symbol.clone(), now);
        }

        let tolerance = settings.price_tolerance();
        let step = settings.size_step;

        let mut missing: Vec<TargetKind> = Vec::new();
        let mut mismatched: Vec<Mismatch> = Vec::new();
        let mut orphaned: Vec<String> = Vec::new();

        let relevant: Vec<&LivePlanOrder> = live_orders
            .iter()
            .filter(|o| o.is_live() && o.side == position.side)
            .collect();

        self.check_stop_loss(
            position, expected, &relevant, tolerance, step, &mut missing, &mut mismatched,
            &mut orphaned,
        );
        self.check_take_profits(
            position, expected, &relevant, tolerance, step, &mut missing, &mut mismatched,
            &mut orphaned,
        );

        let classification = classify(&missing, &mismatched, &orphaned);

        DriftRecord {
            symbol: position.symbol.clone(),
            classification,
            missing,
            mismatched,
            orphaned,
            detected_at: now,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_stop_loss(
        &self,
        position: &Position,
        expected: &ExpectedTarget,
        live: &[&LivePlanOrder],
        tolerance: Decimal,
        step: Decimal,
        missing: &mut Vec<TargetKind>,
        mismatched: &mut Vec<Mismatch>,
        orphaned: &mut Vec<String>,
    ) {
        let mut stops: Vec<&LivePlanOrder> = live
            .iter()
            .copied()
            .filter(|o| o.kind == PlanOrderKind::StopLoss)
            .collect();

        if stops.is_empty() {
            missing.push(TargetKind::StopLoss);
            return;
        }

        // The order triggering closest to the expected price is "the"
        // stop-loss; any others are duplicates to cancel.
        stops.sort_by_key(|o| (o.trigger_price - expected.stop_loss).abs());
        let primary = stops[0];
        for extra in &stops[1..] {
            orphaned.push(extra.id.clone());
        }

        let price_diff = (primary.trigger_price - expected.stop_loss).abs();
        if price_diff > tolerance {
            mismatched.push(Mismatch {
                kind: TargetKind::StopLoss,
                order_id: primary.id.clone(),
                field: MismatchField::TriggerPrice,
                expected: expected.stop_loss,
                actual: primary.trigger_price,
            });
        } else if (primary.size - position.size).abs() > step {
            mismatched.push(Mismatch {
                kind: TargetKind::StopLoss,
                order_id: primary.id.clone(),
                field: MismatchField::Size,
                expected: position.size,
                actual: primary.size,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_take_profits(
        &self,
        position: &Position,
        expected: &ExpectedTarget,
        live: &[&LivePlanOrder],
        tolerance: Decimal,
        step: Decimal,
        missing: &mut Vec<TargetKind>,
        mismatched: &mut Vec<Mismatch>,
        orphaned: &mut Vec<String>,
    ) {
        let expected_sizes = take_profit_sizes(expected, position.size, self.policy);

        let mut pool: Vec<&LivePlanOrder> = live
            .iter()
            .copied()
            .filter(|o| o.kind == PlanOrderKind::TakeProfit)
            .collect();

        let mut matched: Vec<(usize, &LivePlanOrder)> = Vec::new();
        let mut unmatched_legs: Vec<usize> = Vec::new();

        for (i, leg) in expected.take_profits.iter().enumerate() {
            let candidate = pool
                .iter()
                .enumerate()
                .filter(|(_, o)| (o.trigger_price - leg.price).abs() <= tolerance)
                .min_by_key(|(_, o)| (o.trigger_price - leg.price).abs())
                .map(|(pool_idx, _)| pool_idx);

            match candidate {
                Some(pool_idx) => {
                    let order = pool.remove(pool_idx);
                    matched.push((i, order));
                }
                None => unmatched_legs.push(i),
            }
        }

        // Leftover live take-profits have no expected slot.
        for extra in pool {
            orphaned.push(extra.id.clone());
        }

        let matched_size: Decimal = matched.iter().map(|(_, o)| o.size).sum();
        // A leg whose live order is gone may have been consumed by its own
        // fill. If what remains of the position is already fully covered by
        // the surviving take-profits, the absent legs are consumed, not
        // missing. Size drift is only enforced while the full set is live:
        // after a partial fill the per-leg split is no longer well-defined.
        let remainder_covered = matched_size + step >= position.size;
        let partial_fill = !unmatched_legs.is_empty() && remainder_covered;

        if !partial_fill {
            for i in unmatched_legs {
                missing.push(TargetKind::TakeProfit(leg_index(i)));
            }
            for (i, order) in &matched {
                let expected_size = expected_sizes.get(*i).copied().unwrap_or(Decimal::ZERO);
                if (order.size - expected_size).abs() > step {
                    mismatched.push(Mismatch {
                        kind: TargetKind::TakeProfit(leg_index(*i)),
                        order_id: order.id.clone(),
                        field: MismatchField::Size,
                        expected: expected_size,
                        actual: order.size,
                    });
                }
            }
        }
    }
}

fn classify(missing: &[TargetKind], mismatched: &[Mismatch], orphaned: &[String]) -> DriftClass {
    if !missing.is_empty() {
        DriftClass::Missing
    } else if !mismatched.is_empty() {
        DriftClass::Mismatched
    } else if !orphaned.is_empty() {
        DriftClass::Orphaned
    } else {
        DriftClass::Ok
    }
}

/// Take-profit legs are 1-based in target kinds.
fn leg_index(i: usize) -> u8 {
    u8::try_from(i + 1).unwrap_or(u8::MAX)
}
