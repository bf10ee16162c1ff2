//! Expected-state resolution.
//!
//! Derives the protection a position should carry from the accepted-signal
//! store. Positions with no originating signal (manually opened, or opened
//! before the store's horizon) are *unmanaged*: the reconciler never places
//! protection it cannot attribute to a signal.

use chrono::Duration as ChronoDuration;
use palisade_core::{
    AcceptedSignal, ExpectedTarget, Position, TakeProfitPolicy, TargetStore,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of resolving one position.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The position is managed and should carry this protection.
    Managed(ExpectedTarget),
    /// No usable signal; the position is skipped.
    Unmanaged,
}

/// Resolves positions to expected protection via the signal store.
pub struct ExpectedStateResolver {
    store: Arc<dyn TargetStore>,
    staleness: ChronoDuration,
}

impl ExpectedStateResolver {
    /// Creates a resolver.
    ///
    /// `staleness` bounds how far before the position open a signal may
    /// have been accepted and still count as the originating signal.
    #[must_use]
    pub fn new(store: Arc<dyn TargetStore>, staleness: Duration) -> Self {
        Self {
            store,
            staleness: ChronoDuration::from_std(staleness)
                .unwrap_or_else(|_| ChronoDuration::hours(6)),
        }
    }

    /// Resolves the expected protection for one position.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store itself fails; a missing or
    /// unusable signal is the `Unmanaged` resolution, not an error.
    pub async fn resolve(&self, position: &Position) -> anyhow::Result<Resolution> {
        let signal = self
            .store
            .lookup_expected_target(&position.symbol, position.opened_at)
            .await?;

        let signal = match signal {
            Some(signal) => signal,
            None => {
                debug!(symbol = %position.symbol, "no accepted signal, position unmanaged");
                return Ok(Resolution::Unmanaged);
            }
        };

        Ok(self.target_from_signal(position, signal))
    }

    fn target_from_signal(&self, position: &Position, signal: AcceptedSignal) -> Resolution {
        if signal.side != position.side {
            debug!(
                symbol = %position.symbol,
                signal_side = %signal.side,
                position_side = %position.side,
                "signal side differs from position, unmanaged"
            );
            return Resolution::Unmanaged;
        }

        let age = position.opened_at - signal.accepted_at;
        if age > self.staleness {
            debug!(
                symbol = %position.symbol,
                age_secs = age.num_seconds(),
                "closest signal is stale, position unmanaged"
            );
            return Resolution::Unmanaged;
        }

        let target = ExpectedTarget {
            symbol: position.symbol.clone(),
            side: signal.side,
            stop_loss: signal.stop_loss,
            take_profits: signal.take_profits,
        };

        if !target.fractions_valid() {
            warn!(
                symbol = %position.symbol,
                fraction_sum = %target.fraction_sum(),
                "signal take-profit fractions invalid, position unmanaged"
            );
            return Resolution::Unmanaged;
        }

        Resolution::Managed(target)
    }
}

/// Computes the expected size of each take-profit leg against the current
/// (possibly partially reduced) position size.
///
/// `Strict` sizes legs off the signal's fractions as written; `Renormalize`
/// re-scales them proportionally so the legs together cover the whole
/// remaining size. When fractions already sum to 1 the two policies agree.
#[must_use]
pub fn take_profit_sizes(
    target: &ExpectedTarget,
    position_size: Decimal,
    policy: TakeProfitPolicy,
) -> Vec<Decimal> {
    let total: Decimal = target.fraction_sum();
    if total <= Decimal::ZERO || position_size <= Decimal::ZERO {
        return vec![Decimal::ZERO; target.take_profits.len()];
    }

    match policy {
        TakeProfitPolicy::Strict => target
            .take_profits
            .iter()
            .map(|leg| leg.fraction * position_size)
            .collect(),
        TakeProfitPolicy::Renormalize => target
            .take_profits
            .iter()
            .map(|leg| leg.fraction / total * position_size)
            .collect(),
    }
}
