//! Remediation: turning drift records into idempotent exchange repairs.
//!
//! For every non-ok position the engine computes the minimal set of
//! place/cancel actions and executes them with three safety properties:
//!
//! 1. **Cancel-before-replace** - a mismatched order's cancel must succeed
//!    (or the order be confirmed absent) before the corrected order is
//!    placed, so two stop-losses at different prices can never coexist.
//! 2. **Idempotent placement** - every place carries the deterministic
//!    client oid for its slot; a timed-out attempt that actually landed is
//!    rejected as a duplicate on retry and counted as success.
//! 3. **Shared rate limiting** - all mutations across all symbols draw
//!    from one token bucket sized to the exchange quota; actions queue
//!    rather than burst-fail.
//!
//! At most one remediation runs per symbol at a time (single-flight).

use crate::resolver::take_profit_sizes;
use crate::retry::with_retry;
use chrono::Utc;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use palisade_core::{
    AttemptOutcome, AuditSink, ClientOid, DriftClass, DriftNotice, DriftRecord, ExchangeGateway,
    ExpectedTarget, GatewayError, MetricsSink, NoticeSeverity, NotificationSink, PlanOrderSpec,
    Position, RemediationAction, RemediationAttempt, RetryConfig, TakeProfitPolicy, TargetKind,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type GovernorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// A sequence of actions that must succeed in order; a failure aborts the
/// rest of the group (but not other groups).
type ActionGroup = Vec<RemediationAction>;

/// Executes repair plans against the exchange gateway.
pub struct RemediationEngine {
    gateway: Arc<dyn ExchangeGateway>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<dyn MetricsSink>,
    notifier: Arc<dyn NotificationSink>,
    limiter: Arc<GovernorLimiter>,
    retry: RetryConfig,
    policy: TakeProfitPolicy,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RemediationEngine {
    /// Creates an engine with a mutation quota expressed per minute.
    ///
    /// The quota is applied as one token per `60s / quota` with no burst,
    /// so no rolling 60-second window ever sees more mutations than the
    /// configured count.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<dyn MetricsSink>,
        notifier: Arc<dyn NotificationSink>,
        mutations_per_minute: NonZeroU32,
        retry: RetryConfig,
        policy: TakeProfitPolicy,
    ) -> Self {
        let period =
            std::time::Duration::from_secs_f64(60.0 / f64::from(mutations_per_minute.get()));
        let quota =
            Quota::with_period(period).unwrap_or_else(|| Quota::per_minute(mutations_per_minute));
        Self::with_quota(gateway, audit, metrics, notifier, quota, retry, policy)
    }

    /// Creates an engine with an explicit governor quota (used by tests to
    /// compress the clock).
    #[must_use]
    pub fn with_quota(
        gateway: Arc<dyn ExchangeGateway>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<dyn MetricsSink>,
        notifier: Arc<dyn NotificationSink>,
        quota: Quota,
        retry: RetryConfig,
        policy: TakeProfitPolicy,
    ) -> Self {
        Self {
            gateway,
            audit,
            metrics,
            notifier,
            limiter: Arc::new(RateLimiter::direct(quota)),
            retry,
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Computes the minimal repair plan for one drifted position.
    ///
    /// Groups preserve the cancel-before-replace invariant: a mismatch's
    /// cancel and its replacement place share a group and execute in order.
    #[must_use]
    pub fn build_plan(
        &self,
        position: &Position,
        drift: &DriftRecord,
        expected: &ExpectedTarget,
    ) -> Vec<ActionGroup> {
        let tp_sizes = take_profit_sizes(expected, position.size, self.policy);
        let mut groups: Vec<ActionGroup> = Vec::new();

        // Orphans first: they free protective slots and margin.
        for order_id in &drift.orphaned {
            groups.push(vec![RemediationAction::Cancel {
                order_id: order_id.clone(),
                kind: None,
            }]);
        }

        for mismatch in &drift.mismatched {
            groups.push(vec![
                RemediationAction::Cancel {
                    order_id: mismatch.order_id.clone(),
                    kind: Some(mismatch.kind),
                },
                self.place_action(position, expected, &tp_sizes, mismatch.kind),
            ]);
        }

        for kind in &drift.missing {
            groups.push(vec![self.place_action(position, expected, &tp_sizes, *kind)]);
        }

        groups
    }

    fn place_action(
        &self,
        position: &Position,
        expected: &ExpectedTarget,
        tp_sizes: &[Decimal],
        kind: TargetKind,
    ) -> RemediationAction {
        let (trigger_price, size) = match kind {
            TargetKind::StopLoss => (expected.stop_loss, position.size),
            TargetKind::TakeProfit(i) => {
                let idx = usize::from(i.saturating_sub(1));
                let price = expected
                    .take_profits
                    .get(idx)
                    .map_or(Decimal::ZERO, |leg| leg.price);
                let size = tp_sizes.get(idx).copied().unwrap_or(Decimal::ZERO);
                (price, size)
            }
        };

        RemediationAction::Place {
            kind,
            trigger_price,
            size,
            client_oid: ClientOid::derive(&position.symbol, position.side, position.opened_at, kind),
        }
    }

    /// Executes the repair plan for one position.
    ///
    /// Every attempt is appended to the audit sink as it completes. A
    /// shutdown signal stops new groups from starting; a group whose cancel
    /// already succeeded still gets its replacement place (one attempt, no
    /// backoff) so a cancel-without-replace is never left behind when
    /// avoidable.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Authentication`] when the exchange rejects
    /// credentials; all other failures are folded into attempt outcomes.
    pub async fn remediate(
        &self,
        position: &Position,
        drift: &DriftRecord,
        expected: &ExpectedTarget,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Vec<RemediationAttempt>, GatewayError> {
        let lock = self.symbol_lock(&position.symbol);
        let Ok(_guard) = lock.try_lock() else {
            debug!(symbol = %position.symbol, "remediation already in flight, skipping");
            return Ok(Vec::new());
        };

        let plan = self.build_plan(position, drift, expected);
        if plan.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            symbol = %position.symbol,
            classification = %drift.classification,
            groups = plan.len(),
            "remediating drift"
        );

        let mut attempts = Vec::new();

        'groups: for group in plan {
            if *shutdown.borrow() {
                info!(symbol = %position.symbol, "shutdown requested, deferring remaining repairs");
                break;
            }

            let mut cancel_succeeded = false;
            for action in group {
                let draining = *shutdown.borrow();
                // Once a cancel landed, its replacement must go out even
                // during shutdown; a single attempt, no backoff.
                let retry = if draining {
                    RetryConfig {
                        max_retries: 0,
                        ..self.retry.clone()
                    }
                } else {
                    self.retry.clone()
                };

                let is_place = action.is_place();
                if draining && is_place && !cancel_succeeded {
                    break 'groups;
                }

                let outcome = match self.execute_action(position, &action, &retry).await {
                    Ok(outcome) => outcome,
                    Err(auth) => {
                        self.record(position, action, AttemptOutcome::Rejected {
                            code: "auth".to_string(),
                            message: auth.to_string(),
                        }, &mut attempts)
                        .await;
                        return Err(auth);
                    }
                };

                let ok = outcome.is_success();
                if !is_place {
                    cancel_succeeded = ok;
                }
                self.record(position, action, outcome, &mut attempts).await;

                if !ok {
                    // Abort the rest of this group; a failed cancel must
                    // not be followed by its replacement place.
                    continue 'groups;
                }
            }
        }

        Ok(attempts)
    }

    /// Runs a single action through the rate limiter, retry policy, and
    /// outcome mapping. Every retry draws its own rate-limit token: a
    /// retried mutation is still a mutation against the exchange quota.
    async fn execute_action(
        &self,
        position: &Position,
        action: &RemediationAction,
        retry: &RetryConfig,
    ) -> Result<AttemptOutcome, GatewayError> {
        let gateway = &self.gateway;
        let limiter = &self.limiter;

        let result = match action {
            RemediationAction::Place {
                kind,
                trigger_price,
                size,
                client_oid,
            } => {
                let spec = PlanOrderSpec {
                    symbol: position.symbol.clone(),
                    side: position.side,
                    kind: kind.plan_kind(),
                    trigger_price: *trigger_price,
                    size: *size,
                    client_oid: client_oid.clone(),
                };
                let spec = &spec;
                with_retry(retry, move || async move {
                    limiter.until_ready().await;
                    gateway.place_plan_order(spec).await.map(|_| ())
                })
                .await
            }
            RemediationAction::Cancel { order_id, .. } => {
                let symbol = position.symbol.as_str();
                let order_id = order_id.as_str();
                with_retry(retry, move || async move {
                    limiter.until_ready().await;
                    gateway.cancel_plan_order(symbol, order_id).await
                })
                .await
            }
        };

        match result {
            Ok(()) => Ok(AttemptOutcome::Success),
            Err(e) if e.is_duplicate() => {
                debug!(symbol = %position.symbol, "placement deduplicated by exchange");
                Ok(AttemptOutcome::Duplicate)
            }
            Err(GatewayError::OrderNotFound { order_id }) => {
                // Cancel target already gone: idempotent-absent.
                debug!(symbol = %position.symbol, order_id, "cancel target already absent");
                Ok(AttemptOutcome::Success)
            }
            Err(e) if e.is_auth() => Err(e),
            Err(e) if e.is_validation() => {
                warn!(symbol = %position.symbol, error = %e, "order rejected as invalid");
                let notice = DriftNotice {
                    severity: NoticeSeverity::Critical,
                    symbol: position.symbol.clone(),
                    classification: DriftClass::Missing,
                    detail: format!("protective order rejected by exchange: {e}"),
                };
                if let Err(notify_err) = self.notifier.notify(notice).await {
                    warn!(error = %notify_err, "notification sink failed");
                }
                Ok(AttemptOutcome::Rejected {
                    code: "validation".to_string(),
                    message: e.to_string(),
                })
            }
            Err(GatewayError::Api { status, code, message }) if status < 500 => {
                Ok(AttemptOutcome::Rejected { code, message })
            }
            Err(e) => {
                // Transient failure that outlived its retries: the true
                // exchange state is unknown until the next pass re-reads it.
                warn!(symbol = %position.symbol, error = %e, "repair unresolved this cycle");
                Ok(AttemptOutcome::TimedOut)
            }
        }
    }

    async fn record(
        &self,
        position: &Position,
        action: RemediationAction,
        outcome: AttemptOutcome,
        attempts: &mut Vec<RemediationAttempt>,
    ) {
        let attempt = RemediationAttempt {
            symbol: position.symbol.clone(),
            action,
            outcome,
            attempted_at: Utc::now(),
        };
        self.metrics.attempt_recorded(&attempt.outcome);
        if let Err(e) = self.audit.record_attempt(&attempt).await {
            warn!(symbol = %position.symbol, error = %e, "audit sink failed to record attempt");
        }
        attempts.push(attempt);
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}
