//! The reconciliation control loop.
//!
//! Drives `Fetch → Resolve → Detect → Remediate → Report` on a fixed
//! cadence with:
//!
//! - overlap-free cycles (a tick that fires mid-cycle is skipped and
//!   counted, never queued);
//! - a hard per-cycle deadline so a slow exchange cannot starve the
//!   cadence - an aborted cycle's half-issued repairs are safe to re-verify
//!   next pass because actuation is idempotent;
//! - a `Degraded` mode on authentication failure: detection-only passes
//!   continue and a continuous alert is raised until credentials recover;
//! - graceful shutdown that drains in-flight repairs within a bounded
//!   window.
//!
//! All drift state is cycle-scoped: each pass rebuilds its view from
//! exchange snapshots, so a restart never acts on stale conclusions.

use crate::alerts::DriftAlerter;
use crate::detector::DriftDetector;
use crate::remediation::RemediationEngine;
use crate::resolver::{ExpectedStateResolver, Resolution};
use chrono::Utc;
use palisade_core::{
    AuditSink, DriftClass, DriftNotice, DriftRecord, ExchangeGateway, MetricsSink,
    NoticeSeverity, NotificationSink, PalisadeConfig, Position, TargetStore,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Symbol placeholder used in account-level notices.
const ACCOUNT_SCOPE: &str = "*";

/// Handle for requesting a graceful shutdown of a running loop.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl RunnerHandle {
    /// Signals the loop to finish in-flight work and stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// What a cycle does with detected drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleMode {
    /// Detect and remediate.
    Full,
    /// Detect only (degraded mode, or the `check` command).
    DetectOnly,
}

struct SymbolOutcome {
    record: Option<DriftRecord>,
    auth_failed: bool,
}

/// Shared per-cycle machinery, cloned into symbol tasks.
struct CycleContext {
    gateway: Arc<dyn ExchangeGateway>,
    resolver: ExpectedStateResolver,
    detector: DriftDetector,
    engine: RemediationEngine,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<dyn MetricsSink>,
    config: Arc<PalisadeConfig>,
    shutdown_rx: watch::Receiver<bool>,
    /// Positions already logged as unmanaged, keyed by (symbol, open
    /// millis) so each position logs once per process lifetime.
    unmanaged_logged: Mutex<HashSet<(String, i64)>>,
}

impl CycleContext {
    async fn reconcile_symbol(&self, position: Position, mode: CycleMode) -> SymbolOutcome {
        let settings = self.config.symbol_settings(&position.symbol);

        let live_orders = match self
            .gateway
            .list_open_plan_orders(&position.symbol)
            .await
        {
            Ok(orders) => orders,
            Err(e) if e.is_auth() => {
                return SymbolOutcome {
                    record: None,
                    auth_failed: true,
                }
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "plan-order fetch failed, skipping symbol");
                return SymbolOutcome {
                    record: None,
                    auth_failed: false,
                };
            }
        };

        let resolution = match self.resolver.resolve(&position).await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "signal store lookup failed, skipping symbol");
                return SymbolOutcome {
                    record: None,
                    auth_failed: false,
                };
            }
        };

        let expected = match resolution {
            Resolution::Managed(expected) => expected,
            Resolution::Unmanaged => {
                self.log_unmanaged_once(&position);
                let record = DriftRecord::unmanaged(position.symbol.clone(), Utc::now());
                self.metrics.drift_detected(DriftClass::Unmanaged);
                return SymbolOutcome {
                    record: Some(record),
                    auth_failed: false,
                };
            }
        };

        let drift = self
            .detector
            .detect(&position, &expected, &live_orders, &settings, Utc::now());
        self.metrics.drift_detected(drift.classification);

        if !drift.classification.needs_remediation() {
            return SymbolOutcome {
                record: Some(drift),
                auth_failed: false,
            };
        }

        info!(
            symbol = %position.symbol,
            classification = %drift.classification,
            missing = drift.missing.len(),
            mismatched = drift.mismatched.len(),
            orphaned = drift.orphaned.len(),
            "drift detected"
        );

        // The drift record must be durable before any repair: a crash
        // in between must leave an explanation for whatever was issued.
        if let Err(e) = self.audit.record_drift(&drift).await {
            error!(symbol = %position.symbol, error = %e, "audit write failed, deferring remediation to next cycle");
            return SymbolOutcome {
                record: Some(drift),
                auth_failed: false,
            };
        }

        if mode == CycleMode::DetectOnly {
            return SymbolOutcome {
                record: Some(drift),
                auth_failed: false,
            };
        }
        if !settings.remediation_enabled {
            debug!(symbol = %position.symbol, "remediation disabled for symbol, detect-only");
            return SymbolOutcome {
                record: Some(drift),
                auth_failed: false,
            };
        }

        let auth_failed = match self
            .engine
            .remediate(&position, &drift, &expected, &self.shutdown_rx)
            .await
        {
            Ok(attempts) => {
                debug!(
                    symbol = %position.symbol,
                    attempts = attempts.len(),
                    "remediation pass finished"
                );
                false
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "remediation hit authentication failure");
                true
            }
        };

        SymbolOutcome {
            record: Some(drift),
            auth_failed,
        }
    }

    fn log_unmanaged_once(&self, position: &Position) {
        let key = (
            position.symbol.clone(),
            position.opened_at.timestamp_millis(),
        );
        if self.unmanaged_logged.lock().insert(key) {
            info!(
                symbol = %position.symbol,
                opened_at = %position.opened_at,
                "position has no originating signal, leaving unmanaged"
            );
        }
    }
}

/// The reconciliation loop.
pub struct ReconcilerRunner {
    ctx: Arc<CycleContext>,
    alerter: DriftAlerter,
    notifier: Arc<dyn NotificationSink>,
    metrics: Arc<dyn MetricsSink>,
    config: Arc<PalisadeConfig>,
    shutdown_tx: watch::Sender<bool>,
    degraded: AtomicBool,
}

impl ReconcilerRunner {
    /// Wires up a runner from its collaborators and configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configured mutation quota is zero; call
    /// [`PalisadeConfig::validate`] first.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn TargetStore>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<dyn MetricsSink>,
        notifier: Arc<dyn NotificationSink>,
        config: Arc<PalisadeConfig>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let quota = NonZeroU32::new(config.exchange.mutations_per_minute)
            .expect("validated config has a positive mutation quota");

        let resolver = ExpectedStateResolver::new(
            Arc::clone(&store),
            config.reconciler.target_staleness,
        );
        let detector = DriftDetector::new(config.reconciler.take_profit_policy);
        let engine = RemediationEngine::new(
            Arc::clone(&gateway),
            Arc::clone(&audit),
            Arc::clone(&metrics),
            Arc::clone(&notifier),
            quota,
            config.reconciler.retry.clone(),
            config.reconciler.take_profit_policy,
        );
        let alerter = DriftAlerter::new(
            Arc::clone(&notifier),
            config.reconciler.alert_after_cycles,
        );

        let ctx = Arc::new(CycleContext {
            gateway,
            resolver,
            detector,
            engine,
            audit,
            metrics: Arc::clone(&metrics),
            config: Arc::clone(&config),
            shutdown_rx,
            unmanaged_logged: Mutex::new(HashSet::new()),
        });

        Self {
            ctx,
            alerter,
            notifier,
            metrics,
            config,
            shutdown_tx,
            degraded: AtomicBool::new(false),
        }
    }

    /// Returns a handle that can stop the loop from another task.
    #[must_use]
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Returns true while the loop is in detection-only degraded mode.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Runs the loop until a shutdown is requested.
    pub async fn run(&self) {
        let interval = self.config.reconciler.poll_interval;
        let deadline = self.config.reconciler.cycle_deadline;
        let drain = self.config.reconciler.shutdown_timeout;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(
            interval_secs = interval.as_secs(),
            deadline_secs = deadline.as_secs(),
            "reconciler loop starting"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => break,
            }

            let started = Instant::now();
            {
                let cycle = tokio::time::timeout(deadline, self.run_cycle());
                tokio::pin!(cycle);

                let timed_out = tokio::select! {
                    result = &mut cycle => result.is_err(),
                    _ = shutdown_rx.changed() => {
                        // Drain: the cycle sees the same shutdown signal and
                        // stops starting new repairs; give in-flight ones a
                        // bounded window to land.
                        info!(drain_secs = drain.as_secs(), "shutdown requested, draining cycle");
                        !matches!(tokio::time::timeout(drain, &mut cycle).await, Ok(Ok(())))
                    }
                };

                if timed_out {
                    self.metrics.cycle_aborted();
                    warn!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "cycle aborted at deadline; idempotent repairs re-verify next pass"
                    );
                }
            }

            if *shutdown_rx.borrow() {
                break;
            }

            for _ in 0..skipped_ticks(started.elapsed(), interval) {
                self.metrics.tick_skipped();
            }
        }

        info!("reconciler loop stopped");
    }

    /// Runs one full reconciliation cycle.
    async fn run_cycle(&self) {
        let mode = if self.is_degraded() {
            CycleMode::DetectOnly
        } else {
            CycleMode::Full
        };

        match self.execute_pass(mode).await {
            Ok(CyclePass {
                records,
                auth_failed,
            }) => {
                let non_ok = records
                    .iter()
                    .filter(|r| r.classification.needs_remediation())
                    .count() as u64;
                self.metrics.set_symbols_in_drift(non_ok);
                self.alerter.observe_cycle(&records).await;

                if auth_failed {
                    self.enter_degraded();
                } else if self.is_degraded() {
                    // The authenticated fetches all succeeded again.
                    self.leave_degraded().await;
                }

                self.metrics.cycle_completed();
            }
            Err(CycleError::Auth) => {
                self.enter_degraded();
            }
            Err(CycleError::Transient) => {
                // Logged at the failure site; next tick retries.
            }
        }

        if self.is_degraded() {
            self.notify_degraded().await;
        }
    }

    /// Runs one detection-only pass and returns its records; used by the
    /// `check` command.
    ///
    /// # Errors
    ///
    /// Returns an error if the position snapshot cannot be fetched.
    pub async fn detection_pass(&self) -> anyhow::Result<Vec<DriftRecord>> {
        match self.execute_pass(CycleMode::DetectOnly).await {
            Ok(pass) => Ok(pass.records),
            Err(CycleError::Auth) => anyhow::bail!("exchange rejected credentials"),
            Err(CycleError::Transient) => anyhow::bail!("position snapshot unavailable"),
        }
    }

    async fn execute_pass(&self, mode: CycleMode) -> Result<CyclePass, CycleError> {
        let positions = match self.ctx.gateway.list_open_positions().await {
            Ok(positions) => positions,
            Err(e) if e.is_auth() => {
                error!(error = %e, "position snapshot rejected: credentials invalid");
                return Err(CycleError::Auth);
            }
            Err(e) => {
                warn!(error = %e, "position snapshot failed, skipping cycle");
                return Err(CycleError::Transient);
            }
        };

        debug!(positions = positions.len(), mode = ?mode, "cycle snapshot fetched");

        let semaphore = Arc::new(Semaphore::new(
            self.config.reconciler.max_concurrent_symbols,
        ));
        let mut tasks: JoinSet<SymbolOutcome> = JoinSet::new();

        for position in positions {
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("cycle semaphore never closes");
                ctx.reconcile_symbol(position, mode).await
            });
        }

        let mut records = Vec::new();
        let mut auth_failed = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    auth_failed |= outcome.auth_failed;
                    if let Some(record) = outcome.record {
                        records.push(record);
                    }
                }
                Err(e) => error!(error = %e, "symbol task panicked"),
            }
        }

        Ok(CyclePass {
            records,
            auth_failed,
        })
    }

    fn enter_degraded(&self) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            self.metrics.set_degraded(true);
            error!("entering degraded mode: remediation suspended, detection continues");
        }
    }

    async fn leave_degraded(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            self.metrics.set_degraded(false);
            info!("credentials confirmed valid, resuming remediation");
            let notice = DriftNotice {
                severity: NoticeSeverity::Info,
                symbol: ACCOUNT_SCOPE.to_string(),
                classification: DriftClass::Ok,
                detail: "credentials recovered, remediation resumed".to_string(),
            };
            if let Err(e) = self.notifier.notify(notice).await {
                warn!(error = %e, "notification sink failed");
            }
        }
    }

    /// Degraded mode alerts on every cycle until credentials recover.
    async fn notify_degraded(&self) {
        let notice = DriftNotice {
            severity: NoticeSeverity::Critical,
            symbol: ACCOUNT_SCOPE.to_string(),
            classification: DriftClass::Missing,
            detail: "authentication failing: positions are not being repaired".to_string(),
        };
        if let Err(e) = self.notifier.notify(notice).await {
            warn!(error = %e, "notification sink failed");
        }
    }
}

struct CyclePass {
    records: Vec<DriftRecord>,
    auth_failed: bool,
}

enum CycleError {
    Auth,
    Transient,
}

/// Number of cadence ticks a cycle of `elapsed` duration swallowed.
fn skipped_ticks(elapsed: Duration, interval: Duration) -> u64 {
    if interval.is_zero() || elapsed <= interval {
        return 0;
    }
    (elapsed.as_nanos() / interval.as_nanos().max(1)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_ticks_none_for_fast_cycle() {
        assert_eq!(
            skipped_ticks(Duration::from_millis(10), Duration::from_millis(100)),
            0
        );
        assert_eq!(
            skipped_ticks(Duration::from_millis(100), Duration::from_millis(100)),
            0
        );
    }

    #[test]
    fn test_skipped_ticks_counts_overruns() {
        assert_eq!(
            skipped_ticks(Duration::from_millis(250), Duration::from_millis(100)),
            2
        );
        assert_eq!(
            skipped_ticks(Duration::from_secs(90), Duration::from_secs(30)),
            3
        );
    }

    #[test]
    fn test_skipped_ticks_zero_interval() {
        assert_eq!(skipped_ticks(Duration::from_secs(1), Duration::ZERO), 0);
    }

    #[test]
    fn test_handle_signals_shutdown() {
        let (tx, rx) = watch::channel(false);
        let handle = RunnerHandle { shutdown_tx: tx };
        assert!(!*rx.borrow());
        handle.shutdown();
        assert!(*rx.borrow());
    }
}
