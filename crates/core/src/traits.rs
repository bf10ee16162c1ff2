use crate::error::GatewayError;
use crate::types::{
    AcceptedSignal, AttemptOutcome, DriftClass, DriftNotice, DriftRecord, LivePlanOrder,
    PlanOrderSpec, Position, RemediationAttempt,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn list_open_positions(&self) -> Result<Vec<Position>, GatewayError>;
    async fn list_open_plan_orders(&self, symbol: &str)
        -> Result<Vec<LivePlanOrder>, GatewayError>;
    async fn place_plan_order(&self, spec: &PlanOrderSpec) -> Result<String, GatewayError>;
    async fn cancel_plan_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Closest accepted signal at or before `opened_at` for the symbol.
    async fn lookup_expected_target(
        &self,
        symbol: &str,
        opened_at: DateTime<Utc>,
    ) -> Result<Option<AcceptedSignal>>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_drift(&self, record: &DriftRecord) -> Result<()>;
    async fn record_attempt(&self, attempt: &RemediationAttempt) -> Result<()>;
}

pub trait MetricsSink: Send + Sync {
    fn drift_detected(&self, class: DriftClass);
    fn attempt_recorded(&self, outcome: &AttemptOutcome);
    fn cycle_completed(&self);
    fn cycle_aborted(&self);
    fn tick_skipped(&self);
    fn set_symbols_in_drift(&self, count: u64);
    fn set_degraded(&self, degraded: bool);
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notice: DriftNotice) -> Result<()>;
}
