pub mod config;
pub mod config_loader;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{
    ExchangeConfig, PalisadeConfig, ReconcilerConfig, RetryConfig, SymbolOverride, SymbolSettings,
    SymbolTable, TakeProfitPolicy,
};
pub use config_loader::ConfigLoader;
pub use error::{GatewayError, GatewayResult};
pub use traits::{
    AuditSink, ExchangeGateway, MetricsSink, NotificationSink, TargetStore,
};
pub use types::{
    AcceptedSignal, AttemptOutcome, ClientOid, DriftClass, DriftRecord, LivePlanOrder, Mismatch,
    MismatchField, PlanOrderKind, PlanOrderSpec, PlanOrderStatus, Position, PositionSide,
    RemediationAction, RemediationAttempt, TakeProfitLeg, TargetKind, ExpectedTarget,
    NoticeSeverity, DriftNotice,
};
