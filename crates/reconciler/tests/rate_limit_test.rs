//! Rate-limit compliance: mutations across many drifted symbols share one
//! token bucket and queue rather than burst past the quota.

mod common;

use common::MockGateway;
use governor::Quota;
use palisade_core::{
    DriftClass, DriftRecord, ExpectedTarget, Position, PositionSide, RetryConfig,
    TakeProfitPolicy, TargetKind,
};
use palisade_reconciler::{
    CapturingNotifier, InProcessMetrics, MemoryAuditStore, RemediationEngine,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn position(symbol: &str) -> Position {
    Position {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        size: dec!(1),
        entry_price: dec!(100),
        opened_at: chrono::Utc::now(),
    }
}

fn target(symbol: &str) -> ExpectedTarget {
    ExpectedTarget {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        stop_loss: dec!(98),
        take_profits: Vec::new(),
    }
}

fn missing_stop(symbol: &str) -> DriftRecord {
    DriftRecord {
        symbol: symbol.to_string(),
        classification: DriftClass::Missing,
        missing: vec![TargetKind::StopLoss],
        mismatched: Vec::new(),
        orphaned: Vec::new(),
        detected_at: chrono::Utc::now(),
    }
}

/// One mutation per 100ms, no burst: a compressed model of the production
/// one-token-per-`60s/quota` shape, so any rolling window holds at most
/// `window/period + 1` mutations.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutations_queue_behind_shared_bucket() {
    let gateway = Arc::new(MockGateway::new());
    let engine = Arc::new(RemediationEngine::with_quota(
        gateway.clone(),
        Arc::new(MemoryAuditStore::new()),
        Arc::new(InProcessMetrics::new()),
        Arc::new(CapturingNotifier::new()),
        Quota::with_period(Duration::from_millis(100)).unwrap(),
        RetryConfig {
            max_retries: 0,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        },
        TakeProfitPolicy::Renormalize,
    ));
    let (_tx, shutdown) = watch::channel(false);

    let symbols: Vec<String> = (0..10).map(|i| format!("SYM{i}USDT")).collect();

    let mut handles = Vec::new();
    for symbol in &symbols {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown.clone();
        let symbol = symbol.clone();
        handles.push(tokio::spawn(async move {
            engine
                .remediate(
                    &position(&symbol),
                    &missing_stop(&symbol),
                    &target(&symbol),
                    &shutdown,
                )
                .await
                .unwrap()
        }));
    }

    // Midway through the queue only a fraction of the mutations may have
    // gone out: ~5 tokens in 500ms, plus generous scheduling slack.
    tokio::time::sleep(Duration::from_millis(450)).await;
    let midway = gateway.mutation_count();
    assert!(
        midway <= 7,
        "expected at most 7 mutations after 450ms, saw {midway}"
    );

    for handle in handles {
        let attempts = handle.await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].outcome.is_success());
    }

    // All ten eventually went through; none burst-failed.
    let calls = gateway.calls();
    assert_eq!(calls.len(), 10);

    // No rolling 500ms window saw more than 6 mutations (5 periods + 1
    // in-flight at the boundary).
    let mut times: Vec<_> = calls.iter().map(common::GatewayCall::at).collect();
    times.sort();
    for (i, start) in times.iter().enumerate() {
        let in_window = times[i..]
            .iter()
            .take_while(|t| t.duration_since(*start) < Duration::from_millis(500))
            .count();
        assert!(
            in_window <= 6,
            "rolling 500ms window starting at call {i} held {in_window} mutations"
        );
    }
}
