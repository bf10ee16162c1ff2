//! Shared test doubles: a scriptable in-memory exchange gateway.
#![allow(dead_code)] // each test binary uses a different slice of this module

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use palisade_core::{
    AcceptedSignal, ExchangeGateway, GatewayError, LivePlanOrder, PlanOrderSpec, PlanOrderStatus,
    Position, PositionSide, TakeProfitLeg,
};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// A recorded gateway mutation, with arrival time for rate-limit asserts.
#[derive(Debug, Clone)]
pub enum GatewayCall {
    Place {
        symbol: String,
        client_oid: String,
        at: Instant,
    },
    Cancel {
        symbol: String,
        order_id: String,
        at: Instant,
    },
}

impl GatewayCall {
    pub fn at(&self) -> Instant {
        match self {
            Self::Place { at, .. } | Self::Cancel { at, .. } => *at,
        }
    }
}

/// Scripted behavior for the next place calls, consumed in order.
#[derive(Debug)]
pub enum PlaceScript {
    /// Return a timeout; `lands` controls whether the order was actually
    /// created on the exchange despite the lost response.
    Timeout { lands: bool },
    /// Return this error without creating anything.
    Fail(GatewayError),
}

/// In-memory exchange double with idempotent client-oid semantics.
#[derive(Default)]
pub struct MockGateway {
    positions: Mutex<Vec<Position>>,
    plan_orders: Mutex<HashMap<String, Vec<LivePlanOrder>>>,
    calls: Mutex<Vec<GatewayCall>>,
    place_script: Mutex<VecDeque<PlaceScript>>,
    auth_broken: AtomicBool,
    next_id: AtomicU64,
    seen_oids: Mutex<HashSet<String>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.lock() = positions;
    }

    pub fn set_plan_orders(&self, symbol: &str, orders: Vec<LivePlanOrder>) {
        for order in &orders {
            if let Some(oid) = &order.client_oid {
                self.seen_oids.lock().insert(oid.clone());
            }
        }
        self.plan_orders.lock().insert(symbol.to_string(), orders);
    }

    pub fn plan_orders(&self, symbol: &str) -> Vec<LivePlanOrder> {
        self.plan_orders
            .lock()
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn script_place(&self, script: PlaceScript) {
        self.place_script.lock().push_back(script);
    }

    pub fn set_auth_broken(&self, broken: bool) {
        self.auth_broken.store(broken, Ordering::SeqCst);
    }

    fn create_order(&self, spec: &PlanOrderSpec) -> String {
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let order = LivePlanOrder {
            id: id.clone(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            kind: spec.kind,
            trigger_price: spec.trigger_price,
            size: spec.size,
            client_oid: Some(spec.client_oid.as_str().to_string()),
            status: PlanOrderStatus::Live,
        };
        self.plan_orders
            .lock()
            .entry(spec.symbol.clone())
            .or_default()
            .push(order);
        id
    }

    fn check_auth(&self) -> Result<(), GatewayError> {
        if self.auth_broken.load(Ordering::SeqCst) {
            Err(GatewayError::Authentication("apikey expired".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn list_open_positions(&self) -> Result<Vec<Position>, GatewayError> {
        self.check_auth()?;
        Ok(self.positions.lock().clone())
    }

    async fn list_open_plan_orders(
        &self,
        symbol: &str,
    ) -> Result<Vec<LivePlanOrder>, GatewayError> {
        self.check_auth()?;
        Ok(self.plan_orders(symbol))
    }

    async fn place_plan_order(&self, spec: &PlanOrderSpec) -> Result<String, GatewayError> {
        self.check_auth()?;
        self.calls.lock().push(GatewayCall::Place {
            symbol: spec.symbol.clone(),
            client_oid: spec.client_oid.as_str().to_string(),
            at: Instant::now(),
        });

        if let Some(script) = self.place_script.lock().pop_front() {
            match script {
                PlaceScript::Timeout { lands } => {
                    if lands {
                        self.seen_oids
                            .lock()
                            .insert(spec.client_oid.as_str().to_string());
                        self.create_order(spec);
                    }
                    return Err(GatewayError::Timeout("response lost".to_string()));
                }
                PlaceScript::Fail(err) => return Err(err),
            }
        }

        if !self
            .seen_oids
            .lock()
            .insert(spec.client_oid.as_str().to_string())
        {
            return Err(GatewayError::duplicate(spec.client_oid.as_str()));
        }

        Ok(self.create_order(spec))
    }

    async fn cancel_plan_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        self.check_auth()?;
        self.calls.lock().push(GatewayCall::Cancel {
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
            at: Instant::now(),
        });

        let mut orders = self.plan_orders.lock();
        let list = orders.entry(symbol.to_string()).or_default();
        let before = list.len();
        list.retain(|o| o.id != order_id);
        if list.len() == before {
            return Err(GatewayError::order_not_found(order_id));
        }
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn opened_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap()
}

pub fn btc_position() -> Position {
    Position {
        symbol: "BTCUSDT".to_string(),
        side: PositionSide::Long,
        size: dec!(0.5),
        entry_price: dec!(60000),
        opened_at: opened_at(),
    }
}

pub fn btc_signal() -> AcceptedSignal {
    AcceptedSignal {
        symbol: "BTCUSDT".to_string(),
        side: PositionSide::Long,
        entry_price: dec!(60000),
        stop_loss: dec!(58800),
        take_profits: vec![
            TakeProfitLeg {
                price: dec!(61800),
                fraction: dec!(0.5),
            },
            TakeProfitLeg {
                price: dec!(63000),
                fraction: dec!(0.5),
            },
        ],
        accepted_at: opened_at() - chrono::Duration::minutes(1),
    }
}
