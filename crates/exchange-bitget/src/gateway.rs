//! [`ExchangeGateway`] implementation backed by [`BitgetClient`].
//!
//! The gateway owns the symbol table so it can round prices and sizes to
//! each instrument's grid before submission; everything above this layer
//! works in exact decimals.

use crate::client::BitgetClient;
use async_trait::async_trait;
use palisade_core::{
    ExchangeGateway, GatewayError, LivePlanOrder, PalisadeConfig, PlanOrderSpec, Position,
};
use std::sync::Arc;

/// Bitget-backed exchange gateway.
#[derive(Debug, Clone)]
pub struct BitgetGateway {
    client: BitgetClient,
    config: Arc<PalisadeConfig>,
}

impl BitgetGateway {
    /// Wraps a client with the application config used for symbol lookup.
    #[must_use]
    pub fn new(client: BitgetClient, config: Arc<PalisadeConfig>) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ExchangeGateway for BitgetGateway {
    async fn list_open_positions(&self) -> Result<Vec<Position>, GatewayError> {
        self.client.get_positions().await
    }

    async fn list_open_plan_orders(
        &self,
        symbol: &str,
    ) -> Result<Vec<LivePlanOrder>, GatewayError> {
        self.client.get_plan_orders(symbol).await
    }

    async fn place_plan_order(&self, spec: &PlanOrderSpec) -> Result<String, GatewayError> {
        let settings = self.config.symbol_settings(&spec.symbol);
        self.client.place_tpsl(spec, &settings).await
    }

    async fn cancel_plan_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        self.client.cancel_plan(symbol, order_id).await
    }
}
