//! Bitget V2 mix REST client with rate limiting.
//!
//! Provides typed access to the position and plan-order endpoints the
//! reconciler needs, with client-side governor rate limiting split between
//! read and order-mutation quotas. Mutations across all symbols share one
//! token bucket so the process as a whole stays inside the exchange quota.
//!
//! # Example
//!
//! ```ignore
//! use palisade_bitget::{BitgetClient, BitgetClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = BitgetClient::new(BitgetClientConfig::default())?;
//!     let positions = client.get_positions().await?;
//!     println!("{} open positions", positions.len());
//!     Ok(())
//! }
//! ```

use crate::auth::{BitgetAuth, BitgetAuthConfig};
use crate::types::{
    normalize_symbol, plan_type_param, round_down_to_step, round_to_tick, BitgetEnvelope,
    CancelPlanRequest, PlacedOrder, PlaceTpslRequest, RawPlanOrderList, RawPosition,
};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use nonzero_ext::nonzero;
use palisade_core::{
    ExchangeConfig, GatewayError, LivePlanOrder, PlanOrderSpec, Position, SymbolSettings,
};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

/// Bitget production REST base URL.
pub const BITGET_PROD_URL: &str = "https://api.bitget.com";

/// Margin coin for USDT-futures.
const MARGIN_COIN: &str = "USDT";

/// Business code Bitget returns for a deduplicated client order id.
const CODE_DUPLICATE_CLIENT_OID: &str = "40786";

/// Business codes that mean the credentials are bad.
const AUTH_CODES: [&str; 7] = [
    "40001", "40002", "40003", "40006", "40009", "40012", "40037",
];

/// Business codes for plan orders that no longer exist.
const NOT_FOUND_CODES: [&str; 3] = ["40109", "43001", "43025"];

/// Business codes for order-parameter rejections (price bounds, minimum
/// size, precision).
const VALIDATION_CODES: [&str; 4] = ["40020", "40762", "40915", "45110"];

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Bitget client.
#[derive(Debug, Clone)]
pub struct BitgetClientConfig {
    /// REST base URL.
    pub base_url: String,

    /// Per-request timeout.
    pub request_timeout: Duration,

    /// Client-side quota for read endpoints.
    pub reads_per_minute: NonZeroU32,

    /// Client-side quota for place/cancel, shared across all symbols.
    pub mutations_per_minute: NonZeroU32,

    /// Product type for the mix API.
    pub product_type: String,

    /// Credential environment variable names.
    pub auth_config: BitgetAuthConfig,
}

impl Default for BitgetClientConfig {
    fn default() -> Self {
        Self {
            base_url: BITGET_PROD_URL.to_string(),
            request_timeout: Duration::from_secs(10),
            reads_per_minute: nonzero!(240u32),
            mutations_per_minute: nonzero!(60u32),
            product_type: "USDT-FUTURES".to_string(),
            auth_config: BitgetAuthConfig::default(),
        }
    }
}

impl BitgetClientConfig {
    /// Builds a client config from the application exchange section.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Configuration`] if a quota is zero.
    pub fn from_exchange_config(config: &ExchangeConfig) -> Result<Self, GatewayError> {
        let reads = NonZeroU32::new(config.reads_per_minute).ok_or_else(|| {
            GatewayError::Configuration("reads_per_minute must be positive".to_string())
        })?;
        let mutations = NonZeroU32::new(config.mutations_per_minute).ok_or_else(|| {
            GatewayError::Configuration("mutations_per_minute must be positive".to_string())
        })?;

        Ok(Self {
            base_url: config.base_url.clone(),
            request_timeout: config.request_timeout,
            reads_per_minute: reads,
            mutations_per_minute: mutations,
            product_type: config.product_type.clone(),
            auth_config: BitgetAuthConfig::default().with_env_vars(
                config.api_key_env.clone(),
                config.api_secret_env.clone(),
                config.passphrase_env.clone(),
            ),
        })
    }

    /// Sets the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the mutation quota.
    #[must_use]
    pub fn with_mutations_per_minute(mut self, quota: NonZeroU32) -> Self {
        self.mutations_per_minute = quota;
        self
    }
}

// =============================================================================
// Client
// =============================================================================

type GovernorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Rate-limited Bitget V2 mix REST client.
///
/// Cloning is cheap; clones share the underlying limiters and connection
/// pool.
#[derive(Clone)]
pub struct BitgetClient {
    http: Client,
    auth: Arc<BitgetAuth>,
    config: Arc<BitgetClientConfig>,
    read_limiter: Arc<GovernorLimiter>,
    mutation_limiter: Arc<GovernorLimiter>,
}

impl BitgetClient {
    /// Creates a client, loading credentials from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Configuration`] if credentials are missing or
    /// the HTTP client cannot be built.
    pub fn new(config: BitgetClientConfig) -> Result<Self, GatewayError> {
        let auth = BitgetAuth::from_env(&config.auth_config)?;
        Self::with_auth(config, auth)
    }

    /// Creates a client with explicit credentials (used by tests).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Configuration`] if the HTTP client cannot be
    /// built.
    pub fn with_auth(config: BitgetClientConfig, auth: BitgetAuth) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(format!("http client: {e}")))?;

        let read_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(
            config.reads_per_minute,
        )));
        let mutation_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(
            config.mutations_per_minute,
        )));

        Ok(Self {
            http,
            auth: Arc::new(auth),
            config: Arc::new(config),
            read_limiter,
            mutation_limiter,
        })
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Fetches all open positions with non-zero size.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] on transport or envelope failure.
    pub async fn get_positions(&self) -> Result<Vec<Position>, GatewayError> {
        self.read_limiter.until_ready().await;

        let query = format!(
            "productType={}&marginCoin={MARGIN_COIN}",
            self.config.product_type
        );
        let rows: Vec<RawPosition> = self
            .get_json("/api/v2/mix/position/all-position", &query)
            .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            let position = row.into_position()?;
            if position.size > Decimal::ZERO {
                positions.push(position);
            }
        }

        debug!(count = positions.len(), "fetched open positions");
        Ok(positions)
    }

    /// Fetches pending TPSL plan orders for one symbol.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] on transport or envelope failure.
    pub async fn get_plan_orders(&self, symbol: &str) -> Result<Vec<LivePlanOrder>, GatewayError> {
        self.read_limiter.until_ready().await;

        let query = format!(
            "planType=profit_loss&productType={}&symbol={}",
            self.config.product_type,
            normalize_symbol(symbol)
        );
        let list: RawPlanOrderList = self
            .get_json("/api/v2/mix/order/orders-plan-pending", &query)
            .await?;

        let mut orders = Vec::new();
        for row in list.entrusted_list.unwrap_or_default() {
            if let Some(order) = row.into_plan_order()? {
                orders.push(order);
            }
        }

        debug!(symbol, count = orders.len(), "fetched plan orders");
        Ok(orders)
    }

    /// Places a TPSL plan order with the spec's deterministic client oid.
    ///
    /// Prices and sizes are rounded to the instrument grid before
    /// submission so exchange-side rounding cannot produce phantom drift on
    /// the next pass.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DuplicateClientOid`] when the exchange
    /// deduplicated the request; other [`GatewayError`] variants on failure.
    pub async fn place_tpsl(
        &self,
        spec: &PlanOrderSpec,
        settings: &SymbolSettings,
    ) -> Result<String, GatewayError> {
        self.mutation_limiter.until_ready().await;

        let body = PlaceTpslRequest {
            margin_coin: MARGIN_COIN.to_string(),
            product_type: self.config.product_type.clone(),
            symbol: normalize_symbol(&spec.symbol),
            plan_type: plan_type_param(spec.kind).to_string(),
            trigger_price: round_to_tick(spec.trigger_price, settings.tick_size).to_string(),
            trigger_type: "mark_price".to_string(),
            // Empty execute price means market execution on trigger.
            execute_price: String::new(),
            hold_side: spec.side.as_str().to_string(),
            size: round_down_to_step(spec.size, settings.size_step).to_string(),
            client_oid: spec.client_oid.as_str().to_string(),
        };

        let result: Result<PlacedOrder, GatewayError> = self
            .post_json("/api/v2/mix/order/place-tpsl-order", &body)
            .await;

        match result {
            Ok(placed) => {
                let order_id = placed.order_id.unwrap_or_default();
                debug!(
                    symbol = %spec.symbol,
                    order_id = %order_id,
                    client_oid = %spec.client_oid,
                    "plan order placed"
                );
                Ok(order_id)
            }
            Err(GatewayError::Api { code, message, .. })
                if code == CODE_DUPLICATE_CLIENT_OID
                    || message.to_lowercase().contains("duplicate clientoid") =>
            {
                Err(GatewayError::duplicate(spec.client_oid.as_str()))
            }
            Err(e) => Err(e),
        }
    }

    /// Cancels a plan order by exchange id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::OrderNotFound`] when the order is already
    /// gone; other [`GatewayError`] variants on failure.
    pub async fn cancel_plan(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        self.mutation_limiter.until_ready().await;

        let body = CancelPlanRequest {
            order_id: order_id.to_string(),
            symbol: normalize_symbol(symbol),
            product_type: self.config.product_type.clone(),
            margin_coin: MARGIN_COIN.to_string(),
        };

        let result: Result<serde_json::Value, GatewayError> = self
            .post_json("/api/v2/mix/order/cancel-plan-order", &body)
            .await;

        match result {
            Ok(_) => {
                debug!(symbol, order_id, "plan order cancelled");
                Ok(())
            }
            Err(GatewayError::Api { code, message, .. })
                if NOT_FOUND_CODES.contains(&code.as_str())
                    || message.to_lowercase().contains("not exist") =>
            {
                Err(GatewayError::order_not_found(order_id))
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Request plumbing
    // =========================================================================

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<T, GatewayError> {
        let headers = self.auth.sign("GET", path, query, "");
        let url = format!("{}{path}?{query}", self.config.base_url);

        let mut request = self.http.get(&url);
        for (name, value) in headers.as_tuples() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(from_reqwest)?;
        Self::decode(response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayError> {
        let payload = serde_json::to_string(body)
            .map_err(|e| GatewayError::Serialization(e.to_string()))?;
        let headers = self.auth.sign("POST", path, "", &payload);
        let url = format!("{}{path}", self.config.base_url);

        let mut request = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .body(payload);
        for (name, value) in headers.as_tuples() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(from_reqwest)?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(GatewayError::rate_limited(retry_after));
        }

        let text = response.text().await.map_err(from_reqwest)?;

        let envelope: BitgetEnvelope<T> = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                if status >= 500 {
                    return Err(GatewayError::api(status, "", truncate(&text, 200)));
                }
                return Err(GatewayError::Serialization(format!(
                    "bad response body ({status}): {e}"
                )));
            }
        };

        if !envelope.is_ok() {
            warn!(status, code = %envelope.code, msg = %envelope.msg, "exchange rejected request");
            return Err(map_envelope_error(status, &envelope.code, &envelope.msg));
        }

        envelope.data.ok_or_else(|| {
            GatewayError::Serialization("successful envelope without data".to_string())
        })
    }
}

impl std::fmt::Debug for BitgetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitgetClient")
            .field("base_url", &self.config.base_url)
            .field("product_type", &self.config.product_type)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Error mapping
// =============================================================================

fn map_envelope_error(status: u16, code: &str, msg: &str) -> GatewayError {
    if AUTH_CODES.contains(&code) {
        return GatewayError::Authentication(format!("{code}: {msg}"));
    }
    if VALIDATION_CODES.contains(&code) {
        return GatewayError::InvalidOrder(format!("{code}: {msg}"));
    }
    if code == "429" || msg.to_lowercase().contains("too many requests") {
        return GatewayError::rate_limited(None);
    }
    GatewayError::api(status, code, msg)
}

fn from_reqwest(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(err.to_string())
    } else if err.is_connect() {
        GatewayError::Network(format!("connection failed: {err}"))
    } else {
        GatewayError::Network(err.to_string())
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        format!("{}...", &text[..max])
    }
}
