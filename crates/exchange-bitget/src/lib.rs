//! Bitget USDT-futures gateway.
//!
//! Implements the [`palisade_core::ExchangeGateway`] port against the Bitget
//! V2 mix REST API: position snapshots, pending TPSL plan orders, idempotent
//! plan-order placement, and plan-order cancellation.
//!
//! # Modules
//!
//! - [`auth`]: HMAC-SHA256 request signing
//! - [`types`]: raw wire types and domain conversions
//! - [`client`]: rate-limited REST client
//! - [`gateway`]: `ExchangeGateway` implementation
//!
//! # Example
//!
//! ```ignore
//! use palisade_bitget::{BitgetClient, BitgetClientConfig, BitgetGateway};
//! use palisade_core::{ExchangeGateway, PalisadeConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = BitgetClient::new(BitgetClientConfig::default())?;
//!     let gateway = BitgetGateway::new(client, Arc::new(PalisadeConfig::default()));
//!     let positions = gateway.list_open_positions().await?;
//!     println!("{} open positions", positions.len());
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod gateway;
pub mod types;

pub use auth::{BitgetAuth, BitgetAuthConfig};
pub use client::{BitgetClient, BitgetClientConfig};
pub use gateway::BitgetGateway;
pub use types::normalize_symbol;
