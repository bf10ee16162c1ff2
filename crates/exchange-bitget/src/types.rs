//! Raw Bitget V2 mix wire types and domain conversions.
//!
//! The API speaks strings for every number and millisecond epochs for every
//! timestamp; everything is converted into [`palisade_core`] domain types at
//! this boundary so nothing above it handles wire formats.

use chrono::{DateTime, TimeZone, Utc};
use palisade_core::{
    GatewayError, LivePlanOrder, PlanOrderKind, PlanOrderStatus, Position, PositionSide,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Envelope
// =============================================================================

/// Standard Bitget response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct BitgetEnvelope<T> {
    /// Business code; `"00000"` means success.
    pub code: String,

    /// Human-readable message.
    pub msg: String,

    /// Payload, absent on errors.
    pub data: Option<T>,
}

impl<T> BitgetEnvelope<T> {
    /// Success code returned by every Bitget V2 endpoint.
    pub const OK: &'static str = "00000";

    /// Returns true if the envelope carries a successful response.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == Self::OK
    }
}

// =============================================================================
// Positions
// =============================================================================

/// Raw position row from `GET /api/v2/mix/position/all-position`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    pub symbol: String,
    pub hold_side: String,
    pub total: String,
    #[serde(default)]
    pub available: Option<String>,
    pub open_price_avg: String,
    #[serde(rename = "cTime")]
    pub c_time: String,
}

impl RawPosition {
    /// Converts into a domain position.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Serialization`] on malformed numbers, sides,
    /// or timestamps.
    pub fn into_position(self) -> Result<Position, GatewayError> {
        let side = parse_side(&self.hold_side)?;
        let size = parse_decimal(&self.total, "total")?;
        let entry_price = parse_decimal(&self.open_price_avg, "openPriceAvg")?;
        let opened_at = parse_millis(&self.c_time, "cTime")?;

        Ok(Position {
            symbol: self.symbol,
            side,
            size,
            entry_price,
            opened_at,
        })
    }
}

// =============================================================================
// Plan orders
// =============================================================================

/// Raw pending-plan-order list from
/// `GET /api/v2/mix/order/orders-plan-pending`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlanOrderList {
    #[serde(default)]
    pub entrusted_list: Option<Vec<RawPlanOrder>>,
}

/// Raw plan order row.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlanOrder {
    pub order_id: String,
    #[serde(default)]
    pub client_oid: Option<String>,
    pub symbol: String,
    pub plan_type: String,
    pub trigger_price: String,
    pub size: String,
    #[serde(default, alias = "posSide")]
    pub hold_side: Option<String>,
    #[serde(default, alias = "planStatus")]
    pub status: Option<String>,
}

impl RawPlanOrder {
    /// Converts into a domain plan order.
    ///
    /// Returns `Ok(None)` for plan types the reconciler does not manage
    /// (trailing plans, entry plans).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Serialization`] on malformed fields.
    pub fn into_plan_order(self) -> Result<Option<LivePlanOrder>, GatewayError> {
        let kind = match plan_kind(&self.plan_type) {
            Some(kind) => kind,
            None => return Ok(None),
        };

        let side = match self.hold_side.as_deref() {
            Some(raw) => parse_side(raw)?,
            // TPSL rows always carry a hold side; treat absence as malformed.
            None => {
                return Err(GatewayError::Serialization(format!(
                    "plan order {} has no holdSide",
                    self.order_id
                )))
            }
        };

        Ok(Some(LivePlanOrder {
            id: self.order_id,
            symbol: self.symbol,
            side,
            kind,
            trigger_price: parse_decimal(&self.trigger_price, "triggerPrice")?,
            size: parse_decimal(&self.size, "size")?,
            client_oid: self.client_oid.filter(|s| !s.is_empty()),
            status: parse_status(self.status.as_deref()),
        }))
    }
}

/// Body of `POST /api/v2/mix/order/place-tpsl-order`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceTpslRequest {
    pub margin_coin: String,
    pub product_type: String,
    pub symbol: String,
    pub plan_type: String,
    pub trigger_price: String,
    pub trigger_type: String,
    pub execute_price: String,
    pub hold_side: String,
    pub size: String,
    pub client_oid: String,
}

/// Successful placement payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order_id: Option<String>,
    #[serde(default)]
    pub client_oid: Option<String>,
}

/// Body of `POST /api/v2/mix/order/cancel-plan-order`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelPlanRequest {
    pub order_id: String,
    pub symbol: String,
    pub product_type: String,
    pub margin_coin: String,
}

// =============================================================================
// Parsing helpers
// =============================================================================

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, GatewayError> {
    Decimal::from_str(raw)
        .map_err(|e| GatewayError::Serialization(format!("bad {field} {raw:?}: {e}")))
}

fn parse_millis(raw: &str, field: &str) -> Result<DateTime<Utc>, GatewayError> {
    let millis: i64 = raw
        .parse()
        .map_err(|e| GatewayError::Serialization(format!("bad {field} {raw:?}: {e}")))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| GatewayError::Serialization(format!("bad {field} {raw:?}")))
}

fn parse_side(raw: &str) -> Result<PositionSide, GatewayError> {
    match raw.to_ascii_lowercase().as_str() {
        "long" => Ok(PositionSide::Long),
        "short" => Ok(PositionSide::Short),
        other => Err(GatewayError::Serialization(format!(
            "unknown hold side {other:?}"
        ))),
    }
}

fn plan_kind(raw: &str) -> Option<PlanOrderKind> {
    match raw {
        "pos_loss" | "loss_plan" => Some(PlanOrderKind::StopLoss),
        "pos_profit" | "profit_plan" => Some(PlanOrderKind::TakeProfit),
        _ => None,
    }
}

fn parse_status(raw: Option<&str>) -> PlanOrderStatus {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("executing") => PlanOrderStatus::Executing,
        Some("cancelled" | "canceled") => PlanOrderStatus::Cancelled,
        // The pending endpoint only returns working orders.
        _ => PlanOrderStatus::Live,
    }
}

/// Maps a domain plan kind onto the Bitget TPSL plan type.
#[must_use]
pub fn plan_type_param(kind: PlanOrderKind) -> &'static str {
    match kind {
        PlanOrderKind::StopLoss => "pos_loss",
        PlanOrderKind::TakeProfit => "pos_profit",
    }
}

/// Normalizes a symbol into Bitget V2 raw format (`BTC/USDT:USDT` →
/// `BTCUSDT`).
#[must_use]
pub fn normalize_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Rounds a price to the nearest instrument tick.
#[must_use]
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).round() * tick
}

/// Rounds a size down to the instrument size step.
#[must_use]
pub fn round_down_to_step(size: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return size;
    }
    (size / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // ==================== Envelope Tests ====================

    #[test]
    fn test_envelope_success() {
        let raw = r#"{"code":"00000","msg":"success","data":[]}"#;
        let envelope: BitgetEnvelope<Vec<RawPosition>> = serde_json::from_str(raw).unwrap();
        assert!(envelope.is_ok());
    }

    #[test]
    fn test_envelope_error_without_data() {
        let raw = r#"{"code":"40786","msg":"Duplicate clientOid"}"#;
        let envelope: BitgetEnvelope<PlacedOrder> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.is_ok());
        assert!(envelope.data.is_none());
    }

    // ==================== Position Conversion Tests ====================

    #[test]
    fn test_raw_position_conversion() {
        let raw = r#"{
            "symbol": "BTCUSDT",
            "holdSide": "long",
            "total": "0.5",
            "available": "0.5",
            "openPriceAvg": "60000",
            "cTime": "1717243800000"
        }"#;
        let position: RawPosition = serde_json::from_str(raw).unwrap();
        let position = position.into_position().unwrap();

        assert_eq!(position.symbol, "BTCUSDT");
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.size, dec!(0.5));
        assert_eq!(position.entry_price, dec!(60000));
        assert_eq!(position.opened_at.timestamp_millis(), 1_717_243_800_000);
    }

    #[test]
    fn test_raw_position_bad_decimal() {
        let raw = RawPosition {
            symbol: "BTCUSDT".to_string(),
            hold_side: "long".to_string(),
            total: "not-a-number".to_string(),
            available: None,
            open_price_avg: "60000".to_string(),
            c_time: "1717243800000".to_string(),
        };
        assert!(matches!(
            raw.into_position(),
            Err(GatewayError::Serialization(_))
        ));
    }

    #[test]
    fn test_raw_position_bad_side() {
        let raw = RawPosition {
            symbol: "BTCUSDT".to_string(),
            hold_side: "sideways".to_string(),
            total: "1".to_string(),
            available: None,
            open_price_avg: "60000".to_string(),
            c_time: "1717243800000".to_string(),
        };
        assert!(raw.into_position().is_err());
    }

    // ==================== Plan Order Conversion Tests ====================

    #[test]
    fn test_raw_plan_order_stop_loss() {
        let raw = r#"{
            "orderId": "1111",
            "clientOid": "sllgBTCUSDT1717243800000",
            "symbol": "BTCUSDT",
            "planType": "pos_loss",
            "triggerPrice": "58800",
            "size": "0.5",
            "holdSide": "long",
            "planStatus": "live"
        }"#;
        let order: RawPlanOrder = serde_json::from_str(raw).unwrap();
        let order = order.into_plan_order().unwrap().unwrap();

        assert_eq!(order.kind, PlanOrderKind::StopLoss);
        assert_eq!(order.trigger_price, dec!(58800));
        assert_eq!(order.status, PlanOrderStatus::Live);
        assert!(order.client_oid.is_some());
    }

    #[test]
    fn test_raw_plan_order_unmanaged_type_skipped() {
        let order = RawPlanOrder {
            order_id: "1".to_string(),
            client_oid: None,
            symbol: "BTCUSDT".to_string(),
            plan_type: "moving_plan".to_string(),
            trigger_price: "1".to_string(),
            size: "1".to_string(),
            hold_side: Some("long".to_string()),
            status: None,
        };
        assert!(order.into_plan_order().unwrap().is_none());
    }

    #[test]
    fn test_raw_plan_order_empty_client_oid_is_none() {
        let order = RawPlanOrder {
            order_id: "1".to_string(),
            client_oid: Some(String::new()),
            symbol: "BTCUSDT".to_string(),
            plan_type: "pos_profit".to_string(),
            trigger_price: "61800".to_string(),
            size: "0.25".to_string(),
            hold_side: Some("long".to_string()),
            status: Some("live".to_string()),
        };
        let converted = order.into_plan_order().unwrap().unwrap();
        assert!(converted.client_oid.is_none());
    }

    #[test]
    fn test_legacy_plan_types_map() {
        assert_eq!(plan_kind("loss_plan"), Some(PlanOrderKind::StopLoss));
        assert_eq!(plan_kind("profit_plan"), Some(PlanOrderKind::TakeProfit));
        assert_eq!(plan_kind("normal_plan"), None);
    }

    // ==================== Symbol / Rounding Tests ====================

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("BTC/USDT:USDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("btcusdt"), "BTCUSDT");
        assert_eq!(normalize_symbol("ETH-USDT"), "ETHUSDT");
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(58823.4), dec!(0.5)), dec!(58823.5));
        assert_eq!(round_to_tick(dec!(58823.2), dec!(0.5)), dec!(58823));
        assert_eq!(round_to_tick(dec!(100), dec!(0)), dec!(100));
    }

    #[test]
    fn test_round_down_to_step() {
        assert_eq!(round_down_to_step(dec!(0.2599), dec!(0.001)), dec!(0.259));
        assert_eq!(round_down_to_step(dec!(1), dec!(0.001)), dec!(1));
    }

    #[test]
    fn test_plan_type_param() {
        assert_eq!(plan_type_param(PlanOrderKind::StopLoss), "pos_loss");
        assert_eq!(plan_type_param(PlanOrderKind::TakeProfit), "pos_profit");
    }
}
