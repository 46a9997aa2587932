use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order/fill side as the exchange encodes it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Bid => Self::Ask,
            Self::Ask => Self::Bid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub symbol: String,
    #[serde(default)]
    pub base_symbol: Option<String>,
    #[serde(default)]
    pub quote_symbol: Option<String>,
    #[serde(default)]
    pub market_type: Option<String>,
}

impl Market {
    #[must_use]
    pub fn is_perp(&self) -> bool {
        self.market_type.as_deref() == Some("PERP") || self.symbol.ends_with("_PERP")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    pub last_price: Decimal,
    #[serde(default)]
    pub price_change_percent: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<Decimal>,
    #[serde(default)]
    pub quote_volume: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kline {
    pub start: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    #[serde(default)]
    pub trades: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    #[serde(default)]
    pub maker_fee_bps: Option<Decimal>,
    #[serde(default)]
    pub taker_fee_bps: Option<Decimal>,
    #[serde(default)]
    pub leverage_limit: Option<Decimal>,
    #[serde(default)]
    pub auto_repay_borrows: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollateralAsset {
    pub symbol: String,
    #[serde(default)]
    pub total_quantity: Option<Decimal>,
    #[serde(default)]
    pub available_quantity: Option<Decimal>,
    #[serde(default)]
    pub lend_quantity: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collateral {
    #[serde(default)]
    pub assets: Vec<CollateralAsset>,
    #[serde(default)]
    pub net_equity: Option<Decimal>,
    #[serde(default)]
    pub net_equity_available: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: String,
    pub quantity: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub trigger_price: Option<Decimal>,
    #[serde(default)]
    pub reduce_only: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl OpenOrder {
    #[must_use]
    pub fn is_reduce_only(&self) -> bool {
        self.reduce_only.unwrap_or(false)
    }
}

/// Open perp position as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub net_quantity: Decimal,
    #[serde(default)]
    pub avg_entry_price: Option<Decimal>,
    #[serde(default)]
    pub mark_price: Option<Decimal>,
    #[serde(default)]
    pub pnl_unrealized: Option<Decimal>,
}

impl Position {
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.net_quantity.is_zero()
    }
}

/// One execution report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fee: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: String,
    pub quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<String>,
}

impl PlaceOrderRequest {
    #[must_use]
    pub fn market(symbol: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: "Market".to_string(),
            quantity,
            price: None,
            trigger_price: None,
            reduce_only: None,
            post_only: None,
            client_id: None,
            time_in_force: None,
        }
    }

    #[must_use]
    pub fn limit(symbol: impl Into<String>, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: "Limit".to_string(),
            quantity,
            price: Some(price),
            trigger_price: None,
            reduce_only: None,
            post_only: None,
            client_id: None,
            time_in_force: None,
        }
    }

    /// Reduce-only stop used by the trailing engine and take-profit monitor.
    #[must_use]
    pub fn reduce_only_stop(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        trigger_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: "Market".to_string(),
            quantity,
            price: None,
            trigger_price: Some(trigger_price),
            reduce_only: Some(true),
            post_only: None,
            client_id: None,
            time_in_force: None,
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub fn with_post_only(mut self, post_only: bool) -> Self {
        self.post_only = post_only.then_some(true);
        self
    }
}

/// Acknowledgement returned by order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// Error body the exchange returns alongside non-2xx statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fill_deserializes_with_bid_ask_side() {
        let json = r#"{
            "symbol": "SOL_USDC_PERP",
            "side": "Bid",
            "quantity": "2",
            "price": "100.5",
            "clientId": "1_7_1",
            "timestamp": "2025-06-01T10:00:00Z"
        }"#;
        let fill: Fill = serde_json::from_str(json).unwrap();
        assert_eq!(fill.side, Side::Bid);
        assert_eq!(fill.quantity, dec!(2));
        assert_eq!(fill.price, dec!(100.5));
        assert_eq!(fill.client_id.as_deref(), Some("1_7_1"));
    }

    #[test]
    fn position_deserializes_net_quantity() {
        let json = r#"{"symbol":"BTC_USDC_PERP","netQuantity":"-0.5","avgEntryPrice":"64000"}"#;
        let position: Position = serde_json::from_str(json).unwrap();
        assert_eq!(position.net_quantity, dec!(-0.5));
        assert!(position.is_open());
        assert_eq!(position.avg_entry_price, Some(dec!(64000)));
    }

    #[test]
    fn open_order_reduce_only_defaults_false() {
        let json = r#"{
            "id": "123", "symbol": "SOL_USDC_PERP", "side": "Ask",
            "orderType": "Limit", "quantity": "1", "price": "105"
        }"#;
        let order: OpenOrder = serde_json::from_str(json).unwrap();
        assert!(!order.is_reduce_only());
    }

    #[test]
    fn place_order_request_skips_absent_fields() {
        let req = PlaceOrderRequest::market("SOL_USDC_PERP", Side::Bid, dec!(1));
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("price").is_none());
        assert!(json.get("reduceOnly").is_none());
        assert_eq!(json["orderType"], "Market");
    }

    #[test]
    fn reduce_only_stop_carries_trigger() {
        let req = PlaceOrderRequest::reduce_only_stop("SOL_USDC_PERP", Side::Ask, dec!(2), dec!(98));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["triggerPrice"], "98");
        assert_eq!(json["reduceOnly"], true);
    }

    #[test]
    fn side_opposite() {
        assert_eq!(Side::Bid.opposite(), Side::Ask);
        assert_eq!(Side::Ask.opposite(), Side::Bid);
    }
}
