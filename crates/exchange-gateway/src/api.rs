//! The abstract exchange API and its REST implementation.
//!
//! Every operation is safe to retry at the maybe-succeeded boundary: entries
//! carry a client order id encoding the mirror row, cancels report
//! "not found" as a normal outcome.

use crate::types::{
    Balance, CancelAck, ExchangePosition, LotFilter, OrderAck, OrderRecord, OrderState,
    TriggerOrderKind,
};
use async_trait::async_trait;
use copybot_core::types::Side;
use copybot_core::{Error, Result};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::str::FromStr;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Operations the engine needs from the target exchange.
#[cfg_attr(any(test, feature = "test-mocks"), mockall::automock)]
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    /// Open a GTC limit order tagged with a client order id so a
    /// mis-acknowledged order can be re-discovered.
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        price: Decimal,
        amount: Decimal,
        client_order_id: &str,
    ) -> Result<OrderAck>;

    /// Market order that only ever reduces an open position.
    async fn place_reduce_only_market(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
    ) -> Result<OrderAck>;

    /// Stop-market or take-profit-market trigger order.
    async fn place_trigger_order(
        &self,
        symbol: &str,
        side: Side,
        kind: TriggerOrderKind,
        stop_price: Decimal,
        amount: Decimal,
    ) -> Result<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<CancelAck>;

    /// Recent order history for a symbol, trigger orders included.
    async fn order_history(&self, symbol: &str) -> Result<Vec<OrderRecord>>;

    async fn balance(&self) -> Result<Balance>;

    async fn last_price(&self, symbol: &str) -> Result<Decimal>;

    async fn lot_filter(&self, symbol: &str) -> Result<Option<LotFilter>>;

    /// Open positions with their liquidation prices.
    async fn positions(&self) -> Result<Vec<ExchangePosition>>;
}

/// REST client for a Binance-style USDⓈ-M futures API.
pub struct RestExchange {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl RestExchange {
    pub const DEFAULT_BASE_URL: &'static str = "https://fapi.binance.com";

    pub fn new(api_key: String, api_secret: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string()),
            api_key,
            api_secret,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<serde_json::Value> {
        params.push((
            "timestamp".to_string(),
            chrono::Utc::now().timestamp_millis().to_string(),
        ));
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(Error::Api {
                message: format!("{path}: {body}"),
                status: Some(status.as_u16()),
            });
        }
        Ok(body)
    }

    async fn public_request(&self, path: &str, query: &str) -> Result<serde_json::Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(Error::Api {
                message: format!("{path}: {body}"),
                status: Some(status.as_u16()),
            });
        }
        Ok(body)
    }

    fn order_side(side: Side) -> &'static str {
        match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    fn decimal_field(value: &serde_json::Value, key: &str) -> Option<Decimal> {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
    }

    fn order_id_of(body: &serde_json::Value) -> Result<String> {
        body.get("orderId")
            .map(|id| id.to_string().trim_matches('"').to_string())
            .ok_or_else(|| Error::Api {
                message: format!("order response missing orderId: {body}"),
                status: None,
            })
    }
}

/// Error code the exchange returns for a cancel of an unknown order.
const UNKNOWN_ORDER_CODE: &str = "-2011";

#[async_trait]
impl ExchangeApi for RestExchange {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.signed_request(
            reqwest::Method::POST,
            "/fapi/v1/leverage",
            vec![
                ("symbol".into(), symbol.to_string()),
                ("leverage".into(), leverage.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        price: Decimal,
        amount: Decimal,
        client_order_id: &str,
    ) -> Result<OrderAck> {
        let body = self
            .signed_request(
                reqwest::Method::POST,
                "/fapi/v1/order",
                vec![
                    ("symbol".into(), symbol.to_string()),
                    ("side".into(), Self::order_side(side).to_string()),
                    ("type".into(), "LIMIT".into()),
                    ("timeInForce".into(), "GTC".into()),
                    ("quantity".into(), amount.to_string()),
                    ("price".into(), price.to_string()),
                    ("newClientOrderId".into(), client_order_id.to_string()),
                ],
            )
            .await?;
        debug!(symbol, %price, %amount, client_order_id, "Placed limit order");
        Ok(OrderAck {
            order_id: Self::order_id_of(&body)?,
        })
    }

    async fn place_reduce_only_market(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
    ) -> Result<OrderAck> {
        let body = self
            .signed_request(
                reqwest::Method::POST,
                "/fapi/v1/order",
                vec![
                    ("symbol".into(), symbol.to_string()),
                    ("side".into(), Self::order_side(side).to_string()),
                    ("type".into(), "MARKET".into()),
                    ("quantity".into(), amount.to_string()),
                    ("reduceOnly".into(), "true".into()),
                ],
            )
            .await?;
        debug!(symbol, %amount, "Placed reduce-only market order");
        Ok(OrderAck {
            order_id: Self::order_id_of(&body)?,
        })
    }

    async fn place_trigger_order(
        &self,
        symbol: &str,
        side: Side,
        kind: TriggerOrderKind,
        stop_price: Decimal,
        amount: Decimal,
    ) -> Result<OrderAck> {
        let order_type = match kind {
            TriggerOrderKind::StopMarket => "STOP_MARKET",
            TriggerOrderKind::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        };
        let body = self
            .signed_request(
                reqwest::Method::POST,
                "/fapi/v1/order",
                vec![
                    ("symbol".into(), symbol.to_string()),
                    ("side".into(), Self::order_side(side).to_string()),
                    ("type".into(), order_type.into()),
                    ("stopPrice".into(), stop_price.to_string()),
                    ("quantity".into(), amount.to_string()),
                    ("reduceOnly".into(), "true".into()),
                ],
            )
            .await?;
        debug!(symbol, order_type, %stop_price, %amount, "Placed trigger order");
        Ok(OrderAck {
            order_id: Self::order_id_of(&body)?,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<CancelAck> {
        let result = self
            .signed_request(
                reqwest::Method::DELETE,
                "/fapi/v1/order",
                vec![
                    ("symbol".into(), symbol.to_string()),
                    ("orderId".into(), order_id.to_string()),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(CancelAck::Canceled),
            Err(Error::Api { message, .. }) if message.contains(UNKNOWN_ORDER_CODE) => {
                debug!(symbol, order_id, "Cancel target already gone");
                Ok(CancelAck::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    async fn order_history(&self, symbol: &str) -> Result<Vec<OrderRecord>> {
        let body = self
            .signed_request(
                reqwest::Method::GET,
                "/fapi/v1/allOrders",
                vec![
                    ("symbol".into(), symbol.to_string()),
                    ("limit".into(), "100".into()),
                ],
            )
            .await?;

        let orders = body.as_array().cloned().unwrap_or_default();
        Ok(orders
            .iter()
            .filter_map(|o| {
                Some(OrderRecord {
                    order_id: o.get("orderId")?.to_string().trim_matches('"').to_string(),
                    symbol: o.get("symbol")?.as_str()?.to_string(),
                    status: OrderState::from_str(o.get("status")?.as_str()?),
                })
            })
            .collect())
    }

    async fn balance(&self) -> Result<Balance> {
        let body = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/balance", vec![])
            .await?;

        let assets = body.as_array().cloned().unwrap_or_default();
        for asset in &assets {
            if asset.get("asset").and_then(|a| a.as_str()) == Some("USDT") {
                let total = Self::decimal_field(asset, "balance").unwrap_or_default();
                let free = Self::decimal_field(asset, "availableBalance").unwrap_or_default();
                return Ok(Balance { total, free });
            }
        }
        Err(Error::Api {
            message: "no USDT balance entry in response".to_string(),
            status: None,
        })
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal> {
        let body = self
            .public_request("/fapi/v1/ticker/price", &format!("symbol={symbol}"))
            .await?;
        Self::decimal_field(&body, "price").ok_or_else(|| Error::Api {
            message: format!("no last price for {symbol}"),
            status: None,
        })
    }

    async fn lot_filter(&self, symbol: &str) -> Result<Option<LotFilter>> {
        let body = self
            .public_request("/fapi/v1/exchangeInfo", &format!("symbol={symbol}"))
            .await?;

        let filters = body
            .get("symbols")
            .and_then(|s| s.as_array())
            .and_then(|symbols| symbols.first())
            .and_then(|s| s.get("filters"))
            .and_then(|f| f.as_array())
            .cloned()
            .unwrap_or_default();

        for filter in &filters {
            if filter.get("filterType").and_then(|t| t.as_str()) == Some("LOT_SIZE") {
                let min_qty = Self::decimal_field(filter, "minQty");
                let step_size = Self::decimal_field(filter, "stepSize");
                if let (Some(min_qty), Some(step_size)) = (min_qty, step_size) {
                    return Ok(Some(LotFilter { min_qty, step_size }));
                }
            }
        }
        Ok(None)
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>> {
        let body = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", vec![])
            .await?;

        let rows = body.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|p| {
                let amount = Self::decimal_field(p, "positionAmt")?;
                if amount.is_zero() {
                    return None;
                }
                let liquidation_price =
                    Self::decimal_field(p, "liquidationPrice").filter(|px| !px.is_zero());
                Some(ExchangePosition {
                    symbol: p.get("symbol")?.as_str()?.to_string(),
                    amount,
                    entry_price: Self::decimal_field(p, "entryPrice")?,
                    liquidation_price,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic_hex() {
        let exchange = RestExchange::new("key".into(), "secret".into(), None);
        let sig = exchange.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig, exchange.sign("symbol=BTCUSDT&timestamp=1"));
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_order_state_parsing() {
        assert_eq!(OrderState::from_str("FILLED"), OrderState::Filled);
        assert_eq!(OrderState::from_str("NEW"), OrderState::New);
        assert_eq!(OrderState::from_str("EXPIRED"), OrderState::Other);
    }

    #[test]
    fn test_order_id_of_handles_numeric_ids() {
        let body = serde_json::json!({ "orderId": 123456 });
        assert_eq!(RestExchange::order_id_of(&body).unwrap(), "123456");
        let body = serde_json::json!({ "orderId": "abc" });
        assert_eq!(RestExchange::order_id_of(&body).unwrap(), "abc");
    }
}
