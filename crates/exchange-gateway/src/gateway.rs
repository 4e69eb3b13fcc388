//! Concurrent, rate-limited batch execution of exchange operations.
//!
//! Every batch fans out through the shared token bucket and pairs each
//! intent with its own outcome; one failed operation never blocks the rest
//! of the batch.

use crate::api::ExchangeApi;
use crate::limiter::RateLimiter;
use crate::types::{
    Balance, BalancePlan, CancelAck, CancelIntent, CloseIntent, LotFilter, OpenIntent, OrderAck,
    OrderState, PartialCloseIntent, TriggerCancelIntent, TriggerIntent,
};
use copybot_core::Result;
use dashmap::DashMap;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Prefix of client order ids; the suffix is the mirror row id.
const CLIENT_ORDER_PREFIX: &str = "MIR";

pub fn client_order_id(position_id: i64) -> String {
    format!("{CLIENT_ORDER_PREFIX}{position_id}")
}

pub struct Gateway {
    api: Arc<dyn ExchangeApi>,
    limiter: Arc<RateLimiter>,
    lot_filters: DashMap<String, LotFilter>,
}

impl Gateway {
    pub fn new(api: Arc<dyn ExchangeApi>, ops_per_second: u32) -> Self {
        Self {
            api,
            limiter: Arc::new(RateLimiter::new(ops_per_second)),
            lot_filters: DashMap::new(),
        }
    }

    /// Place one limit entry order per intent. Leverage is set on the symbol
    /// first; a leverage failure cancels that intent.
    pub async fn open_orders(
        &self,
        intents: Vec<OpenIntent>,
    ) -> Vec<(OpenIntent, Result<OrderAck>)> {
        let futures = intents.into_iter().map(|intent| async move {
            self.limiter.acquire().await;
            if let Err(e) = self.api.set_leverage(&intent.symbol, intent.leverage).await {
                warn!(symbol = %intent.symbol, error = %e, "Leverage change failed, dropping entry");
                return (intent, Err(e));
            }

            self.limiter.acquire().await;
            let ack = self
                .api
                .place_limit_order(
                    &intent.symbol,
                    intent.side,
                    intent.price,
                    intent.amount,
                    &client_order_id(intent.position_id),
                )
                .await;
            (intent, ack)
        });
        join_all(futures).await
    }

    pub async fn cancel_orders(
        &self,
        intents: Vec<CancelIntent>,
    ) -> Vec<(CancelIntent, Result<CancelAck>)> {
        let futures = intents.into_iter().map(|intent| async move {
            self.limiter.acquire().await;
            let ack = self.api.cancel_order(&intent.symbol, &intent.order_id).await;
            (intent, ack)
        });
        join_all(futures).await
    }

    /// Close filled positions with reduce-only market orders on the opposite
    /// side.
    pub async fn close_orders(
        &self,
        intents: Vec<CloseIntent>,
    ) -> Vec<(CloseIntent, Result<OrderAck>)> {
        let futures = intents.into_iter().map(|intent| async move {
            self.limiter.acquire().await;
            let ack = self
                .api
                .place_reduce_only_market(&intent.symbol, intent.side.flip(), intent.amount)
                .await;
            (intent, ack)
        });
        join_all(futures).await
    }

    pub async fn partial_close_orders(
        &self,
        intents: Vec<PartialCloseIntent>,
    ) -> Vec<(PartialCloseIntent, Result<OrderAck>)> {
        let futures = intents.into_iter().map(|intent| async move {
            self.limiter.acquire().await;
            let ack = self
                .api
                .place_reduce_only_market(&intent.symbol, intent.side.flip(), intent.amount)
                .await;
            (intent, ack)
        });
        join_all(futures).await
    }

    pub async fn create_triggers(
        &self,
        intents: Vec<TriggerIntent>,
    ) -> Vec<(TriggerIntent, Result<OrderAck>)> {
        let futures = intents.into_iter().map(|intent| async move {
            self.limiter.acquire().await;
            let ack = self
                .api
                .place_trigger_order(
                    &intent.symbol,
                    intent.position_side.flip(),
                    intent.kind,
                    intent.stop_price,
                    intent.amount,
                )
                .await;
            (intent, ack)
        });
        join_all(futures).await
    }

    pub async fn cancel_triggers(
        &self,
        intents: Vec<TriggerCancelIntent>,
    ) -> Vec<(TriggerCancelIntent, Result<CancelAck>)> {
        let futures = intents.into_iter().map(|intent| async move {
            self.limiter.acquire().await;
            let ack = self.api.cancel_order(&intent.symbol, &intent.order_id).await;
            (intent, ack)
        });
        join_all(futures).await
    }

    /// Exchange order ids with status FILLED across the given symbols.
    /// Per-symbol failures are logged and skipped.
    pub async fn filled_order_ids(&self, symbols: &[String]) -> HashSet<String> {
        let futures = symbols.iter().map(|symbol| async move {
            self.limiter.acquire().await;
            (symbol, self.api.order_history(symbol).await)
        });

        let mut filled = HashSet::new();
        for (symbol, result) in join_all(futures).await {
            match result {
                Ok(orders) => {
                    filled.extend(
                        orders
                            .into_iter()
                            .filter(|o| o.status == OrderState::Filled)
                            .map(|o| o.order_id),
                    );
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "Order history fetch failed"),
            }
        }
        filled
    }

    /// Of `watch_ids`, the ones that show as FILLED in the order history of
    /// the given symbols.
    pub async fn triggered_order_ids(
        &self,
        symbols: &[String],
        watch_ids: &HashSet<String>,
    ) -> HashSet<String> {
        let filled = self.filled_order_ids(symbols).await;
        filled.intersection(watch_ids).cloned().collect()
    }

    /// Last traded price per symbol; failed symbols are omitted.
    pub async fn last_prices(&self, symbols: &[String]) -> HashMap<String, Decimal> {
        let futures = symbols.iter().map(|symbol| async move {
            self.limiter.acquire().await;
            (symbol.clone(), self.api.last_price(symbol).await)
        });

        let mut prices = HashMap::new();
        for (symbol, result) in join_all(futures).await {
            match result {
                Ok(price) => {
                    prices.insert(symbol, price);
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "Last price fetch failed"),
            }
        }
        prices
    }

    /// Lot filters per symbol, served from the in-memory cache when possible.
    pub async fn lot_filters(&self, symbols: &[String]) -> HashMap<String, LotFilter> {
        let mut filters = HashMap::new();
        let mut missing = Vec::new();
        for symbol in symbols {
            match self.lot_filters.get(symbol) {
                Some(filter) => {
                    filters.insert(symbol.clone(), *filter);
                }
                None => missing.push(symbol.clone()),
            }
        }

        let futures = missing.iter().map(|symbol| async move {
            self.limiter.acquire().await;
            (symbol.clone(), self.api.lot_filter(symbol).await)
        });
        for (symbol, result) in join_all(futures).await {
            match result {
                Ok(Some(filter)) => {
                    self.lot_filters.insert(symbol.clone(), filter);
                    filters.insert(symbol, filter);
                }
                Ok(None) => warn!(symbol = %symbol, "Symbol has no lot-size filter"),
                Err(e) => warn!(symbol = %symbol, error = %e, "Lot filter fetch failed"),
            }
        }
        filters
    }

    /// Liquidation price per symbol from the exchange's position endpoint.
    /// Symbols with no open position carry no liquidation price.
    pub async fn liquidation_prices(&self) -> Result<HashMap<String, Decimal>> {
        self.limiter.acquire().await;
        let positions = self.api.positions().await?;
        Ok(positions
            .into_iter()
            .filter_map(|p| p.liquidation_price.map(|px| (p.symbol, px)))
            .collect())
    }

    pub async fn balance(&self) -> Result<Balance> {
        self.limiter.acquire().await;
        self.api.balance().await
    }

    /// Derive the tradable-balance plan from the allocation percentages.
    pub async fn balance_plan(
        &self,
        alloc_total_pct: Decimal,
        alloc_single_pct: Decimal,
    ) -> Result<BalancePlan> {
        let balance = self.balance().await?;
        let hundred = Decimal::ONE_HUNDRED;

        let balance_to_use = balance.total * alloc_total_pct / hundred;
        let to_leave_free = balance.total - balance_to_use;
        let free_to_use = balance.free - to_leave_free;
        let per_position = balance_to_use * alloc_single_pct / hundred;

        debug!(%balance_to_use, %free_to_use, %per_position, "Computed balance plan");
        Ok(BalancePlan {
            balance_to_use,
            free_to_use,
            per_position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockExchangeApi;
    use crate::types::OrderRecord;
    use copybot_core::types::Side;
    use copybot_core::Error;
    use mockall::predicate::eq;

    fn open_intent(position_id: i64) -> OpenIntent {
        OpenIntent {
            position_id,
            symbol: "SOLUSDT".into(),
            side: Side::Buy,
            leverage: 5,
            price: Decimal::new(24, 0),
            amount: Decimal::new(938, 1),
        }
    }

    #[tokio::test]
    async fn test_open_orders_tags_client_order_id() {
        let mut api = MockExchangeApi::new();
        api.expect_set_leverage()
            .with(eq("SOLUSDT"), eq(5u32))
            .returning(|_, _| Ok(()));
        api.expect_place_limit_order()
            .withf(|_, _, _, _, client_id| client_id == "MIR42")
            .returning(|_, _, _, _, _| {
                Ok(OrderAck {
                    order_id: "1001".into(),
                })
            });

        let gateway = Gateway::new(Arc::new(api), 100);
        let results = gateway.open_orders(vec![open_intent(42)]).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.as_ref().unwrap().order_id, "1001");
    }

    #[tokio::test]
    async fn test_leverage_failure_drops_the_intent() {
        let mut api = MockExchangeApi::new();
        api.expect_set_leverage().returning(|_, _| {
            Err(Error::Api {
                message: "leverage rejected".into(),
                status: Some(400),
            })
        });
        // place_limit_order must not be called.
        api.expect_place_limit_order().times(0);

        let gateway = Gateway::new(Arc::new(api), 100);
        let results = gateway.open_orders(vec![open_intent(7)]).await;
        assert!(results[0].1.is_err());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_the_batch() {
        let mut api = MockExchangeApi::new();
        api.expect_cancel_order()
            .with(eq("SOLUSDT"), eq("bad"))
            .returning(|_, _| {
                Err(Error::Api {
                    message: "boom".into(),
                    status: Some(500),
                })
            });
        api.expect_cancel_order()
            .with(eq("SOLUSDT"), eq("good"))
            .returning(|_, _| Ok(CancelAck::Canceled));

        let gateway = Gateway::new(Arc::new(api), 100);
        let results = gateway
            .cancel_orders(vec![
                CancelIntent {
                    position_id: 1,
                    symbol: "SOLUSDT".into(),
                    order_id: "bad".into(),
                },
                CancelIntent {
                    position_id: 2,
                    symbol: "SOLUSDT".into(),
                    order_id: "good".into(),
                },
            ])
            .await;

        let by_id: HashMap<i64, &Result<CancelAck>> =
            results.iter().map(|(i, r)| (i.position_id, r)).collect();
        assert!(by_id[&1].is_err());
        assert!(matches!(by_id[&2], Ok(CancelAck::Canceled)));
    }

    #[tokio::test]
    async fn test_filled_order_ids_filters_by_state() {
        let mut api = MockExchangeApi::new();
        api.expect_order_history().returning(|symbol| {
            Ok(vec![
                OrderRecord {
                    order_id: "1".into(),
                    symbol: symbol.to_string(),
                    status: OrderState::Filled,
                },
                OrderRecord {
                    order_id: "2".into(),
                    symbol: symbol.to_string(),
                    status: OrderState::New,
                },
            ])
        });

        let gateway = Gateway::new(Arc::new(api), 100);
        let filled = gateway.filled_order_ids(&["SOLUSDT".into()]).await;
        assert!(filled.contains("1"));
        assert!(!filled.contains("2"));
    }

    #[tokio::test]
    async fn test_lot_filters_are_cached() {
        let mut api = MockExchangeApi::new();
        api.expect_lot_filter().times(1).returning(|_| {
            Ok(Some(LotFilter {
                min_qty: Decimal::new(1, 1),
                step_size: Decimal::new(1, 1),
            }))
        });

        let gateway = Gateway::new(Arc::new(api), 100);
        let symbols = vec!["SOLUSDT".to_string()];
        let first = gateway.lot_filters(&symbols).await;
        let second = gateway.lot_filters(&symbols).await;
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_balance_plan_reserves_the_untouched_share() {
        let mut api = MockExchangeApi::new();
        api.expect_balance().returning(|| {
            Ok(Balance {
                total: Decimal::new(10_000, 0),
                free: Decimal::new(10_000, 0),
            })
        });

        let gateway = Gateway::new(Arc::new(api), 100);
        let plan = gateway
            .balance_plan(Decimal::new(90, 0), Decimal::new(5, 0))
            .await
            .unwrap();
        assert_eq!(plan.balance_to_use, Decimal::new(9_000, 0));
        assert_eq!(plan.free_to_use, Decimal::new(9_000, 0));
        assert_eq!(plan.per_position, Decimal::new(450, 0));
    }
}
