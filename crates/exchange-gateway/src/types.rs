//! Request/response types for gateway operations.

use copybot_core::types::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Intent to open one limit entry order for a mirrored position.
#[derive(Debug, Clone)]
pub struct OpenIntent {
    /// Upstream id of the mirrored position this order belongs to.
    pub position_id: i64,
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub price: Decimal,
    pub amount: Decimal,
}

/// Intent to cancel a working limit order.
#[derive(Debug, Clone)]
pub struct CancelIntent {
    pub position_id: i64,
    pub symbol: String,
    pub order_id: String,
}

/// Intent to fully close a filled position with a reduce-only market order.
#[derive(Debug, Clone)]
pub struct CloseIntent {
    pub position_id: i64,
    pub symbol: String,
    /// Position side; the close order goes out on the opposite side.
    pub side: Side,
    pub amount: Decimal,
}

/// Intent to reduce a filled position by `amount`.
#[derive(Debug, Clone)]
pub struct PartialCloseIntent {
    pub position_id: i64,
    pub symbol: String,
    pub side: Side,
    pub amount: Decimal,
}

/// Intent to create one trigger (stop-market / take-profit-market) order.
#[derive(Debug, Clone)]
pub struct TriggerIntent {
    pub position_id: i64,
    pub symbol: String,
    /// Position side; the trigger order goes out on the opposite side.
    pub position_side: Side,
    pub kind: TriggerOrderKind,
    pub stop_price: Decimal,
    pub amount: Decimal,
}

/// Intent to cancel a working trigger order.
#[derive(Debug, Clone)]
pub struct TriggerCancelIntent {
    /// Row id of the trigger-order record.
    pub trigger_id: i64,
    pub symbol: String,
    pub order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOrderKind {
    StopMarket,
    TakeProfitMarket,
}

/// Acknowledgement of a placed order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
}

/// Result of a cancel; "order not found" is a normal outcome at the
/// maybe-succeeded boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    Canceled,
    NotFound,
}

/// Account balance snapshot in the quote currency.
#[derive(Debug, Clone, Copy)]
pub struct Balance {
    pub total: Decimal,
    pub free: Decimal,
}

/// Tradable-balance breakdown derived from the allocation knobs.
#[derive(Debug, Clone, Copy)]
pub struct BalancePlan {
    /// Share of total equity the engine may deploy.
    pub balance_to_use: Decimal,
    /// Free balance after reserving the untouched share.
    pub free_to_use: Decimal,
    /// Base budget per single position.
    pub per_position: Decimal,
}

/// Lot-size constraints of one symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LotFilter {
    pub min_qty: Decimal,
    pub step_size: Decimal,
}

/// A position held on the target exchange, as returned by its position
/// endpoint.
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub liquidation_price: Option<Decimal>,
}

/// An order from the exchange's order history.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub status: OrderState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Other,
}

impl OrderState {
    pub fn from_str(s: &str) -> OrderState {
        match s {
            "NEW" => OrderState::New,
            "PARTIALLY_FILLED" => OrderState::PartiallyFilled,
            "FILLED" => OrderState::Filled,
            "CANCELED" => OrderState::Canceled,
            _ => OrderState::Other,
        }
    }
}
