//! Order sides and exchange trigger orders (stop-loss / take-profit).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side as reported by the upstream feed and sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// The opposite side, used for close and trigger orders.
    pub fn flip(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Parse a stored side; anything other than "sell" reads as buy.
    pub fn from_db(s: &str) -> Side {
        match s {
            "sell" => Side::Sell,
            _ => Side::Buy,
        }
    }

    /// True for positions held long (entered with a buy).
    pub fn is_long(&self) -> bool {
        matches!(self, Side::Buy)
    }
}

/// Kind of trigger order maintained against a filled position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    StopLoss,
    TakeProfit,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::StopLoss => "sl",
            TriggerKind::TakeProfit => "tp",
        }
    }

    pub fn from_db(s: &str) -> TriggerKind {
        match s {
            "tp" => TriggerKind::TakeProfit,
            _ => TriggerKind::StopLoss,
        }
    }
}

/// A live trigger order on the exchange, keyed by
/// (position table, upstream position id, kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerOrder {
    pub id: i64,
    /// Which instance's position table the linked position lives in.
    pub position_table: String,
    /// Upstream id of the mirrored position this trigger protects.
    pub upstream_position_id: i64,
    pub kind: TriggerKind,
    /// Exchange-assigned trigger order id, once created.
    pub order_id: Option<String>,
    pub symbol: String,
    /// Order side (opposite of the position side).
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub is_active: bool,
    pub is_filled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_flip() {
        assert_eq!(Side::Buy.flip(), Side::Sell);
        assert_eq!(Side::Sell.flip(), Side::Buy);
        assert!(Side::Buy.is_long());
        assert!(!Side::Sell.is_long());
    }

    #[test]
    fn test_side_db_round_trip() {
        assert_eq!(Side::from_db(Side::Sell.as_str()), Side::Sell);
        assert_eq!(Side::from_db(Side::Buy.as_str()), Side::Buy);
    }
}
