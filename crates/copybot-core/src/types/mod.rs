//! Domain types for traders, positions and trigger orders.

pub mod order;
pub mod position;
pub mod trader;

pub use order::{Side, TriggerKind, TriggerOrder};
pub use position::{IgnoreReason, MirroredPosition, RoiWindow, UpstreamPosition};
pub use trader::{KcStats, RoiWindows, SuccessStats, Trader, TraderKind};

use std::fmt;
use std::str::FromStr;

/// A named mirror configuration with its own tables, credentials and knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instance {
    X1,
    X2,
    X3,
}

impl Instance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Instance::X1 => "x1",
            Instance::X2 => "x2",
            Instance::X3 => "x3",
        }
    }

    /// Name of this instance's mirrored-position table.
    pub fn position_table(&self) -> String {
        format!("position_{}", self.as_str())
    }

    /// Name of this instance's Kelly-criterion stats table.
    pub fn kc_table(&self) -> String {
        format!("kc_stats_{}", self.as_str())
    }
}

impl FromStr for Instance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x1" => Ok(Instance::X1),
            "x2" => Ok(Instance::X2),
            "x3" => Ok(Instance::X3),
            other => Err(format!("unknown instance '{other}' (expected x1, x2 or x3)")),
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current time as epoch milliseconds, the timestamp convention of the
/// upstream feed.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_parsing() {
        assert_eq!("x2".parse::<Instance>().unwrap(), Instance::X2);
        assert!("x9".parse::<Instance>().is_err());
        assert_eq!(Instance::X1.position_table(), "position_x1");
        assert_eq!(Instance::X3.kc_table(), "kc_stats_x3");
    }
}
