//! Instrument metadata: tick size and price rounding

use serde::{Deserialize, Serialize};

/// Tradable instrument description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    /// Symbol (e.g., "NQ")
    pub symbol: String,
    /// Minimum price increment
    pub tick_size: f64,
}

impl Default for Instrument {
    fn default() -> Self {
        Self {
            symbol: "NQ".to_string(),
            tick_size: 0.25,
        }
    }
}

impl Instrument {
    pub fn new(symbol: &str, tick_size: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            tick_size,
        }
    }

    /// Round a price to the nearest valid tick
    pub fn round(&self, price: f64) -> f64 {
        (price / self.tick_size).round() * self.tick_size
    }

    /// Price distance covered by `ticks` ticks
    pub fn ticks(&self, ticks: f64) -> f64 {
        ticks * self.tick_size
    }

    /// True when two prices round to the same tick
    pub fn same_price(&self, a: f64, b: f64) -> bool {
        (a - b).abs() < self.tick_size / 2.0
    }
}
