//! In-process executor that fills every order at the reference price

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::OrderExecution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub side: OrderSide,
    pub quantity: u32,
    pub price: f64,
}

/// Simulated account holding one instrument's position
#[derive(Debug, Clone)]
pub struct SimulatedExecution {
    symbol: String,
    /// Current net position (positive = long, negative = short)
    net_position: i64,
    reference_price: Option<f64>,
    last_fill_price: Option<f64>,
    fills: Vec<Fill>,
    reject_orders: bool,
}

impl SimulatedExecution {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            net_position: 0,
            reference_price: None,
            last_fill_price: None,
            fills: Vec::new(),
            reject_orders: false,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    /// Make every following order fail (broker outage)
    pub fn set_reject_orders(&mut self, reject: bool) {
        self.reject_orders = reject;
    }

    /// Position closed outside the engine (manual flatten, broker liquidation)
    pub fn flatten_externally(&mut self) {
        warn!("{}: position {} flattened externally", self.symbol, self.net_position);
        self.net_position = 0;
    }

    fn fill(&mut self, side: OrderSide, quantity: u32) -> Result<()> {
        if self.reject_orders {
            return Err(anyhow!("{} {} {} rejected", side, quantity, self.symbol));
        }
        if quantity == 0 {
            return Ok(());
        }
        let price = self
            .reference_price
            .ok_or_else(|| anyhow!("no reference price for {} fill", self.symbol))?;
        let signed = match side {
            OrderSide::Buy => quantity as i64,
            OrderSide::Sell => -(quantity as i64),
        };
        self.net_position += signed;
        self.last_fill_price = Some(price);
        self.fills.push(Fill { side, quantity, price });
        debug!(
            "FILL: {} {} {} @ {:.2} | position {}",
            side, quantity, self.symbol, price, self.net_position
        );
        Ok(())
    }
}

impl OrderExecution for SimulatedExecution {
    fn buy(&mut self, quantity: u32) -> Result<()> {
        self.fill(OrderSide::Buy, quantity)
    }

    fn sell(&mut self, quantity: u32) -> Result<()> {
        self.fill(OrderSide::Sell, quantity)
    }

    fn close_at_market(&mut self) -> Result<()> {
        match self.net_position {
            0 => Ok(()),
            n if n > 0 => self.fill(OrderSide::Sell, n as u32),
            n => self.fill(OrderSide::Buy, n.unsigned_abs() as u32),
        }
    }

    fn position(&self) -> i64 {
        self.net_position
    }

    fn last_fill_price(&self) -> Option<f64> {
        self.last_fill_price
    }

    fn set_reference_price(&mut self, price: f64) {
        self.reference_price = Some(price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fills_at_reference_price() {
        let mut exec = SimulatedExecution::new("NQ");
        assert!(exec.buy(1).is_err());

        exec.set_reference_price(100.25);
        exec.buy(3).unwrap();
        assert_eq!(exec.position(), 3);
        assert_eq!(exec.last_fill_price(), Some(100.25));

        exec.set_reference_price(101.0);
        exec.sell(1).unwrap();
        exec.close_at_market().unwrap();
        assert_eq!(exec.position(), 0);
        assert_eq!(exec.fills().len(), 3);
        assert_eq!(exec.fills()[2], Fill { side: OrderSide::Sell, quantity: 2, price: 101.0 });
    }

    #[test]
    fn test_short_close_and_rejections() {
        let mut exec = SimulatedExecution::new("NQ");
        exec.set_reference_price(100.0);
        exec.sell(2).unwrap();
        exec.close_at_market().unwrap();
        assert_eq!(exec.fills()[1].side, OrderSide::Buy);

        exec.set_reject_orders(true);
        assert!(exec.buy(1).is_err());
        assert_eq!(exec.position(), 0);

        exec.set_reject_orders(false);
        exec.buy(1).unwrap();
        exec.flatten_externally();
        assert_eq!(exec.position(), 0);
    }
}
