//! Order execution port
//!
//! The engine routes its orders through [`OrderExecution`]. Brokers plug in
//! behind the trait; [`SimulatedExecution`] fills in-process for replay and
//! tests.

use anyhow::Result;

mod simulated;

pub use simulated::{Fill, OrderSide, SimulatedExecution};

/// Market order interface used by the engine
pub trait OrderExecution {
    fn buy(&mut self, quantity: u32) -> Result<()>;

    fn sell(&mut self, quantity: u32) -> Result<()>;

    /// Flatten whatever position is open
    fn close_at_market(&mut self) -> Result<()>;

    /// Signed net position (positive = long)
    fn position(&self) -> i64;

    fn last_fill_price(&self) -> Option<f64>;

    /// Price the engine expects the next order to fill at
    ///
    /// Live brokers ignore this; simulated fills use it.
    fn set_reference_price(&mut self, _price: f64) {}
}
