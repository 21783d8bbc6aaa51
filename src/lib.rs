// Library crate - exports the engine, the execution port and bar feeds

pub mod execution;
pub mod streams;
pub mod trading_core;

// Re-export commonly used types
pub use execution::{OrderExecution, SimulatedExecution};
pub use trading_core::{Bar, EngineConfig, EngineEvent, Instrument, SweepEngine};
