//! Bar sources for the engine

pub mod csv_feed;

pub use csv_feed::{load_bars, read_bars};
