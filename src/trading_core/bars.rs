//! Bar types and the rolling bar window used by the detectors
//!
//! Bars are addressed by an absolute index that keeps counting for the
//! lifetime of an engine instance, even after old bars are compacted away.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_complete() -> bool {
    true
}

/// OHLCV bar as delivered by the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time (epoch milliseconds)
    pub start_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// False while the feed is still building the bar
    #[serde(default = "default_complete")]
    pub is_complete: bool,
}

impl Bar {
    /// Create a completed bar
    pub fn new(start_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            start_time,
            open,
            high,
            low,
            close,
            volume,
            is_complete: true,
        }
    }

    /// Bar open time as a UTC timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.start_time).unwrap_or_default()
    }

    /// Absolute candle body size
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// max(high - low, |high - prev_close|, |low - prev_close|)
    pub fn true_range(&self, prev_close: f64) -> f64 {
        (self.high - self.low)
            .max((self.high - prev_close).abs())
            .max((self.low - prev_close).abs())
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "Long"),
            Direction::Short => write!(f, "Short"),
        }
    }
}

/// Read access to bars by absolute index
pub trait BarSeries {
    /// One past the last readable index
    fn end_index(&self) -> usize;

    fn bar(&self, index: usize) -> Option<&Bar>;
}

impl BarSeries for [Bar] {
    fn end_index(&self) -> usize {
        self.len()
    }

    fn bar(&self, index: usize) -> Option<&Bar> {
        self.get(index)
    }
}

impl BarSeries for Vec<Bar> {
    fn end_index(&self) -> usize {
        self.len()
    }

    fn bar(&self, index: usize) -> Option<&Bar> {
        self.get(index)
    }
}

/// Bounded window of completed bars with stable absolute indices
#[derive(Debug, Clone)]
pub struct BarHistory {
    bars: Vec<Bar>,
    /// Absolute index of `bars[0]`
    offset: usize,
    capacity: usize,
}

impl BarHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(8);
        Self {
            bars: Vec::with_capacity(capacity * 2),
            offset: 0,
            capacity,
        }
    }

    /// Append a bar and return its absolute index
    pub fn push(&mut self, bar: Bar) -> usize {
        // Compact in batches so the drain cost is amortised
        if self.bars.len() >= self.capacity * 2 {
            let drop = self.bars.len() - self.capacity;
            self.bars.drain(..drop);
            self.offset += drop;
        }
        self.bars.push(bar);
        self.offset + self.bars.len() - 1
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn last_index(&self) -> Option<usize> {
        self.end_index().checked_sub(1)
    }

    /// Oldest index still held
    pub fn first_index(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

impl BarSeries for BarHistory {
    fn end_index(&self) -> usize {
        self.offset + self.bars.len()
    }

    fn bar(&self, index: usize) -> Option<&Bar> {
        index.checked_sub(self.offset).and_then(|i| self.bars.get(i))
    }
}

/// Simple average true range over the `period` bars ending at `index`
///
/// Returns `None` until `period + 1` bars are available.
pub fn average_true_range<S: BarSeries + ?Sized>(bars: &S, index: usize, period: usize) -> Option<f64> {
    if period == 0 {
        return None;
    }
    let first = index.checked_sub(period)?;
    let mut prev_close = bars.bar(first)?.close;
    let mut sum_tr = 0.0;
    for i in first + 1..=index {
        let bar = bars.bar(i)?;
        sum_tr += bar.true_range(prev_close);
        prev_close = bar.close;
    }
    Some(sum_tr / period as f64)
}
