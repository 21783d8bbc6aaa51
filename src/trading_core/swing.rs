//! Swing (pivot) detection
//!
//! A bar is a swing high when its high is strictly above every high within
//! `strength` bars on both sides. Equal highs never qualify, so extrema are
//! deterministic and never overlap. Swing lows mirror this with lows.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::bars::BarSeries;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwingKind {
    High,
    Low,
}

impl SwingKind {
    pub fn opposite(self) -> Self {
        match self {
            SwingKind::High => SwingKind::Low,
            SwingKind::Low => SwingKind::High,
        }
    }
}

/// Confirmed local extreme
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    pub price: f64,
    pub kind: SwingKind,
    /// Absolute index of the pivot bar
    pub bar_index: usize,
    /// Pivot bar open time (epoch ms)
    pub time: i64,
}

impl SwingPoint {
    pub fn is_high(&self) -> bool {
        self.kind == SwingKind::High
    }
}

/// Check whether the bar at `index - strength` is a swing of the given kind
///
/// `index` is the newest completed bar; the right-hand window must be fully
/// known, so nothing is reported until `2 * strength + 1` bars exist.
pub fn detect<S: BarSeries + ?Sized>(
    bars: &S,
    index: usize,
    strength: usize,
    kind: SwingKind,
) -> Option<SwingPoint> {
    if strength == 0 || index >= bars.end_index() {
        return None;
    }
    let pivot_idx = index.checked_sub(strength)?;
    let first = pivot_idx.checked_sub(strength)?;
    let pivot = bars.bar(pivot_idx)?;
    if !pivot.is_complete {
        return None;
    }

    for i in first..=index {
        if i == pivot_idx {
            continue;
        }
        let other = bars.bar(i)?;
        if !other.is_complete {
            return None;
        }
        let beaten = match kind {
            SwingKind::High => other.high >= pivot.high,
            SwingKind::Low => other.low <= pivot.low,
        };
        if beaten {
            return None;
        }
    }

    Some(SwingPoint {
        price: match kind {
            SwingKind::High => pivot.high,
            SwingKind::Low => pivot.low,
        },
        kind,
        bar_index: pivot_idx,
        time: pivot.start_time,
    })
}

/// Swings confirmed by the bar at `index` (an outside bar can be both)
pub fn detect_all<S: BarSeries + ?Sized>(bars: &S, index: usize, strength: usize) -> Vec<SwingPoint> {
    [SwingKind::High, SwingKind::Low]
        .into_iter()
        .filter_map(|kind| detect(bars, index, strength, kind))
        .collect()
}

/// Recent swing points, pruned by elapsed time rather than count
#[derive(Debug, Clone)]
pub struct SwingHistory {
    points: VecDeque<SwingPoint>,
    retention_ms: i64,
}

impl SwingHistory {
    pub fn new(retention_minutes: i64) -> Self {
        Self {
            points: VecDeque::new(),
            retention_ms: retention_minutes.max(1) * 60_000,
        }
    }

    pub fn set_retention_minutes(&mut self, retention_minutes: i64) {
        self.retention_ms = retention_minutes.max(1) * 60_000;
    }

    /// Record a new swing; points arrive in pivot order
    pub fn push(&mut self, point: SwingPoint) {
        self.points.push_back(point);
    }

    /// Drop points older than the retention window relative to `now_ms`
    pub fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.retention_ms;
        while self.points.front().is_some_and(|p| p.time < cutoff) {
            self.points.pop_front();
        }
    }

    pub fn latest(&self, kind: SwingKind) -> Option<&SwingPoint> {
        self.points.iter().rev().find(|p| p.kind == kind)
    }

    /// Most recent swing of `kind` whose pivot is strictly before `bar_index`
    pub fn latest_before(&self, kind: SwingKind, bar_index: usize) -> Option<&SwingPoint> {
        self.points
            .iter()
            .rev()
            .find(|p| p.kind == kind && p.bar_index < bar_index)
    }

    /// Swings of `kind`, most recent first
    pub fn recent(&self, kind: SwingKind) -> impl Iterator<Item = &SwingPoint> {
        self.points.iter().rev().filter(move |p| p.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::bars::Bar;

    fn bars_from_highs_lows(hl: &[(f64, f64)]) -> Vec<Bar> {
        hl.iter()
            .enumerate()
            .map(|(i, &(h, l))| Bar::new(i as i64 * 60_000, l, h, l, h, 1.0))
            .collect()
    }

    #[test]
    fn test_swing_high_detected_after_right_window() {
        let bars = bars_from_highs_lows(&[
            (101.0, 99.0),
            (102.0, 100.0),
            (105.0, 101.0),
            (103.0, 100.5),
            (102.5, 100.0),
        ]);
        // Right window not complete yet
        assert!(detect(&bars, 3, 2, SwingKind::High).is_none());

        let swing = detect(&bars, 4, 2, SwingKind::High).unwrap();
        assert_eq!(swing.price, 105.0);
        assert_eq!(swing.bar_index, 2);
        assert!(swing.is_high());
    }

    #[test]
    fn test_equal_highs_do_not_qualify() {
        let bars = bars_from_highs_lows(&[
            (101.0, 99.0),
            (105.0, 100.0),
            (105.0, 101.0),
            (103.0, 100.5),
            (102.5, 100.0),
        ]);
        assert!(detect(&bars, 4, 2, SwingKind::High).is_none());
    }

    #[test]
    fn test_swing_low_and_insufficient_history() {
        let bars = bars_from_highs_lows(&[
            (102.0, 100.5),
            (101.5, 100.2),
            (101.0, 100.0),
            (101.2, 100.3),
            (101.8, 100.6),
        ]);
        let swing = detect(&bars, 4, 2, SwingKind::Low).unwrap();
        assert_eq!(swing.price, 100.0);
        assert!(detect(&bars, 1, 2, SwingKind::Low).is_none());
        assert!(detect(&bars, 9, 2, SwingKind::Low).is_none());
    }

    #[test]
    fn test_incomplete_bar_blocks_detection() {
        let mut bars = bars_from_highs_lows(&[
            (101.0, 99.0),
            (102.0, 100.0),
            (105.0, 101.0),
            (103.0, 100.5),
            (102.5, 100.0),
        ]);
        bars[4].is_complete = false;
        assert!(detect(&bars, 4, 2, SwingKind::High).is_none());
    }

    #[test]
    fn test_history_prunes_by_time() {
        let mut history = SwingHistory::new(10);
        for i in 0..5 {
            history.push(SwingPoint {
                price: 100.0 + i as f64,
                kind: if i % 2 == 0 { SwingKind::High } else { SwingKind::Low },
                bar_index: i,
                time: i as i64 * 5 * 60_000,
            });
        }
        assert_eq!(history.latest(SwingKind::High).unwrap().price, 104.0);
        assert_eq!(history.latest_before(SwingKind::High, 4).unwrap().price, 102.0);

        // now = 20 min, retention 10 min: keep points at >= 10 min
        history.prune(20 * 60_000);
        assert_eq!(history.len(), 3);
        assert_eq!(history.recent(SwingKind::Low).count(), 1);
    }

    #[test]
    fn test_history_keeps_every_point_inside_retention() {
        let mut history = SwingHistory::new(24 * 60);
        for i in 0..1_000 {
            history.push(SwingPoint {
                price: 100.0,
                kind: SwingKind::High,
                bar_index: i,
                time: i as i64 * 1_000,
            });
        }
        history.prune(1_000 * 1_000);
        assert_eq!(history.len(), 1_000);
        assert_eq!(history.recent(SwingKind::High).last().unwrap().bar_index, 0);
    }
}
