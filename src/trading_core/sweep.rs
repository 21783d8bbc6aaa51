//! Sweep detection
//!
//! A sweep is a penetration of an armed liquidity level by at least
//! `min_penetration_ticks`, optionally with the bar closing back on the
//! original side of the level.

use super::bars::Bar;
use super::instrument::Instrument;
use super::levels::{LevelSide, LevelState, LiquidityLevel};

/// Result of testing one bar against one level
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepOutcome {
    /// Level untouched (or touched without enough penetration / close-back)
    NoSweep,
    /// Level went Active -> Broken on this bar
    Swept { extreme: f64 },
    /// Level already Broken; sweep extreme pushed further
    Extended { extreme: f64 },
    /// Level is past the sweep stage
    Inactive,
}

/// Price a bar must reach for `side` to count as swept
pub fn threshold(price: f64, side: LevelSide, min_penetration_ticks: u32, instrument: &Instrument) -> f64 {
    let distance = instrument.ticks(min_penetration_ticks as f64);
    match side {
        LevelSide::High => instrument.round(price + distance),
        LevelSide::Low => instrument.round(price - distance),
    }
}

/// Pure predicate: does `bar` sweep a level at `price` on `side`?
pub fn is_sweep(
    price: f64,
    side: LevelSide,
    bar: &Bar,
    min_penetration_ticks: u32,
    require_close_back: bool,
    instrument: &Instrument,
) -> bool {
    let trigger = threshold(price, side, min_penetration_ticks, instrument);
    match side {
        LevelSide::High => bar.high >= trigger && (!require_close_back || bar.close < price),
        LevelSide::Low => bar.low <= trigger && (!require_close_back || bar.close > price),
    }
}

/// Test `bar` against `level`, mutating the level on a sweep or extension
pub fn check(
    level: &mut LiquidityLevel,
    bar: &Bar,
    bar_index: usize,
    instrument: &Instrument,
    min_penetration_ticks: u32,
    require_close_back: bool,
) -> SweepOutcome {
    match level.state() {
        LevelState::Active => {
            if is_sweep(level.price, level.side, bar, min_penetration_ticks, require_close_back, instrument)
                && level.mark_broken(bar_index, bar)
            {
                SweepOutcome::Swept {
                    extreme: level.sweep_extreme().unwrap_or(level.price),
                }
            } else {
                SweepOutcome::NoSweep
            }
        }
        LevelState::Broken => {
            if level.extend_sweep(bar) {
                SweepOutcome::Extended {
                    extreme: level.sweep_extreme().unwrap_or(level.price),
                }
            } else {
                SweepOutcome::NoSweep
            }
        }
        _ => SweepOutcome::Inactive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::levels::LevelId;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar::new(0, open, high, low, close, 10.0)
    }

    #[test]
    fn test_low_side_needs_min_penetration() {
        let nq = Instrument::default();
        let mut level = LiquidityLevel::new(LevelId(1), 100.0, LevelSide::Low, 0, 0);

        // Threshold is 99.50 with 2 ticks of 0.25
        assert_eq!(threshold(100.0, LevelSide::Low, 2, &nq), 99.5);
        let outcome = check(&mut level, &bar(100.2, 100.4, 99.9, 100.1), 1, &nq, 2, true);
        assert_eq!(outcome, SweepOutcome::NoSweep);
        assert_eq!(level.state(), LevelState::Active);

        let outcome = check(&mut level, &bar(100.2, 100.4, 99.4, 100.1), 2, &nq, 2, true);
        assert_eq!(outcome, SweepOutcome::Swept { extreme: 99.4 });
        assert_eq!(level.state(), LevelState::Broken);
        assert_eq!(level.broke_index(), Some(2));
    }

    #[test]
    fn test_close_back_requirement() {
        let nq = Instrument::default();
        // Pierced and closed above: accepted, not a sweep
        let held = bar(100.0, 101.0, 99.75, 100.9);
        assert!(!is_sweep(100.5, LevelSide::High, &held, 2, true, &nq));
        assert!(is_sweep(100.5, LevelSide::High, &held, 2, false, &nq));

        let rejected = bar(100.0, 101.0, 99.75, 100.25);
        assert!(is_sweep(100.5, LevelSide::High, &rejected, 2, true, &nq));
    }

    #[test]
    fn test_extension_and_inactive() {
        let nq = Instrument::default();
        let mut level = LiquidityLevel::new(LevelId(1), 100.0, LevelSide::High, 0, 0);
        check(&mut level, &bar(99.5, 100.75, 99.5, 99.75), 1, &nq, 2, true);
        assert_eq!(level.sweep_extreme(), Some(100.75));

        let outcome = check(&mut level, &bar(99.75, 101.25, 99.5, 99.5), 2, &nq, 2, true);
        assert_eq!(outcome, SweepOutcome::Extended { extreme: 101.25 });
        let outcome = check(&mut level, &bar(99.5, 100.0, 99.0, 99.25), 3, &nq, 2, true);
        assert_eq!(outcome, SweepOutcome::NoSweep);

        level.cancel();
        let outcome = check(&mut level, &bar(99.5, 103.0, 99.0, 99.25), 4, &nq, 2, true);
        assert_eq!(outcome, SweepOutcome::Inactive);
    }
}
