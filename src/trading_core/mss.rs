//! Market structure shift confirmation
//!
//! After a sweep the opposite-side swing located at sweep time becomes the
//! MSS trigger. A bar that closes through it (or trades through it when close
//! confirmation is off) with enough body displacement confirms the shift.

use serde::{Deserialize, Serialize};

use super::bars::{Bar, Direction};
use super::instrument::Instrument;
use super::levels::{LevelState, LiquidityLevel};

/// Displacement strictness tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// No displacement requirement
    Loose,
    Aggressive,
    Balanced,
    Conservative,
}

impl std::fmt::Display for Strictness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strictness::Loose => write!(f, "loose"),
            Strictness::Aggressive => write!(f, "aggressive"),
            Strictness::Balanced => write!(f, "balanced"),
            Strictness::Conservative => write!(f, "conservative"),
        }
    }
}

/// Minimum MSS candle body per strictness tier, in ticks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplacementTicks {
    pub aggressive: u32,
    pub balanced: u32,
    pub conservative: u32,
}

impl Default for DisplacementTicks {
    fn default() -> Self {
        Self {
            aggressive: 4,
            balanced: 8,
            conservative: 12,
        }
    }
}

impl DisplacementTicks {
    /// `None` for the loosest tier, which skips the displacement check
    pub fn for_strictness(&self, strictness: Strictness) -> Option<u32> {
        match strictness {
            Strictness::Loose => None,
            Strictness::Aggressive => Some(self.aggressive),
            Strictness::Balanced => Some(self.balanced),
            Strictness::Conservative => Some(self.conservative),
        }
    }
}

/// Why a bar did or did not confirm the shift
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MssCheck {
    Confirmed,
    NoBreak,
    /// Broke structure but the body was too small
    WeakDisplacement { body: f64, required: f64 },
    /// Level is not in the Broken state
    NotPending,
}

/// Does `bar` break `mss_level` in the setup `direction`?
pub fn is_structure_break(direction: Direction, mss_level: f64, bar: &Bar, require_close: bool) -> bool {
    match (direction, require_close) {
        (Direction::Long, true) => bar.close > mss_level,
        (Direction::Long, false) => bar.high > mss_level,
        (Direction::Short, true) => bar.close < mss_level,
        (Direction::Short, false) => bar.low < mss_level,
    }
}

/// Body must exceed `min_ticks` worth of price
pub fn has_displacement(bar: &Bar, min_ticks: Option<u32>, instrument: &Instrument) -> bool {
    match min_ticks {
        None => true,
        Some(ticks) => bar.body() > instrument.ticks(ticks as f64),
    }
}

/// Evaluate `bar` against the pending `level`; on success Broken -> Confirmed
pub fn confirm(
    level: &mut LiquidityLevel,
    mss_level: f64,
    bar: &Bar,
    require_close: bool,
    displacement_ticks: Option<u32>,
    instrument: &Instrument,
) -> MssCheck {
    if level.state() != LevelState::Broken {
        return MssCheck::NotPending;
    }
    let direction = level.side.setup_direction();
    if !is_structure_break(direction, mss_level, bar, require_close) {
        return MssCheck::NoBreak;
    }
    if !has_displacement(bar, displacement_ticks, instrument) {
        return MssCheck::WeakDisplacement {
            body: bar.body(),
            required: instrument.ticks(displacement_ticks.unwrap_or(0) as f64),
        };
    }
    if level.confirm() {
        MssCheck::Confirmed
    } else {
        MssCheck::NotPending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::levels::{LevelId, LevelSide};

    fn broken_low_level() -> LiquidityLevel {
        let mut level = LiquidityLevel::new(LevelId(7), 100.0, LevelSide::Low, 0, 0);
        level.mark_broken(3, &Bar::new(0, 100.2, 100.3, 99.4, 100.1, 5.0));
        level
    }

    #[test]
    fn test_long_break_requires_close_above() {
        let nq = Instrument::default();
        let mut level = broken_low_level();

        // Wick through 100.50, close below
        let wick = Bar::new(0, 100.0, 100.75, 99.9, 100.25, 5.0);
        assert_eq!(confirm(&mut level, 100.5, &wick, true, None, &nq), MssCheck::NoBreak);
        assert!(is_structure_break(Direction::Long, 100.5, &wick, false));

        let close = Bar::new(0, 100.0, 101.0, 99.9, 100.75, 5.0);
        assert_eq!(confirm(&mut level, 100.5, &close, true, None, &nq), MssCheck::Confirmed);
        assert_eq!(level.state(), LevelState::Confirmed);
        assert_eq!(confirm(&mut level, 100.5, &close, true, None, &nq), MssCheck::NotPending);
    }

    #[test]
    fn test_displacement_tiers() {
        let nq = Instrument::default();
        let ticks = DisplacementTicks::default();
        assert_eq!(ticks.for_strictness(Strictness::Loose), None);
        assert_eq!(ticks.for_strictness(Strictness::Balanced), Some(8));

        // Body of 1.5 points = 6 ticks
        let bar = Bar::new(0, 100.0, 101.75, 99.9, 101.5, 5.0);
        assert!(has_displacement(&bar, Some(4), &nq));
        assert!(!has_displacement(&bar, Some(8), &nq));

        let mut level = broken_low_level();
        match confirm(&mut level, 100.5, &bar, true, Some(12), &nq) {
            MssCheck::WeakDisplacement { body, required } => {
                assert_eq!(body, 1.5);
                assert_eq!(required, 3.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(level.state(), LevelState::Broken);
    }

    #[test]
    fn test_short_break() {
        let bar = Bar::new(0, 100.0, 100.1, 98.5, 98.75, 5.0);
        assert!(is_structure_break(Direction::Short, 99.0, &bar, true));
        assert!(!is_structure_break(Direction::Short, 98.5, &bar, true));
        assert!(!is_structure_break(Direction::Short, 98.5, &bar, false));
    }
}
