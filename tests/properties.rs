//! Invariants over random inputs

use proptest::prelude::*;

use sweep_engine::trading_core::levels::LevelId;
use sweep_engine::trading_core::position::{manage_bar, open_trade};
use sweep_engine::trading_core::sweep;
use sweep_engine::trading_core::{
    Bar, Direction, EngineConfig, EntryIntent, Instrument, LevelSide, LevelState, LiquidityLevel, PartialTargetMode,
    TargetMode, TrailArming, TrailMode,
};

/// (open, high, low, close) around `base` with high >= max(open, close) and low <= min(open, close)
fn arb_bar(base: f64) -> impl Strategy<Value = Bar> {
    (-20i32..20, -20i32..20, 0i32..12, 0i32..12).prop_map(move |(o, c, up, down)| {
        let open = base + o as f64 * 0.25;
        let close = base + c as f64 * 0.25;
        let high = open.max(close) + up as f64 * 0.25;
        let low = open.min(close) - down as f64 * 0.25;
        Bar::new(0, open, high, low, close, 1.0)
    })
}

proptest! {
    #[test]
    fn test_round_is_idempotent_and_on_grid(price in -100_000.0f64..100_000.0) {
        let instrument = Instrument::default();
        let once = instrument.round(price);
        prop_assert_eq!(instrument.round(once), once);
        prop_assert!((once - price).abs() <= instrument.tick_size / 2.0 + 1e-9);
        prop_assert!(((once / instrument.tick_size) - (once / instrument.tick_size).round()).abs() < 1e-9);
    }

    #[test]
    fn test_sweep_extreme_never_retracts(bars in prop::collection::vec(arb_bar(100.0), 1..40)) {
        let instrument = Instrument::default();
        let mut level = LiquidityLevel::new(LevelId(1), 100.0, LevelSide::Low, 0, 0);
        let mut previous: Option<f64> = None;
        for (i, bar) in bars.iter().enumerate() {
            sweep::check(&mut level, bar, i, &instrument, 2, false);
            if let (Some(prev), Some(now)) = (previous, level.sweep_extreme()) {
                prop_assert!(now <= prev);
            }
            if level.state() == LevelState::Broken {
                prop_assert!(level.sweep_extreme().is_some());
            }
            previous = level.sweep_extreme().or(previous);
        }
    }

    #[test]
    fn test_level_state_only_moves_forward(ops in prop::collection::vec(0u8..4, 1..20)) {
        let bar = Bar::new(0, 100.0, 101.0, 99.0, 100.5, 1.0);
        let mut level = LiquidityLevel::new(LevelId(7), 100.0, LevelSide::Low, 0, 0);
        let rank = |s: LevelState| match s {
            LevelState::Active => 0,
            LevelState::Broken => 1,
            LevelState::Confirmed => 2,
            LevelState::Canceled | LevelState::Traded => 3,
        };
        for (i, op) in ops.into_iter().enumerate() {
            let before = level.state();
            match op {
                0 => { level.mark_broken(i, &bar); }
                1 => { level.confirm(); }
                2 => { level.mark_traded(); }
                _ => { level.cancel(); }
            }
            let after = level.state();
            if before.is_terminal() {
                prop_assert_eq!(after, before);
            }
            prop_assert!(rank(after) >= rank(before));
            prop_assert!(after == before || before.can_transition_to(after));
        }
    }

    #[test]
    fn test_trailing_stop_never_loosens(
        long in any::<bool>(),
        bars in prop::collection::vec(arb_bar(100.0), 1..60),
    ) {
        let instrument = Instrument::default();
        let config = EngineConfig {
            trail_mode: TrailMode::Fixed { points: 3.0 },
            trail_arming: TrailArming::Immediate,
            target_mode: TargetMode::FixedPoints { points: 1_000.0 },
            partial_target: PartialTargetMode::Disabled,
            ..Default::default()
        };
        let direction = if long { Direction::Long } else { Direction::Short };
        let intent = EntryIntent {
            direction,
            price: 100.0,
            bar_index: 0,
            sweep_extreme: if long { 90.0 } else { 110.0 },
            signal_high: 101.0,
            signal_low: 99.0,
            level_id: LevelId(1),
            level_price: if long { 91.0 } else { 109.0 },
            zone: None,
        };
        let mut trade = open_trade(&intent, 100.0, 1, 0, &config, &instrument, None).unwrap();
        let mut stop = trade.effective_stop();
        for (i, bar) in bars.iter().enumerate() {
            manage_bar(&mut trade, bar, i + 1, false, &config, &instrument, None);
            if trade.is_closed() {
                break;
            }
            let now = trade.effective_stop();
            match direction {
                Direction::Long => prop_assert!(now >= stop),
                Direction::Short => prop_assert!(now <= stop),
            }
            stop = now;
        }
    }
}
