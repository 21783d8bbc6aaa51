//! Position Manager
//!
//! Computes the initial stop and targets when a trade opens, then evaluates
//! each subsequent bar in a fixed order:
//!
//! 1. End-of-day flatten
//! 2. Time / no-progress stop
//! 3. Stop loss (tighter of the stop and the trailing stop)
//! 4. Partial target (TP1), optionally moving the stop to breakeven
//! 5. Breakeven trigger
//! 6. Trailing stop ratchet
//! 7. Final target (TP2)
//!
//! Evaluation stops at the first full close.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::bars::{Bar, Direction};
use super::config::{
    EngineConfig, OversizeStopPolicy, PartialTargetMode, StopMode, TargetMode, TrailArming, TrailMode,
};
use super::instrument::Instrument;
use super::levels::PriorLevels;
use super::state_machine::EntryIntent;

/// Computed stop wider than allowed under [`OversizeStopPolicy::Reject`]
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("stop distance {distance:.2} exceeds maximum {max:.2}")]
pub struct StopRejected {
    pub distance: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    StopLoss,
    Breakeven,
    TrailingStop,
    Target1,
    Target2,
    TimeStop,
    NoProgress,
    EndOfDay,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP"),
            ExitReason::Breakeven => write!(f, "BREAKEVEN"),
            ExitReason::TrailingStop => write!(f, "TRAIL"),
            ExitReason::Target1 => write!(f, "TP1"),
            ExitReason::Target2 => write!(f, "TP2"),
            ExitReason::TimeStop => write!(f, "TIME"),
            ExitReason::NoProgress => write!(f, "NO PROGRESS"),
            ExitReason::EndOfDay => write!(f, "EOD"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopKind {
    Breakeven,
    Trailing,
}

/// Instruction produced by [`manage_bar`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "action")]
pub enum ManagementAction {
    FullExit { price: f64, quantity: u32, reason: ExitReason },
    PartialExit { price: f64, quantity: u32 },
    StopMoved { price: f64, kind: StopKind },
}

/// Live trade, mutated only by the position manager
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeState {
    pub id: Uuid,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: f64,
    pub initial_stop: f64,
    pub target1: Option<f64>,
    pub target2: f64,
    pub quantity: u32,
    pub initial_quantity: u32,
    pub partial_taken: bool,
    pub be_activated: bool,
    pub trail_active: bool,
    pub trail_stop: Option<f64>,
    pub best_price: f64,
    pub entry_index: usize,
    pub entry_time: i64,
    pub level_price: f64,
    /// Sum of (exit - entry) x quantity in points for closed contracts
    pub realized_points: f64,
}

impl TradeState {
    pub fn is_long(&self) -> bool {
        self.direction == Direction::Long
    }

    /// Initial risk per contract in points
    pub fn risk(&self) -> f64 {
        (self.entry_price - self.initial_stop) * self.direction.sign()
    }

    /// Tighter of the recorded stop and an active trailing stop
    pub fn effective_stop(&self) -> f64 {
        match (self.trail_active, self.trail_stop) {
            (true, Some(trail)) => match self.direction {
                Direction::Long => self.stop_price.max(trail),
                Direction::Short => self.stop_price.min(trail),
            },
            _ => self.stop_price,
        }
    }

    /// Favorable excursion of the best price so far, in points
    pub fn favorable_excursion(&self) -> f64 {
        (self.best_price - self.entry_price) * self.direction.sign()
    }

    pub fn points_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.direction.sign()
    }

    /// Quantity-weighted result in R once the trade is closed
    pub fn realized_r(&self) -> f64 {
        let risk = self.risk();
        if risk <= 0.0 || self.initial_quantity == 0 {
            return 0.0;
        }
        self.realized_points / (risk * self.initial_quantity as f64)
    }

    pub fn is_closed(&self) -> bool {
        self.quantity == 0
    }

    fn is_tighter(&self, candidate: f64, than: f64) -> bool {
        match self.direction {
            Direction::Long => candidate > than,
            Direction::Short => candidate < than,
        }
    }

    fn reached(&self, bar: &Bar, price: f64) -> bool {
        match self.direction {
            Direction::Long => bar.high >= price,
            Direction::Short => bar.low <= price,
        }
    }

    fn book_exit(&mut self, price: f64, quantity: u32) {
        let quantity = quantity.min(self.quantity);
        self.realized_points += self.points_at(price) * quantity as f64;
        self.quantity -= quantity;
    }

    fn stop_reason(&self) -> ExitReason {
        let trail_governs = self.trail_active
            && self
                .trail_stop
                .is_some_and(|trail| !self.is_tighter(self.stop_price, trail));
        if trail_governs {
            ExitReason::TrailingStop
        } else if self.be_activated {
            ExitReason::Breakeven
        } else {
            ExitReason::StopLoss
        }
    }
}

/// Build a trade from an entry intent filled at `entry_price`
pub fn open_trade(
    intent: &EntryIntent,
    entry_price: f64,
    quantity: u32,
    entry_time: i64,
    config: &EngineConfig,
    instrument: &Instrument,
    prior: Option<&PriorLevels>,
) -> Result<TradeState, StopRejected> {
    let entry = instrument.round(entry_price);
    let distance = stop_distance(intent, entry, config, instrument);
    let oversize = config.max_stop_points > 0.0 && distance > config.max_stop_points;
    if oversize && matches!(config.oversize_stop_policy, OversizeStopPolicy::Reject) {
        return Err(StopRejected {
            distance,
            max: config.max_stop_points,
        });
    }
    Ok(build_trade(intent, entry, distance, quantity, entry_time, config, instrument, prior))
}

/// Rebuild a trade around the price actually filled
///
/// The order is already working, so an oversize stop is clamped whatever the policy.
pub fn open_trade_at_fill(
    intent: &EntryIntent,
    fill_price: f64,
    quantity: u32,
    entry_time: i64,
    config: &EngineConfig,
    instrument: &Instrument,
    prior: Option<&PriorLevels>,
) -> TradeState {
    let entry = instrument.round(fill_price);
    let distance = stop_distance(intent, entry, config, instrument);
    build_trade(intent, entry, distance, quantity, entry_time, config, instrument, prior)
}

/// Stop distance in points before the max-stop check
fn stop_distance(intent: &EntryIntent, entry: f64, config: &EngineConfig, instrument: &Instrument) -> f64 {
    let sign = intent.direction.sign();
    let raw_stop = match config.stop_mode {
        StopMode::Fixed { points } => entry - sign * points,
        StopMode::Structural { buffer_ticks } => {
            intent.sweep_extreme - sign * instrument.ticks(buffer_ticks as f64)
        }
        StopMode::SignalBar { buffer_ticks } => {
            let extreme = match intent.direction {
                Direction::Long => intent.signal_low,
                Direction::Short => intent.signal_high,
            };
            extreme - sign * instrument.ticks(buffer_ticks as f64)
        }
    };

    let mut distance = (entry - raw_stop) * sign;
    if distance <= 0.0 {
        distance = config.min_stop_points.max(instrument.tick_size);
        debug!("STOP: computed stop on wrong side of entry, using {:.2} pts", distance);
    }
    if config.min_stop_points > 0.0 && distance < config.min_stop_points {
        distance = config.min_stop_points;
    }
    distance
}

#[allow(clippy::too_many_arguments)]
fn build_trade(
    intent: &EntryIntent,
    entry: f64,
    mut distance: f64,
    quantity: u32,
    entry_time: i64,
    config: &EngineConfig,
    instrument: &Instrument,
    prior: Option<&PriorLevels>,
) -> TradeState {
    let direction = intent.direction;
    let sign = direction.sign();
    if config.max_stop_points > 0.0 && distance > config.max_stop_points {
        debug!("STOP: {:.2} pts clamped to max {:.2}", distance, config.max_stop_points);
        distance = config.max_stop_points;
    }
    distance = distance.max(instrument.tick_size);
    let stop = instrument.round(entry - sign * distance);
    let risk = (entry - stop) * sign;

    let favorable = |price: f64| (price - entry) * sign > 0.0;
    let r_target = |r: f64| instrument.round(entry + sign * risk * r);

    let target2 = match config.target_mode {
        TargetMode::RMultiple { r } => Some(r_target(r)),
        TargetMode::FixedPoints { points } => Some(instrument.round(entry + sign * points)),
        TargetMode::Equilibrium => prior.map(|p| instrument.round(p.equilibrium())),
        TargetMode::OppositeLevel => prior.map(|p| {
            instrument.round(match direction {
                Direction::Long => p.high,
                Direction::Short => p.low,
            })
        }),
    }
    .filter(|&t| favorable(t))
    .unwrap_or_else(|| r_target(config.fallback_target_r));

    let target1 = match config.partial_target {
        PartialTargetMode::Disabled => None,
        PartialTargetMode::RMultiple { r } => Some(r_target(r)),
        PartialTargetMode::FixedPoints { points } => Some(instrument.round(entry + sign * points)),
        PartialTargetMode::RangeMidpoint => {
            let halfway = instrument.round((entry + target2) / 2.0);
            Some(
                prior
                    .map(|p| instrument.round(p.equilibrium()))
                    .filter(|&mid| favorable(mid) && (target2 - mid) * sign > 0.0)
                    .unwrap_or(halfway),
            )
        }
    }
    .filter(|&t| favorable(t));

    TradeState {
        id: Uuid::new_v4(),
        direction,
        entry_price: entry,
        stop_price: stop,
        initial_stop: stop,
        target1,
        target2,
        quantity,
        initial_quantity: quantity,
        partial_taken: false,
        be_activated: false,
        trail_active: false,
        trail_stop: None,
        best_price: entry,
        entry_index: intent.bar_index,
        entry_time,
        level_price: intent.level_price,
        realized_points: 0.0,
    }
}

/// Evaluate one bar against an open trade
///
/// `atr` is only consulted for ATR trailing. Exits are booked into the trade
/// (quantity and realized points); the caller routes the orders.
pub fn manage_bar(
    trade: &mut TradeState,
    bar: &Bar,
    index: usize,
    eod_due: bool,
    config: &EngineConfig,
    instrument: &Instrument,
    atr: Option<f64>,
) -> Vec<ManagementAction> {
    let mut actions = Vec::new();
    if trade.is_closed() {
        return actions;
    }
    let sign = trade.direction.sign();

    // 1. End of day
    if eod_due {
        let price = instrument.round(bar.close);
        actions.push(full_exit(trade, price, ExitReason::EndOfDay));
        return actions;
    }

    trade.best_price = match trade.direction {
        Direction::Long => trade.best_price.max(bar.high),
        Direction::Short => trade.best_price.min(bar.low),
    };

    // 2. Time / no-progress
    let bars_in_trade = index.saturating_sub(trade.entry_index);
    if config.max_bars_in_trade > 0 && bars_in_trade >= config.max_bars_in_trade {
        let price = instrument.round(bar.close);
        actions.push(full_exit(trade, price, ExitReason::TimeStop));
        return actions;
    }
    if config.no_progress_bars > 0
        && bars_in_trade >= config.no_progress_bars
        && !trade.partial_taken
        && trade.favorable_excursion() < config.no_progress_r * trade.risk()
    {
        let price = instrument.round(bar.close);
        actions.push(full_exit(trade, price, ExitReason::NoProgress));
        return actions;
    }

    // 3. Stop
    let stop = trade.effective_stop();
    let stop_hit = match trade.direction {
        Direction::Long => bar.low <= stop,
        Direction::Short => bar.high >= stop,
    };
    if stop_hit {
        // Gapped through: filled at the open
        let gapped = match trade.direction {
            Direction::Long => bar.open < stop,
            Direction::Short => bar.open > stop,
        };
        let price = instrument.round(if gapped { bar.open } else { stop });
        let reason = trade.stop_reason();
        actions.push(full_exit(trade, price, reason));
        return actions;
    }

    // 4. Partial target
    if let Some(tp1) = trade.target1 {
        if !trade.partial_taken && trade.reached(bar, tp1) {
            let wanted = (trade.quantity as f64 * config.partial_percent / 100.0).ceil() as u32;
            if wanted >= trade.quantity {
                actions.push(full_exit(trade, tp1, ExitReason::Target1));
                return actions;
            }
            trade.book_exit(tp1, wanted);
            trade.partial_taken = true;
            info!(
                "PARTIAL: {} closed @ {:.2} | {} remaining",
                wanted, tp1, trade.quantity
            );
            actions.push(ManagementAction::PartialExit {
                price: tp1,
                quantity: wanted,
            });
            if config.breakeven_on_partial {
                trade.be_activated = true;
                if trade.is_tighter(trade.entry_price, trade.stop_price) {
                    trade.stop_price = trade.entry_price;
                    actions.push(ManagementAction::StopMoved {
                        price: trade.stop_price,
                        kind: StopKind::Breakeven,
                    });
                }
            }
        }
    }

    // 5. Breakeven trigger
    if config.breakeven_trigger_points > 0.0
        && !trade.be_activated
        && trade.favorable_excursion() >= config.breakeven_trigger_points
    {
        trade.be_activated = true;
        let be = instrument.round(trade.entry_price + sign * instrument.ticks(config.breakeven_offset_ticks as f64));
        if trade.is_tighter(be, trade.stop_price) {
            trade.stop_price = be;
            debug!("BREAKEVEN: stop -> {:.2}", be);
            actions.push(ManagementAction::StopMoved {
                price: be,
                kind: StopKind::Breakeven,
            });
        }
    }

    // 6. Trailing
    let armed = match config.trail_arming {
        TrailArming::Immediate => true,
        TrailArming::AfterPartial => trade.partial_taken,
    };
    let trail_distance = match config.trail_mode {
        TrailMode::Disabled => None,
        TrailMode::Fixed { points } => Some(points),
        TrailMode::Atr { multiple, .. } => atr.map(|atr| atr * multiple),
    };
    if let (true, Some(distance)) = (armed, trail_distance) {
        let candidate = instrument.round(trade.best_price - sign * distance);
        let improves = trade.trail_stop.map_or(true, |current| trade.is_tighter(candidate, current));
        if improves {
            trade.trail_stop = Some(candidate);
            trade.trail_active = true;
            debug!("TRAIL: stop -> {:.2}", candidate);
            actions.push(ManagementAction::StopMoved {
                price: candidate,
                kind: StopKind::Trailing,
            });
        }
    }

    // 7. Final target
    if trade.reached(bar, trade.target2) {
        let price = trade.target2;
        actions.push(full_exit(trade, price, ExitReason::Target2));
    }

    actions
}

fn full_exit(trade: &mut TradeState, price: f64, reason: ExitReason) -> ManagementAction {
    let quantity = trade.quantity;
    trade.book_exit(price, quantity);
    ManagementAction::FullExit {
        price,
        quantity,
        reason,
    }
}
