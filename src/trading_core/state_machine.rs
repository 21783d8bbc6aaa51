//! Entry State Machine
//!
//! Sequences the detectors into one setup at a time:
//!
//! IDLE -> SWEEP_DETECTED -> MSS_PENDING -> ZONE_HUNTING -> ENTRY_READY -> IN_TRADE
//!
//! 1. IDLE: wait for an armed level to be swept
//! 2. SWEEP_DETECTED: track the sweep extreme, wait for the structure shift
//! 3. MSS_PENDING: pick the entry model (zone or market)
//! 4. ZONE_HUNTING: find an imbalance zone and wait for the retrace
//! 5. ENTRY_READY: gates are checked and an entry intent is handed out
//! 6. IN_TRADE: until the position manager reports flat
//!
//! Several transitions can fire on the same bar; each one is evaluated in
//! order until the machine has to wait for the next bar.

use serde::Serialize;
use tracing::{debug, info};

use super::bars::{Bar, BarHistory, Direction};
use super::config::{EngineConfig, EntryModel, ZoneSource};
use super::instrument::Instrument;
use super::levels::{LevelBook, LevelId, LevelSide, LevelState};
use super::mss::{self, MssCheck};
use super::sweep::{self, SweepOutcome};
use super::swing::SwingHistory;
use super::zones::{self, ImbalanceZone, ZoneDirection, ZoneId, ZoneTracker};

/// Upper bound on transitions evaluated for one bar
const MAX_TRANSITIONS_PER_BAR: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum EntryState {
    #[default]
    Idle,
    SweepDetected,
    MssPending,
    ZoneHunting,
    EntryReady,
    InTrade,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Idle => write!(f, "IDLE"),
            EntryState::SweepDetected => write!(f, "SWEEP_DETECTED"),
            EntryState::MssPending => write!(f, "MSS_PENDING"),
            EntryState::ZoneHunting => write!(f, "ZONE_HUNTING"),
            EntryState::EntryReady => write!(f, "ENTRY_READY"),
            EntryState::InTrade => write!(f, "IN_TRADE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SignalKind {
    SweepDetected { side: LevelSide },
    MssConfirmed { direction: Direction },
    EntryLong { sweep_extreme: f64 },
    EntryShort { sweep_extreme: f64 },
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::SweepDetected { side } => write!(f, "SWEEP {}", side),
            SignalKind::MssConfirmed { direction } => write!(f, "MSS {}", direction),
            SignalKind::EntryLong { .. } => write!(f, "ENTRY LONG"),
            SignalKind::EntryShort { .. } => write!(f, "ENTRY SHORT"),
        }
    }
}

/// Discrete event emitted once per transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub bar_index: usize,
    pub price: f64,
    pub reason: String,
}

/// Everything the position manager needs to open a trade
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EntryIntent {
    pub direction: Direction,
    /// Intended entry (close of the triggering bar)
    pub price: f64,
    pub bar_index: usize,
    pub sweep_extreme: f64,
    pub signal_high: f64,
    pub signal_low: f64,
    pub level_id: LevelId,
    pub level_price: f64,
    pub zone: Option<ImbalanceZone>,
}

/// Conditions that must all hold for ENTRY_READY -> IN_TRADE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryGates {
    pub in_session: bool,
    pub cooldown_elapsed: bool,
    pub under_trade_limit: bool,
    pub flat: bool,
    pub not_killed: bool,
    pub before_cutoff: bool,
}

impl EntryGates {
    /// All gates passing
    pub fn open() -> Self {
        Self {
            in_session: true,
            cooldown_elapsed: true,
            under_trade_limit: true,
            flat: true,
            not_killed: true,
            before_cutoff: true,
        }
    }

    /// First failing gate, if any
    pub fn blocking_reason(&self) -> Option<&'static str> {
        if !self.in_session {
            Some("outside kill zone")
        } else if !self.before_cutoff {
            Some("past end-of-day cutoff")
        } else if !self.cooldown_elapsed {
            Some("cooldown active")
        } else if !self.under_trade_limit {
            Some("max trades per day reached")
        } else if !self.flat {
            Some("already in a position")
        } else if !self.not_killed {
            Some("daily loss limit reached")
        } else {
            None
        }
    }
}

/// The setup currently driving the machine
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Setup {
    pub level_id: LevelId,
    pub side: LevelSide,
    pub direction: Direction,
    pub sweep_index: usize,
    /// Opposite-side swing located at sweep time
    pub mss_level: f64,
    pub mss_index: Option<usize>,
    pub zone: Option<(ZoneId, ImbalanceZone)>,
    pub touched_index: Option<usize>,
}

/// Mutable collections and parameters the machine works against
pub struct EntryContext<'a> {
    pub bars: &'a BarHistory,
    pub swings: &'a SwingHistory,
    pub levels: &'a mut LevelBook,
    pub zones: &'a mut ZoneTracker,
    pub config: &'a EngineConfig,
    pub instrument: &'a Instrument,
}

/// What happened during one `step`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub signals: Vec<Signal>,
    pub intent: Option<EntryIntent>,
    /// Reasons for setups abandoned on this bar
    pub canceled: Vec<String>,
    /// Zones adopted by the setup on this bar
    pub zones: Vec<ImbalanceZone>,
    /// Levels swept on this bar
    pub swept: Vec<(LevelSide, f64)>,
}

#[derive(Debug, Clone, Default)]
pub struct EntryMachine {
    state: EntryState,
    setup: Option<Setup>,
}

impl EntryMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn setup(&self) -> Option<&Setup> {
        self.setup.as_ref()
    }

    /// Advance the machine with a completed bar
    pub fn step(&mut self, ctx: &mut EntryContext<'_>, bar: &Bar, index: usize, gates: &EntryGates) -> StepOutcome {
        let mut out = StepOutcome::default();
        for _ in 0..MAX_TRANSITIONS_PER_BAR {
            let advanced = match self.state {
                EntryState::Idle => self.on_idle(ctx, bar, index, &mut out),
                EntryState::SweepDetected => self.on_sweep_detected(ctx, bar, index, &mut out),
                EntryState::MssPending => self.on_mss_pending(ctx.config),
                EntryState::ZoneHunting => self.on_zone_hunting(ctx, bar, index, &mut out),
                EntryState::EntryReady => self.on_entry_ready(ctx, bar, index, gates, &mut out),
                EntryState::InTrade => false,
            };
            if !advanced {
                break;
            }
        }
        out
    }

    /// ENTRY_READY -> IN_TRADE once the order is filled
    pub fn enter(&mut self, levels: &mut LevelBook, bar_index: usize, price: f64) -> Option<Signal> {
        if self.state != EntryState::EntryReady {
            return None;
        }
        let setup = self.setup?;
        let level = levels.get_mut(setup.level_id)?;
        let sweep_extreme = level.sweep_extreme()?;
        let level_price = level.price;
        level.mark_traded();
        if levels.armed(setup.side) == Some(setup.level_id) {
            levels.disarm(setup.side);
        }
        self.state = EntryState::InTrade;

        let kind = match setup.direction {
            Direction::Long => SignalKind::EntryLong { sweep_extreme },
            Direction::Short => SignalKind::EntryShort { sweep_extreme },
        };
        Some(Signal {
            kind,
            bar_index,
            price,
            reason: format!(
                "{} {:.2} swept to {:.2}, MSS through {:.2}",
                setup.side, level_price, sweep_extreme, setup.mss_level
            ),
        })
    }

    /// Abandon an ENTRY_READY setup whose order could not be placed
    pub fn reject(&mut self, levels: &mut LevelBook, reason: &str) -> Option<String> {
        if self.state != EntryState::EntryReady {
            return None;
        }
        let mut out = StepOutcome::default();
        self.abandon(levels, format!("entry rejected: {}", reason), &mut out);
        out.canceled.pop()
    }

    /// Position went flat
    pub fn trade_closed(&mut self) {
        if self.state == EntryState::InTrade {
            self.state = EntryState::Idle;
            self.setup = None;
        }
    }

    /// Cancel any setup that has not been entered yet
    pub fn cancel_pending(&mut self, levels: &mut LevelBook, reason: &str) -> Option<String> {
        if matches!(self.state, EntryState::Idle | EntryState::InTrade) {
            return None;
        }
        let mut out = StepOutcome::default();
        self.abandon(levels, reason.to_string(), &mut out);
        out.canceled.pop()
    }

    fn abandon(&mut self, levels: &mut LevelBook, reason: String, out: &mut StepOutcome) {
        if let Some(setup) = self.setup.take() {
            if let Some(level) = levels.get_mut(setup.level_id) {
                level.cancel();
            }
            if levels.armed(setup.side) == Some(setup.level_id) {
                levels.disarm(setup.side);
            }
        }
        info!("STATE: {} -> IDLE | {}", self.state, reason);
        self.state = EntryState::Idle;
        out.canceled.push(reason);
    }

    fn on_idle(&mut self, ctx: &mut EntryContext<'_>, bar: &Bar, index: usize, out: &mut StepOutcome) -> bool {
        let cfg = ctx.config;
        for side in LevelSide::BOTH {
            let Some(id) = ctx.levels.armed(side) else {
                continue;
            };
            let Some(level) = ctx.levels.get_mut(id) else {
                continue;
            };
            if !level.tradable || level.state() != LevelState::Active {
                continue;
            }
            let outcome = sweep::check(
                level,
                bar,
                index,
                ctx.instrument,
                cfg.min_penetration_ticks,
                cfg.require_close_back,
            );
            let SweepOutcome::Swept { extreme } = outcome else {
                continue;
            };
            let level_price = level.price;
            out.swept.push((side, level_price));

            let trigger_kind = side.swing_kind().opposite();
            let Some(trigger) = ctx.swings.latest_before(trigger_kind, index).copied() else {
                level.cancel();
                ctx.levels.disarm(side);
                let reason = format!("{} {:.2} swept but no opposite swing for MSS", side, level_price);
                debug!("SWEEP: {}", reason);
                out.canceled.push(reason);
                continue;
            };

            let direction = side.setup_direction();
            self.setup = Some(Setup {
                level_id: id,
                side,
                direction,
                sweep_index: index,
                mss_level: trigger.price,
                mss_index: None,
                zone: None,
                touched_index: None,
            });
            self.state = EntryState::SweepDetected;
            info!(
                "SWEEP: {} {:.2} swept to {:.2} | {} setup, MSS trigger {:.2}",
                side, level_price, extreme, direction, trigger.price
            );
            out.signals.push(Signal {
                kind: SignalKind::SweepDetected { side },
                bar_index: index,
                price: extreme,
                reason: format!("{} {:.2} swept to {:.2}", side, level_price, extreme),
            });
            return true;
        }
        false
    }

    fn on_sweep_detected(
        &mut self,
        ctx: &mut EntryContext<'_>,
        bar: &Bar,
        index: usize,
        out: &mut StepOutcome,
    ) -> bool {
        let cfg = ctx.config;
        let Some(mut setup) = self.setup else {
            self.state = EntryState::Idle;
            return false;
        };

        if cfg.max_bars_to_mss > 0 && index.saturating_sub(setup.sweep_index) > cfg.max_bars_to_mss {
            self.abandon(ctx.levels, format!("no MSS within {} bars of sweep", cfg.max_bars_to_mss), out);
            return true;
        }

        let Some(level) = ctx.levels.get_mut(setup.level_id) else {
            self.abandon(ctx.levels, "swept level no longer tracked".to_string(), out);
            return false;
        };

        if index > setup.sweep_index {
            if let SweepOutcome::Extended { extreme } = sweep::check(
                level,
                bar,
                index,
                ctx.instrument,
                cfg.min_penetration_ticks,
                cfg.require_close_back,
            ) {
                debug!("SWEEP: {} extreme extended to {:.2}", setup.side, extreme);
            }
        }

        match mss::confirm(
            level,
            setup.mss_level,
            bar,
            cfg.mss_require_close,
            cfg.displacement_for_strictness(),
            ctx.instrument,
        ) {
            MssCheck::Confirmed => {
                setup.mss_index = Some(index);
                self.setup = Some(setup);
                self.state = EntryState::MssPending;
                info!(
                    "MSS: {} confirmed through {:.2} @ {:.2}",
                    setup.direction, setup.mss_level, bar.close
                );
                out.signals.push(Signal {
                    kind: SignalKind::MssConfirmed {
                        direction: setup.direction,
                    },
                    bar_index: index,
                    price: bar.close,
                    reason: format!(
                        "close {:.2} through {:.2} after {} sweep",
                        bar.close, setup.mss_level, setup.side
                    ),
                });
                true
            }
            MssCheck::WeakDisplacement { body, required } => {
                debug!(
                    "MSS: break of {:.2} rejected, body {:.2} <= {:.2} ({})",
                    setup.mss_level, body, required, cfg.strictness
                );
                false
            }
            MssCheck::NoBreak | MssCheck::NotPending => false,
        }
    }

    fn on_mss_pending(&mut self, config: &EngineConfig) -> bool {
        self.state = if config.entry_model.requires_zone() {
            EntryState::ZoneHunting
        } else {
            EntryState::EntryReady
        };
        true
    }

    fn on_zone_hunting(&mut self, ctx: &mut EntryContext<'_>, bar: &Bar, index: usize, out: &mut StepOutcome) -> bool {
        let cfg = ctx.config;
        let Some(mut setup) = self.setup else {
            self.state = EntryState::Idle;
            return false;
        };
        let mss_index = setup.mss_index.unwrap_or(setup.sweep_index);

        if cfg.max_bars_to_fill > 0 && index.saturating_sub(mss_index) > cfg.max_bars_to_fill {
            self.abandon(ctx.levels, format!("no fill within {} bars of MSS", cfg.max_bars_to_fill), out);
            return false;
        }

        let zone_id = match setup.zone {
            Some((id, _)) => id,
            None => match find_zone(ctx, &setup, index) {
                Some((id, zone)) => {
                    info!(
                        "ZONE: {} {} {:.2}-{:.2}{} for {} setup",
                        zone.direction,
                        zone.kind,
                        zone.bottom,
                        zone.top,
                        if zone.inverted { " (inverted)" } else { "" },
                        setup.direction
                    );
                    out.zones.push(zone);
                    setup.zone = Some((id, zone));
                    id
                }
                None => {
                    self.setup = Some(setup);
                    return false;
                }
            },
        };

        let adopted = setup.zone.map(|(_, z)| z);
        let zone = match (ctx.zones.get(zone_id), adopted) {
            (Some(zone), _) if zone.supports(setup.direction) => *zone,
            // Inverted by a close inside the zone: a deep retrace, not a close-through
            (Some(_), Some(adopted)) if !adopted.closed_beyond(bar) => adopted,
            _ => {
                self.abandon(ctx.levels, format!("{} zone invalidated", setup.direction), out);
                return false;
            }
        };
        setup.zone = Some((zone_id, zone));

        let touched_index = match setup.touched_index {
            Some(i) => i,
            None if index > zone.bar_index && index > mss_index && zone.touched_by(bar) => {
                debug!("ZONE: touched @ {:.2}-{:.2}", bar.low, bar.high);
                setup.touched_index = Some(index);
                index
            }
            None => {
                self.setup = Some(setup);
                return false;
            }
        };

        let ready = match cfg.entry_model {
            EntryModel::ZoneRejection => {
                if is_rejection_candle(setup.direction, &zone, bar) {
                    true
                } else if index - touched_index >= cfg.rejection_wait_bars {
                    ctx.zones.remove(zone_id);
                    setup.zone = None;
                    setup.touched_index = None;
                    debug!(
                        "ZONE: no rejection within {} bars, dropping {:.2}-{:.2}",
                        cfg.rejection_wait_bars, zone.bottom, zone.top
                    );
                    false
                } else {
                    false
                }
            }
            EntryModel::ZoneRetrace | EntryModel::Immediate => true,
        };

        self.setup = Some(setup);
        if ready {
            self.state = EntryState::EntryReady;
        }
        ready
    }

    fn on_entry_ready(
        &mut self,
        ctx: &mut EntryContext<'_>,
        bar: &Bar,
        index: usize,
        gates: &EntryGates,
        out: &mut StepOutcome,
    ) -> bool {
        if let Some(reason) = gates.blocking_reason() {
            info!("SKIPPED: entry blocked ({})", reason);
            self.abandon(ctx.levels, format!("entry blocked: {}", reason), out);
            return false;
        }
        let Some(setup) = self.setup else {
            self.state = EntryState::Idle;
            return false;
        };
        let Some((level_price, sweep_extreme)) = ctx
            .levels
            .get(setup.level_id)
            .and_then(|l| l.sweep_extreme().map(|e| (l.price, e)))
        else {
            self.abandon(ctx.levels, "level lost its sweep".to_string(), out);
            return false;
        };

        out.intent = Some(EntryIntent {
            direction: setup.direction,
            price: bar.close,
            bar_index: index,
            sweep_extreme,
            signal_high: bar.high,
            signal_low: bar.low,
            level_id: setup.level_id,
            level_price,
            zone: setup.zone.map(|(_, z)| z),
        });
        false
    }
}

/// Candle closing in the setup direction beyond the zone midpoint
pub fn is_rejection_candle(direction: Direction, zone: &ImbalanceZone, bar: &Bar) -> bool {
    match direction {
        Direction::Long => bar.is_bullish() && bar.close > zone.midpoint(),
        Direction::Short => bar.is_bearish() && bar.close < zone.midpoint(),
    }
}

fn find_zone(ctx: &mut EntryContext<'_>, setup: &Setup, index: usize) -> Option<(ZoneId, ImbalanceZone)> {
    let cfg = ctx.config;
    let direction = setup.direction;
    let mss_index = setup.mss_index.unwrap_or(setup.sweep_index);
    let min_gap = ctx.instrument.ticks(cfg.min_gap_ticks as f64);

    let gap = || {
        zones::scan(ctx.bars, index, min_gap).filter(|z| z.direction == ZoneDirection::from(direction))
    };
    let block = || {
        zones::order_block(ctx.bars, mss_index, direction, cfg.order_block_lookback).map(|mut z| {
            z.bar_index = index;
            z
        })
    };

    let found = match cfg.zone_source {
        ZoneSource::FairValueGap => gap(),
        ZoneSource::OrderBlock => block(),
        // The displacement gap can complete one bar after the MSS bar
        ZoneSource::Either => gap().or_else(|| if index > mss_index { block() } else { None }),
    };

    if let Some(zone) = found {
        if let Some(id) = ctx.zones.find_matching(&zone) {
            return Some((id, zone));
        }
        let (id, evicted) = ctx.zones.insert(zone);
        if !evicted.is_empty() {
            debug!("ZONE: evicted {} oldest zone(s)", evicted.len());
        }
        return Some((id, zone));
    }

    if cfg.use_inverted_zones {
        let armed_at = ctx.levels.get(setup.level_id).map_or(setup.sweep_index, |l| l.detected_index);
        return ctx.zones.find_inverted(direction, armed_at);
    }
    None
}
