//! Sweep engine
//!
//! One engine instance owns all state for one instrument and is driven one
//! completed bar at a time through [`SweepEngine::process_bar`]. Each bar is
//! sequenced as:
//!
//! 1. Daily reset when the session day changes
//! 2. Position resync against the executor
//! 3. Structure: swings, liquidity levels, zone aging
//! 4. End-of-day flatten (ends the bar when it fires)
//! 5. Entry state machine, then order routing for a new entry
//! 6. Position management for a trade opened on an earlier bar

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::execution::OrderExecution;

use super::bars::{average_true_range, Bar, BarHistory, Direction};
use super::config::{ConfigError, EngineConfig, TrailMode};
use super::instrument::Instrument;
use super::levels::{select_level, DayRange, LevelBook, LevelSide, LevelState, PriorLevels};
use super::position::{
    manage_bar, open_trade, open_trade_at_fill, ExitReason, ManagementAction, StopKind, TradeState,
};
use super::session::{SessionClock, TzSessionClock};
use super::state_machine::{EntryContext, EntryGates, EntryIntent, EntryMachine, EntryState, Signal};
use super::swing::{self, SwingHistory};
use super::zones::{self, ImbalanceZone, ZoneTracker};

/// Per-day counters, reset at the first bar of each session day
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyCounters {
    pub trades_today: u32,
    pub daily_realized_r: f64,
    pub last_reset_day: Option<NaiveDate>,
    pub eod_processed: bool,
    pub losses_today: u32,
    pub killed: bool,
}

impl DailyCounters {
    pub fn reset(&mut self, day: NaiveDate) {
        *self = Self {
            last_reset_day: Some(day),
            ..Self::default()
        };
    }

    /// Book a closed trade's R; true when this close trips the kill switch
    pub fn register_close(&mut self, r: f64, loss_limit_r: Option<f64>, max_losses: u32) -> bool {
        self.daily_realized_r += r;
        if r < 0.0 {
            self.losses_today += 1;
        }
        if self.killed {
            return false;
        }
        let r_breached = loss_limit_r.is_some_and(|limit| self.daily_realized_r <= limit);
        let count_breached = max_losses > 0 && self.losses_today >= max_losses;
        if r_breached || count_breached {
            self.killed = true;
            return true;
        }
        false
    }
}

/// Everything the engine emits for one bar
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    DailyReset {
        day: NaiveDate,
    },
    LevelArmed {
        side: LevelSide,
        price: f64,
        tradable: bool,
    },
    Signal(Signal),
    ZoneFound {
        zone: ImbalanceZone,
    },
    SetupCanceled {
        reason: String,
    },
    Entered {
        direction: Direction,
        price: f64,
        quantity: u32,
        stop: f64,
        target1: Option<f64>,
        target2: f64,
    },
    PartialExit {
        price: f64,
        quantity: u32,
        remaining: u32,
    },
    StopMoved {
        price: f64,
        kind: StopKind,
    },
    Exit {
        direction: Direction,
        price: f64,
        quantity: u32,
        r_multiple: f64,
        reason: ExitReason,
    },
    KillSwitch {
        daily_r: f64,
        losses: u32,
    },
    PositionResynced {
        direction: Direction,
        quantity: u32,
    },
}

impl std::fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::DailyReset { day } => write!(f, "DAILY RESET {}", day),
            EngineEvent::LevelArmed { side, price, tradable } => {
                write!(f, "LEVEL {} {:.2}{}", side, price, if *tradable { "" } else { " (untradable)" })
            }
            EngineEvent::Signal(signal) => write!(f, "{} @ {:.2} | {}", signal.kind, signal.price, signal.reason),
            EngineEvent::ZoneFound { zone } => {
                write!(f, "ZONE {} {} {:.2}-{:.2}", zone.direction, zone.kind, zone.bottom, zone.top)
            }
            EngineEvent::SetupCanceled { reason } => write!(f, "CANCELED | {}", reason),
            EngineEvent::Entered {
                direction,
                price,
                quantity,
                stop,
                target1,
                target2,
            } => {
                write!(f, "ENTERED {} {} @ {:.2} | stop {:.2}", direction, quantity, price, stop)?;
                if let Some(tp1) = target1 {
                    write!(f, " | TP1 {:.2}", tp1)?;
                }
                write!(f, " | TP2 {:.2}", target2)
            }
            EngineEvent::PartialExit { price, quantity, remaining } => {
                write!(f, "PARTIAL {} @ {:.2} | {} remaining", quantity, price, remaining)
            }
            EngineEvent::StopMoved { price, kind } => write!(f, "STOP {:?} -> {:.2}", kind, price),
            EngineEvent::Exit {
                direction,
                price,
                quantity,
                r_multiple,
                reason,
            } => write!(
                f,
                "EXIT {} {} {} @ {:.2} | {:+.2}R",
                reason, direction, quantity, price, r_multiple
            ),
            EngineEvent::KillSwitch { daily_r, losses } => {
                write!(f, "KILL SWITCH | {:+.2}R, {} losses", daily_r, losses)
            }
            EngineEvent::PositionResynced { direction, quantity } => {
                write!(f, "RESYNC | dropped {} {}", direction, quantity)
            }
        }
    }
}

/// Closed trade
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub day: Option<NaiveDate>,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub initial_stop: f64,
    pub quantity: u32,
    pub entry_index: usize,
    pub exit_index: usize,
    pub entry_time: i64,
    pub exit_time: i64,
    pub level_price: f64,
    /// Sum of points x contracts
    pub points: f64,
    pub r_multiple: f64,
    pub reason: ExitReason,
}

/// Aggregate over closed trades
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineSummary {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub scratches: usize,
    pub total_r: f64,
    pub total_points: f64,
    pub largest_win_r: f64,
    pub largest_loss_r: f64,
}

impl EngineSummary {
    pub fn from_records(records: &[TradeRecord]) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.trades += 1;
            summary.total_r += record.r_multiple;
            summary.total_points += record.points;
            if record.r_multiple > 1e-9 {
                summary.wins += 1;
                summary.largest_win_r = summary.largest_win_r.max(record.r_multiple);
            } else if record.r_multiple < -1e-9 {
                summary.losses += 1;
                summary.largest_loss_r = summary.largest_loss_r.min(record.r_multiple);
            } else {
                summary.scratches += 1;
            }
        }
        summary
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64 * 100.0
        }
    }
}

impl std::fmt::Display for EngineSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Trades:      {}", self.trades)?;
        writeln!(f, "Wins:        {} ({:.1}%)", self.wins, self.win_rate())?;
        writeln!(f, "Losses:      {}", self.losses)?;
        writeln!(f, "Scratches:   {}", self.scratches)?;
        writeln!(f, "Total R:     {:+.2}", self.total_r)?;
        writeln!(f, "Total pts:   {:+.2}", self.total_points)?;
        writeln!(f, "Best trade:  {:+.2}R", self.largest_win_r)?;
        write!(f, "Worst trade: {:+.2}R", self.largest_loss_r)
    }
}

/// All mutable per-instrument state
#[derive(Debug, Clone)]
pub struct EngineState {
    pub bars: BarHistory,
    pub swings: SwingHistory,
    pub levels: LevelBook,
    pub zones: ZoneTracker,
    pub machine: EntryMachine,
    pub trade: Option<TradeState>,
    pub counters: DailyCounters,
    pub day_range: DayRange,
    pub prior: Option<PriorLevels>,
    /// Level prices swept or aged out today; not re-armed until the reset
    pub consumed: Vec<(LevelSide, f64)>,
    pub last_exit_index: Option<usize>,
    pub last_bar_time: Option<i64>,
}

impl EngineState {
    fn new(config: &EngineConfig) -> Self {
        Self {
            bars: BarHistory::new(config.history_bars.max(config.swing_strength * 2 + 3)),
            swings: SwingHistory::new(config.swing_retention_minutes),
            levels: LevelBook::new(config.level_history),
            zones: ZoneTracker::new(config.max_active_zones),
            machine: EntryMachine::new(),
            trade: None,
            counters: DailyCounters::default(),
            day_range: DayRange::default(),
            prior: None,
            consumed: Vec::new(),
            last_exit_index: None,
            last_bar_time: None,
        }
    }
}

/// Sweep -> MSS -> zone entry engine with position management
pub struct SweepEngine<E: OrderExecution, C: SessionClock = TzSessionClock> {
    instrument: Instrument,
    config: EngineConfig,
    pending_config: Option<EngineConfig>,
    clock: C,
    executor: E,
    state: EngineState,
    records: Vec<TradeRecord>,
}

impl<E: OrderExecution> SweepEngine<E, TzSessionClock> {
    /// Engine on the New York session clock
    pub fn new(instrument: Instrument, config: EngineConfig, executor: E) -> Result<Self, ConfigError> {
        Self::with_clock(instrument, config, executor, TzSessionClock::default())
    }
}

impl<E: OrderExecution, C: SessionClock> SweepEngine<E, C> {
    pub fn with_clock(
        instrument: Instrument,
        config: EngineConfig,
        executor: E,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate(&instrument)?;
        info!(
            "Sweep engine: {} (tick {}) | levels {:?} | entry {:?} | max {} trades/day",
            instrument.symbol,
            instrument.tick_size,
            config.liquidity_mode,
            config.entry_model,
            config.max_trades_per_day
        );
        let state = EngineState::new(&config);
        Ok(Self {
            instrument,
            config,
            pending_config: None,
            clock,
            executor,
            state,
            records: Vec::new(),
        })
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn machine_state(&self) -> EntryState {
        self.state.machine.state()
    }

    pub fn counters(&self) -> &DailyCounters {
        &self.state.counters
    }

    pub fn trade(&self) -> Option<&TradeState> {
        self.state.trade.as_ref()
    }

    pub fn records(&self) -> &[TradeRecord] {
        &self.records
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    pub fn summary(&self) -> EngineSummary {
        EngineSummary::from_records(&self.records)
    }

    /// Validate `config` and apply it at the next daily reset
    pub fn queue_config(&mut self, config: EngineConfig) -> Result<(), ConfigError> {
        config.validate(&self.instrument)?;
        info!("CONFIG: new configuration queued for next session");
        self.pending_config = Some(config);
        Ok(())
    }

    /// Seed the prior-period range (replaced by the tracked range at the next day roll)
    pub fn set_prior_levels(&mut self, prior: PriorLevels) {
        info!("DAILY: prior range set {:.2}-{:.2}", prior.low, prior.high);
        self.state.prior = Some(prior);
    }

    /// Process one bar; incomplete and out-of-order bars are ignored
    pub fn process_bar(&mut self, bar: &Bar) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if !bar.is_complete {
            return events;
        }
        if let Some(last) = self.state.last_bar_time {
            if bar.start_time < last {
                warn!("Out-of-order bar at {} (last {}), skipped", bar.start_time, last);
                return events;
            }
        }
        self.state.last_bar_time = Some(bar.start_time);

        let session = self.clock.resolve(bar.start_time);
        self.roll_day(session.day, &mut events);

        let index = self.state.bars.push(bar.clone());
        self.state.day_range.update(bar);

        self.resync_position(index, &mut events);
        self.update_structure(bar, index, &mut events);

        let eod_due = !self.state.counters.eod_processed
            && self
                .config
                .eod_cutoff_minute
                .is_some_and(|cutoff| session.minute_of_day >= cutoff);
        if eod_due {
            self.flatten_for_eod(bar, index, &mut events);
            return events;
        }

        self.run_entry_machine(bar, index, session.minute_of_day, &mut events);
        self.manage_position(bar, index, &mut events);
        events
    }

    fn roll_day(&mut self, day: NaiveDate, events: &mut Vec<EngineEvent>) {
        let previous = self.state.counters.last_reset_day;
        if previous == Some(day) {
            return;
        }

        if let Some(prior) = self.state.day_range.finish(previous) {
            info!("DAILY: prior range {:.2}-{:.2}", prior.low, prior.high);
            self.state.prior = Some(prior);
        }
        if let Some(config) = self.pending_config.take() {
            info!("CONFIG: applying queued configuration");
            self.apply_config(config);
        }

        let st = &mut self.state;
        if let Some(reason) = st.machine.cancel_pending(&mut st.levels, "daily reset") {
            events.push(EngineEvent::SetupCanceled { reason });
        }
        let cleared = st.levels.clear_pending();
        st.zones.clear();
        st.consumed.clear();
        st.counters.reset(day);
        debug!("DAILY: reset for {} | cleared {} levels", day, cleared);
        events.push(EngineEvent::DailyReset { day });
    }

    fn apply_config(&mut self, config: EngineConfig) {
        self.state.levels.set_history_limit(config.level_history);
        self.state.zones.set_capacity(config.max_active_zones);
        self.state.swings.set_retention_minutes(config.swing_retention_minutes);
        self.config = config;
    }

    fn resync_position(&mut self, index: usize, events: &mut Vec<EngineEvent>) {
        if self.executor.position() != 0 {
            return;
        }
        let Some(trade) = self.state.trade.take() else {
            return;
        };
        warn!(
            "RESYNC: executor is flat but {} {} was open, dropping trade state",
            trade.direction, trade.quantity
        );
        self.state.machine.trade_closed();
        self.state.last_exit_index = Some(index);
        events.push(EngineEvent::PositionResynced {
            direction: trade.direction,
            quantity: trade.quantity,
        });
    }

    fn update_structure(&mut self, bar: &Bar, index: usize, events: &mut Vec<EngineEvent>) {
        let st = &mut self.state;
        for point in swing::detect_all(&st.bars, index, self.config.swing_strength) {
            debug!("SWING: {:?} {:.2} @ bar {}", point.kind, point.price, point.bar_index);
            st.swings.push(point);
        }
        st.swings.prune(bar.start_time);

        for side in LevelSide::BOTH {
            self.arm_level(side, bar, index, events);
        }

        let cfg = &self.config;
        for (id, update) in self
            .state
            .zones
            .update(bar, index, cfg.zone_max_age, cfg.allow_zone_inversion)
        {
            debug!("ZONE: {:?} {}", id, update);
        }

        // Gaps are tracked as they form so they can later invert
        let min_gap = self.instrument.ticks(cfg.min_gap_ticks as f64);
        if let Some(gap) = zones::scan(&self.state.bars, index, min_gap) {
            let tracker = &mut self.state.zones;
            if tracker.find_matching(&gap).is_none() {
                let (id, evicted) = tracker.insert(gap);
                debug!(
                    "ZONE: tracking {} {:.2}-{:.2} as {:?} ({} evicted)",
                    gap.direction,
                    gap.bottom,
                    gap.top,
                    id,
                    evicted.len()
                );
            }
        }
    }

    /// Keep one armed level per side in line with the selector
    fn arm_level(&mut self, side: LevelSide, bar: &Bar, index: usize, events: &mut Vec<EngineEvent>) {
        let cfg = &self.config;
        let instrument = &self.instrument;
        let st = &mut self.state;

        let candidate = select_level(
            cfg.liquidity_mode,
            side,
            st.prior.as_ref(),
            &st.swings,
            instrument.ticks(cfg.cluster_tolerance_ticks as f64),
            cfg.cluster_lookback,
        );

        if let Some(level) = st.levels.armed_level(side) {
            let (id, state, price) = (level.id, level.state(), level.price);
            if state != LevelState::Active {
                // Driving the state machine
                return;
            }
            let aged =
                cfg.level_max_age_bars > 0 && index.saturating_sub(level.detected_index) > cfg.level_max_age_bars;
            let unchanged = candidate.map_or(true, |c| instrument.same_price(c.price, price));
            if aged {
                debug!("LEVEL: {} {:.2} aged out", side, price);
                st.consumed.push((side, price));
            } else if unchanged {
                return;
            } else {
                debug!("LEVEL: {} {:.2} superseded", side, price);
            }
            if let Some(level) = st.levels.get_mut(id) {
                level.cancel();
            }
            st.levels.disarm(side);
        }

        let Some(candidate) = candidate else {
            return;
        };
        if st
            .consumed
            .iter()
            .any(|(s, p)| *s == side && instrument.same_price(*p, candidate.price))
        {
            return;
        }

        let degenerate = candidate.from_prior
            && st
                .prior
                .is_some_and(|p| p.is_degenerate(cfg.min_range_points, cfg.max_range_points));
        let price = instrument.round(candidate.price);
        st.levels.arm(price, side, bar.start_time, index, !degenerate);
        if degenerate {
            debug!("LEVEL: {} {:.2} untradable, prior range outside bounds", side, price);
        } else {
            info!("LEVEL: armed {} {:.2}", side, price);
        }
        events.push(EngineEvent::LevelArmed {
            side,
            price,
            tradable: !degenerate,
        });
    }

    fn entry_gates(&self, index: usize, minute_of_day: u32) -> EntryGates {
        let cfg = &self.config;
        let counters = &self.state.counters;
        EntryGates {
            in_session: cfg.kill_zones.is_empty() || cfg.kill_zones.iter().any(|w| w.contains(minute_of_day)),
            cooldown_elapsed: self
                .state
                .last_exit_index
                .map_or(true, |exit| index.saturating_sub(exit) >= cfg.cooldown_bars),
            under_trade_limit: counters.trades_today < cfg.max_trades_per_day,
            flat: self.state.trade.is_none() && self.executor.position() == 0,
            not_killed: !counters.killed,
            before_cutoff: !counters.eod_processed && cfg.eod_cutoff_minute.map_or(true, |c| minute_of_day < c),
        }
    }

    fn run_entry_machine(&mut self, bar: &Bar, index: usize, minute_of_day: u32, events: &mut Vec<EngineEvent>) {
        let gates = self.entry_gates(index, minute_of_day);
        let st = &mut self.state;
        let mut ctx = EntryContext {
            bars: &st.bars,
            swings: &st.swings,
            levels: &mut st.levels,
            zones: &mut st.zones,
            config: &self.config,
            instrument: &self.instrument,
        };
        let outcome = st.machine.step(&mut ctx, bar, index, &gates);

        st.consumed.extend(outcome.swept.iter().copied());
        events.extend(outcome.signals.into_iter().map(EngineEvent::Signal));
        events.extend(outcome.zones.into_iter().map(|zone| EngineEvent::ZoneFound { zone }));
        events.extend(
            outcome
                .canceled
                .into_iter()
                .map(|reason| EngineEvent::SetupCanceled { reason }),
        );

        if let Some(intent) = outcome.intent {
            self.open_position(&intent, bar, index, events);
        }
    }

    fn reject_entry(&mut self, reason: &str, events: &mut Vec<EngineEvent>) {
        let st = &mut self.state;
        if let Some(reason) = st.machine.reject(&mut st.levels, reason) {
            events.push(EngineEvent::SetupCanceled { reason });
        }
    }

    fn open_position(&mut self, intent: &EntryIntent, bar: &Bar, index: usize, events: &mut Vec<EngineEvent>) {
        let quantity = self.config.contracts;
        let plan = match open_trade(
            intent,
            intent.price,
            quantity,
            bar.start_time,
            &self.config,
            &self.instrument,
            self.state.prior.as_ref(),
        ) {
            Ok(plan) => plan,
            Err(rejected) => {
                info!("SKIPPED: {} {}", intent.direction, rejected);
                self.reject_entry(&rejected.to_string(), events);
                return;
            }
        };

        self.executor.set_reference_price(intent.price);
        let sent = match intent.direction {
            Direction::Long => self.executor.buy(quantity),
            Direction::Short => self.executor.sell(quantity),
        };
        if let Err(e) = sent {
            error!("ENTRY FAILED: {} {} | {:#}", intent.direction, quantity, e);
            self.reject_entry("order failed", events);
            return;
        }

        let fill = self.executor.last_fill_price().unwrap_or(intent.price);
        let trade = if self.instrument.same_price(fill, plan.entry_price) {
            plan
        } else {
            let prior = self.state.prior.as_ref();
            match open_trade(intent, fill, quantity, bar.start_time, &self.config, &self.instrument, prior) {
                Ok(trade) => trade,
                Err(rejected) => {
                    warn!("ENTRY: filled at {:.2}, {}, clamping stop", fill, rejected);
                    open_trade_at_fill(intent, fill, quantity, bar.start_time, &self.config, &self.instrument, prior)
                }
            }
        };

        let st = &mut self.state;
        match st.machine.enter(&mut st.levels, index, trade.entry_price) {
            Some(signal) => events.push(EngineEvent::Signal(signal)),
            None => warn!("ENTRY: filled without an entry-ready setup"),
        }
        st.counters.trades_today += 1;
        info!(
            "ENTRY: {} {} @ {:.2} | stop {:.2} | TP1 {} | TP2 {:.2} | trade {}/{}",
            trade.direction,
            trade.quantity,
            trade.entry_price,
            trade.stop_price,
            trade.target1.map_or("-".to_string(), |t| format!("{:.2}", t)),
            trade.target2,
            st.counters.trades_today,
            self.config.max_trades_per_day
        );
        events.push(EngineEvent::Entered {
            direction: trade.direction,
            price: trade.entry_price,
            quantity: trade.quantity,
            stop: trade.stop_price,
            target1: trade.target1,
            target2: trade.target2,
        });
        st.trade = Some(trade);
    }

    fn manage_position(&mut self, bar: &Bar, index: usize, events: &mut Vec<EngineEvent>) {
        let atr = match self.config.trail_mode {
            TrailMode::Atr { period, .. } => average_true_range(&self.state.bars, index, period),
            _ => None,
        };
        let Some(trade) = self.state.trade.as_mut() else {
            return;
        };
        if trade.entry_index >= index {
            return;
        }
        let before = trade.clone();
        let actions = manage_bar(trade, bar, index, false, &self.config, &self.instrument, atr);
        self.apply_actions(actions, before, bar, index, events);
    }

    fn flatten_for_eod(&mut self, bar: &Bar, index: usize, events: &mut Vec<EngineEvent>) {
        let st = &mut self.state;
        if let Some(reason) = st.machine.cancel_pending(&mut st.levels, "end-of-day cutoff") {
            events.push(EngineEvent::SetupCanceled { reason });
        }

        if let Some(trade) = self.state.trade.as_mut() {
            let before = trade.clone();
            let actions = manage_bar(trade, bar, index, true, &self.config, &self.instrument, None);
            self.apply_actions(actions, before, bar, index, events);
        }

        if self.state.trade.is_none() && self.executor.position() != 0 {
            self.executor.set_reference_price(bar.close);
            if let Err(e) = self.executor.close_at_market() {
                error!("EOD FLATTEN FAILED: {:#}", e);
            }
        }
        if self.state.trade.is_some() || self.executor.position() != 0 {
            warn!("EOD: still positioned, retrying next bar");
            return;
        }
        self.state.counters.eod_processed = true;
        info!("EOD: flat, entries closed until next session");
    }

    /// Route booked exits to the executor
    ///
    /// An order the executor refuses rolls the trade back to what was last
    /// filled and skips the remaining actions; the next bar re-evaluates.
    fn apply_actions(
        &mut self,
        actions: Vec<ManagementAction>,
        before: TradeState,
        bar: &Bar,
        index: usize,
        events: &mut Vec<EngineEvent>,
    ) {
        let mut filled = before;
        for action in actions {
            match action {
                ManagementAction::PartialExit { price, quantity } => {
                    let Some(trade) = self.state.trade.as_ref() else {
                        break;
                    };
                    let (direction, remaining) = (trade.direction, trade.quantity);
                    self.executor.set_reference_price(price);
                    let sent = match direction {
                        Direction::Long => self.executor.sell(quantity),
                        Direction::Short => self.executor.buy(quantity),
                    };
                    if let Err(e) = sent {
                        error!("PARTIAL FAILED: {} {} | {:#}, retrying next bar", direction, quantity, e);
                        if let Some(trade) = self.state.trade.as_mut() {
                            restore_unfilled(trade, &filled, true);
                        }
                        return;
                    }
                    filled.realized_points += filled.points_at(price) * quantity as f64;
                    filled.quantity = filled.quantity.saturating_sub(quantity);
                    filled.partial_taken = true;
                    events.push(EngineEvent::PartialExit {
                        price,
                        quantity,
                        remaining,
                    });
                }
                ManagementAction::StopMoved { price, kind } => {
                    events.push(EngineEvent::StopMoved { price, kind });
                }
                ManagementAction::FullExit { price, quantity, reason } => {
                    if !self.close_trade(price, quantity, reason, bar, index, events) {
                        if let Some(trade) = self.state.trade.as_mut() {
                            restore_unfilled(trade, &filled, false);
                        }
                        return;
                    }
                }
            }
        }
    }

    fn close_trade(
        &mut self,
        price: f64,
        quantity: u32,
        reason: ExitReason,
        bar: &Bar,
        index: usize,
        events: &mut Vec<EngineEvent>,
    ) -> bool {
        let Some(direction) = self.state.trade.as_ref().map(|t| t.direction) else {
            return false;
        };
        self.executor.set_reference_price(price);
        if let Err(e) = self.executor.close_at_market() {
            error!("EXIT FAILED: {} {} {} | {:#}, retrying next bar", reason, direction, quantity, e);
            return false;
        }
        let Some(trade) = self.state.trade.take() else {
            return false;
        };

        let r = trade.realized_r();
        info!(
            "EXIT {}: {} {} @ {:.2} | {:+.2}R",
            reason, trade.direction, quantity, price, r
        );
        self.records.push(TradeRecord {
            id: trade.id,
            day: self.state.counters.last_reset_day,
            direction: trade.direction,
            entry_price: trade.entry_price,
            exit_price: price,
            initial_stop: trade.initial_stop,
            quantity: trade.initial_quantity,
            entry_index: trade.entry_index,
            exit_index: index,
            entry_time: trade.entry_time,
            exit_time: bar.start_time,
            level_price: trade.level_price,
            points: trade.realized_points,
            r_multiple: r,
            reason,
        });
        self.state.machine.trade_closed();
        self.state.last_exit_index = Some(index);
        events.push(EngineEvent::Exit {
            direction: trade.direction,
            price,
            quantity,
            r_multiple: r,
            reason,
        });

        let counters = &mut self.state.counters;
        if counters.register_close(r, self.config.daily_loss_limit_r, self.config.max_daily_losses) {
            warn!(
                "KILL SWITCH: daily {:+.2}R after {} losses, entries blocked until next session",
                counters.daily_realized_r, counters.losses_today
            );
            events.push(EngineEvent::KillSwitch {
                daily_r: counters.daily_realized_r,
                losses: counters.losses_today,
            });
        }
        true
    }
}

/// Undo exits `manage_bar` booked but the executor never filled
///
/// `with_stops` also reverts the stop changes that hang off a partial.
fn restore_unfilled(trade: &mut TradeState, filled: &TradeState, with_stops: bool) {
    trade.quantity = filled.quantity;
    trade.realized_points = filled.realized_points;
    trade.partial_taken = filled.partial_taken;
    if with_stops {
        trade.stop_price = filled.stop_price;
        trade.be_activated = filled.be_activated;
        trade.trail_active = filled.trail_active;
        trade.trail_stop = filled.trail_stop;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::SimulatedExecution;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn utc_engine(config: EngineConfig) -> SweepEngine<SimulatedExecution> {
        SweepEngine::with_clock(
            Instrument::default(),
            config,
            SimulatedExecution::new("NQ"),
            TzSessionClock::new(chrono_tz::UTC),
        )
        .unwrap()
    }

    #[test]
    fn test_kill_switch_after_second_loss() {
        let mut counters = DailyCounters::default();
        assert!(!counters.register_close(-1.2, Some(-2.0), 0));
        assert!(!counters.killed);
        assert!(counters.register_close(-1.2, Some(-2.0), 0));
        assert!(counters.killed);
        // Already tripped: does not fire again
        assert!(!counters.register_close(-1.0, Some(-2.0), 0));

        let mut counters = DailyCounters::default();
        assert!(!counters.register_close(-0.5, None, 2));
        assert!(counters.register_close(-0.5, None, 2));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = SweepEngine::new(
            Instrument::default(),
            EngineConfig {
                max_trades_per_day: 0,
                ..Default::default()
            },
            SimulatedExecution::new("NQ"),
        );
        assert!(matches!(result, Err(ConfigError::NoTradesAllowed)));
    }

    #[test]
    fn test_daily_reset_rolls_prior_range_once_per_day() {
        let mut engine = utc_engine(EngineConfig {
            eod_cutoff_minute: None,
            ..Default::default()
        });
        let events = engine.process_bar(&Bar::new(0, 100.0, 105.0, 99.0, 104.0, 1.0));
        assert_eq!(events.iter().filter(|e| matches!(e, EngineEvent::DailyReset { .. })).count(), 1);
        assert!(engine.state().prior.is_none());

        let events = engine.process_bar(&Bar::new(60_000, 104.0, 106.0, 103.0, 105.0, 1.0));
        assert!(!events.iter().any(|e| matches!(e, EngineEvent::DailyReset { .. })));

        // Gap of several days still resets exactly once
        let events = engine.process_bar(&Bar::new(3 * DAY_MS, 105.0, 105.5, 104.5, 105.0, 1.0));
        assert_eq!(events.iter().filter(|e| matches!(e, EngineEvent::DailyReset { .. })).count(), 1);
        let prior = engine.state().prior.unwrap();
        assert_eq!((prior.low, prior.high), (99.0, 106.0));
        // Prior extremes armed on both sides
        assert_eq!(engine.state().levels.armed_level(LevelSide::High).unwrap().price, 106.0);
        assert_eq!(engine.state().levels.armed_level(LevelSide::Low).unwrap().price, 99.0);
    }

    #[test]
    fn test_degenerate_prior_range_is_untradable() {
        let mut engine = utc_engine(EngineConfig {
            min_range_points: 50.0,
            eod_cutoff_minute: None,
            ..Default::default()
        });
        engine.set_prior_levels(PriorLevels {
            day: None,
            high: 110.0,
            low: 100.0,
        });
        let events = engine.process_bar(&Bar::new(0, 105.0, 105.5, 104.5, 105.0, 1.0));
        assert!(events.contains(&EngineEvent::LevelArmed {
            side: LevelSide::High,
            price: 110.0,
            tradable: false,
        }));
        assert!(!engine.state().levels.armed_level(LevelSide::Low).unwrap().tradable);
    }

    #[test]
    fn test_incomplete_and_out_of_order_bars_ignored() {
        let mut engine = utc_engine(EngineConfig::default());
        let mut partial = Bar::new(60_000, 100.0, 101.0, 99.0, 100.5, 1.0);
        partial.is_complete = false;
        assert!(engine.process_bar(&partial).is_empty());

        engine.process_bar(&Bar::new(120_000, 100.0, 101.0, 99.0, 100.5, 1.0));
        assert!(engine.process_bar(&Bar::new(60_000, 100.0, 101.0, 99.0, 100.5, 1.0)).is_empty());
        assert_eq!(engine.state().bars.last_index(), Some(0));
    }

    #[test]
    fn test_queued_config_applies_at_reset() {
        let mut engine = utc_engine(EngineConfig::default());
        engine.process_bar(&Bar::new(0, 100.0, 101.0, 99.0, 100.5, 1.0));
        let next = EngineConfig {
            max_trades_per_day: 5,
            ..Default::default()
        };
        assert!(engine
            .queue_config(EngineConfig {
                partial_percent: 150.0,
                ..Default::default()
            })
            .is_err());
        engine.queue_config(next).unwrap();
        engine.process_bar(&Bar::new(60_000, 100.0, 101.0, 99.0, 100.5, 1.0));
        assert_eq!(engine.config().max_trades_per_day, 2);
        engine.process_bar(&Bar::new(DAY_MS, 100.0, 101.0, 99.0, 100.5, 1.0));
        assert_eq!(engine.config().max_trades_per_day, 5);
    }
}
