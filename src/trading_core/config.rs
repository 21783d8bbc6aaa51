//! Engine configuration
//!
//! One flat parameter set covering every threshold of the detectors, the
//! entry state machine and the position manager. Every field has a default,
//! so a partial JSON file only overrides what it names.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use super::instrument::Instrument;
use super::levels::LiquidityMode;
use super::mss::{DisplacementTicks, Strictness};
use super::session::SessionWindow;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Construction-time misconfiguration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("tick size must be positive, got {tick_size}")]
    InvalidTickSize { tick_size: f64 },

    #[error("max_trades_per_day must be at least 1")]
    NoTradesAllowed,

    #[error("swing_strength must be at least 1")]
    ZeroSwingStrength,

    #[error("min_stop_points ({min}) exceeds max_stop_points ({max})")]
    StopBounds { min: f64, max: f64 },

    #[error("partial_percent must be in (0, 100], got {0}")]
    PartialPercent(f64),

    #[error("max_active_zones must be at least 1")]
    ZeroZoneCapacity,

    #[error("daily_loss_limit_r must be negative, got {0}")]
    DailyLossLimit(f64),

    #[error("session time {minute} is outside a day (0..1440)")]
    SessionTime { minute: u32 },

    #[error("trailing distance must be positive")]
    TrailDistance,

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// How an entry is taken once MSS confirms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryModel {
    /// Market entry on the MSS bar
    Immediate,
    /// Enter when price retraces into the zone
    ZoneRetrace,
    /// Zone retrace plus a rejection candle within `rejection_wait_bars`
    ZoneRejection,
}

impl EntryModel {
    pub fn requires_zone(self) -> bool {
        !matches!(self, EntryModel::Immediate)
    }
}

/// Where entry zones come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneSource {
    FairValueGap,
    OrderBlock,
    /// Gap first, order block as fallback
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StopMode {
    /// Entry -/+ fixed points
    Fixed { points: f64 },
    /// Beyond the sweep extreme
    Structural { buffer_ticks: u32 },
    /// Beyond the entry-signal bar's low/high
    SignalBar { buffer_ticks: u32 },
}

/// Final target (TP2)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TargetMode {
    RMultiple { r: f64 },
    FixedPoints { points: f64 },
    /// Prior-range midpoint
    Equilibrium,
    /// Prior-range boundary on the far side
    OppositeLevel,
}

/// Partial target (TP1)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PartialTargetMode {
    Disabled,
    RMultiple { r: f64 },
    FixedPoints { points: f64 },
    /// Prior-range midpoint, else halfway to TP2
    RangeMidpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TrailMode {
    Disabled,
    Fixed { points: f64 },
    /// `multiple` x simple ATR over `period` bars
    Atr { period: usize, multiple: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailArming {
    Immediate,
    AfterPartial,
}

/// What to do when the computed stop is wider than `max_stop_points`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OversizeStopPolicy {
    Clamp,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Swings
    pub swing_strength: usize,           // Bars each side of a pivot
    pub swing_retention_minutes: i64,    // Swing history kept by elapsed time

    // Liquidity levels
    pub liquidity_mode: LiquidityMode,
    pub cluster_tolerance_ticks: u32,    // Equal highs/lows tolerance
    pub cluster_lookback: usize,         // Recent swings considered for clusters
    pub min_range_points: f64,           // Prior range narrower than this is untradable (0 = off)
    pub max_range_points: f64,           // Prior range wider than this is untradable (0 = off)
    pub level_max_age_bars: usize,       // Cancel an unswept level after this many bars (0 = off)

    // Sweep
    pub min_penetration_ticks: u32,
    pub require_close_back: bool,

    // MSS
    pub mss_require_close: bool,
    pub strictness: Strictness,
    pub displacement_ticks: DisplacementTicks,
    pub max_bars_to_mss: usize,          // Cancel the sweep if no MSS within this many bars (0 = off)

    // Entry model and zones
    pub entry_model: EntryModel,
    pub zone_source: ZoneSource,
    pub min_gap_ticks: u32,
    pub zone_max_age: usize,             // Bars
    pub max_active_zones: usize,
    pub allow_zone_inversion: bool,
    pub use_inverted_zones: bool,
    pub order_block_lookback: usize,
    pub rejection_wait_bars: usize,
    pub max_bars_to_fill: usize,         // Bars after MSS to get filled (0 = off)

    // Gating
    pub kill_zones: Vec<SessionWindow>,  // Empty = no time restriction
    pub cooldown_bars: usize,            // Bars after an exit before the next entry
    pub max_trades_per_day: u32,
    pub daily_loss_limit_r: Option<f64>, // Negative R that trips the kill switch
    pub max_daily_losses: u32,           // Losing trades that trip the kill switch (0 = off)
    pub contracts: u32,

    // Stops and targets
    pub stop_mode: StopMode,
    pub min_stop_points: f64,            // 0 = no minimum
    pub max_stop_points: f64,            // 0 = no maximum
    pub oversize_stop_policy: OversizeStopPolicy,
    pub target_mode: TargetMode,
    pub fallback_target_r: f64,          // Used when the target is not beyond entry
    pub partial_target: PartialTargetMode,
    pub partial_percent: f64,

    // Breakeven and trailing
    pub breakeven_on_partial: bool,
    pub breakeven_trigger_points: f64,   // 0 = off
    pub breakeven_offset_ticks: u32,
    pub trail_mode: TrailMode,
    pub trail_arming: TrailArming,

    // Time exits
    pub max_bars_in_trade: usize,        // 0 = off
    pub no_progress_bars: usize,         // 0 = off
    pub no_progress_r: f64,
    pub eod_cutoff_minute: Option<u32>,  // Minutes after local midnight

    // Bookkeeping
    pub history_bars: usize,
    pub level_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            swing_strength: 3,
            swing_retention_minutes: 24 * 60,

            liquidity_mode: LiquidityMode::PriorExtreme,
            cluster_tolerance_ticks: 4,
            cluster_lookback: 10,
            min_range_points: 0.0,
            max_range_points: 0.0,
            level_max_age_bars: 0,

            min_penetration_ticks: 2,
            require_close_back: true,

            mss_require_close: true,
            strictness: Strictness::Balanced,
            displacement_ticks: DisplacementTicks::default(),
            max_bars_to_mss: 30,

            entry_model: EntryModel::ZoneRetrace,
            zone_source: ZoneSource::FairValueGap,
            min_gap_ticks: 4,
            zone_max_age: 60,
            max_active_zones: 10,
            allow_zone_inversion: true,
            use_inverted_zones: false,
            order_block_lookback: 5,
            rejection_wait_bars: 3,
            max_bars_to_fill: 40,

            kill_zones: vec![SessionWindow::new(9, 30, 11, 0)],
            cooldown_bars: 5,
            max_trades_per_day: 2,
            daily_loss_limit_r: Some(-2.0),
            max_daily_losses: 0,
            contracts: 1,

            stop_mode: StopMode::Structural { buffer_ticks: 2 },
            min_stop_points: 0.0,
            max_stop_points: 0.0,
            oversize_stop_policy: OversizeStopPolicy::Clamp,
            target_mode: TargetMode::RMultiple { r: 2.0 },
            fallback_target_r: 2.0,
            partial_target: PartialTargetMode::RMultiple { r: 1.0 },
            partial_percent: 50.0,

            breakeven_on_partial: true,
            breakeven_trigger_points: 0.0,
            breakeven_offset_ticks: 0,
            trail_mode: TrailMode::Disabled,
            trail_arming: TrailArming::AfterPartial,

            max_bars_in_trade: 0,
            no_progress_bars: 0,
            no_progress_r: 0.5,
            eod_cutoff_minute: Some(15 * 60 + 55),

            history_bars: 500,
            level_history: 64,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Displacement requirement for the configured strictness
    pub fn displacement_for_strictness(&self) -> Option<u32> {
        self.displacement_ticks.for_strictness(self.strictness)
    }

    /// Reject settings that would make the engine misbehave
    pub fn validate(&self, instrument: &Instrument) -> Result<(), ConfigError> {
        if !(instrument.tick_size > 0.0) {
            return Err(ConfigError::InvalidTickSize {
                tick_size: instrument.tick_size,
            });
        }
        if self.max_trades_per_day < 1 {
            return Err(ConfigError::NoTradesAllowed);
        }
        if self.swing_strength == 0 {
            return Err(ConfigError::ZeroSwingStrength);
        }
        if self.min_stop_points < 0.0 || self.max_stop_points < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "min_stop_points/max_stop_points",
                reason: "stop bounds cannot be negative".to_string(),
            });
        }
        if self.max_stop_points > 0.0 && self.min_stop_points > self.max_stop_points {
            return Err(ConfigError::StopBounds {
                min: self.min_stop_points,
                max: self.max_stop_points,
            });
        }
        if !(self.partial_percent > 0.0 && self.partial_percent <= 100.0) {
            return Err(ConfigError::PartialPercent(self.partial_percent));
        }
        if self.max_active_zones == 0 {
            return Err(ConfigError::ZeroZoneCapacity);
        }
        if let Some(limit) = self.daily_loss_limit_r {
            if limit >= 0.0 {
                return Err(ConfigError::DailyLossLimit(limit));
            }
        }
        for window in &self.kill_zones {
            for minute in [window.start_minute, window.end_minute] {
                if minute >= MINUTES_PER_DAY {
                    return Err(ConfigError::SessionTime { minute });
                }
            }
        }
        if let Some(minute) = self.eod_cutoff_minute {
            if minute >= MINUTES_PER_DAY {
                return Err(ConfigError::SessionTime { minute });
            }
        }
        match self.trail_mode {
            TrailMode::Disabled => {}
            TrailMode::Fixed { points } => {
                if !(points > 0.0) {
                    return Err(ConfigError::TrailDistance);
                }
            }
            TrailMode::Atr { period, multiple } => {
                if period == 0 || !(multiple > 0.0) {
                    return Err(ConfigError::TrailDistance);
                }
            }
        }
        if let StopMode::Fixed { points } = self.stop_mode {
            if !(points > 0.0) {
                return Err(ConfigError::InvalidValue {
                    field: "stop_mode.points",
                    reason: format!("fixed stop must be positive, got {}", points),
                });
            }
        }
        match self.target_mode {
            TargetMode::RMultiple { r } if !(r > 0.0) => {
                return Err(ConfigError::InvalidValue {
                    field: "target_mode.r",
                    reason: format!("must be positive, got {}", r),
                });
            }
            TargetMode::FixedPoints { points } if !(points > 0.0) => {
                return Err(ConfigError::InvalidValue {
                    field: "target_mode.points",
                    reason: format!("must be positive, got {}", points),
                });
            }
            _ => {}
        }
        if !(self.fallback_target_r > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "fallback_target_r",
                reason: format!("must be positive, got {}", self.fallback_target_r),
            });
        }
        if self.contracts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "contracts",
                reason: "must trade at least one contract".to_string(),
            });
        }
        Ok(())
    }
}
