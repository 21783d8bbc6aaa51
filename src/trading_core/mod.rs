//! Trading Core - sweep / structure-shift entry engine
//!
//! This module contains the strategy components:
//! - Bars, instrument tick math and the session clock
//! - Swing pivot detection
//! - Liquidity level selection and lifecycle
//! - Sweep and market structure shift checks
//! - Fair value gap / order block zones
//! - Entry state machine
//! - Position management
//! - The per-instrument engine that sequences all of the above

pub mod bars;
pub mod config;
pub mod engine;
pub mod instrument;
pub mod levels;
pub mod mss;
pub mod position;
pub mod session;
pub mod state_machine;
pub mod sweep;
pub mod swing;
pub mod zones;

// Re-export commonly used types
pub use bars::{Bar, BarHistory, BarSeries, Direction};
pub use config::{
    ConfigError, EngineConfig, EntryModel, OversizeStopPolicy, PartialTargetMode, StopMode, TargetMode, TrailArming,
    TrailMode, ZoneSource,
};
pub use engine::{DailyCounters, EngineEvent, EngineState, EngineSummary, SweepEngine, TradeRecord};
pub use instrument::Instrument;
pub use levels::{LevelId, LevelSide, LevelState, LiquidityLevel, LiquidityMode, PriorLevels};
pub use mss::{DisplacementTicks, Strictness};
pub use position::{ExitReason, ManagementAction, StopKind, TradeState};
pub use session::{SessionClock, SessionTime, SessionWindow, TzSessionClock};
pub use state_machine::{EntryIntent, EntryMachine, EntryState, Signal, SignalKind};
pub use swing::{SwingHistory, SwingKind, SwingPoint};
pub use zones::{ImbalanceZone, ZoneDirection, ZoneKind};
