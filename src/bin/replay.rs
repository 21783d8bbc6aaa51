//! Replay a CSV of bars through the sweep engine with simulated fills

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sweep_engine::streams::load_bars;
use sweep_engine::trading_core::{
    EngineConfig, EngineSummary, Instrument, SweepEngine, TradeRecord, TzSessionClock,
};
use sweep_engine::SimulatedExecution;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// CSV file of bars (timestamp,open,high,low,close[,volume][,complete])
    #[arg(env = "SWEEP_BARS")]
    bars: PathBuf,

    /// Engine configuration (JSON); defaults are used when omitted
    #[arg(short, long, env = "SWEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Instrument symbol
    #[arg(short, long, default_value = "NQ", env = "SWEEP_SYMBOL")]
    symbol: String,

    /// Minimum price increment
    #[arg(long, default_value = "0.25", env = "SWEEP_TICK_SIZE")]
    tick_size: f64,

    /// Session timezone for kill zones, cutoff and daily reset
    #[arg(long, default_value = "America/New_York", env = "SWEEP_TIMEZONE")]
    timezone: String,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let default_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.as_str())))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let instrument = Instrument::new(&args.symbol, args.tick_size);
    let clock = TzSessionClock::from_name(&args.timezone)?;
    let executor = SimulatedExecution::new(&args.symbol);

    let mut engine = SweepEngine::with_clock(instrument, config, executor, clock)
        .context("Invalid engine configuration")?;

    info!("=== REPLAY ===");
    let bars = load_bars(&args.bars, false)?;
    if bars.is_empty() {
        anyhow::bail!("No bars found in {:?}", args.bars);
    }

    for bar in &bars {
        for event in engine.process_bar(bar) {
            if args.json {
                println!("{}", serde_json::to_string(&event)?);
            } else {
                println!("{} | {}", bar.timestamp().format("%Y-%m-%d %H:%M"), event);
            }
        }
    }

    let mut by_day: BTreeMap<Option<NaiveDate>, Vec<TradeRecord>> = BTreeMap::new();
    for record in engine.records() {
        by_day.entry(record.day).or_default().push(record.clone());
    }
    for (day, records) in &by_day {
        let daily = EngineSummary::from_records(records);
        let label = day.map_or("-".to_string(), |d| d.to_string());
        if args.json {
            println!("{}", serde_json::json!({ "day": label, "summary": daily }));
        } else {
            println!(
                "{} | {} trades | {}W {}L | {:+.2}R",
                label, daily.trades, daily.wins, daily.losses, daily.total_r
            );
        }
    }

    let summary = engine.summary();
    info!("=== SUMMARY ({} bars, {} fills) ===", bars.len(), engine.executor().fills().len());
    if args.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!("{}", summary);
    }
    Ok(())
}
