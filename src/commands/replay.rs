//! Replay command: drive a recorded price series through the pair core

use anyhow::{bail, Result};
use tracing::info;

use gridpair::config::Config;
use gridpair::replay::{load_price_series, run_replay};

pub fn run(config: Option<String>, data: String, long_only: bool) -> Result<()> {
    let mut config = match config {
        Some(path) => Config::from_file(&path)?,
        None => {
            let mut cfg = Config::default();
            cfg.apply_env_overrides();
            cfg
        }
    };
    if long_only {
        config.pair.long_only = true;
    }

    let series = load_price_series(&data)?;
    if series.len() < 2 {
        bail!("price series needs at least two points, got {}", series.len());
    }
    info!(
        "replaying {} price points from {} (long_only={})",
        series.len(),
        data,
        config.pair.long_only
    );

    let (state, summary) = run_replay(&config.pair, &series)?;

    info!(
        "replay complete: phase={} round_trips={} profit={:.6} fees={:.6} recovery={}/{}",
        summary.final_phase,
        summary.round_trips,
        summary.total_profit,
        summary.total_fees,
        state.recovery_orders.len(),
        config.pair.max_recovery_slots
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !summary.violations.is_empty() {
        bail!("{} invariant violations during replay", summary.violations.len());
    }
    Ok(())
}
