//! Explore command: random event walk with invariant auditing

use anyhow::{bail, Result};
use tracing::info;

use gridpair::config::Config;
use gridpair::replay::explore_random;

pub fn run(config: Option<String>, steps: usize, seed: u64) -> Result<()> {
    let config = match config {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };

    info!("exploring {} random events (seed {})", steps, seed);
    let violations = explore_random(steps, seed, &config.pair);

    if violations.is_empty() {
        println!("0 violations across {} random transitions", steps);
        Ok(())
    } else {
        for violation in violations.iter().take(20) {
            eprintln!("{}", violation);
        }
        bail!("{} invariant violations found", violations.len());
    }
}
