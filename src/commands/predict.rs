//! Predict command: load a snapshot and print the pair report

use anyhow::{bail, Result};

use gridpair::config::Config;
use gridpair::pair::{check_invariants, report};
use gridpair::snapshot::load_snapshot_json;

pub fn run(config: Option<String>, snapshot_path: String) -> Result<()> {
    let config = match config {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };

    let snapshot = load_snapshot_json(&snapshot_path)?;
    let Some(state) = snapshot.pair else {
        bail!("snapshot {} carries no pair state", snapshot_path);
    };

    let rep = report(&state, &config.pair);
    println!("{}", serde_json::to_string_pretty(&rep)?);

    let violations = check_invariants(&state, &config.pair);
    if violations.is_empty() {
        eprintln!("All invariants OK");
    } else {
        eprintln!("Invariant violations:");
        for violation in &violations {
            eprintln!("  {}", violation);
        }
    }
    Ok(())
}
