//! Price-series replay driver
//!
//! Feeds a recorded (timestamp, price) series through the pair state
//! machine, synthesizing fills whenever the new price crosses a resting
//! order. Invariants are verified after every transition; violations are
//! collected rather than panicking so a full run always produces a summary.
//!
//! Also hosts the random event explorer used by the invariant audit.

use anyhow::{Context, Result};
use chrono::DateTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use std::path::Path;
use tracing::{debug, warn};

use crate::config::PairConfig;
use crate::pair::{check_invariants, derive_phase, transition, PairState};
use crate::types::{Action, Event, Side};

/// Gaussian step for the random-walk explorer.
fn sample_gauss(rng: &mut StdRng, mean: f64, std_dev: f64) -> f64 {
    match Normal::new(mean, std_dev) {
        Ok(dist) => rng.sample(dist),
        Err(_) => mean,
    }
}

/// One row of the input series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PricePoint {
    pub timestamp: f64,
    pub price: f64,
}

#[derive(Debug, Deserialize)]
struct RawPriceRow {
    timestamp: String,
    price: f64,
}

/// Load a CSV price series with `timestamp,price` columns. Timestamps may be
/// epoch seconds or RFC 3339 strings.
pub fn load_price_series(path: impl AsRef<Path>) -> Result<Vec<PricePoint>> {
    let mut reader = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("Failed to open price series: {}", path.as_ref().display()))?;

    let mut points = Vec::new();
    for row in reader.deserialize() {
        let raw: RawPriceRow = row.context("Failed to parse price row")?;
        let timestamp = match raw.timestamp.parse::<f64>() {
            Ok(epoch) => epoch,
            Err(_) => DateTime::parse_from_rfc3339(raw.timestamp.trim())
                .with_context(|| format!("Unparseable timestamp: {}", raw.timestamp))?
                .timestamp() as f64,
        };
        if !raw.price.is_finite() || raw.price <= 0.0 {
            continue;
        }
        points.push(PricePoint {
            timestamp,
            price: raw.price,
        });
    }
    points.sort_by(|a, b| {
        a.timestamp
            .partial_cmp(&b.timestamp)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(points)
}

/// Fills implied by a price move: a resting buy fills when price trades at
/// or below it, a resting sell when price trades at or above it.
pub fn generate_fills(state: &PairState, new_price: f64) -> Vec<Event> {
    let mut fills = Vec::new();
    for order in &state.orders {
        let crossed = match order.side {
            Side::Buy => new_price <= order.price,
            Side::Sell => new_price >= order.price,
        };
        if crossed {
            let event = match order.side {
                Side::Buy => Event::BuyFill {
                    price: order.price,
                    volume: order.volume,
                },
                Side::Sell => Event::SellFill {
                    price: order.price,
                    volume: order.volume,
                },
            };
            fills.push(event);
        }
    }
    fills
}

/// Outcome of one replay run.
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub steps: usize,
    pub actions: usize,
    pub round_trips: u32,
    pub total_profit: f64,
    pub total_fees: f64,
    pub recovery_slots_used: usize,
    pub recovery_losses: u32,
    pub final_phase: String,
    pub violations: Vec<String>,
}

/// Drive a price series through the state machine. Per point: synthesize and
/// apply fills against the pre-tick book, then the price tick, then a clock
/// advance to the point's timestamp.
pub fn run_replay(cfg: &PairConfig, series: &[PricePoint]) -> Result<(PairState, ReplaySummary)> {
    let first = series.first().context("price series is empty")?;
    let mut state = PairState::initial(first.price, first.timestamp, cfg);
    let mut summary = ReplaySummary {
        steps: 0,
        actions: 0,
        round_trips: 0,
        total_profit: 0.0,
        total_fees: 0.0,
        recovery_slots_used: 0,
        recovery_losses: 0,
        final_phase: derive_phase(&state).to_string(),
        violations: Vec::new(),
    };

    let mut apply = |state: &mut PairState, event: Event, summary: &mut ReplaySummary| {
        let phase_before = derive_phase(state);
        let (next, actions) = transition(state, event, cfg);
        summary.steps += 1;
        summary.actions += actions.len();
        for action in &actions {
            if let Action::BookProfit {
                trade_id,
                cycle,
                net_profit,
                ..
            } = action
            {
                debug!("booked {}#{} net={:.6}", trade_id, cycle, net_profit);
            }
        }
        let phase_after = derive_phase(&next);
        if phase_before != phase_after {
            debug!("phase {} -> {}", phase_before, phase_after);
        }
        for violation in check_invariants(&next, cfg) {
            warn!("invariant violation at step {}: {}", summary.steps, violation);
            summary.violations.push(violation);
        }
        *state = next;
    };

    for point in &series[1..] {
        for fill in generate_fills(&state, point.price) {
            apply(&mut state, fill, &mut summary);
        }
        apply(&mut state, Event::PriceTick { price: point.price }, &mut summary);
        apply(
            &mut state,
            Event::TimeAdvance {
                now: point.timestamp,
            },
            &mut summary,
        );
    }

    summary.round_trips = state.total_round_trips;
    summary.total_profit = state.total_profit;
    summary.total_fees = state.total_fees;
    summary.recovery_slots_used = state.recovery_orders.len();
    summary.recovery_losses = state.total_recovery_losses;
    summary.final_phase = derive_phase(&state).to_string();
    Ok((state, summary))
}

/// Run `n_steps` uniformly-random admissible events through the machine and
/// return every invariant violation found. A clean implementation returns an
/// empty list for any seed.
pub fn explore_random(n_steps: usize, seed: u64, cfg: &PairConfig) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut market = 0.10;
    let mut t = 1_000_000.0;
    let mut state = PairState::initial(market, t, cfg);
    let mut all_violations = Vec::new();

    for step in 0..n_steps {
        let roll: f64 = rng.gen();
        let event = if roll < 0.4 {
            // Random-walk price tick, clamped to a half/double band.
            let delta = sample_gauss(&mut rng, 0.0, market * 0.005);
            market = (market + delta).clamp(market * 0.5, market * 2.0);
            market = (market * 1e6).round() / 1e6;
            Event::PriceTick { price: market }
        } else if roll < 0.7 {
            t += rng.gen_range(5.0..120.0);
            Event::TimeAdvance { now: t }
        } else if roll < 0.85 {
            let buys: Vec<_> = state.orders.iter().filter(|o| o.side == Side::Buy).collect();
            if buys.is_empty() {
                t += 1.0;
                Event::TimeAdvance { now: t }
            } else {
                let o = buys[rng.gen_range(0..buys.len())];
                Event::BuyFill {
                    price: o.price,
                    volume: o.volume,
                }
            }
        } else if roll < 0.95 {
            let sells: Vec<_> = state.orders.iter().filter(|o| o.side == Side::Sell).collect();
            if sells.is_empty() {
                t += 1.0;
                Event::TimeAdvance { now: t }
            } else {
                let o = sells[rng.gen_range(0..sells.len())];
                Event::SellFill {
                    price: o.price,
                    volume: o.volume,
                }
            }
        } else if !state.recovery_orders.is_empty() {
            let idx = rng.gen_range(0..state.recovery_orders.len());
            if rng.gen::<f64>() < 0.7 {
                Event::RecoveryFill {
                    index: idx,
                    fill_price: state.recovery_orders[idx].price,
                }
            } else {
                Event::RecoveryCancel { index: idx }
            }
        } else {
            t += 1.0;
            Event::TimeAdvance { now: t }
        };

        let (next, _actions) = transition(&state, event, cfg);
        state = next;
        for violation in check_invariants(&state, cfg) {
            all_violations.push(format!("Step {}: {} (event={:?})", step, violation, event));
        }
    }

    all_violations
}
