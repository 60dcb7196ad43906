//! Entry/exit pricing helpers
//!
//! All prices and volumes are rounded through `rust_decimal` so the venue's
//! decimal-place contract is honored without f64 drift.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::PairConfig;
use crate::pair::state::PairState;
use crate::types::{Side, Trend};

/// Round a value to `dp` decimal places via exact decimal arithmetic.
pub fn round_dp(value: f64, dp: u32) -> f64 {
    match Decimal::from_f64_retain(value) {
        Some(d) => d.round_dp(dp).to_f64().unwrap_or(value),
        None => value,
    }
}

/// Round a price to the configured number of decimals.
pub fn round_price(price: f64, cfg: &PairConfig) -> f64 {
    round_dp(price, cfg.price_decimals)
}

/// Compute order volume from USD size and price, clamped to the venue minimum.
pub fn compute_volume(price: f64, cfg: &PairConfig, multiplier: f64) -> f64 {
    if price <= 0.0 {
        return cfg.min_volume;
    }
    let raw = cfg.order_size_usd / price * multiplier;
    let vol = round_dp(raw, cfg.volume_decimals);
    if vol < cfg.min_volume {
        cfg.min_volume
    } else {
        vol
    }
}

/// Exit limit price for a freshly filled entry.
///
/// The market-relative term is a floor: if price moved favorably while the
/// entry was filling, the exit never lands closer to market than a fresh
/// entry would.
pub fn exit_price(entry_fill: f64, market: f64, exit_side: Side, cfg: &PairConfig) -> f64 {
    let profit = cfg.profit_pct / 100.0;
    let entry = cfg.entry_pct / 100.0;
    match exit_side {
        Side::Sell => {
            let from_entry = entry_fill * (1.0 + profit);
            let from_market = market * (1.0 + entry);
            round_price(from_entry.max(from_market), cfg)
        }
        Side::Buy => {
            let from_entry = entry_fill * (1.0 - profit);
            let from_market = market * (1.0 - entry);
            round_price(from_entry.min(from_market), cfg)
        }
    }
}

/// Repriced exit target for a stale exit.
///
/// First reprice meets the market halfway between the original target and
/// breakeven-plus-margin; later reprices go straight to breakeven-plus. The
/// market-relative floor still applies: the exit never lands closer to
/// market than a fresh entry would.
pub fn repriced_exit_price(
    entry_price: f64,
    market: f64,
    exit_side: Side,
    cfg: &PairConfig,
    reprice_count: u32,
) -> f64 {
    let profit = cfg.profit_pct / 100.0;
    let entry = cfg.entry_pct / 100.0;
    let margin = cfg.fee_margin;

    match exit_side {
        Side::Sell => {
            let original = entry_price * (1.0 + profit);
            let breakeven_plus = entry_price * (1.0 + margin);
            let target = if reprice_count == 0 {
                (original + breakeven_plus) / 2.0
            } else {
                breakeven_plus
            };
            let floor = market * (1.0 + entry);
            round_price(target.max(floor), cfg)
        }
        Side::Buy => {
            let original = entry_price * (1.0 - profit);
            let breakeven_plus = entry_price * (1.0 - margin);
            let target = if reprice_count == 0 {
                (original + breakeven_plus) / 2.0
            } else {
                breakeven_plus
            };
            let ceiling = market * (1.0 - entry);
            round_price(target.min(ceiling), cfg)
        }
    }
}

/// Stale-exit thresholds derived from the median cycle duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitThresholds {
    pub reprice_after: f64,
    pub orphan_after: f64,
}

/// Timing thresholds, or None until enough cycles have completed.
pub fn compute_thresholds(state: &PairState, cfg: &PairConfig) -> Option<ExitThresholds> {
    if state.completed_cycles.len() < cfg.min_cycles_for_timing {
        return None;
    }
    let median = state.median_cycle_duration?;
    if median <= 0.0 {
        return None;
    }
    Some(ExitThresholds {
        reprice_after: median * cfg.exit_reprice_mult,
        orphan_after: median * cfg.exit_orphan_mult,
    })
}

/// Asymmetric entry distances `(a_pct, b_pct)` under the current trend hint.
pub fn entry_distances(trend: Option<Trend>, cfg: &PairConfig) -> (f64, f64) {
    let base = cfg.entry_pct;
    match trend {
        None => (base, base),
        Some(Trend::Down) => {
            let asym = cfg.directional_asymmetry;
            (base * asym, base * (2.0 - asym))
        }
        Some(Trend::Up) => {
            let asym = cfg.directional_asymmetry;
            (base * (2.0 - asym), base * asym)
        }
    }
}

/// How long a trend signal stays valid.
pub fn trend_expiry(state: &PairState, cfg: &PairConfig) -> f64 {
    match state.median_cycle_duration {
        Some(median) if median > 0.0 => median * cfg.exit_orphan_mult,
        _ => cfg.recovery_fallback_sec,
    }
}

/// Widen an entry distance after consecutive losses on that leg.
pub fn backoff_entry_pct(base_pct: f64, consecutive_losses: u32, cfg: &PairConfig) -> f64 {
    if !cfg.entry_backoff_enabled || consecutive_losses == 0 {
        return base_pct;
    }
    let multiplier = (1.0 + cfg.entry_backoff_factor * consecutive_losses as f64)
        .min(cfg.entry_backoff_max_multiplier);
    base_pct * multiplier
}
