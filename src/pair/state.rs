//! Pair state snapshot and phase derivation
//!
//! `PairState` is a value type: every transition clones the current snapshot
//! and returns a new one. Orders are bounded (at most two open plus a short
//! recovery list), so whole-struct copies stay cheap; the cycle history is
//! the only growing collection.

use serde::{Deserialize, Serialize};

use crate::config::PairConfig;
use crate::pair::pricing::{compute_volume, round_price};
use crate::types::{CycleRecord, OrderState, Phase, RecoveryState, Role, Side, TradeId, Trend};

/// Complete snapshot of pair trading state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairState {
    pub market_price: f64,
    /// Current timestamp (seconds since epoch)
    pub now: f64,

    #[serde(default)]
    pub orders: Vec<OrderState>,
    #[serde(default)]
    pub recovery_orders: Vec<RecoveryState>,
    #[serde(default)]
    pub completed_cycles: Vec<CycleRecord>,

    #[serde(default = "default_cycle")]
    pub cycle_a: u32,
    #[serde(default = "default_cycle")]
    pub cycle_b: u32,
    #[serde(default)]
    pub total_profit: f64,
    #[serde(default)]
    pub total_fees: f64,
    #[serde(default)]
    pub total_round_trips: u32,
    #[serde(default)]
    pub total_recovery_wins: f64,
    #[serde(default)]
    pub total_recovery_losses: u32,

    // Exit lifecycle
    #[serde(default)]
    pub s2_entered_at: Option<f64>,
    /// Cooldown anchor after a break-glass action
    #[serde(default)]
    pub s2_last_action_at: Option<f64>,
    #[serde(default)]
    pub last_reprice_a: f64,
    #[serde(default)]
    pub last_reprice_b: f64,
    #[serde(default)]
    pub exit_reprice_count_a: u32,
    #[serde(default)]
    pub exit_reprice_count_b: u32,
    /// When the market price was last refreshed
    #[serde(default)]
    pub last_price_update_at: Option<f64>,

    // Directional signal
    #[serde(default)]
    pub detected_trend: Option<Trend>,
    #[serde(default)]
    pub trend_detected_at: Option<f64>,

    // Anti-chase
    #[serde(default)]
    pub consecutive_refreshes_a: u32,
    #[serde(default)]
    pub consecutive_refreshes_b: u32,
    #[serde(default)]
    pub last_refresh_direction_a: Option<Trend>,
    #[serde(default)]
    pub last_refresh_direction_b: Option<Trend>,
    #[serde(default)]
    pub refresh_cooldown_until_a: f64,
    #[serde(default)]
    pub refresh_cooldown_until_b: f64,

    // Timing stats over completed cycles
    #[serde(default)]
    pub median_cycle_duration: Option<f64>,
    #[serde(default)]
    pub mean_net_profit: Option<f64>,
    #[serde(default)]
    pub mean_duration_sec: Option<f64>,

    /// Sizing multiplier applied to the next entry placement
    #[serde(default = "default_multiplier")]
    pub next_entry_multiplier: f64,

    /// Long-only mode: no sell entries (spot pairs without inventory)
    #[serde(default)]
    pub long_only: bool,

    // Anti-loss-spiral: consecutive losing cycles per leg
    #[serde(default)]
    pub consecutive_losses_a: u32,
    #[serde(default)]
    pub consecutive_losses_b: u32,
}

fn default_cycle() -> u32 {
    1
}

fn default_multiplier() -> f64 {
    1.0
}

impl PairState {
    /// Create an S0 state with entry orders flanking the market.
    /// In long-only mode only the buy entry is placed.
    pub fn initial(market_price: f64, now: f64, cfg: &PairConfig) -> Self {
        let buy_price = round_price(market_price * (1.0 - cfg.entry_pct / 100.0), cfg);
        let buy_vol = compute_volume(buy_price, cfg, cfg.next_entry_multiplier);
        let mut orders = vec![OrderState::entry(
            Side::Buy,
            buy_price,
            buy_vol,
            TradeId::B,
            1,
        )];
        if !cfg.long_only {
            let sell_price = round_price(market_price * (1.0 + cfg.entry_pct / 100.0), cfg);
            let sell_vol = compute_volume(sell_price, cfg, cfg.next_entry_multiplier);
            orders.insert(
                0,
                OrderState::entry(Side::Sell, sell_price, sell_vol, TradeId::A, 1),
            );
        }
        PairState {
            market_price,
            now,
            orders,
            recovery_orders: Vec::new(),
            completed_cycles: Vec::new(),
            cycle_a: 1,
            cycle_b: 1,
            total_profit: 0.0,
            total_fees: 0.0,
            total_round_trips: 0,
            total_recovery_wins: 0.0,
            total_recovery_losses: 0,
            s2_entered_at: None,
            s2_last_action_at: None,
            last_reprice_a: 0.0,
            last_reprice_b: 0.0,
            exit_reprice_count_a: 0,
            exit_reprice_count_b: 0,
            last_price_update_at: None,
            detected_trend: None,
            trend_detected_at: None,
            consecutive_refreshes_a: 0,
            consecutive_refreshes_b: 0,
            last_refresh_direction_a: None,
            last_refresh_direction_b: None,
            refresh_cooldown_until_a: 0.0,
            refresh_cooldown_until_b: 0.0,
            median_cycle_duration: None,
            mean_net_profit: None,
            mean_duration_sec: None,
            next_entry_multiplier: cfg.next_entry_multiplier,
            long_only: cfg.long_only,
            consecutive_losses_a: 0,
            consecutive_losses_b: 0,
        }
    }

    /// Find an open order by side and role. At most one can exist.
    pub fn find_order(&self, side: Side, role: Role) -> Option<&OrderState> {
        self.orders.iter().find(|o| o.side == side && o.role == role)
    }

    /// Remove the open order with this side and role, if present.
    pub fn remove_order(&mut self, side: Side, role: Role) -> Option<OrderState> {
        let idx = self
            .orders
            .iter()
            .position(|o| o.side == side && o.role == role)?;
        Some(self.orders.remove(idx))
    }

    /// Recompute the cycle timing statistics from the completed history.
    pub fn refresh_cycle_stats(&mut self) {
        self.median_cycle_duration = median_cycle_duration(&self.completed_cycles);
        if self.completed_cycles.is_empty() {
            self.mean_net_profit = None;
        } else {
            let sum: f64 = self.completed_cycles.iter().map(|c| c.net_profit).sum();
            self.mean_net_profit = Some(sum / self.completed_cycles.len() as f64);
        }
        let durations: Vec<f64> = self
            .completed_cycles
            .iter()
            .filter_map(|c| c.duration_sec())
            .collect();
        self.mean_duration_sec = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<f64>() / durations.len() as f64)
        };
    }
}

/// Derive the phase from the open order set. Single source of truth:
/// a buy exit marks leg A live, a sell exit marks leg B live.
pub fn derive_phase(state: &PairState) -> Phase {
    let has_a_exit = state
        .orders
        .iter()
        .any(|o| o.side == Side::Buy && o.role == Role::Exit);
    let has_b_exit = state
        .orders
        .iter()
        .any(|o| o.side == Side::Sell && o.role == Role::Exit);
    match (has_a_exit, has_b_exit) {
        (true, true) => Phase::S2,
        (true, false) => Phase::S1a,
        (false, true) => Phase::S1b,
        (false, false) => Phase::S0,
    }
}

/// Median entry-to-exit duration across cycles with usable timestamps.
pub fn median_cycle_duration(cycles: &[CycleRecord]) -> Option<f64> {
    let mut durations: Vec<f64> = cycles.iter().filter_map(|c| c.duration_sec()).collect();
    if durations.is_empty() {
        return None;
    }
    durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = durations.len();
    if n % 2 == 1 {
        Some(durations[n / 2])
    } else {
        Some((durations[n / 2 - 1] + durations[n / 2]) / 2.0)
    }
}
