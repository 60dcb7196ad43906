//! Human-readable view of the current pair state
//!
//! Feeds the `predict` CLI command and any dashboard the outer runtime
//! exposes. Pure derivation: nothing here mutates state.

use serde::Serialize;

use crate::config::PairConfig;
use crate::pair::pricing::{backoff_entry_pct, compute_thresholds, entry_distances};
use crate::pair::state::{derive_phase, PairState};
use crate::types::{Phase, Role};

#[derive(Debug, Clone, Serialize)]
pub struct OrderReport {
    pub side: String,
    pub role: String,
    pub trade: String,
    pub cycle: u32,
    pub price: f64,
    pub distance_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_age_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reprice_in_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphan_in_sec: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub trade: String,
    pub cycle: u32,
    pub side: String,
    pub price: f64,
    pub entry_price: f64,
    pub unrealized: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub phase: String,
    pub market_price: f64,
    pub long_only: bool,
    pub orders: Vec<OrderReport>,
    pub recovery_slots: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<String>,
    pub total_profit: f64,
    pub total_round_trips: u32,
    pub backoff_a: u32,
    pub backoff_b: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_entry_a_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_entry_b_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s2_age_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s2_break_glass_in_sec: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recovery: Vec<RecoveryReport>,
}

/// Build the report for the current snapshot.
pub fn report(state: &PairState, cfg: &PairConfig) -> PairReport {
    let phase = derive_phase(state);
    let thresholds = compute_thresholds(state, cfg);

    let orders = state
        .orders
        .iter()
        .map(|o| {
            let mut row = OrderReport {
                side: o.side.to_string(),
                role: o.role.to_string(),
                trade: o.trade_id.to_string(),
                cycle: o.cycle,
                price: o.price,
                distance_pct: o.distance_pct(state.market_price),
                exit_age_sec: None,
                reprice_in_sec: None,
                orphan_in_sec: None,
            };
            if o.role == Role::Exit && o.entry_filled_at > 0.0 {
                let age = state.now - o.entry_filled_at;
                row.exit_age_sec = Some(age);
                if let Some(th) = &thresholds {
                    row.reprice_in_sec = Some((th.reprice_after - age).max(0.0));
                    row.orphan_in_sec = Some((th.orphan_after - age).max(0.0));
                }
            }
            row
        })
        .collect();

    let recovery = state
        .recovery_orders
        .iter()
        .map(|r| RecoveryReport {
            trade: r.trade_id.to_string(),
            cycle: r.cycle,
            side: r.side.to_string(),
            price: r.price,
            entry_price: r.entry_price,
            unrealized: r.unrealized(state.market_price),
            reason: r.reason.to_string(),
        })
        .collect();

    let (effective_a, effective_b) =
        if state.consecutive_losses_a > 0 || state.consecutive_losses_b > 0 {
            let (a_pct, b_pct) = entry_distances(state.detected_trend, cfg);
            (
                Some(backoff_entry_pct(a_pct, state.consecutive_losses_a, cfg)),
                Some(backoff_entry_pct(b_pct, state.consecutive_losses_b, cfg)),
            )
        } else {
            (None, None)
        };

    let (s2_age, s2_in) = match (phase, state.s2_entered_at) {
        (Phase::S2, Some(entered_at)) => {
            let age = state.now - entered_at;
            let timeout = thresholds
                .as_ref()
                .map(|th| th.reprice_after)
                .unwrap_or(cfg.s2_fallback_sec);
            (Some(age), Some((timeout - age).max(0.0)))
        }
        _ => (None, None),
    };

    PairReport {
        phase: phase.to_string(),
        market_price: state.market_price,
        long_only: state.long_only,
        orders,
        recovery_slots: format!(
            "{}/{}",
            state.recovery_orders.len(),
            cfg.max_recovery_slots
        ),
        trend: state.detected_trend.map(|t| t.to_string()),
        total_profit: state.total_profit,
        total_round_trips: state.total_round_trips,
        backoff_a: state.consecutive_losses_a,
        backoff_b: state.consecutive_losses_b,
        effective_entry_a_pct: effective_a,
        effective_entry_b_pct: effective_b,
        s2_age_sec: s2_age,
        s2_break_glass_in_sec: s2_in,
        recovery,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderState, Side, TradeId};

    #[test]
    fn test_report_on_initial_state() {
        let cfg = PairConfig::default();
        let state = PairState::initial(0.10, 1_000_000.0, &cfg);
        let rep = report(&state, &cfg);
        assert_eq!(rep.phase, "S0");
        assert_eq!(rep.orders.len(), 2);
        assert_eq!(rep.recovery_slots, "0/2");
        assert!(rep.trend.is_none());
    }

    #[test]
    fn test_report_shows_exit_countdowns() {
        let cfg = PairConfig {
            min_cycles_for_timing: 0,
            ..PairConfig::default()
        };
        let mut state = PairState::initial(0.10, 1_000_000.0, &cfg);
        state.median_cycle_duration = Some(120.0);
        state.orders = vec![OrderState {
            side: Side::Sell,
            role: Role::Exit,
            price: 0.1005,
            volume: 35.0,
            trade_id: TradeId::B,
            cycle: 1,
            entry_filled_at: state.now - 60.0,
            matched_entry_price: 0.0995,
        }];
        let rep = report(&state, &cfg);
        let row = &rep.orders[0];
        assert_eq!(row.exit_age_sec, Some(60.0));
        assert_eq!(row.reprice_in_sec, Some(120.0)); // 180 - 60
        assert_eq!(row.orphan_in_sec, Some(540.0)); // 600 - 60
    }

    #[test]
    fn test_report_backoff_distances_only_when_active() {
        let cfg = PairConfig::default();
        let mut state = PairState::initial(0.10, 1_000_000.0, &cfg);
        assert!(report(&state, &cfg).effective_entry_b_pct.is_none());

        state.consecutive_losses_b = 2;
        let rep = report(&state, &cfg);
        let eff = rep.effective_entry_b_pct.unwrap();
        assert!(eff > cfg.entry_pct);
    }
}
