//! Exit lifecycle: stale-exit repricing, orphaning, and the S2 break-glass
//!
//! Invoked from `TimeAdvance` transitions. Repricing is a one-way ratchet:
//! a sell exit only ever moves down toward market, a buy exit only up, and
//! every accepted reprice must stay profitable after round-trip fees.

use tracing::{debug, info};

use crate::config::PairConfig;
use crate::pair::pricing::{
    backoff_entry_pct, compute_thresholds, compute_volume, entry_distances, repriced_exit_price,
    round_price,
};
use crate::pair::state::{derive_phase, PairState};
use crate::types::{Action, OrderState, OrphanReason, Phase, RecoveryState, Role, Side, TradeId, Trend};

/// Minimum relative price change for a reprice to be worth a venue round trip.
const MIN_REPRICE_DELTA: f64 = 0.001;

/// Check the live exit in S1a/S1b against the timing thresholds.
pub fn check_stale_exits(state: &mut PairState, cfg: &PairConfig, actions: &mut Vec<Action>) {
    let phase = derive_phase(state);
    if phase != Phase::S1a && phase != Phase::S1b {
        return;
    }

    let exits: Vec<OrderState> = state
        .orders
        .iter()
        .filter(|o| o.is_exit() && o.entry_filled_at > 0.0)
        .copied()
        .collect();

    let Some(thresholds) = compute_thresholds(state, cfg) else {
        // No timing data yet: only the hard fallback timeout applies.
        for order in exits {
            let age = state.now - order.entry_filled_at;
            if age >= cfg.recovery_fallback_sec {
                orphan_exit(state, order, cfg, OrphanReason::Timeout, actions);
                break; // only one exit in S1
            }
        }
        return;
    };

    for order in exits {
        let age = state.now - order.entry_filled_at;

        // Orphan has priority over reprice.
        if age >= thresholds.orphan_after {
            orphan_exit(state, order, cfg, OrphanReason::Timeout, actions);
            break;
        }

        if age < thresholds.reprice_after {
            continue;
        }

        let (last_reprice, reprice_count) = match order.trade_id {
            TradeId::A => (state.last_reprice_a, state.exit_reprice_count_a),
            TradeId::B => (state.last_reprice_b, state.exit_reprice_count_b),
        };
        if state.now - last_reprice < cfg.reprice_cooldown_sec {
            continue;
        }

        let new_price = repriced_exit_price(
            order.matched_entry_price,
            state.market_price,
            order.side,
            cfg,
            reprice_count,
        );

        // One-way ratchet: only toward market.
        if order.side == Side::Sell && new_price >= order.price {
            continue;
        }
        if order.side == Side::Buy && new_price <= order.price {
            continue;
        }

        // Must remain profitable after both maker fees.
        let est_fee = order.matched_entry_price * order.volume * cfg.maker_fee_pct / 100.0 * 2.0;
        match order.side {
            Side::Sell => {
                if new_price * order.volume <= order.matched_entry_price * order.volume + est_fee {
                    continue;
                }
            }
            Side::Buy => {
                if order.matched_entry_price * order.volume <= new_price * order.volume + est_fee {
                    continue;
                }
            }
        }

        // Must be a meaningful move.
        if (new_price - order.price).abs() / order.price < MIN_REPRICE_DELTA {
            continue;
        }

        let trend = match order.trade_id {
            TradeId::A => Trend::Up,
            TradeId::B => Trend::Down,
        };
        actions.push(Action::RepriceExit {
            old_order: order,
            new_price,
            reprice_count: reprice_count + 1,
        });
        actions.push(Action::DetectTrend { direction: trend });
        debug!(
            "stale exit repriced: leg {} {:.6} -> {:.6} (count {})",
            order.trade_id,
            order.price,
            new_price,
            reprice_count + 1
        );

        let mut new_order = order;
        new_order.price = new_price;
        state.remove_order(order.side, Role::Exit);
        state.orders.push(new_order);

        match order.trade_id {
            TradeId::A => {
                state.last_reprice_a = state.now;
                state.exit_reprice_count_a = reprice_count + 1;
            }
            TradeId::B => {
                state.last_reprice_b = state.now;
                state.exit_reprice_count_b = reprice_count + 1;
            }
        }
        state.detected_trend = Some(trend);
        state.trend_detected_at = Some(state.now);
        break;
    }
}

/// Move an exit into the recovery list and place a fresh entry for its leg.
///
/// The orphaned order stays live at the venue; only its classification
/// changes. A full recovery list evicts the oldest slot, which counts as a
/// realized loss for the evicted leg's backoff streak.
pub fn orphan_exit(
    state: &mut PairState,
    order: OrderState,
    cfg: &PairConfig,
    reason: OrphanReason,
    actions: &mut Vec<Action>,
) {
    let mut losses_a = state.consecutive_losses_a;
    let mut losses_b = state.consecutive_losses_b;

    if state.recovery_orders.len() >= cfg.max_recovery_slots {
        let evicted = state.recovery_orders.remove(0);
        actions.push(Action::CancelOrder {
            order: OrderState {
                side: evicted.side,
                role: Role::Exit,
                price: evicted.price,
                volume: evicted.volume,
                trade_id: evicted.trade_id,
                cycle: evicted.cycle,
                entry_filled_at: 0.0,
                matched_entry_price: 0.0,
            },
            reason: "evict oldest recovery".to_string(),
        });
        match evicted.trade_id {
            TradeId::A => losses_a += 1,
            TradeId::B => losses_b += 1,
        }
    }

    actions.push(Action::OrphanExit { order, reason });
    info!(
        "exit orphaned: leg {} {} @ {:.6} ({})",
        order.trade_id, order.side, order.price, reason
    );

    state.recovery_orders.push(RecoveryState {
        side: order.side,
        price: order.price,
        volume: order.volume,
        trade_id: order.trade_id,
        cycle: order.cycle,
        entry_price: order.matched_entry_price,
        orphaned_at: state.now,
        entry_filled_at: order.entry_filled_at,
        reason,
    });

    // A stranded sell exit implies the market is going down; a stranded buy
    // exit implies up.
    let trend = match order.side {
        Side::Sell => Trend::Down,
        Side::Buy => Trend::Up,
    };
    actions.push(Action::DetectTrend { direction: trend });

    let (a_pct, b_pct) = entry_distances(Some(trend), cfg);
    let a_pct = backoff_entry_pct(a_pct, losses_a, cfg);
    let b_pct = backoff_entry_pct(b_pct, losses_b, cfg);

    state.remove_order(order.side, Role::Exit);

    match order.trade_id {
        TradeId::B => {
            let new_cycle = state.cycle_b + 1;
            let price = round_price(state.market_price * (1.0 - b_pct / 100.0), cfg);
            let vol = compute_volume(price, cfg, state.next_entry_multiplier);
            state
                .orders
                .push(OrderState::entry(Side::Buy, price, vol, TradeId::B, new_cycle));
            actions.push(Action::PlaceOrder {
                side: Side::Buy,
                role: Role::Entry,
                price,
                volume: vol,
                trade_id: TradeId::B,
                cycle: new_cycle,
                matched_entry_price: 0.0,
            });
            state.cycle_b = new_cycle;
            state.exit_reprice_count_b = 0;
            state.consecutive_refreshes_b = 0;
            state.refresh_cooldown_until_b = 0.0;
        }
        TradeId::A => {
            let new_cycle = state.cycle_a + 1;
            if !state.long_only {
                let price = round_price(state.market_price * (1.0 + a_pct / 100.0), cfg);
                let vol = compute_volume(price, cfg, state.next_entry_multiplier);
                state
                    .orders
                    .push(OrderState::entry(Side::Sell, price, vol, TradeId::A, new_cycle));
                actions.push(Action::PlaceOrder {
                    side: Side::Sell,
                    role: Role::Entry,
                    price,
                    volume: vol,
                    trade_id: TradeId::A,
                    cycle: new_cycle,
                    matched_entry_price: 0.0,
                });
            }
            state.cycle_a = new_cycle;
            state.exit_reprice_count_a = 0;
            state.consecutive_refreshes_a = 0;
            state.refresh_cooldown_until_a = 0.0;
        }
    }

    state.detected_trend = Some(trend);
    state.trend_detected_at = Some(state.now);
    state.consecutive_losses_a = losses_a;
    state.consecutive_losses_b = losses_b;
}

/// S2 deadlock resolution: when both exits sit on the book with a wide
/// spread for too long, reprice the worse one toward market or orphan it.
pub fn check_s2_break_glass(state: &mut PairState, cfg: &PairConfig, actions: &mut Vec<Action>) {
    if derive_phase(state) != Phase::S2 {
        if state.s2_entered_at.is_some() {
            state.s2_entered_at = None;
        }
        return;
    }

    // Never act on stale market data.
    if let Some(updated_at) = state.last_price_update_at {
        if state.now - updated_at > cfg.price_staleness_limit {
            return;
        }
    }

    // Cooldown after the previous break-glass action.
    if let Some(last_action) = state.s2_last_action_at {
        if state.now - last_action < cfg.s2_cooldown_sec {
            return;
        }
    }

    // First visit records the entry time.
    let Some(entered_at) = state.s2_entered_at else {
        state.s2_entered_at = Some(state.now);
        return;
    };
    let s2_age = state.now - entered_at;

    let timeout = match compute_thresholds(state, cfg) {
        Some(th) => th.reprice_after,
        None => cfg.s2_fallback_sec,
    };
    if s2_age < timeout {
        return;
    }

    let (Some(buy_exit), Some(sell_exit)) = (
        state.find_order(Side::Buy, Role::Exit).copied(),
        state.find_order(Side::Sell, Role::Exit).copied(),
    ) else {
        return;
    };

    let spread_pct = (sell_exit.price - buy_exit.price) / state.market_price * 100.0;
    if spread_pct < cfg.s2_max_spread_pct {
        // Spread tolerable: restart the timer so it measures continuous
        // bad-spread duration.
        state.s2_entered_at = Some(state.now);
        return;
    }

    // The worse exit sits farther from market.
    let a_dist = (buy_exit.price - state.market_price).abs() / state.market_price;
    let b_dist = (sell_exit.price - state.market_price).abs() / state.market_price;
    let worse = if a_dist > b_dist { buy_exit } else { sell_exit };

    // Opportunity cost: time spent deadlocked versus the loss of closing now.
    let mut do_close = false;
    if worse.matched_entry_price > 0.0 {
        if let (Some(mean_net), Some(mean_dur)) = (state.mean_net_profit, state.mean_duration_sec) {
            if mean_dur > 0.0 {
                let foregone = mean_net / mean_dur * s2_age;
                let loss = match worse.side {
                    Side::Sell => (worse.matched_entry_price - state.market_price) * worse.volume,
                    Side::Buy => (state.market_price - worse.matched_entry_price) * worse.volume,
                };
                let est_fee = state.market_price * worse.volume * cfg.maker_fee_pct / 100.0 * 2.0;
                if foregone > loss.abs() + est_fee {
                    debug!(
                        "s2 opportunity cost exceeded: foregone={:.6} loss={:.6}",
                        foregone,
                        loss.abs() + est_fee
                    );
                    do_close = true;
                }
            }
        }
    }

    // Try a meaningful reprice toward market before giving the exit up.
    if !do_close {
        let (last_reprice, reprice_count) = match worse.trade_id {
            TradeId::A => (state.last_reprice_a, state.exit_reprice_count_a),
            TradeId::B => (state.last_reprice_b, state.exit_reprice_count_b),
        };
        if state.now - last_reprice < cfg.reprice_cooldown_sec {
            return;
        }

        let new_price = repriced_exit_price(
            worse.matched_entry_price,
            state.market_price,
            worse.side,
            cfg,
            reprice_count,
        );
        let meaningful = (new_price - worse.price).abs() / worse.price >= MIN_REPRICE_DELTA;
        let closer = (worse.side == Side::Sell && new_price < worse.price)
            || (worse.side == Side::Buy && new_price > worse.price);

        if meaningful && closer {
            actions.push(Action::RepriceExit {
                old_order: worse,
                new_price,
                reprice_count: reprice_count + 1,
            });

            let mut new_order = worse;
            new_order.price = new_price;
            state.remove_order(worse.side, Role::Exit);
            state.orders.push(new_order);

            match worse.trade_id {
                TradeId::A => {
                    state.last_reprice_a = state.now;
                    state.exit_reprice_count_a = reprice_count + 1;
                }
                TradeId::B => {
                    state.last_reprice_b = state.now;
                    state.exit_reprice_count_b = reprice_count + 1;
                }
            }

            let new_spread = match worse.side {
                Side::Sell => (new_price - buy_exit.price) / state.market_price * 100.0,
                Side::Buy => (sell_exit.price - new_price) / state.market_price * 100.0,
            };
            if new_spread < cfg.s2_max_spread_pct {
                info!(
                    "s2 break-glass resolved by reprice: leg {} spread {:.3}% -> {:.3}%",
                    worse.trade_id, spread_pct, new_spread
                );
                state.s2_last_action_at = Some(state.now);
                return;
            }
            do_close = true;
        } else {
            do_close = true;
        }
    }

    if do_close {
        // Orphan whatever currently sits on the book for that side; the
        // reprice attempt above may already have moved it.
        let target = state
            .find_order(worse.side, Role::Exit)
            .copied()
            .unwrap_or(worse);
        orphan_exit(state, target, cfg, OrphanReason::S2Break, actions);
        state.s2_entered_at = None;
        state.s2_last_action_at = Some(state.now);
    }
}
