//! The pure transition function over pair state
//!
//! `transition(state, event, cfg)` is the single entry point of the state
//! machine. It never touches a clock or performs I/O: the caller owns the
//! reference to "current state", feeds events in observation order, and
//! executes the returned actions.
//!
//! Ordering contract: within one `TimeAdvance` the core runs trend expiry,
//! then the stale-exit check, then the S2 break-glass check. Within one
//! `PriceTick` it updates the market first and then runs the entry-refresh
//! check. Later steps observe state mutated by earlier steps.

use tracing::debug;

use crate::config::PairConfig;
use crate::pair::lifecycle::{check_s2_break_glass, check_stale_exits};
use crate::pair::pricing::{
    backoff_entry_pct, compute_volume, entry_distances, exit_price, round_price, trend_expiry,
};
use crate::pair::state::PairState;
use crate::types::{Action, CycleRecord, Event, OrderState, Role, Side, TradeId, Trend};

/// Apply one event to a state snapshot, producing the next snapshot and the
/// actions the caller should execute.
pub fn transition(state: &PairState, event: Event, cfg: &PairConfig) -> (PairState, Vec<Action>) {
    let mut next = state.clone();
    let mut actions = Vec::new();

    match event {
        Event::BuyFill { price, volume } => {
            handle_buy_fill(&mut next, price, volume, cfg, &mut actions);
        }
        Event::SellFill { price, volume } => {
            handle_sell_fill(&mut next, price, volume, cfg, &mut actions);
        }
        Event::PriceTick { price } => {
            next.market_price = price;
            next.last_price_update_at = Some(next.now);
            check_entry_refresh(&mut next, cfg, &mut actions);
        }
        Event::TimeAdvance { now } => {
            next.now = now;
            check_trend_expiry(&mut next, cfg);
            check_stale_exits(&mut next, cfg, &mut actions);
            check_s2_break_glass(&mut next, cfg, &mut actions);
        }
        Event::RecoveryFill { index, fill_price } => {
            handle_recovery_fill(&mut next, index, fill_price, cfg, &mut actions);
        }
        Event::RecoveryCancel { index } => {
            if index < next.recovery_orders.len() {
                next.recovery_orders.remove(index);
                next.total_recovery_losses += 1;
            }
        }
    }

    (next, actions)
}

/// A buy fill is either the leg B entry or the leg A exit.
fn handle_buy_fill(
    state: &mut PairState,
    price: f64,
    volume: f64,
    cfg: &PairConfig,
    actions: &mut Vec<Action>,
) {
    if let Some(buy_exit) = state.find_order(Side::Buy, Role::Exit).copied() {
        if buy_exit.matches_price(price) {
            complete_round_trip(state, buy_exit, price, cfg, actions);
            return;
        }
    }

    let Some(buy_entry) = state.find_order(Side::Buy, Role::Entry).copied() else {
        return; // no matching order
    };

    // Entry fill: place the sell exit against this cost basis.
    let exit_p = exit_price(price, state.market_price, Side::Sell, cfg);
    let exit_vol = buy_entry.volume;
    let fee = price * volume * cfg.maker_fee_pct / 100.0;

    state.remove_order(Side::Buy, Role::Entry);
    state.orders.push(OrderState {
        side: Side::Sell,
        role: Role::Exit,
        price: exit_p,
        volume: exit_vol,
        trade_id: TradeId::B,
        cycle: state.cycle_b,
        entry_filled_at: state.now,
        matched_entry_price: price,
    });
    state.total_fees += fee;
    if state.next_entry_multiplier > 1.0 {
        state.next_entry_multiplier = 1.0;
    }

    actions.push(Action::PlaceOrder {
        side: Side::Sell,
        role: Role::Exit,
        price: exit_p,
        volume: exit_vol,
        trade_id: TradeId::B,
        cycle: state.cycle_b,
        matched_entry_price: price,
    });
}

/// A sell fill is either the leg A entry or the leg B exit.
fn handle_sell_fill(
    state: &mut PairState,
    price: f64,
    volume: f64,
    cfg: &PairConfig,
    actions: &mut Vec<Action>,
) {
    if let Some(sell_exit) = state.find_order(Side::Sell, Role::Exit).copied() {
        if sell_exit.matches_price(price) {
            complete_round_trip(state, sell_exit, price, cfg, actions);
            return;
        }
    }

    let Some(sell_entry) = state.find_order(Side::Sell, Role::Entry).copied() else {
        return;
    };

    let exit_p = exit_price(price, state.market_price, Side::Buy, cfg);
    let exit_vol = sell_entry.volume;
    let fee = price * volume * cfg.maker_fee_pct / 100.0;

    state.remove_order(Side::Sell, Role::Entry);
    state.orders.push(OrderState {
        side: Side::Buy,
        role: Role::Exit,
        price: exit_p,
        volume: exit_vol,
        trade_id: TradeId::A,
        cycle: state.cycle_a,
        entry_filled_at: state.now,
        matched_entry_price: price,
    });
    state.total_fees += fee;
    if state.next_entry_multiplier > 1.0 {
        state.next_entry_multiplier = 1.0;
    }

    actions.push(Action::PlaceOrder {
        side: Side::Buy,
        role: Role::Exit,
        price: exit_p,
        volume: exit_vol,
        trade_id: TradeId::A,
        cycle: state.cycle_a,
        matched_entry_price: price,
    });
}

/// An exit filled: book the round trip, refresh the companion entry, reset
/// the leg's lifecycle counters.
fn complete_round_trip(
    state: &mut PairState,
    exit: OrderState,
    fill_price: f64,
    cfg: &PairConfig,
    actions: &mut Vec<Action>,
) {
    let leg = exit.trade_id;
    let volume = exit.volume;
    let entry_price = exit.matched_entry_price;

    let gross = match exit.side {
        // Leg A: sold at entry, bought back at the exit fill.
        Side::Buy => (entry_price - fill_price) * volume,
        // Leg B: bought at entry, sold at the exit fill.
        Side::Sell => (fill_price - entry_price) * volume,
    };
    let fees = (entry_price * volume + fill_price * volume) * cfg.maker_fee_pct / 100.0;
    let net = gross - fees;

    actions.push(Action::BookProfit {
        trade_id: leg,
        cycle: exit.cycle,
        net_profit: net,
        gross_profit: gross,
        fees,
    });
    debug!(
        "round trip complete: {}#{} net={:.6} gross={:.6} fees={:.6}",
        leg, exit.cycle, net, gross, fees
    );

    let record = CycleRecord {
        trade_id: leg,
        cycle: exit.cycle,
        entry_price,
        exit_price: fill_price,
        volume,
        gross_profit: gross,
        fees,
        net_profit: net,
        entry_time: exit.entry_filled_at,
        exit_time: state.now,
    };

    // Expire a stale trend before computing fresh distances. Uses the timing
    // stats from *before* this cycle is appended.
    if let (Some(_), Some(at)) = (state.detected_trend, state.trend_detected_at) {
        if state.now - at > trend_expiry(state, cfg) {
            state.detected_trend = None;
            state.trend_detected_at = None;
        }
    }

    // The filled exit leaves the book; the companion entry is cancelled and
    // re-placed at a fresh distance (skipped entirely for leg A in long-only).
    state.remove_order(exit.side, Role::Exit);
    let companion_side = leg.entry_side();
    if let Some(entry) = state.remove_order(companion_side, Role::Entry) {
        actions.push(Action::CancelOrder {
            order: entry,
            reason: "round-trip complete, refresh entry".to_string(),
        });
    }

    let new_cycle = exit.cycle + 1;

    // Loss streak bookkeeping for the leg that just completed.
    match leg {
        TradeId::A => {
            state.consecutive_losses_a = if net < 0.0 {
                state.consecutive_losses_a + 1
            } else {
                0
            };
        }
        TradeId::B => {
            state.consecutive_losses_b = if net < 0.0 {
                state.consecutive_losses_b + 1
            } else {
                0
            };
        }
    }

    let place_entry = !(leg == TradeId::A && state.long_only);
    if place_entry {
        let (a_pct, b_pct) = entry_distances(state.detected_trend, cfg);
        let (pct, losses) = match leg {
            TradeId::A => (a_pct, state.consecutive_losses_a),
            TradeId::B => (b_pct, state.consecutive_losses_b),
        };
        let pct = backoff_entry_pct(pct, losses, cfg);
        let price = match companion_side {
            Side::Sell => round_price(state.market_price * (1.0 + pct / 100.0), cfg),
            Side::Buy => round_price(state.market_price * (1.0 - pct / 100.0), cfg),
        };
        let vol = compute_volume(price, cfg, state.next_entry_multiplier);
        state
            .orders
            .push(OrderState::entry(companion_side, price, vol, leg, new_cycle));
        actions.push(Action::PlaceOrder {
            side: companion_side,
            role: Role::Entry,
            price,
            volume: vol,
            trade_id: leg,
            cycle: new_cycle,
            matched_entry_price: 0.0,
        });
    }

    match leg {
        TradeId::A => {
            state.cycle_a = new_cycle;
            state.exit_reprice_count_a = 0;
        }
        TradeId::B => {
            state.cycle_b = new_cycle;
            state.exit_reprice_count_b = 0;
        }
    }

    state.total_profit += net;
    state.total_fees += fees;
    state.total_round_trips += 1;
    state.completed_cycles.push(record);
    state.refresh_cycle_stats();
    state.s2_entered_at = None;
}

/// Clear an expired trend signal.
fn check_trend_expiry(state: &mut PairState, cfg: &PairConfig) {
    let (Some(_), Some(at)) = (state.detected_trend, state.trend_detected_at) else {
        return;
    };
    if state.now - at > trend_expiry(state, cfg) {
        state.detected_trend = None;
        state.trend_detected_at = None;
    }
}

/// Refresh entries that drifted too far from market, guarded by the
/// anti-chase counter: three same-direction refreshes put the leg into a
/// cooldown instead of following the move.
fn check_entry_refresh(state: &mut PairState, cfg: &PairConfig, actions: &mut Vec<Action>) {
    let entries: Vec<OrderState> = state.orders.iter().filter(|o| o.is_entry()).copied().collect();

    for order in entries {
        if order.distance_pct(state.market_price) <= cfg.refresh_pct {
            continue;
        }

        let is_a = order.trade_id == TradeId::A;
        let cooldown_until = if is_a {
            state.refresh_cooldown_until_a
        } else {
            state.refresh_cooldown_until_b
        };
        let mut consec = if is_a {
            state.consecutive_refreshes_a
        } else {
            state.consecutive_refreshes_b
        };
        let last_dir = if is_a {
            state.last_refresh_direction_a
        } else {
            state.last_refresh_direction_b
        };

        if state.now < cooldown_until {
            continue;
        }

        // Cooldown served: the streak starts over.
        if consec >= cfg.max_consecutive_refreshes && cooldown_until > 0.0 {
            consec = 0;
        }

        let direction = match order.side {
            Side::Buy => {
                if state.market_price < order.price {
                    Trend::Down
                } else {
                    Trend::Up
                }
            }
            Side::Sell => {
                if state.market_price > order.price {
                    Trend::Up
                } else {
                    Trend::Down
                }
            }
        };

        consec = if last_dir == Some(direction) { consec + 1 } else { 1 };

        if consec >= cfg.max_consecutive_refreshes {
            let until = state.now + cfg.refresh_cooldown_sec;
            debug!(
                "anti-chase engaged for leg {}: {} same-direction refreshes, cooldown until {:.0}",
                order.trade_id, consec, until
            );
            if is_a {
                state.consecutive_refreshes_a = consec;
                state.last_refresh_direction_a = Some(direction);
                state.refresh_cooldown_until_a = until;
            } else {
                state.consecutive_refreshes_b = consec;
                state.last_refresh_direction_b = Some(direction);
                state.refresh_cooldown_until_b = until;
            }
            continue;
        }

        let (a_pct, b_pct) = entry_distances(state.detected_trend, cfg);
        let new_price = match order.side {
            Side::Buy => round_price(state.market_price * (1.0 - b_pct / 100.0), cfg),
            Side::Sell => round_price(state.market_price * (1.0 + a_pct / 100.0), cfg),
        };
        let new_vol = compute_volume(new_price, cfg, state.next_entry_multiplier);

        actions.push(Action::CancelOrder {
            order,
            reason: "stale entry refresh".to_string(),
        });
        actions.push(Action::PlaceOrder {
            side: order.side,
            role: Role::Entry,
            price: new_price,
            volume: new_vol,
            trade_id: order.trade_id,
            cycle: order.cycle,
            matched_entry_price: 0.0,
        });

        state.remove_order(order.side, Role::Entry);
        state.orders.push(OrderState::entry(
            order.side,
            new_price,
            new_vol,
            order.trade_id,
            order.cycle,
        ));

        if is_a {
            state.consecutive_refreshes_a = consec;
            state.last_refresh_direction_a = Some(direction);
        } else {
            state.consecutive_refreshes_b = consec;
            state.last_refresh_direction_b = Some(direction);
        }
    }
}

/// A recovery order filled at the venue: book the late round trip and free
/// the slot. A profitable fill clears the leg's loss streak.
fn handle_recovery_fill(
    state: &mut PairState,
    index: usize,
    fill_price: f64,
    cfg: &PairConfig,
    actions: &mut Vec<Action>,
) {
    if index >= state.recovery_orders.len() {
        return;
    }
    let rec = state.recovery_orders[index];

    let gross = match rec.side {
        Side::Sell => (fill_price - rec.entry_price) * rec.volume,
        Side::Buy => (rec.entry_price - fill_price) * rec.volume,
    };
    let fees =
        (rec.entry_price * rec.volume + fill_price * rec.volume) * cfg.maker_fee_pct / 100.0;
    let net = gross - fees;

    actions.push(Action::BookProfit {
        trade_id: rec.trade_id,
        cycle: rec.cycle,
        net_profit: net,
        gross_profit: gross,
        fees,
    });

    state.recovery_orders.remove(index);
    if net >= 0.0 {
        match rec.trade_id {
            TradeId::A => state.consecutive_losses_a = 0,
            TradeId::B => state.consecutive_losses_b = 0,
        }
    }
    state.total_profit += net;
    state.total_fees += fees;
    state.total_round_trips += 1;
    state.total_recovery_wins += net;
}
