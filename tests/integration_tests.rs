//! Integration tests for the pair trading core
//!
//! End-to-end scenarios drive the state machine through full event
//! sequences and verify the structural invariants after every transition.

use gridpair::config::PairConfig;
use gridpair::models::{BocpdDetector, CycleSample, KellySizer, Regime, ThroughputSizer};
use gridpair::pair::pricing::{compute_volume, exit_price};
use gridpair::pair::{check_invariants, derive_phase, transition, PairState};
use gridpair::replay::explore_random;
use gridpair::snapshot::BotSnapshot;
use gridpair::{
    Action, CycleRecord, Event, OrderState, OrphanReason, Phase, RecoveryState, Role, Side,
    TradeId, Trend,
};

// =============================================================================
// Test Utilities
// =============================================================================

const T0: f64 = 1_000_000.0;

/// Apply a sequence of events, asserting zero invariant violations after
/// every transition. Returns the final state and every emitted action.
fn drive(
    mut state: PairState,
    events: &[Event],
    cfg: &PairConfig,
) -> (PairState, Vec<Action>) {
    let mut all_actions = Vec::new();
    for event in events {
        let (next, actions) = transition(&state, *event, cfg);
        let violations = check_invariants(&next, cfg);
        assert!(
            violations.is_empty(),
            "invariant violations after {:?}: {:?}",
            event,
            violations
        );
        all_actions.extend(actions);
        state = next;
    }
    (state, all_actions)
}

fn seeded_cycles(t: f64, n: usize) -> Vec<CycleRecord> {
    (0..n)
        .map(|i| CycleRecord {
            trade_id: TradeId::B,
            cycle: i as u32 + 1,
            entry_price: 0.099,
            exit_price: 0.101,
            volume: 35.0,
            gross_profit: 0.07,
            fees: 0.002,
            net_profit: 0.068,
            entry_time: t - 1000.0 + i as f64 * 120.0,
            exit_time: t - 880.0 + i as f64 * 120.0,
        })
        .collect()
}

// =============================================================================
// Scenario 1: Normal Oscillation
// =============================================================================

#[test]
fn test_normal_oscillation_two_round_trips() {
    let cfg = PairConfig {
        entry_pct: 0.5,
        profit_pct: 1.0,
        ..PairConfig::default()
    };
    let state = PairState::initial(0.10, T0, &cfg);

    let buy_entry_price = 0.0995;
    let sell_entry_price = 0.1005;
    let vol = compute_volume(buy_entry_price, &cfg, 1.0);
    let sell_exit_price = exit_price(buy_entry_price, 0.10, Side::Sell, &cfg);
    let buy_exit_price = exit_price(sell_entry_price, 0.10, Side::Buy, &cfg);

    // Direct fills avoid cross-contamination from auto-generated fills.
    let events = vec![
        Event::BuyFill {
            price: buy_entry_price,
            volume: vol,
        },
        Event::TimeAdvance { now: T0 + 30.0 },
        Event::SellFill {
            price: sell_exit_price,
            volume: vol,
        },
        Event::TimeAdvance { now: T0 + 60.0 },
        Event::SellFill {
            price: sell_entry_price,
            volume: vol,
        },
        Event::TimeAdvance { now: T0 + 90.0 },
        Event::BuyFill {
            price: buy_exit_price,
            volume: vol,
        },
        Event::TimeAdvance { now: T0 + 120.0 },
    ];

    let (final_state, actions) = drive(state, &events, &cfg);

    assert_eq!(final_state.total_round_trips, 2);
    assert_eq!(derive_phase(&final_state), Phase::S0);
    assert!(final_state.total_profit > 0.0);
    assert_eq!(final_state.cycle_a, 2);
    assert_eq!(final_state.cycle_b, 2);

    let books: Vec<_> = actions
        .iter()
        .filter(|a| matches!(a, Action::BookProfit { .. }))
        .collect();
    assert_eq!(books.len(), 2);
}

// =============================================================================
// Scenario 2: Trending Market (reprice then orphan)
// =============================================================================

#[test]
fn test_trending_market_reprices_then_orphans() {
    let cfg = PairConfig {
        entry_pct: 0.5,
        profit_pct: 1.0,
        min_cycles_for_timing: 2,
        refresh_pct: 5.0,
        ..PairConfig::default()
    };
    let mut state = PairState::initial(0.10, T0, &cfg);
    state.completed_cycles = seeded_cycles(T0, 5);
    state.refresh_cycle_stats();
    assert_eq!(state.median_cycle_duration, Some(120.0));

    let mut events = Vec::new();
    // Market pops above the profit target while the resting buy entry fills,
    // so the fresh sell exit is pinned to the market-relative floor.
    events.push(Event::PriceTick { price: 0.1015 });
    events.push(Event::BuyFill {
        price: 0.0995,
        volume: 35.0,
    });
    events.push(Event::TimeAdvance { now: T0 + 30.0 });
    // Then the market rolls over and keeps dropping.
    for i in 0..10u32 {
        events.push(Event::PriceTick {
            price: 0.098 - i as f64 * 0.001,
        });
        events.push(Event::TimeAdvance {
            now: T0 + 60.0 + i as f64 * 30.0,
        });
    }
    // Past the reprice threshold (120 * 1.5 = 180s)...
    events.push(Event::TimeAdvance { now: T0 + 250.0 });
    // ...and past the orphan threshold (120 * 5 = 600s).
    events.push(Event::TimeAdvance { now: T0 + 700.0 });

    let (final_state, actions) = drive(state, &events, &cfg);

    let reprice_idx = actions
        .iter()
        .position(|a| matches!(a, Action::RepriceExit { .. }))
        .expect("expected at least one RepriceExit");
    let orphan_idx = actions
        .iter()
        .position(|a| matches!(a, Action::OrphanExit { .. }))
        .expect("expected an OrphanExit");
    assert!(reprice_idx < orphan_idx, "reprice must precede orphan");

    if let Action::RepriceExit {
        old_order,
        new_price,
        ..
    } = &actions[reprice_idx]
    {
        assert_eq!(old_order.side, Side::Sell);
        assert!(new_price < &old_order.price, "sell exits ratchet down");
    }

    assert_eq!(final_state.recovery_orders.len(), 1);
    assert_eq!(final_state.recovery_orders[0].reason, OrphanReason::Timeout);
    assert_eq!(final_state.detected_trend, Some(Trend::Down));
}

// =============================================================================
// Scenario 3: S2 Break Glass
// =============================================================================

#[test]
fn test_s2_break_glass_resolves_deadlock() {
    let cfg = PairConfig {
        entry_pct: 0.5,
        profit_pct: 1.0,
        min_cycles_for_timing: 2,
        s2_fallback_sec: 120.0,
        s2_max_spread_pct: 0.5,
        ..PairConfig::default()
    };
    let mut state = PairState::initial(0.10, T0, &cfg);
    // Both entries filled: two exits on the book, price parked between them.
    state.orders = vec![
        OrderState {
            side: Side::Sell,
            role: Role::Exit,
            price: 0.1005,
            volume: 35.0,
            trade_id: TradeId::B,
            cycle: 1,
            entry_filled_at: T0,
            matched_entry_price: 0.0995,
        },
        OrderState {
            side: Side::Buy,
            role: Role::Exit,
            price: 0.0995,
            volume: 35.0,
            trade_id: TradeId::A,
            cycle: 1,
            entry_filled_at: T0,
            matched_entry_price: 0.1005,
        },
    ];
    assert_eq!(derive_phase(&state), Phase::S2);

    // First tick records the timer.
    let (state, actions) = transition(&state, Event::TimeAdvance { now: T0 + 10.0 }, &cfg);
    assert!(actions.is_empty());
    assert_eq!(state.s2_entered_at, Some(T0 + 10.0));

    // Still within the fallback timeout.
    let (state, actions) = transition(&state, Event::TimeAdvance { now: T0 + 50.0 }, &cfg);
    assert!(actions.is_empty());

    // Past the fallback: the worse exit is given up.
    let (state, actions) = transition(&state, Event::TimeAdvance { now: T0 + 200.0 }, &cfg);
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::OrphanExit { reason: OrphanReason::S2Break, .. })));
    assert_eq!(state.s2_entered_at, None);
    assert!(matches!(derive_phase(&state), Phase::S1a | Phase::S1b));
    assert_eq!(state.recovery_orders.len(), 1);
    assert!(check_invariants(&state, &cfg).is_empty());
}

// =============================================================================
// Scenario 4: Recovery Fill
// =============================================================================

#[test]
fn test_recovery_fill_books_positive_profit() {
    let cfg = PairConfig {
        entry_pct: 0.5,
        profit_pct: 1.0,
        ..PairConfig::default()
    };
    let mut state = PairState::initial(0.10, T0, &cfg);
    state.recovery_orders.push(RecoveryState {
        side: Side::Sell,
        price: 0.101,
        volume: 35.0,
        trade_id: TradeId::B,
        cycle: 1,
        entry_price: 0.099,
        orphaned_at: T0 - 100.0,
        entry_filled_at: T0 - 200.0,
        reason: OrphanReason::Timeout,
    });
    state.consecutive_losses_b = 3;

    let (final_state, actions) = drive(
        state,
        &[Event::RecoveryFill {
            index: 0,
            fill_price: 0.101,
        }],
        &cfg,
    );

    let book = actions
        .iter()
        .find_map(|a| match a {
            Action::BookProfit { net_profit, .. } => Some(*net_profit),
            _ => None,
        })
        .expect("expected a BookProfit");
    assert!(book > 0.0);
    assert!(final_state.recovery_orders.is_empty());
    assert_eq!(final_state.consecutive_losses_b, 0);
    assert!(final_state.total_recovery_wins > 0.0);
}

// =============================================================================
// Scenario 5: Anti-Chase
// =============================================================================

#[test]
fn test_anti_chase_limits_refreshes_then_cools_down() {
    let cfg = PairConfig {
        entry_pct: 0.2,
        refresh_pct: 0.5,
        max_consecutive_refreshes: 3,
        ..PairConfig::default()
    };
    let state = PairState::initial(0.10, T0, &cfg);

    let mut events = Vec::new();
    for i in 0..5u32 {
        events.push(Event::PriceTick {
            price: 0.098 - i as f64 * 0.003,
        });
        events.push(Event::TimeAdvance {
            now: T0 + 30.0 * (i + 1) as f64,
        });
    }
    let (final_state, actions) = drive(state, &events, &cfg);

    // The buy entry refreshed at most max_consecutive_refreshes - 1 times
    // before the counter tripped the cooldown.
    let buy_refreshes = actions
        .iter()
        .filter(|a| {
            matches!(
                a,
                Action::PlaceOrder {
                    side: Side::Buy,
                    role: Role::Entry,
                    ..
                }
            )
        })
        .count();
    assert!(buy_refreshes <= 3, "got {} buy refreshes", buy_refreshes);
    assert!(final_state.refresh_cooldown_until_b > final_state.now);
    assert!(final_state.consecutive_refreshes_b >= cfg.max_consecutive_refreshes);
}

// =============================================================================
// Scenario 6: Long-Only
// =============================================================================

#[test]
fn test_long_only_never_places_sell_entry() {
    let cfg = PairConfig {
        entry_pct: 0.5,
        profit_pct: 1.0,
        long_only: true,
        ..PairConfig::default()
    };
    let state = PairState::initial(0.10, T0, &cfg);
    assert_eq!(state.orders.len(), 1);

    let buy_entry_price = 0.0995;
    let vol = compute_volume(buy_entry_price, &cfg, 1.0);
    let sell_exit_price = exit_price(buy_entry_price, 0.10, Side::Sell, &cfg);

    let events = vec![
        Event::BuyFill {
            price: buy_entry_price,
            volume: vol,
        },
        Event::TimeAdvance { now: T0 + 30.0 },
        Event::SellFill {
            price: sell_exit_price,
            volume: vol,
        },
        Event::TimeAdvance { now: T0 + 60.0 },
        Event::BuyFill {
            price: buy_entry_price,
            volume: vol,
        },
        Event::TimeAdvance { now: T0 + 90.0 },
    ];
    let (final_state, actions) = drive(state, &events, &cfg);

    // No sell entry was ever placed, in actions or in any resting order.
    assert!(!actions.iter().any(|a| matches!(
        a,
        Action::PlaceOrder {
            side: Side::Sell,
            role: Role::Entry,
            ..
        }
    )));
    assert!(final_state
        .orders
        .iter()
        .all(|o| !(o.side == Side::Sell && o.role == Role::Entry)));
    assert_eq!(final_state.total_round_trips, 1);
}

// =============================================================================
// Random Exploration
// =============================================================================

#[test]
fn test_random_exploration_10k_steps_zero_violations() {
    let cfg = PairConfig::default();
    let violations = explore_random(10_000, 42, &cfg);
    assert!(
        violations.is_empty(),
        "{} violations, first: {:?}",
        violations.len(),
        violations.first()
    );
}

#[test]
fn test_random_exploration_long_only_zero_violations() {
    let cfg = PairConfig {
        long_only: true,
        ..PairConfig::default()
    };
    let violations = explore_random(5_000, 7, &cfg);
    assert!(
        violations.is_empty(),
        "{} violations, first: {:?}",
        violations.len(),
        violations.first()
    );
}

// =============================================================================
// Cross-Component Wiring
// =============================================================================

#[test]
fn test_cycle_records_feed_the_sizers() {
    let cfg = PairConfig {
        entry_pct: 0.5,
        profit_pct: 1.0,
        ..PairConfig::default()
    };
    let state = PairState::initial(0.10, T0, &cfg);

    // One full round trip produces a cycle record usable by both sizers.
    let vol = compute_volume(0.0995, &cfg, 1.0);
    let sell_exit_price = exit_price(0.0995, 0.10, Side::Sell, &cfg);
    let events = vec![
        Event::BuyFill {
            price: 0.0995,
            volume: vol,
        },
        Event::TimeAdvance { now: T0 + 300.0 },
        Event::SellFill {
            price: sell_exit_price,
            volume: vol,
        },
    ];
    let (final_state, _) = drive(state, &events, &cfg);
    assert_eq!(final_state.completed_cycles.len(), 1);

    let samples: Vec<CycleSample> = final_state
        .completed_cycles
        .iter()
        .map(|c| CycleSample::from_record(c, Some(Regime::Ranging)))
        .collect();
    assert_eq!(samples[0].trade_id, Some(TradeId::B));
    assert!(samples[0].duration_sec() > 0.0);

    // Both sizers gate on insufficient samples and pass the base through.
    let mut kelly = KellySizer::new(&gridpair::config::KellyConfig {
        log_updates: false,
        ..gridpair::config::KellyConfig::default()
    });
    kelly.update(&samples, Some(Regime::Ranging));
    let (sized, reason) = kelly.size_for_slot(3.5, None);
    assert_eq!(sized, 3.5);
    assert_eq!(reason, "kelly_inactive");

    let mut throughput = ThroughputSizer::new(&gridpair::config::ThroughputConfig {
        enabled: true,
        log_updates: false,
        ..gridpair::config::ThroughputConfig::default()
    });
    throughput.update(&samples, &[], Some(Regime::Ranging), 100.0);
    let (sized, reason) = throughput.size_for_slot(3.5, None, Some(TradeId::B));
    assert_eq!(sized, 3.5);
    assert!(reason.starts_with("tp_"));
}

#[test]
fn test_bot_snapshot_round_trips_through_json() {
    let pair_cfg = PairConfig::default();
    let state = PairState::initial(0.10, T0, &pair_cfg);

    let mut detector = BocpdDetector::new(&gridpair::config::BocpdConfig::default());
    for i in 0..50 {
        detector.update(0.01 * (i as f64).sin(), T0 + i as f64);
    }

    let snapshot = BotSnapshot {
        saved_at: T0 + 50.0,
        pair: Some(state.clone()),
        bocpd: Some(detector.snapshot()),
        ..BotSnapshot::default()
    };
    let json = serde_json::to_string(&snapshot).unwrap();
    let parsed: BotSnapshot = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed.pair.as_ref().unwrap(), &state);

    let mut restored = BocpdDetector::new(&gridpair::config::BocpdConfig::default());
    restored.restore(parsed.bocpd.as_ref().unwrap());
    let a = detector.update(0.5, T0 + 100.0).clone();
    let b = restored.update(0.5, T0 + 100.0).clone();
    assert!((a.change_prob - b.change_prob).abs() < 1e-9);
    assert_eq!(a.run_length_mode, b.run_length_mode);
}

#[test]
fn test_stale_price_suppresses_s2_actions_end_to_end() {
    let cfg = PairConfig {
        s2_fallback_sec: 120.0,
        s2_max_spread_pct: 0.5,
        price_staleness_limit: 90.0,
        ..PairConfig::default()
    };
    let mut state = PairState::initial(0.10, T0, &cfg);
    state.orders = vec![
        OrderState {
            side: Side::Sell,
            role: Role::Exit,
            price: 0.1005,
            volume: 35.0,
            trade_id: TradeId::B,
            cycle: 1,
            entry_filled_at: T0,
            matched_entry_price: 0.0995,
        },
        OrderState {
            side: Side::Buy,
            role: Role::Exit,
            price: 0.0995,
            volume: 35.0,
            trade_id: TradeId::A,
            cycle: 1,
            entry_filled_at: T0,
            matched_entry_price: 0.1005,
        },
    ];

    // Fresh price, timer recorded.
    let (state, _) = transition(&state, Event::PriceTick { price: 0.10 }, &cfg);
    let (state, _) = transition(&state, Event::TimeAdvance { now: T0 + 10.0 }, &cfg);
    assert!(state.s2_entered_at.is_some());

    // Price goes stale: even far past the timeout, nothing happens.
    let (state, actions) = transition(&state, Event::TimeAdvance { now: T0 + 500.0 }, &cfg);
    assert!(actions.is_empty());
    assert_eq!(derive_phase(&state), Phase::S2);
}
