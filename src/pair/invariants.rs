//! Structural invariants checked after every transition
//!
//! Returns human-readable violation descriptions; an empty list means the
//! state is legal. Test code treats any violation as fatal; production
//! callers log them through an observer hook.

use crate::config::PairConfig;
use crate::pair::state::{derive_phase, PairState};
use crate::types::{Phase, Role, Side};

/// Tolerance on invariant 9: exit prices may sit marginally inside the
/// entry price due to reprice-to-breakeven targets.
const EXIT_SIDE_TOLERANCE: f64 = 0.005;

/// Verify the twelve structural invariants. Invariant 1 (phase matches the
/// derivation rule) holds by construction since phase is never stored.
pub fn check_invariants(state: &PairState, cfg: &PairConfig) -> Vec<String> {
    let mut violations = Vec::new();
    let phase = derive_phase(state);

    // 2. At most 2 open orders (1 in long-only mode).
    let max_orders = if state.long_only { 1 } else { 2 };
    if state.orders.len() > max_orders {
        violations.push(format!(
            "INV2: {} orders on book (max {})",
            state.orders.len(),
            max_orders
        ));
    }

    // 3. No duplicate (side, role).
    let mut seen = Vec::new();
    for o in &state.orders {
        let key = (o.side, o.role);
        if seen.contains(&key) {
            violations.push(format!("INV3: duplicate ({}, {})", o.side, o.role));
        }
        seen.push(key);
    }

    // 4. Recovery orders bounded.
    if state.recovery_orders.len() > cfg.max_recovery_slots {
        violations.push(format!(
            "INV4: {} recovery orders (max {})",
            state.recovery_orders.len(),
            cfg.max_recovery_slots
        ));
    }

    // 5-8. Phase-specific composition.
    let entries: Vec<_> = state.orders.iter().filter(|o| o.role == Role::Entry).collect();
    let exits: Vec<_> = state.orders.iter().filter(|o| o.role == Role::Exit).collect();
    let buy_entries = entries.iter().filter(|o| o.side == Side::Buy).count();
    let sell_entries = entries.iter().filter(|o| o.side == Side::Sell).count();
    let buy_exits = exits.iter().filter(|o| o.side == Side::Buy).count();
    let sell_exits = exits.iter().filter(|o| o.side == Side::Sell).count();

    match phase {
        Phase::S0 => {
            if state.long_only {
                if buy_entries != 1 {
                    violations.push(format!(
                        "INV5: S0 (long-only) should have 1 buy entry, got {}",
                        buy_entries
                    ));
                }
                if sell_entries != 0 {
                    violations.push(format!(
                        "INV5: S0 (long-only) should have 0 sell entries, got {}",
                        sell_entries
                    ));
                }
            } else if buy_entries != 1 || sell_entries != 1 {
                violations.push(format!(
                    "INV5: S0 should have 1 buy entry + 1 sell entry, got {} buy + {} sell",
                    buy_entries, sell_entries
                ));
            }
            if !exits.is_empty() {
                violations.push(format!("INV5: S0 should have 0 exits, got {}", exits.len()));
            }
        }
        Phase::S1a => {
            if buy_exits != 1 {
                violations.push(format!("INV6: S1a should have 1 buy exit, got {}", buy_exits));
            }
            if sell_exits != 0 {
                violations.push(format!(
                    "INV6: S1a should have 0 sell exits, got {}",
                    sell_exits
                ));
            }
        }
        Phase::S1b => {
            if sell_exits != 1 {
                violations.push(format!(
                    "INV7: S1b should have 1 sell exit, got {}",
                    sell_exits
                ));
            }
            if buy_exits != 0 {
                violations.push(format!("INV7: S1b should have 0 buy exits, got {}", buy_exits));
            }
        }
        Phase::S2 => {
            if buy_exits != 1 || sell_exits != 1 {
                violations.push(format!(
                    "INV8: S2 should have 1 buy exit + 1 sell exit, got {} buy + {} sell",
                    buy_exits, sell_exits
                ));
            }
            if !entries.is_empty() {
                violations.push(format!(
                    "INV8: S2 should have 0 entries, got {}",
                    entries.len()
                ));
            }
        }
    }

    // 9. Exit prices on the profitable side of their entry (with tolerance).
    for o in &exits {
        if o.matched_entry_price > 0.0 {
            if o.side == Side::Sell
                && o.price < o.matched_entry_price * (1.0 - EXIT_SIDE_TOLERANCE)
            {
                violations.push(format!(
                    "INV9: sell exit {} below entry {} (leg {})",
                    o.price, o.matched_entry_price, o.trade_id
                ));
            }
            if o.side == Side::Buy && o.price > o.matched_entry_price * (1.0 + EXIT_SIDE_TOLERANCE)
            {
                violations.push(format!(
                    "INV9: buy exit {} above entry {} (leg {})",
                    o.price, o.matched_entry_price, o.trade_id
                ));
            }
        }
    }

    // 10. Cycle numbers start at 1.
    if state.cycle_a < 1 {
        violations.push(format!("INV10: cycle_a={} < 1", state.cycle_a));
    }
    if state.cycle_b < 1 {
        violations.push(format!("INV10: cycle_b={} < 1", state.cycle_b));
    }
    for o in &state.orders {
        if o.cycle < 1 {
            violations.push(format!(
                "INV10: order {}.{} has cycle < 1",
                o.trade_id, o.cycle
            ));
        }
    }

    // 11. The S2 timer must be clear outside S2. Inside S2 it may be unset
    // until the first break-glass tick records it.
    if phase != Phase::S2 && state.s2_entered_at.is_some() {
        violations.push(format!(
            "INV11: s2_entered_at set ({:?}) but phase={}",
            state.s2_entered_at, phase
        ));
    }

    // 12. Recovery reasons come from the closed set by construction of
    // `OrphanReason`; the check guards restored snapshots with orphan
    // timestamps from the future.
    for r in &state.recovery_orders {
        if r.orphaned_at > state.now {
            violations.push(format!(
                "INV12: recovery order {}.{} orphaned in the future ({} > {})",
                r.trade_id, r.cycle, r.orphaned_at, state.now
            ));
        }
    }

    violations
}
