//! Paired-order state machine
//!
//! A deterministic transducer over immutable pair-state snapshots: market
//! events in, order-placement actions out. Phase {S0, S1a, S1b, S2} is
//! always derived from the open order set, never stored.

pub mod invariants;
pub mod lifecycle;
pub mod pricing;
pub mod report;
pub mod state;
pub mod transition;

pub use invariants::check_invariants;
pub use pricing::{compute_thresholds, entry_distances, exit_price, repriced_exit_price};
pub use report::{report, PairReport};
pub use state::{derive_phase, median_cycle_duration, PairState};
pub use transition::transition;
