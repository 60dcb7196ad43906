//! gridpair
//!
//! Decision core of an automated market-making agent that places paired
//! limit orders around a reference price, waits for fills, and books
//! round-trip profits. The pair state machine is a pure transducer over
//! immutable snapshots; the statistical models (change-point detection,
//! Kelly and throughput sizing, survival analysis) feed its sizing inputs.

pub mod config;
pub mod ledger;
pub mod models;
pub mod pair;
pub mod replay;
pub mod snapshot;
pub mod types;

pub use config::Config;
pub use pair::{check_invariants, derive_phase, transition, PairState};
pub use types::*;
