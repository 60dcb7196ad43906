//! Core data types shared across the pair trading system

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance for matching a fill price against a resting order price.
pub const PRICE_MATCH_EPS: f64 = 1e-8;

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Whether an order opens a cycle or closes one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Entry,
    Exit,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Entry => write!(f, "entry"),
            Role::Exit => write!(f, "exit"),
        }
    }
}

/// The two legs of the pair. Leg A sells first, leg B buys first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeId {
    A,
    B,
}

impl TradeId {
    /// Side of this leg's entry order.
    pub fn entry_side(self) -> Side {
        match self {
            TradeId::A => Side::Sell,
            TradeId::B => Side::Buy,
        }
    }

    /// Side of this leg's exit order.
    pub fn exit_side(self) -> Side {
        match self {
            TradeId::A => Side::Buy,
            TradeId::B => Side::Sell,
        }
    }
}

impl std::fmt::Display for TradeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeId::A => write!(f, "A"),
            TradeId::B => write!(f, "B"),
        }
    }
}

/// Derived pair phase. Never stored -- always recomputed from the order set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Both entries on the book
    S0,
    /// Leg A exit (buy) live
    S1a,
    /// Leg B exit (sell) live
    S1b,
    /// Both exits live, no entries
    S2,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::S0 => write!(f, "S0"),
            Phase::S1a => write!(f, "S1a"),
            Phase::S1b => write!(f, "S1b"),
            Phase::S2 => write!(f, "S2"),
        }
    }
}

/// Directional trend hint derived from stranded or repriced exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Up => write!(f, "up"),
            Trend::Down => write!(f, "down"),
        }
    }
}

/// Why an exit was moved into the recovery list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    Timeout,
    S2Break,
    RepricedOut,
}

impl std::fmt::Display for OrphanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrphanReason::Timeout => write!(f, "timeout"),
            OrphanReason::S2Break => write!(f, "s2_break"),
            OrphanReason::RepricedOut => write!(f, "repriced_out"),
        }
    }
}

/// One resting order on the book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub side: Side,
    pub role: Role,
    pub price: f64,
    pub volume: f64,
    pub trade_id: TradeId,
    pub cycle: u32,
    /// When the matching entry filled (exits only; 0.0 for entries).
    #[serde(default)]
    pub entry_filled_at: f64,
    /// Cost basis carried by exit orders.
    #[serde(default)]
    pub matched_entry_price: f64,
}

impl OrderState {
    pub fn entry(side: Side, price: f64, volume: f64, trade_id: TradeId, cycle: u32) -> Self {
        Self {
            side,
            role: Role::Entry,
            price,
            volume,
            trade_id,
            cycle,
            entry_filled_at: 0.0,
            matched_entry_price: 0.0,
        }
    }

    pub fn is_entry(&self) -> bool {
        self.role == Role::Entry
    }

    pub fn is_exit(&self) -> bool {
        self.role == Role::Exit
    }

    /// Absolute distance from market, as a percentage of market price.
    pub fn distance_pct(&self, market_price: f64) -> f64 {
        if market_price <= 0.0 {
            return 0.0;
        }
        (self.price - market_price).abs() / market_price * 100.0
    }

    /// Whether a fill at `price` belongs to this order.
    pub fn matches_price(&self, price: f64) -> bool {
        (self.price - price).abs() < PRICE_MATCH_EPS
    }
}

/// One recovery (orphaned exit) order. It stays live at the venue; only its
/// classification changed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub side: Side,
    pub price: f64,
    pub volume: f64,
    pub trade_id: TradeId,
    pub cycle: u32,
    pub entry_price: f64,
    #[serde(default)]
    pub orphaned_at: f64,
    #[serde(default)]
    pub entry_filled_at: f64,
    pub reason: OrphanReason,
}

impl RecoveryState {
    /// Unrealized profit if the recovery order filled at the current market.
    pub fn unrealized(&self, market_price: f64) -> f64 {
        match self.side {
            Side::Sell => (market_price - self.entry_price) * self.volume,
            Side::Buy => (self.entry_price - market_price) * self.volume,
        }
    }
}

/// One completed entry -> exit round trip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub trade_id: TradeId,
    pub cycle: u32,
    pub entry_price: f64,
    pub exit_price: f64,
    pub volume: f64,
    pub gross_profit: f64,
    pub fees: f64,
    pub net_profit: f64,
    #[serde(default)]
    pub entry_time: f64,
    #[serde(default)]
    pub exit_time: f64,
}

impl CycleRecord {
    /// Entry-to-exit duration in seconds, if both timestamps are usable.
    pub fn duration_sec(&self) -> Option<f64> {
        if self.entry_time > 0.0 && self.exit_time > self.entry_time {
            Some(self.exit_time - self.entry_time)
        } else {
            None
        }
    }
}

/// Market events pushed into the core by the outer runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    /// A buy order filled (leg B entry or leg A exit).
    BuyFill { price: f64, volume: f64 },
    /// A sell order filled (leg A entry or leg B exit).
    SellFill { price: f64, volume: f64 },
    /// Market price update.
    PriceTick { price: f64 },
    /// Clock moves forward.
    TimeAdvance { now: f64 },
    /// A recovery order filled.
    RecoveryFill { index: usize, fill_price: f64 },
    /// A recovery order was cancelled externally.
    RecoveryCancel { index: usize },
}

/// Actions emitted by a transition. Descriptive only -- executing them is the
/// caller's responsibility.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    PlaceOrder {
        side: Side,
        role: Role,
        price: f64,
        volume: f64,
        trade_id: TradeId,
        cycle: u32,
        matched_entry_price: f64,
    },
    CancelOrder {
        order: OrderState,
        reason: String,
    },
    BookProfit {
        trade_id: TradeId,
        cycle: u32,
        net_profit: f64,
        gross_profit: f64,
        fees: f64,
    },
    OrphanExit {
        order: OrderState,
        reason: OrphanReason,
    },
    RepriceExit {
        old_order: OrderState,
        new_price: f64,
        reprice_count: u32,
    },
    DetectTrend {
        direction: Trend,
    },
}

/// Ledger operation errors. Everything else in the ledger coerces bad input
/// to defaults instead of propagating.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown position_id {0}")]
    UnknownPosition(u64),

    #[error("position_id {0} already exists")]
    DuplicatePosition(u64),
}
