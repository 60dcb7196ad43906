//! Statistical sizing and detection models
//!
//! All models are synchronous in-memory objects owned by a single
//! orchestrator. Fits are O(n) in samples and may run off the hot path.
//! A model asked to size or predict before it has enough data passes the
//! base value through with an explanatory reason -- it never errors.

pub mod bocpd;
pub mod kelly;
pub mod survival;
pub mod throughput;

use serde::{Deserialize, Serialize};

use crate::types::{CycleRecord, TradeId};

pub use bocpd::{BocpdDetector, BocpdSnapshot, BocpdStatus};
pub use kelly::{KellyResult, KellySizer, KellySnapshot};
pub use survival::{FillObservation, SurvivalModel, SurvivalPrediction, SurvivalSnapshot};
pub use throughput::{BucketStats, ThroughputSizer, ThroughputSnapshot};

/// Market regime label emitted by the upstream regime classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Bearish,
    Ranging,
    Bullish,
}

impl Regime {
    pub const ALL: [Regime; 3] = [Regime::Bearish, Regime::Ranging, Regime::Bullish];

    pub fn id(self) -> u8 {
        match self {
            Regime::Bearish => 0,
            Regime::Ranging => 1,
            Regime::Bullish => 2,
        }
    }

    pub fn from_id(id: i64) -> Option<Regime> {
        match id {
            0 => Some(Regime::Bearish),
            1 => Some(Regime::Ranging),
            2 => Some(Regime::Bullish),
            _ => None,
        }
    }

    /// Coerce a raw label: numeric ids and legacy uppercase text both map to
    /// the canonical labels; anything else is None.
    pub fn from_raw(raw: &str) -> Option<Regime> {
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }
        if let Ok(id) = text.parse::<i64>() {
            return Regime::from_id(id);
        }
        match text.to_ascii_lowercase().as_str() {
            "bearish" => Some(Regime::Bearish),
            "ranging" => Some(Regime::Ranging),
            "bullish" => Some(Regime::Bullish),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Regime::Bearish => "bearish",
            Regime::Ranging => "ranging",
            Regime::Bullish => "bullish",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One completed cycle as consumed by the sizers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleSample {
    pub net_profit: f64,
    #[serde(default)]
    pub regime_at_entry: Option<Regime>,
    #[serde(default)]
    pub trade_id: Option<TradeId>,
    #[serde(default)]
    pub entry_time: f64,
    #[serde(default)]
    pub exit_time: f64,
}

impl CycleSample {
    /// Build a sample from a pair cycle record, tagging the regime the
    /// upstream classifier reported at entry time.
    pub fn from_record(record: &CycleRecord, regime_at_entry: Option<Regime>) -> Self {
        CycleSample {
            net_profit: record.net_profit,
            regime_at_entry,
            trade_id: Some(record.trade_id),
            entry_time: record.entry_time,
            exit_time: record.exit_time,
        }
    }

    pub fn duration_sec(&self) -> f64 {
        self.exit_time - self.entry_time
    }
}

/// One open (unfilled) exit as consumed by the throughput sizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpenExitSample {
    pub age_sec: f64,
    pub volume: f64,
    #[serde(default)]
    pub regime_at_entry: Option<Regime>,
    #[serde(default)]
    pub trade_id: Option<TradeId>,
}
