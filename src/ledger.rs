//! Position/journal ledger
//!
//! Local-first bookkeeping for self-healing slots: a current-state table of
//! positions plus an append-only journal of events. Subsidy balances are
//! never stored -- they are derived from journal rows, with per-slot
//! high-watermark accumulators preserving lifetime totals when old rows are
//! trimmed.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::LedgerConfig;
use crate::types::{LedgerError, TradeId};

/// Journal rows are never trimmed below this bound.
const JOURNAL_LIMIT_FLOOR: usize = 50;

/// Slot operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotMode {
    Legacy,
    Sticky,
    Churner,
}

impl SlotMode {
    /// Coerce a raw string; anything unrecognized becomes `Legacy`.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sticky" => SlotMode::Sticky,
            "churner" => SlotMode::Churner,
            _ => SlotMode::Legacy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Why an exit was repriced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepriceReason {
    Tighten,
    Subsidy,
    Operator,
}

impl RepriceReason {
    /// Coerce a raw string; anything unrecognized becomes `Operator`.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tighten" => RepriceReason::Tighten,
            "subsidy" => RepriceReason::Subsidy,
            _ => RepriceReason::Operator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RepriceReason::Tighten => "tighten",
            RepriceReason::Subsidy => "subsidy",
            RepriceReason::Operator => "operator",
        }
    }
}

/// Entry context captured when a position opens. Immutable afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryData {
    pub entry_price: f64,
    pub entry_cost: f64,
    pub entry_fee: f64,
    pub entry_volume: f64,
    pub entry_time: f64,
    pub entry_regime: String,
    pub entry_volatility: f64,
}

/// Exit intent captured when a position opens. Mutable via repricing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitData {
    pub current_exit_price: f64,
    /// Defaults to `current_exit_price` when zero/absent.
    pub original_exit_price: f64,
    pub target_profit_pct: f64,
    pub exit_txid: String,
    pub times_repriced: u32,
}

/// Outcome fields written once when a position closes.
#[derive(Debug, Clone, Default)]
pub struct OutcomeData {
    pub exit_price: f64,
    pub exit_cost: f64,
    pub exit_fee: f64,
    pub exit_time: f64,
    pub exit_regime: String,
    pub net_profit: f64,
    /// "filled", "cancelled", or anything else (journalled as written_off).
    pub close_reason: String,
    /// Free-form detail carried into the journal row.
    pub reason: String,
    pub age_seconds: f64,
}

/// One tracked position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub position_id: u64,
    pub slot_id: u32,
    pub trade_id: TradeId,
    pub slot_mode: SlotMode,
    pub cycle: u32,
    // Entry context (immutable)
    pub entry_price: f64,
    pub entry_cost: f64,
    pub entry_fee: f64,
    pub entry_volume: f64,
    pub entry_time: f64,
    pub entry_regime: String,
    pub entry_volatility: f64,
    // Exit intent (mutable)
    pub current_exit_price: f64,
    pub original_exit_price: f64,
    pub target_profit_pct: f64,
    pub exit_txid: String,
    // Outcome (write once on close)
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_cost: Option<f64>,
    #[serde(default)]
    pub exit_fee: Option<f64>,
    #[serde(default)]
    pub exit_time: Option<f64>,
    #[serde(default)]
    pub exit_regime: Option<String>,
    #[serde(default)]
    pub net_profit: Option<f64>,
    #[serde(default)]
    pub close_reason: Option<String>,
    pub status: PositionStatus,
    #[serde(default)]
    pub times_repriced: u32,
}

/// One append-only journal row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub journal_id: u64,
    pub position_id: u64,
    pub timestamp: f64,
    pub event_type: String,
    #[serde(default)]
    pub details: Value,
}

/// Per-slot (or global) subsidy aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubsidyTotals {
    pub earned: f64,
    pub consumed: f64,
    pub balance: f64,
}

/// Serializable ledger snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub enabled: bool,
    #[serde(default)]
    pub position_ledger: Vec<PositionRecord>,
    #[serde(default)]
    pub position_journal_recent: Vec<JournalRecord>,
    #[serde(default)]
    pub position_id_counter: u64,
    #[serde(default)]
    pub journal_id_counter: u64,
    #[serde(default)]
    pub subsidy_earned_watermark_by_slot: BTreeMap<u32, f64>,
    #[serde(default)]
    pub subsidy_consumed_watermark_by_slot: BTreeMap<u32, f64>,
}

pub struct PositionLedger {
    enabled: bool,
    journal_local_limit: usize,
    positions: BTreeMap<u64, PositionRecord>,
    journal: Vec<JournalRecord>,
    next_position_id: u64,
    next_journal_id: u64,
    earned_watermark: BTreeMap<u32, f64>,
    consumed_watermark: BTreeMap<u32, f64>,
}

fn safe_f64(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        default
    }
}

fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

impl PositionLedger {
    pub fn new(cfg: &LedgerConfig) -> Self {
        PositionLedger {
            enabled: cfg.enabled,
            journal_local_limit: cfg.journal_local_limit.max(JOURNAL_LIMIT_FLOOR),
            positions: BTreeMap::new(),
            journal: Vec::new(),
            next_position_id: 1,
            next_journal_id: 1,
            earned_watermark: BTreeMap::new(),
            consumed_watermark: BTreeMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Open a new position. Returns the assigned position id (0 when the
    /// ledger is disabled).
    pub fn open_position(
        &mut self,
        slot_id: u32,
        trade_id: TradeId,
        slot_mode: SlotMode,
        cycle: u32,
        entry: EntryData,
        exit: ExitData,
    ) -> Result<u64, LedgerError> {
        self.open_position_with_id(None, slot_id, trade_id, slot_mode, cycle, entry, exit)
    }

    /// Open a position under an explicit id (restore paths). The id counter
    /// advances past it.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position_with_id(
        &mut self,
        position_id: Option<u64>,
        slot_id: u32,
        trade_id: TradeId,
        slot_mode: SlotMode,
        cycle: u32,
        entry: EntryData,
        exit: ExitData,
    ) -> Result<u64, LedgerError> {
        if !self.enabled {
            return Ok(0);
        }

        let pid = position_id.unwrap_or(self.next_position_id);
        if self.positions.contains_key(&pid) {
            return Err(LedgerError::DuplicatePosition(pid));
        }

        let current_exit = safe_f64(exit.current_exit_price, 0.0);
        let original_exit = if exit.original_exit_price > 0.0 {
            safe_f64(exit.original_exit_price, current_exit)
        } else {
            current_exit
        };

        let rec = PositionRecord {
            position_id: pid,
            slot_id,
            trade_id,
            slot_mode,
            cycle,
            entry_price: safe_f64(entry.entry_price, 0.0),
            entry_cost: safe_f64(entry.entry_cost, 0.0),
            entry_fee: safe_f64(entry.entry_fee, 0.0).max(0.0),
            entry_volume: safe_f64(entry.entry_volume, 0.0).max(0.0),
            entry_time: safe_f64(entry.entry_time, 0.0),
            entry_regime: entry.entry_regime,
            entry_volatility: safe_f64(entry.entry_volatility, 0.0).max(0.0),
            current_exit_price: current_exit,
            original_exit_price: original_exit,
            target_profit_pct: safe_f64(exit.target_profit_pct, 0.0),
            exit_txid: exit.exit_txid,
            exit_price: None,
            exit_cost: None,
            exit_fee: None,
            exit_time: None,
            exit_regime: None,
            net_profit: None,
            close_reason: None,
            status: PositionStatus::Open,
            times_repriced: exit.times_repriced,
        };

        self.positions.insert(pid, rec);
        self.next_position_id = self.next_position_id.max(pid + 1);
        debug!("position opened: id={} slot={} leg={}", pid, slot_id, trade_id);
        Ok(pid)
    }

    /// Append a journal event for a known position.
    pub fn journal_event(
        &mut self,
        position_id: u64,
        event_type: &str,
        details: Value,
        timestamp: Option<f64>,
    ) -> Result<u64, LedgerError> {
        if !self.enabled {
            return Ok(0);
        }
        if !self.positions.contains_key(&position_id) {
            return Err(LedgerError::UnknownPosition(position_id));
        }

        let jid = self.next_journal_id;
        self.journal.push(JournalRecord {
            journal_id: jid,
            position_id,
            timestamp: timestamp.map(|t| safe_f64(t, 0.0)).unwrap_or_else(now_ts),
            event_type: event_type.trim().to_string(),
            details,
        });
        self.next_journal_id += 1;
        self.trim_journal_if_needed();
        Ok(jid)
    }

    /// Attach or replace the venue txid of an open position's exit.
    /// Silently ignores unknown or closed positions.
    pub fn bind_exit_txid(&mut self, position_id: u64, txid: &str) {
        if let Some(rec) = self.positions.get_mut(&position_id) {
            if rec.status == PositionStatus::Open {
                rec.exit_txid = txid.to_string();
            }
        }
    }

    /// Record an exit reprice: mutate the exit intent, bump the counter, and
    /// journal old/new price and txid. Closed positions are left untouched.
    pub fn reprice_position(
        &mut self,
        position_id: u64,
        new_exit_price: f64,
        new_exit_txid: &str,
        reason: RepriceReason,
        subsidy_consumed: f64,
        timestamp: Option<f64>,
    ) -> Result<(), LedgerError> {
        if !self.enabled {
            return Ok(());
        }
        let rec = self
            .positions
            .get_mut(&position_id)
            .ok_or(LedgerError::UnknownPosition(position_id))?;
        if rec.status != PositionStatus::Open {
            return Ok(());
        }

        let old_price = rec.current_exit_price;
        let old_txid = rec.exit_txid.clone();
        rec.current_exit_price = safe_f64(new_exit_price, old_price);
        rec.exit_txid = new_exit_txid.to_string();
        rec.times_repriced += 1;

        self.journal_event(
            position_id,
            "repriced",
            json!({
                "old_price": old_price,
                "new_price": safe_f64(new_exit_price, old_price),
                "old_txid": old_txid,
                "new_txid": new_exit_txid,
                "reason": reason.as_str(),
                "subsidy_consumed": safe_f64(subsidy_consumed, 0.0).max(0.0),
            }),
            timestamp,
        )?;
        Ok(())
    }

    /// Close a position and journal the outcome. Idempotent: closing an
    /// already-closed position is a no-op.
    pub fn close_position(
        &mut self,
        position_id: u64,
        outcome: OutcomeData,
    ) -> Result<(), LedgerError> {
        if !self.enabled {
            return Ok(());
        }
        let rec = self
            .positions
            .get_mut(&position_id)
            .ok_or(LedgerError::UnknownPosition(position_id))?;
        if rec.status == PositionStatus::Closed {
            return Ok(());
        }

        let close_reason = {
            let raw = outcome.close_reason.trim().to_ascii_lowercase();
            if raw.is_empty() {
                "filled".to_string()
            } else {
                raw
            }
        };
        let exit_time = if outcome.exit_time > 0.0 {
            safe_f64(outcome.exit_time, 0.0)
        } else {
            now_ts()
        };

        rec.exit_price = Some(safe_f64(outcome.exit_price, 0.0));
        rec.exit_cost = Some(safe_f64(outcome.exit_cost, 0.0));
        rec.exit_fee = Some(safe_f64(outcome.exit_fee, 0.0).max(0.0));
        rec.exit_time = Some(exit_time);
        rec.exit_regime = Some(outcome.exit_regime.clone());
        rec.net_profit = Some(safe_f64(outcome.net_profit, 0.0));
        rec.close_reason = Some(close_reason.clone());
        rec.status = PositionStatus::Closed;

        let details = match close_reason.as_str() {
            "filled" => (
                "filled",
                json!({
                    "fill_price": safe_f64(outcome.exit_price, 0.0),
                    "fill_cost": safe_f64(outcome.exit_cost, 0.0),
                    "fill_fee": safe_f64(outcome.exit_fee, 0.0).max(0.0),
                    "net_profit": safe_f64(outcome.net_profit, 0.0),
                }),
            ),
            "cancelled" => (
                "cancelled",
                json!({
                    "reason": if outcome.reason.is_empty() {
                        "cancelled".to_string()
                    } else {
                        outcome.reason.clone()
                    },
                    "age_seconds": safe_f64(outcome.age_seconds, 0.0),
                }),
            ),
            other => (
                "written_off",
                json!({
                    "close_price": safe_f64(outcome.exit_price, 0.0),
                    "realized_loss": (-safe_f64(outcome.net_profit, 0.0)).max(0.0),
                    "reason": if outcome.reason.is_empty() {
                        other.to_string()
                    } else {
                        outcome.reason.clone()
                    },
                }),
            ),
        };

        self.journal_event(position_id, details.0, details.1, Some(exit_time))?;
        Ok(())
    }

    // ------------------ Queries ------------------

    pub fn get_position(&self, position_id: u64) -> Option<&PositionRecord> {
        self.positions.get(&position_id)
    }

    /// Open positions, oldest entry first; optionally filtered to one slot.
    pub fn open_positions(&self, slot_id: Option<u32>) -> Vec<&PositionRecord> {
        let mut rows: Vec<&PositionRecord> = self
            .positions
            .values()
            .filter(|r| r.status == PositionStatus::Open)
            .filter(|r| slot_id.map(|sid| r.slot_id == sid).unwrap_or(true))
            .collect();
        rows.sort_by(|a, b| {
            (a.entry_time, a.position_id)
                .partial_cmp(&(b.entry_time, b.position_id))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows
    }

    /// Closed positions, most recent exit first.
    pub fn position_history(&self, slot_id: Option<u32>, limit: usize) -> Vec<&PositionRecord> {
        let mut rows: Vec<&PositionRecord> = self
            .positions
            .values()
            .filter(|r| r.status == PositionStatus::Closed)
            .filter(|r| slot_id.map(|sid| r.slot_id == sid).unwrap_or(true))
            .collect();
        rows.sort_by(|a, b| {
            (b.exit_time.unwrap_or(0.0), b.position_id)
                .partial_cmp(&(a.exit_time.unwrap_or(0.0), a.position_id))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.truncate(limit.max(1));
        rows
    }

    /// Journal rows, optionally filtered to one position.
    pub fn journal(&self, position_id: Option<u64>) -> Vec<&JournalRecord> {
        self.journal
            .iter()
            .filter(|r| position_id.map(|pid| r.position_id == pid).unwrap_or(true))
            .collect()
    }

    /// Derived subsidy balance for one slot (never negative).
    pub fn subsidy_balance(&self, slot_id: u32) -> f64 {
        let (earned, consumed) = self.subsidy_totals_for_slot(slot_id);
        (earned - consumed).max(0.0)
    }

    /// Subsidy aggregates for one slot, or across all slots.
    pub fn subsidy_totals(&self, slot_id: Option<u32>) -> SubsidyTotals {
        let (earned, consumed) = match slot_id {
            Some(sid) => self.subsidy_totals_for_slot(sid),
            None => {
                let mut slots: Vec<u32> =
                    self.positions.values().map(|p| p.slot_id).collect();
                slots.extend(self.earned_watermark.keys().copied());
                slots.extend(self.consumed_watermark.keys().copied());
                slots.sort_unstable();
                slots.dedup();
                slots.iter().fold((0.0, 0.0), |(e, c), sid| {
                    let (se, sc) = self.subsidy_totals_for_slot(*sid);
                    (e + se, c + sc)
                })
            }
        };
        SubsidyTotals {
            earned,
            consumed,
            balance: (earned - consumed).max(0.0),
        }
    }

    // ------------------ Snapshot ------------------

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            enabled: self.enabled,
            position_ledger: self.positions.values().cloned().collect(),
            position_journal_recent: self.journal.clone(),
            position_id_counter: self.next_position_id,
            journal_id_counter: self.next_journal_id,
            subsidy_earned_watermark_by_slot: self.earned_watermark.clone(),
            subsidy_consumed_watermark_by_slot: self.consumed_watermark.clone(),
        }
    }

    /// Restore from a snapshot. Journal rows referencing unknown positions
    /// are dropped; id counters advance past every restored row.
    pub fn restore(&mut self, snapshot: &LedgerSnapshot) {
        self.enabled = snapshot.enabled;

        self.positions = snapshot
            .position_ledger
            .iter()
            .filter(|r| r.position_id >= 1)
            .map(|r| (r.position_id, r.clone()))
            .collect();

        self.journal = snapshot
            .position_journal_recent
            .iter()
            .filter(|r| self.positions.contains_key(&r.position_id))
            .cloned()
            .collect();

        let max_pid = self.positions.keys().max().copied().unwrap_or(0);
        let max_jid = self.journal.iter().map(|j| j.journal_id).max().unwrap_or(0);
        self.next_position_id = snapshot.position_id_counter.max(max_pid + 1).max(1);
        self.next_journal_id = snapshot.journal_id_counter.max(max_jid + 1).max(1);

        self.earned_watermark = snapshot
            .subsidy_earned_watermark_by_slot
            .iter()
            .map(|(k, v)| (*k, safe_f64(*v, 0.0).max(0.0)))
            .collect();
        self.consumed_watermark = snapshot
            .subsidy_consumed_watermark_by_slot
            .iter()
            .map(|(k, v)| (*k, safe_f64(*v, 0.0).max(0.0)))
            .collect();

        self.trim_journal_if_needed();
    }

    // ------------------ Internals ------------------

    fn subsidy_totals_for_slot(&self, slot_id: u32) -> (f64, f64) {
        let mut earned = self.earned_watermark.get(&slot_id).copied().unwrap_or(0.0);
        let mut consumed = self.consumed_watermark.get(&slot_id).copied().unwrap_or(0.0);

        for row in &self.journal {
            let Some(pos) = self.positions.get(&row.position_id) else {
                continue;
            };
            if pos.slot_id != slot_id {
                continue;
            }
            let (e, c) = Self::subsidy_contribution(row);
            earned += e;
            consumed += c;
        }

        (earned, consumed)
    }

    /// Contribution of one journal row to the (earned, consumed) pair.
    fn subsidy_contribution(row: &JournalRecord) -> (f64, f64) {
        let detail_f64 = |key: &str| -> f64 {
            row.details
                .get(key)
                .and_then(Value::as_f64)
                .map(|v| safe_f64(v, 0.0).max(0.0))
                .unwrap_or(0.0)
        };
        match row.event_type.as_str() {
            "churner_profit" => (detail_f64("net_profit"), 0.0),
            "over_performance" => {
                if row.details.get("excess").is_some() {
                    (detail_f64("excess"), 0.0)
                } else {
                    (detail_f64("net_profit"), 0.0)
                }
            }
            "repriced" => {
                let reason = row
                    .details
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_ascii_lowercase();
                if reason == "subsidy" {
                    (0.0, detail_f64("subsidy_consumed"))
                } else {
                    (0.0, 0.0)
                }
            }
            _ => (0.0, 0.0),
        }
    }

    fn trim_journal_if_needed(&mut self) {
        let limit = self.journal_local_limit.max(JOURNAL_LIMIT_FLOOR);
        if self.journal.len() <= limit {
            return;
        }

        let trim_n = self.journal.len() - limit;
        let removed: Vec<JournalRecord> = self.journal.drain(..trim_n).collect();
        debug!("journal trimmed: {} rows folded into watermarks", trim_n);

        for row in removed {
            let Some(pos) = self.positions.get(&row.position_id) else {
                continue;
            };
            let sid = pos.slot_id;
            let (earned, consumed) = Self::subsidy_contribution(&row);
            if earned > 0.0 {
                *self.earned_watermark.entry(sid).or_insert(0.0) += earned;
            }
            if consumed > 0.0 {
                *self.consumed_watermark.entry(sid).or_insert(0.0) += consumed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_limit(limit: usize) -> PositionLedger {
        PositionLedger::new(&LedgerConfig {
            enabled: true,
            journal_local_limit: limit,
        })
    }

    fn open_basic(ledger: &mut PositionLedger, slot_id: u32) -> u64 {
        ledger
            .open_position(
                slot_id,
                TradeId::B,
                SlotMode::Sticky,
                1,
                EntryData {
                    entry_price: 0.1,
                    entry_cost: 2.0,
                    entry_fee: 0.01,
                    entry_volume: 20.0,
                    entry_time: 1000.0,
                    entry_regime: "ranging".to_string(),
                    entry_volatility: 0.0,
                },
                ExitData {
                    current_exit_price: 0.101,
                    original_exit_price: 0.101,
                    target_profit_pct: 1.0,
                    exit_txid: "TX-EXIT-1".to_string(),
                    times_repriced: 0,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_open_position_creates_record() {
        let mut ledger = ledger_with_limit(500);
        let pid = open_basic(&mut ledger, 0);
        let rec = ledger.get_position(pid).unwrap();
        assert_eq!(rec.status, PositionStatus::Open);
        assert_eq!(rec.slot_mode, SlotMode::Sticky);
        assert_eq!(rec.trade_id, TradeId::B);
        assert_eq!(rec.original_exit_price, 0.101);
    }

    #[test]
    fn test_duplicate_position_id_rejected() {
        let mut ledger = ledger_with_limit(500);
        let pid = open_basic(&mut ledger, 0);
        let err = ledger
            .open_position_with_id(
                Some(pid),
                0,
                TradeId::A,
                SlotMode::Legacy,
                1,
                EntryData::default(),
                ExitData::default(),
            )
            .unwrap_err();
        assert_eq!(err, LedgerError::DuplicatePosition(pid));
    }

    #[test]
    fn test_journal_event_unknown_position_rejected() {
        let mut ledger = ledger_with_limit(500);
        let err = ledger
            .journal_event(99, "filled", json!({}), Some(1.0))
            .unwrap_err();
        assert_eq!(err, LedgerError::UnknownPosition(99));
    }

    #[test]
    fn test_close_position_is_idempotent() {
        let mut ledger = ledger_with_limit(500);
        let pid = open_basic(&mut ledger, 0);
        let outcome = OutcomeData {
            exit_price: 0.101,
            exit_cost: 2.02,
            exit_fee: 0.01,
            exit_time: 1100.0,
            exit_regime: "ranging".to_string(),
            net_profit: 0.01,
            close_reason: "filled".to_string(),
            ..OutcomeData::default()
        };
        ledger.close_position(pid, outcome.clone()).unwrap();
        let first = ledger.journal(Some(pid)).len();
        ledger.close_position(pid, outcome).unwrap();
        let second = ledger.journal(Some(pid)).len();
        assert_eq!(first, second);
        assert_eq!(
            ledger.get_position(pid).unwrap().status,
            PositionStatus::Closed
        );
    }

    #[test]
    fn test_unknown_close_reason_journals_written_off() {
        let mut ledger = ledger_with_limit(500);
        let pid = open_basic(&mut ledger, 0);
        ledger
            .close_position(
                pid,
                OutcomeData {
                    exit_price: 0.09,
                    net_profit: -0.2,
                    close_reason: "gave_up".to_string(),
                    exit_time: 1100.0,
                    ..OutcomeData::default()
                },
            )
            .unwrap();
        let rows = ledger.journal(Some(pid));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "written_off");
        assert_eq!(rows[0].details["realized_loss"].as_f64().unwrap(), 0.2);
    }

    #[test]
    fn test_reprice_mutates_intent_and_journals() {
        let mut ledger = ledger_with_limit(500);
        let pid = open_basic(&mut ledger, 0);
        ledger
            .reprice_position(pid, 0.1005, "TX-EXIT-2", RepriceReason::Tighten, 0.0, Some(1050.0))
            .unwrap();

        let rec = ledger.get_position(pid).unwrap();
        assert_eq!(rec.current_exit_price, 0.1005);
        assert_eq!(rec.original_exit_price, 0.101);
        assert_eq!(rec.times_repriced, 1);
        assert_eq!(rec.exit_txid, "TX-EXIT-2");

        let rows = ledger.journal(Some(pid));
        assert_eq!(rows[0].event_type, "repriced");
        assert_eq!(rows[0].details["old_txid"], "TX-EXIT-1");
    }

    #[test]
    fn test_subsidy_balance_derived_from_journal() {
        let mut ledger = ledger_with_limit(500);
        let pid = open_basic(&mut ledger, 3);
        ledger
            .journal_event(pid, "churner_profit", json!({"net_profit": 0.10}), Some(1001.0))
            .unwrap();
        ledger
            .journal_event(pid, "over_performance", json!({"excess": 0.05}), Some(1002.0))
            .unwrap();
        ledger
            .journal_event(
                pid,
                "repriced",
                json!({"reason": "subsidy", "subsidy_consumed": 0.08}),
                Some(1003.0),
            )
            .unwrap();
        assert!((ledger.subsidy_balance(3) - 0.07).abs() < 1e-9);
    }

    #[test]
    fn test_subsidy_watermark_preserved_on_trim() {
        // limit below the floor is clamped to 50, so build 54 rows to force
        // trimming of the early subsidy events.
        let mut ledger = ledger_with_limit(50);
        let pid = open_basic(&mut ledger, 7);
        ledger
            .journal_event(pid, "churner_profit", json!({"net_profit": 0.20}), Some(1001.0))
            .unwrap();
        ledger
            .journal_event(pid, "over_performance", json!({"excess": 0.10}), Some(1002.0))
            .unwrap();
        ledger
            .journal_event(
                pid,
                "repriced",
                json!({"reason": "subsidy", "subsidy_consumed": 0.05}),
                Some(1003.0),
            )
            .unwrap();
        ledger
            .journal_event(
                pid,
                "repriced",
                json!({"reason": "subsidy", "subsidy_consumed": 0.10}),
                Some(1004.0),
            )
            .unwrap();
        let before = ledger.subsidy_totals(Some(7));

        // Flood with neutral rows so the subsidy rows get trimmed out.
        for i in 0..60 {
            ledger
                .journal_event(pid, "heartbeat", json!({}), Some(1100.0 + i as f64))
                .unwrap();
        }
        assert!(ledger.journal(None).len() <= 50);

        let after = ledger.subsidy_totals(Some(7));
        assert!((before.earned - after.earned).abs() < 1e-9);
        assert!((before.consumed - after.consumed).abs() < 1e-9);
        assert!((before.balance - after.balance).abs() < 1e-9);
        assert!((after.earned - 0.30).abs() < 1e-9);
        assert!((after.consumed - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_global_subsidy_totals_sum_slots() {
        let mut ledger = ledger_with_limit(500);
        let p1 = open_basic(&mut ledger, 1);
        let p2 = open_basic(&mut ledger, 2);
        ledger
            .journal_event(p1, "churner_profit", json!({"net_profit": 0.10}), Some(1.0))
            .unwrap();
        ledger
            .journal_event(p2, "churner_profit", json!({"net_profit": 0.30}), Some(2.0))
            .unwrap();
        let totals = ledger.subsidy_totals(None);
        assert!((totals.earned - 0.40).abs() < 1e-9);
        assert_eq!(totals.consumed, 0.0);
    }

    #[test]
    fn test_disabled_ledger_is_noop() {
        let mut ledger = PositionLedger::new(&LedgerConfig {
            enabled: false,
            journal_local_limit: 500,
        });
        let pid = ledger
            .open_position(
                0,
                TradeId::A,
                SlotMode::Legacy,
                1,
                EntryData::default(),
                ExitData::default(),
            )
            .unwrap();
        assert_eq!(pid, 0);
        assert!(ledger.get_position(0).is_none());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut ledger = ledger_with_limit(500);
        let pid = open_basic(&mut ledger, 4);
        ledger
            .journal_event(pid, "churner_profit", json!({"net_profit": 0.25}), Some(1.0))
            .unwrap();
        let snap = ledger.snapshot();

        let mut restored = ledger_with_limit(500);
        restored.restore(&snap);
        assert_eq!(restored.get_position(pid).unwrap().slot_id, 4);
        assert_eq!(restored.journal(None).len(), 1);
        assert!((restored.subsidy_balance(4) - 0.25).abs() < 1e-9);

        // New ids continue past restored ones.
        let next = open_basic(&mut restored, 4);
        assert!(next > pid);
    }

    #[test]
    fn test_restore_drops_orphan_journal_rows() {
        let mut ledger = ledger_with_limit(500);
        let pid = open_basic(&mut ledger, 0);
        ledger
            .journal_event(pid, "filled", json!({}), Some(1.0))
            .unwrap();
        let mut snap = ledger.snapshot();
        snap.position_journal_recent.push(JournalRecord {
            journal_id: 99,
            position_id: 12345,
            timestamp: 2.0,
            event_type: "filled".to_string(),
            details: json!({}),
        });

        let mut restored = ledger_with_limit(500);
        restored.restore(&snap);
        assert_eq!(restored.journal(None).len(), 1);
    }

    #[test]
    fn test_enum_coercion_defaults() {
        assert_eq!(SlotMode::from_raw("STICKY"), SlotMode::Sticky);
        assert_eq!(SlotMode::from_raw("bogus"), SlotMode::Legacy);
        assert_eq!(RepriceReason::from_raw("Subsidy"), RepriceReason::Subsidy);
        assert_eq!(RepriceReason::from_raw(""), RepriceReason::Operator);
    }
}
