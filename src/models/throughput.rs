//! Fill-time throughput position sizer
//!
//! Sizes by how fast exits fill rather than by win/loss edge: a regime/side
//! bucket that clears inventory faster than the aggregate earns a multiplier
//! above one. Open exits enter the percentile set as censored observations,
//! and two global penalties throttle output when inventory ages out or
//! capital utilization runs hot.

use std::collections::BTreeMap;

use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ThroughputConfig;
use crate::models::{CycleSample, OpenExitSample, Regime};
use crate::types::TradeId;

/// Bucket evaluation order: aggregate first, then regime x side.
pub const BUCKET_ORDER: [&str; 7] = [
    "aggregate",
    "bearish_A",
    "bearish_B",
    "ranging_A",
    "ranging_B",
    "bullish_A",
    "bullish_B",
];

fn clamp(value: f64, low: f64, high: f64) -> f64 {
    let lo = low.min(high);
    let hi = low.max(high);
    value.max(lo).min(hi)
}

fn bucket_key_for(regime: Option<Regime>, trade_id: Option<TradeId>) -> Option<String> {
    match (regime, trade_id) {
        (Some(r), Some(t)) => Some(format!("{}_{}", r.label(), t)),
        _ => None,
    }
}

/// Weighted percentile over (value, weight) observations. Non-positive
/// values and weights are dropped.
pub fn weighted_percentile(observations: &[(f64, f64)], q: f64) -> f64 {
    let pct = clamp(q, 0.0, 1.0);
    let mut clean: Vec<(f64, f64)> = observations
        .iter()
        .copied()
        .filter(|(v, w)| v.is_finite() && w.is_finite() && *v > 0.0 && *w > 0.0)
        .collect();
    if clean.is_empty() {
        return 0.0;
    }
    let total_weight: f64 = clean.iter().map(|(_, w)| w).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }

    clean.sort_by_key(|(v, _)| OrderedFloat(*v));
    if pct <= 0.0 {
        return clean[0].0;
    }
    if pct >= 1.0 {
        return clean[clean.len() - 1].0;
    }

    let threshold = total_weight * pct;
    let mut running = 0.0;
    for (value, weight) in &clean {
        running += weight;
        if running >= threshold {
            return *value;
        }
    }
    clean[clean.len() - 1].0
}

/// Fill-time statistics for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub median_fill_sec: f64,
    pub p75_fill_sec: f64,
    pub p95_fill_sec: f64,
    pub mean_profit_per_sec: f64,
    pub n_completed: usize,
    pub n_censored: usize,
}

/// One sizing decision with its components.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputResult {
    pub throughput_mult: f64,
    pub age_pressure: f64,
    pub util_penalty: f64,
    pub final_mult: f64,
    pub bucket_key: String,
    pub reason: String,
    pub sufficient_data: bool,
}

#[derive(Debug, Clone, Copy)]
struct CompletedRow {
    duration: f64,
    net_profit: f64,
    exit_time: f64,
}

/// Serializable sizer snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThroughputSnapshot {
    pub active_regime: String,
    pub last_update_n: usize,
    pub age_pressure: f64,
    pub util_penalty: f64,
    pub age_pressure_ref_age_sec: f64,
    pub oldest_open_exit_age_sec: f64,
    pub util_ratio: f64,
    #[serde(default)]
    pub bucket_stats: BTreeMap<String, BucketStats>,
    #[serde(default)]
    pub bucket_multipliers: BTreeMap<String, f64>,
    #[serde(default)]
    pub bucket_reasons: BTreeMap<String, String>,
    #[serde(default)]
    pub bucket_sufficient: BTreeMap<String, bool>,
    #[serde(default)]
    pub bucket_n_completed: BTreeMap<String, usize>,
    #[serde(default)]
    pub bucket_n_censored: BTreeMap<String, usize>,
}

pub struct ThroughputSizer {
    cfg: ThroughputConfig,
    active_regime: Regime,
    last_update_n: usize,
    age_pressure: f64,
    util_penalty: f64,
    /// p90 of open-exit ages -- robust to a single stale outlier.
    age_pressure_ref_age_sec: f64,
    oldest_open_exit_age_sec: f64,
    util_ratio: f64,
    bucket_stats: BTreeMap<String, BucketStats>,
    bucket_multipliers: BTreeMap<String, f64>,
    bucket_reasons: BTreeMap<String, String>,
    bucket_sufficient: BTreeMap<String, bool>,
    bucket_n_completed: BTreeMap<String, usize>,
    bucket_n_censored: BTreeMap<String, usize>,
}

impl ThroughputSizer {
    pub fn new(cfg: &ThroughputConfig) -> Self {
        let mut sizer = ThroughputSizer {
            cfg: cfg.clone(),
            active_regime: Regime::Ranging,
            last_update_n: 0,
            age_pressure: 1.0,
            util_penalty: 1.0,
            age_pressure_ref_age_sec: 0.0,
            oldest_open_exit_age_sec: 0.0,
            util_ratio: 0.0,
            bucket_stats: BTreeMap::new(),
            bucket_multipliers: BTreeMap::new(),
            bucket_reasons: BTreeMap::new(),
            bucket_sufficient: BTreeMap::new(),
            bucket_n_completed: BTreeMap::new(),
            bucket_n_censored: BTreeMap::new(),
        };
        sizer.reset_update_state();
        sizer
    }

    /// The reference statistic used for age pressure.
    pub fn age_pressure_reference(&self) -> &'static str {
        "p90"
    }

    pub fn age_pressure(&self) -> f64 {
        self.age_pressure
    }

    pub fn age_pressure_ref_age_sec(&self) -> f64 {
        self.age_pressure_ref_age_sec
    }

    pub fn oldest_open_exit_age_sec(&self) -> f64 {
        self.oldest_open_exit_age_sec
    }

    pub fn util_ratio(&self) -> f64 {
        self.util_ratio
    }

    pub fn bucket_stats(&self) -> &BTreeMap<String, BucketStats> {
        &self.bucket_stats
    }

    /// Recompute fill-time statistics, multipliers, and penalties.
    /// `free_base` is the uncommitted base-currency balance; locked volume is
    /// derived from the open exits.
    pub fn update(
        &mut self,
        completed_cycles: &[CycleSample],
        open_exits: &[OpenExitSample],
        regime: Option<Regime>,
        free_base: f64,
    ) -> &BTreeMap<String, BucketStats> {
        if let Some(r) = regime {
            self.active_regime = r;
        }
        self.reset_update_state();
        if !self.cfg.enabled {
            return &self.bucket_stats;
        }

        let trimmed = self.trim_cycles(completed_cycles);
        self.last_update_n = trimmed.len();

        let completed_by_bucket = Self::partition_completed(&trimmed);
        let (open_by_bucket, locked_base) = Self::partition_open_exits(open_exits);

        let aggregate_ready = self.compute_bucket_stats(
            "aggregate",
            completed_by_bucket.get("aggregate").map(Vec::as_slice).unwrap_or(&[]),
            open_by_bucket.get("aggregate").map(Vec::as_slice).unwrap_or(&[]),
            self.cfg.min_samples.max(1),
        );
        for bucket_name in BUCKET_ORDER.iter().skip(1) {
            self.compute_bucket_stats(
                bucket_name,
                completed_by_bucket.get(*bucket_name).map(Vec::as_slice).unwrap_or(&[]),
                open_by_bucket.get(*bucket_name).map(Vec::as_slice).unwrap_or(&[]),
                self.cfg.min_samples_per_bucket.max(1),
            );
        }

        self.compute_multipliers();
        self.compute_age_pressure(
            open_by_bucket.get("aggregate").map(Vec::as_slice).unwrap_or(&[]),
            aggregate_ready,
        );
        self.compute_util_penalty(locked_base, free_base);

        if self.cfg.log_updates {
            self.log_summary();
        }
        &self.bucket_stats
    }

    /// Apply the throughput multiplier to a base order size.
    pub fn size_for_slot(
        &self,
        base_usd: f64,
        regime: Option<Regime>,
        trade_id: Option<TradeId>,
    ) -> (f64, String) {
        let base = base_usd.max(0.0);
        let result = self.result_for(regime, trade_id);

        if result.reason == "tp_disabled" {
            return (base, "tp_disabled".to_string());
        }
        if !result.sufficient_data {
            return (base, format!("tp_{}", result.reason));
        }

        let adjusted = base * result.final_mult;
        let mut reason = format!(
            "tp_{}(t={:.3},age={:.3},util={:.3},m={:.3})",
            result.bucket_key,
            result.throughput_mult,
            result.age_pressure,
            result.util_penalty,
            result.final_mult
        );
        if result.reason != "ok" {
            reason = format!("{}:{}", reason, result.reason);
        }
        (adjusted, reason)
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        ThroughputSnapshot {
            active_regime: self.active_regime.label().to_string(),
            last_update_n: self.last_update_n,
            age_pressure: self.age_pressure,
            util_penalty: self.util_penalty,
            age_pressure_ref_age_sec: self.age_pressure_ref_age_sec,
            oldest_open_exit_age_sec: self.oldest_open_exit_age_sec,
            util_ratio: self.util_ratio,
            bucket_stats: self.bucket_stats.clone(),
            bucket_multipliers: self.bucket_multipliers.clone(),
            bucket_reasons: self.bucket_reasons.clone(),
            bucket_sufficient: self.bucket_sufficient.clone(),
            bucket_n_completed: self.bucket_n_completed.clone(),
            bucket_n_censored: self.bucket_n_censored.clone(),
        }
    }

    /// Restore from a snapshot. Unknown bucket keys are dropped; penalties
    /// and multipliers are clamped back into their configured ranges.
    pub fn restore(&mut self, snapshot: &ThroughputSnapshot) {
        if let Some(regime) = Regime::from_raw(&snapshot.active_regime) {
            self.active_regime = regime;
        }
        self.last_update_n = snapshot.last_update_n;
        self.age_pressure = clamp(snapshot.age_pressure, self.cfg.age_pressure_floor, 1.0);
        self.util_penalty = clamp(snapshot.util_penalty, self.cfg.util_floor, 1.0);
        self.age_pressure_ref_age_sec = snapshot.age_pressure_ref_age_sec.max(0.0);
        self.oldest_open_exit_age_sec = snapshot.oldest_open_exit_age_sec.max(0.0);
        self.util_ratio = clamp(snapshot.util_ratio, 0.0, 1.0);

        let known = |key: &String| BUCKET_ORDER.contains(&key.as_str());

        self.bucket_stats = snapshot
            .bucket_stats
            .iter()
            .filter(|(k, _)| known(k))
            .map(|(k, v)| {
                (
                    k.clone(),
                    BucketStats {
                        median_fill_sec: v.median_fill_sec.max(0.0),
                        p75_fill_sec: v.p75_fill_sec.max(0.0),
                        p95_fill_sec: v.p95_fill_sec.max(0.0),
                        mean_profit_per_sec: v.mean_profit_per_sec,
                        n_completed: v.n_completed,
                        n_censored: v.n_censored,
                    },
                )
            })
            .collect();

        for name in BUCKET_ORDER {
            self.bucket_multipliers.insert(name.to_string(), 1.0);
            self.bucket_reasons
                .insert(name.to_string(), "insufficient_data".to_string());
            self.bucket_sufficient.insert(name.to_string(), false);
            self.bucket_n_completed.insert(name.to_string(), 0);
            self.bucket_n_censored.insert(name.to_string(), 0);
        }
        for (k, v) in snapshot.bucket_multipliers.iter().filter(|(k, _)| known(k)) {
            self.bucket_multipliers
                .insert(k.clone(), clamp(*v, self.cfg.floor_mult, self.cfg.ceiling_mult));
        }
        for (k, v) in snapshot.bucket_reasons.iter().filter(|(k, _)| known(k)) {
            self.bucket_reasons.insert(k.clone(), v.clone());
        }
        for (k, v) in snapshot.bucket_sufficient.iter().filter(|(k, _)| known(k)) {
            self.bucket_sufficient.insert(k.clone(), *v);
        }
        for (k, v) in snapshot.bucket_n_completed.iter().filter(|(k, _)| known(k)) {
            self.bucket_n_completed.insert(k.clone(), *v);
        }
        for (k, v) in snapshot.bucket_n_censored.iter().filter(|(k, _)| known(k)) {
            self.bucket_n_censored.insert(k.clone(), *v);
        }
    }

    // ------------------ Internals ------------------

    fn reset_update_state(&mut self) {
        self.bucket_stats = BTreeMap::new();
        self.bucket_multipliers = BUCKET_ORDER
            .iter()
            .map(|n| (n.to_string(), 1.0))
            .collect();
        self.bucket_reasons = BUCKET_ORDER
            .iter()
            .map(|n| (n.to_string(), "insufficient_data".to_string()))
            .collect();
        self.bucket_sufficient = BUCKET_ORDER
            .iter()
            .map(|n| (n.to_string(), false))
            .collect();
        self.bucket_n_completed = BUCKET_ORDER.iter().map(|n| (n.to_string(), 0)).collect();
        self.bucket_n_censored = BUCKET_ORDER.iter().map(|n| (n.to_string(), 0)).collect();
        self.age_pressure = 1.0;
        self.util_penalty = 1.0;
        self.age_pressure_ref_age_sec = 0.0;
        self.oldest_open_exit_age_sec = 0.0;
        self.util_ratio = 0.0;
    }

    fn trim_cycles(&self, completed_cycles: &[CycleSample]) -> Vec<CycleSample> {
        let lookback = self.cfg.lookback_cycles.max(1);
        if completed_cycles.len() <= lookback {
            return completed_cycles.to_vec();
        }
        completed_cycles
            .iter()
            .copied()
            .sorted_by(|a, b| {
                let ka = if a.exit_time != 0.0 { a.exit_time } else { a.entry_time };
                let kb = if b.exit_time != 0.0 { b.exit_time } else { b.entry_time };
                kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
            })
            .take(lookback)
            .collect()
    }

    fn partition_completed(cycles: &[CycleSample]) -> BTreeMap<String, Vec<CompletedRow>> {
        let mut buckets: BTreeMap<String, Vec<CompletedRow>> = BTreeMap::new();
        for row in cycles {
            let duration = row.duration_sec();
            if duration <= 0.0 || !duration.is_finite() {
                continue;
            }
            let rec = CompletedRow {
                duration,
                net_profit: row.net_profit,
                exit_time: row.exit_time,
            };
            buckets.entry("aggregate".to_string()).or_default().push(rec);
            if let Some(key) = bucket_key_for(row.regime_at_entry, row.trade_id) {
                buckets.entry(key).or_default().push(rec);
            }
        }
        buckets
    }

    fn partition_open_exits(
        open_exits: &[OpenExitSample],
    ) -> (BTreeMap<String, Vec<OpenExitSample>>, f64) {
        let mut buckets: BTreeMap<String, Vec<OpenExitSample>> = BTreeMap::new();
        let mut locked = 0.0;
        for row in open_exits {
            if row.age_sec <= 0.0 || !row.age_sec.is_finite() {
                continue;
            }
            locked += row.volume.max(0.0);
            buckets.entry("aggregate".to_string()).or_default().push(*row);
            if let Some(key) = bucket_key_for(row.regime_at_entry, row.trade_id) {
                buckets.entry(key).or_default().push(*row);
            }
        }
        (buckets, locked)
    }

    fn compute_bucket_stats(
        &mut self,
        bucket_name: &str,
        completed_rows: &[CompletedRow],
        censored_rows: &[OpenExitSample],
        min_needed: usize,
    ) -> bool {
        let n_completed = completed_rows.len();
        self.bucket_n_completed
            .insert(bucket_name.to_string(), n_completed);
        if n_completed < min_needed {
            self.bucket_reasons.insert(
                bucket_name.to_string(),
                format!("insufficient_samples ({}/{})", n_completed, min_needed),
            );
            self.bucket_sufficient.insert(bucket_name.to_string(), false);
            return false;
        }

        let ranked: Vec<&CompletedRow> = completed_rows
            .iter()
            .sorted_by(|a, b| {
                b.exit_time
                    .partial_cmp(&a.exit_time)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .collect();

        let halflife = self.cfg.recency_halflife;
        let decay = if halflife > 0 {
            std::f64::consts::LN_2 / halflife as f64
        } else {
            0.0
        };

        let mut observations: Vec<(f64, f64)> = Vec::with_capacity(ranked.len());
        let mut weighted_profit = 0.0;
        let mut weighted_duration = 0.0;
        for (rank, row) in ranked.iter().enumerate() {
            if row.duration <= 0.0 {
                continue;
            }
            let weight = if decay > 0.0 {
                (-decay * rank as f64).exp()
            } else {
                1.0
            };
            observations.push((row.duration, weight));
            weighted_profit += row.net_profit * weight;
            weighted_duration += row.duration * weight;
        }

        if observations.is_empty() || weighted_duration <= 0.0 {
            self.bucket_reasons
                .insert(bucket_name.to_string(), "insufficient_data".to_string());
            self.bucket_sufficient.insert(bucket_name.to_string(), false);
            return false;
        }

        // Open exits older than half the completed-only median enter the
        // merged set as censored lower bounds.
        let base_median = weighted_percentile(&observations, 0.5);
        let cutoff = base_median * 0.5;
        let censored_weight = self.cfg.censored_weight.max(0.0);
        let censored_obs: Vec<(f64, f64)> = censored_rows
            .iter()
            .filter(|row| row.age_sec > cutoff)
            .map(|row| (row.age_sec, censored_weight))
            .collect();

        let mut merged = observations;
        merged.extend(&censored_obs);

        let stats = BucketStats {
            median_fill_sec: weighted_percentile(&merged, 0.5).max(0.0),
            p75_fill_sec: weighted_percentile(&merged, 0.75).max(0.0),
            p95_fill_sec: weighted_percentile(&merged, 0.95).max(0.0),
            mean_profit_per_sec: weighted_profit / weighted_duration,
            n_completed,
            n_censored: censored_obs.len(),
        };
        self.bucket_n_censored
            .insert(bucket_name.to_string(), stats.n_censored);
        self.bucket_stats.insert(bucket_name.to_string(), stats);
        self.bucket_sufficient.insert(bucket_name.to_string(), true);
        self.bucket_reasons
            .insert(bucket_name.to_string(), "ok".to_string());
        true
    }

    fn compute_multipliers(&mut self) {
        let Some(aggregate) = self.bucket_stats.get("aggregate").cloned() else {
            return;
        };
        if aggregate.median_fill_sec <= 0.0 {
            return;
        }

        self.bucket_multipliers.insert("aggregate".to_string(), 1.0);
        self.bucket_sufficient.insert("aggregate".to_string(), true);
        self.bucket_reasons
            .insert("aggregate".to_string(), "ok".to_string());

        for bucket_name in BUCKET_ORDER.iter().skip(1) {
            if !self.bucket_sufficient.get(*bucket_name).copied().unwrap_or(false) {
                self.bucket_multipliers.insert(bucket_name.to_string(), 1.0);
                continue;
            }
            let Some(bucket) = self.bucket_stats.get(*bucket_name) else {
                self.bucket_multipliers.insert(bucket_name.to_string(), 1.0);
                self.bucket_sufficient.insert(bucket_name.to_string(), false);
                self.bucket_reasons
                    .insert(bucket_name.to_string(), "insufficient_data".to_string());
                continue;
            };
            if bucket.median_fill_sec <= 0.0 {
                self.bucket_multipliers.insert(bucket_name.to_string(), 1.0);
                self.bucket_sufficient.insert(bucket_name.to_string(), false);
                self.bucket_reasons
                    .insert(bucket_name.to_string(), "insufficient_data".to_string());
                continue;
            }

            let raw_mult = aggregate.median_fill_sec / bucket.median_fill_sec;
            let bounded = clamp(raw_mult, self.cfg.floor_mult, self.cfg.ceiling_mult);

            let full_conf = self.cfg.full_confidence_samples.max(1);
            let confidence = (bucket.n_completed as f64 / full_conf as f64).min(1.0);
            let blended = 1.0 + confidence * (bounded - 1.0);
            let final_mult = clamp(blended, self.cfg.floor_mult, self.cfg.ceiling_mult);
            self.bucket_multipliers
                .insert(bucket_name.to_string(), final_mult);
        }
    }

    fn compute_age_pressure(&mut self, open_aggregate: &[OpenExitSample], aggregate_ready: bool) {
        let mut ages: Vec<f64> = open_aggregate
            .iter()
            .map(|r| r.age_sec.max(0.0))
            .collect();
        self.oldest_open_exit_age_sec = ages.iter().copied().fold(0.0, f64::max);
        self.age_pressure = 1.0;
        self.age_pressure_ref_age_sec = 0.0;

        if ages.is_empty() {
            return;
        }
        // p90 reference: one stale outlier among many healthy exits does not
        // throttle sizing.
        ages.sort_by_key(|a| OrderedFloat(*a));
        let idx = ((0.9 * ages.len() as f64).ceil() as usize).saturating_sub(1);
        self.age_pressure_ref_age_sec = ages[idx.min(ages.len() - 1)];

        if !aggregate_ready {
            return;
        }
        let Some(aggregate) = self.bucket_stats.get("aggregate") else {
            return;
        };
        if aggregate.p75_fill_sec <= 0.0 {
            return;
        }

        let trigger = self.cfg.age_pressure_trigger.max(0.0);
        let threshold = aggregate.p75_fill_sec * trigger;
        if threshold <= 0.0 || self.age_pressure_ref_age_sec <= threshold {
            return;
        }

        let excess_ratio = (self.age_pressure_ref_age_sec - threshold) / threshold;
        let pressured = 1.0 - excess_ratio * self.cfg.age_pressure_sensitivity;
        self.age_pressure = clamp(pressured, self.cfg.age_pressure_floor, 1.0);
    }

    fn compute_util_penalty(&mut self, locked_base: f64, free_base: f64) {
        let locked = locked_base.max(0.0);
        let free = free_base.max(0.0);
        let total = locked + free;
        self.util_ratio = if total > 0.0 { locked / total } else { 0.0 };
        self.util_penalty = 1.0;

        let threshold = clamp(self.cfg.util_threshold, 0.0, 1.0);
        if self.util_ratio <= threshold || threshold >= 1.0 {
            return;
        }

        let excess = (self.util_ratio - threshold) / (1.0 - threshold);
        let penalized = 1.0 - excess * self.cfg.util_sensitivity;
        self.util_penalty = clamp(penalized, self.cfg.util_floor, 1.0);
    }

    fn result_for(&self, regime: Option<Regime>, trade_id: Option<TradeId>) -> ThroughputResult {
        if !self.cfg.enabled {
            return ThroughputResult {
                throughput_mult: 1.0,
                age_pressure: 1.0,
                util_penalty: 1.0,
                final_mult: 1.0,
                bucket_key: "aggregate".to_string(),
                reason: "tp_disabled".to_string(),
                sufficient_data: false,
            };
        }

        if !self.bucket_sufficient.get("aggregate").copied().unwrap_or(false) {
            return ThroughputResult {
                throughput_mult: 1.0,
                age_pressure: 1.0,
                util_penalty: 1.0,
                final_mult: 1.0,
                bucket_key: "aggregate".to_string(),
                reason: "insufficient_data".to_string(),
                sufficient_data: false,
            };
        }

        let regime = regime.unwrap_or(self.active_regime);
        let candidate = bucket_key_for(Some(regime), trade_id);

        let mut bucket_key = "aggregate".to_string();
        let mut throughput_mult = 1.0;
        let mut reason = "ok".to_string();
        if let Some(candidate) = candidate {
            if self.bucket_sufficient.get(&candidate).copied().unwrap_or(false) {
                throughput_mult = clamp(
                    self.bucket_multipliers.get(&candidate).copied().unwrap_or(1.0),
                    self.cfg.floor_mult,
                    self.cfg.ceiling_mult,
                );
                bucket_key = candidate;
            } else {
                reason = "no_bucket".to_string();
            }
        }

        let final_mult = clamp(
            throughput_mult * self.age_pressure * self.util_penalty,
            self.cfg.floor_mult,
            self.cfg.ceiling_mult,
        );
        ThroughputResult {
            throughput_mult,
            age_pressure: self.age_pressure,
            util_penalty: self.util_penalty,
            final_mult,
            bucket_key,
            reason,
            sufficient_data: true,
        }
    }

    fn log_summary(&self) {
        match self.bucket_stats.get("aggregate") {
            Some(aggregate) => info!(
                "throughput: n={} median={:.1}s p75={:.1}s age={:.3} util={:.3} util_ratio={:.3}",
                self.last_update_n,
                aggregate.median_fill_sec,
                aggregate.p75_fill_sec,
                self.age_pressure,
                self.util_penalty,
                self.util_ratio
            ),
            None => info!(
                "throughput: insufficient aggregate samples (n={})",
                self.last_update_n
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cycle(regime: Regime, trade_id: TradeId, exit_ts: f64, duration: f64, profit: f64) -> CycleSample {
        CycleSample {
            net_profit: profit,
            regime_at_entry: Some(regime),
            trade_id: Some(trade_id),
            entry_time: exit_ts - duration,
            exit_time: exit_ts,
        }
    }

    fn open_exit(regime: Regime, trade_id: TradeId, age_sec: f64, volume: f64) -> OpenExitSample {
        OpenExitSample {
            age_sec,
            volume,
            regime_at_entry: Some(regime),
            trade_id: Some(trade_id),
        }
    }

    fn cfg() -> ThroughputConfig {
        ThroughputConfig {
            enabled: true,
            lookback_cycles: 1000,
            min_samples: 3,
            min_samples_per_bucket: 2,
            full_confidence_samples: 10,
            floor_mult: 0.5,
            ceiling_mult: 2.0,
            censored_weight: 0.5,
            age_pressure_trigger: 1.5,
            age_pressure_sensitivity: 0.5,
            age_pressure_floor: 0.3,
            util_threshold: 0.7,
            util_sensitivity: 0.8,
            util_floor: 0.4,
            recency_halflife: 0,
            log_updates: false,
        }
    }

    #[test]
    fn test_update_partitions_regime_side_buckets() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 1,
            min_samples_per_bucket: 1,
            full_confidence_samples: 1,
            ..cfg()
        });
        let cycles = vec![
            cycle(Regime::Bearish, TradeId::A, 100.0, 50.0, 1.0),
            cycle(Regime::Bearish, TradeId::B, 101.0, 60.0, 1.0),
            cycle(Regime::Ranging, TradeId::A, 102.0, 40.0, 1.0),
            cycle(Regime::Ranging, TradeId::B, 103.0, 30.0, 1.0),
            cycle(Regime::Bullish, TradeId::A, 104.0, 20.0, 1.0),
            cycle(Regime::Bullish, TradeId::B, 105.0, 10.0, 1.0),
        ];
        let stats = sizer.update(&cycles, &[], Some(Regime::Ranging), 100.0).clone();
        for name in BUCKET_ORDER {
            assert!(stats.contains_key(name), "missing bucket {}", name);
        }
    }

    #[test]
    fn test_fill_time_percentiles() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 3,
            min_samples_per_bucket: 1,
            full_confidence_samples: 1,
            ..cfg()
        });
        let cycles = vec![
            cycle(Regime::Ranging, TradeId::A, 100.0, 10.0, 1.0),
            cycle(Regime::Ranging, TradeId::A, 101.0, 20.0, 1.0),
            cycle(Regime::Ranging, TradeId::A, 102.0, 30.0, 1.0),
        ];
        let stats = sizer.update(&cycles, &[], Some(Regime::Ranging), 100.0);
        let agg = &stats["aggregate"];
        assert_relative_eq!(agg.median_fill_sec, 20.0);
        assert_relative_eq!(agg.p75_fill_sec, 30.0);
        assert_relative_eq!(agg.p95_fill_sec, 30.0);
    }

    #[test]
    fn test_censored_observations_contribute_with_weight() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 4,
            min_samples_per_bucket: 1,
            full_confidence_samples: 1,
            ..cfg()
        });
        let cycles: Vec<CycleSample> = (0..4)
            .map(|i| cycle(Regime::Ranging, TradeId::A, 100.0 + i as f64, 10.0, 1.0))
            .collect();
        let open: Vec<OpenExitSample> = (0..10)
            .map(|_| open_exit(Regime::Ranging, TradeId::A, 100.0, 5.0))
            .collect();
        let stats = sizer.update(&cycles, &open, Some(Regime::Ranging), 100.0);
        let agg = &stats["aggregate"];
        assert_eq!(agg.n_censored, 10);
        assert!(agg.median_fill_sec >= 100.0);
    }

    #[test]
    fn test_faster_bucket_sized_up() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 6,
            min_samples_per_bucket: 2,
            full_confidence_samples: 1,
            ..cfg()
        });
        let mut cycles = Vec::new();
        for i in 0..2 {
            cycles.push(cycle(Regime::Ranging, TradeId::A, 100.0 + i as f64, 10.0, 1.0));
        }
        for i in 0..6 {
            cycles.push(cycle(Regime::Bullish, TradeId::B, 200.0 + i as f64, 40.0, 1.0));
        }
        sizer.update(&cycles, &[], Some(Regime::Ranging), 100.0);
        let (fast, _) = sizer.size_for_slot(100.0, Some(Regime::Ranging), Some(TradeId::A));
        assert!(fast > 100.0);
    }

    #[test]
    fn test_slower_bucket_sized_down() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 6,
            min_samples_per_bucket: 2,
            full_confidence_samples: 1,
            ..cfg()
        });
        let mut cycles = Vec::new();
        for i in 0..2 {
            cycles.push(cycle(Regime::Ranging, TradeId::A, 100.0 + i as f64, 40.0, 1.0));
        }
        for i in 0..6 {
            cycles.push(cycle(Regime::Bullish, TradeId::B, 200.0 + i as f64, 10.0, 1.0));
        }
        sizer.update(&cycles, &[], Some(Regime::Ranging), 100.0);
        let (slow, _) = sizer.size_for_slot(100.0, Some(Regime::Ranging), Some(TradeId::A));
        assert!(slow < 100.0);
    }

    #[test]
    fn test_confidence_blends_small_bucket_toward_one() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 4,
            min_samples_per_bucket: 1,
            full_confidence_samples: 10,
            ..cfg()
        });
        let cycles = vec![
            cycle(Regime::Ranging, TradeId::A, 100.0, 10.0, 1.0),
            cycle(Regime::Bullish, TradeId::B, 101.0, 20.0, 1.0),
            cycle(Regime::Bullish, TradeId::B, 102.0, 20.0, 1.0),
            cycle(Regime::Bullish, TradeId::B, 103.0, 20.0, 1.0),
        ];
        sizer.update(&cycles, &[], Some(Regime::Ranging), 100.0);
        let (sized, _) = sizer.size_for_slot(100.0, Some(Regime::Ranging), Some(TradeId::A));
        // Raw multiplier 2.0, blended down to 1.1 by 1/10 confidence.
        assert!((sized - 110.0).abs() < 2.0);
    }

    #[test]
    fn test_age_pressure_throttles_on_stalled_exits() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 3,
            min_samples_per_bucket: 1,
            full_confidence_samples: 1,
            floor_mult: 0.1,
            age_pressure_trigger: 1.0,
            age_pressure_sensitivity: 1.0,
            age_pressure_floor: 0.3,
            ..cfg()
        });
        let cycles = vec![
            cycle(Regime::Ranging, TradeId::A, 100.0, 10.0, 1.0),
            cycle(Regime::Ranging, TradeId::B, 101.0, 10.0, 1.0),
            cycle(Regime::Bullish, TradeId::A, 102.0, 10.0, 1.0),
        ];
        let open = vec![open_exit(Regime::Ranging, TradeId::A, 30.0, 10.0)];
        sizer.update(&cycles, &open, Some(Regime::Ranging), 100.0);
        let (sized, _) = sizer.size_for_slot(100.0, Some(Regime::Ranging), Some(TradeId::A));
        assert!((sized - 30.0).abs() < 1.0);
    }

    #[test]
    fn test_age_pressure_p90_ignores_single_outlier() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 3,
            min_samples_per_bucket: 1,
            full_confidence_samples: 1,
            floor_mult: 0.1,
            age_pressure_trigger: 1.0,
            age_pressure_sensitivity: 1.0,
            age_pressure_floor: 0.3,
            ..cfg()
        });
        let cycles = vec![
            cycle(Regime::Ranging, TradeId::A, 100.0, 10.0, 1.0),
            cycle(Regime::Ranging, TradeId::B, 101.0, 10.0, 1.0),
            cycle(Regime::Bullish, TradeId::A, 102.0, 10.0, 1.0),
        ];
        let mut open: Vec<OpenExitSample> = (0..10)
            .map(|_| open_exit(Regime::Ranging, TradeId::A, 10.0, 10.0))
            .collect();
        open.push(open_exit(Regime::Ranging, TradeId::B, 1000.0, 10.0));
        sizer.update(&cycles, &open, Some(Regime::Ranging), 100.0);

        assert_eq!(sizer.age_pressure_reference(), "p90");
        assert_relative_eq!(sizer.age_pressure_ref_age_sec(), 10.0, epsilon = 1e-9);
        assert_relative_eq!(sizer.oldest_open_exit_age_sec(), 1000.0, epsilon = 1e-9);
        assert_relative_eq!(sizer.age_pressure(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_age_pressure_p90_small_set_still_sees_outlier() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 3,
            min_samples_per_bucket: 1,
            full_confidence_samples: 1,
            floor_mult: 0.1,
            age_pressure_trigger: 1.0,
            age_pressure_sensitivity: 1.0,
            age_pressure_floor: 0.3,
            ..cfg()
        });
        let cycles = vec![
            cycle(Regime::Ranging, TradeId::A, 100.0, 10.0, 1.0),
            cycle(Regime::Ranging, TradeId::B, 101.0, 10.0, 1.0),
            cycle(Regime::Bullish, TradeId::A, 102.0, 10.0, 1.0),
        ];
        let mut open: Vec<OpenExitSample> = (0..8)
            .map(|_| open_exit(Regime::Ranging, TradeId::A, 10.0, 10.0))
            .collect();
        open.push(open_exit(Regime::Ranging, TradeId::B, 1000.0, 10.0));
        sizer.update(&cycles, &open, Some(Regime::Ranging), 100.0);

        // ceil(0.9 * 9) - 1 = 8: the outlier is the reference in a small set.
        assert_relative_eq!(sizer.age_pressure_ref_age_sec(), 1000.0, epsilon = 1e-9);
        assert_relative_eq!(sizer.age_pressure(), 0.3, epsilon = 1e-9);
    }

    #[test]
    fn test_utilization_penalty() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 3,
            min_samples_per_bucket: 1,
            full_confidence_samples: 1,
            floor_mult: 0.1,
            util_threshold: 0.5,
            util_sensitivity: 1.0,
            util_floor: 0.4,
            ..cfg()
        });
        let cycles = vec![
            cycle(Regime::Ranging, TradeId::A, 100.0, 10.0, 1.0),
            cycle(Regime::Ranging, TradeId::B, 101.0, 10.0, 1.0),
            cycle(Regime::Bullish, TradeId::A, 102.0, 10.0, 1.0),
        ];
        let open = vec![open_exit(Regime::Ranging, TradeId::A, 15.0, 90.0)];
        sizer.update(&cycles, &open, Some(Regime::Ranging), 10.0);
        // util_ratio 0.9 over a 0.5 threshold: excess 0.8, penalty 0.4 floor.
        let (sized, _) = sizer.size_for_slot(100.0, Some(Regime::Ranging), Some(TradeId::A));
        assert!((sized - 40.0).abs() < 1.0);
    }

    #[test]
    fn test_final_multiplier_respects_floor_and_ceiling() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 4,
            min_samples_per_bucket: 2,
            full_confidence_samples: 1,
            ..cfg()
        });
        let mut fast = Vec::new();
        for i in 0..2 {
            fast.push(cycle(Regime::Ranging, TradeId::A, 100.0 + i as f64, 1.0, 1.0));
        }
        for i in 0..6 {
            fast.push(cycle(Regime::Bullish, TradeId::B, 102.0 + i as f64, 100.0, 1.0));
        }
        sizer.update(&fast, &[], Some(Regime::Ranging), 100.0);
        let (hi, _) = sizer.size_for_slot(100.0, Some(Regime::Ranging), Some(TradeId::A));
        assert!((hi - 200.0).abs() < 1.0);

        let mut slow = Vec::new();
        for i in 0..2 {
            slow.push(cycle(Regime::Ranging, TradeId::A, 100.0 + i as f64, 100.0, 1.0));
        }
        for i in 0..6 {
            slow.push(cycle(Regime::Bullish, TradeId::B, 102.0 + i as f64, 1.0, 1.0));
        }
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 4,
            min_samples_per_bucket: 2,
            full_confidence_samples: 1,
            ..cfg()
        });
        sizer.update(&slow, &[], Some(Regime::Ranging), 100.0);
        let (lo, _) = sizer.size_for_slot(100.0, Some(Regime::Ranging), Some(TradeId::A));
        assert!((lo - 50.0).abs() < 1.0);
    }

    #[test]
    fn test_insufficient_data_passes_through() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 10,
            min_samples_per_bucket: 5,
            ..cfg()
        });
        let cycles = vec![
            cycle(Regime::Ranging, TradeId::A, 100.0, 10.0, 1.0),
            cycle(Regime::Ranging, TradeId::A, 101.0, 10.0, 1.0),
        ];
        sizer.update(&cycles, &[], Some(Regime::Ranging), 100.0);
        let (sized, reason) = sizer.size_for_slot(100.0, Some(Regime::Ranging), Some(TradeId::A));
        assert_eq!(sized, 100.0);
        assert!(reason.contains("insufficient_data") || reason.contains("insufficient_samples"));
    }

    #[test]
    fn test_disabled_passes_through() {
        let sizer = ThroughputSizer::new(&ThroughputConfig {
            enabled: false,
            ..cfg()
        });
        let (sized, reason) = sizer.size_for_slot(100.0, Some(Regime::Ranging), Some(TradeId::A));
        assert_eq!(sized, 100.0);
        assert_eq!(reason, "tp_disabled");
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut sizer = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 3,
            min_samples_per_bucket: 1,
            full_confidence_samples: 1,
            ..cfg()
        });
        let cycles = vec![
            cycle(Regime::Ranging, TradeId::A, 100.0, 10.0, 2.0),
            cycle(Regime::Ranging, TradeId::B, 101.0, 20.0, 1.0),
            cycle(Regime::Bullish, TradeId::A, 102.0, 30.0, 1.0),
        ];
        let open = vec![open_exit(Regime::Ranging, TradeId::A, 25.0, 40.0)];
        sizer.update(&cycles, &open, Some(Regime::Bullish), 60.0);
        let before = sizer.size_for_slot(100.0, None, Some(TradeId::A));
        let snap = sizer.snapshot();

        let mut restored = ThroughputSizer::new(&ThroughputConfig {
            min_samples: 3,
            min_samples_per_bucket: 1,
            full_confidence_samples: 1,
            ..cfg()
        });
        restored.restore(&snap);
        let after = restored.size_for_slot(100.0, None, Some(TradeId::A));
        assert_relative_eq!(before.0, after.0, epsilon = 1e-9);
        assert_eq!(before.1, after.1);
        assert_eq!(restored.age_pressure_reference(), "p90");
        assert!(restored.bucket_stats().contains_key("ranging_A"));
    }

    #[test]
    fn test_weighted_percentile_edges() {
        assert_eq!(weighted_percentile(&[], 0.5), 0.0);
        let obs = vec![(10.0, 1.0), (20.0, 1.0), (30.0, 1.0)];
        assert_eq!(weighted_percentile(&obs, 0.0), 10.0);
        assert_eq!(weighted_percentile(&obs, 1.0), 30.0);
        assert_eq!(weighted_percentile(&obs, 0.5), 20.0);
        // Zero and negative entries are dropped.
        let obs = vec![(0.0, 1.0), (-5.0, 1.0), (10.0, 0.0), (7.0, 2.0)];
        assert_eq!(weighted_percentile(&obs, 0.5), 7.0);
    }
}
