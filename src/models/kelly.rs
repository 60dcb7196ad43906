//! Regime-conditional fractional Kelly position sizer
//!
//! Reads completed cycle history and computes an optimal fractional Kelly
//! multiplier per market regime, falling back to the aggregate bucket when a
//! regime has too few samples. Fractional Kelly (quarter by default) keeps
//! variance and ruin risk down; minimum sample gates keep the sizer from
//! acting on noise.

use std::collections::BTreeMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::KellyConfig;
use crate::models::{CycleSample, Regime};

/// Full diagnostics from one Kelly computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KellyResult {
    /// Raw Kelly fraction f* = (bp - q) / b
    pub f_star: f64,
    /// After applying the configured fraction
    pub f_fractional: f64,
    /// Sizing multiplier (1 + f_fractional), before floor/ceiling clamps
    pub multiplier: f64,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// b = avg_win / avg_loss; serialized as f64::MAX when infinite
    #[serde(with = "payoff_serde")]
    pub payoff_ratio: f64,
    pub n_total: usize,
    pub n_wins: usize,
    pub n_losses: usize,
    /// Expected value per unit risked (bp - q)
    pub edge: f64,
    pub sufficient_data: bool,
    pub reason: String,
}

/// JSON cannot carry infinities; the all-wins payoff serializes as f64::MAX.
mod payoff_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if *value > 0.0 {
            serializer.serialize_f64(f64::MAX)
        } else {
            serializer.serialize_f64(f64::MIN)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        f64::deserialize(deserializer)
    }
}

impl KellyResult {
    fn insufficient(n: usize, needed: usize) -> Self {
        KellyResult {
            f_star: 0.0,
            f_fractional: 0.0,
            multiplier: 1.0,
            win_rate: 0.0,
            avg_win: 0.0,
            avg_loss: 0.0,
            payoff_ratio: 0.0,
            n_total: n,
            n_wins: 0,
            n_losses: 0,
            edge: 0.0,
            sufficient_data: false,
            reason: format!("insufficient_samples ({}/{})", n, needed),
        }
    }
}

/// Exponential decay weights by recency rank of exit time. Returns weight
/// lists aligned with the win and loss subsequences of `cycles`.
pub fn recency_weights(cycles: &[CycleSample], halflife: usize) -> (Vec<f64>, Vec<f64>) {
    if cycles.is_empty() || halflife == 0 {
        return (Vec::new(), Vec::new());
    }

    // Rank 0 = most recent exit.
    let ranked: Vec<usize> = (0..cycles.len())
        .sorted_by(|a, b| {
            cycles[*b]
                .exit_time
                .partial_cmp(&cycles[*a].exit_time)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .collect();
    let decay = std::f64::consts::LN_2 / halflife as f64;
    let mut weights = vec![0.0; cycles.len()];
    for (rank, orig_idx) in ranked.into_iter().enumerate() {
        weights[orig_idx] = (-decay * rank as f64).exp();
    }

    let mut w_wins = Vec::new();
    let mut w_losses = Vec::new();
    for (i, c) in cycles.iter().enumerate() {
        if c.net_profit > 0.0 {
            w_wins.push(weights[i]);
        } else {
            w_losses.push(weights[i]);
        }
    }
    (w_wins, w_losses)
}

/// Compute fractional Kelly from win/loss amounts, optionally weighted.
/// `losses` carries positive magnitudes.
pub fn compute_kelly_fraction(
    wins: &[f64],
    losses: &[f64],
    fraction: f64,
    weights_w: Option<&[f64]>,
    weights_l: Option<&[f64]>,
) -> KellyResult {
    let n = wins.len() + losses.len();
    if n == 0 {
        return KellyResult {
            reason: "no_data".to_string(),
            ..KellyResult::insufficient(0, 1)
        };
    }

    let (avg_win, p) = match weights_w.filter(|w| w.len() == wins.len()) {
        Some(ww) => {
            let w_sum: f64 = ww.iter().sum();
            let avg = if w_sum > 0.0 {
                ww.iter().zip(wins).map(|(w, v)| w * v).sum::<f64>() / w_sum
            } else {
                0.0
            };
            let loss_mass = weights_l
                .map(|wl| wl.iter().sum::<f64>())
                .unwrap_or(losses.len() as f64);
            (avg, w_sum / (w_sum + loss_mass))
        }
        None => {
            let avg = if wins.is_empty() {
                0.0
            } else {
                wins.iter().sum::<f64>() / wins.len() as f64
            };
            (avg, wins.len() as f64 / n as f64)
        }
    };

    let avg_loss = match weights_l.filter(|w| w.len() == losses.len()) {
        Some(wl) => {
            let l_sum: f64 = wl.iter().sum();
            if l_sum > 0.0 {
                wl.iter().zip(losses).map(|(w, v)| w * v).sum::<f64>() / l_sum
            } else {
                0.0
            }
        }
        None => {
            if losses.is_empty() {
                0.0
            } else {
                losses.iter().sum::<f64>() / losses.len() as f64
            }
        }
    };

    let q = 1.0 - p;

    if avg_loss == 0.0 {
        // All wins: the edge is unbounded, cap Kelly at 1.
        return KellyResult {
            f_star: 1.0,
            f_fractional: fraction,
            multiplier: 1.0 + fraction,
            win_rate: p,
            avg_win,
            avg_loss: 0.0,
            payoff_ratio: f64::INFINITY,
            n_total: n,
            n_wins: wins.len(),
            n_losses: losses.len(),
            edge: avg_win,
            sufficient_data: true,
            reason: "all_wins".to_string(),
        };
    }

    let b = avg_win / avg_loss;
    let f_star = (b * p - q) / b;
    let edge = b * p - q;

    if f_star <= 0.0 {
        return KellyResult {
            f_star,
            f_fractional: 0.0,
            multiplier: 1.0,
            win_rate: p,
            avg_win,
            avg_loss,
            payoff_ratio: b,
            n_total: n,
            n_wins: wins.len(),
            n_losses: losses.len(),
            edge,
            sufficient_data: true,
            reason: "no_edge".to_string(),
        };
    }

    let f_frac = f_star * fraction;
    KellyResult {
        f_star,
        f_fractional: f_frac,
        multiplier: 1.0 + f_frac,
        win_rate: p,
        avg_win,
        avg_loss,
        payoff_ratio: b,
        n_total: n,
        n_wins: wins.len(),
        n_losses: losses.len(),
        edge,
        sufficient_data: true,
        reason: "ok".to_string(),
    }
}

/// Split cycles into regime buckets. Untagged cycles land in "unknown" and
/// contribute to the aggregate only.
pub fn partition_cycles_by_regime(
    cycles: &[CycleSample],
) -> BTreeMap<String, Vec<CycleSample>> {
    let mut buckets: BTreeMap<String, Vec<CycleSample>> = BTreeMap::new();
    buckets.insert("aggregate".to_string(), Vec::new());
    buckets.insert("unknown".to_string(), Vec::new());
    for regime in Regime::ALL {
        buckets.insert(regime.label().to_string(), Vec::new());
    }

    for c in cycles {
        buckets.entry("aggregate".to_string()).or_default().push(*c);
        let key = match c.regime_at_entry {
            Some(regime) => regime.label(),
            None => "unknown",
        };
        buckets.entry(key.to_string()).or_default().push(*c);
    }
    buckets
}

fn split_wins_losses(cycles: &[CycleSample]) -> (Vec<f64>, Vec<f64>) {
    let wins = cycles
        .iter()
        .filter(|c| c.net_profit > 0.0)
        .map(|c| c.net_profit)
        .collect();
    let losses = cycles
        .iter()
        .filter(|c| c.net_profit <= 0.0)
        .map(|c| c.net_profit.abs())
        .collect();
    (wins, losses)
}

/// Serializable sizer snapshot. Results are carried so sizing decisions
/// survive a restart unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KellySnapshot {
    pub active_regime: String,
    pub last_update_n: usize,
    #[serde(default)]
    pub results: BTreeMap<String, KellyResult>,
}

/// Stateful Kelly sizer.
///
/// Lifecycle: construct once, call `update` whenever the cycle history
/// grows, call `size_for_slot` at entry placement time.
pub struct KellySizer {
    cfg: KellyConfig,
    results: BTreeMap<String, KellyResult>,
    last_update_n: usize,
    active_regime: Regime,
}

impl KellySizer {
    pub fn new(cfg: &KellyConfig) -> Self {
        KellySizer {
            cfg: cfg.clone(),
            results: BTreeMap::new(),
            last_update_n: 0,
            active_regime: Regime::Ranging,
        }
    }

    pub fn active_regime(&self) -> Regime {
        self.active_regime
    }

    pub fn results(&self) -> &BTreeMap<String, KellyResult> {
        &self.results
    }

    /// Recompute Kelly fractions from cycle history.
    pub fn update(
        &mut self,
        completed_cycles: &[CycleSample],
        regime: Option<Regime>,
    ) -> &BTreeMap<String, KellyResult> {
        if let Some(r) = regime {
            self.active_regime = r;
        }
        let cfg = &self.cfg;

        // Rolling window: most recent N by exit time.
        let trimmed: Vec<CycleSample> = if completed_cycles.len() > cfg.lookback_cycles {
            completed_cycles
                .iter()
                .copied()
                .sorted_by(|a, b| {
                    b.exit_time
                        .partial_cmp(&a.exit_time)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .take(cfg.lookback_cycles)
                .collect()
        } else {
            completed_cycles.to_vec()
        };

        if trimmed.len() < cfg.min_samples_total {
            self.results = BTreeMap::from([(
                "aggregate".to_string(),
                KellyResult::insufficient(trimmed.len(), cfg.min_samples_total),
            )]);
            self.last_update_n = trimmed.len();
            return &self.results;
        }

        let buckets = partition_cycles_by_regime(&trimmed);
        let mut results = BTreeMap::new();

        for (label, cycles) in &buckets {
            if label == "unknown" {
                continue; // untagged cycles are not sized separately
            }
            let min_needed = if label == "aggregate" {
                cfg.min_samples_total
            } else {
                cfg.min_samples_per_regime
            };
            if cycles.len() < min_needed {
                results.insert(
                    label.clone(),
                    KellyResult::insufficient(cycles.len(), min_needed),
                );
                continue;
            }

            let (wins, losses) = split_wins_losses(cycles);
            let result = if cfg.use_recency_weighting {
                let (w_wins, w_losses) = recency_weights(cycles, cfg.recency_halflife_cycles);
                compute_kelly_fraction(
                    &wins,
                    &losses,
                    cfg.kelly_fraction,
                    Some(&w_wins),
                    Some(&w_losses),
                )
            } else {
                compute_kelly_fraction(&wins, &losses, cfg.kelly_fraction, None, None)
            };
            results.insert(label.clone(), result);
        }

        self.results = results;
        self.last_update_n = trimmed.len();

        if cfg.log_updates {
            self.log_summary();
        }
        &self.results
    }

    /// Apply the Kelly multiplier to a base order size. Returns the adjusted
    /// size and a reason string for the decision log.
    pub fn size_for_slot(&self, base_usd: f64, regime: Option<Regime>) -> (f64, String) {
        let cfg = &self.cfg;
        let label = regime.unwrap_or(self.active_regime).label();

        let (result, source) = match self.results.get(label) {
            Some(r) if r.sufficient_data => (Some(r), label),
            _ => match self.results.get("aggregate") {
                Some(r) if r.sufficient_data => (Some(r), "aggregate"),
                _ => (None, "aggregate"),
            },
        };

        let Some(result) = result else {
            // Not enough data yet: pass the base size through unchanged.
            return (base_usd, "kelly_inactive".to_string());
        };

        if result.reason == "no_edge" {
            let mult = cfg
                .kelly_floor_mult
                .max(cfg.negative_edge_mult.min(cfg.kelly_ceiling_mult));
            return (
                base_usd * mult,
                format!("kelly_no_edge({},m={:.3})", source, mult),
            );
        }

        let mult = cfg
            .kelly_floor_mult
            .max(result.multiplier.min(cfg.kelly_ceiling_mult));
        (
            base_usd * mult,
            format!("kelly_{}(f={:.4},m={:.3})", source, result.f_fractional, mult),
        )
    }

    pub fn snapshot(&self) -> KellySnapshot {
        KellySnapshot {
            active_regime: self.active_regime.label().to_string(),
            last_update_n: self.last_update_n,
            results: self.results.clone(),
        }
    }

    /// Restore from a snapshot, including the per-bucket results, so sizing
    /// right after a restart matches sizing right before the snapshot.
    pub fn restore(&mut self, snapshot: &KellySnapshot) {
        self.active_regime = Regime::from_raw(&snapshot.active_regime).unwrap_or(Regime::Ranging);
        self.last_update_n = snapshot.last_update_n;
        self.results = snapshot.results.clone();
    }

    fn log_summary(&self) {
        for (label, r) in &self.results {
            if r.sufficient_data {
                info!(
                    "kelly [{}] f*={:.4} f_frac={:.4} mult={:.3} win_rate={:.2}% payoff={:.3} edge={:.4} n={} ({}W/{}L)",
                    label,
                    r.f_star,
                    r.f_fractional,
                    r.multiplier,
                    r.win_rate * 100.0,
                    r.payoff_ratio,
                    r.edge,
                    r.n_total,
                    r.n_wins,
                    r.n_losses
                );
            } else {
                info!("kelly [{}] {}", label, r.reason);
            }
        }
    }
}
