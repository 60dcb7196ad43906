//! Survival analysis for fill-probability forecasting
//!
//! Two tiers behind one fit/predict surface: a stratified Kaplan-Meier
//! baseline that always works, and an optional Cox proportional-hazards
//! model fitted by penalized Newton-Raphson with a Breslow baseline. A Cox
//! fit that hits a singular Hessian falls back to the pseudo-inverse; a
//! non-finite step aborts the tier and leaves Kaplan-Meier active.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use tracing::{debug, info};

use crate::config::SurvivalConfig;
use crate::models::Regime;
use crate::types::TradeId;

const N_FEATURES: usize = 15;
const LINEAR_CLIP: f64 = 50.0;
const COX_L2: f64 = 1e-3;
const COX_MAX_ITER: usize = 25;

pub const FEATURE_NAMES: [&str; N_FEATURES] = [
    "p_bear_1m",
    "p_range_1m",
    "p_bull_1m",
    "p_bear_15m",
    "p_range_15m",
    "p_bull_15m",
    "p_bear_1h",
    "p_range_1h",
    "p_bull_1h",
    "side_is_B",
    "distance_pct",
    "entropy",
    "p_switch",
    "fill_imbalance",
    "congestion_ratio",
];

fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo.min(hi)).min(lo.max(hi))
}

fn safe_f64(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        default
    }
}

/// Normalize a regime posterior onto the simplex; degenerate input maps to
/// the all-ranging point.
fn safe_triplet(raw: [f64; 3]) -> [f64; 3] {
    let mut vec = raw.map(|v| clamp(safe_f64(v, 0.0), 0.0, 1.0));
    let total: f64 = vec.iter().sum();
    if total <= 1e-12 {
        return [0.0, 1.0, 0.0];
    }
    for v in &mut vec {
        *v /= total;
    }
    vec
}

/// Canonical horizon list: positive, sorted, deduplicated, never empty,
/// padded with the standard 30m/1h/4h horizons when fewer than three remain.
pub fn normalize_horizons(raw: &[u32]) -> Vec<u32> {
    let mut vals: Vec<u32> = raw.iter().copied().filter(|v| *v > 0).collect();
    vals.sort_unstable();
    vals.dedup();
    if vals.is_empty() {
        return vec![1800, 3600, 14400];
    }
    if vals.len() < 3 {
        vals.extend([1800, 3600, 14400]);
        vals.sort_unstable();
        vals.dedup();
    }
    vals
}

fn stratum_key(regime: Regime, side: TradeId) -> String {
    format!("{}_{}", regime.label(), side)
}

/// One fill observation: a completed exit (event) or a still-open exit
/// (censored lower bound on fill time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillObservation {
    pub duration_sec: f64,
    pub censored: bool,
    pub regime_at_entry: Regime,
    #[serde(default)]
    pub regime_at_exit: Option<Regime>,
    pub side: TradeId,
    pub distance_pct: f64,
    pub posterior_1m: [f64; 3],
    pub posterior_15m: [f64; 3],
    pub posterior_1h: [f64; 3],
    pub entropy_at_entry: f64,
    pub p_switch_at_entry: f64,
    pub fill_imbalance: f64,
    pub congestion_ratio: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub synthetic: bool,
}

fn default_weight() -> f64 {
    1.0
}

impl FillObservation {
    /// Defensive normalization of every field.
    pub fn normalized(&self) -> FillObservation {
        FillObservation {
            duration_sec: safe_f64(self.duration_sec, 1.0).max(1.0),
            censored: self.censored,
            regime_at_entry: self.regime_at_entry,
            regime_at_exit: self.regime_at_exit,
            side: self.side,
            distance_pct: safe_f64(self.distance_pct, 0.0).max(0.0),
            posterior_1m: safe_triplet(self.posterior_1m),
            posterior_15m: safe_triplet(self.posterior_15m),
            posterior_1h: safe_triplet(self.posterior_1h),
            entropy_at_entry: clamp(safe_f64(self.entropy_at_entry, 0.0), 0.0, 1.0),
            p_switch_at_entry: clamp(safe_f64(self.p_switch_at_entry, 0.0), 0.0, 1.0),
            fill_imbalance: clamp(safe_f64(self.fill_imbalance, 0.0), -1.0, 1.0),
            congestion_ratio: clamp(safe_f64(self.congestion_ratio, 0.0), 0.0, 1.0),
            weight: safe_f64(self.weight, 1.0).max(1e-6),
            synthetic: self.synthetic,
        }
    }

    fn features(&self) -> [f64; N_FEATURES] {
        let p1 = safe_triplet(self.posterior_1m);
        let p15 = safe_triplet(self.posterior_15m);
        let p60 = safe_triplet(self.posterior_1h);
        [
            p1[0],
            p1[1],
            p1[2],
            p15[0],
            p15[1],
            p15[2],
            p60[0],
            p60[1],
            p60[2],
            if self.side == TradeId::B { 1.0 } else { 0.0 },
            self.distance_pct.max(0.0),
            clamp(self.entropy_at_entry, 0.0, 1.0),
            clamp(self.p_switch_at_entry, 0.0, 1.0),
            clamp(self.fill_imbalance, -1.0, 1.0),
            clamp(self.congestion_ratio, 0.0, 1.0),
        ]
    }
}

/// Fill probabilities over the standard horizons.
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalPrediction {
    pub p_fill_30m: f64,
    pub p_fill_1h: f64,
    pub p_fill_4h: f64,
    /// Interpolated median fill time; infinite when the curve never crosses
    /// one half.
    pub median_remaining: f64,
    pub hazard_ratio: f64,
    pub model_tier: String,
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Kaplan-Meier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmCurve {
    pub event_times: Vec<f64>,
    pub survival: Vec<f64>,
    pub n_observations: usize,
    pub n_events: usize,
    pub n_censored: usize,
    pub weighted_observations: f64,
}

impl KmCurve {
    /// S(t): step function, right-continuous.
    pub fn survival_at(&self, t: f64) -> f64 {
        let tt = t.max(0.0);
        if self.event_times.is_empty() {
            return 1.0;
        }
        let idx = self.event_times.partition_point(|et| *et <= tt);
        if idx == 0 {
            return 1.0;
        }
        clamp(self.survival[idx - 1], 0.0, 1.0)
    }

    /// First event time where survival drops to one half.
    pub fn median_time(&self) -> f64 {
        for (t, s) in self.event_times.iter().zip(&self.survival) {
            if *s <= 0.5 {
                return *t;
            }
        }
        f64::INFINITY
    }
}

struct KaplanMeierModel {
    min_per_stratum: usize,
    curves: BTreeMap<String, KmCurve>,
    strata_counts: BTreeMap<String, usize>,
}

impl KaplanMeierModel {
    fn new(min_per_stratum: usize) -> Self {
        KaplanMeierModel {
            min_per_stratum: min_per_stratum.max(1),
            curves: BTreeMap::new(),
            strata_counts: BTreeMap::new(),
        }
    }

    fn fit(&mut self, observations: &[FillObservation]) {
        self.curves = BTreeMap::new();
        self.strata_counts = BTreeMap::new();

        let mut grouped: BTreeMap<String, Vec<&FillObservation>> = BTreeMap::new();
        grouped.insert("aggregate".to_string(), observations.iter().collect());
        for obs in observations {
            grouped
                .entry(stratum_key(obs.regime_at_entry, obs.side))
                .or_default()
                .push(obs);
        }

        for (key, rows) in grouped {
            self.strata_counts.insert(key.clone(), rows.len());
            if let Some(curve) = Self::fit_curve(&rows) {
                self.curves.insert(key, curve);
            }
        }
    }

    fn fit_curve(rows: &[&FillObservation]) -> Option<KmCurve> {
        if rows.is_empty() {
            return None;
        }
        let durations: Vec<f64> = rows.iter().map(|r| r.duration_sec.max(1.0)).collect();
        let events: Vec<bool> = rows.iter().map(|r| !r.censored).collect();
        let weights: Vec<f64> = rows.iter().map(|r| r.weight.max(1e-6)).collect();
        let weighted_total: f64 = weights.iter().sum();
        let n_censored = events.iter().filter(|e| !**e).count();

        let mut event_times: Vec<f64> = durations
            .iter()
            .zip(&events)
            .filter(|(_, e)| **e)
            .map(|(d, _)| *d)
            .collect();
        event_times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        event_times.dedup();

        if event_times.is_empty() {
            // Everything censored: a flat curve that still counts the rows.
            return Some(KmCurve {
                event_times: Vec::new(),
                survival: Vec::new(),
                n_observations: rows.len(),
                n_events: 0,
                n_censored,
                weighted_observations: weighted_total,
            });
        }

        let mut s = 1.0;
        let mut surv_vals = Vec::with_capacity(event_times.len());
        for t in &event_times {
            let at_risk: f64 = durations
                .iter()
                .zip(&weights)
                .filter(|(d, _)| **d >= *t)
                .map(|(_, w)| w)
                .sum();
            let d_i: f64 = durations
                .iter()
                .zip(events.iter().zip(&weights))
                .filter(|(d, (e, _))| **d == *t && **e)
                .map(|(_, (_, w))| w)
                .sum();
            if at_risk <= 1e-12 {
                continue;
            }
            s *= (1.0 - d_i / at_risk).max(0.0);
            surv_vals.push(clamp(s, 0.0, 1.0));
        }
        if surv_vals.is_empty() {
            return None;
        }
        event_times.truncate(surv_vals.len());
        Some(KmCurve {
            event_times,
            survival: surv_vals,
            n_observations: rows.len(),
            n_events: events.iter().filter(|e| **e).count(),
            n_censored,
            weighted_observations: weighted_total,
        })
    }

    /// Fill probabilities per horizon, median time, and confidence for one
    /// stratum (falling back to the aggregate curve when absent).
    fn predict(
        &self,
        regime: Regime,
        side: TradeId,
        horizons: &[u32],
    ) -> (BTreeMap<u32, f64>, f64, f64) {
        let key = stratum_key(regime, side);
        let curve = self.curves.get(&key).or_else(|| self.curves.get("aggregate"));
        let Some(curve) = curve else {
            let probs = horizons.iter().map(|h| (*h, 0.5)).collect();
            return (probs, f64::INFINITY, 0.0);
        };
        let probs = horizons
            .iter()
            .map(|h| (*h, clamp(1.0 - curve.survival_at(*h as f64), 0.0, 1.0)))
            .collect();
        let confidence = clamp(
            curve.weighted_observations / self.min_per_stratum.max(1) as f64,
            0.0,
            1.0,
        );
        (probs, curve.median_time(), confidence)
    }
}

// ---------------------------------------------------------------------------
// Cox proportional hazards
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoxSnapshot {
    pub fitted: bool,
    #[serde(default)]
    pub coef: Vec<f64>,
    #[serde(default)]
    pub mean: Vec<f64>,
    #[serde(default)]
    pub std: Vec<f64>,
    #[serde(default)]
    pub event_times: Vec<f64>,
    #[serde(default)]
    pub base_cumhaz: Vec<f64>,
}

struct CoxModel {
    coef: Option<DVector<f64>>,
    mean: Option<DVector<f64>>,
    std: Option<DVector<f64>>,
    event_times: Vec<f64>,
    base_cumhaz: Vec<f64>,
    fitted: bool,
}

impl CoxModel {
    fn new() -> Self {
        CoxModel {
            coef: None,
            mean: None,
            std: None,
            event_times: Vec::new(),
            base_cumhaz: Vec::new(),
            fitted: false,
        }
    }

    /// Maximize the weighted partial likelihood by Newton-Raphson with an L2
    /// penalty. Returns false (leaving the model unfitted) on degenerate
    /// input or a non-finite step.
    fn fit(&mut self, observations: &[FillObservation]) -> bool {
        if observations.len() < 2 {
            return false;
        }
        let n = observations.len();
        let durations: Vec<f64> = observations.iter().map(|o| o.duration_sec.max(1.0)).collect();
        let events: Vec<bool> = observations.iter().map(|o| !o.censored).collect();
        let weights: Vec<f64> = observations.iter().map(|o| o.weight.max(1e-6)).collect();
        if events.iter().filter(|e| **e).count() < 2 {
            return false;
        }

        let raw: Vec<[f64; N_FEATURES]> = observations.iter().map(|o| o.features()).collect();
        let mut mean = [0.0; N_FEATURES];
        for row in &raw {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= n as f64;
        }
        let mut std = [0.0; N_FEATURES];
        for row in &raw {
            for ((s, v), m) in std.iter_mut().zip(row).zip(&mean) {
                *s += (v - m).powi(2);
            }
        }
        for s in &mut std {
            *s = (*s / n as f64).sqrt();
            if *s <= 1e-9 {
                *s = 1.0;
            }
        }

        let z: Vec<DVector<f64>> = raw
            .iter()
            .map(|row| {
                DVector::from_iterator(
                    N_FEATURES,
                    row.iter()
                        .zip(mean.iter().zip(&std))
                        .map(|(v, (m, s))| (v - m) / s),
                )
            })
            .collect();

        let mut event_times: Vec<f64> = durations
            .iter()
            .zip(&events)
            .filter(|(_, e)| **e)
            .map(|(d, _)| *d)
            .collect();
        event_times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        event_times.dedup();
        if event_times.is_empty() {
            return false;
        }

        let mut beta = DVector::<f64>::zeros(N_FEATURES);
        for _ in 0..COX_MAX_ITER {
            let mut grad = DVector::<f64>::zeros(N_FEATURES);
            let mut hess = DMatrix::<f64>::zeros(N_FEATURES, N_FEATURES);
            let risk_scores: Vec<f64> = z
                .iter()
                .map(|zi| clamp(zi.dot(&beta), -LINEAR_CLIP, LINEAR_CLIP).exp())
                .collect();

            for t in &event_times {
                let event_idx: Vec<usize> = (0..n)
                    .filter(|i| durations[*i] == *t && events[*i])
                    .collect();
                if event_idx.is_empty() {
                    continue;
                }
                let risk_idx: Vec<usize> = (0..n).filter(|i| durations[*i] >= *t).collect();

                let denom: f64 = risk_idx.iter().map(|i| weights[*i] * risk_scores[*i]).sum();
                if denom <= 1e-12 {
                    continue;
                }

                let mut weighted_sum_z = DVector::<f64>::zeros(N_FEATURES);
                for i in &risk_idx {
                    weighted_sum_z += &z[*i] * (weights[*i] * risk_scores[*i]);
                }
                let mean_risk = &weighted_sum_z / denom;

                let w_event_total: f64 = event_idx.iter().map(|i| weights[*i]).sum();
                for i in &event_idx {
                    grad += &z[*i] * weights[*i];
                }
                grad -= &mean_risk * w_event_total;

                let mut weighted_outer = DMatrix::<f64>::zeros(N_FEATURES, N_FEATURES);
                for i in &risk_idx {
                    let wi = weights[*i] * risk_scores[*i];
                    weighted_outer += &z[*i] * z[*i].transpose() * wi;
                }
                let cov_risk = weighted_outer / denom - &mean_risk * mean_risk.transpose();
                hess -= cov_risk * w_event_total;
            }

            grad -= &beta * COX_L2;
            hess -= DMatrix::<f64>::identity(N_FEATURES, N_FEATURES) * COX_L2;

            let step = match hess.clone().lu().solve(&grad) {
                Some(step) => step,
                None => match hess.pseudo_inverse(1e-12) {
                    Ok(pinv) => pinv * &grad,
                    Err(_) => return false,
                },
            };
            if step.iter().any(|v| !v.is_finite()) {
                debug!("cox fit aborted: non-finite Newton step");
                return false;
            }

            let beta_new = &beta - &step;
            let delta = (&beta_new - &beta).norm();
            beta = beta_new;
            if delta < 1e-5 {
                break;
            }
        }

        // Breslow baseline cumulative hazard at the final coefficients.
        let risk_scores: Vec<f64> = z
            .iter()
            .map(|zi| clamp(zi.dot(&beta), -LINEAR_CLIP, LINEAR_CLIP).exp())
            .collect();
        let mut cum = 0.0;
        let mut cumhaz = Vec::new();
        let mut kept_times = Vec::new();
        for t in &event_times {
            let d_i: f64 = (0..n)
                .filter(|i| durations[*i] == *t && events[*i])
                .map(|i| weights[i])
                .sum();
            let denom: f64 = (0..n)
                .filter(|i| durations[*i] >= *t)
                .map(|i| weights[i] * risk_scores[i])
                .sum();
            if denom <= 1e-12 {
                continue;
            }
            cum += d_i / denom;
            cumhaz.push(cum);
            kept_times.push(*t);
        }
        if cumhaz.is_empty() {
            return false;
        }

        self.coef = Some(beta);
        self.mean = Some(DVector::from_row_slice(&mean));
        self.std = Some(DVector::from_row_slice(&std));
        self.event_times = kept_times;
        self.base_cumhaz = cumhaz;
        self.fitted = true;
        true
    }

    fn baseline_cumhaz_at(&self, horizon_sec: f64) -> f64 {
        if !self.fitted || self.event_times.is_empty() {
            return 0.0;
        }
        let idx = self.event_times.partition_point(|t| *t <= horizon_sec);
        if idx == 0 {
            return 0.0;
        }
        self.base_cumhaz[idx - 1].max(0.0)
    }

    fn linear_predictor(&self, obs: &FillObservation) -> Option<f64> {
        let (coef, mean, std) = (self.coef.as_ref()?, self.mean.as_ref()?, self.std.as_ref()?);
        let x = obs.features();
        let mut lin = 0.0;
        for i in 0..N_FEATURES.min(coef.len()).min(mean.len()).min(std.len()) {
            lin += (x[i] - mean[i]) / std[i] * coef[i];
        }
        Some(clamp(lin, -LINEAR_CLIP, LINEAR_CLIP))
    }

    fn predict_probs(&self, obs: &FillObservation, horizons: &[u32]) -> (BTreeMap<u32, f64>, f64) {
        let Some(lin) = (self.fitted.then(|| self.linear_predictor(obs)).flatten()) else {
            return (horizons.iter().map(|h| (*h, 0.5)).collect(), 1.0);
        };
        let hazard_ratio = lin.exp();
        let probs = horizons
            .iter()
            .map(|h| {
                let h0 = self.baseline_cumhaz_at(*h as f64);
                let surv = (-h0 * hazard_ratio).exp();
                (*h, clamp(1.0 - surv, 0.0, 1.0))
            })
            .collect();
        (probs, hazard_ratio)
    }

    fn median_time(&self, obs: &FillObservation) -> f64 {
        let Some(lin) = (self.fitted.then(|| self.linear_predictor(obs)).flatten()) else {
            return f64::INFINITY;
        };
        let hr = lin.exp();
        for (t, h0) in self.event_times.iter().zip(&self.base_cumhaz) {
            if (-h0 * hr).exp() <= 0.5 {
                return *t;
            }
        }
        f64::INFINITY
    }

    fn coefficients(&self) -> BTreeMap<String, f64> {
        match &self.coef {
            Some(coef) => FEATURE_NAMES
                .iter()
                .zip(coef.iter())
                .map(|(name, val)| (name.to_string(), *val))
                .collect(),
            None => BTreeMap::new(),
        }
    }

    fn snapshot(&self) -> CoxSnapshot {
        CoxSnapshot {
            fitted: self.fitted,
            coef: self.coef.as_ref().map(|v| v.iter().copied().collect()).unwrap_or_default(),
            mean: self.mean.as_ref().map(|v| v.iter().copied().collect()).unwrap_or_default(),
            std: self.std.as_ref().map(|v| v.iter().copied().collect()).unwrap_or_default(),
            event_times: self.event_times.clone(),
            base_cumhaz: self.base_cumhaz.clone(),
        }
    }

    fn restore(&mut self, snapshot: &CoxSnapshot) {
        if !snapshot.fitted {
            self.fitted = false;
            return;
        }
        let n = snapshot.coef.len().min(snapshot.mean.len()).min(snapshot.std.len());
        if n == 0 || snapshot.event_times.is_empty() || snapshot.base_cumhaz.is_empty() {
            self.fitted = false;
            return;
        }
        let m = snapshot.event_times.len().min(snapshot.base_cumhaz.len());
        self.coef = Some(DVector::from_row_slice(&snapshot.coef[..n]));
        self.mean = Some(DVector::from_row_slice(&snapshot.mean[..n]));
        self.std = Some(DVector::from_row_slice(&snapshot.std[..n]));
        self.event_times = snapshot.event_times[..m].to_vec();
        self.base_cumhaz = snapshot.base_cumhaz[..m].to_vec();
        self.fitted = true;
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// Serializable model snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurvivalSnapshot {
    pub model_tier: String,
    pub active_tier: String,
    pub last_retrain_ts: f64,
    pub n_observations: usize,
    pub n_censored: usize,
    pub synthetic_observations: usize,
    pub fitted: bool,
    #[serde(default)]
    pub strata_counts: BTreeMap<String, usize>,
    #[serde(default)]
    pub km_curves: BTreeMap<String, KmCurve>,
    #[serde(default)]
    pub cox: CoxSnapshot,
}

pub struct SurvivalModel {
    cfg: SurvivalConfig,
    model_tier: String,
    km: KaplanMeierModel,
    cox: CoxModel,
    pub last_retrain_ts: f64,
    pub n_observations: usize,
    pub n_censored: usize,
    pub synthetic_observations: usize,
    pub active_tier: String,
    pub fitted: bool,
}

impl SurvivalModel {
    pub fn new(cfg: &SurvivalConfig) -> Self {
        let tier = cfg.model_tier.trim().to_ascii_lowercase();
        let model_tier = if tier == "cox" {
            "cox".to_string()
        } else {
            "kaplan_meier".to_string()
        };
        SurvivalModel {
            cfg: cfg.clone(),
            model_tier,
            km: KaplanMeierModel::new(cfg.min_per_stratum),
            cox: CoxModel::new(),
            last_retrain_ts: 0.0,
            n_observations: 0,
            n_censored: 0,
            synthetic_observations: 0,
            active_tier: "kaplan_meier".to_string(),
            fitted: false,
        }
    }

    /// Fit both tiers from real and synthetic observations. Returns whether
    /// enough real observations were seen for the model to count as fitted.
    pub fn fit(
        &mut self,
        observations: &[FillObservation],
        synthetic_observations: &[FillObservation],
        now_ts: f64,
    ) -> bool {
        let real: Vec<FillObservation> = observations.iter().map(|o| o.normalized()).collect();
        let synth_weight = clamp(self.cfg.synthetic_weight, 0.0, 1.0);
        let synth: Vec<FillObservation> = synthetic_observations
            .iter()
            .map(|o| {
                let mut obs = o.normalized();
                obs.weight = synth_weight.max(1e-6);
                obs.synthetic = true;
                obs
            })
            .collect();

        let mut all = real.clone();
        all.extend(synth.iter().cloned());

        self.n_observations = real.len();
        self.n_censored = real.iter().filter(|o| o.censored).count();
        self.synthetic_observations = synth.len();
        self.km.fit(&all);
        self.active_tier = "kaplan_meier".to_string();
        self.fitted = real.len() >= self.cfg.min_observations.max(1);

        let use_cox = self.model_tier == "cox"
            && self.fitted
            && all.len() >= self.cfg.min_observations.max(2);
        if use_cox {
            if self.cox.fit(&all) {
                self.active_tier = "cox".to_string();
                info!(
                    "cox tier active: {} observations, {} events",
                    all.len(),
                    all.iter().filter(|o| !o.censored).count()
                );
            } else {
                // Silently remain on the Kaplan-Meier baseline.
                self.active_tier = "kaplan_meier".to_string();
            }
        }
        self.last_retrain_ts = now_ts;
        self.fitted
    }

    pub fn predict(&self, obs: &FillObservation) -> SurvivalPrediction {
        let normalized = obs.normalized();
        let horizons = normalize_horizons(&self.cfg.horizons);

        if !self.fitted {
            return SurvivalPrediction {
                p_fill_30m: 0.5,
                p_fill_1h: 0.5,
                p_fill_4h: 0.5,
                median_remaining: f64::INFINITY,
                hazard_ratio: 1.0,
                model_tier: "kaplan_meier".to_string(),
                confidence: 0.0,
            };
        }

        let pick = |probs: &BTreeMap<u32, f64>, target: u32, fallback_idx: usize, default: f64| {
            probs
                .get(&target)
                .copied()
                .or_else(|| {
                    horizons
                        .get(fallback_idx.min(horizons.len() - 1))
                        .and_then(|h| probs.get(h))
                        .copied()
                })
                .unwrap_or(default)
        };

        if self.active_tier == "cox" && self.cox.fitted {
            let (probs, hazard_ratio) = self.cox.predict_probs(&normalized, &horizons);
            let p30 = pick(&probs, 1800, 0, 0.5);
            let p1h = pick(&probs, 3600, 1, p30);
            let p4h = pick(&probs, 14400, horizons.len() - 1, p1h);
            let confidence = clamp(
                self.n_observations as f64 / (self.cfg.min_observations.max(1) * 2) as f64,
                0.0,
                1.0,
            );
            return SurvivalPrediction {
                p_fill_30m: p30,
                p_fill_1h: p1h,
                p_fill_4h: p4h,
                median_remaining: self.cox.median_time(&normalized),
                hazard_ratio,
                model_tier: "cox".to_string(),
                confidence,
            };
        }

        let (probs, median, confidence) =
            self.km
                .predict(normalized.regime_at_entry, normalized.side, &horizons);
        let p30 = pick(&probs, 1800, 0, 0.5);
        let p1h = pick(&probs, 3600, 1, p30);
        let p4h = pick(&probs, 14400, horizons.len() - 1, p1h);
        SurvivalPrediction {
            p_fill_30m: p30,
            p_fill_1h: p1h,
            p_fill_4h: p4h,
            median_remaining: median,
            hazard_ratio: 1.0,
            model_tier: "kaplan_meier".to_string(),
            confidence,
        }
    }

    pub fn km_curve(&self, regime: Regime, side: TradeId) -> Option<&KmCurve> {
        self.km.curves.get(&stratum_key(regime, side))
    }

    pub fn strata_counts(&self) -> &BTreeMap<String, usize> {
        &self.km.strata_counts
    }

    pub fn cox_coefficients(&self) -> BTreeMap<String, f64> {
        if self.active_tier == "cox" {
            self.cox.coefficients()
        } else {
            BTreeMap::new()
        }
    }

    pub fn snapshot(&self) -> SurvivalSnapshot {
        SurvivalSnapshot {
            model_tier: self.model_tier.clone(),
            active_tier: self.active_tier.clone(),
            last_retrain_ts: self.last_retrain_ts,
            n_observations: self.n_observations,
            n_censored: self.n_censored,
            synthetic_observations: self.synthetic_observations,
            fitted: self.fitted,
            strata_counts: self.km.strata_counts.clone(),
            km_curves: self.km.curves.clone(),
            cox: self.cox.snapshot(),
        }
    }

    /// Restore from a snapshot. Curves with mismatched array lengths are
    /// skipped; a malformed Cox payload leaves the tier unfitted.
    pub fn restore(&mut self, snapshot: &SurvivalSnapshot) {
        let tier = snapshot.model_tier.trim().to_ascii_lowercase();
        if tier == "cox" || tier == "kaplan_meier" {
            self.model_tier = tier;
        }
        let active = snapshot.active_tier.trim().to_ascii_lowercase();
        self.active_tier = if active == "cox" {
            "cox".to_string()
        } else {
            "kaplan_meier".to_string()
        };
        self.last_retrain_ts = snapshot.last_retrain_ts.max(0.0);
        self.n_observations = snapshot.n_observations;
        self.n_censored = snapshot.n_censored;
        self.synthetic_observations = snapshot.synthetic_observations;
        self.fitted = snapshot.fitted;
        self.km.strata_counts = snapshot.strata_counts.clone();

        self.km.curves = snapshot
            .km_curves
            .iter()
            .filter(|(_, c)| c.event_times.len() == c.survival.len())
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();

        self.cox.restore(&snapshot.cox);
        if self.active_tier == "cox" && !self.cox.fitted {
            self.active_tier = "kaplan_meier".to_string();
        }
    }

    /// Deterministic synthetic observations covering all six regime x side
    /// strata, used only to stabilize the Kaplan-Meier baseline.
    pub fn generate_synthetic_observations(n_paths: usize, weight: f64) -> Vec<FillObservation> {
        let mut rng = StdRng::seed_from_u64(42);
        let n_total = n_paths.max(6);
        let strata: Vec<(Regime, TradeId)> = Regime::ALL
            .iter()
            .flat_map(|r| [(*r, TradeId::A), (*r, TradeId::B)])
            .collect();
        let per = (n_total / strata.len()).max(1);

        let mut out = Vec::with_capacity(per * strata.len());
        for (regime, side) in strata {
            let mean_dur = match (regime, side) {
                (Regime::Bullish, TradeId::A) => 5400.0,
                (_, TradeId::A) => 3600.0,
                (Regime::Bullish, TradeId::B) => 2400.0,
                (_, TradeId::B) => 4200.0,
            };
            let normal = Normal::new(mean_dur, mean_dur * 0.25).ok();
            for _ in 0..per {
                let duration = normal
                    .as_ref()
                    .map(|d| rng.sample(d))
                    .unwrap_or(mean_dur)
                    .max(60.0);
                let censored = rng.gen::<f64>() < 0.10;
                let posterior = match regime {
                    Regime::Bullish => [0.1, 0.2, 0.7],
                    Regime::Bearish => [0.6, 0.3, 0.1],
                    Regime::Ranging => [0.2, 0.6, 0.2],
                };
                out.push(
                    FillObservation {
                        duration_sec: duration,
                        censored,
                        regime_at_entry: regime,
                        regime_at_exit: if censored { None } else { Some(regime) },
                        side,
                        distance_pct: rng.gen_range(0.05..1.2),
                        posterior_1m: posterior,
                        posterior_15m: posterior,
                        posterior_1h: posterior,
                        entropy_at_entry: if regime == Regime::Ranging { 0.75 } else { 0.20 },
                        p_switch_at_entry: if regime == Regime::Ranging { 0.12 } else { 0.05 },
                        fill_imbalance: rng.gen_range(-0.5..0.5),
                        congestion_ratio: rng.gen_range(0.0..0.6),
                        weight: weight.max(1e-6),
                        synthetic: true,
                    }
                    .normalized(),
                );
            }
        }
        out
    }
}
