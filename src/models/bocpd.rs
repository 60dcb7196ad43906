//! Bayesian online change-point detection
//!
//! Normal-Inverse-Gamma conjugate observation model over a truncated
//! run-length posterior. Joint masses are propagated in log-space with a
//! max-shift before exponentiation; a fully degenerate posterior resets to
//! the prior instead of dividing by zero.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, StudentsT};
use tracing::debug;

use crate::config::BocpdConfig;

const PROB_FLOOR: f64 = 1e-12;
const MASS_FLOOR: f64 = 1e-300;

fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo.min(hi)).min(lo.max(hi))
}

/// Reduce a (possibly vector) observation to a scalar: drop non-finite
/// entries and take the mean; an empty result maps to 0.0.
pub fn reduce_observation(values: &[f64]) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return 0.0;
    }
    finite.iter().sum::<f64>() / finite.len() as f64
}

/// Published detector state after each observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BocpdStatus {
    pub change_prob: f64,
    pub run_length_mode: usize,
    pub run_length_mode_prob: f64,
    pub last_update_ts: f64,
    pub observation_count: u64,
    pub alert_active: bool,
    /// Latched at the first alerting observation; 0.0 while clear.
    pub alert_triggered_at: f64,
    /// Leading run-length probabilities (first 32 entries above 1e-9).
    #[serde(default)]
    pub run_length_map: BTreeMap<usize, f64>,
}

impl Default for BocpdStatus {
    fn default() -> Self {
        BocpdStatus {
            change_prob: 0.0,
            run_length_mode: 0,
            run_length_mode_prob: 1.0,
            last_update_ts: 0.0,
            observation_count: 0,
            alert_active: false,
            alert_triggered_at: 0.0,
            run_length_map: BTreeMap::new(),
        }
    }
}

/// Serializable detector snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BocpdSnapshot {
    pub expected_run_length: usize,
    pub max_run_length: usize,
    pub alert_threshold: f64,
    pub urgent_threshold: f64,
    pub hazard: f64,
    pub prior_mu: f64,
    pub prior_kappa: f64,
    pub prior_alpha: f64,
    pub prior_beta: f64,
    #[serde(default)]
    pub run_probs: Vec<f64>,
    #[serde(default)]
    pub mu: Vec<f64>,
    #[serde(default)]
    pub kappa: Vec<f64>,
    #[serde(default)]
    pub alpha: Vec<f64>,
    #[serde(default)]
    pub beta: Vec<f64>,
    #[serde(default)]
    pub state: Option<BocpdStatus>,
}

/// Online change-point detector with a truncated run-length distribution.
pub struct BocpdDetector {
    expected_run_length: usize,
    max_run_length: usize,
    alert_threshold: f64,
    urgent_threshold: f64,
    hazard: f64,
    prior: (f64, f64, f64, f64),

    run_probs: Vec<f64>,
    mu: Vec<f64>,
    kappa: Vec<f64>,
    alpha: Vec<f64>,
    beta: Vec<f64>,

    pub status: BocpdStatus,
}

impl BocpdDetector {
    pub fn new(cfg: &BocpdConfig) -> Self {
        let expected_run_length = cfg.expected_run_length.max(2);
        let max_run_length = cfg.max_run_length.max(10);
        let alert_threshold = clamp(cfg.alert_threshold, 0.0, 1.0);
        let urgent_threshold = clamp(cfg.urgent_threshold, alert_threshold, 1.0);
        let prior = (
            cfg.prior_mu,
            cfg.prior_kappa.max(1e-9),
            cfg.prior_alpha.max(1e-9),
            cfg.prior_beta.max(1e-9),
        );
        BocpdDetector {
            expected_run_length,
            max_run_length,
            alert_threshold,
            urgent_threshold,
            hazard: 1.0 / expected_run_length as f64,
            prior,
            run_probs: vec![1.0],
            mu: vec![prior.0],
            kappa: vec![prior.1],
            alpha: vec![prior.2],
            beta: vec![prior.3],
            status: BocpdStatus::default(),
        }
    }

    pub fn alert_threshold(&self) -> f64 {
        self.alert_threshold
    }

    pub fn urgent_threshold(&self) -> f64 {
        self.urgent_threshold
    }

    /// Predictive Student-t log density under the NIG posterior at one run
    /// length.
    fn student_t_logpdf(x: f64, mu: f64, kappa: f64, alpha: f64, beta: f64) -> f64 {
        let dof = (2.0 * alpha).max(1e-9);
        let scale2 = ((beta * (kappa + 1.0)) / (alpha * kappa).max(1e-9)).max(PROB_FLOOR);
        match StudentsT::new(mu, scale2.sqrt(), dof) {
            Ok(dist) => dist.ln_pdf(x),
            Err(_) => f64::NEG_INFINITY,
        }
    }

    /// Feed one observation; returns the refreshed status.
    pub fn update(&mut self, observation: f64, now_ts: f64) -> &BocpdStatus {
        let x = if observation.is_finite() { observation } else { 0.0 };
        let n = self.run_probs.len();

        let log_pred: Vec<f64> = (0..n)
            .map(|i| {
                Self::student_t_logpdf(x, self.mu[i], self.kappa[i], self.alpha[i], self.beta[i])
            })
            .collect();

        let log_h = self.hazard.clamp(PROB_FLOOR, 1.0 - PROB_FLOOR).ln();
        let log_1mh = (1.0 - self.hazard).max(PROB_FLOOR).ln();

        // Growth r -> r+1 and change-point r -> 0, stabilized by max-shift.
        let run_log: Vec<f64> = self.run_probs.iter().map(|p| p.max(MASS_FLOOR).ln()).collect();
        let log_growth: Vec<f64> = (0..n).map(|i| run_log[i] + log_pred[i] + log_1mh).collect();
        let log_cp: Vec<f64> = (0..n).map(|i| run_log[i] + log_pred[i] + log_h).collect();

        let max_cp = log_cp.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let cp_mass = if max_cp.is_finite() {
            log_cp.iter().map(|l| (l - max_cp).exp()).sum::<f64>() * max_cp.exp()
        } else {
            0.0
        };

        let new_len = (self.max_run_length + 1).min(n + 1);
        let mut new_joint = vec![0.0; new_len];
        new_joint[0] = cp_mass;

        let max_growth = log_growth.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max_growth.is_finite() {
            let scale = max_growth.exp();
            let keep = (new_len - 1).min(n);
            for i in 0..keep {
                new_joint[1 + i] = (log_growth[i] - max_growth).exp() * scale;
            }
        }

        let total: f64 = new_joint.iter().sum();
        let new_probs = if total <= MASS_FLOOR {
            debug!("bocpd posterior degenerate, resetting to prior");
            vec![1.0]
        } else {
            new_joint.iter().map(|v| v / total).collect()
        };

        // Conjugate NIG update from the old parameters; entry 0 restarts at
        // the prior.
        let carry = (new_probs.len().saturating_sub(1)).min(n);
        let mut new_mu = vec![self.prior.0; new_probs.len()];
        let mut new_kappa = vec![self.prior.1; new_probs.len()];
        let mut new_alpha = vec![self.prior.2; new_probs.len()];
        let mut new_beta = vec![self.prior.3; new_probs.len()];
        for i in 0..carry {
            let kappa_new = self.kappa[i] + 1.0;
            new_mu[1 + i] = (self.kappa[i] * self.mu[i] + x) / kappa_new.max(PROB_FLOOR);
            new_kappa[1 + i] = kappa_new;
            new_alpha[1 + i] = self.alpha[i] + 0.5;
            new_beta[1 + i] = self.beta[i]
                + (self.kappa[i] * (x - self.mu[i]).powi(2)) / (2.0 * kappa_new).max(PROB_FLOOR);
        }

        self.run_probs = new_probs;
        self.mu = new_mu;
        self.kappa = new_kappa;
        self.alpha = new_alpha;
        self.beta = new_beta;

        let mode = self
            .run_probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mode_prob = self.run_probs.get(mode).copied().unwrap_or(1.0);

        // Mass on young run lengths captures "a change happened recently"
        // better than P(r=0) alone, which converges to the hazard rate.
        let young_window = (self.expected_run_length / 20).max(3);
        let young_end = young_window.min(self.run_probs.len());
        let change_prob: f64 = self.run_probs[..young_end].iter().sum();
        let change_prob = clamp(change_prob, 0.0, 1.0);

        let alert_active = change_prob >= self.alert_threshold;
        let alert_triggered_at = if alert_active {
            if self.status.alert_triggered_at > 0.0 {
                self.status.alert_triggered_at
            } else {
                now_ts
            }
        } else {
            0.0
        };

        let run_length_map: BTreeMap<usize, f64> = self
            .run_probs
            .iter()
            .take(32)
            .enumerate()
            .filter(|(_, p)| **p > 1e-9)
            .map(|(i, p)| (i, *p))
            .collect();

        self.status = BocpdStatus {
            change_prob,
            run_length_mode: mode,
            run_length_mode_prob: clamp(mode_prob, 0.0, 1.0),
            last_update_ts: now_ts,
            observation_count: self.status.observation_count + 1,
            alert_active,
            alert_triggered_at,
            run_length_map,
        };
        &self.status
    }

    pub fn snapshot(&self) -> BocpdSnapshot {
        BocpdSnapshot {
            expected_run_length: self.expected_run_length,
            max_run_length: self.max_run_length,
            alert_threshold: self.alert_threshold,
            urgent_threshold: self.urgent_threshold,
            hazard: self.hazard,
            prior_mu: self.prior.0,
            prior_kappa: self.prior.1,
            prior_alpha: self.prior.2,
            prior_beta: self.prior.3,
            run_probs: self.run_probs.clone(),
            mu: self.mu.clone(),
            kappa: self.kappa.clone(),
            alpha: self.alpha.clone(),
            beta: self.beta.clone(),
            state: Some(self.status.clone()),
        }
    }

    /// Restore from a snapshot. Array lengths are reconciled to the
    /// shortest; non-finite entries are dropped; the run-length posterior is
    /// renormalized; anything missing falls back to the prior.
    pub fn restore(&mut self, snapshot: &BocpdSnapshot) {
        if let Some(state) = &snapshot.state {
            self.status = BocpdStatus {
                change_prob: clamp(state.change_prob, 0.0, 1.0),
                run_length_mode: state.run_length_mode,
                run_length_mode_prob: clamp(state.run_length_mode_prob, 0.0, 1.0),
                last_update_ts: state.last_update_ts.max(0.0),
                observation_count: state.observation_count,
                alert_active: state.alert_active,
                alert_triggered_at: state.alert_triggered_at.max(0.0),
                run_length_map: state
                    .run_length_map
                    .iter()
                    .filter(|(_, p)| **p > 0.0)
                    .map(|(k, p)| (*k, *p))
                    .collect(),
            };
        }

        let finite = |raw: &[f64], default: &[f64]| -> Vec<f64> {
            let filtered: Vec<f64> = raw.iter().copied().filter(|v| v.is_finite()).collect();
            if filtered.is_empty() {
                default.to_vec()
            } else {
                filtered
            }
        };

        let mut run_probs = finite(&snapshot.run_probs, &[1.0]);
        let total: f64 = run_probs.iter().sum();
        let total = total.max(PROB_FLOOR);
        for p in &mut run_probs {
            *p /= total;
        }
        let n = run_probs.len();

        let mut mu = finite(&snapshot.mu, &vec![self.prior.0; n]);
        let mut kappa = finite(&snapshot.kappa, &vec![self.prior.1; n]);
        let mut alpha = finite(&snapshot.alpha, &vec![self.prior.2; n]);
        let mut beta = finite(&snapshot.beta, &vec![self.prior.3; n]);

        // Length parity safety.
        let n = n.min(mu.len()).min(kappa.len()).min(alpha.len()).min(beta.len());
        if n == 0 {
            self.run_probs = vec![1.0];
            self.mu = vec![self.prior.0];
            self.kappa = vec![self.prior.1];
            self.alpha = vec![self.prior.2];
            self.beta = vec![self.prior.3];
            return;
        }
        run_probs.truncate(n);
        mu.truncate(n);
        kappa.truncate(n);
        alpha.truncate(n);
        beta.truncate(n);

        self.run_probs = run_probs;
        self.mu = mu;
        self.kappa = kappa;
        self.alpha = alpha;
        self.beta = beta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn detector(expected: usize, max: usize, alert: f64, urgent: f64) -> BocpdDetector {
        BocpdDetector::new(&BocpdConfig {
            expected_run_length: expected,
            max_run_length: max,
            alert_threshold: alert,
            urgent_threshold: urgent,
            ..BocpdConfig::default()
        })
    }

    #[test]
    fn test_change_prob_stays_low_on_stationary_series() {
        let mut det = detector(120, 300, 0.30, 0.50);
        let mut probs = Vec::new();
        for i in 0..240 {
            let x = 0.03 * (i as f64 / 7.0).sin();
            probs.push(det.update(x, i as f64).change_prob);
        }
        let tail = &probs[probs.len() - 60..];
        let mean = tail.iter().sum::<f64>() / tail.len() as f64;
        assert!(mean < 0.15, "tail mean {} should stay below 0.15", mean);
    }

    #[test]
    fn test_detects_mean_shift_change_point() {
        let mut det = detector(100, 300, 0.15, 0.35);
        let mut probs = Vec::new();
        for i in 0..140 {
            probs.push(det.update(0.0, i as f64).change_prob);
        }
        for i in 140..260 {
            probs.push(det.update(1.5, i as f64).change_prob);
        }
        // Skip warmup: early steps carry high change_prob while mass still
        // sits on young run lengths.
        let before = probs[30..130].iter().copied().fold(f64::MIN, f64::max);
        let after = probs[140..200].iter().copied().fold(f64::MIN, f64::max);
        assert!(
            after > before + 0.05,
            "post-shift max {} should exceed pre-shift max {} by 0.05",
            after,
            before
        );
        assert!(after > 0.12);
    }

    #[test]
    fn test_alert_flag_latches_on_strong_shift() {
        let mut det = detector(80, 240, 0.05, 0.20);
        for i in 0..100 {
            det.update(0.0, i as f64);
        }
        let mut any_alert = false;
        let mut triggered_at = 0.0;
        for i in 100..140 {
            let status = det.update(2.0, i as f64);
            if status.alert_active {
                if !any_alert {
                    triggered_at = status.alert_triggered_at;
                }
                any_alert = true;
                // Latched timestamp does not move while the alert holds.
                assert_eq!(status.alert_triggered_at, triggered_at);
            }
        }
        assert!(any_alert);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut det = detector(90, 260, 0.20, 0.40);
        for i in 0..180 {
            let x = 0.02 * (i as f64 / 5.0).sin() + if i > 110 { 0.8 } else { 0.0 };
            det.update(x, i as f64);
        }
        let snap = det.snapshot();

        let mut restored = detector(90, 260, 0.20, 0.40);
        restored.restore(&snap);
        assert_eq!(
            restored.status.observation_count,
            det.status.observation_count
        );
        assert_eq!(restored.status.run_length_mode, det.status.run_length_mode);
        assert_relative_eq!(
            restored.status.change_prob,
            det.status.change_prob,
            epsilon = 1e-9
        );

        // Identical predictions after the round trip.
        let a = det.update(0.25, 1000.0).clone();
        let b = restored.update(0.25, 1000.0).clone();
        assert_relative_eq!(a.change_prob, b.change_prob, epsilon = 1e-9);
        assert_eq!(a.run_length_mode, b.run_length_mode);
    }

    #[test]
    fn test_restore_reconciles_ragged_arrays() {
        let mut det = detector(90, 260, 0.20, 0.40);
        for i in 0..50 {
            det.update(0.1, i as f64);
        }
        let mut snap = det.snapshot();
        snap.mu.truncate(10); // shorter than run_probs
        snap.kappa.push(f64::NAN); // dropped by the finite filter

        let mut restored = detector(90, 260, 0.20, 0.40);
        restored.restore(&snap);
        // Still usable: the next update runs on the reconciled arrays.
        let status = restored.update(0.1, 51.0);
        assert!(status.change_prob.is_finite());
    }

    #[test]
    fn test_reduce_observation_drops_non_finite() {
        assert_eq!(reduce_observation(&[]), 0.0);
        assert_eq!(reduce_observation(&[f64::NAN, f64::INFINITY]), 0.0);
        assert_relative_eq!(
            reduce_observation(&[1.0, 2.0, f64::NAN, 3.0]),
            2.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_run_probs_stay_normalized_and_truncated() {
        let mut det = detector(50, 20, 0.30, 0.50);
        for i in 0..200 {
            det.update((i % 7) as f64 * 0.01, i as f64);
        }
        let snap = det.snapshot();
        assert!(snap.run_probs.len() <= 21);
        let total: f64 = snap.run_probs.iter().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }
}
