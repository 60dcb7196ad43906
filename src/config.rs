//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable overrides for the most commonly tuned pair parameters.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pair: PairConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub bocpd: BocpdConfig,
    #[serde(default)]
    pub kelly: KellyConfig,
    #[serde(default)]
    pub throughput: ThroughputConfig,
    #[serde(default)]
    pub survival: SurvivalConfig,
}

impl Config {
    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override selected pair parameters from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("GRIDPAIR_ENTRY_PCT") {
            if let Ok(v) = raw.parse::<f64>() {
                self.pair.entry_pct = v;
            }
        }
        if let Ok(raw) = std::env::var("GRIDPAIR_PROFIT_PCT") {
            if let Ok(v) = raw.parse::<f64>() {
                self.pair.profit_pct = v;
            }
        }
        if let Ok(raw) = std::env::var("GRIDPAIR_ORDER_SIZE_USD") {
            if let Ok(v) = raw.parse::<f64>() {
                self.pair.order_size_usd = v;
            }
        }
        if let Ok(raw) = std::env::var("GRIDPAIR_LONG_ONLY") {
            let lowered = raw.trim().to_ascii_lowercase();
            self.pair.long_only = matches!(lowered.as_str(), "1" | "true" | "yes");
        }
    }
}

/// Pair state machine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    /// Distance from market for entries (%)
    #[serde(default = "default_entry_pct")]
    pub entry_pct: f64,

    /// Profit target from entry fill (%)
    #[serde(default = "default_profit_pct")]
    pub profit_pct: f64,

    /// Max entry drift before refresh (%)
    #[serde(default = "default_refresh_pct")]
    pub refresh_pct: f64,

    /// Dollar value per order
    #[serde(default = "default_order_size_usd")]
    pub order_size_usd: f64,

    /// Decimal places for price rounding
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,

    /// Decimal places for volume rounding
    #[serde(default = "default_volume_decimals")]
    pub volume_decimals: u32,

    /// Venue minimum order volume
    #[serde(default = "default_min_volume")]
    pub min_volume: f64,

    /// Maker fee per side (%)
    #[serde(default = "default_maker_fee_pct")]
    pub maker_fee_pct: f64,

    /// Max orphaned exits kept per pair
    #[serde(default = "default_max_recovery_slots")]
    pub max_recovery_slots: usize,

    /// Reprice a stale exit after median * this
    #[serde(default = "default_exit_reprice_mult")]
    pub exit_reprice_mult: f64,

    /// Orphan a stale exit after median * this
    #[serde(default = "default_exit_orphan_mult")]
    pub exit_orphan_mult: f64,

    /// Max exit spread (%) tolerated in S2 before break-glass
    #[serde(default = "default_s2_max_spread_pct")]
    pub s2_max_spread_pct: f64,

    /// Minimum seconds between reprices of the same leg
    #[serde(default = "default_reprice_cooldown_sec")]
    pub reprice_cooldown_sec: f64,

    /// Completed cycles required before timing thresholds activate
    #[serde(default = "default_min_cycles_for_timing")]
    pub min_cycles_for_timing: usize,

    /// Alpha in trend-based entry asymmetry
    #[serde(default = "default_directional_asymmetry")]
    pub directional_asymmetry: f64,

    /// Fallback orphan timeout when timings are unknown (sec)
    #[serde(default = "default_recovery_fallback_sec")]
    pub recovery_fallback_sec: f64,

    /// Fallback S2 timeout when timings are unknown (sec)
    #[serde(default = "default_s2_fallback_sec")]
    pub s2_fallback_sec: f64,

    /// Same-direction refreshes before the anti-chase cooldown engages
    #[serde(default = "default_max_consecutive_refreshes")]
    pub max_consecutive_refreshes: u32,

    /// Anti-chase cooldown length (sec)
    #[serde(default = "default_refresh_cooldown_sec")]
    pub refresh_cooldown_sec: f64,

    /// Breakeven margin used by reprice targets (fraction, 0.003 = 0.3%)
    #[serde(default = "default_fee_margin")]
    pub fee_margin: f64,

    /// Initial sizing multiplier for the next entry
    #[serde(default = "default_next_entry_multiplier")]
    pub next_entry_multiplier: f64,

    /// Widen entry distances after consecutive losses
    #[serde(default = "default_true")]
    pub entry_backoff_enabled: bool,

    /// Backoff growth per consecutive loss
    #[serde(default = "default_entry_backoff_factor")]
    pub entry_backoff_factor: f64,

    /// Cap on the backoff multiplier
    #[serde(default = "default_entry_backoff_max_multiplier")]
    pub entry_backoff_max_multiplier: f64,

    /// Cooldown after a break-glass action (sec)
    #[serde(default = "default_s2_cooldown_sec")]
    pub s2_cooldown_sec: f64,

    /// Max price age before S2 break-glass refuses to act (sec)
    #[serde(default = "default_price_staleness_limit")]
    pub price_staleness_limit: f64,

    /// Long-only mode: never place sell entries
    #[serde(default)]
    pub long_only: bool,
}

fn default_entry_pct() -> f64 {
    0.2
}
fn default_profit_pct() -> f64 {
    1.0
}
fn default_refresh_pct() -> f64 {
    1.0
}
fn default_order_size_usd() -> f64 {
    3.5
}
fn default_price_decimals() -> u32 {
    6
}
fn default_volume_decimals() -> u32 {
    0
}
fn default_min_volume() -> f64 {
    13.0
}
fn default_maker_fee_pct() -> f64 {
    0.25
}
fn default_max_recovery_slots() -> usize {
    2
}
fn default_exit_reprice_mult() -> f64 {
    1.5
}
fn default_exit_orphan_mult() -> f64 {
    5.0
}
fn default_s2_max_spread_pct() -> f64 {
    3.0
}
fn default_reprice_cooldown_sec() -> f64 {
    120.0
}
fn default_min_cycles_for_timing() -> usize {
    5
}
fn default_directional_asymmetry() -> f64 {
    0.5
}
fn default_recovery_fallback_sec() -> f64 {
    7200.0
}
fn default_s2_fallback_sec() -> f64 {
    600.0
}
fn default_max_consecutive_refreshes() -> u32 {
    3
}
fn default_refresh_cooldown_sec() -> f64 {
    300.0
}
fn default_fee_margin() -> f64 {
    0.003
}
fn default_next_entry_multiplier() -> f64 {
    1.0
}
fn default_entry_backoff_factor() -> f64 {
    0.5
}
fn default_entry_backoff_max_multiplier() -> f64 {
    5.0
}
fn default_s2_cooldown_sec() -> f64 {
    300.0
}
fn default_price_staleness_limit() -> f64 {
    90.0
}
fn default_true() -> bool {
    true
}

impl Default for PairConfig {
    fn default() -> Self {
        PairConfig {
            entry_pct: default_entry_pct(),
            profit_pct: default_profit_pct(),
            refresh_pct: default_refresh_pct(),
            order_size_usd: default_order_size_usd(),
            price_decimals: default_price_decimals(),
            volume_decimals: default_volume_decimals(),
            min_volume: default_min_volume(),
            maker_fee_pct: default_maker_fee_pct(),
            max_recovery_slots: default_max_recovery_slots(),
            exit_reprice_mult: default_exit_reprice_mult(),
            exit_orphan_mult: default_exit_orphan_mult(),
            s2_max_spread_pct: default_s2_max_spread_pct(),
            reprice_cooldown_sec: default_reprice_cooldown_sec(),
            min_cycles_for_timing: default_min_cycles_for_timing(),
            directional_asymmetry: default_directional_asymmetry(),
            recovery_fallback_sec: default_recovery_fallback_sec(),
            s2_fallback_sec: default_s2_fallback_sec(),
            max_consecutive_refreshes: default_max_consecutive_refreshes(),
            refresh_cooldown_sec: default_refresh_cooldown_sec(),
            fee_margin: default_fee_margin(),
            next_entry_multiplier: default_next_entry_multiplier(),
            entry_backoff_enabled: true,
            entry_backoff_factor: default_entry_backoff_factor(),
            entry_backoff_max_multiplier: default_entry_backoff_max_multiplier(),
            s2_cooldown_sec: default_s2_cooldown_sec(),
            price_staleness_limit: default_price_staleness_limit(),
            long_only: false,
        }
    }
}

/// Position ledger parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Max journal rows kept locally before trimming into watermarks (min 50)
    #[serde(default = "default_journal_local_limit")]
    pub journal_local_limit: usize,
}

fn default_journal_local_limit() -> usize {
    500
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            enabled: true,
            journal_local_limit: default_journal_local_limit(),
        }
    }
}

/// BOCPD detector parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BocpdConfig {
    /// 1 / hazard rate
    #[serde(default = "default_expected_run_length")]
    pub expected_run_length: usize,

    /// Run-length posterior truncation
    #[serde(default = "default_max_run_length")]
    pub max_run_length: usize,

    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,

    #[serde(default = "default_urgent_threshold")]
    pub urgent_threshold: f64,

    #[serde(default)]
    pub prior_mu: f64,

    #[serde(default = "default_one")]
    pub prior_kappa: f64,

    #[serde(default = "default_one")]
    pub prior_alpha: f64,

    #[serde(default = "default_one")]
    pub prior_beta: f64,
}

fn default_expected_run_length() -> usize {
    200
}
fn default_max_run_length() -> usize {
    500
}
fn default_alert_threshold() -> f64 {
    0.30
}
fn default_urgent_threshold() -> f64 {
    0.50
}
fn default_one() -> f64 {
    1.0
}

impl Default for BocpdConfig {
    fn default() -> Self {
        BocpdConfig {
            expected_run_length: default_expected_run_length(),
            max_run_length: default_max_run_length(),
            alert_threshold: default_alert_threshold(),
            urgent_threshold: default_urgent_threshold(),
            prior_mu: 0.0,
            prior_kappa: 1.0,
            prior_alpha: 1.0,
            prior_beta: 1.0,
        }
    }
}

/// Kelly sizer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyConfig {
    /// Fraction of full Kelly to apply (0.25 = quarter-Kelly)
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,

    /// Cycles required before Kelly activates at all
    #[serde(default = "default_min_samples_total")]
    pub min_samples_total: usize,

    /// Per-regime minimum; below this the regime falls back to aggregate
    #[serde(default = "default_min_samples_per_regime")]
    pub min_samples_per_regime: usize,

    /// Rolling window of most recent cycles considered
    #[serde(default = "default_lookback_cycles")]
    pub lookback_cycles: usize,

    /// Never size below this multiple of base
    #[serde(default = "default_kelly_floor_mult")]
    pub kelly_floor_mult: f64,

    /// Never size above this multiple of base
    #[serde(default = "default_kelly_ceiling_mult")]
    pub kelly_ceiling_mult: f64,

    /// Multiplier applied when Kelly reports no edge (shrink, don't stop)
    #[serde(default = "default_negative_edge_mult")]
    pub negative_edge_mult: f64,

    #[serde(default = "default_true")]
    pub use_recency_weighting: bool,

    /// Halflife (in recency rank) of the exponential cycle weights
    #[serde(default = "default_recency_halflife_cycles")]
    pub recency_halflife_cycles: usize,

    #[serde(default = "default_true")]
    pub log_updates: bool,
}

fn default_kelly_fraction() -> f64 {
    0.25
}
fn default_min_samples_total() -> usize {
    30
}
fn default_min_samples_per_regime() -> usize {
    15
}
fn default_lookback_cycles() -> usize {
    500
}
fn default_kelly_floor_mult() -> f64 {
    0.5
}
fn default_kelly_ceiling_mult() -> f64 {
    2.0
}
fn default_negative_edge_mult() -> f64 {
    0.5
}
fn default_recency_halflife_cycles() -> usize {
    100
}

impl Default for KellyConfig {
    fn default() -> Self {
        KellyConfig {
            kelly_fraction: default_kelly_fraction(),
            min_samples_total: default_min_samples_total(),
            min_samples_per_regime: default_min_samples_per_regime(),
            lookback_cycles: default_lookback_cycles(),
            kelly_floor_mult: default_kelly_floor_mult(),
            kelly_ceiling_mult: default_kelly_ceiling_mult(),
            negative_edge_mult: default_negative_edge_mult(),
            use_recency_weighting: true,
            recency_halflife_cycles: default_recency_halflife_cycles(),
            log_updates: true,
        }
    }
}

/// Fill-time throughput sizer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_lookback_cycles")]
    pub lookback_cycles: usize,

    #[serde(default = "default_tp_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_tp_min_samples_per_bucket")]
    pub min_samples_per_bucket: usize,

    /// Completed samples at which the confidence blend reaches 1.0
    #[serde(default = "default_full_confidence_samples")]
    pub full_confidence_samples: usize,

    #[serde(default = "default_kelly_floor_mult")]
    pub floor_mult: f64,

    #[serde(default = "default_kelly_ceiling_mult")]
    pub ceiling_mult: f64,

    /// Weight of censored open-exit observations in the percentile set
    #[serde(default = "default_censored_weight")]
    pub censored_weight: f64,

    /// Age pressure engages when the p90 open-exit age exceeds p75 * this
    #[serde(default = "default_age_pressure_trigger")]
    pub age_pressure_trigger: f64,

    #[serde(default = "default_age_pressure_sensitivity")]
    pub age_pressure_sensitivity: f64,

    #[serde(default = "default_age_pressure_floor")]
    pub age_pressure_floor: f64,

    /// Utilization penalty engages above this locked/(locked+free) ratio
    #[serde(default = "default_util_threshold")]
    pub util_threshold: f64,

    #[serde(default = "default_util_sensitivity")]
    pub util_sensitivity: f64,

    #[serde(default = "default_util_floor")]
    pub util_floor: f64,

    /// Halflife (in recency rank) of the exponential fill-time weights
    #[serde(default = "default_recency_halflife_cycles")]
    pub recency_halflife: usize,

    #[serde(default = "default_true")]
    pub log_updates: bool,
}

fn default_tp_min_samples() -> usize {
    20
}
fn default_tp_min_samples_per_bucket() -> usize {
    10
}
fn default_full_confidence_samples() -> usize {
    50
}
fn default_censored_weight() -> f64 {
    0.5
}
fn default_age_pressure_trigger() -> f64 {
    1.5
}
fn default_age_pressure_sensitivity() -> f64 {
    0.5
}
fn default_age_pressure_floor() -> f64 {
    0.3
}
fn default_util_threshold() -> f64 {
    0.7
}
fn default_util_sensitivity() -> f64 {
    0.8
}
fn default_util_floor() -> f64 {
    0.4
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        ThroughputConfig {
            enabled: false,
            lookback_cycles: default_lookback_cycles(),
            min_samples: default_tp_min_samples(),
            min_samples_per_bucket: default_tp_min_samples_per_bucket(),
            full_confidence_samples: default_full_confidence_samples(),
            floor_mult: default_kelly_floor_mult(),
            ceiling_mult: default_kelly_ceiling_mult(),
            censored_weight: default_censored_weight(),
            age_pressure_trigger: default_age_pressure_trigger(),
            age_pressure_sensitivity: default_age_pressure_sensitivity(),
            age_pressure_floor: default_age_pressure_floor(),
            util_threshold: default_util_threshold(),
            util_sensitivity: default_util_sensitivity(),
            util_floor: default_util_floor(),
            recency_halflife: default_recency_halflife_cycles(),
            log_updates: true,
        }
    }
}

/// Survival model parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurvivalConfig {
    /// Real observations required before the model reports fitted
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,

    /// Weighted observations at which stratum confidence reaches 1.0
    #[serde(default = "default_min_per_stratum")]
    pub min_per_stratum: usize,

    /// Weight assigned to synthetic stabilizer observations
    #[serde(default = "default_synthetic_weight")]
    pub synthetic_weight: f64,

    /// Prediction horizons in seconds
    #[serde(default = "default_horizons")]
    pub horizons: Vec<u32>,

    /// "kaplan_meier" or "cox"
    #[serde(default = "default_model_tier")]
    pub model_tier: String,
}

fn default_min_observations() -> usize {
    50
}
fn default_min_per_stratum() -> usize {
    10
}
fn default_synthetic_weight() -> f64 {
    0.3
}
fn default_horizons() -> Vec<u32> {
    vec![1800, 3600, 14400]
}
fn default_model_tier() -> String {
    "kaplan_meier".to_string()
}

impl Default for SurvivalConfig {
    fn default() -> Self {
        SurvivalConfig {
            min_observations: default_min_observations(),
            min_per_stratum: default_min_per_stratum(),
            synthetic_weight: default_synthetic_weight(),
            horizons: default_horizons(),
            model_tier: default_model_tier(),
        }
    }
}
