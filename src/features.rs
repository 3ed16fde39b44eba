//! Feature Extraction
//!
//! Turns already-collected history (price series, recent redemption statuses,
//! attestation latencies) into the named features the model backends consume.
//! No I/O happens here. Inputs with no history come back as
//! [`FeatureOutcome::Empty`] and the caller chooses the prior explicitly.

use crate::models::{probability_from_ppm, RedemptionContext, TOKEN};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use std::f64::consts::PI;

/// ~1 hour of 1.8s blocks.
pub const WINDOW_1H: usize = 2_000;
/// ~24 hours of 1.8s blocks.
pub const WINDOW_24H: usize = 48_000;
/// Trailing returns used for "current" volatility.
pub const CURRENT_WINDOW: usize = 100;
/// Recent redemptions considered for the success rate.
pub const SUCCESS_WINDOW: usize = 100;

/// Success-rate prior when there is no redemption history.
pub const DEFAULT_SUCCESS_RATE: f64 = 1.0;

/// Latency priors (seconds) when no attestations have been observed.
pub const DEFAULT_LATENCY: LatencyStats = LatencyStats {
    mean: 180.0,
    p95: 300.0,
    p99: 360.0,
    std: 0.0,
};

/// Explicit result tag for a feature computed from history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureOutcome<T> {
    Ready(T),
    /// No history to compute from.
    Empty,
}

impl<T> FeatureOutcome<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn unwrap_or(self, default: T) -> T {
        match self {
            Self::Ready(v) => v,
            Self::Empty => default,
        }
    }
}

// =============================================================================
// FEATURE VECTOR
// =============================================================================

/// Named features, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Values in `names` order; absent features become NaN.
    pub fn to_dense(&self, names: &[String]) -> Vec<f64> {
        names
            .iter()
            .map(|n| self.get(n).unwrap_or(f64::NAN))
            .collect()
    }
}

// =============================================================================
// EXTRACTORS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolatilityStats {
    pub short: f64,
    pub long: f64,
    pub current: f64,
}

/// Sample standard deviation; 0 for fewer than two values.
fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        0.0
    } else {
        values.iter().std_dev()
    }
}

fn tail(values: &[f64], n: usize) -> &[f64] {
    &values[values.len().saturating_sub(n)..]
}

/// Std-dev of simple returns over trailing windows. A window with fewer
/// returns than its length reports 0.
pub fn volatility_stats(prices: &[f64], window_short: usize, window_long: usize) -> VolatilityStats {
    let returns: Vec<f64> = prices
        .windows(2)
        .map(|w| w[1] / w[0] - 1.0)
        .filter(|r| r.is_finite())
        .collect();

    let windowed = |window: usize| {
        if window > 0 && returns.len() >= window {
            sample_std(tail(&returns, window))
        } else {
            0.0
        }
    };

    VolatilityStats {
        short: windowed(window_short),
        long: windowed(window_long),
        current: windowed(CURRENT_WINDOW),
    }
}

/// Status of a historical redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    Completed,
    Failed,
    Pending,
}

/// Fraction of `Completed` among the last `window` redemptions.
pub fn recent_success_rate(statuses: &[RedemptionStatus], window: usize) -> FeatureOutcome<f64> {
    let recent = &statuses[statuses.len().saturating_sub(window)..];
    if recent.is_empty() {
        return FeatureOutcome::Empty;
    }
    let completed = recent
        .iter()
        .filter(|s| **s == RedemptionStatus::Completed)
        .count();
    FeatureOutcome::Ready(completed as f64 / recent.len() as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub mean: f64,
    pub p95: f64,
    pub p99: f64,
    pub std: f64,
}

fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    let idx = ((sorted.len() as f64 * p).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Attestation latency summary in seconds. Non-finite samples are ignored.
pub fn attestation_latency_stats(latencies_secs: &[f64]) -> FeatureOutcome<LatencyStats> {
    let mut sorted: Vec<f64> = latencies_secs
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    if sorted.is_empty() {
        return FeatureOutcome::Empty;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    FeatureOutcome::Ready(LatencyStats {
        mean: sorted.iter().mean(),
        p95: nearest_rank(&sorted, 0.95),
        p99: nearest_rank(&sorted, 0.99),
        std: sample_std(&sorted),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeFeatures {
    pub hour: u32,
    pub hour_sin: f64,
    pub hour_cos: f64,
    /// Monday = 0.
    pub day_of_week: u32,
    pub day_sin: f64,
    pub day_cos: f64,
    pub is_weekend: bool,
}

pub fn time_features(timestamp: DateTime<Utc>) -> TimeFeatures {
    let hour = timestamp.hour();
    let day = timestamp.weekday().num_days_from_monday();
    let hour_angle = 2.0 * PI * hour as f64 / 24.0;
    let day_angle = 2.0 * PI * day as f64 / 7.0;
    TimeFeatures {
        hour,
        hour_sin: hour_angle.sin(),
        hour_cos: hour_angle.cos(),
        day_of_week: day,
        day_sin: day_angle.sin(),
        day_cos: day_angle.cos(),
        is_weekend: day >= 5,
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Whole tokens as f64, exact for integral token counts.
fn tokens(amount: u128) -> f64 {
    (amount / TOKEN) as f64 + (amount % TOKEN) as f64 / TOKEN as f64
}

/// Assembles a [`FeatureVector`] from a redemption context plus history.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    vector: FeatureVector,
}

impl FeatureBuilder {
    pub fn from_context(context: &RedemptionContext) -> Self {
        let mut vector = FeatureVector::new();
        vector.insert("price_volatility", probability_from_ppm(context.price_volatility));
        vector.insert("redemption_amount", tokens(context.amount));
        vector.insert(
            "agent_success_rate",
            probability_from_ppm(context.agent_success_rate),
        );
        vector.insert("agent_stake", tokens(context.agent_stake));
        vector.insert("hour_of_day", context.hour_of_day as f64);
        Self { vector }
    }

    pub fn with_prices(mut self, prices: &[f64]) -> Self {
        let vol = volatility_stats(prices, WINDOW_1H, WINDOW_24H);
        self.vector.insert("volatility_1h", vol.short);
        self.vector.insert("volatility_24h", vol.long);
        self.vector.insert("volatility_current", vol.current);
        self
    }

    pub fn with_redemptions(mut self, statuses: &[RedemptionStatus]) -> Self {
        let rate = recent_success_rate(statuses, SUCCESS_WINDOW).unwrap_or(DEFAULT_SUCCESS_RATE);
        self.vector.insert("redemption_success_rate", rate);
        self
    }

    pub fn with_attestation_latencies(mut self, latencies_secs: &[f64]) -> Self {
        let stats = attestation_latency_stats(latencies_secs).unwrap_or(DEFAULT_LATENCY);
        self.vector.insert("latency_mean", stats.mean);
        self.vector.insert("latency_p95", stats.p95);
        self.vector.insert("latency_p99", stats.p99);
        self.vector.insert("latency_std", stats.std);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        let t = time_features(timestamp);
        self.vector.insert("hour", t.hour as f64);
        self.vector.insert("hour_sin", t.hour_sin);
        self.vector.insert("hour_cos", t.hour_cos);
        self.vector.insert("day_of_week", t.day_of_week as f64);
        self.vector.insert("day_sin", t.day_sin);
        self.vector.insert("day_cos", t.day_cos);
        self.vector.insert("is_weekend", if t.is_weekend { 1.0 } else { 0.0 });
        self
    }

    pub fn build(self) -> FeatureVector {
        self.vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_volatility_windows() {
        let flat = vec![100.0; 50];
        let v = volatility_stats(&flat, 10, 100);
        assert_eq!(v.short, 0.0);
        assert_eq!(v.long, 0.0);
        assert_eq!(v.current, 0.0);

        // Alternating ±1% moves.
        let prices: Vec<f64> = (0..21).map(|i| if i % 2 == 0 { 100.0 } else { 101.0 }).collect();
        let v = volatility_stats(&prices, 10, 30);
        assert!(v.short > 0.0);
        assert_eq!(v.long, 0.0);
    }

    #[test]
    fn test_success_rate_window() {
        use RedemptionStatus::*;
        assert!(recent_success_rate(&[], 10).is_empty());
        let statuses = [Failed, Failed, Completed, Completed, Pending, Completed];
        assert_eq!(recent_success_rate(&statuses, 4), FeatureOutcome::Ready(0.75));
        assert_eq!(recent_success_rate(&statuses, 100), FeatureOutcome::Ready(0.5));
    }

    #[test]
    fn test_latency_stats() {
        assert!(attestation_latency_stats(&[]).is_empty());
        let latencies: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        match attestation_latency_stats(&latencies) {
            FeatureOutcome::Ready(s) => {
                assert!((s.mean - 50.5).abs() < 1e-12);
                assert_eq!(s.p95, 96.0);
                assert_eq!(s.p99, 100.0);
                assert!(s.std > 0.0);
            }
            FeatureOutcome::Empty => panic!("expected stats"),
        }
    }

    #[test]
    fn test_time_features() {
        // 2025-01-04 is a Saturday.
        let ts = Utc.with_ymd_and_hms(2025, 1, 4, 6, 30, 0).unwrap();
        let t = time_features(ts);
        assert_eq!(t.hour, 6);
        assert_eq!(t.day_of_week, 5);
        assert!(t.is_weekend);
        assert!((t.hour_sin - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_builder_applies_priors() {
        let ctx = RedemptionContext::new(10_000, 100 * TOKEN, 990_000, 200_000 * TOKEN, 10).unwrap();
        let fv = FeatureBuilder::from_context(&ctx)
            .with_redemptions(&[])
            .with_attestation_latencies(&[])
            .build();
        assert_eq!(fv.get("price_volatility"), Some(0.01));
        assert_eq!(fv.get("redemption_amount"), Some(100.0));
        assert_eq!(fv.get("redemption_success_rate"), Some(1.0));
        assert_eq!(fv.get("latency_p99"), Some(360.0));

        let dense = fv.to_dense(&["agent_stake".to_string(), "missing".to_string()]);
        assert_eq!(dense[0], 200_000.0);
        assert!(dense[1].is_nan());
    }
}
