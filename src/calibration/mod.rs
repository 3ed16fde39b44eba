//! Conformal Calibration
//!
//! Split-conformal intervals around a probability predictor. Nonconformity is
//! the absolute error `|p - y|`; the threshold `q` is an empirical
//! `(1 - alpha)` quantile of those scores, and any new prediction `p` maps to
//! `[max(0, p - q), min(1, p + q)]`.
//!
//! Coverage measured on the set the threshold was fitted on is optimistic.
//! Every [`CoverageReport`] carries a [`CoverageKind`] so an in-sample number
//! can never be mistaken for the held-out figure that gates deployment.

pub mod cross_validation;
pub mod gate;

pub use cross_validation::{cross_validate_held_out, cross_validate_in_sample, CrossValidatedCoverage};
pub use gate::{CalibrationGate, CalibrationGateConfig, GateVerdict};

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, info};

/// Default miscoverage rate (99.7% target).
pub const DEFAULT_ALPHA: f64 = 0.003;

/// Default coverage target.
pub const DEFAULT_TARGET_COVERAGE: f64 = 0.997;

/// How the empirical quantile is read off the sorted scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantileMethod {
    /// Linear interpolation at position `(n - 1)(1 - alpha)`.
    #[default]
    Linear,
    /// Order statistic `ceil((n + 1)(1 - alpha))`, clamped to `n`.
    FiniteSample,
}

/// Where a coverage figure was measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageKind {
    /// Intervals supplied by the caller; provenance unknown.
    #[default]
    Unlabeled,
    /// Evaluated on the same rows the threshold was fitted on.
    InSample,
    /// Evaluated on rows excluded from fitting.
    HeldOut,
}

impl std::fmt::Display for CoverageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlabeled => write!(f, "unlabeled"),
            Self::InSample => write!(f, "in-sample"),
            Self::HeldOut => write!(f, "held-out"),
        }
    }
}

// =============================================================================
// VALIDATION HELPERS
// =============================================================================

pub(crate) fn check_alpha(alpha: f64) -> EngineResult<()> {
    if !alpha.is_finite() || alpha <= 0.0 || alpha >= 1.0 {
        return Err(EngineError::validation("alpha", alpha, "must be in (0, 1)"));
    }
    Ok(())
}

pub(crate) fn check_probability(field: &str, index: usize, p: f64) -> EngineResult<()> {
    if !p.is_finite() || !(0.0..=1.0).contains(&p) {
        return Err(EngineError::validation(
            format!("{}[{}]", field, index),
            p,
            "must be a finite probability in [0, 1]",
        ));
    }
    Ok(())
}

pub(crate) fn check_lengths(field: &str, got: usize, expected: usize) -> EngineResult<()> {
    if got != expected {
        return Err(EngineError::validation(
            field,
            got,
            format!("length must match {} predictions", expected),
        ));
    }
    Ok(())
}

fn indicator(actual: bool) -> f64 {
    if actual {
        1.0
    } else {
        0.0
    }
}

/// Empirical `(1 - alpha)` quantile of `scores`. `scores` must be non-empty.
fn quantile(scores: &mut [f64], alpha: f64, method: QuantileMethod) -> f64 {
    scores.sort_by(|a, b| a.total_cmp(b));
    let n = scores.len();
    match method {
        QuantileMethod::Linear => {
            let pos = (n - 1) as f64 * (1.0 - alpha);
            let lo = pos.floor() as usize;
            let hi = (pos.ceil() as usize).min(n - 1);
            let frac = pos - lo as f64;
            scores[lo] + (scores[hi] - scores[lo]) * frac
        }
        QuantileMethod::FiniteSample => {
            let rank = ((n + 1) as f64 * (1.0 - alpha)).ceil() as usize;
            scores[rank.clamp(1, n) - 1]
        }
    }
}

// =============================================================================
// CALIBRATION MODEL
// =============================================================================

/// A fitted conformal threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationModel {
    pub quantile_threshold: f64,
    pub alpha: f64,
    pub n_calibration: usize,
    #[serde(default)]
    pub method: QuantileMethod,
}

impl CalibrationModel {
    /// Interval for one prediction, clipped to `[0, 1]`.
    pub fn apply(&self, prediction: f64) -> EngineResult<(f64, f64)> {
        check_probability("prediction", 0, prediction)?;
        Ok(self.interval(prediction))
    }

    pub fn apply_batch(&self, predictions: &[f64]) -> EngineResult<(Vec<f64>, Vec<f64>)> {
        let mut lower = Vec::with_capacity(predictions.len());
        let mut upper = Vec::with_capacity(predictions.len());
        for (i, &p) in predictions.iter().enumerate() {
            check_probability("predictions", i, p)?;
            let (lo, hi) = self.interval(p);
            lower.push(lo);
            upper.push(hi);
        }
        Ok((lower, upper))
    }

    fn interval(&self, p: f64) -> (f64, f64) {
        let q = self.quantile_threshold;
        ((p - q).max(0.0), (p + q).min(1.0))
    }
}

// =============================================================================
// CALIBRATOR
// =============================================================================

/// Fits [`CalibrationModel`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConformalCalibrator {
    method: QuantileMethod,
}

impl ConformalCalibrator {
    pub fn new(method: QuantileMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> QuantileMethod {
        self.method
    }

    /// Fit the conformal threshold on a calibration set.
    pub fn fit(
        &self,
        predictions: &[f64],
        actuals: &[bool],
        alpha: f64,
    ) -> EngineResult<CalibrationModel> {
        check_alpha(alpha)?;
        check_lengths("calibration_actuals", actuals.len(), predictions.len())?;
        if predictions.is_empty() {
            return Err(EngineError::InsufficientData(
                "empty calibration set, quantile is undefined".to_string(),
            ));
        }

        let mut scores = Vec::with_capacity(predictions.len());
        for (i, (&p, &y)) in predictions.iter().zip(actuals).enumerate() {
            check_probability("calibration_predictions", i, p)?;
            scores.push((p - indicator(y)).abs());
        }

        let quantile_threshold = quantile(&mut scores, alpha, self.method);
        info!(
            n = predictions.len(),
            alpha,
            method = ?self.method,
            quantile_threshold,
            "Fitted conformal threshold"
        );

        Ok(CalibrationModel {
            quantile_threshold,
            alpha,
            n_calibration: predictions.len(),
            method: self.method,
        })
    }

    /// Fit and report coverage on the same rows (diagnostic only).
    pub fn fit_and_evaluate(
        &self,
        predictions: &[f64],
        actuals: &[bool],
        alpha: f64,
        target: f64,
    ) -> EngineResult<(CalibrationModel, CoverageReport)> {
        let model = self.fit(predictions, actuals, alpha)?;
        let (lower, upper) = model.apply_batch(predictions)?;
        let report =
            validate_coverage(&lower, &upper, actuals, target)?.labeled(CoverageKind::InSample);
        Ok((model, report))
    }
}

// =============================================================================
// COVERAGE
// =============================================================================

/// Empirical interval coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub kind: CoverageKind,
    pub n: usize,
    pub covered: usize,
    pub coverage: f64,
    pub target: f64,
    pub meets_target: bool,
    pub mean_width: f64,
    pub width_std: f64,
}

impl CoverageReport {
    /// No-data report: zero coverage, never meets target.
    pub fn empty(target: f64) -> Self {
        Self {
            kind: CoverageKind::Unlabeled,
            n: 0,
            covered: 0,
            coverage: 0.0,
            target,
            meets_target: false,
            mean_width: 0.0,
            width_std: 0.0,
        }
    }

    pub fn labeled(mut self, kind: CoverageKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Fraction of rows whose outcome falls inside its interval.
pub fn validate_coverage(
    lower: &[f64],
    upper: &[f64],
    actuals: &[bool],
    target: f64,
) -> EngineResult<CoverageReport> {
    check_lengths("upper", upper.len(), lower.len())?;
    check_lengths("actuals", actuals.len(), lower.len())?;
    if !target.is_finite() || !(0.0..=1.0).contains(&target) {
        return Err(EngineError::validation("target", target, "must be in [0, 1]"));
    }
    if lower.is_empty() {
        return Ok(CoverageReport::empty(target));
    }

    let mut covered = 0usize;
    let mut widths = Vec::with_capacity(lower.len());
    for (i, ((&lo, &hi), &y)) in lower.iter().zip(upper).zip(actuals).enumerate() {
        if lo > hi {
            return Err(EngineError::validation(
                format!("interval[{}]", i),
                format!("[{}, {}]", lo, hi),
                "lower bound exceeds upper bound",
            ));
        }
        let y = indicator(y);
        if lo <= y && y <= hi {
            covered += 1;
        }
        widths.push(hi - lo);
    }

    let n = lower.len();
    let coverage = covered as f64 / n as f64;
    let mean_width = widths.iter().mean();
    let width_std = widths.iter().population_std_dev();

    debug!(n, covered, coverage, target, "Coverage evaluated");

    Ok(CoverageReport {
        kind: CoverageKind::Unlabeled,
        n,
        covered,
        coverage,
        target,
        meets_target: coverage >= target,
        mean_width,
        width_std,
    })
}
