//! Backtest Harness
//!
//! Replays historical predictions through the [`DecisionPolicy`] and scores
//! the decisions against attested outcomes. Rows are joined on
//! `redemption_id`; predictions without an outcome are dropped.
//!
//! The harness is pure: identical inputs produce identical metrics, and the
//! only randomness (fold assignment) is seeded.

pub mod metrics;
pub mod validation;

pub use metrics::{BacktestMetrics, OutcomeCounts};
pub use validation::{CrossValidationReport, HoldoutSplit, OutOfSampleReport};

use crate::calibration::check_probability;
use crate::error::{EngineError, EngineResult};
use crate::folds::DEFAULT_SEED;
use crate::models::{
    ppm_floor_from_probability, ppm_from_probability, Decision, OutcomeRecord, PredictionRecord,
};
use crate::policy::DecisionPolicy;
use std::collections::HashMap;
use tracing::{debug, info};

/// Default accuracy floor for `meets_target`.
pub const DEFAULT_TARGET_ACCURACY: f64 = 0.997;

/// Default train share for the positional holdout split.
pub const DEFAULT_TRAIN_FRACTION: f64 = 0.7;

/// A prediction paired with its outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinedRow<'a> {
    pub prediction: &'a PredictionRecord,
    pub success: bool,
}

/// Result of the prediction/outcome join.
#[derive(Debug, Clone)]
pub struct JoinedDataset<'a> {
    pub rows: Vec<JoinedRow<'a>>,
    /// Predictions with no matching outcome.
    pub dropped: usize,
}

/// Inner join on `redemption_id`, keeping prediction order. A repeated
/// outcome id keeps its first outcome.
pub fn join<'a>(
    predictions: &'a [PredictionRecord],
    actuals: &[OutcomeRecord],
) -> JoinedDataset<'a> {
    let mut outcomes: HashMap<&str, bool> = HashMap::with_capacity(actuals.len());
    for outcome in actuals {
        outcomes
            .entry(outcome.redemption_id.as_str())
            .or_insert(outcome.success);
    }

    let mut rows = Vec::with_capacity(predictions.len());
    let mut dropped = 0usize;
    for prediction in predictions {
        match outcomes.get(prediction.redemption_id.as_str()) {
            Some(&success) => rows.push(JoinedRow {
                prediction,
                success,
            }),
            None => {
                debug!(redemption_id = %prediction.redemption_id, "No outcome, dropping prediction");
                dropped += 1;
            }
        }
    }
    JoinedDataset { rows, dropped }
}

/// Replays predictions through the decision policy.
#[derive(Debug, Clone, Copy)]
pub struct BacktestHarness {
    policy: DecisionPolicy,
    target_accuracy: f64,
    seed: u64,
    train_fraction: f64,
}

impl Default for BacktestHarness {
    fn default() -> Self {
        Self {
            policy: DecisionPolicy::default(),
            target_accuracy: DEFAULT_TARGET_ACCURACY,
            seed: DEFAULT_SEED,
            train_fraction: DEFAULT_TRAIN_FRACTION,
        }
    }
}

impl BacktestHarness {
    pub fn new(policy: DecisionPolicy, target_accuracy: f64) -> EngineResult<Self> {
        if !target_accuracy.is_finite() || !(0.0..=1.0).contains(&target_accuracy) {
            return Err(EngineError::validation(
                "target_accuracy",
                target_accuracy,
                "must be in [0, 1]",
            ));
        }
        Ok(Self {
            policy,
            target_accuracy,
            ..Self::default()
        })
    }

    /// Seed for cross-validation fold assignment.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Train share of the positional holdout split, in `(0, 1)`.
    pub fn with_train_fraction(mut self, fraction: f64) -> EngineResult<Self> {
        if !fraction.is_finite() || fraction <= 0.0 || fraction >= 1.0 {
            return Err(EngineError::validation(
                "holdout_train_fraction",
                fraction,
                "must be in (0, 1)",
            ));
        }
        self.train_fraction = fraction;
        Ok(self)
    }

    pub fn target_accuracy(&self) -> f64 {
        self.target_accuracy
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn train_fraction(&self) -> f64 {
        self.train_fraction
    }

    /// Policy decision for one historical prediction (model path).
    pub fn decide(&self, prediction: &PredictionRecord) -> EngineResult<Decision> {
        let id = &prediction.redemption_id;
        for (field, value) in [
            ("probability", prediction.probability),
            ("confidence_lower", prediction.confidence_lower),
            ("confidence_upper", prediction.confidence_upper),
        ] {
            check_probability(field, 0, value).map_err(|_| {
                EngineError::validation(
                    format!("{}[{}]", field, id),
                    value,
                    "must be a finite probability in [0, 1]",
                )
            })?;
        }
        if prediction.confidence_lower > prediction.confidence_upper {
            return Err(EngineError::validation(
                format!("confidence_band[{}]", id),
                format!(
                    "[{}, {}]",
                    prediction.confidence_lower, prediction.confidence_upper
                ),
                "lower bound exceeds upper bound",
            ));
        }

        Ok(self.policy.decide(
            ppm_from_probability(prediction.probability),
            ppm_floor_from_probability(prediction.confidence_lower),
            ppm_from_probability(prediction.confidence_upper),
            None,
        ))
    }

    /// Backtest predictions against outcomes.
    pub fn backtest(
        &self,
        predictions: &[PredictionRecord],
        actuals: &[OutcomeRecord],
    ) -> EngineResult<BacktestMetrics> {
        let joined = join(predictions, actuals);
        if joined.dropped > 0 {
            debug!(
                dropped = joined.dropped,
                joined = joined.rows.len(),
                "Unmatched predictions dropped"
            );
        }
        let metrics = self.evaluate_rows(&joined.rows)?;
        info!(
            total = metrics.counts.total,
            tp = metrics.counts.true_positive,
            fp = metrics.counts.false_positive,
            fn_ = metrics.counts.false_negative,
            accuracy = metrics.accuracy,
            meets_target = metrics.meets_target,
            "Backtest complete"
        );
        Ok(metrics)
    }

    pub(crate) fn evaluate_rows(&self, rows: &[JoinedRow<'_>]) -> EngineResult<BacktestMetrics> {
        let mut counts = OutcomeCounts::default();
        for row in rows {
            counts.record(self.decide(row.prediction)?, row.success);
        }
        Ok(BacktestMetrics::from_counts(counts, self.target_accuracy))
    }
}
