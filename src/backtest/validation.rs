//! Cross-validation and out-of-sample evaluation for the backtest harness.

use super::{join, BacktestHarness, BacktestMetrics, JoinedRow};
use crate::error::EngineResult;
use crate::folds::KFold;
use crate::models::{OutcomeRecord, PredictionRecord};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{info, warn};

/// K-fold backtest report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationReport {
    pub n_splits: usize,
    pub seed: u64,
    pub folds: Vec<BacktestMetrics>,
    pub mean_accuracy: f64,
    pub std_accuracy: f64,
    pub mean_precision: f64,
    pub mean_recall: f64,
    pub mean_f1: f64,
    pub mean_insurance_utilization: f64,
}

/// How the evaluation rows were selected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum HoldoutSplit {
    /// Records strictly after the cutoff.
    Cutoff { cutoff: DateTime<Utc> },
    /// Tail of each sequence after the train share.
    Positional { train_fraction: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutOfSampleReport {
    pub split: HoldoutSplit,
    pub test_predictions: usize,
    pub test_outcomes: usize,
    pub metrics: BacktestMetrics,
}

fn mean_of(folds: &[BacktestMetrics], f: impl Fn(&BacktestMetrics) -> f64) -> f64 {
    folds.iter().map(f).mean()
}

impl BacktestHarness {
    /// K-fold backtest over the joined rows.
    pub fn cross_validate(
        &self,
        predictions: &[PredictionRecord],
        actuals: &[OutcomeRecord],
        n_splits: usize,
    ) -> EngineResult<CrossValidationReport> {
        let kfold = KFold::new(n_splits, self.seed)?;
        let joined = join(predictions, actuals);
        let splits = kfold.split(joined.rows.len())?;

        let folds = splits
            .par_iter()
            .map(|fold| {
                let rows: Vec<JoinedRow<'_>> =
                    fold.test.iter().map(|&i| joined.rows[i]).collect();
                self.evaluate_rows(&rows)
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let report = CrossValidationReport {
            n_splits,
            seed: self.seed,
            mean_accuracy: mean_of(&folds, |m| m.accuracy),
            std_accuracy: folds.iter().map(|m| m.accuracy).population_std_dev(),
            mean_precision: mean_of(&folds, |m| m.precision),
            mean_recall: mean_of(&folds, |m| m.recall),
            mean_f1: mean_of(&folds, |m| m.f1),
            mean_insurance_utilization: mean_of(&folds, |m| m.insurance_utilization),
            folds,
        };
        info!(
            n_splits,
            rows = joined.rows.len(),
            mean_accuracy = report.mean_accuracy,
            std_accuracy = report.std_accuracy,
            "Backtest cross-validation complete"
        );
        Ok(report)
    }

    /// Evaluate only on records after `cutoff`.
    ///
    /// The cutoff applies when every prediction carries a timestamp. Otherwise
    /// each sequence is split positionally at the configured train share and
    /// only the tail is evaluated.
    pub fn out_of_sample_test(
        &self,
        predictions: &[PredictionRecord],
        actuals: &[OutcomeRecord],
        cutoff: Option<DateTime<Utc>>,
    ) -> EngineResult<OutOfSampleReport> {
        let all_timestamped = predictions.iter().all(|p| p.timestamp.is_some());

        let (split, test_predictions, test_outcomes): (_, Vec<PredictionRecord>, Vec<OutcomeRecord>) =
            match cutoff {
                Some(cutoff) if all_timestamped => {
                    let preds = predictions
                        .iter()
                        .filter(|p| p.timestamp.map_or(false, |ts| ts > cutoff))
                        .cloned()
                        .collect();
                    let outcomes = actuals
                        .iter()
                        .filter(|o| o.timestamp.map_or(true, |ts| ts > cutoff))
                        .cloned()
                        .collect();
                    (HoldoutSplit::Cutoff { cutoff }, preds, outcomes)
                }
                _ => {
                    if cutoff.is_some() {
                        warn!("Predictions lack timestamps, using positional holdout split");
                    }
                    let p_split = (predictions.len() as f64 * self.train_fraction()).floor() as usize;
                    let o_split = (actuals.len() as f64 * self.train_fraction()).floor() as usize;
                    (
                        HoldoutSplit::Positional {
                            train_fraction: self.train_fraction(),
                        },
                        predictions[p_split..].to_vec(),
                        actuals[o_split..].to_vec(),
                    )
                }
            };

        let metrics = self.backtest(&test_predictions, &test_outcomes)?;
        Ok(OutOfSampleReport {
            split,
            test_predictions: test_predictions.len(),
            test_outcomes: test_outcomes.len(),
            metrics,
        })
    }
}
