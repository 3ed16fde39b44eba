//! Cross-validated coverage.
//!
//! Two flavours over the same seeded folds:
//! - in-sample: each fold fits its own threshold and is scored on itself
//!   (stability diagnostic, optimistic);
//! - held-out: each fold is scored with a threshold fitted on the other folds.

use super::{
    check_alpha, check_lengths, validate_coverage, ConformalCalibrator, CoverageKind,
};
use crate::error::EngineResult;
use crate::folds::KFold;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::info;

/// Per-fold coverage plus aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidatedCoverage {
    pub kind: CoverageKind,
    pub n_folds: usize,
    pub target: f64,
    pub fold_coverage: Vec<f64>,
    pub fold_thresholds: Vec<f64>,
    pub mean_coverage: f64,
    pub std_coverage: f64,
    pub min_coverage: f64,
    pub max_coverage: f64,
}

impl CrossValidatedCoverage {
    fn from_folds(kind: CoverageKind, target: f64, folds: Vec<(f64, f64)>) -> Self {
        let (fold_coverage, fold_thresholds): (Vec<f64>, Vec<f64>) = folds.into_iter().unzip();
        Self {
            kind,
            n_folds: fold_coverage.len(),
            target,
            mean_coverage: fold_coverage.iter().mean(),
            std_coverage: fold_coverage.iter().population_std_dev(),
            min_coverage: Statistics::min(fold_coverage.iter()),
            max_coverage: Statistics::max(fold_coverage.iter()),
            fold_coverage,
            fold_thresholds,
        }
    }
}

fn gather<T: Copy>(values: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&i| values[i]).collect()
}

fn check_inputs(predictions: &[f64], actuals: &[bool], alpha: f64) -> EngineResult<()> {
    check_alpha(alpha)?;
    check_lengths("actuals", actuals.len(), predictions.len())
}

/// Fit and evaluate each fold on itself.
pub fn cross_validate_in_sample(
    calibrator: &ConformalCalibrator,
    predictions: &[f64],
    actuals: &[bool],
    alpha: f64,
    target: f64,
    folds: &KFold,
) -> EngineResult<CrossValidatedCoverage> {
    check_inputs(predictions, actuals, alpha)?;
    let splits = folds.split(predictions.len())?;

    let per_fold = splits
        .par_iter()
        .map(|fold| {
            let p = gather(predictions, &fold.test);
            let y = gather(actuals, &fold.test);
            let (model, report) = calibrator.fit_and_evaluate(&p, &y, alpha, target)?;
            Ok((report.coverage, model.quantile_threshold))
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let report = CrossValidatedCoverage::from_folds(CoverageKind::InSample, target, per_fold);
    info!(
        kind = %report.kind,
        folds = report.n_folds,
        mean = report.mean_coverage,
        min = report.min_coverage,
        "Cross-validated coverage"
    );
    Ok(report)
}

/// Evaluate each fold with a threshold fitted on the remaining folds.
pub fn cross_validate_held_out(
    calibrator: &ConformalCalibrator,
    predictions: &[f64],
    actuals: &[bool],
    alpha: f64,
    target: f64,
    folds: &KFold,
) -> EngineResult<CrossValidatedCoverage> {
    check_inputs(predictions, actuals, alpha)?;
    let splits = folds.split(predictions.len())?;

    let per_fold = splits
        .par_iter()
        .map(|fold| {
            let model = calibrator.fit(
                &gather(predictions, &fold.train),
                &gather(actuals, &fold.train),
                alpha,
            )?;
            let (lower, upper) = model.apply_batch(&gather(predictions, &fold.test))?;
            let report =
                validate_coverage(&lower, &upper, &gather(actuals, &fold.test), target)?;
            Ok((report.coverage, model.quantile_threshold))
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let report = CrossValidatedCoverage::from_folds(CoverageKind::HeldOut, target, per_fold);
    info!(
        kind = %report.kind,
        folds = report.n_folds,
        mean = report.mean_coverage,
        min = report.min_coverage,
        "Cross-validated coverage"
    );
    Ok(report)
}
