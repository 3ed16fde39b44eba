//! Deployment gate for a calibration.
//!
//! Accepts a calibration only on held-out evidence: the mean cross-validated
//! coverage must reach the target and no single fold may fall more than the
//! tolerance below it.

use super::{CoverageKind, CrossValidatedCoverage, DEFAULT_TARGET_COVERAGE};
use serde::{Deserialize, Serialize};

/// Gate thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationGateConfig {
    /// Minimum mean held-out coverage (default: 0.997)
    pub target_coverage: f64,
    /// Allowed shortfall of the worst fold below target (default: 0.01)
    pub tolerance: f64,
}

impl Default for CalibrationGateConfig {
    fn default() -> Self {
        Self {
            target_coverage: DEFAULT_TARGET_COVERAGE,
            tolerance: 0.01,
        }
    }
}

/// Gate outcome with the reasons behind a rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub passed: bool,
    pub reasons: Vec<String>,
}

pub struct CalibrationGate {
    config: CalibrationGateConfig,
}

impl CalibrationGate {
    pub fn new(config: CalibrationGateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalibrationGateConfig {
        &self.config
    }

    pub fn evaluate(&self, report: &CrossValidatedCoverage) -> GateVerdict {
        let mut reasons = Vec::new();

        if report.kind != CoverageKind::HeldOut {
            reasons.push(format!(
                "{} coverage cannot gate deployment, held-out required",
                report.kind
            ));
        }
        if report.n_folds == 0 {
            reasons.push("no folds evaluated".to_string());
        }
        if !(report.mean_coverage >= self.config.target_coverage) {
            reasons.push(format!(
                "mean coverage {:.4} below target {:.4}",
                report.mean_coverage, self.config.target_coverage
            ));
        }
        let floor = self.config.target_coverage - self.config.tolerance;
        if !(report.min_coverage >= floor) {
            reasons.push(format!(
                "worst fold coverage {:.4} below floor {:.4}",
                report.min_coverage, floor
            ));
        }

        GateVerdict {
            passed: reasons.is_empty(),
            reasons,
        }
    }
}

impl Default for CalibrationGate {
    fn default() -> Self {
        Self::new(CalibrationGateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(kind: CoverageKind, folds: Vec<f64>) -> CrossValidatedCoverage {
        let n = folds.len();
        let mean = folds.iter().sum::<f64>() / n as f64;
        let min = folds.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = folds.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        CrossValidatedCoverage {
            kind,
            n_folds: n,
            target: 0.997,
            fold_thresholds: vec![0.05; n],
            fold_coverage: folds,
            mean_coverage: mean,
            std_coverage: 0.0,
            min_coverage: min,
            max_coverage: max,
        }
    }

    #[test]
    fn test_passes_on_held_out() {
        let gate = CalibrationGate::default();
        let verdict = gate.evaluate(&report(CoverageKind::HeldOut, vec![0.998, 0.999, 1.0]));
        assert!(verdict.passed, "{:?}", verdict.reasons);
    }

    #[test]
    fn test_rejects_in_sample() {
        let gate = CalibrationGate::default();
        let verdict = gate.evaluate(&report(CoverageKind::InSample, vec![1.0, 1.0, 1.0]));
        assert!(!verdict.passed);
        assert!(verdict.reasons[0].contains("in-sample"));
    }

    #[test]
    fn test_rejects_weak_fold() {
        let gate = CalibrationGate::default();
        // Mean clears 0.997 but one fold is below 0.987.
        let verdict = gate.evaluate(&report(CoverageKind::HeldOut, vec![1.0, 1.0, 1.0, 1.0, 0.986]));
        assert!(!verdict.passed);
        assert_eq!(verdict.reasons.len(), 1);
        assert!(verdict.reasons[0].contains("worst fold"));
    }
}
