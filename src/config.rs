//! Engine Configuration
//!
//! TOML file with environment overrides. Every field has a default, so an
//! absent or partial file still yields a usable configuration.

use crate::backtest::{BacktestHarness, DEFAULT_TARGET_ACCURACY, DEFAULT_TRAIN_FRACTION};
use crate::calibration::{
    CalibrationGate, CalibrationGateConfig, ConformalCalibrator, QuantileMethod, DEFAULT_ALPHA,
    DEFAULT_TARGET_COVERAGE,
};
use crate::error::{EngineError, EngineResult};
use crate::folds::{KFold, DEFAULT_SEED};
use crate::policy::{DecisionPolicy, PolicyThresholds};
use crate::predictor::PredictorKind;
use crate::scorer::{DeterministicScorer, ScorerParams};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

fn default_alpha() -> f64 {
    DEFAULT_ALPHA
}
fn default_target_coverage() -> f64 {
    DEFAULT_TARGET_COVERAGE
}
fn default_coverage_tolerance() -> f64 {
    0.01
}
fn default_target_accuracy() -> f64 {
    DEFAULT_TARGET_ACCURACY
}
fn default_cv_folds() -> usize {
    5
}
fn default_seed() -> u64 {
    DEFAULT_SEED
}
fn default_train_fraction() -> f64 {
    DEFAULT_TRAIN_FRACTION
}
fn default_model_db_path() -> String {
    "./flip_models.db".to_string()
}
fn default_predictor() -> PredictorKind {
    PredictorKind::GradientBoostedTree
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Conformal miscoverage rate
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Held-out coverage required by the calibration gate
    #[serde(default = "default_target_coverage")]
    pub target_coverage: f64,

    /// Worst-fold shortfall tolerated by the calibration gate
    #[serde(default = "default_coverage_tolerance")]
    pub coverage_tolerance: f64,

    /// Backtest accuracy floor
    #[serde(default = "default_target_accuracy")]
    pub target_accuracy: f64,

    #[serde(default = "default_cv_folds")]
    pub cv_folds: usize,

    /// Fold shuffle seed
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Train share of the positional holdout split
    #[serde(default = "default_train_fraction")]
    pub holdout_train_fraction: f64,

    #[serde(default)]
    pub quantile_method: QuantileMethod,

    #[serde(default = "default_model_db_path")]
    pub model_db_path: String,

    #[serde(default = "default_predictor")]
    pub predictor: PredictorKind,

    #[serde(default)]
    pub thresholds: PolicyThresholds,

    #[serde(default)]
    pub scorer: ScorerParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            target_coverage: default_target_coverage(),
            coverage_tolerance: default_coverage_tolerance(),
            target_accuracy: default_target_accuracy(),
            cv_folds: default_cv_folds(),
            seed: default_seed(),
            holdout_train_fraction: default_train_fraction(),
            quantile_method: QuantileMethod::default(),
            model_db_path: default_model_db_path(),
            predictor: default_predictor(),
            thresholds: PolicyThresholds::default(),
            scorer: ScorerParams::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `FLIP_CONFIG_PATH` (default `flip_config.toml`), then apply
    /// `FLIP_*` overrides.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let path =
            std::env::var("FLIP_CONFIG_PATH").unwrap_or_else(|_| "flip_config.toml".to_string());
        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default engine config ({}): {}", path, e);
            Self::default()
        });
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply `FLIP_*` overrides from `lookup`. Unparseable values are ignored
    /// with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("Ignoring invalid {}={:?}", key, raw);
                    None
                }
            }
        }

        if let Some(v) = parse("FLIP_ALPHA", lookup("FLIP_ALPHA")) {
            self.alpha = v;
        }
        if let Some(v) = parse("FLIP_TARGET_ACCURACY", lookup("FLIP_TARGET_ACCURACY")) {
            self.target_accuracy = v;
        }
        if let Some(v) = parse("FLIP_CV_FOLDS", lookup("FLIP_CV_FOLDS")) {
            self.cv_folds = v;
        }
        if let Some(v) = parse("FLIP_SEED", lookup("FLIP_SEED")) {
            self.seed = v;
        }
        if let Some(path) = lookup("FLIP_MODEL_DB") {
            self.model_db_path = path;
        }
    }

    /// Save to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> EngineResult<()> {
        let unit = |field: &str, v: f64| {
            if v.is_finite() && (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(EngineError::validation(field, v, "must be in [0, 1]"))
            }
        };

        crate::calibration::check_alpha(self.alpha)?;
        unit("target_coverage", self.target_coverage)?;
        unit("coverage_tolerance", self.coverage_tolerance)?;
        unit("target_accuracy", self.target_accuracy)?;
        if self.cv_folds < 2 {
            return Err(EngineError::validation(
                "cv_folds",
                self.cv_folds,
                "need at least 2 folds",
            ));
        }
        if !(self.holdout_train_fraction > 0.0 && self.holdout_train_fraction < 1.0) {
            return Err(EngineError::validation(
                "holdout_train_fraction",
                self.holdout_train_fraction,
                "must be in (0, 1)",
            ));
        }
        if self.thresholds.buffer_ppm > self.thresholds.provisional_ppm {
            return Err(EngineError::validation(
                "thresholds.buffer_ppm",
                self.thresholds.buffer_ppm,
                "must not exceed provisional_ppm",
            ));
        }
        self.scorer.validate()?;
        self.scorer.check_thresholds(&self.thresholds)
    }

    // =========================================================================
    // COMPONENT CONSTRUCTORS
    // =========================================================================

    pub fn policy(&self) -> DecisionPolicy {
        DecisionPolicy::new(self.thresholds)
    }

    pub fn scorer(&self) -> EngineResult<DeterministicScorer> {
        DeterministicScorer::new(self.scorer, self.thresholds)
    }

    pub fn calibrator(&self) -> ConformalCalibrator {
        ConformalCalibrator::new(self.quantile_method)
    }

    pub fn calibration_gate(&self) -> CalibrationGate {
        CalibrationGate::new(CalibrationGateConfig {
            target_coverage: self.target_coverage,
            tolerance: self.coverage_tolerance,
        })
    }

    pub fn kfold(&self) -> EngineResult<KFold> {
        KFold::new(self.cv_folds, self.seed)
    }

    pub fn harness(&self) -> EngineResult<BacktestHarness> {
        BacktestHarness::new(self.policy(), self.target_accuracy)?
            .with_seed(self.seed)
            .with_train_fraction(self.holdout_train_fraction)
    }
}
