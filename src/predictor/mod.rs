//! Probability Predictors
//!
//! Inference-only backends behind a single [`Predictor`] trait. Training
//! happens elsewhere; these decode serialized model blobs and score a
//! [`FeatureVector`]. Backends are selected at runtime from an immutable
//! [`PredictorRegistry`], and asking for one that was never registered is an
//! explicit [`EngineError::UnavailablePredictor`].

pub mod ensemble;
pub mod mlp;
pub mod tree;

pub use ensemble::EnsemblePredictor;
pub use mlp::{DenseLayer, MlpClassifier};
pub use tree::{Tree, TreeEnsemble, TreeNode};

use crate::error::{EngineError, EngineResult};
use crate::features::FeatureVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Backend family. Serialized under the names the training pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PredictorKind {
    #[serde(rename = "xgboost")]
    GradientBoostedTree,
    #[serde(rename = "neural")]
    NeuralNetwork,
    #[serde(rename = "ensemble")]
    Ensemble,
}

impl PredictorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GradientBoostedTree => "xgboost",
            Self::NeuralNetwork => "neural",
            Self::Ensemble => "ensemble",
        }
    }
}

impl std::fmt::Display for PredictorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PredictorKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xgboost" | "gbt" | "tree" => Ok(Self::GradientBoostedTree),
            "neural" | "mlp" => Ok(Self::NeuralNetwork),
            "ensemble" => Ok(Self::Ensemble),
            other => Err(EngineError::validation(
                "predictor",
                other,
                "expected one of xgboost, neural, ensemble",
            )),
        }
    }
}

/// Minimal probability-model contract.
pub trait Predictor: Send + Sync {
    fn kind(&self) -> PredictorKind;

    /// Feature names in the order the model was trained on.
    fn feature_names(&self) -> &[String];

    /// Probability of the positive class (redemption succeeds).
    fn predict(&self, features: &FeatureVector) -> EngineResult<f64>;

    /// `[P(failure), P(success)]`.
    fn predict_proba(&self, features: &FeatureVector) -> EngineResult<[f64; 2]> {
        let p = self.predict(features)?;
        Ok([1.0 - p, p])
    }
}

/// Reject NaN or out-of-range backend output.
pub(crate) fn check_output(kind: PredictorKind, p: f64) -> EngineResult<f64> {
    if p.is_finite() && (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(EngineError::Predictor(format!(
            "{} backend produced invalid probability {}",
            kind, p
        )))
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Decode a stored blob into a predictor of the given kind.
pub fn decode(kind: PredictorKind, blob: &[u8]) -> EngineResult<Arc<dyn Predictor>> {
    let predictor: Arc<dyn Predictor> = match kind {
        PredictorKind::GradientBoostedTree => Arc::new(TreeEnsemble::from_json(blob)?),
        PredictorKind::NeuralNetwork => Arc::new(MlpClassifier::from_json(blob)?),
        PredictorKind::Ensemble => Arc::new(EnsemblePredictor::from_json(blob)?),
    };
    Ok(predictor)
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Immutable map of available backends, built once at startup.
#[derive(Clone, Default)]
pub struct PredictorRegistry {
    backends: BTreeMap<PredictorKind, Arc<dyn Predictor>>,
}

impl PredictorRegistry {
    pub fn builder() -> PredictorRegistryBuilder {
        PredictorRegistryBuilder::default()
    }

    pub fn get(&self, kind: PredictorKind) -> EngineResult<Arc<dyn Predictor>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or(EngineError::UnavailablePredictor(kind))
    }

    pub fn available(&self) -> Vec<PredictorKind> {
        self.backends.keys().copied().collect()
    }
}

impl std::fmt::Debug for PredictorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictorRegistry")
            .field("available", &self.available())
            .finish()
    }
}

#[derive(Default)]
pub struct PredictorRegistryBuilder {
    backends: BTreeMap<PredictorKind, Arc<dyn Predictor>>,
}

impl PredictorRegistryBuilder {
    /// Register a backend under its own kind, replacing any earlier one.
    pub fn register(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.backends.insert(predictor.kind(), predictor);
        self
    }

    pub fn build(self) -> PredictorRegistry {
        PredictorRegistry {
            backends: self.backends,
        }
    }
}
