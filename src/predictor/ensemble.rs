//! Soft-voting ensemble: unweighted mean of member probabilities.

use super::{check_output, decode, Predictor, PredictorKind};
use crate::error::{EngineError, EngineResult};
use crate::features::FeatureVector;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
struct MemberSpec {
    kind: PredictorKind,
    model: serde_json::Value,
}

#[derive(Deserialize)]
struct EnsembleDocument {
    members: Vec<MemberSpec>,
}

pub struct EnsemblePredictor {
    members: Vec<Arc<dyn Predictor>>,
    feature_names: Vec<String>,
}

impl EnsemblePredictor {
    pub fn new(members: Vec<Arc<dyn Predictor>>) -> EngineResult<Self> {
        if members.is_empty() {
            return Err(EngineError::validation(
                "members",
                0,
                "ensemble needs at least one member",
            ));
        }
        let mut feature_names: Vec<String> = Vec::new();
        for member in &members {
            for name in member.feature_names() {
                if !feature_names.contains(name) {
                    feature_names.push(name.clone());
                }
            }
        }
        Ok(Self {
            members,
            feature_names,
        })
    }

    /// Blob layout: `{"members": [{"kind": "xgboost", "model": {...}}, ...]}`.
    pub fn from_json(blob: &[u8]) -> EngineResult<Self> {
        let document: EnsembleDocument = serde_json::from_slice(blob)
            .map_err(|e| EngineError::Predictor(format!("invalid ensemble: {}", e)))?;
        let members = document
            .members
            .into_iter()
            .map(|m| {
                let bytes = serde_json::to_vec(&m.model)
                    .map_err(|e| EngineError::Predictor(e.to_string()))?;
                decode(m.kind, &bytes)
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Self::new(members)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl std::fmt::Debug for EnsemblePredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<PredictorKind> = self.members.iter().map(|m| m.kind()).collect();
        f.debug_struct("EnsemblePredictor")
            .field("members", &kinds)
            .finish()
    }
}

impl Predictor for EnsemblePredictor {
    fn kind(&self) -> PredictorKind {
        PredictorKind::Ensemble
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict(&self, features: &FeatureVector) -> EngineResult<f64> {
        let mut sum = 0.0;
        for member in &self.members {
            sum += member.predict(features)?;
        }
        check_output(self.kind(), sum / self.members.len() as f64)
    }
}
