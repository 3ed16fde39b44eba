//! Settlement Engine
//!
//! Front door for per-redemption decisions. Two paths share one policy:
//! - deterministic: integer scorer with the context gates;
//! - model: predictor probability, conformal band, policy without context gates.

use crate::calibration::CalibrationModel;
use crate::error::EngineResult;
use crate::features::FeatureVector;
use crate::models::{
    ppm_floor_from_probability, ppm_from_probability, probability_from_ppm, Decision, Ppm,
    PredictionRecord, RedemptionContext, ScoreBreakdown,
};
use crate::policy::{DecisionPolicy, PolicyThresholds};
use crate::predictor::{Predictor, PredictorKind, PredictorRegistry};
use crate::scorer::{suggested_haircut, DeterministicScorer, ScorerParams};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Which path produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "path", content = "predictor", rename_all = "snake_case")]
pub enum DecisionPath {
    Deterministic,
    Model(PredictorKind),
}

/// A settlement decision with its band, in ppm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementDecision {
    pub path: DecisionPath,
    pub point_estimate: Ppm,
    pub confidence_lower: Ppm,
    pub confidence_upper: Ppm,
    pub decision: Decision,
    /// Haircut on a provisional payout; 0 for any other decision.
    pub suggested_haircut: Ppm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ScoreBreakdown>,
}

impl SettlementDecision {
    /// Backtest input for this decision.
    pub fn to_prediction_record(
        &self,
        redemption_id: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> PredictionRecord {
        PredictionRecord {
            redemption_id: redemption_id.into(),
            probability: probability_from_ppm(self.point_estimate),
            confidence_lower: probability_from_ppm(self.confidence_lower),
            confidence_upper: probability_from_ppm(self.confidence_upper),
            timestamp,
        }
    }
}

struct ModelPath {
    predictor: Arc<dyn Predictor>,
    calibration: CalibrationModel,
}

pub struct SettlementEngine {
    scorer: DeterministicScorer,
    policy: DecisionPolicy,
    model: Option<ModelPath>,
}

impl SettlementEngine {
    pub fn deterministic(params: ScorerParams, thresholds: PolicyThresholds) -> EngineResult<Self> {
        Ok(Self {
            scorer: DeterministicScorer::new(params, thresholds)?,
            policy: DecisionPolicy::new(thresholds),
            model: None,
        })
    }

    /// Model-backed engine. Fails immediately if `kind` is not registered.
    pub fn with_model(
        registry: &PredictorRegistry,
        kind: PredictorKind,
        calibration: CalibrationModel,
        thresholds: PolicyThresholds,
    ) -> EngineResult<Self> {
        let predictor = registry.get(kind)?;
        crate::calibration::check_alpha(calibration.alpha)?;
        Ok(Self {
            scorer: DeterministicScorer::new(ScorerParams::default(), thresholds)?,
            policy: DecisionPolicy::new(thresholds),
            model: Some(ModelPath {
                predictor,
                calibration,
            }),
        })
    }

    pub fn path(&self) -> DecisionPath {
        match &self.model {
            Some(m) => DecisionPath::Model(m.predictor.kind()),
            None => DecisionPath::Deterministic,
        }
    }

    /// Decide one redemption. `features` is only read on the model path.
    pub fn evaluate(
        &self,
        context: &RedemptionContext,
        features: &FeatureVector,
    ) -> EngineResult<SettlementDecision> {
        let decision = match &self.model {
            None => {
                let score = self.scorer.score(context)?;
                SettlementDecision {
                    path: DecisionPath::Deterministic,
                    point_estimate: score.score,
                    confidence_lower: score.confidence_lower,
                    confidence_upper: score.confidence_upper,
                    decision: score.decision,
                    suggested_haircut: haircut_for(score.decision, score.confidence_lower),
                    breakdown: Some(score.breakdown),
                }
            }
            Some(model) => {
                context.validate()?;
                let p = model.predictor.predict(features)?;
                let (lower, upper) = model.calibration.apply(p)?;
                let (point, lower, upper) = (
                    ppm_from_probability(p),
                    ppm_floor_from_probability(lower),
                    ppm_from_probability(upper),
                );
                let decision = self.policy.decide(point, lower, upper, None);
                SettlementDecision {
                    path: DecisionPath::Model(model.predictor.kind()),
                    point_estimate: point,
                    confidence_lower: lower,
                    confidence_upper: upper,
                    decision,
                    suggested_haircut: haircut_for(decision, lower),
                    breakdown: None,
                }
            }
        };

        debug!(
            path = ?decision.path,
            point = decision.point_estimate,
            lower = decision.confidence_lower,
            upper = decision.confidence_upper,
            decision = %decision.decision,
            "Settlement decision"
        );
        Ok(decision)
    }
}

fn haircut_for(decision: Decision, confidence_lower: Ppm) -> Ppm {
    match decision {
        Decision::ProvisionalSettle => suggested_haircut(confidence_lower),
        _ => 0,
    }
}
