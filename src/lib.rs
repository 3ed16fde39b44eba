//! FLIP Settlement Decision Engine
//!
//! Decides, per redemption request, whether to pay out provisionally against
//! an insurance buffer, earmark buffer funds, or wait for the external
//! attestation. Pure computation over already-collected inputs; the only I/O
//! is the model artifact store.

pub mod backtest;
pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod folds;
pub mod model_store;
pub mod models;
pub mod policy;
pub mod predictor;
pub mod scorer;
pub mod serde_utils;

pub use backtest::{BacktestHarness, BacktestMetrics};
pub use calibration::{CalibrationGate, CalibrationModel, ConformalCalibrator, CoverageKind};
pub use config::EngineConfig;
pub use engine::{SettlementDecision, SettlementEngine};
pub use error::{EngineError, EngineResult};
pub use models::{Decision, OutcomeRecord, PredictionRecord, RedemptionContext, ScoreResult};
pub use policy::{DecisionPolicy, PolicyThresholds};
pub use scorer::{DeterministicScorer, ScorerParams};
