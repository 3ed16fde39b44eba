//! Engine Error Taxonomy
//!
//! Every failure the decision engine can report. None of these are transient,
//! so nothing here carries retry hints; each variant names the offending field,
//! record or backend so the caller can diagnose without replaying the call.

use crate::model_store::ModelStoreError;
use crate::predictor::PredictorKind;

/// Errors surfaced by the scorer, calibrator, harness, predictors and engine.
#[derive(Debug)]
pub enum EngineError {
    /// A numeric input outside its documented domain.
    Validation {
        field: String,
        value: String,
        reason: String,
    },
    /// Not enough data to compute a well-defined result.
    InsufficientData(String),
    /// A requested model version or record does not exist.
    NotFound(String),
    /// The configured predictor backend is not registered at runtime.
    UnavailablePredictor(PredictorKind),
    /// A predictor backend produced an unusable output or could not be decoded.
    Predictor(String),
    /// Model store failure.
    Store(ModelStoreError),
    /// Config file could not be parsed or rendered.
    Config(String),
    Io(std::io::Error),
}

impl EngineError {
    pub fn validation(
        field: impl Into<String>,
        value: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// True for input-domain errors (useful for CLI exit codes).
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation {
                field,
                value,
                reason,
            } => write!(f, "Validation error: {}={} ({})", field, value, reason),
            Self::InsufficientData(msg) => write!(f, "Insufficient data: {}", msg),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::UnavailablePredictor(kind) => {
                write!(f, "Predictor backend unavailable: {}", kind)
            }
            Self::Predictor(msg) => write!(f, "Predictor error: {}", msg),
            Self::Store(e) => write!(f, "Model store error: {}", e),
            Self::Config(msg) => write!(f, "Config error: {}", msg),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ModelStoreError> for EngineError {
    fn from(e: ModelStoreError) -> Self {
        match e {
            ModelStoreError::NotFound(version) => Self::NotFound(version),
            other => Self::Store(other),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(e: toml::ser::Error) -> Self {
        Self::Config(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
