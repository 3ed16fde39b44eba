//! Dense feed-forward classifier (inference only).
//!
//! ReLU hidden layers and a single sigmoid output unit. Weights are stored
//! row-major per layer (`weights[out][in]`) and lifted into `nalgebra`
//! matrices once at load.

use super::{check_output, sigmoid, Predictor, PredictorKind};
use crate::error::{EngineError, EngineResult};
use crate::features::FeatureVector;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// One serialized layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MlpDocument {
    feature_names: Vec<String>,
    layers: Vec<DenseLayer>,
}

#[derive(Debug, Clone)]
struct Layer {
    weights: DMatrix<f64>,
    bias: DVector<f64>,
}

#[derive(Debug, Clone)]
pub struct MlpClassifier {
    feature_names: Vec<String>,
    layers: Vec<Layer>,
}

impl MlpClassifier {
    pub fn new(feature_names: Vec<String>, layers: Vec<DenseLayer>) -> EngineResult<Self> {
        if layers.is_empty() {
            return Err(EngineError::Predictor("network has no layers".to_string()));
        }

        let mut width = feature_names.len();
        let mut built = Vec::with_capacity(layers.len());
        for (i, layer) in layers.into_iter().enumerate() {
            let rows = layer.weights.len();
            if rows == 0 || layer.bias.len() != rows {
                return Err(EngineError::Predictor(format!(
                    "layer {}: {} weight rows but {} biases",
                    i,
                    rows,
                    layer.bias.len()
                )));
            }
            if let Some(bad) = layer.weights.iter().position(|r| r.len() != width) {
                return Err(EngineError::Predictor(format!(
                    "layer {} row {}: expected {} inputs, got {}",
                    i,
                    bad,
                    width,
                    layer.weights[bad].len()
                )));
            }
            let flat: Vec<f64> = layer.weights.into_iter().flatten().collect();
            if flat.iter().chain(&layer.bias).any(|w| !w.is_finite()) {
                return Err(EngineError::Predictor(format!("layer {} has non-finite weights", i)));
            }
            built.push(Layer {
                weights: DMatrix::from_row_slice(rows, width, &flat),
                bias: DVector::from_vec(layer.bias),
            });
            width = rows;
        }
        if width != 1 {
            return Err(EngineError::Predictor(format!(
                "output layer must have 1 unit, has {}",
                width
            )));
        }

        Ok(Self {
            feature_names,
            layers: built,
        })
    }

    pub fn from_json(blob: &[u8]) -> EngineResult<Self> {
        let document: MlpDocument = serde_json::from_slice(blob)
            .map_err(|e| EngineError::Predictor(format!("invalid network: {}", e)))?;
        Self::new(document.feature_names, document.layers)
    }

    fn forward(&self, input: DVector<f64>) -> f64 {
        let last = self.layers.len() - 1;
        let mut x = input;
        for (i, layer) in self.layers.iter().enumerate() {
            x = &layer.weights * x + &layer.bias;
            if i < last {
                x.apply(|v| *v = v.max(0.0));
            }
        }
        sigmoid(x[0])
    }
}

impl Predictor for MlpClassifier {
    fn kind(&self) -> PredictorKind {
        PredictorKind::NeuralNetwork
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict(&self, features: &FeatureVector) -> EngineResult<f64> {
        let dense = features.to_dense(&self.feature_names);
        if let Some(i) = dense.iter().position(|v| !v.is_finite()) {
            return Err(EngineError::Predictor(format!(
                "neural backend missing feature {}",
                self.feature_names[i]
            )));
        }
        check_output(self.kind(), self.forward(DVector::from_vec(dense)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> MlpClassifier {
        MlpClassifier::new(
            vec!["a".into(), "b".into()],
            vec![
                DenseLayer {
                    weights: vec![vec![1.0, 0.0], vec![0.0, -1.0]],
                    bias: vec![0.0, 0.0],
                },
                DenseLayer {
                    weights: vec![vec![2.0, 3.0]],
                    bias: vec![-1.0],
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_forward_pass() {
        let net = network();
        let mut fv = FeatureVector::new();
        fv.insert("a", 1.5);
        fv.insert("b", 2.0);
        // hidden = relu([1.5, -2.0]) = [1.5, 0]; out = 3.0 - 1.0 = 2.0
        assert!((net.predict(&fv).unwrap() - sigmoid(2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_missing_feature_is_error() {
        let mut fv = FeatureVector::new();
        fv.insert("a", 1.0);
        let err = network().predict(&fv).unwrap_err();
        assert!(err.to_string().contains("missing feature b"));
    }

    #[test]
    fn test_shape_checks() {
        let err = MlpClassifier::new(
            vec!["a".into()],
            vec![DenseLayer {
                weights: vec![vec![1.0, 2.0]],
                bias: vec![0.0],
            }],
        )
        .unwrap_err();
        assert!(err.to_string().contains("expected 1 inputs"));

        let two_outputs = MlpClassifier::new(
            vec!["a".into()],
            vec![DenseLayer {
                weights: vec![vec![1.0], vec![1.0]],
                bias: vec![0.0, 0.0],
            }],
        );
        assert!(two_outputs.is_err());
    }

    #[test]
    fn test_json_blob() {
        let blob = br#"{"feature_names": ["a"], "layers": [{"weights": [[0.0]], "bias": [0.0]}]}"#;
        let net = MlpClassifier::from_json(blob).unwrap();
        let mut fv = FeatureVector::new();
        fv.insert("a", 7.0);
        assert!((net.predict(&fv).unwrap() - 0.5).abs() < 1e-12);
    }
}
