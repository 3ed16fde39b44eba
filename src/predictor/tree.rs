//! Gradient-boosted tree ensemble (inference only).
//!
//! Evaluates a JSON tree dump: each tree is a flat node array rooted at index
//! 0. A split sends `value < threshold` left; a missing or NaN feature follows
//! the node's default direction. Leaf margins are summed with `base_score`
//! and passed through the logistic link.

use super::{check_output, sigmoid, Predictor, PredictorKind};
use crate::error::{EngineError, EngineResult};
use crate::features::FeatureVector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: String,
        threshold: f64,
        left: usize,
        right: usize,
        #[serde(default = "default_left")]
        default_left: bool,
    },
    Leaf {
        value: f64,
    },
}

fn default_left() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    /// Children must point strictly forward, which rules out cycles.
    fn validate(&self, tree_index: usize, features: &[String]) -> EngineResult<()> {
        if self.nodes.is_empty() {
            return Err(EngineError::Predictor(format!("tree {} has no nodes", tree_index)));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split {
                feature,
                left,
                right,
                threshold,
                ..
            } = node
            {
                for &child in [left, right].iter() {
                    if *child <= i || *child >= self.nodes.len() {
                        return Err(EngineError::Predictor(format!(
                            "tree {} node {} has invalid child {}",
                            tree_index, i, child
                        )));
                    }
                }
                if !threshold.is_finite() {
                    return Err(EngineError::Predictor(format!(
                        "tree {} node {} has non-finite threshold",
                        tree_index, i
                    )));
                }
                if !features.is_empty() && !features.contains(feature) {
                    return Err(EngineError::Predictor(format!(
                        "tree {} node {} splits on unknown feature {}",
                        tree_index, i, feature
                    )));
                }
            }
        }
        Ok(())
    }

    fn margin(&self, features: &FeatureVector) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    default_left,
                } => {
                    idx = match features.get(feature).filter(|v| !v.is_nan()) {
                        Some(v) if v < *threshold => *left,
                        Some(_) => *right,
                        None if *default_left => *left,
                        None => *right,
                    };
                }
            }
        }
    }
}

/// Boosted-tree binary classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub feature_names: Vec<String>,
    /// Initial margin (log-odds).
    #[serde(default)]
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

impl TreeEnsemble {
    pub fn new(feature_names: Vec<String>, base_score: f64, trees: Vec<Tree>) -> EngineResult<Self> {
        let model = Self {
            feature_names,
            base_score,
            trees,
        };
        model.validate()?;
        Ok(model)
    }

    pub fn from_json(blob: &[u8]) -> EngineResult<Self> {
        let model: Self = serde_json::from_slice(blob)
            .map_err(|e| EngineError::Predictor(format!("invalid tree ensemble: {}", e)))?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> EngineResult<()> {
        if !self.base_score.is_finite() {
            return Err(EngineError::Predictor("non-finite base_score".to_string()));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(i, &self.feature_names)?;
        }
        Ok(())
    }

    pub fn margin(&self, features: &FeatureVector) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.margin(features)).sum::<f64>()
    }
}

impl Predictor for TreeEnsemble {
    fn kind(&self) -> PredictorKind {
        PredictorKind::GradientBoostedTree
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict(&self, features: &FeatureVector) -> EngineResult<f64> {
        check_output(self.kind(), sigmoid(self.margin(features)))
    }
}
