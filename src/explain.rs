//! Explanation Engine
//!
//! Per-feature attributions for a single prediction. Two attributors share
//! one output shape; the engine picks one when the service starts.

use crate::artifacts::ModelArtifactBundle;
use crate::config::AttributionMode;
use crate::model::{argmax, softmax, Mlp};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// One ranked feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    /// Feature name
    pub feature: String,
    /// Non-negative importance
    pub importance: f64,
}

/// Explanation of one prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    /// Predicted class name
    pub predicted_class: String,
    /// Probability of the predicted class
    pub confidence: f64,
    /// Attribution method used
    pub method: String,
    /// Top features, most important first
    pub top_features: Vec<FeatureImportance>,
}

/// Scores each input feature's contribution to one class.
pub trait Attributor: Send + Sync {
    /// Method name reported to clients
    fn name(&self) -> &'static str;

    /// One non-negative importance per feature of the standardized row `x`.
    fn attribute(&self, model: &Mlp, x: ArrayView1<f64>, class: usize) -> Vec<f64>;
}

/// Absolute input gradient of the class logit.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientAttributor;

impl Attributor for GradientAttributor {
    fn name(&self) -> &'static str {
        "gradient"
    }

    fn attribute(&self, model: &Mlp, x: ArrayView1<f64>, class: usize) -> Vec<f64> {
        model.input_gradient(x, class).mapv(f64::abs).to_vec()
    }
}

/// Monte-Carlo permutation Shapley values of the class probability,
/// with absent features taken from background rows.
#[derive(Debug, Clone)]
pub struct SamplingAttributor {
    background: Array2<f64>,
    permutations: usize,
    seed: u64,
}

impl SamplingAttributor {
    /// Attributor over a non-empty background sample
    pub fn new(background: Array2<f64>, permutations: usize, seed: u64) -> Self {
        Self { background, permutations: permutations.max(1), seed }
    }

    /// Signed Shapley estimates. They sum to `p(x) - mean p(background rows drawn)`.
    pub fn shapley_values(&self, model: &Mlp, x: ArrayView1<f64>, class: usize) -> Array1<f64> {
        let d = x.len();
        let mut phi = Array1::<f64>::zeros(d);
        if self.background.nrows() == 0 || d == 0 {
            return phi;
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut order: Vec<usize> = (0..d).collect();
        for _ in 0..self.permutations {
            order.shuffle(&mut rng);
            let base = self.background.row(rng.gen_range(0..self.background.nrows()));

            // Row k holds the first k features of `order` switched to x.
            let mut coalitions = Array2::<f64>::zeros((d + 1, d));
            coalitions.row_mut(0).assign(&base);
            for (k, &j) in order.iter().enumerate() {
                let prev = coalitions.row(k).to_owned();
                let mut row = coalitions.row_mut(k + 1);
                row.assign(&prev);
                row[j] = x[j];
            }

            let probs = softmax(&model.logits(&coalitions));
            let p = probs.column(class);
            for (k, &j) in order.iter().enumerate() {
                phi[j] += p[k + 1] - p[k];
            }
        }
        phi / self.permutations as f64
    }
}

impl Attributor for SamplingAttributor {
    fn name(&self) -> &'static str {
        "sampling"
    }

    fn attribute(&self, model: &Mlp, x: ArrayView1<f64>, class: usize) -> Vec<f64> {
        self.shapley_values(model, x, class).mapv(f64::abs).to_vec()
    }
}

/// Ranks attributions into a top-k explanation.
pub struct ExplanationEngine {
    attributor: Box<dyn Attributor>,
}

impl ExplanationEngine {
    /// Engine over a specific attributor
    pub fn new(attributor: Box<dyn Attributor>) -> Self {
        Self { attributor }
    }

    /// Pick the attributor for a bundle.
    pub fn for_bundle(bundle: &ModelArtifactBundle, mode: AttributionMode, permutations: usize) -> Self {
        let sampling = match (mode, &bundle.background) {
            (AttributionMode::Gradient, _) => None,
            (_, Some(bg)) if bg.nrows() > 0 => Some(bg.clone()),
            (AttributionMode::Sampling, _) => {
                tracing::warn!("No background sample in bundle, using gradient attribution");
                None
            }
            _ => None,
        };
        let engine = match sampling {
            Some(bg) => Self::new(Box::new(SamplingAttributor::new(bg, permutations, 0))),
            None => Self::new(Box::new(GradientAttributor)),
        };
        tracing::info!("Explanations use {} attribution", engine.method());
        engine
    }

    /// Active method name
    pub fn method(&self) -> &'static str {
        self.attributor.name()
    }

    /// Explain the prediction for one standardized row.
    pub fn explain(&self, bundle: &ModelArtifactBundle, x: ArrayView1<f64>, top_k: usize) -> Explanation {
        let probs = softmax(&bundle.model.logits(&x.to_owned().insert_axis(Axis(0))));
        let probs = probs.row(0);
        let class = argmax(probs);

        let scores = self.attributor.attribute(&bundle.model, x, class);
        let names = bundle.feature_names();
        let mut ranked: Vec<FeatureImportance> = scores
            .into_iter()
            .enumerate()
            .map(|(i, importance)| FeatureImportance {
                feature: if names.len() == x.len() { names[i].clone() } else { format!("f{i}") },
                importance,
            })
            .collect();
        ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        ranked.truncate(top_k);

        Explanation {
            predicted_class: bundle.codec.decode(class).unwrap_or_default().to_string(),
            confidence: probs[class],
            method: self.method().to_string(),
            top_features: ranked,
        }
    }
}
