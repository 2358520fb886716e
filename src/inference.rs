//! Inference Service
//!
//! Request handlers over one immutable, shared artifact bundle. A bundle that
//! fails to load leaves the service running in a degraded state where every
//! model-backed call returns [`FlowGuardError::ModelNotLoaded`].

use crate::artifacts::ModelArtifactBundle;
use crate::config::ServiceConfig;
use crate::dataset::RawTable;
use crate::explain::{ExplanationEngine, Explanation};
use crate::model::{argmax, softmax};
use crate::{FlowGuardError, Result};
use ndarray::{Array2, Axis};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Label headers recognised in uploaded CSVs
pub const CSV_LABEL_COLUMNS: [&str; 2] = ["Label", " Label"];

/// Number of entries in `top_predictions`
const TOP_PREDICTIONS: usize = 3;

/// Single-slot store for the most recent CSV analysis.
#[derive(Debug, Default)]
pub struct AnalysisStore {
    slot: RwLock<Option<Arc<serde_json::Value>>>,
}

impl AnalysisStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest stored analysis
    pub fn get(&self) -> Option<Arc<serde_json::Value>> {
        self.slot.read().clone()
    }

    /// Replace the stored analysis
    pub fn set(&self, value: serde_json::Value) {
        *self.slot.write() = Some(Arc::new(value));
    }
}

/// Class with its probability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassProbability {
    /// Class name
    pub class: String,
    /// Softmax probability
    pub probability: f64,
}

/// Single-vector prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    /// Top-1 class
    pub predicted_class: String,
    /// Probability of the top-1 class
    pub confidence: f64,
    /// Up to three most likely classes
    pub top_predictions: Vec<ClassProbability>,
    /// Probability of every class
    pub all_probabilities: BTreeMap<String, f64>,
}

/// One row of a batch or CSV prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowPrediction {
    /// Row position in the request
    pub index: usize,
    /// Top-1 class
    pub predicted_class: String,
    /// Probability of the top-1 class
    pub confidence: f64,
    /// Label cell from the upload, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_label: Option<String>,
}

/// Aggregate over a set of row predictions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSummary {
    /// Count per predicted class
    pub class_distribution: BTreeMap<String, usize>,
    /// Rows predicted as any non-benign class
    pub total_attacks: usize,
    /// Rows predicted as the benign class
    pub total_benign: usize,
    /// `100 × total_attacks / rows`, 0 when empty
    pub attack_percentage: f64,
    /// Exact-match accuracy against uploaded labels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl PredictionSummary {
    fn from_rows(rows: &[RowPrediction], benign_label: &str) -> Self {
        let mut class_distribution = BTreeMap::new();
        for row in rows {
            *class_distribution.entry(row.predicted_class.clone()).or_insert(0) += 1;
        }
        let total_benign = class_distribution.get(benign_label).copied().unwrap_or(0);
        let total_attacks = rows.len() - total_benign;
        let attack_percentage = if rows.is_empty() {
            0.0
        } else {
            total_attacks as f64 / rows.len() as f64 * 100.0
        };
        Self { class_distribution, total_attacks, total_benign, attack_percentage, accuracy: None }
    }
}

/// Batch prediction result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPrediction {
    /// Number of rows predicted
    pub total_predictions: usize,
    /// Per-row results
    pub results: Vec<RowPrediction>,
    /// Aggregate
    pub summary: PredictionSummary,
}

/// CSV analysis result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvAnalysis {
    /// Always true on success
    pub success: bool,
    /// Rows analysed after the cap
    pub total_rows: usize,
    /// Per-row results
    pub predictions: Vec<RowPrediction>,
    /// Aggregate
    pub summary: PredictionSummary,
}

/// Service health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// `healthy` or `degraded`
    pub status: String,
    /// Whether a bundle is loaded
    pub model_loaded: bool,
    /// Trained feature count
    pub features: usize,
    /// Class count
    pub classes: usize,
    /// Why loading failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Model description for clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Expected feature vector length
    pub input_dim: usize,
    /// Ordered class names
    pub class_names: Vec<String>,
    /// Model family
    pub model_type: String,
    /// Training run id
    pub run_id: String,
}

struct LoadedModel {
    bundle: Arc<ModelArtifactBundle>,
    explainer: ExplanationEngine,
}

/// Serves predictions from a loaded bundle.
pub struct InferenceService {
    config: ServiceConfig,
    model: Option<LoadedModel>,
    load_error: Option<String>,
    store: Arc<AnalysisStore>,
}

impl InferenceService {
    /// Load the bundle from `config.artifacts_dir`; stays degraded on failure.
    pub fn new(config: ServiceConfig, store: Arc<AnalysisStore>) -> Self {
        match ModelArtifactBundle::load(&config.artifacts_dir) {
            Ok(bundle) => Self::from_bundle(config, Arc::new(bundle), store),
            Err(e) => {
                tracing::error!("Error loading model: {}", e);
                Self { config, model: None, load_error: Some(e.to_string()), store }
            }
        }
    }

    /// Serve an already loaded bundle
    pub fn from_bundle(
        config: ServiceConfig,
        bundle: Arc<ModelArtifactBundle>,
        store: Arc<AnalysisStore>,
    ) -> Self {
        let explainer =
            ExplanationEngine::for_bundle(&bundle, config.attribution, config.sampling_permutations);
        tracing::info!(
            "Model ready: {} features, {} classes ({})",
            bundle.input_dim(),
            bundle.codec.num_classes(),
            bundle.class_names().join(", ")
        );
        Self { config, model: Some(LoadedModel { bundle, explainer }), load_error: None, store }
    }

    /// Service configuration
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Whether a bundle is loaded
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    fn loaded(&self) -> Result<&LoadedModel> {
        self.model.as_ref().ok_or(FlowGuardError::ModelNotLoaded)
    }

    /// Health report
    pub fn health(&self) -> HealthStatus {
        match &self.model {
            Some(m) => HealthStatus {
                status: "healthy".into(),
                model_loaded: true,
                features: m.bundle.input_dim(),
                classes: m.bundle.codec.num_classes(),
                error: None,
            },
            None => HealthStatus {
                status: "degraded".into(),
                model_loaded: false,
                features: 0,
                classes: 0,
                error: self.load_error.clone(),
            },
        }
    }

    /// Model description
    pub fn model_info(&self) -> Result<ModelInfo> {
        let bundle = &self.loaded()?.bundle;
        Ok(ModelInfo {
            input_dim: bundle.input_dim(),
            class_names: bundle.class_names().to_vec(),
            model_type: "Neural Network (MLP)".into(),
            run_id: bundle.metadata.run_id.to_string(),
        })
    }

    fn probabilities(bundle: &ModelArtifactBundle, x: &Array2<f64>) -> Array2<f64> {
        softmax(&bundle.model.logits(x))
    }

    /// Classify one feature vector.
    pub fn predict(&self, features: &[f64]) -> Result<Prediction> {
        let bundle = &self.loaded()?.bundle;
        let x = bundle.preprocessor.transform_rows(&[features.to_vec()])?;
        let probs = Self::probabilities(bundle, &x);
        let probs = probs.row(0);
        let names = bundle.class_names();

        let mut ranked: Vec<usize> = (0..probs.len()).collect();
        ranked.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
        let best = ranked[0];

        Ok(Prediction {
            predicted_class: names[best].clone(),
            confidence: probs[best],
            top_predictions: ranked
                .iter()
                .take(TOP_PREDICTIONS)
                .map(|&c| ClassProbability { class: names[c].clone(), probability: probs[c] })
                .collect(),
            all_probabilities: names.iter().cloned().zip(probs.iter().copied()).collect(),
        })
    }

    fn predict_rows(bundle: &ModelArtifactBundle, x: &Array2<f64>) -> Vec<RowPrediction> {
        let probs = Self::probabilities(bundle, x);
        probs
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(index, row)| {
                let class = argmax(row);
                RowPrediction {
                    index,
                    predicted_class: bundle.class_names()[class].clone(),
                    confidence: row[class],
                    actual_label: None,
                }
            })
            .collect()
    }

    /// Classify many feature vectors.
    pub fn predict_batch(&self, features: &[Vec<f64>]) -> Result<BatchPrediction> {
        let bundle = &self.loaded()?.bundle;
        let x = bundle.preprocessor.transform_rows(features)?;
        let results = Self::predict_rows(bundle, &x);
        let summary = PredictionSummary::from_rows(&results, &self.config.benign_label);
        Ok(BatchPrediction { total_predictions: results.len(), results, summary })
    }

    /// Classify an uploaded CSV and remember the result.
    pub fn analyze_csv(&self, bytes: &[u8]) -> Result<CsvAnalysis> {
        let bundle = &self.loaded()?.bundle;
        let mut table = RawTable::from_csv_bytes(bytes, Some(self.config.max_bulk_rows))?;
        tracing::info!("CSV uploaded: {} rows, {} columns", table.len(), table.headers.len());

        let labels = CSV_LABEL_COLUMNS
            .iter()
            .find_map(|name| table.column_index(name))
            .map(|idx| table.remove_column(idx));

        let x = bundle.preprocessor.transform_table(&table)?;
        let mut predictions = Self::predict_rows(bundle, &x);
        let mut summary = PredictionSummary::from_rows(&predictions, &self.config.benign_label);

        if let Some(labels) = labels {
            let mut correct = 0;
            for (pred, label) in predictions.iter_mut().zip(labels) {
                if pred.predicted_class == label {
                    correct += 1;
                }
                pred.actual_label = Some(label);
            }
            summary.accuracy = Some(if predictions.is_empty() {
                0.0
            } else {
                correct as f64 / predictions.len() as f64
            });
        }

        let analysis = CsvAnalysis {
            success: true,
            total_rows: predictions.len(),
            predictions,
            summary,
        };
        self.store.set(serde_json::to_value(&analysis)?);
        Ok(analysis)
    }

    /// Explain the prediction for one feature vector.
    pub fn explain(&self, features: &[f64], top_k: Option<usize>) -> Result<Explanation> {
        let loaded = self.loaded()?;
        let x = loaded.bundle.preprocessor.transform_rows(&[features.to_vec()])?;
        let top_k = top_k.unwrap_or(self.config.explain_top_k);
        Ok(loaded.explainer.explain(&loaded.bundle, x.row(0), top_k))
    }

    /// Most recent CSV analysis
    pub fn last_analysis(&self) -> Option<Arc<serde_json::Value>> {
        self.store.get()
    }

    /// Overwrite the most recent analysis
    pub fn store_last_analysis(&self, value: serde_json::Value) {
        self.store.set(value);
    }
}
