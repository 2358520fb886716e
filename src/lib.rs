//! FlowGuard - Network Flow Attack Classifier
//!
//! Train-to-serve pipeline for classifying tabular network flow records
//! (CICIDS2017 / UNSW-NB15 style) into benign and attack classes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          FLOWGUARD PIPELINE                             │
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────────┐ │
//! │  │   Dataset    │  │   Feature    │  │    Label     │  │   Class     │ │
//! │  │   Loader     │─▶│ Preprocessor │  │    Codec     │  │  Weighting  │ │
//! │  │  (CSV/dir)   │  │ (fit/trans.) │  │  (sorted)    │  │ (balanced)  │ │
//! │  └──────────────┘  └──────┬───────┘  └──────┬───────┘  └──────┬──────┘ │
//! │                           │                 │                 │        │
//! │  ┌────────────────────────▼─────────────────▼─────────────────▼──────┐ │
//! │  │                 TRAINER  (MLP + BatchNorm + Adam)                  │ │
//! │  └─────────────────────────────┬─────────────────────────────────────┘ │
//! │                                │ artifact bundle                        │
//! │  ┌─────────────────────────────▼─────────────────────────────────────┐ │
//! │  │                    INFERENCE SERVICE                               │ │
//! │  │   predict | batch | CSV analyze | explain | last analysis         │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐                                    │
//! │  │  Evaluator   │  │ Explanation  │                                    │
//! │  │  (metrics)   │  │ (grad/SHAP)  │                                    │
//! │  └──────────────┘  └──────────────┘                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod api;
pub mod artifacts;
pub mod config;
pub mod dataset;
pub mod evaluate;
pub mod explain;
pub mod inference;
pub mod labels;
pub mod metrics;
pub mod model;
pub mod preprocess;
pub mod trainer;

use thiserror::Error;

pub use artifacts::ModelArtifactBundle;
pub use config::{AttributionMode, ServiceConfig, TrainConfig};
pub use dataset::{DatasetDialect, DatasetError, LoadedDataset, RawTable};
pub use evaluate::{EvaluationReport, Evaluator};
pub use inference::{AnalysisStore, InferenceService};
pub use labels::{class_weights, LabelCodec};
pub use model::Mlp;
pub use preprocess::{FeatureMatrix, FittedPreprocessor};
pub use trainer::{Trainer, TrainingHistory};

/// FlowGuard error types
#[derive(Debug, Error)]
pub enum FlowGuardError {
    /// Loading or shaping input data failed
    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),
    /// Artifact bundle missing, unreadable or inconsistent
    #[error("artifact load error: {0}")]
    Artifact(String),
    /// No bundle is loaded
    #[error("Model not loaded")]
    ModelNotLoaded,
    /// Request or configuration rejected
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Filesystem or socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Crate result alias
pub type Result<T> = std::result::Result<T, FlowGuardError>;
