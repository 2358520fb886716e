//! Model Artifact Bundle
//!
//! Everything the service needs to reproduce training-time transforms and
//! predictions, stored as a directory of JSON/text files.

use crate::labels::LabelCodec;
use crate::model::{HiddenBlock, Linear, Mlp, MlpConfig};
use crate::preprocess::FittedPreprocessor;
use crate::trainer::TrainingHistory;
use crate::{FlowGuardError, Result};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Current on-disk format
pub const FORMAT_VERSION: u32 = 1;

/// Architecture, weights and run metadata
pub const MODEL_FILE: &str = "model.json";
/// Imputation means and scaler
pub const PREPROCESSOR_FILE: &str = "preprocessor.json";
/// Ordered class list
pub const CLASSES_FILE: &str = "classes.json";
/// Newline-delimited feature order
pub const FEATURES_FILE: &str = "feature_names.txt";
/// Training curves
pub const HISTORY_FILE: &str = "history.json";
/// Standardized background rows
pub const BACKGROUND_FILE: &str = "background.json";

/// Identifies one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Unique run id
    pub run_id: Uuid,
    /// When the bundle was produced
    pub created_at: DateTime<Utc>,
    /// Artifact format version
    pub format_version: u32,
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    #[serde(flatten)]
    metadata: RunMetadata,
    config: MlpConfig,
    blocks: Vec<HiddenBlock>,
    head: Linear,
}

/// Trained model plus the state needed to serve it.
#[derive(Debug, Clone)]
pub struct ModelArtifactBundle {
    /// Network
    pub model: Mlp,
    /// Frozen feature pipeline
    pub preprocessor: FittedPreprocessor,
    /// Persisted class list
    pub codec: LabelCodec,
    /// Training curves, when recorded
    pub history: Option<TrainingHistory>,
    /// Standardized training rows for sampling attribution
    pub background: Option<Array2<f64>>,
    /// Run identity
    pub metadata: RunMetadata,
}

impl ModelArtifactBundle {
    /// Fresh bundle stamped with a new run id
    pub fn new(
        model: Mlp,
        preprocessor: FittedPreprocessor,
        codec: LabelCodec,
        history: Option<TrainingHistory>,
        background: Option<Array2<f64>>,
    ) -> Self {
        Self {
            model,
            preprocessor,
            codec,
            history,
            background,
            metadata: RunMetadata {
                run_id: Uuid::new_v4(),
                created_at: Utc::now(),
                format_version: FORMAT_VERSION,
            },
        }
    }

    /// Trained feature order
    pub fn feature_names(&self) -> &[String] {
        &self.preprocessor.feature_names
    }

    /// Ordered class names
    pub fn class_names(&self) -> &[String] {
        self.codec.class_names()
    }

    /// Model input width
    pub fn input_dim(&self) -> usize {
        self.model.config().input_dim
    }

    /// Write all artifact files into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let model_file = ModelFile {
            metadata: self.metadata.clone(),
            config: self.model.config().clone(),
            blocks: self.model.blocks().to_vec(),
            head: self.model.head().clone(),
        };
        write_json(&dir.join(MODEL_FILE), &model_file)?;
        write_json(&dir.join(PREPROCESSOR_FILE), &self.preprocessor)?;
        write_json(&dir.join(CLASSES_FILE), &self.codec)?;

        let mut names = self.feature_names().join("\n");
        names.push('\n');
        std::fs::write(dir.join(FEATURES_FILE), names)?;

        if let Some(history) = &self.history {
            write_json(&dir.join(HISTORY_FILE), history)?;
        }
        if let Some(background) = &self.background {
            write_json(&dir.join(BACKGROUND_FILE), background)?;
        }

        tracing::debug!("Wrote bundle {} to {}", self.metadata.run_id, dir.display());
        Ok(())
    }

    /// Load and cross-check a bundle directory.
    pub fn load(dir: &Path) -> Result<Self> {
        tracing::info!("Loading model artifacts from {}", dir.display());

        let model_file: ModelFile = read_json(&dir.join(MODEL_FILE))?;
        if model_file.metadata.format_version > FORMAT_VERSION {
            return Err(FlowGuardError::Artifact(format!(
                "unsupported format version {}",
                model_file.metadata.format_version
            )));
        }
        let model = Mlp::from_parts(model_file.config, model_file.blocks, model_file.head)?;

        let preprocessor: FittedPreprocessor = read_json(&dir.join(PREPROCESSOR_FILE))?;
        let codec: LabelCodec = read_json(&dir.join(CLASSES_FILE))?;

        let names_path = dir.join(FEATURES_FILE);
        let names = std::fs::read_to_string(&names_path)
            .map_err(|e| FlowGuardError::Artifact(format!("{}: {}", names_path.display(), e)))?;
        let feature_names: Vec<String> = names.lines().map(str::to_string).collect();

        let history = optional_json::<TrainingHistory>(&dir.join(HISTORY_FILE))?;
        let background = optional_json::<Array2<f64>>(&dir.join(BACKGROUND_FILE))?;

        let bundle = Self {
            model,
            preprocessor,
            codec,
            history,
            background,
            metadata: model_file.metadata,
        };
        bundle.check_consistency(&feature_names)?;

        tracing::info!(
            "Loaded run {}: {} features, {} classes",
            bundle.metadata.run_id,
            bundle.input_dim(),
            bundle.codec.num_classes()
        );
        Ok(bundle)
    }

    fn check_consistency(&self, feature_names: &[String]) -> Result<()> {
        let dim = self.input_dim();
        let pre = &self.preprocessor;
        if feature_names != pre.feature_names.as_slice() {
            return Err(FlowGuardError::Artifact(format!(
                "{} lists {} features, preprocessor has {}",
                FEATURES_FILE,
                feature_names.len(),
                pre.feature_names.len()
            )));
        }
        let lengths = [
            pre.feature_names.len(),
            pre.impute_means.len(),
            pre.scaler.mean.len(),
            pre.scaler.scale.len(),
        ];
        if lengths.iter().any(|&len| len != dim) {
            return Err(FlowGuardError::Artifact(format!(
                "preprocessor widths {:?} do not match model input {}",
                lengths, dim
            )));
        }
        if self.codec.num_classes() != self.model.config().num_classes {
            return Err(FlowGuardError::Artifact(format!(
                "{} classes listed, model outputs {}",
                self.codec.num_classes(),
                self.model.config().num_classes
            )));
        }
        if let Some(background) = &self.background {
            if background.ncols() != dim {
                return Err(FlowGuardError::Artifact(format!(
                    "background sample has {} columns, expected {}",
                    background.ncols(),
                    dim
                )));
            }
        }
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string(value)?;
    std::fs::write(path, content)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FlowGuardError::Artifact(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| FlowGuardError::Artifact(format!("{}: {}", path.display(), e)))
}

fn optional_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if path.exists() {
        read_json(path).map(Some)
    } else {
        Ok(None)
    }
}
