//! Service and Training Configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable naming the service config file
pub const CONFIG_ENV: &str = "FLOWGUARD_CONFIG";
/// Environment override for the artifact directory
pub const ARTIFACTS_ENV: &str = "FLOWGUARD_ARTIFACTS";
/// Environment override for the bind address
pub const BIND_ENV: &str = "FLOWGUARD_BIND";

/// Which attribution method the explanation engine uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributionMode {
    /// Sampling when a background sample exists, gradient otherwise
    #[default]
    Auto,
    /// Input gradients
    Gradient,
    /// Permutation Shapley over the background sample
    Sampling,
}

/// Inference service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Artifact directory
    pub artifacts_dir: PathBuf,
    /// Listen address
    pub bind: String,
    /// Class name counted as benign in summaries
    pub benign_label: String,
    /// Row cap for CSV analysis
    pub max_bulk_rows: usize,
    /// Default number of features in an explanation
    pub explain_top_k: usize,
    /// Attribution method
    pub attribution: AttributionMode,
    /// Permutations per explanation for the sampling attributor
    pub sampling_permutations: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from("artifacts"),
            bind: "0.0.0.0:8000".into(),
            benign_label: "BENIGN".into(),
            max_bulk_rows: 1000,
            explain_top_k: 10,
            attribution: AttributionMode::Auto,
            sampling_permutations: 8,
        }
    }
}

impl ServiceConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Load from `FLOWGUARD_CONFIG` (defaults when absent) and apply env overrides.
    pub fn from_env() -> Self {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!("Config {} not readable ({}), using defaults", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        };
        if let Ok(dir) = std::env::var(ARTIFACTS_ENV) {
            config.artifacts_dir = PathBuf::from(dir);
        }
        if let Ok(bind) = std::env::var(BIND_ENV) {
            config.bind = bind;
        }
        config
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Passes over the training split
    pub epochs: usize,
    /// Mini-batch size
    pub batch_size: usize,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Hidden layer widths
    pub hidden_dims: Vec<usize>,
    /// Dropout rate
    pub dropout: f64,
    /// Validation fraction
    pub test_size: f64,
    /// Seed for split, init, shuffling and dropout
    pub seed: u64,
    /// Standardized training rows kept for sampling attribution (0 disables)
    pub background_size: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 256,
            learning_rate: 1e-3,
            hidden_dims: vec![128, 64, 32],
            dropout: 0.3,
            test_size: 0.2,
            seed: 42,
            background_size: 50,
        }
    }
}
