//! Training Loop
//!
//! Prepares the dataset, trains the MLP with class-weighted cross entropy and
//! Adam, validates after every epoch and packages the artifact bundle.

use crate::artifacts::ModelArtifactBundle;
use crate::config::TrainConfig;
use crate::dataset::LoadedDataset;
use crate::labels::class_weights;
use crate::metrics::{accuracy, macro_f1};
use crate::model::{predict_classes, weighted_cross_entropy, Adam, Mlp, MlpConfig};
use crate::preprocess::{prepare_training_data, PreparedData};
use crate::{FlowGuardError, Result};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-epoch training curves
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Mean training loss
    pub train_loss: Vec<f64>,
    /// Validation loss
    pub val_loss: Vec<f64>,
    /// Validation accuracy
    pub val_accuracy: Vec<f64>,
    /// Validation macro F1
    pub val_f1_macro: Vec<f64>,
}

impl TrainingHistory {
    /// Number of recorded epochs
    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }
}

/// Trainer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Configured, nothing run yet
    Initialized,
    /// Running the given epoch (1-based)
    Training {
        /// Current epoch
        epoch: usize,
    },
    /// Bundle produced
    Finished,
    /// Bundle written to disk
    Persisted,
}

/// Trains a classifier from a loaded dataset.
pub struct Trainer {
    config: TrainConfig,
    state: TrainerState,
}

impl Trainer {
    /// New trainer
    pub fn new(config: TrainConfig) -> Self {
        Self { config, state: TrainerState::Initialized }
    }

    /// Hyperparameters
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Clean, split and train on a dataset.
    pub fn fit(&mut self, dataset: &LoadedDataset) -> Result<ModelArtifactBundle> {
        tracing::info!(
            "Training on {} rows from {} file(s), label column '{}', dialect {:?}",
            dataset.table.len(),
            dataset.files.len(),
            dataset.label_column,
            dataset.dialect
        );
        let data = prepare_training_data(dataset, self.config.test_size, self.config.seed)?;
        self.fit_prepared(data)
    }

    /// Train on already prepared splits.
    pub fn fit_prepared(&mut self, data: PreparedData) -> Result<ModelArtifactBundle> {
        if self.config.batch_size == 0 {
            return Err(FlowGuardError::InvalidInput("batch_size must be positive".into()));
        }
        if data.x_train.nrows() < 2 {
            return Err(FlowGuardError::InvalidInput(format!(
                "need at least 2 training rows, have {}",
                data.x_train.nrows()
            )));
        }

        let n_classes = data.codec.num_classes();
        let mut init_rng = StdRng::seed_from_u64(self.config.seed);
        let mut model = Mlp::new(
            MlpConfig {
                input_dim: data.preprocessor.n_features(),
                num_classes: n_classes,
                hidden_dims: self.config.hidden_dims.clone(),
                dropout: self.config.dropout,
            },
            &mut init_rng,
        )?;
        let weights = class_weights(&data.y_train, n_classes);
        tracing::debug!("Class weights: {:?}", weights);

        let mut optimizer = Adam::new(self.config.learning_rate);
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));
        let mut order: Vec<usize> = (0..data.x_train.nrows()).collect();
        let mut history = TrainingHistory::default();

        for epoch in 1..=self.config.epochs {
            self.state = TrainerState::Training { epoch };

            order.shuffle(&mut rng);
            let (mut loss_sum, mut seen) = (0.0, 0usize);
            for batch in order.chunks(self.config.batch_size) {
                // BatchNorm needs two rows
                if batch.len() < 2 {
                    continue;
                }
                let xb = data.x_train.select(Axis(0), batch);
                let yb: Vec<usize> = batch.iter().map(|&i| data.y_train[i]).collect();
                let loss = model.train_step(&xb, &yb, &weights, &mut optimizer, &mut rng);
                loss_sum += loss * batch.len() as f64;
                seen += batch.len();
            }
            let train_loss = if seen > 0 { loss_sum / seen as f64 } else { 0.0 };

            let (val_loss, val_acc, val_f1) = validate(&model, &data.x_val, &data.y_val, &weights);
            history.train_loss.push(train_loss);
            history.val_loss.push(val_loss);
            history.val_accuracy.push(val_acc);
            history.val_f1_macro.push(val_f1);

            tracing::info!(
                "Epoch {}/{} - train_loss: {:.4}, val_loss: {:.4}, val_acc: {:.4}, val_f1: {:.4}",
                epoch,
                self.config.epochs,
                train_loss,
                val_loss,
                val_acc,
                val_f1
            );
        }

        let background = self.background_sample(&data.x_train, &mut rng);
        self.state = TrainerState::Finished;

        Ok(ModelArtifactBundle::new(
            model,
            data.preprocessor,
            data.codec,
            Some(history),
            background,
        ))
    }

    /// Write a finished bundle.
    pub fn persist(&mut self, bundle: &ModelArtifactBundle, dir: &Path) -> Result<()> {
        bundle.save(dir)?;
        self.state = TrainerState::Persisted;
        tracing::info!("Artifacts saved to {}", dir.display());
        Ok(())
    }

    fn background_sample(&self, x_train: &Array2<f64>, rng: &mut StdRng) -> Option<Array2<f64>> {
        if self.config.background_size == 0 {
            return None;
        }
        let mut idx: Vec<usize> = (0..x_train.nrows()).collect();
        idx.shuffle(rng);
        idx.truncate(self.config.background_size);
        idx.sort_unstable();
        Some(x_train.select(Axis(0), &idx))
    }
}

fn validate(model: &Mlp, x: &Array2<f64>, y: &[usize], weights: &[f64]) -> (f64, f64, f64) {
    if y.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let logits = model.logits(x);
    let (loss, _) = weighted_cross_entropy(&logits, y, weights);
    let preds = predict_classes(&logits);
    (loss, accuracy(y, &preds), macro_f1(y, &preds, weights.len()))
}
