//! Offline Evaluation

use crate::artifacts::ModelArtifactBundle;
use crate::dataset::{DatasetError, LoadedDataset, RawTable};
use crate::metrics::{accuracy, confusion_matrix, macro_f1, per_class_metrics, ClassMetrics};
use crate::model::predict_classes;
use crate::trainer::TrainingHistory;
use crate::Result;
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Metrics for one evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Bundle that was evaluated
    pub run_id: Uuid,
    /// Exact-match accuracy
    pub accuracy: f64,
    /// Macro F1 over classes present in truth or predictions
    pub f1_macro: f64,
    /// Per-class precision / recall / F1 / support
    pub per_class: Vec<ClassMetrics>,
    /// Rows true, columns predicted, in class order
    pub confusion_matrix: Vec<Vec<usize>>,
    /// Class order of the matrix
    pub class_names: Vec<String>,
    /// Rows scored
    pub evaluated_rows: usize,
    /// Rows skipped for a missing or unknown label
    pub skipped_rows: usize,
    /// Training curves from the bundle
    pub history: Option<TrainingHistory>,
}

impl EvaluationReport {
    /// Write as pretty JSON (`metrics.json`)
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Scores a trained bundle against labelled data.
pub struct Evaluator {
    bundle: Arc<ModelArtifactBundle>,
}

impl Evaluator {
    /// Wrap a loaded bundle
    pub fn new(bundle: Arc<ModelArtifactBundle>) -> Self {
        Self { bundle }
    }

    /// Load the bundle from an artifact directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(ModelArtifactBundle::load(dir)?)))
    }

    /// Evaluate a loaded dataset
    pub fn evaluate(&self, dataset: &LoadedDataset) -> Result<EvaluationReport> {
        self.evaluate_table(&dataset.table, &dataset.label_column)
    }

    /// Evaluate a table holding `label_column` plus feature columns.
    pub fn evaluate_table(&self, table: &RawTable, label_column: &str) -> Result<EvaluationReport> {
        let codec = &self.bundle.codec;
        let mut features = table.clone();
        let label_idx = features
            .column_index(label_column)
            .ok_or_else(|| DatasetError::MissingLabelColumn {
                column: label_column.to_string(),
                available: table.headers.clone(),
            })?;
        let labels = features.remove_column(label_idx);

        let (rows, y_true): (Vec<usize>, Vec<usize>) = labels
            .iter()
            .enumerate()
            .filter_map(|(r, label)| codec.encode(label).map(|c| (r, c)))
            .unzip();
        let skipped = labels.len() - rows.len();
        if skipped > 0 {
            tracing::warn!("Skipped {} rows with missing or unknown labels", skipped);
        }
        if rows.is_empty() {
            return Err(DatasetError::EmptyDataset.into());
        }

        let x = self.bundle.preprocessor.transform_table(&features)?;
        let x = x.select(Axis(0), &rows);
        let y_pred = predict_classes(&self.bundle.model.logits(&x));

        let n_classes = codec.num_classes();
        let confusion = confusion_matrix(&y_true, &y_pred, n_classes);
        let report = EvaluationReport {
            run_id: self.bundle.metadata.run_id,
            accuracy: accuracy(&y_true, &y_pred),
            f1_macro: macro_f1(&y_true, &y_pred, n_classes),
            per_class: per_class_metrics(&confusion, codec.class_names()),
            confusion_matrix: confusion,
            class_names: codec.class_names().to_vec(),
            evaluated_rows: rows.len(),
            skipped_rows: skipped,
            history: self.bundle.history.clone(),
        };

        tracing::info!(
            "Evaluated {} rows: accuracy {:.4}, macro F1 {:.4}",
            report.evaluated_rows,
            report.accuracy,
            report.f1_macro
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainConfig;
    use crate::dataset::{sample_table, DatasetDialect};
    use crate::trainer::Trainer;
    use crate::FlowGuardError;

    fn trained() -> Arc<ModelArtifactBundle> {
        let dataset = LoadedDataset {
            table: sample_table(300, 1),
            label_column: "label".into(),
            dialect: DatasetDialect::Cicids,
            files: Vec::new(),
        };
        let config = TrainConfig {
            epochs: 20,
            batch_size: 32,
            learning_rate: 5e-3,
            hidden_dims: vec![16],
            dropout: 0.0,
            ..Default::default()
        };
        Arc::new(Trainer::new(config).fit(&dataset).unwrap())
    }

    #[test]
    fn test_report_on_fresh_table() {
        let evaluator = Evaluator::new(trained());
        let mut table = sample_table(200, 99);
        let mut unknown = table.rows[0].clone();
        *unknown.last_mut().unwrap() = "Mystery".into();
        table.rows.push(unknown);
        let mut missing = table.rows[1].clone();
        *missing.last_mut().unwrap() = "".into();
        table.rows.push(missing);

        let report = evaluator.evaluate_table(&table, "label").unwrap();
        assert_eq!(report.evaluated_rows, 200);
        assert_eq!(report.skipped_rows, 2);
        assert!(report.accuracy > 0.8, "accuracy {}", report.accuracy);
        assert_eq!(report.confusion_matrix.len(), 2);
        let total: usize = report.confusion_matrix.iter().flatten().sum();
        assert_eq!(total, 200);
        let support: usize = report.per_class.iter().map(|m| m.support).sum();
        assert_eq!(support, 200);
        assert!(report.history.is_some());
    }

    #[test]
    fn test_missing_label_column() {
        let evaluator = Evaluator::new(trained());
        let err = evaluator.evaluate_table(&sample_table(5, 2), "Label").unwrap_err();
        assert!(matches!(
            err,
            FlowGuardError::Dataset(DatasetError::MissingLabelColumn { .. })
        ));
    }

    #[test]
    fn test_report_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = Evaluator::new(trained());
        let report = evaluator.evaluate_table(&sample_table(50, 4), "label").unwrap();
        let path = dir.path().join("metrics.json");
        report.save(&path).unwrap();
        let back: EvaluationReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.evaluated_rows, 50);
    }
}
