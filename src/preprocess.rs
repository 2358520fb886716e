//! Feature Preprocessor
//!
//! The cleaning contract shared by training and serving. Training calls
//! [`prepare_training_data`], which fits a [`FittedPreprocessor`] on the train
//! split; serving only ever calls the `transform*` methods on the persisted one.
//!
//! Pipeline order: drop identifiers → numeric columns only → align to trained
//! columns (serve) → ±inf to missing → drop all-missing columns (train) → drop
//! unusable rows (train) → impute with train means → clip → standardize.

use crate::dataset::{is_missing, DatasetError, LoadedDataset, RawTable};
use crate::labels::LabelCodec;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::HashMap;

/// Identifier / non-informative columns, matched case-insensitively.
pub const ID_COLUMNS: [&str; 7] = ["id", "srcip", "dstip", "sport", "dsport", "stime", "ltime"];

/// Values are clipped to ±CLIP_LIMIT before standardization.
pub const CLIP_LIMIT: f64 = 1e30;

/// Ordered named numeric columns. Missing cells are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    /// Column names, order-significant
    pub names: Vec<String>,
    /// rows x names.len()
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    /// Drop identifier columns and keep the numeric ones.
    ///
    /// The table must not contain the label column any more.
    pub fn from_table(table: &RawTable) -> Result<Self, DatasetError> {
        let mut keep = Vec::new();
        for (idx, name) in table.headers.iter().enumerate() {
            if is_id_column(name) {
                continue;
            }
            if table.column(idx).all(|c| parse_cell(c).is_some()) {
                keep.push(idx);
            }
        }
        if keep.is_empty() {
            return Err(DatasetError::NoFeatures);
        }

        let names = keep.iter().map(|&i| table.headers[i].clone()).collect();
        let values = Array2::from_shape_fn((table.len(), keep.len()), |(r, c)| {
            parse_cell(&table.rows[r][keep[c]]).unwrap_or(f64::NAN)
        });
        Ok(Self { names, values })
    }

    /// Number of samples
    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    /// Number of features
    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    /// Turn ±inf into missing.
    pub fn replace_infinite(&mut self) {
        self.values.mapv_inplace(|v| if v.is_infinite() { f64::NAN } else { v });
    }

    /// Drop columns with no observed value, returning their names.
    pub fn drop_all_missing_columns(&mut self) -> Vec<String> {
        let keep: Vec<usize> = (0..self.ncols())
            .filter(|&c| self.values.column(c).iter().any(|v| !v.is_nan()))
            .collect();
        let dropped = (0..self.ncols())
            .filter(|c| !keep.contains(c))
            .map(|c| self.names[c].clone())
            .collect();
        self.values = self.values.select(Axis(1), &keep);
        self.names = keep.iter().map(|&c| self.names[c].clone()).collect();
        dropped
    }

    /// Subset of rows, in the given order
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            names: self.names.clone(),
            values: self.values.select(Axis(0), rows),
        }
    }
}

fn is_id_column(name: &str) -> bool {
    let lower = name.trim().to_lowercase();
    ID_COLUMNS.contains(&lower.as_str())
}

/// `None` when the cell is not numeric; NaN when it is missing.
fn parse_cell(cell: &str) -> Option<f64> {
    if is_missing(cell) {
        return Some(f64::NAN);
    }
    cell.trim().parse::<f64>().ok()
}

/// Per-feature standardization parameters, fit on the training split only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    /// Per-feature mean
    pub mean: Vec<f64>,
    /// Per-feature standard deviation; zero is stored as 1
    pub scale: Vec<f64>,
}

impl Scaler {
    /// Fit on a fully imputed matrix
    pub fn fit(values: &Array2<f64>) -> Self {
        let mut mean = Vec::with_capacity(values.ncols());
        let mut scale = Vec::with_capacity(values.ncols());
        for column in values.axis_iter(Axis(1)) {
            let m = column.iter().mean();
            let sd = column.iter().population_std_dev();
            mean.push(if m.is_finite() { m } else { 0.0 });
            scale.push(if sd.is_finite() && sd > 0.0 { sd } else { 1.0 });
        }
        Self { mean, scale }
    }
}

/// Frozen preprocessing state: feature order, imputation means and scaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPreprocessor {
    /// Trained feature order
    pub feature_names: Vec<String>,
    /// Training-split column means used for imputation
    pub impute_means: Vec<f64>,
    /// Standardization parameters
    pub scaler: Scaler,
}

impl FittedPreprocessor {
    /// Fit imputation means and the scaler on the training split.
    pub fn fit(train: &FeatureMatrix) -> Self {
        let impute_means = train
            .values
            .axis_iter(Axis(1))
            .map(|col| {
                let observed: Vec<f64> = col
                    .iter()
                    .filter(|v| v.is_finite())
                    .map(|v| v.clamp(-CLIP_LIMIT, CLIP_LIMIT))
                    .collect();
                let mean = if observed.is_empty() { 0.0 } else { observed.iter().mean() };
                if mean.is_finite() {
                    mean
                } else {
                    0.0
                }
            })
            .collect();

        let mut fitted = Self {
            feature_names: train.names.clone(),
            impute_means,
            scaler: Scaler {
                mean: vec![0.0; train.ncols()],
                scale: vec![1.0; train.ncols()],
            },
        };
        let cleaned = fitted.impute_and_clip(&train.values);
        fitted.scaler = Scaler::fit(&cleaned);
        fitted
    }

    /// Fit on the training split and return its transformed values.
    pub fn fit_transform(train: &FeatureMatrix) -> (Self, Array2<f64>) {
        let fitted = Self::fit(train);
        let values = fitted.transform_values(&train.values);
        (fitted, values)
    }

    /// Number of trained features
    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    fn impute_and_clip(&self, values: &Array2<f64>) -> Array2<f64> {
        let mut out = values.clone();
        for (c, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            let fill = self.impute_means[c];
            column.mapv_inplace(|v| {
                let v = if v.is_finite() { v } else { fill };
                v.clamp(-CLIP_LIMIT, CLIP_LIMIT)
            });
        }
        out
    }

    /// Sanitize, impute, clip and standardize an already aligned matrix.
    pub fn transform_values(&self, values: &Array2<f64>) -> Array2<f64> {
        let mut out = self.impute_and_clip(values);
        for (c, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s) = (self.scaler.mean[c], self.scaler.scale[c]);
            column.mapv_inplace(|v| (v - m) / s);
        }
        out
    }

    /// Transform a matrix whose columns already follow the trained order.
    pub fn transform(&self, matrix: &FeatureMatrix) -> Result<Array2<f64>, DatasetError> {
        if matrix.ncols() != self.n_features() {
            return Err(DatasetError::FeatureMismatch {
                expected: self.n_features(),
                got: matrix.ncols(),
            });
        }
        Ok(self.transform_values(&matrix.values))
    }

    /// Extract and align the trained columns from an uploaded table.
    ///
    /// Columns are matched by name when every trained name is present.
    /// Otherwise the first N numeric columns are taken by position.
    pub fn align_table(&self, table: &RawTable) -> Result<FeatureMatrix, DatasetError> {
        let matrix = FeatureMatrix::from_table(table)?;
        let n = self.n_features();

        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (i, name) in matrix.names.iter().enumerate() {
            positions.entry(name.trim()).or_insert(i);
        }
        let by_name: Option<Vec<usize>> = self
            .feature_names
            .iter()
            .map(|name| positions.get(name.trim()).copied())
            .collect();

        if let Some(idx) = by_name {
            return Ok(FeatureMatrix {
                names: self.feature_names.clone(),
                values: matrix.values.select(Axis(1), &idx),
            });
        }

        if matrix.ncols() < n {
            return Err(DatasetError::FeatureMismatch {
                expected: n,
                got: matrix.ncols(),
            });
        }
        if matrix.ncols() > n {
            tracing::warn!(
                "Column names do not match training; truncating {} numeric columns to the first {} by position",
                matrix.ncols(),
                n
            );
        }
        let idx: Vec<usize> = (0..n).collect();
        Ok(FeatureMatrix {
            names: self.feature_names.clone(),
            values: matrix.values.select(Axis(1), &idx),
        })
    }

    /// Align and transform an uploaded table (label column already removed).
    pub fn transform_table(&self, table: &RawTable) -> Result<Array2<f64>, DatasetError> {
        let aligned = self.align_table(table)?;
        self.transform(&aligned)
    }

    /// Align and transform raw feature vectors.
    ///
    /// Longer vectors are truncated, shorter ones rejected.
    pub fn transform_rows(&self, rows: &[Vec<f64>]) -> Result<Array2<f64>, DatasetError> {
        let n = self.n_features();
        let mut values = Array2::<f64>::zeros((rows.len(), n));
        for (r, row) in rows.iter().enumerate() {
            if row.len() < n {
                return Err(DatasetError::FeatureMismatch {
                    expected: n,
                    got: row.len(),
                });
            }
            if row.len() > n {
                tracing::warn!("Truncating feature vector of length {} to {}", row.len(), n);
            }
            for (c, v) in row.iter().take(n).enumerate() {
                values[[r, c]] = *v;
            }
        }
        Ok(self.transform_values(&values))
    }
}

/// Train/validation data ready for the trainer.
#[derive(Debug, Clone)]
pub struct PreparedData {
    /// Standardized training features
    pub x_train: Array2<f64>,
    /// Standardized validation features
    pub x_val: Array2<f64>,
    /// Encoded training labels
    pub y_train: Vec<usize>,
    /// Encoded validation labels
    pub y_val: Vec<usize>,
    /// Preprocessing state fit on the training split
    pub preprocessor: FittedPreprocessor,
    /// Label codec fit on the cleaned labels
    pub codec: LabelCodec,
}

/// Run the full training-time cleaning pipeline and split into train/validation.
pub fn prepare_training_data(
    dataset: &LoadedDataset,
    test_size: f64,
    seed: u64,
) -> Result<PreparedData, DatasetError> {
    let mut table = dataset.table.clone();
    let label_idx = table
        .column_index(&dataset.label_column)
        .ok_or_else(|| DatasetError::MissingLabelColumn {
            column: dataset.label_column.clone(),
            available: table.headers.clone(),
        })?;
    let labels = table.remove_column(label_idx);

    let mut features = FeatureMatrix::from_table(&table)?;
    features.replace_infinite();

    let dropped = features.drop_all_missing_columns();
    if !dropped.is_empty() {
        tracing::info!("Dropped {} all-missing columns: {:?}", dropped.len(), dropped);
    }
    if features.ncols() == 0 {
        return Err(DatasetError::NoFeatures);
    }

    let valid: Vec<usize> = (0..features.nrows())
        .filter(|&r| !is_missing(&labels[r]))
        .filter(|&r| features.values.row(r).iter().any(|v| !v.is_nan()))
        .collect();
    if valid.is_empty() {
        return Err(DatasetError::EmptyDataset);
    }
    if valid.len() < features.nrows() {
        tracing::info!("Dropped {} unusable rows", features.nrows() - valid.len());
    }
    let features = features.select_rows(&valid);
    let labels: Vec<&str> = valid.iter().map(|&r| labels[r].as_str()).collect();

    let codec = LabelCodec::fit(labels.iter().copied());
    let y: Vec<usize> = labels
        .iter()
        .map(|l| codec.encode(l).ok_or(DatasetError::EmptyDataset))
        .collect::<Result<_, _>>()?;

    let (train_idx, val_idx) = train_val_split(&y, codec.num_classes(), test_size, seed);
    if train_idx.is_empty() || val_idx.is_empty() {
        return Err(DatasetError::EmptyDataset);
    }

    let (preprocessor, x_train) = FittedPreprocessor::fit_transform(&features.select_rows(&train_idx));
    let x_val = preprocessor.transform_values(&features.select_rows(&val_idx).values);

    tracing::info!(
        "Prepared {} train / {} validation rows, {} features, {} classes",
        train_idx.len(),
        val_idx.len(),
        preprocessor.n_features(),
        codec.num_classes()
    );

    Ok(PreparedData {
        x_train,
        x_val,
        y_train: train_idx.iter().map(|&i| y[i]).collect(),
        y_val: val_idx.iter().map(|&i| y[i]).collect(),
        preprocessor,
        codec,
    })
}

/// Seeded split, stratified by class when every class has at least 2 samples.
pub fn train_val_split(
    labels: &[usize],
    n_classes: usize,
    test_size: f64,
    seed: u64,
) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let test_size = test_size.clamp(0.0, 1.0);

    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); n_classes];
    for (i, &y) in labels.iter().enumerate() {
        by_class[y].push(i);
    }
    let stratify = by_class.iter().all(|c| c.is_empty() || c.len() >= 2);

    let (mut train, mut val) = (Vec::new(), Vec::new());
    if stratify {
        for mut members in by_class.into_iter().filter(|c| !c.is_empty()) {
            members.shuffle(&mut rng);
            let n_test = ((members.len() as f64 * test_size).round() as usize)
                .clamp(1, members.len() - 1);
            val.extend_from_slice(&members[..n_test]);
            train.extend_from_slice(&members[n_test..]);
        }
    } else {
        tracing::debug!("A class has fewer than 2 samples; splitting without stratification");
        let mut all: Vec<usize> = (0..labels.len()).collect();
        all.shuffle(&mut rng);
        let n_test = ((labels.len() as f64 * test_size).ceil() as usize).min(labels.len());
        val.extend_from_slice(&all[..n_test]);
        train.extend_from_slice(&all[n_test..]);
    }
    train.sort_unstable();
    val.sort_unstable();
    (train, val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetDialect;

    fn loaded(csv: &str, label: &str) -> LoadedDataset {
        LoadedDataset {
            table: RawTable::from_csv_bytes(csv.as_bytes(), None).unwrap(),
            label_column: label.into(),
            dialect: DatasetDialect::Cicids,
            files: Vec::new(),
        }
    }

    #[test]
    fn test_from_table_drops_ids_and_text() {
        let table = RawTable::from_csv_bytes(
            b"Id, SrcIP,proto,bytes,rate\n1,10.0.0.1,tcp,100,0.5\n2,10.0.0.2,udp,,Infinity\n",
            None,
        )
        .unwrap();
        let m = FeatureMatrix::from_table(&table).unwrap();
        assert_eq!(m.names, vec!["bytes", "rate"]);
        assert!(m.values[[1, 0]].is_nan());
        assert!(m.values[[1, 1]].is_infinite());
    }

    #[test]
    fn test_no_numeric_features() {
        let table = RawTable::from_csv_bytes(b"id,proto\n1,tcp\n", None).unwrap();
        assert!(matches!(FeatureMatrix::from_table(&table), Err(DatasetError::NoFeatures)));
    }

    #[test]
    fn test_zero_std_is_guarded() {
        let m = FeatureMatrix {
            names: vec!["const".into(), "var".into()],
            values: ndarray::array![[5.0, 1.0], [5.0, 3.0]],
        };
        let (fitted, x) = FittedPreprocessor::fit_transform(&m);
        assert_eq!(fitted.scaler.scale[0], 1.0);
        assert!(x.iter().all(|v| v.is_finite()));
        assert_eq!(x[[0, 0]], 0.0);
        assert!((x[[0, 1]] + 1.0).abs() < 1e-12);
        assert!((x[[1, 1]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_imputation_uses_training_means() {
        let m = FeatureMatrix {
            names: vec!["a".into(), "b".into()],
            values: ndarray::array![[1.0, f64::NAN], [3.0, f64::NAN], [f64::NAN, f64::NAN]],
        };
        let fitted = FittedPreprocessor::fit(&m);
        assert_eq!(fitted.impute_means, vec![2.0, 0.0]);

        let out = fitted.transform_values(&ndarray::array![[f64::NAN, f64::INFINITY]]);
        // imputed with the mean, so it standardizes to 0
        assert_eq!(out[[0, 0]], 0.0);
        assert_eq!(out[[0, 1]], 0.0);
    }

    #[test]
    fn test_extreme_column_mean_stays_finite() {
        let m = FeatureMatrix {
            names: vec!["bytes".into()],
            values: ndarray::array![[1.5e308], [-1.5e308], [0.0]],
        };
        let fitted = FittedPreprocessor::fit(&m);
        assert!(fitted.impute_means[0].is_finite());

        let out = fitted.transform_values(&ndarray::array![[f64::NAN]]);
        assert!(out[[0, 0]].is_finite());

        let json = serde_json::to_string(&fitted).unwrap();
        let reloaded: FittedPreprocessor = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded, fitted);
    }

    #[test]
    fn test_values_are_clipped_before_scaling() {
        let m = FeatureMatrix {
            names: vec!["rate".into()],
            values: ndarray::array![[1e300], [-1e300], [0.0]],
        };
        let fitted = FittedPreprocessor::fit(&m);
        assert_eq!(fitted.scaler.mean[0], 0.0);
        assert!((fitted.scaler.scale[0] - CLIP_LIMIT * (2.0f64 / 3.0).sqrt()).abs() < 1e16);

        let out = fitted.transform_values(&ndarray::array![[1e300], [-1e300], [f64::MAX], [CLIP_LIMIT]]);
        assert!(out.iter().all(|v| v.is_finite()));
        let top = (1.5f64).sqrt();
        assert!((out[[0, 0]] - top).abs() < 1e-12);
        assert!((out[[1, 0]] + top).abs() < 1e-12);
        assert_eq!(out[[2, 0]], out[[3, 0]]);
    }

    #[test]
    fn test_transform_is_deterministic() {
        let m = FeatureMatrix {
            names: vec!["a".into(), "b".into()],
            values: ndarray::array![[1.0, 10.0], [2.0, 20.0], [4.0, 5.0]],
        };
        let fitted = FittedPreprocessor::fit(&m);
        let rows = vec![vec![3.0, 7.0]];
        let first = fitted.transform_rows(&rows).unwrap();
        let second = fitted.transform_rows(&rows).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_transform_rows_truncates_and_rejects() {
        let m = FeatureMatrix {
            names: vec!["a".into(), "b".into()],
            values: ndarray::array![[1.0, 10.0], [3.0, 30.0]],
        };
        let fitted = FittedPreprocessor::fit(&m);
        let x = fitted.transform_rows(&[vec![2.0, 20.0, 99.0]]).unwrap();
        assert_eq!(x.shape(), &[1, 2]);
        assert!(matches!(
            fitted.transform_rows(&[vec![1.0]]),
            Err(DatasetError::FeatureMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_align_table_by_name_and_position() {
        let m = FeatureMatrix {
            names: vec![" Flow Duration".into(), "Bytes".into()],
            values: ndarray::array![[1.0, 10.0], [3.0, 30.0]],
        };
        let fitted = FittedPreprocessor::fit(&m);

        let reordered =
            RawTable::from_csv_bytes(b"Bytes,extra,Flow Duration\n30,7,3\n", None).unwrap();
        let aligned = fitted.align_table(&reordered).unwrap();
        assert_eq!(aligned.values.row(0).to_vec(), vec![3.0, 30.0]);

        let renamed = RawTable::from_csv_bytes(b"x,y,z\n1,2,3\n", None).unwrap();
        let aligned = fitted.align_table(&renamed).unwrap();
        assert_eq!(aligned.values.row(0).to_vec(), vec![1.0, 2.0]);

        let narrow = RawTable::from_csv_bytes(b"x\n1\n", None).unwrap();
        assert!(matches!(
            fitted.align_table(&narrow),
            Err(DatasetError::FeatureMismatch { .. })
        ));
    }

    #[test]
    fn test_align_table_keeps_repeated_columns_apart() {
        let train = RawTable::from_csv_bytes(
            b" Fwd Header Length,x, Fwd Header Length\n1,0.1,100\n3,0.3,300\n",
            None,
        )
        .unwrap();
        let fitted = FittedPreprocessor::fit(&FeatureMatrix::from_table(&train).unwrap());
        assert_eq!(
            fitted.feature_names,
            vec![" Fwd Header Length", "x", " Fwd Header Length.1"]
        );

        let upload = RawTable::from_csv_bytes(
            b"x, Fwd Header Length, Fwd Header Length\n0.5,2,200\n",
            None,
        )
        .unwrap();
        let aligned = fitted.align_table(&upload).unwrap();
        assert_eq!(aligned.values.row(0).to_vec(), vec![2.0, 0.5, 200.0]);
    }

    #[test]
    fn test_prepare_training_data_cleans() {
        let mut csv = String::from("id,a,b,empty,proto,Label\n");
        for i in 0..20 {
            let label = if i % 2 == 0 { "BENIGN" } else { " DoS " };
            csv.push_str(&format!("{i},{},{},,tcp,{label}\n", i as f64, (i * 2) as f64));
        }
        csv.push_str("98,inf,,,tcp,\n");
        csv.push_str("99,,,,tcp,BENIGN\n");

        let prepared = prepare_training_data(&loaded(&csv, "Label"), 0.2, 42).unwrap();
        assert_eq!(prepared.preprocessor.feature_names, vec!["a", "b"]);
        assert_eq!(prepared.codec.class_names(), &["BENIGN".to_string(), "DoS".to_string()]);
        assert_eq!(prepared.y_train.len() + prepared.y_val.len(), 20);
        assert_eq!(prepared.y_val.len(), 4);
        assert!(prepared.x_train.iter().all(|v| v.is_finite()));
        assert!(prepared.x_val.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_prepare_training_data_empty() {
        let csv = "a,Label\n,BENIGN\n1,\n";
        let err = prepare_training_data(&loaded(csv, "Label"), 0.2, 1).unwrap_err();
        assert!(matches!(err, DatasetError::EmptyDataset));
    }

    #[test]
    fn test_split_is_stratified_and_seeded() {
        let labels: Vec<usize> = (0..100).map(|i| if i < 80 { 0 } else { 1 }).collect();
        let (train, val) = train_val_split(&labels, 2, 0.2, 42);
        assert_eq!(val.len(), 20);
        assert_eq!(val.iter().filter(|&&i| labels[i] == 1).count(), 4);
        assert_eq!(train.len(), 80);
        assert_eq!(train_val_split(&labels, 2, 0.2, 42), (train, val));
    }

    #[test]
    fn test_split_falls_back_without_stratification() {
        let labels = vec![0, 0, 0, 0, 1];
        let (train, val) = train_val_split(&labels, 2, 0.2, 3);
        assert_eq!(val.len(), 1);
        assert_eq!(train.len(), 4);
    }
}
