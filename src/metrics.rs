//! Classification Metrics

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Precision / recall / F1 for one class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    /// Class name
    pub class: String,
    /// Precision (0 when nothing was predicted as this class)
    pub precision: f64,
    /// Recall (0 when the class has no support)
    pub recall: f64,
    /// F1 score
    pub f1: f64,
    /// Number of true samples
    pub support: usize,
}

/// Fraction of exact matches; 0 for empty input.
pub fn accuracy(y_true: &[usize], y_pred: &[usize]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    correct as f64 / y_true.len() as f64
}

/// `n × n` confusion matrix, rows true, columns predicted.
pub fn confusion_matrix(y_true: &[usize], y_pred: &[usize], n_classes: usize) -> Vec<Vec<usize>> {
    let mut matrix = vec![vec![0usize; n_classes]; n_classes];
    for (&t, &p) in y_true.iter().zip(y_pred) {
        if t < n_classes && p < n_classes {
            matrix[t][p] += 1;
        }
    }
    matrix
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

/// Per-class metrics from a confusion matrix.
pub fn per_class_metrics(confusion: &[Vec<usize>], class_names: &[String]) -> Vec<ClassMetrics> {
    let n = confusion.len();
    (0..n)
        .map(|c| {
            let tp = confusion[c][c];
            let support: usize = confusion[c].iter().sum();
            let predicted: usize = confusion.iter().map(|row| row[c]).sum();
            let precision = ratio(tp, predicted);
            let recall = ratio(tp, support);
            ClassMetrics {
                class: class_names.get(c).cloned().unwrap_or_else(|| c.to_string()),
                precision,
                recall,
                f1: f1(precision, recall),
                support,
            }
        })
        .collect()
}

/// Macro F1 over the classes present in `y_true ∪ y_pred`.
pub fn macro_f1(y_true: &[usize], y_pred: &[usize], n_classes: usize) -> f64 {
    let present: BTreeSet<usize> = y_true
        .iter()
        .chain(y_pred)
        .copied()
        .filter(|&c| c < n_classes)
        .collect();
    if present.is_empty() {
        return 0.0;
    }
    let metrics = per_class_metrics(&confusion_matrix(y_true, y_pred, n_classes), &[]);
    present.iter().map(|&c| metrics[c].f1).sum::<f64>() / present.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(&[0, 1, 1, 2], &[0, 1, 0, 2]), 0.75);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn test_confusion_matrix_orientation() {
        let cm = confusion_matrix(&[0, 0, 1, 2], &[0, 1, 1, 1], 3);
        assert_eq!(cm, vec![vec![1, 1, 0], vec![0, 1, 0], vec![0, 1, 0]]);
    }

    #[test]
    fn test_per_class_zero_division() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let cm = confusion_matrix(&[0, 0, 1, 2], &[0, 1, 1, 1], 3);
        let m = per_class_metrics(&cm, &names);
        assert_eq!(m[0].precision, 1.0);
        assert_eq!(m[0].recall, 0.5);
        assert_eq!(m[1].precision, 1.0 / 3.0);
        assert_eq!(m[2].precision, 0.0);
        assert_eq!(m[2].f1, 0.0);
        assert_eq!(m[2].support, 1);
    }

    #[test]
    fn test_macro_f1_ignores_absent_classes() {
        // class 2 never appears in either vector
        let f = macro_f1(&[0, 0, 1, 1], &[0, 0, 1, 1], 3);
        assert!((f - 1.0).abs() < 1e-12);

        let f = macro_f1(&[0, 0, 1, 1], &[0, 1, 1, 1], 3);
        let f0 = 2.0 * 1.0 * 0.5 / 1.5;
        let f1 = 2.0 * (2.0 / 3.0) * 1.0 / (2.0 / 3.0 + 1.0);
        assert!((f - (f0 + f1) / 2.0).abs() < 1e-12);
    }
}
