//! Label Codec and Class Weighting

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Maps class strings to a dense index space (sorted order) and back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelCodec {
    classes: Vec<String>,
}

impl LabelCodec {
    /// Build from the distinct trimmed, non-empty labels.
    pub fn fit<'a, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let classes: BTreeSet<String> = labels
            .into_iter()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Self { classes: classes.into_iter().collect() }
    }

    /// Rebuild from a persisted class list, order kept verbatim.
    pub fn from_class_names(classes: Vec<String>) -> Self {
        Self { classes }
    }

    /// Index of a label
    pub fn encode(&self, label: &str) -> Option<usize> {
        let label = label.trim();
        self.classes.iter().position(|c| c == label)
    }

    /// Class name of an index
    pub fn decode(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }

    /// Ordered class names
    pub fn class_names(&self) -> &[String] {
        &self.classes
    }

    /// Number of classes
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }
}

/// Balanced class weights: `n_total / (n_classes * count_c)`, 0 for absent classes.
pub fn class_weights(labels: &[usize], n_classes: usize) -> Vec<f64> {
    let mut counts = vec![0usize; n_classes];
    for &y in labels {
        counts[y] += 1;
    }
    let total = labels.len() as f64;
    counts
        .iter()
        .map(|&count| {
            if count == 0 {
                0.0
            } else {
                total / (n_classes as f64 * count as f64)
            }
        })
        .collect()
}
