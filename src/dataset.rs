//! Dataset Loader
//!
//! Reads CICIDS2017 / UNSW-NB15 style CSV exports, either one file or a
//! directory of daily captures, and works out which column holds the label.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Label column names, in priority order.
pub const LABEL_CANDIDATES: [&str; 5] = ["label", "Label", "attack_cat", "attack", "Attack"];

/// Default label column of CICIDS2017 directory exports.
pub const CICIDS_LABEL_COLUMN: &str = "Label";

/// Default file pattern for directory loading.
pub const DEFAULT_PATTERN: &str = "*.csv";

const NA_TOKENS: [&str; 7] = ["NA", "N/A", "NaN", "nan", "null", "NULL", "None"];

/// Dataset errors
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Path missing or nothing readable under it
    #[error("dataset not found: {0}")]
    NotFound(String),
    /// Requested label column absent
    #[error("label column '{column}' not in {available:?}")]
    MissingLabelColumn {
        /// Requested name
        column: String,
        /// Headers present
        available: Vec<String>,
    },
    /// Nothing numeric left after dropping id/text columns
    #[error("no numeric features found after dropping non-informative columns")]
    NoFeatures,
    /// No rows survived cleaning
    #[error("no usable rows left after cleaning")]
    EmptyDataset,
    /// Input narrower than the trained feature set
    #[error("expected {expected} features, got {got}")]
    FeatureMismatch {
        /// Trained feature count
        expected: usize,
        /// Columns supplied
        got: usize,
    },
    /// Malformed CSV
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether a raw cell counts as missing.
pub fn is_missing(cell: &str) -> bool {
    let cell = cell.trim();
    cell.is_empty() || NA_TOKENS.contains(&cell)
}

/// Rows x named columns of raw string cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    /// Column names, as they appear in the header row
    pub headers: Vec<String>,
    /// Rows, each padded or cut to `headers.len()`
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    /// Create an empty table with the given header
    pub fn new(headers: Vec<String>) -> Self {
        Self { headers, rows: Vec::new() }
    }

    /// Parse CSV from any reader, keeping at most `max_rows` data rows.
    pub fn from_reader<R: Read>(reader: R, max_rows: Option<usize>) -> Result<Self, DatasetError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers = dedupe_headers(rdr.headers()?.iter());
        let width = headers.len();
        let limit = max_rows.unwrap_or(usize::MAX);

        let mut rows = Vec::new();
        for record in rdr.records() {
            if rows.len() >= limit {
                break;
            }
            let record = record?;
            let mut row: Vec<String> = record.iter().take(width).map(str::to_string).collect();
            row.resize(width, String::new());
            rows.push(row);
        }

        Ok(Self { headers, rows })
    }

    /// Parse an in-memory CSV upload
    pub fn from_csv_bytes(bytes: &[u8], max_rows: Option<usize>) -> Result<Self, DatasetError> {
        Self::from_reader(bytes, max_rows)
    }

    /// Read a CSV file
    pub fn from_path(path: &Path, max_rows: Option<usize>) -> Result<Self, DatasetError> {
        let file = File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file), max_rows)
    }

    /// Write the table as CSV
    pub fn write_csv(&self, path: &Path) -> Result<(), DatasetError> {
        let mut wtr = csv::Writer::from_path(path)?;
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Number of data rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when there are no data rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by exact name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Cells of one column
    pub fn column(&self, idx: usize) -> impl Iterator<Item = &str> + '_ {
        self.rows.iter().map(move |r| r[idx].as_str())
    }

    /// Remove a column, returning its cells
    pub fn remove_column(&mut self, idx: usize) -> Vec<String> {
        self.headers.remove(idx);
        self.rows.iter_mut().map(|r| r.remove(idx)).collect()
    }

    /// Drop trailing rows beyond `n`
    pub fn truncate(&mut self, n: usize) {
        self.rows.truncate(n);
    }

    /// Append `other` row-wise, aligning columns by name. Columns unknown
    /// so far are added; cells absent on either side stay empty.
    pub fn append(&mut self, other: RawTable) {
        let mut mapping = Vec::with_capacity(other.headers.len());
        for name in &other.headers {
            let idx = match self.column_index(name) {
                Some(idx) => idx,
                None => {
                    self.headers.push(name.clone());
                    for row in &mut self.rows {
                        row.push(String::new());
                    }
                    self.headers.len() - 1
                }
            };
            mapping.push(idx);
        }

        let width = self.headers.len();
        for row in other.rows {
            let mut aligned = vec![String::new(); width];
            for (cell, &idx) in row.into_iter().zip(&mapping) {
                aligned[idx] = cell;
            }
            self.rows.push(aligned);
        }
    }
}

/// Suffix repeated header names as `name.1`, `name.2`, ... so every column
/// is addressable by name. CICIDS2017 exports repeat ` Fwd Header Length`.
fn dedupe_headers<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    let raw: Vec<&str> = raw.collect();
    let mut taken: HashSet<String> = raw.iter().map(|h| h.to_string()).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut headers = Vec::with_capacity(raw.len());
    for name in raw {
        if seen.insert(name) {
            headers.push(name.to_string());
            continue;
        }
        let mut k = 1;
        let mut candidate = format!("{name}.{k}");
        while taken.contains(&candidate) {
            k += 1;
            candidate = format!("{name}.{k}");
        }
        taken.insert(candidate.clone());
        headers.push(candidate);
    }
    headers
}

/// Dataset flavour, inferred from the label column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetDialect {
    /// CICIDS2017-like (few classes, BENIGN/normal labels)
    Cicids,
    /// UNSW-NB15-like
    Unsw,
}

/// A loaded table with its resolved label column
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    /// Raw table, label column included
    pub table: RawTable,
    /// Header name of the label column
    pub label_column: String,
    /// Inferred dialect
    pub dialect: DatasetDialect,
    /// Files that contributed rows
    pub files: Vec<PathBuf>,
}

/// Infer the label column from known schema names, falling back to the last column.
pub fn infer_label_column(headers: &[String]) -> Option<String> {
    for candidate in LABEL_CANDIDATES {
        if let Some(h) = headers.iter().find(|h| h.as_str() == candidate) {
            return Some(h.clone());
        }
    }
    for candidate in LABEL_CANDIDATES {
        if let Some(h) = headers.iter().find(|h| h.trim() == candidate) {
            return Some(h.clone());
        }
    }
    headers.last().cloned()
}

fn resolve_label_column(table: &RawTable, explicit: Option<&str>) -> Result<String, DatasetError> {
    let missing = |column: &str| DatasetError::MissingLabelColumn {
        column: column.to_string(),
        available: table.headers.clone(),
    };
    match explicit {
        Some(name) => table
            .headers
            .iter()
            .find(|h| h.as_str() == name)
            .or_else(|| table.headers.iter().find(|h| h.trim() == name.trim()))
            .cloned()
            .ok_or_else(|| missing(name)),
        None => infer_label_column(&table.headers).ok_or_else(|| missing("<inferred>")),
    }
}

/// Guess whether the table is CICIDS2017- or UNSW-NB15-shaped.
pub fn infer_dialect(table: &RawTable, label_column: &str) -> DatasetDialect {
    let Some(idx) = table.column_index(label_column) else {
        return DatasetDialect::Unsw;
    };
    let present: Vec<&str> = table.column(idx).filter(|c| !is_missing(c)).collect();
    let Some(first) = present.first() else {
        return DatasetDialect::Unsw;
    };
    let sample = first.trim().to_lowercase();
    let distinct: HashSet<&str> = present.iter().map(|c| c.trim()).collect();
    if sample.contains("normal") || sample == "0" || sample == "1" || distinct.len() <= 15 {
        DatasetDialect::Cicids
    } else {
        DatasetDialect::Unsw
    }
}

/// Load a single CSV file.
pub fn load_table(
    path: &Path,
    label_column: Option<&str>,
    max_rows: Option<usize>,
) -> Result<LoadedDataset, DatasetError> {
    if !path.is_file() {
        return Err(DatasetError::NotFound(path.display().to_string()));
    }
    let table = RawTable::from_path(path, max_rows)?;
    let label_column = resolve_label_column(&table, label_column)?;
    let dialect = infer_dialect(&table, &label_column);

    tracing::info!(
        "Loaded {} rows x {} columns from {} (label: {:?}, dialect: {:?})",
        table.len(),
        table.headers.len(),
        path.display(),
        label_column,
        dialect
    );

    Ok(LoadedDataset {
        table,
        label_column,
        dialect,
        files: vec![path.to_path_buf()],
    })
}

/// Load and concatenate every file in `dir` whose name matches `pattern`.
pub fn load_directory(
    dir: &Path,
    pattern: &str,
    label_column: Option<&str>,
    max_rows_per_file: Option<usize>,
    max_rows_total: Option<usize>,
) -> Result<LoadedDataset, DatasetError> {
    if !dir.is_dir() {
        return Err(DatasetError::NotFound(dir.display().to_string()));
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| wildcard_match(pattern, n))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let canonical = label_column.unwrap_or(CICIDS_LABEL_COLUMN).to_string();
    let mut combined: Option<RawTable> = None;
    let mut files = Vec::new();

    for path in paths {
        let mut table = match RawTable::from_path(&path, max_rows_per_file) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Skipping unreadable file {}: {}", path.display(), e);
                continue;
            }
        };

        if table.column_index(&canonical).is_none() {
            let Some(found) = infer_label_column(&table.headers) else {
                tracing::warn!("Skipping {}: no columns", path.display());
                continue;
            };
            tracing::debug!(
                "{} has no '{}' column, using inferred '{}'",
                path.display(),
                canonical,
                found
            );
            if let Some(idx) = table.column_index(&found) {
                table.headers[idx] = canonical.clone();
            }
        }

        files.push(path);
        let total = match combined.as_mut() {
            Some(acc) => {
                acc.append(table);
                acc.len()
            }
            None => {
                let n = table.len();
                combined = Some(table);
                n
            }
        };

        if max_rows_total.map(|cap| total >= cap).unwrap_or(false) {
            break;
        }
    }

    let Some(mut table) = combined else {
        return Err(DatasetError::NotFound(format!(
            "no readable files in {} matching {}",
            dir.display(),
            pattern
        )));
    };
    if let Some(cap) = max_rows_total {
        table.truncate(cap);
    }

    let dialect = infer_dialect(&table, &canonical);
    tracing::info!(
        "Loaded {} rows from {} files in {} (dialect: {:?})",
        table.len(),
        files.len(),
        dir.display(),
        dialect
    );

    Ok(LoadedDataset {
        table,
        label_column: canonical,
        dialect,
        files,
    })
}

/// Shell-style match supporting `*` and `?`.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Synthetic 20-feature table with an imbalanced `Normal`/`Attack` label.
///
/// Attack rows are shifted on the first five features so the table is learnable.
pub fn sample_table(rows: usize, seed: u64) -> RawTable {
    const LABELS: [&str; 5] = ["Normal", "Normal", "Normal", "Attack", "Attack"];
    let mut rng = StdRng::seed_from_u64(seed);

    let mut headers: Vec<String> = (1..=20).map(|i| format!("f{i}")).collect();
    headers.push("label".into());
    let mut table = RawTable::new(headers);

    for _ in 0..rows {
        let label = LABELS[rng.gen_range(0..LABELS.len())];
        let shift = if label == "Attack" { 1.5 } else { 0.0 };
        let mut row: Vec<String> = (0..20)
            .map(|i| {
                let v = gaussian(&mut rng) + if i < 5 { shift } else { 0.0 };
                format!("{:.4}", v)
            })
            .collect();
        row.push(label.to_string());
        table.rows.push(row);
    }
    table
}

/// Write [`sample_table`] to disk.
pub fn write_sample_csv(path: &Path, rows: usize, seed: u64) -> Result<(), DatasetError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    sample_table(rows, seed).write_csv(path)
}

// Box-Muller
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_infer_label_column_priority() {
        let headers: Vec<String> = vec!["a".into(), "attack_cat".into(), "label".into()];
        assert_eq!(infer_label_column(&headers).as_deref(), Some("label"));

        let headers: Vec<String> = vec!["a".into(), " Label".into(), "b".into()];
        assert_eq!(infer_label_column(&headers).as_deref(), Some(" Label"));

        let headers: Vec<String> = vec!["a".into(), "b".into(), "outcome".into()];
        assert_eq!(infer_label_column(&headers).as_deref(), Some("outcome"));
    }

    #[test]
    fn test_flexible_rows_are_padded() {
        let table = RawTable::from_csv_bytes(b"a,b,c\n1,2\n4,5,6,7\n", None).unwrap();
        assert_eq!(table.rows[0], vec!["1", "2", ""]);
        assert_eq!(table.rows[1], vec!["4", "5", "6"]);
    }

    #[test]
    fn test_repeated_headers_are_suffixed() {
        let table = RawTable::from_csv_bytes(b"h,h,h.1,h,Label\n1,2,3,4,x\n", None).unwrap();
        assert_eq!(table.headers, vec!["h", "h.2", "h.1", "h.3", "Label"]);

        let cicids = RawTable::from_csv_bytes(
            b" Fwd Header Length,x, Fwd Header Length\n2,0.5,200\n",
            None,
        )
        .unwrap();
        assert_eq!(cicids.headers, vec![" Fwd Header Length", "x", " Fwd Header Length.1"]);
    }

    #[test]
    fn test_load_directory_keeps_repeated_columns_apart() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.csv", "h,h,Label\n1,10,BENIGN\n");
        write(dir.path(), "b.csv", "h,h,Label\n2,20,DoS\n");

        let ds = load_directory(dir.path(), "*.csv", None, None, None).unwrap();
        assert_eq!(ds.table.headers, vec!["h", "h.1", "Label"]);
        assert_eq!(ds.table.rows, vec![vec!["1", "10", "BENIGN"], vec!["2", "20", "DoS"]]);
    }

    #[test]
    fn test_load_table_missing_file() {
        let err = load_table(Path::new("/nonexistent/flows.csv"), None, None).unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }

    #[test]
    fn test_load_table_explicit_label_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.csv", "x,y\n1,2\n");
        let err = load_table(&path, Some("Label"), None).unwrap_err();
        assert!(matches!(err, DatasetError::MissingLabelColumn { .. }));
    }

    #[test]
    fn test_load_directory_skips_bad_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "monday.csv", "x,Label\n1,BENIGN\n2,BENIGN\n3,DoS\n");
        write(dir.path(), "tuesday.csv", "x,y,label\n4,9,PortScan\n5,9,BENIGN\n");
        write(dir.path(), "notes.txt", "ignored");
        std::fs::write(dir.path().join("a_broken.csv"), b"x,Label\n\xff\xfe,1\n").unwrap();

        let ds = load_directory(dir.path(), "*.csv", None, Some(2), None).unwrap();
        assert_eq!(ds.label_column, "Label");
        assert_eq!(ds.files.len(), 2);
        assert_eq!(ds.table.len(), 4);
        assert_eq!(ds.table.headers, vec!["x", "Label", "y"]);
        let label_idx = ds.table.column_index("Label").unwrap();
        let labels: Vec<&str> = ds.table.column(label_idx).collect();
        assert_eq!(labels, vec!["BENIGN", "BENIGN", "PortScan", "BENIGN"]);
        assert_eq!(ds.table.rows[0][2], "");

        let capped = load_directory(dir.path(), "*.csv", None, None, Some(3)).unwrap();
        assert_eq!(capped.table.len(), 3);
        assert_eq!(capped.files.len(), 1);
    }

    #[test]
    fn test_load_directory_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_directory(dir.path(), "*.csv", None, None, None).unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }

    #[test]
    fn test_dialect() {
        let table = RawTable::from_csv_bytes(b"x,Label\n1,BENIGN\n2,DDoS\n", None).unwrap();
        assert_eq!(infer_dialect(&table, "Label"), DatasetDialect::Cicids);

        let mut body = String::from("x,attack_cat\n");
        for i in 0..20 {
            body.push_str(&format!("{i},Exploit{i}\n"));
        }
        let table = RawTable::from_csv_bytes(body.as_bytes(), None).unwrap();
        assert_eq!(infer_dialect(&table, "attack_cat"), DatasetDialect::Unsw);
    }

    #[test]
    fn test_wildcard() {
        assert!(wildcard_match("*.csv", "Monday-WorkingHours.pcap_ISCX.csv"));
        assert!(wildcard_match("day?.csv", "day1.csv"));
        assert!(!wildcard_match("*.csv", "readme.md"));
        assert!(wildcard_match("*", ""));
    }

    #[test]
    fn test_sample_table_is_deterministic() {
        let a = sample_table(50, 7);
        let b = sample_table(50, 7);
        assert_eq!(a, b);
        assert_eq!(a.headers.len(), 21);
        assert!(a.rows.iter().all(|r| r[20] == "Normal" || r[20] == "Attack"));
    }
}
