//! FlowGuard CLI
//!
//! # Usage
//!
//! ```bash
//! flowguard generate-sample --output data/sample.csv --rows 2000
//! flowguard train --data data/sample.csv --output artifacts --epochs 20
//! flowguard train --data data/MachineLearningCVE --max-rows-total 200000
//! flowguard evaluate --data data/test.csv --artifacts artifacts --output metrics.json
//! FLOWGUARD_ARTIFACTS=artifacts flowguard serve --bind 127.0.0.1:8000
//! ```

use clap::{Parser, Subcommand};
use flowguard::config::{AttributionMode, ServiceConfig, TrainConfig};
use flowguard::dataset::{self, LoadedDataset, DEFAULT_PATTERN};
use flowguard::{api, AnalysisStore, Evaluator, InferenceService, Trainer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flowguard")]
#[command(version)]
#[command(about = "Network flow attack classifier", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model and write the artifact bundle
    Train {
        /// CSV file or directory of CSV files
        #[arg(long)]
        data: PathBuf,
        /// Artifact output directory
        #[arg(long, short, default_value = "artifacts")]
        output: PathBuf,
        /// Label column (inferred when omitted)
        #[arg(long)]
        label_column: Option<String>,
        /// File pattern when `data` is a directory
        #[arg(long, default_value = DEFAULT_PATTERN)]
        pattern: String,
        /// Row cap per file
        #[arg(long)]
        max_rows_per_file: Option<usize>,
        /// Row cap overall
        #[arg(long)]
        max_rows_total: Option<usize>,
        #[arg(long, default_value_t = 50)]
        epochs: usize,
        #[arg(long, default_value_t = 256)]
        batch_size: usize,
        #[arg(long, default_value_t = 1e-3)]
        lr: f64,
        /// Hidden widths, comma separated
        #[arg(long, value_delimiter = ',', default_values_t = [128usize, 64, 32])]
        hidden_dims: Vec<usize>,
        #[arg(long, default_value_t = 0.3)]
        dropout: f64,
        /// Validation fraction
        #[arg(long, default_value_t = 0.2)]
        test_size: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Background rows kept for sampling explanations (0 disables)
        #[arg(long, default_value_t = 50)]
        background_size: usize,
    },
    /// Score a trained bundle on labelled data
    Evaluate {
        /// CSV file or directory of CSV files
        #[arg(long)]
        data: PathBuf,
        /// Artifact directory
        #[arg(long, short, default_value = "artifacts")]
        artifacts: PathBuf,
        /// Label column (inferred when omitted)
        #[arg(long)]
        label_column: Option<String>,
        /// Write the report here as JSON
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Run the HTTP API
    Serve {
        /// Artifact directory (overrides config)
        #[arg(long)]
        artifacts: Option<PathBuf>,
        /// Listen address (overrides config)
        #[arg(long)]
        bind: Option<String>,
        /// Attribution method for explanations
        #[arg(long, value_enum)]
        attribution: Option<Attribution>,
    },
    /// Write a synthetic labelled CSV
    GenerateSample {
        #[arg(long, short, default_value = "data/sample.csv")]
        output: PathBuf,
        #[arg(long, default_value_t = 1000)]
        rows: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Attribution {
    Auto,
    Gradient,
    Sampling,
}

impl From<Attribution> for AttributionMode {
    fn from(a: Attribution) -> Self {
        match a {
            Attribution::Auto => AttributionMode::Auto,
            Attribution::Gradient => AttributionMode::Gradient,
            Attribution::Sampling => AttributionMode::Sampling,
        }
    }
}

fn load_data(
    path: &Path,
    pattern: &str,
    label_column: Option<&str>,
    max_rows_per_file: Option<usize>,
    max_rows_total: Option<usize>,
) -> Result<LoadedDataset, dataset::DatasetError> {
    if path.is_dir() {
        dataset::load_directory(path, pattern, label_column, max_rows_per_file, max_rows_total)
    } else {
        dataset::load_table(path, label_column, max_rows_total.or(max_rows_per_file))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            data,
            output,
            label_column,
            pattern,
            max_rows_per_file,
            max_rows_total,
            epochs,
            batch_size,
            lr,
            hidden_dims,
            dropout,
            test_size,
            seed,
            background_size,
        } => {
            let config = TrainConfig {
                epochs,
                batch_size,
                learning_rate: lr,
                hidden_dims,
                dropout,
                test_size,
                seed,
                background_size,
            };
            let dataset = load_data(
                &data,
                &pattern,
                label_column.as_deref(),
                max_rows_per_file,
                max_rows_total,
            )?;
            let mut trainer = Trainer::new(config);
            let bundle = tokio::task::spawn_blocking(move || trainer.fit(&dataset).map(|b| (trainer, b)))
                .await?;
            let (mut trainer, bundle) = bundle?;
            trainer.persist(&bundle, &output)?;
            tracing::info!("Run {} complete", bundle.metadata.run_id);
        }
        Commands::Evaluate { data, artifacts, label_column, output } => {
            let dataset = load_data(&data, DEFAULT_PATTERN, label_column.as_deref(), None, None)?;
            let evaluator = Evaluator::from_dir(&artifacts)?;
            let report = evaluator.evaluate(&dataset)?;

            println!("Accuracy: {:.4}", report.accuracy);
            println!("Macro F1: {:.4}", report.f1_macro);
            for m in &report.per_class {
                println!(
                    "  {:<30} precision {:.4}  recall {:.4}  f1 {:.4}  support {}",
                    m.class, m.precision, m.recall, m.f1, m.support
                );
            }
            if let Some(path) = output {
                report.save(&path)?;
                tracing::info!("Metrics written to {}", path.display());
            }
        }
        Commands::Serve { artifacts, bind, attribution } => {
            let mut config = ServiceConfig::from_env();
            if let Some(dir) = artifacts {
                config.artifacts_dir = dir;
            }
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(mode) = attribution {
                config.attribution = mode.into();
            }

            tracing::info!("FlowGuard v{}", env!("CARGO_PKG_VERSION"));
            let addr = config.bind.clone();
            let service = Arc::new(InferenceService::new(config, Arc::new(AnalysisStore::new())));
            api::serve(service, &addr).await?;
        }
        Commands::GenerateSample { output, rows, seed } => {
            dataset::write_sample_csv(&output, rows, seed)?;
            tracing::info!("Wrote {} sample rows to {}", rows, output.display());
        }
    }

    Ok(())
}
