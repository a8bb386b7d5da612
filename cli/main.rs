#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use itertools::Itertools;
use serde::Serialize;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process;

use growthcast::artifact::write_atomic;
use growthcast::config::{PipelineConfig, SplitKind};
use growthcast::estimate::{RegressionMetrics, TrainingOutcome, compare_splits, run_training};
use growthcast::features::FeatureMode;
use growthcast::service::{ScoreError, ServingState};

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeCli {
    Lagged,
    Concurrent,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum SplitCli {
    Temporal,
    Random,
}

/// Options shared by every subcommand. Each one overrides the matching key of
/// the configuration file.
#[derive(Args, Clone)]
pub struct PipelineArgs {
    /// TOML configuration file; every key is optional
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Dataset CSV file
    #[arg(long, value_name = "PATH")]
    pub dataset: Option<PathBuf>,

    /// Feature engineering mode
    #[arg(long, value_enum)]
    pub mode: Option<ModeCli>,

    /// Train/test split strategy
    #[arg(long, value_enum)]
    pub split: Option<SplitCli>,

    /// First year of the held-out set for the temporal split
    #[arg(long, value_name = "YEAR")]
    pub split_year: Option<i64>,

    /// Held-out fraction for the random split, strictly between 0 and 1
    #[arg(long, value_name = "P")]
    pub test_fraction: Option<f64>,

    /// Model artifact path
    #[arg(long, value_name = "PATH")]
    pub model: Option<PathBuf>,

    /// Encoder artifact path
    #[arg(long, value_name = "PATH")]
    pub encoder: Option<PathBuf>,
}

impl PipelineArgs {
    fn resolve(&self) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(path) = &self.dataset {
            config.dataset_path = path.clone();
        }
        if let Some(mode) = self.mode {
            config.feature_mode = match mode {
                ModeCli::Lagged => FeatureMode::Lagged,
                ModeCli::Concurrent => FeatureMode::Concurrent,
            };
        }
        if let Some(split) = self.split {
            config.split.kind = match split {
                SplitCli::Temporal => SplitKind::Temporal,
                SplitCli::Random => SplitKind::Random,
            };
        }
        if let Some(year) = self.split_year {
            config.split.threshold_year = year;
        }
        if let Some(fraction) = self.test_fraction {
            config.split.test_fraction = fraction;
        }
        if let Some(path) = &self.model {
            config.model_path = path.clone();
        }
        if let Some(path) = &self.encoder {
            config.encoder_path = path.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn serving_state(&self) -> Result<ServingState, Box<dyn std::error::Error>> {
        Ok(ServingState::load(self.resolve()?)?)
    }
}

#[derive(Parser)]
#[command(
    name = "growthcast",
    about = "GDP growth-rate regression: train, evaluate and score",
    long_about = "Trains a random forest relating national growth-rate indicators to GDP growth, \
                 persists the model and its country encoder, and scores prediction requests."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the model and write the model and encoder artifacts
    #[command(about = "Train the model (outputs: model.toml, encoder.toml)")]
    Train {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Compare the random split against the temporal split without saving anything
    #[command(about = "Compare random and temporal split evaluation")]
    Evaluate {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Also write the comparison as a plain-text report
        #[arg(long, value_name = "PATH")]
        report: Option<PathBuf>,
    },

    /// Score one JSON request read from a file, or from stdin when omitted or '-'
    #[command(about = "Score one prediction request")]
    Predict {
        #[command(flatten)]
        pipeline: PipelineArgs,

        #[arg(value_name = "REQUEST_JSON")]
        request: Option<PathBuf>,
    },

    /// List the countries present in the dataset
    #[command(about = "List all countries")]
    Countries {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Print the chronological history of one country
    #[command(about = "Historical data for one country")]
    History {
        #[arg(value_name = "COUNTRY")]
        country: String,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Print the neutral scenario, optionally scored for one country
    #[command(about = "Baseline scenario with every indicator at 2%")]
    Baseline {
        #[arg(long, value_name = "COUNTRY")]
        country: Option<String>,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Describe the loaded model, encoder and dataset
    #[command(about = "Service information")]
    Info {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Train { pipeline }) => train(&pipeline),
        Some(Commands::Evaluate { pipeline, report }) => evaluate(&pipeline, report),
        Some(Commands::Predict { pipeline, request }) => predict(&pipeline, request),
        Some(Commands::Countries { pipeline }) => {
            pipeline
                .serving_state()
                .and_then(|state| print_json(&state.list_entities()))
        }
        Some(Commands::History { country, pipeline }) => pipeline
            .serving_state()
            .and_then(|state| print_json(&state.history(&country)?)),
        Some(Commands::Baseline { country, pipeline }) => baseline(&pipeline, country),
        Some(Commands::Info { pipeline }) => pipeline
            .serving_state()
            .and_then(|state| print_json(&state.status())),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn train(pipeline: &PipelineArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = pipeline.resolve()?;
    println!("Loading data from: {}", config.dataset_path.display());
    println!("Feature mode: {}", config.feature_mode.describe());

    let outcome = run_training(&config)?;
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &TrainingOutcome) {
    println!(
        "Loaded {} observations for {} countries",
        outcome.dataset_rows, outcome.entity_count
    );
    if let Some((first, last)) = outcome.time_range {
        println!("Years: {first} - {last}");
    }
    println!(
        "Engineered {} rows ({} dropped for missing values)",
        outcome.engineered_rows, outcome.dropped_rows
    );
    println!(
        "Split {}: {} training rows, {} test rows",
        outcome.split_description, outcome.train_rows, outcome.test_rows
    );

    println!("\nModel Performance:");
    println!("{}", "=".repeat(60));
    print_metrics("Training Set", &outcome.train_metrics);
    print_metrics("Test Set", &outcome.test_metrics);
    println!("Verdict: {}", outcome.overfitting);
    println!("{}", "=".repeat(60));

    println!("\nFeature Importance:");
    println!(
        "{}",
        outcome
            .importances
            .iter()
            .map(|(name, importance)| format!("   {name}: {importance:.4}"))
            .join("\n")
    );

    println!("\nModel saved to: {}", outcome.model_path.display());
    println!("Encoder saved to: {}", outcome.encoder_path.display());

    if let Some(example) = &outcome.example {
        println!("\nExample Prediction ({} {}):", example.entity, example.time);
        println!("   Predicted GDP Growth: {:.2}%", example.predicted);
        println!("   Actual GDP Growth: {:.2}%", example.actual);
        println!("   Error: {:.2}%", example.abs_error);
    }
}

fn print_metrics(label: &str, metrics: &RegressionMetrics) {
    println!("{label} ({} rows):", metrics.n);
    println!("   R2 Score: {:.4}", metrics.r2);
    println!("   RMSE: {:.4}", metrics.rmse);
    println!("   MAE: {:.4}", metrics.mae);
    println!("   MAPE: {:.2}%", metrics.mape);
}

fn evaluate(
    pipeline: &PipelineArgs,
    report: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = pipeline.resolve()?;
    let comparison = compare_splits(&config)?;
    let text = comparison.report();
    print!("{text}");
    if let Some(path) = report {
        write_atomic(&path, text.as_bytes())?;
        println!("Report written to: {}", path.display());
    }
    Ok(())
}

fn predict(
    pipeline: &PipelineArgs,
    request: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = pipeline.serving_state()?;
    let text = match request {
        Some(path) if path.as_os_str() != "-" => fs::read_to_string(&path)?,
        _ => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let body: serde_json::Value = serde_json::from_str(&text)?;

    match state.score(&body) {
        Ok(response) => print_json(&response),
        Err(ScoreError::Invalid(err)) => {
            print_json(&err.payload(state.schema()))?;
            Err(err.into())
        }
        Err(other) => Err(other.into()),
    }
}

fn baseline(
    pipeline: &PipelineArgs,
    country: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = pipeline.serving_state()?;
    match country {
        Some(country) => match state.baseline_for(&country) {
            Ok(response) => print_json(&response),
            Err(ScoreError::Invalid(err)) => {
                print_json(&err.payload(state.schema()))?;
                Err(err.into())
            }
            Err(other) => Err(other.into()),
        },
        None => print_json(&state.baseline()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let release_tag = option_env!("GROWTHCAST_RELEASE_TAG");
    let build_timestamp: u64 = env!("GROWTHCAST_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("growthcast {version}");

    match release_tag {
        Some(tag) => println!("Release: {tag}"),
        None => println!("Release: development build"),
    }

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const YEAR: u64 = 365 * DAY;

    let (amount, unit) = if seconds < MINUTE {
        return format!("{seconds} seconds ago");
    } else if seconds < HOUR {
        (seconds as f64 / MINUTE as f64, "minutes")
    } else if seconds < DAY {
        (seconds as f64 / HOUR as f64, "hours")
    } else if seconds < YEAR {
        (seconds as f64 / DAY as f64, "days")
    } else {
        (seconds as f64 / YEAR as f64, "years")
    };
    format!("{amount:.1} {unit} ago")
}
