//! `flip` command-line front end.
//!
//! Usage:
//!   flip score --volatility 10000 --amount 100 --success-rate 990000 --stake 200000 --hour 10 --tokens
//!   flip calibrate --input calibration.json
//!   flip backtest --predictions preds.json --outcomes outcomes.json --cv 5
//!   flip models list
//!   flip models show flip_xgboost_20250301_090000

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use flip_backend::calibration::{cross_validate_held_out, cross_validate_in_sample};
use flip_backend::model_store::ModelStore;
use flip_backend::models::TOKEN;
use flip_backend::{EngineConfig, OutcomeRecord, PredictionRecord, RedemptionContext};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// FLIP redemption settlement decision engine
#[derive(Parser, Debug)]
#[command(name = "flip")]
#[command(about = "Score, calibrate and backtest FLIP settlement decisions")]
struct Cli {
    /// TOML config file (defaults to FLIP_CONFIG_PATH, then built-in defaults)
    #[arg(short, long, env = "FLIP_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Score one redemption with the deterministic scorer
    Score {
        /// Price volatility in ppm (10000 = 1%)
        #[arg(long)]
        volatility: u64,
        /// Redemption amount (smallest unit, or whole tokens with --tokens)
        #[arg(long)]
        amount: u128,
        /// Agent success rate in ppm
        #[arg(long)]
        success_rate: u64,
        /// Agent stake (smallest unit, or whole tokens with --tokens)
        #[arg(long)]
        stake: u128,
        /// Hour of day, 0-23
        #[arg(long)]
        hour: u8,
        /// Interpret amount and stake as whole tokens
        #[arg(long)]
        tokens: bool,
    },

    /// Fit a conformal calibration and report held-out coverage
    Calibrate {
        /// JSON array of {"prediction": f64, "actual": 0|1}
        #[arg(short, long)]
        input: PathBuf,
        /// Override the configured alpha
        #[arg(long)]
        alpha: Option<f64>,
    },

    /// Backtest historical predictions against outcomes
    Backtest {
        /// JSON array of prediction records
        #[arg(short, long)]
        predictions: PathBuf,
        /// JSON array of outcome records
        #[arg(short, long)]
        outcomes: PathBuf,
        /// Also run k-fold cross-validation with this many folds
        #[arg(long)]
        cv: Option<usize>,
        /// Also run an out-of-sample test after this RFC 3339 timestamp
        #[arg(long)]
        cutoff: Option<DateTime<Utc>>,
        /// Run the out-of-sample test with the positional split
        #[arg(long)]
        holdout: bool,
    },

    /// Inspect stored models
    Models {
        /// Model database (overrides config)
        #[arg(long)]
        db_path: Option<PathBuf>,

        #[command(subcommand)]
        command: ModelCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ModelCommands {
    /// List stored model versions, newest first
    List {
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Show one version's metadata
    Show { version: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Label {
    Flag(bool),
    Indicator(u8),
}

#[derive(Deserialize)]
struct CalibrationRow {
    prediction: f64,
    actual: Label,
}

#[derive(Serialize)]
struct CalibrationOutput {
    model: flip_backend::CalibrationModel,
    in_sample: flip_backend::calibration::CoverageReport,
    cross_validated_in_sample: flip_backend::calibration::CrossValidatedCoverage,
    held_out: flip_backend::calibration::CrossValidatedCoverage,
    gate: flip_backend::calibration::GateVerdict,
}

#[derive(Serialize)]
struct BacktestOutput {
    metrics: flip_backend::BacktestMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    cross_validation: Option<flip_backend::backtest::CrossValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    out_of_sample: Option<flip_backend::backtest::OutOfSampleReport>,
}

fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config: {:?}", path))?,
        None => EngineConfig::from_env(),
    };
    config.validate()?;

    match cli.command {
        Commands::Score {
            volatility,
            amount,
            success_rate,
            stake,
            hour,
            tokens,
        } => {
            let scale = if tokens { TOKEN } else { 1 };
            let amount = amount.checked_mul(scale).context("amount overflows u128")?;
            let stake = stake.checked_mul(scale).context("stake overflows u128")?;
            let context = RedemptionContext::new(volatility, amount, success_rate, stake, hour)?;
            let result = config.scorer()?.score(&context)?;
            print_json(&result)?;
        }
        Commands::Calibrate { input, alpha } => {
            run_calibrate(&config, &input, alpha.unwrap_or(config.alpha))?
        }
        Commands::Backtest {
            predictions,
            outcomes,
            cv,
            cutoff,
            holdout,
        } => run_backtest(&config, &predictions, &outcomes, cv, cutoff, holdout)?,
        Commands::Models { db_path, command } => {
            let db_path = db_path.unwrap_or_else(|| PathBuf::from(&config.model_db_path));
            let store = ModelStore::new(&db_path)
                .with_context(|| format!("Failed to open model store: {:?}", db_path))?;
            match command {
                ModelCommands::List { name } => print_json(&store.list(name.as_deref())?)?,
                ModelCommands::Show { version } => {
                    let stored = store.load(&version)?;
                    print_json(&stored.metadata)?;
                }
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flip_backend=info,flip=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_calibrate(config: &EngineConfig, input: &Path, alpha: f64) -> Result<()> {
    let rows: Vec<CalibrationRow> = read_json(input)?;
    let mut predictions = Vec::with_capacity(rows.len());
    let mut actuals = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        let actual = match row.actual {
            Label::Flag(b) => b,
            Label::Indicator(0) => false,
            Label::Indicator(1) => true,
            Label::Indicator(other) => bail!("row {}: actual must be 0 or 1, got {}", i, other),
        };
        predictions.push(row.prediction);
        actuals.push(actual);
    }

    let calibrator = config.calibrator();
    let kfold = config.kfold()?;
    let (model, in_sample) =
        calibrator.fit_and_evaluate(&predictions, &actuals, alpha, config.target_coverage)?;
    let cross_validated_in_sample = cross_validate_in_sample(
        &calibrator,
        &predictions,
        &actuals,
        alpha,
        config.target_coverage,
        &kfold,
    )?;
    let held_out = cross_validate_held_out(
        &calibrator,
        &predictions,
        &actuals,
        alpha,
        config.target_coverage,
        &kfold,
    )?;
    let gate = config.calibration_gate().evaluate(&held_out);
    info!(
        passed = gate.passed,
        held_out_mean = held_out.mean_coverage,
        "Calibration gate evaluated"
    );

    print_json(&CalibrationOutput {
        model,
        in_sample,
        cross_validated_in_sample,
        held_out,
        gate,
    })
}

fn run_backtest(
    config: &EngineConfig,
    predictions: &Path,
    outcomes: &Path,
    cv: Option<usize>,
    cutoff: Option<DateTime<Utc>>,
    holdout: bool,
) -> Result<()> {
    let predictions: Vec<PredictionRecord> = read_json(predictions)?;
    let outcomes: Vec<OutcomeRecord> = read_json(outcomes)?;
    let harness = config.harness()?;

    let metrics = harness.backtest(&predictions, &outcomes)?;
    let cross_validation = cv
        .map(|k| harness.cross_validate(&predictions, &outcomes, k))
        .transpose()?;
    let out_of_sample = if cutoff.is_some() || holdout {
        Some(harness.out_of_sample_test(&predictions, &outcomes, cutoff)?)
    } else {
        None
    };

    print_json(&BacktestOutput {
        metrics,
        cross_validation,
        out_of_sample,
    })
}
