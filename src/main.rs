use std::io::Read;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use sysinfo::{ProcessExt, System, SystemExt};

use stroke_triage::dataset::{migrate_fallback, MigrationOutcome};
use stroke_triage::postgres::PgRecordStore;
use stroke_triage::snapshot::read_snapshot;
use stroke_triage::source::{CsvFileSource, MemorySource};
use stroke_triage::{run_configured, PatientInput, PipelineConfig, RiskScorer, TierPolicy};

#[derive(Parser)]
#[command(author, version, about = "Stroke-risk scoring and model evaluation", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// JSON pipeline configuration; unspecified fields keep their defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score patient records read as JSON (one object or an array) from a file or stdin.
    Score {
        input: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = PolicyArg::ThreeTier)]
        policy: PolicyArg,
        /// Omit the probability from each response.
        #[arg(long)]
        no_probability: bool,
    },
    /// Build, preprocess, split, train and evaluate every configured candidate.
    Train {
        #[arg(long)]
        fallback_csv: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        test_fraction: Option<f64>,
        /// Write the full report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Write the processed feature frame as parquet.
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Also audit the rule scorer against held-out outcomes.
        #[arg(long, value_enum)]
        audit_policy: Option<PolicyArg>,
    },
    /// Summarize a processed feature snapshot written by `train --snapshot`.
    Inspect { snapshot: PathBuf },
    /// Copy the fallback file into the PostgreSQL store unless it is already populated.
    Migrate {
        #[arg(long)]
        fallback_csv: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    ThreeTier,
    TwoTier,
}

impl From<PolicyArg> for TierPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::ThreeTier => TierPolicy::ThreeTier,
            PolicyArg::TwoTier => TierPolicy::TwoTier,
        }
    }
}

fn resident_memory() -> u64 {
    let mut system = System::new();
    match sysinfo::get_current_pid() {
        Ok(pid) => {
            system.refresh_process(pid);
            system.process(pid).map(|p| p.memory()).unwrap_or(0)
        }
        Err(_) => 0,
    }
}

fn read_patients(input: Option<&PathBuf>) -> Result<Vec<PatientInput>> {
    let text = match input {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
            buf
        }
    };
    let value: serde_json::Value = serde_json::from_str(&text).context("input is not JSON")?;
    let patients = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(patients)
}

fn score(input: Option<&PathBuf>, policy: PolicyArg, no_probability: bool) -> Result<()> {
    let mut scorer = RiskScorer::new(policy.into());
    if no_probability {
        scorer = scorer.without_probability();
    }
    for (idx, patient) in read_patients(input)?.iter().enumerate() {
        let response = scorer
            .score(patient)
            .with_context(|| format!("record {} is not scorable", idx + 1))?;
        println!("{}", serde_json::to_string(&response)?);
    }
    Ok(())
}

async fn train(config: &PipelineConfig) -> Result<()> {
    let fallback = CsvFileSource::new(&config.fallback_csv);
    let report = match &config.database_url {
        Some(url) => match PgRecordStore::connect(url).await {
            Ok(store) => run_configured(config, &store, &fallback).await?,
            Err(e) => {
                warn!("record store unreachable ({}); using {}", e, fallback.path().display());
                run_configured(config, &MemorySource::empty(), &fallback).await?
            }
        },
        None => {
            info!("DATABASE_URL not set; using {}", fallback.path().display());
            run_configured(config, &MemorySource::empty(), &fallback).await?
        }
    };
    print!("{}", report);
    Ok(())
}

fn inspect(path: &PathBuf) -> Result<()> {
    let (matrix, outcomes) =
        read_snapshot(path).with_context(|| format!("reading snapshot {:?}", path))?;
    let positives = outcomes.iter().filter(|&&y| y == 1).count();
    println!(
        "{} rows, {} features, {} positive / {} negative",
        matrix.n_rows(),
        matrix.n_features(),
        positives,
        outcomes.len() - positives
    );
    for (idx, name) in matrix.feature_names().iter().enumerate() {
        let column = matrix.column(idx);
        let mean = column.iter().sum::<f64>() / column.len().max(1) as f64;
        println!("  {:<20} mean {:>9.4}", name, mean);
    }
    Ok(())
}

async fn migrate(config: &PipelineConfig) -> Result<()> {
    let Some(url) = &config.database_url else {
        bail!("DATABASE_URL is required for migration");
    };
    let store = PgRecordStore::connect(url).await.context("connecting to record store")?;
    store.ensure_schema().await?;
    let fallback = CsvFileSource::new(&config.fallback_csv);
    match migrate_fallback(&store, &fallback, config.populated_threshold).await? {
        MigrationOutcome::AlreadyPopulated { existing } => {
            println!("store already holds {} labeled rows; nothing migrated", existing)
        }
        MigrationOutcome::Migrated { inserted, skipped } => {
            println!("migrated {} rows ({} skipped as invalid)", inserted, skipped)
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(format!("warn,stroke_triage={}", level)),
    )
    .init();

    let start_time = Instant::now();
    let start_memory = resident_memory();

    let mut config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    match cli.command {
        Command::Score {
            input,
            policy,
            no_probability,
        } => score(input.as_ref(), policy, no_probability)?,
        Command::Train {
            fallback_csv,
            seed,
            test_fraction,
            report,
            snapshot,
            audit_policy,
        } => {
            if let Some(path) = fallback_csv {
                config.fallback_csv = path;
            }
            if let Some(seed) = seed {
                config.random_seed = seed;
            }
            if let Some(fraction) = test_fraction {
                config.test_fraction = fraction;
            }
            if report.is_some() {
                config.report_path = report;
            }
            if snapshot.is_some() {
                config.snapshot_path = snapshot;
            }
            if let Some(policy) = audit_policy {
                config.labeling_policy = Some(policy.into());
            }
            train(&config).await?
        }
        Command::Inspect { snapshot } => inspect(&snapshot)?,
        Command::Migrate { fallback_csv } => {
            if let Some(path) = fallback_csv {
                config.fallback_csv = path;
            }
            migrate(&config).await?
        }
    }

    let end_memory = resident_memory();
    info!("Time elapsed: {:.2?}", start_time.elapsed());
    info!(
        "Memory used: {} KiB",
        end_memory.saturating_sub(start_memory) / 1024
    );
    Ok(())
}
