use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quorum_cli::{Scenario, Simulation};
use quorum_ledger::{
    load_snapshot, save_snapshot, Amount, ArchivedSubject, LedgerAccount, LedgerConfig, Resolvable,
    SubjectConfig, SubjectSnapshot, Timestamp,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quorum-cli")]
#[command(about = "Quorum Ledger CLI", long_about = None)]
struct Cli {
    /// Ledger config file (TOML, JSON or YAML); QUORUM__* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Serialize)]
struct InspectSummary<'a> {
    version: u32,
    taken_at: Timestamp,
    defaults: &'a SubjectConfig,
    subjects: Vec<SubjectSnapshot>,
    accounts: &'a [LedgerAccount],
    treasury: Amount,
    archive: &'a [ArchivedSubject],
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate configuration, then print the effective values
    CheckConfig,

    /// Replay a JSON scenario against a fresh ledger
    Simulate {
        scenario: PathBuf,

        /// Write the final ledger snapshot here (defaults to snapshot_path from config)
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Print the contents of a saved snapshot
    Inspect {
        snapshot: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig => {
            let config = LedgerConfig::load(cli.config.as_deref()).context("loading ledger config")?;
            info!("Configuration valid");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate { scenario, save } => {
            let config = LedgerConfig::load(cli.config.as_deref()).context("loading ledger config")?;
            let scenario = Scenario::from_file(&scenario)?;
            let defaults = scenario.config.clone().unwrap_or(config.subject_defaults);
            defaults.validate().context("scenario subject config")?;

            let simulation = Simulation::new(defaults, scenario.start_time);
            let report = simulation.run(&scenario.steps);
            info!(
                "Replayed {} steps, {} rejected",
                report.steps.len(),
                report.rejected()
            );

            if let Some(path) = save.or(config.snapshot_path) {
                save_snapshot(&path, &simulation.registry.export_snapshot())
                    .with_context(|| format!("saving snapshot to {}", path.display()))?;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Inspect { snapshot } => {
            let snapshot = load_snapshot(&snapshot)
                .with_context(|| format!("loading snapshot {}", snapshot.display()))?;
            let summary = InspectSummary {
                version: snapshot.version,
                taken_at: snapshot.taken_at,
                defaults: &snapshot.defaults,
                subjects: snapshot.subjects.iter().map(|engine| engine.snapshot()).collect(),
                accounts: &snapshot.accounts,
                treasury: snapshot.treasury.balance(),
                archive: &snapshot.archive,
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
