use abx3_runner::{
    collector::TableCollector,
    config::{ConfigErrors, RunnerConfig},
    database::{RecordStore, StateLabel, ID},
    pipeline::StagePipeline,
    sweep::{Sweep, CREATION, RELAXING},
    RunnerError,
};
use clap::{Parser, Subcommand};
use std::{fs, path::PathBuf, process::exit, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Parser, Debug)]
#[command(author, version, about = "Claim and relax ABX3 perovskites from a candidate table")]
struct Cli {
    /// YAML config, defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store the initial structure of every row
    Create {
        table: PathBuf,
        /// row to start from
        #[arg(default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value = CREATION)]
        process: String,
    },
    /// Run the relaxation stages for every row and store the result as relaxed
    Relax {
        table: PathBuf,
        /// row to start from
        #[arg(default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value = RELAXING)]
        process: String,
        /// start from the stored structure with this state instead of the table geometry
        #[arg(long)]
        from: Option<StateLabel>,
    },
    /// List reservations older than the given number of seconds
    Stale {
        #[arg(long, default_value_t = 24 * 60 * 60)]
        older_than: u64,
    },
    /// Delete a reservation left behind by a killed worker
    Release { id: ID },
}

fn open_store(config: &RunnerConfig) -> Result<RecordStore, RunnerError> {
    let path = config.database_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    Ok(RecordStore::open(&path, config.busy_timeout())?)
}

fn run(command: Command, config: RunnerConfig) -> Result<(), RunnerError> {
    let needs_solver = matches!(command, Command::Relax { .. });
    if matches!(command, Command::Create { .. } | Command::Relax { .. })
        && config.preflight_checks(needs_solver)
    {
        return Err(ConfigErrors::Preflight.into());
    }

    let store = open_store(&config)?;

    match command {
        Command::Create {
            table,
            offset,
            process,
        } => {
            let provisioning = config.provisioning()?;
            let collector = TableCollector::load(&table, offset)?;

            Sweep::new(&store, &provisioning, process).create(collector)?;
        }
        Command::Relax {
            table,
            offset,
            process,
            from,
        } => {
            let provisioning = config.provisioning()?;
            let checkpoints = config.checkpoints()?;
            let solver = config.solver()?;
            let pipeline = StagePipeline::new(
                &config.stages,
                &solver,
                &checkpoints,
                config.max_steps_policy,
            );
            let collector = TableCollector::load(&table, offset)?;

            Sweep::new(&store, &provisioning, process).relax(&pipeline, from, collector)?;
        }
        Command::Stale { older_than } => {
            let stale = store.stale_reservations(Duration::from_secs(older_than))?;

            for reservation in stale.iter() {
                println!(
                    "{}\t{}\t{}:{}\t{}",
                    reservation.id,
                    reservation.process,
                    reservation.holder,
                    reservation.pid,
                    reservation.created_at
                );
            }

            info!("Found {} stale reservation(s)", stale.len());
        }
        Command::Release { id } => {
            if store.release(id)? {
                info!("Released reservation {id}");
            } else {
                warn!("No reservation with id {id}");
            }
        }
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RunnerConfig::load(path).unwrap_or_log(),
        None => RunnerConfig::default(),
    };

    if let Err(error) = run(cli.command, config) {
        error!("{error}");

        exit(1)
    }
}
