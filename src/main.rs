use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use fedavg_sim::experiments::{ExperimentRunner, ExperimentsFile};
use fedavg_sim::{simulation, RunConfig};

#[derive(Parser)]
#[command(version, about = "Simulated federated learning with FedAvg", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one simulation
    Run {
        /// YAML or TOML file layered over the defaults
        #[arg(long)]
        config: Option<PathBuf>,
        /// Space separated overrides, e.g. "num-server-rounds=5 fraction-fit=0.3"
        #[arg(long, default_value = "")]
        run_config: String,
    },
    /// Run every experiment of a YAML list, one after another
    Experiments {
        #[arg(long, default_value = "experiments_config.yaml")]
        config_file: PathBuf,
        #[arg(long, default_value = ".")]
        log_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    match Cli::parse().command {
        Commands::Run { config, run_config } => {
            let cfg = RunConfig::load(config.as_deref(), &run_config).context("loading run config")?;
            info!(?cfg, "run config");
            simulation::run(cfg).await?;
        }
        Commands::Experiments { config_file, log_dir } => {
            let file = ExperimentsFile::load(&config_file)
                .with_context(|| format!("reading {}", config_file.display()))?;
            std::fs::create_dir_all(&log_dir)?;
            let outcomes = ExperimentRunner::current_exe(log_dir)?.run_all(&file.experiments).await?;
            for o in outcomes {
                info!(
                    name = %o.name,
                    log = %o.log_path.display(),
                    output = %o.output_dir.display(),
                    exit_code = ?o.exit_code,
                    "experiment finished"
                );
            }
        }
    }
    Ok(())
}
