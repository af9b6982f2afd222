use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corefleet::api::{serve, AppState};
use corefleet::convert::ConverterRegistry;
use corefleet::storage::{InMemoryStore, PostgresStorage, Storage};
use corefleet::transport::HttpTransportFactory;
use corefleet::{Config, CoreType};

#[derive(Parser)]
#[command(name = "corefleet")]
#[command(about = "Control plane for proxy agent fleets", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP control plane
    Serve {
        #[arg(long, help = "Listen port (overrides COREFLEET_PORT)")]
        port: Option<u16>,
    },
    /// Finalize switches left in progress by a previous run, then exit
    Recover,
    /// Convert a core configuration file offline
    Convert {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(help = "Path to the source configuration (JSON)")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Serve { port } => run_server(config, port).await?,
        Commands::Recover => run_recovery(config).await?,
        Commands::Convert { from, to, file } => convert_file(&from, &to, &file)?,
    }

    Ok(())
}

async fn open_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    match &config.database_url {
        Some(url) => {
            let storage = PostgresStorage::new(url)
                .await
                .context("connecting to Postgres")?;
            storage
                .run_migrations()
                .await
                .context("applying migrations")?;
            log::info!("Using Postgres storage");
            Ok(Arc::new(storage))
        }
        None => {
            log::warn!("COREFLEET_DATABASE_URL not set, state is kept in memory only");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

fn app_state(config: &Config, storage: Arc<dyn Storage>) -> AppState {
    let transports = Arc::new(HttpTransportFactory::new(config.agent_timeout()));
    AppState::new(storage, transports, config)
}

async fn run_server(config: Config, port: Option<u16>) -> Result<()> {
    let storage = open_storage(&config).await?;
    let state = app_state(&config, storage);

    let recovered = state.orchestrator.recover_abandoned_switches().await?;
    if recovered > 0 {
        log::warn!("Finalized {} abandoned switch(es) on startup", recovered);
    }

    serve(state, port.unwrap_or(config.port), config.sweep_interval()).await
}

async fn run_recovery(config: Config) -> Result<()> {
    let storage = open_storage(&config).await?;
    let state = app_state(&config, storage);
    let recovered = state.orchestrator.recover_abandoned_switches().await?;
    println!("Recovered {} abandoned switch(es)", recovered);
    Ok(())
}

fn convert_file(from: &str, to: &str, file: &Path) -> Result<()> {
    let source: CoreType = from.parse()?;
    let target: CoreType = to.parse()?;

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let document: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;

    let conversion = ConverterRegistry::new().convert(source, target, &document)?;
    println!("{}", serde_json::to_string_pretty(&conversion.document)?);
    for warning in &conversion.warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}
