use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ptp_sync::{build_scheduler, Runner, TrackerConfig};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const POLL_EVERY: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "ptp-cli")]
#[command(about = "PriceTracker Pro command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect once and print the run report.
    RunOnce(ConfigArgs),
    /// Run on the configured interval until Ctrl-C.
    Watch(ConfigArgs),
    /// Serve the JSON API with the scheduler running alongside.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Tracker config file; `PTP_CONFIG` or tracker.yaml when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long)]
    port: Option<u16>,
}

impl ConfigArgs {
    fn load(&self) -> Result<TrackerConfig> {
        match &self.config {
            Some(path) => {
                TrackerConfig::load(path).with_context(|| format!("loading config {}", path.display()))
            }
            None => TrackerConfig::from_env(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing tracing subscriber")?;

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::RunOnce(ConfigArgs { config: None })) {
        Commands::RunOnce(args) => {
            let runner = Runner::from_config(args.load()?)?;
            let report = runner.trigger_manual().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Watch(args) => {
            let runner = Arc::new(Runner::from_config(args.load()?)?);
            let mut sched = build_scheduler(Arc::clone(&runner), POLL_EVERY).await?;
            sched.start().await.context("starting scheduler")?;
            info!(query = %runner.status().query, "watching prices; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve(args) => {
            let runner = Arc::new(Runner::from_config(args.config.load()?)?);
            let sched = build_scheduler(Arc::clone(&runner), POLL_EVERY).await?;
            sched.start().await.context("starting scheduler")?;
            let port = args.port.unwrap_or_else(ptp_web::port_from_env);
            ptp_web::serve(runner, port).await?;
        }
    }

    Ok(())
}
