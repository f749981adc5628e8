use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use core_types::{EngineError, MarketDataSource, OrderGateway};
use execution::{BlockedGateway, PaperGateway};
use feed_replay::JsonlReplayFeed;

mod config;
mod engine;
mod kill;
#[cfg(test)]
mod tests;

use config::RunConfig;
use engine::{run_loop, Orchestrator};
use kill::SentinelKill;

#[derive(Parser, Debug)]
#[command(name = "bandedge", about = "Session-band taker for 15-minute binary contracts", version)]
struct Cli {
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the decision loop.
    Run(RunArgs),
    /// Enumerate configuration and check adapter connectivity.
    Verify,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Recorded feed to replay as the market data source.
    #[arg(long)]
    replay: Option<PathBuf>,
    /// Replay pacing factor (1.0 = original timing).
    #[arg(long, default_value_t = 1.0)]
    replay_speed: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        std::env::set_var("RUST_LOG", "bandedge=debug,debug");
    }
    let telemetry = observability::Telemetry::init();

    match cli.command {
        Commands::Run(args) => run(args, &telemetry).await,
        Commands::Verify => verify().await,
    }
}

async fn run(args: RunArgs, telemetry: &observability::Telemetry) -> Result<()> {
    // Config errors abort before any run-dir or network I/O.
    let cfg = RunConfig::from_env()?;

    let gateway = build_gateway(&cfg)?;
    let feed = build_feed(&args)?;
    let run_dir = cfg.run_dir();
    let kill = SentinelKill::in_run_dir(&run_dir);

    let orch = Orchestrator::new(cfg, gateway, None, Utc::now()).await?;
    match run_loop(orch, feed, kill, Some(telemetry.prometheus())).await {
        Ok(()) => Ok(()),
        Err(EngineError::Io(err)) => {
            // The event log is the system of record; losing it is fatal.
            eprintln!("FATAL: event log write failed: {err}");
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

fn build_gateway(cfg: &RunConfig) -> Result<Arc<dyn OrderGateway>> {
    match (cfg.mode.as_str(), cfg.execution_enabled) {
        ("paper", _) => Ok(Arc::new(PaperGateway::new(
            cfg.paper_seed(),
            cfg.paper_max_slip_ticks,
        ))),
        ("real", false) => {
            tracing::warn!("MODE=real with EXECUTION_ENABLED=false: orders will be blocked");
            Ok(Arc::new(BlockedGateway))
        }
        ("real", true) => {
            // The venue order client is an external collaborator wired at
            // deployment; this build does not link one.
            bail!(EngineError::Config(
                "MODE=real with EXECUTION_ENABLED=true requires a venue order client; \
                 none is linked in this build"
                    .to_string()
            ))
        }
        (other, _) => bail!(EngineError::Config(format!("unknown MODE `{other}`"))),
    }
}

fn build_feed(args: &RunArgs) -> Result<Arc<dyn MarketDataSource>> {
    let Some(path) = &args.replay else {
        bail!(EngineError::Config(
            "no market data source wired; pass --replay <feed.jsonl> \
             (the live venue feed is an external adapter)"
                .to_string()
        ))
    };
    let feed = JsonlReplayFeed::open(path, args.replay_speed)?;
    Ok(Arc::new(feed))
}

async fn verify() -> Result<()> {
    let cfg = RunConfig::from_env()?;
    println!("{}", cfg.to_canonical_json()?);
    println!("config_sha256={}", cfg.sha256()?);

    let run_dir = cfg.run_dir();
    std::fs::create_dir_all(&run_dir)?;
    let probe = run_dir.join(".verify_probe");
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)?;
    println!("run_dir={} (writable)", run_dir.display());

    let kill = SentinelKill::in_run_dir(&run_dir);
    if kill.asserted() {
        println!("WARNING: KILL_SWITCH sentinel present; run would latch manual kill immediately");
    }

    let gateway = build_gateway(&cfg)?;
    gateway.check_connectivity().await?;
    println!("placement adapter: ok ({})", cfg.execution_mode().as_str());

    println!("verify: ok");
    Ok(())
}
