//! CLI for eventcore
//!
//! Subcommands:
//! - `publish`: emit N persistent events and record their ids to a state file
//! - `verify`: drain the verification queue and diff it against the state file
//! - `dlq`: log (and ack) the dead letters of a queue
//! - `health`: connect once and report the connection state
//!
//! `--in-memory` runs against the in-process broker backed by `store.path`
//! instead of AMQP, which lets `publish` and `verify` run as separate
//! processes with no broker installed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use eventcore::Result;
use eventcore::broker::MemoryBroker;
use eventcore::config::{Settings, load_config};
use eventcore::connection::{ConnectionManager, ConnectionState};
use eventcore::subscriber::DeadLetterMonitor;
use eventcore::transport::{AmqpConnector, Connector};
use eventcore::utils::logging;
use eventcore::verify::{self, PublishState};

#[derive(Parser)]
#[command(name = "eventcore", version, about = "Event backbone tooling")]
struct Cli {
    /// Use the in-process broker persisted under `store.path` instead of AMQP
    #[arg(long, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish persistent verification events and record their ids
    Publish {
        #[arg(long, short = 'n', default_value_t = 10)]
        count: usize,
        #[arg(long, default_value = "verify-state.json")]
        state: PathBuf,
    },
    /// Consume the verification queue and compare with the recorded ids
    Verify {
        #[arg(long, default_value = "verify-state.json")]
        state: PathBuf,
        /// Stop after this long without a delivery
        #[arg(long, default_value_t = 2000)]
        idle_ms: u64,
    },
    /// Monitor the dead-letter queue of QUEUE
    Dlq {
        queue: String,
        /// Drain what is queued and exit instead of following
        #[arg(long)]
        drain: bool,
        #[arg(long, default_value_t = 2000)]
        idle_ms: u64,
    },
    /// Connect once and report the connection state
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log.level);

    match run(cli, &settings).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, settings: &Settings) -> Result<u8> {
    let connector: Arc<dyn Connector> = if cli.in_memory {
        Arc::new(MemoryBroker::open(&settings.store.path)?.connector())
    } else {
        Arc::new(AmqpConnector::default())
    };
    let manager = ConnectionManager::with_connector(settings.connection_config(), connector);
    manager.connect().await?;

    let code = match cli.command {
        Command::Publish { count, state } => {
            let published =
                verify::publish_phase(&manager, settings.publisher_config(), count).await?;
            published.save(&state)?;
            println!(
                "published {} events (run {}) to {}",
                published.event_ids.len(),
                published.run_id,
                state.display()
            );
            0
        }
        Command::Verify { state, idle_ms } => {
            let state = PublishState::load(&state)?;
            let report =
                verify::verify_phase(&manager, &state, Duration::from_millis(idle_ms)).await?;
            println!("{report}");
            report.exit_code()
        }
        Command::Dlq {
            queue,
            drain,
            idle_ms,
        } => {
            let monitor = DeadLetterMonitor::new(Arc::clone(&manager), queue);
            monitor.initialize().await?;
            if drain {
                let drained = monitor.drain(Duration::from_millis(idle_ms)).await?;
                println!("drained {} dead letters from {}", drained.len(), monitor.queue());
            } else {
                let handle = monitor.start().await?;
                info!(queue = %monitor.queue(), "monitoring dead letters, ctrl-c to stop");
                let mut state = manager.watch_state();
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        result?;
                        info!("Shutdown signal received. Exiting gracefully.");
                    }
                    _ = state.wait_for(|s| *s == ConnectionState::Closed) => {
                        error!(
                            queue = %monitor.queue(),
                            "broker connection closed, monitor stopped"
                        );
                    }
                }
                handle.shutdown().await?;
            }
            0
        }
        Command::Health => {
            let healthy = manager.health_check();
            println!("{}", manager.state());
            if healthy { 0 } else { 1 }
        }
    };

    manager.close().await?;
    Ok(code)
}
