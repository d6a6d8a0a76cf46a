use std::path::PathBuf;
use std::sync::Arc;
use anyhow::bail;
use clap::{Parser, Subcommand};
use nackstream::config::NackstreamConfig;
use nackstream::receiver::{LoggingConsumer, Receiver};
use nackstream::relay::Relay;
use nackstream::sender::Sender;
use nackstream::session::run_local_session;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    /// config file - if omitted, nackstream.toml is looked up in the current directory and its
    ///  parents, falling back to built-in defaults
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(short, long, default_value_t = false)]
    quiet: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// emit the session's packets and serve NACKs until all receivers completed
    Sender,
    /// run the configured receiver with the given name
    Receiver { name: String },
    /// run the configured relay with the given name until interrupted
    Relay { name: String },
    /// run receivers, relays and the sender in a single process
    All,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.quiet, args.verbose, args.very_verbose) {
        (_, _, true) => Level::TRACE,
        (_, true, _) => Level::DEBUG,
        (true, _, _) => Level::WARN,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = NackstreamConfig::load(args.config.as_deref())?;
    let session = Arc::new(config.session.clone());

    match args.command {
        Command::Sender => {
            let report = Sender::bind(session, &config.sender).await?
                .run().await?;
            if report.timed_out {
                bail!("session timed out with {}/{} receivers completed", report.completed_receivers, report.expected_receivers);
            }
        }
        Command::Receiver { name } => {
            let receiver = Receiver::bind(session, config.receiver(&name)?, Arc::new(LoggingConsumer)).await?;
            let report = receiver.run().await?;
            if !report.completed {
                bail!("receiver {} timed out after delivering {} of {} packets", name, report.stats.counters.processed, report.stats.total_expected);
            }
        }
        Command::Relay { name } => {
            let relay = Relay::bind(config.relay(&name)?.clone(), session.stats_interval).await?;
            relay.run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("cannot listen for shutdown signal: {}", e);
                    std::future::pending::<()>().await;
                }
                info!("shutting down");
            }).await;
        }
        Command::All => {
            let report = run_local_session(&config).await?;
            for receiver in &report.receivers {
                info!("{}: {}", receiver.name, receiver.stats);
            }
            if !report.is_success() {
                bail!("session ended without full delivery");
            }
        }
    }
    Ok(())
}
