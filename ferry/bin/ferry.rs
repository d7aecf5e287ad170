//! The ferry relay
//!
//! - `invoke` processes a single trigger and exits with its disposition
//! - `serve` reads JSON triggers from stdin and writes reports to stdout
//! - `resolve` shows what the address map does with an address
//! - `check` validates the configuration and address map

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use ferry::{AddressMapHandle, ConfigError, FerryConfig, Pipeline, Trigger};
use ferry_common::{Mailbox, Signal, internal, logging, logging::LogFormat};
use ferry_delivery::Resolution;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast,
};

/// `EX_CONFIG` from sysexits.h
const EXIT_CONFIG: u8 = 78;

#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(about = "Relay inbound mail for managed aliases", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file; defaults to `FERRY_CONFIG`, then
    /// ./ferry.config.ron, then /etc/ferry/ferry.config.ron
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log line format (text, json); `LOG_FORMAT` overrides it
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process one staged message
    Invoke {
        /// Address the message was received for
        #[arg(short, long)]
        recipient: String,
        /// Storage key of the staged message
        #[arg(short, long)]
        key: String,
        /// Envelope sender, `<>` for the null sender
        #[arg(short, long)]
        sender: Option<String>,
        /// When the message was received (RFC 3339)
        #[arg(long)]
        received_at: Option<DateTime<Utc>>,
    },
    /// Process newline-delimited JSON triggers from stdin
    Serve,
    /// Show how an address resolves, without side effects
    Resolve {
        address: String,
    },
    /// Validate the configuration and address map
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            internal!(level = ERROR, error = ?err, "ferry failed");
            eprintln!("ferry: {err:#}");

            if err.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let path = match cli.config {
        Some(path) => path,
        None => find_config_file()?,
    };
    let config = FerryConfig::load(&path)?;

    internal!(
        level = DEBUG,
        path = %path.display(),
        region = config.relay.region.as_deref().unwrap_or("-"),
        "Configuration loaded"
    );

    match cli.command {
        Commands::Invoke {
            recipient,
            key,
            sender,
            received_at,
        } => {
            let pipeline = Pipeline::from_config(&config)?;

            let mut trigger = Trigger::new(recipient, key);
            trigger.sender = sender;
            trigger.received_at = received_at;

            let report = pipeline.process(&trigger).await;
            println!("{}", serde_json::to_string_pretty(&report)?);

            Ok(exit_code(report.exit_code()))
        }
        Commands::Serve => serve(&config).await,
        Commands::Resolve { address } => {
            resolve(&config, &address)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check => {
            check(&config, &path)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}

async fn serve(config: &FerryConfig) -> anyhow::Result<ExitCode> {
    let pipeline = Arc::new(Pipeline::from_config(config)?);
    let (signals, _) = broadcast::channel(16);

    let watcher = {
        let handle = pipeline.address_map().clone();
        let receiver = signals.subscribe();
        tokio::spawn(async move { handle.watch(receiver).await })
    };
    let receiver = signals.subscribe();
    let forwarder = tokio::spawn(forward_signals(signals.clone()));

    let (summary, _) = ferry::serve(
        pipeline,
        tokio::io::stdin(),
        tokio::io::stdout(),
        config.serve.max_concurrency,
        receiver,
    )
    .await?;

    // Input may have ended without a signal; stop the watcher either way.
    let _ = signals.send(Signal::Shutdown);
    forwarder.abort();
    watcher.await?;

    internal!(level = INFO, processed = summary.processed, "Shut down");

    Ok(ExitCode::SUCCESS)
}

/// Translate process signals: Ctrl-C and SIGTERM shut down, SIGHUP reloads
/// the address map.
async fn forward_signals(signals: broadcast::Sender<Signal>) -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                internal!(level = INFO, "CTRL+C received, shutting down");
                break;
            }
            _ = terminate.recv() => {
                internal!(level = INFO, "Terminate signal received, shutting down");
                break;
            }
            _ = hangup.recv() => {
                internal!(level = INFO, "Hangup received, reloading address map");
                let _ = signals.send(Signal::Reload);
            }
        }
    }

    let _ = signals.send(Signal::Shutdown);
    Ok(())
}

fn resolve(config: &FerryConfig, address: &str) -> anyhow::Result<()> {
    let recipient = Mailbox::parse(address)?;
    let handle = AddressMapHandle::load(config.address_map.clone(), config.bounce_rules.clone())
        .map_err(ConfigError::from)?;
    let map = handle.current();

    match map.resolve(&recipient) {
        Resolution::Forward(destinations) => {
            let destinations = destinations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            println!("{recipient}: forward to {destinations}");
        }
        Resolution::Bounce(rule) => {
            println!(
                "{recipient}: bounce as {} ({} {})",
                rule.sender,
                rule.reason,
                rule.reason.status()
            );
        }
        Resolution::Unknown => {
            println!("{recipient}: unknown (no alias or bounce rule)");
        }
    }
    println!("address map version {}", map.version());

    Ok(())
}

fn check(config: &FerryConfig, path: &Path) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let map = pipeline.address_map().current();

    let domains = map
        .domains()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    println!("configuration: {} OK", path.display());
    println!("relay identity: {}", config.relay.address);
    println!(
        "address map: version {}, {} aliases, {} bounce rules",
        map.version(),
        map.len(),
        map.bounce_rule_count()
    );
    println!("domains: {domains}");
    println!("{}", pipeline.describe());

    Ok(())
}

/// Find the configuration file using the following precedence:
/// 1. `FERRY_CONFIG` environment variable
/// 2. ./ferry.config.ron (current working directory)
/// 3. /etc/ferry/ferry.config.ron (system-wide config)
fn find_config_file() -> Result<PathBuf, ConfigError> {
    if let Ok(env_path) = std::env::var("FERRY_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::Invalid(format!(
            "FERRY_CONFIG points to non-existent file: {}",
            path.display()
        )));
    }

    let default_paths = [
        PathBuf::from("./ferry.config.ron"),
        PathBuf::from("/etc/ferry/ferry.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::Invalid(format!(
        "No configuration file found. Tried:\n  - FERRY_CONFIG environment variable\n{paths_tried}"
    )))
}
