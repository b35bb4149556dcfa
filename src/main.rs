//! Binary entrypoint for the Meshbadge CLI.
//!
//! Commands:
//! - `start [--port <path>] [--host <addr>]` - run the badge feed against a node
//! - `init` - write a starter `config.toml`
//! - `history [-n <count>] [--journal]` - print stored messages
//! - `status` - print a store summary and the metrics of the last session
//! - `smoke-test [--dry-run] [--timeout <s>]` - connect once and report as JSON
//!
//! See the library crate docs for module-level details: `meshbadge::`.
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use meshbadge::badge::terminal::{message_line, TerminalRenderer};
use meshbadge::badge::{input, read_last_metrics, Badge};
use meshbadge::config::{Config, TransportKind};
use meshbadge::storage::{collapse, read_journal, MessageStore};
use meshbadge::transport::tcp::TcpConnector;
use meshbadge::transport::{memory, Connector, Link, RawPayload};

#[derive(Parser)]
#[command(name = "meshbadge")]
#[command(about = "A Meshtastic text feed for a wearable badge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the badge feed
    Start {
        /// Serial device of the node (e.g., /dev/rfcomm0)
        #[arg(short, long)]
        port: Option<String>,

        /// Talk to the node over TCP instead (host or host:port)
        #[arg(long, conflicts_with = "port")]
        host: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Print the most recent stored messages
    History {
        /// Number of messages
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,

        /// Read the journal instead of the database (works while the badge runs)
        #[arg(long)]
        journal: bool,
    },
    /// Show store statistics and the last session's counters
    Status,
    /// Connect to the node once and report the result as JSON
    SmokeTest {
        /// Use the built-in simulated node instead of the configured transport
        #[arg(long)]
        dry_run: bool,

        /// Seconds to wait before giving up
        #[arg(short, long, default_value_t = 15)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };

    match cli.command {
        Commands::Start { port, host } => {
            let mut config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            // the feed owns the terminal; log to a file and never echo
            config.logging.file = Some(config.foreground_log_path().to_string_lossy().into_owned());
            init_logging(&Some(config.clone()), cli.verbose, false);
            apply_overrides(&mut config, port, host);
            info!("Starting Meshbadge v{}", env!("CARGO_PKG_VERSION"));

            let mut renderer = TerminalRenderer::new(
                std::io::stdout(),
                config.feed.width,
                config.feed.viewport_height,
            );
            let badge = Badge::open(config)?;
            if let Err(e) = badge
                .run_configured(input::spawn_stdin_reader(), &mut renderer)
                .await
            {
                error!("Badge stopped: {}", e);
                return Err(e);
            }
        }
        Commands::Init => {
            init_logging(&None, cli.verbose, true);
            info!("Initializing new badge configuration");
            Config::create_default(&cli.config).await?;
            let cfg = Config::default();
            std::fs::create_dir_all(cfg.storage.data_path())?;
            info!("Configuration file created at {}", cli.config);
            info!("Data directory: {}", cfg.storage.data_path().display());
        }
        Commands::History { count, journal } => {
            init_logging(&pre_config, cli.verbose, true);
            let config = pre_config.unwrap_or_default();
            let messages = if journal {
                let lines = read_journal(&config.storage.journal_path())?;
                let mut collapsed = collapse(lines);
                let skip = collapsed.len().saturating_sub(count);
                collapsed.drain(..skip);
                collapsed
            } else {
                let store = MessageStore::open_with_config(&config.storage)?;
                store.read_recent(count)?
            };
            for m in &messages {
                println!("{} {}", m.timestamp.format("%Y-%m-%d"), message_line(m));
            }
            if messages.is_empty() {
                println!("No messages stored yet.");
            }
        }
        Commands::Status => {
            init_logging(&pre_config, cli.verbose, true);
            let config = pre_config.unwrap_or_default();
            show_status(&config)?;
        }
        Commands::SmokeTest { dry_run, timeout } => {
            init_logging(&pre_config, cli.verbose, true);
            let config = pre_config.unwrap_or_default();
            let limit = Duration::from_secs(timeout);
            let payload = if dry_run {
                let (connector, radio) = memory::pair();
                radio.inject_text(0x1234_5678, 0x0000_0001, "smoke test");
                smoke_test(connector, limit).await
            } else {
                match config.transport.kind {
                    TransportKind::Tcp => {
                        smoke_test(TcpConnector::from_config(&config.transport), limit).await
                    }
                    #[cfg(feature = "serial")]
                    TransportKind::Serial => {
                        let connector = meshbadge::transport::serial::SerialConnector::from_config(
                            &config.transport,
                        );
                        smoke_test(connector, limit).await
                    }
                    #[cfg(not(feature = "serial"))]
                    TransportKind::Serial => {
                        error!("Serial smoke test requires the 'serial' feature");
                        std::process::exit(2);
                    }
                }
            };
            let ok = payload["status"] == "ok";
            println!("{}", payload);
            std::process::exit(if ok { 0 } else { 1 });
        }
    }

    Ok(())
}

/// CLI flags win over the file.
fn apply_overrides(config: &mut Config, port: Option<String>, host: Option<String>) {
    if let Some(port) = port {
        config.transport.kind = TransportKind::Serial;
        config.transport.port = port;
    }
    if let Some(host) = host {
        config.transport.kind = TransportKind::Tcp;
        let split = host
            .rsplit_once(':')
            .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)));
        match split {
            Some((h, p)) => {
                config.transport.host = h;
                config.transport.tcp_port = p;
            }
            None => config.transport.host = host,
        }
    }
}

fn show_status(config: &Config) -> Result<()> {
    println!("Meshbadge v{}", env!("CARGO_PKG_VERSION"));
    match config.transport.kind {
        TransportKind::Serial => println!(
            "Transport: serial {} @ {} baud",
            config.transport.port, config.transport.baud_rate
        ),
        TransportKind::Tcp => println!(
            "Transport: tcp {}:{}",
            config.transport.host, config.transport.tcp_port
        ),
    }
    match MessageStore::open_with_config(&config.storage) {
        Ok(store) => {
            println!("Stored messages: {}", store.len());
            if let Some(last) = store.read_recent(1)?.pop() {
                println!("Newest: {}", message_line(&last).trim_start());
            }
        }
        // sled holds an exclusive lock while the badge is running
        Err(e) => warn!("Message store unavailable ({}); is the badge running?", e),
    }
    println!("Journal: {}", config.storage.journal_path().display());
    match read_last_metrics(&config.storage.metrics_path())? {
        Some(m) => {
            println!("Last session:");
            println!("  received {} (dropped {})", m.raw_received, m.raw_dropped);
            println!("  stored {} (duplicates {}, failures {})", m.persisted, m.duplicates, m.persist_failed);
            println!("  sent {} (failed {})", m.sends_ok, m.sends_failed);
            println!("  connect attempts {}, probe failures {}", m.connect_attempts, m.probe_failures);
        }
        None => println!("Last session: no record"),
    }
    Ok(())
}

/// Connect once, probe, wait briefly for one event, close.
async fn smoke_test<C: Connector>(mut connector: C, limit: Duration) -> serde_json::Value {
    let target = connector.describe();
    info!("Starting smoke test against {}", target);
    let started = Instant::now();
    let mut link = match tokio::time::timeout(limit, connector.connect()).await {
        Ok(Ok(link)) => link,
        Ok(Err(e)) => {
            return serde_json::json!({
                "status": "failed",
                "target": target,
                "error": e.to_string(),
                "timeout_seconds": limit.as_secs(),
            })
        }
        Err(_) => {
            return serde_json::json!({
                "status": "timeout",
                "target": target,
                "timeout_seconds": limit.as_secs(),
            })
        }
    };
    let handshake_ms = started.elapsed().as_millis() as u64;
    let probe_ok = link.probe().await.is_ok();
    let first_event = match tokio::time::timeout(Duration::from_secs(2), link.next_event()).await {
        Ok(Ok(event)) => match event.payload {
            RawPayload::Packet { port, bytes } => {
                serde_json::json!({ "kind": "packet", "port": port, "len": bytes.len() })
            }
            RawPayload::ConsoleLine(line) => serde_json::json!({ "kind": "console", "line": line }),
        },
        _ => serde_json::Value::Null,
    };
    let node = link.node_num();
    link.close().await;

    serde_json::json!({
        "status": if probe_ok { "ok" } else { "probe_failed" },
        "target": target,
        "node_num": node.map(meshbadge::message::format_node_id),
        "handshake_ms": handshake_ms,
        "first_event": first_event,
        "timeout_seconds": limit.as_secs(),
    })
}

fn init_logging(config: &Option<Config>, verbosity: u8, console: bool) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if let Some(cfg) = config {
        if let Some(ref file) = cfg.logging.file {
            if let Some(parent) = std::path::Path::new(file).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Ok(f) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
            {
                let write_mutex = std::sync::Mutex::new(f);

                // Mirror to the console only for one-shot commands on a TTY
                let echo = console && atty::is(atty::Stream::Stderr);

                builder.format(move |fmt, record| {
                    let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                    let line = format!("{} [{}] {}", ts, record.level(), record.args());

                    if let Ok(mut guard) = write_mutex.lock() {
                        let _ = writeln!(guard, "{}", line);
                    }

                    if echo {
                        writeln!(fmt, "{}", line)
                    } else {
                        Ok(())
                    }
                });
                let _ = builder.try_init();
                return;
            }
        }
    }
    if !console {
        // no usable file and no console: stay quiet rather than draw over the feed
        builder.filter_level(log::LevelFilter::Off);
    }
    builder.format(|fmt, record| {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
    });
    let _ = builder.try_init();
}
