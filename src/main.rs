//! Binary entrypoint for the Sensorino gateway CLI.
//!
//! Commands:
//! - `start [--listen <addr>]` - accept Base connections and run the gateway
//! - `init` - write a starter `sensorino.toml`
//! - `status` - summary of the stored state and counters
//! - `dump [--at <rfc3339>]` - the state tree as JSON, optionally as of a past instant
//! - `history --node N --service S --data-type T --channel C --from <rfc3339> [--to <rfc3339>]`
//!   - values of one channel over a period
//!
//! See the library crate docs for module-level details: `sensorino::`.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::info;
use tokio::net::TcpListener;

use sensorino::config::Config;
use sensorino::gateway::Gateway;
use sensorino::metrics;
use sensorino::state::changeset::ChangePath;
use sensorino::storage::{Store, StoreBuilder};

#[derive(Parser)]
#[command(name = "sensorino")]
#[command(about = "Smart-home gateway for Sensorino radio networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "sensorino.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Address Bases connect to, overrides the config file
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show stored state and counters
    Status,
    /// Print the state tree as JSON
    Dump {
        /// Reconstruct the tree as of this instant (RFC 3339)
        #[arg(long)]
        at: Option<String>,
    },
    /// Print the recorded values of one channel
    History {
        #[arg(long)]
        node: u8,
        #[arg(long)]
        service: u8,
        #[arg(long)]
        data_type: String,
        #[arg(long, default_value_t = 0)]
        channel: u32,
        /// Start of the period (RFC 3339, inclusive)
        #[arg(long)]
        from: String,
        /// End of the period (RFC 3339, exclusive), defaults to now
        #[arg(long)]
        to: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        Config::create_default(&cli.config).await?;
        println!("Wrote default configuration to {}", cli.config);
        return Ok(());
    }

    let config = match Config::load(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} (using defaults)", e);
            Config::default()
        }
    };
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Start { listen } => {
            info!("Starting Sensorino v{}", env!("CARGO_PKG_VERSION"));
            let addr = listen.unwrap_or_else(|| config.server.base_listen.clone());
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| anyhow!("Failed to listen on {}: {}", addr, e))?;

            let mut gateway = Gateway::open(config)?;
            gateway.load()?;
            gateway.run(listener).await?;
        }
        Commands::Init => {}
        Commands::Status => {
            let store = open_store(&config)?;
            let tree = store.get_tree_current()?;
            let discovered = tree.nodes().filter(|n| n.discovered).count();
            println!("Sensorino v{}", env!("CARGO_PKG_VERSION"));
            println!("Database: {}", config.storage.db_path);
            println!("Nodes: {} ({} discovered)", tree.len(), discovered);
            println!("Value rows: {}", store.value_row_count());
            if let Some(line) = store.get_console_current()?.last() {
                println!("Last console line: {} {}", line.0.to_rfc3339(), line.1);
            }
            println!("Counters: {}", metrics::snapshot());
        }
        Commands::Dump { at } => {
            let store = open_store(&config)?;
            let at = at.as_deref().map(parse_time).transpose()?;
            let tree = store.get_tree_at_timestamp(at)?;
            println!("{}", serde_json::to_string_pretty(&tree.to_json())?);
        }
        Commands::History {
            node,
            service,
            data_type,
            channel,
            from,
            to,
        } => {
            let store = open_store(&config)?;
            let path = ChangePath::Channel(node, service, data_type.to_ascii_lowercase(), channel);
            let t0 = parse_time(&from)?;
            let t1 = match to {
                Some(to) => parse_time(&to)?,
                None => Utc::now(),
            };
            for (ts, value) in store.get_values_within_period(&path, t0, t1)? {
                println!("{} {}", ts.to_rfc3339(), serde_json::to_string(&value)?);
            }
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<Store> {
    StoreBuilder::new(&config.storage.db_path)
        .range_limit(config.storage.range_limit)
        .console_history(config.storage.console_history)
        .open()
        .map_err(|e| anyhow!("Failed to open store {}: {}", config.storage.db_path, e))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| anyhow!("Invalid timestamp '{}': {}", raw, e))
}

fn init_logging(config: &Config, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .logging
            .level
            .parse()
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // sled is chatty at debug
    builder.filter_module("sled", log::LevelFilter::Info);

    let file = config.logging.file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    if let Some(f) = file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Only echo to the terminal when running in the foreground
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
