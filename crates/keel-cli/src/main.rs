//! keel: command line for an etcd-style cluster.
//!
//! Every command connects through the failover client, so it works
//! against any seed of the cluster and follows leader changes.
//!
//! # Usage
//!
//! ```text
//! keel --seed http://10.0.0.1:4001 members
//! keel set /config/mode active --ttl 30
//! keel observe /config --heartbeat 5s
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use keel_client::{ClientConfig, Protocol};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "keel",
    about = "Keel, a failover-aware client for etcd-style clusters",
    version,
    propagate_version = true,
)]
struct Cli {
    /// TOML client configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Seed URI; repeat for several. Overrides the config file.
    #[arg(short, long = "seed", global = true)]
    seeds: Vec<String>,

    /// API generation spoken by the cluster.
    #[arg(long, value_enum, global = true)]
    protocol: Option<ProtocolArg>,

    /// Leader heartbeat period, e.g. "5s". Zero disables it.
    #[arg(long, global = true)]
    heartbeat: Option<String>,

    /// Output format.
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List cluster members and their status
    Members,
    /// Show the current leader
    Leader,
    /// Read a key or the children of a directory
    Get { key: String },
    /// Write a key
    Set {
        key: String,
        value: String,
        /// Expire the key after this many seconds.
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Write a key only if it holds the expected value
    Update {
        key: String,
        value: String,
        /// Value the key must currently hold.
        #[arg(long)]
        prev: String,
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Remove a key
    Delete { key: String },
    /// Show key metadata (index, TTL, expiration)
    Info { key: String },
    /// Wait for one change under a prefix
    Watch {
        prefix: String,
        /// First change index of interest.
        #[arg(long)]
        index: Option<u64>,
    },
    /// Print every change under a prefix until interrupted
    Observe { prefix: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProtocolArg {
    V1,
    V2,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::V1 => Protocol::V1,
            ProtocolArg::V2 => Protocol::V2,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::default(),
        };
        if !self.seeds.is_empty() {
            config = config.with_seeds(self.seeds.clone());
        }
        if let Some(protocol) = self.protocol {
            config = config.with_protocol(protocol.into());
        }
        if let Some(raw) = &self.heartbeat {
            let interval = keel_client::config::parse_duration(raw)
                .ok_or_else(|| anyhow::anyhow!("invalid heartbeat interval: {raw}"))?;
            config = config.with_heartbeat_interval(interval);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("keel=info,keel_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.client_config()?;
    let format = cli.format;

    match cli.command {
        Command::Members => commands::cluster::members(config, format).await,
        Command::Leader => commands::cluster::leader(config, format).await,
        Command::Get { key } => commands::keys::get(config, &key, format).await,
        Command::Set { key, value, ttl } => {
            commands::keys::set(config, &key, &value, ttl, format).await
        }
        Command::Update {
            key,
            value,
            prev,
            ttl,
        } => commands::keys::update(config, &key, &value, &prev, ttl).await,
        Command::Delete { key } => commands::keys::delete(config, &key, format).await,
        Command::Info { key } => commands::keys::info(config, &key, format).await,
        Command::Watch { prefix, index } => {
            commands::watch::watch(config, &prefix, index, format).await
        }
        Command::Observe { prefix } => commands::watch::observe(config, &prefix, format).await,
    }
}
