mod chat_client;
mod commands;
mod peer;
mod relay;
mod signal_server;

use std::io::BufRead;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info};

use murmur_core::config::{MurmurConfig, generate_key_file, load_key_file};
use murmur_core::logging;
use murmur_network::message::Common;
use murmur_network::{Codec, EncryptedCodec, EncryptionKey, JsonCodec, NetworkConfig, TcpServer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "murmur")]
#[command(version = VERSION)]
#[command(about = "Peer-to-peer chat over TCP with LAN or signal-server discovery")]
struct Cli {
    /// JSON network configuration (defaults to ~/.murmur/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive peer: discover others and chat with them directly
    Peer(peer::PeerArgs),
    /// Relay chat server: forwards every message to all other clients
    Server {
        #[arg(long, default_value = "0.0.0.0:8086")]
        addr: SocketAddr,
        /// Record connects and disconnects in `audit.db` under the data directory
        #[arg(long)]
        audit: bool,
        /// Record connects and disconnects in this SQLite file instead
        #[arg(long)]
        audit_db: Option<PathBuf>,
        /// Hex key file; enables encrypted messages
        #[arg(long)]
        key_file: Option<PathBuf>,
    },
    /// Signal server: tells registered peers about each other
    Signal {
        #[arg(long, default_value = "0.0.0.0:8086")]
        addr: SocketAddr,
    },
    /// Line-based client for the relay chat server
    Client {
        #[arg(long, default_value = "127.0.0.1:8086")]
        server_addr: String,
        /// Hex key file; must match the server's
        #[arg(long)]
        key_file: Option<PathBuf>,
    },
    /// Write a fresh random key file
    Keygen {
        #[arg(long)]
        out: PathBuf,
    },
}

/// Registry used by `murmur peer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RegistryKind {
    Multicast,
    Signal,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = MurmurConfig::resolve()?;
    home.ensure_dirs()?;
    let config_path = cli.config.clone().unwrap_or_else(|| home.config_path());
    let config = NetworkConfig::load_or_default(&config_path);

    // Interactive commands log to file only; servers also log to the console.
    let _guard = match &cli.command {
        Commands::Peer(_) | Commands::Client { .. } => {
            logging::init_logging_to_dir(&home.logs_dir(), logging::DEFAULT_FILTER)?
        }
        _ => logging::init_logging(&home.logs_dir())?,
    };
    info!(
        "murmur v{VERSION} starting (data: {}, config: {})",
        home.base_dir().display(),
        config_path.display()
    );

    let result = match cli.command {
        Commands::Peer(args) => peer::run(args, config, &home).await,
        Commands::Server {
            addr,
            audit,
            audit_db,
            key_file,
        } => {
            let codec = chat_codec(key_file.as_deref())?;
            let audit_db = audit_path(audit, audit_db, &home);
            relay::run(addr, audit_db.as_deref(), codec, &config).await
        }
        Commands::Signal { addr } => signal_server::run(addr, &config).await,
        Commands::Client {
            server_addr,
            key_file,
        } => {
            let codec = chat_codec(key_file.as_deref())?;
            chat_client::run(&server_addr, codec, &config).await
        }
        Commands::Keygen { out } => {
            generate_key_file(&out)?;
            println!("Key written to {}", out.display());
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("murmur exited with error: {e:#}");
    }
    result
}

/// An explicit `--audit-db` wins; `--audit` alone uses the data directory.
fn audit_path(audit: bool, audit_db: Option<PathBuf>, home: &MurmurConfig) -> Option<PathBuf> {
    audit_db.or_else(|| audit.then(|| home.db_path()))
}

/// JSON, or AES-GCM sealed JSON when a key file is given.
pub fn chat_codec(key_file: Option<&Path>) -> Result<Arc<dyn Codec<Common>>> {
    match key_file {
        Some(path) => {
            let key = EncryptionKey::from_bytes(load_key_file(path)?);
            info!("Encrypting messages with key from {}", path.display());
            Ok(Arc::new(EncryptedCodec::<Common>::new(&key)))
        }
        None => Ok(Arc::new(JsonCodec::<Common>::new())),
    }
}

/// Lines typed on stdin, read on a dedicated thread. A pending read on
/// tokio's stdin would hold up runtime shutdown.
pub fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Run `server` until Ctrl-C, then shut it down.
pub async fn serve_until_interrupted<T>(server: Arc<TcpServer<T>>) -> Result<()>
where
    T: Send + Sync + 'static,
{
    let serving = Arc::clone(&server);
    let mut serve_task = tokio::spawn(async move { serving.serve().await });

    tokio::select! {
        joined = &mut serve_task => {
            joined
                .context("Accept loop panicked")?
                .context("Accept loop failed")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Interrupt received");
        }
    }

    server.shutdown().await;
    info!("Server on {} stopped", server.local_addr());
    Ok(())
}
