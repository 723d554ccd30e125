//! `murmur peer`: the interactive peer.
//!
//! One process is both a server (other peers connect to it to talk to us)
//! and a client (we connect to the peer we picked with `/switch`). Discovery
//! runs in the background and keeps the list of reachable peers current.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use murmur_core::MurmurConfig;
use murmur_core::media::save_attachment;
use murmur_network::message::{Common, Media, Message};
use murmur_network::{
    Client, ClientRef, Codec, Handler, InMemoryHub, MulticastRegistry, NetworkConfig, Peer,
    Registry, SignalRegistry, TcpServer,
};

use crate::RegistryKind;
use crate::commands::Command;

#[derive(Args)]
pub struct PeerArgs {
    /// Name other peers see; defaults to the advertised address
    #[arg(long, default_value = "")]
    pub name: String,
    #[arg(long, value_enum, default_value_t = RegistryKind::Multicast)]
    pub registry: RegistryKind,
    #[arg(long, default_value = "127.0.0.1:8086")]
    pub signal_addr: String,
    /// Address our chat server listens on (defaults to the config file's)
    #[arg(long)]
    pub listen: Option<SocketAddr>,
    /// Address announced to other peers (defaults to the bound address)
    #[arg(long)]
    pub advertise_addr: Option<String>,
    /// Hex key file; every peer of the network must use the same one
    #[arg(long)]
    pub key_file: Option<PathBuf>,
}

pub async fn run(args: PeerArgs, config: NetworkConfig, home: &MurmurConfig) -> Result<()> {
    let codec = crate::chat_codec(args.key_file.as_deref())?;
    let (incoming_tx, mut incoming_rx) = mpsc::channel::<Message>(64);

    let hub = Arc::new(InMemoryHub::<Common>::from_config(&config));
    let listen = args.listen.unwrap_or(config.listen_addr);
    let server = TcpServer::bind(
        listen,
        hub,
        inbound_handler(incoming_tx.clone()),
        Arc::clone(&codec),
        config.limits(),
    )
    .await
    .with_context(|| format!("Failed to start chat server on {listen}"))?;
    let server = Arc::new(server);

    let serving = Arc::clone(&server);
    let serve_task = tokio::spawn(async move {
        if let Err(e) = serving.serve().await {
            error!("Chat server stopped: {e}");
        }
    });

    let addr = args
        .advertise_addr
        .clone()
        .unwrap_or_else(|| advertise_addr(server.local_addr()));
    let name = if args.name.is_empty() {
        addr.clone()
    } else {
        args.name.clone()
    };

    let mut registry: Box<dyn Registry> = match args.registry {
        RegistryKind::Multicast => Box::new(MulticastRegistry::new(config.multicast.clone())),
        RegistryKind::Signal => {
            Box::new(SignalRegistry::new(args.signal_addr.clone(), config.clone()))
        }
    };
    let discovery = match registry.register(Peer::new(&name, &addr)).await {
        Ok(()) => registry.peers(),
        Err(e) => Err(e),
    };
    let mut peer_rx = match discovery {
        Ok(rx) => rx,
        Err(e) => {
            server.shutdown().await;
            return Err(e).context("Failed to register with discovery");
        }
    };

    println!("You are @{name}, listening on {addr}");
    println!(
        "Commands: /list, /switch @name, /file <path>. Received files go to {}",
        home.storage_dir(&name).display()
    );

    let mut lines = crate::stdin_lines();
    let mut session = Session::new(
        name,
        codec,
        config,
        home.storage_root(),
        incoming_tx,
        std::io::stdout(),
    );

    let mut peers_open = true;
    loop {
        tokio::select! {
            update = peer_rx.recv(), if peers_open => match update {
                Some(peers) => session.update_peers(peers),
                None => {
                    warn!("Peer discovery stopped");
                    peers_open = false;
                }
            },
            line = lines.recv() => match line {
                Some(line) => session.handle_line(&line).await?,
                None => {
                    info!("Input closed");
                    break;
                }
            },
            Some(msg) = incoming_rx.recv() => session.receive(msg)?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        }
    }

    session.close().await;
    if let Err(e) = registry.unregister().await {
        warn!("Error unregistering: {e}");
    }
    stop_server(&server, incoming_rx).await;
    if let Err(e) = serve_task.await {
        warn!("Chat server task failed: {e}");
    }
    info!("Peer stopped");
    Ok(())
}

/// Hands every chat message other peers send us to the session.
fn inbound_handler(tx: mpsc::Sender<Message>) -> Arc<dyn Handler<Common>> {
    Arc::new(move |client: ClientRef<Common>, msg: Common| {
        let tx = tx.clone();
        async move {
            let Some(mut message) = msg.message else {
                debug!("Empty envelope from {}", client.name());
                return;
            };
            if message.from.name.is_empty() {
                message.from.name = client.name();
            }
            if tx.send(message).await.is_err() {
                debug!("Session gone, dropping message from {}", client.name());
            }
        }
    })
}

/// Shut the chat server down. The inbox is dropped first: a handler parked
/// on a full inbox would otherwise keep its connection task alive.
async fn stop_server(server: &TcpServer<Common>, incoming_rx: mpsc::Receiver<Message>) {
    drop(incoming_rx);
    server.shutdown().await;
}

/// The bound address, with a wildcard IP replaced by loopback.
fn advertise_addr(local: SocketAddr) -> String {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::from((Ipv4Addr::LOCALHOST, local.port())).to_string()
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::from((Ipv6Addr::LOCALHOST, local.port())).to_string()
        }
        _ => local.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Selected {
    peer: Peer,
    client: Client<Common>,
}

/// State of one interactive peer: who is out there and who we talk to.
struct Session<W> {
    name: String,
    codec: Arc<dyn Codec<Common>>,
    config: NetworkConfig,
    storage_root: PathBuf,
    available: BTreeMap<String, Peer>,
    selected: Option<Selected>,
    incoming_tx: mpsc::Sender<Message>,
    out: W,
}

impl<W: Write> Session<W> {
    fn new(
        name: String,
        codec: Arc<dyn Codec<Common>>,
        config: NetworkConfig,
        storage_root: PathBuf,
        incoming_tx: mpsc::Sender<Message>,
        out: W,
    ) -> Self {
        Self {
            name,
            codec,
            config,
            storage_root,
            available: BTreeMap::new(),
            selected: None,
            incoming_tx,
            out,
        }
    }

    /// Replace the known peers with a new snapshot.
    fn update_peers(&mut self, peers: Vec<Peer>) {
        debug!("Peer snapshot: {} peer(s)", peers.len());
        self.available = peers.into_iter().map(|p| (p.name.clone(), p)).collect();
    }

    async fn handle_line(&mut self, line: &str) -> Result<()> {
        let command = match Command::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(e) => {
                writeln!(self.out, "! {e}")?;
                return Ok(());
            }
        };

        match command {
            Command::List => {
                if self.available.is_empty() {
                    writeln!(self.out, "No peers found yet.")?;
                }
                for name in self.available.keys() {
                    writeln!(self.out, "@{name}")?;
                }
            }
            Command::Switch(name) => self.switch(&name).await?,
            Command::File(path) => self.send_file(&path).await?,
            Command::Text(text) => {
                let msg = Common::text(self.name.clone(), text.clone());
                self.send(&msg, &text).await?;
            }
        }
        Ok(())
    }

    async fn switch(&mut self, name: &str) -> Result<()> {
        let Some(peer) = self.available.get(name).cloned() else {
            writeln!(self.out, "! Peer {name} not found.")?;
            return Ok(());
        };

        if let Some(current) = &self.selected {
            if current.peer.name == name && !current.client.is_closed() {
                writeln!(self.out, "Already connected to @{name}.")?;
                return Ok(());
            }
            writeln!(self.out, "Disconnecting from @{}.", current.peer.name)?;
        }
        self.disconnect().await;

        info!("Connecting to peer {} on {}", peer.name, peer.addr);
        let client =
            match Client::connect_with_config(&peer.addr, Arc::clone(&self.codec), &self.config)
                .await
            {
                Ok(client) => client,
                Err(e) => {
                    writeln!(self.out, "! Cannot connect to @{} on {}: {e}", peer.name, peer.addr)?;
                    return Ok(());
                }
            };

        // Watch the link so a remote hang-up is noticed.
        let watcher = client.clone();
        let tx = self.incoming_tx.clone();
        tokio::spawn(async move {
            watcher
                .handle(move |msg: Common| {
                    let tx = tx.clone();
                    async move {
                        if let Some(message) = msg.message {
                            let _ = tx.send(message).await;
                        }
                    }
                })
                .await
        });

        writeln!(self.out, "Connected to @{}.", peer.name)?;
        self.selected = Some(Selected { peer, client });
        Ok(())
    }

    async fn send_file(&mut self, path: &Path) -> Result<()> {
        let media = match Media::from_file(path) {
            Ok(media) => media,
            Err(e) => {
                writeln!(self.out, "! Cannot read {}: {e}", path.display())?;
                return Ok(());
            }
        };
        let echo = format!("[File: {}]", path.display());
        let msg = Common::media(self.name.clone(), media);
        self.send(&msg, &echo).await
    }

    async fn send(&mut self, msg: &Common, echo: &str) -> Result<()> {
        let Some(selected) = &self.selected else {
            writeln!(self.out, "! No peer connected. Use /switch @name to connect.")?;
            return Ok(());
        };

        match selected.client.send(msg).await {
            Ok(()) => writeln!(self.out, "@You > @{}: {echo}", selected.peer.name)?,
            Err(e) => {
                let lost = selected.client.is_closed();
                writeln!(self.out, "! Cannot send to @{}: {e}", selected.peer.name)?;
                if lost {
                    self.selected = None;
                }
            }
        }
        Ok(())
    }

    /// Show a message a peer sent us, storing any attachment.
    fn receive(&mut self, msg: Message) -> Result<()> {
        let from = &msg.from.name;
        let Some(media) = &msg.media else {
            writeln!(self.out, "@{from} > @You: {}", msg.text)?;
            return Ok(());
        };

        let saved = media
            .decode_content()
            .map_err(anyhow::Error::from)
            .and_then(|bytes| save_attachment(&self.storage_root, &self.name, &media.filename, &bytes));
        match saved {
            Ok(path) => writeln!(self.out, "@{from} > @You: [File {}]", path.display())?,
            Err(e) => {
                warn!("Attachment from {from} not saved: {e:#}");
                writeln!(self.out, "! Attachment {:?} from @{from} not saved: {e}", media.filename)?;
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(selected) = self.selected.take() {
            selected.client.close().await;
        }
    }

    async fn close(&mut self) {
        self.disconnect().await;
        if let Err(e) = self.out.flush() {
            debug!("Flush failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
