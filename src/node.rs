//! # High-Level Node API
//!
//! A [`Node`] wraps the [`PeerManager`] in the actor pattern: the public
//! handle is cheap to clone and talks to a private actor over a command
//! channel, and the actor owns all mutable state, processing commands,
//! transport events, and the two periodic timers strictly one at a time.
//! That single sequential loop is what the manager's invariants rely on:
//! no locks, no concurrent mutation.
//!
//! ## Quick Start
//!
//! ```ignore
//! let keypair = Keypair::generate();
//! let local = LocalPeer::new(keypair, AgentVersion::new("weft", 1, "demo"), boxer)
//!     .with_port(9033);
//! let (node, mut events) = Node::launch(local, MeshConfig::default(), direct, assisted);
//! node.start().await?;
//!
//! let peer = node.connect_to_address("198.51.100.7:9033").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```
//!
//! ## Life-cycle
//!
//! - [`Node::launch`] spawns the actor with the timers idle.
//! - [`Node::start`] begins the peer-list broadcast (5 s) and disposal
//!   sweep (2 s).
//! - [`Node::stop`] disconnects every peer with `ShuttingDown` and idles
//!   the timers; a later `start` resumes from a clean slate.
//! - [`Node::shutdown`] stops and ends the actor for good.

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::event::MeshEvent;
use crate::identity::Identity;
use crate::manager::{MeshStats, PeerManager, PeerSummary};
use crate::messages::DisconnectReason;
use crate::peer::{LocalPeer, PeerId};
use crate::transport::{AssistedTransport, DirectTransport, TransportEvent};

/// Commands sent from the handle to the actor.
enum Command {
    Start,
    Stop(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
    ConnectAddress(String, oneshot::Sender<Result<PeerId, MeshError>>),
    ConnectDirect(PeerId, oneshot::Sender<bool>),
    ConnectAssisted(PeerId, oneshot::Sender<bool>),
    Disconnect(PeerId, DisconnectReason, u64, oneshot::Sender<()>),
    SendTo(PeerId, Vec<u8>, oneshot::Sender<bool>),
    Broadcast(Vec<u8>),
    Stats(oneshot::Sender<MeshStats>),
    Peers(oneshot::Sender<Vec<PeerSummary>>),
    Lookup(Identity, oneshot::Sender<Option<PeerId>>),
}

/// Public handle to a running overlay node (cheap to clone).
#[derive(Clone)]
pub struct Node {
    identity: Identity,
    cmd_tx: mpsc::Sender<Command>,
}

impl Node {
    /// Spawn the node actor around its transports. Returns the handle and
    /// the public event stream. The periodic tasks stay idle until
    /// [`start`](Self::start).
    pub fn launch(
        local: LocalPeer,
        config: MeshConfig,
        direct: Box<dyn DirectTransport>,
        assisted: Box<dyn AssistedTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let identity = local.identity();
        let broadcast_every = config.broadcast_interval;
        let dispose_every = config.dispose_interval;

        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let (manager, events_rx) = PeerManager::new(local, config, direct, assisted, net_tx);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let actor = NodeActor {
            manager,
            running: false,
        };
        tokio::spawn(actor.run(cmd_rx, net_rx, broadcast_every, dispose_every));

        (Self { identity, cmd_tx }, events_rx)
    }

    /// This node's identity.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    async fn send(&self, cmd: Command) -> anyhow::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| anyhow::anyhow!("node actor closed"))
    }

    /// Begin the periodic peer-list broadcast and disposal sweep.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.send(Command::Start).await
    }

    /// Disconnect every peer with `ShuttingDown` and idle the periodic
    /// tasks. The actor stays alive; `start` brings it back.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.request(Command::Stop).await
    }

    /// Stop and end the actor.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.request(Command::Shutdown).await
    }

    /// Create a peer for `address:port` and dial it over the direct
    /// transport.
    pub async fn connect_to_address(&self, uri: &str) -> anyhow::Result<PeerId> {
        let uri = uri.to_string();
        self.request(|tx| Command::ConnectAddress(uri, tx))
            .await?
            .map_err(anyhow::Error::from)
    }

    /// Dial a known peer's address over the direct transport.
    pub async fn connect_via_direct(&self, peer: PeerId) -> anyhow::Result<bool> {
        self.request(|tx| Command::ConnectDirect(peer, tx)).await
    }

    /// Establish an assisted session to a known peer through a broker.
    pub async fn connect_via_assisted(&self, peer: PeerId) -> anyhow::Result<bool> {
        self.request(|tx| Command::ConnectAssisted(peer, tx)).await
    }

    /// Ask a peer to stay away until `until_ms` and tear it down.
    pub async fn disconnect(
        &self,
        peer: PeerId,
        reason: DisconnectReason,
        until_ms: u64,
    ) -> anyhow::Result<()> {
        self.request(|tx| Command::Disconnect(peer, reason, until_ms, tx))
            .await
    }

    /// Send an application frame to a connected peer.
    pub async fn send_to(&self, peer: PeerId, data: Vec<u8>) -> anyhow::Result<bool> {
        self.request(|tx| Command::SendTo(peer, data, tx)).await
    }

    /// Send an application frame to every connected peer.
    pub async fn broadcast(&self, data: Vec<u8>) -> anyhow::Result<()> {
        self.send(Command::Broadcast(data)).await
    }

    pub async fn stats(&self) -> anyhow::Result<MeshStats> {
        self.request(Command::Stats).await
    }

    pub async fn peers(&self) -> anyhow::Result<Vec<PeerSummary>> {
        self.request(Command::Peers).await
    }

    /// Resolve an identity to its peer token.
    pub async fn lookup(&self, identity: Identity) -> anyhow::Result<Option<PeerId>> {
        self.request(|tx| Command::Lookup(identity, tx)).await
    }
}

/// The actor: owns the manager, processes everything sequentially.
struct NodeActor {
    manager: PeerManager,
    running: bool,
}

impl NodeActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut net_rx: mpsc::UnboundedReceiver<TransportEvent>,
        broadcast_every: std::time::Duration,
        dispose_every: std::time::Duration,
    ) {
        let mut broadcast = tokio::time::interval(broadcast_every);
        let mut sweep = tokio::time::interval(dispose_every);
        broadcast.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Start) => {
                            debug!("node starting periodic tasks");
                            broadcast.reset();
                            sweep.reset();
                            self.running = true;
                        }
                        Some(Command::Stop(reply)) => {
                            self.manager.stop();
                            self.running = false;
                            let _ = reply.send(());
                        }
                        Some(Command::Shutdown(reply)) => {
                            self.manager.stop();
                            let _ = reply.send(());
                            break;
                        }
                        Some(Command::ConnectAddress(uri, reply)) => {
                            let _ = reply.send(self.manager.connect_to_address(&uri));
                        }
                        Some(Command::ConnectDirect(peer, reply)) => {
                            let _ = reply.send(self.manager.connect_via_direct(peer));
                        }
                        Some(Command::ConnectAssisted(peer, reply)) => {
                            let _ = reply.send(self.manager.connect_via_assisted(peer));
                        }
                        Some(Command::Disconnect(peer, reason, until_ms, reply)) => {
                            self.manager.disconnect(peer, reason, until_ms);
                            let _ = reply.send(());
                        }
                        Some(Command::SendTo(peer, data, reply)) => {
                            let _ = reply.send(self.manager.send_to(peer, &data));
                        }
                        Some(Command::Broadcast(data)) => {
                            self.manager.broadcast(&data);
                        }
                        Some(Command::Stats(reply)) => {
                            let _ = reply.send(self.manager.stats());
                        }
                        Some(Command::Peers(reply)) => {
                            let _ = reply.send(self.manager.summaries());
                        }
                        Some(Command::Lookup(identity, reply)) => {
                            let _ = reply.send(self.manager.identified(&identity));
                        }
                        None => {
                            debug!("node handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                Some(ev) = net_rx.recv() => {
                    self.manager.handle_transport_event(ev);
                }
                _ = broadcast.tick(), if self.running => {
                    self.manager.broadcast_peer_list();
                }
                _ = sweep.tick(), if self.running => {
                    self.manager.dispose_peers();
                }
            }
        }
    }
}
