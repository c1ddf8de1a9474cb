//! Server network layer: UDP transport and the run loops of both roles

use crate::config::NodeConfig;
use crate::game_server::{GameServerNode, ProfileEdit};
use crate::lifecycle::OwnerKind;
use crate::master::{MasterNode, PersistJob};
use crate::peer_manager::{PeerManager, PeerSession};
use crate::storage::{ProfileStorage, StorageResult};
use crate::transport::{resolved, SendReceipt, Transport, TransportError};
use bincode::{deserialize, serialize};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use shared::{OpCode, OwnerId, Packet, PeerId, PeerRole, ProfileSchema, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM: usize = 65_507;

/// Peer id a game server uses for its master connection
pub const MASTER_PEER: PeerId = 0;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// [`Transport`] over a shared UDP socket
///
/// Every profile message is one bincode-encoded [`Packet::Profile`] datagram.
/// A receipt resolves once the datagram left the socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peers: DashMap<PeerId, SocketAddr>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            peers: DashMap::new(),
        }
    }

    pub fn register(&self, peer: PeerId, addr: SocketAddr) {
        self.peers.insert(peer, addr);
    }

    pub fn unregister(&self, peer: PeerId) {
        self.peers.remove(&peer);
    }

    pub fn addr_of(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers.get(&peer).map(|entry| *entry.value())
    }

    /// Sends a control packet, logging failures.
    pub fn send_packet(&self, packet: &Packet, addr: SocketAddr) {
        // Socket errors are logged by the send task; encode errors resolve here.
        let mut receipt = self.send_to(packet, addr);
        if let Ok(Err(err)) = receipt.try_recv() {
            error!("Failed to send packet to {}: {}", addr, err);
        }
    }

    fn send_to(&self, packet: &Packet, addr: SocketAddr) -> SendReceipt {
        let data = match serialize(packet) {
            Ok(data) => data,
            Err(e) => return resolved(Err(TransportError::Encode(e.to_string()))),
        };
        if data.len() > MAX_DATAGRAM {
            return resolved(Err(TransportError::Encode(format!(
                "{} bytes exceed a datagram",
                data.len()
            ))));
        }

        let (tx, rx) = oneshot::channel();
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let result = socket
                .send_to(&data, addr)
                .await
                .map(|_| ())
                .map_err(|e| TransportError::Io(e.to_string()));
            if let Err(e) = &result {
                error!("Failed to send packet to {}: {}", addr, e);
            }
            let _ = tx.send(result);
        });
        rx
    }
}

impl Transport for UdpTransport {
    fn send(&self, peer: PeerId, op: OpCode, owner: &str, payload: Vec<u8>) -> SendReceipt {
        let Some(addr) = self.addr_of(peer) else {
            return resolved(Err(TransportError::NotConnected(peer)));
        };
        let packet = Packet::Profile {
            op,
            owner: owner.to_string(),
            payload,
        };
        self.send_to(&packet, addr)
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }
}

/// Messages sent from network and storage tasks to a server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    PersistCompleted {
        owner: OwnerId,
        result: StorageResult<()>,
    },
    Shutdown,
}

/// Spawns task that continuously listens for incoming packets
fn spawn_network_receiver(socket: Arc<UdpSocket>, server_tx: mpsc::UnboundedSender<ServerMessage>) {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, addr)) => {
                    if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                        if let Err(e) = server_tx.send(ServerMessage::PacketReceived { packet, addr }) {
                            error!("Failed to send packet to main loop: {}", e);
                            break;
                        }
                    } else {
                        warn!("Failed to deserialize packet from {}", addr);
                    }
                }
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    });
}

/// Master server: profile cache, client tier and storage
pub struct MasterServer {
    socket: Arc<UdpSocket>,
    transport: Arc<UdpTransport>,
    peers: PeerManager,
    node: MasterNode,
    storage: Option<Arc<dyn ProfileStorage>>,
    config: NodeConfig,
    persist_tx: Option<mpsc::UnboundedSender<PersistJob>>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl MasterServer {
    pub async fn new(
        addr: &str,
        config: NodeConfig,
        schema: ProfileSchema,
        storage: Option<Arc<dyn ProfileStorage>>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Master server listening on {}", socket.local_addr()?);

        let transport = Arc::new(UdpTransport::new(Arc::clone(&socket)));
        let node = MasterNode::new(
            transport.clone(),
            schema,
            storage.clone(),
            config.client_flush_delay,
            config.persist_delay,
            config.grace_period,
        );
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(MasterServer {
            socket,
            transport,
            peers: PeerManager::new(config.max_peers, config.peer_timeout),
            node,
            storage,
            config,
            persist_tx: None,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender for injecting messages, e.g. [`ServerMessage::Shutdown`].
    pub fn handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task writing snapshots to storage one at a time, in order
    fn spawn_persist_worker(&mut self) {
        let Some(storage) = self.storage.clone() else {
            return;
        };
        let server_tx = self.server_tx.clone();
        let (persist_tx, mut persist_rx) = mpsc::unbounded_channel::<PersistJob>();

        tokio::spawn(async move {
            while let Some(job) = persist_rx.recv().await {
                let (owner, result) = job.run(storage.as_ref()).await;
                if server_tx
                    .send(ServerMessage::PersistCompleted { owner, result })
                    .is_err()
                {
                    break;
                }
            }
        });
        self.persist_tx = Some(persist_tx);
    }

    fn queue_persist(&self, job: PersistJob) {
        match &self.persist_tx {
            Some(persist_tx) => {
                if let Err(e) = persist_tx.send(job) {
                    error!("Failed to queue snapshot of {}", e.0.owner);
                }
            }
            None => debug!("No storage configured, dropping snapshot of {}", job.owner),
        }
    }

    fn reply(&self, packet: Packet, addr: SocketAddr) {
        self.transport.send_packet(&packet, addr);
    }

    /// Processes incoming packets
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        let now = Instant::now();
        match packet {
            Packet::Connect {
                client_version,
                role,
                owner,
                guest,
            } => {
                info!("{:?} connecting from {} (version: {})", role, addr, client_version);
                if client_version != PROTOCOL_VERSION {
                    self.reply(
                        Packet::Disconnected {
                            reason: format!("Unsupported protocol version {}", client_version),
                        },
                        addr,
                    );
                    return;
                }
                if role == PeerRole::Client && owner.is_none() {
                    self.reply(
                        Packet::Disconnected {
                            reason: "Client must name an owner".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                // Remove existing connection if present
                if let Some(existing) = self.peers.find_peer_by_addr(addr) {
                    info!("Removing existing peer {} from {}", existing, addr);
                    if let Some(session) = self.peers.remove_peer(existing) {
                        self.handle_peer_gone(session, now);
                    }
                }

                let Some(peer) = self.peers.add_peer(addr, role) else {
                    self.reply(
                        Packet::Disconnected {
                            reason: "Server full".to_string(),
                        },
                        addr,
                    );
                    return;
                };
                self.transport.register(peer.id, addr);
                self.reply(Packet::Connected { peer_id: peer.id }, addr);

                if let Some(owner) = owner {
                    self.peers.set_owner(peer.id, owner.clone());
                    let kind = if guest { OwnerKind::Guest } else { OwnerKind::Registered };
                    if let Err(e) = self.node.client_login(&owner, &peer, kind).await {
                        error!("Login of {} failed: {}", owner, e);
                        self.reply(
                            Packet::Disconnected {
                                reason: e.to_string(),
                            },
                            addr,
                        );
                        if let Some(session) = self.peers.remove_peer(peer.id) {
                            self.handle_peer_gone(session, now);
                        }
                    }
                }
            }

            Packet::Profile { op, owner, payload } => {
                let Some(peer_id) = self.peers.find_peer_by_addr(addr) else {
                    warn!("Profile message from unknown peer at {}", addr);
                    return;
                };
                let Some(session) = self.peers.session_mut(peer_id) else {
                    return;
                };
                session.touch();
                let peer = Arc::clone(&session.peer);

                match self.node.on_packet(&peer, op, &owner, &payload, now).await {
                    Ok(Some(job)) => self.queue_persist(job),
                    Ok(None) => {}
                    Err(e) => warn!("Dropped {:?} for {} from peer {}: {}", op, owner, peer_id, e),
                }
            }

            Packet::Heartbeat => {
                if let Some(session) = self
                    .peers
                    .find_peer_by_addr(addr)
                    .and_then(|id| self.peers.session_mut(id))
                {
                    session.touch();
                }
            }

            Packet::Disconnect => {
                if let Some(session) = self
                    .peers
                    .find_peer_by_addr(addr)
                    .and_then(|id| self.peers.remove_peer(id))
                {
                    self.handle_peer_gone(session, now);
                }
            }

            _ => {
                warn!("Unexpected packet type from peer at {}", addr);
            }
        }
    }

    fn handle_peer_gone(&mut self, session: PeerSession, now: Instant) {
        self.transport.unregister(session.peer.id);
        if let Some(owner) = session.owner {
            if let Some(job) = self.node.client_disconnect(&owner, session.peer.id, now) {
                self.queue_persist(job);
            }
        }
    }

    /// Main server loop
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        spawn_network_receiver(Arc::clone(&self.socket), self.server_tx.clone());
        self.spawn_persist_worker();

        let mut tick_interval = interval(self.config.tick_interval);
        let mut timeout_interval = interval(Duration::from_secs(1));
        let mut restore_interval = interval(self.config.restore_retry);

        info!("Master server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::PersistCompleted { owner, result }) => {
                            self.node.on_persist_result(&owner, result, Instant::now());
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Master server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    let tick = self.node.tick(Instant::now());
                    if tick.flush.sent > 0 || tick.flush.discarded > 0 {
                        debug!("Client tier: {:?}", tick.flush);
                    }
                    for job in tick.persist {
                        self.queue_persist(job);
                    }
                },

                _ = timeout_interval.tick() => {
                    let now = Instant::now();
                    for session in self.peers.check_timeouts() {
                        info!("Peer {} timed out", session.peer.id);
                        self.handle_peer_gone(session, now);
                    }
                },

                _ = restore_interval.tick() => {
                    let restored = self.node.retry_restores(Instant::now()).await;
                    if !restored.is_empty() {
                        info!("Restored stored profiles of {:?}", restored);
                    }
                },
            }
        }

        Ok(())
    }
}

/// Game logic requests fed into a [`GameServer`]
pub enum GameCommand {
    Join(OwnerId),
    Leave(OwnerId),
    Edit { owner: OwnerId, edit: ProfileEdit },
}

/// Game server: authoritative profiles of the players in one room
pub struct GameServer {
    socket: Arc<UdpSocket>,
    transport: Arc<UdpTransport>,
    node: GameServerNode,
    master_addr: SocketAddr,
    config: NodeConfig,
    connected: bool,
    waiting_joins: Vec<OwnerId>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    command_rx: mpsc::UnboundedReceiver<GameCommand>,
}

impl GameServer {
    /// Binds the server and returns it with the sender for game commands.
    pub async fn new(
        addr: &str,
        master_addr: &str,
        config: NodeConfig,
        schema: ProfileSchema,
    ) -> Result<(Self, mpsc::UnboundedSender<GameCommand>), Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let master_addr: SocketAddr = master_addr.parse()?;
        info!("Game server on {} using master {}", socket.local_addr()?, master_addr);

        let transport = Arc::new(UdpTransport::new(Arc::clone(&socket)));
        let node = GameServerNode::new(
            MASTER_PEER,
            transport.clone(),
            schema,
            config.game_flush_delay,
            config.grace_period,
        );
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let server = GameServer {
            socket,
            transport,
            node,
            master_addr,
            config,
            connected: false,
            waiting_joins: Vec::new(),
            server_tx,
            server_rx,
            command_rx,
        };
        Ok((server, command_tx))
    }

    pub fn handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    fn connect(&self) {
        info!("Connecting to master at {}", self.master_addr);
        self.transport.send_packet(
            &Packet::Connect {
                client_version: PROTOCOL_VERSION,
                role: PeerRole::GameServer,
                owner: None,
                guest: false,
            },
            self.master_addr,
        );
    }

    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if addr != self.master_addr {
            warn!("Ignoring packet from {}", addr);
            return;
        }
        match packet {
            Packet::Connected { peer_id } => {
                info!("Connected to master as peer {}", peer_id);
                self.transport.register(MASTER_PEER, self.master_addr);
                self.connected = true;
                for owner in std::mem::take(&mut self.waiting_joins) {
                    let _ = self.node.request_profile(&owner);
                }
            }

            Packet::Profile { op, owner, payload } => {
                if let Err(e) = self.node.on_packet(MASTER_PEER, op, &owner, &payload) {
                    warn!("Dropped {:?} for {}: {}", op, owner, e);
                }
            }

            Packet::Disconnected { reason } => {
                warn!("Master closed the connection: {}", reason);
                self.transport.unregister(MASTER_PEER);
                self.connected = false;
            }

            _ => {
                warn!("Unexpected packet type from master");
            }
        }
    }

    fn handle_command(&mut self, command: GameCommand) {
        let now = Instant::now();
        match command {
            GameCommand::Join(owner) => {
                if self.connected {
                    let _ = self.node.request_profile(&owner);
                } else {
                    self.waiting_joins.push(owner);
                }
            }
            GameCommand::Leave(owner) => {
                self.waiting_joins.retain(|waiting| *waiting != owner);
                self.node.release(&owner, now);
            }
            GameCommand::Edit { owner, edit } => {
                if let Err(e) = self.node.edit(&owner, now, edit) {
                    warn!("Edit of {} failed: {}", owner, e);
                }
            }
        }
    }

    /// Main server loop
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        spawn_network_receiver(Arc::clone(&self.socket), self.server_tx.clone());
        self.connect();

        let mut tick_interval = interval(self.config.tick_interval);
        let mut heartbeat_interval = interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr);
                        },
                        Some(ServerMessage::PersistCompleted { owner, .. }) => {
                            debug!("Game server has no storage, ignoring result for {}", owner);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Game server shutting down");
                            break;
                        }
                    }
                },

                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            info!("Game logic finished");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    let stats = self.node.tick(Instant::now());
                    if stats.failed > 0 {
                        warn!("{} flushes to master failed", stats.failed);
                    }
                },

                _ = heartbeat_interval.tick() => {
                    if self.connected {
                        self.transport.send_packet(&Packet::Heartbeat, self.master_addr);
                    } else {
                        self.connect();
                    }
                },
            }
        }

        // Last chance for pending changes before the socket goes away.
        let stats = self.node.tick(Instant::now() + self.config.game_flush_delay);
        debug!("Final flush: {:?}", stats);
        if self.connected {
            self.transport.send_packet(&Packet::Disconnect, self.master_addr);
        }
        Ok(())
    }
}
