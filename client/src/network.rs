//! UDP session with the master that keeps the local replica up to date

use crate::replica::ClientReplica;
use bincode::{deserialize, serialize};
use log::{error, info, warn};
use shared::{OpCode, Packet, PeerId, PeerRole, ProfileSchema, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::interval;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    peer_id: Option<PeerId>,
    connected: bool,
    guest: bool,

    replica: ClientReplica,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        owner: &str,
        guest: bool,
        schema: &ProfileSchema,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            peer_id: None,
            connected: false,
            guest,
            replica: ClientReplica::new(owner, schema)?,
        })
    }

    pub fn replica(&self) -> &ClientReplica {
        &self.replica
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to master as {}...", self.replica.owner());

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            role: PeerRole::Client,
            owner: Some(self.replica.owner().to_string()),
            guest: self.guest,
        };
        self.send_packet(&packet).await?;

        Ok(())
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    /// Applies one packet from the master to the local replica.
    pub fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Connected { peer_id } => {
                info!("Connected! Peer ID: {}", peer_id);
                self.peer_id = Some(peer_id);
                self.connected = true;
            }

            Packet::Profile { op, owner, payload } => {
                if owner != self.replica.owner() {
                    warn!("Ignoring profile of {}", owner);
                    return;
                }
                let result = match op {
                    OpCode::ProfileSnapshot => self.replica.on_snapshot(&payload),
                    OpCode::ProfileDelta => self.replica.on_delta(&payload),
                    _ => {
                        warn!("Unexpected {:?} from master", op);
                        return;
                    }
                };
                if let Err(e) = result {
                    error!("Rejected {:?} for {}: {}", op, owner, e);
                    return;
                }
                self.log_changes();
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                self.peer_id = None;
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }
    }

    fn log_changes(&mut self) {
        let changed = self.replica.take_changed();
        if changed.is_empty() {
            return;
        }
        let strings = self.replica.strings();
        for key in changed {
            if let Some(value) = strings.get(&key) {
                info!("[{}] property {} = {}", self.replica.owner(), key, value);
            }
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut heartbeat_interval = interval(HEARTBEAT_INTERVAL);
        let mut buffer = vec![0u8; 65_507];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) if addr == self.server_addr => {
                            if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                                self.handle_packet(packet);
                            }
                        },
                        Ok((_, addr)) => warn!("Ignoring datagram from {}", addr),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = heartbeat_interval.tick() => {
                    let result = if self.connected {
                        self.send_packet(&Packet::Heartbeat).await
                    } else {
                        self.connect().await
                    };
                    if let Err(e) = result {
                        error!("Error sending heartbeat: {}", e);
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    break;
                },
            }
        }

        if self.connected {
            let _ = self.send_packet(&Packet::Disconnect).await;
        }

        Ok(())
    }
}
