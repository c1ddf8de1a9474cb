//! Integration tests for the three replication tiers
//!
//! Game server, master and client run in one process, wired together through
//! in-memory transports, except for the UDP tests at the end.

use assert_approx_eq::assert_approx_eq;
use bincode::{deserialize, serialize};
use client::replica::ClientReplica;
use server::game_server::GameServerNode;
use server::lifecycle::OwnerKind;
use server::master::MasterNode;
use server::network::MASTER_PEER;
use server::peer_manager::Peer;
use server::storage::MemoryStorage;
use server::transport::MemoryTransport;
use shared::schema::{keys, player_schema};
use shared::{
    ObservableFloat, ObservableInt, ObservableList, ObservableMap, ObservableString, OpCode, Packet, PeerId, PeerRole, Profile,
    ProfileResult,
    PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const GAME_DELAY: Duration = Duration::from_millis(100);
const CLIENT_DELAY: Duration = Duration::from_millis(250);
const PERSIST_DELAY: Duration = Duration::from_secs(1);
const GRACE: Duration = Duration::from_secs(10);
const STEP: Duration = Duration::from_millis(50);

const CLIENT_PEER: PeerId = 1;
const GAME_PEER: PeerId = 2;

/// All three tiers plus the pipes between them
struct Cluster {
    storage: Arc<MemoryStorage>,
    game_out: Arc<MemoryTransport>,
    master_out: Arc<MemoryTransport>,
    game: GameServerNode,
    master: MasterNode,
    client: ClientReplica,
    client_peer: Arc<Peer>,
    game_peer: Peer,
    start: Instant,
    elapsed: Duration,
}

impl Cluster {
    fn new(storage: Arc<MemoryStorage>) -> Self {
        let game_out = Arc::new(MemoryTransport::new());
        game_out.connect(MASTER_PEER);
        let master_out = Arc::new(MemoryTransport::new());
        master_out.connect(CLIENT_PEER);
        master_out.connect(GAME_PEER);

        Cluster {
            game: GameServerNode::new(MASTER_PEER, game_out.clone(), player_schema(), GAME_DELAY, GRACE),
            master: MasterNode::new(
                master_out.clone(),
                player_schema(),
                Some(storage.clone()),
                CLIENT_DELAY,
                PERSIST_DELAY,
                GRACE,
            ),
            client: ClientReplica::new("alice", &player_schema()).unwrap(),
            client_peer: Arc::new(Peer {
                id: CLIENT_PEER,
                addr: "127.0.0.1:7001".parse().unwrap(),
                role: PeerRole::Client,
            }),
            game_peer: Peer {
                id: GAME_PEER,
                addr: "127.0.0.1:7002".parse().unwrap(),
                role: PeerRole::GameServer,
            },
            storage,
            game_out,
            master_out,
            start: Instant::now(),
            elapsed: Duration::ZERO,
        }
    }

    fn now(&self) -> Instant {
        self.start + self.elapsed
    }

    /// Moves the clock forward by `by`, ticking every [`STEP`].
    async fn advance(&mut self, by: Duration) {
        let end = self.elapsed + by;
        while self.elapsed < end {
            self.elapsed = (self.elapsed + STEP).min(end);
            let now = self.now();
            self.step(now).await;
        }
    }

    /// Delivers every queued message, in send order per direction.
    async fn pump(&mut self, now: Instant) {
        loop {
            let from_master = self.master_out.take_sent();
            let from_game = self.game_out.take_sent();
            if from_master.is_empty() && from_game.is_empty() {
                break;
            }

            for message in from_master {
                match message.peer {
                    CLIENT_PEER => {
                        match message.op {
                            OpCode::ProfileSnapshot => self.client.on_snapshot(&message.payload).unwrap(),
                            OpCode::ProfileDelta => self.client.on_delta(&message.payload).unwrap(),
                            op => panic!("client got {:?}", op),
                        };
                    }
                    GAME_PEER => {
                        self.game
                            .on_packet(MASTER_PEER, message.op, &message.owner, &message.payload)
                            .unwrap();
                    }
                    peer => panic!("message for unknown peer {}", peer),
                }
            }

            for message in from_game {
                if let Some(job) = self
                    .master
                    .on_packet(&self.game_peer, message.op, &message.owner, &message.payload, now)
                    .await
                    .unwrap()
                {
                    let (owner, result) = job.run(self.storage.as_ref()).await;
                    self.master.on_persist_result(&owner, result, now);
                }
            }
        }
    }

    /// Ticks both servers at `now`, runs persist jobs and delivers messages.
    async fn step(&mut self, now: Instant) {
        self.game.tick(now);
        self.pump(now).await;
        let tick = self.master.tick(now);
        for job in tick.persist {
            let (owner, result) = job.run(self.storage.as_ref()).await;
            self.master.on_persist_result(&owner, result, now);
        }
        self.pump(now).await;
    }

    async fn login_and_join(&mut self) {
        self.master
            .client_login("alice", &self.client_peer, OwnerKind::Registered)
            .await
            .unwrap();
        self.game.request_profile("alice");
        let now = self.now();
        self.pump(now).await;
    }
}

fn coins(profile: &Profile) -> i32 {
    *profile.property::<ObservableInt>(keys::COINS).unwrap().get()
}

/// END TO END REPLICATION
mod replication_tests {
    use super::*;

    fn inventory_of(profile: &Profile) -> Vec<String> {
        profile
            .property::<ObservableList<String>>(keys::INVENTORY)
            .unwrap()
            .as_slice()
            .to_vec()
    }

    #[tokio::test]
    async fn game_change_reaches_client_and_storage() {
        let mut cluster = Cluster::new(Arc::new(MemoryStorage::new()));
        cluster.login_and_join().await;
        assert!(cluster.client.is_loaded());
        assert!(cluster.game.is_loaded("alice"));

        let now = cluster.now();
        cluster
            .game
            .modify("alice", keys::COINS, now, |c: &mut ObservableInt| c.add(150, 1000))
            .unwrap();
        cluster
            .game
            .modify("alice", keys::INVENTORY, now, |l: &mut ObservableList<String>| {
                l.add_range(["sword".to_string(), "torch".to_string()])
            })
            .unwrap();
        cluster
            .game
            .modify("alice", keys::QUEST_PROGRESS, now, |m: &mut ObservableMap<String, i32>| {
                m.set("intro".to_string(), 2)
            })
            .unwrap();
        cluster
            .game
            .modify("alice", keys::VOLUME, now, |v: &mut ObservableFloat| v.set(0.35))
            .unwrap();

        cluster.advance(GAME_DELAY).await;
        // Master has it, client timer still running.
        assert_eq!(cluster.master.cache().with("alice", |p| coins(p.profile())), Some(150));
        assert_eq!(coins(cluster.client.profile()), 0);

        cluster.advance(CLIENT_DELAY).await;
        assert_eq!(coins(cluster.client.profile()), 150);
        assert_eq!(
            inventory_of(cluster.client.profile()),
            vec!["sword".to_string(), "torch".to_string()]
        );
        assert_approx_eq!(
            *cluster
                .client
                .property::<ObservableFloat>(keys::VOLUME)
                .unwrap()
                .get(),
            0.35
        );
        assert!(cluster.storage.snapshot("alice").is_none());

        cluster.advance(PERSIST_DELAY).await;
        let mut stored = player_schema().build().unwrap();
        stored
            .decode_snapshot(&cluster.storage.snapshot("alice").unwrap())
            .unwrap();
        assert_eq!(coins(&stored), 150);
        let quests = stored
            .property::<ObservableMap<String, i32>>(keys::QUEST_PROGRESS)
            .unwrap();
        assert_eq!(quests.get(&"intro".to_string()), Some(&2));
    }

    #[tokio::test]
    async fn list_edits_replay_identically_on_every_tier() {
        let mut cluster = Cluster::new(Arc::new(MemoryStorage::new()));
        cluster.login_and_join().await;

        let now = cluster.now();
        cluster
            .game
            .modify("alice", keys::INVENTORY, now, |l: &mut ObservableList<String>| {
                l.add_range(["1".to_string(), "2".to_string(), "3".to_string()])
            })
            .unwrap();
        cluster.advance(GAME_DELAY + CLIENT_DELAY).await;

        let later = cluster.now();
        cluster
            .game
            .modify(
                "alice",
                keys::INVENTORY,
                later,
                |l: &mut ObservableList<String>| -> ProfileResult<()> {
                    l.remove_at(1)?;
                    l.add("9".to_string());
                    l.insert(0, "0".to_string())
                },
            )
            .unwrap()
            .unwrap();
        cluster.advance(GAME_DELAY + CLIENT_DELAY).await;

        let expected = vec!["0".to_string(), "1".to_string(), "3".to_string(), "9".to_string()];
        let on_game = cluster
            .game
            .cache()
            .with("alice", |p| inventory_of(p.profile()))
            .unwrap();
        let on_master = cluster
            .master
            .cache()
            .with("alice", |p| inventory_of(p.profile()))
            .unwrap();
        assert_eq!(on_game, expected);
        assert_eq!(on_master, expected);
        assert_eq!(inventory_of(cluster.client.profile()), expected);
    }

    #[tokio::test]
    async fn stored_profile_is_restored_on_login() {
        let storage = Arc::new(MemoryStorage::new());
        let mut saved = player_schema().build().unwrap();
        saved
            .update(keys::NICKNAME, |n: &mut ObservableString| n.set("Ali".to_string()))
            .unwrap();
        saved
            .update(keys::COINS, |c: &mut ObservableInt| c.set(800))
            .unwrap();
        storage.insert("alice", saved.encode_snapshot());

        let mut cluster = Cluster::new(storage);
        cluster.login_and_join().await;

        assert_eq!(coins(cluster.client.profile()), 800);
        let nickname = cluster
            .game
            .cache()
            .with("alice", |p| {
                p.profile()
                    .property::<ObservableString>(keys::NICKNAME)
                    .unwrap()
                    .get()
                    .clone()
            })
            .unwrap();
        assert_eq!(nickname, "Ali");
    }

    #[tokio::test]
    async fn storage_outage_does_not_block_login() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_offline(true);
        let mut cluster = Cluster::new(storage);

        let acquisition = cluster
            .master
            .client_login("alice", &cluster.client_peer, OwnerKind::Registered)
            .await
            .unwrap();
        assert!(acquisition.created);
        assert!(acquisition.warning.is_some());

        let now = cluster.now();
        cluster.pump(now).await;
        assert!(cluster.client.is_loaded());
        assert_eq!(coins(cluster.client.profile()), 0);
    }
}

/// DISCONNECT AND EVICTION
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_discards_client_deltas_and_persists_immediately() {
        let mut cluster = Cluster::new(Arc::new(MemoryStorage::new()));
        cluster.login_and_join().await;

        let now = cluster.now();
        cluster
            .game
            .modify("alice", keys::COINS, now, |c: &mut ObservableInt| c.set(42))
            .unwrap();
        cluster.advance(GAME_DELAY).await;
        assert!(cluster.master.clients().is_busy("alice"));

        let now = cluster.now();
        let job = cluster.master.client_disconnect("alice", CLIENT_PEER, now).unwrap();
        assert!(!cluster.master.clients().is_busy("alice"));
        let (owner, result) = job.run(cluster.storage.as_ref()).await;
        assert_eq!(owner, "alice");
        cluster.master.on_persist_result(&owner, result, now);
        assert!(cluster.master.persist_scheduler().is_idle("alice"));

        cluster.advance(CLIENT_DELAY).await;
        assert_eq!(coins(cluster.client.profile()), 0);

        let mut stored = player_schema().build().unwrap();
        stored
            .decode_snapshot(&cluster.storage.snapshot("alice").unwrap())
            .unwrap();
        assert_eq!(coins(&stored), 42);
    }

    #[tokio::test]
    async fn relogin_within_grace_reuses_cached_profile() {
        let mut cluster = Cluster::new(Arc::new(MemoryStorage::new()));
        cluster.login_and_join().await;

        let now = cluster.now();
        cluster
            .game
            .modify("alice", keys::COINS, now, |c: &mut ObservableInt| c.set(7))
            .unwrap();
        cluster.advance(GAME_DELAY).await;
        let now = cluster.now();
        cluster.master.client_disconnect("alice", CLIENT_PEER, now);

        let returning = Arc::new(Peer {
            id: CLIENT_PEER,
            addr: "127.0.0.1:7001".parse().unwrap(),
            role: PeerRole::Client,
        });
        let acquisition = cluster
            .master
            .client_login("alice", &returning, OwnerKind::Registered)
            .await
            .unwrap();
        assert!(!acquisition.created);
        cluster.client_peer = returning;

        cluster.client = ClientReplica::new("alice", &player_schema()).unwrap();
        cluster.pump(now).await;
        assert_eq!(coins(cluster.client.profile()), 7);

        cluster.advance(GRACE).await;
        assert!(cluster.master.cache().contains("alice"));
    }

    #[tokio::test]
    async fn game_leave_evicts_after_grace() {
        let mut cluster = Cluster::new(Arc::new(MemoryStorage::new()));
        cluster.login_and_join().await;

        let now = cluster.now();
        cluster
            .game
            .modify("alice", keys::LEVEL, now, |c: &mut ObservableInt| c.set(3))
            .unwrap();
        cluster.game.release("alice", now);

        cluster.advance(GAME_DELAY).await;
        assert!(cluster.game.is_loaded("alice"));
        assert_eq!(
            cluster
                .master
                .cache()
                .with("alice", |p| *p.profile().property::<ObservableInt>(keys::LEVEL).unwrap().get()),
            Some(3)
        );

        cluster.advance(GRACE).await;
        assert!(!cluster.game.is_loaded("alice"));
        // The client is still logged in, so the master keeps the profile.
        assert!(cluster.master.cache().contains("alice"));
    }
}

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;
    use server::config::NodeConfig;
    use server::network::{MasterServer, ServerMessage};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    /// Tests packet serialization round-trip for network protocol validation
    #[tokio::test]
    async fn packet_serialization_roundtrip() {
        let test_packets = vec![
            Packet::Connect {
                client_version: PROTOCOL_VERSION,
                role: PeerRole::GameServer,
                owner: None,
                guest: false,
            },
            Packet::Profile {
                op: OpCode::ProfileRelease,
                owner: "alice".to_string(),
                payload: vec![],
            },
            Packet::Heartbeat,
            Packet::Disconnect,
            Packet::Connected { peer_id: 42 },
            Packet::Disconnected {
                reason: "Test".to_string(),
            },
        ];

        for packet in test_packets {
            let serialized = serialize(&packet).unwrap();
            let deserialized: Packet = deserialize(&serialized).unwrap();
            assert_eq!(deserialized, packet);
        }
    }

    async fn recv_packet(socket: &UdpSocket) -> Packet {
        let mut buffer = vec![0u8; 65_507];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .expect("timed out waiting for the master")
            .unwrap();
        deserialize(&buffer[..len]).unwrap()
    }

    /// Logs in over real UDP and receives the profile snapshot
    #[tokio::test]
    async fn master_serves_snapshot_over_udp() {
        let storage = Arc::new(MemoryStorage::new());
        let mut saved = player_schema().build().unwrap();
        saved
            .update(keys::COINS, |c: &mut ObservableInt| c.set(31))
            .unwrap();
        storage.insert("alice", saved.encode_snapshot());

        let mut server = MasterServer::new("127.0.0.1:0", NodeConfig::default(), player_schema(), Some(storage))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            role: PeerRole::Client,
            owner: Some("alice".to_string()),
            guest: false,
        };
        socket.send_to(&serialize(&connect).unwrap(), addr).await.unwrap();

        let mut replica = ClientReplica::new("alice", &player_schema()).unwrap();
        let mut connected = false;
        while !(connected && replica.is_loaded()) {
            match recv_packet(&socket).await {
                Packet::Connected { .. } => connected = true,
                Packet::Profile {
                    op: OpCode::ProfileSnapshot,
                    payload,
                    ..
                } => {
                    replica.on_snapshot(&payload).unwrap();
                }
                other => panic!("unexpected packet {:?}", other),
            }
        }
        assert_eq!(coins(replica.profile()), 31);

        handle.send(ServerMessage::Shutdown).unwrap();
        task.await.unwrap();
    }

    /// Tests that an outdated protocol version is refused
    #[tokio::test]
    async fn master_rejects_wrong_version() {
        let mut server = MasterServer::new("127.0.0.1:0", NodeConfig::default(), player_schema(), None)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = Packet::Connect {
            client_version: PROTOCOL_VERSION + 1,
            role: PeerRole::Client,
            owner: Some("alice".to_string()),
            guest: false,
        };
        socket.send_to(&serialize(&connect).unwrap(), addr).await.unwrap();
        assert!(matches!(recv_packet(&socket).await, Packet::Disconnected { .. }));

        handle.send(ServerMessage::Shutdown).unwrap();
        task.await.unwrap();
    }
}
