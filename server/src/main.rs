use clap::{Parser, ValueEnum};
use log::info;
use rand::seq::SliceRandom;
use rand::Rng;
use server::config::NodeConfig;
use server::game_server::ProfileEdit;
use server::network::{GameCommand, GameServer, MasterServer};
use server::server_profile::ServerProfile;
use server::storage::{FileStorage, MemoryStorage, ProfileStorage};
use shared::schema::{keys, player_schema};
use shared::{ObservableDateTime, ObservableInt, ObservableList, ObservableLong, ProfileResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Master,
    Game,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Which tier this process runs
    #[arg(short, long, value_enum, default_value = "master")]
    role: Role,

    /// IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Master address (game role)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    master: String,

    /// Game server -> master debounce in milliseconds
    #[arg(long, default_value = "100")]
    game_flush_ms: u64,

    /// Master -> client debounce in milliseconds
    #[arg(long, default_value = "250")]
    client_flush_ms: u64,

    /// Storage write debounce in milliseconds
    #[arg(long, default_value = "1000")]
    persist_ms: u64,

    /// How long released profiles stay cached, in milliseconds
    #[arg(long, default_value = "10000")]
    grace_ms: u64,

    /// Loop tick in milliseconds
    #[arg(long, default_value = "20")]
    tick_ms: u64,

    /// Directory for stored profiles (master role); in-memory when omitted
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Players joining the demo room (game role)
    #[arg(long, value_delimiter = ',', default_value = "alice,bob")]
    players: Vec<String>,
}

fn award_coins(amount: i32) -> ProfileEdit {
    Box::new(move |profile: &mut ServerProfile| -> ProfileResult<bool> {
        let (added, _) = profile.update(keys::COINS, |coins: &mut ObservableInt| coins.add(amount, 1_000_000))?;
        profile.update(keys::EXPERIENCE, |xp: &mut ObservableLong| xp.add(i64::from(amount), i64::MAX))?;
        Ok(added)
    })
}

fn find_item(item: &'static str) -> ProfileEdit {
    Box::new(move |profile: &mut ServerProfile| -> ProfileResult<bool> {
        profile.update(keys::INVENTORY, |inventory: &mut ObservableList<String>| {
            inventory.add(item.to_string());
        })?;
        Ok(true)
    })
}

fn stamp_login() -> ProfileEdit {
    Box::new(|profile: &mut ServerProfile| -> ProfileResult<bool> {
        let (changed, _) = profile.update(keys::LAST_LOGIN, |at: &mut ObservableDateTime| {
            at.set(OffsetDateTime::now_utc())
        })?;
        Ok(changed)
    })
}

/// Demo game logic: players join, earn coins and find items, then leave.
async fn run_demo_room(players: Vec<String>, commands: tokio::sync::mpsc::UnboundedSender<GameCommand>) {
    const ITEMS: [&str; 4] = ["sword", "shield", "potion", "map"];

    for player in &players {
        if commands.send(GameCommand::Join(player.clone())).is_err() {
            return;
        }
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    for player in &players {
        let _ = commands.send(GameCommand::Edit {
            owner: player.clone(),
            edit: stamp_login(),
        });
    }

    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let (player, edit) = {
            let mut rng = rand::thread_rng();
            let Some(player) = players.choose(&mut rng).cloned() else {
                return;
            };
            let edit = if rng.gen_bool(0.2) {
                ITEMS.choose(&mut rng).map(|item| find_item(*item))
            } else {
                Some(award_coins(rng.gen_range(1..=50)))
            };
            (player, edit)
        };
        if let Some(edit) = edit {
            if commands.send(GameCommand::Edit { owner: player, edit }).is_err() {
                return;
            }
        }
    }

    for player in players {
        let _ = commands.send(GameCommand::Leave(player));
    }
    info!("Demo room finished");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = NodeConfig::from_millis(
        args.game_flush_ms,
        args.client_flush_ms,
        args.persist_ms,
        args.grace_ms,
        args.tick_ms,
    );
    let address = format!("{}:{}", args.host, args.port);

    match args.role {
        Role::Master => {
            let storage: Arc<dyn ProfileStorage> = match &args.storage_dir {
                Some(dir) => {
                    info!("Storing profiles in {}", dir.display());
                    Arc::new(FileStorage::new(dir))
                }
                None => {
                    info!("No storage directory given, profiles live in memory");
                    Arc::new(MemoryStorage::new())
                }
            };
            let mut server = MasterServer::new(&address, config, player_schema(), Some(storage)).await?;
            server.run().await?;
        }
        Role::Game => {
            let (mut server, commands) = GameServer::new(&address, &args.master, config, player_schema()).await?;
            tokio::spawn(run_demo_room(args.players, commands));
            server.run().await?;
        }
    }

    Ok(())
}
