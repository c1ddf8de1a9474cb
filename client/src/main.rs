use clap::Parser;
use client::network::Client;
use log::info;
use shared::schema::player_schema;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Master server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Owner id to log in as
    #[arg(short = 'o', long, default_value = "alice")]
    owner: String,

    /// Log in as a guest (profile is neither restored nor stored)
    #[arg(short = 'g', long)]
    guest: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {} as {}", args.server, args.owner);
    if args.guest {
        info!("Guest session, nothing will be stored");
    }

    let mut client = Client::new(&args.server, &args.owner, args.guest, &player_schema()).await?;

    client.run().await?;

    Ok(())
}
