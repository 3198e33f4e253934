use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use coordinator::RoomCoordinator;
use shared::domain::{RoomCode, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/meetup.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints the stable user id for a username, creating it on first use.
    Login { username: String },
    CreateRoom { owner: UserId },
    JoinRoom { code: RoomCode, user: UserId },
    BeginPlanning { code: RoomCode, caller: UserId },
    /// Dumps the room snapshot as JSON.
    Status { code: RoomCode },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("warn").init();

    let cli = Cli::parse();
    let storage = Arc::new(Storage::new(&cli.database_url).await?);
    let coordinator = RoomCoordinator::new(storage.clone());

    match cli.command {
        Command::Login { username } => {
            let user_id = storage.login(username.trim()).await?;
            println!("user_id={user_id}");
        }
        Command::CreateRoom { owner } => {
            let room = coordinator.create_room(owner).await?;
            println!("created room code={}", room.code);
        }
        Command::JoinRoom { code, user } => {
            let room = coordinator.join_room(&code, user).await?;
            println!("joined room code={} phase={}", room.code, room.phase);
        }
        Command::BeginPlanning { code, caller } => {
            let changed = coordinator.begin_planning(&code, caller).await?;
            println!("begin_planning changed={changed}");
        }
        Command::Status { code } => {
            let snapshot = coordinator.snapshot(&code).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}
