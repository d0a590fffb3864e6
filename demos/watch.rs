//! Discover a HEOS system and print state updates until Ctrl-C
//!
//! Set `HEOS_USERNAME` and `HEOS_PASSWORD` to sign in to the HEOS account.
//! Pass a `heos://` command as the first argument to send it once connected.

use heos_control::{
    BasicPlayerFactory, ConnectionState, Credentials, HeosClient, MemoryStore, SessionConfig,
    StateUpdate, UserCommand,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut config = SessionConfig::default();
    if let (Ok(username), Ok(password)) = (std::env::var("HEOS_USERNAME"), std::env::var("HEOS_PASSWORD")) {
        config.credentials = Some(Credentials { username, password });
    }
    let command = std::env::args().nth(1);

    let store = Arc::new(MemoryStore::new());
    let factory = Arc::new(BasicPlayerFactory::new(store.clone()));
    let client = HeosClient::start(config, store.clone(), factory);
    let mut updates = client.subscribe_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => {
                let update = match update {
                    Ok(update) => update,
                    Err(e) => {
                        eprintln!("Update stream ended: {}", e);
                        break;
                    }
                };
                match update {
                    StateUpdate::ConnectionChanged { state, address } => {
                        println!("Connection: {} {:?}", state, address);
                        if state == ConnectionState::Connected {
                            if let Some(command) = &command {
                                client.send(UserCommand::Raw(command.clone()))?;
                            }
                        }
                    }
                    StateUpdate::PlayersChanged(players) => {
                        for player in players {
                            println!("Player {} {} ({})", player.pid, player.name, player.model);
                        }
                    }
                    StateUpdate::GroupsChanged(groups) => {
                        for group in groups {
                            println!("Group {} {} with {} players", group.gid, group.name, group.players.len());
                        }
                    }
                    StateUpdate::BrowseResult(view) => {
                        println!("Browse: {} ({} of {})", view.name, view.returned, view.count);
                        for entry in &view.entries {
                            println!("  {:?} {}", entry.kind, entry.name);
                        }
                    }
                    StateUpdate::CommandFailed { command, text } => {
                        println!("Failed: {} ({})", command, text);
                    }
                }
            }
        }
    }

    println!("Stored {} state entries", store.len());
    client.shutdown().await;
    Ok(())
}
