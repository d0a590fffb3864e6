//! Rust library for controlling Denon/Marantz HEOS players
//!
//! This library provides an async session manager for the HEOS CLI protocol
//! and a small UPnP client for the players' SOAP services. It supports:
//!
//! - SSDP discovery with fallback to previously known player addresses
//! - A supervised control connection with heartbeat, reconnect and reboot
//! - A paced command queue on the single shared socket
//! - Player and group tracking mirrored into a key-value state store
//! - Music source browsing with breadcrumbs and paging
//! - UPnP device description and SOAP action invocation
//! - Real-time state update subscriptions
//!
//! # Quick Start
//!
//! ```no_run
//! use heos_control::{BasicPlayerFactory, HeosClient, MemoryStore, SessionConfig, UserCommand};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let factory = Arc::new(BasicPlayerFactory::new(store.clone()));
//!
//!     // Discovery starts right away
//!     let client = HeosClient::start(SessionConfig::default(), store.clone(), factory);
//!     let mut updates = client.subscribe_state();
//!
//!     while let Ok(update) = updates.recv().await {
//!         println!("State update: {:?}", update);
//!         if let heos_control::StateUpdate::PlayersChanged(players) = update {
//!             if let Some(player) = players.first() {
//!                 client.send(UserCommand::Volume { pid: player.pid, up: true })?;
//!             }
//!             break;
//!         }
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # UPnP
//!
//! If you know the IP address of a player, you can talk to its UPnP services:
//!
//! ```no_run
//! use heos_control::UpnpDevice;
//! use serde_json::{json, Map, Value};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = UpnpDevice::connect("192.168.1.100".parse()?, Duration::from_secs(5)).await?;
//!     let mut args = Map::new();
//!     args.insert("InstanceID".to_string(), json!(0));
//!     args.insert("Channel".to_string(), Value::from("Master"));
//!     let result = device.invoke("RenderingControl", "GetVolume", &args).await?;
//!     println!("{:?}", result.get("CurrentVolume"));
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Client**: Spawns the session and exposes commands and subscriptions
//! - **Session**: Connection state machine, queue pacing, heartbeat, reboot handling
//! - **Router**: Maps responses and events to players, groups, sources and browse views
//! - **Connection**: Low-level TCP line protocol handling
//! - **Discovery**: SSDP search and response parsing
//! - **Protocol**: Command and response structures
//! - **UPnP/SOAP**: Device descriptions and action invocation

mod browse;
mod client;
mod config;
mod connection;
mod discovery;
mod error;
mod framing;
mod heartbeat;
mod player;
mod protocol;
mod queue;
mod router;
mod session;
mod soap;
mod store;
mod subscription;
mod timers;
mod types;
mod upnp;

// Public exports
pub use browse::{BrowseEntry, BrowseView, EntryKind};
pub use client::HeosClient;
pub use config::{CommandScope, Credentials, QueueMode, SessionConfig, DEFAULT_PORT};
pub use discovery::SsdpResponse;
pub use error::{HeosError, Result};
pub use player::{BasicPlayer, BasicPlayerFactory, Player, PlayerFactory, PlayerState};
pub use protocol::{AddCriteria, Command, PlayAction, ResponseFrame};
pub use session::{ConnectionState, UserCommand};
pub use soap::{SoapResult, SoapValue};
pub use store::{ids, state_id, MemoryStore, StateStore};
pub use subscription::{StateReceiver, StateUpdate};
pub use types::{
    sources, BrowseItem, GroupId, GroupInfo, GroupMember, GroupRole, GroupRoleName, PlayerId,
    PlayerInfo, SourceId, SourceInfo,
};
pub use upnp::{Action, Argument, DeviceInfo, Direction, Service, StateVariable, UpnpDevice};
