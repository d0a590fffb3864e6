use crate::protocol::{Command, ResponseFrame};
use crate::store::{ids, state_id, StateStore};
use crate::types::{GroupRole, PlayerId, PlayerInfo};
use serde::Serialize;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;

/// Per-player domain object driven by the session
///
/// The session owns one per reported player. Methods returning commands
/// hand them back to the session, which queues them on the shared socket.
pub trait Player: Send + Sync {
    fn info(&self) -> &PlayerInfo;

    /// The player was reported by the device; return initial queries
    fn connect(&mut self) -> Vec<Command>;

    /// The player disappeared or the session is tearing down
    fn disconnect(&mut self);

    /// A response or event addressed to this player
    fn handle_frame(&mut self, frame: &ResponseFrame) -> Vec<Command>;

    fn set_group_role(&mut self, role: GroupRole);

    fn set_group_volume(&mut self, level: u8);

    fn set_group_mute(&mut self, mute: bool);

    /// Length of the current track in milliseconds, if known
    fn duration(&self) -> Option<u64> {
        None
    }

    /// Highest volume the player may be set to by group propagation
    fn max_volume(&self) -> u8 {
        100
    }

    /// Whether frames without a `pid` should skip this player
    fn ignores_broadcast(&self) -> bool {
        false
    }

    fn ip(&self) -> Option<IpAddr> {
        self.info().ip
    }

    fn pid(&self) -> PlayerId {
        self.info().pid
    }
}

/// Creates [`Player`] objects for newly reported players
pub trait PlayerFactory: Send + Sync {
    fn create(&self, info: PlayerInfo) -> Box<dyn Player>;
}

/// Player snapshot mirrored into the store
#[derive(Debug, Clone, Serialize)]
pub struct PlayerState {
    pub info: PlayerInfo,
    pub connected: bool,
    pub role: GroupRole,
    pub play_state: Option<String>,
    pub volume: Option<u8>,
    pub mute: Option<bool>,
    pub group_volume: Option<u8>,
    pub group_mute: Option<bool>,
    pub now_playing: Option<Value>,
    /// Playback position and track length in milliseconds
    pub position: Option<u64>,
    pub duration: Option<u64>,
}

/// [`Player`] that tracks playback basics and mirrors them to `players.<pid>`
pub struct BasicPlayer {
    state: PlayerState,
    store: Arc<dyn StateStore>,
}

impl BasicPlayer {
    pub fn new(info: PlayerInfo, store: Arc<dyn StateStore>) -> Self {
        Self {
            state: PlayerState {
                info,
                connected: false,
                role: GroupRole::Solo,
                play_state: None,
                volume: None,
                mute: None,
                group_volume: None,
                group_mute: None,
                now_playing: None,
                position: None,
                duration: None,
            },
            store,
        }
    }

    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    fn id(&self) -> String {
        state_id(ids::PLAYERS, self.state.info.pid)
    }

    fn publish(&self) {
        match serde_json::to_value(&self.state) {
            Ok(value) => self.store.set_state(&self.id(), value),
            Err(e) => tracing::warn!("Failed to serialize player {}: {}", self.state.info.pid, e),
        }
    }
}

impl Player for BasicPlayer {
    fn info(&self) -> &PlayerInfo {
        &self.state.info
    }

    fn connect(&mut self) -> Vec<Command> {
        tracing::info!("Player connected: {} ({})", self.state.info.name, self.state.info.pid);
        self.state.connected = true;
        self.publish();

        let pid = self.state.info.pid;
        ["get_play_state", "get_volume", "get_mute", "get_now_playing_media"]
            .into_iter()
            .map(|action| Command::new("player", action).param("pid", pid))
            .collect()
    }

    fn disconnect(&mut self) {
        tracing::info!("Player disconnected: {} ({})", self.state.info.name, self.state.info.pid);
        self.state.connected = false;
        self.store.delete_state(&self.id());
    }

    fn handle_frame(&mut self, frame: &ResponseFrame) -> Vec<Command> {
        let params = frame.params();
        let mut follow_up = Vec::new();

        match frame.path() {
            ("player", "get_play_state") | ("event", "player_state_changed") => {
                self.state.play_state = params.get("state").map(str::to_string);
            }
            ("player", "get_volume") | ("event", "player_volume_changed") => {
                if let Some(level) = params.get_u32("level") {
                    self.state.volume = Some(level.min(100) as u8);
                }
                if let Some(mute) = params.get("mute") {
                    self.state.mute = Some(mute == "on");
                }
            }
            ("player", "get_mute") => {
                self.state.mute = params.get("state").map(|s| s == "on");
            }
            ("player", "get_now_playing_media") => {
                self.state.now_playing = frame.payload.clone();
            }
            ("event", "player_now_playing_progress") => {
                self.state.position = params.get_i64("cur_pos").and_then(|v| u64::try_from(v).ok());
                self.state.duration = params.get_i64("duration").and_then(|v| u64::try_from(v).ok());
            }
            ("event", "player_now_playing_changed") => {
                follow_up.push(
                    Command::new("player", "get_now_playing_media").param("pid", self.state.info.pid),
                );
            }
            _ => return follow_up,
        }

        self.publish();
        follow_up
    }

    fn duration(&self) -> Option<u64> {
        self.state.duration
    }

    fn set_group_role(&mut self, role: GroupRole) {
        self.state.role = role;
        self.publish();
    }

    fn set_group_volume(&mut self, level: u8) {
        self.state.group_volume = Some(level);
        self.publish();
    }

    fn set_group_mute(&mut self, mute: bool) {
        self.state.group_mute = Some(mute);
        self.publish();
    }
}

/// Factory producing [`BasicPlayer`]s bound to one store
pub struct BasicPlayerFactory {
    store: Arc<dyn StateStore>,
}

impl BasicPlayerFactory {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

impl PlayerFactory for BasicPlayerFactory {
    fn create(&self, info: PlayerInfo) -> Box<dyn Player> {
        Box::new(BasicPlayer::new(info, self.store.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameHeader;
    use crate::store::MemoryStore;

    fn info() -> PlayerInfo {
        PlayerInfo {
            name: "Kitchen".to_string(),
            pid: 7,
            gid: None,
            model: "HEOS 1".to_string(),
            version: "1.0".to_string(),
            ip: Some("10.0.0.7".parse().unwrap()),
            network: None,
            serial: None,
        }
    }

    fn frame(command: &str, message: &str) -> ResponseFrame {
        ResponseFrame {
            heos: FrameHeader {
                command: command.to_string(),
                result: Some("success".to_string()),
                message: message.to_string(),
            },
            payload: None,
            options: None,
        }
    }

    #[test]
    fn test_connect_queries_player_state() {
        let store = Arc::new(MemoryStore::new());
        let mut player = BasicPlayer::new(info(), store.clone());

        let commands = player.connect();
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0].to_string(), "heos://player/get_play_state?pid=7");
        assert_eq!(store.get("players.7").unwrap()["connected"], true);
    }

    #[test]
    fn test_volume_event_updates_store() {
        let store = Arc::new(MemoryStore::new());
        let mut player = BasicPlayer::new(info(), store.clone());

        player.handle_frame(&frame("event/player_volume_changed", "pid=7&level=33&mute=off"));

        assert_eq!(player.state().volume, Some(33));
        assert_eq!(player.state().mute, Some(false));
        assert_eq!(store.get("players.7").unwrap()["volume"], 33);
    }

    #[test]
    fn test_now_playing_change_requests_media() {
        let store = Arc::new(MemoryStore::new());
        let mut player = BasicPlayer::new(info(), store);

        let follow_up = player.handle_frame(&frame("event/player_now_playing_changed", "pid=7"));
        assert_eq!(
            follow_up[0].to_string(),
            "heos://player/get_now_playing_media?pid=7"
        );
    }

    #[test]
    fn test_progress_event_sets_duration() {
        let store = Arc::new(MemoryStore::new());
        let mut player = BasicPlayer::new(info(), store.clone());
        assert_eq!(player.duration(), None);

        let follow_up = player.handle_frame(&frame(
            "event/player_now_playing_progress",
            "pid=7&cur_pos=62000&duration=215000",
        ));

        assert!(follow_up.is_empty());
        assert_eq!(player.duration(), Some(215000));
        assert_eq!(player.state().position, Some(62000));
        assert_eq!(store.get("players.7").unwrap()["duration"], 215000);
    }

    #[test]
    fn test_disconnect_removes_state() {
        let store = Arc::new(MemoryStore::new());
        let mut player = BasicPlayer::new(info(), store.clone());
        player.connect();
        player.disconnect();
        assert!(store.get("players.7").is_none());
    }
}
