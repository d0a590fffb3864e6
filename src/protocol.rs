//! CLI command strings and response frames
//!
//! Outbound commands are `heos://group/action?key=value&...` strings; inbound
//! frames are JSON objects of the form
//! `{"heos": {"command", "result", "message"}, "payload": ..., "options": ...}`.

use crate::error::{HeosError, Result};
use crate::types::{
    BrowseItem, GroupId, GroupInfo, PlayerId, PlayerInfo, SourceId, SourceInfo,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

const SCHEME: &str = "heos://";

/// Query parameters that only select a page of a listing
pub const VOLATILE_PARAMS: [&str; 3] = ["range", "count", "returned"];

/// Outbound CLI command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    group: String,
    action: String,
    params: Vec<(String, String)>,
}

impl Command {
    /// Create a command without parameters
    pub fn new(group: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            action: action.into(),
            params: Vec::new(),
        }
    }

    /// Append or replace a parameter
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let key = key.into();
        let value = value.to_string();
        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key, value)),
        }
        self
    }

    /// Drop the given parameters
    pub fn without(mut self, keys: &[&str]) -> Self {
        self.params.retain(|(k, _)| !keys.contains(&k.as_str()));
        self
    }

    /// Parse a `heos://group/action?k=v` string
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .trim()
            .strip_prefix(SCHEME)
            .ok_or_else(|| HeosError::InvalidCommand(s.to_string()))?;

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let (group, action) = path
            .split_once('/')
            .filter(|(g, a)| !g.is_empty() && !a.is_empty())
            .ok_or_else(|| HeosError::InvalidCommand(s.to_string()))?;

        let mut command = Self::new(group, action);
        if let Some(query) = query {
            for (key, value) in split_params(query) {
                command.params.push((key, value));
            }
        }
        Ok(command)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// `group/action`, as echoed back in the response frame
    pub fn path(&self) -> String {
        format!("{}/{}", self.group, self.action)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Whether the command carries account credentials
    pub fn has_credentials(&self) -> bool {
        self.get("pw").is_some()
    }

    /// Text safe to log at normal verbosity
    pub fn redacted(&self) -> String {
        if self.has_credentials() {
            format!("{}{}?<redacted>", SCHEME, self.path())
        } else {
            self.to_string()
        }
    }

    // Command families

    pub fn heart_beat() -> Self {
        Self::new("system", "heart_beat")
    }

    pub fn register_for_change_events(enable: bool) -> Self {
        Self::new("system", "register_for_change_events")
            .param("enable", if enable { "on" } else { "off" })
    }

    pub fn sign_in(username: &str, password: &str) -> Self {
        Self::new("system", "sign_in")
            .param("un", username)
            .param("pw", password)
    }

    pub fn check_account() -> Self {
        Self::new("system", "check_account")
    }

    pub fn reboot() -> Self {
        Self::new("system", "reboot")
    }

    pub fn get_players() -> Self {
        Self::new("player", "get_players")
    }

    pub fn get_groups() -> Self {
        Self::new("group", "get_groups")
    }

    pub fn get_group_volume(gid: GroupId) -> Self {
        Self::new("group", "get_volume").param("gid", gid)
    }

    pub fn get_group_mute(gid: GroupId) -> Self {
        Self::new("group", "get_mute").param("gid", gid)
    }

    pub fn get_music_sources() -> Self {
        Self::new("browse", "get_music_sources")
    }

    pub fn browse(params: &BrowseParams) -> Self {
        let mut command = Self::new("browse", "browse").param("sid", params.sid);
        if let Some(cid) = &params.cid {
            command = command.param("cid", cid);
        }
        if let Some((start, end)) = params.range {
            command = command.param("range", format!("{},{}", start, end));
        }
        command
    }

    pub fn volume_up(pid: PlayerId, step: u8) -> Self {
        Self::new("player", "volume_up")
            .param("pid", pid)
            .param("step", step)
    }

    pub fn volume_down(pid: PlayerId, step: u8) -> Self {
        Self::new("player", "volume_down")
            .param("pid", pid)
            .param("step", step)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", SCHEME, self.group, self.action)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            if value.is_empty() {
                write!(f, "{}{}", sep, key)?;
            } else {
                write!(f, "{}{}={}", sep, key, encode_value(value))?;
            }
        }
        Ok(())
    }
}

/// Parameters of a `browse/browse` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseParams {
    pub sid: SourceId,
    pub cid: Option<String>,
    /// Inclusive item range
    pub range: Option<(u32, u32)>,
}

impl BrowseParams {
    pub fn source(sid: SourceId) -> Self {
        Self {
            sid,
            cid: None,
            range: None,
        }
    }

    pub fn container(sid: SourceId, cid: impl Into<String>) -> Self {
        Self {
            sid,
            cid: Some(cid.into()),
            range: None,
        }
    }

    pub fn with_range(mut self, start: u32, end: u32) -> Self {
        self.range = Some((start, end));
        self
    }
}

/// `aid` values of `browse/add_to_queue`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddCriteria {
    PlayNow = 1,
    PlayNext = 2,
    AddToEnd = 3,
    ReplaceAndPlay = 4,
}

/// Something a browse entry can start playing on a player
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayAction {
    /// Station or stream: `browse/play_stream`
    Stream {
        sid: SourceId,
        cid: Option<String>,
        mid: String,
        name: String,
    },
    /// Container or track: `browse/add_to_queue`
    Queue {
        sid: SourceId,
        cid: String,
        mid: Option<String>,
        criteria: AddCriteria,
    },
    /// Favourite slot: `browse/play_preset`
    Preset { preset: u32 },
    /// Physical input: `browse/play_input`
    Input { input: String },
}

impl PlayAction {
    /// Command that performs this action on the given player
    pub fn command(&self, pid: PlayerId) -> Command {
        match self {
            PlayAction::Stream { sid, cid, mid, name } => {
                let mut command = Command::new("browse", "play_stream")
                    .param("pid", pid)
                    .param("sid", sid);
                if let Some(cid) = cid {
                    command = command.param("cid", cid);
                }
                command.param("mid", mid).param("name", name)
            }
            PlayAction::Queue {
                sid,
                cid,
                mid,
                criteria,
            } => {
                let mut command = Command::new("browse", "add_to_queue")
                    .param("pid", pid)
                    .param("sid", sid)
                    .param("cid", cid);
                if let Some(mid) = mid {
                    command = command.param("mid", mid);
                }
                command.param("aid", *criteria as u8)
            }
            PlayAction::Preset { preset } => Command::new("browse", "play_preset")
                .param("pid", pid)
                .param("preset", preset),
            PlayAction::Input { input } => Command::new("browse", "play_input")
                .param("pid", pid)
                .param("input", input),
        }
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub heos: FrameHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

/// The `heos` object of a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// `group/action`
    pub command: String,
    /// `success` or `fail`; absent on change events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ResponseFrame {
    /// Split `command` into `(group, action)`
    pub fn path(&self) -> (&str, &str) {
        self.heos
            .command
            .split_once('/')
            .unwrap_or((self.heos.command.as_str(), ""))
    }

    pub fn is_failure(&self) -> bool {
        self.heos.result.as_deref() == Some("fail")
    }

    /// Interim acknowledgement that precedes the real response
    pub fn is_under_process(&self) -> bool {
        self.heos.message.starts_with("command under process")
    }

    pub fn params(&self) -> MessageParams {
        MessageParams::parse(&self.heos.message)
    }

    /// Human readable failure text, falling back to the raw message
    pub fn error_text(&self) -> String {
        let params = self.params();
        params
            .get("text")
            .map(str::to_string)
            .unwrap_or_else(|| self.heos.message.clone())
    }
}

/// Parsed `key=value&flag&...` message body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageParams(BTreeMap<String, String>);

impl MessageParams {
    pub fn parse(message: &str) -> Self {
        Self(split_params(message).collect())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// Whether a bare flag (or key) is present
    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Start of a `range=start,end` parameter
    pub fn range_start(&self) -> Option<u32> {
        self.get("range")
            .and_then(|r| r.split(',').next())
            .and_then(|s| s.trim().parse().ok())
    }
}

/// Change events pushed by the player after `register_for_change_events`
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    PlayersChanged,
    GroupsChanged,
    SourcesChanged,
    UserChanged {
        signed_in: bool,
        username: Option<String>,
    },
    GroupVolumeChanged {
        gid: GroupId,
        level: Option<u8>,
        mute: Option<bool>,
    },
    /// Any event carrying a `pid`
    Player { pid: PlayerId },
    Other,
}

/// One page of a browse listing
#[derive(Debug, Clone, PartialEq)]
pub struct BrowsePage {
    pub sid: SourceId,
    pub cid: Option<String>,
    pub start: u32,
    pub returned: u32,
    pub count: u32,
    pub items: Vec<BrowseItem>,
}

impl BrowsePage {
    /// The request that produced this page
    pub fn params(&self) -> BrowseParams {
        BrowseParams {
            sid: self.sid,
            cid: self.cid.clone(),
            range: None,
        }
    }

    /// Whether the page holds the whole catalog
    pub fn is_complete(&self) -> bool {
        self.start == 0 && self.returned >= self.count
    }
}

/// Frame interpreted by its `(group, action)` pair
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Heartbeat,
    Account {
        signed_in: bool,
        username: Option<String>,
    },
    Players(Vec<PlayerInfo>),
    Groups(Vec<GroupInfo>),
    GroupVolume {
        gid: GroupId,
        level: Option<u8>,
        mute: Option<bool>,
    },
    MusicSources(Vec<SourceInfo>),
    Browse(BrowsePage),
    Event(ChangeEvent),
    /// Player response or event to forward to the player collaborator
    PlayerScoped { pid: PlayerId },
    /// Recognised transport-wise but not by shape
    Unrecognized,
}

impl Response {
    /// Interpret a successful frame
    pub fn from_frame(frame: &ResponseFrame) -> Result<Self> {
        let params = frame.params();
        let response = match frame.path() {
            ("system", "heart_beat") => Response::Heartbeat,
            ("system", "sign_in") | ("system", "check_account") => Response::Account {
                signed_in: params.has("signed_in"),
                username: params.get("un").map(str::to_string),
            },
            ("player", "get_players") => Response::Players(payload(frame)?),
            ("group", "get_groups") => Response::Groups(payload(frame)?),
            ("group", "get_volume") | ("group", "get_mute") => {
                let gid = params
                    .get_i64("gid")
                    .ok_or_else(|| HeosError::InvalidResponse(frame.heos.message.clone()))?;
                Response::GroupVolume {
                    gid,
                    level: params.get_u32("level").map(clamp_level),
                    mute: params.get("state").map(|s| s == "on"),
                }
            }
            ("browse", "get_music_sources") => Response::MusicSources(payload(frame)?),
            ("browse", "browse") => {
                let sid = params
                    .get_i64("sid")
                    .ok_or_else(|| HeosError::InvalidResponse(frame.heos.message.clone()))?;
                let items: Vec<BrowseItem> = payload(frame)?;
                let returned = params.get_u32("returned").unwrap_or(items.len() as u32);
                Response::Browse(BrowsePage {
                    sid,
                    cid: params.get("cid").map(str::to_string),
                    start: params.range_start().unwrap_or(0),
                    returned,
                    count: params.get_u32("count").unwrap_or(returned),
                    items,
                })
            }
            ("event", action) => Response::Event(change_event(action, &params)),
            _ => match params.get_i64("pid") {
                Some(pid) => Response::PlayerScoped { pid },
                None => Response::Unrecognized,
            },
        };
        Ok(response)
    }
}

fn change_event(action: &str, params: &MessageParams) -> ChangeEvent {
    match action {
        "players_changed" => ChangeEvent::PlayersChanged,
        "groups_changed" => ChangeEvent::GroupsChanged,
        "sources_changed" => ChangeEvent::SourcesChanged,
        "user_changed" => ChangeEvent::UserChanged {
            signed_in: params.has("signed_in"),
            username: params.get("un").map(str::to_string),
        },
        "group_volume_changed" => match params.get_i64("gid") {
            Some(gid) => ChangeEvent::GroupVolumeChanged {
                gid,
                level: params.get_u32("level").map(clamp_level),
                mute: params.get("mute").map(|s| s == "on"),
            },
            None => ChangeEvent::Other,
        },
        _ => match params.get_i64("pid") {
            Some(pid) => ChangeEvent::Player { pid },
            None => ChangeEvent::Other,
        },
    }
}

fn clamp_level(level: u32) -> u8 {
    level.min(100) as u8
}

fn payload<T: serde::de::DeserializeOwned>(frame: &ResponseFrame) -> Result<T> {
    let value = frame.payload.clone().unwrap_or(Value::Array(Vec::new()));
    Ok(serde_json::from_value(value)?)
}

fn split_params(query: &str) -> impl Iterator<Item = (String, String)> + '_ {
    query.split('&').filter(|p| !p.is_empty()).map(|pair| {
        match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), decode_value(value)),
            None => (pair.to_string(), String::new()),
        }
    })
}

fn encode_value(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace('&', "%26")
        .replace('=', "%3D")
}

fn decode_value(value: &str) -> String {
    value
        .replace("%26", "&")
        .replace("%3D", "=")
        .replace("%25", "%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(command: &str, result: Option<&str>, message: &str, payload: Option<Value>) -> ResponseFrame {
        ResponseFrame {
            heos: FrameHeader {
                command: command.to_string(),
                result: result.map(str::to_string),
                message: message.to_string(),
            },
            payload,
            options: None,
        }
    }

    #[test]
    fn test_command_display_and_parse() {
        let command = Command::browse(&BrowseParams::container(1028, "abc").with_range(0, 49));
        let text = command.to_string();
        assert_eq!(text, "heos://browse/browse?sid=1028&cid=abc&range=0,49");

        let parsed = Command::parse(&text).unwrap();
        assert_eq!(parsed, command);
        assert_eq!(parsed.get("range"), Some("0,49"));
        assert_eq!(parsed.path(), "browse/browse");
    }

    #[test]
    fn test_reserved_characters_round_trip() {
        let command = Command::new("browse", "search").param("search", "Simon & Garfunkel = 100%");
        let text = command.to_string();
        assert_eq!(
            text,
            "heos://browse/search?search=Simon %26 Garfunkel %3D 100%25"
        );
        assert_eq!(Command::parse(&text).unwrap().get("search"), Some("Simon & Garfunkel = 100%"));
    }

    #[test]
    fn test_parse_rejects_foreign_strings() {
        assert!(Command::parse("http://example.com/a/b").is_err());
        assert!(Command::parse("heos://system").is_err());
        assert!(Command::parse("heos:///action").is_err());
    }

    #[test]
    fn test_param_replaces_existing_key() {
        let command = Command::new("player", "set_volume")
            .param("pid", 1)
            .param("level", 10)
            .param("level", 20);
        assert_eq!(command.to_string(), "heos://player/set_volume?pid=1&level=20");
    }

    #[test]
    fn test_without_strips_volatile_params() {
        let command = Command::parse("heos://browse/browse?sid=5&range=50,99&count=300&returned=50").unwrap();
        assert_eq!(
            command.without(&VOLATILE_PARAMS).to_string(),
            "heos://browse/browse?sid=5"
        );
    }

    #[test]
    fn test_sign_in_is_redacted() {
        let command = Command::sign_in("me@example.com", "hunter2");
        assert!(command.has_credentials());
        assert!(!command.redacted().contains("hunter2"));
        assert!(!Command::heart_beat().has_credentials());
        assert_eq!(Command::heart_beat().redacted(), "heos://system/heart_beat");
    }

    #[test]
    fn test_play_action_commands() {
        let stream = PlayAction::Stream {
            sid: 3,
            cid: None,
            mid: "s123".to_string(),
            name: "Jazz FM".to_string(),
        };
        assert_eq!(
            stream.command(7).to_string(),
            "heos://browse/play_stream?pid=7&sid=3&mid=s123&name=Jazz FM"
        );

        let queue = PlayAction::Queue {
            sid: 1025,
            cid: "42".to_string(),
            mid: None,
            criteria: AddCriteria::ReplaceAndPlay,
        };
        assert_eq!(
            queue.command(7).to_string(),
            "heos://browse/add_to_queue?pid=7&sid=1025&cid=42&aid=4"
        );

        let preset = PlayAction::Preset { preset: 2 };
        assert_eq!(
            preset.command(7).to_string(),
            "heos://browse/play_preset?pid=7&preset=2"
        );
    }

    #[test]
    fn test_message_params() {
        let params = MessageParams::parse("signed_in&un=user@example.com");
        assert!(params.has("signed_in"));
        assert_eq!(params.get("un"), Some("user@example.com"));

        let params = MessageParams::parse("sid=1&cid=x&range=50,99&returned=50&count=120");
        assert_eq!(params.range_start(), Some(50));
        assert_eq!(params.get_u32("count"), Some(120));
    }

    #[test]
    fn test_frame_deserialize_without_result() {
        let frame: ResponseFrame = serde_json::from_str(
            r#"{"heos": {"command": "event/players_changed", "message": ""}}"#,
        )
        .unwrap();
        assert_eq!(frame.path(), ("event", "players_changed"));
        assert!(!frame.is_failure());
        assert_eq!(Response::from_frame(&frame).unwrap(), Response::Event(ChangeEvent::PlayersChanged));
    }

    #[test]
    fn test_error_text() {
        let f = frame("browse/browse", Some("fail"), "eid=8&text=User not logged in", None);
        assert!(f.is_failure());
        assert_eq!(f.error_text(), "User not logged in");
    }

    #[test]
    fn test_response_players() {
        let f = frame(
            "player/get_players",
            Some("success"),
            "",
            Some(json!([{"name": "Kitchen", "pid": 1, "ip": "10.0.0.2"}])),
        );
        match Response::from_frame(&f).unwrap() {
            Response::Players(players) => {
                assert_eq!(players.len(), 1);
                assert_eq!(players[0].name, "Kitchen");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_response_browse_page() {
        let f = frame(
            "browse/browse",
            Some("success"),
            "sid=1025&range=0,49&returned=2&count=2",
            Some(json!([
                {"container": "yes", "playable": "yes", "type": "playlist", "name": "Road", "cid": "11"},
                {"container": "yes", "playable": "yes", "type": "playlist", "name": "Gym", "cid": "12"}
            ])),
        );
        match Response::from_frame(&f).unwrap() {
            Response::Browse(page) => {
                assert_eq!(page.sid, 1025);
                assert_eq!(page.items.len(), 2);
                assert!(page.is_complete());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_response_group_volume_event() {
        let f = frame("event/group_volume_changed", None, "gid=-3&level=35&mute=off", None);
        assert_eq!(
            Response::from_frame(&f).unwrap(),
            Response::Event(ChangeEvent::GroupVolumeChanged {
                gid: -3,
                level: Some(35),
                mute: Some(false)
            })
        );
    }

    #[test]
    fn test_response_player_scoped_and_unrecognized() {
        let f = frame("player/get_play_state", Some("success"), "pid=9&state=play", None);
        assert_eq!(Response::from_frame(&f).unwrap(), Response::PlayerScoped { pid: 9 });

        let f = frame("system/prettify_json_response", Some("success"), "enable=on", None);
        assert_eq!(Response::from_frame(&f).unwrap(), Response::Unrecognized);
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let f = frame("player/get_players", Some("success"), "", Some(json!({"not": "a list"})));
        assert!(Response::from_frame(&f).is_err());
    }
}
