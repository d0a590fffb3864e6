use serde::{Deserialize, Deserializer, Serialize};
use std::net::IpAddr;

/// Player identifier
pub type PlayerId = i64;

/// Group identifier
pub type GroupId = i64;

/// Music source identifier
pub type SourceId = i64;

/// Well-known source ids of the virtual catalogs
pub mod sources {
    use super::SourceId;

    pub const PLAYLISTS: SourceId = 1025;
    pub const HISTORY: SourceId = 1026;
    pub const AUX_INPUTS: SourceId = 1027;
    pub const FAVORITES: SourceId = 1028;
}

/// Player entry from `player/get_players`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub name: String,

    #[serde(deserialize_with = "id")]
    pub pid: PlayerId,

    #[serde(default, deserialize_with = "opt_id")]
    pub gid: Option<GroupId>,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub version: String,

    /// Address of the player, if reported
    #[serde(default)]
    pub ip: Option<IpAddr>,

    /// Network type (wired, wifi, unknown)
    #[serde(default)]
    pub network: Option<String>,

    #[serde(default)]
    pub serial: Option<String>,
}

/// Group entry from `group/get_groups`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,

    #[serde(deserialize_with = "id")]
    pub gid: GroupId,

    #[serde(default)]
    pub players: Vec<GroupMember>,
}

impl GroupInfo {
    /// The player leading this group
    pub fn leader(&self) -> Option<&GroupMember> {
        self.players.iter().find(|p| p.role == GroupRoleName::Leader)
    }

    /// Ids of every player in the group, leader included
    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.players.iter().map(|p| p.pid).collect()
    }
}

/// Player inside a group listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub name: String,

    #[serde(deserialize_with = "id")]
    pub pid: PlayerId,

    pub role: GroupRoleName,
}

/// Role string as reported in group listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRoleName {
    Leader,
    Member,
}

/// Role assigned to a player after a group topology rebuild
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum GroupRole {
    /// Not part of any group
    Solo,
    /// Leads a group of the given members (leader excluded)
    Leader {
        gid: GroupId,
        name: String,
        members: Vec<PlayerId>,
    },
    /// Follows a leader
    Member {
        gid: GroupId,
        leader: PlayerId,
        leader_ip: Option<IpAddr>,
    },
}

/// Music source from `browse/get_music_sources`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub name: String,

    #[serde(default)]
    pub image_url: String,

    #[serde(rename = "type", default)]
    pub source_type: String,

    #[serde(deserialize_with = "id")]
    pub sid: SourceId,

    /// "true" or "false"
    #[serde(default)]
    pub available: Option<String>,
}

impl SourceInfo {
    pub fn is_available(&self) -> bool {
        self.available.as_deref() != Some("false")
    }
}

/// Item from a `browse/browse` listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowseItem {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub image_url: String,

    #[serde(rename = "type", default)]
    pub item_type: String,

    /// "yes" or "no"
    #[serde(default)]
    pub container: Option<String>,

    /// "yes" or "no"
    #[serde(default)]
    pub playable: Option<String>,

    #[serde(default, deserialize_with = "opt_string")]
    pub cid: Option<String>,

    #[serde(default, deserialize_with = "opt_string")]
    pub mid: Option<String>,

    /// Present when the item is itself a source (e.g. services inside a group)
    #[serde(default, deserialize_with = "opt_id")]
    pub sid: Option<SourceId>,
}

impl BrowseItem {
    pub fn is_container(&self) -> bool {
        self.container.as_deref() == Some("yes")
    }

    pub fn is_playable(&self) -> bool {
        self.playable.as_deref() == Some("yes")
    }
}

/// Accepts ids sent either as JSON numbers or as numeric strings
fn id<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }

    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    struct Wrap(#[serde(deserialize_with = "id")] i64);

    Ok(Option::<Wrap>::deserialize(d)?.map(|Wrap(v)| v))
}

fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
