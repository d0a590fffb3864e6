//! Dispatch of decoded frames by `(group, action)`

use crate::browse::{self, BrowseCache, BrowseView, VirtualCatalog};
use crate::config::CommandScope;
use crate::player::{Player, PlayerFactory};
use crate::protocol::{BrowsePage, ChangeEvent, Command, Response, ResponseFrame};
use crate::store::{ids, state_id, StateStore};
use crate::subscription::StateUpdate;
use crate::types::{GroupId, GroupInfo, GroupRole, GroupRoleName, PlayerId, PlayerInfo, SourceInfo};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

/// Failure text after which the session signs in again
pub const NOT_LOGGED_IN: &str = "User not logged in";

const ERROR_LOG_SIZE: usize = 4;

/// Work the session performs after routing a frame
#[derive(Debug, Clone)]
pub enum RouterAction {
    /// Queue a command on the socket
    Send(Command),
    /// A heartbeat was answered
    HeartbeatReply,
    /// Sign in again with the configured credentials
    SignIn,
    /// Addresses of every player the device reported
    PlayersReported(Vec<IpAddr>),
    Publish(StateUpdate),
}

/// Rolling, de-duplicated log of recent command failures, newest first
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: VecDeque<String>,
}

impl ErrorLog {
    pub fn push(&mut self, entry: String) {
        self.entries.retain(|e| *e != entry);
        self.entries.push_front(entry);
        self.entries.truncate(ERROR_LOG_SIZE);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize)]
struct GroupState {
    #[serde(flatten)]
    info: GroupInfo,
    volume: Option<u8>,
    mute: Option<bool>,
    /// Track length reported by the leader, in milliseconds
    duration: Option<u64>,
}

/// Routes frames to the catalog, the group topology and the players
pub struct Router {
    store: Arc<dyn StateStore>,
    factory: Arc<dyn PlayerFactory>,
    page_size: u32,
    players: BTreeMap<PlayerId, Box<dyn Player>>,
    groups: BTreeMap<GroupId, GroupState>,
    sources: BTreeSet<String>,
    mirrored: HashMap<VirtualCatalog, BTreeSet<String>>,
    cache: BrowseCache,
    errors: ErrorLog,
}

impl Router {
    pub fn new(store: Arc<dyn StateStore>, factory: Arc<dyn PlayerFactory>, page_size: u32) -> Self {
        Self {
            store,
            factory,
            page_size,
            players: BTreeMap::new(),
            groups: BTreeMap::new(),
            sources: BTreeSet::new(),
            mirrored: HashMap::new(),
            cache: BrowseCache::new(),
            errors: ErrorLog::default(),
        }
    }

    pub fn route(&mut self, frame: &ResponseFrame) -> Vec<RouterAction> {
        if frame.is_under_process() {
            tracing::trace!("Command under process: {}", frame.heos.command);
            return Vec::new();
        }

        // Any heartbeat answer means the player is alive
        if frame.path() == ("system", "heart_beat") {
            return vec![RouterAction::HeartbeatReply];
        }

        if frame.is_failure() {
            return self.on_failure(frame);
        }

        let response = match Response::from_frame(frame) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Unexpected response to {}: {}", frame.heos.command, e);
                return Vec::new();
            }
        };

        match response {
            Response::Heartbeat => vec![RouterAction::HeartbeatReply],
            Response::Account { signed_in, username } => {
                self.set_account(signed_in, username);
                Vec::new()
            }
            Response::Players(players) => self.on_players(players),
            Response::Groups(groups) => self.on_groups(groups),
            Response::GroupVolume { gid, level, mute } => {
                self.on_group_volume(gid, level, mute);
                Vec::new()
            }
            Response::MusicSources(sources) => self.on_sources(&sources),
            Response::Browse(page) => self.on_browse(&page),
            Response::Event(event) => self.on_event(event, frame),
            Response::PlayerScoped { pid } => self.forward(pid, frame),
            Response::Unrecognized => self.broadcast(frame),
        }
    }

    fn on_failure(&mut self, frame: &ResponseFrame) -> Vec<RouterAction> {
        let text = frame.error_text();
        tracing::warn!("Command failed: {}: {}", frame.heos.command, text);

        self.errors.push(format!("{}: {}", frame.heos.command, text));
        self.store.set_state(ids::ERROR, json!(text));
        self.store.set_state(ids::ERROR_LOG, json!(self.errors.entries()));

        let mut actions = vec![RouterAction::Publish(StateUpdate::CommandFailed {
            command: frame.heos.command.clone(),
            text: text.clone(),
        })];
        if text == NOT_LOGGED_IN {
            actions.push(RouterAction::SignIn);
        }
        actions
    }

    fn set_account(&self, signed_in: bool, username: Option<String>) {
        tracing::info!("Signed in: {} ({})", signed_in, username.as_deref().unwrap_or("-"));
        self.store.set_state(ids::SIGNED_IN, json!(signed_in));
        self.store.set_state(ids::SIGNED_IN_USER, json!(username.unwrap_or_default()));
    }

    fn on_players(&mut self, reported: Vec<PlayerInfo>) -> Vec<RouterAction> {
        let mut actions = Vec::new();
        let pids: BTreeSet<PlayerId> = reported.iter().map(|p| p.pid).collect();

        let gone: Vec<PlayerId> = self.players.keys().filter(|pid| !pids.contains(*pid)).copied().collect();
        for pid in gone {
            if let Some(mut player) = self.players.remove(&pid) {
                player.disconnect();
            }
        }

        for info in &reported {
            if self.players.contains_key(&info.pid) {
                continue;
            }
            let mut player = self.factory.create(info.clone());
            actions.extend(player.connect().into_iter().map(RouterAction::Send));
            self.players.insert(info.pid, player);
        }

        self.apply_roles();

        actions.push(RouterAction::PlayersReported(
            reported.iter().filter_map(|p| p.ip).collect(),
        ));
        actions.push(RouterAction::Publish(StateUpdate::PlayersChanged(reported)));
        actions
    }

    fn on_groups(&mut self, groups: Vec<GroupInfo>) -> Vec<RouterAction> {
        let mut actions = Vec::new();
        let previous = std::mem::take(&mut self.groups);

        for group in &groups {
            let (volume, mute) = previous
                .get(&group.gid)
                .map(|g| (g.volume, g.mute))
                .unwrap_or_default();
            let duration = group
                .leader()
                .and_then(|leader| self.players.get(&leader.pid))
                .and_then(|p| p.duration());
            let state = GroupState {
                info: group.clone(),
                volume,
                mute,
                duration,
            };
            self.publish_group(&state);
            self.groups.insert(group.gid, state);

            actions.push(RouterAction::Send(Command::get_group_volume(group.gid)));
            actions.push(RouterAction::Send(Command::get_group_mute(group.gid)));
        }

        for gid in previous.keys().filter(|gid| !self.groups.contains_key(*gid)) {
            self.store.delete_state(&state_id(ids::GROUPS, gid));
        }

        self.apply_roles();
        actions.push(RouterAction::Publish(StateUpdate::GroupsChanged(groups)));
        actions
    }

    /// Assign leader/member roles from the current group topology
    fn apply_roles(&mut self) {
        let mut roles: BTreeMap<PlayerId, GroupRole> = BTreeMap::new();

        for group in self.groups.values().map(|g| &g.info) {
            let Some(leader) = group.leader() else {
                tracing::debug!("Group {} has no leader", group.gid);
                continue;
            };
            let leader_ip = self.players.get(&leader.pid).and_then(|p| p.ip());

            for member in &group.players {
                let role = match member.role {
                    GroupRoleName::Leader => GroupRole::Leader {
                        gid: group.gid,
                        name: group.name.clone(),
                        members: group
                            .player_ids()
                            .into_iter()
                            .filter(|pid| *pid != member.pid)
                            .collect(),
                    },
                    GroupRoleName::Member => GroupRole::Member {
                        gid: group.gid,
                        leader: leader.pid,
                        leader_ip,
                    },
                };
                roles.insert(member.pid, role);
            }
        }

        for (pid, player) in self.players.iter_mut() {
            player.set_group_role(roles.remove(pid).unwrap_or(GroupRole::Solo));
        }
    }

    fn on_group_volume(&mut self, gid: GroupId, level: Option<u8>, mute: Option<bool>) {
        let Some(group) = self.groups.get_mut(&gid) else {
            tracing::debug!("Volume for unknown group {}", gid);
            return;
        };
        if level.is_some() {
            group.volume = level;
        }
        if mute.is_some() {
            group.mute = mute;
        }
        let group = group.clone();
        self.publish_group(&group);

        for pid in group.info.player_ids() {
            let Some(player) = self.players.get_mut(&pid) else {
                continue;
            };
            if let Some(level) = level {
                player.set_group_volume(level.min(player.max_volume()));
            }
            if let Some(mute) = mute {
                player.set_group_mute(mute);
            }
        }
    }

    fn publish_group(&self, group: &GroupState) {
        match serde_json::to_value(group) {
            Ok(value) => self.store.set_state(&state_id(ids::GROUPS, group.info.gid), value),
            Err(e) => tracing::warn!("Failed to serialize group {}: {}", group.info.gid, e),
        }
    }

    fn on_sources(&mut self, sources: &[SourceInfo]) -> Vec<RouterAction> {
        self.cache.clear();

        let mut current = BTreeSet::new();
        for source in sources {
            let id = state_id(ids::SOURCES, source.sid);
            match serde_json::to_value(source) {
                Ok(value) => self.store.set_state(&id, value),
                Err(e) => tracing::warn!("Failed to serialize source {}: {}", source.sid, e),
            }
            current.insert(id);
        }
        for stale in self.sources.difference(&current) {
            self.store.delete_state(stale);
        }
        self.sources = current;

        let view = browse::root_view(&mut self.cache, sources);
        vec![self.publish_view(view)]
    }

    fn on_browse(&mut self, page: &BrowsePage) -> Vec<RouterAction> {
        let view = browse::page_view(&mut self.cache, page, self.page_size);
        if let Some(catalog) = VirtualCatalog::of(page) {
            self.mirror(catalog, page, &view);
        }
        vec![self.publish_view(view)]
    }

    /// Persist the items of a playlist or preset listing
    fn mirror(&mut self, catalog: VirtualCatalog, page: &BrowsePage, view: &BrowseView) {
        let prefix = catalog.prefix();
        let known = self.mirrored.entry(catalog).or_default();
        let mut seen = BTreeSet::new();

        for (key, value) in catalog.items(view) {
            self.store.set_state(&state_id(prefix, &key), value);
            seen.insert(key.clone());
            known.insert(key);
        }

        // A partial page says nothing about items outside it
        if page.is_complete() {
            for stale in known.difference(&seen) {
                tracing::debug!("Removing {}.{}", prefix, stale);
                self.store.delete_state(&state_id(prefix, stale));
            }
            *known = seen;
        }
    }

    fn publish_view(&self, view: BrowseView) -> RouterAction {
        match serde_json::to_value(&view) {
            Ok(value) => self.store.set_state(ids::BROWSE_RESULT, value),
            Err(e) => tracing::warn!("Failed to serialize browse view: {}", e),
        }
        RouterAction::Publish(StateUpdate::BrowseResult(Box::new(view)))
    }

    fn on_event(&mut self, event: ChangeEvent, frame: &ResponseFrame) -> Vec<RouterAction> {
        match event {
            ChangeEvent::PlayersChanged => vec![RouterAction::Send(Command::get_players())],
            ChangeEvent::GroupsChanged => vec![RouterAction::Send(Command::get_groups())],
            ChangeEvent::SourcesChanged => vec![RouterAction::Send(Command::get_music_sources())],
            ChangeEvent::UserChanged { signed_in, username } => {
                self.set_account(signed_in, username);
                Vec::new()
            }
            ChangeEvent::GroupVolumeChanged { gid, level, mute } => {
                self.on_group_volume(gid, level, mute);
                Vec::new()
            }
            ChangeEvent::Player { pid } => self.forward(pid, frame),
            ChangeEvent::Other => self.broadcast(frame),
        }
    }

    fn forward(&mut self, pid: PlayerId, frame: &ResponseFrame) -> Vec<RouterAction> {
        let Some(player) = self.players.get_mut(&pid) else {
            tracing::debug!("No player {} for {}", pid, frame.heos.command);
            return Vec::new();
        };
        let actions = player
            .handle_frame(frame)
            .into_iter()
            .map(RouterAction::Send)
            .collect();
        let duration = player.duration();
        self.sync_leader_duration(pid, duration);
        actions
    }

    /// Groups follow the playback duration of their leader
    fn sync_leader_duration(&mut self, pid: PlayerId, duration: Option<u64>) {
        let mut changed = Vec::new();
        for group in self.groups.values_mut() {
            let leads = group.info.leader().is_some_and(|l| l.pid == pid);
            if leads && group.duration != duration {
                group.duration = duration;
                changed.push(group.clone());
            }
        }
        for group in &changed {
            self.publish_group(group);
        }
    }

    fn broadcast(&mut self, frame: &ResponseFrame) -> Vec<RouterAction> {
        self.players
            .values_mut()
            .filter(|p| !p.ignores_broadcast())
            .flat_map(|p| p.handle_frame(frame))
            .map(RouterAction::Send)
            .collect()
    }

    /// Players a scoped user command is fanned out to
    pub fn scoped_players(&self, scope: CommandScope) -> Vec<PlayerId> {
        let members: BTreeSet<PlayerId> = self
            .groups
            .values()
            .flat_map(|g| g.info.players.iter())
            .filter(|m| m.role == GroupRoleName::Member)
            .map(|m| m.pid)
            .collect();

        self.players
            .keys()
            .filter(|pid| scope == CommandScope::All || !members.contains(*pid))
            .copied()
            .collect()
    }

    #[cfg(test)]
    fn player_count(&self) -> usize {
        self.players.len()
    }

    #[cfg(test)]
    fn errors(&self) -> Vec<String> {
        self.errors.entries()
    }

    /// Drop all players and cached catalog state
    pub fn reset(&mut self) {
        for (_, mut player) in std::mem::take(&mut self.players) {
            player.disconnect();
        }
        self.groups.clear();
        self.cache.clear();
        self.store.set_state(ids::SIGNED_IN, json!(false));
    }
}
