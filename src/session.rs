//! Connection state machine and event loop
//!
//! A [`Session`] owns every piece of mutable state: the control socket, the
//! discovery socket, the command queue, the timers and the router with its
//! players. Helper tasks only post [`SessionEvent`]s, and the session handles
//! them one at a time, so no state is ever shared or locked.

use crate::config::SessionConfig;
use crate::connection::{Connection, TransportEvent};
use crate::discovery::{self, Decision, DiscoveryClient, SearchStep, SearchTracker, SsdpResponse};
use crate::error::Result;
use crate::framing::FrameDemux;
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::player::PlayerFactory;
use crate::protocol::{Command, PlayAction};
use crate::queue::CommandQueue;
use crate::router::{Router, RouterAction};
use crate::store::{ids, StateStore};
use crate::subscription::StateUpdate;
use crate::timers::{TimerFired, TimerKind, Timers};
use crate::types::PlayerId;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Lifecycle state of the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnecting,
    Disconnected,
    Searching,
    Reconnecting,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Searching => "searching",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Commands issued by the host application
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    /// A raw `heos://` command string
    Raw(String),
    /// Open a listing; browse commands without a range get the first page
    Browse(String),
    /// Start playback of a browse entry on a player
    Play { pid: PlayerId, action: PlayAction },
    /// Step the volume of a player by the configured amount
    Volume { pid: PlayerId, up: bool },
    /// Send a player command to every player in scope, adding its `pid`
    Scoped(Command),
    SignIn,
    Reboot,
    Reconnect,
}

/// Everything the session reacts to
#[derive(Debug)]
pub enum SessionEvent {
    Timer(TimerFired),
    Discovered(SsdpResponse),
    Transport(TransportEvent),
    User(UserCommand),
}

impl From<TimerFired> for SessionEvent {
    fn from(fired: TimerFired) -> Self {
        SessionEvent::Timer(fired)
    }
}

impl From<SsdpResponse> for SessionEvent {
    fn from(response: SsdpResponse) -> Self {
        SessionEvent::Discovered(response)
    }
}

impl From<TransportEvent> for SessionEvent {
    fn from(event: TransportEvent) -> Self {
        SessionEvent::Transport(event)
    }
}

impl From<UserCommand> for SessionEvent {
    fn from(command: UserCommand) -> Self {
        SessionEvent::User(command)
    }
}

/// One control session against a HEOS system
pub struct Session {
    config: SessionConfig,
    store: Arc<dyn StateStore>,
    state: ConnectionState,
    tx: mpsc::UnboundedSender<SessionEvent>,
    updates: broadcast::Sender<StateUpdate>,
    timers: Timers<SessionEvent>,

    connection: Option<Connection>,
    generation: u64,
    address: Option<IpAddr>,
    discovery: Option<DiscoveryClient>,
    tracker: SearchTracker,

    demux: FrameDemux,
    queue: CommandQueue,
    heartbeat: HeartbeatMonitor,
    router: Router,

    /// Addresses that get a reboot instead of a normal startup
    reboot_ips: BTreeSet<IpAddr>,
    /// Addresses of players seen in earlier sessions
    player_ips: BTreeSet<IpAddr>,
    /// Addresses that answered discovery
    discovered_ips: BTreeSet<IpAddr>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn StateStore>,
        factory: Arc<dyn PlayerFactory>,
        tx: mpsc::UnboundedSender<SessionEvent>,
        updates: broadcast::Sender<StateUpdate>,
    ) -> Self {
        Self {
            timers: Timers::new(tx.clone()),
            queue: CommandQueue::new(config.queue_mode),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_retries),
            router: Router::new(store.clone(), factory, config.browse_page_size),
            config,
            store,
            state: ConnectionState::Disconnected,
            tx,
            updates,
            connection: None,
            generation: 0,
            address: None,
            discovery: None,
            tracker: SearchTracker::new(),
            demux: FrameDemux::new(),
            reboot_ips: BTreeSet::new(),
            player_ips: BTreeSet::new(),
            discovered_ips: BTreeSet::new(),
        }
    }

    #[cfg(test)]
    fn state(&self) -> ConnectionState {
        self.state
    }

    /// Process events until `shutdown` fires, then tear down
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionEvent>, mut shutdown: oneshot::Receiver<()>) {
        self.search().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        tracing::info!("Session shutting down");
        self.disconnect().await;
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Timer(fired) => {
                if !self.timers.accept(fired) {
                    tracing::trace!("Ignoring stale {:?} timer", fired.kind);
                    return;
                }
                match fired.kind {
                    TimerKind::Heartbeat => self.on_heartbeat().await,
                    TimerKind::Search => self.on_search_interval().await,
                    TimerKind::Reconnect => self.search().await,
                    TimerKind::Reboot => self.reconnect().await,
                }
            }
            SessionEvent::Discovered(response) => self.on_discovered(response).await,
            SessionEvent::Transport(TransportEvent::Data { generation, bytes }) => {
                if self.is_current(generation) {
                    self.on_data(&bytes).await;
                }
            }
            SessionEvent::Transport(TransportEvent::Closed { generation, error }) => {
                if self.is_current(generation) {
                    match error {
                        Some(e) => tracing::warn!("Connection lost: {}", e),
                        None => tracing::warn!("Connection closed by player"),
                    }
                    self.reconnect().await;
                }
            }
            SessionEvent::User(command) => self.on_user_command(command).await,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connection.is_some() && generation == self.generation
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        tracing::debug!("State {} -> {}", self.state, state);
        self.state = state;
        self.publish(StateUpdate::ConnectionChanged {
            state,
            address: self.address,
        });
    }

    fn publish(&self, update: StateUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }

    /// Start or continue discovery
    pub async fn search(&mut self) {
        self.set_state(ConnectionState::Searching);

        if self.discovery.is_none() {
            match DiscoveryClient::open(self.tx.clone()).await {
                Ok(client) => self.discovery = Some(client),
                Err(e) => tracing::warn!("Failed to open discovery socket: {}", e),
            }
        }
        self.send_search().await;

        if !self.timers.is_active(TimerKind::Search) {
            self.timers.start_interval(TimerKind::Search, self.config.search_interval);
        }
    }

    async fn send_search(&mut self) {
        let Some(discovery) = &self.discovery else {
            return;
        };
        if self.tracker.is_manual() {
            tracing::trace!("Sending discovery search");
        } else {
            tracing::debug!("Sending discovery search");
        }
        if let Err(e) = discovery.search().await {
            tracing::warn!("Discovery search failed: {}", e);
        }
    }

    async fn on_search_interval(&mut self) {
        if self.connection.is_some() {
            self.timers.cancel(TimerKind::Search);
            return;
        }

        match self.tracker.on_interval(self.config.search_retries, !self.player_ips.is_empty()) {
            SearchStep::Multicast => self.send_search().await,
            SearchStep::EnterManual => {
                tracing::info!(
                    "No discovery response, retrying {} known player(s)",
                    self.player_ips.len()
                );
                self.reboot_ips.extend(self.player_ips.iter().copied());
                self.reconnect().await;
            }
            SearchStep::Manual => {
                self.send_search().await;
                if let Some(ip) = self.tracker.next_manual_target(&self.reboot_ips) {
                    tracing::trace!("Probing {} directly", ip);
                    self.connect(ip).await;
                }
            }
        }
    }

    async fn on_discovered(&mut self, response: SsdpResponse) {
        if self.tracker.is_manual() {
            tracing::trace!("Discovery response from {}", response.address);
        } else {
            tracing::debug!("Discovery response from {}", response.address);
        }

        if response.matches_target() {
            self.discovered_ips.insert(response.address);
        }

        let active = self.connection.is_some() || self.state == ConnectionState::Connecting;
        match discovery::evaluate(&response, active, &self.reboot_ips) {
            Decision::Connect => self.connect(response.address).await,
            Decision::IgnoreActive => {}
            Decision::IgnoreTarget => {
                tracing::debug!("Ignoring {} with target {}", response.address, response.search_target)
            }
            Decision::IgnoreRebootPending => {
                tracing::debug!("Ignoring {} while waiting for a reboot", response.address)
            }
        }
    }

    /// Open the control connection to `ip`
    pub async fn connect(&mut self, ip: IpAddr) {
        if self.connection.is_some() {
            return;
        }
        self.set_state(ConnectionState::Connecting);

        self.generation += 1;
        let address = SocketAddr::new(ip, self.config.port);
        match Connection::open(address, self.config.connect_timeout, self.generation, self.tx.clone()).await {
            Ok(connection) => self.on_connected(ip, connection).await,
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", address, e);
                self.reconnect().await;
            }
        }
    }

    async fn on_connected(&mut self, ip: IpAddr, connection: Connection) {
        tracing::info!("Connected to {}", connection.address());
        self.connection = Some(connection);
        self.address = Some(ip);
        self.discovered_ips.insert(ip);
        self.timers.cancel(TimerKind::Search);
        self.tracker.reset();
        self.demux.reset();
        self.set_state(ConnectionState::Connected);

        self.store.set_state(ids::CONNECTION, json!(true));
        self.store.set_state(ids::ADDRESS, json!(ip.to_string()));

        if self.reboot_ips.remove(&ip) {
            tracing::warn!("Rebooting {} before using it", ip);
            self.queue.clear();
            self.enqueue(Command::reboot()).await;
            self.timers.start_once(TimerKind::Reboot, self.config.reboot_delay);
            return;
        }

        self.player_ips.insert(ip);
        self.queue.enqueue(Command::get_players());
        self.queue.enqueue(Command::register_for_change_events(true));
        self.queue.enqueue(match &self.config.credentials {
            Some(credentials) => Command::sign_in(&credentials.username, &credentials.password),
            None => Command::check_account(),
        });
        self.queue.enqueue(Command::get_music_sources());
        self.queue.enqueue(Command::get_groups());

        self.heartbeat.reset();
        self.timers.start_interval(TimerKind::Heartbeat, self.config.heartbeat_interval);
        self.dispatch().await;
    }

    /// Tear down and search again after the reconnect delay
    pub async fn reconnect(&mut self) {
        if matches!(self.state, ConnectionState::Reconnecting | ConnectionState::Disconnecting) {
            return;
        }
        self.disconnect().await;
        self.set_state(ConnectionState::Reconnecting);
        self.timers.start_once(TimerKind::Reconnect, self.config.reconnect_delay);
    }

    /// Stop timers, close sockets and drop all players
    pub async fn disconnect(&mut self) {
        self.set_state(ConnectionState::Disconnecting);

        self.timers.cancel_all();
        if let Some(connection) = self.connection.take() {
            tracing::info!("Disconnecting from {}", connection.address());
            connection.close().await;
        }
        if let Some(discovery) = self.discovery.take() {
            discovery.close();
        }

        self.router.reset();
        self.queue.clear();
        self.demux.reset();
        self.heartbeat.reset();
        self.store.set_state(ids::CONNECTION, json!(false));

        self.set_state(ConnectionState::Disconnected);
    }

    /// Queue a command and dispatch
    pub async fn enqueue(&mut self, command: Command) {
        self.queue.enqueue(command);
        self.dispatch().await;
    }

    /// Write the next batch of queued commands
    async fn dispatch(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        let mut failed = None;
        for command in self.queue.take_batch() {
            if let Err(e) = connection.send(&command).await {
                failed = Some(e);
                break;
            }
        }

        if let Some(e) = failed {
            tracing::warn!("Write failed: {}", e);
            self.reconnect().await;
        }
    }

    async fn on_data(&mut self, bytes: &[u8]) {
        for frame in self.demux.push(bytes) {
            tracing::debug!("Received: {} {}", frame.heos.command, frame.heos.message);
            for action in self.router.route(&frame) {
                self.apply(action);
            }
        }
        self.dispatch().await;
    }

    fn apply(&mut self, action: RouterAction) {
        match action {
            RouterAction::Send(command) => self.queue.enqueue(command),
            RouterAction::HeartbeatReply => self.heartbeat.reply(),
            RouterAction::SignIn => match &self.config.credentials {
                Some(credentials) => {
                    tracing::info!("Signing in again as {}", credentials.username);
                    self.queue
                        .enqueue(Command::sign_in(&credentials.username, &credentials.password));
                }
                None => tracing::debug!("Not signed in and no credentials configured"),
            },
            RouterAction::PlayersReported(ips) => {
                for ip in ips {
                    self.player_ips.insert(ip);
                    if !self.discovered_ips.contains(&ip) && !self.reboot_ips.contains(&ip) {
                        tracing::warn!("Player {} never answered discovery, flagging for reboot", ip);
                        self.reboot_ips.insert(ip);
                    }
                }
            }
            RouterAction::Publish(update) => self.publish(update),
        }
    }

    async fn on_heartbeat(&mut self) {
        if self.connection.is_none() {
            return;
        }
        match self.heartbeat.tick() {
            HeartbeatAction::Send => self.enqueue(Command::heart_beat()).await,
            HeartbeatAction::Escalate => {
                tracing::warn!(
                    "No heartbeat reply after {} attempts, rebooting player",
                    self.config.heartbeat_retries
                );
                self.queue.clear();
                self.enqueue(Command::reboot()).await;
                self.reconnect().await;
            }
        }
    }

    async fn on_user_command(&mut self, command: UserCommand) {
        match command {
            UserCommand::Reconnect => return self.reconnect().await,
            _ if self.connection.is_none() => {
                tracing::warn!("Not connected, dropping {:?}", command);
                return;
            }
            _ => {}
        }

        match self.user_commands(command) {
            Ok(commands) => {
                for command in commands {
                    self.queue.enqueue(command);
                }
                self.dispatch().await;
            }
            Err(e) => tracing::warn!("Rejected user command: {}", e),
        }
    }

    fn user_commands(&mut self, command: UserCommand) -> Result<Vec<Command>> {
        let commands = match command {
            UserCommand::Raw(text) => vec![Command::parse(&text)?],
            UserCommand::Browse(text) => vec![self.browse_command(&text)?],
            UserCommand::Play { pid, action } => vec![action.command(pid)],
            UserCommand::Volume { pid, up } => {
                let step = self.config.volume_step;
                vec![if up {
                    Command::volume_up(pid, step)
                } else {
                    Command::volume_down(pid, step)
                }]
            }
            UserCommand::Scoped(command) => self
                .router
                .scoped_players(self.config.command_scope)
                .into_iter()
                .map(|pid| command.clone().param("pid", pid))
                .collect(),
            UserCommand::SignIn => match &self.config.credentials {
                Some(c) => vec![Command::sign_in(&c.username, &c.password)],
                None => {
                    tracing::warn!("Sign-in requested without credentials");
                    Vec::new()
                }
            },
            UserCommand::Reboot => {
                self.timers.start_once(TimerKind::Reboot, self.config.reboot_delay);
                vec![Command::reboot()]
            }
            UserCommand::Reconnect => Vec::new(),
        };
        Ok(commands)
    }

    /// Listings are requested one page at a time
    fn browse_command(&self, text: &str) -> Result<Command> {
        let command = Command::parse(text)?;
        if command.path() != "browse/browse" || command.get("range").is_some() {
            return Ok(command);
        }
        let last = self.config.browse_page_size.max(1) - 1;
        Ok(command.param("range", format!("0,{}", last)))
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueMode;
    use crate::player::BasicPlayerFactory;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::{TcpListener, TcpStream};

    const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    struct Harness {
        session: Session,
        rx: mpsc::UnboundedReceiver<SessionEvent>,
        store: Arc<MemoryStore>,
        listener: TcpListener,
    }

    async fn harness(mode: QueueMode) -> Harness {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let config = SessionConfig {
            port: listener.local_addr().unwrap().port(),
            queue_mode: mode,
            heartbeat_retries: 2,
            ..SessionConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(64);
        let factory = Arc::new(BasicPlayerFactory::new(store.clone()));
        let session = Session::new(config, store.clone(), factory, tx, updates);
        Harness {
            session,
            rx,
            store,
            listener,
        }
    }

    struct Peer {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl Peer {
        fn new(stream: TcpStream) -> Self {
            let (read, writer) = stream.into_split();
            Self {
                lines: BufReader::new(read).lines(),
                writer,
            }
        }

        async fn line(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap()
        }

        async fn reply(&mut self, frame: &str) {
            self.writer.write_all(frame.as_bytes()).await.unwrap();
            self.writer.write_all(b"\r\n").await.unwrap();
        }
    }

    async fn connect(h: &mut Harness) -> Peer {
        h.session.connect(LOCALHOST).await;
        let (stream, _) = h.listener.accept().await.unwrap();
        Peer::new(stream)
    }

    /// Handle queued events until a data event was processed
    async fn pump_data(h: &mut Harness) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), h.rx.recv())
                .await
                .unwrap()
                .unwrap();
            let is_data = matches!(event, SessionEvent::Transport(TransportEvent::Data { .. }));
            h.session.handle_event(event).await;
            if is_data {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_sends_startup_commands() {
        let mut h = harness(QueueMode::Drain).await;
        let mut peer = connect(&mut h).await;

        assert_eq!(h.session.state(), ConnectionState::Connected);
        assert_eq!(peer.line().await, "heos://player/get_players");
        assert_eq!(peer.line().await, "heos://system/register_for_change_events?enable=on");
        assert_eq!(peer.line().await, "heos://system/check_account");
        assert_eq!(peer.line().await, "heos://browse/get_music_sources");
        assert_eq!(peer.line().await, "heos://group/get_groups");

        assert_eq!(h.store.get(ids::CONNECTION), Some(json!(true)));
        assert_eq!(h.store.get(ids::ADDRESS), Some(json!("127.0.0.1")));
        assert!(h.session.timers.is_active(TimerKind::Heartbeat));
    }

    #[tokio::test]
    async fn test_one_command_per_inbound_tick() {
        let mut h = harness(QueueMode::OnePerTick).await;
        let mut peer = connect(&mut h).await;

        assert_eq!(peer.line().await, "heos://player/get_players");
        assert_eq!(h.session.pending(), 4);

        peer.reply(r#"{"heos": {"command": "player/get_players", "result": "success", "message": ""}, "payload": [{"name": "Kitchen", "pid": 5, "ip": "127.0.0.1"}]}"#)
            .await;
        pump_data(&mut h).await;

        assert_eq!(peer.line().await, "heos://system/register_for_change_events?enable=on");
        assert!(h.store.get("players.5").is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_escalates_to_reboot() {
        let mut h = harness(QueueMode::Drain).await;
        let mut peer = connect(&mut h).await;
        for _ in 0..5 {
            peer.line().await;
        }

        h.session.on_heartbeat().await;
        assert_eq!(peer.line().await, "heos://system/heart_beat");

        h.session.on_heartbeat().await;
        assert_eq!(peer.line().await, "heos://system/reboot");
        assert_eq!(h.session.state(), ConnectionState::Reconnecting);
        assert_eq!(h.session.heartbeat.retries(), 0);
        assert!(h.session.timers.is_active(TimerKind::Reconnect));
    }

    #[tokio::test]
    async fn test_heartbeat_reply_resets_counter() {
        let mut h = harness(QueueMode::Drain).await;
        let mut peer = connect(&mut h).await;
        for _ in 0..5 {
            peer.line().await;
        }

        h.session.on_heartbeat().await;
        assert_eq!(h.session.heartbeat.retries(), 1);
        peer.reply(r#"{"heos": {"command": "system/heart_beat", "result": "success", "message": ""}}"#)
            .await;
        pump_data(&mut h).await;
        assert_eq!(h.session.heartbeat.retries(), 0);
        assert_eq!(h.session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_repeated_heartbeat_replies_keep_connection() {
        let mut h = harness(QueueMode::Drain).await;
        let mut peer = connect(&mut h).await;
        for _ in 0..5 {
            peer.line().await;
        }

        // Every reply is byte-identical to the previous one
        for _ in 0..4 {
            h.session.on_heartbeat().await;
            assert_eq!(peer.line().await, "heos://system/heart_beat");
            peer.reply(r#"{"heos": {"command": "system/heart_beat", "result": "success", "message": ""}}"#)
                .await;
            pump_data(&mut h).await;
            assert_eq!(h.session.heartbeat.retries(), 0);
        }

        assert_eq!(h.session.state(), ConnectionState::Connected);
        assert!(h.session.timers.is_active(TimerKind::Heartbeat));
    }

    #[tokio::test]
    async fn test_peer_close_reconnects_once() {
        let mut h = harness(QueueMode::Drain).await;
        let peer = connect(&mut h).await;
        drop(peer);

        loop {
            let event = h.rx.recv().await.unwrap();
            let closed = matches!(event, SessionEvent::Transport(TransportEvent::Closed { .. }));
            h.session.handle_event(event).await;
            if closed {
                break;
            }
        }

        assert_eq!(h.session.state(), ConnectionState::Reconnecting);
        assert_eq!(h.store.get(ids::CONNECTION), Some(json!(false)));

        // Already reconnecting: no second teardown
        h.session.reconnect().await;
        assert_eq!(h.session.state(), ConnectionState::Reconnecting);
        assert!(h.session.timers.is_active(TimerKind::Reconnect));
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let mut h = harness(QueueMode::Drain).await;
        let _peer = connect(&mut h).await;

        h.session
            .handle_event(SessionEvent::Transport(TransportEvent::Closed {
                generation: 0,
                error: None,
            }))
            .await;
        assert_eq!(h.session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reboot_address_is_rebooted_instead_of_used() {
        let mut h = harness(QueueMode::Drain).await;
        h.session.reboot_ips.insert(LOCALHOST);

        let mut peer = connect(&mut h).await;
        assert_eq!(peer.line().await, "heos://system/reboot");
        assert!(h.session.reboot_ips.is_empty());
        assert!(h.session.timers.is_active(TimerKind::Reboot));
        assert!(!h.session.timers.is_active(TimerKind::Heartbeat));
    }

    #[tokio::test]
    async fn test_failed_connect_schedules_reconnect() {
        let mut h = harness(QueueMode::Drain).await;
        let port = h.listener.local_addr().unwrap().port();
        drop(h.listener);
        h.listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        h.session.config.port = port;

        h.session.connect(LOCALHOST).await;
        assert_eq!(h.session.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn test_user_commands() {
        let mut h = harness(QueueMode::Drain).await;
        let mut peer = connect(&mut h).await;
        for _ in 0..5 {
            peer.line().await;
        }

        h.session
            .handle_event(UserCommand::Browse("heos://browse/browse?sid=1028".to_string()).into())
            .await;
        assert_eq!(peer.line().await, "heos://browse/browse?sid=1028&range=0,49");

        h.session
            .handle_event(UserCommand::Volume { pid: 5, up: false }.into())
            .await;
        assert_eq!(peer.line().await, "heos://player/volume_down?pid=5&step=5");

        h.session
            .handle_event(UserCommand::Play {
                pid: 5,
                action: PlayAction::Preset { preset: 3 },
            }
            .into())
            .await;
        assert_eq!(peer.line().await, "heos://browse/play_preset?pid=5&preset=3");

        // Rejected strings do not reach the socket
        h.session
            .handle_event(UserCommand::Raw("not a command".to_string()).into())
            .await;
        h.session
            .handle_event(UserCommand::Raw("heos://player/get_volume?pid=5".to_string()).into())
            .await;
        assert_eq!(peer.line().await, "heos://player/get_volume?pid=5");
    }

    #[tokio::test]
    async fn test_not_logged_in_triggers_sign_in() {
        let mut h = harness(QueueMode::Drain).await;
        h.session.config.credentials = Some(crate::config::Credentials {
            username: "me@example.com".to_string(),
            password: "secret".to_string(),
        });
        let mut peer = connect(&mut h).await;
        for _ in 0..5 {
            peer.line().await;
        }

        peer.reply(r#"{"heos": {"command": "browse/browse", "result": "fail", "message": "eid=8&text=User not logged in"}}"#)
            .await;
        pump_data(&mut h).await;

        assert_eq!(peer.line().await, "heos://system/sign_in?un=me@example.com&pw=secret");
        assert_eq!(
            h.store.get(ids::ERROR_LOG),
            Some(json!(["browse/browse: User not logged in"]))
        );
    }

    #[tokio::test]
    async fn test_unseen_players_are_flagged_for_reboot() {
        let mut h = harness(QueueMode::Drain).await;
        let mut peer = connect(&mut h).await;
        for _ in 0..5 {
            peer.line().await;
        }

        peer.reply(r#"{"heos": {"command": "player/get_players", "result": "success", "message": ""}, "payload": [{"name": "Here", "pid": 1, "ip": "127.0.0.1"}, {"name": "Hidden", "pid": 2, "ip": "10.9.9.9"}]}"#)
            .await;
        pump_data(&mut h).await;

        let hidden: IpAddr = "10.9.9.9".parse().unwrap();
        assert!(h.session.reboot_ips.contains(&hidden));
        assert!(!h.session.reboot_ips.contains(&LOCALHOST));
        assert!(h.session.player_ips.contains(&hidden));
    }

    fn ssdp(address: IpAddr, target: &str) -> SsdpResponse {
        SsdpResponse {
            address,
            search_target: target.to_string(),
            location: None,
            usn: None,
            server: None,
        }
    }

    #[tokio::test]
    async fn test_discovery_ignores_other_targets() {
        let mut h = harness(QueueMode::Drain).await;

        h.session
            .handle_event(ssdp(LOCALHOST, "urn:schemas-upnp-org:device:MediaRenderer:1").into())
            .await;

        assert!(h.session.connection.is_none());
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert!(!h.session.discovered_ips.contains(&LOCALHOST));
    }

    #[tokio::test]
    async fn test_discovery_waits_for_pending_reboot() {
        let mut h = harness(QueueMode::Drain).await;
        h.session.reboot_ips.insert("10.9.9.9".parse().unwrap());

        h.session
            .handle_event(ssdp(LOCALHOST, crate::discovery::DISCOVERY_TARGET).into())
            .await;

        assert!(h.session.connection.is_none());
        assert!(h.session.discovered_ips.contains(&LOCALHOST));
    }

    #[tokio::test]
    async fn test_discovery_connects_then_ignores_other_players() {
        let mut h = harness(QueueMode::Drain).await;

        h.session
            .handle_event(ssdp(LOCALHOST, crate::discovery::DISCOVERY_TARGET).into())
            .await;
        let (stream, _) = h.listener.accept().await.unwrap();
        let mut peer = Peer::new(stream);
        assert_eq!(h.session.state(), ConnectionState::Connected);
        assert_eq!(peer.line().await, "heos://player/get_players");

        let other: IpAddr = "10.0.0.8".parse().unwrap();
        h.session
            .handle_event(ssdp(other, crate::discovery::DISCOVERY_TARGET).into())
            .await;
        assert_eq!(h.session.address, Some(LOCALHOST));
        assert_eq!(h.session.state(), ConnectionState::Connected);
        assert!(h.session.discovered_ips.contains(&other));
    }

    #[tokio::test]
    async fn test_search_without_known_players_stays_multicast() {
        let mut h = harness(QueueMode::Drain).await;
        h.session.config.search_retries = 2;

        for _ in 0..5 {
            h.session.on_search_interval().await;
        }

        assert!(!h.session.tracker.is_manual());
        assert!(h.session.reboot_ips.is_empty());
        assert!(h.session.connection.is_none());
    }

    #[tokio::test]
    async fn test_missed_searches_enter_manual_mode() {
        let mut h = harness(QueueMode::Drain).await;
        let known: IpAddr = "10.9.9.9".parse().unwrap();
        h.session.config.search_retries = 2;
        h.session.player_ips.insert(known);
        h.session
            .timers
            .start_interval(TimerKind::Search, Duration::from_millis(10));

        while h.session.state() != ConnectionState::Reconnecting {
            let event = tokio::time::timeout(Duration::from_secs(2), h.rx.recv())
                .await
                .unwrap()
                .unwrap();
            h.session.handle_event(event).await;
        }

        assert!(h.session.tracker.is_manual());
        assert!(h.session.reboot_ips.contains(&known));
        assert!(h.session.timers.is_active(TimerKind::Reconnect));
        assert!(!h.session.timers.is_active(TimerKind::Search));
    }

    #[tokio::test]
    async fn test_manual_search_reboots_known_player() {
        let mut h = harness(QueueMode::Drain).await;
        h.session.config.search_retries = 1;
        h.session.player_ips.insert(LOCALHOST);

        h.session.on_search_interval().await;
        assert!(h.session.tracker.is_manual());
        assert!(h.session.reboot_ips.contains(&LOCALHOST));

        h.session.on_search_interval().await;
        let (stream, _) = h.listener.accept().await.unwrap();
        let mut peer = Peer::new(stream);

        assert_eq!(peer.line().await, "heos://system/reboot");
        assert!(h.session.reboot_ips.is_empty());
        assert!(!h.session.tracker.is_manual());
        assert!(h.session.timers.is_active(TimerKind::Reboot));
    }
}
