use crate::config::SessionConfig;
use crate::error::{HeosError, Result};
use crate::player::PlayerFactory;
use crate::session::{Session, SessionEvent, UserCommand};
use crate::store::StateStore;
use crate::subscription::{StateReceiver, StateUpdate};
use crate::soap::SoapResult;
use crate::upnp::UpnpDevice;
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

const UPDATE_CAPACITY: usize = 256;

/// Client for a HEOS system on the local network
///
/// The `HeosClient` runs a session in the background that discovers a HEOS
/// player, keeps the control connection alive and mirrors players, groups,
/// sources and browse results into the given [`StateStore`].
pub struct HeosClient {
    tx: mpsc::UnboundedSender<SessionEvent>,
    updates: broadcast::Sender<StateUpdate>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HeosClient {
    /// Start a session
    ///
    /// Discovery begins immediately; the first matching player becomes the
    /// control connection.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use heos_control::{BasicPlayerFactory, HeosClient, MemoryStore, SessionConfig};
    /// use std::sync::Arc;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let store = Arc::new(MemoryStore::new());
    ///     let factory = Arc::new(BasicPlayerFactory::new(store.clone()));
    ///     let client = HeosClient::start(SessionConfig::default(), store, factory);
    ///
    ///     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    ///     client.shutdown().await;
    ///     Ok(())
    /// }
    /// ```
    pub fn start(config: SessionConfig, store: Arc<dyn StateStore>, factory: Arc<dyn PlayerFactory>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let (shutdown, shutdown_rx) = oneshot::channel();

        let session = Session::new(config, store, factory, tx.clone(), updates.clone());
        let task = tokio::spawn(session.run(rx, shutdown_rx));

        Self {
            tx,
            updates,
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Queue a command for the session
    ///
    /// # Example
    ///
    /// ```no_run
    /// use heos_control::{BasicPlayerFactory, HeosClient, MemoryStore, SessionConfig, UserCommand};
    /// use std::sync::Arc;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let store = Arc::new(MemoryStore::new());
    ///     let factory = Arc::new(BasicPlayerFactory::new(store.clone()));
    ///     let client = HeosClient::start(SessionConfig::default(), store, factory);
    ///
    ///     client.send(UserCommand::Raw("heos://player/get_players".to_string()))?;
    ///     client.send(UserCommand::Volume { pid: 1234, up: true })?;
    ///     Ok(())
    /// }
    /// ```
    pub fn send(&self, command: UserCommand) -> Result<()> {
        self.tx
            .send(SessionEvent::User(command))
            .map_err(|_| HeosError::ChannelError("Session has stopped".to_string()))
    }

    /// Subscribe to state updates from the session
    ///
    /// Multiple subscriptions can be active simultaneously.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use heos_control::{BasicPlayerFactory, HeosClient, MemoryStore, SessionConfig};
    /// use std::sync::Arc;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let store = Arc::new(MemoryStore::new());
    ///     let factory = Arc::new(BasicPlayerFactory::new(store.clone()));
    ///     let client = HeosClient::start(SessionConfig::default(), store, factory);
    ///     let mut rx = client.subscribe_state();
    ///
    ///     while let Ok(update) = rx.recv().await {
    ///         println!("State update: {:?}", update);
    ///     }
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn subscribe_state(&self) -> StateReceiver {
        StateReceiver::new(self.updates.subscribe())
    }

    /// Stop the session and wait for it to disconnect
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!("Session task failed: {}", e);
        }
    }

    /// Describe the UPnP services of the player at `address`
    pub async fn upnp_device(address: IpAddr, timeout: Duration) -> Result<UpnpDevice> {
        UpnpDevice::connect(address, timeout).await
    }

    /// Describe the player at `address` and invoke one SOAP action on it
    ///
    /// ```no_run
    /// use heos_control::HeosClient;
    /// use serde_json::{json, Map};
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() -> heos_control::Result<()> {
    ///     let mut args = Map::new();
    ///     args.insert("InstanceID".to_string(), json!(0));
    ///     args.insert("Channel".to_string(), json!("Master"));
    ///
    ///     let address = "192.168.1.20".parse().unwrap();
    ///     let result = HeosClient::invoke(address, Duration::from_secs(10), "RenderingControl", "GetVolume", &args).await?;
    ///     println!("{:?}", result["CurrentVolume"]);
    ///     Ok(())
    /// }
    /// ```
    pub async fn invoke(
        address: IpAddr,
        timeout: Duration,
        service: &str,
        action: &str,
        args: &Map<String, Value>,
    ) -> Result<SoapResult> {
        let device = UpnpDevice::connect(address, timeout).await?;
        device.invoke(service, action, args).await
    }
}
