use crate::browse::BrowseView;
use crate::error::{HeosError, Result};
use crate::session::ConnectionState;
use crate::types::{GroupInfo, PlayerInfo};
use std::net::IpAddr;
use tokio::sync::broadcast;

/// State change published by the session
#[derive(Debug, Clone)]
pub enum StateUpdate {
    /// Connection state machine moved
    ConnectionChanged {
        state: ConnectionState,
        address: Option<IpAddr>,
    },

    /// Player list was refreshed
    PlayersChanged(Vec<PlayerInfo>),

    /// Group topology was rebuilt
    GroupsChanged(Vec<GroupInfo>),

    /// A browse listing was rendered
    BrowseResult(Box<BrowseView>),

    /// The device rejected a command
    CommandFailed { command: String, text: String },
}

/// Receiver for state updates
pub struct StateReceiver {
    rx: broadcast::Receiver<StateUpdate>,
}

impl StateReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<StateUpdate>) -> Self {
        Self { rx }
    }

    /// Receive the next state update
    ///
    /// Fails with `ConnectionClosed` once the session has shut down.
    pub async fn recv(&mut self) -> Result<StateUpdate> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => HeosError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                HeosError::ChannelError(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Try to receive a state update without blocking
    ///
    /// Returns `None` if no message is available.
    pub fn try_recv(&mut self) -> Result<Option<StateUpdate>> {
        match self.rx.try_recv() {
            Ok(update) => Ok(Some(update)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(HeosError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(HeosError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}
