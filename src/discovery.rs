//! SSDP discovery of HEOS players
//!
//! A multicast M-SEARCH for [`DISCOVERY_TARGET`] is sent on every search
//! interval; responders are reported to the session, which decides whether
//! to connect. When no usable response arrives for several intervals and
//! player addresses are known from an earlier session, the tracker switches
//! into manual search and the session tries those addresses directly.

use crate::error::Result;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Search target a HEOS player must echo back
pub const DISCOVERY_TARGET: &str = "urn:schemas-denon-com:device:ACT-Denon:1";

const SSDP_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 1900);
const USER_AGENT: &str = "heos-control/0.1 UPnP/1.1";

/// Parsed response to an M-SEARCH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpResponse {
    /// Address the response came from
    pub address: IpAddr,
    pub search_target: String,
    pub location: Option<String>,
    pub usn: Option<String>,
    pub server: Option<String>,
}

impl SsdpResponse {
    pub fn matches_target(&self) -> bool {
        self.search_target == DISCOVERY_TARGET
    }
}

/// Outcome of evaluating a discovery response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Connect,
    /// A session is already active
    IgnoreActive,
    /// Response was for a different search target
    IgnoreTarget,
    /// Another device is awaiting a forced reboot
    IgnoreRebootPending,
}

/// Decide whether a responder becomes the connection target
pub fn evaluate(response: &SsdpResponse, session_active: bool, reboot_ips: &BTreeSet<IpAddr>) -> Decision {
    if session_active {
        Decision::IgnoreActive
    } else if !response.matches_target() {
        Decision::IgnoreTarget
    } else if !reboot_ips.is_empty() && !reboot_ips.contains(&response.address) {
        Decision::IgnoreRebootPending
    } else {
        Decision::Connect
    }
}

/// What the session should do on a search interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStep {
    /// Send another multicast search
    Multicast,
    /// Switch to manual search: mark known players for reboot and reconnect
    EnterManual,
    /// Already in manual search: connect to known addresses directly
    Manual,
}

/// Counts search intervals without a usable response
#[derive(Debug, Default)]
pub struct SearchTracker {
    missed: u32,
    manual: bool,
    cursor: usize,
}

impl SearchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_interval(&mut self, retries: u32, have_known_players: bool) -> SearchStep {
        if self.manual {
            return SearchStep::Manual;
        }
        self.missed += 1;
        if self.missed >= retries && have_known_players {
            self.manual = true;
            SearchStep::EnterManual
        } else {
            SearchStep::Multicast
        }
    }

    /// Next address to try while in manual search
    pub fn next_manual_target(&mut self, candidates: &BTreeSet<IpAddr>) -> Option<IpAddr> {
        if candidates.is_empty() {
            return None;
        }
        let target = candidates.iter().nth(self.cursor % candidates.len()).copied();
        self.cursor = self.cursor.wrapping_add(1);
        target
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    /// A connection was established
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Multicast search socket with a background receive task
pub struct DiscoveryClient {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl DiscoveryClient {
    /// Bind the search socket; responses are posted to `tx`
    pub async fn open<E: From<SsdpResponse> + Send + 'static>(tx: mpsc::UnboundedSender<E>) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_loop_v4(true)?;
        let socket = Arc::new(socket);

        let reader = socket.clone();
        let task = tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                match reader.recv_from(&mut buffer).await {
                    Ok((size, from)) => {
                        let Ok(text) = std::str::from_utf8(&buffer[..size]) else {
                            continue;
                        };
                        if let Some(response) = parse_ssdp_response(text, from.ip()) {
                            if tx.send(response.into()).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Discovery socket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self { socket, task })
    }

    /// Send one M-SEARCH
    pub async fn search(&self) -> Result<()> {
        let request = format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 3\r\n\
             ST: {}\r\n\
             USER-AGENT: {}\r\n\
             \r\n",
            DISCOVERY_TARGET, USER_AGENT
        );
        self.socket.send_to(request.as_bytes(), SSDP_ADDR).await?;
        Ok(())
    }

    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Parse an SSDP response from HTTP header text
fn parse_ssdp_response(response: &str, address: IpAddr) -> Option<SsdpResponse> {
    let mut lines = response.lines();
    if !lines.next()?.trim().starts_with("HTTP/1.1 200") {
        return None;
    }

    let mut search_target = None;
    let mut location = None;
    let mut usn = None;
    let mut server = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match name.trim().to_ascii_uppercase().as_str() {
            "ST" => search_target = Some(value),
            "LOCATION" => location = Some(value),
            "USN" => usn = Some(value),
            "SERVER" => server = Some(value),
            _ => {}
        }
    }

    Some(SsdpResponse {
        address,
        search_target: search_target?,
        location,
        usn,
        server,
    })
}
