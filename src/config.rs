use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default TCP port of the HEOS CLI
pub const DEFAULT_PORT: u16 = 1255;

/// Account credentials passed through to `system/sign_in`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// How many queued commands are written per dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// One command per dispatch, interleaved with inbound processing
    #[default]
    OnePerTick,
    /// Drain the whole queue on every dispatch
    Drain,
}

/// Which players a scoped user command is fanned out to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandScope {
    #[default]
    All,
    Leaders,
}

/// Session configuration
///
/// Every field has a default, so a host can deserialize a partial object:
///
/// ```
/// use heos_control::SessionConfig;
///
/// let config: SessionConfig = serde_json::from_str(r#"{"heartbeat_retries": 3}"#).unwrap();
/// assert_eq!(config.heartbeat_retries, 3);
/// assert_eq!(config.port, 1255);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// CLI port on the player
    pub port: u16,

    /// Account to sign in with after connecting
    pub credentials: Option<Credentials>,

    pub queue_mode: QueueMode,

    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Unanswered heartbeats before the player is rebooted
    pub heartbeat_retries: u32,

    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,

    /// Delay between a reboot request and the following reconnect
    #[serde(with = "duration_ms")]
    pub reboot_delay: Duration,

    #[serde(with = "duration_ms")]
    pub search_interval: Duration,

    /// Search intervals without a usable response before manual search starts
    pub search_retries: u32,

    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Upper bound for UPnP/SOAP HTTP requests
    #[serde(with = "duration_ms")]
    pub http_timeout: Duration,

    pub volume_step: u8,

    /// Number of items requested per browse page
    pub browse_page_size: u32,

    pub command_scope: CommandScope,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            credentials: None,
            queue_mode: QueueMode::default(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_retries: 5,
            reconnect_delay: Duration::from_secs(5),
            reboot_delay: Duration::from_secs(30),
            search_interval: Duration::from_secs(10),
            search_retries: 3,
            connect_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(10),
            volume_step: 5,
            browse_page_size: 50,
            command_scope: CommandScope::default(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SessionConfig = serde_json::from_str(
            r#"{
                "credentials": {"username": "me@example.com", "password": "secret"},
                "queue_mode": "drain",
                "heartbeat_interval": 2500,
                "command_scope": "leaders"
            }"#,
        )
        .unwrap();

        assert_eq!(config.queue_mode, QueueMode::Drain);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(2500));
        assert_eq!(config.command_scope, CommandScope::Leaders);
        assert_eq!(config.credentials.unwrap().username, "me@example.com");
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.browse_page_size, 50);
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let json = serde_json::to_value(SessionConfig::default()).unwrap();
        assert_eq!(json["search_interval"], 10_000);
        assert_eq!(json["queue_mode"], "one_per_tick");
    }
}
