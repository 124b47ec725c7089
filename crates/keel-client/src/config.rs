//! Client configuration.
//!
//! Durations are kept as human-readable strings (`"5s"`, `"500ms"`,
//! `"2m"`) so a `keel.toml` stays easy to edit; accessors parse them on
//! demand and fall back to the default when a value is malformed.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigResult;
use crate::protocol::Protocol;

/// Seed used when nothing else is configured.
pub const DEFAULT_SEED: &str = "http://127.0.0.1:4001";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seed URIs, tried in order during discovery.
    pub seeds: Vec<String>,
    /// Wire protocol generation spoken by the cluster.
    pub protocol: Protocol,
    /// Leader heartbeat period. Zero disables the heartbeat.
    pub heartbeat_interval: String,
    /// Upper bound on a single node probe.
    pub probe_timeout: String,
    /// Upper bound on establishing a TCP connection.
    pub connect_timeout: String,
    /// Pause before re-watching after a watch returned no change.
    pub watch_retry_delay: String,
    /// Key read by every heartbeat tick.
    pub heartbeat_key: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seeds: vec![DEFAULT_SEED.to_string()],
            protocol: Protocol::V2,
            heartbeat_interval: "0s".to_string(),
            probe_timeout: "2s".to_string(),
            connect_timeout: "5s".to_string(),
            watch_retry_delay: "1s".to_string(),
            heartbeat_key: "/_keel/heartbeat".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: ClientConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn with_seeds<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = format!("{}ms", interval.as_millis());
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = format!("{}ms", timeout.as_millis());
        self
    }

    pub fn with_watch_retry_delay(mut self, delay: Duration) -> Self {
        self.watch_retry_delay = format!("{}ms", delay.as_millis());
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        duration_or(&self.heartbeat_interval, "heartbeat_interval", Duration::ZERO)
    }

    pub fn probe_timeout(&self) -> Duration {
        duration_or(&self.probe_timeout, "probe_timeout", Duration::from_secs(2))
    }

    pub fn connect_timeout(&self) -> Duration {
        duration_or(&self.connect_timeout, "connect_timeout", Duration::from_secs(5))
    }

    pub fn watch_retry_delay(&self) -> Duration {
        duration_or(&self.watch_retry_delay, "watch_retry_delay", Duration::from_secs(1))
    }
}

fn duration_or(raw: &str, field: &str, default: Duration) -> Duration {
    parse_duration(raw).unwrap_or_else(|| {
        warn!(field, value = raw, "invalid duration in config, using default");
        default
    })
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
