//! Configuration types for mesh nodes
//!
//! This module defines [`MeshConfig`], the tunables of the routing engine,
//! and the [`NetworkProfile`] presets. Configuration is stored as
//! human-readable JSON; durations are written as milliseconds.

use crate::error::{ConfigError, Result};
use crate::protocol::{NodeId, MAX_HOP_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Pre-configured profiles for different device roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProfile {
    /// Battery-powered devices
    ///
    /// - Max 3 links
    /// - Heartbeat every 30 s
    /// - Messages travel at most 5 hops
    LowPower,

    /// Balanced configuration suitable for most devices (default)
    ///
    /// - Max 7 links
    /// - Heartbeat every 10 s
    /// - Messages travel at most 10 hops
    #[default]
    Standard,

    /// Always-on devices that carry traffic for others
    ///
    /// - Max 7 links
    /// - Heartbeat every 5 s, so neighbors notice departures quickly
    /// - Messages travel at most 10 hops
    Relay,
}

impl NetworkProfile {
    /// Get the default maximum number of simultaneous links
    pub fn default_max_connections(&self) -> usize {
        match self {
            Self::LowPower => 3,
            Self::Standard => 7,
            Self::Relay => 7,
        }
    }

    /// Get the default heartbeat period
    pub fn default_heartbeat_interval(&self) -> Duration {
        match self {
            Self::LowPower => Duration::from_secs(30),
            Self::Standard => Duration::from_secs(10),
            Self::Relay => Duration::from_secs(5),
        }
    }

    /// Get the default silence after which a node is timed out
    pub fn default_heartbeat_timeout(&self) -> Duration {
        self.default_heartbeat_interval() * 6
    }

    /// Get the default hop limit
    pub fn default_max_hops(&self) -> u32 {
        match self {
            Self::LowPower => 5,
            Self::Standard | Self::Relay => 10,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Complete node configuration
///
/// Instances are usually created through `MeshNodeBuilder` and are
/// validated before the node is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Display name announced to other nodes
    pub device_name: String,

    /// Transport address of this device
    pub link_address: String,

    /// Fixed node ID; generated from `link_address` when absent
    pub node_id: Option<NodeId>,

    /// Preset the remaining values were derived from
    pub network_profile: NetworkProfile,

    /// Maximum number of links a message may cross
    pub max_hops: u32,

    /// Maximum number of simultaneous links; extra links are closed
    pub max_connections: usize,

    /// Heartbeat and liveness sweep period
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Silence after which a node is considered unreachable
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,

    /// Time an unreachable node is remembered before eviction
    #[serde(with = "duration_ms")]
    pub eviction_timeout: Duration,

    /// Period of unsolicited topology advertisements
    #[serde(with = "duration_ms")]
    pub topology_interval: Duration,

    /// How long a route request waits for a reply
    #[serde(with = "duration_ms")]
    pub discovery_timeout: Duration,

    /// How long a seen message ID suppresses duplicates
    #[serde(with = "duration_ms")]
    pub dedup_window: Duration,

    /// Maximum number of remembered message IDs
    pub dedup_capacity: usize,

    /// How long a seen route request suppresses re-flooding
    #[serde(with = "duration_ms")]
    pub request_window: Duration,

    /// Relayed messages buffered per pending route request
    pub relay_buffer_limit: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::for_profile(NetworkProfile::default())
    }
}

impl MeshConfig {
    /// Configuration derived from a profile
    pub fn for_profile(profile: NetworkProfile) -> Self {
        let heartbeat_timeout = profile.default_heartbeat_timeout();
        Self {
            device_name: "Unknown Device".to_string(),
            link_address: "00:00:00:00:00:00".to_string(),
            node_id: None,
            network_profile: profile,
            max_hops: profile.default_max_hops(),
            max_connections: profile.default_max_connections(),
            heartbeat_interval: profile.default_heartbeat_interval(),
            heartbeat_timeout,
            eviction_timeout: heartbeat_timeout * 3,
            topology_interval: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(5),
            dedup_window: Duration::from_secs(120),
            dedup_capacity: 4096,
            request_window: Duration::from_secs(30),
            relay_buffer_limit: 32,
        }
    }

    /// Apply a profile's presets, keeping identity fields
    pub fn apply_profile(&mut self, profile: NetworkProfile) {
        let preset = Self::for_profile(profile);
        self.network_profile = profile;
        self.max_hops = preset.max_hops;
        self.max_connections = preset.max_connections;
        self.heartbeat_interval = preset.heartbeat_interval;
        self.heartbeat_timeout = preset.heartbeat_timeout;
        self.eviction_timeout = preset.eviction_timeout;
    }

    /// Node ID to use, generating one if none is configured
    pub fn resolve_node_id(&self) -> NodeId {
        match &self.node_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => NodeId::generate(&self.link_address),
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if any validation check fails:
    /// - `max_hops` must be in `1..=32`
    /// - `max_connections`, `dedup_capacity` must be greater than 0
    /// - every interval and timeout must be non-zero
    /// - `heartbeat_timeout` must exceed `heartbeat_interval`
    /// - `eviction_timeout` must exceed `heartbeat_timeout`
    pub fn validate(&self) -> Result<()> {
        if self.max_hops == 0 || self.max_hops > MAX_HOP_LIMIT {
            return Err(invalid(
                "max_hops",
                format!("must be between 1 and {}", MAX_HOP_LIMIT),
            ));
        }

        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be greater than 0"));
        }

        if self.dedup_capacity == 0 {
            return Err(invalid("dedup_capacity", "must be greater than 0"));
        }

        if matches!(&self.node_id, Some(id) if id.is_empty()) {
            return Err(invalid("node_id", "must not be empty"));
        }

        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("topology_interval", self.topology_interval),
            ("discovery_timeout", self.discovery_timeout),
            ("dedup_window", self.dedup_window),
            ("request_window", self.request_window),
        ];
        for (field, value) in intervals {
            if value.is_zero() {
                return Err(invalid(field, "must be non-zero"));
            }
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(invalid(
                "heartbeat_timeout",
                "must be longer than heartbeat_interval",
            ));
        }

        if self.eviction_timeout <= self.heartbeat_timeout {
            return Err(invalid(
                "eviction_timeout",
                "must be longer than heartbeat_timeout",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> crate::error::MeshError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
    .into()
}

/// Save configuration to a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
/// * `config` - Configuration to save
///
/// # Example
///
/// ```no_run
/// use meshroute::api::config::{save_config, MeshConfig};
/// use std::path::Path;
///
/// let config = MeshConfig::default();
/// save_config(Path::new("mesh.json"), &config).unwrap();
/// ```
pub fn save_config(path: &Path, config: &MeshConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }

    let json = serde_json::to_string_pretty(config).map_err(|e| ConfigError::Serialization {
        reason: format!("Failed to serialize config: {}", e),
    })?;

    std::fs::write(path, json).map_err(|e| io_error(path, e))?;

    Ok(())
}

/// Load and validate configuration from a JSON file
///
/// Missing fields take their default values.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read
/// - The file contains invalid JSON
/// - The loaded configuration fails [`MeshConfig::validate`]
pub fn load_config(path: &Path) -> Result<MeshConfig> {
    let json = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;

    let config: MeshConfig =
        serde_json::from_str(&json).map_err(|e| ConfigError::Serialization {
            reason: format!("Failed to deserialize config: {}", e),
        })?;

    config.validate()?;

    Ok(config)
}

fn io_error(path: &Path, err: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}
