//! Station Configuration
//!
//! Configuration can be loaded from:
//! - Default values
//! - Config file (~/.config/epc-station/station.toml)
//! - Environment variables (`STATION_NO`, `FACTORY_CODE`, `STATION_NO_CUS`,
//!   `EPC_REMOTE_URL`), usually provided through a `.env` file
//!
//! Everything here is read once at startup and treated as immutable.

use crate::error::{Result, StationError};
use serde::{Deserialize, Serialize};
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,

    /// Station identity
    pub station: StationSection,

    /// Record store gateway
    pub remote: RemoteConfig,

    /// Reachability probe
    pub probe: ProbeConfig,

    /// Local offline queue
    pub queue: QueueConfig,

    /// Sync behaviour
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StationSection {
    /// Station number sent with every record
    pub station_no: String,

    /// Factory server code
    pub factory_code: String,

    /// Customer-facing station number
    pub station_no_cus: String,

    /// Override for the network address reported with online scans
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the record store gateway
    pub base_url: String,

    /// Upsert procedure name
    pub procedure: String,

    /// Per-request timeout
    pub request_timeout_ms: u64,

    /// Maximum concurrent sessions against the record store
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// URL checked with HEAD requests
    pub url: String,

    /// How often to probe
    pub interval_secs: u64,

    /// Probe request timeout
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// SQLite file holding buffered scans
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Periodic sync interval while online
    pub interval_secs: u64,

    /// Consecutive connectivity failures before a pass is abandoned
    pub max_consecutive_connectivity_errors: u32,

    /// Sync as soon as the station first comes online
    pub sync_on_start: bool,

    /// Buffer an online scan locally when the record store is unreachable
    pub fallback_to_buffer: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            station: StationSection::default(),
            remote: RemoteConfig::default(),
            probe: ProbeConfig::default(),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            procedure: "SP_UpsertEpcRecord".to_string(),
            request_timeout_ms: 20_000,
            max_sessions: 4,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: "https://www.google.com".to_string(),
            interval_secs: 5,
            timeout_ms: 3_000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: data_dir.join("epc-station").join("offline.db"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_consecutive_connectivity_errors: 3,
            sync_on_start: true,
            fallback_to_buffer: true,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl StationConfig {
    /// Get default configuration file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("epc-station")
            .join("station.toml")
    }

    /// Load configuration from file (if present), then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply environment overrides from `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STATION_NO") {
            self.station.station_no = v;
        }
        if let Some(v) = lookup("FACTORY_CODE") {
            self.station.factory_code = v;
        }
        if let Some(v) = lookup("STATION_NO_CUS") {
            self.station.station_no_cus = v;
        }
        if let Some(v) = lookup("EPC_REMOTE_URL") {
            self.remote.base_url = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.station.station_no.trim().is_empty() {
            return Err(StationError::Config("station.station_no is not set".into()));
        }
        if self.remote.base_url.trim().is_empty() {
            return Err(StationError::Config("remote.base_url is not set".into()));
        }
        if self.remote.max_sessions == 0 {
            return Err(StationError::Config("remote.max_sessions must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve the immutable station identity
    pub fn identity(&self) -> StationIdentity {
        let address = self
            .station
            .origin_address
            .clone()
            .or_else(discover_address)
            .unwrap_or_else(|| crate::models::OFFLINE_ORIGIN.to_string());

        StationIdentity {
            station_no: self.station.station_no.clone(),
            factory_code: self.station.factory_code.clone(),
            station_no_cus: self.station.station_no_cus.clone(),
            address,
        }
    }
}

/// Station codes and network address, fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationIdentity {
    pub station_no: String,
    pub factory_code: String,
    pub station_no_cus: String,
    pub address: String,
}

/// Find the outbound IPv4 address, falling back to the hostname.
///
/// Connecting a UDP socket sends nothing; it only selects the route.
fn discover_address() -> Option<String> {
    let routed = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .ok()
        .map(|addr| addr.ip())
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified());

    match routed {
        Some(ip) => Some(ip.to_string()),
        None => hostname::get().ok().map(|h| h.to_string_lossy().into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = StationConfig::default();
        assert!(config.sync.sync_on_start);
        assert!(config.sync.fallback_to_buffer);
        assert_eq!(config.remote.request_timeout_ms, 20_000);
        assert_eq!(config.probe.interval_secs, 5);
        assert!(config.queue.path.ends_with("offline.db"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STATION_NO", "ST-07"),
            ("FACTORY_CODE", "F1"),
            ("EPC_REMOTE_URL", "http://gateway:9000"),
        ]
        .into_iter()
        .collect();

        let mut config = StationConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.station.station_no, "ST-07");
        assert_eq!(config.station.factory_code, "F1");
        assert_eq!(config.station.station_no_cus, "");
        assert_eq!(config.remote.base_url, "http://gateway:9000");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: StationConfig = toml::from_str(
            r#"
            [station]
            station_no = "ST-01"

            [sync]
            interval_secs = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.station.station_no, "ST-01");
        assert_eq!(config.sync.interval_secs, 10);
        assert_eq!(config.sync.max_consecutive_connectivity_errors, 3);
        assert_eq!(config.remote.procedure, "SP_UpsertEpcRecord");
    }

    #[test]
    fn test_validate_requires_station() {
        let mut config = StationConfig::default();
        assert!(config.validate().is_err());

        config.station.station_no = "ST-01".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("station.toml");

        let mut config = StationConfig::default();
        config.station.station_no = "ST-42".into();
        config.save(Some(&path)).unwrap();

        let loaded: StationConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.station.station_no, "ST-42");
    }

    #[test]
    fn test_identity_uses_override() {
        let mut config = StationConfig::default();
        config.station.station_no = "ST-01".into();
        config.station.origin_address = Some("10.0.0.5".into());

        let identity = config.identity();
        assert_eq!(identity.address, "10.0.0.5");
        assert_eq!(identity.station_no, "ST-01");
    }
}
