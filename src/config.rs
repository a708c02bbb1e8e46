//! Configuration loading and types.
//!
//! The library only needs [`ClusterConfig`]; the `gossip-node` binary reads a
//! YAML file into [`Config`], which adds logging and HTTP sections. Durations
//! are expressed in milliseconds so the file stays flat and readable.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{ClusterError, Result};

pub const DEFAULT_PUSH_PULL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1400;

/// Smallest UDP budget that still fits a probe plus one small broadcast.
pub const MIN_PACKET_SIZE: usize = 512;

/// Top-level configuration of the `gossip-node` binary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Gossip peer settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Status / metrics HTTP listener.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Settings consumed by [`PeerBuilder`](crate::membership::peer::PeerBuilder).
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// `host:port` the transport listens on (UDP and TCP).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// `host:port` announced to peers. Derived from the bind address if unset.
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Initial `host:port` endpoints, resolved at startup and on every refresh.
    #[serde(default)]
    pub known_peers: Vec<String>,

    /// Block startup until at least one known peer resolves.
    #[serde(default)]
    pub wait_if_empty: bool,

    #[serde(default = "default_push_pull_interval_ms")]
    pub push_pull_interval_ms: u64,

    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_tcp_timeout_ms")]
    pub tcp_timeout_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Cadence of the reconnect loop. Zero disables it.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Age after which failed peers are forgotten. Zero disables reaping.
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,

    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// UDP gossip budget in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            advertise_address: None,
            known_peers: Vec::new(),
            wait_if_empty: false,
            push_pull_interval_ms: default_push_pull_interval_ms(),
            gossip_interval_ms: default_gossip_interval_ms(),
            tcp_timeout_ms: default_tcp_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl ClusterConfig {
    pub fn push_pull_interval(&self) -> Duration {
        Duration::from_millis(self.push_pull_interval_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("push_pull_interval_ms", self.push_pull_interval_ms),
            ("gossip_interval_ms", self.gossip_interval_ms),
            ("probe_interval_ms", self.probe_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("tcp_timeout_ms", self.tcp_timeout_ms),
            ("refresh_interval_ms", self.refresh_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ClusterError::Config(format!("{name} must be positive")));
            }
        }
        if self.max_packet_size < MIN_PACKET_SIZE {
            return Err(ClusterError::Config(format!(
                "max_packet_size must be at least {MIN_PACKET_SIZE} bytes, got {}",
                self.max_packet_size
            )));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// HTTP status endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address of the status / metrics server. Empty disables it.
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:9094".to_string()
}

fn default_push_pull_interval_ms() -> u64 {
    DEFAULT_PUSH_PULL_INTERVAL.as_millis() as u64
}

fn default_gossip_interval_ms() -> u64 {
    DEFAULT_GOSSIP_INTERVAL.as_millis() as u64
}

fn default_tcp_timeout_ms() -> u64 {
    DEFAULT_TCP_TIMEOUT.as_millis() as u64
}

fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT.as_millis() as u64
}

fn default_probe_interval_ms() -> u64 {
    DEFAULT_PROBE_INTERVAL.as_millis() as u64
}

fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL.as_millis() as u64
}

fn default_reconnect_timeout_ms() -> u64 {
    DEFAULT_RECONNECT_TIMEOUT.as_millis() as u64
}

fn default_refresh_interval_ms() -> u64 {
    DEFAULT_REFRESH_INTERVAL.as_millis() as u64
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_http_bind() -> String {
    "127.0.0.1:9095".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.cluster.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ClusterConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:9094");
        assert_eq!(config.push_pull_interval(), Duration::from_secs(60));
        assert_eq!(config.gossip_interval(), Duration::from_millis(200));
        assert_eq!(config.refresh_interval(), Duration::from_secs(15));
        assert_eq!(config.reconnect_timeout(), Duration::from_secs(21_600));
        assert_eq!(config.max_packet_size, 1400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
cluster:
  bind_address: "127.0.0.1:7001"
  known_peers: ["127.0.0.1:7002", "node-b.internal:7001"]
  reconnect_interval_ms: 0
logging:
  format: json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cluster.bind_address, "127.0.0.1:7001");
        assert_eq!(config.cluster.known_peers.len(), 2);
        assert!(config.cluster.reconnect_interval().is_zero());
        assert_eq!(config.cluster.probe_interval(), Duration::from_secs(1));
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.http.bind, "127.0.0.1:9095");
    }

    #[test]
    fn test_validate_rejects_small_packets() {
        let config = ClusterConfig {
            max_packet_size: 100,
            ..ClusterConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("max_packet_size"));
    }

    #[test]
    fn test_validate_rejects_zero_probe_interval() {
        let config = ClusterConfig {
            probe_interval_ms: 0,
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
