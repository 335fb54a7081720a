//! Configuration loading and validation.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result, ValidationError};

/// Port used for bootstrap servers configured without one.
pub const DEFAULT_BOOTSTRAP_PORT: u16 = 53;

/// Main configuration for the dohrelay resolution core.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Plain-DNS servers used to resolve upstream hostnames.
    /// Empty means the system resolver is used instead.
    #[serde(default, deserialize_with = "deserialize_bootstrap_servers")]
    pub bootstrap_servers: Vec<SocketAddr>,

    /// Lifetime of a bootstrapped address in seconds.
    #[serde(default = "default_bootstrap_cache_ttl")]
    pub bootstrap_cache_ttl_seconds: u64,

    /// Hard ceiling for one race across all upstreams, in milliseconds.
    #[serde(default = "default_race_timeout")]
    pub race_timeout_ms: u64,

    /// Encrypted upstream resolvers.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Configuration of one DNS-over-HTTPS upstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Label used in logs and query records. Defaults to the address.
    #[serde(default)]
    pub name: Option<String>,

    /// Upstream URL or bare host, e.g. "dns.google" or "https://1.1.1.1/dns-query".
    pub address: String,

    /// Use HTTP/3 over QUIC instead of HTTP/1.1 or HTTP/2 over TLS.
    #[serde(default)]
    pub enable_h3: bool,

    /// Skip certificate verification. Never enabled unless set explicitly.
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Client address advertised through EDNS Client Subnet.
    #[serde(default)]
    pub ecs_ip: Option<IpAddr>,
}

impl UpstreamConfig {
    /// Create a plain HTTPS upstream for the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
            enable_h3: false,
            insecure_skip_verify: false,
            ecs_ip: None,
        }
    }

    /// Name used to identify this upstream.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

const fn default_bootstrap_cache_ttl() -> u64 {
    300
}

const fn default_race_timeout() -> u64 {
    5000
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9000))
}

/// Normalize a bootstrap server into a socket address, defaulting to port 53.
///
/// The server is used literally as a destination, so only IP literals are
/// accepted: resolving it would reintroduce the dependency it exists to break.
pub fn parse_bootstrap_server(server: &str) -> std::result::Result<SocketAddr, ConfigError> {
    let server = server.trim();
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let bare = server
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(server);
    bare.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_BOOTSTRAP_PORT))
        .map_err(|_| ConfigError::InvalidBootstrapServer(server.to_string()))
}

fn deserialize_bootstrap_servers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let servers = Vec::<String>::deserialize(deserializer)?;
    servers
        .iter()
        .map(|s| parse_bootstrap_server(s).map_err(serde::de::Error::custom))
        .collect()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn bootstrap_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.bootstrap_cache_ttl_seconds)
    }

    pub fn race_timeout(&self) -> Duration {
        Duration::from_millis(self.race_timeout_ms)
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.bootstrap_cache_ttl_seconds == 0 {
            return Err(ValidationError::ZeroBootstrapCacheTtl);
        }

        if self.race_timeout_ms == 0 {
            return Err(ValidationError::ZeroRaceTimeout);
        }

        if self.upstreams.is_empty() {
            return Err(ValidationError::NoUpstreams);
        }

        let mut names = HashSet::new();
        for (index, upstream) in self.upstreams.iter().enumerate() {
            if upstream.address.trim().is_empty() {
                return Err(ValidationError::EmptyUpstreamAddress { index });
            }
            if let Some(name) = &upstream.name
                && !names.insert(name.as_str())
            {
                return Err(ValidationError::DuplicateUpstreamName { name: name.clone() });
            }
        }

        Ok(())
    }
}
