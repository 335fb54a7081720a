//! Error types for the dohrelay resolution core.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::op::ResponseCode;
use thiserror::Error;

/// Main error type for dohrelay operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no upstream clients to race")]
    NoUpstreams,

    #[error("race timed out after {0:?} without a usable answer")]
    RaceTimeout(Duration),

    #[error("resolution cancelled by caller")]
    Cancelled,

    #[error("all upstream queries failed: {0}")]
    AllUpstreamsFailed(#[source] Box<Error>),

    #[error("no response received from any upstream")]
    NoResponse,

    /// Failure reported by a [`DnsResolver`](crate::dns::DnsResolver)
    /// implemented outside this crate.
    #[error("resolver error: {0}")]
    Resolver(String),

    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("invalid bootstrap server {0:?}: expected an IP address with optional port")]
    InvalidBootstrapServer(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("bootstrap_cache_ttl_seconds must be greater than 0")]
    ZeroBootstrapCacheTtl,

    #[error("race_timeout_ms must be greater than 0")]
    ZeroRaceTimeout,

    #[error("at least one upstream must be configured")]
    NoUpstreams,

    #[error("upstream #{index} has an empty address")]
    EmptyUpstreamAddress { index: usize },

    #[error("duplicate upstream name: {name:?}")]
    DuplicateUpstreamName { name: String },
}

/// Failures while resolving an upstream hostname through the bootstrap path.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("system resolver failed for {host}: {source}")]
    System {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no address found for {host}")]
    NoAddress { host: String },

    #[error("invalid hostname {host:?}: {source}")]
    InvalidHost {
        host: String,
        #[source]
        source: hickory_proto::error::ProtoError,
    },

    #[error("bootstrap {server} failed: {source}")]
    Exchange {
        server: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to build query for bootstrap {server}: {source}")]
    Encode {
        server: SocketAddr,
        #[source]
        source: hickory_proto::error::ProtoError,
    },

    #[error("bootstrap {server} answered {code} for {host}")]
    Rcode {
        server: SocketAddr,
        host: String,
        code: ResponseCode,
    },

    #[error("no IP found for {host} via bootstrap {server}")]
    Empty { server: SocketAddr, host: String },

    #[error("bootstrap {server} timed out after {timeout:?}")]
    Timeout {
        server: SocketAddr,
        timeout: Duration,
    },

    #[error("all bootstrap servers failed for {host}: {source}")]
    Exhausted {
        host: String,
        #[source]
        source: Box<BootstrapError>,
    },
}

/// Failures of a single exchange with one encrypted upstream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("failed to encode DNS query: {0}")]
    Encode(#[source] hickory_proto::error::ProtoError),

    #[error("failed to decode DNS answer from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: hickory_proto::error::ProtoError,
    },

    #[error("invalid upstream URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("network error querying {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("timeout querying {url}")]
    Timeout { url: String },

    #[error("failed to read answer body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered HTTP {status}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("H3 bootstrap resolution failed for {host}: {source}")]
    Dial {
        host: String,
        #[source]
        source: BootstrapError,
    },

    #[error("QUIC connection to {addr} failed: {source}")]
    Quic {
        addr: SocketAddr,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("HTTP/3 exchange with {url} failed: {message}")]
    H3 { url: String, message: String },
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
