//! Host address cache trait and implementations.
//!
//! Bootstrapped addresses are kept for a fixed lifetime. Expiry is checked
//! when an entry is read: a stale entry is dropped in place and reported as
//! a miss.

use std::future::Future;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use moka::future::Cache;

/// Default lifetime of a bootstrapped address.
pub const DEFAULT_HOST_TTL: Duration = Duration::from_secs(300);

/// Upper bound on cached hostnames. There is one per distinct upstream host,
/// so this is never reached in practice.
const MAX_HOSTS: u64 = 4096;

/// Trait for caching resolved upstream hostnames.
///
/// Implementations must be safe for concurrent use without serializing
/// lookups of unrelated hostnames behind a single lock.
pub trait HostCache: Send + Sync + Clone + 'static {
    /// Get the live address for a hostname, evicting it if it has expired.
    fn get(&self, host: &str) -> impl Future<Output = Option<IpAddr>> + Send;

    /// Store (or replace) the address for a hostname.
    fn insert(&self, host: String, ip: IpAddr) -> impl Future<Output = ()> + Send;

    /// Returns the number of entries in the cache.
    fn entry_count(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
struct HostEntry {
    ip: IpAddr,
    expires_at: Instant,
}

/// Production cache implementation using Moka.
///
/// Moka locks at the entry level, so concurrent dials of different upstream
/// hosts never contend with each other.
#[derive(Clone)]
pub struct MokaHostCache {
    inner: Cache<String, HostEntry>,
    ttl: Duration,
}

impl MokaHostCache {
    /// Create a new cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        let inner = Cache::builder().max_capacity(MAX_HOSTS).build();

        Self { inner, ttl }
    }

    /// How long an inserted address is served.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Default for MokaHostCache {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_TTL)
    }
}

impl HostCache for MokaHostCache {
    async fn get(&self, host: &str) -> Option<IpAddr> {
        let entry = self.inner.get(host).await?;
        if Instant::now() < entry.expires_at {
            return Some(entry.ip);
        }

        tracing::debug!(host, "bootstrap cache entry expired");
        self.inner.invalidate(host).await;
        None
    }

    async fn insert(&self, host: String, ip: IpAddr) {
        let entry = HostEntry {
            ip,
            expires_at: Instant::now() + self.ttl,
        };
        self.inner.insert(host, entry).await;
    }

    fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}
