//! Upstream hostname resolution that bypasses the system resolver.
//!
//! Encrypted upstreams are dialed by hostname, but the host's own DNS may be
//! pointed at this very proxy. The [`Bootstrapper`] breaks that loop: it asks
//! a fixed list of plain-DNS servers directly over UDP, rotating the starting
//! server between lookups, and caches what it learns.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;

use crate::cache::{HostCache, MokaHostCache};
use crate::error::BootstrapError;

/// Timeout of a single UDP exchange with a bootstrap server.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Overall deadline for one bootstrap server, covering the A and AAAA exchanges.
const SERVER_DEADLINE: Duration = Duration::from_secs(4);

/// Large enough for any non-EDNS UDP response.
const MAX_RESPONSE_SIZE: usize = 1232;

/// Resolves upstream hostnames through dedicated bootstrap servers.
///
/// Cloning is cheap: clones share the server list, the rotation counter and
/// the cache, so one instance can be handed to every upstream client.
#[derive(Clone)]
pub struct Bootstrapper<C = MokaHostCache>
where
    C: HostCache,
{
    servers: Arc<[SocketAddr]>,
    counter: Arc<AtomicUsize>,
    cache: C,
}

impl Bootstrapper<MokaHostCache> {
    /// Create a bootstrapper with the default five minute cache.
    ///
    /// An empty server list delegates resolution to the system resolver.
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self::with_cache(servers, MokaHostCache::default())
    }

    /// Create a bootstrapper whose cached addresses live for `ttl`.
    pub fn with_ttl(servers: Vec<SocketAddr>, ttl: Duration) -> Self {
        Self::with_cache(servers, MokaHostCache::new(ttl))
    }
}

impl<C: HostCache> Bootstrapper<C> {
    /// Create a bootstrapper backed by the given cache.
    pub fn with_cache(servers: Vec<SocketAddr>, cache: C) -> Self {
        Self {
            servers: servers.into(),
            counter: Arc::new(AtomicUsize::new(0)),
            cache,
        }
    }

    /// Configured bootstrap servers, in rotation order.
    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Resolve a hostname to one IP address.
    ///
    /// IP literals are returned unchanged and live cache entries are served
    /// without touching the network; neither path can fail.
    pub async fn lookup_ip(&self, host: &str) -> Result<IpAddr, BootstrapError> {
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = host.parse::<IpAddr>() {
            metrics::counter!("dohrelay_bootstrap_lookups_total", "source" => "literal")
                .increment(1);
            return Ok(ip);
        }

        if let Some(ip) = self.cache.get(host).await {
            tracing::debug!(host, %ip, "bootstrap cache hit");
            metrics::counter!("dohrelay_bootstrap_lookups_total", "source" => "cache")
                .increment(1);
            return Ok(ip);
        }

        metrics::counter!("dohrelay_bootstrap_lookups_total", "source" => "network").increment(1);
        let ip = self.lookup_with_failover(host).await.inspect_err(|err| {
            metrics::counter!("dohrelay_bootstrap_failures_total").increment(1);
            tracing::warn!(host, error = %err, "bootstrap resolution failed");
        })?;

        self.cache.insert(host.to_string(), ip).await;
        tracing::debug!(host, %ip, "bootstrapped upstream address");
        Ok(ip)
    }

    async fn lookup_with_failover(&self, host: &str) -> Result<IpAddr, BootstrapError> {
        if self.servers.is_empty() {
            return lookup_system(host).await;
        }

        let name = Name::from_ascii(host).map_err(|source| BootstrapError::InvalidHost {
            host: host.to_string(),
            source,
        })?;

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..self.servers.len() {
            let server = self.servers[(start + offset) % self.servers.len()];

            let attempt = tokio::time::timeout(SERVER_DEADLINE, lookup_via(server, &name, host));
            let err = match attempt.await {
                Ok(Ok(ip)) => return Ok(ip),
                Ok(Err(err)) => err,
                Err(_) => BootstrapError::Timeout {
                    server,
                    timeout: SERVER_DEADLINE,
                },
            };

            tracing::debug!(host, %server, error = %err, "bootstrap server failed");
            last_error = Some(err);
        }

        Err(BootstrapError::Exhausted {
            host: host.to_string(),
            source: Box::new(last_error.unwrap_or_else(|| BootstrapError::NoAddress {
                host: host.to_string(),
            })),
        })
    }
}

/// Resolve through the host's default resolver, taking the first address.
async fn lookup_system(host: &str) -> Result<IpAddr, BootstrapError> {
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|source| BootstrapError::System {
            host: host.to_string(),
            source,
        })?;

    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| BootstrapError::NoAddress {
            host: host.to_string(),
        })
}

/// Ask one bootstrap server for an IPv4 address, then IPv6 if there is none.
async fn lookup_via(server: SocketAddr, name: &Name, host: &str) -> Result<IpAddr, BootstrapError> {
    let ips = exchange(server, name, RecordType::A).await?;
    if let Some(ip) = ips.first() {
        return Ok(*ip);
    }

    let ips = exchange(server, name, RecordType::AAAA).await?;
    ips.first().copied().ok_or_else(|| BootstrapError::Empty {
        server,
        host: host.to_string(),
    })
}

/// Perform one UDP exchange and collect the addresses in the answer section.
async fn exchange(
    server: SocketAddr,
    name: &Name,
    record_type: RecordType,
) -> Result<Vec<IpAddr>, BootstrapError> {
    let io_err = |source| BootstrapError::Exchange { server, source };

    let mut query = Message::new();
    query
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name.clone(), record_type));
    let query_bytes = query
        .to_bytes()
        .map_err(|source| BootstrapError::Encode { server, source })?;

    let bind_addr: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind_addr).await.map_err(io_err)?;
    socket.connect(server).await.map_err(io_err)?;
    socket.send(&query_bytes).await.map_err(io_err)?;

    let response = tokio::time::timeout(ATTEMPT_TIMEOUT, recv_matching(&socket, server, &query))
        .await
        .map_err(|_| BootstrapError::Timeout {
            server,
            timeout: ATTEMPT_TIMEOUT,
        })??;

    if response.response_code() != ResponseCode::NoError {
        return Err(BootstrapError::Rcode {
            server,
            host: name.to_utf8(),
            code: response.response_code(),
        });
    }

    Ok(response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect())
}

/// Read datagrams until one answers `query`.
///
/// Undecodable datagrams and replies carrying another ID or question are
/// dropped, leaving the caller's timeout to end the wait.
async fn recv_matching(
    socket: &UdpSocket,
    server: SocketAddr,
    query: &Message,
) -> Result<Message, BootstrapError> {
    let mut buf = [0u8; MAX_RESPONSE_SIZE];

    loop {
        let len = socket
            .recv(&mut buf)
            .await
            .map_err(|source| BootstrapError::Exchange { server, source })?;

        let response = match Message::from_bytes(&buf[..len]) {
            Ok(response) => response,
            Err(error) => {
                tracing::trace!(%server, len, %error, "ignoring undecodable datagram");
                continue;
            }
        };

        if response.id() != query.id() || response.message_type() != MessageType::Response {
            tracing::trace!(%server, expected = query.id(), got = response.id(), "ignoring stray response");
            continue;
        }
        if response.queries() != query.queries() {
            tracing::trace!(%server, id = response.id(), "ignoring response to another question");
            continue;
        }

        return Ok(response);
    }
}

impl<C: HostCache> reqwest::dns::Resolve for Bootstrapper<C> {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let bootstrapper = self.clone();
        Box::pin(async move {
            let ip = bootstrapper.lookup_ip(name.as_str()).await?;
            // The connector substitutes the port from the request URL.
            let addrs: reqwest::dns::Addrs = Box::new(std::iter::once(SocketAddr::new(ip, 0)));
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}
