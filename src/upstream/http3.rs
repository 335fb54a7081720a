//! DNS-over-HTTPS over HTTP/3.
//!
//! Each client keeps one QUIC connection with an HTTP/3 session on top of it.
//! Requests share that session; a new connection is dialed only when none
//! exists yet or the previous one was closed.

use std::fmt;
use std::future::poll_fn;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use hickory_proto::op::Message;
use http::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::Mutex;

use super::tls::quic_client_config;
use super::{DNS_MESSAGE, decode_answer, encode_query, normalize_url};
use crate::config::UpstreamConfig;
use crate::dns::{Bootstrapper, DnsResolver};
use crate::error::{Result, TransportError};

/// Overall limit for one query, including a dial when one is needed.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_HTTPS_PORT: u16 = 443;

type RequestSender = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

struct PooledConnection {
    connection: quinn::Connection,
    sender: RequestSender,
    _endpoint: quinn::Endpoint,
}

impl PooledConnection {
    fn is_open(&self) -> bool {
        self.connection.close_reason().is_none()
    }
}

struct Inner {
    url: String,
    uri: http::Uri,
    host: String,
    port: u16,
    ecs_ip: Option<IpAddr>,
    bootstrapper: Bootstrapper,
    client_config: quinn::ClientConfig,
    pooled: Mutex<Option<PooledConnection>>,
}

/// HTTP/3 DoH client for one upstream.
///
/// Clones share the pooled connection.
#[derive(Clone)]
pub struct H3Client {
    inner: Arc<Inner>,
}

impl fmt::Debug for H3Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H3Client")
            .field("url", &self.inner.url)
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .finish_non_exhaustive()
    }
}

impl H3Client {
    /// Create a client for `config`. No connection is made until the first query.
    pub fn new(config: &UpstreamConfig, bootstrapper: Bootstrapper) -> Result<Self> {
        let url = normalize_url(&config.address);
        let uri: http::Uri = url.parse().map_err(|e: http::uri::InvalidUri| {
            TransportError::InvalidUrl {
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;
        let host = uri
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidUrl {
                url: url.clone(),
                reason: "missing host".to_string(),
            })?;
        let port = uri.port_u16().unwrap_or(DEFAULT_HTTPS_PORT);
        let client_config = quic_client_config(config.insecure_skip_verify)?;

        if config.insecure_skip_verify {
            tracing::warn!(upstream = %config.label(), "certificate verification disabled");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                uri,
                host,
                port,
                ecs_ip: config.ecs_ip,
                bootstrapper,
                client_config,
                pooled: Mutex::new(None),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    async fn sender(&self) -> std::result::Result<RequestSender, TransportError> {
        let mut pooled = self.inner.pooled.lock().await;
        if let Some(conn) = pooled.as_ref()
            && conn.is_open()
        {
            return Ok(conn.sender.clone());
        }

        let fresh = self.dial().await?;
        let sender = fresh.sender.clone();
        *pooled = Some(fresh);
        Ok(sender)
    }

    async fn dial(&self) -> std::result::Result<PooledConnection, TransportError> {
        let host = &self.inner.host;
        let ip = self
            .inner
            .bootstrapper
            .lookup_ip(host)
            .await
            .map_err(|source| TransportError::Dial {
                host: host.clone(),
                source,
            })?;
        let addr = SocketAddr::new(ip, self.inner.port);
        let quic_error = |source: Box<dyn std::error::Error + Send + Sync>| TransportError::Quic {
            addr,
            source,
        };

        let bind: SocketAddr = match ip {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let endpoint = quinn::Endpoint::client(bind).map_err(|e| quic_error(Box::new(e)))?;
        let connection = endpoint
            .connect_with(self.inner.client_config.clone(), addr, host)
            .map_err(|e| quic_error(Box::new(e)))?
            .await
            .map_err(|e| quic_error(Box::new(e)))?;

        let (mut driver, sender) = h3::client::new(h3_quinn::Connection::new(connection.clone()))
            .await
            .map_err(|e| self.h3_error(e))?;
        let url = self.inner.url.clone();
        tokio::spawn(async move {
            if let Err(err) = poll_fn(|cx| driver.poll_close(cx)).await {
                tracing::debug!(%url, error = %err, "HTTP/3 connection closed");
            }
        });

        tracing::debug!(url = %self.inner.url, %addr, "HTTP/3 connection established");
        Ok(PooledConnection {
            connection,
            sender,
            _endpoint: endpoint,
        })
    }

    async fn exchange(&self, body: Vec<u8>) -> std::result::Result<Message, TransportError> {
        let mut sender = self.sender().await?;

        let request = http::Request::post(self.inner.uri.clone())
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(())
            .map_err(|e| self.h3_error(e))?;

        let mut stream = sender
            .send_request(request)
            .await
            .map_err(|e| self.h3_error(e))?;
        stream
            .send_data(Bytes::from(body))
            .await
            .map_err(|e| self.h3_error(e))?;
        stream.finish().await.map_err(|e| self.h3_error(e))?;

        let response = stream
            .recv_response()
            .await
            .map_err(|e| self.h3_error(e))?;

        let mut payload = BytesMut::new();
        while let Some(chunk) = stream.recv_data().await.map_err(|e| self.h3_error(e))? {
            payload.put(chunk);
        }

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                url: self.inner.url.clone(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&payload).into_owned(),
            });
        }

        decode_answer(&self.inner.url, &payload)
    }

    fn h3_error(&self, err: impl fmt::Display) -> TransportError {
        TransportError::H3 {
            url: self.inner.url.clone(),
            message: err.to_string(),
        }
    }
}

impl DnsResolver for H3Client {
    async fn resolve(&self, query: &Message) -> Result<Message> {
        let body = encode_query(query, self.inner.ecs_ip)?;
        let answer = tokio::time::timeout(REQUEST_TIMEOUT, self.exchange(body))
            .await
            .map_err(|_| TransportError::Timeout {
                url: self.inner.url.clone(),
            })?
            .inspect_err(|err| {
                tracing::debug!(url = %self.inner.url, error = %err, "HTTP/3 exchange failed");
            })?;
        tracing::trace!(url = %self.inner.url, code = %answer.response_code(), "HTTP/3 answer");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::resolver::tests::{create_query, create_response};
    use crate::error::{BootstrapError, Error};
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record, RecordType};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket;

    /// Plain DNS server for the bootstrap path.
    ///
    /// Answers A queries with `ip` when given, otherwise replies with `code`
    /// and no records.
    struct FakeBootstrap {
        addr: SocketAddr,
        requests: Arc<AtomicUsize>,
    }

    impl FakeBootstrap {
        async fn start(code: ResponseCode, ip: Option<Ipv4Addr>) -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = socket.local_addr().unwrap();
            let requests = Arc::new(AtomicUsize::new(0));

            let counter = Arc::clone(&requests);
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let query = Message::from_vec(&buf[..len]).unwrap();
                    let mut reply = create_response(&query, code);
                    if let Some(ip) = ip {
                        for q in query.queries() {
                            if q.query_type() == RecordType::A {
                                reply.add_answer(Record::from_rdata(
                                    q.name().clone(),
                                    60,
                                    RData::A(A(ip)),
                                ));
                            }
                        }
                    }
                    let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
                }
            });

            Self { addr, requests }
        }

        fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    /// How the [`FakeH3Upstream`] answers each request.
    #[derive(Clone, Copy)]
    enum Reply {
        /// 200 with a NOERROR answer echoing the query's ID and question.
        Mirror,
        /// This status with a plain text body.
        Status(u16),
    }

    /// HTTP/3 DoH server on 127.0.0.1 with a self-signed certificate.
    struct FakeH3Upstream {
        addr: SocketAddr,
        connections: Arc<AtomicUsize>,
        requests: Arc<std::sync::Mutex<Vec<http::Request<()>>>>,
        _endpoint: quinn::Endpoint,
    }

    impl FakeH3Upstream {
        fn server_config() -> quinn::ServerConfig {
            let rcgen::CertifiedKey { cert, signing_key } =
                rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

            let mut tls = rustls::ServerConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)
            .unwrap();
            tls.alpn_protocols = vec![b"h3".to_vec()];

            let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls).unwrap();
            quinn::ServerConfig::with_crypto(Arc::new(crypto))
        }

        async fn start(reply: Reply) -> Self {
            let endpoint =
                quinn::Endpoint::server(Self::server_config(), "127.0.0.1:0".parse().unwrap())
                    .unwrap();
            let addr = endpoint.local_addr().unwrap();
            let connections = Arc::new(AtomicUsize::new(0));
            let requests = Arc::new(std::sync::Mutex::new(Vec::new()));

            let accepting = endpoint.clone();
            let accepted = Arc::clone(&connections);
            let seen = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Some(incoming) = accepting.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let seen = Arc::clone(&seen);
                    tokio::spawn(async move {
                        let Ok(connection) = incoming.await else {
                            return;
                        };
                        let Ok(mut session) = h3::server::Connection::<_, Bytes>::new(
                            h3_quinn::Connection::new(connection),
                        )
                        .await
                        else {
                            return;
                        };
                        while let Ok(Some((request, mut stream))) = session.accept().await {
                            seen.lock().unwrap().push(request);

                            let mut body = BytesMut::new();
                            while let Ok(Some(chunk)) = stream.recv_data().await {
                                body.put(chunk);
                            }

                            let (status, payload) = match reply {
                                Reply::Mirror => {
                                    let query = Message::from_vec(&body).unwrap();
                                    let answer = create_response(&query, ResponseCode::NoError);
                                    (200, answer.to_vec().unwrap())
                                }
                                Reply::Status(code) => (code, b"upstream unavailable".to_vec()),
                            };
                            let response = http::Response::builder()
                                .status(status)
                                .header(CONTENT_TYPE, DNS_MESSAGE)
                                .body(())
                                .unwrap();
                            let _ = stream.send_response(response).await;
                            let _ = stream.send_data(Bytes::from(payload)).await;
                            let _ = stream.finish().await;
                        }
                    });
                }
            });

            Self {
                addr,
                connections,
                requests,
                _endpoint: endpoint,
            }
        }

        fn connection_count(&self) -> usize {
            self.connections.load(Ordering::SeqCst)
        }
    }

    /// Client for `upstream` dialed as `doh.test`, bootstrapped through `bootstrap`.
    fn client_for(upstream: &FakeH3Upstream, bootstrap: &FakeBootstrap) -> H3Client {
        let mut config = UpstreamConfig::new(format!(
            "https://doh.test:{}/dns-query",
            upstream.addr.port()
        ));
        config.enable_h3 = true;
        config.insecure_skip_verify = true;
        H3Client::new(&config, Bootstrapper::new(vec![bootstrap.addr])).unwrap()
    }

    #[test]
    fn should_split_host_and_port() {
        let config = UpstreamConfig::new("https://[2001:db8::1]:8443/dns-query");
        let client = H3Client::new(&config, Bootstrapper::new(Vec::new())).unwrap();

        assert_eq!(client.inner.host, "2001:db8::1");
        assert_eq!(client.inner.port, 8443);
        assert_eq!(client.url(), "https://[2001:db8::1]:8443/dns-query");
    }

    #[test]
    fn should_default_to_https_port() {
        let config = UpstreamConfig::new("dns.example.net");
        let client = H3Client::new(&config, Bootstrapper::new(Vec::new())).unwrap();

        assert_eq!(client.inner.host, "dns.example.net");
        assert_eq!(client.inner.port, DEFAULT_HTTPS_PORT);
    }

    #[test]
    fn should_reject_unparseable_url() {
        let config = UpstreamConfig::new("https://bad host");

        let result = H3Client::new(&config, Bootstrapper::new(Vec::new()));

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::InvalidUrl { .. }))
        ));
    }

    #[tokio::test]
    async fn should_report_bootstrap_failure_as_dial_error() {
        let bootstrap = FakeBootstrap::start(ResponseCode::Refused, None).await;
        let config = UpstreamConfig::new("https://doh.invalid/dns-query");
        let client = H3Client::new(&config, Bootstrapper::new(vec![bootstrap.addr])).unwrap();

        let result = client.resolve(&create_query("example.com")).await;

        match result {
            Err(Error::Transport(TransportError::Dial { host, source })) => {
                assert_eq!(host, "doh.invalid");
                assert!(matches!(source, BootstrapError::Exhausted { .. }));
            }
            other => panic!("expected dial error, got {other:?}"),
        }
        assert!(client.inner.pooled.lock().await.is_none());
    }

    #[tokio::test]
    async fn should_round_trip_query_over_http3() {
        let bootstrap = FakeBootstrap::start(ResponseCode::NoError, Some(Ipv4Addr::LOCALHOST)).await;
        let upstream = FakeH3Upstream::start(Reply::Mirror).await;
        let client = client_for(&upstream, &bootstrap);
        let mut query = create_query("example.com");
        query.set_id(4321);

        let answer = client.resolve(&query).await.unwrap();

        assert_eq!(answer.id(), 4321);
        assert_eq!(answer.queries(), query.queries());
        assert_eq!(answer.response_code(), ResponseCode::NoError);

        let requests = upstream.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method(), http::Method::POST);
        assert_eq!(requests[0].uri().path(), "/dns-query");
        assert_eq!(requests[0].headers()[CONTENT_TYPE], DNS_MESSAGE);
        assert_eq!(requests[0].headers()[ACCEPT], DNS_MESSAGE);
    }

    #[tokio::test]
    async fn should_map_error_status_to_http_status() {
        let bootstrap = FakeBootstrap::start(ResponseCode::NoError, Some(Ipv4Addr::LOCALHOST)).await;
        let upstream = FakeH3Upstream::start(Reply::Status(503)).await;
        let client = client_for(&upstream, &bootstrap);

        let result = client.resolve(&create_query("example.com")).await;

        match result {
            Err(Error::Transport(TransportError::HttpStatus { url, status, body })) => {
                assert_eq!(url, client.url());
                assert_eq!(status, 503);
                assert_eq!(body, "upstream unavailable");
            }
            other => panic!("expected HTTP status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn should_reuse_pooled_connection() {
        let bootstrap = FakeBootstrap::start(ResponseCode::NoError, Some(Ipv4Addr::LOCALHOST)).await;
        let upstream = FakeH3Upstream::start(Reply::Mirror).await;
        let client = client_for(&upstream, &bootstrap);

        client.resolve(&create_query("one.example")).await.unwrap();
        client.resolve(&create_query("two.example")).await.unwrap();

        assert_eq!(bootstrap.request_count(), 1);
        assert_eq!(upstream.connection_count(), 1);
        assert_eq!(upstream.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn should_redial_after_connection_closed() {
        let bootstrap = FakeBootstrap::start(ResponseCode::NoError, Some(Ipv4Addr::LOCALHOST)).await;
        let upstream = FakeH3Upstream::start(Reply::Mirror).await;
        let client = client_for(&upstream, &bootstrap);

        client.resolve(&create_query("one.example")).await.unwrap();
        if let Some(pooled) = client.inner.pooled.lock().await.as_ref() {
            pooled.connection.close(0u32.into(), b"done");
        }
        let answer = client.resolve(&create_query("two.example")).await.unwrap();

        assert_eq!(answer.id(), 1234);
        assert_eq!(upstream.connection_count(), 2);
        // The second dial reuses the cached address.
        assert_eq!(bootstrap.request_count(), 1);
    }
}
