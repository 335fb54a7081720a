//! DNS-over-HTTPS over HTTP/1.1 and HTTP/2.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use super::{DNS_MESSAGE, decode_answer, encode_query, normalize_url};
use crate::config::UpstreamConfig;
use crate::dns::{Bootstrapper, DnsResolver};
use crate::error::{Result, TransportError};

/// Overall limit for one query, from sending the request to reading the body.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// DoH client posting wire-format queries to one upstream.
///
/// The underlying connection pool is shared by clones.
#[derive(Clone, Debug)]
pub struct DohClient {
    http: reqwest::Client,
    url: Arc<str>,
    ecs_ip: Option<IpAddr>,
}

impl DohClient {
    /// Create a client for `config`, dialing through `bootstrapper`.
    pub fn new(config: &UpstreamConfig, bootstrapper: Bootstrapper) -> Result<Self> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .dns_resolver(Arc::new(bootstrapper))
            .build()
            .map_err(TransportError::ClientBuild)?;

        if config.insecure_skip_verify {
            tracing::warn!(upstream = %config.label(), "certificate verification disabled");
        }

        Ok(Self {
            http,
            url: normalize_url(&config.address).into(),
            ecs_ip: config.ecs_ip,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn exchange(&self, body: Vec<u8>) -> std::result::Result<Message, TransportError> {
        let response = self
            .http
            .post(&*self.url)
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(body)
            .send()
            .await
            .map_err(|source| self.request_error(source))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus {
                url: self.url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|source| {
            if source.is_timeout() {
                TransportError::Timeout {
                    url: self.url.to_string(),
                }
            } else {
                TransportError::Body {
                    url: self.url.to_string(),
                    source,
                }
            }
        })?;

        decode_answer(&self.url, &bytes)
    }

    fn request_error(&self, source: reqwest::Error) -> TransportError {
        if source.is_timeout() {
            TransportError::Timeout {
                url: self.url.to_string(),
            }
        } else {
            TransportError::Network {
                url: self.url.to_string(),
                source,
            }
        }
    }
}

impl DnsResolver for DohClient {
    async fn resolve(&self, query: &Message) -> Result<Message> {
        let body = encode_query(query, self.ecs_ip)?;
        let answer = self.exchange(body).await.inspect_err(|err| {
            tracing::debug!(url = %self.url, error = %err, "DoH exchange failed");
        })?;
        tracing::trace!(url = %self.url, code = %answer.response_code(), "DoH answer");
        Ok(answer)
    }
}
