//! Encrypted upstream clients.
//!
//! Each configured upstream becomes one [`UpstreamClient`], speaking
//! DNS-over-HTTPS either over HTTP/1.1 and HTTP/2 ([`DohClient`]) or over
//! HTTP/3 ([`H3Client`]). Both resolve the upstream host through the shared
//! [`Bootstrapper`] instead of the system resolver.

pub mod http3;
pub mod https;
mod tls;

use std::net::IpAddr;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

use crate::config::UpstreamConfig;
use crate::dns::{Bootstrapper, DnsResolver, ensure_client_subnet};
use crate::error::{Result, TransportError};

pub use self::http3::H3Client;
pub use self::https::DohClient;

/// Media type of wire-format DNS messages.
pub const DNS_MESSAGE: &str = "application/dns-message";

/// Path used when the configured address has none.
pub const DEFAULT_PATH: &str = "/dns-query";

/// One configured encrypted upstream.
#[derive(Clone, Debug)]
pub enum UpstreamClient {
    Https(DohClient),
    H3(H3Client),
}

impl UpstreamClient {
    /// Build the client matching `config.enable_h3`.
    pub fn new(config: &UpstreamConfig, bootstrapper: Bootstrapper) -> Result<Self> {
        let client = if config.enable_h3 {
            Self::H3(H3Client::new(config, bootstrapper)?)
        } else {
            Self::Https(DohClient::new(config, bootstrapper)?)
        };
        tracing::debug!(upstream = %config.label(), url = client.url(), "upstream client ready");
        Ok(client)
    }

    /// Build one client per configured upstream, all sharing `bootstrapper`.
    pub fn from_configs(configs: &[UpstreamConfig], bootstrapper: &Bootstrapper) -> Result<Vec<Self>> {
        configs
            .iter()
            .map(|config| Self::new(config, bootstrapper.clone()))
            .collect()
    }

    /// The normalized endpoint URL.
    pub fn url(&self) -> &str {
        match self {
            Self::Https(client) => client.url(),
            Self::H3(client) => client.url(),
        }
    }
}

impl DnsResolver for UpstreamClient {
    async fn resolve(&self, query: &Message) -> Result<Message> {
        match self {
            Self::Https(client) => client.resolve(query).await,
            Self::H3(client) => client.resolve(query).await,
        }
    }
}

/// Turn a configured address into a full DoH endpoint URL.
///
/// `https://` is assumed when no scheme is given and `/dns-query` is used
/// when the address has no path.
pub fn normalize_url(address: &str) -> String {
    let url = if address.starts_with("https://") || address.starts_with("http://") {
        address.to_string()
    } else {
        format!("https://{address}")
    };

    match reqwest::Url::parse(&url) {
        Ok(mut parsed) => {
            if parsed.path().is_empty() || parsed.path() == "/" {
                parsed.set_path(DEFAULT_PATH);
            }
            parsed.to_string()
        }
        Err(_) => {
            let authority = url
                .strip_prefix("https://")
                .or_else(|| url.strip_prefix("http://"))
                .unwrap_or(&url);
            if authority.contains('/') {
                url
            } else {
                format!("{url}{DEFAULT_PATH}")
            }
        }
    }
}

/// Serialize `query` for the wire, adding a Client Subnet option for
/// `ecs_ip` when one is configured and the query has none.
pub(crate) fn encode_query(query: &Message, ecs_ip: Option<IpAddr>) -> std::result::Result<Vec<u8>, TransportError> {
    let wire = match ecs_ip {
        Some(ip) => {
            let mut query = query.clone();
            ensure_client_subnet(&mut query, ip);
            query.to_vec()
        }
        None => query.to_vec(),
    };
    wire.map_err(TransportError::Encode)
}

pub(crate) fn decode_answer(url: &str, body: &[u8]) -> std::result::Result<Message, TransportError> {
    Message::from_vec(body).map_err(|source| TransportError::Decode {
        url: url.to_string(),
        source,
    })
}
