//! DNS resolver trait.
//!
//! One implementation performs one query/answer exchange with one upstream.
//! The race orchestrator only depends on this trait, so it works the same
//! over HTTP/2, HTTP/3 or a test double.

use std::future::Future;

use hickory_proto::op::Message;

use crate::error::Result;

/// Trait for DNS resolution against a single upstream.
///
/// Implementations can resolve DNS queries through various mechanisms:
/// - DNS-over-HTTPS over HTTP/1.1 or HTTP/2
/// - DNS-over-HTTPS over HTTP/3
/// - Mock responses for testing
///
/// A decoded answer with a non-success response code is still `Ok`; only
/// failures to obtain a DNS message at all are errors.
pub trait DnsResolver: Send + Sync + Clone + 'static {
    /// Resolve a DNS query and return the response.
    fn resolve(&self, query: &Message) -> impl Future<Output = Result<Message>> + Send;
}
