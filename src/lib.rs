//! dohrelay - the resolution core of a racing DNS-over-HTTPS forwarder.
//!
//! A query is sent to several encrypted upstreams at once and the first
//! usable answer wins. Upstream hostnames are resolved through dedicated
//! plain-DNS bootstrap servers so that the forwarder never depends on the
//! host resolver, which may well be the forwarder itself.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`config`]: Configuration loading and validation
//! - [`dns`]: Bootstrap resolution, EDNS Client Subnet and the resolver trait
//! - [`cache`]: Bootstrap address cache with TTL support
//! - [`upstream`]: DoH clients over HTTP/2 and HTTP/3
//! - [`race`]: Concurrent resolution across upstreams
//! - [`record`]: Per-query summaries for a query log
//! - [`metrics`]: Prometheus exporter setup
//! - [`error`]: Error types
//!
//! # Testing
//!
//! The race only depends on the [`DnsResolver`] trait, so it can be tested
//! with mock upstreams and no network access:
//!
//! ```rust
//! use dohrelay::race::RaceOrchestrator;
//! use std::time::Duration;
//!
//! let orchestrator = RaceOrchestrator::new(Duration::from_secs(2));
//! assert_eq!(orchestrator.timeout(), Duration::from_secs(2));
//! ```

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod race;
pub mod record;
pub mod upstream;

pub use config::Config;
pub use dns::{Bootstrapper, DnsResolver};
pub use error::{Error, Result};
pub use race::{RaceOrchestrator, RaceOutcome, race_resolve};
pub use record::QueryRecord;
pub use upstream::UpstreamClient;
