//! Caching of bootstrapped upstream addresses.

pub mod host_cache;

pub use host_cache::{HostCache, MokaHostCache};
