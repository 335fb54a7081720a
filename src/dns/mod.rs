//! DNS-related modules.

pub mod bootstrap;
pub mod ecs;
pub mod resolver;

pub use bootstrap::Bootstrapper;
pub use ecs::ensure_client_subnet;
pub use resolver::DnsResolver;
