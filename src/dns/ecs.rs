//! EDNS Client Subnet annotation of outgoing queries.

use std::net::IpAddr;

use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};

/// Source prefix advertised for IPv4 client addresses.
pub const IPV4_SOURCE_PREFIX: u8 = 24;

/// Source prefix advertised for IPv6 client addresses.
pub const IPV6_SOURCE_PREFIX: u8 = 56;

/// UDP payload size announced when an EDNS section has to be created.
const EDNS_MAX_PAYLOAD: u16 = 4096;

/// Add a Client Subnet option for `ip` unless the query already carries one.
///
/// Returns `true` when the query was modified. An existing option is left
/// untouched, so repeated calls are idempotent.
pub fn ensure_client_subnet(query: &mut Message, ip: IpAddr) -> bool {
    if has_client_subnet(query) {
        return false;
    }

    let source_prefix = match ip {
        IpAddr::V4(_) => IPV4_SOURCE_PREFIX,
        IpAddr::V6(_) => IPV6_SOURCE_PREFIX,
    };

    query
        .extensions_mut()
        .get_or_insert_with(|| {
            let mut edns = Edns::new();
            edns.set_max_payload(EDNS_MAX_PAYLOAD);
            edns
        })
        .options_mut()
        .insert(EdnsOption::Subnet(ClientSubnet::new(ip, source_prefix, 0)));
    true
}

/// Whether the query carries an EDNS Client Subnet option.
pub fn has_client_subnet(query: &Message) -> bool {
    query
        .extensions()
        .as_ref()
        .is_some_and(|edns| edns.option(EdnsCode::Subnet).is_some())
}
