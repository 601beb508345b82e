//! Subnet carving
//!
//! The layout is part of the public contract: for a /16 network, public
//! subnet `i` is the /20 at third-octet offset `16*i` and private subnet `i`
//! is the /20 at `128 + 16*i`. Eight zones fill each half exactly.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// Zones that fit in one half of a /16 at /20 granularity
pub const MAX_ZONES: usize = 8;
pub const SUBNET_PREFIX: u8 = 20;
const PRIVATE_OFFSET: u8 = 128;
const STRIDE: u8 = 16;

/// Public/private subnet pair for one zone
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneSubnets {
    pub zone: String,
    pub public: Ipv4Net,
    pub private: Ipv4Net,
}

fn carve(network: Ipv4Net, third_octet: u8) -> Ipv4Net {
    let [a, b, _, _] = network.network().octets();
    Ipv4Net::new(Ipv4Addr::new(a, b, third_octet, 0), SUBNET_PREFIX)
        .unwrap_or_else(|_| unreachable!("/{SUBNET_PREFIX} is a valid prefix"))
}

/// Public subnet for zone index `index` (`index < MAX_ZONES`)
pub fn public_subnet_cidr(network: Ipv4Net, index: usize) -> Ipv4Net {
    debug_assert!(index < MAX_ZONES);
    carve(network, STRIDE * index as u8)
}

/// Private subnet for zone index `index` (`index < MAX_ZONES`)
pub fn private_subnet_cidr(network: Ipv4Net, index: usize) -> Ipv4Net {
    debug_assert!(index < MAX_ZONES);
    carve(network, PRIVATE_OFFSET + STRIDE * index as u8)
}

/// Full layout for the given zones, in zone order
pub fn subnet_layout(network: Ipv4Net, zones: &[String]) -> Vec<ZoneSubnets> {
    zones
        .iter()
        .take(MAX_ZONES)
        .enumerate()
        .map(|(i, zone)| ZoneSubnets {
            zone: zone.clone(),
            public: public_subnet_cidr(network, i),
            private: private_subnet_cidr(network, i),
        })
        .collect()
}
