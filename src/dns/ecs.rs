//! EDNS Client Subnet (RFC 7871) option handling.
//!
//! `hickory_proto` carries unrecognized EDNS options as raw bytes, so the
//! ECS payload is encoded and decoded here: FAMILY (1 = IPv4, 2 = IPv6),
//! SOURCE PREFIX-LENGTH, SCOPE PREFIX-LENGTH, and the truncated address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};

use super::codec::SYNTH_UDP_SIZE;
use crate::netutil::{mask_addr, Prefix};

/// Address family codes from the IANA registry.
const FAMILY_IPV4: u16 = 1;
const FAMILY_IPV6: u16 = 2;

/// Default source prefix lengths used when the proxy synthesizes ECS from
/// the client address. The v6 length of 56 is a practical minimum; public
/// resolvers refuse longer masks.
pub const DEFAULT_PREFIX_V4: u8 = 24;
pub const DEFAULT_PREFIX_V6: u8 = 56;

/// A decoded ECS option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSubnet {
    pub network: Prefix,
    pub scope: u8,
}

impl ClientSubnet {
    /// Decode the option payload. Returns `None` on truncated or
    /// malformed payloads rather than failing the whole message.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let family = u16::from_be_bytes([data[0], data[1]]);
        let source = data[2];
        let scope = data[3];
        let addr_bytes = &data[4..];

        let addr = match family {
            FAMILY_IPV4 => {
                if source > 32 || addr_bytes.len() > 4 {
                    return None;
                }
                let mut octets = [0u8; 4];
                octets[..addr_bytes.len()].copy_from_slice(addr_bytes);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            FAMILY_IPV6 => {
                if source > 128 || addr_bytes.len() > 16 {
                    return None;
                }
                let mut octets = [0u8; 16];
                octets[..addr_bytes.len()].copy_from_slice(addr_bytes);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };

        Some(Self {
            network: Prefix::new(addr, source),
            scope,
        })
    }

    /// Encode the option payload, emitting only the address octets the
    /// prefix length covers.
    pub fn to_bytes(&self) -> Vec<u8> {
        let source = self.network.len();
        let addr_len = usize::from(source).div_ceil(8);
        let (family, octets) = match self.network.addr() {
            IpAddr::V4(v4) => (FAMILY_IPV4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (FAMILY_IPV6, v6.octets().to_vec()),
        };

        let mut out = Vec::with_capacity(4 + addr_len);
        out.extend_from_slice(&family.to_be_bytes());
        out.push(source);
        out.push(self.scope);
        out.extend_from_slice(&octets[..addr_len]);
        out
    }
}

/// Read the ECS option from a message, if present and well-formed.
pub fn ecs_from_msg(msg: &Message) -> Option<ClientSubnet> {
    let edns = msg.extensions().as_ref()?;
    match edns.options().get(EdnsCode::Subnet) {
        Some(EdnsOption::Unknown(_, data)) => ClientSubnet::from_bytes(data),
        _ => None,
    }
}

/// Write an ECS option for `client` into the request.
///
/// The address is masked to the configured prefix length; per RFC 7871 §6
/// a stub-facing forwarder sets SCOPE PREFIX-LENGTH to zero. An OPT
/// record is created (with the larger synthesized-answer UDP size) when
/// the request does not carry one. Returns the masked network.
pub fn set_ecs(msg: &mut Message, client: IpAddr, v4_len: u8, v6_len: u8) -> Prefix {
    let source = match client {
        IpAddr::V4(_) => v4_len,
        IpAddr::V6(_) => v6_len,
    };
    let subnet = ClientSubnet {
        network: Prefix::new(mask_addr(client, source), source),
        scope: 0,
    };

    let edns = msg.extensions_mut().get_or_insert_with(|| {
        let mut edns = Edns::new();
        edns.set_max_payload(SYNTH_UDP_SIZE);
        edns
    });
    edns.options_mut()
        .insert(EdnsOption::Unknown(u16::from(EdnsCode::Subnet), subnet.to_bytes()));

    subnet.network
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn query(domain: &str) -> Message {
        let mut q = Query::new();
        q.set_name(Name::from_str(domain).unwrap());
        q.set_query_type(RecordType::A);
        let mut msg = Message::new();
        msg.set_id(42);
        msg.add_query(q);
        msg
    }

    #[test]
    fn should_round_trip_ipv4_option() {
        let subnet = ClientSubnet {
            network: Prefix::parse("203.0.113.0/24").unwrap(),
            scope: 0,
        };
        let bytes = subnet.to_bytes();
        // family(2) + prefixes(2) + 3 address octets for a /24
        assert_eq!(bytes.len(), 7);
        assert_eq!(ClientSubnet::from_bytes(&bytes).unwrap(), subnet);
    }

    #[test]
    fn should_round_trip_ipv6_option() {
        let subnet = ClientSubnet {
            network: Prefix::parse("2001:db8:12::/56").unwrap(),
            scope: 48,
        };
        let bytes = subnet.to_bytes();
        assert_eq!(bytes.len(), 4 + 7);
        assert_eq!(ClientSubnet::from_bytes(&bytes).unwrap(), subnet);
    }

    #[test]
    fn should_reject_malformed_payloads() {
        assert!(ClientSubnet::from_bytes(&[]).is_none());
        assert!(ClientSubnet::from_bytes(&[0, 1, 2]).is_none());
        // unknown family
        assert!(ClientSubnet::from_bytes(&[0, 3, 24, 0, 1, 2, 3]).is_none());
        // prefix longer than the family allows
        assert!(ClientSubnet::from_bytes(&[0, 1, 40, 0, 1, 2, 3]).is_none());
    }

    #[test]
    fn should_set_and_read_back_ecs() {
        let mut msg = query("example.com.");
        let network = set_ecs(
            &mut msg,
            "203.0.113.7".parse().unwrap(),
            DEFAULT_PREFIX_V4,
            DEFAULT_PREFIX_V6,
        );
        assert_eq!(network, Prefix::parse("203.0.113.0/24").unwrap());

        let edns = msg.extensions().as_ref().unwrap();
        assert_eq!(edns.max_payload(), SYNTH_UDP_SIZE);

        let decoded = ecs_from_msg(&msg).unwrap();
        assert_eq!(decoded.network, network);
        assert_eq!(decoded.scope, 0);
    }

    #[test]
    fn should_mask_client_address_before_sending() {
        let mut msg = query("example.com.");
        let network = set_ecs(
            &mut msg,
            "2001:db8:12:3456::1".parse().unwrap(),
            DEFAULT_PREFIX_V4,
            DEFAULT_PREFIX_V6,
        );
        assert_eq!(network, Prefix::parse("2001:db8:12:3400::/56").unwrap());
    }

    #[test]
    fn should_return_none_when_no_opt_present() {
        let msg = query("example.com.");
        assert!(ecs_from_msg(&msg).is_none());
    }
}
