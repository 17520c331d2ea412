//! DNS64 synthesis (RFC 6147).
//!
//! When a client asks for AAAA and the authoritative answer has none, the
//! resolver engine re-issues the query for A and maps each IPv4 answer
//! into a configured NAT64 prefix. PTR queries for mapped addresses are
//! rewritten to the embedded IPv4's reverse name so the private-RDNS
//! upstreams can answer them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_proto::op::Message;
use hickory_proto::rr::rdata::AAAA;
use hickory_proto::rr::{RData, Record, RecordType};

use crate::netutil::Prefix;

/// The well-known NAT64 prefix from RFC 6052.
pub const WELL_KNOWN_PREFIX: &str = "64:ff9b::/96";

/// NAT64 prefix set used for DNS64 synthesis.
#[derive(Debug, Clone)]
pub struct Dns64 {
    prefixes: Vec<Prefix>,
}

impl Dns64 {
    /// Build from configured prefixes; every prefix must be a /96.
    pub fn new(prefixes: Vec<Prefix>) -> Result<Self, String> {
        if prefixes.is_empty() {
            return Err("dns64 requires at least one prefix".into());
        }
        for p in &prefixes {
            if !matches!(p.addr(), IpAddr::V6(_)) || p.len() != 96 {
                return Err(format!("dns64 prefix {p} is not an IPv6 /96"));
            }
        }
        Ok(Self { prefixes })
    }

    /// The well-known-prefix instance.
    pub fn well_known() -> Self {
        Self::new(vec![Prefix::parse(WELL_KNOWN_PREFIX).expect("well-known prefix parses")])
            .expect("well-known prefix is a /96")
    }

    /// Whether `resp` is an AAAA answer that qualifies for synthesis:
    /// empty or NODATA, with no real AAAA records.
    pub fn should_synthesize(resp: &Message) -> bool {
        let Some(q) = resp.queries().first() else {
            return false;
        };
        if q.query_type() != RecordType::AAAA {
            return false;
        }
        !resp
            .answers()
            .iter()
            .any(|rr| rr.record_type() == RecordType::AAAA)
    }

    /// Map an IPv4 address into the first configured prefix.
    pub fn map(&self, v4: Ipv4Addr) -> Ipv6Addr {
        let IpAddr::V6(prefix) = self.prefixes[0].addr() else {
            unreachable!("prefixes are validated as IPv6 at construction");
        };
        let mut bytes = prefix.octets();
        bytes[12..16].copy_from_slice(&v4.octets());
        Ipv6Addr::from(bytes)
    }

    /// Extract the IPv4 address embedded in a mapped IPv6 address, if the
    /// address belongs to any configured prefix.
    pub fn extract(&self, v6: Ipv6Addr) -> Option<Ipv4Addr> {
        if !self.prefixes.iter().any(|p| p.contains(IpAddr::V6(v6))) {
            return None;
        }
        let bytes = v6.octets();
        Some(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]))
    }

    /// Build the synthesized AAAA records for the A answers in `a_resp`,
    /// using the qname of the original AAAA question.
    pub fn synthesize(&self, aaaa_req: &Message, a_resp: &Message) -> Vec<Record> {
        let Some(q) = aaaa_req.queries().first() else {
            return Vec::new();
        };
        a_resp
            .answers()
            .iter()
            .filter_map(|rr| rr.data().and_then(RData::as_a))
            .map(|a| {
                Record::from_rdata(
                    q.name().clone(),
                    a_resp
                        .answers()
                        .iter()
                        .map(Record::ttl)
                        .min()
                        .unwrap_or(0),
                    RData::AAAA(AAAA(self.map(a.0))),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn request(domain: &str, qtype: RecordType) -> Message {
        let mut q = Query::new();
        q.set_name(Name::from_str(domain).unwrap());
        q.set_query_type(qtype);
        let mut msg = Message::new();
        msg.set_id(9);
        msg.add_query(q);
        msg
    }

    fn answer(req: &Message, rdata: RData) -> Message {
        let mut resp = Message::new();
        resp.set_id(req.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(ResponseCode::NoError);
        for q in req.queries() {
            resp.add_query(q.clone());
        }
        let name = req.queries()[0].name().clone();
        resp.add_answer(Record::from_rdata(name, 10, rdata));
        resp
    }

    #[test]
    fn should_map_into_well_known_prefix() {
        let dns64 = Dns64::well_known();
        assert_eq!(
            dns64.map(Ipv4Addr::new(192, 0, 2, 1)),
            "64:ff9b::c000:201".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn should_extract_embedded_ipv4() {
        let dns64 = Dns64::well_known();
        assert_eq!(
            dns64.extract("64:ff9b::c000:201".parse().unwrap()),
            Some(Ipv4Addr::new(192, 0, 2, 1))
        );
        assert_eq!(dns64.extract("2001:db8::1".parse().unwrap()), None);
    }

    #[test]
    fn should_reject_non_96_prefixes() {
        assert!(Dns64::new(vec![Prefix::parse("64:ff9b::/64").unwrap()]).is_err());
        assert!(Dns64::new(vec![Prefix::parse("10.0.0.0/8").unwrap()]).is_err());
        assert!(Dns64::new(Vec::new()).is_err());
    }

    #[test]
    fn should_only_synthesize_for_empty_aaaa_answers() {
        let aaaa_req = request("v4only.example.", RecordType::AAAA);
        let empty = crate::dns::message::reply_to(&aaaa_req, ResponseCode::NoError);
        assert!(Dns64::should_synthesize(&empty));

        let with_aaaa = answer(&aaaa_req, RData::AAAA(AAAA("2001:db8::1".parse().unwrap())));
        assert!(!Dns64::should_synthesize(&with_aaaa));

        let a_req = request("example.com.", RecordType::A);
        let a_resp = answer(&a_req, RData::A(A(Ipv4Addr::new(192, 0, 2, 1))));
        assert!(!Dns64::should_synthesize(&a_resp));
    }

    #[test]
    fn should_synthesize_aaaa_from_a_answers() {
        let dns64 = Dns64::well_known();
        let aaaa_req = request("v4only.example.", RecordType::AAAA);
        let a_req = request("v4only.example.", RecordType::A);
        let a_resp = answer(&a_req, RData::A(A(Ipv4Addr::new(192, 0, 2, 1))));

        let records = dns64.synthesize(&aaaa_req, &a_resp);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type(), RecordType::AAAA);
        assert_eq!(
            records[0].data().unwrap().as_aaaa().unwrap().0,
            "64:ff9b::c000:201".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(records[0].ttl(), 10);
    }
}
