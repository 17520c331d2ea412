//! Canonical question fingerprints.
//!
//! A fingerprint identifies a query for caching and single-flight
//! purposes: two requests with equal fingerprints are interchangeable and
//! must share one upstream exchange.

use hickory_proto::op::Message;

use super::ecs;
use crate::netutil::Prefix;

/// Canonicalized tuple identifying a cacheable query.
///
/// Covers the lowercased qname, qtype, qclass, the DO bit (validated and
/// unvalidated answers differ), and the masked ECS network when present
/// (answers are subnet-scoped once ECS is in play).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    qname: String,
    qtype: u16,
    qclass: u16,
    do_bit: bool,
    ecs: Option<Prefix>,
}

impl Fingerprint {
    /// Compute the fingerprint of a request. Returns `None` when the
    /// message carries no question.
    pub fn of(msg: &Message) -> Option<Self> {
        let q = msg.queries().first()?;
        let do_bit = msg
            .extensions()
            .as_ref()
            .map_or(false, |edns| edns.dnssec_ok());
        let ecs = ecs::ecs_from_msg(msg).map(|subnet| subnet.network);

        Some(Self {
            qname: q.name().to_utf8().to_lowercase(),
            qtype: q.query_type().into(),
            qclass: q.query_class().into(),
            do_bit,
            ecs,
        })
    }

    pub fn qname(&self) -> &str {
        &self.qname
    }

    pub fn qtype(&self) -> u16 {
        self.qtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::codec::ensure_do;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn request(domain: &str, qtype: RecordType) -> Message {
        let mut q = Query::new();
        q.set_name(Name::from_str(domain).unwrap());
        q.set_query_type(qtype);
        let mut msg = Message::new();
        msg.set_id(1);
        msg.add_query(q);
        msg
    }

    #[test]
    fn should_ignore_qname_case() {
        let a = Fingerprint::of(&request("Example.COM.", RecordType::A)).unwrap();
        let b = Fingerprint::of(&request("example.com.", RecordType::A)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn should_distinguish_query_types() {
        let a = Fingerprint::of(&request("example.com.", RecordType::A)).unwrap();
        let aaaa = Fingerprint::of(&request("example.com.", RecordType::AAAA)).unwrap();
        assert_ne!(a, aaaa);
    }

    #[test]
    fn should_distinguish_do_bit() {
        let plain = Fingerprint::of(&request("example.com.", RecordType::A)).unwrap();
        let mut with_do = request("example.com.", RecordType::A);
        ensure_do(&mut with_do);
        let with_do = Fingerprint::of(&with_do).unwrap();
        assert_ne!(plain, with_do);
    }

    #[test]
    fn should_distinguish_ecs_networks() {
        let plain = Fingerprint::of(&request("example.com.", RecordType::A)).unwrap();

        let mut with_ecs = request("example.com.", RecordType::A);
        crate::dns::ecs::set_ecs(&mut with_ecs, "203.0.113.7".parse().unwrap(), 24, 56);
        let with_ecs = Fingerprint::of(&with_ecs).unwrap();
        assert_ne!(plain, with_ecs);

        // Two clients in the same /24 share a fingerprint.
        let mut same_net = request("example.com.", RecordType::A);
        crate::dns::ecs::set_ecs(&mut same_net, "203.0.113.99".parse().unwrap(), 24, 56);
        let same_net = Fingerprint::of(&same_net).unwrap();
        assert_eq!(with_ecs, same_net);
    }

    #[test]
    fn should_return_none_without_question() {
        assert!(Fingerprint::of(&Message::new()).is_none());
    }
}
