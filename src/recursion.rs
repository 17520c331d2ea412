//! Detection of re-entrant queries during private reverse-DNS resolution.
//!
//! When the proxy forwards PTR/SOA/NS queries for private space to local
//! upstreams, a misconfigured upstream can point straight back at the
//! proxy. Fingerprints of in-flight private-RDNS requests live in a
//! short-TTL set; seeing one again means the query looped. Collisions
//! only cause a spurious NXDOMAIN, which is acceptable.

use std::time::Duration;

use hickory_proto::op::Message;
use moka::sync::Cache;

/// How long an in-flight marker lives.
const RECURSION_TTL: Duration = Duration::from_secs(1);

/// Upper bound on tracked fingerprints.
const MAX_TRACKED: u64 = 1_000;

/// TTL-bounded set of in-flight question fingerprints.
pub struct RecursionDetector {
    seen: Cache<(String, u16), ()>,
}

impl Default for RecursionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl RecursionDetector {
    pub fn new() -> Self {
        Self {
            seen: Cache::builder()
                .max_capacity(MAX_TRACKED)
                .time_to_live(RECURSION_TTL)
                .build(),
        }
    }

    /// Mark the request as in flight.
    pub fn add(&self, req: &Message) {
        if let Some(key) = Self::key(req) {
            self.seen.insert(key, ());
        }
    }

    /// Whether an equal request is already in flight.
    pub fn check(&self, req: &Message) -> bool {
        Self::key(req).map_or(false, |key| self.seen.contains_key(&key))
    }

    fn key(req: &Message) -> Option<(String, u16)> {
        let q = req.queries().first()?;
        Some((q.name().to_utf8().to_lowercase(), q.query_type().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn request(domain: &str, qtype: RecordType) -> Message {
        let mut q = Query::new();
        q.set_name(Name::from_str(domain).unwrap());
        q.set_query_type(qtype);
        let mut msg = Message::new();
        msg.add_query(q);
        msg
    }

    #[test]
    fn should_detect_repeated_requests() {
        let detector = RecursionDetector::new();
        let req = request("1.0.168.192.in-addr.arpa.", RecordType::PTR);

        assert!(!detector.check(&req));
        detector.add(&req);
        assert!(detector.check(&req));
    }

    #[test]
    fn should_treat_distinct_questions_separately() {
        let detector = RecursionDetector::new();
        detector.add(&request("1.0.168.192.in-addr.arpa.", RecordType::PTR));

        assert!(!detector.check(&request("2.0.168.192.in-addr.arpa.", RecordType::PTR)));
        assert!(!detector.check(&request("1.0.168.192.in-addr.arpa.", RecordType::SOA)));
    }

    #[test]
    fn should_ignore_case_differences() {
        let detector = RecursionDetector::new();
        detector.add(&request("1.0.168.192.IN-ADDR.ARPA.", RecordType::PTR));
        assert!(detector.check(&request("1.0.168.192.in-addr.arpa.", RecordType::PTR)));
    }

    #[test]
    fn should_ignore_questionless_messages() {
        let detector = RecursionDetector::new();
        let empty = Message::new();
        detector.add(&empty);
        assert!(!detector.check(&empty));
    }
}
