//! Synthetic DNS responses produced by the proxy itself.
//!
//! Everything the proxy answers without consulting an upstream is built
//! here: rcode-only replies, negative answers with an SOA for caching,
//! and the zero-address answers used for blocked domains.

use std::net::{Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Edns, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, SOA};
use hickory_proto::rr::{Name, RData, Record, RecordType};

use super::codec::PROXY_UDP_SIZE;

/// TTL on answers synthesized for blocked domains.
pub const BLOCKED_RESPONSE_TTL: u32 = 3600;

/// SOA retry used on negative answers that should be re-asked soon.
pub const RETRY_NO_ERROR: u32 = 600;

/// Start a response message for `req`: same id, same question, RD copied,
/// RA set.
pub fn reply_to(req: &Message, rcode: ResponseCode) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(req.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(rcode);
    for q in req.queries() {
        resp.add_query(q.clone());
    }
    resp
}

/// SERVFAIL for `req`.
pub fn servfail(req: &Message) -> Message {
    reply_to(req, ResponseCode::ServFail)
}

/// NXDOMAIN for `req`, with an SOA in the authority section so negative
/// caches hold on to it.
pub fn nxdomain(req: &Message) -> Message {
    let mut resp = reply_to(req, ResponseCode::NXDomain);
    resp.add_name_server(synthetic_soa(req, RETRY_NO_ERROR));
    resp
}

/// NOTIMPLEMENTED for `req`. Carries an OPT record: refused-ANY replies
/// must stay EDNS-capable so clients do not retry without EDNS.
pub fn not_implemented(req: &Message) -> Message {
    let mut resp = reply_to(req, ResponseCode::NotImp);
    let mut edns = Edns::new();
    edns.set_max_payload(PROXY_UDP_SIZE);
    *resp.extensions_mut() = Some(edns);
    resp
}

/// NOERROR with an empty answer section and an SOA, used for AAAA
/// queries when IPv6 resolution is disabled.
pub fn empty_with_soa(req: &Message) -> Message {
    let mut resp = reply_to(req, ResponseCode::NoError);
    resp.add_name_server(synthetic_soa(req, RETRY_NO_ERROR));
    resp
}

/// The success response for a blocked domain: a single `0.0.0.0` answer
/// for A queries, `::` for AAAA.
pub fn blocked(req: &Message) -> Message {
    let mut resp = reply_to(req, ResponseCode::NoError);
    if let Some(q) = req.queries().first() {
        let rdata = match q.query_type() {
            RecordType::AAAA => RData::AAAA(AAAA(Ipv6Addr::UNSPECIFIED)),
            _ => RData::A(A(Ipv4Addr::UNSPECIFIED)),
        };
        resp.add_answer(Record::from_rdata(
            q.name().clone(),
            BLOCKED_RESPONSE_TTL,
            rdata,
        ));
    }
    resp
}

/// Rebuild a request with a different question, keeping the header
/// flags and EDNS data intact.
pub fn with_question(req: &Message, query: hickory_proto::op::Query) -> Message {
    let mut out = Message::new();
    out.set_id(req.id())
        .set_message_type(req.message_type())
        .set_op_code(req.op_code())
        .set_recursion_desired(req.recursion_desired())
        .set_checking_disabled(req.checking_disabled())
        .set_authentic_data(req.authentic_data());
    out.add_query(query);
    if let Some(edns) = req.extensions().clone() {
        *out.extensions_mut() = Some(edns);
    }
    out
}

/// An SOA record for the authority section of negative answers.
///
/// The timer values are not load-bearing for a forwarder; they exist so
/// resolvers apply ordinary negative caching.
fn synthetic_soa(req: &Message, retry: u32) -> Record {
    let zone = req
        .queries()
        .first()
        .map(|q| q.name().clone())
        .unwrap_or_else(Name::root);

    let mname = Name::from_ascii("fake-for-negative-caching.invalid.").unwrap_or_else(|_| Name::root());
    let rname = Name::from_ascii("hostmaster.")
        .ok()
        .and_then(|h| h.append_domain(&zone).ok())
        .unwrap_or_else(Name::root);

    let soa = SOA::new(mname, rname, 100_500, 1800, retry as i32, 604_800, 86400);
    Record::from_rdata(zone, 3600, RData::SOA(soa))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use std::str::FromStr;

    fn request(domain: &str, qtype: RecordType) -> Message {
        let mut q = Query::new();
        q.set_name(Name::from_str(domain).unwrap());
        q.set_query_type(qtype);
        let mut msg = Message::new();
        msg.set_id(0x29ab);
        msg.set_recursion_desired(true);
        msg.add_query(q);
        msg
    }

    #[test]
    fn should_echo_id_and_question() {
        let req = request("example.com.", RecordType::A);
        let resp = servfail(&req);
        assert_eq!(resp.id(), req.id());
        assert_eq!(resp.queries(), req.queries());
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert!(resp.recursion_available());
    }

    #[test]
    fn should_attach_soa_to_nxdomain() {
        let req = request("missing.example.", RecordType::A);
        let resp = nxdomain(&req);
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
        assert_eq!(resp.name_servers().len(), 1);
        assert_eq!(resp.name_servers()[0].record_type(), RecordType::SOA);
    }

    #[test]
    fn should_carry_opt_on_notimplemented() {
        let req = request("example.com.", RecordType::ANY);
        let resp = not_implemented(&req);
        assert_eq!(resp.response_code(), ResponseCode::NotImp);
        assert!(resp.extensions().is_some());
    }

    #[test]
    fn should_answer_blocked_a_with_zero_address() {
        let req = request("ads.example.", RecordType::A);
        let resp = blocked(&req);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].ttl(), BLOCKED_RESPONSE_TTL);
        let data = resp.answers()[0].data().unwrap();
        assert_eq!(data.as_a().unwrap().0, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn should_answer_blocked_aaaa_with_zero_address() {
        let req = request("ads.example.", RecordType::AAAA);
        let resp = blocked(&req);
        let data = resp.answers()[0].data().unwrap();
        assert_eq!(data.as_aaaa().unwrap().0, Ipv6Addr::UNSPECIFIED);
    }

    #[test]
    fn should_leave_answers_empty_for_ipv6_disabled_reply() {
        let req = request("example.com.", RecordType::AAAA);
        let resp = empty_with_soa(&req);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.answers().is_empty());
        assert_eq!(resp.name_servers().len(), 1);
    }
}
