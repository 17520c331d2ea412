//! Wire-format helpers on top of `hickory_proto`.
//!
//! Size validation on decode, EDNS-aware truncation on encode, and the
//! TTL/DNSSEC rewriting applied to responses before they leave the proxy.

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::RecordType;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

/// Smallest parseable DNS packet: a header plus a one-byte root name,
/// qtype, and qclass.
pub const MIN_PACKET_SIZE: usize = 12 + 5;

/// Largest DNS message we will ever read or write.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// Plain DNS responses without EDNS must fit in 512 bytes.
pub const PLAIN_UDP_SIZE: usize = 512;

/// EDNS UDP size advertised on OPT records the proxy adds itself.
pub const PROXY_UDP_SIZE: u16 = 2048;

/// EDNS UDP size used on OPT records created for synthesized options.
pub const SYNTH_UDP_SIZE: u16 = 4096;

/// Decode a DNS message, rejecting runts before the parser sees them.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtoError> {
    if bytes.len() < MIN_PACKET_SIZE {
        return Err(ProtoError::from(format!(
            "packet of {} bytes is below the {} byte minimum",
            bytes.len(),
            MIN_PACKET_SIZE
        )));
    }
    Message::from_bytes(bytes)
}

/// Encode a message for a stream transport (TCP, TLS, QUIC, HTTPS).
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtoError> {
    msg.to_bytes()
}

/// Encode a response for UDP, truncating it to the size negotiated by the
/// request's OPT record.
///
/// Answer records are dropped first, then authority records; the
/// additional section (and with it the OPT) is preserved. The TC bit is
/// set whenever anything was dropped.
pub fn encode_for_udp(msg: &Message, max_size: usize) -> Result<Vec<u8>, ProtoError> {
    let bytes = msg.to_bytes()?;
    if bytes.len() <= max_size {
        return Ok(bytes);
    }

    let mut truncated = msg.clone();
    truncated.set_truncated(true);

    let mut answers = truncated.answers().to_vec();
    let mut authority = truncated.name_servers().to_vec();
    loop {
        if answers.pop().is_none() && authority.pop().is_none() {
            break;
        }
        let mut candidate = truncated.clone();
        candidate.insert_answers(answers.clone());
        candidate.insert_name_servers(authority.clone());
        let encoded = candidate.to_bytes()?;
        if encoded.len() <= max_size {
            return Ok(encoded);
        }
    }

    truncated.insert_answers(Vec::new());
    truncated.insert_name_servers(Vec::new());
    truncated.to_bytes()
}

/// The response size the client negotiated via EDNS, or the plain 512.
pub fn negotiated_udp_size(req: &Message) -> usize {
    match req.extensions() {
        Some(edns) => (edns.max_payload() as usize).max(PLAIN_UDP_SIZE),
        None => PLAIN_UDP_SIZE,
    }
}

/// Make sure `msg` carries an OPT record with the DO bit set.
///
/// Used before forwarding cache-miss queries upstream so that validated
/// (DNSSEC-signed) answers land in the cache.
pub fn ensure_do(msg: &mut Message) {
    match msg.extensions_mut() {
        Some(edns) => {
            if !edns.dnssec_ok() {
                edns.set_dnssec_ok(true);
            }
        }
        ext @ None => {
            let mut edns = Edns::new();
            edns.set_max_payload(PROXY_UDP_SIZE);
            edns.set_dnssec_ok(true);
            *ext = Some(edns);
        }
    }
}

/// Minimum TTL across all answer records, if any.
pub fn min_answer_ttl(msg: &Message) -> Option<u32> {
    msg.answers().iter().map(|rr| rr.ttl()).min()
}

/// Clamp every answer TTL into `[min, max]`.
pub fn clamp_ttls(msg: &mut Message, min: u32, max: u32) {
    for rr in msg.answers_mut() {
        let ttl = clamp_ttl(rr.ttl(), min, max);
        if ttl != rr.ttl() {
            rr.set_ttl(ttl);
        }
    }
}

/// Clamp a single TTL into `[min, max]`; a `max` of zero means unbounded.
pub fn clamp_ttl(ttl: u32, min: u32, max: u32) -> u32 {
    let mut ttl = ttl.max(min);
    if max > 0 {
        ttl = ttl.min(max);
    }
    ttl
}

/// DNSSEC record types stripped from responses when the client did not
/// ask for them. DS stays: it is the answer to an explicit DS query.
const DNSSEC_TYPES: [RecordType; 4] = [
    RecordType::RRSIG,
    RecordType::NSEC,
    RecordType::NSEC3,
    RecordType::DNSKEY,
];

/// Apply the client's AD and DO request bits to an upstream response.
///
/// Without DO, DNSSEC metadata records are removed from every section;
/// without AD, the authenticated-data flag is cleared.
pub fn filter_response(msg: &mut Message, ad_requested: bool, do_requested: bool) {
    if !ad_requested {
        msg.set_authentic_data(false);
    }
    if do_requested {
        return;
    }

    let answers: Vec<_> = msg
        .answers()
        .iter()
        .filter(|rr| !DNSSEC_TYPES.contains(&rr.record_type()))
        .cloned()
        .collect();
    if answers.len() != msg.answers().len() {
        msg.insert_answers(answers);
    }

    let authority: Vec<_> = msg
        .name_servers()
        .iter()
        .filter(|rr| !DNSSEC_TYPES.contains(&rr.record_type()))
        .cloned()
        .collect();
    if authority.len() != msg.name_servers().len() {
        msg.insert_name_servers(authority);
    }

    if let Some(edns) = msg.extensions_mut() {
        edns.set_dnssec_ok(false);
    }
}
