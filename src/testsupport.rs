//! Shared builders for unit tests: canned messages and a resolver wired
//! to mock upstreams.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};

use crate::cache::{CacheConfig, ResponseCache, SingleFlight};
use crate::fastip::FastestAddr;
use crate::filter::Filters;
use crate::netutil::PrefixSet;
use crate::ratelimit::RateLimiter;
use crate::recursion::RecursionDetector;
use crate::resolver::{Resolver, ResolverOptions};
use crate::stats::Stats;
use crate::upstream::testutil::MockExchanger;
use crate::upstream::{Exchanges, Registry};

/// The address every default mock upstream answers with.
pub(crate) const TEST_ANSWER: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

pub(crate) fn test_query(domain: &str, id: u16) -> Message {
    typed_query(domain, RecordType::A, id)
}

pub(crate) fn typed_query(domain: &str, qtype: RecordType, id: u16) -> Message {
    let mut q = Query::new();
    q.set_name(Name::from_utf8(domain).unwrap());
    q.set_query_type(qtype);
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(q);
    msg
}

/// A NOERROR answer for `req` with a single record.
pub(crate) fn answer(req: &Message, ttl: u32, rdata: RData) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    for q in req.queries() {
        resp.add_query(q.clone());
    }
    if let Some(q) = req.queries().first() {
        resp.add_answer(Record::from_rdata(q.name().clone(), ttl, rdata));
    }
    resp
}

/// Builder over the resolver's parts; every test starts from defaults
/// and overrides what it cares about.
pub(crate) struct ResolverBuilder {
    pub registry: Registry,
    pub private_registry: Option<Registry>,
    pub fallbacks: Option<Registry>,
    pub cache: Option<ResponseCache>,
    pub filters: Arc<Filters>,
    pub dns64: Option<crate::dns::Dns64>,
    pub bogus_nxdomain: PrefixSet,
    pub private_subnets: PrefixSet,
    pub ratelimiter: Option<RateLimiter>,
    pub opts: ResolverOptions,
}

impl ResolverBuilder {
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            private_registry: None,
            fallbacks: None,
            cache: None,
            filters: Arc::new(Filters::new()),
            dns64: None,
            bogus_nxdomain: PrefixSet::default(),
            private_subnets: PrefixSet::default(),
            ratelimiter: None,
            opts: ResolverOptions {
                timeout: Duration::from_secs(2),
                ..ResolverOptions::default()
            },
        }
    }

    pub fn with_cache(mut self) -> Self {
        self.cache = Some(ResponseCache::new(CacheConfig::default()));
        self
    }

    pub fn build(self) -> Arc<Resolver> {
        Arc::new_cyclic(|weak| Resolver {
            weak_self: weak.clone(),
            registry: self.registry,
            private_registry: self.private_registry,
            fallbacks: self.fallbacks,
            exchanges: Exchanges::new(),
            fastest: FastestAddr::new(Duration::from_millis(100)),
            cache: self.cache,
            flights: SingleFlight::new(),
            filters: self.filters,
            dns64: self.dns64,
            bogus_nxdomain: self.bogus_nxdomain,
            private_subnets: self.private_subnets,
            recursion: RecursionDetector::new(),
            ratelimiter: self.ratelimiter,
            stats: Arc::new(Stats::new()),
            opts: self.opts,
        })
    }
}

/// A resolver whose single upstream answers every A query with
/// [`TEST_ANSWER`].
pub(crate) fn test_resolver() -> Arc<Resolver> {
    let req = test_query("example.com.", 0);
    let upstream = MockExchanger::answering("mock://default", answer(&req, 60, RData::A(A(TEST_ANSWER))));
    ResolverBuilder::with_registry(Registry::from_default(vec![upstream])).build()
}
