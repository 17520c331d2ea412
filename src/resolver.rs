//! The resolver engine: the per-query pipeline from a decoded request to
//! a serializable response.
//!
//! Each query moves through validation, the UDP rate-limit gate, the
//! cache, upstream selection and exchange, and post-processing. Every
//! step either produces a synthetic response and stops, or hands the
//! query to the next step; unrecoverable failures become SERVFAIL and
//! rate-limited queries produce nothing at all.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use metrics::counter;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheLookup, ResponseCache, SingleFlight};
use crate::dns::{codec, ecs, message, Dns64, Fingerprint};
use crate::error::ExchangeError;
use crate::fastip::FastestAddr;
use crate::filter::Filters;
use crate::netutil::{self, Prefix, PrefixSet};
use crate::ratelimit::RateLimiter;
use crate::recursion::RecursionDetector;
use crate::stats::Stats;
use crate::upstream::{ExchangeMode, Exchanges, Registry, UpstreamRef};

/// Transport a query arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
    Tls,
    Https,
    Quic,
    DnsCrypt,
}

impl Proto {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Https => "https",
            Self::Quic => "quic",
            Self::DnsCrypt => "dnscrypt",
        }
    }
}

/// Per-query mutable state. Created on ingress, dropped after respond;
/// never shared across queries.
pub struct DnsContext {
    pub req: Message,
    pub client: SocketAddr,
    pub proto: Proto,
    pub res: Option<Message>,
    /// Address of the upstream that answered; `None` for synthetic and
    /// cached responses.
    pub upstream: Option<String>,
    pub is_private_client: bool,
    pub requested_private_rdns: Option<Prefix>,
    pub query_duration: Duration,
    ad_bit: bool,
    do_bit: bool,
    /// Cleared when the response must not carry an OPT record.
    has_edns: bool,
    /// Response budget negotiated by the client's original OPT record,
    /// captured before the proxy touches the request.
    udp_size: usize,
}

impl DnsContext {
    fn new(req: Message, client: SocketAddr, proto: Proto) -> Self {
        let do_bit = req
            .extensions()
            .as_ref()
            .map_or(false, |edns| edns.dnssec_ok());
        Self {
            ad_bit: req.authentic_data(),
            do_bit,
            has_edns: true,
            udp_size: codec::negotiated_udp_size(&req),
            req,
            client,
            proto,
            res: None,
            upstream: None,
            is_private_client: false,
            requested_private_rdns: None,
            query_duration: Duration::ZERO,
        }
    }

    fn question(&self) -> Option<(&hickory_proto::op::Query, String)> {
        let q = self.req.queries().first()?;
        Some((q, q.name().to_utf8().to_lowercase()))
    }
}

/// Behavior knobs for the engine, derived from the configuration.
pub struct ResolverOptions {
    pub mode: ExchangeMode,
    pub timeout: Duration,
    pub refuse_any: bool,
    pub ipv6_disabled: bool,
    pub edns_enabled: bool,
    pub edns_client_ip: Option<IpAddr>,
    pub use_private_rdns: bool,
    pub cache_min_ttl: u32,
    pub cache_max_ttl: u32,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            mode: ExchangeMode::LoadBalance,
            timeout: Duration::from_secs(10),
            refuse_any: false,
            ipv6_disabled: false,
            edns_enabled: false,
            edns_client_ip: None,
            use_private_rdns: true,
            cache_min_ttl: 0,
            cache_max_ttl: 0,
        }
    }
}

/// The query-processing engine. One instance serves all listeners.
pub struct Resolver {
    pub(crate) registry: Registry,
    pub(crate) private_registry: Option<Registry>,
    pub(crate) fallbacks: Option<Registry>,
    pub(crate) exchanges: Exchanges,
    pub(crate) fastest: FastestAddr,
    pub(crate) cache: Option<ResponseCache>,
    pub(crate) flights: SingleFlight,
    pub(crate) filters: Arc<Filters>,
    pub(crate) dns64: Option<Dns64>,
    pub(crate) bogus_nxdomain: PrefixSet,
    pub(crate) private_subnets: PrefixSet,
    pub(crate) recursion: RecursionDetector,
    pub(crate) ratelimiter: Option<RateLimiter>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) opts: ResolverOptions,
    /// Weak handle to this resolver's own `Arc`, used by detached
    /// refresh tasks so they cannot outlive a shutdown.
    pub(crate) weak_self: Weak<Resolver>,
}

impl Resolver {
    /// Handle raw request bytes and produce raw response bytes.
    ///
    /// `None` means silence: an undecodable UDP datagram, an inbound
    /// response packet, or a rate-limited client.
    pub async fn handle_bytes(
        &self,
        bytes: &[u8],
        client: SocketAddr,
        proto: Proto,
    ) -> Option<Vec<u8>> {
        let req = match codec::decode(bytes) {
            Ok(req) => req,
            Err(err) => {
                debug!(%client, proto = proto.as_str(), %err, "dropping undecodable packet");
                // A header is enough to at least say SERVFAIL on stream
                // transports; UDP stays silent.
                if proto != Proto::Udp && bytes.len() >= 2 {
                    let mut resp = Message::new();
                    resp.set_id(u16::from_be_bytes([bytes[0], bytes[1]]))
                        .set_message_type(MessageType::Response)
                        .set_response_code(ResponseCode::ServFail);
                    return codec::encode(&resp).ok();
                }
                return None;
            }
        };

        let ctx = self.handle_message(req, client, proto).await?;
        let res = ctx.res.as_ref()?;
        match ctx.proto {
            Proto::Udp => codec::encode_for_udp(res, ctx.udp_size).ok(),
            _ => codec::encode(res).ok(),
        }
    }

    /// Run the full pipeline for a decoded request.
    ///
    /// Returns the finished context, or `None` for a silent drop.
    #[instrument(skip_all, fields(client = %client, proto = proto.as_str(), domain = tracing::field::Empty))]
    pub async fn handle_message(
        &self,
        req: Message,
        client: SocketAddr,
        proto: Proto,
    ) -> Option<DnsContext> {
        if req.message_type() == MessageType::Response {
            debug!("dropping inbound response packet");
            return None;
        }

        let mut ctx = DnsContext::new(req, client, proto);
        ctx.is_private_client = self.is_private(client.ip());

        if let Some((q, domain)) = ctx.question() {
            tracing::Span::current().record("domain", domain.as_str());
            self.stats.increment("local::queries", 1);
            counter!("dns.queries", "proto" => proto.as_str(), "qtype" => q.query_type().to_string())
                .increment(1);
        }

        let synthetic = self.validate(&mut ctx);

        // The rate-limit gate only applies to UDP and only to queries
        // that still need real work. A limited query is dropped without
        // a response and without any upstream exchange.
        if synthetic.is_none() && ctx.proto == Proto::Udp {
            if let Some(limiter) = &self.ratelimiter {
                if !limiter.allow(ctx.client.ip()) {
                    debug!("ratelimited, dropping");
                    self.stats.increment("local::ratelimited", 1);
                    counter!("dns.queries.ratelimited").increment(1);
                    return None;
                }
            }
        }

        match synthetic {
            Some(resp) => ctx.res = Some(resp),
            None => self.resolve(&mut ctx).await,
        }

        self.scrub(&mut ctx);
        Some(ctx)
    }

    /// The validation chain. Returns a synthetic response on a hit.
    fn validate(&self, ctx: &mut DnsContext) -> Option<Message> {
        if ctx.req.queries().len() != 1 {
            debug!(count = ctx.req.queries().len(), "invalid question count");
            return Some(message::servfail(&ctx.req));
        }
        let (q, domain) = ctx.question().expect("exactly one question");
        let qtype = q.query_type();
        let domain = domain.trim_end_matches('.').to_string();

        if self.opts.refuse_any && qtype == RecordType::ANY {
            debug!("refusing ANY query");
            return Some(message::not_implemented(&ctx.req));
        }

        if self.recursion.check(&ctx.req) {
            debug!("recursion detected");
            return Some(message::nxdomain(&ctx.req));
        }

        if self.check_private_arpa(ctx) {
            debug!("private arpa request from public client");
            return Some(message::nxdomain(&ctx.req));
        }

        if self.opts.ipv6_disabled && qtype == RecordType::AAAA {
            return Some(message::empty_with_soa(&ctx.req));
        }

        if matches!(qtype, RecordType::A | RecordType::AAAA) {
            if let Some((hit, list)) = self.filters.blocked.check(&domain) {
                info!(domain, pattern = hit.pattern, list, "blocked");
                self.stats.increment("blocked_domains::blocked_responses", 1);
                self.stats
                    .increment(&format!("blocked_domains::domains::{list}::{domain}"), 1);
                counter!("dns.queries.blocked", "list" => list).increment(1);
                return Some(message::blocked(&ctx.req));
            }
        }

        None
    }

    /// PTR/SOA/NS for private space: forbidden for public clients, and
    /// remembered for upstream selection otherwise.
    fn check_private_arpa(&self, ctx: &mut DnsContext) -> bool {
        let (q, domain) = ctx.question().expect("validated question");
        if !matches!(
            q.query_type(),
            RecordType::PTR | RecordType::SOA | RecordType::NS
        ) {
            return false;
        }
        let Some(prefix) = netutil::parse_reversed_addr(&domain) else {
            return false;
        };
        if self.is_private(prefix.addr()) {
            ctx.requested_private_rdns = Some(prefix);
            return !ctx.is_private_client;
        }
        false
    }

    /// Steps 4..8 of the pipeline: cache, selection, exchange,
    /// post-processing, cache store.
    async fn resolve(&self, ctx: &mut DnsContext) {
        if self.opts.edns_enabled {
            self.process_ecs(ctx);
        }

        // A PTR for a NAT64-mapped address is rewritten to the embedded
        // IPv4 before anything else sees the question.
        self.rewrite_nat64_ptr(ctx);

        let cache_usable = self.cache.is_some()
            && !ctx.req.checking_disabled()
            && ctx.requested_private_rdns.is_none();

        let key = Fingerprint::of(&ctx.req);

        if cache_usable {
            if let (Some(cache), Some(key)) = (&self.cache, &key) {
                match cache.get(&ctx.req, key) {
                    CacheLookup::Fresh(hit) => {
                        debug!("cache hit");
                        self.stats.increment("local::num_cache_and_blocked_responses", 1);
                        counter!("dns.queries.cache", "status" => "hit").increment(1);
                        ctx.upstream = None;
                        ctx.res = Some(hit.msg);
                        return;
                    }
                    CacheLookup::Stale(hit) => {
                        debug!("optimistic cache hit, scheduling refresh");
                        counter!("dns.queries.cache", "status" => "stale").increment(1);
                        self.spawn_refresh(key.clone(), ctx);
                        ctx.upstream = None;
                        ctx.res = Some(hit.msg);
                        return;
                    }
                    CacheLookup::Miss => {
                        counter!("dns.queries.cache", "status" => "miss").increment(1);
                    }
                }
            }
            // Ask for DNSSEC material on the way upstream so validated
            // answers are what lands in the cache.
            codec::ensure_do(&mut ctx.req);
        }

        let started = Instant::now();
        let result = match &key {
            Some(key) => {
                let req = ctx.req.clone();
                let private = ctx.requested_private_rdns.is_some();
                self.flights
                    .run(key, self.opts.timeout, move || async move {
                        self.exchange_with_fallbacks(&req, private).await
                    })
                    .await
            }
            None => {
                self.exchange_with_fallbacks(&ctx.req, ctx.requested_private_rdns.is_some())
                    .await
            }
        };
        ctx.query_duration = started.elapsed();

        match result {
            Ok((mut resp, upstream)) => {
                self.postprocess(ctx, &mut resp, &upstream).await;
                self.stats.increment(&format!("resolvers::{upstream}"), 1);
                ctx.upstream = Some(upstream);
                ctx.res = Some(resp);
            }
            Err(err) => {
                if matches!(err, ExchangeError::NoUpstreams) {
                    debug!("no upstreams for query");
                    ctx.res = Some(message::nxdomain(&ctx.req));
                } else {
                    warn!(%err, "exchange failed, answering SERVFAIL");
                    counter!("dns.queries.failed").increment(1);
                    ctx.has_edns = false;
                    ctx.res = Some(message::servfail(&ctx.req));
                }
                return;
            }
        }

        // Step 8: store only clean upstream answers.
        if cache_usable {
            let (_, domain) = ctx.question().expect("validated question");
            let resp = ctx.res.as_ref().expect("response set above");
            if !resp.checking_disabled()
                && !self.filters.is_cache_excluded(domain.trim_end_matches('.'))
            {
                if let (Some(cache), Some(key)) = (&self.cache, key) {
                    cache.insert(key, resp, ctx.upstream.clone());
                }
            }
        }
    }

    /// Select candidate upstreams and run the exchange, consulting the
    /// fallback set on retryable failures (never for private RDNS).
    async fn exchange_with_fallbacks(
        &self,
        req: &Message,
        is_private: bool,
    ) -> Result<(Message, String), ExchangeError> {
        let upstreams = self.select_upstreams(req, is_private)?;
        if is_private {
            self.recursion.add(req);
        }

        let mut result = self.exchange(&upstreams, req).await;

        let bogus = matches!(&result, Ok((resp, _)) if self.is_bogus_nxdomain(resp));
        if bogus {
            debug!("answer contains bogus-nxdomain address");
            let (_, upstream) = result.expect("bogus check saw a response");
            return Ok((message::nxdomain(req), upstream));
        }

        if let Err(err) = &result {
            if err.is_retryable() && !is_private {
                if let Some(fallbacks) = &self.fallbacks {
                    debug!(%err, "using fallback upstreams");
                    counter!("dns.queries.fallback").increment(1);
                    let qname = req.queries()[0].name().to_utf8();
                    let set: Vec<UpstreamRef> = fallbacks.lookup(&qname).to_vec();
                    result = self.exchanges.exchange_parallel(&set, req).await;
                }
            }
        }

        result
    }

    async fn exchange(
        &self,
        upstreams: &[UpstreamRef],
        req: &Message,
    ) -> Result<(Message, String), ExchangeError> {
        match self.opts.mode {
            ExchangeMode::FastestAddr => self.fastest.exchange_fastest(upstreams, req).await,
            mode => self.exchanges.exchange(mode, upstreams, req).await,
        }
    }

    fn select_upstreams(
        &self,
        req: &Message,
        is_private: bool,
    ) -> Result<Vec<UpstreamRef>, ExchangeError> {
        let q = req.queries().first().ok_or(ExchangeError::NoUpstreams)?;
        let qname = q.name().to_utf8();

        if is_private {
            let set = match (&self.private_registry, self.opts.use_private_rdns) {
                (Some(private), true) => private.lookup(&qname).to_vec(),
                _ => Vec::new(),
            };
            if set.is_empty() {
                return Err(ExchangeError::NoUpstreams);
            }
            return Ok(set);
        }

        let set = if q.query_type() == RecordType::DS {
            self.registry.lookup_ds(&qname)
        } else {
            self.registry.lookup(&qname)
        };
        if set.is_empty() {
            return Err(ExchangeError::NoUpstreams);
        }
        Ok(set.to_vec())
    }

    /// Step 7: TTL clamping, DNS64 synthesis, question repair.
    async fn postprocess(&self, ctx: &DnsContext, resp: &mut Message, upstream: &str) {
        codec::clamp_ttls(resp, self.opts.cache_min_ttl, self.opts.cache_max_ttl);

        // Some upstreams answer with an empty question section; repair
        // it from the request before anything downstream indexes into
        // it.
        if resp.queries().is_empty() {
            if let Some(q) = ctx.req.queries().first() {
                resp.add_query(q.clone());
            }
        }

        if let Some(dns64) = &self.dns64 {
            if Dns64::should_synthesize(resp) {
                self.synthesize_dns64(ctx, resp, dns64, upstream).await;
            }
        }
    }

    /// Re-issue the query as type A and graft mapped AAAA records onto
    /// the empty AAAA response.
    async fn synthesize_dns64(
        &self,
        ctx: &DnsContext,
        resp: &mut Message,
        dns64: &Dns64,
        _upstream: &str,
    ) {
        let Some(q) = ctx.req.queries().first() else {
            return;
        };
        let mut a_req = Message::new();
        a_req
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(ctx.req.op_code())
            .set_recursion_desired(true);
        let mut a_query = q.clone();
        a_query.set_query_type(RecordType::A);
        a_req.add_query(a_query);

        let is_private = ctx.requested_private_rdns.is_some();
        match self.exchange_with_fallbacks(&a_req, is_private).await {
            Ok((a_resp, _)) => {
                let records = dns64.synthesize(&ctx.req, &a_resp);
                if !records.is_empty() {
                    debug!(count = records.len(), "synthesized dns64 answers");
                    counter!("dns.queries.dns64").increment(1);
                    for rr in records {
                        resp.add_answer(rr);
                    }
                    resp.set_response_code(ResponseCode::NoError);
                }
            }
            Err(err) => debug!(%err, "dns64 A lookup failed, leaving response as-is"),
        }
    }

    /// Replace a PTR question for a NAT64-mapped address with the
    /// embedded IPv4's reverse name.
    fn rewrite_nat64_ptr(&self, ctx: &mut DnsContext) {
        let Some(dns64) = &self.dns64 else {
            return;
        };
        let Some((q, domain)) = ctx.question() else {
            return;
        };
        if q.query_type() != RecordType::PTR {
            return;
        }
        let Some(prefix) = netutil::parse_reversed_addr(&domain) else {
            return;
        };
        let IpAddr::V6(v6) = prefix.addr() else {
            return;
        };
        let Some(v4) = dns64.extract(v6) else {
            return;
        };

        let name = netutil::ipv4_reverse_name(v4);
        debug!(mapped = %name, "rewriting nat64 ptr question");
        if let Ok(new_name) = hickory_proto::rr::Name::from_utf8(&name) {
            let mut query = ctx.req.queries()[0].clone();
            query.set_name(new_name);
            ctx.req = message::with_question(&ctx.req, query);
            // The embedded address decides whether this is private RDNS.
            ctx.requested_private_rdns = Some(Prefix::new(IpAddr::V4(v4), 32));
        }
    }

    fn is_bogus_nxdomain(&self, resp: &Message) -> bool {
        if self.bogus_nxdomain.is_empty() {
            return false;
        }
        resp.answers().iter().any(|rr| match rr.data() {
            Some(RData::A(a)) => self.bogus_nxdomain.contains(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => self.bogus_nxdomain.contains(IpAddr::V6(aaaa.0)),
            _ => false,
        })
    }

    /// Attach or pass through the ECS option (RFC 7871).
    fn process_ecs(&self, ctx: &mut DnsContext) {
        if let Some(existing) = ecs::ecs_from_msg(&ctx.req) {
            if existing.network.len() != 0 {
                debug!(network = %existing.network, "passing through client ecs");
                return;
            }
        }
        let client_ip = self.opts.edns_client_ip.unwrap_or_else(|| ctx.client.ip());
        if netutil::is_special_purpose(client_ip) {
            return;
        }
        let network = ecs::set_ecs(
            &mut ctx.req,
            client_ip,
            ecs::DEFAULT_PREFIX_V4,
            ecs::DEFAULT_PREFIX_V6,
        );
        debug!(network = %network, "attached ecs");
    }

    /// Step 9 prep: make the response safe to hand back to the client.
    fn scrub(&self, ctx: &mut DnsContext) {
        let Some(res) = ctx.res.as_mut() else {
            return;
        };
        res.set_id(ctx.req.id());
        if res.queries().is_empty() && !ctx.req.queries().is_empty() {
            res.add_query(ctx.req.queries()[0].clone());
        }
        codec::filter_response(res, ctx.ad_bit, ctx.do_bit);
        if !ctx.has_edns {
            // The failure path promises a plain header-only SERVFAIL.
            res.extensions_mut().take();
        }

        if res.answers().is_empty() {
            self.stats.increment("local::empty_answers", 1);
        } else {
            self.stats.increment("local::answers", 1);
        }
    }

    /// Background refresh of a stale cache entry, single-flighted and
    /// detached from the serving query.
    fn spawn_refresh(&self, key: Fingerprint, ctx: &DnsContext) {
        let Some(cache) = &self.cache else {
            return;
        };
        if !cache.begin_refresh(&key) {
            return;
        }

        let mut req = ctx.req.clone();
        codec::ensure_do(&mut req);
        let weak = Weak::clone(&self.weak_self);
        tokio::spawn(async move {
            // The proxy may be shutting down; a dead weak handle means
            // the refresh silently aborts.
            let Some(this) = weak.upgrade() else {
                return;
            };
            let exchange_this = Arc::clone(&this);
            let exchange_req = req.clone();
            let result = this
                .flights
                .run(&key, this.opts.timeout, move || async move {
                    exchange_this.exchange_with_fallbacks(&exchange_req, false).await
                })
                .await;

            let Some(cache) = &this.cache else {
                return;
            };
            match result {
                Ok((resp, upstream)) => {
                    debug!(upstream, "optimistic refresh complete");
                    if !cache.insert(key.clone(), &resp, Some(upstream)) {
                        cache.cancel_refresh(&key);
                    }
                }
                Err(err) => {
                    debug!(%err, "optimistic refresh failed, keeping stale entry");
                    cache.cancel_refresh(&key);
                }
            }
        });
    }

    fn is_private(&self, ip: IpAddr) -> bool {
        if self.private_subnets.is_empty() {
            netutil::is_locally_served(ip)
        } else {
            self.private_subnets.contains(ip)
        }
    }
}

/// Log an error the way the listeners expect: noisy for real problems,
/// quiet for disconnects.
pub(crate) fn log_io_error(err: &std::io::Error, what: &str, proto: Proto) {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
        | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            debug!(proto = proto.as_str(), %err, "{what}");
        }
        _ => error!(proto = proto.as_str(), %err, "{what}"),
    }
}
