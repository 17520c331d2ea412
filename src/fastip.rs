//! Fastest-address upstream mode.
//!
//! Queries every selected upstream in parallel, probes the answered
//! addresses with short TCP connects, and returns the response owning
//! the address that answered quickest. Falls back to the first received
//! response when probing is inconclusive.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use moka::sync::Cache;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ExchangeError;
use crate::upstream::UpstreamRef;

/// Default probe budget, overridable from configuration.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Ports tried by the TCP probe, in order of preference.
const PROBE_PORTS: [u16; 2] = [443, 80];

/// Probe results stay valid this long.
const PING_CACHE_TTL: Duration = Duration::from_secs(600);

const PING_CACHE_CAPACITY: u64 = 4_096;

/// Picks the A/AAAA answer with the lowest observed latency.
pub struct FastestAddr {
    ping_timeout: Duration,
    /// ip -> RTT in microseconds from an earlier probe.
    ping_cache: Cache<IpAddr, u64>,
}

impl FastestAddr {
    pub fn new(ping_timeout: Duration) -> Self {
        Self {
            ping_timeout,
            ping_cache: Cache::builder()
                .max_capacity(PING_CACHE_CAPACITY)
                .time_to_live(PING_CACHE_TTL)
                .build(),
        }
    }

    /// Query all upstreams and pick the response with the fastest
    /// address.
    pub async fn exchange_fastest(
        &self,
        upstreams: &[UpstreamRef],
        req: &Message,
    ) -> Result<(Message, String), ExchangeError> {
        if upstreams.is_empty() {
            return Err(ExchangeError::NoUpstreams);
        }

        let mut tasks = tokio::task::JoinSet::new();
        for upstream in upstreams {
            let upstream = UpstreamRef::clone(upstream);
            let req = req.clone();
            tasks.spawn(async move {
                let result = upstream.exchange(&req).await;
                (upstream.address().to_string(), result)
            });
        }

        let mut responses: Vec<(Message, String)> = Vec::new();
        let mut last_err = ExchangeError::NoUpstreams;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((address, Ok(resp))) => responses.push((resp, address)),
                Ok((_, Err(err))) => last_err = err,
                Err(join_err) => {
                    last_err = ExchangeError::connection("fastest-addr exchange", join_err)
                }
            }
        }
        if responses.is_empty() {
            return Err(last_err);
        }

        let candidates = answer_addrs(&responses);
        if candidates.len() < 2 {
            return Ok(responses.swap_remove(0));
        }

        match self.probe(&candidates).await {
            Some((winner, rtt)) => {
                debug!(ip = %winner, ?rtt, "fastest address selected");
                let idx = responses
                    .iter()
                    .position(|(resp, _)| answer_contains(resp, winner))
                    .unwrap_or(0);
                Ok(responses.swap_remove(idx))
            }
            None => {
                debug!("no probe succeeded, using first response");
                Ok(responses.swap_remove(0))
            }
        }
    }

    /// TCP-probe all candidates in parallel; the first address to accept
    /// a connection is the winner. Cached results short-circuit.
    async fn probe(&self, candidates: &[IpAddr]) -> Option<(IpAddr, Duration)> {
        if let Some(cached) = candidates
            .iter()
            .filter_map(|&ip| self.ping_cache.get(&ip).map(|us| (ip, Duration::from_micros(us))))
            .min_by_key(|&(_, rtt)| rtt)
        {
            return Some(cached);
        }

        let mut tasks = tokio::task::JoinSet::new();
        for &ip in candidates {
            tasks.spawn(async move {
                let started = Instant::now();
                for port in PROBE_PORTS {
                    if TcpStream::connect(SocketAddr::new(ip, port)).await.is_ok() {
                        return Some((ip, started.elapsed()));
                    }
                }
                None
            });
        }

        let result = tokio::time::timeout(self.ping_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok(Some((ip, rtt))) = joined {
                    return Some((ip, rtt));
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        if let Some((ip, rtt)) = result {
            self.ping_cache.insert(ip, rtt.as_micros() as u64);
        }
        result
    }
}

/// All distinct A/AAAA addresses across the responses.
fn answer_addrs(responses: &[(Message, String)]) -> Vec<IpAddr> {
    let mut addrs = Vec::new();
    for (resp, _) in responses {
        for rr in resp.answers() {
            let ip = match rr.data() {
                Some(RData::A(a)) => IpAddr::V4(a.0),
                Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
                _ => continue,
            };
            if !addrs.contains(&ip) {
                addrs.push(ip);
            }
        }
    }
    addrs
}

fn answer_contains(resp: &Message, ip: IpAddr) -> bool {
    resp.answers().iter().any(|rr| match rr.data() {
        Some(RData::A(a)) => IpAddr::V4(a.0) == ip,
        Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0) == ip,
        _ => false,
    })
}
