//! Upstream selection modes and round-trip-time bookkeeping.
//!
//! `load_balance` picks one upstream by weighted random over inverse
//! EWMA latency and walks the rest on failure; `parallel` races every
//! candidate and takes the first success; `fastest_addr` is layered on
//! top by the fastest-IP selector.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use super::UpstreamRef;
use crate::error::ExchangeError;

/// How the engine spreads queries over the selected upstream set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeMode {
    #[default]
    LoadBalance,
    Parallel,
    FastestAddr,
}

/// Rolling RTT statistics for one upstream (EWMA mean and variance).
#[derive(Debug, Clone, Copy, Default)]
pub struct RttStats {
    mean_us: f64,
    var_us: f64,
    samples: u64,
}

/// EWMA smoothing factor.
const ALPHA: f64 = 0.25;

/// Additive smoothing so brand-new upstreams are not infinitely
/// attractive.
const WEIGHT_EPSILON_US: f64 = 1_000.0;

impl RttStats {
    fn record(&mut self, rtt: Duration) {
        let rtt_us = rtt.as_micros() as f64;
        if self.samples == 0 {
            self.mean_us = rtt_us;
            self.var_us = 0.0;
        } else {
            let delta = rtt_us - self.mean_us;
            self.mean_us += ALPHA * delta;
            self.var_us = (1.0 - ALPHA) * (self.var_us + ALPHA * delta * delta);
        }
        self.samples += 1;
    }

    pub fn mean(&self) -> Duration {
        Duration::from_micros(self.mean_us as u64)
    }

    fn weight(&self) -> f64 {
        1.0 / (self.mean_us + WEIGHT_EPSILON_US)
    }
}

/// The exchange executor shared by the resolver engine.
#[derive(Default)]
pub struct Exchanges {
    rtt: Mutex<HashMap<String, RttStats>>,
}

impl Exchanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exchange `req` against `upstreams` using `mode`. Returns the
    /// response and the address of the upstream that produced it.
    pub async fn exchange(
        &self,
        mode: ExchangeMode,
        upstreams: &[UpstreamRef],
        req: &Message,
    ) -> Result<(Message, String), ExchangeError> {
        match mode {
            ExchangeMode::LoadBalance => self.exchange_load_balance(upstreams, req).await,
            // FastestAddr degenerates to Parallel here; the fastest-IP
            // selector wraps this call with its probing layer.
            ExchangeMode::Parallel | ExchangeMode::FastestAddr => {
                self.exchange_parallel(upstreams, req).await
            }
        }
    }

    /// Weighted-random first pick, sequential walk over the remainder.
    async fn exchange_load_balance(
        &self,
        upstreams: &[UpstreamRef],
        req: &Message,
    ) -> Result<(Message, String), ExchangeError> {
        if upstreams.is_empty() {
            return Err(ExchangeError::NoUpstreams);
        }

        let order = self.pick_order(upstreams);
        let mut last_err = ExchangeError::NoUpstreams;
        for idx in order {
            let upstream = &upstreams[idx];
            let started = Instant::now();
            match upstream.exchange(req).await {
                Ok(resp) => {
                    self.record(upstream.address(), started.elapsed());
                    return Ok((resp, upstream.address().to_string()));
                }
                Err(err) => {
                    debug!(address = upstream.address(), %err, "upstream failed, trying next");
                    // A failure costs double its elapsed time in the
                    // stats, pushing the upstream down the order.
                    self.record(upstream.address(), started.elapsed() * 2);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Race all upstreams, first success wins; losers are cancelled and
    /// their errors discarded.
    pub async fn exchange_parallel(
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
                let started = Instant::now();
                let result = upstream.exchange(&req).await;
                (upstream.address().to_string(), started.elapsed(), result)
            });
        }

        let mut last_err = ExchangeError::NoUpstreams;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((address, elapsed, Ok(resp))) => {
                    self.record(&address, elapsed);
                    return Ok((resp, address));
                }
                Ok((address, elapsed, Err(err))) => {
                    self.record(&address, elapsed * 2);
                    last_err = err;
                }
                Err(join_err) => {
                    last_err = ExchangeError::connection("parallel exchange", join_err);
                }
            }
        }
        Err(last_err)
    }

    /// Snapshot of the stats for one upstream.
    pub fn stats_for(&self, address: &str) -> Option<RttStats> {
        self.rtt.lock().get(address).copied()
    }

    fn record(&self, address: &str, rtt: Duration) {
        self.rtt.lock().entry(address.to_string()).or_default().record(rtt);
    }

    /// Index order for the load-balance walk: a weighted-random first
    /// pick by inverse latency, then the rest fastest-first.
    fn pick_order(&self, upstreams: &[UpstreamRef]) -> Vec<usize> {
        let weights: Vec<f64> = {
            let rtt = self.rtt.lock();
            upstreams
                .iter()
                .map(|u| rtt.get(u.address()).copied().unwrap_or_default().weight())
                .collect()
        };

        let total: f64 = weights.iter().sum();
        let mut pick = 0;
        if total > 0.0 {
            let mut roll = rand::thread_rng().gen_range(0.0..total);
            for (i, w) in weights.iter().enumerate() {
                if roll < *w {
                    pick = i;
                    break;
                }
                roll -= w;
            }
        }

        let mut rest: Vec<usize> = (0..upstreams.len()).filter(|&i| i != pick).collect();
        rest.sort_by(|&a, &b| weights[b].partial_cmp(&weights[a]).unwrap_or(std::cmp::Ordering::Equal));

        let mut order = Vec::with_capacity(upstreams.len());
        order.push(pick);
        order.extend(rest);
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::testutil::MockExchanger;
    use hickory_proto::op::{Query, ResponseCode};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn request(id: u16) -> Message {
        let mut q = Query::new();
        q.set_name(Name::from_str("example.com.").unwrap());
        q.set_query_type(RecordType::A);
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_query(q);
        msg
    }

    fn response(rcode: ResponseCode) -> Message {
        let mut msg = Message::new();
        msg.set_response_code(rcode);
        msg
    }

    #[tokio::test]
    async fn should_answer_from_single_upstream() {
        let exchanges = Exchanges::new();
        let upstream = MockExchanger::answering("udp://1.1.1.1:53", response(ResponseCode::NoError));

        let (resp, address) = exchanges
            .exchange(ExchangeMode::LoadBalance, &[upstream.clone()], &request(5))
            .await
            .unwrap();
        assert_eq!(resp.id(), 5);
        assert_eq!(address, "udp://1.1.1.1:53");
        assert_eq!(upstream.call_count(), 1);
    }

    #[tokio::test]
    async fn should_walk_to_next_upstream_on_failure() {
        let exchanges = Exchanges::new();
        let failing = MockExchanger::failing(
            "udp://192.0.2.1:53",
            ExchangeError::timeout("udp://192.0.2.1:53"),
        );
        let healthy =
            MockExchanger::answering("udp://1.1.1.1:53", response(ResponseCode::NoError));

        let (resp, address) = exchanges
            .exchange(
                ExchangeMode::LoadBalance,
                &[failing.clone(), healthy.clone()],
                &request(9),
            )
            .await
            .unwrap();
        assert_eq!(resp.id(), 9);
        assert_eq!(address, "udp://1.1.1.1:53");
        assert_eq!(failing.call_count() + healthy.call_count(), 2);
    }

    #[tokio::test]
    async fn should_fail_when_all_upstreams_fail() {
        let exchanges = Exchanges::new();
        let a = MockExchanger::failing("udp://192.0.2.1:53", ExchangeError::timeout("a"));
        let b = MockExchanger::failing(
            "udp://192.0.2.2:53",
            ExchangeError::connection("b", "refused"),
        );

        let err = exchanges
            .exchange(ExchangeMode::LoadBalance, &[a, b], &request(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn should_use_first_parallel_success() {
        let exchanges = Exchanges::new();
        let slow = MockExchanger::answering("udp://9.9.9.9:53", response(ResponseCode::NoError));
        *slow.delay.lock() = Some(Duration::from_millis(200));
        let fast = MockExchanger::answering("udp://1.1.1.1:53", response(ResponseCode::NoError));

        let started = Instant::now();
        let (_, address) = exchanges
            .exchange(ExchangeMode::Parallel, &[slow, fast], &request(2))
            .await
            .unwrap();
        assert_eq!(address, "udp://1.1.1.1:53");
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn should_succeed_in_parallel_mode_despite_failures() {
        let exchanges = Exchanges::new();
        let failing = MockExchanger::failing("udp://192.0.2.1:53", ExchangeError::timeout("x"));
        let healthy = MockExchanger::answering("udp://1.1.1.1:53", response(ResponseCode::NoError));

        let (_, address) = exchanges
            .exchange(ExchangeMode::Parallel, &[failing, healthy], &request(3))
            .await
            .unwrap();
        assert_eq!(address, "udp://1.1.1.1:53");
    }

    #[tokio::test]
    async fn should_report_no_upstreams_for_empty_set() {
        let exchanges = Exchanges::new();
        let err = exchanges
            .exchange(ExchangeMode::LoadBalance, &[], &request(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NoUpstreams));
    }

    #[tokio::test]
    async fn should_prefer_faster_upstreams_over_time() {
        let exchanges = Exchanges::new();
        exchanges.record("udp://fast:53", Duration::from_millis(5));
        exchanges.record("udp://slow:53", Duration::from_millis(500));

        let fast_weight = exchanges.stats_for("udp://fast:53").unwrap().weight();
        let slow_weight = exchanges.stats_for("udp://slow:53").unwrap().weight();
        assert!(fast_weight > slow_weight * 10.0);
    }

    #[test]
    fn should_track_ewma_mean() {
        let mut stats = RttStats::default();
        stats.record(Duration::from_millis(100));
        assert_eq!(stats.mean(), Duration::from_millis(100));

        stats.record(Duration::from_millis(200));
        let mean = stats.mean();
        assert!(mean > Duration::from_millis(100) && mean < Duration::from_millis(200));
    }
}
