//! TTL-aware response cache with optional optimistic serving.
//!
//! Entries are keyed by question fingerprint and bounded in bytes: the
//! weigher counts the serialized message length, so the configured cache
//! size is an actual memory budget. Expired entries stick around for the
//! optimistic window and are served stale while a background refresh
//! (single-flighted by the resolver) replaces them.

pub mod singleflight;

pub use singleflight::SingleFlight;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RData;
use moka::sync::Cache;
use moka::Expiry;

use crate::dns::codec;
use crate::dns::Fingerprint;

/// How long an expired entry remains servable in optimistic mode.
pub const OPTIMISTIC_TTL: Duration = Duration::from_secs(600);

/// TTL put on answers served from an expired entry.
const STALE_SERVE_TTL: u32 = 10;

/// Cache tuning knobs, mirrored from the configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total budget in serialized-message bytes.
    pub size_bytes: u64,
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub optimistic: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_bytes: 64 * 1024,
            min_ttl: 0,
            max_ttl: 0,
            optimistic: false,
        }
    }
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum CacheLookup {
    Miss,
    /// A live entry; serve as-is.
    Fresh(CachedResponse),
    /// An expired entry inside the optimistic window; serve immediately
    /// and refresh in the background.
    Stale(CachedResponse),
}

/// A response rebuilt from the cache for one specific request.
#[derive(Debug)]
pub struct CachedResponse {
    pub msg: Message,
    /// Address of the upstream that produced the stored answer.
    pub upstream: Option<String>,
}

struct CacheEntry {
    wire: Vec<u8>,
    stored_at: Instant,
    /// Seconds the entry is fresh for, already clamped.
    ttl: u32,
    upstream: Option<String>,
    refreshing: AtomicBool,
}

struct EntryExpiry {
    optimistic: bool,
}

impl Expiry<Fingerprint, Arc<CacheEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        value: &Arc<CacheEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        let fresh = Duration::from_secs(u64::from(value.ttl));
        Some(if self.optimistic {
            fresh + OPTIMISTIC_TTL
        } else {
            fresh
        })
    }
}

/// The response cache.
pub struct ResponseCache {
    entries: Cache<Fingerprint, Arc<CacheEntry>>,
    config: CacheConfig,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.size_bytes)
            .weigher(|_key: &Fingerprint, value: &Arc<CacheEntry>| value.wire.len() as u32)
            .expire_after(EntryExpiry {
                optimistic: config.optimistic,
            })
            .build();
        Self { entries, config }
    }

    /// Look up the response for `req`. Fresh hits and, in optimistic
    /// mode, recently-expired hits produce a servable message with its
    /// id rewritten to the request's and TTLs reduced by the entry age.
    pub fn get(&self, req: &Message, key: &Fingerprint) -> CacheLookup {
        let Some(entry) = self.entries.get(key) else {
            return CacheLookup::Miss;
        };

        let age = entry.stored_at.elapsed();
        let fresh_for = Duration::from_secs(u64::from(entry.ttl));
        if age < fresh_for {
            return CacheLookup::Fresh(self.rebuild(req, &entry, age, false));
        }
        if self.config.optimistic && age < fresh_for + OPTIMISTIC_TTL {
            return CacheLookup::Stale(self.rebuild(req, &entry, age, true));
        }

        self.entries.invalidate(key);
        CacheLookup::Miss
    }

    /// Store a response. Returns false when the message is not cacheable
    /// (uncacheable rcode, or no usable TTL source).
    pub fn insert(&self, key: Fingerprint, msg: &Message, upstream: Option<String>) -> bool {
        let Some(ttl) = self.storage_ttl(msg) else {
            return false;
        };
        let Ok(wire) = codec::encode(msg) else {
            return false;
        };

        self.entries.insert(
            key,
            Arc::new(CacheEntry {
                wire,
                stored_at: Instant::now(),
                ttl,
                upstream,
                refreshing: AtomicBool::new(false),
            }),
        );
        true
    }

    /// Claim the refresh slot for a stale entry. Only one caller gets
    /// true per entry; the refresh ends when the entry is replaced by
    /// [`insert`](Self::insert) or released by [`cancel_refresh`].
    pub fn begin_refresh(&self, key: &Fingerprint) -> bool {
        match self.entries.get(key) {
            Some(entry) => entry
                .refreshing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    /// Release the refresh flag after a failed background refresh,
    /// keeping the stale entry servable.
    pub fn cancel_refresh(&self, key: &Fingerprint) {
        if let Some(entry) = self.entries.get(key) {
            entry.refreshing.store(false, Ordering::Release);
        }
    }

    /// Number of live entries (after pending maintenance).
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rebuild(&self, req: &Message, entry: &CacheEntry, age: Duration, stale: bool) -> CachedResponse {
        let mut msg = codec::decode(&entry.wire).unwrap_or_else(|_| {
            // The cache only stores messages it just serialized; decode
            // cannot fail short of memory corruption.
            crate::dns::message::servfail(req)
        });
        msg.set_id(req.id());

        let age_secs = age.as_secs().min(u64::from(u32::MAX)) as u32;
        for rr in msg.answers_mut() {
            let remaining = if stale {
                STALE_SERVE_TTL
            } else {
                codec::clamp_ttl(
                    rr.ttl().saturating_sub(age_secs),
                    self.config.min_ttl,
                    self.config.max_ttl,
                )
            };
            rr.set_ttl(remaining);
        }

        CachedResponse {
            msg,
            upstream: entry.upstream.clone(),
        }
    }

    /// The freshness TTL to store a response under, or `None` when the
    /// response must not be cached.
    fn storage_ttl(&self, msg: &Message) -> Option<u32> {
        let ttl = match msg.response_code() {
            ResponseCode::NoError => match codec::min_answer_ttl(msg) {
                Some(min) => min,
                // NODATA: negative-cache using the SOA minimum.
                None => self.soa_minimum(msg).unwrap_or(self.config.min_ttl),
            },
            ResponseCode::NXDomain => self.soa_minimum(msg).unwrap_or(self.config.min_ttl),
            _ => return None,
        };
        Some(codec::clamp_ttl(ttl, self.config.min_ttl, self.config.max_ttl))
    }

    fn soa_minimum(&self, msg: &Message) -> Option<u32> {
        msg.name_servers().iter().find_map(|rr| match rr.data() {
            Some(RData::SOA(soa)) => Some(soa.minimum().min(rr.ttl())),
            _ => None,
        })
    }
}
