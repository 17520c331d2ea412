//! Domain filtering: pattern matching, blocklists, and the exclusion
//! lists consulted by the resolver engine.

pub mod blocklist;
pub mod matcher;

pub use blocklist::{BlockedDomains, LoadSummary};
pub use matcher::{DomainMatcher, MatchKind, PatternMatch};

use parking_lot::RwLock;

/// All domain filters used on the query path.
///
/// `exclusions` lists domains that must never be blocked (applied while
/// loading blocklists); `cache_exclusions` lists domains whose responses
/// must never enter the cache.
#[derive(Debug, Default)]
pub struct Filters {
    pub blocked: BlockedDomains,
    pub exclusions: RwLock<DomainMatcher>,
    pub cache_exclusions: RwLock<DomainMatcher>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a response for `domain` may be cached.
    pub fn is_cache_excluded(&self, domain: &str) -> bool {
        self.cache_exclusions.read().check(domain).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_report_cache_exclusions() {
        let filters = Filters::new();
        *filters.cache_exclusions.write() =
            DomainMatcher::from_patterns(["*.dynamic.example", "nocache.example.com"]);

        assert!(filters.is_cache_excluded("host.dynamic.example"));
        assert!(filters.is_cache_excluded("nocache.example.com"));
        assert!(!filters.is_cache_excluded("example.com"));
    }
}
