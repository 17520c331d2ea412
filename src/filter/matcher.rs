//! Domain pattern matching with a reversed-label trie.
//!
//! Patterns are either exact domains (`ads.example.com`) or wildcards
//! (`*.example.com`). Labels are stored right-to-left, so a lookup walks
//! from the TLD inward and the deepest terminal node wins. Exact matches
//! beat wildcard matches for the same domain.

use std::collections::HashMap;

/// How a pattern matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Wildcard,
}

/// A successful lookup: the pattern that matched and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub pattern: String,
    pub kind: MatchKind,
}

#[derive(Debug, Default, Clone)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    /// Terminal for an exact pattern ending at this node.
    exact: bool,
    /// Terminal for a `*.suffix` pattern whose suffix ends here.
    wildcard: bool,
}

/// A compiled set of domain patterns.
///
/// Lookups never allocate beyond the lowercased input; inserts happen on
/// (re)load only. Shared instances live behind a `parking_lot::RwLock`
/// owned by the filter set.
#[derive(Debug, Default, Clone)]
pub struct DomainMatcher {
    root: TrieNode,
    len: usize,
}

impl DomainMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a matcher from an iterator of patterns.
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::new();
        for p in patterns {
            matcher.insert(p.as_ref());
        }
        matcher
    }

    /// Insert a pattern. Returns false when the identical pattern was
    /// already present (duplicates are counted by callers, not stored).
    pub fn insert(&mut self, pattern: &str) -> bool {
        let pattern = normalize(pattern);
        let (wildcard, suffix) = match pattern.strip_prefix("*.") {
            Some(rest) => (true, rest),
            None => (false, pattern.as_str()),
        };
        if suffix.is_empty() {
            return false;
        }

        let mut node = &mut self.root;
        for label in suffix.rsplit('.') {
            node = node.children.entry(label.to_string()).or_default();
        }

        let flag = if wildcard {
            &mut node.wildcard
        } else {
            &mut node.exact
        };
        if *flag {
            return false;
        }
        *flag = true;
        self.len += 1;
        true
    }

    /// Look `domain` up, returning the most specific matching pattern.
    ///
    /// A wildcard terminal only matches when at least one label remains
    /// unconsumed, so `*.s` never matches `s` itself.
    pub fn check(&self, domain: &str) -> Option<PatternMatch> {
        let domain = normalize(domain);
        if domain.is_empty() {
            return None;
        }
        let labels: Vec<&str> = domain.rsplit('.').collect();

        let mut node = &self.root;
        let mut best_wildcard: Option<usize> = None;
        for (depth, label) in labels.iter().enumerate() {
            match node.children.get(*label) {
                Some(child) => node = child,
                None => break,
            }
            let consumed = depth + 1;
            if node.wildcard && consumed < labels.len() {
                best_wildcard = Some(consumed);
            }
            if node.exact && consumed == labels.len() {
                return Some(PatternMatch {
                    pattern: domain,
                    kind: MatchKind::Exact,
                });
            }
        }

        best_wildcard.map(|consumed| {
            let suffix = labels[..consumed]
                .iter()
                .rev()
                .copied()
                .collect::<Vec<_>>()
                .join(".");
            PatternMatch {
                pattern: format!("*.{suffix}"),
                kind: MatchKind::Wildcard,
            }
        })
    }

    /// Number of stored patterns.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_match_exact_domains() {
        let m = DomainMatcher::from_patterns(["ads.example.com", "tracker.net"]);

        let hit = m.check("ads.example.com").unwrap();
        assert_eq!(hit.kind, MatchKind::Exact);
        assert_eq!(hit.pattern, "ads.example.com");

        assert!(m.check("example.com").is_none());
        assert!(m.check("sub.ads.example.com").is_none());
    }

    #[test]
    fn should_match_wildcard_subdomains_only() {
        let m = DomainMatcher::from_patterns(["*.ads.example"]);

        let hit = m.check("banner.ads.example").unwrap();
        assert_eq!(hit.kind, MatchKind::Wildcard);
        assert_eq!(hit.pattern, "*.ads.example");

        assert!(m.check("a.b.ads.example").is_some());
        // The bare suffix does not match its own wildcard.
        assert!(m.check("ads.example").is_none());
    }

    #[test]
    fn should_prefer_exact_over_wildcard() {
        let m = DomainMatcher::from_patterns(["*.example.com", "www.example.com"]);

        let hit = m.check("www.example.com").unwrap();
        assert_eq!(hit.kind, MatchKind::Exact);

        let hit = m.check("other.example.com").unwrap();
        assert_eq!(hit.kind, MatchKind::Wildcard);
    }

    #[test]
    fn should_return_most_specific_wildcard() {
        let m = DomainMatcher::from_patterns(["*.example.com", "*.ads.example.com"]);

        let hit = m.check("x.ads.example.com").unwrap();
        assert_eq!(hit.pattern, "*.ads.example.com");

        let hit = m.check("x.other.example.com").unwrap();
        assert_eq!(hit.pattern, "*.example.com");
    }

    #[test]
    fn should_ignore_case_and_trailing_dots() {
        let m = DomainMatcher::from_patterns(["Example.COM."]);
        assert!(m.check("EXAMPLE.com.").is_some());
        assert!(m.check("example.com").is_some());
    }

    #[test]
    fn should_not_store_duplicates() {
        let mut m = DomainMatcher::new();
        assert!(m.insert("example.com"));
        assert!(!m.insert("example.com"));
        assert!(m.insert("*.example.com"));
        assert!(!m.insert("*.example.com"));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn should_handle_unrelated_tlds() {
        let m = DomainMatcher::from_patterns(["example.com"]);
        assert!(m.check("example.org").is_none());
        assert!(m.check("com").is_none());
    }

    #[test]
    fn should_reject_empty_patterns() {
        let mut m = DomainMatcher::new();
        assert!(!m.insert(""));
        assert!(!m.insert("*."));
        assert!(m.is_empty());
    }
}
