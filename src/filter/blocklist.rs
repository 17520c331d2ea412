//! Blocked-domain bookkeeping on top of [`DomainMatcher`].
//!
//! Tracks which list every pattern came from (for per-list statistics),
//! counts duplicates without storing them twice, and honors an exclusion
//! list whose entries must never be blocked.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;

use super::matcher::{DomainMatcher, PatternMatch};

/// Result of loading one blocklist source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub added: usize,
    pub duplicates: usize,
    pub excluded: usize,
}

/// The set of blocked domains, hot-reloadable behind shared references.
#[derive(Debug, Default)]
pub struct BlockedDomains {
    matcher: RwLock<DomainMatcher>,
    /// pattern -> index into `lists`.
    sources: RwLock<HashMap<String, usize>>,
    lists: RwLock<Vec<String>>,
}

impl BlockedDomains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load patterns from one named list. Lines starting with `#` or `!`
    /// are comments. Domains matching `exclusions` are skipped, repeated
    /// patterns are counted but stored once.
    pub fn load<'a, I>(&self, lines: I, list_name: &str, exclusions: &DomainMatcher) -> LoadSummary
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut summary = LoadSummary::default();

        let list_index = {
            let mut lists = self.lists.write();
            match lists.iter().position(|l| l == list_name) {
                Some(i) => i,
                None => {
                    lists.push(list_name.to_string());
                    lists.len() - 1
                }
            }
        };

        let mut matcher = self.matcher.write();
        let mut sources = self.sources.write();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if exclusions.check(line).is_some() {
                summary.excluded += 1;
                continue;
            }
            if matcher.insert(line) {
                summary.added += 1;
                sources.insert(normalize(line), list_index);
            } else {
                summary.duplicates += 1;
            }
        }

        summary
    }

    /// Check a domain; on a hit, also name the list the pattern came from.
    pub fn check(&self, domain: &str) -> Option<(PatternMatch, String)> {
        let hit = self.matcher.read().check(domain)?;
        let list = self
            .sources
            .read()
            .get(&hit.pattern)
            .and_then(|&i| self.lists.read().get(i).cloned())
            .unwrap_or_else(|| "unknown".to_string());
        Some((hit, list))
    }

    pub fn len(&self) -> usize {
        self.matcher.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.matcher.read().is_empty()
    }

    /// Drop every pattern, keeping the instance shareable.
    pub fn clear(&self) {
        *self.matcher.write() = DomainMatcher::new();
        self.sources.write().clear();
        self.lists.write().clear();
    }
}

fn normalize(pattern: &str) -> String {
    pattern.trim().trim_end_matches('.').to_lowercase()
}

/// Read a domain-list file. The file name (without extension) becomes the
/// list name used in statistics.
pub async fn load_file(
    blocked: &BlockedDomains,
    path: &Path,
    exclusions: &DomainMatcher,
) -> std::io::Result<LoadSummary> {
    let content = tokio::fs::read_to_string(path).await?;
    let list_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    Ok(blocked.load(content.lines(), &list_name, exclusions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn should_skip_comments_and_blank_lines() {
        let blocked = BlockedDomains::new();
        let summary = blocked.load(
            ["# comment", "! other comment", "", "ads.example.com"],
            "test",
            &DomainMatcher::new(),
        );
        assert_eq!(summary.added, 1);
        assert_eq!(blocked.len(), 1);
    }

    #[test]
    fn should_count_duplicates_without_storing_them() {
        let blocked = BlockedDomains::new();
        let summary = blocked.load(
            ["ads.example.com", "ads.example.com", "*.tracker.net"],
            "test",
            &DomainMatcher::new(),
        );
        assert_eq!(summary.added, 2);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(blocked.len(), 2);
    }

    #[test]
    fn should_honor_exclusions() {
        let exclusions = DomainMatcher::from_patterns(["good.example.com", "*.corp.example"]);
        let blocked = BlockedDomains::new();
        let summary = blocked.load(
            ["good.example.com", "x.corp.example", "ads.example.com"],
            "test",
            &exclusions,
        );
        assert_eq!(summary.added, 1);
        assert_eq!(summary.excluded, 2);
        assert!(blocked.check("good.example.com").is_none());
        assert!(blocked.check("ads.example.com").is_some());
    }

    #[test]
    fn should_remember_which_list_a_pattern_came_from() {
        let blocked = BlockedDomains::new();
        blocked.load(["ads.example.com"], "easylist", &DomainMatcher::new());
        blocked.load(["tracker.net"], "trackers", &DomainMatcher::new());

        let (_, list) = blocked.check("ads.example.com").unwrap();
        assert_eq!(list, "easylist");
        let (_, list) = blocked.check("tracker.net").unwrap();
        assert_eq!(list, "trackers");
    }

    #[test]
    fn should_clear_all_patterns() {
        let blocked = BlockedDomains::new();
        blocked.load(["ads.example.com"], "test", &DomainMatcher::new());
        blocked.clear();
        assert!(blocked.is_empty());
        assert!(blocked.check("ads.example.com").is_none());
    }

    #[tokio::test]
    async fn should_load_patterns_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# sample list").unwrap();
        writeln!(file, "ads.example.com").unwrap();
        writeln!(file, "*.banners.example").unwrap();
        file.flush().unwrap();

        let blocked = BlockedDomains::new();
        let summary = load_file(&blocked, file.path(), &DomainMatcher::new())
            .await
            .unwrap();

        assert_eq!(summary.added, 2);
        assert!(blocked.check("x.banners.example").is_some());
    }
}
