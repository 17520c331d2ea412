//! The upstream registry: which servers answer which domains.
//!
//! Built once from the parsed spec lines. Besides the ordered default
//! set, reserved domains live in a reversed-label trie; the longest
//! matching suffix decides, and a suffix reserved with an empty upstream
//! list (`[/domain/]#`) explicitly routes back to the default set
//! without letting a shorter reserved suffix apply.

use std::collections::HashMap;

use tracing::debug;

use super::{UpstreamOptions, UpstreamRef, UpstreamSpec};
use crate::error::ConfigError;

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    /// `Some(vec)` marks a reserved suffix; an empty vec is the
    /// explicit "use default" state.
    upstreams: Option<Vec<UpstreamRef>>,
}

/// Maps query names to their candidate upstream set.
pub struct Registry {
    default: Vec<UpstreamRef>,
    reserved: TrieNode,
}

impl Registry {
    /// Build the registry, constructing one client per distinct address.
    pub fn from_specs(specs: &[UpstreamSpec], opts: &UpstreamOptions) -> Result<Self, ConfigError> {
        let mut registry = Self {
            default: Vec::new(),
            reserved: TrieNode::default(),
        };
        // The same address may appear on several lines; share the client.
        let mut built: HashMap<String, UpstreamRef> = HashMap::new();

        for spec in specs {
            let upstream = match &spec.addr {
                Some(addr) => {
                    let key = format!("{addr:?}");
                    Some(
                        built
                            .entry(key)
                            .or_insert_with(|| addr.clone().build(opts))
                            .clone(),
                    )
                }
                None => None,
            };

            if spec.domains.is_empty() {
                if let Some(upstream) = upstream {
                    registry.default.push(upstream);
                }
                continue;
            }

            for domain in &spec.domains {
                if domain.is_empty() {
                    // `[//]addr`: default only.
                    if let Some(upstream) = upstream.clone() {
                        registry.default.push(upstream);
                    }
                    continue;
                }
                let node = registry.reserve(domain);
                match upstream.clone() {
                    Some(upstream) => node.push(upstream),
                    // `#`: make sure the reserved (empty) state exists.
                    None => {}
                }
            }
        }

        if registry.default.is_empty() {
            return Err(ConfigError::Validation(
                "at least one default upstream is required".into(),
            ));
        }
        Ok(registry)
    }

    /// Registry with only a default set; used by fallbacks and tests.
    pub fn from_default(default: Vec<UpstreamRef>) -> Self {
        Self {
            default,
            reserved: TrieNode::default(),
        }
    }

    /// Reserve `domain` for `upstream` on an already-built registry.
    /// Test fixtures only; production registries come from specs.
    #[cfg(test)]
    pub(crate) fn reserve_for_test(&mut self, domain: &str, upstream: UpstreamRef) {
        self.reserve(domain).push(upstream);
    }

    fn reserve(&mut self, domain: &str) -> &mut Vec<UpstreamRef> {
        let mut node = &mut self.reserved;
        for label in domain.rsplit('.') {
            node = node.children.entry(label.to_string()).or_default();
        }
        node.upstreams.get_or_insert_with(Vec::new)
    }

    /// The candidate upstreams for `qname`: the longest reserved suffix
    /// match, or the default set.
    pub fn lookup(&self, qname: &str) -> &[UpstreamRef] {
        let domain = qname.trim_end_matches('.').to_lowercase();
        let mut node = &self.reserved;
        let mut best: Option<&Vec<UpstreamRef>> = None;
        for label in domain.rsplit('.') {
            match node.children.get(label) {
                Some(child) => node = child,
                None => break,
            }
            if let Some(set) = &node.upstreams {
                best = Some(set);
            }
        }

        match best {
            // An empty reserved set is the explicit route to default.
            Some(set) if set.is_empty() => {
                debug!(qname, "reserved without upstreams, using default");
                &self.default
            }
            Some(set) => set,
            None => &self.default,
        }
    }

    /// Lookup for DS queries: the answer lives in the parent zone, so
    /// one label is stripped before the walk.
    pub fn lookup_ds(&self, qname: &str) -> &[UpstreamRef] {
        let domain = qname.trim_end_matches('.');
        match domain.split_once('.') {
            Some((_, parent)) if !parent.is_empty() => self.lookup(parent),
            _ => self.lookup("."),
        }
    }

    /// The default upstream set.
    pub fn default_set(&self) -> &[UpstreamRef] {
        &self.default
    }
}
