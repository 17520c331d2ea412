//! Runtime statistics as a typed tree.
//!
//! Counters are addressed by `::`-separated paths such as
//! `blocked_domains::blocked_responses` or `resolvers::1.1.1.1:853`.
//! Leaves are either counters or text; interior nodes are subtrees. The
//! tree serializes itself to JSON for the external statistics collector,
//! which treats the blob as opaque.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// A node in the statistics tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatValue {
    Counter(u64),
    Text(String),
    Tree(BTreeMap<String, StatValue>),
}

/// Thread-safe statistics store.
#[derive(Debug, Default)]
pub struct Stats {
    root: Mutex<BTreeMap<String, StatValue>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the counter at `path`, creating it (and any
    /// intermediate subtrees) as needed. A non-counter leaf at the path
    /// is replaced.
    pub fn increment(&self, path: &str, delta: u64) {
        let mut root = self.root.lock();
        let slot = descend(&mut root, path);
        match slot {
            Some(StatValue::Counter(v)) => *v += delta,
            Some(other) => *other = StatValue::Counter(delta),
            None => {}
        }
    }

    /// Set the text leaf at `path`.
    pub fn set_text(&self, path: &str, value: impl Into<String>) {
        let mut root = self.root.lock();
        if let Some(slot) = descend(&mut root, path) {
            *slot = StatValue::Text(value.into());
        }
    }

    /// Read the counter at `path`, zero when absent.
    pub fn counter(&self, path: &str) -> u64 {
        let root = self.root.lock();
        let mut node = &*root;
        let mut parts = path.split("::").peekable();
        while let Some(part) = parts.next() {
            match node.get(part) {
                Some(StatValue::Counter(v)) if parts.peek().is_none() => return *v,
                Some(StatValue::Tree(sub)) => node = sub,
                _ => return 0,
            }
        }
        0
    }

    /// Serialize the whole tree to JSON.
    pub fn to_json(&self) -> String {
        let root = self.root.lock();
        let mut out = String::new();
        write_tree(&root, &mut out);
        out
    }
}

fn descend<'a>(
    root: &'a mut BTreeMap<String, StatValue>,
    path: &str,
) -> Option<&'a mut StatValue> {
    let mut node = root;
    let mut parts = path.split("::").peekable();
    loop {
        let part = parts.next()?;
        if parts.peek().is_none() {
            return Some(
                node.entry(part.to_string())
                    .or_insert(StatValue::Counter(0)),
            );
        }
        let entry = node
            .entry(part.to_string())
            .or_insert_with(|| StatValue::Tree(BTreeMap::new()));
        match entry {
            StatValue::Tree(sub) => node = sub,
            // A leaf in the middle of the path: promote it to a subtree.
            other => {
                *other = StatValue::Tree(BTreeMap::new());
                match other {
                    StatValue::Tree(sub) => node = sub,
                    _ => unreachable!(),
                }
            }
        }
    }
}

fn write_tree(tree: &BTreeMap<String, StatValue>, out: &mut String) {
    out.push('{');
    for (i, (key, value)) in tree.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_json_string(key, out);
        out.push(':');
        match value {
            StatValue::Counter(v) => out.push_str(&v.to_string()),
            StatValue::Text(s) => write_json_string(s, out),
            StatValue::Tree(sub) => write_tree(sub, out),
        }
    }
    out.push('}');
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_create_and_increment_counters() {
        let stats = Stats::new();
        stats.increment("local::queries", 1);
        stats.increment("local::queries", 2);
        assert_eq!(stats.counter("local::queries"), 3);
        assert_eq!(stats.counter("local::other"), 0);
    }

    #[test]
    fn should_nest_paths_into_subtrees() {
        let stats = Stats::new();
        stats.increment("blocked_domains::domains::easylist::ads.example.com", 1);
        assert_eq!(
            stats.counter("blocked_domains::domains::easylist::ads.example.com"),
            1
        );
        assert_eq!(stats.counter("blocked_domains::domains"), 0);
    }

    #[test]
    fn should_serialize_to_json() {
        let stats = Stats::new();
        stats.increment("a::b", 5);
        stats.set_text("a::name", "easylist");
        stats.increment("z", 1);

        let json = stats.to_json();
        assert_eq!(json, r#"{"a":{"b":5,"name":"easylist"},"z":1}"#);
    }

    #[test]
    fn should_escape_json_strings() {
        let stats = Stats::new();
        stats.set_text("note", "say \"hi\"\n");
        assert_eq!(stats.to_json(), r#"{"note":"say \"hi\"\n"}"#);
    }
}
