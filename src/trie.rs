use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// A query part resolved to its hash, or a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPart {
    Hash(u64),
    /// `+`: any single level.
    Single,
    /// `#`: this level and everything below it.
    Multi,
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<u64, Node>,
    // Topic hashes terminating at this node.
    hashes: HashSet<u64>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.hashes.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    root: Node,
    // topic hash -> offset of the newest window block of its chain.
    offsets: HashMap<u64, i64>,
}

/// Topic trie mapping hashed topic parts to topic hashes and their window
/// chain heads.
///
/// Nodes key children by part hash; a topic's hash lands in the node its
/// last part reaches. Lookups expand `+` over one level and `#` over a whole
/// subtree, which is how one query fans out to many per-topic chains.
#[derive(Debug, Default)]
pub struct Trie {
    inner: RwLock<Inner>,
}

impl Trie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a topic. Returns true when the (node, topic_hash) pair was
    /// not present before, so callers can record it for rollback.
    pub fn add(&self, parts: &[u64], topic_hash: u64) -> bool {
        let mut inner = self.inner.write().unwrap();
        let mut node = &mut inner.root;
        for part in parts {
            node = node.children.entry(*part).or_default();
        }
        let added = node.hashes.insert(topic_hash);
        if added {
            inner.offsets.entry(topic_hash).or_insert(0);
        }
        added
    }

    /// Removes a topic hash, pruning nodes left empty. Returns true when the
    /// hash was present.
    pub fn remove(&self, parts: &[u64], topic_hash: u64) -> bool {
        let mut inner = self.inner.write().unwrap();
        if !remove_at(&mut inner.root, parts, topic_hash) {
            return false;
        }
        inner.offsets.remove(&topic_hash);
        true
    }

    /// Resolves a (possibly wildcarded) query to the matching topic hashes
    /// and their window chain heads.
    pub fn lookup(&self, parts: &[QueryPart]) -> Vec<(u64, i64)> {
        let inner = self.inner.read().unwrap();
        let mut hashes = HashSet::new();
        lookup_at(&inner.root, parts, &mut hashes);
        hashes
            .into_iter()
            .map(|h| (h, inner.offsets.get(&h).copied().unwrap_or(0)))
            .collect()
    }

    pub fn set_offset(&self, topic_hash: u64, off: i64) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.offsets.get_mut(&topic_hash) {
            Some(slot) => {
                *slot = off;
                true
            }
            None => false,
        }
    }

    pub fn get_offset(&self, topic_hash: u64) -> Option<i64> {
        self.inner.read().unwrap().offsets.get(&topic_hash).copied()
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().offsets.len()
    }
}

fn remove_at(node: &mut Node, parts: &[u64], topic_hash: u64) -> bool {
    match parts.split_first() {
        None => node.hashes.remove(&topic_hash),
        Some((part, rest)) => {
            let Some(child) = node.children.get_mut(part) else {
                return false;
            };
            let removed = remove_at(child, rest, topic_hash);
            if removed && child.is_empty() {
                node.children.remove(part);
            }
            removed
        }
    }
}

fn lookup_at(node: &Node, parts: &[QueryPart], out: &mut HashSet<u64>) {
    match parts.split_first() {
        None => out.extend(&node.hashes),
        Some((QueryPart::Hash(h), rest)) => {
            if let Some(child) = node.children.get(h) {
                lookup_at(child, rest, out);
            }
        }
        Some((QueryPart::Single, rest)) => {
            for child in node.children.values() {
                lookup_at(child, rest, out);
            }
        }
        Some((QueryPart::Multi, _)) => collect_subtree(node, out),
    }
}

fn collect_subtree(node: &Node, out: &mut HashSet<u64>) {
    out.extend(&node.hashes);
    for child in node.children.values() {
        collect_subtree(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_lookup_exact() {
        let trie = Trie::new();
        assert!(trie.add(&[1, 2], 100));
        assert!(!trie.add(&[1, 2], 100), "second add is a no-op");
        assert!(trie.add(&[1, 3], 101));

        let found = trie.lookup(&[QueryPart::Hash(1), QueryPart::Hash(2)]);
        assert_eq!(found, vec![(100, 0)]);

        assert!(trie
            .lookup(&[QueryPart::Hash(1), QueryPart::Hash(9)])
            .is_empty());
    }

    #[test]
    fn test_lookup_single_wildcard() {
        let trie = Trie::new();
        trie.add(&[1, 2, 5], 100);
        trie.add(&[1, 3, 5], 101);
        trie.add(&[1, 3, 6], 102);

        let mut found: Vec<u64> = trie
            .lookup(&[QueryPart::Hash(1), QueryPart::Single, QueryPart::Hash(5)])
            .into_iter()
            .map(|(h, _)| h)
            .collect();
        found.sort_unstable();
        assert_eq!(found, vec![100, 101]);
    }

    #[test]
    fn test_lookup_multi_wildcard() {
        let trie = Trie::new();
        trie.add(&[1], 100);
        trie.add(&[1, 2], 101);
        trie.add(&[1, 2, 3], 102);
        trie.add(&[4], 103);

        let mut found: Vec<u64> = trie
            .lookup(&[QueryPart::Hash(1), QueryPart::Multi])
            .into_iter()
            .map(|(h, _)| h)
            .collect();
        found.sort_unstable();
        assert_eq!(found, vec![100, 101, 102]);
    }

    #[test]
    fn test_offsets() {
        let trie = Trie::new();
        trie.add(&[1, 2], 100);
        assert_eq!(trie.get_offset(100), Some(0));
        assert!(trie.set_offset(100, 8192));
        assert_eq!(trie.get_offset(100), Some(8192));
        assert!(!trie.set_offset(999, 1), "unknown hash is rejected");

        let found = trie.lookup(&[QueryPart::Hash(1), QueryPart::Hash(2)]);
        assert_eq!(found, vec![(100, 8192)]);
    }

    #[test]
    fn test_remove_prunes() {
        let trie = Trie::new();
        trie.add(&[1, 2, 3], 100);
        assert!(trie.remove(&[1, 2, 3], 100));
        assert!(!trie.remove(&[1, 2, 3], 100));
        assert_eq!(trie.count(), 0);
        assert!(trie
            .lookup(&[QueryPart::Hash(1), QueryPart::Multi])
            .is_empty());
        assert_eq!(trie.get_offset(100), None);
    }
}
