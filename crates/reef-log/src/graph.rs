//! Derived DAG state: heads, tails and gid shadowing.
//!
//! The frontier is recomputed from the full entry set after every mutation
//! and swapped in whole, so readers never see a half-updated view.

use std::collections::{BTreeSet, HashMap, HashSet};

use reef_types::{Cid, LamportClock};

use crate::entry::{Entry, Meta};

/// An entry held by a log, with its metadata opened.
#[derive(Clone)]
pub(crate) struct Node<T> {
    pub entry: Entry<T>,
    pub meta: Meta,
}

impl<T> Node<T> {
    /// Total order used for heads, values and trimming.
    pub fn sort_key(&self) -> (&LamportClock, Cid) {
        (&self.meta.clock, self.entry.hash())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Frontier {
    /// Entries no other entry points to, newest first.
    pub heads: Vec<Cid>,
    /// Entries pointing to a predecessor that is neither present nor cut.
    pub tails: BTreeSet<Cid>,
    /// The absent predecessors referenced by `tails`.
    pub tail_hashes: BTreeSet<Cid>,
    /// Gids with entries in the log but none among the heads.
    pub shadowed: BTreeSet<String>,
}

impl Frontier {
    pub fn compute<T>(nodes: &HashMap<Cid, Node<T>>, tombstones: &HashSet<Cid>) -> Self {
        let mut referenced = HashSet::new();
        let mut tails = BTreeSet::new();
        let mut tail_hashes = BTreeSet::new();

        for (hash, node) in nodes {
            for next in &node.meta.next {
                if nodes.contains_key(next) {
                    referenced.insert(*next);
                } else if !tombstones.contains(next) {
                    tails.insert(*hash);
                    tail_hashes.insert(*next);
                }
            }
        }

        let mut heads: Vec<&Node<T>> = nodes
            .iter()
            .filter(|(hash, _)| !referenced.contains(*hash))
            .map(|(_, node)| node)
            .collect();
        heads.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));

        let head_gids: HashSet<&str> = heads.iter().map(|n| n.meta.gid.as_str()).collect();
        let shadowed = nodes
            .values()
            .map(|n| n.meta.gid.as_str())
            .filter(|gid| !head_gids.contains(gid))
            .map(str::to_string)
            .collect();

        Self {
            heads: heads.into_iter().map(|n| n.entry.hash()).collect(),
            tails,
            tail_hashes,
            shadowed,
        }
    }

    /// Gids shadowed now that were not shadowed in `previous`.
    pub fn newly_shadowed(&self, previous: &Frontier) -> Vec<String> {
        self.shadowed
            .difference(&previous.shadowed)
            .cloned()
            .collect()
    }
}

/// Remove `roots` and everything reachable from them through present
/// entries, recording each visited hash as a tombstone.
pub(crate) fn cut<T>(
    nodes: &mut HashMap<Cid, Node<T>>,
    tombstones: &mut HashSet<Cid>,
    roots: impl IntoIterator<Item = Cid>,
) -> Vec<Cid> {
    let mut stack: Vec<Cid> = roots.into_iter().collect();
    let mut removed = Vec::new();

    while let Some(hash) = stack.pop() {
        tombstones.insert(hash);
        if let Some(node) = nodes.remove(&hash) {
            stack.extend(node.meta.next.iter().copied());
            removed.push(hash);
        }
    }

    removed
}
