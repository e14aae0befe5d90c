//! Retention policies.

use std::collections::HashMap;

use reef_types::Cid;
use serde::{Deserialize, Serialize};

use crate::graph::Node;

/// Bounds the number (or total stored size) of entries a log keeps in memory.
///
/// Trimming starts once the measured size exceeds `from` (defaults to `to`)
/// and evicts the oldest entries, by clock then hash, until it is at most
/// `to`. Evicted entries stay retrievable from the block store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrimPolicy {
    /// Bound on the entry count.
    Length { to: usize, from: Option<usize> },
    /// Bound on the sum of stored entry sizes in bytes.
    ByteLength { to: usize, from: Option<usize> },
}

impl TrimPolicy {
    pub fn length(to: usize) -> Self {
        Self::Length { to, from: None }
    }

    pub fn byte_length(to: usize) -> Self {
        Self::ByteLength { to, from: None }
    }

    fn bounds(&self) -> (usize, usize) {
        match *self {
            Self::Length { to, from } | Self::ByteLength { to, from } => {
                (to, from.unwrap_or(to).max(to))
            }
        }
    }

    fn weight<T>(&self, node: &Node<T>) -> usize {
        match self {
            Self::Length { .. } => 1,
            Self::ByteLength { .. } => node.entry.size(),
        }
    }

    /// Hashes to evict from `nodes`, oldest first.
    pub(crate) fn select<T>(&self, nodes: &HashMap<Cid, Node<T>>) -> Vec<Cid> {
        let (to, from) = self.bounds();
        let mut total: usize = nodes.values().map(|n| self.weight(n)).sum();

        if total <= from {
            return Vec::new();
        }

        let mut ordered: Vec<&Node<T>> = nodes.values().collect();
        ordered.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut evict = Vec::new();
        for node in ordered {
            if total <= to {
                break;
            }
            total -= self.weight(node);
            evict.push(node.entry.hash());
        }

        evict
    }
}
