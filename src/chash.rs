//! Weighted consistent hash ring used for parent selection.
//!
//! Placement and failover order match Apache Traffic Server's
//! `ATSConsistentHash`: SipHash-2-4 with a zero key over `"<replica>-<identity>"`,
//! `round(replicas * weight)` points per node, and clockwise iteration with
//! wrap-around for each failed parent.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use siphasher::sip::SipHasher24;
use thiserror::Error;

pub const DEFAULT_REPLICAS: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChashError {
    #[error("consistent hash ring is empty")]
    Empty,
    #[error("consistent hash key is empty")]
    EmptyKey,
}

pub fn hash(key: &str) -> u64 {
    SipHasher24::new_with_keys(0, 0).hash(key.as_bytes())
}

/// Position on the ring. Only meaningful for the ring that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor(u64);

pub struct ConsistentHash<N> {
    replicas: usize,
    ring: BTreeMap<u64, Arc<N>>,
}

impl<N> ConsistentHash<N> {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas,
            ring: BTreeMap::new(),
        }
    }

    /// Adds `round(replicas * weight)` points for `node`, rounding half away
    /// from zero. `identity` is the node's proxy host when it has one, else its name.
    pub fn insert(&mut self, node: N, identity: &str, weight: f64) {
        let node = Arc::new(node);
        let points = (self.replicas as f64 * weight).round();
        if points <= 0.0 {
            return;
        }
        for i in 0..points as u64 {
            let key = format!("{i}-{identity}");
            self.ring.entry(hash(&key)).or_insert_with(|| Arc::clone(&node));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Finds the first point at or after the hash of `key`. The flag is true
    /// when the search ran off the end and wrapped to the first point.
    pub fn lookup(&self, key: &str) -> Result<(Cursor, bool), ChashError> {
        if key.is_empty() {
            return Err(ChashError::EmptyKey);
        }
        let target = hash(key);
        if let Some((&pos, _)) = self.ring.range(target..).next() {
            return Ok((Cursor(pos), false));
        }
        let (&first, _) = self.ring.iter().next().ok_or(ChashError::Empty)?;
        Ok((Cursor(first), true))
    }

    /// Steps clockwise to the next point, wrapping at the end.
    pub fn next(&self, cursor: Cursor) -> Option<(Cursor, bool)> {
        if let Some((&pos, _)) = self.ring.range((Bound::Excluded(cursor.0), Bound::Unbounded)).next() {
            return Some((Cursor(pos), false));
        }
        self.ring.keys().next().map(|&pos| (Cursor(pos), true))
    }

    pub fn node(&self, cursor: Cursor) -> Option<&Arc<N>> {
        self.ring.get(&cursor.0)
    }

    /// Node for `key` after skipping `failures` points, the order a parent
    /// cache walks its ring on consecutive failures.
    pub fn lookup_failover(&self, key: &str, failures: usize) -> Result<&Arc<N>, ChashError> {
        let (mut cursor, _) = self.lookup(key)?;
        for _ in 0..failures {
            cursor = self.next(cursor).ok_or(ChashError::Empty)?.0;
        }
        self.node(cursor).ok_or(ChashError::Empty)
    }
}
