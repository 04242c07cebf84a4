//! Version vectors for causal ordering between record versions
//!
//! Every replica (device installation) owns one component of the vector and
//! only ever increments its own counter. Merging takes the pointwise
//! maximum. Two versions are *concurrent* when neither vector dominates the
//! other; that is the only case where the resolver falls back to the
//! last-write-wins tie-break.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of one replica (device installation)
///
/// Assigned once when a device joins a company and never reused. The
/// derived `Ord` on the underlying UUID bytes is the fixed total order used
/// for deterministic tie-breaking.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Generate a fresh replica id
    pub fn generate() -> Self {
        ReplicaId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ReplicaId {
    fn from(id: Uuid) -> Self {
        ReplicaId(id)
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Causal relation between two version vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Identical vectors: same version
    Equal,
    /// Left happened after right
    LeftDominates,
    /// Right happened after left
    RightDominates,
    /// Neither dominates: the versions were written concurrently
    Concurrent,
}

/// Per-replica counter map detecting causal order between record versions
///
/// Invariants:
/// - a replica only ever increments its own component
/// - merging takes the pointwise maximum, so the merged vector dominates
///   both inputs
/// - counters never decrease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<ReplicaId, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the counter for a replica (zero if absent)
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Increment this replica's own component and return the new value
    pub fn increment(&mut self, replica: ReplicaId) -> u64 {
        let counter = self.0.entry(replica).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise-maximum merge
    pub fn merge(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.0.clone();
        for (replica, counter) in &other.0 {
            let entry = merged.entry(*replica).or_insert(0);
            if *counter > *entry {
                *entry = *counter;
            }
        }
        VersionVector(merged)
    }

    /// Compare two vectors for causal order
    pub fn causality(&self, other: &VersionVector) -> Causality {
        let mut left_ahead = false;
        let mut right_ahead = false;

        for replica in self.0.keys().chain(other.0.keys()) {
            let l = self.get(replica);
            let r = other.get(replica);
            if l > r {
                left_ahead = true;
            } else if r > l {
                right_ahead = true;
            }
        }

        match (left_ahead, right_ahead) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::LeftDominates,
            (false, true) => Causality::RightDominates,
            (true, true) => Causality::Concurrent,
        }
    }

    /// True if `self` is causally at or after `other`
    pub fn dominates(&self, other: &VersionVector) -> bool {
        matches!(
            self.causality(other),
            Causality::Equal | Causality::LeftDominates
        )
    }

    /// Iterate over (replica, counter) components
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.0.iter()
    }

    /// Number of replicas that have written this record
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn replica(seed: u128) -> ReplicaId {
        ReplicaId::from(Uuid::from_u128(seed))
    }

    #[test]
    fn test_increment_own_component() {
        let r = replica(1);
        let mut vv = VersionVector::new();
        assert_eq!(vv.get(&r), 0);
        assert_eq!(vv.increment(r), 1);
        assert_eq!(vv.increment(r), 2);
        assert_eq!(vv.get(&r), 2);
    }

    #[test]
    fn test_dominance() {
        let a = replica(1);
        let mut older = VersionVector::new();
        older.increment(a);

        let mut newer = older.clone();
        newer.increment(a);

        assert_eq!(newer.causality(&older), Causality::LeftDominates);
        assert_eq!(older.causality(&newer), Causality::RightDominates);
        assert!(newer.dominates(&older));
        assert!(!older.dominates(&newer));
    }

    #[test]
    fn test_concurrent() {
        let a = replica(1);
        let b = replica(2);

        let mut left = VersionVector::new();
        left.increment(a);
        let mut right = VersionVector::new();
        right.increment(b);

        assert_eq!(left.causality(&right), Causality::Concurrent);
        assert_eq!(right.causality(&left), Causality::Concurrent);
    }

    #[test]
    fn test_equal() {
        let a = replica(1);
        let mut left = VersionVector::new();
        left.increment(a);
        let right = left.clone();
        assert_eq!(left.causality(&right), Causality::Equal);
        assert!(left.dominates(&right));
    }

    #[test]
    fn test_merge_dominates_both_inputs() {
        let a = replica(1);
        let b = replica(2);

        let mut left = VersionVector::new();
        left.increment(a);
        left.increment(a);
        let mut right = VersionVector::new();
        right.increment(b);

        let merged = left.merge(&right);
        assert!(merged.dominates(&left));
        assert!(merged.dominates(&right));
        assert_eq!(merged.get(&a), 2);
        assert_eq!(merged.get(&b), 1);
    }

    #[test]
    fn test_merge_commutative() {
        let a = replica(1);
        let b = replica(2);

        let mut left = VersionVector::new();
        left.increment(a);
        let mut right = VersionVector::new();
        right.increment(b);
        right.increment(b);

        assert_eq!(left.merge(&right), right.merge(&left));
    }

    #[test]
    fn test_serde_json_map_keys() {
        let mut vv = VersionVector::new();
        vv.increment(replica(42));

        let json = serde_json::to_string(&vv).unwrap();
        let back: VersionVector = serde_json::from_str(&json).unwrap();
        assert_eq!(vv, back);
    }
}
