//! The join-semilattice abstraction shared by all agreement protocols, and the
//! concrete set lattice over 64-bit integers used by the benchmark harness.

use std::collections::HashSet;
use std::fmt::Debug;

/// A join-semilattice. `join` must be commutative, associative and idempotent;
/// the induced partial order is `a <= b` iff `join(a, b) == b`. The `Default`
/// value is the bottom element.
pub trait Lattice: Clone + Debug + Default + PartialEq + Send + Sync + 'static {
    /// The least upper bound of `a` and `b`.
    fn join(a: &Self, b: &Self) -> Self;

    /// `self <= other` in the order induced by `join`.
    fn leq(&self, other: &Self) -> bool;

    /// `self < other`: dominated and not equal.
    fn lt(&self, other: &Self) -> bool {
        self.leq(other) && self != other
    }

    /// Whether this is the bottom element.
    fn is_bottom(&self) -> bool {
        *self == Self::default()
    }
}

/// A finite set of `u64` elements. Join is set union; the order is set
/// inclusion.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct LatticeSet {
    pub set: HashSet<u64>,
}

impl LatticeSet {
    pub fn new() -> Self {
        LatticeSet { set: HashSet::new() }
    }

    /// A one-element set.
    pub fn singleton(elem: u64) -> Self {
        let mut s = LatticeSet::new();
        s.insert(elem);
        s
    }

    pub fn insert(&mut self, elem: u64) {
        self.set.insert(elem);
    }

    pub fn contains(&self, elem: u64) -> bool {
        self.set.contains(&elem)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl Lattice for LatticeSet {
    fn join(a: &Self, b: &Self) -> Self {
        let mut result = a.clone();
        for elem in &b.set {
            result.set.insert(*elem);
        }
        result
    }

    fn leq(&self, other: &Self) -> bool {
        self.set.iter().all(|elem| other.set.contains(elem))
    }
}

/// Builds a `LatticeSet` from a slice of elements. Convenience for tests and
/// the coordinator's initial-value generation.
pub fn set_of(elems: &[u64]) -> LatticeSet {
    let mut s = LatticeSet::new();
    for &elem in elems {
        s.insert(elem);
    }
    s
}
