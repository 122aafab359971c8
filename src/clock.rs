// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Clocks
//!
//! The identity and causality primitives of the crate.
//!
//! Every commit is identified by a [`Dot`]: the replica that coordinated it
//! plus a per-replica sequence number starting at one. A [`Clock`] maps each
//! replica to a set of sequence numbers observed from it, in one of two
//! per-replica representations:
//!
//! - [`MaxInt`] — a plain watermark. `contains(n)` means `n <= watermark`,
//!   so the set is always a contiguous prefix. This is the shape of the
//!   *conf* snapshot a coordinator attaches to a commit.
//! - [`ExceptionSet`] — an arbitrary set of sequence numbers, stored as
//!   compact spans. This is the shape of dependency and delivered clocks,
//!   which have holes while commits are in flight.
//!
//! Both representations are canonical: structural equality of two clocks is
//! exact equality of the sets they denote.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU64;

mod spans;

use spans::SpanSet;

/// Identifies a replica in the system.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct ReplicaId(u8);

impl ReplicaId {
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u8 {
        self.0
    }
}

impl From<u8> for ReplicaId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

impl std::fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// The globally unique identity of a single commit.
///
/// Dots order by replica first, then sequence number. This order is the
/// final tie-break when commits form a dependency cycle, so it must be
/// identical on every replica.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct Dot {
    replica: ReplicaId,
    seq: NonZeroU64,
}

impl Dot {
    pub const fn new(replica: ReplicaId, seq: NonZeroU64) -> Self {
        Self { replica, seq }
    }

    /// Creates the `seq`-th dot of `replica`.
    ///
    /// # Panics
    ///
    /// If `seq` is zero. Sequence numbers start at one.
    pub fn mint(replica: ReplicaId, seq: u64) -> Self {
        let seq = NonZeroU64::new(seq).expect("sequence numbers start at one");
        Self { replica, seq }
    }

    pub const fn replica(self) -> ReplicaId {
        self.replica
    }

    pub const fn sequence(self) -> NonZeroU64 {
        self.seq
    }
}

impl std::fmt::Debug for Dot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.replica, self.seq)
    }
}

impl std::fmt::Display for Dot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.replica, self.seq)
    }
}

/// An explicit, ordered set of [`Dot`]s.
///
/// Used for the (typically small) identity set of a queue box, where
/// iteration in dot order matters; dense clock-shaped sets use [`Clock`].
#[derive(Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct Dots(BTreeSet<Dot>);

impl Dots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(dot: Dot) -> Self {
        Self(BTreeSet::from([dot]))
    }

    /// Adds a dot, returning false if it was already present.
    pub fn insert(&mut self, dot: Dot) -> bool {
        self.0.insert(dot)
    }

    pub fn contains(&self, dot: Dot) -> bool {
        self.0.contains(&dot)
    }

    pub fn union(&mut self, other: &Dots) {
        self.0.extend(other.0.iter().copied());
    }

    /// The smallest dot in the set.
    pub fn min(&self) -> Option<Dot> {
        self.0.first().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Dot> + '_ {
        self.0.iter().copied()
    }
}

impl std::fmt::Debug for Dots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl FromIterator<Dot> for Dots {
    fn from_iter<T: IntoIterator<Item = Dot>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Dot> for Dots {
    fn extend<T: IntoIterator<Item = Dot>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl<'a> IntoIterator for &'a Dots {
    type Item = &'a Dot;
    type IntoIter = std::collections::btree_set::Iter<'a, Dot>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The per-replica value of a [`Clock`]: a set of sequence numbers.
///
/// Implementations must be canonical, so that `Eq` on the value (and hence
/// on the clock) is exact set equality. The empty set must equal
/// `Default::default()`; [`Clock`] relies on this to avoid storing entries
/// for replicas nothing has been observed from.
pub trait SeqSet: Clone + Default + Eq {
    fn contains(&self, seq: NonZeroU64) -> bool;

    /// Adds a single sequence number.
    fn add(&mut self, seq: NonZeroU64);

    /// Unions `other` into `self`.
    fn merge(&mut self, other: &Self);

    fn is_empty(&self) -> bool;
}

/// A watermark: the contiguous set `{1..=value}`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct MaxInt(u64);

impl MaxInt {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for MaxInt {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for MaxInt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "≤{}", self.0)
    }
}

impl SeqSet for MaxInt {
    fn contains(&self, seq: NonZeroU64) -> bool {
        seq.get() <= self.0
    }

    fn add(&mut self, seq: NonZeroU64) {
        self.0 = self.0.max(seq.get());
    }

    fn merge(&mut self, other: &Self) {
        self.0 = self.0.max(other.0);
    }

    fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// A watermark plus holes: an arbitrary set of sequence numbers.
///
/// The name follows the wire format: the set is transmitted as its highest
/// sequence number plus the *exceptions* missing below it. Internally it is
/// a canonical [`SpanSet`], so `==` is exact set equality.
#[derive(Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct ExceptionSet {
    seqs: SpanSet,
}

impl ExceptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full prefix `{1..=watermark}` with no exceptions.
    pub fn contiguous(watermark: u64) -> Self {
        Self {
            seqs: SpanSet::contiguous(watermark),
        }
    }

    /// The prefix `{1..=watermark}` minus the given exceptions.
    ///
    /// Exceptions above the watermark are ignored.
    pub fn with_exceptions(watermark: u64, exceptions: impl IntoIterator<Item = u64>) -> Self {
        let holes: BTreeSet<u64> = exceptions.into_iter().collect();
        let seqs = (1..=watermark)
            .filter(|seq| !holes.contains(seq))
            .map(|seq| NonZeroU64::new(seq).expect("starts at one"))
            .collect();
        Self { seqs }
    }

    /// The highest sequence number in the set, or zero for the empty set.
    pub fn watermark(&self) -> u64 {
        self.seqs.max()
    }

    /// Collapses the set to its watermark.
    pub fn to_max_int(&self) -> MaxInt {
        MaxInt::new(self.watermark())
    }

    /// Number of sequence numbers in the set.
    pub fn len(&self) -> u64 {
        self.seqs.seq_count()
    }

    /// True if every sequence number of `other` is also in `self`.
    pub fn is_superset(&self, other: &ExceptionSet) -> bool {
        self.seqs.is_superset(&other.seqs)
    }

    pub fn iter(&self) -> impl Iterator<Item = NonZeroU64> + '_ {
        self.seqs.seqs()
    }
}

impl std::fmt::Debug for ExceptionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.seqs.fmt(f)
    }
}

impl FromIterator<NonZeroU64> for ExceptionSet {
    fn from_iter<T: IntoIterator<Item = NonZeroU64>>(iter: T) -> Self {
        Self {
            seqs: iter.into_iter().collect(),
        }
    }
}

impl ExceptionSet {
    /// Removes a single sequence number, returning false if it was absent.
    pub fn remove(&mut self, seq: NonZeroU64) -> bool {
        self.seqs.remove(seq)
    }
}

impl SeqSet for ExceptionSet {
    fn contains(&self, seq: NonZeroU64) -> bool {
        self.seqs.contains(seq)
    }

    fn add(&mut self, seq: NonZeroU64) {
        self.seqs.insert(seq);
    }

    fn merge(&mut self, other: &Self) {
        self.seqs = self.seqs.union(&other.seqs);
    }

    fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }
}

/// A map from replica to the set of sequence numbers observed from it.
///
/// Canonical: replicas with an empty set are never stored, so derived
/// equality is exact equality of the denoted dot sets.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct Clock<V> {
    entries: BTreeMap<ReplicaId, V>,
}

impl<V> Default for Clock<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V: std::fmt::Debug> std::fmt::Debug for Clock<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl<V: SeqSet> Clock<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica: ReplicaId) -> Option<&V> {
        self.entries.get(&replica)
    }

    /// Sets the entry for `replica`, dropping it when `value` is empty.
    pub fn set(&mut self, replica: ReplicaId, value: V) {
        if value.is_empty() {
            self.entries.remove(&replica);
        } else {
            self.entries.insert(replica, value);
        }
    }

    pub fn contains(&self, dot: Dot) -> bool {
        self.entries
            .get(&dot.replica())
            .is_some_and(|v| v.contains(dot.sequence()))
    }

    pub fn add_dot(&mut self, dot: Dot) {
        self.entries
            .entry(dot.replica())
            .or_default()
            .add(dot.sequence());
    }

    pub fn add_dots(&mut self, dots: &Dots) {
        for dot in dots.iter() {
            self.add_dot(dot);
        }
    }

    /// True if any dot in `dots` is contained in the clock.
    pub fn intersects(&self, dots: &Dots) -> bool {
        dots.iter().any(|dot| self.contains(dot))
    }

    /// Pointwise union of `other` into `self`.
    pub fn merge(&mut self, other: &Clock<V>) {
        for (replica, value) in &other.entries {
            debug_assert!(!value.is_empty());
            self.entries.entry(*replica).or_default().merge(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, &V)> + '_ {
        self.entries.iter().map(|(replica, value)| (*replica, value))
    }
}

impl<V: SeqSet> FromIterator<(ReplicaId, V)> for Clock<V> {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, V)>>(iter: T) -> Self {
        let mut clock = Self::new();
        for (replica, value) in iter {
            clock.set(replica, value);
        }
        clock
    }
}

impl Clock<ExceptionSet> {
    /// Expands a watermark snapshot into the exception-set shape, with every
    /// per-replica set a contiguous prefix.
    ///
    /// This is how a commit's *conf* snapshot becomes the dependency clock
    /// of a [`DeliveredBox`](crate::queue::DeliveredBox).
    pub fn eclock(conf: &Clock<MaxInt>) -> Self {
        conf.iter()
            .map(|(replica, max)| (replica, ExceptionSet::contiguous(max.value())))
            .collect()
    }

    /// Removes a single dot, returning false if it was absent.
    pub fn remove_dot(&mut self, dot: Dot) -> bool {
        let Some(set) = self.entries.get_mut(&dot.replica()) else {
            return false;
        };
        let removed = set.remove(dot.sequence());
        if set.is_empty() {
            self.entries.remove(&dot.replica());
        }
        removed
    }

    /// True if `self` denotes a superset of the dots `other` denotes.
    pub fn subsumes(&self, other: &Clock<ExceptionSet>) -> bool {
        other.iter().all(|(replica, theirs)| {
            self.get(replica)
                .is_some_and(|ours| ours.is_superset(theirs))
        })
    }

    /// Total number of dots in the clock.
    pub fn len(&self) -> u64 {
        self.iter().map(|(_, set)| set.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(v: u64) -> NonZeroU64 {
        NonZeroU64::new(v).unwrap()
    }

    fn dot(replica: u8, seq: u64) -> Dot {
        Dot::mint(replica.into(), seq)
    }

    #[test]
    fn dots_order_by_replica_then_sequence() {
        let mut dots = Dots::new();
        dots.insert(dot(1, 1));
        dots.insert(dot(0, 7));
        dots.insert(dot(0, 2));
        let ordered: Vec<Dot> = dots.iter().collect();
        assert_eq!(ordered, vec![dot(0, 2), dot(0, 7), dot(1, 1)]);
        assert_eq!(dots.min(), Some(dot(0, 2)));
    }

    #[test]
    fn max_int_is_a_prefix() {
        let mut m = MaxInt::default();
        assert!(m.is_empty());
        m.add(nz(3));
        assert!(m.contains(nz(1)) && m.contains(nz(3)) && !m.contains(nz(4)));
        m.add(nz(2));
        assert_eq!(m, MaxInt::new(3));
    }

    #[test]
    fn exception_set_watermark_and_holes() {
        let e = ExceptionSet::with_exceptions(5, [2, 4]);
        assert_eq!(e.watermark(), 5);
        assert_eq!(e.to_max_int(), MaxInt::new(5));
        assert!(e.contains(nz(1)) && e.contains(nz(3)) && e.contains(nz(5)));
        assert!(!e.contains(nz(2)) && !e.contains(nz(4)));
        assert_eq!(e.len(), 3);
    }

    #[test]
    fn filling_the_holes_restores_the_prefix() {
        let mut e = ExceptionSet::with_exceptions(5, [2, 4]);
        e.add(nz(2));
        e.add(nz(4));
        assert_eq!(e, ExceptionSet::contiguous(5));
    }

    #[test]
    fn clock_skips_empty_entries() {
        let mut a = Clock::<ExceptionSet>::new();
        a.set(ReplicaId::new(0), ExceptionSet::contiguous(0));
        a.set(ReplicaId::new(1), ExceptionSet::contiguous(2));
        let mut b = Clock::<ExceptionSet>::new();
        b.add_dot(dot(1, 1));
        b.add_dot(dot(1, 2));
        assert_eq!(a, b);
    }

    #[test]
    fn remove_dot_drops_empty_entries() {
        let mut clock = Clock::<ExceptionSet>::new();
        clock.add_dot(dot(0, 1));
        clock.add_dot(dot(1, 3));
        assert!(clock.remove_dot(dot(1, 3)));
        assert!(!clock.remove_dot(dot(1, 3)));
        let mut expected = Clock::<ExceptionSet>::new();
        expected.add_dot(dot(0, 1));
        assert_eq!(clock, expected);
    }

    #[test]
    fn eclock_expands_watermarks() {
        let conf: Clock<MaxInt> = [
            (ReplicaId::new(0), MaxInt::new(2)),
            (ReplicaId::new(1), MaxInt::new(0)),
            (ReplicaId::new(2), MaxInt::new(1)),
        ]
        .into_iter()
        .collect();
        let e = Clock::eclock(&conf);
        assert!(e.contains(dot(0, 1)) && e.contains(dot(0, 2)) && e.contains(dot(2, 1)));
        assert!(!e.contains(dot(0, 3)) && !e.contains(dot(1, 1)));
        assert_eq!(e.len(), 3);
    }

    #[quickcheck]
    fn merge_is_commutative_and_idempotent(a: Vec<(u8, u64)>, b: Vec<(u8, u64)>) -> bool {
        let build = |dots: &[(u8, u64)]| {
            let mut clock = Clock::<ExceptionSet>::new();
            for &(replica, seq) in dots {
                clock.add_dot(dot(replica, seq % 64 + 1));
            }
            clock
        };
        let (ca, cb) = (build(&a), build(&b));
        let mut ab = ca.clone();
        ab.merge(&cb);
        let mut ba = cb.clone();
        ba.merge(&ca);
        let mut abb = ab.clone();
        abb.merge(&cb);
        ab == ba && abb == ab && ab.subsumes(&ca) && ab.subsumes(&cb)
    }

    #[quickcheck]
    fn subsumes_matches_contains(a: Vec<(u8, u64)>, b: Vec<(u8, u64)>) -> bool {
        let build = |dots: &[(u8, u64)]| {
            let mut clock = Clock::<ExceptionSet>::new();
            for &(replica, seq) in dots {
                clock.add_dot(dot(replica % 4, seq % 16 + 1));
            }
            clock
        };
        let (ca, cb) = (build(&a), build(&b));
        let denoted = |clock: &Clock<ExceptionSet>| {
            let mut dots = Vec::new();
            for (replica, set) in clock.iter() {
                for seq in set.iter() {
                    dots.push(Dot::new(replica, seq));
                }
            }
            dots
        };
        ca.subsumes(&cb) == denoted(&cb).iter().all(|&d| ca.contains(d))
    }
}
