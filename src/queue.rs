// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # The delivery queue
//!
//! [`DepQueue`] is the engine that turns a stream of independently committed
//! operations into the causal, replica-identical delivery order. It is
//! instantiated twice: at the top level over [`CommittedBox`]es (the causal
//! gate across all commits), and, inside each released box, over
//! [`DeliveredBox`]es (the per-color total order).
//!
//! The engine maintains one invariant that makes the delivery gate work: a
//! pending box's dependency clock always subsumes the queue's delivered
//! clock. With that, `delivered + box.dots == box.dep` holds exactly when
//! every dependency outside the box has been delivered.
//!
//! The engine is single-writer. See [`Pipeline`](crate::pipeline::Pipeline)
//! for the recommended way to drive it from concurrent producers.

use std::collections::BTreeMap;

use tracing::trace;

use crate::clock::{Clock, Dot, Dots, ExceptionSet};
use crate::message::Message;

mod boxes;

pub use boxes::{CommittedBox, DeliveredBox, InvalidCommit, PerMessage};

/// The contract both box kinds implement.
///
/// Boxes are value types: `Clone` is a deep copy and mutating a clone never
/// affects the original.
pub trait QueueBox: Clone {
    /// The identities of the commits this box holds.
    fn dots(&self) -> &Dots;

    /// The merged causal past of the held commits, own dots included.
    fn dep(&self) -> &Clock<ExceptionSet>;

    fn dep_mut(&mut self) -> &mut Clock<ExceptionSet>;

    /// Absorbs `other` into `self`: dot union, dependency clock union,
    /// message concatenation. Commutative and associative up to message
    /// multisets.
    fn merge(&mut self, other: Self);

    /// The final deterministic message sequence contained in this box.
    fn sort_messages(&self) -> Vec<Message>;

    /// Number of commits held.
    fn size(&self) -> usize {
        self.dots().len()
    }

    /// True iff `other` causally requires at least one dot of `self`.
    fn before(&self, other: &Self) -> bool {
        other.dep().intersects(self.dots())
    }

    /// Re-establishes the engine invariant after `delivered` has grown.
    fn absorb(&mut self, delivered: &Clock<ExceptionSet>) {
        self.dep_mut().merge(delivered);
    }

    /// The delivery gate. Speculatively adds this box's dots to `delivered`
    /// and tests whether that makes it exactly the box's causal past.
    ///
    /// On success the mutated clock is the queue's next delivered clock; on
    /// failure the caller discards it.
    fn can_deliver(&self, delivered: &mut Clock<ExceptionSet>) -> bool {
        delivered.add_dots(self.dots());
        *delivered == *self.dep()
    }
}

/// The generic delivery-queue engine.
///
/// Accepts boxes, merges dependency cycles so they deliver as one unit,
/// and repeatedly retries the delivery gate against a monotonically
/// growing delivered clock, draining ready boxes in delivery order.
///
/// A box whose dependencies never all arrive stalls forever; that is a
/// liveness obligation on the upstream replication protocol, not an error
/// here.
pub struct DepQueue<B> {
    delivered: Clock<ExceptionSet>,
    /// Pending boxes, keyed by their minimal dot. The key is stable under
    /// merging (merges only ever add larger dots from the absorbed box or
    /// happen before insertion), and the ordered scan makes gate retries
    /// deterministic.
    pending: BTreeMap<Dot, B>,
    ready: Vec<B>,
}

impl<B: QueueBox> Default for DepQueue<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: QueueBox> DepQueue<B> {
    /// An empty queue with an empty delivered clock.
    pub fn new() -> Self {
        Self::with_delivered(Clock::new())
    }

    /// An empty queue seeded with an already-delivered clock.
    ///
    /// Commits whose dependencies fall entirely under the seed deliver
    /// immediately. This is how recovery skips a prefix the execution layer
    /// has already applied, and how the nested per-color queue discounts
    /// dots outside its color.
    pub fn with_delivered(delivered: Clock<ExceptionSet>) -> Self {
        Self {
            delivered,
            pending: BTreeMap::new(),
            ready: Vec::new(),
        }
    }

    /// The set of dots delivered so far (including any seed).
    pub fn delivered(&self) -> &Clock<ExceptionSet> {
        &self.delivered
    }

    /// Inserts a box, merging it with every pending box it is mutually
    /// entangled with, then drains everything the insertion made
    /// deliverable into the ready buffer. Longer dependency cycles, which
    /// contain no mutually entangled pair, are collapsed during the drain
    /// once a gate pass stalls.
    pub fn add(&mut self, mut incoming: B) {
        // Mutual entanglement is a two-box dependency cycle: neither side
        // can pass the gate before the other, so they deliver as one box.
        // Merging grows the dot set, which can entangle further boxes;
        // cascade to a fixpoint. One-directional dependencies stay separate
        // and order through the gate instead.
        loop {
            let entangled = self
                .pending
                .iter()
                .find(|&(_, pending)| pending.before(&incoming) && incoming.before(pending))
                .map(|(key, _)| *key);
            let Some(key) = entangled else {
                break;
            };
            let pending = self.pending.remove(&key).expect("key found above");
            trace!(merged = ?pending.dots(), into = ?incoming.dots(), "merging entangled boxes");
            incoming.merge(pending);
        }

        incoming.absorb(&self.delivered);
        let key = incoming
            .dots()
            .min()
            .expect("a queue box holds at least one commit");
        let displaced = self.pending.insert(key, incoming);
        debug_assert!(
            displaced.is_none(),
            "boxes sharing a dot are mutually entangled and must have merged"
        );

        self.try_deliver();
    }

    /// Retries the gate over all pending boxes until a full pass delivers
    /// nothing, collapsing dependency cycles between passes.
    fn try_deliver(&mut self) {
        loop {
            let mut progressed = false;
            let keys: Vec<Dot> = self.pending.keys().copied().collect();
            for key in keys {
                let Some(pending) = self.pending.get_mut(&key) else {
                    continue;
                };
                pending.absorb(&self.delivered);
                let mut speculative = self.delivered.clone();
                if pending.can_deliver(&mut speculative) {
                    self.delivered = speculative;
                    let ready = self.pending.remove(&key).expect("key found above");
                    trace!(dots = ?ready.dots(), "delivered");
                    self.ready.push(ready);
                    progressed = true;
                }
            }
            if progressed {
                continue;
            }
            if !self.merge_cycles() {
                break;
            }
        }
    }

    /// Collapses dependency cycles among the pending boxes.
    ///
    /// A cycle of three or more boxes with one-directional edges contains
    /// no mutually entangled pair, so it survives insertion unmerged, yet
    /// each member waits on another and the gate can never close over any
    /// of them individually. Merging every group of mutually *reachable*
    /// boxes closes the gate over the whole cycle. Returns true if
    /// anything merged.
    fn merge_cycles(&mut self) -> bool {
        let keys: Vec<Dot> = self.pending.keys().copied().collect();
        let n = keys.len();
        if n < 2 {
            return false;
        }

        // reach[i][j]: box j is in box i's causal past
        let mut reach = vec![vec![false; n]; n];
        for i in 0..n {
            for j in 0..n {
                reach[i][j] = i != j && self.pending[&keys[j]].before(&self.pending[&keys[i]]);
            }
        }
        // transitive closure
        for k in 0..n {
            for i in 0..n {
                if reach[i][k] {
                    for j in 0..n {
                        if reach[k][j] {
                            reach[i][j] = true;
                        }
                    }
                }
            }
        }

        let mut merged_any = false;
        let mut grouped = vec![false; n];
        for i in 0..n {
            if grouped[i] {
                continue;
            }
            let cycle: Vec<usize> = ((i + 1)..n)
                .filter(|&j| !grouped[j] && reach[i][j] && reach[j][i])
                .collect();
            if cycle.is_empty() {
                continue;
            }
            let mut merged = self.pending.remove(&keys[i]).expect("key listed above");
            for &j in &cycle {
                grouped[j] = true;
                let member = self.pending.remove(&keys[j]).expect("key listed above");
                trace!(merged = ?member.dots(), into = ?merged.dots(), "merging dependency cycle");
                merged.merge(member);
            }
            merged.absorb(&self.delivered);
            let key = merged
                .dots()
                .min()
                .expect("a queue box holds at least one commit");
            let displaced = self.pending.insert(key, merged);
            debug_assert!(
                displaced.is_none(),
                "the merged cycle reuses its smallest member key"
            );
            merged_any = true;
        }
        merged_any
    }

    /// Removes and returns the boxes that have passed the gate, in delivery
    /// order.
    pub fn take_ready(&mut self) -> Vec<B> {
        std::mem::take(&mut self.ready)
    }

    /// Drains everything currently deliverable as a flat message sequence.
    pub fn to_list(&mut self) -> Vec<Message> {
        self.take_ready()
            .iter()
            .flat_map(QueueBox::sort_messages)
            .collect()
    }

    /// Total number of commits still inside the queue (pending or ready).
    pub fn size(&self) -> usize {
        self.pending
            .values()
            .chain(self.ready.iter())
            .map(QueueBox::size)
            .sum()
    }

    /// Number of boxes still inside the queue (pending or ready).
    pub fn elements(&self) -> usize {
        self.pending.len() + self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }
}

/// Object-safe front for the queue kinds the pipeline can drive.
pub trait CommitQueue: Send {
    fn add(&mut self, commit: CommittedBox);

    /// Drains everything currently deliverable, in delivery order.
    fn to_list(&mut self) -> Vec<Message>;

    /// Commits still inside the queue.
    fn size(&self) -> usize;

    /// Boxes still inside the queue.
    fn elements(&self) -> usize;

    fn is_empty(&self) -> bool;
}

impl CommitQueue for DepQueue<CommittedBox> {
    fn add(&mut self, commit: CommittedBox) {
        DepQueue::add(self, commit);
    }

    fn to_list(&mut self) -> Vec<Message> {
        DepQueue::to_list(self)
    }

    fn size(&self) -> usize {
        DepQueue::size(self)
    }

    fn elements(&self) -> usize {
        DepQueue::elements(self)
    }

    fn is_empty(&self) -> bool {
        DepQueue::is_empty(self)
    }
}

/// The baseline queue: no ordering guarantees, every commit is deliverable
/// the moment it arrives, in arrival order.
///
/// Useful as a performance and correctness baseline when measuring what the
/// dependency-tracking queue costs.
#[derive(Default)]
pub struct RandomQueue {
    ready: Vec<CommittedBox>,
}

impl RandomQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommitQueue for RandomQueue {
    fn add(&mut self, commit: CommittedBox) {
        self.ready.push(commit);
    }

    fn to_list(&mut self) -> Vec<Message> {
        self.ready
            .drain(..)
            .flat_map(|commit| commit.sort_messages())
            .collect()
    }

    fn size(&self) -> usize {
        self.ready.iter().map(QueueBox::size).sum()
    }

    fn elements(&self) -> usize {
        self.ready.len()
    }

    fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}
