// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The two box kinds the delivery engine operates on.
//!
//! A [`CommittedBox`] holds commits that have not yet passed the causal
//! gate. While pending, entangled boxes are merged, so a box accumulates
//! dots, dependency clock and messages from every commit in its dependency
//! cycle.
//!
//! A [`DeliveredBox`] holds commits of a single color that have passed the
//! gate and are waiting for their final intra-color order. Its dependency
//! clock is the *eclock* of one commit's conf snapshot, which imposes the
//! fine-grained partial order the nested queue totalizes.

use std::collections::BTreeMap;

use smallvec::{SmallVec, smallvec};

use super::{DepQueue, QueueBox};
use crate::clock::{Clock, Dot, Dots, ExceptionSet, MaxInt};
use crate::message::{Color, Message};

/// A commit whose message does not carry exactly one color.
///
/// This is a protocol invariant violation: conflict detection is undefined
/// for such a commit, so it must never enter a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidCommit {
    pub dot: Dot,
    pub colors: usize,
}

impl std::fmt::Display for InvalidCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "commit {} carries {} colors, expected exactly one",
            self.dot, self.colors
        )
    }
}

impl std::error::Error for InvalidCommit {}

/// One commit's (dot, message, conf snapshot) triple.
///
/// The conf snapshot records, per replica, the coordinator's local progress
/// counter at the moment the message was proposed. It is what breaks ties
/// between conflicting messages deterministically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerMessage {
    dot: Dot,
    message: Message,
    conf: Clock<MaxInt>,
}

impl PerMessage {
    pub fn new(dot: Dot, message: Message, conf: Clock<MaxInt>) -> Self {
        Self { dot, message, conf }
    }

    pub fn dot(&self) -> Dot {
        self.dot
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn conf(&self) -> &Clock<MaxInt> {
        &self.conf
    }
}

/// One or more commits that are not yet provably safe to release.
#[derive(Clone, Debug)]
pub struct CommittedBox {
    dots: Dots,
    dep: Clock<ExceptionSet>,
    messages: BTreeMap<Color, SmallVec<[PerMessage; 2]>>,
}

impl CommittedBox {
    /// Wraps a single commit.
    ///
    /// The commit's own dot is added to its dependency clock, so the clock
    /// denotes the commit's causal past *including itself*.
    pub fn new(
        dot: Dot,
        mut dep: Clock<ExceptionSet>,
        message: Message,
        conf: Clock<MaxInt>,
    ) -> Result<Self, InvalidCommit> {
        let Some(color) = message.color().cloned() else {
            return Err(InvalidCommit {
                dot,
                colors: message.colors().len(),
            });
        };
        dep.add_dot(dot);
        let messages = BTreeMap::from([(color, smallvec![PerMessage::new(dot, message, conf)])]);
        Ok(Self {
            dots: Dots::singleton(dot),
            dep,
            messages,
        })
    }

    /// Number of messages held, across all colors.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(SmallVec::len).sum()
    }

    pub fn colors(&self) -> impl Iterator<Item = &Color> + '_ {
        self.messages.keys()
    }
}

impl QueueBox for CommittedBox {
    fn dots(&self) -> &Dots {
        &self.dots
    }

    fn dep(&self) -> &Clock<ExceptionSet> {
        &self.dep
    }

    fn dep_mut(&mut self) -> &mut Clock<ExceptionSet> {
        &mut self.dep
    }

    fn merge(&mut self, other: Self) {
        self.dots.union(&other.dots);
        self.dep.merge(&other.dep);
        for (color, group) in other.messages {
            self.messages.entry(color).or_default().extend(group);
        }
    }

    /// Messages grouped by color, each group totally ordered by the nested
    /// queue, groups concatenated in color order.
    ///
    /// Duplicate messages committed via different dots are all emitted, once
    /// per dot; deduplication is the execution layer's concern.
    fn sort_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.message_count());
        for group in self.messages.values() {
            out.extend(sort_per_color(group));
        }
        out
    }
}

/// Total-orders one color's messages via a nested delivery queue over the
/// eclocks of their conf snapshots.
fn sort_per_color(group: &[PerMessage]) -> Vec<Message> {
    if let [only] = group {
        return vec![only.message().clone()];
    }

    // The group's list order reflects merge history, which differs between
    // replicas. Feed the nested queue in dot order instead; the gate
    // overrides it wherever the eclocks discriminate.
    let mut boxes: Vec<DeliveredBox> = group.iter().map(DeliveredBox::new).collect();
    boxes.sort_by_key(|member| member.dots().min());

    // Eclocks reference dots outside this color. Those have all passed the
    // top-level gate already, so for intra-color ordering they count as
    // delivered: seed the nested queue with every referenced dot that is
    // not itself a group member.
    let mut seed = Clock::new();
    for member in &boxes {
        seed.merge(member.dep());
    }
    for member in &boxes {
        for dot in member.dots().iter() {
            seed.remove_dot(dot);
        }
    }

    let mut queue = DepQueue::with_delivered(seed);
    for member in boxes {
        queue.add(member);
    }
    let out = queue.to_list();
    debug_assert!(
        queue.is_empty(),
        "a closed color group always drains fully"
    );
    debug_assert_eq!(out.len(), group.len());
    out
}

/// Commits of a single color that have passed the causal gate and await
/// their final deterministic order.
#[derive(Clone, Debug)]
pub struct DeliveredBox {
    dots: Dots,
    dep: Clock<ExceptionSet>,
    messages: BTreeMap<Dot, Message>,
}

impl DeliveredBox {
    /// Wraps a single gated commit, with the eclock of its conf snapshot as
    /// the dependency clock.
    pub fn new(per: &PerMessage) -> Self {
        let mut dep = Clock::eclock(per.conf());
        dep.add_dot(per.dot());
        Self {
            dots: Dots::singleton(per.dot()),
            dep,
            messages: BTreeMap::from([(per.dot(), per.message().clone())]),
        }
    }
}

impl QueueBox for DeliveredBox {
    fn dots(&self) -> &Dots {
        &self.dots
    }

    fn dep(&self) -> &Clock<ExceptionSet> {
        &self.dep
    }

    fn dep_mut(&mut self) -> &mut Clock<ExceptionSet> {
        &mut self.dep
    }

    fn merge(&mut self, other: Self) {
        self.dots.union(&other.dots);
        self.dep.merge(&other.dep);
        self.messages.extend(other.messages);
    }

    /// Dot order: the deterministic tie-break when the eclock partial order
    /// does not discriminate.
    fn sort_messages(&self) -> Vec<Message> {
        self.messages.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ReplicaId;

    fn dot(replica: u8, seq: u64) -> Dot {
        Dot::mint(replica.into(), seq)
    }

    fn conf(entries: &[(u8, u64)]) -> Clock<MaxInt> {
        entries
            .iter()
            .map(|&(replica, max)| (ReplicaId::new(replica), MaxInt::new(max)))
            .collect()
    }

    fn dep(dots: &[(u8, u64)]) -> Clock<ExceptionSet> {
        let mut clock = Clock::new();
        for &(replica, seq) in dots {
            clock.add_dot(dot(replica, seq));
        }
        clock
    }

    fn msg(color: &str, data: &str) -> Message {
        Message::new(Color::from(color), data.as_bytes().to_vec())
    }

    fn commit(d: Dot, deps: &[(u8, u64)], color: &str, confs: &[(u8, u64)]) -> CommittedBox {
        CommittedBox::new(d, dep(deps), msg(color, &d.to_string()), conf(confs))
            .expect("one color")
    }

    #[test]
    fn multi_color_commit_is_rejected() {
        let message = Message::with_colors([Color::from("a"), Color::from("b")], vec![]);
        let err = CommittedBox::new(dot(0, 1), Clock::new(), message, conf(&[]))
            .expect_err("two colors");
        assert_eq!(
            err,
            InvalidCommit {
                dot: dot(0, 1),
                colors: 2
            }
        );
        assert_eq!(
            err.to_string(),
            "commit r0#1 carries 2 colors, expected exactly one"
        );

        let colorless = Message::with_colors([], vec![]);
        assert!(CommittedBox::new(dot(0, 1), Clock::new(), colorless, conf(&[])).is_err());
    }

    #[test]
    fn new_box_depends_on_itself() {
        let b = commit(dot(1, 3), &[(0, 1)], "red", &[]);
        assert!(b.dep().contains(dot(1, 3)));
        assert!(b.dep().contains(dot(0, 1)));
        assert_eq!(b.size(), 1);
    }

    #[test]
    fn merge_combines_dots_deps_and_messages() {
        let mut a = commit(dot(0, 1), &[], "red", &[(0, 1)]);
        let b = commit(dot(1, 1), &[(0, 1)], "blue", &[(0, 1), (1, 1)]);
        a.merge(b);
        assert_eq!(a.size(), 2);
        assert!(a.dots().contains(dot(0, 1)) && a.dots().contains(dot(1, 1)));
        assert!(a.dep().contains(dot(0, 1)) && a.dep().contains(dot(1, 1)));
        assert_eq!(a.message_count(), 2);
        assert_eq!(a.colors().count(), 2);
    }

    #[test]
    fn merge_order_is_irrelevant() {
        let boxes = [
            commit(dot(0, 1), &[], "red", &[(0, 1)]),
            commit(dot(1, 1), &[(0, 1)], "red", &[(0, 1), (1, 1)]),
            commit(dot(2, 1), &[(1, 1)], "blue", &[(1, 1), (2, 1)]),
        ];
        let [a, b, c] = boxes.clone();
        let mut left = a;
        left.merge(b);
        left.merge(c);

        let [a, b, c] = boxes;
        let mut right = b;
        right.merge(c);
        let mut outer = a;
        outer.merge(right);

        assert_eq!(left.dots(), outer.dots());
        assert_eq!(left.dep(), outer.dep());
        assert_eq!(left.size(), outer.size());
        assert_eq!(left.message_count(), outer.message_count());
        // same multiset of messages per color
        let mut l = left.sort_messages();
        let mut r = outer.sort_messages();
        l.sort_by(|a, b| a.data().cmp(b.data()));
        r.sort_by(|a, b| a.data().cmp(b.data()));
        assert_eq!(l, r);
    }

    #[test]
    fn size_is_additive_for_disjoint_dots() {
        let mut a = commit(dot(0, 1), &[], "red", &[]);
        let b = commit(dot(0, 2), &[], "red", &[]);
        let (sa, sb) = (a.size(), b.size());
        a.merge(b);
        assert_eq!(a.size(), sa + sb);
    }

    #[test]
    fn clones_do_not_alias() {
        let mut original = commit(dot(0, 1), &[], "red", &[(0, 1)]);
        let snapshot = original.clone();
        original.merge(commit(dot(1, 1), &[], "red", &[(1, 1)]));
        assert_eq!(snapshot.size(), 1);
        assert_eq!(snapshot.message_count(), 1);
        assert!(!snapshot.dep().contains(dot(1, 1)));
        assert_eq!(original.size(), 2);
    }

    #[test]
    fn conf_domination_orders_a_color() {
        // V's conf strictly dominates U's, so U sorts first regardless of
        // merge order
        let u = commit(dot(0, 2), &[], "red", &[(0, 2), (1, 1)]);
        let v = commit(dot(1, 2), &[], "red", &[(0, 2), (1, 2)]);

        let mut uv = u.clone();
        uv.merge(v.clone());
        let mut vu = v;
        vu.merge(u);

        let expected = vec![msg("red", "r0#2"), msg("red", "r1#2")];
        assert_eq!(uv.sort_messages(), expected);
        assert_eq!(vu.sort_messages(), expected);
    }

    #[test]
    fn dot_order_breaks_conf_ties() {
        // identical confs: the eclock partial order cannot discriminate, so
        // the nested queue merges the cycle and falls back to dot order
        let snapshot = &[(0, 1), (2, 1)];
        let a = commit(dot(2, 1), &[], "red", snapshot);
        let b = commit(dot(0, 1), &[], "red", snapshot);

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);

        let expected = vec![msg("red", "r0#1"), msg("red", "r2#1")];
        assert_eq!(ab.sort_messages(), expected);
        assert_eq!(ba.sort_messages(), expected);
    }

    #[test]
    fn conf_visibility_cycles_collapse_to_dot_order() {
        // each conf sees one neighbor but not the other, a ring the eclock
        // partial order cannot break pairwise; every message must still
        // come out, in dot order
        let u = commit(dot(0, 1), &[], "red", &[(0, 1), (2, 1)]);
        let v = commit(dot(1, 1), &[], "red", &[(0, 1), (1, 1)]);
        let w = commit(dot(2, 1), &[], "red", &[(1, 1), (2, 1)]);

        let expected = vec![msg("red", "r0#1"), msg("red", "r1#1"), msg("red", "r2#1")];
        let mut uvw = u.clone();
        uvw.merge(v.clone());
        uvw.merge(w.clone());
        assert_eq!(uvw.sort_messages(), expected);

        let mut wvu = w;
        wvu.merge(v);
        wvu.merge(u);
        assert_eq!(wvu.sort_messages(), expected);
    }

    #[test]
    fn colors_sort_independently() {
        let mut b = commit(dot(0, 1), &[], "blue", &[(0, 1)]);
        b.merge(commit(dot(1, 1), &[], "red", &[(1, 1)]));
        b.merge(commit(dot(0, 2), &[], "blue", &[(0, 2), (1, 1)]));
        assert_eq!(
            b.sort_messages(),
            vec![msg("blue", "r0#1"), msg("blue", "r0#2"), msg("red", "r1#1")]
        );
    }

    #[test]
    fn duplicate_payloads_deliver_once_per_dot() {
        let payload = msg("red", "same");
        let a = CommittedBox::new(dot(0, 1), Clock::new(), payload.clone(), conf(&[(0, 1)]))
            .expect("one color");
        let b = CommittedBox::new(
            dot(1, 1),
            Clock::new(),
            payload.clone(),
            conf(&[(0, 1), (1, 1)]),
        )
        .expect("one color");
        let mut merged = a;
        merged.merge(b);
        assert_eq!(merged.sort_messages(), vec![payload.clone(), payload]);
    }

    #[test]
    fn delivered_box_sorts_by_dot() {
        let per = |replica, seq| {
            PerMessage::new(
                dot(replica, seq),
                msg("red", &dot(replica, seq).to_string()),
                conf(&[]),
            )
        };
        let mut b = DeliveredBox::new(&per(1, 1));
        b.merge(DeliveredBox::new(&per(0, 2)));
        b.merge(DeliveredBox::new(&per(0, 1)));
        assert_eq!(
            b.sort_messages(),
            vec![msg("red", "r0#1"), msg("red", "r0#2"), msg("red", "r1#1")]
        );
    }
}
