// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Tangle: Causal, Conflict-Aware Commit Delivery
//!
//! This crate implements the delivery half of a leaderless replication
//! protocol: given operations that have already been **committed** (by an
//! EPaxos / Generalized-Paxos style consensus layer, out of scope here),
//! it emits them to the local execution layer in an order that
//!
//! 1. respects every commit's declared causal dependencies, and
//! 2. is *identical* on every replica, no matter in which order the
//!    commits arrived there.
//!
//! Agreement on *what* was committed is the cheap part of such protocols.
//! Agreement on the *execution order* of conflicting commits is the hard
//! part, and it is exactly the part this crate covers.
//!
//! ## Core Concepts
//!
//! - A [`Dot`] identifies one committed operation: the replica that
//!   coordinated it plus a per-replica sequence number. Dots are never
//!   recycled.
//! - A [`Clock`] maps each replica to a set of sequence numbers, either as
//!   a plain watermark ([`MaxInt`]) or as a watermark with holes
//!   ([`ExceptionSet`]). Commits arrive with two clocks: a dependency
//!   clock (`dep`, exception-set shaped) describing their causal past, and
//!   a `conf` snapshot (watermark shaped) of the coordinator's progress
//!   counters at proposal time.
//! - A [`Color`] is the hash of a payload's conflict key. Two commits
//!   conflict exactly when their colors are equal, and only conflicting
//!   commits need a total order; independent commits only need causality.
//! - The [`DepQueue`] engine gates each commit until its entire dependency
//!   clock has been delivered, merging commits that form dependency cycles
//!   so they deliver as one unit. Inside each delivered unit, a nested
//!   [`DepQueue`] run per color turns the partial order of the `conf`
//!   snapshots into the final total order, falling back to dot order where
//!   snapshots tie.
//!
//! ## Usage
//!
//! Drive the queue directly if you already have a single-threaded event
//! loop:
//!
//! ```
//! use tangle::{Clock, Color, CommittedBox, DepQueue, Dot, Message};
//!
//! let mut queue = DepQueue::new();
//!
//! // r2#1 depends on r1#1, but arrives first: it stalls.
//! let mut dep = Clock::new();
//! dep.add_dot(Dot::mint(1.into(), 1));
//! let reply = Message::new(Color::from("chat"), b"re: hi".to_vec());
//! queue.add(CommittedBox::new(Dot::mint(2.into(), 1), dep, reply, Clock::new())?);
//! assert!(queue.to_list().is_empty());
//!
//! // The dependency arrives; both deliver, dependency first.
//! let hi = Message::new(Color::from("chat"), b"hi".to_vec());
//! queue.add(CommittedBox::new(Dot::mint(1.into(), 1), Clock::new(), hi, Clock::new())?);
//! let batch = queue.to_list();
//! assert_eq!(batch.len(), 2);
//! assert_eq!(batch[0].data(), b"hi");
//! # Ok::<(), tangle::InvalidCommit>(())
//! ```
//!
//! Or spawn a [`Pipeline`] when commits come from concurrent reception
//! contexts: it owns the queue on a dedicated thread, applies backpressure
//! through a bounded channel, and hands ordered batches to the execution
//! layer.
//!
//! ## What this crate is not
//!
//! There is no transport, no wire format, no persistence and no consensus
//! in here. The inbound interface is "here is a committed operation with
//! its dot, payload, dependency clock and conf snapshot"; the outbound
//! interface is a totally ordered stream of payloads. Everything else is
//! the surrounding protocol's business.

#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

pub mod clock;
pub use clock::{Clock, Dot, Dots, ExceptionSet, MaxInt, ReplicaId, SeqSet};
pub mod message;
pub use message::{Color, Message};
pub mod queue;
pub use queue::{
    CommitQueue, CommittedBox, DeliveredBox, DepQueue, InvalidCommit, PerMessage, QueueBox,
    RandomQueue,
};
pub mod pipeline;
pub use pipeline::{CommitError, Pipeline, PipelineConfig, QueueKind};
