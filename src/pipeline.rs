// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Delivery pipeline
//!
//! The queue engine is single-writer by design. This module packages the
//! required discipline: commit-reception contexts push into a bounded
//! channel, one dedicated thread owns the queue and processes inserts
//! sequentially, and ordered batches come out the other end. A full channel
//! blocks producers; nothing is dropped.

use std::sync::mpsc::{Receiver, Sender, SyncSender};
use std::thread::JoinHandle;

use tracing::{debug, error, warn};

use crate::clock::{Clock, Dot, ExceptionSet, MaxInt};
use crate::message::Message;
use crate::queue::{CommitQueue, CommittedBox, DepQueue, InvalidCommit, RandomQueue};

/// Which queue implementation the pipeline drives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum QueueKind {
    /// The dependency-tracking queue: causal, replica-identical delivery.
    #[default]
    Dep,
    /// The baseline queue: immediate delivery in arrival order.
    Random,
}

/// Configuration of a [`Pipeline`].
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Bound of the inbound commit channel. A full channel blocks
    /// [`Pipeline::commit`] until the deliverer catches up.
    pub capacity: usize,
    pub queue: QueueKind,
    /// Dots the execution layer has already applied, typically from a
    /// recovery snapshot. Commits whose dependencies fall entirely under
    /// this clock deliver immediately.
    pub delivered: Clock<ExceptionSet>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            queue: QueueKind::default(),
            delivered: Clock::new(),
        }
    }
}

/// A commit was not accepted by the pipeline.
#[derive(Debug)]
pub enum CommitError {
    /// The commit violates a protocol invariant and would corrupt conflict
    /// tracking; it never entered the queue.
    Invalid(InvalidCommit),
    /// The pipeline has shut down.
    Closed,
}

impl std::fmt::Display for CommitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(invalid) => invalid.fmt(f),
            Self::Closed => write!(f, "the delivery pipeline has shut down"),
        }
    }
}

impl std::error::Error for CommitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Invalid(invalid) => Some(invalid),
            Self::Closed => None,
        }
    }
}

impl From<InvalidCommit> for CommitError {
    fn from(invalid: InvalidCommit) -> Self {
        Self::Invalid(invalid)
    }
}

/// A running delivery pipeline.
///
/// Dropping the pipeline closes the commit channel and joins the deliverer
/// thread; commits still stalled on missing dependencies are discarded,
/// which is safe because delivery is the only externally observable event.
pub struct Pipeline {
    commits: Option<SyncSender<CommittedBox>>,
    batches: Receiver<Vec<Message>>,
    deliverer: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns the deliverer thread and returns the handle producers and the
    /// execution layer share.
    pub fn spawn(config: PipelineConfig) -> std::io::Result<Self> {
        let (commits, inbound) = std::sync::mpsc::sync_channel(config.capacity);
        let (outbound, batches) = std::sync::mpsc::channel();
        let queue: Box<dyn CommitQueue> = match config.queue {
            QueueKind::Dep => Box::new(DepQueue::with_delivered(config.delivered)),
            QueueKind::Random => Box::new(RandomQueue::new()),
        };
        let deliverer = std::thread::Builder::new()
            .name("deliverer".into())
            .spawn(move || run(queue, inbound, outbound))?;
        Ok(Self {
            commits: Some(commits),
            batches,
            deliverer: Some(deliverer),
        })
    }

    /// Hands one committed operation to the deliverer.
    ///
    /// Validates the commit first: a message that does not carry exactly
    /// one color is rejected without entering the queue. Blocks while the
    /// commit channel is full.
    pub fn commit(
        &self,
        dot: Dot,
        dep: Clock<ExceptionSet>,
        message: Message,
        conf: Clock<MaxInt>,
    ) -> Result<(), CommitError> {
        let commit = CommittedBox::new(dot, dep, message, conf)?;
        self.commits
            .as_ref()
            .ok_or(CommitError::Closed)?
            .send(commit)
            .map_err(|_| CommitError::Closed)
    }

    /// Blocks until the next ordered batch, or returns `None` once the
    /// pipeline has shut down and all batches are consumed.
    pub fn recv_batch(&self) -> Option<Vec<Message>> {
        self.batches.recv().ok()
    }

    /// The outbound batch channel, for callers that need timeouts or their
    /// own receive loop.
    pub fn batches(&self) -> &Receiver<Vec<Message>> {
        &self.batches
    }

    /// Closes the commit channel and waits for the deliverer to drain it.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.commits.take();
        if let Some(deliverer) = self.deliverer.take()
            && deliverer.join().is_err()
        {
            error!("deliverer thread panicked");
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}

/// The deliverer loop: owns the queue, the sole mutator.
fn run(mut queue: Box<dyn CommitQueue>, inbound: Receiver<CommittedBox>, outbound: Sender<Vec<Message>>) {
    debug!("deliverer running");
    while let Ok(commit) = inbound.recv() {
        queue.add(commit);
        let batch = queue.to_list();
        if batch.is_empty() {
            continue;
        }
        debug!(messages = batch.len(), "batch ready");
        if outbound.send(batch).is_err() {
            debug!("batch receiver dropped, stopping");
            break;
        }
    }
    if !queue.is_empty() {
        warn!(
            commits = queue.size(),
            boxes = queue.elements(),
            "discarding stalled commits at shutdown"
        );
    }
    debug!("deliverer stopped");
}
