//! Consumer registry of an output channel.
//!
//! Shared consumers partition the stream between them, copy consumers each
//! see every chunk. A shared consumer is "ready" while its instance id sits
//! in `share_next`; a copy consumer carries its own flag. Chunks that cannot
//! be delivered yet wait as leases on a consumer's queue, or on the
//! channel-level backlog while nobody is connected at all. Chunks handed to
//! a local consumer stay leased in its `in_flight` list until it releases
//! them or disconnects.

use std::collections::VecDeque;

use serde::Serialize;

use sluice_core::wire::{Frame, LocalChunkRef};
use sluice_core::{DataDistribution, DistributionMode, MemoryLocation, SlownessPolicy};
use sluice_pool::ChunkLease;

use crate::delivery::{Outbound, WriterTracker};
use crate::error::ChannelError;
use crate::transport::OutboundTx;

/// Identifies one accepted connection.
pub type ConnId = u64;

pub struct Consumer {
    pub conn: ConnId,
    pub instance_id: String,
    pub memory_location: MemoryLocation,
    pub on_slowness: SlownessPolicy,
    tx: OutboundTx,
    /// Copy consumers only.
    ready: bool,
    queue: VecDeque<ChunkLease>,
    /// Local chunks sent but not yet released by the consumer.
    in_flight: Vec<ChunkLease>,
}

impl Consumer {
    /// Queue the chunk on this consumer's connection.
    pub fn deliver(&mut self, lease: ChunkLease, writers: &WriterTracker) -> Result<(), ChannelError> {
        let out = match self.memory_location {
            MemoryLocation::Local => {
                let reference = LocalChunkRef {
                    pool_id: lease.pool().id(),
                    channel_id: lease.channel(),
                    chunk_id: lease.chunk(),
                };
                self.in_flight.push(lease);
                Outbound::control(Frame::LocalChunk(reference))
            }
            MemoryLocation::Remote => {
                let serialized = lease.pool().serialized(lease.channel(), lease.chunk())?;
                let writer = writers.register(lease.pool(), lease.channel(), lease.chunk());
                Outbound::remote(serialized.to_frame(), lease, writer)
            }
        };
        if self.tx.send(out).is_err() {
            tracing::warn!(instance_id = %self.instance_id, "consumer connection gone, chunk released");
        }
        Ok(())
    }

    pub fn send_control(&self, frame: Frame) {
        let _ = self.tx.send(Outbound::control(frame));
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Drop the holds on local chunks the consumer is done with. Returns
    /// how many were released.
    fn release(&mut self, released: &[LocalChunkRef]) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|lease| {
            !released.iter().any(|r| {
                r.pool_id == lease.pool().id() && r.channel_id == lease.channel() && r.chunk_id == lease.chunk()
            })
        });
        before - self.in_flight.len()
    }
}

/// What a hello did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hello {
    New(DataDistribution),
    /// Known instance id, transport replaced.
    Replaced(DataDistribution),
}

/// What to do with a chunk for the shared consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedStep {
    /// Deliver to the consumer at this index.
    Deliver(usize),
    /// Park on this consumer's queue.
    Enqueue(usize),
    /// Park on the channel backlog.
    Backlog,
    /// Release the chunk.
    Drop,
    /// Release the chunk and fail the update.
    Throw,
    /// Nobody eligible yet, poll again.
    Wait,
}

#[derive(Default)]
pub struct Registry {
    shared: Vec<Consumer>,
    copies: Vec<Consumer>,
    share_next: VecDeque<String>,
    cursor: usize,
    backlog: VecDeque<ChunkLease>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared_count(&self) -> usize {
        self.shared.len()
    }

    pub fn copy_count(&self) -> usize {
        self.copies.len()
    }

    pub fn has_local(&self) -> bool {
        self.shared
            .iter()
            .chain(&self.copies)
            .any(|c| c.memory_location == MemoryLocation::Local)
    }

    /// Chunks parked on consumer queues.
    pub fn queued_total(&self) -> usize {
        self.shared.iter().chain(&self.copies).map(Consumer::queued).sum()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn all(&self) -> impl Iterator<Item = &Consumer> {
        self.shared.iter().chain(&self.copies)
    }

    // ── Registration ──

    /// Register a consumer, or replace the transport of a known one. A new
    /// shared consumer inherits the backlog.
    pub fn hello(
        &mut self,
        conn: ConnId,
        instance_id: String,
        memory_location: MemoryLocation,
        distribution: DataDistribution,
        on_slowness: SlownessPolicy,
        tx: OutboundTx,
    ) -> Hello {
        // A re-hello may also switch roles. Chunks in flight on the old
        // transport are released with it.
        let (mut queue, replaced) = match self.take(&instance_id) {
            Some(old) => (old.queue, true),
            None => (VecDeque::new(), false),
        };
        let consumer = |queue| Consumer {
            conn,
            instance_id,
            memory_location,
            on_slowness,
            tx,
            ready: false,
            queue,
            in_flight: Vec::new(),
        };
        match distribution {
            DataDistribution::Shared => {
                queue.extend(self.backlog.drain(..));
                self.shared.push(consumer(queue));
            }
            DataDistribution::Copy => self.copies.push(consumer(queue)),
        }
        if replaced {
            Hello::Replaced(distribution)
        } else {
            Hello::New(distribution)
        }
    }

    /// Remove the consumer registered on `conn`. Its queued shared chunks
    /// move to the next shared consumer; anything left, in-flight local
    /// chunks included, is released when the returned consumer is dropped.
    pub fn remove_conn(&mut self, conn: ConnId) -> Option<Consumer> {
        if let Some(i) = self.shared.iter().position(|c| c.conn == conn) {
            let mut gone = self.shared.remove(i);
            self.share_next.retain(|id| *id != gone.instance_id);
            if !self.shared.is_empty() {
                let heir = self.next_cursor();
                self.shared[heir].queue.extend(gone.queue.drain(..));
            }
            return Some(gone);
        }
        let i = self.copies.iter().position(|c| c.conn == conn)?;
        Some(self.copies.remove(i))
    }

    fn take(&mut self, instance_id: &str) -> Option<Consumer> {
        if let Some(i) = self.shared.iter().position(|c| c.instance_id == instance_id) {
            self.share_next.retain(|id| id != instance_id);
            return Some(self.shared.remove(i));
        }
        let i = self.copies.iter().position(|c| c.instance_id == instance_id)?;
        Some(self.copies.remove(i))
    }

    // ── Readiness ──

    fn find_mut(&mut self, instance_id: &str) -> Option<&mut Consumer> {
        self.shared
            .iter_mut()
            .chain(self.copies.iter_mut())
            .find(|c| c.instance_id == instance_id)
    }

    /// Release local chunks the consumer reported done with.
    pub fn release(&mut self, instance_id: &str, released: &[LocalChunkRef]) -> usize {
        if released.is_empty() {
            return 0;
        }
        match self.find_mut(instance_id) {
            Some(c) => c.release(released),
            None => 0,
        }
    }

    /// A consumer asked for more. Flushes one queued chunk if it has any,
    /// otherwise marks it ready. Returns true if it became ready.
    pub fn available(&mut self, instance_id: &str, writers: &WriterTracker) -> bool {
        let Some(c) = self.find_mut(instance_id) else {
            tracing::warn!(%instance_id, "update from an input channel that never said hello");
            return false;
        };
        if let Some(lease) = c.queue.pop_front() {
            tracing::debug!(%instance_id, chunk = %lease.chunk(), "writing queued data");
            match c.deliver(lease, writers) {
                Ok(()) => return false,
                Err(e) => tracing::warn!(%instance_id, error = %e, "failed to write queued data, chunk dropped"),
            }
        }
        if self.copies.iter().any(|c| c.instance_id == instance_id) {
            if let Some(c) = self.find_mut(instance_id) {
                c.ready = true;
            }
        } else if !self.share_next.iter().any(|id| id == instance_id) {
            self.share_next.push_back(instance_id.to_string());
        }
        true
    }

    // ── Shared selection ──

    fn next_cursor(&mut self) -> usize {
        let i = self.cursor % self.shared.len();
        self.cursor = (i + 1) % self.shared.len();
        i
    }

    /// Decide where the next chunk goes among the shared consumers. Picking
    /// a consumer to deliver to consumes its readiness.
    pub fn plan_shared(&mut self, mode: DistributionMode, policy: SlownessPolicy) -> SharedStep {
        if self.shared.is_empty() {
            return if self.copies.is_empty() && policy == SlownessPolicy::Queue {
                SharedStep::Backlog
            } else {
                SharedStep::Drop
            };
        }
        match mode {
            DistributionMode::RoundRobin => {
                let i = self.cursor % self.shared.len();
                let id = &self.shared[i].instance_id;
                if let Some(pos) = self.share_next.iter().position(|n| n == id) {
                    self.share_next.remove(pos);
                    self.next_cursor();
                    return SharedStep::Deliver(i);
                }
                match policy {
                    // Keep the cursor on this consumer while waiting for it.
                    SlownessPolicy::Wait => SharedStep::Wait,
                    SlownessPolicy::Queue => SharedStep::Enqueue(self.next_cursor()),
                    SlownessPolicy::Drop => {
                        self.next_cursor();
                        SharedStep::Drop
                    }
                    SlownessPolicy::Throw => {
                        self.next_cursor();
                        SharedStep::Throw
                    }
                }
            }
            DistributionMode::LoadBalanced => {
                while let Some(id) = self.share_next.pop_front() {
                    if let Some(i) = self.shared.iter().position(|c| c.instance_id == id) {
                        return SharedStep::Deliver(i);
                    }
                }
                match policy {
                    SlownessPolicy::Wait => SharedStep::Wait,
                    SlownessPolicy::Queue => SharedStep::Enqueue(self.next_cursor()),
                    SlownessPolicy::Drop => SharedStep::Drop,
                    SlownessPolicy::Throw => SharedStep::Throw,
                }
            }
        }
    }

    /// Carry out a delivering step planned by `plan_shared`.
    pub fn apply_shared(&mut self, step: SharedStep, lease: ChunkLease, writers: &WriterTracker) -> Result<(), ChannelError> {
        match step {
            SharedStep::Deliver(i) => {
                let delivered = self.shared[i].deliver(lease, writers);
                if delivered.is_err() {
                    // The consumer is still waiting for a chunk.
                    self.share_next.push_front(self.shared[i].instance_id.clone());
                }
                delivered
            }
            SharedStep::Enqueue(i) => {
                self.shared[i].queue.push_back(lease);
                Ok(())
            }
            SharedStep::Backlog => {
                self.backlog.push_back(lease);
                Ok(())
            }
            SharedStep::Drop | SharedStep::Throw | SharedStep::Wait => Ok(()),
        }
    }

    // ── Copy consumers ──

    pub fn copy_ids(&self) -> Vec<String> {
        self.copies.iter().map(|c| c.instance_id.clone()).collect()
    }

    /// First throw-policy copy consumer that is not ready, if any.
    pub fn unready_throw_copy(&self) -> Option<&str> {
        self.copies
            .iter()
            .find(|c| c.on_slowness == SlownessPolicy::Throw && !c.ready)
            .map(|c| c.instance_id.as_str())
    }

    /// Try to hand the chunk to one copy consumer. Returns the lease back
    /// if the consumer is not ready and its policy is `wait`.
    pub fn offer_copy(
        &mut self,
        instance_id: &str,
        lease: ChunkLease,
        writers: &WriterTracker,
    ) -> Result<Option<ChunkLease>, ChannelError> {
        let Some(c) = self.copies.iter_mut().find(|c| c.instance_id == instance_id) else {
            // Gone meanwhile, the lease is released here.
            return Ok(None);
        };
        if c.ready {
            c.ready = false;
            if let Err(e) = c.deliver(lease, writers) {
                c.ready = true;
                return Err(e);
            }
            return Ok(None);
        }
        match c.on_slowness {
            SlownessPolicy::Drop => {
                tracing::debug!(%instance_id, chunk = %lease.chunk(), "dropping copied data");
                Ok(None)
            }
            SlownessPolicy::Queue => {
                tracing::debug!(%instance_id, chunk = %lease.chunk(), "queuing copied data");
                c.queue.push_back(lease);
                Ok(None)
            }
            SlownessPolicy::Throw => Err(ChannelError::CopyInputNotReady(instance_id.to_string())),
            SlownessPolicy::Wait => Ok(Some(lease)),
        }
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        let info = |c: &Consumer, ready: bool| ConsumerInfo {
            instance_id: c.instance_id.clone(),
            memory_location: c.memory_location,
            on_slowness: c.on_slowness,
            ready,
            queued: c.queue.len(),
            in_flight: c.in_flight.len(),
        };
        ConsumerSnapshot {
            shared: self
                .shared
                .iter()
                .map(|c| info(c, self.share_next.contains(&c.instance_id)))
                .collect(),
            copies: self.copies.iter().map(|c| info(c, c.ready)).collect(),
            backlog: self.backlog.len(),
        }
    }
}

/// Point-in-time view of an output channel's consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerSnapshot {
    pub shared: Vec<ConsumerInfo>,
    pub copies: Vec<ConsumerInfo>,
    pub backlog: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub instance_id: String,
    pub memory_location: MemoryLocation,
    pub on_slowness: SlownessPolicy,
    pub ready: bool,
    pub queued: usize,
    /// Local chunks the consumer has not released yet.
    pub in_flight: usize,
}
