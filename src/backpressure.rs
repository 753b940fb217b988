//! Outbound queue
//!
//! Bounded per-connection buffer between the hub's publish path and the
//! transport writer. Enqueue never blocks and never evicts: a full
//! queue is the subscriber's failure, surfaced as an error the hub
//! answers by disconnecting that subscriber. Slow consumers therefore
//! cannot stall publishing or silently lose interior events.

use std::collections::VecDeque;

use thiserror::Error;

use crate::events::PipelineEvent;

/// The queue was at capacity; the connection must go.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("outbound queue full at {capacity} events")]
pub struct QueueFull {
    pub capacity: usize,
}

#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    queue: VecDeque<PipelineEvent>,
    enqueued_total: u64,
    drained_total: u64,
    peak_depth: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: VecDeque::new(),
            enqueued_total: 0,
            drained_total: 0,
            peak_depth: 0,
        }
    }

    /// Non-blocking append in publish order.
    pub fn enqueue(&mut self, event: PipelineEvent) -> Result<(), QueueFull> {
        if self.queue.len() >= self.capacity {
            return Err(QueueFull {
                capacity: self.capacity,
            });
        }
        self.queue.push_back(event);
        self.enqueued_total += 1;
        self.peak_depth = self.peak_depth.max(self.queue.len());
        Ok(())
    }

    /// Pop up to `max` events, oldest first.
    pub fn drain(&mut self, max: usize) -> Vec<PipelineEvent> {
        let take = max.min(self.queue.len());
        let batch: Vec<PipelineEvent> = self.queue.drain(..take).collect();
        self.drained_total += batch.len() as u64;
        batch
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deepest the queue has ever been.
    pub fn peak_depth(&self) -> usize {
        self.peak_depth
    }

    pub fn enqueued_total(&self) -> u64 {
        self.enqueued_total
    }

    pub fn drained_total(&self) -> u64 {
        self.drained_total
    }
}
