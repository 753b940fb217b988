//! Per-channel replay history
//!
//! Bounded ring of the most recently published events, replayed to new
//! subscribers so they join with context instead of a cold stream. The
//! ring holds events in publish order; once full, each push evicts the
//! oldest entry.

use std::collections::VecDeque;

use crate::events::PipelineEvent;
use crate::protocol::SubscriptionFilter;

#[derive(Debug)]
pub struct ChannelHistory {
    capacity: usize,
    ring: VecDeque<PipelineEvent>,
}

impl ChannelHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Append a published event, evicting the oldest past capacity.
    pub fn push(&mut self, event: PipelineEvent) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(event);
    }

    /// Retained events matching the filter, oldest first.
    pub fn replay(&self, filter: &SubscriptionFilter) -> Vec<PipelineEvent> {
        self.ring
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence of the newest retained event, if any.
    pub fn last_sequence(&self) -> Option<u64> {
        self.ring.back().map(|event| event.sequence)
    }
}
