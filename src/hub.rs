//! Distribution hub
//!
//! Connection registry and fan-out core:
//! - lifecycle `Connecting → Active → Closed`; a connection activates on
//!   its first client message (subscribe or pong)
//! - per-channel subscriptions with typed filters
//! - publish assigns the channel's next sequence, appends to replay
//!   history, and enqueues to every matching subscriber; a full queue
//!   disconnects that subscriber and never blocks the rest
//! - new subscribers receive the channel's filtered replay history, so
//!   replay and the live stream meet without gaps or duplicates
//! - sweep disconnects connections silent past the heartbeat timeout
//!
//! The hub is synchronous and single-owner; the service wraps it in an
//! actor task, which is what makes subscribe-vs-publish ordering exact.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backpressure::OutboundQueue;
use crate::events::PipelineEvent;
use crate::history::ChannelHistory;
use crate::protocol::{Channel, SubscriptionFilter};

pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    IdleTimeout,
    Explicit,
    QueueOverflow,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::Explicit => "explicit",
            Self::QueueOverflow => "queue_overflow",
            Self::Shutdown => "shutdown",
        }
    }
}

/// One subscriber connection and its outbound queue.
#[derive(Debug)]
pub struct SubscriberConnection {
    pub id: ClientId,
    /// Transport-provided name for logs (remote address, user agent).
    pub identity: String,
    pub state: ConnectionState,
    pub subscriptions: BTreeMap<Channel, SubscriptionFilter>,
    queue: OutboundQueue,
    pub connected_at: i64,
    pub last_activity: i64,
    pub close_reason: Option<CloseReason>,
}

impl SubscriberConnection {
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.subscriptions.contains_key(&channel)
    }
}

/// Configuration for the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Outbound queue bound per connection (default: 256).
    pub queue_capacity: usize,
    /// Replay events retained per channel (default: 64).
    pub history_len: usize,
    /// Ping cadence (default: 30s).
    pub heartbeat_interval_nanos: i64,
    /// Silence past this disconnects (default: 90s).
    pub heartbeat_timeout_nanos: i64,
    /// Channel subscriptions allowed per client (default: 16).
    pub max_subscriptions_per_client: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            history_len: 64,
            heartbeat_interval_nanos: 30 * 1_000_000_000,
            heartbeat_timeout_nanos: 90 * 1_000_000_000,
            max_subscriptions_per_client: 16,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("unknown client {id}")]
    UnknownClient { id: ClientId },
    #[error("client {id} exceeded subscription limit of {limit}")]
    SubscriptionLimit { id: ClientId, limit: usize },
}

/// What one publish did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Channel sequence assigned to the event.
    pub sequence: u64,
    /// Subscribers the event was enqueued to.
    pub delivered: u32,
    /// Subscribers disconnected for queue overflow by this publish.
    pub dropped: Vec<ClientId>,
}

/// Result of a transport writer's drain poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Events(Vec<PipelineEvent>),
    /// The connection closed since the last poll; the reason is handed
    /// over exactly once so the writer can send the close notice.
    Closed(CloseReason),
    Unknown,
}

/// Synchronous fan-out core; the service serializes access through one
/// actor task.
pub struct DistributionHub {
    config: HubConfig,
    connections: BTreeMap<ClientId, SubscriberConnection>,
    histories: BTreeMap<Channel, ChannelHistory>,
    sequences: BTreeMap<Channel, u64>,
    /// Close reasons awaiting pickup by the transport writer.
    pending_closes: BTreeMap<ClientId, (CloseReason, i64)>,
    next_client_id: ClientId,
    events_published: u64,
    clients_connected_total: u64,
    overflow_disconnects: u64,
    idle_disconnects: u64,
}

impl DistributionHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            connections: BTreeMap::new(),
            histories: BTreeMap::new(),
            sequences: BTreeMap::new(),
            pending_closes: BTreeMap::new(),
            next_client_id: 1,
            events_published: 0,
            clients_connected_total: 0,
            overflow_disconnects: 0,
            idle_disconnects: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    /// Register a new connection in `Connecting` state.
    pub fn connect(&mut self, identity: &str, now: i64) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients_connected_total += 1;

        self.connections.insert(
            id,
            SubscriberConnection {
                id,
                identity: identity.to_string(),
                state: ConnectionState::Connecting,
                subscriptions: BTreeMap::new(),
                queue: OutboundQueue::new(self.config.queue_capacity),
                connected_at: now,
                last_activity: now,
                close_reason: None,
            },
        );

        info!(client_id = id, identity, "Client connected");
        id
    }

    /// Remove the connection everywhere and park its close reason for
    /// the transport writer.
    pub fn disconnect(
        &mut self,
        id: ClientId,
        reason: CloseReason,
        now: i64,
    ) -> Option<SubscriberConnection> {
        let mut connection = self.connections.remove(&id)?;
        connection.state = ConnectionState::Closed;
        connection.close_reason = Some(reason);
        self.pending_closes.insert(id, (reason, now));

        match reason {
            CloseReason::QueueOverflow => {
                self.overflow_disconnects += 1;
                warn!(
                    client_id = id,
                    queued = connection.queue.len(),
                    "Client disconnected: outbound queue overflow"
                );
            }
            CloseReason::IdleTimeout => {
                self.idle_disconnects += 1;
                warn!(
                    client_id = id,
                    idle_nanos = now - connection.last_activity,
                    "Client disconnected: heartbeat timeout"
                );
            }
            _ => {
                info!(client_id = id, reason = reason.as_str(), "Client disconnected");
            }
        }
        Some(connection)
    }

    /// Register a subscription and return the channel's filtered replay
    /// history, oldest first. Re-subscribing replaces the filter.
    pub fn subscribe(
        &mut self,
        id: ClientId,
        channel: Channel,
        filter: SubscriptionFilter,
        now: i64,
    ) -> Result<Vec<PipelineEvent>, HubError> {
        let limit = self.config.max_subscriptions_per_client;
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(HubError::UnknownClient { id })?;
        if !connection.subscriptions.contains_key(&channel)
            && connection.subscriptions.len() >= limit
        {
            return Err(HubError::SubscriptionLimit { id, limit });
        }

        Self::activate(connection, now);
        connection.subscriptions.insert(channel, filter.clone());

        let replay = self
            .histories
            .get(&channel)
            .map(|history| history.replay(&filter))
            .unwrap_or_default();

        debug!(
            client_id = id,
            channel = %channel,
            replayed = replay.len(),
            "Client subscribed"
        );
        Ok(replay)
    }

    pub fn unsubscribe(
        &mut self,
        id: ClientId,
        channel: Channel,
        now: i64,
    ) -> Result<bool, HubError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(HubError::UnknownClient { id })?;
        Self::activate(connection, now);
        let was_subscribed = connection.subscriptions.remove(&channel).is_some();
        debug!(client_id = id, channel = %channel, "Client unsubscribed");
        Ok(was_subscribed)
    }

    /// Assign the channel's next sequence, append to history, and fan
    /// out. Full queues cost the offending subscriber its connection.
    pub fn publish(
        &mut self,
        channel: Channel,
        mut event: PipelineEvent,
        now: i64,
    ) -> PublishOutcome {
        let sequence = {
            let next = self.sequences.entry(channel).or_insert(0);
            *next += 1;
            *next
        };
        event.sequence = sequence;
        self.events_published += 1;

        self.histories
            .entry(channel)
            .or_insert_with(|| ChannelHistory::new(self.config.history_len))
            .push(event.clone());

        // Subscribing activates, so every subscriber here is Active.
        let mut delivered = 0u32;
        let mut overflowed = Vec::new();
        for connection in self.connections.values_mut() {
            let Some(filter) = connection.subscriptions.get(&channel) else {
                continue;
            };
            if !filter.matches(&event) {
                continue;
            }
            match connection.queue.enqueue(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => overflowed.push(connection.id),
            }
        }

        for id in &overflowed {
            self.disconnect(*id, CloseReason::QueueOverflow, now);
        }

        PublishOutcome {
            sequence,
            delivered,
            dropped: overflowed,
        }
    }

    /// Transport writer poll: a batch of queued events, or the parked
    /// close reason if the connection is gone.
    pub fn drain(&mut self, id: ClientId, max: usize) -> DrainOutcome {
        if let Some(connection) = self.connections.get_mut(&id) {
            return DrainOutcome::Events(connection.queue.drain(max));
        }
        match self.pending_closes.remove(&id) {
            Some((reason, _)) => DrainOutcome::Closed(reason),
            None => DrainOutcome::Unknown,
        }
    }

    /// Client liveness signal; also the first-message activation path
    /// for clients that never subscribe.
    pub fn record_pong(&mut self, id: ClientId, now: i64) -> Result<(), HubError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(HubError::UnknownClient { id })?;
        Self::activate(connection, now);
        Ok(())
    }

    /// Disconnect every connection silent past the heartbeat timeout,
    /// `Connecting` ones included. Returns the disconnected ids.
    pub fn sweep(&mut self, now: i64) -> Vec<ClientId> {
        let timeout = self.config.heartbeat_timeout_nanos;
        let idle: Vec<ClientId> = self
            .connections
            .values()
            .filter(|c| now - c.last_activity > timeout)
            .map(|c| c.id)
            .collect();
        for id in &idle {
            self.disconnect(*id, CloseReason::IdleTimeout, now);
        }
        // Parked close reasons nobody drained eventually expire too.
        self.pending_closes
            .retain(|_, (_, closed_at)| now - *closed_at <= timeout);
        idle
    }

    /// Disconnect everything; the service calls this on shutdown.
    pub fn close_all(&mut self, now: i64) -> Vec<ClientId> {
        let ids: Vec<ClientId> = self.connections.keys().copied().collect();
        for id in &ids {
            self.disconnect(*id, CloseReason::Shutdown, now);
        }
        ids
    }

    pub fn connection(&self, id: ClientId) -> Option<&SubscriberConnection> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.connections.keys().copied().collect()
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.connections
            .values()
            .filter(|c| c.is_subscribed(channel))
            .count()
    }

    pub fn history_len(&self, channel: Channel) -> usize {
        self.histories.get(&channel).map_or(0, |h| h.len())
    }

    pub fn events_published(&self) -> u64 {
        self.events_published
    }

    pub fn clients_connected_total(&self) -> u64 {
        self.clients_connected_total
    }

    pub fn overflow_disconnects(&self) -> u64 {
        self.overflow_disconnects
    }

    pub fn idle_disconnects(&self) -> u64 {
        self.idle_disconnects
    }

    fn activate(connection: &mut SubscriberConnection, now: i64) {
        connection.last_activity = now;
        if connection.state == ConnectionState::Connecting {
            connection.state = ConnectionState::Active;
            debug!(client_id = connection.id, "Client active");
        }
    }
}
