//! Service assembly
//!
//! Wires the synchronous cores into a running pipeline:
//! - a normalizer stage turns raw connector messages into canonical
//!   updates and routes them to symbol shards
//! - N shard workers, each owning its shard's aggregation and
//!   order-flow engines, drive ingest plus the cycle timers
//! - one hub actor owns the `DistributionHub` behind a command channel,
//!   which is what serializes subscribe against publish
//! - shutdown flows through a watch channel; the hub closes every
//!   connection before the tasks stop
//!
//! Stages hand off through bounded queues. The one lossy edge is
//! engine-to-hub publishing, which drops instead of stalling a shard
//! when the hub command queue is full.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregation::AggregationEngine;
use crate::config::{ConfigError, PipelineConfig};
use crate::events::{EventPayload, OrderFlowUpdate, PipelineEvent};
use crate::hub::{ClientId, CloseReason, DistributionHub, DrainOutcome, HubError};
use crate::imbalance::ImbalanceSeverity;
use crate::metrics::PipelineMetrics;
use crate::normalizer::{FeedNormalizer, NormalizedUpdate, RawFeedMessage};
use crate::orderflow::{OrderFlowEngine, WindowArtifacts};
use crate::protocol::{Channel, SubscriptionFilter};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("{stage} channel closed")]
    ChannelClosed { stage: &'static str },
}

/// Commands the hub actor processes, one at a time.
pub enum HubCommand {
    Connect {
        identity: String,
        reply: oneshot::Sender<ClientId>,
    },
    Disconnect {
        id: ClientId,
        reason: CloseReason,
    },
    Subscribe {
        id: ClientId,
        channel: Channel,
        filter: SubscriptionFilter,
        reply: oneshot::Sender<Result<Vec<PipelineEvent>, HubError>>,
    },
    Unsubscribe {
        id: ClientId,
        channel: Channel,
        reply: oneshot::Sender<Result<bool, HubError>>,
    },
    Publish {
        channel: Channel,
        event: PipelineEvent,
    },
    Drain {
        id: ClientId,
        max: usize,
        reply: oneshot::Sender<DrainOutcome>,
    },
    Pong {
        id: ClientId,
    },
}

/// Cloneable handle a transport uses to talk to the hub actor.
#[derive(Clone)]
pub struct HubClient {
    commands: mpsc::Sender<HubCommand>,
}

impl HubClient {
    pub async fn connect(&self, identity: &str) -> Result<ClientId, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.send(HubCommand::Connect {
            identity: identity.to_string(),
            reply,
        })
        .await?;
        response
            .await
            .map_err(|_| ServiceError::ChannelClosed { stage: "hub" })
    }

    pub async fn subscribe(
        &self,
        id: ClientId,
        channel: Channel,
        filter: SubscriptionFilter,
    ) -> Result<Vec<PipelineEvent>, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.send(HubCommand::Subscribe {
            id,
            channel,
            filter,
            reply,
        })
        .await?;
        let replay = response
            .await
            .map_err(|_| ServiceError::ChannelClosed { stage: "hub" })??;
        Ok(replay)
    }

    pub async fn unsubscribe(&self, id: ClientId, channel: Channel) -> Result<bool, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.send(HubCommand::Unsubscribe { id, channel, reply }).await?;
        let was_subscribed = response
            .await
            .map_err(|_| ServiceError::ChannelClosed { stage: "hub" })??;
        Ok(was_subscribed)
    }

    /// Pull up to `max` queued events for a connection's writer.
    pub async fn drain(&self, id: ClientId, max: usize) -> Result<DrainOutcome, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.send(HubCommand::Drain { id, max, reply }).await?;
        response
            .await
            .map_err(|_| ServiceError::ChannelClosed { stage: "hub" })
    }

    pub async fn pong(&self, id: ClientId) -> Result<(), ServiceError> {
        self.send(HubCommand::Pong { id }).await
    }

    pub async fn disconnect(&self, id: ClientId, reason: CloseReason) -> Result<(), ServiceError> {
        self.send(HubCommand::Disconnect { id, reason }).await
    }

    /// Inject an event directly, bypassing the engines.
    pub async fn publish(&self, channel: Channel, event: PipelineEvent) -> Result<(), ServiceError> {
        self.send(HubCommand::Publish { channel, event }).await
    }

    async fn send(&self, command: HubCommand) -> Result<(), ServiceError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServiceError::ChannelClosed { stage: "hub" })
    }
}

/// A running pipeline and the handles to feed, query, and stop it.
pub struct PipelineHandle {
    feed: mpsc::Sender<RawFeedMessage>,
    hub_commands: mpsc::Sender<HubCommand>,
    metrics: Arc<PipelineMetrics>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Validate the config, then spawn the normalizer stage, the shard
    /// workers, and the hub actor.
    pub fn start(config: PipelineConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let metrics = Arc::new(PipelineMetrics::new());
        let (shutdown, _) = watch::channel(false);

        let (feed_tx, feed_rx) = mpsc::channel(config.service.shard_queue_capacity);
        let (hub_tx, hub_rx) = mpsc::channel(config.service.hub_queue_capacity);

        let mut shard_txs = Vec::with_capacity(config.service.shards);
        let mut tasks = Vec::new();

        for shard_id in 0..config.service.shards {
            let (tx, rx) = mpsc::channel(config.service.shard_queue_capacity);
            shard_txs.push(tx);
            let worker = ShardWorker {
                shard_id,
                aggregation: AggregationEngine::new(config.aggregation.clone()),
                orderflow: OrderFlowEngine::new(config.orderflow.clone()),
                hub: hub_tx.clone(),
                metrics: Arc::clone(&metrics),
                cycles: 0,
                scan_every: config.aggregation.arbitrage.scan_every_cycles.max(1) as u64,
            };
            tasks.push(tokio::spawn(run_shard(
                worker,
                rx,
                config.service.cycle_interval_nanos,
                shutdown.subscribe(),
            )));
        }

        tasks.push(tokio::spawn(run_normalizer(
            feed_rx,
            shard_txs,
            Arc::clone(&metrics),
            shutdown.subscribe(),
        )));

        tasks.push(tokio::spawn(run_hub(
            DistributionHub::new(config.hub.clone()),
            hub_rx,
            config.hub.heartbeat_interval_nanos,
            Arc::clone(&metrics),
            shutdown.subscribe(),
        )));

        info!(
            shards = config.service.shards,
            cycle_interval_nanos = config.service.cycle_interval_nanos,
            "Pipeline started"
        );

        Ok(Self {
            feed: feed_tx,
            hub_commands: hub_tx,
            metrics,
            shutdown,
            tasks,
        })
    }

    /// Hand one raw connector message to the normalizer stage. Applies
    /// the stage's bounded-queue backpressure to the caller.
    pub async fn submit(&self, raw: RawFeedMessage) -> Result<(), ServiceError> {
        self.feed
            .send(raw)
            .await
            .map_err(|_| ServiceError::ChannelClosed { stage: "feed" })
    }

    pub fn hub_client(&self) -> HubClient {
        HubClient {
            commands: self.hub_commands.clone(),
        }
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Signal shutdown and wait for every task. Connected clients get a
    /// shutdown close reason before the hub stops.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Pipeline stopped");
    }
}

/// Work routed to one shard.
enum ShardInput {
    Update(NormalizedUpdate),
    /// A rejected feed message, folded into the stream's quality score.
    Rejection { exchange: String, symbol: String },
}

struct ShardWorker {
    shard_id: usize,
    aggregation: AggregationEngine,
    orderflow: OrderFlowEngine,
    hub: mpsc::Sender<HubCommand>,
    metrics: Arc<PipelineMetrics>,
    cycles: u64,
    scan_every: u64,
}

impl ShardWorker {
    fn handle_input(&mut self, input: ShardInput, now: i64) {
        match input {
            ShardInput::Update(NormalizedUpdate::Tick(tick)) => {
                self.metrics
                    .record_tick(tick.internal_latency_nanos().max(0) as u64);
                self.aggregation.ingest_tick(&tick, now);
                let outcome = self.orderflow.ingest(&tick, now);

                let resolved = outcome.resolved.len() as u64;
                if resolved > 0 {
                    self.metrics.record_imbalances(0, resolved);
                }
                for imbalance in outcome.resolved {
                    let symbol = imbalance.symbol.clone();
                    self.publish(
                        EventPayload::OrderFlow {
                            symbol,
                            update: OrderFlowUpdate::ImbalanceResolved { imbalance },
                        },
                        now,
                    );
                }
                if let Some(artifacts) = outcome.closed {
                    self.emit_window(artifacts, now);
                }
            }
            ShardInput::Update(NormalizedUpdate::Quote(quote)) => {
                self.metrics.record_quote();
                self.orderflow.observe_quote(&quote.symbol, quote.bid, quote.ask);
                self.aggregation.ingest_quote(quote, now);
            }
            ShardInput::Update(NormalizedUpdate::Book(book)) => {
                self.metrics.record_book();
                self.aggregation.ingest_book(book);
            }
            ShardInput::Rejection { exchange, symbol } => {
                self.aggregation.record_rejection(&exchange, &symbol, now);
            }
        }
    }

    /// One aggregation cycle: rebuild summaries, close elapsed windows,
    /// and every `scan_every` cycles run the arbitrage scan.
    fn run_cycle(&mut self, now: i64) {
        self.cycles += 1;

        let started = Instant::now();
        let summaries = self.aggregation.rebuild_all(now);
        self.metrics
            .record_summaries(summaries.len() as u64, started.elapsed().as_nanos() as u64);
        for summary in summaries {
            if summary.no_data {
                continue;
            }
            let symbol = summary.symbol.clone();
            self.publish(EventPayload::PriceUpdate { symbol, summary }, now);
        }

        for artifacts in self.orderflow.close_elapsed(now) {
            self.emit_window(artifacts, now);
        }

        if self.cycles % self.scan_every == 0 {
            let opportunities = self.aggregation.find_arbitrage_all(now);
            self.metrics.record_arbitrage_scan(opportunities.len() as u64);
            for opportunity in opportunities {
                self.publish(EventPayload::SignalAlert { opportunity }, now);
            }
        }
    }

    fn emit_window(&mut self, artifacts: WindowArtifacts, now: i64) {
        self.metrics.record_window_closed();
        let detected = artifacts.imbalances.len() as u64;
        if detected > 0 {
            self.metrics.record_imbalances(detected, 0);
        }

        let symbol = artifacts.window.symbol.clone();
        self.publish(
            EventPayload::OrderFlow {
                symbol,
                update: OrderFlowUpdate::WindowClosed {
                    profile: artifacts.profile,
                    delta: artifacts.delta,
                },
            },
            now,
        );

        for imbalance in artifacts.imbalances {
            self.publish(
                EventPayload::OrderFlow {
                    symbol: imbalance.symbol.clone(),
                    update: OrderFlowUpdate::ImbalanceDetected {
                        imbalance: imbalance.clone(),
                    },
                },
                now,
            );
            if imbalance.severity >= ImbalanceSeverity::High {
                self.publish(
                    EventPayload::RiskAlert {
                        severity: imbalance.severity,
                        imbalance,
                    },
                    now,
                );
            }
        }
    }

    /// Non-blocking hand-off to the hub actor. A full command queue
    /// costs this event, never the shard's throughput.
    fn publish(&self, payload: EventPayload, now: i64) {
        let channel = Channel::for_payload(&payload);
        let event = PipelineEvent::new(payload, now);
        match self.hub.try_send(HubCommand::Publish { channel, event }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_hub_queue_drop();
                debug!(shard = self.shard_id, "Hub command queue full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn run_shard(
    mut worker: ShardWorker,
    mut inbox: mpsc::Receiver<ShardInput>,
    cycle_interval_nanos: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cycle = tokio::time::interval(Duration::from_nanos(cycle_interval_nanos as u64));
    loop {
        tokio::select! {
            maybe = inbox.recv() => {
                let Some(input) = maybe else { break };
                worker.handle_input(input, now_nanos());
            }
            _ = cycle.tick() => {
                worker.run_cycle(now_nanos());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(shard = worker.shard_id, "Shard worker stopped");
}

async fn run_normalizer(
    mut feed: mpsc::Receiver<RawFeedMessage>,
    shards: Vec<mpsc::Sender<ShardInput>>,
    metrics: Arc<PipelineMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut normalizers: BTreeMap<String, FeedNormalizer> = BTreeMap::new();
    loop {
        tokio::select! {
            maybe = feed.recv() => {
                let Some(raw) = maybe else { break };
                let exchange = raw.exchange.clone();
                let symbol = raw.symbol.clone();
                let normalizer = normalizers
                    .entry(exchange.clone())
                    .or_insert_with(|| FeedNormalizer::new(exchange.clone()));

                let input = match normalizer.normalize(raw, now_nanos()) {
                    Ok(update) => ShardInput::Update(update),
                    Err(_) => {
                        metrics.record_rejected();
                        if symbol.is_empty() {
                            continue;
                        }
                        ShardInput::Rejection { exchange, symbol: symbol.clone() }
                    }
                };
                let shard = shard_for(&symbol, shards.len());
                if shards[shard].send(input).await.is_err() {
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Normalizer stage stopped");
}

async fn run_hub(
    mut hub: DistributionHub,
    mut commands: mpsc::Receiver<HubCommand>,
    heartbeat_interval_nanos: i64,
    metrics: Arc<PipelineMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut heartbeat = tokio::time::interval(Duration::from_nanos(heartbeat_interval_nanos as u64));
    loop {
        tokio::select! {
            maybe = commands.recv() => {
                let Some(command) = maybe else { break };
                apply_hub_command(&mut hub, command, now_nanos(), &metrics);
                metrics.set_connected_clients(hub.connection_count() as u64);
            }
            _ = heartbeat.tick() => {
                let swept = hub.sweep(now_nanos());
                if !swept.is_empty() {
                    metrics.record_idle_disconnects(swept.len() as u64);
                }
                metrics.set_connected_clients(hub.connection_count() as u64);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let closed = hub.close_all(now_nanos());
                    if !closed.is_empty() {
                        info!(connections = closed.len(), "Hub closed all connections");
                    }
                    // Answer commands already queued so writers polling
                    // right now still collect their shutdown notice.
                    while let Ok(command) = commands.try_recv() {
                        apply_hub_command(&mut hub, command, now_nanos(), &metrics);
                    }
                    metrics.set_connected_clients(0);
                    break;
                }
            }
        }
    }
    debug!("Hub actor stopped");
}

fn apply_hub_command(
    hub: &mut DistributionHub,
    command: HubCommand,
    now: i64,
    metrics: &PipelineMetrics,
) {
    match command {
        HubCommand::Connect { identity, reply } => {
            let id = hub.connect(&identity, now);
            let _ = reply.send(id);
        }
        HubCommand::Disconnect { id, reason } => {
            hub.disconnect(id, reason, now);
        }
        HubCommand::Subscribe {
            id,
            channel,
            filter,
            reply,
        } => {
            let result = hub.subscribe(id, channel, filter, now);
            if let Ok(replay) = &result {
                metrics.record_replay(replay.len() as u64);
            }
            let _ = reply.send(result);
        }
        HubCommand::Unsubscribe { id, channel, reply } => {
            let _ = reply.send(hub.unsubscribe(id, channel, now));
        }
        HubCommand::Publish { channel, event } => {
            let outcome = hub.publish(channel, event, now);
            metrics.record_publish(outcome.dropped.len() as u64);
        }
        HubCommand::Drain { id, max, reply } => {
            let _ = reply.send(hub.drain(id, max));
        }
        HubCommand::Pong { id } => {
            if hub.record_pong(id, now).is_err() {
                warn!(client_id = id, "Pong from unknown client");
            }
        }
    }
}

/// Stable symbol-to-shard assignment.
fn shard_for(symbol: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Wall clock as Unix nanos, the timestamp domain of the whole pipeline.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
