//! Pipeline observability
//!
//! Counter and latency collection shared across stages:
//! - atomic counters for normalizer, aggregation, order-flow, and hub
//!   activity, safe to bump from any task through an `Arc`
//! - sliding-window latency trackers with sorted-percentile readout
//! - `export` flattens everything into a `BTreeMap` for a metrics
//!   endpoint or a log line
//!
//! Constructed once at service startup and injected; nothing here is
//! global.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Core counters for the pipeline.
pub struct PipelineMetrics {
    // Normalizer
    pub ticks_normalized: AtomicU64,
    pub messages_rejected: AtomicU64,
    pub quotes_ingested: AtomicU64,
    pub books_ingested: AtomicU64,
    /// receive-to-process latency per tick.
    pub tick_pipeline_ns: Mutex<LatencyTracker>,

    // Aggregation
    pub summaries_built: AtomicU64,
    pub summary_build_ns: Mutex<LatencyTracker>,
    pub arbitrage_scans: AtomicU64,
    pub arbitrage_opportunities: AtomicU64,

    // Order flow
    pub windows_closed: AtomicU64,
    pub imbalances_detected: AtomicU64,
    pub imbalances_resolved: AtomicU64,

    // Distribution
    pub events_published: AtomicU64,
    pub events_dropped: AtomicU64,
    /// Events discarded because the hub's command queue was full.
    pub hub_queue_drops: AtomicU64,
    pub replayed_events: AtomicU64,
    pub connected_clients: AtomicU64,
    pub overflow_disconnects: AtomicU64,
    pub idle_disconnects: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            ticks_normalized: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            quotes_ingested: AtomicU64::new(0),
            books_ingested: AtomicU64::new(0),
            tick_pipeline_ns: Mutex::new(LatencyTracker::new(1000)),
            summaries_built: AtomicU64::new(0),
            summary_build_ns: Mutex::new(LatencyTracker::new(100)),
            arbitrage_scans: AtomicU64::new(0),
            arbitrage_opportunities: AtomicU64::new(0),
            windows_closed: AtomicU64::new(0),
            imbalances_detected: AtomicU64::new(0),
            imbalances_resolved: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            hub_queue_drops: AtomicU64::new(0),
            replayed_events: AtomicU64::new(0),
            connected_clients: AtomicU64::new(0),
            overflow_disconnects: AtomicU64::new(0),
            idle_disconnects: AtomicU64::new(0),
        }
    }

    /// Record one tick through the normalizer with its receive-to-process
    /// latency.
    pub fn record_tick(&self, latency_ns: u64) {
        self.ticks_normalized.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.tick_pipeline_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quote(&self) {
        self.quotes_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_book(&self) {
        self.books_ingested.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one rebuild pass: how many summaries it produced and how
    /// long the whole pass took.
    pub fn record_summaries(&self, count: u64, build_ns: u64) {
        self.summaries_built.fetch_add(count, Ordering::Relaxed);
        if let Ok(mut tracker) = self.summary_build_ns.lock() {
            tracker.record(build_ns);
        }
    }

    /// Record an arbitrage scan and how many opportunities it found.
    pub fn record_arbitrage_scan(&self, found: u64) {
        self.arbitrage_scans.fetch_add(1, Ordering::Relaxed);
        self.arbitrage_opportunities.fetch_add(found, Ordering::Relaxed);
    }

    pub fn record_window_closed(&self) {
        self.windows_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_imbalances(&self, detected: u64, resolved: u64) {
        self.imbalances_detected.fetch_add(detected, Ordering::Relaxed);
        self.imbalances_resolved.fetch_add(resolved, Ordering::Relaxed);
    }

    /// Record one publish: deliveries count as published, overflow
    /// victims as dropped.
    pub fn record_publish(&self, dropped: u64) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.events_dropped.fetch_add(dropped, Ordering::Relaxed);
        self.overflow_disconnects.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn record_replay(&self, events: u64) {
        self.replayed_events.fetch_add(events, Ordering::Relaxed);
    }

    pub fn record_hub_queue_drop(&self) {
        self.hub_queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Gauge, set from the hub's registry size.
    pub fn set_connected_clients(&self, count: u64) {
        self.connected_clients.store(count, Ordering::Relaxed);
    }

    pub fn record_idle_disconnects(&self, count: u64) {
        self.idle_disconnects.fetch_add(count, Ordering::Relaxed);
    }

    /// Flatten counters and latency percentiles into one map.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("ticks_normalized".to_string(), self.ticks_normalized.load(Ordering::Relaxed));
        m.insert("messages_rejected".to_string(), self.messages_rejected.load(Ordering::Relaxed));
        m.insert("quotes_ingested".to_string(), self.quotes_ingested.load(Ordering::Relaxed));
        m.insert("books_ingested".to_string(), self.books_ingested.load(Ordering::Relaxed));
        m.insert("summaries_built".to_string(), self.summaries_built.load(Ordering::Relaxed));
        m.insert("arbitrage_scans".to_string(), self.arbitrage_scans.load(Ordering::Relaxed));
        m.insert(
            "arbitrage_opportunities".to_string(),
            self.arbitrage_opportunities.load(Ordering::Relaxed),
        );
        m.insert("windows_closed".to_string(), self.windows_closed.load(Ordering::Relaxed));
        m.insert(
            "imbalances_detected".to_string(),
            self.imbalances_detected.load(Ordering::Relaxed),
        );
        m.insert(
            "imbalances_resolved".to_string(),
            self.imbalances_resolved.load(Ordering::Relaxed),
        );
        m.insert("events_published".to_string(), self.events_published.load(Ordering::Relaxed));
        m.insert("events_dropped".to_string(), self.events_dropped.load(Ordering::Relaxed));
        m.insert("hub_queue_drops".to_string(), self.hub_queue_drops.load(Ordering::Relaxed));
        m.insert("replayed_events".to_string(), self.replayed_events.load(Ordering::Relaxed));
        m.insert("connected_clients".to_string(), self.connected_clients.load(Ordering::Relaxed));
        m.insert(
            "overflow_disconnects".to_string(),
            self.overflow_disconnects.load(Ordering::Relaxed),
        );
        m.insert("idle_disconnects".to_string(), self.idle_disconnects.load(Ordering::Relaxed));

        if let Ok(tracker) = self.tick_pipeline_ns.lock() {
            for (label, value) in tracker.summary("tick_pipeline_ns") {
                m.insert(label, value);
            }
        }
        if let Ok(tracker) = self.summary_build_ns.lock() {
            for (label, value) in tracker.summary("summary_build_ns") {
                m.insert(label, value);
            }
        }
        m
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding window of latency samples with sorted-percentile readout.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    /// Record a sample, evicting the oldest when the window is full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Percentile over the current window, `p` in 0..=100.
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = p.min(100) * (sorted.len() - 1) / 100;
        Some(sorted[idx])
    }

    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// p50/p95/p99 labeled for export; empty when no samples yet.
    fn summary(&self, prefix: &str) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        for p in [50usize, 95, 99] {
            if let Some(value) = self.percentile(p) {
                out.push((format!("{prefix}_p{p}"), value));
            }
        }
        out
    }
}
