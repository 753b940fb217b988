//! Order-flow analytics engine
//!
//! Per-symbol facade over the classifier, footprint windows, volume
//! profile, delta tracking, and imbalance detection:
//! - classifies each tick's aggressor, quantizes it to the symbol's
//!   price grid, and folds it into the open window
//! - freezes artifacts at window close: footprint bars with POC and
//!   imbalance flags, volume profile, finalized delta profile, newly
//!   detected imbalances
//! - feeds live trades to active imbalances and reports resolutions
//! - keeps running per-symbol totals for the metrics snapshot
//!
//! One engine instance per symbol shard; all mutation is single-writer.

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::TradeClassifier;
use crate::delta::{DeltaConfig, DeltaProfile, DeltaTracker};
use crate::footprint::{
    quantize_price, FootprintWindow, WindowBuilder, WindowPolicy,
};
use crate::imbalance::{ImbalanceConfig, ImbalanceDetector, OrderFlowImbalance};
use crate::normalizer::{NormalizedTick, Side};
use crate::profile::{build_profile, VolumeProfile};

/// Configuration for the order-flow engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFlowConfig {
    pub window_policy: WindowPolicy,
    /// Footprint price grid (default: 0.01).
    pub price_tick_size: Decimal,
    /// Per-symbol grid overrides.
    pub tick_size_overrides: BTreeMap<String, Decimal>,
    /// Share of volume the value area must cover (default: 70).
    pub value_area_percent: Decimal,
    /// Closed-window artifacts retained per symbol (default: 16).
    pub profile_history_len: usize,
    pub delta: DeltaConfig,
    pub imbalance: ImbalanceConfig,
}

impl Default for OrderFlowConfig {
    fn default() -> Self {
        Self {
            window_policy: WindowPolicy::Time {
                duration_nanos: 5 * 60 * 1_000_000_000,
            },
            price_tick_size: Decimal::new(1, 2),
            tick_size_overrides: BTreeMap::new(),
            value_area_percent: Decimal::from(70),
            profile_history_len: 16,
            delta: DeltaConfig::default(),
            imbalance: ImbalanceConfig::default(),
        }
    }
}

/// Everything frozen at one window close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowArtifacts {
    pub window: FootprintWindow,
    /// `None` when no side-attributed volume traded.
    pub profile: Option<VolumeProfile>,
    pub delta: DeltaProfile,
    pub imbalances: Vec<OrderFlowImbalance>,
}

/// What one ingested tick produced.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// The side the tick was classified as.
    pub side: Side,
    /// Artifacts of the window this tick closed, if any.
    pub closed: Option<WindowArtifacts>,
    /// Active imbalances this tick resolved.
    pub resolved: Vec<OrderFlowImbalance>,
}

/// Running per-symbol totals since the engine started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFlowMetrics {
    pub symbol: String,
    pub total_volume: Decimal,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    /// Share of all traded volume, in percent.
    pub buy_percent: Decimal,
    pub sell_percent: Decimal,
    pub cumulative_delta: Decimal,
    pub vwap: Decimal,
    pub tick_count: u64,
    pub unreliable_ticks: u64,
    pub last_update: i64,
}

struct SymbolFlow {
    tick_size: Decimal,
    builder: WindowBuilder,
    delta: DeltaTracker,
    detector: ImbalanceDetector,
    artifacts: VecDeque<WindowArtifacts>,
    buy_volume: Decimal,
    sell_volume: Decimal,
    unattributed_volume: Decimal,
    vwap_numerator: Decimal,
    tick_count: u64,
    unreliable_ticks: u64,
    last_update: i64,
}

impl SymbolFlow {
    fn new(symbol: &str, config: &OrderFlowConfig) -> Self {
        let tick_size = config
            .tick_size_overrides
            .get(symbol)
            .copied()
            .unwrap_or(config.price_tick_size);
        Self {
            tick_size,
            builder: WindowBuilder::new(symbol, config.window_policy),
            delta: DeltaTracker::new(config.delta.clone()),
            detector: ImbalanceDetector::new(config.imbalance.clone()),
            artifacts: VecDeque::new(),
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            unattributed_volume: Decimal::ZERO,
            vwap_numerator: Decimal::ZERO,
            tick_count: 0,
            unreliable_ticks: 0,
            last_update: 0,
        }
    }

    /// Freeze one closed window into its artifact set.
    fn freeze(
        &mut self,
        mut window: FootprintWindow,
        value_area_percent: Decimal,
        history_len: usize,
        now: i64,
    ) -> WindowArtifacts {
        let profile = build_profile(&window, value_area_percent, now);
        if let Some(profile) = &profile {
            if let Some(bar) = window.bars.get_mut(&profile.poc_price) {
                bar.poc = true;
            }
        }
        let delta = self
            .delta
            .finalize_window(&window.symbol, window.open, window.close, now);
        let imbalances = self.detector.detect(&mut window, now);

        debug!(
            symbol = %window.symbol,
            ticks = window.tick_count,
            delta = %window.delta(),
            imbalances = imbalances.len(),
            "Window closed"
        );

        let artifacts = WindowArtifacts {
            window,
            profile,
            delta,
            imbalances,
        };
        self.artifacts.push_back(artifacts.clone());
        while self.artifacts.len() > history_len.max(1) {
            self.artifacts.pop_front();
        }
        artifacts
    }
}

/// Order-flow analytics for the symbols of one shard.
pub struct OrderFlowEngine {
    config: OrderFlowConfig,
    classifier: TradeClassifier,
    flows: BTreeMap<String, SymbolFlow>,
    windows_closed: u64,
    imbalances_detected: u64,
    imbalances_resolved: u64,
}

impl OrderFlowEngine {
    pub fn new(config: OrderFlowConfig) -> Self {
        Self {
            config,
            classifier: TradeClassifier::new(),
            flows: BTreeMap::new(),
            windows_closed: 0,
            imbalances_detected: 0,
            imbalances_resolved: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(OrderFlowConfig::default())
    }

    /// Refresh the prevailing quote used by the aggressor classifier.
    pub fn observe_quote(&mut self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.classifier.observe_quote(symbol, bid, ask);
    }

    /// Fold one tick into the symbol's open window.
    pub fn ingest(&mut self, tick: &NormalizedTick, now: i64) -> IngestOutcome {
        let side = self.classifier.classify(tick);
        let flow = self
            .flows
            .entry(tick.symbol.clone())
            .or_insert_with(|| SymbolFlow::new(&tick.symbol, &self.config));

        flow.tick_count += 1;
        if !tick.aggressor_reliable {
            flow.unreliable_ticks += 1;
        }
        match side {
            Side::Buy => flow.buy_volume += tick.size,
            Side::Sell => flow.sell_volume += tick.size,
            Side::Unknown => flow.unattributed_volume += tick.size,
        }
        flow.vwap_numerator += tick.price * tick.size;
        flow.last_update = now;

        let resolved = flow.detector.observe_trade(tick.price, tick.size, now);
        self.imbalances_resolved += resolved.len() as u64;

        let level = quantize_price(tick.price, flow.tick_size);
        let mut closed = None;
        if matches!(self.config.window_policy, WindowPolicy::Time { .. }) {
            // A time window closes before the boundary trade lands, so the
            // predecessor's delta is finalized before this trade is folded.
            if let Some(window) =
                flow.builder
                    .process_trade(level, tick.size, side, tick.exchange_timestamp)
            {
                closed = Some(flow.freeze(
                    window,
                    self.config.value_area_percent,
                    self.config.profile_history_len,
                    now,
                ));
            }
            flow.delta.on_trade(tick.size, side);
        } else {
            // Volume and tick-count windows include the triggering trade.
            flow.delta.on_trade(tick.size, side);
            if let Some(window) =
                flow.builder
                    .process_trade(level, tick.size, side, tick.exchange_timestamp)
            {
                closed = Some(flow.freeze(
                    window,
                    self.config.value_area_percent,
                    self.config.profile_history_len,
                    now,
                ));
            }
        }

        if let Some(artifacts) = &closed {
            self.windows_closed += 1;
            self.imbalances_detected += artifacts.imbalances.len() as u64;
        }

        IngestOutcome {
            side,
            closed,
            resolved,
        }
    }

    /// Force-close the symbol's open window.
    pub fn close_window(&mut self, symbol: &str, now: i64) -> Option<WindowArtifacts> {
        let flow = self.flows.get_mut(symbol)?;
        let window = flow.builder.close_current(now)?;
        let artifacts = flow.freeze(
            window,
            self.config.value_area_percent,
            self.config.profile_history_len,
            now,
        );
        self.windows_closed += 1;
        self.imbalances_detected += artifacts.imbalances.len() as u64;
        Some(artifacts)
    }

    /// Close every time window whose boundary passed with no traffic.
    pub fn close_elapsed(&mut self, now: i64) -> Vec<WindowArtifacts> {
        let mut closed = Vec::new();
        for flow in self.flows.values_mut() {
            if let Some(window) = flow.builder.close_elapsed(now) {
                let artifacts = flow.freeze(
                    window,
                    self.config.value_area_percent,
                    self.config.profile_history_len,
                    now,
                );
                self.windows_closed += 1;
                self.imbalances_detected += artifacts.imbalances.len() as u64;
                closed.push(artifacts);
            }
        }
        closed
    }

    /// The open footprint window, if any trade has arrived.
    pub fn footprint(&self, symbol: &str) -> Option<&FootprintWindow> {
        self.flows.get(symbol).and_then(|f| f.builder.current())
    }

    /// Artifacts of the most recently closed window.
    pub fn latest_artifacts(&self, symbol: &str) -> Option<&WindowArtifacts> {
        self.flows.get(symbol).and_then(|f| f.artifacts.back())
    }

    /// Retained closed-window artifacts, oldest first.
    pub fn artifact_history<'a>(
        &'a self,
        symbol: &str,
    ) -> impl Iterator<Item = &'a WindowArtifacts> + 'a {
        self.flows
            .get(symbol)
            .into_iter()
            .flat_map(|f| f.artifacts.iter())
    }

    /// Latest closed volume profile.
    pub fn volume_profile(&self, symbol: &str) -> Option<&VolumeProfile> {
        self.latest_artifacts(symbol)
            .and_then(|a| a.profile.as_ref())
    }

    /// Latest finalized delta profile.
    pub fn delta_analysis(&self, symbol: &str) -> Option<&DeltaProfile> {
        self.latest_artifacts(symbol).map(|a| &a.delta)
    }

    /// Unresolved imbalances for the symbol.
    pub fn active_imbalances(&self, symbol: &str) -> Vec<OrderFlowImbalance> {
        self.flows
            .get(symbol)
            .map(|f| f.detector.active())
            .unwrap_or_default()
    }

    /// Running totals since the engine saw the symbol's first tick.
    pub fn metrics_snapshot(&self, symbol: &str) -> Option<OrderFlowMetrics> {
        let flow = self.flows.get(symbol)?;
        let total = flow.buy_volume + flow.sell_volume + flow.unattributed_volume;
        let hundred = Decimal::from(100);
        let (buy_percent, sell_percent, vwap) = if total > Decimal::ZERO {
            (
                flow.buy_volume / total * hundred,
                flow.sell_volume / total * hundred,
                flow.vwap_numerator / total,
            )
        } else {
            (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
        };
        Some(OrderFlowMetrics {
            symbol: symbol.to_string(),
            total_volume: total,
            buy_volume: flow.buy_volume,
            sell_volume: flow.sell_volume,
            buy_percent,
            sell_percent,
            cumulative_delta: flow.delta.cumulative(),
            vwap,
            tick_count: flow.tick_count,
            unreliable_ticks: flow.unreliable_ticks,
            last_update: flow.last_update,
        })
    }

    pub fn symbols(&self) -> Vec<String> {
        self.flows.keys().cloned().collect()
    }

    pub fn windows_closed(&self) -> u64 {
        self.windows_closed
    }

    pub fn imbalances_detected(&self) -> u64 {
        self.imbalances_detected
    }

    pub fn imbalances_resolved(&self) -> u64 {
        self.imbalances_resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1708123456789000000;
    const MIN: i64 = 60 * 1_000_000_000;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    fn tick(symbol: &str, price: &str, size: &str, at: i64) -> NormalizedTick {
        NormalizedTick {
            symbol: symbol.to_string(),
            exchange: "binance".to_string(),
            price: dec(price),
            size: dec(size),
            side: Side::Unknown,
            bid_price: None,
            ask_price: None,
            exchange_timestamp: at,
            receive_timestamp: at,
            process_timestamp: at,
            sequence: 1,
            aggressor_reliable: true,
        }
    }

    fn engine(policy: WindowPolicy) -> OrderFlowEngine {
        OrderFlowEngine::new(OrderFlowConfig {
            window_policy: policy,
            price_tick_size: dec("0.05"),
            ..OrderFlowConfig::default()
        })
    }

    #[test]
    fn test_footprint_splits_by_aggressor() {
        let mut e = engine(WindowPolicy::Time {
            duration_nanos: 5 * MIN,
        });
        e.observe_quote("BTC/USDT", dec("9.95"), dec("10.00"));

        // Five buys lift the ask, three sells hit the bid.
        for i in 0..5 {
            let out = e.ingest(&tick("BTC/USDT", "10.00", "1", T0 + i), T0 + i);
            assert_eq!(out.side, Side::Buy);
        }
        for i in 0..3 {
            let out = e.ingest(&tick("BTC/USDT", "9.95", "1", T0 + 5 + i), T0 + 5 + i);
            assert_eq!(out.side, Side::Sell);
        }

        let window = e.footprint("BTC/USDT").unwrap();
        assert_eq!(window.bars[&dec("10.00")].buy_volume, dec("5"));
        assert_eq!(window.bars[&dec("10.00")].sell_volume, Decimal::ZERO);
        assert_eq!(window.bars[&dec("9.95")].sell_volume, dec("3"));
        assert_eq!(window.delta(), dec("2"));
    }

    #[test]
    fn test_volume_window_produces_artifacts() {
        let mut e = engine(WindowPolicy::Volume { target: dec("8") });
        e.observe_quote("BTC/USDT", dec("9.95"), dec("10.00"));

        for _ in 0..5 {
            assert!(e
                .ingest(&tick("BTC/USDT", "10.00", "1", T0), T0)
                .closed
                .is_none());
        }
        let mut last = None;
        for i in 0..3 {
            last = e
                .ingest(&tick("BTC/USDT", "9.95", "1", T0 + 1 + i), T0 + 1 + i)
                .closed;
        }

        let artifacts = last.unwrap();
        assert_eq!(artifacts.window.delta(), dec("2"));
        assert_eq!(artifacts.window.total_volume(), dec("8"));
        let profile = artifacts.profile.unwrap();
        // 10.00 carries 5 of 8: the POC.
        assert_eq!(profile.poc_price, dec("10.00"));
        assert!(artifacts.window.bars[&dec("10.00")].poc);
        assert_eq!(artifacts.delta.window_delta, dec("2"));
        assert_eq!(artifacts.delta.buy_pressure, dec("62.5"));
        assert_eq!(e.windows_closed(), 1);
    }

    #[test]
    fn test_time_window_rolls_on_boundary_trade() {
        let duration = 5 * MIN;
        let mut e = engine(WindowPolicy::Time {
            duration_nanos: duration,
        });
        e.observe_quote("BTC/USDT", dec("9.95"), dec("10.00"));

        e.ingest(&tick("BTC/USDT", "10.00", "1", T0), T0);
        let opened = e.footprint("BTC/USDT").unwrap().opened_at;

        let out = e.ingest(
            &tick("BTC/USDT", "10.00", "2", opened + duration),
            opened + duration,
        );
        let closed = out.closed.unwrap();
        // The boundary trade belongs to the new window.
        assert_eq!(closed.window.total_buy_volume, dec("1"));
        assert_eq!(closed.delta.window_delta, dec("1"));
        assert_eq!(e.footprint("BTC/USDT").unwrap().total_buy_volume, dec("2"));
        assert_eq!(e.delta_analysis("BTC/USDT").unwrap().cumulative_delta, dec("1"));
    }

    #[test]
    fn test_close_elapsed_flushes_idle_window() {
        let duration = 5 * MIN;
        let mut e = engine(WindowPolicy::Time {
            duration_nanos: duration,
        });
        e.observe_quote("BTC/USDT", dec("9.95"), dec("10.00"));
        e.ingest(&tick("BTC/USDT", "10.00", "1", T0), T0);

        assert!(e.close_elapsed(T0).is_empty());
        let closed = e.close_elapsed(T0 + 2 * duration);
        assert_eq!(closed.len(), 1);
        assert!(e.footprint("BTC/USDT").is_none());
        assert_eq!(e.latest_artifacts("BTC/USDT").unwrap().window.tick_count, 1);
    }

    #[test]
    fn test_imbalance_detected_and_resolved() {
        let mut e = engine(WindowPolicy::Volume { target: dec("10") });
        e.observe_quote("BTC/USDT", dec("99.95"), dec("100.00"));

        // 9 buys and 1 sell at one level: stacked buy imbalance.
        for _ in 0..9 {
            e.ingest(&tick("BTC/USDT", "100.00", "1", T0), T0);
        }
        let out = e.ingest(&tick("BTC/USDT", "99.95", "1", T0 + 1), T0 + 1);
        let artifacts = out.closed.unwrap();
        assert!(!artifacts.imbalances.is_empty());
        assert!(e.imbalances_detected() > 0);
        assert!(!e.active_imbalances("BTC/USDT").is_empty());

        // Price travels with the skew: continuation.
        let out = e.ingest(&tick("BTC/USDT", "100.55", "1", T0 + 2), T0 + 2);
        assert!(!out.resolved.is_empty());
        assert!(e.imbalances_resolved() > 0);
    }

    #[test]
    fn test_metrics_snapshot_totals() {
        let mut e = engine(WindowPolicy::Time {
            duration_nanos: 5 * MIN,
        });
        e.observe_quote("BTC/USDT", dec("9.95"), dec("10.00"));
        e.ingest(&tick("BTC/USDT", "10.00", "3", T0), T0);
        e.ingest(&tick("BTC/USDT", "9.95", "1", T0 + 1), T0 + 1);

        let metrics = e.metrics_snapshot("BTC/USDT").unwrap();
        assert_eq!(metrics.total_volume, dec("4"));
        assert_eq!(metrics.buy_volume, dec("3"));
        assert_eq!(metrics.sell_volume, dec("1"));
        assert_eq!(metrics.buy_percent, dec("75"));
        assert_eq!(metrics.cumulative_delta, dec("2"));
        // (10.00×3 + 9.95×1) / 4
        assert_eq!(metrics.vwap, dec("9.9875"));
        assert_eq!(metrics.tick_count, 2);
        assert_eq!(metrics.last_update, T0 + 1);
    }

    #[test]
    fn test_unreliable_ticks_counted() {
        let mut e = engine(WindowPolicy::Time {
            duration_nanos: 5 * MIN,
        });
        let mut t = tick("BTC/USDT", "10.00", "1", T0);
        t.aggressor_reliable = false;
        e.ingest(&t, T0);

        assert_eq!(e.metrics_snapshot("BTC/USDT").unwrap().unreliable_ticks, 1);
    }

    #[test]
    fn test_unclassifiable_tick_stays_unattributed() {
        let mut e = engine(WindowPolicy::Time {
            duration_nanos: 5 * MIN,
        });
        // No quote observed and no history: side unknown.
        let out = e.ingest(&tick("BTC/USDT", "10.00", "2", T0), T0);
        assert_eq!(out.side, Side::Unknown);

        let window = e.footprint("BTC/USDT").unwrap();
        assert_eq!(window.unattributed_volume, dec("2"));
        assert_eq!(window.delta(), Decimal::ZERO);
    }

    #[test]
    fn test_tick_size_override_per_symbol() {
        let mut overrides = BTreeMap::new();
        overrides.insert("BTC/USDT".to_string(), dec("0.5"));
        let mut e = OrderFlowEngine::new(OrderFlowConfig {
            window_policy: WindowPolicy::Time {
                duration_nanos: 5 * MIN,
            },
            price_tick_size: dec("0.05"),
            tick_size_overrides: overrides,
            ..OrderFlowConfig::default()
        });
        e.observe_quote("BTC/USDT", dec("10.00"), dec("10.10"));
        e.observe_quote("ETH/USDT", dec("10.00"), dec("10.10"));

        e.ingest(&tick("BTC/USDT", "10.20", "1", T0), T0);
        e.ingest(&tick("ETH/USDT", "10.20", "1", T0), T0);

        // BTC snaps to the 0.5 grid, ETH to the default 0.05 grid.
        assert!(e.footprint("BTC/USDT").unwrap().bars.contains_key(&dec("10.0")));
        assert!(e.footprint("ETH/USDT").unwrap().bars.contains_key(&dec("10.20")));
    }

    #[test]
    fn test_artifact_history_trimmed() {
        let mut e = OrderFlowEngine::new(OrderFlowConfig {
            window_policy: WindowPolicy::TickCount { count: 1 },
            profile_history_len: 2,
            ..OrderFlowConfig::default()
        });
        e.observe_quote("BTC/USDT", dec("9.95"), dec("10.00"));
        for i in 0..5 {
            e.ingest(&tick("BTC/USDT", "10.00", "1", T0 + i), T0 + i);
        }

        assert_eq!(e.windows_closed(), 5);
        assert_eq!(e.artifact_history("BTC/USDT").count(), 2);
    }
}
