//! Order-flow imbalance detection
//!
//! Flags price levels of a closed window where one side's volume
//! overwhelms the other beyond a configured ratio, escalating severity
//! when imbalanced levels stack contiguously on the same side. A skew of
//! the whole window's volume produces a single volume imbalance.
//!
//! Detected imbalances stay active and watch subsequent trades until
//! they resolve: continuation (price travels with the skew), reversal
//! (against it), or absorption (the level's volume trades again with
//! price pinned).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::footprint::FootprintWindow;
use crate::normalizer::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImbalanceKind {
    /// Buy volume dominates the level.
    BidStack,
    /// Sell volume dominates the level.
    AskStack,
    /// The whole window's volume is skewed.
    VolumeImbalance,
}

impl ImbalanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BidStack => "bid_stack",
            Self::AskStack => "ask_stack",
            Self::VolumeImbalance => "volume_imbalance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImbalanceSeverity {
    Low,
    Medium,
    High,
    Extreme,
}

impl ImbalanceSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Extreme => "extreme",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "extreme" => Some(Self::Extreme),
            _ => None,
        }
    }

    /// Severity for a contiguous stack of imbalanced levels.
    fn for_stack(len: usize) -> Self {
        match len {
            0..=2 => Self::Low,
            3 => Self::Medium,
            4 => Self::High,
            _ => Self::Extreme,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImbalanceResolution {
    /// Opposing volume ate the imbalance with price pinned.
    Absorption,
    /// Price followed the skew.
    Continuation,
    /// Price went against the skew.
    Reversal,
}

/// A detected imbalance, active until resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFlowImbalance {
    pub id: Uuid,
    pub symbol: String,
    pub price: Decimal,
    pub kind: ImbalanceKind,
    pub severity: ImbalanceSeverity,
    /// Dominant over minority volume at detection.
    pub ratio: Decimal,
    pub detected_at: i64,
    pub resolved: bool,
    pub resolution: Option<ImbalanceResolution>,
    pub resolved_at: Option<i64>,
}

/// Configuration for imbalance detection and resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImbalanceConfig {
    /// Dominant-to-minority ratio a level must exceed to count as
    /// imbalanced (default: 3).
    pub ratio: Decimal,
    /// The minority side is floored at this volume before dividing, so
    /// a near-empty opposite side cannot manufacture infinite ratios
    /// (default: 1).
    pub volume_floor: Decimal,
    /// Price travel, in percent, that resolves an active imbalance
    /// (default: 0.3).
    pub resolution_move_percent: Decimal,
}

impl Default for ImbalanceConfig {
    fn default() -> Self {
        Self {
            ratio: Decimal::from(3),
            volume_floor: Decimal::ONE,
            resolution_move_percent: Decimal::new(3, 1),
        }
    }
}

#[derive(Debug)]
struct ActiveImbalance {
    imbalance: OrderFlowImbalance,
    /// Skew direction: `Buy` expects price up, `Sell` down.
    direction: Side,
    /// Level (or window) volume at detection; the absorption target.
    bucket_volume: Decimal,
    traded_since: Decimal,
}

/// Per-symbol imbalance detection and resolution state.
#[derive(Debug)]
pub struct ImbalanceDetector {
    config: ImbalanceConfig,
    active: Vec<ActiveImbalance>,
}

impl ImbalanceDetector {
    pub fn new(config: ImbalanceConfig) -> Self {
        Self {
            config,
            active: Vec::new(),
        }
    }

    /// Scan a closing window: mark imbalanced bars, emit level and
    /// whole-window imbalances, and start watching them for resolution.
    pub fn detect(&mut self, window: &mut FootprintWindow, now: i64) -> Vec<OrderFlowImbalance> {
        let floor = self.config.volume_floor;
        let threshold = self.config.ratio;

        // First pass: mark bars whose ratio clears the threshold. One row
        // per ladder level, `None` where the level is balanced.
        let mut rows: Vec<Option<(Decimal, Side, Decimal, Decimal)>> = Vec::new();
        for bar in window.bars.values_mut() {
            let (major, minor, side) = if bar.buy_volume >= bar.sell_volume {
                (bar.buy_volume, bar.sell_volume, Side::Buy)
            } else {
                (bar.sell_volume, bar.buy_volume, Side::Sell)
            };
            let mut row = None;
            if major > Decimal::ZERO {
                let ratio = major / minor.max(floor);
                if ratio > threshold {
                    bar.imbalance = true;
                    bar.imbalance_side = Some(side);
                    row = Some((bar.price_level, side, ratio, bar.total_volume()));
                }
            }
            rows.push(row);
        }

        // Second pass: ladder-contiguous runs of the same side share the
        // run's stack severity.
        let mut detected = Vec::new();
        let mut start = 0;
        while start < rows.len() {
            let Some((_, side, _, _)) = rows[start] else {
                start += 1;
                continue;
            };
            let mut end = start + 1;
            while end < rows.len() && matches!(rows[end], Some((_, s, _, _)) if s == side) {
                end += 1;
            }
            let severity = ImbalanceSeverity::for_stack(end - start);
            for row in rows[start..end].iter().flatten() {
                let (price, level_side, ratio, volume) = *row;
                detected.push(self.activate(
                    &window.symbol,
                    price,
                    match level_side {
                        Side::Sell => ImbalanceKind::AskStack,
                        _ => ImbalanceKind::BidStack,
                    },
                    severity,
                    ratio,
                    level_side,
                    volume,
                    now,
                ));
            }
            start = end;
        }

        // Whole-window skew.
        let (major, minor, side) = if window.total_buy_volume >= window.total_sell_volume {
            (window.total_buy_volume, window.total_sell_volume, Side::Buy)
        } else {
            (window.total_sell_volume, window.total_buy_volume, Side::Sell)
        };
        if major > Decimal::ZERO {
            let ratio = major / minor.max(floor);
            if ratio > threshold {
                let severity = Self::volume_severity(ratio, threshold);
                detected.push(self.activate(
                    &window.symbol,
                    window.close,
                    ImbalanceKind::VolumeImbalance,
                    severity,
                    ratio,
                    side,
                    window.total_buy_volume + window.total_sell_volume,
                    now,
                ));
            }
        }

        if !detected.is_empty() {
            debug!(
                symbol = %window.symbol,
                count = detected.len(),
                "Imbalances detected at window close"
            );
        }
        detected
    }

    /// Feed a live trade to every active imbalance; returns those it
    /// resolved.
    pub fn observe_trade(
        &mut self,
        price: Decimal,
        size: Decimal,
        now: i64,
    ) -> Vec<OrderFlowImbalance> {
        let move_percent = self.config.resolution_move_percent;
        // Absorption only counts while price stays within ±0.2%.
        let band = Decimal::new(2, 1);
        let hundred = Decimal::from(100);

        let mut resolved = Vec::new();
        self.active.retain_mut(|active| {
            active.traded_since += size;
            let reference = active.imbalance.price;
            if reference <= Decimal::ZERO {
                return true;
            }
            let travel = (price - reference) / reference * hundred;
            let with_skew = match active.direction {
                Side::Buy => travel,
                Side::Sell => -travel,
                Side::Unknown => Decimal::ZERO,
            };

            let outcome = if with_skew >= move_percent {
                Some(ImbalanceResolution::Continuation)
            } else if with_skew <= -move_percent {
                Some(ImbalanceResolution::Reversal)
            } else if active.traded_since >= active.bucket_volume && travel.abs() <= band {
                Some(ImbalanceResolution::Absorption)
            } else {
                None
            };

            match outcome {
                Some(resolution) => {
                    active.imbalance.resolved = true;
                    active.imbalance.resolution = Some(resolution);
                    active.imbalance.resolved_at = Some(now);
                    resolved.push(active.imbalance.clone());
                    false
                }
                None => true,
            }
        });
        resolved
    }

    /// Unresolved imbalances, detection order.
    pub fn active(&self) -> Vec<OrderFlowImbalance> {
        self.active.iter().map(|a| a.imbalance.clone()).collect()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    #[allow(clippy::too_many_arguments)]
    fn activate(
        &mut self,
        symbol: &str,
        price: Decimal,
        kind: ImbalanceKind,
        severity: ImbalanceSeverity,
        ratio: Decimal,
        direction: Side,
        bucket_volume: Decimal,
        now: i64,
    ) -> OrderFlowImbalance {
        let imbalance = OrderFlowImbalance {
            id: Uuid::now_v7(),
            symbol: symbol.to_string(),
            price,
            kind,
            severity,
            ratio,
            detected_at: now,
            resolved: false,
            resolution: None,
            resolved_at: None,
        };
        self.active.push(ActiveImbalance {
            imbalance: imbalance.clone(),
            direction,
            bucket_volume,
            traded_since: Decimal::ZERO,
        });
        imbalance
    }

    /// Multiples of the threshold map to severity for whole-window skew.
    fn volume_severity(ratio: Decimal, threshold: Decimal) -> ImbalanceSeverity {
        let times = ratio / threshold;
        if times >= Decimal::from(3) {
            ImbalanceSeverity::Extreme
        } else if times >= Decimal::from(2) {
            ImbalanceSeverity::High
        } else if times >= Decimal::new(15, 1) {
            ImbalanceSeverity::Medium
        } else {
            ImbalanceSeverity::Low
        }
    }
}
