//! Footprint windows
//!
//! Buckets trades into price levels quantized to a configured tick size
//! and rolls them into windows under one of three close policies:
//! - `Time`: fixed duration, boundaries aligned to the Unix epoch
//! - `Volume`: closes once cumulative traded volume reaches a target
//! - `TickCount`: closes after a fixed number of trades
//!
//! A window opens on the first trade that belongs to it. `process_trade`
//! returns the predecessor when a close triggers: time windows close
//! before the triggering trade is applied, volume and tick-count windows
//! close with it included.

use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::normalizer::Side;

/// Snap a trade price to the bucket grid, half away from zero.
///
/// A non-positive tick size leaves the price untouched; configuration
/// validation rejects that case before an engine is built.
pub fn quantize_price(price: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return price;
    }
    (price / tick_size).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        * tick_size
}

/// When a footprint window closes. Policies are mutually exclusive by
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Fixed duration, window starts aligned to the Unix epoch.
    Time { duration_nanos: i64 },
    /// Close once the window's traded volume reaches the target.
    Volume { target: Decimal },
    /// Close after this many trades.
    TickCount { count: u32 },
}

/// Volume at one quantized price level of a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FootprintBar {
    pub price_level: Decimal,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub buy_trades: u32,
    pub sell_trades: u32,
    /// Set at window close when the level's ratio breaches the threshold.
    pub imbalance: bool,
    pub imbalance_side: Option<Side>,
    /// Set at window close on the point-of-control level.
    pub poc: bool,
}

impl FootprintBar {
    fn new(price_level: Decimal) -> Self {
        Self {
            price_level,
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            buy_trades: 0,
            sell_trades: 0,
            imbalance: false,
            imbalance_side: None,
            poc: false,
        }
    }

    pub fn delta(&self) -> Decimal {
        self.buy_volume - self.sell_volume
    }

    pub fn total_volume(&self) -> Decimal {
        self.buy_volume + self.sell_volume
    }

    pub fn total_trades(&self) -> u32 {
        self.buy_trades + self.sell_trades
    }
}

/// One footprint window, additive while open, frozen once `closed_at`
/// is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FootprintWindow {
    pub symbol: String,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Quantized level → bar, ascending by price.
    pub bars: BTreeMap<Decimal, FootprintBar>,
    pub total_buy_volume: Decimal,
    pub total_sell_volume: Decimal,
    /// Volume from trades whose side stayed unknown; counts toward the
    /// volume-policy target but belongs to neither side of the delta.
    pub unattributed_volume: Decimal,
    pub tick_count: u32,
}

impl FootprintWindow {
    fn new(symbol: &str, opened_at: i64, first_level: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            opened_at,
            closed_at: None,
            open: first_level,
            high: first_level,
            low: first_level,
            close: first_level,
            bars: BTreeMap::new(),
            total_buy_volume: Decimal::ZERO,
            total_sell_volume: Decimal::ZERO,
            unattributed_volume: Decimal::ZERO,
            tick_count: 0,
        }
    }

    fn apply(&mut self, price_level: Decimal, size: Decimal, side: Side) {
        self.high = self.high.max(price_level);
        self.low = self.low.min(price_level);
        self.close = price_level;
        self.tick_count += 1;

        match side {
            Side::Buy => {
                let bar = self
                    .bars
                    .entry(price_level)
                    .or_insert_with(|| FootprintBar::new(price_level));
                bar.buy_volume += size;
                bar.buy_trades += 1;
                self.total_buy_volume += size;
            }
            Side::Sell => {
                let bar = self
                    .bars
                    .entry(price_level)
                    .or_insert_with(|| FootprintBar::new(price_level));
                bar.sell_volume += size;
                bar.sell_trades += 1;
                self.total_sell_volume += size;
            }
            Side::Unknown => {
                self.unattributed_volume += size;
            }
        }
    }

    /// Buy minus sell volume over the whole window.
    pub fn delta(&self) -> Decimal {
        self.total_buy_volume - self.total_sell_volume
    }

    /// All traded volume, unknown sides included.
    pub fn total_volume(&self) -> Decimal {
        self.total_buy_volume + self.total_sell_volume + self.unattributed_volume
    }

    pub fn is_empty(&self) -> bool {
        self.tick_count == 0
    }
}

/// Rolls one symbol's trades into footprint windows under a policy.
#[derive(Debug)]
pub struct WindowBuilder {
    symbol: String,
    policy: WindowPolicy,
    current: Option<FootprintWindow>,
}

impl WindowBuilder {
    pub fn new(symbol: &str, policy: WindowPolicy) -> Self {
        Self {
            symbol: symbol.to_string(),
            policy,
            current: None,
        }
    }

    /// Apply one trade at its quantized level. Returns the closed window
    /// when this trade triggered a close.
    pub fn process_trade(
        &mut self,
        price_level: Decimal,
        size: Decimal,
        side: Side,
        timestamp: i64,
    ) -> Option<FootprintWindow> {
        let mut closed = None;

        if let WindowPolicy::Time { duration_nanos } = self.policy {
            let past_boundary = self
                .current
                .as_ref()
                .is_some_and(|w| timestamp >= w.opened_at + duration_nanos);
            if past_boundary {
                if let Some(mut done) = self.current.take() {
                    done.closed_at = Some(done.opened_at + duration_nanos);
                    closed = Some(done);
                }
            }
        }

        let opened_at = match self.policy {
            WindowPolicy::Time { duration_nanos } if duration_nanos > 0 => {
                timestamp - timestamp.rem_euclid(duration_nanos)
            }
            _ => timestamp,
        };
        let current = self
            .current
            .get_or_insert_with(|| FootprintWindow::new(&self.symbol, opened_at, price_level));
        current.apply(price_level, size, side);

        let close_now = match self.policy {
            WindowPolicy::Volume { target } => current.total_volume() >= target,
            WindowPolicy::TickCount { count } => current.tick_count >= count,
            WindowPolicy::Time { .. } => false,
        };
        if close_now {
            if let Some(mut done) = self.current.take() {
                done.closed_at = Some(timestamp);
                closed = Some(done);
            }
        }

        closed
    }

    /// Force-close the open window regardless of policy.
    pub fn close_current(&mut self, now: i64) -> Option<FootprintWindow> {
        let mut done = self.current.take()?;
        done.closed_at = Some(now);
        Some(done)
    }

    /// Close a time window whose boundary passed with no further trades.
    pub fn close_elapsed(&mut self, now: i64) -> Option<FootprintWindow> {
        let WindowPolicy::Time { duration_nanos } = self.policy else {
            return None;
        };
        let boundary = self.current.as_ref()?.opened_at + duration_nanos;
        if now < boundary {
            return None;
        }
        let mut done = self.current.take()?;
        done.closed_at = Some(boundary);
        Some(done)
    }

    pub fn current(&self) -> Option<&FootprintWindow> {
        self.current.as_ref()
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const T0: i64 = 1708123456789000000;
    const MIN: i64 = 60 * 1_000_000_000;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    #[test]
    fn test_quantize_rounds_to_grid() {
        let tick = dec("0.05");
        assert_eq!(quantize_price(dec("10.024"), tick), dec("10.00"));
        assert_eq!(quantize_price(dec("10.026"), tick), dec("10.05"));
        assert_eq!(quantize_price(dec("10.00"), tick), dec("10.00"));
    }

    #[test]
    fn test_quantize_midpoint_away_from_zero() {
        // 10.025 / 0.05 = 200.5, which rounds away from zero to 201.
        assert_eq!(quantize_price(dec("10.025"), dec("0.05")), dec("10.05"));
    }

    #[test]
    fn test_quantize_zero_tick_passthrough() {
        assert_eq!(quantize_price(dec("10.024"), Decimal::ZERO), dec("10.024"));
    }

    #[test]
    fn test_footprint_buckets_by_side() {
        let mut builder = WindowBuilder::new(
            "BTC/USDT",
            WindowPolicy::Time {
                duration_nanos: 5 * MIN,
            },
        );
        for _ in 0..5 {
            builder.process_trade(dec("10.00"), dec("1"), Side::Buy, T0);
        }
        for _ in 0..3 {
            builder.process_trade(dec("9.95"), dec("1"), Side::Sell, T0 + 1);
        }

        let window = builder.current().unwrap();
        assert_eq!(window.bars[&dec("10.00")].buy_volume, dec("5"));
        assert_eq!(window.bars[&dec("10.00")].sell_volume, Decimal::ZERO);
        assert_eq!(window.bars[&dec("9.95")].sell_volume, dec("3"));
        assert_eq!(window.delta(), dec("2"));
        assert_eq!(window.tick_count, 8);
    }

    #[test]
    fn test_time_window_aligns_to_epoch() {
        let duration = 5 * MIN;
        let mut builder = WindowBuilder::new("BTC/USDT", WindowPolicy::Time {
            duration_nanos: duration,
        });
        builder.process_trade(dec("10"), dec("1"), Side::Buy, T0);

        let opened = builder.current().unwrap().opened_at;
        assert_eq!(opened % duration, 0);
        assert!(opened <= T0 && T0 < opened + duration);
    }

    #[test]
    fn test_time_window_closes_before_boundary_trade() {
        let duration = 5 * MIN;
        let mut builder = WindowBuilder::new("BTC/USDT", WindowPolicy::Time {
            duration_nanos: duration,
        });
        builder.process_trade(dec("10"), dec("1"), Side::Buy, T0);
        let boundary = builder.current().unwrap().opened_at + duration;

        let closed = builder
            .process_trade(dec("11"), dec("2"), Side::Buy, boundary)
            .unwrap();
        // The boundary trade belongs to the next window.
        assert_eq!(closed.closed_at, Some(boundary));
        assert_eq!(closed.total_buy_volume, dec("1"));
        assert_eq!(builder.current().unwrap().total_buy_volume, dec("2"));
        assert_eq!(builder.current().unwrap().opened_at, boundary);
    }

    #[test]
    fn test_volume_window_closes_with_trigger_included() {
        let mut builder = WindowBuilder::new("BTC/USDT", WindowPolicy::Volume {
            target: dec("10"),
        });
        assert!(builder
            .process_trade(dec("10"), dec("6"), Side::Buy, T0)
            .is_none());
        let closed = builder
            .process_trade(dec("10.05"), dec("4"), Side::Sell, T0 + 1)
            .unwrap();

        assert_eq!(closed.total_volume(), dec("10"));
        assert_eq!(closed.closed_at, Some(T0 + 1));
        assert!(builder.current().is_none());
    }

    #[test]
    fn test_tick_count_window() {
        let mut builder =
            WindowBuilder::new("BTC/USDT", WindowPolicy::TickCount { count: 3 });
        assert!(builder
            .process_trade(dec("10"), dec("1"), Side::Buy, T0)
            .is_none());
        assert!(builder
            .process_trade(dec("10"), dec("1"), Side::Buy, T0 + 1)
            .is_none());
        let closed = builder
            .process_trade(dec("10"), dec("1"), Side::Sell, T0 + 2)
            .unwrap();
        assert_eq!(closed.tick_count, 3);
    }

    #[test]
    fn test_unknown_side_counts_toward_volume_target() {
        let mut builder = WindowBuilder::new("BTC/USDT", WindowPolicy::Volume {
            target: dec("5"),
        });
        builder.process_trade(dec("10"), dec("3"), Side::Buy, T0);
        let closed = builder
            .process_trade(dec("10"), dec("2"), Side::Unknown, T0 + 1)
            .unwrap();

        assert_eq!(closed.unattributed_volume, dec("2"));
        assert_eq!(closed.total_buy_volume, dec("3"));
        assert_eq!(closed.delta(), dec("3"));
    }

    #[test]
    fn test_ohlc_tracks_quantized_levels() {
        let mut builder = WindowBuilder::new("BTC/USDT", WindowPolicy::TickCount { count: 10 });
        builder.process_trade(dec("10.00"), dec("1"), Side::Buy, T0);
        builder.process_trade(dec("10.10"), dec("1"), Side::Buy, T0 + 1);
        builder.process_trade(dec("9.90"), dec("1"), Side::Sell, T0 + 2);
        builder.process_trade(dec("9.95"), dec("1"), Side::Sell, T0 + 3);

        let window = builder.current().unwrap();
        assert_eq!(window.open, dec("10.00"));
        assert_eq!(window.high, dec("10.10"));
        assert_eq!(window.low, dec("9.90"));
        assert_eq!(window.close, dec("9.95"));
    }

    #[test]
    fn test_close_elapsed_without_traffic() {
        let duration = 5 * MIN;
        let mut builder = WindowBuilder::new("BTC/USDT", WindowPolicy::Time {
            duration_nanos: duration,
        });
        builder.process_trade(dec("10"), dec("1"), Side::Buy, T0);
        let boundary = builder.current().unwrap().opened_at + duration;

        assert!(builder.close_elapsed(boundary - 1).is_none());
        let closed = builder.close_elapsed(boundary + MIN).unwrap();
        assert_eq!(closed.closed_at, Some(boundary));
        assert!(builder.current().is_none());
    }

    #[test]
    fn test_close_current_forces() {
        let mut builder = WindowBuilder::new("BTC/USDT", WindowPolicy::Volume {
            target: dec("100"),
        });
        assert!(builder.close_current(T0).is_none());
        builder.process_trade(dec("10"), dec("1"), Side::Buy, T0);

        let closed = builder.close_current(T0 + 1).unwrap();
        assert_eq!(closed.closed_at, Some(T0 + 1));
        assert_eq!(closed.total_buy_volume, dec("1"));
    }

    proptest! {
        /// Every ingested size comes back out of the closed window, both
        /// through the side totals and through the per-level buckets.
        #[test]
        fn prop_window_conserves_volume(
            trades in prop::collection::vec(
                (90_000i64..110_000, 1i64..5_000, 0u8..3u8),
                1..50,
            ),
        ) {
            let mut builder = WindowBuilder::new("BTC/USDT", WindowPolicy::Time {
                duration_nanos: 60 * MIN,
            });
            let mut ingested = Decimal::ZERO;
            for (i, (price_cents, size_milli, side)) in trades.iter().enumerate() {
                let side = match side {
                    0 => Side::Buy,
                    1 => Side::Sell,
                    _ => Side::Unknown,
                };
                let size = Decimal::new(*size_milli, 3);
                ingested += size;
                builder.process_trade(Decimal::new(*price_cents, 2), size, side, T0 + i as i64);
            }

            let window = builder.close_current(T0 + MIN).unwrap();
            prop_assert_eq!(window.total_volume(), ingested);

            let bucketed: Decimal = window
                .bars
                .values()
                .map(|bar| bar.buy_volume + bar.sell_volume)
                .sum();
            prop_assert_eq!(bucketed + window.unattributed_volume, ingested);
        }
    }
}
