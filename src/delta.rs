//! Cumulative delta tracking
//!
//! Runs session-cumulative delta (buy volume minus sell volume) per
//! symbol and finalizes a `DeltaProfile` at each window close with
//! momentum, acceleration, pressure split, and divergence/exhaustion
//! flags.
//!
//! Momentum compares the summed delta of the last smoothing period of
//! windows against the period before it; acceleration is the change in
//! momentum between consecutive closes.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::normalizer::Side;

/// Configuration for delta analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Windows per momentum period (default: 5).
    pub smoothing_period: usize,
    /// Minimum |window delta| for a divergence flag (default: 10).
    pub divergence_min_delta: Decimal,
    /// Minimum strength, in percent, for exhaustion (default: 60).
    pub exhaustion_min_strength: Decimal,
    /// Acceleration at or below the negative of this marks exhaustion
    /// (default: 5).
    pub exhaustion_deceleration: Decimal,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            smoothing_period: 5,
            divergence_min_delta: Decimal::from(10),
            exhaustion_min_strength: Decimal::from(60),
            exhaustion_deceleration: Decimal::from(5),
        }
    }
}

/// Finalized delta analysis for one closed window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaProfile {
    pub symbol: String,
    pub window_delta: Decimal,
    /// Session-cumulative delta after this window.
    pub cumulative_delta: Decimal,
    /// Extremes of the cumulative delta within the window.
    pub delta_high: Decimal,
    pub delta_low: Decimal,
    pub momentum: Decimal,
    pub acceleration: Decimal,
    /// Buy / sell share of the window's attributed volume, in percent.
    pub buy_pressure: Decimal,
    pub sell_pressure: Decimal,
    /// |window delta| relative to attributed volume, in percent.
    pub strength: Decimal,
    /// Price moved one way while delta pointed the other.
    pub divergent: bool,
    /// Strong skew whose momentum is sharply decelerating.
    pub exhausted: bool,
    pub finalized_at: i64,
}

/// Per-symbol delta state across windows.
#[derive(Debug)]
pub struct DeltaTracker {
    config: DeltaConfig,
    cumulative: Decimal,
    window_buy: Decimal,
    window_sell: Decimal,
    window_high: Decimal,
    window_low: Decimal,
    /// Deltas of recent closed windows, two smoothing periods deep.
    recent_deltas: VecDeque<Decimal>,
    last_momentum: Option<Decimal>,
}

impl DeltaTracker {
    pub fn new(config: DeltaConfig) -> Self {
        Self {
            config,
            cumulative: Decimal::ZERO,
            window_buy: Decimal::ZERO,
            window_sell: Decimal::ZERO,
            window_high: Decimal::ZERO,
            window_low: Decimal::ZERO,
            recent_deltas: VecDeque::new(),
            last_momentum: None,
        }
    }

    /// Fold one classified trade into the open window.
    pub fn on_trade(&mut self, size: Decimal, side: Side) {
        match side {
            Side::Buy => {
                self.window_buy += size;
                self.cumulative += size;
            }
            Side::Sell => {
                self.window_sell += size;
                self.cumulative -= size;
            }
            Side::Unknown => return,
        }
        self.window_high = self.window_high.max(self.cumulative);
        self.window_low = self.window_low.min(self.cumulative);
    }

    /// Close the window: compute the profile, fold the window delta into
    /// the momentum history, and reset window-local state.
    pub fn finalize_window(
        &mut self,
        symbol: &str,
        open_price: Decimal,
        close_price: Decimal,
        now: i64,
    ) -> DeltaProfile {
        let window_delta = self.window_buy - self.window_sell;
        let volume = self.window_buy + self.window_sell;

        let hundred = Decimal::from(100);
        let (buy_pressure, sell_pressure, strength) = if volume > Decimal::ZERO {
            (
                self.window_buy / volume * hundred,
                self.window_sell / volume * hundred,
                window_delta.abs() / volume * hundred,
            )
        } else {
            (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
        };

        let period = self.config.smoothing_period.max(1);
        self.recent_deltas.push_back(window_delta);
        while self.recent_deltas.len() > 2 * period {
            self.recent_deltas.pop_front();
        }
        let last: Decimal = self.recent_deltas.iter().rev().take(period).sum();
        let previous: Decimal = self
            .recent_deltas
            .iter()
            .rev()
            .skip(period)
            .take(period)
            .sum();
        let momentum = last - previous;
        let acceleration = momentum - self.last_momentum.unwrap_or(momentum);
        self.last_momentum = Some(momentum);

        let price_move = close_price - open_price;
        let divergent = price_move != Decimal::ZERO
            && window_delta != Decimal::ZERO
            && (price_move > Decimal::ZERO) != (window_delta > Decimal::ZERO)
            && window_delta.abs() >= self.config.divergence_min_delta;
        let exhausted = strength >= self.config.exhaustion_min_strength
            && acceleration <= -self.config.exhaustion_deceleration;

        let profile = DeltaProfile {
            symbol: symbol.to_string(),
            window_delta,
            cumulative_delta: self.cumulative,
            delta_high: self.window_high,
            delta_low: self.window_low,
            momentum,
            acceleration,
            buy_pressure,
            sell_pressure,
            strength,
            divergent,
            exhausted,
            finalized_at: now,
        };

        self.window_buy = Decimal::ZERO;
        self.window_sell = Decimal::ZERO;
        self.window_high = self.cumulative;
        self.window_low = self.cumulative;
        profile
    }

    /// Session-cumulative delta including the open window.
    pub fn cumulative(&self) -> Decimal {
        self.cumulative
    }

    /// Delta of the open window so far.
    pub fn window_delta(&self) -> Decimal {
        self.window_buy - self.window_sell
    }
}
