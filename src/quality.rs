//! Per-(exchange, symbol) feed data-quality scoring
//!
//! Each feed stream gets a composite quality score in [0, 1] combining:
//! - availability: EWMA of on-time update arrivals, decayed once per
//!   expected interval that passes with no update
//! - staleness: age of the latest update vs. the expected cadence,
//!   computed at read time
//! - error rate: EWMA of rejected/failed updates
//!
//! The composite is a weighted average with configurable weights. The
//! aggregation engine uses the score to exclude poor feeds from the
//! consensus price and to gate arbitrage reporting; excluded exchanges
//! are still reported with their score visible.
//!
//! EWMA constants are 0.95 decay / 0.05 gain per observation, so roughly
//! the last sixty observations dominate the score.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Missed-interval decay is applied at most this many times per catch-up;
/// beyond it the availability term is already below 0.01.
const MAX_DECAY_STEPS: i64 = 128;

/// Relative weights of the three quality sub-scores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub availability: Decimal,
    pub staleness: Decimal,
    pub error_rate: Decimal,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            availability: Decimal::new(4, 1),
            staleness: Decimal::new(4, 1),
            error_rate: Decimal::new(2, 1),
        }
    }
}

impl QualityWeights {
    pub fn total(&self) -> Decimal {
        self.availability + self.staleness + self.error_rate
    }
}

/// Configuration for quality scoring. Shared with the aggregation engine,
/// which uses the same staleness window for quote freshness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Cadence the exchange is expected to update at (default: 5s).
    pub expected_update_interval_nanos: i64,
    /// Age beyond which a quote is considered stale (default: 30s).
    pub staleness_window_nanos: i64,
    pub weights: QualityWeights,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            expected_update_interval_nanos: 5 * 1_000_000_000,
            staleness_window_nanos: 30 * 1_000_000_000,
            weights: QualityWeights::default(),
        }
    }
}

/// Sub-score breakdown returned alongside the composite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityScore {
    pub availability: Decimal,
    pub staleness: Decimal,
    pub error_rate: Decimal,
    /// Weighted average of the three sub-scores, clamped to [0, 1].
    pub composite: Decimal,
    /// Total updates observed for this stream.
    pub updates: u64,
    /// Total rejections observed for this stream.
    pub rejections: u64,
}

impl QualityScore {
    /// Score reported for a stream that has never updated.
    pub fn empty() -> Self {
        Self {
            availability: Decimal::ZERO,
            staleness: Decimal::ZERO,
            error_rate: Decimal::ZERO,
            composite: Decimal::ZERO,
            updates: 0,
            rejections: 0,
        }
    }
}

/// Mutable EWMA state for one (exchange, symbol) stream.
#[derive(Debug, Clone)]
struct StreamQuality {
    availability: Decimal,
    error_ewma: Decimal,
    /// Time of the latest accepted update, Unix nanos.
    last_update: i64,
    /// Time up to which missed-interval decay has been charged.
    observed_until: i64,
    updates: u64,
    rejections: u64,
}

impl StreamQuality {
    fn new(now: i64) -> Self {
        Self {
            availability: Decimal::ONE,
            error_ewma: Decimal::ZERO,
            last_update: now,
            observed_until: now,
            updates: 0,
            rejections: 0,
        }
    }

    /// Charge availability decay for every full expected interval that has
    /// elapsed since the last observation without an update.
    ///
    /// An arrival at exactly one interval of age is on time; the first
    /// miss is charged strictly after the interval completes.
    fn catch_up(&mut self, now: i64, expected_interval: i64) {
        if expected_interval <= 0 || now <= self.observed_until {
            return;
        }
        let elapsed = now - self.observed_until;
        let missed = if elapsed > expected_interval {
            (elapsed - 1) / expected_interval
        } else {
            0
        };
        if missed <= 0 {
            return;
        }
        let decay = Decimal::new(95, 2);
        for _ in 0..missed.min(MAX_DECAY_STEPS) {
            self.availability *= decay;
        }
        self.observed_until += missed * expected_interval;
    }

    fn record_update(&mut self, now: i64, expected_interval: i64) {
        self.catch_up(now, expected_interval);
        self.availability = self.availability * Decimal::new(95, 2) + Decimal::new(5, 2);
        self.error_ewma *= Decimal::new(95, 2);
        self.last_update = now;
        self.observed_until = now;
        self.updates += 1;
    }

    fn record_rejection(&mut self, now: i64, expected_interval: i64) {
        self.catch_up(now, expected_interval);
        self.availability *= Decimal::new(95, 2);
        self.error_ewma = self.error_ewma * Decimal::new(95, 2) + Decimal::new(5, 2);
        self.observed_until = now;
        self.rejections += 1;
    }
}

/// Tracks quality for every (exchange, symbol) stream in a shard.
pub struct DataQualityTracker {
    config: QualityConfig,
    streams: BTreeMap<(String, String), StreamQuality>,
}

impl DataQualityTracker {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            streams: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(QualityConfig::default())
    }

    /// Record an accepted update for the stream.
    pub fn record_update(&mut self, exchange: &str, symbol: &str, now: i64) {
        let interval = self.config.expected_update_interval_nanos;
        self.stream_mut(exchange, symbol, now)
            .record_update(now, interval);
    }

    /// Record a rejected/failed update for the stream.
    pub fn record_rejection(&mut self, exchange: &str, symbol: &str, now: i64) {
        let interval = self.config.expected_update_interval_nanos;
        self.stream_mut(exchange, symbol, now)
            .record_rejection(now, interval);
        debug!(exchange, symbol, "Feed rejection recorded against quality");
    }

    /// Composite score with sub-score breakdown for the stream.
    ///
    /// An unknown stream scores zero across the board.
    pub fn score(&mut self, exchange: &str, symbol: &str, now: i64) -> QualityScore {
        let interval = self.config.expected_update_interval_nanos;
        let window = self.config.staleness_window_nanos;
        let weights = self.config.weights.clone();

        let Some(stream) = self
            .streams
            .get_mut(&(exchange.to_string(), symbol.to_string()))
        else {
            return QualityScore::empty();
        };
        if stream.updates == 0 {
            return QualityScore::empty();
        }

        stream.catch_up(now, interval);

        let availability = clamp_unit(stream.availability);
        let staleness = staleness_score(now - stream.last_update, interval, window);
        let error_rate = clamp_unit(Decimal::ONE - stream.error_ewma);

        let total = weights.total();
        let composite = if total <= Decimal::ZERO {
            Decimal::ZERO
        } else {
            clamp_unit(
                (weights.availability * availability
                    + weights.staleness * staleness
                    + weights.error_rate * error_rate)
                    / total,
            )
        };

        QualityScore {
            availability,
            staleness,
            error_rate,
            composite,
            updates: stream.updates,
            rejections: stream.rejections,
        }
    }

    /// Composite only; convenience for gating checks.
    pub fn composite(&mut self, exchange: &str, symbol: &str, now: i64) -> Decimal {
        self.score(exchange, symbol, now).composite
    }

    /// Number of streams tracked.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn stream_mut(&mut self, exchange: &str, symbol: &str, now: i64) -> &mut StreamQuality {
        self.streams
            .entry((exchange.to_string(), symbol.to_string()))
            .or_insert_with(|| StreamQuality::new(now))
    }
}

/// Staleness sub-score: 1 within the expected cadence, linearly decaying
/// to 0 at the staleness window.
fn staleness_score(age_nanos: i64, expected_interval: i64, staleness_window: i64) -> Decimal {
    if age_nanos <= expected_interval {
        return Decimal::ONE;
    }
    if age_nanos >= staleness_window || staleness_window <= expected_interval {
        return Decimal::ZERO;
    }
    let remaining = Decimal::from(staleness_window - age_nanos);
    let span = Decimal::from(staleness_window - expected_interval);
    clamp_unit(remaining / span)
}

fn clamp_unit(value: Decimal) -> Decimal {
    value.clamp(Decimal::ZERO, Decimal::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1708123456789000000;
    const SEC: i64 = 1_000_000_000;

    fn tracker() -> DataQualityTracker {
        DataQualityTracker::with_defaults()
    }

    #[test]
    fn test_unknown_stream_scores_zero() {
        let mut t = tracker();
        let score = t.score("binance", "BTC/USDT", T0);
        assert_eq!(score, QualityScore::empty());
    }

    #[test]
    fn test_steady_updates_score_high() {
        let mut t = tracker();

        // One update per expected interval for a minute.
        for i in 0..12 {
            t.record_update("binance", "BTC/USDT", T0 + i * 5 * SEC);
        }

        let score = t.score("binance", "BTC/USDT", T0 + 12 * 5 * SEC);
        assert!(score.availability > Decimal::new(9, 1));
        assert_eq!(score.staleness, Decimal::ONE);
        assert_eq!(score.error_rate, Decimal::ONE);
        assert!(score.composite > Decimal::new(9, 1));
        assert_eq!(score.updates, 12);
    }

    #[test]
    fn test_rejections_raise_error_rate() {
        let mut t = tracker();

        t.record_update("binance", "BTC/USDT", T0);
        for i in 1..=10 {
            t.record_rejection("binance", "BTC/USDT", T0 + i * SEC);
        }

        let score = t.score("binance", "BTC/USDT", T0 + 11 * SEC);
        assert!(score.error_rate < Decimal::ONE);
        assert_eq!(score.rejections, 10);

        let mut clean = tracker();
        clean.record_update("binance", "BTC/USDT", T0);
        let clean_score = clean.score("binance", "BTC/USDT", T0 + 11 * SEC);
        assert!(score.composite < clean_score.composite);
    }

    #[test]
    fn test_silent_feed_availability_decays() {
        let mut t = tracker();
        t.record_update("binance", "BTC/USDT", T0);

        let early = t.score("binance", "BTC/USDT", T0 + SEC).availability;
        // Twenty expected intervals with nothing arriving.
        let late = t
            .score("binance", "BTC/USDT", T0 + 20 * 5 * SEC)
            .availability;

        assert!(late < early);
        assert!(late < Decimal::new(4, 1)); // ~0.95^19 ≈ 0.38
    }

    #[test]
    fn test_decay_charged_once_per_interval() {
        let mut t = tracker();
        t.record_update("binance", "BTC/USDT", T0);

        // Reading twice at the same instant must not double-charge.
        let first = t.score("binance", "BTC/USDT", T0 + 20 * 5 * SEC).availability;
        let second = t.score("binance", "BTC/USDT", T0 + 20 * 5 * SEC).availability;
        assert_eq!(first, second);
    }

    #[test]
    fn test_staleness_decays_linearly() {
        let mut t = tracker();
        t.record_update("binance", "BTC/USDT", T0);

        // Within expected cadence: full score.
        assert_eq!(t.score("binance", "BTC/USDT", T0 + 4 * SEC).staleness, Decimal::ONE);

        // Midway between cadence (5s) and window (30s).
        let mid = t.score("binance", "BTC/USDT", T0 + 17 * SEC + SEC / 2).staleness;
        assert!(mid > Decimal::new(4, 1) && mid < Decimal::new(6, 1));

        // Beyond the window: zero.
        assert_eq!(t.score("binance", "BTC/USDT", T0 + 31 * SEC).staleness, Decimal::ZERO);
    }

    #[test]
    fn test_composite_uses_weights() {
        let config = QualityConfig {
            weights: QualityWeights {
                availability: Decimal::ZERO,
                staleness: Decimal::ONE,
                error_rate: Decimal::ZERO,
            },
            ..QualityConfig::default()
        };
        let mut t = DataQualityTracker::new(config);
        t.record_update("binance", "BTC/USDT", T0);

        // Composite tracks staleness alone under these weights.
        let fresh = t.score("binance", "BTC/USDT", T0 + SEC);
        assert_eq!(fresh.composite, Decimal::ONE);

        let stale = t.score("binance", "BTC/USDT", T0 + 31 * SEC);
        assert_eq!(stale.composite, Decimal::ZERO);
    }

    #[test]
    fn test_zero_weight_total_scores_zero() {
        let config = QualityConfig {
            weights: QualityWeights {
                availability: Decimal::ZERO,
                staleness: Decimal::ZERO,
                error_rate: Decimal::ZERO,
            },
            ..QualityConfig::default()
        };
        let mut t = DataQualityTracker::new(config);
        t.record_update("binance", "BTC/USDT", T0);

        assert_eq!(t.composite("binance", "BTC/USDT", T0 + SEC), Decimal::ZERO);
    }

    #[test]
    fn test_streams_tracked_independently() {
        let mut t = tracker();
        t.record_update("binance", "BTC/USDT", T0);
        t.record_update("kraken", "BTC/USDT", T0);
        for i in 1..=5 {
            t.record_rejection("kraken", "BTC/USDT", T0 + i * SEC);
        }

        assert_eq!(t.stream_count(), 2);
        let now = T0 + 6 * SEC;
        assert!(t.composite("binance", "BTC/USDT", now) > t.composite("kraken", "BTC/USDT", now));
    }

    #[test]
    fn test_score_bounds() {
        let mut t = tracker();
        t.record_update("binance", "BTC/USDT", T0);
        for i in 0..100 {
            t.record_rejection("binance", "BTC/USDT", T0 + i * SEC);
        }

        let score = t.score("binance", "BTC/USDT", T0 + 200 * SEC);
        for value in [score.availability, score.staleness, score.error_rate, score.composite] {
            assert!(value >= Decimal::ZERO && value <= Decimal::ONE);
        }
    }
}
