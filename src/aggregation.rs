//! Cross-exchange quote aggregation
//!
//! Maintains the per-(exchange, symbol) quote table and materializes
//! per-symbol `MarketSummary` snapshots:
//! - best bid/ask across fresh exchanges
//! - volume-weighted consensus price over exchanges passing the quality
//!   floor, weighted by trailing 24h volume
//! - per-exchange quote views with age and quality visible
//!
//! Summaries are rebuilt whole and cached, never patched field by field,
//! so snapshot readers can never observe a torn summary. A stale or
//! missing exchange is excluded from the consensus but still reported;
//! zero fresh exchanges produce a `no_data` summary with quality 0
//! instead of an error.
//!
//! One engine instance per symbol shard; all mutation is single-writer.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::arbitrage::{self, ArbitrageConfig, ArbitrageOpportunity};
use crate::book::{AggregatedBook, BookTable};
use crate::normalizer::{NormalizedBook, NormalizedQuote, NormalizedTick};
use crate::quality::{DataQualityTracker, QualityConfig, QualityScore};

/// Latest quote state for one exchange on one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeQuote {
    pub exchange: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume_24h: Decimal,
    pub change_percent_24h: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    /// Time of the latest update, Unix nanos.
    pub updated_at: i64,
}

/// Per-exchange row of a `MarketSummary`, with exclusion state visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeQuoteView {
    pub quote: ExchangeQuote,
    /// Age at summary build time, nanoseconds.
    pub age_nanos: i64,
    /// Composite data-quality score at build time.
    pub quality: Decimal,
    /// Within the staleness window at build time.
    pub fresh: bool,
    /// Contributed to the consensus weighting.
    pub included: bool,
}

/// Consensus view for one symbol, rebuilt atomically per cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSummary {
    pub symbol: String,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    /// Volume-weighted consensus price over included exchanges. `None`
    /// when no exchange qualified for the weighting.
    pub weighted_price: Option<Decimal>,
    pub spread: Option<Decimal>,
    pub spread_percent: Option<Decimal>,
    /// Total trailing 24h volume across fresh exchanges.
    pub total_volume_24h: Decimal,
    /// All known exchanges for the symbol, including excluded ones.
    pub exchanges: BTreeMap<String, ExchangeQuoteView>,
    /// Mean composite quality of the exchanges backing this summary.
    pub quality: Decimal,
    /// True when zero exchanges had fresh data at build time.
    pub no_data: bool,
    pub built_at: i64,
}

impl MarketSummary {
    fn no_data(symbol: &str, exchanges: BTreeMap<String, ExchangeQuoteView>, now: i64) -> Self {
        Self {
            symbol: symbol.to_string(),
            best_bid: None,
            best_ask: None,
            weighted_price: None,
            spread: None,
            spread_percent: None,
            total_volume_24h: Decimal::ZERO,
            exchanges,
            quality: Decimal::ZERO,
            no_data: true,
            built_at: now,
        }
    }
}

/// Configuration for the aggregation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Cached summaries aged this or more are rebuilt on read (default: 30s).
    pub summary_max_age_nanos: i64,
    /// Exchanges scoring below this are excluded from the consensus
    /// weighting and from arbitrage reporting.
    pub quality_floor: Decimal,
    /// Max levels per side served from the merged book.
    pub max_book_depth: usize,
    pub quality: QualityConfig,
    pub arbitrage: ArbitrageConfig,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            summary_max_age_nanos: 30 * 1_000_000_000,
            quality_floor: Decimal::new(3, 1),
            max_book_depth: 50,
            quality: QualityConfig::default(),
            arbitrage: ArbitrageConfig::default(),
        }
    }
}

/// Aggregates normalized feeds for the symbols of one shard.
pub struct AggregationEngine {
    config: AggregationConfig,
    /// symbol → exchange → latest quote.
    quotes: BTreeMap<String, BTreeMap<String, ExchangeQuote>>,
    books: BookTable,
    quality: DataQualityTracker,
    /// Cached summaries by symbol.
    summaries: BTreeMap<String, MarketSummary>,
}

impl AggregationEngine {
    pub fn new(config: AggregationConfig) -> Self {
        let quality = DataQualityTracker::new(config.quality.clone());
        Self {
            config,
            quotes: BTreeMap::new(),
            books: BookTable::new(),
            quality,
            summaries: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AggregationConfig::default())
    }

    /// Apply a full quote update for (exchange, symbol).
    pub fn ingest_quote(&mut self, quote: NormalizedQuote, now: i64) {
        self.quality
            .record_update(&quote.exchange, &quote.symbol, now);

        debug!(
            exchange = %quote.exchange,
            symbol = %quote.symbol,
            bid = %quote.bid,
            ask = %quote.ask,
            "Quote ingested"
        );

        let entry = ExchangeQuote {
            exchange: quote.exchange.clone(),
            bid: quote.bid,
            ask: quote.ask,
            last: quote.last,
            volume_24h: quote.volume_24h,
            change_percent_24h: quote.change_percent_24h,
            high_24h: quote.high_24h,
            low_24h: quote.low_24h,
            updated_at: now,
        };
        self.quotes
            .entry(quote.symbol)
            .or_default()
            .insert(quote.exchange, entry);
    }

    /// Apply a trade tick: refreshes last price (and top-of-book when the
    /// tick carries it) for the exchange.
    pub fn ingest_tick(&mut self, tick: &NormalizedTick, now: i64) {
        self.quality.record_update(&tick.exchange, &tick.symbol, now);

        let per_exchange = self.quotes.entry(tick.symbol.clone()).or_default();
        match per_exchange.get_mut(&tick.exchange) {
            Some(quote) => {
                quote.last = tick.price;
                if let Some(bid) = tick.bid_price {
                    quote.bid = bid;
                }
                if let Some(ask) = tick.ask_price {
                    quote.ask = ask;
                }
                quote.updated_at = now;
            }
            None => {
                // First sighting of this stream is a trade; seed the quote
                // with the trade price standing in for the missing book.
                per_exchange.insert(
                    tick.exchange.clone(),
                    ExchangeQuote {
                        exchange: tick.exchange.clone(),
                        bid: tick.bid_price.unwrap_or(tick.price),
                        ask: tick.ask_price.unwrap_or(tick.price),
                        last: tick.price,
                        volume_24h: Decimal::ZERO,
                        change_percent_24h: Decimal::ZERO,
                        high_24h: tick.price,
                        low_24h: tick.price,
                        updated_at: now,
                    },
                );
            }
        }
    }

    /// Count a rejected update against the stream's quality.
    pub fn record_rejection(&mut self, exchange: &str, symbol: &str, now: i64) {
        self.quality.record_rejection(exchange, symbol, now);
    }

    /// Store a depth snapshot for the merged-book query.
    pub fn ingest_book(&mut self, book: NormalizedBook) {
        self.books.ingest(book);
    }

    /// Latest consensus view, rebuilt when the cached one is too old.
    pub fn summary(&mut self, symbol: &str, now: i64) -> MarketSummary {
        if let Some(cached) = self.summaries.get(symbol) {
            if now - cached.built_at < self.config.summary_max_age_nanos {
                return cached.clone();
            }
        }
        self.rebuild_summary(symbol, now)
    }

    /// Rebuild the summary for one symbol unconditionally.
    pub fn rebuild_summary(&mut self, symbol: &str, now: i64) -> MarketSummary {
        let window = self.config.quality.staleness_window_nanos;
        let floor = self.config.quality_floor;

        let Some(per_exchange) = self.quotes.get(symbol) else {
            let summary = MarketSummary::no_data(symbol, BTreeMap::new(), now);
            self.summaries.insert(symbol.to_string(), summary.clone());
            return summary;
        };
        let per_exchange = per_exchange.clone();

        let mut views = BTreeMap::new();
        let mut best_bid: Option<Decimal> = None;
        let mut best_ask: Option<Decimal> = None;
        let mut total_volume = Decimal::ZERO;
        let mut weighted_sum = Decimal::ZERO;
        let mut weight_total = Decimal::ZERO;
        let mut included_lasts: Vec<Decimal> = Vec::new();
        let mut fresh_quality_sum = Decimal::ZERO;
        let mut included_quality_sum = Decimal::ZERO;
        let mut fresh_count = 0u32;
        let mut included_count = 0u32;

        for (exchange, quote) in per_exchange {
            let age = now - quote.updated_at;
            let fresh = age < window;
            let quality = self.quality.composite(&exchange, symbol, now);
            let included = fresh && quality >= floor;

            if fresh {
                fresh_count += 1;
                fresh_quality_sum += quality;
                total_volume += quote.volume_24h;
                best_bid = Some(best_bid.map_or(quote.bid, |b| b.max(quote.bid)));
                best_ask = Some(best_ask.map_or(quote.ask, |a| a.min(quote.ask)));
            } else {
                debug!(
                    symbol,
                    exchange = %exchange,
                    age_nanos = age,
                    "Stale quote excluded from summary"
                );
            }
            if included {
                included_count += 1;
                included_quality_sum += quality;
                weighted_sum += quote.last * quote.volume_24h;
                weight_total += quote.volume_24h;
                included_lasts.push(quote.last);
            }

            views.insert(
                exchange.clone(),
                ExchangeQuoteView {
                    quote,
                    age_nanos: age,
                    quality,
                    fresh,
                    included,
                },
            );
        }

        if fresh_count == 0 {
            warn!(symbol, "No fresh exchange data; serving no-data summary");
            let summary = MarketSummary::no_data(symbol, views, now);
            self.summaries.insert(symbol.to_string(), summary.clone());
            return summary;
        }

        let weighted_price = if included_count == 0 {
            None
        } else if weight_total > Decimal::ZERO {
            Some(weighted_sum / weight_total)
        } else {
            // All included exchanges report zero 24h volume; fall back to
            // the unweighted mean so the consensus stays defined.
            Some(included_lasts.iter().copied().sum::<Decimal>() / Decimal::from(included_lasts.len()))
        };

        let spread = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        };
        let spread_percent = match (best_bid, spread) {
            (Some(bid), Some(spread)) if bid > Decimal::ZERO => {
                Some(spread / bid * Decimal::from(100))
            }
            _ => None,
        };

        // Consensus quality follows the exchanges actually weighted; if
        // every fresh exchange fell below the floor, report their mean so
        // the degradation is visible rather than hidden behind a zero.
        let quality = if included_count > 0 {
            included_quality_sum / Decimal::from(included_count)
        } else {
            fresh_quality_sum / Decimal::from(fresh_count)
        };

        let summary = MarketSummary {
            symbol: symbol.to_string(),
            best_bid,
            best_ask,
            weighted_price,
            spread,
            spread_percent,
            total_volume_24h: total_volume,
            exchanges: views,
            quality,
            no_data: false,
            built_at: now,
        };

        debug!(
            symbol,
            fresh = fresh_count,
            included = included_count,
            quality = %summary.quality,
            "Summary rebuilt"
        );

        self.summaries.insert(symbol.to_string(), summary.clone());
        summary
    }

    /// Rebuild every known symbol's summary; used by the cycle timer.
    pub fn rebuild_all(&mut self, now: i64) -> Vec<MarketSummary> {
        let symbols: Vec<String> = self.quotes.keys().cloned().collect();
        symbols
            .iter()
            .map(|symbol| self.rebuild_summary(symbol, now))
            .collect()
    }

    /// Scan the given symbols for cross-exchange arbitrage, sorted by
    /// profit descending.
    pub fn find_arbitrage(&mut self, symbols: &[String], now: i64) -> Vec<ArbitrageOpportunity> {
        let window = self.config.quality.staleness_window_nanos;
        let floor = self.config.quality_floor;

        let mut opportunities = Vec::new();
        for symbol in symbols {
            let Some(per_exchange) = self.quotes.get(symbol) else {
                continue;
            };
            let per_exchange = per_exchange.clone();

            let mut qualities = BTreeMap::new();
            for exchange in per_exchange.keys() {
                qualities.insert(
                    exchange.clone(),
                    self.quality.composite(exchange, symbol, now),
                );
            }

            opportunities.extend(arbitrage::scan_symbol(
                symbol,
                &per_exchange,
                &qualities,
                &self.config.arbitrage,
                window,
                floor,
                now,
            ));
        }

        opportunities.sort_by(|a, b| b.profit_percent.cmp(&a.profit_percent));
        if !opportunities.is_empty() {
            info!(
                count = opportunities.len(),
                top_profit_percent = %opportunities[0].profit_percent,
                "Arbitrage opportunities detected"
            );
        }
        opportunities
    }

    /// Scan every known symbol.
    pub fn find_arbitrage_all(&mut self, now: i64) -> Vec<ArbitrageOpportunity> {
        let symbols: Vec<String> = self.quotes.keys().cloned().collect();
        self.find_arbitrage(&symbols, now)
    }

    /// Merged depth across fresh exchanges, truncated per side.
    pub fn merged_book(&self, symbol: &str, depth: usize, now: i64) -> Option<AggregatedBook> {
        let depth = depth.min(self.config.max_book_depth);
        self.books.merged(
            symbol,
            depth,
            self.config.quality.staleness_window_nanos,
            now,
        )
    }

    /// Quality breakdown for one stream; for read-side diagnostics.
    pub fn quality_score(&mut self, exchange: &str, symbol: &str, now: i64) -> QualityScore {
        self.quality.score(exchange, symbol, now)
    }

    /// All symbols with at least one quote.
    pub fn symbols(&self) -> Vec<String> {
        self.quotes.keys().cloned().collect()
    }
}
