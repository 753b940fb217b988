//! Feed normalization layer
//!
//! Converts exchange-specific trade/quote/order-book messages into the
//! canonical internal representation consumed by the aggregation and
//! order-flow engines:
//! - `NormalizedTick` for executed trades
//! - `NormalizedQuote` for top-of-book / 24h ticker updates
//! - `NormalizedBook` for depth snapshots
//!
//! One `FeedNormalizer` per feed source. It assigns a monotonic sequence
//! number per (exchange, symbol) stream, stamps the processing time, and
//! flags out-of-order deliveries instead of rejecting them: reordered
//! ticks still carry volume, they are just unreliable for aggressor
//! classification. Structurally invalid messages (non-positive price or
//! size, missing identifiers) are rejected and counted; rejections feed
//! the per-exchange data-quality error rate.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
    /// Side not determinable from the feed; resolved downstream.
    Unknown,
}

impl Side {
    /// String label for log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
            Side::Unknown => "UNKNOWN",
        }
    }
}

/// A single executed trade in canonical form.
///
/// Immutable once created. `process_timestamp - receive_timestamp` is the
/// measured internal pipeline latency for this message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTick {
    pub symbol: String,
    pub exchange: String,
    pub price: Decimal,
    pub size: Decimal,
    /// Aggressor side as reported by the feed (often Unknown).
    pub side: Side,
    /// Best bid prevailing at trade time, when the feed provides it.
    pub bid_price: Option<Decimal>,
    /// Best ask prevailing at trade time, when the feed provides it.
    pub ask_price: Option<Decimal>,
    /// Exchange clock, Unix nanoseconds.
    pub exchange_timestamp: i64,
    /// Local receive time, Unix nanoseconds.
    pub receive_timestamp: i64,
    /// Normalization time, Unix nanoseconds.
    pub process_timestamp: i64,
    /// Monotonic per (exchange, symbol) stream, assigned here.
    pub sequence: u64,
    /// False when the feed delivered this tick out of order; such ticks
    /// still aggregate but must not drive aggressor inference.
    pub aggressor_reliable: bool,
}

impl NormalizedTick {
    /// Internal latency in nanoseconds (receive → normalized).
    pub fn internal_latency_nanos(&self) -> i64 {
        self.process_timestamp - self.receive_timestamp
    }
}

/// Latest top-of-book and 24h ticker state for one (exchange, symbol).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedQuote {
    pub symbol: String,
    pub exchange: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume_24h: Decimal,
    pub change_percent_24h: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub exchange_timestamp: i64,
    pub receive_timestamp: i64,
    pub process_timestamp: i64,
    pub sequence: u64,
}

/// One side level of a depth snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Depth snapshot for one (exchange, symbol), sorted best-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedBook {
    pub symbol: String,
    pub exchange: String,
    /// Bids in descending price order.
    pub bids: Vec<BookLevel>,
    /// Asks in ascending price order.
    pub asks: Vec<BookLevel>,
    pub exchange_timestamp: i64,
    pub receive_timestamp: i64,
    pub process_timestamp: i64,
    pub sequence: u64,
}

/// A raw message handed in by an exchange connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFeedMessage {
    pub exchange: String,
    pub symbol: String,
    pub kind: RawFeedKind,
    /// Exchange clock, Unix nanoseconds.
    pub exchange_timestamp: i64,
    /// Local receive time, Unix nanoseconds.
    pub receive_timestamp: i64,
    /// Exchange-assigned sequence, when the feed carries one. Used only
    /// for out-of-order detection.
    pub exchange_sequence: Option<u64>,
}

/// Payload variants a connector can deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RawFeedKind {
    Trade {
        price: Decimal,
        size: Decimal,
        side: Option<Side>,
        bid: Option<Decimal>,
        ask: Option<Decimal>,
    },
    Quote {
        bid: Decimal,
        ask: Decimal,
        last: Decimal,
        volume_24h: Decimal,
        change_percent_24h: Decimal,
        high_24h: Decimal,
        low_24h: Decimal,
    },
    Book {
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
    },
}

/// Canonical output of normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizedUpdate {
    Tick(NormalizedTick),
    Quote(NormalizedQuote),
    Book(NormalizedBook),
}

impl NormalizedUpdate {
    pub fn symbol(&self) -> &str {
        match self {
            NormalizedUpdate::Tick(t) => &t.symbol,
            NormalizedUpdate::Quote(q) => &q.symbol,
            NormalizedUpdate::Book(b) => &b.symbol,
        }
    }

    pub fn exchange(&self) -> &str {
        match self {
            NormalizedUpdate::Tick(t) => &t.exchange,
            NormalizedUpdate::Quote(q) => &q.exchange,
            NormalizedUpdate::Book(b) => &b.exchange,
        }
    }

    /// Update kind as a string label for logging.
    pub fn kind_label(&self) -> &'static str {
        match self {
            NormalizedUpdate::Tick(_) => "Tick",
            NormalizedUpdate::Quote(_) => "Quote",
            NormalizedUpdate::Book(_) => "Book",
        }
    }
}

/// Reasons a raw feed message is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("non-positive price in {field}: {value}")]
    NonPositivePrice { field: &'static str, value: Decimal },

    #[error("non-positive size in {field}: {value}")]
    NonPositiveSize { field: &'static str, value: Decimal },

    #[error("missing symbol on message from {exchange}")]
    MissingSymbol { exchange: String },

    #[error("missing exchange on message for {symbol}")]
    MissingExchange { symbol: String },

    #[error("book update with no levels for {exchange}:{symbol}")]
    EmptyBook { exchange: String, symbol: String },
}

/// Per (exchange, symbol) stream state.
#[derive(Debug, Clone, Default)]
struct StreamState {
    /// Next sequence to assign (starts at 1).
    next_sequence: u64,
    /// Highest exchange sequence observed so far.
    last_exchange_sequence: Option<u64>,
}

/// Normalizes one feed source's messages into canonical updates.
pub struct FeedNormalizer {
    /// Connector name, carried only for logging.
    source: String,
    streams: BTreeMap<(String, String), StreamState>,
    accepted: u64,
    rejected: u64,
    out_of_order: u64,
}

impl FeedNormalizer {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            streams: BTreeMap::new(),
            accepted: 0,
            rejected: 0,
            out_of_order: 0,
        }
    }

    /// Normalize a raw message, stamping `now` (Unix nanos) as the
    /// processing time.
    ///
    /// Out-of-order deliveries are accepted with `aggressor_reliable`
    /// cleared; structural defects are rejected.
    pub fn normalize(
        &mut self,
        raw: RawFeedMessage,
        now: i64,
    ) -> Result<NormalizedUpdate, NormalizeError> {
        match self.validate(&raw) {
            Ok(()) => {}
            Err(err) => {
                self.rejected += 1;
                warn!(
                    source = %self.source,
                    exchange = %raw.exchange,
                    symbol = %raw.symbol,
                    error = %err,
                    "Rejecting feed message"
                );
                return Err(err);
            }
        }

        let in_order = self.observe_exchange_sequence(&raw);
        if !in_order {
            self.out_of_order += 1;
        }

        let stream = self
            .streams
            .entry((raw.exchange.clone(), raw.symbol.clone()))
            .or_default();
        stream.next_sequence += 1;
        let sequence = stream.next_sequence;

        self.accepted += 1;

        let update = match raw.kind {
            RawFeedKind::Trade {
                price,
                size,
                side,
                bid,
                ask,
            } => NormalizedUpdate::Tick(NormalizedTick {
                symbol: raw.symbol,
                exchange: raw.exchange,
                price,
                size,
                side: side.unwrap_or(Side::Unknown),
                bid_price: bid,
                ask_price: ask,
                exchange_timestamp: raw.exchange_timestamp,
                receive_timestamp: raw.receive_timestamp,
                process_timestamp: now,
                sequence,
                aggressor_reliable: in_order,
            }),
            RawFeedKind::Quote {
                bid,
                ask,
                last,
                volume_24h,
                change_percent_24h,
                high_24h,
                low_24h,
            } => NormalizedUpdate::Quote(NormalizedQuote {
                symbol: raw.symbol,
                exchange: raw.exchange,
                bid,
                ask,
                last,
                volume_24h,
                change_percent_24h,
                high_24h,
                low_24h,
                exchange_timestamp: raw.exchange_timestamp,
                receive_timestamp: raw.receive_timestamp,
                process_timestamp: now,
                sequence,
            }),
            RawFeedKind::Book { mut bids, mut asks } => {
                // Feeds disagree on level order; canonical form is best-first.
                bids.sort_by(|a, b| b.price.cmp(&a.price));
                asks.sort_by(|a, b| a.price.cmp(&b.price));
                NormalizedUpdate::Book(NormalizedBook {
                    symbol: raw.symbol,
                    exchange: raw.exchange,
                    bids,
                    asks,
                    exchange_timestamp: raw.exchange_timestamp,
                    receive_timestamp: raw.receive_timestamp,
                    process_timestamp: now,
                    sequence,
                })
            }
        };

        debug!(
            source = %self.source,
            exchange = update.exchange(),
            symbol = update.symbol(),
            kind = update.kind_label(),
            sequence,
            "Feed message normalized"
        );

        Ok(update)
    }

    /// Total messages accepted since creation.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Total messages rejected since creation.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Total out-of-order deliveries observed since creation.
    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    /// Connector name this normalizer serves.
    pub fn source(&self) -> &str {
        &self.source
    }

    fn validate(&self, raw: &RawFeedMessage) -> Result<(), NormalizeError> {
        if raw.exchange.is_empty() {
            return Err(NormalizeError::MissingExchange {
                symbol: raw.symbol.clone(),
            });
        }
        if raw.symbol.is_empty() {
            return Err(NormalizeError::MissingSymbol {
                exchange: raw.exchange.clone(),
            });
        }

        match &raw.kind {
            RawFeedKind::Trade { price, size, .. } => {
                if *price <= Decimal::ZERO {
                    return Err(NormalizeError::NonPositivePrice {
                        field: "trade.price",
                        value: *price,
                    });
                }
                if *size <= Decimal::ZERO {
                    return Err(NormalizeError::NonPositiveSize {
                        field: "trade.size",
                        value: *size,
                    });
                }
            }
            RawFeedKind::Quote { bid, ask, last, volume_24h, .. } => {
                for (field, value) in
                    [("quote.bid", bid), ("quote.ask", ask), ("quote.last", last)]
                {
                    if *value <= Decimal::ZERO {
                        return Err(NormalizeError::NonPositivePrice {
                            field,
                            value: *value,
                        });
                    }
                }
                if *volume_24h < Decimal::ZERO {
                    return Err(NormalizeError::NonPositiveSize {
                        field: "quote.volume_24h",
                        value: *volume_24h,
                    });
                }
            }
            RawFeedKind::Book { bids, asks } => {
                if bids.is_empty() && asks.is_empty() {
                    return Err(NormalizeError::EmptyBook {
                        exchange: raw.exchange.clone(),
                        symbol: raw.symbol.clone(),
                    });
                }
                for level in bids.iter().chain(asks.iter()) {
                    if level.price <= Decimal::ZERO {
                        return Err(NormalizeError::NonPositivePrice {
                            field: "book.level.price",
                            value: level.price,
                        });
                    }
                    if level.size <= Decimal::ZERO {
                        return Err(NormalizeError::NonPositiveSize {
                            field: "book.level.size",
                            value: level.size,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Track the exchange-assigned sequence for the stream. Returns false
    /// when the message arrived out of order.
    fn observe_exchange_sequence(&mut self, raw: &RawFeedMessage) -> bool {
        let Some(seq) = raw.exchange_sequence else {
            return true;
        };

        let stream = self
            .streams
            .entry((raw.exchange.clone(), raw.symbol.clone()))
            .or_default();

        match stream.last_exchange_sequence {
            Some(last) if seq <= last => {
                debug!(
                    source = %self.source,
                    exchange = %raw.exchange,
                    symbol = %raw.symbol,
                    last_sequence = last,
                    received_sequence = seq,
                    "Out-of-order feed delivery"
                );
                false
            }
            _ => {
                stream.last_exchange_sequence = Some(seq);
                true
            }
        }
    }
}
