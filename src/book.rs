//! Cross-exchange order book merging
//!
//! Stores the latest depth snapshot per (exchange, symbol) and builds a
//! merged view across exchanges on demand: levels at the same price are
//! combined by summing size, bids descend, asks ascend, depth truncated.
//! Stale books (aged the staleness window or more) are left out of the
//! merge but kept in the table so a recovering feed resumes in place.
//!
//! Uses `BTreeMap` keyed by price for deterministic, sorted iteration.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::normalizer::{BookLevel, NormalizedBook};

/// One price level of the merged book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedLevel {
    pub price: Decimal,
    /// Combined size across contributing exchanges.
    pub size: Decimal,
    /// Number of exchanges quoting this exact price.
    pub sources: u32,
}

/// Merged depth snapshot across all fresh exchanges for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedBook {
    pub symbol: String,
    /// Bids in descending price order (best first).
    pub bids: Vec<MergedLevel>,
    /// Asks in ascending price order (best first).
    pub asks: Vec<MergedLevel>,
    /// Exchanges whose books contributed to this snapshot.
    pub exchanges: Vec<String>,
    pub built_at: i64,
}

impl AggregatedBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }
}

/// Latest stored depth for one (exchange, symbol).
#[derive(Debug, Clone)]
struct StoredBook {
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    updated_at: i64,
}

/// Per-symbol table of exchange depth snapshots.
#[derive(Debug, Default)]
pub struct BookTable {
    /// symbol → exchange → latest book.
    books: BTreeMap<String, BTreeMap<String, StoredBook>>,
}

impl BookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored book for the update's (exchange, symbol).
    pub fn ingest(&mut self, book: NormalizedBook) {
        self.books.entry(book.symbol).or_default().insert(
            book.exchange,
            StoredBook {
                bids: book.bids,
                asks: book.asks,
                updated_at: book.process_timestamp,
            },
        );
    }

    /// Build the merged book for a symbol, at most `depth` levels per side.
    ///
    /// Returns `None` only when no exchange has a fresh book for the
    /// symbol.
    pub fn merged(
        &self,
        symbol: &str,
        depth: usize,
        staleness_window_nanos: i64,
        now: i64,
    ) -> Option<AggregatedBook> {
        let per_exchange = self.books.get(symbol)?;

        let mut bid_levels: BTreeMap<Decimal, (Decimal, u32)> = BTreeMap::new();
        let mut ask_levels: BTreeMap<Decimal, (Decimal, u32)> = BTreeMap::new();
        let mut exchanges = Vec::new();

        for (exchange, stored) in per_exchange {
            if now - stored.updated_at >= staleness_window_nanos {
                continue;
            }
            exchanges.push(exchange.clone());
            for level in &stored.bids {
                let entry = bid_levels.entry(level.price).or_insert((Decimal::ZERO, 0));
                entry.0 += level.size;
                entry.1 += 1;
            }
            for level in &stored.asks {
                let entry = ask_levels.entry(level.price).or_insert((Decimal::ZERO, 0));
                entry.0 += level.size;
                entry.1 += 1;
            }
        }

        if exchanges.is_empty() {
            return None;
        }

        let bids: Vec<MergedLevel> = bid_levels
            .iter()
            .rev()
            .take(depth)
            .map(|(price, (size, sources))| MergedLevel {
                price: *price,
                size: *size,
                sources: *sources,
            })
            .collect();

        let asks: Vec<MergedLevel> = ask_levels
            .iter()
            .take(depth)
            .map(|(price, (size, sources))| MergedLevel {
                price: *price,
                size: *size,
                sources: *sources,
            })
            .collect();

        Some(AggregatedBook {
            symbol: symbol.to_string(),
            bids,
            asks,
            exchanges,
            built_at: now,
        })
    }

    /// Number of (exchange, symbol) books stored.
    pub fn book_count(&self) -> usize {
        self.books.values().map(|m| m.len()).sum()
    }
}
