//! Cross-exchange arbitrage detection
//!
//! Scans the quote table for ordered exchange pairs where buying at one
//! venue's ask and selling at another's bid clears a configured profit
//! threshold. Gross percentages only; fees, transfer latency, and
//! executable size are deliberately not modeled, so results are an
//! attention signal rather than an executable trade.
//!
//! Both legs must be fresh and above the quality floor. Each scan
//! produces a fresh list; opportunities are never carried over from a
//! previous scan.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregation::ExchangeQuote;

/// Configuration for the arbitrage scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrageConfig {
    /// Gross profit, in percent, a pair must exceed to be reported
    /// (default: 0.5).
    pub min_profit_percent: Decimal,
    /// Run the scan every N aggregation cycles (default: 2).
    pub scan_every_cycles: u32,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            min_profit_percent: Decimal::new(5, 1),
            scan_every_cycles: 2,
        }
    }
}

/// One profitable buy/sell pairing at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub symbol: String,
    /// Venue to buy from, at its ask.
    pub buy_exchange: String,
    pub buy_price: Decimal,
    /// Venue to sell on, at its bid.
    pub sell_exchange: String,
    pub sell_price: Decimal,
    /// Gross profit percent relative to the buy price.
    pub profit_percent: Decimal,
    pub detected_at: i64,
}

/// Scan one symbol's quotes for profitable ordered pairs, sorted by
/// profit descending.
///
/// `qualities` carries the composite score per exchange, computed by the
/// caller at `now`. Legs aged `staleness_window_nanos` or more, or
/// scoring below `quality_floor`, never participate.
#[allow(clippy::too_many_arguments)]
pub fn scan_symbol(
    symbol: &str,
    quotes: &BTreeMap<String, ExchangeQuote>,
    qualities: &BTreeMap<String, Decimal>,
    config: &ArbitrageConfig,
    staleness_window_nanos: i64,
    quality_floor: Decimal,
    now: i64,
) -> Vec<ArbitrageOpportunity> {
    let eligible: Vec<&ExchangeQuote> = quotes
        .values()
        .filter(|quote| {
            let fresh = now - quote.updated_at < staleness_window_nanos;
            let quality = qualities
                .get(&quote.exchange)
                .copied()
                .unwrap_or(Decimal::ZERO);
            fresh && quality >= quality_floor
        })
        .collect();

    let hundred = Decimal::from(100);
    let mut opportunities = Vec::new();
    for buy in &eligible {
        if buy.ask <= Decimal::ZERO {
            continue;
        }
        for sell in &eligible {
            if buy.exchange == sell.exchange {
                continue;
            }
            let profit_percent = (sell.bid - buy.ask) / buy.ask * hundred;
            if profit_percent <= config.min_profit_percent {
                continue;
            }
            debug!(
                symbol,
                buy_exchange = %buy.exchange,
                sell_exchange = %sell.exchange,
                profit_percent = %profit_percent,
                "Arbitrage pair above threshold"
            );
            opportunities.push(ArbitrageOpportunity {
                symbol: symbol.to_string(),
                buy_exchange: buy.exchange.clone(),
                buy_price: buy.ask,
                sell_exchange: sell.exchange.clone(),
                sell_price: sell.bid,
                profit_percent,
                detected_at: now,
            });
        }
    }

    opportunities.sort_by(|a, b| b.profit_percent.cmp(&a.profit_percent));
    opportunities
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1708123456789000000;
    const WINDOW: i64 = 30 * 1_000_000_000;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    fn quote(exchange: &str, bid: &str, ask: &str, updated_at: i64) -> ExchangeQuote {
        ExchangeQuote {
            exchange: exchange.to_string(),
            bid: dec(bid),
            ask: dec(ask),
            last: dec(bid),
            volume_24h: dec("100"),
            change_percent_24h: Decimal::ZERO,
            high_24h: dec(ask),
            low_24h: dec(bid),
            updated_at,
        }
    }

    fn table(quotes: Vec<ExchangeQuote>) -> BTreeMap<String, ExchangeQuote> {
        quotes
            .into_iter()
            .map(|q| (q.exchange.clone(), q))
            .collect()
    }

    fn full_quality(quotes: &BTreeMap<String, ExchangeQuote>) -> BTreeMap<String, Decimal> {
        quotes.keys().map(|e| (e.clone(), Decimal::ONE)).collect()
    }

    fn config(min_profit: &str) -> ArbitrageConfig {
        ArbitrageConfig {
            min_profit_percent: dec(min_profit),
            scan_every_cycles: 2,
        }
    }

    #[test]
    fn test_detects_profitable_pair() {
        // Buy on a at 100.10, sell on b at 100.30 → ~0.1998% gross.
        let quotes = table(vec![
            quote("a", "100.00", "100.10", T0),
            quote("b", "100.30", "100.40", T0),
        ]);
        let qualities = full_quality(&quotes);

        let found = scan_symbol(
            "BTC/USDT",
            &quotes,
            &qualities,
            &config("0.1"),
            WINDOW,
            dec("0.3"),
            T0,
        );

        assert_eq!(found.len(), 1);
        let opp = &found[0];
        assert_eq!(opp.buy_exchange, "a");
        assert_eq!(opp.buy_price, dec("100.10"));
        assert_eq!(opp.sell_exchange, "b");
        assert_eq!(opp.sell_price, dec("100.30"));
        assert!(opp.profit_percent > dec("0.199") && opp.profit_percent < dec("0.2"));
    }

    #[test]
    fn test_reverse_direction_not_reported() {
        let quotes = table(vec![
            quote("a", "100.00", "100.10", T0),
            quote("b", "100.30", "100.40", T0),
        ]);
        let qualities = full_quality(&quotes);

        let found = scan_symbol(
            "BTC/USDT",
            &quotes,
            &qualities,
            &config("0.1"),
            WINDOW,
            dec("0.3"),
            T0,
        );

        // Buying on b at 100.40 and selling on a at 100.00 loses money.
        assert!(found.iter().all(|o| o.buy_exchange == "a"));
    }

    #[test]
    fn test_below_threshold_dropped() {
        let quotes = table(vec![
            quote("a", "100.00", "100.10", T0),
            quote("b", "100.30", "100.40", T0),
        ]);
        let qualities = full_quality(&quotes);

        let found = scan_symbol(
            "BTC/USDT",
            &quotes,
            &qualities,
            &config("0.5"),
            WINDOW,
            dec("0.3"),
            T0,
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_profit_exactly_at_threshold_not_reported() {
        // Buy at 100.00, sell at 100.10 → exactly 0.1% gross; the
        // threshold must be strictly exceeded.
        let quotes = table(vec![
            quote("a", "99.90", "100.00", T0),
            quote("b", "100.10", "100.20", T0),
        ]);
        let qualities = full_quality(&quotes);

        let found = scan_symbol(
            "BTC/USDT",
            &quotes,
            &qualities,
            &config("0.1"),
            WINDOW,
            dec("0.3"),
            T0,
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_stale_leg_excluded() {
        let quotes = table(vec![
            quote("a", "100.00", "100.10", T0 - 2 * WINDOW),
            quote("b", "100.30", "100.40", T0),
        ]);
        let qualities = full_quality(&quotes);

        let found = scan_symbol(
            "BTC/USDT",
            &quotes,
            &qualities,
            &config("0.1"),
            WINDOW,
            dec("0.3"),
            T0,
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_leg_aged_exactly_one_window_excluded() {
        let quotes = table(vec![
            quote("a", "100.00", "100.10", T0 - WINDOW),
            quote("b", "100.30", "100.40", T0),
        ]);
        let qualities = full_quality(&quotes);

        let found = scan_symbol(
            "BTC/USDT",
            &quotes,
            &qualities,
            &config("0.1"),
            WINDOW,
            dec("0.3"),
            T0,
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_low_quality_leg_excluded() {
        let quotes = table(vec![
            quote("a", "100.00", "100.10", T0),
            quote("b", "100.30", "100.40", T0),
        ]);
        let mut qualities = full_quality(&quotes);
        qualities.insert("b".to_string(), dec("0.1"));

        let found = scan_symbol(
            "BTC/USDT",
            &quotes,
            &qualities,
            &config("0.1"),
            WINDOW,
            dec("0.3"),
            T0,
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_sorted_by_profit_descending() {
        let quotes = table(vec![
            quote("a", "100.00", "100.00", T0),
            quote("b", "101.00", "101.00", T0),
            quote("c", "103.00", "103.00", T0),
        ]);
        let qualities = full_quality(&quotes);

        let found = scan_symbol(
            "BTC/USDT",
            &quotes,
            &qualities,
            &config("0.5"),
            WINDOW,
            dec("0.3"),
            T0,
        );

        assert!(found.len() >= 2);
        for pair in found.windows(2) {
            assert!(pair[0].profit_percent >= pair[1].profit_percent);
        }
        // Best pairing buys the cheapest ask and sells the richest bid.
        assert_eq!(found[0].buy_exchange, "a");
        assert_eq!(found[0].sell_exchange, "c");
        assert_eq!(found[0].profit_percent, dec("3"));
    }

    #[test]
    fn test_zero_ask_never_divides() {
        let quotes = table(vec![
            quote("a", "0", "0", T0),
            quote("b", "100.30", "100.40", T0),
        ]);
        let qualities = full_quality(&quotes);

        let found = scan_symbol(
            "BTC/USDT",
            &quotes,
            &qualities,
            &config("0.1"),
            WINDOW,
            dec("0.3"),
            T0,
        );
        // The zero-ask venue cannot be a buy leg; selling there at bid 0
        // is never profitable either.
        assert!(found.iter().all(|o| o.buy_exchange != "a"));
    }

    #[test]
    fn test_single_exchange_no_pairs() {
        let quotes = table(vec![quote("a", "100.00", "100.10", T0)]);
        let qualities = full_quality(&quotes);

        let found = scan_symbol(
            "BTC/USDT",
            &quotes,
            &qualities,
            &config("0.1"),
            WINDOW,
            dec("0.3"),
            T0,
        );
        assert!(found.is_empty());
    }
}
