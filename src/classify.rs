//! Aggressor-side classification
//!
//! Assigns the taker side to trades whose feed does not provide it, using
//! the zero-tick rule against the prevailing quote:
//! - price at or above the ask: buyer was the aggressor
//! - price at or below the bid: seller was the aggressor
//! - inside the spread: the previous trade's side carries over
//!
//! Feed-provided sides pass through untouched and refresh the carry-over
//! state. Ticks flagged as delivered out of order are classified but
//! never update the carry-over. With no usable quote and no prior trade
//! the side stays `Unknown`.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::normalizer::{NormalizedTick, Side};

#[derive(Debug, Clone, Default)]
struct SymbolState {
    bid: Option<Decimal>,
    ask: Option<Decimal>,
    last_side: Option<Side>,
}

/// Per-symbol zero-tick classifier.
#[derive(Debug, Default)]
pub struct TradeClassifier {
    state: BTreeMap<String, SymbolState>,
}

impl TradeClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh the prevailing quote used for classification.
    pub fn observe_quote(&mut self, symbol: &str, bid: Decimal, ask: Decimal) {
        let state = self.state.entry(symbol.to_string()).or_default();
        state.bid = Some(bid);
        state.ask = Some(ask);
    }

    /// Classify the tick's aggressor side.
    ///
    /// A quote carried on the tick itself updates the prevailing quote
    /// before the rule is applied.
    pub fn classify(&mut self, tick: &NormalizedTick) -> Side {
        let state = self.state.entry(tick.symbol.clone()).or_default();
        if let Some(bid) = tick.bid_price {
            state.bid = Some(bid);
        }
        if let Some(ask) = tick.ask_price {
            state.ask = Some(ask);
        }

        if tick.side != Side::Unknown {
            if tick.aggressor_reliable {
                state.last_side = Some(tick.side);
            }
            return tick.side;
        }

        let side = match (state.bid, state.ask) {
            // Ask checked first so a crossed quote still classifies
            // deterministically.
            (_, Some(ask)) if tick.price >= ask => Side::Buy,
            (Some(bid), _) if tick.price <= bid => Side::Sell,
            _ => state.last_side.unwrap_or(Side::Unknown),
        };
        // Reordered ticks classify against a quote they may predate, so
        // their side never carries over to the next inside-spread trade.
        if side != Side::Unknown && tick.aggressor_reliable {
            state.last_side = Some(side);
        }
        side
    }

    /// Carry-over side from the most recent classified trade.
    pub fn last_side(&self, symbol: &str) -> Option<Side> {
        self.state.get(symbol).and_then(|s| s.last_side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1708123456789000000;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    fn tick(symbol: &str, price: &str, side: Side) -> NormalizedTick {
        NormalizedTick {
            symbol: symbol.to_string(),
            exchange: "binance".to_string(),
            price: dec(price),
            size: dec("1"),
            side,
            bid_price: None,
            ask_price: None,
            exchange_timestamp: T0,
            receive_timestamp: T0,
            process_timestamp: T0,
            sequence: 1,
            aggressor_reliable: true,
        }
    }

    #[test]
    fn test_trade_at_ask_is_buy() {
        let mut classifier = TradeClassifier::new();
        classifier.observe_quote("BTC/USDT", dec("99.95"), dec("100.00"));

        let side = classifier.classify(&tick("BTC/USDT", "100.00", Side::Unknown));
        assert_eq!(side, Side::Buy);
    }

    #[test]
    fn test_trade_above_ask_is_buy() {
        let mut classifier = TradeClassifier::new();
        classifier.observe_quote("BTC/USDT", dec("99.95"), dec("100.00"));

        let side = classifier.classify(&tick("BTC/USDT", "100.10", Side::Unknown));
        assert_eq!(side, Side::Buy);
    }

    #[test]
    fn test_trade_at_bid_is_sell() {
        let mut classifier = TradeClassifier::new();
        classifier.observe_quote("BTC/USDT", dec("99.95"), dec("100.00"));

        let side = classifier.classify(&tick("BTC/USDT", "99.95", Side::Unknown));
        assert_eq!(side, Side::Sell);
    }

    #[test]
    fn test_inside_spread_carries_previous_side() {
        let mut classifier = TradeClassifier::new();
        classifier.observe_quote("BTC/USDT", dec("99.90"), dec("100.00"));

        assert_eq!(
            classifier.classify(&tick("BTC/USDT", "100.00", Side::Unknown)),
            Side::Buy
        );
        // 99.95 is strictly inside the spread.
        assert_eq!(
            classifier.classify(&tick("BTC/USDT", "99.95", Side::Unknown)),
            Side::Buy
        );
    }

    #[test]
    fn test_no_quote_no_history_is_unknown() {
        let mut classifier = TradeClassifier::new();
        let side = classifier.classify(&tick("BTC/USDT", "100.00", Side::Unknown));
        assert_eq!(side, Side::Unknown);
        assert_eq!(classifier.last_side("BTC/USDT"), None);
    }

    #[test]
    fn test_feed_side_passes_through_and_carries() {
        let mut classifier = TradeClassifier::new();
        assert_eq!(
            classifier.classify(&tick("BTC/USDT", "100.00", Side::Sell)),
            Side::Sell
        );
        // The next inside-spread trade inherits the feed-provided side.
        classifier.observe_quote("BTC/USDT", dec("99.90"), dec("100.10"));
        assert_eq!(
            classifier.classify(&tick("BTC/USDT", "100.00", Side::Unknown)),
            Side::Sell
        );
    }

    #[test]
    fn test_tick_carried_quote_updates_state() {
        let mut classifier = TradeClassifier::new();
        let mut t = tick("BTC/USDT", "100.00", Side::Unknown);
        t.bid_price = Some(dec("99.90"));
        t.ask_price = Some(dec("100.00"));

        assert_eq!(classifier.classify(&t), Side::Buy);
    }

    #[test]
    fn test_crossed_quote_prefers_ask_rule() {
        let mut classifier = TradeClassifier::new();
        // Crossed: bid above ask; a price at both thresholds reads as a buy.
        classifier.observe_quote("BTC/USDT", dec("100.20"), dec("100.00"));

        let side = classifier.classify(&tick("BTC/USDT", "100.10", Side::Unknown));
        assert_eq!(side, Side::Buy);
    }

    #[test]
    fn test_unreliable_tick_does_not_carry_over() {
        let mut classifier = TradeClassifier::new();
        classifier.observe_quote("BTC/USDT", dec("99.90"), dec("100.00"));

        let mut reordered = tick("BTC/USDT", "100.00", Side::Unknown);
        reordered.aggressor_reliable = false;
        // Classified for its own aggregation, but leaves no history.
        assert_eq!(classifier.classify(&reordered), Side::Buy);
        assert_eq!(classifier.last_side("BTC/USDT"), None);

        // The next inside-spread trade has nothing to inherit.
        assert_eq!(
            classifier.classify(&tick("BTC/USDT", "99.95", Side::Unknown)),
            Side::Unknown
        );
    }

    #[test]
    fn test_symbols_are_independent() {
        let mut classifier = TradeClassifier::new();
        classifier.observe_quote("BTC/USDT", dec("99.95"), dec("100.00"));

        assert_eq!(
            classifier.classify(&tick("BTC/USDT", "100.00", Side::Unknown)),
            Side::Buy
        );
        // ETH has no quote and no history.
        assert_eq!(
            classifier.classify(&tick("ETH/USDT", "100.00", Side::Unknown)),
            Side::Unknown
        );
    }
}
