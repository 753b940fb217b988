//! Hot-path benchmarks: normalization, summary rebuild, order-flow
//! ingest, and hub fan-out.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rust_decimal::Decimal;

use market_pipeline::aggregation::{AggregationConfig, AggregationEngine};
use market_pipeline::events::{EventPayload, PipelineEvent};
use market_pipeline::hub::{DistributionHub, HubConfig};
use market_pipeline::normalizer::{
    FeedNormalizer, NormalizedQuote, RawFeedKind, RawFeedMessage, Side,
};
use market_pipeline::orderflow::{OrderFlowConfig, OrderFlowEngine};
use market_pipeline::protocol::{Channel, SubscriptionFilter};

const T0: i64 = 1708123456789000000;

fn dec(s: &str) -> Decimal {
    Decimal::from_str_exact(s).unwrap()
}

fn raw_trade(sequence: u64) -> RawFeedMessage {
    RawFeedMessage {
        exchange: "binance".to_string(),
        symbol: "BTC/USDT".to_string(),
        kind: RawFeedKind::Trade {
            price: dec("50000.25"),
            size: dec("0.5"),
            side: Some(Side::Buy),
            bid: Some(dec("50000")),
            ask: Some(dec("50000.5")),
        },
        exchange_timestamp: T0 + sequence as i64,
        receive_timestamp: T0 + sequence as i64,
        exchange_sequence: Some(sequence),
    }
}

fn quote(exchange: &str, last: &str) -> NormalizedQuote {
    let last = dec(last);
    NormalizedQuote {
        symbol: "BTC/USDT".to_string(),
        exchange: exchange.to_string(),
        bid: last - dec("0.5"),
        ask: last + dec("0.5"),
        last,
        volume_24h: dec("12000"),
        change_percent_24h: dec("1.2"),
        high_24h: last + dec("100"),
        low_24h: last - dec("100"),
        exchange_timestamp: T0,
        receive_timestamp: T0,
        process_timestamp: T0,
        sequence: 1,
    }
}

fn bench_normalize_trade(c: &mut Criterion) {
    let mut normalizer = FeedNormalizer::new("binance");
    let mut sequence = 0u64;
    c.bench_function("normalize_trade", |b| {
        b.iter(|| {
            sequence += 1;
            let update = normalizer.normalize(black_box(raw_trade(sequence)), T0 + sequence as i64);
            black_box(update).unwrap()
        })
    });
}

fn bench_rebuild_summary_eight_venues(c: &mut Criterion) {
    let mut engine = AggregationEngine::new(AggregationConfig::default());
    for i in 0..8 {
        engine.ingest_quote(quote(&format!("venue{i}"), "50000.5"), T0);
    }
    c.bench_function("rebuild_summary_eight_venues", |b| {
        b.iter(|| black_box(engine.rebuild_summary("BTC/USDT", T0 + 1)))
    });
}

fn bench_orderflow_ingest(c: &mut Criterion) {
    let mut engine = OrderFlowEngine::new(OrderFlowConfig::default());
    let raw = raw_trade(1);
    let mut normalizer = FeedNormalizer::new("binance");
    let tick = match normalizer.normalize(raw, T0) {
        Ok(market_pipeline::normalizer::NormalizedUpdate::Tick(tick)) => tick,
        _ => unreachable!(),
    };
    c.bench_function("orderflow_ingest", |b| {
        b.iter(|| black_box(engine.ingest(black_box(&tick), T0 + 1)))
    });
}

fn bench_hub_publish_hundred_subscribers(c: &mut Criterion) {
    fn subscribed_hub() -> DistributionHub {
        let mut hub = DistributionHub::new(HubConfig::default());
        for i in 0..100 {
            let id = hub.connect(&format!("reader{i}"), T0);
            hub.subscribe(id, Channel::Signals, SubscriptionFilter::default(), T0)
                .unwrap();
        }
        hub
    }
    let event = PipelineEvent::new(
        EventPayload::SignalAlert {
            opportunity: market_pipeline::arbitrage::ArbitrageOpportunity {
                symbol: "BTC/USDT".to_string(),
                buy_exchange: "binance".to_string(),
                buy_price: dec("50000"),
                sell_exchange: "kraken".to_string(),
                sell_price: dec("50150"),
                profit_percent: dec("0.3"),
                detected_at: T0,
            },
        },
        T0,
    );
    c.bench_function("hub_publish_hundred_subscribers", |b| {
        b.iter_batched(
            subscribed_hub,
            |mut hub| black_box(hub.publish(Channel::Signals, event.clone(), T0 + 1)),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_normalize_trade,
    bench_rebuild_summary_eight_venues,
    bench_orderflow_ingest,
    bench_hub_publish_hundred_subscribers,
);
criterion_main!(benches);
