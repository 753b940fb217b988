//! Market Pipeline
//!
//! Consumes raw exchange feed messages and produces:
//! - Normalized tick, quote, and book updates per stream
//! - Cross-exchange consensus pricing with quality weighting
//! - Arbitrage opportunity scanning across venues
//! - Order-flow analytics (footprints, delta, volume profile,
//!   imbalance detection and resolution)
//! - Fan-out over sequenced channels with replay and backpressure
//!
//! # Architecture
//!
//! ```text
//! Raw feed messages (all exchanges)
//!         │
//!    ┌────▼─────┐
//!    │Normalizer│  ← Validates, dedupes, orders per stream
//!    └────┬─────┘
//!         │ hash(symbol) → shard
//!    ┌────┴───────┐
//!    │            │
//! ┌──▼────────┐ ┌─▼─────────┐
//! │Aggregation│ │Order flow │
//! └──┬────────┘ └─┬─────────┘
//!    │            │
//! ┌──▼────────────▼──┐
//! │ Distribution hub │  ← channels, replay, per-client queues
//! └──────────────────┘
//! ```

pub mod aggregation;
pub mod arbitrage;
pub mod backpressure;
pub mod book;
pub mod classify;
pub mod config;
pub mod delta;
pub mod events;
pub mod footprint;
pub mod history;
pub mod hub;
pub mod imbalance;
pub mod metrics;
pub mod normalizer;
pub mod orderflow;
pub mod profile;
pub mod protocol;
pub mod quality;
pub mod service;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
