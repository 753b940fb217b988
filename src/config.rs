//! Pipeline configuration
//!
//! `PipelineConfig` gathers the per-stage configs and checks them once
//! at startup. Validation is fatal: a pipeline with a zero tick size or
//! an inverted heartbeat never starts, instead of misbehaving later.
//! Past startup, configs are read-only.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregation::AggregationConfig;
use crate::footprint::WindowPolicy;
use crate::hub::HubConfig;
use crate::orderflow::OrderFlowConfig;

/// Worker and queue topology of the assembled service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Symbol shards, each owning its aggregation and order-flow state
    /// (default: 4).
    pub shards: usize,
    /// Bounded input queue per shard worker (default: 1024).
    pub shard_queue_capacity: usize,
    /// Bounded command queue of the hub actor (default: 1024).
    pub hub_queue_capacity: usize,
    /// Aggregation cycle cadence (default: 1s).
    pub cycle_interval_nanos: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            shard_queue_capacity: 1024,
            hub_queue_capacity: 1024,
            cycle_interval_nanos: 1_000_000_000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be positive")]
    ZeroSize { field: &'static str },
    #[error("{field} must be a positive duration, got {nanos}ns")]
    NonPositiveDuration { field: &'static str, nanos: i64 },
    #[error("{field} must be positive, got {value}")]
    NonPositiveDecimal { field: &'static str, value: Decimal },
    #[error("{field} must not be negative, got {value}")]
    NegativeDecimal { field: &'static str, value: Decimal },
    #[error("tick size override for {symbol} must be positive, got {value}")]
    NonPositiveTickOverride { symbol: String, value: Decimal },
    #[error("imbalance ratio must exceed 1, got {value}")]
    RatioTooLow { value: Decimal },
    #[error("value area percent must be in (0, 100], got {value}")]
    ValueAreaOutOfRange { value: Decimal },
    #[error("quality floor must be within [0, 1], got {value}")]
    QualityFloorOutOfRange { value: Decimal },
    #[error("quality weights must not all be zero")]
    ZeroQualityWeights,
    #[error("heartbeat timeout {timeout_nanos}ns must exceed the interval {interval_nanos}ns")]
    HeartbeatTimeoutTooShort { timeout_nanos: i64, interval_nanos: i64 },
}

/// Everything the assembled pipeline is configured by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub aggregation: AggregationConfig,
    pub orderflow: OrderFlowConfig,
    pub hub: HubConfig,
    pub service: ServiceConfig,
}

impl PipelineConfig {
    /// Check every tunable once; the first violation aborts startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_aggregation()?;
        self.validate_orderflow()?;
        self.validate_hub()?;
        self.validate_service()
    }

    fn validate_aggregation(&self) -> Result<(), ConfigError> {
        let agg = &self.aggregation;
        positive_duration("summary_max_age_nanos", agg.summary_max_age_nanos)?;
        if agg.quality_floor < Decimal::ZERO || agg.quality_floor > Decimal::ONE {
            return Err(ConfigError::QualityFloorOutOfRange {
                value: agg.quality_floor,
            });
        }
        positive_size("max_book_depth", agg.max_book_depth)?;

        positive_duration(
            "expected_update_interval_nanos",
            agg.quality.expected_update_interval_nanos,
        )?;
        positive_duration("staleness_window_nanos", agg.quality.staleness_window_nanos)?;
        let weights = &agg.quality.weights;
        non_negative("quality_weights.availability", weights.availability)?;
        non_negative("quality_weights.staleness", weights.staleness)?;
        non_negative("quality_weights.error_rate", weights.error_rate)?;
        if weights.availability + weights.staleness + weights.error_rate == Decimal::ZERO {
            return Err(ConfigError::ZeroQualityWeights);
        }

        non_negative("min_profit_percent", agg.arbitrage.min_profit_percent)?;
        positive_size("scan_every_cycles", agg.arbitrage.scan_every_cycles as usize)
    }

    fn validate_orderflow(&self) -> Result<(), ConfigError> {
        let flow = &self.orderflow;
        positive_decimal("price_tick_size", flow.price_tick_size)?;
        for (symbol, tick_size) in &flow.tick_size_overrides {
            if *tick_size <= Decimal::ZERO {
                return Err(ConfigError::NonPositiveTickOverride {
                    symbol: symbol.clone(),
                    value: *tick_size,
                });
            }
        }

        match flow.window_policy {
            WindowPolicy::Time { duration_nanos } => {
                positive_duration("window duration_nanos", duration_nanos)?;
            }
            WindowPolicy::Volume { target } => {
                positive_decimal("window volume target", target)?;
            }
            WindowPolicy::TickCount { count } => {
                positive_size("window tick count", count as usize)?;
            }
        }

        if flow.value_area_percent <= Decimal::ZERO
            || flow.value_area_percent > Decimal::ONE_HUNDRED
        {
            return Err(ConfigError::ValueAreaOutOfRange {
                value: flow.value_area_percent,
            });
        }
        positive_size("profile_history_len", flow.profile_history_len)?;

        positive_size("delta_smoothing_period", flow.delta.smoothing_period)?;
        non_negative("divergence_min_delta", flow.delta.divergence_min_delta)?;
        non_negative("exhaustion_min_strength", flow.delta.exhaustion_min_strength)?;
        non_negative("exhaustion_deceleration", flow.delta.exhaustion_deceleration)?;

        if flow.imbalance.ratio <= Decimal::ONE {
            return Err(ConfigError::RatioTooLow {
                value: flow.imbalance.ratio,
            });
        }
        positive_decimal("imbalance_volume_floor", flow.imbalance.volume_floor)?;
        positive_decimal(
            "resolution_move_percent",
            flow.imbalance.resolution_move_percent,
        )
    }

    fn validate_hub(&self) -> Result<(), ConfigError> {
        let hub = &self.hub;
        positive_size("hub queue_capacity", hub.queue_capacity)?;
        positive_size("history_len", hub.history_len)?;
        positive_size("max_subscriptions_per_client", hub.max_subscriptions_per_client)?;
        positive_duration("heartbeat_interval_nanos", hub.heartbeat_interval_nanos)?;
        positive_duration("heartbeat_timeout_nanos", hub.heartbeat_timeout_nanos)?;
        if hub.heartbeat_timeout_nanos <= hub.heartbeat_interval_nanos {
            return Err(ConfigError::HeartbeatTimeoutTooShort {
                timeout_nanos: hub.heartbeat_timeout_nanos,
                interval_nanos: hub.heartbeat_interval_nanos,
            });
        }
        Ok(())
    }

    fn validate_service(&self) -> Result<(), ConfigError> {
        let service = &self.service;
        positive_size("shards", service.shards)?;
        positive_size("shard_queue_capacity", service.shard_queue_capacity)?;
        positive_size("hub_queue_capacity", service.hub_queue_capacity)?;
        positive_duration("cycle_interval_nanos", service.cycle_interval_nanos)
    }
}

fn positive_size(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroSize { field });
    }
    Ok(())
}

fn positive_duration(field: &'static str, nanos: i64) -> Result<(), ConfigError> {
    if nanos <= 0 {
        return Err(ConfigError::NonPositiveDuration { field, nanos });
    }
    Ok(())
}

fn positive_decimal(field: &'static str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO {
        return Err(ConfigError::NonPositiveDecimal { field, value });
    }
    Ok(())
}

fn non_negative(field: &'static str, value: Decimal) -> Result<(), ConfigError> {
    if value < Decimal::ZERO {
        return Err(ConfigError::NegativeDecimal { field, value });
    }
    Ok(())
}
