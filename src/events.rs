//! Pipeline events
//!
//! The typed envelope engine output travels in on its way to
//! subscribers. The hub assigns each event its channel sequence at
//! publish time; ids are UUID v7 so identical payloads stay
//! distinguishable. Events order by (sequence, id) within a channel.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregation::MarketSummary;
use crate::arbitrage::ArbitrageOpportunity;
use crate::delta::DeltaProfile;
use crate::imbalance::{ImbalanceSeverity, OrderFlowImbalance};
use crate::profile::VolumeProfile;

/// Order-flow event body: a window close or an imbalance transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "update", rename_all = "snake_case")]
pub enum OrderFlowUpdate {
    WindowClosed {
        profile: Option<VolumeProfile>,
        delta: DeltaProfile,
    },
    ImbalanceDetected {
        imbalance: OrderFlowImbalance,
    },
    ImbalanceResolved {
        imbalance: OrderFlowImbalance,
    },
}

/// Typed event payloads; the tag doubles as the wire message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    PriceUpdate {
        symbol: String,
        summary: MarketSummary,
    },
    SignalAlert {
        opportunity: ArbitrageOpportunity,
    },
    OrderFlow {
        symbol: String,
        update: OrderFlowUpdate,
    },
    RiskAlert {
        severity: ImbalanceSeverity,
        imbalance: OrderFlowImbalance,
    },
}

impl EventPayload {
    /// Stable label for logs and the wire `type` field.
    pub fn event_type_label(&self) -> &'static str {
        match self {
            Self::PriceUpdate { .. } => "price_update",
            Self::SignalAlert { .. } => "signal_alert",
            Self::OrderFlow { .. } => "order_flow",
            Self::RiskAlert { .. } => "risk_alert",
        }
    }

    /// The symbol the event concerns, when it concerns one.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::PriceUpdate { symbol, .. } | Self::OrderFlow { symbol, .. } => Some(symbol),
            Self::SignalAlert { opportunity } => Some(&opportunity.symbol),
            Self::RiskAlert { imbalance, .. } => Some(&imbalance.symbol),
        }
    }

    /// Severity carried by the event, for severity-gated filters.
    pub fn severity(&self) -> Option<ImbalanceSeverity> {
        match self {
            Self::RiskAlert { severity, .. } => Some(*severity),
            Self::OrderFlow { update, .. } => match update {
                OrderFlowUpdate::ImbalanceDetected { imbalance }
                | OrderFlowUpdate::ImbalanceResolved { imbalance } => Some(imbalance.severity),
                OrderFlowUpdate::WindowClosed { .. } => None,
            },
            _ => None,
        }
    }
}

/// One published event. `sequence` is zero until the hub assigns the
/// channel's next slot at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub id: Uuid,
    pub sequence: u64,
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl PipelineEvent {
    pub fn new(payload: EventPayload, timestamp: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            sequence: 0,
            timestamp,
            payload,
        }
    }
}

impl Ord for PipelineEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for PipelineEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
