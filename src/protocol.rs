//! Wire protocol
//!
//! JSON surface spoken to subscribers:
//! - `Channel` names the four push streams
//! - `ClientMessage` is what clients send (subscribe, unsubscribe, pong)
//! - `Envelope` is the uniform server frame `{type, channel, data,
//!   timestamp}` wrapping acks, pings, errors, close notices, and
//!   pushed events
//! - `SubscriptionFilter` is the typed form of the client's string
//!   filter map; unknown keys and unparseable values are ignored
//!
//! The transport embedding the pipeline does the socket work; nothing
//! here touches I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::events::{EventPayload, PipelineEvent};
use crate::imbalance::ImbalanceSeverity;

/// Push streams a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Prices,
    Signals,
    OrderFlow,
    Risk,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Prices,
        Channel::Signals,
        Channel::OrderFlow,
        Channel::Risk,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prices" => Some(Self::Prices),
            "signals" => Some(Self::Signals),
            "order_flow" => Some(Self::OrderFlow),
            "risk" => Some(Self::Risk),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prices => "prices",
            Self::Signals => "signals",
            Self::OrderFlow => "order_flow",
            Self::Risk => "risk",
        }
    }

    /// The channel an event is published on.
    pub fn for_payload(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::PriceUpdate { .. } => Self::Prices,
            EventPayload::SignalAlert { .. } => Self::Signals,
            EventPayload::OrderFlow { .. } => Self::OrderFlow,
            EventPayload::RiskAlert { .. } => Self::Risk,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed subscription filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Only events for these symbols; empty means all symbols.
    pub symbols: BTreeSet<String>,
    /// Only events at or above this severity; `None` passes all.
    pub min_severity: Option<ImbalanceSeverity>,
}

impl SubscriptionFilter {
    /// Parse the client's string map. Unknown keys are ignored, as are
    /// values that fail to parse, so a sloppy client still subscribes.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let symbols = map
            .get("symbols")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let min_severity = map
            .get("min_severity")
            .and_then(|raw| ImbalanceSeverity::parse(raw.trim()));
        Self {
            symbols,
            min_severity,
        }
    }

    pub fn matches(&self, event: &PipelineEvent) -> bool {
        if !self.symbols.is_empty() {
            if let Some(symbol) = event.payload.symbol() {
                if !self.symbols.contains(symbol) {
                    return false;
                }
            }
        }
        if let (Some(min), Some(severity)) = (self.min_severity, event.payload.severity()) {
            if severity < min {
                return false;
            }
        }
        true
    }
}

/// Client → hub messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        channel: String,
        #[serde(default)]
        filter: BTreeMap<String, String>,
    },
    Unsubscribe {
        channel: String,
    },
    Pong,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Uniform server frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

impl Envelope {
    /// Wrap a pushed event; the frame type is the event's label.
    pub fn event(channel: Channel, event: &PipelineEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type: event.payload.event_type_label().to_string(),
            channel: Some(channel.as_str().to_string()),
            data: serde_json::to_value(event)?,
            timestamp: event.timestamp,
        })
    }

    pub fn subscribed(channel: Channel, now: i64) -> Self {
        Self {
            message_type: "subscribed".to_string(),
            channel: Some(channel.as_str().to_string()),
            data: json!({ "channel": channel.as_str() }),
            timestamp: now,
        }
    }

    pub fn unsubscribed(channel: Channel, now: i64) -> Self {
        Self {
            message_type: "unsubscribed".to_string(),
            channel: Some(channel.as_str().to_string()),
            data: json!({ "channel": channel.as_str() }),
            timestamp: now,
        }
    }

    pub fn ping(now: i64) -> Self {
        Self {
            message_type: "ping".to_string(),
            channel: None,
            data: json!({}),
            timestamp: now,
        }
    }

    pub fn error(message: &str, now: i64) -> Self {
        Self {
            message_type: "error".to_string(),
            channel: None,
            data: json!({ "message": message }),
            timestamp: now,
        }
    }

    /// Final frame before the transport drops the connection.
    pub fn close_notice(reason: &str, now: i64) -> Self {
        Self {
            message_type: "close_notice".to_string(),
            channel: None,
            data: json!({ "reason": reason }),
            timestamp: now,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
