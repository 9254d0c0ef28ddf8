//! Wire messages exchanged with WebSocket subscribers

use crate::registry::Message;
use crate::summarizer::{DriverSummary, LapSummary};
use pitwall_core::{AnomalyVerdict, RadioMessage, TelemetrySample};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Version stamped on every outbound envelope
pub const PROTOCOL_VERSION: u8 = 1;

/// Outbound event, tagged by `type`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Every scored sample, with its verdict when anomalous
    Telemetry {
        data: TelemetrySample,
        anomaly: Option<AnomalyVerdict>,
    },
    /// Sent only to subscribers following the driver
    Anomaly { data: AnomalyVerdict },
    Radio { data: RadioMessage },
    /// Sent only to subscribers following the driver
    Summary { data: DriverSummary },
    /// Sent to the driver's followers when one of their laps completes
    LapSummary { data: LapSummary },
    /// Acknowledges a `subscribe_driver` request
    Subscribed { driver_id: String },
}

#[derive(Serialize)]
struct Versioned<'a> {
    v: u8,
    #[serde(flatten)]
    envelope: &'a Envelope,
}

impl Envelope {
    /// Serialize once into a message shareable by every recipient
    pub fn to_message(&self) -> serde_json::Result<Message> {
        let json = serde_json::to_string(&Versioned {
            v: PROTOCOL_VERSION,
            envelope: self,
        })?;
        Ok(Arc::from(json))
    }
}

/// Inbound control message from a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    SubscribeDriver { driver_id: String },
}

impl ControlMessage {
    /// Parse a text frame; anything unrecognised yields `None`
    pub fn parse(text: &str) -> Option<Self> {
        let message: Self = serde_json::from_str(text).ok()?;
        match &message {
            ControlMessage::SubscribeDriver { driver_id } if driver_id.trim().is_empty() => None,
            _ => Some(message),
        }
    }
}
