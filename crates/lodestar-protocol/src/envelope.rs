//! The envelope: the top-level shape of every frame payload.
//!
//! ```text
//! { "type": "LoginRequest", "correlationId": "9f3c…" | null, ...packet fields }
//! ```
//!
//! The packet's own fields sit beside `type` and `correlationId` rather
//! than in a nested object, so the envelope is just a packet plus an
//! optional correlation id.

use serde::{Deserialize, Serialize};

use crate::{CorrelationId, Packet};

/// A packet plus its optional correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Present only on request/response pairs.
    #[serde(rename = "correlationId", default)]
    pub correlation_id: Option<CorrelationId>,

    /// The tagged packet, flattened into the envelope object.
    #[serde(flatten)]
    pub packet: Packet,
}

impl Envelope {
    /// An uncorrelated (fire-and-forget) envelope.
    pub fn new(packet: impl Into<Packet>) -> Self {
        Self {
            correlation_id: None,
            packet: packet.into(),
        }
    }

    /// An envelope carrying the given correlation id.
    pub fn correlated(packet: impl Into<Packet>, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            packet: packet.into(),
        }
    }

    /// Builds the reply to a request, echoing its correlation id.
    pub fn reply_to(&self, packet: impl Into<Packet>) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            packet: packet.into(),
        }
    }
}
