//! Error types for the protocol layer.
//!
//! Decoding failures carry the correlation id when the header was readable,
//! so the caller can still address an error reply to the right request.

use crate::CorrelationId;

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// The frame is not a well-formed envelope (bad JSON, not an object).
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The envelope's `type` tag is not registered.
    #[error("unknown packet type {tag:?}")]
    UnknownType {
        /// The tag as received.
        tag: String,
        /// Correlation id from the envelope header, if any.
        correlation_id: Option<CorrelationId>,
    },

    /// The tag is known but the payload doesn't match its schema.
    #[cfg(feature = "json")]
    #[error("invalid {tag} payload: {source}")]
    InvalidPayload {
        /// The registered tag.
        tag: &'static str,
        /// Correlation id from the envelope header, if any.
        correlation_id: Option<CorrelationId>,
        /// What serde rejected.
        #[source]
        source: serde_json::Error,
    },

    /// The envelope header itself is invalid (missing `type`, bad `correlationId`).
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ProtocolError {
    /// The correlation id of the offending envelope, when it could be read.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::UnknownType { correlation_id, .. } => correlation_id.as_ref(),
            #[cfg(feature = "json")]
            Self::InvalidPayload { correlation_id, .. } => correlation_id.as_ref(),
            _ => None,
        }
    }
}
