//! Codec trait and implementations for serializing/deserializing envelopes.
//!
//! A codec converts between [`Envelope`]s and frame payload bytes. The rest
//! of the stack only talks to the [`Codec`] trait, so the wire encoding can
//! change without touching connection or dispatch code.
//!
//! Decoding is a two-step affair:
//!
//! 1. Parse the outer object and read the header (`type`, `correlationId`).
//! 2. Resolve `type` against the static tag registry ([`PacketType`]) and
//!    decode the payload into that one schema.
//!
//! Splitting the steps lets callers tell "unknown tag" apart from "known tag,
//! bad fields" and still see the correlation id in both cases.

use crate::{Envelope, ProtocolError};
#[cfg(feature = "json")]
use crate::{CorrelationId, Packet, PacketType};

/// Encodes envelopes to bytes and back.
///
/// `Send + Sync + 'static` because one codec instance is shared by every
/// connection task.
pub trait Codec: Send + Sync + 'static {
    /// Serializes an envelope into a frame payload.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails. Output is
    /// never truncated.
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes a frame payload into an envelope.
    ///
    /// # Errors
    /// - `Decode` / `InvalidMessage`: the outer structure is malformed
    /// - `UnknownType`: the tag isn't registered
    /// - `InvalidPayload`: the tag is known but the fields don't fit
    fn decode(&self, data: &[u8]) -> Result<Envelope, ProtocolError>;

    /// Like [`decode`](Self::decode), but logs failures and returns `None`.
    fn deserialize(&self, data: &[u8]) -> Option<Envelope> {
        match self.decode(data) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::warn!(error = %e, len = data.len(), "dropping undecodable frame");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON text (via `serde_json`).
///
/// Unknown fields are ignored so older servers accept newer clients; missing
/// required fields fail only the frame they appear in.
///
/// ## Example
///
/// ```rust
/// use lodestar_protocol::{Codec, Envelope, JsonCodec, Ping};
///
/// let codec = JsonCodec;
/// let envelope = Envelope::new(Ping { client_time: 5000 });
///
/// let bytes = codec.encode(&envelope).unwrap();
/// let decoded = codec.decode(&bytes).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(envelope).map_err(ProtocolError::Encode)
    }

    fn decode(&self, data: &[u8]) -> Result<Envelope, ProtocolError> {
        use serde::Deserialize;
        use serde_json::Value;

        let mut value: Value = serde_json::from_slice(data).map_err(ProtocolError::Decode)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| ProtocolError::InvalidMessage("envelope must be an object".into()))?;

        let correlation_id = match object.remove("correlationId") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(CorrelationId::from(id)),
            Some(_) => {
                return Err(ProtocolError::InvalidMessage(
                    "correlationId must be a string or null".into(),
                ));
            }
        };

        let tag = match object.get("type") {
            Some(Value::String(tag)) => tag.as_str(),
            _ => {
                return Err(ProtocolError::InvalidMessage(
                    "missing string field \"type\"".into(),
                ));
            }
        };

        let Some(packet_type) = PacketType::from_tag(tag) else {
            return Err(ProtocolError::UnknownType {
                tag: tag.to_string(),
                correlation_id,
            });
        };

        // Serde's internally tagged enum dispatches on `type` to exactly the
        // one variant registered for it.
        match Packet::deserialize(value) {
            Ok(packet) => Ok(Envelope {
                correlation_id,
                packet,
            }),
            Err(source) => Err(ProtocolError::InvalidPayload {
                tag: packet_type.as_str(),
                correlation_id,
                source,
            }),
        }
    }
}
