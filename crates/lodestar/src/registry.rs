//! The handler registry: which function runs for which packet tag.
//!
//! Built once from a declarative table of `(tag, requires_auth, handler)`
//! entries and immutable afterwards. Dispatch never scans for handlers; it
//! resolves one tag to at most one [`Registration`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use lodestar_protocol::{Packet, PacketType};
use lodestar_session::Session;
use lodestar_transport::ConnectionId;

use crate::{LodestarError, Peer, ServerState};

/// What a handler produces: a reply packet, nothing, or an error.
///
/// An error is logged and answered with a generic `InternalError`; its
/// text never reaches the client.
pub type HandlerResult = Result<Option<Packet>, LodestarError>;

/// A packet handler.
///
/// Plain function pointers keep the table `Copy` and inspectable. Write
/// handlers as `fn(ctx, packet) -> BoxFuture` wrappers around an `async`
/// block.
pub type HandlerFn = for<'a> fn(HandlerContext<'a>, Packet) -> BoxFuture<'a, HandlerResult>;

/// Everything a handler may touch while handling one packet.
#[derive(Clone, Copy)]
pub struct HandlerContext<'a> {
    /// The connection the packet arrived on.
    pub peer: &'a Arc<Peer>,
    /// Shared server state: sessions, auth, live connections.
    pub state: &'a ServerState,
    pub connection_id: ConnectionId,
    /// The authorized session, present for auth-gated handlers.
    pub session: Option<&'a Session>,
}

/// One row of the registry.
#[derive(Clone, Copy)]
pub struct Registration {
    pub requires_auth: bool,
    pub handler: HandlerFn,
}

/// A `(tag, requires_auth, handler)` table row.
#[derive(Clone, Copy)]
pub struct HandlerEntry {
    pub packet_type: PacketType,
    pub requires_auth: bool,
    pub handler: HandlerFn,
}

impl HandlerEntry {
    /// A handler anyone may call (login, register, ping).
    pub const fn public(packet_type: PacketType, handler: HandlerFn) -> Self {
        Self {
            packet_type,
            requires_auth: false,
            handler,
        }
    }

    /// A handler that only runs for an authorized session.
    pub const fn authenticated(packet_type: PacketType, handler: HandlerFn) -> Self {
        Self {
            packet_type,
            requires_auth: true,
            handler,
        }
    }
}

/// Immutable tag → handler map.
pub struct HandlerRegistry {
    handlers: HashMap<PacketType, Registration>,
}

impl HandlerRegistry {
    /// Builds a registry from a table.
    ///
    /// # Errors
    /// `DuplicateHandler` if two rows name the same tag.
    pub fn new(entries: impl IntoIterator<Item = HandlerEntry>) -> Result<Self, LodestarError> {
        let mut handlers = HashMap::new();
        for entry in entries {
            let registration = Registration {
                requires_auth: entry.requires_auth,
                handler: entry.handler,
            };
            if handlers.insert(entry.packet_type, registration).is_some() {
                return Err(LodestarError::DuplicateHandler(entry.packet_type));
            }
        }
        Ok(Self { handlers })
    }

    /// Looks up the handler for a tag.
    pub fn resolve(&self, packet_type: PacketType) -> Option<Registration> {
        self.handlers.get(&packet_type).copied()
    }

    /// Registered tags, in no particular order.
    pub fn tags(&self) -> impl Iterator<Item = PacketType> + '_ {
        self.handlers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self
            .handlers
            .iter()
            .map(|(tag, r)| (tag.as_str(), r.requires_auth))
            .collect();
        tags.sort_unstable();
        f.debug_struct("HandlerRegistry").field("handlers", &tags).finish()
    }
}
