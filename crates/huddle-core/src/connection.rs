//! Connections and connection identifiers.

use bytes::Bytes;
use huddle_protocol::{codec, DocumentId, Identity, RouterHeader};
use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use uuid::Uuid;

/// Queue of encoded frames waiting to be written to a peer's transport.
///
/// Unbounded: the router never waits on a peer, and a peer whose transport
/// is gone simply stops draining its queue until it is torn down.
pub type Outbox = mpsc::UnboundedSender<Bytes>;

/// Router-minted identifier for one live transport session.
///
/// Ids are UUIDv7 strings, so they embed their creation time and sort
/// lexicographically in creation order. They are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an existing id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A registered peer connection.
#[derive(Debug)]
pub struct Connection {
    /// Authenticated identity, fixed for the lifetime of the connection.
    pub identity: Identity,
    /// Router-minted connection id.
    pub id: ConnectionId,
    /// Documents this connection is listening to.
    pub interests: HashSet<DocumentId>,
    outbox: Outbox,
}

impl Connection {
    /// Create a connection with no interests.
    #[must_use]
    pub fn new(identity: impl Into<Identity>, id: ConnectionId, outbox: Outbox) -> Self {
        Self {
            identity: identity.into(),
            id,
            interests: HashSet::new(),
            outbox,
        }
    }

    /// Encode and queue a frame for this peer.
    ///
    /// Returns `false` if the frame could not be queued. Failures are the
    /// transport's concern and are not retried.
    pub fn deliver(&self, header: &RouterHeader, body: &[u8]) -> bool {
        let frame = match codec::encode(header, body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection = %self.id, error = %e, "Failed to encode router frame");
                return false;
            }
        };

        if self.outbox.send(frame).is_err() {
            trace!(connection = %self.id, "Outbox closed, dropping frame");
            return false;
        }
        true
    }

    /// Whether this connection is listening to `document`.
    #[must_use]
    pub fn is_interested(&self, document: &str) -> bool {
        self.interests.contains(document)
    }
}
