//! Header types for the Huddle protocol.
//!
//! Headers travel as JSON arrays whose first element is a string tag, e.g.
//! `["send", "did:plc:alice", "0191...", "doc-1"]`. Each direction has its own
//! closed set of variants.

use serde::de::{Deserialize, Deserializer, Error as _};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;

use crate::codec::ProtocolError;

/// An externally issued user identity (a DID in practice).
pub type Identity = String;

/// An opaque routing topic.
pub type DocumentId = String;

/// Header tags as they appear on the wire.
pub mod tags {
    pub const LISTEN: &str = "listen";
    pub const SEND: &str = "send";
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
}

/// Number of string fields following the tag in addressed headers.
const ADDRESS_ARITY: usize = 3;

/// A frame header that can be decoded from its JSON form.
pub trait Header: Serialize + Sized {
    /// The wire tag of this header.
    fn tag(&self) -> &'static str;

    /// Decode a header from an already parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a tagged array matching one of the
    /// defined variants.
    fn from_json(value: Value) -> Result<Self, ProtocolError>;
}

/// Headers sent by a peer to the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerHeader {
    /// Replace the connection's interest set with `documents`.
    Listen {
        /// Documents the peer wants presence and traffic for.
        documents: Vec<DocumentId>,
    },

    /// Route the frame body to another connection.
    Send {
        /// Identity the target connection must belong to.
        identity: Identity,
        /// Target connection.
        connection_id: String,
        /// Document the payload is about.
        document: DocumentId,
    },
}

impl PeerHeader {
    /// Create a new Listen header.
    #[must_use]
    pub fn listen<I, S>(documents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<DocumentId>,
    {
        PeerHeader::Listen {
            documents: documents.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a new Send header addressed to `(identity, connection_id)`.
    #[must_use]
    pub fn send(
        identity: impl Into<Identity>,
        connection_id: impl Into<String>,
        document: impl Into<DocumentId>,
    ) -> Self {
        PeerHeader::Send {
            identity: identity.into(),
            connection_id: connection_id.into(),
            document: document.into(),
        }
    }
}

impl Header for PeerHeader {
    fn tag(&self) -> &'static str {
        match self {
            PeerHeader::Listen { .. } => tags::LISTEN,
            PeerHeader::Send { .. } => tags::SEND,
        }
    }

    fn from_json(value: Value) -> Result<Self, ProtocolError> {
        let (tag, fields) = split_tagged(value)?;
        match tag.as_str() {
            tags::LISTEN => Ok(PeerHeader::Listen { documents: fields }),
            tags::SEND => {
                let [identity, connection_id, document] = address(tags::SEND, fields)?;
                Ok(PeerHeader::Send {
                    identity,
                    connection_id,
                    document,
                })
            }
            _ => Err(ProtocolError::UnknownTag(tag)),
        }
    }
}

/// Headers sent by the router to a peer.
///
/// All variants carry the address of the *other* peer involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterHeader {
    /// A peer started sharing interest in a document with the recipient.
    Join {
        identity: Identity,
        connection_id: String,
        document: DocumentId,
    },

    /// A peer stopped sharing interest in a document with the recipient.
    Leave {
        identity: Identity,
        connection_id: String,
        document: DocumentId,
    },

    /// A payload delivered from a peer; the body follows the header.
    Send {
        identity: Identity,
        connection_id: String,
        document: DocumentId,
    },
}

impl RouterHeader {
    /// Create a new Join header.
    #[must_use]
    pub fn join(
        identity: impl Into<Identity>,
        connection_id: impl Into<String>,
        document: impl Into<DocumentId>,
    ) -> Self {
        RouterHeader::Join {
            identity: identity.into(),
            connection_id: connection_id.into(),
            document: document.into(),
        }
    }

    /// Create a new Leave header.
    #[must_use]
    pub fn leave(
        identity: impl Into<Identity>,
        connection_id: impl Into<String>,
        document: impl Into<DocumentId>,
    ) -> Self {
        RouterHeader::Leave {
            identity: identity.into(),
            connection_id: connection_id.into(),
            document: document.into(),
        }
    }

    /// Create a new Send header attributing a payload to its sender.
    #[must_use]
    pub fn send(
        identity: impl Into<Identity>,
        connection_id: impl Into<String>,
        document: impl Into<DocumentId>,
    ) -> Self {
        RouterHeader::Send {
            identity: identity.into(),
            connection_id: connection_id.into(),
            document: document.into(),
        }
    }

    /// The `(identity, connection_id, document)` triple carried by the header.
    #[must_use]
    pub fn address(&self) -> (&str, &str, &str) {
        match self {
            RouterHeader::Join {
                identity,
                connection_id,
                document,
            }
            | RouterHeader::Leave {
                identity,
                connection_id,
                document,
            }
            | RouterHeader::Send {
                identity,
                connection_id,
                document,
            } => (identity, connection_id, document),
        }
    }
}

impl Header for RouterHeader {
    fn tag(&self) -> &'static str {
        match self {
            RouterHeader::Join { .. } => tags::JOIN,
            RouterHeader::Leave { .. } => tags::LEAVE,
            RouterHeader::Send { .. } => tags::SEND,
        }
    }

    fn from_json(value: Value) -> Result<Self, ProtocolError> {
        let (tag, fields) = split_tagged(value)?;
        let tag = match tag.as_str() {
            tags::JOIN => tags::JOIN,
            tags::LEAVE => tags::LEAVE,
            tags::SEND => tags::SEND,
            _ => return Err(ProtocolError::UnknownTag(tag)),
        };

        let [identity, connection_id, document] = address(tag, fields)?;
        Ok(match tag {
            tags::JOIN => RouterHeader::Join {
                identity,
                connection_id,
                document,
            },
            tags::LEAVE => RouterHeader::Leave {
                identity,
                connection_id,
                document,
            },
            _ => RouterHeader::Send {
                identity,
                connection_id,
                document,
            },
        })
    }
}

impl Serialize for PeerHeader {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PeerHeader::Listen { documents } => {
                let mut seq = serializer.serialize_seq(Some(documents.len() + 1))?;
                seq.serialize_element(tags::LISTEN)?;
                for document in documents {
                    seq.serialize_element(document)?;
                }
                seq.end()
            }
            PeerHeader::Send {
                identity,
                connection_id,
                document,
            } => serialize_address(serializer, tags::SEND, identity, connection_id, document),
        }
    }
}

impl Serialize for RouterHeader {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (identity, connection_id, document) = self.address();
        serialize_address(serializer, self.tag(), identity, connection_id, document)
    }
}

impl<'de> Deserialize<'de> for PeerHeader {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(value).map_err(D::Error::custom)
    }
}

impl<'de> Deserialize<'de> for RouterHeader {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(value).map_err(D::Error::custom)
    }
}

fn serialize_address<S: Serializer>(
    serializer: S,
    tag: &str,
    identity: &str,
    connection_id: &str,
    document: &str,
) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(ADDRESS_ARITY + 1))?;
    seq.serialize_element(tag)?;
    seq.serialize_element(identity)?;
    seq.serialize_element(connection_id)?;
    seq.serialize_element(document)?;
    seq.end()
}

/// Split a `[tag, field...]` array into its tag and string fields.
fn split_tagged(value: Value) -> Result<(String, Vec<String>), ProtocolError> {
    let Value::Array(items) = value else {
        return Err(ProtocolError::Malformed("header must be a JSON array"));
    };

    let mut items = items.into_iter();
    let Some(Value::String(tag)) = items.next() else {
        return Err(ProtocolError::Malformed(
            "header must start with a string tag",
        ));
    };

    let fields = items
        .map(|item| match item {
            Value::String(s) => Ok(s),
            _ => Err(ProtocolError::Malformed("header fields must be strings")),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((tag, fields))
}

fn address(tag: &'static str, fields: Vec<String>) -> Result<[String; 3], ProtocolError> {
    let found = fields.len();
    <[String; ADDRESS_ARITY]>::try_from(fields).map_err(|_| ProtocolError::Arity {
        tag,
        expected: ADDRESS_ARITY,
        found,
    })
}
