//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle presence router.
//!
//! Every message on a Huddle connection is a single frame:
//!
//! ```text
//! ┌──────────────────┬─────────────────────────┬──────────────────────┐
//! │ u32 LE length L  │ L bytes of JSON header  │ opaque body (to end) │
//! └──────────────────┴─────────────────────────┴──────────────────────┘
//! ```
//!
//! The header is a JSON array whose first element is a string tag.
//!
//! ## Peer → router
//!
//! - `["listen", docId...]` - Replace the connection's interest set
//! - `["send", identity, connectionId, docId]` - Route the body to a peer
//!
//! ## Router → peer
//!
//! - `["join", identity, connectionId, docId]` - A peer started sharing a document
//! - `["leave", identity, connectionId, docId]` - A peer stopped sharing a document
//! - `["send", identity, connectionId, docId]` - A payload from a peer
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, PeerHeader};
//!
//! let header = PeerHeader::listen(["doc-a", "doc-b"]);
//! let encoded = codec::encode(&header, b"").unwrap();
//! let frame = codec::decode::<PeerHeader>(encoded).unwrap();
//!
//! assert_eq!(frame.header, header);
//! assert!(frame.body.is_empty());
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, Frame, ProtocolError};
pub use frames::{DocumentId, Header, Identity, PeerHeader, RouterHeader};
