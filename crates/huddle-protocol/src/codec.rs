//! Codec for encoding and decoding Huddle frames.
//!
//! A frame is a little-endian `u32` header length, the JSON header, and an
//! opaque body running to the end of the buffer. The transport (one WebSocket
//! message per frame) delimits frames, so there is no outer length.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{Header, PeerHeader, RouterHeader};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
///
/// None of these are fatal to a connection; the offending frame is discarded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is shorter than the length prefix.
    #[error("Incomplete frame: need {LENGTH_PREFIX_SIZE} prefix bytes, got {0}")]
    Incomplete(usize),

    /// Declared header length runs past the end of the frame.
    #[error("Header length {declared} exceeds available {available} bytes")]
    HeaderOverrun { declared: usize, available: usize },

    /// Header is too large to be described by the length prefix.
    #[error("Header size {0} exceeds the u32 length prefix")]
    HeaderTooLarge(usize),

    /// Header is not valid UTF-8 JSON.
    #[error("Invalid header JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Header JSON does not have the shape of a tagged array.
    #[error("Malformed header: {0}")]
    Malformed(&'static str),

    /// Header tag is not one of the defined variants.
    #[error("Unknown header tag: {0}")]
    UnknownTag(String),

    /// Fixed-arity header with the wrong number of fields.
    #[error("Header '{tag}' expects {expected} fields, got {found}")]
    Arity {
        tag: &'static str,
        expected: usize,
        found: usize,
    },
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<H> {
    /// The tagged header.
    pub header: H,
    /// The opaque body; never interpreted.
    pub body: Bytes,
}

impl<H> Frame<H> {
    /// Create a frame from a header and body.
    #[must_use]
    pub fn new(header: H, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }
}

/// Encode a header and body into a frame.
///
/// # Errors
///
/// Returns an error if the header cannot be serialized or is too large.
pub fn encode<H: Header>(header: &H, body: &[u8]) -> Result<Bytes, ProtocolError> {
    let json = serde_json::to_vec(header)?;
    let length = u32::try_from(json.len()).map_err(|_| ProtocolError::HeaderTooLarge(json.len()))?;

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + json.len() + body.len());
    buf.put_u32_le(length);
    buf.extend_from_slice(&json);
    buf.extend_from_slice(body);

    Ok(buf.freeze())
}

/// Decode a frame.
///
/// The body is a zero-copy slice of `data`.
///
/// # Errors
///
/// Returns an error if the prefix is incomplete, the header overruns the
/// frame, or the header does not match a variant of `H`.
pub fn decode<H: Header>(data: Bytes) -> Result<Frame<H>, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(data.len()));
    }

    let declared = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let available = data.len() - LENGTH_PREFIX_SIZE;
    if declared > available {
        return Err(ProtocolError::HeaderOverrun {
            declared,
            available,
        });
    }

    let header_end = LENGTH_PREFIX_SIZE + declared;
    let value: serde_json::Value = serde_json::from_slice(&data[LENGTH_PREFIX_SIZE..header_end])?;
    let header = H::from_json(value)?;

    Ok(Frame {
        header,
        body: data.slice(header_end..),
    })
}

/// Decode a frame sent by a peer.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_peer(data: impl Into<Bytes>) -> Result<Frame<PeerHeader>, ProtocolError> {
    decode(data.into())
}

/// Decode a frame sent by the router.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_router(data: impl Into<Bytes>) -> Result<Frame<RouterHeader>, ProtocolError> {
    decode(data.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_byte_layout() {
        let encoded = encode(&PeerHeader::listen(["a"]), &[9, 8]).unwrap();

        let header = br#"["listen","a"]"#;
        assert_eq!(&encoded[..4], &(header.len() as u32).to_le_bytes());
        assert_eq!(&encoded[4..4 + header.len()], header);
        assert_eq!(&encoded[4 + header.len()..], &[9, 8]);
    }

    #[test]
    fn test_decode_foreign_frame() {
        // Hand-built frame, as another implementation would produce it.
        let header = br#"["send","did:plc:b","01J0","doc"]"#;
        let mut data = (header.len() as u32).to_le_bytes().to_vec();
        data.extend_from_slice(header);
        data.extend_from_slice(&[1, 2, 3]);

        let frame = decode_router(data).unwrap();
        assert_eq!(frame.header, RouterHeader::send("did:plc:b", "01J0", "doc"));
        assert_eq!(&frame.body[..], &[1, 2, 3]);
    }

    #[test]
    fn test_decode_incomplete() {
        match decode_peer(vec![1u8, 0]) {
            Err(ProtocolError::Incomplete(2)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_header_overrun() {
        let mut data = 100u32.to_le_bytes().to_vec();
        data.extend_from_slice(br#"["listen"]"#);

        match decode_peer(data) {
            Err(ProtocolError::HeaderOverrun {
                declared,
                available,
            }) => {
                assert_eq!(declared, 100);
                assert_eq!(available, 10);
            }
            other => panic!("Expected HeaderOverrun error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_json() {
        let mut data = 5u32.to_le_bytes().to_vec();
        data.extend_from_slice(b"[\"lis");

        assert!(matches!(decode_peer(data), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_unknown_tag() {
        let encoded = encode(&RouterHeader::join("did", "c", "d"), b"").unwrap();
        assert!(matches!(
            decode_peer(encoded),
            Err(ProtocolError::UnknownTag(_))
        ));
    }

    #[test]
    fn test_empty_body() {
        let encoded = encode(&PeerHeader::listen(["doc"]), b"").unwrap();
        let frame = decode_peer(encoded).unwrap();
        assert!(frame.body.is_empty());
    }

    fn peer_header() -> impl Strategy<Value = PeerHeader> {
        prop_oneof![
            prop::collection::vec(".*", 0..6).prop_map(PeerHeader::listen),
            (".*", ".*", ".*").prop_map(|(i, c, d)| PeerHeader::send(i, c, d)),
        ]
    }

    fn router_header() -> impl Strategy<Value = RouterHeader> {
        (0..3u8, ".*", ".*", ".*").prop_map(|(kind, i, c, d)| match kind {
            0 => RouterHeader::join(i, c, d),
            1 => RouterHeader::leave(i, c, d),
            _ => RouterHeader::send(i, c, d),
        })
    }

    proptest! {
        #[test]
        fn prop_peer_roundtrip(header in peer_header(), body in prop::collection::vec(any::<u8>(), 0..256)) {
            let frame = decode_peer(encode(&header, &body).unwrap()).unwrap();
            prop_assert_eq!(frame.header, header);
            prop_assert_eq!(&frame.body[..], &body[..]);
        }

        #[test]
        fn prop_router_roundtrip(header in router_header(), body in prop::collection::vec(any::<u8>(), 0..256)) {
            let frame = decode_router(encode(&header, &body).unwrap()).unwrap();
            prop_assert_eq!(frame.header, header);
            prop_assert_eq!(&frame.body[..], &body[..]);
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode_peer(data.clone());
            let _ = decode_router(data);
        }
    }
}
