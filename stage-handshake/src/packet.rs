//! Wire-format definitions for protocol frames.
//!
//! Every message exchanged between client and server, over UDP or TCP, is a
//! [`Frame`].  This module is responsible for:
//! - Defining the on-wire binary layout (fixed header, padded payload).
//! - Serialising a [`Frame`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Frame`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload Length                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Previous-Stage Secret                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             Stage             |           Client Id           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             Payload ... (zero-padded to 4 bytes)              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 12 bytes.
//! payload_len(4) + prev_secret(4) + stage(2) + client_id(2)
//!
//! `payload_len` is the *declared* (unpadded) length.  The physical payload
//! that follows is rounded up to a multiple of [`ALIGNMENT`]; the trailing
//! bytes are padding.

use thiserror::Error;

/// Values carried in the `stage` header field.
pub mod step {
    /// Every client-originated frame.
    pub const REQUEST: u16 = 1;
    /// Every server-originated frame.
    pub const RESPONSE: u16 = 2;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 12;

/// Every frame (and therefore every payload) is a multiple of this length.
pub const ALIGNMENT: usize = 4;

// Byte offsets of each field within the serialised header.
const OFF_PAYLOAD_LEN: usize = 0;
const OFF_PREV_SECRET: usize = 4;
const OFF_STAGE: usize = 8;
const OFF_CLIENT_ID: usize = 10;

/// Round `len` up to the next multiple of [`ALIGNMENT`].
#[inline]
pub fn padded_len(len: usize) -> usize {
    len.next_multiple_of(ALIGNMENT)
}

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Header::encode`] converts to big-endian
/// on the wire and [`Header::decode`] converts back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Declared (unpadded) payload length in bytes.
    pub payload_len: u32,
    /// Secret issued by the previous stage, `0` for the stage-A greeting.
    pub prev_secret: u32,
    /// [`step::REQUEST`] or [`step::RESPONSE`].
    pub stage: u16,
    /// Caller-chosen identifier, echoed by the server.
    pub client_id: u16,
}

impl Header {
    /// Serialise into exactly [`HEADER_LEN`] big-endian bytes.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 4].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[OFF_PREV_SECRET..OFF_PREV_SECRET + 4].copy_from_slice(&self.prev_secret.to_be_bytes());
        buf[OFF_STAGE..OFF_STAGE + 2].copy_from_slice(&self.stage.to_be_bytes());
        buf[OFF_CLIENT_ID..OFF_CLIENT_ID + 2].copy_from_slice(&self.client_id.to_be_bytes());
        buf
    }

    /// Parse a header from exactly [`HEADER_LEN`] bytes.
    ///
    /// Infallible: every 12-byte pattern is a syntactically valid header.
    /// Stream readers use this to learn how many payload bytes follow.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let be32 = |off: usize| u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        let be16 = |off: usize| u16::from_be_bytes([buf[off], buf[off + 1]]);
        Self {
            payload_len: be32(OFF_PAYLOAD_LEN),
            prev_secret: be32(OFF_PREV_SECRET),
            stage: be16(OFF_STAGE),
            client_id: be16(OFF_CLIENT_ID),
        }
    }

    /// Number of payload bytes that physically follow this header.
    pub fn padded_payload_len(&self) -> usize {
        padded_len(self.payload_len as usize)
    }
}

/// A complete protocol message: header + padded payload.
///
/// Frames are immutable once built.  The only constructors are
/// [`Frame::new`] and the validating decoders, so every `Frame` in the
/// program satisfies `payload_len <= padded payload length` and has a
/// 4-byte-aligned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: Header,
    /// Padded payload; `header.payload_len` bytes are significant.
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame around `payload`, padding it with zeros.
    ///
    /// # Panics
    ///
    /// If `payload` is longer than `u32::MAX` bytes.
    pub fn new(payload: &[u8], prev_secret: u32, stage: u16, client_id: u16) -> Self {
        let payload_len =
            u32::try_from(payload.len()).expect("payload length must fit the u32 header field");
        let mut padded = Vec::with_capacity(padded_len(payload.len()));
        padded.extend_from_slice(payload);
        padded.resize(padded_len(payload.len()), 0);
        Self {
            header: Header {
                payload_len,
                prev_secret,
                stage,
                client_id,
            },
            payload: padded,
        }
    }

    /// Rebuild a frame from a header and the physical payload that followed
    /// it, re-validating the length invariants.
    pub fn from_parts(header: Header, padded_payload: Vec<u8>) -> Result<Self, FrameError> {
        if padded_payload.len() % ALIGNMENT != 0 {
            return Err(FrameError::Misaligned {
                len: HEADER_LEN + padded_payload.len(),
            });
        }
        if header.payload_len as usize > padded_payload.len() {
            return Err(FrameError::DeclaredLengthOverflow {
                declared: header.payload_len as usize,
                physical: padded_payload.len(),
            });
        }
        Ok(Self {
            header,
            payload: padded_payload,
        })
    }

    /// Parse a [`Frame`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - `buf.len()` is not a multiple of [`ALIGNMENT`], or
    /// - the declared payload length runs past the end of `buf`.
    ///
    /// Extra trailing bytes beyond the declared length are accepted as
    /// padding, even when there are more of them than alignment requires.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::TooShort { len: buf.len() });
        }
        if buf.len() % ALIGNMENT != 0 {
            return Err(FrameError::Misaligned { len: buf.len() });
        }

        let (head, body) = buf.split_at(HEADER_LEN);
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(head);
        Self::from_parts(Header::decode(&raw), body.to_vec())
    }

    /// Serialise this frame into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Total on-wire length (always a multiple of [`ALIGNMENT`]).
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn prev_secret(&self) -> u32 {
        self.header.prev_secret
    }

    pub fn stage(&self) -> u16 {
        self.header.stage
    }

    pub fn client_id(&self) -> u16 {
        self.header.client_id
    }

    /// Declared payload length from the header.
    pub fn declared_len(&self) -> usize {
        self.header.payload_len as usize
    }

    /// Physical payload length, including padding.
    pub fn physical_len(&self) -> usize {
        self.payload.len()
    }

    /// The significant payload bytes (padding stripped).
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.declared_len()]
    }

    /// The payload exactly as carried on the wire, padding included.
    pub fn padded_payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Encode a frame in one call; shorthand for `Frame::new(..).encode()`.
pub fn encode(payload: &[u8], prev_secret: u32, stage: u16, client_id: u16) -> Vec<u8> {
    Frame::new(payload, prev_secret, stage, client_id).encode()
}

/// A buffer that cannot be interpreted as a [`Frame`] (a *malformed frame*).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Buffer shorter than the fixed header size.
    #[error("malformed frame: {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    TooShort { len: usize },
    /// Buffer length is not 4-byte aligned.
    #[error("malformed frame: length {len} is not a multiple of {ALIGNMENT}")]
    Misaligned { len: usize },
    /// The header claims more payload than the frame carries.
    #[error("malformed frame: declared payload of {declared} bytes but only {physical} present")]
    DeclaredLengthOverflow { declared: usize, physical: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let frame = Frame::new(b"hello world\0", 0, step::REQUEST, 592);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.prev_secret(), 0);
        assert_eq!(decoded.stage(), step::REQUEST);
        assert_eq!(decoded.client_id(), 592);
        assert_eq!(decoded.payload(), b"hello world\0");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_preserves_declared_prefix_for_unaligned_payloads() {
        for len in 0..=9usize {
            let payload: Vec<u8> = (1..=len as u8).collect();
            let bytes = encode(&payload, 0xdead_beef, step::RESPONSE, 7);
            let decoded = Frame::decode(&bytes).unwrap();
            assert_eq!(decoded.declared_len(), len);
            assert_eq!(decoded.payload(), payload.as_slice());
            assert_eq!(decoded.physical_len(), padded_len(len));
            assert_eq!(decoded.prev_secret(), 0xdead_beef);
        }
    }

    #[test]
    fn encode_pads_payload_to_alignment() {
        let bytes = encode(b"abcde", 1, step::REQUEST, 2);
        assert_eq!(bytes.len(), HEADER_LEN + 8);
        assert_eq!(&bytes[HEADER_LEN..], b"abcde\0\0\0");
    }

    #[test]
    fn encode_writes_unpadded_length() {
        let bytes = encode(b"abcde", 1, step::REQUEST, 2);
        let len_field = u32::from_be_bytes(bytes[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 4].try_into().unwrap());
        assert_eq!(len_field, 5);
    }

    #[test]
    fn header_fields_big_endian_on_wire() {
        let bytes = encode(b"", 0x0102_0304, 0x0506, 0x0708);
        assert_eq!(&bytes[..HEADER_LEN], &[0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn decode_empty_buffer_returns_error() {
        assert_eq!(Frame::decode(&[]), Err(FrameError::TooShort { len: 0 }));
    }

    #[test]
    fn decode_short_header_returns_error() {
        for len in 1..HEADER_LEN {
            assert_eq!(
                Frame::decode(&vec![0u8; len]),
                Err(FrameError::TooShort { len })
            );
        }
    }

    #[test]
    fn decode_misaligned_buffer_returns_error() {
        let mut bytes = encode(b"data", 0, step::REQUEST, 0);
        bytes.push(0);
        assert_eq!(
            Frame::decode(&bytes),
            Err(FrameError::Misaligned { len: HEADER_LEN + 5 })
        );
    }

    #[test]
    fn decode_declared_length_past_end_returns_error() {
        let mut bytes = encode(b"data", 0, step::REQUEST, 0);
        bytes[OFF_PAYLOAD_LEN + 3] = 9;
        assert_eq!(
            Frame::decode(&bytes),
            Err(FrameError::DeclaredLengthOverflow {
                declared: 9,
                physical: 4
            })
        );
    }

    #[test]
    fn decode_accepts_extra_trailing_padding() {
        let mut bytes = encode(b"ab", 3, step::REQUEST, 4);
        bytes.extend_from_slice(&[0u8; 8]);
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.payload(), b"ab");
        assert_eq!(frame.physical_len(), 12);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let frame = Frame::decode(&encode(b"", 9, step::RESPONSE, 1)).unwrap();
        assert_eq!(frame.payload(), b"");
        assert_eq!(frame.encoded_len(), HEADER_LEN);
    }

    #[test]
    fn from_parts_rejects_misaligned_body() {
        let header = Header {
            payload_len: 3,
            prev_secret: 0,
            stage: step::REQUEST,
            client_id: 0,
        };
        assert!(Frame::from_parts(header, vec![1, 2, 3]).is_err());
        assert!(Frame::from_parts(header, vec![1, 2, 3, 0]).is_ok());
    }

    #[test]
    fn header_len_constant_is_correct() {
        // payload_len(4) + prev_secret(4) + stage(2) + client_id(2) = 12
        assert_eq!(HEADER_LEN, 12);
        assert_eq!(Header::decode(&[0u8; HEADER_LEN]).encode().len(), HEADER_LEN);
    }
}
