//! Stage payload schemas.
//!
//! Each stage exchanges fixed-layout payloads made of big-endian `u32`
//! words.  The types here convert between those payloads and typed values;
//! framing is [`crate::packet`]'s job.
//!
//! | Message            | Payload                                               |
//! |--------------------|-------------------------------------------------------|
//! | [`GREETING`]       | `"hello world\0"`                                     |
//! | [`DiscoveryReply`] | packet_count, chunk_len, udp_port, secret_a           |
//! | [`TransferPacket`] | packet_id, then `chunk_len` zero bytes                |
//! | [`TransferAck`]    | packet_id                                             |
//! | [`HandoffReply`]   | tcp_port, secret_b                                    |
//! | [`BulkParams`]     | repeat_count, chunk_len, secret_c, `[byte, 0, 0, 0]`  |
//! | [`CompletionReply`]| secret_d                                              |

use thiserror::Error;

/// The only payload stage A accepts.
pub const GREETING: &[u8; 12] = b"hello world\0";

/// A payload that does not match the schema it was parsed as.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("payload is {got} bytes, expected {expected}")]
    WrongLength { expected: usize, got: usize },
    #[error("port {0} does not fit in 16 bits")]
    PortOutOfRange(u32),
    #[error("transfer chunk contains non-zero bytes")]
    NonZeroChunk,
}

fn words<const N: usize>(payload: &[u8]) -> Result<[u32; N], MessageError> {
    if payload.len() != N * 4 {
        return Err(MessageError::WrongLength {
            expected: N * 4,
            got: payload.len(),
        });
    }
    let mut out = [0u32; N];
    for (word, chunk) in out.iter_mut().zip(payload.chunks_exact(4)) {
        *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(out)
}

fn to_words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

fn port(raw: u32) -> Result<u16, MessageError> {
    u16::try_from(raw).map_err(|_| MessageError::PortOutOfRange(raw))
}

/// Stage-A response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryReply {
    pub packet_count: u32,
    pub chunk_len: u32,
    pub udp_port: u16,
    pub secret: u32,
}

impl DiscoveryReply {
    pub fn to_payload(&self) -> Vec<u8> {
        to_words(&[
            self.packet_count,
            self.chunk_len,
            u32::from(self.udp_port),
            self.secret,
        ])
    }

    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let [packet_count, chunk_len, udp_port, secret] = words::<4>(payload)?;
        Ok(Self {
            packet_count,
            chunk_len,
            udp_port: port(udp_port)?,
            secret,
        })
    }
}

/// One stage-B data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPacket {
    pub packet_id: u32,
    pub chunk_len: u32,
}

impl TransferPacket {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.chunk_len as usize);
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        buf.resize(4 + self.chunk_len as usize, 0);
        buf
    }

    /// Parse a packet whose chunk must be exactly `chunk_len` zero bytes.
    pub fn parse(payload: &[u8], chunk_len: u32) -> Result<Self, MessageError> {
        let expected = 4 + chunk_len as usize;
        if payload.len() != expected {
            return Err(MessageError::WrongLength {
                expected,
                got: payload.len(),
            });
        }
        let (id, chunk) = payload.split_at(4);
        if chunk.iter().any(|b| *b != 0) {
            return Err(MessageError::NonZeroChunk);
        }
        Ok(Self {
            packet_id: u32::from_be_bytes([id[0], id[1], id[2], id[3]]),
            chunk_len,
        })
    }
}

/// Stage-B acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferAck {
    pub packet_id: u32,
}

impl TransferAck {
    pub fn to_payload(&self) -> Vec<u8> {
        self.packet_id.to_be_bytes().to_vec()
    }

    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let [packet_id] = words::<1>(payload)?;
        Ok(Self { packet_id })
    }
}

/// Final stage-B response: where to open the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffReply {
    pub tcp_port: u16,
    pub secret: u32,
}

impl HandoffReply {
    pub fn to_payload(&self) -> Vec<u8> {
        to_words(&[u32::from(self.tcp_port), self.secret])
    }

    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let [tcp_port, secret] = words::<2>(payload)?;
        Ok(Self {
            tcp_port: port(tcp_port)?,
            secret,
        })
    }
}

/// Stage-C response, sent first on the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkParams {
    pub repeat_count: u32,
    pub chunk_len: u32,
    pub secret: u32,
    pub expected_byte: u8,
}

impl BulkParams {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut buf = to_words(&[self.repeat_count, self.chunk_len, self.secret]);
        buf.extend_from_slice(&[self.expected_byte, 0, 0, 0]);
        buf
    }

    /// Parse the 16-byte layout.  Only the first byte of the last word is
    /// significant.
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let [repeat_count, chunk_len, secret, last] = words::<4>(payload)?;
        Ok(Self {
            repeat_count,
            chunk_len,
            secret,
            expected_byte: last.to_be_bytes()[0],
        })
    }

    /// Payload of each stage-D frame.
    pub fn bulk_payload(&self) -> Vec<u8> {
        vec![self.expected_byte; self.chunk_len as usize]
    }
}

/// Stage-D response carrying the terminal secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionReply {
    pub secret: u32,
}

impl CompletionReply {
    pub fn to_payload(&self) -> Vec<u8> {
        self.secret.to_be_bytes().to_vec()
    }

    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let [secret] = words::<1>(payload)?;
        Ok(Self { secret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_is_twelve_bytes_null_terminated() {
        assert_eq!(GREETING.len(), 12);
        assert_eq!(GREETING.last(), Some(&0));
    }

    #[test]
    fn discovery_reply_layout() {
        let reply = DiscoveryReply {
            packet_count: 7,
            chunk_len: 12,
            udp_port: 40000,
            secret: 0xaabb_ccdd,
        };
        let bytes = reply.to_payload();
        assert_eq!(&bytes[8..12], &40000u32.to_be_bytes());
        assert_eq!(DiscoveryReply::parse(&bytes), Ok(reply));
    }

    #[test]
    fn discovery_reply_rejects_wide_port() {
        let bytes = to_words(&[5, 4, 70_000, 1]);
        assert_eq!(
            DiscoveryReply::parse(&bytes),
            Err(MessageError::PortOutOfRange(70_000))
        );
    }

    #[test]
    fn transfer_packet_is_id_then_zeros() {
        let pkt = TransferPacket {
            packet_id: 3,
            chunk_len: 8,
        };
        let bytes = pkt.to_payload();
        assert_eq!(bytes, [0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(TransferPacket::parse(&bytes, 8), Ok(pkt));
    }

    #[test]
    fn transfer_packet_rejects_wrong_length_and_dirty_chunk() {
        let mut bytes = TransferPacket {
            packet_id: 0,
            chunk_len: 4,
        }
        .to_payload();
        assert!(matches!(
            TransferPacket::parse(&bytes, 8),
            Err(MessageError::WrongLength { expected: 12, got: 8 })
        ));
        bytes[6] = 1;
        assert_eq!(
            TransferPacket::parse(&bytes, 4),
            Err(MessageError::NonZeroChunk)
        );
    }

    #[test]
    fn bulk_params_keep_only_first_byte_of_last_word() {
        let params = BulkParams {
            repeat_count: 3,
            chunk_len: 16,
            secret: 99,
            expected_byte: b'q',
        };
        let bytes = params.to_payload();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[12..], &[b'q', 0, 0, 0]);
        assert_eq!(BulkParams::parse(&bytes), Ok(params));
        assert!(params.bulk_payload().iter().all(|b| *b == b'q'));
        assert_eq!(params.bulk_payload().len(), 16);
    }

    #[test]
    fn short_payloads_are_rejected() {
        assert!(TransferAck::parse(&[0, 1]).is_err());
        assert!(HandoffReply::parse(&[0; 4]).is_err());
        assert!(CompletionReply::parse(&[]).is_err());
    }
}
