//! Stage-B acknowledged-transfer state machine (server side).
//!
//! [`TransferState`] tracks one session's windowed transfer:
//!
//! - The client sends packet ids `0..packet_count`, one at a time, and
//!   resends an id until it sees an ack for it.
//! - Ids in the **drop-once set** are deliberately left unacknowledged the
//!   first time they arrive, forcing a retransmission.
//! - Only the **lowest not-yet-acknowledged** id decrements `remaining`.
//!   Any other in-range id is a duplicate (or early arrival) and is acked
//!   without touching the count.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility (see [`crate::handlers`]).

use std::collections::BTreeSet;

use rand::Rng;

/// Bounds for the randomly chosen number of stage-B packets.
pub const PACKET_COUNT_RANGE: std::ops::RangeInclusive<u32> = 5..=10;

/// Chunk lengths are `4 * k` for `k` in this range, i.e. 4..=40 bytes.
pub const CHUNK_WORDS_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

/// Pick a random chunk length: a multiple of 4 in `[4, 40]`.
pub fn random_chunk_len<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.random_range(CHUNK_WORDS_RANGE) * 4
}

/// What the caller should do with one inbound stage-B packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVerdict {
    /// The id is outside `0..packet_count`; drop the frame.
    OutOfRange,
    /// The id was in the drop-once set.  Send nothing.
    Withheld,
    /// The id was the next expected one and has been counted.  Ack it.
    Accepted,
    /// The id was valid but not the next expected one.  Ack it, count
    /// nothing.
    Duplicate,
}

/// Per-session stage-B state, stored in the registry under the stage-A
/// secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    /// Client id announced in the greeting; later frames must match it.
    pub client_id: u16,
    /// Total packets the client must deliver.
    pub packet_count: u32,
    /// Packets still to be counted.  Reaches zero exactly once.
    pub remaining: u32,
    /// Zero bytes following the packet id in each packet.
    pub chunk_len: u32,
    /// Ids to leave unacknowledged once.
    drop_once: BTreeSet<u32>,
}

impl TransferState {
    /// Build a state with an explicit drop-once set.
    ///
    /// Ids outside `0..packet_count` are discarded from `drop_once`.
    pub fn new(
        client_id: u16,
        packet_count: u32,
        chunk_len: u32,
        drop_once: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            client_id,
            packet_count,
            remaining: packet_count,
            chunk_len,
            drop_once: drop_once.into_iter().filter(|id| *id < packet_count).collect(),
        }
    }

    /// Draw fresh random parameters for a new session.
    ///
    /// Each packet id joins the drop-once set independently with
    /// probability `drop_rate`, clamped to `[0, 1]`; NaN counts as `0`.
    pub fn random<R: Rng + ?Sized>(client_id: u16, drop_rate: f64, rng: &mut R) -> Self {
        let packet_count = rng.random_range(PACKET_COUNT_RANGE);
        let chunk_len = random_chunk_len(rng);
        let p = if drop_rate.is_nan() {
            0.0
        } else {
            drop_rate.clamp(0.0, 1.0)
        };
        let drop_once: Vec<u32> = (0..packet_count).filter(|_| rng.random_bool(p)).collect();
        Self::new(client_id, packet_count, chunk_len, drop_once)
    }

    /// Number of ids acknowledged and counted so far.  This is also the next
    /// id that will decrement `remaining`.
    pub fn acked(&self) -> u32 {
        self.packet_count - self.remaining
    }

    /// `true` once every packet has been counted.
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Apply one inbound packet id.
    pub fn on_packet(&mut self, packet_id: u32) -> PacketVerdict {
        if packet_id >= self.packet_count {
            return PacketVerdict::OutOfRange;
        }
        if self.drop_once.remove(&packet_id) {
            return PacketVerdict::Withheld;
        }
        if !self.is_complete() && packet_id == self.acked() {
            self.remaining -= 1;
            PacketVerdict::Accepted
        } else {
            PacketVerdict::Duplicate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_packets_count_down_to_complete() {
        let mut st = TransferState::new(1, 3, 8, []);
        for id in 0..3 {
            assert_eq!(st.on_packet(id), PacketVerdict::Accepted);
        }
        assert!(st.is_complete());
        assert_eq!(st.acked(), 3);
    }

    #[test]
    fn drop_once_withholds_first_then_counts_retransmission_once() {
        let mut st = TransferState::new(1, 5, 4, [0, 2]);

        assert_eq!(st.on_packet(0), PacketVerdict::Withheld);
        assert_eq!(st.remaining, 5);

        assert_eq!(st.on_packet(0), PacketVerdict::Accepted);
        assert_eq!(st.remaining, 4);

        // The same id again is a duplicate: acked, not counted.
        assert_eq!(st.on_packet(0), PacketVerdict::Duplicate);
        assert_eq!(st.remaining, 4);
        assert_eq!(st.drop_once.iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn duplicate_of_acked_id_does_not_decrement() {
        let mut st = TransferState::new(1, 5, 4, []);
        st.on_packet(0);
        st.on_packet(1);
        assert_eq!(st.on_packet(1), PacketVerdict::Duplicate);
        assert_eq!(st.on_packet(0), PacketVerdict::Duplicate);
        assert_eq!(st.remaining, 3);
    }

    #[test]
    fn early_id_is_acked_without_counting() {
        let mut st = TransferState::new(1, 5, 4, []);
        assert_eq!(st.on_packet(3), PacketVerdict::Duplicate);
        assert_eq!(st.remaining, 5);
        assert_eq!(st.on_packet(0), PacketVerdict::Accepted);
    }

    #[test]
    fn out_of_range_id_is_rejected() {
        let mut st = TransferState::new(1, 5, 4, []);
        assert_eq!(st.on_packet(5), PacketVerdict::OutOfRange);
        assert_eq!(st.remaining, 5);
    }

    #[test]
    fn drop_set_ignores_out_of_range_ids() {
        let st = TransferState::new(1, 3, 4, [1, 7, 9]);
        assert_eq!(st.drop_once.iter().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn random_parameters_stay_in_bounds() {
        let mut rng = rand::rng();
        for _ in 0..200 {
            let st = TransferState::random(42, 0.5, &mut rng);
            assert!(PACKET_COUNT_RANGE.contains(&st.packet_count));
            assert!((4..=40).contains(&st.chunk_len));
            assert_eq!(st.chunk_len % 4, 0);
            assert_eq!(st.remaining, st.packet_count);
            assert!(st.drop_once.iter().all(|id| *id < st.packet_count));
        }
    }

    #[test]
    fn drop_rate_extremes() {
        let mut rng = rand::rng();
        let none = TransferState::random(0, 0.0, &mut rng);
        assert!(none.drop_once.is_empty());
        let all = TransferState::random(0, 1.0, &mut rng);
        assert_eq!(all.drop_once.len(), all.packet_count as usize);
    }

    #[test]
    fn nan_drop_rate_drops_nothing() {
        let st = TransferState::random(0, f64::NAN, &mut rand::rng());
        assert!(st.drop_once.is_empty());
        assert_eq!(st.remaining, st.packet_count);
    }
}
