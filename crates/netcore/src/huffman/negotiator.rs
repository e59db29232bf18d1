use super::AdaptiveHuffman;
use crate::net::protocol::sequence_greater_than;

/// Unanswered acks after which the server gives up on a pending codec swap
/// and records a new packet instead.
pub const RENEGOTIATE_DELAY: u32 = 256;

const BETA: usize = 0;
const ALPHA: usize = 1;

/// Sending half of a codec pair.
///
/// Whenever no swap is pending, a packet payload is folded into a copy of
/// the active table. Once the peer acknowledges exactly that packet the copy
/// becomes the other slot and is switched to. The receiver saw the same
/// payload, so both ends build the same table without it crossing the wire.
#[derive(Debug, Clone)]
pub struct ServerCodec {
    codecs: [AdaptiveHuffman; 2],
    tmp: AdaptiveHuffman,
    active: usize,
    last_packet_id: u32,
    last_ack_id: u32,
    missed_acks: u32,
    awaiting_ack: bool,
    generations: [u64; 2],
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCodec {
    pub fn new() -> Self {
        Self {
            codecs: [AdaptiveHuffman::new(), AdaptiveHuffman::new()],
            tmp: AdaptiveHuffman::new(),
            active: BETA,
            last_packet_id: 0,
            last_ack_id: 0,
            missed_acks: 0,
            awaiting_ack: false,
            generations: [0; 2],
        }
    }

    pub fn codec(&mut self) -> &mut AdaptiveHuffman {
        &mut self.codecs[self.active]
    }

    pub fn codec_id(&self) -> u8 {
        self.active as u8
    }

    /// Bumped every time a slot receives a new table.
    pub fn slot_generation(&self, id: u8) -> u64 {
        self.generations[(id & 1) as usize]
    }

    pub fn awaiting_packet(&self) -> Option<u32> {
        self.awaiting_ack.then_some(self.last_packet_id)
    }

    pub fn missed_acks(&self) -> u32 {
        self.missed_acks
    }

    pub fn last_ack_id(&self) -> u32 {
        self.last_ack_id
    }

    /// Returns true if `payload` was recorded as the next swap boundary.
    pub fn packet_sent(&mut self, id: u32, payload: &[u8]) -> bool {
        if self.awaiting_ack && self.missed_acks < RENEGOTIATE_DELAY {
            return false;
        }

        if self.awaiting_ack {
            log::debug!(
                "Renegotiating codec after {} missed acks for packet {}",
                self.missed_acks,
                self.last_packet_id
            );
        }

        self.last_packet_id = id;
        self.tmp = self.codecs[self.active].clone();
        self.tmp.extend(payload);
        self.awaiting_ack = true;
        true
    }

    pub fn packet_acked(&mut self, id: u32) {
        if !self.awaiting_ack {
            return;
        }

        if self.last_packet_id != id {
            if self.missed_acks < RENEGOTIATE_DELAY {
                self.missed_acks += 1;
            }
            return;
        }

        self.active ^= 1;
        self.codecs[self.active] = self.tmp.clone();
        self.generations[self.active] += 1;
        self.last_ack_id = id;
        self.awaiting_ack = false;
        self.missed_acks = 0;
        log::trace!("Codec swap to slot {} at packet {}", self.active, id);
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Receiving half of a codec pair.
///
/// The server switches slots only after it saw the ack for the recorded
/// packet, so every packet naming the new slot is newer than that packet.
/// Each slot remembers the first sequence its current table is valid for;
/// older packets were compressed with a table the slot no longer holds and
/// are refused.
#[derive(Debug, Clone)]
pub struct ClientCodec {
    codecs: [AdaptiveHuffman; 2],
    tmp: AdaptiveHuffman,
    tmp_sequence: u32,
    active: usize,
    awaiting_ackack: bool,
    installed_at: [u32; 2],
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCodec {
    pub fn new() -> Self {
        Self {
            codecs: [AdaptiveHuffman::new(), AdaptiveHuffman::new()],
            tmp: AdaptiveHuffman::new(),
            tmp_sequence: 0,
            active: BETA,
            awaiting_ackack: false,
            installed_at: [0; 2],
        }
    }

    pub fn codec_id(&self) -> u8 {
        self.active as u8
    }

    pub fn awaiting_ackack(&self) -> bool {
        self.awaiting_ackack
    }

    /// Called after acknowledging a recorded packet with its decoded payload.
    /// A newer recorded packet replaces a pending table that the server
    /// abandoned.
    pub fn ack_sent(&mut self, sequence: u32, payload: &[u8]) {
        if self.awaiting_ackack && !sequence_greater_than(sequence, self.tmp_sequence) {
            return;
        }

        self.tmp = self.codecs[self.active].clone();
        self.tmp.extend(payload);
        self.tmp_sequence = sequence;
        self.awaiting_ackack = true;
    }

    /// Codec to decode packet `sequence` that names slot `id`, or `None` if
    /// the slot has since been overwritten.
    pub fn codec_for_received(&mut self, sequence: u32, id: u8) -> Option<&mut AdaptiveHuffman> {
        let slot = if id & 1 == 1 { ALPHA } else { BETA };

        if slot != self.active
            && self.awaiting_ackack
            && sequence_greater_than(sequence, self.tmp_sequence)
        {
            self.active = slot;
            self.codecs[slot] = self.tmp.clone();
            self.installed_at[slot] = self.tmp_sequence.wrapping_add(1);
            self.awaiting_ackack = false;
            log::trace!("Codec swap to slot {} at packet {}", slot, sequence);
        }

        if sequence_greater_than(self.installed_at[slot], sequence) {
            return None;
        }

        Some(&mut self.codecs[slot])
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(seed: u8) -> Vec<u8> {
        (0..120u32).map(|i| seed.wrapping_add((i % 5) as u8)).collect()
    }

    #[test]
    fn test_refuses_while_awaiting() {
        let mut server = ServerCodec::new();
        assert!(server.packet_sent(1, &payload(1)));
        assert!(!server.packet_sent(2, &payload(2)));
        assert_eq!(server.awaiting_packet(), Some(1));
    }

    #[test]
    fn test_swap_on_matching_ack() {
        let mut server = ServerCodec::new();
        assert_eq!(server.codec_id(), 0);

        server.packet_sent(7, &payload(1));
        server.packet_acked(6);
        assert_eq!(server.codec_id(), 0);
        assert_eq!(server.missed_acks(), 1);

        server.packet_acked(7);
        assert_eq!(server.codec_id(), 1);
        assert_eq!(server.missed_acks(), 0);
        assert_eq!(server.awaiting_packet(), None);
        assert_eq!(server.slot_generation(1), 1);
    }

    #[test]
    fn test_repeated_ack_does_not_reflip() {
        let mut server = ServerCodec::new();
        server.packet_sent(3, &payload(1));
        server.packet_acked(3);
        server.packet_acked(3);
        server.packet_acked(3);
        assert_eq!(server.codec_id(), 1);
        assert_eq!(server.last_ack_id(), 3);
    }

    #[test]
    fn test_renegotiates_after_missed_acks() {
        let mut server = ServerCodec::new();
        server.packet_sent(1, &payload(1));
        for ack in 0..RENEGOTIATE_DELAY + 10 {
            server.packet_acked(ack + 100);
        }
        assert_eq!(server.missed_acks(), RENEGOTIATE_DELAY);
        assert!(server.packet_sent(400, &payload(2)));
        assert_eq!(server.awaiting_packet(), Some(400));
    }

    #[test]
    fn test_both_ends_build_same_table() {
        let mut server = ServerCodec::new();
        let mut client = ClientCodec::new();
        let first = payload(10);

        assert!(server.packet_sent(1, &first));
        let codec = client.codec_for_received(1, server.codec_id()).unwrap();
        assert!(codec.total_count() == 256);
        client.ack_sent(1, &first);
        server.packet_acked(1);

        let msg = payload(11);
        let id = server.codec_id();
        let packed = server.codec().compress(&msg, 1200).unwrap();

        let codec = client.codec_for_received(2, id).unwrap();
        assert_eq!(codec.decompress(&packed, 1200).unwrap(), msg);
        assert_eq!(client.codec_id(), 1);
        assert!(!client.awaiting_ackack());
    }

    #[test]
    fn test_client_keeps_first_pending_table() {
        let mut client = ClientCodec::new();
        client.ack_sent(5, &payload(1));
        client.ack_sent(4, &payload(2));
        assert!(client.awaiting_ackack());

        // A newer recorded packet means the server gave up on the old one.
        client.ack_sent(9, &payload(3));
        assert!(client.awaiting_ackack());
    }

    #[test]
    fn test_client_refuses_overwritten_slot() {
        let mut client = ClientCodec::new();
        client.ack_sent(1, &payload(1));
        assert!(client.codec_for_received(2, 1).is_some());

        // Second generation lands in slot 0, valid from packet 6.
        client.ack_sent(5, &payload(2));
        assert!(client.codec_for_received(10, 0).is_some());

        assert!(client.codec_for_received(4, 0).is_none());
        assert!(client.codec_for_received(6, 1).is_some());
        assert_eq!(client.codec_id(), 0);
    }

    #[test]
    fn test_stale_packet_does_not_swap() {
        let mut client = ClientCodec::new();
        client.ack_sent(1, &payload(1));
        client.codec_for_received(2, 1);
        client.ack_sent(5, &payload(2));

        // Packet 1 named slot 0 before slot 1 was installed.
        assert!(client.codec_for_received(1, 0).is_some());
        assert_eq!(client.codec_id(), 1);
        assert!(client.awaiting_ackack());
    }
}
