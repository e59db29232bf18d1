use std::collections::VecDeque;
use std::time::Instant;

use super::protocol::sequence_greater_than;

/// Sequences an `(ack, ack_bits)` pair reports as received, newest first.
/// Bit `i - 1` of `ack_bits` stands for `ack - i`.
pub fn acked_sequences(ack: u32, ack_bits: u32) -> impl Iterator<Item = u32> {
    std::iter::once(ack).chain(
        (1..=32u32)
            .filter(move |i| ack_bits & (1 << (i - 1)) != 0)
            .map(move |i| ack.wrapping_sub(i)),
    )
}

/// Whether `sequence`, older than `ack`, is reported as received.
pub fn is_acked(ack: u32, ack_bits: u32, sequence: u32) -> bool {
    if sequence == ack {
        return true;
    }
    if !sequence_greater_than(ack, sequence) {
        return false;
    }
    let diff = ack.wrapping_sub(sequence);
    diff <= 32 && ack_bits & (1 << (diff - 1)) != 0
}

#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub sequence: u32,
    pub send_time: Instant,
    pub acked: bool,
}

/// Round trip estimate from acknowledged packets.
#[derive(Debug)]
pub struct AckTracker {
    pending: VecDeque<PendingPacket>,
    max_pending: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            max_pending,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    pub fn track_packet(&mut self, sequence: u32, now: Instant) {
        while self.pending.len() >= self.max_pending {
            self.pending.pop_front();
        }

        self.pending.push_back(PendingPacket {
            sequence,
            send_time: now,
            acked: false,
        });
    }

    pub fn process_ack(&mut self, ack: u32, ack_bits: u32, now: Instant) -> Vec<u32> {
        let mut acked_sequences = Vec::new();
        let mut rtt_samples = Vec::new();

        for pending in &mut self.pending {
            if pending.acked || !is_acked(ack, ack_bits, pending.sequence) {
                continue;
            }

            pending.acked = true;
            acked_sequences.push(pending.sequence);
            rtt_samples.push(now.duration_since(pending.send_time).as_secs_f32() * 1000.0);
        }

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }

        while self.pending.front().is_some_and(|p| p.acked) {
            self.pending.pop_front();
        }

        acked_sequences
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.iter().filter(|p| !p.acked).count()
    }
}

/// Receive side of packet acknowledgement: the newest sequence seen, a
/// bitfield of the 32 before it, and a short memory for duplicates.
#[derive(Debug)]
pub struct ReceiveTracker {
    last_received: u32,
    received_bitfield: u32,
    recent_sequences: VecDeque<u32>,
    max_recent: usize,
    received_any: bool,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            last_received: 0,
            received_bitfield: 0,
            recent_sequences: VecDeque::with_capacity(128),
            max_recent: 128,
            received_any: false,
        }
    }

    /// Returns false for a duplicate.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        if self.recent_sequences.contains(&sequence) {
            return false;
        }

        if self.recent_sequences.len() >= self.max_recent {
            self.recent_sequences.pop_front();
        }
        self.recent_sequences.push_back(sequence);

        if !self.received_any {
            self.received_any = true;
            self.last_received = sequence;
            self.received_bitfield = 0;
        } else if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            self.received_bitfield = match self.received_bitfield.checked_shl(diff) {
                Some(shifted) if diff <= 32 => shifted | (1 << (diff - 1)),
                _ if diff == 32 => 1 << 31,
                _ => 0,
            };
            self.last_received = sequence;
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 0 && diff <= 32 {
                self.received_bitfield |= 1 << (diff - 1);
            }
        }

        true
    }

    pub fn is_duplicate(&self, sequence: u32) -> bool {
        self.recent_sequences.contains(&sequence)
    }

    pub fn last_received(&self) -> u32 {
        self.last_received
    }

    pub fn received_any(&self) -> bool {
        self.received_any
    }

    /// True if `sequence` is older than the newest packet seen.
    pub fn is_stale(&self, sequence: u32) -> bool {
        sequence_greater_than(self.last_received, sequence)
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bitfield)
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_receive_tracker_bitfield() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(1);
        tracker.record_received(2);
        tracker.record_received(3);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
        assert!(is_acked(ack, bitfield, 1));
        assert!(!is_acked(ack, bitfield, 0));
    }

    #[test]
    fn test_receive_tracker_out_of_order() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(3);
        tracker.record_received(1);
        tracker.record_received(2);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
        assert!(tracker.is_stale(2));
    }

    #[test]
    fn test_receive_tracker_gap() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(1);
        tracker.record_received(4);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 4);
        assert_eq!(acked_sequences(ack, bitfield).collect::<Vec<_>>(), vec![4, 1]);
        assert!(!is_acked(ack, bitfield, 2));
        assert!(!is_acked(ack, bitfield, 3));
    }

    #[test]
    fn test_receive_tracker_long_gap() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(1);
        tracker.record_received(33);
        assert_eq!(tracker.ack_data(), (33, 1 << 31));

        tracker.record_received(100);
        assert_eq!(tracker.ack_data(), (100, 0));
    }

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = ReceiveTracker::new();

        assert!(tracker.record_received(1));
        assert!(tracker.is_duplicate(1));
        assert!(!tracker.record_received(1));
        assert!(tracker.record_received(2));
    }

    #[test]
    fn test_ack_tracker_rtt() {
        let mut tracker = AckTracker::new(32);
        let start = Instant::now();

        tracker.track_packet(1, start);
        tracker.track_packet(2, start);
        let acked = tracker.process_ack(2, 0b1, start + Duration::from_millis(40));

        assert_eq!(acked, vec![1, 2]);
        assert!(tracker.srtt() < 100.0);
        assert_eq!(tracker.unacked_count(), 0);
    }
}
