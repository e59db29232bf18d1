use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::protocol::{Message, MessageKind, RING_SIZE};
use super::tracking::acked_sequences;
use crate::buffer::{unvarint_size, ByteBuffer};

pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ReliableMessage {
    pub id: u16,
    pub acked: bool,
    pub last_sent: Option<Instant>,
    pub kind: MessageKind,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UnreliableMessage {
    pub kind: MessageKind,
    pub data: Vec<u8>,
}

/// What went out in one packet, so an ack can be applied without parsing
/// the payload again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub packet_id: u32,
    pub size: usize,
    pub reliable_ids: Vec<u16>,
    pub unreliable_count: usize,
    pub skip: Option<u16>,
}

pub fn reliable_entry_size(len: usize) -> usize {
    1 + 2 + unvarint_size(len as u32) + len
}

pub fn unreliable_entry_size(len: usize) -> usize {
    1 + unvarint_size(len as u32) + len
}

/// Per-connection send queue.
///
/// Reliable messages get consecutive 16-bit ids and live in a ring of
/// `RING_SIZE` slots until acknowledged. Queueing past a full ring evicts
/// the oldest unacknowledged message for good: the channel counts it and
/// announces the new floor to the receiver in a `SKIP` message, and the
/// application is expected to resync the peer with a full snapshot.
#[derive(Debug)]
pub struct ReliableChannel {
    reliable: Vec<Option<ReliableMessage>>,
    unreliable: VecDeque<UnreliableMessage>,
    sent_packets: Vec<Option<SentPacket>>,
    next_reliable_id: u16,
    reliable_no_ack: u16,
    next_packet_id: u32,
    skip_floor: Option<u16>,
    budget: usize,
    resend_interval: Duration,
    evicted_count: u64,
    overflowed: bool,
}

impl ReliableChannel {
    /// `budget` is the largest payload one packet may carry.
    pub fn new(budget: usize, resend_interval: Duration) -> Self {
        Self {
            reliable: vec![None; RING_SIZE],
            unreliable: VecDeque::with_capacity(64),
            sent_packets: vec![None; RING_SIZE],
            next_reliable_id: 0,
            reliable_no_ack: 0,
            next_packet_id: 1,
            skip_floor: None,
            budget,
            resend_interval,
            evicted_count: 0,
            overflowed: false,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn next_packet_id(&self) -> u32 {
        self.next_packet_id
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted_count
    }

    /// Set once a reliable message too large for any packet was queued.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Reliable messages queued and not yet acknowledged.
    pub fn pending_reliable(&self) -> usize {
        self.next_reliable_id.wrapping_sub(self.reliable_no_ack) as usize
    }

    pub fn pending_unreliable(&self) -> usize {
        self.unreliable.len()
    }

    pub fn skip_floor(&self) -> Option<u16> {
        self.skip_floor
    }

    pub fn reliable_message(&self, id: u16) -> Option<&ReliableMessage> {
        self.reliable[id as usize % RING_SIZE]
            .as_ref()
            .filter(|msg| msg.id == id)
    }

    pub fn sent_packet(&self, packet_id: u32) -> Option<&SentPacket> {
        self.sent_packets[packet_id as usize % RING_SIZE]
            .as_ref()
            .filter(|p| p.packet_id == packet_id)
    }

    pub fn queue_reliable(&mut self, msg: Message) -> u16 {
        let id = self.next_reliable_id;

        if self.pending_reliable() >= RING_SIZE {
            let evicted = self.reliable_no_ack;
            self.evicted_count += 1;
            self.reliable_no_ack = evicted.wrapping_add(1);
            self.advance_no_ack();
            self.skip_floor = Some(self.reliable_no_ack);
            log::warn!(
                "Reliable message {} evicted before it was acknowledged ({} total)",
                evicted,
                self.evicted_count
            );
        }

        if reliable_entry_size(msg.data.len()) > self.budget {
            self.overflowed = true;
            log::warn!(
                "Reliable message {} of {} bytes can never fit in a packet",
                id,
                msg.data.len()
            );
        }

        self.reliable[id as usize % RING_SIZE] = Some(ReliableMessage {
            id,
            acked: false,
            last_sent: None,
            kind: msg.kind,
            data: msg.data,
        });
        self.next_reliable_id = id.wrapping_add(1);
        id
    }

    pub fn queue_unreliable(&mut self, msg: Message) {
        if self.unreliable.len() >= RING_SIZE {
            self.unreliable.pop_front();
        }
        self.unreliable.push_back(UnreliableMessage {
            kind: msg.kind,
            data: msg.data,
        });
    }

    /// Fills `buf` with due reliable messages, then unreliable ones if
    /// `allow_unreliable`. Returns the packet id, or `None` when there was
    /// nothing to send. Unreliable messages that were written leave the
    /// queue; reliable ones stay until acknowledged and are resent once
    /// the resend interval has passed.
    pub fn write_packet(
        &mut self,
        buf: &mut ByteBuffer,
        now: Instant,
        allow_unreliable: bool,
    ) -> Option<u32> {
        buf.clear();
        let limit = buf.capacity().min(self.budget);

        let mut sent = SentPacket {
            packet_id: self.next_packet_id,
            size: 0,
            reliable_ids: Vec::new(),
            unreliable_count: 0,
            skip: None,
        };

        if let Some(floor) = self.skip_floor {
            write_unreliable_entry(buf, MessageKind::SKIP, &floor.to_le_bytes());
            sent.skip = Some(floor);
        }

        let mut id = self.reliable_no_ack;
        while id != self.next_reliable_id {
            let slot = &mut self.reliable[id as usize % RING_SIZE];
            if let Some(msg) = slot.as_mut().filter(|m| m.id == id && !m.acked) {
                let due = msg
                    .last_sent
                    .is_none_or(|t| now.duration_since(t) >= self.resend_interval);

                if due {
                    if buf.len() + reliable_entry_size(msg.data.len()) > limit {
                        break;
                    }
                    write_reliable_entry(buf, msg.kind, msg.id, &msg.data);
                    msg.last_sent = Some(now);
                    sent.reliable_ids.push(id);
                }
            }
            id = id.wrapping_add(1);
        }

        if allow_unreliable {
            while let Some(msg) = self.unreliable.front() {
                let size = unreliable_entry_size(msg.data.len());
                if size > self.budget {
                    log::warn!("Dropping unreliable message of {} bytes", msg.data.len());
                    self.unreliable.pop_front();
                    continue;
                }
                if buf.len() + size > limit {
                    break;
                }
                write_unreliable_entry(buf, msg.kind, &msg.data);
                self.unreliable.pop_front();
                sent.unreliable_count += 1;
            }
        }

        if sent.reliable_ids.is_empty() && sent.unreliable_count == 0 && sent.skip.is_none() {
            return None;
        }

        let packet_id = sent.packet_id;
        sent.size = buf.len();
        self.sent_packets[packet_id as usize % RING_SIZE] = Some(sent);
        self.next_packet_id = packet_id.wrapping_add(1);
        Some(packet_id)
    }

    /// Marks the messages of every packet covered by `(ack, ack_bits)` as
    /// delivered. Returns false for an empty acknowledgement.
    pub fn client_ack(&mut self, ack: u32, ack_bits: u32) -> bool {
        if ack == 0 && ack_bits == 0 {
            return false;
        }

        for seq in acked_sequences(ack, ack_bits) {
            let slot = &mut self.sent_packets[seq as usize % RING_SIZE];
            let Some(packet) = slot.take_if(|p| p.packet_id == seq) else {
                continue;
            };

            for rid in packet.reliable_ids {
                if let Some(msg) = self.reliable[rid as usize % RING_SIZE]
                    .as_mut()
                    .filter(|m| m.id == rid)
                {
                    msg.acked = true;
                }
            }

            if packet.skip.is_some() && packet.skip == self.skip_floor {
                self.skip_floor = None;
            }
        }

        self.advance_no_ack();
        true
    }

    fn advance_no_ack(&mut self) {
        while self.reliable_no_ack != self.next_reliable_id {
            let id = self.reliable_no_ack;
            match &self.reliable[id as usize % RING_SIZE] {
                Some(msg) if msg.id == id && !msg.acked => break,
                _ => self.reliable_no_ack = id.wrapping_add(1),
            }
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.budget, self.resend_interval);
    }
}

fn write_reliable_entry(buf: &mut ByteBuffer, kind: MessageKind, id: u16, data: &[u8]) {
    buf.write_byte(kind.header(true));
    buf.write_u16(id);
    buf.write_unvarint(data.len() as u32);
    buf.write_chunk(data);
}

pub fn write_unreliable_entry(buf: &mut ByteBuffer, kind: MessageKind, data: &[u8]) {
    buf.write_byte(kind.header(false));
    buf.write_unvarint(data.len() as u32);
    buf.write_chunk(data);
}

/// Puts reliable messages back in the order they were queued.
///
/// Messages are buffered by id until every earlier id has arrived. A floor
/// announced by the sender releases whatever was buffered below it and
/// counts the holes as lost.
#[derive(Debug)]
pub struct ReliableReceiver {
    next_expected: u16,
    slots: Vec<Option<(u16, Message)>>,
    ready: VecDeque<Message>,
    lost: u64,
}

impl Default for ReliableReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableReceiver {
    pub fn new() -> Self {
        Self {
            next_expected: 0,
            slots: vec![None; RING_SIZE],
            ready: VecDeque::new(),
            lost: 0,
        }
    }

    pub fn next_expected(&self) -> u16 {
        self.next_expected
    }

    pub fn lost_count(&self) -> u64 {
        self.lost
    }

    /// Returns false for a duplicate or an id outside the window.
    pub fn receive(&mut self, id: u16, msg: Message) -> bool {
        let ahead = id.wrapping_sub(self.next_expected) as usize;
        if ahead >= RING_SIZE {
            return false;
        }

        let slot = &mut self.slots[id as usize % RING_SIZE];
        if slot.as_ref().is_some_and(|(sid, _)| *sid == id) {
            return false;
        }

        *slot = Some((id, msg));
        self.collect();
        true
    }

    /// Moves the window to `floor`. Returns how many ids below it never
    /// arrived.
    pub fn skip_to(&mut self, floor: u16) -> u64 {
        let ahead = floor.wrapping_sub(self.next_expected);
        if ahead == 0 || ahead > u16::MAX / 2 {
            return 0;
        }

        let mut lost = 0;
        let mut id = self.next_expected;
        while id != floor {
            match self.slots[id as usize % RING_SIZE].take() {
                Some((sid, msg)) if sid == id => self.ready.push_back(msg),
                other => {
                    self.slots[id as usize % RING_SIZE] = other;
                    lost += 1;
                }
            }
            id = id.wrapping_add(1);
        }

        self.next_expected = floor;
        self.lost += lost;
        self.collect();

        if lost > 0 {
            log::warn!("Lost {} reliable messages, skipping to {}", lost, floor);
        }
        lost
    }

    fn collect(&mut self) {
        loop {
            let slot = &mut self.slots[self.next_expected as usize % RING_SIZE];
            match slot.take() {
                Some((sid, msg)) if sid == self.next_expected => {
                    self.ready.push_back(msg);
                    self.next_expected = self.next_expected.wrapping_add(1);
                }
                other => {
                    *slot = other;
                    break;
                }
            }
        }
    }

    /// Messages ready for the application, in order.
    pub fn drain(&mut self) -> Vec<Message> {
        self.ready.drain(..).collect()
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
