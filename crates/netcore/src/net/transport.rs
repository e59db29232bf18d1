use std::borrow::Cow;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::channel::{
    unreliable_entry_size, write_unreliable_entry, ReliableChannel, ReliableReceiver,
    DEFAULT_RESEND_INTERVAL,
};
use super::history::PacketHistory;
use super::protocol::{
    sequence_greater_than, Message, MessageKind, MessageRegistry, PacketError, PacketFlags,
    MAX_PACKET_SIZE, OLD_PACKET_SLOTS, PACKET_HEADER_SIZE, TICRATE,
};
use super::stats::NetworkStats;
use super::tracking::{is_acked, AckTracker, ReceiveTracker};
use crate::buffer::ByteBuffer;
use crate::huffman::{ClientCodec, ServerCodec};

/// Largest uncompressed payload behind the packet header.
pub const PAYLOAD_BUDGET: usize = MAX_PACKET_SIZE - PACKET_HEADER_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("reliable message can never fit in a packet")]
    ReliableOverflow,
    #[error(transparent)]
    Packet(#[from] PacketError),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Outgoing limit for unreliable data in KB/s.
    pub max_rate: u32,
    pub compression: bool,
    pub resend_interval: Duration,
    pub ticrate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_rate: 200,
            compression: true,
            resend_interval: DEFAULT_RESEND_INTERVAL,
            ticrate: TICRATE,
        }
    }
}

/// Bytes sent within the current one second window of tics.
#[derive(Debug, Clone)]
pub struct RateMeter {
    ticrate: u64,
    window_start: u64,
    bytes: u64,
}

impl RateMeter {
    pub fn new(ticrate: u32) -> Self {
        Self {
            ticrate: ticrate.max(1) as u64,
            window_start: 0,
            bytes: 0,
        }
    }

    fn in_window(&self, tic: u64) -> bool {
        tic >= self.window_start && tic < self.window_start + self.ticrate
    }

    pub fn record(&mut self, tic: u64, bytes: usize) {
        if !self.in_window(tic) {
            self.window_start = tic - tic % self.ticrate;
            self.bytes = 0;
        }
        self.bytes += bytes as u64;
    }

    /// Rate extrapolated from the part of the window that has passed.
    pub fn bytes_per_second(&self, tic: u64) -> u64 {
        if !self.in_window(tic) {
            return 0;
        }
        let elapsed = tic - self.window_start + 1;
        self.bytes * self.ticrate / elapsed
    }

    pub fn allows(&self, tic: u64, max_rate: u32) -> bool {
        self.bytes_per_second(tic) < max_rate as u64 * 1000
    }
}

#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Datagrams to send again, unchanged, oldest first.
    pub replays: Vec<Vec<u8>>,
    /// A lost packet is no longer in the history; the peer needs a full
    /// snapshot.
    pub resync: bool,
}

#[derive(Debug, Default)]
pub struct ServerReceived {
    pub sequence: u32,
    pub messages: Vec<Message>,
    pub replays: Vec<Vec<u8>>,
    pub resync: bool,
}

#[derive(Debug, Default)]
pub struct ClientReceived {
    pub sequence: u32,
    pub messages: Vec<Message>,
    /// Reliable messages the server evicted before this client got them.
    pub lost: u64,
}

enum Entry {
    Reliable { id: u16, msg: Message },
    Unreliable(Message),
}

fn write_header(out: &mut Vec<u8>, sequence: u32, flags: PacketFlags) {
    out.extend_from_slice(&sequence.to_le_bytes());
    out.push(flags.bits());
}

fn read_header(data: &[u8]) -> Result<(u32, PacketFlags, &[u8]), PacketError> {
    if data.len() < PACKET_HEADER_SIZE {
        return Err(PacketError::Truncated);
    }
    let sequence = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let flags = PacketFlags::from_bits_truncate(data[4]);
    Ok((sequence, flags, &data[PACKET_HEADER_SIZE..]))
}

fn parse_entries(payload: &[u8], registry: &MessageRegistry) -> Result<Vec<Entry>, PacketError> {
    let mut buf = ByteBuffer::from_bytes(payload);
    let mut entries = Vec::new();

    while buf.bytes_left() > 0 {
        let header = buf.read_byte().ok_or(PacketError::Truncated)?;
        let (desc, reliable) = registry
            .resolve(header)
            .ok_or(PacketError::UnknownMessage(header))?;

        let id = if reliable {
            Some(buf.read_u16().ok_or(PacketError::Malformed(desc.name))?)
        } else {
            None
        };
        let len = buf.read_unvarint().ok_or(PacketError::Malformed(desc.name))?;
        let data = buf
            .read_chunk(len as usize)
            .ok_or(PacketError::Malformed(desc.name))?;

        let msg = Message {
            kind: desc.kind,
            data,
        };
        entries.push(match id {
            Some(id) => Entry::Reliable { id, msg },
            None => Entry::Unreliable(msg),
        });
    }

    Ok(entries)
}

/// Server side of one client connection.
///
/// Each tic `send_packet` drains the channel into at most one datagram,
/// compresses the payload with the negotiated codec when that makes it
/// smaller, and keeps the datagram for verbatim replay. Acknowledgements
/// from the client release reliable messages, drive the codec swap, and
/// replay every packet the client reports missing.
#[derive(Debug)]
pub struct ServerTransport {
    config: TransportConfig,
    channel: ReliableChannel,
    history: PacketHistory,
    codec: ServerCodec,
    rate: RateMeter,
    acks: AckTracker,
    incoming: ReceiveTracker,
    payload: ByteBuffer,
    last_acked: u32,
    stats: NetworkStats,
}

impl ServerTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            channel: ReliableChannel::new(PAYLOAD_BUDGET, config.resend_interval),
            history: PacketHistory::new(),
            codec: ServerCodec::new(),
            rate: RateMeter::new(config.ticrate),
            acks: AckTracker::new(64),
            incoming: ReceiveTracker::new(),
            payload: ByteBuffer::new(PAYLOAD_BUDGET),
            last_acked: 0,
            stats: NetworkStats::default(),
            config,
        }
    }

    pub fn channel(&self) -> &ReliableChannel {
        &self.channel
    }

    pub fn codec(&self) -> &ServerCodec {
        &self.codec
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn last_acked(&self) -> u32 {
        self.last_acked
    }

    pub fn queue_reliable(&mut self, msg: Message) -> u16 {
        self.channel.queue_reliable(msg)
    }

    pub fn queue_unreliable(&mut self, msg: Message) {
        self.channel.queue_unreliable(msg);
    }

    /// Builds this tic's datagram. `Ok(None)` when there is nothing to send.
    pub fn send_packet(&mut self, tic: u64, now: Instant) -> Result<Option<Vec<u8>>, TransportError> {
        if self.channel.overflowed() {
            return Err(TransportError::ReliableOverflow);
        }

        let allow_unreliable = self.rate.allows(tic, self.config.max_rate);
        let Some(sequence) = self
            .channel
            .write_packet(&mut self.payload, now, allow_unreliable)
        else {
            return Ok(None);
        };

        let raw = self.payload.as_slice();
        let mut flags = PacketFlags::empty();
        let mut body = Cow::Borrowed(raw);
        let mut codec_slot = None;

        if self.config.compression {
            let id = self.codec.codec_id();
            flags.set(PacketFlags::CODEC_SELECT, id == 1);

            match self.codec.codec().compress(raw, PAYLOAD_BUDGET) {
                Ok(packed) if packed.len() < raw.len() => {
                    self.stats.bytes_saved += (raw.len() - packed.len()) as u64;
                    self.stats.packets_compressed += 1;
                    flags |= PacketFlags::COMPRESSED;
                    body = Cow::Owned(packed);
                }
                _ => {}
            }

            codec_slot = Some((id, self.codec.slot_generation(id)));
            if self.codec.packet_sent(sequence, raw) {
                flags |= PacketFlags::RECORD;
            }
        }

        let mut datagram = Vec::with_capacity(PACKET_HEADER_SIZE + body.len());
        write_header(&mut datagram, sequence, flags);
        datagram.extend_from_slice(&body);

        self.history.record(sequence, &datagram, codec_slot);
        self.rate.record(tic, datagram.len());
        self.acks.track_packet(sequence, now);
        self.stats.record_sent(datagram.len());

        Ok(Some(datagram))
    }

    /// Applies an acknowledgement from the client.
    ///
    /// Every sequence between the previous ack and this one that the bits
    /// do not cover is replayed from the history. If one of them has been
    /// overwritten the repair stops and a resync is requested instead.
    pub fn acknowledge(&mut self, ack: u32, ack_bits: u32, now: Instant) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        if !self.channel.client_ack(ack, ack_bits) {
            return outcome;
        }

        match self.codec.awaiting_packet() {
            Some(pending) if is_acked(ack, ack_bits, pending) => self.codec.packet_acked(pending),
            _ => self.codec.packet_acked(ack),
        }

        self.acks.process_ack(ack, ack_bits, now);
        self.stats.rtt_ms = self.acks.srtt();
        self.stats.rtt_variance = self.acks.rtt_var();

        if !sequence_greater_than(ack, self.last_acked) {
            return outcome;
        }

        if ack.wrapping_sub(self.last_acked) as usize > OLD_PACKET_SLOTS {
            log::warn!(
                "Ack jumped from {} to {}, past the replay history",
                self.last_acked,
                ack
            );
            outcome.resync = true;
        } else {
            let mut seq = self.last_acked.wrapping_add(1);
            while seq != ack {
                if !is_acked(ack, ack_bits, seq) {
                    self.stats.packets_lost += 1;
                    match self.history.get(seq) {
                        Some(old) if self.replayable(old.codec) => {
                            outcome.replays.push(old.data.clone());
                            self.stats.packets_resent += 1;
                        }
                        Some(_) => {
                            log::debug!("Not replaying packet {}, its codec slot was replaced", seq);
                        }
                        None => {
                            log::warn!("Packet {} no longer in replay history", seq);
                            outcome.resync = true;
                            break;
                        }
                    }
                }
                seq = seq.wrapping_add(1);
            }
        }

        self.last_acked = ack;
        outcome
    }

    fn replayable(&self, codec: Option<(u8, u64)>) -> bool {
        codec.is_none_or(|(id, generation)| self.codec.slot_generation(id) == generation)
    }

    /// Parses a datagram from the client and applies its ack. Duplicates
    /// yield `Ok(None)`.
    pub fn receive_packet(
        &mut self,
        data: &[u8],
        registry: &MessageRegistry,
        now: Instant,
    ) -> Result<Option<ServerReceived>, PacketError> {
        let (sequence, _flags, body) = read_header(data)?;
        if self.incoming.is_duplicate(sequence) {
            return Ok(None);
        }

        let entries = parse_entries(body, registry)?;
        self.incoming.record_received(sequence);
        self.stats.record_received(data.len());

        let mut received = ServerReceived {
            sequence,
            ..Default::default()
        };

        for entry in entries {
            let msg = match entry {
                Entry::Reliable { msg, .. } | Entry::Unreliable(msg) => msg,
            };

            if msg.kind == MessageKind::ACK {
                let mut buf = ByteBuffer::from_bytes(&msg.data);
                let (Some(ack), Some(bits)) = (buf.read_u32(), buf.read_u32()) else {
                    return Err(PacketError::Malformed("ack"));
                };
                let outcome = self.acknowledge(ack, bits, now);
                received.replays.extend(outcome.replays);
                received.resync |= outcome.resync;
            } else {
                received.messages.push(msg);
            }
        }

        Ok(Some(received))
    }
}

/// Client side of the connection to the server.
///
/// Incoming packets are decompressed with the codec slot they name, their
/// reliable messages are put back in order, and unreliable ones from
/// packets older than the newest seen are dropped. Outgoing packets always
/// start with an ack of what has arrived so far.
#[derive(Debug)]
pub struct ClientTransport {
    codec: ClientCodec,
    tracker: ReceiveTracker,
    receiver: ReliableReceiver,
    outgoing: VecDeque<Message>,
    next_sequence: u32,
    resync_pending: bool,
    stats: NetworkStats,
}

impl Default for ClientTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientTransport {
    pub fn new() -> Self {
        Self {
            codec: ClientCodec::new(),
            tracker: ReceiveTracker::new(),
            receiver: ReliableReceiver::new(),
            outgoing: VecDeque::new(),
            next_sequence: 1,
            resync_pending: false,
            stats: NetworkStats::default(),
        }
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn codec(&self) -> &ClientCodec {
        &self.codec
    }

    pub fn receiver(&self) -> &ReliableReceiver {
        &self.receiver
    }

    pub fn ack_data(&self) -> (u32, u32) {
        self.tracker.ack_data()
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_pending
    }

    pub fn request_resync(&mut self) {
        self.resync_pending = true;
    }

    pub fn queue(&mut self, msg: Message) {
        self.outgoing.push_back(msg);
    }

    pub fn has_queued(&self) -> bool {
        !self.outgoing.is_empty() || self.resync_pending
    }

    /// Parses a datagram from the server. Duplicates yield `Ok(None)`. A
    /// failure on the newest packet so far schedules a resync request.
    pub fn receive_packet(
        &mut self,
        data: &[u8],
        registry: &MessageRegistry,
    ) -> Result<Option<ClientReceived>, PacketError> {
        let (sequence, flags, body) = read_header(data)?;
        if self.tracker.is_duplicate(sequence) {
            return Ok(None);
        }

        let newest = !self.tracker.received_any()
            || sequence_greater_than(sequence, self.tracker.last_received());

        let (payload, stale_codec) = match self.decode_payload(sequence, flags, body) {
            Ok(decoded) => decoded,
            Err(e) => {
                if newest {
                    self.resync_pending = true;
                }
                return Err(e);
            }
        };

        let entries = match parse_entries(&payload, registry) {
            Ok(entries) => entries,
            Err(e) => {
                if newest {
                    self.resync_pending = true;
                }
                return Err(e);
            }
        };

        let mut unreliables = Vec::new();
        let mut lost = 0;

        for entry in entries {
            match entry {
                Entry::Reliable { id, msg } => {
                    self.receiver.receive(id, msg);
                }
                Entry::Unreliable(msg) if msg.kind == MessageKind::SKIP => {
                    let floor = match msg.data.as_slice() {
                        [lo, hi] => u16::from_le_bytes([*lo, *hi]),
                        _ => return Err(PacketError::Malformed("skip")),
                    };
                    lost += self.receiver.skip_to(floor);
                }
                Entry::Unreliable(msg) if newest => unreliables.push(msg),
                Entry::Unreliable(_) => {}
            }
        }

        self.tracker.record_received(sequence);
        self.stats.record_received(data.len());

        if flags.contains(PacketFlags::RECORD) && !stale_codec {
            self.codec.ack_sent(sequence, &payload);
        }

        if lost > 0 {
            self.resync_pending = true;
        }

        let mut messages = self.receiver.drain();
        messages.extend(unreliables);

        Ok(Some(ClientReceived {
            sequence,
            messages,
            lost,
        }))
    }

    fn decode_payload(
        &mut self,
        sequence: u32,
        flags: PacketFlags,
        body: &[u8],
    ) -> Result<(Vec<u8>, bool), PacketError> {
        if !flags.intersects(PacketFlags::COMPRESSED | PacketFlags::RECORD) {
            return Ok((body.to_vec(), false));
        }

        let id = flags.contains(PacketFlags::CODEC_SELECT) as u8;
        let codec = self.codec.codec_for_received(sequence, id);
        let stale = codec.is_none();

        if !flags.contains(PacketFlags::COMPRESSED) {
            return Ok((body.to_vec(), stale));
        }

        let codec = codec.ok_or(PacketError::StaleCodec(id))?;
        let payload = codec.decompress(body, MAX_PACKET_SIZE)?;
        Ok((payload, false))
    }

    /// Builds the next datagram: ack, pending resync request, then as many
    /// queued messages as fit.
    pub fn write_packet(&mut self) -> Vec<u8> {
        let mut buf = ByteBuffer::new(MAX_PACKET_SIZE);
        buf.write_u32(self.next_sequence);
        buf.write_byte(PacketFlags::empty().bits());

        let (ack, bits) = self.tracker.ack_data();
        let mut ack_data = [0u8; 8];
        ack_data[..4].copy_from_slice(&ack.to_le_bytes());
        ack_data[4..].copy_from_slice(&bits.to_le_bytes());
        write_unreliable_entry(&mut buf, MessageKind::ACK, &ack_data);

        if self.resync_pending {
            write_unreliable_entry(&mut buf, MessageKind::RESYNC_REQUEST, &[]);
            self.resync_pending = false;
        }

        while let Some(msg) = self.outgoing.front() {
            let size = unreliable_entry_size(msg.data.len());
            if size > PAYLOAD_BUDGET {
                log::warn!("Dropping outgoing message of {} bytes", msg.data.len());
                self.outgoing.pop_front();
                continue;
            }
            if buf.len() + size > MAX_PACKET_SIZE {
                break;
            }
            write_unreliable_entry(&mut buf, msg.kind, &msg.data);
            self.outgoing.pop_front();
        }

        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.stats.record_sent(buf.len());
        buf.as_slice().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry.register(20, "chat").unwrap();
        registry
    }

    fn chat(n: u32) -> Message {
        Message::new(MessageKind(20), n.to_le_bytes().to_vec())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_nothing_queued_sends_nothing() {
        let mut tx = ServerTransport::new(TransportConfig::default());
        assert!(tx.send_packet(0, Instant::now()).unwrap().is_none());
    }

    #[test]
    fn test_replays_missing_packets_verbatim() {
        let mut tx = ServerTransport::new(TransportConfig::default());
        let now = Instant::now();

        let mut sent = Vec::new();
        for n in 0..5 {
            tx.queue_reliable(chat(n));
            sent.push(tx.send_packet(n as u64, now).unwrap().unwrap());
        }

        let outcome = tx.acknowledge(5, 0, now);
        assert!(!outcome.resync);
        assert_eq!(outcome.replays, sent[..4].to_vec());
        assert_eq!(tx.last_acked(), 5);

        // Already repaired.
        let outcome = tx.acknowledge(5, 0, now);
        assert!(outcome.replays.is_empty());
    }

    #[test]
    fn test_ack_bits_suppress_replay() {
        let mut tx = ServerTransport::new(TransportConfig::default());
        let now = Instant::now();

        let mut sent = Vec::new();
        for n in 0..4 {
            tx.queue_reliable(chat(n));
            sent.push(tx.send_packet(n as u64, now).unwrap().unwrap());
        }

        // Packets 1 and 3 arrived, 2 did not.
        let outcome = tx.acknowledge(4, 0b101, now);
        assert_eq!(outcome.replays, vec![sent[1].clone()]);
    }

    #[test]
    fn test_wrapped_history_forces_resync() {
        let mut tx = ServerTransport::new(TransportConfig::default());
        let now = Instant::now();

        for n in 0..300u32 {
            tx.queue_unreliable(chat(n));
            tx.send_packet(n as u64, now).unwrap().unwrap();
        }

        let outcome = tx.acknowledge(300, 0, now);
        assert!(outcome.resync);
    }

    #[test]
    fn test_reliable_overflow_is_fatal() {
        let mut tx = ServerTransport::new(TransportConfig::default());
        tx.queue_reliable(Message::new(MessageKind(20), vec![0u8; PAYLOAD_BUDGET]));
        assert!(matches!(
            tx.send_packet(0, Instant::now()),
            Err(TransportError::ReliableOverflow)
        ));
    }

    #[test]
    fn test_rate_limit_holds_unreliables() {
        let config = TransportConfig {
            max_rate: 1,
            ..Default::default()
        };
        let mut tx = ServerTransport::new(config);
        let now = Instant::now();

        tx.queue_unreliable(Message::new(MessageKind(20), vec![1u8; 600]));
        assert!(tx.send_packet(0, now).unwrap().is_some());

        tx.queue_unreliable(Message::new(MessageKind(20), vec![1u8; 600]));
        assert!(tx.send_packet(1, now).unwrap().is_none());
        assert_eq!(tx.channel().pending_unreliable(), 1);

        assert!(tx.send_packet(35, now).unwrap().is_some());
    }

    #[test]
    fn test_rate_meter_window() {
        let mut meter = RateMeter::new(35);
        meter.record(0, 1000);
        assert_eq!(meter.bytes_per_second(0), 35000);
        assert_eq!(meter.bytes_per_second(34), 1000);
        assert_eq!(meter.bytes_per_second(35), 0);
        assert!(meter.allows(34, 2));
        assert!(!meter.allows(0, 35));
    }

    #[test]
    fn test_compressed_session() {
        let registry = registry();
        let mut server = ServerTransport::new(TransportConfig::default());
        let mut client = ClientTransport::new();
        let start = Instant::now();
        let msg = Message::new(
            MessageKind(20),
            b"the quick brown fox jumps over the lazy dog ".repeat(5),
        );

        for tic in 0..10u64 {
            let now = start + ms(tic * 30);
            server.queue_reliable(msg.clone());
            let datagram = server.send_packet(tic, now).unwrap().unwrap();

            let received = client.receive_packet(&datagram, &registry).unwrap().unwrap();
            assert_eq!(received.messages, vec![msg.clone()]);

            let reply = client.write_packet();
            let back = server.receive_packet(&reply, &registry, now).unwrap().unwrap();
            assert!(back.replays.is_empty());
            assert!(back.messages.is_empty());
        }

        assert!(server.stats().packets_compressed >= 8);
        assert!(server.stats().bytes_saved > 0);
        assert_eq!(server.channel().pending_reliable(), 0);
    }

    #[test]
    fn test_lost_packet_recovered_by_replay() {
        let registry = registry();
        let mut server = ServerTransport::new(TransportConfig::default());
        let mut client = ClientTransport::new();
        let now = Instant::now();

        let mut datagrams = Vec::new();
        for n in 0..3 {
            server.queue_reliable(chat(n));
            datagrams.push(server.send_packet(n as u64, now).unwrap().unwrap());
        }

        // Second packet dropped on the way.
        let first = client.receive_packet(&datagrams[0], &registry).unwrap().unwrap();
        assert_eq!(first.messages, vec![chat(0)]);
        let third = client.receive_packet(&datagrams[2], &registry).unwrap().unwrap();
        assert!(third.messages.is_empty());

        let reply = client.write_packet();
        let back = server.receive_packet(&reply, &registry, now).unwrap().unwrap();
        assert_eq!(back.replays, vec![datagrams[1].clone()]);

        let replayed = client.receive_packet(&back.replays[0], &registry).unwrap().unwrap();
        assert_eq!(replayed.messages, vec![chat(1), chat(2)]);
    }

    #[test]
    fn test_duplicate_and_stale_packets() {
        let registry = registry();
        let mut server = ServerTransport::new(TransportConfig {
            compression: false,
            ..Default::default()
        });
        let mut client = ClientTransport::new();
        let now = Instant::now();

        server.queue_unreliable(chat(1));
        let older = server.send_packet(0, now).unwrap().unwrap();
        server.queue_unreliable(chat(2));
        let newer = server.send_packet(1, now).unwrap().unwrap();

        let received = client.receive_packet(&newer, &registry).unwrap().unwrap();
        assert_eq!(received.messages, vec![chat(2)]);
        assert!(client.receive_packet(&newer, &registry).unwrap().is_none());

        let received = client.receive_packet(&older, &registry).unwrap().unwrap();
        assert!(received.messages.is_empty());
    }

    #[test]
    fn test_undecodable_packet_requests_resync() {
        let registry = registry();
        let mut server = ServerTransport::new(TransportConfig::default());
        let mut client = ClientTransport::new();

        let err = client
            .receive_packet(&[1, 0, 0, 0, 0, 0x7E, 0], &registry)
            .unwrap_err();
        assert!(matches!(err, PacketError::UnknownMessage(0x7E)));
        assert!(client.resync_pending());

        let reply = client.write_packet();
        assert!(!client.resync_pending());
        let back = server
            .receive_packet(&reply, &registry, Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(
            back.messages,
            vec![Message::new(MessageKind::RESYNC_REQUEST, Vec::new())]
        );
    }

    #[test]
    fn test_truncated_packet() {
        let mut client = ClientTransport::new();
        assert!(matches!(
            client.receive_packet(&[1, 0], &registry()),
            Err(PacketError::Truncated)
        ));
    }

    #[test]
    fn test_client_messages_reach_server() {
        let registry = registry();
        let mut server = ServerTransport::new(TransportConfig::default());
        let mut client = ClientTransport::new();

        client.queue(chat(7));
        client.queue(chat(8));
        let datagram = client.write_packet();

        let back = server
            .receive_packet(&datagram, &registry, Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(back.sequence, 1);
        assert_eq!(back.messages, vec![chat(7), chat(8)]);
        assert!(!client.has_queued());
    }
}
