use super::protocol::OLD_PACKET_SLOTS;

/// A datagram exactly as it went on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldPacket {
    pub sequence: u32,
    pub data: Vec<u8>,
    /// Codec slot and its generation when the payload was compressed.
    pub codec: Option<(u8, u64)>,
}

/// Ring of the last `OLD_PACKET_SLOTS` sent datagrams, keyed by sequence.
#[derive(Debug)]
pub struct PacketHistory {
    slots: Vec<Option<OldPacket>>,
}

impl Default for PacketHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketHistory {
    pub fn new() -> Self {
        Self {
            slots: vec![None; OLD_PACKET_SLOTS],
        }
    }

    pub fn record(&mut self, sequence: u32, data: &[u8], codec: Option<(u8, u64)>) {
        self.slots[sequence as usize % OLD_PACKET_SLOTS] = Some(OldPacket {
            sequence,
            data: data.to_vec(),
            codec,
        });
    }

    /// The stored packet, unless its slot has been reused by a newer one.
    pub fn get(&self, sequence: u32) -> Option<&OldPacket> {
        self.slots[sequence as usize % OLD_PACKET_SLOTS]
            .as_ref()
            .filter(|p| p.sequence == sequence)
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_sequence() {
        let mut history = PacketHistory::new();
        history.record(5, &[1, 2, 3], None);
        assert_eq!(history.get(5).unwrap().data, vec![1, 2, 3]);
        assert!(history.get(6).is_none());
    }

    #[test]
    fn test_wrapped_slot_is_not_returned() {
        let mut history = PacketHistory::new();
        history.record(5, &[1], Some((1, 2)));
        history.record(5 + OLD_PACKET_SLOTS as u32, &[2], None);

        assert!(history.get(5).is_none());
        assert_eq!(history.get(261).unwrap().data, vec![2]);
    }
}
