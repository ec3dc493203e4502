use crate::packet::DataPacket;

const SEQUENCE_HALF: u16 = 1 << 15;

/// Largest ring a [`SendBuffer`] accepts.
pub const MAX_SEND_BUFFER_SIZE: u16 = 1 << 15;

/// Ring of recently sent packets, slotted by sequence number.
///
/// Only the newest `size` sequence numbers are answerable. Skipping ahead
/// empties the slots in between so a stale packet is never returned for a
/// number that was not sent.
pub(crate) struct SendBuffer {
    slots: Vec<Option<(u16, DataPacket)>>,
    size: u16,
    highest: Option<u16>,
}

impl SendBuffer {
    /// Sizes are rounded up to a power of two within `1..=32768`.
    pub(crate) fn new(size: u16) -> Self {
        let size = size.clamp(1, MAX_SEND_BUFFER_SIZE).next_power_of_two();
        Self {
            slots: vec![None; size as usize],
            size,
            highest: None,
        }
    }

    pub(crate) fn capacity(&self) -> u16 {
        self.size
    }

    fn slot(&self, sequence_number: u16) -> usize {
        (sequence_number % self.size) as usize
    }

    pub(crate) fn insert(&mut self, sequence_number: u16, packet: DataPacket) {
        match self.highest {
            None => self.highest = Some(sequence_number),
            Some(highest) => {
                let ahead = sequence_number.wrapping_sub(highest);
                if ahead == 0 {
                    return;
                }
                if ahead < SEQUENCE_HALF {
                    // at most one lap of slots needs clearing
                    let gap = (ahead - 1).min(self.size);
                    for step in 1..=gap {
                        let slot = self.slot(highest.wrapping_add(step));
                        self.slots[slot] = None;
                    }
                    self.highest = Some(sequence_number);
                } else if highest.wrapping_sub(sequence_number) >= self.size {
                    return;
                }
            }
        }
        let slot = self.slot(sequence_number);
        self.slots[slot] = Some((sequence_number, packet));
    }

    pub(crate) fn get(&self, sequence_number: u16) -> Option<&DataPacket> {
        let highest = self.highest?;
        let behind = highest.wrapping_sub(sequence_number);
        if behind >= SEQUENCE_HALF || behind >= self.size {
            return None;
        }
        match &self.slots[self.slot(sequence_number)] {
            Some((stored, packet)) if *stored == sequence_number => Some(packet),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_util::media_packet;
    use crate::packet::MediaKind;
    use std::time::Instant;

    fn buffer_with(size: u16, seqs: &[u16]) -> SendBuffer {
        let now = Instant::now();
        let mut buffer = SendBuffer::new(size);
        for &seq in seqs {
            buffer.insert(seq, media_packet(now, MediaKind::Video, 1, seq));
        }
        buffer
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        assert_eq!(SendBuffer::new(0).capacity(), 1);
        assert_eq!(SendBuffer::new(5).capacity(), 8);
        assert_eq!(SendBuffer::new(256).capacity(), 256);
        assert_eq!(SendBuffer::new(u16::MAX).capacity(), MAX_SEND_BUFFER_SIZE);
    }

    #[test]
    fn test_get_returns_stored_packet() {
        let buffer = buffer_with(8, &[10, 11, 12]);
        let packet = buffer.get(11).unwrap();
        assert_eq!(packet.sequence_number().unwrap(), 11);
        assert!(buffer.get(13).is_none());
        assert!(SendBuffer::new(8).get(0).is_none());
    }

    #[test]
    fn test_oldest_entries_are_evicted() {
        let seqs: Vec<u16> = (0..12).collect();
        let buffer = buffer_with(8, &seqs);
        for seq in 0..4 {
            assert!(buffer.get(seq).is_none(), "seq {seq} should be evicted");
        }
        for seq in 4..12 {
            assert!(buffer.get(seq).is_some(), "seq {seq} should be kept");
        }
    }

    #[test]
    fn test_skipped_numbers_are_not_answered() {
        let buffer = buffer_with(8, &[0, 1, 2, 5]);
        assert!(buffer.get(3).is_none());
        assert!(buffer.get(4).is_none());
        assert!(buffer.get(2).is_some());

        // a jump of more than one lap leaves only the newest packet
        let buffer = buffer_with(8, &[0, 1, 100]);
        assert!(buffer.get(1).is_none());
        assert!(buffer.get(100).is_some());
    }

    #[test]
    fn test_wraparound_and_reordering() {
        let buffer = buffer_with(8, &[65534, 0, 65535, 1]);
        for seq in [65534, 65535, 0, 1] {
            assert!(buffer.get(seq).is_some());
        }

        // too old to fit behind the newest packet
        let buffer = buffer_with(4, &[10, 5]);
        assert!(buffer.get(5).is_none());
    }
}
