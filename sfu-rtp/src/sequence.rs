//! Wraparound-aware comparisons for 16-bit RTP sequence numbers.

use std::cmp::Ordering;

pub const UINT16_SIZE_HALF: u16 = 1 << 15;

/// Returns true when `value` is newer than `prev` in 16-bit serial arithmetic.
///
/// Two numbers exactly half the space apart are never newer than each other.
pub fn is_newer_sequence_number(value: u16, prev: u16) -> bool {
    value != prev && value.wrapping_sub(prev) < UINT16_SIZE_HALF
}

pub fn is_older_sequence_number(value: u16, other: u16) -> bool {
    is_newer_sequence_number(other, value)
}

pub fn latest_sequence_number(a: u16, b: u16) -> u16 {
    if is_newer_sequence_number(a, b) { a } else { b }
}

/// Forward distance from `from` to `to`.
pub fn sequence_number_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// Total order over a window narrower than half the sequence space.
pub fn compare_sequence_numbers(a: u16, b: u16) -> Ordering {
    if a == b {
        Ordering::Equal
    } else if is_newer_sequence_number(a, b) {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// Extends 16-bit sequence numbers into a monotonic 64-bit space.
///
/// Each value is placed at the position closest to the previously unwrapped one.
#[derive(Debug, Default, Clone)]
pub struct SequenceUnwrapper {
    last_unwrapped: Option<i64>,
}

impl SequenceUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwrap(&mut self, seq: u16) -> i64 {
        let unwrapped = match self.last_unwrapped {
            None => seq as i64,
            Some(last) => {
                let mut diff = seq as i64 - (last & 0xFFFF);
                if diff > 0x8000 {
                    diff -= 0x10000;
                } else if diff < -0x8000 {
                    diff += 0x10000;
                }
                last + diff
            }
        };
        self.last_unwrapped = Some(unwrapped);
        unwrapped
    }
}
