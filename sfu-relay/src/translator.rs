//! Gap-free renumbering for handlers that drop or inject packets.
//!
//! The translator keeps two circular buffers, input→output and
//! output→input, indexed by sequence number modulo their capacity, and a
//! sliding window `[first_input, last_input]` of inputs that can still be
//! resolved. The window never grows past `max_distance`, which must stay well
//! below the buffer capacity so live slots are never overwritten.

use log::trace;
use rtp::sequence::is_newer_sequence_number;

pub const DEFAULT_BUFFER_SIZE: u16 = 511;
pub const DEFAULT_MAX_DISTANCE: u16 = 200;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum SequenceNumberKind {
    /// Forwarded and counted.
    #[default]
    Valid,
    /// Seen on input but not forwarded; the output counter did not advance.
    Skip,
    /// No usable mapping: too old, or a forwarded packet later asked to be skipped.
    Discard,
    /// Allocated by [`SequenceNumberTranslator::generate`] with no input counterpart.
    Generated,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SequenceNumber {
    pub input: u16,
    pub output: u16,
    pub kind: SequenceNumberKind,
}

impl SequenceNumber {
    fn new(input: u16, output: u16, kind: SequenceNumberKind) -> Self {
        Self {
            input,
            output,
            kind,
        }
    }

    /// Packets with this mapping may be sent downstream.
    pub fn is_forwardable(&self) -> bool {
        matches!(
            self.kind,
            SequenceNumberKind::Valid | SequenceNumberKind::Generated
        )
    }
}

fn seq_less_than(a: u16, b: u16) -> bool {
    is_newer_sequence_number(b, a)
}

pub struct SequenceNumberTranslatorBuilder {
    buffer_size: u16,
    max_distance: u16,
}

impl Default for SequenceNumberTranslatorBuilder {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_distance: DEFAULT_MAX_DISTANCE,
        }
    }
}

impl SequenceNumberTranslatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(mut self, buffer_size: u16) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Maximum width of the live window.
    pub fn with_max_distance(mut self, max_distance: u16) -> Self {
        self.max_distance = max_distance;
        self
    }

    /// The window is clamped below half the buffer size.
    pub fn build(self) -> SequenceNumberTranslator {
        let buffer_size = self.buffer_size.max(2);
        let max_distance = self.max_distance.clamp(1, buffer_size / 2);
        SequenceNumberTranslator {
            in_out: vec![SequenceNumber::default(); buffer_size as usize],
            out_in: vec![SequenceNumber::default(); buffer_size as usize],
            first_input: 0,
            last_input: 0,
            last_output: 0,
            offset: 0,
            buffer_size,
            max_distance,
            initialized: false,
            reset: false,
        }
    }
}

pub struct SequenceNumberTranslator {
    in_out: Vec<SequenceNumber>,
    out_in: Vec<SequenceNumber>,
    first_input: u16,
    last_input: u16,
    last_output: u16,
    /// Outputs handed out by `generate()` since the last forwarded input.
    offset: u16,
    buffer_size: u16,
    max_distance: u16,
    initialized: bool,
    reset: bool,
}

impl Default for SequenceNumberTranslator {
    fn default() -> Self {
        SequenceNumberTranslatorBuilder::new().build()
    }
}

impl SequenceNumberTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, seq: u16) -> usize {
        (seq % self.buffer_size) as usize
    }

    fn add(&mut self, sequence_number: SequenceNumber) {
        let in_slot = self.slot(sequence_number.input);
        let out_slot = self.slot(sequence_number.output);
        self.in_out[in_slot] = sequence_number;
        self.out_in[out_slot] = sequence_number;
    }

    fn next_output(&self) -> u16 {
        self.last_output
            .wrapping_add(self.offset)
            .wrapping_add(1)
    }

    fn update_last_output_sequence_number(&mut self, skip: bool, output: u16) {
        let first_packet = !self.initialized && !(self.reset || self.offset > 0);
        if !skip && (seq_less_than(self.last_output, output) || first_packet) {
            self.last_output = output;
        }
    }

    /// Maps every input in `[first, last)` to consecutive outputs.
    fn fill(&mut self, first: u16, last: u16) {
        let mut input = first;
        while input != last {
            let output = self.next_output();
            self.add(SequenceNumber::new(input, output, SequenceNumberKind::Valid));
            self.last_output = output;
            self.offset = 0;
            input = input.wrapping_add(1);
        }
    }

    fn lookup(&self, input: u16) -> SequenceNumber {
        let result = self.in_out[self.slot(input)];
        if result.input != input {
            return SequenceNumber::new(input, 0, SequenceNumberKind::Discard);
        }
        result
    }

    /// Translates one observed input sequence number.
    ///
    /// With `skip` the packet is recorded but not forwarded, so the output
    /// numbering stays contiguous for whatever is forwarded next.
    pub fn get(&mut self, input: u16, skip: bool) -> SequenceNumber {
        if !self.initialized {
            let kind = if skip {
                SequenceNumberKind::Skip
            } else {
                SequenceNumberKind::Valid
            };
            let output = if self.reset || self.offset > 0 {
                self.next_output()
            } else {
                input
            };
            self.add(SequenceNumber::new(input, output, kind));
            self.update_last_output_sequence_number(skip, output);
            if !skip {
                self.first_input = input;
                self.last_input = input;
                self.initialized = true;
                self.reset = false;
                self.offset = 0;
            }
            return self.lookup(input);
        }

        if seq_less_than(input, self.first_input) {
            trace!(
                "input {} is older than window start {}",
                input, self.first_input
            );
            return SequenceNumber::new(input, 0, SequenceNumberKind::Discard);
        }

        if seq_less_than(self.last_input, input) {
            self.fill(self.last_input.wrapping_add(1), input);

            let kind = if skip {
                SequenceNumberKind::Skip
            } else {
                SequenceNumberKind::Valid
            };
            let output = self.next_output();
            self.update_last_output_sequence_number(skip, output);
            self.add(SequenceNumber::new(input, output, kind));
            self.last_input = input;

            let window_start = self.last_input.wrapping_sub(self.max_distance);
            if seq_less_than(self.first_input, window_start) {
                self.first_input = window_start;
            }
            if !skip {
                self.offset = 0;
            }
            return self.lookup(input);
        }

        let slot = self.slot(input);
        let mut result = self.in_out[slot];
        if result.input != input {
            return SequenceNumber::new(input, 0, SequenceNumberKind::Discard);
        }
        if result.kind == SequenceNumberKind::Valid && skip {
            result.kind = SequenceNumberKind::Discard;
            self.add(result);
        }
        self.update_last_output_sequence_number(skip, result.output);
        result
    }

    /// Looks up the input behind an output number, e.g. for a NACK from downstream.
    pub fn reverse(&self, output: u16) -> SequenceNumber {
        let result = self.out_in[self.slot(output)];
        if result.kind == SequenceNumberKind::Generated && result.output == output {
            return result;
        }
        if !self.initialized
            || result.output != output
            || seq_less_than(result.input, self.first_input)
            || seq_less_than(self.last_input, result.input)
        {
            return SequenceNumber::new(0, output, SequenceNumberKind::Discard);
        }
        result
    }

    /// Allocates an output number for a packet with no input counterpart.
    pub fn generate(&mut self) -> SequenceNumber {
        self.offset = self.offset.wrapping_add(1);
        let output = self.last_output.wrapping_add(self.offset);
        let generated = SequenceNumber::new(0, output, SequenceNumberKind::Generated);
        let out_slot = self.slot(output);
        self.out_in[out_slot] = generated;
        generated
    }

    /// Starts a new input numbering (e.g. after a simulcast switch) that
    /// continues from the last emitted output.
    pub fn reset(&mut self) {
        if !self.initialized {
            return;
        }
        self.initialized = false;
        self.reset = true;
        self.first_input = 0;
        self.last_input = 0;
        self.in_out.fill(SequenceNumber::default());
        self.out_in.fill(SequenceNumber::default());
    }

    pub fn last_output(&self) -> u16 {
        self.last_output
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}
