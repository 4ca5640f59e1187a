//! LFSR bit interleaver used to spread error bursts across the encoded frame.
//!
//! Both registers are 9 stages wide (x^9 + x^4 + 1). The scrambler needs five
//! priming bits before its output lines up with the input, so the first five
//! output bits are dropped and five zero bits are clocked through at the end.
//! The descrambler has no such delay.

const REGISTER_WIDTH: u32 = 9;
const REGISTER_MASK: u16 = (1 << REGISTER_WIDTH) - 1;
const PRIMING_BITS: usize = 5;

const SCRAMBLER_INIT: u16 = 0x1E0;
const DESCRAMBLER_INIT: u16 = 0x01F;

/// Register contents; bit `i` holds stage `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LfsrState(u16);

impl LfsrState {
    pub const fn new(bits: u16) -> Self {
        Self(bits & REGISTER_MASK)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    fn stage(self, i: u32) -> bool {
        (self.0 >> i) & 1 == 1
    }

    fn rotated(self) -> u16 {
        ((self.0 << 1) | (self.0 >> (REGISTER_WIDTH - 1))) & REGISTER_MASK
    }

    fn with_stage(bits: u16, i: u32, value: bool) -> u16 {
        if value {
            bits | (1 << i)
        } else {
            bits & !(1 << i)
        }
    }

    /// Scrambler transition: returns the next state and the output bit.
    pub fn scramble_next(self, input: bool) -> (Self, bool) {
        let mut next = self.rotated();
        next = Self::with_stage(next, 5, self.stage(8) ^ self.stage(4));
        next = Self::with_stage(next, 0, self.stage(8) ^ input);
        let next = Self(next);
        (next, next.stage(5))
    }

    /// Descrambler transition: returns the next state and the output bit.
    pub fn descramble_next(self, input: bool) -> (Self, bool) {
        let mut next = self.rotated();
        next = Self::with_stage(next, 0, input);
        next = Self::with_stage(next, 5, self.stage(4) ^ input);
        (Self(next), self.stage(8) ^ input)
    }
}

/// Collects output bits MSB-first into bytes.
struct BitSink {
    bytes: Vec<u8>,
    current: u8,
    filled: u8,
}

impl BitSink {
    fn with_capacity(len: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(len),
            current: 0,
            filled: 0,
        }
    }

    fn push(&mut self, bit: bool) {
        self.current = (self.current << 1) | bit as u8;
        self.filled += 1;
        if self.filled == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.filled = 0;
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

fn bits_msb_first(data: &[u8]) -> impl Iterator<Item = bool> + '_ {
    data.iter()
        .flat_map(|&byte| (0..8).rev().map(move |i| (byte >> i) & 1 == 1))
}

pub struct Interleaver {
    state: LfsrState,
}

impl Interleaver {
    pub fn new() -> Self {
        Self {
            state: LfsrState::new(SCRAMBLER_INIT),
        }
    }

    pub fn reset(&mut self) {
        self.state = LfsrState::new(SCRAMBLER_INIT);
    }

    pub fn state(&self) -> LfsrState {
        self.state
    }

    /// Scramble `data`, returning the same number of bytes.
    pub fn scramble_bits(&mut self, data: &[u8]) -> Vec<u8> {
        let mut sink = BitSink::with_capacity(data.len());
        let flush = std::iter::repeat(false).take(PRIMING_BITS);

        for (i, bit) in bits_msb_first(data).chain(flush).enumerate() {
            let (next, out) = self.state.scramble_next(bit);
            self.state = next;
            if i >= PRIMING_BITS {
                sink.push(out);
            }
        }

        sink.finish()
    }
}

impl Default for Interleaver {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Deinterleaver {
    state: LfsrState,
}

impl Deinterleaver {
    pub fn new() -> Self {
        Self {
            state: LfsrState::new(DESCRAMBLER_INIT),
        }
    }

    pub fn reset(&mut self) {
        self.state = LfsrState::new(DESCRAMBLER_INIT);
    }

    pub fn state(&self) -> LfsrState {
        self.state
    }

    /// Descramble `data`. The register is not reset, so a frame split across
    /// several calls descrambles the same as one call over the whole buffer.
    pub fn descramble_bits(&mut self, data: &[u8]) -> Vec<u8> {
        let mut sink = BitSink::with_capacity(data.len());
        for bit in bits_msb_first(data) {
            let (next, out) = self.state.descramble_next(bit);
            self.state = next;
            sink.push(out);
        }
        sink.finish()
    }
}

impl Default for Deinterleaver {
    fn default() -> Self {
        Self::new()
    }
}
