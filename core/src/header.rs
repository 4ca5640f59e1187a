//! Frame header model and its 32-byte wire layout.

use crate::error::{LinkError, Result};
use crate::fec::raw_payload_len;
use crate::{CALLSIGN_LEN, HEADER_ECC_LEN, HEADER_LEN, MAX_HOPS, MAX_PAYLOAD_SIZE};
use std::fmt;

/// A header wire format the frame engine can carry.
///
/// Both ends of a link must agree on one implementation byte for byte.
pub trait WireHeader: Sized + Clone {
    /// Packed size before FEC
    const PACKED_LEN: usize;
    /// RS parity symbols appended to the packed header
    const ECC_LEN: usize;
    const ENCODED_LEN: usize = Self::PACKED_LEN + Self::ECC_LEN;

    fn pack(&self) -> Result<Vec<u8>>;
    fn unpack(bytes: &[u8]) -> Result<Self>;

    /// Logical payload length in bytes.
    fn payload_size(&self) -> usize;

    /// Payload length on the wire after RS encoding.
    fn raw_payload_size(&self) -> usize {
        raw_payload_len(self.payload_size())
    }
}

/// Fixed-width station identifier, left-justified and space-padded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Callsign([u8; CALLSIGN_LEN]);

impl Callsign {
    pub const BROADCAST: Callsign = Callsign([b' '; CALLSIGN_LEN]);

    /// Truncates to six characters; non-ASCII characters become `?`.
    pub fn new(name: &str) -> Self {
        let mut bytes = [b' '; CALLSIGN_LEN];
        for (slot, c) in bytes.iter_mut().zip(name.chars()) {
            *slot = if c.is_ascii() { c as u8 } else { b'?' };
        }
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; CALLSIGN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CALLSIGN_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Callsign without the trailing padding.
    pub fn trimmed(&self) -> String {
        String::from_utf8_lossy(&self.0).trim_end().to_string()
    }
}

impl Default for Callsign {
    fn default() -> Self {
        Self::BROADCAST
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callsign({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for Callsign {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

// Byte 18
const DOUBLE_ACK: u8 = 0x80;
const ACK: u8 = 0x40;
const ACK_SLOT_BITS: [u8; 4] = [0x04, 0x08, 0x10, 0x20];

// Byte 19
const WAYPOINT: u8 = 0x40;
const HOPS_AT_LEAST_2: u8 = 0x20;
const HOPS_AT_LEAST_1: u8 = 0x10;
const BEACON: u8 = 0x08;
const TEXT_MSG: u8 = 0x04;
const REMAINING_AT_LEAST_2: u8 = 0x02;
const REMAINING_AT_LEAST_1: u8 = 0x01;

const DST_OFFSET: usize = 0;
const LINK_SRC_OFFSET: usize = 6;
const SRC_OFFSET: usize = 12;
const ACK_FLAGS_OFFSET: usize = 18;
const TYPE_FLAGS_OFFSET: usize = 19;
const PAYLOAD_SIZE_OFFSET: usize = 20;
const MY_SEQ_OFFSET: usize = 22;
const DATA_OFFSET: usize = 24;

/// Two flag bits: "at least 2" and "at least 1, but not exactly 2".
fn hop_bits(count: u8, at_least_2: u8, at_least_1: u8) -> u8 {
    let mut bits = 0;
    if count >= 2 {
        bits |= at_least_2;
    }
    if count >= 1 && count != 2 {
        bits |= at_least_1;
    }
    bits
}

fn hop_count(flags: u8, at_least_2: u8, at_least_1: u8) -> u8 {
    let mut count = 0;
    if flags & at_least_2 != 0 {
        count += 2;
    }
    if flags & at_least_1 != 0 {
        count += 1;
    }
    count
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_callsign(bytes: &[u8], offset: usize) -> Callsign {
    let mut raw = [0u8; CALLSIGN_LEN];
    raw.copy_from_slice(&bytes[offset..offset + CALLSIGN_LEN]);
    Callsign::from_bytes(raw)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub dst_callsign: Callsign,
    /// Station that put this copy of the frame on the air
    pub link_src_callsign: Callsign,
    pub src_callsign: Callsign,
    pub request_double_ack: bool,
    pub request_ack: bool,
    /// Occupied slots of `data`
    pub acks: [bool; 4],
    pub hops: u8,
    pub hops_remaining: u8,
    pub is_beacon: bool,
    pub is_text_msg: bool,
    pub is_waypoint: bool,
    pub payload_size: u16,
    pub my_seq: u16,
    /// Forwarded ack sequence numbers
    pub data: [u16; 4],
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self {
            dst_callsign: Callsign::BROADCAST,
            link_src_callsign: Callsign::BROADCAST,
            src_callsign: Callsign::BROADCAST,
            request_double_ack: false,
            request_ack: false,
            acks: [false; 4],
            hops: 0,
            hops_remaining: 0,
            is_beacon: false,
            is_text_msg: false,
            is_waypoint: false,
            payload_size: 0,
            my_seq: 0,
            data: [0; 4],
        }
    }
}

impl FrameHeader {
    /// Text message header sent directly by `src`.
    pub fn text(src: Callsign, dst: Callsign, payload_size: u16) -> Self {
        Self {
            dst_callsign: dst,
            link_src_callsign: src,
            src_callsign: src,
            is_text_msg: true,
            payload_size,
            ..Self::default()
        }
    }

    pub fn wants_ack(&self) -> bool {
        self.request_ack || self.request_double_ack
    }

    /// Sequence number this frame asks to have acknowledged.
    pub fn ack_request(&self) -> Option<u16> {
        self.wants_ack().then_some(self.my_seq)
    }

    /// Sequence numbers carried in occupied ack slots.
    pub fn forwarded_acks(&self) -> Vec<u16> {
        self.acks
            .iter()
            .zip(self.data.iter())
            .filter(|(occupied, _)| **occupied)
            .map(|(_, seq)| *seq)
            .collect()
    }

    pub fn set_forwarded_acks(&mut self, acks: [bool; 4], data: [u16; 4]) {
        self.acks = acks;
        self.data = data;
    }

    /// Hop counts and payload size within protocol limits.
    pub fn check(&self) -> Result<()> {
        if self.hops > MAX_HOPS || self.hops_remaining > self.hops {
            return Err(LinkError::HopCountOutOfRange {
                hops: self.hops,
                hops_remaining: self.hops_remaining,
            });
        }
        if self.payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge(self.payload_size as usize));
        }
        Ok(())
    }
}

impl WireHeader for FrameHeader {
    const PACKED_LEN: usize = HEADER_LEN;
    const ECC_LEN: usize = HEADER_ECC_LEN;

    fn pack(&self) -> Result<Vec<u8>> {
        self.check()?;

        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[DST_OFFSET..DST_OFFSET + CALLSIGN_LEN].copy_from_slice(self.dst_callsign.as_bytes());
        bytes[LINK_SRC_OFFSET..LINK_SRC_OFFSET + CALLSIGN_LEN]
            .copy_from_slice(self.link_src_callsign.as_bytes());
        bytes[SRC_OFFSET..SRC_OFFSET + CALLSIGN_LEN].copy_from_slice(self.src_callsign.as_bytes());

        let mut ack_flags = 0u8;
        if self.request_double_ack {
            ack_flags |= DOUBLE_ACK;
        }
        if self.request_ack {
            ack_flags |= ACK;
        }
        for (occupied, bit) in self.acks.iter().zip(ACK_SLOT_BITS) {
            if *occupied {
                ack_flags |= bit;
            }
        }
        bytes[ACK_FLAGS_OFFSET] = ack_flags;

        let mut type_flags = hop_bits(self.hops, HOPS_AT_LEAST_2, HOPS_AT_LEAST_1)
            | hop_bits(self.hops_remaining, REMAINING_AT_LEAST_2, REMAINING_AT_LEAST_1);
        if self.is_waypoint {
            type_flags |= WAYPOINT;
        }
        if self.is_beacon {
            type_flags |= BEACON;
        }
        if self.is_text_msg {
            type_flags |= TEXT_MSG;
        }
        bytes[TYPE_FLAGS_OFFSET] = type_flags;

        bytes[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 2]
            .copy_from_slice(&self.payload_size.to_be_bytes());
        bytes[MY_SEQ_OFFSET..MY_SEQ_OFFSET + 2].copy_from_slice(&self.my_seq.to_be_bytes());
        for (i, value) in self.data.iter().enumerate() {
            let offset = DATA_OFFSET + 2 * i;
            bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
        }

        Ok(bytes)
    }

    fn unpack(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(LinkError::InvalidLength {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let ack_flags = bytes[ACK_FLAGS_OFFSET];
        let type_flags = bytes[TYPE_FLAGS_OFFSET];
        let mut acks = [false; 4];
        for (slot, bit) in acks.iter_mut().zip(ACK_SLOT_BITS) {
            *slot = ack_flags & bit != 0;
        }
        let mut data = [0u16; 4];
        for (i, value) in data.iter_mut().enumerate() {
            *value = read_u16(bytes, DATA_OFFSET + 2 * i);
        }

        let header = Self {
            dst_callsign: read_callsign(bytes, DST_OFFSET),
            link_src_callsign: read_callsign(bytes, LINK_SRC_OFFSET),
            src_callsign: read_callsign(bytes, SRC_OFFSET),
            request_double_ack: ack_flags & DOUBLE_ACK != 0,
            request_ack: ack_flags & ACK != 0,
            acks,
            hops: hop_count(type_flags, HOPS_AT_LEAST_2, HOPS_AT_LEAST_1),
            hops_remaining: hop_count(type_flags, REMAINING_AT_LEAST_2, REMAINING_AT_LEAST_1),
            is_beacon: type_flags & BEACON != 0,
            is_text_msg: type_flags & TEXT_MSG != 0,
            is_waypoint: type_flags & WAYPOINT != 0,
            payload_size: read_u16(bytes, PAYLOAD_SIZE_OFFSET),
            my_seq: read_u16(bytes, MY_SEQ_OFFSET),
            data,
        };

        header
            .check()
            .map_err(|e| LinkError::MalformedHeader(e.to_string()))?;
        Ok(header)
    }

    fn payload_size(&self) -> usize {
        self.payload_size as usize
    }
}
