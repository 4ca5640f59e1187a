//! Outbound messages, location payloads and ack bookkeeping.

use crate::error::{LinkError, Result};
use crate::header::FrameHeader;
use crate::ACK_SLOTS;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    None,
    Single,
    Double,
}

impl AckMode {
    pub fn from_header(header: &FrameHeader) -> Self {
        if header.request_double_ack {
            AckMode::Double
        } else if header.request_ack {
            AckMode::Single
        } else {
            AckMode::None
        }
    }

    pub fn apply(self, header: &mut FrameHeader) {
        header.request_ack = self != AckMode::None;
        header.request_double_ack = self == AckMode::Double;
    }
}

/// GPS fix carried by beacons and waypoints, JSON encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub altitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            altitude: 0.0,
            speed: None,
            bearing: None,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| LinkError::Payload(e.to_string()))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| LinkError::Payload(e.to_string()))
    }
}

/// Text payloads are ASCII; anything else is dropped on receipt.
pub fn decode_text(payload: &[u8]) -> String {
    payload
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect()
}

/// A frame waiting to go on the air.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
    /// Zero for the first transmission
    pub attempt: u32,
}

impl OutboundMessage {
    pub fn new(header: FrameHeader, payload: Vec<u8>) -> Self {
        Self {
            header,
            payload,
            attempt: 0,
        }
    }

    pub fn ack_seq(&self) -> Option<u16> {
        self.header.ack_request()
    }

    pub fn location(&self) -> Option<Location> {
        if self.header.is_beacon || self.header.is_waypoint {
            Location::from_payload(&self.payload).ok()
        } else {
            None
        }
    }
}

/// Most recent distinct sequence numbers, newest first, at most four.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckSequenceList {
    seqs: VecDeque<u16>,
}

impl AckSequenceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `seq` is already listed.
    pub fn push(&mut self, seq: u16) -> bool {
        if self.seqs.contains(&seq) {
            return false;
        }
        self.seqs.push_front(seq);
        self.seqs.truncate(ACK_SLOTS);
        true
    }

    pub fn contains(&self, seq: u16) -> bool {
        self.seqs.contains(&seq)
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.seqs.iter().copied()
    }

    /// Occupied header ack slots.
    pub fn acks(&self) -> [bool; 4] {
        let mut acks = [false; 4];
        for slot in acks.iter_mut().take(self.seqs.len()) {
            *slot = true;
        }
        acks
    }

    /// Header `data` words, unused slots zero.
    pub fn data(&self) -> [u16; 4] {
        let mut data = [0u16; 4];
        for (slot, seq) in data.iter_mut().zip(self.seqs.iter()) {
            *slot = *seq;
        }
        data
    }
}

/// An acked message that may still need retransmitting.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub message: OutboundMessage,
    retries_left: u32,
    last_attempt: Instant,
}

impl PendingAck {
    /// `retry_cnt` counts the transmission that just happened.
    pub fn new(message: OutboundMessage, retry_cnt: u32, now: Instant) -> Self {
        Self {
            message,
            retries_left: retry_cnt.saturating_sub(1),
            last_attempt: now,
        }
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    pub fn last_attempt(&self) -> Instant {
        self.last_attempt
    }

    pub fn ready(&self, now: Instant, interval: Duration) -> bool {
        self.retries_left > 0 && now.saturating_duration_since(self.last_attempt) > interval
    }

    /// Spend one retry and restamp the attempt time.
    pub fn decrement(&mut self, now: Instant) -> u32 {
        self.retries_left = self.retries_left.saturating_sub(1);
        self.last_attempt = now;
        self.message.attempt += 1;
        self.retries_left
    }
}
