use crate::frame::FrameEngine;
use crate::header::{FrameHeader, WireHeader};
use crate::error::Result;
use log::debug;

/// Progress of the frame being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    /// Header not complete yet
    AwaitingHeader { received: usize },
    /// Header decoded; `remaining` raw bytes still to come
    Receiving { received: usize, remaining: usize },
    /// A whole raw frame is buffered, see [`ReceiverPipe::take_frame`]
    Complete { received: usize },
    /// The header could not be decoded; the frame is abandoned
    HeaderDecodeFailed,
}

/// Accumulates demodulated bytes and decodes the header as soon as it is in,
/// which is the only way to know where the frame ends.
pub struct ReceiverPipe<H: WireHeader = FrameHeader> {
    engine: FrameEngine<H>,
    buffer: Vec<u8>,
    header: Option<H>,
    raw_payload_size: usize,
}

impl<H: WireHeader> ReceiverPipe<H> {
    pub fn new() -> Result<Self> {
        Ok(Self {
            engine: FrameEngine::new()?,
            buffer: Vec::new(),
            header: None,
            raw_payload_size: 0,
        })
    }

    /// Append one demodulated byte.
    ///
    /// Once a frame is complete further bytes are dropped until
    /// [`take_frame`](Self::take_frame) or [`reset`](Self::reset).
    pub fn add_byte(&mut self, byte: u8) -> PipeStatus {
        if self.header.is_some() && self.buffer.len() >= H::ENCODED_LEN + self.raw_payload_size {
            return PipeStatus::Complete {
                received: self.buffer.len(),
            };
        }
        self.buffer.push(byte);
        let received = self.buffer.len();

        if received < H::ENCODED_LEN {
            return PipeStatus::AwaitingHeader { received };
        }

        if received == H::ENCODED_LEN {
            match self.engine.decode_header(&self.buffer) {
                Ok(header) => {
                    self.raw_payload_size = header.raw_payload_size();
                    debug!(
                        "header decoded, expecting {} payload bytes",
                        self.raw_payload_size
                    );
                    self.header = Some(header);
                }
                Err(e) => {
                    debug!("header decode failed: {}", e);
                    self.reset();
                    return PipeStatus::HeaderDecodeFailed;
                }
            }
        }

        let remaining = (H::ENCODED_LEN + self.raw_payload_size).saturating_sub(received);
        if remaining == 0 {
            PipeStatus::Complete { received }
        } else {
            PipeStatus::Receiving {
                received,
                remaining,
            }
        }
    }

    /// Header of the frame in progress, once decoded.
    pub fn header(&self) -> Option<&H> {
        self.header.as_ref()
    }

    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// Hand over the buffered raw frame and start over.
    pub fn take_frame(&mut self) -> Vec<u8> {
        let frame = std::mem::take(&mut self.buffer);
        self.reset();
        frame
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.header = None;
        self.raw_payload_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Callsign;
    use crate::ENCODED_HEADER_LEN;
    use rand::rngs::StdRng;
    use rand::seq::index::sample;
    use rand::{Rng, SeedableRng};

    /// Feed a 64-byte header candidate and check the pipe's verdict.
    fn feed_header(pipe: &mut ReceiverPipe<FrameHeader>, bytes: &[u8]) {
        let mut last = None;
        for &byte in bytes {
            last = Some(pipe.add_byte(byte));
        }
        match last {
            Some(PipeStatus::HeaderDecodeFailed) => assert_eq!(pipe.received(), 0),
            Some(PipeStatus::Receiving { .. }) | Some(PipeStatus::Complete { .. }) => {
                let header = pipe.header().expect("decoded header kept");
                assert!(header.check().is_ok(), "accepted {:?}", header);
            }
            other => panic!("unexpected status after header: {:?}", other),
        }
        pipe.reset();
    }

    fn encoded_frame(payload: &[u8]) -> (FrameHeader, Vec<u8>) {
        let header = FrameHeader::text(
            Callsign::new("KK6XYZ"),
            Callsign::new("N0CALL"),
            payload.len() as u16,
        );
        let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
        let raw = engine.encode_frame(&header, payload).unwrap();
        (header, raw)
    }

    #[test]
    fn test_counts_down_to_complete() {
        let (header, raw) = encoded_frame(b"pipe test payload");
        let mut pipe = ReceiverPipe::<FrameHeader>::new().unwrap();

        for (i, &byte) in raw.iter().enumerate() {
            let status = pipe.add_byte(byte);
            let received = i + 1;
            if received < ENCODED_HEADER_LEN {
                assert_eq!(status, PipeStatus::AwaitingHeader { received });
            } else if received < raw.len() {
                assert_eq!(
                    status,
                    PipeStatus::Receiving {
                        received,
                        remaining: raw.len() - received
                    }
                );
                assert_eq!(pipe.header(), Some(&header));
            } else {
                assert_eq!(status, PipeStatus::Complete { received });
            }
        }

        assert_eq!(pipe.take_frame(), raw);
        assert_eq!(pipe.received(), 0);
        assert!(pipe.header().is_none());
    }

    #[test]
    fn test_header_only_frame_completes_at_header() {
        let (_, raw) = encoded_frame(&[]);
        let mut pipe = ReceiverPipe::<FrameHeader>::new().unwrap();
        let statuses: Vec<PipeStatus> = raw.iter().map(|&b| pipe.add_byte(b)).collect();
        assert_eq!(
            statuses.last(),
            Some(&PipeStatus::Complete {
                received: ENCODED_HEADER_LEN
            })
        );
    }

    #[test]
    fn test_garbage_header_is_reported_and_reset() {
        let mut pipe = ReceiverPipe::<FrameHeader>::new().unwrap();
        let mut last = None;
        for i in 0..ENCODED_HEADER_LEN {
            last = Some(pipe.add_byte((i as u8).wrapping_mul(151).wrapping_add(7)));
        }
        assert_eq!(last, Some(PipeStatus::HeaderDecodeFailed));
        assert_eq!(pipe.received(), 0);
    }

    #[test]
    fn test_back_to_back_frames() {
        let (_, first) = encoded_frame(b"one");
        let (_, second) = encoded_frame(b"second frame");
        let mut pipe = ReceiverPipe::<FrameHeader>::new().unwrap();

        for raw in [&first, &second] {
            let mut complete = false;
            for &byte in raw.iter() {
                if let PipeStatus::Complete { .. } = pipe.add_byte(byte) {
                    complete = true;
                }
            }
            assert!(complete);
            assert_eq!(&pipe.take_frame(), raw);
        }
    }

    #[test]
    fn test_random_headers_never_slip_through() {
        let mut rng = StdRng::seed_from_u64(0xbad5eed);
        let mut pipe = ReceiverPipe::<FrameHeader>::new().unwrap();
        let mut raw = [0u8; ENCODED_HEADER_LEN];
        for _ in 0..500 {
            rng.fill(&mut raw[..]);
            feed_header(&mut pipe, &raw);
        }
    }

    #[test]
    fn test_headers_past_correction_bound() {
        let mut rng = StdRng::seed_from_u64(17);
        let (_, raw) = encoded_frame(b"");
        let mut pipe = ReceiverPipe::<FrameHeader>::new().unwrap();
        for _ in 0..300 {
            let mut damaged = raw[..ENCODED_HEADER_LEN].to_vec();
            let errors = rng.gen_range(17..=ENCODED_HEADER_LEN);
            for idx in sample(&mut rng, ENCODED_HEADER_LEN, errors) {
                damaged[idx] ^= rng.gen_range(1..=255u8);
            }
            feed_header(&mut pipe, &damaged);
        }
    }

    #[test]
    fn test_bytes_after_complete_are_dropped() {
        let (_, raw) = encoded_frame(b"done");
        let mut pipe = ReceiverPipe::<FrameHeader>::new().unwrap();
        for &byte in raw.iter() {
            pipe.add_byte(byte);
        }
        let complete = PipeStatus::Complete { received: raw.len() };
        assert_eq!(pipe.add_byte(0xff), complete);
        assert_eq!(pipe.add_byte(0x00), complete);
        assert_eq!(pipe.received(), raw.len());
        assert_eq!(pipe.take_frame(), raw);

        // The next frame starts from scratch
        assert_eq!(pipe.add_byte(raw[0]), PipeStatus::AwaitingHeader { received: 1 });
    }
}
