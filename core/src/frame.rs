use crate::error::{LinkError, Result};
use crate::fec::{BlockReport, FrameHeaderCodec, FramePayloadDecoder, FramePayloadEncoder};
use crate::header::{FrameHeader, WireHeader};
use crate::interleave::{Deinterleaver, Interleaver};
use log::debug;
use std::marker::PhantomData;

/// A received frame. The header is always valid; the payload may not be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame<H = FrameHeader> {
    pub header: H,
    pub payload_ok: bool,
    pub payload: Vec<u8>,
    pub blocks: Vec<BlockReport>,
}

/// Interleaves and RS-codes whole frames.
///
/// Holds LFSR state, so each thread that encodes or decodes owns its own engine.
pub struct FrameEngine<H: WireHeader = FrameHeader> {
    header_codec: FrameHeaderCodec,
    payload_encoder: FramePayloadEncoder,
    payload_decoder: FramePayloadDecoder,
    interleaver: Interleaver,
    deinterleaver: Deinterleaver,
    _header: PhantomData<H>,
}

impl<H: WireHeader> FrameEngine<H> {
    pub fn new() -> Result<Self> {
        Ok(Self {
            header_codec: FrameHeaderCodec::new(H::PACKED_LEN, H::ECC_LEN)?,
            payload_encoder: FramePayloadEncoder::new(),
            payload_decoder: FramePayloadDecoder::new(),
            interleaver: Interleaver::new(),
            deinterleaver: Deinterleaver::new(),
            _header: PhantomData,
        })
    }

    /// Pack, interleave and RS-encode a frame.
    ///
    /// `payload` must be exactly as long as the header says.
    pub fn encode_frame(&mut self, header: &H, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() != header.payload_size() {
            return Err(LinkError::InvalidLength {
                expected: header.payload_size(),
                actual: payload.len(),
            });
        }

        let mut plain = header.pack()?;
        plain.extend_from_slice(payload);

        self.interleaver.reset();
        let scrambled = self.interleaver.scramble_bits(&plain);
        let (scrambled_header, scrambled_payload) = scrambled.split_at(H::PACKED_LEN);

        let mut raw = self.header_codec.encode(scrambled_header)?;
        raw.extend(self.payload_encoder.encode(scrambled_payload));
        Ok(raw)
    }

    /// Decode a complete raw frame.
    ///
    /// Only an unusable header is an error; payload damage is reported through
    /// `payload_ok`.
    pub fn decode_frame(&mut self, raw: &[u8]) -> Result<DecodedFrame<H>> {
        let header = self.decode_header(raw)?;

        let payload_raw = &raw[H::ENCODED_LEN..];
        if payload_raw.len() < header.raw_payload_size() {
            debug!(
                "frame truncated: {} of {} payload bytes",
                payload_raw.len(),
                header.raw_payload_size()
            );
        }
        let decoded = self
            .payload_decoder
            .decode(payload_raw, header.payload_size());
        // Continues from the header's descrambler state
        let payload = self.deinterleaver.descramble_bits(&decoded.data);

        Ok(DecodedFrame {
            header,
            payload_ok: decoded.success,
            payload,
            blocks: decoded.blocks,
        })
    }

    /// Decode only the header prefix of `raw`; payload bytes need not be present.
    pub fn decode_header(&mut self, raw: &[u8]) -> Result<H> {
        if raw.len() < H::ENCODED_LEN {
            return Err(LinkError::InvalidLength {
                expected: H::ENCODED_LEN,
                actual: raw.len(),
            });
        }

        let corrected = self.header_codec.decode(&raw[..H::ENCODED_LEN])?;
        self.deinterleaver.reset();
        let packed = self.deinterleaver.descramble_bits(&corrected.data);
        H::unpack(&packed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Callsign;
    use crate::ENCODED_HEADER_LEN;

    fn sample_header(payload_size: u16) -> FrameHeader {
        FrameHeader {
            request_ack: true,
            my_seq: 4242,
            hops: 2,
            hops_remaining: 2,
            ..FrameHeader::text(Callsign::new("KK6XYZ"), Callsign::new("N0CALL"), payload_size)
        }
    }

    #[test]
    fn test_encode_decode_short_payload() {
        let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
        let payload = b"hello!!";
        let header = sample_header(payload.len() as u16);

        let raw = engine.encode_frame(&header, payload).unwrap();
        assert_eq!(raw.len(), ENCODED_HEADER_LEN + header.raw_payload_size());

        let frame = engine.decode_frame(&raw).unwrap();
        assert_eq!(frame.header, header);
        assert!(frame.payload_ok);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_empty_payload() {
        let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
        let header = sample_header(0);
        let raw = engine.encode_frame(&header, &[]).unwrap();
        assert_eq!(raw.len(), ENCODED_HEADER_LEN);

        let frame = engine.decode_frame(&raw).unwrap();
        assert_eq!(frame.header, header);
        assert!(frame.payload_ok);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_payload_length_must_match_header() {
        let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
        let header = sample_header(10);
        assert!(matches!(
            engine.encode_frame(&header, b"short"),
            Err(LinkError::InvalidLength { expected: 10, actual: 5 })
        ));
    }

    #[test]
    fn test_decode_header_only() {
        let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
        let payload = vec![b'x'; 300];
        let header = sample_header(300);
        let raw = engine.encode_frame(&header, &payload).unwrap();

        let decoded = engine.decode_header(&raw[..ENCODED_HEADER_LEN]).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.raw_payload_size(), raw.len() - ENCODED_HEADER_LEN);
    }

    #[test]
    fn test_short_header_is_contract_violation() {
        let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
        assert!(matches!(
            engine.decode_header(&[0u8; 63]),
            Err(LinkError::InvalidLength { expected: 64, actual: 63 })
        ));
        assert!(matches!(
            engine.decode_frame(&[0u8; 10]),
            Err(LinkError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_garbage_header_fails() {
        let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
        let raw: Vec<u8> = (0..64u32).map(|i| (i * 97 + 13) as u8).collect();
        assert!(engine.decode_frame(&raw).is_err());
    }

    #[test]
    fn test_engine_reuse_across_frames() {
        let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
        for i in 0..5u8 {
            let payload = vec![i; 20 + i as usize];
            let header = sample_header(payload.len() as u16);
            let raw = engine.encode_frame(&header, &payload).unwrap();
            let frame = engine.decode_frame(&raw).unwrap();
            assert_eq!(frame.payload, payload);
        }
    }
}
