use crate::error::{LinkError, Result};
use crate::{MAX_BLOCK_DATA_LEN, RS_CODEWORD_LEN};
use log::debug;
use reed_solomon::{Buffer, Decoder, Encoder};
use std::panic::{self, AssertUnwindSafe};

/// How a payload of a given length is split into RS blocks.
///
/// Encoder and decoder both derive this from the logical payload length only,
/// so it never travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPartition {
    pub block_cnt: usize,
    pub small_block_len: usize,
    pub large_block_len: usize,
    pub small_block_cnt: usize,
    pub large_block_cnt: usize,
    pub ecc_sym_cnt: usize,
}

impl BlockPartition {
    /// Returns `None` for an empty payload, which carries no RS framing at all.
    pub fn for_payload(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }

        let block_cnt = len.div_ceil(MAX_BLOCK_DATA_LEN);
        let small_block_len = len / block_cnt;
        let large_block_len = small_block_len + 1;
        let large_block_cnt = len - block_cnt * small_block_len;
        let small_block_cnt = block_cnt - large_block_cnt;

        let longest = if large_block_cnt > 0 {
            large_block_len
        } else {
            small_block_len
        };
        // Block lengths of exactly 205 would otherwise need a 256-byte codeword
        let ecc_sym_cnt = (small_block_len / 5 + 10).min(RS_CODEWORD_LEN - longest);

        Some(Self {
            block_cnt,
            small_block_len,
            large_block_len,
            small_block_cnt,
            large_block_cnt,
            ecc_sym_cnt,
        })
    }

    /// Data lengths of every block in transmission order: large blocks first.
    pub fn block_lens(&self) -> impl Iterator<Item = usize> {
        std::iter::repeat(self.large_block_len)
            .take(self.large_block_cnt)
            .chain(std::iter::repeat(self.small_block_len).take(self.small_block_cnt))
    }

    /// Total number of encoded bytes.
    pub fn raw_len(&self) -> usize {
        self.large_block_cnt * (self.large_block_len + self.ecc_sym_cnt)
            + self.small_block_cnt * (self.small_block_len + self.ecc_sym_cnt)
    }
}

/// Encoded size of a payload of `len` logical bytes.
pub fn raw_payload_len(len: usize) -> usize {
    BlockPartition::for_payload(len).map_or(0, |p| p.raw_len())
}

fn corrected_symbols(received: &[u8], corrected: &[u8]) -> usize {
    received
        .iter()
        .zip(corrected)
        .filter(|(a, b)| a != b)
        .count()
}

/// Correct one codeword in place; `None` when it is beyond repair.
///
/// A panic inside the decoder counts as an uncorrectable block, since the
/// input is whatever noise made it past sync.
fn correct(decoder: &Decoder, block: &mut [u8]) -> Option<Buffer> {
    panic::catch_unwind(AssertUnwindSafe(|| decoder.correct(block, None)))
        .ok()
        .and_then(|result| result.ok())
}

/// Output of a successful block correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corrected {
    pub data: Vec<u8>,
    /// Symbols the decoder had to repair
    pub errors: usize,
}

/// Fixed-size RS codec for the frame header.
pub struct FrameHeaderCodec {
    data_len: usize,
    ecc_len: usize,
    encoder: Encoder,
    decoder: Decoder,
}

impl FrameHeaderCodec {
    pub fn new(data_len: usize, ecc_len: usize) -> Result<Self> {
        if data_len == 0 || ecc_len == 0 || data_len + ecc_len > RS_CODEWORD_LEN {
            return Err(LinkError::InvalidConfig(format!(
                "header codec {}+{} does not fit a {}-byte codeword",
                data_len, ecc_len, RS_CODEWORD_LEN
            )));
        }
        Ok(Self {
            data_len,
            ecc_len,
            encoder: Encoder::new(ecc_len),
            decoder: Decoder::new(ecc_len),
        })
    }

    pub fn encoded_len(&self) -> usize {
        self.data_len + self.ecc_len
    }

    pub fn encode(&self, header: &[u8]) -> Result<Vec<u8>> {
        if header.len() != self.data_len {
            return Err(LinkError::InvalidLength {
                expected: self.data_len,
                actual: header.len(),
            });
        }
        Ok(self.encoder.encode(header)[..].to_vec())
    }

    /// Correct and strip the ECC symbols.
    ///
    /// Fails with `HeaderDecode` when the block holds more than `ecc_len / 2`
    /// symbol errors.
    pub fn decode(&self, raw: &[u8]) -> Result<Corrected> {
        if raw.len() != self.encoded_len() {
            return Err(LinkError::InvalidLength {
                expected: self.encoded_len(),
                actual: raw.len(),
            });
        }

        let mut block = raw.to_vec();
        let recovered = correct(&self.decoder, &mut block).ok_or(LinkError::HeaderDecode)?;
        let errors = corrected_symbols(raw, &recovered[..]);
        if errors > 0 {
            debug!("header: corrected {} symbol errors", errors);
        }

        Ok(Corrected {
            data: recovered.data().to_vec(),
            errors,
        })
    }
}

/// Encodes a payload into its large and small RS blocks.
pub struct FramePayloadEncoder {
    cached: Option<(usize, Encoder)>,
}

impl FramePayloadEncoder {
    pub fn new() -> Self {
        Self { cached: None }
    }

    fn encoder(&mut self, ecc_len: usize) -> &Encoder {
        if self.cached.as_ref().is_some_and(|(len, _)| *len != ecc_len) {
            self.cached = None;
        }
        &self
            .cached
            .get_or_insert_with(|| (ecc_len, Encoder::new(ecc_len)))
            .1
    }

    pub fn encode(&mut self, payload: &[u8]) -> Vec<u8> {
        let Some(partition) = BlockPartition::for_payload(payload.len()) else {
            return Vec::new();
        };

        let mut encoded = Vec::with_capacity(partition.raw_len());
        let encoder = self.encoder(partition.ecc_sym_cnt);
        let mut offset = 0;
        for len in partition.block_lens() {
            let block = encoder.encode(&payload[offset..offset + len]);
            encoded.extend_from_slice(&block[..]);
            offset += len;
        }
        encoded
    }
}

impl Default for FramePayloadEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-block result of a payload decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReport {
    pub index: usize,
    pub len: usize,
    /// Repaired symbol count, or `None` when the block was uncorrectable
    pub corrected: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecode {
    pub success: bool,
    pub data: Vec<u8>,
    pub blocks: Vec<BlockReport>,
}

/// Decodes payload blocks independently so one bad block does not sink the rest.
pub struct FramePayloadDecoder {
    cached: Option<(usize, Decoder)>,
}

impl FramePayloadDecoder {
    pub fn new() -> Self {
        Self { cached: None }
    }

    fn decoder(&mut self, ecc_len: usize) -> &Decoder {
        if self.cached.as_ref().is_some_and(|(len, _)| *len != ecc_len) {
            self.cached = None;
        }
        &self
            .cached
            .get_or_insert_with(|| (ecc_len, Decoder::new(ecc_len)))
            .1
    }

    /// Decode `raw` as the encoding of a `payload_len`-byte payload.
    ///
    /// A short `raw` is zero-padded; failed blocks come back zero-filled.
    pub fn decode(&mut self, raw: &[u8], payload_len: usize) -> PayloadDecode {
        let Some(partition) = BlockPartition::for_payload(payload_len) else {
            return PayloadDecode {
                success: true,
                data: Vec::new(),
                blocks: Vec::new(),
            };
        };

        let mut padded = raw.to_vec();
        padded.resize(partition.raw_len(), 0);

        let ecc_len = partition.ecc_sym_cnt;
        let decoder = self.decoder(ecc_len);
        let mut data = Vec::with_capacity(payload_len);
        let mut blocks = Vec::with_capacity(partition.block_cnt);
        let mut offset = 0;

        for (index, len) in partition.block_lens().enumerate() {
            let received = &padded[offset..offset + len + ecc_len];
            let mut block = received.to_vec();
            let corrected = match correct(decoder, &mut block) {
                Some(recovered) => {
                    data.extend_from_slice(recovered.data());
                    Some(corrected_symbols(received, &recovered[..]))
                }
                None => {
                    data.extend(std::iter::repeat(0u8).take(len));
                    None
                }
            };
            blocks.push(BlockReport {
                index,
                len,
                corrected,
            });
            offset += len + ecc_len;
        }

        let success = blocks.iter().all(|b| b.corrected.is_some());
        debug!(
            "payload: {} blocks, ecc {}, report {:?}",
            partition.block_cnt,
            ecc_len,
            blocks.iter().map(|b| b.corrected).collect::<Vec<_>>()
        );

        PayloadDecode {
            success,
            data,
            blocks,
        }
    }
}

impl Default for FramePayloadDecoder {
    fn default() -> Self {
        Self::new()
    }
}
