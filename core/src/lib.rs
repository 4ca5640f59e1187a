//! IL2P-derived packet radio link layer over an audio DBPSK modem
//!
//! Frames are interleaved with a 9-bit LFSR, protected with Reed-Solomon
//! blocks sized from the payload length, and sent behind a pilot tone and a
//! Barker-13 sync code.

pub mod error;
pub mod config;
pub mod interleave;
pub mod fec;
pub mod header;
pub mod frame;
pub mod dsp;
pub mod stream;
pub mod barker;
pub mod detect;
pub mod pipe;
pub mod recv;
pub mod send;
pub mod messages;
pub mod link;
pub mod transceiver;

pub use config::{LinkConfig, ModemConfig};
pub use detect::{DetectOutcome, Detector, DetectorState, SyncLock};
pub use error::{LinkError, Result};
pub use frame::{DecodedFrame, FrameEngine};
pub use header::{Callsign, FrameHeader, WireHeader};
pub use link::{FrameReader, FrameWriter, LinkEvent, LinkLayer};
pub use messages::{AckMode, Location, OutboundMessage};
pub use pipe::{PipeStatus, ReceiverPipe};
pub use recv::{FrameReceiver, ReceiveOutcome, Receiver, RxOutcome};
pub use send::{transmit_frame, Sender};
pub use stream::{AudioChannel, SampleSink, SampleStream};
pub use transceiver::Transceiver;

// Modem defaults
pub const SAMPLE_RATE: f32 = 8000.0;
pub const CARRIER_FREQ: f32 = 2000.0;
pub const SAMPLES_PER_SYMBOL: usize = 8; // 1 ms, two carrier cycles

pub const SEPARATOR_SYMBOLS: usize = 4;
pub const PADDING_SYMBOLS: usize = 2;
pub const SQUELCH_PREROLL: usize = 500;

// Header wire format
pub const CALLSIGN_LEN: usize = 6;
pub const HEADER_LEN: usize = 32;
pub const HEADER_ECC_LEN: usize = 32;
pub const ENCODED_HEADER_LEN: usize = HEADER_LEN + HEADER_ECC_LEN; // 64
pub const MAX_HOPS: u8 = 3;

// Payload FEC
pub const RS_CODEWORD_LEN: usize = 255;
pub const MAX_BLOCK_DATA_LEN: usize = 205;
pub const MAX_PAYLOAD_SIZE: usize = 1023;
pub const MAX_RAW_FRAME_LEN: usize = ENCODED_HEADER_LEN + 1273;

// Acknowledgments
pub const ACK_SLOTS: usize = 4;
pub const DEFAULT_RETRY_CNT: u32 = 3;
