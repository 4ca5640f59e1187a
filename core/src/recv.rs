//! DBPSK bit recovery and frame assembly.

use crate::config::ModemConfig;
use crate::detect::{DetectOutcome, Detector, Interrupt, RunGuard, SyncLock};
use crate::dsp::CarrierReference;
use crate::error::Result;
use crate::header::{FrameHeader, WireHeader};
use crate::pipe::{PipeStatus, ReceiverPipe};
use crate::stream::SampleStream;
use crate::SEPARATOR_SYMBOLS;
use log::debug;
use num_complex::Complex32;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

/// Byte to bits lookup table, MSB first.
pub struct BitPacker {
    to_bits: [[bool; 8]; 256],
}

impl BitPacker {
    pub fn new() -> Self {
        let mut to_bits = [[false; 8]; 256];
        for (value, bits) in to_bits.iter_mut().enumerate() {
            for (i, bit) in bits.iter_mut().enumerate() {
                *bit = (value >> (7 - i)) & 1 == 1;
            }
        }
        Self { to_bits }
    }

    pub fn to_bits(&self, byte: u8) -> &[bool; 8] {
        &self.to_bits[byte as usize]
    }

    pub fn to_byte(&self, bits: &[bool; 8]) -> u8 {
        bits.iter().fold(0u8, |byte, &bit| (byte << 1) | u8::from(bit))
    }
}

impl Default for BitPacker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// A complete raw frame
    EndOfFrame(Vec<u8>),
    HeaderDecodeError,
    TimedOut,
    Cancelled,
    SourceExhausted,
}

impl From<Interrupt> for ReceiveOutcome {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => ReceiveOutcome::Cancelled,
            Interrupt::TimedOut => ReceiveOutcome::TimedOut,
        }
    }
}

/// Proportional and integral gains of the symbol clock loop.
const TIMING_GAIN: f64 = 0.05;
const RATE_GAIN: f64 = 0.002;

/// Symbol clock that follows the transmitter's sample clock.
///
/// Every symbol spans a whole number of carrier cycles, so a window that
/// starts `τ` samples late sees the carrier `ωτ` ahead of the phase it had at
/// lock. The loop steers the window start (and the symbol length) to hold that
/// phase, starting from the pilot's frequency estimate.
struct SymbolClock {
    omega: f32,
    samples_per_symbol: usize,
    /// Samples per symbol as seen at this end
    rate: f64,
    /// Ideal start of the next window, relative to the lock position
    ideal: f64,
    consumed: i64,
    /// Unit phasor undoing the carrier phase at lock
    anchor: Complex32,
    last: Vec<f32>,
}

impl SymbolClock {
    fn new(config: &ModemConfig, lock: &SyncLock) -> Self {
        let norm = lock.reference.norm();
        let anchor = if norm > f32::EPSILON {
            lock.reference.conj() / norm
        } else {
            Complex32::new(1.0, 0.0)
        };
        Self {
            omega: config.omega(),
            samples_per_symbol: config.samples_per_symbol,
            rate: config.samples_per_symbol as f64 / (1.0 + lock.freq_error as f64),
            ideal: 0.0,
            consumed: 0,
            anchor,
            last: Vec::new(),
        }
    }

    /// Next symbol, its phase referred to the ideal window start.
    fn next_symbol(&mut self, stream: &mut SampleStream, reference: &CarrierReference) -> Option<Complex32> {
        let mut start = self.ideal.round() as i64;
        let shift = start - self.consumed;
        if shift > 0 {
            let skip = shift as usize;
            if stream.take(skip).len() < skip {
                return None;
            }
        } else if shift < 0 {
            let back = (shift.unsigned_abs() as usize).min(self.last.len());
            stream.unread(&self.last[self.last.len() - back..]);
            start = self.consumed - back as i64;
        }

        let window = stream.next_window(self.samples_per_symbol)?;
        self.consumed = start + self.samples_per_symbol as i64;
        let offset = (start as f64 - self.ideal) as f32;
        let z = reference.demodulate(&window) * Complex32::from_polar(1.0, -self.omega * offset);
        self.last = window;
        Some(z)
    }

    /// Steer with the symbol just read and move on to the next one.
    fn advance(&mut self, z: Complex32) {
        let rotated = z * self.anchor;
        // Squaring strips the data phase
        let phase_error = (rotated * rotated).arg() / 2.0;
        let late = (phase_error / self.omega) as f64;
        self.ideal -= TIMING_GAIN * late;
        self.rate -= RATE_GAIN * late;
        self.ideal += self.rate;
    }

    /// Clock offset tracked so far, in parts per million.
    fn drift_ppm(&self) -> f64 {
        (self.samples_per_symbol as f64 / self.rate - 1.0) * 1e6
    }
}

/// Differential phase demodulator running behind a successful sync.
pub struct Receiver {
    config: ModemConfig,
    reference: CarrierReference,
    packer: BitPacker,
    stop: Option<Arc<AtomicBool>>,
}

impl Receiver {
    pub fn new(config: &ModemConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            reference: CarrierReference::from_config(config),
            packer: BitPacker::new(),
            stop: None,
        })
    }

    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Demodulate bytes into `pipe` until it holds a whole frame or gives up.
    pub fn run<H: WireHeader>(
        &mut self,
        stream: &mut SampleStream,
        lock: &SyncLock,
        pipe: &mut ReceiverPipe<H>,
    ) -> ReceiveOutcome {
        let outcome = self.demodulate(stream, lock, pipe);
        if !matches!(outcome, ReceiveOutcome::EndOfFrame(_)) {
            pipe.reset();
        }
        outcome
    }

    fn demodulate<H: WireHeader>(
        &mut self,
        stream: &mut SampleStream,
        lock: &SyncLock,
        pipe: &mut ReceiverPipe<H>,
    ) -> ReceiveOutcome {
        let guard = RunGuard::new(self.stop.as_deref(), &self.config);
        let started = Instant::now();
        let mut clock = SymbolClock::new(&self.config, lock);
        let mut previous = lock.reference;

        for _ in 0..SEPARATOR_SYMBOLS {
            let Some(z) = clock.next_symbol(stream, &self.reference) else {
                return ReceiveOutcome::SourceExhausted;
            };
            let z = z * lock.gain;
            if (z * previous.conj()).re < 0.0 {
                debug!("phase flip inside the separator");
            }
            clock.advance(z);
            previous = z;
        }

        let mut bits = [false; 8];
        let mut filled = 0;
        let mut symbols = 0usize;
        loop {
            if let Some(interrupt) = guard.check() {
                return interrupt.into();
            }
            let Some(z) = clock.next_symbol(stream, &self.reference) else {
                return ReceiveOutcome::SourceExhausted;
            };
            let z = z * lock.gain;
            bits[filled] = (z * previous.conj()).re < 0.0;
            clock.advance(z);
            previous = z;
            filled += 1;
            symbols += 1;

            if filled < 8 {
                continue;
            }
            filled = 0;
            match pipe.add_byte(self.packer.to_byte(&bits)) {
                PipeStatus::Complete { received } => {
                    debug!(
                        "demodulated {} bytes ({} symbols) in {:.3} s, clock drift {:.1} ppm",
                        received,
                        symbols,
                        started.elapsed().as_secs_f32(),
                        clock.drift_ppm()
                    );
                    return ReceiveOutcome::EndOfFrame(pipe.take_frame());
                }
                PipeStatus::HeaderDecodeFailed => return ReceiveOutcome::HeaderDecodeError,
                PipeStatus::AwaitingHeader { .. } | PipeStatus::Receiving { .. } => {}
            }
        }
    }
}

/// Result of one full listen cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RxOutcome {
    Frame { raw: Vec<u8>, lock: SyncLock },
    /// The detector did not synchronize
    NotSynchronized(DetectOutcome),
    /// Synchronized, but no frame came out
    Lost(ReceiveOutcome),
}

impl RxOutcome {
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            RxOutcome::NotSynchronized(DetectOutcome::SourceExhausted)
                | RxOutcome::Lost(ReceiveOutcome::SourceExhausted)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            RxOutcome::NotSynchronized(DetectOutcome::Cancelled)
                | RxOutcome::Lost(ReceiveOutcome::Cancelled)
        )
    }
}

/// Detector, demodulator and assembler wired together.
pub struct FrameReceiver<H: WireHeader = FrameHeader> {
    detector: Detector,
    receiver: Receiver,
    pipe: ReceiverPipe<H>,
}

impl<H: WireHeader> FrameReceiver<H> {
    pub fn new(config: &ModemConfig) -> Result<Self> {
        Ok(Self {
            detector: Detector::new(config)?,
            receiver: Receiver::new(config)?,
            pipe: ReceiverPipe::new()?,
        })
    }

    pub fn with_stop_signal(self, stop: Arc<AtomicBool>) -> Self {
        Self {
            detector: self.detector.with_stop_signal(stop.clone()),
            receiver: self.receiver.with_stop_signal(stop),
            pipe: self.pipe,
        }
    }

    /// `busy` is set while a transmission is being received.
    pub fn with_busy_flag(self, busy: Arc<AtomicBool>) -> Self {
        Self {
            detector: self.detector.with_busy_flag(busy),
            ..self
        }
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    /// Listen for one frame.
    pub fn receive(&mut self, stream: &mut SampleStream) -> RxOutcome {
        let lock = match self.detector.run(stream) {
            DetectOutcome::Synchronized(lock) => lock,
            other => return RxOutcome::NotSynchronized(other),
        };

        self.pipe.reset();
        let outcome = self.receiver.run(stream, &lock, &mut self.pipe);
        self.detector.set_busy(false);
        match outcome {
            ReceiveOutcome::EndOfFrame(raw) => RxOutcome::Frame { raw, lock },
            other => RxOutcome::Lost(other),
        }
    }
}
