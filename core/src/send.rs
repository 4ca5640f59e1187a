use crate::barker::SYNC_CODE;
use crate::config::ModemConfig;
use crate::error::Result;
use crate::recv::BitPacker;
use crate::{PADDING_SYMBOLS, SEPARATOR_SYMBOLS};

/// DBPSK modulator: pilot tone, sync code, separator, then data bits.
pub struct Sender {
    config: ModemConfig,
    carrier: Vec<f32>,
    packer: BitPacker,
    phase: f32,
    samples: Vec<f32>,
}

impl Sender {
    pub fn new(config: &ModemConfig) -> Result<Self> {
        config.validate()?;
        let omega = config.omega();
        let carrier = (0..config.samples_per_symbol)
            .map(|n| config.amplitude * (omega * n as f32).cos())
            .collect();
        Ok(Self {
            config: config.clone(),
            carrier,
            packer: BitPacker::new(),
            phase: 1.0,
            samples: Vec::new(),
        })
    }

    /// Samples written so far.
    pub fn offset(&self) -> usize {
        self.samples.len()
    }

    pub fn write_silence(&mut self, secs: f32) {
        let len = self.config.seconds_to_samples(secs);
        self.samples.extend(std::iter::repeat(0.0).take(len));
    }

    fn write_symbol(&mut self, flip: bool) {
        if flip {
            self.phase = -self.phase;
        }
        let phase = self.phase;
        self.samples.extend(self.carrier.iter().map(|&x| x * phase));
    }

    /// Pilot tone of `pilot_symbols` symbols, the sync code and the separator.
    pub fn start(&mut self, pilot_symbols: usize) {
        for _ in 0..pilot_symbols {
            self.write_symbol(false);
        }
        for &chip in SYNC_CODE.iter() {
            self.write_symbol(chip);
        }
        for _ in 0..SEPARATOR_SYMBOLS {
            self.write_symbol(false);
        }
    }

    /// Data bytes, MSB first; a set bit is a phase reversal.
    pub fn modulate(&mut self, data: &[u8]) {
        for &byte in data {
            let bits = *self.packer.to_bits(byte);
            for bit in bits {
                self.write_symbol(bit);
            }
        }
        // Keeps the last data symbol clear of the transmitter turning off
        for _ in 0..PADDING_SYMBOLS {
            self.write_symbol(false);
        }
    }

    pub fn finish(self) -> Vec<f32> {
        self.samples
    }
}

/// Complete transmission of one raw frame, silence included.
pub fn transmit_frame(config: &ModemConfig, frame: &[u8]) -> Result<Vec<f32>> {
    let mut sender = Sender::new(config)?;
    sender.write_silence(config.silence_start_secs);
    sender.start(config.pilot_symbols);
    sender.modulate(frame);
    sender.write_silence(config.silence_stop_secs);
    Ok(sender.finish())
}
