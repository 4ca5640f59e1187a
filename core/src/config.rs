use crate::error::{LinkError, Result};
use crate::header::Callsign;
use crate::MAX_HOPS;
use std::f32::consts::PI;
use std::time::Duration;

/// Physical layer parameters shared by sender, detector and receiver.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    pub sample_rate: f32,
    pub carrier_freq: f32,
    pub samples_per_symbol: usize,
    /// Unmodulated symbols the sender puts in front of the sync code
    pub pilot_symbols: usize,
    /// Pilot length the detector expects to see
    pub carrier_duration: usize,
    pub coherence_threshold: f32,
    /// Lock-seeking budget, in seconds of samples
    pub timeout_secs: f32,
    pub squelch: f32,
    pub squelch_timeout_secs: f32,
    /// Wall-clock cap on a single detect or receive run
    pub receive_timeout: Duration,
    pub amplitude: f32,
    pub silence_start_secs: f32,
    pub silence_stop_secs: f32,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::SAMPLE_RATE,
            carrier_freq: crate::CARRIER_FREQ,
            samples_per_symbol: crate::SAMPLES_PER_SYMBOL,
            pilot_symbols: 250,
            carrier_duration: 200,
            coherence_threshold: 0.75,
            timeout_secs: 2.0,
            squelch: 0.1,
            squelch_timeout_secs: 1.0,
            receive_timeout: Duration::from_secs(15),
            amplitude: 0.5,
            silence_start_secs: 0.1,
            silence_stop_secs: 0.1,
        }
    }
}

impl ModemConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(LinkError::InvalidConfig(msg));

        if self.sample_rate <= 0.0 {
            return invalid(format!("sample rate {} must be positive", self.sample_rate));
        }
        if self.samples_per_symbol < 2 {
            return invalid("need at least 2 samples per symbol".to_string());
        }
        if self.carrier_freq <= 0.0 || self.carrier_freq >= self.sample_rate / 2.0 {
            return invalid(format!(
                "carrier {} Hz must lie between 0 and Nyquist ({} Hz)",
                self.carrier_freq,
                self.sample_rate / 2.0
            ));
        }
        let cycles = self.carrier_freq * self.samples_per_symbol as f32 / self.sample_rate;
        if cycles < 1.0 || (cycles - cycles.round()).abs() > 1e-4 {
            return invalid(format!(
                "symbol must hold a whole number of carrier cycles, got {:.3}",
                cycles
            ));
        }
        if !(self.coherence_threshold > 0.0 && self.coherence_threshold <= 1.0) {
            return invalid(format!(
                "coherence threshold {} outside (0, 1]",
                self.coherence_threshold
            ));
        }
        if self.carrier_duration < 40 {
            return invalid(format!(
                "carrier duration {} too short for lock search",
                self.carrier_duration
            ));
        }
        if self.pilot_symbols < self.carrier_duration {
            return invalid(format!(
                "pilot of {} symbols shorter than carrier duration {}",
                self.pilot_symbols, self.carrier_duration
            ));
        }
        if !(self.amplitude > 0.0 && self.amplitude <= 1.0) {
            return invalid(format!("amplitude {} outside (0, 1]", self.amplitude));
        }
        if self.timeout_secs <= 0.0 {
            return invalid("timeout must be positive".to_string());
        }
        Ok(())
    }

    /// Carrier phase advance per sample, in radians.
    pub fn omega(&self) -> f32 {
        2.0 * PI * self.carrier_freq / self.sample_rate
    }

    pub fn symbol_duration(&self) -> f32 {
        self.samples_per_symbol as f32 / self.sample_rate
    }

    /// Consecutive coherent windows needed for carrier lock.
    pub fn carrier_threshold(&self) -> usize {
        self.carrier_duration * 3 / 10
    }

    pub fn search_window(&self) -> usize {
        self.carrier_duration / 10
    }

    pub fn start_pattern_len(&self) -> usize {
        self.search_window() / 4
    }

    pub fn max_offset(&self) -> usize {
        (self.timeout_secs * self.sample_rate) as usize
    }

    pub fn squelch_timeout_samples(&self) -> usize {
        (self.squelch_timeout_secs * self.sample_rate) as usize
    }

    pub fn seconds_to_samples(&self, secs: f32) -> usize {
        (secs * self.sample_rate).round() as usize
    }
}

/// Link-layer behaviour of one station.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub my_callsign: Callsign,
    /// Hop budget stamped on frames we originate
    pub hops: u8,
    pub enable_forwarding: bool,
    /// Transmissions per acked message, the first one included
    pub ack_retries: u32,
    pub retransmit_interval: Duration,
    pub tx_cooldown: Duration,
    pub rx_cooldown: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            my_callsign: Callsign::new("N0CALL"),
            hops: 0,
            enable_forwarding: false,
            ack_retries: crate::DEFAULT_RETRY_CNT,
            retransmit_interval: Duration::from_secs(15),
            tx_cooldown: Duration::from_secs(1),
            rx_cooldown: Duration::from_millis(500),
        }
    }
}

impl LinkConfig {
    pub fn new(callsign: &str) -> Self {
        Self {
            my_callsign: Callsign::new(callsign),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.my_callsign.is_broadcast() {
            return Err(LinkError::InvalidConfig(
                "station callsign must not be blank".to_string(),
            ));
        }
        if self.hops > MAX_HOPS {
            return Err(LinkError::HopCountOutOfRange {
                hops: self.hops,
                hops_remaining: self.hops,
            });
        }
        if self.ack_retries == 0 {
            return Err(LinkError::InvalidConfig(
                "ack_retries must count at least the first transmission".to_string(),
            ));
        }
        Ok(())
    }
}
