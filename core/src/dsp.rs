//! Matched filtering against the carrier and the measurements built on it.

use crate::config::ModemConfig;
use num_complex::Complex32;
use std::f32::consts::{PI, SQRT_2};

/// Symbols dropped at each end of the pilot before estimating amplitude.
pub const ESTIMATE_SKIP: usize = 5;

/// One symbol of `e^{-jωn}`; symbols hold whole carrier cycles so the same
/// taps serve every window.
#[derive(Debug, Clone)]
pub struct CarrierReference {
    taps: Vec<Complex32>,
    scale: f32,
}

impl CarrierReference {
    pub fn new(omega: f32, samples_per_symbol: usize) -> Self {
        let taps = (0..samples_per_symbol)
            .map(|n| Complex32::from_polar(1.0, -omega * n as f32))
            .collect();
        Self {
            taps,
            scale: samples_per_symbol as f32 / 2.0,
        }
    }

    pub fn from_config(config: &ModemConfig) -> Self {
        Self::new(config.omega(), config.samples_per_symbol)
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    fn correlate(&self, window: &[f32]) -> Complex32 {
        window
            .iter()
            .zip(&self.taps)
            .map(|(&x, &tap)| tap * x)
            .sum()
    }

    /// Complex symbol value; `A·cos(ωn + φ)` comes out as `A·e^{jφ}`.
    pub fn demodulate(&self, window: &[f32]) -> Complex32 {
        self.correlate(window) / self.scale
    }

    /// Normalized correlation with the carrier: 1.0 for a clean tone, near 0 for noise.
    pub fn coherence(&self, window: &[f32]) -> f32 {
        let energy: f32 = window.iter().map(|x| x * x).sum();
        if energy <= f32::EPSILON {
            return 0.0;
        }
        self.correlate(window).norm() / self.scale.sqrt() / energy.sqrt()
    }
}

/// Find where the carrier starts inside `buf`.
///
/// Correlates against a step template: `pattern_len` samples of silence then
/// `pattern_len` samples of carrier. Returns the sample index of the carrier
/// onset and the correlation coefficient there (1.0 for a clean step).
pub fn find_start(buf: &[f32], omega: f32, pattern_len: usize) -> Option<(usize, f32)> {
    let template_len = 2 * pattern_len;
    if pattern_len == 0 || buf.len() < template_len {
        return None;
    }

    let tone: Vec<Complex32> = (0..pattern_len)
        .map(|n| Complex32::from_polar(1.0, -omega * n as f32))
        .collect();
    let template_norm = (pattern_len as f32).sqrt();

    let mut energy = Vec::with_capacity(buf.len() + 1);
    energy.push(0.0f32);
    for &x in buf {
        let last = energy[energy.len() - 1];
        energy.push(last + x * x);
    }

    let mut best = (0usize, 0.0f32);
    for i in 0..=buf.len() - template_len {
        let window_energy = energy[i + template_len] - energy[i];
        if window_energy <= f32::EPSILON {
            continue;
        }
        let corr: Complex32 = buf[i + pattern_len..i + template_len]
            .iter()
            .zip(&tone)
            .map(|(&x, &t)| t * x)
            .sum();
        let coeff = SQRT_2 * corr.norm() / (template_norm * window_energy.sqrt());
        if coeff > best.1 {
            best = (i, coeff);
        }
    }

    Some((best.0 + pattern_len, best.1))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CarrierEstimate {
    pub amplitude: f32,
    /// Relative carrier frequency error
    pub freq_error: f32,
}

/// Estimate pilot amplitude and frequency error from `symbols` pilot symbols
/// starting at `pilot[0]`.
pub fn estimate(pilot: &[f32], reference: &CarrierReference, symbols: usize, config: &ModemConfig) -> CarrierEstimate {
    let n = reference.len();
    let available = (pilot.len() / n).min(symbols);
    let (start, end) = if available > 2 * ESTIMATE_SKIP {
        (ESTIMATE_SKIP, available - ESTIMATE_SKIP)
    } else {
        (0, available)
    };

    let values: Vec<Complex32> = (start..end)
        .map(|k| reference.demodulate(&pilot[k * n..(k + 1) * n]))
        .collect();
    if values.is_empty() {
        return CarrierEstimate {
            amplitude: 0.0,
            freq_error: 0.0,
        };
    }

    let amplitude = values.iter().map(|z| z.norm()).sum::<f32>() / values.len() as f32;

    // Phase drift per symbol by least squares over the unwrapped phase
    let mut phases = Vec::with_capacity(values.len());
    let mut offset = 0.0f32;
    let mut previous = values[0].arg();
    for z in &values {
        let mut phase = z.arg();
        let delta = phase - previous;
        if delta > PI {
            offset -= 2.0 * PI;
        } else if delta < -PI {
            offset += 2.0 * PI;
        }
        previous = phase;
        phase += offset;
        phases.push(phase);
    }

    let count = phases.len() as f32;
    let mean_k = (count - 1.0) / 2.0;
    let mean_phase = phases.iter().sum::<f32>() / count;
    let (mut num, mut den) = (0.0f32, 0.0f32);
    for (k, phase) in phases.iter().enumerate() {
        let dk = k as f32 - mean_k;
        num += dk * (phase - mean_phase);
        den += dk * dk;
    }
    let slope = if den > 0.0 { num / den } else { 0.0 };
    let cycles_per_symbol = slope / (2.0 * PI);
    let freq_error = cycles_per_symbol / (config.symbol_duration() * config.carrier_freq);

    CarrierEstimate {
        amplitude,
        freq_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(config: &ModemConfig, amplitude: f32, phase: f32, samples: usize) -> Vec<f32> {
        let omega = config.omega();
        (0..samples)
            .map(|n| amplitude * (omega * n as f32 + phase).cos())
            .collect()
    }

    #[test]
    fn test_demodulate_recovers_amplitude_and_phase() {
        let config = ModemConfig::default();
        let reference = CarrierReference::from_config(&config);
        let window = tone(&config, 0.5, 0.3, config.samples_per_symbol);

        let z = reference.demodulate(&window);
        assert!((z.norm() - 0.5).abs() < 1e-4);
        assert!((z.arg() - 0.3).abs() < 1e-4);
    }

    #[test]
    fn test_coherence() {
        let config = ModemConfig::default();
        let reference = CarrierReference::from_config(&config);

        let clean = tone(&config, 0.2, 1.0, config.samples_per_symbol);
        assert!((reference.coherence(&clean) - 1.0).abs() < 1e-3);

        assert_eq!(reference.coherence(&[0.0; 8]), 0.0);

        // Off-carrier tone at 1 kHz
        let other: Vec<f32> = (0..8)
            .map(|n| (2.0 * PI * 1000.0 * n as f32 / 8000.0).cos())
            .collect();
        assert!(reference.coherence(&other) < 0.1);
    }

    #[test]
    fn test_find_start_locates_onset() {
        let config = ModemConfig::default();
        let onset = 203;
        let mut buf = vec![0.0f32; onset];
        buf.extend(tone(&config, 0.5, 0.0, 600));

        let (start, coeff) = find_start(&buf, config.omega(), 40).unwrap();
        assert!((start as i64 - onset as i64).abs() <= 1, "start {}", start);
        assert!(coeff > 0.95);
    }

    #[test]
    fn test_find_start_too_short() {
        assert!(find_start(&[0.0; 10], 1.0, 40).is_none());
    }

    #[test]
    fn test_estimate_amplitude() {
        let config = ModemConfig::default();
        let reference = CarrierReference::from_config(&config);
        let pilot = tone(&config, 0.35, 2.0, 200 * config.samples_per_symbol);

        let est = estimate(&pilot, &reference, 200, &config);
        assert!((est.amplitude - 0.35).abs() < 1e-3);
        assert!(est.freq_error.abs() < 1e-3);
    }
}
