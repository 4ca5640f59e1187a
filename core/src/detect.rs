//! Carrier detection and frame synchronization.
//!
//! `Detector::run` walks IDLE → COHERENCE_ACCUMULATING → CARRIER_LOCKED →
//! BARKER_MATCHING → SYNCHRONIZED, or stops early with one of the ordinary
//! idle-channel outcomes in [`DetectOutcome`].

use crate::barker::BarkerMatcher;
use crate::config::ModemConfig;
use crate::dsp::{estimate, find_start, CarrierReference};
use crate::error::Result;
use crate::stream::SampleStream;
use crate::SQUELCH_PREROLL;
use log::debug;
use num_complex::Complex32;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    CoherenceAccumulating,
    CarrierLocked,
    BarkerMatching,
    Synchronized,
}

/// Everything the demodulator needs to pick up after the sync code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncLock {
    /// Stream position of the first symbol after the sync code
    pub position: u64,
    pub amplitude: f32,
    pub gain: f32,
    pub freq_error: f32,
    /// Correlation coefficient of the carrier onset
    pub onset_quality: f32,
    /// Last sync symbol, the phase reference for the next decision
    pub reference: Complex32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectOutcome {
    Synchronized(SyncLock),
    NoCarrier,
    NoSyncPattern,
    SquelchActive,
    TimedOut,
    Cancelled,
    SourceExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquelchStatus {
    Open,
    Closed,
    Cancelled,
    Exhausted,
}

/// Why a run was cut short from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Stop flag plus wall-clock deadline for one run.
pub(crate) struct RunGuard<'a> {
    stop: Option<&'a AtomicBool>,
    deadline: Instant,
}

impl<'a> RunGuard<'a> {
    pub(crate) fn new(stop: Option<&'a AtomicBool>, config: &ModemConfig) -> Self {
        Self {
            stop,
            deadline: Instant::now() + config.receive_timeout,
        }
    }

    pub(crate) fn check(&self) -> Option<Interrupt> {
        if self.stop.is_some_and(|stop| stop.load(Ordering::Relaxed)) {
            return Some(Interrupt::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Some(Interrupt::TimedOut);
        }
        None
    }
}

impl From<Interrupt> for DetectOutcome {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => DetectOutcome::Cancelled,
            Interrupt::TimedOut => DetectOutcome::TimedOut,
        }
    }
}

pub struct Detector {
    config: ModemConfig,
    reference: CarrierReference,
    state: DetectorState,
    stop: Option<Arc<AtomicBool>>,
    busy: Option<Arc<AtomicBool>>,
}

impl Detector {
    pub fn new(config: &ModemConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            reference: CarrierReference::from_config(config),
            state: DetectorState::Idle,
            stop: None,
            busy: None,
        })
    }

    /// Abandon any run in progress once `stop` is raised.
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Raise `busy` from carrier lock until the run fails or the frame ends.
    pub fn with_busy_flag(mut self, busy: Arc<AtomicBool>) -> Self {
        self.busy = Some(busy);
        self
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        if let Some(flag) = &self.busy {
            flag.store(busy, Ordering::Relaxed);
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    /// Wait for any sample above the squelch level.
    ///
    /// On success the last few hundred samples before the trigger are pushed
    /// back so the carrier search sees the start of the transmission.
    pub fn squelch(&mut self, stream: &mut SampleStream) -> SquelchStatus {
        let guard = RunGuard::new(self.stop.as_deref(), &self.config);
        let budget = self.config.squelch_timeout_samples();
        let mut preroll: VecDeque<f32> = VecDeque::with_capacity(SQUELCH_PREROLL + 1);

        for i in 0..budget {
            if i % self.config.samples_per_symbol == 0 && guard.check().is_some() {
                return SquelchStatus::Cancelled;
            }
            let Some(sample) = stream.next_sample() else {
                return SquelchStatus::Exhausted;
            };
            preroll.push_back(sample);
            if preroll.len() > SQUELCH_PREROLL {
                preroll.pop_front();
            }
            if sample.abs() > self.config.squelch {
                let (head, tail) = preroll.as_slices();
                let mut kept = head.to_vec();
                kept.extend_from_slice(tail);
                stream.unread(&kept);
                return SquelchStatus::Open;
            }
        }
        SquelchStatus::Closed
    }

    /// Squelch, carrier lock and sync-code search in one go.
    pub fn run(&mut self, stream: &mut SampleStream) -> DetectOutcome {
        self.state = DetectorState::Idle;
        let outcome = self.run_inner(stream);
        if !matches!(outcome, DetectOutcome::Synchronized(_)) {
            self.state = DetectorState::Idle;
            self.set_busy(false);
        }
        outcome
    }

    fn run_inner(&mut self, stream: &mut SampleStream) -> DetectOutcome {
        if self.config.squelch > 0.0 {
            match self.squelch(stream) {
                SquelchStatus::Open => {}
                SquelchStatus::Closed => return DetectOutcome::SquelchActive,
                SquelchStatus::Cancelled => return DetectOutcome::Cancelled,
                SquelchStatus::Exhausted => return DetectOutcome::SourceExhausted,
            }
        }

        let stop = self.stop.clone();
        let guard = RunGuard::new(stop.as_deref(), &self.config);
        let n = self.config.samples_per_symbol;
        let threshold = self.config.carrier_threshold();
        let search_window = self.config.search_window();
        let max_offset = self.config.max_offset();

        // Wait for CARRIER_THRESHOLD coherent windows in a row
        let mut history: VecDeque<Vec<f32>> = VecDeque::with_capacity(threshold + search_window + 1);
        let mut counter = 0usize;
        let mut windows = 0usize;
        loop {
            if let Some(interrupt) = guard.check() {
                return interrupt.into();
            }
            let Some(window) = stream.next_window(n) else {
                return DetectOutcome::SourceExhausted;
            };
            windows += 1;

            let coherent = self.reference.coherence(&window) > self.config.coherence_threshold;
            history.push_back(window);
            if history.len() > threshold + search_window {
                history.pop_front();
            }

            if coherent {
                counter += 1;
                self.state = DetectorState::CoherenceAccumulating;
                if counter >= threshold {
                    break;
                }
            } else {
                counter = 0;
                self.state = DetectorState::Idle;
                if windows * n > max_offset {
                    return DetectOutcome::NoCarrier;
                }
            }
        }

        self.state = DetectorState::CarrierLocked;
        self.set_busy(true);
        let trailing = stream.take((search_window + self.config.carrier_duration - threshold) * n);
        let mut buf: Vec<f32> = history.into_iter().flatten().collect();
        buf.extend(trailing);

        let Some((start, onset_quality)) =
            find_start(&buf, self.config.omega(), self.config.start_pattern_len() * n)
        else {
            stream.unread(&buf);
            return DetectOutcome::NoCarrier;
        };
        let pilot = &buf[start..];
        let carrier = estimate(pilot, &self.reference, self.config.carrier_duration, &self.config);
        stream.unread(pilot);

        if carrier.amplitude <= f32::EPSILON {
            return DetectOutcome::NoCarrier;
        }
        let gain = 1.0 / carrier.amplitude;
        debug!(
            "carrier locked after {} windows: onset {} (quality {:.3}), amplitude {:.3}, freq error {:.2e}",
            windows, start, onset_quality, carrier.amplitude, carrier.freq_error
        );

        self.state = DetectorState::BarkerMatching;
        let mut matcher = BarkerMatcher::sync_code();
        let mut previous: Option<Complex32> = None;
        for _ in 0..max_offset / n {
            if let Some(interrupt) = guard.check() {
                return interrupt.into();
            }
            let Some(window) = stream.next_window(n) else {
                return DetectOutcome::SourceExhausted;
            };
            let z = self.reference.demodulate(&window) * gain;
            if let Some(p) = previous {
                let flipped = (z * p.conj()).re < 0.0;
                if matcher.feed(flipped) {
                    self.state = DetectorState::Synchronized;
                    debug!("sync code found at sample {}", stream.position());
                    return DetectOutcome::Synchronized(SyncLock {
                        position: stream.position(),
                        amplitude: carrier.amplitude,
                        gain,
                        freq_error: carrier.freq_error,
                        onset_quality,
                        reference: z,
                    });
                }
            }
            previous = Some(z);
        }

        DetectOutcome::NoSyncPattern
    }
}
