//! Sample sources and sinks.

use crate::error::{LinkError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Pull-style sample source with push-back.
pub struct SampleStream {
    source: Box<dyn Iterator<Item = f32> + Send>,
    pending: VecDeque<f32>,
    position: u64,
}

impl SampleStream {
    pub fn new<I>(source: I) -> Self
    where
        I: IntoIterator<Item = f32>,
        I::IntoIter: Send + 'static,
    {
        Self {
            source: Box::new(source.into_iter()),
            pending: VecDeque::new(),
            position: 0,
        }
    }

    pub fn from_samples(samples: Vec<f32>) -> Self {
        Self::new(samples)
    }

    pub fn next_sample(&mut self) -> Option<f32> {
        let sample = self.pending.pop_front().or_else(|| self.source.next())?;
        self.position += 1;
        Some(sample)
    }

    /// Up to `n` samples; fewer only when the source runs dry.
    pub fn take(&mut self, n: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.next_sample() {
                Some(sample) => out.push(sample),
                None => break,
            }
        }
        out
    }

    /// Exactly `n` samples, or `None` once the source cannot fill a window.
    pub fn next_window(&mut self, n: usize) -> Option<Vec<f32>> {
        let window = self.take(n);
        (window.len() == n).then_some(window)
    }

    /// Push samples back so they are read again, in order, before anything else.
    pub fn unread(&mut self, samples: &[f32]) {
        for &sample in samples.iter().rev() {
            self.pending.push_front(sample);
        }
        self.position = self.position.saturating_sub(samples.len() as u64);
    }

    /// Samples consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }
}

/// Where the transmit path writes its samples.
pub trait SampleSink: Send {
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// No more samples will follow.
    fn close(&mut self) {}
}

impl SampleSink for Vec<f32> {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        self.extend_from_slice(samples);
        Ok(())
    }
}

struct Inbox {
    samples: Mutex<VecDeque<f32>>,
    closed: AtomicBool,
}

impl Inbox {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        })
    }
}

/// In-process audio link between two stations.
pub struct AudioChannel;

impl AudioChannel {
    /// Two endpoints; whatever one writes, the other reads.
    pub fn pair(sample_rate: f32) -> (ChannelEndpoint, ChannelEndpoint) {
        let a = Inbox::new();
        let b = Inbox::new();
        (
            ChannelEndpoint {
                inbox: a.clone(),
                peer: b.clone(),
                sample_rate,
            },
            ChannelEndpoint {
                inbox: b,
                peer: a,
                sample_rate,
            },
        )
    }
}

pub struct ChannelEndpoint {
    inbox: Arc<Inbox>,
    peer: Arc<Inbox>,
    sample_rate: f32,
}

impl ChannelEndpoint {
    pub fn split(self) -> (ChannelSource, ChannelSink) {
        let tick = Duration::from_millis(1);
        let silence_per_tick = ((self.sample_rate * tick.as_secs_f32()).round() as usize).max(1);
        (
            ChannelSource {
                inbox: self.inbox,
                silence: 0,
                silence_per_tick,
                tick,
            },
            ChannelSink { peer: self.peer },
        )
    }
}

/// Reads the endpoint's inbox. When nothing is queued it paces out silence at
/// roughly the sample rate, like an idle sound card would.
pub struct ChannelSource {
    inbox: Arc<Inbox>,
    silence: usize,
    silence_per_tick: usize,
    tick: Duration,
}

impl Iterator for ChannelSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        loop {
            if self.silence > 0 {
                self.silence -= 1;
                return Some(0.0);
            }
            let queued = match self.inbox.samples.lock() {
                Ok(mut samples) => samples.pop_front(),
                Err(_) => return None,
            };
            if queued.is_some() {
                return queued;
            }
            if self.inbox.closed.load(Ordering::Acquire) {
                return None;
            }
            thread::sleep(self.tick);
            self.silence = self.silence_per_tick;
        }
    }
}

impl Drop for ChannelSource {
    fn drop(&mut self) {
        self.inbox.closed.store(true, Ordering::Release);
    }
}

pub struct ChannelSink {
    peer: Arc<Inbox>,
}

impl SampleSink for ChannelSink {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        if self.peer.closed.load(Ordering::Acquire) {
            return Err(LinkError::ChannelClosed);
        }
        let mut inbox = self.peer.samples.lock().map_err(|_| LinkError::ChannelClosed)?;
        inbox.extend(samples.iter().copied());
        Ok(())
    }

    /// Ends the peer's source once it has drained what was already written.
    fn close(&mut self) {
        self.peer.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_and_windows() {
        let mut stream = SampleStream::from_samples((0..10).map(|i| i as f32).collect());
        assert_eq!(stream.take(3), vec![0.0, 1.0, 2.0]);
        assert_eq!(stream.next_window(4), Some(vec![3.0, 4.0, 5.0, 6.0]));
        assert_eq!(stream.position(), 7);
        assert_eq!(stream.next_window(4), None);
        assert_eq!(stream.next_sample(), None);
    }

    #[test]
    fn test_unread_preserves_order() {
        let mut stream = SampleStream::from_samples(vec![1.0, 2.0, 3.0, 4.0]);
        let head = stream.take(3);
        stream.unread(&head[1..]);
        assert_eq!(stream.position(), 1);
        assert_eq!(stream.take(10), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_channel_pair_delivers_to_peer() {
        let (a, b) = AudioChannel::pair(8000.0);
        let (_a_source, mut a_sink) = a.split();
        let (mut b_source, b_sink) = b.split();

        a_sink.write(&[0.25, -0.25]).unwrap();
        assert_eq!(b_source.next(), Some(0.25));
        assert_eq!(b_source.next(), Some(-0.25));

        // Idle channel yields silence
        assert_eq!(b_source.next(), Some(0.0));

        a_sink.close();
        let rest: Vec<f32> = b_source.by_ref().collect();
        assert!(rest.iter().all(|&x| x == 0.0));
        drop(b_sink);
    }

    #[test]
    fn test_write_after_reader_dropped() {
        let (a, b) = AudioChannel::pair(8000.0);
        let (_a_source, mut a_sink) = a.split();
        let (b_source, _b_sink) = b.split();
        drop(b_source);
        assert!(matches!(a_sink.write(&[0.1]), Err(LinkError::ChannelClosed)));
    }
}
