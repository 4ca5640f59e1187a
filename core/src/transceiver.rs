//! A running station: one receive thread and one transmit thread around a
//! shared [`LinkLayer`].

use crate::config::ModemConfig;
use crate::error::{LinkError, Result};
use crate::header::FrameHeader;
use crate::link::{FrameReader, FrameWriter, LinkEvent, LinkLayer};
use crate::recv::{FrameReceiver, ReceiveOutcome, RxOutcome};
use crate::stream::{SampleSink, SampleStream};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TX_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_damaged: AtomicU64,
    header_errors: AtomicU64,
    frames_sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub frames_received: u64,
    /// Frames whose payload failed FEC
    pub frames_damaged: u64,
    pub header_errors: u64,
    pub frames_sent: u64,
}

impl Counters {
    fn snapshot(&self) -> Stats {
        Stats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_damaged: self.frames_damaged.load(Ordering::Relaxed),
            header_errors: self.header_errors.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
        }
    }
}

/// Shared state the two threads need besides the link layer.
struct Shared {
    stop: Arc<AtomicBool>,
    /// Set while the receive thread is locked onto a transmission
    busy: Arc<AtomicBool>,
    counters: Counters,
    last_rx: Mutex<Option<Instant>>,
}

impl Shared {
    fn mark_rx(&self) {
        if let Ok(mut last) = self.last_rx.lock() {
            *last = Some(Instant::now());
        }
    }

    fn rx_quiet_for(&self, cooldown: Duration) -> bool {
        if self.busy.load(Ordering::Relaxed) {
            return false;
        }
        match self.last_rx.lock() {
            Ok(last) => last.map_or(true, |t| t.elapsed() >= cooldown),
            Err(_) => true,
        }
    }
}

pub struct Transceiver {
    link: Arc<Mutex<LinkLayer>>,
    events: Receiver<LinkEvent>,
    shared: Arc<Shared>,
    rx_thread: Option<JoinHandle<()>>,
    tx_thread: Option<JoinHandle<()>>,
}

impl Transceiver {
    /// Start listening on `source` and transmitting into `sink`.
    pub fn spawn<I, S>(modem: ModemConfig, link: LinkLayer, source: I, sink: S) -> Result<Self>
    where
        I: Iterator<Item = f32> + Send + 'static,
        S: SampleSink + 'static,
    {
        modem.validate()?;
        let stop = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(AtomicBool::new(false));
        let receiver = FrameReceiver::<FrameHeader>::new(&modem)?
            .with_stop_signal(stop.clone())
            .with_busy_flag(busy.clone());
        let reader = FrameReader::new()?;
        let writer = FrameWriter::new(&modem)?;

        let tx_cooldown = link.config().tx_cooldown;
        let rx_cooldown = link.config().rx_cooldown;
        info!("station {} on the air", link.callsign());

        let link = Arc::new(Mutex::new(link));
        let shared = Arc::new(Shared {
            stop,
            busy,
            counters: Counters::default(),
            last_rx: Mutex::new(None),
        });
        let (events_tx, events) = mpsc::channel();

        let rx_thread = {
            let link = link.clone();
            let shared = shared.clone();
            let events_tx = events_tx.clone();
            let stream = SampleStream::new(source);
            thread::Builder::new()
                .name("il2p-rx".to_string())
                .spawn(move || rx_loop(receiver, reader, stream, link, shared, events_tx))?
        };

        let tx_thread = {
            let link = link.clone();
            let tx_shared = shared.clone();
            let spawned = thread::Builder::new().name("il2p-tx".to_string()).spawn(move || {
                tx_loop(writer, sink, link, tx_shared, events_tx, tx_cooldown, rx_cooldown, modem.sample_rate)
            });
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    shared.stop.store(true, Ordering::Relaxed);
                    let _ = rx_thread.join();
                    return Err(e.into());
                }
            }
        };

        Ok(Self {
            link,
            events,
            shared,
            rx_thread: Some(rx_thread),
            tx_thread: Some(tx_thread),
        })
    }

    /// The link layer, for queuing messages.
    pub fn link(&self) -> Arc<Mutex<LinkLayer>> {
        self.link.clone()
    }

    pub fn events(&self) -> &Receiver<LinkEvent> {
        &self.events
    }

    pub fn stats(&self) -> Stats {
        self.shared.counters.snapshot()
    }

    /// Stop both threads and wait for them.
    pub fn shutdown(mut self) -> Stats {
        self.stop_threads();
        self.stats()
    }

    fn stop_threads(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        for handle in [self.tx_thread.take(), self.rx_thread.take()].into_iter().flatten() {
            if handle.join().is_err() {
                error!("transceiver thread panicked");
            }
        }
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

fn rx_loop(
    mut receiver: FrameReceiver<FrameHeader>,
    mut reader: FrameReader,
    mut stream: SampleStream,
    link: Arc<Mutex<LinkLayer>>,
    shared: Arc<Shared>,
    events: Sender<LinkEvent>,
) {
    let counters = &shared.counters;
    loop {
        let raw = match receiver.receive(&mut stream) {
            RxOutcome::Frame { raw, lock } => {
                debug!("frame of {} bytes at sample {}", raw.len(), lock.position);
                raw
            }
            outcome if outcome.is_exhausted() || outcome.is_cancelled() => {
                debug!("receive loop ending: {:?}", outcome);
                break;
            }
            RxOutcome::Lost(ReceiveOutcome::HeaderDecodeError) => {
                counters.header_errors.fetch_add(1, Ordering::Relaxed);
                shared.mark_rx();
                continue;
            }
            _ => continue,
        };
        shared.mark_rx();

        let frame = match reader.read(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping frame: {}", e);
                counters.header_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        counters.frames_received.fetch_add(1, Ordering::Relaxed);
        if !frame.payload_ok {
            counters.frames_damaged.fetch_add(1, Ordering::Relaxed);
        }

        let produced = match link.lock() {
            Ok(mut link) => link.process_frame(&frame),
            Err(_) => {
                error!("link state poisoned, receive loop ending");
                break;
            }
        };
        for event in produced {
            // Nobody listening is fine
            let _ = events.send(event);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn tx_loop<S: SampleSink>(
    mut writer: FrameWriter,
    mut sink: S,
    link: Arc<Mutex<LinkLayer>>,
    shared: Arc<Shared>,
    events: Sender<LinkEvent>,
    tx_cooldown: Duration,
    rx_cooldown: Duration,
    sample_rate: f32,
) {
    // Earliest moment the next transmission may start
    let mut next_slot = Instant::now();

    while !shared.stop.load(Ordering::Relaxed) {
        thread::sleep(TX_TICK);
        let now = Instant::now();
        if now < next_slot || !shared.rx_quiet_for(rx_cooldown) {
            continue;
        }

        let (message, produced) = match link.lock() {
            Ok(mut link) => (link.next_transmission(now), link.take_events()),
            Err(_) => {
                error!("link state poisoned, transmit loop ending");
                break;
            }
        };
        for event in produced {
            let _ = events.send(event);
        }
        let Some(message) = message else {
            continue;
        };

        let samples = match writer.modulate(&message) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("cannot encode seq {}: {}", message.header.my_seq, e);
                continue;
            }
        };
        match sink.write(&samples) {
            Ok(()) => {
                shared.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                let airtime = Duration::from_secs_f32(samples.len() as f32 / sample_rate);
                next_slot = Instant::now() + airtime + tx_cooldown;
                debug!(
                    "sent seq {} to {} ({:.2}s on air)",
                    message.header.my_seq,
                    message.header.dst_callsign,
                    airtime.as_secs_f32()
                );
            }
            Err(LinkError::ChannelClosed) => {
                info!("audio output closed, transmit loop ending");
                break;
            }
            Err(e) => warn!("audio output error: {}", e),
        }
    }
    sink.close();
}
