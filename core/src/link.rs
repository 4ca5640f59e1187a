//! Link layer: addressing, acknowledgment, retries and hop-count forwarding.

use crate::config::{LinkConfig, ModemConfig};
use crate::error::{LinkError, Result};
use crate::frame::{DecodedFrame, FrameEngine};
use crate::header::{Callsign, FrameHeader};
use crate::messages::{decode_text, AckMode, AckSequenceList, Location, OutboundMessage, PendingAck};
use crate::send::transmit_frame;
use crate::MAX_PAYLOAD_SIZE;
use log::{debug, info, warn};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Instant;

const RECENT_FRAMES: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    TextReceived {
        src: Callsign,
        dst: Callsign,
        text: String,
        seq: Option<u16>,
        /// False when some payload blocks failed FEC
        intact: bool,
    },
    LocationReceived {
        src: Callsign,
        location: Location,
    },
    WaypointReceived {
        src: Callsign,
        dst: Callsign,
        location: Location,
    },
    AckReceived {
        seq: u16,
        from: Callsign,
    },
    Retransmitting {
        seq: u16,
        retries_left: u32,
    },
    RetriesExhausted {
        seq: u16,
        dst: Callsign,
    },
    Forwarded {
        src: Callsign,
        seq: u16,
        hops_remaining: u8,
    },
}

/// Per-station link state. Shared between the receive and transmit threads
/// behind a mutex.
pub struct LinkLayer {
    config: LinkConfig,
    next_seq: u16,
    outbound: VecDeque<OutboundMessage>,
    pending: HashMap<u16, PendingAck>,
    forward_acks: AckSequenceList,
    recent: VecDeque<u64>,
    events: Vec<LinkEvent>,
}

impl LinkLayer {
    pub fn new(config: LinkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            next_seq: rand::random(),
            outbound: VecDeque::new(),
            pending: HashMap::new(),
            forward_acks: AckSequenceList::new(),
            recent: VecDeque::with_capacity(RECENT_FRAMES),
            events: Vec::new(),
        })
    }

    pub fn callsign(&self) -> Callsign {
        self.config.my_callsign
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn allocate_seq(&mut self) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    fn originate(&mut self, dst: Callsign, payload: &[u8]) -> Result<FrameHeader> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge(payload.len()));
        }
        let me = self.config.my_callsign;
        Ok(FrameHeader {
            hops: self.config.hops,
            hops_remaining: self.config.hops,
            my_seq: self.allocate_seq(),
            is_text_msg: false,
            ..FrameHeader::text(me, dst, payload.len() as u16)
        })
    }

    /// Queue a text message; returns its sequence number.
    pub fn send_text(&mut self, dst: Callsign, text: &str, ack: AckMode) -> Result<u16> {
        let payload = text.as_bytes().to_vec();
        let mut header = self.originate(dst, &payload)?;
        header.is_text_msg = true;
        ack.apply(&mut header);
        let seq = header.my_seq;
        self.outbound.push_back(OutboundMessage::new(header, payload));
        Ok(seq)
    }

    /// Queue a broadcast position beacon.
    pub fn send_beacon(&mut self, location: &Location) -> Result<u16> {
        let payload = location.to_payload()?;
        let mut header = self.originate(Callsign::BROADCAST, &payload)?;
        header.is_beacon = true;
        let seq = header.my_seq;
        self.outbound.push_back(OutboundMessage::new(header, payload));
        Ok(seq)
    }

    pub fn send_waypoint(&mut self, dst: Callsign, location: &Location, ack: AckMode) -> Result<u16> {
        let payload = location.to_payload()?;
        let mut header = self.originate(dst, &payload)?;
        header.is_waypoint = true;
        ack.apply(&mut header);
        let seq = header.my_seq;
        self.outbound.push_back(OutboundMessage::new(header, payload));
        Ok(seq)
    }

    fn queue_ack(&mut self, to: Callsign) {
        let Ok(header) = self.originate(to, &[]) else {
            return;
        };
        self.outbound.push_back(OutboundMessage::new(header, Vec::new()));
    }

    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Sequence numbers still waiting for an ack.
    pub fn pending_acks(&self) -> Vec<u16> {
        let mut seqs: Vec<u16> = self.pending.keys().copied().collect();
        seqs.sort_unstable();
        seqs
    }

    /// Events raised outside [`process_frame`](Self::process_frame), such
    /// as retransmissions and exhausted retries.
    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.events)
    }

    /// Next frame to put on the air: queued messages first, then due retries.
    pub fn next_transmission(&mut self, now: Instant) -> Option<OutboundMessage> {
        let mut message = match self.outbound.pop_front() {
            Some(message) => {
                self.track_ack(&message, now);
                message
            }
            None => self.due_retry(now)?,
        };
        message
            .header
            .set_forwarded_acks(self.forward_acks.acks(), self.forward_acks.data());
        Some(message)
    }

    fn track_ack(&mut self, message: &OutboundMessage, now: Instant) {
        let header = &message.header;
        let Some(seq) = message.ack_seq() else {
            return;
        };
        if header.dst_callsign.is_broadcast()
            || header.src_callsign != self.config.my_callsign
            || message.attempt > 0
        {
            return;
        }
        self.pending
            .insert(seq, PendingAck::new(message.clone(), self.config.ack_retries, now));
    }

    fn due_retry(&mut self, now: Instant) -> Option<OutboundMessage> {
        let interval = self.config.retransmit_interval;

        let exhausted: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| {
                p.retries_left() == 0 && now.saturating_duration_since(p.last_attempt()) > interval
            })
            .map(|(seq, _)| *seq)
            .collect();
        for seq in exhausted {
            if let Some(p) = self.pending.remove(&seq) {
                warn!("no ack for seq {} to {}", seq, p.message.header.dst_callsign);
                self.events.push(LinkEvent::RetriesExhausted {
                    seq,
                    dst: p.message.header.dst_callsign,
                });
            }
        }

        let seq = self
            .pending
            .iter()
            .filter(|(_, p)| p.ready(now, interval))
            .min_by_key(|(_, p)| p.last_attempt())
            .map(|(seq, _)| *seq)?;
        let pending = self.pending.get_mut(&seq)?;
        let retries_left = pending.decrement(now);
        let message = pending.message.clone();

        info!("retransmitting seq {} ({} retries left)", seq, retries_left);
        self.events.push(LinkEvent::Retransmitting { seq, retries_left });
        Some(message)
    }

    fn first_sighting(&mut self, frame: &DecodedFrame) -> bool {
        let mut hasher = DefaultHasher::new();
        frame.header.src_callsign.hash(&mut hasher);
        frame.header.my_seq.hash(&mut hasher);
        frame.payload.hash(&mut hasher);
        let key = hasher.finish();

        if self.recent.contains(&key) {
            return false;
        }
        if self.recent.len() == RECENT_FRAMES {
            self.recent.pop_front();
        }
        self.recent.push_back(key);
        true
    }

    /// Handle a received frame and return every event not yet taken,
    /// retry events from earlier transmissions included.
    pub fn process_frame(&mut self, frame: &DecodedFrame) -> Vec<LinkEvent> {
        self.handle_frame(frame);
        self.take_events()
    }

    fn handle_frame(&mut self, frame: &DecodedFrame) {
        let me = self.config.my_callsign;
        let header = &frame.header;
        if header.src_callsign == me || header.link_src_callsign == me {
            debug!("ignoring our own frame seq {}", header.my_seq);
            return;
        }

        for seq in header.forwarded_acks() {
            if self.pending.remove(&seq).is_some() {
                info!("seq {} acked via {}", seq, header.link_src_callsign);
                self.events.push(LinkEvent::AckReceived {
                    seq,
                    from: header.link_src_callsign,
                });
            } else if self.config.enable_forwarding {
                self.forward_acks.push(seq);
            }
        }

        let first = self.first_sighting(frame);
        let src = header.src_callsign;
        let for_us = header.dst_callsign == me || header.dst_callsign.is_broadcast();

        if for_us {
            if let Some(seq) = header.ack_request() {
                self.forward_acks.push(seq);
                let copies = if AckMode::from_header(header) == AckMode::Double { 2 } else { 1 };
                for _ in 0..copies {
                    self.queue_ack(src);
                }
            }
            if first {
                self.deliver(frame);
            }
            return;
        }

        if self.config.enable_forwarding && header.hops_remaining > 0 && first {
            if !frame.payload_ok {
                warn!("not forwarding damaged frame seq {} from {}", header.my_seq, src);
                return;
            }
            let mut forwarded = header.clone();
            forwarded.hops_remaining -= 1;
            forwarded.link_src_callsign = me;
            info!(
                "forwarding seq {} from {} to {} ({} hops left)",
                forwarded.my_seq, src, forwarded.dst_callsign, forwarded.hops_remaining
            );
            self.events.push(LinkEvent::Forwarded {
                src,
                seq: forwarded.my_seq,
                hops_remaining: forwarded.hops_remaining,
            });
            self.outbound
                .push_back(OutboundMessage::new(forwarded, frame.payload.clone()));
        }
    }

    fn deliver(&mut self, frame: &DecodedFrame) {
        let header = &frame.header;
        if header.is_text_msg {
            let text = decode_text(&frame.payload);
            if !frame.payload_ok {
                warn!("text from {} arrived damaged", header.src_callsign);
            }
            info!("text from {}: {:?}", header.src_callsign, text);
            self.events.push(LinkEvent::TextReceived {
                src: header.src_callsign,
                dst: header.dst_callsign,
                text,
                seq: header.ack_request(),
                intact: frame.payload_ok,
            });
        } else if header.is_beacon || header.is_waypoint {
            let location = match Location::from_payload(&frame.payload) {
                Ok(location) => location,
                Err(e) => {
                    warn!("unreadable location from {}: {}", header.src_callsign, e);
                    return;
                }
            };
            self.events.push(if header.is_beacon {
                LinkEvent::LocationReceived {
                    src: header.src_callsign,
                    location,
                }
            } else {
                LinkEvent::WaypointReceived {
                    src: header.src_callsign,
                    dst: header.dst_callsign,
                    location,
                }
            });
        }
    }
}

/// Turns outbound messages into raw frames and audio.
pub struct FrameWriter {
    engine: FrameEngine,
    modem: ModemConfig,
}

impl FrameWriter {
    pub fn new(modem: &ModemConfig) -> Result<Self> {
        modem.validate()?;
        Ok(Self {
            engine: FrameEngine::new()?,
            modem: modem.clone(),
        })
    }

    pub fn encode(&mut self, message: &OutboundMessage) -> Result<Vec<u8>> {
        self.engine.encode_frame(&message.header, &message.payload)
    }

    pub fn modulate(&mut self, message: &OutboundMessage) -> Result<Vec<f32>> {
        let raw = self.encode(message)?;
        transmit_frame(&self.modem, &raw)
    }
}

/// Turns raw frames back into headers and payloads.
pub struct FrameReader {
    engine: FrameEngine,
}

impl FrameReader {
    pub fn new() -> Result<Self> {
        Ok(Self {
            engine: FrameEngine::new()?,
        })
    }

    pub fn read(&mut self, raw: &[u8]) -> Result<DecodedFrame> {
        self.engine.decode_frame(raw)
    }
}
