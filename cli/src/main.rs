use clap::{Parser, Subcommand};
use hound::WavSpec;
use il2p_link_core::{
    AckMode, AudioChannel, Callsign, FrameHeader, FrameReader, FrameReceiver, FrameWriter,
    LinkConfig, LinkEvent, LinkLayer, Location, ModemConfig, RxOutcome, SampleStream, Transceiver,
};
use log::{debug, info};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Parser)]
#[command(name = "il2p-link")]
#[command(about = "Packet radio link layer over an audio DBPSK modem")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode one frame to a WAV audio file
    Encode {
        /// Sending station callsign
        #[arg(long)]
        from: String,

        /// Destination callsign (blank for broadcast)
        #[arg(long, default_value = "")]
        to: String,

        /// Request an acknowledgment
        #[arg(long)]
        ack: bool,

        /// Request a double acknowledgment
        #[arg(long, conflicts_with = "ack")]
        double_ack: bool,

        /// Hop budget for digipeaters (0-3)
        #[arg(long, default_value = "0")]
        hops: u8,

        /// Pilot tone length in symbols
        #[arg(long)]
        pilot: Option<usize>,

        /// Text message payload
        #[arg(short, long, required_unless_present = "beacon", conflicts_with = "beacon")]
        message: Option<String>,

        /// Position beacon payload
        #[arg(long, value_name = "LAT,LON")]
        beacon: Option<String>,

        /// Output WAV file
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,
    },

    /// Decode every frame found in a WAV audio file
    Decode {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,
    },

    /// Run two stations over an in-process audio channel and exchange a message
    Chat {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(short, long)]
        message: String,

        /// Seconds to wait for the acknowledgment
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("Invalid beacon position {0:?}, expected LAT,LON")]
    BadPosition(String),

    #[error("Unsupported WAV format: {0}")]
    UnsupportedWav(String),

    #[error("Station state unavailable")]
    Poisoned,

    #[error("No acknowledgment within {0} s")]
    NoAck(u64),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Encode {
            from,
            to,
            ack,
            double_ack,
            hops,
            pilot,
            message,
            beacon,
            output,
        } => {
            let ack = match (ack, double_ack) {
                (_, true) => AckMode::Double,
                (true, false) => AckMode::Single,
                (false, false) => AckMode::None,
            };
            encode_command(&from, &to, ack, hops, pilot, message, beacon, &output)?
        }
        Commands::Decode { input } => decode_command(&input)?,
        Commands::Chat {
            from,
            to,
            message,
            timeout,
        } => chat_command(&from, &to, &message, timeout)?,
    }

    Ok(())
}

fn parse_position(text: &str) -> Result<Location, CliError> {
    let bad = || CliError::BadPosition(text.to_string());
    let (lat, lon) = text.split_once(',').ok_or_else(bad)?;
    let lat: f64 = lat.trim().parse().map_err(|_| bad())?;
    let lon: f64 = lon.trim().parse().map_err(|_| bad())?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(bad());
    }
    Ok(Location::new(lat, lon))
}

#[allow(clippy::too_many_arguments)]
fn encode_command(
    from: &str,
    to: &str,
    ack: AckMode,
    hops: u8,
    pilot: Option<usize>,
    message: Option<String>,
    beacon: Option<String>,
    output_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut modem = ModemConfig::default();
    if let Some(pilot) = pilot {
        modem.pilot_symbols = pilot;
    }

    let mut link = LinkLayer::new(LinkConfig {
        hops,
        ..LinkConfig::new(from)
    })?;
    let seq = match (message, beacon) {
        (_, Some(position)) => link.send_beacon(&parse_position(&position)?)?,
        (Some(text), None) => link.send_text(Callsign::new(to), &text, ack)?,
        (None, None) => return Err("either --message or --beacon is required".into()),
    };
    let Some(outbound) = link.next_transmission(Instant::now()) else {
        return Err("nothing queued".into());
    };

    let mut writer = FrameWriter::new(&modem)?;
    let raw = writer.encode(&outbound)?;
    let samples = writer.modulate(&outbound)?;
    println!(
        "Encoded seq {} ({} payload bytes, {} raw bytes) to {} audio samples",
        seq,
        outbound.payload.len(),
        raw.len(),
        samples.len()
    );

    write_wav(output_path, &samples, modem.sample_rate as u32)?;
    println!("Wrote {}", output_path.display());
    Ok(())
}

fn decode_command(input_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let modem = ModemConfig::default();
    let samples = read_wav(input_path, modem.sample_rate as u32)?;
    println!("Extracted {} samples", samples.len());

    let mut receiver = FrameReceiver::<FrameHeader>::new(&modem)?;
    let mut reader = FrameReader::new()?;
    let mut stream = SampleStream::from_samples(samples);
    let mut frames = 0;

    loop {
        let raw = match receiver.receive(&mut stream) {
            RxOutcome::Frame { raw, lock } => {
                debug!("lock at sample {} amplitude {:.3}", lock.position, lock.amplitude);
                raw
            }
            outcome if outcome.is_exhausted() => break,
            outcome => {
                debug!("no frame: {:?}", outcome);
                continue;
            }
        };
        let frame = match reader.read(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                println!("Dropped frame: {}", e);
                continue;
            }
        };
        frames += 1;
        print_frame(&frame.header, &frame.payload, frame.payload_ok);
    }

    println!("Decoded {} frame(s)", frames);
    Ok(())
}

fn print_frame(header: &FrameHeader, payload: &[u8], payload_ok: bool) {
    let dst = if header.dst_callsign.is_broadcast() {
        "*".to_string()
    } else {
        header.dst_callsign.trimmed()
    };
    println!(
        "{} -> {} via {} seq {} hops {}/{} ack {:?}",
        header.src_callsign.trimmed(),
        dst,
        header.link_src_callsign.trimmed(),
        header.my_seq,
        header.hops_remaining,
        header.hops,
        AckMode::from_header(header),
    );
    let acks = header.forwarded_acks();
    if !acks.is_empty() {
        println!("  acks: {:?}", acks);
    }
    if !payload_ok {
        println!("  payload damaged");
    }

    if header.is_text_msg {
        println!("  text: {}", il2p_link_core::messages::decode_text(payload));
    } else if header.is_beacon || header.is_waypoint {
        match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(value) => println!("  location: {}", value),
            Err(_) => println!("  location: unreadable ({} bytes)", payload.len()),
        }
    } else if !payload.is_empty() {
        println!("  {} payload bytes", payload.len());
    }
}

fn chat_command(from: &str, to: &str, message: &str, timeout: u64) -> Result<(), Box<dyn std::error::Error>> {
    let modem = ModemConfig::default();
    let station = |callsign: &str| {
        LinkLayer::new(LinkConfig {
            tx_cooldown: Duration::from_millis(200),
            rx_cooldown: Duration::from_millis(200),
            ..LinkConfig::new(callsign)
        })
    };

    let (a, b) = AudioChannel::pair(modem.sample_rate);
    let (a_source, a_sink) = a.split();
    let (b_source, b_sink) = b.split();
    let sender = Transceiver::spawn(modem.clone(), station(from)?, a_source, a_sink)?;
    let receiver = Transceiver::spawn(modem, station(to)?, b_source, b_sink)?;

    let seq = sender
        .link()
        .lock()
        .map_err(|_| CliError::Poisoned)?
        .send_text(Callsign::new(to), message, AckMode::Single)?;
    info!("queued seq {} from {} to {}", seq, from, to);

    let deadline = Instant::now() + Duration::from_secs(timeout);
    let poll = Duration::from_millis(50);
    let mut acked = false;
    while !acked && Instant::now() < deadline {
        for (name, station) in [(to, &receiver), (from, &sender)] {
            while let Ok(event) = station.events().recv_timeout(poll) {
                println!("[{}] {}", name, describe(&event));
                if matches!(event, LinkEvent::AckReceived { seq: s, .. } if s == seq) {
                    acked = true;
                }
            }
        }
    }

    let sent = sender.shutdown();
    let heard = receiver.shutdown();
    println!(
        "{}: {} sent, {} received; {}: {} sent, {} received",
        from, sent.frames_sent, sent.frames_received, to, heard.frames_sent, heard.frames_received
    );

    if acked {
        Ok(())
    } else {
        Err(CliError::NoAck(timeout).into())
    }
}

fn describe(event: &LinkEvent) -> String {
    match event {
        LinkEvent::TextReceived { src, text, intact, .. } => {
            let damaged = if *intact { "" } else { " (damaged)" };
            format!("text from {}: {}{}", src.trimmed(), text, damaged)
        }
        LinkEvent::LocationReceived { src, location } => {
            format!("beacon from {}: {}, {}", src.trimmed(), location.lat, location.lon)
        }
        LinkEvent::WaypointReceived { src, location, .. } => {
            format!("waypoint from {}: {}, {}", src.trimmed(), location.lat, location.lon)
        }
        LinkEvent::AckReceived { seq, from } => format!("ack for seq {} via {}", seq, from.trimmed()),
        LinkEvent::Retransmitting { seq, retries_left } => {
            format!("retransmitting seq {} ({} retries left)", seq, retries_left)
        }
        LinkEvent::RetriesExhausted { seq, dst } => {
            format!("gave up on seq {} to {}", seq, dst.trimmed())
        }
        LinkEvent::Forwarded { src, seq, hops_remaining } => {
            format!("forwarded seq {} from {} ({} hops left)", seq, src.trimmed(), hops_remaining)
        }
    }
}

fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), Box<dyn std::error::Error>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let file = File::create(path)?;
    let mut writer = hound::WavWriter::new(file, spec)?;
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clamped * 32767.0) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

fn read_wav(path: &Path, sample_rate: u32) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let mut reader = hound::WavReader::new(file)?;

    let spec = reader.spec();
    println!(
        "Read WAV: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );
    if spec.sample_rate != sample_rate || spec.channels != 1 {
        return Err(CliError::UnsupportedWav(format!(
            "need mono at {} Hz, got {} channel(s) at {} Hz",
            sample_rate, spec.channels, spec.sample_rate
        ))
        .into());
    }

    let samples = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => {
            let int_samples: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
            int_samples?.into_iter().map(|s| s as f32 / 32768.0).collect()
        }
        (hound::SampleFormat::Float, 32) => {
            let float_samples: Result<Vec<f32>, _> = reader.samples::<f32>().collect();
            float_samples?
        }
        (format, bits) => {
            return Err(CliError::UnsupportedWav(format!("{:?} {} bits", format, bits)).into());
        }
    };
    Ok(samples)
}
