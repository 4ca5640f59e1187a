// End-to-end frame tests: FEC and interleaving on raw bytes, then the full
// modem path from samples back to frames.
//
// The modem tests demodulate tens of thousands of samples; run them with
// `--release` when iterating.

use il2p_link_core::fec::BlockPartition;
use il2p_link_core::{
    transmit_frame, Callsign, DecodedFrame, DetectOutcome, FrameEngine, FrameHeader, FrameReceiver,
    ModemConfig, RxOutcome, SampleStream, ENCODED_HEADER_LEN, MAX_PAYLOAD_SIZE, MAX_RAW_FRAME_LEN,
};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

fn header_for(payload: &[u8]) -> FrameHeader {
    FrameHeader {
        request_ack: true,
        my_seq: 31337,
        hops: 1,
        hops_remaining: 1,
        ..FrameHeader::text(Callsign::new("KK6ABC"), Callsign::new("W1AW"), payload.len() as u16)
    }
}

fn test_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

/// XOR `count` distinct bytes of `region` with non-zero values.
fn corrupt(rng: &mut StdRng, region: &mut [u8], count: usize) {
    for idx in sample(rng, region.len(), count) {
        region[idx] ^= rng.gen_range(1..=255u8);
    }
}

fn decode_from_samples(samples: Vec<f32>) -> Vec<DecodedFrame> {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = ModemConfig::default();
    let mut receiver = FrameReceiver::<FrameHeader>::new(&config).expect("Failed to create receiver");
    let mut engine = FrameEngine::<FrameHeader>::new().expect("Failed to create engine");
    let mut stream = SampleStream::from_samples(samples);

    let mut frames = Vec::new();
    loop {
        match receiver.receive(&mut stream) {
            RxOutcome::Frame { raw, .. } => {
                frames.push(engine.decode_frame(&raw).expect("Header failed to decode"));
            }
            outcome if outcome.is_exhausted() => break,
            outcome => println!("no frame: {:?}", outcome),
        }
    }
    frames
}

#[test]
fn test_frame_round_trip_short() {
    let payload = b"hello!!";
    let header = header_for(payload);

    let mut engine = FrameEngine::<FrameHeader>::new().expect("Failed to create engine");
    let raw = engine.encode_frame(&header, payload).expect("Failed to encode");
    assert_eq!(raw.len(), ENCODED_HEADER_LEN + 18);

    let decoded = engine.decode_frame(&raw).expect("Failed to decode");
    assert_eq!(decoded.header, header);
    assert!(decoded.payload_ok);
    assert_eq!(decoded.payload, payload);
}

#[test]
fn test_frame_round_trip_max_payload() {
    let payload = test_payload(MAX_PAYLOAD_SIZE);
    let header = header_for(&payload);

    let mut engine = FrameEngine::<FrameHeader>::new().expect("Failed to create engine");
    let raw = engine.encode_frame(&header, &payload).expect("Failed to encode");
    assert_eq!(raw.len(), MAX_RAW_FRAME_LEN);
    assert_eq!(raw.len(), 1337);

    let decoded = engine.decode_frame(&raw).expect("Failed to decode");
    assert!(decoded.payload_ok);
    assert_eq!(decoded.payload, payload);
    assert_eq!(decoded.blocks.len(), 5);
}

#[test]
fn test_frame_corrects_errors_up_to_bound() {
    let mut rng = StdRng::seed_from_u64(7);
    let payload = test_payload(MAX_PAYLOAD_SIZE);
    let header = header_for(&payload);
    let partition = BlockPartition::for_payload(payload.len()).unwrap();
    let ecc = partition.ecc_sym_cnt;
    assert_eq!(ecc, 50);

    let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
    let mut raw = engine.encode_frame(&header, &payload).unwrap();

    corrupt(&mut rng, &mut raw[..ENCODED_HEADER_LEN], 16);
    let mut offset = ENCODED_HEADER_LEN;
    for len in partition.block_lens() {
        corrupt(&mut rng, &mut raw[offset..offset + len + ecc], ecc / 2);
        offset += len + ecc;
    }
    assert_eq!(offset, raw.len());

    let decoded = engine.decode_frame(&raw).expect("Header should survive 16 errors");
    assert_eq!(decoded.header, header);
    assert!(decoded.payload_ok);
    assert_eq!(decoded.payload, payload);
    for block in &decoded.blocks {
        assert_eq!(block.corrected, Some(ecc / 2), "block {}", block.index);
    }
}

#[test]
fn test_frame_block_failure_beyond_bound() {
    let mut rng = StdRng::seed_from_u64(99);
    let payload = test_payload(MAX_PAYLOAD_SIZE);
    let header = header_for(&payload);
    let partition = BlockPartition::for_payload(payload.len()).unwrap();
    let first_block = partition.large_block_len + partition.ecc_sym_cnt;

    let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
    let mut raw = engine.encode_frame(&header, &payload).unwrap();
    corrupt(
        &mut rng,
        &mut raw[ENCODED_HEADER_LEN..ENCODED_HEADER_LEN + first_block],
        40,
    );

    let decoded = engine.decode_frame(&raw).expect("Header was not touched");
    assert_eq!(decoded.header, header);
    assert!(!decoded.payload_ok);
    assert_eq!(decoded.payload.len(), payload.len());
    assert_eq!(decoded.blocks[0].corrected, None);
    assert!(decoded.blocks[1..].iter().all(|b| b.corrected == Some(0)));

    // The descrambler resynchronizes within two bytes of the failed block
    let clean_from = partition.large_block_len + 2;
    assert_eq!(decoded.payload[clean_from..], payload[clean_from..]);
}

#[test]
fn test_header_decodes_without_payload() {
    let payload = test_payload(300);
    let header = header_for(&payload);

    let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
    let raw = engine.encode_frame(&header, &payload).unwrap();

    let decoded = engine
        .decode_header(&raw[..ENCODED_HEADER_LEN])
        .expect("Header alone should decode");
    assert_eq!(decoded, header);
    assert!(engine.decode_header(&raw[..ENCODED_HEADER_LEN - 1]).is_err());
}

#[test]
fn test_modem_loopback_clean() {
    let config = ModemConfig::default();
    let payload = b"CQ CQ de KK6ABC";
    let header = header_for(payload);

    let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
    let raw = engine.encode_frame(&header, payload).unwrap();
    let samples = transmit_frame(&config, &raw).expect("Failed to modulate");
    println!("{} bytes -> {} samples", raw.len(), samples.len());

    let frames = decode_from_samples(samples);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header, header);
    assert!(frames[0].payload_ok);
    assert_eq!(frames[0].payload, payload);
    assert!(frames[0].blocks.iter().all(|b| b.corrected == Some(0)));
}

#[test]
fn test_modem_loopback_with_noise() {
    let config = ModemConfig::default();
    let payload = test_payload(400);
    let header = header_for(&payload);

    let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
    let raw = engine.encode_frame(&header, &payload).unwrap();
    let clean = transmit_frame(&config, &raw).unwrap();

    let mut rng = StdRng::seed_from_u64(2024);
    let noise = Normal::new(0.0f32, 0.1).unwrap();
    let samples: Vec<f32> = clean.iter().map(|&x| x + noise.sample(&mut rng)).collect();

    let frames = decode_from_samples(samples);
    assert_eq!(frames.len(), 1, "Expected exactly one frame through noise");
    assert_eq!(frames[0].header, header);
    assert!(frames[0].payload_ok);
    assert_eq!(frames[0].payload, payload);
}

/// Replay `samples` through a sound card clocked `ppm` parts per million
/// faster than the transmitter's, so carrier and symbols arrive compressed.
fn with_clock_offset(samples: &[f32], config: &ModemConfig, ppm: f64) -> Vec<f32> {
    let n = config.samples_per_symbol;
    let omega = config.omega() as f64;
    let ratio = 1.0 + ppm * 1e-6;
    let mut out = Vec::with_capacity(samples.len());
    for t in 0usize.. {
        let u = t as f64 * ratio;
        let k = (u / n as f64) as usize;
        if (k + 1) * n > samples.len() {
            break;
        }
        // Every symbol is a signed copy of the same carrier cycles
        let level = samples[k * n];
        out.push(level * (omega * (u - (k * n) as f64)).cos() as f32);
    }
    out
}

#[test]
fn test_modem_tracks_clock_offset() {
    let config = ModemConfig::default();
    let payload = test_payload(MAX_PAYLOAD_SIZE);
    let header = header_for(&payload);

    let mut engine = FrameEngine::<FrameHeader>::new().unwrap();
    let raw = engine.encode_frame(&header, &payload).unwrap();
    let clean = transmit_frame(&config, &raw).unwrap();

    // Over a full frame 100 ppm adds up to more than a whole symbol
    for ppm in [100.0, -100.0, 250.0] {
        let frames = decode_from_samples(with_clock_offset(&clean, &config, ppm));
        assert_eq!(frames.len(), 1, "no frame at {} ppm", ppm);
        assert_eq!(frames[0].header, header);
        assert!(frames[0].payload_ok, "payload damaged at {} ppm", ppm);
        assert_eq!(frames[0].payload, payload);
    }
}

#[test]
fn test_modem_back_to_back_frames() {
    let config = ModemConfig::default();
    let mut engine = FrameEngine::<FrameHeader>::new().unwrap();

    let mut samples = Vec::new();
    let mut sent = Vec::new();
    for (i, text) in ["first", "second frame", ""].iter().enumerate() {
        let header = FrameHeader {
            my_seq: i as u16,
            ..header_for(text.as_bytes())
        };
        let raw = engine.encode_frame(&header, text.as_bytes()).unwrap();
        samples.extend(transmit_frame(&config, &raw).unwrap());
        sent.push((header, text.as_bytes().to_vec()));
    }

    let frames = decode_from_samples(samples);
    assert_eq!(frames.len(), sent.len());
    for (frame, (header, payload)) in frames.iter().zip(&sent) {
        assert_eq!(&frame.header, header);
        assert_eq!(&frame.payload, payload);
    }
}

#[test]
fn test_noise_only_yields_no_frame() {
    let config = ModemConfig::default();
    let mut rng = StdRng::seed_from_u64(5);
    let noise = Normal::new(0.0f32, 0.2).unwrap();
    let samples: Vec<f32> = (0..40_000).map(|_| noise.sample(&mut rng)).collect();

    let mut receiver = FrameReceiver::<FrameHeader>::new(&config).unwrap();
    let mut stream = SampleStream::from_samples(samples);
    match receiver.receive(&mut stream) {
        RxOutcome::NotSynchronized(DetectOutcome::NoCarrier)
        | RxOutcome::NotSynchronized(DetectOutcome::SquelchActive) => {}
        other => panic!("unexpected outcome on noise: {:?}", other),
    }
}
