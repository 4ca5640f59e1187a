use std::fs;
use std::path::PathBuf;
use std::process::Command;

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_il2p-link"))
}

fn tmp_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("il2p-link-tests");
    fs::create_dir_all(&dir).ok();
    dir.join(name)
}

fn run_il2p_link(args: &[&str]) -> (bool, String) {
    let output = Command::new(binary())
        .args(args)
        .output()
        .expect("Failed to execute il2p-link");

    let text =
        String::from_utf8_lossy(&output.stderr).to_string() + &String::from_utf8_lossy(&output.stdout);
    (output.status.success(), text)
}

#[test]
fn test_encode_writes_wav() {
    let output = tmp_path("encode_writes_wav.wav");
    let (ok, text) = run_il2p_link(&[
        "encode",
        "--from",
        "KK6ABC",
        "--to",
        "W1AW",
        "--message",
        "Test message",
        output.to_str().unwrap(),
    ]);

    assert!(ok, "encode failed: {}", text);
    assert!(text.contains("Encoded seq"), "unexpected output: {}", text);

    // 0.2 s of silence, 267 lead-in symbols and 86 frame bytes, 16-bit mono
    let size = fs::metadata(&output).expect("Output file not created").len();
    assert!(size > 15_000, "File too small: {} bytes", size);
    assert!(size < 25_000, "File too large: {} bytes", size);
}

#[test]
fn test_encode_then_decode_text() {
    let wav = tmp_path("round_trip_text.wav");
    let (ok, text) = run_il2p_link(&[
        "encode",
        "--from",
        "KK6ABC",
        "--to",
        "W1AW",
        "--ack",
        "--hops",
        "2",
        "--message",
        "hello over the air",
        wav.to_str().unwrap(),
    ]);
    assert!(ok, "encode failed: {}", text);

    let (ok, text) = run_il2p_link(&["decode", wav.to_str().unwrap()]);
    assert!(ok, "decode failed: {}", text);
    assert!(text.contains("KK6ABC -> W1AW"), "header missing: {}", text);
    assert!(text.contains("hops 2/2"), "hop counts missing: {}", text);
    assert!(text.contains("text: hello over the air"), "payload missing: {}", text);
    assert!(text.contains("Decoded 1 frame(s)"), "frame count wrong: {}", text);
}

#[test]
fn test_encode_then_decode_beacon() {
    let wav = tmp_path("round_trip_beacon.wav");
    let (ok, text) = run_il2p_link(&[
        "encode",
        "--from",
        "KK6ABC",
        "--beacon",
        "37.5,-122.25",
        wav.to_str().unwrap(),
    ]);
    assert!(ok, "encode failed: {}", text);

    let (ok, text) = run_il2p_link(&["decode", wav.to_str().unwrap()]);
    assert!(ok, "decode failed: {}", text);
    assert!(text.contains("KK6ABC -> *"), "broadcast header missing: {}", text);
    assert!(text.contains("\"lat\":37.5"), "location missing: {}", text);
}

#[test]
fn test_bad_beacon_rejected() {
    let wav = tmp_path("bad_beacon.wav");
    let (ok, text) = run_il2p_link(&[
        "encode",
        "--from",
        "KK6ABC",
        "--beacon",
        "north",
        wav.to_str().unwrap(),
    ]);
    assert!(!ok);
    assert!(text.contains("BadPosition"), "unexpected output: {}", text);
}

#[test]
fn test_too_many_hops_rejected() {
    let wav = tmp_path("too_many_hops.wav");
    let (ok, text) = run_il2p_link(&[
        "encode",
        "--from",
        "KK6ABC",
        "--hops",
        "4",
        "--message",
        "hi",
        wav.to_str().unwrap(),
    ]);
    assert!(!ok);
    assert!(text.contains("HopCountOutOfRange"), "unexpected output: {}", text);
}

#[test]
fn test_decode_silence_finds_nothing() {
    let wav = tmp_path("silence.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&wav, spec).unwrap();
    for _ in 0..16_000 {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();

    let (ok, text) = run_il2p_link(&["decode", wav.to_str().unwrap()]);
    assert!(ok, "decode failed: {}", text);
    assert!(text.contains("Decoded 0 frame(s)"), "unexpected output: {}", text);
}

#[test]
fn test_chat_delivers_and_acks() {
    let (ok, text) = run_il2p_link(&[
        "chat",
        "--from",
        "KK6ABC",
        "--to",
        "W1AW",
        "--message",
        "anyone on frequency",
        "--timeout",
        "60",
    ]);
    assert!(ok, "chat failed: {}", text);
    assert!(
        text.contains("[W1AW] text from KK6ABC: anyone on frequency"),
        "message not delivered: {}",
        text
    );
    assert!(text.contains("[KK6ABC] ack for seq"), "no ack: {}", text);
    assert!(text.contains("W1AW: 1 sent"), "unexpected stats: {}", text);
}

#[test]
fn test_chat_gives_up_without_ack() {
    let (ok, text) = run_il2p_link(&[
        "chat",
        "--from",
        "KK6ABC",
        "--to",
        "W1AW",
        "--message",
        "too late",
        "--timeout",
        "0",
    ]);
    assert!(!ok);
    assert!(text.contains("NoAck(0)"), "unexpected output: {}", text);
}
