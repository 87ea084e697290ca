//! The command line tools, run against grammar and capture files written to
//! temporary locations.

use pretty_assertions::assert_eq;
use std::io::Write;
use std::process::Command;
use tempfile::NamedTempFile;

const GRAMMAR: &str = r#"
symbol "Ping" {
    kind: uint8(1);
    seq: uint16();
}

symbol "Text" {
    kind: uint8(2);
    len: size(body);
    body: ascii(1..=8);
}
"#;

fn grammar_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("tempfile");
    file.write_all(GRAMMAR.as_bytes()).expect("write grammar");
    file
}

/// Ethernet + IPv4 + UDP frame around `payload`.
fn udp_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 1, 0x02, 0, 0, 0, 0, 2, 0x08, 0x00]);
    let total = (20 + 8 + payload.len()) as u16;
    frame.extend_from_slice(&[0x45, 0, (total >> 8) as u8, total as u8, 0, 0, 0x40, 0, 64, 17, 0, 0]);
    frame.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2]);
    let udp_len = (8 + payload.len()) as u16;
    frame.extend_from_slice(&[0x30, 0x39, 0x30, 0x39, (udp_len >> 8) as u8, udp_len as u8, 0, 0]);
    frame.extend_from_slice(payload);
    frame
}

/// Little-endian legacy pcap with an Ethernet link type.
fn capture_file(payloads: &[&[u8]]) -> NamedTempFile {
    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    for (i, payload) in payloads.iter().enumerate() {
        let frame = udp_frame(payload);
        out.extend_from_slice(&(i as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&frame);
    }
    let mut file = NamedTempFile::new().expect("tempfile");
    file.write_all(&out).expect("write capture");
    file
}

#[test]
fn specialize_prints_one_hex_line_per_message() {
    let grammar = grammar_file();
    let output = Command::new(env!("CARGO_BIN_EXE_specialize"))
        .arg(grammar.path())
        .args(["Text", "-n", "5", "--seed", "3"])
        .output()
        .expect("run specialize");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout).expect("utf8");
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 5);
    for line in lines {
        let bytes = hex::decode(line).expect("hex line");
        assert_eq!(bytes[0], 2);
        assert_eq!(usize::from(bytes[1]), bytes.len() - 2);
    }

    let again = Command::new(env!("CARGO_BIN_EXE_specialize"))
        .arg(grammar.path())
        .args(["Text", "-n", "5", "--seed", "3"])
        .output()
        .expect("run specialize");
    assert_eq!(String::from_utf8(again.stdout).expect("utf8"), stdout);
}

#[test]
fn repeated_messages_log_nothing_at_the_default_level() {
    let grammar = grammar_file();
    let output = Command::new(env!("CARGO_BIN_EXE_specialize"))
        .env_remove("RUST_LOG")
        .arg(grammar.path())
        .args(["Ping", "-n", "3", "--seed", "1"])
        .output()
        .expect("run specialize");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stderr), "");
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 3);
}

#[test]
fn specialize_rejects_unknown_symbol() {
    let grammar = grammar_file();
    let output = Command::new(env!("CARGO_BIN_EXE_specialize"))
        .arg(grammar.path())
        .arg("Nope")
        .output()
        .expect("run specialize");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown symbol Nope"));
}

#[test]
fn abstract_pcap_counts_symbols() {
    let grammar = grammar_file();
    let payloads: [&[u8]; 4] = [&[1, 0, 7], b"\x02\x02hi", &[9, 9], &[1, 0xff, 0xff]];
    let capture = capture_file(&payloads);
    let output = Command::new(env!("CARGO_BIN_EXE_abstract_pcap"))
        .arg(grammar.path())
        .arg(capture.path())
        .arg("--verbose")
        .output()
        .expect("run abstract_pcap");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("packets: 4"), "{}", stderr);
    assert!(stderr.contains("udp payloads: 4"), "{}", stderr);
    assert!(stderr.contains("unknown: 1"), "{}", stderr);
    assert!(stderr.contains("  Ping: 2"), "{}", stderr);
    assert!(stderr.contains("  Text: 1"), "{}", stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("packet 2: Text"), "{}", stdout);
    assert!(stdout.contains("body: hi"), "{}", stdout);
}
