//! Integration tests for the ingest → flush → publish path.
//!
//! These tests drive the public API the way the daemon does: readings go
//! through the ingest buffer, the flusher closes 256 s buckets against a
//! simulated clock, and published payloads are captured by a recording
//! publisher.

use tmpod::{
    Block, BlockStore, Daemon, Flusher, IngestBuffer, Publisher, Registry, Result, Sample,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::DateTime;
use tempfile::TempDir;

/// Records every publish for assertions.
#[derive(Debug, Default)]
struct RecordingPublisher {
    published: Vec<(String, Vec<u8>)>,
}

impl Publisher for RecordingPublisher {
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.published.push((topic.to_string(), payload));
        Ok(())
    }
}

/// Replays a block's delta arrays into absolute samples.
fn reconstruct(block: &Block) -> Vec<(u32, f64)> {
    let mut samples = Vec::new();
    let mut t = block.h.head.0;
    let mut v = block.h.head.1.as_f64();
    for (dt, dv) in block.t.iter().zip(&block.v) {
        t += dt;
        v += dv.as_f64();
        samples.push((t, v));
    }
    samples
}

fn check_invariants(block: &Block, lvl: u8, bid: u32) {
    assert_eq!(bid % (1 << lvl), 0, "bid not aligned to level span");
    assert_eq!(block.t.len(), block.v.len());
    assert_eq!(block.t[0], 0);
    assert_eq!(block.v[0].as_f64(), 0.0);
    assert_eq!(block.sum_t(), (block.h.tail.0 - block.h.head.0) as u64);
    let spread = block.h.tail.1.as_f64() - block.h.head.1.as_f64();
    assert!((block.sum_v() - spread).abs() < 1e-3);
    assert!(block.h.head.0 >= bid);
    assert!(block.h.tail.0 <= bid + (1 << lvl) - 1);
}

#[test]
fn test_single_sensor_steady_flow() {
    let dir = TempDir::new().unwrap();
    let store = BlockStore::new(dir.path());
    let mut registry = Registry::default();
    let mut buffer = IngestBuffer::new();
    let mut flusher = Flusher::new();
    let mut publisher = RecordingPublisher::default();

    assert!(buffer.push8(&mut registry, "ab", 1_700_000_000, Sample::Int(100), "Wh"));
    assert!(buffer.push8(&mut registry, "ab", 1_700_000_010, Sample::Int(110), "Wh"));
    assert!(buffer.push8(&mut registry, "ab", 1_700_000_300, Sample::Int(140), "Wh"));

    // Pin close8, then force the rest out.
    assert!(!flusher
        .flush8(false, 1_700_000_300, &mut buffer, &store, &mut publisher)
        .unwrap());
    assert!(flusher
        .flush8(true, 1_700_000_300, &mut buffer, &store, &mut publisher)
        .unwrap());

    // Two buckets: samples before and after the 256 s boundary.
    assert_eq!(store.bids("ab", 0, 8), vec![1_699_999_872, 1_700_000_128]);

    let first = store.read_block("ab", 0, 8, 1_699_999_872).unwrap();
    check_invariants(&first, 8, 1_699_999_872);
    assert_eq!(
        reconstruct(&first),
        vec![(1_700_000_000, 100.0), (1_700_000_010, 110.0)]
    );

    let second = store.read_block("ab", 0, 8, 1_700_000_128).unwrap();
    check_invariants(&second, 8, 1_700_000_128);
    assert_eq!(reconstruct(&second), vec![(1_700_000_300, 140.0)]);

    assert_eq!(publisher.published.len(), 2);
    assert!(publisher.published[0].0.starts_with("/sensor/ab/tmpo/0/8/"));
}

#[test]
fn test_non_monotonic_sample_dropped() {
    let mut registry = Registry::default();
    let mut buffer = IngestBuffer::new();

    assert!(buffer.push8(&mut registry, "ab", 1_700_000_100, Sample::Int(50), "Wh"));
    assert!(!buffer.push8(&mut registry, "ab", 1_700_000_050, Sample::Int(40), "Wh"));

    let block = buffer.get("ab", 0, 1_699_999_872).unwrap();
    assert_eq!(block.len(), 1);
    assert_eq!(block.h.tail, (1_700_000_100, Sample::Int(50)));
}

#[test]
fn test_fractional_rounding_on_ingest() {
    let mut registry = Registry::default();
    let mut buffer = IngestBuffer::new();
    let t = 1_700_000_000u32;

    buffer.push8(&mut registry, "ab", t, Sample::Float(1.0005), "m3");
    buffer.push8(&mut registry, "ab", t + 10, Sample::Float(1.0014), "m3");

    let block = buffer.get("ab", 0, 1_699_999_872).unwrap();
    assert_eq!(block.v[1], Sample::Float(0.001));
    let spread = block.h.tail.1.as_f64() - block.h.head.1.as_f64();
    assert!((block.sum_v() - spread).abs() < 1e-3);
}

fn uplink_payload(serial: &str, t: u32, counter: u32) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&counter.to_be_bytes());
    frame.extend_from_slice(&[0u8; 32]);
    let time = DateTime::from_timestamp(t as i64, 0).unwrap().to_rfc3339();
    serde_json::to_vec(&serde_json::json!({
        "dev_id": serial,
        "metadata": { "time": time },
        "payload_raw": STANDARD.encode(frame),
    }))
    .unwrap()
}

/// Drives the whole daemon over a simulated day: uplinks arrive every
/// 64 s, the heartbeat ticks, and the pyramid grows bottom-up.
#[test]
fn test_daemon_builds_pyramid_from_uplinks() {
    let yaml = r#"
devices:
  "0123456789abcdef0123456789abcdef":
    sensors:
      1: { id: "ab12", rid: 0, data_type: counter, unit: Wh }
"#;
    let dir = TempDir::new().unwrap();
    let mut daemon = Daemon::new(Registry::from_yaml(yaml).unwrap(), BlockStore::new(dir.path()));
    let mut publisher = RecordingPublisher::default();

    let start = 1_699_938_304u32; // 65536-aligned
    let serial = "0123456789abcdef0123456789abcdef";

    // Two full level-12 windows of traffic, ticking once per simulated
    // 16 s so flush and compaction interleave like production.
    let mut now = start;
    while now < start + 2 * 4096 + 512 {
        if now % 64 == 0 {
            daemon.handle_uplink(&uplink_payload(serial, now, now - start + 1), false);
        }
        if now % 16 == 0 {
            daemon.handle_tick(now, &mut publisher).unwrap();
        }
        now += 1;
    }
    // Let the compactor drain: pacing needs idle ticks.
    for k in 0..600u32 {
        daemon.handle_tick(now + k * 16, &mut publisher).unwrap();
    }

    let store = daemon.store();
    // The first coarse window is fully compacted into one level-12 block;
    // later windows follow as their own windows close.
    let bids12 = store.bids("ab12", 0, 12);
    assert_eq!(bids12.first(), Some(&start));
    assert!(bids12.contains(&(start + 4096)));
    let coarse = store.read_block("ab12", 0, 12, start).unwrap();
    check_invariants(&coarse, 12, start);
    // Its sixteen inputs are gone; later fine blocks remain.
    assert!(store
        .bids("ab12", 0, 8)
        .iter()
        .all(|&bid| bid >= start + 4096));

    // Every sample that fell inside the coarse window survived the merge.
    let samples = reconstruct(&coarse);
    assert_eq!(samples.first().unwrap().0, start);
    assert!(samples.iter().all(|&(t, _)| t < start + 4096));
    assert_eq!(samples.len(), 4096 / 64);

    // Both the fine blocks and the coarse block were published.
    assert!(publisher
        .published
        .iter()
        .any(|(topic, _)| topic == &format!("/sensor/ab12/tmpo/0/12/{start}/gz")));
}
