//! Back-fill sync integration tests.

use tmpod::{
    Block, BlockStore, Publisher, Result, Sample, SensorParams, SyncEngine, Watermark,
};
use tempfile::TempDir;

#[derive(Debug, Default)]
struct RecordingPublisher {
    topics: Vec<String>,
}

impl Publisher for RecordingPublisher {
    fn publish(&mut self, topic: &str, _payload: Vec<u8>) -> Result<()> {
        self.topics.push(topic.to_string());
        Ok(())
    }
}

fn seed(store: &BlockStore, rid: u16, lvl: u8, bid: u32) {
    let block = Block::new(
        bid + 1,
        Sample::Int(1),
        SensorParams::unregistered("ef", "Wh"),
    );
    store.write_block("ef", rid, lvl, bid, &block).unwrap();
}

/// Scenario: the remote's watermark is older than everything local; all
/// four levels republish, coarsest first.
#[test]
fn test_sync_publishes_levels_coarse_to_fine() {
    let dir = TempDir::new().unwrap();
    let store = BlockStore::new(dir.path());
    let base = 1_698_693_120u32; // 2^20-aligned

    seed(&store, 0, 20, base);
    seed(&store, 0, 16, base + (1 << 20));
    seed(&store, 0, 12, base + (1 << 20) + (1 << 16));
    seed(&store, 0, 8, base + (1 << 20) + (1 << 16) + (1 << 12));

    let mut engine = SyncEngine::new();
    let mut publisher = RecordingPublisher::default();
    engine.sync1(vec![Watermark {
        sid: "ef".to_string(),
        rid: 0,
        lvl: 8,
        bid: 1_700_000_000u32 & !255,
    }]);

    // Every local block is newer than the watermark's tail.
    assert_eq!(engine.sync2(&store, &mut publisher).unwrap(), 4);
    let levels: Vec<&str> = publisher
        .topics
        .iter()
        .map(|topic| topic.split('/').nth(5).unwrap())
        .collect();
    assert_eq!(levels, vec!["20", "16", "12", "8"]);
}

/// A watermark at a coarse level suppresses fine blocks whose windows it
/// already covers.
#[test]
fn test_coarse_watermark_covers_fine_blocks() {
    let dir = TempDir::new().unwrap();
    let store = BlockStore::new(dir.path());
    let base = 1_698_693_120u32;

    // Fine blocks inside the remote's level-20 window, plus one beyond it.
    seed(&store, 0, 8, base + (1 << 16));
    seed(&store, 0, 8, base + (1 << 20) - (1 << 8));
    seed(&store, 0, 8, base + (1 << 20) + (1 << 8));

    let mut engine = SyncEngine::new();
    let mut publisher = RecordingPublisher::default();
    engine.sync1(vec![Watermark {
        sid: "ef".to_string(),
        rid: 0,
        lvl: 20,
        bid: base,
    }]);

    assert_eq!(engine.sync2(&store, &mut publisher).unwrap(), 1);
    assert!(publisher.topics[0].contains(&(base + (1 << 20) + (1 << 8)).to_string()));
}

/// The slot is one-shot: once served, a second tick publishes nothing.
#[test]
fn test_sync_slot_consumed_once() {
    let dir = TempDir::new().unwrap();
    let store = BlockStore::new(dir.path());
    seed(&store, 0, 8, 1_699_999_872);

    let mut engine = SyncEngine::new();
    let mut publisher = RecordingPublisher::default();
    engine.sync1(vec![Watermark {
        sid: "ef".to_string(),
        rid: 0,
        lvl: 8,
        bid: 1_699_999_872 - 256,
    }]);

    assert_eq!(engine.sync2(&store, &mut publisher).unwrap(), 1);
    assert_eq!(engine.sync2(&store, &mut publisher).unwrap(), 0);
}

/// Unknown sensors in the watermark list are harmless no-ops.
#[test]
fn test_sync_unknown_sensor_ignored() {
    let dir = TempDir::new().unwrap();
    let store = BlockStore::new(dir.path());

    let mut engine = SyncEngine::new();
    let mut publisher = RecordingPublisher::default();
    engine.sync1(vec![Watermark {
        sid: "beef".to_string(),
        rid: 0,
        lvl: 8,
        bid: 1_699_999_872,
    }]);
    assert_eq!(engine.sync2(&store, &mut publisher).unwrap(), 0);
}
