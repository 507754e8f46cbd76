//! In-RAM ingest buffer for the current level-8 blocks.
//!
//! `block8[sid][rid][bid]` holds every open 256 s bucket. The buffer is the
//! only writer of these blocks; it never touches disk. Buckets stay here
//! until the flusher takes every block whose window closed.

use crate::block::{align, Bid, Block, Rid, Sample, Sid, TIMESTAMP_MIN};
use crate::config::Registry;
use std::collections::BTreeMap;
use tracing::debug;

/// Level-8 span in seconds.
pub const SPAN8: u32 = 256;

/// In-memory accumulator of open level-8 blocks.
#[derive(Debug, Default)]
pub struct IngestBuffer {
    block8: BTreeMap<Sid, BTreeMap<Rid, BTreeMap<Bid, Block>>>,
}

impl IngestBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts one reading into its 256 s bucket.
    ///
    /// The reset id comes from the registry (0 for unknown sensors); a new
    /// bucket snapshots the sensor config with `unit` overwritten from the
    /// reading. Returns `false` when the sample is dropped: unsynced clock,
    /// or a timestamp that does not advance past the bucket's tail.
    pub fn push8(
        &mut self,
        registry: &mut Registry,
        sid: &str,
        t: u32,
        v: Sample,
        unit: &str,
    ) -> bool {
        if t < TIMESTAMP_MIN {
            debug!(sid, t, "dropping sample: clock not synced");
            return false;
        }

        let rid = registry.rid_of(sid);
        let bid = align(t, 8);
        let slot = self
            .block8
            .entry(sid.to_string())
            .or_default()
            .entry(rid)
            .or_default();

        match slot.get_mut(&bid) {
            Some(block) => {
                let accepted = block.push(t, v);
                if !accepted {
                    debug!(sid, t, "dropping sample: non-monotonic");
                }
                accepted
            }
            None => {
                let cfg = registry.snapshot(sid, unit);
                slot.insert(bid, Block::new(t, v, cfg));
                true
            }
        }
    }

    /// Removes and returns every block whose `bid` is below `close8`, in
    /// `(sid, rid, bid)` order. Emptied sensors are pruned.
    pub fn take_closed(&mut self, close8: Bid) -> Vec<(Sid, Rid, Bid, Block)> {
        let mut closed = Vec::new();
        for (sid, rids) in &mut self.block8 {
            for (rid, blocks) in rids.iter_mut() {
                let open = blocks.split_off(&close8);
                for (bid, block) in std::mem::replace(blocks, open) {
                    closed.push((sid.clone(), *rid, bid, block));
                }
            }
            rids.retain(|_, blocks| !blocks.is_empty());
        }
        self.block8.retain(|_, rids| !rids.is_empty());
        closed
    }

    /// Puts a block back after a failed flush attempt so the next tick
    /// retries it.
    pub fn restore(&mut self, sid: Sid, rid: Rid, bid: Bid, block: Block) {
        self.block8
            .entry(sid)
            .or_default()
            .entry(rid)
            .or_default()
            .insert(bid, block);
    }

    /// Number of open blocks across all sensors.
    pub fn open_blocks(&self) -> usize {
        self.block8
            .values()
            .flat_map(|rids| rids.values())
            .map(|blocks| blocks.len())
            .sum()
    }

    /// A view of one open block, for tests and introspection.
    pub fn get(&self, sid: &str, rid: Rid, bid: Bid) -> Option<&Block> {
        self.block8.get(sid)?.get(&rid)?.get(&bid)
    }
}
