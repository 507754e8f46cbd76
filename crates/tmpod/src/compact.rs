//! Streaming compaction of sibling blocks into the next pyramid level.
//!
//! Sixteen level-`L` windows tile one level-`L+4` window; once the coarse
//! window has closed, its fine blocks are merged into a single coarse block
//! and unlinked. The merge is a text-level stitch over the streaming segment
//! reader, so a group of multi-megabyte blocks compacts in constant memory:
//! the output header is the last input's header pointed at the first input's
//! head, and each input's delta arrays pass through verbatim behind a
//! joining delta computed from the adjacent boundary samples.
//!
//! The compactor is a cooperative state machine. Each [`Compactor::step`]
//! performs at most one full group merge, then reports a pacing deadline so
//! the tick loop can keep servicing ingest traffic between merges. A
//! compactor may be dropped at any step boundary: a group is either fully
//! committed (coarse block written, inputs unlinked) or still fully present
//! on disk for the next pass.

use crate::block::{Bid, BlockHead, Lvl, Rid, Sid, COMPACT_LEVELS, GROUP_SHIFT, TIMESTAMP_MIN};
use crate::error::{Result, TmpoError};
use crate::flush::Flusher;
use crate::publish::{publish_block, Publisher};
use crate::store::{BlockSink, BlockStore};
use crate::stream::{BlockStream, Segment};
use tracing::{info, warn};

/// Outcome of one compactor resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactStep {
    /// One sibling group was merged and committed.
    Merged,
    /// Nothing was done this tick; the compactor is pacing or the clock is
    /// unsynced.
    Waiting,
    /// The traversal is exhausted; discard the compactor.
    Done,
}

/// Cooperative compactor over a snapshot of the on-disk pyramid.
pub struct Compactor {
    units: Vec<(Sid, Rid, Lvl)>,
    idx: usize,
    costart: u32,
    pace_until: Option<u32>,
}

impl Compactor {
    /// Snapshots the `(sid, rid, lvl)` traversal in sorted order. Blocks
    /// created after this point are picked up by the next compactor.
    pub fn new(now: u32, store: &BlockStore) -> Self {
        let mut units = Vec::new();
        for sid in store.sensors() {
            for rid in store.rids(&sid) {
                for lvl in COMPACT_LEVELS {
                    units.push((sid.clone(), rid, lvl));
                }
            }
        }
        Self {
            units,
            idx: 0,
            costart: now,
            pace_until: None,
        }
    }

    /// Runs the compactor for one tick.
    ///
    /// While pacing, `close8` is postponed through the flusher so the
    /// flusher does not race the compactor for the current level-8 window.
    ///
    /// # Errors
    ///
    /// Only publish failures propagate; a corrupt group is logged, left on
    /// disk for the next pass, and the traversal moves on.
    pub fn step(
        &mut self,
        now: u32,
        store: &BlockStore,
        flusher: &mut Flusher,
        publisher: &mut dyn Publisher,
    ) -> Result<CompactStep> {
        if now < TIMESTAMP_MIN {
            return Ok(CompactStep::Waiting);
        }

        if let Some(deadline) = self.pace_until {
            if now < deadline {
                flusher.postpone(now);
                return Ok(CompactStep::Waiting);
            }
            self.pace_until = None;
            self.costart = now;
        }

        while let Some((sid, rid, lvl)) = self.units.get(self.idx).cloned() {
            let Some((cid, bids)) = select_group(store, &sid, rid, lvl, now) else {
                self.idx += 1;
                continue;
            };

            if store.exists(&sid, rid, lvl + GROUP_SHIFT, cid) {
                // Crash survivor: the coarse block was committed but the
                // inputs were not removed. Finish the removal and rescan.
                for bid in &bids {
                    store.unlink(&sid, rid, lvl, *bid);
                }
                if store.bids(&sid, rid, lvl).first() == Some(&bids[0]) {
                    // Unlink did not take; skip the unit rather than spin.
                    self.idx += 1;
                }
                continue;
            }

            match merge_group(store, &sid, rid, lvl, cid, &bids) {
                Ok(()) => {
                    for bid in &bids {
                        store.unlink(&sid, rid, lvl, *bid);
                    }
                    publish_block(store, publisher, &sid, rid, lvl + GROUP_SHIFT, cid)?;
                    info!(%sid, rid, lvl, cid, inputs = bids.len(), "compacted group");
                    let worked = now.saturating_sub(self.costart);
                    self.pace_until = Some(now + 1 + worked / 2);
                    return Ok(CompactStep::Merged);
                }
                Err(err) => {
                    warn!(%sid, rid, lvl, cid, "compaction aborted: {err}");
                    self.idx += 1;
                }
            }
        }

        Ok(CompactStep::Done)
    }
}

/// Selects the earliest compaction group at `(sid, rid, lvl)`: the first
/// on-disk `bid` whose coarse window has closed, plus every sibling in the
/// same window. Groups may hold fewer than sixteen members; missing siblings
/// mean those windows had no data.
fn select_group(
    store: &BlockStore,
    sid: &str,
    rid: Rid,
    lvl: Lvl,
    now: u32,
) -> Option<(Bid, Vec<Bid>)> {
    let bids = store.bids(sid, rid, lvl);
    let first = *bids.first()?;
    let shift = lvl + GROUP_SHIFT;
    if (first >> shift) >= (now >> shift) {
        return None;
    }
    let group: Vec<Bid> = bids
        .into_iter()
        .take_while(|bid| (bid >> shift) == (first >> shift))
        .collect();
    Some(((first >> shift) << shift, group))
}

fn merge_group(
    store: &BlockStore,
    sid: &str,
    rid: Rid,
    lvl: Lvl,
    cid: Bid,
    bids: &[Bid],
) -> Result<()> {
    let mut streams = Vec::with_capacity(bids.len());
    for bid in bids {
        streams.push(store.open_stream(sid, rid, lvl, *bid)?);
    }

    let mut heads = Vec::with_capacity(streams.len());
    for (stream, bid) in streams.iter_mut().zip(bids) {
        let json = match stream.next() {
            Some(Ok(Segment::Head(json))) => json,
            Some(Err(err)) => return Err(err),
            _ => {
                return Err(corrupt(store, sid, rid, lvl, *bid, "missing header"));
            }
        };
        heads.push(serde_json::from_str::<BlockHead>(&json)?);
    }

    // The last input's header survives (a sensor reconfiguration mid-window
    // stays visible in the coarse block); only head points at the start.
    let mut merged = heads
        .last()
        .cloned()
        .expect("select_group never yields an empty group");
    merged.head = heads[0].head;

    let coarse = lvl + GROUP_SHIFT;
    let mut sink = store.open_sink(sid, rid, coarse, cid)?;
    match write_merged(&mut sink, &merged, &heads, &mut streams) {
        Ok(()) => match sink.finish() {
            Ok(()) => Ok(()),
            Err(err) => {
                store.unlink(sid, rid, coarse, cid);
                Err(err)
            }
        },
        Err(err) => {
            drop(sink);
            store.unlink(sid, rid, coarse, cid);
            Err(err)
        }
    }
}

fn write_merged(
    sink: &mut BlockSink,
    merged: &BlockHead,
    heads: &[BlockHead],
    streams: &mut [BlockStream],
) -> Result<()> {
    sink.write("{\"h\":")?;
    sink.write(&serde_json::to_string(merged)?)?;

    sink.write(",\"t\":[0")?;
    for (i, stream) in streams.iter_mut().enumerate() {
        if i > 0 {
            let dt = heads[i]
                .head
                .0
                .checked_sub(heads[i - 1].tail.0)
                .ok_or_else(|| TmpoError::CorruptBlock {
                    path: stream.path().to_path_buf(),
                    reason: format!(
                        "inputs overlap: head {} before previous tail {}",
                        heads[i].head.0,
                        heads[i - 1].tail.0
                    ),
                })?;
            sink.write(&format!(",{dt}"))?;
        }
        copy_runs(stream, sink, SegKind::Time)?;
    }

    sink.write("],\"v\":[0")?;
    for (i, stream) in streams.iter_mut().enumerate() {
        if i > 0 {
            let dv = heads[i].head.1.delta(heads[i - 1].tail.1);
            sink.write(",")?;
            sink.write(&serde_json::to_string(&dv)?)?;
        }
        copy_runs(stream, sink, SegKind::Value)?;
    }

    sink.write("]}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegKind {
    Time,
    Value,
}

fn copy_runs(stream: &mut BlockStream, sink: &mut BlockSink, kind: SegKind) -> Result<()> {
    loop {
        let segment = match stream.next() {
            Some(Ok(segment)) => segment,
            Some(Err(err)) => return Err(err),
            None => return Err(ended_early(stream, kind)),
        };
        match (kind, segment) {
            (SegKind::Time, Segment::Time { text, last }) => {
                sink.write(&text)?;
                if last {
                    return Ok(());
                }
            }
            (SegKind::Value, Segment::Value { text, last }) => {
                sink.write(&text)?;
                if last {
                    return Ok(());
                }
            }
            _ => return Err(ended_early(stream, kind)),
        }
    }
}

fn ended_early(stream: &BlockStream, kind: SegKind) -> TmpoError {
    TmpoError::CorruptBlock {
        path: stream.path().to_path_buf(),
        reason: format!("unexpected segment while copying {kind:?} runs"),
    }
}

fn corrupt(store: &BlockStore, sid: &str, rid: Rid, lvl: Lvl, bid: Bid, reason: &str) -> TmpoError {
    TmpoError::CorruptBlock {
        path: store.block_path(sid, rid, lvl, bid),
        reason: reason.to_string(),
    }
}
