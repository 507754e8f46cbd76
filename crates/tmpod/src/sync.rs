//! Back-fill synchronization with remote subscribers.
//!
//! A remote sends its last-known-block watermarks; the daemon republishes
//! every local block whose window ends after the watermark's. The list sits
//! in a single slot consumed on the next tick; a second request arriving
//! before then replaces the first.

use crate::block::{span, Bid, Lvl, Rid, Sid, LEVELS};
use crate::error::Result;
use crate::publish::{publish_block, Publisher};
use crate::store::BlockStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One last-known-block entry from a remote subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Sensor id.
    pub sid: Sid,
    /// Reset id the remote has seen up to.
    pub rid: Rid,
    /// Level of the remote's newest block.
    pub lvl: Lvl,
    /// Bid of the remote's newest block.
    pub bid: Bid,
}

impl Watermark {
    /// Inclusive end of the watermark's window.
    fn tail_end(&self) -> u64 {
        self.bid as u64 + span(self.lvl) as u64 - 1
    }
}

/// Single-slot sync state.
#[derive(Debug, Default)]
pub struct SyncEngine {
    pending: Option<Vec<Watermark>>,
}

impl SyncEngine {
    /// Creates an engine with no pending request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stashes an incoming watermark list, replacing any unhandled one.
    pub fn sync1(&mut self, list: Vec<Watermark>) {
        if self.pending.is_some() {
            debug!("sync: replacing unhandled watermark list");
        }
        self.pending = Some(list);
    }

    /// Serves the pending request, if any: for every watermark, republishes
    /// each local block newer than it, for reset ids at or above the
    /// remote's, coarsest level first so the remote gets a quick overview
    /// before the fine detail. Returns the number of blocks published.
    ///
    /// # Errors
    ///
    /// Publish failures propagate and abort the tick; the list is already
    /// consumed, so the remote re-requests what it is still missing.
    pub fn sync2(&mut self, store: &BlockStore, publisher: &mut dyn Publisher) -> Result<usize> {
        let Some(list) = self.pending.take() else {
            return Ok(0);
        };

        let mut published = 0;
        for wm in &list {
            if !LEVELS.contains(&wm.lvl) {
                warn!(sid = %wm.sid, lvl = wm.lvl, "sync: ignoring bogus watermark level");
                continue;
            }
            for rid in store.rids(&wm.sid) {
                if rid < wm.rid {
                    continue;
                }
                for lvl in LEVELS.iter().rev().copied() {
                    for bid in store.bids(&wm.sid, rid, lvl) {
                        let tail_end = bid as u64 + span(lvl) as u64 - 1;
                        if tail_end > wm.tail_end() {
                            publish_block(store, publisher, &wm.sid, rid, lvl, bid)?;
                            published += 1;
                        }
                    }
                }
            }
        }

        if published > 0 {
            info!(published, watermarks = list.len(), "sync: republished blocks");
        }
        Ok(published)
    }
}
