//! Clock-driven closure of level-8 blocks.
//!
//! The flusher owns `close8`, the next level-8 boundary at which buffered
//! blocks become eligible to flush. A fixed grace window past the boundary
//! absorbs late-arriving samples from gateway batching before the bucket is
//! written out, published and evicted from RAM.

use crate::block::{Bid, TIMESTAMP_MIN};
use crate::buffer::{IngestBuffer, SPAN8};
use crate::error::{Result, TmpoError};
use crate::publish::{publish_block, Publisher};
use crate::store::BlockStore;
use tracing::{info, warn};

/// Grace window in seconds added past `close8` before flushing, so samples
/// timestamped inside a just-closed bucket can still land in it.
pub const GRACE8: u32 = 64;

fn ceil8(t: u32) -> Bid {
    (t + SPAN8 - 1) & !(SPAN8 - 1)
}

/// Scheduler for level-8 block closure.
#[derive(Debug, Default)]
pub struct Flusher {
    close8: Option<Bid>,
}

impl Flusher {
    /// Creates a flusher; `close8` initializes lazily on the first flush
    /// with a synced clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next scheduled closure boundary, if initialized.
    pub fn close8(&self) -> Option<Bid> {
        self.close8
    }

    /// Closes and persists every buffered block whose window has passed.
    ///
    /// With `force` the comparison clock is advanced by one span plus the
    /// grace window, closing the current bucket too; used on shutdown.
    /// Returns `true` when the closure clock advanced (even if no blocks
    /// were buffered), `false` when inside the grace window or the clock is
    /// unsynced.
    ///
    /// # Errors
    ///
    /// Publish failures propagate and abort the tick. Write failures are
    /// logged and leave the block buffered for the next attempt, except an
    /// already-existing file, which counts as persisted by an earlier
    /// crashed run and is republished.
    pub fn flush8(
        &mut self,
        force: bool,
        now: u32,
        buffer: &mut IngestBuffer,
        store: &BlockStore,
        publisher: &mut dyn Publisher,
    ) -> Result<bool> {
        let now = if force { now + SPAN8 + GRACE8 } else { now };
        if now < TIMESTAMP_MIN {
            return Ok(false);
        }

        let close8 = *self.close8.get_or_insert_with(|| ceil8(now));
        if now < close8 + GRACE8 {
            return Ok(false);
        }

        let mut flushed = 0usize;
        for (sid, rid, bid, block) in buffer.take_closed(close8) {
            match store.write_block(&sid, rid, 8, bid, &block) {
                Ok(()) => {}
                Err(TmpoError::BlockExists(path)) => {
                    warn!("flush: {} already on disk, republishing", path.display());
                }
                Err(err) => {
                    warn!(%sid, rid, bid, "flush write failed: {err}");
                    buffer.restore(sid, rid, bid, block);
                    continue;
                }
            }
            publish_block(store, publisher, &sid, rid, 8, bid)?;
            flushed += 1;
        }

        if flushed > 0 {
            info!(flushed, close8, "level-8 blocks flushed");
        }
        self.close8 = Some(ceil8(now));
        Ok(true)
    }

    /// Postpones `close8` past the next half-span boundary. Called by the
    /// compactor while pacing so the flusher does not race it for the
    /// current level-8 window.
    pub fn postpone(&mut self, now: u32) {
        self.close8 = Some(ceil8(now + SPAN8 / 2));
    }
}
