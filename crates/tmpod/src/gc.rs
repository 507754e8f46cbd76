//! Eviction of the oldest level-20 window under disk pressure.

use crate::error::Result;
use crate::store::BlockStore;
use tracing::{debug, info};

/// Fill ratio at which eviction starts.
pub const GC_FILL_THRESHOLD: f64 = 0.75;

/// Evicts the single oldest level-20 `bid` across the whole device when the
/// filesystem is more than [`GC_FILL_THRESHOLD`] full. Retention is strictly
/// oldest-first device-wide, not per-sensor: every sensor's block sharing
/// the oldest window goes at once. Returns the number of files unlinked.
pub fn gc20(store: &BlockStore) -> Result<usize> {
    let total = store.total_blocks()?;
    if total == 0 {
        return Ok(0);
    }
    let free = store.free_blocks()?;
    let fill = 1.0 - free as f64 / total as f64;
    if fill < GC_FILL_THRESHOLD {
        return Ok(0);
    }

    let blocks = store.blocks_at_level(20);
    let Some(oldest) = blocks.iter().map(|&(_, _, bid)| bid).min() else {
        debug!(fill, "gc: disk full but no level-20 blocks to evict");
        return Ok(0);
    };

    let mut evicted = 0;
    for (sid, rid, bid) in blocks {
        if bid == oldest {
            store.unlink(&sid, rid, 20, bid);
            evicted += 1;
        }
    }
    info!(oldest, evicted, fill, "gc: evicted oldest level-20 window");
    Ok(evicted)
}
