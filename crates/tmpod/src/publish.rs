//! Outbound block publication seam.
//!
//! The core never talks to the broker directly; everything that leaves the
//! daemon goes through [`Publisher`], which the MQTT layer implements and
//! tests replace with a recording mock.

use crate::block::{Bid, Lvl, Rid};
use crate::error::Result;
use crate::store::BlockStore;

/// Transport seam for outbound payloads.
///
/// Implementations hand the payload to the broker at QoS 0, non-retained;
/// delivery is at-most-once and duplicates on the subscriber side are
/// expected during sync.
pub trait Publisher {
    /// Publishes one payload. A returned error aborts the current tick.
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Topic a block is published on.
pub fn block_topic(sid: &str, rid: Rid, lvl: Lvl, bid: Bid) -> String {
    format!("/sensor/{sid}/tmpo/{rid}/{lvl}/{bid}/gz")
}

/// Reads a block's raw gzip bytes and publishes them.
pub fn publish_block(
    store: &BlockStore,
    publisher: &mut dyn Publisher,
    sid: &str,
    rid: Rid,
    lvl: Lvl,
    bid: Bid,
) -> Result<()> {
    let payload = store.read_raw(sid, rid, lvl, bid)?;
    publisher.publish(&block_topic(sid, rid, lvl, bid), payload)
}
