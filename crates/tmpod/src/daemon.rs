//! Single-threaded event dispatcher.
//!
//! All state transitions run on one thread, driven by three inputs: the
//! broker's 1 Hz heartbeat (tick), inbound sync requests, and sensor
//! uplinks. Within a tick the order is fixed: sync republish, then GC, then
//! flush, then one compactor step. A level-8 block is therefore always
//! written and published before it can become a compaction input, and the
//! compactor only ever reads persisted files while the ingest buffer owns
//! everything at or past `close8`.

use crate::buffer::IngestBuffer;
use crate::compact::{CompactStep, Compactor};
use crate::config::Registry;
use crate::error::Result;
use crate::flush::Flusher;
use crate::gc::gc20;
use crate::publish::Publisher;
use crate::store::BlockStore;
use crate::sync::{SyncEngine, Watermark};
use crate::uplink;
use tracing::{info, warn};

/// What one tick did, for the caller's logging and memory pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// Blocks republished by the sync engine.
    pub republished: usize,
    /// Level-20 files evicted by GC.
    pub evicted: usize,
    /// Whether the flusher advanced its closure clock.
    pub clock_advanced: bool,
    /// Outcome of the compactor step, if one was active.
    pub compact: Option<CompactStep>,
}

/// The daemon core: owns every component and dispatches events into them.
pub struct Daemon {
    registry: Registry,
    store: BlockStore,
    buffer: IngestBuffer,
    flusher: Flusher,
    compactor: Option<Compactor>,
    syncer: SyncEngine,
}

impl Daemon {
    /// Assembles a daemon over a registry and a block store.
    pub fn new(registry: Registry, store: BlockStore) -> Self {
        Self {
            registry,
            store,
            buffer: IngestBuffer::new(),
            flusher: Flusher::new(),
            compactor: None,
            syncer: SyncEngine::new(),
        }
    }

    /// The underlying block store.
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Runs one heartbeat tick: `sync2` → `gc20` → `flush8(false)` → one
    /// compactor step. A fresh compactor is created whenever the flush
    /// advanced the clock and none is active; an exhausted one is dropped.
    ///
    /// # Errors
    ///
    /// Publish failures abort the tick. Everything else is logged and the
    /// tick continues.
    pub fn handle_tick(&mut self, now: u32, publisher: &mut dyn Publisher) -> Result<TickReport> {
        let mut report = TickReport::default();

        report.republished = self.syncer.sync2(&self.store, publisher)?;

        report.evicted = match gc20(&self.store) {
            Ok(evicted) => evicted,
            Err(err) => {
                warn!("gc skipped: {err}");
                0
            }
        };

        report.clock_advanced =
            self.flusher
                .flush8(false, now, &mut self.buffer, &self.store, publisher)?;

        if report.clock_advanced && self.compactor.is_none() {
            self.compactor = Some(Compactor::new(now, &self.store));
        }
        if let Some(compactor) = self.compactor.as_mut() {
            let step = compactor.step(now, &self.store, &mut self.flusher, publisher)?;
            if step == CompactStep::Done {
                self.compactor = None;
            }
            report.compact = Some(step);
        }

        Ok(report)
    }

    /// Accepts an inbound watermark list. Malformed requests are dropped;
    /// the daemon never answers a peer with an error.
    pub fn handle_sync_request(&mut self, payload: &[u8]) {
        match serde_json::from_slice::<Vec<Watermark>>(payload) {
            Ok(list) => {
                info!(watermarks = list.len(), "sync requested");
                self.syncer.sync1(list);
            }
            Err(err) => warn!("sync request dropped: {err}"),
        }
    }

    /// Accepts a sensor uplink. Retained messages are stale broker replays
    /// and are ignored; a decode failure drops the whole uplink.
    pub fn handle_uplink(&mut self, payload: &[u8], retained: bool) {
        if retained {
            return;
        }
        match uplink::decode(payload, &self.registry) {
            Ok(readings) => {
                for reading in readings {
                    self.buffer.push8(
                        &mut self.registry,
                        &reading.sid,
                        reading.t,
                        reading.v,
                        &reading.unit,
                    );
                }
            }
            Err(err) => warn!("uplink dropped: {err}"),
        }
    }

    /// Forces the open level-8 buckets out before exit.
    ///
    /// # Errors
    ///
    /// Publish failures propagate; the blocks are on disk by then and the
    /// next start republishes nothing, but sync can still serve them.
    pub fn flush_on_shutdown(
        &mut self,
        now: u32,
        publisher: &mut dyn Publisher,
    ) -> Result<bool> {
        self.flusher
            .flush8(true, now, &mut self.buffer, &self.store, publisher)
    }
}
