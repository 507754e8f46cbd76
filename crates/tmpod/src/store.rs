//! On-disk block store.
//!
//! One gzip file per block at `<root>/sensor/<sid>/<rid>/<lvl>/<bid>`.
//! Directories are created lazily and files are immutable after close; the
//! only mutations are whole-file unlinks. Durability against torn writes
//! comes from the startup scrub, not from write-side atomicity.

use crate::block::{compaction_id, Bid, Block, Lvl, Rid, Sid, COMPACT_LEVELS, GROUP_SHIFT, LEVELS};
use crate::error::{Result, TmpoError};
use crate::stream::BlockStream;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::cmp::Ordering;
use std::ffi::CString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Filesystem block size the free-space queries are reported in.
const FS_BLOCK: u64 = 4096;

/// gzip deflate level for block files. Flash is slow and small; spend CPU.
const GZIP_LEVEL: u32 = 9;

/// Report of a startup scrub pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScrubReport {
    /// Files removed because gzip verification failed.
    pub corrupt_removed: usize,
    /// Fine blocks removed because their compacted parent already exists.
    pub compact_removed: usize,
}

/// A gzip sink for streaming a merged block to disk.
///
/// Created through [`BlockStore::open_sink`]; the caller writes raw JSON
/// text fragments and must call [`BlockSink::finish`] to flush and fsync.
pub struct BlockSink {
    encoder: GzEncoder<File>,
}

impl BlockSink {
    /// Appends raw text to the compressed stream.
    pub fn write(&mut self, text: &str) -> Result<()> {
        use std::io::Write;
        self.encoder.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Finishes the gzip stream and fsyncs the file.
    pub fn finish(self) -> Result<()> {
        let file = self.encoder.finish()?;
        file.sync_all()?;
        Ok(())
    }
}

/// The block store, rooted at a data directory.
#[derive(Debug, Clone)]
pub struct BlockStore {
    root: PathBuf,
}

impl BlockStore {
    /// Creates a store rooted at `root`. Nothing is touched on disk until
    /// the first write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The data root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sensor_dir(&self) -> PathBuf {
        self.root.join("sensor")
    }

    /// Path of a block file. Pure construction; the file need not exist.
    pub fn block_path(&self, sid: &str, rid: Rid, lvl: Lvl, bid: Bid) -> PathBuf {
        self.sensor_dir()
            .join(sid)
            .join(rid.to_string())
            .join(lvl.to_string())
            .join(bid.to_string())
    }

    /// True if the block file exists.
    pub fn exists(&self, sid: &str, rid: Rid, lvl: Lvl, bid: Bid) -> bool {
        self.block_path(sid, rid, lvl, bid).exists()
    }

    /// Writes a block as gzip JSON and fsyncs it.
    ///
    /// # Errors
    ///
    /// Returns [`TmpoError::BlockExists`] if the path is already occupied;
    /// block files are never overwritten. I/O failures leave a partial file
    /// behind for the next startup scrub.
    pub fn write_block(&self, sid: &str, rid: Rid, lvl: Lvl, bid: Bid, block: &Block) -> Result<()> {
        let path = self.block_path(sid, rid, lvl, bid);
        if path.exists() {
            return Err(TmpoError::BlockExists(path));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::new(GZIP_LEVEL));
        serde_json::to_writer(&mut encoder, block)?;
        let file = encoder.finish()?;
        file.sync_all()?;
        debug!(sid, rid, lvl, bid, "block written");
        Ok(())
    }

    /// Opens a gzip sink for a block to be written incrementally.
    ///
    /// # Errors
    ///
    /// Same never-overwrite rule as [`BlockStore::write_block`].
    pub fn open_sink(&self, sid: &str, rid: Rid, lvl: Lvl, bid: Bid) -> Result<BlockSink> {
        let path = self.block_path(sid, rid, lvl, bid);
        if path.exists() {
            return Err(TmpoError::BlockExists(path));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(BlockSink {
            encoder: GzEncoder::new(file, Compression::new(GZIP_LEVEL)),
        })
    }

    /// Reads and decodes a whole block.
    ///
    /// # Errors
    ///
    /// I/O errors pass through; decode failures come back as
    /// [`TmpoError::Json`]. Callers that must not buffer a block in RAM use
    /// the streaming reader instead.
    pub fn read_block(&self, sid: &str, rid: Rid, lvl: Lvl, bid: Bid) -> Result<Block> {
        let path = self.block_path(sid, rid, lvl, bid);
        let file = File::open(&path)?;
        let block = serde_json::from_reader(GzDecoder::new(io::BufReader::new(file)))?;
        Ok(block)
    }

    /// Reads the raw gzip bytes of a block, for republication.
    pub fn read_raw(&self, sid: &str, rid: Rid, lvl: Lvl, bid: Bid) -> Result<Vec<u8>> {
        Ok(fs::read(self.block_path(sid, rid, lvl, bid))?)
    }

    /// Opens the lazy segment reader over a block, for consumers that must
    /// not hold a whole block in RAM.
    pub fn open_stream(&self, sid: &str, rid: Rid, lvl: Lvl, bid: Bid) -> Result<BlockStream> {
        BlockStream::open(self.block_path(sid, rid, lvl, bid))
    }

    /// Unlinks a block file. Failures are logged and ignored; a leftover
    /// file is re-deleted by the next compact-check.
    pub fn unlink(&self, sid: &str, rid: Rid, lvl: Lvl, bid: Bid) {
        let path = self.block_path(sid, rid, lvl, bid);
        if let Err(err) = fs::remove_file(&path) {
            warn!("unlink {} failed: {err}", path.display());
        }
    }

    /// Sensor ids present on disk, in listing order.
    pub fn sensors(&self) -> Vec<Sid> {
        list_sorted(&self.sensor_dir())
    }

    /// Reset ids present for a sensor, ascending.
    pub fn rids(&self, sid: &str) -> Vec<Rid> {
        list_sorted(&self.sensor_dir().join(sid))
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect()
    }

    /// Block ids present at `(sid, rid, lvl)`, ascending.
    pub fn bids(&self, sid: &str, rid: Rid, lvl: Lvl) -> Vec<Bid> {
        list_sorted(
            &self
                .sensor_dir()
                .join(sid)
                .join(rid.to_string())
                .join(lvl.to_string()),
        )
        .iter()
        .filter_map(|name| name.parse().ok())
        .collect()
    }

    /// Every `(sid, rid, bid)` present at a level, in listing order.
    pub fn blocks_at_level(&self, lvl: Lvl) -> Vec<(Sid, Rid, Bid)> {
        let mut blocks = Vec::new();
        for sid in self.sensors() {
            for rid in self.rids(&sid) {
                for bid in self.bids(&sid, rid, lvl) {
                    blocks.push((sid.clone(), rid, bid));
                }
            }
        }
        blocks
    }

    /// Free space under the root, in 4 KiB units.
    pub fn free_blocks(&self) -> Result<u64> {
        let stat = self.statvfs()?;
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64 / FS_BLOCK)
    }

    /// Total space under the root, in 4 KiB units.
    pub fn total_blocks(&self) -> Result<u64> {
        let stat = self.statvfs()?;
        Ok(stat.f_blocks as u64 * stat.f_frsize as u64 / FS_BLOCK)
    }

    fn statvfs(&self) -> Result<libc::statvfs> {
        use std::os::unix::ffi::OsStrExt;
        let cpath = CString::new(self.root.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in root path"))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: cpath outlives the call and stat is a plain output struct.
        let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(stat)
    }

    /// Verifies a file decompresses cleanly end to end, like `gzip -t`.
    pub fn verify_gzip(&self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        io::copy(&mut GzDecoder::new(io::BufReader::new(file)), &mut io::sink())?;
        Ok(())
    }

    /// Startup integrity pass, run once before the tick loop starts.
    ///
    /// 1. For each level, the single newest file across all sensors gets a
    ///    full gzip verification; a torn write from the last power loss is
    ///    unlinked.
    /// 2. Compact-check: any fine block whose compacted parent already
    ///    exists is a survivor of a crash mid-compaction and is unlinked.
    pub fn startup_scrub(&self) -> ScrubReport {
        let mut report = ScrubReport::default();

        for lvl in LEVELS.iter().rev().copied() {
            let newest = self
                .blocks_at_level(lvl)
                .into_iter()
                .max_by_key(|&(_, _, bid)| bid);
            if let Some((sid, rid, bid)) = newest {
                let path = self.block_path(&sid, rid, lvl, bid);
                if let Err(err) = self.verify_gzip(&path) {
                    warn!("scrub: {} corrupt ({err}), unlinking", path.display());
                    self.unlink(&sid, rid, lvl, bid);
                    report.corrupt_removed += 1;
                }
            }
        }

        for lvl in COMPACT_LEVELS {
            for (sid, rid, bid) in self.blocks_at_level(lvl) {
                let cid = compaction_id(bid, lvl);
                if self.exists(&sid, rid, lvl + GROUP_SHIFT, cid) {
                    debug!(sid, rid, lvl, bid, "scrub: already compacted, unlinking");
                    self.unlink(&sid, rid, lvl, bid);
                    report.compact_removed += 1;
                }
            }
        }

        report
    }
}

/// Ordered directory listing: names that parse as integers sort numerically
/// ascending, everything else sorts lexicographically after them. A missing
/// directory lists as empty.
fn list_sorted(dir: &Path) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!("list {} failed: {err}", dir.display());
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();

    names.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    });
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Sample;
    use crate::config::SensorParams;
    use tempfile::TempDir;

    fn block_at(t: u32) -> Block {
        let mut block = Block::new(t, Sample::Int(100), SensorParams::unregistered("ab", "Wh"));
        block.push(t + 10, Sample::Int(110));
        block
    }

    #[test]
    fn test_block_path_layout() {
        let store = BlockStore::new("/var/lib/tmpo");
        assert_eq!(
            store.block_path("ab12", 3, 8, 1_699_999_872),
            PathBuf::from("/var/lib/tmpo/sensor/ab12/3/8/1699999872")
        );
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        let block = block_at(1_700_000_000);

        store
            .write_block("ab", 0, 8, 1_699_999_872, &block)
            .unwrap();
        let back = store.read_block("ab", 0, 8, 1_699_999_872).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_write_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        let block = block_at(1_700_000_000);

        store
            .write_block("ab", 0, 8, 1_699_999_872, &block)
            .unwrap();
        let err = store
            .write_block("ab", 0, 8, 1_699_999_872, &block)
            .unwrap_err();
        assert!(matches!(err, TmpoError::BlockExists(_)));
    }

    #[test]
    fn test_listing_orders_numerically() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        for bid in [1_700_003_840, 1_699_999_872, 1_700_000_128] {
            store.write_block("ab", 0, 8, bid, &block_at(bid)).unwrap();
        }

        assert_eq!(
            store.bids("ab", 0, 8),
            vec![1_699_999_872, 1_700_000_128, 1_700_003_840]
        );
    }

    #[test]
    fn test_list_sorted_numeric_before_lexical() {
        let dir = TempDir::new().unwrap();
        for name in ["10", "9", "abc", "100", "aab"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(list_sorted(dir.path()), vec!["9", "10", "100", "aab", "abc"]);
    }

    #[test]
    fn test_missing_dir_lists_empty() {
        let store = BlockStore::new("/nonexistent/tmpo-test");
        assert!(store.sensors().is_empty());
        assert!(store.bids("ab", 0, 8).is_empty());
    }

    #[test]
    fn test_scrub_unlinks_corrupt_newest() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        store
            .write_block("ab", 0, 8, 1_699_999_872, &block_at(1_699_999_872))
            .unwrap();

        // Torn write: newest file at the level is not valid gzip.
        let torn = store.block_path("ab", 0, 8, 1_700_000_128);
        fs::create_dir_all(torn.parent().unwrap()).unwrap();
        fs::write(&torn, b"\x1f\x8btorn-write").unwrap();

        let report = store.startup_scrub();
        assert_eq!(report.corrupt_removed, 1);
        assert!(!torn.exists());
        assert!(store.exists("ab", 0, 8, 1_699_999_872));
    }

    #[test]
    fn test_scrub_compact_check() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        let bid = 1_699_999_872u32;
        let cid = compaction_id(bid, 8);

        store.write_block("ab", 0, 8, bid, &block_at(bid)).unwrap();
        store
            .write_block("ab", 0, 8, bid + 256, &block_at(bid + 256))
            .unwrap();
        store.write_block("ab", 0, 12, cid, &block_at(bid)).unwrap();

        let report = store.startup_scrub();
        assert_eq!(report.compact_removed, 2);
        assert!(!store.exists("ab", 0, 8, bid));
        assert!(!store.exists("ab", 0, 8, bid + 256));
        assert!(store.exists("ab", 0, 12, cid));
    }

    #[test]
    fn test_free_space_nonzero() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        assert!(store.total_blocks().unwrap() > 0);
        assert!(store.free_blocks().unwrap() > 0);
    }
}
