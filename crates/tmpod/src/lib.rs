//! tmpod - Timeseries block pyramid logging daemon.
//!
//! This crate ingests counter readings from a fleet of metering devices
//! over MQTT, buffers them in RAM, and persists them as a pyramid of
//! gzip-compressed JSON blocks at four time resolutions on local flash.
//!
//! # Components
//!
//! - [`IngestBuffer`]: in-RAM accumulator of the open 256 s blocks
//! - [`Flusher`]: clock-driven closure and publication of level-8 blocks
//! - [`BlockStore`]: filesystem layout, gzip I/O, startup scrub
//! - [`Compactor`]: cooperative streaming merge of sixteen sibling blocks
//!   into the next coarser level
//! - [`SyncEngine`]: on-demand back-fill for remote subscribers
//! - [`Daemon`]: single-threaded dispatcher binding it all to a 1 Hz tick
//!
//! # Example
//!
//! ```rust,ignore
//! use tmpod::{BlockStore, Daemon, Registry};
//!
//! let registry = Registry::from_yaml_file("/etc/tmpod/sensors.yaml")?;
//! let store = BlockStore::new("/var/lib/tmpo");
//! store.startup_scrub();
//!
//! let daemon = Daemon::new(registry, store);
//! tmpod::mqtt::run(daemon, mqtt_config).await?;
//! ```

#![deny(missing_docs)]

pub mod block;
pub mod buffer;
pub mod compact;
pub mod config;
pub mod daemon;
pub mod error;
pub mod flush;
pub mod gc;
pub mod mqtt;
pub mod publish;
pub mod store;
pub mod stream;
pub mod sync;
pub mod uplink;

pub use block::{Bid, Block, BlockHead, Lvl, Rid, Sample, Sid, TIMESTAMP_MIN};
pub use buffer::IngestBuffer;
pub use compact::{CompactStep, Compactor};
pub use config::{Registry, SensorParams};
pub use daemon::Daemon;
pub use error::{Result, TmpoError};
pub use flush::Flusher;
pub use publish::Publisher;
pub use store::BlockStore;
pub use sync::{SyncEngine, Watermark};
