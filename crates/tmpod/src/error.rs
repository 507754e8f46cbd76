//! Error and Result types for tmpod operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for tmpod operations.
pub type Result<T> = std::result::Result<T, TmpoError>;

/// The error type for block storage and daemon operations.
#[derive(Debug, Error)]
pub enum TmpoError {
    /// A block file already exists at the target path.
    ///
    /// Block files are immutable after close; a second write for the same
    /// `(sid, rid, lvl, bid)` is always a bug or a crash survivor, never a
    /// legitimate overwrite.
    #[error("Block already exists: {0}")]
    BlockExists(PathBuf),

    /// A block file on disk could not be decoded.
    #[error("Corrupt block {path}: {reason}")]
    CorruptBlock {
        /// Path of the offending file.
        path: PathBuf,
        /// What the decoder choked on.
        reason: String,
    },

    /// The inbound uplink referenced a device serial that is not in the
    /// registry. The whole uplink is dropped.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// The inbound uplink payload could not be decoded.
    #[error("Bad uplink payload: {0}")]
    BadUplink(String),

    /// The sensor registry file could not be loaded or is malformed.
    #[error("Config error: {0}")]
    Config(String),

    /// An MQTT publish could not be handed to the client.
    #[error("Publish failed on {topic}: {reason}")]
    Publish {
        /// Topic the payload was destined for.
        topic: String,
        /// Client-side failure description.
        reason: String,
    },

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
