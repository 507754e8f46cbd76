//! Streaming block reader.
//!
//! Blocks can be tens of megabytes and never fit in RAM on target hardware,
//! so the compactor consumes them as a lazy sequence of segments instead of
//! parsed documents. The reader is a small state machine over a streaming
//! gzip decoder that splits the JSON text on three anchors:
//!
//! ```text
//! {"h":  …header object…  ,"t":[0  …time deltas…  ],"v":[0  …value deltas…  ]}
//!        └── Head ──────┘          └── Time ────┘           └── Value ────┘
//! ```
//!
//! The leading `0` of each delta array belongs to the anchor and is never
//! part of a segment, which lets the merge writer stitch inputs together by
//! emitting its own joining delta. Input is read in 4 KiB chunks; an anchor
//! falling across a chunk boundary is handled by holding back the last
//! `anchor length − 1` bytes of any partial segment.

use crate::error::{Result, TmpoError};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// End of the header object, consuming the `t` array opener and its
/// leading `0`.
const HEAD_END: &[u8] = b",\"t\":[0";

/// Transition from the `t` array to the `v` array.
const T_END: &[u8] = b"],\"v\":[0";

/// End of the `v` array and the document.
const V_END: &[u8] = b"]}";

/// Document prefix before the header object.
const HEAD_PREFIX: &[u8] = b"{\"h\":";

/// Decompressed read granularity.
const CHUNK: usize = 4096;

/// One event from a [`BlockStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// The entire header object as JSON text. Always a single event.
    Head(String),
    /// A run of `t` array text (comma-prefixed deltas, leading `0`
    /// stripped). `last` marks the final run.
    Time {
        /// Raw delta text, passed through verbatim by the merge writer.
        text: String,
        /// True on the run that ends the array.
        last: bool,
    },
    /// A run of `v` array text, same shape as [`Segment::Time`].
    Value {
        /// Raw delta text.
        text: String,
        /// True on the run that ends the array.
        last: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Time,
    Value,
    Done,
}

/// Lazy segment reader over one gzip block file.
pub struct BlockStream {
    decoder: GzDecoder<BufReader<File>>,
    path: PathBuf,
    buf: Vec<u8>,
    state: State,
    eof: bool,
}

impl BlockStream {
    /// Opens a block file for streaming.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            decoder: GzDecoder::new(BufReader::new(file)),
            path,
            buf: Vec::new(),
            state: State::Head,
            eof: false,
        })
    }

    /// Path of the underlying block file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl Into<String>) -> TmpoError {
        TmpoError::CorruptBlock {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; CHUNK];
        let n = self.decoder.read(&mut chunk).map_err(|err| {
            match err.kind() {
                // Torn or garbled gzip surfaces as these three kinds.
                io::ErrorKind::InvalidInput
                | io::ErrorKind::InvalidData
                | io::ErrorKind::UnexpectedEof => self.corrupt(err.to_string()),
                _ => TmpoError::Io(err),
            }
        })?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn take_text(&mut self, upto: usize, skip: usize) -> Result<String> {
        let text = String::from_utf8(self.buf[..upto].to_vec())
            .map_err(|_| self.corrupt("non-UTF-8 content"))?;
        self.buf.drain(..upto + skip);
        Ok(text)
    }

    fn next_segment(&mut self) -> Result<Option<Segment>> {
        loop {
            let anchor = match self.state {
                State::Head => HEAD_END,
                State::Time => T_END,
                State::Value => V_END,
                State::Done => return Ok(None),
            };

            if let Some(pos) = find(&self.buf, anchor) {
                return match self.state {
                    State::Head => {
                        if !self.buf.starts_with(HEAD_PREFIX) {
                            return Err(self.corrupt("missing header prefix"));
                        }
                        let text = self.take_text(pos, anchor.len())?;
                        self.state = State::Time;
                        Ok(Some(Segment::Head(text[HEAD_PREFIX.len()..].to_string())))
                    }
                    State::Time => {
                        let text = self.take_text(pos, anchor.len())?;
                        self.state = State::Value;
                        Ok(Some(Segment::Time { text, last: true }))
                    }
                    State::Value => {
                        let text = self.take_text(pos, anchor.len())?;
                        self.state = State::Done;
                        Ok(Some(Segment::Value { text, last: true }))
                    }
                    State::Done => unreachable!(),
                };
            }

            if self.eof {
                return Err(self.corrupt(format!("truncated in {:?} section", self.state)));
            }

            // No anchor in sight; relieve the buffer but hold back enough
            // bytes to keep a straddling anchor intact.
            if self.buf.len() > CHUNK + anchor.len() {
                let emit = self.buf.len() - (anchor.len() - 1);
                let text = self.take_text(emit, 0)?;
                return match self.state {
                    State::Time => Ok(Some(Segment::Time { text, last: false })),
                    State::Value => Ok(Some(Segment::Value { text, last: false })),
                    // Headers are bounded; keep accumulating.
                    State::Head | State::Done => {
                        Err(self.corrupt("header exceeds buffer bounds"))
                    }
                };
            }

            self.fill()?;
        }
    }
}

impl Iterator for BlockStream {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_segment().transpose()
    }
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
