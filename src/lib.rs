// SPDX-License-Identifier: Apache-2.0

//! Tailing file source.
//!
//! Watches a dynamic set of files matched by per-group patterns, reads newly
//! appended bytes, frames them into line or multiline records, and hands them
//! to a transactional downstream channel with at-least-once delivery. Read
//! offsets persist across restarts through a JSON position snapshot, and
//! files are identified by inode-like identity so rotation never duplicates
//! and truncation never skips data.
//!
//! Features:
//! - Wildcard directory matching with an mtime-validated directory cache
//! - Identity-stable tracking across renames, reopen-on-rotation, idle close
//! - LF/CRLF line framing across buffer boundaries, optional multiline
//!   aggregation
//! - Atomic position snapshot writes after every commit

pub mod channel;
pub mod config;
pub mod error;
pub mod file_id;
pub mod matcher;
pub mod position;
pub mod record;
pub mod registry;
pub mod source;
pub mod tail_file;

pub use channel::{Channel, MemoryChannel, Transaction};
pub use config::{Context, MultilineBelong, TaildirConfig};
pub use error::{Error, Result};
pub use file_id::FileId;
pub use matcher::TaildirMatcher;
pub use position::{PositionEntry, PositionStore};
pub use record::Record;
pub use registry::FileRegistry;
pub use source::{Status, TaildirSource};
pub use tail_file::TailFile;
