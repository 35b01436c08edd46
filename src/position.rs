// SPDX-License-Identifier: Apache-2.0

//! Durable position snapshot: `FileId → committed offset`.
//!
//! The on-disk format is a bare JSON array of `{"inode", "pos", "file"}`
//! objects, rewritten atomically (unique sibling temp file, flush, rename)
//! after every successful commit and on the background writer cadence.
//! Entries are sorted by inode so writing the same state twice produces a
//! byte-identical file.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::file_id::FileId;

/// One persisted file position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub inode: FileId,
    pub pos: u64,
    pub file: String,
}

/// Store for the position snapshot file.
///
/// Owns the on-disk file and an in-memory copy of the last snapshot it
/// serialized; the registry remains the source of truth for live offsets.
pub struct PositionStore {
    path: PathBuf,
    last_written: Mutex<Vec<PositionEntry>>,
}

impl PositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_written: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot into a `FileId → (pos, path)` map.
    ///
    /// A missing file yields an empty map. A corrupt file is logged and also
    /// yields an empty map: previously tracked files restart from offset 0,
    /// which is the documented at-least-once boundary.
    pub fn load(&self) -> HashMap<FileId, (u64, PathBuf)> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No position file, starting fresh");
                return HashMap::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to open position file");
                return HashMap::new();
            }
        };

        let entries: Vec<PositionEntry> = match serde_json::from_reader(BufReader::new(file)) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Position file is corrupt, starting with empty positions"
                );
                return HashMap::new();
            }
        };

        debug!(count = entries.len(), "Loaded position entries");
        entries
            .into_iter()
            .map(|e| (e.inode, (e.pos, PathBuf::from(e.file))))
            .collect()
    }

    /// Atomically rewrite the snapshot with the given entries.
    pub fn write(&self, mut entries: Vec<PositionEntry>) -> Result<()> {
        entries.sort_by(|a, b| a.inode.cmp(&b.inode));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Persistence(format!("failed to create position file directory: {}", e))
                })?;
            }
        }

        // Unique temp name so a concurrent background write cannot clobber a
        // post-commit write mid-flight.
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let temp_path = self
            .path
            .with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

        let file = File::create(&temp_path)
            .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &entries)
            .map_err(|e| Error::Persistence(format!("failed to serialize positions: {}", e)))?;
        writer
            .flush()
            .map_err(|e| Error::Persistence(format!("failed to flush positions: {}", e)))?;
        drop(writer);

        fs::rename(&temp_path, &self.path)
            .map_err(|e| Error::Persistence(format!("failed to rename position file: {}", e)))?;

        if let Ok(mut last) = self.last_written.lock() {
            *last = entries;
        }

        Ok(())
    }

    /// The entries of the last successful write
    pub fn last_written(&self) -> Vec<PositionEntry> {
        self.last_written
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }
}
