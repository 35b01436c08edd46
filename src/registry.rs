// SPDX-License-Identifier: Apache-2.0

//! The authoritative map of currently tracked files, keyed by stable file
//! identity. Owns every open handle: files are opened on first match (or
//! restored from the position snapshot), re-pointed on rename, reset on
//! truncation, closed when idle, and dropped once they have been gone from
//! the match set for longer than the idle timeout.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use crate::file_id::FileId;
use crate::position::PositionEntry;
use crate::tail_file::{now_millis, Multiline, TailFile};

pub struct FileRegistry {
    tail_files: HashMap<FileId, TailFile>,
    /// Monotonic read sequence per file, for least-recently-read eviction
    last_read_seq: HashMap<FileId, u64>,
    read_seq: u64,
    skip_to_end: bool,
    idle_timeout_ms: u64,
    max_open_files: usize,
    multiline: Option<Multiline>,
}

impl FileRegistry {
    pub fn new(
        skip_to_end: bool,
        idle_timeout_secs: u64,
        max_open_files: usize,
        multiline: Option<Multiline>,
    ) -> Self {
        Self {
            tail_files: HashMap::new(),
            last_read_seq: HashMap::new(),
            read_seq: 0,
            skip_to_end,
            idle_timeout_ms: idle_timeout_secs.saturating_mul(1000),
            max_open_files: max_open_files.max(1),
            multiline,
        }
    }

    pub fn len(&self) -> usize {
        self.tail_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tail_files.is_empty()
    }

    pub fn get_mut(&mut self, id: FileId) -> Option<&mut TailFile> {
        self.tail_files.get_mut(&id)
    }

    /// Record that `id` was just read, for eviction ordering
    pub fn mark_read(&mut self, id: FileId) {
        self.read_seq += 1;
        self.last_read_seq.insert(id, self.read_seq);
    }

    /// Reconcile the registry with this cycle's matched paths.
    ///
    /// `matched` is the union across groups, each path tagged with its
    /// group's header overlay; the first group to claim an identity in a
    /// cycle wins. `positions` holds offsets loaded from the snapshot at
    /// startup, applied when an identity is first opened.
    pub fn reconcile(
        &mut self,
        matched: &[(PathBuf, Arc<HashMap<String, String>>)],
        positions: &HashMap<FileId, (u64, PathBuf)>,
    ) {
        let now_ms = now_millis();
        let mut seen: HashSet<FileId> = HashSet::with_capacity(matched.len());

        for (path, headers) in matched {
            let id = match FileId::from_path(path) {
                Ok(id) => id,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to resolve file identity");
                    continue;
                }
            };
            if !seen.insert(id) {
                continue;
            }

            let meta = match fs::metadata(path) {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to stat matched file");
                    continue;
                }
            };
            let len = meta.len();
            let mtime_ms = meta
                .modified()
                .ok()
                .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(now_ms);

            match self.tail_files.get_mut(&id) {
                Some(tf) => {
                    tf.set_path(path.clone());

                    if len < tf.pos() {
                        warn!(
                            path = %path.display(),
                            inode = %id,
                            len,
                            pos = tf.pos(),
                            "File truncated, restarting from the beginning"
                        );
                        tf.clear_buffer_event();
                        if let Err(e) = tf.update_pos(path, id, 0) {
                            warn!(path = %path.display(), error = %e, "Failed to reset truncated file");
                            continue;
                        }
                    }

                    let updated = tf.last_updated() < mtime_ms || len > tf.line_read_pos();
                    if updated {
                        tf.set_last_updated(mtime_ms);
                    }
                    tf.set_need_tail(updated);
                }
                None => {
                    let offset = match positions.get(&id) {
                        Some((pos, _)) if *pos <= len => *pos,
                        Some((pos, _)) => {
                            warn!(
                                path = %path.display(),
                                inode = %id,
                                len,
                                pos,
                                "Stored position beyond file length, restarting from the beginning"
                            );
                            0
                        }
                        None if self.skip_to_end => len,
                        None => 0,
                    };

                    match TailFile::open(
                        path.clone(),
                        id,
                        headers.as_ref().clone(),
                        offset,
                        self.multiline.clone(),
                    ) {
                        Ok(mut tf) => {
                            tf.set_last_updated(mtime_ms);
                            tf.set_need_tail(len > offset);
                            debug!(path = %path.display(), inode = %id, offset, "Tracking file");
                            self.tail_files.insert(id, tf);
                            self.mark_read(id);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Failed to open matched file");
                        }
                    }
                }
            }
        }

        // Identities gone from the match set linger until their idle timeout
        // elapses, then are dropped; their snapshot entry disappears with
        // them.
        let idle_timeout_ms = self.idle_timeout_ms;
        let removed: Vec<FileId> = self
            .tail_files
            .iter()
            .filter(|(id, tf)| {
                !seen.contains(id) && now_ms.saturating_sub(tf.last_updated()) >= idle_timeout_ms
            })
            .map(|(id, _)| *id)
            .collect();
        for id in removed {
            if let Some(mut tf) = self.tail_files.remove(&id) {
                debug!(path = %tf.path().display(), inode = %id, "Untracking file");
                tf.close();
            }
            self.last_read_seq.remove(&id);
        }

        self.enforce_open_budget();
    }

    /// Close least-recently-read handles until the open count fits the budget
    fn enforce_open_budget(&mut self) {
        let open: usize = self.tail_files.values().filter(|tf| tf.is_open()).count();
        if open <= self.max_open_files {
            return;
        }

        let mut candidates: Vec<(u64, FileId)> = self
            .tail_files
            .iter()
            .filter(|(_, tf)| tf.is_open())
            .map(|(id, _)| (self.last_read_seq.get(id).copied().unwrap_or(0), *id))
            .collect();
        candidates.sort();

        let excess = open - self.max_open_files;
        for (_, id) in candidates.into_iter().take(excess) {
            if let Some(tf) = self.tail_files.get_mut(&id) {
                debug!(path = %tf.path().display(), inode = %id, "Closing handle over open-file budget");
                tf.close();
            }
        }
    }

    /// Files to visit this cycle, ascending by `(last_updated, id)`
    pub fn consume_order(&self) -> Vec<FileId> {
        let mut order: Vec<(u64, FileId)> = self
            .tail_files
            .iter()
            .map(|(id, tf)| (tf.last_updated(), *id))
            .collect();
        order.sort();
        order.into_iter().map(|(_, id)| id).collect()
    }

    /// Close handles of files untouched for longer than the idle timeout.
    /// Only fully committed files are closed; a file with read-ahead beyond
    /// `pos` keeps its handle until the transaction settles.
    pub fn close_idle(&mut self) {
        let now_ms = now_millis();
        for (id, tf) in self.tail_files.iter_mut() {
            if tf.is_open()
                && tf.line_read_pos() == tf.pos()
                && now_ms.saturating_sub(tf.last_updated()) > self.idle_timeout_ms
            {
                debug!(path = %tf.path().display(), inode = %id, "Closing idle file");
                tf.close();
            }
        }
    }

    pub fn close_all(&mut self) {
        for tf in self.tail_files.values_mut() {
            tf.close();
        }
    }

    /// Snapshot of every tracked file's committed offset
    pub fn position_entries(&self) -> Vec<PositionEntry> {
        self.tail_files
            .iter()
            .map(|(id, tf)| PositionEntry {
                inode: *id,
                pos: tf.pos(),
                file: tf.path().display().to_string(),
            })
            .collect()
    }
}
