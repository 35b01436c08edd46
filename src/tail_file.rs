// SPDX-License-Identifier: Apache-2.0

//! Stateful reader over one tailed file.
//!
//! Maintains the committed offset `pos` and the tentative read cursor
//! `line_read_pos` (`line_read_pos >= pos` always). `read_events` advances
//! only the cursor; after the downstream transaction commits, the caller
//! promotes `pos` via `update_pos`. On rollback, `update_file_pos(pos)`
//! rewinds the cursor and discards the framer's carry-over state so the same
//! bytes are re-read.
//!
//! Framing is a two-tier buffered scan: a fixed read buffer refilled from the
//! file plus a carry-over buffer for bytes from a prior fill that did not end
//! in LF. CRLF and LF both frame to the same record payload.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use tracing::{debug, info};

use crate::config::{MultilineBelong, MultilineConfig, BYTE_OFFSET_HEADER_KEY};
use crate::error::{Error, Result};
use crate::file_id::FileId;
use crate::record::Record;

const BYTE_NL: u8 = b'\n';
const BYTE_CR: u8 = b'\r';

pub const BUFFER_SIZE: usize = 8192;

/// Header carrying the accumulation time of a multiline record, millis since
/// the epoch.
pub const TIMESTAMP_HEADER_KEY: &str = "timestamp";
/// Header marking a record whose body merges more than one source line.
pub const MULTILINE_HEADER_KEY: &str = "multiline";

/// One framed line. `line_sep_include` is false for a trailing partial that
/// was not terminated by LF.
#[derive(Debug, PartialEq, Eq)]
pub struct LineResult {
    pub line_sep_include: bool,
    pub line: Vec<u8>,
}

/// Compiled multiline aggregation settings, shared by every file of a source.
#[derive(Debug, Clone)]
pub struct Multiline {
    pattern: Regex,
    belong: MultilineBelong,
    matched: bool,
    event_timeout_secs: u64,
    max_bytes: usize,
    max_lines: usize,
}

impl Multiline {
    pub fn from_config(cfg: &MultilineConfig) -> Result<Self> {
        let pattern = Regex::new(&cfg.pattern)
            .map_err(|e| Error::Config(format!("bad multiline pattern '{}': {}", cfg.pattern, e)))?;
        Ok(Self {
            pattern,
            belong: cfg.belong,
            matched: cfg.matched,
            event_timeout_secs: cfg.event_timeout_secs,
            max_bytes: cfg.max_bytes,
            max_lines: cfg.max_lines,
        })
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

/// Pending multiline accumulator
#[derive(Debug)]
struct BufferedEvent {
    body: Vec<u8>,
    headers: HashMap<String, String>,
    timestamp_millis: u64,
}

impl BufferedEvent {
    fn into_record(self) -> Record {
        let mut record = Record::with_body(self.body);
        for (k, v) in self.headers {
            record.set_header(k, v);
        }
        record
    }
}

pub struct TailFile {
    file: Option<File>,
    path: PathBuf,
    id: FileId,
    pos: u64,
    line_read_pos: u64,
    last_updated: u64,
    need_tail: bool,
    headers: HashMap<String, String>,

    buffer: Vec<u8>,
    buffer_pos: Option<usize>,
    old_buffer: Vec<u8>,
    max_line_bytes: usize,

    multiline: Option<Multiline>,
    buffer_event: Option<BufferedEvent>,
}

impl TailFile {
    pub fn open(
        path: impl Into<PathBuf>,
        id: FileId,
        headers: HashMap<String, String>,
        pos: u64,
        multiline: Option<Multiline>,
    ) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;
        if pos > 0 {
            file.seek(SeekFrom::Start(pos))?;
        }
        let max_line_bytes = multiline
            .as_ref()
            .map(|m| m.max_bytes())
            .unwrap_or(crate::config::DEFAULT_MULTILINE_MAX_BYTES);

        Ok(Self {
            file: Some(file),
            path,
            id,
            pos,
            line_read_pos: pos,
            last_updated: 0,
            need_tail: true,
            headers,
            buffer: Vec::new(),
            buffer_pos: None,
            old_buffer: Vec::new(),
            max_line_bytes,
            multiline,
            buffer_event: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename-in-place: rotation moved the file, the identity is unchanged
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn line_read_pos(&self) -> u64 {
        self.line_read_pos
    }

    pub fn last_updated(&self) -> u64 {
        self.last_updated
    }

    pub fn set_last_updated(&mut self, millis: u64) {
        self.last_updated = millis;
    }

    pub fn need_tail(&self) -> bool {
        self.need_tail
    }

    pub fn set_need_tail(&mut self, need_tail: bool) {
        self.need_tail = need_tail;
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn set_headers(&mut self, headers: HashMap<String, String>) {
        self.headers = headers;
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Release the handle, retaining offsets. Carry-over framer bytes are
    /// discarded; they sit above `line_read_pos` and are re-read after the
    /// lazy reopen seeks back to it.
    pub fn close(&mut self) {
        self.file = None;
        self.buffer_pos = None;
        self.old_buffer.clear();
    }

    /// Promote the committed offset. Returns false when identity or path no
    /// longer match this reader.
    pub fn update_pos(&mut self, path: &Path, id: FileId, pos: u64) -> Result<bool> {
        if self.id == id && self.path == path {
            self.pos = pos;
            self.update_file_pos(pos)?;
            info!(path = %path.display(), inode = %id, pos, "Updated position");
            return Ok(true);
        }
        Ok(false)
    }

    /// Move the read cursor to `pos` and discard framer state. Used to rewind
    /// after a rollback and to recover from truncation.
    pub fn update_file_pos(&mut self, pos: u64) -> Result<()> {
        if let Some(ref mut file) = self.file {
            file.seek(SeekFrom::Start(pos))?;
        }
        self.line_read_pos = pos;
        self.buffer_pos = None;
        self.old_buffer.clear();
        Ok(())
    }

    /// Drop any pending multiline accumulator. Called on rollback, rotation
    /// and truncation, where the accumulated bytes will be re-read.
    pub fn clear_buffer_event(&mut self) {
        self.buffer_event = None;
    }

    /// Whether a pending multiline accumulator has outlived the stall timeout
    pub fn need_flush_buffer_event(&self) -> bool {
        let (Some(ml), Some(be)) = (&self.multiline, &self.buffer_event) else {
            return false;
        };
        ml.event_timeout_secs > 0
            && now_millis().saturating_sub(be.timestamp_millis) > ml.event_timeout_secs * 1000
    }

    /// Read up to `num_events` framed records. May return fewer, including
    /// zero, when no complete record is available.
    pub fn read_events(
        &mut self,
        num_events: usize,
        backoff_without_nl: bool,
        add_byte_offset: bool,
    ) -> Result<Vec<Record>> {
        if self.multiline.is_some() {
            return self.read_multiline_events(num_events);
        }

        let mut events = Vec::new();
        for _ in 0..num_events {
            match self.read_record(backoff_without_nl, add_byte_offset)? {
                Some(record) => events.push(record),
                None => break,
            }
        }
        Ok(events)
    }

    fn read_record(
        &mut self,
        backoff_without_nl: bool,
        add_byte_offset: bool,
    ) -> Result<Option<Record>> {
        let start_pos = self.line_read_pos;
        let Some(line) = self.read_line()? else {
            return Ok(None);
        };
        if backoff_without_nl && !line.line_sep_include {
            info!(
                path = %self.path.display(),
                inode = %self.id,
                pos = start_pos,
                "Backing off in file without newline"
            );
            self.update_file_pos(start_pos)?;
            return Ok(None);
        }
        let mut record = Record::with_body(line.line);
        if add_byte_offset {
            record.set_header(BYTE_OFFSET_HEADER_KEY, start_pos.to_string());
        }
        Ok(Some(record))
    }

    fn read_multiline_events(&mut self, num_events: usize) -> Result<Vec<Record>> {
        let Some(ml) = self.multiline.clone() else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        while events.len() < num_events {
            let Some(line) = self.read_line()? else {
                break;
            };
            let event = match ml.belong {
                MultilineBelong::Previous => self.read_multiline_event_previous(line, &ml),
                MultilineBelong::Next => self.read_multiline_event_next(line, &ml),
            };
            if let Some(event) = event {
                events.push(event);
            }
            let over_limit = self.buffer_event.as_ref().is_some_and(|be| {
                be.body.len() >= ml.max_bytes || count_newlines(&be.body) >= ml.max_lines
            });
            if over_limit {
                self.flush_buffer_event(&mut events);
            }
        }
        if self.need_flush_buffer_event() {
            self.flush_buffer_event(&mut events);
        }
        Ok(events)
    }

    /// previous mode: a matching line belongs to the pending event; a
    /// non-matching line finishes the pending event and starts the next one.
    fn read_multiline_event_previous(&mut self, line: LineResult, ml: &Multiline) -> Option<Record> {
        if self.line_is_part(&line, ml) {
            self.merge_into_buffer_event(&line);
            None
        } else {
            let finished = self.buffer_event.take().map(BufferedEvent::into_record);
            self.start_buffer_event(&line);
            finished
        }
    }

    /// next mode: a matching line belongs to the event still being built; a
    /// non-matching line completes it.
    fn read_multiline_event_next(&mut self, line: LineResult, ml: &Multiline) -> Option<Record> {
        if self.line_is_part(&line, ml) {
            self.merge_into_buffer_event(&line);
            None
        } else {
            self.merge_into_buffer_event(&line);
            self.buffer_event.take().map(BufferedEvent::into_record)
        }
    }

    fn line_is_part(&self, line: &LineResult, ml: &Multiline) -> bool {
        let text = String::from_utf8_lossy(&line.line);
        ml.pattern.is_match(&text) == ml.matched
    }

    /// Append the line to the pending accumulator, creating it if absent.
    /// Merging marks the accumulator as multiline and refreshes its
    /// accumulation timestamp.
    fn merge_into_buffer_event(&mut self, line: &LineResult) {
        let now = now_millis();
        let line_bytes = to_origin_bytes(line);
        let (body, mut headers) = match self.buffer_event.take() {
            Some(be) => {
                let mut body = be.body;
                body.extend_from_slice(&line_bytes);
                (body, be.headers)
            }
            None => (line_bytes, HashMap::new()),
        };
        headers.insert(TIMESTAMP_HEADER_KEY.to_string(), now.to_string());
        headers.insert(MULTILINE_HEADER_KEY.to_string(), "true".to_string());
        self.buffer_event = Some(BufferedEvent {
            body,
            headers,
            timestamp_millis: now,
        });
    }

    /// Begin a fresh accumulator from a line that opens a new event
    fn start_buffer_event(&mut self, line: &LineResult) {
        let now = now_millis();
        let mut headers = HashMap::new();
        headers.insert(TIMESTAMP_HEADER_KEY.to_string(), now.to_string());
        self.buffer_event = Some(BufferedEvent {
            body: to_origin_bytes(line),
            headers,
            timestamp_millis: now,
        });
    }

    fn flush_buffer_event(&mut self, events: &mut Vec<Record>) {
        if let Some(be) = self.buffer_event.take() {
            events.push(be.into_record());
        }
    }

    /// Frame the next line out of the buffered file bytes.
    pub fn read_line(&mut self) -> Result<Option<LineResult>> {
        loop {
            let start = match self.buffer_pos {
                Some(start) => start,
                None => {
                    let (pointer, len) = self.stat()?;
                    if pointer >= len || self.fill_buffer(len - pointer)? == 0 {
                        return Ok(self.take_trailing_partial());
                    }
                    0
                }
            };

            if let Some(nl) = find_byte(&self.buffer[start..], BYTE_NL) {
                let i = start + nl;
                let mut old_len = self.old_buffer.len();
                let mut line_len = i - start;
                if i > start && self.buffer[i - 1] == BYTE_CR {
                    line_len -= 1;
                } else if old_len > 0 && self.old_buffer[old_len - 1] == BYTE_CR {
                    old_len -= 1;
                }
                let mut line = Vec::with_capacity(old_len + line_len);
                line.extend_from_slice(&self.old_buffer[..old_len]);
                line.extend_from_slice(&self.buffer[start..start + line_len]);

                // Consumed bytes include the LF and any stripped CR.
                self.line_read_pos += (self.old_buffer.len() + (i - start + 1)) as u64;
                self.old_buffer.clear();
                self.buffer_pos = if i + 1 < self.buffer.len() {
                    Some(i + 1)
                } else {
                    None
                };
                return Ok(Some(LineResult {
                    line_sep_include: true,
                    line,
                }));
            }

            // No LF in the remainder of this fill; carry it over.
            self.old_buffer.extend_from_slice(&self.buffer[start..]);
            self.buffer_pos = None;
            if self.old_buffer.len() >= self.max_line_bytes {
                debug!(
                    path = %self.path.display(),
                    bytes = self.old_buffer.len(),
                    "Line exceeds maximum length, splitting"
                );
                let line = std::mem::take(&mut self.old_buffer);
                self.line_read_pos += line.len() as u64;
                return Ok(Some(LineResult {
                    line_sep_include: false,
                    line,
                }));
            }
        }
    }

    /// At end of file: surface carried-over bytes as a partial line
    fn take_trailing_partial(&mut self) -> Option<LineResult> {
        if self.old_buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.old_buffer);
        self.line_read_pos += line.len() as u64;
        Some(LineResult {
            line_sep_include: false,
            line,
        })
    }

    fn stat(&mut self) -> Result<(u64, u64)> {
        let file = self.ensure_open()?;
        let pointer = file.stream_position()?;
        let len = file.metadata()?.len();
        Ok((pointer, len))
    }

    fn fill_buffer(&mut self, remaining: u64) -> Result<usize> {
        let want = BUFFER_SIZE
            .min(self.max_line_bytes)
            .min(remaining as usize);
        let mut buf = std::mem::take(&mut self.buffer);
        buf.resize(want, 0);
        let file = self.ensure_open()?;
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        self.buffer = buf;
        self.buffer_pos = if n > 0 { Some(0) } else { None };
        Ok(n)
    }

    fn ensure_open(&mut self) -> Result<&mut File> {
        if let Some(ref mut file) = self.file {
            return Ok(file);
        }
        let mut file = File::open(&self.path)?;
        if self.line_read_pos > 0 {
            file.seek(SeekFrom::Start(self.line_read_pos))?;
        }
        Ok(self.file.insert(file))
    }
}

/// Restore the line's original terminator: a single LF when the source line
/// carried one. A stripped CR is not restored.
fn to_origin_bytes(line: &LineResult) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(line.line.len() + 1);
    bytes.extend_from_slice(&line.line);
    if line.line_sep_include {
        bytes.push(BYTE_NL);
    }
    bytes
}

fn count_newlines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b == BYTE_NL).count()
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
