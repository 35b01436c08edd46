// SPDX-License-Identifier: Apache-2.0

//! Configuration for the tailing file source.
//!
//! The host hands over a flat string key/value [`Context`]; [`TaildirConfig`]
//! is the validated, typed form. All validation happens in `from_context` so
//! a bad configuration is rejected before `start`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub const POSITION_FILE: &str = "positionFile";
pub const FILE_GROUPS: &str = "filegroups";
pub const FILE_GROUPS_PREFIX: &str = "filegroups.";
pub const HEADERS_PREFIX: &str = "headers.";
pub const FILENAME_HEADER: &str = "fileHeader";
pub const FILENAME_HEADER_KEY: &str = "fileHeaderKey";
pub const BYTE_OFFSET_HEADER: &str = "byteOffsetHeader";
pub const BATCH_SIZE: &str = "batchSize";
pub const BACKOFF_WITHOUT_NL: &str = "backoffWithoutNL";
pub const IDLE_TIMEOUT: &str = "idleTimeout";
pub const WRITE_POS_INTERVAL: &str = "writePosInterval";
pub const SKIP_TO_END: &str = "skipToEnd";
pub const MAX_OPEN_FILES: &str = "maxOpenFiles";
pub const CACHE_PATTERN_MATCHING: &str = "cachePatternMatching";
pub const MULTILINE: &str = "multiline";
pub const MULTILINE_PATTERN: &str = "multilinePattern";
pub const MULTILINE_PATTERN_BELONG: &str = "multilinePatternBelong";
pub const MULTILINE_PATTERN_MATCHED: &str = "multilinePatternMatched";
pub const MULTILINE_EVENT_TIMEOUT_SECS: &str = "multilineEventTimeoutSecs";
pub const MULTILINE_MAX_BYTES: &str = "multilineMaxBytes";
pub const MULTILINE_MAX_LINES: &str = "multilineMaxLines";

pub const DEFAULT_FILENAME_HEADER_KEY: &str = "file";
pub const BYTE_OFFSET_HEADER_KEY: &str = "byteoffset";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_WRITE_POS_INTERVAL_SECS: u64 = 3;
pub const DEFAULT_MAX_OPEN_FILES: usize = 1000;
pub const DEFAULT_MULTILINE_MAX_BYTES: usize = 10_485_760;
pub const DEFAULT_MULTILINE_MAX_LINES: usize = 500;

/// Flat string key/value configuration context supplied by the host.
#[derive(Debug, Clone, Default)]
pub struct Context {
    map: HashMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.map.insert(key.into(), value.into());
        self
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.map.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse::<bool>()
                .map_err(|_| Error::Config(format!("{} is not a boolean: '{}'", key, v))),
        }
    }

    pub fn u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.map.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse::<u64>()
                .map_err(|_| Error::Config(format!("{} is not an integer: '{}'", key, v))),
        }
    }

    pub fn usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.map.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| Error::Config(format!("{} is not an integer: '{}'", key, v))),
        }
    }

    /// All entries whose key starts with `prefix`, with the prefix stripped.
    pub fn sub_properties(&self, prefix: &str) -> HashMap<String, String> {
        self.map
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect()
    }
}

/// Which side of the pattern a matching line attaches to in multiline mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultilineBelong {
    Previous,
    Next,
}

/// Multiline aggregation parameters
#[derive(Debug, Clone)]
pub struct MultilineConfig {
    pub pattern: String,
    pub belong: MultilineBelong,
    pub matched: bool,
    pub event_timeout_secs: u64,
    pub max_bytes: usize,
    pub max_lines: usize,
}

/// A named pairing of a file pattern with a static header overlay
#[derive(Debug, Clone)]
pub struct FileGroupConfig {
    pub name: String,
    pub pattern: String,
    pub headers: HashMap<String, String>,
}

/// Validated configuration for [`TaildirSource`](crate::source::TaildirSource)
#[derive(Debug, Clone)]
pub struct TaildirConfig {
    pub position_file: PathBuf,
    pub groups: Vec<FileGroupConfig>,
    pub file_header: bool,
    pub file_header_key: String,
    pub byte_offset_header: bool,
    pub batch_size: usize,
    pub backoff_without_nl: bool,
    pub idle_timeout_secs: u64,
    pub write_pos_interval_secs: u64,
    pub skip_to_end: bool,
    pub max_open_files: usize,
    pub cache_pattern_matching: bool,
    pub multiline: Option<MultilineConfig>,
}

impl TaildirConfig {
    pub fn from_context(ctx: &Context) -> Result<Self> {
        let position_file = ctx
            .string(POSITION_FILE)
            .ok_or_else(|| Error::Config(format!("{} must be specified", POSITION_FILE)))?;

        let group_names = ctx
            .string(FILE_GROUPS)
            .map(|s| s.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default();
        if group_names.is_empty() {
            return Err(Error::Config(format!(
                "{} must name at least one file group",
                FILE_GROUPS
            )));
        }

        let header_props = ctx.sub_properties(HEADERS_PREFIX);
        let mut groups = Vec::with_capacity(group_names.len());
        for name in &group_names {
            if groups.iter().any(|g: &FileGroupConfig| g.name == *name) {
                return Err(Error::Config(format!("duplicate file group '{}'", name)));
            }
            let pattern = ctx
                .string(&format!("{}{}", FILE_GROUPS_PREFIX, name))
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no file pattern configured for group '{}' ({}{})",
                        name, FILE_GROUPS_PREFIX, name
                    ))
                })?;

            // headers.<group>.<key> = value
            let group_prefix = format!("{}.", name);
            let headers = header_props
                .iter()
                .filter_map(|(k, v)| {
                    k.strip_prefix(&group_prefix)
                        .map(|key| (key.to_string(), v.clone()))
                })
                .collect();

            groups.push(FileGroupConfig {
                name: name.clone(),
                pattern: pattern.to_string(),
                headers,
            });
        }

        let multiline = if ctx.bool(MULTILINE, false)? {
            let pattern = ctx.string(MULTILINE_PATTERN).ok_or_else(|| {
                Error::Config(format!(
                    "{} must be specified when {} is true",
                    MULTILINE_PATTERN, MULTILINE
                ))
            })?;
            let belong = match ctx.string(MULTILINE_PATTERN_BELONG).unwrap_or("previous") {
                "previous" => MultilineBelong::Previous,
                "next" => MultilineBelong::Next,
                other => {
                    return Err(Error::Config(format!(
                        "{} must be 'previous' or 'next', got '{}'",
                        MULTILINE_PATTERN_BELONG, other
                    )));
                }
            };
            Some(MultilineConfig {
                pattern: pattern.to_string(),
                belong,
                matched: ctx.bool(MULTILINE_PATTERN_MATCHED, true)?,
                event_timeout_secs: ctx.u64(MULTILINE_EVENT_TIMEOUT_SECS, 0)?,
                max_bytes: ctx.usize(MULTILINE_MAX_BYTES, DEFAULT_MULTILINE_MAX_BYTES)?,
                max_lines: ctx.usize(MULTILINE_MAX_LINES, DEFAULT_MULTILINE_MAX_LINES)?,
            })
        } else {
            None
        };

        Ok(Self {
            position_file: PathBuf::from(position_file),
            groups,
            file_header: ctx.bool(FILENAME_HEADER, false)?,
            file_header_key: ctx
                .string(FILENAME_HEADER_KEY)
                .unwrap_or(DEFAULT_FILENAME_HEADER_KEY)
                .to_string(),
            byte_offset_header: ctx.bool(BYTE_OFFSET_HEADER, false)?,
            batch_size: ctx.usize(BATCH_SIZE, DEFAULT_BATCH_SIZE)?,
            backoff_without_nl: ctx.bool(BACKOFF_WITHOUT_NL, false)?,
            idle_timeout_secs: ctx.u64(IDLE_TIMEOUT, DEFAULT_IDLE_TIMEOUT_SECS)?,
            write_pos_interval_secs: ctx.u64(WRITE_POS_INTERVAL, DEFAULT_WRITE_POS_INTERVAL_SECS)?,
            skip_to_end: ctx.bool(SKIP_TO_END, false)?,
            max_open_files: ctx.usize(MAX_OPEN_FILES, DEFAULT_MAX_OPEN_FILES)?,
            cache_pattern_matching: ctx.bool(CACHE_PATTERN_MATCHING, true)?,
            multiline,
        })
    }
}
