// SPDX-License-Identifier: Apache-2.0

//! Per-group path matching with a bounded directory cache.
//!
//! A file group pattern is matched against absolute paths in two layers:
//! directory components use wildcard semantics (`?`, `*`, `[abc]`,
//! `{alt1,alt2}` within one segment, `**` spanning whole segments), while the
//! final component is a regular expression matched against the entire file
//! name. Only regular files are reported.
//!
//! Every refresh stats each directory on the expansion path and reuses its
//! cached listing only when the directory's mtime has not advanced and is
//! comfortably older than the previous scan. A directory modified since (or
//! too close to) the last scan is re-listed, so a newly created file is never
//! hidden by the cache.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};

/// Filesystems may truncate mtimes to whole seconds; a cached listing whose
/// directory mtime falls inside this window of the scan instant is treated as
/// possibly stale and re-listed.
const MTIME_GRANULARITY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
enum DirComponent {
    /// Fixed segment, joined directly
    Literal(OsString),
    /// Wildcard segment, brace alternatives pre-expanded
    Wildcard(Vec<glob::Pattern>),
    /// `**`: this directory and every directory below it
    AnySegments,
}

#[derive(Debug)]
struct DirCacheEntry {
    mtime: SystemTime,
    last_scan: SystemTime,
    subdirs: Vec<PathBuf>,
    files: Vec<PathBuf>,
    visited: bool,
}

/// Resolves one file group's pattern to the current set of matching regular
/// files, caching per-directory listings between refreshes.
pub struct TaildirMatcher {
    group: String,
    pattern: String,
    base: PathBuf,
    components: Vec<DirComponent>,
    name_filter: Regex,
    cache_enabled: bool,
    cache: HashMap<PathBuf, DirCacheEntry>,
}

impl TaildirMatcher {
    pub fn new(group: impl Into<String>, pattern: &str, cache_enabled: bool) -> Result<Self> {
        let group = group.into();
        let path = Path::new(pattern);
        if !path.is_absolute() {
            return Err(Error::InvalidPattern(format!(
                "group '{}': pattern must be absolute: '{}'",
                group, pattern
            )));
        }

        let mut segments: Vec<OsString> = Vec::new();
        let mut base = PathBuf::new();
        for component in path.components() {
            match component {
                Component::RootDir | Component::Prefix(_) => {
                    base.push(component.as_os_str());
                }
                Component::Normal(seg) => segments.push(seg.to_os_string()),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(Error::InvalidPattern(format!(
                        "group '{}': pattern must not contain '..': '{}'",
                        group, pattern
                    )));
                }
            }
        }

        let name_segment = segments.pop().ok_or_else(|| {
            Error::InvalidPattern(format!(
                "group '{}': pattern names no file component: '{}'",
                group, pattern
            ))
        })?;
        let name_str = name_segment.to_str().ok_or_else(|| {
            Error::InvalidPattern(format!("group '{}': pattern is not UTF-8", group))
        })?;
        let name_filter = Regex::new(&format!("^(?:{})$", name_str)).map_err(|e| {
            Error::InvalidPattern(format!(
                "group '{}': bad file name pattern '{}': {}",
                group, name_str, e
            ))
        })?;

        let mut components = Vec::with_capacity(segments.len());
        for seg in &segments {
            let seg_str = seg.to_str().ok_or_else(|| {
                Error::InvalidPattern(format!("group '{}': pattern is not UTF-8", group))
            })?;
            if seg_str == "**" {
                components.push(DirComponent::AnySegments);
            } else if seg_str.contains(['*', '?', '[', '{']) {
                let mut patterns = Vec::new();
                for alt in expand_braces(seg_str) {
                    let p = glob::Pattern::new(&alt).map_err(|e| {
                        Error::InvalidPattern(format!(
                            "group '{}': bad segment '{}': {}",
                            group, seg_str, e
                        ))
                    })?;
                    patterns.push(p);
                }
                components.push(DirComponent::Wildcard(patterns));
            } else {
                components.push(DirComponent::Literal(seg.clone()));
            }
        }

        // Fold the leading literal run into the base so refreshes start as
        // deep as the pattern allows.
        while let Some(DirComponent::Literal(_)) = components.first() {
            if let DirComponent::Literal(seg) = components.remove(0) {
                base.push(seg);
            }
        }

        Ok(Self {
            group,
            pattern: pattern.to_string(),
            base,
            components,
            name_filter,
            cache_enabled,
            cache: HashMap::new(),
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The current set of matching regular files, absolute and sorted
    /// ascending by path.
    pub fn matching_files(&mut self) -> Vec<PathBuf> {
        for entry in self.cache.values_mut() {
            entry.visited = false;
        }

        let mut dirs = vec![self.base.clone()];
        for i in 0..self.components.len() {
            let mut next = Vec::new();
            match self.components[i].clone() {
                DirComponent::Literal(seg) => {
                    for dir in dirs {
                        next.push(dir.join(&seg));
                    }
                }
                DirComponent::Wildcard(patterns) => {
                    for dir in dirs {
                        for sub in self.subdirs(&dir) {
                            if let Some(name) = sub.file_name().and_then(|n| n.to_str()) {
                                if patterns.iter().any(|p| p.matches(name)) {
                                    next.push(sub);
                                }
                            }
                        }
                    }
                }
                DirComponent::AnySegments => {
                    for dir in dirs {
                        self.collect_recursive(&dir, &mut next);
                    }
                }
            }
            next.sort();
            next.dedup();
            dirs = next;
        }

        let mut files = Vec::new();
        for dir in dirs {
            for file in self.files_in(&dir) {
                if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
                    if self.name_filter.is_match(name) {
                        files.push(file);
                    }
                }
            }
        }
        files.sort();
        files.dedup();

        self.cache.retain(|_, entry| entry.visited);

        files
    }

    /// The directory itself plus every directory below it
    fn collect_recursive(&mut self, dir: &Path, out: &mut Vec<PathBuf>) {
        out.push(dir.to_path_buf());
        for sub in self.subdirs(dir) {
            self.collect_recursive(&sub, out);
        }
    }

    fn subdirs(&mut self, dir: &Path) -> Vec<PathBuf> {
        self.listing(dir).map(|(d, _)| d).unwrap_or_default()
    }

    fn files_in(&mut self, dir: &Path) -> Vec<PathBuf> {
        self.listing(dir).map(|(_, f)| f).unwrap_or_default()
    }

    /// The (subdirectories, regular files) of `dir`, from the cache when the
    /// directory provably has not changed since the last scan.
    fn listing(&mut self, dir: &Path) -> Option<(Vec<PathBuf>, Vec<PathBuf>)> {
        let mtime = match fs::metadata(dir) {
            Ok(meta) if meta.is_dir() => meta.modified().ok()?,
            Ok(_) => return None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(group = %self.group, dir = %dir.display(), error = %e, "Skipping unreadable directory");
                return None;
            }
        };

        if self.cache_enabled {
            if let Some(entry) = self.cache.get_mut(dir) {
                let settled = entry
                    .last_scan
                    .duration_since(mtime)
                    .map(|age| age >= MTIME_GRANULARITY)
                    .unwrap_or(false);
                if mtime <= entry.mtime && settled {
                    entry.visited = true;
                    return Some((entry.subdirs.clone(), entry.files.clone()));
                }
            }
        }

        let read = match fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) => {
                warn!(group = %self.group, dir = %dir.display(), error = %e, "Skipping unreadable directory");
                return None;
            }
        };

        let mut subdirs = Vec::new();
        let mut files = Vec::new();
        for dent in read.flatten() {
            let path = dent.path();
            let Ok(file_type) = dent.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                subdirs.push(path);
            } else if file_type.is_file() {
                files.push(path);
            } else if file_type.is_symlink() {
                // Symlinked regular files count; symlinked directories are
                // not followed.
                if fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false) {
                    files.push(path);
                }
            }
        }

        let result = (subdirs.clone(), files.clone());
        self.cache.insert(
            dir.to_path_buf(),
            DirCacheEntry {
                mtime,
                last_scan: SystemTime::now(),
                subdirs,
                files,
                visited: true,
            },
        );
        Some(result)
    }
}

/// Expand `{a,b}` alternation into plain segment globs, outermost first.
fn expand_braces(segment: &str) -> Vec<String> {
    let bytes = segment.as_bytes();
    let Some(open) = segment.find('{') else {
        return vec![segment.to_string()];
    };

    let mut depth = 0usize;
    let mut close = None;
    let mut splits = Vec::new();
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(i);
                    break;
                }
            }
            b',' if depth == 1 => splits.push(i),
            _ => {}
        }
    }
    // Unmatched brace: leave the segment as a literal glob character.
    let Some(close) = close else {
        return vec![segment.to_string()];
    };

    let prefix = &segment[..open];
    let suffix = &segment[close + 1..];
    let mut alts = Vec::new();
    let mut start = open + 1;
    for split in splits.iter().chain(std::iter::once(&close)) {
        alts.push(&segment[start..*split]);
        start = split + 1;
    }

    let mut out = Vec::new();
    for alt in alts {
        for expanded in expand_braces(&format!("{}{}{}", prefix, alt, suffix)) {
            out.push(expanded);
        }
    }
    out
}
