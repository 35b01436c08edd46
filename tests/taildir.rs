// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for the taildir source against an in-memory channel:
//! group pattern filtering, wildcard directory matching, header overlays,
//! consumption ordering, directory-cache recency, restart-from-position, and
//! transaction rollback.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use tempfile::TempDir;

use taildir::channel::Transaction;
use taildir::config::{self, Context, BYTE_OFFSET_HEADER_KEY};
use taildir::{Channel, MemoryChannel, Record, Status, TaildirSource};

fn write_file(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn append_file(path: &Path, content: &str) {
    use std::io::Write;
    let mut f = fs::OpenOptions::new().append(true).open(path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    f.flush().unwrap();
}

/// Position file lives outside the tailed directory so wide patterns cannot
/// pick it up.
fn position_path(dir: &TempDir) -> PathBuf {
    let pos_dir = dir.path().join("positions");
    fs::create_dir_all(&pos_dir).unwrap();
    pos_dir.join("taildir_position.json")
}

fn make_context(pos_file: &Path, groups: &[(&str, String)]) -> Context {
    let mut ctx = Context::new();
    ctx.put(config::POSITION_FILE, pos_file.display().to_string());
    ctx.put(
        config::FILE_GROUPS,
        groups
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(" "),
    );
    for (name, pattern) in groups {
        ctx.put(format!("filegroups.{}", name), pattern.clone());
    }
    ctx
}

fn started_source(ctx: &Context) -> TaildirSource<MemoryChannel> {
    let mut source = TaildirSource::new(MemoryChannel::new());
    source.configure(ctx).unwrap();
    source.start().unwrap();
    source
}

fn drain_bodies(channel: &MemoryChannel) -> Vec<String> {
    channel.drain().iter().map(Record::body_string).collect()
}

#[test]
fn test_group_pattern_filtering() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    for name in ["a.log", "a.log.1", "b.log", "c.log.2024-03-01", "c.log.2024-03-02"] {
        write_file(&logs.join(name), &format!("{}\n", name));
    }

    let ctx = make_context(
        &position_path(&dir),
        &[
            ("ab", format!("{}/[ab].log", logs.display())),
            ("c", format!("{}/c.log.*", logs.display())),
        ],
    );
    let mut source = started_source(&ctx);
    assert_eq!(source.process().unwrap(), Status::Ready);

    let bodies = drain_bodies(source.channel());
    assert_eq!(bodies.len(), 4);
    assert!(bodies.contains(&"a.log".to_string()));
    assert!(!bodies.contains(&"a.log.1".to_string()));
    assert!(bodies.contains(&"b.log".to_string()));
    assert!(bodies.contains(&"c.log.2024-03-01".to_string()));
    assert!(bodies.contains(&"c.log.2024-03-02".to_string()));

    source.stop().unwrap();
}

#[test]
fn test_wildcard_directory_filtering() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("logs");
    let corpus = [
        ("fg1/dir1/subdir/file1.txt", "file1"),
        ("fg1/dir2/subdir/file2.txt", "file2"),
        ("fg1/dir3/file3.txt", "file3"),
        ("fg2/dir4/file4.txt", "file4"),
        ("fg2/dir5/file5.txt", "file5"),
        ("fg2/dir66/file66.txt", "file66"),
        ("fg3/dir7/file7.txt", "file7"),
        ("fg3/dir8/file8.txt", "file8"),
        ("fg3/dir9/file9.txt", "file9"),
        ("fg4/dir10/file10.txt", "file10"),
        ("fg4/dir11/file11.txt", "file11"),
        ("fg4/dir12/file12.txt", "file12"),
        ("fg5/dir13/file13.txt", "file13"),
        ("fg5/dir14/file14.txt", "file14"),
        ("fg5/dir15/subdir15/file15.txt", "file15"),
    ];
    for (rel, body) in corpus {
        write_file(&root.join(rel), &format!("{}\n", body));
    }

    let ctx = make_context(
        &position_path(&dir),
        &[
            ("fg1", format!("{}/fg1/*/subdir/file.*", root.display())),
            ("fg2", format!("{}/fg2/dir?/file.*", root.display())),
            ("fg3", format!("{}/fg3/dir[78]/file.*", root.display())),
            ("fg4", format!("{}/fg4/dir{{10,12}}/file.*", root.display())),
            ("fg5", format!("{}/fg5/**/file.*", root.display())),
        ],
    );
    let mut source = started_source(&ctx);
    assert_eq!(source.process().unwrap(), Status::Ready);

    let bodies = drain_bodies(source.channel());
    assert_eq!(bodies.len(), 11);
    for expected in [
        "file1", "file2", "file4", "file5", "file7", "file8", "file10", "file12", "file13",
        "file14", "file15",
    ] {
        assert!(bodies.contains(&expected.to_string()), "missing {}", expected);
    }
    for excluded in ["file3", "file66", "file9", "file11"] {
        assert!(!bodies.contains(&excluded.to_string()), "unexpected {}", excluded);
    }

    source.stop().unwrap();
}

#[test]
fn test_group_header_mapping() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    write_file(&logs.join("file1"), "file1line1\nfile1line2\n");
    write_file(&logs.join("file2"), "file2line1\nfile2line2\n");
    write_file(&logs.join("file3"), "file3line1\nfile3line2\n");

    let mut ctx = make_context(
        &position_path(&dir),
        &[
            ("f1", format!("{}/file1$", logs.display())),
            ("f2", format!("{}/file2$", logs.display())),
            ("f3", format!("{}/file3$", logs.display())),
        ],
    );
    ctx.put("headers.f1.headerKeyTest", "value1");
    ctx.put("headers.f2.headerKeyTest", "value2");
    ctx.put("headers.f2.headerKeyTest2", "value2-2");

    let mut source = started_source(&ctx);
    source.process().unwrap();

    let records = source.channel().drain();
    assert_eq!(records.len(), 6);
    for record in records {
        let body = record.body_string();
        let value = record.headers().get("headerKeyTest");
        let value2 = record.headers().get("headerKeyTest2");
        if body.starts_with("file1") {
            assert_eq!(value.unwrap(), "value1");
            assert!(value2.is_none());
        } else if body.starts_with("file2") {
            assert_eq!(value.unwrap(), "value2");
            assert_eq!(value2.unwrap(), "value2-2");
        } else {
            assert!(value.is_none());
            assert!(value2.is_none());
        }
    }

    source.stop().unwrap();
}

#[test]
fn test_file_consume_order_by_mtime() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");

    let file1 = logs.join("file1");
    write_file(&file1, "file1line1\nfile1line2\nfile1line3\n");
    sleep(Duration::from_millis(1100));

    let file2 = logs.join("file2");
    write_file(&file2, "file2line1\nfile2line2\nfile2line3\n");
    sleep(Duration::from_millis(1100));

    let file3 = logs.join("file3");
    write_file(&file3, "file3line1\nfile3line2\nfile3line3\n");
    sleep(Duration::from_millis(1100));

    let file4 = logs.join("file4");
    write_file(&file4, "file4line1\nfile4line2\nfile4line3\n");
    sleep(Duration::from_millis(1100));

    // Rewriting file3 makes it the most recently modified, so it drains last.
    write_file(&file3, "file3line1\nfile3line2\nfile3line3\n");

    let ctx = make_context(&position_path(&dir), &[("g1", format!("{}/.*", logs.display()))]);
    let mut source = started_source(&ctx);
    source.process().unwrap();

    let bodies = drain_bodies(source.channel());
    let expected: Vec<String> = [
        "file1line1", "file1line2", "file1line3",
        "file2line1", "file2line2", "file2line3",
        "file4line1", "file4line2", "file4line3",
        "file3line1", "file3line2", "file3line3",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    assert_eq!(bodies, expected, "files not consumed in mtime order");

    source.stop().unwrap();
}

#[test]
fn test_path_header() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    let file1 = logs.join("file1");
    write_file(&file1, "f1\n");

    let mut ctx = make_context(&position_path(&dir), &[("fg", format!("{}/file.*", logs.display()))]);
    ctx.put(config::FILENAME_HEADER, "true");
    ctx.put(config::FILENAME_HEADER_KEY, "path");

    let mut source = started_source(&ctx);
    source.process().unwrap();

    let record = source.channel().take().unwrap();
    assert_eq!(
        record.headers().get("path").unwrap(),
        &file1.display().to_string()
    );

    source.stop().unwrap();
}

#[test]
fn test_directory_cache_surfaces_late_files() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    write_file(&logs.join("fg1/dir1/file1.txt"), "file1\n");

    let ctx = make_context(
        &position_path(&dir),
        &[("fg1", format!("{}/fg1/*/file.*", logs.display()))],
    );
    let mut source = started_source(&ctx);
    assert_eq!(source.process().unwrap(), Status::Ready);

    // Empty cycles while time passes, all served from the directory cache.
    sleep(Duration::from_millis(1100));
    assert_eq!(source.process().unwrap(), Status::Backoff);
    sleep(Duration::from_millis(1100));

    write_file(&logs.join("fg1/dir1/file2.txt"), "file2\n");
    assert_eq!(source.process().unwrap(), Status::Ready);

    let bodies = drain_bodies(source.channel());
    assert_eq!(bodies.len(), 2);
    assert!(bodies.contains(&"file1".to_string()));
    assert!(bodies.contains(&"file2".to_string()));

    source.stop().unwrap();
}

#[test]
fn test_restart_resumes_from_position_file() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    let file = logs.join("app.log");
    write_file(&file, "one\ntwo\n");

    let pos_file = position_path(&dir);
    let ctx = make_context(&pos_file, &[("g", format!("{}/app\\.log", logs.display()))]);

    let mut source = started_source(&ctx);
    source.process().unwrap();
    assert_eq!(drain_bodies(source.channel()), vec!["one", "two"]);
    source.stop().unwrap();
    assert!(pos_file.exists());

    append_file(&file, "three\n");

    // A fresh source with the same position file re-emits nothing already
    // committed.
    let mut source = started_source(&ctx);
    assert_eq!(source.process().unwrap(), Status::Ready);
    assert_eq!(drain_bodies(source.channel()), vec!["three"]);
    source.stop().unwrap();
}

#[test]
fn test_rollback_rereads_batch() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    let file = logs.join("app.log");
    write_file(&file, "one\ntwo\n");

    let ctx = make_context(
        &position_path(&dir),
        &[("g", format!("{}/app\\.log", logs.display()))],
    );

    // Capacity 2 with one slot pre-filled: the first commit overflows.
    let channel = MemoryChannel::with_capacity(2);
    let mut txn = channel.transaction();
    txn.begin();
    txn.put(Record::with_body(b"occupied".to_vec())).unwrap();
    txn.commit().unwrap();
    txn.close();

    let mut source = TaildirSource::new(channel.clone());
    source.configure(&ctx).unwrap();
    source.start().unwrap();

    assert_eq!(source.process().unwrap(), Status::Backoff);
    assert_eq!(drain_bodies(&channel), vec!["occupied"]);

    // With room available the same bytes are re-read and delivered.
    assert_eq!(source.process().unwrap(), Status::Ready);
    assert_eq!(drain_bodies(&channel), vec!["one", "two"]);

    source.stop().unwrap();
}

#[test]
fn test_appended_lines_across_cycles() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    let file = logs.join("app.log");
    write_file(&file, "one\n");

    let ctx = make_context(
        &position_path(&dir),
        &[("g", format!("{}/app\\.log", logs.display()))],
    );
    let mut source = started_source(&ctx);

    assert_eq!(source.process().unwrap(), Status::Ready);
    assert_eq!(drain_bodies(source.channel()), vec!["one"]);

    append_file(&file, "two\nthree\n");
    assert_eq!(source.process().unwrap(), Status::Ready);
    assert_eq!(drain_bodies(source.channel()), vec!["two", "three"]);

    assert_eq!(source.process().unwrap(), Status::Backoff);
    source.stop().unwrap();
}

#[test]
fn test_truncation_restarts_from_beginning() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    let file = logs.join("app.log");
    write_file(&file, "a long first line\nand a second\n");

    let ctx = make_context(
        &position_path(&dir),
        &[("g", format!("{}/app\\.log", logs.display()))],
    );
    let mut source = started_source(&ctx);
    source.process().unwrap();
    source.channel().drain();

    // Shrink the file below the committed offset.
    write_file(&file, "fresh\n");
    assert_eq!(source.process().unwrap(), Status::Ready);
    assert_eq!(drain_bodies(source.channel()), vec!["fresh"]);

    source.stop().unwrap();
}

#[test]
fn test_byte_offset_header_end_to_end() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    write_file(&logs.join("app.log"), "abc\ndefgh\n");

    let mut ctx = make_context(
        &position_path(&dir),
        &[("g", format!("{}/app\\.log", logs.display()))],
    );
    ctx.put(config::BYTE_OFFSET_HEADER, "true");

    let mut source = started_source(&ctx);
    source.process().unwrap();

    let records = source.channel().drain();
    assert_eq!(records[0].headers().get(BYTE_OFFSET_HEADER_KEY).unwrap(), "0");
    assert_eq!(records[1].headers().get(BYTE_OFFSET_HEADER_KEY).unwrap(), "4");

    source.stop().unwrap();
}

#[test]
fn test_multiline_end_to_end_with_group_headers() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    write_file(
        &logs.join("app.log"),
        "ERROR boom\n  at alpha\n  at beta\nINFO recovered\n",
    );

    let mut ctx = make_context(
        &position_path(&dir),
        &[("g", format!("{}/app\\.log", logs.display()))],
    );
    ctx.put("headers.g.service", "payments");
    ctx.put(config::MULTILINE, "true");
    ctx.put(config::MULTILINE_PATTERN, r"^\s");

    let mut source = started_source(&ctx);
    assert_eq!(source.process().unwrap(), Status::Ready);

    let records = source.channel().drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].body(), b"ERROR boom\n  at alpha\n  at beta\n");
    assert_eq!(records[0].headers().get("multiline").unwrap(), "true");
    assert_eq!(records[0].headers().get("service").unwrap(), "payments");
    assert!(records[0].headers().contains_key("timestamp"));

    source.stop().unwrap();
}

#[test]
fn test_lifecycle_restart_cycles() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    write_file(&logs.join("file1"), "file1line1\nfile1line2\n");

    let ctx = make_context(&position_path(&dir), &[("f1", format!("{}/file1$", logs.display()))]);
    let mut source = TaildirSource::new(MemoryChannel::new());
    source.configure(&ctx).unwrap();

    for _ in 0..3 {
        source.start().unwrap();
        source.process().unwrap();
        source.stop().unwrap();
    }

    // The two lines were committed exactly once across the restarts.
    assert_eq!(
        drain_bodies(source.channel()),
        vec!["file1line1", "file1line2"]
    );
}

#[test]
fn test_backoff_without_newline_end_to_end() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    let file = logs.join("app.log");
    write_file(&file, "complete\npartial");

    let mut ctx = make_context(
        &position_path(&dir),
        &[("g", format!("{}/app\\.log", logs.display()))],
    );
    ctx.put(config::BACKOFF_WITHOUT_NL, "true");

    let mut source = started_source(&ctx);
    source.process().unwrap();
    assert_eq!(drain_bodies(source.channel()), vec!["complete"]);

    append_file(&file, " now terminated\n");
    source.process().unwrap();
    assert_eq!(
        drain_bodies(source.channel()),
        vec!["partial now terminated"]
    );

    source.stop().unwrap();
}
