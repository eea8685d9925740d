use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rattler_extract::{ErrorKind, ExtractError, ExtractorBuilder};
use serial_test::serial;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn tar_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append(&header, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// A temporary extraction target.
struct Target {
    _dir: TempDir,
    root: PathBuf,
}

impl Target {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        Self { _dir: dir, root }
    }

    fn read(&self, path: &str) -> String {
        fs_err::read_to_string(self.root.join(path)).unwrap()
    }

    fn exists(&self, path: &str) -> bool {
        self.root.join(path).exists()
    }

    fn is_empty(&self) -> bool {
        fs_err::read_dir(&self.root).unwrap().next().is_none()
    }
}

/// Yields `prefix`, then blocks until the sender is dropped.
struct StallingReader {
    prefix: io::Cursor<Vec<u8>>,
    release: std::sync::mpsc::Receiver<()>,
}

impl Read for StallingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.prefix.read(buf)?;
        if n > 0 {
            return Ok(n);
        }
        let _ = self.release.recv();
        Ok(0)
    }
}

/// Yields `prefix`, then fails like a dropped connection.
struct FailingReader {
    prefix: io::Cursor<Vec<u8>>,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.prefix.read(buf)?;
        if n > 0 {
            return Ok(n);
        }
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"))
    }
}

#[tokio::test]
#[serial]
async fn extract_tar_gz_file() {
    let before = std::env::current_dir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let archive = scratch.path().join("archive.tar.gz");
    fs_err::write(
        &archive,
        gzip(&tar_archive(&[
            ("pkg/info/index.json", b"{}"),
            ("pkg/lib/libfoo.so", b"\x7fELF"),
        ])),
    )
    .unwrap();
    let target = Target::new();

    let summary = ExtractorBuilder::new()
        .with_archive_path(&archive)
        .with_chdir(&target.root)
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.warnings, 0);
    assert_eq!(target.read("pkg/info/index.json"), "{}");
    assert_eq!(target.read("pkg/lib/libfoo.so"), "\x7fELF");
    assert_eq!(std::env::current_dir().unwrap(), before);
}

#[tokio::test]
#[serial]
async fn extract_zstd_stream() {
    let compressed = zstd::encode_all(&tar_archive(&[("hello.txt", b"hello")])[..], 0).unwrap();
    let target = Target::new();

    let summary = ExtractorBuilder::new()
        .with_reader(io::Cursor::new(compressed))
        .with_chdir(&target.root)
        .with_chunk_size(512)
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.extracted, 1);
    assert_eq!(target.read("hello.txt"), "hello");
}

#[tokio::test]
#[serial]
async fn extract_zip_stream() {
    let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer.start_file("docs/readme.md", options).unwrap();
    writer.write_all(b"# readme").unwrap();
    writer.start_file("src/main.rs", options).unwrap();
    writer.write_all(b"fn main() {}").unwrap();
    let bytes = writer.finish().unwrap().into_inner();
    let target = Target::new();

    let summary = ExtractorBuilder::new()
        .with_reader(io::Cursor::new(bytes))
        .with_chdir(&target.root)
        .with_pattern("docs")
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.extracted, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(target.read("docs/readme.md"), "# readme");
    assert!(!target.exists("src"));
}

#[tokio::test]
#[serial]
async fn fast_read_stops_once_patterns_are_satisfied() {
    let archive = tar_archive(&[("a.raw", b"a"), ("b.raw", b"b"), ("c.txt", b"c")]);
    let target = Target::new();

    let summary = ExtractorBuilder::new()
        .with_reader(io::Cursor::new(archive))
        .with_chdir(&target.root)
        .with_patterns(["a.raw", "b.raw"])
        .with_fast_read(true)
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.stopped_early);
    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.skipped, 0);
    assert!(target.exists("a.raw"));
    assert!(target.exists("b.raw"));
    assert!(!target.exists("c.txt"));
}

#[tokio::test]
#[serial]
async fn unmatched_patterns_are_reported() {
    let archive = tar_archive(&[("a.raw", b"a")]);
    let target = Target::new();

    let summary = ExtractorBuilder::new()
        .with_reader(io::Cursor::new(archive))
        .with_chdir(&target.root)
        .with_patterns(["a.raw", "missing.txt"])
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.unmatched_patterns, vec!["missing.txt"]);
}

#[tokio::test]
#[serial]
async fn missing_archive_is_an_io_error() {
    let before = std::env::current_dir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let target = Target::new();

    let err = ExtractorBuilder::new()
        .with_archive_path(scratch.path().join("missing.tar"))
        .with_chdir(&target.root)
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(matches!(err, ExtractError::OpenSource { .. }));
    assert!(target.is_empty());
    assert_eq!(std::env::current_dir().unwrap(), before);
}

#[tokio::test]
#[serial]
async fn unrecognized_data_fails_to_open() {
    let before = std::env::current_dir().unwrap();
    let target = Target::new();

    let err = ExtractorBuilder::new()
        .with_reader(io::Cursor::new(b"this is not an archive at all".repeat(40)))
        .with_chdir(&target.root)
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DecodeFatal);
    assert!(target.is_empty());
    assert_eq!(std::env::current_dir().unwrap(), before);
}

#[tokio::test]
#[serial]
async fn truncated_archive_keeps_extracted_entries() {
    let mut archive = tar_archive(&[("first.txt", b"first"), ("second.bin", &[1u8; 8192])]);
    // Cut into the data of the second entry.
    archive.truncate(512 * 4);
    let target = Target::new();

    let err = ExtractorBuilder::new()
        .with_reader(io::Cursor::new(archive))
        .with_chdir(&target.root)
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap_err();

    // The short entry is dropped, the broken stream fails the next header read.
    assert_eq!(err.kind(), ErrorKind::DecodeFatal);
    assert_eq!(target.read("first.txt"), "first");
    assert!(!target.exists("second.bin"));
}

#[tokio::test]
#[serial]
async fn corrupt_entry_is_skipped_with_a_warning() {
    let files: [(&str, &[u8]); 3] = [
        ("one.txt", b"first payload"),
        ("two.txt", b"second payload"),
        ("three.txt", b"third payload"),
    ];
    let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
    let options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in files {
        writer.start_file(name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    let mut bytes = writer.finish().unwrap().into_inner();
    let offset = bytes
        .windows(files[1].1.len())
        .position(|w| w == files[1].1)
        .unwrap();
    bytes[offset] ^= 0xff;
    let target = Target::new();

    let summary = ExtractorBuilder::new()
        .with_reader(io::Cursor::new(bytes))
        .with_chdir(&target.root)
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.warnings, 1);
    assert_eq!(target.read("one.txt"), "first payload");
    assert!(!target.exists("two.txt"));
    assert_eq!(target.read("three.txt"), "third payload");
}

#[tokio::test]
#[serial]
async fn source_failing_before_any_data_is_an_io_error() {
    let before = std::env::current_dir().unwrap();
    let target = Target::new();

    let err = ExtractorBuilder::new()
        .with_reader(FailingReader {
            prefix: io::Cursor::new(Vec::new()),
        })
        .with_chdir(&target.root)
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(matches!(err, ExtractError::ReadSource(_)));
    assert!(target.is_empty());
    assert_eq!(std::env::current_dir().unwrap(), before);
}

#[tokio::test]
#[serial]
async fn source_failing_between_entries_is_an_io_error() {
    // One complete entry without the end-of-archive blocks.
    let mut prefix = tar_archive(&[("early.txt", b"early")]);
    prefix.truncate(1024);
    let target = Target::new();

    let err = ExtractorBuilder::new()
        .with_reader(FailingReader {
            prefix: io::Cursor::new(prefix),
        })
        .with_chdir(&target.root)
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        ExtractError::ReadSource(source) => {
            assert_eq!(source.kind(), io::ErrorKind::ConnectionReset)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(target.read("early.txt"), "early");
}

#[tokio::test]
#[serial]
async fn fast_read_returns_while_the_source_is_stalled() {
    let target = Target::new();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let reader = StallingReader {
        prefix: io::Cursor::new(tar_archive(&[("a.raw", b"a"), ("b.raw", b"b")])),
        release: release_rx,
    };

    let run = ExtractorBuilder::new()
        .with_reader(reader)
        .with_chdir(&target.root)
        .with_pattern("a.raw")
        .with_fast_read(true)
        .build()
        .extract(CancellationToken::new());

    let summary = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run waited for the stalled source")
        .unwrap();
    assert!(summary.stopped_early);
    assert_eq!(summary.extracted, 1);
    assert_eq!(target.read("a.raw"), "a");
    assert!(!target.exists("b.raw"));

    drop(release_tx);
}

#[test]
#[serial]
fn cancelled_run_does_not_hold_up_runtime_shutdown() {
    let target = Target::new();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let reader = StallingReader {
        prefix: io::Cursor::new(Vec::new()),
        release: release_rx,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    let result = runtime.block_on(async {
        let run = tokio::spawn(
            ExtractorBuilder::new()
                .with_reader(reader)
                .with_chdir(&target.root)
                .build()
                .extract(cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        run.await.unwrap()
    });
    assert!(result.unwrap_err().is_cancelled());

    // The source is still stalled while the runtime shuts down.
    let (dropped_tx, dropped_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        drop(runtime);
        let _ = dropped_tx.send(());
    });
    assert!(
        dropped_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
        "runtime shutdown waited for the stalled source"
    );

    drop(release_tx);
}

#[tokio::test]
#[serial]
async fn cancel_before_run_extracts_nothing() {
    let before = std::env::current_dir().unwrap();
    let target = Target::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = ExtractorBuilder::new()
        .with_reader(io::Cursor::new(tar_archive(&[("a.txt", b"a")])))
        .with_chdir(&target.root)
        .build()
        .extract(cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(target.is_empty());
    assert_eq!(std::env::current_dir().unwrap(), before);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn cancel_unblocks_a_stalled_decoder() {
    let before = std::env::current_dir().unwrap();
    let target = Target::new();

    // A complete first entry, then the source stops producing data.
    let mut prefix = tar_archive(&[("early.txt", b"early")]);
    prefix.truncate(1024);
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let reader = StallingReader {
        prefix: io::Cursor::new(prefix),
        release: release_rx,
    };

    let cancel = CancellationToken::new();
    let run = tokio::spawn(
        ExtractorBuilder::new()
            .with_reader(reader)
            .with_chdir(&target.root)
            .build()
            .extract(cancel.clone()),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("cancellation did not unblock the run")
        .unwrap();
    assert!(result.unwrap_err().is_cancelled());
    assert!(!target.exists("late.txt"));
    assert_eq!(std::env::current_dir().unwrap(), before);

    drop(release_tx);
}

#[tokio::test]
#[serial]
async fn hostile_entries_are_skipped_with_warnings() {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    builder
        .append_link(&mut header, "escape", "../../etc")
        .unwrap();

    let mut header = tar::Header::new_gnu();
    header.set_size(4);
    // `set_path` refuses `..`, so the name is written directly.
    header.as_old_mut().name[..13].copy_from_slice(b"../outside.tx");
    header.set_cksum();
    builder.append(&header, &b"evil"[..]).unwrap();

    let mut header = tar::Header::new_gnu();
    header.set_path("safe.txt").unwrap();
    header.set_size(4);
    header.set_cksum();
    builder.append(&header, &b"safe"[..]).unwrap();

    let target = Target::new();
    let summary = ExtractorBuilder::new()
        .with_reader(io::Cursor::new(builder.into_inner().unwrap()))
        .with_chdir(&target.root)
        .build()
        .extract(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.extracted, 1);
    assert_eq!(summary.warnings, 2);
    assert_eq!(target.read("safe.txt"), "safe");
    assert!(std::fs::symlink_metadata(target.root.join("escape")).is_err());
    assert!(!target.root.parent().unwrap().join("outside.tx").exists());
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn sparse_extraction_preserves_content_and_saves_space() {
    use std::os::unix::fs::MetadataExt;

    let mut content = vec![0u8; 8 * 1024 * 1024];
    content[..4].copy_from_slice(b"head");
    let tail = content.len() - 4;
    content[tail..].copy_from_slice(b"tail");
    let archive = tar_archive(&[("disk.img", &content)]);

    async fn extract(archive: &[u8], sparse: bool) -> Target {
        let target = Target::new();
        ExtractorBuilder::new()
            .with_reader(io::Cursor::new(archive.to_vec()))
            .with_chdir(&target.root)
            .with_sparse(sparse)
            .build()
            .extract(CancellationToken::new())
            .await
            .unwrap();
        target
    }

    let dense = extract(&archive, false).await;
    let sparse = extract(&archive, true).await;

    let path = Path::new("disk.img");
    let dense_bytes = fs_err::read(dense.root.join(path)).unwrap();
    let sparse_bytes = fs_err::read(sparse.root.join(path)).unwrap();
    assert_eq!(dense_bytes, content);
    assert_eq!(sparse_bytes, content);

    let dense_blocks = std::fs::metadata(dense.root.join(path)).unwrap().blocks();
    let sparse_blocks = std::fs::metadata(sparse.root.join(path)).unwrap().blocks();
    assert!(
        sparse_blocks < dense_blocks,
        "sparse: {sparse_blocks} blocks, dense: {dense_blocks} blocks"
    );
}

#[test]
fn version_details_mentions_filters() {
    let details = rattler_extract::version_details();
    assert!(details.starts_with("rattler_extract "));
    assert!(details.contains("gzip"));
    assert!(details.contains("xz"));
}
