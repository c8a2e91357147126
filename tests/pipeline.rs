use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use zipstream::zip::{locate_entry, write_central_header, write_end_of_central_directory};
use zipstream::{
    ArchiveEntry, CompressionMethod, DeliveryMode, Error, JobConfig, MemoryReader, RangeStream,
    ReadAt, RemoteArchive, Result, StreamDownloader,
};

/// How the instrumented reader misbehaves for one entry
#[derive(Clone, Copy)]
enum Fault {
    /// Cut the stream after half of the range, `times` times
    DropConnection { offset: u64, times: u32 },
    /// Report that the remote object changed
    ContentChanged { offset: u64 },
    /// Serve half of the range, then never complete
    Stall { offset: u64 },
}

impl Fault {
    fn offset(&self) -> u64 {
        match *self {
            Fault::DropConnection { offset, .. }
            | Fault::ContentChanged { offset }
            | Fault::Stall { offset } => offset,
        }
    }
}

/// In-memory source that records every range it serves.
struct InstrumentedReader {
    inner: MemoryReader,
    ranges: Mutex<Vec<(u64, u64)>>,
    faults: Vec<Fault>,
    faults_raised: AtomicU32,
    delay: Option<Duration>,
}

impl InstrumentedReader {
    fn new(data: Vec<u8>) -> Self {
        Self {
            inner: MemoryReader::new(data).with_validator("\"v1\""),
            ranges: Mutex::new(Vec::new()),
            faults: Vec::new(),
            faults_raised: AtomicU32::new(0),
            delay: None,
        }
    }

    fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    fn with_validator(mut self, validator: &str) -> Self {
        self.inner = self.inner.with_validator(validator);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn reads(&self) -> usize {
        self.ranges.lock().unwrap().len()
    }

    fn reset(&self) {
        self.ranges.lock().unwrap().clear();
    }

    fn served(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().unwrap().clone()
    }

    /// Returns true if any served range touched `[start, end)`.
    fn touched(&self, start: u64, end: u64) -> bool {
        self.ranges
            .lock()
            .unwrap()
            .iter()
            .any(|&(s, e)| s < end && start < e)
    }

    async fn record(&self, start: u64, end: u64) {
        self.ranges.lock().unwrap().push((start, end));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// The first half of `[start, end)`
    async fn head(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut head = Vec::new();
        self.inner
            .open_range(start, start + (end - start) / 2)
            .await?
            .read_to_end(&mut head)
            .await?;
        Ok(head)
    }
}

/// A stream whose reads never complete
struct Stalled;

impl AsyncRead for Stalled {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}

/// A stream that fails on the first read
struct Broken;

impl AsyncRead for Broken {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }
}

#[async_trait]
impl ReadAt for InstrumentedReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.record(offset, offset + buf.len() as u64).await;
        self.inner.read_at(offset, buf).await
    }

    async fn open_range(&self, start: u64, end: u64) -> Result<RangeStream> {
        self.record(start, end).await;
        let fault = self.faults.iter().copied().find(|f| f.offset() == start);
        match fault {
            Some(Fault::DropConnection { times, .. })
                if self.faults_raised.load(Ordering::SeqCst) < times =>
            {
                self.faults_raised.fetch_add(1, Ordering::SeqCst);
                let head = self.head(start, end).await?;
                Ok(Box::new(Cursor::new(head).chain(Broken)))
            }
            Some(Fault::ContentChanged { .. }) => {
                self.faults_raised.fetch_add(1, Ordering::SeqCst);
                Err(Error::RemoteContentChanged)
            }
            Some(Fault::Stall { .. }) => {
                self.faults_raised.fetch_add(1, Ordering::SeqCst);
                let head = self.head(start, end).await?;
                Ok(Box::new(Cursor::new(head).chain(Stalled)))
            }
            _ => self.inner.open_range(start, end).await,
        }
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn validator(&self) -> Option<String> {
        self.inner.validator()
    }
}

fn content(index: usize) -> Vec<u8> {
    format!("entry {index} ")
        .into_bytes()
        .into_iter()
        .cycle()
        .take(200 + index * 997)
        .collect()
}

fn file_name(index: usize) -> String {
    format!("data/file_{index:02}.bin")
}

/// An archive of `count` files cycling through Stored, Deflate and BZip2.
fn build_archive(count: usize) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let dir_options = zip::write::FileOptions::default();
    writer.add_directory("data/", dir_options).unwrap();
    for i in 0..count {
        let method = match i % 3 {
            0 => zip::CompressionMethod::Stored,
            1 => zip::CompressionMethod::Deflated,
            _ => zip::CompressionMethod::Bzip2,
        };
        let options = zip::write::FileOptions::default().compression_method(method);
        writer.start_file(file_name(i), options).unwrap();
        writer.write_all(&content(i)).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

async fn list_entries(data: &[u8]) -> Vec<ArchiveEntry> {
    RemoteArchive::new(Arc::new(MemoryReader::new(data.to_vec())))
        .list_files()
        .await
        .unwrap()
}

/// Byte span of the local record of `name`: up to the next local header
/// or the central directory.
async fn record_span(data: &[u8], name: &str) -> (u64, u64) {
    let entries = list_entries(data).await;
    let mut offsets: Vec<u64> = entries.iter().map(|e| e.offset).collect();
    offsets.sort_unstable();
    let start = entries.iter().find(|e| e.name == name).unwrap().offset;
    let end = offsets
        .into_iter()
        .find(|&o| o > start)
        .unwrap_or(data.len() as u64);
    (start, end)
}

/// Absolute offset of the first payload byte of `entry`
fn payload_offset(data: &[u8], entry: &ArchiveEntry) -> u64 {
    let at = entry.offset as usize;
    let name_len = u16::from_le_bytes([data[at + 26], data[at + 27]]) as u64;
    let extra_len = u16::from_le_bytes([data[at + 28], data[at + 29]]) as u64;
    entry.offset + 30 + name_len + extra_len
}

fn config(dir: &Path, workers: usize) -> JobConfig {
    let mut config = JobConfig::new(dir.join("out"), dir.join("staging"));
    config.verify_workers = workers;
    config.download_workers = workers;
    config.extract_workers = workers;
    config.retry.delay = Duration::from_millis(10);
    config
}

/// Every regular file under `root`, relative path to contents
fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let relative = path.strip_prefix(root).unwrap();
                let key = relative.to_string_lossy().replace('\\', "/");
                out.insert(key, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

fn expected_files(count: usize) -> BTreeMap<String, Vec<u8>> {
    (0..count).map(|i| (file_name(i), content(i))).collect()
}

async fn run_job(reader: Arc<InstrumentedReader>, config: JobConfig) -> Result<zipstream::JobResult> {
    StreamDownloader::new(reader, "fixture.zip", config)?
        .run(CancellationToken::new())
        .await
}

#[tokio::test]
async fn test_scenario_a_existing_files_are_not_downloaded() {
    let dir = tempfile::tempdir().unwrap();
    let data = build_archive(10);
    let out = dir.path().join("out/data");
    std::fs::create_dir_all(&out).unwrap();
    for i in [1, 4, 7] {
        std::fs::write(out.join(format!("file_{i:02}.bin")), content(i)).unwrap();
    }

    let reader = Arc::new(InstrumentedReader::new(data.clone()));
    let result = run_job(reader.clone(), config(dir.path(), 3)).await.unwrap();

    assert!(result.is_success(), "{:?}", result.failures);
    assert_eq!(result.skipped, 3);
    assert_eq!(result.committed, 7);
    for i in 0..10 {
        let (start, end) = record_span(&data, &file_name(i)).await;
        let existing = [1, 4, 7].contains(&i);
        assert_eq!(reader.touched(start, end), !existing, "entry {i}");
    }
    assert_eq!(snapshot(&dir.path().join("out")), expected_files(10));
}

#[tokio::test]
async fn test_scenario_b_wrong_length_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let data = build_archive(4);
    let out = dir.path().join("out/data");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("file_02.bin"), b"stale").unwrap();

    let reader = Arc::new(InstrumentedReader::new(data.clone()));
    let result = run_job(reader.clone(), config(dir.path(), 2)).await.unwrap();

    assert!(result.is_success(), "{:?}", result.failures);
    assert_eq!(result.skipped, 0);
    assert_eq!(result.committed, 4);
    let (start, end) = record_span(&data, &file_name(2)).await;
    assert!(reader.touched(start, end));
    assert_eq!(std::fs::read(out.join("file_02.bin")).unwrap(), content(2));
}

#[tokio::test]
async fn test_same_length_wrong_content_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let data = build_archive(3);
    let out = dir.path().join("out/data");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("file_01.bin"), vec![b'?'; content(1).len()]).unwrap();

    let reader = Arc::new(InstrumentedReader::new(data));
    let result = run_job(reader, config(dir.path(), 2)).await.unwrap();

    assert!(result.is_success(), "{:?}", result.failures);
    assert_eq!(std::fs::read(out.join("file_01.bin")).unwrap(), content(1));
}

#[tokio::test]
async fn test_scenario_c_transient_failure_is_retried() {
    for delivery in [DeliveryMode::CompressedFile, DeliveryMode::Streaming] {
        let dir = tempfile::tempdir().unwrap();
        let data = build_archive(6);
        let entries = list_entries(&data).await;
        // file_03 is stored, so the cut surfaces as the raw I/O error
        let target = entries.iter().find(|e| e.name == file_name(3)).unwrap();

        // Sidecar fetches open the range at the local header, streams at the payload
        let offset = match delivery {
            DeliveryMode::CompressedFile => target.offset,
            DeliveryMode::Streaming => payload_offset(&data, target),
        };
        let reader = Arc::new(
            InstrumentedReader::new(data).with_fault(Fault::DropConnection { offset, times: 1 }),
        );
        let mut config = config(dir.path(), 2);
        config.delivery = delivery;
        config.retry.max_attempts = 3;

        let result = run_job(reader.clone(), config).await.unwrap();
        assert!(result.is_success(), "{delivery:?}: {:?}", result.failures);
        assert_eq!(reader.faults_raised.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot(&dir.path().join("out")), expected_files(6));
    }
}

#[tokio::test]
async fn test_retries_exhausted_records_failure() {
    let dir = tempfile::tempdir().unwrap();
    let data = build_archive(3);
    let target = list_entries(&data)
        .await
        .into_iter()
        .find(|e| e.name == file_name(0))
        .unwrap();
    // Streams restart from the payload on every attempt, sidecars would resume
    let offset = payload_offset(&data, &target);
    let reader = Arc::new(
        InstrumentedReader::new(data).with_fault(Fault::DropConnection { offset, times: 100 }),
    );
    let mut config = config(dir.path(), 1);
    config.delivery = DeliveryMode::Streaming;
    config.retry.max_attempts = 2;

    let result = run_job(reader.clone(), config).await.unwrap();
    assert_eq!(result.failures.len(), 1);
    assert!(matches!(result.failures.get(&file_name(0)), Some(Error::Io(_))));
    assert_eq!(reader.faults_raised.load(Ordering::SeqCst), 3);
    assert_eq!(result.committed, 2);
    assert!(!dir.path().join("out/data/file_00.bin").exists());
    assert!(!dir.path().join("out/data/file_00.bin_tmp").exists());
}

#[tokio::test]
async fn test_scenario_d_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let data = build_archive(20);
    let reader =
        Arc::new(InstrumentedReader::new(data).with_delay(Duration::from_millis(50)));
    let downloader =
        StreamDownloader::new(reader, "fixture.zip", config(dir.path(), 2)).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let outcome = downloader.run(cancel).await;
    assert!(matches!(outcome, Err(Error::Cancelled)), "{outcome:?}");
    assert!(started.elapsed() < Duration::from_secs(5));

    // Whatever reached its final path is complete
    let expected = expected_files(20);
    let files = snapshot(&dir.path().join("out"));
    let committed: Vec<_> = files
        .iter()
        .filter(|(name, _)| !name.ends_with("_tmp"))
        .collect();
    assert!(committed.len() < 20);
    for (name, bytes) in committed {
        assert_eq!(Some(bytes), expected.get(name), "{name} is incomplete");
    }
}

#[tokio::test]
async fn test_partial_failure_reports_only_the_corrupt_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = build_archive(6);
    // file_03 is stored, so flipping a payload byte breaks only its CRC
    let target = list_entries(&data)
        .await
        .into_iter()
        .find(|e| e.name == file_name(3))
        .unwrap();
    let payload = payload_offset(&data, &target) as usize;
    data[payload + 5] ^= 0xFF;

    let reader = Arc::new(InstrumentedReader::new(data));
    let result = run_job(reader, config(dir.path(), 3)).await.unwrap();

    let failed: Vec<_> = result.failures.keys().cloned().collect();
    assert_eq!(failed, vec![file_name(3)]);
    assert!(matches!(
        result.failures.get(&file_name(3)),
        Some(Error::Checksum { .. })
    ));
    assert_eq!(result.committed, 5);

    let mut expected = expected_files(6);
    expected.remove(&file_name(3));
    assert_eq!(snapshot(&dir.path().join("out")), expected);
    // A failed job keeps the central directory cache
    assert!(
        dir.path()
            .join("staging/fixture.zip.zipcdr")
            .exists()
    );
}

#[tokio::test]
async fn test_idempotent_rerun_reads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let data = build_archive(8);
    let reader = Arc::new(InstrumentedReader::new(data));
    let mut config = config(dir.path(), 4);
    config.keep_central_directory_cache = true;

    let first = run_job(reader.clone(), config.clone()).await.unwrap();
    assert_eq!(first.committed, 8);
    assert!(reader.reads() > 0);

    reader.reset();
    let second = run_job(reader.clone(), config).await.unwrap();
    assert!(second.is_success());
    assert_eq!(second.skipped, 8);
    assert_eq!(second.committed, 0);
    assert_eq!(reader.reads(), 0);
}

#[tokio::test]
async fn test_streaming_matches_compressed_file_mode() {
    let data = build_archive(9);
    let mut outputs = Vec::new();
    for delivery in [DeliveryMode::CompressedFile, DeliveryMode::Streaming] {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 3);
        config.delivery = delivery;
        let result = run_job(Arc::new(InstrumentedReader::new(data.clone())), config)
            .await
            .unwrap();
        assert!(result.is_success(), "{delivery:?}: {:?}", result.failures);
        if delivery == DeliveryMode::Streaming {
            // No sidecars in streaming mode
            assert!(!dir.path().join("staging/data/file_00.bin.zip").exists());
        }
        outputs.push(snapshot(&dir.path().join("out")));
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], expected_files(9));
}

#[tokio::test]
async fn test_results_do_not_depend_on_worker_counts() {
    let data = build_archive(12);
    let mut outputs = Vec::new();
    for workers in [1, 4, 16] {
        let dir = tempfile::tempdir().unwrap();
        let result = run_job(
            Arc::new(InstrumentedReader::new(data.clone())),
            config(dir.path(), workers),
        )
        .await
        .unwrap();
        assert_eq!(result.committed, 12);
        outputs.push(snapshot(&dir.path().join("out")));
    }
    assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn test_keep_sidecars_leaves_standalone_archives() {
    let dir = tempfile::tempdir().unwrap();
    let data = build_archive(3);
    let mut config = config(dir.path(), 2);
    config.keep_sidecars = true;
    let result = run_job(Arc::new(InstrumentedReader::new(data)), config)
        .await
        .unwrap();
    assert!(result.is_success());

    let sidecar = std::fs::read(dir.path().join("staging/data/file_01.bin.zip")).unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(sidecar)).unwrap();
    assert_eq!(archive.len(), 1);
    let mut extracted = Vec::new();
    std::io::Read::read_to_end(&mut archive.by_index(0).unwrap(), &mut extracted).unwrap();
    assert_eq!(extracted, content(1));
}

#[tokio::test]
async fn test_remote_change_aborts_job_and_drops_cache() {
    let dir = tempfile::tempdir().unwrap();
    let data = build_archive(5);
    let offset = list_entries(&data)
        .await
        .into_iter()
        .find(|e| e.name == file_name(2))
        .unwrap()
        .offset;
    let reader =
        Arc::new(InstrumentedReader::new(data).with_fault(Fault::ContentChanged { offset }));
    let mut config = config(dir.path(), 1);
    config.keep_central_directory_cache = true;

    let outcome = run_job(reader, config).await;
    assert!(matches!(outcome, Err(Error::RemoteContentChanged)), "{outcome:?}");
    assert!(!dir.path().join("staging/fixture.zip.zipcdr").exists());
}

#[tokio::test]
async fn test_filter_selects_entries() {
    let dir = tempfile::tempdir().unwrap();
    let data = build_archive(6);
    let mut config = config(dir.path(), 2);
    config.filter = zipstream::EntryFilter::new(
        vec!["data/file_0?.bin".into()],
        vec!["file_05".into()],
    );
    let result = run_job(Arc::new(InstrumentedReader::new(data)), config)
        .await
        .unwrap();
    assert_eq!(result.committed, 5);
    let mut expected = expected_files(6);
    expected.remove(&file_name(5));
    assert_eq!(snapshot(&dir.path().join("out")), expected);
}

#[tokio::test]
async fn test_second_concurrent_run_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let data = build_archive(6);
    let reader =
        Arc::new(InstrumentedReader::new(data).with_delay(Duration::from_millis(50)));
    let downloader = Arc::new(
        StreamDownloader::new(reader, "fixture.zip", config(dir.path(), 1)).unwrap(),
    );

    let cancel = CancellationToken::new();
    let first = {
        let downloader = downloader.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { downloader.run(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = downloader.run(CancellationToken::new()).await;
    assert!(matches!(second, Err(Error::JobInProgress)), "{second:?}");

    cancel.cancel();
    assert!(matches!(first.await.unwrap(), Err(Error::Cancelled)));
    // The flag is released once the first job ends
    let third = downloader.run(CancellationToken::new()).await.unwrap();
    assert!(third.is_success());
}

/// Six stored blobs filled with `fill`, `fill + 1`, ... Any fill gives the
/// same layout.
fn blob_archive(fill: u8) -> (Vec<u8>, BTreeMap<String, Vec<u8>>) {
    let files: BTreeMap<String, Vec<u8>> = (0..6u8)
        .map(|i| (format!("blob_{i}.bin"), vec![fill + i; 50_000]))
        .collect();
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in &files {
        writer.start_file(name.as_str(), options).unwrap();
        writer.write_all(data).unwrap();
    }
    (writer.finish().unwrap().into_inner(), files)
}

fn offset_of(entries: &[ArchiveEntry], name: &str) -> u64 {
    entries.iter().find(|e| e.name == name).unwrap().offset
}

/// Sidecar archives left under `staging`
fn sidecars(staging: &Path) -> Vec<String> {
    if !staging.exists() {
        return Vec::new();
    }
    snapshot(staging)
        .into_keys()
        .filter(|name| name.ends_with(".zip"))
        .collect()
}

/// Start a job whose first entry stalls halfway, then cancel it. Returns
/// the offset of the stalled record and the length of its sidecar.
async fn stall_and_cancel(dir: &Path, data: Vec<u8>) -> (u64, u64) {
    let stalled = offset_of(&list_entries(&data).await, "blob_0.bin");
    let reader = Arc::new(InstrumentedReader::new(data).with_fault(Fault::Stall { offset: stalled }));
    let downloader = StreamDownloader::new(reader, "fixture.zip", config(dir, 1)).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });
    let outcome = downloader.run(cancel).await;
    assert!(matches!(outcome, Err(Error::Cancelled)), "{outcome:?}");

    let partial = std::fs::metadata(dir.join("staging/blob_0.bin.zip"))
        .unwrap()
        .len();
    assert!(partial > 0);
    (stalled, partial)
}

#[tokio::test]
async fn test_remote_change_discards_partial_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let (old, _) = blob_archive(b'A');
    let entries = list_entries(&old).await;
    let reader = Arc::new(
        InstrumentedReader::new(old)
            .with_fault(Fault::Stall {
                offset: offset_of(&entries, "blob_0.bin"),
            })
            .with_fault(Fault::ContentChanged {
                offset: offset_of(&entries, "blob_5.bin"),
            }),
    );
    let mut config = config(dir.path(), 2);
    config.verify_workers = 1;
    config.keep_central_directory_cache = true;

    let outcome = run_job(reader, config.clone()).await;
    assert!(matches!(outcome, Err(Error::RemoteContentChanged)), "{outcome:?}");
    assert_eq!(sidecars(&dir.path().join("staging")), Vec::<String>::new());

    // Same layout, new bytes: with every check off, only fresh data can
    // produce the right files
    let (new, files) = blob_archive(b'a');
    let reader = Arc::new(InstrumentedReader::new(new).with_validator("\"v2\""));
    config.skip_local_header_checks = true;
    config.verify_extracted = false;
    let result = run_job(reader, config).await.unwrap();
    assert!(result.is_success(), "{:?}", result.failures);
    assert_eq!(snapshot(&dir.path().join("out")), files);
}

#[tokio::test]
async fn test_cancelled_job_resumes_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let (data, files) = blob_archive(b'A');
    let (stalled, partial) = stall_and_cancel(dir.path(), data.clone()).await;

    let reader = Arc::new(InstrumentedReader::new(data));
    let result = run_job(reader.clone(), config(dir.path(), 1)).await.unwrap();
    assert!(result.is_success(), "{:?}", result.failures);
    // Only the missing tail of the record is fetched again
    let served = reader.served();
    assert!(served.iter().any(|&(start, _)| start == stalled + partial), "{served:?}");
    assert!(!served.iter().any(|&(start, end)| start == stalled && end - start > partial));
    assert_eq!(snapshot(&dir.path().join("out")), files);
}

#[tokio::test]
async fn test_stale_cache_discards_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let (old, _) = blob_archive(b'A');
    let (stalled, partial) = stall_and_cancel(dir.path(), old).await;

    // The remote is replaced before the job is resumed
    let (new, files) = blob_archive(b'a');
    let reader = Arc::new(InstrumentedReader::new(new).with_validator("\"v2\""));
    let mut config = config(dir.path(), 1);
    config.skip_local_header_checks = true;
    config.verify_extracted = false;

    let result = run_job(reader.clone(), config).await.unwrap();
    assert!(result.is_success(), "{:?}", result.failures);
    // The whole record is fetched again from its local header
    let served = reader.served();
    assert!(served.iter().any(|&(start, end)| start == stalled && end - start > partial), "{served:?}");
    assert!(!served.iter().any(|&(start, _)| start == stalled + partial));
    assert_eq!(snapshot(&dir.path().join("out")), files);
}

/// Hand-assembled archive: a deflated entry whose CRC and sizes follow in
/// a data descriptor, then a stored entry whose local header keeps its
/// sizes in a Zip64 extra field. Returns the archive, its files and the
/// central directory offset.
fn build_descriptor_archive() -> (Vec<u8>, BTreeMap<String, Vec<u8>>, u64) {
    const DOS_DATE: u16 = (45 << 9) | (1 << 5) | 1;
    let log = b"descriptor entry\n".repeat(500);
    let blob: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let crc_of = |data: &[u8]| {
        let mut crc = flate2::Crc::new();
        crc.update(data);
        crc.sum()
    };

    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&log).unwrap();
    let deflated = encoder.finish().unwrap();

    let mut data = Vec::new();
    let local_header = |data: &mut Vec<u8>,
                            version: u16,
                            flags: u16,
                            method: u16,
                            crc: u32,
                            size: u32,
                            name: &str,
                            extra: &[u8]| {
        data.extend_from_slice(b"PK\x03\x04");
        data.extend_from_slice(&version.to_le_bytes());
        data.extend_from_slice(&flags.to_le_bytes());
        data.extend_from_slice(&method.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&DOS_DATE.to_le_bytes());
        data.extend_from_slice(&crc.to_le_bytes());
        data.extend_from_slice(&size.to_le_bytes());
        data.extend_from_slice(&size.to_le_bytes());
        data.extend_from_slice(&(name.len() as u16).to_le_bytes());
        data.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        data.extend_from_slice(name.as_bytes());
        data.extend_from_slice(extra);
    };

    // CRC and sizes are zero up front and follow the data
    let log_offset = data.len() as u64;
    local_header(&mut data, 20, 0x0008, 8, 0, 0, "stream/log.txt", &[]);
    data.extend_from_slice(&deflated);
    data.extend_from_slice(b"PK\x07\x08");
    data.extend_from_slice(&crc_of(&log).to_le_bytes());
    data.extend_from_slice(&(deflated.len() as u32).to_le_bytes());
    data.extend_from_slice(&(log.len() as u32).to_le_bytes());

    // Sentinel sizes, real ones in the Zip64 extra
    let blob_offset = data.len() as u64;
    let mut extra = Vec::new();
    extra.extend_from_slice(&1u16.to_le_bytes());
    extra.extend_from_slice(&16u16.to_le_bytes());
    extra.extend_from_slice(&(blob.len() as u64).to_le_bytes());
    extra.extend_from_slice(&(blob.len() as u64).to_le_bytes());
    local_header(
        &mut data,
        45,
        0,
        0,
        crc_of(&blob),
        u32::MAX,
        "stream/blob.bin",
        &extra,
    );
    data.extend_from_slice(&blob);

    let central = [
        ArchiveEntry {
            name: "stream/log.txt".into(),
            raw_name: b"stream/log.txt".to_vec(),
            version_made_by: 20,
            version_needed: 20,
            flags: 0x0008,
            compression_method: CompressionMethod::Deflate,
            last_mod_time: 0,
            last_mod_date: DOS_DATE,
            crc32: crc_of(&log),
            compressed_size: deflated.len() as u64,
            uncompressed_size: log.len() as u64,
            offset: log_offset,
            external_attributes: 0,
            comment: Vec::new(),
        },
        ArchiveEntry {
            name: "stream/blob.bin".into(),
            raw_name: b"stream/blob.bin".to_vec(),
            version_made_by: 45,
            version_needed: 45,
            flags: 0,
            compression_method: CompressionMethod::Stored,
            last_mod_time: 0,
            last_mod_date: DOS_DATE,
            crc32: crc_of(&blob),
            compressed_size: blob.len() as u64,
            uncompressed_size: blob.len() as u64,
            offset: blob_offset,
            external_attributes: 0,
            comment: Vec::new(),
        },
    ];
    let cd_offset = data.len() as u64;
    let mut cd_size = 0;
    for entry in &central {
        cd_size += write_central_header(&mut data, entry, entry.offset).unwrap();
    }
    write_end_of_central_directory(&mut data, 2, cd_size, cd_offset, &[]).unwrap();

    let files = BTreeMap::from([
        ("stream/log.txt".to_string(), log),
        ("stream/blob.bin".to_string(), blob),
    ]);
    (data, files, cd_offset)
}

#[tokio::test]
async fn test_descriptor_and_zip64_local_headers() {
    let (data, files, cd_offset) = build_descriptor_archive();
    let entries = list_entries(&data).await;
    assert_eq!(entries.len(), 2);
    assert!(entries[0].has_data_descriptor());
    assert_eq!(entries[0].data_descriptor_size(), 16);

    // Records are back to back: descriptor tail, then the next header
    let reader = MemoryReader::new(data.clone());
    let log = locate_entry(&reader, &entries[0], true).await.unwrap();
    assert_eq!(log.record_end(&entries[0]), entries[1].offset);
    let blob = locate_entry(&reader, &entries[1], true).await.unwrap();
    assert_eq!(blob.header_len, 30 + "stream/blob.bin".len() as u64 + 20);
    assert_eq!(blob.record_end(&entries[1]), cd_offset);

    for delivery in [DeliveryMode::CompressedFile, DeliveryMode::Streaming] {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        config.delivery = delivery;
        let result = run_job(Arc::new(InstrumentedReader::new(data.clone())), config)
            .await
            .unwrap();
        assert!(result.is_success(), "{delivery:?}: {:?}", result.failures);
        assert_eq!(result.committed, 2);
        assert_eq!(snapshot(&dir.path().join("out")), files, "{delivery:?}");
    }
}
