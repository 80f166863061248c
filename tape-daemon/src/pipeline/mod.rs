//! The backup pipeline: scanner → packer → post-processor → writer.
//!
//! Stages are connected by bounded channels, so a slow downstream stage
//! throttles everything above it. Chunk ownership moves along the channels;
//! the scanner and packer run on blocking threads (directory I/O, mmap
//! copies), the post-processor is async, and the writer owns its device on
//! a dedicated blocking thread.

pub mod postprocess;
pub mod writer;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::chunk::{AddFileStatus, Chunk};
use crate::config::Config;
use crate::device::changer::MediaChanger;
use crate::device::SequentialDevice;
use crate::fs::scanner::{DirectoryScanner, ScanOptions};
use crate::fs::source::FileSource;
use crate::packer::ChunkPacker;
use crate::utils::errors::{EngineError, Result};
use self::postprocess::ChunkPostprocessor;
use self::writer::{TapeWriter, WriteStats};

/// One end-to-end backup run.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub id: Uuid,
    pub root: PathBuf,
}

impl BackupJob {
    pub fn new(root: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            root,
        }
    }
}

/// Summary of a completed (or cancelled) job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub root: PathBuf,
    pub files_scanned: usize,
    pub chunks_written: u64,
    pub bytes_written: u64,
    pub media_swaps: u64,
    pub cancelled: bool,
    pub duration_secs: u64,
}

/// Run a backup job through the full pipeline.
///
/// Cancellation drains in-flight work and returns a report with
/// `cancelled` set rather than an error. Any stage failure cancels the
/// remaining stages and aborts the job.
pub async fn run_backup_job(
    job: BackupJob,
    config: &Config,
    device: Box<dyn SequentialDevice>,
    changer: Box<dyn MediaChanger>,
    cancel: CancellationToken,
) -> Result<JobReport> {
    let started = Instant::now();
    info!(job_id = %job.id, root = %job.root.display(), "starting backup job");

    let (source_tx, source_rx) = mpsc::channel::<FileSource>(config.pipeline.source_queue_depth);
    let (chunk_tx, chunk_rx) = mpsc::channel::<Chunk>(config.pipeline.chunk_queue_depth);
    let (write_tx, write_rx) = mpsc::channel::<Chunk>(config.pipeline.write_queue_depth);

    // Stage 1: directory scanner (worker pool on a blocking thread).
    let scan_root = job.root.clone();
    let scan_workers = config.scanner.workers;
    let scan_cancel = cancel.clone();
    let scanner_task = tokio::task::spawn_blocking(move || {
        let scanner = DirectoryScanner::new(ScanOptions {
            workers: scan_workers,
        });
        scanner.scan(&scan_root, &scan_cancel, &|source| {
            source_tx.blocking_send(source).is_ok()
        })
    });

    // Stage 2: the packer drives the scan output sequentially.
    let packer = ChunkPacker::new(config.packer.clone());
    let pack_cancel = cancel.clone();
    let packer_task = tokio::task::spawn_blocking(move || {
        pack_sources(packer, source_rx, chunk_tx, &pack_cancel)
    });

    // Stage 3: post-processor stamps indices and the job uuid.
    let postprocessor = ChunkPostprocessor::new(job.id);
    let post_cancel = cancel.clone();
    let post_task =
        tokio::spawn(async move { postprocessor.run(chunk_rx, write_tx, post_cancel).await });

    // Stage 4: single writer per device.
    let write_cancel = cancel.clone();
    let writer_task = tokio::task::spawn_blocking(move || {
        TapeWriter::new(device, changer).run(write_rx, &write_cancel)
    });

    let (scan_res, pack_res, post_res, write_res) =
        tokio::join!(scanner_task, packer_task, post_task, writer_task);

    let scan_res = flatten_join(scan_res);
    let pack_res = flatten_join(pack_res);
    let post_res = flatten_join(post_res);
    let write_res = flatten_join(write_res);

    // The first non-cancellation failure wins; cancellations alone make
    // the job a cancelled (non-error) outcome.
    let mut failure: Option<EngineError> = None;
    let mut saw_cancel = cancel.is_cancelled();
    for err in [
        scan_res.as_ref().err(),
        pack_res.as_ref().err(),
        post_res.as_ref().err(),
        write_res.as_ref().err(),
    ]
    .into_iter()
    .flatten()
    {
        if err.is_cancelled() {
            saw_cancel = true;
        } else if failure.is_none() {
            failure = Some(clone_error(err));
        }
    }

    if let Some(err) = failure {
        cancel.cancel();
        error!(job_id = %job.id, %err, "backup job failed");
        return Err(err);
    }

    let stats: WriteStats = write_res.unwrap_or_default();
    let report = JobReport {
        job_id: job.id,
        root: job.root,
        files_scanned: scan_res.unwrap_or(0),
        chunks_written: stats.chunks_written,
        bytes_written: stats.bytes_written,
        media_swaps: stats.media_swaps,
        cancelled: saw_cancel,
        duration_secs: started.elapsed().as_secs(),
    };

    info!(
        job_id = %report.job_id,
        files = report.files_scanned,
        chunks = report.chunks_written,
        bytes = report.bytes_written,
        cancelled = report.cancelled,
        "backup job finished"
    );
    Ok(report)
}

/// The packer driver loop: pull sources in scan order, placing each one
/// until it reports `Success`, cutting a new chunk whenever the current
/// one fills up. The final partial chunk is flushed at end of scan.
fn pack_sources(
    packer: ChunkPacker,
    mut rx: mpsc::Receiver<FileSource>,
    tx: mpsc::Sender<Chunk>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut chunk = packer.new_chunk();
    let mut sealed = 0u64;

    while let Some(source) = rx.blocking_recv() {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let path = source.path().to_path_buf();
        let handle = Arc::new(Mutex::new(source));

        loop {
            match packer.add_file(&mut chunk, &handle) {
                AddFileStatus::Success => break,
                // Partial continues the same file from its new offset on
                // the next pass; NoSpace retries it whole against the
                // fresh chunk.
                AddFileStatus::Partial | AddFileStatus::NoSpace => {
                    if chunk.is_empty() {
                        // NoSpace against a fresh chunk cannot make
                        // progress; the file is unpackable.
                        return Err(EngineError::Unpackable(path));
                    }
                    let mut full = std::mem::replace(&mut chunk, packer.new_chunk());
                    packer.finalize(&mut full)?;
                    sealed += 1;
                    tx.blocking_send(full)
                        .map_err(|_| EngineError::Cancelled)?;
                }
                AddFileStatus::Error(err) => return Err(err),
            }

            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
        }
    }

    if !chunk.is_empty() {
        packer.finalize(&mut chunk)?;
        sealed += 1;
        tx.blocking_send(chunk).map_err(|_| EngineError::Cancelled)?;
    }

    Ok(sealed)
}

fn flatten_join<T>(res: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match res {
        Ok(inner) => inner,
        Err(join_err) => Err(EngineError::Pipeline(format!(
            "stage task failed: {join_err}"
        ))),
    }
}

/// EngineError is not `Clone` (it carries `io::Error`); reduce to a
/// message-preserving copy for the report path.
fn clone_error(err: &EngineError) -> EngineError {
    match err {
        EngineError::PathMissing(path) => EngineError::PathMissing(path.clone()),
        EngineError::Cancelled => EngineError::Cancelled,
        EngineError::EndOfMedium => EngineError::EndOfMedium,
        EngineError::Unpackable(path) => EngineError::Unpackable(path.clone()),
        EngineError::DeviceIo(e) => EngineError::DeviceIo(e.clone()),
        other => EngineError::Pipeline(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::format::{self, parse_chunk, ENTRY_TYPE_DIRECTORY};
    use crate::device::changer::BayChanger;
    use crate::device::file::{FileDevice, MediaBay};
    use crate::device::SequentialDevice;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn small_chunk_config(data_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = data_dir.to_path_buf();
        config.packer.max_chunk_size = 1024 * 1024;
        config.packer.header_reserved = 128 * 1024;
        config.packer.min_free_space = 16 * 1024;
        config
    }

    fn library(dir: &std::path::Path, slots: usize, capacity: u64) -> (FileDevice, BayChanger) {
        let mut bay = MediaBay::create(dir, slots).unwrap();
        bay.load_drive_from(0).unwrap();
        let bay = std::sync::Arc::new(Mutex::new(bay));
        (
            FileDevice::new(bay.clone(), capacity),
            BayChanger::new(bay),
        )
    }

    /// Read every record off the media (in slot order, drive last) and
    /// parse each as a chunk.
    fn read_back_chunks(
        media_dir: &std::path::Path,
        capacity: u64,
    ) -> Vec<(format::ParsedChunk, Vec<u8>)> {
        let mut images = Vec::new();
        let mut paths: Vec<_> = fs::read_dir(media_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        paths.sort();

        for path in paths {
            // Read each medium through a throwaway single-slot bay.
            let dir = TempDir::new().unwrap();
            let medium_copy = dir.path().join("medium-00.vtape");
            fs::copy(&path, &medium_copy).unwrap();
            let mut bay = MediaBay::create(dir.path(), 1).unwrap();
            bay.load_drive_from(0).unwrap();
            let mut device = FileDevice::new(std::sync::Arc::new(Mutex::new(bay)), capacity);

            let mut buf = vec![0u8; 2 * 1024 * 1024];
            loop {
                let n = device.read(&mut buf).unwrap();
                if n == 0 {
                    // File mark or end of data; skip the mark and probe on.
                    device.skip_filemark().unwrap();
                    let probe = device.read(&mut buf).unwrap();
                    if probe == 0 {
                        break;
                    }
                    images.push(buf[..probe].to_vec());
                    continue;
                }
                images.push(buf[..n].to_vec());
            }
        }

        images
            .into_iter()
            .map(|image| {
                let parsed = parse_chunk(&image).unwrap();
                (parsed, image)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_end_to_end_roundtrip() {
        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("alpha.txt"), b"alpha contents").unwrap();
        fs::write(tree.path().join("beta.bin"), vec![0xB7u8; 50_000]).unwrap();
        fs::create_dir(tree.path().join("nested")).unwrap();
        fs::write(tree.path().join("nested/gamma.dat"), vec![3u8; 12_345]).unwrap();

        let data_dir = TempDir::new().unwrap();
        let config = small_chunk_config(data_dir.path());

        let media_dir = data_dir.path().join("media");
        let capacity = 8 * 1024 * 1024;
        let (device, changer) = library(&media_dir, 2, capacity);

        let job = BackupJob::new(tree.path().to_path_buf());
        let job_id = job.id;
        let report = run_backup_job(
            job,
            &config,
            Box::new(device),
            Box::new(changer),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!report.cancelled);
        // root + nested + 3 files
        assert_eq!(report.files_scanned, 5);
        assert!(report.chunks_written >= 1);

        // Reassemble every file carried on the media.
        let chunks = read_back_chunks(&media_dir, capacity);
        assert_eq!(chunks.len() as u64, report.chunks_written);

        let mut indices = Vec::new();
        let mut contents: HashMap<String, Vec<u8>> = HashMap::new();
        let mut dirs = Vec::new();
        for (parsed, image) in &chunks {
            assert_eq!(parsed.header.job_uuid, job_id);
            indices.push(parsed.header.chunk_index);
            for entry in &parsed.entries {
                if entry.kind == ENTRY_TYPE_DIRECTORY {
                    dirs.push(entry.name.clone());
                    assert_eq!(entry.blob_len, 0);
                    assert_eq!(entry.size, 0);
                    continue;
                }
                let blob = parsed.blob_bytes(image, entry).unwrap();
                assert_eq!(format::crc32c(blob), entry.checksum);
                let file = contents.entry(entry.name.clone()).or_insert_with(|| {
                    vec![0u8; entry.size as usize]
                });
                let start = entry.blob_file_offset as usize;
                file[start..start + blob.len()].copy_from_slice(blob);
            }
        }

        // Chunk indices are the contiguous sequence 0, 1, 2, ...
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..chunks.len() as u64).collect::<Vec<_>>());

        // Every source file round-trips byte for byte.
        for (name, bytes) in &contents {
            let original = fs::read(name).unwrap();
            assert_eq!(&original, bytes, "mismatch for {name}");
        }
        assert_eq!(contents.len(), 3);
        // Both directories (root and nested) were recorded.
        assert_eq!(dirs.len(), 2);
    }

    #[tokio::test]
    async fn test_split_file_spans_media() {
        let tree = TempDir::new().unwrap();
        // One file larger than a medium, forcing an end-of-medium swap.
        let data: Vec<u8> = (0..3_000_000usize).map(|i| (i % 241) as u8).collect();
        fs::write(tree.path().join("big.bin"), &data).unwrap();

        let data_dir = TempDir::new().unwrap();
        let config = small_chunk_config(data_dir.path());

        let media_dir = data_dir.path().join("media");
        let capacity = 2 * 1024 * 1024;
        let (device, changer) = library(&media_dir, 3, capacity);

        let report = run_backup_job(
            BackupJob::new(tree.path().to_path_buf()),
            &config,
            Box::new(device),
            Box::new(changer),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(report.media_swaps >= 1, "expected at least one medium swap");
        assert!(report.chunks_written >= 3);

        // The split entries reassemble the original bytes exactly.
        let chunks = read_back_chunks(&media_dir, capacity);
        let mut reassembled = vec![0u8; data.len()];
        let mut covered = 0u64;
        for (parsed, image) in &chunks {
            for entry in parsed.entries.iter().filter(|e| e.name.ends_with("big.bin")) {
                let blob = parsed.blob_bytes(image, entry).unwrap();
                let start = entry.blob_file_offset as usize;
                reassembled[start..start + blob.len()].copy_from_slice(blob);
                covered += entry.blob_len;
            }
        }
        assert_eq!(covered, data.len() as u64);
        assert_eq!(reassembled, data);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("f.txt"), b"data").unwrap();

        let data_dir = TempDir::new().unwrap();
        let config = small_chunk_config(data_dir.path());
        let (device, changer) = library(&data_dir.path().join("media"), 1, 1024 * 1024);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = run_backup_job(
            BackupJob::new(tree.path().to_path_buf()),
            &config,
            Box::new(device),
            Box::new(changer),
            cancel,
        )
        .await
        .unwrap();
        assert!(report.cancelled);
    }

    #[tokio::test]
    async fn test_missing_root_fails() {
        let data_dir = TempDir::new().unwrap();
        let config = small_chunk_config(data_dir.path());
        let (device, changer) = library(&data_dir.path().join("media"), 1, 1024 * 1024);

        let result = run_backup_job(
            BackupJob::new(PathBuf::from("/no/such/root")),
            &config,
            Box::new(device),
            Box::new(changer),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(EngineError::PathMissing(_))));
    }
}
