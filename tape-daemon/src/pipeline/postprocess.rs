//! Chunk post-processing: the sealing step between packing and writing.
//!
//! Each sealed chunk gets the next chunk index and the owning job's
//! identifier stamped into its header before it is forwarded to the writer
//! queue. Index assignment is strictly serial; indices are contiguous from
//! zero within a job.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::chunk::Chunk;
use crate::utils::errors::Result;

pub struct ChunkPostprocessor {
    job_uuid: Uuid,
    next_index: AtomicU64,
}

impl ChunkPostprocessor {
    pub fn new(job_uuid: Uuid) -> Self {
        Self {
            job_uuid,
            next_index: AtomicU64::new(0),
        }
    }

    /// Drain the packer's channel into the writer's queue until the input
    /// closes or the job is cancelled. Returns the number of chunks
    /// forwarded.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<Chunk>,
        tx: mpsc::Sender<Chunk>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let mut forwarded = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = rx.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            let mut chunk = chunk;
            let index = self.next_index.fetch_add(1, Ordering::SeqCst);
            chunk.set_index(index);
            chunk.set_job_uuid(self.job_uuid);
            chunk.seal();

            debug!(chunk_index = index, files = chunk.num_files(), "post-processed chunk");

            if tx.send(chunk).await.is_err() {
                // Writer went away; its own result carries the reason.
                break;
            }
            forwarded += 1;
        }

        Ok(forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::format::parse_chunk;
    use crate::fs::source::FileSource;
    use crate::packer::{ChunkPacker, PackerConfig};
    use std::fs;
    use tempfile::TempDir;

    fn sealed_chunk(dir: &TempDir, name: &str) -> Chunk {
        let path = dir.path().join(name);
        fs::write(&path, b"payload").unwrap();

        let packer = ChunkPacker::new(PackerConfig {
            max_chunk_size: 1024 * 1024,
            header_reserved: 128 * 1024,
            min_free_space: 16 * 1024,
        });
        let mut chunk = packer.new_chunk();
        let handle = FileSource::new(path, 0, None).into_handle();
        assert!(matches!(
            packer.add_file(&mut chunk, &handle),
            crate::chunk::AddFileStatus::Success
        ));
        packer.finalize(&mut chunk).unwrap();
        chunk
    }

    #[tokio::test]
    async fn test_indices_contiguous_and_uuid_stamped() {
        let dir = TempDir::new().unwrap();
        let job_uuid = Uuid::new_v4();

        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);

        for name in ["a.bin", "b.bin", "c.bin"] {
            in_tx.send(sealed_chunk(&dir, name)).await.unwrap();
        }
        drop(in_tx);

        let postprocessor = ChunkPostprocessor::new(job_uuid);
        let forwarded = postprocessor
            .run(in_rx, out_tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(forwarded, 3);

        let mut expected = 0u64;
        while let Some(chunk) = out_rx.recv().await {
            assert_eq!(chunk.index(), Some(expected));
            let parsed = parse_chunk(chunk.image().unwrap()).unwrap();
            assert_eq!(parsed.header.chunk_index, expected);
            assert_eq!(parsed.header.job_uuid, job_uuid);
            assert!(!chunk.is_writable());
            expected += 1;
        }
        assert_eq!(expected, 3);
    }

    #[tokio::test]
    async fn test_cancel_discards_queue() {
        let dir = TempDir::new().unwrap();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);

        in_tx.send(sealed_chunk(&dir, "x.bin")).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let postprocessor = ChunkPostprocessor::new(Uuid::new_v4());
        let forwarded = postprocessor.run(in_rx, out_tx, cancel).await.unwrap();
        assert_eq!(forwarded, 0);
        assert!(out_rx.recv().await.is_none());
    }
}
