//! The tape writer: drains the chunk queue onto the sequential device.
//!
//! Each chunk is one device record terminated by a file mark. A chunk's
//! bytes are never split across media: when the device reports a short
//! write or end-of-medium, the writer asks the changer for a fresh medium,
//! rewinds, and retries the same chunk from the start. A chunk only counts
//! as durable once its trailing file mark has been acknowledged.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunk::Chunk;
use crate::device::changer::{ElementFlags, ElementKind, MediaChanger};
use crate::device::{DeviceError, SequentialDevice};
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Default, Clone)]
pub struct WriteStats {
    pub chunks_written: u64,
    pub bytes_written: u64,
    pub media_swaps: u64,
}

pub struct TapeWriter {
    device: Box<dyn SequentialDevice>,
    changer: Box<dyn MediaChanger>,
}

impl TapeWriter {
    pub fn new(device: Box<dyn SequentialDevice>, changer: Box<dyn MediaChanger>) -> Self {
        Self { device, changer }
    }

    /// Blocking consumer loop; runs on a dedicated thread so device I/O
    /// never stalls the runtime. On cancellation the chunk currently in
    /// flight is finished and the rest of the queue is discarded.
    pub fn run(
        mut self,
        mut rx: mpsc::Receiver<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<WriteStats> {
        let mut stats = WriteStats::default();

        while let Some(chunk) = rx.blocking_recv() {
            self.write_chunk(&chunk, &mut stats)?;
            if cancel.is_cancelled() {
                info!("cancellation observed, stopping after in-flight chunk");
                break;
            }
        }

        if stats.chunks_written > 0 {
            // Second consecutive file mark: the end-of-recording convention.
            self.device.write_filemark().map_err(EngineError::DeviceIo)?;
        }

        Ok(stats)
    }

    fn write_chunk(&mut self, chunk: &Chunk, stats: &mut WriteStats) -> Result<()> {
        let image = chunk
            .image()
            .ok_or_else(|| EngineError::Pipeline("chunk reached writer unfinalized".into()))?;
        let index = chunk.index().unwrap_or(u64::MAX);

        info!(chunk_index = index, len = image.len(), "writing chunk to medium");

        loop {
            match self.device.write(image, false) {
                Ok(written) if written == image.len() => break,
                Ok(written) => {
                    warn!(
                        chunk_index = index,
                        written,
                        expected = image.len(),
                        "short write, medium is full"
                    );
                    self.swap_medium(stats)?;
                }
                Err(DeviceError::EndOfMedium) => {
                    info!(chunk_index = index, "end of medium reached");
                    self.swap_medium(stats)?;
                }
                Err(err) => return Err(EngineError::DeviceIo(err)),
            }
        }

        // The record is durable only once its file mark is acknowledged.
        self.device.write_filemark().map_err(EngineError::DeviceIo)?;

        stats.chunks_written += 1;
        stats.bytes_written += image.len() as u64;
        info!(chunk_index = index, "chunk durable on medium");
        Ok(())
    }

    /// Move the full medium back into a slot, load the next usable one,
    /// and rewind so the retried record starts at the beginning of tape.
    fn swap_medium(&mut self, stats: &mut WriteStats) -> Result<()> {
        let drive = self
            .changer
            .elements(ElementKind::Drive)
            .map_err(EngineError::DeviceIo)?
            .into_iter()
            .next()
            .ok_or(EngineError::DeviceIo(DeviceError::NoMedium))?;

        if drive.flags.is_full() {
            let slots = self
                .changer
                .elements(ElementKind::Slot)
                .map_err(EngineError::DeviceIo)?;
            let empty = slots
                .iter()
                .find(|s| !s.flags.is_full() && s.flags.is_accessible())
                .ok_or(EngineError::EndOfMedium)?;
            self.changer
                .move_medium(drive.address, empty.address)
                .map_err(EngineError::DeviceIo)?;
        }

        let slots = self
            .changer
            .elements(ElementKind::Slot)
            .map_err(EngineError::DeviceIo)?;
        let next = slots
            .iter()
            .find(|s| s.flags.is_full() && s.flags.is_accessible())
            .ok_or(EngineError::EndOfMedium)?;

        info!(
            slot = next.address,
            label = next.label.as_deref().unwrap_or("unlabeled"),
            "swapping in next medium"
        );
        self.changer
            .move_medium(next.address, drive.address)
            .map_err(EngineError::DeviceIo)?;

        self.device.rewind().map_err(EngineError::DeviceIo)?;
        stats.media_swaps += 1;
        Ok(())
    }
}
