//! The chunk: container for file data and metadata on the medium.
//!
//! A chunk is filled by the packer, sealed and stamped by the
//! post-processor, and consumed by the writer. Ownership moves along the
//! pipeline; no two stages ever hold the same chunk.

pub mod buffer;
pub mod format;

use uuid::Uuid;

use crate::fs::source::SourceHandle;
use crate::utils::errors::EngineError;
use self::buffer::ChunkBuffer;
use self::format::{FileEntry, HEADER_CHUNK_INDEX_OFFSET, HEADER_JOB_UUID_OFFSET, HEADER_LEN};

/// Outcome of attempting to add one file to a chunk.
#[derive(Debug)]
pub enum AddFileStatus {
    /// The entire file (or its entire remainder) was placed.
    Success,
    /// Part of the file was placed; the chunk is out of space. Allocate a
    /// fresh chunk and add the same file again until `Success` is returned.
    Partial,
    /// Nothing was placed; the file should start in a fresh chunk.
    NoSpace,
    /// Metadata or I/O failure; fatal to the job.
    Error(EngineError),
}

/// A file placed in a chunk: the shared source plus the entry that will be
/// serialized for it. `checksum` and `blob_start` are filled at finalize.
#[derive(Debug)]
pub struct PlacedFile {
    pub source: SourceHandle,
    pub entry: FileEntry,
}

#[derive(Debug)]
pub struct Chunk {
    max_size: u64,
    /// Fixed header plus entry table plus page-rounded blob spans.
    used_bytes: u64,
    entry_table_len: u64,
    files: Vec<PlacedFile>,

    image: Option<ChunkBuffer>,
    writable: bool,
    chunk_index: Option<u64>,
}

impl Chunk {
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            used_bytes: HEADER_LEN as u64,
            entry_table_len: 0,
            files: Vec::new(),
            image: None,
            writable: true,
            chunk_index: None,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn entry_table_len(&self) -> u64 {
        self.entry_table_len
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn files_mut(&mut self) -> &mut [PlacedFile] {
        &mut self.files
    }

    /// Record a placement and account for its entry and page-rounded blob
    /// span. Only the packer calls this, after its fit checks passed.
    pub(crate) fn place(&mut self, placed: PlacedFile) {
        debug_assert!(self.writable);
        let entry_len = placed.entry.encoded_len() as u64;
        self.entry_table_len += entry_len;
        self.used_bytes += entry_len + format::page_align(placed.entry.blob_len);
        self.files.push(placed);
    }

    pub(crate) fn set_image(&mut self, image: ChunkBuffer) {
        self.image = Some(image);
        self.writable = false;
    }

    /// The finalized on-media byte image, if `finalize` has run.
    pub fn image(&self) -> Option<&[u8]> {
        self.image.as_ref().map(|b| b.as_slice())
    }

    pub(crate) fn image_mut(&mut self) -> Option<&mut [u8]> {
        self.image.as_mut().map(|b| b.as_mut_slice())
    }

    pub fn index(&self) -> Option<u64> {
        self.chunk_index
    }

    /// Stamp the chunk's index into the serialized header. Assigned exactly
    /// once by the post-processor.
    pub fn set_index(&mut self, index: u64) {
        debug_assert!(self.chunk_index.is_none(), "chunk index assigned twice");
        self.chunk_index = Some(index);
        if let Some(image) = self.image_mut() {
            image[HEADER_CHUNK_INDEX_OFFSET..HEADER_CHUNK_INDEX_OFFSET + 8]
                .copy_from_slice(&index.to_le_bytes());
        }
    }

    /// Stamp the owning job's identifier into the serialized header.
    pub fn set_job_uuid(&mut self, job_uuid: Uuid) {
        if let Some(image) = self.image_mut() {
            image[HEADER_JOB_UUID_OFFSET..HEADER_JOB_UUID_OFFSET + 16]
                .copy_from_slice(job_uuid.as_bytes());
        }
    }

    /// Disallow further additions. Idempotent; finalize already clears the
    /// writable flag, this is the post-processor's explicit seal.
    pub fn seal(&mut self) {
        self.writable = false;
    }
}
