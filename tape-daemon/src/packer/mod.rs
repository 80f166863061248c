//! The chunk packer.
//!
//! Decides, per file, whether it fits, partially fits, or forces a chunk
//! cut, and assembles the finalized in-memory chunk image. The policy aims
//! to keep fragmentation low under a hard maximum chunk size: files small
//! enough to live in one chunk are deferred to a fresh chunk rather than
//! split when the current chunk cannot comfortably hold them, and a file
//! that must span chunks is never started in a nearly-full chunk.

use serde::Deserialize;
use tracing::{debug, trace};

use crate::chunk::buffer::ChunkBuffer;
use crate::chunk::format::{
    self, ChunkHeader, FileEntry, ENTRY_TYPE_DIRECTORY, ENTRY_TYPE_FILE, HEADER_LEN, PAGE_SIZE,
};
use crate::chunk::{AddFileStatus, Chunk, PlacedFile};
use crate::fs::source::SourceHandle;
use crate::utils::errors::Result;

const GIB: u64 = 1024 * 1024 * 1024;

/// Packing tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct PackerConfig {
    /// Hard maximum size of a chunk image.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Bytes of the chunk's capacity kept unavailable for blob data;
    /// covers the header and entry table with margin.
    #[serde(default = "default_header_reserved")]
    pub header_reserved: u64,

    /// Once free space falls below this, no further add attempts are made
    /// on the chunk.
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,
}

fn default_max_chunk_size() -> u64 {
    2 * GIB
}

fn default_header_reserved() -> u64 {
    512 * 1024
}

fn default_min_free_space() -> u64 {
    1024 * 1024
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            header_reserved: default_header_reserved(),
            min_free_space: default_min_free_space(),
        }
    }
}

pub struct ChunkPacker {
    cfg: PackerConfig,
}

impl ChunkPacker {
    pub fn new(cfg: PackerConfig) -> Self {
        Self { cfg }
    }

    pub fn new_chunk(&self) -> Chunk {
        Chunk::new(self.cfg.max_chunk_size)
    }

    /// Try to place `source` (or its remainder, for a file continuing from
    /// a previous chunk) into `chunk`.
    pub fn add_file(&self, chunk: &mut Chunk, handle: &SourceHandle) -> AddFileStatus {
        debug_assert!(chunk.is_writable());

        if chunk.max_size().saturating_sub(chunk.used_bytes()) <= self.cfg.min_free_space {
            return AddFileStatus::NoSpace;
        }

        let mut source = handle.lock().unwrap();
        let meta = match source.fetch_metadata() {
            Ok(meta) => meta.clone(),
            Err(err) => return AddFileStatus::Error(err),
        };

        let name = source.path().to_string_lossy().into_owned();
        let entry_len = format::encoded_entry_len(&name) as u64;

        // Space left for this file's blob once its entry is accounted for.
        let bytes_free = chunk
            .max_size()
            .saturating_sub(chunk.used_bytes())
            .saturating_sub(self.cfg.header_reserved)
            .saturating_sub(entry_len);

        if meta.is_dir {
            // Directories carry no data; they are fully written the moment
            // their entry is recorded.
            if entry_len > chunk.max_size().saturating_sub(chunk.used_bytes()) {
                return AddFileStatus::NoSpace;
            }
            source.mark_fully_written();
            let entry = build_entry(&source, &meta, name, 0, 0);
            drop(source);
            chunk.place(PlacedFile {
                source: handle.clone(),
                entry,
            });
            return AddFileStatus::Success;
        }

        if meta.size < self.cfg.max_chunk_size - self.cfg.header_reserved {
            // Small-file regime: the whole file could live in one chunk.
            // Demand room for at least half of it here, otherwise let it
            // start in a fresh chunk instead of fragmenting it.
            if meta.size / 2 > bytes_free {
                trace!(
                    file = %source.path().display(),
                    size = meta.size,
                    bytes_free,
                    "deferring small file to a fresh chunk"
                );
                return AddFileStatus::NoSpace;
            }
        } else {
            // Large-file regime: the file will span chunks no matter what.
            // Never start it in a chunk that is more than half consumed.
            if bytes_free < self.cfg.max_chunk_size / 2 {
                return AddFileStatus::NoSpace;
            }
        }

        let remaining = source.bytes_remaining();
        if remaining <= bytes_free {
            source.advance_range(remaining);
            source.mark_fully_written();
            let offset = source.range().file_offset;
            let entry = build_entry(&source, &meta, name, remaining, offset);
            drop(source);
            chunk.place(PlacedFile {
                source: handle.clone(),
                entry,
            });
            AddFileStatus::Success
        } else {
            // Split: place as many whole pages as fit; the file continues
            // in the next chunk from the updated offset.
            let placeable = bytes_free - (bytes_free % PAGE_SIZE);
            if placeable == 0 {
                return AddFileStatus::NoSpace;
            }
            source.advance_range(placeable);
            let offset = source.range().file_offset;
            let entry = build_entry(&source, &meta, name, placeable, offset);
            drop(source);
            chunk.place(PlacedFile {
                source: handle.clone(),
                entry,
            });
            AddFileStatus::Partial
        }
    }

    /// Assemble the chunk's on-media image: lay out the header area and the
    /// page-aligned blob area, allocate the backing buffer, serialize the
    /// header and entries, and copy each placed range out of its source
    /// mapping while computing its CRC-32C. The chunk is non-writable
    /// afterwards.
    pub fn finalize(&self, chunk: &mut Chunk) -> Result<()> {
        debug_assert!(chunk.is_writable(), "finalize on a sealed chunk");

        let header_size = format::page_align((HEADER_LEN as u64) + chunk.entry_table_len());

        // Assign blob offsets: each blob begins at the first page boundary
        // after the previous one ends.
        let mut cursor = header_size;
        for placed in chunk.files_mut() {
            if placed.entry.blob_len > 0 {
                placed.entry.blob_start = cursor;
                cursor = format::page_align(cursor + placed.entry.blob_len);
            }
        }
        let image_len = cursor;

        let mut buffer = ChunkBuffer::allocate(image_len as usize);
        let image = buffer.as_mut_slice();

        let header = ChunkHeader::new(image_len, chunk.num_files() as u32);
        header.encode_into(image);

        let mut entry_offset = HEADER_LEN;
        for placed in chunk.files_mut() {
            let blob_len = placed.entry.blob_len;
            if blob_len > 0 {
                let start = placed.entry.blob_start as usize;
                let dest = &mut image[start..start + blob_len as usize];

                let mut source = placed.source.lock().unwrap();
                source.begin_reading()?;
                source.copy_range(placed.entry.blob_file_offset, dest)?;
                source.finished_reading();

                placed.entry.checksum = format::crc32c(dest);
            } else {
                placed.entry.checksum = format::crc32c(&[]);
            }

            placed.entry.encode_into(&mut image[entry_offset..]);
            entry_offset += placed.entry.encoded_len();
        }

        debug!(
            files = chunk.num_files(),
            image_len,
            used = chunk.used_bytes(),
            "finalized chunk image"
        );

        chunk.set_image(buffer);
        Ok(())
    }
}

fn build_entry(
    source: &crate::fs::source::FileSource,
    meta: &crate::fs::source::SourceMetadata,
    name: String,
    blob_len: u64,
    blob_file_offset: u64,
) -> FileEntry {
    FileEntry {
        file_uuid: source.uuid(),
        kind: if meta.is_dir {
            ENTRY_TYPE_DIRECTORY
        } else {
            ENTRY_TYPE_FILE
        },
        time_modified: meta.modified,
        size: meta.size,
        owner: meta.owner,
        group: meta.group,
        mode: meta.mode,
        checksum: 0,
        blob_start: 0,
        blob_len,
        blob_file_offset,
        name,
    }
}
