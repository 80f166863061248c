//! A single candidate file in a backup job.
//!
//! A file source wraps a filesystem path with lazily fetched metadata, a
//! read-only memory mapping used while its bytes are copied into a chunk,
//! and the byte-range bookkeeping that lets one file span several chunks.

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use uuid::Uuid;

use crate::utils::errors::{EngineError, Result};

/// Metadata captured once per source via `fetch_metadata`.
#[derive(Debug, Clone)]
pub struct SourceMetadata {
    pub size: u64,
    /// Last modification time, seconds since the epoch.
    pub modified: i64,
    pub mode: u32,
    pub owner: u32,
    pub group: u32,
    pub is_dir: bool,
}

impl SourceMetadata {
    fn from_path(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                EngineError::PathMissing(path.to_path_buf())
            } else {
                EngineError::Io(err)
            }
        })?;

        let is_dir = meta.is_dir();
        Ok(Self {
            // Directories contribute no data bytes to a chunk.
            size: if is_dir { 0 } else { meta.len() },
            modified: meta.mtime(),
            mode: meta.mode(),
            owner: meta.uid(),
            group: meta.gid(),
            is_dir,
        })
    }
}

/// Byte range of a source currently placed in a chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobRange {
    /// Offset within the original file where this range starts.
    pub file_offset: u64,
    /// Number of bytes of this range carried by the current chunk.
    pub len: u64,
}

/// Shared handle used while a source sits in a chunk's file list and,
/// for split files, continues into the next chunk.
pub type SourceHandle = Arc<Mutex<FileSource>>;

#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    uuid: Uuid,
    /// Position in scan order; the root is always 0.
    scan_id: usize,
    /// Scan id of the containing directory, if any.
    parent: Option<usize>,

    metadata: Option<SourceMetadata>,
    mmap: Option<Mmap>,

    written: bool,
    fully_written: bool,
    range: BlobRange,
}

impl FileSource {
    pub fn new(path: PathBuf, scan_id: usize, parent: Option<usize>) -> Self {
        Self {
            path,
            uuid: Uuid::new_v4(),
            scan_id,
            parent,
            metadata: None,
            mmap: None,
            written: false,
            fully_written: false,
            range: BlobRange::default(),
        }
    }

    pub fn into_handle(self) -> SourceHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn scan_id(&self) -> usize {
        self.scan_id
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Fetch the source's metadata. Idempotent; the first successful call
    /// wins and later calls return the cached value.
    pub fn fetch_metadata(&mut self) -> Result<&SourceMetadata> {
        if self.metadata.is_none() {
            self.metadata = Some(SourceMetadata::from_path(&self.path)?);
        }
        Ok(self.metadata.as_ref().unwrap())
    }

    pub fn metadata(&self) -> Option<&SourceMetadata> {
        self.metadata.as_ref()
    }

    /// Map the whole file read-only in preparation for `copy_range`.
    /// No-op for directories and zero-length files.
    pub fn begin_reading(&mut self) -> Result<()> {
        if self.mmap.is_some() {
            return Ok(());
        }
        let meta = self.fetch_metadata()?.clone();
        if meta.is_dir || meta.size == 0 {
            return Ok(());
        }

        let file = File::open(&self.path)?;
        // Safety: the mapping is read-only and dropped before the job
        // reports completion; concurrent truncation of a source file is
        // outside the backup contract.
        let mmap = unsafe { Mmap::map(&file)? };
        self.mmap = Some(mmap);
        Ok(())
    }

    /// Release the mapping. Idempotent.
    pub fn finished_reading(&mut self) {
        self.mmap = None;
    }

    /// Bytes of the file not yet covered by any placed range.
    pub fn bytes_remaining(&self) -> u64 {
        let size = self.metadata.as_ref().map(|m| m.size).unwrap_or(0);
        size - (self.range.file_offset + self.range.len)
    }

    /// Blocking copy of `dest.len()` bytes starting at `file_offset` out of
    /// the mapping. Marks the source as written.
    pub fn copy_range(&mut self, file_offset: u64, dest: &mut [u8]) -> Result<()> {
        self.written = true;
        if dest.is_empty() {
            return Ok(());
        }

        let mmap = self.mmap.as_ref().ok_or_else(|| {
            EngineError::Format(format!(
                "copy_range on unmapped source {}",
                self.path.display()
            ))
        })?;

        let start = file_offset as usize;
        let end = start + dest.len();
        if end > mmap.len() {
            return Err(EngineError::Format(format!(
                "range {start}..{end} exceeds {} ({} bytes)",
                self.path.display(),
                mmap.len()
            )));
        }

        dest.copy_from_slice(&mmap[start..end]);
        Ok(())
    }

    /// Advance the placed range: the new range starts where the previous
    /// one ended and covers `len` bytes.
    pub fn advance_range(&mut self, len: u64) {
        self.range.file_offset += self.range.len;
        self.range.len = len;
    }

    pub fn range(&self) -> BlobRange {
        self.range
    }

    pub fn was_written(&self) -> bool {
        self.written
    }

    pub fn mark_fully_written(&mut self) {
        self.fully_written = true;
    }

    pub fn is_fully_written(&self) -> bool {
        self.fully_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_fetch_metadata() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world!").unwrap();
        file.flush().unwrap();

        let mut source = FileSource::new(file.path().to_path_buf(), 1, Some(0));
        let meta = source.fetch_metadata()?.clone();

        assert_eq!(meta.size, 12);
        assert!(!meta.is_dir);
        assert!(meta.modified > 0);
        Ok(())
    }

    #[test]
    fn test_fetch_metadata_is_idempotent() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"12345").unwrap();
        file.flush().unwrap();

        let path = file.path().to_path_buf();
        let mut source = FileSource::new(path.clone(), 0, None);
        assert_eq!(source.fetch_metadata()?.size, 5);

        // Deleting the file must not disturb the cached metadata.
        drop(file);
        assert_eq!(source.fetch_metadata()?.size, 5);
        Ok(())
    }

    #[test]
    fn test_missing_path() {
        let mut source =
            FileSource::new(PathBuf::from("/definitely/not/here.bin"), 0, None);
        match source.fetch_metadata() {
            Err(EngineError::PathMissing(_)) => {}
            other => panic!("expected PathMissing, got {other:?}"),
        }
    }

    #[test]
    fn test_directory_has_zero_size() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut source = FileSource::new(dir.path().to_path_buf(), 0, None);
        let meta = source.fetch_metadata()?;
        assert!(meta.is_dir);
        assert_eq!(meta.size, 0);
        Ok(())
    }

    #[test]
    fn test_copy_range_marks_written() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abcdefghij").unwrap();
        file.flush().unwrap();

        let mut source = FileSource::new(file.path().to_path_buf(), 0, None);
        source.begin_reading()?;

        let mut dest = [0u8; 4];
        source.copy_range(3, &mut dest)?;
        assert_eq!(&dest, b"defg");
        assert!(source.was_written());

        source.finished_reading();
        source.finished_reading(); // idempotent
        Ok(())
    }

    #[test]
    fn test_bytes_remaining_follows_range() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 100]).unwrap();
        file.flush().unwrap();

        let mut source = FileSource::new(file.path().to_path_buf(), 0, None);
        source.fetch_metadata()?;
        assert_eq!(source.bytes_remaining(), 100);

        source.advance_range(40);
        assert_eq!(source.range().file_offset, 0);
        assert_eq!(source.bytes_remaining(), 60);

        source.advance_range(60);
        assert_eq!(source.range().file_offset, 40);
        assert_eq!(source.bytes_remaining(), 0);
        Ok(())
    }

    #[test]
    fn test_begin_reading_noop_for_empty_file() -> Result<()> {
        let file = NamedTempFile::new().unwrap();
        let mut source = FileSource::new(file.path().to_path_buf(), 0, None);
        source.begin_reading()?;

        let mut dest = [0u8; 0];
        source.copy_range(0, &mut dest)?;
        assert!(source.was_written());
        Ok(())
    }
}
