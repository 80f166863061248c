//! On-media chunk layout.
//!
//! A chunk image is a contiguous little-endian byte buffer with three
//! regions: a fixed header, a packed table of per-file entries, and a blob
//! area holding raw file bytes at page-aligned offsets. One chunk is written
//! to the medium as a single record, terminated by a file mark.

use tracing::warn;
use uuid::Uuid;

use crate::utils::errors::{EngineError, Result};

/// Current header version.
pub const CHUNK_FORMAT_VERSION: u32 = 0x0001_0000;

/// Blob offsets and the header area are aligned to this.
pub const PAGE_SIZE: u64 = 4096;

/// Size of the zeroed expansion area inside the fixed header.
pub const HEADER_RESERVED_LEN: usize = 0x4000;

/// Total fixed header length: version (4) + job uuid (16) + chunk index (8)
/// + chunk length (8) + encryption method (8) + encryption IV (32)
/// + reserved (16384) + entry count (4).
pub const HEADER_LEN: usize = 4 + 16 + 8 + 8 + 8 + 32 + HEADER_RESERVED_LEN + 4;

/// Fixed portion of a file entry, before the name bytes.
pub const ENTRY_FIXED_LEN: usize = 16 + 2 + 8 + 8 + 4 + 4 + 4 + 4 + 8 + 8 + 8 + 4;

/// Encryption method tag for cleartext chunks.
pub const ENCRYPTION_METHOD_NONE: [u8; 8] = *b"NONE    ";

pub const ENTRY_TYPE_FILE: u16 = 0x0001;
pub const ENTRY_TYPE_DIRECTORY: u16 = 0x1000;

/// Byte offsets of the fields the post-processor stamps after sealing.
pub const HEADER_JOB_UUID_OFFSET: usize = 4;
pub const HEADER_CHUNK_INDEX_OFFSET: usize = 20;

const HEADER_NUM_ENTRIES_OFFSET: usize = HEADER_LEN - 4;

const CRC32C: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// CRC-32C (Castagnoli) over `data`, as stored in entry checksum fields.
pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// Round `n` up to the next page boundary.
pub fn page_align(n: u64) -> u64 {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Fixed chunk header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u32,
    pub job_uuid: Uuid,
    pub chunk_index: u64,
    /// Total length of the chunk image, including this header.
    pub chunk_len: u64,
    pub encryption_method: [u8; 8],
    pub encryption_iv: [u8; 32],
    pub num_entries: u32,
}

impl ChunkHeader {
    /// A cleartext header with identity fields still unset; the
    /// post-processor stamps the job uuid and chunk index later.
    pub fn new(chunk_len: u64, num_entries: u32) -> Self {
        Self {
            version: CHUNK_FORMAT_VERSION,
            job_uuid: Uuid::nil(),
            chunk_index: 0,
            chunk_len,
            encryption_method: ENCRYPTION_METHOD_NONE,
            encryption_iv: [0u8; 32],
            num_entries,
        }
    }

    /// Serialize into the first [`HEADER_LEN`] bytes of `buf`. The reserved
    /// region is zero-filled.
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_LEN);

        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..20].copy_from_slice(self.job_uuid.as_bytes());
        buf[20..28].copy_from_slice(&self.chunk_index.to_le_bytes());
        buf[28..36].copy_from_slice(&self.chunk_len.to_le_bytes());
        buf[36..44].copy_from_slice(&self.encryption_method);
        buf[44..76].copy_from_slice(&self.encryption_iv);
        buf[76..HEADER_NUM_ENTRIES_OFFSET].fill(0);
        buf[HEADER_NUM_ENTRIES_OFFSET..HEADER_LEN]
            .copy_from_slice(&self.num_entries.to_le_bytes());
    }

    /// Parse a header from the start of `buf`.
    ///
    /// An unknown version is reported with a warning and parsing continues
    /// under the known layout; it is not an error.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(EngineError::Format(format!(
                "image too short for chunk header: {} bytes",
                buf.len()
            )));
        }

        let version = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if version != CHUNK_FORMAT_VERSION {
            let err = EngineError::UnknownFormatVersion(version);
            warn!(%err, "continuing with known layout");
        }

        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&buf[4..20]);
        let mut method = [0u8; 8];
        method.copy_from_slice(&buf[36..44]);
        let mut iv = [0u8; 32];
        iv.copy_from_slice(&buf[44..76]);

        Ok(Self {
            version,
            job_uuid: Uuid::from_bytes(uuid_bytes),
            chunk_index: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            chunk_len: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
            encryption_method: method,
            encryption_iv: iv,
            num_entries: u32::from_le_bytes(
                buf[HEADER_NUM_ENTRIES_OFFSET..HEADER_LEN].try_into().unwrap(),
            ),
        })
    }
}

/// Per-file entry in the chunk's entry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub file_uuid: Uuid,
    pub kind: u16,
    pub time_modified: i64,
    /// Full original file length, not just the part carried in this chunk.
    pub size: u64,
    pub owner: u32,
    pub group: u32,
    pub mode: u32,
    /// CRC-32C over the `blob_len` bytes this entry contributes.
    pub checksum: u32,
    /// Page-aligned offset of the blob within the chunk image.
    pub blob_start: u64,
    pub blob_len: u64,
    /// Offset within the original file where this blob belongs.
    pub blob_file_offset: u64,
    pub name: String,
}

impl FileEntry {
    pub fn is_directory(&self) -> bool {
        self.kind == ENTRY_TYPE_DIRECTORY
    }

    /// A partial entry carries only a sub-range of the original file;
    /// sibling entries with the same `file_uuid` live in adjacent chunks.
    pub fn is_partial(&self) -> bool {
        self.blob_len < self.size
    }

    /// Serialized length: fixed fields plus the NUL-terminated name.
    pub fn encoded_len(&self) -> usize {
        encoded_entry_len(&self.name)
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= self.encoded_len());

        buf[0..16].copy_from_slice(self.file_uuid.as_bytes());
        buf[16..18].copy_from_slice(&self.kind.to_le_bytes());
        buf[18..26].copy_from_slice(&self.time_modified.to_le_bytes());
        buf[26..34].copy_from_slice(&self.size.to_le_bytes());
        buf[34..38].copy_from_slice(&self.owner.to_le_bytes());
        buf[38..42].copy_from_slice(&self.group.to_le_bytes());
        buf[42..46].copy_from_slice(&self.mode.to_le_bytes());
        buf[46..50].copy_from_slice(&self.checksum.to_le_bytes());
        buf[50..58].copy_from_slice(&self.blob_start.to_le_bytes());
        buf[58..66].copy_from_slice(&self.blob_len.to_le_bytes());
        buf[66..74].copy_from_slice(&self.blob_file_offset.to_le_bytes());

        let name_len = (self.name.len() + 1) as u32;
        buf[74..78].copy_from_slice(&name_len.to_le_bytes());
        buf[78..78 + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[78 + self.name.len()] = 0;
    }

    /// Parse one entry from the start of `buf`; returns the entry and the
    /// number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < ENTRY_FIXED_LEN {
            return Err(EngineError::Format(
                "truncated file entry".to_string(),
            ));
        }

        let name_len = u32::from_le_bytes(buf[74..78].try_into().unwrap()) as usize;
        if name_len == 0 || buf.len() < ENTRY_FIXED_LEN + name_len {
            return Err(EngineError::Format(format!(
                "file entry name of {name_len} bytes exceeds image bounds"
            )));
        }

        // The name is stored NUL-terminated.
        let name_bytes = &buf[ENTRY_FIXED_LEN..ENTRY_FIXED_LEN + name_len - 1];
        let name = std::str::from_utf8(name_bytes)
            .map_err(|e| EngineError::Format(format!("entry name is not UTF-8: {e}")))?
            .to_string();

        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&buf[0..16]);

        let entry = Self {
            file_uuid: Uuid::from_bytes(uuid_bytes),
            kind: u16::from_le_bytes(buf[16..18].try_into().unwrap()),
            time_modified: i64::from_le_bytes(buf[18..26].try_into().unwrap()),
            size: u64::from_le_bytes(buf[26..34].try_into().unwrap()),
            owner: u32::from_le_bytes(buf[34..38].try_into().unwrap()),
            group: u32::from_le_bytes(buf[38..42].try_into().unwrap()),
            mode: u32::from_le_bytes(buf[42..46].try_into().unwrap()),
            checksum: u32::from_le_bytes(buf[46..50].try_into().unwrap()),
            blob_start: u64::from_le_bytes(buf[50..58].try_into().unwrap()),
            blob_len: u64::from_le_bytes(buf[58..66].try_into().unwrap()),
            blob_file_offset: u64::from_le_bytes(buf[66..74].try_into().unwrap()),
            name,
        };

        Ok((entry, ENTRY_FIXED_LEN + name_len))
    }
}

/// Serialized length of an entry carrying `name`, including the NUL.
pub fn encoded_entry_len(name: &str) -> usize {
    ENTRY_FIXED_LEN + name.len() + 1
}

/// A fully parsed chunk image.
#[derive(Debug)]
pub struct ParsedChunk {
    pub header: ChunkHeader,
    pub entries: Vec<FileEntry>,
}

impl ParsedChunk {
    /// The blob bytes belonging to `entry`, sliced out of `image`.
    pub fn blob_bytes<'a>(&self, image: &'a [u8], entry: &FileEntry) -> Result<&'a [u8]> {
        let start = entry.blob_start as usize;
        let end = start
            .checked_add(entry.blob_len as usize)
            .ok_or_else(|| EngineError::Format("blob range overflows".to_string()))?;
        if end > image.len() {
            return Err(EngineError::Format(format!(
                "blob range {}..{} exceeds image of {} bytes",
                start,
                end,
                image.len()
            )));
        }
        Ok(&image[start..end])
    }

    /// Recompute an entry's CRC-32C and compare it against the stored
    /// checksum. A mismatch is an error the caller may choose to treat as
    /// a report rather than a failure; extraction tooling proceeds anyway.
    pub fn verify_entry_checksum(&self, image: &[u8], entry: &FileEntry) -> Result<()> {
        let computed = crc32c(self.blob_bytes(image, entry)?);
        if computed != entry.checksum {
            return Err(EngineError::ChecksumMismatch {
                name: entry.name.clone(),
                computed,
                stored: entry.checksum,
            });
        }
        Ok(())
    }
}

/// Parse the header and full entry table of a chunk image.
pub fn parse_chunk(image: &[u8]) -> Result<ParsedChunk> {
    let header = ChunkHeader::decode(image)?;

    let mut entries = Vec::with_capacity(header.num_entries as usize);
    let mut offset = HEADER_LEN;
    for _ in 0..header.num_entries {
        let (entry, consumed) = FileEntry::decode(&image[offset..])?;
        offset += consumed;
        entries.push(entry);
    }

    Ok(ParsedChunk { header, entries })
}
