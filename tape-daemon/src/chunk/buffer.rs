//! Anonymous memory backing for chunk images.
//!
//! Chunk buffers prefer huge-page mappings. When a huge-page allocation
//! fails once, the process is assumed to be unable to service such
//! allocations until restart and all subsequent buffers use regular pages.

use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::{MmapMut, MmapOptions};
use tracing::{error, warn};

/// Flipped monotonically from true to false on the first failed huge-page
/// allocation. A stale read merely wastes one allocation attempt.
static HUGEPAGES_AVAILABLE: AtomicBool = AtomicBool::new(true);

#[cfg(target_os = "linux")]
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Zero-initialized, page-backed buffer holding one chunk image.
pub struct ChunkBuffer {
    map: MmapMut,
    len: usize,
}

impl ChunkBuffer {
    /// Allocate `len` bytes. Falls back from huge pages to regular pages;
    /// if regular pages also fail the process aborts, since no part of the
    /// pipeline can make progress without chunk backing.
    pub fn allocate(len: usize) -> Self {
        #[cfg(target_os = "linux")]
        if HUGEPAGES_AVAILABLE.load(Ordering::Relaxed) {
            // MAP_HUGETLB requires a huge-page-multiple mapping length.
            let map_len = len.div_ceil(HUGE_PAGE_SIZE) * HUGE_PAGE_SIZE;
            match MmapOptions::new().len(map_len).huge(None).map_anon() {
                Ok(map) => return Self { map, len },
                Err(err) => {
                    warn!(
                        len,
                        %err,
                        "huge-page chunk allocation failed, using regular pages from now on"
                    );
                    HUGEPAGES_AVAILABLE.store(false, Ordering::Relaxed);
                }
            }
        }

        match MmapOptions::new().len(len).map_anon() {
            Ok(map) => Self { map, len },
            Err(err) => {
                error!(len, %err, "chunk backing allocation failed, aborting");
                std::process::abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_zero_filled() {
        let buf = ChunkBuffer::allocate(8192);
        assert_eq!(buf.len(), 8192);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocate_is_writable() {
        let mut buf = ChunkBuffer::allocate(4096);
        buf.as_mut_slice()[100] = 0x5A;
        assert_eq!(buf.as_slice()[100], 0x5A);
        assert_eq!(buf.as_slice()[101], 0);
    }
}
