//! # Segment Loading
//!
//! Copies each loadable segment to `base + vaddr` and zero-fills the bytes
//! between its file size and memory size.

use crate::elf::SegmentDescriptor;
use crate::memory::{AddressSpace, Permissions};
use crate::process::ProcessEntry;
use crate::{LoadError, LoadResult};

/// Totals for one image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    /// Loadable segments placed
    pub loaded: usize,
    /// Bytes copied from the image
    pub bytes_copied: u64,
    /// Bytes zero-filled
    pub bytes_zeroed: u64,
}

/// Places segments into an address space
pub struct SegmentLoader<'a> {
    memory: &'a dyn AddressSpace,
}

impl<'a> SegmentLoader<'a> {
    /// Create a loader over `memory`
    pub fn new(memory: &'a dyn AddressSpace) -> Self {
        Self { memory }
    }

    /// Check one segment against the image and the region
    fn check(
        index: usize,
        seg: &SegmentDescriptor,
        image_len: usize,
        entry: &ProcessEntry,
    ) -> LoadResult<()> {
        if seg.memsz < seg.filesz {
            return Err(LoadError::SegmentExceedsMemory { index });
        }
        let file_end = seg.offset.checked_add(seg.filesz);
        if file_end.map_or(true, |end| end > image_len as u64) {
            return Err(LoadError::SegmentDataOutOfBounds { index });
        }
        if !entry.contains(seg.vaddr, seg.memsz) {
            return Err(LoadError::SegmentOutsideRegion { index });
        }
        Ok(())
    }

    /// Load every loadable segment with a non-zero memory size.
    ///
    /// All segments are checked before the first reservation, so a bad
    /// segment anywhere in the table leaves memory untouched.
    pub fn load(
        &self,
        image: &[u8],
        segments: &[SegmentDescriptor],
        entry: &ProcessEntry,
    ) -> LoadResult<SegmentStats> {
        let loadable = || {
            segments
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_loadable() && s.memsz > 0)
        };

        for (index, seg) in loadable() {
            Self::check(index, seg, image.len(), entry)?;
        }

        let mut stats = SegmentStats::default();
        for (index, seg) in loadable() {
            let dest = entry.base() + seg.vaddr;
            diag!(
                entry.verbose,
                Debug,
                "pid {}: segment {} -> 0x{:x} (file 0x{:x}, mem 0x{:x})",
                entry.pid(),
                index,
                dest,
                seg.filesz,
                seg.memsz
            );

            self.memory
                .reserve(entry.pid(), dest, seg.memsz, Permissions::RWX)?;

            if seg.filesz > 0 {
                let start = seg.offset as usize;
                let data = &image[start..start + seg.filesz as usize];
                self.memory.write(dest, data)?;
            }
            let tail = seg.zero_fill();
            if tail > 0 {
                self.memory.fill(dest + seg.filesz, tail, 0)?;
            }

            stats.loaded += 1;
            stats.bytes_copied += seg.filesz;
            stats.bytes_zeroed += tail;
        }
        Ok(stats)
    }
}

// ============================================================================
// TESTS
// ============================================================================
