//! # Address Space
//!
//! The page-reservation collaborator. The loader asks it to reserve ranges on
//! behalf of a PID, to move bytes in and out of reserved ranges, and to drop
//! everything a PID owns when it retires.
//!
//! [`SparseMemory`] is an in-memory implementation: a page map keyed by page
//! number inside one spinlock. Reserving keeps one small record per 4 KiB page;
//! the page contents are only allocated on the first non-zero write, so a
//! large zero-filled segment costs bookkeeping but no page buffers.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::fmt;
use core::ops::Range;

use spin::Mutex;

use crate::elf::Endian;
use crate::process::Pid;

/// Page granularity of [`SparseMemory`]
pub const PAGE_SIZE: u64 = 4096;

// ============================================================================
// PERMISSIONS
// ============================================================================

bitflags::bitflags! {
    /// Page permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u8 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXECUTE = 1 << 2;

        /// Everything
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Address space failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Access touches a page nobody reserved
    Unmapped {
        /// First unmapped address
        addr: u64,
    },
    /// Page already belongs to another PID
    Conflict {
        /// Page address
        addr: u64,
        /// Current owner
        owner: u32,
    },
    /// Range wraps around the address space
    Overflow {
        /// Start address
        addr: u64,
        /// Length
        len: u64,
    },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmapped { addr } => write!(f, "address 0x{:x} is not reserved", addr),
            Self::Conflict { addr, owner } => {
                write!(f, "page 0x{:x} already reserved by pid {}", addr, owner)
            },
            Self::Overflow { addr, len } => {
                write!(f, "range 0x{:x}+0x{:x} overflows", addr, len)
            },
        }
    }
}

// ============================================================================
// TRAIT
// ============================================================================

/// Flat memory shared by every loaded program
pub trait AddressSpace: Send + Sync {
    /// Reserve `[addr, addr + len)` for `pid`.
    ///
    /// Reserving again over pages `pid` already owns succeeds.
    fn reserve(&self, pid: Pid, addr: u64, len: u64, perms: Permissions)
        -> Result<(), MemoryError>;

    /// Release everything reserved for `pid`; returns the page count released.
    fn release_all(&self, pid: Pid) -> Result<usize, MemoryError>;

    /// Copy `data` to `addr`
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError>;

    /// Copy from `addr` into `buf`
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Set `len` bytes at `addr` to `byte`
    fn fill(&self, addr: u64, len: u64, byte: u8) -> Result<(), MemoryError>;

    /// Read a 64-bit cell in the given byte order
    fn read_u64(&self, addr: u64, endian: Endian) -> Result<u64, MemoryError> {
        let mut cell = [0u8; 8];
        self.read(addr, &mut cell)?;
        Ok(endian.read_u64(cell))
    }

    /// Write a 64-bit cell in the given byte order
    fn write_u64(&self, addr: u64, value: u64, endian: Endian) -> Result<(), MemoryError> {
        self.write(addr, &endian.write_u64(value))
    }
}

// ============================================================================
// SPARSE IMPLEMENTATION
// ============================================================================

struct Page {
    owner: Pid,
    perms: Permissions,
    // Reads as zeros until first written
    data: Option<Box<[u8; PAGE_SIZE as usize]>>,
}

impl Page {
    fn bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE as usize] {
        self.data
            .get_or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]))
    }
}

/// Page-granular sparse memory
pub struct SparseMemory {
    pages: Mutex<BTreeMap<u64, Page>>,
}

fn page_span(addr: u64, len: u64) -> Result<Range<u64>, MemoryError> {
    let end = addr
        .checked_add(len)
        .ok_or(MemoryError::Overflow { addr, len })?;
    if len == 0 {
        return Ok(0..0);
    }
    Ok(addr / PAGE_SIZE..end.div_ceil(PAGE_SIZE))
}

impl SparseMemory {
    /// Create an empty address space
    pub const fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    /// Pages currently reserved by `pid`
    pub fn pages_owned(&self, pid: Pid) -> usize {
        self.pages.lock().values().filter(|p| p.owner == pid).count()
    }

    /// Pages currently reserved by anyone
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Pages whose contents have been allocated
    pub fn resident_pages(&self) -> usize {
        self.pages.lock().values().filter(|p| p.data.is_some()).count()
    }

    /// Owner and permissions of the page holding `addr`
    pub fn page_info(&self, addr: u64) -> Option<(Pid, Permissions)> {
        self.pages
            .lock()
            .get(&(addr / PAGE_SIZE))
            .map(|p| (p.owner, p.perms))
    }

    /// Walk `[addr, addr + len)` page by page, handing each page to `f`
    /// together with the byte range inside it and the offset inside the
    /// caller's buffer.
    fn for_each_chunk(
        &self,
        addr: u64,
        len: u64,
        mut f: impl FnMut(&mut Page, Range<usize>, usize),
    ) -> Result<(), MemoryError> {
        let span = page_span(addr, len)?;
        let mut pages = self.pages.lock();

        // Check the whole range before touching anything
        if let Some(missing) = span.clone().find(|n| !pages.contains_key(n)) {
            return Err(MemoryError::Unmapped {
                addr: (missing * PAGE_SIZE).max(addr),
            });
        }

        let mut cursor = addr;
        let end = addr + len;
        while cursor < end {
            let number = cursor / PAGE_SIZE;
            let in_page = (cursor % PAGE_SIZE) as usize;
            let chunk = ((PAGE_SIZE as usize) - in_page).min((end - cursor) as usize);
            if let Some(page) = pages.get_mut(&number) {
                f(page, in_page..in_page + chunk, (cursor - addr) as usize);
            }
            cursor += chunk as u64;
        }
        Ok(())
    }
}

impl Default for SparseMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for SparseMemory {
    fn reserve(
        &self,
        pid: Pid,
        addr: u64,
        len: u64,
        perms: Permissions,
    ) -> Result<(), MemoryError> {
        let span = page_span(addr, len)?;
        let mut pages = self.pages.lock();

        for number in span.clone() {
            if let Some(page) = pages.get(&number) {
                if page.owner != pid {
                    return Err(MemoryError::Conflict {
                        addr: number * PAGE_SIZE,
                        owner: page.owner.as_u32(),
                    });
                }
            }
        }

        for number in span {
            pages
                .entry(number)
                .and_modify(|page| page.perms |= perms)
                .or_insert_with(|| Page {
                    owner: pid,
                    perms,
                    data: None,
                });
        }
        Ok(())
    }

    fn release_all(&self, pid: Pid) -> Result<usize, MemoryError> {
        let mut pages = self.pages.lock();
        let before = pages.len();
        pages.retain(|_, page| page.owner != pid);
        Ok(before - pages.len())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.for_each_chunk(addr, data.len() as u64, |page, range, at| {
            let src = &data[at..at + range.len()];
            page.bytes_mut()[range].copy_from_slice(src);
        })
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.for_each_chunk(addr, buf.len() as u64, |page, range, at| {
            let dst = &mut buf[at..at + range.len()];
            match &page.data {
                Some(bytes) => dst.copy_from_slice(&bytes[range]),
                None => dst.fill(0),
            }
        })
    }

    fn fill(&self, addr: u64, len: u64, byte: u8) -> Result<(), MemoryError> {
        self.for_each_chunk(addr, len, |page, range, _| {
            if byte != 0 || page.data.is_some() {
                page.bytes_mut()[range].fill(byte);
            }
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u32) -> Pid {
        Pid::new(n)
    }

    #[test]
    fn test_write_read_across_pages() {
        let mem = SparseMemory::new();
        mem.reserve(pid(1), 0x10_0ff0, 0x20, Permissions::RWX).unwrap();
        assert_eq!(mem.pages_owned(pid(1)), 2);

        let data: alloc::vec::Vec<u8> = (0u8..0x20).collect();
        mem.write(0x10_0ff0, &data).unwrap();
        let mut back = [0u8; 0x20];
        mem.read(0x10_0ff0, &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);
    }

    #[test]
    fn test_unmapped_access() {
        let mem = SparseMemory::new();
        mem.reserve(pid(1), 0x1000, 0x1000, Permissions::READ).unwrap();
        assert_eq!(
            mem.write(0x1ff0, &[0u8; 0x20]),
            Err(MemoryError::Unmapped { addr: 0x2000 })
        );
        // Nothing was written on failure
        let mut cell = [0xffu8; 0x10];
        mem.read(0x1ff0, &mut cell).unwrap();
        assert_eq!(cell, [0u8; 0x10]);
    }

    #[test]
    fn test_conflicting_reservation() {
        let mem = SparseMemory::new();
        mem.reserve(pid(1), 0x1000, 0x10, Permissions::READ).unwrap();
        assert_eq!(
            mem.reserve(pid(2), 0x1008, 0x10, Permissions::READ),
            Err(MemoryError::Conflict { addr: 0x1000, owner: 1 })
        );
        // Same owner may reserve again and gains permissions
        mem.reserve(pid(1), 0x1000, 0x10, Permissions::WRITE).unwrap();
        assert_eq!(
            mem.page_info(0x1000),
            Some((pid(1), Permissions::READ | Permissions::WRITE))
        );
    }

    #[test]
    fn test_release_all() {
        let mem = SparseMemory::new();
        mem.reserve(pid(1), 0, 3 * PAGE_SIZE, Permissions::RWX).unwrap();
        mem.reserve(pid(2), 8 * PAGE_SIZE, 1, Permissions::RWX).unwrap();
        assert_eq!(mem.release_all(pid(1)), Ok(3));
        assert_eq!(mem.page_count(), 1);
        assert_eq!(mem.release_all(pid(1)), Ok(0));
    }

    #[test]
    fn test_fill_and_cells() {
        let mem = SparseMemory::new();
        mem.reserve(pid(3), 0x2000, 64, Permissions::RWX).unwrap();
        mem.fill(0x2000, 64, 0x5a).unwrap();
        assert_eq!(mem.read_u64(0x2008, Endian::Little), Ok(0x5a5a_5a5a_5a5a_5a5a));

        mem.write_u64(0x2010, 0x0102_0304_0506_0708, Endian::Big).unwrap();
        let mut raw = [0u8; 8];
        mem.read(0x2010, &mut raw).unwrap();
        assert_eq!(raw, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_pages_allocated_on_first_write() {
        let mem = SparseMemory::new();
        mem.reserve(pid(1), 0, 64 * PAGE_SIZE, Permissions::RWX).unwrap();
        assert_eq!(mem.pages_owned(pid(1)), 64);
        assert_eq!(mem.resident_pages(), 0);

        mem.fill(0, 64 * PAGE_SIZE, 0).unwrap();
        assert_eq!(mem.resident_pages(), 0);

        mem.write(5 * PAGE_SIZE + 8, &[7u8; 4]).unwrap();
        assert_eq!(mem.resident_pages(), 1);
        let mut cell = [0xffu8; 16];
        mem.read(5 * PAGE_SIZE, &mut cell).unwrap();
        assert_eq!(cell, [0, 0, 0, 0, 0, 0, 0, 0, 7, 7, 7, 7, 0, 0, 0, 0]);
        let mut untouched = [0xffu8; 8];
        mem.read(9 * PAGE_SIZE, &mut untouched).unwrap();
        assert_eq!(untouched, [0u8; 8]);
    }

    #[test]
    fn test_overflowing_range() {
        let mem = SparseMemory::new();
        assert_eq!(
            mem.reserve(pid(1), u64::MAX - 4, 16, Permissions::READ),
            Err(MemoryError::Overflow { addr: u64::MAX - 4, len: 16 })
        );
    }
}
