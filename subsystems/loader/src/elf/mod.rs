//! # ELF Parsing and Structures
//!
//! ELF64 structures as the loader sees them. Every record is decoded from the
//! raw image with the byte order declared in `e_ident[EI_DATA]` into a plain
//! host-order struct, so the rest of the crate never touches packed layouts
//! or foreign-endian fields.

pub mod parser;
pub mod relocations;
pub mod sections;
pub mod symbols;

use alloc::vec::Vec;

use static_assertions::const_assert_eq;

// ============================================================================
// ELF CONSTANTS
// ============================================================================

/// ELF magic bytes
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// Size of `e_ident`
pub const EI_NIDENT: usize = 16;
/// `e_ident` index of the class byte
pub const EI_CLASS: usize = 4;
/// `e_ident` index of the data (byte order) byte
pub const EI_DATA: usize = 5;
/// `e_ident` index of the version byte
pub const EI_VERSION: usize = 6;

/// Current ELF version
pub const EV_CURRENT: u8 = 1;

/// ELF class: 32-bit
pub const ELFCLASS32: u8 = 1;
/// ELF class: 64-bit
pub const ELFCLASS64: u8 = 2;

/// ELF data: little-endian
pub const ELFDATA2LSB: u8 = 1;
/// ELF data: big-endian
pub const ELFDATA2MSB: u8 = 2;

/// ELF type: relocatable
pub const ET_REL: u16 = 1;
/// ELF type: executable
pub const ET_EXEC: u16 = 2;
/// ELF type: shared object
pub const ET_DYN: u16 = 3;

// Program header types
/// Unused entry
pub const PT_NULL: u32 = 0;
/// Loadable segment
pub const PT_LOAD: u32 = 1;
/// Dynamic linking info
pub const PT_DYNAMIC: u32 = 2;
/// Interpreter path
pub const PT_INTERP: u32 = 3;
/// Note section
pub const PT_NOTE: u32 = 4;

// Segment flags
/// Executable
pub const PF_X: u32 = 1;
/// Writable
pub const PF_W: u32 = 2;
/// Readable
pub const PF_R: u32 = 4;

// Record sizes
/// File header size
pub const EHDR_SIZE: usize = 64;
/// Program header entry size
pub const PHDR_SIZE: usize = 56;
/// Section header entry size
pub const SHDR_SIZE: usize = 64;
/// Symbol entry size
pub const SYM_SIZE: usize = 24;
/// Relocation-with-addend entry size
pub const RELA_SIZE: usize = 24;
/// Relocation-without-addend entry size
pub const REL_SIZE: usize = 16;

// Wire layouts, field by field
const_assert_eq!(EHDR_SIZE, EI_NIDENT + 2 + 2 + 4 + 8 + 8 + 8 + 4 + 2 * 6);
const_assert_eq!(PHDR_SIZE, 4 + 4 + 8 * 6);
const_assert_eq!(SHDR_SIZE, 4 + 4 + 8 + 8 + 8 + 8 + 4 + 4 + 8 + 8);
const_assert_eq!(SYM_SIZE, 4 + 1 + 1 + 2 + 8 + 8);
const_assert_eq!(RELA_SIZE, REL_SIZE + 8);

// ============================================================================
// BYTE ORDER
// ============================================================================

/// Byte order of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl Endian {
    /// Byte order named by an `e_ident[EI_DATA]` value.
    ///
    /// Anything other than MSB is treated as little-endian.
    pub fn from_data(data: u8) -> Self {
        if data == ELFDATA2MSB {
            Self::Big
        } else {
            Self::Little
        }
    }

    /// The `e_ident[EI_DATA]` value for this order
    pub fn data(self) -> u8 {
        match self {
            Self::Little => ELFDATA2LSB,
            Self::Big => ELFDATA2MSB,
        }
    }

    /// Decode a 64-bit cell
    pub fn read_u64(self, bytes: [u8; 8]) -> u64 {
        match self {
            Self::Little => u64::from_le_bytes(bytes),
            Self::Big => u64::from_be_bytes(bytes),
        }
    }

    /// Encode a 64-bit cell
    pub fn write_u64(self, value: u64) -> [u8; 8] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }
}

/// Cursor decoding fixed-width fields out of one record.
pub(crate) struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> FieldReader<'a> {
    /// Start reading `len` bytes at `offset`; `None` if the record does not fit.
    pub(crate) fn at(bytes: &'a [u8], offset: usize, len: usize, endian: Endian) -> Option<Self> {
        let end = offset.checked_add(len)?;
        Some(Self {
            bytes: bytes.get(offset..end)?,
            pos: 0,
            endian,
        })
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let out = self.bytes.get(self.pos..self.pos + N)?.try_into().ok()?;
        self.pos += N;
        Some(out)
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    pub(crate) fn u16(&mut self) -> Option<u16> {
        let b = self.take::<2>()?;
        Some(match self.endian {
            Endian::Little => u16::from_le_bytes(b),
            Endian::Big => u16::from_be_bytes(b),
        })
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        let b = self.take::<4>()?;
        Some(match self.endian {
            Endian::Little => u32::from_le_bytes(b),
            Endian::Big => u32::from_be_bytes(b),
        })
    }

    pub(crate) fn u64(&mut self) -> Option<u64> {
        self.take::<8>().map(|b| self.endian.read_u64(b))
    }
}

/// Appends fixed-width fields in a given byte order.
pub(crate) struct FieldWriter {
    buf: Vec<u8>,
    endian: Endian,
}

impl FieldWriter {
    pub(crate) fn new(endian: Endian, capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            endian,
        }
    }

    pub(crate) fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    pub(crate) fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub(crate) fn u16(&mut self, v: u16) -> &mut Self {
        match self.endian {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
        self
    }

    pub(crate) fn u32(&mut self, v: u32) -> &mut Self {
        match self.endian {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
        self
    }

    pub(crate) fn u64(&mut self, v: u64) -> &mut Self {
        let b = self.endian.write_u64(v);
        self.buf.extend_from_slice(&b);
        self
    }

    pub(crate) fn finish(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.buf)
    }
}

// ============================================================================
// FILE HEADER
// ============================================================================

/// ELF64 file header, host byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// Magic number and other info (never byte-swapped)
    pub ident: [u8; EI_NIDENT],
    /// Object file type
    pub e_type: u16,
    /// Architecture
    pub machine: u16,
    /// Object file version
    pub version: u32,
    /// Entry point, relative to the load base
    pub entry: u64,
    /// Program header table file offset
    pub phoff: u64,
    /// Section header table file offset
    pub shoff: u64,
    /// Processor-specific flags
    pub flags: u32,
    /// ELF header size in bytes
    pub ehsize: u16,
    /// Program header table entry size
    pub phentsize: u16,
    /// Program header table entry count
    pub phnum: u16,
    /// Section header table entry size
    pub shentsize: u16,
    /// Section header table entry count
    pub shnum: u16,
    /// Section name string table index
    pub shstrndx: u16,
}

impl ImageHeader {
    /// Decode the header at the start of `bytes`; `None` if it is too short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let ident: [u8; EI_NIDENT] = bytes.get(..EI_NIDENT)?.try_into().ok()?;
        let endian = Endian::from_data(ident[EI_DATA]);
        let mut r = FieldReader::at(bytes, EI_NIDENT, EHDR_SIZE - EI_NIDENT, endian)?;
        Some(Self {
            ident,
            e_type: r.u16()?,
            machine: r.u16()?,
            version: r.u32()?,
            entry: r.u64()?,
            phoff: r.u64()?,
            shoff: r.u64()?,
            flags: r.u32()?,
            ehsize: r.u16()?,
            phentsize: r.u16()?,
            phnum: r.u16()?,
            shentsize: r.u16()?,
            shnum: r.u16()?,
            shstrndx: r.u16()?,
        })
    }

    /// Encode back into the byte order declared by `ident`
    pub fn encode(&self) -> [u8; EHDR_SIZE] {
        let mut w = FieldWriter::new(self.endian(), EHDR_SIZE);
        w.bytes(&self.ident)
            .u16(self.e_type)
            .u16(self.machine)
            .u32(self.version)
            .u64(self.entry)
            .u64(self.phoff)
            .u64(self.shoff)
            .u32(self.flags)
            .u16(self.ehsize)
            .u16(self.phentsize)
            .u16(self.phnum)
            .u16(self.shentsize)
            .u16(self.shnum)
            .u16(self.shstrndx);
        let mut out = [0u8; EHDR_SIZE];
        out.copy_from_slice(&w.finish());
        out
    }

    /// Byte order declared by the image
    pub fn endian(&self) -> Endian {
        Endian::from_data(self.ident[EI_DATA])
    }

    /// `e_ident[EI_CLASS]`
    pub fn class(&self) -> u8 {
        self.ident[EI_CLASS]
    }

    /// `e_ident[EI_DATA]`
    pub fn data(&self) -> u8 {
        self.ident[EI_DATA]
    }

    /// `e_ident[EI_VERSION]`
    pub fn ident_version(&self) -> u8 {
        self.ident[EI_VERSION]
    }

    /// Check if this is a static executable
    pub fn is_executable(&self) -> bool {
        self.e_type == ET_EXEC
    }
}

// ============================================================================
// PROGRAM HEADERS
// ============================================================================

/// ELF64 program header, host byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Segment type
    pub p_type: u32,
    /// Segment flags
    pub flags: u32,
    /// Segment file offset
    pub offset: u64,
    /// Segment address, relative to the load base
    pub vaddr: u64,
    /// Segment physical address
    pub paddr: u64,
    /// Segment size in file
    pub filesz: u64,
    /// Segment size in memory
    pub memsz: u64,
    /// Segment alignment
    pub align: u64,
}

impl SegmentDescriptor {
    /// Decode the entry at `offset`
    pub fn decode(bytes: &[u8], offset: usize, endian: Endian) -> Option<Self> {
        let mut r = FieldReader::at(bytes, offset, PHDR_SIZE, endian)?;
        Some(Self {
            p_type: r.u32()?,
            flags: r.u32()?,
            offset: r.u64()?,
            vaddr: r.u64()?,
            paddr: r.u64()?,
            filesz: r.u64()?,
            memsz: r.u64()?,
            align: r.u64()?,
        })
    }

    /// Encode in the given byte order
    pub fn encode(&self, endian: Endian) -> Vec<u8> {
        FieldWriter::new(endian, PHDR_SIZE)
            .u32(self.p_type)
            .u32(self.flags)
            .u64(self.offset)
            .u64(self.vaddr)
            .u64(self.paddr)
            .u64(self.filesz)
            .u64(self.memsz)
            .u64(self.align)
            .finish()
    }

    /// Check if this is a loadable segment
    pub fn is_loadable(&self) -> bool {
        self.p_type == PT_LOAD
    }

    /// Check if executable
    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }

    /// Check if writable
    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    /// Bytes past the file data that must be zero-filled
    pub fn zero_fill(&self) -> u64 {
        self.memsz.saturating_sub(self.filesz)
    }
}

// ============================================================================
// TESTS
// ============================================================================
