//! # ELF Sections
//!
//! Section header decoding and string table access.

use alloc::vec::Vec;

use super::*;
use crate::{LoadError, LoadResult};

// Section types
/// Null section
pub const SHT_NULL: u32 = 0;
/// Program data
pub const SHT_PROGBITS: u32 = 1;
/// Symbol table
pub const SHT_SYMTAB: u32 = 2;
/// String table
pub const SHT_STRTAB: u32 = 3;
/// Relocation entries with addends
pub const SHT_RELA: u32 = 4;
/// BSS
pub const SHT_NOBITS: u32 = 8;
/// Relocation entries (no addends)
pub const SHT_REL: u32 = 9;
/// Dynamic symbol table
pub const SHT_DYNSYM: u32 = 11;

/// Section kinds the loader acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Unused header
    Null,
    /// Program data
    ProgBits,
    /// Uninitialized data
    NoBits,
    /// Static symbol table
    SymbolTable,
    /// Dynamic symbol table
    DynamicSymbolTable,
    /// String table
    StringTable,
    /// Relocations with explicit addends
    RelocationWithAddend,
    /// Relocations with addends stored at the target
    Relocation,
    /// Anything else
    Other(u32),
}

impl SectionKind {
    /// Classify a raw `sh_type`
    pub fn from_raw(sh_type: u32) -> Self {
        match sh_type {
            SHT_NULL => Self::Null,
            SHT_PROGBITS => Self::ProgBits,
            SHT_NOBITS => Self::NoBits,
            SHT_SYMTAB => Self::SymbolTable,
            SHT_DYNSYM => Self::DynamicSymbolTable,
            SHT_STRTAB => Self::StringTable,
            SHT_RELA => Self::RelocationWithAddend,
            SHT_REL => Self::Relocation,
            other => Self::Other(other),
        }
    }

    /// Entry size a table of this kind must declare
    pub fn entry_size(self) -> Option<u64> {
        match self {
            Self::SymbolTable | Self::DynamicSymbolTable => Some(SYM_SIZE as u64),
            Self::RelocationWithAddend => Some(RELA_SIZE as u64),
            Self::Relocation => Some(REL_SIZE as u64),
            _ => None,
        }
    }
}

/// ELF64 section header, host byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionDescriptor {
    /// Position in the section header table
    pub index: u16,
    /// Section name (string table offset)
    pub name: u32,
    /// Section type
    pub sh_type: u32,
    /// Section flags
    pub flags: u64,
    /// Section address
    pub addr: u64,
    /// Section file offset
    pub offset: u64,
    /// Section size
    pub size: u64,
    /// Link to another section
    pub link: u32,
    /// Additional info
    pub info: u32,
    /// Alignment
    pub addralign: u64,
    /// Entry size if section holds table
    pub entsize: u64,
}

impl SectionDescriptor {
    /// Decode the header at `offset`
    pub fn decode(bytes: &[u8], offset: usize, endian: Endian, index: u16) -> Option<Self> {
        let mut r = FieldReader::at(bytes, offset, SHDR_SIZE, endian)?;
        Some(Self {
            index,
            name: r.u32()?,
            sh_type: r.u32()?,
            flags: r.u64()?,
            addr: r.u64()?,
            offset: r.u64()?,
            size: r.u64()?,
            link: r.u32()?,
            info: r.u32()?,
            addralign: r.u64()?,
            entsize: r.u64()?,
        })
    }

    /// Encode in the given byte order
    pub fn encode(&self, endian: Endian) -> Vec<u8> {
        FieldWriter::new(endian, SHDR_SIZE)
            .u32(self.name)
            .u32(self.sh_type)
            .u64(self.flags)
            .u64(self.addr)
            .u64(self.offset)
            .u64(self.size)
            .u32(self.link)
            .u32(self.info)
            .u64(self.addralign)
            .u64(self.entsize)
            .finish()
    }

    /// Section kind
    pub fn kind(&self) -> SectionKind {
        SectionKind::from_raw(self.sh_type)
    }

    /// Check the declared entry size against the kind.
    ///
    /// Sections whose kind has no fixed entry size always pass.
    pub fn check_entry_size(&self) -> LoadResult<()> {
        match self.kind().entry_size() {
            Some(expected) if expected != self.entsize => Err(LoadError::SectionSizeMismatch {
                section: self.index,
                expected,
                actual: self.entsize,
            }),
            _ => Ok(()),
        }
    }

    /// Number of entries, for table sections
    pub fn entry_count(&self) -> usize {
        if self.entsize == 0 {
            0
        } else {
            (self.size / self.entsize) as usize
        }
    }

    /// Section contents inside `image`
    pub fn data<'a>(&self, image: &'a [u8]) -> LoadResult<&'a [u8]> {
        let start = self.offset as usize;
        let end = self
            .offset
            .checked_add(self.size)
            .ok_or(LoadError::SectionDataOutOfBounds(self.index))?;
        image
            .get(start..end as usize)
            .ok_or(LoadError::SectionDataOutOfBounds(self.index))
    }
}

/// Decode the whole section header table.
///
/// An image without a table yields an empty list. A wrong `e_shentsize`
/// yields [`LoadError::SectionSizeMismatch`] for section 0, which callers
/// treat as "nothing to scan".
pub fn section_table(bytes: &[u8], header: &ImageHeader) -> LoadResult<Vec<SectionDescriptor>> {
    if header.shoff == 0 || header.shnum == 0 {
        return Ok(Vec::new());
    }
    if header.shentsize as usize != SHDR_SIZE {
        return Err(LoadError::SectionSizeMismatch {
            section: 0,
            expected: SHDR_SIZE as u64,
            actual: header.shentsize as u64,
        });
    }

    let end = (header.shnum as u64)
        .checked_mul(SHDR_SIZE as u64)
        .and_then(|len| len.checked_add(header.shoff));
    if end.map_or(true, |end| end > bytes.len() as u64) {
        return Err(LoadError::SectionTableOutOfBounds);
    }

    let endian = header.endian();
    (0..header.shnum)
        .map(|i| {
            let offset = header.shoff as usize + i as usize * SHDR_SIZE;
            SectionDescriptor::decode(bytes, offset, endian, i)
                .ok_or(LoadError::SectionTableOutOfBounds)
        })
        .collect()
}

/// NUL-terminated string pool
#[derive(Debug, Clone, Copy)]
pub struct StringTable<'a> {
    data: &'a [u8],
}

impl<'a> StringTable<'a> {
    /// Wrap raw section contents
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Bytes of the string starting at `offset`, without the terminator.
    ///
    /// An unterminated tail is returned as-is.
    pub fn get(&self, offset: u32) -> Option<&'a [u8]> {
        let tail = self.data.get(offset as usize..)?;
        let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Some(&tail[..len])
    }
}

// ============================================================================
// TESTS
// ============================================================================
