//! # ELF Symbols
//!
//! Symbol table handling and recognition of the staging-area symbols.

use alloc::vec::Vec;

use super::sections::{SectionDescriptor, StringTable};
use super::*;
use crate::{LoadError, LoadResult, ROOM_ARGV, ROOM_ENV};

/// Symbol binding types
pub mod binding {
    /// Local to the defining object
    pub const STB_LOCAL: u8 = 0;
    /// Visible to every object
    pub const STB_GLOBAL: u8 = 1;
    /// Global with lower precedence
    pub const STB_WEAK: u8 = 2;
}

/// Symbol types
pub mod stype {
    /// Unspecified
    pub const STT_NOTYPE: u8 = 0;
    /// Data object
    pub const STT_OBJECT: u8 = 1;
    /// Function
    pub const STT_FUNC: u8 = 2;
    /// Section
    pub const STT_SECTION: u8 = 3;
    /// Source file name
    pub const STT_FILE: u8 = 4;
}

/// Undefined section index
pub const SHN_UNDEF: u16 = 0;

/// ELF64 symbol, host byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name (string table offset)
    pub name: u32,
    /// Symbol type and binding
    pub info: u8,
    /// Symbol visibility
    pub other: u8,
    /// Section index
    pub shndx: u16,
    /// Symbol value, relative to the load base
    pub value: u64,
    /// Symbol size
    pub size: u64,
}

impl Symbol {
    /// The reserved symbol at index 0
    pub const NULL: Self = Self {
        name: 0,
        info: 0,
        other: 0,
        shndx: SHN_UNDEF,
        value: 0,
        size: 0,
    };

    /// Decode the entry at `offset`
    pub fn decode(bytes: &[u8], offset: usize, endian: Endian) -> Option<Self> {
        let mut r = FieldReader::at(bytes, offset, SYM_SIZE, endian)?;
        Some(Self {
            name: r.u32()?,
            info: r.u8()?,
            other: r.u8()?,
            shndx: r.u16()?,
            value: r.u64()?,
            size: r.u64()?,
        })
    }

    /// Encode in the given byte order
    pub fn encode(&self, endian: Endian) -> Vec<u8> {
        FieldWriter::new(endian, SYM_SIZE)
            .u32(self.name)
            .u8(self.info)
            .u8(self.other)
            .u16(self.shndx)
            .u64(self.value)
            .u64(self.size)
            .finish()
    }

    /// Get symbol binding
    pub fn binding(&self) -> u8 {
        self.info >> 4
    }

    /// Get symbol type
    pub fn stype(&self) -> u8 {
        self.info & 0xf
    }

    /// Check if defined
    pub fn is_defined(&self) -> bool {
        self.shndx != SHN_UNDEF
    }
}

/// Staging areas an image can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    /// Argument vector
    Arguments,
    /// Environment block
    Environment,
}

/// Recognize a staging-area symbol by exact name
pub fn classify(name: &[u8]) -> Option<RoomKind> {
    if name == ROOM_ARGV.as_bytes() {
        Some(RoomKind::Arguments)
    } else if name == ROOM_ENV.as_bytes() {
        Some(RoomKind::Environment)
    } else {
        None
    }
}

/// A symbol table section together with its linked string table
pub struct SymbolTable<'a> {
    data: &'a [u8],
    endian: Endian,
    strings: Option<StringTable<'a>>,
}

impl<'a> SymbolTable<'a> {
    /// Open the symbol table at `sections[index]`.
    ///
    /// A missing or out-of-range string table link leaves symbols nameless.
    pub fn open(
        image: &'a [u8],
        sections: &[SectionDescriptor],
        index: usize,
        endian: Endian,
    ) -> LoadResult<Self> {
        let section = sections
            .get(index)
            .ok_or(LoadError::SectionDataOutOfBounds(index as u16))?;
        let data = section.data(image)?;
        let strings = match sections.get(section.link as usize) {
            Some(linked) if section.link != 0 => Some(StringTable::new(linked.data(image)?)),
            _ => None,
        };
        Ok(Self {
            data,
            endian,
            strings,
        })
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.data.len() / SYM_SIZE
    }

    /// Check whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Symbol at `index`; index 0 is the null symbol.
    pub fn get(&self, index: u32) -> LoadResult<Symbol> {
        if index == 0 {
            return Ok(Symbol::NULL);
        }
        Symbol::decode(self.data, index as usize * SYM_SIZE, self.endian)
            .ok_or(LoadError::SymbolIndexOutOfBounds(index))
    }

    /// Name bytes of a symbol
    pub fn name(&self, symbol: &Symbol) -> Option<&'a [u8]> {
        self.strings?.get(symbol.name)
    }

    /// Iterate over every entry, null symbol included
    pub fn iter(&self) -> impl Iterator<Item = Symbol> + '_ {
        (0..self.len()).filter_map(move |i| Symbol::decode(self.data, i * SYM_SIZE, self.endian))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::parser::normalize;
    use crate::elf::sections::{section_table, SectionKind};
    use crate::testing::{ImageBuilder, SegmentSpec};

    #[test]
    fn test_classify_exact_names() {
        assert_eq!(classify(b"__loader_room_argv"), Some(RoomKind::Arguments));
        assert_eq!(classify(b"__loader_room_env"), Some(RoomKind::Environment));
        assert_eq!(classify(b"__loader_room_envx"), None);
        assert_eq!(classify(b"main"), None);
    }

    #[test]
    fn test_symbol_info_fields() {
        let sym = Symbol {
            info: (binding::STB_GLOBAL << 4) | stype::STT_OBJECT,
            shndx: 1,
            ..Symbol::NULL
        };
        assert_eq!(sym.binding(), binding::STB_GLOBAL);
        assert_eq!(sym.stype(), stype::STT_OBJECT);
        assert!(sym.is_defined());
        assert!(!Symbol::NULL.is_defined());
    }

    #[test]
    fn test_symbol_table_lookup() {
        for endian in [Endian::Little, Endian::Big] {
            let image = ImageBuilder::new()
                .endian(endian)
                .segment(SegmentSpec::new(0, alloc::vec![0; 128], 128))
                .symbol("__loader_room_env", 0x40, 0x40)
                .symbol("start", 0x8, 0)
                .build();
            let header = normalize(&image).unwrap();
            let sections = section_table(&image, &header).unwrap();
            let idx = sections
                .iter()
                .position(|s| s.kind() == SectionKind::SymbolTable)
                .unwrap();
            let table = SymbolTable::open(&image, &sections, idx, endian).unwrap();

            assert_eq!(table.len(), 3);
            let env = table.get(1).unwrap();
            assert_eq!(env.value, 0x40);
            assert_eq!(table.name(&env), Some(&b"__loader_room_env"[..]));
            assert_eq!(table.get(2).unwrap().value, 0x8);
            assert_eq!(table.get(0).unwrap(), Symbol::NULL);
            assert_eq!(table.get(3), Err(LoadError::SymbolIndexOutOfBounds(3)));
            assert_eq!(table.iter().count(), 3);
        }
    }
}
