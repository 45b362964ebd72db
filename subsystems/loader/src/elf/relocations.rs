//! # ELF Relocations
//!
//! Relocation entries in both forms. Entries with an explicit addend carry it
//! in the record; the others take it from the 64-bit cell they patch.

use alloc::vec::Vec;

use super::*;

/// Where an entry's addend comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddendForm {
    /// Stored in the entry (`SHT_RELA`)
    Explicit,
    /// Stored at the target address (`SHT_REL`)
    Implicit,
}

impl AddendForm {
    /// Record size for this form
    pub fn entry_size(self) -> usize {
        match self {
            Self::Explicit => RELA_SIZE,
            Self::Implicit => REL_SIZE,
        }
    }
}

/// Relocation classes that are counted separately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// Global data pointer
    GlobalData,
    /// Base-relative adjustment
    BaseRelative,
    /// Procedure linkage slot
    JumpSlot,
    /// Any other type
    Other(u32),
}

/// ELF64 relocation entry, host byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    /// Target offset from the load base
    pub offset: u64,
    /// Symbol index and type
    pub info: u64,
    /// Explicit addend, `None` for the implicit form
    pub addend: Option<i64>,
}

impl RelocationEntry {
    /// Pack a symbol index and type into `r_info`
    pub const fn make_info(sym: u32, r_type: u32) -> u64 {
        ((sym as u64) << 32) | r_type as u64
    }

    /// Get symbol index
    pub fn sym(&self) -> u32 {
        (self.info >> 32) as u32
    }

    /// Get relocation type
    pub fn r_type(&self) -> u32 {
        (self.info & 0xffff_ffff) as u32
    }

    /// Addend form of this entry
    pub fn form(&self) -> AddendForm {
        if self.addend.is_some() {
            AddendForm::Explicit
        } else {
            AddendForm::Implicit
        }
    }

    /// Decode the entry at `offset`
    pub fn decode(bytes: &[u8], offset: usize, endian: Endian, form: AddendForm) -> Option<Self> {
        let mut r = FieldReader::at(bytes, offset, form.entry_size(), endian)?;
        let r_offset = r.u64()?;
        let info = r.u64()?;
        let addend = match form {
            AddendForm::Explicit => Some(r.u64()? as i64),
            AddendForm::Implicit => None,
        };
        Some(Self {
            offset: r_offset,
            info,
            addend,
        })
    }

    /// Encode in the given byte order
    pub fn encode(&self, endian: Endian) -> Vec<u8> {
        let mut w = FieldWriter::new(endian, self.form().entry_size());
        w.u64(self.offset).u64(self.info);
        if let Some(addend) = self.addend {
            w.u64(addend as u64);
        }
        w.finish()
    }

    /// Value written to the target cell
    pub fn resolve(addend: i64, base: u64, symbol_value: u64) -> u64 {
        (addend as u64).wrapping_add(base).wrapping_add(symbol_value)
    }
}

/// Iterator over the entries of one relocation section
pub struct RelocationIter<'a> {
    data: &'a [u8],
    endian: Endian,
    form: AddendForm,
    index: usize,
}

impl<'a> RelocationIter<'a> {
    /// Walk `data` as a packed array of `form` records
    pub fn new(data: &'a [u8], endian: Endian, form: AddendForm) -> Self {
        Self {
            data,
            endian,
            form,
            index: 0,
        }
    }
}

impl<'a> Iterator for RelocationIter<'a> {
    type Item = RelocationEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.index * self.form.entry_size();
        let entry = RelocationEntry::decode(self.data, offset, self.endian, self.form)?;
        self.index += 1;
        Some(entry)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_packing() {
        let entry = RelocationEntry {
            offset: 0x100,
            info: RelocationEntry::make_info(7, 27),
            addend: None,
        };
        assert_eq!(entry.sym(), 7);
        assert_eq!(entry.r_type(), 27);
        assert_eq!(entry.form(), AddendForm::Implicit);
    }

    #[test]
    fn test_resolve_formula() {
        assert_eq!(RelocationEntry::resolve(0x10, 0x4000_0000, 0x200), 0x4000_0210);
        assert_eq!(RelocationEntry::resolve(-0x10, 0x1000, 0), 0xff0);
    }

    #[test]
    fn test_iter_stops_at_partial_record() {
        let a = RelocationEntry {
            offset: 8,
            info: RelocationEntry::make_info(0, 27),
            addend: Some(-4),
        };
        let mut bytes = a.encode(Endian::Big);
        bytes.extend(a.encode(Endian::Big));
        bytes.extend([0u8; 10]);
        let entries: Vec<_> = RelocationIter::new(&bytes, Endian::Big, AddendForm::Explicit).collect();
        assert_eq!(entries, alloc::vec![a, a]);
    }
}
