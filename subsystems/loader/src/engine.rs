//! # Relocation Engine
//!
//! Walks the section table of a loaded image once for symbols and once for
//! relocations.
//!
//! The symbol pass records the argument and environment rooms. The relocation
//! pass patches every entry of every `SHT_RELA` and `SHT_REL` section with
//!
//! ```text
//! *(base + r_offset) = addend + base + symbol_value
//! ```
//!
//! where the addend comes from the entry or, for `SHT_REL`, from the cell
//! being patched. The formula is the same for every relocation type; the type
//! only feeds the statistics.
//!
//! A table with the wrong entry size is skipped with a warning. Anything that
//! would read or write outside the image or the region fails the load.

use alloc::vec::Vec;
use core::fmt;

use crate::arch::alpha::Alpha;
use crate::arch::RelocationModel;
use crate::elf::relocations::{AddendForm, RelocationEntry, RelocationIter, RelocationKind};
use crate::elf::sections::{section_table, SectionDescriptor, SectionKind};
use crate::elf::symbols::{classify, RoomKind, SymbolTable};
use crate::elf::ImageHeader;
use crate::memory::AddressSpace;
use crate::process::{ProcessEntry, Room};
use crate::{LoadError, LoadResult, POINTER_SIZE};

// ============================================================================
// STATISTICS
// ============================================================================

/// Relocation statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationStats {
    /// Total relocation entries applied
    pub total_applied: usize,
    /// Entries with an explicit addend
    pub explicit: usize,
    /// Entries whose addend was read from the target
    pub implicit: usize,
    /// Symbols examined
    pub symbols_scanned: usize,
    /// Tables skipped for a wrong entry size
    pub tables_skipped: usize,

    // Per-type counts
    /// Global data relocations
    pub global_data: usize,
    /// Base-relative relocations
    pub base_relative: usize,
    /// Jump slot relocations
    pub jump_slot: usize,
    /// Any other type
    pub other: usize,
}

impl RelocationStats {
    /// Creates a new `RelocationStats` with all counters initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, kind: RelocationKind, form: AddendForm) {
        self.total_applied += 1;
        match form {
            AddendForm::Explicit => self.explicit += 1,
            AddendForm::Implicit => self.implicit += 1,
        }
        match kind {
            RelocationKind::GlobalData => self.global_data += 1,
            RelocationKind::BaseRelative => self.base_relative += 1,
            RelocationKind::JumpSlot => self.jump_slot += 1,
            RelocationKind::Other(_) => self.other += 1,
        }
    }
}

impl fmt::Display for RelocationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Relocation Statistics:")?;
        writeln!(f, "  Applied:        {}", self.total_applied)?;
        writeln!(f, "  RELA/REL:       {}/{}", self.explicit, self.implicit)?;
        writeln!(f, "  Symbols:        {}", self.symbols_scanned)?;
        writeln!(f, "  Tables skipped: {}", self.tables_skipped)?;
        writeln!(f, "  By type:")?;
        writeln!(f, "    GLOB_DAT:     {}", self.global_data)?;
        writeln!(f, "    RELATIVE:     {}", self.base_relative)?;
        writeln!(f, "    JMP_SLOT:     {}", self.jump_slot)?;
        write!(f, "    Other:        {}", self.other)
    }
}

/// Result of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Counters
    pub stats: RelocationStats,
    /// Problems that did not stop the load
    pub warnings: Vec<LoadError>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Scans one loaded image
pub struct RelocationEngine<'a> {
    image: &'a [u8],
    header: &'a ImageHeader,
    memory: &'a dyn AddressSpace,
}

impl<'a> RelocationEngine<'a> {
    /// Create an engine for an image already placed in `memory`
    pub fn new(image: &'a [u8], header: &'a ImageHeader, memory: &'a dyn AddressSpace) -> Self {
        Self {
            image,
            header,
            memory,
        }
    }

    /// Record staging rooms in `entry` and apply every relocation.
    pub fn scan_and_relocate(&self, entry: &mut ProcessEntry) -> LoadResult<ScanReport> {
        let mut report = ScanReport::default();

        let sections = match section_table(self.image, self.header) {
            Ok(sections) => sections,
            Err(err) if err.is_degrade_only() => {
                diag!(entry.verbose, Warn, "pid {}: {}; sections ignored", entry.pid(), err);
                report.stats.tables_skipped += 1;
                report.warnings.push(err);
                return Ok(report);
            },
            Err(err) => return Err(err),
        };

        // Tables with a bad entry size are excluded from both passes
        let mut usable = alloc::vec![false; sections.len()];
        for sec in &sections {
            match sec.check_entry_size() {
                Ok(()) => usable[sec.index as usize] = true,
                Err(err) => {
                    diag!(entry.verbose, Warn, "pid {}: {}; table skipped", entry.pid(), err);
                    report.stats.tables_skipped += 1;
                    report.warnings.push(err);
                },
            }
        }

        for sec in &sections {
            if usable[sec.index as usize]
                && matches!(
                    sec.kind(),
                    SectionKind::SymbolTable | SectionKind::DynamicSymbolTable
                )
            {
                self.scan_symbols(&sections, sec, entry, &mut report)?;
            }
        }

        for sec in &sections {
            let form = match sec.kind() {
                SectionKind::RelocationWithAddend => AddendForm::Explicit,
                SectionKind::Relocation => AddendForm::Implicit,
                _ => continue,
            };
            if usable[sec.index as usize] {
                self.apply_table(&sections, &usable, sec, form, entry, &mut report.stats)?;
            }
        }

        diag!(
            entry.verbose,
            Info,
            "pid {}: {} relocations applied, {} symbols scanned",
            entry.pid(),
            report.stats.total_applied,
            report.stats.symbols_scanned
        );
        Ok(report)
    }

    fn scan_symbols(
        &self,
        sections: &[SectionDescriptor],
        sec: &SectionDescriptor,
        entry: &mut ProcessEntry,
        report: &mut ScanReport,
    ) -> LoadResult<()> {
        let table = SymbolTable::open(self.image, sections, sec.index as usize, self.header.endian())?;
        for symbol in table.iter() {
            report.stats.symbols_scanned += 1;
            let Some(kind) = table.name(&symbol).and_then(classify) else {
                continue;
            };
            // A room outside the region is dropped; that half is staged as empty
            if !entry.contains(symbol.value, symbol.size) {
                let err = LoadError::RoomOutsideRegion {
                    kind,
                    offset: symbol.value,
                    size: symbol.size,
                };
                diag!(entry.verbose, Warn, "pid {}: {}; room ignored", entry.pid(), err);
                report.warnings.push(err);
                continue;
            }
            let room = Room {
                address: entry.base() + symbol.value,
                size: symbol.size,
            };
            diag!(
                entry.verbose,
                Debug,
                "pid {}: {:?} room at 0x{:x} ({} bytes)",
                entry.pid(),
                kind,
                room.address,
                room.size
            );
            match kind {
                RoomKind::Arguments => entry.arg_room = Some(room),
                RoomKind::Environment => entry.env_room = Some(room),
            }
        }
        Ok(())
    }

    fn apply_table(
        &self,
        sections: &[SectionDescriptor],
        usable: &[bool],
        sec: &SectionDescriptor,
        form: AddendForm,
        entry: &ProcessEntry,
        stats: &mut RelocationStats,
    ) -> LoadResult<()> {
        let endian = self.header.endian();
        let link = sec.link as usize;
        let symbols = match sections.get(link) {
            Some(linked)
                if link != 0
                    && usable[link]
                    && matches!(
                        linked.kind(),
                        SectionKind::SymbolTable | SectionKind::DynamicSymbolTable
                    ) =>
            {
                Some(SymbolTable::open(self.image, sections, link, endian)?)
            },
            _ => None,
        };

        let data = sec.data(self.image)?;
        for (_index, reloc) in RelocationIter::new(data, endian, form).enumerate() {
            #[cfg(feature = "debug")]
            debug_print_reloc(&reloc, _index);
            self.apply_one(&reloc, symbols.as_ref(), entry)?;
            stats.record(Alpha::kind(reloc.r_type()), form);
        }
        Ok(())
    }

    fn apply_one(
        &self,
        reloc: &RelocationEntry,
        symbols: Option<&SymbolTable<'_>>,
        entry: &ProcessEntry,
    ) -> LoadResult<()> {
        if !entry.contains(reloc.offset, POINTER_SIZE as u64) {
            return Err(LoadError::RelocationOutOfBounds(reloc.offset));
        }
        let endian = self.header.endian();
        let target = entry.base() + reloc.offset;

        let symbol_value = match (reloc.sym(), symbols) {
            (0, _) => 0,
            (sym, Some(table)) => table.get(sym)?.value,
            (sym, None) => return Err(LoadError::SymbolIndexOutOfBounds(sym)),
        };
        let addend = match reloc.addend {
            Some(addend) => addend,
            None => self.memory.read_u64(target, endian)? as i64,
        };

        let value = RelocationEntry::resolve(addend, entry.base(), symbol_value);
        self.memory.write_u64(target, value, endian)?;
        Ok(())
    }
}

/// Dumps one relocation entry to the debug log.
#[cfg(feature = "debug")]
pub fn debug_print_reloc(reloc: &RelocationEntry, index: usize) {
    let rtype = reloc.r_type();
    log::debug!(
        "  [{:4}] offset=0x{:016x} type={:2} ({}) sym={} addend={:?}",
        index,
        reloc.offset,
        rtype,
        Alpha::reloc_name(rtype),
        reloc.sym(),
        reloc.addend
    );
}

// ============================================================================
// TESTS
// ============================================================================
