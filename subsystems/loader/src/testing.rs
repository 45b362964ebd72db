//! Synthetic image construction for tests.
//!
//! [`ImageBuilder`] lays out a minimal executable:
//!
//! ```text
//! ┌────────┬─────────┬──────────────┬────────┬────────┬──────────┬──────────┐
//! │ header │ program │ segment data │ strtab │ symtab │ rela/rel │ sections │
//! │        │ headers │ (8-aligned)  │        │        │          │          │
//! └────────┴─────────┴──────────────┴────────┴────────┴──────────┴──────────┘
//! ```
//!
//! The section table always comes last, and section 1 is the string table
//! that holds both symbol and section names.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::EM_MTALPHA;
use crate::elf::relocations::RelocationEntry;
use crate::elf::sections::{
    SectionDescriptor, SHT_DYNSYM, SHT_NULL, SHT_REL, SHT_RELA, SHT_STRTAB, SHT_SYMTAB,
};
use crate::elf::symbols::{binding, stype, Symbol};
use crate::elf::{
    Endian, ImageHeader, SegmentDescriptor, EHDR_SIZE, ELFCLASS64, ELF_MAGIC, ET_EXEC, EI_CLASS,
    EI_DATA, EI_NIDENT, EI_VERSION, EV_CURRENT, PF_R, PF_W, PF_X, PHDR_SIZE, PT_LOAD, PT_NOTE,
    REL_SIZE, RELA_SIZE, SHDR_SIZE, SYM_SIZE,
};

/// Absolute symbol section index
const SHN_ABS: u16 = 0xfff1;

/// One loadable segment
#[derive(Debug, Clone)]
pub struct SegmentSpec {
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
    flags: u32,
}

impl SegmentSpec {
    /// Segment at `vaddr` holding `data`, `memsz` bytes in memory
    pub fn new(vaddr: u64, data: Vec<u8>, memsz: u64) -> Self {
        Self {
            vaddr,
            data,
            memsz,
            flags: PF_R | PF_W | PF_X,
        }
    }

    /// Override the `PF_*` flags
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

/// One relocation entry
#[derive(Debug, Clone, Copy)]
pub struct RelocSpec {
    offset: u64,
    sym: u32,
    r_type: u32,
    addend: Option<i64>,
}

impl RelocSpec {
    /// Entry with an explicit addend
    pub fn rela(offset: u64, sym: u32, r_type: u32, addend: i64) -> Self {
        Self { offset, sym, r_type, addend: Some(addend) }
    }

    /// Entry whose addend is read from the target
    pub fn rel(offset: u64, sym: u32, r_type: u32) -> Self {
        Self { offset, sym, r_type, addend: None }
    }
}

/// Builds executable images in memory
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    endian: Endian,
    machine: u16,
    entry: u64,
    segments: Vec<SegmentSpec>,
    notes: Vec<u64>,
    symbols: Vec<(String, u64, u64)>,
    relocations: Vec<RelocSpec>,
    dynamic: bool,
    symbol_entsize: Option<u64>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn align8(buf: &mut Vec<u8>) {
    while buf.len() % 8 != 0 {
        buf.push(0);
    }
}

/// Names accumulated into one string table
#[derive(Default)]
struct Strings(Vec<u8>);

impl Strings {
    fn add(&mut self, name: &str) -> u32 {
        if self.0.is_empty() {
            self.0.push(0);
        }
        let at = self.0.len() as u32;
        self.0.extend_from_slice(name.as_bytes());
        self.0.push(0);
        at
    }
}

impl ImageBuilder {
    /// Little-endian image for the default target with no segments
    pub fn new() -> Self {
        Self {
            endian: Endian::Little,
            machine: EM_MTALPHA,
            entry: 0,
            segments: Vec::new(),
            notes: Vec::new(),
            symbols: Vec::new(),
            relocations: Vec::new(),
            dynamic: false,
            symbol_entsize: None,
        }
    }

    /// Byte order
    pub fn endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Machine id
    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Entry offset
    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    /// Add a loadable segment
    pub fn segment(mut self, segment: SegmentSpec) -> Self {
        self.segments.push(segment);
        self
    }

    /// Add a non-loadable note segment at `vaddr`
    pub fn note_segment(mut self, vaddr: u64) -> Self {
        self.notes.push(vaddr);
        self
    }

    /// Add a symbol; the first one added gets index 1
    pub fn symbol(mut self, name: &str, value: u64, size: u64) -> Self {
        self.symbols.push((String::from(name), value, size));
        self
    }

    /// Add a relocation
    pub fn relocation(mut self, reloc: RelocSpec) -> Self {
        self.relocations.push(reloc);
        self
    }

    /// Emit the symbols as a dynamic symbol table
    pub fn dynamic_symbols(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Write a wrong `sh_entsize` into the symbol table header
    pub fn symbol_entry_size(mut self, entsize: u64) -> Self {
        self.symbol_entsize = Some(entsize);
        self
    }

    fn program_headers(&self, offsets: &[u64]) -> Vec<SegmentDescriptor> {
        let loads = self.segments.iter().zip(offsets).map(|(seg, &offset)| SegmentDescriptor {
            p_type: PT_LOAD,
            flags: seg.flags,
            offset,
            vaddr: seg.vaddr,
            paddr: seg.vaddr,
            filesz: seg.data.len() as u64,
            memsz: seg.memsz,
            align: 8,
        });
        let notes = self.notes.iter().map(|&vaddr| SegmentDescriptor {
            p_type: PT_NOTE,
            flags: PF_R,
            offset: 0,
            vaddr,
            paddr: vaddr,
            filesz: 0,
            memsz: 0,
            align: 4,
        });
        loads.chain(notes).collect()
    }

    /// Produce the image bytes
    pub fn build(&self) -> Vec<u8> {
        let endian = self.endian;
        let phnum = self.segments.len() + self.notes.len();

        let mut body = Vec::new();
        let data_start = (EHDR_SIZE + phnum * PHDR_SIZE) as u64;
        let mut offsets = Vec::with_capacity(self.segments.len());
        for seg in &self.segments {
            align8(&mut body);
            offsets.push(data_start + body.len() as u64);
            body.extend_from_slice(&seg.data);
        }

        // Section 0 is null and section 1 the string table
        let mut strings = Strings::default();
        let mut sections = Vec::new();
        sections.push(SectionDescriptor {
            index: 0,
            name: 0,
            sh_type: SHT_NULL,
            flags: 0,
            addr: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
            addralign: 0,
            entsize: 0,
        });
        let strtab_name = strings.add(".strtab");

        let mut symtab = Vec::new();
        let mut symtab_name = 0;
        if !self.symbols.is_empty() {
            symtab_name = strings.add(if self.dynamic { ".dynsym" } else { ".symtab" });
            symtab.extend(Symbol::NULL.encode(endian));
            for (name, value, size) in &self.symbols {
                let sym = Symbol {
                    name: strings.add(name),
                    info: (binding::STB_GLOBAL << 4) | stype::STT_OBJECT,
                    other: 0,
                    shndx: SHN_ABS,
                    value: *value,
                    size: *size,
                };
                symtab.extend(sym.encode(endian));
            }
        }

        let encode_all = |explicit: bool| -> Vec<u8> {
            self.relocations
                .iter()
                .filter(|r| r.addend.is_some() == explicit)
                .flat_map(|r| {
                    RelocationEntry {
                        offset: r.offset,
                        info: RelocationEntry::make_info(r.sym, r.r_type),
                        addend: r.addend,
                    }
                    .encode(endian)
                })
                .collect()
        };
        let rela = encode_all(true);
        let rel = encode_all(false);
        let rela_name = if rela.is_empty() { 0 } else { strings.add(".rela.dyn") };
        let rel_name = if rel.is_empty() { 0 } else { strings.add(".rel.dyn") };

        let place = |body: &mut Vec<u8>, bytes: &[u8]| -> u64 {
            align8(body);
            let at = data_start + body.len() as u64;
            body.extend_from_slice(bytes);
            at
        };

        let strtab_offset = place(&mut body, &strings.0);
        sections.push(SectionDescriptor {
            index: 1,
            name: strtab_name,
            sh_type: SHT_STRTAB,
            flags: 0,
            addr: 0,
            offset: strtab_offset,
            size: strings.0.len() as u64,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
        });

        let mut symtab_index = 0;
        if !symtab.is_empty() {
            symtab_index = sections.len() as u32;
            let offset = place(&mut body, &symtab);
            sections.push(SectionDescriptor {
                index: symtab_index as u16,
                name: symtab_name,
                sh_type: if self.dynamic { SHT_DYNSYM } else { SHT_SYMTAB },
                flags: 0,
                addr: 0,
                offset,
                size: symtab.len() as u64,
                link: 1,
                info: 1,
                addralign: 8,
                entsize: self.symbol_entsize.unwrap_or(SYM_SIZE as u64),
            });
        }

        for (bytes, name, sh_type, entsize) in [
            (&rela, rela_name, SHT_RELA, RELA_SIZE),
            (&rel, rel_name, SHT_REL, REL_SIZE),
        ] {
            if bytes.is_empty() {
                continue;
            }
            let offset = place(&mut body, bytes);
            sections.push(SectionDescriptor {
                index: sections.len() as u16,
                name,
                sh_type,
                flags: 0,
                addr: 0,
                offset,
                size: bytes.len() as u64,
                link: symtab_index,
                info: 0,
                addralign: 8,
                entsize: entsize as u64,
            });
        }

        align8(&mut body);
        let shoff = data_start + body.len() as u64;
        for sec in &sections {
            body.extend(sec.encode(endian));
        }

        let mut ident = [0u8; EI_NIDENT];
        ident[..4].copy_from_slice(&ELF_MAGIC);
        ident[EI_CLASS] = ELFCLASS64;
        ident[EI_DATA] = endian.data();
        ident[EI_VERSION] = EV_CURRENT;
        let header = ImageHeader {
            ident,
            e_type: ET_EXEC,
            machine: self.machine,
            version: EV_CURRENT as u32,
            entry: self.entry,
            phoff: EHDR_SIZE as u64,
            shoff,
            flags: 0,
            ehsize: EHDR_SIZE as u16,
            phentsize: PHDR_SIZE as u16,
            phnum: phnum as u16,
            shentsize: SHDR_SIZE as u16,
            shnum: sections.len() as u16,
            shstrndx: 1,
        };

        let mut image = Vec::with_capacity(data_start as usize + body.len());
        image.extend_from_slice(&header.encode());
        for phdr in self.program_headers(&offsets) {
            image.extend(phdr.encode(endian));
        }
        image.extend(body);
        image
    }
}
