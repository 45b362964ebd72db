//! # ELF Parser
//!
//! Header validation and program header normalization.
//!
//! Checks run in a fixed order so the reported error is deterministic for a
//! given image: signature first, then identification, machine, object type
//! and finally the program header table geometry.

use alloc::vec::Vec;

use super::sections::{section_table, SectionDescriptor};
use super::*;
use crate::arch::TargetSpec;
use crate::{LoadError, LoadResult};

// ============================================================================
// VALIDATION STEPS
// ============================================================================

/// Decode the file header in the byte order the image declares.
pub fn normalize(bytes: &[u8]) -> LoadResult<ImageHeader> {
    ImageHeader::decode(bytes).ok_or(LoadError::TruncatedImage { size: bytes.len() })
}

/// Check the four magic bytes. Input too short to hold them is a bad
/// signature too.
pub fn validate_signature(bytes: &[u8]) -> LoadResult<()> {
    match bytes.get(..ELF_MAGIC.len()) {
        Some(magic) if magic == ELF_MAGIC => Ok(()),
        _ => Err(LoadError::BadSignature),
    }
}

/// Check identification, machine, type and program header geometry against
/// the target and the image size.
pub fn validate_architecture(
    header: &ImageHeader,
    target: &TargetSpec,
    size: usize,
) -> LoadResult<()> {
    if header.ident_version() != EV_CURRENT {
        return Err(LoadError::VersionMismatch(header.ident_version()));
    }
    if header.class() != target.class {
        return Err(LoadError::WrongBitWidth(header.class()));
    }
    if header.data() != target.data {
        return Err(LoadError::WrongByteOrder(header.data()));
    }
    if !target.accepts_machine(header.machine) {
        return Err(LoadError::UnsupportedMachine(header.machine));
    }
    if !header.is_executable() {
        return Err(LoadError::NotExecutable(header.e_type));
    }
    if header.phoff == 0 || header.phnum == 0 {
        return Err(LoadError::MissingProgramHeaders);
    }
    if header.phentsize as usize != PHDR_SIZE {
        return Err(LoadError::MalformedProgramHeaderSize(header.phentsize));
    }

    let end = (header.phnum as u64)
        .checked_mul(PHDR_SIZE as u64)
        .and_then(|len| len.checked_add(header.phoff))
        .unwrap_or(u64::MAX);
    if end > size as u64 {
        return Err(LoadError::ProgramHeaderOutOfBounds { end, size });
    }
    Ok(())
}

/// Program headers decoded to host order, with the lowest loadable address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSegments {
    /// Lowest `vaddr` over loadable segments, 0 when there are none
    pub base_hint: u64,
    /// Every program header in table order
    pub segments: Vec<SegmentDescriptor>,
}

/// Decode every program header and compute the base hint.
///
/// The header must already have passed [`validate_architecture`].
pub fn find_base_and_normalize_segments(
    bytes: &[u8],
    header: &ImageHeader,
) -> LoadResult<NormalizedSegments> {
    let endian = header.endian();
    let segments = (0..header.phnum as usize)
        .map(|i| {
            let offset = header.phoff as usize + i * PHDR_SIZE;
            SegmentDescriptor::decode(bytes, offset, endian).ok_or(
                LoadError::ProgramHeaderOutOfBounds {
                    end: (offset + PHDR_SIZE) as u64,
                    size: bytes.len(),
                },
            )
        })
        .collect::<LoadResult<Vec<_>>>()?;

    let base_hint = segments
        .iter()
        .filter(|s| s.is_loadable())
        .map(|s| s.vaddr)
        .min()
        .unwrap_or(0);

    Ok(NormalizedSegments {
        base_hint,
        segments,
    })
}

// ============================================================================
// PARSER
// ============================================================================

/// A fully validated image
pub struct ElfParser<'a> {
    /// Raw data
    data: &'a [u8],
    /// Decoded header
    header: ImageHeader,
    /// Decoded program headers
    segments: NormalizedSegments,
    /// Machine id was the legacy one
    legacy: bool,
}

impl<'a> ElfParser<'a> {
    /// Run every header check and decode the program headers
    pub fn new(data: &'a [u8], target: &TargetSpec) -> LoadResult<Self> {
        validate_signature(data)?;
        let header = normalize(data)?;
        validate_architecture(&header, target, data.len())?;
        let segments = find_base_and_normalize_segments(data, &header)?;

        Ok(Self {
            data,
            legacy: target.is_legacy(header.machine),
            header,
            segments,
        })
    }

    /// Raw image
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Decoded header
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Program headers in table order
    pub fn program_headers(&self) -> &[SegmentDescriptor] {
        &self.segments.segments
    }

    /// Loadable program headers only
    pub fn loadable_segments(&self) -> impl Iterator<Item = &SegmentDescriptor> {
        self.segments.segments.iter().filter(|s| s.is_loadable())
    }

    /// Lowest loadable address
    pub fn base_vaddr(&self) -> u64 {
        self.segments.base_hint
    }

    /// Entry point relative to the load base
    pub fn entry_point(&self) -> u64 {
        self.header.entry
    }

    /// Image carries the legacy machine id
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Decode the section header table
    pub fn section_headers(&self) -> LoadResult<Vec<SectionDescriptor>> {
        section_table(self.data, &self.header)
    }
}

// ============================================================================
// TESTS
// ============================================================================
