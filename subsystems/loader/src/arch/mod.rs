//! # Target Architecture
//!
//! The machine this loader accepts images for, and the relocation numbering of
//! that machine.

use crate::elf::relocations::RelocationKind;
use crate::elf::{ELFCLASS64, ELFDATA2LSB};

// ============================================================================
// MACHINE IDS
// ============================================================================

/// Machine id of current MTAlpha images
pub const EM_MTALPHA: u16 = 0xafef;

/// Machine id of images produced by the old Alpha toolchain
pub const EM_ALPHA: u16 = 0x9026;

// ============================================================================
// TARGET SPEC
// ============================================================================

/// Identification an image must carry to be loadable.
///
/// Two machine ids are accepted: the normal one and a legacy one. A legacy
/// image is loaded identically; only the flag handed to the dispatcher differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSpec {
    /// Required `e_ident[EI_CLASS]`
    pub class: u8,
    /// Required `e_ident[EI_DATA]`
    pub data: u8,
    /// Normal machine id
    pub machine: u16,
    /// Legacy machine id
    pub legacy_machine: u16,
}

impl TargetSpec {
    /// 64-bit little-endian MTAlpha
    pub const MTALPHA: Self = Self {
        class: ELFCLASS64,
        data: ELFDATA2LSB,
        machine: EM_MTALPHA,
        legacy_machine: EM_ALPHA,
    };

    /// Check a machine id against both variants
    pub fn accepts_machine(&self, machine: u16) -> bool {
        machine == self.machine || machine == self.legacy_machine
    }

    /// Check whether a machine id is the legacy variant
    pub fn is_legacy(&self, machine: u16) -> bool {
        machine == self.legacy_machine && machine != self.machine
    }
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self::MTALPHA
    }
}

// ============================================================================
// RELOCATION MODEL
// ============================================================================

/// Architecture-specific relocation numbering
pub trait RelocationModel {
    /// Architecture name
    const NAME: &'static str;

    /// Classify a raw relocation type
    fn kind(r_type: u32) -> RelocationKind;

    /// Get relocation type name
    fn reloc_name(r_type: u32) -> &'static str;
}

/// Alpha relocation types
pub mod alpha {
    use super::*;

    /// No relocation
    pub const R_ALPHA_NONE: u32 = 0;
    /// Direct 32 bit
    pub const R_ALPHA_REFLONG: u32 = 1;
    /// Direct 64 bit
    pub const R_ALPHA_REFQUAD: u32 = 2;
    /// GP relative 32 bit
    pub const R_ALPHA_GPREL32: u32 = 3;
    /// GP relative 16 bit with optimization
    pub const R_ALPHA_LITERAL: u32 = 4;
    /// Add displacement to GP
    pub const R_ALPHA_GPDISP: u32 = 6;
    /// PC+4 relative 23 bit shifted
    pub const R_ALPHA_BRADDR: u32 = 7;
    /// PC+4 relative 16 bit shifted
    pub const R_ALPHA_HINT: u32 = 8;
    /// Copy symbol at runtime
    pub const R_ALPHA_COPY: u32 = 24;
    /// Create GOT entry
    pub const R_ALPHA_GLOB_DAT: u32 = 25;
    /// Create PLT entry
    pub const R_ALPHA_JMP_SLOT: u32 = 26;
    /// Adjust by program base
    pub const R_ALPHA_RELATIVE: u32 = 27;

    /// Alpha relocation model
    pub struct Alpha;

    impl RelocationModel for Alpha {
        const NAME: &'static str = "alpha";

        fn kind(r_type: u32) -> RelocationKind {
            match r_type {
                R_ALPHA_GLOB_DAT => RelocationKind::GlobalData,
                R_ALPHA_JMP_SLOT => RelocationKind::JumpSlot,
                R_ALPHA_RELATIVE => RelocationKind::BaseRelative,
                other => RelocationKind::Other(other),
            }
        }

        fn reloc_name(r_type: u32) -> &'static str {
            match r_type {
                R_ALPHA_NONE => "R_ALPHA_NONE",
                R_ALPHA_REFLONG => "R_ALPHA_REFLONG",
                R_ALPHA_REFQUAD => "R_ALPHA_REFQUAD",
                R_ALPHA_GPREL32 => "R_ALPHA_GPREL32",
                R_ALPHA_LITERAL => "R_ALPHA_LITERAL",
                R_ALPHA_GPDISP => "R_ALPHA_GPDISP",
                R_ALPHA_BRADDR => "R_ALPHA_BRADDR",
                R_ALPHA_HINT => "R_ALPHA_HINT",
                R_ALPHA_COPY => "R_ALPHA_COPY",
                R_ALPHA_GLOB_DAT => "R_ALPHA_GLOB_DAT",
                R_ALPHA_JMP_SLOT => "R_ALPHA_JMP_SLOT",
                R_ALPHA_RELATIVE => "R_ALPHA_RELATIVE",
                _ => "UNKNOWN",
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
