//! # MTL Program Loader
//!
//! Loads raw ELF64 executables into cooperatively allocated regions of a shared
//! flat memory and hands control to their entry point. This is the `exec()`
//! half of the system plus a minimal static relocator: there is no MMU, a
//! "process" is a PID drawn from a fixed pool together with the address region
//! that PID owns.
//!
//! ## Pipeline
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌───────────┐   ┌───────────┐   ┌───────────┐
//! │ Allocate  │──▶│ Validate  │──▶│   Load    │──▶│ Relocate  │──▶│  Inject   │──▶ Dispatch
//! │ PID+base  │   │  header   │   │ segments  │   │ + rooms   │   │ argv/envp │      │
//! └───────────┘   └───────────┘   └───────────┘   └───────────┘   └───────────┘      ▼
//!       ▲                                                                          Retire
//!       └──────────────────────────── free list ◀──────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`elf::parser`]: header validation and byte-order normalization
//! - [`segments`]: copies loadable segments and zero-fills their tails
//! - [`engine`]: symbol scan (argument/environment rooms) and base-relative relocation
//! - [`process`]: the PID table and its free list
//! - [`args`]: argument and environment injection into the rooms
//! - [`loader`]: the orchestrator and the API handed to loaded programs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use alloc::sync::Arc;
//! use mtl_loader::{FnDispatcher, LaunchParams, LoadFlags, Loader, LoaderConfig, SparseMemory};
//!
//! let config = LoaderConfig::builder().capacity(64).build()?;
//! let dispatcher = FnDispatcher::new(|ctx| run_at(ctx.entry, ctx.argc, ctx.argv));
//! let loader = Loader::new(config, Arc::new(SparseMemory::new()), Arc::new(dispatcher));
//! let params = LaunchParams::new("hello").args(["hello", "world"]);
//! let outcome = loader.load_image(&image, &params, LoadFlags::empty())?;
//! log::info!("pid {} returned {}", outcome.pid, outcome.exit_status);
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

use core::fmt;

/// Log through the `log` facade, gated by a per-load [`Verbosity`].
macro_rules! diag {
    ($verbose:expr, $level:ident, $($arg:tt)+) => {
        if $verbose.allows(log::Level::$level) {
            log::log!(log::Level::$level, $($arg)+);
        }
    };
}

pub mod arch;
pub mod args;
pub mod config;
pub mod console;
pub mod context;
pub mod elf;
pub mod engine;
pub mod loader;
pub mod memory;
pub mod process;
pub mod segments;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use arch::TargetSpec;
pub use args::{ArgumentInjector, FitFlags};
pub use console::{ConsoleWriter, LockedConsole, Stream};
pub use context::{LoadState, LoaderConfig, Verbosity};
pub use elf::symbols::RoomKind;
pub use engine::{RelocationEngine, RelocationStats, ScanReport};
pub use loader::{
    DispatchContext, Dispatcher, FileSource, FnDispatcher, Handled, LaunchParams, LoadFlags, LoadOutcome,
    Loader, LoaderApi, MemoryFiles,
};
pub use memory::{AddressSpace, MemoryError, Permissions, SparseMemory};
pub use process::{Clock, Pid, ProcessEntry, ProcessTable, Room, TickCounter, Timings};
pub use segments::SegmentLoader;

// ============================================================================
// WELL-KNOWN NAMES AND SIZES
// ============================================================================

/// Symbol marking the environment staging area inside an image
pub const ROOM_ENV: &str = "__loader_room_env";

/// Symbol marking the argument staging area inside an image
pub const ROOM_ARGV: &str = "__loader_room_argv";

/// Size of a pointer inside a loaded image
pub const POINTER_SIZE: usize = 8;

// ============================================================================
// ERRORS
// ============================================================================

/// Loader result type
pub type LoadResult<T> = Result<T, LoadError>;

/// Loader error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Image is shorter than the fixed file header
    TruncatedImage {
        /// Bytes available
        size: usize,
    },
    /// First four bytes are not the ELF magic
    BadSignature,
    /// Identification version is not the current one
    VersionMismatch(u8),
    /// Address width (class) differs from the target
    WrongBitWidth(u8),
    /// Byte order differs from the target
    WrongByteOrder(u8),
    /// Machine is neither the normal nor the legacy variant
    UnsupportedMachine(u16),
    /// Object type is not an executable
    NotExecutable(u16),
    /// No program header table
    MissingProgramHeaders,
    /// Program header entry size is not the ELF64 one
    MalformedProgramHeaderSize(u16),
    /// Program header table extends past the image
    ProgramHeaderOutOfBounds {
        /// End of the table in bytes
        end: u64,
        /// Image size in bytes
        size: usize,
    },
    /// Segment memory size is smaller than its file size
    SegmentExceedsMemory {
        /// Program header index
        index: usize,
    },
    /// Segment file data extends past the image
    SegmentDataOutOfBounds {
        /// Program header index
        index: usize,
    },
    /// Segment does not fit inside the process region
    SegmentOutsideRegion {
        /// Program header index
        index: usize,
    },
    /// Table entry size does not match its kind; index 0 denotes the section header table
    SectionSizeMismatch {
        /// Section index
        section: u16,
        /// Expected entry size
        expected: u64,
        /// Declared entry size
        actual: u64,
    },
    /// Section header table extends past the image
    SectionTableOutOfBounds,
    /// Section contents extend past the image
    SectionDataOutOfBounds(u16),
    /// Relocation references a symbol outside its table
    SymbolIndexOutOfBounds(u32),
    /// Relocation target lies outside the process region
    RelocationOutOfBounds(u64),
    /// Staging room symbol points outside the process region
    RoomOutsideRegion {
        /// Which room
        kind: RoomKind,
        /// Symbol value
        offset: u64,
        /// Symbol size
        size: u64,
    },
    /// Arguments do not fit the argument room
    ArgumentsTooLarge {
        /// Bytes required
        required: usize,
        /// Bytes available
        available: u64,
    },
    /// Environment does not fit the environment room
    EnvironmentTooLarge {
        /// Bytes required
        required: usize,
        /// Bytes available
        available: u64,
    },
    /// No free PID is left
    PoolExhausted,
    /// PID is not currently allocated
    InvalidPid(u32),
    /// Load state machine was driven out of order
    InvalidTransition {
        /// Current state
        from: LoadState,
        /// Requested state
        to: LoadState,
    },
    /// Rejected loader configuration
    InvalidConfig(&'static str),
    /// File source has no image under this name
    ImageNotFound,
    /// Page-reservation collaborator failure
    Memory(MemoryError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedImage { size } => {
                write!(f, "ELF file too short or truncated ({} bytes)", size)
            },
            Self::BadSignature => write!(f, "Invalid ELF file signature"),
            Self::VersionMismatch(v) => write!(f, "ELF version mismatch: {}", v),
            Self::WrongBitWidth(c) => write!(f, "File is not of proper bitsize (class {})", c),
            Self::WrongByteOrder(d) => write!(f, "File is not of proper endianness (data {})", d),
            Self::UnsupportedMachine(m) => {
                write!(f, "Target architecture 0x{:x} is not supported", m)
            },
            Self::NotExecutable(t) => write!(f, "File is not an executable (type {})", t),
            Self::MissingProgramHeaders => write!(f, "File has no program header"),
            Self::MalformedProgramHeaderSize(s) => {
                write!(f, "File has an invalid program header entry size: {}", s)
            },
            Self::ProgramHeaderOutOfBounds { end, size } => {
                write!(f, "Program header table ends at {} past image size {}", end, size)
            },
            Self::SegmentExceedsMemory { index } => {
                write!(f, "Segment {} has file size larger than memory size", index)
            },
            Self::SegmentDataOutOfBounds { index } => {
                write!(f, "Segment {} data extends past the image", index)
            },
            Self::SegmentOutsideRegion { index } => {
                write!(f, "Segment {} does not fit in the process region", index)
            },
            Self::SectionSizeMismatch {
                section,
                expected,
                actual,
            } => write!(
                f,
                "Section {} entry size {} (expected {})",
                section, actual, expected
            ),
            Self::SectionTableOutOfBounds => write!(f, "Section header table extends past the image"),
            Self::SectionDataOutOfBounds(idx) => {
                write!(f, "Section {} data extends past the image", idx)
            },
            Self::SymbolIndexOutOfBounds(idx) => write!(f, "Symbol not found: index {}", idx),
            Self::RelocationOutOfBounds(offset) => {
                write!(f, "Relocation at offset 0x{:x} outside the process region", offset)
            },
            Self::RoomOutsideRegion { kind, offset, size } => write!(
                f,
                "{:?} room at 0x{:x} ({} bytes) outside the process region",
                kind, offset, size
            ),
            Self::ArgumentsTooLarge {
                required,
                available,
            } => write!(
                f,
                "Arguments need {} bytes, argument room holds {}",
                required, available
            ),
            Self::EnvironmentTooLarge {
                required,
                available,
            } => write!(
                f,
                "Environment needs {} bytes, environment room holds {}",
                required, available
            ),
            Self::PoolExhausted => write!(f, "No free PID left"),
            Self::InvalidPid(pid) => write!(f, "PID {} is not allocated", pid),
            Self::InvalidTransition { from, to } => {
                write!(f, "Invalid load state transition {:?} -> {:?}", from, to)
            },
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::ImageNotFound => write!(f, "Image not found"),
            Self::Memory(err) => write!(f, "Memory: {}", err),
        }
    }
}

impl From<MemoryError> for LoadError {
    fn from(err: MemoryError) -> Self {
        Self::Memory(err)
    }
}

impl LoadError {
    /// Returns `true` for kinds that are reported but never abort a load.
    pub fn is_degrade_only(&self) -> bool {
        matches!(
            self,
            Self::SectionSizeMismatch { .. }
                | Self::RoomOutsideRegion { .. }
                | Self::ArgumentsTooLarge { .. }
                | Self::EnvironmentTooLarge { .. }
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
