//! # Argument Injection
//!
//! Stages `argv` and the environment block inside the rooms an image declares.
//!
//! Argument room layout, `argc + 1` pointers followed by the strings:
//!
//! ```text
//! room ─▶ ┌──────────┬──────────┬─────┬──────┬────────┬────────┬─────┐
//!         │ argv[0]  │ argv[1]  │ ... │ NULL │ "a\0"  │ "bb\0" │ ... │
//!         └────┬─────┴────┬─────┴─────┴──────┴────────┴────────┴─────┘
//!              └──────────┼───────────────────▲        ▲
//!                         └────────────────────────────┘
//! ```
//!
//! The environment room receives the block verbatim up to its double NUL.
//!
//! Neither half is ever truncated: if it does not fit, or the image has no
//! room for it, the program simply starts without it.

use alloc::vec::Vec;

use crate::elf::Endian;
use crate::memory::AddressSpace;
use crate::process::{ProcessEntry, Room};
use crate::{LoadError, POINTER_SIZE};

bitflags::bitflags! {
    /// Halves that cannot be staged
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FitFlags: u8 {
        /// Arguments do not fit
        const ARGS = 1 << 0;
        /// Environment does not fit
        const ENV = 1 << 1;
    }
}

/// Bytes the argument room needs for `argv`
pub fn argument_bytes<S: AsRef<str>>(argv: &[S]) -> usize {
    let strings: usize = argv.iter().map(|s| s.as_ref().len() + 1).sum();
    (argv.len() + 1) * POINTER_SIZE + strings
}

/// Environment entries without the terminating double NUL
pub fn env_payload(block: &[u8]) -> &[u8] {
    match block.windows(2).position(|w| w == [0, 0]) {
        Some(end) => &block[..end],
        None => {
            let trimmed = block.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            &block[..trimmed]
        },
    }
}

/// Bytes the environment room needs for `block`
pub fn environment_bytes(block: &[u8]) -> usize {
    env_payload(block).len() + 2
}

/// Check both halves against the room sizes; an absent room has size 0.
pub fn check_fit<S: AsRef<str>>(
    argv: &[S],
    envp: Option<&[u8]>,
    arg_room_size: u64,
    env_room_size: u64,
) -> FitFlags {
    let mut flags = FitFlags::empty();
    if !argv.is_empty() && argument_bytes(argv) as u64 > arg_room_size {
        flags |= FitFlags::ARGS;
    }
    if let Some(block) = envp {
        if environment_bytes(block) as u64 > env_room_size {
            flags |= FitFlags::ENV;
        }
    }
    flags
}

/// Lay out the argument room contents for a room at `address`
fn argument_blob<S: AsRef<str>>(argv: &[S], address: u64, endian: Endian) -> Vec<u8> {
    let table = (argv.len() + 1) * POINTER_SIZE;
    let mut pointers = Vec::with_capacity(argument_bytes(argv));
    let mut strings = Vec::new();
    for arg in argv {
        let at = address + (table + strings.len()) as u64;
        pointers.extend_from_slice(&endian.write_u64(at));
        strings.extend_from_slice(arg.as_ref().as_bytes());
        strings.push(0);
    }
    pointers.extend_from_slice(&[0u8; POINTER_SIZE]);
    pointers.extend(strings);
    pointers
}

/// Writes arguments and environment into a loaded image
pub struct ArgumentInjector<'a> {
    memory: &'a dyn AddressSpace,
    endian: Endian,
}

impl<'a> ArgumentInjector<'a> {
    /// Create an injector for an image of byte order `endian`
    pub fn new(memory: &'a dyn AddressSpace, endian: Endian) -> Self {
        Self { memory, endian }
    }

    /// Stage what fits and record the result in `entry`.
    ///
    /// Returns the halves that were dropped and why. On return `entry.argc`,
    /// `entry.argv` and `entry.envp` describe exactly what the program sees.
    pub fn inject<S: AsRef<str>>(
        &self,
        entry: &mut ProcessEntry,
        argv: &[S],
        envp: Option<&[u8]>,
    ) -> (FitFlags, Vec<LoadError>) {
        let room_size = |room: Option<Room>| room.map_or(0, |r| r.size);
        let fit = check_fit(argv, envp, room_size(entry.arg_room), room_size(entry.env_room));
        let mut dropped = FitFlags::empty();
        let mut warnings = Vec::new();

        entry.argc = 0;
        entry.argv = None;
        entry.envp = None;

        if !argv.is_empty() {
            match self.stage_arguments(entry, argv, fit) {
                Ok(address) => {
                    entry.argc = argv.len();
                    entry.argv = Some(address);
                },
                Err(err) => {
                    diag!(entry.verbose, Warn, "pid {}: arguments dropped: {}", entry.pid(), err);
                    dropped |= FitFlags::ARGS;
                    warnings.push(err);
                },
            }
        }

        if let Some(block) = envp {
            match self.stage_environment(entry, block, fit) {
                Ok(address) => entry.envp = Some(address),
                Err(err) => {
                    diag!(entry.verbose, Warn, "pid {}: environment dropped: {}", entry.pid(), err);
                    dropped |= FitFlags::ENV;
                    warnings.push(err);
                },
            }
        }

        (dropped, warnings)
    }

    fn stage_arguments<S: AsRef<str>>(
        &self,
        entry: &ProcessEntry,
        argv: &[S],
        fit: FitFlags,
    ) -> Result<u64, LoadError> {
        let room = entry.arg_room.unwrap_or(Room { address: 0, size: 0 });
        if fit.contains(FitFlags::ARGS) {
            return Err(LoadError::ArgumentsTooLarge {
                required: argument_bytes(argv),
                available: room.size,
            });
        }
        self.memory
            .write(room.address, &argument_blob(argv, room.address, self.endian))?;
        Ok(room.address)
    }

    fn stage_environment(
        &self,
        entry: &ProcessEntry,
        block: &[u8],
        fit: FitFlags,
    ) -> Result<u64, LoadError> {
        let room = entry.env_room.unwrap_or(Room { address: 0, size: 0 });
        if fit.contains(FitFlags::ENV) {
            return Err(LoadError::EnvironmentTooLarge {
                required: environment_bytes(block),
                available: room.size,
            });
        }
        let mut staged = Vec::with_capacity(environment_bytes(block));
        staged.extend_from_slice(env_payload(block));
        staged.extend_from_slice(&[0, 0]);
        self.memory.write(room.address, &staged)?;
        Ok(room.address)
    }
}

// ============================================================================
// TESTS
// ============================================================================
