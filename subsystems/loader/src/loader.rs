//! # Loader
//!
//! Drives one load from PID allocation to retirement and exposes the API
//! loaded programs call back into.
//!
//! ```text
//! allocate ─▶ validate ─▶ load ─▶ relocate ─▶ inject ─▶ dispatch ─▶ retire
//!     │           │          │         │                                ▲
//!     │           └──────────┴─────────┴──── any failure ───────────────┘
//!     └─ pool exhausted: nothing to retire
//! ```
//!
//! Every path that allocated a PID retires it exactly once. Loads are
//! independent: several may run concurrently, and a dispatched program may
//! start nested loads through [`LoaderApi`].

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::args::{ArgumentInjector, FitFlags};
use crate::config::{env_block, LaunchConfig};
use crate::console::{LockedConsole, Stream};
use crate::context::{LoadContext, LoadState, LoaderConfig, Verbosity};
use crate::elf::parser::ElfParser;
use crate::elf::Endian;
use crate::engine::{RelocationEngine, RelocationStats};
use crate::memory::AddressSpace;
use crate::process::{Clock, Pid, ProcessEntry, ProcessTable, TickCounter, TimeCallback, Timings};
use crate::segments::SegmentLoader;
use crate::{LoadError, LoadResult, POINTER_SIZE};

// ============================================================================
// FLAGS AND PARAMETERS
// ============================================================================

bitflags::bitflags! {
    /// Per-load settings
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LoadFlags: u32 {
        /// Do not prepend the file name as `argv[0]`
        const NO_PROGNAME = 1 << 0;
        /// Record ticks and report them at retirement
        const TIMEIT = 1 << 2;
        /// Ask for exclusive use of the assigned cores
        const EXCLUSIVE = 1 << 3;
    }
}

/// Everything a caller specifies about one program launch
#[derive(Debug, Clone)]
pub struct LaunchParams {
    /// Image name in the file source
    pub fname: String,
    /// Argument vector, exactly as the program will see it
    pub argv: Vec<String>,
    /// Environment block, NUL-separated and double-NUL terminated
    pub envp: Option<Vec<u8>>,
    /// Diagnostic level
    pub verbose: Verbosity,
    /// First core
    pub core_start: u32,
    /// Core count
    pub core_size: u32,
    /// Called at retirement when timing is on
    pub time_callback: Option<TimeCallback>,
}

impl LaunchParams {
    /// Launch `fname` with no arguments and no environment
    pub fn new(fname: impl Into<String>) -> Self {
        Self {
            fname: fname.into(),
            argv: Vec::new(),
            envp: None,
            verbose: Verbosity::default(),
            core_start: 0,
            core_size: 1,
            time_callback: None,
        }
    }

    /// Set the argument vector
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the environment from `KEY=value` entries
    pub fn env<S: AsRef<str>>(mut self, entries: &[S]) -> Self {
        self.envp = Some(env_block(entries));
        self
    }

    /// Set diagnostic level
    pub fn verbose(mut self, verbose: Verbosity) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set core placement
    pub fn cores(mut self, start: u32, size: u32) -> Self {
        self.core_start = start;
        self.core_size = size;
        self
    }

    /// Set the timing callback
    pub fn time_callback(mut self, callback: TimeCallback) -> Self {
        self.time_callback = Some(callback);
        self
    }
}

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Who handled a breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Handled {
    /// Not handled
    No = 0,
    /// Handled by the user
    User = 1,
    /// Ignored by configuration
    Config = 2,
}

/// Services a loaded program can call
pub trait LoaderApi {
    /// Load and run an image by name; 0 on success, -1 on failure
    fn spawn(&self, path: &str, flags: LoadFlags, argv: &[&str], envp: Option<&[u8]>) -> i32;

    /// Print a string
    fn print_string(&self, s: &str, stream: Stream);

    /// Print an integer
    fn print_int(&self, value: i64, stream: Stream);

    /// Print an address
    fn print_pointer(&self, addr: u64, stream: Stream);

    /// Load from a configuration file; 0 on success, -1 on failure
    fn load_from_config(&self, path: &str) -> i32;

    /// Load from configuration text; 0 on success, -1 on failure
    fn load_from_config_text(&self, text: &str) -> i32;

    /// Load from prepared parameters; 0 on success, -1 on failure
    fn load_from_params(&self, params: &LaunchParams, flags: LoadFlags) -> i32;

    /// Report a breakpoint
    fn breakpoint(&self, id: i32, msg: &str) -> Handled;
}

/// What the dispatcher gets to start a program with
pub struct DispatchContext<'a> {
    /// Program PID
    pub pid: Pid,
    /// Region base
    pub base: u64,
    /// Absolute entry address
    pub entry: u64,
    /// Image carries the legacy machine id
    pub legacy: bool,
    /// Argument count
    pub argc: usize,
    /// Argument vector address
    pub argv: Option<u64>,
    /// Environment block address
    pub envp: Option<u64>,
    /// First core
    pub core_start: u32,
    /// Core count
    pub core_size: u32,
    /// Exclusive core use requested
    pub exclusive: bool,
    /// Byte order of the image
    pub endian: Endian,
    /// Shared memory
    pub memory: &'a dyn AddressSpace,
    /// Loader services
    pub api: &'a dyn LoaderApi,
}

fn read_c_string(memory: &dyn AddressSpace, mut addr: u64) -> LoadResult<String> {
    let mut bytes = Vec::new();
    loop {
        let mut b = [0u8; 1];
        memory.read(addr, &mut b)?;
        if b[0] == 0 {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        bytes.push(b[0]);
        addr += 1;
    }
}

impl DispatchContext<'_> {
    /// Read the staged argument strings back out of memory
    pub fn read_args(&self) -> LoadResult<Vec<String>> {
        let Some(argv) = self.argv else {
            return Ok(Vec::new());
        };
        (0..self.argc)
            .map(|i| {
                let ptr = self
                    .memory
                    .read_u64(argv + (i * POINTER_SIZE) as u64, self.endian)?;
                read_c_string(self.memory, ptr)
            })
            .collect()
    }

    /// Read the staged environment entries back out of memory
    pub fn read_env(&self) -> LoadResult<Vec<String>> {
        let Some(mut addr) = self.envp else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        loop {
            let entry = read_c_string(self.memory, addr)?;
            if entry.is_empty() {
                return Ok(entries);
            }
            addr += entry.len() as u64 + 1;
            entries.push(entry);
        }
    }
}

/// Starts a loaded program and waits for it
pub trait Dispatcher: Send + Sync {
    /// Run the program; returns its exit status
    fn dispatch(&self, ctx: &DispatchContext<'_>) -> i32;
}

/// Dispatcher backed by a closure
pub struct FnDispatcher<F>(F);

impl<F> FnDispatcher<F>
where
    F: Fn(&DispatchContext<'_>) -> i32 + Send + Sync,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Dispatcher for FnDispatcher<F>
where
    F: Fn(&DispatchContext<'_>) -> i32 + Send + Sync,
{
    fn dispatch(&self, ctx: &DispatchContext<'_>) -> i32 {
        (self.0)(ctx)
    }
}

/// Where images and configuration files come from
pub trait FileSource: Send + Sync {
    /// Contents of `path`, if present
    fn read(&self, path: &str) -> Option<Arc<[u8]>>;
}

/// In-memory file source
#[derive(Default)]
pub struct MemoryFiles {
    files: RwLock<BTreeMap<String, Arc<[u8]>>>,
}

impl MemoryFiles {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file
    pub fn insert(&self, path: impl Into<String>, contents: impl Into<Arc<[u8]>>) {
        self.files.write().insert(path.into(), contents.into());
    }

    /// Remove a file
    pub fn remove(&self, path: &str) -> bool {
        self.files.write().remove(path).is_some()
    }
}

impl FileSource for MemoryFiles {
    fn read(&self, path: &str) -> Option<Arc<[u8]>> {
        self.files.read().get(path).cloned()
    }
}

// ============================================================================
// LOADER
// ============================================================================

/// Result of a load that reached its entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    /// PID the program ran under (already free again)
    pub pid: Pid,
    /// Region base it ran at
    pub base: u64,
    /// Value the entry point returned
    pub exit_status: i32,
    /// Image carried the legacy machine id
    pub legacy: bool,
    /// Relocation counters
    pub stats: RelocationStats,
    /// Halves of argv/envp that were not staged
    pub dropped: FitFlags,
    /// Problems that did not stop the load
    pub warnings: Vec<LoadError>,
    /// Recorded ticks
    pub timings: Timings,
}

struct Ran {
    exit_status: i32,
    legacy: bool,
    stats: RelocationStats,
    dropped: FitFlags,
    warnings: Vec<LoadError>,
}

/// The program loader
pub struct Loader {
    config: LoaderConfig,
    table: ProcessTable,
    memory: Arc<dyn AddressSpace>,
    dispatcher: Arc<dyn Dispatcher>,
    files: Arc<dyn FileSource>,
    clock: Arc<dyn Clock>,
    console: LockedConsole,
}

impl Loader {
    /// Create a loader with an empty file source, a tick counter and a
    /// discarding console
    pub fn new(
        config: LoaderConfig,
        memory: Arc<dyn AddressSpace>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            table: ProcessTable::new(&config),
            config,
            memory,
            dispatcher,
            files: Arc::new(MemoryFiles::new()),
            clock: Arc::new(TickCounter::new()),
            console: LockedConsole::null(),
        }
    }

    /// Use `files` to resolve image and configuration names
    pub fn with_files(mut self, files: Arc<dyn FileSource>) -> Self {
        self.files = files;
        self
    }

    /// Use `clock` for load timing
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Route program output to `console`
    pub fn with_console(mut self, console: LockedConsole) -> Self {
        self.console = console;
        self
    }

    /// Loader configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// PID pool
    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    /// Shared memory
    pub fn memory(&self) -> &dyn AddressSpace {
        &*self.memory
    }

    /// Program output
    pub fn console(&self) -> &LockedConsole {
        &self.console
    }

    fn clock_for(&self, flags: LoadFlags) -> Option<&dyn Clock> {
        if flags.contains(LoadFlags::TIMEIT) {
            Some(&*self.clock)
        } else {
            None
        }
    }

    fn read_file(&self, path: &str, verbose: Verbosity) -> LoadResult<Arc<[u8]>> {
        self.files.read(path).ok_or_else(|| {
            diag!(verbose, Error, "{}: {}", path, LoadError::ImageNotFound);
            LoadError::ImageNotFound
        })
    }

    /// Load and run an image already in memory.
    ///
    /// `params.argv` is staged as given.
    pub fn load_image(
        &self,
        image: &[u8],
        params: &LaunchParams,
        flags: LoadFlags,
    ) -> LoadResult<LoadOutcome> {
        let clock = self.clock_for(flags);
        let mut entry = self.table.allocate(clock).map_err(|err| {
            diag!(params.verbose, Error, "{}: {}", params.fname, err);
            err
        })?;
        entry.verbose = params.verbose;
        entry.settings = flags;
        entry.fname = params.fname.clone();
        entry.core_start = params.core_start;
        entry.core_size = params.core_size;
        entry.time_callback = params.time_callback;

        let pid = entry.pid();
        let base = entry.base();
        let mut ctx = LoadContext::new(pid);
        let ran = self.run(image, params, &mut entry, &mut ctx, clock);
        if let Err(err) = &ran {
            diag!(entry.verbose, Error, "pid {} ({}): {}", pid, entry.fname, err);
            if let Err(refused) = ctx.transition_to(LoadState::Aborted) {
                diag!(entry.verbose, Trace, "pid {}: {}", pid, refused);
            }
        }

        let retired = self.table.retire(entry, &*self.memory, clock);
        let ran = ran?;
        let timings = retired?;
        ctx.transition_to(LoadState::Retired)?;

        Ok(LoadOutcome {
            pid,
            base,
            exit_status: ran.exit_status,
            legacy: ran.legacy,
            stats: ran.stats,
            dropped: ran.dropped,
            warnings: ran.warnings,
            timings,
        })
    }

    fn run(
        &self,
        image: &[u8],
        params: &LaunchParams,
        entry: &mut ProcessEntry,
        ctx: &mut LoadContext,
        clock: Option<&dyn Clock>,
    ) -> LoadResult<Ran> {
        let memory = &*self.memory;

        let parser = ElfParser::new(image, &self.config.target)?;
        ctx.transition_to(LoadState::HeaderValidated)?;

        diag!(
            entry.verbose,
            Debug,
            "pid {}: region 0x{:x}, lowest vaddr 0x{:x}",
            entry.pid(),
            entry.base(),
            parser.base_vaddr()
        );
        ctx.transition_to(LoadState::BaseComputed)?;

        let segments = SegmentLoader::new(memory).load(image, parser.program_headers(), entry)?;
        diag!(
            entry.verbose,
            Info,
            "pid {}: {} segments, {} bytes copied, {} zeroed",
            entry.pid(),
            segments.loaded,
            segments.bytes_copied,
            segments.bytes_zeroed
        );
        ctx.transition_to(LoadState::SegmentsLoaded)?;

        let report = RelocationEngine::new(image, parser.header(), memory).scan_and_relocate(entry)?;
        ctx.transition_to(LoadState::Relocated)?;

        let endian = parser.header().endian();
        let (dropped, injected) = ArgumentInjector::new(memory, endian).inject(
            entry,
            &params.argv,
            params.envp.as_deref(),
        );
        ctx.transition_to(LoadState::ArgumentsStaged)?;

        let dispatch = DispatchContext {
            pid: entry.pid(),
            base: entry.base(),
            entry: entry.base().wrapping_add(parser.entry_point()),
            legacy: parser.is_legacy(),
            argc: entry.argc,
            argv: entry.argv,
            envp: entry.envp,
            core_start: entry.core_start,
            core_size: entry.core_size,
            exclusive: entry.settings.contains(LoadFlags::EXCLUSIVE),
            endian,
            memory,
            api: self,
        };
        diag!(
            entry.verbose,
            Info,
            "pid {}: starting {} at 0x{:x}{}",
            entry.pid(),
            entry.fname,
            dispatch.entry,
            if dispatch.legacy { " (legacy)" } else { "" }
        );

        entry.timings.detached = clock.map(|c| c.now());
        ctx.transition_to(LoadState::Dispatched)?;
        let exit_status = self.dispatcher.dispatch(&dispatch);
        entry.timings.returned = clock.map(|c| c.now());

        if exit_status != 0 {
            diag!(
                entry.verbose,
                Warn,
                "pid {} ({}) returned {}",
                entry.pid(),
                entry.fname,
                exit_status
            );
        }

        let mut warnings = report.warnings;
        warnings.extend(injected);
        Ok(Ran {
            exit_status,
            legacy: dispatch.legacy,
            stats: report.stats,
            dropped,
            warnings,
        })
    }

    /// Load `path` from the file source.
    ///
    /// The path becomes `argv[0]` unless [`LoadFlags::NO_PROGNAME`] is set.
    pub fn load_file(
        &self,
        path: &str,
        flags: LoadFlags,
        argv: &[&str],
        envp: Option<&[u8]>,
    ) -> LoadResult<LoadOutcome> {
        let verbose = self.config.default_verbosity;
        let image = self.read_file(path, verbose)?;

        let mut params = LaunchParams::new(path).verbose(verbose);
        if !flags.contains(LoadFlags::NO_PROGNAME) {
            params.argv.push(String::from(path));
        }
        params.argv.extend(argv.iter().map(|&a| String::from(a)));
        params.envp = envp.map(<[u8]>::to_vec);

        self.load_image(&image, &params, flags)
    }

    /// Load `params.fname` from the file source with prepared parameters
    pub fn load_params(&self, params: &LaunchParams, flags: LoadFlags) -> LoadResult<LoadOutcome> {
        let image = self.read_file(&params.fname, params.verbose)?;
        self.load_image(&image, params, flags)
    }

    /// Parse configuration text and load what it describes
    pub fn load_config_text(&self, text: &str) -> LoadResult<LoadOutcome> {
        let config = LaunchConfig::parse(text).map_err(|err| {
            diag!(self.config.default_verbosity, Error, "config: {}", err);
            err
        })?;
        self.load_params(&config.params, config.flags)
    }

    /// Read a configuration file and load what it describes
    pub fn load_config(&self, path: &str) -> LoadResult<LoadOutcome> {
        let raw = self.read_file(path, self.config.default_verbosity)?;
        let text = core::str::from_utf8(&raw)
            .map_err(|_| LoadError::InvalidConfig("configuration is not UTF-8"))?;
        self.load_config_text(text)
    }
}

fn status<T>(result: LoadResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => -1,
    }
}

impl LoaderApi for Loader {
    fn spawn(&self, path: &str, flags: LoadFlags, argv: &[&str], envp: Option<&[u8]>) -> i32 {
        status(self.load_file(path, flags, argv, envp))
    }

    fn print_string(&self, s: &str, stream: Stream) {
        self.console.print_str(stream, s);
    }

    fn print_int(&self, value: i64, stream: Stream) {
        self.console.print_int(stream, value);
    }

    fn print_pointer(&self, addr: u64, stream: Stream) {
        self.console.print_pointer(stream, addr);
    }

    fn load_from_config(&self, path: &str) -> i32 {
        status(self.load_config(path))
    }

    fn load_from_config_text(&self, text: &str) -> i32 {
        status(self.load_config_text(text))
    }

    fn load_from_params(&self, params: &LaunchParams, flags: LoadFlags) -> i32 {
        status(self.load_params(params, flags))
    }

    fn breakpoint(&self, id: i32, msg: &str) -> Handled {
        log::debug!("breakpoint {}: {}", id, msg);
        Handled::User
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::alpha::R_ALPHA_RELATIVE;
    use crate::arch::{TargetSpec, EM_ALPHA};
    use crate::console::BufferConsole;
    use crate::elf::{ELFDATA2MSB, PF_R, PF_W, PF_X};
    use crate::memory::{MemoryError, Permissions, SparseMemory};
    use crate::testing::{ImageBuilder, RelocSpec, SegmentSpec};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use spin::Mutex;
    use std::thread;
    use std::vec;

    fn config() -> LoaderConfig {
        LoaderConfig::builder()
            .capacity(16)
            .region_origin(0x1_0000_0000)
            .region_stride(0x1000_0000)
            .build()
            .unwrap()
    }

    fn loader<F>(f: F) -> (Loader, Arc<SparseMemory>)
    where
        F: Fn(&DispatchContext<'_>) -> i32 + Send + Sync + 'static,
    {
        let memory = Arc::new(SparseMemory::new());
        let loader = Loader::new(config(), memory.clone(), Arc::new(FnDispatcher::new(f)));
        (loader, memory)
    }

    /// Image with argument and environment rooms and one relocated pointer
    fn program() -> Vec<u8> {
        ImageBuilder::new()
            .entry(0x1000)
            .segment(SegmentSpec::new(0x1000, vec![0xC3; 0x20], 0x20))
            .segment(SegmentSpec::new(0x2000, vec![0u8; 0x10], 0x200))
            .symbol("__loader_room_argv", 0x2010, 0x40)
            .symbol("__loader_room_env", 0x2100, 0x80)
            .relocation(RelocSpec::rela(0x2000, 0, R_ALPHA_RELATIVE, 0x1000))
            .build()
    }

    #[test]
    fn test_two_segment_image_end_to_end() {
        let image = ImageBuilder::new()
            .entry(0x1008)
            .segment(SegmentSpec::new(0x1000, vec![0xAA; 16], 0x20))
            .segment(SegmentSpec::new(0x3000, vec![0xBB; 8], 8))
            .build();
        let (loader, memory) = loader(|ctx| {
            assert_eq!(ctx.entry, ctx.base + 0x1008);
            let mut first = [0u8; 0x20];
            ctx.memory.read(ctx.base + 0x1000, &mut first).unwrap();
            assert_eq!(&first[..16], &[0xAA; 16]);
            assert_eq!(&first[16..], &[0u8; 16]);
            let mut second = [0u8; 8];
            ctx.memory.read(ctx.base + 0x3000, &mut second).unwrap();
            assert_eq!(second, [0xBB; 8]);
            7
        });

        let outcome = loader
            .load_image(&image, &LaunchParams::new("two"), LoadFlags::empty())
            .unwrap();
        assert_eq!(outcome.exit_status, 7);
        assert_eq!(outcome.pid, Pid::new(1));
        assert_eq!(outcome.base, 0x1_0000_0000 + 0x1000_0000);
        assert!(!outcome.legacy);
        assert_eq!(loader.table().in_use(), 0);
        assert_eq!(memory.page_count(), 0);
    }

    #[test]
    fn test_code_and_bss_segments() {
        let code = vec![0x47, 0xFF, 0x04, 0x1F, 0x6B, 0xFA, 0x80, 0x01];
        let image = ImageBuilder::new()
            .entry(0x1000)
            .segment(SegmentSpec::new(0x1000, code.clone(), code.len() as u64).flags(PF_R | PF_X))
            .segment(SegmentSpec::new(0x2000, Vec::new(), 4096).flags(PF_R | PF_W))
            .build();
        let (loader, _) = loader(move |ctx| {
            let mut text = [0u8; 8];
            ctx.memory.read(ctx.base + 0x1000, &mut text).unwrap();
            assert_eq!(&text[..], &code[..]);
            let mut bss = vec![0xFFu8; 4096];
            ctx.memory.read(ctx.base + 0x2000, &mut bss).unwrap();
            assert!(bss.iter().all(|&b| b == 0));
            0
        });
        loader
            .load_image(&image, &LaunchParams::new("bss"), LoadFlags::empty())
            .unwrap();
    }

    #[test]
    fn test_arguments_fit_and_argv0_is_first() {
        let (loader, _) = loader(|ctx| {
            assert_eq!(ctx.argc, 2);
            assert_eq!(ctx.read_args().unwrap(), vec!["a", "bb"]);
            assert_eq!(ctx.read_env().unwrap(), vec!["HOME=/", "X=1"]);
            assert_eq!(ctx.memory.read_u64(ctx.base + 0x2000, ctx.endian), Ok(ctx.base + 0x1000));
            0
        });
        let params = LaunchParams::new("p").args(["a", "bb"]).env(&["HOME=/", "X=1"]);
        let outcome = loader.load_image(&program(), &params, LoadFlags::empty()).unwrap();
        assert!(outcome.dropped.is_empty());
        assert_eq!(outcome.stats.base_relative, 1);
    }

    #[test]
    fn test_oversize_arguments_are_dropped_not_fatal() {
        let (loader, _) = loader(|ctx| {
            assert_eq!(ctx.argc, 0);
            assert_eq!(ctx.argv, None);
            assert!(ctx.envp.is_some());
            0
        });
        let long = "x".repeat(100);
        let params = LaunchParams::new("p").args([long.as_str()]).env(&["A=1"]);
        let outcome = loader.load_image(&program(), &params, LoadFlags::empty()).unwrap();
        assert_eq!(outcome.dropped, FitFlags::ARGS);
        assert!(matches!(outcome.warnings[0], LoadError::ArgumentsTooLarge { .. }));
    }

    #[test]
    fn test_room_in_neighbour_region_is_not_written() {
        let (loader, memory) = loader(|ctx| {
            assert_eq!(ctx.argc, 0);
            assert_eq!(ctx.argv, None);
            0
        });
        let stride = loader.config().region_stride;
        let neighbour = 0x1_0000_0000 + 2 * stride;
        memory
            .reserve(Pid::new(2), neighbour, 0x10, Permissions::all())
            .unwrap();
        memory.write(neighbour, &[0x5A; 0x10]).unwrap();

        let image = ImageBuilder::new()
            .segment(SegmentSpec::new(0x1000, vec![0u8; 0x10], 0x10))
            .symbol("__loader_room_argv", stride, 0x40)
            .build();
        let params = LaunchParams::new("p").args(["a"]);
        let outcome = loader.load_image(&image, &params, LoadFlags::empty()).unwrap();
        assert_eq!(outcome.pid, Pid::new(1));
        assert!(matches!(
            outcome.warnings[0],
            LoadError::RoomOutsideRegion { offset, .. } if offset == stride
        ));

        let mut cells = [0u8; 0x10];
        memory.read(neighbour, &mut cells).unwrap();
        assert_eq!(cells, [0x5A; 0x10]);
    }

    struct CountingMemory {
        inner: SparseMemory,
        reserves: AtomicUsize,
    }

    impl AddressSpace for CountingMemory {
        fn reserve(&self, pid: Pid, addr: u64, len: u64, perms: Permissions) -> Result<(), MemoryError> {
            self.reserves.fetch_add(1, Ordering::SeqCst);
            self.inner.reserve(pid, addr, len, perms)
        }
        fn release_all(&self, pid: Pid) -> Result<usize, MemoryError> {
            self.inner.release_all(pid)
        }
        fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
            self.inner.write(addr, data)
        }
        fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
            self.inner.read(addr, buf)
        }
        fn fill(&self, addr: u64, len: u64, byte: u8) -> Result<(), MemoryError> {
            self.inner.fill(addr, len, byte)
        }
    }

    #[test]
    fn test_bad_signature_never_reserves() {
        let memory = Arc::new(CountingMemory {
            inner: SparseMemory::new(),
            reserves: AtomicUsize::new(0),
        });
        let dispatched = Arc::new(AtomicUsize::new(0));
        let seen = dispatched.clone();
        let loader = Loader::new(
            config(),
            memory.clone(),
            Arc::new(FnDispatcher::new(move |_: &DispatchContext<'_>| {
                seen.fetch_add(1, Ordering::SeqCst);
                0
            })),
        );

        let mut image = program();
        image[0] = 0x7E;
        let err = loader
            .load_image(&image, &LaunchParams::new("bad"), LoadFlags::empty())
            .unwrap_err();
        assert_eq!(err, LoadError::BadSignature);
        assert_eq!(memory.reserves.load(Ordering::SeqCst), 0);
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
        assert_eq!(loader.table().in_use(), 0);
    }

    #[test]
    fn test_failed_load_releases_partial_segments() {
        let (loader, memory) = loader(|_| 0);
        let image = ImageBuilder::new()
            .segment(SegmentSpec::new(0, vec![0u8; 0x10], 0x10))
            .relocation(RelocSpec::rela(0x2000_0000, 0, R_ALPHA_RELATIVE, 0))
            .build();
        let err = loader
            .load_image(&image, &LaunchParams::new("r"), LoadFlags::empty())
            .unwrap_err();
        assert_eq!(err, LoadError::RelocationOutOfBounds(0x2000_0000));
        assert_eq!(memory.page_count(), 0);
        assert_eq!(loader.table().next_free(), Some(Pid::new(1)));
    }

    #[test]
    fn test_legacy_and_placement_reach_dispatcher() {
        let image = ImageBuilder::new()
            .machine(EM_ALPHA)
            .segment(SegmentSpec::new(0, vec![1], 1))
            .build();
        let (loader, _) = loader(|ctx| {
            assert!(ctx.legacy);
            assert!(ctx.exclusive);
            assert_eq!((ctx.core_start, ctx.core_size), (4, 2));
            0
        });
        let params = LaunchParams::new("old").cores(4, 2);
        let outcome = loader.load_image(&image, &params, LoadFlags::EXCLUSIVE).unwrap();
        assert!(outcome.legacy);
    }

    #[test]
    fn test_big_endian_target() {
        let target = TargetSpec {
            data: ELFDATA2MSB,
            ..TargetSpec::default()
        };
        let config = LoaderConfig::builder()
            .capacity(4)
            .region_origin(0x1_0000_0000)
            .region_stride(0x1000_0000)
            .target(target)
            .build()
            .unwrap();
        let loader = Loader::new(
            config,
            Arc::new(SparseMemory::new()),
            Arc::new(FnDispatcher::new(|ctx: &DispatchContext<'_>| {
                assert_eq!(ctx.endian, Endian::Big);
                assert_eq!(ctx.read_args().unwrap(), vec!["big"]);
                let cell = ctx.memory.read_u64(ctx.base + 0x2000, Endian::Big).unwrap();
                (cell - ctx.base) as i32
            })),
        );
        let image = ImageBuilder::new()
            .endian(Endian::Big)
            .segment(SegmentSpec::new(0x2000, vec![0u8; 0x10], 0x100))
            .symbol("__loader_room_argv", 0x2040, 0x40)
            .relocation(RelocSpec::rela(0x2000, 0, R_ALPHA_RELATIVE, 0x99))
            .build();
        let params = LaunchParams::new("be").args(["big"]);
        let outcome = loader.load_image(&image, &params, LoadFlags::empty()).unwrap();
        assert_eq!(outcome.exit_status, 0x99);
    }

    #[test]
    fn test_spawn_from_file_source_prepends_name() {
        let files = Arc::new(MemoryFiles::new());
        files.insert("bin/prog", program());
        let (loader, _) = loader(|ctx| {
            let args = ctx.read_args().unwrap();
            (args.len() * 10 + usize::from(args[0] == "bin/prog")) as i32
        });
        let loader = loader.with_files(files);

        let outcome = loader
            .load_file("bin/prog", LoadFlags::empty(), &["x"], None)
            .unwrap();
        assert_eq!(outcome.exit_status, 21);

        let outcome = loader
            .load_file("bin/prog", LoadFlags::NO_PROGNAME, &["x"], None)
            .unwrap();
        assert_eq!(outcome.exit_status, 10);

        assert_eq!(loader.spawn("bin/missing", LoadFlags::empty(), &[], None), -1);
        assert_eq!(
            loader.load_file("bin/missing", LoadFlags::empty(), &[], None).unwrap_err(),
            LoadError::ImageNotFound
        );
    }

    #[test]
    fn test_load_from_config() {
        let files = Arc::new(MemoryFiles::new());
        files.insert("bin/prog", program());
        files.insert(
            "etc/prog.conf",
            &b"filename=bin/prog\ncore_size=3\n\nhello\n\nLANG=C\n"[..],
        );
        let (loader, _) = loader(|ctx| {
            assert_eq!(ctx.read_args().unwrap(), vec!["bin/prog", "hello"]);
            assert_eq!(ctx.read_env().unwrap(), vec!["LANG=C"]);
            ctx.core_size as i32
        });
        let loader = loader.with_files(files);
        assert_eq!(loader.load_config("etc/prog.conf").unwrap().exit_status, 3);
        assert_eq!(loader.load_from_config("etc/none.conf"), -1);
        assert_eq!(loader.load_from_config_text("core_size=1\n"), -1);
    }

    static TIMED: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn test_timing() {
        let (loader, _) = loader(|_| 0);
        let params = LaunchParams::new("t").time_callback(|entry| {
            assert!(entry.timings.returned.is_some());
            TIMED.fetch_add(1, Ordering::SeqCst);
        });
        let outcome = loader.load_image(&program(), &params, LoadFlags::TIMEIT).unwrap();
        let t = outcome.timings;
        assert!(t.created < t.detached && t.detached < t.returned && t.returned < t.cleaned_up);
        assert_eq!(TIMED.load(Ordering::SeqCst), 1);

        let outcome = loader.load_image(&program(), &params, LoadFlags::empty()).unwrap();
        assert_eq!(outcome.timings, Timings::default());
        assert_eq!(TIMED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recursive_spawn() {
        let files = Arc::new(MemoryFiles::new());
        files.insert("spawny", program());
        let pids = Arc::new(Mutex::new(Vec::new()));
        let record = pids.clone();
        let (loader, memory) = loader(move |ctx| {
            record.lock().push(ctx.pid);
            let args = ctx.read_args().unwrap();
            let letter = args[1].as_bytes()[0];
            if letter < b'c' {
                let next = String::from(char::from(letter + 1));
                let child = LaunchParams::new("spawny").args([args[0].clone(), next]);
                assert_eq!(ctx.api.load_from_params(&child, LoadFlags::empty()), 0);
                assert_eq!(ctx.api.load_from_params(&child, LoadFlags::empty()), 0);
            }
            0
        });
        let loader = loader.with_files(files);

        assert_eq!(loader.spawn("spawny", LoadFlags::empty(), &["a"], None), 0);
        let pids = pids.lock();
        // a spawns two b's, each b spawns two c's
        assert_eq!(pids.len(), 7);
        assert_eq!(&pids[..3], &[Pid::new(1), Pid::new(2), Pid::new(3)]);
        assert_eq!(loader.table().in_use(), 0);
        assert_eq!(memory.page_count(), 0);
    }

    #[test]
    fn test_nested_spawn_hits_pool_exhaustion() {
        let files = Arc::new(MemoryFiles::new());
        files.insert("p", program());
        let memory = Arc::new(SparseMemory::new());
        let config = LoaderConfig::builder()
            .capacity(2)
            .region_origin(0x1_0000_0000)
            .region_stride(0x1000_0000)
            .build()
            .unwrap();
        let loader = Loader::new(
            config,
            memory,
            Arc::new(FnDispatcher::new(|ctx: &DispatchContext<'_>| {
                ctx.api.spawn("p", LoadFlags::empty(), &[], None)
            })),
        )
        .with_files(files);

        let outcome = loader.load_file("p", LoadFlags::empty(), &[], None).unwrap();
        assert_eq!(outcome.exit_status, -1);
        assert_eq!(loader.table().in_use(), 0);
    }

    #[test]
    fn test_api_print_and_breakpoint() {
        let buffer = BufferConsole::new();
        let (loader, _) = loader(|ctx| {
            ctx.api.print_string("pid ", Stream::Out);
            ctx.api.print_int(ctx.pid.as_u32() as i64, Stream::Out);
            ctx.api.print_pointer(0x10, Stream::Err);
            ctx.api.breakpoint(3, "here") as i32
        });
        let loader = loader.with_console(LockedConsole::new(buffer.clone()));
        let outcome = loader
            .load_image(&program(), &LaunchParams::new("p"), LoadFlags::empty())
            .unwrap();
        assert_eq!(outcome.exit_status, Handled::User as i32);
        assert_eq!(buffer.contents(Stream::Out), "pid 1");
        assert_eq!(buffer.contents(Stream::Err), "0x10");
    }

    #[test]
    fn test_concurrent_loads() {
        let (loader, memory) = loader(|ctx| {
            let args = ctx.read_args().unwrap();
            args[0].parse::<i32>().unwrap()
        });
        let loader = Arc::new(loader);
        let image: Arc<[u8]> = program().into();

        let handles: Vec<_> = (0..6)
            .map(|t| {
                let loader = loader.clone();
                let image = image.clone();
                thread::spawn(move || {
                    for i in 0..20 {
                        let n = t * 100 + i;
                        let params = LaunchParams::new("c").args([std::format!("{}", n)]);
                        let outcome = loader.load_image(&image, &params, LoadFlags::empty()).unwrap();
                        assert_eq!(outcome.exit_status, n);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(loader.table().in_use(), 0);
        assert_eq!(memory.page_count(), 0);
    }
}
