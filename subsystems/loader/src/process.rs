//! # Process Table
//!
//! Fixed pool of PIDs handed out from an intrusive free list. Slot 0 is never
//! allocated; the free list links slot indices and uses 0 as its terminator.
//!
//! A [`ProcessEntry`] is the only proof that a PID is allocated. It cannot be
//! cloned and [`ProcessTable::retire`] consumes it, so the same PID can never
//! be live twice.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::context::{LoaderConfig, Verbosity};
use crate::loader::LoadFlags;
use crate::memory::AddressSpace;
use crate::{LoadError, LoadResult};

// ============================================================================
// PID
// ============================================================================

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    /// Wrap a raw value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// CLOCK
// ============================================================================

/// Monotonic tick source used for load timing
pub trait Clock: Send + Sync {
    /// Current tick
    fn now(&self) -> u64;
}

/// Clock that advances by one on every read
#[derive(Debug, Default)]
pub struct TickCounter {
    ticks: AtomicU64,
}

impl TickCounter {
    /// Start at zero
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }
}

impl Clock for TickCounter {
    fn now(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed)
    }
}

// ============================================================================
// ENTRY
// ============================================================================

/// Staging area declared by an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Room {
    /// Absolute address
    pub address: u64,
    /// Capacity in bytes
    pub size: u64,
}

/// Ticks recorded over one load; all `None` unless timing was requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    /// PID allocated
    pub created: Option<u64>,
    /// Entry point called
    pub detached: Option<u64>,
    /// Entry point returned
    pub returned: Option<u64>,
    /// Memory released
    pub cleaned_up: Option<u64>,
}

fn span(from: Option<u64>, to: Option<u64>) -> Option<u64> {
    Some(to?.saturating_sub(from?))
}

impl Timings {
    /// Ticks from allocation to dispatch
    pub fn setup(&self) -> Option<u64> {
        span(self.created, self.detached)
    }

    /// Ticks spent in the program
    pub fn run(&self) -> Option<u64> {
        span(self.detached, self.returned)
    }

    /// Ticks from return to release
    pub fn cleanup(&self) -> Option<u64> {
        span(self.returned, self.cleaned_up)
    }
}

impl fmt::Display for Timings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<u64>| v.map_or(-1, |t| t as i128);
        write!(
            f,
            "setup {} ticks, run {} ticks, cleanup {} ticks",
            show(self.setup()),
            show(self.run()),
            show(self.cleanup())
        )
    }
}

/// Callback run at retirement when timing was requested
pub type TimeCallback = fn(&ProcessEntry);

/// Per-load record
#[derive(Debug)]
pub struct ProcessEntry {
    pid: Pid,
    base: u64,
    region_size: u64,
    /// Diagnostic level
    pub verbose: Verbosity,
    /// Load flags
    pub settings: LoadFlags,
    /// Image name
    pub fname: String,
    /// First core the program may run on
    pub core_start: u32,
    /// Number of cores the program may run on
    pub core_size: u32,
    /// Staged argument count
    pub argc: usize,
    /// Staged argument vector
    pub argv: Option<u64>,
    /// Staged environment block
    pub envp: Option<u64>,
    /// Load timing
    pub timings: Timings,
    /// Timing callback
    pub time_callback: Option<TimeCallback>,
    /// Argument room found in the image
    pub arg_room: Option<Room>,
    /// Environment room found in the image
    pub env_room: Option<Room>,
}

impl ProcessEntry {
    /// Allocated PID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Region base
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Region size
    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    /// Check whether `[offset, offset + len)` lies inside the region
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end <= self.region_size)
    }
}

// ============================================================================
// TABLE
// ============================================================================

struct FreeList {
    next: Vec<u32>,
    in_use: Vec<bool>,
    head: u32,
}

/// PID pool
pub struct ProcessTable {
    free: Mutex<FreeList>,
    config: LoaderConfig,
}

impl ProcessTable {
    /// Build the pool described by `config`
    pub fn new(config: &LoaderConfig) -> Self {
        let slots = config.capacity;
        // 1 -> 2 -> ... -> slots-1 -> 0
        let next = (0..slots)
            .map(|i| if i + 1 < slots { i as u32 + 1 } else { 0 })
            .collect();

        Self {
            free: Mutex::new(FreeList {
                next,
                in_use: alloc::vec![false; slots],
                head: if slots > 1 { 1 } else { 0 },
            }),
            config: *config,
        }
    }

    /// Usable PIDs
    pub fn capacity(&self) -> usize {
        self.config.capacity - 1
    }

    /// PIDs currently allocated
    pub fn in_use(&self) -> usize {
        self.free.lock().in_use.iter().filter(|&&b| b).count()
    }

    /// PID the next allocation will return
    pub fn next_free(&self) -> Option<Pid> {
        match self.free.lock().head {
            0 => None,
            head => Some(Pid(head)),
        }
    }

    /// Check whether `pid` is allocated
    pub fn is_allocated(&self, pid: Pid) -> bool {
        self.free
            .lock()
            .in_use
            .get(pid.0 as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Take a PID off the free list
    pub fn allocate(&self, clock: Option<&dyn Clock>) -> LoadResult<ProcessEntry> {
        let pid = {
            let mut free = self.free.lock();
            let head = free.head;
            if head == 0 {
                return Err(LoadError::PoolExhausted);
            }
            free.head = free.next[head as usize];
            free.in_use[head as usize] = true;
            Pid(head)
        };

        Ok(ProcessEntry {
            pid,
            base: self.config.region_base(pid),
            region_size: self.config.region_stride,
            verbose: self.config.default_verbosity,
            settings: LoadFlags::empty(),
            fname: String::new(),
            core_start: 0,
            core_size: 1,
            argc: 0,
            argv: None,
            envp: None,
            timings: Timings {
                created: clock.map(|c| c.now()),
                ..Timings::default()
            },
            time_callback: None,
            arg_room: None,
            env_room: None,
        })
    }

    /// Release `entry`'s memory and return its PID to the pool.
    ///
    /// The PID only becomes allocatable again after the release succeeded,
    /// the timing report was produced and the callback returned. If the
    /// release fails the PID stays out of the pool.
    pub fn retire(
        &self,
        mut entry: ProcessEntry,
        memory: &dyn AddressSpace,
        clock: Option<&dyn Clock>,
    ) -> LoadResult<Timings> {
        let pid = entry.pid;
        if !self.is_allocated(pid) {
            return Err(LoadError::InvalidPid(pid.0));
        }

        match memory.release_all(pid) {
            Ok(pages) => diag!(entry.verbose, Debug, "pid {}: released {} pages", pid, pages),
            Err(err) => {
                diag!(entry.verbose, Error, "pid {}: release failed, PID withheld: {}", pid, err);
                return Err(err.into());
            },
        }

        entry.timings.cleaned_up = clock.map(|c| c.now());
        if entry.settings.contains(LoadFlags::TIMEIT) {
            log::info!("pid {} ({}): {}", pid, entry.fname, entry.timings);
            if let Some(callback) = entry.time_callback {
                callback(&entry);
            }
        }
        let timings = entry.timings;

        let mut free = self.free.lock();
        free.in_use[pid.0 as usize] = false;
        free.next[pid.0 as usize] = free.head;
        free.head = pid.0;
        Ok(timings)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Permissions, SparseMemory};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn table(slots: usize) -> ProcessTable {
        let config = LoaderConfig::builder().capacity(slots).build().unwrap();
        ProcessTable::new(&config)
    }

    #[test]
    fn test_first_allocation_skips_slot_zero() {
        let table = table(8);
        let entry = table.allocate(None).unwrap();
        assert_eq!(entry.pid(), Pid::new(1));
        assert_eq!(entry.base(), (1u64 << 50) + (1u64 << 50));
        assert_eq!(entry.region_size(), 1 << 50);
        assert_eq!(table.capacity(), 7);
    }

    #[test]
    fn test_retire_makes_pid_reusable() {
        let table = table(8);
        let mem = SparseMemory::new();
        let entry = table.allocate(None).unwrap();
        let pid = entry.pid();
        let base = entry.base();
        mem.reserve(pid, base, 0x100, Permissions::RWX).unwrap();

        table.retire(entry, &mem, None).unwrap();
        assert_eq!(mem.pages_owned(pid), 0);
        assert!(!table.is_allocated(pid));

        let again = table.allocate(None).unwrap();
        assert_eq!(again.pid(), pid);
        assert_eq!(again.base(), base);
    }

    #[test]
    fn test_pool_exhaustion() {
        let table = table(4);
        let held: Vec<_> = (0..3).map(|_| table.allocate(None).unwrap()).collect();
        assert_eq!(table.allocate(None).err(), Some(LoadError::PoolExhausted));
        assert_eq!(table.in_use(), 3);
        assert_eq!(table.next_free(), None);

        let mem = SparseMemory::new();
        for entry in held {
            table.retire(entry, &mem, None).unwrap();
        }
        assert_eq!(table.in_use(), 0);
        assert!(table.next_free().is_some());
    }

    #[test]
    fn test_lifo_reuse() {
        let table = table(8);
        let mem = SparseMemory::new();
        let a = table.allocate(None).unwrap();
        let b = table.allocate(None).unwrap();
        let b_pid = b.pid();
        table.retire(b, &mem, None).unwrap();
        assert_eq!(table.next_free(), Some(b_pid));
        table.retire(a, &mem, None).unwrap();
    }

    static CALLBACKS: AtomicUsize = AtomicUsize::new(0);

    fn count_callback(entry: &ProcessEntry) {
        assert!(entry.timings.cleaned_up.is_some());
        CALLBACKS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_timing_callback_runs_before_pid_reuse() {
        let table = table(4);
        let mem = SparseMemory::new();
        let clock = TickCounter::new();
        let mut entry = table.allocate(Some(&clock)).unwrap();
        entry.settings = LoadFlags::TIMEIT;
        entry.time_callback = Some(count_callback);
        entry.timings.detached = Some(clock.now());
        entry.timings.returned = Some(clock.now());

        let timings = table.retire(entry, &mem, Some(&clock)).unwrap();
        assert_eq!(CALLBACKS.load(Ordering::SeqCst), 1);
        assert_eq!(timings.created, Some(0));
        assert_eq!(timings.setup(), Some(1));
        assert_eq!(timings.run(), Some(1));
        assert_eq!(timings.cleanup(), Some(1));
    }

    #[test]
    fn test_untimed_retire_skips_callback() {
        let table = table(4);
        let mem = SparseMemory::new();
        let mut entry = table.allocate(None).unwrap();
        entry.time_callback = Some(|_| panic!("callback without TIMEIT"));
        let timings = table.retire(entry, &mem, None).unwrap();
        assert_eq!(timings, Timings::default());
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let table = Arc::new(table(64));
        let mem = Arc::new(SparseMemory::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let mem = mem.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..100 {
                        let entry = table.allocate(None).unwrap();
                        let pid = entry.pid();
                        mem.reserve(pid, entry.base(), 8, Permissions::RWX).unwrap();
                        seen.push(pid);
                        table.retire(entry, &*mem, None).unwrap();
                    }
                    seen
                })
            })
            .collect();

        for h in handles {
            let pids: BTreeSet<_> = h.join().unwrap().into_iter().collect();
            assert!(pids.iter().all(|p| p.as_u32() >= 1 && p.as_u32() < 64));
        }
        assert_eq!(table.in_use(), 0);
        assert_eq!(mem.page_count(), 0);
    }

    #[test]
    fn test_simultaneous_holders_never_share_a_pid() {
        let table = Arc::new(table(32));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    (0..7)
                        .map(|_| table.allocate(None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut pids = BTreeSet::new();
        let mut entries = Vec::new();
        for h in handles {
            for entry in h.join().unwrap() {
                assert!(pids.insert(entry.pid()));
                entries.push(entry);
            }
        }
        assert_eq!(pids.len(), 28);
        let mem = SparseMemory::new();
        for entry in entries {
            table.retire(entry, &mem, None).unwrap();
        }
    }
}
