//! # Load Context
//!
//! Loader-wide configuration, per-load verbosity, and the state machine one
//! load walks through.

use crate::arch::TargetSpec;
use crate::process::Pid;
use crate::{LoadError, LoadResult};

/// Default number of PID slots, slot 0 included
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default base of PID 0's region
pub const DEFAULT_REGION_ORIGIN: u64 = 1 << 50;

/// Default region size per PID
pub const DEFAULT_REGION_STRIDE: u64 = 1 << 50;

// ============================================================================
// VERBOSITY
// ============================================================================

/// Diagnostic level of one load.
///
/// Level `n` lets through log records whose `log::Level` number is at most
/// `n`, so 0 is silent, 1 errors only and 5 or more everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Verbosity(pub u8);

impl Verbosity {
    /// Nothing
    pub const SILENT: Self = Self(0);
    /// Errors
    pub const ERROR: Self = Self(1);
    /// Errors and warnings
    pub const WARN: Self = Self(2);
    /// Progress messages
    pub const INFO: Self = Self(3);
    /// Per-segment and per-symbol detail
    pub const DEBUG: Self = Self(4);
    /// Everything
    pub const MAX: Self = Self(u8::MAX);

    /// Check whether records at `level` pass
    pub fn allows(self, level: log::Level) -> bool {
        self.0 as usize >= level as usize
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Self::ERROR
    }
}

// ============================================================================
// LOAD STATE
// ============================================================================

/// Stage a load has reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// PID and base assigned
    Allocated,
    /// Header checks passed
    HeaderValidated,
    /// Program headers decoded and base hint known
    BaseComputed,
    /// Segments copied and zero-filled
    SegmentsLoaded,
    /// Relocations applied and rooms located
    Relocated,
    /// Arguments and environment staged
    ArgumentsStaged,
    /// Control handed to the entry point
    Dispatched,
    /// PID returned to the pool
    Retired,
    /// Load failed before dispatch
    Aborted,
}

impl LoadState {
    /// Check whether `next` may follow `self`
    pub fn can_transition_to(self, next: LoadState) -> bool {
        use LoadState::*;
        matches!(
            (self, next),
            (Allocated, HeaderValidated)
                | (HeaderValidated, BaseComputed)
                | (BaseComputed, SegmentsLoaded)
                | (SegmentsLoaded, Relocated)
                | (Relocated, ArgumentsStaged)
                | (ArgumentsStaged, Dispatched)
                | (Dispatched, Retired)
                | (Allocated | HeaderValidated | BaseComputed | SegmentsLoaded | Relocated, Aborted)
                | (Aborted, Retired)
        )
    }
}

/// Progress of one load
#[derive(Debug, Clone, Copy)]
pub struct LoadContext {
    /// PID being loaded
    pub pid: Pid,
    state: LoadState,
}

impl LoadContext {
    /// Start tracking a freshly allocated PID
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            state: LoadState::Allocated,
        }
    }

    /// Current state
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Move to the next state
    pub fn transition_to(&mut self, new_state: LoadState) -> LoadResult<()> {
        if self.state.can_transition_to(new_state) {
            log::trace!("pid {}: {:?} -> {:?}", self.pid, self.state, new_state);
            self.state = new_state;
            Ok(())
        } else {
            Err(LoadError::InvalidTransition {
                from: self.state,
                to: new_state,
            })
        }
    }
}

// ============================================================================
// LOADER CONFIG
// ============================================================================

/// Loader-wide settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// PID slots, slot 0 included
    pub capacity: usize,
    /// Base of slot 0's region
    pub region_origin: u64,
    /// Region size per PID
    pub region_stride: u64,
    /// Accepted image identification
    pub target: TargetSpec,
    /// Verbosity for loads that do not set their own
    pub default_verbosity: Verbosity,
}

impl LoaderConfig {
    /// Create a builder
    pub fn builder() -> LoaderConfigBuilder {
        LoaderConfigBuilder::new()
    }

    /// Base address of `pid`'s region
    pub fn region_base(&self, pid: Pid) -> u64 {
        self.region_origin + pid.as_u32() as u64 * self.region_stride
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            region_origin: DEFAULT_REGION_ORIGIN,
            region_stride: DEFAULT_REGION_STRIDE,
            target: TargetSpec::default(),
            default_verbosity: Verbosity::default(),
        }
    }
}

/// Builder for LoaderConfig
#[derive(Debug, Default)]
pub struct LoaderConfigBuilder {
    capacity: Option<usize>,
    region_origin: Option<u64>,
    region_stride: Option<u64>,
    target: Option<TargetSpec>,
    default_verbosity: Option<Verbosity>,
}

impl LoaderConfigBuilder {
    /// Create new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set PID slot count
    pub fn capacity(mut self, slots: usize) -> Self {
        self.capacity = Some(slots);
        self
    }

    /// Set base of slot 0's region
    pub fn region_origin(mut self, origin: u64) -> Self {
        self.region_origin = Some(origin);
        self
    }

    /// Set region size per PID
    pub fn region_stride(mut self, stride: u64) -> Self {
        self.region_stride = Some(stride);
        self
    }

    /// Set accepted image identification
    pub fn target(mut self, target: TargetSpec) -> Self {
        self.target = Some(target);
        self
    }

    /// Set fallback verbosity
    pub fn default_verbosity(mut self, verbose: Verbosity) -> Self {
        self.default_verbosity = Some(verbose);
        self
    }

    /// Build the config
    pub fn build(self) -> LoadResult<LoaderConfig> {
        let defaults = LoaderConfig::default();
        let config = LoaderConfig {
            capacity: self.capacity.unwrap_or(defaults.capacity),
            region_origin: self.region_origin.unwrap_or(defaults.region_origin),
            region_stride: self.region_stride.unwrap_or(defaults.region_stride),
            target: self.target.unwrap_or(defaults.target),
            default_verbosity: self.default_verbosity.unwrap_or(defaults.default_verbosity),
        };

        if config.capacity < 2 {
            return Err(LoadError::InvalidConfig("capacity must leave at least one usable PID"));
        }
        if config.capacity > u32::MAX as usize {
            return Err(LoadError::InvalidConfig("capacity exceeds the PID range"));
        }
        if config.region_stride == 0 {
            return Err(LoadError::InvalidConfig("region stride must be non-zero"));
        }

        // The last region must end inside the address space
        let last_end = (config.capacity as u64)
            .checked_mul(config.region_stride)
            .and_then(|span| span.checked_add(config.region_origin));
        if last_end.is_none() {
            return Err(LoadError::InvalidConfig("regions overflow the address space"));
        }

        Ok(config)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_gating() {
        assert!(!Verbosity::SILENT.allows(log::Level::Error));
        assert!(Verbosity::ERROR.allows(log::Level::Error));
        assert!(!Verbosity::ERROR.allows(log::Level::Warn));
        assert!(Verbosity::INFO.allows(log::Level::Warn));
        assert!(!Verbosity::INFO.allows(log::Level::Debug));
        assert!(Verbosity::MAX.allows(log::Level::Trace));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut ctx = LoadContext::new(Pid::new(1));
        for next in [
            LoadState::HeaderValidated,
            LoadState::BaseComputed,
            LoadState::SegmentsLoaded,
            LoadState::Relocated,
            LoadState::ArgumentsStaged,
            LoadState::Dispatched,
            LoadState::Retired,
        ] {
            ctx.transition_to(next).unwrap();
        }
        assert_eq!(ctx.state(), LoadState::Retired);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut ctx = LoadContext::new(Pid::new(1));
        assert_eq!(
            ctx.transition_to(LoadState::Dispatched),
            Err(LoadError::InvalidTransition {
                from: LoadState::Allocated,
                to: LoadState::Dispatched,
            })
        );
        ctx.transition_to(LoadState::HeaderValidated).unwrap();
        ctx.transition_to(LoadState::Aborted).unwrap();
        ctx.transition_to(LoadState::Retired).unwrap();

        assert!(!LoadState::ArgumentsStaged.can_transition_to(LoadState::Aborted));
        assert!(!LoadState::Retired.can_transition_to(LoadState::Allocated));
    }

    #[test]
    fn test_config_defaults() {
        let config = LoaderConfig::builder().build().unwrap();
        assert_eq!(config, LoaderConfig::default());
        assert_eq!(config.region_base(Pid::new(0)), 1 << 50);
        assert_eq!(config.region_base(Pid::new(3)), 4 << 50);
    }

    #[test]
    fn test_config_validation() {
        assert!(LoaderConfig::builder().capacity(1).build().is_err());
        assert!(LoaderConfig::builder().region_stride(0).build().is_err());
        assert!(LoaderConfig::builder()
            .capacity(1 << 20)
            .region_stride(1 << 50)
            .build()
            .is_err());
        let config = LoaderConfig::builder()
            .capacity(4)
            .region_origin(0x10_0000)
            .region_stride(0x1_0000)
            .build()
            .unwrap();
        assert_eq!(config.region_base(Pid::new(2)), 0x12_0000);
    }
}
