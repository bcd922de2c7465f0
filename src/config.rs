//! Host configuration
//!
//! Every micro-architectural parameter of the host lives here, so that
//! a run is fully determined by the guest image, the console input and
//! one MachineConfig.

use crate::hart::memory::FULL_ADDRESS_SPACE;

/// Cache line replacement policy within a set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ReplacementPolicy {
    /// Evict the line that was accessed longest ago
    #[default]
    Lru,
    /// Evict the line that was filled longest ago
    Fifo,
    /// Evict a line chosen by the seeded generator
    Random,
}

/// Data cache geometry. Sizes must be powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub sets: u32,
    pub ways: u32,
    pub line_size: u32,
    pub policy: ReplacementPolicy,
    /// Seed of the random replacement policy
    pub seed: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sets: 64,
            ways: 4,
            line_size: 64,
            policy: ReplacementPolicy::default(),
            seed: 0,
        }
    }
}

/// Cycle costs charged to the cycle counter
///
/// A load costs hit_cycles, plus miss_penalty if its line was not
/// present. Guests discriminate the two with a threshold of 16
/// cycles, so the defaults keep a hit well below and a miss well
/// above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Cost of every instruction that is not a load or store
    pub retire_cycles: u64,
    pub hit_cycles: u64,
    pub miss_penalty: u64,
    pub store_cycles: u64,
    /// Cost of cbo.flush and th.dcache.ciall
    pub flush_cycles: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            retire_cycles: 1,
            hit_cycles: 1,
            miss_penalty: 40,
            store_cycles: 1,
            flush_cycles: 1,
        }
    }
}

/// Speculative execution at branches and indirect jumps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeculationConfig {
    /// When false, the host never speculates (but the predictors are
    /// still trained)
    pub enabled: bool,
    /// Upper bound on the number of instructions in one speculative
    /// window
    pub max_window: u32,
    /// The BTB has 2^btb_index_bits entries
    pub btb_index_bits: u32,
    /// The branch predictor has 2^bpu_index_bits two-bit counters
    pub bpu_index_bits: u32,
    /// Starting value of every counter, from 0 (strongly not taken)
    /// to 3 (strongly taken)
    pub bpu_init_counter: u8,
    /// Number of return addresses the RSB holds
    pub rsb_depth: usize,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_window: 32,
            btb_index_bits: 10,
            bpu_index_bits: 10,
            bpu_init_counter: 2,
            rsb_depth: 16,
        }
    }
}

/// What happens when the guest executes ebreak
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EbreakAction {
    /// Log the breakpoint and carry on with the next instruction
    #[default]
    Trace,
    /// Stop the run and return control to the caller
    Halt,
}

/// How the console refills its input queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum InputMode {
    /// One line (up to and including the newline) per refill
    #[default]
    Line,
    /// Whatever a single read of the input stream returns
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Number of addressable bytes, starting at address zero
    pub mem_size: u64,
    pub cache: CacheConfig,
    pub timing: Timing,
    pub speculation: SpeculationConfig,
    pub ebreak: EbreakAction,
    pub input_mode: InputMode,
    /// Stop after this many architectural instructions
    pub max_steps: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            mem_size: FULL_ADDRESS_SPACE,
            cache: CacheConfig::default(),
            timing: Timing::default(),
            speculation: SpeculationConfig::default(),
            ebreak: EbreakAction::default(),
            input_mode: InputMode::default(),
            max_steps: None,
        }
    }
}
