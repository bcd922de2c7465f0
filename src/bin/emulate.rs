use clap::Parser;
use clap_num::maybe_hex;
use specemu::config::{EbreakAction, InputMode, MachineConfig, ReplacementPolicy};
use specemu::console::Console;
use specemu::elf_utils::load_elf;
use specemu::platform::{Outcome, Platform};
use specemu::utils::init_logger;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

/// Run a 32-bit RISC-V guest on a host that models a data cache, a
/// cycle counter and speculative execution at branches and jumps
///
/// The guest's read and write syscalls are bound to standard input
/// and output, and the guest's exit status becomes the exit status of
/// this program. Set RUST_LOG (e.g. RUST_LOG=debug) to see what the
/// host is doing; log output goes to standard error.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to the guest executable (RISC-V ELF32)
    input: PathBuf,

    /// Number of sets in the data cache
    #[arg(long, value_parser = maybe_hex::<u32>, default_value = "64")]
    cache_sets: u32,

    /// Number of ways in each set
    #[arg(long, value_parser = maybe_hex::<u32>, default_value = "4")]
    cache_ways: u32,

    /// Cache line size in bytes
    #[arg(long, value_parser = maybe_hex::<u32>, default_value = "64")]
    line_size: u32,

    /// Cache replacement policy
    #[arg(long, value_enum, default_value_t = ReplacementPolicy::Lru)]
    policy: ReplacementPolicy,

    /// Seed for the random replacement policy
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Extra cycles charged for a load that misses the cache
    #[arg(long, default_value_t = 40)]
    miss_penalty: u64,

    /// Cycles charged for a load that hits the cache
    #[arg(long, default_value_t = 1)]
    hit_cycles: u64,

    /// The branch-target buffer has 2^N entries
    #[arg(long, default_value_t = 10)]
    btb_bits: u32,

    /// The branch predictor has 2^N counters
    #[arg(long, default_value_t = 10)]
    bpu_bits: u32,

    /// Number of return addresses the return-stack buffer holds
    #[arg(long, default_value_t = 16)]
    rsb_depth: usize,

    /// Maximum number of instructions in a speculative window
    #[arg(long, default_value_t = 32)]
    window: u32,

    /// Never execute speculatively
    #[arg(long)]
    no_speculation: bool,

    /// Size of guest memory in bytes (default: the full 4 GiB)
    #[arg(long, value_parser = maybe_hex::<u64>)]
    mem_size: Option<u64>,

    /// Stop at ebreak instead of logging it and carrying on
    #[arg(long)]
    halt_on_ebreak: bool,

    /// Give the guest input as it arrives instead of a line at a time
    #[arg(long)]
    raw_input: bool,

    /// Stop after this many instructions
    #[arg(long)]
    max_steps: Option<u64>,
}

impl Args {
    fn machine_config(&self) -> MachineConfig {
        let mut config = MachineConfig::default();
        config.cache.sets = self.cache_sets;
        config.cache.ways = self.cache_ways;
        config.cache.line_size = self.line_size;
        config.cache.policy = self.policy;
        config.cache.seed = self.seed;
        config.timing.miss_penalty = self.miss_penalty;
        config.timing.hit_cycles = self.hit_cycles;
        config.speculation.btb_index_bits = self.btb_bits;
        config.speculation.bpu_index_bits = self.bpu_bits;
        config.speculation.rsb_depth = self.rsb_depth;
        config.speculation.max_window = self.window;
        config.speculation.enabled = !self.no_speculation;
        if let Some(mem_size) = self.mem_size {
            config.mem_size = mem_size;
        }
        if self.halt_on_ebreak {
            config.ebreak = EbreakAction::Halt;
        }
        if self.raw_input {
            config.input_mode = InputMode::Raw;
        }
        config.max_steps = self.max_steps;
        config
    }
}

fn run(args: &Args) -> Result<Outcome, Box<dyn std::error::Error>> {
    let config = args.machine_config();
    let image = load_elf(&args.input)?;
    let mut platform = Platform::new(&config, Console::host(config.input_mode))?;
    platform.load(&image)?;
    Ok(platform.run()?)
}

fn main() -> ExitCode {
    init_logger();
    let args = Args::parse();

    match run(&args) {
        // The OS keeps the low 8 bits of the status
        Ok(Outcome::Exit(status)) => ExitCode::from(status as u8),
        Ok(Outcome::StepLimit) => {
            error!("instruction limit reached");
            ExitCode::from(2)
        }
        Ok(Outcome::Breakpoint { pc }) => {
            error!("halted at breakpoint (pc = 0x{pc:08x})");
            ExitCode::from(3)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}
