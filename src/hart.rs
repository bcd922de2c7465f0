use crate::config::{MachineConfig, SpeculationConfig};
use crate::instr::decode::{DecodeError, Instr};
use thiserror::Error;
use tracing::{debug, trace, warn};

use self::bpu::Bpu;
use self::btb::Btb;
use self::cache::{Access, Cache, CacheError};
use self::exec::{branch_target, execute, ArchState, Eei, Event, Resolution};
use self::memory::{Memory, MemoryError, Wordsize};
use self::registers::abi::ZERO;
use self::rsb::Rsb;
use self::speculation::{run_window, Deferred, Window};

pub mod bpu;
pub mod btb;
pub mod cache;
pub mod counter;
pub mod exec;
pub mod memory;
pub mod registers;
pub mod rsb;
pub mod speculation;

/// RISC-V hardware thread with a modelled data cache and predictors
///
/// This is a single RV32I hart with no privilege levels, where all
/// traps are fatal and are handed back to the caller of step(). On
/// top of the architectural state it models the parts of a real core
/// that a guest can observe through timing:
///
/// * a data cache, filled by every load (including speculative ones)
///   and emptied by cbo.flush and th.dcache.ciall
/// * a cycle counter, readable with rdcycle, where a load that misses
///   the cache is much slower than one that hits
/// * a branch predictor for conditional branches, a return-stack
///   buffer for returns, and a branch-target buffer for other
///   indirect jumps
/// * a bounded speculative window that runs ahead along a prediction
///   while the operands that decide the real target are unresolved
///
/// The member function step() executes one architectural instruction.
/// If a trap occurs, step() returns it and the hart is left as it was
/// before the faulting instruction.
#[derive(Debug)]
pub struct Hart {
    pub arch: ArchState,
    pub memory: Memory,
    pub cache: Cache,
    pub btb: Btb,
    pub bpu: Bpu,
    pub rsb: Rsb,
    speculation: SpeculationConfig,
    stats: SpeculationStats,
}

/// A predicted target, and the window that may run along it
struct Prediction {
    target: u32,
    /// Register the jump links into (zero for a branch)
    link: u8,
    length: u32,
}

/// Counts of speculative activity since the hart was made
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeculationStats {
    pub windows: u64,
    pub commits: u64,
    pub squashes: u64,
    /// Instructions executed inside windows, committed or not
    pub speculative_instructions: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    #[error("instruction decode failed: {0}")]
    InstructionDecodeFailed(#[from] DecodeError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("instruction address misaligned: 0x{0:08x}")]
    InstructionAddressMisaligned(u32),
}

/// Fill the cache line(s) touched by an access of the given width
/// at addr. An access that straddles two lines touches both, and is
/// a miss if either line was absent.
pub(crate) fn touch(cache: &mut Cache, addr: u32, width: Wordsize) -> Access {
    let first = cache.access(addr);
    let last = addr.wrapping_add(width.width() - 1);
    if cache.line_address(last) != cache.line_address(addr) && cache.access(last) == Access::Miss
    {
        return Access::Miss;
    }
    first
}

/// Data-side environment of the architectural context
struct ArchEnv<'a> {
    memory: &'a mut Memory,
    cache: &'a mut Cache,
}

impl Eei for ArchEnv<'_> {
    fn load(&mut self, addr: u32, width: Wordsize) -> Result<(u32, Access), MemoryError> {
        let value = self.memory.read(addr, width)?;
        Ok((value, touch(self.cache, addr, width)))
    }

    fn store(&mut self, addr: u32, data: u32, width: Wordsize) -> Result<(), MemoryError> {
        self.memory.write(addr, data, width)?;
        touch(self.cache, addr, width);
        Ok(())
    }

    fn flush(&mut self, addr: u32) {
        self.cache.flush(addr);
    }

    fn flush_all(&mut self) {
        self.cache.flush_all();
    }
}

impl Hart {
    /// Make a hart with empty memory, cache and predictors, and with the pc
    /// and all registers zero
    pub fn new(config: &MachineConfig) -> Result<Self, CacheError> {
        let timing = config.timing;
        if timing.hit_cycles >= 16 || timing.hit_cycles + timing.miss_penalty <= 16 {
            warn!(
                "cache timing (hit {} cycles, miss {} cycles) does not straddle 16",
                timing.hit_cycles,
                timing.hit_cycles + timing.miss_penalty
            );
        }
        Ok(Self {
            arch: ArchState {
                counter: counter::CycleCounter::new(timing),
                ..ArchState::default()
            },
            memory: Memory::new(config.mem_size),
            cache: Cache::new(config.cache)?,
            btb: Btb::new(config.speculation.btb_index_bits),
            bpu: Bpu::new(
                config.speculation.bpu_index_bits,
                config.speculation.bpu_init_counter,
            ),
            rsb: Rsb::new(config.speculation.rsb_depth),
            speculation: config.speculation,
            stats: SpeculationStats::default(),
        })
    }

    pub fn pc(&self) -> u32 {
        self.arch.pc
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.arch.pc = pc;
    }

    /// Read the value of the register xn
    pub fn x(&self, n: u8) -> u32 {
        self.arch.x(n)
    }

    /// Write the value of the register xn from outside the guest
    /// (a syscall result or initial state), so the value is resolved
    pub fn set_x(&mut self, n: u8, value: u32) {
        self.arch.set_x(n, value);
        self.arch.scoreboard.resolve(n);
    }

    pub fn stats(&self) -> SpeculationStats {
        self.stats
    }

    /// Instruction fetches read memory directly; only data accesses
    /// go through the cache
    pub fn fetch(&self) -> Result<Instr, Trap> {
        let word = self.memory.read(self.arch.pc, Wordsize::Word)?;
        Ok(Instr::from(word)?)
    }

    /// Execute the instruction at the pc
    ///
    /// Normally this retires exactly one instruction. When a
    /// correctly predicted speculative window is committed, the
    /// instructions it ran retire too, and the pc moves past them.
    pub fn step(&mut self) -> Result<Event, Trap> {
        let pc = self.arch.pc;
        let instr = self.fetch()?;
        trace!("0x{pc:08x}: {instr}");
        let resolution = Resolution::of(&self.arch, &instr);

        if let (Some(prediction), Some(resolution)) = (self.prediction(&instr), resolution) {
            if let Some(window) = self.speculate(&prediction) {
                if prediction.target == resolution.target() && window.end.may_commit() {
                    self.train(&resolution);
                    return self.commit(pc, window);
                }
                self.stats.squashes += 1;
                debug!(
                    "squashed {} instructions at 0x{pc:08x} (resolved 0x{:08x}, {:?})",
                    window.retired,
                    resolution.target(),
                    window.end
                );
            }
        }

        let mut env = ArchEnv {
            memory: &mut self.memory,
            cache: &mut self.cache,
        };
        let event = execute(&mut self.arch, &mut env, &instr)?;
        if let Some(resolution) = resolution {
            self.train(&resolution);
        }
        Ok(event)
    }

    /// How many instructions may run along a prediction before all
    /// of srcs resolve
    fn window_length(&self, srcs: &[u8]) -> u32 {
        if !self.speculation.enabled {
            return 0;
        }
        let now = self.arch.counter.instret();
        let pending = srcs
            .iter()
            .map(|x| self.arch.scoreboard.pending(*x, now))
            .max()
            .unwrap_or(0);
        pending.min(u64::from(self.speculation.max_window)) as u32
    }

    /// Where the front end would send instr while its operands are
    /// still in flight, if anywhere
    fn prediction(&self, instr: &Instr) -> Option<Prediction> {
        let site = self.arch.pc;
        let (target, link, srcs) = match *instr {
            Instr::Branch {
                src1, src2, offset, ..
            } => {
                let target = if self.bpu.predict(site) {
                    branch_target(site, offset)
                } else {
                    site.wrapping_add(4)
                };
                (target, ZERO, vec![src1, src2])
            }
            Instr::Jalr { dest, base, .. } => {
                let target = self
                    .rsb
                    .predict(dest, base)
                    .or_else(|| self.btb.predict(site))?;
                (target, dest, vec![base])
            }
            _ => return None,
        };
        let length = self.window_length(&srcs);
        (length > 0).then_some(Prediction {
            target,
            link,
            length,
        })
    }

    /// Run a window along a prediction. None if the predicted target
    /// cannot be fetched from at all.
    fn speculate(&mut self, prediction: &Prediction) -> Option<Window> {
        let site = self.arch.pc;
        let mut shadow = self.arch.clone();
        shadow
            .link_and_jump(prediction.link, prediction.target)
            .ok()?;
        shadow.counter.retire();
        debug!(
            "speculating at 0x{site:08x}: 0x{:08x}, window of {}",
            prediction.target, prediction.length
        );
        let window = run_window(shadow, &self.memory, &mut self.cache, prediction.length);
        self.stats.windows += 1;
        self.stats.speculative_instructions += u64::from(window.retired);
        Some(window)
    }

    /// Teach the predictors how a branch or jump went
    fn train(&mut self, resolution: &Resolution) {
        match *resolution {
            Resolution::Branch { site, taken, .. } => self.bpu.update(site, taken),
            Resolution::Jump {
                site,
                dest,
                base,
                target,
            } => {
                self.rsb.update(site, dest, base);
                if base.is_some() {
                    self.btb.update(site, target);
                }
            }
        }
    }

    /// Adopt the shadow context of a correctly predicted window
    fn commit(&mut self, site: u32, window: Window) -> Result<Event, Trap> {
        let mut env = ArchEnv {
            memory: &mut self.memory,
            cache: &mut self.cache,
        };
        for op in &window.deferred {
            match *op {
                Deferred::Store { addr, data, width } => env.store(addr, data, width)?,
                Deferred::Flush(addr) => env.flush(addr),
                Deferred::FlushAll => env.flush_all(),
            }
        }
        self.arch = window.arch;
        for resolution in &window.resolutions {
            self.train(resolution);
        }
        self.stats.commits += 1;
        debug!(
            "committed {} instructions at 0x{site:08x}, pc now 0x{:08x}",
            window.retired, self.arch.pc
        );
        Ok(Event::Retired)
    }

    /// Range of cache lines covering [addr, addr + len)
    fn touch_range(&mut self, addr: u32, len: u32) {
        if len == 0 {
            return;
        }
        let line_size = self.cache.config().line_size;
        let last = self.cache.line_address(addr.wrapping_add(len - 1));
        let mut line = self.cache.line_address(addr);
        loop {
            self.cache.access(line);
            if line == last {
                break;
            }
            line = line.wrapping_add(line_size);
        }
    }

    /// Read a guest buffer on behalf of a syscall. The lines it
    /// covers are loaded into the cache.
    pub fn read_guest_bytes(&mut self, addr: u32, len: u32) -> Result<Vec<u8>, MemoryError> {
        let bytes = self.memory.read_bytes(addr, len)?;
        self.touch_range(addr, len);
        Ok(bytes)
    }

    /// Write a guest buffer on behalf of a syscall, as if by a
    /// sequence of stores
    pub fn write_guest_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        self.memory.write_bytes(addr, bytes)?;
        self.touch_range(addr, bytes.len() as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::encode::*;

    fn hart_with_program(program: &[u32]) -> Hart {
        let mut hart = Hart::new(&MachineConfig::default()).unwrap();
        for (n, word) in (0..).zip(program) {
            hart.memory.write(4 * n, *word, Wordsize::Word).unwrap();
        }
        hart
    }

    #[test]
    fn check_lui() {
        let mut hart = hart_with_program(&[lui(SP, 53)]);
        hart.step().unwrap();
        assert_eq!(hart.x(SP), 53 << 12);
        assert_eq!(hart.pc(), 4);
    }

    #[test]
    fn check_trap_leaves_hart_unchanged() {
        let mut hart = hart_with_program(&[lw(A0, A1, 0)]);
        hart.memory = Memory::new(0x100);
        hart.memory.write(0, lw(A0, A1, 0), Wordsize::Word).unwrap();
        hart.set_x(A1, 0x1000);
        let trap = hart.step().unwrap_err();
        assert!(matches!(trap, Trap::Memory(MemoryError::BadAddress { .. })));
        assert_eq!(hart.pc(), 0);
        assert_eq!(hart.arch.counter.instret(), 0);
    }

    #[test]
    fn check_decode_trap() {
        let mut hart = hart_with_program(&[0]);
        assert!(matches!(
            hart.step().unwrap_err(),
            Trap::InstructionDecodeFailed(_)
        ));
    }

    #[test]
    fn check_loads_fill_cache_and_cost_cycles() {
        let mut hart = hart_with_program(&[lbu(A0, A1, 0), lbu(A0, A1, 0)]);
        hart.set_x(A1, 0x8000);
        hart.step().unwrap();
        assert!(hart.cache.is_present(0x8000));
        assert_eq!(hart.arch.counter.cycles(), 41);
        hart.step().unwrap();
        assert_eq!(hart.arch.counter.cycles(), 42);
    }

    #[test]
    fn check_straddling_load_touches_both_lines() {
        let mut hart = hart_with_program(&[lw(A0, A1, 0)]);
        hart.set_x(A1, 0x803e);
        hart.step().unwrap();
        assert!(hart.cache.is_present(0x8000));
        assert!(hart.cache.is_present(0x8040));
    }

    /// An indirect call through a0 at 0x100, whose target is loaded
    /// from the pointer at 0x2000. The two possible targets at 0x200
    /// and 0x300 each load a different cache line, and a speculative
    /// window of up to 40 instructions opens when the pointer load
    /// misses.
    fn indirect_call_program() -> Hart {
        let mut hart = hart_with_program(&[]);
        let code = [
            (0x100, lw(A0, A2, 0)),   // a0 = *(0x2000)
            (0x104, jalr(RA, A0, 0)), // call a0
            (0x108, ebreak()),
            (0x200, lbu(A3, A4, 0)), // first target: touch 0x9000
            (0x204, ret_word()),
            (0x300, lbu(A3, A5, 0)), // second target: touch 0xa000
            (0x304, ret_word()),
        ];
        for (addr, word) in code {
            hart.memory.write(addr, word, Wordsize::Word).unwrap();
        }
        hart.set_x(A2, 0x2000);
        hart.set_x(A4, 0x9000);
        hart.set_x(A5, 0xa000);
        hart
    }

    fn ret_word() -> u32 {
        jalr(ZERO, RA, 0)
    }

    fn call_through_pointer(hart: &mut Hart, target: u32) {
        hart.memory.write(0x2000, target, Wordsize::Word).unwrap();
        hart.cache.flush_all();
        hart.set_pc(0x100);
        hart.step().unwrap(); // lw
        hart.step().unwrap(); // jalr
    }

    #[test]
    fn check_first_call_trains_btb() {
        let mut hart = indirect_call_program();
        call_through_pointer(&mut hart, 0x200);
        assert_eq!(hart.stats().windows, 0);
        assert_eq!(hart.btb.predict(0x104), Some(0x200));
        assert_eq!(hart.pc(), 0x200);
        assert_eq!(hart.x(RA), 0x108);
    }

    #[test]
    fn check_correct_prediction_commits() {
        let mut hart = indirect_call_program();
        call_through_pointer(&mut hart, 0x200);
        call_through_pointer(&mut hart, 0x200);
        let stats = hart.stats();
        assert_eq!(stats.windows, 1);
        assert_eq!(stats.commits, 1);
        // The window ran the load and the return, and the ebreak ended it
        assert_eq!(hart.pc(), 0x108);
        assert!(hart.cache.is_present(0x9000));
        assert_eq!(hart.x(RA), 0x108);
    }

    #[test]
    fn check_misprediction_squashes_but_keeps_cache_lines() {
        let mut hart = indirect_call_program();
        call_through_pointer(&mut hart, 0x200);
        hart.set_x(A3, 0x1234);
        call_through_pointer(&mut hart, 0x300);
        let stats = hart.stats();
        assert_eq!(stats.squashes, 1);
        assert_eq!(stats.commits, 0);
        // Architecturally only the jalr has executed
        assert_eq!(hart.pc(), 0x300);
        assert_eq!(hart.x(A3), 0x1234);
        // But the line the wrong path loaded is now cached
        assert!(hart.cache.is_present(0x9000));
        assert!(!hart.cache.is_present(0xa000));
        assert_eq!(hart.btb.predict(0x104), Some(0x300));
    }

    #[test]
    fn check_no_speculation_when_disabled() {
        let mut hart = indirect_call_program();
        hart.speculation.enabled = false;
        call_through_pointer(&mut hart, 0x200);
        call_through_pointer(&mut hart, 0x300);
        assert_eq!(hart.stats(), SpeculationStats::default());
        assert!(!hart.cache.is_present(0x9000));
    }

    #[test]
    fn check_resolved_target_opens_no_window() {
        let mut hart = indirect_call_program();
        call_through_pointer(&mut hart, 0x200);
        // The pointer load hits this time, so the target is known
        hart.memory.write(0x2000, 0x300, Wordsize::Word).unwrap();
        hart.set_pc(0x100);
        hart.step().unwrap();
        hart.step().unwrap();
        assert_eq!(hart.stats().windows, 0);
        assert_eq!(hart.pc(), 0x300);
    }

    #[test]
    fn check_speculative_store_reaches_memory_only_on_commit() {
        let mut hart = indirect_call_program();
        hart.memory.write(0x200, sb(A6, A5, 0), Wordsize::Word).unwrap();
        hart.set_x(A6, 0x5a);
        call_through_pointer(&mut hart, 0x200);

        // Mispredicted: the store at 0x200 ran only speculatively
        call_through_pointer(&mut hart, 0x300);
        assert_eq!(hart.memory.read(0xa000, Wordsize::Byte).unwrap(), 0);

        // Mispredicted again (the BTB now says 0x300), then correct
        call_through_pointer(&mut hart, 0x200);
        call_through_pointer(&mut hart, 0x200);
        assert_eq!(hart.stats().commits, 1);
        assert_eq!(hart.memory.read(0xa000, Wordsize::Byte).unwrap(), 0x5a);
        assert_eq!(hart.pc(), 0x108);
    }

    /// A branch at 0x104 on a value loaded from 0x2000. Falling
    /// through loads line 0x9000 and taking it loads line 0xa000.
    fn branch_program(value: u32) -> Hart {
        let mut hart = hart_with_program(&[]);
        let code = [
            (0x100, lw(A0, A2, 0)),
            (0x104, beq(A0, ZERO, 0xc)),
            (0x108, lbu(A3, A4, 0)),
            (0x10c, ebreak()),
            (0x110, lbu(A3, A5, 0)),
            (0x114, ebreak()),
        ];
        for (addr, word) in code {
            hart.memory.write(addr, word, Wordsize::Word).unwrap();
        }
        hart.memory.write(0x2000, value, Wordsize::Word).unwrap();
        hart.set_x(A2, 0x2000);
        hart.set_x(A4, 0x9000);
        hart.set_x(A5, 0xa000);
        hart
    }

    fn run_branch(hart: &mut Hart) {
        hart.cache.flush_all();
        hart.set_pc(0x100);
        hart.step().unwrap(); // lw
        hart.step().unwrap(); // beq
    }

    #[test]
    fn check_branch_speculation() {
        let mut hart = branch_program(1);
        // Counters start weakly taken, but the branch falls through
        run_branch(&mut hart);
        assert_eq!(hart.stats().squashes, 1);
        assert_eq!(hart.pc(), 0x108);
        assert!(hart.cache.is_present(0xa000));
        assert!(!hart.cache.is_present(0x9000));
        assert!(!hart.bpu.predict(0x104));

        // Now predicted not taken, which is right
        run_branch(&mut hart);
        let stats = hart.stats();
        assert_eq!(stats.windows, 2);
        assert_eq!(stats.commits, 1);
        assert_eq!(hart.pc(), 0x10c);
        assert!(hart.cache.is_present(0x9000));
        assert!(!hart.cache.is_present(0xa000));
    }

    #[test]
    fn check_branch_on_resolved_value_opens_no_window() {
        let mut hart = branch_program(1);
        hart.cache.access(0x2000);
        hart.set_pc(0x100);
        hart.step().unwrap();
        hart.step().unwrap();
        assert_eq!(hart.stats().windows, 0);
        assert_eq!(hart.pc(), 0x108);
        // Predictors learn even without a window
        assert!(!hart.bpu.predict(0x104));
    }

    /// Call f at 0x200, which spills ra to 0x3000 and reloads it
    /// after the cache is emptied, so the return is unresolved
    fn return_program(stored_ra: Option<u32>) -> Hart {
        let mut hart = hart_with_program(&[]);
        let code = [
            (0x100, jal(RA, 0x100)),
            (0x104, ebreak()),
            (0x200, sw(RA, SP, 0)),
            (0x204, lw(RA, SP, 0)),
            (0x208, ret_word()),
            (0x300, ebreak()),
        ];
        for (addr, word) in code {
            hart.memory.write(addr, word, Wordsize::Word).unwrap();
        }
        hart.set_x(SP, 0x3000);
        hart.set_pc(0x100);
        hart.step().unwrap(); // jal
        hart.step().unwrap(); // sw
        if let Some(ra) = stored_ra {
            hart.memory.write(0x3000, ra, Wordsize::Word).unwrap();
        }
        hart.cache.flush_all();
        hart.step().unwrap(); // lw
        hart.step().unwrap(); // ret
        hart
    }

    #[test]
    fn check_return_predicted_by_rsb() {
        let hart = return_program(None);
        let stats = hart.stats();
        assert_eq!(stats.windows, 1);
        assert_eq!(stats.commits, 1);
        assert_eq!(hart.pc(), 0x104);
        assert_eq!(hart.rsb.predict(ZERO, RA), None);
    }

    #[test]
    fn check_overwritten_return_address_squashes() {
        let hart = return_program(Some(0x300));
        let stats = hart.stats();
        assert_eq!(stats.windows, 1);
        assert_eq!(stats.squashes, 1);
        assert_eq!(hart.pc(), 0x300);
        assert_eq!(hart.btb.predict(0x208), Some(0x300));
    }

    #[test]
    fn check_guest_buffers_touch_lines() {
        let mut hart = hart_with_program(&[]);
        hart.write_guest_bytes(0x7ff0, b"0123456789abcdefghij").unwrap();
        assert!(hart.cache.is_present(0x7fc0));
        assert!(hart.cache.is_present(0x8000));
        assert_eq!(hart.read_guest_bytes(0x7ffe, 3).unwrap(), b"efg".to_vec());
        assert!(hart.write_guest_bytes(0xffff_fffe, b"abc").is_err());
    }
}
