//! Speculative windows
//!
//! A window is a bounded run of instructions along a predicted jump
//! target, executed in a shadow copy of the architectural context.
//! Loads read through the shadow's own stores and fill the shared data
//! cache exactly as architectural loads do. Stores and cache
//! maintenance are deferred: they are kept in program order and only
//! reach memory and the cache if the window is committed. On a squash
//! the shadow is dropped, and what remains of it is the cache lines
//! its loads brought in.

use super::cache::{Access, Cache};
use super::exec::{execute, ArchState, Eei, Resolution};
use super::memory::{read_word, Memory, MemoryError, Wordsize};
use super::{touch, Trap};
use crate::instr::decode::Instr;
use std::collections::HashMap;
use tracing::trace;

/// A side effect held back until the window commits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    Store { addr: u32, data: u32, width: Wordsize },
    Flush(u32),
    FlushAll,
}

/// Why a window stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowEnd {
    /// The instruction budget ran out
    Exhausted,
    /// The next instruction is an ecall or ebreak, which only run
    /// architecturally
    Serialized,
    /// The next instruction is fence.i, which squashes the window
    Fenced,
    /// The next instruction faulted, which squashes the window
    Faulted(Trap),
}

impl WindowEnd {
    /// Whether a correctly predicted window may be committed
    pub fn may_commit(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Serialized)
    }
}

/// Result of running a window
#[derive(Debug, Clone)]
pub struct Window {
    /// The shadow context after the last retired instruction
    pub arch: ArchState,
    pub deferred: Vec<Deferred>,
    /// Branches and jumps that resolved inside the window, in order
    pub resolutions: Vec<Resolution>,
    pub retired: u32,
    pub end: WindowEnd,
}

/// Data-side environment of a shadow context
struct ShadowEnv<'a> {
    memory: &'a Memory,
    cache: &'a mut Cache,
    overlay: HashMap<u32, u8>,
    deferred: Vec<Deferred>,
}

impl ShadowEnv<'_> {
    fn byte(&self, addr: u32) -> u8 {
        self.overlay
            .get(&addr)
            .copied()
            .unwrap_or_else(|| self.memory.byte(addr))
    }

    fn read(&self, addr: u32, width: Wordsize) -> Result<u32, MemoryError> {
        self.memory.check_range(addr, width.width().into())?;
        Ok(read_word(|a| self.byte(a), addr, width.width()))
    }
}

impl Eei for ShadowEnv<'_> {
    fn load(&mut self, addr: u32, width: Wordsize) -> Result<(u32, Access), MemoryError> {
        let value = self.read(addr, width)?;
        Ok((value, touch(self.cache, addr, width)))
    }

    fn store(&mut self, addr: u32, data: u32, width: Wordsize) -> Result<(), MemoryError> {
        self.memory.check_range(addr, width.width().into())?;
        for n in 0..width.width() {
            self.overlay.insert(addr + n, (0xff & (data >> (8 * n))) as u8);
        }
        self.deferred.push(Deferred::Store { addr, data, width });
        Ok(())
    }

    fn flush(&mut self, addr: u32) {
        self.deferred.push(Deferred::Flush(addr));
    }

    fn flush_all(&mut self) {
        self.deferred.push(Deferred::FlushAll);
    }
}

/// Run at most length instructions from arch (whose pc is the
/// predicted target) without touching memory. Branches and jumps
/// inside the window go where their operands say; they are not
/// predicted.
pub fn run_window(mut arch: ArchState, memory: &Memory, cache: &mut Cache, length: u32) -> Window {
    let mut env = ShadowEnv {
        memory,
        cache,
        overlay: HashMap::new(),
        deferred: Vec::new(),
    };
    let mut resolutions = Vec::new();
    let mut retired = 0;
    let mut end = WindowEnd::Exhausted;

    while retired < length {
        let pc = arch.pc;
        let instr = match env
            .read(pc, Wordsize::Word)
            .map_err(Trap::from)
            .and_then(|word| Instr::from(word).map_err(Trap::from))
        {
            Ok(instr) => instr,
            Err(trap) => {
                end = WindowEnd::Faulted(trap);
                break;
            }
        };
        if instr == Instr::FenceI {
            end = WindowEnd::Fenced;
            break;
        }
        if instr.is_serializing() {
            end = WindowEnd::Serialized;
            break;
        }
        trace!("speculative 0x{pc:08x}: {instr}");
        let resolution = Resolution::of(&arch, &instr);
        if let Err(trap) = execute(&mut arch, &mut env, &instr) {
            end = WindowEnd::Faulted(trap);
            break;
        }
        resolutions.extend(resolution);
        retired += 1;
    }

    Window {
        arch,
        deferred: env.deferred,
        resolutions,
        retired,
        end,
    }
}
