//! Host run loop
//!
//! The platform owns the hart and the console, and runs the guest
//! until it exits, hits a halting breakpoint, reaches the step limit
//! or traps.

use crate::config::{EbreakAction, MachineConfig};
use crate::console::Console;
use crate::elf_utils::Image;
use crate::hart::cache::CacheError;
use crate::hart::exec::Event;
use crate::hart::memory::MemoryError;
use crate::hart::{Hart, Trap};
use crate::syscall::{self, Action, SyscallError};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Why run() returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The guest called exit with this status
    Exit(i32),
    /// The guest executed ebreak at pc (only when configured to halt)
    Breakpoint { pc: u32 },
    /// The configured instruction limit was reached
    StepLimit,
}

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("{source} (pc = 0x{pc:08x})")]
    Trap { pc: u32, source: Trap },
    #[error("{source} (pc = 0x{pc:08x})")]
    Syscall { pc: u32, source: SyscallError },
    #[error("invalid cache configuration: {0}")]
    Cache(#[from] CacheError),
    #[error("cannot load guest image: {0}")]
    Load(#[from] MemoryError),
}

impl PlatformError {
    /// Address of the instruction that failed, if any
    pub fn pc(&self) -> Option<u32> {
        match self {
            Self::Trap { pc, .. } | Self::Syscall { pc, .. } => Some(*pc),
            Self::Cache(_) | Self::Load(_) => None,
        }
    }
}

pub struct Platform {
    hart: Hart,
    console: Console,
    symbols: BTreeMap<u32, String>,
    ebreak: EbreakAction,
    max_steps: Option<u64>,
}

impl Platform {
    pub fn new(config: &MachineConfig, console: Console) -> Result<Self, PlatformError> {
        Ok(Self {
            hart: Hart::new(config)?,
            console,
            symbols: BTreeMap::new(),
            ebreak: config.ebreak,
            max_steps: config.max_steps,
        })
    }

    /// Place the image in memory and set the pc to its entry point
    pub fn load(&mut self, image: &Image) -> Result<(), PlatformError> {
        image.write_to(&mut self.hart.memory)?;
        self.hart.set_pc(image.entry);
        self.symbols.extend(image.symbols.clone());
        info!("entry point {}", self.describe(image.entry));
        Ok(())
    }

    pub fn hart(&self) -> &Hart {
        &self.hart
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Render addr as symbol+offset where a symbol precedes it
    pub fn describe(&self, addr: u32) -> String {
        match self.symbols.range(..=addr).next_back() {
            Some((base, name)) if *base == addr => format!("0x{addr:08x} <{name}>"),
            Some((base, name)) => format!("0x{addr:08x} <{name}+0x{:x}>", addr - base),
            None => format!("0x{addr:08x}"),
        }
    }

    /// Run the guest until something needs the caller's attention.
    /// After a Breakpoint, calling run() again carries on from the
    /// instruction after the ebreak.
    pub fn run(&mut self) -> Result<Outcome, PlatformError> {
        loop {
            if let Some(limit) = self.max_steps {
                if self.hart.arch.counter.instret() >= limit {
                    info!("stopped after {limit} instructions");
                    return Ok(Outcome::StepLimit);
                }
            }
            let pc = self.hart.pc();
            let event = self
                .hart
                .step()
                .map_err(|source| PlatformError::Trap { pc, source })?;
            match event {
                Event::Retired => {}
                Event::Ecall => {
                    let action = syscall::dispatch(&mut self.hart, &mut self.console)
                        .map_err(|source| PlatformError::Syscall { pc, source })?;
                    if let Action::Exit(status) = action {
                        let stats = self.hart.stats();
                        debug!(
                            "{} cycles, {} instructions, {} speculative windows ({} committed, {} squashed), {} cache lines resident",
                            self.hart.arch.counter.cycles(),
                            self.hart.arch.counter.instret(),
                            stats.windows,
                            stats.commits,
                            stats.squashes,
                            self.hart.cache.resident_lines().len()
                        );
                        return Ok(Outcome::Exit(status));
                    }
                }
                Event::Ebreak => match self.ebreak {
                    EbreakAction::Trace => {
                        info!("breakpoint at {}\n{}", self.describe(pc), self.hart.arch.registers)
                    }
                    EbreakAction::Halt => return Ok(Outcome::Breakpoint { pc }),
                },
            }
        }
    }
}
