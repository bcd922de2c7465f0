//! Instruction execution
//!
//! The semantics of every instruction are written once, in execute(),
//! against two pieces of state: the ArchState of the context that is
//! executing (pc, registers and the counters), and an Eei that gives
//! access to data memory. The architectural hart and the speculative
//! shadow contexts differ only in their Eei: architectural stores go
//! to memory, speculative stores stay in an overlay, and both fill
//! the shared data cache on loads.

use super::cache::Access;
use super::counter::{CycleCounter, Scoreboard};
use super::memory::{MemoryError, Wordsize};
use super::registers::Registers;
use super::Trap;
use crate::instr::decode::{Branch, Instr, Load, RegImm, RegReg, Store};
use crate::utils::{interpret_u32_as_signed, sign_extend};

/// Data-side execution environment interface
pub trait Eei {
    /// Load a value of the given width, reporting whether its line
    /// was present in the data cache
    fn load(&mut self, addr: u32, width: Wordsize) -> Result<(u32, Access), MemoryError>;

    fn store(&mut self, addr: u32, data: u32, width: Wordsize) -> Result<(), MemoryError>;

    /// Evict the data cache line containing addr
    fn flush(&mut self, addr: u32);

    /// Evict every data cache line
    fn flush_all(&mut self);
}

/// State private to one execution context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchState {
    pub pc: u32,
    pub registers: Registers,
    pub counter: CycleCounter,
    pub scoreboard: Scoreboard,
}

/// What the caller of execute() has to deal with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Retired,
    /// An ecall retired; the syscall is still to be serviced
    Ecall,
    /// An ebreak retired
    Ebreak,
}

impl ArchState {
    /// Read the value of the register xn
    pub fn x(&self, n: u8) -> u32 {
        self.registers.read(n)
    }

    /// Write the value of the register xn
    pub fn set_x(&mut self, n: u8, value: u32) {
        self.registers.write(n, value);
    }

    /// Add 4 to the program counter, wrapping if necessary
    pub fn increment_pc(&mut self) {
        self.pc = self.pc.wrapping_add(4);
    }

    /// Set the pc to a jump target, which must be 4-byte aligned
    fn jump(&mut self, target: u32) -> Result<(), Trap> {
        if target % 4 != 0 {
            return Err(Trap::InstructionAddressMisaligned(target));
        }
        self.pc = target;
        Ok(())
    }

    /// Jump to target and put the address of the next instruction in
    /// dest (the shared part of jal and jalr)
    pub fn link_and_jump(&mut self, dest: u8, target: u32) -> Result<(), Trap> {
        let link = self.pc.wrapping_add(4);
        self.jump(target)?;
        self.set_x(dest, link);
        self.scoreboard.resolve(dest);
        Ok(())
    }
}

/// How a control transfer resolved, as the predictors learn it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Branch {
        site: u32,
        taken: bool,
        target: u32,
    },
    /// A jal (base is None) or jalr
    Jump {
        site: u32,
        dest: u8,
        base: Option<u8>,
        target: u32,
    },
}

impl Resolution {
    /// How instr resolves if it executes in arch, or None if it is
    /// not a control transfer
    pub fn of(arch: &ArchState, instr: &Instr) -> Option<Self> {
        let site = arch.pc;
        match *instr {
            Instr::Branch {
                mnemonic,
                src1,
                src2,
                offset,
            } => {
                let taken = branch_taken(mnemonic, arch.x(src1), arch.x(src2));
                let target = if taken {
                    branch_target(site, offset)
                } else {
                    site.wrapping_add(4)
                };
                Some(Self::Branch {
                    site,
                    taken,
                    target,
                })
            }
            Instr::Jal { dest, offset } => Some(Self::Jump {
                site,
                dest,
                base: None,
                target: site.wrapping_add(sign_extend(offset, 20)),
            }),
            Instr::Jalr { dest, base, offset } => Some(Self::Jump {
                site,
                dest,
                base: Some(base),
                target: jalr_target(arch, base, offset),
            }),
            _ => None,
        }
    }

    /// Address of the instruction that runs next
    pub fn target(&self) -> u32 {
        match *self {
            Self::Branch { target, .. } | Self::Jump { target, .. } => target,
        }
    }
}

/// The target of a taken branch at pc
pub fn branch_target(pc: u32, offset: u16) -> u32 {
    pc.wrapping_add(sign_extend(offset, 12))
}

/// The target of jalr dest, offset(base) given the current registers
fn jalr_target(arch: &ArchState, base: u8, offset: u16) -> u32 {
    0xffff_fffe & arch.x(base).wrapping_add(sign_extend(offset, 11))
}

fn effective_address(arch: &ArchState, base: u8, offset: u16) -> u32 {
    arch.x(base).wrapping_add(sign_extend(offset, 11))
}

fn reg_imm(mnemonic: RegImm, src: u32, i_immediate: u16) -> u32 {
    let imm = sign_extend(i_immediate, 11);
    let shamt = u32::from(i_immediate) & 0x1f;
    match mnemonic {
        RegImm::Addi => src.wrapping_add(imm),
        RegImm::Slti => (interpret_u32_as_signed(src) < interpret_u32_as_signed(imm)).into(),
        RegImm::Sltiu => (src < imm).into(),
        RegImm::Andi => src & imm,
        RegImm::Ori => src | imm,
        RegImm::Xori => src ^ imm,
        RegImm::Slli => src << shamt,
        RegImm::Srli => src >> shamt,
        RegImm::Srai => (interpret_u32_as_signed(src) >> shamt) as u32,
    }
}

fn reg_reg(mnemonic: RegReg, src1: u32, src2: u32) -> u32 {
    let shamt = src2 & 0x1f;
    match mnemonic {
        RegReg::Add => src1.wrapping_add(src2),
        RegReg::Sub => src1.wrapping_sub(src2),
        RegReg::Slt => (interpret_u32_as_signed(src1) < interpret_u32_as_signed(src2)).into(),
        RegReg::Sltu => (src1 < src2).into(),
        RegReg::And => src1 & src2,
        RegReg::Or => src1 | src2,
        RegReg::Xor => src1 ^ src2,
        RegReg::Sll => src1 << shamt,
        RegReg::Srl => src1 >> shamt,
        RegReg::Sra => (interpret_u32_as_signed(src1) >> shamt) as u32,
    }
}

fn branch_taken(mnemonic: Branch, src1: u32, src2: u32) -> bool {
    match mnemonic {
        Branch::Beq => src1 == src2,
        Branch::Bne => src1 != src2,
        Branch::Blt => interpret_u32_as_signed(src1) < interpret_u32_as_signed(src2),
        Branch::Bge => interpret_u32_as_signed(src1) >= interpret_u32_as_signed(src2),
        Branch::Bltu => src1 < src2,
        Branch::Bgeu => src1 >= src2,
    }
}

/// Execute one instruction in the context arch, with data memory
/// accessed through env.
///
/// On success, the pc has moved on and the instruction's cost has
/// been added to the cycle counter. On a trap, arch is unchanged.
pub fn execute(arch: &mut ArchState, env: &mut impl Eei, instr: &Instr) -> Result<Event, Trap> {
    let now = arch.counter.instret();
    match *instr {
        Instr::Lui { dest, u_immediate } => {
            arch.set_x(dest, u_immediate << 12);
            arch.scoreboard.resolve(dest);
            arch.increment_pc();
        }
        Instr::Auipc { dest, u_immediate } => {
            arch.set_x(dest, arch.pc.wrapping_add(u_immediate << 12));
            arch.scoreboard.resolve(dest);
            arch.increment_pc();
        }
        Instr::Jal { dest, offset } => {
            let target = arch.pc.wrapping_add(sign_extend(offset, 20));
            arch.link_and_jump(dest, target)?;
        }
        Instr::Jalr { dest, base, offset } => {
            let target = jalr_target(arch, base, offset);
            arch.link_and_jump(dest, target)?;
        }
        Instr::Branch {
            mnemonic,
            src1,
            src2,
            offset,
        } => {
            if branch_taken(mnemonic, arch.x(src1), arch.x(src2)) {
                arch.jump(branch_target(arch.pc, offset))?;
            } else {
                arch.increment_pc();
            }
        }
        Instr::Load {
            mnemonic,
            dest,
            base,
            offset,
        } => {
            let addr = effective_address(arch, base, offset);
            let width = match mnemonic {
                Load::Lb | Load::Lbu => Wordsize::Byte,
                Load::Lh | Load::Lhu => Wordsize::Halfword,
                Load::Lw => Wordsize::Word,
            };
            let (value, access) = env.load(addr, width)?;
            let value = match mnemonic {
                Load::Lb => sign_extend(value, 7),
                Load::Lh => sign_extend(value, 15),
                Load::Lw | Load::Lbu | Load::Lhu => value,
            };
            arch.set_x(dest, value);
            let miss_penalty = arch.counter.timing().miss_penalty;
            arch.scoreboard.load(dest, base, access, now, miss_penalty);
            arch.increment_pc();
            arch.counter.retire_load(access);
            return Ok(Event::Retired);
        }
        Instr::Store {
            mnemonic,
            src,
            base,
            offset,
        } => {
            let addr = effective_address(arch, base, offset);
            let width = match mnemonic {
                Store::Sb => Wordsize::Byte,
                Store::Sh => Wordsize::Halfword,
                Store::Sw => Wordsize::Word,
            };
            env.store(addr, arch.x(src), width)?;
            arch.increment_pc();
            arch.counter.retire_store();
            return Ok(Event::Retired);
        }
        Instr::RegImm {
            mnemonic,
            dest,
            src,
            i_immediate,
        } => {
            arch.set_x(dest, reg_imm(mnemonic, arch.x(src), i_immediate));
            arch.scoreboard.inherit(dest, &[src]);
            arch.increment_pc();
        }
        Instr::RegReg {
            mnemonic,
            dest,
            src1,
            src2,
        } => {
            arch.set_x(dest, reg_reg(mnemonic, arch.x(src1), arch.x(src2)));
            arch.scoreboard.inherit(dest, &[src1, src2]);
            arch.increment_pc();
        }
        Instr::Fence => arch.increment_pc(),
        Instr::FenceI => {
            arch.scoreboard.drain();
            arch.increment_pc();
        }
        Instr::CacheFlush { base } => {
            env.flush(arch.x(base));
            arch.increment_pc();
            arch.counter.retire_flush();
            return Ok(Event::Retired);
        }
        Instr::CacheFlushAll => {
            env.flush_all();
            arch.increment_pc();
            arch.counter.retire_flush();
            return Ok(Event::Retired);
        }
        Instr::ReadCounter { dest, counter } => {
            // The value is sampled before this instruction's own cost
            arch.set_x(dest, arch.counter.read(counter));
            arch.scoreboard.resolve(dest);
            arch.increment_pc();
        }
        Instr::Ecall => {
            arch.increment_pc();
            arch.counter.retire();
            return Ok(Event::Ecall);
        }
        Instr::Ebreak => {
            arch.increment_pc();
            arch.counter.retire();
            return Ok(Event::Ebreak);
        }
    }
    arch.counter.retire();
    Ok(Event::Retired)
}
