//! Instruction Decoding
//!
//! This file is where a u32 instruction word is converted into the
//! Instr enum, which holds the instruction type and fields in a form
//! that is ready for execution. Any word that does not decode to an
//! instruction the host implements is a DecodeError, which is fatal
//! when it happens on the architectural path.

use super::abi_name;
use super::fields::*;
use super::opcodes::*;
use crate::utils::{interpret_u32_as_signed, sign_extend};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("got invalid or unimplemented opcode 0x{0:x}")]
    InvalidOpcode(u32),
    #[error("got invalid funct3 0b{funct3:03b} for opcode 0b{opcode:07b}")]
    InvalidFunct3 { opcode: u32, funct3: u32 },
    #[error("got invalid funct7 0b{funct7:07b} for opcode 0b{opcode:07b}")]
    InvalidFunct7 { opcode: u32, funct7: u32 },
    #[error("got unsupported system or custom instruction 0x{0:08x}")]
    Unsupported(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Load {
    Lb,
    Lh,
    Lw,
    Lbu,
    Lhu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    Sb,
    Sh,
    Sw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegImm {
    Addi,
    Slti,
    Sltiu,
    Andi,
    Ori,
    Xori,
    Slli,
    Srli,
    Srai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegReg {
    Add,
    Sub,
    Slt,
    Sltu,
    And,
    Or,
    Xor,
    Sll,
    Srl,
    Sra,
}

/// The unprivileged counters readable with csrrs rd, csr, x0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Cycle,
    CycleH,
    Instret,
    InstretH,
}

/// Instructions
///
/// Field names below correspond to the names in the
/// instruction set reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    /// Load u_immediate into dest[31:12] bits of dest, filling the
    /// low 12 bits with zeros. u_immediate is 20 bits long.
    Lui { dest: u8, u_immediate: u32 },
    /// Concatenate u_immediate with 12 low-order zeros, add pc to
    /// the the result, and place the result in dest.
    Auipc { dest: u8, u_immediate: u32 },
    /// Store pc+4 in dest, and set pc = pc + offset, where offset is
    /// a multiple of 2. Offset is 21 bits long. An
    /// instruction-address-misaligned exception is generated if the
    /// target pc is not 4-byte aligned.
    Jal { dest: u8, offset: u32 },
    /// Store pc+4 in dest, compute base + offset, set bit 0 to zero,
    /// and set pc to the result. The offset is 12 bits long (and may
    /// be even or odd).
    ///
    /// This is the only instruction whose target is not known at
    /// decode time. The hart predicts it with the return-stack buffer
    /// or the branch-target buffer.
    Jalr { dest: u8, base: u8, offset: u16 },
    /// If branch is taken, set pc = pc + offset, where offset is a
    /// multiple of two; else do nothing. The offset is 13 bits long.
    Branch {
        mnemonic: Branch,
        src1: u8,
        src2: u8,
        offset: u16,
    },
    /// Load the data at address base + offset into dest. The offset
    /// is 12 bits long. Loads do not need to be aligned.
    Load {
        mnemonic: Load,
        dest: u8,
        base: u8,
        offset: u16,
    },
    /// Store the data in src to address base + offset. The offset is
    /// 12 bits long. Stores do not need to be aligned.
    Store {
        mnemonic: Store,
        src: u8,
        base: u8,
        offset: u16,
    },
    /// Perform an operation between the value in register src and
    /// the sign-extended version of the 12-bit i_immediate. For the
    /// shifts, i_immediate holds the 5-bit shift amount.
    RegImm {
        mnemonic: RegImm,
        dest: u8,
        src: u8,
        i_immediate: u16,
    },
    /// Perform an operation between the values in src1 and src2 and
    /// place the result in dest
    RegReg {
        mnemonic: RegReg,
        dest: u8,
        src1: u8,
        src2: u8,
    },
    /// Memory ordering fence. Loads and stores retire in program
    /// order already, so this has no further effect.
    Fence,
    /// Instruction fence, which the host also treats as a full
    /// speculation barrier.
    FenceI,
    /// cbo.flush: evict the data cache line containing the address
    /// in base
    CacheFlush { base: u8 },
    /// th.dcache.ciall: evict every data cache line
    CacheFlushAll,
    /// csrrs dest, counter, x0 (rdcycle and friends)
    ReadCounter { dest: u8, counter: Counter },
    Ecall,
    Ebreak,
}

fn decode_misc_mem(instr: u32) -> Result<Instr, DecodeError> {
    match funct3(instr) {
        FUNCT3_FENCE => Ok(Instr::Fence),
        FUNCT3_FENCE_I => Ok(Instr::FenceI),
        FUNCT3_CBO if rd(instr) == 0 && u32::from(imm_itype(instr)) == CBO_FLUSH => {
            Ok(Instr::CacheFlush { base: rs1(instr) })
        }
        FUNCT3_CBO => Err(DecodeError::Unsupported(instr)),
        funct3 => Err(DecodeError::InvalidFunct3 {
            opcode: OP_MISC_MEM,
            funct3,
        }),
    }
}

fn decode_system(instr: u32) -> Result<Instr, DecodeError> {
    match funct3(instr) {
        FUNCT3_PRIV if rd(instr) == 0 && rs1(instr) == 0 => match u32::from(imm_itype(instr)) {
            IMM_ECALL => Ok(Instr::Ecall),
            IMM_EBREAK => Ok(Instr::Ebreak),
            _ => Err(DecodeError::Unsupported(instr)),
        },
        // The counters are read-only, so only the csrrs form with
        // rs1 = x0 (which does not write the CSR) is legal
        FUNCT3_CSRRS if rs1(instr) == 0 => {
            let counter = match u32::from(imm_itype(instr)) {
                CSR_CYCLE => Counter::Cycle,
                CSR_CYCLEH => Counter::CycleH,
                CSR_INSTRET => Counter::Instret,
                CSR_INSTRETH => Counter::InstretH,
                _ => return Err(DecodeError::Unsupported(instr)),
            };
            Ok(Instr::ReadCounter {
                dest: rd(instr),
                counter,
            })
        }
        _ => Err(DecodeError::Unsupported(instr)),
    }
}

fn decode_reg_imm(instr: u32) -> Result<Instr, DecodeError> {
    let funct3 = funct3(instr);
    let funct7 = funct7(instr);
    let mut i_immediate = imm_itype(instr);
    let mnemonic = match funct3 {
        FUNCT3_ADDI => RegImm::Addi,
        FUNCT3_SLTI => RegImm::Slti,
        FUNCT3_SLTIU => RegImm::Sltiu,
        FUNCT3_ANDI => RegImm::Andi,
        FUNCT3_ORI => RegImm::Ori,
        FUNCT3_XORI => RegImm::Xori,
        FUNCT3_SLLI | FUNCT3_SRLI => {
            i_immediate = shamt(instr).into();
            match (funct3, funct7) {
                (FUNCT3_SLLI, FUNCT7_ZERO) => RegImm::Slli,
                (FUNCT3_SRLI, FUNCT7_ZERO) => RegImm::Srli,
                (FUNCT3_SRAI, FUNCT7_SRA) => RegImm::Srai,
                _ => {
                    return Err(DecodeError::InvalidFunct7 {
                        opcode: OP_IMM,
                        funct7,
                    })
                }
            }
        }
        _ => {
            return Err(DecodeError::InvalidFunct3 {
                opcode: OP_IMM,
                funct3,
            })
        }
    };
    Ok(Instr::RegImm {
        mnemonic,
        dest: rd(instr),
        src: rs1(instr),
        i_immediate,
    })
}

fn decode_reg_reg(instr: u32) -> Result<Instr, DecodeError> {
    let funct7 = funct7(instr);
    let mnemonic = match (funct3(instr), funct7) {
        (FUNCT3_ADD, FUNCT7_ZERO) => RegReg::Add,
        (FUNCT3_SUB, FUNCT7_SUB) => RegReg::Sub,
        (FUNCT3_SLL, FUNCT7_ZERO) => RegReg::Sll,
        (FUNCT3_SLT, FUNCT7_ZERO) => RegReg::Slt,
        (FUNCT3_SLTU, FUNCT7_ZERO) => RegReg::Sltu,
        (FUNCT3_XOR, FUNCT7_ZERO) => RegReg::Xor,
        (FUNCT3_SRL, FUNCT7_ZERO) => RegReg::Srl,
        (FUNCT3_SRA, FUNCT7_SRA) => RegReg::Sra,
        (FUNCT3_OR, FUNCT7_ZERO) => RegReg::Or,
        (FUNCT3_AND, FUNCT7_ZERO) => RegReg::And,
        _ => return Err(DecodeError::InvalidFunct7 { opcode: OP, funct7 }),
    };
    Ok(Instr::RegReg {
        mnemonic,
        dest: rd(instr),
        src1: rs1(instr),
        src2: rs2(instr),
    })
}

impl Instr {
    pub fn from(instr: u32) -> Result<Self, DecodeError> {
        let op = opcode(instr);
        match op {
            OP_LUI => Ok(Self::Lui {
                dest: rd(instr),
                u_immediate: u_immediate(instr),
            }),
            OP_AUIPC => Ok(Self::Auipc {
                dest: rd(instr),
                u_immediate: u_immediate(instr),
            }),
            OP_JAL => Ok(Self::Jal {
                dest: rd(instr),
                offset: jal_offset(instr),
            }),
            OP_JALR => match funct3(instr) {
                0 => Ok(Self::Jalr {
                    dest: rd(instr),
                    base: rs1(instr),
                    offset: imm_itype(instr),
                }),
                funct3 => Err(DecodeError::InvalidFunct3 { opcode: op, funct3 }),
            },
            OP_BRANCH => {
                let mnemonic = match funct3(instr) {
                    FUNCT3_BEQ => Branch::Beq,
                    FUNCT3_BNE => Branch::Bne,
                    FUNCT3_BLT => Branch::Blt,
                    FUNCT3_BGE => Branch::Bge,
                    FUNCT3_BLTU => Branch::Bltu,
                    FUNCT3_BGEU => Branch::Bgeu,
                    funct3 => return Err(DecodeError::InvalidFunct3 { opcode: op, funct3 }),
                };
                Ok(Self::Branch {
                    mnemonic,
                    src1: rs1(instr),
                    src2: rs2(instr),
                    offset: imm_btype(instr),
                })
            }
            OP_LOAD => {
                let mnemonic = match funct3(instr) {
                    FUNCT3_B => Load::Lb,
                    FUNCT3_H => Load::Lh,
                    FUNCT3_W => Load::Lw,
                    FUNCT3_BU => Load::Lbu,
                    FUNCT3_HU => Load::Lhu,
                    funct3 => return Err(DecodeError::InvalidFunct3 { opcode: op, funct3 }),
                };
                Ok(Self::Load {
                    mnemonic,
                    dest: rd(instr),
                    base: rs1(instr),
                    offset: imm_itype(instr),
                })
            }
            OP_STORE => {
                let mnemonic = match funct3(instr) {
                    FUNCT3_B => Store::Sb,
                    FUNCT3_H => Store::Sh,
                    FUNCT3_W => Store::Sw,
                    funct3 => return Err(DecodeError::InvalidFunct3 { opcode: op, funct3 }),
                };
                Ok(Self::Store {
                    mnemonic,
                    src: rs2(instr),
                    base: rs1(instr),
                    offset: imm_stype(instr),
                })
            }
            OP_IMM => decode_reg_imm(instr),
            OP => decode_reg_reg(instr),
            OP_MISC_MEM => decode_misc_mem(instr),
            OP_SYSTEM => decode_system(instr),
            OP_CUSTOM_0 if instr == TH_DCACHE_CIALL => Ok(Self::CacheFlushAll),
            OP_CUSTOM_0 => Err(DecodeError::Unsupported(instr)),
            _ => Err(DecodeError::InvalidOpcode(op)),
        }
    }

    /// True for instructions that end a speculative window: the
    /// system traps and the instruction fence.
    pub fn is_serializing(&self) -> bool {
        matches!(self, Self::Ecall | Self::Ebreak | Self::FenceI)
    }
}

/// Render a 12-bit immediate as a signed decimal
fn signed12(imm: u16) -> i32 {
    interpret_u32_as_signed(sign_extend(imm, 11))
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Beq => "beq",
            Self::Bne => "bne",
            Self::Blt => "blt",
            Self::Bge => "bge",
            Self::Bltu => "bltu",
            Self::Bgeu => "bgeu",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for Load {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Lb => "lb",
            Self::Lh => "lh",
            Self::Lw => "lw",
            Self::Lbu => "lbu",
            Self::Lhu => "lhu",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Sb => "sb",
            Self::Sh => "sh",
            Self::Sw => "sw",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for RegImm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Addi => "addi",
            Self::Slti => "slti",
            Self::Sltiu => "sltiu",
            Self::Andi => "andi",
            Self::Ori => "ori",
            Self::Xori => "xori",
            Self::Slli => "slli",
            Self::Srli => "srli",
            Self::Srai => "srai",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for RegReg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Slt => "slt",
            Self::Sltu => "sltu",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Sll => "sll",
            Self::Srl => "srl",
            Self::Sra => "sra",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Cycle => "rdcycle",
            Self::CycleH => "rdcycleh",
            Self::Instret => "rdinstret",
            Self::InstretH => "rdinstreth",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Lui { dest, u_immediate } => {
                write!(f, "lui {}, 0x{u_immediate:x}", abi_name(*dest))
            }
            Self::Auipc { dest, u_immediate } => {
                write!(f, "auipc {}, 0x{u_immediate:x}", abi_name(*dest))
            }
            Self::Jal { dest, offset } => {
                let offset = interpret_u32_as_signed(sign_extend(*offset, 20));
                write!(f, "jal {}, {offset}", abi_name(*dest))
            }
            Self::Jalr { dest, base, offset } => write!(
                f,
                "jalr {}, {}({})",
                abi_name(*dest),
                signed12(*offset),
                abi_name(*base)
            ),
            Self::Branch {
                mnemonic,
                src1,
                src2,
                offset,
            } => {
                let offset = interpret_u32_as_signed(sign_extend(*offset, 12));
                write!(
                    f,
                    "{mnemonic} {}, {}, {offset}",
                    abi_name(*src1),
                    abi_name(*src2)
                )
            }
            Self::Load {
                mnemonic,
                dest,
                base,
                offset,
            } => write!(
                f,
                "{mnemonic} {}, {}({})",
                abi_name(*dest),
                signed12(*offset),
                abi_name(*base)
            ),
            Self::Store {
                mnemonic,
                src,
                base,
                offset,
            } => write!(
                f,
                "{mnemonic} {}, {}({})",
                abi_name(*src),
                signed12(*offset),
                abi_name(*base)
            ),
            Self::RegImm {
                mnemonic,
                dest,
                src,
                i_immediate,
            } => {
                let imm = match mnemonic {
                    RegImm::Slli | RegImm::Srli | RegImm::Srai => i32::from(*i_immediate),
                    _ => signed12(*i_immediate),
                };
                write!(f, "{mnemonic} {}, {}, {imm}", abi_name(*dest), abi_name(*src))
            }
            Self::RegReg {
                mnemonic,
                dest,
                src1,
                src2,
            } => write!(
                f,
                "{mnemonic} {}, {}, {}",
                abi_name(*dest),
                abi_name(*src1),
                abi_name(*src2)
            ),
            Self::Fence => write!(f, "fence"),
            Self::FenceI => write!(f, "fence.i"),
            Self::CacheFlush { base } => write!(f, "cbo.flush ({})", abi_name(*base)),
            Self::CacheFlushAll => write!(f, "th.dcache.ciall"),
            Self::ReadCounter { dest, counter } => write!(f, "{counter} {}", abi_name(*dest)),
            Self::Ecall => write!(f, "ecall"),
            Self::Ebreak => write!(f, "ebreak"),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_decode_special_instructions() {
        assert_eq!(Instr::from(0x0000_0073).unwrap(), Instr::Ecall);
        assert_eq!(Instr::from(0x0010_0073).unwrap(), Instr::Ebreak);
        assert_eq!(Instr::from(0x0000_100f).unwrap(), Instr::FenceI);
        assert_eq!(Instr::from(0x0ff0_000f).unwrap(), Instr::Fence);
        assert_eq!(Instr::from(0x0030_000b).unwrap(), Instr::CacheFlushAll);
    }

    #[test]
    fn check_decode_cbo_flush() {
        // cbo.flush (a0)
        let instr = 0x0025_200f;
        assert_eq!(Instr::from(instr).unwrap(), Instr::CacheFlush { base: 10 });
    }

    #[test]
    fn check_decode_rdcycle() {
        // rdcycle a0 = csrrs a0, cycle, zero
        let instr = 0xc000_2573;
        assert_eq!(
            Instr::from(instr).unwrap(),
            Instr::ReadCounter {
                dest: 10,
                counter: Counter::Cycle
            }
        );
        // rdinstreth t0
        let instr = 0xc820_22f3;
        assert_eq!(
            Instr::from(instr).unwrap(),
            Instr::ReadCounter {
                dest: 5,
                counter: Counter::InstretH
            }
        );
    }

    #[test]
    fn check_csr_write_is_rejected() {
        // csrrs a0, cycle, a1 would write a read-only CSR
        let instr = 0xc005_a573;
        assert_eq!(Instr::from(instr), Err(DecodeError::Unsupported(instr)));
    }

    #[test]
    fn check_decode_jalr() {
        // jalr ra, 0(t0)
        let instr = 0x0002_80e7;
        assert_eq!(
            Instr::from(instr).unwrap(),
            Instr::Jalr {
                dest: 1,
                base: 5,
                offset: 0
            }
        );
    }

    #[test]
    fn check_decode_shifts() {
        // srai a0, a1, 3
        let instr = 0x4035_d513;
        assert_eq!(
            Instr::from(instr).unwrap(),
            Instr::RegImm {
                mnemonic: RegImm::Srai,
                dest: 10,
                src: 11,
                i_immediate: 3
            }
        );
        // slli with a non-zero funct7 is reserved
        let instr = 0x4035_9513;
        assert!(matches!(
            Instr::from(instr),
            Err(DecodeError::InvalidFunct7 { .. })
        ));
    }

    #[test]
    fn check_invalid_opcode() {
        // Floating point loads are not implemented
        let instr = 0x0000_2007;
        assert_eq!(Instr::from(instr), Err(DecodeError::InvalidOpcode(0b0000111)));
        assert_eq!(Instr::from(0), Err(DecodeError::InvalidOpcode(0)));
    }

    #[test]
    fn check_display() {
        let instr = Instr::from(0xfe51_2e23).unwrap();
        assert_eq!(format!("{instr}"), "sw t0, -4(sp)");
        let instr = Instr::from(0x0025_200f).unwrap();
        assert_eq!(format!("{instr}"), "cbo.flush (a0)");
    }
}
