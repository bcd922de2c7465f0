//! Instruction encoding
//!
//! Functions that produce instruction words, and a small label-aware
//! program builder on top of them. The host never needs to assemble
//! anything itself; these exist so that guest programs can be written
//! directly in Rust (mainly in tests).

use crate::elf_utils::{Chunk, Image};
use crate::instr::opcodes::*;
use crate::utils::{extract_field, interpret_i32_as_unsigned};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

pub use crate::hart::registers::abi::*;

/// Make an I-type instruction. Only produces a valid I-type
/// instruction if the arguments are in range.
pub fn itype(imm: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (0xfff & imm) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

/// Make an U- or J-type instruction (if you are making
/// a J-type instruction, make sure to construct the
/// immediate field correctly using jtype_imm_field)
pub fn ujtype(imm: u32, rd: u32, opcode: u32) -> u32 {
    (0xf_ffff & imm) << 12 | rd << 7 | opcode
}

/// Make an R- or S-type instruction. These instructions
/// have the same number of fields of the same size. The meaning
/// of a and b is:
///
/// R-type: a = funct7, b = rd
/// S-type: a = imm[11:5], b = imm[4:0]
pub fn rstype(a: u32, rs2: u32, rs1: u32, funct3: u32, b: u32, opcode: u32) -> u32 {
    a << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | b << 7 | opcode
}

/// Takes an immediate and shuffles it into the
/// format required for the 20-bit field of the
/// U-type instruction (making it J-type)
pub fn jtype_imm_field(imm: i32) -> u32 {
    let imm = interpret_i32_as_unsigned(imm);
    let imm20 = extract_field(imm, 20, 20);
    let imm19_12 = extract_field(imm, 19, 12);
    let imm11 = extract_field(imm, 11, 11);
    let imm10_1 = extract_field(imm, 10, 1);
    (imm20 << 19) | (imm10_1 << 9) | (imm11 << 8) | imm19_12
}

/// Returns (a, b) suitable for use with rstype for
/// the conditional branch instructions (btype)
pub fn btype_imm_fields(imm: i32) -> (u32, u32) {
    let imm = interpret_i32_as_unsigned(imm);
    let imm12 = extract_field(imm, 12, 12);
    let imm11 = extract_field(imm, 11, 11);
    let imm10_5 = extract_field(imm, 10, 5);
    let imm4_1 = extract_field(imm, 4, 1);
    let a = (imm12 << 6) | imm10_5;
    let b = (imm4_1 << 1) | imm11;
    (a, b)
}

fn i(imm: i32, rs1: u8, funct3: u32, rd: u8, opcode: u32) -> u32 {
    itype(interpret_i32_as_unsigned(imm), rs1.into(), funct3, rd.into(), opcode)
}

fn s(imm: i32, rs2: u8, rs1: u8, funct3: u32) -> u32 {
    let imm = interpret_i32_as_unsigned(imm);
    let imm11_5 = extract_field(imm, 11, 5);
    let imm4_0 = extract_field(imm, 4, 0);
    rstype(imm11_5, rs2.into(), rs1.into(), funct3, imm4_0, OP_STORE)
}

fn r(funct7: u32, rs2: u8, rs1: u8, funct3: u32, rd: u8) -> u32 {
    rstype(funct7, rs2.into(), rs1.into(), funct3, rd.into(), OP)
}

fn b(imm: i32, rs2: u8, rs1: u8, funct3: u32) -> u32 {
    let (a, b) = btype_imm_fields(imm);
    rstype(a, rs2.into(), rs1.into(), funct3, b, OP_BRANCH)
}

/// Note: the immediate is already the upper 20 bits that will be
/// loaded; it will not be shifted up.
pub fn lui(rd: u8, imm: u32) -> u32 {
    ujtype(imm, rd.into(), OP_LUI)
}

pub fn auipc(rd: u8, imm: u32) -> u32 {
    ujtype(imm, rd.into(), OP_AUIPC)
}

pub fn jal(rd: u8, offset: i32) -> u32 {
    ujtype(jtype_imm_field(offset), rd.into(), OP_JAL)
}

pub fn jalr(rd: u8, rs1: u8, offset: i32) -> u32 {
    i(offset, rs1, 0b000, rd, OP_JALR)
}

pub fn beq(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b(offset, rs2, rs1, FUNCT3_BEQ)
}

pub fn bne(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b(offset, rs2, rs1, FUNCT3_BNE)
}

pub fn blt(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b(offset, rs2, rs1, FUNCT3_BLT)
}

pub fn bge(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b(offset, rs2, rs1, FUNCT3_BGE)
}

pub fn bltu(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b(offset, rs2, rs1, FUNCT3_BLTU)
}

pub fn bgeu(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b(offset, rs2, rs1, FUNCT3_BGEU)
}

pub fn lb(rd: u8, rs1: u8, offset: i32) -> u32 {
    i(offset, rs1, FUNCT3_B, rd, OP_LOAD)
}

pub fn lh(rd: u8, rs1: u8, offset: i32) -> u32 {
    i(offset, rs1, FUNCT3_H, rd, OP_LOAD)
}

pub fn lw(rd: u8, rs1: u8, offset: i32) -> u32 {
    i(offset, rs1, FUNCT3_W, rd, OP_LOAD)
}

pub fn lbu(rd: u8, rs1: u8, offset: i32) -> u32 {
    i(offset, rs1, FUNCT3_BU, rd, OP_LOAD)
}

pub fn lhu(rd: u8, rs1: u8, offset: i32) -> u32 {
    i(offset, rs1, FUNCT3_HU, rd, OP_LOAD)
}

pub fn sb(rs2: u8, rs1: u8, offset: i32) -> u32 {
    s(offset, rs2, rs1, FUNCT3_B)
}

pub fn sh(rs2: u8, rs1: u8, offset: i32) -> u32 {
    s(offset, rs2, rs1, FUNCT3_H)
}

pub fn sw(rs2: u8, rs1: u8, offset: i32) -> u32 {
    s(offset, rs2, rs1, FUNCT3_W)
}

pub fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    i(imm, rs1, FUNCT3_ADDI, rd, OP_IMM)
}

pub fn slti(rd: u8, rs1: u8, imm: i32) -> u32 {
    i(imm, rs1, FUNCT3_SLTI, rd, OP_IMM)
}

pub fn sltiu(rd: u8, rs1: u8, imm: i32) -> u32 {
    i(imm, rs1, FUNCT3_SLTIU, rd, OP_IMM)
}

pub fn xori(rd: u8, rs1: u8, imm: i32) -> u32 {
    i(imm, rs1, FUNCT3_XORI, rd, OP_IMM)
}

pub fn ori(rd: u8, rs1: u8, imm: i32) -> u32 {
    i(imm, rs1, FUNCT3_ORI, rd, OP_IMM)
}

pub fn andi(rd: u8, rs1: u8, imm: i32) -> u32 {
    i(imm, rs1, FUNCT3_ANDI, rd, OP_IMM)
}

/// The shift-by-immediate instructions use I-type,
/// but with a special encoding of the immediate that
/// uses the lower 5 bits for the shift amount (shamt)
/// and the upper 7 bits to distinguish between arithmetical
/// and logical right shift
pub fn shifts_imm_field(shamt: u32, upper: u32) -> u32 {
    let shamt = extract_field(shamt, 4, 0);
    (upper << 5) | shamt
}

pub fn slli(rd: u8, rs1: u8, shamt: u32) -> u32 {
    let imm = shifts_imm_field(shamt, FUNCT7_ZERO);
    itype(imm, rs1.into(), FUNCT3_SLLI, rd.into(), OP_IMM)
}

pub fn srli(rd: u8, rs1: u8, shamt: u32) -> u32 {
    let imm = shifts_imm_field(shamt, FUNCT7_ZERO);
    itype(imm, rs1.into(), FUNCT3_SRLI, rd.into(), OP_IMM)
}

pub fn srai(rd: u8, rs1: u8, shamt: u32) -> u32 {
    let imm = shifts_imm_field(shamt, FUNCT7_SRA);
    itype(imm, rs1.into(), FUNCT3_SRAI, rd.into(), OP_IMM)
}

pub fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r(FUNCT7_ZERO, rs2, rs1, FUNCT3_ADD, rd)
}

pub fn sub(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r(FUNCT7_SUB, rs2, rs1, FUNCT3_SUB, rd)
}

pub fn sll(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r(FUNCT7_ZERO, rs2, rs1, FUNCT3_SLL, rd)
}

pub fn slt(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r(FUNCT7_ZERO, rs2, rs1, FUNCT3_SLT, rd)
}

pub fn sltu(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r(FUNCT7_ZERO, rs2, rs1, FUNCT3_SLTU, rd)
}

pub fn xor(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r(FUNCT7_ZERO, rs2, rs1, FUNCT3_XOR, rd)
}

pub fn srl(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r(FUNCT7_ZERO, rs2, rs1, FUNCT3_SRL, rd)
}

pub fn sra(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r(FUNCT7_SRA, rs2, rs1, FUNCT3_SRA, rd)
}

pub fn or(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r(FUNCT7_ZERO, rs2, rs1, FUNCT3_OR, rd)
}

pub fn and(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r(FUNCT7_ZERO, rs2, rs1, FUNCT3_AND, rd)
}

pub fn fence() -> u32 {
    itype(0x0ff, 0, FUNCT3_FENCE, 0, OP_MISC_MEM)
}

pub fn fence_i() -> u32 {
    itype(0, 0, FUNCT3_FENCE_I, 0, OP_MISC_MEM)
}

pub fn cbo_flush(rs1: u8) -> u32 {
    itype(CBO_FLUSH, rs1.into(), FUNCT3_CBO, 0, OP_MISC_MEM)
}

pub fn th_dcache_ciall() -> u32 {
    TH_DCACHE_CIALL
}

pub fn ecall() -> u32 {
    itype(IMM_ECALL, 0, FUNCT3_PRIV, 0, OP_SYSTEM)
}

pub fn ebreak() -> u32 {
    itype(IMM_EBREAK, 0, FUNCT3_PRIV, 0, OP_SYSTEM)
}

pub fn rdcycle(rd: u8) -> u32 {
    itype(CSR_CYCLE, 0, FUNCT3_CSRRS, rd.into(), OP_SYSTEM)
}

pub fn rdinstret(rd: u8) -> u32 {
    itype(CSR_INSTRET, 0, FUNCT3_CSRRS, rd.into(), OP_SYSTEM)
}

/// Split a 32-bit value into the (upper, lower) immediates of a
/// lui/addi pair, accounting for the sign extension of lower
pub fn hi_lo(value: u32) -> (u32, i32) {
    let upper = value.wrapping_add(0x800) >> 12;
    let lower = value.wrapping_sub(upper << 12) as i32;
    (upper, lower)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("label {0} is not defined")]
    UnknownLabel(String),
    #[error("label {0} is defined twice")]
    DuplicateLabel(String),
    #[error("offset {offset} to label {label} does not fit the instruction")]
    OutOfRange { label: String, offset: i64 },
}

#[derive(Debug, Clone, Copy)]
enum FixupKind {
    /// jal rd, label
    Jal { rd: u8 },
    /// branch rs1, rs2, label
    Branch { funct3: u32, rs1: u8, rs2: u8 },
    /// lui rd, %hi(label); addi rd, rd, %lo(label)
    Address { rd: u8 },
    /// A little-endian data word holding the address of the label
    DataWord { addr: u32 },
}

#[derive(Debug, Clone)]
struct Fixup {
    /// Index of the (first) instruction word to patch
    index: usize,
    kind: FixupKind,
    label: String,
}

/// Builds a guest program from instructions, labels and data
///
/// Instructions are placed one after another from the origin.
/// References to labels are resolved in build(), so a label may be
/// used before it is defined.
#[derive(Debug, Clone)]
pub struct ProgramBuilder {
    origin: u32,
    text: Vec<u32>,
    labels: HashMap<String, u32>,
    fixups: Vec<Fixup>,
    data: Vec<Chunk>,
    duplicates: Vec<String>,
}

impl ProgramBuilder {
    pub fn new(origin: u32) -> Self {
        Self {
            origin,
            text: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
            data: Vec::new(),
            duplicates: Vec::new(),
        }
    }

    /// Address of the next instruction
    pub fn pc(&self) -> u32 {
        self.origin + 4 * self.text.len() as u32
    }

    /// Define a symbol at an arbitrary address
    pub fn symbol(&mut self, name: &str, addr: u32) -> &mut Self {
        if self.labels.insert(name.to_string(), addr).is_some() {
            self.duplicates.push(name.to_string());
        }
        self
    }

    /// Define a label at the next instruction
    pub fn label(&mut self, name: &str) -> &mut Self {
        let pc = self.pc();
        self.symbol(name, pc)
    }

    pub fn emit(&mut self, instr: u32) -> &mut Self {
        self.text.push(instr);
        self
    }

    fn emit_fixup(&mut self, words: usize, kind: FixupKind, label: &str) -> &mut Self {
        self.fixups.push(Fixup {
            index: self.text.len(),
            kind,
            label: label.to_string(),
        });
        self.text.extend(std::iter::repeat(0).take(words));
        self
    }

    /// li rd, imm (one instruction if imm fits in 12 bits, else two)
    pub fn li(&mut self, rd: u8, imm: i32) -> &mut Self {
        if (-2048..2048).contains(&imm) {
            self.emit(addi(rd, ZERO, imm))
        } else {
            let (upper, lower) = hi_lo(interpret_i32_as_unsigned(imm));
            self.emit(lui(rd, upper));
            self.emit(addi(rd, rd, lower))
        }
    }

    /// la rd, label (always two instructions)
    pub fn la(&mut self, rd: u8, label: &str) -> &mut Self {
        self.emit_fixup(2, FixupKind::Address { rd }, label)
    }

    /// mv rd, rs
    pub fn mv(&mut self, rd: u8, rs: u8) -> &mut Self {
        self.emit(addi(rd, rs, 0))
    }

    pub fn jal_to(&mut self, rd: u8, label: &str) -> &mut Self {
        self.emit_fixup(1, FixupKind::Jal { rd }, label)
    }

    /// call label (jal ra, label)
    pub fn call(&mut self, label: &str) -> &mut Self {
        self.jal_to(RA, label)
    }

    /// j label (jal zero, label)
    pub fn j(&mut self, label: &str) -> &mut Self {
        self.jal_to(ZERO, label)
    }

    /// ret (jalr zero, 0(ra))
    pub fn ret(&mut self) -> &mut Self {
        self.emit(jalr(ZERO, RA, 0))
    }

    fn branch_to(&mut self, funct3: u32, rs1: u8, rs2: u8, label: &str) -> &mut Self {
        self.emit_fixup(1, FixupKind::Branch { funct3, rs1, rs2 }, label)
    }

    pub fn beq_to(&mut self, rs1: u8, rs2: u8, label: &str) -> &mut Self {
        self.branch_to(FUNCT3_BEQ, rs1, rs2, label)
    }

    pub fn bne_to(&mut self, rs1: u8, rs2: u8, label: &str) -> &mut Self {
        self.branch_to(FUNCT3_BNE, rs1, rs2, label)
    }

    pub fn blt_to(&mut self, rs1: u8, rs2: u8, label: &str) -> &mut Self {
        self.branch_to(FUNCT3_BLT, rs1, rs2, label)
    }

    pub fn bge_to(&mut self, rs1: u8, rs2: u8, label: &str) -> &mut Self {
        self.branch_to(FUNCT3_BGE, rs1, rs2, label)
    }

    pub fn bltu_to(&mut self, rs1: u8, rs2: u8, label: &str) -> &mut Self {
        self.branch_to(FUNCT3_BLTU, rs1, rs2, label)
    }

    pub fn bgeu_to(&mut self, rs1: u8, rs2: u8, label: &str) -> &mut Self {
        self.branch_to(FUNCT3_BGEU, rs1, rs2, label)
    }

    /// Place bytes at addr
    pub fn data(&mut self, addr: u32, bytes: &[u8]) -> &mut Self {
        self.data.push(Chunk {
            addr,
            bytes: bytes.to_vec(),
        });
        self
    }

    /// Place the address of label as a data word at addr
    pub fn address_word(&mut self, addr: u32, label: &str) -> &mut Self {
        self.fixups.push(Fixup {
            index: 0,
            kind: FixupKind::DataWord { addr },
            label: label.to_string(),
        });
        self
    }

    /// The startup sequence every guest begins with: set the stack
    /// pointer, call main, and pass its return value to exit
    pub fn startup(&mut self, main: &str) -> &mut Self {
        self.label("_start")
            .li(SP, 0x1000_0000)
            .call(main)
            .li(A7, -1)
            .emit(ecall())
            .label("_HALT")
            .j("_HALT")
    }

    fn resolve(&self, label: &str) -> Result<u32, EncodeError> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| EncodeError::UnknownLabel(label.to_string()))
    }

    /// Resolve every label reference and produce the program image.
    /// The entry point is _start if it is defined, else the origin.
    pub fn build(&self) -> Result<Image, EncodeError> {
        if let Some(name) = self.duplicates.first() {
            return Err(EncodeError::DuplicateLabel(name.clone()));
        }
        let mut text = self.text.clone();
        let mut data = self.data.clone();
        for fixup in &self.fixups {
            let target = self.resolve(&fixup.label)?;
            let pc = self.origin + 4 * fixup.index as u32;
            let offset = i64::from(target) - i64::from(pc);
            let out_of_range = |bits: u32| {
                let limit = 1i64 << (bits - 1);
                if offset < -limit || offset >= limit {
                    Err(EncodeError::OutOfRange {
                        label: fixup.label.clone(),
                        offset,
                    })
                } else {
                    Ok(offset as i32)
                }
            };
            match fixup.kind {
                FixupKind::Jal { rd } => text[fixup.index] = jal(rd, out_of_range(21)?),
                FixupKind::Branch { funct3, rs1, rs2 } => {
                    text[fixup.index] = b(out_of_range(13)?, rs2, rs1, funct3)
                }
                FixupKind::Address { rd } => {
                    let (upper, lower) = hi_lo(target);
                    text[fixup.index] = lui(rd, upper);
                    text[fixup.index + 1] = addi(rd, rd, lower);
                }
                FixupKind::DataWord { addr } => data.push(Chunk {
                    addr,
                    bytes: target.to_le_bytes().to_vec(),
                }),
            }
        }

        let mut chunks = vec![Chunk {
            addr: self.origin,
            bytes: text.iter().flat_map(|word| word.to_le_bytes()).collect(),
        }];
        chunks.extend(data);
        let symbols: BTreeMap<u32, String> = self
            .labels
            .iter()
            .map(|(name, addr)| (*addr, name.clone()))
            .collect();
        Ok(Image {
            entry: self.labels.get("_start").copied().unwrap_or(self.origin),
            chunks,
            symbols,
        })
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::instr::decode::{Counter, Instr, Load, RegImm, Store};

    #[test]
    fn check_encodings_decode_back() {
        assert_eq!(lui(SP, 53), 0x0003_5137);
        assert_eq!(addi(SP, SP, -1), 0xfff1_0113);
        assert_eq!(sw(T0, SP, -4), 0xfe51_2e23);
        assert_eq!(beq(ZERO, ZERO, -8), 0xfe00_0ce3);
        assert_eq!(jal(RA, 2048), 0x0010_00ef);
        assert_eq!(jalr(RA, T0, 0), 0x0002_80e7);
        assert_eq!(srai(A0, A1, 3), 0x4035_d513);
        assert_eq!(cbo_flush(A0), 0x0025_200f);
        assert_eq!(rdcycle(A0), 0xc000_2573);
        assert_eq!(fence_i(), 0x0000_100f);
        assert_eq!(ecall(), 0x0000_0073);
        assert_eq!(ebreak(), 0x0010_0073);
        assert_eq!(th_dcache_ciall(), 0x0030_000b);
    }

    #[test]
    fn check_decoded_fields() {
        assert_eq!(
            Instr::from(lbu(A1, A0, 256)).unwrap(),
            Instr::Load {
                mnemonic: Load::Lbu,
                dest: A1,
                base: A0,
                offset: 256
            }
        );
        assert_eq!(
            Instr::from(sb(A1, A2, -1)).unwrap(),
            Instr::Store {
                mnemonic: Store::Sb,
                src: A1,
                base: A2,
                offset: 0xfff
            }
        );
        assert_eq!(
            Instr::from(andi(A0, A0, 256)).unwrap(),
            Instr::RegImm {
                mnemonic: RegImm::Andi,
                dest: A0,
                src: A0,
                i_immediate: 256
            }
        );
        assert_eq!(
            Instr::from(rdinstret(T1)).unwrap(),
            Instr::ReadCounter {
                dest: T1,
                counter: Counter::Instret
            }
        );
    }

    #[test]
    fn check_hi_lo() {
        assert_eq!(hi_lo(0x1000_0000), (0x10000, 0));
        assert_eq!(hi_lo(0xdead_beef), (0xdeadc, -273));
        assert_eq!(hi_lo(0x0000_0800), (0x1, -2048));
        let (upper, lower) = hi_lo(0xffff_ffff);
        assert_eq!((upper << 12).wrapping_add(lower as u32), 0xffff_ffff);
    }

    #[test]
    fn check_builder_resolves_forward_and_backward_labels() {
        let mut program = ProgramBuilder::new(0x100);
        program
            .label("top")
            .j("bottom")
            .emit(ebreak())
            .label("bottom")
            .beq_to(ZERO, ZERO, "top");
        let image = program.build().unwrap();
        assert_eq!(image.entry, 0x100);
        let words: Vec<u32> = image.chunks[0]
            .bytes
            .chunks(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        assert_eq!(words, vec![jal(ZERO, 8), ebreak(), beq(ZERO, ZERO, -8)]);
    }

    #[test]
    fn check_builder_address_words() {
        let mut program = ProgramBuilder::new(0);
        program
            .startup("main")
            .label("main")
            .la(A0, "table")
            .ret()
            .symbol("table", 0x0012_3800)
            .address_word(0x2000, "main");
        let image = program.build().unwrap();
        assert_eq!(image.entry, 0);
        assert_eq!(image.symbols.get(&0x0012_3800).unwrap(), "table");
        let main = *image.symbols.iter().find(|(_, n)| *n == "main").unwrap().0;
        assert_eq!(
            image.chunks[1],
            Chunk {
                addr: 0x2000,
                bytes: main.to_le_bytes().to_vec()
            }
        );
    }

    #[test]
    fn check_builder_errors() {
        let mut program = ProgramBuilder::new(0);
        program.j("nowhere");
        assert_eq!(
            program.build().unwrap_err(),
            EncodeError::UnknownLabel("nowhere".to_string())
        );

        let mut program = ProgramBuilder::new(0);
        program.label("a").label("a");
        assert_eq!(
            program.build().unwrap_err(),
            EncodeError::DuplicateLabel("a".to_string())
        );

        let mut program = ProgramBuilder::new(0);
        program.beq_to(ZERO, ZERO, "far").symbol("far", 0x10_0000);
        assert!(matches!(
            program.build().unwrap_err(),
            EncodeError::OutOfRange { .. }
        ));
    }
}
