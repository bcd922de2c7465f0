//! Field getters for 32-bit instruction words
//!
//! Bit positions follow the base instruction formats (R, I, S, B, U
//! and J) in chapter 2 of the RISC-V unprivileged ISA manual.

use crate::utils::extract_field;

pub fn opcode(instr: u32) -> u32 {
    extract_field(instr, 6, 0)
}

pub fn funct3(instr: u32) -> u32 {
    extract_field(instr, 14, 12)
}

pub fn funct7(instr: u32) -> u32 {
    extract_field(instr, 31, 25)
}

pub fn rd(instr: u32) -> u8 {
    extract_field(instr, 11, 7) as u8
}

pub fn rs1(instr: u32) -> u8 {
    extract_field(instr, 19, 15) as u8
}

pub fn rs2(instr: u32) -> u8 {
    extract_field(instr, 24, 20) as u8
}

/// The 12-bit immediate of an I-type instruction (not sign extended)
pub fn imm_itype(instr: u32) -> u16 {
    extract_field(instr, 31, 20) as u16
}

/// The 12-bit immediate of an S-type instruction (not sign extended)
pub fn imm_stype(instr: u32) -> u16 {
    let imm11_5 = extract_field(instr, 31, 25);
    let imm4_0 = extract_field(instr, 11, 7);
    ((imm11_5 << 5) | imm4_0) as u16
}

/// Return the branch offset including the least-significant
/// zero (i.e. 13 bits long)
pub fn imm_btype(instr: u32) -> u16 {
    let imm12 = extract_field(instr, 31, 31);
    let imm11 = extract_field(instr, 7, 7);
    let imm10_5 = extract_field(instr, 30, 25);
    let imm4_1 = extract_field(instr, 11, 8);
    ((imm12 << 12) | (imm11 << 11) | (imm10_5 << 5) | (imm4_1 << 1)) as u16
}

/// The upper 20 bits of a U-type instruction, not shifted
pub fn u_immediate(instr: u32) -> u32 {
    extract_field(instr, 31, 12)
}

/// Return the jal offset including the least-significant
/// zero (i.e. 21 bits long)
pub fn jal_offset(instr: u32) -> u32 {
    let imm20 = extract_field(instr, 31, 31);
    let imm19_12 = extract_field(instr, 19, 12);
    let imm11 = extract_field(instr, 20, 20);
    let imm10_1 = extract_field(instr, 30, 21);
    (imm20 << 20) | (imm19_12 << 12) | (imm11 << 11) | (imm10_1 << 1)
}

/// The shift amount of a shift-by-immediate instruction. In RV32I
/// this is the low 5 bits of the I-type immediate.
pub fn shamt(instr: u32) -> u8 {
    extract_field(instr, 24, 20) as u8
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_register_fields() {
        // add x3, x1, x2
        let instr = 0x0020_81b3;
        assert_eq!(opcode(instr), 0b0110011);
        assert_eq!(rd(instr), 3);
        assert_eq!(rs1(instr), 1);
        assert_eq!(rs2(instr), 2);
        assert_eq!(funct3(instr), 0);
        assert_eq!(funct7(instr), 0);
    }

    #[test]
    fn check_store_immediate() {
        // sw x5, -4(x2)
        let instr = 0xfe51_2e23;
        assert_eq!(imm_stype(instr), 0xffc);
    }

    #[test]
    fn check_branch_immediate() {
        // beq x0, x0, -8
        let instr = 0xfe00_0ce3;
        assert_eq!(imm_btype(instr), 0x1ff8);
    }

    #[test]
    fn check_jal_offset() {
        // jal x1, 2048
        let instr = 0x0010_00ef;
        assert_eq!(jal_offset(instr), 2048);
    }
}
