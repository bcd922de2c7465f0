use crate::instr::abi_name;
use itertools::Itertools;
use std::fmt;

/// The 32 integer registers of RV32I
///
/// Register x0 is hardwired to zero: writes to it are discarded.
/// Register indices come from 5-bit instruction fields, so they are
/// masked rather than checked.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    registers: [u32; 32],
}

/// Register numbers by ABI name
pub mod abi {
    pub const ZERO: u8 = 0;
    pub const RA: u8 = 1;
    pub const SP: u8 = 2;
    pub const GP: u8 = 3;
    pub const TP: u8 = 4;
    pub const T0: u8 = 5;
    pub const T1: u8 = 6;
    pub const T2: u8 = 7;
    pub const S0: u8 = 8;
    pub const S1: u8 = 9;
    pub const A0: u8 = 10;
    pub const A1: u8 = 11;
    pub const A2: u8 = 12;
    pub const A3: u8 = 13;
    pub const A4: u8 = 14;
    pub const A5: u8 = 15;
    pub const A6: u8 = 16;
    pub const A7: u8 = 17;
    pub const S2: u8 = 18;
    pub const S3: u8 = 19;
    pub const S4: u8 = 20;
    pub const S5: u8 = 21;
    pub const S6: u8 = 22;
    pub const S7: u8 = 23;
    pub const S8: u8 = 24;
    pub const S9: u8 = 25;
    pub const S10: u8 = 26;
    pub const S11: u8 = 27;
    pub const T3: u8 = 28;
    pub const T4: u8 = 29;
    pub const T5: u8 = 30;
    pub const T6: u8 = 31;
}

impl Registers {
    pub fn write(&mut self, which: u8, value: u32) {
        let which = usize::from(which & 0x1f);
        if which != 0 {
            self.registers[which] = value;
        }
    }

    pub fn read(&self, which: u8) -> u32 {
        self.registers[usize::from(which & 0x1f)]
    }
}

impl fmt::Display for Registers {
    /// Four registers per line, named by ABI name
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let lines = (0u8..32)
            .map(|n| format!("{:>4} = 0x{:08x}", abi_name(n), self.read(n)))
            .chunks(4)
            .into_iter()
            .map(|mut line| line.join("  "))
            .join("\n");
        write!(f, "{lines}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_registers_initialised_to_zero() {
        let reg = Registers::default();
        for n in 0..32 {
            assert_eq!(reg.read(n), 0)
        }
    }

    #[test]
    fn check_write_then_read() {
        let mut reg = Registers::default();
        for n in 1..32 {
            let value = 2 * u32::from(n) + 0x8000_0000;
            reg.write(n, value);
            assert_eq!(reg.read(n), value);
        }
    }

    #[test]
    fn check_write_then_read_x0() {
        let mut reg = Registers::default();
        reg.write(0, 0x3423);
        assert_eq!(reg.read(0), 0);
    }

    #[test]
    fn check_display_names_registers() {
        let mut reg = Registers::default();
        reg.write(abi::SP, 0x1000_0000);
        let text = format!("{reg}");
        assert_eq!(text.lines().count(), 8);
        assert!(text.contains("sp = 0x10000000"));
    }
}
