//! Instruction words
//!
//! Decoding of the 32-bit instruction words understood by the host:
//! the RV32I base integer set, the counter reads, the instruction and
//! data fences, and the two cache-maintenance instructions used by
//! guests to control cache residency.

pub mod decode;
pub mod fields;
pub mod opcodes;

/// ABI names of the integer registers, indexed by register number
pub const ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

/// Return the ABI name of register x (e.g. "sp" for 2). Out of range
/// register numbers render as "x?".
pub fn abi_name(x: u8) -> &'static str {
    ABI_NAMES.get(usize::from(x)).copied().unwrap_or("x?")
}
