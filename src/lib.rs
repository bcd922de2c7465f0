#![forbid(unsafe_code)]

pub mod config;
pub mod console;
pub mod elf_utils;
pub mod encode;
pub mod hart;
pub mod instr;
pub mod platform;
pub mod syscall;
pub mod utils;
