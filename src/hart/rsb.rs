//! Return-stack buffer
//!
//! Predicts where a return goes from the calls that came before it.
//! Calls and returns are told apart by their use of the link
//! registers (ra and t0), following the hints given with the
//! definition of jal and jalr in the RISC-V unprivileged ISA manual:
//!
//! | rd is a link | rs1 is a link  | action         |
//! |--------------|----------------|----------------|
//! | no           | no             | none           |
//! | no           | yes            | pop            |
//! | yes          | no             | push           |
//! | yes          | yes, rd != rs1 | pop, then push |
//! | yes          | yes, rd == rs1 | push           |
//!
//! jal has no rs1, so it can only push. The stack has a fixed depth,
//! and a push onto a full stack loses the oldest entry.

use super::registers::abi::{RA, T0};
use std::collections::VecDeque;

fn is_link(x: u8) -> bool {
    x == RA || x == T0
}

/// Whether a jump with these registers pops a return address
fn pops(dest: u8, base: Option<u8>) -> bool {
    match base {
        Some(base) if is_link(base) => !is_link(dest) || dest != base,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct Rsb {
    depth: usize,
    entries: VecDeque<u32>,
}

impl Rsb {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            entries: VecDeque::with_capacity(depth),
        }
    }

    fn push(&mut self, addr: u32) {
        if self.depth == 0 {
            return;
        }
        if self.entries.len() == self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(addr);
    }

    /// The predicted target of jalr dest, base, if it is a return
    /// and the stack is not empty
    pub fn predict(&self, dest: u8, base: u8) -> Option<u32> {
        if pops(dest, Some(base)) {
            self.entries.back().copied()
        } else {
            None
        }
    }

    /// Apply the stack effect of the jump at pc, which is a jal if
    /// base is None and a jalr otherwise
    pub fn update(&mut self, pc: u32, dest: u8, base: Option<u8>) {
        if pops(dest, base) {
            self.entries.pop_back();
        }
        if is_link(dest) {
            self.push(pc.wrapping_add(4));
        }
    }
}
