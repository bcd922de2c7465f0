//! Branch direction predictor
//!
//! A table of two-bit saturating counters, indexed by the branch
//! address with the instruction alignment bits dropped. A counter of
//! 2 or 3 predicts taken. Each resolved branch moves its counter one
//! step towards what it did. With zero index bits, every branch in
//! the program shares a single counter.

/// Counter value meaning "strongly taken"
const STRONGLY_TAKEN: u8 = 3;

fn counter_update(counter: u8, taken: bool) -> u8 {
    if taken {
        (counter + 1).min(STRONGLY_TAKEN)
    } else {
        counter.saturating_sub(1)
    }
}

#[derive(Debug, Clone)]
pub struct Bpu {
    index_bits: u32,
    counters: Vec<u8>,
}

impl Bpu {
    /// Make a predictor of 2^index_bits counters (index_bits is
    /// clamped to 20), all starting at init_counter (clamped to 3)
    pub fn new(index_bits: u32, init_counter: u8) -> Self {
        let index_bits = index_bits.min(20);
        Self {
            index_bits,
            counters: vec![init_counter.min(STRONGLY_TAKEN); 1 << index_bits],
        }
    }

    fn index(&self, pc: u32) -> usize {
        ((pc >> 2) & ((1 << self.index_bits) - 1)) as usize
    }

    /// Whether the branch at pc is expected to be taken
    pub fn predict(&self, pc: u32) -> bool {
        self.counters[self.index(pc)] >= 2
    }

    /// Record that the branch at pc was (or was not) taken
    pub fn update(&mut self, pc: u32, taken: bool) {
        let index = self.index(pc);
        self.counters[index] = counter_update(self.counters[index], taken);
    }
}
