//! Cycle counter and value-resolution scoreboard

use super::cache::Access;
use crate::config::Timing;
use crate::instr::decode::Counter;

/// Counts cycles and retired instructions
///
/// The cycle count only moves forward: each retired instruction adds
/// its cost, loads add the hit cost and (on a miss) the miss penalty.
/// Internally it is 64 bits wide; rdcycle reads the low half.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleCounter {
    timing: Timing,
    cycles: u64,
    instret: u64,
}

impl CycleCounter {
    pub fn new(timing: Timing) -> Self {
        Self {
            timing,
            ..Self::default()
        }
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn instret(&self) -> u64 {
        self.instret
    }

    /// Value of a counter CSR as seen by the guest
    pub fn read(&self, counter: Counter) -> u32 {
        let value = match counter {
            Counter::Cycle | Counter::CycleH => self.cycles,
            Counter::Instret | Counter::InstretH => self.instret,
        };
        match counter {
            Counter::Cycle | Counter::Instret => value as u32,
            Counter::CycleH | Counter::InstretH => (value >> 32) as u32,
        }
    }

    /// Retire an instruction that is neither a load nor a store
    pub fn retire(&mut self) {
        self.retire_with_cost(self.timing.retire_cycles);
    }

    pub fn retire_load(&mut self, access: Access) {
        let cost = match access {
            Access::Hit => self.timing.hit_cycles,
            Access::Miss => self.timing.hit_cycles + self.timing.miss_penalty,
        };
        self.retire_with_cost(cost);
    }

    pub fn retire_store(&mut self) {
        self.retire_with_cost(self.timing.store_cycles);
    }

    pub fn retire_flush(&mut self) {
        self.retire_with_cost(self.timing.flush_cycles);
    }

    fn retire_with_cost(&mut self, cost: u64) {
        self.cycles = self.cycles.saturating_add(cost);
        self.instret += 1;
    }
}

/// When each register's value becomes known to the front end
///
/// Each entry is the retired-instruction count at which the value in
/// that register is resolved. A load that misses the cache resolves
/// miss_penalty instructions after it issues, and results computed
/// from unresolved values are unresolved until their latest input
/// is. A branch or indirect jump on an unresolved register cannot be
/// checked against its prediction until the register resolves, which
/// bounds the speculative window. fence.i drains everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scoreboard {
    resolved_at: [u64; 32],
}

impl Scoreboard {
    pub fn resolved_at(&self, x: u8) -> u64 {
        self.resolved_at[usize::from(x & 0x1f)]
    }

    fn set(&mut self, x: u8, stamp: u64) {
        let x = usize::from(x & 0x1f);
        if x != 0 {
            self.resolved_at[x] = stamp;
        }
    }

    /// x now holds a value known at decode (an immediate, a link
    /// address, a counter or a syscall result)
    pub fn resolve(&mut self, x: u8) {
        self.set(x, 0);
    }

    /// dest is computed from srcs
    pub fn inherit(&mut self, dest: u8, srcs: &[u8]) {
        let stamp = srcs.iter().map(|x| self.resolved_at(*x)).max().unwrap_or(0);
        self.set(dest, stamp);
    }

    /// dest is loaded through base at instruction count now
    pub fn load(&mut self, dest: u8, base: u8, access: Access, now: u64, miss_penalty: u64) {
        let data_ready = match access {
            Access::Hit => now,
            Access::Miss => now + miss_penalty,
        };
        let stamp = data_ready.max(self.resolved_at(base));
        self.set(dest, stamp);
    }

    /// Instructions still to retire before x resolves
    pub fn pending(&self, x: u8, now: u64) -> u64 {
        self.resolved_at(x).saturating_sub(now)
    }

    pub fn drain(&mut self) {
        self.resolved_at = [0; 32];
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_counter_costs() {
        let mut counter = CycleCounter::new(Timing::default());
        counter.retire();
        assert_eq!(counter.cycles(), 1);
        counter.retire_load(Access::Miss);
        assert_eq!(counter.cycles(), 42);
        counter.retire_load(Access::Hit);
        assert_eq!(counter.cycles(), 43);
        assert_eq!(counter.instret(), 3);
        assert_eq!(counter.read(Counter::Cycle), 43);
        assert_eq!(counter.read(Counter::CycleH), 0);
        assert_eq!(counter.read(Counter::Instret), 3);
    }

    #[test]
    fn check_high_half_of_counter() {
        let timing = Timing {
            retire_cycles: 1 << 32,
            ..Timing::default()
        };
        let mut counter = CycleCounter::new(timing);
        counter.retire();
        counter.retire();
        assert_eq!(counter.read(Counter::Cycle), 0);
        assert_eq!(counter.read(Counter::CycleH), 2);
    }

    #[test]
    fn check_scoreboard_miss_propagates() {
        let mut scoreboard = Scoreboard::default();
        scoreboard.load(5, 10, Access::Miss, 100, 40);
        assert_eq!(scoreboard.pending(5, 101), 39);
        scoreboard.inherit(6, &[5, 7]);
        assert_eq!(scoreboard.resolved_at(6), 140);
        // A hit through an unresolved base is still unresolved
        scoreboard.load(7, 6, Access::Hit, 102, 40);
        assert_eq!(scoreboard.resolved_at(7), 140);
        scoreboard.resolve(6);
        assert_eq!(scoreboard.pending(6, 103), 0);
        scoreboard.drain();
        assert_eq!(scoreboard.pending(5, 103), 0);
        assert_eq!(scoreboard.pending(7, 103), 0);
    }

    #[test]
    fn check_x0_is_always_resolved() {
        let mut scoreboard = Scoreboard::default();
        scoreboard.load(0, 0, Access::Miss, 0, 40);
        assert_eq!(scoreboard.pending(0, 0), 0);
    }
}
