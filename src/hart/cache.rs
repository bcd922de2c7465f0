//! Data cache model
//!
//! The cache holds residency only, never data: architectural values
//! always come from memory, and the cache decides how long an access
//! takes. An address is split into tag, set index and line offset in
//! the usual way, and each set holds `ways` lines which are replaced
//! according to the configured policy when the set is full.

use crate::config::{CacheConfig, ReplacementPolicy};
use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache {what} must be a non-zero power of two, got {value}")]
    NotPowerOfTwo { what: &'static str, value: u32 },
    #[error("cache line size {0} is smaller than a word")]
    LineTooSmall(u32),
    #[error("not enough address bits left for the cache tag")]
    NoTagBits,
    #[error("cache of {0} lines is larger than {MAX_LINES}")]
    TooLarge(u64),
}

/// Largest number of lines (sets times ways) a cache may have
pub const MAX_LINES: u64 = 1 << 20;

/// Outcome of a cache access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Hit,
    Miss,
}

#[derive(Debug, Clone, Copy, Default)]
struct Line {
    tag: Option<u32>,
    /// Last access (LRU) or fill (FIFO), in cache clock ticks
    stamp: u64,
}

#[derive(Debug, Clone)]
pub struct Cache {
    config: CacheConfig,
    offset_bits: u32,
    index_bits: u32,
    lines: Vec<Line>,
    /// Incremented on every access; orders the stamps
    clock: u64,
    rng: StdRng,
}

fn check_power_of_two(what: &'static str, value: u32) -> Result<u32, CacheError> {
    if value.is_power_of_two() {
        Ok(value.trailing_zeros())
    } else {
        Err(CacheError::NotPowerOfTwo { what, value })
    }
}

impl Cache {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let index_bits = check_power_of_two("set count", config.sets)?;
        check_power_of_two("way count", config.ways)?;
        let offset_bits = check_power_of_two("line size", config.line_size)?;
        if config.line_size < 4 {
            return Err(CacheError::LineTooSmall(config.line_size));
        }
        if offset_bits + index_bits >= 32 {
            return Err(CacheError::NoTagBits);
        }
        let num_lines = u64::from(config.sets) * u64::from(config.ways);
        if num_lines > MAX_LINES {
            return Err(CacheError::TooLarge(num_lines));
        }
        Ok(Self {
            config,
            offset_bits,
            index_bits,
            lines: vec![Line::default(); num_lines as usize],
            clock: 0,
            rng: StdRng::seed_from_u64(config.seed),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Split addr into (tag, set index, line offset)
    pub fn parse_addr(&self, addr: u32) -> (u32, u32, u32) {
        let tag = addr >> (self.offset_bits + self.index_bits);
        let index = (addr >> self.offset_bits) & ((1 << self.index_bits) - 1);
        let offset = addr & ((1 << self.offset_bits) - 1);
        (tag, index, offset)
    }

    /// The address of the first byte of the line containing addr
    pub fn line_address(&self, addr: u32) -> u32 {
        addr & !((1 << self.offset_bits) - 1)
    }

    fn set_mut(&mut self, index: u32) -> &mut [Line] {
        let ways = self.config.ways as usize;
        let start = index as usize * ways;
        &mut self.lines[start..start + ways]
    }

    fn set(&self, index: u32) -> &[Line] {
        let ways = self.config.ways as usize;
        let start = index as usize * ways;
        &self.lines[start..start + ways]
    }

    /// Access the line containing addr, filling it if it is absent.
    /// Returns whether the line was already present.
    pub fn access(&mut self, addr: u32) -> Access {
        let (tag, index, _) = self.parse_addr(addr);
        self.clock += 1;
        let clock = self.clock;
        let policy = self.config.policy;

        if let Some(line) = self
            .set_mut(index)
            .iter_mut()
            .find(|line| line.tag == Some(tag))
        {
            if policy == ReplacementPolicy::Lru {
                line.stamp = clock;
            }
            return Access::Hit;
        }

        let victim = match self.set(index).iter().position(|line| line.tag.is_none()) {
            Some(free) => free,
            None => self.choose_victim(index),
        };
        self.set_mut(index)[victim] = Line {
            tag: Some(tag),
            stamp: clock,
        };
        Access::Miss
    }

    /// Pick the way to evict from a full set
    fn choose_victim(&mut self, index: u32) -> usize {
        match self.config.policy {
            ReplacementPolicy::Random => self.rng.gen_range(0..self.config.ways as usize),
            ReplacementPolicy::Lru | ReplacementPolicy::Fifo => self
                .set(index)
                .iter()
                .enumerate()
                .min_by_key(|(_, line)| line.stamp)
                .map(|(way, _)| way)
                .unwrap_or(0),
        }
    }

    /// Whether the line containing addr is present. This does not
    /// count as an access.
    pub fn is_present(&self, addr: u32) -> bool {
        let (tag, index, _) = self.parse_addr(addr);
        self.set(index).iter().any(|line| line.tag == Some(tag))
    }

    /// Evict the line containing addr (if present)
    pub fn flush(&mut self, addr: u32) {
        let (tag, index, _) = self.parse_addr(addr);
        for line in self.set_mut(index) {
            if line.tag == Some(tag) {
                *line = Line::default();
            }
        }
    }

    /// Evict every line
    pub fn flush_all(&mut self) {
        self.lines.fill(Line::default());
    }

    /// Line addresses of every present line, in ascending order
    pub fn resident_lines(&self) -> Vec<u32> {
        let ways = self.config.ways as usize;
        let mut resident: Vec<u32> = self
            .lines
            .iter()
            .enumerate()
            .filter_map(|(n, line)| {
                let index = (n / ways) as u32;
                line.tag.map(|tag| {
                    (tag << (self.offset_bits + self.index_bits)) | (index << self.offset_bits)
                })
            })
            .collect();
        resident.sort_unstable();
        resident
    }
}
