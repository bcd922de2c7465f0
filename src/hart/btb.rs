//! Branch-target buffer
//!
//! Direct-mapped table from jalr site to the target that site
//! last resolved to. Entries are tagged with the full site address, so
//! a prediction is only ever made for a site that has resolved before.

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    site: u32,
    target: u32,
}

#[derive(Debug, Clone)]
pub struct Btb {
    index_bits: u32,
    entries: Vec<Option<Entry>>,
}

impl Btb {
    /// Make an empty BTB of 2^index_bits entries (index_bits is
    /// clamped to 20)
    pub fn new(index_bits: u32) -> Self {
        let index_bits = index_bits.min(20);
        Self {
            index_bits,
            entries: vec![None; 1 << index_bits],
        }
    }

    fn index(&self, site: u32) -> usize {
        ((site >> 2) & ((1 << self.index_bits) - 1)) as usize
    }

    /// The predicted target for the jump at site, if any
    pub fn predict(&self, site: u32) -> Option<u32> {
        match self.entries[self.index(site)] {
            Some(entry) if entry.site == site => Some(entry.target),
            _ => None,
        }
    }

    /// Record that the jump at site resolved to target
    pub fn update(&mut self, site: u32, target: u32) {
        let index = self.index(site);
        self.entries[index] = Some(Entry { site, target });
    }
}
