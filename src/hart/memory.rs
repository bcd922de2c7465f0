use std::collections::HashMap;
use thiserror::Error;

/// Word sizes of the loads and stores in RV32I
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wordsize {
    Byte,
    Halfword,
    Word,
}

impl Wordsize {
    pub fn width(&self) -> u32 {
        match self {
            Wordsize::Byte => 1,
            Wordsize::Halfword => 2,
            Wordsize::Word => 4,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("bad address: {len} byte access at 0x{addr:08x} is outside memory of size 0x{size:x}")]
    BadAddress { addr: u32, len: u64, size: u64 },
}

/// Guest memory
///
/// A flat byte-addressable store of `size` bytes starting at address
/// zero. Only bytes that have been written with a non-zero value are
/// held in the map, so the full 32-bit address space can be used
/// without allocating it; every other byte reads as zero.
///
/// Accesses are little-endian and need not be aligned. An access
/// any byte of which lies at or beyond `size` fails with
/// `MemoryError::BadAddress`; addresses never wrap around.
#[derive(Debug, Clone)]
pub struct Memory {
    size: u64,
    data: HashMap<u32, u8>,
}

/// The whole 32-bit address space
pub const FULL_ADDRESS_SPACE: u64 = 1 << 32;

impl Default for Memory {
    fn default() -> Self {
        Self::new(FULL_ADDRESS_SPACE)
    }
}

fn write_byte(byte_map: &mut HashMap<u32, u8>, addr: u32, value: u8) {
    if value == 0 {
        byte_map.remove(&addr);
    } else {
        byte_map.insert(addr, value);
    }
}

/// Assemble a little-endian value of num_bytes bytes, where the
/// byte at each address is supplied by read_byte
pub fn read_word(read_byte: impl Fn(u32) -> u8, addr: u32, num_bytes: u32) -> u32 {
    let mut value = 0;
    for n in 0..num_bytes {
        let byte_n = u32::from(read_byte(addr.wrapping_add(n)));
        value |= byte_n << (8 * n);
    }
    value
}

impl Memory {
    /// Make an empty memory of size bytes (at most the full 32-bit
    /// address space)
    pub fn new(size: u64) -> Self {
        Self {
            size: size.min(FULL_ADDRESS_SPACE),
            data: HashMap::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Check that every byte of [addr, addr + len) is addressable
    pub fn check_range(&self, addr: u32, len: u64) -> Result<(), MemoryError> {
        if u64::from(addr) + len > self.size {
            Err(MemoryError::BadAddress {
                addr,
                len,
                size: self.size,
            })
        } else {
            Ok(())
        }
    }

    /// Read a single byte without a range check
    pub fn byte(&self, addr: u32) -> u8 {
        *self.data.get(&addr).unwrap_or(&0)
    }

    pub fn read(&self, addr: u32, word_size: Wordsize) -> Result<u32, MemoryError> {
        let width = word_size.width();
        self.check_range(addr, width.into())?;
        Ok(read_word(|a| self.byte(a), addr, width))
    }

    /// Write the low bytes of value (as many as word_size says)
    pub fn write(&mut self, addr: u32, value: u32, word_size: Wordsize) -> Result<(), MemoryError> {
        let width = word_size.width();
        self.check_range(addr, width.into())?;
        for n in 0..width {
            let byte_n = (0xff & (value >> (8 * n))) as u8;
            write_byte(&mut self.data, addr + n, byte_n);
        }
        Ok(())
    }

    pub fn read_bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, MemoryError> {
        self.check_range(addr, len.into())?;
        Ok((0..len).map(|n| self.byte(addr + n)).collect())
    }

    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check_range(addr, bytes.len() as u64)?;
        for (n, byte) in (0..).zip(bytes) {
            write_byte(&mut self.data, addr + n, *byte);
        }
        Ok(())
    }
}
