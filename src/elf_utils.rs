use elf::abi::{EM_RISCV, SHF_ALLOC, SHT_NOBITS, STT_FUNC, STT_OBJECT};
use elf::endian::AnyEndian;
use elf::file::Class;
use elf::section::SectionHeader;
use elf::string_table::StringTable;
use elf::{ElfBytes, ParseError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::hart::memory::{Memory, MemoryError};

/// Bytes to be placed at addr before the guest starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub addr: u32,
    pub bytes: Vec<u8>,
}

/// A guest program ready to load: where to start, what goes where in
/// memory, and the names of addresses (for log output)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub entry: u32,
    pub chunks: Vec<Chunk>,
    pub symbols: BTreeMap<u32, String>,
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid ELF file: {0}")]
    Parse(#[from] ParseError),
    #[error("not a 32-bit ELF file")]
    WrongClass,
    #[error("ELF file is for machine {0}, not RISC-V")]
    WrongMachine(u16),
    #[error("section {0} is compressed")]
    Compressed(String),
    #[error("section {name} at 0x{addr:x} is outside the 32-bit address space")]
    AddressOutOfRange { name: String, addr: u64 },
    #[error("no _start symbol and no entry point")]
    NoEntry,
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl Image {
    /// Copy every chunk into memory
    pub fn write_to(&self, memory: &mut Memory) -> Result<(), MemoryError> {
        for chunk in &self.chunks {
            memory.write_bytes(chunk.addr, &chunk.bytes)?;
        }
        Ok(())
    }

    /// Name of the symbol at addr, if there is one
    pub fn symbol(&self, addr: u32) -> Option<&str> {
        self.symbols.get(&addr).map(String::as_str)
    }
}

/// Get the section header name for this section
fn section_name<'a>(header: &SectionHeader, strtab: &'a StringTable) -> &'a str {
    strtab.get(header.sh_name as usize).unwrap_or("<unnamed>")
}

/// Parse a RISC-V ELF32 executable held in memory
///
/// Every section that occupies memory while the program runs
/// (SHF_ALLOC) and has contents in the file becomes a chunk at its
/// load address. Sections without file contents (.bss) are left out,
/// because unwritten memory reads as zero anyway. The entry point is
/// the _start symbol, or the ELF header's entry if there is no
/// such symbol.
pub fn parse_elf(data: &[u8]) -> Result<Image, LoadError> {
    let file = ElfBytes::<AnyEndian>::minimal_parse(data)?;
    if file.ehdr.class != Class::ELF32 {
        return Err(LoadError::WrongClass);
    }
    if file.ehdr.e_machine != EM_RISCV {
        return Err(LoadError::WrongMachine(file.ehdr.e_machine));
    }

    let mut image = Image::default();
    if let (Some(section_headers), Some(strtab)) = file.section_headers_with_strtab()? {
        for header in section_headers.iter() {
            if header.sh_flags & u64::from(SHF_ALLOC) == 0 || header.sh_type == SHT_NOBITS {
                continue;
            }
            let name = section_name(&header, &strtab);
            let addr = u32::try_from(header.sh_addr).map_err(|_| LoadError::AddressOutOfRange {
                name: name.to_string(),
                addr: header.sh_addr,
            })?;
            let (bytes, compression) = file.section_data(&header)?;
            if compression.is_some() {
                return Err(LoadError::Compressed(name.to_string()));
            }
            debug!("section {name}: {} bytes at 0x{addr:08x}", bytes.len());
            image.chunks.push(Chunk {
                addr,
                bytes: bytes.to_vec(),
            });
        }
    }

    let mut start = None;
    if let Some((symtab, strtab)) = file.symbol_table()? {
        for entry in symtab.iter() {
            let symtype = entry.st_symtype();
            let Ok(name) = strtab.get(entry.st_name as usize) else {
                continue;
            };
            let Ok(value) = u32::try_from(entry.st_value) else {
                continue;
            };
            if name == "_start" {
                start = Some(value);
            }
            if !name.is_empty() && (symtype == STT_FUNC || symtype == STT_OBJECT) {
                image.symbols.insert(value, name.to_string());
            }
        }
    }

    image.entry = match start {
        Some(addr) => addr,
        None => match u32::try_from(file.ehdr.e_entry) {
            Ok(addr) if addr != 0 => addr,
            _ => return Err(LoadError::NoEntry),
        },
    };
    if let Some(addr) = start {
        image.symbols.entry(addr).or_insert_with(|| "_start".to_string());
    }
    info!(
        "loaded {} sections, entry 0x{:08x}",
        image.chunks.len(),
        image.entry
    );
    Ok(image)
}

/// Read an ELF file from disk and parse it with parse_elf
pub fn load_elf(path: &Path) -> Result<Image, LoadError> {
    let data = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_elf(&data)
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_garbage_is_rejected() {
        assert!(matches!(
            parse_elf(b"not an elf file at all, just some bytes"),
            Err(LoadError::Parse(_))
        ));
    }

    #[test]
    fn check_missing_file() {
        assert!(matches!(
            load_elf(Path::new("/nonexistent/guest.elf")),
            Err(LoadError::Io { .. })
        ));
    }

    #[test]
    fn check_image_write_to() {
        let image = Image {
            entry: 0,
            chunks: vec![
                Chunk {
                    addr: 0x10,
                    bytes: vec![1, 2, 3],
                },
                Chunk {
                    addr: 0xdead_beef,
                    bytes: vec![0x42],
                },
            ],
            symbols: BTreeMap::from([(0x10, "main".to_string())]),
        };
        let mut memory = Memory::default();
        image.write_to(&mut memory).unwrap();
        assert_eq!(memory.read_bytes(0x10, 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(memory.byte(0xdead_beef), 0x42);
        assert_eq!(image.symbol(0x10), Some("main"));
        assert_eq!(image.symbol(0x11), None);
    }
}
