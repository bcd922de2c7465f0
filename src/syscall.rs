//! Syscall dispatcher
//!
//! On ecall the syscall number is in a7 and the arguments in a0 and
//! a1. The result goes back in a0.

use crate::console::Console;
use crate::hart::memory::MemoryError;
use crate::hart::registers::abi::{A0, A1, A7};
use crate::hart::Hart;
use crate::utils::{interpret_i32_as_unsigned, interpret_u32_as_signed};
use thiserror::Error;
use tracing::info;

/// At most this many bytes move in one read or write
pub const MAX_READWRITE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit,
    Write,
    Read,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyscallError {
    #[error("unknown syscall {0}")]
    UnknownSyscall(i32),
    #[error("syscall buffer: {0}")]
    BadAddress(#[from] MemoryError),
}

/// What the run loop does after a syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Resume,
    Exit(i32),
}

impl Syscall {
    pub fn from_number(number: i32) -> Result<Self, SyscallError> {
        match number {
            -1 => Ok(Self::Exit),
            -2 => Ok(Self::Write),
            -3 => Ok(Self::Read),
            n => Err(SyscallError::UnknownSyscall(n)),
        }
    }
}

/// Check the guest buffer at a0 of the size in a1 (negative sizes
/// count as zero), and return how many bytes of it one call moves.
/// The whole buffer must be in memory even though at most
/// MAX_READWRITE bytes of it are used.
fn buffer_size(hart: &Hart) -> Result<u32, SyscallError> {
    let size = interpret_u32_as_signed(hart.x(A1)).max(0) as u32;
    hart.memory.check_range(hart.x(A0), size.into())?;
    Ok(size.min(MAX_READWRITE))
}

/// Service the syscall the guest has just made with ecall
pub fn dispatch(hart: &mut Hart, console: &mut Console) -> Result<Action, SyscallError> {
    let number = interpret_u32_as_signed(hart.x(A7));
    match Syscall::from_number(number)? {
        Syscall::Exit => {
            let status = interpret_u32_as_signed(hart.x(A0));
            info!("guest exited with status {status}");
            Ok(Action::Exit(status))
        }
        Syscall::Write => {
            let size = buffer_size(hart)?;
            let bytes = hart.read_guest_bytes(hart.x(A0), size)?;
            let written = console.write(&bytes);
            hart.set_x(A0, written as u32);
            Ok(Action::Resume)
        }
        Syscall::Read => {
            let addr = hart.x(A0);
            // The buffer is checked before taking any input, so that
            // a bad buffer loses nothing
            let size = buffer_size(hart)?;
            let bytes = console.read(size as usize);
            hart.write_guest_bytes(addr, &bytes)?;
            hart.set_x(A0, interpret_i32_as_unsigned(bytes.len() as i32));
            Ok(Action::Resume)
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::config::{InputMode, MachineConfig};

    fn setup(a7: i32, a0: u32, a1: u32) -> Hart {
        let mut hart = Hart::new(&MachineConfig::default()).unwrap();
        hart.set_x(A7, interpret_i32_as_unsigned(a7));
        hart.set_x(A0, a0);
        hart.set_x(A1, a1);
        hart
    }

    #[test]
    fn check_syscall_numbers() {
        assert_eq!(Syscall::from_number(-1), Ok(Syscall::Exit));
        assert_eq!(Syscall::from_number(-2), Ok(Syscall::Write));
        assert_eq!(Syscall::from_number(-3), Ok(Syscall::Read));
        assert_eq!(
            Syscall::from_number(93),
            Err(SyscallError::UnknownSyscall(93))
        );
    }

    #[test]
    fn check_exit_status_is_signed() {
        let mut hart = setup(-1, 0xffff_fffe, 0);
        let mut console = Console::captured(b"", InputMode::Line);
        assert_eq!(dispatch(&mut hart, &mut console), Ok(Action::Exit(-2)));
    }

    #[test]
    fn check_write() {
        let mut hart = setup(-2, 0x4000, 5);
        hart.memory.write_bytes(0x4000, b"Hello World").unwrap();
        let mut console = Console::captured(b"", InputMode::Line);
        assert_eq!(dispatch(&mut hart, &mut console), Ok(Action::Resume));
        assert_eq!(console.output(), b"Hello");
        assert_eq!(hart.x(A0), 5);
    }

    #[test]
    fn check_read_into_guest_memory() {
        let mut hart = setup(-3, 0x4000, 2);
        let mut console = Console::captured(b"abc\n", InputMode::Line);
        dispatch(&mut hart, &mut console).unwrap();
        assert_eq!(hart.x(A0), 2);
        assert_eq!(hart.memory.read_bytes(0x4000, 2).unwrap(), b"ab");
        assert!(hart.cache.is_present(0x4000));

        // The rest of the line is returned by the next read
        hart.set_x(A0, 0x5000);
        hart.set_x(A1, 32);
        dispatch(&mut hart, &mut console).unwrap();
        assert_eq!(hart.x(A0), 2);
        assert_eq!(hart.memory.read_bytes(0x5000, 2).unwrap(), b"c\n");
    }

    #[test]
    fn check_bad_buffer() {
        let mut config = MachineConfig::default();
        config.mem_size = 0x1000;
        let mut hart = Hart::new(&config).unwrap();
        hart.set_x(A7, interpret_i32_as_unsigned(-2));
        hart.set_x(A0, 0xff0);
        hart.set_x(A1, 0x20);
        let mut console = Console::captured(b"", InputMode::Line);
        assert!(matches!(
            dispatch(&mut hart, &mut console),
            Err(SyscallError::BadAddress(_))
        ));
        hart.set_x(A7, interpret_i32_as_unsigned(-3));
        assert!(matches!(
            dispatch(&mut hart, &mut console),
            Err(SyscallError::BadAddress(_))
        ));
    }

    #[test]
    fn check_large_buffers() {
        let mut config = MachineConfig::default();
        config.mem_size = 0x10000;
        let mut hart = Hart::new(&config).unwrap();
        let mut console = Console::captured(b"", InputMode::Line);

        // Only the first 4096 bytes are written
        hart.set_x(A7, interpret_i32_as_unsigned(-2));
        hart.set_x(A0, 0x1000);
        hart.set_x(A1, 0x2000);
        dispatch(&mut hart, &mut console).unwrap();
        assert_eq!(hart.x(A0), MAX_READWRITE);
        assert_eq!(console.output().len(), MAX_READWRITE as usize);

        // But the buffer as given must be valid, even past 4096
        for a7 in [-2, -3] {
            hart.set_x(A7, interpret_i32_as_unsigned(a7));
            hart.set_x(A0, 0xf000);
            hart.set_x(A1, 0x2000);
            assert!(matches!(
                dispatch(&mut hart, &mut console),
                Err(SyscallError::BadAddress(_))
            ));
        }

        // Negative sizes move nothing
        hart.set_x(A7, interpret_i32_as_unsigned(-2));
        hart.set_x(A0, 0x1000);
        hart.set_x(A1, 0xffff_ffff);
        dispatch(&mut hart, &mut console).unwrap();
        assert_eq!(hart.x(A0), 0);
    }

    #[test]
    fn check_unknown_syscall_is_an_error() {
        let mut hart = setup(-4, 0, 0);
        let mut console = Console::captured(b"", InputMode::Line);
        assert_eq!(
            dispatch(&mut hart, &mut console),
            Err(SyscallError::UnknownSyscall(-4))
        );
    }
}
