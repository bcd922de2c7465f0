//! Guest console
//!
//! The console is the only device the guest can talk to, through the
//! read and write syscalls. Input that was read from the host but not
//! yet asked for by the guest waits in a queue for the next read.

use crate::config::InputMode;
use queues::{IsQueue, Queue};
use std::io::{self, BufRead, BufReader, Write};
use tracing::warn;

/// Largest refill taken from the input stream in raw mode
const RAW_CHUNK: usize = 4096;

/// Where console output goes
pub enum Sink {
    Host(Box<dyn Write>),
    /// Kept in memory, for tests and embedding
    Captured(Vec<u8>),
}

pub struct Console {
    input: Box<dyn BufRead>,
    output: Sink,
    mode: InputMode,
    pending: Queue<u8>,
    end_of_input: bool,
}

impl Console {
    pub fn new(input: Box<dyn BufRead>, output: Sink, mode: InputMode) -> Self {
        Self {
            input,
            output,
            mode,
            pending: Queue::new(),
            end_of_input: false,
        }
    }

    /// The host's standard input and output
    pub fn host(mode: InputMode) -> Self {
        Self::new(
            Box::new(BufReader::new(io::stdin())),
            Sink::Host(Box::new(io::stdout())),
            mode,
        )
    }

    /// Fixed input, with output captured in memory
    pub fn captured(input: &[u8], mode: InputMode) -> Self {
        Self::new(
            Box::new(io::Cursor::new(input.to_vec())),
            Sink::Captured(Vec::new()),
            mode,
        )
    }

    /// Everything written so far, if output is captured
    pub fn output(&self) -> &[u8] {
        match &self.output {
            Sink::Captured(bytes) => bytes,
            Sink::Host(_) => &[],
        }
    }

    /// Write bytes to the output, returning how many were written
    /// (zero if the host stream failed)
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        match &mut self.output {
            Sink::Captured(captured) => {
                captured.extend_from_slice(bytes);
                bytes.len()
            }
            Sink::Host(stream) => match stream.write_all(bytes).and_then(|_| stream.flush()) {
                Ok(()) => bytes.len(),
                Err(e) => {
                    warn!("console write failed: {e}");
                    0
                }
            },
        }
    }

    /// Take one line (or one raw chunk) from the input stream into
    /// the pending queue
    fn refill(&mut self) {
        let mut buf = Vec::new();
        let result = match self.mode {
            InputMode::Line => self.input.read_until(b'\n', &mut buf),
            InputMode::Raw => self.input.fill_buf().map(|available| {
                let n = available.len().min(RAW_CHUNK);
                buf.extend_from_slice(&available[..n]);
                n
            }),
        };
        match result {
            Ok(0) => self.end_of_input = true,
            Ok(n) => {
                if self.mode == InputMode::Raw {
                    self.input.consume(n);
                }
                for byte in buf {
                    if let Err(e) = self.pending.add(byte) {
                        warn!("console input dropped: {e}");
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("console read failed: {e}");
                self.end_of_input = true;
            }
        }
    }

    /// Read at most max bytes. Blocks for more input only when
    /// nothing is pending; returns no bytes at the end of input.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        if max == 0 {
            return Vec::new();
        }
        if self.pending.size() == 0 && !self.end_of_input {
            self.refill();
        }
        let mut bytes = Vec::new();
        while bytes.len() < max {
            match self.pending.remove() {
                Ok(byte) => bytes.push(byte),
                Err(_) => break,
            }
        }
        bytes
    }

    /// Bytes read from the host but not yet returned to the guest
    pub fn pending(&self) -> usize {
        self.pending.size()
    }
}
