//! The typed error hierarchy returned by every fallible core operation.
//!
//! The Z80 interpreter itself is infallible: any byte sequence is a legal
//! instruction stream, so [`crate::cpu::Cpu::step`] never returns a
//! `Result`. Loading untrusted data (snapshots, tape images) is where things
//! can go wrong, and those failures are always recovered locally and
//! surfaced here rather than causing the emulator to abort or panic.
use std::fmt;
use std::io;

/// Convenience alias used throughout the crate's fallible public API.
pub type Result<T> = std::result::Result<T, EmulatorError>;

/// All recoverable error conditions the core can encounter.
#[derive(Debug)]
pub enum EmulatorError {
    /// A snapshot's structure (size, section headers) did not match any
    /// supported version of its format.
    SnapshotMalformed(String),
    /// A snapshot was structurally valid but named a machine variant this
    /// core does not implement.
    SnapshotUnsupportedMachine(String),
    /// A TAP/TZX stream violated the block framing rules for its format.
    TapeMalformed(String),
    /// A TZX block ID is syntactically valid but not one this core knows
    /// how to play back.
    TapeUnsupportedBlock(u8),
    /// Propagated from an underlying `Read`/`Write`/`Seek` failure.
    Io(io::Error),
    /// A memory allocation for ROM/RAM pages could not be satisfied.
    OutOfMemory,
}

impl fmt::Display for EmulatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulatorError::SnapshotMalformed(msg) => write!(f, "malformed snapshot: {}", msg),
            EmulatorError::SnapshotUnsupportedMachine(msg) => {
                write!(f, "unsupported machine in snapshot: {}", msg)
            }
            EmulatorError::TapeMalformed(msg) => write!(f, "malformed tape image: {}", msg),
            EmulatorError::TapeUnsupportedBlock(id) => {
                write!(f, "unsupported TZX block id: 0x{:02X}", id)
            }
            EmulatorError::Io(err) => write!(f, "I/O error: {}", err),
            EmulatorError::OutOfMemory => write!(f, "out of memory while allocating ROM/RAM pages"),
        }
    }
}

impl std::error::Error for EmulatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmulatorError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for EmulatorError {
    fn from(err: io::Error) -> Self {
        EmulatorError::Io(err)
    }
}

impl From<EmulatorError> for io::Error {
    fn from(err: EmulatorError) -> Self {
        match err {
            EmulatorError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
