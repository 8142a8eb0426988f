//! A cycle-accurate core for emulating the Sinclair ZX Spectrum family of
//! 8-bit home computers: 48K, 128K, +2, +2A/+3, Pentagon and the TK90X/TK95
//! clones.
//!
//! The crate is organised around a single [`machine::Machine`] aggregate that
//! owns the CPU, memory, video, I/O ports, AY sound chip and tape deck, and
//! drives them in lockstep one video frame at a time via
//! [`machine::Machine::run_frame`]. Everything outside that loop — menu UI,
//! file browsers, the physical video/audio signal generators, keyboard
//! scanning hardware — is a host concern and lives outside this crate.
#![allow(dead_code)]

#[macro_use]
extern crate bitflags;

pub mod ay;
pub mod clock;
pub mod config;
pub mod cpu;
pub mod error;
pub mod joystick;
pub mod keyboard;
pub mod machine;
pub mod memory;
pub mod ports;
pub mod snapshot;
pub mod tape;
pub mod video;

pub use config::{ContentionKind, JoystickKind, KeyboardIssue, MachineConfig, MachineModel, RomTrapConfig};
pub use error::{EmulatorError, Result};
pub use machine::Machine;
