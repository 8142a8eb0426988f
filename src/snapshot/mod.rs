//! Snapshot loading: SNA and Z80 formats, dispatched by shape rather than
//! by file extension (§4.8).
//!
//! Both formats assume the memory layout (48K flat or 128K banked) already
//! matches the [`crate::machine::Machine`] they are loaded into: a snapshot
//! naming a machine family the target wasn't configured for is rejected with
//! [`crate::error::EmulatorError::SnapshotUnsupportedMachine`] rather than
//! silently reconfiguring the machine underneath the host, mirroring the
//! original firmware's `Config::requestMachine` only being invoked
//! explicitly by the menu, never implicitly by a snapshot load.
pub mod sna;
pub mod z80;

use crate::error::Result;
use crate::machine::Machine;

/// Loads `bytes` into `machine`, autodetecting SNA vs Z80 (§4.8): the three
/// exact SNA lengths are tried first since SNA carries no signature, with
/// anything else handed to the Z80 loader, which validates its own header.
pub(crate) fn load_auto(bytes: &[u8], machine: &mut Machine) -> Result<()> {
    match bytes.len() {
        sna::SNA_48K_LEN | sna::SNA_128K_LEN | sna::SNA_128K_LEN_DUP_PAGE => sna::load_sna(bytes, machine),
        _ => z80::load_z80(bytes, machine),
    }
}
