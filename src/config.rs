//! Construction-time configuration surface for a [`crate::machine::Machine`].
//!
//! Every choice a host would otherwise scatter across ad hoc constructor
//! arguments or global statics is gathered here into one plain-data struct,
//! the in-core analogue of a firmware's persisted configuration (without
//! the persistence itself, which is explicitly a host concern).
use crate::video::BorderColor;

/// The family of ZX Spectrum (or clone) hardware being emulated.
///
/// This choice determines frame/line timing (see [`crate::clock`]),
/// default memory contention (see [`ContentionKind`]) and whether the
/// 128K paging port and AY sound chip are present at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MachineModel {
    /// The original 48K Spectrum (and 16K, which shares its timing).
    Spectrum48,
    /// The 128K Spectrum / +2 (grey), sharing memory and timing layout.
    Spectrum128,
    /// The +2A/+3, sharing the 128K memory layout but a different
    /// contention pattern and an extra ROM bank for the +3 disk ROM.
    SpectrumPlus3,
    /// The Russian 48K-compatible clone with no ULA contention at all.
    Pentagon,
    /// Brazilian TK90X/TK95 clones: 48K-compatible, PAL 50Hz timing.
    Tk9x50Hz,
    /// Brazilian TK90X/TK95 clones built for NTSC-derived 60Hz timing.
    Tk9x60Hz,
}

impl MachineModel {
    /// Whether this model has the 128K/+2/+3 memory paging port (0x7FFD)
    /// and an onboard AY-3-8912.
    pub fn has_128k_paging(self) -> bool {
        matches!(self, MachineModel::Spectrum128 | MachineModel::SpectrumPlus3)
    }

    /// Whether this model has an AY-3-8912 sound chip at all (the 48K and
    /// its clones do not, unless a peripheral adds one externally).
    pub fn has_ay(self) -> bool {
        self.has_128k_paging()
    }

    /// The natural [`ContentionKind`] for this model; independently
    /// overridable in [`MachineConfig`] for test fixtures that want to
    /// isolate contention behaviour from machine identity.
    pub fn default_contention(self) -> ContentionKind {
        match self {
            MachineModel::Spectrum48 => ContentionKind::Ula48,
            MachineModel::Spectrum128 => ContentionKind::Ula128,
            MachineModel::SpectrumPlus3 => ContentionKind::Plus3,
            MachineModel::Pentagon => ContentionKind::Pentagon,
            MachineModel::Tk9x50Hz | MachineModel::Tk9x60Hz => ContentionKind::Ula48,
        }
    }
}

impl Default for MachineModel {
    fn default() -> Self {
        MachineModel::Spectrum48
    }
}

/// Which per-t-state contention table the memory/port access path consults.
///
/// Replaces the original firmware's per-model function-pointer dispatch
/// (`fetchOpcode_std` vs `fetchOpcode_2A3`, and so on) with a closed enum
/// matched once per access; see `DESIGN.md` for the rationale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentionKind {
    /// 48K Spectrum: slot 1 (RAM 5) is contended.
    Ula48,
    /// 128K/+2: slot 1 (RAM 5) and slot 3 when it holds an odd RAM bank.
    Ula128,
    /// +2A/+3: same bit positions as 128K but a different per-t-state
    /// table and two contended accesses per M1 cycle.
    Plus3,
    /// Pentagon clones: no contention at all.
    Pentagon,
}

/// Issue 2 vs Issue 3 keyboard behaviour for the "tape load noise" bug on
/// port 0xFE reads (see `DESIGN.md` Open Questions carried from the spec).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyboardIssue {
    Issue2,
    Issue3,
}

impl Default for KeyboardIssue {
    fn default() -> Self {
        KeyboardIssue::Issue3
    }
}

/// Which joystick interface (if any) is wired to the Kempston-style port
/// decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoystickKind {
    None,
    Kempston,
}

impl Default for JoystickKind {
    fn default() -> Self {
        JoystickKind::Kempston
    }
}

/// Opt-in ROM trap acceleration for tape loading/saving (§4.1).
///
/// Both flags default to `false`: a freshly configured machine behaves
/// exactly like real hardware, with tape I/O driven entirely through the
/// EAR/MIC bits. Enabling either flag makes the CPU interpreter recognise
/// the corresponding 48K ROM routine entry point and short-circuit it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RomTrapConfig {
    /// Accelerate the LD-BYTES routine at ROM address 0x056B.
    pub load: bool,
    /// Accelerate the SA-BYTES routine at ROM address 0x04D4.
    pub save: bool,
}

/// Every construction-time choice for a [`crate::machine::Machine`].
#[derive(Clone, Copy, Debug)]
pub struct MachineConfig {
    pub model: MachineModel,
    pub contention: ContentionKind,
    pub keyboard_issue: KeyboardIssue,
    pub joystick: JoystickKind,
    pub rom_traps: RomTrapConfig,
    pub border: BorderColor,
}

impl MachineConfig {
    /// A configuration for `model` with every other field at its default.
    pub fn for_model(model: MachineModel) -> Self {
        MachineConfig {
            model,
            contention: model.default_contention(),
            ..Default::default()
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        let model = MachineModel::default();
        MachineConfig {
            model,
            contention: model.default_contention(),
            keyboard_issue: KeyboardIssue::default(),
            joystick: JoystickKind::default(),
            rom_traps: RomTrapConfig::default(),
            border: BorderColor::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_48k_issue3() {
        let cfg = MachineConfig::default();
        assert_eq!(cfg.model, MachineModel::Spectrum48);
        assert_eq!(cfg.contention, ContentionKind::Ula48);
        assert_eq!(cfg.keyboard_issue, KeyboardIssue::Issue3);
    }

    #[test]
    fn for_model_derives_matching_contention() {
        let cfg = MachineConfig::for_model(MachineModel::Pentagon);
        assert_eq!(cfg.contention, ContentionKind::Pentagon);
    }
}
