//! I/O port dispatch: the single `in`/`out` decode table tying the ULA,
//! AY-3-8912, Kempston joystick and 128K paging latch together (§4.6).
//!
//! Decoding follows real hardware's partial address decode: peripherals
//! only look at a handful of bits of the 16-bit port address, so several
//! distinct addresses alias the same device. `Ports` receives the full
//! address on every access and applies each device's actual decode mask
//! rather than a single canonical address, matching the ZX Spectrum's
//! well-known "any even port reads the ULA" behaviour.
use crate::ay::Ay3_8912;
use crate::clock::FTs;
use crate::config::{JoystickKind, KeyboardIssue, MachineConfig};
use crate::joystick::{JoystickInterface, Kempston};
use crate::keyboard::ZXKeyboardMap;
use crate::memory::Memory;
use crate::video::{BorderColor, Video};
use std::convert::TryFrom;

/// The floating unused bits 5 and 7 read back from port 0xFE; issue 3
/// keyboards read them low, issue 2 forces them high (§4.6, Open Question
/// resolved in `DESIGN.md`). Bit 6 is EAR-in and is never touched here.
fn unused_bits_for(issue: KeyboardIssue) -> u8 {
    match issue {
        KeyboardIssue::Issue2 => 0xA0,
        KeyboardIssue::Issue3 => 0x00,
    }
}

/// The shared I/O bus: owns the AY chip and Kempston state directly, and
/// borrows `Video`/`Memory` only for the duration of a single port access
/// (passed in by the caller, normally [`crate::machine::Bus`]).
pub struct Ports {
    keys: ZXKeyboardMap,
    kempston: Kempston,
    joystick_kind: JoystickKind,
    pub ay: Ay3_8912,
    ay_enabled: bool,
    keyboard_issue: KeyboardIssue,
    ear_in: bool,
    mic_out: bool,
    beeper_out: bool,
}

impl Ports {
    pub fn new(config: &MachineConfig) -> Self {
        Ports {
            keys: ZXKeyboardMap::default(),
            kempston: Kempston::new(),
            joystick_kind: config.joystick,
            ay: Ay3_8912::new(),
            ay_enabled: config.model.has_ay(),
            keyboard_issue: config.keyboard_issue,
            ear_in: false,
            mic_out: false,
            beeper_out: false,
        }
    }

    pub fn reset(&mut self) {
        self.ay.reset();
        self.beeper_out = false;
        self.mic_out = false;
    }

    pub fn set_key_state(&mut self, keys: ZXKeyboardMap) {
        self.keys = keys;
    }

    pub fn key_state(&self) -> ZXKeyboardMap {
        self.keys
    }

    pub fn kempston_mut(&mut self) -> &mut Kempston {
        &mut self.kempston
    }

    /// Drives the tape EAR-in line ahead of a read, set once per sample by
    /// the tape player (§4.6/§4.4 boundary).
    pub fn set_ear_in(&mut self, level: bool) {
        self.ear_in = level;
    }

    pub fn beeper_out(&self) -> bool {
        self.beeper_out
    }

    pub fn mic_out(&self) -> bool {
        self.mic_out
    }

    /// Performs an `IN A,(port)`-style read. `video`/`mem` are consulted
    /// for the floating-bus fallback when no device claims the address.
    pub fn read(&mut self, port: u16, t_state: FTs, video: &Video, mem: &Memory) -> u8 {
        if port & 0x0001 == 0 {
            // Even port: ULA. Keyboard rows from the high byte, EAR-in on
            // bit 6, unused bits 5 read per keyboard issue.
            let line = (port >> 8) as u8;
            let mut value = self.keys.read_keyboard(line);
            value &= !0x40;
            if self.ear_in {
                value |= 0x40;
            }
            value |= unused_bits_for(self.keyboard_issue);
            return value;
        }
        if self.joystick_kind == JoystickKind::Kempston && port & 0x00FF == 0x001F {
            return self.kempston.port_value();
        }
        if self.ay_enabled && port & 0xC002 == 0xC000 {
            return self.ay.read_data();
        }
        video.floating_bus_byte(t_state, mem)
    }

    /// Performs an `OUT (port),A`-style write.
    pub fn write(&mut self, port: u16, value: u8, mem: &mut Memory, video: &mut Video) {
        if port & 0x0001 == 0 {
            self.beeper_out = value & 0x10 != 0;
            self.mic_out = value & 0x08 != 0;
            if let Ok(border) = BorderColor::try_from(value & 0x07) {
                video.set_border(border);
            }
            return;
        }
        if self.ay_enabled {
            if port & 0xC002 == 0xC000 {
                self.ay.select_register(value);
                return;
            }
            if port & 0xC002 == 0x8000 {
                self.ay.write_data(value);
                return;
            }
        }
        // 128K paging port: real hardware decodes only bit 15 clear and
        // bit 1 clear, but several clone machines are sloppy about the
        // rest, so `Memory` itself no-ops when paging is unavailable.
        if port & 0x8002 == 0x0000 {
            mem.write_paging_port(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineModel;

    fn ports_for(model: MachineModel) -> (Ports, Memory, Video) {
        let config = MachineConfig::for_model(model);
        let ports = Ports::new(&config);
        let rom = vec![Box::new([0u8; crate::memory::PAGE_SIZE])];
        let mem = Memory::new(rom, config.contention, model.has_128k_paging()).unwrap();
        let video = Video::new(model, config.contention);
        (ports, mem, video)
    }

    #[test]
    fn ula_read_reflects_pressed_key() {
        let (mut ports, mem, video) = ports_for(MachineModel::Spectrum48);
        ports.set_key_state(ZXKeyboardMap::CS);
        let before = ports.read(0xFEFE, 0, &video, &mem);
        ports.set_key_state(ZXKeyboardMap::empty());
        let after = ports.read(0xFEFE, 0, &video, &mem);
        assert_ne!(before, after);
    }

    #[test]
    fn ula_write_sets_border_and_beeper() {
        let (mut ports, mut mem, mut video) = ports_for(MachineModel::Spectrum48);
        ports.write(0x00FE, 0b0001_0011, &mut mem, &mut video);
        assert_eq!(video.border(), BorderColor::new(3));
        assert!(ports.beeper_out());
    }

    #[test]
    fn kempston_port_is_independent_of_ula() {
        let (mut ports, mem, video) = ports_for(MachineModel::Spectrum48);
        ports.kempston_mut().set_directions(crate::joystick::Directions::UP);
        assert_eq!(ports.read(0x001F, 0, &video, &mem), 0b0000_1000);
    }

    #[test]
    fn ay_register_round_trips_on_128k() {
        let (mut ports, mem, video) = ports_for(MachineModel::Spectrum128);
        ports.ay.select_register(7);
        ports.ay.write_data(0x3F);
        assert_eq!(ports.read(0xFFFD, 0, &video, &mem), 0x3F);
    }

    #[test]
    fn paging_port_is_ignored_on_48k() {
        let (_ports, mut mem, _video) = ports_for(MachineModel::Spectrum48);
        mem.write_paging_port(0x07);
        assert_eq!(mem.ram_bank_slot3(), 0);
    }

    #[test]
    fn issue_2_forces_bits_5_and_7_without_touching_ear_in() {
        let mut config = MachineConfig::for_model(MachineModel::Spectrum48);
        config.keyboard_issue = KeyboardIssue::Issue2;
        let mut ports = Ports::new(&config);
        let rom = vec![Box::new([0u8; crate::memory::PAGE_SIZE])];
        let mem = Memory::new(rom, config.contention, false).unwrap();
        let video = Video::new(MachineModel::Spectrum48, config.contention);

        ports.set_ear_in(false);
        let value = ports.read(0xFEFE, 0, &video, &mem);
        assert_eq!(value & 0xA0, 0xA0, "bits 5 and 7 are forced high on issue 2");
        assert_eq!(value & 0x40, 0, "EAR-in bit is untouched by the issue-2 override");

        ports.set_ear_in(true);
        let value = ports.read(0xFEFE, 0, &video, &mem);
        assert_eq!(value & 0x40, 0x40, "EAR-in still reads through with issue 2 set");
    }
}
