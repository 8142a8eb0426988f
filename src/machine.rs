//! The `Machine` aggregate: owns every component and drives them through
//! one video frame at a time via [`Machine::run_frame`] (§4.7).
//!
//! The cyclic CPU↔Memory↔Video↔Ports↔Tape dependency the original firmware
//! resolves with global statics and function pointers is broken here by a
//! short-lived `Bus` built fresh for each [`crate::cpu::Cpu::step`] call: it
//! borrows `Machine`'s component fields by reference and implements
//! [`crate::cpu::SystemBus`], so the CPU interpreter never needs to know
//! about `Machine` at all (see `DESIGN.md`).
use crate::ay::Ay3_8912;
use crate::clock::{audio_sample_rate, FTs, FrameTiming};
use crate::config::{MachineConfig, MachineModel};
use crate::cpu::{Cpu, SystemBus};
use crate::error::Result;
use crate::keyboard::ZXKeyboardMap;
use crate::memory::{Memory, Page};
use crate::ports::Ports;
use crate::tape::tap::TapFile;
use crate::tape::tzx::TzxFile;
use crate::tape::{TapeDeck, TapeSource};
use crate::video::Video;

/// Nominal CPU clock, used only to derive how many audio samples one frame
/// is worth; every model's tape/video timing is otherwise t-state based and
/// does not depend on wall-clock frequency at all.
const CPU_CLOCK_HZ: u64 = 3_500_000;

/// The assembled machine: CPU, memory, video, ports (with the AY chip and
/// joystick/keyboard state) and the tape deck, run in lockstep.
pub struct Machine {
    cpu: Cpu,
    memory: Memory,
    video: Video,
    ports: Ports,
    tape: TapeDeck<Box<dyn TapeSource>>,
    config: MachineConfig,
    timing: FrameTiming,
    tstate_in_frame: FTs,
    nmi_latched: bool,
    trdos_rom_index: Option<usize>,
    trdos_prev_rom: Option<usize>,
    audio_buffer: Vec<u8>,
    /// Raw blocks captured by the SAVE ROM trap (flag byte, data, checksum),
    /// drained by the host and framed into a `.tap` file as it sees fit.
    saved_blocks: Vec<Vec<u8>>,
}

impl Machine {
    /// Builds a machine for `config`. `rom_pages` are loaded in their
    /// natural order (48K: one page; 128K/+2: two; +2A/+3: four); `trdos_rom`
    /// is an optional fifth page wired to the TR-DOS paging trap (§4.1).
    pub fn new(config: MachineConfig, mut rom_pages: Vec<Page>, trdos_rom: Option<Page>) -> Result<Self> {
        let trdos_rom_index = trdos_rom.map(|page| {
            rom_pages.push(page);
            rom_pages.len() - 1
        });
        let memory = Memory::new(rom_pages, config.contention, config.model.has_128k_paging())?;
        let video = Video::new(config.model, config.contention);
        let ports = Ports::new(&config);
        let timing = FrameTiming::for_model(config.model);
        let samples_per_frame = samples_per_frame(config.model, timing);
        let mut tape = TapeDeck::new();
        tape.set_machine_is_48k(!config.model.has_128k_paging());

        let mut cpu = Cpu::new();
        cpu.reset(false);

        Ok(Machine {
            cpu,
            memory,
            video,
            ports,
            tape,
            config,
            timing,
            tstate_in_frame: 0,
            nmi_latched: false,
            trdos_rom_index,
            trdos_prev_rom: None,
            audio_buffer: vec![0u8; samples_per_frame],
            saved_blocks: Vec::new(),
        })
    }

    /// Power-on reset: wipes RAM, rewinds video/tape, resets the AY chip.
    pub fn hard_reset(&mut self) {
        self.cpu.reset(false);
        self.memory.hard_reset();
        self.video.reset();
        self.ports.reset();
        self.tape.stop();
        self.tstate_in_frame = 0;
        self.nmi_latched = false;
        self.trdos_prev_rom = None;
    }

    /// Pin (soft) reset: preserves RAM contents, as real hardware does.
    pub fn soft_reset(&mut self) {
        self.cpu.reset(true);
        self.memory.soft_reset();
        self.tstate_in_frame = 0;
        self.nmi_latched = false;
        self.trdos_prev_rom = None;
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }
    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }
    pub fn memory(&self) -> &Memory {
        &self.memory
    }
    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }
    pub fn video(&self) -> &Video {
        &self.video
    }
    pub fn ports(&self) -> &Ports {
        &self.ports
    }
    pub fn ay(&self) -> &Ay3_8912 {
        &self.ports.ay
    }
    pub(crate) fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }
    pub(crate) fn video_mut(&mut self) -> &mut Video {
        &mut self.video
    }
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }
    /// Repositions the in-frame t-state cursor; used by snapshot loaders
    /// that restore a Z80 v3 clock value, otherwise left at 0 (§4.8).
    pub(crate) fn set_tstate_in_frame(&mut self, t: FTs) {
        self.tstate_in_frame = t;
    }
    /// Pages the TR-DOS ROM into slot 0 directly, bypassing the trap's
    /// PC-range check, for snapshots that recorded it already paged in.
    /// No-op (returns `false`) if this machine has no TR-DOS ROM wired up.
    pub(crate) fn page_trdos_rom_in(&mut self) -> bool {
        match self.trdos_rom_index {
            Some(idx) => {
                self.trdos_prev_rom = Some(self.memory.rom_select());
                self.memory.select_rom(idx);
                true
            }
            None => false,
        }
    }
    pub fn framebuffer(&self) -> &[u32] {
        self.video.framebuffer()
    }
    pub fn audio_buffer(&self) -> &[u8] {
        &self.audio_buffer
    }

    pub fn set_key_state(&mut self, keys: ZXKeyboardMap) {
        self.ports.set_key_state(keys);
    }

    pub fn kempston_mut(&mut self) -> &mut crate::joystick::Kempston {
        self.ports.kempston_mut()
    }

    /// Latches the NMI line; serviced at the next instruction boundary and
    /// cleared automatically once taken (§4.1).
    pub fn request_nmi(&mut self) {
        self.nmi_latched = true;
    }

    pub fn mount_tap(&mut self, bytes: &[u8]) -> Result<()> {
        let tap = TapFile::parse(bytes)?;
        self.tape.mount(Box::new(tap));
        Ok(())
    }

    pub fn mount_tzx(&mut self, bytes: &[u8]) -> Result<()> {
        let tzx = TzxFile::parse(bytes)?;
        self.tape.mount(Box::new(tzx));
        Ok(())
    }

    pub fn eject_tape(&mut self) {
        self.tape.eject();
    }

    pub fn play_tape(&mut self) {
        self.tape.play();
    }

    pub fn stop_tape(&mut self) {
        self.tape.stop();
    }

    pub fn is_tape_playing(&self) -> bool {
        self.tape.is_playing()
    }

    /// Drains every block captured by the SAVE ROM trap since the last
    /// call; each entry is `[flag, data.., checksum]`, ready to be framed
    /// with a `.tap` length prefix by the host.
    pub fn take_saved_blocks(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.saved_blocks)
    }

    /// Loads a snapshot, autodetecting SNA vs Z80 (§4.8). On failure the
    /// machine's prior state is left untouched.
    pub fn load_snapshot_auto(&mut self, bytes: &[u8]) -> Result<()> {
        crate::snapshot::load_auto(bytes, self)
    }

    /// Runs exactly one video frame: steps the CPU until the frame's
    /// t-state budget is exhausted, flushes the remaining raster, then
    /// fills the audio buffer (§4.7).
    pub fn run_frame(&mut self) {
        self.video.start_frame();
        let frame_t_states = self.timing.frame_t_states;

        while self.tstate_in_frame < frame_t_states {
            if self.maybe_fire_tape_load_trap() || self.maybe_fire_tape_save_trap() {
                continue;
            }
            let elapsed = {
                let mut bus = Bus {
                    memory: &mut self.memory,
                    video: &mut self.video,
                    ports: &mut self.ports,
                    tape: &mut self.tape,
                    tstate: self.tstate_in_frame,
                    int_end_t: self.timing.int_end_t,
                    nmi_latched: &mut self.nmi_latched,
                    trdos_rom_index: self.trdos_rom_index,
                    trdos_prev_rom: &mut self.trdos_prev_rom,
                };
                self.cpu.step(&mut bus)
            };
            self.tstate_in_frame += elapsed;
        }

        self.video.flush(&self.memory);
        let t_states_per_sample = if self.audio_buffer.is_empty() {
            frame_t_states
        } else {
            (frame_t_states / self.audio_buffer.len() as FTs).max(1)
        };
        self.ports.ay.fill_samples(&mut self.audio_buffer, t_states_per_sample);
        self.tstate_in_frame -= frame_t_states;
    }

    /// The 48K ROM's LD-BYTES fast path (§4.1): fires only when tape-load
    /// acceleration is enabled, a tape is mounted and PC is exactly the
    /// trap entry point reached once the pilot tone and sync have already
    /// been detected by the (otherwise unmodified) ROM. On entry IX holds
    /// the destination address and DE the byte count, matching the real
    /// ROM's register convention at this point in LD-BYTES.
    fn maybe_fire_tape_load_trap(&mut self) -> bool {
        const LD_BYTES_TRAP: u16 = 0x056B;
        const LD_BYTES_EXIT: u16 = 0x05E2;
        if !self.config.rom_traps.load || self.cpu.pc != LD_BYTES_TRAP || !self.tape.is_mounted() {
            return false;
        }
        let start = self.cpu.ix;
        let max_len = self.cpu.de();
        let flag_byte = self.tape.peek_current_block().and_then(|b| b.data.first().copied()).unwrap_or(0);
        let memory = &mut self.memory;
        let outcome = self.tape.copy_current_block_into(|addr, byte| memory.poke8(addr, byte), start, max_len);
        match outcome {
            Ok(checksum_ok) => {
                self.cpu.set_de(0);
                self.cpu.h = flag_byte;
                self.cpu.set_carry(checksum_ok);
                self.cpu.pc = LD_BYTES_EXIT;
                log::debug!("tape load trap: checksum_ok={} at pc=0x{:04X}", checksum_ok, LD_BYTES_TRAP);
            }
            Err(err) => {
                log::warn!("tape load trap failed: {}", err);
                self.cpu.set_carry(false);
                self.cpu.pc = LD_BYTES_EXIT;
            }
        }
        true
    }

    /// The 48K ROM's SA-BYTES fast path (§4.1): captures the flag byte plus
    /// `DE` bytes from `IX` as one tape block instead of bit-banging MIC
    /// output, leaving the block for the host to frame into a `.tap` file.
    fn maybe_fire_tape_save_trap(&mut self) -> bool {
        const SA_BYTES_TRAP: u16 = 0x04D4;
        const SA_BYTES_EXIT: u16 = 0x0555;
        if !self.config.rom_traps.save || self.cpu.pc != SA_BYTES_TRAP {
            return false;
        }
        let start = self.cpu.ix;
        let len = self.cpu.de();
        let flag = self.cpu.a;
        let mut block = Vec::with_capacity(len as usize + 2);
        block.push(flag);
        for i in 0..len {
            block.push(self.memory.peek8(start.wrapping_add(i)));
        }
        let checksum = block.iter().fold(0u8, |acc, &b| acc ^ b);
        block.push(checksum);
        log::debug!("tape save trap: captured {} byte block", block.len());
        self.saved_blocks.push(block);
        self.cpu.set_de(0);
        self.cpu.set_carry(true);
        self.cpu.pc = SA_BYTES_EXIT;
        true
    }
}

/// How many audio samples one frame is worth, at the model's nominal
/// sample rate, derived from its t-state clock rather than wall time so it
/// stays exact regardless of host frame pacing.
fn samples_per_frame(model: MachineModel, timing: FrameTiming) -> usize {
    let rate = audio_sample_rate(model) as u64;
    ((rate * timing.frame_t_states as u64) / CPU_CLOCK_HZ) as usize
}

/// The short-lived bus a single [`Cpu::step`] borrows `Machine`'s fields
/// through. Never stored; constructed fresh each step so the CPU never has
/// to know `Machine` exists (§9 Design Notes).
struct Bus<'a> {
    memory: &'a mut Memory,
    video: &'a mut Video,
    ports: &'a mut Ports,
    tape: &'a mut TapeDeck<Box<dyn TapeSource>>,
    tstate: FTs,
    int_end_t: FTs,
    nmi_latched: &'a mut bool,
    trdos_rom_index: Option<usize>,
    trdos_prev_rom: &'a mut Option<usize>,
}

impl<'a> SystemBus for Bus<'a> {
    fn mem_contention(&self, addr: u16) -> FTs {
        if self.memory.is_contended(addr) {
            self.video.contention_delay(self.tstate)
        } else {
            0
        }
    }

    /// Approximates the "early/late" port contention rule of §4.2: a
    /// contended low byte with A0=0 draws once at the current t-state; with
    /// A0=1 it draws three times, one t-state apart. Exact per-edge
    /// behaviour additionally depends on the ULA pipeline phase, which this
    /// core does not model below scanline granularity (see `DESIGN.md`).
    fn io_contention(&self, port: u16) -> FTs {
        if !self.memory.is_contended(port) {
            return 0;
        }
        if port & 1 == 0 {
            self.video.contention_delay(self.tstate)
        } else {
            self.video.contention_delay(self.tstate)
                + self.video.contention_delay(self.tstate + 1)
                + self.video.contention_delay(self.tstate + 2)
        }
    }

    fn advance(&mut self, t_states: FTs) {
        self.tstate += t_states;
        self.video.draw(self.tstate, self.memory);
    }

    fn tstate(&self) -> FTs {
        self.tstate
    }

    fn mem_read(&mut self, addr: u16) -> u8 {
        self.memory.peek8(addr)
    }

    fn mem_write(&mut self, addr: u16, value: u8) {
        self.memory.poke8(addr, value);
    }

    fn opcode_read(&mut self, addr: u16) -> u8 {
        self.memory.fetch_opcode(addr)
    }

    fn port_read(&mut self, port: u16) -> u8 {
        let ear = self.tape.read_ear(self.tstate);
        self.ports.set_ear_in(ear);
        self.ports.read(port, self.tstate, self.video, self.memory)
    }

    fn port_write(&mut self, port: u16, value: u8) {
        self.ports.write(port, value, self.memory, self.video);
    }

    fn nmi_pending(&self) -> bool {
        *self.nmi_latched
    }

    fn clear_nmi(&mut self) {
        *self.nmi_latched = false;
    }

    fn int_line_active(&self) -> bool {
        self.tstate >= 0 && self.tstate < self.int_end_t
    }

    /// TR-DOS paging trap only; the tape load/save traps need direct CPU
    /// register access and are handled one level up, in
    /// `Machine::run_frame`, before a `Bus` is even constructed for that
    /// step (see `DESIGN.md`).
    fn rom_trap(&mut self, pc: u16) -> bool {
        if let Some(trdos_idx) = self.trdos_rom_index {
            if pc & 0xFF00 == 0x3D00 && self.memory.rom_select() != trdos_idx {
                *self.trdos_prev_rom = Some(self.memory.rom_select());
                self.memory.select_rom(trdos_idx);
                log::debug!("TR-DOS trap: paging in ROM {} at pc=0x{:04X}", trdos_idx, pc);
            } else if pc >= 0x4000 {
                if let Some(prev) = self.trdos_prev_rom.take() {
                    self.memory.select_rom(prev);
                    log::debug!("TR-DOS trap: restoring ROM {} at pc=0x{:04X}", prev, pc);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::memory::PAGE_SIZE;

    fn rom_with(bytes: &[(u16, u8)]) -> Page {
        let mut rom = Box::new([0u8; PAGE_SIZE]);
        for &(addr, value) in bytes {
            rom[addr as usize] = value;
        }
        rom
    }

    #[test]
    fn halt_opcode_leaves_cpu_halted_after_a_frame() {
        let config = MachineConfig::for_model(MachineModel::Spectrum48);
        let rom = rom_with(&[(0x0000, 0x76)]); // HALT
        let mut machine = Machine::new(config, vec![rom], None).unwrap();
        machine.run_frame();
        assert!(machine.cpu().halted);
    }

    #[test]
    fn int_line_is_only_active_at_the_start_of_the_frame() {
        let config = MachineConfig::for_model(MachineModel::Spectrum48);
        let rom = rom_with(&[(0x0000, 0x00)]); // NOP forever
        let machine = Machine::new(config, vec![rom], None).unwrap();
        let timing = machine.timing;
        assert!(timing.int_end_t > 0 && timing.int_end_t < timing.frame_t_states);
    }

    #[test]
    fn border_write_updates_video_within_a_frame() {
        let config = MachineConfig::for_model(MachineModel::Spectrum48);
        // OUT (0xFE),A with A=7, then loop: 3E 07 / D3 FE / 18 FE
        let rom = rom_with(&[(0, 0x3E), (1, 0x07), (2, 0xD3), (3, 0xFE), (4, 0x18), (5, 0xFE)]);
        let mut machine = Machine::new(config, vec![rom], None).unwrap();
        machine.run_frame();
        assert_eq!(machine.video().border(), crate::video::BorderColor::new(7));
    }

    #[test]
    fn tape_mount_and_play_round_trips_through_ear_read() {
        let config = MachineConfig::for_model(MachineModel::Spectrum48);
        let rom = rom_with(&[]);
        let mut machine = Machine::new(config, vec![rom], None).unwrap();
        let header = {
            let payload = vec![0x00u8, 0x03, b'H', b'I', b' ', b' ', b' ', b' ', b' ', b' ', b' ', 0x04, 0x00, 0x00, 0x80, 0x00];
            let checksum = payload.iter().fold(0u8, |acc, &b| acc ^ b);
            let mut full = payload;
            full.push(checksum);
            let mut bytes = (full.len() as u16).to_le_bytes().to_vec();
            bytes.extend_from_slice(&full);
            bytes
        };
        machine.mount_tap(&header).unwrap();
        assert!(!machine.is_tape_playing());
        machine.play_tape();
        assert!(machine.is_tape_playing());
    }
}
