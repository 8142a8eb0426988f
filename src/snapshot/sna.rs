//! The **SNA** format: a header-less register dump followed by a flat RAM
//! image, 48K or 128K-extended (§4.8/§6).
//!
//! | offset | size  | description                              |
//! |--------|-------|------------------------------------------|
//! |      0 |     1 | register: I                              |
//! |      1 |     6 | registers: HL', DE', BC'                 |
//! |      7 |     2 | register: AF'                            |
//! |      9 |     6 | registers: HL, DE, BC                    |
//! |     15 |     4 | registers: IY, IX                         |
//! |     19 |     1 | interrupt flags (bit 2 = IFF1 = IFF2)    |
//! |     20 |     1 | register: R                              |
//! |     21 |     2 | register: AF                              |
//! |     23 |     2 | register: SP                              |
//! |     25 |     1 | interrupt mode: 0/1/2                     |
//! |     26 |     1 | border colour: 0..=7                      |
//! |     27 | 49152 | bytes: RAM 16384..=65535                  |
//!
//! A 128K extension appends PC, the last `0x7FFD` write and a TR-DOS-paged
//! flag after the 48K-layout's three header RAM pages (bank 5, bank 2, and
//! whichever bank was paged into slot 3), followed by the remaining banks
//! in ascending order.
use crate::error::{EmulatorError, Result};
use crate::machine::Machine;
use crate::memory::PAGE_SIZE;
use crate::video::BorderColor;

const HEADER_LEN: usize = 27;
/// Total length of a bare 48K **SNA** file.
pub const SNA_48K_LEN: usize = HEADER_LEN + 3 * PAGE_SIZE;
/// Total length of a 128K **SNA** when the slot-3 page is not bank 5 or 2.
pub const SNA_128K_LEN: usize = SNA_48K_LEN + 4 + 5 * PAGE_SIZE;
/// Total length of a 128K **SNA** when the slot-3 page duplicates bank 5 or
/// 2, so it is stored twice (once in the header, once in the tail).
pub const SNA_128K_LEN_DUP_PAGE: usize = SNA_128K_LEN + PAGE_SIZE;

struct Header {
    i: u8,
    hl_alt: u16,
    de_alt: u16,
    bc_alt: u16,
    af_alt: u16,
    hl: u16,
    de: u16,
    bc: u16,
    iy: u16,
    ix: u16,
    iffs: u8,
    r: u8,
    af: u16,
    sp: u16,
    im: u8,
    border: u8,
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn parse_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_LEN {
        return Err(EmulatorError::SnapshotMalformed("SNA header truncated".into()));
    }
    Ok(Header {
        i: bytes[0],
        hl_alt: read_u16(bytes, 1),
        de_alt: read_u16(bytes, 3),
        bc_alt: read_u16(bytes, 5),
        af_alt: read_u16(bytes, 7),
        hl: read_u16(bytes, 9),
        de: read_u16(bytes, 11),
        bc: read_u16(bytes, 13),
        iy: read_u16(bytes, 15),
        ix: read_u16(bytes, 17),
        iffs: bytes[19],
        r: bytes[20],
        af: read_u16(bytes, 21),
        sp: read_u16(bytes, 23),
        im: bytes[25],
        border: bytes[26],
    })
}

fn apply_header(machine: &mut Machine, header: &Header) -> Result<()> {
    machine.hard_reset();
    let im = match header.im {
        0 => crate::cpu::InterruptMode::Im0,
        1 => crate::cpu::InterruptMode::Im1,
        2 => crate::cpu::InterruptMode::Im2,
        other => return Err(EmulatorError::SnapshotMalformed(format!("invalid interrupt mode {}", other))),
    };
    let border = BorderColor::new(header.border);
    let cpu = machine.cpu_mut();
    cpu.i = header.i;
    let [l_, h_] = header.hl_alt.to_le_bytes();
    cpu.h_ = h_;
    cpu.l_ = l_;
    let [e_, d_] = header.de_alt.to_le_bytes();
    cpu.d_ = d_;
    cpu.e_ = e_;
    let [c_, b_] = header.bc_alt.to_le_bytes();
    cpu.b_ = b_;
    cpu.c_ = c_;
    let [f_, a_] = header.af_alt.to_le_bytes();
    cpu.a_ = a_;
    cpu.f_ = f_;
    cpu.set_hl(header.hl);
    cpu.set_de(header.de);
    cpu.set_bc(header.bc);
    cpu.iy = header.iy;
    cpu.ix = header.ix;
    let iff = header.iffs & 0x04 != 0;
    cpu.iff1 = iff;
    cpu.iff2 = iff;
    cpu.set_r(header.r);
    cpu.set_af(header.af);
    cpu.sp = header.sp;
    cpu.im = im;
    machine.video_mut().set_border(border);
    Ok(())
}

/// Loads a 48K or 128K **SNA** image into `machine`, autodetecting the
/// extension by length. `machine` must already be configured for the
/// matching family (128K images require [`crate::config::MachineModel::has_128k_paging`]).
pub fn load_sna(bytes: &[u8], machine: &mut Machine) -> Result<()> {
    load_sna_inner(bytes, machine).map_err(|e| {
        log::error!("SNA snapshot load failed: {}", e);
        e
    })
}

fn load_sna_inner(bytes: &[u8], machine: &mut Machine) -> Result<()> {
    let header = parse_header(bytes)?;
    match bytes.len() {
        SNA_48K_LEN => load_sna48(bytes, machine, &header),
        SNA_128K_LEN | SNA_128K_LEN_DUP_PAGE => load_sna128(bytes, machine, &header),
        other => Err(EmulatorError::SnapshotMalformed(format!("unexpected SNA length {}", other))),
    }
}

fn load_sna48(bytes: &[u8], machine: &mut Machine, header: &Header) -> Result<()> {
    apply_header(machine, header)?;
    let ram = &bytes[HEADER_LEN..HEADER_LEN + 3 * PAGE_SIZE];
    machine.memory_mut().load_into_mem(0x4000, ram);
    let sp = header.sp;
    if sp < 0x4000 || sp == 0xFFFF {
        return Err(EmulatorError::SnapshotMalformed("SNA: SP does not point into RAM, cannot pop PC".into()));
    }
    let pc = machine.memory().peek16(sp);
    machine.cpu_mut().pc = pc;
    machine.cpu_mut().sp = sp.wrapping_add(2);
    Ok(())
}

fn load_sna128(bytes: &[u8], machine: &mut Machine, header: &Header) -> Result<()> {
    if !machine.config().model.has_128k_paging() {
        return Err(EmulatorError::SnapshotUnsupportedMachine(
            "128K SNA loaded into a machine without 128K paging".into(),
        ));
    }
    apply_header(machine, header)?;

    let mut pos = HEADER_LEN;
    let bank5 = &bytes[pos..pos + PAGE_SIZE];
    pos += PAGE_SIZE;
    let bank2 = &bytes[pos..pos + PAGE_SIZE];
    pos += PAGE_SIZE;
    let slot3_page = &bytes[pos..pos + PAGE_SIZE];
    pos += PAGE_SIZE;

    if bytes.len() < pos + 4 {
        return Err(EmulatorError::SnapshotMalformed("SNA: truncated 128K extension".into()));
    }
    let pc = read_u16(bytes, pos);
    let port_data = bytes[pos + 2];
    let trdos_rom = bytes[pos + 3];
    pos += 4;

    let current_page = (port_data & 0x07) as u8;
    machine.memory_mut().ram_bank_mut(5).copy_from_slice(bank5);
    machine.memory_mut().ram_bank_mut(2).copy_from_slice(bank2);
    machine.memory_mut().ram_bank_mut(current_page).copy_from_slice(slot3_page);

    for page in 0u8..8 {
        if page == current_page || page == 2 || page == 5 {
            continue;
        }
        if bytes.len() < pos + PAGE_SIZE {
            return Err(EmulatorError::SnapshotMalformed("SNA: truncated RAM bank".into()));
        }
        machine.memory_mut().ram_bank_mut(page).copy_from_slice(&bytes[pos..pos + PAGE_SIZE]);
        pos += PAGE_SIZE;
    }

    machine.memory_mut().write_paging_port(port_data);
    machine.cpu_mut().pc = pc;
    if trdos_rom != 0 {
        machine.page_trdos_rom_in();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MachineConfig, MachineModel};
    use crate::memory::PAGE_SIZE as PS;

    fn rom_48k() -> Vec<crate::memory::Page> {
        vec![Box::new([0u8; PS])]
    }

    fn sample_48k_sna(pc: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; SNA_48K_LEN];
        bytes[23..25].copy_from_slice(&0x8000u16.to_le_bytes()); // SP
        bytes[25] = 1; // IM1
        bytes[26] = 3; // border
        let sp_offset = HEADER_LEN + (0x8000 - 0x4000);
        bytes[sp_offset..sp_offset + 2].copy_from_slice(&pc.to_le_bytes());
        bytes
    }

    #[test]
    fn loads_a_48k_snapshot_and_pops_pc_from_the_stack() {
        let config = MachineConfig::for_model(MachineModel::Spectrum48);
        let mut machine = Machine::new(config, rom_48k(), None).unwrap();
        load_sna(&sample_48k_sna(0x8123), &mut machine).unwrap();
        assert_eq!(machine.cpu().pc, 0x8123);
        assert_eq!(machine.cpu().sp, 0x8002);
        assert_eq!(machine.video().border(), BorderColor::new(3));
    }

    #[test]
    fn rejects_a_truncated_header() {
        let config = MachineConfig::for_model(MachineModel::Spectrum48);
        let mut machine = Machine::new(config, rom_48k(), None).unwrap();
        let err = load_sna(&[0u8; 10], &mut machine).unwrap_err();
        assert!(matches!(err, EmulatorError::SnapshotMalformed(_)));
    }

    #[test]
    fn rejects_128k_snapshot_on_a_48k_machine() {
        let config = MachineConfig::for_model(MachineModel::Spectrum48);
        let mut machine = Machine::new(config, rom_48k(), None).unwrap();
        let bytes = vec![0u8; SNA_128K_LEN];
        let err = load_sna(&bytes, &mut machine).unwrap_err();
        assert!(matches!(err, EmulatorError::SnapshotUnsupportedMachine(_)));
    }
}
