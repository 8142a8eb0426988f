//! Black-box scenario tests: each builds a [`Machine`] through its public
//! API only (no crate-internal access), drives it with real Z80 machine
//! code or a snapshot image, and asserts on architectural state after
//! running whole frames, mirroring the teacher library's own top-level
//! `tests/boot.rs`/`video.rs`/`synth.rs` scenarios against the assembled
//! crate rather than a single module.
use zxspectrum_core::clock::FrameTiming;
use zxspectrum_core::memory::{Page, PAGE_SIZE};
use zxspectrum_core::snapshot::sna;
use zxspectrum_core::video::WIDTH_WORDS;
use zxspectrum_core::{Machine, MachineConfig, MachineModel};

fn rom_pages(model: MachineModel) -> Vec<Page> {
    let count = if model.has_128k_paging() { 2 } else { 1 };
    (0..count).map(|_| Box::new([0u8; PAGE_SIZE]) as Page).collect()
}

fn machine_for(model: MachineModel) -> Machine {
    let config = MachineConfig::for_model(model);
    Machine::new(config, rom_pages(model), None).unwrap()
}

/// Scenario 1: load a 48K SNA with PC=0x4000 and a HALT at that address,
/// interrupts enabled. One frame always opens an INT window at t=0, so the
/// halted CPU should take it: IFF1 is cleared and the return address the
/// interrupt pushed (the HALT's already-incremented PC) is 0x4001.
#[test]
fn scenario1_halted_cpu_services_int_and_saves_resume_address() {
    let mut machine = machine_for(MachineModel::Spectrum48);

    let mut bytes = vec![0u8; sna::SNA_48K_LEN];
    bytes[19] = 0x04; // interrupt flags: bit 2 set -> IFF1 = IFF2 = true
    bytes[23..25].copy_from_slice(&0x8000u16.to_le_bytes()); // SP
    bytes[25] = 1; // IM1
    bytes[26] = 0; // border
    const HEADER_LEN: usize = 27;
    bytes[HEADER_LEN] = 0x76; // RAM byte at 0x4000: HALT
    let sp_offset = HEADER_LEN + (0x8000 - 0x4000);
    bytes[sp_offset..sp_offset + 2].copy_from_slice(&0x4000u16.to_le_bytes());

    sna::load_sna(&bytes, &mut machine).unwrap();
    assert_eq!(machine.cpu().pc, 0x4000);
    assert!(machine.cpu().iff1);
    assert_eq!(machine.cpu().sp, 0x8000);

    machine.run_frame();

    assert!(!machine.cpu().iff1, "INT acceptance clears IFF1");
    assert!(!machine.cpu().halted, "taking the interrupt leaves the HALT state");
    assert_eq!(machine.cpu().sp, 0x7FFE, "exactly one push happened: the INT's");
    assert_eq!(machine.memory().peek16(machine.cpu().sp), 0x4001, "INT saved the halted PC");
}

/// Scenario 2: `LD A,I` copies IFF2 into F's P/V bit. The real chip also
/// has a documented race where a coincident INT sampling can glitch this
/// bit; this core does not model that race (see `DESIGN.md`), so both
/// halves of the scenario are expressed directly in terms of IFF2.
#[test]
fn scenario2_ld_a_i_parity_overflow_tracks_iff2() {
    const FLAG_PV: u8 = 0b0000_0100;
    for iff2 in [true, false] {
        let mut machine = machine_for(MachineModel::Spectrum48);
        machine.memory_mut().load_into_mem(0x8000, &[0xED, 0x57]);
        machine.cpu_mut().pc = 0x8000;
        machine.cpu_mut().i = 0x3F;
        machine.cpu_mut().iff1 = false; // keep the scheduler's INT window from firing
        machine.cpu_mut().iff2 = iff2;
        machine.run_frame();
        assert_eq!(machine.cpu().a, 0x3F);
        assert_eq!(machine.cpu().f & FLAG_PV != 0, iff2);
    }
}

/// Scenario 3: writing the border colour through port 0xFE is visible in
/// the rendered framebuffer's border columns by the end of the frame.
#[test]
fn scenario3_port_fe_write_is_reflected_in_the_rendered_border() {
    let mut machine = machine_for(MachineModel::Spectrum48);
    machine.memory_mut().load_into_mem(
        0x8000,
        &[
            0x3E, 0x07, // LD A,7
            0xD3, 0xFE, // OUT (0xFE),A
            0x18, 0xFE, // JR $ (spin for the rest of the frame)
        ],
    );
    machine.cpu_mut().pc = 0x8000;
    machine.run_frame();

    assert_eq!(machine.video().border().0, 7);
    let border_word = u32::from_le_bytes([7, 7, 7, 7]);
    let top_row = &machine.framebuffer()[0..WIDTH_WORDS];
    assert!(top_row.iter().all(|&w| w == border_word), "top border row should be pure border colour");
}

/// Scenario 4: mounting a TAP whose first block is a standard 19-byte
/// header and running until the LD-BYTES ROM trap fires copies the block
/// into memory and reports success through H/carry/DE per the trap's
/// documented register contract.
#[test]
fn scenario4_tap_header_block_load_via_rom_trap() {
    let mut config = MachineConfig::for_model(MachineModel::Spectrum48);
    config.rom_traps.load = true;
    let mut machine = Machine::new(config, rom_pages(MachineModel::Spectrum48), None).unwrap();

    let mut payload = vec![0x00u8, 0x00]; // flag=header, type=program
    payload.extend_from_slice(b"TESTFILE  "); // 10-byte filename
    payload.extend_from_slice(&[0x00, 0x00]); // length
    payload.extend_from_slice(&[0x00, 0x00]); // param1
    payload.extend_from_slice(&[0x00, 0x00]); // param2
    assert_eq!(payload.len(), 18);
    let checksum = payload.iter().fold(0u8, |acc, &b| acc ^ b);
    payload.push(checksum);
    assert_eq!(payload.len(), 19);
    let mut tap = (payload.len() as u16).to_le_bytes().to_vec();
    tap.extend_from_slice(&payload);

    machine.mount_tap(&tap).unwrap();
    machine.cpu_mut().pc = 0x056B;
    machine.cpu_mut().ix = 0x8000;
    machine.cpu_mut().set_de(17); // payload length excluding flag and checksum

    machine.run_frame();

    assert_eq!(machine.cpu().h, 0x00, "H holds the block's flag/type byte");
    assert_eq!(machine.cpu().f & 0x01, 0x01, "carry set on matching checksum");
    assert_eq!(machine.cpu().de(), 0, "DE decremented to 0");
    assert_eq!(machine.cpu().pc, 0x05E2, "control returned past LD-BYTES");
    for (i, &byte) in payload[1..payload.len() - 1].iter().enumerate() {
        assert_eq!(machine.memory().peek8(0x8000 + i as u16), byte);
    }
}

/// Scenario 5: on a 128K machine, writing 0x10 then 0x30 to 0x7FFD maps
/// ROM bank 1 and locks paging; a subsequent write of 0x00 is ignored.
#[test]
fn scenario5_128k_paging_lock_rejects_writes_once_set() {
    let mut machine = machine_for(MachineModel::Spectrum128);
    machine.memory_mut().load_into_mem(
        0x8000,
        &[
            0x01, 0xFD, 0x7F, // LD BC,0x7FFD
            0x3E, 0x10, // LD A,0x10
            0xED, 0x79, // OUT (C),A
            0x3E, 0x30, // LD A,0x30
            0xED, 0x79, // OUT (C),A
            0x3E, 0x00, // LD A,0x00
            0xED, 0x79, // OUT (C),A
            0x18, 0xFE, // JR $
        ],
    );
    machine.cpu_mut().pc = 0x8000;
    machine.run_frame();

    assert_eq!(machine.memory().rom_select(), 1, "bit 4 maps ROM bank 1");
    assert!(machine.memory().paging_locked(), "bit 5 sets the paging lock");
    assert_ne!(machine.memory().rom_select(), 0, "the later 0x00 write must be a no-op");
}

/// Scenario 6: programming channel A for max volume at a ~1kHz tone
/// produces a non-DC waveform whose autocorrelation favours the channel's
/// own period over its anti-phase lag.
#[test]
fn scenario6_ay_channel_a_tone_produces_a_periodic_waveform() {
    let mut machine = machine_for(MachineModel::Spectrum128);
    machine.memory_mut().load_into_mem(
        0x8000,
        &[
            0x01, 0xFD, 0xFF, 0x3E, 0x00, 0xED, 0x79, // select reg 0
            0x01, 0xFD, 0xBF, 0x3E, 0xFE, 0xED, 0x79, // R0 = 0xFE
            0x01, 0xFD, 0xFF, 0x3E, 0x01, 0xED, 0x79, // select reg 1
            0x01, 0xFD, 0xBF, 0x3E, 0x00, 0xED, 0x79, // R1 = 0x00
            0x01, 0xFD, 0xFF, 0x3E, 0x07, 0xED, 0x79, // select reg 7
            0x01, 0xFD, 0xBF, 0x3E, 0xFE, 0xED, 0x79, // R7 = 0xFE
            0x01, 0xFD, 0xFF, 0x3E, 0x08, 0xED, 0x79, // select reg 8
            0x01, 0xFD, 0xBF, 0x3E, 0x0F, 0xED, 0x79, // R8 = 0x0F
            0x18, 0xFE, // JR $
        ],
    );
    machine.cpu_mut().pc = 0x8000;
    machine.run_frame();

    let buf = machine.audio_buffer();
    let min = *buf.iter().min().unwrap();
    let max = *buf.iter().max().unwrap();
    assert!(max > min, "expected a toggling waveform, got a flat line");

    let frame_t_states = FrameTiming::for_model(MachineModel::Spectrum128).frame_t_states;
    let t_per_sample = (frame_t_states / buf.len() as i32).max(1);
    let full_period_t_states = 2 * 254 * 32; // two toggles of a period-254 tone counter
    let period_samples = ((full_period_t_states / t_per_sample).max(2) as usize).min(buf.len() / 3);
    let antiphase_lag = (period_samples / 2).max(1);

    let mean = buf.iter().map(|&b| b as f64).sum::<f64>() / buf.len() as f64;
    let autocorr = |lag: usize| -> f64 {
        buf.iter().zip(buf.iter().skip(lag)).map(|(&a, &b)| (a as f64 - mean) * (b as f64 - mean)).sum()
    };
    let corr_period = autocorr(period_samples);
    let corr_antiphase = autocorr(antiphase_lag);
    assert!(corr_period > corr_antiphase, "waveform should correlate with its own period, not its anti-phase lag");
}
