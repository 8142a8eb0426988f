//! The 64KiB Z80 address space: ROM/RAM bank switching, paging latches and
//! the contention map.
//!
//! `Memory` itself only tracks *which* physical page is mapped into each of
//! the four 16KiB address slots and whether a slot is presently contended;
//! it never talks to [`crate::video::Video`] directly. The
//! [`crate::machine::Bus`] aggregate (see `DESIGN.md`) is what combines a
//! contention flag from `Memory` with the t-state contention table owned by
//! `Video` into an actual stall, because both depend on the current
//! t-state — a single source of truth this module has no reason to know
//! about.
use crate::config::ContentionKind;
use crate::error::{EmulatorError, Result};

/// Size in bytes of one logical ROM or RAM page.
pub const PAGE_SIZE: usize = 0x4000;
/// Number of 16KiB RAM pages a fully populated 128K-family machine has.
pub const RAM_PAGES: usize = 8;
/// Upper bound on distinct ROM images a machine may carry (48K, 128K lo/hi,
/// +3 editor/syntax-check/boot/service, TR-DOS).
pub const MAX_ROM_PAGES: usize = 5;

/// One 16KiB page of bytes, boxed so a `Memory` does not live on the stack.
pub type Page = Box<[u8; PAGE_SIZE]>;

fn new_page() -> Page {
    Box::new([0u8; PAGE_SIZE])
}

/// Which of the four 16KiB address slots (0x0000, 0x4000, 0x8000, 0xC000).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Slot0,
    Slot1,
    Slot2,
    Slot3,
}

impl Slot {
    pub fn from_addr(addr: u16) -> Self {
        match addr >> 14 {
            0 => Slot::Slot0,
            1 => Slot::Slot1,
            2 => Slot::Slot2,
            _ => Slot::Slot3,
        }
    }

    pub fn base(self) -> u16 {
        match self {
            Slot::Slot0 => 0x0000,
            Slot::Slot1 => 0x4000,
            Slot::Slot2 => 0x8000,
            Slot::Slot3 => 0xC000,
        }
    }
}

/// 64KiB address space with bank switching, ROM selection and the 128K
/// paging latch.
pub struct Memory {
    ram: Vec<Page>,
    rom: Vec<Page>,
    rom_select: usize,
    /// RAM bank (0..=7) currently paged into slot 3. On 48K-class machines
    /// this is always 0 and paging writes are ignored entirely.
    ram_bank_slot3: u8,
    /// Which RAM bank (5 or 7) the ULA reads for the display; toggled by
    /// bit 3 of the last 0x7FFD write.
    screen_bank: u8,
    paging_lock: bool,
    contention: ContentionKind,
    has_paging: bool,
}

impl Memory {
    /// Builds a `Memory` with `rom_pages` ROM images (each exactly
    /// [`PAGE_SIZE`] bytes) and `RAM_PAGES` zeroed RAM banks, configured for
    /// `contention`. `has_paging` selects whether slot 3/ROM-select/screen
    /// bank writes are honoured at all (false for plain 48K machines).
    pub fn new(rom_pages: Vec<Page>, contention: ContentionKind, has_paging: bool) -> Result<Self> {
        if rom_pages.is_empty() || rom_pages.len() > MAX_ROM_PAGES {
            return Err(EmulatorError::SnapshotMalformed(format!(
                "expected 1..={} ROM pages, got {}",
                MAX_ROM_PAGES,
                rom_pages.len()
            )));
        }
        let ram = (0..RAM_PAGES).map(|_| new_page()).collect();
        Ok(Memory {
            ram,
            rom: rom_pages,
            rom_select: 0,
            ram_bank_slot3: 0,
            screen_bank: 5,
            paging_lock: false,
            contention,
            has_paging,
        })
    }

    /// Clears all RAM and resets paging state; ROM contents and selection
    /// are untouched (callers may also [`Memory::select_rom`] explicitly).
    /// This is a *hard* reset; a soft (pin) reset preserves RAM (§3).
    pub fn hard_reset(&mut self) {
        for page in &mut self.ram {
            page.iter_mut().for_each(|b| *b = 0);
        }
        self.ram_bank_slot3 = 0;
        self.screen_bank = 5;
        self.paging_lock = false;
        self.rom_select = 0;
    }

    /// A soft (pin) reset preserves RAM contents but releases the paging
    /// lock, matching real hardware: only a power cycle wipes memory.
    pub fn soft_reset(&mut self) {
        self.ram_bank_slot3 = 0;
        self.screen_bank = 5;
        self.paging_lock = false;
        self.rom_select = 0;
    }

    fn page_for_slot(&self, slot: Slot) -> &Page {
        match slot {
            Slot::Slot0 => &self.rom[self.rom_select],
            Slot::Slot1 => &self.ram[5],
            Slot::Slot2 => &self.ram[2],
            Slot::Slot3 => &self.ram[self.ram_bank_slot3 as usize],
        }
    }

    fn page_for_slot_mut(&mut self, slot: Slot) -> Option<&mut Page> {
        match slot {
            Slot::Slot0 => None, // ROM is read-only to the bus.
            Slot::Slot1 => Some(&mut self.ram[5]),
            Slot::Slot2 => Some(&mut self.ram[2]),
            Slot::Slot3 => Some(&mut self.ram[self.ram_bank_slot3 as usize]),
        }
    }

    #[inline]
    pub fn peek8(&self, addr: u16) -> u8 {
        let slot = Slot::from_addr(addr);
        let offset = (addr - slot.base()) as usize;
        self.page_for_slot(slot)[offset]
    }

    #[inline]
    pub fn peek16(&self, addr: u16) -> u16 {
        let lo = self.peek8(addr);
        let hi = self.peek8(addr.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    /// Opcode fetches and data reads are identical at the byte level on the
    /// Z80; this alias exists so callers (and the contention accounting in
    /// `Bus`) can distinguish M1 cycles from ordinary reads when needed.
    #[inline]
    pub fn fetch_opcode(&self, addr: u16) -> u8 {
        self.peek8(addr)
    }

    #[inline]
    pub fn poke8(&mut self, addr: u16, value: u8) {
        let slot = Slot::from_addr(addr);
        let offset = (addr - slot.base()) as usize;
        if let Some(page) = self.page_for_slot_mut(slot) {
            page[offset] = value;
        }
        // Writes to ROM (slot 0) are silently discarded, as on real hardware.
    }

    #[inline]
    pub fn poke16(&mut self, addr: u16, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.poke8(addr, lo);
        self.poke8(addr.wrapping_add(1), hi);
    }

    /// Raw access to a RAM bank by its physical number (0..=7), bypassing
    /// slot mapping. Used by the video renderer to read the selected screen
    /// bank and by snapshot loaders to populate memory directly.
    pub fn ram_bank(&self, bank: u8) -> &[u8; PAGE_SIZE] {
        &self.ram[bank as usize]
    }

    pub fn ram_bank_mut(&mut self, bank: u8) -> &mut [u8; PAGE_SIZE] {
        &mut self.ram[bank as usize]
    }

    pub fn rom_page(&self, index: usize) -> &[u8; PAGE_SIZE] {
        &self.rom[index]
    }

    pub fn rom_page_mut(&mut self, index: usize) -> &mut [u8; PAGE_SIZE] {
        &mut self.rom[index]
    }

    /// Which RAM bank currently backs the display (5 or 7).
    pub fn screen_bank(&self) -> u8 {
        self.screen_bank
    }

    pub fn rom_select(&self) -> usize {
        self.rom_select
    }

    pub fn ram_bank_slot3(&self) -> u8 {
        self.ram_bank_slot3
    }

    pub fn paging_locked(&self) -> bool {
        self.paging_lock
    }

    /// Explicit ROM bank selection, used by snapshot loaders and the TR-DOS
    /// trap; unlike [`Memory::page`] this ignores the paging lock, because
    /// it models an internal trap rather than a guest-visible port write.
    pub fn select_rom(&mut self, index: usize) {
        if index < self.rom.len() {
            self.rom_select = index;
        }
    }

    /// Maps `page_number` (a RAM bank 0..=7) into `slot`. Only slot 3 is
    /// ever paged by the 128K port; the method accepts any slot so
    /// snapshot loaders can also drive slot 0 (ROM) through one call by
    /// prior convention of the caller using [`Memory::select_rom`] instead.
    pub fn page(&mut self, slot: Slot, page_number: u8) {
        if !self.has_paging {
            return;
        }
        if slot == Slot::Slot3 {
            self.ram_bank_slot3 = page_number & 0x07;
        }
    }

    pub fn set_paging_lock(&mut self, locked: bool) {
        if self.has_paging {
            self.paging_lock = locked;
        }
    }

    pub fn set_screen_bank(&mut self, bank: u8) {
        if self.has_paging {
            self.screen_bank = bank;
        }
    }

    /// Applies a raw write to the 128K paging port (0x7FFD / equivalent),
    /// decoding bank/screen-select/rom-low/paging-lock from the low byte.
    /// No-op once the paging lock is set, until the next reset (§4.2).
    pub fn write_paging_port(&mut self, value: u8) {
        if !self.has_paging || self.paging_lock {
            return;
        }
        self.ram_bank_slot3 = value & 0x07;
        self.screen_bank = if value & 0x08 != 0 { 7 } else { 5 };
        let rom_low = (value & 0x10) != 0;
        self.rom_select = if rom_low { 1 } else { 0 };
        if value & 0x20 != 0 {
            self.paging_lock = true;
        }
    }

    /// Whether `slot` is presently contended under `self.contention`.
    /// Slot 1 (RAM 5) is always contended on ULA-bearing machines; slot 3
    /// is contended additionally when it holds an *odd* RAM bank on 128K
    /// family machines (the physical RAM chips interleaved with the ULA's
    /// access windows are the odd-numbered ones). Pentagon never
    /// contends.
    pub fn is_contended(&self, addr: u16) -> bool {
        if self.contention == ContentionKind::Pentagon {
            return false;
        }
        match Slot::from_addr(addr) {
            Slot::Slot1 => true,
            Slot::Slot3 => {
                self.has_paging && matches!(self.contention, ContentionKind::Ula128 | ContentionKind::Plus3)
                    && self.ram_bank_slot3 % 2 == 1
            }
            _ => false,
        }
    }

    /// Loads a contiguous range of bytes directly into the combined 64KiB
    /// view (used by 48K SNA/Z80 loading, which addresses memory as one
    /// flat image rather than by physical bank). `range` must lie entirely
    /// within 0x4000..=0xFFFF: the ROM slot is never writable this way.
    pub fn load_into_mem(&mut self, start: u16, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let addr = start.wrapping_add(i as u16);
            self.poke8(addr, byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(paging: bool, contention: ContentionKind) -> Memory {
        Memory::new(vec![new_page()], contention, paging).unwrap()
    }

    #[test]
    fn slot_mapping_is_16k_aligned() {
        assert_eq!(Slot::from_addr(0x0000), Slot::Slot0);
        assert_eq!(Slot::from_addr(0x3FFF), Slot::Slot0);
        assert_eq!(Slot::from_addr(0x4000), Slot::Slot1);
        assert_eq!(Slot::from_addr(0x8000), Slot::Slot2);
        assert_eq!(Slot::from_addr(0xC000), Slot::Slot3);
        assert_eq!(Slot::from_addr(0xFFFF), Slot::Slot3);
    }

    #[test]
    fn writes_to_rom_are_discarded() {
        let mut mem = mk(false, ContentionKind::Ula48);
        mem.poke8(0x0000, 0xAA);
        assert_eq!(mem.peek8(0x0000), 0x00);
    }

    #[test]
    fn slot1_is_always_contended_except_pentagon() {
        let mem = mk(false, ContentionKind::Ula48);
        assert!(mem.is_contended(0x4000));
        let mem = mk(false, ContentionKind::Pentagon);
        assert!(!mem.is_contended(0x4000));
    }

    #[test]
    fn paging_lock_freezes_further_writes() {
        let mut mem = mk(true, ContentionKind::Ula128);
        mem.write_paging_port(0x10 | 0x20); // rom bank 1, lock set
        assert_eq!(mem.rom_select(), 1);
        assert!(mem.paging_locked());
        mem.write_paging_port(0x00);
        assert_eq!(mem.rom_select(), 1, "locked paging must ignore further writes");
    }

    #[test]
    fn slot3_contention_follows_odd_bank_on_128k() {
        let mut mem = mk(true, ContentionKind::Ula128);
        mem.page(Slot::Slot3, 4);
        assert!(!mem.is_contended(0xC000));
        mem.page(Slot::Slot3, 5);
        assert!(mem.is_contended(0xC000));
    }
}
