//! The ULA video subsystem: a per-scanline raster generator driven by the
//! CPU's t-state counter, the memory contention map, and the floating-bus
//! read model.
//!
//! `Video` never touches [`crate::memory::Memory`] on its own initiative;
//! every operation that needs to read the screen bank takes a `&Memory`
//! borrow from the caller (the [`crate::machine::Bus`] aggregate), which is
//! how the spec's cyclic CPU/Memory/Video dependency is broken (see
//! `DESIGN.md`).
use crate::clock::{FTs, FrameTiming, Ts};
use crate::config::{ContentionKind, MachineModel};
use crate::memory::Memory;

/// A ZX Spectrum border/ink/paper colour, 0 (black) to 7 (white).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct BorderColor(pub u8);

impl BorderColor {
    pub fn new(value: u8) -> Self {
        BorderColor(value & 0x07)
    }
}

impl std::convert::TryFrom<u8> for BorderColor {
    type Error = &'static str;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value <= 7 {
            Ok(BorderColor(value))
        } else {
            Err("border colour out of range 0..=7")
        }
    }
}

/// Horizontal resolution of the rendered frame, including both borders.
pub const SCREEN_WIDTH: usize = 320;
/// Vertical resolution of the rendered frame, including both borders.
pub const SCREEN_HEIGHT: usize = 256;
const BORDER_PX: usize = 32;
const INK_WIDTH: usize = 256;
const INK_HEIGHT: usize = 192;
/// Pixels are packed 4-to-a-word (one colour index byte per lane) so the
/// renderer performs exactly two 32-bit writes per source byte pair, as the
/// original firmware's VGA driver did; the host display driver unpacks
/// lanes however its own pixel format requires.
pub const WIDTH_WORDS: usize = SCREEN_WIDTH / 4;

/// The rendering phase for the scanline currently being drawn, keyed only
/// by the t-state (see [`Video::phase_at`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawPhase {
    TopBorderBlank,
    TopBorder,
    MainScreenBlank,
    MainScreenLB,
    MainScreen,
    MainScreenRB,
    BottomBorderBlank,
    BottomBorder,
    Blank,
}

fn build_pixel_table() -> Box<[[u32; 16]; 256]> {
    let mut table = Box::new([[0u32; 16]; 256]);
    for attr in 0..256usize {
        let ink = (attr & 0x07) as u8;
        let paper = ((attr >> 3) & 0x07) as u8;
        let bright = if attr & 0x40 != 0 { 0x08 } else { 0x00 };
        for nibble in 0..16usize {
            let mut lanes = [0u8; 4];
            for (bit_i, lane) in lanes.iter_mut().enumerate() {
                let bit = (nibble >> (3 - bit_i)) & 1;
                *lane = bright | if bit != 0 { ink } else { paper };
            }
            table[attr][nibble] = u32::from_le_bytes(lanes);
        }
    }
    table
}

/// Maps ULA screen Y (0..=191) to its two source byte offsets (bitmap,
/// attribute) within a screen bank, i.e. the characteristic "ULA-swap"
/// addressing where bits 6..3 of the row number are interleaved with the
/// third-height banding.
fn ula_line_offsets(y: usize) -> (usize, usize) {
    let third = y / 64; // 0..=2
    let within = y % 64;
    let char_row = within / 8; // 0..=7
    let pixel_row = within % 8; // 0..=7
    let bitmap_off = (third << 11) | (pixel_row << 8) | (char_row << 5);
    let attr_off = 0x1800 + (third * 8 + char_row) * 32;
    (bitmap_off, attr_off)
}

/// Per-frame, per-t-state ULA memory contention table (§4.2): a length-8
/// repeating pattern of extra t-states, active only during the 128
/// t-state window each scanline spends fetching screen data.
struct ContentionTable {
    /// One entry per t-state in the frame; 0 outside the active window.
    table: Vec<u8>,
}

impl ContentionTable {
    fn build(timing: FrameTiming, contention: ContentionKind) -> Self {
        let mut table = vec![0u8; timing.frame_t_states.max(0) as usize];
        if contention == ContentionKind::Pentagon {
            return ContentionTable { table };
        }
        let pattern: [u8; 8] = match contention {
            ContentionKind::Plus3 => [1, 0, 7, 6, 5, 4, 3, 2],
            _ => [6, 5, 4, 3, 2, 1, 0, 0],
        };
        let screen_start_t: FTs = match contention {
            ContentionKind::Ula48 => 14_335,
            ContentionKind::Ula128 | ContentionKind::Plus3 => 14_361,
            ContentionKind::Pentagon => unreachable!(),
        };
        let line_t = timing.line_t_states as FTs;
        for line in 0..INK_HEIGHT as FTs {
            let line_start = screen_start_t + line * line_t;
            for col in 0..128i32 {
                let t = line_start + col;
                if t >= 0 && (t as usize) < table.len() {
                    table[t as usize] = pattern[(col as usize) % 8];
                }
            }
        }
        ContentionTable { table }
    }

    fn delay_at(&self, t_state: FTs) -> FTs {
        if t_state < 0 {
            return 0;
        }
        let t = (t_state as usize) % self.table.len().max(1);
        self.table.get(t).copied().unwrap_or(0) as FTs
    }
}

/// The ULA video generator.
pub struct Video {
    timing: FrameTiming,
    contention: ContentionKind,
    contention_table: ContentionTable,
    floating_bus_enabled: bool,
    pixel_table: Box<[[u32; 16]; 256]>,
    border: BorderColor,
    border_word: [u32; 8],
    flash_mask: u8,
    frame_counter: u32,
    last_drawn_line: i32,
    /// Packed framebuffer, `WIDTH_WORDS * SCREEN_HEIGHT` words, row-major.
    framebuffer: Vec<u32>,
}

impl Video {
    pub fn new(model: MachineModel, contention: ContentionKind) -> Self {
        let timing = FrameTiming::for_model(model);
        let contention_table = ContentionTable::build(timing, contention);
        let pixel_table = build_pixel_table();
        let mut border_word = [0u32; 8];
        for (c, word) in border_word.iter_mut().enumerate() {
            let byte = c as u8;
            *word = u32::from_le_bytes([byte, byte, byte, byte]);
        }
        Video {
            timing,
            contention,
            contention_table,
            floating_bus_enabled: contention != ContentionKind::Pentagon,
            pixel_table,
            border: BorderColor::default(),
            border_word,
            flash_mask: 0,
            frame_counter: 0,
            last_drawn_line: -1,
            framebuffer: vec![0u32; WIDTH_WORDS * SCREEN_HEIGHT],
        }
    }

    pub fn reset(&mut self) {
        self.border = BorderColor::default();
        self.flash_mask = 0;
        self.frame_counter = 0;
        self.last_drawn_line = -1;
        self.framebuffer.iter_mut().for_each(|w| *w = 0);
    }

    /// Called once at the start of each frame: advances the 16-frame flash
    /// counter and rewinds the drawing cursor.
    pub fn start_frame(&mut self) {
        self.last_drawn_line = -1;
        self.frame_counter = self.frame_counter.wrapping_add(1);
        if self.frame_counter % 16 == 0 {
            self.flash_mask ^= 0xFF;
        }
    }

    pub fn set_border(&mut self, color: BorderColor) {
        self.border = color;
    }

    pub fn border(&self) -> BorderColor {
        self.border
    }

    /// Extra t-states charged for a memory or port access occurring at
    /// `t_state`, assuming the accessed slot is contended.
    pub fn contention_delay(&self, t_state: FTs) -> FTs {
        self.contention_table.delay_at(t_state)
    }

    /// A pure function of `(machine, t)`: which raster phase owns the pixel
    /// at absolute frame t-state `t_state`. Exposed independent of
    /// [`Video::draw`]'s actual rendering granularity so it can be tested
    /// and reused by the floating-bus model.
    pub fn phase_at(&self, t_state: FTs) -> DrawPhase {
        if t_state < 0 {
            return DrawPhase::Blank;
        }
        let line_t = self.timing.line_t_states as FTs;
        let line = t_state / line_t;
        let col = t_state % line_t;
        let top_border_lines = BORDER_PX as FTs;
        let bottom_border_start = top_border_lines + INK_HEIGHT as FTs;
        // The ULA's contended fetch for a line's first byte lands one
        // t-state before that line's nominal column 0 (the same -1 offset
        // baked into `ContentionTable::build`'s `screen_start_t`), so the
        // ink window here starts at column 23, not 24.
        let ink_col_start = 23;
        let ink_col_end = ink_col_start + 128;
        if line < 0 || line >= self.timing.lines_per_frame() as FTs {
            return DrawPhase::Blank;
        }
        if line < top_border_lines {
            return if col < ink_col_start {
                DrawPhase::TopBorderBlank
            } else {
                DrawPhase::TopBorder
            };
        }
        if line < bottom_border_start {
            if col < ink_col_start {
                DrawPhase::MainScreenBlank
            } else if col < ink_col_start + 16 {
                DrawPhase::MainScreenLB
            } else if col < ink_col_end - 16 {
                DrawPhase::MainScreen
            } else if col < ink_col_end {
                DrawPhase::MainScreenRB
            } else {
                DrawPhase::BottomBorderBlank
            }
        } else if line < bottom_border_start + BORDER_PX as FTs {
            if col < ink_col_start {
                DrawPhase::BottomBorderBlank
            } else {
                DrawPhase::BottomBorder
            }
        } else {
            DrawPhase::Blank
        }
    }

    fn render_line(&mut self, line: i32, mem: &Memory) {
        if line < 0 || line as usize >= SCREEN_HEIGHT {
            return;
        }
        let row_base = line as usize * WIDTH_WORDS;
        let top_border_lines = BORDER_PX as i32;
        let bottom_border_start = top_border_lines + INK_HEIGHT as i32;
        let border_word = self.border_word[self.border.0 as usize];

        if line < top_border_lines || line >= bottom_border_start + BORDER_PX as i32 {
            for w in &mut self.framebuffer[row_base..row_base + WIDTH_WORDS] {
                *w = border_word;
            }
            return;
        }
        if line >= bottom_border_start {
            for w in &mut self.framebuffer[row_base..row_base + WIDTH_WORDS] {
                *w = border_word;
            }
            return;
        }

        // Main screen line.
        let ink_y = (line - top_border_lines) as usize;
        let (bitmap_off, attr_off) = ula_line_offsets(ink_y);
        let screen = mem.ram_bank(mem.screen_bank());
        let border_words_per_side = BORDER_PX / 4;
        for w in &mut self.framebuffer[row_base..row_base + border_words_per_side] {
            *w = border_word;
        }
        for w in &mut self.framebuffer[row_base + WIDTH_WORDS - border_words_per_side..row_base + WIDTH_WORDS] {
            *w = border_word;
        }
        let ink_base = row_base + border_words_per_side;
        for byte_col in 0..32usize {
            let bitmap = screen[bitmap_off + byte_col];
            let attr = screen[attr_off + byte_col];
            let eff_attr = self.flash_effective(attr);
            let hi = (bitmap >> 4) as usize;
            let lo = (bitmap & 0x0F) as usize;
            self.framebuffer[ink_base + byte_col * 2] = self.pixel_table[eff_attr as usize][hi];
            self.framebuffer[ink_base + byte_col * 2 + 1] = self.pixel_table[eff_attr as usize][lo];
        }
    }

    fn flash_effective(&self, attr: u8) -> u8 {
        if attr & 0x80 != 0 && self.flash_mask != 0 {
            let ink = attr & 0x07;
            let paper = (attr >> 3) & 0x07;
            (attr & 0xC0) | (ink << 3) | paper
        } else {
            attr
        }
    }

    /// Advances rendering up to (but not including) `upto_t_state`,
    /// reading the currently selected screen bank from `mem` as needed.
    /// Whole scanlines are committed atomically once their t-state window
    /// has fully elapsed; see `DESIGN.md` for why this is a faithful
    /// simplification of the per-dot hardware timing.
    pub fn draw(&mut self, upto_t_state: FTs, mem: &Memory) {
        let line_t = self.timing.line_t_states as FTs;
        let target_line = (upto_t_state / line_t) as i32;
        while self.last_drawn_line < target_line {
            let line = self.last_drawn_line + 1;
            self.render_line(line, mem);
            self.last_drawn_line = line;
        }
    }

    /// Finishes rendering the remainder of the current frame (called after
    /// HALT leaves the CPU idle for the rest of the frame).
    pub fn flush(&mut self, mem: &Memory) {
        self.draw(self.timing.frame_t_states, mem);
    }

    /// The floating-bus byte visible to the CPU at `t_state`, or `0xFF`
    /// outside the read windows. Disabled entirely on Pentagon (§9 Open
    /// Questions: unconfirmed against real hardware, left off).
    pub fn floating_bus_byte(&self, t_state: FTs, mem: &Memory) -> u8 {
        if !self.floating_bus_enabled || t_state < 0 {
            return 0xFF;
        }
        let line_t = self.timing.line_t_states as FTs;
        let line = t_state / line_t;
        let col = t_state % line_t;
        let top_border_lines = BORDER_PX as FTs;
        let ink_line = line - top_border_lines;
        if !(0..INK_HEIGHT as FTs).contains(&ink_line) {
            return 0xFF;
        }
        let window_start = 24;
        let window_len = 128;
        if col < window_start || col >= window_start + window_len {
            return 0xFF;
        }
        let phase = ((col - window_start) % 8) as u8;
        let window_set: &[u8] = match self.contention {
            ContentionKind::Ula128 | ContentionKind::Plus3 => &[0, 1, 2, 3],
            _ => &[3, 4, 5, 6],
        };
        if !window_set.contains(&phase) {
            return 0xFF;
        }
        let byte_col = ((col - window_start) / 8) as usize * 2;
        let (bitmap_off, attr_off) = ula_line_offsets(ink_line as usize);
        let screen = mem.ram_bank(mem.screen_bank());
        let rel = match self.contention {
            ContentionKind::Ula128 | ContentionKind::Plus3 => phase,
            _ => phase - 3,
        };
        match rel {
            0 => screen[bitmap_off + byte_col],
            1 => screen[attr_off + byte_col],
            2 => screen[bitmap_off + byte_col + 1],
            _ => screen[attr_off + byte_col + 1],
        }
    }

    pub fn framebuffer(&self) -> &[u32] {
        &self.framebuffer
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }
}
