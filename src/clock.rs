//! Frame/line timing constants and the t-state counter types shared by
//! every component that needs to reason about "when" within a frame.
use crate::config::MachineModel;

/// A t-state counter, signed so callers can carry a negative "owed" balance
/// across a frame boundary (see [`crate::machine::Machine::run_frame`]).
pub type FTs = i32;

/// A scanline or intra-line t-state counter; always non-negative in
/// practice but kept signed to match `FTs` arithmetic without casts.
pub type Ts = i16;

/// The per-model frame and line timing the Scheduler (§4.7) needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTiming {
    /// Total t-states in one video frame.
    pub frame_t_states: FTs,
    /// T-states per scanline.
    pub line_t_states: Ts,
    /// Number of t-states the interrupt (INT) line stays asserted from the
    /// start of the frame.
    pub int_end_t: FTs,
    /// First t-state of the first displayed scanline (top border starts
    /// earlier, but this is where line 0 of the 312/320-line raster begins
    /// counting for the purposes of [`crate::video::Video`]).
    pub first_line_t_state: FTs,
}

impl FrameTiming {
    /// The canonical timing for `model`.
    pub const fn for_model(model: MachineModel) -> Self {
        match model {
            MachineModel::Spectrum48 => FrameTiming {
                frame_t_states: 69_888,
                line_t_states: 224,
                int_end_t: 32,
                first_line_t_state: 0,
            },
            MachineModel::Spectrum128 => FrameTiming {
                frame_t_states: 70_908,
                line_t_states: 228,
                int_end_t: 36,
                first_line_t_state: 0,
            },
            MachineModel::SpectrumPlus3 => FrameTiming {
                frame_t_states: 70_908,
                line_t_states: 228,
                int_end_t: 36,
                first_line_t_state: 0,
            },
            MachineModel::Pentagon => FrameTiming {
                frame_t_states: 71_680,
                line_t_states: 224,
                int_end_t: 36,
                first_line_t_state: 0,
            },
            MachineModel::Tk9x50Hz => FrameTiming {
                frame_t_states: 71_136,
                line_t_states: 228,
                int_end_t: 32,
                first_line_t_state: 0,
            },
            MachineModel::Tk9x60Hz => FrameTiming {
                frame_t_states: 59_736,
                line_t_states: 224,
                int_end_t: 32,
                first_line_t_state: 0,
            },
        }
    }

    /// Number of scanlines in one frame (including non-displayed border
    /// and sync lines), derived from the two timing constants.
    pub const fn lines_per_frame(&self) -> u16 {
        (self.frame_t_states / self.line_t_states as FTs) as u16
    }
}

/// AY/beeper sample rates in Hz, one audio buffer produced per frame.
pub fn audio_sample_rate(model: MachineModel) -> u32 {
    match model {
        MachineModel::Spectrum48 | MachineModel::Tk9x50Hz | MachineModel::Tk9x60Hz => 31_250,
        MachineModel::Spectrum128 | MachineModel::SpectrumPlus3 | MachineModel::Pentagon => 31_112,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timings_match_spec_table() {
        assert_eq!(FrameTiming::for_model(MachineModel::Spectrum48).frame_t_states, 69_888);
        assert_eq!(FrameTiming::for_model(MachineModel::Spectrum128).frame_t_states, 70_908);
        assert_eq!(FrameTiming::for_model(MachineModel::Pentagon).frame_t_states, 71_680);
        assert_eq!(FrameTiming::for_model(MachineModel::Tk9x50Hz).frame_t_states, 71_136);
        assert_eq!(FrameTiming::for_model(MachineModel::Tk9x60Hz).frame_t_states, 59_736);
    }

    #[test]
    fn lines_per_frame_48k_is_312() {
        let t = FrameTiming::for_model(MachineModel::Spectrum48);
        assert_eq!(t.lines_per_frame(), 312);
    }
}
