//! Kempston joystick emulation, read through port 0x1F (`A5..A0 = 0x1F`).
bitflags! {
    /// Bit = 1 is active, matching the Kempston interface's own polarity
    /// (unlike the ULA keyboard port, which is active-low).
    #[derive(Default)]
    pub struct Directions: u8 {
        const RIGHT = 0b0000_0001;
        const LEFT  = 0b0000_0010;
        const DOWN  = 0b0000_0100;
        const UP    = 0b0000_1000;
    }
}

const FIRE1: u8 = 0b0001_0000;
const FIRE2: u8 = 0b0010_0000;
const FIRE3: u8 = 0b0100_0000;

/// A host-facing interface for driving joystick state between frames.
pub trait JoystickInterface {
    fn set_directions(&mut self, dir: Directions);
    fn get_directions(&self) -> Directions;
    fn fire(&mut self, btn: u8, pressed: bool);
    fn get_fire(&self, btn: u8) -> bool;
}

/// Kempston-compatible joystick register: directions in the low nibble,
/// up to three fire buttons in bits 4..6, bit 7 always clear.
#[derive(Clone, Copy, Debug, Default)]
pub struct Kempston {
    state: u8,
}

impl Kempston {
    pub fn new() -> Self {
        Kempston::default()
    }

    /// The byte returned for a port read at 0x1F.
    pub fn port_value(&self) -> u8 {
        self.state
    }
}

impl JoystickInterface for Kempston {
    fn set_directions(&mut self, dir: Directions) {
        self.state = (self.state & !Directions::all().bits()) | dir.bits();
    }

    fn get_directions(&self) -> Directions {
        Directions::from_bits_truncate(self.state)
    }

    fn fire(&mut self, btn: u8, pressed: bool) {
        let bit = match btn {
            0 => FIRE1,
            1 => FIRE2,
            _ => FIRE3,
        };
        if pressed {
            self.state |= bit;
        } else {
            self.state &= !bit;
        }
    }

    fn get_fire(&self, btn: u8) -> bool {
        let bit = match btn {
            0 => FIRE1,
            1 => FIRE2,
            _ => FIRE3,
        };
        self.state & bit != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_and_fire_compose_independently() {
        let mut joy = Kempston::new();
        joy.set_directions(Directions::UP | Directions::RIGHT);
        joy.fire(0, true);
        assert_eq!(joy.port_value(), 0b0001_1001);
        joy.set_directions(Directions::empty());
        assert_eq!(joy.port_value(), 0b0001_0000, "fire state must survive a direction update");
    }
}
