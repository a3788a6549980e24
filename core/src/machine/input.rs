//! The joypad register (0xFF00).
//!
//! The register exposes two selectable groups of four buttons each (action
//! buttons and direction buttons); a selected, pressed button reads back
//! as 0. Selecting both groups at once (or neither) is legal and simply
//! ORs/blocks the corresponding lines, which is how a handful of games
//! probe which variant of the register they're talking to.

use crate::env::{Button, Input};
use crate::primitives::Byte;
use super::interrupt::{Interrupt, InterruptController};


#[derive(Debug, Clone, Copy, Default)]
pub struct InputController {
    select_action: bool,
    select_direction: bool,
    /// The last-known pressed state, latched so that transitions (needed
    /// for the joypad interrupt) can be detected.
    pressed: [bool; 8],
}

const ACTION_ORDER: [Button; 4] = [Button::A, Button::B, Button::Select, Button::Start];
const DIRECTION_ORDER: [Button; 4] = [Button::Right, Button::Left, Button::Up, Button::Down];

impl InputController {
    pub fn load_register(&self) -> Byte {
        let mut lower = 0x0Fu8;

        if self.select_action {
            for (i, &button) in ACTION_ORDER.iter().enumerate() {
                if self.pressed[button_index(button)] {
                    lower &= !(1 << i);
                }
            }
        }
        if self.select_direction {
            for (i, &button) in DIRECTION_ORDER.iter().enumerate() {
                if self.pressed[button_index(button)] {
                    lower &= !(1 << i);
                }
            }
        }

        let select_bits =
            (!self.select_action as u8) << 5 | (!self.select_direction as u8) << 4;

        Byte::new(0b1100_0000 | select_bits | lower)
    }

    pub fn store_register(&mut self, val: Byte) {
        self.select_action = val.get() & 0b0010_0000 == 0;
        self.select_direction = val.get() & 0b0001_0000 == 0;
    }

    /// Polls the host's input snapshot, updates latched state, and
    /// requests the joypad interrupt on any newly pressed button (the
    /// hardware fires on a high-to-low transition of a selected line).
    pub fn poll(&mut self, input: &impl Input, ic: &mut InterruptController) {
        for &button in crate::env::ALL_BUTTONS.iter() {
            let now = input.is_pressed(button);
            let was = self.pressed[button_index(button)];

            if now && !was {
                let selected = if ACTION_ORDER.contains(&button) {
                    self.select_action
                } else {
                    self.select_direction
                };
                if selected {
                    ic.request(Interrupt::Joypad);
                }
            }

            self.pressed[button_index(button)] = now;
        }
    }
}

fn button_index(button: Button) -> usize {
    match button {
        Button::Up => 0,
        Button::Down => 1,
        Button::Left => 2,
        Button::Right => 3,
        Button::A => 4,
        Button::B => 5,
        Button::Select => 6,
        Button::Start => 7,
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::env::NullInput;

    struct FixedInput(Vec<Button>);

    impl Input for FixedInput {
        fn is_pressed(&self, button: Button) -> bool {
            self.0.contains(&button)
        }
    }

    #[test]
    fn unselected_group_reads_all_ones() {
        let mut ic = InterruptController::default();
        let mut input = InputController::default();
        input.store_register(Byte::new(0b0011_0000)); // neither selected
        input.poll(&FixedInput(vec![Button::A]), &mut ic);
        assert_eq!(input.load_register().get() & 0x0F, 0x0F);
    }

    #[test]
    fn selected_pressed_button_reads_as_zero_bit() {
        let mut ic = InterruptController::default();
        let mut input = InputController::default();
        input.store_register(Byte::new(0b0001_0000)); // select action
        input.poll(&FixedInput(vec![Button::A]), &mut ic);
        assert_eq!(input.load_register().get() & 0x01, 0x00);
    }

    #[test]
    fn press_while_selected_requests_joypad_interrupt() {
        let mut ic = InterruptController::default();
        let mut input = InputController::default();
        input.store_register(Byte::new(0b0001_0000));
        input.poll(&FixedInput(vec![Button::A]), &mut ic);
        assert_eq!(ic.pending(), None); // Joypad not enabled in IE yet
        ic.store_enable(Byte::new(0b0001_0000));
        assert_eq!(ic.pending(), Some(Interrupt::Joypad));
    }

    #[test]
    fn no_host_input_means_nothing_pressed() {
        let mut ic = InterruptController::default();
        let mut input = InputController::default();
        input.store_register(Byte::new(0b0000_0000));
        input.poll(&NullInput, &mut ic);
        assert_eq!(input.load_register().get() & 0x0F, 0x0F);
    }
}
