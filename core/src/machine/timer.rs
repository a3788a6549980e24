//! DIV/TIMA/TMA/TAC: the falling-edge-driven timer.
//!
//! The visible `DIV` register is just the upper byte of an internal 16-bit
//! counter that free-runs at the master clock rate. `TIMA` increments on a
//! falling edge of one bit of that counter (selected by `TAC`'s low two
//! bits) while the timer is enabled (`TAC` bit 2). Writing `DIV` resets the
//! whole counter to zero, which itself can produce a falling edge and an
//! extra, easy-to-miss `TIMA` increment. Overflowing `TIMA` doesn't reload
//! and fire the interrupt on the same cycle: there is a one-M-cycle window
//! where `TIMA` reads as `0x00` before `TMA` is copied in and `Timer` is
//! requested; a write to `TIMA` during that window cancels the reload, and
//! a write to `TMA` during it is picked up by the reload.

use crate::primitives::Byte;
use super::interrupt::{Interrupt, InterruptController};


fn selected_bit(tac: u8) -> u8 {
    match tac & 0b11 {
        0b00 => 9,
        0b01 => 3,
        0b10 => 5,
        0b11 => 7,
        _ => unreachable!(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverflowState {
    None,
    /// TIMA reads 0x00; reload happens on the next tick unless cancelled.
    Pending,
}

#[derive(Debug, Clone)]
pub struct Timer {
    counter: u16,
    tima: Byte,
    tma: Byte,
    tac: Byte,
    state: OverflowState,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            counter: 0,
            tima: Byte::zero(),
            tma: Byte::zero(),
            tac: Byte::zero(),
            state: OverflowState::None,
        }
    }
}

impl Timer {
    fn enabled(&self) -> bool {
        self.tac.get() & 0b100 != 0
    }

    fn bit_at(&self, counter: u16) -> bool {
        (counter >> selected_bit(self.tac.get())) & 1 != 0
    }

    fn increment_tima(&mut self) {
        if self.tima == Byte::new(0xFF) {
            self.tima = Byte::zero();
            self.state = OverflowState::Pending;
        } else {
            self.tima += 1;
        }
    }

    /// Advances the timer by one M-cycle (four T-cycles); call this from
    /// the bus on every memory access, in lockstep with the CPU.
    pub fn tick(&mut self, ic: &mut InterruptController) {
        // Resolve a pending reload from the *previous* tick first: the
        // TIMA=0x00 plateau lasts exactly one M-cycle.
        if self.state == OverflowState::Pending {
            self.tima = self.tma;
            ic.request(Interrupt::Timer);
            self.state = OverflowState::None;
        }

        for _ in 0..4 {
            let before = self.bit_at(self.counter);
            self.counter = self.counter.wrapping_add(1);
            let after = self.bit_at(self.counter);

            if self.enabled() && before && !after {
                self.increment_tima();
            }
        }
    }

    pub fn load_div(&self) -> Byte {
        Byte::new((self.counter >> 8) as u8)
    }

    pub fn store_div(&mut self, ic: &mut InterruptController) {
        let before = self.bit_at(self.counter);
        self.counter = 0;
        if self.enabled() && before {
            self.increment_tima();
        }
    }

    pub fn load_tima(&self) -> Byte {
        self.tima
    }

    pub fn store_tima(&mut self, val: Byte) {
        // A write during the reload-pending window cancels the reload.
        self.state = OverflowState::None;
        self.tima = val;
    }

    pub fn load_tma(&self) -> Byte {
        self.tma
    }

    pub fn store_tma(&mut self, val: Byte) {
        self.tma = val;
    }

    pub fn load_tac(&self) -> Byte {
        self.tac | Byte::new(0xF8)
    }

    pub fn store_tac(&mut self, val: Byte, ic: &mut InterruptController) {
        let before = self.enabled() && self.bit_at(self.counter);
        self.tac = val & Byte::new(0b111);
        let after = self.enabled() && self.bit_at(self.counter);
        if before && !after {
            self.increment_tima();
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn step_m_cycles(timer: &mut Timer, ic: &mut InterruptController, n: u32) {
        for _ in 0..n {
            timer.tick(ic);
        }
    }

    #[test]
    fn div_write_resets_counter_and_can_tick_tima() {
        let mut timer = Timer::default();
        let mut ic = InterruptController::default();
        timer.store_tac(Byte::new(0b101), &mut ic); // enabled, select bit 3
        // Run until bit 3 of the internal counter is set.
        while !timer.bit_at(timer.counter) {
            timer.tick(&mut ic);
        }
        let tima_before = timer.load_tima();
        timer.store_div(&mut ic);
        assert_eq!(timer.load_tima(), tima_before + 1);
        assert_eq!(timer.load_div(), Byte::zero());
    }

    #[test]
    fn tima_overflow_delays_reload_by_one_m_cycle() {
        let mut timer = Timer::default();
        let mut ic = InterruptController::default();
        timer.store_tac(Byte::new(0b101), &mut ic);
        timer.store_tma(Byte::new(0x42));
        timer.tima = Byte::new(0xFF);

        // Force a falling edge manually through direct field access isn't
        // possible from outside; instead, drive the counter until TIMA
        // overflows naturally.
        while timer.tima != Byte::zero() {
            step_m_cycles(&mut timer, &mut ic, 1);
        }
        assert_eq!(timer.load_tima(), Byte::zero());
        assert!(ic.pending().is_none());

        timer.tick(&mut ic);
        assert_eq!(timer.load_tima(), Byte::new(0x42));
        assert_eq!(ic.pending(), Some(Interrupt::Timer));
    }

    #[test]
    fn writing_tima_during_reload_window_cancels_it() {
        let mut timer = Timer::default();
        let mut ic = InterruptController::default();
        timer.store_tac(Byte::new(0b101), &mut ic);
        timer.store_tma(Byte::new(0x42));
        timer.tima = Byte::new(0xFF);

        while timer.tima != Byte::zero() {
            step_m_cycles(&mut timer, &mut ic, 1);
        }

        timer.store_tima(Byte::new(0x99));
        timer.tick(&mut ic);
        assert_eq!(timer.load_tima(), Byte::new(0x99) + 0); // no reload applied
        assert!(ic.pending().is_none());
    }

    #[test]
    fn tac_write_that_clears_the_gated_bit_ticks_tima_once() {
        let mut timer = Timer::default();
        let mut ic = InterruptController::default();
        timer.store_tac(Byte::new(0b101), &mut ic); // enabled, select bit 3
        while !timer.bit_at(timer.counter) {
            timer.tick(&mut ic);
        }
        let tima_before = timer.load_tima();
        // Disabling the timer drops the gated bit from 1 to 0: a falling
        // edge, same as a DIV reset would produce.
        timer.store_tac(Byte::new(0b001), &mut ic);
        assert_eq!(timer.load_tima(), tima_before + 1);
    }

    #[test]
    fn tac_write_that_changes_the_selected_bit_to_zero_ticks_tima_once() {
        let mut timer = Timer::default();
        let mut ic = InterruptController::default();
        timer.store_tac(Byte::new(0b101), &mut ic); // enabled, select bit 3
        // Bit 3 set, bit 5 clear: switching the select from 3 to 5 is a
        // falling edge on the gated signal even though nothing else changed.
        timer.counter = 0b0000_0000_0000_1000;
        let tima_before = timer.load_tima();
        timer.store_tac(Byte::new(0b110), &mut ic); // enabled, select bit 5
        assert_eq!(timer.load_tima(), tima_before + 1);
    }

    #[test]
    fn disabled_timer_never_increments() {
        let mut timer = Timer::default();
        let mut ic = InterruptController::default();
        step_m_cycles(&mut timer, &mut ic, 5000);
        assert_eq!(timer.load_tima(), Byte::zero());
    }
}
