//! The serial port (0xFF01/0xFF02).
//!
//! No link cable peer is modeled: a transfer with no external clock shifts
//! in `0xFF` from the (absent) peer and completes after the shift register
//! has emptied, firing the Serial interrupt exactly as real hardware does
//! when nothing is plugged in. This is also what the `S1` scenario in
//! `spec.md` §8 relies on: test ROMs print over serial one byte at a time
//! and read the transfer-complete interrupt to know when to send the next.

use crate::cartridge::ConsoleVariant;
use crate::primitives::Byte;
use super::interrupt::{Interrupt, InterruptController};


/// Bus-access-granularity divisor for the internal shift clock: 8192 Hz in
/// normal speed, matching the bit-banged "normal" serial clock.
const T_CYCLES_PER_BIT_NORMAL: u32 = 512;

/// Color-only "fast mode" divisor, selected by `SC` bit 1: roughly 262144 Hz,
/// 8x the normal-speed clock. Inter-peer arbitration at this rate is still
/// unspecified (`spec.md` §9's open question) — only the clock-divisor
/// difference itself is modeled.
const T_CYCLES_PER_BIT_FAST: u32 = 64;

#[derive(Debug, Clone)]
pub struct Serial {
    is_color: bool,
    data: Byte,
    transfer_enabled: bool,
    internal_clock: bool,
    fast_mode: bool,
    bits_remaining: u8,
    cycle_accumulator: u32,
    /// Bytes shifted all the way out, captured for host/test inspection
    /// (Blargg-style test ROMs print their results this way).
    pub captured: Vec<u8>,
}

impl Default for Serial {
    fn default() -> Self {
        Self::new(ConsoleVariant::NonCgb)
    }
}

impl Serial {
    pub fn new(variant: ConsoleVariant) -> Self {
        Self {
            is_color: variant.is_color(),
            data: Byte::zero(),
            transfer_enabled: false,
            internal_clock: false,
            fast_mode: false,
            bits_remaining: 0,
            cycle_accumulator: 0,
            captured: Vec::new(),
        }
    }

    pub fn load_data(&self) -> Byte {
        self.data
    }

    pub fn store_data(&mut self, val: Byte) {
        self.data = val;
    }

    pub fn load_control(&self) -> Byte {
        let mut b = if self.is_color { 0x7Cu8 } else { 0x7Eu8 };
        if self.transfer_enabled { b |= 0b1000_0000; }
        if self.is_color && self.fast_mode { b |= 0b0000_0010; }
        if self.internal_clock { b |= 0b0000_0001; }
        Byte::new(b)
    }

    pub fn store_control(&mut self, val: Byte) {
        self.internal_clock = val.get() & 0b0000_0001 != 0;
        if self.is_color {
            self.fast_mode = val.get() & 0b0000_0010 != 0;
        }

        let starting = val.get() & 0b1000_0000 != 0;
        if starting && !self.transfer_enabled && self.internal_clock {
            self.transfer_enabled = true;
            self.bits_remaining = 8;
            self.cycle_accumulator = 0;
        } else if !starting {
            self.transfer_enabled = false;
        }
    }

    fn t_cycles_per_bit(&self) -> u32 {
        if self.is_color && self.fast_mode { T_CYCLES_PER_BIT_FAST } else { T_CYCLES_PER_BIT_NORMAL }
    }

    /// Advances by one M-cycle (four T-cycles); only progresses while a
    /// transfer using the internal clock is active (an externally clocked
    /// transfer never completes without a peer).
    pub fn tick(&mut self, ic: &mut InterruptController) {
        if !self.transfer_enabled {
            return;
        }

        let divisor = self.t_cycles_per_bit();
        self.cycle_accumulator += 4;
        while self.cycle_accumulator >= divisor && self.transfer_enabled {
            self.cycle_accumulator -= divisor;
            self.data = (self.data << 1) | Byte::new(1); // peer line reads as 1 (idle)
            self.bits_remaining -= 1;

            if self.bits_remaining == 0 {
                self.transfer_enabled = false;
                self.captured.push(self.data.get());
                ic.request(Interrupt::Serial);
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn internal_clock_transfer_completes_and_fires_interrupt() {
        let mut serial = Serial::default();
        let mut ic = InterruptController::default();
        serial.store_data(Byte::new(0x00));
        serial.store_control(Byte::new(0b1000_0001));

        for _ in 0..(T_CYCLES_PER_BIT_NORMAL / 4 * 8 + 1) {
            serial.tick(&mut ic);
        }

        assert_eq!(ic.pending(), None); // Serial not enabled in IE
        assert_eq!(serial.captured, vec![0xFF]);
    }

    #[test]
    fn external_clock_transfer_never_completes_without_a_peer() {
        let mut serial = Serial::default();
        let mut ic = InterruptController::default();
        serial.store_control(Byte::new(0b1000_0000)); // start, external clock
        for _ in 0..10_000 {
            serial.tick(&mut ic);
        }
        assert!(serial.captured.is_empty());
    }

    #[test]
    fn color_fast_mode_shifts_eight_times_faster() {
        let mut serial = Serial::new(ConsoleVariant::CgbOnly);
        let mut ic = InterruptController::default();
        serial.store_data(Byte::new(0x00));
        serial.store_control(Byte::new(0b1000_0011)); // start, fast mode, internal clock

        for _ in 0..(T_CYCLES_PER_BIT_FAST / 4 * 8 + 1) {
            serial.tick(&mut ic);
        }

        assert_eq!(serial.captured, vec![0xFF]);
    }

    #[test]
    fn monochrome_ignores_fast_mode_bit() {
        let mut serial = Serial::new(ConsoleVariant::NonCgb);
        serial.store_control(Byte::new(0b0000_0010));
        assert!(!serial.fast_mode);
        assert_eq!(serial.load_control().get() & 0b0000_0010, 0);
    }
}
