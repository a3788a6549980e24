//! The SM83 instruction interpreter.
//!
//! Every opcode is implemented as ordinary bus accesses (`self.read`/
//! `self.write`) plus, where real hardware spends a cycle doing nothing a
//! memory access would otherwise account for, an explicit `self.tick()`.
//! M-cycle cost is never hand-totalled per opcode: `Bus::step` reports
//! however many M-cycles actually elapsed while this ran. The handful of
//! combinatorial opcode blocks (`LD r,r'`, ALU `A,r`, `INC`/`DEC r`, and
//! the entire CB-prefixed table) are implemented once via a 3-bit
//! register index rather than 8 or 64 near-identical match arms.

use crate::primitives::{Byte, Word};
use super::macros::set_flags;
use super::Bus;


/// Register-index encoding shared by `LD r,r'`, ALU `A,r`, `INC`/`DEC r`,
/// and the CB-prefixed table: 0=B 1=C 2=D 3=E 4=H 5=L 6=(HL) 7=A.
impl Bus {
    fn reg8_get(&mut self, idx: u8) -> Byte {
        match idx {
            0 => self.cpu.b,
            1 => self.cpu.c,
            2 => self.cpu.d,
            3 => self.cpu.e,
            4 => self.cpu.h,
            5 => self.cpu.l,
            6 => self.read(self.cpu.hl()),
            7 => self.cpu.a,
            _ => unreachable!(),
        }
    }

    fn reg8_set(&mut self, idx: u8, val: Byte) {
        match idx {
            0 => self.cpu.b = val,
            1 => self.cpu.c = val,
            2 => self.cpu.d = val,
            3 => self.cpu.e = val,
            4 => self.cpu.h = val,
            5 => self.cpu.l = val,
            6 => { let hl = self.cpu.hl(); self.write(hl, val); }
            7 => self.cpu.a = val,
            _ => unreachable!(),
        }
    }

    /// `dd`/`ss` register-pair encoding: 0=BC 1=DE 2=HL 3=SP.
    fn rp_get(&self, idx: u8) -> Word {
        match idx {
            0 => self.cpu.bc(),
            1 => self.cpu.de(),
            2 => self.cpu.hl(),
            3 => self.cpu.sp,
            _ => unreachable!(),
        }
    }

    fn rp_set(&mut self, idx: u8, val: Word) {
        match idx {
            0 => self.cpu.set_bc(val),
            1 => self.cpu.set_de(val),
            2 => self.cpu.set_hl(val),
            3 => self.cpu.sp = val,
            _ => unreachable!(),
        }
    }

    /// `qq` register-pair encoding for `PUSH`/`POP`: 0=BC 1=DE 2=HL 3=AF.
    fn qq_get(&self, idx: u8) -> Word {
        match idx {
            0 => self.cpu.bc(),
            1 => self.cpu.de(),
            2 => self.cpu.hl(),
            3 => self.cpu.af(),
            _ => unreachable!(),
        }
    }

    fn qq_set(&mut self, idx: u8, val: Word) {
        match idx {
            0 => self.cpu.set_bc(val),
            1 => self.cpu.set_de(val),
            2 => self.cpu.set_hl(val),
            3 => self.cpu.set_af(val),
            _ => unreachable!(),
        }
    }

    /// `cc` condition encoding: 0=NZ 1=Z 2=NC 3=C.
    fn condition(&self, idx: u8) -> bool {
        match idx {
            0 => !self.cpu.zero(),
            1 => self.cpu.zero(),
            2 => !self.cpu.carry(),
            3 => self.cpu.carry(),
            _ => unreachable!(),
        }
    }

    fn fetch_opcode(&mut self) -> Byte {
        let pc = self.cpu.pc;
        let op = self.read(pc);
        if self.halt_bug {
            // The one-shot HALT bug: PC does not advance past this fetch
            // the single time it fires (`spec.md` §8 property 4).
            self.halt_bug = false;
        } else {
            self.cpu.pc = pc + 1u16;
        }
        op
    }

    fn fetch_byte(&mut self) -> Byte {
        let pc = self.cpu.pc;
        let b = self.read(pc);
        self.cpu.pc = pc + 1u16;
        b
    }

    fn fetch_word(&mut self) -> Word {
        let lsb = self.fetch_byte();
        let msb = self.fetch_byte();
        Word::from_bytes(lsb, msb)
    }

    fn jr(&mut self, offset: i8) {
        self.cpu.pc = self.cpu.pc + offset;
        self.tick();
    }

    // -- ALU helpers -----------------------------------------------------

    fn alu_inc(&mut self, idx: u8) {
        let mut v = self.reg8_get(idx);
        let half_carry = (v.get() & 0x0F) == 0x0F;
        v += 1u8;
        self.reg8_set(idx, v);
        set_flags!(self.cpu, z = v == Byte::zero(), n = false, h = half_carry, c = _);
    }

    fn alu_dec(&mut self, idx: u8) {
        let mut v = self.reg8_get(idx);
        let half_carry = (v.get() & 0x0F) == 0x00;
        v -= 1u8;
        self.reg8_set(idx, v);
        set_flags!(self.cpu, z = v == Byte::zero(), n = true, h = half_carry, c = _);
    }

    /// `op_idx` selects ADD/ADC/SUB/SBC/AND/XOR/OR/CP, in that order —
    /// the ALU block's own 3-bit encoding.
    fn alu_op(&mut self, op_idx: u8, rhs: Byte) {
        let mut a = self.cpu.a;
        match op_idx {
            0 => {
                let (c, h) = a.add_with_carries(rhs);
                set_flags!(self.cpu, z = a == Byte::zero(), n = false, h = h, c = c);
                self.cpu.a = a;
            }
            1 => {
                let (c, h) = a.full_add_with_carries(rhs, self.cpu.carry());
                set_flags!(self.cpu, z = a == Byte::zero(), n = false, h = h, c = c);
                self.cpu.a = a;
            }
            2 => {
                let (c, h) = a.sub_with_carries(rhs);
                set_flags!(self.cpu, z = a == Byte::zero(), n = true, h = h, c = c);
                self.cpu.a = a;
            }
            3 => {
                let (c, h) = a.full_sub_with_carries(rhs, self.cpu.carry());
                set_flags!(self.cpu, z = a == Byte::zero(), n = true, h = h, c = c);
                self.cpu.a = a;
            }
            4 => {
                a &= rhs;
                set_flags!(self.cpu, z = a == Byte::zero(), n = false, h = true, c = false);
                self.cpu.a = a;
            }
            5 => {
                a ^= rhs;
                set_flags!(self.cpu, z = a == Byte::zero(), n = false, h = false, c = false);
                self.cpu.a = a;
            }
            6 => {
                a |= rhs;
                set_flags!(self.cpu, z = a == Byte::zero(), n = false, h = false, c = false);
                self.cpu.a = a;
            }
            7 => {
                // CP: same as SUB but the result is discarded.
                let (c, h) = a.sub_with_carries(rhs);
                set_flags!(self.cpu, z = a == Byte::zero(), n = true, h = h, c = c);
            }
            _ => unreachable!(),
        }
    }

    fn push(&mut self, word: Word) {
        let (lsb, msb) = word.into_bytes();
        self.cpu.sp -= 2;
        self.write(self.cpu.sp + 1u16, msb);
        self.write(self.cpu.sp, lsb);
    }

    fn pop(&mut self) -> Word {
        let lsb = self.read(self.cpu.sp);
        let msb = self.read(self.cpu.sp + 1u16);
        self.cpu.sp += 2;
        Word::from_bytes(lsb, msb)
    }

    // -- CPU-facing entry points -----------------------------------------

    /// Switches clock speed if a `STOP` follows an armed `KEY1` write
    /// (Color only); otherwise behaves as a (mostly unused) low-power
    /// halt with no wake condition modeled beyond the opcode boundary.
    fn execute_stop(&mut self) {
        if self.variant.is_color() && self.speed_switch_armed {
            self.double_speed = !self.double_speed;
            self.speed_switch_armed = false;
        }
        // The byte after STOP is a mandatory padding byte on real
        // hardware; we still fetch it so PC lands in the right place.
        self.fetch_byte();
    }

    pub(super) fn execute_one_instruction(&mut self) {
        let op = self.fetch_opcode();

        match op.get() {
            0x00 => {}

            0x01 | 0x11 | 0x21 | 0x31 => {
                let idx = (op.get() >> 4) & 0x03;
                let val = self.fetch_word();
                self.rp_set(idx, val);
            }

            0x02 => { let addr = self.cpu.bc(); self.write(addr, self.cpu.a); }
            0x12 => { let addr = self.cpu.de(); self.write(addr, self.cpu.a); }
            0x0A => { let addr = self.cpu.bc(); self.cpu.a = self.read(addr); }
            0x1A => { let addr = self.cpu.de(); self.cpu.a = self.read(addr); }

            0x22 => {
                let hl = self.cpu.hl();
                self.write(hl, self.cpu.a);
                self.cpu.set_hl(hl + 1u16);
            }
            0x32 => {
                let hl = self.cpu.hl();
                self.write(hl, self.cpu.a);
                self.cpu.set_hl(hl - 1u16);
            }
            0x2A => {
                let hl = self.cpu.hl();
                self.cpu.a = self.read(hl);
                self.cpu.set_hl(hl + 1u16);
            }
            0x3A => {
                let hl = self.cpu.hl();
                self.cpu.a = self.read(hl);
                self.cpu.set_hl(hl - 1u16);
            }

            0x03 | 0x13 | 0x23 | 0x33 => {
                let idx = (op.get() >> 4) & 3;
                let v = self.rp_get(idx);
                self.rp_set(idx, v + 1u16);
                self.tick();
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let idx = (op.get() >> 4) & 3;
                let v = self.rp_get(idx);
                self.rp_set(idx, v - 1u16);
                self.tick();
            }

            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                self.alu_inc((op.get() >> 3) & 7);
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                self.alu_dec((op.get() >> 3) & 7);
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let idx = (op.get() >> 3) & 7;
                let d = self.fetch_byte();
                self.reg8_set(idx, d);
            }

            0x07 => {
                let mut a = self.cpu.a;
                let c = a.rotate_left();
                self.cpu.a = a;
                set_flags!(self.cpu, z = false, n = false, h = false, c = c);
            }
            0x0F => {
                let mut a = self.cpu.a;
                let c = a.rotate_right();
                self.cpu.a = a;
                set_flags!(self.cpu, z = false, n = false, h = false, c = c);
            }
            0x17 => {
                let mut a = self.cpu.a;
                let c = a.rotate_left_through_carry(self.cpu.carry());
                self.cpu.a = a;
                set_flags!(self.cpu, z = false, n = false, h = false, c = c);
            }
            0x1F => {
                let mut a = self.cpu.a;
                let c = a.rotate_right_through_carry(self.cpu.carry());
                self.cpu.a = a;
                set_flags!(self.cpu, z = false, n = false, h = false, c = c);
            }

            0x08 => {
                let addr = self.fetch_word();
                let (lsb, msb) = self.cpu.sp.into_bytes();
                self.write(addr, lsb);
                self.write(addr + 1u16, msb);
            }

            0x09 | 0x19 | 0x29 | 0x39 => {
                let idx = (op.get() >> 4) & 3;
                let rhs = self.rp_get(idx);
                let mut hl = self.cpu.hl();
                let (c, h) = hl.add_with_carries(rhs);
                self.cpu.set_hl(hl);
                set_flags!(self.cpu, z = _, n = false, h = h, c = c);
                self.tick();
            }

            0x10 => self.execute_stop(),

            0x18 => {
                let offset = self.fetch_byte().get() as i8;
                self.jr(offset);
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch_byte().get() as i8;
                let idx = (op.get() >> 3) & 3;
                if self.condition(idx) {
                    self.jr(offset);
                }
            }

            0x76 => self.request_halt(),

            0x40..=0x7F => {
                let dst = (op.get() >> 3) & 7;
                let src = op.get() & 7;
                let v = self.reg8_get(src);
                self.reg8_set(dst, v);
            }

            0x80..=0xBF => {
                let src_idx = op.get() & 7;
                let op_idx = (op.get() >> 3) & 7;
                let v = self.reg8_get(src_idx);
                self.alu_op(op_idx, v);
            }

            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                let idx = (op.get() >> 3) & 3;
                self.tick();
                if self.condition(idx) {
                    let addr = self.pop();
                    self.cpu.pc = addr;
                    self.tick();
                }
            }
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let idx = (op.get() >> 4) & 3;
                let v = self.pop();
                self.qq_set(idx, v);
            }
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let idx = (op.get() >> 4) & 3;
                self.tick();
                let v = self.qq_get(idx);
                self.push(v);
            }

            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let addr = self.fetch_word();
                let idx = (op.get() >> 3) & 3;
                if self.condition(idx) {
                    self.cpu.pc = addr;
                    self.tick();
                }
            }
            0xC3 => {
                let addr = self.fetch_word();
                self.cpu.pc = addr;
                self.tick();
            }

            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let addr = self.fetch_word();
                let idx = (op.get() >> 3) & 3;
                if self.condition(idx) {
                    self.tick();
                    self.push(self.cpu.pc);
                    self.cpu.pc = addr;
                }
            }
            0xCD => {
                let addr = self.fetch_word();
                self.tick();
                self.push(self.cpu.pc);
                self.cpu.pc = addr;
            }

            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let op_idx = (op.get() >> 3) & 7;
                let d = self.fetch_byte();
                self.alu_op(op_idx, d);
            }

            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let idx = (op.get() >> 3) & 7;
                self.tick();
                self.push(self.cpu.pc);
                self.cpu.pc = Word::new(idx as u16 * 8);
            }

            0xC9 => {
                let addr = self.pop();
                self.cpu.pc = addr;
                self.tick();
            }
            0xD9 => {
                let addr = self.pop();
                self.cpu.pc = addr;
                self.interrupt_controller.ime = true;
                self.tick();
            }

            0xCB => self.execute_cb_prefixed(),

            0xE0 => {
                let offset = self.fetch_byte();
                let addr = Word::new(0xFF00 + offset.get() as u16);
                self.write(addr, self.cpu.a);
            }
            0xF0 => {
                let offset = self.fetch_byte();
                let addr = Word::new(0xFF00 + offset.get() as u16);
                self.cpu.a = self.read(addr);
            }
            0xE2 => {
                let addr = Word::new(0xFF00 + self.cpu.c.get() as u16);
                self.write(addr, self.cpu.a);
            }
            0xF2 => {
                let addr = Word::new(0xFF00 + self.cpu.c.get() as u16);
                self.cpu.a = self.read(addr);
            }

            0xE8 => {
                let offset = self.fetch_byte().get() as i8;
                let mut sp = self.cpu.sp;
                let (c, h) = sp.add_i8_with_carries(offset);
                self.cpu.sp = sp;
                set_flags!(self.cpu, z = false, n = false, h = h, c = c);
                self.tick();
                self.tick();
            }
            0xF8 => {
                let offset = self.fetch_byte().get() as i8;
                let mut sp = self.cpu.sp;
                let (c, h) = sp.add_i8_with_carries(offset);
                self.cpu.set_hl(sp);
                set_flags!(self.cpu, z = false, n = false, h = h, c = c);
                self.tick();
            }
            0xF9 => {
                self.cpu.sp = self.cpu.hl();
                self.tick();
            }

            0xE9 => self.cpu.pc = self.cpu.hl(),

            0xEA => {
                let addr = self.fetch_word();
                self.write(addr, self.cpu.a);
            }
            0xFA => {
                let addr = self.fetch_word();
                self.cpu.a = self.read(addr);
            }

            0xF3 => self.interrupt_controller.ime = false,
            0xFB => self.request_ei(),

            0x27 => self.cpu.daa(),
            0x2F => {
                self.cpu.a = !self.cpu.a;
                set_flags!(self.cpu, z = _, n = true, h = true, c = _);
            }
            0x37 => set_flags!(self.cpu, z = _, n = false, h = false, c = true),
            0x3F => {
                let c = self.cpu.carry();
                set_flags!(self.cpu, z = _, n = false, h = false, c = !c);
            }

            // Undefined opcodes: real hardware locks up; we log and treat
            // as a one-byte no-op so a misbehaving ROM doesn't wedge the
            // whole emulator (`spec.md` §7).
            0xD3 | 0xDB | 0xDD | 0xE3 | 0xE4 | 0xEB | 0xEC | 0xED | 0xF4 | 0xFC | 0xFD => {
                crate::log::warn!("executed undefined opcode {:#04x} at {}", op.get(), self.cpu.pc - 1u16);
            }

            _ => unreachable!("opcode {:#04x} should have matched one of the blocks above", op.get()),
        }
    }

    /// The CB-prefixed table: rotates/shifts (0x00-0x3F), `BIT` (0x40-0x7F),
    /// `RES` (0x80-0xBF), `SET` (0xC0-0xFF), each over the same 3-bit
    /// register index used by the primary table's combinatorial blocks.
    fn execute_cb_prefixed(&mut self) {
        let op = self.fetch_byte();
        let reg_idx = op.get() & 7;
        let bit = (op.get() >> 3) & 7;

        match op.get() {
            0x00..=0x3F => {
                let mut v = self.reg8_get(reg_idx);
                let carry_out = match (op.get() >> 3) & 7 {
                    0 => v.rotate_left(),
                    1 => v.rotate_right(),
                    2 => v.rotate_left_through_carry(self.cpu.carry()),
                    3 => v.rotate_right_through_carry(self.cpu.carry()),
                    4 => v.shift_left(),
                    5 => v.arithmetic_shift_right(),
                    6 => { v = v.swap_nybbles(); false }
                    7 => v.shift_right(),
                    _ => unreachable!(),
                };
                let zero = v == Byte::zero();
                self.reg8_set(reg_idx, v);
                if (op.get() >> 3) & 7 == 6 {
                    set_flags!(self.cpu, z = zero, n = false, h = false, c = false);
                } else {
                    set_flags!(self.cpu, z = zero, n = false, h = false, c = carry_out);
                }
            }
            0x40..=0x7F => {
                let v = self.reg8_get(reg_idx);
                set_flags!(self.cpu, z = !v.bit(bit), n = false, h = true, c = _);
            }
            0x80..=0xBF => {
                let v = self.reg8_get(reg_idx);
                self.reg8_set(reg_idx, v.with_bit(bit, false));
            }
            0xC0..=0xFF => {
                let v = self.reg8_get(reg_idx);
                self.reg8_set(reg_idx, v.with_bit(bit, true));
            }
        }
    }
}
