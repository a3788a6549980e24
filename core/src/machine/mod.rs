//! The bus: address decoder, sub-system clock, and owner of every
//! component that hangs off the CPU's memory interface.
//!
//! Per `spec.md` §9's design note, ownership flows one way: `Bus` owns the
//! CPU, the cartridge, and every peripheral; nothing holds a long-lived
//! reference back to anything else. The CPU's instruction interpreter
//! (`instr.rs`) is implemented as methods on `Bus` so it can call `read`/
//! `write` directly, which is what ticks the timer, the OAM-DMA engine and
//! the serial port one M-cycle at a time, in lockstep with CPU execution
//! (`spec.md` §5).

use crate::{
    cartridge::{Cartridge, ConsoleVariant},
    env::{Input, Peripherals},
    log::*,
    mbc::ElapsedTime,
    primitives::{Byte, Memory, Word},
};
use self::{
    apu::Apu,
    cpu::Cpu,
    dma::{Hdma, OamDma},
    input::InputController,
    interrupt::{Interrupt, InterruptController},
    ppu::Ppu,
    serial::Serial,
    timer::Timer,
};

#[macro_use]
mod macros;

pub mod apu;
pub mod cpu;
mod dma;
mod input;
mod instr;
mod interrupt;
pub mod ppu;
mod serial;
mod timer;


/// Work RAM: 2 banks (8 KiB) on the monochrome variant, 8 banks (32 KiB)
/// on Color with bank 0 fixed at 0xC000-0xCFFF and banks 1-7 switchable
/// into 0xD000-0xDFFF (bank register value 0 reads back as bank 1).
const WRAM_BANKS: usize = 8;
const WRAM_BANK_LEN: usize = 0x1000;

pub struct Bus {
    pub cpu: Cpu,
    pub cartridge: Cartridge,
    variant: ConsoleVariant,

    wram: Memory,
    wram_bank: u8,
    hram: Memory,

    pub ppu: Ppu,
    pub apu: Apu,
    timer: Timer,
    interrupt_controller: InterruptController,
    input_controller: InputController,
    serial: Serial,
    oam_dma: OamDma,
    hdma: Hdma,

    /// See `instr.rs`'s handling of `EI`: the instruction immediately
    /// after `EI` must still run with interrupts disabled.
    ime_pending: bool,

    halt: bool,
    /// One-shot "halt bug" latch: the next opcode fetch will not advance
    /// the program counter (`spec.md` §4.1, §8 property 4).
    halt_bug: bool,

    double_speed: bool,
    speed_switch_armed: bool,

    /// Counts M-cycles as they're spent by bus accesses and explicit
    /// internal ticks. `step` reports the delta over a call as the
    /// instruction's cost, so cycle accounting falls out of what the
    /// instruction actually did rather than a static lookup table
    /// (`instr.rs`'s opcode table is a cross-check against this, not the
    /// source of truth).
    m_cycle_counter: u64,
}

impl Bus {
    pub fn new(cartridge: Cartridge) -> Self {
        let variant = cartridge.variant();
        let cpu = if variant.is_color() { Cpu::post_boot_cgb() } else { Cpu::post_boot_dmg() };

        Self {
            cpu,
            cartridge,
            variant,
            wram: Memory::zeroed(Word::new((WRAM_BANKS * WRAM_BANK_LEN) as u16)),
            wram_bank: 1,
            hram: Memory::zeroed(Word::new(0x7F)),
            ppu: Ppu::new(variant),
            apu: Apu::new(variant),
            timer: Timer::default(),
            interrupt_controller: InterruptController::default(),
            input_controller: InputController::default(),
            serial: Serial::new(variant),
            oam_dma: OamDma::default(),
            hdma: Hdma::default(),
            ime_pending: false,
            halt: false,
            halt_bug: false,
            double_speed: false,
            speed_switch_armed: false,
            m_cycle_counter: 0,
        }
    }

    pub fn variant(&self) -> ConsoleVariant {
        self.variant
    }

    pub fn double_speed(&self) -> bool {
        self.double_speed
    }

    /// Resets every piece of mutable state to its post-boot default,
    /// except cartridge RAM (`spec.md` §5: "purges all mutable state
    /// (except cartridge RAM) to post-boot defaults"). The cartridge's
    /// own RAM/RTC contents are untouched; only the rest of the bus is
    /// rebuilt from scratch.
    pub fn reset(&mut self) {
        let variant = self.variant;
        self.cpu = if variant.is_color() { Cpu::post_boot_cgb() } else { Cpu::post_boot_dmg() };
        self.wram = Memory::zeroed(Word::new((WRAM_BANKS * WRAM_BANK_LEN) as u16));
        self.wram_bank = 1;
        self.hram = Memory::zeroed(Word::new(0x7F));
        self.ppu = Ppu::new(variant);
        self.apu = Apu::new(variant);
        self.timer = Timer::default();
        self.interrupt_controller = InterruptController::default();
        self.input_controller = InputController::default();
        self.serial = Serial::new(variant);
        self.oam_dma = OamDma::default();
        self.hdma = Hdma::default();
        self.ime_pending = false;
        self.halt = false;
        self.halt_bug = false;
        self.double_speed = false;
        self.speed_switch_armed = false;
        self.m_cycle_counter = 0;
    }

    pub fn serial_captured(&self) -> &[u8] {
        &self.serial.captured
    }

    pub fn poll_input(&mut self, input: &impl Input) {
        self.input_controller.poll(input, &mut self.interrupt_controller);
    }

    // -- memory decode -------------------------------------------------

    /// Reads a byte and ticks the bus one M-cycle, exactly as a real CPU
    /// memory access does.
    pub fn read(&mut self, addr: Word) -> Byte {
        let val = self.read_no_tick(addr);
        self.tick();
        val
    }

    /// Writes a byte and ticks the bus one M-cycle.
    pub fn write(&mut self, addr: Word, val: Byte) {
        self.write_no_tick(addr, val);
        self.tick();
    }

    /// Reads a byte the way a host-side memory inspector would: no M-cycle
    /// is spent and no hardware side effect (timer, OAM-DMA, serial) fires.
    /// Sees the same address decode as a real CPU access, including the
    /// OAM-DMA lockout window.
    pub fn debug_read(&self, addr: Word) -> Byte {
        self.read_no_tick(addr)
    }

    /// Writes a byte bypassing M-cycle ticking, for host-side memory
    /// editors. Like `debug_read`, goes through the same address decode a
    /// real CPU write would, so it can trip mapper bank-select writes or
    /// hit read-only regions exactly as gameplay would.
    pub fn debug_write(&mut self, addr: Word, val: Byte) {
        self.write_no_tick(addr, val);
    }

    /// Ticks sub-systems that are clocked per-M-cycle but perform no
    /// memory decode of their own: the timer, one OAM-DMA byte, and the
    /// serial shift register. Called once per bus access and once per
    /// "internal" CPU cycle that touches no memory (16-bit arithmetic,
    /// branch-taken penalties, stack-pointer adjustments).
    pub fn tick(&mut self) {
        self.timer.tick(&mut self.interrupt_controller);
        self.serial.tick(&mut self.interrupt_controller);
        self.step_oam_dma();
        self.m_cycle_counter += 1;
    }

    fn step_oam_dma(&mut self) {
        if let Some((src, dst)) = self.oam_dma.step() {
            let byte = self.read_no_tick(src);
            self.ppu.store_oam(dst, byte);
        }
    }

    fn read_no_tick(&self, addr: Word) -> Byte {
        if self.oam_dma.is_active() && !matches!(addr.get(), 0xFF80..=0xFFFE) {
            return Byte::new(0xFF);
        }

        match addr.get() {
            0x0000..=0x7FFF => self.cartridge.load_rom_byte(addr),
            0x8000..=0x9FFF => self.ppu.load_vram(addr),
            0xA000..=0xBFFF => self.cartridge.load_ram_byte(addr - 0xA000u16),
            0xC000..=0xCFFF => self.wram[Word::new(addr.get() - 0xC000)],
            0xD000..=0xDFFF => self.wram[self.wram_addr(addr.get() - 0xD000)],
            0xE000..=0xFDFF => self.read_no_tick(addr - 0x2000u16),
            0xFE00..=0xFE9F => self.ppu.load_oam(addr),
            0xFEA0..=0xFEFF => Byte::new(0xFF),
            0xFF00 => self.input_controller.load_register(),
            0xFF01 => self.serial.load_data(),
            0xFF02 => self.serial.load_control(),
            0xFF04 => self.timer.load_div(),
            0xFF05 => self.timer.load_tima(),
            0xFF06 => self.timer.load_tma(),
            0xFF07 => self.timer.load_tac(),
            0xFF0F => self.interrupt_controller.load_flag(),
            0xFF10..=0xFF3F => self.apu.load_register(addr.get()),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B | 0xFF4F | 0xFF68..=0xFF6B => {
                self.ppu.load_register(addr.get())
            }
            0xFF4D if self.variant.is_color() => Byte::new(
                0x7E | ((self.double_speed as u8) << 7) | (self.speed_switch_armed as u8),
            ),
            0xFF55 if self.variant.is_color() => self.hdma.status(),
            0xFF70 if self.variant.is_color() => Byte::new(self.wram_bank | 0xF8),
            0xFF80..=0xFFFE => self.hram[Word::new(addr.get() - 0xFF80)],
            0xFFFF => self.interrupt_controller.load_enable(),
            _ => Byte::new(0xFF),
        }
    }

    fn write_no_tick(&mut self, addr: Word, val: Byte) {
        if self.oam_dma.is_active() && !matches!(addr.get(), 0xFF80..=0xFFFE) {
            return;
        }

        match addr.get() {
            0x0000..=0x7FFF => self.cartridge.store_rom_byte(addr, val),
            0x8000..=0x9FFF => self.ppu.store_vram(addr, val),
            0xA000..=0xBFFF => self.cartridge.store_ram_byte(addr - 0xA000u16, val),
            0xC000..=0xCFFF => self.wram[Word::new(addr.get() - 0xC000)] = val,
            0xD000..=0xDFFF => {
                let idx = self.wram_addr(addr.get() - 0xD000);
                self.wram[idx] = val;
            }
            0xE000..=0xFDFF => self.write_no_tick(addr - 0x2000u16, val),
            0xFE00..=0xFE9F => self.ppu.store_oam(addr, val),
            0xFEA0..=0xFEFF => trace!("write to unusable range {}", addr),
            0xFF00 => self.input_controller.store_register(val),
            0xFF01 => self.serial.store_data(val),
            0xFF02 => self.serial.store_control(val),
            0xFF04 => self.timer.store_div(&mut self.interrupt_controller),
            0xFF05 => self.timer.store_tima(val),
            0xFF06 => self.timer.store_tma(val),
            0xFF07 => self.timer.store_tac(val, &mut self.interrupt_controller),
            0xFF0F => self.interrupt_controller.store_flag(val),
            0xFF10..=0xFF3F => self.apu.store_register(addr.get(), val),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B | 0xFF4F | 0xFF68..=0xFF6B => {
                self.ppu.store_register(addr.get(), val, &mut self.interrupt_controller)
            }
            0xFF46 => self.oam_dma.start(val),
            0xFF4D if self.variant.is_color() => self.speed_switch_armed = val.bit(0),
            0xFF51 if self.variant.is_color() => self.hdma.set_source_high(val),
            0xFF52 if self.variant.is_color() => self.hdma.set_source_low(val),
            0xFF53 if self.variant.is_color() => self.hdma.set_dest_high(val),
            0xFF54 if self.variant.is_color() => self.hdma.set_dest_low(val),
            0xFF55 if self.variant.is_color() => {
                self.hdma.start(val);
                let pairs = self.hdma.drain_general_purpose();
                // General-purpose HDMA steals 8 M-cycles per 0x10-byte
                // block in single speed, 4 in double speed (`spec.md`
                // §9's "steal the appropriate number of M-cycles").
                let cycles_per_block = if self.double_speed { 4 } else { 8 };
                for _ in 0..(pairs.len() / 0x10) * cycles_per_block {
                    self.tick();
                }
                for (src, dst) in pairs {
                    let byte = self.read_no_tick(src);
                    self.ppu.store_vram(dst, byte);
                }
            }
            0xFF70 if self.variant.is_color() => self.wram_bank = (val.get() & 0x07).max(1),
            0xFF80..=0xFFFE => self.hram[Word::new(addr.get() - 0xFF80)] = val,
            0xFFFF => self.interrupt_controller.store_enable(val),
            _ => {}
        }
    }

    fn wram_addr(&self, offset_in_bank: u16) -> Word {
        let bank = if self.variant.is_color() { self.wram_bank.max(1) } else { 1 } as u16;
        Word::new(bank * WRAM_BANK_LEN as u16 + offset_in_bank)
    }

    // -- frame-level advance --------------------------------------------

    /// Advances the PPU and APU by the given number of T-cycles and
    /// performs one H-Blank HDMA block if one is armed and a HBlank entry
    /// occurred this step. Called by the frame driver after every CPU
    /// step with the T-cycles that step consumed (`spec.md` §4.6).
    pub fn advance_video_audio(&mut self, t_cycles: u32, peripherals: &mut impl Peripherals) {
        let was_hblank = self.ppu.mode_is_hblank();
        self.ppu.advance(t_cycles, &mut self.interrupt_controller);
        self.apu.advance(t_cycles, peripherals.sound());

        if !was_hblank && self.ppu.mode_is_hblank() && self.hdma.is_hblank_active() {
            for (src, dst) in self.hdma.step_hblank_block() {
                let byte = self.read_no_tick(src);
                self.ppu.store_vram(dst, byte);
            }
        }

        if self.ppu.take_frame_ready() {
            peripherals.display().present_frame(self.ppu.framebuffer());
        }
    }

    pub fn tick_mbc_clock(&mut self, elapsed: ElapsedTime) {
        self.cartridge.tick(elapsed);
    }

    // -- interrupts -------------------------------------------------------

    /// Runs one CPU step: if halted, either consumes one no-op M-cycle or
    /// wakes up; otherwise dispatches a pending interrupt if IME allows it,
    /// else fetches and executes the next instruction. Returns the number
    /// of M-cycles consumed.
    pub fn step(&mut self) -> u8 {
        let start = self.m_cycle_counter;

        if self.halt {
            if self.interrupt_controller.pending().is_some() {
                self.halt = false;
            } else {
                self.tick();
                return (self.m_cycle_counter - start) as u8;
            }
        }

        if self.interrupt_controller.to_dispatch().is_some() {
            self.dispatch_interrupt();
            return (self.m_cycle_counter - start) as u8;
        }

        let enable_ime_after = self.ime_pending;
        self.ime_pending = false;
        self.execute_one_instruction();
        if enable_ime_after {
            self.interrupt_controller.ime = true;
        }
        (self.m_cycle_counter - start) as u8
    }

    pub(crate) fn request_ei(&mut self) {
        self.ime_pending = true;
    }

    pub(crate) fn request_halt(&mut self) {
        if !self.interrupt_controller.ime && self.interrupt_controller.pending().is_some() {
            self.halt_bug = true;
        } else {
            self.halt = true;
        }
    }

    /// Dispatches the highest-priority pending interrupt: two internal
    /// delay cycles, a push of the current PC (two more, one per byte),
    /// then a final cycle as PC loads the vector address — five M-cycles
    /// in total (`spec.md` §4.1).
    fn dispatch_interrupt(&mut self) {
        let interrupt = self.interrupt_controller.pending().expect("to_dispatch implies pending");
        self.interrupt_controller.ime = false;
        self.interrupt_controller.clear(interrupt);

        self.tick();
        self.tick();
        self.push(self.cpu.pc);
        self.cpu.pc = interrupt.vector();
        self.tick();
    }

    // -- save state -------------------------------------------------------

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.cpu.a.get(), self.cpu.f.get(), self.cpu.b.get(), self.cpu.c.get()]);
        out.extend_from_slice(&[self.cpu.d.get(), self.cpu.e.get(), self.cpu.h.get(), self.cpu.l.get()]);
        out.extend_from_slice(&self.cpu.sp.get().to_le_bytes());
        out.extend_from_slice(&self.cpu.pc.get().to_le_bytes());
        out.push(self.interrupt_controller.ime as u8);
        out.push(self.halt as u8);
        out.push(self.halt_bug as u8);
        out.push(self.ime_pending as u8);
        out.push(self.double_speed as u8);
        out.push(self.wram_bank);
        out.extend_from_slice(&self.wram.as_raw_bytes());
        out.extend_from_slice(&self.hram.as_raw_bytes());
        out.push(self.interrupt_controller.load_enable().get());
        out.push(self.interrupt_controller.load_flag().get());
        self.ppu.serialize(out);
        self.apu.serialize(out);
    }

    pub fn deserialize(&mut self, bytes: &mut std::io::Cursor<&[u8]>) -> Result<(), String> {
        use std::io::Read;

        let mut regs = [0u8; 8];
        bytes.read_exact(&mut regs).map_err(|e| e.to_string())?;
        self.cpu.a = Byte::new(regs[0]);
        self.cpu.set_af(Word::from_bytes(Byte::new(regs[1]), self.cpu.a));
        self.cpu.b = Byte::new(regs[2]);
        self.cpu.c = Byte::new(regs[3]);
        self.cpu.d = Byte::new(regs[4]);
        self.cpu.e = Byte::new(regs[5]);
        self.cpu.h = Byte::new(regs[6]);
        self.cpu.l = Byte::new(regs[7]);

        let mut word = [0u8; 2];
        bytes.read_exact(&mut word).map_err(|e| e.to_string())?;
        self.cpu.sp = Word::new(u16::from_le_bytes(word));
        bytes.read_exact(&mut word).map_err(|e| e.to_string())?;
        self.cpu.pc = Word::new(u16::from_le_bytes(word));

        let mut flags = [0u8; 6];
        bytes.read_exact(&mut flags).map_err(|e| e.to_string())?;
        self.interrupt_controller.ime = flags[0] != 0;
        self.halt = flags[1] != 0;
        self.halt_bug = flags[2] != 0;
        self.ime_pending = flags[3] != 0;
        self.double_speed = flags[4] != 0;
        self.wram_bank = flags[5];

        let mut wram = vec![0u8; self.wram.len().get() as usize];
        bytes.read_exact(&mut wram).map_err(|e| e.to_string())?;
        self.wram.fill_from_raw_bytes(&wram);

        let mut hram = vec![0u8; self.hram.len().get() as usize];
        bytes.read_exact(&mut hram).map_err(|e| e.to_string())?;
        self.hram.fill_from_raw_bytes(&hram);

        let mut ie_if = [0u8; 2];
        bytes.read_exact(&mut ie_if).map_err(|e| e.to_string())?;
        self.interrupt_controller.store_enable(Byte::new(ie_if[0]));
        self.interrupt_controller.store_flag(Byte::new(ie_if[1]));

        self.ppu.deserialize(bytes)?;
        self.apu.deserialize(bytes)?;

        Ok(())
    }
}
