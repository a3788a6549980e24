//! A cycle-accurate handheld 8-bit console core, exposed through a single
//! stable host contract: `Console`.
//!
//! The core never assumes a windowing system, an audio device, a file
//! system or a wall clock. Everything a host needs to drive it — input,
//! frame pacing, save-state blobs, battery RAM — crosses through the
//! methods on `Console`; nothing else in this crate is meant to be held
//! onto by a host across frames.

pub mod cartridge;
pub mod debug;
pub mod env;
pub mod log;
pub mod machine;
pub mod mbc;
pub mod primitives;

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::io::Cursor;

use cartridge::{Cartridge, ConsoleVariant};
use env::{Button, Display, Input, NullDisplay, NullInput, Peripherals, Sound, ALL_BUTTONS};
use machine::Bus;
use machine::ppu::{SCREEN_HEIGHT, SCREEN_WIDTH};
use mbc::ElapsedTime;
use primitives::{rgba_slice_as_bytes, Rgba, CLOCK_RATE_HZ, M_CYCLES_PER_FRAME, NATIVE_FRAME_RATE};

/// Prefix every save-state blob carries ahead of the serialized bus state,
/// so a blob from a foreign build or an unrelated file is rejected instead
/// of silently misinterpreted.
const SAVE_STATE_MAGIC: &[u8; 4] = b"PKT1";
const SAVE_STATE_VERSION: u8 = 1;

/// The core's small error surface. Every other host operation either always
/// succeeds or, per hardware, has no failure mode to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The cartridge image was too short for a header, or named an MBC
    /// type code this build does not implement.
    InvalidCartridge(String),
    /// `load_state` was handed a blob that does not match this build's
    /// magic, version, or serialized length.
    SaveStateFormatMismatch,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidCartridge(reason) => write!(f, "invalid cartridge: {}", reason),
            CoreError::SaveStateFormatMismatch => write!(f, "save state format mismatch"),
        }
    }
}

impl Error for CoreError {}

/// Static facts about the currently loaded cartridge (or the core's
/// defaults when none is loaded), per `spec.md` §6's `info()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    pub name: String,
    pub variant: ConsoleVariant,
    pub native_frame_rate: f64,
    pub clock_rate_hz: u64,
    /// Optional capabilities a host may probe for before relying on them,
    /// per `spec.md` §6. Fixed for this build rather than cartridge-
    /// dependent: a host shouldn't need a cartridge loaded to ask.
    pub supported_extensions: &'static [&'static str],
}

/// `Info::supported_extensions` for every build of this core: the set of
/// host-facing capabilities beyond the baseline CPU/PPU/APU/MBC model.
const SUPPORTED_EXTENSIONS: &[&str] = &["save-state", "hdma", "audio-callback", "debug-memory-access"];

/// Adapts the host's button bitfield (`spec.md` §6: bit0=A, bit1=B, bit6=
/// Start, bit7=Select, bit8=Up, bit9=Down, bit10=Left, bit11=Right) to the
/// `Input` trait the bus polls once per frame.
struct ButtonBits(u16);

impl ButtonBits {
    fn bit_for(button: Button) -> u32 {
        match button {
            Button::A => 0,
            Button::B => 1,
            Button::Start => 6,
            Button::Select => 7,
            Button::Up => 8,
            Button::Down => 9,
            Button::Left => 10,
            Button::Right => 11,
        }
    }
}

impl Input for ButtonBits {
    fn is_pressed(&self, button: Button) -> bool {
        (self.0 >> Self::bit_for(button)) & 1 != 0
    }
}

/// Bridges the bus's push-style `Sound` trait to either of the two delivery
/// models `spec.md` §6 offers a host: a pull buffer drained with
/// `drain_audio`, or a push callback registered with `set_audio_callback`.
enum AudioSink {
    Buffer(VecDeque<(i16, i16)>),
    Callback(Box<dyn FnMut(&[(f32, f32)], u32)>),
}

impl Sound for AudioSink {
    fn push_sample(&mut self, left: i16, right: i16) {
        match self {
            AudioSink::Buffer(queue) => queue.push_back((left, right)),
            AudioSink::Callback(callback) => {
                let pair = (left as f32 / i16::MAX as f32, right as f32 / i16::MAX as f32);
                callback(&[pair], primitives::SAMPLE_RATE_HZ);
            }
        }
    }
}

/// Bundles the peripherals a headless `run_one_frame` call needs to satisfy
/// `Bus::advance_video_audio`. The framebuffer is pulled directly from the
/// PPU afterwards rather than pushed through `Display`, since `spec.md` §6
/// wants a `framebuffer() -> pointer` pull contract, not a push one; input
/// is polled separately, ahead of the frame loop, so it only needs a
/// placeholder here.
struct FramePeripherals<'a> {
    display: NullDisplay,
    sound: &'a mut AudioSink,
    input: NullInput,
}

impl<'a> Peripherals for FramePeripherals<'a> {
    type Display = NullDisplay;
    type Sound = AudioSink;
    type Input = NullInput;

    fn display(&mut self) -> &mut NullDisplay {
        &mut self.display
    }

    fn sound(&mut self) -> &mut AudioSink {
        self.sound
    }

    fn input(&self) -> &NullInput {
        &self.input
    }
}

/// The emulator core. Owns at most one loaded cartridge's worth of state;
/// `load_rom` replaces it, `unload_rom` clears it back to an idle shell.
pub struct Console {
    bus: Option<Bus>,
    audio: AudioSink,
    rtc_accumulator: f64,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        Console {
            bus: None,
            audio: AudioSink::Buffer(VecDeque::new()),
            rtc_accumulator: 0.0,
        }
    }

    /// Static facts about the core and, if a cartridge is loaded, about it.
    pub fn info(&self) -> Info {
        match &self.bus {
            Some(bus) => Info {
                name: bus.cartridge.title().to_string(),
                variant: bus.variant(),
                native_frame_rate: NATIVE_FRAME_RATE,
                clock_rate_hz: if bus.double_speed() { CLOCK_RATE_HZ * 2 } else { CLOCK_RATE_HZ },
                supported_extensions: SUPPORTED_EXTENSIONS,
            },
            None => Info {
                name: String::new(),
                variant: ConsoleVariant::BothSupported,
                native_frame_rate: NATIVE_FRAME_RATE,
                clock_rate_hz: CLOCK_RATE_HZ,
                supported_extensions: SUPPORTED_EXTENSIONS,
            },
        }
    }

    /// Parses a cartridge image and replaces whatever was previously
    /// loaded. On failure, no state is mutated: the previous cartridge (or
    /// lack of one) remains in effect.
    pub fn load_rom(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        let cartridge = Cartridge::from_bytes(bytes).map_err(CoreError::InvalidCartridge)?;
        self.bus = Some(Bus::new(cartridge));
        self.rtc_accumulator = 0.0;
        Ok(())
    }

    /// Drops the loaded cartridge. Subsequent calls that need one
    /// (`run_one_frame`, `read_memory`, ...) are no-ops until `load_rom`
    /// succeeds again.
    pub fn unload_rom(&mut self) {
        self.bus = None;
        self.rtc_accumulator = 0.0;
    }

    /// Restores post-boot state without touching cartridge RAM.
    pub fn reset(&mut self) {
        if let Some(bus) = &mut self.bus {
            bus.reset();
        }
        self.rtc_accumulator = 0.0;
    }

    /// Runs CPU → PPU/APU advance in lockstep until one frame's worth of
    /// M-cycles (`M_CYCLES_PER_FRAME`) has been consumed, per `spec.md`
    /// §4.6. `buttons` is the bitfield described in §6. A no-op if no
    /// cartridge is loaded.
    pub fn run_one_frame(&mut self, buttons: u16) {
        let bus = match &mut self.bus {
            Some(bus) => bus,
            None => return,
        };

        let input = ButtonBits(buttons);
        bus.poll_input(&input);

        let mut spent: u64 = 0;
        while spent < M_CYCLES_PER_FRAME {
            let m_cycles = bus.step() as u64;
            let mut peripherals = FramePeripherals {
                display: NullDisplay,
                sound: &mut self.audio,
                input: NullInput,
            };
            bus.advance_video_audio((m_cycles * 4) as u32, &mut peripherals);
            spent += m_cycles.max(1);
        }

        // `run_one_frame` carries no elapsed-time parameter (`spec.md` §6),
        // so MBC3's RTC advances off the fixed native frame cadence instead
        // of a host-supplied wall-clock reading.
        self.rtc_accumulator += 1.0 / NATIVE_FRAME_RATE;
        if self.rtc_accumulator >= 1.0 {
            let whole_secs = self.rtc_accumulator.floor() as u64;
            self.rtc_accumulator -= whole_secs as f64;
            bus.tick_mbc_clock(ElapsedTime { secs: whole_secs });
        }
    }

    /// The last frame rendered, as 160x144 pixels in alpha-blue-green-red
    /// little-endian order (`spec.md` §6): each pixel's four bytes in
    /// memory are red, green, blue, alpha. Empty if no cartridge is loaded.
    pub fn framebuffer(&self) -> &[u8] {
        match &self.bus {
            Some(bus) => rgba_slice_as_bytes(bus.ppu.framebuffer()),
            None => &[],
        }
    }

    pub fn framebuffer_width(&self) -> usize {
        SCREEN_WIDTH
    }

    pub fn framebuffer_height(&self) -> usize {
        SCREEN_HEIGHT
    }

    /// Pull-mode audio: copies up to `max_samples` interleaved stereo pairs
    /// into `out` (left, then right), returning how many pairs were
    /// written. Switches the sink to buffering mode if a callback was
    /// previously registered.
    pub fn drain_audio(&mut self, out: &mut [(i16, i16)], max_samples: usize) -> usize {
        if !matches!(self.audio, AudioSink::Buffer(_)) {
            self.audio = AudioSink::Buffer(VecDeque::new());
        }
        let queue = match &mut self.audio {
            AudioSink::Buffer(queue) => queue,
            AudioSink::Callback(_) => unreachable!(),
        };
        let count = max_samples.min(out.len()).min(queue.len());
        for slot in out.iter_mut().take(count) {
            *slot = queue.pop_front().expect("count bounded by queue.len()");
        }
        count
    }

    /// Push-mode audio: registers a callback invoked once per emitted
    /// sample with a one-element float-stereo-pair slice, a running sample
    /// count of one, and the fixed 44.1 kHz sample rate. Replaces any
    /// buffered samples accumulated under pull mode.
    pub fn set_audio_callback(&mut self, callback: impl FnMut(&[(f32, f32)], u32) + 'static) {
        self.audio = AudioSink::Callback(Box::new(callback));
    }

    /// Direct bus access for host debuggers, bypassing M-cycle ticking.
    /// Returns `0xFF` if no cartridge is loaded (matching the "open bus"
    /// read-as-0xFF behavior of an unmapped address).
    pub fn read_memory(&self, addr: u16) -> u8 {
        match &self.bus {
            Some(bus) => bus.debug_read(primitives::Word::new(addr)).get(),
            None => 0xFF,
        }
    }

    /// Direct bus access for host debuggers, bypassing M-cycle ticking.
    /// A no-op if no cartridge is loaded.
    pub fn write_memory(&mut self, addr: u16, value: u8) {
        if let Some(bus) = &mut self.bus {
            bus.debug_write(primitives::Word::new(addr), primitives::Byte::new(value));
        }
    }

    /// Serializes the full machine state (not cartridge RAM — see
    /// `save_data`) behind a magic/version prefix so `load_state` can
    /// reject blobs it cannot interpret.
    pub fn save_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(SAVE_STATE_MAGIC);
        out.push(SAVE_STATE_VERSION);
        if let Some(bus) = &self.bus {
            bus.serialize(&mut out);
        }
        out
    }

    /// Validates the magic/version prefix and the serialized payload's
    /// length against what a fresh serialization of the live bus would
    /// produce, then applies it — validate-then-apply, per `spec.md` §7,
    /// so a malformed blob never leaves the machine half-updated. Returns
    /// an error (leaving state untouched) if no cartridge is loaded, the
    /// prefix doesn't match, or the lengths disagree.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        let bus = self.bus.as_mut().ok_or(CoreError::SaveStateFormatMismatch)?;

        if bytes.len() < 5 || &bytes[0..4] != SAVE_STATE_MAGIC || bytes[4] != SAVE_STATE_VERSION {
            return Err(CoreError::SaveStateFormatMismatch);
        }
        let payload = &bytes[5..];

        let mut probe = Vec::new();
        bus.serialize(&mut probe);
        if probe.len() != payload.len() {
            return Err(CoreError::SaveStateFormatMismatch);
        }

        let mut cursor = Cursor::new(payload);
        bus.deserialize(&mut cursor).map_err(|_| CoreError::SaveStateFormatMismatch)
    }

    /// Battery-backed cartridge RAM (and MBC3's RTC registers, where
    /// present), for the host to persist across sessions. Empty if no
    /// cartridge is loaded.
    pub fn save_data(&self) -> Vec<u8> {
        match &self.bus {
            Some(bus) => bus.cartridge.save_data(),
            None => Vec::new(),
        }
    }

    /// Restores battery-backed cartridge RAM previously returned by
    /// `save_data`. A no-op if no cartridge is loaded.
    pub fn set_save_data(&mut self, bytes: &[u8]) {
        if let Some(bus) = &mut self.bus {
            bus.cartridge.set_save_data(bytes);
        }
    }

    /// Host-chosen display colors for the four monochrome shades. Ignored
    /// on Color cartridges, which always render through their own 15-bit
    /// palette memories. A no-op if no cartridge is loaded.
    pub fn set_monochrome_palette(&mut self, colors: [(u8, u8, u8, u8); 4]) {
        if let Some(bus) = &mut self.bus {
            let rgba = colors.map(|(r, g, b, a)| Rgba([r, g, b, a]));
            bus.ppu.set_monochrome_palette(rgba);
        }
    }
}

/// Also exposed so a host can enumerate the buttons it needs to map,
/// without needing to hardcode the bit positions `ButtonBits` uses.
pub fn all_buttons() -> [Button; 8] {
    ALL_BUTTONS
}

#[cfg(test)]
mod test {
    use super::*;

    fn rom_with(mbc_type: u8, rom_size_code: u8, title: &str) -> Vec<u8> {
        rom_with_ram(mbc_type, rom_size_code, 0x00, title)
    }

    fn rom_with_ram(mbc_type: u8, rom_size_code: u8, ram_size_code: u8, title: &str) -> Vec<u8> {
        let mut rom = vec![0u8; 0x8000];
        for (i, byte) in title.bytes().enumerate() {
            rom[0x0134 + i] = byte;
        }
        rom[0x0147] = mbc_type;
        rom[0x0148] = rom_size_code;
        rom[0x0149] = ram_size_code;
        rom
    }

    #[test]
    fn fresh_console_reports_empty_info() {
        let console = Console::new();
        let info = console.info();
        assert_eq!(info.name, "");
    }

    #[test]
    fn load_rom_then_info_reports_title() {
        let mut console = Console::new();
        console.load_rom(&rom_with(0x00, 0x00, "TESTROM")).unwrap();
        assert_eq!(console.info().name, "TESTROM");
    }

    #[test]
    fn info_reports_supported_extensions_with_or_without_a_cartridge() {
        let mut console = Console::new();
        assert!(console.info().supported_extensions.contains(&"save-state"));
        console.load_rom(&rom_with(0x00, 0x00, "X")).unwrap();
        assert!(console.info().supported_extensions.contains(&"hdma"));
    }

    #[test]
    fn load_rom_rejects_undersized_image() {
        let mut console = Console::new();
        let err = console.load_rom(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidCartridge(_)));
    }

    #[test]
    fn unload_rom_clears_info_and_memory_access() {
        let mut console = Console::new();
        console.load_rom(&rom_with(0x00, 0x00, "X")).unwrap();
        console.unload_rom();
        assert_eq!(console.info().name, "");
        assert_eq!(console.read_memory(0x0100), 0xFF);
    }

    #[test]
    fn run_one_frame_without_rom_is_a_harmless_no_op() {
        let mut console = Console::new();
        console.run_one_frame(0);
        assert!(console.framebuffer().is_empty());
    }

    #[test]
    fn run_one_frame_produces_a_full_framebuffer() {
        let mut console = Console::new();
        console.load_rom(&rom_with(0x00, 0x00, "X")).unwrap();
        console.run_one_frame(0);
        assert_eq!(console.framebuffer().len(), SCREEN_WIDTH * SCREEN_HEIGHT * 4);
    }

    #[test]
    fn save_then_load_state_round_trips_on_quiescent_state() {
        let mut console = Console::new();
        console.load_rom(&rom_with(0x00, 0x00, "X")).unwrap();
        console.run_one_frame(0);

        let first = console.save_state();
        console.load_state(&first).unwrap();
        let second = console.save_state();
        assert_eq!(first, second);
    }

    #[test]
    fn load_state_rejects_foreign_blob() {
        let mut console = Console::new();
        console.load_rom(&rom_with(0x00, 0x00, "X")).unwrap();
        let err = console.load_state(&[0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, CoreError::SaveStateFormatMismatch);
    }

    #[test]
    fn load_state_rejects_truncated_blob() {
        let mut console = Console::new();
        console.load_rom(&rom_with(0x00, 0x00, "X")).unwrap();
        let mut blob = console.save_state();
        blob.truncate(blob.len() - 4);
        assert!(console.load_state(&blob).is_err());
    }

    #[test]
    fn write_memory_then_read_memory_round_trips_in_wram() {
        let mut console = Console::new();
        console.load_rom(&rom_with(0x00, 0x00, "X")).unwrap();
        console.write_memory(0xC000, 0x42);
        assert_eq!(console.read_memory(0xC000), 0x42);
    }

    #[test]
    fn save_data_round_trips_through_battery_ram() {
        let mut console = Console::new();
        // MBC1 with 8 KiB RAM, ROM size code 0 (32 KiB, no external banking).
        console.load_rom(&rom_with_ram(0x03, 0x00, 0x02, "X")).unwrap();
        console.write_memory(0x0000, 0x0A); // enable cartridge RAM
        console.write_memory(0xA000, 0x99);
        let saved = console.save_data();
        assert!(saved.iter().any(|&b| b == 0x99));

        console.set_save_data(&saved);
        assert_eq!(console.read_memory(0xA000), 0x99);
    }

    #[test]
    fn drain_audio_returns_no_more_than_requested() {
        let mut console = Console::new();
        console.load_rom(&rom_with(0x00, 0x00, "X")).unwrap();
        for _ in 0..4 {
            console.run_one_frame(0);
        }
        let mut out = vec![(0i16, 0i16); 4];
        let count = console.drain_audio(&mut out, 4);
        assert!(count <= 4);
    }

    #[test]
    fn button_bits_map_matches_spec_bit_positions() {
        let bits = ButtonBits(1 << 11);
        assert!(bits.is_pressed(Button::Right));
        assert!(!bits.is_pressed(Button::A));
    }
}
