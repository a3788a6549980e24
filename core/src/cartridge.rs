//! Cartridge header parsing and MBC construction.

use crate::log::*;
use crate::primitives::{Byte, Word, Memory};
use crate::mbc::{Mbc, NoMbc, Mbc1, Mbc2, Mbc3, Mbc5, ElapsedTime};


/// Which hardware variant a cartridge was written for, per its CGB flag
/// byte (header offset 0x0143).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleVariant {
    /// Runs only in Color mode (0xC0).
    CgbOnly,
    /// Supports both; most games of this kind run enhanced on Color.
    BothSupported,
    /// Monochrome cartridge with a Color-specific boot palette trick
    /// (a handful of top/bottom header-checksum-matched titles).
    NonCgbSpecial,
    /// Plain monochrome-only cartridge.
    NonCgb,
}

impl ConsoleVariant {
    fn from_byte(b: Byte) -> Self {
        match b.get() {
            0x00..=0x7F => ConsoleVariant::NonCgb,
            0xC0 => ConsoleVariant::CgbOnly,
            0x80 => ConsoleVariant::BothSupported,
            // Bit 7 set, and bit 2 or 3 set: a documented "special" case.
            b if (b & 0b0000_0110) != 0 => ConsoleVariant::NonCgbSpecial,
            _ => ConsoleVariant::NonCgb,
        }
    }

    pub fn is_color(&self) -> bool {
        matches!(self, ConsoleVariant::CgbOnly | ConsoleVariant::BothSupported)
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CartridgeKind {
    RomOnly,
    Mbc1,
    Mbc1Ram,
    Mbc2,
    Mbc3,
    Mbc3Ram,
    Mbc3Rtc,
    Mbc5,
    Mbc5Ram,
}

impl CartridgeKind {
    fn from_byte(b: Byte) -> Result<Self, String> {
        Ok(match b.get() {
            0x00 => CartridgeKind::RomOnly,
            0x01 => CartridgeKind::Mbc1,
            0x02 | 0x03 => CartridgeKind::Mbc1Ram,
            0x05 | 0x06 => CartridgeKind::Mbc2,
            0x0F | 0x10 => CartridgeKind::Mbc3Rtc,
            0x11 => CartridgeKind::Mbc3,
            0x12 | 0x13 => CartridgeKind::Mbc3Ram,
            0x19 => CartridgeKind::Mbc5,
            0x1A | 0x1B | 0x1C | 0x1D | 0x1E => CartridgeKind::Mbc5Ram,
            other => return Err(format!("unsupported cartridge type byte 0x{:02x}", other)),
        })
    }
}


fn rom_banks_from_byte(b: Byte) -> u16 {
    // Header encodes rom size as 32KiB << n, i.e. bank count = 2 << n.
    2u16 << b.get().min(8)
}

fn ram_len_from_byte(b: Byte) -> Word {
    let bytes = match b.get() {
        0x00 => 0,
        0x01 => 2 * 1024,
        0x02 => 8 * 1024,
        0x03 => 32 * 1024,
        0x04 => 128 * 1024,
        0x05 => 64 * 1024,
        _ => 0,
    };
    Word::new(bytes.min(u16::MAX as u32) as u16)
}


pub struct Cartridge {
    rom: Memory,
    mbc: Box<dyn Mbc>,
    title: String,
    variant: ConsoleVariant,
}

impl Cartridge {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < 0x150 {
            return Err("ROM is shorter than the cartridge header".into());
        }

        let rom = Memory::from_bytes(bytes);

        let title: String = bytes[0x0134..0x0144]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();

        let variant = ConsoleVariant::from_byte(rom[Word::new(0x0143)]);
        let kind = CartridgeKind::from_byte(rom[Word::new(0x0147)])?;
        let rom_banks = rom_banks_from_byte(rom[Word::new(0x0148)]);
        let ram_len = ram_len_from_byte(rom[Word::new(0x0149)]);

        info!("Loading cartridge '{}': {:?}, {} ROM banks, {} bytes RAM, variant {:?}",
            title, kind, rom_banks, ram_len.get(), variant);

        let mbc: Box<dyn Mbc> = match kind {
            CartridgeKind::RomOnly => Box::new(NoMbc::new(ram_len)),
            CartridgeKind::Mbc1 => Box::new(Mbc1::new(Word::zero(), rom_banks)),
            CartridgeKind::Mbc1Ram => Box::new(Mbc1::new(ram_len, rom_banks)),
            CartridgeKind::Mbc2 => Box::new(Mbc2::new(rom_banks)),
            CartridgeKind::Mbc3 => Box::new(Mbc3::new(Word::zero(), rom_banks, false)),
            CartridgeKind::Mbc3Ram => Box::new(Mbc3::new(ram_len, rom_banks, false)),
            CartridgeKind::Mbc3Rtc => Box::new(Mbc3::new(ram_len, rom_banks, true)),
            CartridgeKind::Mbc5 => Box::new(Mbc5::new(Word::zero(), rom_banks)),
            CartridgeKind::Mbc5Ram => Box::new(Mbc5::new(ram_len, rom_banks)),
        };

        Ok(Self { rom, mbc, title, variant })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn variant(&self) -> ConsoleVariant {
        self.variant
    }

    pub fn load_rom_byte(&self, addr: Word) -> Byte {
        self.mbc.load_rom_byte(self.rom.as_slice(), addr)
    }

    pub fn store_rom_byte(&mut self, addr: Word, val: Byte) {
        self.mbc.store_rom_byte(addr, val);
    }

    pub fn load_ram_byte(&self, addr: Word) -> Byte {
        self.mbc.load_ram_byte(addr)
    }

    pub fn store_ram_byte(&mut self, addr: Word, val: Byte) {
        self.mbc.store_ram_byte(addr, val);
    }

    pub fn tick(&mut self, elapsed: ElapsedTime) {
        self.mbc.tick(elapsed);
    }

    pub fn save_data(&self) -> Vec<u8> {
        self.mbc.ram_contents().iter().map(Byte::get).collect()
    }

    pub fn set_save_data(&mut self, bytes: &[u8]) {
        self.mbc.set_ram_contents(bytes);
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn minimal_rom(cart_type: u8, rom_size: u8, ram_size: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; 0x8000];
        bytes[0x0134] = b'T';
        bytes[0x0135] = b'E';
        bytes[0x0143] = 0x00;
        bytes[0x0147] = cart_type;
        bytes[0x0148] = rom_size;
        bytes[0x0149] = ram_size;
        bytes
    }

    #[test]
    fn parses_title_and_stops_at_nul() {
        let rom = minimal_rom(0x00, 0x00, 0x00);
        let cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.title(), "TE");
    }

    #[test]
    fn rejects_unknown_cartridge_type() {
        let rom = minimal_rom(0xFF, 0x00, 0x00);
        assert!(Cartridge::from_bytes(&rom).is_err());
    }

    #[test]
    fn mbc2_cartridge_type_wires_builtin_ram() {
        let rom = minimal_rom(0x05, 0x00, 0x00);
        let mut cart = Cartridge::from_bytes(&rom).unwrap();
        cart.store_rom_byte(Word::new(0x0000), Byte::new(0x0A));
        cart.store_ram_byte(Word::new(0x0000), Byte::new(0x0F));
        assert_eq!(cart.load_ram_byte(Word::new(0x0000)), Byte::new(0xFF));
    }

    #[test]
    fn console_variant_from_byte_covers_every_documented_case() {
        assert_eq!(ConsoleVariant::from_byte(Byte::new(0x00)), ConsoleVariant::NonCgb);
        assert_eq!(ConsoleVariant::from_byte(Byte::new(0xC0)), ConsoleVariant::CgbOnly);
        assert_eq!(ConsoleVariant::from_byte(Byte::new(0x80)), ConsoleVariant::BothSupported);
        // Bit 7 set, bit 2 set: the documented "special" case.
        assert_eq!(ConsoleVariant::from_byte(Byte::new(0x84)), ConsoleVariant::NonCgbSpecial);
        // Bit 7 set, bit 3 set.
        assert_eq!(ConsoleVariant::from_byte(Byte::new(0x88)), ConsoleVariant::NonCgbSpecial);
    }
}
