use crate::primitives::{Byte, Word, Memory};
use super::{Mbc, ElapsedTime};


/// MBC2: up to 16 16KiB ROM banks and a built-in 512x4-bit RAM array (the
/// upper nybble of every stored byte reads back as `1`s). ROM bank select
/// and RAM enable share the 0x0000-0x3FFF region, disambiguated by bit 8 of
/// the address (the least-significant bit of the upper address byte).
pub struct Mbc2 {
    ram: Memory,
    ram_enabled: bool,
    bank: u8,
    rom_banks: u16,
}

impl Mbc2 {
    pub fn new(rom_banks: u16) -> Self {
        Self {
            ram: Memory::zeroed(Word::new(512)),
            ram_enabled: false,
            bank: 1,
            rom_banks,
        }
    }
}

impl Mbc for Mbc2 {
    fn load_rom_byte(&self, rom: &[Byte], addr: Word) -> Byte {
        let offset = if addr.get() < 0x4000 {
            addr.get() as usize
        } else {
            let bank = (self.bank as u16 % self.rom_banks.max(1)) as usize;
            bank * 0x4000 + (addr.get() as usize - 0x4000)
        };

        rom.get(offset).cloned().unwrap_or(Byte::new(0xFF))
    }

    fn store_rom_byte(&mut self, addr: Word, val: Byte) {
        if addr.get() >= 0x4000 {
            return;
        }

        if addr.get() & 0x0100 == 0 {
            self.ram_enabled = (val.get() & 0x0F) == 0x0A;
        } else {
            let bank = val.get() & 0x0F;
            self.bank = if bank == 0 { 1 } else { bank };
        }
    }

    fn load_ram_byte(&self, addr: Word) -> Byte {
        if !self.ram_enabled {
            return Byte::new(0xFF);
        }
        let idx = addr.get() % 512;
        self.ram[Word::new(idx)] | Byte::new(0xF0)
    }

    fn store_ram_byte(&mut self, addr: Word, val: Byte) {
        if !self.ram_enabled {
            return;
        }
        let idx = addr.get() % 512;
        self.ram[Word::new(idx)] = val & Byte::new(0x0F);
    }

    fn ram_contents(&self) -> &[Byte] {
        self.ram.as_slice()
    }

    fn set_ram_contents(&mut self, bytes: &[u8]) {
        self.ram.fill_from_raw_bytes(bytes);
    }

    fn tick(&mut self, _elapsed: ElapsedTime) {}
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ram_nybbles_read_back_with_high_bits_set() {
        let mut mbc = Mbc2::new(2);
        mbc.store_rom_byte(Word::new(0x0000), Byte::new(0x0A));
        mbc.store_ram_byte(Word::new(0x0000), Byte::new(0xFF));
        assert_eq!(mbc.load_ram_byte(Word::new(0x0000)), Byte::new(0xFF));
        mbc.store_ram_byte(Word::new(0x0001), Byte::new(0x03));
        assert_eq!(mbc.load_ram_byte(Word::new(0x0001)), Byte::new(0xF3));
    }

    #[test]
    fn bank_register_uses_address_bit_8_to_disambiguate() {
        let mut mbc = Mbc2::new(4);
        mbc.store_rom_byte(Word::new(0x0100), Byte::new(0x03));
        assert_eq!(mbc.bank, 3);
        assert!(!mbc.ram_enabled);
    }
}
