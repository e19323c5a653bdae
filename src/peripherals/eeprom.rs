//! EEPROM
//!
//! Accessed through the EEAR/EEDR/EECR triple. Reads complete in one
//! cycle. Writes follow the hardware arming dance: set EEMPE, then set
//! EEPE within four cycles; EEPE then stays set while a queue entry
//! models the programming time, and its completion clears EEPE and
//! raises the ready vector.
//!
//! The ready interrupt has no architectural flag bit, so an unused EECR
//! bit carries it internally and is masked out of reads.

use crate::bus::Bus;
use crate::interrupt::{InterruptTable, VectorDesc};
use crate::memory::{RegBit, Sram};
use crate::peripherals::IoPort;
use crate::scheduler::{Handle, TimedEvent};
use crate::variant::{regs, vectors, Variant};

/// EECR bits
pub mod eecr {
    pub const EERE: u8 = 1 << 0;
    pub const EEPE: u8 = 1 << 1;
    pub const EEMPE: u8 = 1 << 2;
    pub const EERIE: u8 = 1 << 3;
    pub const EEPM0: u8 = 1 << 4;
    pub const EEPM1: u8 = 1 << 5;
    /// Internal ready flag, never visible to firmware
    pub(crate) const READY: u8 = 1 << 6;
}

/// Programming time in microseconds (erase + write)
const WRITE_TIME_US: u64 = 3400;
/// Cycles the EEMPE arming window stays open
const ARM_WINDOW_CYCLES: u64 = 4;

pub struct Eeprom {
    data: Vec<u8>,
    addr_mask: u16,
    /// Cycle until which an EEPE write is accepted
    armed_until: u64,
    handle: Option<Handle>,
    /// Address, data and mode latched when programming starts
    pending: (u16, u8, u8),
}

impl Eeprom {
    pub(crate) fn new(
        variant: &'static Variant,
        intc: &mut InterruptTable,
        routes: &mut [IoPort],
    ) -> Self {
        intc.register(VectorDesc {
            num: vectors::EE_READY,
            enable: RegBit::new(regs::EECR, 3),
            flag: RegBit::new(regs::EECR, 6),
            clear_on_ack: true,
            level: false,
        });

        for addr in [regs::EECR, regs::EEDR, regs::EEARL, regs::EEARH] {
            routes[addr as usize] = IoPort::Eeprom;
        }

        Self {
            data: vec![0xFF; variant.eeprom_size],
            addr_mask: (variant.eeprom_size - 1) as u16,
            armed_until: 0,
            handle: None,
            pending: (0, 0, 0),
        }
    }

    pub fn reset(&mut self, sram: &mut Sram) {
        for addr in [regs::EECR, regs::EEDR, regs::EEARL, regs::EEARH] {
            sram.set(addr, 0);
        }
        self.armed_until = 0;
        self.handle = None;
        // Content survives reset
    }

    /// Install an initial image from the firmware descriptor
    pub fn load(&mut self, image: &[u8]) {
        self.data[..image.len()].copy_from_slice(image);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn address(sram: &Sram, mask: u16) -> u16 {
        (sram.get(regs::EEARL) as u16 | ((sram.get(regs::EEARH) as u16) << 8)) & mask
    }
}

impl Bus {
    pub(crate) fn eeprom_read(&mut self, addr: u16) -> u8 {
        let v = self.sram.get(addr);
        if addr == regs::EECR {
            v & !eecr::READY
        } else {
            v
        }
    }

    pub(crate) fn eeprom_write(&mut self, addr: u16, value: u8, prev: u8) {
        if addr != regs::EECR {
            let v = if addr == regs::EEARH {
                value & (self.io.eeprom.addr_mask >> 8) as u8
            } else {
                value
            };
            self.sram.set(addr, v);
            return;
        }

        let busy = self.io.eeprom.handle.is_some();
        let mut new = (prev & (eecr::EEPE | eecr::READY))
            | (value & (eecr::EERIE | eecr::EEPM0 | eecr::EEPM1));

        if value & eecr::EEMPE != 0 && !busy {
            new |= eecr::EEMPE;
            self.io.eeprom.armed_until = self.cycle + ARM_WINDOW_CYCLES;
        }

        if value & eecr::EEPE != 0 && !busy {
            if self.cycle <= self.io.eeprom.armed_until && prev & eecr::EEMPE != 0 {
                new |= eecr::EEPE;
                new &= !eecr::EEMPE;
                let mask = self.io.eeprom.addr_mask;
                self.io.eeprom.pending = (
                    Eeprom::address(&self.sram, mask),
                    self.sram.get(regs::EEDR),
                    value & (eecr::EEPM0 | eecr::EEPM1),
                );
                let us_cycles = self.f_cpu as u64 * WRITE_TIME_US / 1_000_000;
                let due = self.cycle + us_cycles.max(1);
                let handle = self.queue.schedule(TimedEvent::EepromWrite, due);
                self.io.eeprom.handle = Some(handle);
            } else {
                log::warn!("EEPE set without a valid EEMPE window, write ignored");
                self.peripheral_warning();
            }
        }

        self.sram.set(addr, new);
        self.intc_sync(addr);

        if value & eecr::EERE != 0 && !busy {
            let a = Eeprom::address(&self.sram, self.io.eeprom.addr_mask);
            let byte = self.io.eeprom.data[a as usize];
            self.sram.set(regs::EEDR, byte);
        }
    }

    /// Queue callback: programming finished
    pub(crate) fn eeprom_event(&mut self, _due: u64) -> Option<u64> {
        self.io.eeprom.handle = None;
        let (a, data, mode) = self.io.eeprom.pending;

        let cell = &mut self.io.eeprom.data[a as usize];
        match (mode & eecr::EEPM1 != 0, mode & eecr::EEPM0 != 0) {
            (false, false) => *cell = data,  // erase then write
            (false, true) => *cell = 0xFF,   // erase only
            (true, false) => *cell &= data,  // write only
            (true, true) => {}
        }

        let new = self.sram.get(regs::EECR) & !eecr::EEPE;
        self.sram.set(regs::EECR, new);
        self.vector_raise(vectors::EE_READY);
        None
    }

    /// Direct EEPROM content access for the harness
    pub fn eeprom_bytes(&self) -> &[u8] {
        self.io.eeprom.data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_masking() {
        let mut sram = Sram::new(0x500);
        sram.set(regs::EEARL, 0x34);
        sram.set(regs::EEARH, 0x12);
        // 512-byte part: only 9 address bits
        assert_eq!(Eeprom::address(&sram, 0x1FF), 0x0034);
        // 1KB part keeps bit 9
        sram.set(regs::EEARH, 0x02);
        assert_eq!(Eeprom::address(&sram, 0x3FF), 0x0234);
    }

    #[test]
    fn test_load_image() {
        let variant = Variant::get(crate::variant::VariantId::Atmega88);
        let mut intc = InterruptTable::new(26);
        let mut routes = vec![IoPort::None; 0x100];
        let mut ee = Eeprom::new(variant, &mut intc, &mut routes);

        ee.load(&[0x0D, 0xF0, 0xFE, 0xCA]);
        assert_eq!(&ee.data()[..4], &[0x0D, 0xF0, 0xFE, 0xCA]);
        assert_eq!(ee.data()[4], 0xFF);
    }
}
