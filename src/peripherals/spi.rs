//! SPI, master mode
//!
//! Writing SPDR with SPE and MSTR set starts a transfer that completes
//! after `8 × clock_divider` cycles. On completion SPIF is set, the
//! output node carries the transmitted byte, and whatever an attached
//! slave raised on the input node is latched into SPDR. A slave that
//! answers synchronously from a notify callback on the output node is
//! therefore seen in the same transfer, matching the full-duplex wire.
//!
//! Slave mode of this controller is not modeled; writes with MSTR clear
//! store the byte and log a warning.

use crate::bus::Bus;
use crate::interrupt::{InterruptTable, VectorDesc};
use crate::irq::{IrqFabric, IrqFlags, IrqId};
use crate::memory::{RegBit, Sram};
use crate::peripherals::IoPort;
use crate::scheduler::{Handle, TimedEvent};
use crate::variant::{regs, vectors};

/// SPCR bits
pub mod spcr {
    pub const SPR: u8 = 0x03;
    pub const CPHA: u8 = 1 << 2;
    pub const CPOL: u8 = 1 << 3;
    pub const MSTR: u8 = 1 << 4;
    pub const DORD: u8 = 1 << 5;
    pub const SPE: u8 = 1 << 6;
    pub const SPIE: u8 = 1 << 7;
}

/// SPSR bits
pub mod spsr {
    pub const SPI2X: u8 = 1 << 0;
    pub const WCOL: u8 = 1 << 6;
    pub const SPIF: u8 = 1 << 7;
}

pub struct Spi {
    shift: u8,
    handle: Option<Handle>,
    /// Transmitted bytes appear here
    pub out_irq: IrqId,
    /// A slave raises its reply here before the transfer completes
    pub in_irq: IrqId,
}

impl Spi {
    pub(crate) fn new(
        fabric: &mut IrqFabric,
        intc: &mut InterruptTable,
        routes: &mut [IoPort],
    ) -> Self {
        let out_irq = fabric.alloc("spi.out", 8, IrqFlags::empty());
        let in_irq = fabric.alloc("spi.in", 8, IrqFlags::empty());

        intc.register(VectorDesc {
            num: vectors::SPI_STC,
            enable: RegBit::new(regs::SPCR, 7),
            flag: RegBit::new(regs::SPSR, 7),
            clear_on_ack: true,
            level: false,
        });

        for addr in [regs::SPCR, regs::SPSR, regs::SPDR] {
            routes[addr as usize] = IoPort::Spi;
        }

        Self { shift: 0, handle: None, out_irq, in_irq }
    }

    pub fn reset(&mut self, sram: &mut Sram) {
        sram.set(regs::SPCR, 0);
        sram.set(regs::SPSR, 0);
        sram.set(regs::SPDR, 0);
        self.shift = 0;
        self.handle = None;
    }

    /// SCK divider from SPR1:0 and SPI2X
    pub fn clock_divider(spcr_val: u8, spsr_val: u8) -> u64 {
        let base: u64 = match spcr_val & spcr::SPR {
            0 => 4,
            1 => 16,
            2 => 64,
            _ => 128,
        };
        if spsr_val & spsr::SPI2X != 0 {
            base / 2
        } else {
            base
        }
    }
}

impl Bus {
    pub(crate) fn spi_read(&mut self, addr: u16) -> u8 {
        self.sram.get(addr)
    }

    pub(crate) fn spi_write(&mut self, addr: u16, value: u8, prev: u8) {
        match addr {
            regs::SPDR => {
                let ctl = self.sram.get(regs::SPCR);
                self.sram.set(addr, value);
                if ctl & spcr::SPE == 0 {
                    return;
                }
                if ctl & spcr::MSTR == 0 {
                    log::warn!("SPI slave mode is not modeled, SPDR write ignored");
                    self.peripheral_warning();
                    return;
                }
                if self.io.spi.handle.is_some() {
                    // Write collision while shifting
                    RegBit::new(regs::SPSR, 6).set(&mut self.sram);
                    return;
                }
                let div = Spi::clock_divider(ctl, self.sram.get(regs::SPSR));
                let due = self.cycle + 8 * div;
                self.io.spi.shift = value;
                let handle = self.queue.schedule(TimedEvent::SpiXfer, due);
                self.io.spi.handle = Some(handle);
            }
            regs::SPSR => {
                // Only SPI2X is writable
                let v = (prev & !spsr::SPI2X) | (value & spsr::SPI2X);
                self.sram.set(addr, v);
            }
            regs::SPCR => {
                self.sram.set(addr, value);
                self.intc_sync(addr);
            }
            _ => {}
        }
    }

    /// Queue callback: transfer complete
    pub(crate) fn spi_event(&mut self, _due: u64) -> Option<u64> {
        self.io.spi.handle = None;
        let sent = self.io.spi.shift;
        let out = self.io.spi.out_irq;
        let input = self.io.spi.in_irq;

        // Let an attached slave see the byte (and possibly answer)
        self.raise_irq(out, sent as u32);
        let reply = self.fabric.value(input) as u8;
        self.sram.set(regs::SPDR, reply);

        self.vector_raise(vectors::SPI_STC);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_divider() {
        assert_eq!(Spi::clock_divider(0, 0), 4);
        assert_eq!(Spi::clock_divider(1, 0), 16);
        assert_eq!(Spi::clock_divider(2, 0), 64);
        assert_eq!(Spi::clock_divider(3, 0), 128);
        assert_eq!(Spi::clock_divider(0, spsr::SPI2X), 2);
        assert_eq!(Spi::clock_divider(3, spsr::SPI2X), 64);
    }
}
