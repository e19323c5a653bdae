//! ADC
//!
//! ADMUX selects channel and reference, ADCSRA the prescaler and mode.
//! A conversion takes 13 prescaled ADC clocks (25 for the first one
//! after enabling) and samples the analog level from the channel's
//! fabric node, in millivolts, defaulting to 0 until a front end drives
//! it. The sample is scaled against the selected reference and latched
//! into ADCL/ADCH with the documented read lock: reading ADCL freezes
//! the pair until ADCH is read.
//!
//! In free-running auto-trigger mode the next conversion starts
//! immediately; firmware cycles channels by rewriting ADMUX between
//! conversions, which takes effect at the next sample point.

use crate::bus::Bus;
use crate::interrupt::{InterruptTable, VectorDesc};
use crate::irq::{IrqFabric, IrqFlags, IrqId};
use crate::memory::{RegBit, Sram};
use crate::peripherals::IoPort;
use crate::scheduler::{Handle, TimedEvent};
use crate::variant::{regs, vectors};

/// ADCSRA bits
pub mod adcsra {
    pub const ADPS: u8 = 0x07;
    pub const ADIE: u8 = 1 << 3;
    pub const ADIF: u8 = 1 << 4;
    pub const ADATE: u8 = 1 << 5;
    pub const ADSC: u8 = 1 << 6;
    pub const ADEN: u8 = 1 << 7;
}

/// AVCC in millivolts
const AVCC_MV: u32 = 5000;
/// Internal bandgap reference in millivolts
const BANDGAP_MV: u32 = 1100;
/// Rough temperature-channel level in millivolts
const TEMP_MV: u32 = 314;

/// Clocks per conversion
const CONVERSION_CLOCKS: u64 = 13;
const FIRST_CONVERSION_CLOCKS: u64 = 25;

pub struct Adc {
    /// Per-channel input nodes (ADC0..ADC7), millivolts
    pub channels: [IrqId; 8],
    /// External AREF level; 0 means "not driven", falling back to AVCC
    pub aref_irq: IrqId,
    handle: Option<Handle>,
    first: bool,
    /// ADCL has been read, ADCH not yet
    locked: bool,
}

impl Adc {
    pub(crate) fn new(
        fabric: &mut IrqFabric,
        intc: &mut InterruptTable,
        routes: &mut [IoPort],
    ) -> Self {
        let names: Vec<String> = (0..8).map(|c| format!("adc{}", c)).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let ids = fabric.alloc_pool("adc", &name_refs, 32, IrqFlags::empty());
        let aref_irq = fabric.alloc("adc.aref", 32, IrqFlags::empty());

        intc.register(VectorDesc {
            num: vectors::ADC,
            enable: RegBit::new(regs::ADCSRA, 3),
            flag: RegBit::new(regs::ADCSRA, 4),
            clear_on_ack: true,
            level: false,
        });

        for addr in [regs::ADCL, regs::ADCH, regs::ADCSRA, regs::ADCSRB, regs::ADMUX] {
            routes[addr as usize] = IoPort::Adc;
        }

        Self {
            channels: [
                ids[0], ids[1], ids[2], ids[3], ids[4], ids[5], ids[6], ids[7],
            ],
            aref_irq,
            handle: None,
            first: true,
            locked: false,
        }
    }

    pub fn reset(&mut self, sram: &mut Sram) {
        for addr in [regs::ADCL, regs::ADCH, regs::ADCSRA, regs::ADCSRB, regs::ADMUX] {
            sram.set(addr, 0);
        }
        self.handle = None;
        self.first = true;
        self.locked = false;
    }

    /// CPU cycles per ADC clock for the ADPS setting
    pub fn prescale(adps: u8) -> u64 {
        match adps & adcsra::ADPS {
            0 => 2,
            n => 1 << n,
        }
    }
}

impl Bus {
    pub(crate) fn adc_read(&mut self, addr: u16) -> u8 {
        match addr {
            regs::ADCL => {
                self.io.adc.locked = true;
                self.sram.get(addr)
            }
            regs::ADCH => {
                self.io.adc.locked = false;
                self.sram.get(addr)
            }
            _ => self.sram.get(addr),
        }
    }

    pub(crate) fn adc_write(&mut self, addr: u16, value: u8, prev: u8) {
        match addr {
            regs::ADCSRA => {
                let mut v = value;
                // ADIF is write-1-to-clear
                if value & adcsra::ADIF != 0 {
                    v &= !adcsra::ADIF;
                } else {
                    v |= prev & adcsra::ADIF;
                }
                if prev & adcsra::ADEN == 0 && value & adcsra::ADEN != 0 {
                    self.io.adc.first = true;
                }
                if value & adcsra::ADEN == 0 {
                    if let Some(h) = self.io.adc.handle.take() {
                        self.queue.cancel(h);
                    }
                    v &= !adcsra::ADSC;
                }
                self.sram.set(addr, v);
                self.intc_sync(addr);

                if v & adcsra::ADEN != 0 && v & adcsra::ADSC != 0 && self.io.adc.handle.is_none() {
                    self.adc_start_conversion();
                }
            }
            regs::ADCL | regs::ADCH => {
                // Result registers are read-only
            }
            _ => self.sram.set(addr, value),
        }
    }

    fn adc_start_conversion(&mut self) {
        let adps = self.sram.get(regs::ADCSRA) & adcsra::ADPS;
        let clocks = if self.io.adc.first {
            FIRST_CONVERSION_CLOCKS
        } else {
            CONVERSION_CLOCKS
        };
        self.io.adc.first = false;
        let due = self.cycle + clocks * Adc::prescale(adps);
        let handle = self.queue.schedule(TimedEvent::AdcConversion, due);
        self.io.adc.handle = Some(handle);
    }

    /// Queue callback: conversion complete
    pub(crate) fn adc_event(&mut self, _due: u64) -> Option<u64> {
        self.io.adc.handle = None;
        let admux = self.sram.get(regs::ADMUX);
        let mux = admux & 0x0F;
        let refs = admux >> 6;

        let sample_mv = match mux {
            0..=7 => self.fabric.value(self.io.adc.channels[mux as usize]),
            8 => TEMP_MV,
            14 => BANDGAP_MV,
            15 => 0,
            _ => {
                log::warn!("ADC conversion on reserved channel {}", mux);
                self.peripheral_warning();
                0
            }
        };
        let vref_mv = match refs {
            0 => {
                let aref = self.fabric.value(self.io.adc.aref_irq);
                if aref == 0 { AVCC_MV } else { aref }
            }
            1 => AVCC_MV,
            _ => BANDGAP_MV,
        };

        let result = ((sample_mv as u64 * 1023) / vref_mv as u64).min(1023) as u16;
        if !self.io.adc.locked {
            if admux & 0x20 != 0 {
                // Left-adjusted
                let shifted = result << 6;
                self.sram.set(regs::ADCL, shifted as u8);
                self.sram.set(regs::ADCH, (shifted >> 8) as u8);
            } else {
                self.sram.set(regs::ADCL, result as u8);
                self.sram.set(regs::ADCH, (result >> 8) as u8);
            }
        }

        let mut a = self.sram.get(regs::ADCSRA);
        let free_running = a & adcsra::ADATE != 0 && self.sram.get(regs::ADCSRB) & 0x07 == 0;
        if !free_running {
            a &= !adcsra::ADSC;
        }
        self.sram.set(regs::ADCSRA, a);
        self.vector_raise(vectors::ADC);

        if free_running {
            self.adc_start_conversion();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prescale_table() {
        assert_eq!(Adc::prescale(0), 2);
        assert_eq!(Adc::prescale(1), 2);
        assert_eq!(Adc::prescale(2), 4);
        assert_eq!(Adc::prescale(3), 8);
        assert_eq!(Adc::prescale(7), 128);
    }
}
