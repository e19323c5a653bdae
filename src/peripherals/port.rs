//! GPIO ports
//!
//! Each port models the DDR (direction), PORT (output value / pull-up)
//! and PIN (input sample) registers. Writing PIN toggles PORT. Every pin
//! has a fabric node carrying its logic level plus one all-pins node per
//! port; external drivers raise the pin nodes for input pins, while
//! writes to PORT update the nodes for output pins.
//!
//! Pull-ups: with DDR=0, PORT=1 and no external driver, PIN reads 1.
//!
//! Pin-change interrupts are banked (PCMSKn gates which pins raise the
//! bank flag in PCIFR); the external interrupts INT0/INT1 decode their
//! sense from EICRA (low level, any change, falling, rising).

use crate::bus::Bus;
use crate::interrupt::{InterruptTable, VectorDesc};
use crate::irq::{IrqFabric, IrqFlags, IrqId, IrqTarget};
use crate::memory::{RegBit, Sram};
use crate::peripherals::IoPort;
use crate::variant::{regs, vectors};

/// Sense control for INT0/INT1, from the ISC bits in EICRA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtIntMode {
    LowLevel,
    AnyEdge,
    Falling,
    Rising,
}

impl ExtIntMode {
    pub fn from_isc(bits: u8) -> ExtIntMode {
        match bits & 0x03 {
            0 => ExtIntMode::LowLevel,
            1 => ExtIntMode::AnyEdge,
            2 => ExtIntMode::Falling,
            _ => ExtIntMode::Rising,
        }
    }
}

/// One external interrupt source routed through this port
#[derive(Debug, Clone, Copy)]
pub struct ExtInt {
    /// Pin within the port
    pub pin: u8,
    pub vector: u8,
    /// Bit position of the ISC field in EICRA
    pub isc_shift: u8,
    /// Bit in EIMSK/EIFR
    pub index: u8,
}

/// One GPIO port (B, C or D)
pub struct GpioPort {
    pub letter: char,
    pub pin_addr: u16,
    pub ddr_addr: u16,
    pub port_addr: u16,
    /// Per-pin logic-level nodes
    pub pins: [IrqId; 8],
    /// All-pins node carrying the PIN byte
    pub all: IrqId,
    /// Pin-change bank number (PCICR/PCIFR bit, selects PCMSKn)
    pub bank: u8,
    pub pcmsk_addr: u16,
    pub pcint_vector: u8,
    pub ext_ints: Vec<ExtInt>,

    /// Pins with an external driver attached
    pub(crate) ext_driven: u8,
    /// Levels forced by external drivers
    pub(crate) ext_level: u8,
    /// Pins overridden by compare-output hardware
    pub(crate) hw_mask: u8,
    pub(crate) hw_level: u8,
}

impl GpioPort {
    /// Visible PIN byte for the given DDR/PORT values
    pub(crate) fn pin_visible(&self, ddr: u8, port: u8) -> u8 {
        let driven_out = (port & !self.hw_mask) | (self.hw_level & self.hw_mask);
        let out = ddr & driven_out;
        let ext = !ddr & self.ext_driven & self.ext_level;
        let pullup = !ddr & !self.ext_driven & port;
        out | ext | pullup
    }

    pub fn reset(&mut self, sram: &mut Sram) {
        sram.set(self.ddr_addr, 0);
        sram.set(self.port_addr, 0);
        self.hw_mask = 0;
        self.hw_level = 0;
        // External drivers survive a reset; recompute the sample
        sram.set(self.pin_addr, self.pin_visible(0, 0));
    }
}

/// Build ports B, C and D with their pin-change banks and, on port D,
/// the INT0/INT1 external interrupts.
pub(crate) fn build_ports(
    fabric: &mut IrqFabric,
    intc: &mut InterruptTable,
    routes: &mut [IoPort],
) -> Vec<GpioPort> {
    let specs: [(char, u16, u16, u16, u8, u16, u8); 3] = [
        ('b', regs::PINB, regs::DDRB, regs::PORTB, 0, regs::PCMSK0, vectors::PCINT0),
        ('c', regs::PINC, regs::DDRC, regs::PORTC, 1, regs::PCMSK1, vectors::PCINT1),
        ('d', regs::PIND, regs::DDRD, regs::PORTD, 2, regs::PCMSK2, vectors::PCINT2),
    ];

    let mut ports = Vec::new();
    for (i, &(letter, pin, ddr, port, bank, pcmsk, vector)) in specs.iter().enumerate() {
        let prefix = format!("port{}", letter);
        let names: Vec<String> = (0..8).map(|p| format!("pin{}", p)).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let pin_ids = fabric.alloc_pool(&prefix, &name_refs, 1, IrqFlags::FILTERED);
        let all = fabric.alloc(format!("{}.all", prefix), 8, IrqFlags::empty());
        for (p, &id) in pin_ids.iter().enumerate() {
            fabric.register_route(id, IrqTarget::PortPin { port: i, pin: p as u8 });
        }

        intc.register(VectorDesc {
            num: vector,
            enable: RegBit::new(regs::PCICR, bank),
            flag: RegBit::new(regs::PCIFR, bank),
            clear_on_ack: true,
            level: false,
        });

        for addr in [pin, ddr, port] {
            routes[addr as usize] = IoPort::Gpio(i as u8);
        }
        routes[pcmsk as usize] = IoPort::PortCtl;

        let ext_ints = if letter == 'd' {
            let ints = vec![
                ExtInt { pin: 2, vector: vectors::INT0, isc_shift: 0, index: 0 },
                ExtInt { pin: 3, vector: vectors::INT1, isc_shift: 2, index: 1 },
            ];
            for e in &ints {
                intc.register(VectorDesc {
                    num: e.vector,
                    enable: RegBit::new(regs::EIMSK, e.index),
                    flag: RegBit::new(regs::EIFR, e.index),
                    clear_on_ack: true,
                    level: true,
                });
            }
            ints
        } else {
            Vec::new()
        };

        ports.push(GpioPort {
            letter,
            pin_addr: pin,
            ddr_addr: ddr,
            port_addr: port,
            pins: [
                pin_ids[0], pin_ids[1], pin_ids[2], pin_ids[3], pin_ids[4], pin_ids[5],
                pin_ids[6], pin_ids[7],
            ],
            all,
            bank,
            pcmsk_addr: pcmsk,
            pcint_vector: vector,
            ext_ints,
            ext_driven: 0,
            ext_level: 0,
            hw_mask: 0,
            hw_level: 0,
        });
    }

    for addr in [regs::PCICR, regs::PCIFR, regs::EICRA, regs::EIMSK, regs::EIFR] {
        routes[addr as usize] = IoPort::PortCtl;
    }

    ports
}

impl Bus {
    pub(crate) fn port_read(&mut self, _pi: usize, addr: u16) -> u8 {
        // PIN/DDR/PORT bytes are kept current in the I/O file
        self.sram.get(addr)
    }

    pub(crate) fn port_write(&mut self, pi: usize, addr: u16, value: u8, _prev: u8) {
        let p = &self.io.ports[pi];
        if addr == p.pin_addr {
            // Writing PIN toggles PORT
            let port_addr = p.port_addr;
            let toggled = self.sram.get(port_addr) ^ value;
            self.sram.set(port_addr, toggled);
        } else {
            self.sram.set(addr, value);
        }
        self.port_refresh(pi);
    }

    /// Recompute the PIN sample and deliver any transitions
    pub(crate) fn port_refresh(&mut self, pi: usize) {
        let p = &self.io.ports[pi];
        let ddr = self.sram.get(p.ddr_addr);
        let port = self.sram.get(p.port_addr);
        let pin_addr = p.pin_addr;
        let new_pin = p.pin_visible(ddr, port);
        let old_pin = self.sram.get(pin_addr);
        if new_pin == old_pin {
            return;
        }
        self.sram.set(pin_addr, new_pin);
        self.port_transitions(pi, new_pin ^ old_pin, new_pin);
    }

    fn port_transitions(&mut self, pi: usize, changed: u8, new_pin: u8) {
        let p = &self.io.ports[pi];
        let pins = p.pins;
        let all = p.all;
        let pcmsk = self.sram.get(p.pcmsk_addr);
        let pcint_vector = p.pcint_vector;
        let ext_ints = p.ext_ints.clone();

        for pin in 0..8 {
            if changed & (1 << pin) != 0 {
                self.raise_irq(pins[pin], (new_pin >> pin) as u32 & 1);
            }
        }
        self.raise_irq(all, new_pin as u32);

        if changed & pcmsk != 0 {
            self.vector_raise(pcint_vector);
        }

        for e in &ext_ints {
            let mask = 1u8 << e.pin;
            if changed & mask == 0 {
                continue;
            }
            let high = new_pin & mask != 0;
            let mode = ExtIntMode::from_isc(self.sram.get(regs::EICRA) >> e.isc_shift);
            let fire = match mode {
                ExtIntMode::AnyEdge => true,
                ExtIntMode::Falling => !high,
                ExtIntMode::Rising => high,
                ExtIntMode::LowLevel => !high,
            };
            if fire {
                self.vector_raise(e.vector);
            } else if mode == ExtIntMode::LowLevel && high {
                // Level condition dropped
                self.vector_clear_flag(e.vector);
            }
        }
    }

    /// Routed delivery: an external driver changed a pin's level
    pub(crate) fn port_pin_driven(&mut self, pi: usize, pin: u8, value: u32) {
        let mask = 1u8 << pin;
        let ddr = self.sram.get(self.io.ports[pi].ddr_addr);
        if ddr & mask != 0 {
            // The pin is an output; the raise is an echo of our own drive
            return;
        }
        let p = &mut self.io.ports[pi];
        p.ext_driven |= mask;
        if value != 0 {
            p.ext_level |= mask;
        } else {
            p.ext_level &= !mask;
        }
        self.port_refresh(pi);
    }

    /// Compare-output hardware takes over (or releases) an output pin
    pub(crate) fn port_hw_drive(&mut self, pi: usize, pin: u8, level: Option<bool>) {
        let p = &mut self.io.ports[pi];
        let mask = 1u8 << pin;
        match level {
            Some(l) => {
                p.hw_mask |= mask;
                if l {
                    p.hw_level |= mask;
                } else {
                    p.hw_level &= !mask;
                }
            }
            None => {
                p.hw_mask &= !mask;
                p.hw_level &= !mask;
            }
        }
        self.port_refresh(pi);
    }

    /// Pin-change / external-interrupt control register writes
    pub(crate) fn port_ctl_write(&mut self, addr: u16, value: u8, prev: u8) {
        match addr {
            // Write-1-to-clear flag registers
            regs::PCIFR => {
                self.sram.set(addr, prev & !(value & 0x07));
                self.intc_sync(addr);
            }
            regs::EIFR => {
                self.sram.set(addr, prev & !(value & 0x03));
                self.intc_sync(addr);
                self.port_reassert_levels();
            }
            regs::EICRA | regs::EIMSK => {
                self.sram.set(addr, value);
                if addr == regs::EIMSK {
                    self.intc_sync(addr);
                }
                self.port_reassert_levels();
            }
            // PCICR and the PCMSKn masks
            _ => {
                self.sram.set(addr, value);
                self.intc_sync(addr);
            }
        }
    }

    /// Re-assert level-sensitive external interrupts whose pin is low.
    /// Called after flag clears and after vector acknowledge, which is
    /// how "re-raised while the condition holds" behaves at instruction
    /// granularity.
    pub(crate) fn port_reassert_levels(&mut self) {
        for pi in 0..self.io.ports.len() {
            let p = &self.io.ports[pi];
            if p.ext_ints.is_empty() {
                continue;
            }
            let pin_byte = self.sram.get(p.pin_addr);
            let ext_ints = p.ext_ints.clone();
            for e in &ext_ints {
                let mode = ExtIntMode::from_isc(self.sram.get(regs::EICRA) >> e.isc_shift);
                if mode == ExtIntMode::LowLevel && pin_byte & (1 << e.pin) == 0 {
                    self.vector_raise(e.vector);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_port() -> GpioPort {
        GpioPort {
            letter: 'b',
            pin_addr: regs::PINB,
            ddr_addr: regs::DDRB,
            port_addr: regs::PORTB,
            pins: [IrqId(0); 8],
            all: IrqId(0),
            bank: 0,
            pcmsk_addr: regs::PCMSK0,
            pcint_vector: vectors::PCINT0,
            ext_ints: Vec::new(),
            ext_driven: 0,
            ext_level: 0,
            hw_mask: 0,
            hw_level: 0,
        }
    }

    #[test]
    fn test_output_pins_follow_port() {
        let p = bare_port();
        assert_eq!(p.pin_visible(0xFF, 0xA5), 0xA5);
    }

    #[test]
    fn test_pullup_reads_high_without_driver() {
        let p = bare_port();
        // DDR=0, PORT=1, nothing driving: pulled up
        assert_eq!(p.pin_visible(0x00, 0x01), 0x01);
        // No pull-up: floating reads 0
        assert_eq!(p.pin_visible(0x00, 0x00), 0x00);
    }

    #[test]
    fn test_external_driver_wins_over_pullup() {
        let mut p = bare_port();
        p.ext_driven = 0x01;
        p.ext_level = 0x00;
        // Pulled up but driven low externally
        assert_eq!(p.pin_visible(0x00, 0x01), 0x00);
        p.ext_level = 0x01;
        assert_eq!(p.pin_visible(0x00, 0x00), 0x01);
    }

    #[test]
    fn test_hw_override_on_output_pin() {
        let mut p = bare_port();
        p.hw_mask = 0x02;
        p.hw_level = 0x02;
        // DDR output, PORT says 0, compare hardware says 1
        assert_eq!(p.pin_visible(0x02, 0x00), 0x02);
        p.hw_level = 0x00;
        assert_eq!(p.pin_visible(0x02, 0x02), 0x00);
    }

    #[test]
    fn test_ext_int_mode_decode() {
        assert_eq!(ExtIntMode::from_isc(0), ExtIntMode::LowLevel);
        assert_eq!(ExtIntMode::from_isc(1), ExtIntMode::AnyEdge);
        assert_eq!(ExtIntMode::from_isc(2), ExtIntMode::Falling);
        assert_eq!(ExtIntMode::from_isc(3), ExtIntMode::Rising);
        // Only the low two bits matter
        assert_eq!(ExtIntMode::from_isc(0x07), ExtIntMode::Rising);
    }
}
