//! TWI (I²C) master with an attached slave bus
//!
//! The controller implements the documented master status codes: every
//! bus operation (start, address, data out, data in, stop) is one queue
//! entry timed from TWBR, and its completion latches the status into
//! TWSR, sets TWINT, and raises the TWI vector.
//!
//! The bus object owns a registry of slaves behind the [`TwiSlave`]
//! trait. Attach returns an index handle; the bus never owns more than
//! those indices and detach is explicit, so harness-side slaves can come
//! and go. At most one slave matches a given address; a second match is
//! reported as a bus conflict warning and ignored.
//!
//! Each state transition is also raised on a fabric node
//! (`twi.start`, `twi.mosi`, `twi.miso`, `twi.ack`, `twi.stop`) for
//! external observers.

use crate::bus::Bus;
use crate::interrupt::{InterruptTable, VectorDesc};
use crate::irq::{IrqFabric, IrqFlags, IrqId};
use crate::memory::{RegBit, Sram};
use crate::peripherals::IoPort;
use crate::scheduler::{Handle, TimedEvent};
use crate::variant::{regs, vectors};

/// TWCR bits
pub mod twcr {
    pub const TWIE: u8 = 1 << 0;
    pub const TWEN: u8 = 1 << 2;
    pub const TWWC: u8 = 1 << 3;
    pub const TWSTO: u8 = 1 << 4;
    pub const TWSTA: u8 = 1 << 5;
    pub const TWEA: u8 = 1 << 6;
    pub const TWINT: u8 = 1 << 7;
}

/// Master-mode status codes (TWSR with prescaler bits masked)
pub mod status {
    pub const START: u8 = 0x08;
    pub const REP_START: u8 = 0x10;
    pub const SLA_W_ACK: u8 = 0x18;
    pub const SLA_W_NACK: u8 = 0x20;
    pub const DATA_W_ACK: u8 = 0x28;
    pub const DATA_W_NACK: u8 = 0x30;
    pub const SLA_R_ACK: u8 = 0x40;
    pub const SLA_R_NACK: u8 = 0x48;
    pub const DATA_R_ACK: u8 = 0x50;
    pub const DATA_R_NACK: u8 = 0x58;
    pub const IDLE: u8 = 0xF8;
}

/// Read/write bit of the address byte
pub const ADDRESS_READ: u8 = 0x01;

/// A device attached to the TWI bus
pub trait TwiSlave {
    /// 7-bit address match
    fn matches(&self, address: u8) -> bool;
    /// Start (or repeated start) addressed to this slave; returns ACK
    fn start(&mut self, address: u8, read: bool) -> bool;
    /// Master wrote a byte; returns ACK
    fn write(&mut self, data: u8) -> bool;
    /// Master reads a byte
    fn read(&mut self) -> u8;
    /// Stop condition ends the transaction
    fn stop(&mut self);
}

/// The operation to perform when the pending queue entry fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TwiOp {
    None,
    Start,
    SendAddress,
    WriteData,
    ReadData,
    Stop,
}

pub struct Twi {
    op: TwiOp,
    /// Bus is between START and STOP
    started: bool,
    /// Index of the matched slave during a transaction
    peer: Option<usize>,
    reading: bool,
    handle: Option<Handle>,
    slaves: Vec<Option<Box<dyn TwiSlave>>>,

    pub start_irq: IrqId,
    pub mosi_irq: IrqId,
    pub miso_irq: IrqId,
    pub ack_irq: IrqId,
    pub stop_irq: IrqId,
}

impl Twi {
    pub(crate) fn new(
        fabric: &mut IrqFabric,
        intc: &mut InterruptTable,
        routes: &mut [IoPort],
    ) -> Self {
        let start_irq = fabric.alloc("twi.start", 8, IrqFlags::empty());
        let mosi_irq = fabric.alloc("twi.mosi", 8, IrqFlags::empty());
        let miso_irq = fabric.alloc("twi.miso", 8, IrqFlags::empty());
        let ack_irq = fabric.alloc("twi.ack", 1, IrqFlags::empty());
        let stop_irq = fabric.alloc("twi.stop", 1, IrqFlags::empty());

        intc.register(VectorDesc {
            num: vectors::TWI,
            enable: RegBit::new(regs::TWCR, 0),
            flag: RegBit::new(regs::TWCR, 7),
            clear_on_ack: false, // TWINT is cleared by firmware writing 1
            level: true,
        });

        for addr in [regs::TWBR, regs::TWSR, regs::TWAR, regs::TWDR, regs::TWCR] {
            routes[addr as usize] = IoPort::Twi;
        }

        Self {
            op: TwiOp::None,
            started: false,
            peer: None,
            reading: false,
            handle: None,
            slaves: Vec::new(),
            start_irq,
            mosi_irq,
            miso_irq,
            ack_irq,
            stop_irq,
        }
    }

    pub fn reset(&mut self, sram: &mut Sram) {
        sram.set(regs::TWBR, 0);
        sram.set(regs::TWSR, status::IDLE);
        sram.set(regs::TWAR, 0xFE);
        sram.set(regs::TWDR, 0xFF);
        sram.set(regs::TWCR, 0);
        self.op = TwiOp::None;
        self.started = false;
        self.peer = None;
        self.reading = false;
        self.handle = None;
    }

    /// Attach a slave; the returned index is its detach handle
    pub fn attach_slave(&mut self, slave: Box<dyn TwiSlave>) -> usize {
        if let Some(free) = self.slaves.iter().position(|s| s.is_none()) {
            self.slaves[free] = Some(slave);
            free
        } else {
            self.slaves.push(Some(slave));
            self.slaves.len() - 1
        }
    }

    /// Detach a previously attached slave
    pub fn detach_slave(&mut self, index: usize) {
        if let Some(slot) = self.slaves.get_mut(index) {
            *slot = None;
            if self.peer == Some(index) {
                self.peer = None;
            }
        }
    }

    /// Cycles per bus bit, SCL = f_cpu / (16 + 2·TWBR·prescale)
    pub fn bit_cycles(sram: &Sram) -> u64 {
        let twbr = sram.get(regs::TWBR) as u64;
        let prescale = 1u64 << (2 * (sram.get(regs::TWSR) & 0x03));
        16 + 2 * twbr * prescale
    }
}

impl Bus {
    pub(crate) fn twi_read(&mut self, addr: u16) -> u8 {
        self.sram.get(addr)
    }

    pub(crate) fn twi_write(&mut self, addr: u16, value: u8, prev: u8) {
        match addr {
            regs::TWCR => self.twi_control_write(value, prev),
            regs::TWDR => {
                let c = self.sram.get(regs::TWCR);
                if c & twcr::TWINT == 0 && self.io.twi.handle.is_some() {
                    // Write while the interface is busy
                    self.sram.set(regs::TWCR, c | twcr::TWWC);
                    return;
                }
                self.sram.set(addr, value);
            }
            regs::TWSR => {
                // Only the prescaler bits are writable
                let v = (prev & 0xF8) | (value & 0x03);
                self.sram.set(addr, v);
            }
            _ => self.sram.set(addr, value),
        }
    }

    fn twi_control_write(&mut self, value: u8, prev: u8) {
        // Writing 1 to TWINT clears it; everything else is stored
        let mut new = value & !twcr::TWINT;
        if value & twcr::TWINT == 0 {
            new |= prev & twcr::TWINT;
        }
        self.sram.set(regs::TWCR, new);
        self.intc_sync(regs::TWCR);

        if new & twcr::TWEN == 0 || value & twcr::TWINT == 0 {
            return;
        }

        // TWINT cleared with TWEN set: the interface runs its next op
        let op = if new & twcr::TWSTA != 0 {
            TwiOp::Start
        } else if new & twcr::TWSTO != 0 {
            TwiOp::Stop
        } else {
            match self.io.twi.op {
                TwiOp::SendAddress => TwiOp::SendAddress,
                TwiOp::WriteData => TwiOp::WriteData,
                TwiOp::ReadData => TwiOp::ReadData,
                other => other,
            }
        };
        if op == TwiOp::None {
            return;
        }
        self.io.twi.op = op;

        let bit = Twi::bit_cycles(&self.sram);
        let cycles = match op {
            TwiOp::Start | TwiOp::Stop => bit,
            // 8 data bits plus the ACK bit
            _ => 9 * bit,
        };
        let due = self.cycle + cycles;
        match self.io.twi.handle {
            Some(h) => self.queue.reschedule(h, due),
            None => {
                let h = self.queue.schedule(TimedEvent::TwiOp, due);
                self.io.twi.handle = Some(h);
            }
        }
    }

    /// Queue callback: the pending bus operation completed
    pub(crate) fn twi_event(&mut self, _due: u64) -> Option<u64> {
        self.io.twi.handle = None;
        match self.io.twi.op {
            TwiOp::Start => {
                let code = if self.io.twi.started {
                    status::REP_START
                } else {
                    status::START
                };
                self.io.twi.started = true;
                // Address byte follows once firmware loads TWDR
                self.io.twi.op = TwiOp::SendAddress;
                self.twi_complete(code);
            }
            TwiOp::SendAddress => {
                let sla = self.sram.get(regs::TWDR);
                let read = sla & ADDRESS_READ != 0;
                let address = sla >> 1;
                let start = self.io.twi.start_irq;
                self.raise_irq(start, sla as u32);

                let peer = self.twi_match_slave(address);
                let ack = match peer {
                    Some(index) => match self.io.twi.slaves[index].as_mut() {
                        Some(slave) => slave.start(address, read),
                        None => false,
                    },
                    None => false,
                };
                self.io.twi.peer = if ack { peer } else { None };
                self.io.twi.reading = read;
                let ack_irq = self.io.twi.ack_irq;
                self.raise_irq(ack_irq, ack as u32);

                let code = match (read, ack) {
                    (false, true) => status::SLA_W_ACK,
                    (false, false) => status::SLA_W_NACK,
                    (true, true) => status::SLA_R_ACK,
                    (true, false) => status::SLA_R_NACK,
                };
                self.io.twi.op = if ack {
                    if read { TwiOp::ReadData } else { TwiOp::WriteData }
                } else {
                    TwiOp::None
                };
                self.twi_complete(code);
            }
            TwiOp::WriteData => {
                let data = self.sram.get(regs::TWDR);
                let mosi = self.io.twi.mosi_irq;
                self.raise_irq(mosi, data as u32);
                let ack = match self.io.twi.peer {
                    Some(index) => match self.io.twi.slaves[index].as_mut() {
                        Some(slave) => slave.write(data),
                        None => false,
                    },
                    None => false,
                };
                let ack_irq = self.io.twi.ack_irq;
                self.raise_irq(ack_irq, ack as u32);
                self.twi_complete(if ack { status::DATA_W_ACK } else { status::DATA_W_NACK });
            }
            TwiOp::ReadData => {
                let data = match self.io.twi.peer {
                    Some(index) => match self.io.twi.slaves[index].as_mut() {
                        Some(slave) => slave.read(),
                        None => 0xFF,
                    },
                    None => 0xFF,
                };
                self.sram.set(regs::TWDR, data);
                let miso = self.io.twi.miso_irq;
                self.raise_irq(miso, data as u32);
                // TWEA decides whether the master acknowledges
                let master_ack = self.sram.get(regs::TWCR) & twcr::TWEA != 0;
                let ack_irq = self.io.twi.ack_irq;
                self.raise_irq(ack_irq, master_ack as u32);
                self.twi_complete(if master_ack { status::DATA_R_ACK } else { status::DATA_R_NACK });
            }
            TwiOp::Stop => {
                if let Some(index) = self.io.twi.peer.take() {
                    if let Some(slave) = self.io.twi.slaves[index].as_mut() {
                        slave.stop();
                    }
                }
                self.io.twi.started = false;
                self.io.twi.op = TwiOp::None;
                let stop = self.io.twi.stop_irq;
                self.raise_irq(stop, 1);
                self.twi_set_status(status::IDLE);
                // TWSTO clears itself; no TWINT after a stop
                let c = self.sram.get(regs::TWCR) & !twcr::TWSTO;
                self.sram.set(regs::TWCR, c);
            }
            TwiOp::None => {}
        }
        None
    }

    /// Exactly one slave may match; extras are a bus conflict
    fn twi_match_slave(&mut self, address: u8) -> Option<usize> {
        let mut matched = None;
        for (i, slot) in self.io.twi.slaves.iter().enumerate() {
            let Some(slave) = slot else { continue };
            if !slave.matches(address) {
                continue;
            }
            if matched.is_some() {
                log::warn!("TWI bus conflict: multiple slaves match address {:#04x}", address);
                self.peripheral_warning();
                break;
            }
            matched = Some(i);
        }
        if let Some(i) = matched {
            log::debug!("twi bus: slave {:#04x} selected (slot {})", address, i);
        }
        matched
    }

    fn twi_set_status(&mut self, code: u8) {
        let prescale = self.sram.get(regs::TWSR) & 0x03;
        self.sram.set(regs::TWSR, code | prescale);
    }

    /// Latch status, set TWINT, raise the vector
    fn twi_complete(&mut self, code: u8) {
        self.twi_set_status(code);
        let c = self.sram.get(regs::TWCR) | twcr::TWINT;
        self.sram.set(regs::TWCR, c);
        self.vector_raise(vectors::TWI);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_cycles() {
        let mut sram = Sram::new(0x500);
        sram.set(regs::TWBR, 0);
        assert_eq!(Twi::bit_cycles(&sram), 16);
        // 100 kHz at 8 MHz: TWBR = 32, prescale 1
        sram.set(regs::TWBR, 32);
        assert_eq!(Twi::bit_cycles(&sram), 80);
        // Prescaler ×4
        sram.set(regs::TWSR, 0x01);
        assert_eq!(Twi::bit_cycles(&sram), 16 + 2 * 32 * 4);
    }

    struct Probe {
        address: u8,
    }

    impl TwiSlave for Probe {
        fn matches(&self, address: u8) -> bool {
            address == self.address
        }
        fn start(&mut self, _address: u8, _read: bool) -> bool {
            true
        }
        fn write(&mut self, _data: u8) -> bool {
            true
        }
        fn read(&mut self) -> u8 {
            0xAA
        }
        fn stop(&mut self) {}
    }

    #[test]
    fn test_attach_detach_reuses_slots() {
        let mut fabric = IrqFabric::new();
        let mut intc = InterruptTable::new(26);
        let mut routes = vec![IoPort::None; 0x100];
        let mut twi = Twi::new(&mut fabric, &mut intc, &mut routes);

        let a = twi.attach_slave(Box::new(Probe { address: 0x50 }));
        let b = twi.attach_slave(Box::new(Probe { address: 0x51 }));
        assert_ne!(a, b);

        twi.detach_slave(a);
        let c = twi.attach_slave(Box::new(Probe { address: 0x52 }));
        assert_eq!(a, c);
    }
}
