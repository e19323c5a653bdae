//! USART, asynchronous mode
//!
//! Transmission is a single queue entry: writing UDR moves the byte into
//! the shift register and schedules completion after
//! `bits_per_frame × clocks_per_bit` cycles (`clocks_per_bit` is
//! `16 × (UBRR + 1)`, halved in double-speed mode). When it fires, TXC is
//! set and the output node carries the byte. With loopback enabled the
//! byte enters the receive path at that same instant, the two shift
//! registers being clocked by the same wire.
//!
//! Reception models the hardware's two-level FIFO in front of UDR; a
//! byte arriving with the FIFO full sets DOR and is dropped with a
//! warning. Input bytes arrive on the `uart.in` fabric node.

use std::collections::VecDeque;

use crate::bus::Bus;
use crate::interrupt::{InterruptTable, VectorDesc};
use crate::irq::{IrqFabric, IrqFlags, IrqId, IrqTarget};
use crate::memory::{RegBit, Sram};
use crate::peripherals::IoPort;
use crate::scheduler::{Handle, TimedEvent};
use crate::variant::{regs, vectors};

/// UCSRA bits
pub mod ucsra {
    pub const MPCM: u8 = 1 << 0;
    pub const U2X: u8 = 1 << 1;
    pub const UPE: u8 = 1 << 2;
    pub const DOR: u8 = 1 << 3;
    pub const FE: u8 = 1 << 4;
    pub const UDRE: u8 = 1 << 5;
    pub const TXC: u8 = 1 << 6;
    pub const RXC: u8 = 1 << 7;
}

/// UCSRB bits
pub mod ucsrb {
    pub const TXB8: u8 = 1 << 0;
    pub const RXB8: u8 = 1 << 1;
    pub const UCSZ2: u8 = 1 << 2;
    pub const TXEN: u8 = 1 << 3;
    pub const RXEN: u8 = 1 << 4;
    pub const UDRIE: u8 = 1 << 5;
    pub const TXCIE: u8 = 1 << 6;
    pub const RXCIE: u8 = 1 << 7;
}

/// Receive FIFO depth in front of UDR
const RX_FIFO_DEPTH: usize = 2;

pub struct Uart {
    /// Byte in the transmit shift register
    tx_shift: u8,
    /// Buffered byte waiting for the shift register
    tx_next: Option<u8>,
    tx_handle: Option<Handle>,
    rx_fifo: VecDeque<u8>,
    /// Bytes sent appear here
    pub out_irq: IrqId,
    /// External producers raise received bytes here
    pub in_irq: IrqId,
    /// Wire TX back into RX (simulator command)
    pub loopback: bool,
}

impl Uart {
    pub(crate) fn new(
        fabric: &mut IrqFabric,
        intc: &mut InterruptTable,
        routes: &mut [IoPort],
    ) -> Self {
        let out_irq = fabric.alloc("uart0.out", 8, IrqFlags::empty());
        let in_irq = fabric.alloc("uart0.in", 8, IrqFlags::empty());
        fabric.register_route(in_irq, IrqTarget::UartRx);

        intc.register(VectorDesc {
            num: vectors::USART_RX,
            enable: RegBit::new(regs::UCSR0B, 7),
            flag: RegBit::new(regs::UCSR0A, 7),
            clear_on_ack: false, // RXC follows the FIFO, cleared by reading UDR
            level: true,
        });
        intc.register(VectorDesc {
            num: vectors::USART_UDRE,
            enable: RegBit::new(regs::UCSR0B, 5),
            flag: RegBit::new(regs::UCSR0A, 5),
            clear_on_ack: false, // UDRE cleared by writing UDR
            level: true,
        });
        intc.register(VectorDesc {
            num: vectors::USART_TX,
            enable: RegBit::new(regs::UCSR0B, 6),
            flag: RegBit::new(regs::UCSR0A, 6),
            clear_on_ack: true,
            level: false,
        });

        for addr in [
            regs::UDR0,
            regs::UCSR0A,
            regs::UCSR0B,
            regs::UCSR0C,
            regs::UBRR0L,
            regs::UBRR0H,
        ] {
            routes[addr as usize] = IoPort::Uart;
        }

        Self {
            tx_shift: 0,
            tx_next: None,
            tx_handle: None,
            rx_fifo: VecDeque::with_capacity(RX_FIFO_DEPTH),
            out_irq,
            in_irq,
            loopback: false,
        }
    }

    pub fn reset(&mut self, sram: &mut Sram) {
        sram.set(regs::UCSR0A, ucsra::UDRE);
        sram.set(regs::UCSR0B, 0);
        // 8N1
        sram.set(regs::UCSR0C, 0x06);
        sram.set(regs::UBRR0L, 0);
        sram.set(regs::UBRR0H, 0);
        sram.set(regs::UDR0, 0);
        self.tx_shift = 0;
        self.tx_next = None;
        self.tx_handle = None;
        self.rx_fifo.clear();
        self.loopback = false;
    }

    /// Cycles one frame occupies on the wire
    pub fn frame_cycles(sram: &Sram) -> u64 {
        let ubrr = sram.get(regs::UBRR0L) as u64 | ((sram.get(regs::UBRR0H) as u64 & 0x0F) << 8);
        let a = sram.get(regs::UCSR0A);
        let b = sram.get(regs::UCSR0B);
        let c = sram.get(regs::UCSR0C);

        let clocks_per_bit = (ubrr + 1) * if a & ucsra::U2X != 0 { 8 } else { 16 };

        let ucsz = ((b & ucsrb::UCSZ2) >> 2) << 2 | ((c >> 1) & 0x03);
        let data_bits = match ucsz {
            0 => 5,
            1 => 6,
            2 => 7,
            7 => 9,
            _ => 8,
        };
        let parity = if c & 0x20 != 0 { 1 } else { 0 };
        let stops = if c & 0x08 != 0 { 2 } else { 1 };
        let frame_bits = 1 + data_bits + parity + stops;

        frame_bits * clocks_per_bit
    }
}

impl Bus {
    pub(crate) fn uart_read(&mut self, addr: u16) -> u8 {
        if addr != regs::UDR0 {
            return self.sram.get(addr);
        }
        let Some(byte) = self.io.uart.rx_fifo.pop_front() else {
            return 0;
        };
        let mut a = self.sram.get(regs::UCSR0A);
        a &= !ucsra::DOR;
        if self.io.uart.rx_fifo.is_empty() {
            a &= !ucsra::RXC;
        }
        self.sram.set(regs::UCSR0A, a);
        self.intc_sync(regs::UCSR0A);
        byte
    }

    pub(crate) fn uart_write(&mut self, addr: u16, value: u8, prev: u8) {
        match addr {
            regs::UDR0 => self.uart_push_tx(value),
            regs::UCSR0A => {
                // MPCM/U2X writable, TXC write-1-to-clear, the rest read-only
                let mut a = (prev & !(ucsra::MPCM | ucsra::U2X)) | (value & (ucsra::MPCM | ucsra::U2X));
                if value & ucsra::TXC != 0 {
                    a &= !ucsra::TXC;
                }
                self.sram.set(addr, a);
                self.intc_sync(addr);
            }
            regs::UCSR0B => {
                self.sram.set(addr, value);
                self.intc_sync(addr);
            }
            _ => {
                self.sram.set(addr, value);
            }
        }
    }

    fn uart_push_tx(&mut self, byte: u8) {
        let b = self.sram.get(regs::UCSR0B);
        if b & ucsrb::TXEN == 0 {
            log::warn!("UDR written with transmitter disabled, byte {:#04x} dropped", byte);
            self.peripheral_warning();
            return;
        }
        if self.io.uart.tx_handle.is_none() {
            self.uart_start_shift(byte);
        } else {
            // Shift register busy: the byte waits in the data register
            self.io.uart.tx_next = Some(byte);
            RegBit::new(regs::UCSR0A, 5).clear(&mut self.sram);
            self.intc_sync(regs::UCSR0A);
        }
    }

    fn uart_start_shift(&mut self, byte: u8) {
        let frame = Uart::frame_cycles(&self.sram);
        let due = self.cycle + frame;
        self.io.uart.tx_shift = byte;
        let handle = self.queue.schedule(TimedEvent::UartTx, due);
        self.io.uart.tx_handle = Some(handle);
    }

    /// Queue callback: the shift register ran dry
    pub(crate) fn uart_tx_event(&mut self, due: u64) -> Option<u64> {
        let byte = self.io.uart.tx_shift;

        self.vector_raise(vectors::USART_TX);
        let out = self.io.uart.out_irq;
        self.raise_irq(out, byte as u32);

        if self.io.uart.loopback {
            self.uart_rx_byte(byte as u32);
        }

        if let Some(next) = self.io.uart.tx_next.take() {
            // The dispatcher re-arms the same slot, so tx_handle stays valid
            self.io.uart.tx_shift = next;
            RegBit::new(regs::UCSR0A, 5).set(&mut self.sram);
            self.vector_raise(vectors::USART_UDRE);
            let frame = Uart::frame_cycles(&self.sram);
            return Some(due + frame);
        }
        self.io.uart.tx_handle = None;
        None
    }

    /// Routed delivery: a byte arrived on the receive line
    pub(crate) fn uart_rx_byte(&mut self, value: u32) {
        let b = self.sram.get(regs::UCSR0B);
        if b & ucsrb::RXEN == 0 {
            return;
        }
        if self.io.uart.rx_fifo.len() >= RX_FIFO_DEPTH {
            log::warn!("UART receive overrun, byte {:#04x} lost", value as u8);
            RegBit::new(regs::UCSR0A, 3).set(&mut self.sram);
            self.peripheral_warning();
            return;
        }
        self.io.uart.rx_fifo.push_back(value as u8);
        self.vector_raise(vectors::USART_RX);
    }

    pub(crate) fn uart_set_loopback(&mut self, on: bool) {
        self.io.uart.loopback = on;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_cycles_default_8n1() {
        let mut sram = Sram::new(0x500);
        sram.set(regs::UCSR0C, 0x06); // 8N1
        sram.set(regs::UBRR0L, 0);
        // 10 bits × 16 clocks
        assert_eq!(Uart::frame_cycles(&sram), 160);
    }

    #[test]
    fn test_frame_cycles_baud_divisor() {
        let mut sram = Sram::new(0x500);
        sram.set(regs::UCSR0C, 0x06);
        sram.set(regs::UBRR0L, 51); // 9600 at 8 MHz
        assert_eq!(Uart::frame_cycles(&sram), 10 * 52 * 16);
    }

    #[test]
    fn test_frame_cycles_double_speed() {
        let mut sram = Sram::new(0x500);
        sram.set(regs::UCSR0C, 0x06);
        sram.set(regs::UBRR0L, 51);
        sram.set(regs::UCSR0A, ucsra::U2X);
        assert_eq!(Uart::frame_cycles(&sram), 10 * 52 * 8);
    }

    #[test]
    fn test_frame_cycles_9e2() {
        let mut sram = Sram::new(0x500);
        // 9 data bits, even parity, 2 stop bits
        sram.set(regs::UCSR0C, 0x06 | 0x20 | 0x08);
        sram.set(regs::UCSR0B, ucsrb::UCSZ2);
        sram.set(regs::UBRR0L, 0);
        // 1 start + 9 data + 1 parity + 2 stop = 13 bits
        assert_eq!(Uart::frame_cycles(&sram), 13 * 16);
    }
}
