//! Watchdog timer
//!
//! One queue entry at `2048 << WDP` ticks of the 128 kHz watchdog
//! oscillator, rescaled to CPU cycles. The WDR instruction re-arms it.
//! Firing raises the WDT vector (WDIE), forces a watchdog reset (WDE),
//! or both in sequence: in interrupt-and-reset mode the hardware clears
//! WDIE after taking the interrupt, so the following timeout resets.
//!
//! Configuration is guarded by the timed-change sequence: WDE and the
//! prescaler only change while the WDCE window (four cycles after
//! writing WDCE+WDE) is open.

use crate::bus::Bus;
use crate::interrupt::{InterruptTable, VectorDesc};
use crate::memory::{RegBit, Sram};
use crate::peripherals::IoPort;
use crate::scheduler::{Handle, TimedEvent};
use crate::variant::{regs, vectors};

/// WDTCSR bits
pub mod wdtcsr {
    pub const WDP_LOW: u8 = 0x07;
    pub const WDE: u8 = 1 << 3;
    pub const WDCE: u8 = 1 << 4;
    pub const WDP3: u8 = 1 << 5;
    pub const WDIE: u8 = 1 << 6;
    pub const WDIF: u8 = 1 << 7;
}

/// Watchdog oscillator frequency
const WDT_HZ: u64 = 128_000;
/// Cycles the WDCE change-enable window stays open
const WDCE_WINDOW_CYCLES: u64 = 4;

/// MCUSR watchdog-reset flag
const MCUSR_WDRF: u8 = 1 << 3;

pub struct Watchdog {
    handle: Option<Handle>,
    /// Cycle until which WDE/prescaler changes are accepted
    wdce_until: u64,
}

impl Watchdog {
    pub(crate) fn new(intc: &mut InterruptTable, routes: &mut [IoPort]) -> Self {
        intc.register(VectorDesc {
            num: vectors::WDT,
            enable: RegBit::new(regs::WDTCSR, 6),
            flag: RegBit::new(regs::WDTCSR, 7),
            clear_on_ack: true,
            level: false,
        });
        routes[regs::WDTCSR as usize] = IoPort::Watchdog;

        Self { handle: None, wdce_until: 0 }
    }

    pub fn reset(&mut self, sram: &mut Sram) {
        sram.set(regs::WDTCSR, 0);
        self.handle = None;
        self.wdce_until = 0;
    }

    /// Timeout in watchdog-oscillator ticks for a WDP setting
    pub fn timeout_ticks(wdp: u8) -> u64 {
        2048u64 << (wdp & 0x0F).min(9)
    }

    /// WDP field assembled from its split bits
    pub fn wdp(ctl: u8) -> u8 {
        (ctl & wdtcsr::WDP_LOW) | ((ctl & wdtcsr::WDP3) >> 2)
    }

    /// Timeout in CPU cycles
    pub fn timeout_cycles(ctl: u8, f_cpu: u32) -> u64 {
        Self::timeout_ticks(Self::wdp(ctl)) * f_cpu as u64 / WDT_HZ
    }
}

impl Bus {
    pub(crate) fn watchdog_read(&mut self, addr: u16) -> u8 {
        self.sram.get(addr)
    }

    pub(crate) fn watchdog_write(&mut self, addr: u16, value: u8, prev: u8) {
        let guarded = wdtcsr::WDE | wdtcsr::WDP_LOW | wdtcsr::WDP3;
        let window_open = self.cycle <= self.io.watchdog.wdce_until;

        let mut new = prev;
        // WDIF is write-1-to-clear
        if value & wdtcsr::WDIF != 0 {
            new &= !wdtcsr::WDIF;
        }
        new = (new & !wdtcsr::WDIE) | (value & wdtcsr::WDIE);

        if value & (wdtcsr::WDCE | wdtcsr::WDE) == (wdtcsr::WDCE | wdtcsr::WDE) {
            // Opens the timed change window
            new |= wdtcsr::WDCE;
            self.io.watchdog.wdce_until = self.cycle + WDCE_WINDOW_CYCLES;
        } else {
            new &= !wdtcsr::WDCE;
        }

        if window_open || value & wdtcsr::WDE != 0 {
            // Within the window any change is allowed; setting WDE is
            // always allowed (safety direction)
            new = (new & !guarded) | (value & guarded);
        } else if value & guarded != prev & guarded {
            log::warn!("WDTCSR change without WDCE window, protected bits kept");
            self.peripheral_warning();
        }

        self.sram.set(addr, new);
        self.intc_sync(addr);
        self.watchdog_rearm();
    }

    /// WDR instruction, and any configuration change, restart the count
    pub(crate) fn wdr(&mut self) {
        self.watchdog_rearm();
    }

    fn watchdog_rearm(&mut self) {
        let ctl = self.sram.get(regs::WDTCSR);
        let active = ctl & (wdtcsr::WDE | wdtcsr::WDIE) != 0;
        match (active, self.io.watchdog.handle) {
            (false, Some(h)) => {
                self.queue.cancel(h);
                self.io.watchdog.handle = None;
            }
            (false, None) => {}
            (true, existing) => {
                let due = self.cycle + Watchdog::timeout_cycles(ctl, self.f_cpu);
                match existing {
                    Some(h) => self.queue.reschedule(h, due),
                    None => {
                        let h = self.queue.schedule(TimedEvent::Watchdog, due);
                        self.io.watchdog.handle = Some(h);
                    }
                }
            }
        }
    }

    /// Queue callback: the watchdog expired
    pub(crate) fn watchdog_event(&mut self, due: u64) -> Option<u64> {
        let ctl = self.sram.get(regs::WDTCSR);
        if ctl & wdtcsr::WDIE != 0 {
            self.vector_raise(vectors::WDT);
            // Hardware drops back to reset mode after the interrupt; the
            // pending state recorded above survives the enable clear
            let c = self.sram.get(regs::WDTCSR);
            self.sram.set(regs::WDTCSR, c & !wdtcsr::WDIE);
            return Some(due + Watchdog::timeout_cycles(ctl, self.f_cpu));
        }
        if ctl & wdtcsr::WDE != 0 {
            let mcusr = self.sram.get(regs::MCUSR);
            self.sram.set(regs::MCUSR, mcusr | MCUSR_WDRF);
            self.watchdog_reset = true;
        }
        self.io.watchdog.handle = None;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_ticks() {
        assert_eq!(Watchdog::timeout_ticks(0), 2048);
        assert_eq!(Watchdog::timeout_ticks(3), 16384);
        assert_eq!(Watchdog::timeout_ticks(9), 2048 << 9);
    }

    #[test]
    fn test_wdp_split_field() {
        // WDP3 lives in bit 5
        assert_eq!(Watchdog::wdp(0x03), 3);
        assert_eq!(Watchdog::wdp(wdtcsr::WDP3 | 0x01), 0x09);
    }

    #[test]
    fn test_timeout_cycles_120ms() {
        // WDP=3 is 16k ticks of 128 kHz = 125 ms
        let cycles = Watchdog::timeout_cycles(0x03, 8_000_000);
        assert_eq!(cycles, 16384 * 8_000_000 / 128_000);
        assert_eq!(cycles, 1_024_000);
    }
}
