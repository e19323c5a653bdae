//! Memory-mapped peripheral controllers
//!
//! Each peripheral owns a set of I/O register addresses (claimed in the
//! bus route table at construction), zero or more IRQ fabric nodes, and
//! zero or more interrupt vectors. Register bytes live in the data-space
//! I/O window; the structs here hold only derived state such as prescaler
//! phase, shift registers, queue handles and node ids.
//!
//! Peripherals are created once from the variant descriptor and live as
//! long as the simulator. `reset` restores data-sheet reset values in
//! registration order.

pub mod adc;
pub mod eeprom;
pub mod port;
pub mod spi;
pub mod timer;
pub mod twi;
pub mod uart;
pub mod watchdog;

pub use adc::Adc;
pub use eeprom::Eeprom;
pub use port::{ExtIntMode, GpioPort};
pub use spi::Spi;
pub use timer::Timer;
pub use twi::{Twi, TwiSlave};
pub use uart::Uart;
pub use watchdog::Watchdog;

use crate::interrupt::InterruptTable;
use crate::irq::IrqFabric;
use crate::memory::Sram;
use crate::variant::Variant;

/// Who handles an I/O address. The bus dispatches reads and writes in
/// the I/O window through this table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPort {
    /// Not present on this variant: reads 0, writes warn and are dropped
    None,
    /// Plain storage with no side effects (read back what was written)
    Data,
    /// GPIO port (index into `Peripherals::ports`)
    Gpio(u8),
    /// Pin-change / external-interrupt control registers
    PortCtl,
    /// Timer/counter (index into `Peripherals::timers`)
    Timer(u8),
    Uart,
    Spi,
    Twi,
    Adc,
    Eeprom,
    Watchdog,
    /// Intercepted as the simulator command register
    Command,
    /// Intercepted as the console output register
    Console,
}

/// All peripherals of one MCU instance
pub struct Peripherals {
    /// Ports B, C, D in order
    pub ports: Vec<GpioPort>,
    /// Timers 0 (8-bit), 1 (16-bit), 2 (8-bit)
    pub timers: Vec<Timer>,
    pub uart: Uart,
    pub spi: Spi,
    pub twi: Twi,
    pub adc: Adc,
    pub eeprom: Eeprom,
    pub watchdog: Watchdog,
}

impl Peripherals {
    /// Build every peripheral for `variant`, claiming route-table slots,
    /// fabric nodes and interrupt vectors.
    pub fn new(
        variant: &'static Variant,
        fabric: &mut IrqFabric,
        intc: &mut InterruptTable,
        routes: &mut [IoPort],
    ) -> Self {
        let ports = port::build_ports(fabric, intc, routes);
        let timers = timer::build_timers(fabric, intc, routes, &ports);
        let uart = Uart::new(fabric, intc, routes);
        let spi = Spi::new(fabric, intc, routes);
        let twi = Twi::new(fabric, intc, routes);
        let adc = Adc::new(fabric, intc, routes);
        let eeprom = Eeprom::new(variant, intc, routes);
        let watchdog = Watchdog::new(intc, routes);

        Self {
            ports,
            timers,
            uart,
            spi,
            twi,
            adc,
            eeprom,
            watchdog,
        }
    }

    /// Power-on/reset defaults, applied in registration order
    pub fn reset(&mut self, sram: &mut Sram) {
        for p in &mut self.ports {
            p.reset(sram);
        }
        for t in &mut self.timers {
            t.reset(sram);
        }
        self.uart.reset(sram);
        self.spi.reset(sram);
        self.twi.reset(sram);
        self.adc.reset(sram);
        self.eeprom.reset(sram);
        self.watchdog.reset(sram);
    }
}
