//! Cycle-aware AVR microcontroller simulator core
//!
//! Loads a firmware image compiled for a supported AVR variant and
//! executes it instruction by instruction while modeling the
//! memory-mapped peripherals, the interrupt fabric, the I/O pins and the
//! timing relationships between them.
//!
//! # Architecture
//!
//! - `memory`: flash and the data space with its register/I-O overlay
//! - `bus`: address routing, IRQ delivery, timed-event dispatch
//! - `cpu`: AVR instruction decode/execute, SREG, sleep
//! - `scheduler`: the cycle-indexed queue behind every deferred action
//! - `interrupt`: the priority-ordered vector table
//! - `irq`: named signal nodes with synchronous notify callbacks
//! - `peripherals`: GPIO ports, timers, UART, SPI, TWI, ADC, EEPROM,
//!   watchdog
//! - `mcu`: the top-level stepping loop
//!
//! # Data space (ATmega48/88/168/328P family)
//!
//! | Address          | Region                        |
//! |------------------|-------------------------------|
//! | 0x0000 - 0x001F  | General register file r0..r31 |
//! | 0x0020 - 0x005F  | I/O registers                 |
//! | 0x0060 - 0x00FF  | Extended I/O registers        |
//! | 0x0100 - RAMEND  | Internal SRAM                 |
//!
//! External front ends (GDB stub, VCD tracer, GUI) attach through the
//! IRQ fabric, the read-only accessors, and the external event ring;
//! none of them live in this crate.

pub mod bus;
pub mod cpu;
pub mod fault;
pub mod firmware;
pub mod interrupt;
pub mod irq;
pub mod memory;
pub mod peripherals;
pub mod ring;
pub mod scheduler;
pub mod variant;

mod mcu;


pub use bus::Bus;
pub use cpu::{Cpu, CpuState, SleepMode};
pub use fault::{Fault, FaultKind, FirmwareError};
pub use firmware::{Command, CounterDef, Firmware, TraceRequest};
pub use irq::{IrqFabric, IrqFlags, IrqId};
pub use mcu::{Mcu, StopReason};
pub use ring::{EventSender, ExternalEvent};
pub use variant::{Variant, VariantId};
