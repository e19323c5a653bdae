//! Simulator orchestrator
//!
//! [`Mcu`] owns the CPU and the bus and advances the simulation one
//! instruction at a time: drain the external event ring, service the
//! highest-priority pending interrupt, execute (or fast-forward sleep),
//! then run the cycle queue entries that came due. Interrupts raised by
//! peripheral callbacks during a step become visible to the CPU after
//! the step returns, never mid-instruction.
//!
//! A firmware that executes SLEEP with the global interrupt enable clear
//! can never wake; the loop treats that as a clean exit, which is how
//! the test firmwares signal success.

use crate::bus::Bus;
use crate::cpu::{Cpu, CpuState};
use crate::fault::{Fault, FaultKind, FirmwareError};
use crate::firmware::Firmware;
use crate::ring::{event_ring, EventReceiver, EventSender};
use crate::variant::Variant;

/// Cycles to skip per step while sleeping with an empty queue, so the
/// external event ring keeps being polled
const IDLE_QUANTUM: u64 = 1024;

/// Capacity of the external event ring
const RING_CAPACITY: usize = 1024;

/// Why the stepping loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// SLEEP with the I flag clear: the firmware is done
    SleepWithIrqOff,
    /// The firmware issued the exit command
    ExitCommand,
    /// A fault halted the CPU
    Fault(Fault),
    /// The watchdog expired in reset mode
    WatchdogReset,
    /// An external observer called `halt`
    Halted,
}

impl StopReason {
    /// Process exit code for a harness
    pub fn exit_code(&self) -> i32 {
        match self {
            StopReason::SleepWithIrqOff | StopReason::ExitCommand => 0,
            StopReason::Fault(f) => match f.kind() {
                FaultKind::Decode => 1,
                FaultKind::Memory => 2,
                FaultKind::Io => 3,
                FaultKind::Config => 4,
            },
            StopReason::WatchdogReset => 5,
            StopReason::Halted => 6,
        }
    }
}

/// One simulated MCU
pub struct Mcu {
    pub cpu: Cpu,
    pub bus: Bus,
    events: EventReceiver,
    /// Producer half of the ring, handed out once
    pending_link: Option<EventSender>,
    stop: Option<StopReason>,
    /// When set, a watchdog reset restarts the firmware instead of
    /// stopping the simulation
    pub watchdog_restarts: bool,
}

impl Mcu {
    /// Build a simulator from a typed firmware descriptor
    pub fn new(firmware: &Firmware) -> Result<Self, FirmwareError> {
        if !firmware.name.is_empty() {
            match Variant::by_name(&firmware.name) {
                Some(v) if v.id == firmware.variant => {}
                Some(_) | None => {
                    log::warn!(
                        "firmware metadata names '{}', which is not the selected variant",
                        firmware.name
                    );
                }
            }
        }
        let bus = Bus::new(firmware)?;
        let cpu = Cpu::new(bus.variant);
        let (tx, rx) = event_ring(RING_CAPACITY);
        Ok(Self {
            cpu,
            bus,
            events: rx,
            pending_link: Some(tx),
            stop: None,
            watchdog_restarts: false,
        })
    }

    /// Producer handle for one external observer thread. Returns None
    /// once it has been claimed; the ring is single-producer.
    pub fn external_link(&mut self) -> Option<EventSender> {
        self.pending_link.take()
    }

    /// Power-on reset; the cycle counter keeps its value
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.bus.reset();
        self.stop = None;
    }

    /// Request a clean stop at the next instruction boundary
    pub fn halt(&mut self) {
        self.cpu.halt();
        self.stop = Some(StopReason::Halted);
    }

    pub fn cycle(&self) -> u64 {
        self.bus.cycle
    }

    pub fn pc(&self) -> u32 {
        self.cpu.pc
    }

    pub fn state(&self) -> CpuState {
        self.cpu.state
    }

    /// Advance by one instruction (or one sleep skip / interrupt entry).
    /// Returns the stop reason once the simulation is finished.
    pub fn step(&mut self) -> Option<StopReason> {
        if let Some(stop) = &self.stop {
            return Some(stop.clone());
        }

        // External observers first: their raises may pend interrupts
        while let Some(event) = self.events.pop() {
            self.bus.raise_irq(event.irq, event.value);
        }

        if let Some(stop) = self.take_bus_requests() {
            return Some(stop);
        }

        // Interrupt service happens only between instructions
        if self.cpu.interrupts_enabled() {
            if let Some(vector) = self.bus.intc.pending_vector() {
                match self.cpu.service_interrupt(&mut self.bus, vector) {
                    Ok(cycles) => {
                        self.bus.acknowledge_vector(vector);
                        self.bus.tick(cycles);
                        return None;
                    }
                    Err(fault) => return Some(self.fail(fault)),
                }
            }
        }

        match self.cpu.state {
            CpuState::Running => match self.cpu.step(&mut self.bus) {
                Ok(cycles) => {
                    self.bus.tick(cycles);
                    None
                }
                Err(fault) => Some(self.fail(fault)),
            },
            CpuState::Sleeping => {
                if !self.cpu.interrupts_enabled() {
                    self.stop = Some(StopReason::SleepWithIrqOff);
                    self.cpu.halt();
                    return self.stop.clone();
                }
                // Skip idle time to the next scheduled event
                let target = match self.bus.queue.next_due() {
                    Some(due) => due.max(self.bus.cycle),
                    None => self.bus.cycle + IDLE_QUANTUM,
                };
                self.bus.cycle = target;
                self.bus.run_due_events();
                None
            }
            CpuState::Halted => {
                self.stop = Some(StopReason::Halted);
                self.stop.clone()
            }
        }
    }

    /// Run until the firmware finishes, faults, or is halted
    pub fn run(&mut self) -> StopReason {
        loop {
            if let Some(stop) = self.step() {
                return stop;
            }
        }
    }

    /// Run for at most `cycles` simulated cycles; returns the stop
    /// reason if the simulation finished inside the window.
    pub fn run_cycles(&mut self, cycles: u64) -> Option<StopReason> {
        let end = self.bus.cycle.saturating_add(cycles);
        while self.bus.cycle < end {
            if let Some(stop) = self.step() {
                return Some(stop);
            }
        }
        None
    }

    fn take_bus_requests(&mut self) -> Option<StopReason> {
        if self.bus.exit_request {
            self.bus.exit_request = false;
            self.cpu.halt();
            self.stop = Some(StopReason::ExitCommand);
            return self.stop.clone();
        }
        if self.bus.reset_request {
            self.reset();
            return None;
        }
        if self.bus.watchdog_reset {
            self.bus.watchdog_reset = false;
            if self.watchdog_restarts {
                let mcusr = self.bus.sram.get(crate::variant::regs::MCUSR);
                self.reset();
                // The watchdog-reset flag survives the reset
                self.bus.sram.set(crate::variant::regs::MCUSR, mcusr);
                return None;
            }
            self.cpu.halt();
            self.stop = Some(StopReason::WatchdogReset);
            return self.stop.clone();
        }
        None
    }

    fn fail(&mut self, fault: Fault) -> StopReason {
        log::warn!("cpu fault: {}", fault);
        self.cpu.halt();
        let stop = StopReason::Fault(fault);
        self.stop = Some(stop.clone());
        stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::VariantId;

    /// Assemble 16-bit opcode words into a little-endian flash image
    pub(crate) fn assemble(words: &[u16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn mcu_with(words: &[u16]) -> Mcu {
        let fw = Firmware::new(VariantId::Atmega88, 8_000_000, assemble(words));
        Mcu::new(&fw).unwrap()
    }

    #[test]
    fn test_sleep_with_irq_off_is_clean_exit() {
        // ldi r16,1 ; out SMCR,r16 ; sleep
        let mut mcu = mcu_with(&[0xE001, 0xBF03, 0x9588]);
        let stop = mcu.run();
        assert_eq!(stop, StopReason::SleepWithIrqOff);
        assert_eq!(stop.exit_code(), 0);
        assert_eq!(mcu.cycle(), 3);
    }

    #[test]
    fn test_illegal_opcode_faults() {
        // nop ; 0x00FF is undefined
        let mut mcu = mcu_with(&[0x0000, 0x00FF]);
        let stop = mcu.run();
        match stop {
            StopReason::Fault(Fault::Decode { pc, opcode }) => {
                assert_eq!(pc, 2);
                assert_eq!(opcode, 0x00FF);
            }
            other => panic!("expected decode fault, got {:?}", other),
        }
        // The fetch did not advance the cycle counter
        assert_eq!(mcu.cycle(), 1);
        assert_eq!(stop.exit_code(), 1);
    }

    #[test]
    fn test_halt_between_instructions() {
        // rjmp .-2 (spin forever)
        let mut mcu = mcu_with(&[0xCFFF]);
        assert!(mcu.run_cycles(100).is_none());
        mcu.halt();
        assert_eq!(mcu.run(), StopReason::Halted);
    }

    #[test]
    fn test_external_link_is_single_producer() {
        let mut mcu = mcu_with(&[0xCFFF]);
        assert!(mcu.external_link().is_some());
        assert!(mcu.external_link().is_none());
    }

    #[test]
    fn test_external_event_drives_pin() {
        let mut mcu = mcu_with(&[0xCFFF]);
        let link = mcu.external_link().unwrap();
        let pin = mcu.bus.io.ports[0].pins[4];
        link.push(crate::ring::ExternalEvent { irq: pin, value: 1 }).unwrap();

        mcu.run_cycles(10);
        assert_eq!(mcu.bus.sram.get(crate::variant::regs::PINB) & 0x10, 0x10);
    }

    #[test]
    fn test_reset_preserves_cycle_counter() {
        let mut mcu = mcu_with(&[0x0000, 0x0000, 0xCFFF]);
        mcu.run_cycles(50);
        let cycle = mcu.cycle();
        mcu.reset();
        assert_eq!(mcu.cycle(), cycle);
        assert_eq!(mcu.pc(), 0);
    }
}
