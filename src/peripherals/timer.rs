//! Timer/counters
//!
//! Three instances on the supported family: Timer0 and Timer2 (8-bit),
//! Timer1 (16-bit with input capture). The counter itself is virtual:
//! the struct records the count at a reference cycle and the prescaler
//! ratio, and a single queue entry sits at the next interesting boundary
//! (compare match, TOP turn-around, overflow). Reading TCNT interpolates
//! from the cycle counter; firing the entry raises the flags, applies
//! compare-output actions, and re-arms at the following boundary.
//!
//! A boundary is processed when the counter *passes* the value: a compare
//! register OCR produces its match one timer tick after the counter
//! reaches OCR, so in CTC mode the first match lands at
//! `prescale × (OCR + 1)` cycles after the timer starts from zero, with
//! TCNT reading 0 immediately afterwards.
//!
//! External clock (T0/T1 pin) and input capture (ICP1) arrive through
//! fabric routes connected to the GPIO pin nodes.

use crate::bus::Bus;
use crate::interrupt::{InterruptTable, VectorDesc};
use crate::irq::{IrqFabric, IrqFlags, IrqId, IrqTarget};
use crate::memory::{RegBit, Sram};
use crate::peripherals::{GpioPort, IoPort};
use crate::scheduler::{Handle, TimedEvent};
use crate::variant::{regs, vectors};

/// Waveform generation shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wgm {
    Normal,
    Ctc,
    FastPwm,
    PhaseCorrect,
}

/// Decoded waveform mode plus TOP value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub wgm: Wgm,
    pub top: u32,
}

/// Compare channels
const CHAN_A: usize = 0;
const CHAN_B: usize = 1;

/// One timer/counter instance
pub struct Timer {
    pub idx: usize,
    bits16: bool,
    max: u32,

    // Register addresses
    tccra: u16,
    tccrb: u16,
    tcnt: u16,
    tcnt_h: Option<u16>,
    ocr: [u16; 2],
    ocr_h: [Option<u16>; 2],
    icr: Option<u16>,
    icr_h: Option<u16>,
    timsk: u16,
    tifr: u16,

    vec_ovf: u8,
    vec_comp: [u8; 2],
    vec_capt: Option<u8>,

    /// Prescaler table indexed by the CS bits; 0 = stopped, u32::MAX = external
    cs_table: [u32; 8],

    /// Compare-output pins (port index, pin) for channels A and B
    oc_pins: [Option<(usize, u8)>; 2],

    // Derived state
    prescale: u32,
    ext_rising: bool,
    base_cycle: u64,
    base_count: u32,
    down: bool,
    handle: Option<Handle>,
    /// TEMP byte for the 16-bit register access protocol
    temp: u8,

    pub clock_irq: Option<IrqId>,
    pub capt_irq: Option<IrqId>,
}

const EXTERNAL: u32 = u32::MAX;

impl Timer {
    pub fn reset(&mut self, sram: &mut Sram) {
        for addr in [self.tccra, self.tccrb, self.tcnt, self.timsk, self.tifr] {
            sram.set(addr, 0);
        }
        for chan in 0..2 {
            sram.set(self.ocr[chan], 0);
            if let Some(h) = self.ocr_h[chan] {
                sram.set(h, 0);
            }
        }
        for addr in [self.tcnt_h, self.icr, self.icr_h].into_iter().flatten() {
            sram.set(addr, 0);
        }
        self.prescale = 0;
        self.ext_rising = false;
        self.base_cycle = 0;
        self.base_count = 0;
        self.down = false;
        self.handle = None;
        self.temp = 0;
    }

    /// Decode the waveform mode from the control bytes
    pub fn mode(&self, tccra: u8, tccrb: u8, ocra: u32, icr: u32) -> Mode {
        if self.bits16 {
            let wgm = (tccra & 0x03) | ((tccrb >> 1) & 0x0C);
            match wgm {
                0 => Mode { wgm: Wgm::Normal, top: 0xFFFF },
                1 => Mode { wgm: Wgm::PhaseCorrect, top: 0xFF },
                2 => Mode { wgm: Wgm::PhaseCorrect, top: 0x1FF },
                3 => Mode { wgm: Wgm::PhaseCorrect, top: 0x3FF },
                4 => Mode { wgm: Wgm::Ctc, top: ocra },
                5 => Mode { wgm: Wgm::FastPwm, top: 0xFF },
                6 => Mode { wgm: Wgm::FastPwm, top: 0x1FF },
                7 => Mode { wgm: Wgm::FastPwm, top: 0x3FF },
                8 | 10 => Mode { wgm: Wgm::PhaseCorrect, top: icr },
                9 | 11 => Mode { wgm: Wgm::PhaseCorrect, top: ocra },
                12 => Mode { wgm: Wgm::Ctc, top: icr },
                14 => Mode { wgm: Wgm::FastPwm, top: icr },
                15 => Mode { wgm: Wgm::FastPwm, top: ocra },
                _ => Mode { wgm: Wgm::Normal, top: 0xFFFF },
            }
        } else {
            let wgm = (tccra & 0x03) | ((tccrb >> 1) & 0x04);
            match wgm {
                0 => Mode { wgm: Wgm::Normal, top: 0xFF },
                1 => Mode { wgm: Wgm::PhaseCorrect, top: 0xFF },
                2 => Mode { wgm: Wgm::Ctc, top: ocra },
                3 => Mode { wgm: Wgm::FastPwm, top: 0xFF },
                5 => Mode { wgm: Wgm::PhaseCorrect, top: ocra },
                7 => Mode { wgm: Wgm::FastPwm, top: ocra },
                _ => Mode { wgm: Wgm::Normal, top: 0xFF },
            }
        }
    }

    /// Counter value at `cycle` given the reference point
    fn count_at(&self, cycle: u64) -> u32 {
        if self.prescale == 0 || self.prescale == EXTERNAL {
            return self.base_count;
        }
        let ticks = ((cycle - self.base_cycle) / self.prescale as u64) as u32;
        if self.down {
            self.base_count.saturating_sub(ticks)
        } else {
            self.base_count.wrapping_add(ticks) & self.max
        }
    }

    /// Commit the virtual count at `cycle`, keeping sub-tick phase
    fn sync_to(&mut self, cycle: u64) {
        if self.prescale == 0 || self.prescale == EXTERNAL {
            self.base_cycle = cycle;
            return;
        }
        let presc = self.prescale as u64;
        let ticks = (cycle - self.base_cycle) / presc;
        self.base_count = if self.down {
            self.base_count.saturating_sub(ticks as u32)
        } else {
            self.base_count.wrapping_add(ticks as u32) & self.max
        };
        self.base_cycle += ticks * presc;
    }

    /// Ticks until the counter passes `target` counting up, wrapping at
    /// `wrap`. `target` is in 1..=wrap; a result of 0 means a full lap.
    fn ticks_up_to(&self, from: u32, target: u32, wrap: u32) -> u64 {
        let t = if target > from {
            target - from
        } else {
            target + wrap - from
        };
        t as u64
    }
}

/// Build timers 0, 1, 2 and wire external clock / capture pins
pub(crate) fn build_timers(
    fabric: &mut IrqFabric,
    intc: &mut InterruptTable,
    routes: &mut [IoPort],
    ports: &[GpioPort],
) -> Vec<Timer> {
    let mega_cs: [u32; 8] = [0, 1, 8, 64, 256, 1024, EXTERNAL, EXTERNAL];
    let t2_cs: [u32; 8] = [0, 1, 8, 32, 64, 128, 256, 1024];

    let mut timers = Vec::new();

    // Timer0: 8-bit, external clock on T0 = PD4, OC0A = PD6, OC0B = PD5
    let t0_clock = fabric.alloc("timer0.clock", 1, IrqFlags::FILTERED);
    fabric.register_route(t0_clock, IrqTarget::TimerClock { timer: 0 });
    fabric.connect(ports[2].pins[4], t0_clock);
    timers.push(Timer {
        idx: 0,
        bits16: false,
        max: 0xFF,
        tccra: regs::TCCR0A,
        tccrb: regs::TCCR0B,
        tcnt: regs::TCNT0,
        tcnt_h: None,
        ocr: [regs::OCR0A, regs::OCR0B],
        ocr_h: [None, None],
        icr: None,
        icr_h: None,
        timsk: regs::TIMSK0,
        tifr: regs::TIFR0,
        vec_ovf: vectors::TIMER0_OVF,
        vec_comp: [vectors::TIMER0_COMPA, vectors::TIMER0_COMPB],
        vec_capt: None,
        cs_table: mega_cs,
        oc_pins: [Some((2, 6)), Some((2, 5))],
        prescale: 0,
        ext_rising: false,
        base_cycle: 0,
        base_count: 0,
        down: false,
        handle: None,
        temp: 0,
        clock_irq: Some(t0_clock),
        capt_irq: None,
    });

    // Timer1: 16-bit, T1 = PD5, ICP1 = PB0, OC1A = PB1, OC1B = PB2
    let t1_clock = fabric.alloc("timer1.clock", 1, IrqFlags::FILTERED);
    fabric.register_route(t1_clock, IrqTarget::TimerClock { timer: 1 });
    fabric.connect(ports[2].pins[5], t1_clock);
    let t1_capt = fabric.alloc("timer1.icp", 1, IrqFlags::FILTERED);
    fabric.register_route(t1_capt, IrqTarget::TimerCapture { timer: 1 });
    fabric.connect(ports[0].pins[0], t1_capt);
    timers.push(Timer {
        idx: 1,
        bits16: true,
        max: 0xFFFF,
        tccra: regs::TCCR1A,
        tccrb: regs::TCCR1B,
        tcnt: regs::TCNT1L,
        tcnt_h: Some(regs::TCNT1H),
        ocr: [regs::OCR1AL, regs::OCR1BL],
        ocr_h: [Some(regs::OCR1AH), Some(regs::OCR1BH)],
        icr: Some(regs::ICR1L),
        icr_h: Some(regs::ICR1H),
        timsk: regs::TIMSK1,
        tifr: regs::TIFR1,
        vec_ovf: vectors::TIMER1_OVF,
        vec_comp: [vectors::TIMER1_COMPA, vectors::TIMER1_COMPB],
        vec_capt: Some(vectors::TIMER1_CAPT),
        cs_table: mega_cs,
        oc_pins: [Some((0, 1)), Some((0, 2))],
        prescale: 0,
        ext_rising: false,
        base_cycle: 0,
        base_count: 0,
        down: false,
        handle: None,
        temp: 0,
        clock_irq: Some(t1_clock),
        capt_irq: Some(t1_capt),
    });

    // Timer2: 8-bit, no external pin clock, OC2A = PB3, OC2B = PD3
    timers.push(Timer {
        idx: 2,
        bits16: false,
        max: 0xFF,
        tccra: regs::TCCR2A,
        tccrb: regs::TCCR2B,
        tcnt: regs::TCNT2,
        tcnt_h: None,
        ocr: [regs::OCR2A, regs::OCR2B],
        ocr_h: [None, None],
        icr: None,
        icr_h: None,
        timsk: regs::TIMSK2,
        tifr: regs::TIFR2,
        vec_ovf: vectors::TIMER2_OVF,
        vec_comp: [vectors::TIMER2_COMPA, vectors::TIMER2_COMPB],
        vec_capt: None,
        cs_table: t2_cs,
        oc_pins: [Some((0, 3)), Some((2, 3))],
        prescale: 0,
        ext_rising: false,
        base_cycle: 0,
        base_count: 0,
        down: false,
        handle: None,
        temp: 0,
        clock_irq: None,
        capt_irq: None,
    });

    for (i, t) in timers.iter().enumerate() {
        let flag_bits: [(u8, u8); 3] = [(t.vec_ovf, 0), (t.vec_comp[CHAN_A], 1), (t.vec_comp[CHAN_B], 2)];
        for (vec, bit) in flag_bits {
            intc.register(VectorDesc {
                num: vec,
                enable: RegBit::new(t.timsk, bit),
                flag: RegBit::new(t.tifr, bit),
                clear_on_ack: true,
                level: false,
            });
        }
        if let Some(vec) = t.vec_capt {
            intc.register(VectorDesc {
                num: vec,
                enable: RegBit::new(t.timsk, 5),
                flag: RegBit::new(t.tifr, 5),
                clear_on_ack: true,
                level: false,
            });
        }

        let mut addrs = vec![t.tccra, t.tccrb, t.tcnt, t.timsk, t.tifr, t.ocr[0], t.ocr[1]];
        addrs.extend([t.tcnt_h, t.icr, t.icr_h, t.ocr_h[0], t.ocr_h[1]].into_iter().flatten());
        if t.bits16 {
            addrs.push(regs::TCCR1C);
        }
        for addr in addrs {
            routes[addr as usize] = IoPort::Timer(i as u8);
        }
    }

    timers
}

impl Bus {
    pub(crate) fn timer_read(&mut self, ti: usize, addr: u16) -> u8 {
        let cycle = self.cycle;
        let t = &mut self.io.timers[ti];
        if addr == t.tcnt {
            let c = t.count_at(cycle);
            t.temp = (c >> 8) as u8;
            return c as u8;
        }
        if Some(addr) == t.tcnt_h {
            return t.temp;
        }
        self.sram.get(addr)
    }

    pub(crate) fn timer_write(&mut self, ti: usize, addr: u16, value: u8, prev: u8) {
        let cycle = self.cycle;
        let t = &mut self.io.timers[ti];
        let tifr = t.tifr;
        let timsk = t.timsk;

        if addr == tifr {
            // Write-1-to-clear flags
            let mask = if t.bits16 { 0x27 } else { 0x07 };
            self.sram.set(addr, prev & !(value & mask));
            self.intc_sync(addr);
            return;
        }
        if addr == timsk {
            self.sram.set(addr, value);
            self.intc_sync(addr);
            return;
        }

        t.sync_to(cycle);

        if addr == t.tcnt {
            let hi = (t.temp as u32) << 8;
            t.base_count = if t.bits16 { hi | value as u32 } else { value as u32 };
            self.sram.set(addr, value);
        } else if Some(addr) == t.tcnt_h {
            t.temp = value;
            self.sram.set(addr, value);
        } else if t.ocr_h.contains(&Some(addr)) {
            // High byte goes through TEMP, committed by the low-byte write
            t.temp = value;
        } else if let Some(chan) = t.ocr.iter().position(|&l| l == addr) {
            self.sram.set(addr, value);
            if let Some(h) = t.ocr_h[chan] {
                let temp = t.temp;
                self.sram.set(h, temp);
            }
        } else {
            self.sram.set(addr, value);
        }

        self.timer_reconfigure(ti);
    }

    /// Re-read the control bytes and re-arm the boundary event
    pub(crate) fn timer_reconfigure(&mut self, ti: usize) {
        let cycle = self.cycle;
        let tccrb = self.sram.get(self.io.timers[ti].tccrb);
        let t = &mut self.io.timers[ti];
        t.sync_to(cycle);
        let cs = (tccrb & 0x07) as usize;
        let sel = t.cs_table[cs];
        t.ext_rising = cs == 7;
        t.prescale = sel;
        if let Some(h) = t.handle.take() {
            self.queue.cancel(h);
        }
        self.timer_arm(ti);
    }

    /// Schedule the queue entry at the next boundary
    fn timer_arm(&mut self, ti: usize) {
        let Some(ticks) = self.timer_ticks_to_boundary(ti) else {
            return;
        };
        let t = &self.io.timers[ti];
        let due = t.base_cycle + ticks * t.prescale as u64;
        let due = due.max(self.cycle + 1);
        let handle = self.queue.schedule(TimedEvent::Timer(ti), due);
        self.io.timers[ti].handle = Some(handle);
    }

    /// Ticks from the reference count to the next boundary, or None when
    /// the clock is stopped or external
    fn timer_ticks_to_boundary(&mut self, ti: usize) -> Option<u64> {
        let t = &self.io.timers[ti];
        if t.prescale == 0 || t.prescale == EXTERNAL {
            return None;
        }
        let (mode, ocr) = self.timer_mode(ti);
        let t = &self.io.timers[ti];
        let c0 = t.base_count;
        let wrap = mode.top + 1;

        fn consider(best: &mut Option<u64>, ticks: u64) {
            if ticks > 0 && best.map(|b| ticks < b).unwrap_or(true) {
                *best = Some(ticks);
            }
        }

        let mut best: Option<u64> = None;
        if mode.wgm == Wgm::PhaseCorrect {
            if t.down {
                for chan in 0..2 {
                    let v = ocr[chan];
                    if v < c0 && v > 0 {
                        consider(&mut best, (c0 - v) as u64);
                    }
                }
                consider(&mut best, c0 as u64); // reach 0: TOV and turn
            } else {
                for chan in 0..2 {
                    let v = ocr[chan].wrapping_add(1);
                    if v > c0 && v <= mode.top {
                        consider(&mut best, (v - c0) as u64);
                    }
                }
                consider(&mut best, (mode.top - c0) as u64); // reach TOP: turn
            }
            if best.is_none() {
                // Counter sitting at a boundary with nothing else ahead:
                // a full half-period away
                consider(&mut best, mode.top.max(1) as u64);
            }
        } else {
            consider(&mut best, t.ticks_up_to(c0, wrap, wrap));
            for chan in 0..2 {
                let target = ocr[chan] + 1;
                if target <= wrap {
                    consider(&mut best, t.ticks_up_to(c0, target, wrap));
                }
            }
        }
        best
    }

    fn timer_mode(&self, ti: usize) -> (Mode, [u32; 2]) {
        let t = &self.io.timers[ti];
        let tccra = self.sram.get(t.tccra);
        let tccrb = self.sram.get(t.tccrb);
        let mut ocr = [0u32; 2];
        for chan in 0..2 {
            ocr[chan] = self.sram.get(t.ocr[chan]) as u32;
            if let Some(h) = t.ocr_h[chan] {
                ocr[chan] |= (self.sram.get(h) as u32) << 8;
            }
        }
        let icr = match (t.icr, t.icr_h) {
            (Some(l), Some(h)) => self.sram.get(l) as u32 | ((self.sram.get(h) as u32) << 8),
            _ => 0,
        };
        (t.mode(tccra, tccrb, ocr[CHAN_A], icr), ocr)
    }

    /// Queue callback: the counter passed a boundary
    pub(crate) fn timer_event(&mut self, ti: usize, due: u64) -> Option<u64> {
        let (mode, ocr) = self.timer_mode(ti);
        let t = &mut self.io.timers[ti];
        if t.prescale == 0 || t.prescale == EXTERNAL {
            t.handle = None;
            return None;
        }
        let presc = t.prescale as u64;
        let ticks = (due - t.base_cycle) / presc;
        let wrap = mode.top + 1;

        let mut flags: [bool; 3] = [false; 3]; // compa, compb, ovf
        let mut oc_events: [Option<OcEvent>; 2] = [None, None];

        if mode.wgm == Wgm::PhaseCorrect {
            if t.down {
                let reached = t.base_count.saturating_sub(ticks as u32);
                for chan in 0..2 {
                    if reached == ocr[chan] && reached > 0 {
                        flags[chan] = true;
                        oc_events[chan] = Some(OcEvent::CompareDown);
                    }
                }
                if reached == 0 {
                    flags[2] = true;
                    t.down = false;
                }
                t.base_count = reached;
            } else {
                let reached = t.base_count + ticks as u32;
                for chan in 0..2 {
                    if reached == ocr[chan] + 1 {
                        flags[chan] = true;
                        oc_events[chan] = Some(OcEvent::CompareUp);
                    }
                }
                if reached >= mode.top {
                    t.down = true;
                    t.base_count = mode.top;
                } else {
                    t.base_count = reached;
                }
            }
        } else {
            let reached = t.base_count + ticks as u32;
            for chan in 0..2 {
                if reached == ocr[chan] + 1 {
                    flags[chan] = true;
                    oc_events[chan] = Some(OcEvent::CompareUp);
                }
            }
            if reached >= wrap {
                // CTC wraps silently at TOP unless TOP is MAX
                if mode.wgm != Wgm::Ctc || mode.top == t.max {
                    flags[2] = true;
                }
                for chan in 0..2 {
                    if oc_events[chan].is_none() {
                        oc_events[chan] = Some(OcEvent::Bottom);
                    }
                }
            }
            t.base_count = reached % wrap;
        }
        t.base_cycle = due;

        let vec_comp = t.vec_comp;
        let vec_ovf = t.vec_ovf;
        let oc_pins = t.oc_pins;
        let tccra = self.sram.get(t.tccra);

        for chan in 0..2 {
            if flags[chan] {
                self.vector_raise(vec_comp[chan]);
            }
        }
        if flags[2] {
            self.vector_raise(vec_ovf);
        }

        // Compare-output pins
        for chan in 0..2 {
            let (Some(event), Some((pi, pin))) = (oc_events[chan], oc_pins[chan]) else {
                continue;
            };
            let com = (tccra >> (6 - 2 * chan)) & 0x03;
            self.timer_oc_action(pi, pin, com, mode.wgm, event);
        }

        // Re-arm at the next boundary
        let t = &self.io.timers[ti];
        let base_cycle = t.base_cycle;
        let presc = t.prescale as u64;
        match self.timer_ticks_to_boundary(ti) {
            Some(ticks) => Some(base_cycle + ticks * presc),
            None => {
                self.io.timers[ti].handle = None;
                None
            }
        }
    }

    fn timer_oc_action(&mut self, pi: usize, pin: u8, com: u8, wgm: Wgm, event: OcEvent) {
        if com == 0 {
            self.port_hw_drive(pi, pin, None);
            return;
        }
        let level = match (wgm, com, event) {
            // Non-PWM: act on compare only
            (Wgm::Normal | Wgm::Ctc, 1, OcEvent::CompareUp) => {
                let cur = self.sram.get(self.io.ports[pi].pin_addr) & (1 << pin) != 0;
                Some(!cur)
            }
            (Wgm::Normal | Wgm::Ctc, 2, OcEvent::CompareUp) => Some(false),
            (Wgm::Normal | Wgm::Ctc, 3, OcEvent::CompareUp) => Some(true),
            // Fast PWM: clear on compare, set at bottom (COM=2), inverted for 3
            (Wgm::FastPwm, 2, OcEvent::CompareUp) => Some(false),
            (Wgm::FastPwm, 2, OcEvent::Bottom) => Some(true),
            (Wgm::FastPwm, 3, OcEvent::CompareUp) => Some(true),
            (Wgm::FastPwm, 3, OcEvent::Bottom) => Some(false),
            // Phase-correct: clear going up, set going down (COM=2)
            (Wgm::PhaseCorrect, 2, OcEvent::CompareUp) => Some(false),
            (Wgm::PhaseCorrect, 2, OcEvent::CompareDown) => Some(true),
            (Wgm::PhaseCorrect, 3, OcEvent::CompareUp) => Some(true),
            (Wgm::PhaseCorrect, 3, OcEvent::CompareDown) => Some(false),
            _ => None,
        };
        if let Some(level) = level {
            self.port_hw_drive(pi, pin, Some(level));
        }
    }

    /// Routed delivery: edge on the T0/T1 external clock pin
    pub(crate) fn timer_ext_clock(&mut self, ti: usize, value: u32) {
        let t = &self.io.timers[ti];
        if t.prescale != EXTERNAL {
            return;
        }
        let rising = value != 0;
        if rising != t.ext_rising {
            return;
        }
        let (mode, ocr) = self.timer_mode(ti);
        let t = &mut self.io.timers[ti];
        let wrap = mode.top + 1;
        let reached = t.base_count + 1;

        let mut fire_comp = [false; 2];
        for chan in 0..2 {
            if reached == ocr[chan] + 1 {
                fire_comp[chan] = true;
            }
        }
        let fire_ovf = reached >= wrap && (mode.wgm != Wgm::Ctc || mode.top == t.max);
        t.base_count = reached % wrap;

        let vec_comp = t.vec_comp;
        let vec_ovf = t.vec_ovf;
        for chan in 0..2 {
            if fire_comp[chan] {
                self.vector_raise(vec_comp[chan]);
            }
        }
        if fire_ovf {
            self.vector_raise(vec_ovf);
        }
    }

    /// Routed delivery: edge on the input-capture pin
    pub(crate) fn timer_capture(&mut self, ti: usize, value: u32) {
        let cycle = self.cycle;
        let t = &self.io.timers[ti];
        let (Some(icr), Some(icr_h), Some(vec)) = (t.icr, t.icr_h, t.vec_capt) else {
            return;
        };
        // ICES1 selects the capturing edge
        let rising_edge = self.sram.get(t.tccrb) & 0x40 != 0;
        if (value != 0) != rising_edge {
            return;
        }
        let count = t.count_at(cycle);
        self.sram.set(icr, count as u8);
        self.sram.set(icr_h, (count >> 8) as u8);
        self.vector_raise(vec);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OcEvent {
    CompareUp,
    CompareDown,
    Bottom,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer8() -> Timer {
        Timer {
            idx: 0,
            bits16: false,
            max: 0xFF,
            tccra: regs::TCCR0A,
            tccrb: regs::TCCR0B,
            tcnt: regs::TCNT0,
            tcnt_h: None,
            ocr: [regs::OCR0A, regs::OCR0B],
            ocr_h: [None, None],
            icr: None,
            icr_h: None,
            timsk: regs::TIMSK0,
            tifr: regs::TIFR0,
            vec_ovf: vectors::TIMER0_OVF,
            vec_comp: [vectors::TIMER0_COMPA, vectors::TIMER0_COMPB],
            vec_capt: None,
            cs_table: [0, 1, 8, 64, 256, 1024, EXTERNAL, EXTERNAL],
            oc_pins: [None, None],
            prescale: 0,
            ext_rising: false,
            base_cycle: 0,
            base_count: 0,
            down: false,
            handle: None,
            temp: 0,
            clock_irq: None,
            capt_irq: None,
        }
    }

    #[test]
    fn test_mode_decode_8bit() {
        let t = timer8();
        assert_eq!(t.mode(0x00, 0x00, 0xAA, 0), Mode { wgm: Wgm::Normal, top: 0xFF });
        assert_eq!(t.mode(0x02, 0x00, 0xAA, 0), Mode { wgm: Wgm::Ctc, top: 0xAA });
        assert_eq!(t.mode(0x03, 0x00, 0xAA, 0), Mode { wgm: Wgm::FastPwm, top: 0xFF });
        assert_eq!(t.mode(0x03, 0x08, 0xAA, 0), Mode { wgm: Wgm::FastPwm, top: 0xAA });
        assert_eq!(t.mode(0x01, 0x00, 0xAA, 0), Mode { wgm: Wgm::PhaseCorrect, top: 0xFF });
    }

    #[test]
    fn test_mode_decode_16bit() {
        let mut t = timer8();
        t.bits16 = true;
        t.max = 0xFFFF;
        assert_eq!(t.mode(0x00, 0x08, 100, 200), Mode { wgm: Wgm::Ctc, top: 100 });
        assert_eq!(t.mode(0x00, 0x18, 100, 200), Mode { wgm: Wgm::Ctc, top: 200 });
        assert_eq!(t.mode(0x02, 0x18, 100, 200), Mode { wgm: Wgm::FastPwm, top: 200 });
        assert_eq!(t.mode(0x03, 0x18, 100, 200), Mode { wgm: Wgm::FastPwm, top: 100 });
    }

    #[test]
    fn test_count_interpolation() {
        let mut t = timer8();
        t.prescale = 64;
        t.base_cycle = 1000;
        t.base_count = 5;
        assert_eq!(t.count_at(1000), 5);
        assert_eq!(t.count_at(1063), 5);
        assert_eq!(t.count_at(1064), 6);
        assert_eq!(t.count_at(1000 + 64 * 10), 15);
    }

    #[test]
    fn test_sync_keeps_phase() {
        let mut t = timer8();
        t.prescale = 64;
        t.base_cycle = 0;
        t.base_count = 0;
        // 100 cycles = 1 tick + 36 cycles of phase
        t.sync_to(100);
        assert_eq!(t.base_count, 1);
        assert_eq!(t.base_cycle, 64);
        assert_eq!(t.count_at(128), 2);
    }

    #[test]
    fn test_ticks_up_to_wraps() {
        let t = timer8();
        assert_eq!(t.ticks_up_to(0, 256, 256), 256);
        assert_eq!(t.ticks_up_to(10, 256, 256), 246);
        assert_eq!(t.ticks_up_to(0xAB, 0xAB_u32 + 1, 256), 1);
        // Target behind the count: a full wrap away
        assert_eq!(t.ticks_up_to(0x80, 0x10, 256), 0x90);
    }
}
