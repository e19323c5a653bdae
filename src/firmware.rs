//! Firmware image descriptor and simulator command plumbing
//!
//! The loader (external to this crate) parses an ELF plus its metadata
//! section and hands the core a typed [`Firmware`]: flash bytes, the
//! variant name, clock frequency, optional EEPROM image, and a few hints
//! such as the command/console register addresses, VCD trace requests,
//! and named cycle counters.
//!
//! The command register gives test firmware a side channel into the
//! simulator: writes to it are intercepted and interpreted as one-byte
//! opcodes (counter commands take an id operand in the following write).
//! The console register streams characters to a text sink, giving
//! firmware a printf path with no UART setup.

use crate::variant::VariantId;

/// A typed firmware image plus metadata, as produced by the loader
#[derive(Debug, Clone)]
pub struct Firmware {
    pub variant: VariantId,
    /// CPU clock in Hz
    pub f_cpu: u32,
    /// Flash image, loaded at byte address 0
    pub flash: Vec<u8>,
    /// Initial EEPROM content, if the image carries one
    pub eeprom: Option<Vec<u8>>,
    /// Fuse bytes from the metadata block (unused by the core, kept for
    /// harness inspection)
    pub fuses: Option<[u8; 4]>,
    /// MCU name from the metadata block, 16 bytes max
    pub name: String,
    /// I/O address intercepted as the simulator command register
    pub command_register: Option<u16>,
    /// I/O address intercepted as the console register
    pub console_register: Option<u16>,
    /// Signals the firmware asks to have traced
    pub trace_requests: Vec<TraceRequest>,
    /// Named cycle counters registered by the firmware
    pub cycle_counters: Vec<CounterDef>,
}

impl Firmware {
    /// Minimal descriptor: variant, clock, flash image
    pub fn new(variant: VariantId, f_cpu: u32, flash: Vec<u8>) -> Self {
        Self {
            variant,
            f_cpu,
            flash,
            eeprom: None,
            fuses: None,
            name: String::new(),
            command_register: None,
            console_register: None,
            trace_requests: Vec::new(),
            cycle_counters: Vec::new(),
        }
    }
}

/// One VCD trace request from the metadata section. The node name is
/// resolved against the IRQ fabric by the external tracer; the core only
/// carries the request through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRequest {
    pub name: String,
    pub width: u8,
}

/// Cycle counter definition from the metadata section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDef {
    pub id: u8,
    pub name: String,
}

/// Command register opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    None = 0,
    VcdStartTrace = 1,
    VcdStopTrace = 2,
    UartLoopbackOn = 3,
    UartLoopbackOff = 4,
    /// Followed by one operand byte: the counter id
    StartCycleCounter = 5,
    /// Followed by one operand byte: the counter id
    StopCycleCounter = 6,
    Reset = 7,
    Exit = 8,
}

impl Command {
    pub fn from_byte(b: u8) -> Option<Command> {
        Some(match b {
            0 => Command::None,
            1 => Command::VcdStartTrace,
            2 => Command::VcdStopTrace,
            3 => Command::UartLoopbackOn,
            4 => Command::UartLoopbackOff,
            5 => Command::StartCycleCounter,
            6 => Command::StopCycleCounter,
            7 => Command::Reset,
            8 => Command::Exit,
            _ => return None,
        })
    }

    /// Whether the opcode consumes the next write as an operand
    pub fn takes_operand(self) -> bool {
        matches!(self, Command::StartCycleCounter | Command::StopCycleCounter)
    }
}

/// A closed start/stop measurement of one named counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSpan {
    pub start: u64,
    pub stop: u64,
}

impl CounterSpan {
    pub fn cycles(&self) -> u64 {
        self.stop - self.start
    }
}

#[derive(Debug, Clone)]
struct Counter {
    def: CounterDef,
    started_at: Option<u64>,
    spans: Vec<CounterSpan>,
}

/// Registry of named cycle counters driven by command-register writes
#[derive(Debug, Clone, Default)]
pub struct CycleCounters {
    counters: Vec<Counter>,
}

impl CycleCounters {
    pub fn new(defs: &[CounterDef]) -> Self {
        Self {
            counters: defs
                .iter()
                .map(|def| Counter {
                    def: def.clone(),
                    started_at: None,
                    spans: Vec::new(),
                })
                .collect(),
        }
    }

    pub fn reset(&mut self) {
        for c in &mut self.counters {
            c.started_at = None;
            c.spans.clear();
        }
    }

    /// Start counter `id` at `cycle`; restarting an already running
    /// counter moves its start point.
    pub fn start(&mut self, id: u8, cycle: u64) -> bool {
        match self.find_mut(id) {
            Some(c) => {
                c.started_at = Some(cycle);
                true
            }
            None => false,
        }
    }

    /// Stop counter `id`, recording the elapsed span
    pub fn stop(&mut self, id: u8, cycle: u64) -> bool {
        match self.find_mut(id) {
            Some(c) => match c.started_at.take() {
                Some(start) => {
                    c.spans.push(CounterSpan { start, stop: cycle });
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn name(&self, id: u8) -> Option<&str> {
        self.counters
            .iter()
            .find(|c| c.def.id == id)
            .map(|c| c.def.name.as_str())
    }

    /// Recorded spans of counter `id`, in completion order
    pub fn spans(&self, id: u8) -> &[CounterSpan] {
        self.counters
            .iter()
            .find(|c| c.def.id == id)
            .map(|c| c.spans.as_slice())
            .unwrap_or(&[])
    }

    fn find_mut(&mut self, id: u8) -> Option<&mut Counter> {
        self.counters.iter_mut().find(|c| c.def.id == id)
    }
}

/// Text sink behind the console register
#[derive(Debug, Clone, Default)]
pub struct Console {
    pending: String,
    lines: Vec<String>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.lines.clear();
    }

    /// Feed one byte; a newline flushes the pending line
    pub fn push(&mut self, byte: u8) {
        if byte == b'\n' {
            let line = std::mem::take(&mut self.pending);
            log::info!(target: "avr_core::console", "{}", line);
            self.lines.push(line);
        } else {
            self.pending.push(byte as char);
        }
    }

    /// Completed lines so far
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Everything received, including the unterminated tail
    pub fn contents(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&self.pending);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        for b in 0..=8 {
            let cmd = Command::from_byte(b).unwrap();
            assert_eq!(cmd as u8, b);
        }
        assert_eq!(Command::from_byte(0xAB), None);
    }

    #[test]
    fn test_operand_commands() {
        assert!(Command::StartCycleCounter.takes_operand());
        assert!(Command::StopCycleCounter.takes_operand());
        assert!(!Command::Reset.takes_operand());
        assert!(!Command::UartLoopbackOn.takes_operand());
    }

    #[test]
    fn test_cycle_counter_spans() {
        let defs = vec![
            CounterDef { id: 0, name: "outer".into() },
            CounterDef { id: 1, name: "inner".into() },
        ];
        let mut counters = CycleCounters::new(&defs);

        assert!(counters.start(0, 100));
        assert!(counters.start(1, 120));
        assert!(counters.stop(1, 150));
        assert!(counters.stop(0, 200));

        assert_eq!(counters.spans(1), &[CounterSpan { start: 120, stop: 150 }]);
        assert_eq!(counters.spans(0)[0].cycles(), 100);
        assert_eq!(counters.name(0), Some("outer"));
    }

    #[test]
    fn test_counter_stop_without_start() {
        let defs = vec![CounterDef { id: 0, name: "c".into() }];
        let mut counters = CycleCounters::new(&defs);
        assert!(!counters.stop(0, 10));
        assert!(!counters.start(9, 10)); // unknown id
    }

    #[test]
    fn test_console_lines() {
        let mut console = Console::new();
        for b in b"Read 0xcafef00d\nok" {
            console.push(*b);
        }
        assert_eq!(console.lines(), &["Read 0xcafef00d".to_string()]);
        assert_eq!(console.contents(), "Read 0xcafef00d\nok");
    }
}
