//! Fault taxonomy for the simulator core
//!
//! Faults halt the CPU and surface to the harness with a structured
//! descriptor; peripheral warnings are not faults (they go to the log and
//! the warning node on the IRQ fabric and execution continues).

use thiserror::Error;

/// Coarse fault classification, useful for exit-code mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Unknown or unimplemented opcode
    Decode,
    /// Data access outside SRAM, or SP left RAM bounds
    Memory,
    /// Write the variant flags as illegal
    Io,
    /// Unsupported variant or firmware metadata mismatch
    Config,
}

/// A fault raised during simulation
///
/// Carries the program counter of the offending instruction plus the
/// offending opcode or address, so the harness can print a meaningful
/// diagnostic without poking at simulator internals.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Fault {
    #[error("unknown opcode {opcode:#06x} at pc {pc:#06x}")]
    Decode { pc: u32, opcode: u16 },

    #[error("data access out of range: address {addr:#06x} at pc {pc:#06x}")]
    Memory { pc: u32, addr: u32 },

    #[error("stack pointer {sp:#06x} left RAM bounds at pc {pc:#06x}")]
    Stack { pc: u32, sp: u16 },

    #[error("illegal write of {value:#04x} to I/O address {addr:#06x} at pc {pc:#06x}")]
    Io { pc: u32, addr: u16, value: u8 },

    #[error("configuration error: {0}")]
    Config(String),
}

impl Fault {
    /// The kind bucket this fault belongs to
    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::Decode { .. } => FaultKind::Decode,
            Fault::Memory { .. } | Fault::Stack { .. } => FaultKind::Memory,
            Fault::Io { .. } => FaultKind::Io,
            Fault::Config(_) => FaultKind::Config,
        }
    }

    /// Program counter at the time of the fault, when one applies
    pub fn pc(&self) -> Option<u32> {
        match self {
            Fault::Decode { pc, .. }
            | Fault::Memory { pc, .. }
            | Fault::Stack { pc, .. }
            | Fault::Io { pc, .. } => Some(*pc),
            Fault::Config(_) => None,
        }
    }
}

/// Errors raised while constructing a simulator from a firmware image
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("firmware image is empty")]
    Empty,

    #[error("flash image of {size} bytes exceeds the variant's {capacity} byte flash")]
    FlashTooLarge { size: usize, capacity: usize },

    #[error("EEPROM image of {size} bytes exceeds the variant's {capacity} byte EEPROM")]
    EepromTooLarge { size: usize, capacity: usize },

    #[error("register address {addr:#06x} is outside the variant's I/O space")]
    BadRegisterAddress { addr: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let f = Fault::Decode { pc: 0x100, opcode: 0xFF00 };
        assert_eq!(f.kind(), FaultKind::Decode);
        assert_eq!(f.pc(), Some(0x100));

        let f = Fault::Stack { pc: 0x20, sp: 0x0010 };
        assert_eq!(f.kind(), FaultKind::Memory);

        let f = Fault::Config("bad variant".into());
        assert_eq!(f.kind(), FaultKind::Config);
        assert_eq!(f.pc(), None);
    }

    #[test]
    fn test_display() {
        let f = Fault::Decode { pc: 0x42, opcode: 0x00FF };
        let msg = f.to_string();
        assert!(msg.contains("0x00ff"));
        assert!(msg.contains("0x000042"));
    }
}
