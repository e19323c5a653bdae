//! Interrupt controller
//!
//! The vector table is priority-ordered: lower vector numbers win. Each
//! vector descriptor names the I/O locations of its enable and flag bits
//! (the bits themselves live in the owning peripheral's registers in the
//! I/O file), so the controller can maintain the invariant
//!
//! > pending ⇔ flag set ∧ enable set
//!
//! without knowing anything about the peripherals. Peripherals raise a
//! vector through the bus; firmware clears flags by the usual
//! write-1-to-clear stores, after which the owning peripheral's write glue
//! calls [`InterruptTable::sync_register`] to re-derive pending state.

use crate::memory::{RegBit, Sram};

/// Static description of one interrupt vector
#[derive(Debug, Clone, Copy)]
pub struct VectorDesc {
    /// Vector number; doubles as the priority (lower = higher)
    pub num: u8,
    /// Location of the enable bit
    pub enable: RegBit,
    /// Location of the flag bit
    pub flag: RegBit,
    /// Whether acknowledging the vector clears its flag bit (edge
    /// vectors); level-sensitive vectors keep the flag until the source
    /// condition drops
    pub clear_on_ack: bool,
    /// Flag bit is owned by hardware and re-asserted while the source
    /// condition holds
    pub level: bool,
}

#[derive(Debug, Clone, Copy)]
struct Vector {
    desc: VectorDesc,
    pending: bool,
    raised_cycle: u64,
}

/// The vector table plus pending bookkeeping
#[derive(Debug)]
pub struct InterruptTable {
    vectors: Vec<Option<Vector>>,
}

impl InterruptTable {
    pub fn new(count: u8) -> Self {
        Self {
            vectors: (0..count).map(|_| None).collect(),
        }
    }

    /// Install a vector descriptor at its slot
    pub fn register(&mut self, desc: VectorDesc) {
        let slot = desc.num as usize;
        debug_assert!(self.vectors[slot].is_none(), "vector registered twice");
        self.vectors[slot] = Some(Vector {
            desc,
            pending: false,
            raised_cycle: 0,
        });
    }

    pub fn descriptor(&self, num: u8) -> Option<&VectorDesc> {
        self.vectors
            .get(num as usize)
            .and_then(|v| v.as_ref())
            .map(|v| &v.desc)
    }

    /// Drop pending state (flags in the I/O file are reset separately)
    pub fn reset(&mut self) {
        for v in self.vectors.iter_mut().flatten() {
            v.pending = false;
            v.raised_cycle = 0;
        }
    }

    /// A peripheral asserts the vector's condition: set the flag bit and,
    /// if the enable bit is set, mark the vector pending.
    pub fn raise(&mut self, sram: &mut Sram, num: u8, cycle: u64) {
        let Some(v) = self.vectors[num as usize].as_mut() else {
            return;
        };
        v.desc.flag.set(sram);
        if v.desc.enable.get(sram) && !v.pending {
            v.pending = true;
            v.raised_cycle = cycle;
        }
    }

    /// The vector's condition dropped (or firmware cleared the flag)
    pub fn clear_flag(&mut self, sram: &mut Sram, num: u8) {
        if let Some(v) = self.vectors[num as usize].as_mut() {
            v.desc.flag.clear(sram);
            v.pending = false;
        }
    }

    /// Re-derive pending state for every vector whose flag or enable bit
    /// lives at `addr`. Call after firmware wrote that register.
    pub fn sync_register(&mut self, sram: &Sram, addr: u16, cycle: u64) {
        for v in self.vectors.iter_mut().flatten() {
            if v.desc.flag.addr != addr && v.desc.enable.addr != addr {
                continue;
            }
            let should = v.desc.flag.get(sram) && v.desc.enable.get(sram);
            if should && !v.pending {
                v.pending = true;
                v.raised_cycle = cycle;
            } else if !should {
                v.pending = false;
            }
        }
    }

    /// Lowest-numbered pending vector
    pub fn pending_vector(&self) -> Option<u8> {
        self.vectors
            .iter()
            .flatten()
            .find(|v| v.pending)
            .map(|v| v.desc.num)
    }

    pub fn has_pending(&self) -> bool {
        self.vectors.iter().flatten().any(|v| v.pending)
    }

    pub fn is_pending(&self, num: u8) -> bool {
        self.vectors[num as usize]
            .as_ref()
            .map(|v| v.pending)
            .unwrap_or(false)
    }

    /// The CPU took the vector. Clears pending, applies the
    /// flag-clearing policy, and returns the raise-to-service latency in
    /// cycles.
    pub fn acknowledge(&mut self, sram: &mut Sram, num: u8, cycle: u64) -> u64 {
        let Some(v) = self.vectors[num as usize].as_mut() else {
            return 0;
        };
        v.pending = false;
        if v.desc.clear_on_ack {
            v.desc.flag.clear(sram);
        }
        cycle.saturating_sub(v.raised_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAG: RegBit = RegBit::new(0x35, 1);
    const ENABLE: RegBit = RegBit::new(0x6E, 1);

    fn table() -> (InterruptTable, Sram) {
        let mut t = InterruptTable::new(26);
        t.register(VectorDesc {
            num: 14,
            enable: ENABLE,
            flag: FLAG,
            clear_on_ack: true,
            level: false,
        });
        t.register(VectorDesc {
            num: 1,
            enable: RegBit::new(0x3D, 0),
            flag: RegBit::new(0x3C, 0),
            clear_on_ack: true,
            level: false,
        });
        (t, Sram::new(0x500))
    }

    #[test]
    fn test_raise_without_enable_is_not_pending() {
        let (mut t, mut sram) = table();
        t.raise(&mut sram, 14, 100);
        assert!(FLAG.get(&sram));
        assert!(!t.is_pending(14));
        assert_eq!(t.pending_vector(), None);
    }

    #[test]
    fn test_raise_with_enable_pends() {
        let (mut t, mut sram) = table();
        ENABLE.set(&mut sram);
        t.raise(&mut sram, 14, 100);
        assert!(t.is_pending(14));
        assert_eq!(t.pending_vector(), Some(14));
    }

    #[test]
    fn test_enable_after_flag_pends_via_sync() {
        let (mut t, mut sram) = table();
        t.raise(&mut sram, 14, 100);
        assert!(!t.is_pending(14));

        // Firmware sets the enable bit later
        ENABLE.set(&mut sram);
        t.sync_register(&sram, ENABLE.addr, 150);
        assert!(t.is_pending(14));
    }

    #[test]
    fn test_clearing_flag_clears_pending() {
        let (mut t, mut sram) = table();
        ENABLE.set(&mut sram);
        t.raise(&mut sram, 14, 100);
        assert!(t.is_pending(14));

        // Write-1-to-clear handled by the owning peripheral, then sync
        FLAG.clear(&mut sram);
        t.sync_register(&sram, FLAG.addr, 120);
        assert!(!t.is_pending(14));
    }

    #[test]
    fn test_clearing_enable_clears_pending() {
        let (mut t, mut sram) = table();
        ENABLE.set(&mut sram);
        t.raise(&mut sram, 14, 100);

        ENABLE.clear(&mut sram);
        t.sync_register(&sram, ENABLE.addr, 120);
        assert!(!t.is_pending(14));
        // Flag itself is untouched
        assert!(FLAG.get(&sram));
    }

    #[test]
    fn test_priority_is_vector_number() {
        let (mut t, mut sram) = table();
        ENABLE.set(&mut sram);
        RegBit::new(0x3D, 0).set(&mut sram);

        t.raise(&mut sram, 14, 100);
        t.raise(&mut sram, 1, 110);
        // Vector 1 raised later but wins on priority
        assert_eq!(t.pending_vector(), Some(1));

        t.acknowledge(&mut sram, 1, 120);
        assert_eq!(t.pending_vector(), Some(14));
    }

    #[test]
    fn test_acknowledge_clears_flag_and_reports_latency() {
        let (mut t, mut sram) = table();
        ENABLE.set(&mut sram);
        t.raise(&mut sram, 14, 100);

        let latency = t.acknowledge(&mut sram, 14, 107);
        assert_eq!(latency, 7);
        assert!(!t.is_pending(14));
        assert!(!FLAG.get(&sram));
    }

    #[test]
    fn test_raise_twice_keeps_first_cycle() {
        let (mut t, mut sram) = table();
        ENABLE.set(&mut sram);
        t.raise(&mut sram, 14, 100);
        t.raise(&mut sram, 14, 200);
        let latency = t.acknowledge(&mut sram, 14, 250);
        assert_eq!(latency, 150);
    }
}
