//! CPU helper functions: flags, ALU, stack, data-space access
//!
//! The ALU helpers update SREG exactly as the instruction set manual
//! prescribes for each opcode family. Notation in the bit expressions
//! follows the manual: `a` is Rd before the operation, `b` is Rr/K,
//! `res` is the result.

use super::flags;
use super::Cpu;
use crate::bus::Bus;
use crate::fault::Fault;
use crate::memory::layout;
use crate::variant::regs;

impl Cpu {
    // ========== Flag access ==========

    #[inline]
    pub(crate) fn flag(&self, f: u8) -> bool {
        self.sreg & f != 0
    }

    #[inline]
    pub(crate) fn put_flag(&mut self, f: u8, on: bool) {
        if on {
            self.sreg |= f;
        } else {
            self.sreg &= !f;
        }
    }

    /// Set N and Z from a result, then S = N ^ V (V must be current)
    #[inline]
    fn nzs(&mut self, res: u8) {
        self.put_flag(flags::N, res & 0x80 != 0);
        self.put_flag(flags::Z, res == 0);
        self.put_flag(flags::S, self.flag(flags::N) != self.flag(flags::V));
    }

    // ========== ALU ==========

    /// ADD/ADC. H from bit 3 carry, V per the signed overflow rule.
    pub(crate) fn alu_add(&mut self, a: u8, b: u8, carry: bool) -> u8 {
        let sum = a as u16 + b as u16 + carry as u16;
        let res = sum as u8;
        let h = ((a & b) | (b & !res) | (!res & a)) & 0x08 != 0;
        let v = ((a & b & !res) | (!a & !b & res)) & 0x80 != 0;
        self.put_flag(flags::H, h);
        self.put_flag(flags::V, v);
        self.put_flag(flags::C, sum > 0xFF);
        self.nzs(res);
        res
    }

    /// SUB/SUBI/CP/CPI. Borrow-style H and C.
    pub(crate) fn alu_sub(&mut self, a: u8, b: u8, carry: bool) -> u8 {
        let res = a.wrapping_sub(b).wrapping_sub(carry as u8);
        let h = ((!a & b) | (b & res) | (res & !a)) & 0x08 != 0;
        let v = ((a & !b & !res) | (!a & b & res)) & 0x80 != 0;
        let c = ((!a & b) | (b & res) | (res & !a)) & 0x80 != 0;
        self.put_flag(flags::H, h);
        self.put_flag(flags::V, v);
        self.put_flag(flags::C, c);
        self.nzs(res);
        res
    }

    /// SBC/SBCI/CPC: like `alu_sub` but Z is only ever cleared, never
    /// set, so multi-byte compares accumulate correctly.
    pub(crate) fn alu_sbc(&mut self, a: u8, b: u8, carry: bool) -> u8 {
        let z_before = self.flag(flags::Z);
        let res = self.alu_sub(a, b, carry);
        self.put_flag(flags::Z, z_before && res == 0);
        self.put_flag(flags::S, self.flag(flags::N) != self.flag(flags::V));
        res
    }

    /// AND/OR/EOR and the immediate forms: V cleared
    pub(crate) fn alu_logic_flags(&mut self, res: u8) {
        self.put_flag(flags::V, false);
        self.nzs(res);
    }

    /// LSR/ROR/ASR common tail: C from the shifted-out bit, V = N ^ C
    pub(crate) fn alu_shift_flags(&mut self, res: u8, carry_out: bool) {
        self.put_flag(flags::C, carry_out);
        self.put_flag(flags::N, res & 0x80 != 0);
        self.put_flag(flags::Z, res == 0);
        self.put_flag(flags::V, self.flag(flags::N) != self.flag(flags::C));
        self.put_flag(flags::S, self.flag(flags::N) != self.flag(flags::V));
    }

    // ========== Stack ==========

    /// Push writes at SP, then decrements
    pub(crate) fn push8(&mut self, bus: &mut Bus, value: u8) -> Result<(), Fault> {
        if !bus.sram.contains(self.sp as u32) {
            return Err(Fault::Stack { pc: self.op_pc, sp: self.sp });
        }
        bus.sram.set(self.sp, value);
        self.sp = self.sp.wrapping_sub(1);
        Ok(())
    }

    /// Pop increments, then reads
    pub(crate) fn pop8(&mut self, bus: &mut Bus) -> Result<u8, Fault> {
        self.sp = self.sp.wrapping_add(1);
        if !bus.sram.contains(self.sp as u32) {
            return Err(Fault::Stack { pc: self.op_pc, sp: self.sp });
        }
        Ok(bus.sram.get(self.sp))
    }

    /// Push a return address (word address, MSB first)
    pub(crate) fn push_ret_addr(&mut self, bus: &mut Bus, byte_addr: u32) -> Result<(), Fault> {
        let word = byte_addr >> 1;
        self.push8(bus, (word >> 8) as u8)?;
        self.push8(bus, word as u8)?;
        Ok(())
    }

    /// Pop a return address pushed by `push_ret_addr`
    pub(crate) fn pop_ret_addr(&mut self, bus: &mut Bus) -> Result<u32, Fault> {
        let lo = self.pop8(bus)? as u32;
        let hi = self.pop8(bus)? as u32;
        Ok(((hi << 8) | lo) << 1)
    }

    // ========== Data-space access ==========
    //
    // The register file and plain SRAM are touched directly; the I/O
    // window goes through the bus hooks, except SREG and SP which the
    // CPU owns.

    pub(crate) fn data_read(&mut self, bus: &mut Bus, addr: u32) -> Result<u8, Fault> {
        if !bus.sram.contains(addr) {
            return Err(Fault::Memory { pc: self.op_pc, addr });
        }
        let addr = addr as u16;
        if addr < layout::IO_BASE || addr > bus.io_end() {
            return Ok(bus.sram.get(addr));
        }
        Ok(match addr {
            regs::SREG => self.sreg,
            regs::SPL => self.sp as u8,
            regs::SPH => (self.sp >> 8) as u8,
            _ => bus.io_read(addr),
        })
    }

    pub(crate) fn data_write(&mut self, bus: &mut Bus, addr: u32, value: u8) -> Result<(), Fault> {
        if !bus.sram.contains(addr) {
            return Err(Fault::Memory { pc: self.op_pc, addr });
        }
        let addr = addr as u16;
        if addr < layout::IO_BASE || addr > bus.io_end() {
            bus.sram.set(addr, value);
            return Ok(());
        }
        match addr {
            regs::SREG => self.sreg = value,
            regs::SPL => self.sp = (self.sp & 0xFF00) | value as u16,
            regs::SPH => self.sp = (self.sp & 0x00FF) | ((value as u16) << 8),
            _ => bus.io_write(addr, value),
        }
        Ok(())
    }

    /// IN: port number 0..63 relative to the I/O base
    pub(crate) fn io_in(&mut self, bus: &mut Bus, port: u16) -> u8 {
        match port + layout::IO_OFFSET {
            regs::SREG => self.sreg,
            regs::SPL => self.sp as u8,
            regs::SPH => (self.sp >> 8) as u8,
            addr => bus.io_read(addr),
        }
    }

    /// OUT: port number 0..63 relative to the I/O base
    pub(crate) fn io_out(&mut self, bus: &mut Bus, port: u16, value: u8) {
        match port + layout::IO_OFFSET {
            regs::SREG => self.sreg = value,
            regs::SPL => self.sp = (self.sp & 0xFF00) | value as u16,
            regs::SPH => self.sp = (self.sp & 0x00FF) | ((value as u16) << 8),
            addr => bus.io_write(addr, value),
        }
    }

    /// Wrap the PC at the end of flash
    #[inline]
    pub(crate) fn wrap_pc(&self, pc: u32) -> u32 {
        pc % self.flash_size
    }
}
