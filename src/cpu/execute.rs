//! Instruction decode and execution
//!
//! Decode dispatches on the high opcode bits with sub-dispatch where
//! encodings collide (the 0x9xxx group). Each arm returns the opcode's
//! fixed cycle cost from the instruction set manual; taken branches and
//! skips add their extra cycles inline.

use super::flags;
use super::Cpu;
use crate::bus::Bus;
use crate::fault::Fault;

const REG_X: usize = 26;
const REG_Y: usize = 28;
const REG_Z: usize = 30;

/// Destination register field, bits 8:4
#[inline]
fn d5(op: u16) -> usize {
    ((op >> 4) & 0x1F) as usize
}

/// Source register field, bits 9 and 3:0
#[inline]
fn r5(op: u16) -> usize {
    ((op & 0x0F) | ((op >> 5) & 0x10)) as usize
}

/// Upper-half destination register for immediate opcodes (r16..r31)
#[inline]
fn d4h(op: u16) -> usize {
    (16 + ((op >> 4) & 0x0F)) as usize
}

/// 8-bit immediate, split across bits 11:8 and 3:0
#[inline]
fn k8(op: u16) -> u8 {
    (((op >> 4) & 0xF0) | (op & 0x0F)) as u8
}

/// Displacement for LDD/STD, bits 13, 11:10, 2:0
#[inline]
fn q6(op: u16) -> u32 {
    (((op >> 8) & 0x20) | ((op >> 7) & 0x18) | (op & 0x07)) as u32
}

/// Whether an opcode occupies two words (affects skip length and cost)
#[inline]
fn is_two_word(op: u16) -> bool {
    (op & 0xFE0F) == 0x9000     // LDS
        || (op & 0xFE0F) == 0x9200 // STS
        || (op & 0xFE0E) == 0x940C // JMP
        || (op & 0xFE0E) == 0x940E // CALL
}

impl Cpu {
    /// Fetch, decode and execute one instruction at PC.
    ///
    /// On a fault the PC is restored to the offending instruction and no
    /// cycles are reported, so the cycle counter stays where the fetch
    /// left it.
    pub(crate) fn exec_one(&mut self, bus: &mut Bus) -> Result<u32, Fault> {
        let pc = self.pc;
        self.op_pc = pc;
        let op = bus.flash.word(pc);
        self.pc = self.wrap_pc(pc.wrapping_add(2));

        let result = self.dispatch(bus, pc, op);
        if result.is_err() {
            self.pc = pc;
        }
        result
    }

    fn dispatch(&mut self, bus: &mut Bus, pc: u32, op: u16) -> Result<u32, Fault> {
        match op >> 12 {
            0x0 => self.exec_0(bus, pc, op),
            0x1 => self.exec_1(bus, op),
            0x2 => self.exec_2(bus, op),
            // CPI
            0x3 => {
                let d = d4h(op);
                let rd = bus.sram.reg(d);
                self.alu_sub(rd, k8(op), false);
                Ok(1)
            }
            // SBCI
            0x4 => {
                let d = d4h(op);
                let rd = bus.sram.reg(d);
                let carry = self.flag(flags::C);
                let res = self.alu_sbc(rd, k8(op), carry);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            // SUBI
            0x5 => {
                let d = d4h(op);
                let rd = bus.sram.reg(d);
                let res = self.alu_sub(rd, k8(op), false);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            // ORI
            0x6 => {
                let d = d4h(op);
                let res = bus.sram.reg(d) | k8(op);
                self.alu_logic_flags(res);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            // ANDI
            0x7 => {
                let d = d4h(op);
                let res = bus.sram.reg(d) & k8(op);
                self.alu_logic_flags(res);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            0x8 | 0xA => self.exec_ldd_std(bus, op),
            0x9 => self.exec_9(bus, pc, op),
            0xB => self.exec_in_out(bus, op),
            // RJMP
            0xC => {
                let k = sign_extend(op & 0x0FFF, 12);
                self.pc = self.rel_jump(k);
                Ok(2)
            }
            // RCALL
            0xD => {
                let k = sign_extend(op & 0x0FFF, 12);
                self.push_ret_addr(bus, self.pc)?;
                self.pc = self.rel_jump(k);
                Ok(3)
            }
            // LDI
            0xE => {
                bus.sram.set_reg(d4h(op), k8(op));
                Ok(1)
            }
            0xF => self.exec_f(bus, op),
            _ => unreachable!(),
        }
    }

    /// 0x0xxx: NOP, MOVW, MULS(U), FMUL family, CPC, SBC, ADD
    fn exec_0(&mut self, bus: &mut Bus, pc: u32, op: u16) -> Result<u32, Fault> {
        match (op >> 10) & 0x03 {
            0 => match (op >> 8) & 0x03 {
                0 => {
                    if op == 0x0000 {
                        Ok(1) // NOP
                    } else {
                        Err(Fault::Decode { pc, opcode: op })
                    }
                }
                // MOVW
                1 => {
                    let d = (((op >> 4) & 0x0F) * 2) as usize;
                    let r = ((op & 0x0F) * 2) as usize;
                    let v = bus.sram.reg_pair(r);
                    bus.sram.set_reg_pair(d, v);
                    Ok(1)
                }
                // MULS
                2 => {
                    let d = d4h(op);
                    let r = (16 + (op & 0x0F)) as usize;
                    let prod = (bus.sram.reg(d) as i8 as i16 as i32
                        * bus.sram.reg(r) as i8 as i16 as i32)
                        as u32;
                    self.mul_result(bus, prod as u16, false);
                    Ok(2)
                }
                // MULSU / FMUL / FMULS / FMULSU
                3 => {
                    let d = (16 + ((op >> 4) & 0x07)) as usize;
                    let r = (16 + (op & 0x07)) as usize;
                    let rd = bus.sram.reg(d);
                    let rr = bus.sram.reg(r);
                    let (prod, fractional) = match ((op >> 7) & 0x01, (op >> 3) & 0x01) {
                        (0, 0) => ((rd as i8 as i16 as i32 * rr as i32) as u16, false),
                        (0, 1) => ((rd as u16 * rr as u16), true),
                        (1, 0) => ((rd as i8 as i16 as i32 * rr as i8 as i16 as i32) as u16, true),
                        (1, 1) => ((rd as i8 as i16 as i32 * rr as i32) as u16, true),
                        _ => unreachable!(),
                    };
                    self.mul_result(bus, prod, fractional);
                    Ok(2)
                }
                _ => unreachable!(),
            },
            // CPC
            1 => {
                let carry = self.flag(flags::C);
                self.alu_sbc(bus.sram.reg(d5(op)), bus.sram.reg(r5(op)), carry);
                Ok(1)
            }
            // SBC
            2 => {
                let d = d5(op);
                let carry = self.flag(flags::C);
                let res = self.alu_sbc(bus.sram.reg(d), bus.sram.reg(r5(op)), carry);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            // ADD
            3 => {
                let d = d5(op);
                let res = self.alu_add(bus.sram.reg(d), bus.sram.reg(r5(op)), false);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            _ => unreachable!(),
        }
    }

    /// 0x1xxx: CPSE, CP, SUB, ADC
    fn exec_1(&mut self, bus: &mut Bus, op: u16) -> Result<u32, Fault> {
        match (op >> 10) & 0x03 {
            // CPSE
            0 => {
                if bus.sram.reg(d5(op)) == bus.sram.reg(r5(op)) {
                    Ok(self.skip_next(bus))
                } else {
                    Ok(1)
                }
            }
            // CP
            1 => {
                self.alu_sub(bus.sram.reg(d5(op)), bus.sram.reg(r5(op)), false);
                Ok(1)
            }
            // SUB
            2 => {
                let d = d5(op);
                let res = self.alu_sub(bus.sram.reg(d), bus.sram.reg(r5(op)), false);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            // ADC
            3 => {
                let d = d5(op);
                let carry = self.flag(flags::C);
                let res = self.alu_add(bus.sram.reg(d), bus.sram.reg(r5(op)), carry);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            _ => unreachable!(),
        }
    }

    /// 0x2xxx: AND, EOR, OR, MOV
    fn exec_2(&mut self, bus: &mut Bus, op: u16) -> Result<u32, Fault> {
        let d = d5(op);
        let rr = bus.sram.reg(r5(op));
        match (op >> 10) & 0x03 {
            0 => {
                let res = bus.sram.reg(d) & rr;
                self.alu_logic_flags(res);
                bus.sram.set_reg(d, res);
            }
            1 => {
                let res = bus.sram.reg(d) ^ rr;
                self.alu_logic_flags(res);
                bus.sram.set_reg(d, res);
            }
            2 => {
                let res = bus.sram.reg(d) | rr;
                self.alu_logic_flags(res);
                bus.sram.set_reg(d, res);
            }
            3 => bus.sram.set_reg(d, rr),
            _ => unreachable!(),
        }
        Ok(1)
    }

    /// LDD/STD through Y or Z with displacement (and the q=0 LD/ST forms)
    fn exec_ldd_std(&mut self, bus: &mut Bus, op: u16) -> Result<u32, Fault> {
        let d = d5(op);
        let base = if op & 0x0008 != 0 { REG_Y } else { REG_Z };
        let addr = bus.sram.reg_pair(base) as u32 + q6(op);
        if op & 0x0200 != 0 {
            let v = bus.sram.reg(d);
            self.data_write(bus, addr, v)?;
        } else {
            let v = self.data_read(bus, addr)?;
            bus.sram.set_reg(d, v);
        }
        Ok(2)
    }

    /// The 0x9xxx group
    fn exec_9(&mut self, bus: &mut Bus, pc: u32, op: u16) -> Result<u32, Fault> {
        match (op >> 8) & 0x0F {
            0x0 | 0x1 => self.exec_ld_indirect(bus, pc, op),
            0x2 | 0x3 => self.exec_st_indirect(bus, pc, op),
            0x4 | 0x5 => self.exec_one_operand(bus, pc, op),
            // ADIW
            0x6 => {
                let d = 24 + 2 * ((op >> 4) & 0x03) as usize;
                let k = (((op >> 2) & 0x30) | (op & 0x0F)) as u16;
                let val = bus.sram.reg_pair(d);
                let res = val.wrapping_add(k);
                bus.sram.set_reg_pair(d, res);
                self.put_flag(flags::V, (val & 0x8000) == 0 && (res & 0x8000) != 0);
                self.put_flag(flags::C, (res & 0x8000) == 0 && (val & 0x8000) != 0);
                self.put_flag(flags::N, res & 0x8000 != 0);
                self.put_flag(flags::Z, res == 0);
                self.put_flag(flags::S, self.flag(flags::N) != self.flag(flags::V));
                Ok(2)
            }
            // SBIW
            0x7 => {
                let d = 24 + 2 * ((op >> 4) & 0x03) as usize;
                let k = (((op >> 2) & 0x30) | (op & 0x0F)) as u16;
                let val = bus.sram.reg_pair(d);
                let res = val.wrapping_sub(k);
                bus.sram.set_reg_pair(d, res);
                self.put_flag(flags::V, (val & 0x8000) != 0 && (res & 0x8000) == 0);
                self.put_flag(flags::C, (res & 0x8000) != 0 && (val & 0x8000) == 0);
                self.put_flag(flags::N, res & 0x8000 != 0);
                self.put_flag(flags::Z, res == 0);
                self.put_flag(flags::S, self.flag(flags::N) != self.flag(flags::V));
                Ok(2)
            }
            // CBI / SBIC / SBI / SBIS
            0x8 => {
                let port = ((op >> 3) & 0x1F) as u16;
                let bit = (op & 0x07) as u8;
                let v = self.io_in(bus, port);
                self.io_out(bus, port, v & !(1 << bit));
                Ok(2)
            }
            0x9 => {
                let port = ((op >> 3) & 0x1F) as u16;
                let bit = (op & 0x07) as u8;
                if self.io_in(bus, port) & (1 << bit) == 0 {
                    Ok(self.skip_next(bus))
                } else {
                    Ok(1)
                }
            }
            0xA => {
                let port = ((op >> 3) & 0x1F) as u16;
                let bit = (op & 0x07) as u8;
                let v = self.io_in(bus, port);
                self.io_out(bus, port, v | (1 << bit));
                Ok(2)
            }
            0xB => {
                let port = ((op >> 3) & 0x1F) as u16;
                let bit = (op & 0x07) as u8;
                if self.io_in(bus, port) & (1 << bit) != 0 {
                    Ok(self.skip_next(bus))
                } else {
                    Ok(1)
                }
            }
            // MUL
            0xC..=0xF => {
                let prod = bus.sram.reg(d5(op)) as u16 * bus.sram.reg(r5(op)) as u16;
                self.mul_result(bus, prod, false);
                Ok(2)
            }
            _ => unreachable!(),
        }
    }

    /// LDS, POP, LPM/ELPM, and indirect loads
    fn exec_ld_indirect(&mut self, bus: &mut Bus, pc: u32, op: u16) -> Result<u32, Fault> {
        let d = d5(op);
        match op & 0x000F {
            // LDS
            0x0 => {
                let addr = bus.flash.word(self.pc) as u32;
                self.pc = self.wrap_pc(self.pc.wrapping_add(2));
                let v = self.data_read(bus, addr)?;
                bus.sram.set_reg(d, v);
                Ok(2)
            }
            0x1 => self.ld_through(bus, d, REG_Z, Step::PostInc),
            0x2 => self.ld_through(bus, d, REG_Z, Step::PreDec),
            // LPM Rd, Z / LPM Rd, Z+
            0x4 | 0x5 => {
                let z = bus.sram.reg_pair(REG_Z);
                bus.sram.set_reg(d, bus.flash.read(z as u32));
                if op & 0x01 != 0 {
                    bus.sram.set_reg_pair(REG_Z, z.wrapping_add(1));
                }
                Ok(3)
            }
            // ELPM Rd, Z / ELPM Rd, Z+ (no RAMPZ on this family)
            0x6 | 0x7 => {
                let z = bus.sram.reg_pair(REG_Z);
                bus.sram.set_reg(d, bus.flash.read(z as u32));
                if op & 0x01 != 0 {
                    bus.sram.set_reg_pair(REG_Z, z.wrapping_add(1));
                }
                Ok(3)
            }
            0x9 => self.ld_through(bus, d, REG_Y, Step::PostInc),
            0xA => self.ld_through(bus, d, REG_Y, Step::PreDec),
            0xC => self.ld_through(bus, d, REG_X, Step::None),
            0xD => self.ld_through(bus, d, REG_X, Step::PostInc),
            0xE => self.ld_through(bus, d, REG_X, Step::PreDec),
            // POP
            0xF => {
                let v = self.pop8(bus)?;
                bus.sram.set_reg(d, v);
                Ok(2)
            }
            _ => Err(Fault::Decode { pc, opcode: op }),
        }
    }

    /// STS, PUSH, and indirect stores
    fn exec_st_indirect(&mut self, bus: &mut Bus, pc: u32, op: u16) -> Result<u32, Fault> {
        let d = d5(op);
        match op & 0x000F {
            // STS
            0x0 => {
                let addr = bus.flash.word(self.pc) as u32;
                self.pc = self.wrap_pc(self.pc.wrapping_add(2));
                let v = bus.sram.reg(d);
                self.data_write(bus, addr, v)?;
                Ok(2)
            }
            0x1 => self.st_through(bus, d, REG_Z, Step::PostInc),
            0x2 => self.st_through(bus, d, REG_Z, Step::PreDec),
            0x9 => self.st_through(bus, d, REG_Y, Step::PostInc),
            0xA => self.st_through(bus, d, REG_Y, Step::PreDec),
            0xC => self.st_through(bus, d, REG_X, Step::None),
            0xD => self.st_through(bus, d, REG_X, Step::PostInc),
            0xE => self.st_through(bus, d, REG_X, Step::PreDec),
            // PUSH
            0xF => {
                let v = bus.sram.reg(d);
                self.push8(bus, v)?;
                Ok(2)
            }
            _ => Err(Fault::Decode { pc, opcode: op }),
        }
    }

    /// One-operand ALU ops, flow control, and the misc 0x95x8 block
    fn exec_one_operand(&mut self, bus: &mut Bus, pc: u32, op: u16) -> Result<u32, Fault> {
        let d = d5(op);
        match op & 0x000F {
            // COM
            0x0 => {
                let res = !bus.sram.reg(d);
                self.put_flag(flags::C, true);
                self.alu_logic_flags(res);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            // NEG
            0x1 => {
                let rd = bus.sram.reg(d);
                let res = 0u8.wrapping_sub(rd);
                self.put_flag(flags::H, (res | rd) & 0x08 != 0);
                self.put_flag(flags::V, res == 0x80);
                self.put_flag(flags::C, res != 0);
                self.nzs_pub(res);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            // SWAP
            0x2 => {
                let rd = bus.sram.reg(d);
                bus.sram.set_reg(d, (rd << 4) | (rd >> 4));
                Ok(1)
            }
            // INC
            0x3 => {
                let rd = bus.sram.reg(d);
                let res = rd.wrapping_add(1);
                self.put_flag(flags::V, rd == 0x7F);
                self.nzs_pub(res);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            // ASR
            0x5 => {
                let rd = bus.sram.reg(d);
                let res = ((rd as i8) >> 1) as u8;
                self.alu_shift_flags(res, rd & 0x01 != 0);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            // LSR
            0x6 => {
                let rd = bus.sram.reg(d);
                let res = rd >> 1;
                self.alu_shift_flags(res, rd & 0x01 != 0);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            // ROR
            0x7 => {
                let rd = bus.sram.reg(d);
                let res = (rd >> 1) | ((self.flag(flags::C) as u8) << 7);
                self.alu_shift_flags(res, rd & 0x01 != 0);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            0x8 if op & 0x0100 == 0 => {
                // BSET / BCLR
                let s = 1u8 << ((op >> 4) & 0x07);
                if op & 0x0080 == 0 {
                    self.sreg |= s;
                } else {
                    self.sreg &= !s;
                }
                Ok(1)
            }
            0x8 => self.exec_misc(bus, pc, op),
            0x9 => match op {
                // IJMP
                0x9409 => {
                    self.pc = self.wrap_pc((bus.sram.reg_pair(REG_Z) as u32) << 1);
                    Ok(2)
                }
                // ICALL
                0x9509 => {
                    self.push_ret_addr(bus, self.pc)?;
                    self.pc = self.wrap_pc((bus.sram.reg_pair(REG_Z) as u32) << 1);
                    Ok(3)
                }
                // EIJMP/EICALL need EIND, absent on this family
                _ => Err(Fault::Decode { pc, opcode: op }),
            },
            // DEC
            0xA => {
                let rd = bus.sram.reg(d);
                let res = rd.wrapping_sub(1);
                self.put_flag(flags::V, rd == 0x80);
                self.nzs_pub(res);
                bus.sram.set_reg(d, res);
                Ok(1)
            }
            // JMP
            0xC | 0xD => {
                let hi = (((op >> 3) & 0x3E) | (op & 0x01)) as u32;
                let word = bus.flash.word(self.pc) as u32;
                self.pc = self.wrap_pc(((hi << 16) | word) << 1);
                Ok(3)
            }
            // CALL
            0xE | 0xF => {
                let hi = (((op >> 3) & 0x3E) | (op & 0x01)) as u32;
                let word = bus.flash.word(self.pc) as u32;
                let target = self.wrap_pc(((hi << 16) | word) << 1);
                self.push_ret_addr(bus, self.pc.wrapping_add(2))?;
                self.pc = target;
                Ok(4)
            }
            _ => Err(Fault::Decode { pc, opcode: op }),
        }
    }

    /// RET/RETI/SLEEP/BREAK/WDR/LPM r0/SPM
    fn exec_misc(&mut self, bus: &mut Bus, pc: u32, op: u16) -> Result<u32, Fault> {
        match op {
            // RET
            0x9508 => {
                let ret_addr = self.pop_ret_addr(bus)?;
                self.pc = self.wrap_pc(ret_addr);
                Ok(4)
            }
            // RETI
            0x9518 => {
                let ret_addr = self.pop_ret_addr(bus)?;
                self.pc = self.wrap_pc(ret_addr);
                self.sreg |= flags::I;
                Ok(4)
            }
            // SLEEP
            0x9588 => {
                self.enter_sleep(bus);
                Ok(1)
            }
            // BREAK: no on-chip debugger attached, executes as NOP
            0x9598 => {
                log::debug!("BREAK at pc {:#06x}", pc);
                Ok(1)
            }
            // WDR
            0x95A8 => {
                bus.wdr();
                Ok(1)
            }
            // LPM (r0 implied) / ELPM
            0x95C8 | 0x95D8 => {
                let z = bus.sram.reg_pair(REG_Z);
                let v = bus.flash.read(z as u32);
                bus.sram.set_reg(0, v);
                Ok(3)
            }
            // SPM / SPM Z+: accepted, self-programming not modeled
            0x95E8 | 0x95F8 => {
                bus.spm_warning(pc);
                Ok(1)
            }
            _ => Err(Fault::Decode { pc, opcode: op }),
        }
    }

    /// IN / OUT
    fn exec_in_out(&mut self, bus: &mut Bus, op: u16) -> Result<u32, Fault> {
        let port = (((op >> 5) & 0x30) | (op & 0x0F)) as u16;
        let d = d5(op);
        if op & 0x0800 == 0 {
            let v = self.io_in(bus, port);
            bus.sram.set_reg(d, v);
        } else {
            let v = bus.sram.reg(d);
            self.io_out(bus, port, v);
        }
        Ok(1)
    }

    /// 0xFxxx: conditional branches and register bit ops
    fn exec_f(&mut self, bus: &mut Bus, op: u16) -> Result<u32, Fault> {
        match (op >> 9) & 0x07 {
            // BRBS
            0 | 1 => {
                let s = 1u8 << (op & 0x07);
                if self.sreg & s != 0 {
                    self.pc = self.rel_jump(sign_extend((op >> 3) & 0x7F, 7));
                    Ok(2)
                } else {
                    Ok(1)
                }
            }
            // BRBC
            2 | 3 => {
                let s = 1u8 << (op & 0x07);
                if self.sreg & s == 0 {
                    self.pc = self.rel_jump(sign_extend((op >> 3) & 0x7F, 7));
                    Ok(2)
                } else {
                    Ok(1)
                }
            }
            // BLD
            4 => {
                let d = d5(op);
                let bit = 1u8 << (op & 0x07);
                let v = bus.sram.reg(d);
                bus.sram
                    .set_reg(d, if self.flag(flags::T) { v | bit } else { v & !bit });
                Ok(1)
            }
            // BST
            5 => {
                let v = bus.sram.reg(d5(op));
                self.put_flag(flags::T, v & (1 << (op & 0x07)) != 0);
                Ok(1)
            }
            // SBRC
            6 => {
                if bus.sram.reg(d5(op)) & (1 << (op & 0x07)) == 0 {
                    Ok(self.skip_next(bus))
                } else {
                    Ok(1)
                }
            }
            // SBRS
            7 => {
                if bus.sram.reg(d5(op)) & (1 << (op & 0x07)) != 0 {
                    Ok(self.skip_next(bus))
                } else {
                    Ok(1)
                }
            }
            _ => unreachable!(),
        }
    }

    // ========== Shared pieces ==========

    fn ld_through(&mut self, bus: &mut Bus, d: usize, base: usize, step: Step) -> Result<u32, Fault> {
        let addr = self.step_pointer(bus, base, step);
        let v = self.data_read(bus, addr as u32)?;
        bus.sram.set_reg(d, v);
        Ok(2)
    }

    fn st_through(&mut self, bus: &mut Bus, d: usize, base: usize, step: Step) -> Result<u32, Fault> {
        let addr = self.step_pointer(bus, base, step);
        let v = bus.sram.reg(d);
        self.data_write(bus, addr as u32, v)?;
        Ok(2)
    }

    fn step_pointer(&mut self, bus: &mut Bus, base: usize, step: Step) -> u16 {
        let p = bus.sram.reg_pair(base);
        match step {
            Step::None => p,
            Step::PostInc => {
                bus.sram.set_reg_pair(base, p.wrapping_add(1));
                p
            }
            Step::PreDec => {
                let p = p.wrapping_sub(1);
                bus.sram.set_reg_pair(base, p);
                p
            }
        }
    }

    /// Skip the next instruction; returns the cycles the skip costs
    /// (2 for a one-word instruction, 3 for a two-word one)
    fn skip_next(&mut self, bus: &mut Bus) -> u32 {
        let next = bus.flash.word(self.pc);
        if is_two_word(next) {
            self.pc = self.wrap_pc(self.pc.wrapping_add(4));
            3
        } else {
            self.pc = self.wrap_pc(self.pc.wrapping_add(2));
            2
        }
    }

    /// r1:r0 = product; C from bit 15 (before the fractional shift)
    fn mul_result(&mut self, bus: &mut Bus, prod: u16, fractional: bool) {
        let carry = prod & 0x8000 != 0;
        let out = if fractional { prod << 1 } else { prod };
        bus.sram.set_reg(0, out as u8);
        bus.sram.set_reg(1, (out >> 8) as u8);
        self.put_flag(flags::C, carry);
        self.put_flag(flags::Z, out == 0);
    }

    #[inline]
    fn rel_jump(&self, k: i32) -> u32 {
        self.wrap_pc(self.pc.wrapping_add((k * 2) as u32))
    }

    /// N/Z/S update for the one-operand ops whose V is set separately
    fn nzs_pub(&mut self, res: u8) {
        self.put_flag(flags::N, res & 0x80 != 0);
        self.put_flag(flags::Z, res == 0);
        self.put_flag(flags::S, self.flag(flags::N) != self.flag(flags::V));
    }
}

#[derive(Clone, Copy)]
enum Step {
    None,
    PostInc,
    PreDec,
}

#[inline]
fn sign_extend(value: u16, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value as i32) << shift) >> shift
}
