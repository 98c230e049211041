//! Reference architecture back-end.
//!
//! A deliberately small byte-coded instruction set used by the command line
//! front-end and the integration tests to exercise the full pipeline:
//! decoding, lifting to semantic expressions, operand references, evaluation
//! and analysis. Little-endian, flat 32-bit, one mode.
//!
//! Encoding (`imm32` is little-endian):
//!
//! | opcode | form                | length |
//! |--------|---------------------|--------|
//! | `01`   | `ld   rd, imm32`    | 6      |
//! | `02`   | `add  rd, rs`       | 3      |
//! | `03`   | `jmp  imm32`        | 5      |
//! | `04`   | `call imm32`        | 5      |
//! | `05`   | `ret`               | 1      |
//! | `06`   | `jz   rd, imm32`    | 6      |
//! | `07`   | `st   [imm32], rs`  | 6      |
//! | `08`   | `ld   rd, [imm32]`  | 6      |
//! | `09`   | `nop`               | 1      |

use std::sync::Arc;

use core_address::Address;
use core_cpu::{CpuInformation, RegisterId, RegisterRole};
use core_document::{Instruction, InstructionFlags};
use core_expr::{CondKind, Condition, Expression, OpKind};

use crate::{Architecture, Endianness, Error, Result};

const REG_COUNT: u8 = 4;

pub struct MicroArchitecture {
    cpu: Arc<CpuInformation>,
    sp: RegisterId,
    pc: RegisterId,
}

impl MicroArchitecture {
    pub fn new() -> Self {
        let cpu = CpuInformation::builder("micro32")
            .register("r0", 32)
            .register("r1", 32)
            .register("r2", 32)
            .register("r3", 32)
            .register("sp", 32)
            .register("pc", 32)
            .role(RegisterRole::StackPointer, "sp")
            .role(RegisterRole::ProgramPointer, "pc")
            .build();
        let sp = cpu.register_id("sp").expect("sp declared");
        let pc = cpu.register_id("pc").expect("pc declared");
        Self { cpu, sp, pc }
    }

    fn reg(&self, bytes: &[u8], index: usize, addr: &Address) -> Result<RegisterId> {
        let raw = *bytes.get(index).ok_or(Error::Decode(*addr))?;
        if raw >= REG_COUNT {
            return Err(Error::Decode(*addr));
        }
        Ok(raw as RegisterId)
    }

    fn imm32(&self, bytes: &[u8], index: usize, addr: &Address) -> Result<u64> {
        let slice = bytes
            .get(index..index + 4)
            .ok_or(Error::Decode(*addr))?;
        Ok(u32::from_le_bytes(slice.try_into().expect("4 bytes")) as u64)
    }

    fn id(&self, reg: RegisterId) -> Expression {
        Expression::identifier(reg, &self.cpu)
    }

    fn target_operand(&self, target: u64) -> Expression {
        Expression::memory(
            32,
            Expression::constant(16, 0),
            Expression::constant(32, target),
            false,
        )
    }

    fn deref(&self, offset: Expression) -> Expression {
        Expression::memory(32, Expression::constant(16, 0), offset, true)
    }

    fn finish(&self, mut insn: Instruction, mode: u8) -> Instruction {
        insn.data.architecture_tag = self.tag();
        insn.data.mode = mode;
        insn
    }
}

impl Default for MicroArchitecture {
    fn default() -> Self {
        Self::new()
    }
}

impl Architecture for MicroArchitecture {
    fn name(&self) -> &str {
        "micro32"
    }

    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn modes(&self) -> Vec<(String, u8)> {
        vec![("flat".to_owned(), 0)]
    }

    fn default_mode(&self, _addr: &Address) -> u8 {
        0
    }

    fn max_instruction_length(&self) -> usize {
        6
    }

    fn cpu_information(&self) -> Arc<CpuInformation> {
        Arc::clone(&self.cpu)
    }

    fn disassemble(&self, bytes: &[u8], addr: &Address, mode: u8) -> Result<Instruction> {
        if mode != 0 {
            return Err(Error::UnsupportedMode(mode));
        }
        let opcode = *bytes.first().ok_or(Error::Decode(*addr))?;
        let insn = match opcode {
            0x01 => {
                let rd = self.reg(bytes, 1, addr)?;
                let imm = self.imm32(bytes, 2, addr)?;
                let mut insn = Instruction::new("ld", 0x01, 6);
                insn.add_operand(self.id(rd));
                insn.add_operand(Expression::constant(32, imm));
                insn.set_semantics(vec![Expression::assign(
                    self.id(rd),
                    Expression::constant(32, imm),
                )]);
                insn
            }
            0x02 => {
                let rd = self.reg(bytes, 1, addr)?;
                let rs = self.reg(bytes, 2, addr)?;
                let mut insn = Instruction::new("add", 0x02, 3);
                insn.add_operand(self.id(rd));
                insn.add_operand(self.id(rs));
                insn.set_semantics(vec![Expression::assign(
                    self.id(rd),
                    Expression::operation(OpKind::Add, self.id(rd), self.id(rs)),
                )]);
                insn
            }
            0x03 => {
                let target = self.imm32(bytes, 1, addr)?;
                let mut insn =
                    Instruction::new("jmp", 0x03, 5).with_flow(InstructionFlags::JUMP);
                insn.add_operand(self.target_operand(target));
                insn.set_semantics(vec![Expression::assign(
                    self.id(self.pc),
                    Expression::constant(32, target),
                )]);
                insn
            }
            0x04 => {
                let target = self.imm32(bytes, 1, addr)?;
                let ret = addr.offset().wrapping_add(5);
                let mut insn =
                    Instruction::new("call", 0x04, 5).with_flow(InstructionFlags::CALL);
                insn.add_operand(self.target_operand(target));
                insn.set_semantics(vec![Expression::bind(vec![
                    Expression::assign(
                        self.id(self.sp),
                        Expression::operation(
                            OpKind::Sub,
                            self.id(self.sp),
                            Expression::constant(32, 4),
                        ),
                    ),
                    Expression::assign(
                        self.deref(self.id(self.sp)),
                        Expression::constant(32, ret),
                    ),
                    Expression::assign(self.id(self.pc), Expression::constant(32, target)),
                ])]);
                insn
            }
            0x05 => {
                let mut insn =
                    Instruction::new("ret", 0x05, 1).with_flow(InstructionFlags::RETURN);
                insn.set_semantics(vec![Expression::bind(vec![
                    Expression::assign(self.id(self.pc), self.deref(self.id(self.sp))),
                    Expression::assign(
                        self.id(self.sp),
                        Expression::operation(
                            OpKind::Add,
                            self.id(self.sp),
                            Expression::constant(32, 4),
                        ),
                    ),
                ])]);
                insn
            }
            0x06 => {
                let rd = self.reg(bytes, 1, addr)?;
                let target = self.imm32(bytes, 2, addr)?;
                let mut insn = Instruction::new("jz", 0x06, 6)
                    .with_flow(InstructionFlags::JUMP | InstructionFlags::CONDITIONAL);
                insn.add_operand(self.id(rd));
                insn.add_operand(self.target_operand(target));
                insn.set_semantics(vec![Expression::if_else(
                    Condition::new(CondKind::Eq, self.id(rd), Expression::constant(32, 0)),
                    Expression::assign(self.id(self.pc), Expression::constant(32, target)),
                    None,
                )]);
                insn
            }
            0x07 => {
                let rs = self.reg(bytes, 1, addr)?;
                let slot = self.imm32(bytes, 2, addr)?;
                let mut insn = Instruction::new("st", 0x07, 6);
                insn.add_operand(self.deref(Expression::constant(32, slot)));
                insn.add_operand(self.id(rs));
                insn.set_semantics(vec![Expression::assign(
                    self.deref(Expression::constant(32, slot)),
                    self.id(rs),
                )]);
                insn
            }
            0x08 => {
                let rd = self.reg(bytes, 1, addr)?;
                let slot = self.imm32(bytes, 2, addr)?;
                let mut insn = Instruction::new("ld", 0x08, 6);
                insn.add_operand(self.id(rd));
                insn.add_operand(self.deref(Expression::constant(32, slot)));
                insn.set_semantics(vec![Expression::assign(
                    self.id(rd),
                    self.deref(Expression::constant(32, slot)),
                )]);
                insn
            }
            0x09 => Instruction::new("nop", 0x09, 1),
            _ => return Err(Error::Decode(*addr)),
        };
        Ok(self.finish(insn, mode))
    }
}
