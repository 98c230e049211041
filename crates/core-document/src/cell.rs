//! Atomic units of disassembly.
//!
//! A cell covers a contiguous byte range with one meaning. Every byte of a
//! memory area belongs to at most one explicit cell; bytes without one form
//! the implicit unknown sea and behave as one-byte [`CellKind::Unknown`]
//! cells.

use std::fmt;

use core_expr::Expression;

/// Meaning of a cell's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Unknown,
    Instruction,
    Value,
    Character,
    String,
}

impl CellKind {
    pub fn name(&self) -> &'static str {
        match self {
            CellKind::Unknown => "unknown",
            CellKind::Instruction => "instruction",
            CellKind::Value => "value",
            CellKind::Character => "character",
            CellKind::String => "string",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "unknown" => CellKind::Unknown,
            "instruction" => CellKind::Instruction,
            "value" => CellKind::Value,
            "character" => CellKind::Character,
            "string" => CellKind::String,
            _ => return None,
        })
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared descriptor of any cell: its meaning, encoded size, display style
/// and the architecture responsible for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellData {
    pub kind: CellKind,
    /// Kind-specific refinement: value size code, character encoding, ...
    pub subtype: u8,
    /// Bytes covered, fixed at construction.
    pub length: u16,
    pub format_style: u8,
    pub architecture_tag: u32,
    pub mode: u8,
}

impl CellData {
    pub fn new(kind: CellKind, subtype: u8, length: u16) -> Self {
        Self {
            kind,
            subtype,
            length,
            format_style: 0,
            architecture_tag: 0,
            mode: 0,
        }
    }

    pub fn with_architecture(mut self, tag: u32, mode: u8) -> Self {
        self.architecture_tag = tag;
        self.mode = mode;
        self
    }
}

bitflags::bitflags! {
    /// Execution-flow classification of an instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstructionFlags: u8 {
        const JUMP        = 1 << 1;
        const CALL        = 1 << 2;
        const RETURN      = 1 << 3;
        const CONDITIONAL = 1 << 4;
    }
}

/// A decoded machine instruction with its operand and semantic expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub data: CellData,
    pub mnemonic: String,
    pub opcode: u32,
    pub flow: InstructionFlags,
    pub prefix: u32,
    pub tested_flags: u32,
    pub updated_flags: u32,
    pub cleared_flags: u32,
    pub fixed_flags: u32,
    operands: Vec<Expression>,
    semantics: Vec<Expression>,
}

impl Instruction {
    pub fn new(mnemonic: impl Into<String>, opcode: u32, length: u16) -> Self {
        Self {
            data: CellData::new(CellKind::Instruction, 0, length),
            mnemonic: mnemonic.into(),
            opcode,
            flow: InstructionFlags::empty(),
            prefix: 0,
            tested_flags: 0,
            updated_flags: 0,
            cleared_flags: 0,
            fixed_flags: 0,
            operands: Vec::new(),
            semantics: Vec::new(),
        }
    }

    pub fn with_flow(mut self, flow: InstructionFlags) -> Self {
        self.flow = flow;
        self
    }

    pub fn length(&self) -> u16 {
        self.data.length
    }

    pub fn add_operand(&mut self, operand: Expression) {
        self.operands.push(operand);
    }

    pub fn operand(&self, index: usize) -> Option<&Expression> {
        self.operands.get(index)
    }

    pub fn operands(&self) -> &[Expression] {
        &self.operands
    }

    pub fn semantics(&self) -> &[Expression] {
        &self.semantics
    }

    pub fn set_semantics(&mut self, semantics: Vec<Expression>) {
        self.semantics = semantics;
    }

    pub fn add_pre_semantic(&mut self, expr: Expression) {
        self.semantics.insert(0, expr);
    }

    pub fn add_post_semantic(&mut self, expr: Expression) {
        self.semantics.push(expr);
    }

    pub fn is_unconditional_flow_break(&self) -> bool {
        (self.flow.contains(InstructionFlags::JUMP) || self.flow.contains(InstructionFlags::RETURN))
            && !self.flow.contains(InstructionFlags::CONDITIONAL)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mnem: {}({:08x}), length: {}, oprd: {}",
            self.mnemonic,
            self.opcode,
            self.data.length,
            self.operands.len()
        )
    }
}

/// Any cell. Instruction cells carry their decoded form alongside the shared
/// descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Plain(CellData),
    Code(Box<Instruction>),
}

impl Cell {
    pub fn unknown() -> Self {
        Cell::Plain(CellData::new(CellKind::Unknown, 0, 1))
    }

    /// A numeric value cell of 1, 2, 4 or 8 bytes.
    pub fn value(length: u16) -> Self {
        Cell::Plain(CellData::new(CellKind::Value, length as u8, length))
    }

    /// A single character of the given encoding (`subtype`).
    pub fn character(encoding: u8, length: u16) -> Self {
        Cell::Plain(CellData::new(CellKind::Character, encoding, length))
    }

    pub fn instruction(insn: Instruction) -> Self {
        Cell::Code(Box::new(insn))
    }

    pub fn data(&self) -> &CellData {
        match self {
            Cell::Plain(data) => data,
            Cell::Code(insn) => &insn.data,
        }
    }

    pub fn data_mut(&mut self) -> &mut CellData {
        match self {
            Cell::Plain(data) => data,
            Cell::Code(insn) => &mut insn.data,
        }
    }

    pub fn kind(&self) -> CellKind {
        self.data().kind
    }

    pub fn length(&self) -> u16 {
        self.data().length
    }

    pub fn as_instruction(&self) -> Option<&Instruction> {
        match self {
            Cell::Code(insn) => Some(insn),
            Cell::Plain(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            CellKind::Unknown,
            CellKind::Instruction,
            CellKind::Value,
            CellKind::Character,
            CellKind::String,
        ] {
            assert_eq!(CellKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(CellKind::from_name("garbage"), None);
    }

    #[test]
    fn instruction_cell_exposes_shared_descriptor() {
        let mut insn = Instruction::new("jmp", 3, 5).with_flow(InstructionFlags::JUMP);
        insn.add_operand(Expression::constant(32, 0x2000));
        let cell = Cell::instruction(insn);
        assert_eq!(cell.kind(), CellKind::Instruction);
        assert_eq!(cell.length(), 5);
        assert!(cell.as_instruction().unwrap().is_unconditional_flow_break());
    }

    #[test]
    fn conditional_jump_is_not_a_flow_break() {
        let insn =
            Instruction::new("jz", 6, 6).with_flow(InstructionFlags::JUMP | InstructionFlags::CONDITIONAL);
        assert!(!insn.is_unconditional_flow_break());
        let call = Instruction::new("call", 4, 5).with_flow(InstructionFlags::CALL);
        assert!(!call.is_unconditional_flow_break());
    }

    #[test]
    fn pre_and_post_semantics_order() {
        let mut insn = Instruction::new("nop", 9, 1);
        insn.set_semantics(vec![Expression::constant(8, 1)]);
        insn.add_pre_semantic(Expression::constant(8, 0));
        insn.add_post_semantic(Expression::constant(8, 2));
        let values: Vec<_> = insn
            .semantics()
            .iter()
            .map(|e| match e {
                Expression::Const { value, .. } => *value,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(values, vec![0, 1, 2]);
    }
}
