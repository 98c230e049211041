//! Instruction-level stepping over a document.

use core_address::Address;
use core_cpu::{CpuContext, RegisterRole};
use core_document::Document;
use core_expr::Expression;
use tracing::{debug, trace};

use crate::eval::{Evaluator, DEFAULT_LOOP_CAP};
use crate::{MemoryContext, Result};

/// Owns the CPU and memory contexts of one execution and drives them through
/// instruction semantics.
pub struct Interpreter {
    cpu: CpuContext,
    mem: MemoryContext,
    loop_cap: u64,
    max_depth: usize,
}

impl Interpreter {
    pub fn new(cpu: CpuContext, mem: MemoryContext) -> Self {
        Self {
            cpu,
            mem,
            loop_cap: DEFAULT_LOOP_CAP,
            max_depth: core_expr::visitor::DEFAULT_MAX_VISIT_DEPTH,
        }
    }

    pub fn with_loop_cap(mut self, cap: u64) -> Self {
        self.loop_cap = cap.max(1);
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth.max(1);
        self
    }

    pub fn cpu(&self) -> &CpuContext {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuContext {
        &mut self.cpu
    }

    pub fn memory(&self) -> &MemoryContext {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut MemoryContext {
        &mut self.mem
    }

    /// Executes one instruction's expression list in order. Returns whether
    /// anything symbolic was involved.
    pub fn execute(&mut self, semantics: &[Expression]) -> Result<bool> {
        let mut evaluator = Evaluator::new(&mut self.cpu, &mut self.mem)
            .with_loop_cap(self.loop_cap)
            .with_max_depth(self.max_depth);
        let mut symbolic = false;
        for expr in semantics {
            let outcome = evaluator.evaluate(expr)?;
            trace!(target: "emul", expr = %expr, result = %outcome.expr, "executed");
            symbolic |= outcome.symbolic;
        }
        Ok(symbolic)
    }

    /// Fetches the instruction at the program pointer, executes its
    /// semantics, and advances past the instruction when the semantics did
    /// not branch. Returns the new program address, or `None` when there is
    /// no instruction to execute.
    pub fn step(&mut self, document: &Document) -> Result<Option<Address>> {
        let Some(pc_reg) = self
            .cpu
            .information()
            .register_by_role(RegisterRole::ProgramPointer)
        else {
            return Ok(None);
        };
        let pc = self.cpu.read_register_u64(pc_reg)?;
        let at = Address::flat(pc);
        let Some(cell) = document.cell(&at) else {
            return Ok(None);
        };
        let Some(insn) = cell.as_instruction() else {
            return Ok(None);
        };
        let length = insn.length() as u64;
        let semantics = insn.semantics().to_vec();

        if !semantics.is_empty() {
            self.execute(&semantics)?;
        }
        let mut new_pc = self.cpu.read_register_u64(pc_reg)?;
        if new_pc == pc {
            // Fall through: the semantics did not redirect control.
            new_pc = pc + length;
            self.cpu.write_register_u64(pc_reg, new_pc)?;
        }
        debug!(target: "emul", from = %at, to = %Address::flat(new_pc), "step");
        Ok(Some(Address::flat(new_pc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_cpu::CpuInformation;
    use core_document::{Access, Cell, Instruction, MemoryArea};
    use core_expr::{CondKind, Condition, Expression, OpKind};
    use std::sync::Arc;

    fn cpu_info() -> Arc<CpuInformation> {
        CpuInformation::builder("test")
            .register("r0", 32)
            .register("r1", 32)
            .register("pc", 32)
            .register("sp", 32)
            .role(RegisterRole::ProgramPointer, "pc")
            .role(RegisterRole::StackPointer, "sp")
            .build()
    }

    fn document_with_program() -> Arc<Document> {
        let doc = Document::new();
        doc.add_memory_area(MemoryArea::new(
            ".text",
            Address::flat(0x1000),
            vec![0; 32],
            Access::READ | Access::EXECUTE,
            1,
            0,
            Some(0),
        ))
        .unwrap();
        doc
            .set_cell(
                &Address::flat(0x1000),
                Cell::instruction(load_insn(0, 5)),
                false,
            )
            .unwrap();
        doc
            .set_cell(
                &Address::flat(0x1006),
                Cell::instruction(add_insn(1, 0, 7)),
                false,
            )
            .unwrap();
        Arc::new(doc)
    }

    fn load_insn(reg: u32, value: u64) -> Instruction {
        let cpu = cpu_info();
        let mut insn = Instruction::new("ld", 1, 6);
        insn.set_semantics(vec![Expression::assign(
            Expression::identifier(reg, &cpu),
            Expression::constant(32, value),
        )]);
        insn
    }

    fn add_insn(dst: u32, src: u32, value: u64) -> Instruction {
        let cpu = cpu_info();
        let mut insn = Instruction::new("add", 2, 6);
        insn.set_semantics(vec![Expression::assign(
            Expression::identifier(dst, &cpu),
            Expression::operation(
                OpKind::Add,
                Expression::identifier(src, &cpu),
                Expression::constant(32, value),
            ),
        )]);
        insn
    }

    #[test]
    fn step_executes_and_falls_through() {
        let doc = document_with_program();
        let info = cpu_info();
        let mut interp = Interpreter::new(CpuContext::new(info.clone()), MemoryContext::new());
        interp.cpu_mut().write_register_u64(2, 0x1000).unwrap();

        // ld r0, 5 occupies [0x1000, 0x1006).
        let next = interp.step(&doc).unwrap().unwrap();
        assert_eq!(next, Address::flat(0x1006));
        assert_eq!(interp.cpu().read_register_u64(0).unwrap(), 5);

        // add r1, r0, 7 lands on the next instruction.
        let next = interp.step(&doc).unwrap().unwrap();
        assert_eq!(next, Address::flat(0x100c));
        assert_eq!(interp.cpu().read_register_u64(1).unwrap(), 12);

        // 0x100c holds no instruction.
        assert_eq!(interp.step(&doc).unwrap(), None);
    }

    #[test]
    fn branch_semantics_redirect_the_step() {
        let doc = Document::new();
        doc.add_memory_area(MemoryArea::new(
            ".text",
            Address::flat(0x1000),
            vec![0; 16],
            Access::READ | Access::EXECUTE,
            1,
            0,
            None,
        ))
        .unwrap();
        let cpu = cpu_info();
        let mut jmp = Instruction::new("jmp", 3, 5);
        jmp.set_semantics(vec![Expression::assign(
            Expression::identifier(2, &cpu),
            Expression::constant(32, 0x100a),
        )]);
        doc.set_cell(&Address::flat(0x1000), Cell::instruction(jmp), false)
            .unwrap();

        let mut interp = Interpreter::new(CpuContext::new(cpu), MemoryContext::new());
        interp.cpu_mut().write_register_u64(2, 0x1000).unwrap();
        let next = interp.step(&doc).unwrap().unwrap();
        assert_eq!(next, Address::flat(0x100a));
    }

    #[test]
    fn conditional_semantics_execute_one_arm() {
        let cpu = cpu_info();
        let mut interp = Interpreter::new(CpuContext::new(cpu.clone()), MemoryContext::new());
        interp.cpu_mut().write_register_u64(0, 3).unwrap();

        // if (r0 == 3) r1 = 1 else r1 = 2
        let semantics = vec![Expression::if_else(
            Condition::new(
                CondKind::Eq,
                Expression::identifier(0, &cpu),
                Expression::constant(32, 3),
            ),
            Expression::assign(Expression::identifier(1, &cpu), Expression::constant(32, 1)),
            Some(Expression::assign(
                Expression::identifier(1, &cpu),
                Expression::constant(32, 2),
            )),
        )];
        assert!(!interp.execute(&semantics).unwrap());
        assert_eq!(interp.cpu().read_register_u64(1).unwrap(), 1);
    }
}
