//! Minimal OS personality for images without a runtime environment.

use std::sync::Arc;

use core_address::Address;
use core_cpu::{CpuContext, CpuInformation, RegisterId, RegisterRole};
use core_document::Document;
use core_emul::MemoryContext;
use core_expr::{Expression, SymbolicKind};
use tracing::debug;

use crate::{OperatingSystem, Result};

const STACK_BASE: u64 = 0x7fff_0000;
const STACK_SIZE: u64 = 0x1_0000;

/// Bare-metal personality: a stack and an ABI model, nothing else. External
/// calls produce a symbolic return value and clobber the declared volatile
/// registers.
pub struct BareMetalOs {
    cpu: Arc<CpuInformation>,
    return_register: RegisterId,
    volatile: Vec<RegisterId>,
}

impl BareMetalOs {
    pub fn new(cpu: Arc<CpuInformation>, return_register: RegisterId, volatile: Vec<RegisterId>) -> Self {
        Self {
            cpu,
            return_register,
            volatile,
        }
    }
}

impl OperatingSystem for BareMetalOs {
    fn name(&self) -> &str {
        "bare-metal"
    }

    fn initialize_context(
        &self,
        _document: &Document,
        cpu: &mut CpuContext,
        mem: &mut MemoryContext,
    ) -> Result<()> {
        mem.allocate(Address::flat(STACK_BASE), STACK_SIZE, None)
            .map_err(|_| crate::Error::Unsupported("stack allocation failed".into()))?;
        if let Some(sp) = self.cpu.register_by_role(RegisterRole::StackPointer) {
            // Leave one redzone slot below the stack top.
            let top = STACK_BASE + STACK_SIZE - 16;
            cpu.write_register_u64(sp, top)?;
        }
        debug!(target: "os", stack_base = STACK_BASE, stack_size = STACK_SIZE, "context initialized");
        Ok(())
    }

    fn execute_symbol(&self, document: &Document, addr: &Address) -> Vec<Expression> {
        let label = document
            .label_at(addr)
            .map(|l| l.name().to_owned())
            .unwrap_or_else(|| addr.to_string());
        let mut effects = vec![Expression::assign(
            Expression::identifier(self.return_register, &self.cpu),
            Expression::symbolic(SymbolicKind::ReturnedValue, label.clone()),
        )];
        for reg in &self.volatile {
            if *reg == self.return_register {
                continue;
            }
            effects.push(Expression::assign(
                Expression::identifier(*reg, &self.cpu),
                Expression::symbolic(SymbolicKind::Undefined, format!("clobbered:{label}")),
            ));
        }
        effects
    }
}
