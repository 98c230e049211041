//! Expression evaluation against CPU and memory contexts.
//!
//! The evaluator is an [`ExpressionVisitor`] that reduces a tree to either a
//! constant or a residual expression. Unknown registers, unavailable memory
//! and undefined operations do not abort evaluation: they produce symbolic
//! nodes, and a symbolic operand poisons every operation consuming it.

use std::sync::Arc;

use core_address::Address;
use core_cpu::{CpuContext, CpuInformation, RegisterId, RegisterRole};
use core_document::{Document, Instruction};
use core_expr::visitor::{ExpressionVisitor, VisitError, VisitResult};
use core_expr::{
    mask_to_width, sign_extend_value, CondKind, Condition, Expression, OpKind, SymbolicKind,
};
use tracing::{trace, warn};

use crate::MemoryContext;

/// Iteration ceiling for `While` semantics.
pub const DEFAULT_LOOP_CAP: u64 = 1 << 20;

/// Result of one evaluation: the reduced expression and whether anything
/// symbolic leaked into it.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub expr: Expression,
    pub symbolic: bool,
}

pub struct Evaluator<'a> {
    cpu: &'a mut CpuContext,
    mem: &'a mut MemoryContext,
    loop_cap: u64,
    max_depth: usize,
    symbolic: bool,
}

impl<'a> Evaluator<'a> {
    pub fn new(cpu: &'a mut CpuContext, mem: &'a mut MemoryContext) -> Self {
        Self {
            cpu,
            mem,
            loop_cap: DEFAULT_LOOP_CAP,
            max_depth: core_expr::visitor::DEFAULT_MAX_VISIT_DEPTH,
            symbolic: false,
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

    /// Reduces `expr`. Assignments and control flow mutate the borrowed
    /// contexts; the outcome reports whether the result is symbolic.
    pub fn evaluate(&mut self, expr: &Expression) -> Result<EvalOutcome, crate::Error> {
        self.symbolic = false;
        let expr = self.visit(expr)?;
        Ok(EvalOutcome {
            expr,
            symbolic: self.symbolic,
        })
    }

    fn symbolic_unknown(&mut self, label: impl Into<String>) -> Expression {
        self.symbolic = true;
        Expression::symbolic(SymbolicKind::Unknown, label)
    }

    fn symbolic_undefined(&mut self, label: impl Into<String>) -> Expression {
        self.symbolic = true;
        Expression::symbolic(SymbolicKind::Undefined, label)
    }

    fn register_name(cpu: &Arc<CpuInformation>, id: RegisterId) -> String {
        cpu.register_name(id).unwrap_or("<bad-reg>").to_owned()
    }

    /// Concrete register value, when the register is narrow enough and set.
    fn register_value(&self, id: RegisterId) -> Option<(u16, u64)> {
        let bits = self.cpu.information().register_bits(id);
        if bits == 0 || bits > 64 || !self.cpu.is_register_set(id) {
            return None;
        }
        let value = self.cpu.read_register_u64(id).ok()?;
        Some((bits, value))
    }

    /// Evaluates a condition down to a boolean, `None` when either side is
    /// not concrete.
    fn eval_condition(&mut self, condition: &Condition) -> Result<Option<bool>, VisitError> {
        let reference = self.dispatch(&condition.reference)?;
        let test = self.dispatch(&condition.test)?;
        let (Expression::Const { bits: rb, value: rv, .. }, Expression::Const { bits: tb, value: tv, .. }) =
            (&reference, &test)
        else {
            self.symbolic = true;
            return Ok(None);
        };
        let bits = (*rb).max(*tb);
        let (ru, tu) = (mask_to_width(*rv, bits), mask_to_width(*tv, bits));
        let (rs, ts) = (
            sign_extend_value(*rv, *rb) as i64,
            sign_extend_value(*tv, *tb) as i64,
        );
        Ok(Some(match condition.kind {
            CondKind::Eq => ru == tu,
            CondKind::Ne => ru != tu,
            CondKind::Ugt => ru > tu,
            CondKind::Uge => ru >= tu,
            CondKind::Ult => ru < tu,
            CondKind::Ule => ru <= tu,
            CondKind::Sgt => rs > ts,
            CondKind::Sge => rs >= ts,
            CondKind::Slt => rs < ts,
            CondKind::Sle => rs <= ts,
        }))
    }

    /// Translates an evaluated `(base, offset)` pair into a linear address.
    fn concrete_address(&mut self, base: &Expression, offset: &Expression) -> Option<Address> {
        let Expression::Const { value: offset, .. } = offset else {
            return None;
        };
        let base = match base {
            Expression::Const { value, .. } => *value as u16,
            _ => return None,
        };
        let logical = if base == 0 {
            Address::flat(*offset)
        } else {
            Address::segmented(base, *offset, 64)
        };
        self.cpu.translate(&logical).ok()
    }

    /// Stores an evaluated value into an l-value, poisoning the destination
    /// when the value is symbolic.
    fn write_destination(&mut self, dst: &Expression, value: &Expression) -> VisitResult {
        match dst {
            Expression::Id { id, cpu } | Expression::TrackedId { id, cpu, .. } => match value {
                Expression::Const { value, .. } => {
                    let nbytes = cpu.register_bytes(*id).min(8);
                    if self
                        .cpu
                        .write_register(*id, &value.to_le_bytes()[..nbytes], false)
                        .is_err()
                    {
                        return Ok(self.symbolic_unknown(Self::register_name(cpu, *id)));
                    }
                    Ok(Expression::constant(cpu.register_bits(*id).min(64), *value))
                }
                _ => {
                    self.cpu.clear_register(*id);
                    self.symbolic = true;
                    Ok(value.clone())
                }
            },
            Expression::VecId { ids, cpu } => match value {
                Expression::Const { value, .. } => {
                    // Most significant register first.
                    let total: u16 = ids.iter().map(|id| cpu.register_bits(*id)).sum();
                    if total > 64 {
                        return Err(VisitError::WidthMismatch { got: total, max: 64 });
                    }
                    let mut shift = total;
                    for id in ids {
                        let bits = cpu.register_bits(*id);
                        shift -= bits;
                        let part = mask_to_width(value >> shift, bits);
                        let nbytes = cpu.register_bytes(*id).min(8);
                        if self
                            .cpu
                            .write_register(*id, &part.to_le_bytes()[..nbytes], false)
                            .is_err()
                        {
                            return Ok(self.symbolic_unknown(Self::register_name(cpu, *id)));
                        }
                    }
                    Ok(Expression::constant(total, *value))
                }
                _ => {
                    for id in ids {
                        self.cpu.clear_register(*id);
                    }
                    self.symbolic = true;
                    Ok(value.clone())
                }
            },
            Expression::Mem {
                bits,
                base,
                offset,
                dereference: true,
            } => {
                let base = self.dispatch(base)?;
                let offset = self.dispatch(offset)?;
                let Some(addr) = self.concrete_address(&base, &offset) else {
                    return Ok(self.symbolic_unknown("store"));
                };
                match value {
                    Expression::Const { value, .. } => {
                        let nbytes = (*bits as usize).div_ceil(8).min(8);
                        if self.mem.write_u64(&addr, *value, nbytes).is_err() {
                            return Ok(self.symbolic_unknown(format!("[{addr}]")));
                        }
                        Ok(Expression::constant(*bits, *value))
                    }
                    _ => {
                        self.symbolic = true;
                        Ok(value.clone())
                    }
                }
            }
            _ => {
                warn!(target: "emul", dst = %dst, "assignment into a non l-value");
                Ok(self.symbolic_undefined("bad-lvalue"))
            }
        }
    }
}

impl ExpressionVisitor for Evaluator<'_> {
    fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn visit_constant(&mut self, bits: u16, value: u64, signed: bool) -> VisitResult {
        if bits > 64 {
            return Err(VisitError::WidthMismatch { got: bits, max: 64 });
        }
        Ok(Expression::Const {
            bits,
            value,
            signed,
        })
    }

    fn visit_identifier(&mut self, id: RegisterId, cpu: &Arc<CpuInformation>) -> VisitResult {
        match self.register_value(id) {
            Some((bits, value)) => Ok(Expression::constant(bits, value)),
            None => Ok(self.symbolic_unknown(Self::register_name(cpu, id))),
        }
    }

    fn visit_tracked_identifier(
        &mut self,
        id: RegisterId,
        cpu: &Arc<CpuInformation>,
        _defined_at: &Address,
    ) -> VisitResult {
        self.visit_identifier(id, cpu)
    }

    fn visit_vector_identifier(
        &mut self,
        ids: &[RegisterId],
        cpu: &Arc<CpuInformation>,
    ) -> VisitResult {
        let total: u16 = ids.iter().map(|id| cpu.register_bits(*id)).sum();
        if total > 64 {
            return Ok(self.symbolic_unknown("wide-vector"));
        }
        let mut value = 0u64;
        for id in ids {
            let Some((bits, part)) = self.register_value(*id) else {
                return Ok(self.symbolic_unknown(Self::register_name(cpu, *id)));
            };
            value = (value << bits) | part;
        }
        Ok(Expression::constant(total, value))
    }

    fn visit_memory(
        &mut self,
        bits: u16,
        base: &Expression,
        offset: &Expression,
        dereference: bool,
    ) -> VisitResult {
        let base = self.dispatch(base)?;
        let offset = self.dispatch(offset)?;
        // A symbolic component poisons the whole reference.
        for part in [&base, &offset] {
            if matches!(part, Expression::Sym { .. }) {
                self.symbolic = true;
                return Ok(part.clone());
            }
        }
        match self.concrete_address(&base, &offset) {
            Some(addr) if dereference => {
                if bits > 64 {
                    return Ok(self.symbolic_unknown(format!("[{addr}]")));
                }
                let nbytes = (bits as usize).div_ceil(8);
                match self.mem.read_u64(&addr, nbytes) {
                    Ok(value) => {
                        trace!(target: "emul", %addr, value, "load");
                        Ok(Expression::constant(bits, value))
                    }
                    Err(_) => Ok(self.symbolic_unknown(format!("[{addr}]"))),
                }
            }
            Some(addr) => {
                // Address-of: reduces to the constant location.
                Ok(Expression::constant(
                    offset.size_in_bits().max(16),
                    addr.offset(),
                ))
            }
            None => {
                self.symbolic = true;
                Ok(Expression::memory(bits, base, offset, dereference))
            }
        }
    }

    fn visit_operation(&mut self, op: OpKind, lhs: &Expression, rhs: &Expression) -> VisitResult {
        if op == OpKind::Xchg {
            return exchange(self, lhs, rhs);
        }
        let lhs = self.dispatch(lhs)?;
        let rhs = self.dispatch(rhs)?;
        for part in [&lhs, &rhs] {
            if matches!(part, Expression::Sym { .. }) {
                self.symbolic = true;
                return Ok(part.clone());
            }
        }
        let (
            Expression::Const { bits: lb, value: lv, .. },
            Expression::Const { bits: rb, value: rv, .. },
        ) = (&lhs, &rhs)
        else {
            self.symbolic = true;
            return Ok(Expression::operation(op, lhs, rhs));
        };
        let (lb, lv, rb, rv) = (*lb, *lv, *rb, *rv);
        let bits = lb.max(rb);
        if bits > 64 {
            return Err(VisitError::WidthMismatch { got: bits, max: 64 });
        }
        let (ls, rs) = (sign_extend_value(lv, lb), sign_extend_value(rv, rb));
        let shift = (rv as u32) % bits.max(1) as u32;
        let value = match op {
            OpKind::And => lv & rv,
            OpKind::Or => lv | rv,
            OpKind::Xor => lv ^ rv,
            OpKind::Lls => mask_to_width(lv, bits) << shift,
            OpKind::Lrs => mask_to_width(lv, bits) >> shift,
            OpKind::Ars => (ls as i64 >> shift) as u64,
            OpKind::Add => lv.wrapping_add(rv),
            OpKind::Sub => lv.wrapping_sub(rv),
            OpKind::Mul => lv.wrapping_mul(rv),
            OpKind::UDiv => {
                if rv == 0 {
                    warn!(target: "emul", "unsigned division by zero");
                    return Ok(self.symbolic_undefined("div0"));
                }
                mask_to_width(lv, bits) / mask_to_width(rv, bits)
            }
            OpKind::SDiv => {
                if rv == 0 {
                    warn!(target: "emul", "signed division by zero");
                    return Ok(self.symbolic_undefined("div0"));
                }
                ((ls as i64).wrapping_div(rs as i64)) as u64
            }
            OpKind::SExt => {
                let target = rv as u16;
                if target == 0 || target > 64 {
                    return Err(VisitError::WidthMismatch { got: target, max: 64 });
                }
                return Ok(Expression::constant(target, sign_extend_value(lv, lb)));
            }
            OpKind::Xchg => unreachable!("handled above"),
        };
        Ok(Expression::constant(bits, value))
    }

    fn visit_cond(&mut self, condition: &Condition) -> VisitResult {
        match self.eval_condition(condition)? {
            Some(truth) => Ok(Expression::boolean(truth)),
            None => Ok(self.symbolic_unknown("cond")),
        }
    }

    fn visit_ternary(
        &mut self,
        condition: &Condition,
        true_expr: &Expression,
        false_expr: &Expression,
    ) -> VisitResult {
        match self.eval_condition(condition)? {
            Some(true) => self.dispatch(true_expr),
            Some(false) => self.dispatch(false_expr),
            None => Ok(self.symbolic_unknown("ternary")),
        }
    }

    fn visit_if_else(
        &mut self,
        condition: &Condition,
        then_expr: &Expression,
        else_expr: Option<&Expression>,
    ) -> VisitResult {
        match self.eval_condition(condition)? {
            Some(true) => self.dispatch(then_expr),
            Some(false) => match else_expr {
                Some(else_expr) => self.dispatch(else_expr),
                None => Ok(Expression::bind(Vec::new())),
            },
            None => Ok(self.symbolic_unknown("if")),
        }
    }

    fn visit_while(&mut self, condition: &Condition, body: &Expression) -> VisitResult {
        let mut iterations = 0u64;
        loop {
            match self.eval_condition(condition)? {
                Some(true) => {
                    self.dispatch(body)?;
                    iterations += 1;
                    if iterations >= self.loop_cap {
                        warn!(target: "emul", cap = self.loop_cap, "loop iteration cap hit");
                        return Ok(self.symbolic_undefined("loop"));
                    }
                }
                Some(false) => return Ok(Expression::bind(Vec::new())),
                None => return Ok(self.symbolic_unknown("while")),
            }
        }
    }

    fn visit_assignment(&mut self, dst: &Expression, src: &Expression) -> VisitResult {
        let value = self.dispatch(src)?;
        self.write_destination(dst, &value)
    }

    fn visit_bind(&mut self, expressions: &[Expression]) -> VisitResult {
        let mut last = None;
        for expr in expressions {
            last = Some(self.dispatch(expr)?);
        }
        Ok(last.unwrap_or_else(|| Expression::bind(Vec::new())))
    }

    fn visit_symbolic(&mut self, kind: SymbolicKind, label: &str) -> VisitResult {
        self.symbolic = true;
        Ok(Expression::symbolic(kind, label))
    }

    fn visit_system(&mut self, name: &str) -> VisitResult {
        Ok(Expression::system(name))
    }
}

/// Swaps two register operands in place; anything else is undefined.
fn exchange(eval: &mut Evaluator<'_>, lhs: &Expression, rhs: &Expression) -> VisitResult {
    if let (Expression::Id { id: a, .. }, Expression::Id { id: b, .. }) = (lhs, rhs) {
        if let (Some((bits, av)), Some((_, bv))) =
            (eval.register_value(*a), eval.register_value(*b))
        {
            let abytes = eval.cpu.information().register_bytes(*a).min(8);
            let bbytes = eval.cpu.information().register_bytes(*b).min(8);
            if eval
                .cpu
                .write_register(*a, &bv.to_le_bytes()[..abytes], false)
                .is_ok()
                && eval
                    .cpu
                    .write_register(*b, &av.to_le_bytes()[..bbytes], false)
                    .is_ok()
            {
                return Ok(Expression::constant(bits, bv));
            }
        }
    }
    Ok(eval.symbolic_undefined("xchg"))
}

/// Resolves an instruction operand to a destination address.
///
/// The program pointer is seeded from `src_addr`, the document's image backs
/// the memory context, and the operand is evaluated: a memory reference with
/// constant base and offset names the destination; a bare constant sets the
/// destination offset only.
pub fn operand_reference(
    document: &Arc<Document>,
    insn: &Instruction,
    operand: usize,
    src_addr: &Address,
    cpu_info: &Arc<CpuInformation>,
) -> Option<Address> {
    let expr = insn.operand(operand)?;
    let mut cpu = CpuContext::new(Arc::clone(cpu_info));
    if let Some(pc) = cpu_info.register_by_role(RegisterRole::ProgramPointer) {
        cpu.write_register_u64(pc, src_addr.offset()).ok()?;
    }
    let mut mem = MemoryContext::new();
    mem.map_document(Arc::clone(document));

    let outcome = Evaluator::new(&mut cpu, &mut mem).evaluate(expr).ok()?;
    if outcome.symbolic {
        return None;
    }
    let mut destination = *src_addr;
    match outcome.expr {
        Expression::Mem { base, offset, .. } => {
            let Expression::Const { value: offset, .. } = *offset else {
                return None;
            };
            if let Expression::Const { value: base, .. } = *base {
                destination.set_base(base as u16);
            }
            destination.set_offset(offset);
            Some(destination)
        }
        Expression::Const { value, .. } => {
            destination.set_offset(value);
            Some(destination)
        }
        _ => None,
    }
}
