//! Visitor protocol over expression trees.
//!
//! Every expression kind has one hook; the default hooks rebuild the node
//! from recursively visited children, so the do-nothing visitor is a deep
//! clone. Specializations override only the hooks they care about (see
//! [`FilterVisitor`] here and the evaluator / trackers elsewhere).
//!
//! Entry is through [`ExpressionVisitor::visit`], which measures the tree
//! with an explicit work stack and refuses anything deeper than
//! [`ExpressionVisitor::max_depth`]. That keeps the recursive hooks simple
//! while making stack exhaustion on degenerate synthesized semantics
//! impossible.

use std::sync::Arc;

use core_address::Address;
use core_cpu::{CpuInformation, RegisterId};
use thiserror::Error;

use crate::{CondKind, Condition, Expression, OpKind, SymbolicKind};

/// Depth ceiling applied by visitors unless overridden.
pub const DEFAULT_MAX_VISIT_DEPTH: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VisitError {
    #[error("expression depth {depth} exceeds the visitor limit {limit}")]
    DepthExceeded { depth: usize, limit: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("operand width {got} unsupported, at most {max} bits")]
    WidthMismatch { got: u16, max: u16 },
}

pub type VisitResult = Result<Expression, VisitError>;

/// Default traversal: dispatch `expr` to the matching hook of `visitor`.
///
/// Free-standing so hooks that override dispatching behavior can still fall
/// back to the stock walk.
pub fn walk<V: ExpressionVisitor + ?Sized>(visitor: &mut V, expr: &Expression) -> VisitResult {
    match expr {
        Expression::System { name } => visitor.visit_system(name),
        Expression::Bind { expressions } => visitor.visit_bind(expressions),
        Expression::Cond(condition) => visitor.visit_cond(condition),
        Expression::Ternary {
            condition,
            true_expr,
            false_expr,
        } => visitor.visit_ternary(condition, true_expr, false_expr),
        Expression::IfElse {
            condition,
            then_expr,
            else_expr,
        } => visitor.visit_if_else(condition, then_expr, else_expr.as_deref()),
        Expression::While { condition, body } => visitor.visit_while(condition, body),
        Expression::Assign { dst, src } => visitor.visit_assignment(dst, src),
        Expression::Op { op, lhs, rhs } => visitor.visit_operation(*op, lhs, rhs),
        Expression::Const {
            bits,
            value,
            signed,
        } => visitor.visit_constant(*bits, *value, *signed),
        Expression::Id { id, cpu } => visitor.visit_identifier(*id, cpu),
        Expression::VecId { ids, cpu } => visitor.visit_vector_identifier(ids, cpu),
        Expression::TrackedId {
            id,
            cpu,
            defined_at,
        } => visitor.visit_tracked_identifier(*id, cpu, defined_at),
        Expression::Mem {
            bits,
            base,
            offset,
            dereference,
        } => visitor.visit_memory(*bits, base, offset, *dereference),
        Expression::Sym { kind, label } => visitor.visit_symbolic(*kind, label),
    }
}

#[allow(unused_variables)]
pub trait ExpressionVisitor {
    fn max_depth(&self) -> usize {
        DEFAULT_MAX_VISIT_DEPTH
    }

    /// Guarded entry point.
    fn visit(&mut self, expr: &Expression) -> VisitResult {
        let depth = expr.depth();
        let limit = self.max_depth();
        if depth > limit {
            return Err(VisitError::DepthExceeded { depth, limit });
        }
        self.dispatch(expr)
    }

    /// Per-node dispatch used during traversal; no depth check.
    fn dispatch(&mut self, expr: &Expression) -> VisitResult {
        walk(self, expr)
    }

    /// Visits both operands of a condition, rebuilding it.
    fn visit_condition(&mut self, condition: &Condition) -> Result<Condition, VisitError> {
        Ok(Condition::new(
            condition.kind,
            self.dispatch(&condition.reference)?,
            self.dispatch(&condition.test)?,
        ))
    }

    fn visit_system(&mut self, name: &str) -> VisitResult {
        Ok(Expression::system(name))
    }

    fn visit_bind(&mut self, expressions: &[Expression]) -> VisitResult {
        let mut out = Vec::with_capacity(expressions.len());
        for expr in expressions {
            out.push(self.dispatch(expr)?);
        }
        Ok(Expression::bind(out))
    }

    fn visit_cond(&mut self, condition: &Condition) -> VisitResult {
        Ok(Expression::Cond(self.visit_condition(condition)?))
    }

    fn visit_ternary(
        &mut self,
        condition: &Condition,
        true_expr: &Expression,
        false_expr: &Expression,
    ) -> VisitResult {
        Ok(Expression::ternary(
            self.visit_condition(condition)?,
            self.dispatch(true_expr)?,
            self.dispatch(false_expr)?,
        ))
    }

    fn visit_if_else(
        &mut self,
        condition: &Condition,
        then_expr: &Expression,
        else_expr: Option<&Expression>,
    ) -> VisitResult {
        let else_expr = match else_expr {
            Some(e) => Some(self.dispatch(e)?),
            None => None,
        };
        Ok(Expression::if_else(
            self.visit_condition(condition)?,
            self.dispatch(then_expr)?,
            else_expr,
        ))
    }

    fn visit_while(&mut self, condition: &Condition, body: &Expression) -> VisitResult {
        Ok(Expression::while_loop(
            self.visit_condition(condition)?,
            self.dispatch(body)?,
        ))
    }

    fn visit_assignment(&mut self, dst: &Expression, src: &Expression) -> VisitResult {
        Ok(Expression::assign(self.dispatch(dst)?, self.dispatch(src)?))
    }

    fn visit_operation(&mut self, op: OpKind, lhs: &Expression, rhs: &Expression) -> VisitResult {
        Ok(Expression::operation(
            op,
            self.dispatch(lhs)?,
            self.dispatch(rhs)?,
        ))
    }

    fn visit_constant(&mut self, bits: u16, value: u64, signed: bool) -> VisitResult {
        Ok(Expression::Const {
            bits,
            value,
            signed,
        })
    }

    fn visit_identifier(&mut self, id: RegisterId, cpu: &Arc<CpuInformation>) -> VisitResult {
        Ok(Expression::identifier(id, cpu))
    }

    fn visit_vector_identifier(
        &mut self,
        ids: &[RegisterId],
        cpu: &Arc<CpuInformation>,
    ) -> VisitResult {
        Ok(Expression::vector_identifier(ids.to_vec(), cpu))
    }

    fn visit_tracked_identifier(
        &mut self,
        id: RegisterId,
        cpu: &Arc<CpuInformation>,
        defined_at: &Address,
    ) -> VisitResult {
        Ok(Expression::tracked_identifier(id, cpu, *defined_at))
    }

    fn visit_memory(
        &mut self,
        bits: u16,
        base: &Expression,
        offset: &Expression,
        dereference: bool,
    ) -> VisitResult {
        Ok(Expression::memory(
            bits,
            self.dispatch(base)?,
            self.dispatch(offset)?,
            dereference,
        ))
    }

    fn visit_symbolic(&mut self, kind: SymbolicKind, label: &str) -> VisitResult {
        Ok(Expression::symbolic(kind, label))
    }
}

/// Deep clone through the visitor protocol. `Expression` also derives `Clone`;
/// this exists so analyses layered on the default hooks clone by construction.
#[derive(Debug, Default)]
pub struct CloneVisitor;

impl ExpressionVisitor for CloneVisitor {}

/// Collects every sub-expression matched by a predicate, in visit order,
/// stopping after `max_results` matches (0 means unlimited).
pub struct FilterVisitor<F> {
    matcher: F,
    max_results: usize,
    matched: Vec<Expression>,
}

impl<F: FnMut(&Expression) -> bool> FilterVisitor<F> {
    pub fn new(matcher: F, max_results: usize) -> Self {
        Self {
            matcher,
            max_results,
            matched: Vec::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.max_results != 0 && self.matched.len() >= self.max_results
    }

    pub fn into_matched(self) -> Vec<Expression> {
        self.matched
    }
}

impl<F: FnMut(&Expression) -> bool> ExpressionVisitor for FilterVisitor<F> {
    fn dispatch(&mut self, expr: &Expression) -> VisitResult {
        if self.is_done() {
            return Ok(expr.clone());
        }
        if (self.matcher)(expr) {
            self.matched.push(expr.clone());
            if self.is_done() {
                return Ok(expr.clone());
            }
        }
        walk(self, expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Expression {
        Expression::bind(vec![
            Expression::assign(
                Expression::memory(
                    32,
                    Expression::constant(16, 0),
                    Expression::constant(32, 0x1000),
                    true,
                ),
                Expression::operation(
                    OpKind::Add,
                    Expression::constant(32, 1),
                    Expression::constant(32, 2),
                ),
            ),
            Expression::ternary(
                Condition::new(
                    CondKind::Eq,
                    Expression::constant(32, 0),
                    Expression::constant(32, 0),
                ),
                Expression::constant(32, 7),
                Expression::constant(32, 9),
            ),
        ])
    }

    #[test]
    fn clone_visitor_is_identity() {
        let expr = sample();
        let cloned = CloneVisitor.visit(&expr).unwrap();
        assert_eq!(cloned, expr);
        // Clone of clone is still the same tree.
        assert_eq!(CloneVisitor.visit(&cloned).unwrap(), expr);
    }

    #[test]
    fn filter_collects_in_visit_order() {
        let expr = sample();
        let mut filter =
            FilterVisitor::new(|e| matches!(e, Expression::Const { value: 0, .. }), 0);
        filter.visit(&expr).unwrap();
        // base of the memory destination, then both condition operands.
        assert_eq!(filter.into_matched().len(), 3);
    }

    #[test]
    fn filter_respects_max_results() {
        let expr = sample();
        let mut filter = FilterVisitor::new(|e| matches!(e, Expression::Const { .. }), 2);
        filter.visit(&expr).unwrap();
        assert_eq!(filter.into_matched().len(), 2);
    }

    #[test]
    fn visit_refuses_degenerate_depth() {
        let mut expr = Expression::constant(8, 0);
        for _ in 0..DEFAULT_MAX_VISIT_DEPTH + 8 {
            expr = Expression::operation(OpKind::Add, expr, Expression::constant(8, 1));
        }
        assert!(matches!(
            CloneVisitor.visit(&expr),
            Err(VisitError::DepthExceeded { .. })
        ));
    }
}
