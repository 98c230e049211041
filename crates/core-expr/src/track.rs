//! Definition tracking over expression trees.
//!
//! [`TrackVisitor`] rewrites plain identifiers into tracked identifiers:
//! destinations of assignments are definitions and get stamped with the
//! current address, sources are uses and get stamped with their last known
//! definition site. [`BackTrackVisitor`] walks already-tracked semantics
//! backwards, reporting whether an expression still feeds one of the watched
//! `(register, definition address)` pairs and shifting the watch set one step
//! up the def-use chain on every hit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use core_address::Address;
use core_cpu::{CpuInformation, RegisterId};

use crate::visitor::{ExpressionVisitor, VisitResult};
use crate::Expression;

/// Last known definition address per register.
#[derive(Debug, Default, Clone)]
pub struct TrackContext {
    tracked: HashMap<RegisterId, Address>,
}

impl TrackContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_id(&mut self, id: RegisterId, at: Address) {
        self.tracked.insert(id, at);
    }

    pub fn tracked_address(&self, id: RegisterId) -> Option<Address> {
        self.tracked.get(&id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}

/// Watched `(register, definition address)` pairs for backtracking.
#[derive(Debug, Default, Clone)]
pub struct BackTrackContext {
    ids: HashSet<(RegisterId, Address)>,
}

impl BackTrackContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_id(&mut self, id: RegisterId, at: Address) {
        self.ids.insert((id, at));
    }

    pub fn untrack_id(&mut self, id: RegisterId, at: Address) {
        self.ids.remove(&(id, at));
    }

    pub fn is_tracked(&self, id: RegisterId, at: Address) -> bool {
        self.ids.contains(&(id, at))
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Rewrites `Id` nodes into `TrackedId` nodes and records definitions.
pub struct TrackVisitor<'a> {
    current: Address,
    context: &'a mut TrackContext,
    assigning: bool,
}

impl<'a> TrackVisitor<'a> {
    pub fn new(current: Address, context: &'a mut TrackContext) -> Self {
        Self {
            current,
            context,
            assigning: false,
        }
    }
}

impl ExpressionVisitor for TrackVisitor<'_> {
    fn visit_assignment(&mut self, dst: &Expression, src: &Expression) -> VisitResult {
        // Uses first: the source refers to definitions made *before* this
        // assignment takes effect.
        self.assigning = false;
        let src = self.dispatch(src)?;
        self.assigning = true;
        let dst = self.dispatch(dst)?;
        self.assigning = false;
        Ok(Expression::assign(dst, src))
    }

    fn visit_identifier(&mut self, id: RegisterId, cpu: &Arc<CpuInformation>) -> VisitResult {
        let at = if self.assigning {
            self.context.track_id(id, self.current);
            self.current
        } else {
            self.context
                .tracked_address(id)
                .unwrap_or(self.current)
        };
        Ok(Expression::tracked_identifier(id, cpu, at))
    }

    fn visit_tracked_identifier(
        &mut self,
        id: RegisterId,
        cpu: &Arc<CpuInformation>,
        defined_at: &Address,
    ) -> VisitResult {
        if self.assigning {
            self.context.track_id(id, self.current);
        }
        Ok(Expression::tracked_identifier(id, cpu, *defined_at))
    }
}

/// Reports whether an expression defines one of the watched tracked
/// identifiers, then retargets the watch set at the sources of that
/// definition.
pub struct BackTrackVisitor<'a> {
    context: &'a mut BackTrackContext,
    assigning: bool,
    follow_source: bool,
    result: bool,
}

impl<'a> BackTrackVisitor<'a> {
    pub fn new(context: &'a mut BackTrackContext) -> Self {
        Self {
            context,
            assigning: false,
            follow_source: false,
            result: false,
        }
    }

    /// True when any visited assignment defined a watched identifier.
    pub fn result(&self) -> bool {
        self.result
    }
}

impl ExpressionVisitor for BackTrackVisitor<'_> {
    fn visit_assignment(&mut self, dst: &Expression, src: &Expression) -> VisitResult {
        self.assigning = true;
        self.follow_source = false;
        let dst = self.dispatch(dst)?;
        self.assigning = false;
        let src = self.dispatch(src)?;
        self.follow_source = false;
        Ok(Expression::assign(dst, src))
    }

    fn visit_tracked_identifier(
        &mut self,
        id: RegisterId,
        cpu: &Arc<CpuInformation>,
        defined_at: &Address,
    ) -> VisitResult {
        if self.assigning {
            if self.context.is_tracked(id, *defined_at) {
                self.result = true;
                self.follow_source = true;
                // This definition is explained; chase its inputs instead.
                self.context.untrack_id(id, *defined_at);
            }
        } else if self.follow_source {
            self.context.track_id(id, *defined_at);
        }
        Ok(Expression::tracked_identifier(id, cpu, *defined_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpKind;
    use core_cpu::CpuInformation;

    fn cpu() -> Arc<CpuInformation> {
        CpuInformation::builder("test")
            .register("r0", 32)
            .register("r1", 32)
            .register("r2", 32)
            .build()
    }

    fn tracked(expr: &Expression) -> Vec<(RegisterId, Address)> {
        let mut out = Vec::new();
        let mut stack = vec![expr];
        while let Some(e) = stack.pop() {
            if let Expression::TrackedId { id, defined_at, .. } = e {
                out.push((*id, *defined_at));
            }
            stack.extend(e.children());
        }
        out.sort();
        out
    }

    #[test]
    fn track_stamps_uses_with_last_definition() {
        let cpu = cpu();
        let mut ctx = TrackContext::new();

        // 0x1000: r0 = r1
        let a0 = Address::flat(0x1000);
        let s0 = Expression::assign(
            Expression::identifier(0, &cpu),
            Expression::identifier(1, &cpu),
        );
        let t0 = TrackVisitor::new(a0, &mut ctx).visit(&s0).unwrap();
        // r1 had no prior definition, it is stamped in place; r0 is defined here.
        assert_eq!(tracked(&t0), vec![(0, a0), (1, a0)]);
        assert_eq!(ctx.tracked_address(0), Some(a0));

        // 0x1004: r2 = r0 + 1 — the use of r0 points back to 0x1000.
        let a1 = Address::flat(0x1004);
        let s1 = Expression::assign(
            Expression::identifier(2, &cpu),
            Expression::operation(
                OpKind::Add,
                Expression::identifier(0, &cpu),
                Expression::constant(32, 1),
            ),
        );
        let t1 = TrackVisitor::new(a1, &mut ctx).visit(&s1).unwrap();
        assert_eq!(tracked(&t1), vec![(0, a0), (2, a1)]);
        assert_eq!(ctx.tracked_address(2), Some(a1));
    }

    #[test]
    fn backtrack_follows_def_use_one_step() {
        let cpu = cpu();
        let a0 = Address::flat(0x1000);
        let a1 = Address::flat(0x1004);

        // 0x1004: r2@a1 = r0@a0 + 1, watching (r2, a1).
        let expr = Expression::assign(
            Expression::tracked_identifier(2, &cpu, a1),
            Expression::operation(
                OpKind::Add,
                Expression::tracked_identifier(0, &cpu, a0),
                Expression::constant(32, 1),
            ),
        );

        let mut ctx = BackTrackContext::new();
        ctx.track_id(2, a1);
        let mut visitor = BackTrackVisitor::new(&mut ctx);
        visitor.visit(&expr).unwrap();
        assert!(visitor.result());
        // The watch moved upstream to the source of the definition.
        assert!(!ctx.is_tracked(2, a1));
        assert!(ctx.is_tracked(0, a0));
    }

    #[test]
    fn backtrack_misses_unrelated_definitions() {
        let cpu = cpu();
        let a0 = Address::flat(0x1000);
        let expr = Expression::assign(
            Expression::tracked_identifier(1, &cpu, a0),
            Expression::constant(32, 5),
        );
        let mut ctx = BackTrackContext::new();
        ctx.track_id(2, Address::flat(0x2000));
        let mut visitor = BackTrackVisitor::new(&mut ctx);
        visitor.visit(&expr).unwrap();
        assert!(!visitor.result());
        assert!(ctx.is_tracked(2, Address::flat(0x2000)));
    }
}
