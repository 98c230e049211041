//! Semantic expression trees.
//!
//! Machine instructions are lifted into trees of [`Expression`] nodes:
//! constants, register identifiers, memory references, operations,
//! assignments, conditions, sequential binds and symbolic placeholders. The
//! tree is a plain tagged enum; behavior that varies per analysis lives in
//! visitors ([`visitor`]) rather than in the nodes themselves. Identifier
//! nodes carry the [`CpuInformation`] of their architecture so widths and
//! names resolve without a side table.

use std::fmt;
use std::sync::Arc;

use core_address::Address;
use core_cpu::{CpuInformation, RegisterId};

pub mod track;
pub mod visitor;

pub use track::{BackTrackContext, BackTrackVisitor, TrackContext, TrackVisitor};
pub use visitor::{walk, CloneVisitor, ExpressionVisitor, FilterVisitor, VisitError, VisitResult};

/// Arithmetic and logical operations. Binary form only; unary operations
/// encode a zero right-hand side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Exchanges both operands, which must be l-values.
    Xchg,
    And,
    Or,
    Xor,
    /// Logical left shift.
    Lls,
    /// Logical right shift.
    Lrs,
    /// Arithmetic right shift.
    Ars,
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    /// Sign extension of the left operand to the width named by the right.
    SExt,
}

impl OpKind {
    pub fn is_signed(&self) -> bool {
        matches!(self, OpKind::Ars | OpKind::SDiv | OpKind::SExt)
    }
}

/// Comparison predicates used by conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondKind {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

/// Flavors of values the evaluator could not reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolicKind {
    Unknown,
    ReturnedValue,
    FromParameter,
    Undefined,
}

/// A comparison between two sub-expressions. Embedded both in the standalone
/// [`Expression::Cond`] predicate and in the control-flow variants.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub kind: CondKind,
    pub reference: Box<Expression>,
    pub test: Box<Expression>,
}

impl Condition {
    pub fn new(kind: CondKind, reference: Expression, test: Expression) -> Self {
        Self {
            kind,
            reference: Box::new(reference),
            test: Box::new(test),
        }
    }
}

/// One node of a semantic tree.
#[derive(Debug, Clone)]
pub enum Expression {
    /// Host-visible side effect marker (system calls, interrupt gates).
    System { name: String },
    /// Sequential composition, evaluated left to right.
    Bind { expressions: Vec<Expression> },
    /// Standalone predicate reducing to a 1-bit constant.
    Cond(Condition),
    Ternary {
        condition: Condition,
        true_expr: Box<Expression>,
        false_expr: Box<Expression>,
    },
    IfElse {
        condition: Condition,
        then_expr: Box<Expression>,
        else_expr: Option<Box<Expression>>,
    },
    While {
        condition: Condition,
        body: Box<Expression>,
    },
    Assign {
        dst: Box<Expression>,
        src: Box<Expression>,
    },
    Op {
        op: OpKind,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Const {
        bits: u16,
        value: u64,
        signed: bool,
    },
    Id {
        id: RegisterId,
        cpu: Arc<CpuInformation>,
    },
    /// Concatenation of registers, most significant first.
    VecId {
        ids: Vec<RegisterId>,
        cpu: Arc<CpuInformation>,
    },
    /// An identifier stamped with the address of its last definition.
    TrackedId {
        id: RegisterId,
        cpu: Arc<CpuInformation>,
        defined_at: Address,
    },
    /// Memory reference. With `dereference` unset the node denotes the
    /// address itself rather than a load from it.
    Mem {
        bits: u16,
        base: Box<Expression>,
        offset: Box<Expression>,
        dereference: bool,
    },
    Sym {
        kind: SymbolicKind,
        label: String,
    },
}

impl Expression {
    // Constructors, shaped like the original helper namespace so lifters read
    // as a vocabulary rather than struct literals.

    pub fn constant(bits: u16, value: u64) -> Self {
        Expression::Const {
            bits,
            value: mask_to_width(value, bits),
            signed: false,
        }
    }

    pub fn signed_constant(bits: u16, value: u64) -> Self {
        Expression::Const {
            bits,
            value: mask_to_width(value, bits),
            signed: true,
        }
    }

    pub fn boolean(value: bool) -> Self {
        Expression::constant(1, value as u64)
    }

    pub fn identifier(id: RegisterId, cpu: &Arc<CpuInformation>) -> Self {
        Expression::Id {
            id,
            cpu: Arc::clone(cpu),
        }
    }

    pub fn vector_identifier(ids: Vec<RegisterId>, cpu: &Arc<CpuInformation>) -> Self {
        Expression::VecId {
            ids,
            cpu: Arc::clone(cpu),
        }
    }

    pub fn tracked_identifier(
        id: RegisterId,
        cpu: &Arc<CpuInformation>,
        defined_at: Address,
    ) -> Self {
        Expression::TrackedId {
            id,
            cpu: Arc::clone(cpu),
            defined_at,
        }
    }

    pub fn memory(bits: u16, base: Expression, offset: Expression, dereference: bool) -> Self {
        Expression::Mem {
            bits,
            base: Box::new(base),
            offset: Box::new(offset),
            dereference,
        }
    }

    pub fn operation(op: OpKind, lhs: Expression, rhs: Expression) -> Self {
        Expression::Op {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn assign(dst: Expression, src: Expression) -> Self {
        Expression::Assign {
            dst: Box::new(dst),
            src: Box::new(src),
        }
    }

    pub fn bind(expressions: Vec<Expression>) -> Self {
        Expression::Bind { expressions }
    }

    pub fn cond(kind: CondKind, reference: Expression, test: Expression) -> Self {
        Expression::Cond(Condition::new(kind, reference, test))
    }

    pub fn ternary(condition: Condition, true_expr: Expression, false_expr: Expression) -> Self {
        Expression::Ternary {
            condition,
            true_expr: Box::new(true_expr),
            false_expr: Box::new(false_expr),
        }
    }

    pub fn if_else(
        condition: Condition,
        then_expr: Expression,
        else_expr: Option<Expression>,
    ) -> Self {
        Expression::IfElse {
            condition,
            then_expr: Box::new(then_expr),
            else_expr: else_expr.map(Box::new),
        }
    }

    pub fn while_loop(condition: Condition, body: Expression) -> Self {
        Expression::While {
            condition,
            body: Box::new(body),
        }
    }

    pub fn symbolic(kind: SymbolicKind, label: impl Into<String>) -> Self {
        Expression::Sym {
            kind,
            label: label.into(),
        }
    }

    pub fn system(name: impl Into<String>) -> Self {
        Expression::System { name: name.into() }
    }

    /// Numeric width of the value this node denotes, in bits. Zero for nodes
    /// without a value (assignments, control flow, symbolics).
    pub fn size_in_bits(&self) -> u16 {
        match self {
            Expression::Const { bits, .. } => *bits,
            Expression::Id { id, cpu } | Expression::TrackedId { id, cpu, .. } => {
                cpu.register_bits(*id)
            }
            Expression::VecId { ids, cpu } => ids.iter().map(|id| cpu.register_bits(*id)).sum(),
            Expression::Mem { bits, .. } => *bits,
            Expression::Op { lhs, rhs, .. } => lhs.size_in_bits().max(rhs.size_in_bits()),
            Expression::Cond(_) => 1,
            _ => 0,
        }
    }

    /// Whether the node may stand on the left of an assignment.
    pub fn is_lvalue(&self) -> bool {
        match self {
            Expression::Id { .. } | Expression::VecId { .. } | Expression::TrackedId { .. } => true,
            Expression::Mem { dereference, .. } => *dereference,
            _ => false,
        }
    }

    /// Sign-extends a constant in place to `new_bits`. Returns false for
    /// kinds that do not carry an extendable value.
    pub fn sign_extend(&mut self, new_bits: u16) -> bool {
        match self {
            Expression::Const { bits, value, .. } => {
                if new_bits < *bits || new_bits > 64 {
                    return false;
                }
                *value = mask_to_width(sign_extend_value(*value, *bits), new_bits);
                *bits = new_bits;
                true
            }
            // Symbolic widths are unknown, extension is a no-op.
            Expression::Sym { .. } => true,
            _ => false,
        }
    }

    /// Replaces the first direct child equal to `old` with `new`. Returns
    /// false when no direct child matches.
    pub fn update_child(&mut self, old: &Expression, new: Expression) -> bool {
        fn replace(slot: &mut Expression, old: &Expression, new: &mut Option<Expression>) -> bool {
            if *slot == *old {
                if let Some(new) = new.take() {
                    *slot = new;
                    return true;
                }
            }
            false
        }

        let mut new = Some(new);
        match self {
            Expression::Bind { expressions } => {
                expressions.iter_mut().any(|e| replace(e, old, &mut new))
            }
            Expression::Cond(cond) => {
                replace(&mut cond.reference, old, &mut new)
                    || replace(&mut cond.test, old, &mut new)
            }
            Expression::Ternary {
                condition,
                true_expr,
                false_expr,
            } => {
                replace(&mut condition.reference, old, &mut new)
                    || replace(&mut condition.test, old, &mut new)
                    || replace(true_expr, old, &mut new)
                    || replace(false_expr, old, &mut new)
            }
            Expression::IfElse {
                condition,
                then_expr,
                else_expr,
            } => {
                replace(&mut condition.reference, old, &mut new)
                    || replace(&mut condition.test, old, &mut new)
                    || replace(then_expr, old, &mut new)
                    || else_expr
                        .as_mut()
                        .is_some_and(|e| replace(e, old, &mut new))
            }
            Expression::While { condition, body } => {
                replace(&mut condition.reference, old, &mut new)
                    || replace(&mut condition.test, old, &mut new)
                    || replace(body, old, &mut new)
            }
            Expression::Assign { dst, src } => {
                replace(dst, old, &mut new) || replace(src, old, &mut new)
            }
            Expression::Op { lhs, rhs, .. } => {
                replace(lhs, old, &mut new) || replace(rhs, old, &mut new)
            }
            Expression::Mem { base, offset, .. } => {
                replace(base, old, &mut new) || replace(offset, old, &mut new)
            }
            _ => false,
        }
    }

    /// Direct children, including the operands of an embedded condition.
    pub fn children(&self) -> Vec<&Expression> {
        match self {
            Expression::Bind { expressions } => expressions.iter().collect(),
            Expression::Cond(c) => vec![&c.reference, &c.test],
            Expression::Ternary {
                condition,
                true_expr,
                false_expr,
            } => vec![&condition.reference, &condition.test, true_expr, false_expr],
            Expression::IfElse {
                condition,
                then_expr,
                else_expr,
            } => {
                let mut out = vec![
                    condition.reference.as_ref(),
                    condition.test.as_ref(),
                    then_expr.as_ref(),
                ];
                if let Some(e) = else_expr {
                    out.push(e);
                }
                out
            }
            Expression::While { condition, body } => {
                vec![&condition.reference, &condition.test, body]
            }
            Expression::Assign { dst, src } => vec![dst, src],
            Expression::Op { lhs, rhs, .. } => vec![lhs, rhs],
            Expression::Mem { base, offset, .. } => vec![base, offset],
            _ => Vec::new(),
        }
    }

    /// Height of the tree, measured with an explicit work stack so arbitrarily
    /// deep synthesized semantics cannot exhaust the call stack here.
    pub fn depth(&self) -> usize {
        let mut max = 0;
        let mut stack = vec![(self, 1usize)];
        while let Some((node, depth)) = stack.pop() {
            max = max.max(depth);
            for child in node.children() {
                stack.push((child, depth + 1));
            }
        }
        max
    }
}

/// Structural equality; the `cpu` handles of identifiers compare by pointer.
impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        use Expression::*;
        match (self, other) {
            (System { name: a }, System { name: b }) => a == b,
            (Bind { expressions: a }, Bind { expressions: b }) => a == b,
            (Cond(a), Cond(b)) => a == b,
            (
                Ternary {
                    condition: c1,
                    true_expr: t1,
                    false_expr: f1,
                },
                Ternary {
                    condition: c2,
                    true_expr: t2,
                    false_expr: f2,
                },
            ) => c1 == c2 && t1 == t2 && f1 == f2,
            (
                IfElse {
                    condition: c1,
                    then_expr: t1,
                    else_expr: e1,
                },
                IfElse {
                    condition: c2,
                    then_expr: t2,
                    else_expr: e2,
                },
            ) => c1 == c2 && t1 == t2 && e1 == e2,
            (
                While {
                    condition: c1,
                    body: b1,
                },
                While {
                    condition: c2,
                    body: b2,
                },
            ) => c1 == c2 && b1 == b2,
            (Assign { dst: d1, src: s1 }, Assign { dst: d2, src: s2 }) => d1 == d2 && s1 == s2,
            (
                Op {
                    op: o1,
                    lhs: l1,
                    rhs: r1,
                },
                Op {
                    op: o2,
                    lhs: l2,
                    rhs: r2,
                },
            ) => o1 == o2 && l1 == l2 && r1 == r2,
            (
                Const {
                    bits: b1,
                    value: v1,
                    signed: s1,
                },
                Const {
                    bits: b2,
                    value: v2,
                    signed: s2,
                },
            ) => b1 == b2 && v1 == v2 && s1 == s2,
            (Id { id: i1, cpu: c1 }, Id { id: i2, cpu: c2 }) => i1 == i2 && Arc::ptr_eq(c1, c2),
            (VecId { ids: i1, cpu: c1 }, VecId { ids: i2, cpu: c2 }) => {
                i1 == i2 && Arc::ptr_eq(c1, c2)
            }
            (
                TrackedId {
                    id: i1,
                    cpu: c1,
                    defined_at: a1,
                },
                TrackedId {
                    id: i2,
                    cpu: c2,
                    defined_at: a2,
                },
            ) => i1 == i2 && a1 == a2 && Arc::ptr_eq(c1, c2),
            (
                Mem {
                    bits: b1,
                    base: ba1,
                    offset: o1,
                    dereference: d1,
                },
                Mem {
                    bits: b2,
                    base: ba2,
                    offset: o2,
                    dereference: d2,
                },
            ) => b1 == b2 && ba1 == ba2 && o1 == o2 && d1 == d2,
            (
                Sym {
                    kind: k1,
                    label: l1,
                },
                Sym {
                    kind: k2,
                    label: l2,
                },
            ) => k1 == k2 && l1 == l2,
            _ => false,
        }
    }
}

/// Truncates `value` to `bits`, keeping full 64-bit values intact.
pub fn mask_to_width(value: u64, bits: u16) -> u64 {
    if bits == 0 || bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

/// Sign-extends a `bits`-wide value to 64 bits.
pub fn sign_extend_value(value: u64, bits: u16) -> u64 {
    if bits == 0 || bits >= 64 {
        return value;
    }
    let sign = 1u64 << (bits - 1);
    if value & sign != 0 {
        value | !((1u64 << bits) - 1)
    } else {
        value & ((1u64 << bits) - 1)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::Xchg => "<->",
            OpKind::And => "&",
            OpKind::Or => "|",
            OpKind::Xor => "^",
            OpKind::Lls => "<<",
            OpKind::Lrs => ">>",
            OpKind::Ars => ">>s",
            OpKind::Add => "+",
            OpKind::Sub => "-",
            OpKind::Mul => "*",
            OpKind::SDiv => "/s",
            OpKind::UDiv => "/",
            OpKind::SExt => "sext",
        };
        f.write_str(s)
    }
}

impl fmt::Display for CondKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CondKind::Eq => "==",
            CondKind::Ne => "!=",
            CondKind::Ugt => ">u",
            CondKind::Uge => ">=u",
            CondKind::Ult => "<u",
            CondKind::Ule => "<=u",
            CondKind::Sgt => ">s",
            CondKind::Sge => ">=s",
            CondKind::Slt => "<s",
            CondKind::Sle => "<=s",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.reference, self.kind, self.test)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::System { name } => write!(f, "sys({name})"),
            Expression::Bind { expressions } => {
                f.write_str("{ ")?;
                for (i, e) in expressions.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{e}")?;
                }
                f.write_str(" }")
            }
            Expression::Cond(c) => write!(f, "{c}"),
            Expression::Ternary {
                condition,
                true_expr,
                false_expr,
            } => write!(f, "{condition} ? {true_expr} : {false_expr}"),
            Expression::IfElse {
                condition,
                then_expr,
                else_expr,
            } => match else_expr {
                Some(e) => write!(f, "if {condition} {{ {then_expr} }} else {{ {e} }}"),
                None => write!(f, "if {condition} {{ {then_expr} }}"),
            },
            Expression::While { condition, body } => {
                write!(f, "while {condition} {{ {body} }}")
            }
            Expression::Assign { dst, src } => write!(f, "{dst} = {src}"),
            Expression::Op { op, lhs, rhs } => write!(f, "({lhs} {op} {rhs})"),
            Expression::Const { bits, value, .. } => write!(f, "0x{value:x}:{bits}"),
            Expression::Id { id, cpu } => {
                f.write_str(cpu.register_name(*id).unwrap_or("<bad-reg>"))
            }
            Expression::VecId { ids, cpu } => {
                f.write_str("(")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    f.write_str(cpu.register_name(*id).unwrap_or("<bad-reg>"))?;
                }
                f.write_str(")")
            }
            Expression::TrackedId {
                id,
                cpu,
                defined_at,
            } => write!(
                f,
                "{}@{defined_at}",
                cpu.register_name(*id).unwrap_or("<bad-reg>")
            ),
            Expression::Mem {
                bits,
                base,
                offset,
                dereference,
            } => {
                if *dereference {
                    write!(f, "[{base}:{offset}]#{bits}")
                } else {
                    write!(f, "&({base}:{offset})#{bits}")
                }
            }
            Expression::Sym { kind, label } => write!(f, "sym:{kind:?}:{label}"),
        }
    }
}
