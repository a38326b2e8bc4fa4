//! The apply engine: recursive, memoized operations on edges.
//!
//! Every operation follows the same discipline: terminal computation,
//! per-operation short circuits, operand ordering for commutative
//! operations, a compute-table probe, recursion over the top level
//! through unfolding readers, and a final build-and-reduce. Relation
//! forests recurse twice per variable: once over rows (unprimed), once
//! over columns (primed).

use std::rc::Rc;

use hashbrown::HashMap;
use log::debug;
use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};

use crate::cache::{OpId, RESULT_NODE};
use crate::edge::{level_from_rank, Edge};
use crate::error::{DdError, Result};
use crate::forest::{Forest, ForestInner};
use crate::types::{
    plus_add, EdgeLabeling, EdgeValue, Level, NodeId, RangeType, ReductionRule, Terminal,
    PLUS_INFINITY,
};

/// The binary operations of the apply engine.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BinaryOp {
    Union,
    Intersection,
    Difference,
    Min,
    Max,
    Plus,
    Minus,
    Times,
    Divide,
    Equal,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

impl BinaryOp {
    pub(crate) fn op_id(self) -> OpId {
        match self {
            BinaryOp::Union => OpId::Union,
            BinaryOp::Intersection => OpId::Intersection,
            BinaryOp::Difference => OpId::Difference,
            BinaryOp::Min => OpId::Min,
            BinaryOp::Max => OpId::Max,
            BinaryOp::Plus => OpId::Plus,
            BinaryOp::Minus => OpId::Minus,
            BinaryOp::Times => OpId::Times,
            BinaryOp::Divide => OpId::Divide,
            BinaryOp::Equal => OpId::Equal,
            BinaryOp::NotEqual => OpId::NotEqual,
            BinaryOp::LessThan => OpId::LessThan,
            BinaryOp::LessOrEqual => OpId::LessOrEqual,
            BinaryOp::GreaterThan => OpId::GreaterThan,
            BinaryOp::GreaterOrEqual => OpId::GreaterOrEqual,
        }
    }

    pub(crate) fn commutes(self) -> bool {
        matches!(
            self,
            BinaryOp::Union
                | BinaryOp::Intersection
                | BinaryOp::Min
                | BinaryOp::Max
                | BinaryOp::Plus
                | BinaryOp::Times
                | BinaryOp::Equal
                | BinaryOp::NotEqual
        )
    }

    /// The mirrored comparison, for operand canonicalization.
    fn flipped(self) -> Option<BinaryOp> {
        match self {
            BinaryOp::LessThan => Some(BinaryOp::GreaterThan),
            BinaryOp::GreaterThan => Some(BinaryOp::LessThan),
            BinaryOp::LessOrEqual => Some(BinaryOp::GreaterOrEqual),
            BinaryOp::GreaterOrEqual => Some(BinaryOp::LessOrEqual),
            _ => None,
        }
    }

    fn is_set_op(self) -> bool {
        matches!(
            self,
            BinaryOp::Union | BinaryOp::Intersection | BinaryOp::Difference
        )
    }

    fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Min
                | BinaryOp::Max
                | BinaryOp::Plus
                | BinaryOp::Minus
                | BinaryOp::Times
                | BinaryOp::Divide
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Union => "union",
            BinaryOp::Intersection => "intersection",
            BinaryOp::Difference => "difference",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
            BinaryOp::Plus => "plus",
            BinaryOp::Minus => "minus",
            BinaryOp::Times => "times",
            BinaryOp::Divide => "divide",
            BinaryOp::Equal => "equal",
            BinaryOp::NotEqual => "not_equal",
            BinaryOp::LessThan => "less_than",
            BinaryOp::LessOrEqual => "less_or_equal",
            BinaryOp::GreaterThan => "greater_than",
            BinaryOp::GreaterOrEqual => "greater_or_equal",
        }
    }
}

/// Checks the operands and dispatches a binary operation.
pub fn apply_binary(op: BinaryOp, a: &Edge, b: &Edge) -> Result<Edge> {
    if !Rc::ptr_eq(&a.forest, &b.forest) {
        let (da, db) = (a.forest.borrow().domain_id, b.forest.borrow().domain_id);
        return Err(if da != db {
            DdError::DomainMismatch
        } else {
            DdError::ForestMismatch
        });
    }
    let mut f = a.forest.borrow_mut();
    debug!("apply {}({:?}, {:?})", op.name(), a.node, b.node);
    let (value, node) = match f.labeling {
        EdgeLabeling::MultiTerminal => {
            if op.is_set_op() && f.range != RangeType::Boolean {
                return Err(DdError::TypeMismatch);
            }
            if op.is_arithmetic() && f.range == RangeType::Boolean {
                return Err(DdError::TypeMismatch);
            }
            let r = if f.relation {
                mt_binary_rel(&mut f, op, a.node, b.node)?
            } else {
                mt_binary_set(&mut f, op, a.node, b.node)?
            };
            (EdgeValue::Void, r)
        }
        EdgeLabeling::EvPlus => {
            if !matches!(
                op,
                BinaryOp::Union
                    | BinaryOp::Intersection
                    | BinaryOp::Min
                    | BinaryOp::Max
                    | BinaryOp::Plus
                    | BinaryOp::Minus
            ) {
                return Err(DdError::NotImplemented);
            }
            let (v, r) = if f.relation {
                ev_plus_rel(&mut f, op, a.value.plus(), a.node, b.value.plus(), b.node)?
            } else {
                ev_plus_set(&mut f, op, a.value.plus(), a.node, b.value.plus(), b.node)?
            };
            (EdgeValue::Plus(v), r)
        }
        EdgeLabeling::EvTimes => {
            if !matches!(op, BinaryOp::Plus | BinaryOp::Times) {
                return Err(DdError::NotImplemented);
            }
            if f.relation {
                return Err(DdError::NotImplemented);
            }
            let (v, r) = ev_times_set(&mut f, op, a.value.times(), a.node, b.value.times(), b.node)?;
            (EdgeValue::Times(v), r)
        }
    };
    drop(f);
    Ok(Edge::new(Rc::clone(&a.forest), value, node))
}

// ----------------------------------------------------------------------
// Multi-terminal drivers
// ----------------------------------------------------------------------

/// Computes `op` on two terminals, in the forest's range.
fn terminal_apply(f: &ForestInner, op: BinaryOp, a: NodeId, b: NodeId) -> Result<NodeId> {
    let ta = f.terminal_value(a);
    let tb = f.terminal_value(b);
    let result = match f.range {
        RangeType::Boolean => {
            let (x, y) = (ta.as_bool(), tb.as_bool());
            Terminal::Bool(match op {
                BinaryOp::Union => x || y,
                BinaryOp::Intersection => x && y,
                BinaryOp::Difference => x && !y,
                BinaryOp::Equal => x == y,
                BinaryOp::NotEqual => x != y,
                BinaryOp::LessThan => !x && y,
                BinaryOp::LessOrEqual => !x || y,
                BinaryOp::GreaterThan => x && !y,
                BinaryOp::GreaterOrEqual => x || !y,
                _ => return Err(DdError::TypeMismatch),
            })
        }
        RangeType::Integer => {
            let (x, y) = (ta.as_int(), tb.as_int());
            match op {
                BinaryOp::Min => Terminal::Int(x.min(y)),
                BinaryOp::Max => Terminal::Int(x.max(y)),
                BinaryOp::Plus => Terminal::Int(x + y),
                BinaryOp::Minus => Terminal::Int(x - y),
                BinaryOp::Times => Terminal::Int(x * y),
                BinaryOp::Divide => {
                    if y == 0 {
                        return Err(DdError::InvalidArgument);
                    }
                    Terminal::Int(x / y)
                }
                BinaryOp::Equal => Terminal::Bool(x == y),
                BinaryOp::NotEqual => Terminal::Bool(x != y),
                BinaryOp::LessThan => Terminal::Bool(x < y),
                BinaryOp::LessOrEqual => Terminal::Bool(x <= y),
                BinaryOp::GreaterThan => Terminal::Bool(x > y),
                BinaryOp::GreaterOrEqual => Terminal::Bool(x >= y),
                _ => return Err(DdError::TypeMismatch),
            }
        }
        RangeType::Real => {
            let (x, y) = (ta.as_real(), tb.as_real());
            match op {
                BinaryOp::Min => Terminal::Real(x.min(y)),
                BinaryOp::Max => Terminal::Real(x.max(y)),
                BinaryOp::Plus => Terminal::Real(x + y),
                BinaryOp::Minus => Terminal::Real(x - y),
                BinaryOp::Times => Terminal::Real(x * y),
                BinaryOp::Divide => {
                    if y == 0.0 {
                        return Err(DdError::InvalidArgument);
                    }
                    Terminal::Real(x / y)
                }
                BinaryOp::Equal => Terminal::Bool(x == y),
                BinaryOp::NotEqual => Terminal::Bool(x != y),
                BinaryOp::LessThan => Terminal::Bool(x < y),
                BinaryOp::LessOrEqual => Terminal::Bool(x <= y),
                BinaryOp::GreaterThan => Terminal::Bool(x > y),
                BinaryOp::GreaterOrEqual => Terminal::Bool(x >= y),
                _ => return Err(DdError::TypeMismatch),
            }
        }
    };
    Ok(f.terminal(result))
}

/// Identity/annihilator cases that avoid recursion. Returns a handle
/// owning one incoming reference on a hit.
fn shortcut(f: &mut ForestInner, op: BinaryOp, a: NodeId, b: NodeId) -> Option<NodeId> {
    let zero = NodeId::TRANSPARENT;
    let truth = f.terminal(Terminal::Bool(true));
    let fully = f.policies.reduction == ReductionRule::Fully;
    let boolean = f.range == RangeType::Boolean;
    let hit = match op {
        BinaryOp::Union => {
            if a.is_transparent() {
                Some(b)
            } else if b.is_transparent() || a == b {
                Some(a)
            } else if fully && boolean && (a == truth || b == truth) {
                Some(truth)
            } else {
                None
            }
        }
        BinaryOp::Intersection => {
            if a.is_transparent() || b.is_transparent() {
                Some(zero)
            } else if a == b {
                Some(a)
            } else if fully && boolean && a == truth {
                Some(b)
            } else if fully && boolean && b == truth {
                Some(a)
            } else {
                None
            }
        }
        BinaryOp::Difference => {
            if a.is_transparent() || a == b {
                Some(zero)
            } else if b.is_transparent() {
                Some(a)
            } else {
                None
            }
        }
        BinaryOp::Min | BinaryOp::Max => {
            if a == b {
                Some(a)
            } else {
                None
            }
        }
        BinaryOp::Plus => {
            if a.is_transparent() {
                Some(b)
            } else if b.is_transparent() {
                Some(a)
            } else {
                None
            }
        }
        BinaryOp::Minus => {
            if b.is_transparent() {
                Some(a)
            } else {
                None
            }
        }
        BinaryOp::Times => {
            if a.is_transparent() || b.is_transparent() {
                Some(zero)
            } else {
                None
            }
        }
        BinaryOp::Divide => {
            if a.is_transparent() {
                Some(zero)
            } else {
                None
            }
        }
        BinaryOp::Equal | BinaryOp::LessOrEqual | BinaryOp::GreaterOrEqual if fully && a == b => {
            Some(truth)
        }
        BinaryOp::NotEqual | BinaryOp::LessThan | BinaryOp::GreaterThan if fully && a == b => {
            Some(zero)
        }
        _ => None,
    };
    if let Some(h) = hit {
        f.link(h);
    }
    hit
}

fn orient(op: BinaryOp, a: NodeId, b: NodeId) -> (BinaryOp, NodeId, NodeId) {
    if op.commutes() && b.raw() < a.raw() {
        (op, b, a)
    } else if let Some(flip) = op.flipped() {
        if b.raw() < a.raw() {
            (flip, b, a)
        } else {
            (op, a, b)
        }
    } else {
        (op, a, b)
    }
}

pub(crate) fn mt_binary_set(
    f: &mut ForestInner,
    op: BinaryOp,
    a: NodeId,
    b: NodeId,
) -> Result<NodeId> {
    if a.is_terminal() && b.is_terminal() {
        return terminal_apply(f, op, a, b);
    }
    let (op, a, b) = orient(op, a, b);
    if let Some(r) = shortcut(f, op, a, b) {
        return Ok(r);
    }
    let key = [a.raw(), b.raw()];
    if let Some((_, r)) = f.ct_find(op.op_id(), &key) {
        f.link(r);
        return Ok(r);
    }

    let la = f.node_level(a);
    let lb = f.node_level(b);
    let k = if la.is_above(lb) { la } else { lb };
    let size = f.bound(k);
    let ra = f.unpack_at(k, a);
    let rb = f.unpack_at(k, b);
    let mut nb = f.new_builder(k);
    for i in 0..size {
        match mt_binary_set(f, op, ra.d(i), rb.d(i)) {
            Ok(c) => nb.set_d(i, c),
            Err(e) => {
                f.discard_builder(&nb);
                return Err(e);
            }
        }
    }
    let (_, r) = f.reduce(-1, nb)?;
    f.ct_add(op.op_id(), &key, 0b11 | RESULT_NODE, 0, r);
    Ok(r)
}

pub(crate) fn mt_binary_rel(
    f: &mut ForestInner,
    op: BinaryOp,
    a: NodeId,
    b: NodeId,
) -> Result<NodeId> {
    if a.is_terminal() && b.is_terminal() {
        return terminal_apply(f, op, a, b);
    }
    let (op, a, b) = orient(op, a, b);
    if let Some(r) = shortcut(f, op, a, b) {
        return Ok(r);
    }
    let pos = f
        .node_level(a)
        .pos()
        .max(f.node_level(b).pos());
    // Results can depend on how far the operands were unfolded.
    let key = [a.raw(), b.raw(), pos as i64];
    if let Some((_, r)) = f.ct_find(op.op_id(), &key) {
        f.link(r);
        return Ok(r);
    }

    let k = Level::unprimed(pos);
    let kp = Level::primed(pos);
    let size = f.bound(k);
    let ra = f.unpack_at(k, a);
    let rb = f.unpack_at(k, b);
    let mut nb = f.new_builder(k);
    for i in 0..size {
        let pa = f.unpack_primed_at(kp, i, ra.d(i));
        let pb = f.unpack_primed_at(kp, i, rb.d(i));
        let mut pnb = f.new_builder(kp);
        for j in 0..size {
            match mt_binary_rel(f, op, pa.d(j), pb.d(j)) {
                Ok(c) => pnb.set_d(j, c),
                Err(e) => {
                    f.discard_builder(&pnb);
                    f.discard_builder(&nb);
                    return Err(e);
                }
            }
        }
        match f.reduce(i as i32, pnb) {
            Ok((_, p)) => nb.set_d(i, p),
            Err(e) => {
                f.discard_builder(&nb);
                return Err(e);
            }
        }
    }
    let (_, r) = f.reduce(-1, nb)?;
    f.ct_add(op.op_id(), &key, 0b11 | RESULT_NODE, 0, r);
    Ok(r)
}

// ----------------------------------------------------------------------
// Complement
// ----------------------------------------------------------------------

/// Boolean complement.
pub fn complement(a: &Edge) -> Result<Edge> {
    let mut f = a.forest.borrow_mut();
    if f.labeling != EdgeLabeling::MultiTerminal || f.range != RangeType::Boolean {
        return Err(DdError::TypeMismatch);
    }
    let top = f.num_vars;
    let r = if f.relation {
        mt_complement_rel(&mut f, top, a.node)?
    } else {
        mt_complement_set(&mut f, top, a.node)?
    };
    drop(f);
    Ok(Edge::new(Rc::clone(&a.forest), EdgeValue::Void, r))
}

fn terminal_not(f: &ForestInner, a: NodeId) -> NodeId {
    f.terminal(Terminal::Bool(!f.terminal_value(a).as_bool()))
}

fn mt_complement_set(f: &mut ForestInner, mut pos: u32, a: NodeId) -> Result<NodeId> {
    if f.policies.reduction == ReductionRule::Fully {
        // Complement commutes with redundant skips.
        pos = f.node_level(a).pos();
    }
    if pos == 0 {
        return Ok(terminal_not(f, a));
    }
    let key = [a.raw(), pos as i64];
    if let Some((_, r)) = f.ct_find(OpId::Complement, &key) {
        f.link(r);
        return Ok(r);
    }
    let k = Level::unprimed(pos);
    let size = f.bound(k);
    let ra = f.unpack_at(k, a);
    let mut nb = f.new_builder(k);
    for i in 0..size {
        match mt_complement_set(f, pos - 1, ra.d(i)) {
            Ok(c) => nb.set_d(i, c),
            Err(e) => {
                f.discard_builder(&nb);
                return Err(e);
            }
        }
    }
    let (_, r) = f.reduce(-1, nb)?;
    f.ct_add(OpId::Complement, &key, 0b01 | RESULT_NODE, 0, r);
    Ok(r)
}

fn mt_complement_rel(f: &mut ForestInner, mut pos: u32, a: NodeId) -> Result<NodeId> {
    if f.policies.reduction == ReductionRule::Fully {
        pos = f.node_level(a).pos();
    }
    if pos == 0 {
        return Ok(terminal_not(f, a));
    }
    let key = [a.raw(), pos as i64];
    if let Some((_, r)) = f.ct_find(OpId::Complement, &key) {
        f.link(r);
        return Ok(r);
    }
    let k = Level::unprimed(pos);
    let kp = Level::primed(pos);
    let size = f.bound(k);
    let ra = f.unpack_at(k, a);
    let mut nb = f.new_builder(k);
    for i in 0..size {
        let pa = f.unpack_primed_at(kp, i, ra.d(i));
        let mut pnb = f.new_builder(kp);
        for j in 0..size {
            match mt_complement_rel(f, pos - 1, pa.d(j)) {
                Ok(c) => pnb.set_d(j, c),
                Err(e) => {
                    f.discard_builder(&pnb);
                    f.discard_builder(&nb);
                    return Err(e);
                }
            }
        }
        match f.reduce(i as i32, pnb) {
            Ok((_, p)) => nb.set_d(i, p),
            Err(e) => {
                f.discard_builder(&nb);
                return Err(e);
            }
        }
    }
    let (_, r) = f.reduce(-1, nb)?;
    f.ct_add(OpId::Complement, &key, 0b01 | RESULT_NODE, 0, r);
    Ok(r)
}

// ----------------------------------------------------------------------
// EV+ drivers
// ----------------------------------------------------------------------

/// Base cases shared by the EV+ drivers; `Some` short-circuits the
/// recursion with a finished result.
fn ev_plus_base(
    f: &mut ForestInner,
    op: BinaryOp,
    av: i64,
    a: NodeId,
    bv: i64,
    b: NodeId,
) -> Option<(i64, NodeId)> {
    match op {
        BinaryOp::Union | BinaryOp::Min => {
            if a.is_transparent() {
                f.link(b);
                Some((bv, b))
            } else if b.is_transparent() {
                f.link(a);
                Some((av, a))
            } else if a == b {
                f.link(a);
                Some((av.min(bv), a))
            } else {
                None
            }
        }
        BinaryOp::Intersection | BinaryOp::Max => {
            if a.is_transparent() || b.is_transparent() {
                Some((PLUS_INFINITY, NodeId::TRANSPARENT))
            } else if a == b {
                f.link(a);
                Some((av.max(bv), a))
            } else {
                None
            }
        }
        BinaryOp::Plus => {
            if a.is_transparent() || b.is_transparent() {
                Some((PLUS_INFINITY, NodeId::TRANSPARENT))
            } else if a.is_terminal() && b.is_terminal() {
                Some((av + bv, a))
            } else {
                None
            }
        }
        BinaryOp::Minus => {
            if a.is_transparent() || b.is_transparent() {
                Some((PLUS_INFINITY, NodeId::TRANSPARENT))
            } else if a.is_terminal() && b.is_terminal() {
                Some((av - bv, a))
            } else {
                None
            }
        }
        _ => unreachable!("not an EV+ operation: {:?}", op),
    }
}

/// Key residuals: min-family operations are shift-invariant, additive
/// ones factor out both values entirely.
fn ev_plus_residuals(op: BinaryOp, av: i64, bv: i64) -> (i64, i64, i64) {
    match op {
        BinaryOp::Union | BinaryOp::Min | BinaryOp::Intersection | BinaryOp::Max => {
            let m = av.min(bv);
            (m, av - m, bv - m)
        }
        BinaryOp::Plus => (av + bv, 0, 0),
        BinaryOp::Minus => (av - bv, 0, 0),
        _ => unreachable!(),
    }
}

fn ev_plus_set(
    f: &mut ForestInner,
    op: BinaryOp,
    av: i64,
    a: NodeId,
    bv: i64,
    b: NodeId,
) -> Result<(i64, NodeId)> {
    if let Some(hit) = ev_plus_base(f, op, av, a, bv, b) {
        return Ok(hit);
    }
    let (base, ea, eb) = ev_plus_residuals(op, av, bv);
    let ((ea, a), (eb, b)) = if op.commutes() && (b.raw(), eb) < (a.raw(), ea) {
        ((eb, b), (ea, a))
    } else {
        ((ea, a), (eb, b))
    };
    let key = [ea, a.raw(), eb, b.raw()];
    if let Some((rv, r)) = f.ct_find(op.op_id(), &key) {
        f.link(r);
        return Ok((plus_add(base, rv), r));
    }

    let la = f.node_level(a);
    let lb = f.node_level(b);
    let k = if la.is_above(lb) { la } else { lb };
    let size = f.bound(k);
    let ra = f.unpack_at(k, a);
    let rb = f.unpack_at(k, b);
    let mut nb = f.new_builder(k);
    for i in 0..size {
        let cav = plus_add(ea, ra.ev(i).plus());
        let cbv = plus_add(eb, rb.ev(i).plus());
        match ev_plus_set(f, op, cav, ra.d(i), cbv, rb.d(i)) {
            Ok((cv, c)) => nb.set(i, EdgeValue::Plus(cv), c),
            Err(e) => {
                f.discard_builder(&nb);
                return Err(e);
            }
        }
    }
    let (carry, r) = f.reduce(-1, nb)?;
    f.ct_add(op.op_id(), &key, 0b1010 | RESULT_NODE, carry.plus(), r);
    Ok((plus_add(base, carry.plus()), r))
}

fn ev_plus_rel(
    f: &mut ForestInner,
    op: BinaryOp,
    av: i64,
    a: NodeId,
    bv: i64,
    b: NodeId,
) -> Result<(i64, NodeId)> {
    if let Some(hit) = ev_plus_base(f, op, av, a, bv, b) {
        return Ok(hit);
    }
    let (base, ea, eb) = ev_plus_residuals(op, av, bv);
    let ((ea, a), (eb, b)) = if op.commutes() && (b.raw(), eb) < (a.raw(), ea) {
        ((eb, b), (ea, a))
    } else {
        ((ea, a), (eb, b))
    };
    let pos = f.node_level(a).pos().max(f.node_level(b).pos());
    let key = [ea, a.raw(), eb, b.raw(), pos as i64];
    if let Some((rv, r)) = f.ct_find(op.op_id(), &key) {
        f.link(r);
        return Ok((plus_add(base, rv), r));
    }

    let k = Level::unprimed(pos);
    let kp = Level::primed(pos);
    let size = f.bound(k);
    let ra = f.unpack_at(k, a);
    let rb = f.unpack_at(k, b);
    let mut nb = f.new_builder(k);
    for i in 0..size {
        let pa = f.unpack_primed_at(kp, i, ra.d(i));
        let pb = f.unpack_primed_at(kp, i, rb.d(i));
        let mut pnb = f.new_builder(kp);
        for j in 0..size {
            let cav = plus_add(plus_add(ea, ra.ev(i).plus()), pa.ev(j).plus());
            let cbv = plus_add(plus_add(eb, rb.ev(i).plus()), pb.ev(j).plus());
            match ev_plus_rel(f, op, cav, pa.d(j), cbv, pb.d(j)) {
                Ok((cv, c)) => pnb.set(j, EdgeValue::Plus(cv), c),
                Err(e) => {
                    f.discard_builder(&pnb);
                    f.discard_builder(&nb);
                    return Err(e);
                }
            }
        }
        match f.reduce(i as i32, pnb) {
            Ok((pv, p)) => nb.set(i, pv, p),
            Err(e) => {
                f.discard_builder(&nb);
                return Err(e);
            }
        }
    }
    let (carry, r) = f.reduce(-1, nb)?;
    f.ct_add(op.op_id(), &key, 0b01010 | RESULT_NODE, carry.plus(), r);
    Ok((plus_add(base, carry.plus()), r))
}

// ----------------------------------------------------------------------
// EV* driver
// ----------------------------------------------------------------------

fn ev_times_set(
    f: &mut ForestInner,
    op: BinaryOp,
    av: f32,
    a: NodeId,
    bv: f32,
    b: NodeId,
) -> Result<(f32, NodeId)> {
    match op {
        BinaryOp::Times => {
            if a.is_transparent() || b.is_transparent() {
                return Ok((0.0, NodeId::TRANSPARENT));
            }
            if a.is_terminal() && b.is_terminal() {
                return Ok((av * bv, a));
            }
        }
        BinaryOp::Plus => {
            if a.is_transparent() {
                f.link(b);
                return Ok((bv, b));
            }
            if b.is_transparent() {
                f.link(a);
                return Ok((av, a));
            }
            if a.is_terminal() && b.is_terminal() {
                return Ok((av + bv, a));
            }
        }
        _ => unreachable!("not an EV* operation: {:?}", op),
    }
    // Times factors both values out; plus factors the first and keys the
    // ratio.
    let (base, ea, eb) = match op {
        BinaryOp::Times => (av * bv, 1.0f32, 1.0f32),
        BinaryOp::Plus => (av, 1.0f32, bv / av),
        _ => unreachable!(),
    };
    let ((ea, a), (eb, b)) = if op == BinaryOp::Times && b.raw() < a.raw() {
        ((eb, b), (ea, a))
    } else {
        ((ea, a), (eb, b))
    };
    let key = [a.raw(), b.raw(), eb.to_bits() as i64];
    if let Some((rv, r)) = f.ct_find(op.op_id(), &key) {
        f.link(r);
        return Ok((base * f32::from_bits(rv as u32), r));
    }

    let la = f.node_level(a);
    let lb = f.node_level(b);
    let k = if la.is_above(lb) { la } else { lb };
    let size = f.bound(k);
    let ra = f.unpack_at(k, a);
    let rb = f.unpack_at(k, b);
    let mut nb = f.new_builder(k);
    for i in 0..size {
        let cav = ea * ra.ev(i).times();
        let cbv = eb * rb.ev(i).times();
        match ev_times_set(f, op, cav, ra.d(i), cbv, rb.d(i)) {
            Ok((cv, c)) => nb.set(i, EdgeValue::Times(cv), c),
            Err(e) => {
                f.discard_builder(&nb);
                return Err(e);
            }
        }
    }
    let (carry, r) = f.reduce(-1, nb)?;
    f.ct_add(
        op.op_id(),
        &key,
        0b011 | RESULT_NODE,
        carry.times().to_bits() as i64,
        r,
    );
    Ok((base * carry.times(), r))
}

/// EV+ minimum-union over set edges (internal entry for the matrix and
/// saturation operations).
pub(crate) fn ev_plus_union(
    f: &mut ForestInner,
    av: i64,
    a: NodeId,
    bv: i64,
    b: NodeId,
) -> Result<(i64, NodeId)> {
    ev_plus_set(f, BinaryOp::Union, av, a, bv, b)
}

/// EV+ minimum-union over relation edges.
pub(crate) fn ev_plus_union_rel(
    f: &mut ForestInner,
    av: i64,
    a: NodeId,
    bv: i64,
    b: NodeId,
) -> Result<(i64, NodeId)> {
    ev_plus_rel(f, BinaryOp::Union, av, a, bv, b)
}

// ----------------------------------------------------------------------
// Accumulation (minterm batches)
// ----------------------------------------------------------------------

/// Folds `b` into `a` with the forest's natural accumulation operation,
/// consuming both references and returning the combined edge.
pub(crate) fn accumulate(
    f: &mut ForestInner,
    a: (EdgeValue, NodeId),
    b: (EdgeValue, NodeId),
) -> Result<(EdgeValue, NodeId)> {
    let result = match f.labeling {
        EdgeLabeling::MultiTerminal => {
            let op = if f.range == RangeType::Boolean {
                BinaryOp::Union
            } else {
                BinaryOp::Max
            };
            let r = if f.relation {
                mt_binary_rel(f, op, a.1, b.1)?
            } else {
                mt_binary_set(f, op, a.1, b.1)?
            };
            (EdgeValue::Void, r)
        }
        EdgeLabeling::EvPlus => {
            let (v, r) = if f.relation {
                ev_plus_rel(f, BinaryOp::Union, a.0.plus(), a.1, b.0.plus(), b.1)?
            } else {
                ev_plus_set(f, BinaryOp::Union, a.0.plus(), a.1, b.0.plus(), b.1)?
            };
            (EdgeValue::Plus(v), r)
        }
        EdgeLabeling::EvTimes => {
            if f.relation {
                return Err(DdError::NotImplemented);
            }
            let (v, r) = ev_times_set(f, BinaryOp::Plus, a.0.times(), a.1, b.0.times(), b.1)?;
            (EdgeValue::Times(v), r)
        }
    };
    f.unlink(a.1);
    f.unlink(b.1);
    Ok(result)
}

// ----------------------------------------------------------------------
// Cardinality
// ----------------------------------------------------------------------

/// Multiplier contributed by the levels skipped strictly between
/// `upper_exclusive` (a rank) and `lower`.
fn gap_factor(f: &ForestInner, upper_exclusive: i64, lower: Level) -> BigUint {
    let mut prod = BigUint::one();
    let mut r = upper_exclusive - 1;
    while r > lower.rank() {
        if let Some(l) = level_from_rank(r, f.relation) {
            let factor: u64 = match f.policies.reduction {
                ReductionRule::Fully => f.bound(l) as u64,
                // Quasi-reduced paths never skip levels.
                ReductionRule::Quasi => 1,
                // A skipped pair is the identity on its variable; the
                // primed half contributes nothing beyond the unprimed
                // choice.
                ReductionRule::Identity => {
                    if l.is_primed() {
                        1
                    } else {
                        f.bound(l) as u64
                    }
                }
            };
            prod *= factor;
        }
        r -= 1;
    }
    prod
}

fn count_paths(f: &ForestInner, h: NodeId, memo: &mut HashMap<i64, BigUint>) -> BigUint {
    if h.is_terminal() {
        return if h.is_transparent() {
            BigUint::zero()
        } else {
            BigUint::one()
        };
    }
    if let Some(c) = memo.get(&h.raw()) {
        return c.clone();
    }
    let r = f.unpack(h);
    let level = r.level();
    let mut total = BigUint::zero();
    for z in 0..r.nnz() {
        let d = r.d_at(z);
        let below = count_paths(f, d, memo);
        total += below * gap_factor(f, level.rank(), f.node_level(d));
    }
    memo.insert(h.raw(), total.clone());
    total
}

/// Exact number of assignments mapped to a non-transparent value.
pub(crate) fn cardinality(e: &Edge) -> BigUint {
    let f = e.forest.borrow();
    let mut memo = HashMap::new();
    let top = Level::unprimed(f.num_vars).rank() + 1;
    count_paths(&f, e.node, &mut memo) * gap_factor(&f, top, f.node_level(e.node))
}

/// Floating-point cardinality.
pub(crate) fn cardinality_real(e: &Edge) -> f64 {
    cardinality(e).to_f64().unwrap_or(f64::INFINITY)
}

// ----------------------------------------------------------------------
// Range extrema
// ----------------------------------------------------------------------

fn range_rec(
    f: &ForestInner,
    h: NodeId,
    best: fn(Terminal, Terminal) -> Terminal,
    memo: &mut HashMap<i64, Terminal>,
) -> Terminal {
    if h.is_terminal() {
        return f.terminal_value(h);
    }
    if let Some(&t) = memo.get(&h.raw()) {
        return t;
    }
    let r = f.unpack(h);
    // Skipped indices reach the transparent terminal.
    let mut acc = if r.nnz() < r.size() {
        f.terminal_value(NodeId::TRANSPARENT)
    } else {
        range_rec(f, r.d_at(0), best, memo)
    };
    for z in 0..r.nnz() {
        acc = best(acc, range_rec(f, r.d_at(z), best, memo));
    }
    memo.insert(h.raw(), acc);
    acc
}

fn terminal_min(a: Terminal, b: Terminal) -> Terminal {
    if matches!(a, Terminal::Real(_)) || matches!(b, Terminal::Real(_)) {
        Terminal::Real(a.as_real().min(b.as_real()))
    } else {
        Terminal::Int(a.as_int().min(b.as_int()))
    }
}

fn terminal_max(a: Terminal, b: Terminal) -> Terminal {
    if matches!(a, Terminal::Real(_)) || matches!(b, Terminal::Real(_)) {
        Terminal::Real(a.as_real().max(b.as_real()))
    } else {
        Terminal::Int(a.as_int().max(b.as_int()))
    }
}

/// Smallest value the function takes over any assignment.
pub fn min_range(e: &Edge) -> Result<Terminal> {
    let f = e.forest.borrow();
    match f.labeling {
        EdgeLabeling::MultiTerminal => {
            Ok(range_rec(&f, e.node, terminal_min, &mut HashMap::new()))
        }
        // EV+ values are normalized so the root carries the minimum.
        EdgeLabeling::EvPlus => {
            if e.node.is_transparent() {
                return Err(DdError::InvalidArgument);
            }
            Ok(Terminal::Int(e.value.plus() as i32))
        }
        EdgeLabeling::EvTimes => Err(DdError::NotImplemented),
    }
}

/// Largest value the function takes over any assignment.
pub fn max_range(e: &Edge) -> Result<Terminal> {
    let f = e.forest.borrow();
    match f.labeling {
        EdgeLabeling::MultiTerminal => {
            Ok(range_rec(&f, e.node, terminal_max, &mut HashMap::new()))
        }
        _ => Err(DdError::NotImplemented),
    }
}

// ----------------------------------------------------------------------
// Copy / lift across forests
// ----------------------------------------------------------------------

/// Copies an edge into another forest on the same domain, converting
/// terminals between ranges, re-canonicalizing between reduction rules,
/// and lifting multi-terminal integers into EV+ edge values.
pub fn copy_to(dst: &Forest, e: &Edge) -> Result<Edge> {
    let src_forest = e.forest();
    if src_forest.ptr_eq(dst) {
        return Ok(e.clone());
    }
    {
        let s = e.forest.borrow();
        let d = dst.inner.borrow();
        if s.domain_id != d.domain_id {
            return Err(DdError::DomainMismatch);
        }
        if s.relation != d.relation {
            return Err(DdError::TypeMismatch);
        }
        match (s.labeling, d.labeling) {
            (EdgeLabeling::MultiTerminal, EdgeLabeling::MultiTerminal) => {}
            (EdgeLabeling::MultiTerminal, EdgeLabeling::EvPlus) => {}
            _ => return Err(DdError::NotImplemented),
        }
    }
    let src = e.forest.borrow();
    let mut out = dst.inner.borrow_mut();
    let mut memo: HashMap<(i64, i64), (i64, i64)> = HashMap::new();
    let top = Level::unprimed(src.num_vars).rank();
    let result = copy_rec(&src, &mut out, top, e.node, &mut memo);
    // Memoized intermediates hold one reference each; release them,
    // keeping the result's own reference.
    let result = match result {
        Ok((ev, node)) => {
            for (_, (_, n)) in memo {
                out.unlink(NodeId::from_raw(n));
            }
            (ev, node)
        }
        Err(err) => {
            for (_, (_, n)) in memo {
                out.unlink(NodeId::from_raw(n));
            }
            return Err(err);
        }
    };
    drop(out);
    let value = EdgeValue::from_bits(dst.inner.borrow().labeling, result.0);
    Ok(Edge::new(Rc::clone(&dst.inner), value, result.1))
}

fn copy_rec(
    src: &ForestInner,
    dst: &mut ForestInner,
    rank: i64,
    h: NodeId,
    memo: &mut HashMap<(i64, i64), (i64, i64)>,
) -> Result<(i64, NodeId)> {
    // Between two set forests that both skip redundantly, jump straight
    // to the node's own level. Relation forests walk every rank so the
    // primed reducer always sees its parent index.
    let rank = if !src.relation
        && src.policies.reduction == ReductionRule::Fully
        && dst.policies.reduction == ReductionRule::Fully
    {
        src.node_level(h).rank()
    } else {
        rank
    };
    if rank == 0 && h.is_terminal() {
        return Ok(convert_terminal(src, dst, h));
    }
    if let Some(&(ev, n)) = memo.get(&(h.raw(), rank)) {
        let n = NodeId::from_raw(n);
        dst.link(n);
        return Ok((ev, n));
    }
    let Some(level) = level_from_rank(rank, src.relation) else {
        return Err(DdError::Miscellaneous);
    };
    let next_rank = rank - if src.relation { 1 } else { 2 };
    let size = dst.bound(level);
    debug_assert!(!level.is_primed(), "primed levels are copied in the row loop");
    let reader = src.unpack_at(level, h);
    let mut nb = dst.new_builder(level);
    if src.relation && !level.is_primed() {
        let kp = level.prime();
        for i in 0..size {
            let pr = src.unpack_primed_at(kp, i, reader.d(i));
            let mut pnb = dst.new_builder(kp);
            for j in 0..size {
                match copy_rec(src, dst, next_rank - 1, pr.d(j), memo) {
                    Ok((ev, c)) => pnb.set(j, EdgeValue::from_bits(dst.labeling, ev), c),
                    Err(e) => {
                        dst.discard_builder(&pnb);
                        dst.discard_builder(&nb);
                        return Err(e);
                    }
                }
            }
            match dst.reduce(i as i32, pnb) {
                Ok((pv, p)) => nb.set(i, pv, p),
                Err(e) => {
                    dst.discard_builder(&nb);
                    return Err(e);
                }
            }
        }
    } else {
        for i in 0..size {
            match copy_rec(src, dst, next_rank, reader.d(i), memo) {
                Ok((ev, c)) => nb.set(i, EdgeValue::from_bits(dst.labeling, ev), c),
                Err(e) => {
                    dst.discard_builder(&nb);
                    return Err(e);
                }
            }
        }
    }
    let (ev, r) = dst.reduce(-1, nb)?;
    dst.link(r);
    memo.insert((h.raw(), rank), (ev.to_bits(), r.raw()));
    Ok((ev.to_bits(), r))
}

fn convert_terminal(src: &ForestInner, dst: &ForestInner, h: NodeId) -> (i64, NodeId) {
    let t = src.terminal_value(h);
    match dst.labeling {
        EdgeLabeling::MultiTerminal => (0, dst.terminal(t)),
        EdgeLabeling::EvPlus => {
            if h.is_transparent() {
                (PLUS_INFINITY, NodeId::TRANSPARENT)
            } else {
                (t.as_int() as i64, dst.omega())
            }
        }
        EdgeLabeling::EvTimes => unreachable!("checked in copy_to"),
    }
}

/// Lifts a multi-terminal edge into an EV+ forest (a named convenience
/// for [`copy_to`]).
pub fn lift_to_ev_plus(dst: &Forest, e: &Edge) -> Result<Edge> {
    if dst.edge_labeling() != EdgeLabeling::EvPlus {
        return Err(DdError::TypeMismatch);
    }
    copy_to(dst, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::forest::Policies;
    use crate::types::{NodeDeletion, DONT_CARE};

    fn bool_forest() -> (Domain, Forest) {
        let d = Domain::bottom_up(&[3, 3, 3]).unwrap();
        let f = d
            .new_forest(
                false,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(false).with_deletion(NodeDeletion::Pessimistic),
            )
            .unwrap();
        (d, f)
    }

    fn some_set(f: &Forest) -> Edge {
        f.edge_from_minterms(
            &[vec![0, 1, 2], vec![2, 1, 0], vec![1, 1, 1], vec![0, 0, 0]],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_union_intersection_idempotent() {
        let (_d, f) = bool_forest();
        let a = some_set(&f);
        assert_eq!(a.union(&a).unwrap(), a);
        assert_eq!(a.intersection(&a).unwrap(), a);
        assert_eq!(a.difference(&a).unwrap(), f.transparent());
    }

    #[test]
    fn test_empty_set_identities() {
        let (_d, f) = bool_forest();
        let a = some_set(&f);
        let empty = f.transparent();
        assert_eq!(a.union(&empty).unwrap(), a);
        assert_eq!(a.intersection(&empty).unwrap(), empty);
        assert_eq!(empty.difference(&a).unwrap(), empty);
    }

    #[test]
    fn test_double_complement() {
        let (_d, f) = bool_forest();
        let a = some_set(&f);
        let c = a.complement().unwrap();
        assert_ne!(c, a);
        assert_eq!(c.complement().unwrap(), a);
        // The complement covers exactly the rest of the space.
        assert_eq!(a.cardinality() + c.cardinality(), 27u32.into());
        assert_eq!(a.intersection(&c).unwrap(), f.transparent());
    }

    #[test]
    fn test_de_morgan() {
        let (_d, f) = bool_forest();
        let a = some_set(&f);
        let b = f
            .edge_from_minterms(&[vec![2, 2, 2], vec![1, 1, 1], vec![0, 1, 0]], None)
            .unwrap();
        let lhs = a.union(&b).unwrap().complement().unwrap();
        let rhs = a
            .complement()
            .unwrap()
            .intersection(&b.complement().unwrap())
            .unwrap();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn test_forest_mismatch() {
        let (d, f) = bool_forest();
        let g = d
            .new_forest(
                false,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(false),
            )
            .unwrap();
        let a = some_set(&f);
        let b = g.constant(Terminal::Bool(true)).unwrap();
        assert_eq!(a.union(&b).unwrap_err(), DdError::ForestMismatch);
    }

    #[test]
    fn test_set_ops_need_boolean_range() {
        let d = Domain::bottom_up(&[2, 2]).unwrap();
        let f = d
            .new_forest(
                false,
                RangeType::Integer,
                EdgeLabeling::MultiTerminal,
                Policies::new(false),
            )
            .unwrap();
        let a = f.constant(Terminal::Int(3)).unwrap();
        assert_eq!(a.union(&a).unwrap_err(), DdError::TypeMismatch);
        assert_eq!(a.plus(&a).unwrap().min_range().unwrap(), Terminal::Int(6));
    }

    #[test]
    fn test_integer_arithmetic_and_comparisons() {
        let d = Domain::bottom_up(&[4, 4]).unwrap();
        let f = d
            .new_forest(
                false,
                RangeType::Integer,
                EdgeLabeling::MultiTerminal,
                Policies::new(false),
            )
            .unwrap();
        let x1 = f.edge_for_variable(1, false, None).unwrap();
        let x2 = f.edge_for_variable(2, false, None).unwrap();
        let sum = x1.plus(&x2).unwrap();
        for (a, b) in [(0, 0), (1, 2), (3, 3), (2, 0)] {
            let (_, t) = sum.evaluate(&[a, b], None).unwrap();
            assert_eq!(t, Terminal::Int(a + b));
        }
        assert_eq!(sum.min_range().unwrap(), Terminal::Int(0));
        assert_eq!(sum.max_range().unwrap(), Terminal::Int(6));

        // x1 < x2 holds on 6 of the 16 points.
        let lt = x1.less_than(&x2).unwrap();
        let card: u64 = (0..4)
            .flat_map(|a| (0..4).map(move |b| u64::from(a < b)))
            .sum();
        let mut hits = 0u64;
        for a in 0..4 {
            for b in 0..4 {
                let (_, t) = lt.evaluate(&[a, b], None).unwrap();
                hits += t.as_int() as u64;
            }
        }
        assert_eq!(hits, card);

        // Canonicalized operand order: a < b equals b > a.
        assert_eq!(lt, x2.greater_than(&x1).unwrap());
    }

    #[test]
    fn test_ev_plus_laws() {
        let d = Domain::bottom_up(&[3, 3]).unwrap();
        let f = d
            .new_forest(
                false,
                RangeType::Integer,
                EdgeLabeling::EvPlus,
                Policies::new(false),
            )
            .unwrap();
        let a = f.edge_for_variable(1, false, None).unwrap();
        let b = f.edge_for_variable(2, false, None).unwrap();
        let zero = f.constant(Terminal::Int(0)).unwrap();

        // plus(a, 0) = a
        assert_eq!(a.plus(&zero).unwrap(), a);
        // Associativity of plus.
        let ab = a.plus(&b).unwrap();
        let abz = ab.plus(&zero).unwrap();
        assert_eq!(abz, b.plus(&a).unwrap());
        // Union is the pointwise minimum.
        let u = a.union(&b).unwrap();
        for x in 0..3 {
            for y in 0..3 {
                let (v, _) = u.evaluate(&[x, y], None).unwrap();
                assert_eq!(v, EdgeValue::Plus((x.min(y)) as i64));
            }
        }
    }

    #[test]
    fn test_copy_between_reductions() {
        let d = Domain::bottom_up(&[2, 2, 2]).unwrap();
        let fully = d
            .new_forest(
                false,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(false),
            )
            .unwrap();
        let quasi = d
            .new_forest(
                false,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(false).with_reduction(ReductionRule::Quasi),
            )
            .unwrap();
        let a = fully
            .edge_from_minterms(&[vec![0, DONT_CARE, 1], vec![1, 0, 0]], None)
            .unwrap();
        let q = copy_to(&quasi, &a).unwrap();
        assert_eq!(q.cardinality(), a.cardinality());
        let back = copy_to(&fully, &q).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_lift_to_ev_plus() {
        let d = Domain::bottom_up(&[3, 3]).unwrap();
        let mt = d
            .new_forest(
                false,
                RangeType::Integer,
                EdgeLabeling::MultiTerminal,
                Policies::new(false),
            )
            .unwrap();
        let ev = d
            .new_forest(false, RangeType::Integer, EdgeLabeling::EvPlus, Policies::new(false))
            .unwrap();
        let x1 = mt.edge_for_variable(1, false, None).unwrap();
        let x2 = mt.edge_for_variable(2, false, None).unwrap();
        let sum = x1.plus(&x2).unwrap();
        let lifted = lift_to_ev_plus(&ev, &sum).unwrap();
        for a in 0..3 {
            for b in 0..3 {
                let (v, t) = lifted.evaluate(&[a, b], None).unwrap();
                if a + b == 0 {
                    // Integer 0 is the transparent terminal in the source.
                    assert!(!t.as_bool() || v == EdgeValue::Plus(0));
                } else {
                    assert_eq!(v, EdgeValue::Plus((a + b) as i64));
                }
            }
        }
    }

    #[test]
    fn test_cardinality() {
        let (_d, f) = bool_forest();
        let a = some_set(&f);
        assert_eq!(a.cardinality(), 4u32.into());
        assert_eq!(a.cardinality_real(), 4.0);
        let dc = f
            .edge_from_minterms(&[vec![DONT_CARE, 1, DONT_CARE]], None)
            .unwrap();
        assert_eq!(dc.cardinality(), 9u32.into());
    }
}
