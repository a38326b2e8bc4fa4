//! Relational operations: pre/post image, breadth-first reachability,
//! cross product, and EV+ matrix multiplies.
//!
//! These operate across two forests (a set forest and a relation forest
//! on the same domain), so their memoization lives in per-invocation
//! tables: every entry's operands are pinned by the operation's own
//! references for exactly as long as the table exists, which keeps the
//! compute-table validity contract without cross-forest cache counts.

use std::rc::Rc;

use hashbrown::HashMap;
use log::debug;

use crate::apply::{self, BinaryOp};
use crate::edge::Edge;
use crate::error::{DdError, Result};
use crate::forest::{Forest, ForestInner};
use crate::types::{
    plus_add, EdgeLabeling, EdgeValue, Level, NodeId, RangeType, Terminal, PLUS_INFINITY,
};

/// Checks a (set, relation) operand pair for the boolean image
/// operations.
pub(crate) fn check_image_args(set: &Edge, rel: &Edge) -> Result<()> {
    let s = set.forest.borrow();
    let r = rel.forest.borrow();
    if s.domain_id != r.domain_id {
        return Err(DdError::DomainMismatch);
    }
    if s.relation || !r.relation {
        return Err(DdError::TypeMismatch);
    }
    if s.labeling != EdgeLabeling::MultiTerminal
        || r.labeling != EdgeLabeling::MultiTerminal
        || s.range != RangeType::Boolean
        || r.range != RangeType::Boolean
    {
        return Err(DdError::TypeMismatch);
    }
    Ok(())
}

enum Direction {
    Forward,
    Backward,
}

struct ImageOp<'a> {
    mdd: &'a mut ForestInner,
    mxd: &'a ForestInner,
    memo: HashMap<(i64, i64), i64>,
    direction: Direction,
}

impl<'a> ImageOp<'a> {
    fn new(mdd: &'a mut ForestInner, mxd: &'a ForestInner, direction: Direction) -> Self {
        ImageOp {
            mdd,
            mxd,
            memo: HashMap::new(),
            direction,
        }
    }

    /// Releases the references pinned by the memo table.
    fn finish(mut self) {
        for (_, n) in self.memo.drain() {
            self.mdd.unlink(NodeId::from_raw(n));
        }
    }

    fn compute(&mut self, a: NodeId, r: NodeId) -> Result<NodeId> {
        if a.is_transparent() || r.is_transparent() {
            return Ok(NodeId::TRANSPARENT);
        }
        if r.is_terminal() {
            match self.mxd.policies.reduction {
                crate::types::ReductionRule::Identity => {
                    // The skipped remainder is the identity relation.
                    self.mdd.link(a);
                    return Ok(a);
                }
                crate::types::ReductionRule::Fully => {
                    // The skipped remainder relates everything.
                    if self.mdd.policies.reduction == crate::types::ReductionRule::Fully {
                        return Ok(self.mdd.terminal(Terminal::Bool(true)));
                    }
                }
                crate::types::ReductionRule::Quasi => {}
            }
        }
        if a.is_terminal() && r.is_terminal() {
            let t = self.mdd.terminal_value(a).as_bool();
            return Ok(self.mdd.terminal(Terminal::Bool(t)));
        }
        if let Some(&n) = self.memo.get(&(a.raw(), r.raw())) {
            let n = NodeId::from_raw(n);
            self.mdd.link(n);
            return Ok(n);
        }

        let pos = self.mdd.node_level(a).pos().max(self.mxd.node_level(r).pos());
        let k = Level::unprimed(pos);
        let kp = Level::primed(pos);
        let size = self.mdd.bound(k);
        let av = self.mdd.unpack_at(k, a);
        let ru = self.mxd.unpack_at(k, r);
        let mut nb = self.mdd.new_builder(k);
        let mut fail = None;
        'rows: for i in 0..size {
            if ru.d(i).is_transparent() {
                continue;
            }
            let rp = self.mxd.unpack_primed_at(kp, i, ru.d(i));
            for z in 0..rp.nnz() {
                let j = rp.idx(z);
                // Forward: fire i -> j; backward: collect j -> i.
                let (src, dst) = match self.direction {
                    Direction::Forward => (i, j),
                    Direction::Backward => (j, i),
                };
                if av.d(src).is_transparent() {
                    continue;
                }
                let n = match self.compute(av.d(src), rp.d_at(z)) {
                    Ok(n) => n,
                    Err(e) => {
                        fail = Some(e);
                        break 'rows;
                    }
                };
                if n.is_transparent() {
                    continue;
                }
                let old = nb.d(dst);
                match apply::mt_binary_set(self.mdd, BinaryOp::Union, old, n) {
                    Ok(u) => {
                        self.mdd.unlink(n);
                        self.mdd.unlink(old);
                        nb.set_d(dst, u);
                    }
                    Err(e) => {
                        self.mdd.unlink(n);
                        fail = Some(e);
                        break 'rows;
                    }
                }
            }
        }
        if let Some(e) = fail {
            self.mdd.discard_builder(&nb);
            return Err(e);
        }
        let (_, res) = self.mdd.reduce(-1, nb)?;
        self.mdd.link(res);
        self.memo.insert((a.raw(), r.raw()), res.raw());
        Ok(res)
    }
}

/// States reachable in one step of the relation.
pub fn post_image(set: &Edge, rel: &Edge) -> Result<Edge> {
    image(set, rel, Direction::Forward)
}

/// States that reach the set in one step of the relation.
pub fn pre_image(set: &Edge, rel: &Edge) -> Result<Edge> {
    image(set, rel, Direction::Backward)
}

fn image(set: &Edge, rel: &Edge, direction: Direction) -> Result<Edge> {
    check_image_args(set, rel)?;
    let mut mdd = set.forest.borrow_mut();
    let mxd = rel.forest.borrow();
    let mut op = ImageOp::new(&mut *mdd, &*mxd, direction);
    let result = op.compute(set.node, rel.node);
    op.finish();
    let node = result?;
    drop(mxd);
    drop(mdd);
    Ok(Edge::new(Rc::clone(&set.forest), EdgeValue::Void, node))
}

/// Least fixed point of the union with the post-image, by traditional
/// breadth-first iteration.
pub fn reachable_states_bfs(init: &Edge, rel: &Edge) -> Result<Edge> {
    check_image_args(init, rel)?;
    let mut mdd = init.forest.borrow_mut();
    let mxd = rel.forest.borrow();
    if let Some(lg) = mdd.logger.as_mut() {
        lg.phase_begin("reachable-bfs");
    }
    let mut op = ImageOp::new(&mut *mdd, &*mxd, Direction::Forward);
    let mut current = init.node;
    op.mdd.link(current);
    let result = loop {
        let step = match op.compute(current, rel.node) {
            Ok(s) => s,
            Err(e) => {
                op.mdd.unlink(current);
                break Err(e);
            }
        };
        let next = match apply::mt_binary_set(op.mdd, BinaryOp::Union, current, step) {
            Ok(u) => {
                op.mdd.unlink(step);
                u
            }
            Err(e) => {
                op.mdd.unlink(step);
                op.mdd.unlink(current);
                break Err(e);
            }
        };
        if next == current {
            op.mdd.unlink(next);
            break Ok(current);
        }
        debug!("bfs step: {} -> {}", current, next);
        op.mdd.unlink(current);
        current = next;
    };
    op.finish();
    if let Some(lg) = mdd.logger.as_mut() {
        lg.phase_end("reachable-bfs");
    }
    let node = result?;
    drop(mxd);
    drop(mdd);
    Ok(Edge::new(Rc::clone(&init.forest), EdgeValue::Void, node))
}

// ----------------------------------------------------------------------
// Cross product
// ----------------------------------------------------------------------

fn cross_rec(
    src: &ForestInner,
    dst: &mut ForestInner,
    a: NodeId,
    b: NodeId,
    memo: &mut HashMap<(i64, i64), i64>,
) -> Result<NodeId> {
    if a.is_transparent() || b.is_transparent() {
        return Ok(NodeId::TRANSPARENT);
    }
    if a.is_terminal() && b.is_terminal() {
        return Ok(dst.terminal(Terminal::Bool(true)));
    }
    if let Some(&n) = memo.get(&(a.raw(), b.raw())) {
        let n = NodeId::from_raw(n);
        dst.link(n);
        return Ok(n);
    }
    let pos = src.node_level(a).pos().max(src.node_level(b).pos());
    let k = Level::unprimed(pos);
    let kp = Level::primed(pos);
    let size = src.bound(k);
    let ra = src.unpack_at(k, a);
    let rb = src.unpack_at(k, b);
    let mut nb = dst.new_builder(k);
    for i in 0..size {
        if ra.d(i).is_transparent() {
            continue;
        }
        let mut pnb = dst.new_builder(kp);
        let mut fail = None;
        for j in 0..size {
            if rb.d(j).is_transparent() {
                continue;
            }
            match cross_rec(src, dst, ra.d(i), rb.d(j), memo) {
                Ok(c) => pnb.set_d(j, c),
                Err(e) => {
                    fail = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = fail {
            dst.discard_builder(&pnb);
            dst.discard_builder(&nb);
            return Err(e);
        }
        match dst.reduce(i as i32, pnb) {
            Ok((_, p)) => nb.set_d(i, p),
            Err(e) => {
                dst.discard_builder(&nb);
                return Err(e);
            }
        }
    }
    let (_, r) = dst.reduce(-1, nb)?;
    dst.link(r);
    memo.insert((a.raw(), b.raw()), r.raw());
    Ok(r)
}

/// The relation `rows × cols`: pairs (x, y) with x in `rows` and y in
/// `cols`. Both operands live in one set forest; the result lands in
/// `target`, a relation forest on the same domain.
pub fn cross_product(rows: &Edge, cols: &Edge, target: &Forest) -> Result<Edge> {
    if !Rc::ptr_eq(&rows.forest, &cols.forest) {
        return Err(DdError::ForestMismatch);
    }
    {
        let s = rows.forest.borrow();
        let t = target.inner.borrow();
        if s.domain_id != t.domain_id {
            return Err(DdError::DomainMismatch);
        }
        if s.relation
            || !t.relation
            || s.labeling != EdgeLabeling::MultiTerminal
            || t.labeling != EdgeLabeling::MultiTerminal
            || s.range != RangeType::Boolean
            || t.range != RangeType::Boolean
        {
            return Err(DdError::TypeMismatch);
        }
    }
    let src = rows.forest.borrow();
    let mut dst = target.inner.borrow_mut();
    let mut memo = HashMap::new();
    let result = cross_rec(&src, &mut dst, rows.node, cols.node, &mut memo);
    for (_, n) in memo.drain() {
        dst.unlink(NodeId::from_raw(n));
    }
    let node = result?;
    drop(dst);
    drop(src);
    Ok(Edge::new(
        Rc::clone(&target.inner),
        EdgeValue::Void,
        node,
    ))
}

// ----------------------------------------------------------------------
// EV+ matrix multiplies (min-plus algebra)
// ----------------------------------------------------------------------

fn check_linear_args(vec: &Edge, mat: &Edge) -> Result<()> {
    let v = vec.forest.borrow();
    let m = mat.forest.borrow();
    if v.domain_id != m.domain_id {
        return Err(DdError::DomainMismatch);
    }
    if v.relation || !m.relation {
        return Err(DdError::TypeMismatch);
    }
    if v.labeling != EdgeLabeling::EvPlus || m.labeling != EdgeLabeling::EvPlus {
        return Err(DdError::NotImplemented);
    }
    Ok(())
}

struct LinearOp<'a> {
    vec: &'a mut ForestInner,
    mat: &'a ForestInner,
    memo: HashMap<(i64, i64), (i64, i64)>,
    /// Forward: y[i] = min_j (M[i][j] + v[j]). Backward: y[j] = min_i
    /// (v[i] + M[i][j]).
    forward: bool,
}

impl<'a> LinearOp<'a> {
    fn finish(mut self) {
        for (_, (_, n)) in self.memo.drain() {
            self.vec.unlink(NodeId::from_raw(n));
        }
    }

    fn compute(&mut self, mv: i64, m: NodeId, vv: i64, v: NodeId) -> Result<(i64, NodeId)> {
        if m.is_transparent() || v.is_transparent() {
            return Ok((PLUS_INFINITY, NodeId::TRANSPARENT));
        }
        if m.is_terminal() && self.mat.policies.reduction == crate::types::ReductionRule::Identity {
            // Identity matrix with a constant offset.
            self.vec.link(v);
            return Ok((plus_add(mv, vv), v));
        }
        if m.is_terminal() && v.is_terminal() {
            return Ok((plus_add(mv, vv), v));
        }
        let base = plus_add(mv, vv);
        if let Some(&(rv, r)) = self.memo.get(&(m.raw(), v.raw())) {
            let r = NodeId::from_raw(r);
            self.vec.link(r);
            return Ok((plus_add(base, rv), r));
        }

        let pos = self.vec.node_level(v).pos().max(self.mat.node_level(m).pos());
        let k = Level::unprimed(pos);
        let kp = Level::primed(pos);
        let size = self.vec.bound(k);
        let mr = self.mat.unpack_at(k, m);
        let vr = self.vec.unpack_at(k, v);
        let mut acc: Vec<(i64, NodeId)> = vec![(PLUS_INFINITY, NodeId::TRANSPARENT); size];
        let mut fail = None;
        'rows: for i in 0..size {
            if mr.d(i).is_transparent() {
                continue;
            }
            let mp = self.mat.unpack_primed_at(kp, i, mr.d(i));
            for z in 0..mp.nnz() {
                let j = mp.idx(z);
                let entry = plus_add(mr.ev(i).plus(), mp.ev_at(z).plus());
                let (src, dst) = if self.forward { (j, i) } else { (i, j) };
                if vr.d(src).is_transparent() {
                    continue;
                }
                let step = self.compute(
                    entry,
                    mp.d_at(z),
                    vr.ev(src).plus(),
                    vr.d(src),
                );
                let (nv, n) = match step {
                    Ok(r) => r,
                    Err(e) => {
                        fail = Some(e);
                        break 'rows;
                    }
                };
                if n.is_transparent() {
                    continue;
                }
                let (ov, old) = acc[dst];
                match apply::ev_plus_union(self.vec, ov, old, nv, n) {
                    Ok((uv, u)) => {
                        self.vec.unlink(n);
                        self.vec.unlink(old);
                        acc[dst] = (uv, u);
                    }
                    Err(e) => {
                        self.vec.unlink(n);
                        fail = Some(e);
                        break 'rows;
                    }
                }
            }
        }
        if fail.is_none() {
            let mut nb = self.vec.new_builder(k);
            for (i, (av, an)) in acc.iter().enumerate() {
                nb.set(i, EdgeValue::Plus(*av), *an);
            }
            let (carry, r) = self.vec.reduce(-1, nb)?;
            self.vec.link(r);
            self.memo.insert((m.raw(), v.raw()), (carry.plus(), r.raw()));
            return Ok((plus_add(base, carry.plus()), r));
        }
        for (_, an) in acc {
            self.vec.unlink(an);
        }
        Err(fail.unwrap())
    }
}

/// Min-plus matrix-vector product: `y[i] = min_j (M[i][j] + v[j])`.
pub fn mat_vec_multiply(mat: &Edge, vec: &Edge) -> Result<Edge> {
    check_linear_args(vec, mat)?;
    linear(mat, vec, true)
}

/// Min-plus vector-matrix product: `y[j] = min_i (v[i] + M[i][j])`.
pub fn vec_mat_multiply(vec: &Edge, mat: &Edge) -> Result<Edge> {
    check_linear_args(vec, mat)?;
    linear(mat, vec, false)
}

fn linear(mat: &Edge, vec: &Edge, forward: bool) -> Result<Edge> {
    let mut vf = vec.forest.borrow_mut();
    let mf = mat.forest.borrow();
    let mut op = LinearOp {
        vec: &mut *vf,
        mat: &*mf,
        memo: HashMap::new(),
        forward,
    };
    let result = op.compute(mat.value.plus(), mat.node, vec.value.plus(), vec.node);
    op.finish();
    let (value, node) = result?;
    drop(mf);
    drop(vf);
    Ok(Edge::new(
        Rc::clone(&vec.forest),
        EdgeValue::Plus(value),
        node,
    ))
}
