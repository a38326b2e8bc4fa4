//! Saturation: depth-first reachability and the distance-annotated
//! transitive closure.
//!
//! The relation is split once into per-level events: for each level,
//! top down, the maximal sub-relation that is the identity above that
//! level is extracted by intersecting along the diagonal and taking the
//! difference. The split is cached in the relation forest, keyed by the
//! relation root.
//!
//! Saturation then works per node: children are fully saturated first,
//! and only then are this level's events fired, with a worklist (deque
//! plus waiting bitset) tracking which indices grew since their last
//! visit. `rec_fire` applies one event's sub-relation one level down and
//! saturates its result in turn, which is what makes the fixed point
//! converge locally instead of through global iteration.

use std::collections::VecDeque;
use std::rc::Rc;

use hashbrown::HashMap;
use log::debug;

use crate::apply::{self, BinaryOp};
use crate::bitset::BitSet;
use crate::edge::Edge;
use crate::error::{DdError, Result};
use crate::forest::{Forest, ForestInner, SplitCache};
use crate::image::check_image_args;
use crate::types::{
    plus_add, EdgeLabeling, EdgeValue, Level, NodeId, ReductionRule, PLUS_INFINITY,
};

/// Splits a relation into per-level events, caching the result in the
/// relation forest.
///
/// `by_level[k]` receives exactly the transitions whose top variable is
/// `k`; what remains after all levels is identity-only and is dropped.
pub(crate) fn split_relation(mxd: &mut ForestInner, root: NodeId) -> Result<()> {
    if let Some(cache) = &mxd.splits {
        if cache.root == root {
            return Ok(());
        }
    }
    mxd.drop_splits();

    let n = mxd.num_vars as usize;
    let mut by_level = vec![NodeId::TRANSPARENT; n + 1];
    let mut r = root;
    mxd.link(r);

    let split_level = |mxd: &mut ForestInner, r: &mut NodeId, k: usize| -> Result<NodeId> {
        let kl = Level::unprimed(k as u32);
        let kp = Level::primed(k as u32);
        let size = mxd.bound(kl);
        let ru = mxd.unpack_at(kl, *r);
        // Intersect along the diagonal.
        let mut diag = NodeId::TRANSPARENT;
        for i in 0..size {
            let rp = mxd.unpack_primed_at(kp, i, ru.d(i));
            let d = rp.d(i);
            if i == 0 {
                mxd.link(d);
                diag = d;
            } else {
                let next = match apply::mt_binary_rel(mxd, BinaryOp::Intersection, diag, d) {
                    Ok(x) => x,
                    Err(e) => {
                        mxd.unlink(diag);
                        return Err(e);
                    }
                };
                mxd.unlink(diag);
                diag = next;
            }
        }
        // Everything not below the diagonal tops out at this level.
        let events = match apply::mt_binary_rel(mxd, BinaryOp::Difference, *r, diag) {
            Ok(x) => x,
            Err(e) => {
                mxd.unlink(diag);
                return Err(e);
            }
        };
        mxd.unlink(*r);
        *r = diag;
        Ok(events)
    };

    for k in (1..=n).rev() {
        if r.is_transparent() {
            continue;
        }
        match split_level(mxd, &mut r, k) {
            Ok(events) => by_level[k] = events,
            Err(e) => {
                mxd.unlink(r);
                for h in by_level {
                    mxd.unlink(h);
                }
                return Err(e);
            }
        }
    }
    mxd.unlink(r);
    debug!(
        "split relation {}: events at {:?}",
        root,
        (1..=n).filter(|&k| !by_level[k].is_transparent()).collect::<Vec<_>>()
    );
    mxd.splits = Some(SplitCache { root, by_level });
    Ok(())
}

// ----------------------------------------------------------------------
// Set saturation (reachable states)
// ----------------------------------------------------------------------

struct Saturator<'a> {
    mdd: &'a mut ForestInner,
    mxd: &'a mut ForestInner,
    /// `(node, level) -> saturated node`, one reference held per entry.
    sat_memo: HashMap<(i64, u32), i64>,
    /// `(set node, relation node) -> fired node`, one reference each.
    fire_memo: HashMap<(i64, i64), i64>,
}

impl<'a> Saturator<'a> {
    fn events(&self, pos: u32) -> NodeId {
        self.mxd
            .splits
            .as_ref()
            .map(|s| s.by_level[pos as usize])
            .unwrap_or(NodeId::TRANSPARENT)
    }

    fn finish(mut self) {
        for (_, n) in self.sat_memo.drain() {
            self.mdd.unlink(NodeId::from_raw(n));
        }
        for (_, n) in self.fire_memo.drain() {
            self.mdd.unlink(NodeId::from_raw(n));
        }
    }

    /// Saturates `a` with every event of level `pos` and below.
    fn saturate_at(&mut self, mut pos: u32, a: NodeId) -> Result<NodeId> {
        if a.is_transparent() {
            return Ok(NodeId::TRANSPARENT);
        }
        // Event-free levels above the node commute with saturation.
        while pos > self.mdd.node_level(a).pos() && self.events(pos).is_transparent() {
            pos -= 1;
        }
        if pos == 0 {
            self.mdd.link(a);
            return Ok(a);
        }
        if let Some(&n) = self.sat_memo.get(&(a.raw(), pos)) {
            let n = NodeId::from_raw(n);
            self.mdd.link(n);
            return Ok(n);
        }

        let k = Level::unprimed(pos);
        let size = self.mdd.bound(k);
        let ra = self.mdd.unpack_at(k, a);
        let mut nb = self.mdd.new_builder(k);
        // Saturate below before firing this level's events.
        for i in 0..size {
            match self.saturate_at(pos - 1, ra.d(i)) {
                Ok(c) => nb.set_d(i, c),
                Err(e) => {
                    self.mdd.discard_builder(&nb);
                    return Err(e);
                }
            }
        }
        if let Err(e) = self.saturate_helper(pos, &mut nb) {
            self.mdd.discard_builder(&nb);
            return Err(e);
        }
        let (_, r) = self.mdd.reduce(-1, nb)?;
        self.mdd.link(r);
        self.sat_memo.insert((a.raw(), pos), r.raw());
        Ok(r)
    }

    /// Fires level-`pos` events on the builder until no index grows.
    fn saturate_helper(&mut self, pos: u32, nb: &mut crate::node::NodeBuilder) -> Result<()> {
        let events = self.events(pos);
        if events.is_transparent() {
            return Ok(());
        }
        let k = Level::unprimed(pos);
        let kp = Level::primed(pos);
        let size = self.mdd.bound(k);
        let ru = self.mxd.unpack_at(k, events);

        let mut queue = VecDeque::new();
        let mut waiting = BitSet::new(size);
        for i in 0..size {
            if !nb.d(i).is_transparent() && !ru.d(i).is_transparent() {
                queue.push_back(i);
                waiting.insert(i);
            }
        }

        while let Some(i) = queue.pop_front() {
            waiting.remove(i);
            if nb.d(i).is_transparent() {
                continue;
            }
            let rp = self.mxd.unpack_primed_at(kp, i, ru.d(i));
            for z in 0..rp.nnz() {
                let j = rp.idx(z);
                let n = self.rec_fire(nb.d(i), rp.d_at(z))?;
                if n.is_transparent() {
                    continue;
                }
                let old = nb.d(j);
                let u = apply::mt_binary_set(self.mdd, BinaryOp::Union, old, n)?;
                self.mdd.unlink(n);
                if u == old {
                    self.mdd.unlink(u);
                    continue;
                }
                self.mdd.unlink(old);
                nb.set_d(j, u);
                if !ru.d(j).is_transparent() && !waiting.contains(j) {
                    queue.push_back(j);
                    waiting.insert(j);
                }
            }
        }
        Ok(())
    }

    /// Applies one event's sub-relation to a sub-set, saturating the
    /// result.
    fn rec_fire(&mut self, q: NodeId, r: NodeId) -> Result<NodeId> {
        if q.is_transparent() || r.is_transparent() {
            return Ok(NodeId::TRANSPARENT);
        }
        if r.is_terminal() {
            match self.mxd.policies.reduction {
                ReductionRule::Identity => {
                    // Identity below: nothing more changes.
                    self.mdd.link(q);
                    return Ok(q);
                }
                ReductionRule::Fully => {
                    if self.mdd.policies.reduction == ReductionRule::Fully {
                        return Ok(self.mdd.terminal(crate::types::Terminal::Bool(true)));
                    }
                }
                ReductionRule::Quasi => {}
            }
            if q.is_terminal() {
                self.mdd.link(q);
                return Ok(q);
            }
        }
        if let Some(&n) = self.fire_memo.get(&(q.raw(), r.raw())) {
            let n = NodeId::from_raw(n);
            self.mdd.link(n);
            return Ok(n);
        }

        let pos = self
            .mdd
            .node_level(q)
            .pos()
            .max(self.mxd.node_level(r).pos());
        let k = Level::unprimed(pos);
        let kp = Level::primed(pos);
        let size = self.mdd.bound(k);
        let ra = self.mdd.unpack_at(k, q);
        let ru = self.mxd.unpack_at(k, r);
        let mut nb = self.mdd.new_builder(k);
        let mut fail = None;
        'rows: for i in 0..size {
            if ra.d(i).is_transparent() || ru.d(i).is_transparent() {
                continue;
            }
            let rp = self.mxd.unpack_primed_at(kp, i, ru.d(i));
            for z in 0..rp.nnz() {
                let j = rp.idx(z);
                let n = match self.rec_fire(ra.d(i), rp.d_at(z)) {
                    Ok(n) => n,
                    Err(e) => {
                        fail = Some(e);
                        break 'rows;
                    }
                };
                if n.is_transparent() {
                    continue;
                }
                let old = nb.d(j);
                match apply::mt_binary_set(self.mdd, BinaryOp::Union, old, n) {
                    Ok(u) => {
                        self.mdd.unlink(n);
                        self.mdd.unlink(old);
                        nb.set_d(j, u);
                    }
                    Err(e) => {
                        self.mdd.unlink(n);
                        fail = Some(e);
                        break 'rows;
                    }
                }
            }
        }
        if fail.is_none() {
            if let Err(e) = self.saturate_helper(pos, &mut nb) {
                fail = Some(e);
            }
        }
        if let Some(e) = fail {
            self.mdd.discard_builder(&nb);
            return Err(e);
        }
        let (_, res) = self.mdd.reduce(-1, nb)?;
        self.mdd.link(res);
        self.fire_memo.insert((q.raw(), r.raw()), res.raw());
        Ok(res)
    }
}

/// Least fixed point of the initial set under the relation, by
/// saturation.
pub fn reachable_states_dfs(init: &Edge, rel: &Edge) -> Result<Edge> {
    check_image_args(init, rel)?;
    let mut mdd = init.forest.borrow_mut();
    let mut mxd = rel.forest.borrow_mut();
    if let Some(lg) = mdd.logger.as_mut() {
        lg.phase_begin("saturation");
    }
    let result = split_relation(&mut mxd, rel.node).and_then(|()| {
        let mut sat = Saturator {
            mdd: &mut *mdd,
            mxd: &mut *mxd,
            sat_memo: HashMap::new(),
            fire_memo: HashMap::new(),
        };
        let top = sat.mdd.num_vars;
        let r = sat.saturate_at(top, init.node);
        sat.finish();
        r
    });
    if let Some(lg) = mdd.logger.as_mut() {
        lg.phase_end("saturation");
    }
    let node = result?;
    drop(mxd);
    drop(mdd);
    Ok(Edge::new(Rc::clone(&init.forest), EdgeValue::Void, node))
}

// ----------------------------------------------------------------------
// Transitive closure (distance-annotated saturation)
// ----------------------------------------------------------------------

struct TcSaturator<'a> {
    /// The EV+ relation forest holding the closure under construction.
    cf: &'a mut ForestInner,
    /// The multi-terminal relation forest holding the (split) events.
    rf: &'a mut ForestInner,
    sat_memo: HashMap<(i64, u32), (i64, i64)>,
    fire_memo: HashMap<(i64, i64), (i64, i64)>,
}

impl<'a> TcSaturator<'a> {
    fn events(&self, pos: u32) -> NodeId {
        self.rf
            .splits
            .as_ref()
            .map(|s| s.by_level[pos as usize])
            .unwrap_or(NodeId::TRANSPARENT)
    }

    fn finish(mut self) {
        for (_, (_, n)) in self.sat_memo.drain() {
            self.cf.unlink(NodeId::from_raw(n));
        }
        for (_, (_, n)) in self.fire_memo.drain() {
            self.cf.unlink(NodeId::from_raw(n));
        }
    }

    /// Saturates the closure node `b` (with distance `bev`) under all
    /// events of level `pos` and below.
    fn saturate_at(&mut self, pos: u32, bev: i64, b: NodeId) -> Result<(i64, NodeId)> {
        if b.is_transparent() {
            return Ok((PLUS_INFINITY, NodeId::TRANSPARENT));
        }
        if pos == 0 {
            return Ok((bev, b));
        }
        if let Some(&(rv, rn)) = self.sat_memo.get(&(b.raw(), pos)) {
            let rn = NodeId::from_raw(rn);
            self.cf.link(rn);
            return Ok((plus_add(bev, rv), rn));
        }

        let k = Level::unprimed(pos);
        let kp = Level::primed(pos);
        let size = self.cf.bound(k);
        let br = self.cf.unpack_at(k, b);
        let mut t = self.cf.new_builder(k);
        for i in 0..size {
            if br.d(i).is_transparent() {
                continue;
            }
            let dr = self.cf.unpack_primed_at(kp, i, br.d(i));
            let mut pnb = self.cf.new_builder(kp);
            let mut fail = None;
            for j in 0..size {
                if dr.d(j).is_transparent() {
                    continue;
                }
                let below = plus_add(br.ev(i).plus(), dr.ev(j).plus());
                match self.saturate_at(pos - 1, below, dr.d(j)) {
                    Ok((tv, tn)) => pnb.set(j, EdgeValue::Plus(tv), tn),
                    Err(e) => {
                        fail = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = fail {
                self.cf.discard_builder(&pnb);
                self.cf.discard_builder(&t);
                return Err(e);
            }
            match self.cf.reduce(i as i32, pnb) {
                Ok((pev, p)) => t.set(i, pev, p),
                Err(e) => {
                    self.cf.discard_builder(&t);
                    return Err(e);
                }
            }
        }
        if let Err(e) = self.tc_helper(pos, &mut t) {
            self.cf.discard_builder(&t);
            return Err(e);
        }
        let (cev, c) = self.cf.reduce(-1, t)?;
        self.cf.link(c);
        self.sat_memo.insert((b.raw(), pos), (cev.plus(), c.raw()));
        Ok((plus_add(bev, cev.plus()), c))
    }

    /// Fires level-`pos` events on the builder's rows, adding one step
    /// per firing and keeping the pointwise minimum distance.
    fn tc_helper(&mut self, pos: u32, t: &mut crate::node::NodeBuilder) -> Result<()> {
        let events = self.events(pos);
        if events.is_transparent() {
            return Ok(());
        }
        let k = Level::unprimed(pos);
        let kp = Level::primed(pos);
        let size = self.cf.bound(k);
        let ru = self.rf.unpack_at(k, events);

        for i in 0..size {
            if t.d(i).is_transparent() {
                continue;
            }
            let dr = self.cf.unpack_primed_at(kp, i, t.d(i));
            // Mutable row of destinations, with one reference per entry.
            let mut row: Vec<(i64, NodeId)> = (0..size)
                .map(|j| {
                    let d = dr.d(j);
                    self.cf.link(d);
                    (dr.ev(j).plus(), d)
                })
                .collect();

            let result = self.fire_row(size, kp, &ru, &mut row);
            if let Err(e) = result {
                for (_, d) in row {
                    self.cf.unlink(d);
                }
                return Err(e);
            }

            let mut pnb = self.cf.new_builder(kp);
            for (j, (v, d)) in row.into_iter().enumerate() {
                pnb.set(j, EdgeValue::Plus(v), d);
            }
            let (pev, p) = self.cf.reduce(i as i32, pnb)?;
            let old = t.d(i);
            let old_v = t.ev(i).plus();
            self.cf.unlink(old);
            t.set(i, EdgeValue::Plus(plus_add(old_v, pev.plus())), p);
        }
        Ok(())
    }

    fn fire_row(
        &mut self,
        size: usize,
        kp: Level,
        ru: &crate::node::NodeReader,
        row: &mut [(i64, NodeId)],
    ) -> Result<()> {
        let mut queue = VecDeque::new();
        let mut waiting = BitSet::new(size);
        for (j, (_, d)) in row.iter().enumerate() {
            if !d.is_transparent() && !ru.d(j).is_transparent() {
                queue.push_back(j);
                waiting.insert(j);
            }
        }
        while let Some(j) = queue.pop_front() {
            waiting.remove(j);
            if row[j].1.is_transparent() {
                continue;
            }
            let rp = self.rf.unpack_primed_at(kp, j, ru.d(j));
            for z in 0..rp.nnz() {
                let jp = rp.idx(z);
                let (rv, rec) = self.rec_fire(row[j].0, row[j].1, rp.d_at(z))?;
                if rec.is_transparent() {
                    continue;
                }
                // One more step from origin to the new destination.
                let rv = plus_add(rv, 1);
                let (ov, old) = row[jp];
                let (uv, u) = apply::ev_plus_union_rel(self.cf, ov, old, rv, rec)?;
                self.cf.unlink(rec);
                if u == old && uv == ov {
                    self.cf.unlink(u);
                    continue;
                }
                self.cf.unlink(old);
                row[jp] = (uv, u);
                if !ru.d(jp).is_transparent() && !waiting.contains(jp) {
                    queue.push_back(jp);
                    waiting.insert(jp);
                }
            }
        }
        Ok(())
    }

    /// Applies an event's sub-relation to a sub-closure, saturating the
    /// result; distances are carried, the +1 per firing is added by the
    /// caller.
    fn rec_fire(&mut self, bev: i64, b: NodeId, r: NodeId) -> Result<(i64, NodeId)> {
        if b.is_transparent() || r.is_transparent() {
            return Ok((PLUS_INFINITY, NodeId::TRANSPARENT));
        }
        if r.is_terminal() {
            // Identity below: destinations unchanged.
            self.cf.link(b);
            return Ok((bev, b));
        }
        if let Some(&(rv, rn)) = self.fire_memo.get(&(b.raw(), r.raw())) {
            let rn = NodeId::from_raw(rn);
            self.cf.link(rn);
            return Ok((plus_add(bev, rv), rn));
        }

        let pos = self
            .cf
            .node_level(b)
            .pos()
            .max(self.rf.node_level(r).pos());
        let k = Level::unprimed(pos);
        let kp = Level::primed(pos);
        let size = self.cf.bound(k);
        let br = self.cf.unpack_at(k, b);
        let ru = self.rf.unpack_at(k, r);
        let mut t = self.cf.new_builder(k);
        for i in 0..size {
            if br.d(i).is_transparent() {
                continue;
            }
            let dr = self.cf.unpack_primed_at(kp, i, br.d(i));
            let mut pnb = self.cf.new_builder(kp);
            let mut fail = None;
            'cols: for ip in 0..size {
                if dr.d(ip).is_transparent() || ru.d(ip).is_transparent() {
                    continue;
                }
                let rp = self.rf.unpack_primed_at(kp, ip, ru.d(ip));
                for z in 0..rp.nnz() {
                    let jp = rp.idx(z);
                    let below = plus_add(br.ev(i).plus(), dr.ev(ip).plus());
                    let (nv, n) = match self.rec_fire(below, dr.d(ip), rp.d_at(z)) {
                        Ok(x) => x,
                        Err(e) => {
                            fail = Some(e);
                            break 'cols;
                        }
                    };
                    if n.is_transparent() {
                        continue;
                    }
                    let (ov, old) = (pnb.ev(jp).plus(), pnb.d(jp));
                    match apply::ev_plus_union_rel(self.cf, ov, old, nv, n) {
                        Ok((uv, u)) => {
                            self.cf.unlink(n);
                            self.cf.unlink(old);
                            pnb.set(jp, EdgeValue::Plus(uv), u);
                        }
                        Err(e) => {
                            self.cf.unlink(n);
                            fail = Some(e);
                            break 'cols;
                        }
                    }
                }
            }
            if let Some(e) = fail {
                self.cf.discard_builder(&pnb);
                self.cf.discard_builder(&t);
                return Err(e);
            }
            match self.cf.reduce(i as i32, pnb) {
                Ok((pev, p)) => t.set(i, pev, p),
                Err(e) => {
                    self.cf.discard_builder(&t);
                    return Err(e);
                }
            }
        }
        if let Err(e) = self.tc_helper(pos, &mut t) {
            self.cf.discard_builder(&t);
            return Err(e);
        }
        let (cev, c) = self.cf.reduce(-1, t)?;
        self.cf.link(c);
        self.fire_memo
            .insert((b.raw(), r.raw()), (cev.plus(), c.raw()));
        Ok((plus_add(bev, cev.plus()), c))
    }
}

/// Distance-annotated reachability: the returned EV+ relation maps each
/// pair (s, t) to the minimum number of relation steps from s to t
/// (0 on the diagonal, absent when unreachable).
pub fn transitive_closure(rel: &Edge, closure: &Forest) -> Result<Edge> {
    {
        let r = rel.forest.borrow();
        let c = closure.inner.borrow();
        if r.domain_id != c.domain_id {
            return Err(DdError::DomainMismatch);
        }
        if !r.relation || !c.relation {
            return Err(DdError::TypeMismatch);
        }
        if r.labeling != EdgeLabeling::MultiTerminal || c.labeling != EdgeLabeling::EvPlus {
            return Err(DdError::TypeMismatch);
        }
        // The algorithm leans on identity skips in both forests.
        if r.policies.reduction != ReductionRule::Identity
            || c.policies.reduction != ReductionRule::Identity
        {
            return Err(DdError::NotImplemented);
        }
    }
    let mut cf = closure.inner.borrow_mut();
    let mut rf = rel.forest.borrow_mut();
    if let Some(lg) = cf.logger.as_mut() {
        lg.phase_begin("transitive-closure");
    }
    let result = split_relation(&mut rf, rel.node).and_then(|()| {
        let mut tc = TcSaturator {
            cf: &mut *cf,
            rf: &mut *rf,
            sat_memo: HashMap::new(),
            fire_memo: HashMap::new(),
        };
        let top = tc.cf.num_vars;
        // The identity relation at distance 0 is the seed.
        let omega = tc.cf.omega();
        let r = tc.saturate_at(top, 0, omega);
        tc.finish();
        r
    });
    if let Some(lg) = cf.logger.as_mut() {
        lg.phase_end("transitive-closure");
    }
    let (value, node) = result?;
    drop(rf);
    drop(cf);
    Ok(Edge::new(
        Rc::clone(&closure.inner),
        EdgeValue::Plus(value),
        node,
    ))
}
