//! Top-level edge handles.
//!
//! An [`Edge`] is the user's reference to a function: an (edge-value,
//! node) pair plus a handle on the owning forest. Construction links the
//! node, cloning links again, and dropping unlinks, so the forest's
//! incoming counts always account for every live `Edge`.

use std::cell::RefCell;
use std::rc::Rc;

use num_bigint::BigUint;

use crate::apply::{self, BinaryOp};
use crate::enumerator::MintermIterator;
use crate::error::{DdError, Result};
use crate::forest::{Forest, ForestInner};
use crate::types::{EdgeValue, Level, NodeId, RangeType, Terminal};

/// A reference-counted handle to one function in a forest.
pub struct Edge {
    pub(crate) forest: Rc<RefCell<ForestInner>>,
    pub(crate) value: EdgeValue,
    pub(crate) node: NodeId,
}

impl Edge {
    /// Wraps an (edge-value, node) pair whose incoming reference is
    /// transferred to the new handle.
    pub(crate) fn new(forest: Rc<RefCell<ForestInner>>, value: EdgeValue, node: NodeId) -> Edge {
        Edge {
            forest,
            value,
            node,
        }
    }

    pub fn forest(&self) -> Forest {
        Forest {
            inner: Rc::clone(&self.forest),
        }
    }

    pub fn value(&self) -> EdgeValue {
        self.value
    }

    pub(crate) fn node(&self) -> NodeId {
        self.node
    }

    /// True for the edge of the constant transparent function (the empty
    /// set, for boolean forests).
    pub fn is_transparent(&self) -> bool {
        self.node.is_transparent()
    }

    /// The level of the target node (terminal edges are at level 0).
    pub fn level(&self) -> Level {
        self.forest.borrow().node_level(self.node)
    }

    /// Number of non-terminal nodes reachable from this edge.
    pub fn node_count(&self) -> usize {
        self.forest.borrow().reachable_count(self.node)
    }

    /// Exact number of assignments this edge maps to a non-transparent
    /// value.
    pub fn cardinality(&self) -> BigUint {
        apply::cardinality(self)
    }

    /// Floating-point cardinality approximation.
    pub fn cardinality_real(&self) -> f64 {
        apply::cardinality_real(self)
    }

    /// Evaluates the function on one assignment. `un[p]` is the value of
    /// the variable at position `p + 1`; `pr` must be given iff this is a
    /// relation forest.
    pub fn evaluate(&self, un: &[i32], pr: Option<&[i32]>) -> Result<(EdgeValue, Terminal)> {
        let f = self.forest.borrow();
        if un.len() != f.num_vars as usize || pr.is_some() != f.relation {
            return Err(DdError::InvalidArgument);
        }
        if let Some(pr) = pr {
            if pr.len() != f.num_vars as usize {
                return Err(DdError::InvalidArgument);
            }
        }
        let fetch = |level: Level| -> Result<usize> {
            let p = (level.pos() - 1) as usize;
            let v = if level.is_primed() { pr.unwrap()[p] } else { un[p] };
            if v < 0 || v as usize >= f.bound(level) {
                return Err(DdError::InvalidAssignment);
            }
            Ok(v as usize)
        };

        let transparent = |f: &ForestInner| {
            (
                EdgeValue::transparent(f.labeling),
                f.terminal_value(NodeId::TRANSPARENT),
            )
        };
        let mut value = self.value;
        let mut node = self.node;
        let mut rank = Level::unprimed(f.num_vars).rank();
        while rank > 0 {
            let level = level_from_rank(rank, f.relation);
            rank -= if f.relation { 1 } else { 2 };
            let Some(l) = level else { continue };
            if node.is_terminal() || f.node_level(node) != l {
                // Skipped level: redundant, or identity on the pair.
                if l.is_primed() && f.policies.reduction == crate::types::ReductionRule::Identity {
                    let i = fetch(l.unprime())?;
                    let j = fetch(l)?;
                    if i != j {
                        return Ok(transparent(&f));
                    }
                } else {
                    fetch(l)?;
                }
                continue;
            }
            let r = f.unpack(node);
            let i = fetch(l)?;
            value = crate::forest::combine(f.labeling, value, r.ev(i));
            node = r.d(i);
            if node.is_transparent() {
                return Ok(transparent(&f));
            }
        }
        Ok((value, f.terminal_value(node)))
    }

    /// Lazy enumeration of the tuples this edge encodes.
    pub fn minterms(&self) -> MintermIterator<'_> {
        MintermIterator::over(self, None, None)
    }

    /// Enumeration restricted to one row of a relation.
    pub fn minterms_fixed_row(&self, row: Vec<i32>) -> MintermIterator<'_> {
        MintermIterator::over(self, Some(row), None)
    }

    /// Enumeration restricted to one column of a relation.
    pub fn minterms_fixed_column(&self, col: Vec<i32>) -> MintermIterator<'_> {
        MintermIterator::over(self, None, Some(col))
    }

    fn binary(&self, op: BinaryOp, rhs: &Edge) -> Result<Edge> {
        apply::apply_binary(op, self, rhs)
    }

    pub fn union(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::Union, rhs)
    }

    pub fn intersection(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::Intersection, rhs)
    }

    pub fn difference(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::Difference, rhs)
    }

    pub fn min_with(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::Min, rhs)
    }

    pub fn max_with(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::Max, rhs)
    }

    pub fn plus(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::Plus, rhs)
    }

    pub fn minus(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::Minus, rhs)
    }

    pub fn times(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::Times, rhs)
    }

    pub fn divide(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::Divide, rhs)
    }

    pub fn equal(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::Equal, rhs)
    }

    pub fn not_equal(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::NotEqual, rhs)
    }

    pub fn less_than(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::LessThan, rhs)
    }

    pub fn less_or_equal(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::LessOrEqual, rhs)
    }

    pub fn greater_than(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::GreaterThan, rhs)
    }

    pub fn greater_or_equal(&self, rhs: &Edge) -> Result<Edge> {
        self.binary(BinaryOp::GreaterOrEqual, rhs)
    }

    pub fn complement(&self) -> Result<Edge> {
        apply::complement(self)
    }

    /// Smallest value this function takes.
    pub fn min_range(&self) -> Result<Terminal> {
        apply::min_range(self)
    }

    /// Largest value this function takes.
    pub fn max_range(&self) -> Result<Terminal> {
        apply::max_range(self)
    }
}

impl Clone for Edge {
    fn clone(&self) -> Edge {
        self.forest.borrow_mut().link(self.node);
        Edge {
            forest: Rc::clone(&self.forest),
            value: self.value,
            node: self.node,
        }
    }
}

impl Drop for Edge {
    fn drop(&mut self) {
        self.forest.borrow_mut().unlink(self.node);
    }
}

impl PartialEq for Edge {
    /// Two handles compare equal iff they point at the same (value,
    /// node) pair in the same forest; by canonicity this coincides with
    /// function equality.
    fn eq(&self, other: &Edge) -> bool {
        Rc::ptr_eq(&self.forest, &other.forest)
            && self.node == other.node
            && self.value.close_to(other.value)
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Edge({:?}, {})", self.value, self.node)
    }
}

fn bool_range(e: &Edge) -> bool {
    e.forest.borrow().range == RangeType::Boolean
}

macro_rules! edge_operator {
    ($trait:ident, $method:ident, $bool_op:ident, $num_op:ident) => {
        impl std::ops::$trait for &Edge {
            type Output = Edge;

            fn $method(self, rhs: &Edge) -> Edge {
                let op = if bool_range(self) {
                    BinaryOp::$bool_op
                } else {
                    BinaryOp::$num_op
                };
                match self.binary(op, rhs) {
                    Ok(e) => e,
                    Err(err) => panic!("edge operator {:?} failed: {}", op, err),
                }
            }
        }
    };
}

edge_operator!(Add, add, Union, Plus);
edge_operator!(Sub, sub, Difference, Minus);
edge_operator!(Mul, mul, Intersection, Times);
edge_operator!(BitOr, bitor, Union, Union);
edge_operator!(BitAnd, bitand, Intersection, Intersection);

impl Forest {
    /// The edge of a constant function; for boolean forests,
    /// `constant(true)` is the full set and `constant(false)` the empty
    /// one.
    pub fn constant(&self, t: Terminal) -> Result<Edge> {
        let (ev, node) = self.inner.borrow_mut().constant(t)?;
        Ok(Edge::new(Rc::clone(&self.inner), ev, node))
    }

    /// The empty (transparent) edge.
    pub fn transparent(&self) -> Edge {
        let (ev, node) = self.inner.borrow().transparent_edge();
        Edge::new(Rc::clone(&self.inner), ev, node)
    }

    /// Builds an edge from a batch of set minterms (with optional terminal
    /// values, defaulting to `true`).
    pub fn edge_from_minterms(
        &self,
        minterms: &[Vec<i32>],
        terms: Option<&[Terminal]>,
    ) -> Result<Edge> {
        self.edge_from_minterms_impl(minterms, None, terms)
    }

    /// Builds a relation edge from parallel unprimed/primed minterms.
    pub fn edge_from_relation_minterms(
        &self,
        rows: &[Vec<i32>],
        cols: &[Vec<i32>],
        terms: Option<&[Terminal]>,
    ) -> Result<Edge> {
        if rows.len() != cols.len() {
            return Err(DdError::InvalidArgument);
        }
        self.edge_from_minterms_impl(rows, Some(cols), terms)
    }

    fn edge_from_minterms_impl(
        &self,
        un: &[Vec<i32>],
        pr: Option<&[Vec<i32>]>,
        terms: Option<&[Terminal]>,
    ) -> Result<Edge> {
        if let Some(terms) = terms {
            if terms.len() != un.len() {
                return Err(DdError::InvalidArgument);
            }
        }
        let mut inner = self.inner.borrow_mut();
        let (mut ev, mut acc) = inner.transparent_edge();
        for (m, row) in un.iter().enumerate() {
            let term = terms.map(|t| t[m]).unwrap_or(Terminal::Bool(true));
            let path = inner.minterm_edge(row, pr.map(|p| p[m].as_slice()), term);
            let (pev, pnode) = match path {
                Ok(p) => p,
                Err(e) => {
                    inner.unlink(acc);
                    return Err(e);
                }
            };
            match apply::accumulate(&mut inner, (ev, acc), (pev, pnode)) {
                Ok((nev, nnode)) => {
                    ev = nev;
                    acc = nnode;
                }
                Err(e) => {
                    inner.unlink(acc);
                    inner.unlink(pnode);
                    return Err(e);
                }
            }
        }
        drop(inner);
        Ok(Edge::new(Rc::clone(&self.inner), ev, acc))
    }

    /// The edge of the projection function of one variable (by level
    /// position), optionally mapped through per-index terminal values.
    pub fn edge_for_variable(
        &self,
        pos: u32,
        primed: bool,
        terms: Option<&[Terminal]>,
    ) -> Result<Edge> {
        let (ev, node) = self.inner.borrow_mut().edge_for_var(pos, primed, terms)?;
        Ok(Edge::new(Rc::clone(&self.inner), ev, node))
    }
}

pub(crate) fn level_from_rank(rank: i64, relation: bool) -> Option<Level> {
    if rank <= 0 {
        return None;
    }
    if rank % 2 == 0 {
        Some(Level::unprimed((rank / 2) as u32))
    } else if relation {
        Some(Level::primed(((rank + 1) / 2) as u32))
    } else {
        None
    }
}
