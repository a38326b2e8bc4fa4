//! Domains: the variable order and per-variable bounds shared by forests.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::error::{DdError, Result};
use crate::forest::{Forest, ForestInner, Policies};
use crate::types::{EdgeLabeling, RangeType, Var};

static NEXT_DOMAIN_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct DomainInner {
    pub id: u64,
    /// Bound per variable id; `[0]` unused.
    pub bounds: Vec<u32>,
    /// Variable id at each level position; `[0]` unused.
    pub var_at_level: Vec<u32>,
    /// Level position of each variable id; `[0]` unused.
    pub level_of_var: Vec<u32>,
    pub forests: Vec<Weak<RefCell<ForestInner>>>,
    pub next_forest_id: u64,
}

impl DomainInner {
    /// Records a swap of the variables at level positions `pos` and
    /// `pos + 1` in the order bookkeeping.
    pub fn note_swap(&mut self, pos: u32) {
        let hv = self.var_at_level[(pos + 1) as usize];
        let lv = self.var_at_level[pos as usize];
        self.var_at_level[(pos + 1) as usize] = lv;
        self.var_at_level[pos as usize] = hv;
        self.level_of_var[hv as usize] = pos;
        self.level_of_var[lv as usize] = pos + 1;
    }

    /// Live forests, dropping the ones that have been destroyed.
    pub fn live_forests(&mut self) -> Vec<Rc<RefCell<ForestInner>>> {
        self.forests.retain(|w| w.strong_count() > 0);
        self.forests.iter().filter_map(|w| w.upgrade()).collect()
    }
}

/// An ordered collection of variables with per-variable bounds.
///
/// A domain owns the variable order; all forests created on it share that
/// order. Cloning a `Domain` clones the handle, not the domain.
#[derive(Clone)]
pub struct Domain {
    pub(crate) inner: Rc<RefCell<DomainInner>>,
}

impl Domain {
    /// Creates a domain from a bounds vector, bottom up: `bounds[0]` is
    /// the bound of variable 1, which sits at the lowest level.
    ///
    /// Every bound must be at least 2.
    pub fn bottom_up(bounds: &[u32]) -> Result<Domain> {
        if bounds.is_empty() {
            return Err(DdError::InvalidArgument);
        }
        if bounds.iter().any(|&b| b < 2) {
            return Err(DdError::InvalidAssignment);
        }
        let n = bounds.len();
        let mut by_var = Vec::with_capacity(n + 1);
        by_var.push(0);
        by_var.extend_from_slice(bounds);
        let identity: Vec<u32> = (0..=n as u32).collect();
        let id = NEXT_DOMAIN_ID.fetch_add(1, Ordering::Relaxed);
        debug!("domain {}: {} variables", id, n);
        Ok(Domain {
            inner: Rc::new(RefCell::new(DomainInner {
                id,
                bounds: by_var,
                var_at_level: identity.clone(),
                level_of_var: identity,
                forests: Vec::new(),
                next_forest_id: 1,
            })),
        })
    }

    pub fn num_variables(&self) -> usize {
        self.inner.borrow().bounds.len() - 1
    }

    /// The bound of a variable.
    pub fn bound(&self, var: Var) -> Result<u32> {
        let inner = self.inner.borrow();
        inner
            .bounds
            .get(var.id() as usize)
            .copied()
            .ok_or(DdError::InvalidVariable)
    }

    /// The bound of the variable currently at level position `pos`
    /// (1-indexed from the bottom).
    pub fn bound_at_level(&self, pos: u32) -> Result<u32> {
        let inner = self.inner.borrow();
        let var = *inner
            .var_at_level
            .get(pos as usize)
            .ok_or(DdError::InvalidLevel)?;
        Ok(inner.bounds[var as usize])
    }

    /// Current level position of a variable.
    pub fn level_of(&self, var: Var) -> Result<u32> {
        let inner = self.inner.borrow();
        inner
            .level_of_var
            .get(var.id() as usize)
            .copied()
            .ok_or(DdError::InvalidVariable)
    }

    /// Changes the bound of a variable.
    ///
    /// Growing is always allowed. Shrinking fails with
    /// [`DdError::InvalidAssignment`] if any live node of any forest on
    /// this domain holds a value at or above the new bound.
    pub fn set_bound(&self, var: Var, new_bound: u32) -> Result<()> {
        if new_bound < 2 {
            return Err(DdError::InvalidAssignment);
        }
        let mut inner = self.inner.borrow_mut();
        let old = *inner
            .bounds
            .get(var.id() as usize)
            .ok_or(DdError::InvalidVariable)?;
        let pos = inner.level_of_var[var.id() as usize];
        let forests = inner.live_forests();
        if new_bound < old {
            for f in &forests {
                if f.borrow().max_index_at_position(pos) >= new_bound as usize {
                    return Err(DdError::InvalidAssignment);
                }
            }
        }
        inner.bounds[var.id() as usize] = new_bound;
        for f in &forests {
            f.borrow_mut().set_position_bound(pos, new_bound);
        }
        Ok(())
    }

    /// Creates a forest on this domain.
    pub fn new_forest(
        &self,
        relation: bool,
        range: RangeType,
        labeling: EdgeLabeling,
        policies: Policies,
    ) -> Result<Forest> {
        Forest::new(self, relation, range, labeling, policies)
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Domain")
            .field("id", &inner.id)
            .field("variables", &(inner.bounds.len() - 1))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bottom_up() {
        let d = Domain::bottom_up(&[4, 4, 2]).unwrap();
        assert_eq!(d.num_variables(), 3);
        assert_eq!(d.bound(Var::new(1)).unwrap(), 4);
        assert_eq!(d.bound(Var::new(3)).unwrap(), 2);
        assert_eq!(d.bound(Var::new(4)), Err(DdError::InvalidVariable));
    }

    #[test]
    fn test_rejects_bad_bounds() {
        assert_eq!(Domain::bottom_up(&[]).unwrap_err(), DdError::InvalidArgument);
        assert_eq!(Domain::bottom_up(&[4, 1]).unwrap_err(), DdError::InvalidAssignment);
    }

    #[test]
    fn test_initial_order_is_identity() {
        let d = Domain::bottom_up(&[2, 3, 4]).unwrap();
        for v in 1..=3u32 {
            assert_eq!(d.level_of(Var::new(v)).unwrap(), v);
        }
        assert_eq!(d.bound_at_level(2).unwrap(), 3);
    }
}
