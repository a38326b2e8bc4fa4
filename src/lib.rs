//! # mdd-rs: Multi-terminal and Edge-valued Decision Diagrams in Rust
//!
//! **`mdd-rs`** is a manager-centric library for building, manipulating
//! and querying **decision diagrams** over tuples of bounded discrete
//! variables: multi-terminal MDDs for sets and integer/real functions,
//! and primed/unprimed "matrix" diagrams (MxDs) for relations.
//!
//! ## What is a decision diagram?
//!
//! A decision diagram represents a function over a fixed tuple of
//! variables as a directed acyclic graph. Under a fixed variable order
//! and reduction rule, every function has exactly one representation
//! --- the diagrams are **canonical** --- so equality of functions is
//! equality of handles, and shared sub-functions are stored once.
//!
//! ## Key Features
//!
//! - **Manager-Centric Architecture**: All operations go through a
//!   [`Forest`], which owns the node arena, the unique (canonicalization)
//!   table, the reference counts and the memoization cache.
//! - **Three reduction rules**: fully-reduced, quasi-reduced, and
//!   identity-reduced relation forests.
//! - **Edge values**: additive integer (EV+) and multiplicative real
//!   (EV*) labelings alongside plain multi-terminal diagrams.
//! - **Saturation**: the fixed-point engine behind
//!   [`reachable_states_dfs`] and the distance-annotated
//!   [`transitive_closure`], the fastest way to compute reachable state
//!   spaces of asynchronous systems.
//!
//! ## Basic Usage
//!
//! ```rust
//! use mdd_rs::{Domain, Policies, RangeType, EdgeLabeling, Terminal};
//!
//! mdd_rs::initialize();
//!
//! // Three variables, each with bound 2, bottom up.
//! let domain = Domain::bottom_up(&[2, 2, 2]).unwrap();
//! let forest = domain
//!     .new_forest(false, RangeType::Boolean, EdgeLabeling::MultiTerminal, Policies::new(false))
//!     .unwrap();
//!
//! // {(0,0,1), (1,1,1)} as minterms, bottom-up variable order.
//! let set = forest
//!     .edge_from_minterms(&[vec![0, 0, 1], vec![1, 1, 1]], None)
//!     .unwrap();
//! assert_eq!(set.cardinality(), 2u32.into());
//!
//! // Canonicity: rebuilding the same set yields the same handle.
//! let again = forest
//!     .edge_from_minterms(&[vec![1, 1, 1], vec![0, 0, 1]], None)
//!     .unwrap();
//! assert_eq!(set, again);
//!
//! // Operators forward to the apply engine.
//! let everything = forest.constant(Terminal::Bool(true)).unwrap();
//! assert_eq!(&set | &again, set);
//! assert_eq!((&everything - &set).cardinality(), 6u32.into());
//!
//! mdd_rs::cleanup().unwrap();
//! ```
//!
//! ## Core Components
//!
//! - [`domain`]: variable bounds and ordering, shared by forests.
//! - [`forest`]: the node store, unique table, reducer and GC.
//! - [`edge`]: reference-counted user handles with operator overloads.
//! - [`apply`]: the recursive, memoized operation drivers.
//! - [`saturation`]: saturation-based reachability and closure.
//! - [`enumerator`]: lazy tuple enumeration.

pub mod apply;
pub mod arena;
pub mod bitset;
pub mod cache;
pub mod domain;
pub mod edge;
pub mod enumerator;
pub mod error;
pub mod forest;
pub mod image;
pub mod io;
pub mod logger;
pub mod node;
pub mod reorder;
pub mod saturation;
pub mod types;
pub mod unique;
pub mod utils;

use std::collections::HashMap;
use std::sync::Mutex;

pub use crate::apply::{
    apply_binary, complement, copy_to, lift_to_ev_plus, max_range, min_range, BinaryOp,
};
pub use crate::domain::Domain;
pub use crate::edge::Edge;
pub use crate::enumerator::{Minterm, MintermIterator};
pub use crate::error::{DdError, Result};
pub use crate::forest::{Forest, ForestStats, Policies};
pub use crate::image::{
    cross_product, mat_vec_multiply, post_image, pre_image, reachable_states_bfs,
    vec_mat_multiply,
};
pub use crate::logger::{ForestLogger, LineLogger};
pub use crate::reorder::ReorderStats;
pub use crate::saturation::{reachable_states_dfs, transitive_closure};
pub use crate::types::{
    EdgeLabeling, EdgeValue, Level, NodeDeletion, NodeStorage, RangeType, ReductionRule,
    ReorderStrategy, Terminal, Var, DONT_CARE, DONT_CHANGE,
};

/// What a registered operation name resolves to.
enum Registered {
    Binary(BinaryOp),
    Unary(fn(&Edge) -> Result<Edge>),
    SetRelation(fn(&Edge, &Edge) -> Result<Edge>),
}

struct Library {
    refs: u32,
    registry: HashMap<&'static str, Registered>,
}

static LIBRARY: Mutex<Option<Library>> = Mutex::new(None);

fn build_registry() -> HashMap<&'static str, Registered> {
    let mut reg: HashMap<&'static str, Registered> = HashMap::new();
    for op in [
        BinaryOp::Union,
        BinaryOp::Intersection,
        BinaryOp::Difference,
        BinaryOp::Min,
        BinaryOp::Max,
        BinaryOp::Plus,
        BinaryOp::Minus,
        BinaryOp::Times,
        BinaryOp::Divide,
        BinaryOp::Equal,
        BinaryOp::NotEqual,
        BinaryOp::LessThan,
        BinaryOp::LessOrEqual,
        BinaryOp::GreaterThan,
        BinaryOp::GreaterOrEqual,
    ] {
        reg.insert(op.name(), Registered::Binary(op));
    }
    reg.insert("complement", Registered::Unary(complement));
    reg.insert("post_image", Registered::SetRelation(post_image));
    reg.insert("pre_image", Registered::SetRelation(pre_image));
    reg.insert(
        "reachable_states_bfs",
        Registered::SetRelation(reachable_states_bfs),
    );
    reg.insert(
        "reachable_states_dfs",
        Registered::SetRelation(reachable_states_dfs),
    );
    reg
}

/// Initializes the library, creating the operation registry on first
/// call. Calls are reference-counted; every `initialize` must be paired
/// with a [`cleanup`].
pub fn initialize() {
    let mut lib = LIBRARY.lock().unwrap_or_else(|p| p.into_inner());
    match lib.as_mut() {
        Some(l) => l.refs += 1,
        None => {
            *lib = Some(Library {
                refs: 1,
                registry: build_registry(),
            });
        }
    }
}

/// Releases one reference on the library, destroying the operation
/// registry when the last one goes away.
pub fn cleanup() -> Result<()> {
    let mut lib = LIBRARY.lock().unwrap_or_else(|p| p.into_inner());
    match lib.as_mut() {
        None => Err(DdError::InvalidOperation),
        Some(l) => {
            l.refs -= 1;
            if l.refs == 0 {
                *lib = None;
            }
            Ok(())
        }
    }
}

/// Applies an operation by name: `apply_by_name("union", &[&a, &b])`.
///
/// Requires an [`initialize`]d library; unknown names report
/// [`DdError::UnknownOperation`], wrong arities
/// [`DdError::InvalidArgument`].
pub fn apply_by_name(name: &str, args: &[&Edge]) -> Result<Edge> {
    let lib = LIBRARY.lock().unwrap_or_else(|p| p.into_inner());
    let lib = lib.as_ref().ok_or(DdError::InvalidOperation)?;
    match lib.registry.get(name) {
        None => Err(DdError::UnknownOperation),
        Some(Registered::Binary(op)) => {
            let &[a, b] = args else {
                return Err(DdError::InvalidArgument);
            };
            apply_binary(*op, a, b)
        }
        Some(Registered::Unary(f)) => {
            let &[a] = args else {
                return Err(DdError::InvalidArgument);
            };
            f(a)
        }
        Some(Registered::SetRelation(f)) => {
            let &[a, b] = args else {
                return Err(DdError::InvalidArgument);
            };
            f(a, b)
        }
    }
}

macro_rules! binary_entry {
    ($(#[$doc:meta])* $name:ident, $op:ident) => {
        $(#[$doc])*
        pub fn $name(a: &Edge, b: &Edge) -> Result<Edge> {
            apply_binary(BinaryOp::$op, a, b)
        }
    };
}

binary_entry!(
    /// Set union (boolean forests) / pointwise minimum (EV+).
    union, Union
);
binary_entry!(
    /// Set intersection (boolean forests) / pointwise maximum (EV+).
    intersection, Intersection
);
binary_entry!(
    /// Set difference.
    difference, Difference
);
binary_entry!(
    /// Pointwise minimum.
    min_of, Min
);
binary_entry!(
    /// Pointwise maximum.
    max_of, Max
);
binary_entry!(
    /// Pointwise sum.
    plus, Plus
);
binary_entry!(
    /// Pointwise difference.
    minus, Minus
);
binary_entry!(
    /// Pointwise product.
    times, Times
);
binary_entry!(
    /// Pointwise quotient.
    divide, Divide
);
binary_entry!(
    /// Pointwise equality test.
    equal, Equal
);
binary_entry!(
    /// Pointwise inequality test.
    not_equal, NotEqual
);
binary_entry!(
    /// Pointwise less-than test.
    less_than, LessThan
);
binary_entry!(
    /// Pointwise at-most test.
    less_or_equal, LessOrEqual
);
binary_entry!(
    /// Pointwise greater-than test.
    greater_than, GreaterThan
);
binary_entry!(
    /// Pointwise at-least test.
    greater_or_equal, GreaterOrEqual
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_refcounting() {
        initialize();
        initialize();
        assert!(cleanup().is_ok());
        assert!(cleanup().is_ok());
    }

    #[test]
    fn test_apply_by_name() {
        initialize();
        let d = Domain::bottom_up(&[2, 2]).unwrap();
        let f = d
            .new_forest(
                false,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(false),
            )
            .unwrap();
        let a = f.edge_from_minterms(&[vec![0, 1]], None).unwrap();
        let b = f.edge_from_minterms(&[vec![1, 0]], None).unwrap();
        let u = apply_by_name("union", &[&a, &b]).unwrap();
        assert_eq!(u.cardinality(), 2u32.into());
        assert_eq!(
            apply_by_name("frobnicate", &[&a]).unwrap_err(),
            DdError::UnknownOperation
        );
        assert_eq!(
            apply_by_name("union", &[&a]).unwrap_err(),
            DdError::InvalidArgument
        );
        cleanup().unwrap();
    }
}
