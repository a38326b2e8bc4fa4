//! Core identifier and value types shared by every component.
//!
//! This module provides newtype wrappers that enforce compile-time
//! distinction between variables, signed levels, and node handles,
//! preventing common mistakes in decision-diagram manipulation code.

use std::fmt;

/// A variable identifier (1-indexed).
///
/// Variables represent decision points in a diagram. Unlike levels,
/// variable IDs are stable across reordering operations.
///
/// # Invariants
///
/// - Variable IDs must be >= 1 (0 is reserved for terminals)
/// - Variable IDs are independent of their position in the variable ordering
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Var(u32);

impl Var {
    /// Creates a new variable with the given ID.
    ///
    /// # Panics
    ///
    /// Panics if `id == 0`. Variables must be 1-indexed.
    pub fn new(id: u32) -> Self {
        assert_ne!(id, 0, "Variable IDs must be >= 1");
        Var(id)
    }

    /// Returns the raw variable ID as a `u32`.
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// A signed level in a forest.
///
/// Positive levels are *unprimed* (current-state, "row") variables,
/// negative levels are *primed* (next-state, "column") variables, and
/// level 0 is the terminal level. Level `k` and level `-k` share the
/// variable at position `|k|` of the ordering but are distinct levels
/// in relation forests.
///
/// The total order used by the apply engine places, from top to bottom:
/// `N, -N, N-1, -(N-1), …, 1, -1, 0`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Level(i32);

impl Level {
    pub const TERMINAL: Level = Level(0);

    pub fn new(raw: i32) -> Self {
        Level(raw)
    }

    /// The unprimed level of variable position `k` (1-indexed).
    pub fn unprimed(k: u32) -> Self {
        assert_ne!(k, 0, "Variable positions must be >= 1");
        Level(k as i32)
    }

    /// The primed level of variable position `k` (1-indexed).
    pub fn primed(k: u32) -> Self {
        assert_ne!(k, 0, "Variable positions must be >= 1");
        Level(-(k as i32))
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    /// The variable position `|level|` (0 for the terminal level).
    pub fn pos(self) -> u32 {
        self.0.unsigned_abs()
    }

    pub fn is_primed(self) -> bool {
        self.0 < 0
    }

    pub fn is_terminal(self) -> bool {
        self.0 == 0
    }

    /// Rank in the total level order; larger rank is closer to the root.
    ///
    /// `rank(k) = 2k`, `rank(-k) = 2k - 1`, so `k` sits directly above `-k`,
    /// which sits directly above `k - 1`.
    pub fn rank(self) -> i64 {
        if self.0 >= 0 {
            2 * self.0 as i64
        } else {
            -2 * self.0 as i64 - 1
        }
    }

    pub fn is_above(self, other: Level) -> bool {
        self.rank() > other.rank()
    }

    /// The unprimed companion of this level.
    pub fn unprime(self) -> Level {
        Level(self.0.abs())
    }

    /// The primed companion of this level.
    pub fn prime(self) -> Level {
        Level(-self.0.abs())
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "x{}'", -self.0)
        } else {
            write!(f, "x{}", self.0)
        }
    }
}

/// A node handle.
///
/// - `0` is the *transparent* terminal (false / integer 0 / real 0.0).
/// - Negative handles encode the remaining terminals (see [`Terminal`]).
/// - Positive handles index the owning forest's address table.
///
/// Handles carry no identity of their own; they are only meaningful
/// relative to the forest that produced them.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct NodeId(i64);

impl NodeId {
    pub const TRANSPARENT: NodeId = NodeId(0);

    pub const fn from_raw(raw: i64) -> Self {
        NodeId(raw)
    }

    pub const fn from_index(index: usize) -> Self {
        NodeId(index as i64)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub const fn is_terminal(self) -> bool {
        self.0 <= 0
    }

    pub const fn is_transparent(self) -> bool {
        self.0 == 0
    }

    /// Address-table index of a non-terminal handle.
    pub fn index(self) -> usize {
        debug_assert!(self.0 > 0, "terminal handles have no index");
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 > 0 {
            write!(f, "@{}", self.0)
        } else if self.0 == 0 {
            write!(f, "T0")
        } else {
            write!(f, "T({:x})", -self.0)
        }
    }
}

const TERM_TAG_BOOL: i64 = 1;
const TERM_TAG_INT: i64 = 2;
const TERM_TAG_REAL: i64 = 3;

/// A terminal value: boolean, signed integer, or IEEE single-precision float.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Terminal {
    Bool(bool),
    Int(i32),
    Real(f32),
}

impl Terminal {
    /// Encodes the terminal into a handle.
    ///
    /// The "zero" of each range (false / 0 / 0.0) maps to the transparent
    /// handle; every other value maps to a negative handle carrying a type
    /// tag and the 32-bit payload, so terminal handles never collide with
    /// non-terminal ones.
    pub fn encode(self) -> NodeId {
        let (tag, payload) = match self {
            Terminal::Bool(false) => return NodeId::TRANSPARENT,
            Terminal::Bool(true) => (TERM_TAG_BOOL, 1u32),
            Terminal::Int(0) => return NodeId::TRANSPARENT,
            Terminal::Int(v) => (TERM_TAG_INT, v as u32),
            Terminal::Real(v) if v == 0.0 => return NodeId::TRANSPARENT,
            Terminal::Real(v) => (TERM_TAG_REAL, v.to_bits()),
        };
        NodeId(-((tag << 32) | payload as i64))
    }

    /// Decodes a terminal handle. The range type disambiguates the
    /// transparent handle.
    pub fn decode(id: NodeId, range: RangeType) -> Terminal {
        debug_assert!(id.is_terminal(), "cannot decode non-terminal {}", id);
        if id.is_transparent() {
            return match range {
                RangeType::Boolean => Terminal::Bool(false),
                RangeType::Integer => Terminal::Int(0),
                RangeType::Real => Terminal::Real(0.0),
            };
        }
        let bits = -id.raw();
        let payload = (bits & 0xFFFF_FFFF) as u32;
        match bits >> 32 {
            TERM_TAG_BOOL => Terminal::Bool(payload != 0),
            TERM_TAG_INT => Terminal::Int(payload as i32),
            TERM_TAG_REAL => Terminal::Real(f32::from_bits(payload)),
            tag => unreachable!("corrupt terminal tag {}", tag),
        }
    }

    pub fn as_int(self) -> i32 {
        match self {
            Terminal::Bool(b) => b as i32,
            Terminal::Int(v) => v,
            Terminal::Real(v) => v as i32,
        }
    }

    pub fn as_real(self) -> f32 {
        match self {
            Terminal::Bool(b) => b as i32 as f32,
            Terminal::Int(v) => v as f32,
            Terminal::Real(v) => v,
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            Terminal::Bool(b) => b,
            Terminal::Int(v) => v != 0,
            Terminal::Real(v) => v != 0.0,
        }
    }
}

/// Range of the functions a forest encodes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RangeType {
    Boolean,
    Integer,
    Real,
}

/// Edge labeling of a forest.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EdgeLabeling {
    /// Values live in the terminals only.
    MultiTerminal,
    /// Additive integer edge values ("EV+").
    EvPlus,
    /// Multiplicative real edge values ("EV*").
    EvTimes,
}

/// Reduction rule of a forest, fixed at creation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ReductionRule {
    /// Nodes whose children are all equal collapse to the child.
    Fully,
    /// Every level on every path is materialized.
    Quasi,
    /// Relation forests only: unprimed/primed pairs acting as the
    /// identity on their variable collapse.
    Identity,
}

/// Node deletion policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NodeDeletion {
    Never,
    /// Orphans are zombified immediately.
    Pessimistic,
    /// Orphans are kept intact until the next GC cycle.
    Optimistic,
}

/// Node storage preference.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NodeStorage {
    Full,
    Sparse,
    /// Pick whichever encoding is smaller, per node.
    FullOrSparse,
}

/// Bubble-style schedules for driving a reordering permutation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ReorderStrategy {
    LowestCost,
    LowestInversion,
    HighestInversion,
    BubbleUp,
    BubbleDown,
}

/// The "no path" distance for additive edge values.
pub const PLUS_INFINITY: i64 = i64::MAX;

/// Relative closeness threshold for multiplicative edge values.
pub const TIMES_CLOSENESS: f32 = 1e-6;

/// An edge value, drawn from the forest's labeling.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum EdgeValue {
    Void,
    Plus(i64),
    Times(f32),
}

impl EdgeValue {
    /// The identity value of the labeling's accumulation operation.
    pub fn identity(labeling: EdgeLabeling) -> EdgeValue {
        match labeling {
            EdgeLabeling::MultiTerminal => EdgeValue::Void,
            EdgeLabeling::EvPlus => EdgeValue::Plus(0),
            EdgeLabeling::EvTimes => EdgeValue::Times(1.0),
        }
    }

    /// The value carried by edges to the transparent terminal.
    pub fn transparent(labeling: EdgeLabeling) -> EdgeValue {
        match labeling {
            EdgeLabeling::MultiTerminal => EdgeValue::Void,
            EdgeLabeling::EvPlus => EdgeValue::Plus(PLUS_INFINITY),
            EdgeLabeling::EvTimes => EdgeValue::Times(0.0),
        }
    }

    /// Raw storage bits, as kept in node records and compute-table keys.
    pub(crate) fn to_bits(self) -> i64 {
        match self {
            EdgeValue::Void => 0,
            EdgeValue::Plus(v) => v,
            EdgeValue::Times(v) => v.to_bits() as i64,
        }
    }

    pub(crate) fn from_bits(labeling: EdgeLabeling, bits: i64) -> EdgeValue {
        match labeling {
            EdgeLabeling::MultiTerminal => EdgeValue::Void,
            EdgeLabeling::EvPlus => EdgeValue::Plus(bits),
            EdgeLabeling::EvTimes => EdgeValue::Times(f32::from_bits(bits as u32)),
        }
    }

    /// Value equality as used by the unique table: exact for `Void` and
    /// `Plus`, relative closeness for `Times` (with an absolute fallback
    /// around zero).
    pub fn close_to(self, other: EdgeValue) -> bool {
        match (self, other) {
            (EdgeValue::Void, EdgeValue::Void) => true,
            (EdgeValue::Plus(a), EdgeValue::Plus(b)) => a == b,
            (EdgeValue::Times(a), EdgeValue::Times(b)) => times_close(a, b),
            _ => false,
        }
    }

    pub fn plus(self) -> i64 {
        match self {
            EdgeValue::Plus(v) => v,
            _ => panic!("expected an additive edge value, got {:?}", self),
        }
    }

    pub fn times(self) -> f32 {
        match self {
            EdgeValue::Times(v) => v,
            _ => panic!("expected a multiplicative edge value, got {:?}", self),
        }
    }
}

/// Saturating addition over additive edge values, absorbing at infinity.
pub fn plus_add(a: i64, b: i64) -> i64 {
    if a == PLUS_INFINITY || b == PLUS_INFINITY {
        PLUS_INFINITY
    } else {
        a + b
    }
}

/// Relative-closeness comparison for multiplicative edge values.
pub fn times_close(a: f32, b: f32) -> bool {
    if a != 0.0 {
        ((a - b) / a).abs() <= TIMES_CLOSENESS
    } else {
        b.abs() <= TIMES_CLOSENESS
    }
}

/// Don't-care marker in minterms.
pub const DONT_CARE: i32 = -1;
/// Don't-change marker in relation minterms (primed side only).
pub const DONT_CHANGE: i32 = -2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        let l2 = Level::unprimed(2);
        let p2 = Level::primed(2);
        let l1 = Level::unprimed(1);
        let p1 = Level::primed(1);
        assert!(l2.is_above(p2));
        assert!(p2.is_above(l1));
        assert!(l1.is_above(p1));
        assert!(p1.is_above(Level::TERMINAL));
    }

    #[test]
    fn test_terminal_roundtrip() {
        for t in [
            Terminal::Bool(true),
            Terminal::Int(42),
            Terminal::Int(-7),
            Terminal::Real(2.5),
            Terminal::Real(-0.125),
        ] {
            let id = t.encode();
            assert!(id.is_terminal());
            assert!(!id.is_transparent());
            let range = match t {
                Terminal::Bool(_) => RangeType::Boolean,
                Terminal::Int(_) => RangeType::Integer,
                Terminal::Real(_) => RangeType::Real,
            };
            assert_eq!(Terminal::decode(id, range), t);
        }
    }

    #[test]
    fn test_terminal_zero_is_transparent() {
        assert!(Terminal::Bool(false).encode().is_transparent());
        assert!(Terminal::Int(0).encode().is_transparent());
        assert!(Terminal::Real(0.0).encode().is_transparent());
        assert_eq!(
            Terminal::decode(NodeId::TRANSPARENT, RangeType::Integer),
            Terminal::Int(0)
        );
    }

    #[test]
    fn test_times_closeness() {
        assert!(times_close(1.0, 1.0 + 1e-7));
        assert!(!times_close(1.0, 1.1));
        assert!(times_close(0.0, 1e-7));
        assert!(!times_close(0.0, 0.5));
    }

    #[test]
    fn test_plus_add_absorbs_infinity() {
        assert_eq!(plus_add(3, 4), 7);
        assert_eq!(plus_add(PLUS_INFINITY, 4), PLUS_INFINITY);
        assert_eq!(plus_add(3, PLUS_INFINITY), PLUS_INFINITY);
    }
}
