//! Unreduced node builders and read-only node views.
//!
//! A [`NodeBuilder`] is the only way to construct a node: it is filled in
//! by the apply engine (or the minterm constructors), then handed to the
//! forest's reducer, which normalizes it, applies the reduction rule, and
//! interns it in the unique table. Builders are never exposed to users and
//! never participate in operations.
//!
//! A [`NodeReader`] is a decoded snapshot of a reduced node. Readers can
//! *unfold* a node at a level above its own: a `Redundant` reader projects
//! the node as if every child of the requested level pointed to it, and an
//! `Identity` reader projects it as the single primed child at the parent's
//! index. This is how the apply engine and saturation always iterate over
//! the full bound of the level they are working at, regardless of which
//! levels the operands actually materialize.

use crate::types::{EdgeLabeling, EdgeValue, Level, NodeId};

/// A mutable, unreduced node under construction.
///
/// Children are kept dense; the reducer picks the stored encoding (full or
/// sparse) when the node is finalized. The builder holds one incoming
/// reference for every non-terminal child written into it; the reducer
/// either transfers those references into the stored node or releases
/// them.
#[derive(Debug)]
pub(crate) struct NodeBuilder {
    level: Level,
    labeling: EdgeLabeling,
    down: Vec<NodeId>,
    /// Edge-value bits, parallel to `down`; empty for multi-terminal.
    values: Vec<i64>,
}

impl NodeBuilder {
    pub fn new(level: Level, size: usize, labeling: EdgeLabeling) -> Self {
        debug_assert!(!level.is_terminal());
        let values = match labeling {
            EdgeLabeling::MultiTerminal => Vec::new(),
            _ => vec![EdgeValue::transparent(labeling).to_bits(); size],
        };
        NodeBuilder {
            level,
            labeling,
            down: vec![NodeId::TRANSPARENT; size],
            values,
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn size(&self) -> usize {
        self.down.len()
    }

    pub fn d(&self, i: usize) -> NodeId {
        self.down[i]
    }

    pub fn set_d(&mut self, i: usize, d: NodeId) {
        self.down[i] = d;
    }

    pub fn ev(&self, i: usize) -> EdgeValue {
        match self.labeling {
            EdgeLabeling::MultiTerminal => EdgeValue::Void,
            _ => EdgeValue::from_bits(self.labeling, self.values[i]),
        }
    }

    pub fn set_ev(&mut self, i: usize, ev: EdgeValue) {
        if self.labeling != EdgeLabeling::MultiTerminal {
            self.values[i] = ev.to_bits();
        }
    }

    /// Writes one (value, child) entry.
    pub fn set(&mut self, i: usize, ev: EdgeValue, d: NodeId) {
        self.set_d(i, d);
        self.set_ev(i, ev);
    }

    /// Number of entries that are not the transparent edge.
    pub fn nonzero_count(&self) -> usize {
        (0..self.size()).filter(|&i| !self.is_transparent(i)).count()
    }

    /// Whether entry `i` is the transparent edge.
    pub fn is_transparent(&self, i: usize) -> bool {
        self.down[i].is_transparent()
    }

    pub(crate) fn labeling(&self) -> EdgeLabeling {
        self.labeling
    }
}

/// How a reader was synthesized from the stored node, if at all.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ReaderKind {
    /// Decoded directly from the stored record.
    Stored,
    /// The node lives below the requested level; every child is the node.
    Redundant,
    /// The node lives below the requested primed level; it appears as the
    /// single child at the parent's index.
    Identity,
}

/// A read-only snapshot of a node, possibly unfolded at a higher level.
///
/// Readers own their data, so they stay valid while the forest allocates
/// or reclaims nodes underneath them.
#[derive(Debug)]
pub(crate) struct NodeReader {
    level: Level,
    size: usize,
    kind: ReaderKind,
    /// Stored sparsely: parallel (index, child, value-bits) entries.
    index: Vec<u32>,
    down: Vec<NodeId>,
    values: Vec<i64>,
    labeling: EdgeLabeling,
}

impl NodeReader {
    pub(crate) fn from_parts(
        level: Level,
        size: usize,
        kind: ReaderKind,
        index: Vec<u32>,
        down: Vec<NodeId>,
        values: Vec<i64>,
        labeling: EdgeLabeling,
    ) -> Self {
        debug_assert_eq!(index.len(), down.len());
        debug_assert!(values.is_empty() || values.len() == down.len());
        NodeReader {
            level,
            size,
            kind,
            index,
            down,
            values,
            labeling,
        }
    }

    /// Synthesizes the redundant unfolding of `(ev, node)` at `level`.
    pub(crate) fn redundant(
        level: Level,
        size: usize,
        ev: EdgeValue,
        node: NodeId,
        labeling: EdgeLabeling,
    ) -> Self {
        let index = (0..size as u32).collect();
        let down = vec![node; size];
        let values = match labeling {
            EdgeLabeling::MultiTerminal => Vec::new(),
            _ => vec![ev.to_bits(); size],
        };
        NodeReader {
            level,
            size,
            kind: ReaderKind::Redundant,
            index,
            down,
            values,
            labeling,
        }
    }

    /// Synthesizes the identity unfolding of `(ev, node)` at primed
    /// `level`, appearing at index `at`.
    pub(crate) fn identity(
        level: Level,
        size: usize,
        at: usize,
        ev: EdgeValue,
        node: NodeId,
        labeling: EdgeLabeling,
    ) -> Self {
        debug_assert!(level.is_primed());
        let values = match labeling {
            EdgeLabeling::MultiTerminal => Vec::new(),
            _ => vec![ev.to_bits()],
        };
        NodeReader {
            level,
            size,
            kind: ReaderKind::Identity,
            index: vec![at as u32],
            down: vec![node],
            values,
            labeling,
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// The level bound this reader iterates over.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> ReaderKind {
        self.kind
    }

    /// Number of non-transparent entries.
    pub fn nnz(&self) -> usize {
        self.down.len()
    }

    /// The `z`-th non-transparent entry's index.
    pub fn idx(&self, z: usize) -> usize {
        self.index[z] as usize
    }

    /// The `z`-th non-transparent entry's child.
    pub fn d_at(&self, z: usize) -> NodeId {
        self.down[z]
    }

    /// The `z`-th non-transparent entry's edge value.
    pub fn ev_at(&self, z: usize) -> EdgeValue {
        match self.labeling {
            EdgeLabeling::MultiTerminal => EdgeValue::Void,
            _ => EdgeValue::from_bits(self.labeling, self.values[z]),
        }
    }

    /// Child at index `i` (transparent if absent).
    pub fn d(&self, i: usize) -> NodeId {
        match self.find(i) {
            Some(z) => self.down[z],
            None => NodeId::TRANSPARENT,
        }
    }

    /// Edge value at index `i` (the transparent value if absent).
    pub fn ev(&self, i: usize) -> EdgeValue {
        match self.find(i) {
            Some(z) => self.ev_at(z),
            None => EdgeValue::transparent(self.labeling),
        }
    }

    fn find(&self, i: usize) -> Option<usize> {
        debug_assert!(i < self.size);
        // Entries are in increasing index order.
        self.index.binary_search(&(i as u32)).ok()
    }
}
