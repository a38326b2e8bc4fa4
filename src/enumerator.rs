//! Lazy enumeration of the tuples an edge encodes.
//!
//! The iterator keeps one frame per signed level, top down, and runs an
//! odometer over them: the lowest level advances first, backtracking up
//! and re-entering down whenever a level is exhausted. Levels the stored
//! diagram skips are materialized on the fly from the reduction rule:
//! redundant skips admit every index, identity skips admit only the
//! diagonal.

use std::cell::Ref;

use crate::edge::Edge;
use crate::forest::ForestInner;
use crate::node::NodeReader;
use crate::types::{EdgeValue, Level, NodeId, ReductionRule, Terminal, DONT_CARE};

/// One tuple of an edge, with its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Minterm {
    /// Unprimed assignment; entry `p` is the value of the variable at
    /// position `p + 1`.
    pub unprimed: Vec<i32>,
    /// Primed assignment, for relation forests.
    pub primed: Option<Vec<i32>>,
    /// Accumulated edge value along the path.
    pub value: EdgeValue,
    /// The terminal reached.
    pub terminal: Terminal,
}

struct Frame {
    level: Level,
    enter_value: EdgeValue,
    enter_node: NodeId,
    /// Present iff the entering node is stored at this frame's level.
    reader: Option<NodeReader>,
    idx: usize,
}

/// Lazy in-order walk over the set of tuples encoded by an edge.
pub struct MintermIterator<'a> {
    f: Ref<'a, ForestInner>,
    frames: Vec<Frame>,
    unprimed: Vec<i32>,
    primed: Vec<i32>,
    bottom_value: EdgeValue,
    bottom_node: NodeId,
    fixed_row: Option<Vec<i32>>,
    fixed_col: Option<Vec<i32>>,
    started: bool,
    done: bool,
}

impl<'a> MintermIterator<'a> {
    pub(crate) fn over(
        edge: &'a Edge,
        fixed_row: Option<Vec<i32>>,
        fixed_col: Option<Vec<i32>>,
    ) -> MintermIterator<'a> {
        let f = edge.forest.borrow();
        let n = f.num_vars as usize;
        let relation = f.relation;
        let num_frames = if relation { 2 * n } else { n };
        let mut it = MintermIterator {
            f,
            frames: Vec::with_capacity(num_frames),
            unprimed: vec![0; n],
            primed: vec![0; if relation { n } else { 0 }],
            bottom_value: EdgeValue::Void,
            bottom_node: NodeId::TRANSPARENT,
            fixed_row,
            fixed_col,
            started: false,
            done: edge.node.is_transparent(),
        };
        if !it.done {
            for fi in 0..num_frames {
                let level = it.frame_level(fi);
                it.frames.push(Frame {
                    level,
                    enter_value: EdgeValue::identity(it.f.labeling),
                    enter_node: NodeId::TRANSPARENT,
                    reader: None,
                    idx: 0,
                });
            }
            it.set_enter(0, edge.value, edge.node);
        }
        it
    }

    fn frame_level(&self, fi: usize) -> Level {
        let n = self.f.num_vars;
        if self.f.relation {
            let pos = n - (fi as u32) / 2;
            if fi % 2 == 0 {
                Level::unprimed(pos)
            } else {
                Level::primed(pos)
            }
        } else {
            Level::unprimed(n - fi as u32)
        }
    }

    fn set_enter(&mut self, fi: usize, value: EdgeValue, node: NodeId) {
        let at_level = !node.is_terminal() && self.f.node_level(node) == self.frames[fi].level;
        let reader = if at_level { Some(self.f.unpack(node)) } else { None };
        let frame = &mut self.frames[fi];
        frame.enter_value = value;
        frame.enter_node = node;
        frame.reader = reader;
        frame.idx = 0;
    }

    /// The fixed value constraining this frame, if any.
    fn fixed_at(&self, fi: usize) -> Option<usize> {
        let level = self.frames[fi].level;
        let p = (level.pos() - 1) as usize;
        let fixed = if level.is_primed() {
            self.fixed_col.as_ref()
        } else {
            self.fixed_row.as_ref()
        };
        match fixed.map(|v| v[p]) {
            Some(v) if v != DONT_CARE => Some(v as usize),
            _ => None,
        }
    }

    /// Child of frame `fi` at index `i`, honoring skips; transparent if
    /// the index is infeasible.
    fn child(&self, fi: usize, i: usize) -> (EdgeValue, NodeId) {
        let frame = &self.frames[fi];
        if let Some(reader) = &frame.reader {
            return (reader.ev(i), reader.d(i));
        }
        // Skipped level.
        let level = frame.level;
        if level.is_primed() && self.f.policies.reduction == ReductionRule::Identity {
            let p = (level.pos() - 1) as usize;
            if i == self.unprimed[p] as usize {
                (EdgeValue::identity(self.f.labeling), frame.enter_node)
            } else {
                (
                    EdgeValue::transparent(self.f.labeling),
                    NodeId::TRANSPARENT,
                )
            }
        } else {
            // Redundant: every index works.
            (EdgeValue::identity(self.f.labeling), frame.enter_node)
        }
    }

    /// Depth-first search for the next complete assignment, starting the
    /// scan of frame `d` at its current index.
    fn search(&mut self, mut d: usize) -> bool {
        loop {
            if d == self.frames.len() {
                return true;
            }
            let level = self.frames[d].level;
            let bound = self.f.bound(level);
            let fixed = self.fixed_at(d);
            let mut found = None;
            let mut i = self.frames[d].idx;
            while i < bound {
                if let Some(v) = fixed {
                    if i != v {
                        i += 1;
                        continue;
                    }
                }
                let (ev, child) = self.child(d, i);
                if !child.is_transparent() {
                    found = Some((i, ev, child));
                    break;
                }
                i += 1;
            }
            match found {
                Some((i, ev, child)) => {
                    self.frames[d].idx = i;
                    let p = (level.pos() - 1) as usize;
                    if level.is_primed() {
                        self.primed[p] = i as i32;
                    } else {
                        self.unprimed[p] = i as i32;
                    }
                    let value =
                        crate::forest::combine(self.f.labeling, self.frames[d].enter_value, ev);
                    if d + 1 == self.frames.len() {
                        self.bottom_value = value;
                        self.bottom_node = child;
                        return true;
                    }
                    self.set_enter(d + 1, value, child);
                    d += 1;
                }
                None => {
                    if d == 0 {
                        return false;
                    }
                    d -= 1;
                    self.frames[d].idx += 1;
                }
            }
        }
    }

    fn emit(&self) -> Minterm {
        Minterm {
            unprimed: self.unprimed.clone(),
            primed: if self.f.relation {
                Some(self.primed.clone())
            } else {
                None
            },
            value: self.bottom_value,
            terminal: self.f.terminal_value(self.bottom_node),
        }
    }
}

impl Iterator for MintermIterator<'_> {
    type Item = Minterm;

    fn next(&mut self) -> Option<Minterm> {
        if self.done {
            return None;
        }
        let found = if !self.started {
            self.started = true;
            self.search(0)
        } else {
            // Advance the lowest level first.
            let last = self.frames.len() - 1;
            self.frames[last].idx += 1;
            self.search(last)
        };
        if !found {
            self.done = true;
            return None;
        }
        Some(self.emit())
    }
}
