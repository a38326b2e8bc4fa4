//! The forest: node arena, unique table, reference counts, and the reducer.
//!
//! All node creation funnels through [`ForestInner::reduce`], which
//! normalizes edge values, applies the forest's reduction rule, and
//! interns the node in the unique table. Reduced nodes are immutable;
//! equal structure therefore implies equal handle, and handle equality
//! implies function equality (canonicity).
//!
//! # Reference counts
//!
//! Every node carries an *incoming* count (structural edges plus
//! top-level edges) and a *cache* count (compute-table entries). A node
//! whose incoming count reaches zero becomes an orphan; depending on the
//! deletion policy it is zombified immediately (pessimistic) or kept
//! intact until the next GC cycle (optimistic). A zombie has left the
//! unique table and released its children but keeps its handle until the
//! cache count also reaches zero, so stale compute-table entries can
//! still recognize it.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::arena::LevelArena;
use crate::cache::{ComputeTable, OpId, RESULT_NODE};
use crate::domain::{Domain, DomainInner};
use crate::error::{DdError, Result};
use crate::logger::ForestLogger;
use crate::node::{NodeBuilder, NodeReader, ReaderKind};
use crate::types::{
    EdgeLabeling, EdgeValue, Level, NodeDeletion, NodeId, NodeStorage, RangeType, ReductionRule,
    ReorderStrategy, Terminal, DONT_CARE, DONT_CHANGE,
};
use crate::unique::UniqueTable;
use crate::utils::NodeHasher;

/// Forest policies, immutable after creation.
#[derive(Debug, Clone)]
pub struct Policies {
    pub reduction: ReductionRule,
    pub deletion: NodeDeletion,
    pub storage: NodeStorage,
    pub reorder: ReorderStrategy,
    /// Pessimistic forests run a stale scan past this many zombies.
    pub zombie_trigger: usize,
    /// Optimistic forests run a GC cycle past this many orphans.
    pub orphan_trigger: usize,
    /// Compact a level when holes exceed this percentage of it...
    pub compaction_percent: u32,
    /// ...or this absolute slot count.
    pub compaction_abs_slots: usize,
}

impl Policies {
    /// Defaults: identity reduction for relation forests, fully-reduced
    /// otherwise; optimistic deletion; per-node storage choice.
    pub fn new(relation: bool) -> Policies {
        Policies {
            reduction: if relation {
                ReductionRule::Identity
            } else {
                ReductionRule::Fully
            },
            deletion: NodeDeletion::Optimistic,
            storage: NodeStorage::FullOrSparse,
            reorder: ReorderStrategy::LowestInversion,
            zombie_trigger: 4096,
            orphan_trigger: 16384,
            compaction_percent: 25,
            compaction_abs_slots: 1 << 20,
        }
    }

    pub fn with_reduction(mut self, r: ReductionRule) -> Policies {
        self.reduction = r;
        self
    }

    pub fn with_deletion(mut self, d: NodeDeletion) -> Policies {
        self.deletion = d;
        self
    }

    pub fn with_storage(mut self, s: NodeStorage) -> Policies {
        self.storage = s;
        self
    }

    pub fn with_reorder(mut self, s: ReorderStrategy) -> Policies {
        self.reorder = s;
        self
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum NodeStatus {
    Free,
    Active,
    Orphan,
    Zombie,
}

#[derive(Debug, Clone)]
pub(crate) struct AddressEntry {
    pub level: Level,
    /// Arena offset when live; next free handle when on the free stack.
    pub offset: usize,
    pub incoming: u32,
    pub cache: u32,
    pub status: NodeStatus,
}

impl AddressEntry {
    const FREE: AddressEntry = AddressEntry {
        level: Level::TERMINAL,
        offset: 0,
        incoming: 0,
        cache: 0,
        status: NodeStatus::Free,
    };
}

/// Counters reported by [`Forest::stats`].
#[derive(Debug, Default, Clone)]
pub struct ForestStats {
    pub current_nodes: usize,
    pub peak_nodes: usize,
    pub created: u64,
    pub reclaimed: u64,
    pub gc_runs: u64,
    /// High-water mark of arena slots across all levels.
    pub peak_slots: usize,
}

/// Cached saturation split of a relation, keyed by its root.
pub(crate) struct SplitCache {
    pub root: NodeId,
    /// `by_level[k]` holds the events whose top variable is `k`; entry 0
    /// unused. All handles are linked.
    pub by_level: Vec<NodeId>,
}

pub(crate) struct ForestInner {
    pub id: u64,
    pub domain: Rc<RefCell<DomainInner>>,
    pub domain_id: u64,
    pub relation: bool,
    pub range: RangeType,
    pub labeling: EdgeLabeling,
    pub policies: Policies,
    pub num_vars: u32,
    /// Bound per level (indexed like the arenas); kept in sync with the
    /// domain across reorders. The two signs of one position diverge
    /// only transiently, inside a relation variable swap.
    bounds: Vec<u32>,
    address: Vec<AddressEntry>,
    free_head: i64,
    arenas: Vec<LevelArena>,
    pub(crate) unique: UniqueTable,
    pub(crate) ct: ComputeTable,
    pub stats: ForestStats,
    pub logger: Option<Box<dyn ForestLogger>>,
    pub(crate) splits: Option<SplitCache>,
    orphans: usize,
    zombies: usize,
    /// Suppresses automatic GC triggers, during GC itself and during
    /// level swaps (when the unique table is partially rebuilt).
    pub(crate) in_gc: bool,
}

impl ForestInner {
    pub fn lidx(&self, level: Level) -> usize {
        debug_assert!(!level.is_terminal());
        debug_assert!(self.relation || !level.is_primed());
        let p = (level.pos() - 1) as usize;
        if self.relation {
            2 * p + level.is_primed() as usize
        } else {
            p
        }
    }

    pub fn bound(&self, level: Level) -> usize {
        self.bounds[self.lidx(level)] as usize
    }

    pub(crate) fn swap_level_bounds(&mut self, a: Level, b: Level) {
        let (ai, bi) = (self.lidx(a), self.lidx(b));
        self.bounds.swap(ai, bi);
    }

    fn vpc(&self) -> usize {
        (self.labeling != EdgeLabeling::MultiTerminal) as usize
    }

    pub fn transparent_edge(&self) -> (EdgeValue, NodeId) {
        (EdgeValue::transparent(self.labeling), NodeId::TRANSPARENT)
    }

    /// Coerces a terminal value into this forest's range and encodes it.
    pub fn terminal(&self, t: Terminal) -> NodeId {
        match self.range {
            RangeType::Boolean => Terminal::Bool(t.as_bool()),
            RangeType::Integer => Terminal::Int(t.as_int()),
            RangeType::Real => Terminal::Real(t.as_real()),
        }
        .encode()
    }

    pub fn terminal_value(&self, h: NodeId) -> Terminal {
        Terminal::decode(h, self.range)
    }

    /// The terminal all edge-valued paths end in.
    pub fn omega(&self) -> NodeId {
        Terminal::Bool(true).encode()
    }

    pub fn node_level(&self, h: NodeId) -> Level {
        if h.is_terminal() {
            Level::TERMINAL
        } else {
            self.address[h.index()].level
        }
    }

    pub(crate) fn entry(&self, h: NodeId) -> &AddressEntry {
        &self.address[h.index()]
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    pub fn link(&mut self, h: NodeId) {
        if h.is_terminal() {
            return;
        }
        let idx = h.index();
        debug_assert!(
            matches!(
                self.address[idx].status,
                NodeStatus::Active | NodeStatus::Orphan
            ),
            "link on dead node {}",
            h
        );
        if self.address[idx].status == NodeStatus::Orphan {
            self.address[idx].status = NodeStatus::Active;
            self.orphans -= 1;
        }
        self.address[idx].incoming += 1;
    }

    pub fn unlink(&mut self, h: NodeId) {
        if h.is_terminal() {
            return;
        }
        {
            let e = &mut self.address[h.index()];
            debug_assert_eq!(e.status, NodeStatus::Active, "unlink on dead node {}", h);
            debug_assert!(e.incoming > 0, "unlink underflow on {}", h);
            e.incoming -= 1;
            if e.incoming > 0 {
                return;
            }
        }
        match self.policies.deletion {
            NodeDeletion::Never => {}
            NodeDeletion::Pessimistic => {
                self.zombify(h);
                if !self.in_gc && self.zombies > self.policies.zombie_trigger {
                    self.ct_stale_scan();
                    self.compact_all();
                }
            }
            NodeDeletion::Optimistic => {
                self.address[h.index()].status = NodeStatus::Orphan;
                self.orphans += 1;
                if !self.in_gc && self.orphans > self.policies.orphan_trigger {
                    self.gc();
                }
            }
        }
    }

    pub(crate) fn cache_node(&mut self, h: NodeId) {
        if !h.is_terminal() {
            self.address[h.index()].cache += 1;
        }
    }

    pub(crate) fn uncache_node(&mut self, h: NodeId) {
        if h.is_terminal() {
            return;
        }
        let idx = h.index();
        let e = &mut self.address[idx];
        debug_assert!(e.cache > 0, "uncache underflow on {}", h);
        e.cache -= 1;
        if e.cache == 0 && e.status == NodeStatus::Zombie {
            self.free_handle(idx);
        }
    }

    /// Removes a node from the unique table, releases its children and
    /// its storage, and keeps the handle as a zombie while compute-table
    /// entries still reference it.
    fn zombify(&mut self, h: NodeId) {
        let idx = h.index();
        debug_assert_eq!(self.address[idx].incoming, 0);
        debug_assert!(matches!(
            self.address[idx].status,
            NodeStatus::Active | NodeStatus::Orphan
        ));
        if self.address[idx].status == NodeStatus::Orphan {
            self.orphans -= 1;
        }
        let level = self.address[idx].level;
        let lidx = self.lidx(level);
        let removed = self.unique.remove(lidx, h);
        debug_assert!(removed, "zombify: {} missing from unique table", h);

        // Collect children, then drop the chunk before cascading.
        let offset = self.address[idx].offset;
        let children: Vec<NodeId> = {
            let arena = &self.arenas[lidx];
            let len = arena.chunk_len(arena.slots()[offset + 1]);
            chunk_entries(&arena.slots()[offset..offset + len], self.vpc())
                .map(|(_, d, _)| d)
                .filter(|d| !d.is_terminal())
                .collect()
        };
        {
            let arena = &mut self.arenas[lidx];
            let len = arena.chunk_len(arena.slots()[offset + 1]);
            arena.recycle(offset, len);
        }

        self.address[idx].status = NodeStatus::Zombie;
        self.zombies += 1;
        self.stats.current_nodes -= 1;
        self.stats.reclaimed += 1;
        if let Some(lg) = self.logger.as_mut() {
            lg.active_delta(level, -1);
        }
        debug!("zombified {} at {}", h, level);

        if self.address[idx].cache == 0 {
            self.free_handle(idx);
        }
        for c in children {
            self.unlink(c);
        }
    }

    fn free_handle(&mut self, idx: usize) {
        debug_assert_eq!(self.address[idx].status, NodeStatus::Zombie);
        self.zombies -= 1;
        self.address[idx] = AddressEntry::FREE;
        self.address[idx].offset = if self.free_head >= 0 {
            self.free_head as usize
        } else {
            usize::MAX
        };
        self.free_head = idx as i64;
    }

    fn alloc_handle(&mut self) -> usize {
        if self.free_head >= 0 {
            let idx = self.free_head as usize;
            let next = self.address[idx].offset;
            self.free_head = if next == usize::MAX { -1 } else { next as i64 };
            idx
        } else {
            self.address.push(AddressEntry::FREE);
            let idx = self.address.len() - 1;
            self.unique.ensure_capacity(idx);
            idx
        }
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    /// Runs one garbage-collection cycle: zombify all orphans, drop stale
    /// compute-table entries, and compact arenas that crossed the
    /// compaction thresholds. Returns the number of nodes reclaimed.
    pub fn gc(&mut self) -> usize {
        let before = self.stats.current_nodes;
        self.in_gc = true;
        if let Some(lg) = self.logger.as_mut() {
            lg.phase_begin("gc");
        }
        // Saturation splits pin relation nodes; drop them first.
        self.drop_splits();
        loop {
            let orphaned: Vec<NodeId> = self
                .address
                .iter()
                .enumerate()
                .filter(|(_, e)| e.status == NodeStatus::Orphan && e.incoming == 0)
                .map(|(i, _)| NodeId::from_index(i))
                .collect();
            if orphaned.is_empty() {
                break;
            }
            for h in orphaned {
                // Cascaded unlinks may have revived or already killed it.
                if self.address[h.index()].status == NodeStatus::Orphan {
                    self.zombify(h);
                }
            }
        }
        self.ct_stale_scan();
        self.compact_all();
        self.stats.gc_runs += 1;
        if let Some(lg) = self.logger.as_mut() {
            lg.phase_end("gc");
        }
        self.in_gc = false;
        before - self.stats.current_nodes
    }

    pub(crate) fn drop_splits(&mut self) {
        if let Some(splits) = self.splits.take() {
            for h in splits.by_level {
                self.unlink(h);
            }
            // The root handle itself is not linked by the cache.
        }
    }

    /// Removes every compute-table entry referencing a zombie or dead
    /// handle, releasing the cache counts it held.
    pub(crate) fn ct_stale_scan(&mut self) {
        let ForestInner { ct, address, .. } = self;
        let dead = |raw: i64| {
            raw > 0
                && matches!(
                    address[raw as usize].status,
                    NodeStatus::Zombie | NodeStatus::Free
                )
        };
        let removed = ct.drain_if(|_, key, mask, res| {
            (mask & RESULT_NODE != 0 && dead(res))
                || key
                    .iter()
                    .enumerate()
                    .any(|(i, &item)| mask & (1 << i) != 0 && dead(item))
        });
        for r in removed {
            let nodes: Vec<NodeId> = r.nodes().collect();
            for n in nodes {
                self.uncache_node(n);
            }
        }
    }

    /// Drops every compute-table entry, releasing all cache counts.
    pub(crate) fn ct_clear(&mut self) {
        let removed = self.ct.clear();
        for r in removed {
            let nodes: Vec<NodeId> = r.nodes().collect();
            for n in nodes {
                self.uncache_node(n);
            }
        }
    }

    pub(crate) fn compact_all(&mut self) {
        let ForestInner {
            arenas,
            address,
            policies,
            ..
        } = self;
        for arena in arenas.iter_mut() {
            if arena.needs_compaction(policies.compaction_percent, policies.compaction_abs_slots) {
                arena.compact(|id, off| {
                    address[id as usize].offset = off;
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Compute-table wrappers
    // ------------------------------------------------------------------

    pub(crate) fn ct_find(&mut self, op: OpId, key: &[i64]) -> Option<(i64, NodeId)> {
        self.ct.find(op, key)
    }

    /// Adds a memoized result, taking cache-count references on every
    /// node item marked in `node_mask`.
    pub(crate) fn ct_add(
        &mut self,
        op: OpId,
        key: &[i64],
        node_mask: u8,
        res_bits: i64,
        res_node: NodeId,
    ) {
        for (i, &item) in key.iter().enumerate() {
            if node_mask & (1 << i) != 0 {
                self.cache_node(NodeId::from_raw(item));
            }
        }
        if node_mask & RESULT_NODE != 0 {
            self.cache_node(res_node);
        }
        self.ct.add(op, key, node_mask, res_bits, res_node);
    }

    // ------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------

    /// Decodes the stored record of a non-terminal node.
    pub(crate) fn unpack(&self, h: NodeId) -> NodeReader {
        let e = &self.address[h.index()];
        debug_assert!(
            matches!(e.status, NodeStatus::Active | NodeStatus::Orphan),
            "unpack of dead node {}",
            h
        );
        let lidx = self.lidx(e.level);
        let arena = &self.arenas[lidx];
        let len = arena.chunk_len(arena.slots()[e.offset + 1]);
        let chunk = &arena.slots()[e.offset..e.offset + len];
        let vpc = self.vpc();
        let mut index = Vec::new();
        let mut down = Vec::new();
        let mut values = Vec::new();
        for (i, d, bits) in chunk_entries(chunk, vpc) {
            index.push(i);
            down.push(d);
            if vpc == 1 {
                values.push(bits);
            }
        }
        NodeReader::from_parts(
            e.level,
            self.bound(e.level),
            ReaderKind::Stored,
            index,
            down,
            values,
            self.labeling,
        )
    }

    /// Unfolds `h` at `level`, synthesizing the redundant expansion when
    /// the node lives below it.
    pub(crate) fn unpack_at(&self, level: Level, h: NodeId) -> NodeReader {
        if !h.is_terminal() && self.node_level(h) == level {
            return self.unpack(h);
        }
        debug_assert!(level.is_above(self.node_level(h)));
        NodeReader::redundant(
            level,
            self.bound(level),
            EdgeValue::identity(self.labeling),
            h,
            self.labeling,
        )
    }

    /// Unfolds `h` at primed `level` under parent index `at`,
    /// synthesizing the identity (or redundant) expansion when the node
    /// lives below it.
    pub(crate) fn unpack_primed_at(&self, level: Level, at: usize, h: NodeId) -> NodeReader {
        debug_assert!(level.is_primed());
        if !h.is_terminal() && self.node_level(h) == level {
            return self.unpack(h);
        }
        debug_assert!(level.is_above(self.node_level(h)));
        if self.policies.reduction == ReductionRule::Identity {
            NodeReader::identity(
                level,
                self.bound(level),
                at,
                EdgeValue::identity(self.labeling),
                h,
                self.labeling,
            )
        } else {
            NodeReader::redundant(
                level,
                self.bound(level),
                EdgeValue::identity(self.labeling),
                h,
                self.labeling,
            )
        }
    }

    // ------------------------------------------------------------------
    // Builders and the reducer
    // ------------------------------------------------------------------

    pub(crate) fn new_builder(&self, level: Level) -> NodeBuilder {
        NodeBuilder::new(level, self.bound(level), self.labeling)
    }

    /// Releases the child references a builder holds (failure path).
    pub(crate) fn discard_builder(&mut self, b: &NodeBuilder) {
        for i in 0..b.size() {
            if !b.is_transparent(i) {
                self.unlink(b.d(i));
            }
        }
    }

    /// Normalizes, reduces, and interns a built node.
    ///
    /// `at_index` is the index this node will occupy in its parent, used
    /// only by identity reduction to detect the skipped-identity pattern;
    /// pass -1 at unprimed levels and for root edges.
    ///
    /// Returns the factored edge value and a handle owning one incoming
    /// reference, which is transferred to the caller. The builder's child
    /// references are either transferred into the stored node or
    /// released.
    pub(crate) fn reduce(&mut self, at_index: i32, mut b: NodeBuilder) -> Result<(EdgeValue, NodeId)> {
        let level = b.level();
        let size = b.size();
        debug_assert_eq!(size, self.bound(level));
        debug_assert_eq!(b.labeling(), self.labeling);

        // Normalize edge values, factoring out the carried value.
        let carry = self.normalize(&mut b);

        if b.nonzero_count() == 0 {
            return Ok(self.transparent_edge());
        }

        // Reduction rule. Identity reduction skips unprimed levels
        // redundantly and primed levels through the identity pattern.
        match self.policies.reduction {
            ReductionRule::Quasi => {}
            ReductionRule::Fully | ReductionRule::Identity => {
                if self.policies.reduction == ReductionRule::Identity && level.is_primed() {
                    if at_index >= 0 {
                        let i = at_index as usize;
                        if b.nonzero_count() == 1
                            && !b.is_transparent(i)
                            && b.ev(i).close_to(EdgeValue::identity(self.labeling))
                        {
                            return Ok((combine(self.labeling, carry, b.ev(i)), b.d(i)));
                        }
                    }
                } else {
                    let d0 = b.d(0);
                    let e0 = b.ev(0);
                    let redundant = (0..size).all(|i| b.d(i) == d0 && b.ev(i).close_to(e0))
                        && e0.close_to(EdgeValue::identity(self.labeling));
                    if redundant {
                        // All children equal: collapse to the child,
                        // keeping one of the references the builder held.
                        for _ in 1..size {
                            self.unlink(d0);
                        }
                        return Ok((combine(self.labeling, carry, e0), d0));
                    }
                }
            }
        }

        // Unique-table lookup.
        let lidx = self.lidx(level);
        let hash = builder_hash(&b, self.labeling);
        let found = self.unique.find(lidx, hash, |h| self.builder_matches(h, &b));
        if let Some(h) = found {
            self.discard_builder(&b);
            self.link(h);
            return Ok((carry, h));
        }

        // Store. Children below this level is a structural invariant.
        #[cfg(debug_assertions)]
        for i in 0..size {
            if !b.is_transparent(i) {
                debug_assert!(level.is_above(self.node_level(b.d(i))));
            }
        }

        let idx = self.alloc_handle();
        let h = NodeId::from_index(idx);
        let offset = self.write_chunk(lidx, idx as i64, &b);
        self.address[idx] = AddressEntry {
            level,
            offset,
            incoming: 1,
            cache: 0,
            status: NodeStatus::Active,
        };
        self.unique.insert(lidx, hash, h);

        self.stats.created += 1;
        self.stats.current_nodes += 1;
        self.stats.peak_nodes = self.stats.peak_nodes.max(self.stats.current_nodes);
        let slots: usize = self.arenas.iter().map(|a| a.total_slots()).sum();
        self.stats.peak_slots = self.stats.peak_slots.max(slots);
        if let Some(lg) = self.logger.as_mut() {
            lg.active_delta(level, 1);
        }
        Ok((carry, h))
    }

    /// Factors the builder's edge values into normal form, returning the
    /// carried value.
    ///
    /// EV+ subtracts the minimum finite value (so the smallest stored
    /// value is 0). EV* divides by the value of the lowest-indexed
    /// non-transparent child (so that child's stored value is 1), which
    /// stays well-defined for negative values.
    fn normalize(&self, b: &mut NodeBuilder) -> EdgeValue {
        match self.labeling {
            EdgeLabeling::MultiTerminal => EdgeValue::Void,
            EdgeLabeling::EvPlus => {
                let mut m = i64::MAX;
                for i in 0..b.size() {
                    if !b.is_transparent(i) {
                        m = m.min(b.ev(i).plus());
                    }
                }
                if m == i64::MAX {
                    return EdgeValue::Plus(0);
                }
                for i in 0..b.size() {
                    if !b.is_transparent(i) {
                        b.set_ev(i, EdgeValue::Plus(b.ev(i).plus() - m));
                    }
                }
                EdgeValue::Plus(m)
            }
            EdgeLabeling::EvTimes => {
                let mut factor = None;
                for i in 0..b.size() {
                    if !b.is_transparent(i) {
                        factor = Some(b.ev(i).times());
                        break;
                    }
                }
                let Some(factor) = factor else {
                    return EdgeValue::Times(1.0);
                };
                debug_assert!(factor != 0.0);
                for i in 0..b.size() {
                    if !b.is_transparent(i) {
                        b.set_ev(i, EdgeValue::Times(b.ev(i).times() / factor));
                    }
                }
                EdgeValue::Times(factor)
            }
        }
    }

    /// Writes the builder into the level arena, choosing the encoding by
    /// policy, and returns the chunk offset.
    fn write_chunk(&mut self, lidx: usize, id: i64, b: &NodeBuilder) -> usize {
        let vpc = self.vpc();
        let nnz = b.nonzero_count();
        let truncated = (0..b.size())
            .rev()
            .find(|&i| !b.is_transparent(i))
            .map(|i| i + 1)
            .unwrap_or(0);
        let full_slots = 3 + truncated * (1 + vpc);
        let sparse_slots = 3 + nnz * (2 + vpc);
        let sparse = match self.policies.storage {
            NodeStorage::Full => false,
            NodeStorage::Sparse => true,
            NodeStorage::FullOrSparse => sparse_slots < full_slots,
        };

        let arena = &mut self.arenas[lidx];
        let (tag, len) = if sparse {
            (-(nnz as i64), sparse_slots)
        } else {
            (truncated as i64, full_slots)
        };
        let offset = arena.request(len);
        let slots = arena.slots_mut();
        slots[offset] = id;
        slots[offset + 1] = tag;
        if sparse {
            let mut z = 0;
            for i in 0..b.size() {
                if !b.is_transparent(i) {
                    slots[offset + 2 + z] = i as i64;
                    slots[offset + 2 + nnz + z] = b.d(i).raw();
                    if vpc == 1 {
                        slots[offset + 2 + 2 * nnz + z] = b.ev(i).to_bits();
                    }
                    z += 1;
                }
            }
        } else {
            for i in 0..truncated {
                slots[offset + 2 + i] = b.d(i).raw();
                if vpc == 1 {
                    slots[offset + 2 + truncated + i] = b.ev(i).to_bits();
                }
            }
        }
        slots[offset + len - 1] = id;
        offset
    }

    /// Structural equality between a stored node and a builder, using
    /// sparse iteration so the encodings do not matter.
    fn builder_matches(&self, h: NodeId, b: &NodeBuilder) -> bool {
        let e = &self.address[h.index()];
        if e.level != b.level() {
            return false;
        }
        let lidx = self.lidx(e.level);
        let arena = &self.arenas[lidx];
        let len = arena.chunk_len(arena.slots()[e.offset + 1]);
        let chunk = &arena.slots()[e.offset..e.offset + len];
        let mut stored = chunk_entries(chunk, self.vpc());
        for i in 0..b.size() {
            if b.is_transparent(i) {
                continue;
            }
            match stored.next() {
                Some((si, sd, sbits)) => {
                    if si as usize != i || sd != b.d(i) {
                        return false;
                    }
                    if !EdgeValue::from_bits(self.labeling, sbits).close_to(b.ev(i)) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        stored.next().is_none()
    }

    /// Content hash of a stored node, matching [`builder_hash`].
    pub(crate) fn node_hash(&self, h: NodeId) -> u64 {
        let e = &self.address[h.index()];
        let lidx = self.lidx(e.level);
        let arena = &self.arenas[lidx];
        let len = arena.chunk_len(arena.slots()[e.offset + 1]);
        let chunk = &arena.slots()[e.offset..e.offset + len];
        let mut hasher = NodeHasher::new(e.level.raw() as i64 as u64);
        for (i, d, bits) in chunk_entries(chunk, self.vpc()) {
            hasher.push2(i as u64, d.raw() as u64);
            if self.labeling == EdgeLabeling::EvPlus {
                hasher.push(bits as u64);
            }
        }
        hasher.finish()
    }

    // ------------------------------------------------------------------
    // Edge constructors
    // ------------------------------------------------------------------

    /// The edge of a constant function.
    pub(crate) fn constant(&mut self, t: Terminal) -> Result<(EdgeValue, NodeId)> {
        match self.labeling {
            EdgeLabeling::MultiTerminal => {
                let term = self.terminal(t);
                if self.policies.reduction == ReductionRule::Quasi && !term.is_transparent() {
                    // Quasi canonical form of a constant is a full chain.
                    return self.quasi_chain(term);
                }
                Ok((EdgeValue::Void, term))
            }
            EdgeLabeling::EvPlus => Ok((EdgeValue::Plus(t.as_int() as i64), self.omega())),
            EdgeLabeling::EvTimes => {
                let v = t.as_real();
                if v == 0.0 {
                    Ok(self.transparent_edge())
                } else {
                    Ok((EdgeValue::Times(v), self.omega()))
                }
            }
        }
    }

    fn quasi_chain(&mut self, term: NodeId) -> Result<(EdgeValue, NodeId)> {
        let mut h = term;
        for k in 1..=self.num_vars {
            for level in [Level::primed(k), Level::unprimed(k)] {
                if level.is_primed() && !self.relation {
                    continue;
                }
                let mut nb = self.new_builder(level);
                for i in 0..nb.size() {
                    self.link(h);
                    nb.set_d(i, h);
                }
                self.unlink(h);
                let (_, next) = self.reduce(-1, nb)?;
                h = next;
            }
        }
        Ok((EdgeValue::Void, h))
    }

    /// The edge of the function of one variable: `f(…, x_k, …) = g(x_k)`,
    /// where `g` is `terms` (or the index itself by default).
    pub(crate) fn edge_for_var(
        &mut self,
        pos: u32,
        primed: bool,
        terms: Option<&[Terminal]>,
    ) -> Result<(EdgeValue, NodeId)> {
        if pos == 0 || pos > self.num_vars {
            return Err(DdError::InvalidVariable);
        }
        if primed && !self.relation {
            return Err(DdError::InvalidOperation);
        }
        if self.policies.reduction == ReductionRule::Quasi {
            // Would need full chains below; not supported.
            return Err(DdError::NotImplemented);
        }
        let level = if primed {
            Level::primed(pos)
        } else {
            Level::unprimed(pos)
        };
        let size = self.bound(level);
        if let Some(terms) = terms {
            if terms.len() != size {
                return Err(DdError::InvalidArgument);
            }
        }
        let mut nb = self.new_builder(level);
        for i in 0..size {
            let t = terms.map(|ts| ts[i]).unwrap_or(Terminal::Int(i as i32));
            match self.labeling {
                EdgeLabeling::MultiTerminal => nb.set(i, EdgeValue::Void, self.terminal(t)),
                EdgeLabeling::EvPlus => {
                    nb.set(i, EdgeValue::Plus(t.as_int() as i64), self.omega())
                }
                EdgeLabeling::EvTimes => {
                    if t.as_real() != 0.0 {
                        nb.set(i, EdgeValue::Times(t.as_real()), self.omega());
                    }
                }
            }
        }
        self.reduce(-1, nb)
    }

    /// Builds the edge of a single (relation) minterm.
    ///
    /// `un[p]` is the unprimed value of the variable at position `p + 1`
    /// ([`DONT_CARE`] allowed); `pr` likewise for the primed side
    /// ([`DONT_CARE`] and [`DONT_CHANGE`] allowed), and must be present
    /// iff this is a relation forest.
    pub(crate) fn minterm_edge(
        &mut self,
        un: &[i32],
        pr: Option<&[i32]>,
        term: Terminal,
    ) -> Result<(EdgeValue, NodeId)> {
        let n = self.num_vars as usize;
        if un.len() != n || pr.is_some() != self.relation {
            return Err(DdError::InvalidArgument);
        }
        if let Some(pr) = pr {
            if pr.len() != n {
                return Err(DdError::InvalidArgument);
            }
        }
        // Validate up front so the build below cannot fail halfway.
        for p in 0..n {
            let bound = self.bound(Level::unprimed((p + 1) as u32)) as i32;
            let u = un[p];
            if u != DONT_CARE && !(0..bound).contains(&u) {
                return Err(DdError::InvalidAssignment);
            }
            if let Some(pr) = pr {
                let v = pr[p];
                if v != DONT_CARE && v != DONT_CHANGE && !(0..bound).contains(&v) {
                    return Err(DdError::InvalidAssignment);
                }
                if v == DONT_CHANGE && u != DONT_CARE {
                    // A fixed unprimed value with "don't change" is just
                    // the pair (u, u); normalize below.
                }
            }
        }

        let (mut ev, mut h) = self.constant(term)?;
        for p in 0..n {
            let k = (p + 1) as u32;
            let bound = self.bound(Level::unprimed((p + 1) as u32));
            let u = un[p];
            let v = pr.map(|pr| pr[p]);

            if self.relation {
                let v = v.unwrap();
                if u == DONT_CARE
                    && v == DONT_CHANGE
                    && self.policies.reduction == ReductionRule::Identity
                {
                    // Identity pair: skipped entirely.
                    continue;
                }
                let rows: Vec<usize> = if u == DONT_CARE {
                    (0..bound).collect()
                } else {
                    vec![u as usize]
                };
                let mut nb = self.new_builder(Level::unprimed(k));
                for &i in &rows {
                    let cols: Vec<usize> = match v {
                        DONT_CARE => (0..bound).collect(),
                        DONT_CHANGE => vec![i],
                        j => vec![j as usize],
                    };
                    let mut pb = self.new_builder(Level::primed(k));
                    for &j in &cols {
                        self.link(h);
                        pb.set(j, ev, h);
                    }
                    let (pev, pnode) = self.reduce(i as i32, pb)?;
                    nb.set(i, pev, pnode);
                }
                self.unlink(h);
                let (nev, nnode) = self.reduce(-1, nb)?;
                ev = nev;
                h = nnode;
            } else {
                if u == DONT_CARE && self.policies.reduction == ReductionRule::Fully {
                    continue;
                }
                let indices: Vec<usize> = if u == DONT_CARE {
                    (0..bound).collect()
                } else {
                    vec![u as usize]
                };
                let mut nb = self.new_builder(Level::unprimed(k));
                for &i in &indices {
                    self.link(h);
                    nb.set(i, ev, h);
                }
                self.unlink(h);
                let (nev, nnode) = self.reduce(-1, nb)?;
                ev = nev;
                h = nnode;
            }
        }
        Ok((ev, h))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Number of distinct non-terminal nodes reachable from `h`.
    pub(crate) fn reachable_count(&self, h: NodeId) -> usize {
        let mut seen = hashbrown::HashSet::new();
        let mut stack = vec![h];
        while let Some(n) = stack.pop() {
            if n.is_terminal() || !seen.insert(n.raw()) {
                continue;
            }
            let r = self.unpack(n);
            for z in 0..r.nnz() {
                stack.push(r.d_at(z));
            }
        }
        seen.len()
    }

    /// Largest child index stored by any live node at level position
    /// `pos` (either sign), for bound-shrink validation.
    pub(crate) fn max_index_at_position(&self, pos: u32) -> usize {
        if pos == 0 || pos > self.num_vars {
            return 0;
        }
        let mut max = 0usize;
        for level in [Level::unprimed(pos), Level::primed(pos)] {
            if level.is_primed() && !self.relation {
                continue;
            }
            let lidx = self.lidx(level);
            let arena = &self.arenas[lidx];
            let slots = arena.slots();
            let mut off = 1usize;
            while off <= arena.last() {
                let head = slots[off];
                if head < 0 {
                    off += (-head) as usize;
                    continue;
                }
                let len = arena.chunk_len(slots[off + 1]);
                for (i, _, _) in chunk_entries(&slots[off..off + len], self.vpc()) {
                    max = max.max(i as usize);
                }
                off += len;
            }
        }
        max
    }

    pub(crate) fn set_position_bound(&mut self, pos: u32, bound: u32) {
        let un = self.lidx(Level::unprimed(pos));
        self.bounds[un] = bound;
        if self.relation {
            let pr = self.lidx(Level::primed(pos));
            self.bounds[pr] = bound;
        }
    }

    /// Reduced nodes living at a level position (both signs).
    pub(crate) fn level_node_count(&self, pos: u32) -> usize {
        let mut c = self.unique.count(self.lidx(Level::unprimed(pos)));
        if self.relation {
            c += self.unique.count(self.lidx(Level::primed(pos)));
        }
        c
    }

    pub(crate) fn slot_memory(&self) -> usize {
        self.arenas.iter().map(|a| a.total_slots() * 8).sum()
    }

    pub(crate) fn hole_slots(&self) -> usize {
        self.arenas.iter().map(|a| a.hole_slots()).sum()
    }

    /// Sum of incoming counts over all live nodes (testing aid).
    pub(crate) fn total_incoming(&self) -> u64 {
        self.address
            .iter()
            .filter(|e| matches!(e.status, NodeStatus::Active | NodeStatus::Orphan))
            .map(|e| e.incoming as u64)
            .sum()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.stats.current_nodes
    }

    // Used by reordering.
    pub(crate) fn take_level_nodes(&mut self, level: Level) -> Vec<NodeId> {
        let lidx = self.lidx(level);
        self.unique.take_level(lidx)
    }

    pub(crate) fn take_from_unique(&mut self, h: NodeId) {
        let level = self.address[h.index()].level;
        let lidx = self.lidx(level);
        let removed = self.unique.remove(lidx, h);
        debug_assert!(removed, "{} missing from unique table", h);
    }

    pub(crate) fn reinsert_node(&mut self, h: NodeId) {
        let level = self.address[h.index()].level;
        let lidx = self.lidx(level);
        let hash = self.node_hash(h);
        self.unique.insert(lidx, hash, h);
    }

    /// Moves a node's record to (the arena of) a different level without
    /// touching its children or counts. The caller is responsible for
    /// unique-table membership.
    pub(crate) fn relevel(&mut self, h: NodeId, new_level: Level) {
        let idx = h.index();
        let old_level = self.address[idx].level;
        if old_level == new_level {
            return;
        }
        let old_lidx = self.lidx(old_level);
        let new_lidx = self.lidx(new_level);
        let old_off = self.address[idx].offset;
        let len = {
            let a = &self.arenas[old_lidx];
            a.chunk_len(a.slots()[old_off + 1])
        };
        let chunk: Vec<i64> = self.arenas[old_lidx].slots()[old_off..old_off + len].to_vec();
        self.arenas[old_lidx].recycle(old_off, len);
        let new_off = self.arenas[new_lidx].request(len);
        self.arenas[new_lidx].slots_mut()[new_off..new_off + len].copy_from_slice(&chunk);
        self.address[idx].offset = new_off;
        self.address[idx].level = new_level;
        if let Some(lg) = self.logger.as_mut() {
            lg.active_delta(old_level, -1);
            lg.active_delta(new_level, 1);
        }
    }

    /// Swaps the storage of two handles, so every edge held on `a` now
    /// sees `b`'s former content and vice versa. Unique-table membership
    /// must be fixed up by the caller.
    pub(crate) fn swap_node_contents(&mut self, a: NodeId, b: NodeId) {
        let (ai, bi) = (a.index(), b.index());
        debug_assert_ne!(ai, bi);
        let a_level = self.address[ai].level;
        let a_offset = self.address[ai].offset;
        let b_level = self.address[bi].level;
        let b_offset = self.address[bi].offset;
        self.address[ai].level = b_level;
        self.address[ai].offset = b_offset;
        self.address[bi].level = a_level;
        self.address[bi].offset = a_offset;
        // Fix the back-pointers inside both chunks.
        for (h, level, offset) in [(a, b_level, b_offset), (b, a_level, a_offset)] {
            let lidx = self.lidx(level);
            let arena = &mut self.arenas[lidx];
            let len = arena.chunk_len(arena.slots()[offset + 1]);
            let slots = arena.slots_mut();
            slots[offset] = h.raw();
            slots[offset + len - 1] = h.raw();
        }
    }
}

/// Combines a carried edge value with a factored one.
pub(crate) fn combine(labeling: EdgeLabeling, a: EdgeValue, b: EdgeValue) -> EdgeValue {
    match labeling {
        EdgeLabeling::MultiTerminal => EdgeValue::Void,
        EdgeLabeling::EvPlus => EdgeValue::Plus(crate::types::plus_add(a.plus(), b.plus())),
        EdgeLabeling::EvTimes => EdgeValue::Times(a.times() * b.times()),
    }
}

/// Hash of a builder's content; must agree with [`ForestInner::node_hash`].
fn builder_hash(b: &NodeBuilder, labeling: EdgeLabeling) -> u64 {
    let mut hasher = NodeHasher::new(b.level().raw() as i64 as u64);
    for i in 0..b.size() {
        if b.is_transparent(i) {
            continue;
        }
        hasher.push2(i as u64, b.d(i).raw() as u64);
        if labeling == EdgeLabeling::EvPlus {
            hasher.push(b.ev(i).to_bits() as u64);
        }
    }
    hasher.finish()
}

/// Iterates the non-transparent `(index, child, value-bits)` entries of a
/// stored chunk, in increasing index order, for either encoding.
pub(crate) fn chunk_entries(
    chunk: &[i64],
    vpc: usize,
) -> impl Iterator<Item = (u32, NodeId, i64)> + '_ {
    let tag = chunk[1];
    let (full_size, nnz) = if tag >= 0 {
        (tag as usize, tag as usize)
    } else {
        (0, (-tag) as usize)
    };
    let full = tag >= 0;
    (0..nnz).filter_map(move |z| {
        if full {
            let d = chunk[2 + z];
            if d == 0 {
                return None;
            }
            let bits = if vpc == 1 { chunk[2 + full_size + z] } else { 0 };
            Some((z as u32, NodeId::from_raw(d), bits))
        } else {
            let i = chunk[2 + z] as u32;
            let d = chunk[2 + nnz + z];
            let bits = if vpc == 1 { chunk[2 + 2 * nnz + z] } else { 0 };
            Some((i, NodeId::from_raw(d), bits))
        }
    })
}

// ----------------------------------------------------------------------
// Public handle
// ----------------------------------------------------------------------

/// A forest of decision-diagram nodes sharing one domain, reduction rule,
/// and edge labeling.
///
/// `Forest` is a shared handle; cloning it clones the handle. All
/// operations on edges of the same forest are non-reentrant and must not
/// be interleaved (the library is single-threaded).
#[derive(Clone)]
pub struct Forest {
    pub(crate) inner: Rc<RefCell<ForestInner>>,
}

impl Forest {
    pub(crate) fn new(
        domain: &Domain,
        relation: bool,
        range: RangeType,
        labeling: EdgeLabeling,
        policies: Policies,
    ) -> Result<Forest> {
        if policies.reduction == ReductionRule::Identity && !relation {
            return Err(DdError::InvalidOperation);
        }
        match (labeling, range) {
            (EdgeLabeling::MultiTerminal, _) => {}
            (EdgeLabeling::EvPlus, RangeType::Integer) => {}
            (EdgeLabeling::EvTimes, RangeType::Real) => {}
            _ => return Err(DdError::TypeMismatch),
        }

        let mut dom = domain.inner.borrow_mut();
        let num_vars = (dom.bounds.len() - 1) as u32;
        let num_levels = if relation {
            2 * num_vars as usize
        } else {
            num_vars as usize
        };
        let mut bounds = vec![0u32; num_levels];
        for pos in 1..=num_vars as usize {
            let b = dom.bounds[dom.var_at_level[pos] as usize];
            if relation {
                bounds[2 * (pos - 1)] = b;
                bounds[2 * (pos - 1) + 1] = b;
            } else {
                bounds[pos - 1] = b;
            }
        }
        let vpc = (labeling != EdgeLabeling::MultiTerminal) as usize;
        let id = dom.next_forest_id;
        dom.next_forest_id += 1;
        debug!(
            "forest {}: relation={} range={:?} labeling={:?} reduction={:?}",
            id, relation, range, labeling, policies.reduction
        );

        let inner = Rc::new(RefCell::new(ForestInner {
            id,
            domain: Rc::clone(&domain.inner),
            domain_id: dom.id,
            relation,
            range,
            labeling,
            policies,
            num_vars,
            bounds,
            address: vec![AddressEntry::FREE],
            free_head: -1,
            arenas: (0..num_levels).map(|_| LevelArena::new(vpc)).collect(),
            unique: UniqueTable::with_levels(num_levels),
            ct: ComputeTable::default(),
            stats: ForestStats::default(),
            logger: None,
            splits: None,
            orphans: 0,
            zombies: 0,
            in_gc: false,
        }));
        dom.forests.push(Rc::downgrade(&inner));
        Ok(Forest { inner })
    }

    pub fn domain(&self) -> Domain {
        Domain {
            inner: Rc::clone(&self.inner.borrow().domain),
        }
    }

    pub fn is_relation(&self) -> bool {
        self.inner.borrow().relation
    }

    pub fn range_type(&self) -> RangeType {
        self.inner.borrow().range
    }

    pub fn edge_labeling(&self) -> EdgeLabeling {
        self.inner.borrow().labeling
    }

    pub fn reduction_rule(&self) -> ReductionRule {
        self.inner.borrow().policies.reduction
    }

    pub fn num_variables(&self) -> u32 {
        self.inner.borrow().num_vars
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> ForestStats {
        self.inner.borrow().stats.clone()
    }

    pub fn active_node_count(&self) -> usize {
        self.inner.borrow().active_count()
    }

    pub fn peak_node_count(&self) -> usize {
        self.inner.borrow().stats.peak_nodes
    }

    /// Bytes currently backing node storage.
    pub fn memory_used(&self) -> usize {
        self.inner.borrow().slot_memory()
    }

    pub fn hole_slots(&self) -> usize {
        self.inner.borrow().hole_slots()
    }

    /// Compute-table hit/miss counters.
    pub fn compute_table_counters(&self) -> (usize, usize) {
        let inner = self.inner.borrow();
        (inner.ct.hits(), inner.ct.misses())
    }

    /// Chain-length histogram of the unique table at an unprimed level.
    pub fn unique_table_histogram(&self, pos: u32) -> Result<Vec<usize>> {
        let inner = self.inner.borrow();
        if pos == 0 || pos > inner.num_vars {
            return Err(DdError::InvalidLevel);
        }
        let lidx = inner.lidx(Level::unprimed(pos));
        Ok(inner.unique.chain_histogram(lidx))
    }

    /// Runs a garbage-collection cycle; returns reclaimed node count.
    pub fn garbage_collect(&self) -> usize {
        self.inner.borrow_mut().gc()
    }

    /// Attaches a logger sink, emitting the forest-info preamble.
    pub fn set_logger(&self, logger: Option<Box<dyn ForestLogger>>) {
        let mut inner = self.inner.borrow_mut();
        inner.logger = logger;
        let num_vars = inner.num_vars;
        let counts: Vec<i64> = (1..=num_vars)
            .map(|k| inner.unique.count(inner.lidx(Level::unprimed(k))) as i64)
            .collect();
        if let Some(lg) = inner.logger.as_mut() {
            lg.forest_info(num_vars as usize, &counts);
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Forest) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Forest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Forest")
            .field("id", &inner.id)
            .field("relation", &inner.relation)
            .field("range", &inner.range)
            .field("labeling", &inner.labeling)
            .field("reduction", &inner.policies.reduction)
            .field("nodes", &inner.stats.current_nodes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::types::Terminal;

    fn forest(deletion: NodeDeletion) -> (Domain, Forest) {
        let d = Domain::bottom_up(&[4, 4, 4]).unwrap();
        let f = d
            .new_forest(
                false,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(false).with_deletion(deletion),
            )
            .unwrap();
        (d, f)
    }

    #[test]
    fn test_canonicity_of_minterm_batches() {
        let (_d, f) = forest(NodeDeletion::Pessimistic);
        let a = f
            .edge_from_minterms(&[vec![0, 1, 2], vec![3, 2, 1], vec![1, 1, 1]], None)
            .unwrap();
        let b = f
            .edge_from_minterms(&[vec![1, 1, 1], vec![0, 1, 2], vec![3, 2, 1]], None)
            .unwrap();
        assert_eq!(a, b);
        // Equal handles, not merely equal functions.
        assert_eq!(a.node(), b.node());
    }

    #[test]
    fn test_redundant_collapse() {
        let (_d, f) = forest(NodeDeletion::Pessimistic);
        let mut inner = f.inner.borrow_mut();
        let truth = inner.terminal(Terminal::Bool(true));
        let mut nb = inner.new_builder(Level::unprimed(2));
        for i in 0..4 {
            nb.set_d(i, truth);
        }
        let (_, h) = inner.reduce(-1, nb).unwrap();
        assert_eq!(h, truth);
    }

    #[test]
    fn test_identity_pattern_collapse() {
        let d = Domain::bottom_up(&[3, 3]).unwrap();
        let f = d
            .new_forest(
                true,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(true),
            )
            .unwrap();
        let mut inner = f.inner.borrow_mut();
        let truth = inner.terminal(Terminal::Bool(true));
        // A primed node holding only its diagonal entry collapses.
        let mut pb = inner.new_builder(Level::primed(1));
        pb.set_d(2, truth);
        let (_, h) = inner.reduce(2, pb).unwrap();
        assert_eq!(h, truth);
        // Under any other parent index it stays materialized.
        let mut pb = inner.new_builder(Level::primed(1));
        pb.set_d(2, truth);
        let (_, h) = inner.reduce(0, pb).unwrap();
        assert!(!h.is_terminal());
        inner.unlink(h);
    }

    #[test]
    fn test_ev_times_normalization() {
        // Hand-worked: children values (-2, 4) with the lowest-indexed
        // non-transparent child at index 0 give carry -2 and stored
        // values (1, -2).
        let d = Domain::bottom_up(&[2]).unwrap();
        let f = d
            .new_forest(false, RangeType::Real, EdgeLabeling::EvTimes, Policies::new(false))
            .unwrap();
        let e = f
            .edge_for_variable(1, false, Some(&[Terminal::Real(-2.0), Terminal::Real(4.0)]))
            .unwrap();
        assert_eq!(e.value(), EdgeValue::Times(-2.0));
        let (v0, _) = e.evaluate(&[0], None).unwrap();
        let (v1, _) = e.evaluate(&[1], None).unwrap();
        assert!(v0.close_to(EdgeValue::Times(-2.0)));
        assert!(v1.close_to(EdgeValue::Times(4.0)));
        // Scale invariance: a scalar multiple shares the node.
        let e2 = f
            .edge_for_variable(1, false, Some(&[Terminal::Real(-1.0), Terminal::Real(2.0)]))
            .unwrap();
        assert_eq!(e.node(), e2.node());
        assert_eq!(e2.value(), EdgeValue::Times(-1.0));
    }

    #[test]
    fn test_link_unlink_roundtrip() {
        let (_d, f) = forest(NodeDeletion::Pessimistic);
        let a = f.edge_from_minterms(&[vec![0, 1, 2], vec![1, 2, 3]], None).unwrap();
        let node = a.node();
        let before = f.inner.borrow().entry(node).incoming;
        {
            let mut inner = f.inner.borrow_mut();
            inner.link(node);
            inner.unlink(node);
        }
        assert_eq!(f.inner.borrow().entry(node).incoming, before);
    }

    #[test]
    fn test_incoming_counts_match_edges() {
        let (_d, f) = forest(NodeDeletion::Pessimistic);
        let a = f
            .edge_from_minterms(&[vec![0, 1, 2], vec![3, 2, 1], vec![0, 2, 2]], None)
            .unwrap();
        let b = a.complement().unwrap();
        let inner = f.inner.borrow();
        // Parent edges: every non-transparent child slot of every live node.
        let mut parent_edges = 0u64;
        for idx in 1..inner.address.len() {
            if !matches!(
                inner.address[idx].status,
                NodeStatus::Active | NodeStatus::Orphan
            ) {
                continue;
            }
            let r = inner.unpack(NodeId::from_index(idx));
            parent_edges += (0..r.nnz()).filter(|&z| !r.d_at(z).is_terminal()).count() as u64;
        }
        let top_edges = [&a, &b]
            .iter()
            .filter(|e| !e.node().is_terminal())
            .count() as u64;
        assert_eq!(inner.total_incoming(), parent_edges + top_edges);
    }

    #[test]
    fn test_pessimistic_deletion_reclaims() {
        let (_d, f) = forest(NodeDeletion::Pessimistic);
        {
            let _a = f
                .edge_from_minterms(&[vec![0, 1, 2], vec![3, 2, 1], vec![2, 0, 3]], None)
                .unwrap();
            assert!(f.active_node_count() > 0);
        }
        assert_eq!(f.active_node_count(), 0);
        assert!(f.peak_node_count() > 0);
    }

    #[test]
    fn test_optimistic_deletion_waits_for_gc() {
        let (_d, f) = forest(NodeDeletion::Optimistic);
        {
            let _a = f
                .edge_from_minterms(&[vec![0, 1, 2], vec![3, 2, 1]], None)
                .unwrap();
        }
        // Orphans survive until the next cycle.
        assert!(f.active_node_count() > 0);
        f.garbage_collect();
        assert_eq!(f.active_node_count(), 0);
    }

    #[test]
    fn test_sparse_and_full_encodings_unify() {
        let d = Domain::bottom_up(&[8, 8]).unwrap();
        let full = d
            .new_forest(
                false,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(false).with_storage(NodeStorage::Full),
            )
            .unwrap();
        let sparse = d
            .new_forest(
                false,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(false).with_storage(NodeStorage::Sparse),
            )
            .unwrap();
        // The same function, one forest storing dense and one sparse.
        let m = vec![vec![1, 7], vec![1, 2]];
        let a = full.edge_from_minterms(&m, None).unwrap();
        let b = sparse.edge_from_minterms(&m, None).unwrap();
        assert_eq!(a.cardinality(), b.cardinality());
        for x in 0..8 {
            for y in 0..8 {
                let (_, ta) = a.evaluate(&[x, y], None).unwrap();
                let (_, tb) = b.evaluate(&[x, y], None).unwrap();
                assert_eq!(ta, tb);
            }
        }
    }

    #[test]
    fn test_stats_and_histogram() {
        let (_d, f) = forest(NodeDeletion::Pessimistic);
        let _a = f
            .edge_from_minterms(&[vec![0, 1, 2], vec![3, 2, 1], vec![2, 2, 2]], None)
            .unwrap();
        let stats = f.stats();
        assert!(stats.created > 0);
        assert!(stats.peak_nodes >= stats.current_nodes);
        assert!(f.memory_used() > 0);
        let hist = f.unique_table_histogram(1).unwrap();
        assert!(!hist.is_empty());
        assert!(f.unique_table_histogram(9).is_err());
    }
}
