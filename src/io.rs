//! Serialization of edges as rooted subgraph dumps.
//!
//! The format is line-oriented text with a preamble, written bottom up
//! so children always precede their parents. It round-trips within the
//! same library version; the reader rebuilds every node through the
//! reducer, so handles come back canonical even if the dump was produced
//! by a forest with different storage choices.
//!
//! ```text
//! mdd-rs edges 1
//! forest <relation> <range> <labeling> <reduction> <num-vars>
//! nodes <count>
//! n <level> <nnz> <idx>:<child>[:<value-bits>] ...
//! roots <count>
//! r <value-bits> <target>
//! end
//! ```
//!
//! Child and target references are `t<raw>` for terminals and `n<k>`
//! for the k-th node record of the dump.

use std::io::{BufRead, Write};
use std::rc::Rc;

use hashbrown::HashMap;

use crate::edge::Edge;
use crate::error::{DdError, Result};
use crate::forest::Forest;
use crate::types::{EdgeLabeling, EdgeValue, Level, NodeId, RangeType, ReductionRule};

fn range_tag(r: RangeType) -> char {
    match r {
        RangeType::Boolean => 'B',
        RangeType::Integer => 'I',
        RangeType::Real => 'R',
    }
}

fn labeling_tag(l: EdgeLabeling) -> char {
    match l {
        EdgeLabeling::MultiTerminal => 'M',
        EdgeLabeling::EvPlus => '+',
        EdgeLabeling::EvTimes => '*',
    }
}

fn reduction_tag(r: ReductionRule) -> char {
    match r {
        ReductionRule::Fully => 'F',
        ReductionRule::Quasi => 'Q',
        ReductionRule::Identity => 'I',
    }
}

/// Writes a batch of edges (all of one forest) as a rooted subgraph
/// dump.
pub fn write_edges<W: Write>(out: &mut W, edges: &[&Edge]) -> Result<()> {
    let Some(first) = edges.first() else {
        return Err(DdError::InvalidArgument);
    };
    if !edges
        .iter()
        .all(|e| Rc::ptr_eq(&e.forest, &first.forest))
    {
        return Err(DdError::ForestMismatch);
    }
    let f = first.forest.borrow();

    // Children-first ordering over the reachable subgraph.
    let mut order: Vec<NodeId> = Vec::new();
    let mut index: HashMap<i64, usize> = HashMap::new();
    let mut stack: Vec<(NodeId, bool)> = edges.iter().map(|e| (e.node, false)).collect();
    while let Some((h, expanded)) = stack.pop() {
        if h.is_terminal() || index.contains_key(&h.raw()) {
            continue;
        }
        if expanded {
            index.insert(h.raw(), order.len());
            order.push(h);
            continue;
        }
        stack.push((h, true));
        let r = f.unpack(h);
        for z in 0..r.nnz() {
            stack.push((r.d_at(z), false));
        }
    }

    let mut emit = || -> std::io::Result<()> {
        writeln!(out, "mdd-rs edges 1")?;
        writeln!(
            out,
            "forest {} {} {} {} {}",
            f.relation as u8,
            range_tag(f.range),
            labeling_tag(f.labeling),
            reduction_tag(f.policies.reduction),
            f.num_vars
        )?;
        writeln!(out, "nodes {}", order.len())?;
        for &h in &order {
            let r = f.unpack(h);
            write!(out, "n {} {}", r.level().raw(), r.nnz())?;
            for z in 0..r.nnz() {
                let d = r.d_at(z);
                if d.is_terminal() {
                    write!(out, " {}:t{}", r.idx(z), d.raw())?;
                } else {
                    write!(out, " {}:n{}", r.idx(z), index[&d.raw()])?;
                }
                if f.labeling != EdgeLabeling::MultiTerminal {
                    write!(out, ":{}", r.ev_at(z).to_bits())?;
                }
            }
            writeln!(out)?;
        }
        writeln!(out, "roots {}", edges.len())?;
        for e in edges {
            let target = if e.node.is_terminal() {
                format!("t{}", e.node.raw())
            } else {
                format!("n{}", index[&e.node.raw()])
            };
            writeln!(out, "r {} {}", e.value.to_bits(), target)?;
        }
        writeln!(out, "end")?;
        Ok(())
    };
    emit().map_err(|_| DdError::Miscellaneous)
}

fn parse_err() -> DdError {
    DdError::Miscellaneous
}

fn next_line<R: BufRead>(lines: &mut std::io::Lines<R>) -> Result<String> {
    lines
        .next()
        .ok_or_else(parse_err)?
        .map_err(|_| parse_err())
}

/// Reads a dump back into a forest with a matching configuration.
pub fn read_edges<R: BufRead>(input: R, forest: &Forest) -> Result<Vec<Edge>> {
    let mut lines = input.lines();
    if next_line(&mut lines)? != "mdd-rs edges 1" {
        return Err(parse_err());
    }
    {
        let f = forest.inner.borrow();
        let expect = format!(
            "forest {} {} {} {} {}",
            f.relation as u8,
            range_tag(f.range),
            labeling_tag(f.labeling),
            reduction_tag(f.policies.reduction),
            f.num_vars
        );
        if next_line(&mut lines)? != expect {
            return Err(DdError::TypeMismatch);
        }
    }

    let mut f = forest.inner.borrow_mut();
    let labeling = f.labeling;
    let mut nodes: Vec<NodeId> = Vec::new();

    let resolve = |nodes: &[NodeId], tok: &str| -> Result<NodeId> {
        if let Some(raw) = tok.strip_prefix('t') {
            let raw: i64 = raw.parse().map_err(|_| parse_err())?;
            if raw > 0 {
                return Err(parse_err());
            }
            Ok(NodeId::from_raw(raw))
        } else if let Some(k) = tok.strip_prefix('n') {
            let k: usize = k.parse().map_err(|_| parse_err())?;
            nodes.get(k).copied().ok_or_else(parse_err)
        } else {
            Err(parse_err())
        }
    };

    let cleanup = |f: &mut crate::forest::ForestInner, nodes: &[NodeId]| {
        for &n in nodes {
            f.unlink(n);
        }
    };

    let header = next_line(&mut lines)?;
    let count: usize = header
        .strip_prefix("nodes ")
        .and_then(|s| s.parse().ok())
        .ok_or_else(parse_err)?;
    for _ in 0..count {
        let line = next_line(&mut lines)?;
        let mut tok = line.split_whitespace();
        if tok.next() != Some("n") {
            cleanup(&mut f, &nodes);
            return Err(parse_err());
        }
        let mut build = || -> Option<(i32, usize)> {
            let level: i32 = tok.next()?.parse().ok()?;
            let nnz: usize = tok.next()?.parse().ok()?;
            Some((level, nnz))
        };
        let Some((level, nnz)) = build() else {
            cleanup(&mut f, &nodes);
            return Err(parse_err());
        };
        let level = Level::new(level);
        if level.is_terminal()
            || level.pos() > f.num_vars
            || (level.is_primed() && !f.relation)
        {
            cleanup(&mut f, &nodes);
            return Err(DdError::InvalidLevel);
        }
        let mut nb = f.new_builder(level);
        let mut ok = true;
        for _ in 0..nnz {
            let Some(entry) = tok.next() else {
                ok = false;
                break;
            };
            let mut parts = entry.split(':');
            let parsed = (|| -> Result<(usize, NodeId, i64)> {
                let idx: usize = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(parse_err)?;
                let child = resolve(&nodes, parts.next().ok_or_else(parse_err)?)?;
                let bits = match parts.next() {
                    Some(s) => s.parse().map_err(|_| parse_err())?,
                    None => 0,
                };
                Ok((idx, child, bits))
            })();
            match parsed {
                Ok((idx, child, bits)) => {
                    if idx >= nb.size() {
                        ok = false;
                        break;
                    }
                    f.link(child);
                    nb.set(idx, EdgeValue::from_bits(labeling, bits), child);
                }
                Err(_) => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            f.discard_builder(&nb);
            cleanup(&mut f, &nodes);
            return Err(parse_err());
        }
        match f.reduce(-1, nb) {
            Ok((_, h)) => nodes.push(h),
            Err(e) => {
                cleanup(&mut f, &nodes);
                return Err(e);
            }
        }
    }

    let header = next_line(&mut lines)?;
    let count: usize = header
        .strip_prefix("roots ")
        .and_then(|s| s.parse().ok())
        .ok_or_else(parse_err)?;
    let mut roots = Vec::with_capacity(count);
    for _ in 0..count {
        let line = next_line(&mut lines)?;
        let mut tok = line.split_whitespace();
        let parsed = (|| -> Result<(i64, NodeId)> {
            if tok.next() != Some("r") {
                return Err(parse_err());
            }
            let bits: i64 = tok
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(parse_err)?;
            let target = resolve(&nodes, tok.next().ok_or_else(parse_err)?)?;
            Ok((bits, target))
        })();
        match parsed {
            Ok((bits, target)) => {
                f.link(target);
                roots.push((EdgeValue::from_bits(labeling, bits), target));
            }
            Err(e) => {
                cleanup(&mut f, &nodes);
                for (_, t) in roots {
                    f.unlink(t);
                }
                return Err(e);
            }
        }
    }
    if next_line(&mut lines)? != "end" {
        cleanup(&mut f, &nodes);
        for (_, t) in roots {
            f.unlink(t);
        }
        return Err(parse_err());
    }
    cleanup(&mut f, &nodes);
    drop(f);
    Ok(roots
        .into_iter()
        .map(|(v, n)| Edge::new(Rc::clone(&forest.inner), v, n))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::forest::Policies;
    use crate::types::DONT_CARE;

    #[test]
    fn test_roundtrip_set() {
        let d = Domain::bottom_up(&[3, 3, 3]).unwrap();
        let f = d
            .new_forest(
                false,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(false),
            )
            .unwrap();
        let a = f
            .edge_from_minterms(&[vec![0, 1, 2], vec![2, DONT_CARE, 0], vec![1, 1, 1]], None)
            .unwrap();
        let b = f.edge_from_minterms(&[vec![2, 2, 2]], None).unwrap();

        let mut dump = Vec::new();
        write_edges(&mut dump, &[&a, &b]).unwrap();
        let back = read_edges(&dump[..], &f).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0], a);
        assert_eq!(back[1], b);
    }

    #[test]
    fn test_roundtrip_ev_plus() {
        let d = Domain::bottom_up(&[3, 3]).unwrap();
        let f = d
            .new_forest(false, RangeType::Integer, EdgeLabeling::EvPlus, Policies::new(false))
            .unwrap();
        let x1 = f.edge_for_variable(1, false, None).unwrap();
        let x2 = f.edge_for_variable(2, false, None).unwrap();
        let sum = x1.plus(&x2).unwrap();

        let mut dump = Vec::new();
        write_edges(&mut dump, &[&sum]).unwrap();
        let back = read_edges(&dump[..], &f).unwrap();
        assert_eq!(back[0], sum);
    }

    #[test]
    fn test_rejects_mismatched_forest() {
        let d = Domain::bottom_up(&[3, 3]).unwrap();
        let f = d
            .new_forest(
                false,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(false),
            )
            .unwrap();
        let g = d
            .new_forest(
                true,
                RangeType::Boolean,
                EdgeLabeling::MultiTerminal,
                Policies::new(true),
            )
            .unwrap();
        let a = f.edge_from_minterms(&[vec![0, 1]], None).unwrap();
        let mut dump = Vec::new();
        write_edges(&mut dump, &[&a]).unwrap();
        assert_eq!(read_edges(&dump[..], &g).unwrap_err(), DdError::TypeMismatch);
    }
}
