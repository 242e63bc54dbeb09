//! Liveness analysis with use-distance bookkeeping.
//!
//! Distances are what make Belady's furthest-use spill selection work: a
//! use on the far side of a call or down an unlikely branch is pushed out
//! by a penalty, so the allocator prefers to evict values it would have had
//! to spill anyway.
//!
//! Rematerializable values are not dropped from the live sets at call
//! boundaries even though their registers die there; the allocator frees
//! their registers without a spill and recomputes at the next use, so the
//! extra entries never add spill pressure.

use crate::entity::SecondaryMap;
use crate::ssa::{branch_hint, BlockId, Func, SsaOp, ValueId};
use std::collections::HashMap;

/// Edge distance to a likely branch successor.
pub const DIST_LIKELY: u32 = 1;
/// Edge distance to a normal successor.
pub const DIST_NORMAL: u32 = 10;
/// Edge distance to an unlikely successor, and the penalty for crossing a
/// call.
pub const DIST_CALL: u32 = 100;

/// Sentinel for "no further call in this block".
pub const NO_CALL: u32 = u32::MAX;

/// Per-block liveness results.
#[derive(Clone, Debug, Default)]
pub struct BlockLiveness {
    /// Values live at the block's terminator, with the distance from the
    /// block end to their next use.
    pub live_out: HashMap<ValueId, u32>,
    /// In-block use positions of each value, ascending. Phi arguments count
    /// as uses on the predecessor edges, not here.
    pub use_positions: HashMap<ValueId, Vec<u32>>,
    /// `call_prefix[i]` = number of calls at positions `< i`. Has
    /// `len + 1` entries.
    pub call_prefix: Vec<u32>,
    /// `next_call[i]` = position of the first call at or after `i`, or
    /// `NO_CALL`.
    pub next_call: Vec<u32>,
}

/// The result of liveness analysis over a function.
#[derive(Clone, Debug, Default)]
pub struct Liveness {
    /// Per-block results.
    pub blocks: SecondaryMap<BlockId, BlockLiveness>,
}

impl Liveness {
    /// Distance from position `pos` in `block` to the next use of `v`, with
    /// call penalties applied, or `None` when `v` is dead past `pos`.
    ///
    /// Positions refer to the block as it was when the analysis ran; the
    /// allocator walks that snapshot even while it splices in markers.
    pub fn next_use_distance(&self, block: BlockId, pos: u32, v: ValueId) -> Option<u32> {
        let bl = &self.blocks[block];
        if let Some(uses) = bl.use_positions.get(&v) {
            if let Some(&q) = uses.iter().find(|&&q| q >= pos) {
                let penalty = DIST_CALL * (bl.call_prefix[q as usize] - bl.call_prefix[pos as usize]);
                return Some(q - pos + penalty);
            }
        }
        let len = (bl.call_prefix.len() - 1) as u32;
        bl.live_out.get(&v).map(|&d| {
            let penalty =
                DIST_CALL * (bl.call_prefix[len as usize] - bl.call_prefix[pos as usize]);
            len - pos + penalty + d
        })
    }

    /// Is `v` live out of `block`?
    pub fn is_live_out(&self, block: BlockId, v: ValueId) -> bool {
        self.blocks[block].live_out.contains_key(&v)
    }
}

/// The distance of the edge from `block` to its `edge`-th successor.
fn edge_distance(func: &Func, block: BlockId) -> Vec<(BlockId, u32)> {
    let Some(term) = func.terminator(block) else {
        return Vec::new();
    };
    let data = &func.values[term];
    let targets = data.targets();
    match data.op {
        SsaOp::Brif => {
            let (then_d, else_d) = match data.aux_int {
                branch_hint::THEN_LIKELY => (DIST_LIKELY, DIST_CALL),
                branch_hint::ELSE_LIKELY => (DIST_CALL, DIST_LIKELY),
                _ => (DIST_NORMAL, DIST_NORMAL),
            };
            vec![(targets[0], then_d), (targets[1], else_d)]
        }
        _ => targets.iter().map(|&t| (t, DIST_NORMAL)).collect(),
    }
}

/// Compute liveness for `func`.
pub fn compute_liveness(func: &Func) -> Liveness {
    let mut result = Liveness::default();
    result.blocks.resize(func.blocks.len());

    // Use positions and call tables do not depend on the dataflow.
    for block in func.blocks.keys() {
        let bl = &mut result.blocks[block];
        let values = &func.blocks[block].values;
        bl.call_prefix = Vec::with_capacity(values.len() + 1);
        bl.call_prefix.push(0);
        let mut calls = 0;
        for (i, &v) in values.iter().enumerate() {
            let data = &func.values[v];
            if data.op != SsaOp::Phi {
                for &arg in &data.args {
                    bl.use_positions.entry(arg).or_default().push(i as u32);
                }
            }
            if data.op.is_call() {
                calls += 1;
            }
            bl.call_prefix.push(calls);
        }
        bl.next_call = vec![NO_CALL; values.len()];
        let mut next = NO_CALL;
        for i in (0..values.len()).rev() {
            if func.values[values[i]].op.is_call() {
                next = i as u32;
            }
            bl.next_call[i] = next;
        }
    }

    // Backward dataflow to a fixed point. Postorder puts successors ahead
    // of their predecessors for everything but back edges.
    let order = func.postorder();
    let mut live_in: SecondaryMap<BlockId, HashMap<ValueId, u32>> = SecondaryMap::new();
    live_in.resize(func.blocks.len());
    loop {
        let mut changed = false;
        for &block in &order {
            // Live-out: successor live-ins pushed across the edge, plus the
            // phi arguments this block feeds.
            let mut out: HashMap<ValueId, u32> = HashMap::new();
            let mut edge_index: HashMap<BlockId, usize> = HashMap::new();
            for (succ, dist) in edge_distance(func, block) {
                for (&v, &d) in &live_in[succ] {
                    merge_min(&mut out, v, dist + d);
                }
                // Which occurrence of `block` in succ's preds is this edge?
                let skip = *edge_index.entry(succ).or_insert(0);
                edge_index.insert(succ, skip + 1);
                let pred_pos = func.blocks[succ]
                    .preds
                    .iter()
                    .enumerate()
                    .filter(|(_, &p)| p == block)
                    .map(|(i, _)| i)
                    .nth(skip);
                if let Some(pred_pos) = pred_pos {
                    for &pv in &func.blocks[succ].values {
                        let data = &func.values[pv];
                        if data.op != SsaOp::Phi {
                            continue;
                        }
                        if let Some(&arg) = data.args.get(pred_pos) {
                            merge_min(&mut out, arg, dist);
                        }
                    }
                }
            }

            if result.blocks[block].live_out != out {
                result.blocks[block].live_out = out.clone();
                changed = true;
            }

            // Walk the block bottom-up to produce its live-in.
            let values = &func.blocks[block].values;
            let len = values.len() as u32;
            let mut live: HashMap<ValueId, u32> =
                out.iter().map(|(&v, &d)| (v, d + len)).collect();
            for i in (0..values.len()).rev() {
                let v = values[i];
                let data = &func.values[v];
                live.remove(&v);
                if data.op.is_call() {
                    for d in live.values_mut() {
                        *d += DIST_CALL;
                    }
                }
                if data.op != SsaOp::Phi {
                    for &arg in &data.args {
                        live.insert(arg, i as u32);
                    }
                }
            }
            if live_in[block] != live {
                live_in[block] = live;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    log::debug!(
        "liveness {}: {} blocks analyzed",
        func.name,
        func.blocks.len()
    );
    result
}

fn merge_min(map: &mut HashMap<ValueId, u32>, v: ValueId, d: u32) {
    map.entry(v)
        .and_modify(|cur| {
            if d < *cur {
                *cur = d;
            }
        })
        .or_insert(d);
}

/// Liveness monotonicity: every value live at a point is defined before it
/// or live along every path from its definition. Used by tests.
pub fn check_monotonicity(func: &Func, live: &Liveness) -> bool {
    // A value live out of a block must be defined in it or live into it
    // from every predecessor's perspective, i.e. live out of that pred too
    // or defined there. Phi arguments are exempt (their liveness ends at
    // the edge).
    for block in func.blocks.keys() {
        for &v in live.blocks[block].live_out.keys() {
            let defined_here = func.blocks[block].values.contains(&v);
            if defined_here {
                continue;
            }
            let live_in_from_some_pred = func.blocks[block].preds.iter().any(|&p| {
                live.is_live_out(p, v) || func.blocks[p].values.contains(&v)
            });
            // Entry-block live-outs with no definition would be malformed.
            if !live_in_from_some_pred && !func.blocks[block].preds.is_empty() {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::{Aux, TypeRegistry, ValueData};
    use smallvec::smallvec;

    #[test]
    fn straightline_distances() {
        let types = TypeRegistry::new();
        let mut func = Func::new("t");
        let b = func.create_block();
        let a = func.append(b, ValueData::new(SsaOp::Arg, types.i64(), []));
        let c = func.append(
            b,
            ValueData::new(SsaOp::ConstInt, types.i64(), []).with_aux_int(1),
        );
        let s = func.append(b, ValueData::new(SsaOp::Iadd, types.i64(), [a, c]));
        func.append(b, ValueData::new(SsaOp::Ret, types.i64(), [s]));

        let live = compute_liveness(&func);
        // From position 0, `a` is next used at the add (position 2).
        assert_eq!(live.next_use_distance(b, 0, a), Some(2));
        // `s` is used by the ret at position 3.
        assert_eq!(live.next_use_distance(b, 3, s), Some(0));
        // Nothing is live out of the exit block.
        assert!(live.blocks[b].live_out.is_empty());
    }

    #[test]
    fn call_penalty_pushes_uses_out() {
        let types = TypeRegistry::new();
        let mut func = Func::new("t");
        let b = func.create_block();
        let a = func.append(b, ValueData::new(SsaOp::Arg, types.i64(), []));
        func.append(
            b,
            ValueData::new(SsaOp::StaticCall, types.i64(), [])
                .with_aux(Aux::Func(crate::ssa::FuncId::from_u32(0))),
        );
        let s = func.append(b, ValueData::new(SsaOp::Iadd, types.i64(), [a, a]));
        func.append(b, ValueData::new(SsaOp::Ret, types.i64(), [s]));

        let live = compute_liveness(&func);
        // From before the call, the use of `a` at position 2 costs the call
        // penalty on top of the raw distance.
        assert_eq!(live.next_use_distance(b, 1, a), Some(1 + DIST_CALL));
        assert_eq!(live.blocks[b].next_call[0], 1);
        assert_eq!(live.blocks[b].next_call[2], NO_CALL);
    }

    #[test]
    fn loop_live_range_crosses_back_edge() {
        let types = TypeRegistry::new();
        let mut func = Func::new("t");
        let entry = func.create_block();
        let header = func.create_block();
        let exit = func.create_block();

        let n = func.append(entry, ValueData::new(SsaOp::Arg, types.i64(), []));
        func.append(
            entry,
            ValueData::new(SsaOp::Jump, types.i64(), [])
                .with_aux(Aux::Targets(smallvec![header])),
        );
        func.add_pred(header, entry);

        // header: phi i = [n, i2]; i2 = i - 1; brif i2 -> header, exit
        let phi = func.append(header, ValueData::new(SsaOp::Phi, types.i64(), [n, n]));
        let one = func.append(
            header,
            ValueData::new(SsaOp::ConstInt, types.i64(), []).with_aux_int(1),
        );
        let i2 = func.append(header, ValueData::new(SsaOp::Isub, types.i64(), [phi, one]));
        func.set_arg(phi, 1, i2);
        func.append(
            header,
            ValueData::new(SsaOp::Brif, types.i64(), [i2])
                .with_aux(Aux::Targets(smallvec![header, exit])),
        );
        func.add_pred(header, header);
        func.append(exit, ValueData::new(SsaOp::Ret, types.i64(), [i2]));
        func.add_pred(exit, header);

        let live = compute_liveness(&func);
        // i2 feeds the phi across the back edge and the ret in the exit.
        assert!(live.is_live_out(header, i2));
        // n is consumed by the phi at the header edge; it is live out of
        // the entry but not out of the header.
        assert!(live.is_live_out(entry, n));
        assert!(!live.is_live_out(header, n));
        assert!(check_monotonicity(&func, &live));
    }
}
