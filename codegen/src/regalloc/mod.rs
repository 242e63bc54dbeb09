//! Linear-scan register allocation over low SSA.
//!
//! Values are assigned homes block by block, walking each block top to
//! bottom. When a register must be freed, the victim is the occupant whose
//! next use is furthest away (Belady's rule, driven by the distances from
//! liveness). Spills and reloads are materialized as `store_reg` /
//! `load_reg` marker values; merges are reconciled with moves on the
//! in-edges after every block has been processed.
//!
//! Rematerializable values (constants, local addresses) never spill: their
//! register is simply freed and the definition is recomputed at the next
//! use site.

pub mod stackalloc;

use crate::entity::{EntityRef, SecondaryMap};
use crate::isa::{IsaKind, RegBank};
use crate::ssa::{
    Aux, BlockId, Func, Home, Liveness, SsaOp, ValueData, ValueId, NO_CALL,
};
use smallvec::smallvec;
use std::collections::{HashMap, HashSet};

/// The output of register allocation.
#[derive(Debug, Default)]
pub struct AllocResult {
    /// Spill slot index of each spilled value.
    pub spill_of: HashMap<ValueId, u32>,
    /// Number of spill slot indices handed out.
    pub num_spills: u32,
    /// Blocks in which each spill slot is written or read.
    pub spill_blocks: HashMap<u32, HashSet<BlockId>>,
    /// Callee-saved registers the function used; the prologue must save
    /// them.
    pub used_callee_saved: u32,
    /// The block order the allocator processed (reverse postorder).
    pub order: Vec<BlockId>,
}

/// Split every critical edge so that merge shuffles have a block of their
/// own, and drop blocks unreachable from the entry.
pub fn split_critical_edges(func: &mut Func) {
    prune_unreachable(func);
    let blocks: Vec<BlockId> = func.blocks.keys().collect();
    for block in blocks {
        let Some(term) = func.terminator(block) else {
            continue;
        };
        let targets: Vec<BlockId> = func.values[term].targets().to_vec();
        if targets.len() < 2 {
            continue;
        }
        for (pos, &target) in targets.iter().enumerate() {
            let has_phis = func.blocks[target]
                .values
                .iter()
                .any(|&v| func.values[v].op == SsaOp::Phi);
            if func.blocks[target].preds.len() < 2 && !has_phis {
                continue;
            }
            // The merge shuffle needs a jump-terminated predecessor to live
            // in; route the edge through a fresh block.
            let mid = func.create_block();
            let jump = ValueData::new(SsaOp::Jump, func.values[term].ty, [])
                .with_aux(Aux::Targets(smallvec![target]));
            func.append(mid, jump);
            if let Aux::Targets(ts) = &mut func.values[term].aux {
                ts[pos] = mid;
            }
            func.blocks[mid].preds.push(block);
            // Fix the matching pred entry of the target. Edges and pred
            // entries correspond by occurrence order.
            let occurrence = targets[..pos].iter().filter(|&&t| t == target).count();
            let pred_pos = func.blocks[target]
                .preds
                .iter()
                .enumerate()
                .filter(|(_, &p)| p == block)
                .map(|(i, _)| i)
                .nth(occurrence)
                .expect("preds out of sync with branch targets");
            func.blocks[target].preds[pred_pos] = mid;
        }
    }
}

/// Remove blocks unreachable from the entry, fixing predecessor lists and
/// phi argument vectors.
fn prune_unreachable(func: &mut Func) {
    let mut reachable = vec![false; func.blocks.len()];
    for b in func.postorder() {
        reachable[b.index()] = true;
    }
    for block in func.blocks.keys().collect::<Vec<_>>() {
        if !reachable[block.index()] {
            func.blocks[block].values.clear();
            func.blocks[block].preds.clear();
            continue;
        }
        let dead_positions: Vec<usize> = func.blocks[block]
            .preds
            .iter()
            .enumerate()
            .filter(|(_, p)| !reachable[p.index()])
            .map(|(i, _)| i)
            .collect();
        for &pos in dead_positions.iter().rev() {
            func.blocks[block].preds.remove(pos);
            let phis: Vec<ValueId> = func.blocks[block]
                .values
                .iter()
                .copied()
                .filter(|&v| func.values[v].op == SsaOp::Phi)
                .collect();
            for phi in phis {
                let dead_arg = func.values[phi].args[pos];
                func.values[dead_arg].uses = func.values[dead_arg].uses.saturating_sub(1);
                func.values[phi].args.remove(pos);
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
struct EndEntry {
    reg: u8,
    value: ValueId,
    incarnation: ValueId,
    dirty: bool,
}

/// Mutable per-block register file state.
struct RegFile {
    reg_val: [Option<ValueId>; 32],
    dirty: [bool; 32],
    reg_of: HashMap<ValueId, u8>,
    current: HashMap<ValueId, ValueId>,
}

impl RegFile {
    fn new() -> Self {
        Self {
            reg_val: [None; 32],
            dirty: [false; 32],
            reg_of: HashMap::new(),
            current: HashMap::new(),
        }
    }

    fn bind(&mut self, reg: u8, value: ValueId, incarnation: ValueId, dirty: bool) {
        debug_assert!(self.reg_val[reg as usize].is_none());
        self.reg_val[reg as usize] = Some(value);
        self.dirty[reg as usize] = dirty;
        self.reg_of.insert(value, reg);
        self.current.insert(value, incarnation);
    }

    fn free(&mut self, reg: u8) {
        if let Some(v) = self.reg_val[reg as usize].take() {
            self.reg_of.remove(&v);
        }
        self.dirty[reg as usize] = false;
    }

    fn snapshot(&self) -> Vec<EndEntry> {
        let mut out = Vec::new();
        for r in 0u8..32 {
            if let Some(v) = self.reg_val[r as usize] {
                out.push(EndEntry {
                    reg: r,
                    value: v,
                    incarnation: self.current[&v],
                    dirty: self.dirty[r as usize],
                });
            }
        }
        out
    }
}

/// The allocator itself.
struct Allocator<'a> {
    func: &'a mut Func,
    live: &'a Liveness,
    regs: &'a RegBank,
    spill_of: HashMap<ValueId, u32>,
    spill_used: HashSet<u32>,
    num_spills: u32,
    spill_blocks: HashMap<u32, HashSet<BlockId>>,
    used_callee_saved: u32,
    end_states: SecondaryMap<BlockId, Option<Vec<EndEntry>>>,
    entry_states: SecondaryMap<BlockId, Vec<EndEntry>>,
    /// Every reload/recompute/copy incarnation back to the value it
    /// carries; liveness is keyed by the originals.
    orig_map: HashMap<ValueId, ValueId>,
}

/// Assign a home to every value of `func`, inserting spill, reload, and
/// copy markers as needed.
pub fn allocate(func: &mut Func, live: &Liveness, regs: &RegBank) -> AllocResult {
    let mut order = func.postorder();
    order.reverse();

    let mut alloc = Allocator {
        func,
        live,
        regs,
        spill_of: HashMap::new(),
        spill_used: HashSet::new(),
        num_spills: 0,
        spill_blocks: HashMap::new(),
        used_callee_saved: 0,
        end_states: SecondaryMap::new(),
        entry_states: SecondaryMap::new(),
        orig_map: HashMap::new(),
    };
    alloc.end_states.resize(alloc.func.blocks.len());
    alloc.entry_states.resize(alloc.func.blocks.len());

    for &block in &order {
        alloc.process_block(block);
    }
    alloc.reconcile_edges(&order);

    log::debug!(
        "regalloc {}: {} spill slots, callee-saved {:#x}",
        alloc.func.name,
        alloc.num_spills,
        alloc.used_callee_saved
    );

    AllocResult {
        spill_of: alloc.spill_of,
        num_spills: alloc.num_spills,
        spill_blocks: alloc.spill_blocks,
        used_callee_saved: alloc.used_callee_saved,
        order,
    }
}

impl<'a> Allocator<'a> {
    fn is_remat(&self, v: ValueId) -> bool {
        self.func.values[v].op.is_rematerializable()
    }

    fn slot_of(&mut self, v: ValueId, block: BlockId) -> u32 {
        let slot = match self.spill_of.get(&v) {
            Some(&s) => s,
            None => {
                let s = self.num_spills;
                self.num_spills += 1;
                self.spill_of.insert(v, s);
                s
            }
        };
        self.spill_blocks.entry(slot).or_default().insert(block);
        slot
    }

    fn next_use(&self, block: BlockId, pos: u32, v: ValueId) -> Option<u32> {
        self.live.next_use_distance(block, pos, v)
    }

    /// Pick a register: a free one if possible, otherwise evict the
    /// occupant with the furthest next use. Spill code goes to `out`.
    fn alloc_reg(
        &mut self,
        st: &mut RegFile,
        block: BlockId,
        pos: u32,
        locked: &[u8],
        excluded: &[u8],
        out: &mut Vec<ValueId>,
    ) -> u8 {
        for r in RegBank::mask_regs(self.regs.allocatable) {
            if st.reg_val[r as usize].is_none()
                && !locked.contains(&r)
                && !excluded.contains(&r)
            {
                if RegBank::mask_contains(self.regs.callee_saved, r) {
                    self.used_callee_saved |= 1 << r;
                }
                return r;
            }
        }
        // Belady: furthest next use; a dead occupant counts as infinitely
        // far. Ties break toward the lower register number.
        let mut best: Option<(u8, u64)> = None;
        for r in RegBank::mask_regs(self.regs.allocatable) {
            if locked.contains(&r) || excluded.contains(&r) {
                continue;
            }
            let occupant = st.reg_val[r as usize].expect("free regs handled above");
            let dist = self
                .next_use(block, pos, occupant)
                .map(u64::from)
                .unwrap_or(u64::MAX);
            if best.map_or(true, |(_, d)| dist > d) {
                best = Some((r, dist));
            }
        }
        let (victim, _) = best.expect("register exhaustion: every register is locked");
        self.evict(st, victim, block, pos, out);
        if RegBank::mask_contains(self.regs.callee_saved, victim) {
            self.used_callee_saved |= 1 << victim;
        }
        victim
    }

    /// Free `reg`, spilling its occupant first if it is dirty and still
    /// needed.
    fn evict(&mut self, st: &mut RegFile, reg: u8, block: BlockId, pos: u32, out: &mut Vec<ValueId>) {
        let Some(occupant) = st.reg_val[reg as usize] else {
            return;
        };
        let live_later = self.next_use(block, pos, occupant).is_some();
        if st.dirty[reg as usize] && live_later && !self.is_remat(occupant) {
            let slot = self.slot_of(occupant, block);
            let incarnation = st.current[&occupant];
            let spill = self.func.make_value(
                ValueData::new(SsaOp::StoreReg, self.func.values[occupant].ty, [incarnation])
                    .with_aux_int(slot as i64),
            );
            self.func.values[spill].home = Home::Reg(reg);
            out.push(spill);
        }
        st.free(reg);
    }

    /// Make sure `orig` is in a register; reload or rematerialize if not.
    /// Returns the register and the value to reference at the use site.
    fn ensure_in_reg(
        &mut self,
        st: &mut RegFile,
        block: BlockId,
        pos: u32,
        orig: ValueId,
        locked: &mut Vec<u8>,
        out: &mut Vec<ValueId>,
    ) -> (u8, ValueId) {
        if let Some(&r) = st.reg_of.get(&orig) {
            if !locked.contains(&r) {
                locked.push(r);
            }
            return (r, st.current[&orig]);
        }
        let reg = self.alloc_reg(st, block, pos, locked, &[], out);
        let incarnation = if self.is_remat(orig) {
            let def = &self.func.values[orig];
            let data = ValueData {
                op: def.op,
                ty: def.ty,
                args: smallvec![],
                aux_int: def.aux_int,
                aux: def.aux.clone(),
                uses: 0,
                pos: def.pos,
                home: Home::Reg(reg),
            };
            let nv = self.func.make_value(data);
            out.push(nv);
            st.bind(reg, orig, nv, true);
            nv
        } else {
            let slot = *self
                .spill_of
                .get(&orig)
                .unwrap_or_else(|| panic!("{} is neither in a register nor spilled", orig));
            self.spill_used.insert(slot);
            self.spill_blocks.entry(slot).or_default().insert(block);
            let nv = self.func.make_value(
                ValueData::new(SsaOp::LoadReg, self.func.values[orig].ty, [orig])
                    .with_aux_int(slot as i64),
            );
            self.func.values[nv].home = Home::Reg(reg);
            out.push(nv);
            st.bind(reg, orig, nv, false);
            nv
        };
        self.orig_map.insert(incarnation, orig);
        locked.push(reg);
        (reg, incarnation)
    }

    /// Move the value out of `reg` into some other register (used for the
    /// rdx:rax and rcx operand constraints).
    fn relocate(
        &mut self,
        st: &mut RegFile,
        reg: u8,
        block: BlockId,
        pos: u32,
        locked: &mut Vec<u8>,
        excluded: &[u8],
        out: &mut Vec<ValueId>,
    ) {
        let Some(occupant) = st.reg_val[reg as usize] else {
            return;
        };
        let dest = self.alloc_reg(st, block, pos, locked, excluded, out);
        let incarnation = st.current[&occupant];
        let dirty = st.dirty[reg as usize];
        let copy = self.func.make_value(ValueData::new(
            SsaOp::Copy,
            self.func.values[occupant].ty,
            [incarnation],
        ));
        self.func.values[copy].home = Home::Reg(dest);
        self.orig_map.insert(copy, occupant);
        out.push(copy);
        st.free(reg);
        st.bind(dest, occupant, copy, dirty);
        locked.push(dest);
    }

    fn process_block(&mut self, block: BlockId) {
        let snapshot = std::mem::take(&mut self.func.blocks[block].values);
        let mut out: Vec<ValueId> = Vec::with_capacity(snapshot.len() + 8);
        let mut st = RegFile::new();

        // Initialize from a processed predecessor's end state; with
        // multiple predecessors any processed one will do, and the edge
        // reconciliation pass makes the others agree.
        let primary = self.primary_pred(block);
        if let Some(p) = primary {
            let entries = self.end_states[p].clone().unwrap();
            for e in entries {
                // Inherited values are conservatively dirty: another path
                // into this block may not have spilled them.
                if RegBank::mask_contains(self.regs.allocatable, e.reg) {
                    st.bind(e.reg, e.value, e.incarnation, true);
                }
            }
        }

        // Entry block: the ABI argument registers arrive holding the
        // argument values.
        if block == self.func.entry() {
            for &v in &snapshot {
                let data = &self.func.values[v];
                if data.op != SsaOp::Arg {
                    continue;
                }
                let index = data.aux_int as usize;
                if index < self.regs.arg_regs.len() {
                    let r = self.regs.arg_regs[index];
                    if st.reg_val[r as usize].is_none() {
                        st.bind(r, v, v, true);
                        self.func.values[v].home = Home::Reg(r);
                    }
                }
            }
        }

        // Phi results first: reuse the register carrying the primary
        // predecessor's argument when the argument's own live range ends at
        // this edge.
        let primary_pos = primary.map(|p| {
            self.func.blocks[block]
                .preds
                .iter()
                .position(|&x| x == p)
                .unwrap()
        });
        for &v in &snapshot {
            if self.func.values[v].op != SsaOp::Phi {
                continue;
            }
            let preferred = primary_pos.and_then(|k| {
                let arg = *self.func.values[v].args.get(k)?;
                let r = *st.reg_of.get(&arg)?;
                // Only steal the register if the argument dies at the edge.
                self.next_use(block, 0, arg).is_none().then_some(r)
            });
            let reg = match preferred {
                Some(r) => {
                    st.free(r);
                    r
                }
                None => self.alloc_reg(&mut st, block, 0, &[], &[], &mut out),
            };
            st.bind(reg, v, v, true);
            self.func.values[v].home = Home::Reg(reg);
            out.push(v);
        }

        self.entry_states[block] = st.snapshot();

        for (i, &v) in snapshot.iter().enumerate() {
            let op = self.func.values[v].op;
            if op == SsaOp::Phi {
                continue;
            }
            let pos = i as u32;
            let mut locked: Vec<u8> = Vec::new();

            // Bring every operand into a register, rewriting the operand
            // reference to the value that currently carries it.
            let argc = self.func.values[v].args.len();
            for a in 0..argc {
                let orig = self.func.values[v].args[a];
                let (_, incarnation) =
                    self.ensure_in_reg(&mut st, block, pos, orig, &mut locked, &mut out);
                if incarnation != orig {
                    self.func.set_arg(v, a, incarnation);
                }
            }

            // Architecture constraints claim their fixed registers before
            // the result is placed.
            if op == SsaOp::ClosureCall {
                // The callee pointer must survive the argument shuffle;
                // keep it out of the argument-passing registers.
                let callee = self.orig_of(self.func.values[v].args[0]);
                if let Some(&r) = st.reg_of.get(&callee) {
                    if self.regs.arg_regs.contains(&r) {
                        locked.retain(|&x| x != r);
                        let excluded: Vec<u8> = self.regs.arg_regs.to_vec();
                        self.relocate(&mut st, r, block, pos, &mut locked, &excluded, &mut out);
                    }
                }
            }
            if self.regs.kind == IsaKind::X64 {
                self.apply_x64_constraints(&mut st, block, pos, v, &mut locked, &mut out);
            }
            // Constraint moves may have retired the incarnations the
            // operand references point at; refresh them.
            for a in 0..argc {
                let cur = self.func.values[v].args[a];
                let orig = self.orig_of(cur);
                if let Some(&inc) = st.current.get(&orig) {
                    if inc != cur {
                        self.func.set_arg(v, a, inc);
                    }
                }
            }

            if op.is_call() {
                self.spill_caller_saved(&mut st, block, pos, &mut out);
            }

            // Result register.
            if op.needs_register() && self.func.values[v].home == Home::None {
                let reg = self.result_reg(&mut st, block, pos, v, &locked, &mut out);
                st.bind(reg, v, v, true);
                self.func.values[v].home = Home::Reg(reg);
            }

            out.push(v);

            // Advance uses: free dead operands, and release operands whose
            // next use lies beyond the next call since they would have to
            // be spilled there anyway.
            let next_call = self.live.blocks[block].next_call.get(i).copied().unwrap_or(NO_CALL);
            let arg_origs: Vec<ValueId> = (0..argc)
                .map(|a| self.func.values[v].args[a])
                .map(|inc| self.orig_of(inc))
                .collect();
            for orig in arg_origs {
                let Some(&r) = st.reg_of.get(&orig) else {
                    continue;
                };
                match self.next_use(block, pos + 1, orig) {
                    None => st.free(r),
                    Some(_) => {
                        let next_pos = self.live.blocks[block]
                            .use_positions
                            .get(&orig)
                            .and_then(|uses| uses.iter().find(|&&q| q > pos))
                            .copied();
                        let beyond_call = next_call != NO_CALL
                            && next_pos.map_or(true, |q| q > next_call)
                            && next_call > pos;
                        if beyond_call {
                            self.evict(&mut st, r, block, pos + 1, &mut out);
                        }
                    }
                }
            }
            // A result nobody uses frees its register immediately.
            if let Home::Reg(r) = self.func.values[v].home {
                if st.reg_val[r as usize] == Some(v)
                    && self.next_use(block, pos + 1, v).is_none()
                {
                    st.free(r);
                }
            }
        }

        self.func.blocks[block].values = out;
        self.end_states[block] = Some(st.snapshot());
    }

    fn orig_of(&self, v: ValueId) -> ValueId {
        let mut v = v;
        while let Some(&o) = self.orig_map.get(&v) {
            v = o;
        }
        v
    }

    fn primary_pred(&self, block: BlockId) -> Option<BlockId> {
        self.func.blocks[block]
            .preds
            .iter()
            .copied()
            .find(|&p| self.end_states[p].is_some())
    }

    fn spill_caller_saved(
        &mut self,
        st: &mut RegFile,
        block: BlockId,
        pos: u32,
        out: &mut Vec<ValueId>,
    ) {
        for r in RegBank::mask_regs(self.regs.caller_saved) {
            if st.reg_val[r as usize].is_some() {
                // Uses at or before `pos` are the call's own operands; the
                // value only needs to survive if used after.
                self.evict(st, r, block, pos + 1, out);
            }
        }
    }

    fn result_reg(
        &mut self,
        st: &mut RegFile,
        block: BlockId,
        pos: u32,
        v: ValueId,
        locked: &[u8],
        out: &mut Vec<ValueId>,
    ) -> u8 {
        let data = &self.func.values[v];
        match data.op {
            SsaOp::Arg => {
                let index = data.aux_int as usize;
                if index < self.regs.arg_regs.len() {
                    let r = self.regs.arg_regs[index];
                    if st.reg_val[r as usize] == Some(v) {
                        // Pre-bound at block entry; reuse.
                        st.free(r);
                        return r;
                    }
                    if st.reg_val[r as usize].is_none() {
                        return r;
                    }
                }
                self.alloc_reg(st, block, pos, locked, &[], out)
            }
            SsaOp::StaticCall | SsaOp::ClosureCall => {
                let r = self.regs.ret_regs[0];
                debug_assert!(st.reg_val[r as usize].is_none());
                r
            }
            SsaOp::SelectN => {
                let r = self.regs.ret_regs[data.aux_int as usize];
                self.evict(st, r, block, pos, out);
                r
            }
            SsaOp::Sdiv | SsaOp::Udiv if self.regs.kind == IsaKind::X64 => {
                // Any occupant left in rdx:rax by the constraint step is a
                // dead operand; cqo and idiv clobber both.
                self.evict(st, crate::isa::x64::regs::RAX, block, pos + 1, out);
                self.evict(st, crate::isa::x64::regs::RDX, block, pos + 1, out);
                crate::isa::x64::regs::RAX
            }
            SsaOp::Srem | SsaOp::Urem if self.regs.kind == IsaKind::X64 => {
                self.evict(st, crate::isa::x64::regs::RAX, block, pos + 1, out);
                self.evict(st, crate::isa::x64::regs::RDX, block, pos + 1, out);
                crate::isa::x64::regs::RDX
            }
            _ => {
                // Two-address lowering on x64 writes the destination before
                // reading the second operand; keep the result away from
                // live operands.
                let mut excluded: Vec<u8> = Vec::new();
                if self.regs.kind == IsaKind::X64 {
                    let args: Vec<ValueId> = self.func.values[v].args.to_vec();
                    for (idx, &arg) in args.iter().enumerate() {
                        let orig = self.orig_of(arg);
                        if let Some(&r) = st.reg_of.get(&orig) {
                            let live_after = self.next_use(block, pos + 1, orig).is_some();
                            if idx > 0 || live_after {
                                excluded.push(r);
                            }
                        }
                    }
                    if matches!(
                        data.op,
                        SsaOp::Ishl | SsaOp::Sshr | SsaOp::Ushr | SsaOp::Rotl | SsaOp::Rotr
                    ) {
                        // The count lives in cl while the shift executes.
                        excluded.push(crate::isa::x64::regs::RCX);
                    }
                }
                self.alloc_reg(st, block, pos, locked, &excluded, out)
            }
        }
    }

    /// rdx:rax for division and remainder, rcx for variable shifts.
    fn apply_x64_constraints(
        &mut self,
        st: &mut RegFile,
        block: BlockId,
        pos: u32,
        v: ValueId,
        locked: &mut Vec<u8>,
        out: &mut Vec<ValueId>,
    ) {
        use crate::isa::x64::regs::{RAX, RCX, RDX};
        let op = self.func.values[v].op;
        match op {
            SsaOp::Sdiv | SsaOp::Udiv | SsaOp::Srem | SsaOp::Urem => {
                let lhs = self.orig_of(self.func.values[v].args[0]);
                let rhs = self.orig_of(self.func.values[v].args[1]);
                for reg in [RAX, RDX] {
                    let Some(occupant) = st.reg_val[reg as usize] else {
                        continue;
                    };
                    let live_after = self.next_use(block, pos + 1, occupant).is_some();
                    if occupant == rhs || (occupant == lhs && live_after) {
                        locked.retain(|&r| r != reg);
                        self.relocate(st, reg, block, pos, locked, &[RAX, RDX, RCX], out);
                    } else if occupant != lhs {
                        locked.retain(|&r| r != reg);
                        self.evict(st, reg, block, pos, out);
                    }
                }
            }
            SsaOp::Ishl | SsaOp::Sshr | SsaOp::Ushr | SsaOp::Rotl | SsaOp::Rotr => {
                let amount = self.orig_of(self.func.values[v].args[1]);
                if let Some(occupant) = st.reg_val[RCX as usize] {
                    if occupant != amount {
                        locked.retain(|&r| r != RCX);
                        self.relocate(st, RCX, block, pos, locked, &[RCX], out);
                    }
                }
            }
            _ => {}
        }
    }

    /// After every block is processed, make each in-edge agree with the
    /// target's entry expectation: phi arguments move into the phi's
    /// register, live-through values move or reload into the registers the
    /// target assumes, and dirty live-outs headed for memory get stored.
    fn reconcile_edges(&mut self, order: &[BlockId]) {
        for &block in order {
            let preds = self.func.blocks[block].preds.clone();
            for (pred_index, &pred) in preds.iter().enumerate() {
                if self.end_states[pred].is_none() {
                    continue;
                }
                self.reconcile_one_edge(pred, block, pred_index);
            }
        }
    }

    fn reconcile_one_edge(&mut self, pred: BlockId, block: BlockId, pred_index: usize) {
        #[derive(Clone, Debug)]
        enum Src {
            Reg(u8, ValueId),
            Slot(u32, ValueId),
            Remat(ValueId),
        }
        let end = self.end_states[pred].clone().unwrap();
        let entry = self.entry_states[block].clone();
        let end_reg_of = |v: ValueId| end.iter().find(|e| e.value == v).map(|e| (e.reg, e.incarnation));

        let mut moves: Vec<(u8, Src)> = Vec::new();
        for e in &entry {
            let wanted = e.value;
            let data = &self.func.values[wanted];
            let source_value = if data.op == SsaOp::Phi
                && self.func.blocks[block].values.contains(&wanted)
            {
                self.func.values[wanted].args[pred_index]
            } else {
                wanted
            };
            let src = if let Some((r, inc)) = end_reg_of(source_value) {
                if r == e.reg {
                    continue;
                }
                Src::Reg(r, inc)
            } else if self.is_remat(source_value) {
                Src::Remat(source_value)
            } else if let Some(&slot) = self.spill_of.get(&source_value) {
                self.spill_used.insert(slot);
                self.spill_blocks.entry(slot).or_default().insert(pred);
                Src::Slot(slot, source_value)
            } else if source_value == wanted {
                // Live-through value never materialized on this path; the
                // target will reload it, so it must be spilled below.
                continue;
            } else {
                panic!(
                    "phi argument {} has no location at the end of {}",
                    source_value, pred
                );
            };
            moves.push((e.reg, src));
        }

        // Dirty live-outs that the target expects in memory get stored on
        // this edge.
        let expects_reg: HashSet<ValueId> = entry.iter().map(|e| e.value).collect();
        let mut stores: Vec<ValueId> = Vec::new();
        for e in &end {
            if e.dirty
                && !expects_reg.contains(&e.value)
                && !self.is_remat(e.value)
                && self.spill_of.contains_key(&e.value)
                && self.live.is_live_out(pred, e.value)
            {
                stores.push(e.value);
            }
        }

        if moves.is_empty() && stores.is_empty() {
            return;
        }

        let insert_at = self.func.blocks[pred].values.len().saturating_sub(1);
        let mut scheduled: Vec<ValueId> = Vec::new();

        for value in stores {
            let (reg, incarnation) = end_reg_of(value).unwrap();
            let slot = self.slot_of(value, pred);
            let spill = self.func.make_value(
                ValueData::new(SsaOp::StoreReg, self.func.values[value].ty, [incarnation])
                    .with_aux_int(slot as i64),
            );
            self.func.values[spill].home = Home::Reg(reg);
            scheduled.push(spill);
        }

        // Register-to-register moves first, in an order that reads every
        // source before it is overwritten; cycles go through the temp.
        let mut pending: Vec<(u8, u8, ValueId)> = Vec::new();
        for (dest, src) in &moves {
            if let Src::Reg(r, inc) = src {
                pending.push((*dest, *r, *inc));
            }
        }
        while !pending.is_empty() {
            if let Some(idx) = pending
                .iter()
                .position(|&(dest, _, _)| !pending.iter().any(|&(_, s, _)| s == dest))
            {
                let (dest, _, inc) = pending.remove(idx);
                let copy = self
                    .func
                    .make_value(ValueData::new(SsaOp::Copy, self.func.values[inc].ty, [inc]));
                self.func.values[copy].home = Home::Reg(dest);
                scheduled.push(copy);
            } else {
                // A cycle: route one edge through the scratch register.
                let (dest, _, inc) = pending.remove(0);
                let to_temp = self
                    .func
                    .make_value(ValueData::new(SsaOp::Copy, self.func.values[inc].ty, [inc]));
                self.func.values[to_temp].home = Home::Reg(self.regs.temp);
                scheduled.push(to_temp);
                pending.push((dest, self.regs.temp, to_temp));
            }
        }

        // Reloads and rematerializations write registers nobody reads in
        // this move set, so they go last.
        for (dest, src) in &moves {
            match src {
                Src::Reg(..) => {}
                Src::Slot(slot, orig) => {
                    let nv = self.func.make_value(
                        ValueData::new(SsaOp::LoadReg, self.func.values[*orig].ty, [*orig])
                            .with_aux_int(*slot as i64),
                    );
                    self.func.values[nv].home = Home::Reg(*dest);
                    scheduled.push(nv);
                }
                Src::Remat(orig) => {
                    let def = &self.func.values[*orig];
                    let data = ValueData {
                        op: def.op,
                        ty: def.ty,
                        args: smallvec![],
                        aux_int: def.aux_int,
                        aux: def.aux.clone(),
                        uses: 0,
                        pos: def.pos,
                        home: Home::Reg(*dest),
                    };
                    let nv = self.func.make_value(data);
                    scheduled.push(nv);
                }
            }
        }

        for (offset, nv) in scheduled.into_iter().enumerate() {
            self.func.blocks[pred].values.insert(insert_at + offset, nv);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::{compute_liveness, TypeRegistry};

    /// A loop summing its argument down to zero; the phi forces a merge
    /// shuffle and the back edge keeps two values live around the loop.
    fn loop_func(types: &TypeRegistry) -> Func {
        let mut func = Func::new("sum");
        func.params = vec![types.i64()];
        func.returns = vec![types.i64()];
        let entry = func.create_block();
        let header = func.create_block();
        let exit = func.create_block();

        let n = func.append(
            entry,
            ValueData::new(SsaOp::Arg, types.i64(), []).with_aux_int(0),
        );
        let zero = func.append(
            entry,
            ValueData::new(SsaOp::ConstInt, types.i64(), []).with_aux_int(0),
        );
        func.append(
            entry,
            ValueData::new(SsaOp::Jump, types.i64(), [])
                .with_aux(Aux::Targets(smallvec![header])),
        );
        func.add_pred(header, entry);

        let i = func.append(header, ValueData::new(SsaOp::Phi, types.i64(), [n, n]));
        let acc = func.append(header, ValueData::new(SsaOp::Phi, types.i64(), [zero, zero]));
        let sum = func.append(header, ValueData::new(SsaOp::Iadd, types.i64(), [acc, i]));
        func.set_arg(acc, 1, sum);
        let one = func.append(
            header,
            ValueData::new(SsaOp::ConstInt, types.i64(), []).with_aux_int(1),
        );
        let dec = func.append(header, ValueData::new(SsaOp::Isub, types.i64(), [i, one]));
        func.set_arg(i, 1, dec);
        func.append(
            header,
            ValueData::new(SsaOp::Brif, types.i64(), [dec])
                .with_aux(Aux::Targets(smallvec![header, exit])),
        );
        func.add_pred(header, header);
        func.add_pred(exit, header);
        func.append(exit, ValueData::new(SsaOp::Ret, types.i64(), [sum]));
        func
    }

    fn check_homes(func: &Func, regs: &RegBank, result: &AllocResult) {
        let legal = regs.allocatable
            | (1 << regs.temp)
            | regs.arg_regs.iter().fold(0u32, |m, &r| m | 1 << r)
            | regs.ret_regs.iter().fold(0u32, |m, &r| m | 1 << r);
        for block in func.blocks.keys() {
            for &v in &func.blocks[block].values {
                if let Home::Reg(r) = func.values[v].home {
                    assert!(
                        RegBank::mask_contains(legal, r),
                        "{} landed in reserved register {}",
                        v,
                        r
                    );
                }
            }
        }
        // The committed callee-saved set stays within the ABI's list.
        assert_eq!(result.used_callee_saved & !regs.callee_saved, 0);
        // Every reload reads a slot some value was actually assigned.
        for block in func.blocks.keys() {
            for &v in &func.blocks[block].values {
                if func.values[v].op == SsaOp::LoadReg {
                    let slot = func.values[v].aux_int as u32;
                    assert!(slot < result.num_spills);
                }
            }
        }
    }

    #[test]
    fn loop_allocates_on_both_banks() {
        for bank in [crate::isa::x64::regs::bank(), crate::isa::aarch64::regs::bank()] {
            let types = TypeRegistry::new();
            let mut func = loop_func(&types);
            split_critical_edges(&mut func);
            let live = compute_liveness(&func);
            let result = allocate(&mut func, &live, &bank);
            check_homes(&func, &bank, &result);
            // Every scheduled value that needs a register received one.
            for block in func.blocks.keys() {
                for &v in &func.blocks[block].values {
                    if func.values[v].op.needs_register() {
                        assert!(
                            matches!(func.values[v].home, Home::Reg(_)),
                            "{} has no home",
                            v
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn critical_edges_are_split() {
        let types = TypeRegistry::new();
        let mut func = loop_func(&types);
        split_critical_edges(&mut func);
        // The header's back edge came from a two-way branch into a
        // two-predecessor block; it must now route through a fresh block.
        for block in func.blocks.keys() {
            let Some(term) = func.terminator(block) else { continue };
            if func.values[term].targets().len() < 2 {
                continue;
            }
            for &target in func.values[term].targets() {
                let multi_pred = func.blocks[target].preds.len() > 1;
                let has_phi = func.blocks[target]
                    .values
                    .iter()
                    .any(|&v| func.values[v].op == SsaOp::Phi);
                assert!(
                    !(multi_pred || has_phi),
                    "unsplit edge {} -> {}",
                    block,
                    target
                );
            }
        }
    }

    #[test]
    fn unreachable_blocks_are_pruned() {
        let types = TypeRegistry::new();
        let mut func = Func::new("t");
        let entry = func.create_block();
        let orphan = func.create_block();
        func.append(entry, ValueData::new(SsaOp::Ret, types.i64(), []));
        func.append(orphan, ValueData::new(SsaOp::Ret, types.i64(), []));
        split_critical_edges(&mut func);
        assert!(func.blocks[orphan].values.is_empty());
    }
}
