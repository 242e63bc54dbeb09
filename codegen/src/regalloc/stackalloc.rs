//! Stack frame layout: local slots, spill slots, interference-based reuse.
//!
//! Spill values that are never live in the same block can share a frame
//! slot. The frame starts with the 16-byte saved FP/LR pair, then locals in
//! declaration order, then spill slots, padded to 16 bytes.

use crate::regalloc::AllocResult;
use crate::ssa::{align_up, Func, Liveness, TypeRegistry};
use std::collections::HashSet;

/// The finished frame layout of a function.
#[derive(Clone, Debug, Default)]
pub struct FrameLayout {
    /// Total frame size; always a multiple of 16 and at least 16.
    pub frame_size: u32,
    /// Frame offset of each declared local, by declaration order.
    pub local_offsets: Vec<i32>,
    /// Frame offset of each spill slot index.
    pub spill_offsets: Vec<i32>,
    /// Callee-saved registers the function clobbers, lowest first. The
    /// prologue stores them at `saved_offsets`.
    pub saved_regs: Vec<u8>,
    /// Frame offset of each entry in `saved_regs`.
    pub saved_offsets: Vec<i32>,
}

impl FrameLayout {
    /// The frame offset of local `index`.
    pub fn local(&self, index: usize) -> i32 {
        self.local_offsets[index]
    }

    /// The frame offset of spill slot `slot`.
    pub fn spill(&self, slot: u32) -> i32 {
        self.spill_offsets[slot as usize]
    }
}

/// Compute the frame layout for an allocated function.
pub fn layout_frame(
    func: &Func,
    types: &TypeRegistry,
    live: &Liveness,
    alloc: &AllocResult,
) -> FrameLayout {
    // Saved frame pointer and return address occupy the first 16 bytes.
    let mut offset: u32 = 16;

    let mut local_offsets = Vec::with_capacity(func.locals.len());
    for local in &func.locals {
        let size = types.size_of(local.ty).max(8);
        offset = align_up(offset, 8);
        local_offsets.push(offset as i32);
        offset += align_up(size, 8);
    }

    // Interference: two spill slots interfere when both are live in the
    // same block. Live-blocks of a spill are the blocks it is written or
    // read in, plus every block its value is live out of.
    let mut live_blocks: Vec<HashSet<u32>> = vec![HashSet::new(); alloc.num_spills as usize];
    for (&value, &slot) in &alloc.spill_of {
        let set = &mut live_blocks[slot as usize];
        if let Some(blocks) = alloc.spill_blocks.get(&slot) {
            for &b in blocks {
                set.insert(b.as_u32());
            }
        }
        for block in func.blocks.keys() {
            if live.is_live_out(block, value) {
                set.insert(block.as_u32());
            }
        }
    }

    // Greedy coloring in slot index (definition) order: reuse the
    // lowest-offset compatible slot.
    let spill_base = align_up(offset, 8);
    let mut colors: Vec<u32> = Vec::with_capacity(alloc.num_spills as usize);
    let mut num_colors: u32 = 0;
    for slot in 0..alloc.num_spills as usize {
        let mut color = None;
        'colors: for c in 0..num_colors {
            for prior in 0..slot {
                if colors[prior] == c && !live_blocks[prior].is_disjoint(&live_blocks[slot]) {
                    continue 'colors;
                }
            }
            color = Some(c);
            break;
        }
        let c = color.unwrap_or_else(|| {
            num_colors += 1;
            num_colors - 1
        });
        colors.push(c);
    }
    let spill_offsets: Vec<i32> = colors
        .iter()
        .map(|&c| (spill_base + c * 8) as i32)
        .collect();
    offset = spill_base + num_colors * 8;

    // Save area for the callee-saved registers this function clobbers.
    let saved_regs: Vec<u8> = (0u8..32)
        .filter(|&r| alloc.used_callee_saved & (1 << r) != 0)
        .collect();
    let mut saved_offsets = Vec::with_capacity(saved_regs.len());
    for _ in &saved_regs {
        offset = align_up(offset, 8);
        saved_offsets.push(offset as i32);
        offset += 8;
    }

    let frame_size = align_up(offset.max(16), 16);
    log::debug!(
        "frame {}: {} bytes ({} locals, {} spill slots in {} colors)",
        func.name,
        frame_size,
        func.locals.len(),
        alloc.num_spills,
        num_colors
    );
    if frame_size > 1 << 20 {
        log::warn!(
            "frame of {} is {} bytes; the OS may reject this at load time",
            func.name,
            frame_size
        );
    }

    FrameLayout {
        frame_size,
        local_offsets,
        spill_offsets,
        saved_regs,
        saved_offsets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::{BlockId, ValueId};
    use std::collections::HashMap;

    fn empty_func() -> Func {
        let mut f = Func::new("t");
        f.create_block();
        f
    }

    #[test]
    fn minimal_frame_is_sixteen_bytes() {
        let func = empty_func();
        let types = TypeRegistry::new();
        let live = Liveness::default();
        let alloc = AllocResult::default();
        let frame = layout_frame(&func, &types, &live, &alloc);
        assert_eq!(frame.frame_size, 16);
    }

    #[test]
    fn frame_is_always_16_aligned() {
        let mut func = empty_func();
        let types = TypeRegistry::new();
        func.locals.push(crate::ssa::LocalData { ty: types.i64() });
        let live = Liveness::default();
        let mut alloc = AllocResult::default();
        alloc.num_spills = 1;
        alloc.spill_of = HashMap::from([(ValueId::from_u32(0), 0)]);
        alloc
            .spill_blocks
            .entry(0)
            .or_default()
            .insert(BlockId::from_u32(0));
        let frame = layout_frame(&func, &types, &live, &alloc);
        assert_eq!(frame.frame_size % 16, 0);
        assert!(frame.frame_size >= 16);
        assert_eq!(frame.local(0), 16);
        assert_eq!(frame.spill(0), 24);
    }

    #[test]
    fn non_interfering_spills_share_an_offset() {
        let mut func = empty_func();
        let b1 = func.create_block();
        let types = TypeRegistry::new();
        let live = Liveness::default();
        let mut alloc = AllocResult::default();
        alloc.num_spills = 2;
        alloc.spill_of = HashMap::from([
            (ValueId::from_u32(0), 0),
            (ValueId::from_u32(1), 1),
        ]);
        // Slot 0 lives only in block 0, slot 1 only in block 1.
        alloc
            .spill_blocks
            .entry(0)
            .or_default()
            .insert(BlockId::from_u32(0));
        alloc.spill_blocks.entry(1).or_default().insert(b1);
        let frame = layout_frame(&func, &types, &live, &alloc);
        assert_eq!(frame.spill(0), frame.spill(1));

        // Make them interfere and the offsets split.
        alloc.spill_blocks.entry(1).or_default().insert(BlockId::from_u32(0));
        let frame = layout_frame(&func, &types, &live, &alloc);
        assert_ne!(frame.spill(0), frame.spill(1));
        assert_eq!(frame.frame_size % 16, 0);
    }
}
