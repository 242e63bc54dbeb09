//! Automatic reference counting.
//!
//! Every heap object carries a 24-byte header below the user pointer:
//! total allocation size, the destructor function pointer (0 when the type
//! has none), and the refcount word. The refcount word packs two counts
//! and two flags:
//!
//! ```text
//! bit  0      pure-dealloc flag (always set)
//! bits 1..31  unowned count, direct
//! bit  32     deiniting flag
//! bits 33..62 strong count, stored minus one
//! bit  63     slow-path flag (reserved)
//! ```
//!
//! The immortal sentinel (all ones) turns retain and release into no-ops.
//! These sequences use plain loads and stores; the runtime is not
//! thread-safe.

use crate::{import_libc, import_runtime, make_func};
use cot_codegen::ir::condcodes::IntCC;
use cot_codegen::ir::types::I64;
use cot_codegen::ir::{Function, MemFlags, TrapCode};
use cot_frontend::{FunctionBuilder, FunctionBuilderContext};

/// Size of the object header preceding user data.
pub const HEADER_SIZE: i64 = 24;
/// Header offset of the total allocation size, relative to the user
/// pointer.
pub const OFF_ALLOC_SIZE: i32 = -24;
/// Header offset of the destructor pointer.
pub const OFF_METADATA: i32 = -16;
/// Header offset of the refcount word.
pub const OFF_REFCOUNT: i32 = -8;

/// The pure-dealloc flag, bit 0.
pub const RC_PURE_DEALLOC: i64 = 1;
/// One unowned reference, bit 1.
pub const UNOWNED_RC_ONE: i64 = 1 << 1;
/// Mask of the unowned count, bits 1..31.
pub const UNOWNED_RC_MASK: i64 = 0xFFFF_FFFE;
/// The deiniting flag, bit 32.
pub const RC_DEINITING: i64 = 1 << 32;
/// One strong reference, bit 33. The stored strong count is one less than
/// the logical count.
pub const STRONG_RC_ONE: i64 = 1 << 33;
/// Mask of the strong extra count, bits 33..62.
pub const STRONG_RC_MASK: i64 = ((1 << 30) - 1) << 33;
/// A fresh object: one logical strong reference, one unowned reference.
pub const RC_INITIAL: i64 = RC_PURE_DEALLOC | UNOWNED_RC_ONE;
/// The immortal sentinel; retain and release leave it untouched.
pub const RC_IMMORTAL: i64 = -1;

/// Generate the ten ARC functions.
pub fn generate() -> Vec<Function> {
    vec![
        alloc(),
        dealloc(),
        retain(),
        release(),
        realloc(),
        string_concat(),
        string_eq(),
        unowned_retain(),
        unowned_release(),
        unowned_load_strong(),
    ]
}

fn flags() -> MemFlags {
    MemFlags::trusted()
}

/// `alloc(metadata, size) -> obj`: malloc header plus payload, rounded up
/// to 8, initialize the header, return the user pointer.
fn alloc() -> Function {
    let mut func = make_func("alloc", 2, 1);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let malloc = import_libc(&mut b, "malloc", 1, 1);

    let entry = b.create_block();
    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let (metadata, size) = (b.block_params(entry)[0], b.block_params(entry)[1]);

    let padded = b.ins().iadd_imm(size, HEADER_SIZE + 7);
    let total = b.ins().band_imm(padded, !7);
    let call = b.ins().call(malloc, &[total]);
    let raw = b.single_result(call);
    b.ins().store(flags(), total, raw, 0);
    b.ins().store(flags(), metadata, raw, 8);
    let initial = b.ins().iconst(I64, RC_INITIAL);
    b.ins().store(flags(), initial, raw, 16);
    let obj = b.ins().iadd_imm(raw, HEADER_SIZE);
    b.ins().return_(&[obj]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `dealloc(obj)`: free the allocation, tolerating null.
fn dealloc() -> Function {
    let mut func = make_func("dealloc", 1, 0);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let free = import_libc(&mut b, "free", 1, 0);

    let entry = b.create_block();
    let do_free = b.create_block();
    let done = b.create_block();
    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let obj = b.block_params(entry)[0];
    let is_null = b.ins().icmp_imm(IntCC::Equal, obj, 0);
    b.ins().brif(is_null, done, &[], do_free, &[]);

    b.switch_to_block(do_free);
    let raw = b.ins().iadd_imm(obj, -HEADER_SIZE);
    b.ins().call(free, &[raw]);
    b.ins().jump(done, &[]);

    b.switch_to_block(done);
    b.ins().return_(&[]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `retain(obj) -> obj`: bump the strong count unless null or immortal.
fn retain() -> Function {
    let mut func = make_func("retain", 1, 1);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);

    let entry = b.create_block();
    let live = b.create_block();
    let bump = b.create_block();
    let done = b.create_block();

    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let obj = b.block_params(entry)[0];
    let is_null = b.ins().icmp_imm(IntCC::Equal, obj, 0);
    b.ins().brif(is_null, done, &[], live, &[]);

    b.switch_to_block(live);
    let rc = b.ins().load(I64, flags(), obj, OFF_REFCOUNT);
    let immortal = b.ins().icmp_imm(IntCC::Equal, rc, RC_IMMORTAL);
    b.ins().brif(immortal, done, &[], bump, &[]);

    b.switch_to_block(bump);
    let bumped = b.ins().iadd_imm(rc, STRONG_RC_ONE);
    b.ins().store(flags(), bumped, obj, OFF_REFCOUNT);
    b.ins().jump(done, &[]);

    b.switch_to_block(done);
    b.ins().return_(&[obj]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `release(obj)`: drop a strong reference; on the last one, flag
/// deiniting, run the destructor from the metadata slot, then drop the
/// implicit unowned reference.
fn release() -> Function {
    let mut func = make_func("release", 1, 0);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let unowned_release = import_runtime(&mut b, "unowned_release", 1, 0);
    let dtor_sig = b.import_signature(crate::sig_i64(1, 0));

    let entry = b.create_block();
    let live = b.create_block();
    let decide = b.create_block();
    let drop_one = b.create_block();
    let last_ref = b.create_block();
    let run_dtor = b.create_block();
    let after_dtor = b.create_block();
    let done = b.create_block();

    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let obj = b.block_params(entry)[0];
    let is_null = b.ins().icmp_imm(IntCC::Equal, obj, 0);
    b.ins().brif(is_null, done, &[], live, &[]);

    b.switch_to_block(live);
    let rc = b.ins().load(I64, flags(), obj, OFF_REFCOUNT);
    let immortal = b.ins().icmp_imm(IntCC::Equal, rc, RC_IMMORTAL);
    b.ins().brif(immortal, done, &[], decide, &[]);

    b.switch_to_block(decide);
    let strong_extra = b.ins().band_imm(rc, STRONG_RC_MASK);
    let was_last = b.ins().icmp_imm(IntCC::Equal, strong_extra, 0);
    b.ins().brif(was_last, last_ref, &[], drop_one, &[]);

    b.switch_to_block(drop_one);
    let dropped = b.ins().iadd_imm(rc, -STRONG_RC_ONE);
    b.ins().store(flags(), dropped, obj, OFF_REFCOUNT);
    b.ins().jump(done, &[]);

    b.switch_to_block(last_ref);
    let deiniting = b.ins().bor_imm(rc, RC_DEINITING);
    b.ins().store(flags(), deiniting, obj, OFF_REFCOUNT);
    let dtor = b.ins().load(I64, flags(), obj, OFF_METADATA);
    let has_dtor = b.ins().icmp_imm(IntCC::NotEqual, dtor, 0);
    b.ins().brif(has_dtor, run_dtor, &[], after_dtor, &[]);

    b.switch_to_block(run_dtor);
    b.ins().call_indirect(dtor_sig, dtor, &[obj]);
    b.ins().jump(after_dtor, &[]);

    b.switch_to_block(after_dtor);
    b.ins().call(unowned_release, &[obj]);
    b.ins().jump(done, &[]);

    b.switch_to_block(done);
    b.ins().return_(&[]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `realloc(obj, new_size) -> obj`: grow in place when the stored
/// allocation size already covers the request, otherwise allocate, copy
/// the payload and header counts, and free the old block.
fn realloc() -> Function {
    let mut func = make_func("realloc", 2, 1);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let alloc = import_runtime(&mut b, "alloc", 2, 1);
    let dealloc = import_runtime(&mut b, "dealloc", 1, 0);
    let memcpy = import_libc(&mut b, "memcpy", 3, 1);

    let entry = b.create_block();
    let fresh = b.create_block();
    let have_obj = b.create_block();
    let fits = b.create_block();
    let grow = b.create_block();

    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let (obj, new_size) = (b.block_params(entry)[0], b.block_params(entry)[1]);
    let is_null = b.ins().icmp_imm(IntCC::Equal, obj, 0);
    b.ins().brif(is_null, fresh, &[], have_obj, &[]);

    b.switch_to_block(fresh);
    let zero = b.ins().iconst(I64, 0);
    let call = b.ins().call(alloc, &[zero, new_size]);
    let new_obj = b.single_result(call);
    b.ins().return_(&[new_obj]);

    b.switch_to_block(have_obj);
    let padded = b.ins().iadd_imm(new_size, HEADER_SIZE + 7);
    let new_total = b.ins().band_imm(padded, !7);
    let old_total = b.ins().load(I64, flags(), obj, OFF_ALLOC_SIZE);
    let in_place = b
        .ins()
        .icmp(IntCC::UnsignedLessThanOrEqual, new_total, old_total);
    b.ins().brif(in_place, fits, &[], grow, &[]);

    b.switch_to_block(fits);
    b.ins().return_(&[obj]);

    b.switch_to_block(grow);
    let metadata = b.ins().load(I64, flags(), obj, OFF_METADATA);
    let call = b.ins().call(alloc, &[metadata, new_size]);
    let new_obj = b.single_result(call);
    let payload = b.ins().iadd_imm(old_total, -HEADER_SIZE);
    b.ins().call(memcpy, &[new_obj, obj, payload]);
    // The object keeps its identity: counts travel with it.
    let rc = b.ins().load(I64, flags(), obj, OFF_REFCOUNT);
    b.ins().store(flags(), rc, new_obj, OFF_REFCOUNT);
    b.ins().call(dealloc, &[obj]);
    b.ins().return_(&[new_obj]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `string_concat(p1, l1, p2, l2) -> obj`: a fresh heap string holding
/// both halves; the empty concatenation is the null string.
fn string_concat() -> Function {
    let mut func = make_func("string_concat", 4, 1);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let alloc = import_runtime(&mut b, "alloc", 2, 1);
    let memcpy = import_libc(&mut b, "memcpy", 3, 1);

    let entry = b.create_block();
    let empty = b.create_block();
    let build = b.create_block();

    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let params = b.block_params(entry).to_vec();
    let (p1, l1, p2, l2) = (params[0], params[1], params[2], params[3]);
    let new_len = b.ins().iadd(l1, l2);
    let is_empty = b.ins().icmp_imm(IntCC::Equal, new_len, 0);
    b.ins().brif(is_empty, empty, &[], build, &[]);

    b.switch_to_block(empty);
    let zero = b.ins().iconst(I64, 0);
    b.ins().return_(&[zero]);

    b.switch_to_block(build);
    let zero_meta = b.ins().iconst(I64, 0);
    let call = b.ins().call(alloc, &[zero_meta, new_len]);
    let buf = b.single_result(call);
    b.ins().call(memcpy, &[buf, p1, l1]);
    let second_half = b.ins().iadd(buf, l1);
    b.ins().call(memcpy, &[second_half, p2, l2]);
    b.ins().return_(&[buf]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `string_eq(p1, l1, p2, l2) -> 0|1`.
fn string_eq() -> Function {
    let mut func = make_func("string_eq", 4, 1);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let memcmp = import_libc(&mut b, "memcmp", 3, 1);

    let entry = b.create_block();
    let ne = b.create_block();
    let same_len = b.create_block();
    let eq = b.create_block();
    let compare = b.create_block();

    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let params = b.block_params(entry).to_vec();
    let (p1, l1, p2, l2) = (params[0], params[1], params[2], params[3]);
    let len_eq = b.ins().icmp(IntCC::Equal, l1, l2);
    b.ins().brif(len_eq, same_len, &[], ne, &[]);

    b.switch_to_block(ne);
    let zero = b.ins().iconst(I64, 0);
    b.ins().return_(&[zero]);

    b.switch_to_block(same_len);
    let ptr_eq = b.ins().icmp(IntCC::Equal, p1, p2);
    b.ins().brif(ptr_eq, eq, &[], compare, &[]);

    b.switch_to_block(eq);
    let one = b.ins().iconst(I64, 1);
    b.ins().return_(&[one]);

    b.switch_to_block(compare);
    let call = b.ins().call(memcmp, &[p1, p2, l1]);
    let diff = b.single_result(call);
    let is_zero = b.ins().icmp_imm(IntCC::Equal, diff, 0);
    let wide = b.ins().uextend(I64, is_zero);
    b.ins().return_(&[wide]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `unowned_retain(obj)`: bump the unowned count unless null or immortal.
fn unowned_retain() -> Function {
    let mut func = make_func("unowned_retain", 1, 0);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);

    let entry = b.create_block();
    let live = b.create_block();
    let bump = b.create_block();
    let done = b.create_block();

    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let obj = b.block_params(entry)[0];
    let is_null = b.ins().icmp_imm(IntCC::Equal, obj, 0);
    b.ins().brif(is_null, done, &[], live, &[]);

    b.switch_to_block(live);
    let rc = b.ins().load(I64, flags(), obj, OFF_REFCOUNT);
    let immortal = b.ins().icmp_imm(IntCC::Equal, rc, RC_IMMORTAL);
    b.ins().brif(immortal, done, &[], bump, &[]);

    b.switch_to_block(bump);
    let bumped = b.ins().iadd_imm(rc, UNOWNED_RC_ONE);
    b.ins().store(flags(), bumped, obj, OFF_REFCOUNT);
    b.ins().jump(done, &[]);

    b.switch_to_block(done);
    b.ins().return_(&[]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `unowned_release(obj)`: drop an unowned reference; the memory goes back
/// when the count hits zero.
fn unowned_release() -> Function {
    let mut func = make_func("unowned_release", 1, 0);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let dealloc = import_runtime(&mut b, "dealloc", 1, 0);

    let entry = b.create_block();
    let live = b.create_block();
    let drop_one = b.create_block();
    let free_it = b.create_block();
    let done = b.create_block();

    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let obj = b.block_params(entry)[0];
    let is_null = b.ins().icmp_imm(IntCC::Equal, obj, 0);
    b.ins().brif(is_null, done, &[], live, &[]);

    b.switch_to_block(live);
    let rc = b.ins().load(I64, flags(), obj, OFF_REFCOUNT);
    let immortal = b.ins().icmp_imm(IntCC::Equal, rc, RC_IMMORTAL);
    b.ins().brif(immortal, done, &[], drop_one, &[]);

    b.switch_to_block(drop_one);
    let dropped = b.ins().iadd_imm(rc, -UNOWNED_RC_ONE);
    b.ins().store(flags(), dropped, obj, OFF_REFCOUNT);
    let remaining = b.ins().band_imm(dropped, UNOWNED_RC_MASK);
    let none_left = b.ins().icmp_imm(IntCC::Equal, remaining, 0);
    b.ins().brif(none_left, free_it, &[], done, &[]);

    b.switch_to_block(free_it);
    b.ins().call(dealloc, &[obj]);
    b.ins().jump(done, &[]);

    b.switch_to_block(done);
    b.ins().return_(&[]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `unowned_load_strong(obj) -> obj|0`: promote an unowned reference to a
/// strong one; trap if the object is already tearing down.
fn unowned_load_strong() -> Function {
    let mut func = make_func("unowned_load_strong", 1, 1);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let retain = import_runtime(&mut b, "retain", 1, 1);

    let entry = b.create_block();
    let null_case = b.create_block();
    let live = b.create_block();
    let check = b.create_block();
    let dead = b.create_block();
    let promote = b.create_block();

    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let obj = b.block_params(entry)[0];
    let is_null = b.ins().icmp_imm(IntCC::Equal, obj, 0);
    b.ins().brif(is_null, null_case, &[], live, &[]);

    b.switch_to_block(null_case);
    let zero = b.ins().iconst(I64, 0);
    b.ins().return_(&[zero]);

    b.switch_to_block(live);
    let rc = b.ins().load(I64, flags(), obj, OFF_REFCOUNT);
    let immortal = b.ins().icmp_imm(IntCC::Equal, rc, RC_IMMORTAL);
    b.ins().brif(immortal, promote, &[], check, &[]);

    b.switch_to_block(check);
    let deiniting = b.ins().band_imm(rc, RC_DEINITING);
    let tearing_down = b.ins().icmp_imm(IntCC::NotEqual, deiniting, 0);
    b.ins().brif(tearing_down, dead, &[], promote, &[]);

    b.switch_to_block(dead);
    b.ins().trap(TrapCode::UseDuringDeinit);

    b.switch_to_block(promote);
    let call = b.ins().call(retain, &[obj]);
    let strong = b.single_result(call);
    b.ins().return_(&[strong]);

    b.seal_all_blocks();
    b.finalize();
    func
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Retain then release leaves the word where it started; the identity
    /// holds on the bit representation itself.
    #[test]
    fn retain_release_round_trip() {
        let start = RC_INITIAL as u64;
        let retained = start.wrapping_add(STRONG_RC_ONE as u64);
        let released = retained.wrapping_sub(STRONG_RC_ONE as u64);
        assert_eq!(released, start);
        assert_eq!(start, 0x0000_0000_0000_0003);
    }

    #[test]
    fn bit_layout_constants() {
        assert_eq!(RC_PURE_DEALLOC, 1);
        assert_eq!(UNOWNED_RC_ONE, 2);
        assert_eq!(RC_DEINITING, 0x1_0000_0000);
        assert_eq!(STRONG_RC_ONE, 0x2_0000_0000);
        assert_eq!(RC_IMMORTAL as u64, u64::MAX);
        // The strong and unowned fields do not overlap the flags.
        assert_eq!(STRONG_RC_MASK & RC_DEINITING, 0);
        assert_eq!(STRONG_RC_MASK & UNOWNED_RC_MASK, 0);
        assert_eq!(UNOWNED_RC_MASK & RC_PURE_DEALLOC, 0);
        // Bit 63 stays clear.
        assert!(STRONG_RC_MASK > 0);
    }

    /// The scenario from the runtime contract: two retains and one release
    /// leave one net strong reference outstanding.
    #[test]
    fn net_retain_is_visible_in_the_word() {
        let mut rc = RC_INITIAL;
        rc += STRONG_RC_ONE; // retain
        rc += STRONG_RC_ONE; // retain
        rc -= STRONG_RC_ONE; // release (fast path, extra was nonzero)
        assert_eq!(rc, RC_INITIAL + STRONG_RC_ONE);
        assert_eq!(rc & STRONG_RC_MASK, STRONG_RC_ONE);
    }

    #[test]
    fn release_chain_reaches_dealloc() {
        // Drop to extra == 0, flag deiniting, then the unowned release
        // takes the count to zero.
        let mut rc = RC_INITIAL + STRONG_RC_ONE;
        rc -= STRONG_RC_ONE;
        assert_eq!(rc & STRONG_RC_MASK, 0);
        rc |= RC_DEINITING;
        assert_ne!(rc & RC_DEINITING, 0);
        rc -= UNOWNED_RC_ONE;
        assert_eq!(rc & UNOWNED_RC_MASK, 0);
    }

    #[test]
    fn release_uses_an_indirect_destructor_call() {
        let func = release();
        let text = format!("{}", func.display());
        assert!(text.contains("call_indirect"), "{}", text);
        assert!(text.contains("%unowned_release"), "{}", text);
    }

    #[test]
    fn alloc_initializes_the_header() {
        let func = alloc();
        let text = format!("{}", func.display());
        assert!(text.contains("%malloc"), "{}", text);
        // Initial refcount constant.
        assert!(text.contains(" 3"), "{}", text);
    }
}
