//! Aggregate decomposition.
//!
//! Rewrites every string- or slice-typed value into a `string_make(ptr,
//! len)` composition (`slice_make` for slices) so that no value wider than a
//! machine register flows through allocation. Consumers are rewritten to go
//! through the `string_ptr`/`string_len` extractors, which fold away when
//! they see through a composition.
//!
//! New stores can expose new wide values, so the rewrite runs to a fixed
//! point with an iteration cap.

use crate::ssa::{sweep_dead, Aux, Func, SsaOp, TypeData, TypeId, TypeRegistry, ValueData, ValueId};
use smallvec::{smallvec, SmallVec};
use std::collections::HashMap;

const MAX_ITERATIONS: usize = 10;

/// Is `ty` a (pointer, length) pair type?
fn pair_kind(types: &TypeRegistry, ty: TypeId) -> Option<PairOps> {
    match types.data(ty) {
        TypeData::Str => Some(PairOps {
            make: SsaOp::StringMake,
            ptr: SsaOp::StringPtr,
            len: SsaOp::StringLen,
        }),
        TypeData::Slice { .. } => Some(PairOps {
            make: SsaOp::SliceMake,
            ptr: SsaOp::SlicePtr,
            len: SsaOp::SliceLen,
        }),
        _ => None,
    }
}

#[derive(Copy, Clone)]
struct PairOps {
    make: SsaOp,
    ptr: SsaOp,
    len: SsaOp,
}

/// Run the decomposition pass over `func`.
pub fn decompose(func: &mut Func, types: &TypeRegistry) {
    rewrite_params(func, types);
    rewrite_returns_decl(func, types);

    for iteration in 0..MAX_ITERATIONS {
        let changed = run_once(func, types);
        log::debug!(
            "decompose {}: iteration {} {}",
            func.name,
            iteration,
            if changed { "changed" } else { "stable" }
        );
        if !changed {
            break;
        }
    }
    sweep_dead(func);
    debug_assert!(wide_values_composed(func, types), "{}", func.display(types));
}

/// Check §invariant: every string/slice-typed value is a composition or one
/// of its immediate extractors.
pub fn wide_values_composed(func: &Func, types: &TypeRegistry) -> bool {
    func.blocks.values().all(|block| {
        block.values.iter().all(|&v| {
            let data = &func.values[v];
            pair_kind(types, data.ty).is_none()
                || matches!(
                    data.op,
                    SsaOp::StringMake
                        | SsaOp::StringPtr
                        | SsaOp::StringLen
                        | SsaOp::SliceMake
                        | SsaOp::SlicePtr
                        | SsaOp::SliceLen
                )
        })
    })
}

/// Expand pair-typed parameters into two ABI argument slots and remap the
/// argument indices of every `Arg` value.
fn rewrite_params(func: &mut Func, types: &TypeRegistry) {
    let mut abi_index = Vec::with_capacity(func.params.len());
    let mut new_params = Vec::with_capacity(func.params.len());
    for &ty in &func.params {
        abi_index.push(new_params.len() as i64);
        if pair_kind(types, ty).is_some() {
            new_params.push(types.ptr());
            new_params.push(types.i64());
        } else {
            new_params.push(ty);
        }
    }
    if new_params == func.params {
        // Even with no pair params, arg indices are already ABI indices.
        return;
    }
    func.params = new_params;

    for block in func.blocks.keys() {
        let values = func.blocks[block].values.clone();
        for v in values {
            let data = &func.values[v];
            if data.op != SsaOp::Arg {
                continue;
            }
            let orig = data.aux_int as usize;
            let ty = data.ty;
            let index = func.blocks[block].values.iter().position(|&x| x == v).unwrap();
            if let Some(ops) = pair_kind(types, ty) {
                let p = func.insert(
                    block,
                    index,
                    ValueData::new(SsaOp::Arg, types.ptr(), []).with_aux_int(abi_index[orig]),
                );
                let l = func.insert(
                    block,
                    index + 1,
                    ValueData::new(SsaOp::Arg, types.i64(), []).with_aux_int(abi_index[orig] + 1),
                );
                let val = &mut func.values[v];
                val.op = ops.make;
                val.aux_int = 0;
                val.args = smallvec![p, l];
                func.values[p].uses += 1;
                func.values[l].uses += 1;
            } else {
                func.values[v].aux_int = abi_index[orig];
            }
        }
    }
}

/// Expand pair-typed return declarations into (ptr, len).
fn rewrite_returns_decl(func: &mut Func, types: &TypeRegistry) {
    let mut new_returns = Vec::with_capacity(func.returns.len());
    for &ty in &func.returns {
        if pair_kind(types, ty).is_some() {
            new_returns.push(types.ptr());
            new_returns.push(types.i64());
        } else {
            new_returns.push(ty);
        }
    }
    func.returns = new_returns;
}

fn run_once(func: &mut Func, types: &TypeRegistry) -> bool {
    let mut changed = false;
    let mut fold: HashMap<ValueId, ValueId> = HashMap::new();

    for block in func.blocks.keys().collect::<Vec<_>>() {
        // Walk by index; rewrites may insert values before or after the
        // current position.
        let mut i = 0;
        while i < func.blocks[block].values.len() {
            let v = func.blocks[block].values[i];
            let data = &func.values[v];
            match data.op {
                SsaOp::Load => {
                    if let Some(ops) = pair_kind(types, data.ty) {
                        let addr = data.args[0];
                        let off = data.aux_int;
                        let lo = func.insert(
                            block,
                            i,
                            ValueData::new(SsaOp::Load, types.ptr(), [addr]).with_aux_int(off),
                        );
                        let hi = func.insert(
                            block,
                            i + 1,
                            ValueData::new(SsaOp::Load, types.i64(), [addr]).with_aux_int(off + 8),
                        );
                        let val = &mut func.values[v];
                        val.op = ops.make;
                        val.aux_int = 0;
                        val.args = smallvec![lo, hi];
                        func.values[lo].uses += 1;
                        func.values[hi].uses += 1;
                        func.values[addr].uses -= 1;
                        changed = true;
                        i += 3;
                        continue;
                    }
                }
                SsaOp::ConstStr => {
                    if pair_kind(types, data.ty).is_some() {
                        let pool = match data.aux {
                            Aux::Str(s) => s,
                            _ => panic!("const_str without a pool reference"),
                        };
                        let len = func.strings[pool as usize].len() as i64;
                        let p = func.insert(
                            block,
                            i,
                            ValueData::new(SsaOp::ConstStr, types.ptr(), [])
                                .with_aux(Aux::Str(pool)),
                        );
                        let l = func.insert(
                            block,
                            i + 1,
                            ValueData::new(SsaOp::ConstInt, types.i64(), []).with_aux_int(len),
                        );
                        let val = &mut func.values[v];
                        val.op = SsaOp::StringMake;
                        val.aux = Aux::None;
                        val.args = smallvec![p, l];
                        func.values[p].uses += 1;
                        func.values[l].uses += 1;
                        changed = true;
                        i += 3;
                        continue;
                    }
                }
                SsaOp::Store => {
                    let stored = data.args[1];
                    if pair_kind(types, func.values[stored].ty).is_some() {
                        let stored_data = &func.values[stored];
                        if matches!(stored_data.op, SsaOp::StringMake | SsaOp::SliceMake) {
                            let addr = data.args[0];
                            let off = data.aux_int;
                            let (p, l) = (stored_data.args[0], stored_data.args[1]);
                            func.set_arg(v, 1, p);
                            let second = func
                                .make_value(ValueData::new(SsaOp::Store, types.i64(), [addr, l])
                                    .with_aux_int(off + 8));
                            func.blocks[block].values.insert(i + 1, second);
                            changed = true;
                            i += 2;
                            continue;
                        }
                        // Not yet a composition; a later iteration will get it.
                    }
                }
                SsaOp::Ret => {
                    if data
                        .args
                        .iter()
                        .any(|&a| pair_kind(types, func.values[a].ty).is_some())
                    {
                        let old_args = data.args.clone();
                        let mut new_args: SmallVec<[ValueId; 3]> = SmallVec::new();
                        for &a in &old_args {
                            if let Some(ops) = pair_kind(types, func.values[a].ty) {
                                let p = func.insert(
                                    block,
                                    i,
                                    ValueData::new(ops.ptr, types.ptr(), [a]),
                                );
                                i += 1;
                                let l = func.insert(
                                    block,
                                    i,
                                    ValueData::new(ops.len, types.i64(), [a]),
                                );
                                i += 1;
                                new_args.push(p);
                                new_args.push(l);
                            } else {
                                new_args.push(a);
                            }
                        }
                        for &a in &new_args {
                            func.values[a].uses += 1;
                        }
                        for &a in &old_args {
                            func.values[a].uses -= 1;
                        }
                        func.values[v].args = new_args;
                        changed = true;
                    }
                }
                SsaOp::StaticCall | SsaOp::ClosureCall => {
                    // Pair-typed arguments flatten into (ptr, len) ABI
                    // slots through the extractors.
                    let old_args = data.args.clone();
                    if old_args
                        .iter()
                        .any(|&a| pair_kind(types, func.values[a].ty).is_some())
                    {
                        let mut new_args: SmallVec<[ValueId; 3]> = SmallVec::new();
                        for &a in &old_args {
                            if let Some(ops) = pair_kind(types, func.values[a].ty) {
                                let p = func.insert(
                                    block,
                                    i,
                                    ValueData::new(ops.ptr, types.ptr(), [a]),
                                );
                                i += 1;
                                let l = func.insert(
                                    block,
                                    i,
                                    ValueData::new(ops.len, types.i64(), [a]),
                                );
                                i += 1;
                                new_args.push(p);
                                new_args.push(l);
                            } else {
                                new_args.push(a);
                            }
                        }
                        for &a in &new_args {
                            func.values[a].uses += 1;
                        }
                        for &a in &old_args {
                            func.values[a].uses -= 1;
                        }
                        func.values[v].args = new_args;
                        changed = true;
                    }

                    let data = &func.values[v];
                    if let Some(ops) = pair_kind(types, data.ty) {
                        // The call keeps the pointer half; the length half
                        // arrives in the second result register.
                        let call_data = ValueData {
                            op: data.op,
                            ty: types.ptr(),
                            args: data.args.clone(),
                            aux_int: data.aux_int,
                            aux: data.aux.clone(),
                            uses: 0,
                            pos: data.pos,
                            home: crate::ssa::Home::None,
                        };
                        let old_args = data.args.clone();
                        let c = func.insert(block, i, call_data);
                        for &a in &old_args {
                            func.values[a].uses -= 1;
                        }
                        let l = func.insert(
                            block,
                            i + 1,
                            ValueData::new(SsaOp::SelectN, types.i64(), [c]).with_aux_int(1),
                        );
                        let val = &mut func.values[v];
                        val.op = ops.make;
                        val.aux = Aux::None;
                        val.aux_int = 0;
                        val.args = smallvec![c, l];
                        func.values[c].uses += 1;
                        func.values[l].uses += 1;
                        changed = true;
                        i += 3;
                        continue;
                    }
                }
                SsaOp::StringPtr | SsaOp::SlicePtr => {
                    let src = data.args[0];
                    if matches!(func.values[src].op, SsaOp::StringMake | SsaOp::SliceMake) {
                        fold.insert(v, func.values[src].args[0]);
                    }
                }
                SsaOp::StringLen | SsaOp::SliceLen => {
                    let src = data.args[0];
                    if matches!(func.values[src].op, SsaOp::StringMake | SsaOp::SliceMake) {
                        fold.insert(v, func.values[src].args[1]);
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    if !fold.is_empty() {
        apply_folds(func, &fold);
        changed = true;
    }
    changed
}

/// Rewrite every argument through the fold map, chasing chains.
fn apply_folds(func: &mut Func, fold: &HashMap<ValueId, ValueId>) {
    let resolve = |mut v: ValueId| {
        while let Some(&next) = fold.get(&v) {
            v = next;
        }
        v
    };
    for v in func.values.keys().collect::<Vec<_>>() {
        for idx in 0..func.values[v].args.len() {
            let arg = func.values[v].args[idx];
            let target = resolve(arg);
            if target != arg {
                func.set_arg(v, idx, target);
            }
        }
    }
    // The folded extractors lose their operand uses when swept.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::Home;

    fn str_load_store_func(types: &TypeRegistry) -> Func {
        // b0:
        //   a0 = arg 0          ; ptr
        //   s  = load.str a0
        //   store a0+16, s
        //   ret
        let mut func = Func::new("copy16");
        func.params = vec![types.ptr()];
        let b = func.create_block();
        let a0 = func.append(b, ValueData::new(SsaOp::Arg, types.ptr(), []));
        let s = func.append(b, ValueData::new(SsaOp::Load, types.str(), [a0]));
        func.append(
            b,
            ValueData::new(SsaOp::Store, types.str(), [a0, s]).with_aux_int(16),
        );
        func.append(b, ValueData::new(SsaOp::Ret, types.ptr(), []));
        func
    }

    #[test]
    fn loads_and_stores_split() {
        let types = TypeRegistry::new();
        let mut func = str_load_store_func(&types);
        decompose(&mut func, &types);
        assert!(wide_values_composed(&func, &types));
        // The store of the 16-byte string became two 8-byte stores.
        let stores = func
            .blocks
            .values()
            .flat_map(|b| b.values.iter())
            .filter(|&&v| func.values[v].op == SsaOp::Store)
            .count();
        assert_eq!(stores, 2);
    }

    #[test]
    fn idempotent() {
        let types = TypeRegistry::new();
        let mut once = str_load_store_func(&types);
        decompose(&mut once, &types);
        let mut twice = once.clone();
        decompose(&mut twice, &types);
        assert_eq!(
            format!("{}", once.display(&types)),
            format!("{}", twice.display(&types))
        );
    }

    #[test]
    fn string_params_become_two_args() {
        let types = TypeRegistry::new();
        let mut func = Func::new("takes_str");
        func.params = vec![types.str(), types.i64()];
        let b = func.create_block();
        let s = func.append(
            b,
            ValueData::new(SsaOp::Arg, types.str(), []).with_aux_int(0),
        );
        let n = func.append(
            b,
            ValueData::new(SsaOp::Arg, types.i64(), []).with_aux_int(1),
        );
        let p = func.append(b, ValueData::new(SsaOp::StringPtr, types.ptr(), [s]));
        let sum = func.append(b, ValueData::new(SsaOp::Iadd, types.i64(), [p, n]));
        func.append(b, ValueData::new(SsaOp::Ret, types.i64(), [sum]));
        decompose(&mut func, &types);

        assert_eq!(
            func.params,
            vec![types.ptr(), types.i64(), types.i64()]
        );
        // The i64 parameter moved to ABI index 2.
        let arg_indices: Vec<i64> = func.blocks[func.entry()]
            .values
            .iter()
            .filter(|&&v| func.values[v].op == SsaOp::Arg)
            .map(|&v| func.values[v].aux_int)
            .collect();
        assert!(arg_indices.contains(&2));
        // The extractor folded straight to the pointer argument.
        let sum_lhs = func.values[sum].args[0];
        assert_eq!(func.values[sum_lhs].op, SsaOp::Arg);
        assert_eq!(func.values[sum_lhs].home, Home::None);
    }
}
