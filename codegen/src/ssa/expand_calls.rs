//! Call expansion.
//!
//! Enforces the SSA size ceiling: after this pass no value is wider than 32
//! bytes, and every aggregate that does not fit the register-passing rules
//! moves by address. Oversized call arguments are copied into a fresh stack
//! buffer whose address is passed instead; oversized returns go through a
//! hidden struct-return pointer prepended to the parameter list.

use crate::ssa::{Func, LocalData, SsaOp, TypeData, TypeId, TypeRegistry, ValueData, ValueId};

/// Aggregates wider than this are passed and returned by address.
const REG_ARG_LIMIT: u32 = 8;

/// The hard ceiling on the width of any SSA value after expansion.
pub const VALUE_SIZE_CEILING: u32 = 32;

/// Call `aux_int` flag: the call carries a hidden struct-return pointer as
/// its first ABI argument.
pub const CALL_FLAG_SRET: i64 = 1;

fn is_by_address(types: &TypeRegistry, ty: TypeId) -> bool {
    matches!(types.data(ty), TypeData::Struct { .. }) && types.size_of(ty) > REG_ARG_LIMIT
}

/// Run the call-expansion pass over `func`.
pub fn expand_calls(func: &mut Func, types: &TypeRegistry) {
    let had_sret = expand_own_returns(func, types);
    expand_params(func, types, had_sret);
    expand_call_sites(func, types);
    expand_wide_result_stores(func, types);
    crate::ssa::sweep_dead(func);
    debug_assert!(
        max_value_size(func, types) <= VALUE_SIZE_CEILING,
        "{}",
        func.display(types)
    );
}

/// The widest scheduled value type in `func`.
pub fn max_value_size(func: &Func, types: &TypeRegistry) -> u32 {
    func.blocks
        .values()
        .flat_map(|b| b.values.iter())
        .map(|&v| types.size_of(func.values[v].ty))
        .max()
        .unwrap_or(0)
}

/// If the function returns an oversized aggregate, rewrite it to write
/// through a hidden return pointer. Returns whether the rewrite happened.
fn expand_own_returns(func: &mut Func, types: &TypeRegistry) -> bool {
    let oversized = func
        .returns
        .iter()
        .any(|&ty| is_by_address(types, ty));
    if !oversized {
        return false;
    }
    debug_assert_eq!(func.returns.len(), 1, "one oversized return only");
    let ret_ty = func.returns[0];
    let size = types.size_of(ret_ty);
    func.returns = vec![types.ptr()];

    // The hidden pointer is ABI argument 0; materialize it at function entry.
    let entry = func.entry();
    let sret = func.insert(
        entry,
        0,
        ValueData::new(SsaOp::Arg, types.ptr(), []).with_aux_int(0),
    );

    for block in func.blocks.keys().collect::<Vec<_>>() {
        let Some(term) = func.terminator(block) else {
            continue;
        };
        if func.values[term].op != SsaOp::Ret || func.values[term].args.is_empty() {
            continue;
        }
        let retval = func.values[term].args[0];
        if !is_by_address(types, func.values[retval].ty) {
            continue;
        }
        // The oversized value must be memory-resident: a load from an
        // address the front end picked.
        let (src_addr, src_off) = match func.values[retval].op {
            SsaOp::Load => (func.values[retval].args[0], func.values[retval].aux_int),
            op => panic!("oversized return of non-load {:?}", op),
        };
        let index = func.blocks[block]
            .values
            .iter()
            .position(|&v| v == term)
            .unwrap();
        let addr = if src_off != 0 {
            let off = func.insert(
                block,
                index,
                ValueData::new(SsaOp::ConstInt, types.i64(), []).with_aux_int(src_off),
            );
            func.insert(
                block,
                index + 1,
                ValueData::new(SsaOp::Iadd, types.ptr(), [src_addr, off]),
            )
        } else {
            src_addr
        };
        let index = func.blocks[block]
            .values
            .iter()
            .position(|&v| v == term)
            .unwrap();
        func.insert(
            block,
            index,
            ValueData::new(SsaOp::Move, types.ptr(), [sret, addr]).with_aux_int(size as i64),
        );
        // The ret hands the hidden pointer back in the result register.
        func.set_arg(term, 0, sret);
    }
    true
}

/// Retype oversized aggregate parameters as addresses into caller memory,
/// and shift ABI indices when a hidden return pointer was prepended.
fn expand_params(func: &mut Func, types: &TypeRegistry, had_sret: bool) {
    let mut new_params = Vec::with_capacity(func.params.len() + 1);
    if had_sret {
        new_params.push(types.ptr());
    }
    for &ty in &func.params {
        new_params.push(if is_by_address(types, ty) {
            types.ptr()
        } else {
            ty
        });
    }
    let shift = had_sret as i64;
    // The sret arg materialized by `expand_own_returns` sits first in the
    // entry block and already has its final index and type.
    let sret_value = if had_sret {
        func.blocks[func.entry()].values.first().copied()
    } else {
        None
    };
    for v in func.values.keys().collect::<Vec<ValueId>>() {
        if Some(v) == sret_value {
            continue;
        }
        let data = &mut func.values[v];
        if data.op != SsaOp::Arg {
            continue;
        }
        data.aux_int += shift;
        if is_by_address(types, data.ty) {
            data.ty = types.ptr();
        }
    }
    func.params = new_params;
}

/// Copy oversized call arguments into fresh stack buffers and pass the
/// buffer address; allocate hidden return buffers for oversized results.
fn expand_call_sites(func: &mut Func, types: &TypeRegistry) {
    for block in func.blocks.keys().collect::<Vec<_>>() {
        let mut i = 0;
        while i < func.blocks[block].values.len() {
            let v = func.blocks[block].values[i];
            if !func.values[v].op.is_call() {
                i += 1;
                continue;
            }
            // Oversized arguments move through a caller-owned copy.
            let argc = func.values[v].args.len();
            let arg_start = match func.values[v].op {
                SsaOp::ClosureCall => 1,
                _ => 0,
            };
            for a in arg_start..argc {
                let arg = func.values[v].args[a];
                let arg_ty = func.values[arg].ty;
                if !is_by_address(types, arg_ty) {
                    continue;
                }
                let size = types.size_of(arg_ty);
                let (src_addr, src_off) = match func.values[arg].op {
                    SsaOp::Load => (func.values[arg].args[0], func.values[arg].aux_int),
                    op => panic!("oversized call argument of non-load {:?}", op),
                };
                debug_assert_eq!(src_off, 0, "front end keeps aggregates at offset 0");
                let local = func.locals.len() as i64;
                func.locals.push(LocalData { ty: arg_ty });
                let la = func.insert(
                    block,
                    i,
                    ValueData::new(SsaOp::LocalAddr, types.ptr(), []).with_aux_int(local),
                );
                i += 1;
                func.insert(
                    block,
                    i,
                    ValueData::new(SsaOp::Move, types.ptr(), [la, src_addr])
                        .with_aux_int(size as i64),
                );
                i += 1;
                func.set_arg(v, a, la);
            }
            // Oversized results come back through a hidden buffer.
            let ret_ty = func.values[v].ty;
            if is_by_address(types, ret_ty) && func.values[v].aux_int & CALL_FLAG_SRET == 0 {
                let local = func.locals.len() as i64;
                func.locals.push(LocalData { ty: ret_ty });
                let la = func.insert(
                    block,
                    i,
                    ValueData::new(SsaOp::LocalAddr, types.ptr(), []).with_aux_int(local),
                );
                i += 1;
                let data = &mut func.values[v];
                data.aux_int |= CALL_FLAG_SRET;
                data.ty = types.ptr();
                let insert_at = if data.op == SsaOp::ClosureCall { 1 } else { 0 };
                data.args.insert(insert_at, la);
                func.values[la].uses += 1;
            }
            i += 1;
        }
    }
}

/// Stores of oversized call results become bulk moves out of the hidden
/// return buffer (whose address is the call's value).
fn expand_wide_result_stores(func: &mut Func, types: &TypeRegistry) {
    for block in func.blocks.keys().collect::<Vec<_>>() {
        for idx in 0..func.blocks[block].values.len() {
            let v = func.blocks[block].values[idx];
            let data = &func.values[v];
            if data.op != SsaOp::Store {
                continue;
            }
            let stored = data.args[1];
            let stored_data = &func.values[stored];
            if !(stored_data.op.is_call() && stored_data.aux_int & CALL_FLAG_SRET != 0) {
                continue;
            }
            // The callee filled the buffer; this store is a bulk copy.
            let sret_local = match stored_data.op {
                SsaOp::ClosureCall => stored_data.args[1],
                _ => stored_data.args[0],
            };
            let size = match func.values[sret_local].op {
                SsaOp::LocalAddr => {
                    let l = func.values[sret_local].aux_int as usize;
                    types.size_of(func.locals[l].ty)
                }
                _ => continue,
            };
            let data = &mut func.values[v];
            data.op = SsaOp::Move;
            data.aux_int = size as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::Aux;

    fn big_struct(types: &mut TypeRegistry) -> TypeId {
        let i64t = types.i64();
        types.make_struct(vec![i64t; 5]) // 40 bytes
    }

    fn call_with_big_arg(types: &TypeRegistry, big: TypeId) -> (Func, ValueId) {
        // b0:
        //   p = arg 0 : ptr
        //   x = load.big p
        //   c = static_call f0(x) : i64
        //   ret c
        let mut func = Func::new("caller");
        func.params = vec![types.ptr()];
        func.returns = vec![types.i64()];
        let b = func.create_block();
        let p = func.append(b, ValueData::new(SsaOp::Arg, types.ptr(), []));
        let x = func.append(b, ValueData::new(SsaOp::Load, big, [p]));
        let c = func.append(
            b,
            ValueData::new(SsaOp::StaticCall, types.i64(), [x])
                .with_aux(Aux::Func(crate::ssa::FuncId::from_u32(0))),
        );
        func.append(b, ValueData::new(SsaOp::Ret, types.i64(), [c]));
        (func, c)
    }

    #[test]
    fn big_arguments_move_by_address() {
        let mut types = TypeRegistry::new();
        let big = big_struct(&mut types);
        let (mut func, c) = call_with_big_arg(&types, big);
        expand_calls(&mut func, &types);

        assert!(max_value_size(&func, &types) <= VALUE_SIZE_CEILING);
        // The call argument is now a local address, preceded by a bulk move.
        let arg = func.values[c].args[0];
        assert_eq!(func.values[arg].op, SsaOp::LocalAddr);
        let entry = func.entry();
        assert!(func.blocks[entry]
            .values
            .iter()
            .any(|&v| func.values[v].op == SsaOp::Move));
        assert_eq!(func.locals.len(), 1);
    }

    #[test]
    fn idempotent() {
        let mut types = TypeRegistry::new();
        let big = big_struct(&mut types);
        let (mut once, _) = call_with_big_arg(&types, big);
        expand_calls(&mut once, &types);
        let mut twice = once.clone();
        expand_calls(&mut twice, &types);
        assert_eq!(
            format!("{}", once.display(&types)),
            format!("{}", twice.display(&types))
        );
    }

    #[test]
    fn oversized_return_takes_hidden_pointer() {
        let mut types = TypeRegistry::new();
        let big = big_struct(&mut types);
        // fn make() -> big { return *local }
        let mut func = Func::new("make_big");
        func.returns = vec![big];
        let b = func.create_block();
        let la = func.append(
            b,
            ValueData::new(SsaOp::LocalAddr, types.ptr(), []).with_aux_int(0),
        );
        func.locals.push(LocalData { ty: big });
        let x = func.append(b, ValueData::new(SsaOp::Load, big, [la]));
        func.append(b, ValueData::new(SsaOp::Ret, big, [x]));
        expand_calls(&mut func, &types);

        assert_eq!(func.returns, vec![types.ptr()]);
        assert_eq!(func.params, vec![types.ptr()]);
        // Entry now starts with the hidden pointer argument, and the return
        // site copies through it.
        let first = func.blocks[func.entry()].values[0];
        assert_eq!(func.values[first].op, SsaOp::Arg);
        assert!(func.blocks[func.entry()]
            .values
            .iter()
            .any(|&v| func.values[v].op == SsaOp::Move));
        let term = func.terminator(func.entry()).unwrap();
        assert_eq!(func.values[term].args[0], first);
    }
}
