//! End-to-end compilation of low SSA functions.

use cot_codegen::isa::{self, TargetIsa};
use cot_codegen::ssa::{
    Aux, Func, FuncDecl, FuncTable, SsaOp, TypeRegistry, ValueData,
};
use cot_codegen::Context;
use smallvec::smallvec;
use std::str::FromStr;
use target_lexicon::Triple;

fn x64_isa() -> Box<dyn TargetIsa> {
    isa::lookup(Triple::from_str("x86_64-unknown-linux-gnu").unwrap()).unwrap()
}

fn aarch64_isa() -> Box<dyn TargetIsa> {
    isa::lookup(Triple::from_str("aarch64-unknown-linux-gnu").unwrap()).unwrap()
}

/// fn add(a, b) { return a + b }
fn add_func(types: &TypeRegistry) -> Func {
    let mut func = Func::new("add");
    func.params = vec![types.i64(), types.i64()];
    func.returns = vec![types.i64()];
    let b = func.create_block();
    let a0 = func.append(b, ValueData::new(SsaOp::Arg, types.i64(), []).with_aux_int(0));
    let a1 = func.append(b, ValueData::new(SsaOp::Arg, types.i64(), []).with_aux_int(1));
    let sum = func.append(b, ValueData::new(SsaOp::Iadd, types.i64(), [a0, a1]));
    func.append(b, ValueData::new(SsaOp::Ret, types.i64(), [sum]));
    func
}

/// fn factorial(n) { if n <= 1 { return 1 } return n * factorial(n - 1) }
fn factorial_func(types: &TypeRegistry, funcs: &mut FuncTable) -> Func {
    let me = funcs.declare(FuncDecl {
        name: "factorial".to_string(),
        params: vec![types.i64()],
        returns: vec![types.i64()],
        external: false,
    });
    let mut func = Func::new("factorial");
    func.params = vec![types.i64()];
    func.returns = vec![types.i64()];
    let entry = func.create_block();
    let base = func.create_block();
    let recurse = func.create_block();

    let n = func.append(
        entry,
        ValueData::new(SsaOp::Arg, types.i64(), []).with_aux_int(0),
    );
    let one = func.append(
        entry,
        ValueData::new(SsaOp::ConstInt, types.i64(), []).with_aux_int(1),
    );
    let le = func.append(
        entry,
        ValueData::new(SsaOp::Icmp, types.bool(), [n, one])
            .with_aux(Aux::Cond(cot_codegen::ir::IntCC::SignedLessThanOrEqual)),
    );
    func.append(
        entry,
        ValueData::new(SsaOp::Brif, types.bool(), [le])
            .with_aux(Aux::Targets(smallvec![base, recurse])),
    );
    func.add_pred(base, entry);
    func.add_pred(recurse, entry);

    let one2 = func.append(
        base,
        ValueData::new(SsaOp::ConstInt, types.i64(), []).with_aux_int(1),
    );
    func.append(base, ValueData::new(SsaOp::Ret, types.i64(), [one2]));

    let one3 = func.append(
        recurse,
        ValueData::new(SsaOp::ConstInt, types.i64(), []).with_aux_int(1),
    );
    let dec = func.append(recurse, ValueData::new(SsaOp::Isub, types.i64(), [n, one3]));
    let call = func.append(
        recurse,
        ValueData::new(SsaOp::StaticCall, types.i64(), [dec]).with_aux(Aux::Func(me)),
    );
    let prod = func.append(recurse, ValueData::new(SsaOp::Imul, types.i64(), [n, call]));
    func.append(recurse, ValueData::new(SsaOp::Ret, types.i64(), [prod]));
    func
}

#[test]
fn add_compiles_on_both_isas() {
    for isa in [x64_isa(), aarch64_isa()] {
        let types = TypeRegistry::new();
        let funcs = FuncTable::new();
        let mut func = add_func(&types);
        let code = Context::new()
            .compile(&mut func, &types, &funcs, &*isa)
            .unwrap();
        assert!(!code.bytes.is_empty());
        assert_eq!(code.frame_size % 16, 0);
        assert!(code.frame_size >= 16);
        assert!(code.relocs.is_empty());
    }
}

#[test]
fn add_x64_has_the_standard_prologue() {
    let types = TypeRegistry::new();
    let funcs = FuncTable::new();
    let mut func = add_func(&types);
    let code = Context::new()
        .compile(&mut func, &types, &funcs, &*x64_isa())
        .unwrap();
    // push rbp; mov rbp, rsp.
    assert_eq!(&code.bytes[..4], &[0x55, 0x48, 0x89, 0xE5]);
    // A ret must be present.
    assert!(code.bytes.contains(&0xC3));
}

#[test]
fn add_aarch64_saves_and_restores_the_frame_pair() {
    let types = TypeRegistry::new();
    let funcs = FuncTable::new();
    let mut func = add_func(&types);
    let code = Context::new()
        .compile(&mut func, &types, &funcs, &*aarch64_isa())
        .unwrap();
    // STP x29, x30, [sp, #-16]! opens a 16-byte frame.
    let first = u32::from_le_bytes(code.bytes[..4].try_into().unwrap());
    assert_eq!(first, 0xA9BF7BFD);
    // RET x30 closes it.
    let last = u32::from_le_bytes(code.bytes[code.bytes.len() - 4..].try_into().unwrap());
    assert_eq!(last, 0xD65F03C0);
}

#[test]
fn factorial_emits_a_recursive_call_reloc() {
    for isa in [x64_isa(), aarch64_isa()] {
        let types = TypeRegistry::new();
        let mut funcs = FuncTable::new();
        let mut func = factorial_func(&types, &mut funcs);
        let code = Context::new()
            .compile(&mut func, &types, &funcs, &*isa)
            .unwrap();
        let call_relocs: Vec<_> = code
            .relocs
            .iter()
            .filter(|r| match &r.target {
                cot_codegen::binemit::RelocTarget::Symbol(s) => s == "factorial",
                _ => false,
            })
            .collect();
        assert_eq!(call_relocs.len(), 1, "{}", isa.name());
        // `n` lives across the recursive call, so the function commits to
        // a callee-saved register or a spill slot; either way the frame
        // stays aligned.
        assert_eq!(code.frame_size % 16, 0);
    }
}

#[test]
fn high_register_pressure_spills_and_reloads() {
    // A chain of adds over more live values than there are registers.
    let types = TypeRegistry::new();
    let funcs = FuncTable::new();
    let mut func = Func::new("pressure");
    func.params = vec![types.i64(), types.i64()];
    func.returns = vec![types.i64()];
    let b = func.create_block();
    let a0 = func.append(b, ValueData::new(SsaOp::Arg, types.i64(), []).with_aux_int(0));
    let a1 = func.append(b, ValueData::new(SsaOp::Arg, types.i64(), []).with_aux_int(1));
    // Build 40 intermediate sums, then consume them in reverse so that
    // every one of them is live at the midpoint.
    let mut defs = vec![a0, a1];
    for i in 2..40 {
        let x = defs[i - 1];
        let y = defs[i - 2];
        let sum = func.append(b, ValueData::new(SsaOp::Iadd, types.i64(), [x, y]));
        defs.push(sum);
    }
    let mut acc = defs[0];
    for &d in defs.iter().rev() {
        acc = func.append(b, ValueData::new(SsaOp::Iadd, types.i64(), [acc, d]));
    }
    func.append(b, ValueData::new(SsaOp::Ret, types.i64(), [acc]));

    for isa in [x64_isa(), aarch64_isa()] {
        let types = TypeRegistry::new();
        let mut f = func.clone();
        let code = Context::new().compile(&mut f, &types, &funcs, &*isa).unwrap();
        // The frame must have grown beyond the bare minimum to hold
        // spills on at least the smaller register file.
        assert_eq!(code.frame_size % 16, 0);
        assert!(!code.bytes.is_empty());
    }
}

#[test]
fn div_uses_the_fixed_registers_on_x64() {
    let types = TypeRegistry::new();
    let funcs = FuncTable::new();
    let mut func = Func::new("quot");
    func.params = vec![types.i64(), types.i64()];
    func.returns = vec![types.i64()];
    let b = func.create_block();
    let a0 = func.append(b, ValueData::new(SsaOp::Arg, types.i64(), []).with_aux_int(0));
    let a1 = func.append(b, ValueData::new(SsaOp::Arg, types.i64(), []).with_aux_int(1));
    let q = func.append(b, ValueData::new(SsaOp::Sdiv, types.i64(), [a0, a1]));
    func.append(b, ValueData::new(SsaOp::Ret, types.i64(), [q]));
    let code = Context::new()
        .compile(&mut func, &types, &funcs, &*x64_isa())
        .unwrap();
    // CQO must appear before the IDIV.
    let cqo = code.bytes.windows(2).position(|w| w == [0x48, 0x99]);
    assert!(cqo.is_some(), "{:02x?}", code.bytes);
}
