//! The whole pipeline: wasm operators and runtime generators through CLIF,
//! low SSA, allocation, lowering, and object emission.

use cot_codegen::isa::{self, TargetIsa};
use cot_codegen::ssa::{self, FuncTable, TypeRegistry};
use cot_codegen::Context;
use cot_frontend::{FunctionBuilder, FunctionBuilderContext};
use cot_object::ObjectBuilder;
use cot_wasm::FuncTranslator;
use std::str::FromStr;
use target_lexicon::Triple;
use wasmparser::{BlockType, Operator, ValType};

fn triples() -> Vec<Triple> {
    vec![
        Triple::from_str("x86_64-unknown-linux-gnu").unwrap(),
        Triple::from_str("aarch64-unknown-linux-gnu").unwrap(),
    ]
}

fn compile_clif(
    clif: cot_codegen::ir::Function,
    types: &mut TypeRegistry,
    funcs: &mut FuncTable,
    isa: &dyn TargetIsa,
) -> cot_codegen::CompiledCode {
    // The compiled function itself must be declared so calls can
    // reference it by name.
    let decl = ssa::FuncDecl {
        name: clif.name.as_str().to_string(),
        params: Vec::new(),
        returns: Vec::new(),
        external: false,
    };
    funcs.declare(decl);
    let mut func = ssa::func_from_clif(&clif, types, funcs);
    Context::new().compile(&mut func, types, funcs, isa).unwrap()
}

/// Scenario: the whole runtime compiles and links into one object on both
/// targets.
#[test]
fn runtime_compiles_into_an_object() {
    for triple in triples() {
        let isa = isa::lookup(triple.clone()).unwrap();
        let mut types = TypeRegistry::new();
        let mut funcs = FuncTable::new();
        let mut builder = ObjectBuilder::new(&triple).unwrap();
        for clif in cot_runtime::generate() {
            let code = compile_clif(clif, &mut types, &mut funcs, &*isa);
            builder.add_function(&code).unwrap();
        }
        let bytes = builder.finish().unwrap();
        assert!(!bytes.is_empty(), "{}", triple);
    }
}

/// Scenario: a wasm `check` function with both branches reachable, carried
/// through a VM context parameter.
#[test]
fn wasm_if_else_compiles_with_a_pinned_context() {
    use cot_codegen::ir::{
        AbiParam, ArgumentPurpose, CallConv, ExternalName, Function, Signature,
    };
    use cot_codegen::ir::types::{I32, I64};

    for triple in triples() {
        let isa = isa::lookup(triple.clone()).unwrap();
        let mut sig = Signature::new(CallConv::SystemV);
        sig.params
            .push(AbiParam::special(I64, ArgumentPurpose::VMContext));
        sig.params.push(AbiParam::new(I32));
        sig.returns.push(AbiParam::new(I32));
        let mut clif = Function::with_name_signature(ExternalName::new("check"), sig);

        // Wasm locals skip the context; local 0 must map onto the second
        // CLIF parameter. The translator numbers locals from the CLIF
        // parameter list, so the body uses local 1.
        let ops = vec![
            Operator::LocalGet { local_index: 1 },
            Operator::I32Const { value: 1 },
            Operator::I32GtS,
            Operator::If {
                blockty: BlockType::Type(ValType::I32),
            },
            Operator::I32Const { value: 99 },
            Operator::Else,
            Operator::I32Const { value: 0 },
            Operator::End,
            Operator::End,
        ];
        let mut ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut clif, &mut ctx);
        FuncTranslator::new()
            .translate(&ops, &[], &mut builder)
            .unwrap();
        builder.finalize();

        let mut types = TypeRegistry::new();
        let mut funcs = FuncTable::new();
        let code = compile_clif(clif, &mut types, &mut funcs, &*isa);
        assert!(!code.bytes.is_empty());
        assert_eq!(code.frame_size % 16, 0);

        // The prologue parks the context in the pinned register.
        match triple.architecture {
            target_lexicon::Architecture::X86_64 => {
                // mov r15, rdi.
                assert!(
                    code.bytes.windows(3).any(|w| w == [0x49, 0x89, 0xFF]),
                    "{:02x?}",
                    code.bytes
                );
            }
            _ => {
                // mov x21, x0 (ORR x21, xzr, x0).
                let insn = 0xAA00_03F5u32.to_le_bytes();
                assert!(
                    code.bytes.windows(4).any(|w| w == insn),
                    "{:02x?}",
                    code.bytes
                );
            }
        }

        let mut obj = ObjectBuilder::new(&triple).unwrap();
        obj.add_function(&code).unwrap();
        let bytes = obj.finish().unwrap();
        assert!(!bytes.is_empty());
    }
}

/// Scenario: a counting loop survives the whole pipeline.
#[test]
fn wasm_loop_compiles() {
    use cot_codegen::ir::types::I64;
    use cot_codegen::ir::{AbiParam, CallConv, ExternalName, Function, Signature};

    for triple in triples() {
        let isa = isa::lookup(triple.clone()).unwrap();
        let mut sig = Signature::new(CallConv::SystemV);
        sig.params.push(AbiParam::new(I64));
        sig.returns.push(AbiParam::new(I64));
        let mut clif = Function::with_name_signature(ExternalName::new("sum_to"), sig);

        let ops = vec![
            Operator::Loop {
                blockty: BlockType::Empty,
            },
            Operator::LocalGet { local_index: 1 },
            Operator::LocalGet { local_index: 0 },
            Operator::I64Add,
            Operator::LocalSet { local_index: 1 },
            Operator::LocalGet { local_index: 0 },
            Operator::I64Const { value: 1 },
            Operator::I64Sub,
            Operator::LocalTee { local_index: 0 },
            Operator::I64Const { value: 0 },
            Operator::I64Ne,
            Operator::BrIf { relative_depth: 0 },
            Operator::End,
            Operator::LocalGet { local_index: 1 },
            Operator::End,
        ];
        let mut ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut clif, &mut ctx);
        FuncTranslator::new()
            .translate(&ops, &[ValType::I64], &mut builder)
            .unwrap();
        builder.finalize();

        let mut types = TypeRegistry::new();
        let mut funcs = FuncTable::new();
        let code = compile_clif(clif, &mut types, &mut funcs, &*isa);
        assert!(!code.bytes.is_empty(), "{}", triple);
    }
}
