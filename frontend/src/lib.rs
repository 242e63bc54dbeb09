//! Cot IR builder library.
//!
//! Provides a straightforward interface for translating a language into
//! CLIF: the `FunctionBuilder` keeps the SSA invariants while the caller
//! thinks in blocks, instructions, and mutable `Variable`s.

#![warn(missing_docs)]

mod frontend;
mod variable;

pub use crate::frontend::{FuncInstBuilder, FunctionBuilder, FunctionBuilderContext};
pub use crate::variable::Variable;

#[cfg(test)]
mod tests {
    use super::*;
    use cot_codegen::ir::condcodes::IntCC;
    use cot_codegen::ir::types;
    use cot_codegen::ir::{AbiParam, CallConv, ExternalName, Function, Opcode, Signature};

    /// Build: fn sum_to(n) { s = 0; while n != 0 { s += n; n -= 1 }; s }
    #[test]
    fn loop_with_variables_gets_block_params() {
        let mut sig = Signature::new(CallConv::SystemV);
        sig.params.push(AbiParam::new(types::I64));
        sig.returns.push(AbiParam::new(types::I64));
        let mut func = Function::with_name_signature(ExternalName::new("sum_to"), sig);
        let mut ctx = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut func, &mut ctx);

        let n = Variable::new(0);
        let s = Variable::new(1);
        b.declare_var(n, types::I64);
        b.declare_var(s, types::I64);

        let entry = b.create_block();
        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();

        b.switch_to_block(entry);
        b.append_block_params_for_function_params(entry);
        let param = b.block_params(entry)[0];
        b.def_var(n, param);
        let zero = b.ins().iconst(types::I64, 0);
        b.def_var(s, zero);
        b.ins().jump(header, &[]);

        b.switch_to_block(header);
        let nv = b.use_var(n);
        let c = b.ins().icmp_imm(IntCC::NotEqual, nv, 0);
        b.ins().brif(c, body, &[], exit, &[]);

        b.switch_to_block(body);
        let nv = b.use_var(n);
        let sv = b.use_var(s);
        let sum = b.ins().iadd(sv, nv);
        b.def_var(s, sum);
        let dec = b.ins().iadd_imm(nv, -1);
        b.def_var(n, dec);
        b.ins().jump(header, &[]);

        b.switch_to_block(exit);
        let result = b.use_var(s);
        b.ins().return_(&[result]);

        b.seal_all_blocks();
        b.finalize();

        // The loop-carried variables surfaced as header parameters.
        let header_params = func.blocks[header].params.len();
        assert_eq!(header_params, 2, "{}", func.display());
        // Every branch into the header supplies both arguments.
        for block in [entry, body] {
            let term = func.terminator(block).unwrap();
            match &func.dfg.insts[term] {
                cot_codegen::ir::InstructionData::Jump { args, .. } => {
                    assert_eq!(args.len(), 2)
                }
                other => panic!("expected jump, got {:?}", other.opcode()),
            }
        }
        // The exit's use of `s` flows out of the header.
        let term = func.terminator(exit).unwrap();
        assert_eq!(func.dfg.insts[term].opcode(), Opcode::Return);
    }

    #[test]
    fn straightline_add() {
        let mut sig = Signature::new(CallConv::SystemV);
        sig.params.push(AbiParam::new(types::I64));
        sig.params.push(AbiParam::new(types::I64));
        sig.returns.push(AbiParam::new(types::I64));
        let mut func = Function::with_name_signature(ExternalName::new("add"), sig);
        let mut ctx = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut func, &mut ctx);

        let entry = b.create_block();
        b.switch_to_block(entry);
        b.append_block_params_for_function_params(entry);
        let (x, y) = (b.block_params(entry)[0], b.block_params(entry)[1]);
        let sum = b.ins().iadd(x, y);
        b.ins().return_(&[sum]);
        b.seal_all_blocks();
        b.finalize();

        assert!(func.is_filled(entry));
        assert_eq!(func.blocks[entry].insts.len(), 2);
    }
}
