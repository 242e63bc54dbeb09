//! Translation from WebAssembly operators to CLIF.
//!
//! One operator at a time: the value stack mirrors the wasm operand stack,
//! the control stack tracks nested regions, and unreachable code updates
//! only the bookkeeping until a matching `end` restores reachability.

use crate::state::{ControlStackFrame, FuncTranslationState};
use crate::{WasmError, WasmResult};
use cot_codegen::ir::condcodes::IntCC;
use cot_codegen::ir::{types, JumpTableData, TrapCode, Type};
use cot_frontend::{FunctionBuilder, Variable};
use wasmparser::{BlockType, Operator, ValType};

/// WebAssembly to CLIF translator: translates one function body at a time.
pub struct FuncTranslator {
    state: FuncTranslationState,
}

impl FuncTranslator {
    /// Create a new translator.
    pub fn new() -> Self {
        Self {
            state: FuncTranslationState::new(),
        }
    }

    /// Translate a function body given as a sequence of operators
    /// (including the final `end`). The builder's function must carry the
    /// signature; `locals` lists the declared (non-parameter) locals.
    pub fn translate(
        &mut self,
        operators: &[Operator],
        locals: &[ValType],
        builder: &mut FunctionBuilder,
    ) -> WasmResult<()> {
        self.state.clear();

        let entry = builder.create_block();
        builder.switch_to_block(entry);
        builder.append_block_params_for_function_params(entry);

        // The first locals are the parameters.
        let param_values: Vec<_> = builder.block_params(entry).to_vec();
        let param_types: Vec<Type> = builder
            .func
            .signature
            .params
            .iter()
            .map(|p| p.value_type)
            .collect();
        let mut next_local = 0;
        for (value, ty) in param_values.into_iter().zip(param_types) {
            let var = Variable::new(next_local);
            next_local += 1;
            builder.declare_var(var, ty);
            builder.def_var(var, value);
        }
        for &local_ty in locals {
            let ty = valtype(local_ty)?;
            let var = Variable::new(next_local);
            next_local += 1;
            builder.declare_var(var, ty);
            let zero = builder.ins().iconst(ty, 0);
            builder.def_var(var, zero);
        }
        let num_locals = next_local;

        // The outermost frame: its destination holds the return.
        let return_types: Vec<Type> = builder
            .func
            .signature
            .returns
            .iter()
            .map(|r| r.value_type)
            .collect();
        let exit_block = builder.create_block();
        for &ty in &return_types {
            builder.append_block_param(exit_block, ty);
        }
        self.state.push_block(exit_block, return_types.len());

        for op in operators {
            translate_operator(op, builder, &mut self.state, num_locals)?;
        }
        if !self.state.control_stack.is_empty() {
            return Err(WasmError::MissingEnd);
        }

        // The final `end` left us in the exit block; return its parameters.
        if self.state.reachable {
            let results = builder.block_params(builder.current_block().expect("exit block"))
                .to_vec();
            builder.ins().return_(&results);
        }
        self.state.stack.clear();
        builder.seal_all_blocks();
        Ok(())
    }
}

impl Default for FuncTranslator {
    fn default() -> Self {
        Self::new()
    }
}

fn valtype(ty: ValType) -> WasmResult<Type> {
    match ty {
        ValType::I32 => Ok(types::I32),
        ValType::I64 => Ok(types::I64),
        other => Err(WasmError::Unsupported(format!("type {:?}", other))),
    }
}

fn blocktype_results(bt: &BlockType) -> WasmResult<Vec<Type>> {
    match bt {
        BlockType::Empty => Ok(Vec::new()),
        BlockType::Type(ty) => Ok(vec![valtype(*ty)?]),
        BlockType::FuncType(_) => Err(WasmError::Unsupported(
            "multi-value block types".to_string(),
        )),
    }
}

fn local_var(index: u32, num_locals: usize) -> WasmResult<Variable> {
    if (index as usize) < num_locals {
        Ok(Variable::new(index as usize))
    } else {
        Err(WasmError::BadLocal(index))
    }
}

/// Translate one operator, dispatching to the reduced unreachable-code
/// state machine when the current point cannot be reached.
pub fn translate_operator(
    op: &Operator,
    builder: &mut FunctionBuilder,
    state: &mut FuncTranslationState,
    num_locals: usize,
) -> WasmResult<()> {
    if !state.reachable {
        return translate_unreachable_operator(op, builder, state);
    }

    match op {
        Operator::Nop => {}
        Operator::Unreachable => {
            builder.ins().trap(TrapCode::UnreachableCodeReached);
            state.reachable = false;
        }

        // Locals.
        Operator::LocalGet { local_index } => {
            let var = local_var(*local_index, num_locals)?;
            let val = builder.use_var(var);
            state.push1(val);
        }
        Operator::LocalSet { local_index } => {
            let var = local_var(*local_index, num_locals)?;
            let val = state.pop1()?;
            builder.def_var(var, val);
        }
        Operator::LocalTee { local_index } => {
            let var = local_var(*local_index, num_locals)?;
            let val = state.pop1()?;
            builder.def_var(var, val);
            state.push1(val);
        }

        // Constants.
        Operator::I32Const { value } => {
            state.push1(builder.ins().iconst(types::I32, *value as i64));
        }
        Operator::I64Const { value } => {
            state.push1(builder.ins().iconst(types::I64, *value));
        }

        // Arithmetic.
        Operator::I32Add | Operator::I64Add => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().iadd(a, b));
        }
        Operator::I32Sub | Operator::I64Sub => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().isub(a, b));
        }
        Operator::I32Mul | Operator::I64Mul => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().imul(a, b));
        }
        Operator::I32DivS | Operator::I64DivS => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().sdiv(a, b));
        }
        Operator::I32DivU | Operator::I64DivU => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().udiv(a, b));
        }
        Operator::I32RemS | Operator::I64RemS => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().srem(a, b));
        }
        Operator::I32RemU | Operator::I64RemU => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().urem(a, b));
        }
        Operator::I32And | Operator::I64And => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().band(a, b));
        }
        Operator::I32Or | Operator::I64Or => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().bor(a, b));
        }
        Operator::I32Xor | Operator::I64Xor => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().bxor(a, b));
        }
        Operator::I32Shl | Operator::I64Shl => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().ishl(a, b));
        }
        Operator::I32ShrS | Operator::I64ShrS => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().sshr(a, b));
        }
        Operator::I32ShrU | Operator::I64ShrU => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().ushr(a, b));
        }
        Operator::I32Rotl | Operator::I64Rotl => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().rotl(a, b));
        }
        Operator::I32Rotr | Operator::I64Rotr => {
            let (a, b) = state.pop2()?;
            state.push1(builder.ins().rotr(a, b));
        }

        // Comparisons produce an i32 0/1, per the wasm convention.
        Operator::I32Eqz | Operator::I64Eqz => {
            let a = state.pop1()?;
            let cmp = builder.ins().icmp_imm(IntCC::Equal, a, 0);
            state.push1(builder.ins().uextend(types::I32, cmp));
        }
        Operator::I32Eq | Operator::I64Eq => translate_icmp(IntCC::Equal, builder, state)?,
        Operator::I32Ne | Operator::I64Ne => translate_icmp(IntCC::NotEqual, builder, state)?,
        Operator::I32LtS | Operator::I64LtS => {
            translate_icmp(IntCC::SignedLessThan, builder, state)?
        }
        Operator::I32LtU | Operator::I64LtU => {
            translate_icmp(IntCC::UnsignedLessThan, builder, state)?
        }
        Operator::I32GtS | Operator::I64GtS => {
            translate_icmp(IntCC::SignedGreaterThan, builder, state)?
        }
        Operator::I32GtU | Operator::I64GtU => {
            translate_icmp(IntCC::UnsignedGreaterThan, builder, state)?
        }
        Operator::I32LeS | Operator::I64LeS => {
            translate_icmp(IntCC::SignedLessThanOrEqual, builder, state)?
        }
        Operator::I32LeU | Operator::I64LeU => {
            translate_icmp(IntCC::UnsignedLessThanOrEqual, builder, state)?
        }
        Operator::I32GeS | Operator::I64GeS => {
            translate_icmp(IntCC::SignedGreaterThanOrEqual, builder, state)?
        }
        Operator::I32GeU | Operator::I64GeU => {
            translate_icmp(IntCC::UnsignedGreaterThanOrEqual, builder, state)?
        }

        // Conversions.
        Operator::I32WrapI64 => {
            let a = state.pop1()?;
            state.push1(builder.ins().ireduce(types::I32, a));
        }
        Operator::I64ExtendI32S => {
            let a = state.pop1()?;
            state.push1(builder.ins().sextend(types::I64, a));
        }
        Operator::I64ExtendI32U => {
            let a = state.pop1()?;
            state.push1(builder.ins().uextend(types::I64, a));
        }

        // Stack manipulation.
        Operator::Drop => {
            state.pop1()?;
        }
        Operator::Select => {
            let (v1, v2, c) = state.pop3()?;
            state.push1(builder.ins().select(c, v1, v2));
        }

        // Control flow.
        Operator::Block { blockty } => {
            let results = blocktype_results(blockty)?;
            let destination = builder.create_block();
            for &ty in &results {
                builder.append_block_param(destination, ty);
            }
            state.push_block(destination, results.len());
        }
        Operator::Loop { blockty } => {
            let results = blocktype_results(blockty)?;
            let header = builder.create_block();
            let destination = builder.create_block();
            for &ty in &results {
                builder.append_block_param(destination, ty);
            }
            builder.ins().jump(header, &[]);
            builder.switch_to_block(header);
            state.push_loop(header, destination, results.len());
        }
        Operator::If { blockty } => {
            let results = blocktype_results(blockty)?;
            let cond = state.pop1()?;
            let destination = builder.create_block();
            for &ty in &results {
                builder.append_block_param(destination, ty);
            }
            let then_block = builder.create_block();
            let else_block = builder.create_block();
            builder.ins().brif(cond, then_block, &[], else_block, &[]);
            builder.switch_to_block(then_block);
            state.push_if(destination, else_block, results.len(), true);
        }
        Operator::Else => {
            let (destination, else_block, num_returns) = {
                let frame = state
                    .control_stack
                    .last_mut()
                    .ok_or(WasmError::MissingEnd)?;
                match frame {
                    ControlStackFrame::If {
                        destination,
                        else_block,
                        num_return_values,
                        ref mut consequent_ends_reachable,
                        ..
                    } => {
                        *consequent_ends_reachable = Some(true);
                        (*destination, *else_block, *num_return_values)
                    }
                    _ => return Err(WasmError::TypeMismatch("else outside if".to_string())),
                }
            };
            let results = state.peekn(num_returns)?.to_vec();
            builder.ins().jump(destination, &results);
            state.popn(num_returns)?;
            let frame = state.control_stack.last().unwrap();
            state.stack.truncate(frame.original_stack_size());
            builder.switch_to_block(else_block);
        }
        Operator::End => translate_end(builder, state)?,
        Operator::Br { relative_depth } => {
            translate_br(*relative_depth, builder, state)?;
            state.reachable = false;
        }
        Operator::BrIf { relative_depth } => {
            let cond = state.pop1()?;
            let depth = *relative_depth as usize;
            let stack_len = state.control_stack.len();
            if depth >= stack_len {
                return Err(WasmError::MissingEnd);
            }
            let frame = &mut state.control_stack[stack_len - 1 - depth];
            frame.set_branched_to_exit();
            let dest = frame.br_destination();
            let num_args = frame.num_branch_args();
            let args = state.peekn(num_args)?.to_vec();
            let fallthrough = builder.create_block();
            builder.ins().brif(cond, dest, &args, fallthrough, &[]);
            builder.switch_to_block(fallthrough);
        }
        Operator::BrTable { targets } => {
            let index = state.pop1()?;
            let mut table = Vec::new();
            for depth in targets.targets() {
                let depth = depth.map_err(|e| WasmError::Unsupported(e.to_string()))?;
                table.push(branch_target(depth, state)?);
            }
            let default = branch_target(targets.default(), state)?;
            builder.ins().br_table(index, JumpTableData::new(default, table));
            state.reachable = false;
        }
        Operator::Return => {
            let frame = &state.control_stack[0];
            let num_returns = frame.num_return_values();
            let results = state.peekn(num_returns)?.to_vec();
            builder.ins().return_(&results);
            state.popn(num_returns)?;
            state.reachable = false;
        }

        other => {
            return Err(WasmError::Unsupported(format!("operator {:?}", other)));
        }
    }
    Ok(())
}

fn translate_icmp(
    cc: IntCC,
    builder: &mut FunctionBuilder,
    state: &mut FuncTranslationState,
) -> WasmResult<()> {
    let (a, b) = state.pop2()?;
    let cmp = builder.ins().icmp(cc, a, b);
    state.push1(builder.ins().uextend(types::I32, cmp));
    Ok(())
}

/// Resolve a branch target frame: mark it branched-to and check that it
/// carries no values (jump tables have no argument vectors).
fn branch_target(
    depth: u32,
    state: &mut FuncTranslationState,
) -> WasmResult<cot_codegen::ir::Block> {
    let stack_len = state.control_stack.len();
    if depth as usize >= stack_len {
        return Err(WasmError::MissingEnd);
    }
    let frame = &mut state.control_stack[stack_len - 1 - depth as usize];
    if frame.num_branch_args() != 0 {
        return Err(WasmError::Unsupported(
            "br_table to a frame with results".to_string(),
        ));
    }
    frame.set_branched_to_exit();
    Ok(frame.br_destination())
}

fn translate_br(
    relative_depth: u32,
    builder: &mut FunctionBuilder,
    state: &mut FuncTranslationState,
) -> WasmResult<()> {
    let depth = relative_depth as usize;
    let stack_len = state.control_stack.len();
    if depth >= stack_len {
        return Err(WasmError::MissingEnd);
    }
    let frame = &mut state.control_stack[stack_len - 1 - depth];
    frame.set_branched_to_exit();
    let dest = frame.br_destination();
    let num_args = frame.num_branch_args();
    let args = state.peekn(num_args)?.to_vec();
    builder.ins().jump(dest, &args);
    state.popn(num_args)?;
    Ok(())
}

fn translate_end(builder: &mut FunctionBuilder, state: &mut FuncTranslationState) -> WasmResult<()> {
    let frame = state.control_stack.pop().ok_or(WasmError::MissingEnd)?;
    let num_returns = frame.num_return_values();

    // The stack must hold exactly the region's results above its entry
    // height.
    if state.stack.len() != frame.original_stack_size() + num_returns {
        return Err(WasmError::TypeMismatch(format!(
            "end leaves {} values, expected {}",
            state.stack.len() - frame.original_stack_size().min(state.stack.len()),
            num_returns
        )));
    }

    let destination = frame.following_code();
    let results = state.peekn(num_returns)?.to_vec();
    builder.ins().jump(destination, &results);

    // An `if` without an `else` routes its alternative straight to the
    // continuation; a valid no-else `if` has no results.
    if let ControlStackFrame::If {
        else_block,
        consequent_ends_reachable: None,
        ..
    } = frame
    {
        builder.switch_to_block(else_block);
        builder.ins().jump(destination, &[]);
    }

    state.popn(num_returns)?;
    state.stack.truncate(frame.original_stack_size());
    builder.switch_to_block(destination);
    for &param in builder.block_params(destination).to_vec().iter() {
        state.push1(param);
    }
    Ok(())
}

/// The reduced state machine for skipping unreachable code: only the
/// control nesting is maintained, and a frame whose head was reachable can
/// restore reachability at its `else` or `end`.
fn translate_unreachable_operator(
    op: &Operator,
    builder: &mut FunctionBuilder,
    state: &mut FuncTranslationState,
) -> WasmResult<()> {
    debug_assert!(!state.reachable);
    match op {
        Operator::Block { .. } | Operator::Loop { .. } => {
            // A dummy frame; nothing inside can become reachable.
            let destination = builder.create_block();
            state.push_block(destination, 0);
        }
        Operator::If { .. } => {
            let destination = builder.create_block();
            let else_block = builder.create_block();
            state.push_if(destination, else_block, 0, false);
        }
        Operator::Else => {
            if let Some(ControlStackFrame::If {
                else_block,
                head_is_reachable: true,
                ref mut consequent_ends_reachable,
                original_stack_size,
                ..
            }) = state.control_stack.last_mut()
            {
                // The consequent went unreachable, but the alternative
                // begins from the reachable head.
                *consequent_ends_reachable = Some(false);
                let else_block = *else_block;
                let original = *original_stack_size;
                state.stack.truncate(original);
                builder.switch_to_block(else_block);
                state.reachable = true;
            }
        }
        Operator::End => {
            let frame = state.control_stack.pop().ok_or(WasmError::MissingEnd)?;
            state.stack.truncate(frame.original_stack_size());

            let becomes_reachable = frame.head_is_reachable()
                && (frame.exit_is_branched_to()
                    || matches!(
                        frame,
                        ControlStackFrame::If {
                            consequent_ends_reachable: None,
                            ..
                        }
                    ));
            if becomes_reachable {
                let destination = frame.following_code();
                // An if without an else falls through its alternative.
                if let ControlStackFrame::If {
                    else_block,
                    consequent_ends_reachable: None,
                    ..
                } = frame
                {
                    builder.switch_to_block(else_block);
                    builder.ins().jump(destination, &[]);
                }
                builder.switch_to_block(destination);
                for &param in builder.block_params(destination).to_vec().iter() {
                    state.push1(param);
                }
                state.reachable = true;
            }
        }
        _ => {
            // Every other operator in unreachable code is ignored.
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cot_codegen::ir::{AbiParam, CallConv, ExternalName, Function, Signature};
    use cot_frontend::FunctionBuilderContext;

    fn make_func(params: &[Type], returns: &[Type]) -> Function {
        let mut sig = Signature::new(CallConv::SystemV);
        for &p in params {
            sig.params.push(AbiParam::new(p));
        }
        for &r in returns {
            sig.returns.push(AbiParam::new(r));
        }
        Function::with_name_signature(ExternalName::new("test"), sig)
    }

    fn translate(
        func: &mut Function,
        ops: &[Operator],
        locals: &[ValType],
    ) -> WasmResult<()> {
        let mut ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(func, &mut ctx);
        let mut tr = FuncTranslator::new();
        tr.translate(ops, locals, &mut builder)?;
        builder.finalize();
        Ok(())
    }

    #[test]
    fn add_two_params() {
        let mut func = make_func(&[types::I64, types::I64], &[types::I64]);
        translate(
            &mut func,
            &[
                Operator::LocalGet { local_index: 0 },
                Operator::LocalGet { local_index: 1 },
                Operator::I64Add,
                Operator::End,
            ],
            &[],
        )
        .unwrap();
        let text = format!("{}", func.display());
        assert!(text.contains("iadd"), "{}", text);
        assert!(text.contains("return"), "{}", text);
    }

    #[test]
    fn if_else_produces_merge_params() {
        // (param i32) (result i32): if n > 1 { 99 } else { 0 }
        let mut func = make_func(&[types::I32], &[types::I32]);
        translate(
            &mut func,
            &[
                Operator::LocalGet { local_index: 0 },
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
            ],
            &[],
        )
        .unwrap();
        let text = format!("{}", func.display());
        assert!(text.contains("brif"), "{}", text);
    }

    #[test]
    fn loop_counts_down() {
        // (param i64) (result i64): local sum; loop { sum += n; n -= 1;
        // br_if 0 if n != 0 }; sum
        let mut func = make_func(&[types::I64], &[types::I64]);
        translate(
            &mut func,
            &[
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
            ],
            &[ValType::I64],
        )
        .unwrap();
    }

    #[test]
    fn unreachable_code_is_skipped() {
        let mut func = make_func(&[], &[types::I32]);
        translate(
            &mut func,
            &[
                Operator::I32Const { value: 7 },
                Operator::Return,
                // Dead code below, still structurally valid.
                Operator::I32Const { value: 1 },
                Operator::I32Const { value: 2 },
                Operator::I32Add,
                Operator::Drop,
                Operator::End,
            ],
            &[],
        )
        .unwrap();
    }

    #[test]
    fn stack_underflow_is_reported() {
        let mut func = make_func(&[], &[]);
        let err = translate(&mut func, &[Operator::I32Add, Operator::End], &[]);
        assert!(matches!(err, Err(WasmError::StackUnderflow)));
    }

    #[test]
    fn missing_end_is_reported() {
        let mut func = make_func(&[], &[]);
        let err = translate(
            &mut func,
            &[Operator::Block {
                blockty: BlockType::Empty,
            }],
            &[],
        );
        assert!(matches!(err, Err(WasmError::MissingEnd)));
    }

    #[test]
    fn bad_local_is_reported() {
        let mut func = make_func(&[], &[]);
        let err = translate(
            &mut func,
            &[Operator::LocalGet { local_index: 3 }, Operator::End],
            &[],
        );
        assert!(matches!(err, Err(WasmError::BadLocal(3))));
    }

}
