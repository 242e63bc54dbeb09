//! The `FunctionBuilder`: incremental CLIF construction with SSA variables.
//!
//! Callers create blocks, position a cursor, append instructions through
//! `ins()`, and read and write `Variable`s; block parameters materialize
//! where a variable's value must flow around control flow. All blocks seal
//! together at the end: predecessor edges are recorded as branches are
//! appended, and `seal_all_blocks` resolves every pending block parameter
//! by walking those edges.

use crate::Variable;
use cot_codegen::ir::condcodes::IntCC;
use cot_codegen::ir::instructions::ValueList;
use cot_codegen::ir::{
    Block, ExtFuncData, FuncRef, Function, Inst, InstructionData, JumpTableData, MemFlags,
    Opcode, SigRef, Signature, StackSlot, StackSlotData, TrapCode, Type, Value,
};
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};

/// An edge into a block: the predecessor and the branch instruction, with
/// the occurrence index distinguishing a two-edged branch to one target.
#[derive(Clone, Copy, Debug)]
struct PredEdge {
    block: Block,
    inst: Inst,
    occurrence: usize,
}

/// Reusable state of a `FunctionBuilder`, kept separate so allocations
/// survive across functions.
#[derive(Default)]
pub struct FunctionBuilderContext {
    var_types: HashMap<Variable, Type>,
    defs: HashMap<(Block, Variable), Value>,
    preds: HashMap<Block, Vec<PredEdge>>,
    pending: VecDeque<(Block, Variable, Value)>,
}

impl FunctionBuilderContext {
    /// Create a new context.
    pub fn new() -> Self {
        Self::default()
    }

    fn clear(&mut self) {
        self.var_types.clear();
        self.defs.clear();
        self.preds.clear();
        self.pending.clear();
    }
}

/// Temporary object used to build a single CLIF function.
pub struct FunctionBuilder<'a> {
    /// The function under construction.
    pub func: &'a mut Function,
    ctx: &'a mut FunctionBuilderContext,
    position: Option<Block>,
}

impl<'a> FunctionBuilder<'a> {
    /// Start building `func` with the reusable `ctx`.
    pub fn new(func: &'a mut Function, ctx: &'a mut FunctionBuilderContext) -> Self {
        ctx.clear();
        Self {
            func,
            ctx,
            position: None,
        }
    }

    /// Create a new block.
    pub fn create_block(&mut self) -> Block {
        self.func.create_block()
    }

    /// Move the insertion cursor to `block`, adding it to the layout on
    /// first visit.
    pub fn switch_to_block(&mut self, block: Block) {
        if !self.func.layout.contains(&block) {
            self.func.layout.push(block);
        }
        self.position = Some(block);
    }

    /// The block the cursor sits in.
    pub fn current_block(&self) -> Option<Block> {
        self.position
    }

    /// Is the current block already terminated? Useful for skipping
    /// unreachable instruction tails.
    pub fn is_filled(&self) -> bool {
        self.position.map_or(true, |b| self.func.is_filled(b))
    }

    /// Append one block parameter per function signature parameter to
    /// `block`, which must be the entry.
    pub fn append_block_params_for_function_params(&mut self, block: Block) {
        debug_assert!(
            self.func.blocks[block].params.is_empty(),
            "entry params appended twice"
        );
        let types: Vec<Type> = self
            .func
            .signature
            .params
            .iter()
            .map(|p| p.value_type)
            .collect();
        for ty in types {
            self.func.append_block_param(block, ty);
        }
    }

    /// Append a typed parameter to `block` and return its value.
    pub fn append_block_param(&mut self, block: Block, ty: Type) -> Value {
        self.func.append_block_param(block, ty)
    }

    /// The parameters of `block`.
    pub fn block_params(&self, block: Block) -> &[Value] {
        self.func.block_params(block)
    }

    /// Declare a variable of type `ty`.
    pub fn declare_var(&mut self, var: Variable, ty: Type) {
        self.ctx.var_types.insert(var, ty);
    }

    /// Define `var` in the current block.
    pub fn def_var(&mut self, var: Variable, val: Value) {
        let block = self.position.expect("def_var without a current block");
        self.ctx.defs.insert((block, var), val);
    }

    /// The current value of `var`, creating a pending block parameter when
    /// control flow must carry it here.
    pub fn use_var(&mut self, var: Variable) -> Value {
        let block = self.position.expect("use_var without a current block");
        self.read_var(block, var)
    }

    fn read_var(&mut self, block: Block, var: Variable) -> Value {
        if let Some(&v) = self.ctx.defs.get(&(block, var)) {
            return v;
        }
        let ty = *self
            .ctx
            .var_types
            .get(&var)
            .unwrap_or_else(|| panic!("use of undeclared variable {}", var));
        let param = self.func.append_block_param(block, ty);
        self.ctx.defs.insert((block, var), param);
        self.ctx.pending.push_back((block, var, param));
        param
    }

    /// Import a signature for indirect calls.
    pub fn import_signature(&mut self, sig: Signature) -> SigRef {
        self.func.dfg.import_signature(sig)
    }

    /// Import an external function reference.
    pub fn import_function(&mut self, data: ExtFuncData) -> FuncRef {
        self.func.dfg.import_function(data)
    }

    /// Declare a sized stack slot.
    pub fn create_stack_slot(&mut self, data: StackSlotData) -> StackSlot {
        self.func.create_stack_slot(data)
    }

    /// The result value of `inst`; panics if the instruction has none.
    pub fn single_result(&self, inst: Inst) -> Value {
        self.func
            .dfg
            .inst_result(inst)
            .unwrap_or_else(|| panic!("instruction has no result"))
    }

    /// Get an instruction-appending interface.
    pub fn ins<'short>(&'short mut self) -> FuncInstBuilder<'short, 'a> {
        FuncInstBuilder { builder: self }
    }

    /// Seal every block: resolve the pending block parameters by chasing
    /// each predecessor edge, appending the corresponding branch arguments.
    pub fn seal_all_blocks(&mut self) {
        while let Some((block, var, _param)) = self.ctx.pending.pop_front() {
            let edges = self
                .ctx
                .preds
                .get(&block)
                .cloned()
                .unwrap_or_else(|| panic!("{} has a pending parameter but no predecessors", block));
            for edge in edges {
                let val = self.read_var(edge.block, var);
                let data = &mut self.func.dfg.insts[edge.inst];
                let args = data
                    .branch_args_mut(block, edge.occurrence)
                    .expect("recorded edge no longer targets its block");
                args.push(val);
            }
        }
    }

    /// Finish the function. All blocks must be terminated and sealed.
    pub fn finalize(self) {
        debug_assert!(self.ctx.pending.is_empty(), "finalize before sealing");
        if cfg!(debug_assertions) {
            for &block in &self.func.layout {
                debug_assert!(
                    self.func.is_filled(block),
                    "finalize with unterminated {}",
                    block
                );
            }
        }
        log::trace!("built function:\n{}", self.func.display());
    }

    fn insert_inst(&mut self, data: InstructionData, result_ty: Option<Type>) -> Inst {
        let block = self.position.expect("no current block");
        debug_assert!(
            !self.func.is_filled(block),
            "inserting {} into terminated {}",
            data.opcode(),
            block
        );
        let branch_targets: SmallVec<[Block; 2]> = data.branch_destinations();
        let inst = self.func.append_inst(block, data, result_ty);
        // Record predecessor edges for SSA resolution.
        let mut seen: HashMap<Block, usize> = HashMap::new();
        for target in branch_targets {
            let occurrence = *seen.entry(target).or_insert(0);
            seen.insert(target, occurrence + 1);
            self.ctx.preds.entry(target).or_default().push(PredEdge {
                block,
                inst,
                occurrence,
            });
        }
        inst
    }

    fn value_type(&self, v: Value) -> Type {
        self.func.dfg.value_type(v)
    }
}

/// An instruction builder inserting at the cursor of a `FunctionBuilder`.
pub struct FuncInstBuilder<'short, 'long> {
    builder: &'short mut FunctionBuilder<'long>,
}

impl<'short, 'long> FuncInstBuilder<'short, 'long> {
    fn binary(self, opcode: Opcode, a: Value, b: Value) -> Value {
        let ty = self.builder.value_type(a);
        let inst = self.builder.insert_inst(
            InstructionData::Binary {
                opcode,
                args: [a, b],
            },
            Some(ty),
        );
        self.builder.single_result(inst)
    }

    /// Integer constant of type `ty`.
    pub fn iconst(self, ty: Type, imm: i64) -> Value {
        let inst = self.builder.insert_inst(
            InstructionData::UnaryImm {
                opcode: Opcode::Iconst,
                imm,
            },
            Some(ty),
        );
        self.builder.single_result(inst)
    }

    /// Wrapping addition.
    pub fn iadd(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Iadd, a, b)
    }

    /// Wrapping subtraction.
    pub fn isub(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Isub, a, b)
    }

    /// Wrapping multiplication.
    pub fn imul(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Imul, a, b)
    }

    /// Signed division.
    pub fn sdiv(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Sdiv, a, b)
    }

    /// Unsigned division.
    pub fn udiv(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Udiv, a, b)
    }

    /// Signed remainder.
    pub fn srem(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Srem, a, b)
    }

    /// Unsigned remainder.
    pub fn urem(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Urem, a, b)
    }

    /// Bitwise and.
    pub fn band(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Band, a, b)
    }

    /// Bitwise or.
    pub fn bor(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Bor, a, b)
    }

    /// Bitwise xor.
    pub fn bxor(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Bxor, a, b)
    }

    /// Bitwise not.
    pub fn bnot(self, a: Value) -> Value {
        let ty = self.builder.value_type(a);
        let inst = self.builder.insert_inst(
            InstructionData::Unary {
                opcode: Opcode::Bnot,
                arg: a,
            },
            Some(ty),
        );
        self.builder.single_result(inst)
    }

    /// Shift left.
    pub fn ishl(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Ishl, a, b)
    }

    /// Arithmetic shift right.
    pub fn sshr(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Sshr, a, b)
    }

    /// Logical shift right.
    pub fn ushr(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Ushr, a, b)
    }

    /// Rotate left.
    pub fn rotl(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Rotl, a, b)
    }

    /// Rotate right.
    pub fn rotr(self, a: Value, b: Value) -> Value {
        self.binary(Opcode::Rotr, a, b)
    }

    /// Integer comparison; the result is an `i8` holding 0 or 1.
    pub fn icmp(self, cond: IntCC, a: Value, b: Value) -> Value {
        let inst = self.builder.insert_inst(
            InstructionData::IntCompare {
                opcode: Opcode::Icmp,
                args: [a, b],
                cond,
            },
            Some(cot_codegen::ir::types::I8),
        );
        self.builder.single_result(inst)
    }

    /// Compare against a constant.
    pub fn icmp_imm(self, cond: IntCC, a: Value, imm: i64) -> Value {
        let ty = self.builder.value_type(a);
        let b = self.builder.ins().iconst(ty, imm);
        self.builder.ins().icmp(cond, a, b)
    }

    /// Add a constant.
    pub fn iadd_imm(self, a: Value, imm: i64) -> Value {
        let ty = self.builder.value_type(a);
        let b = self.builder.ins().iconst(ty, imm);
        self.builder.ins().iadd(a, b)
    }

    /// And with a constant.
    pub fn band_imm(self, a: Value, imm: i64) -> Value {
        let ty = self.builder.value_type(a);
        let b = self.builder.ins().iconst(ty, imm);
        self.builder.ins().band(a, b)
    }

    /// Or with a constant.
    pub fn bor_imm(self, a: Value, imm: i64) -> Value {
        let ty = self.builder.value_type(a);
        let b = self.builder.ins().iconst(ty, imm);
        self.builder.ins().bor(a, b)
    }

    /// Shift left by a constant.
    pub fn ishl_imm(self, a: Value, imm: i64) -> Value {
        let ty = self.builder.value_type(a);
        let b = self.builder.ins().iconst(ty, imm);
        self.builder.ins().ishl(a, b)
    }

    /// Logical shift right by a constant.
    pub fn ushr_imm(self, a: Value, imm: i64) -> Value {
        let ty = self.builder.value_type(a);
        let b = self.builder.ins().iconst(ty, imm);
        self.builder.ins().ushr(a, b)
    }

    /// `select c, x, y` picks `x` when `c` is non-zero.
    pub fn select(self, c: Value, x: Value, y: Value) -> Value {
        let ty = self.builder.value_type(x);
        let inst = self.builder.insert_inst(
            InstructionData::Ternary {
                opcode: Opcode::Select,
                args: [c, x, y],
            },
            Some(ty),
        );
        self.builder.single_result(inst)
    }

    /// Zero-extend to `ty`.
    pub fn uextend(self, ty: Type, a: Value) -> Value {
        let inst = self.builder.insert_inst(
            InstructionData::Unary {
                opcode: Opcode::Uextend,
                arg: a,
            },
            Some(ty),
        );
        self.builder.single_result(inst)
    }

    /// Sign-extend to `ty`.
    pub fn sextend(self, ty: Type, a: Value) -> Value {
        let inst = self.builder.insert_inst(
            InstructionData::Unary {
                opcode: Opcode::Sextend,
                arg: a,
            },
            Some(ty),
        );
        self.builder.single_result(inst)
    }

    /// Truncate to `ty`.
    pub fn ireduce(self, ty: Type, a: Value) -> Value {
        let inst = self.builder.insert_inst(
            InstructionData::Unary {
                opcode: Opcode::Ireduce,
                arg: a,
            },
            Some(ty),
        );
        self.builder.single_result(inst)
    }

    /// Load `ty` from `addr + offset`.
    pub fn load(self, ty: Type, flags: MemFlags, addr: Value, offset: i32) -> Value {
        let inst = self.builder.insert_inst(
            InstructionData::LoadData {
                opcode: Opcode::Load,
                arg: addr,
                flags,
                offset,
            },
            Some(ty),
        );
        self.builder.single_result(inst)
    }

    /// Store `value` to `addr + offset`.
    pub fn store(self, flags: MemFlags, value: Value, addr: Value, offset: i32) -> Inst {
        self.builder.insert_inst(
            InstructionData::StoreData {
                opcode: Opcode::Store,
                args: [value, addr],
                flags,
                offset,
            },
            None,
        )
    }

    /// Load `ty` from a stack slot.
    pub fn stack_load(self, ty: Type, slot: StackSlot, offset: i32) -> Value {
        let inst = self.builder.insert_inst(
            InstructionData::StackLoad {
                opcode: Opcode::StackLoad,
                slot,
                offset,
            },
            Some(ty),
        );
        self.builder.single_result(inst)
    }

    /// Store `value` to a stack slot.
    pub fn stack_store(self, value: Value, slot: StackSlot, offset: i32) -> Inst {
        self.builder.insert_inst(
            InstructionData::StackStore {
                opcode: Opcode::StackStore,
                arg: value,
                slot,
                offset,
            },
            None,
        )
    }

    /// The address of a stack slot.
    pub fn stack_addr(self, slot: StackSlot, offset: i32) -> Value {
        let inst = self.builder.insert_inst(
            InstructionData::StackAddr {
                opcode: Opcode::StackAddr,
                slot,
                offset,
            },
            Some(cot_codegen::ir::types::I64),
        );
        self.builder.single_result(inst)
    }

    /// The address of an external function.
    pub fn func_addr(self, func_ref: FuncRef) -> Value {
        let inst = self.builder.insert_inst(
            InstructionData::FuncAddr {
                opcode: Opcode::FuncAddr,
                func_ref,
            },
            Some(cot_codegen::ir::types::I64),
        );
        self.builder.single_result(inst)
    }

    /// Direct call.
    pub fn call(self, func_ref: FuncRef, args: &[Value]) -> Inst {
        let sig = self.builder.func.dfg.ext_funcs[func_ref].signature;
        let result_ty = self.builder.func.dfg.signatures[sig]
            .returns
            .first()
            .map(|r| r.value_type);
        self.builder.insert_inst(
            InstructionData::Call {
                opcode: Opcode::Call,
                func_ref,
                args: ValueList::from_slice(args),
            },
            result_ty,
        )
    }

    /// Indirect call through `callee`.
    pub fn call_indirect(self, sig_ref: SigRef, callee: Value, args: &[Value]) -> Inst {
        let result_ty = self.builder.func.dfg.signatures[sig_ref]
            .returns
            .first()
            .map(|r| r.value_type);
        let mut all: ValueList = ValueList::from_slice(&[callee]);
        all.extend_from_slice(args);
        self.builder.insert_inst(
            InstructionData::CallIndirect {
                opcode: Opcode::CallIndirect,
                sig_ref,
                args: all,
            },
            result_ty,
        )
    }

    /// Unconditional jump.
    pub fn jump(self, destination: Block, args: &[Value]) -> Inst {
        self.builder.insert_inst(
            InstructionData::Jump {
                opcode: Opcode::Jump,
                destination,
                args: ValueList::from_slice(args),
            },
            None,
        )
    }

    /// Conditional branch.
    pub fn brif(
        self,
        c: Value,
        then_dest: Block,
        then_args: &[Value],
        else_dest: Block,
        else_args: &[Value],
    ) -> Inst {
        self.builder.insert_inst(
            InstructionData::Brif {
                opcode: Opcode::Brif,
                arg: c,
                then_dest,
                then_args: ValueList::from_slice(then_args),
                else_dest,
                else_args: ValueList::from_slice(else_args),
            },
            None,
        )
    }

    /// Indexed branch through a jump table.
    pub fn br_table(self, index: Value, table: JumpTableData) -> Inst {
        self.builder.insert_inst(
            InstructionData::BranchTable {
                opcode: Opcode::BrTable,
                arg: index,
                table,
            },
            None,
        )
    }

    /// Return from the function.
    pub fn return_(self, args: &[Value]) -> Inst {
        self.builder.insert_inst(
            InstructionData::MultiAry {
                opcode: Opcode::Return,
                args: ValueList::from_slice(args),
            },
            None,
        )
    }

    /// Unconditional trap.
    pub fn trap(self, code: TrapCode) -> Inst {
        self.builder
            .insert_inst(InstructionData::Trap {
                opcode: Opcode::Trap,
                code,
            }, None)
    }
}
