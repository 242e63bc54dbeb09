//! Bridge from CLIF into low SSA.
//!
//! CLIF built through the function builder (Wasm bodies, runtime support
//! functions) joins user code here: block parameters become phis, branch
//! arguments become phi inputs, and stack slots become locals. From this
//! point on, the pre-lowering passes and the allocator treat every function
//! alike.

use crate::ir::{self, ArgumentPurpose, InstructionData, Opcode};
use crate::ssa::{
    Aux, BlockId, Func, FuncDecl, FuncId, FuncTable, LocalData, SsaOp, TypeId, TypeRegistry,
    ValueData, ValueId,
};
use smallvec::{smallvec, SmallVec};
use std::collections::HashMap;

fn map_ty(types: &TypeRegistry, ty: ir::Type) -> TypeId {
    match ty {
        ir::types::I8 => types.i8(),
        ir::types::I16 => types.i16(),
        ir::types::I32 => types.i32(),
        ir::types::I64 => types.i64(),
        ir::types::F32 => types.f32(),
        ir::types::F64 => types.f64(),
        other => panic!("unmapped CLIF type {}", other),
    }
}

/// Convert a finished CLIF function into low SSA.
pub fn func_from_clif(
    clif: &ir::Function,
    types: &mut TypeRegistry,
    funcs: &mut FuncTable,
) -> Func {
    let mut func = Func::new(clif.name.as_str());
    for p in &clif.signature.params {
        func.params.push(match p.purpose {
            ArgumentPurpose::Normal => map_ty(types, p.value_type),
            _ => types.ptr(),
        });
    }
    for r in &clif.signature.returns {
        func.returns.push(map_ty(types, r.value_type));
    }

    // Stack slots become locals; a slot's type is a struct wide enough to
    // cover it.
    let mut slot_local: HashMap<ir::StackSlot, usize> = HashMap::new();
    for (slot, data) in clif.stack_slots.iter() {
        let words = (data.size as usize + 7) / 8;
        let i64t = types.i64();
        let ty = types.make_struct(vec![i64t; words.max(1)]);
        slot_local.insert(slot, func.locals.len());
        func.locals.push(LocalData { ty });
    }

    // External functions land in the function table.
    let mut func_ids: HashMap<ir::FuncRef, FuncId> = HashMap::new();
    for (fref, ext) in clif.dfg.ext_funcs.iter() {
        let sig = &clif.dfg.signatures[ext.signature];
        let decl = FuncDecl {
            name: ext.name.as_str().to_string(),
            params: sig
                .params
                .iter()
                .map(|p| match p.purpose {
                    ArgumentPurpose::Normal => map_ty(types, p.value_type),
                    _ => types.ptr(),
                })
                .collect(),
            returns: sig
                .returns
                .iter()
                .map(|r| map_ty(types, r.value_type))
                .collect(),
            external: !ext.colocated,
        };
        func_ids.insert(fref, funcs.declare(decl));
    }

    // Blocks in layout order; block zero is the entry.
    let mut block_map: HashMap<ir::Block, BlockId> = HashMap::new();
    for &block in &clif.layout {
        block_map.insert(block, func.create_block());
    }

    // Block parameters: arguments at the entry, phis everywhere else. Phi
    // argument vectors start empty and fill as branches are translated.
    let mut value_map: HashMap<ir::Value, ValueId> = HashMap::new();
    for (i, &block) in clif.layout.iter().enumerate() {
        let ssa_block = block_map[&block];
        for (num, &param) in clif.blocks[block].params.iter().enumerate() {
            let ty = map_ty(types, clif.dfg.value_type(param));
            let data = if i == 0 {
                let purpose = clif
                    .signature
                    .params
                    .get(num)
                    .map(|p| p.purpose)
                    .unwrap_or(ArgumentPurpose::Normal);
                if purpose == ArgumentPurpose::VMContext {
                    func.vmctx_param = true;
                    ValueData::new(SsaOp::PinnedReg, types.ptr(), [])
                } else {
                    ValueData::new(SsaOp::Arg, ty, []).with_aux_int(num as i64)
                }
            } else {
                ValueData::new(SsaOp::Phi, ty, [])
            };
            let v = func.append(ssa_block, data);
            value_map.insert(param, v);
        }
    }

    let mut tr = Translator {
        clif,
        types,
        func,
        block_map,
        value_map,
        slot_local,
        func_ids,
    };
    for &block in &clif.layout {
        tr.translate_block(block);
    }
    tr.func
}

struct Translator<'a> {
    clif: &'a ir::Function,
    types: &'a mut TypeRegistry,
    func: Func,
    block_map: HashMap<ir::Block, BlockId>,
    value_map: HashMap<ir::Value, ValueId>,
    slot_local: HashMap<ir::StackSlot, usize>,
    func_ids: HashMap<ir::FuncRef, FuncId>,
}

impl<'a> Translator<'a> {
    fn val(&self, v: ir::Value) -> ValueId {
        self.value_map[&v]
    }

    fn result_ty(&self, inst: ir::Inst) -> TypeId {
        match self.clif.dfg.inst_result(inst) {
            Some(v) => map_ty(self.types, self.clif.dfg.value_type(v)),
            None => self.types.i64(),
        }
    }

    fn push(&mut self, block: BlockId, inst: ir::Inst, data: ValueData) -> ValueId {
        let v = self.func.append(block, data);
        if let Some(res) = self.clif.dfg.inst_result(inst) {
            self.value_map.insert(res, v);
        }
        v
    }

    /// Record the edge to `dest`, appending this edge's arguments to the
    /// target's phis.
    fn edge(&mut self, from: BlockId, dest: ir::Block, args: &[ir::Value]) -> BlockId {
        let to = self.block_map[&dest];
        self.func.add_pred(to, from);
        let phis: Vec<ValueId> = self.func.blocks[to]
            .values
            .iter()
            .copied()
            .filter(|&v| self.func.values[v].op == SsaOp::Phi)
            .collect();
        debug_assert_eq!(phis.len(), args.len(), "edge arity mismatch into {}", dest);
        for (phi, &arg) in phis.iter().zip(args) {
            let ssa_arg = self.val(arg);
            self.func.values[ssa_arg].uses += 1;
            self.func.values[*phi].args.push(ssa_arg);
        }
        to
    }

    fn translate_block(&mut self, block: ir::Block) {
        let b = self.block_map[&block];
        for &inst in &self.clif.blocks[block].insts {
            self.translate_inst(b, inst);
        }
    }

    fn translate_inst(&mut self, b: BlockId, inst: ir::Inst) {
        let data = self.clif.dfg.insts[inst].clone();
        let op = data.opcode();
        match data {
            InstructionData::NullAry { .. } => {}
            InstructionData::UnaryImm { imm, .. } => {
                let ty = self.result_ty(inst);
                self.push(
                    b,
                    inst,
                    ValueData::new(SsaOp::ConstInt, ty, []).with_aux_int(imm),
                );
            }
            InstructionData::Unary { arg, .. } => {
                let ty = self.result_ty(inst);
                let a = self.val(arg);
                let ssa_op = match op {
                    Opcode::Bnot => SsaOp::Bnot,
                    Opcode::Uextend => SsaOp::Uext,
                    Opcode::Sextend => SsaOp::Sext,
                    Opcode::Ireduce => SsaOp::Trunc,
                    other => panic!("unmapped unary opcode {}", other),
                };
                self.push(b, inst, ValueData::new(ssa_op, ty, [a]));
            }
            InstructionData::Binary { args, .. } => {
                let ty = self.result_ty(inst);
                let (a, z) = (self.val(args[0]), self.val(args[1]));
                let ssa_op = match op {
                    Opcode::Iadd => SsaOp::Iadd,
                    Opcode::Isub => SsaOp::Isub,
                    Opcode::Imul => SsaOp::Imul,
                    Opcode::Sdiv => SsaOp::Sdiv,
                    Opcode::Udiv => SsaOp::Udiv,
                    Opcode::Srem => SsaOp::Srem,
                    Opcode::Urem => SsaOp::Urem,
                    Opcode::Band => SsaOp::Band,
                    Opcode::Bor => SsaOp::Bor,
                    Opcode::Bxor => SsaOp::Bxor,
                    Opcode::Ishl => SsaOp::Ishl,
                    Opcode::Sshr => SsaOp::Sshr,
                    Opcode::Ushr => SsaOp::Ushr,
                    Opcode::Rotl => SsaOp::Rotl,
                    Opcode::Rotr => SsaOp::Rotr,
                    other => panic!("unmapped binary opcode {}", other),
                };
                self.push(b, inst, ValueData::new(ssa_op, ty, [a, z]));
            }
            InstructionData::IntCompare { args, cond, .. } => {
                let (a, z) = (self.val(args[0]), self.val(args[1]));
                let ty = self.types.bool();
                self.push(
                    b,
                    inst,
                    ValueData::new(SsaOp::Icmp, ty, [a, z]).with_aux(Aux::Cond(cond)),
                );
            }
            InstructionData::Ternary { args, .. } => {
                let ty = self.result_ty(inst);
                let (c, t, e) = (self.val(args[0]), self.val(args[1]), self.val(args[2]));
                self.push(b, inst, ValueData::new(SsaOp::Select, ty, [c, t, e]));
            }
            InstructionData::LoadData { arg, offset, .. } => {
                let ty = self.result_ty(inst);
                let a = self.val(arg);
                self.push(
                    b,
                    inst,
                    ValueData::new(SsaOp::Load, ty, [a]).with_aux_int(offset as i64),
                );
            }
            InstructionData::StoreData { args, offset, .. } => {
                // CLIF stores carry (value, address); low SSA wants
                // (address, value).
                let (value, addr) = (self.val(args[0]), self.val(args[1]));
                let ty = self.types.i64();
                self.push(
                    b,
                    inst,
                    ValueData::new(SsaOp::Store, ty, [addr, value]).with_aux_int(offset as i64),
                );
            }
            InstructionData::StackLoad { slot, offset, .. } => {
                let local = self.slot_local[&slot] as i64;
                let ty = self.result_ty(inst);
                let ptr_ty = self.types.ptr();
                let addr = self.func.append(
                    b,
                    ValueData::new(SsaOp::LocalAddr, ptr_ty, []).with_aux_int(local),
                );
                self.push(
                    b,
                    inst,
                    ValueData::new(SsaOp::Load, ty, [addr]).with_aux_int(offset as i64),
                );
            }
            InstructionData::StackStore {
                arg, slot, offset, ..
            } => {
                let local = self.slot_local[&slot] as i64;
                let value = self.val(arg);
                let ptr_ty = self.types.ptr();
                let i64t = self.types.i64();
                let addr = self.func.append(
                    b,
                    ValueData::new(SsaOp::LocalAddr, ptr_ty, []).with_aux_int(local),
                );
                self.push(
                    b,
                    inst,
                    ValueData::new(SsaOp::Store, i64t, [addr, value]).with_aux_int(offset as i64),
                );
            }
            InstructionData::StackAddr { slot, offset, .. } => {
                let local = self.slot_local[&slot] as i64;
                let ptr_ty = self.types.ptr();
                if offset == 0 {
                    self.push(
                        b,
                        inst,
                        ValueData::new(SsaOp::LocalAddr, ptr_ty, []).with_aux_int(local),
                    );
                } else {
                    let i64t = self.types.i64();
                    let base = self.func.append(
                        b,
                        ValueData::new(SsaOp::LocalAddr, ptr_ty, []).with_aux_int(local),
                    );
                    let off = self.func.append(
                        b,
                        ValueData::new(SsaOp::ConstInt, i64t, []).with_aux_int(offset as i64),
                    );
                    self.push(b, inst, ValueData::new(SsaOp::Iadd, ptr_ty, [base, off]));
                }
            }
            InstructionData::FuncAddr { func_ref, .. } => {
                let ptr_ty = self.types.ptr();
                let id = self.func_ids[&func_ref];
                self.push(
                    b,
                    inst,
                    ValueData::new(SsaOp::FuncAddr, ptr_ty, []).with_aux(Aux::Func(id)),
                );
            }
            InstructionData::Call { func_ref, args, .. } => {
                let ty = self.result_ty(inst);
                let id = self.func_ids[&func_ref];
                let ssa_args: SmallVec<[ValueId; 3]> =
                    args.iter().map(|&a| self.val(a)).collect();
                self.push(
                    b,
                    inst,
                    ValueData::new(SsaOp::StaticCall, ty, ssa_args).with_aux(Aux::Func(id)),
                );
            }
            InstructionData::CallIndirect { args, .. } => {
                let ty = self.result_ty(inst);
                let ssa_args: SmallVec<[ValueId; 3]> =
                    args.iter().map(|&a| self.val(a)).collect();
                self.push(b, inst, ValueData::new(SsaOp::ClosureCall, ty, ssa_args));
            }
            InstructionData::Jump {
                destination, args, ..
            } => {
                let to = self.edge(b, destination, &args);
                let i64t = self.types.i64();
                self.func.append(
                    b,
                    ValueData::new(SsaOp::Jump, i64t, [])
                        .with_aux(Aux::Targets(smallvec![to])),
                );
            }
            InstructionData::Brif {
                arg,
                then_dest,
                then_args,
                else_dest,
                else_args,
                ..
            } => {
                let c = self.val(arg);
                let then_b = self.edge(b, then_dest, &then_args);
                let else_b = self.edge(b, else_dest, &else_args);
                let i64t = self.types.i64();
                self.func.append(
                    b,
                    ValueData::new(SsaOp::Brif, i64t, [c])
                        .with_aux(Aux::Targets(smallvec![then_b, else_b])),
                );
            }
            InstructionData::BranchTable { arg, table, .. } => {
                let idx = self.val(arg);
                let mut targets: SmallVec<[BlockId; 2]> = SmallVec::new();
                for &t in &table.table {
                    targets.push(self.edge(b, t, &[]));
                }
                targets.push(self.edge(b, table.default, &[]));
                let i64t = self.types.i64();
                self.func.append(
                    b,
                    ValueData::new(SsaOp::BrTable, i64t, [idx]).with_aux(Aux::Targets(targets)),
                );
            }
            InstructionData::MultiAry { args, .. } => {
                debug_assert_eq!(op, Opcode::Return);
                let ssa_args: SmallVec<[ValueId; 3]> =
                    args.iter().map(|&a| self.val(a)).collect();
                let i64t = self.types.i64();
                self.func
                    .append(b, ValueData::new(SsaOp::Ret, i64t, ssa_args));
            }
            InstructionData::Trap { code, .. } => {
                let i64t = self.types.i64();
                self.func
                    .append(b, ValueData::new(SsaOp::Trap, i64t, []).with_aux(Aux::Trap(code)));
            }
        }
    }
}
