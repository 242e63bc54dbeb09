//! A CLIF function: blocks, values, instructions, and the pools they draw
//! from.

use crate::entity::{PrimaryMap, SecondaryMap};
use crate::ir::instructions::{InstructionData, ValueList};
use crate::ir::{
    Block, ExtFuncData, ExternalName, FuncRef, Inst, SigRef, Signature, StackSlot, StackSlotData,
    Type, Value,
};
use std::fmt;

/// Where a value comes from: an instruction result or a block parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueData {
    /// Value is the result of an instruction.
    Inst { ty: Type, inst: Inst },
    /// Value is a block parameter.
    Param { ty: Type, block: Block, num: u16 },
}

/// A basic block: ordered typed parameters and an ordered instruction list.
/// The last instruction of a filled block is a terminator.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    /// The block parameters, the canonical SSA phi formulation.
    pub params: Vec<Value>,
    /// The instructions of the block, in order.
    pub insts: Vec<Inst>,
}

/// The value and instruction pools of a function.
#[derive(Clone, Debug, Default)]
pub struct DataFlowGraph {
    /// All instructions.
    pub insts: PrimaryMap<Inst, InstructionData>,
    /// Result value of each instruction, if it produces one.
    pub results: SecondaryMap<Inst, Option<Value>>,
    /// All values.
    pub values: PrimaryMap<Value, ValueData>,
    /// Imported signatures, for indirect calls.
    pub signatures: PrimaryMap<SigRef, Signature>,
    /// Imported external function references.
    pub ext_funcs: PrimaryMap<FuncRef, ExtFuncData>,
}

impl DataFlowGraph {
    /// The type of `v`.
    pub fn value_type(&self, v: Value) -> Type {
        match self.values[v] {
            ValueData::Inst { ty, .. } | ValueData::Param { ty, .. } => ty,
        }
    }

    /// The result value of `inst`, if any.
    pub fn inst_result(&self, inst: Inst) -> Option<Value> {
        self.results[inst]
    }

    /// Import a signature, returning its reference.
    pub fn import_signature(&mut self, sig: Signature) -> SigRef {
        self.signatures.push(sig)
    }

    /// Import an external function, returning its reference.
    pub fn import_function(&mut self, data: ExtFuncData) -> FuncRef {
        self.ext_funcs.push(data)
    }
}

/// A CLIF function.
#[derive(Clone, Debug)]
pub struct Function {
    /// The symbol name of this function.
    pub name: ExternalName,
    /// The signature of this function.
    pub signature: Signature,
    /// Sized stack slots allocated in this function.
    pub stack_slots: PrimaryMap<StackSlot, StackSlotData>,
    /// The instruction and value pools.
    pub dfg: DataFlowGraph,
    /// All blocks, in creation order.
    pub blocks: PrimaryMap<Block, BlockData>,
    /// The blocks in layout (emission) order. A block enters the layout when
    /// the builder first switches to it.
    pub layout: Vec<Block>,
}

impl Function {
    /// Create a function with the given name and signature.
    pub fn with_name_signature(name: ExternalName, signature: Signature) -> Self {
        Self {
            name,
            signature,
            stack_slots: PrimaryMap::new(),
            dfg: DataFlowGraph::default(),
            blocks: PrimaryMap::new(),
            layout: Vec::new(),
        }
    }

    /// Create a new empty block.
    pub fn create_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    /// Append a typed parameter to `block` and return its value.
    pub fn append_block_param(&mut self, block: Block, ty: Type) -> Value {
        let num = self.blocks[block].params.len();
        debug_assert!(num <= u16::MAX as usize, "too many parameters on block");
        let val = self.dfg.values.push(ValueData::Param {
            ty,
            block,
            num: num as u16,
        });
        self.blocks[block].params.push(val);
        val
    }

    /// The parameters of `block`.
    pub fn block_params(&self, block: Block) -> &[Value] {
        &self.blocks[block].params
    }

    /// Declare a sized stack slot.
    pub fn create_stack_slot(&mut self, data: StackSlotData) -> StackSlot {
        self.stack_slots.push(data)
    }

    /// Append an instruction to `block`. `result_ty` is the type of the
    /// result value, if the instruction produces one.
    pub fn append_inst(
        &mut self,
        block: Block,
        data: InstructionData,
        result_ty: Option<Type>,
    ) -> Inst {
        debug_assert!(
            !self.is_filled(block),
            "appending {} to already-terminated {}",
            data.opcode(),
            block
        );
        let inst = self.dfg.insts.push(data);
        if let Some(ty) = result_ty {
            let val = self.dfg.values.push(ValueData::Inst { ty, inst });
            self.dfg.results[inst] = Some(val);
        }
        self.blocks[block].insts.push(inst);
        inst
    }

    /// Is `block` terminated?
    pub fn is_filled(&self, block: Block) -> bool {
        self.blocks[block]
            .insts
            .last()
            .map_or(false, |i| self.dfg.insts[*i].opcode().is_terminator())
    }

    /// The terminator instruction of `block`, if the block is filled.
    pub fn terminator(&self, block: Block) -> Option<Inst> {
        let last = *self.blocks[block].insts.last()?;
        self.dfg.insts[last].opcode().is_terminator().then_some(last)
    }

    /// The entry block, once one exists.
    pub fn entry_block(&self) -> Option<Block> {
        self.layout.first().copied()
    }

    /// A human readable display of the whole function.
    pub fn display(&self) -> DisplayFunction<'_> {
        DisplayFunction(self)
    }
}

/// Wrapper for pretty-printing a function.
pub struct DisplayFunction<'a>(&'a Function);

impl fmt::Display for DisplayFunction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let func = self.0;
        writeln!(f, "function {}{} {{", func.name, func.signature)?;
        for (slot, data) in func.stack_slots.iter() {
            writeln!(f, "    {} = {}", slot, data)?;
        }
        for &block in &func.layout {
            write!(f, "{}(", block)?;
            for (i, &p) in func.blocks[block].params.iter().enumerate() {
                if i != 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", p, func.dfg.value_type(p))?;
            }
            writeln!(f, "):")?;
            for &inst in &func.blocks[block].insts {
                write!(f, "    ")?;
                if let Some(res) = func.dfg.inst_result(inst) {
                    write!(f, "{} = ", res)?;
                }
                write_inst(f, func, inst)?;
                writeln!(f)?;
            }
        }
        writeln!(f, "}}")
    }
}

fn write_args(f: &mut fmt::Formatter, args: &ValueList) -> fmt::Result {
    for (i, a) in args.iter().enumerate() {
        if i != 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", a)?;
    }
    Ok(())
}

fn write_inst(f: &mut fmt::Formatter, func: &Function, inst: Inst) -> fmt::Result {
    use InstructionData::*;
    let data = &func.dfg.insts[inst];
    let op = data.opcode();
    match data {
        NullAry { .. } => write!(f, "{}", op),
        UnaryImm { imm, .. } => {
            let ty = func
                .dfg
                .inst_result(inst)
                .map(|v| func.dfg.value_type(v))
                .unwrap_or_default();
            write!(f, "{}.{} {}", op, ty, imm)
        }
        Unary { arg, .. } => write!(f, "{} {}", op, arg),
        Binary { args, .. } => write!(f, "{} {}, {}", op, args[0], args[1]),
        IntCompare { args, cond, .. } => write!(f, "{} {} {}, {}", op, cond, args[0], args[1]),
        Ternary { args, .. } => write!(f, "{} {}, {}, {}", op, args[0], args[1], args[2]),
        LoadData {
            arg, flags, offset, ..
        } => write!(f, "{}{} {}{:+}", op, flags, arg, offset),
        StoreData {
            args,
            flags,
            offset,
            ..
        } => write!(f, "{}{} {}, {}{:+}", op, flags, args[0], args[1], offset),
        StackLoad { slot, offset, .. } => write!(f, "{} {}{:+}", op, slot, offset),
        StackStore {
            arg, slot, offset, ..
        } => write!(f, "{} {}, {}{:+}", op, arg, slot, offset),
        StackAddr { slot, offset, .. } => write!(f, "{} {}{:+}", op, slot, offset),
        FuncAddr { func_ref, .. } => write!(f, "{} {}", op, func_ref),
        Call { func_ref, args, .. } => {
            write!(f, "{} {}(", op, func_ref)?;
            write_args(f, args)?;
            write!(f, ")")
        }
        CallIndirect { sig_ref, args, .. } => {
            write!(f, "{} {}, {}(", op, sig_ref, args[0])?;
            for (i, a) in args[1..].iter().enumerate() {
                if i != 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", a)?;
            }
            write!(f, ")")
        }
        Jump {
            destination, args, ..
        } => {
            write!(f, "{} {}(", op, destination)?;
            write_args(f, args)?;
            write!(f, ")")
        }
        Brif {
            arg,
            then_dest,
            then_args,
            else_dest,
            else_args,
            ..
        } => {
            write!(f, "{} {}, {}(", op, arg, then_dest)?;
            write_args(f, then_args)?;
            write!(f, "), {}(", else_dest)?;
            write_args(f, else_args)?;
            write!(f, ")")
        }
        BranchTable { arg, table, .. } => write!(f, "{} {}, {}", op, arg, table),
        MultiAry { args, .. } => {
            write!(f, "{} ", op)?;
            write_args(f, args)
        }
        Trap { code, .. } => write!(f, "{} {}", op, code),
    }
}
