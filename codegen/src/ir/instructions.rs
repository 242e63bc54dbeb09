//! Instruction formats and opcodes.
//!
//! Every instruction is one `InstructionData` variant: an opcode plus the
//! operand fields its format carries. Pattern matching on the variant is the
//! natural traversal; there is no class hierarchy behind this.

use crate::ir::condcodes::IntCC;
use crate::ir::{Block, FuncRef, JumpTableData, MemFlags, SigRef, StackSlot, TrapCode, Value};
use smallvec::SmallVec;
use std::fmt;

/// A list of operand values.
pub type ValueList = SmallVec<[Value; 4]>;

/// An instruction opcode.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Opcode {
    /// Integer constant.
    Iconst,
    /// Wrapping integer addition.
    Iadd,
    /// Wrapping integer subtraction.
    Isub,
    /// Wrapping integer multiplication.
    Imul,
    /// Signed integer division.
    Sdiv,
    /// Unsigned integer division.
    Udiv,
    /// Signed integer remainder.
    Srem,
    /// Unsigned integer remainder.
    Urem,
    /// Bitwise and.
    Band,
    /// Bitwise or.
    Bor,
    /// Bitwise xor.
    Bxor,
    /// Bitwise not.
    Bnot,
    /// Shift left.
    Ishl,
    /// Signed (arithmetic) shift right.
    Sshr,
    /// Unsigned (logical) shift right.
    Ushr,
    /// Rotate left.
    Rotl,
    /// Rotate right.
    Rotr,
    /// Integer comparison producing 0 or 1 as an `i8`.
    Icmp,
    /// `select c, x, y` picks `x` when `c` is non-zero.
    Select,
    /// Zero-extend to a wider integer type.
    Uextend,
    /// Sign-extend to a wider integer type.
    Sextend,
    /// Truncate to a narrower integer type.
    Ireduce,
    /// Load from memory.
    Load,
    /// Store to memory.
    Store,
    /// Load from a stack slot.
    StackLoad,
    /// Store to a stack slot.
    StackStore,
    /// Address of a stack slot.
    StackAddr,
    /// Address of an external function.
    FuncAddr,
    /// Direct call.
    Call,
    /// Indirect call through a function pointer value.
    CallIndirect,
    /// Unconditional jump.
    Jump,
    /// Two-way conditional branch.
    Brif,
    /// Indirect branch through a jump table.
    BrTable,
    /// Return from the function.
    Return,
    /// Unconditional trap.
    Trap,
    /// No-op; used as a placeholder.
    Nop,
}

impl Opcode {
    /// Is this opcode a block terminator?
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::Brif | Opcode::BrTable | Opcode::Return | Opcode::Trap
        )
    }

    /// Is this opcode a branch with block targets?
    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::Brif | Opcode::BrTable)
    }

    /// Can this opcode be part of reachable code only via its side effects?
    pub fn is_call(self) -> bool {
        matches!(self, Opcode::Call | Opcode::CallIndirect)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Opcode::*;
        f.write_str(match *self {
            Iconst => "iconst",
            Iadd => "iadd",
            Isub => "isub",
            Imul => "imul",
            Sdiv => "sdiv",
            Udiv => "udiv",
            Srem => "srem",
            Urem => "urem",
            Band => "band",
            Bor => "bor",
            Bxor => "bxor",
            Bnot => "bnot",
            Ishl => "ishl",
            Sshr => "sshr",
            Ushr => "ushr",
            Rotl => "rotl",
            Rotr => "rotr",
            Icmp => "icmp",
            Select => "select",
            Uextend => "uextend",
            Sextend => "sextend",
            Ireduce => "ireduce",
            Load => "load",
            Store => "store",
            StackLoad => "stack_load",
            StackStore => "stack_store",
            StackAddr => "stack_addr",
            FuncAddr => "func_addr",
            Call => "call",
            CallIndirect => "call_indirect",
            Jump => "jump",
            Brif => "brif",
            BrTable => "br_table",
            Return => "return",
            Trap => "trap",
            Nop => "nop",
        })
    }
}

/// The operand fields of an instruction, tagged by format.
#[derive(Clone, Debug, PartialEq)]
pub enum InstructionData {
    /// No operands.
    NullAry { opcode: Opcode },
    /// One immediate, no value operands (`iconst`).
    UnaryImm { opcode: Opcode, imm: i64 },
    /// One value operand.
    Unary { opcode: Opcode, arg: Value },
    /// Two value operands.
    Binary { opcode: Opcode, args: [Value; 2] },
    /// Two value operands compared under a condition code.
    IntCompare {
        opcode: Opcode,
        args: [Value; 2],
        cond: IntCC,
    },
    /// Three value operands (`select`).
    Ternary { opcode: Opcode, args: [Value; 3] },
    /// Memory load: `arg` is the address.
    LoadData {
        opcode: Opcode,
        arg: Value,
        flags: MemFlags,
        offset: i32,
    },
    /// Memory store: `args` are the stored value and the address.
    StoreData {
        opcode: Opcode,
        args: [Value; 2],
        flags: MemFlags,
        offset: i32,
    },
    /// Load from a stack slot.
    StackLoad {
        opcode: Opcode,
        slot: StackSlot,
        offset: i32,
    },
    /// Store to a stack slot: `arg` is the stored value.
    StackStore {
        opcode: Opcode,
        arg: Value,
        slot: StackSlot,
        offset: i32,
    },
    /// Address of a stack slot.
    StackAddr {
        opcode: Opcode,
        slot: StackSlot,
        offset: i32,
    },
    /// Materialize the address of an external function.
    FuncAddr { opcode: Opcode, func_ref: FuncRef },
    /// Direct call.
    Call {
        opcode: Opcode,
        func_ref: FuncRef,
        args: ValueList,
    },
    /// Indirect call; `args[0]` is the callee pointer.
    CallIndirect {
        opcode: Opcode,
        sig_ref: SigRef,
        args: ValueList,
    },
    /// Unconditional jump with block arguments.
    Jump {
        opcode: Opcode,
        destination: Block,
        args: ValueList,
    },
    /// Conditional branch with per-target argument vectors.
    Brif {
        opcode: Opcode,
        arg: Value,
        then_dest: Block,
        then_args: ValueList,
        else_dest: Block,
        else_args: ValueList,
    },
    /// Indirect branch through a jump table.
    BranchTable {
        opcode: Opcode,
        arg: Value,
        table: JumpTableData,
    },
    /// Return with the returned values as operands.
    MultiAry { opcode: Opcode, args: ValueList },
    /// Unconditional trap.
    Trap { opcode: Opcode, code: TrapCode },
}

impl InstructionData {
    /// The opcode of this instruction.
    pub fn opcode(&self) -> Opcode {
        use InstructionData::*;
        match *self {
            NullAry { opcode }
            | UnaryImm { opcode, .. }
            | Unary { opcode, .. }
            | Binary { opcode, .. }
            | IntCompare { opcode, .. }
            | Ternary { opcode, .. }
            | LoadData { opcode, .. }
            | StoreData { opcode, .. }
            | StackLoad { opcode, .. }
            | StackStore { opcode, .. }
            | StackAddr { opcode, .. }
            | FuncAddr { opcode, .. }
            | Call { opcode, .. }
            | CallIndirect { opcode, .. }
            | Jump { opcode, .. }
            | Brif { opcode, .. }
            | BranchTable { opcode, .. }
            | MultiAry { opcode, .. }
            | Trap { opcode, .. } => opcode,
        }
    }

    /// The value operands of this instruction, in order. Block arguments are
    /// not included.
    pub fn arguments(&self) -> SmallVec<[Value; 4]> {
        use InstructionData::*;
        match self {
            NullAry { .. }
            | UnaryImm { .. }
            | StackLoad { .. }
            | StackAddr { .. }
            | FuncAddr { .. }
            | Trap { .. } => SmallVec::new(),
            Unary { arg, .. } | LoadData { arg, .. } | StackStore { arg, .. } => {
                SmallVec::from_slice(&[*arg])
            }
            Binary { args, .. } | IntCompare { args, .. } | StoreData { args, .. } => {
                SmallVec::from_slice(args)
            }
            Ternary { args, .. } => SmallVec::from_slice(args),
            Call { args, .. } | CallIndirect { args, .. } | MultiAry { args, .. } => args.clone(),
            Jump { .. } => SmallVec::new(),
            Brif { arg, .. } | BranchTable { arg, .. } => SmallVec::from_slice(&[*arg]),
        }
    }

    /// The block targets of this instruction, if it is a branch.
    pub fn branch_destinations(&self) -> SmallVec<[Block; 2]> {
        use InstructionData::*;
        match self {
            Jump { destination, .. } => SmallVec::from_slice(&[*destination]),
            Brif {
                then_dest,
                else_dest,
                ..
            } => SmallVec::from_slice(&[*then_dest, *else_dest]),
            BranchTable { table, .. } => table.all_targets().collect(),
            _ => SmallVec::new(),
        }
    }

    /// The block argument vector supplied to `dest`, mutable. Used by SSA
    /// construction when a block parameter is appended after the branch was
    /// built.
    ///
    /// For a `brif` with both edges to the same block the caller gets the
    /// then-edge first and must call again with `skip = 1`.
    pub fn branch_args_mut(&mut self, dest: Block, skip: usize) -> Option<&mut ValueList> {
        use InstructionData::*;
        match self {
            Jump {
                destination, args, ..
            } if *destination == dest && skip == 0 => Some(args),
            Brif {
                then_dest,
                then_args,
                else_dest,
                else_args,
                ..
            } => {
                let mut n = skip;
                if *then_dest == dest {
                    if n == 0 {
                        return Some(then_args);
                    }
                    n -= 1;
                }
                if *else_dest == dest && n == 0 {
                    return Some(else_args);
                }
                None
            }
            _ => None,
        }
    }

    /// How many edges of this branch target `dest`?
    pub fn edges_to(&self, dest: Block) -> usize {
        self.branch_destinations()
            .iter()
            .filter(|b| **b == dest)
            .count()
    }
}
