//! Representation of CLIF, the mid-level typed SSA IR.
//!
//! CLIF sits between the front end's SSA and machine instructions. Functions
//! are made of basic blocks with typed block parameters; every branch
//! supplies arguments for the target block's parameters, subsuming classical
//! phi nodes.

pub mod condcodes;
mod entities;
mod extfunc;
mod function;
pub mod instructions;
mod jumptable;
mod memflags;
mod stackslot;
mod trapcode;
pub mod types;

pub use self::condcodes::IntCC;
pub use self::entities::{Block, FuncRef, Inst, SigRef, StackSlot, Value};
pub use self::extfunc::{
    AbiParam, ArgumentPurpose, CallConv, ExtFuncData, ExternalName, Signature,
};
pub use self::function::{BlockData, DataFlowGraph, Function, ValueData};
pub use self::instructions::{InstructionData, Opcode, ValueList};
pub use self::jumptable::JumpTableData;
pub use self::memflags::MemFlags;
pub use self::stackslot::StackSlotData;
pub use self::trapcode::TrapCode;
pub use self::types::Type;
