//! The low SSA IR consumed by lowering.
//!
//! This is the form the front end hands to the backend: blocks of values
//! with explicit `phi` opcodes (unlike CLIF's block parameters). The
//! pre-lowering passes rewrite it in place, the register allocator assigns
//! every value a home, and the per-ISA lowering walks the result.

mod decompose;
mod expand_calls;
mod from_clif;
mod liveness;

pub use self::decompose::decompose;
pub use self::expand_calls::expand_calls;
pub use self::from_clif::func_from_clif;
pub use self::liveness::{
    compute_liveness, Liveness, DIST_CALL, DIST_LIKELY, DIST_NORMAL, NO_CALL,
};

use crate::entity::{entity_impl, EntityRef, PrimaryMap};
use crate::ir::{IntCC, TrapCode};
use smallvec::SmallVec;
use std::fmt;

/// A reference to a type in the type registry.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);
entity_impl!(TypeId, "ty");

/// A reference to a function in the function table.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);
entity_impl!(FuncId, "f");

/// A reference to a low SSA value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u32);
entity_impl!(ValueId, "v");

/// A reference to a low SSA basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);
entity_impl!(BlockId, "b");

/// The shape of a type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeData {
    /// 8-bit integer.
    I8,
    /// 16-bit integer.
    I16,
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Boolean, one byte.
    Bool,
    /// An untyped pointer, eight bytes.
    Ptr,
    /// A string: pointer and length, sixteen bytes.
    Str,
    /// A slice of `elem`: pointer and length, sixteen bytes.
    Slice {
        /// Element type.
        elem: TypeId,
    },
    /// A struct with fields laid out in order.
    Struct {
        /// Field types, in declaration order.
        fields: Vec<TypeId>,
    },
}

/// The registry of types, produced by the front end and read-only during
/// compilation. Provides size and alignment queries.
#[derive(Clone, Debug)]
pub struct TypeRegistry {
    types: PrimaryMap<TypeId, TypeData>,
}

impl TypeRegistry {
    /// Create a registry pre-seeded with the primitive types.
    pub fn new() -> Self {
        let mut types = PrimaryMap::new();
        // Keep in sync with the well-known accessors below.
        types.push(TypeData::I8);
        types.push(TypeData::I16);
        types.push(TypeData::I32);
        types.push(TypeData::I64);
        types.push(TypeData::F32);
        types.push(TypeData::F64);
        types.push(TypeData::Bool);
        types.push(TypeData::Ptr);
        types.push(TypeData::Str);
        Self { types }
    }

    /// The `i8` type.
    pub fn i8(&self) -> TypeId {
        TypeId(0)
    }
    /// The `i16` type.
    pub fn i16(&self) -> TypeId {
        TypeId(1)
    }
    /// The `i32` type.
    pub fn i32(&self) -> TypeId {
        TypeId(2)
    }
    /// The `i64` type.
    pub fn i64(&self) -> TypeId {
        TypeId(3)
    }
    /// The `f32` type.
    pub fn f32(&self) -> TypeId {
        TypeId(4)
    }
    /// The `f64` type.
    pub fn f64(&self) -> TypeId {
        TypeId(5)
    }
    /// The `bool` type.
    pub fn bool(&self) -> TypeId {
        TypeId(6)
    }
    /// The pointer type.
    pub fn ptr(&self) -> TypeId {
        TypeId(7)
    }
    /// The string type.
    pub fn str(&self) -> TypeId {
        TypeId(8)
    }

    /// Intern a slice type.
    pub fn make_slice(&mut self, elem: TypeId) -> TypeId {
        self.types.push(TypeData::Slice { elem })
    }

    /// Intern a struct type.
    pub fn make_struct(&mut self, fields: Vec<TypeId>) -> TypeId {
        self.types.push(TypeData::Struct { fields })
    }

    /// The shape of `ty`.
    pub fn data(&self, ty: TypeId) -> &TypeData {
        &self.types[ty]
    }

    /// Size of `ty` in bytes.
    pub fn size_of(&self, ty: TypeId) -> u32 {
        match &self.types[ty] {
            TypeData::I8 | TypeData::Bool => 1,
            TypeData::I16 => 2,
            TypeData::I32 | TypeData::F32 => 4,
            TypeData::I64 | TypeData::F64 | TypeData::Ptr => 8,
            TypeData::Str | TypeData::Slice { .. } => 16,
            TypeData::Struct { fields } => {
                let mut size = 0;
                for &field in fields {
                    let align = self.align_of(field);
                    size = align_up(size, align) + self.size_of(field);
                }
                align_up(size, self.align_of(ty))
            }
        }
    }

    /// Alignment of `ty` in bytes.
    pub fn align_of(&self, ty: TypeId) -> u32 {
        match &self.types[ty] {
            TypeData::I8 | TypeData::Bool => 1,
            TypeData::I16 => 2,
            TypeData::I32 | TypeData::F32 => 4,
            TypeData::Struct { fields } => {
                fields.iter().map(|&f| self.align_of(f)).max().unwrap_or(1)
            }
            _ => 8,
        }
    }

    /// Byte offset of field `index` inside a struct type.
    pub fn field_offset(&self, ty: TypeId, index: usize) -> u32 {
        match &self.types[ty] {
            TypeData::Struct { fields } => {
                let mut off = 0;
                for (i, &field) in fields.iter().enumerate() {
                    off = align_up(off, self.align_of(field));
                    if i == index {
                        return off;
                    }
                    off += self.size_of(field);
                }
                panic!("field index {} out of range", index)
            }
            _ => panic!("field_offset on non-struct {}", ty),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Round `x` up to a multiple of `align` (a power of two).
pub fn align_up(x: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

/// An entry in the function table delivered by the front end.
#[derive(Clone, Debug)]
pub struct FuncDecl {
    /// Mangled symbol name.
    pub name: String,
    /// Parameter types.
    pub params: Vec<TypeId>,
    /// Return types.
    pub returns: Vec<TypeId>,
    /// Is this a libc (or otherwise external) reference?
    pub external: bool,
}

/// The function table: names, signatures, and extern flags.
#[derive(Clone, Debug, Default)]
pub struct FuncTable {
    /// All declared functions.
    pub funcs: PrimaryMap<FuncId, FuncDecl>,
}

impl FuncTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a function and return its id. Re-declaring a name returns
    /// the existing id.
    pub fn declare(&mut self, decl: FuncDecl) -> FuncId {
        if let Some((id, _)) = self.funcs.iter().find(|(_, d)| d.name == decl.name) {
            return id;
        }
        self.funcs.push(decl)
    }

    /// Look up a function by name.
    pub fn by_name(&self, name: &str) -> Option<FuncId> {
        self.funcs.iter().find(|(_, d)| d.name == name).map(|(id, _)| id)
    }
}

/// A low SSA opcode.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum SsaOp {
    /// Incoming function argument; `aux_int` is the ABI argument index.
    Arg,
    /// Integer constant in `aux_int`.
    ConstInt,
    /// Boolean constant in `aux_int` (0 or 1).
    ConstBool,
    /// String literal; `aux` names the entry in the literal pool.
    ConstStr,
    /// Wrapping addition.
    Iadd,
    /// Wrapping subtraction.
    Isub,
    /// Wrapping multiplication.
    Imul,
    /// Signed division.
    Sdiv,
    /// Unsigned division.
    Udiv,
    /// Signed remainder.
    Srem,
    /// Unsigned remainder.
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
    /// Arithmetic shift right.
    Sshr,
    /// Logical shift right.
    Ushr,
    /// Rotate left.
    Rotl,
    /// Rotate right.
    Rotr,
    /// Integer compare under `aux` condition code; produces bool.
    Icmp,
    /// `select c, x, y`.
    Select,
    /// Sign extension.
    Sext,
    /// Zero extension.
    Uext,
    /// Truncation.
    Trunc,
    /// Load `ty` from `args[0] + aux_int`.
    Load,
    /// Store `args[1]` to `args[0] + aux_int`.
    Store,
    /// Address of local slot `aux_int`. Rematerializable.
    LocalAddr,
    /// Compose a string from (ptr, len).
    StringMake,
    /// Extract the pointer of a string.
    StringPtr,
    /// Extract the length of a string.
    StringLen,
    /// Compose a slice from (ptr, len).
    SliceMake,
    /// Extract the pointer of a slice.
    SlicePtr,
    /// Extract the length of a slice.
    SliceLen,
    /// Direct call of `aux` function with `args`.
    StaticCall,
    /// Indirect call; `args[0]` is the callee pointer.
    ClosureCall,
    /// The `aux_int`-th ABI result of the call `args[0]`. Result 0 is the
    /// call value itself; `select_n` is scheduled immediately after its call
    /// and picks up the remaining result registers.
    SelectN,
    /// Materialize the address of `aux` function. Rematerializable.
    FuncAddr,
    /// Read the pinned VM-context register. Rematerializable.
    PinnedReg,
    /// Phi; `args` align with the block's predecessor order.
    Phi,
    /// Register-to-register copy inserted by allocation.
    Copy,
    /// Spill marker: write `args[0]` to its spill slot.
    StoreReg,
    /// Reload marker: read a spilled value back into a register.
    LoadReg,
    /// Bulk memory move of `aux_int` bytes from `args[1]` to `args[0]`.
    Move,
    /// Jump to the single target in `aux`.
    Jump,
    /// Conditional branch on `args[0]`; `aux` holds (then, else) targets,
    /// `aux_int` the branch likelihood.
    Brif,
    /// Indexed branch; `aux` holds the table targets with the default last.
    BrTable,
    /// Return `args`.
    Ret,
    /// Trap with `aux` code.
    Trap,
}

impl SsaOp {
    /// Is this opcode a block terminator?
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            SsaOp::Jump | SsaOp::Brif | SsaOp::BrTable | SsaOp::Ret | SsaOp::Trap
        )
    }

    /// Is this a call?
    pub fn is_call(self) -> bool {
        matches!(self, SsaOp::StaticCall | SsaOp::ClosureCall)
    }

    /// Can this value be recomputed anywhere instead of being spilled?
    pub fn is_rematerializable(self) -> bool {
        matches!(
            self,
            SsaOp::ConstInt
                | SsaOp::ConstBool
                | SsaOp::LocalAddr
                | SsaOp::FuncAddr
                | SsaOp::PinnedReg
        )
    }

    /// Does this value produce a result that must live in a register?
    pub fn needs_register(self) -> bool {
        !matches!(
            self,
            SsaOp::Store
                | SsaOp::StoreReg
                | SsaOp::Move
                | SsaOp::Jump
                | SsaOp::Brif
                | SsaOp::BrTable
                | SsaOp::Ret
                | SsaOp::Trap
        )
    }

    /// Does this opcode write memory or affect control flow, pinning it in
    /// place even when its result is unused? Plain loads are not included;
    /// an unused load is dead.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            SsaOp::Store
                | SsaOp::StaticCall
                | SsaOp::ClosureCall
                | SsaOp::StoreReg
                | SsaOp::Move
        ) || self.is_terminator()
    }
}

/// Branch likelihood hint carried in `aux_int` of a `Brif`.
pub mod branch_hint {
    /// No hint.
    pub const NONE: i64 = 0;
    /// The then-edge is likely.
    pub const THEN_LIKELY: i64 = 1;
    /// The else-edge is likely.
    pub const ELSE_LIKELY: i64 = 2;
}

/// Auxiliary tagged data of a value.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Aux {
    /// Nothing.
    #[default]
    None,
    /// Condition code of an `Icmp`.
    Cond(IntCC),
    /// Callee of a call or the function of a `FuncAddr`.
    Func(FuncId),
    /// Index into the function's string literal pool.
    Str(u32),
    /// Branch targets.
    Targets(SmallVec<[BlockId; 2]>),
    /// Trap code.
    Trap(TrapCode),
}

/// Where allocation has placed a value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Home {
    /// Not yet assigned.
    #[default]
    None,
    /// A physical register.
    Reg(u8),
    /// A frame offset.
    Stack(i32),
}

/// One SSA value: an operation, its operands, and bookkeeping.
#[derive(Clone, Debug)]
pub struct ValueData {
    /// The operation.
    pub op: SsaOp,
    /// The type of the produced value.
    pub ty: TypeId,
    /// Operand values.
    pub args: SmallVec<[ValueId; 3]>,
    /// Auxiliary integer data: constants, offsets, indices, byte counts.
    pub aux_int: i64,
    /// Auxiliary tagged data.
    pub aux: Aux,
    /// Number of uses, maintained by the `Func` mutators.
    pub uses: u32,
    /// Source position, for diagnostics.
    pub pos: u32,
    /// Home assigned by register/stack allocation.
    pub home: Home,
}

impl ValueData {
    /// A plain value with no auxiliary data.
    pub fn new(op: SsaOp, ty: TypeId, args: impl IntoIterator<Item = ValueId>) -> Self {
        Self {
            op,
            ty,
            args: args.into_iter().collect(),
            aux_int: 0,
            aux: Aux::None,
            uses: 0,
            pos: 0,
            home: Home::None,
        }
    }

    /// Attach an auxiliary integer.
    pub fn with_aux_int(mut self, aux_int: i64) -> Self {
        self.aux_int = aux_int;
        self
    }

    /// Attach tagged auxiliary data.
    pub fn with_aux(mut self, aux: Aux) -> Self {
        self.aux = aux;
        self
    }

    /// The branch targets, if this is a branch.
    pub fn targets(&self) -> &[BlockId] {
        match &self.aux {
            Aux::Targets(t) => t,
            _ => &[],
        }
    }
}

/// A basic block: an ordered sequence of values plus its predecessors.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    /// The values of this block, in schedule order. The last value of a
    /// complete block is a terminator.
    pub values: Vec<ValueId>,
    /// Predecessor blocks, in the order phi arguments are listed.
    pub preds: Vec<BlockId>,
}

/// A declared local variable slot.
#[derive(Clone, Debug)]
pub struct LocalData {
    /// The type stored in the slot.
    pub ty: TypeId,
}

/// A function in low SSA form.
#[derive(Clone, Debug)]
pub struct Func {
    /// Mangled symbol name.
    pub name: String,
    /// Parameter types.
    pub params: Vec<TypeId>,
    /// Return types.
    pub returns: Vec<TypeId>,
    /// All blocks. Block 0 is the entry.
    pub blocks: PrimaryMap<BlockId, BlockData>,
    /// All values.
    pub values: PrimaryMap<ValueId, ValueData>,
    /// Declared locals, in declaration order.
    pub locals: Vec<LocalData>,
    /// String literal pool.
    pub strings: Vec<Vec<u8>>,
    /// The function receives a VM-context pointer as its first ABI
    /// argument; the prologue parks it in the pinned register.
    pub vmctx_param: bool,
}

impl Func {
    /// Create an empty function.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: Vec::new(),
            blocks: PrimaryMap::new(),
            values: PrimaryMap::new(),
            locals: Vec::new(),
            strings: Vec::new(),
            vmctx_param: false,
        }
    }

    /// The entry block.
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    /// Create a new empty block.
    pub fn create_block(&mut self) -> BlockId {
        self.blocks.push(BlockData::default())
    }

    /// Record that `pred` branches to `block`. Phi arguments in `block`
    /// align with the resulting predecessor order.
    pub fn add_pred(&mut self, block: BlockId, pred: BlockId) {
        self.blocks[block].preds.push(pred);
    }

    /// Intern a string literal, returning its pool index.
    pub fn intern_string(&mut self, bytes: impl Into<Vec<u8>>) -> u32 {
        let bytes = bytes.into();
        if let Some(i) = self.strings.iter().position(|s| *s == bytes) {
            return i as u32;
        }
        self.strings.push(bytes);
        (self.strings.len() - 1) as u32
    }

    /// Append a value to `block`, bumping the use counts of its arguments.
    pub fn append(&mut self, block: BlockId, data: ValueData) -> ValueId {
        for &arg in &data.args {
            self.values[arg].uses += 1;
        }
        let v = self.values.push(data);
        self.blocks[block].values.push(v);
        v
    }

    /// Insert a value at position `index` of `block`.
    pub fn insert(&mut self, block: BlockId, index: usize, data: ValueData) -> ValueId {
        for &arg in &data.args {
            self.values[arg].uses += 1;
        }
        let v = self.values.push(data);
        self.blocks[block].values.insert(index, v);
        v
    }

    /// Create a value without scheduling it in any block. The caller is
    /// responsible for splicing it into a block's value list.
    pub fn make_value(&mut self, data: ValueData) -> ValueId {
        for &arg in &data.args {
            self.values[arg].uses += 1;
        }
        self.values.push(data)
    }

    /// Replace argument `index` of `value`, maintaining use counts.
    pub fn set_arg(&mut self, value: ValueId, index: usize, new_arg: ValueId) {
        let old = self.values[value].args[index];
        if old == new_arg {
            return;
        }
        self.values[old].uses = self.values[old].uses.saturating_sub(1);
        self.values[new_arg].uses += 1;
        self.values[value].args[index] = new_arg;
    }

    /// Replace every use of `old` in `value`'s argument list with `new`.
    pub fn replace_uses_in(&mut self, value: ValueId, old: ValueId, new_arg: ValueId) {
        for i in 0..self.values[value].args.len() {
            if self.values[value].args[i] == old {
                self.set_arg(value, i, new_arg);
            }
        }
    }

    /// The terminator of `block`, if the block is complete.
    pub fn terminator(&self, block: BlockId) -> Option<ValueId> {
        let last = *self.blocks[block].values.last()?;
        self.values[last].op.is_terminator().then_some(last)
    }

    /// The successor blocks of `block`.
    pub fn succs(&self, block: BlockId) -> SmallVec<[BlockId; 2]> {
        match self.terminator(block) {
            Some(t) => SmallVec::from_slice(self.values[t].targets()),
            None => SmallVec::new(),
        }
    }

    /// Blocks in reverse postorder from the entry.
    pub fn postorder(&self) -> Vec<BlockId> {
        let mut seen = vec![false; self.blocks.len()];
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry(), 0)];
        seen[self.entry().index()] = true;
        while let Some((block, next)) = stack.last().copied() {
            let succs = self.succs(block);
            if next < succs.len() {
                stack.last_mut().unwrap().1 += 1;
                let s = succs[next];
                if !seen[s.index()] {
                    seen[s.index()] = true;
                    stack.push((s, 0));
                }
            } else {
                order.push(block);
                stack.pop();
            }
        }
        order
    }

    /// A human readable display of the whole function.
    pub fn display<'a>(&'a self, types: &'a TypeRegistry) -> DisplayFunc<'a> {
        DisplayFunc { func: self, types }
    }
}

/// Remove side-effect-free values whose results are unused, repeating until
/// nothing more falls out.
pub(crate) fn sweep_dead(func: &mut Func) {
    loop {
        let mut removed = false;
        for block in func.blocks.keys().collect::<Vec<_>>() {
            let dead: Vec<ValueId> = func.blocks[block]
                .values
                .iter()
                .copied()
                .filter(|&v| {
                    let data = &func.values[v];
                    data.uses == 0 && !data.op.has_side_effects() && data.op != SsaOp::Phi
                })
                .collect();
            for v in dead {
                let args: SmallVec<[ValueId; 3]> = func.values[v].args.clone();
                for a in args {
                    func.values[a].uses = func.values[a].uses.saturating_sub(1);
                }
                func.blocks[block].values.retain(|&x| x != v);
                removed = true;
            }
        }
        if !removed {
            break;
        }
    }
}

/// Wrapper for pretty-printing a low SSA function.
pub struct DisplayFunc<'a> {
    func: &'a Func,
    types: &'a TypeRegistry,
}

impl fmt::Display for DisplayFunc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let func = self.func;
        writeln!(f, "func {}:", func.name)?;
        for block in func.blocks.keys() {
            write!(f, "{}", block)?;
            if !func.blocks[block].preds.is_empty() {
                write!(f, " ; preds:")?;
                for p in &func.blocks[block].preds {
                    write!(f, " {}", p)?;
                }
            }
            writeln!(f, ":")?;
            for &v in &func.blocks[block].values {
                let data = &func.values[v];
                write!(f, "    {} = {:?}", v, data.op)?;
                for a in &data.args {
                    write!(f, " {}", a)?;
                }
                if data.aux_int != 0 {
                    write!(f, " #{}", data.aux_int)?;
                }
                match &data.aux {
                    Aux::None => {}
                    Aux::Cond(cc) => write!(f, " {}", cc)?,
                    Aux::Func(id) => write!(f, " {}", id)?,
                    Aux::Str(s) => write!(f, " str{}", s)?,
                    Aux::Targets(ts) => {
                        for t in ts {
                            write!(f, " -> {}", t)?;
                        }
                    }
                    Aux::Trap(code) => write!(f, " {}", code)?,
                }
                match data.home {
                    Home::None => {}
                    Home::Reg(r) => write!(f, " [r{}]", r)?,
                    Home::Stack(off) => write!(f, " [sp{:+}]", off)?,
                }
                writeln!(f, " ; {} uses, {}", data.uses, self.types.size_of(data.ty))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_sizes() {
        let mut reg = TypeRegistry::new();
        assert_eq!(reg.size_of(reg.i64()), 8);
        assert_eq!(reg.size_of(reg.str()), 16);
        assert_eq!(reg.align_of(reg.str()), 8);
        let pair = reg.make_struct(vec![reg.i8(), reg.i64()]);
        assert_eq!(reg.align_of(pair), 8);
        assert_eq!(reg.size_of(pair), 16);
        assert_eq!(reg.field_offset(pair, 1), 8);
    }

    #[test]
    fn use_counts() {
        let types = TypeRegistry::new();
        let mut func = Func::new("t");
        let b = func.create_block();
        let c = func.append(
            b,
            ValueData::new(SsaOp::ConstInt, types.i64(), []).with_aux_int(3),
        );
        let add = func.append(b, ValueData::new(SsaOp::Iadd, types.i64(), [c, c]));
        assert_eq!(func.values[c].uses, 2);
        let c2 = func.append(
            b,
            ValueData::new(SsaOp::ConstInt, types.i64(), []).with_aux_int(4),
        );
        func.set_arg(add, 1, c2);
        assert_eq!(func.values[c].uses, 1);
        assert_eq!(func.values[c2].uses, 1);
    }

    #[test]
    fn postorder_simple_diamond() {
        let types = TypeRegistry::new();
        let mut func = Func::new("d");
        let entry = func.create_block();
        let then_b = func.create_block();
        let else_b = func.create_block();
        let join = func.create_block();
        let c = func.append(
            entry,
            ValueData::new(SsaOp::ConstBool, types.bool(), []).with_aux_int(1),
        );
        func.append(
            entry,
            ValueData::new(SsaOp::Brif, types.bool(), [c])
                .with_aux(Aux::Targets(smallvec::smallvec![then_b, else_b])),
        );
        for b in [then_b, else_b] {
            func.append(
                b,
                ValueData::new(SsaOp::Jump, types.bool(), [])
                    .with_aux(Aux::Targets(smallvec::smallvec![join])),
            );
            func.add_pred(join, b);
        }
        func.append(join, ValueData::new(SsaOp::Ret, types.bool(), []));
        func.add_pred(then_b, entry);
        func.add_pred(else_b, entry);
        let po = func.postorder();
        assert_eq!(po.len(), 4);
        // The entry is last in postorder.
        assert_eq!(*po.last().unwrap(), entry);
        // The join comes before either branch arm.
        let pos = |b: BlockId| po.iter().position(|x| *x == b).unwrap();
        assert!(pos(join) < pos(then_b));
        assert!(pos(join) < pos(else_b));
    }
}
