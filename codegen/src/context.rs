//! The per-function compilation context: the pass pipeline from low SSA to
//! machine code.

use crate::binemit::RelocEntry;
use crate::isa::TargetIsa;
use crate::regalloc;
use crate::regalloc::stackalloc;
use crate::result::CodegenResult;
use crate::ssa::{self, Func, FuncTable, TypeRegistry};

/// The finished machine code of one function.
#[derive(Debug)]
pub struct CompiledCode {
    /// The symbol name of the function.
    pub name: String,
    /// The encoded bytes.
    pub bytes: Vec<u8>,
    /// Relocations against external symbols and literals.
    pub relocs: Vec<RelocEntry>,
    /// Total frame size, a multiple of 16.
    pub frame_size: u32,
    /// The function's string literal pool, referenced by `Literal`
    /// relocations.
    pub literals: Vec<Vec<u8>>,
}

/// Compilation context. Holds no state between functions; one context can
/// compile any number of functions sequentially.
pub struct Context;

impl Context {
    /// Create a compilation context.
    pub fn new() -> Self {
        Self
    }

    /// Compile `func` to machine code for `isa`.
    ///
    /// The function is consumed in the sense that the passes rewrite it in
    /// place; callers that need the original must clone first.
    pub fn compile(
        &mut self,
        func: &mut Func,
        types: &TypeRegistry,
        funcs: &FuncTable,
        isa: &dyn TargetIsa,
    ) -> CodegenResult<CompiledCode> {
        log::debug!("compiling {} for {}", func.name, isa.name());

        ssa::decompose(func, types);
        ssa::expand_calls(func, types);
        regalloc::split_critical_edges(func);
        let live = ssa::compute_liveness(func);
        let alloc = regalloc::allocate(func, &live, isa.regs());
        let frame = stackalloc::layout_frame(func, types, &live, &alloc);

        let mut buffer = isa.lower(func, types, funcs, &frame)?;
        buffer.finish();
        let (bytes, relocs) = buffer.into_parts();

        Ok(CompiledCode {
            name: func.name.clone(),
            bytes,
            relocs,
            frame_size: frame.frame_size,
            literals: func.strings.clone(),
        })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
