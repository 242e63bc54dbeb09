//! ARM64 (AAPCS64) backend.

pub mod emit;
mod lower;
pub mod regs;

use crate::binemit::CodeBuffer;
use crate::isa::{RegBank, TargetIsa};
use crate::regalloc::stackalloc::FrameLayout;
use crate::result::CodegenResult;
use crate::ssa::{Func, FuncTable, TypeRegistry};
use target_lexicon::Triple;

/// The ARM64 ISA.
pub struct Aarch64 {
    triple: Triple,
    regs: RegBank,
}

/// Create an ARM64 ISA for `triple`.
pub fn isa_from(triple: Triple) -> Aarch64 {
    Aarch64 {
        triple,
        regs: regs::bank(),
    }
}

impl TargetIsa for Aarch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn triple(&self) -> &Triple {
        &self.triple
    }

    fn regs(&self) -> &RegBank {
        &self.regs
    }

    fn lower(
        &self,
        func: &Func,
        types: &TypeRegistry,
        funcs: &FuncTable,
        frame: &FrameLayout,
    ) -> CodegenResult<CodeBuffer> {
        lower::lower(func, types, funcs, frame)
    }
}
