//! Instruction set architectures.
//!
//! Each ISA contributes its register bank description, its ABI assignment
//! rules, its instruction encoder, and the lowering that drives the encoder
//! from allocated SSA.

pub mod aarch64;
pub mod x64;

use crate::binemit::CodeBuffer;
use crate::regalloc::stackalloc::FrameLayout;
use crate::result::CodegenResult;
use crate::ssa::{Func, FuncTable, TypeRegistry};
use std::fmt;
use target_lexicon::{Architecture, Triple};

/// Which ISA family a register bank belongs to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IsaKind {
    /// ARM64 / AAPCS64.
    Aarch64,
    /// AMD64 / System V.
    X64,
}

/// The register facts an ISA feeds to the register allocator.
///
/// Registers are named by their hardware encoding number; masks are bitmaps
/// over those numbers.
#[derive(Clone, Debug)]
pub struct RegBank {
    /// The ISA family, for the allocator's architecture-specific operand
    /// constraints.
    pub kind: IsaKind,
    /// Registers the allocator may hand out.
    pub allocatable: u32,
    /// Registers any call may clobber.
    pub caller_saved: u32,
    /// Registers a callee must preserve.
    pub callee_saved: u32,
    /// Integer argument registers, in ABI order.
    pub arg_regs: &'static [u8],
    /// Integer result registers, in ABI order.
    pub ret_regs: &'static [u8],
    /// Scratch register reserved for shuffle cycles and address
    /// materialization; never allocatable.
    pub temp: u8,
    /// The pinned VM-context register; never allocatable.
    pub pinned: u8,
}

impl RegBank {
    /// Is `reg` in `mask`?
    pub fn mask_contains(mask: u32, reg: u8) -> bool {
        mask & (1 << reg) != 0
    }

    /// Iterate the registers of `mask`, lowest number first.
    pub fn mask_regs(mask: u32) -> impl Iterator<Item = u8> {
        (0u8..32).filter(move |r| mask & (1 << r) != 0)
    }
}

/// A trait representing commonalities between the supported instruction set
/// architectures.
pub trait TargetIsa: Send + Sync {
    /// Get the name of the ISA.
    fn name(&self) -> &'static str;

    /// Get the target triple of the ISA.
    fn triple(&self) -> &Triple;

    /// The register facts of this ISA.
    fn regs(&self) -> &RegBank;

    /// Lower an allocated function to machine code.
    fn lower(
        &self,
        func: &Func,
        types: &TypeRegistry,
        funcs: &FuncTable,
        frame: &FrameLayout,
    ) -> CodegenResult<CodeBuffer>;
}

impl fmt::Debug for &dyn TargetIsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target ISA {{ triple: {:?} }}", self.triple())
    }
}

/// An error looking up an ISA for a triple.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// There is no backend for the requested architecture.
    #[error("this target is not supported")]
    Unsupported,
}

/// Look up the ISA for the given target triple.
pub fn lookup(triple: Triple) -> Result<Box<dyn TargetIsa>, LookupError> {
    match triple.architecture {
        Architecture::X86_64 => Ok(Box::new(x64::isa_from(triple))),
        Architecture::Aarch64 { .. } => Ok(Box::new(aarch64::isa_from(triple))),
        _ => Err(LookupError::Unsupported),
    }
}
