//! Native code generation for the Cot compiler.
//!
//! The backend consumes the front end's low SSA (or CLIF built through
//! `cot-frontend`, bridged by `ssa::func_from_clif`) and produces
//! relocatable machine code for AMD64 and ARM64. The pipeline per function:
//! aggregate decomposition, call expansion, liveness, linear-scan register
//! allocation, frame layout, and per-ISA lowering into a code buffer.

#![warn(missing_docs)]

pub mod entity;

pub mod abi;
pub mod binemit;
pub mod context;
pub mod ir;
pub mod isa;
pub mod regalloc;
pub mod result;
pub mod ssa;

pub use crate::context::{CompiledCode, Context};
pub use crate::result::{CodegenError, CodegenResult};
