//! Performs translation from WebAssembly operators into CLIF.
//!
//! The translator maintains the wasm operand stack as a stack of CLIF
//! values and the structured control flow as a stack of frames; structural
//! problems in the input surface as `WasmError` rather than panics.

#![warn(missing_docs)]

mod state;
mod translator;

pub use crate::state::{ControlStackFrame, FuncTranslationState};
pub use crate::translator::{translate_operator, FuncTranslator};

/// A WebAssembly translation error.
///
/// These are structural problems in the input; the driver reports them to
/// the user. Programmer errors inside the translator panic instead.
#[derive(Debug, thiserror::Error)]
pub enum WasmError {
    /// An operator consumed more values than the stack held.
    #[error("value stack underflow")]
    StackUnderflow,

    /// The values at a region's `end` do not match its declared results.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A control region was never closed, or a branch named a depth with
    /// no frame.
    #[error("unbalanced control flow")]
    MissingEnd,

    /// A local index with no declared local.
    #[error("reference to undeclared local {0}")]
    BadLocal(u32),

    /// The input uses a feature outside the supported subset.
    #[error("unsupported wasm: {0}")]
    Unsupported(String),
}

/// A convenient alias for a `Result` that uses `WasmError` as the error.
pub type WasmResult<T> = Result<T, WasmError>;
