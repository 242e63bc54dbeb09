//! Result and error types of compilation.

/// An error produced while compiling a function.
///
/// Invariant violations in the input SSA are programmer errors and panic
/// instead; this type covers the structural failures a driver is expected
/// to report to the user.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The input uses an operation the backend does not support.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A code size limit was exceeded (e.g. a branch went out of range).
    #[error("code too large")]
    CodeTooLarge,
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error.
pub type CodegenResult<T> = Result<T, CodegenError>;
