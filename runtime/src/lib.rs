//! Runtime support functions, generated as CLIF.
//!
//! Reference counting, string operations, decimal printing, and the libc
//! I/O shims are all built through the function builder and compiled by the
//! same pipeline as user code. Every function here ends up in the object
//! file exactly once, under the names the code generator calls.

#![warn(missing_docs)]

pub mod arc;
pub mod io;
pub mod print;

use cot_codegen::ir::{
    AbiParam, CallConv, ExtFuncData, ExternalName, FuncRef, Function, Signature,
};
use cot_codegen::ir::types::I64;
use cot_frontend::FunctionBuilder;

/// Generate every runtime support function.
pub fn generate() -> Vec<Function> {
    let mut out = Vec::new();
    out.extend(arc::generate());
    out.extend(print::generate());
    out.extend(io::generate());
    log::debug!("generated {} runtime functions", out.len());
    out
}

/// A signature of `params` i64 arguments and `returns` i64 results, in the
/// default calling convention.
pub(crate) fn sig_i64(params: usize, returns: usize) -> Signature {
    let mut sig = Signature::new(CallConv::SystemV);
    for _ in 0..params {
        sig.params.push(AbiParam::new(I64));
    }
    for _ in 0..returns {
        sig.returns.push(AbiParam::new(I64));
    }
    sig
}

/// Start a new runtime function.
pub(crate) fn make_func(name: &str, params: usize, returns: usize) -> Function {
    Function::with_name_signature(ExternalName::new(name), sig_i64(params, returns))
}

/// Import a libc function.
pub(crate) fn import_libc(
    builder: &mut FunctionBuilder,
    name: &str,
    params: usize,
    returns: usize,
) -> FuncRef {
    let sig = builder.import_signature(sig_i64(params, returns));
    builder.import_function(ExtFuncData {
        name: ExternalName::new(name),
        signature: sig,
        colocated: false,
    })
}

/// Import another runtime function; these live in the same object file.
pub(crate) fn import_runtime(
    builder: &mut FunctionBuilder,
    name: &str,
    params: usize,
    returns: usize,
) -> FuncRef {
    let sig = builder.import_signature(sig_i64(params, returns));
    builder.import_function(ExtFuncData {
        name: ExternalName::new(name),
        signature: sig,
        colocated: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_runtime_functions_are_generated() {
        let funcs = generate();
        let names: Vec<&str> = funcs.iter().map(|f| f.name.as_str()).collect();
        for expected in [
            "alloc",
            "dealloc",
            "retain",
            "release",
            "realloc",
            "string_concat",
            "string_eq",
            "unowned_retain",
            "unowned_release",
            "unowned_load_strong",
            "print_int",
            "eprint_int",
            "int_to_string",
            "fd_write",
            "fd_read",
            "fd_close",
            "fd_seek",
            "random",
            "exit",
            "memset_zero",
            "fd_open",
            "time",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
        assert_eq!(funcs.len(), 22);
    }

    #[test]
    fn every_function_is_terminated() {
        for func in generate() {
            for &block in &func.layout {
                assert!(func.is_filled(block), "{} has open {}", func.name, block);
            }
        }
    }
}
