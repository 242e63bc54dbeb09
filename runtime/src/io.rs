//! libc I/O shims.
//!
//! Most of these forward their arguments untouched; `fd_open` copies the
//! path into a stack buffer to null-terminate it, and `time` converts a
//! `timeval` into nanoseconds.

use crate::{import_libc, make_func};
use cot_codegen::ir::types::{I64, I8};
use cot_codegen::ir::{Function, MemFlags, StackSlotData};
use cot_frontend::{FunctionBuilder, FunctionBuilderContext};

/// Generate the I/O shims.
pub fn generate() -> Vec<Function> {
    vec![
        forward("fd_write", "write", 3, 1),
        forward("fd_read", "read", 3, 1),
        forward("fd_close", "close", 1, 1),
        forward("fd_seek", "lseek", 3, 1),
        forward("random", "getentropy", 2, 1),
        forward("exit", "_exit", 1, 0),
        memset_zero(),
        fd_open(),
        time(),
    ]
}

fn flags() -> MemFlags {
    MemFlags::trusted()
}

/// A straight argument pass-through to a libc function.
fn forward(name: &str, libc_name: &str, params: usize, returns: usize) -> Function {
    let mut func = make_func(name, params, returns);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let target = import_libc(&mut b, libc_name, params, returns);

    let entry = b.create_block();
    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let args = b.block_params(entry).to_vec();
    let call = b.ins().call(target, &args);
    if returns > 0 {
        let result = b.single_result(call);
        b.ins().return_(&[result]);
    } else {
        b.ins().return_(&[]);
    }

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `memset_zero(ptr, size)`: clear a region.
fn memset_zero() -> Function {
    let mut func = make_func("memset_zero", 2, 0);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let memset = import_libc(&mut b, "memset", 3, 1);

    let entry = b.create_block();
    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let (ptr, size) = (b.block_params(entry)[0], b.block_params(entry)[1]);
    let zero = b.ins().iconst(I64, 0);
    b.ins().call(memset, &[ptr, zero, size]);
    b.ins().return_(&[]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `fd_open(path_ptr, path_len, flags) -> fd`: null-terminate the path in
/// a stack buffer and open with mode 0666.
fn fd_open() -> Function {
    let mut func = make_func("fd_open", 3, 1);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let memcpy = import_libc(&mut b, "memcpy", 3, 1);
    let open = import_libc(&mut b, "open", 3, 1);
    let slot = b.create_stack_slot(StackSlotData::new(1024, 4));

    let entry = b.create_block();
    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let params = b.block_params(entry).to_vec();
    let (path_ptr, path_len, open_flags) = (params[0], params[1], params[2]);

    let buf = b.ins().stack_addr(slot, 0);
    b.ins().call(memcpy, &[buf, path_ptr, path_len]);
    let terminator_at = b.ins().iadd(buf, path_len);
    let nul = b.ins().iconst(I8, 0);
    b.ins().store(flags(), nul, terminator_at, 0);
    let mode = b.ins().iconst(I64, 0o666);
    let call = b.ins().call(open, &[buf, open_flags, mode]);
    let fd = b.single_result(call);
    b.ins().return_(&[fd]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `time() -> ns`: `gettimeofday` scaled to nanoseconds.
fn time() -> Function {
    let mut func = make_func("time", 0, 1);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let gettimeofday = import_libc(&mut b, "gettimeofday", 2, 1);
    let slot = b.create_stack_slot(StackSlotData::new(16, 3));

    let entry = b.create_block();
    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);

    let tv = b.ins().stack_addr(slot, 0);
    let null = b.ins().iconst(I64, 0);
    b.ins().call(gettimeofday, &[tv, null]);
    let sec = b.ins().load(I64, flags(), tv, 0);
    let usec = b.ins().load(I64, flags(), tv, 8);
    let billion = b.ins().iconst(I64, 1_000_000_000);
    let sec_ns = b.ins().imul(sec, billion);
    let thousand = b.ins().iconst(I64, 1_000);
    let usec_ns = b.ins().imul(usec, thousand);
    let ns = b.ins().iadd(sec_ns, usec_ns);
    b.ins().return_(&[ns]);

    b.seal_all_blocks();
    b.finalize();
    func
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_keep_their_externs() {
        let pairs = [
            ("fd_write", "write"),
            ("fd_read", "read"),
            ("fd_close", "close"),
            ("fd_seek", "lseek"),
            ("random", "getentropy"),
            ("exit", "_exit"),
        ];
        for (func, (name, libc_name)) in generate().iter().zip(pairs) {
            assert_eq!(func.name.as_str(), name);
            assert!(
                format!("{}", func.display()).contains(&format!("%{}", libc_name)),
                "{} should call {}",
                name,
                libc_name
            );
        }
    }

    #[test]
    fn fd_open_null_terminates() {
        let func = fd_open();
        let text = format!("{}", func.display());
        assert!(text.contains("explicit_slot 1024"), "{}", text);
        assert!(text.contains("%memcpy"), "{}", text);
        assert!(text.contains("%open"), "{}", text);
        // The 0666 mode constant.
        assert!(text.contains(&format!(" {}", 0o666)), "{}", text);
    }

    #[test]
    fn time_scales_to_nanoseconds() {
        let func = time();
        let text = format!("{}", func.display());
        assert!(text.contains("1000000000"), "{}", text);
        assert!(text.contains("%gettimeofday"), "{}", text);
    }
}
