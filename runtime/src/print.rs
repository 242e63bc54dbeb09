//! Decimal integer printing.
//!
//! Digits are produced right-to-left into a small stack buffer, then
//! written in one `write` call. The trailing newline is the caller's
//! business.

use crate::{import_libc, make_func};
use cot_codegen::ir::condcodes::IntCC;
use cot_codegen::ir::types::{I64, I8};
use cot_codegen::ir::{Function, MemFlags, StackSlotData};
use cot_frontend::{FunctionBuilder, FunctionBuilderContext};

/// Generate the three print functions.
pub fn generate() -> Vec<Function> {
    vec![
        print_int_to("print_int", 1),
        print_int_to("eprint_int", 2),
        int_to_string(),
    ]
}

fn flags() -> MemFlags {
    MemFlags::trusted()
}

/// `print_int(val)` / `eprint_int(val)`: decimal digits to the given file
/// descriptor, sign first.
fn print_int_to(name: &str, fd: i64) -> Function {
    let mut func = make_func(name, 1, 0);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);
    let write = import_libc(&mut b, "write", 3, 1);
    let slot = b.create_stack_slot(StackSlotData::new(24, 3));

    let entry = b.create_block();
    let negative = b.create_block();
    let digits = b.create_block(); // param: magnitude
    let digit_loop = b.create_block(); // params: value, position
    let emit = b.create_block(); // param: first digit position

    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let val = b.block_params(entry)[0];
    let is_neg = b.ins().icmp_imm(IntCC::SignedLessThan, val, 0);
    b.ins().brif(is_neg, negative, &[], digits, &[val]);

    // Sign first: one byte, one write.
    b.switch_to_block(negative);
    let buf = b.ins().stack_addr(slot, 0);
    let minus = b.ins().iconst(I8, '-' as i64);
    b.ins().store(flags(), minus, buf, 23);
    let fd_val = b.ins().iconst(I64, fd);
    let sign_addr = b.ins().iadd_imm(buf, 23);
    let one = b.ins().iconst(I64, 1);
    b.ins().call(write, &[fd_val, sign_addr, one]);
    let zero = b.ins().iconst(I64, 0);
    let magnitude = b.ins().isub(zero, val);
    b.ins().jump(digits, &[magnitude]);

    b.switch_to_block(digits);
    let magnitude = b.append_block_param(digits, I64);
    let start = b.ins().iconst(I64, 22);
    b.ins().jump(digit_loop, &[magnitude, start]);

    // Divide by ten until nothing is left; the loop body runs at least
    // once so zero prints as "0".
    b.switch_to_block(digit_loop);
    let v = b.append_block_param(digit_loop, I64);
    let pos = b.append_block_param(digit_loop, I64);
    let buf = b.ins().stack_addr(slot, 0);
    let ten = b.ins().iconst(I64, 10);
    let digit = b.ins().urem(v, ten);
    let ch = b.ins().iadd_imm(digit, '0' as i64);
    let ch8 = b.ins().ireduce(I8, ch);
    let pos2 = b.ins().iadd_imm(pos, -1);
    let at = b.ins().iadd(buf, pos2);
    b.ins().store(flags(), ch8, at, 0);
    let v2 = b.ins().udiv(v, ten);
    let more = b.ins().icmp_imm(IntCC::NotEqual, v2, 0);
    b.ins().brif(more, digit_loop, &[v2, pos2], emit, &[pos2]);

    b.switch_to_block(emit);
    let first = b.append_block_param(emit, I64);
    let buf = b.ins().stack_addr(slot, 0);
    let addr = b.ins().iadd(buf, first);
    let end = b.ins().iconst(I64, 22);
    let len = b.ins().isub(end, first);
    let fd_val = b.ins().iconst(I64, fd);
    b.ins().call(write, &[fd_val, addr, len]);
    b.ins().return_(&[]);

    b.seal_all_blocks();
    b.finalize();
    func
}

/// `int_to_string(val, buf) -> len`: format into a caller-supplied 21-byte
/// buffer; the first character lands at `buf + 21 - len`.
fn int_to_string() -> Function {
    let mut func = make_func("int_to_string", 2, 1);
    let mut ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut ctx);

    let entry = b.create_block();
    let negative = b.create_block();
    let digits = b.create_block(); // params: magnitude, was_negative
    let digit_loop = b.create_block(); // params: value, position, was_negative
    let sign = b.create_block(); // params: position, was_negative
    let finish = b.create_block(); // param: position

    b.switch_to_block(entry);
    b.append_block_params_for_function_params(entry);
    let (val, buf) = (b.block_params(entry)[0], b.block_params(entry)[1]);
    let is_neg = b.ins().icmp_imm(IntCC::SignedLessThan, val, 0);
    let no = b.ins().iconst(I64, 0);
    b.ins().brif(is_neg, negative, &[], digits, &[val, no]);

    b.switch_to_block(negative);
    let zero = b.ins().iconst(I64, 0);
    let magnitude = b.ins().isub(zero, val);
    let yes = b.ins().iconst(I64, 1);
    b.ins().jump(digits, &[magnitude, yes]);

    b.switch_to_block(digits);
    let magnitude = b.append_block_param(digits, I64);
    let was_neg = b.append_block_param(digits, I64);
    let start = b.ins().iconst(I64, 21);
    b.ins().jump(digit_loop, &[magnitude, start, was_neg]);

    b.switch_to_block(digit_loop);
    let v = b.append_block_param(digit_loop, I64);
    let pos = b.append_block_param(digit_loop, I64);
    let was_neg = b.append_block_param(digit_loop, I64);
    let ten = b.ins().iconst(I64, 10);
    let digit = b.ins().urem(v, ten);
    let ch = b.ins().iadd_imm(digit, '0' as i64);
    let ch8 = b.ins().ireduce(I8, ch);
    let pos2 = b.ins().iadd_imm(pos, -1);
    let at = b.ins().iadd(buf, pos2);
    b.ins().store(flags(), ch8, at, 0);
    let v2 = b.ins().udiv(v, ten);
    let more = b.ins().icmp_imm(IntCC::NotEqual, v2, 0);
    b.ins()
        .brif(more, digit_loop, &[v2, pos2, was_neg], sign, &[pos2, was_neg]);

    b.switch_to_block(sign);
    let pos = b.append_block_param(sign, I64);
    let was_neg = b.append_block_param(sign, I64);
    let pos_minus = b.ins().iadd_imm(pos, -1);
    let minus_at = b.ins().iadd(buf, pos_minus);
    let minus = b.ins().iconst(I8, '-' as i64);
    let want_sign = b.ins().icmp_imm(IntCC::NotEqual, was_neg, 0);
    // Store the sign unconditionally below the digits, then keep it only
    // when it is wanted: pick the final position with a select.
    b.ins().store(flags(), minus, minus_at, 0);
    let final_pos = b.ins().select(want_sign, pos_minus, pos);
    b.ins().jump(finish, &[final_pos]);

    b.switch_to_block(finish);
    let pos = b.append_block_param(finish, I64);
    let total = b.ins().iconst(I64, 21);
    let len = b.ins().isub(total, pos);
    b.ins().return_(&[len]);

    b.seal_all_blocks();
    b.finalize();
    func
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_writes_to_the_right_descriptor() {
        let stdout = print_int_to("print_int", 1);
        let stderr = print_int_to("eprint_int", 2);
        assert!(format!("{}", stdout.display()).contains("%write"));
        assert!(format!("{}", stderr.display()).contains("%write"));
    }

    #[test]
    fn print_uses_a_24_byte_buffer() {
        let func = print_int_to("print_int", 1);
        let text = format!("{}", func.display());
        assert!(text.contains("explicit_slot 24"), "{}", text);
    }

    #[test]
    fn int_to_string_has_no_externs() {
        let func = int_to_string();
        assert!(func.dfg.ext_funcs.is_empty());
    }
}
