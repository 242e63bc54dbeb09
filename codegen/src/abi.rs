//! Calling-convention parameter and result assignment.
//!
//! The same assignment shape serves both platforms: walk parameters left to
//! right, handing out integer registers while they last, then 8-byte
//! aligned stack slots. A 16-byte aggregate takes a consecutive register
//! pair when two registers remain; wider aggregates travel by address and
//! never reach this table.

use crate::ssa::{TypeData, TypeId, TypeRegistry};
use smallvec::SmallVec;

/// Where one ABI-level argument lives.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ABIArg {
    /// A single register.
    Reg {
        /// The register number.
        reg: u8,
    },
    /// Two consecutive registers carrying a 16-byte aggregate.
    Pair {
        /// Low half.
        lo: u8,
        /// High half.
        hi: u8,
    },
    /// A stack slot at `offset` from the incoming argument area.
    Stack {
        /// Byte offset.
        offset: u32,
    },
}

/// A computed ABI signature.
#[derive(Clone, Debug)]
pub struct ABISig {
    /// One entry per source-level parameter.
    pub params: SmallVec<[ABIArg; 6]>,
    /// One entry per source-level result.
    pub rets: SmallVec<[ABIArg; 2]>,
    /// Bytes of outgoing stack argument space the caller provides.
    pub stack_bytes: u32,
    /// The result does not fit registers and is returned through a hidden
    /// pointer parameter in the first argument register.
    pub ret_by_pointer: bool,
}

fn is_pair(types: &TypeRegistry, ty: TypeId) -> bool {
    matches!(types.data(ty), TypeData::Str | TypeData::Slice { .. })
        || types.size_of(ty) > 8 && types.size_of(ty) <= 16
}

/// Compute the ABI assignment of a signature for a platform with the given
/// argument and result registers.
pub fn compute_sig(
    params: &[TypeId],
    returns: &[TypeId],
    types: &TypeRegistry,
    arg_regs: &[u8],
    ret_regs: &[u8],
) -> ABISig {
    let mut next_reg = 0usize;
    let mut stack_offset = 0u32;
    let mut out_params: SmallVec<[ABIArg; 6]> = SmallVec::new();

    let mut ret_by_pointer = false;
    let ret_size: u32 = returns.iter().map(|&ty| types.size_of(ty)).sum();
    if ret_size > 16 {
        // The hidden return pointer consumes the first argument register.
        ret_by_pointer = true;
        next_reg = 1;
    }

    for &ty in params {
        let size = types.size_of(ty);
        if is_pair(types, ty) {
            if next_reg + 2 <= arg_regs.len() {
                out_params.push(ABIArg::Pair {
                    lo: arg_regs[next_reg],
                    hi: arg_regs[next_reg + 1],
                });
                next_reg += 2;
            } else {
                let align = types.align_of(ty).max(8);
                stack_offset = crate::ssa::align_up(stack_offset, align);
                out_params.push(ABIArg::Stack {
                    offset: stack_offset,
                });
                stack_offset += 16;
            }
        } else if size <= 8 && next_reg < arg_regs.len() {
            out_params.push(ABIArg::Reg {
                reg: arg_regs[next_reg],
            });
            next_reg += 1;
        } else {
            let align = types.align_of(ty).max(8);
            stack_offset = crate::ssa::align_up(stack_offset, align);
            out_params.push(ABIArg::Stack {
                offset: stack_offset,
            });
            stack_offset += crate::ssa::align_up(size.max(8), 8);
        }
    }

    let mut rets: SmallVec<[ABIArg; 2]> = SmallVec::new();
    if ret_by_pointer {
        rets.push(ABIArg::Reg { reg: ret_regs[0] });
    } else {
        let mut next_ret = 0usize;
        for &ty in returns {
            if is_pair(types, ty) {
                rets.push(ABIArg::Pair {
                    lo: ret_regs[next_ret],
                    hi: ret_regs[next_ret + 1],
                });
                next_ret += 2;
            } else {
                rets.push(ABIArg::Reg {
                    reg: ret_regs[next_ret],
                });
                next_ret += 1;
            }
        }
    }

    ABISig {
        params: out_params,
        rets,
        stack_bytes: crate::ssa::align_up(stack_offset, 16),
        ret_by_pointer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{aarch64, x64};

    fn match_reg(arg: &ABIArg, expected: u8) {
        match arg {
            ABIArg::Reg { reg } => assert_eq!(*reg, expected),
            other => panic!("expected register argument, got {:?}", other),
        }
    }

    fn match_stack(arg: &ABIArg, expected: u32) {
        match arg {
            ABIArg::Stack { offset } => assert_eq!(*offset, expected),
            other => panic!("expected stack argument, got {:?}", other),
        }
    }

    #[test]
    fn aarch64_first_eight_in_registers() {
        let types = TypeRegistry::new();
        let params = vec![types.i64(); 9];
        let sig = compute_sig(
            &params,
            &[],
            &types,
            aarch64::regs::ARG_REGS,
            aarch64::regs::RET_REGS,
        );
        for (i, p) in sig.params.iter().take(8).enumerate() {
            match_reg(p, i as u8);
        }
        match_stack(&sig.params[8], 0);
        assert_eq!(sig.stack_bytes, 16);
    }

    #[test]
    fn sysv_six_then_stack() {
        let types = TypeRegistry::new();
        let params = vec![types.i64(); 8];
        let sig = compute_sig(
            &params,
            &[],
            &types,
            x64::regs::ARG_REGS,
            x64::regs::RET_REGS,
        );
        // rdi, rsi, rdx, rcx, r8, r9 then the stack.
        for (p, &r) in sig.params.iter().zip(x64::regs::ARG_REGS) {
            match_reg(p, r);
        }
        match_stack(&sig.params[6], 0);
        match_stack(&sig.params[7], 8);
    }

    #[test]
    fn string_takes_a_register_pair() {
        let types = TypeRegistry::new();
        let sig = compute_sig(
            &[types.str(), types.i64()],
            &[types.i64()],
            &types,
            aarch64::regs::ARG_REGS,
            aarch64::regs::RET_REGS,
        );
        assert_eq!(sig.params[0], ABIArg::Pair { lo: 0, hi: 1 });
        match_reg(&sig.params[1], 2);
        match_reg(&sig.rets[0], 0);
    }

    #[test]
    fn oversized_return_goes_by_pointer() {
        let mut types = TypeRegistry::new();
        let i64t = types.i64();
        let big = types.make_struct(vec![i64t; 4]);
        let sig = compute_sig(
            &[types.i64()],
            &[big],
            &types,
            x64::regs::ARG_REGS,
            x64::regs::RET_REGS,
        );
        assert!(sig.ret_by_pointer);
        // The hidden pointer displaces the first parameter to rsi.
        match_reg(&sig.params[0], x64::regs::RSI);
        match_reg(&sig.rets[0], x64::regs::RAX);
    }
}
