//! AMD64 lowering: drive the encoder from allocated low SSA.
//!
//! The two-address forms write the destination first (`mov dst, lhs` then
//! `op dst, rhs`); the register allocator keeps destinations away from live
//! operands so the pattern is safe. rdx:rax for division and rcx for
//! variable shifts were likewise claimed during allocation.

use super::emit::{self, Alu, OperandSize, Shift, CC};
use super::regs::{ARG_REGS, PINNED, RAX, RBP, RCX, RDX, RET_REGS, RSP, TEMP};
use crate::binemit::{CodeBuffer, FixupKind, Label, Reloc, RelocTarget};
use crate::entity::EntityRef;
use crate::regalloc::stackalloc::FrameLayout;
use crate::result::CodegenResult;
use crate::ssa::{Aux, BlockId, Func, FuncTable, Home, SsaOp, TypeRegistry, ValueId};

/// Lower `func` to AMD64 machine code.
pub(crate) fn lower(
    func: &Func,
    types: &TypeRegistry,
    funcs: &FuncTable,
    frame: &FrameLayout,
) -> CodegenResult<CodeBuffer> {
    let mut order = func.postorder();
    order.reverse();

    let mut l = Lowerer {
        func,
        types,
        funcs,
        frame,
        buf: CodeBuffer::new(),
        labels: Vec::new(),
    };
    for _ in 0..func.blocks.len() {
        let label = l.buf.create_label();
        l.labels.push(label);
    }

    l.prologue();
    for (i, &block) in order.iter().enumerate() {
        l.buf.bind_label(l.labels[block.index()]);
        let next = order.get(i + 1).copied();
        for &v in &func.blocks[block].values {
            l.emit_value(v, next)?;
        }
    }
    Ok(l.buf)
}

struct Lowerer<'a> {
    func: &'a Func,
    types: &'a TypeRegistry,
    funcs: &'a FuncTable,
    frame: &'a FrameLayout,
    buf: CodeBuffer,
    labels: Vec<Label>,
}

impl<'a> Lowerer<'a> {
    fn reg(&self, v: ValueId) -> u8 {
        match self.func.values[v].home {
            Home::Reg(r) => r,
            home => panic!("{} has no register home: {:?}", v, home),
        }
    }

    /// Is this value's type handled with 32-bit operations?
    fn is32(&self, v: ValueId) -> bool {
        self.types.size_of(self.func.values[v].ty) <= 4
    }

    fn const64(&mut self, dst: u8, value: i64) {
        if value == 0 {
            emit::xor_zero(&mut self.buf, dst);
        } else if (i32::MIN as i64..=i32::MAX as i64).contains(&value) {
            emit::mov_ri32(&mut self.buf, dst, value as i32);
        } else {
            emit::mov_ri64(&mut self.buf, dst, value as u64);
        }
    }

    /// A frame offset (as assigned by the stack allocator) translated to an
    /// rsp displacement: the saved rbp/return pair lives at the top of the
    /// frame here, so offsets shift down by 16.
    fn rsp_disp(&self, offset: i32) -> i32 {
        offset - 16
    }

    fn prologue(&mut self) {
        emit::push_r(&mut self.buf, RBP);
        emit::mov_rr(&mut self.buf, RBP, RSP);
        let adjust = self.frame.frame_size as i32 - 16;
        if adjust > 0 {
            emit::alu_ri(&mut self.buf, Alu::Sub, RSP, adjust);
        }
        let saves: Vec<(u8, i32)> = self
            .frame
            .saved_regs
            .iter()
            .copied()
            .zip(self.frame.saved_offsets.iter().copied())
            .collect();
        for (r, off) in saves {
            let disp = self.rsp_disp(off);
            emit::store(&mut self.buf, OperandSize::S64, r, RSP, disp);
        }
        if self.func.vmctx_param {
            emit::mov_rr(&mut self.buf, PINNED, ARG_REGS[0]);
        }
    }

    fn epilogue(&mut self) {
        let saves: Vec<(u8, i32)> = self
            .frame
            .saved_regs
            .iter()
            .copied()
            .zip(self.frame.saved_offsets.iter().copied())
            .collect();
        for (r, off) in saves {
            let disp = self.rsp_disp(off);
            emit::load(&mut self.buf, OperandSize::S64, r, RSP, disp);
        }
        let adjust = self.frame.frame_size as i32 - 16;
        if adjust > 0 {
            emit::alu_ri(&mut self.buf, Alu::Add, RSP, adjust);
        }
        emit::pop_r(&mut self.buf, RBP);
        emit::ret(&mut self.buf);
    }

    /// Register-to-register parallel move; cycles go through the temp.
    fn parallel_move(&mut self, moves: &[(u8, u8)]) {
        let mut pending: Vec<(u8, u8)> = moves
            .iter()
            .copied()
            .filter(|&(dst, src)| dst != src)
            .collect();
        while !pending.is_empty() {
            if let Some(i) = pending
                .iter()
                .position(|&(dst, _)| !pending.iter().any(|&(_, s)| s == dst))
            {
                let (dst, src) = pending.remove(i);
                emit::mov_rr(&mut self.buf, dst, src);
            } else {
                let (dst, src) = pending.remove(0);
                emit::mov_rr(&mut self.buf, TEMP, src);
                pending.push((dst, TEMP));
            }
        }
    }

    fn branch_to(&mut self, target: BlockId) {
        let at = emit::jmp_rel32(&mut self.buf);
        self.buf
            .use_label_at_offset(at, self.labels[target.index()], FixupKind::PcRel32);
    }

    fn cond_branch_to(&mut self, cc: CC, target: BlockId) {
        let at = emit::jcc_rel32(&mut self.buf, cc);
        self.buf
            .use_label_at_offset(at, self.labels[target.index()], FixupKind::PcRel32);
    }

    fn mem_size(&self, bytes: u32) -> OperandSize {
        match bytes {
            1 => OperandSize::S8,
            2 => OperandSize::S16,
            4 => OperandSize::S32,
            _ => OperandSize::S64,
        }
    }

    fn emit_call(&mut self, v: ValueId) -> CodegenResult<()> {
        let data = self.func.values[v].clone();
        let (callee_reg, args): (Option<u8>, &[ValueId]) = match data.op {
            SsaOp::ClosureCall => (Some(self.reg(data.args[0])), &data.args[1..]),
            _ => (None, &data.args[..]),
        };

        let arg_tys: Vec<_> = args.iter().map(|&a| self.func.values[a].ty).collect();
        let sig = crate::abi::compute_sig(&arg_tys, &[], self.types, ARG_REGS, RET_REGS);
        let pad = sig.stack_bytes as i32;
        if pad > 0 {
            emit::alu_ri(&mut self.buf, Alu::Sub, RSP, pad);
        }
        let mut moves: Vec<(u8, u8)> = Vec::new();
        for (abi, &a) in sig.params.iter().zip(args) {
            match *abi {
                crate::abi::ABIArg::Reg { reg } => moves.push((reg, self.reg(a))),
                crate::abi::ABIArg::Stack { offset } => {
                    let src = self.reg(a);
                    emit::store(&mut self.buf, OperandSize::S64, src, RSP, offset as i32);
                }
                crate::abi::ABIArg::Pair { .. } => {
                    unreachable!("aggregates are decomposed before lowering")
                }
            }
        }
        self.parallel_move(&moves);

        match callee_reg {
            Some(r) => emit::call_r(&mut self.buf, r),
            None => {
                let id = match data.aux {
                    Aux::Func(id) => id,
                    _ => panic!("static call without a callee"),
                };
                let name = self.funcs.funcs[id].name.clone();
                let at = emit::call_rel32(&mut self.buf);
                self.buf.add_reloc_at_offset(
                    at,
                    Reloc::X86CallPCRel4,
                    RelocTarget::Symbol(name),
                    -4,
                );
            }
        }
        if pad > 0 {
            emit::alu_ri(&mut self.buf, Alu::Add, RSP, pad);
        }
        Ok(())
    }

    fn emit_value(&mut self, v: ValueId, next: Option<BlockId>) -> CodegenResult<()> {
        let data = self.func.values[v].clone();
        let narrow = self.is32(v);
        match data.op {
            SsaOp::Phi | SsaOp::StringMake | SsaOp::SliceMake | SsaOp::SelectN => {}
            SsaOp::Arg => {
                let dst = self.reg(v);
                let index = data.aux_int as usize;
                if index < ARG_REGS.len() {
                    if dst != ARG_REGS[index] {
                        emit::mov_rr(&mut self.buf, dst, ARG_REGS[index]);
                    }
                } else {
                    // Just above the saved return address.
                    let disp =
                        self.frame.frame_size as i32 - 16 + 16 + ((index - ARG_REGS.len()) * 8) as i32;
                    emit::load(&mut self.buf, OperandSize::S64, dst, RSP, disp);
                }
            }
            SsaOp::ConstInt => {
                let dst = self.reg(v);
                self.const64(dst, data.aux_int);
            }
            SsaOp::ConstBool => {
                let dst = self.reg(v);
                if data.aux_int != 0 {
                    emit::mov_ri32(&mut self.buf, dst, 1);
                } else {
                    emit::xor_zero(&mut self.buf, dst);
                }
            }
            SsaOp::ConstStr => {
                let dst = self.reg(v);
                let pool = match data.aux {
                    Aux::Str(s) => s,
                    _ => panic!("const_str without a pool reference"),
                };
                let at = emit::lea_rip(&mut self.buf, dst);
                self.buf.add_reloc_at_offset(
                    at,
                    Reloc::X86PCRel4,
                    RelocTarget::Literal(pool),
                    -4,
                );
            }
            SsaOp::FuncAddr => {
                let dst = self.reg(v);
                let id = match data.aux {
                    Aux::Func(id) => id,
                    _ => panic!("func_addr without a function"),
                };
                let name = self.funcs.funcs[id].name.clone();
                let at = emit::lea_rip(&mut self.buf, dst);
                self.buf.add_reloc_at_offset(
                    at,
                    Reloc::X86PCRel4,
                    RelocTarget::Symbol(name),
                    -4,
                );
            }
            SsaOp::PinnedReg => {
                let dst = self.reg(v);
                emit::mov_rr(&mut self.buf, dst, PINNED);
            }
            SsaOp::Iadd | SsaOp::Isub | SsaOp::Band | SsaOp::Bor | SsaOp::Bxor => {
                let (dst, a, b) = (self.reg(v), self.reg(data.args[0]), self.reg(data.args[1]));
                if dst != a {
                    emit::mov_rr(&mut self.buf, dst, a);
                }
                let op = match data.op {
                    SsaOp::Iadd => Alu::Add,
                    SsaOp::Isub => Alu::Sub,
                    SsaOp::Band => Alu::And,
                    SsaOp::Bor => Alu::Or,
                    _ => Alu::Xor,
                };
                if narrow {
                    emit::alu_rr32(&mut self.buf, op, dst, b);
                } else {
                    emit::alu_rr(&mut self.buf, op, dst, b);
                }
            }
            SsaOp::Imul => {
                let (dst, a, b) = (self.reg(v), self.reg(data.args[0]), self.reg(data.args[1]));
                if dst != a {
                    emit::mov_rr(&mut self.buf, dst, a);
                }
                if narrow {
                    emit::imul_rr32(&mut self.buf, dst, b);
                } else {
                    emit::imul_rr(&mut self.buf, dst, b);
                }
            }
            SsaOp::Sdiv | SsaOp::Srem | SsaOp::Udiv | SsaOp::Urem => {
                let (a, b) = (self.reg(data.args[0]), self.reg(data.args[1]));
                debug_assert!(b != RAX && b != RDX, "divisor may not alias rdx:rax");
                if a != RAX {
                    emit::mov_rr(&mut self.buf, RAX, a);
                }
                let signed = matches!(data.op, SsaOp::Sdiv | SsaOp::Srem);
                if signed {
                    if narrow {
                        emit::cdq(&mut self.buf);
                    } else {
                        emit::cqo(&mut self.buf);
                    }
                    if narrow {
                        emit::idiv32(&mut self.buf, b);
                    } else {
                        emit::idiv(&mut self.buf, b);
                    }
                } else {
                    emit::xor_zero(&mut self.buf, RDX);
                    if narrow {
                        emit::div32(&mut self.buf, b);
                    } else {
                        emit::div(&mut self.buf, b);
                    }
                }
                // Quotient in rax, remainder in rdx; the allocator pinned
                // the result home accordingly.
                let dst = self.reg(v);
                debug_assert!(
                    (matches!(data.op, SsaOp::Sdiv | SsaOp::Udiv) && dst == RAX)
                        || (matches!(data.op, SsaOp::Srem | SsaOp::Urem) && dst == RDX)
                );
            }
            SsaOp::Bnot => {
                let (dst, a) = (self.reg(v), self.reg(data.args[0]));
                if dst != a {
                    emit::mov_rr(&mut self.buf, dst, a);
                }
                if self.types.size_of(data.ty) == 1 {
                    emit::alu_ri32(&mut self.buf, Alu::Xor, dst, 1);
                } else if narrow {
                    emit::not_r32(&mut self.buf, dst);
                } else {
                    emit::not_r(&mut self.buf, dst);
                }
            }
            SsaOp::Ishl | SsaOp::Sshr | SsaOp::Ushr | SsaOp::Rotl | SsaOp::Rotr => {
                let (dst, a, b) = (self.reg(v), self.reg(data.args[0]), self.reg(data.args[1]));
                if b != RCX {
                    emit::mov_rr(&mut self.buf, RCX, b);
                }
                if dst != a {
                    emit::mov_rr(&mut self.buf, dst, a);
                }
                let op = match data.op {
                    SsaOp::Ishl => Shift::Shl,
                    SsaOp::Sshr => Shift::Sar,
                    SsaOp::Ushr => Shift::Shr,
                    SsaOp::Rotl => Shift::Rol,
                    _ => Shift::Ror,
                };
                if narrow {
                    emit::shift_cl32(&mut self.buf, op, dst);
                } else {
                    emit::shift_cl(&mut self.buf, op, dst);
                }
            }
            SsaOp::Icmp => {
                let (dst, a, b) = (self.reg(v), self.reg(data.args[0]), self.reg(data.args[1]));
                let cc = match data.aux {
                    Aux::Cond(cc) => CC::from(cc),
                    _ => panic!("icmp without a condition"),
                };
                if self.is32(data.args[0]) {
                    emit::alu_rr32(&mut self.buf, Alu::Cmp, a, b);
                } else {
                    emit::alu_rr(&mut self.buf, Alu::Cmp, a, b);
                }
                emit::setcc(&mut self.buf, cc, dst);
                emit::movzx(&mut self.buf, 8, dst, dst);
            }
            SsaOp::Select => {
                let (dst, c) = (self.reg(v), self.reg(data.args[0]));
                let (t, e) = (self.reg(data.args[1]), self.reg(data.args[2]));
                emit::test_rr(&mut self.buf, c, c);
                if dst != e {
                    emit::mov_rr(&mut self.buf, dst, e);
                }
                emit::cmovcc(&mut self.buf, CC::Nz, dst, t);
            }
            SsaOp::Sext => {
                let (dst, a) = (self.reg(v), self.reg(data.args[0]));
                let from_bits = (self.types.size_of(self.func.values[data.args[0]].ty) * 8) as u8;
                if from_bits >= 64 {
                    if dst != a {
                        emit::mov_rr(&mut self.buf, dst, a);
                    }
                } else {
                    emit::movsx(&mut self.buf, from_bits, dst, a);
                }
            }
            SsaOp::Uext => {
                let (dst, a) = (self.reg(v), self.reg(data.args[0]));
                let from_bits = (self.types.size_of(self.func.values[data.args[0]].ty) * 8) as u8;
                if from_bits >= 64 {
                    if dst != a {
                        emit::mov_rr(&mut self.buf, dst, a);
                    }
                } else {
                    emit::movzx(&mut self.buf, from_bits, dst, a);
                }
            }
            SsaOp::Trunc => {
                let (dst, a) = (self.reg(v), self.reg(data.args[0]));
                let to_bits = (self.types.size_of(data.ty) * 8) as u8;
                if to_bits >= 64 {
                    if dst != a {
                        emit::mov_rr(&mut self.buf, dst, a);
                    }
                } else {
                    emit::movzx(&mut self.buf, to_bits.min(32), dst, a);
                }
            }
            SsaOp::Load => {
                let (dst, base) = (self.reg(v), self.reg(data.args[0]));
                let size = self.mem_size(self.types.size_of(data.ty));
                emit::load(&mut self.buf, size, dst, base, data.aux_int as i32);
            }
            SsaOp::Store => {
                let (base, src) = (self.reg(data.args[0]), self.reg(data.args[1]));
                let size = self.mem_size(self.types.size_of(self.func.values[data.args[1]].ty));
                emit::store(&mut self.buf, size, src, base, data.aux_int as i32);
            }
            SsaOp::LocalAddr => {
                let dst = self.reg(v);
                let disp = self.rsp_disp(self.frame.local(data.aux_int as usize));
                emit::lea(&mut self.buf, dst, RSP, disp);
            }
            SsaOp::StringPtr | SsaOp::StringLen | SsaOp::SlicePtr | SsaOp::SliceLen => {
                let dst = self.reg(v);
                let composed = &self.func.values[data.args[0]];
                let part = if matches!(data.op, SsaOp::StringPtr | SsaOp::SlicePtr) {
                    0
                } else {
                    1
                };
                let src = self.reg(composed.args[part]);
                if dst != src {
                    emit::mov_rr(&mut self.buf, dst, src);
                }
            }
            SsaOp::StaticCall | SsaOp::ClosureCall => self.emit_call(v)?,
            SsaOp::Copy => {
                let (dst, src) = (self.reg(v), self.reg(data.args[0]));
                if dst != src {
                    emit::mov_rr(&mut self.buf, dst, src);
                }
            }
            SsaOp::StoreReg => {
                let src = self.reg(v);
                let disp = self.rsp_disp(self.frame.spill(data.aux_int as u32));
                emit::store(&mut self.buf, OperandSize::S64, src, RSP, disp);
            }
            SsaOp::LoadReg => {
                let dst = self.reg(v);
                let disp = self.rsp_disp(self.frame.spill(data.aux_int as u32));
                emit::load(&mut self.buf, OperandSize::S64, dst, RSP, disp);
            }
            SsaOp::Move => {
                let (dst, src) = (self.reg(data.args[0]), self.reg(data.args[1]));
                let len = data.aux_int;
                let mut off: i32 = 0;
                while (off as i64) + 8 <= len {
                    emit::load(&mut self.buf, OperandSize::S64, TEMP, src, off);
                    emit::store(&mut self.buf, OperandSize::S64, TEMP, dst, off);
                    off += 8;
                }
                while (off as i64) < len {
                    emit::load(&mut self.buf, OperandSize::S8, TEMP, src, off);
                    emit::store(&mut self.buf, OperandSize::S8, TEMP, dst, off);
                    off += 1;
                }
            }
            SsaOp::Jump => {
                let target = data.targets()[0];
                if next != Some(target) {
                    self.branch_to(target);
                }
            }
            SsaOp::Brif => {
                let c = self.reg(data.args[0]);
                let (then_b, else_b) = (data.targets()[0], data.targets()[1]);
                emit::test_rr(&mut self.buf, c, c);
                if next == Some(then_b) {
                    self.cond_branch_to(CC::Z, else_b);
                } else {
                    self.cond_branch_to(CC::Nz, then_b);
                    if next != Some(else_b) {
                        self.branch_to(else_b);
                    }
                }
            }
            SsaOp::BrTable => {
                let idx = self.reg(data.args[0]);
                let targets = data.targets().to_vec();
                let (cases, default) = targets.split_at(targets.len() - 1);
                for (k, &target) in cases.iter().enumerate() {
                    emit::alu_ri(&mut self.buf, Alu::Cmp, idx, k as i32);
                    self.cond_branch_to(CC::Z, target);
                }
                self.branch_to(default[0]);
            }
            SsaOp::Ret => {
                let moves: Vec<(u8, u8)> = data
                    .args
                    .iter()
                    .enumerate()
                    .map(|(k, &a)| (RET_REGS[k], self.reg(a)))
                    .collect();
                self.parallel_move(&moves);
                self.epilogue();
            }
            SsaOp::Trap => {
                emit::ud2(&mut self.buf);
            }
        }
        Ok(())
    }
}
