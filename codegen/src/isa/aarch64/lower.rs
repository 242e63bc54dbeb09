//! ARM64 lowering: drive the encoder from allocated low SSA.
//!
//! Every value carries its register home by the time lowering runs; this
//! walk emits one short instruction sequence per value and never revisits
//! allocation decisions.

use super::emit::{self, Cond};
use super::regs::{ARG_REGS, FP, LR, PINNED, RET_REGS, SP, TEMP, XZR};
use crate::binemit::{CodeBuffer, FixupKind, Label, Reloc, RelocTarget};
use crate::entity::EntityRef;
use crate::regalloc::stackalloc::FrameLayout;
use crate::result::CodegenResult;
use crate::ssa::{Aux, BlockId, Func, FuncTable, Home, SsaOp, TypeRegistry, ValueId};

/// Lower `func` to ARM64 machine code.
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
    fn put(&mut self, insn: u32) {
        self.buf.put4(insn);
    }

    fn reg(&self, v: ValueId) -> u8 {
        match self.func.values[v].home {
            Home::Reg(r) => r,
            home => panic!("{} has no register home: {:?}", v, home),
        }
    }

    /// Emit a 64-bit constant via MOVZ/MOVN and MOVK.
    fn const64(&mut self, dst: u8, value: i64) {
        let uval = value as u64;
        let chunks: [u16; 4] = std::array::from_fn(|i| (uval >> (i * 16)) as u16);
        let zero_chunks = chunks.iter().filter(|&&c| c == 0).count();
        let ones_chunks = chunks.iter().filter(|&&c| c == 0xFFFF).count();
        if ones_chunks > zero_chunks {
            // Mostly-ones values start from MOVN.
            let first = chunks.iter().position(|&c| c != 0xFFFF).unwrap_or(0);
            self.put(emit::movn(dst, !chunks[first], first as u8));
            for (i, &c) in chunks.iter().enumerate() {
                if i != first && c != 0xFFFF {
                    self.put(emit::movk(dst, c, i as u8));
                }
            }
        } else {
            let first = chunks.iter().position(|&c| c != 0).unwrap_or(0);
            self.put(emit::movz(dst, chunks[first], first as u8));
            for (i, &c) in chunks.iter().enumerate() {
                if i != first && c != 0 {
                    self.put(emit::movk(dst, c, i as u8));
                }
            }
        }
    }

    /// Is this value's type handled in a W register?
    fn is32(&self, v: ValueId) -> bool {
        self.types.size_of(self.func.values[v].ty) <= 4
    }

    fn sized(&self, insn: u32, narrow: bool) -> u32 {
        if narrow {
            emit::w_form(insn)
        } else {
            insn
        }
    }

    /// Load or store `rt` at `[sp + offset]`, detouring through the temp
    /// register when the scaled immediate does not reach.
    fn frame_mem(&mut self, rt: u8, offset: i32, is_load: bool) {
        debug_assert!(offset >= 0);
        if offset % 8 == 0 && (offset / 8) < 4096 {
            self.put(emit::ldst64(rt, SP, offset as u16, is_load));
        } else {
            self.const64(TEMP, offset as i64);
            self.put(emit::add_ext(TEMP, SP, TEMP));
            self.put(emit::ldst64(rt, TEMP, 0, is_load));
        }
    }

    /// A register-offset memory operand `[base + offset]` for sized loads
    /// and stores.
    fn mem(&mut self, size: u32, rt: u8, base: u8, offset: i64, is_load: bool) {
        let scaled_max = 4096 * size as i64;
        if offset >= 0 && offset % size as i64 == 0 && offset < scaled_max {
            let off = offset as u16;
            let insn = match size {
                1 => emit::ldst8(rt, base, off, is_load),
                2 => emit::ldst16(rt, base, off, is_load),
                4 => emit::ldst32(rt, base, off, is_load),
                8 => emit::ldst64(rt, base, off, is_load),
                _ => unreachable!("unsized access"),
            };
            self.put(insn);
        } else {
            self.const64(TEMP, offset);
            self.put(emit::add_reg(TEMP, base, TEMP, false));
            let insn = match size {
                1 => emit::ldst8(rt, TEMP, 0, is_load),
                2 => emit::ldst16(rt, TEMP, 0, is_load),
                4 => emit::ldst32(rt, TEMP, 0, is_load),
                _ => emit::ldst64(rt, TEMP, 0, is_load),
            };
            self.put(insn);
        }
    }

    fn prologue(&mut self) {
        let size = self.frame.frame_size;
        if size <= 504 {
            self.put(emit::stp_pre(FP, LR, SP, -((size / 8) as i16)));
        } else {
            if size < 4096 {
                self.put(emit::sub_imm(SP, SP, size as u16, false));
            } else {
                self.const64(TEMP, size as i64);
                self.put(emit::sub_ext(SP, SP, TEMP));
            }
            self.put(emit::ldp_stp(
                FP,
                LR,
                SP,
                0,
                emit::PairMode::SignedOffset,
                false,
            ));
        }
        // MOV X29, SP.
        self.put(emit::add_imm(FP, SP, 0, false));
        let saves: Vec<(u8, i32)> = self
            .frame
            .saved_regs
            .iter()
            .copied()
            .zip(self.frame.saved_offsets.iter().copied())
            .collect();
        for (r, off) in saves {
            self.frame_mem(r, off, false);
        }
        if self.func.vmctx_param {
            self.put(emit::mov_reg(PINNED, ARG_REGS[0]));
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
            self.frame_mem(r, off, true);
        }
        let size = self.frame.frame_size;
        if size <= 504 {
            self.put(emit::ldp_post(FP, LR, SP, (size / 8) as i16));
        } else {
            self.put(emit::ldp_stp(
                FP,
                LR,
                SP,
                0,
                emit::PairMode::SignedOffset,
                true,
            ));
            self.const64(TEMP, size as i64);
            self.put(emit::add_ext(SP, SP, TEMP));
        }
        self.put(emit::ret(LR));
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
                self.put(emit::mov_reg(dst, src));
            } else {
                let (dst, src) = pending.remove(0);
                self.put(emit::mov_reg(TEMP, src));
                pending.push((dst, TEMP));
            }
        }
    }

    fn branch_to(&mut self, target: BlockId) {
        let at = self.buf.cur_offset();
        self.buf.put4(emit::b(0));
        self.buf
            .use_label_at_offset(at, self.labels[target.index()], FixupKind::Branch26);
    }

    fn cond_branch_to(&mut self, insn: u32, target: BlockId) {
        let at = self.buf.cur_offset();
        self.buf.put4(insn);
        self.buf
            .use_label_at_offset(at, self.labels[target.index()], FixupKind::Branch19);
    }

    fn emit_call(&mut self, v: ValueId) -> CodegenResult<()> {
        let data = self.func.values[v].clone();
        let (callee_reg, args): (Option<u8>, &[ValueId]) = match data.op {
            SsaOp::ClosureCall => (Some(self.reg(data.args[0])), &data.args[1..]),
            _ => (None, &data.args[..]),
        };

        let arg_tys: Vec<_> = args.iter().map(|&a| self.func.values[a].ty).collect();
        let sig = crate::abi::compute_sig(&arg_tys, &[], self.types, ARG_REGS, RET_REGS);
        let pad = sig.stack_bytes;
        if pad > 0 {
            self.put(emit::sub_imm(SP, SP, pad as u16, false));
        }
        let mut moves: Vec<(u8, u8)> = Vec::new();
        for (abi, &a) in sig.params.iter().zip(args) {
            match *abi {
                crate::abi::ABIArg::Reg { reg } => moves.push((reg, self.reg(a))),
                crate::abi::ABIArg::Stack { offset } => {
                    let src = self.reg(a);
                    self.put(emit::ldst64(src, SP, offset as u16, false));
                }
                crate::abi::ABIArg::Pair { .. } => {
                    unreachable!("aggregates are decomposed before lowering")
                }
            }
        }
        self.parallel_move(&moves);

        match callee_reg {
            Some(r) => self.put(emit::blr(r)),
            None => {
                let id = match data.aux {
                    Aux::Func(id) => id,
                    _ => panic!("static call without a callee"),
                };
                let name = self.funcs.funcs[id].name.clone();
                let at = self.buf.cur_offset();
                self.buf.put4(emit::bl(0));
                self.buf
                    .add_reloc_at_offset(at, Reloc::Arm64Call, RelocTarget::Symbol(name), 0);
            }
        }
        if pad > 0 {
            self.put(emit::add_imm(SP, SP, pad as u16, false));
        }
        Ok(())
    }

    /// Materialize the address of `target` (a symbol or literal) into
    /// `dst` via an ADRP/ADD pair with paired relocations.
    fn symbol_addr(&mut self, dst: u8, target: RelocTarget) {
        let at = self.buf.cur_offset();
        self.buf.put4(emit::adrp(dst, 0));
        self.buf
            .add_reloc_at_offset(at, Reloc::Aarch64AdrpPage21, target.clone(), 0);
        let at = self.buf.cur_offset();
        self.buf.put4(emit::add_imm(dst, dst, 0, false));
        self.buf
            .add_reloc_at_offset(at, Reloc::Aarch64AddAbsLo12, target, 0);
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
                        self.put(emit::mov_reg(dst, ARG_REGS[index]));
                    }
                } else {
                    let off =
                        self.frame.frame_size as i32 + ((index - ARG_REGS.len()) * 8) as i32;
                    self.frame_mem(dst, off, true);
                }
            }
            SsaOp::ConstInt => {
                let dst = self.reg(v);
                self.const64(dst, data.aux_int);
            }
            SsaOp::ConstBool => {
                let dst = self.reg(v);
                self.put(emit::movz(dst, (data.aux_int != 0) as u16, 0));
            }
            SsaOp::ConstStr => {
                let dst = self.reg(v);
                let pool = match data.aux {
                    Aux::Str(s) => s,
                    _ => panic!("const_str without a pool reference"),
                };
                self.symbol_addr(dst, RelocTarget::Literal(pool));
            }
            SsaOp::FuncAddr => {
                let dst = self.reg(v);
                let id = match data.aux {
                    Aux::Func(id) => id,
                    _ => panic!("func_addr without a function"),
                };
                let name = self.funcs.funcs[id].name.clone();
                self.symbol_addr(dst, RelocTarget::Symbol(name));
            }
            SsaOp::PinnedReg => {
                let dst = self.reg(v);
                self.put(emit::mov_reg(dst, PINNED));
            }
            SsaOp::Iadd | SsaOp::Isub | SsaOp::Imul => {
                let (dst, a, b) = (self.reg(v), self.reg(data.args[0]), self.reg(data.args[1]));
                let insn = match data.op {
                    SsaOp::Iadd => emit::add_reg(dst, a, b, false),
                    SsaOp::Isub => emit::sub_reg(dst, a, b, false),
                    _ => emit::mul(dst, a, b),
                };
                self.put(self.sized(insn, narrow));
            }
            SsaOp::Sdiv | SsaOp::Udiv => {
                let (dst, a, b) = (self.reg(v), self.reg(data.args[0]), self.reg(data.args[1]));
                // The hardware quietly returns 0 on division by zero; trap
                // instead, as the source semantics demand.
                self.put(emit::cbz_cbnz(b, 2, true));
                self.put(emit::brk(1));
                let insn = if data.op == SsaOp::Sdiv {
                    emit::sdiv(dst, a, b)
                } else {
                    emit::udiv(dst, a, b)
                };
                self.put(self.sized(insn, narrow));
            }
            SsaOp::Srem | SsaOp::Urem => {
                let (dst, a, b) = (self.reg(v), self.reg(data.args[0]), self.reg(data.args[1]));
                self.put(emit::cbz_cbnz(b, 2, true));
                self.put(emit::brk(1));
                let div = if data.op == SsaOp::Srem {
                    emit::sdiv(TEMP, a, b)
                } else {
                    emit::udiv(TEMP, a, b)
                };
                self.put(self.sized(div, narrow));
                self.put(self.sized(emit::msub(dst, TEMP, b, a), narrow));
            }
            SsaOp::Band | SsaOp::Bor | SsaOp::Bxor => {
                let (dst, a, b) = (self.reg(v), self.reg(data.args[0]), self.reg(data.args[1]));
                let insn = match data.op {
                    SsaOp::Band => emit::and_reg(dst, a, b),
                    SsaOp::Bor => emit::orr_reg(dst, a, b),
                    _ => emit::eor_reg(dst, a, b),
                };
                self.put(self.sized(insn, narrow));
            }
            SsaOp::Bnot => {
                let (dst, a) = (self.reg(v), self.reg(data.args[0]));
                if self.types.size_of(data.ty) == 1 {
                    // Boolean not: flip bit zero.
                    self.put(emit::movz(TEMP, 1, 0));
                    self.put(emit::eor_reg(dst, a, TEMP));
                } else {
                    self.put(self.sized(emit::orn_reg(dst, XZR, a), narrow));
                }
            }
            SsaOp::Ishl | SsaOp::Sshr | SsaOp::Ushr | SsaOp::Rotr => {
                let (dst, a, b) = (self.reg(v), self.reg(data.args[0]), self.reg(data.args[1]));
                let insn = match data.op {
                    SsaOp::Ishl => emit::lslv(dst, a, b),
                    SsaOp::Sshr => emit::asrv(dst, a, b),
                    SsaOp::Ushr => emit::lsrv(dst, a, b),
                    _ => emit::rorv(dst, a, b),
                };
                self.put(self.sized(insn, narrow));
            }
            SsaOp::Rotl => {
                // ROL x, n == ROR x, width - n.
                let (dst, a, b) = (self.reg(v), self.reg(data.args[0]), self.reg(data.args[1]));
                self.put(self.sized(emit::sub_reg(TEMP, XZR, b, false), narrow));
                self.put(self.sized(emit::rorv(dst, a, TEMP), narrow));
            }
            SsaOp::Icmp => {
                let (dst, a, b) = (self.reg(v), self.reg(data.args[0]), self.reg(data.args[1]));
                let cc = match data.aux {
                    Aux::Cond(cc) => cc,
                    _ => panic!("icmp without a condition"),
                };
                let cmp = emit::cmp_reg(a, b);
                let narrow_args = self.is32(data.args[0]);
                self.put(self.sized(cmp, narrow_args));
                self.put(emit::cset(dst, Cond::from(cc)));
            }
            SsaOp::Select => {
                let (dst, c) = (self.reg(v), self.reg(data.args[0]));
                let (t, e) = (self.reg(data.args[1]), self.reg(data.args[2]));
                self.put(emit::sub_imm(XZR, c, 0, true)); // CMP c, #0
                self.put(emit::csel(dst, t, e, Cond::Ne));
            }
            SsaOp::Sext => {
                let (dst, a) = (self.reg(v), self.reg(data.args[0]));
                let from_bits = (self.types.size_of(self.func.values[data.args[0]].ty) * 8) as u8;
                if from_bits >= 64 {
                    self.put(emit::mov_reg(dst, a));
                } else {
                    self.put(emit::sxt(dst, a, from_bits));
                }
            }
            SsaOp::Uext => {
                let (dst, a) = (self.reg(v), self.reg(data.args[0]));
                let from_bits = (self.types.size_of(self.func.values[data.args[0]].ty) * 8) as u8;
                if from_bits >= 64 {
                    self.put(emit::mov_reg(dst, a));
                } else {
                    self.put(emit::uxt(dst, a, from_bits));
                }
            }
            SsaOp::Trunc => {
                let (dst, a) = (self.reg(v), self.reg(data.args[0]));
                let to_bits = (self.types.size_of(data.ty) * 8) as u8;
                if to_bits >= 64 {
                    self.put(emit::mov_reg(dst, a));
                } else {
                    self.put(emit::uxt(dst, a, to_bits));
                }
            }
            SsaOp::Load => {
                let (dst, base) = (self.reg(v), self.reg(data.args[0]));
                let size = self.types.size_of(data.ty);
                self.mem(size, dst, base, data.aux_int, true);
            }
            SsaOp::Store => {
                let (base, src) = (self.reg(data.args[0]), self.reg(data.args[1]));
                let size = self.types.size_of(self.func.values[data.args[1]].ty);
                self.mem(size, src, base, data.aux_int, false);
            }
            SsaOp::LocalAddr => {
                let dst = self.reg(v);
                let off = self.frame.local(data.aux_int as usize);
                if off < 4096 {
                    self.put(emit::add_imm(dst, SP, off as u16, false));
                } else {
                    self.const64(dst, off as i64);
                    self.put(emit::add_ext(dst, SP, dst));
                }
            }
            SsaOp::StringPtr | SsaOp::StringLen | SsaOp::SlicePtr | SsaOp::SliceLen => {
                // A leftover extractor sees through to its composition's
                // component register.
                let dst = self.reg(v);
                let composed = &self.func.values[data.args[0]];
                let part = if matches!(data.op, SsaOp::StringPtr | SsaOp::SlicePtr) {
                    0
                } else {
                    1
                };
                let src = self.reg(composed.args[part]);
                if dst != src {
                    self.put(emit::mov_reg(dst, src));
                }
            }
            SsaOp::StaticCall | SsaOp::ClosureCall => self.emit_call(v)?,
            SsaOp::Copy => {
                let (dst, src) = (self.reg(v), self.reg(data.args[0]));
                if dst != src {
                    self.put(emit::mov_reg(dst, src));
                }
            }
            SsaOp::StoreReg => {
                let src = self.reg(v);
                let off = self.frame.spill(data.aux_int as u32);
                self.frame_mem(src, off, false);
            }
            SsaOp::LoadReg => {
                let dst = self.reg(v);
                let off = self.frame.spill(data.aux_int as u32);
                self.frame_mem(dst, off, true);
            }
            SsaOp::Move => {
                let (dst, src) = (self.reg(data.args[0]), self.reg(data.args[1]));
                let len = data.aux_int;
                let mut off: i64 = 0;
                while off + 8 <= len {
                    self.put(emit::ldst64(TEMP, src, off as u16, true));
                    self.put(emit::ldst64(TEMP, dst, off as u16, false));
                    off += 8;
                }
                while off < len {
                    self.put(emit::ldst8(TEMP, src, off as u16, true));
                    self.put(emit::ldst8(TEMP, dst, off as u16, false));
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
                if next == Some(then_b) {
                    self.cond_branch_to(emit::cbz_cbnz(c, 0, false), else_b);
                } else {
                    self.cond_branch_to(emit::cbz_cbnz(c, 0, true), then_b);
                    if next != Some(else_b) {
                        self.branch_to(else_b);
                    }
                }
            }
            SsaOp::BrTable => {
                let idx = self.reg(data.args[0]);
                let targets = data.targets();
                let (cases, default) = targets.split_at(targets.len() - 1);
                for (k, &target) in cases.iter().enumerate() {
                    self.put(emit::sub_imm(XZR, idx, k as u16, true)); // CMP idx, #k
                    self.cond_branch_to(emit::b_cond(Cond::Eq, 0), target);
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
                self.put(emit::brk(0));
            }
        }
        Ok(())
    }
}
