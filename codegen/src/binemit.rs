//! Binary emission: the code buffer, label fixups, and relocations.

use std::fmt;

/// A label inside a function's code, bound to an offset once the target is
//  emitted.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Label(pub u32);

/// Relocation kinds understood by the object writer.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Reloc {
    /// Absolute 8-byte pointer.
    Abs8,
    /// ARM64 call/branch, 26-bit PC-relative word offset.
    Arm64Call,
    /// ARM64 ADRP page, 21 bits.
    Aarch64AdrpPage21,
    /// ARM64 ADD low 12 bits of an address.
    Aarch64AddAbsLo12,
    /// AMD64 call, 32-bit PC-relative.
    X86CallPCRel4,
    /// AMD64 RIP-relative 32-bit displacement.
    X86PCRel4,
}

/// What a relocation refers to.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RelocTarget {
    /// A named symbol: a compiled function or a libc extern.
    Symbol(String),
    /// Entry `n` of the compiled function's string literal pool.
    Literal(u32),
}

/// A relocation record.
#[derive(Clone, Debug)]
pub struct RelocEntry {
    /// Offset of the fixed-up field in the function body.
    pub offset: u32,
    /// The kind of relocation.
    pub reloc: Reloc,
    /// The referenced symbol or literal.
    pub target: RelocTarget,
    /// Addend to the target address.
    pub addend: i64,
}

/// In-function branch fixup kinds.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FixupKind {
    /// ARM64 26-bit branch (B, BL).
    Branch26,
    /// ARM64 19-bit branch (B.cond, CBZ/CBNZ).
    Branch19,
    /// AMD64 32-bit PC-relative field, relative to the end of the field.
    PcRel32,
}

#[derive(Clone, Debug)]
struct Fixup {
    offset: u32,
    label: Label,
    kind: FixupKind,
}

/// An appendable little-endian byte buffer with labels and relocations.
#[derive(Default)]
pub struct CodeBuffer {
    data: Vec<u8>,
    relocs: Vec<RelocEntry>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
}

impl CodeBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current emission offset.
    pub fn cur_offset(&self) -> u32 {
        self.data.len() as u32
    }

    /// Append one byte.
    pub fn put1(&mut self, b: u8) {
        self.data.push(b);
    }

    /// Append a 16-bit little-endian value.
    pub fn put2(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a 32-bit little-endian value.
    pub fn put4(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a 64-bit little-endian value.
    pub fn put8(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Create a new, unbound label.
    pub fn create_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the current offset.
    pub fn bind_label(&mut self, label: Label) {
        debug_assert!(
            self.labels[label.0 as usize].is_none(),
            "label bound twice"
        );
        self.labels[label.0 as usize] = Some(self.cur_offset());
    }

    /// The bound offset of `label`, if bound.
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.labels[label.0 as usize]
    }

    /// Record a fixup for the instruction field at `offset`.
    pub fn use_label_at_offset(&mut self, offset: u32, label: Label, kind: FixupKind) {
        self.fixups.push(Fixup {
            offset,
            label,
            kind,
        });
    }

    /// Record a relocation at `offset`.
    pub fn add_reloc_at_offset(
        &mut self,
        offset: u32,
        reloc: Reloc,
        target: RelocTarget,
        addend: i64,
    ) {
        self.relocs.push(RelocEntry {
            offset,
            reloc,
            target,
            addend,
        });
    }

    /// Resolve all fixups. Every used label must be bound by now.
    pub fn finish(&mut self) {
        let fixups = std::mem::take(&mut self.fixups);
        for fixup in fixups {
            let target = self.labels[fixup.label.0 as usize]
                .unwrap_or_else(|| panic!("unbound label {:?}", fixup.label));
            let at = fixup.offset as usize;
            match fixup.kind {
                FixupKind::Branch26 => {
                    let delta = (target as i64 - fixup.offset as i64) >> 2;
                    assert!(
                        (-(1 << 25)..(1 << 25)).contains(&delta),
                        "branch26 out of range"
                    );
                    let insn = u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap());
                    let insn = insn | ((delta as u32) & 0x03ff_ffff);
                    self.data[at..at + 4].copy_from_slice(&insn.to_le_bytes());
                }
                FixupKind::Branch19 => {
                    let delta = (target as i64 - fixup.offset as i64) >> 2;
                    assert!(
                        (-(1 << 18)..(1 << 18)).contains(&delta),
                        "branch19 out of range"
                    );
                    let insn = u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap());
                    let insn = insn | (((delta as u32) & 0x7ffff) << 5);
                    self.data[at..at + 4].copy_from_slice(&insn.to_le_bytes());
                }
                FixupKind::PcRel32 => {
                    let delta = target as i64 - (fixup.offset as i64 + 4);
                    assert!(
                        (i32::MIN as i64..=i32::MAX as i64).contains(&delta),
                        "rel32 out of range"
                    );
                    self.data[at..at + 4].copy_from_slice(&(delta as i32).to_le_bytes());
                }
            }
        }
    }

    /// The emitted bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The recorded relocations.
    pub fn relocs(&self) -> &[RelocEntry] {
        &self.relocs
    }

    /// Consume the buffer, returning bytes and relocations.
    pub fn into_parts(self) -> (Vec<u8>, Vec<RelocEntry>) {
        debug_assert!(self.fixups.is_empty(), "finish() before into_parts()");
        (self.data, self.relocs)
    }
}

impl fmt::Debug for CodeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CodeBuffer {{ {} bytes, {} relocs, {} fixups }}",
            self.data.len(),
            self.relocs.len(),
            self.fixups.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcrel32_fixup_resolves_backward() {
        let mut buf = CodeBuffer::new();
        let label = buf.create_label();
        buf.bind_label(label);
        buf.put1(0x90);
        // A jmp rel32 back to the label: opcode byte then the field.
        buf.put1(0xe9);
        let field = buf.cur_offset();
        buf.put4(0);
        buf.use_label_at_offset(field, label, FixupKind::PcRel32);
        buf.finish();
        // Field ends at offset 6, target 0 -> delta -6.
        assert_eq!(&buf.data()[2..6], &(-6i32).to_le_bytes());
    }

    #[test]
    fn branch26_fixup_resolves_forward() {
        let mut buf = CodeBuffer::new();
        let label = buf.create_label();
        let at = buf.cur_offset();
        buf.put4(0x1400_0000); // B with zero offset
        buf.use_label_at_offset(at, label, FixupKind::Branch26);
        buf.put4(0xd503_201f); // NOP
        buf.bind_label(label);
        buf.finish();
        // Two instructions ahead.
        assert_eq!(
            u32::from_le_bytes(buf.data()[0..4].try_into().unwrap()),
            0x1400_0002
        );
    }
}
