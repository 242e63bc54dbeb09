//! Relocatable object emission.
//!
//! Compiled functions and their string literals are laid into `.text` and
//! `.rodata`, one symbol per function plus an undefined symbol per libc
//! extern. The output is deterministic: no timestamps, and symbols appear
//! in the order functions were added.

#![warn(missing_docs)]

use anyhow::{anyhow, Result};
use cot_codegen::binemit::{Reloc, RelocTarget};
use cot_codegen::CompiledCode;
use object::write::{
    Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection,
};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationKind, SymbolFlags,
    SymbolKind, SymbolScope,
};
use std::collections::HashMap;
use target_lexicon::{OperatingSystem, Triple};

/// A relocation target waiting for symbol resolution.
enum PendingTarget {
    /// A named symbol: defined here or a libc extern, decided at finish.
    Named(String),
    /// An already-created local symbol (a literal).
    Resolved(SymbolId),
}

/// Builds one relocatable object from any number of compiled functions.
pub struct ObjectBuilder {
    obj: Object<'static>,
    format: BinaryFormat,
    arch: Architecture,
    /// Defined symbols by name.
    symbols: HashMap<String, SymbolId>,
    /// Pending relocations; names resolve at finish so that calls may
    /// reference functions added later.
    relocs: Vec<(u64, Reloc, PendingTarget, i64)>,
    literal_count: u32,
}

impl ObjectBuilder {
    /// Create a builder for the platform named by `triple`: ELF on Linux,
    /// Mach-O on macOS.
    pub fn new(triple: &Triple) -> Result<Self> {
        let arch = match triple.architecture {
            target_lexicon::Architecture::X86_64 => Architecture::X86_64,
            target_lexicon::Architecture::Aarch64(_) => Architecture::Aarch64,
            other => return Err(anyhow!("unsupported architecture {}", other)),
        };
        let format = match triple.operating_system {
            OperatingSystem::Darwin | OperatingSystem::MacOSX { .. } => BinaryFormat::MachO,
            _ => BinaryFormat::Elf,
        };
        Ok(Self {
            obj: Object::new(format, arch, Endianness::Little),
            format,
            arch,
            symbols: HashMap::new(),
            relocs: Vec::new(),
            literal_count: 0,
        })
    }

    /// A symbol for `name`: the defined function if one was added, an
    /// undefined extern otherwise.
    fn named_symbol(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.symbols.get(name) {
            return id;
        }
        let id = self.obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Unknown,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.symbols.insert(name.to_string(), id);
        id
    }

    /// Add one compiled function: its bytes, its literals, its relocations.
    pub fn add_function(&mut self, code: &CompiledCode) -> Result<()> {
        let text = self.obj.section_id(StandardSection::Text);

        // Literal pool entries become local .rodata symbols.
        let mut literal_syms: Vec<SymbolId> = Vec::new();
        for bytes in &code.literals {
            let rodata = self.obj.section_id(StandardSection::ReadOnlyData);
            let name = format!("L_str{}", self.literal_count);
            self.literal_count += 1;
            let id = self.obj.add_symbol(Symbol {
                name: name.into_bytes(),
                value: 0,
                size: bytes.len() as u64,
                kind: SymbolKind::Data,
                scope: SymbolScope::Compilation,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            });
            self.obj.add_symbol_data(id, rodata, bytes, 1);
            literal_syms.push(id);
        }

        // Function bytes, aligned to 16 with NOP padding so disassembly
        // between symbols stays sane.
        let mut padded = code.bytes.clone();
        pad_with_nops(&mut padded, self.arch);
        let func_sym = self.obj.add_symbol(Symbol {
            name: code.name.as_bytes().to_vec(),
            value: 0,
            size: code.bytes.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        let offset = self.obj.add_symbol_data(func_sym, text, &padded, 16);
        if self.symbols.insert(code.name.clone(), func_sym).is_some() {
            return Err(anyhow!("duplicate function symbol {}", code.name));
        }

        for entry in &code.relocs {
            let target = match &entry.target {
                RelocTarget::Symbol(name) => PendingTarget::Named(name.clone()),
                RelocTarget::Literal(n) => PendingTarget::Resolved(
                    literal_syms
                        .get(*n as usize)
                        .copied()
                        .ok_or_else(|| anyhow!("relocation against missing literal {}", n))?,
                ),
            };
            self.relocs
                .push((offset + entry.offset as u64, entry.reloc, target, entry.addend));
        }
        log::debug!(
            "object: added {} ({} bytes, {} relocs)",
            code.name,
            code.bytes.len(),
            code.relocs.len()
        );
        Ok(())
    }

    /// Emit the finished object file.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let text = self.obj.section_id(StandardSection::Text);
        for (offset, reloc, target, addend) in std::mem::take(&mut self.relocs) {
            let symbol = match target {
                PendingTarget::Named(name) => self.named_symbol(&name),
                PendingTarget::Resolved(id) => id,
            };
            let (kind, encoding, size) = reloc_parts(self.format, reloc)?;
            self.obj.add_relocation(
                text,
                Relocation {
                    offset,
                    size,
                    kind,
                    encoding,
                    symbol,
                    addend,
                },
            )?;
        }
        Ok(self.obj.write()?)
    }
}

/// Pad `bytes` to a 16-byte boundary with architecture NOPs.
fn pad_with_nops(bytes: &mut Vec<u8>, arch: Architecture) {
    match arch {
        Architecture::X86_64 => {
            while bytes.len() % 16 != 0 {
                bytes.push(0x90);
            }
        }
        _ => {
            // Instruction words are four bytes; the symbol data is
            // word-aligned already.
            while bytes.len() % 16 != 0 {
                bytes.extend_from_slice(&0xD503_201Fu32.to_le_bytes());
            }
        }
    }
}

/// Map a code-generator relocation to the object writer's vocabulary.
fn reloc_parts(
    format: BinaryFormat,
    reloc: Reloc,
) -> Result<(RelocationKind, RelocationEncoding, u8)> {
    Ok(match reloc {
        Reloc::Abs8 => (RelocationKind::Absolute, RelocationEncoding::Generic, 64),
        Reloc::X86CallPCRel4 => (
            RelocationKind::Relative,
            RelocationEncoding::X86Branch,
            32,
        ),
        Reloc::X86PCRel4 => (RelocationKind::Relative, RelocationEncoding::Generic, 32),
        Reloc::Arm64Call => (
            RelocationKind::Relative,
            RelocationEncoding::AArch64Call,
            26,
        ),
        Reloc::Aarch64AdrpPage21 => match format {
            BinaryFormat::Elf => (
                RelocationKind::Elf(object::elf::R_AARCH64_ADR_PREL_PG_HI21),
                RelocationEncoding::Generic,
                21,
            ),
            BinaryFormat::MachO => (
                RelocationKind::MachO {
                    value: object::macho::ARM64_RELOC_PAGE21,
                    relative: true,
                },
                RelocationEncoding::Generic,
                21,
            ),
            other => return Err(anyhow!("unsupported object format {:?}", other)),
        },
        Reloc::Aarch64AddAbsLo12 => match format {
            BinaryFormat::Elf => (
                RelocationKind::Elf(object::elf::R_AARCH64_ADD_ABS_LO12_NC),
                RelocationEncoding::Generic,
                12,
            ),
            BinaryFormat::MachO => (
                RelocationKind::MachO {
                    value: object::macho::ARM64_RELOC_PAGEOFF12,
                    relative: false,
                },
                RelocationEncoding::Generic,
                12,
            ),
            other => return Err(anyhow!("unsupported object format {:?}", other)),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn fake_code(name: &str) -> CompiledCode {
        CompiledCode {
            name: name.to_string(),
            bytes: vec![0xC3],
            relocs: vec![cot_codegen::binemit::RelocEntry {
                offset: 0,
                reloc: Reloc::X86CallPCRel4,
                target: RelocTarget::Symbol("malloc".to_string()),
                addend: -4,
            }],
            frame_size: 16,
            literals: vec![b"hi".to_vec()],
        }
    }

    #[test]
    fn emits_an_elf_object() {
        let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
        let mut builder = ObjectBuilder::new(&triple).unwrap();
        builder.add_function(&fake_code("add")).unwrap();
        let bytes = builder.finish().unwrap();
        assert_eq!(&bytes[..4], b"\x7fELF");
    }

    #[test]
    fn duplicate_symbols_are_rejected() {
        let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
        let mut builder = ObjectBuilder::new(&triple).unwrap();
        builder.add_function(&fake_code("twice")).unwrap();
        assert!(builder.add_function(&fake_code("twice")).is_err());
    }

    #[test]
    fn deterministic_output() {
        let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
        let build = || {
            let mut builder = ObjectBuilder::new(&triple).unwrap();
            builder.add_function(&fake_code("f")).unwrap();
            builder.add_function(&fake_code("g")).unwrap();
            builder.finish().unwrap()
        };
        assert_eq!(build(), build());
    }
}
