//! The FLE object model.
//!
//! These are the shared data structures the linker and loader both operate
//! on: objects, sections, symbols, relocations and the program/section
//! headers of a linked image. Parsing and serialization of the on-disk
//! representation live in `format`; this module is pure data plus a few
//! construction helpers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Base virtual address of the first merged section group.
pub const BASE_ADDR: u64 = 0x400000;

/// Page granularity for section group placement and memory protection.
pub const PAGE_SIZE: u64 = 0x1000;

/// Canonical section group names in their required layout order.
///
/// An input section is assigned to the first group whose name prefixes its
/// own (".text.foo" lands in ".text"). The order is load-bearing: address
/// assignment walks this list, so it determines the final memory layout.
pub const SECTION_ORDER: [&str; 6] = [".text", ".plt", ".rodata", ".data", ".got", ".bss"];

/// Returns the canonical group an input section name belongs to.
pub fn group_for(section_name: &str) -> Option<&'static str> {
    SECTION_ORDER
        .iter()
        .copied()
        .find(|group| section_name.starts_with(group))
}

/// Segment permission bits, matching ELF program header flags.
pub mod perm {
    pub const X: u32 = 0x1;
    pub const W: u32 = 0x2;
    pub const R: u32 = 0x4;
}

/// Section header flags.
pub mod shf {
    pub const WRITE: u32 = 0x1;
    pub const ALLOC: u32 = 0x2;
    pub const EXEC: u32 = 0x4;
}

/// Visibility/strength classification of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolBinding {
    /// File-private; namespaced per object during resolution.
    Local,
    /// Overridable definition.
    Weak,
    /// Strong, exported definition.
    Global,
    /// A reference, not a definition. Always has empty section, offset 0, size 0.
    Undefined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub binding: SymbolBinding,
    /// Name of the owning section; empty for undefined symbols. After
    /// linking this is the canonical group name.
    pub section: String,
    /// Offset within the owning section (within the merged group after
    /// linking).
    pub offset: u64,
    pub size: u64,
}

/// The fixed set of supported relocation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelocKind {
    /// 8-byte absolute: S + A.
    Abs64,
    /// 4-byte absolute, zero-extension expected: truncate(S + A).
    Abs32,
    /// 4-byte absolute, sign-extension expected: truncate(S + A).
    Abs32Signed,
    /// 4-byte PC-relative: S + A - P.
    PCRel32,
    /// 4-byte PC-relative through an indirection-table slot; the slot
    /// address stands in for S. Same arithmetic as `PCRel32`.
    GotRel32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relocation {
    /// Offset of the patch site within the owning section. For dynamic
    /// relocations on a linked object this is the link-time virtual
    /// address of the slot instead (load-bias-relative at run time).
    pub offset: u64,
    pub kind: RelocKind,
    /// Name of the symbol to resolve.
    pub symbol: String,
    pub addend: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub data: Vec<u8>,
    /// Relocations whose `offset` is relative to this section's start.
    pub relocations: Vec<Relocation>,
    /// Metadata flag propagated through merging; carries no layout meaning.
    pub has_symbols: bool,
}

/// A program header: one contiguous, permission-tagged region of the
/// runtime address space backing a merged section group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub vaddr: u64,
    pub size: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionHeaderKind {
    /// Section bytes are stored in the object.
    Progbits,
    /// Zero-fill: only a size is stored.
    Nobits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionHeader {
    pub name: String,
    pub kind: SectionHeaderKind,
    pub addr: u64,
    pub size: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Relocatable,
    SharedObject,
    Executable,
}

/// A relocatable unit, shared object or executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub name: String,
    pub kind: ObjectKind,
    pub sections: BTreeMap<String, Section>,
    pub symbols: Vec<Symbol>,
    pub segments: Vec<Segment>,
    pub section_headers: Vec<SectionHeader>,
    /// Declared shared-object dependency names, in link order.
    pub needed: Vec<String>,
    /// Absolute entry address; only executables carry one.
    pub entry: Option<u64>,
    /// Relocations valid only for load-time application.
    pub dynamic_relocations: Vec<Relocation>,
}

impl Object {
    pub fn new(name: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            name: name.into(),
            kind,
            sections: BTreeMap::new(),
            symbols: Vec::new(),
            segments: Vec::new(),
            section_headers: Vec::new(),
            needed: Vec::new(),
            entry: None,
            dynamic_relocations: Vec::new(),
        }
    }

    /// Adds a progbits section together with its header.
    pub fn push_section(&mut self, name: &str, data: Vec<u8>, relocations: Vec<Relocation>) {
        self.section_headers.push(SectionHeader {
            name: name.to_string(),
            kind: SectionHeaderKind::Progbits,
            addr: 0,
            size: data.len() as u64,
            flags: 0,
        });
        self.sections.insert(
            name.to_string(),
            Section {
                name: name.to_string(),
                data,
                relocations,
                has_symbols: false,
            },
        );
    }

    /// Adds a zero-fill section: a header with a size but no bytes.
    pub fn push_zero_fill(&mut self, name: &str, size: u64) {
        self.section_headers.push(SectionHeader {
            name: name.to_string(),
            kind: SectionHeaderKind::Nobits,
            addr: 0,
            size,
            flags: 0,
        });
        self.sections.insert(
            name.to_string(),
            Section {
                name: name.to_string(),
                data: Vec::new(),
                relocations: Vec::new(),
                has_symbols: false,
            },
        );
    }

    pub fn push_symbol(
        &mut self,
        name: &str,
        binding: SymbolBinding,
        section: &str,
        offset: u64,
        size: u64,
    ) {
        self.symbols.push(Symbol {
            name: name.to_string(),
            binding,
            section: section.to_string(),
            offset,
            size,
        });
    }

    /// An undefined reference to `name`.
    pub fn push_undefined(&mut self, name: &str) {
        self.push_symbol(name, SymbolBinding::Undefined, "", 0, 0);
    }
}

/// An archive: a minimal member list, nothing more.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub name: String,
    pub members: Vec<Object>,
}

/// A linker input. Only archives carry members; everything else is an
/// object with sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Input {
    Object(Object),
    Archive(Archive),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_groups_match_by_prefix() {
        assert_eq!(group_for(".text"), Some(".text"));
        assert_eq!(group_for(".text.hot"), Some(".text"));
        assert_eq!(group_for(".bss.counters"), Some(".bss"));
        assert_eq!(group_for(".rodata.str1"), Some(".rodata"));
        assert_eq!(group_for(".debug_info"), None);
    }

    #[test]
    fn zero_fill_sections_carry_no_bytes() {
        let mut obj = Object::new("a.obj", ObjectKind::Relocatable);
        obj.push_zero_fill(".bss", 128);
        assert!(obj.sections[".bss"].data.is_empty());
        assert_eq!(obj.section_headers[0].kind, SectionHeaderKind::Nobits);
        assert_eq!(obj.section_headers[0].size, 128);
    }
}
