//! Indirection-table (GOT) and call-stub (PLT) allocation.
//!
//! Every external name gets one 8-byte indirection slot the loader fills
//! with the resolved absolute address. External names classified as code
//! additionally get one call stub that jumps through their slot, so
//! PC-relative call sites can be rewritten to a link-time-known target.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::arch::Architecture;
use crate::layout::Layout;
use crate::object::{RelocKind, Relocation};
use crate::resolver::SymbolTable;

pub struct PicTables {
    /// External name -> indirection slot index.
    got: BTreeMap<String, u64>,
    /// External name -> call-stub index. Subset of `got`'s keys.
    plt: BTreeMap<String, u64>,
    /// Byte offset of the first slot inside the merged ".got" group.
    got_start: u64,
    /// Byte offset of the first stub inside the merged ".plt" group.
    plt_start: u64,
}

impl PicTables {
    /// Allocates slot and stub indices for every external name.
    ///
    /// Classification of code vs. data comes from the shared-object symbol
    /// map gathered while scanning declared shared-object inputs, falling
    /// back to the working set's own definition group so interposable
    /// internal functions still get a stub.
    pub fn build(
        externals: &BTreeSet<String>,
        shared_sections: &HashMap<String, String>,
        table: &SymbolTable,
    ) -> Self {
        let mut got = BTreeMap::new();
        let mut plt = BTreeMap::new();
        let mut got_idx = 0;
        let mut plt_idx = 0;

        for name in externals {
            let is_code = match shared_sections.get(name) {
                Some(section) => section.starts_with(".text"),
                None => table
                    .get(name)
                    .map(|sym| sym.section == ".text")
                    .unwrap_or(false),
            };
            got.insert(name.clone(), got_idx);
            got_idx += 1;
            if is_code {
                plt.insert(name.clone(), plt_idx);
                plt_idx += 1;
            }
        }

        Self {
            got,
            plt,
            got_start: 0,
            plt_start: 0,
        }
    }

    pub fn got_len(&self) -> u64 {
        self.got.len() as u64
    }

    pub fn plt_len(&self) -> u64 {
        self.plt.len() as u64
    }

    /// Records where the slot storage starts inside the merged groups.
    pub fn set_table_starts(&mut self, got_start: u64, plt_start: u64) {
        self.got_start = got_start;
        self.plt_start = plt_start;
    }

    pub fn has_stub(&self, name: &str) -> bool {
        self.plt.contains_key(name)
    }

    /// Absolute address of the indirection slot for `name`.
    pub fn got_slot_addr(&self, layout: &Layout, arch: &dyn Architecture, name: &str) -> Option<u64> {
        let idx = self.got.get(name)?;
        Some(layout.group(".got").addr + self.got_start + idx * arch.got_entry_size())
    }

    /// Absolute address of the call stub for `name`.
    pub fn plt_slot_addr(&self, layout: &Layout, arch: &dyn Architecture, name: &str) -> Option<u64> {
        let idx = self.plt.get(name)?;
        Some(layout.group(".plt").addr + self.plt_start + idx * arch.call_stub_len())
    }

    /// Fills the merged stub table: one indirect jump per code external,
    /// displaced from the end of the stub to its indirection slot.
    pub fn write_call_stubs(&self, layout: &mut Layout, arch: &dyn Architecture) -> Result<()> {
        for name in self.plt.keys() {
            let stub_addr = self
                .plt_slot_addr(layout, arch, name)
                .expect("stub allocated above");
            let slot_addr = self
                .got_slot_addr(layout, arch, name)
                .expect("every stub has a slot");
            let displacement = slot_addr
                .wrapping_sub(stub_addr + arch.call_stub_len());
            let displacement = i32::try_from(displacement as i64)
                .map_err(|_| anyhow!("call stub for {} cannot reach its slot", name))?;
            let stub = arch.emit_call_stub(displacement);
            let offset = stub_addr - layout.group(".plt").addr;
            layout.patch(".plt", offset, &stub);
        }
        Ok(())
    }

    /// Synthesizes the outbound load-time relocations: one absolute fill
    /// per indirection slot, at the slot's own address.
    pub fn dynamic_relocations(&self, layout: &Layout, arch: &dyn Architecture) -> Vec<Relocation> {
        self.got
            .keys()
            .map(|name| Relocation {
                offset: self
                    .got_slot_addr(layout, arch, name)
                    .expect("iterating allocated slots"),
                kind: RelocKind::Abs64,
                symbol: name.clone(),
                addend: 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;
    use crate::object::{Object, ObjectKind, BASE_ADDR, PAGE_SIZE};

    fn empty_layout_with_tables(got: u64, plt: u64) -> Layout {
        let mut obj = Object::new("a.obj", ObjectKind::Relocatable);
        obj.push_section(".text", vec![0xc3], vec![]);
        let mut layout = Layout::new();
        layout.merge(&[obj]).unwrap();
        layout.reserve_tables(got * 8, plt * 6);
        layout.assign_addresses(BASE_ADDR, PAGE_SIZE);
        layout
    }

    #[test]
    fn code_externals_get_slot_and_stub_data_only_slot() {
        let mut externals = BTreeSet::new();
        externals.insert("ext_fn".to_string());
        externals.insert("ext_data".to_string());
        let mut shared = HashMap::new();
        shared.insert("ext_fn".to_string(), ".text".to_string());
        shared.insert("ext_data".to_string(), ".data".to_string());

        let pic = PicTables::build(&externals, &shared, &SymbolTable::default());
        assert_eq!(pic.got_len(), 2);
        assert_eq!(pic.plt_len(), 1);
        assert!(pic.has_stub("ext_fn"));
        assert!(!pic.has_stub("ext_data"));
    }

    #[test]
    fn stubs_jump_through_their_own_slot() {
        let arch = X86_64;
        let mut externals = BTreeSet::new();
        externals.insert("f".to_string());
        let mut shared = HashMap::new();
        shared.insert("f".to_string(), ".text".to_string());
        let pic = PicTables::build(&externals, &shared, &SymbolTable::default());

        let mut layout = empty_layout_with_tables(pic.got_len(), pic.plt_len());
        pic.write_call_stubs(&mut layout, &arch).unwrap();

        let stub_addr = pic.plt_slot_addr(&layout, &arch, "f").unwrap();
        let slot_addr = pic.got_slot_addr(&layout, &arch, "f").unwrap();
        let plt = &layout.group(".plt").data;
        assert_eq!(&plt[..2], &[0xff, 0x25]);
        let disp = i32::from_le_bytes(plt[2..6].try_into().unwrap());
        assert_eq!((stub_addr + 6).wrapping_add(disp as i64 as u64), slot_addr);

        let dyn_relocs = pic.dynamic_relocations(&layout, &arch);
        assert_eq!(dyn_relocs.len(), 1);
        assert_eq!(dyn_relocs[0].kind, RelocKind::Abs64);
        assert_eq!(dyn_relocs[0].offset, slot_addr);
        assert_eq!(dyn_relocs[0].symbol, "f");
    }
}
