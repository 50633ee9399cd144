//! Output memory layout management.
//!
//! This module merges input sections into canonical section groups and
//! assigns each group a page-aligned virtual address. It maps sections
//! from input files into aggregated groups (e.g. all ".text*" sections
//! become one ".text") and remembers where each input section landed, so
//! the relocation pass can compute final addresses.

use anyhow::{bail, Result};
use std::collections::HashMap;

use crate::object::{group_for, Object, SectionHeaderKind, SECTION_ORDER};
use crate::utils::align_up;

/// One merged canonical section group.
pub struct MergedGroup {
    /// Canonical group name (".text", ".got", ...).
    pub name: &'static str,
    /// Merged bytes. Empty for the zero-fill group until addresses are
    /// assigned, at which point it is synthesized as zeros.
    pub data: Vec<u8>,
    /// Total byte size. Tracks `data.len()` except for the zero-fill
    /// group, which accumulates a size without bytes.
    pub size: u64,
    /// Assigned start virtual address.
    pub addr: u64,
    /// Metadata flag ORed across merged input sections.
    pub has_symbols: bool,
}

/// The merged layout of one link unit.
pub struct Layout {
    groups: Vec<MergedGroup>,
    /// (working-set object index, input section name) -> byte offset of
    /// that section inside its merged group.
    section_offsets: HashMap<(usize, String), u64>,
}

impl Layout {
    pub fn new() -> Self {
        Self {
            groups: SECTION_ORDER
                .iter()
                .map(|name| MergedGroup {
                    name,
                    data: Vec::new(),
                    size: 0,
                    addr: 0,
                    has_symbols: false,
                })
                .collect(),
            section_offsets: HashMap::new(),
        }
    }

    pub fn group(&self, name: &str) -> &MergedGroup {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .expect("unknown canonical group")
    }

    fn group_mut(&mut self, name: &str) -> &mut MergedGroup {
        self.groups
            .iter_mut()
            .find(|g| g.name == name)
            .expect("unknown canonical group")
    }

    /// Groups in canonical order.
    pub fn groups(&self) -> impl Iterator<Item = &MergedGroup> {
        self.groups.iter()
    }

    /// Concatenates every section of the working set into its canonical
    /// group. Zero-fill sections accumulate only a size; their bytes are
    /// synthesized in `assign_addresses`.
    pub fn merge(&mut self, objects: &[Object]) -> Result<()> {
        for (obj_idx, obj) in objects.iter().enumerate() {
            for shdr in &obj.section_headers {
                if shdr.kind == SectionHeaderKind::Nobits {
                    let start = self.group(".bss").size;
                    self.section_offsets
                        .insert((obj_idx, shdr.name.clone()), start);
                    self.group_mut(".bss").size += shdr.size;
                    continue;
                }

                let Some(group_name) = group_for(&shdr.name) else {
                    bail!(
                        "unknown section kind: {} (from {})",
                        shdr.name,
                        obj.name
                    );
                };
                let section = obj
                    .sections
                    .get(&shdr.name)
                    .ok_or_else(|| {
                        anyhow::anyhow!("section data missing for {} in {}", shdr.name, obj.name)
                    })?;

                let start = self.group(group_name).size;
                self.section_offsets
                    .insert((obj_idx, shdr.name.clone()), start);
                let group = self.group_mut(group_name);
                group.data.extend_from_slice(&section.data);
                group.size += shdr.size;
                group.has_symbols |= section.has_symbols;
            }
        }
        Ok(())
    }

    /// Appends zeroed slot storage to the indirection and stub tables.
    /// Returns the starting offsets of the new storage inside (.got, .plt).
    pub fn reserve_tables(&mut self, got_bytes: u64, plt_bytes: u64) -> (u64, u64) {
        let got = self.group_mut(".got");
        let got_start = got.size;
        got.data.resize((got.size + got_bytes) as usize, 0);
        got.size += got_bytes;

        let plt = self.group_mut(".plt");
        let plt_start = plt.size;
        plt.data.resize((plt.size + plt_bytes) as usize, 0);
        plt.size += plt_bytes;

        (got_start, plt_start)
    }

    /// Assigns each group a start address in canonical order, advancing by
    /// the group's size rounded up to the next page boundary. The
    /// zero-fill group gets its bytes synthesized here, once its final
    /// size is known.
    pub fn assign_addresses(&mut self, base: u64, page_size: u64) {
        let mut current = base;
        for group in &mut self.groups {
            group.addr = current;
            if group.name == ".bss" {
                group.data.resize(group.size as usize, 0);
            }
            current = align_up(current + group.size, page_size);
            tracing::debug!(
                "group {} at 0x{:x} ({} bytes)",
                group.name,
                group.addr,
                group.size
            );
        }
    }

    /// Offset of an input section inside its merged group.
    pub fn section_offset(&self, obj_idx: usize, section: &str) -> Option<u64> {
        self.section_offsets.get(&(obj_idx, section.to_string())).copied()
    }

    /// Overwrites merged bytes of `group` at `offset`.
    pub fn patch(&mut self, group: &str, offset: u64, bytes: &[u8]) {
        let data = &mut self.group_mut(group).data;
        let offset = offset as usize;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Consumes the layout, yielding the groups for output assembly.
    pub fn into_groups(self) -> Vec<MergedGroup> {
        self.groups
    }
}
