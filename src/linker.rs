//! Core linker logic.
//!
//! This module contains the `Linker` struct which orchestrates the entire
//! linking process:
//! 1. Input partitioning: relocatables, archives, shared objects.
//! 2. Archive pulling: a work-list fixed point over undefined symbols.
//! 3. Layout: merge sections into canonical groups, assign addresses.
//! 4. Symbol resolution: build the global symbol table.
//! 5. PIC tables: indirection slots and call stubs for external names.
//! 6. Relocation: patch merged bytes, synthesize load-time relocations.
//! 7. Output assembly: segments, section headers, exported symbols.

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::arch::x86_64::X86_64;
use crate::arch::Architecture;
use crate::layout::Layout;
use crate::object::{
    perm, shf, Archive, Input, Object, ObjectKind, RelocKind, Relocation, Section, SectionHeader,
    SectionHeaderKind, Segment, SymbolBinding, BASE_ADDR, PAGE_SIZE,
};
use crate::pic::PicTables;
use crate::resolver::{self, Resolution};

/// Options controlling one link invocation.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Name recorded on the output object.
    pub output_name: String,
    /// Produce a shared object instead of an executable.
    pub shared: bool,
    /// Symbol whose address becomes the executable's entry point.
    pub entry_symbol: String,
}

impl LinkOptions {
    pub fn executable(output_name: &str, entry_symbol: &str) -> Self {
        Self {
            output_name: output_name.to_string(),
            shared: false,
            entry_symbol: entry_symbol.to_string(),
        }
    }

    pub fn shared_object(output_name: &str) -> Self {
        Self {
            output_name: output_name.to_string(),
            shared: true,
            entry_symbol: String::new(),
        }
    }
}

/// Links objects and archive members into one executable or shared object.
pub fn link(inputs: Vec<Input>, options: &LinkOptions) -> Result<Object> {
    Linker::new(X86_64, options.clone()).link(inputs)
}

struct Partition {
    /// The working set of relocatable objects selected for inclusion.
    objects: Vec<Object>,
    archives: Vec<Archive>,
    /// Defined symbol name -> owning section, from shared-object inputs.
    shared_sections: HashMap<String, String>,
    /// Shared-object dependency names, in input order.
    needed: Vec<String>,
}

pub struct Linker<A: Architecture> {
    arch: A,
    options: LinkOptions,
}

impl<A: Architecture> Linker<A> {
    pub fn new(arch: A, options: LinkOptions) -> Self {
        Self { arch, options }
    }

    pub fn link(&self, inputs: Vec<Input>) -> Result<Object> {
        let mut partition = partition_inputs(inputs);
        pull_archive_members(&mut partition);

        let mut layout = Layout::new();
        layout.merge(&partition.objects)?;

        let resolution = resolver::resolve(
            &partition.objects,
            &layout,
            &partition.shared_sections,
            self.options.shared,
        )?;
        tracing::debug!(
            "{} objects in working set, {} external symbols",
            partition.objects.len(),
            resolution.externals.len()
        );

        let mut pic = PicTables::build(
            &resolution.externals,
            &partition.shared_sections,
            &resolution.table,
        );
        let (got_start, plt_start) = layout.reserve_tables(
            pic.got_len() * self.arch.got_entry_size(),
            pic.plt_len() * self.arch.call_stub_len(),
        );
        pic.set_table_starts(got_start, plt_start);

        layout.assign_addresses(BASE_ADDR, PAGE_SIZE);
        pic.write_call_stubs(&mut layout, &self.arch)?;
        let dynamic_relocations = pic.dynamic_relocations(&layout, &self.arch);

        let carried = self.apply_relocations(&partition.objects, &mut layout, &resolution, &pic)?;

        let entry = if self.options.shared {
            None
        } else {
            let sym = resolution.table.get(&self.options.entry_symbol).ok_or_else(|| {
                anyhow::anyhow!(
                    "missing entry point: symbol {} is not defined",
                    self.options.entry_symbol
                )
            })?;
            Some(layout.group(&sym.section).addr + sym.offset)
        };

        self.assemble(layout, resolution, partition.needed, dynamic_relocations, carried, entry)
    }

    /// Patches every relocation of every original small section into the
    /// merged buffers. Returns the relocations deferred to load time
    /// (shared-object mode only), rebased to their merged section.
    fn apply_relocations(
        &self,
        objects: &[Object],
        layout: &mut Layout,
        resolution: &Resolution,
        pic: &PicTables,
    ) -> Result<Vec<(&'static str, Relocation)>> {
        // Two phases so address computation can borrow the layout while
        // the writes go through one mutable pass.
        let mut patches: Vec<(&'static str, u64, [u8; 8], usize)> = Vec::new();
        let mut carried: Vec<(&'static str, Relocation)> = Vec::new();

        for (obj_idx, obj) in objects.iter().enumerate() {
            for shdr in &obj.section_headers {
                if shdr.kind == SectionHeaderKind::Nobits {
                    continue;
                }
                let group = crate::object::group_for(&shdr.name)
                    .expect("merged sections have known groups");
                let section = &obj.sections[&shdr.name];
                let section_offset = layout
                    .section_offset(obj_idx, &shdr.name)
                    .expect("merged sections have offsets");
                let section_addr = layout.group(group).addr + section_offset;

                for reloc in &section.relocations {
                    let name = resolution.table.site_name(&obj.name, &reloc.symbol);
                    let site_offset = section_offset + reloc.offset;
                    let p = section_addr + reloc.offset;

                    if resolution.externals.contains(&name) {
                        match reloc.kind {
                            RelocKind::PCRel32 if pic.has_stub(&name) => {
                                // Calls go through the stub; the stub's own
                                // slot indirection covers the load-time fill.
                                let stub = pic
                                    .plt_slot_addr(layout, &self.arch, &name)
                                    .expect("code externals have stubs");
                                let (bytes, len) = self.arch.relocation_bytes(
                                    RelocKind::PCRel32,
                                    stub,
                                    reloc.addend,
                                    p,
                                )?;
                                patches.push((group, site_offset, bytes, len));
                            }
                            RelocKind::PCRel32 | RelocKind::GotRel32 => {
                                // Data access is rewritten relative to the
                                // indirection slot the loader fills.
                                let slot = pic
                                    .got_slot_addr(layout, &self.arch, &name)
                                    .expect("externals have slots");
                                let (bytes, len) = self.arch.relocation_bytes(
                                    reloc.kind,
                                    slot,
                                    reloc.addend,
                                    p,
                                )?;
                                patches.push((group, site_offset, bytes, len));
                            }
                            // Absolute forms keep their static bytes; the
                            // slot-fill dynamic relocation carries the value.
                            _ => {}
                        }
                    } else if let Some(sym) = resolution.table.get(&name) {
                        let s = layout.group(&sym.section).addr + sym.offset;
                        let (bytes, len) =
                            self.arch.relocation_bytes(reloc.kind, s, reloc.addend, p)?;
                        patches.push((group, site_offset, bytes, len));
                    } else if self.options.shared {
                        // Deferred to the load-time applier, rebased to the
                        // merged section.
                        carried.push((
                            group,
                            Relocation {
                                offset: site_offset,
                                kind: reloc.kind,
                                symbol: reloc.symbol.clone(),
                                addend: reloc.addend,
                            },
                        ));
                    } else {
                        bail!(
                            "undefined symbol: {} referenced from {}",
                            reloc.symbol,
                            obj.name
                        );
                    }
                }
            }
        }

        for (group, offset, bytes, len) in patches {
            layout.patch(group, offset, &bytes[..len]);
        }
        Ok(carried)
    }

    fn assemble(
        &self,
        layout: Layout,
        resolution: Resolution,
        needed: Vec<String>,
        dynamic_relocations: Vec<Relocation>,
        carried: Vec<(&'static str, Relocation)>,
        entry: Option<u64>,
    ) -> Result<Object> {
        let kind = if self.options.shared {
            ObjectKind::SharedObject
        } else {
            ObjectKind::Executable
        };
        let mut output = Object::new(self.options.output_name.clone(), kind);
        output.entry = entry;
        output.needed = needed;
        output.dynamic_relocations = dynamic_relocations;

        for group in layout.into_groups() {
            if group.size == 0 {
                continue;
            }
            let flags = match group.name {
                ".text" | ".plt" => perm::R | perm::X,
                ".rodata" => perm::R,
                _ => perm::R | perm::W,
            };
            output.segments.push(Segment {
                name: group.name.to_string(),
                vaddr: group.addr,
                size: group.size,
                flags,
            });
            let (header_kind, header_flags) = match group.name {
                ".bss" => (SectionHeaderKind::Nobits, shf::ALLOC | shf::WRITE),
                ".text" | ".plt" => (SectionHeaderKind::Progbits, shf::ALLOC | shf::EXEC),
                ".rodata" => (SectionHeaderKind::Progbits, shf::ALLOC),
                _ => (SectionHeaderKind::Progbits, shf::ALLOC | shf::WRITE),
            };
            output.section_headers.push(SectionHeader {
                name: group.name.to_string(),
                kind: header_kind,
                addr: group.addr,
                size: group.size,
                flags: header_flags,
            });
            output.sections.insert(
                group.name.to_string(),
                Section {
                    name: group.name.to_string(),
                    data: group.data,
                    relocations: Vec::new(),
                    has_symbols: group.has_symbols,
                },
            );
        }

        for (group, reloc) in carried {
            if let Some(section) = output.sections.get_mut(group) {
                section.relocations.push(reloc);
            }
        }

        // Local symbols are never visible outside the link unit.
        for sym in resolution.table.iter() {
            if matches!(sym.binding, SymbolBinding::Global | SymbolBinding::Weak) {
                output.symbols.push(sym.clone());
            }
        }

        Ok(output)
    }
}

fn partition_inputs(inputs: Vec<Input>) -> Partition {
    let mut partition = Partition {
        objects: Vec::new(),
        archives: Vec::new(),
        shared_sections: HashMap::new(),
        needed: Vec::new(),
    };
    for input in inputs {
        match input {
            Input::Archive(archive) => partition.archives.push(archive),
            Input::Object(obj) => match obj.kind {
                ObjectKind::Relocatable => partition.objects.push(obj),
                // Shared objects are not linked in; they become runtime
                // dependencies and contribute their export map.
                ObjectKind::SharedObject | ObjectKind::Executable => {
                    partition.needed.push(obj.name.clone());
                    for sym in &obj.symbols {
                        if sym.binding == SymbolBinding::Undefined {
                            continue;
                        }
                        partition
                            .shared_sections
                            .insert(sym.name.clone(), sym.section.clone());
                    }
                }
            },
        }
    }
    partition
}

/// Pulls archive members into the working set: a fixed-point work list
/// over (undefined symbol name -> satisfying member). Terminates when no
/// object's undefined symbols can pull in a new member.
fn pull_archive_members(partition: &mut Partition) {
    let mut included: HashSet<String> =
        partition.objects.iter().map(|o| o.name.clone()).collect();
    let mut pending: VecDeque<usize> = (0..partition.objects.len()).collect();

    while let Some(idx) = pending.pop_front() {
        let mut wanted: HashSet<String> = HashSet::new();
        let mut defined: HashSet<String> = HashSet::new();
        for sym in &partition.objects[idx].symbols {
            if sym.binding == SymbolBinding::Undefined {
                wanted.insert(sym.name.clone());
            } else {
                defined.insert(sym.name.clone());
            }
        }

        let mut pulled: Vec<Object> = Vec::new();
        for archive in &partition.archives {
            for member in &archive.members {
                if included.contains(&member.name) {
                    continue;
                }
                let satisfies = member.symbols.iter().any(|sym| {
                    sym.binding != SymbolBinding::Undefined
                        && wanted.contains(&sym.name)
                        && !defined.contains(&sym.name)
                });
                if satisfies {
                    tracing::debug!(
                        "pulling archive member {} from {}",
                        member.name,
                        archive.name
                    );
                    included.insert(member.name.clone());
                    for sym in &member.symbols {
                        if sym.binding != SymbolBinding::Undefined {
                            defined.insert(sym.name.clone());
                        }
                    }
                    pulled.push(member.clone());
                }
            }
        }
        for member in pulled {
            partition.objects.push(member);
            pending.push_back(partition.objects.len() - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ret_unit(name: &str, symbol: &str) -> Object {
        let mut obj = Object::new(name, ObjectKind::Relocatable);
        obj.push_section(".text", vec![0xc3], vec![]);
        obj.push_symbol(symbol, SymbolBinding::Global, ".text", 0, 1);
        obj
    }

    #[test]
    fn missing_entry_point_is_fatal() {
        let err = link(
            vec![Input::Object(ret_unit("a.obj", "not_start"))],
            &LinkOptions::executable("a.out", "_start"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing entry point"));
    }

    #[test]
    fn undefined_symbol_is_fatal_in_executable_mode() {
        let mut obj = Object::new("a.obj", ObjectKind::Relocatable);
        obj.push_section(
            ".text",
            vec![0xe8, 0, 0, 0, 0, 0xc3],
            vec![Relocation {
                offset: 1,
                kind: RelocKind::PCRel32,
                symbol: "nowhere".to_string(),
                addend: -4,
            }],
        );
        obj.push_symbol("_start", SymbolBinding::Global, ".text", 0, 6);
        obj.push_undefined("nowhere");

        let err = link(
            vec![Input::Object(obj)],
            &LinkOptions::executable("a.out", "_start"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("undefined symbol: nowhere"));
    }

    #[test]
    fn shared_mode_defers_unresolved_relocations() {
        let mut obj = Object::new("a.obj", ObjectKind::Relocatable);
        obj.push_section(
            ".data",
            vec![0; 8],
            vec![Relocation {
                offset: 0,
                kind: RelocKind::Abs64,
                symbol: "provided_elsewhere".to_string(),
                addend: 0,
            }],
        );
        obj.push_symbol("blob", SymbolBinding::Global, ".data", 0, 8);

        let out = link(
            vec![Input::Object(obj)],
            &LinkOptions::shared_object("libdeferred.so"),
        )
        .unwrap();
        let data = &out.sections[".data"];
        assert_eq!(data.relocations.len(), 1);
        assert_eq!(data.relocations[0].symbol, "provided_elsewhere");
        // No reference ever declared the name undefined, so no slot exists;
        // the fixup rides on the section for the load-time pass.
        assert!(out.dynamic_relocations.is_empty());
    }

    #[test]
    fn segments_are_page_aligned_and_disjoint() {
        let mut obj = ret_unit("a.obj", "_start");
        obj.push_section(".data", vec![7; 100], vec![]);
        obj.push_zero_fill(".bss", 64);
        let out = link(
            vec![Input::Object(obj)],
            &LinkOptions::executable("a.out", "_start"),
        )
        .unwrap();

        let mut previous_end = 0u64;
        for seg in &out.segments {
            assert_eq!(seg.vaddr % PAGE_SIZE, 0);
            assert!(seg.vaddr >= previous_end);
            previous_end = seg.vaddr + seg.size;
        }
        assert_eq!(out.entry, Some(BASE_ADDR));
    }

    #[test]
    fn global_definition_wins_over_weak_at_reference_sites() {
        // a.obj defines value weakly, b.obj strongly; main reads it via an
        // absolute relocation. The written bytes must decode to the strong
        // definition's address.
        let mut weak = Object::new("weak.obj", ObjectKind::Relocatable);
        weak.push_section(".data", vec![1, 1, 1, 1, 1, 1, 1, 1], vec![]);
        weak.push_symbol("value", SymbolBinding::Weak, ".data", 0, 8);

        let mut strong = Object::new("strong.obj", ObjectKind::Relocatable);
        strong.push_section(".data", vec![2; 16], vec![]);
        strong.push_symbol("value", SymbolBinding::Global, ".data", 8, 8);

        let mut main = Object::new("main.obj", ObjectKind::Relocatable);
        main.push_section(
            ".text",
            vec![0; 8],
            vec![Relocation {
                offset: 0,
                kind: RelocKind::Abs64,
                symbol: "value".to_string(),
                addend: 0,
            }],
        );
        main.push_symbol("_start", SymbolBinding::Global, ".text", 0, 8);
        main.push_undefined("value");

        let out = link(
            vec![
                Input::Object(weak),
                Input::Object(strong),
                Input::Object(main),
            ],
            &LinkOptions::executable("a.out", "_start"),
        )
        .unwrap();

        let data_seg = out.segments.iter().find(|s| s.name == ".data").unwrap();
        let text = &out.sections[".text"].data;
        let written = u64::from_le_bytes(text[..8].try_into().unwrap());
        // strong.obj's .data follows weak.obj's 8 bytes, symbol at +8.
        assert_eq!(written, data_seg.vaddr + 8 + 8);
    }

    #[test]
    fn archive_members_are_pulled_transitively() {
        // main needs "a"; member a needs "b"; member b defines it.
        let mut main = Object::new("main.obj", ObjectKind::Relocatable);
        main.push_section(".text", vec![0xc3], vec![]);
        main.push_symbol("_start", SymbolBinding::Global, ".text", 0, 1);
        main.push_undefined("a");

        let mut member_a = ret_unit("a.obj", "a");
        member_a.push_undefined("b");
        let member_b = ret_unit("b.obj", "b");
        let mut unused = ret_unit("unused.obj", "unused");
        unused.push_section(".data", vec![0xff; 4], vec![]);

        let archive = Archive {
            name: "libstuff.a".to_string(),
            members: vec![unused.clone(), member_a, member_b],
        };

        let out = link(
            vec![Input::Object(main), Input::Archive(archive)],
            &LinkOptions::executable("a.out", "_start"),
        )
        .unwrap();
        // main + a + b rets, unused member left out.
        assert_eq!(out.sections[".text"].data, vec![0xc3, 0xc3, 0xc3]);
        assert!(out.symbols.iter().any(|s| s.name == "a"));
        assert!(out.symbols.iter().any(|s| s.name == "b"));
        assert!(!out.symbols.iter().any(|s| s.name == "unused"));
    }

    #[test]
    fn no_stubs_for_internal_only_shared_object() {
        // A shared object whose functions only call each other must not
        // allocate any call-stub slots.
        let mut obj = Object::new("lib.obj", ObjectKind::Relocatable);
        obj.push_section(
            ".text",
            vec![0xc3, 0xe8, 0, 0, 0, 0, 0xc3],
            vec![Relocation {
                offset: 2,
                kind: RelocKind::PCRel32,
                symbol: "inner".to_string(),
                addend: -4,
            }],
        );
        obj.push_symbol("inner", SymbolBinding::Local, ".text", 0, 1);
        obj.push_symbol("outer", SymbolBinding::Global, ".text", 1, 6);

        let out = link(
            vec![Input::Object(obj)],
            &LinkOptions::shared_object("libself.so"),
        )
        .unwrap();
        assert!(!out.sections.contains_key(".plt"));
        assert!(!out.sections.contains_key(".got"));
        assert!(out.dynamic_relocations.is_empty());

        // The internal call was resolved statically: displacement from the
        // end of the call at .text+6 back to .text+0.
        let text = &out.sections[".text"].data;
        let disp = i32::from_le_bytes(text[2..6].try_into().unwrap());
        assert_eq!(disp, -6);
    }

    #[test]
    fn external_calls_get_stub_and_slot() {
        let mut so_iface = Object::new("libm.so", ObjectKind::SharedObject);
        so_iface.push_symbol("ext_fn", SymbolBinding::Global, ".text", 0, 4);

        let mut main = Object::new("main.obj", ObjectKind::Relocatable);
        main.push_section(
            ".text",
            vec![0xe8, 0, 0, 0, 0, 0xc3],
            vec![Relocation {
                offset: 1,
                kind: RelocKind::PCRel32,
                symbol: "ext_fn".to_string(),
                addend: -4,
            }],
        );
        main.push_symbol("_start", SymbolBinding::Global, ".text", 0, 6);
        main.push_undefined("ext_fn");

        let out = link(
            vec![Input::Object(main), Input::Object(so_iface)],
            &LinkOptions::executable("a.out", "_start"),
        )
        .unwrap();

        assert_eq!(out.needed, vec!["libm.so".to_string()]);
        let plt = out.segments.iter().find(|s| s.name == ".plt").unwrap();
        let got = out.segments.iter().find(|s| s.name == ".got").unwrap();
        assert_eq!(plt.size, 6);
        assert_eq!(got.size, 8);
        assert_eq!(plt.flags, perm::R | perm::X);
        assert_eq!(got.flags, perm::R | perm::W);

        // Call site points at the stub.
        let text = &out.sections[".text"].data;
        let disp = i32::from_le_bytes(text[1..5].try_into().unwrap());
        let text_seg = out.segments.iter().find(|s| s.name == ".text").unwrap();
        let site_end = text_seg.vaddr + 5;
        assert_eq!(site_end.wrapping_add(disp as i64 as u64), plt.vaddr);

        // One slot fill deferred to the loader.
        assert_eq!(out.dynamic_relocations.len(), 1);
        assert_eq!(out.dynamic_relocations[0].offset, got.vaddr);
        assert_eq!(out.dynamic_relocations[0].kind, RelocKind::Abs64);
    }
}
