//! Module loading and execution.
//!
//! Given a linked executable, a `LoadSession` resolves and memory-maps it
//! together with its shared-object dependencies, applies load-time
//! relocations across all mapped modules, finalizes page permissions and
//! (optionally) transfers control to the entry point.
//!
//! A session is single-shot: one root executable in, one process image
//! out. All registry state lives on the session, so repeated in-process
//! use starts from a clean slate every time.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::arch::x86_64::X86_64;
use crate::arch::Architecture;
use crate::format;
use crate::mem;
use crate::object::{Object, ObjectKind, RelocKind, SymbolBinding};

/// One mapped module: the root executable or a shared-object dependency.
pub struct LoadedModule {
    pub name: String,
    pub object: Object,
    /// Base address the module's link-time addresses are biased by.
    /// Zero for the root executable.
    pub load_bias: u64,
    /// Absolute runtime address of each mapped section group.
    pub section_addrs: BTreeMap<String, u64>,
}

/// Per-execution loading context.
///
/// Owns the module registry, the loaded-name set and the dependency-scan
/// results for exactly one `load` call.
pub struct LoadSession<A: Architecture = X86_64> {
    arch: A,
    modules: Vec<LoadedModule>,
    loaded_names: HashSet<String>,
    scanned_names: HashSet<String>,
    /// Set when any transitively-reached shared object carries a
    /// PC-relative dynamic relocation; forces 32-bit-reachable mappings.
    needs_low_address: bool,
    search_dirs: Vec<PathBuf>,
    entry: Option<u64>,
}

impl LoadSession<X86_64> {
    /// A session searching the directories named by `FLE_LIBRARY_PATH`.
    pub fn new() -> Self {
        Self::with_search_dirs(format::default_search_dirs())
    }

    /// A session with an explicit dependency search path.
    pub fn with_search_dirs(search_dirs: Vec<PathBuf>) -> Self {
        Self {
            arch: X86_64,
            modules: Vec::new(),
            loaded_names: HashSet::new(),
            scanned_names: HashSet::new(),
            needs_low_address: false,
            search_dirs,
            entry: None,
        }
    }
}

impl Default for LoadSession<X86_64> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Architecture> LoadSession<A> {
    /// Maps the executable and every transitive dependency, applies all
    /// relocations and sets final permissions, without transferring
    /// control. Returns the absolute entry address.
    pub fn load(&mut self, object: Object) -> Result<u64> {
        if object.kind != ObjectKind::Executable {
            bail!("{} is not an executable", object.name);
        }
        let entry = object
            .entry
            .with_context(|| format!("{} has no entry address", object.name))?;

        for dep in object.needed.clone() {
            self.scan_dependency(&dep);
        }

        // The root is already in memory; map it at its absolute addresses.
        let name = if object.name.is_empty() {
            "main".to_string()
        } else {
            object.name.clone()
        };
        self.loaded_names.insert(name.clone());
        let root = self.map_segments(name, object, 0)?;
        let needed = root.object.needed.clone();
        self.modules.push(root);
        for dep in needed {
            self.load_dependency(&dep)?;
        }

        self.relocate_all()?;
        self.protect_all()?;
        self.entry = Some(entry);
        Ok(entry)
    }

    /// The loaded modules, root first, dependencies in first-encountered
    /// order. This is also the symbol resolution order.
    pub fn modules(&self) -> &[LoadedModule] {
        &self.modules
    }

    pub fn entry_address(&self) -> Option<u64> {
        self.entry
    }

    /// Invokes the entry point of a loaded image.
    ///
    /// # Safety
    /// The image must have been produced by a successful `load`; the entry
    /// code runs with full access to the process.
    pub unsafe fn invoke_entry(&self) -> Result<i32> {
        let entry = self
            .entry
            .context("no image loaded; call load() first")?;
        Ok(mem::call_entry(entry))
    }

    /// Pre-scan: walks the `needed` graph to decide whether any shared
    /// object carries a PC-relative dynamic relocation. Load errors are
    /// ignored here; the real load reports them.
    fn scan_dependency(&mut self, name: &str) {
        if !self.scanned_names.insert(name.to_string()) {
            return;
        }
        let Ok(object) = format::find_dependency(name, &self.search_dirs) else {
            return;
        };
        // PC-relative fixups arrive attached to sections (deferred
        // shared-object relocations); slot fills are always absolute. Scan
        // both so a 4-byte displacement can never be asked to span more
        // than 32 bits.
        let pc_relative = object
            .dynamic_relocations
            .iter()
            .chain(object.sections.values().flat_map(|s| s.relocations.iter()))
            .any(|r| matches!(r.kind, RelocKind::PCRel32 | RelocKind::GotRel32));
        if object.kind == ObjectKind::SharedObject && pc_relative {
            tracing::debug!("{} has PC-relative load-time relocations", name);
            self.needs_low_address = true;
        }
        for dep in &object.needed {
            self.scan_dependency(dep);
        }
    }

    /// Loads one dependency and, depth-first, its own dependencies.
    /// Idempotent: diamond dependencies are mapped exactly once.
    fn load_dependency(&mut self, name: &str) -> Result<()> {
        if self.loaded_names.contains(name) {
            return Ok(());
        }
        let object = format::find_dependency(name, &self.search_dirs)?;
        self.loaded_names.insert(name.to_string());

        // Reserve the module's whole segment span as one region; its base
        // becomes the load bias.
        let span = object
            .segments
            .iter()
            .filter(|seg| seg.size > 0)
            .map(|seg| seg.vaddr + seg.size)
            .max();
        let load_bias = match span {
            Some(span) => {
                if self.needs_low_address {
                    tracing::warn!("loading {} into low address space for PC-relative reach", name);
                }
                mem::reserve(span, self.needs_low_address)?
            }
            None => 0,
        };

        let module = self.map_segments(name.to_string(), object, load_bias)?;
        let needed = module.object.needed.clone();
        self.modules.push(module);
        for dep in needed {
            self.load_dependency(&dep)?;
        }
        Ok(())
    }

    /// Maps every non-empty segment of one module at bias + vaddr,
    /// writable, and copies its section bytes in (zero-fill segments stay
    /// untouched; the fresh mapping is already zero).
    fn map_segments(&self, name: String, object: Object, load_bias: u64) -> Result<LoadedModule> {
        let mut section_addrs = BTreeMap::new();
        for seg in &object.segments {
            if seg.size == 0 {
                continue;
            }
            let addr = load_bias + seg.vaddr;
            mem::map_fixed(addr, seg.size)?;

            let section = object
                .sections
                .get(&seg.name)
                .with_context(|| format!("section data missing for segment {}", seg.name))?;
            if !seg.name.starts_with(".bss") {
                let len = section.data.len().min(seg.size as usize);
                mem::poke(addr, &section.data[..len]);
            }
            section_addrs.insert(seg.name.clone(), addr);
            tracing::trace!("{}: mapped {} at 0x{:x}", name, seg.name, addr);
        }
        Ok(LoadedModule {
            name,
            object,
            load_bias,
            section_addrs,
        })
    }

    /// Resolves a name across all loaded modules: registry order, first
    /// Global or Weak definition wins.
    fn resolve_symbol(&self, name: &str) -> Result<u64> {
        for module in &self.modules {
            for sym in &module.object.symbols {
                if sym.name == name
                    && matches!(sym.binding, SymbolBinding::Global | SymbolBinding::Weak)
                {
                    if let Some(base) = module.section_addrs.get(&sym.section) {
                        return Ok(base + sym.offset);
                    }
                }
            }
        }
        bail!("symbol not found: {}", name);
    }

    /// Applies both load-time relocation passes for every module:
    /// dynamic relocations (slot fills; offsets are bias-relative), then
    /// relocations still attached to sections (deferred shared-object
    /// fixups; offsets are section-relative).
    fn relocate_all(&self) -> Result<()> {
        for module in &self.modules {
            for reloc in &module.object.dynamic_relocations {
                // Absolute for the root (bias zero), bias-relative for
                // shared objects.
                let site = module.load_bias + reloc.offset;
                let s = self.resolve_symbol(&reloc.symbol)?;
                let (bytes, len) =
                    self.arch
                        .relocation_bytes(reloc.kind, s, reloc.addend, site)?;
                mem::poke(site, &bytes[..len]);
            }

            for section in module.object.sections.values() {
                if section.relocations.is_empty() {
                    continue;
                }
                let Some(base) = module.section_addrs.get(&section.name) else {
                    continue;
                };
                for reloc in &section.relocations {
                    let site = base + reloc.offset;
                    let s = self.resolve_symbol(&reloc.symbol)?;
                    let (bytes, len) =
                        self.arch
                            .relocation_bytes(reloc.kind, s, reloc.addend, site)?;
                    mem::poke(site, &bytes[..len]);
                }
            }
        }
        Ok(())
    }

    /// Flips every segment of every module to its declared permissions.
    /// Runs only after all relocation is complete, because relocation
    /// writes into segments that end up read-only or executable.
    fn protect_all(&self) -> Result<()> {
        for module in &self.modules {
            for seg in &module.object.segments {
                if seg.size == 0 {
                    continue;
                }
                mem::protect(module.load_bias + seg.vaddr, seg.size, seg.flags)?;
            }
        }
        Ok(())
    }
}

/// Loads and runs an executable object. Does not return on success: the
/// entry point's return value becomes the process exit status.
pub fn execute(object: Object) -> Result<()> {
    let mut session = LoadSession::new();
    session.load(object)?;
    let status = unsafe { session.invoke_entry()? };
    std::process::exit(status);
}
