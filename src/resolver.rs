//! Symbol resolution.
//!
//! Builds the global symbol table for one link unit, applying the
//! binding-strength conflict rules, and decides which names must be
//! treated as externally supplied (resolved through the indirection
//! table at load time).

use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::layout::Layout;
use crate::object::{group_for, Object, Symbol, SymbolBinding};

/// The global symbol table of one link unit. Entries are rebased: their
/// `section` is the canonical group name and their `offset` the offset
/// within the merged group.
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: BTreeMap<String, Symbol>,
}

fn strength(binding: SymbolBinding) -> u8 {
    match binding {
        SymbolBinding::Global => 3,
        SymbolBinding::Weak => 2,
        SymbolBinding::Local => 1,
        SymbolBinding::Undefined => 0,
    }
}

impl SymbolTable {
    /// Inserts one rebased symbol, applying the conflict rules: a stronger
    /// binding replaces a weaker one, equal strength keeps the first
    /// definition, and two Global definitions of one name are fatal.
    pub fn insert(&mut self, symbol: Symbol) -> Result<()> {
        if let Some(existing) = self.entries.get(&symbol.name) {
            if symbol.binding == SymbolBinding::Global
                && existing.binding == SymbolBinding::Global
            {
                bail!("multiple strong definition of symbol: {}", symbol.name);
            }
            if strength(symbol.binding) <= strength(existing.binding) {
                return Ok(());
            }
        }
        self.entries.insert(symbol.name.clone(), symbol);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.entries.values()
    }

    /// Resolves a reference made from `object_name` to `bare`: the
    /// Local-namespaced form wins if present, otherwise the bare name.
    pub fn site_name(&self, object_name: &str, bare: &str) -> String {
        let namespaced = format!("{}::{}", object_name, bare);
        if self.entries.contains_key(&namespaced) {
            namespaced
        } else {
            bare.to_string()
        }
    }
}

/// Result of scanning the working set.
#[derive(Debug)]
pub struct Resolution {
    pub table: SymbolTable,
    /// Names that must be resolved through the indirection table.
    pub externals: BTreeSet<String>,
}

/// Scans the working set and produces the global table plus the external
/// name set.
///
/// Externals start as every name referenced Undefined, plus Weak non-text
/// definitions (so shared objects leave their data open to load-time
/// interposition). In executable mode the set is then pruned to names
/// that the working set does not define and that a declared shared object
/// provides; in shared-object mode everything is deferred to load time.
pub fn resolve(
    objects: &[Object],
    layout: &Layout,
    shared_sections: &HashMap<String, String>,
    shared_mode: bool,
) -> Result<Resolution> {
    let mut table = SymbolTable::default();
    let mut externals = BTreeSet::new();

    for (obj_idx, obj) in objects.iter().enumerate() {
        for sym in &obj.symbols {
            if sym.binding == SymbolBinding::Undefined {
                externals.insert(sym.name.clone());
                continue;
            }
            if sym.binding == SymbolBinding::Weak && group_for(&sym.section) != Some(".text") {
                externals.insert(sym.name.clone());
            }

            let Some(group) = group_for(&sym.section) else {
                bail!(
                    "symbol {} in {} lives in unknown section {}",
                    sym.name,
                    obj.name,
                    sym.section
                );
            };
            let section_base = layout.section_offset(obj_idx, &sym.section).ok_or_else(|| {
                anyhow::anyhow!("section {} of {} was never merged", sym.section, obj.name)
            })?;

            let mut rebased = sym.clone();
            if sym.binding == SymbolBinding::Local {
                rebased.name = format!("{}::{}", obj.name, sym.name);
            }
            rebased.section = group.to_string();
            rebased.offset = section_base + sym.offset;
            table.insert(rebased)?;
        }
    }

    if !shared_mode {
        externals.retain(|name| !table.contains(name) && shared_sections.contains_key(name));
    }

    Ok(Resolution { table, externals })
}
