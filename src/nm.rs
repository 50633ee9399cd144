//! Symbol-table dump.
//!
//! A read-only view over any object's symbols: address, a type letter
//! derived from binding and owning section, and the name. For linked
//! objects the address folds in the owning section's assigned address.

use anyhow::Result;
use std::io::Write;

use crate::object::{Object, SymbolBinding};

fn type_letter(binding: SymbolBinding, section: &str) -> &'static str {
    match binding {
        SymbolBinding::Local => {
            if section.starts_with(".text") {
                "t"
            } else if section.starts_with(".bss") {
                "b"
            } else if section.starts_with(".rodata") {
                "r"
            } else {
                "d"
            }
        }
        SymbolBinding::Weak => {
            if section.starts_with(".text") {
                "W"
            } else {
                "V"
            }
        }
        SymbolBinding::Global => {
            if section.starts_with(".text") {
                "T"
            } else if section.starts_with(".bss") {
                "B"
            } else if section.starts_with(".rodata") {
                "R"
            } else {
                "D"
            }
        }
        SymbolBinding::Undefined => "UNDEF",
    }
}

/// Writes one line per symbol with a defined section.
pub fn dump<W: Write>(object: &Object, out: &mut W) -> Result<()> {
    for sym in &object.symbols {
        if sym.section.is_empty() {
            continue;
        }
        let section_addr = object
            .section_headers
            .iter()
            .find(|shdr| shdr.name == sym.section)
            .map(|shdr| shdr.addr)
            .unwrap_or(0);
        writeln!(
            out,
            "{:016x} {} {}",
            section_addr + sym.offset,
            type_letter(sym.binding, &sym.section),
            sym.name
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    #[test]
    fn dump_formats_addresses_and_type_letters() {
        let mut obj = Object::new("unit.obj", ObjectKind::Relocatable);
        obj.push_section(".text", vec![0xc3; 8], vec![]);
        obj.push_zero_fill(".bss", 16);
        obj.push_symbol("f", SymbolBinding::Global, ".text", 4, 1);
        obj.push_symbol("buf", SymbolBinding::Global, ".bss", 0, 16);
        obj.push_symbol("helper", SymbolBinding::Local, ".text", 0, 4);
        obj.push_symbol("fallback", SymbolBinding::Weak, ".data", 0, 8);

        let mut out = Vec::new();
        dump(&obj, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "0000000000000004 T f");
        assert_eq!(lines[1], "0000000000000000 B buf");
        assert_eq!(lines[2], "0000000000000000 t helper");
        assert_eq!(lines[3], "0000000000000000 V fallback");
    }
}
