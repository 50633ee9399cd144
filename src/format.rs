//! On-disk FLE representation and dependency search.
//!
//! The core linker and loader only ever see the in-memory object model;
//! this module is the boundary that turns files into `Input` values and
//! back. The body is a postcard-serialized `Input` behind a short magic.

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::object::{Input, Object};

/// Conventional file extension for FLE objects.
pub const EXTENSION: &str = ".fle";

/// Environment variable holding the colon-separated library search path.
pub const LIBRARY_PATH_VAR: &str = "FLE_LIBRARY_PATH";

const MAGIC: &[u8; 4] = b"FLE\x01";

/// Reads one FLE file (object, shared object, executable or archive).
pub fn read(path: &Path) -> Result<Input> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };
    let Some(body) = mmap.strip_prefix(&MAGIC[..]) else {
        bail!("{} is not an FLE file", path.display());
    };
    postcard::from_bytes(body).with_context(|| format!("failed to parse {}", path.display()))
}

/// Reads a file that must be a plain object (not an archive).
pub fn read_object(path: &Path) -> Result<Object> {
    match read(path)? {
        Input::Object(obj) => Ok(obj),
        Input::Archive(_) => bail!("{} is an archive, expected an object", path.display()),
    }
}

/// Writes one FLE file.
pub fn write(path: &Path, input: &Input) -> Result<()> {
    let mut bytes = MAGIC.to_vec();
    bytes.extend(postcard::to_allocvec(input)?);
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

pub fn write_object(path: &Path, object: &Object) -> Result<()> {
    write(path, &Input::Object(object.clone()))
}

/// The library directories named by `FLE_LIBRARY_PATH` (colon-separated).
pub fn default_search_dirs() -> Vec<PathBuf> {
    match std::env::var(LIBRARY_PATH_VAR) {
        Ok(value) => value
            .split(':')
            .filter(|part| !part.is_empty())
            .map(PathBuf::from)
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Resolves a logical dependency name to a parsed object: the name
/// verbatim, then with the conventional extension, then each search
/// directory (basename and full name, both spellings). The first file
/// that parses successfully wins.
pub fn find_dependency(name: &str, search_dirs: &[PathBuf]) -> Result<Object> {
    let mut candidates: Vec<PathBuf> = vec![
        PathBuf::from(name),
        PathBuf::from(format!("{}{}", name, EXTENSION)),
    ];
    let basename = Path::new(name)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    for dir in search_dirs {
        candidates.push(dir.join(&basename));
        candidates.push(dir.join(format!("{}{}", basename, EXTENSION)));
        candidates.push(dir.join(name));
        candidates.push(dir.join(format!("{}{}", name, EXTENSION)));
    }

    for candidate in &candidates {
        if let Ok(object) = read_object(candidate) {
            tracing::debug!("resolved dependency {} at {}", name, candidate.display());
            return Ok(object);
        }
    }
    bail!("could not locate dependency: {}", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectKind, SymbolBinding};

    #[test]
    fn objects_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.fle");

        let mut obj = Object::new("unit.obj", ObjectKind::Relocatable);
        obj.push_section(".text", vec![0x90, 0xc3], vec![]);
        obj.push_symbol("f", SymbolBinding::Global, ".text", 0, 2);
        write_object(&path, &obj).unwrap();

        let back = read_object(&path).unwrap();
        assert_eq!(back.name, "unit.obj");
        assert_eq!(back.sections[".text"].data, vec![0x90, 0xc3]);
        assert_eq!(back.symbols.len(), 1);
    }

    #[test]
    fn garbage_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.fle");
        std::fs::write(&path, b"ELF? no.").unwrap();
        assert!(read(&path).is_err());
    }

    #[test]
    fn dependency_search_tries_extension_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let obj = Object::new("libx.so", ObjectKind::SharedObject);
        write_object(&dir.path().join("libx.so.fle"), &obj).unwrap();

        let found = find_dependency("libx.so", &[dir.path().to_path_buf()]).unwrap();
        assert_eq!(found.name, "libx.so");
        assert_eq!(found.kind, ObjectKind::SharedObject);

        let err = find_dependency("libmissing.so", &[dir.path().to_path_buf()]).unwrap_err();
        assert!(err.to_string().contains("could not locate dependency"));
    }
}
