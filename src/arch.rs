//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates all
//! architecture-specific logic: the relocation arithmetic shared by the
//! link-time and load-time appliers, and call-stub emission for the
//! PLT-style stub table. Keeping both phases behind one trait guarantees
//! they can never diverge in encoding.

use anyhow::Result;

use crate::object::RelocKind;

pub mod x86_64;

/// A target architecture backend.
pub trait Architecture {
    /// Computes and encodes the value for one relocation.
    ///
    /// # Arguments
    /// * `kind` - The relocation kind.
    /// * `s` - The resolved symbol value (S). For `GotRel32` the caller
    ///   passes the indirection-table slot address in place of S.
    /// * `a` - The addend (A).
    /// * `p` - The runtime address of the patch site (P).
    ///
    /// Returns the little-endian bytes in a fixed buffer plus the number
    /// of valid bytes.
    fn relocation_bytes(&self, kind: RelocKind, s: u64, a: i64, p: u64)
        -> Result<([u8; 8], usize)>;

    /// Length in bytes of one call stub.
    fn call_stub_len(&self) -> u64;

    /// Size in bytes of one indirection-table slot.
    fn got_entry_size(&self) -> u64;

    /// Emits one call stub: an indirect jump through the slot at the given
    /// signed displacement from the end of the stub. The slot itself is
    /// filled with an absolute address by the loader.
    fn emit_call_stub(&self, displacement: i32) -> Vec<u8>;
}
