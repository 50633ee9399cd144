//! x86_64 architecture backend.
//!
//! Implements the `Architecture` trait for 64-bit x86. All values are
//! written little-endian.

use super::Architecture;
use anyhow::{anyhow, Result};

use crate::object::RelocKind;

/// Bytes of one PLT-style call stub: `jmp *disp32(%rip)`.
pub const CALL_STUB_LEN: u64 = 6;

/// Bytes of one GOT-style indirection slot (an absolute address).
pub const GOT_ENTRY_SIZE: u64 = 8;

/// The x86_64 architecture backend.
pub struct X86_64;

impl Architecture for X86_64 {
    fn relocation_bytes(
        &self,
        kind: RelocKind,
        s: u64,
        a: i64,
        p: u64,
    ) -> Result<([u8; 8], usize)> {
        let mut out = [0u8; 8];
        match kind {
            // S + A, 8 bytes.
            RelocKind::Abs64 => {
                let value = (s as i64).wrapping_add(a) as u64;
                out.copy_from_slice(&value.to_le_bytes());
                Ok((out, 8))
            }
            // truncate(S + A), 4 bytes. The zero- vs sign-extension
            // distinction only matters to the consuming instruction; the
            // stored bytes are identical.
            RelocKind::Abs32 | RelocKind::Abs32Signed => {
                let value = (s as i64).wrapping_add(a) as u64 as u32;
                out[..4].copy_from_slice(&value.to_le_bytes());
                Ok((out, 4))
            }
            // S + A - P, 4 bytes, two's-complement. x86_64 PC-relative
            // displacements are signed 32-bit, so overflow is an error.
            RelocKind::PCRel32 | RelocKind::GotRel32 => {
                let value = (s as i64).wrapping_add(a).wrapping_sub(p as i64);
                if value < i64::from(i32::MIN) || value > i64::from(i32::MAX) {
                    return Err(anyhow!(
                        "relocation overflow at 0x{:x}: displacement 0x{:x} exceeds the signed \
                         32-bit range (S=0x{:x}); target must be within 2GB of the site",
                        p,
                        value,
                        s
                    ));
                }
                out[..4].copy_from_slice(&(value as i32).to_le_bytes());
                Ok((out, 4))
            }
        }
    }

    fn call_stub_len(&self) -> u64 {
        CALL_STUB_LEN
    }

    fn got_entry_size(&self) -> u64 {
        GOT_ENTRY_SIZE
    }

    fn emit_call_stub(&self, displacement: i32) -> Vec<u8> {
        // ff 25 disp32: jmp *disp32(%rip). The displacement is measured
        // from the end of the stub to the indirection slot.
        let mut stub = Vec::with_capacity(CALL_STUB_LEN as usize);
        stub.extend_from_slice(&[0xff, 0x25]);
        stub.extend_from_slice(&displacement.to_le_bytes());
        stub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs64_round_trips() {
        let arch = X86_64;
        let (bytes, len) = arch
            .relocation_bytes(RelocKind::Abs64, 0x401000, 0x30, 0xdead)
            .unwrap();
        assert_eq!(len, 8);
        assert_eq!(u64::from_le_bytes(bytes), 0x401030);
    }

    #[test]
    fn pcrel32_is_twos_complement() {
        let arch = X86_64;
        let s = 0x401000u64;
        let p = 0x402000u64;
        let (bytes, len) = arch.relocation_bytes(RelocKind::PCRel32, s, -4, p).unwrap();
        assert_eq!(len, 4);
        let decoded = i32::from_le_bytes(bytes[..4].try_into().unwrap());
        assert_eq!(i64::from(decoded), s as i64 - 4 - p as i64);
    }

    #[test]
    fn pcrel32_rejects_out_of_range_displacement() {
        let arch = X86_64;
        let err = arch
            .relocation_bytes(RelocKind::PCRel32, 0x7fff_ffff_0000, 0, 0x1000)
            .unwrap_err();
        assert!(err.to_string().contains("relocation overflow"));
    }

    // GotRel32 is reserved for indirection-table-relative access: it uses
    // the identical arithmetic as PCRel32 with the slot address standing in
    // for S. Pin that here so the two can never drift apart.
    #[test]
    fn gotrel32_matches_pcrel32_arithmetic() {
        let arch = X86_64;
        let slot = 0x404018u64;
        let p = 0x401123u64;
        let got = arch
            .relocation_bytes(RelocKind::GotRel32, slot, -4, p)
            .unwrap();
        let pc = arch
            .relocation_bytes(RelocKind::PCRel32, slot, -4, p)
            .unwrap();
        assert_eq!(got, pc);
    }

    #[test]
    fn abs32_truncates() {
        let arch = X86_64;
        let (bytes, len) = arch
            .relocation_bytes(RelocKind::Abs32, 0x1_0000_0004, 0, 0)
            .unwrap();
        assert_eq!(len, 4);
        assert_eq!(u32::from_le_bytes(bytes[..4].try_into().unwrap()), 4);
    }

    #[test]
    fn call_stub_is_indirect_jump_through_slot() {
        let arch = X86_64;
        let stub = arch.emit_call_stub(-0x1234);
        assert_eq!(stub.len() as u64, arch.call_stub_len());
        assert_eq!(&stub[..2], &[0xff, 0x25]);
        assert_eq!(
            i32::from_le_bytes(stub[2..6].try_into().unwrap()),
            -0x1234
        );
    }
}
