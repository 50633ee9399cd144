//! Raw memory mapping and protection.
//!
//! The one module allowed to use non-memory-safe primitives. Everything
//! else in the crate works on owned byte buffers and computed addresses;
//! the loader funnels every reservation, fixed mapping, byte store and
//! permission change through here.

use anyhow::{bail, Result};

use crate::object::perm;

/// Reserves `len` bytes of address space as a single anonymous, no-access
/// region and returns its base. With `low_address` the reservation is
/// first attempted inside the 32-bit-reachable region so 4-byte relative
/// displacements cannot overflow, falling back to an unconstrained
/// mapping.
pub fn reserve(len: u64, low_address: bool) -> Result<u64> {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    if low_address {
        flags |= libc::MAP_32BIT;
    }
    let mut addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len as libc::size_t,
            libc::PROT_NONE,
            flags,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED && low_address {
        tracing::warn!("32-bit reservation of {} bytes failed, retrying unconstrained", len);
        addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len as libc::size_t,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
    }
    if addr == libc::MAP_FAILED {
        bail!(
            "memory reservation failed for {} bytes: {}",
            len,
            std::io::Error::last_os_error()
        );
    }
    Ok(addr as u64)
}

/// Maps a fixed, writable, anonymous region at `addr`. The address must be
/// page-aligned; an existing reservation there is replaced.
pub fn map_fixed(addr: u64, len: u64) -> Result<()> {
    let mapped = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len as libc::size_t,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        bail!(
            "segment mapping failed at 0x{:x} ({} bytes): {}",
            addr,
            len,
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Copies bytes into mapped memory at an absolute address.
pub fn poke(addr: u64, bytes: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
    }
}

/// Sets final page permissions from segment R/W/X bits.
pub fn protect(addr: u64, len: u64, flags: u32) -> Result<()> {
    let mut prot = 0;
    if flags & perm::R != 0 {
        prot |= libc::PROT_READ;
    }
    if flags & perm::W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if flags & perm::X != 0 {
        prot |= libc::PROT_EXEC;
    }
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len as libc::size_t, prot) };
    if rc != 0 {
        bail!(
            "mprotect failed at 0x{:x} ({} bytes): {}",
            addr,
            len,
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Transfers control to a no-argument, int-returning entry point.
///
/// # Safety
/// `entry` must be the address of mapped, executable code following the
/// C calling convention.
pub unsafe fn call_entry(entry: u64) -> i32 {
    let func: extern "C" fn() -> i32 = std::mem::transmute(entry as usize);
    func()
}
