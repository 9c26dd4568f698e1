//! User-pointer marshalling.
//!
//! User mappings are identity-mapped in the task's address space and the
//! syscall path runs with the task's CR3, so user pointers are directly
//! dereferenceable from ring 0 (no SMAP). These helpers centralise the
//! bounds discipline: NUL-terminated strings are capped, slices are length
//! checked against the user half of the address space.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use muon_core::errno::{EFAULT, ENAMETOOLONG, Errno};

use crate::config::{HHDM_BASE, VFS_MAX_PATH_LEN};

fn check_user_range(ptr: u64, len: u64) -> Result<(), Errno> {
    if ptr == 0 || ptr.checked_add(len).is_none_or(|end| end >= HHDM_BASE) {
        return Err(EFAULT);
    }
    Ok(())
}

/// Borrows `len` bytes of user memory.
pub fn user_bytes<'a>(ptr: u64, len: u64) -> Result<&'a [u8], Errno> {
    check_user_range(ptr, len)?;
    // SAFETY: Range-checked against the user half; the task's mappings
    // back it (a stale pointer faults like it would in user mode).
    Ok(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) })
}

/// Borrows `len` bytes of user memory, writable.
pub fn user_bytes_mut<'a>(ptr: u64, len: u64) -> Result<&'a mut [u8], Errno> {
    check_user_range(ptr, len)?;
    // SAFETY: See user_bytes.
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

/// Copies a NUL-terminated user string, capped at the path limit.
pub fn user_cstr(ptr: u64) -> Result<String, Errno> {
    check_user_range(ptr, 1)?;
    let mut len = 0u64;
    // SAFETY: Byte-wise probe below the user-half boundary.
    unsafe {
        while *( (ptr + len) as *const u8) != 0 {
            len += 1;
            if len as usize > VFS_MAX_PATH_LEN {
                return Err(ENAMETOOLONG);
            }
            check_user_range(ptr, len)?;
        }
    }
    let bytes = user_bytes(ptr, len)?;
    core::str::from_utf8(bytes)
        .map(ToString::to_string)
        .map_err(|_| EFAULT)
}

/// Copies a NULL-terminated array of user string pointers (argv/envp).
/// A null array pointer yields an empty vector.
pub fn user_str_array(ptr: u64) -> Result<Vec<String>, Errno> {
    if ptr == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for index in 0..64u64 {
        check_user_range(ptr + index * 8, 8)?;
        // SAFETY: Range-checked slot in the user pointer array.
        let entry = unsafe { *((ptr + index * 8) as *const u64) };
        if entry == 0 {
            return Ok(out);
        }
        out.push(user_cstr(entry)?);
    }
    Err(EFAULT)
}
