//! File syscalls.

extern crate alloc;

use alloc::string::String;

use muon_core::errno::{EBADF, EINVAL, EPERM, Errno};

use crate::fs::{OpenMode, SeekWhence, path};
use crate::sched::eventbus::EventKind;

use super::{user_bytes, user_bytes_mut, user_cstr};

/// Standard descriptor numbers below the VFS handle base.
const STDIN: i64 = 0;
const STDOUT: i64 = 1;
const STDERR: i64 = 2;

/// `openat(dirfd, path, flags, mode)` marker for "relative to cwd".
const AT_FDCWD: i64 = -100;

fn cwd_of_current() -> String {
    crate::sched::with_current(|t| t.cwd.clone()).unwrap_or_else(|| String::from("/"))
}

/// `openat`: resolves the path (relative paths against the task's cwd,
/// AT_FDCWD selecting it explicitly) and opens read-write.
pub fn sys_openat(dirfd: i64, path_ptr: u64, _flags: u64, _mode: u64) -> Result<i64, Errno> {
    let raw = user_cstr(path_ptr)?;
    let abs = if raw.starts_with('/') {
        raw
    } else {
        if dirfd != AT_FDCWD && dirfd >= 0 {
            // Directory-handle-relative lookups are not supported.
            return Err(EINVAL);
        }
        path::absolutize(&cwd_of_current(), &raw)
    };
    crate::fs::vfs::open(&abs, OpenMode::ReadWrite)
        .map_err(|e| e.errno())
}

/// `read`: stdin waits for one key event; handles go to the VFS.
pub fn sys_read(fd: i64, buf_ptr: u64, count: u64) -> Result<i64, Errno> {
    if fd == STDIN {
        if count == 0 {
            return Ok(0);
        }
        let buf = user_bytes_mut(buf_ptr, 1)?;
        let para = crate::sched::wait_event(EventKind::KeyPressed);
        let key = (para & 0xFF) as u8;
        if key == 0 {
            return Ok(0);
        }
        buf[0] = key;
        return Ok(1);
    }
    if fd < crate::config::VFS_MIN_HANDLE {
        return Err(if fd <= STDERR { EPERM } else { EBADF });
    }
    let buf = user_bytes_mut(buf_ptr, count)?;
    crate::fs::vfs::read(fd, buf)
        .map(|n| n as i64)
        .map_err(|e| e.errno())
}

/// `write`: stdout/stderr echo through the system TTY; handles go to the
/// VFS.
pub fn sys_write(fd: i64, buf_ptr: u64, count: u64) -> Result<i64, Errno> {
    let buf = user_bytes(buf_ptr, count)?;
    if fd == STDOUT || fd == STDERR {
        return Ok(crate::proc::console_write(buf) as i64);
    }
    if fd < crate::config::VFS_MIN_HANDLE {
        return Err(if fd == STDIN { EPERM } else { EBADF });
    }
    crate::fs::vfs::write(fd, buf)
        .map(|n| n as i64)
        .map_err(|e| e.errno())
}

/// `seek`. Returns the resulting position; `seek(fd, 0, CURRENT)` is how
/// userspace spells tell (the ABI has no separate call number for it).
pub fn sys_seek(fd: i64, offset: i64, whence: i64) -> Result<i64, Errno> {
    let whence = SeekWhence::from_raw(whence).ok_or(EINVAL)?;
    if whence == SeekWhence::Current && offset == 0 {
        return crate::fs::vfs::tell(fd).map_err(|e| e.errno());
    }
    crate::fs::vfs::seek(fd, offset, whence).map_err(|e| e.errno())
}

/// `close`.
pub fn sys_close(fd: i64) -> Result<i64, Errno> {
    crate::fs::vfs::close(fd).map(|()| 0).map_err(|e| e.errno())
}

/// `ioctl`: routed to the backing filesystem; unsupported requests fail.
pub fn sys_ioctl(fd: i64, request: u64, arg: u64) -> Result<i64, Errno> {
    if fd < crate::config::VFS_MIN_HANDLE {
        return Err(EBADF);
    }
    crate::fs::vfs::ioctl(fd, request, arg).map_err(|e| e.errno())
}
