//! Syscall dispatch.
//!
//! The identifier arrives in RAX, arguments in RDI/RSI/RDX/R10/R8/R9. The
//! result goes back in RAX and the errno in RDX; a failed call returns -1
//! with the errno also published through the per-CPU block. Unknown
//! numbers return -1 with ENOSYS.

mod io;
mod memory;
mod process;
mod user;
mod vfs;

use muon_core::errno::{ENOSYS, Errno};

use crate::sched::task::TaskRegs;

pub use user::{user_bytes, user_bytes_mut, user_cstr, user_str_array};

/// Call numbers (fixed ABI).
pub mod numbers {
    /// Write a string to the kernel log.
    pub const DEBUGLOG: u64 = 0;
    /// Allocate pages.
    pub const MMAP: u64 = 1;
    /// Open a path relative to a directory fd.
    pub const OPENAT: u64 = 2;
    /// Read from a handle (or stdin).
    pub const READ: u64 = 3;
    /// Write to a handle (or stdout/stderr).
    pub const WRITE: u64 = 4;
    /// Reposition a handle.
    pub const SEEK: u64 = 5;
    /// Close a handle.
    pub const CLOSE: u64 = 6;
    /// Write the FS base MSR.
    pub const SET_FS_BASE: u64 = 7;
    /// Device control.
    pub const IOCTL: u64 = 8;
    /// Current task id.
    pub const GETPID: u64 = 9;
    /// Clone the calling task.
    pub const FORK: u64 = 14;
    /// Spawn a program.
    pub const EXECVE: u64 = 15;
    /// Stat by path (unimplemented).
    pub const FSTATAT: u64 = 17;
    /// Stat by handle (unimplemented).
    pub const FSTAT: u64 = 18;
    /// Parent task id.
    pub const GETPPID: u64 = 19;
    /// File control (unimplemented).
    pub const FCNTL: u64 = 20;
    /// Terminate the calling task.
    pub const EXIT: u64 = 23;
}

/// Routes one syscall through its handler and writes the result back into
/// the entry frame.
pub fn dispatch(frame: &mut TaskRegs) {
    let nr = frame.rax;
    let (a0, a1, a2, a3, a4, a5) =
        (frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9);

    let result: Result<i64, Errno> = match nr {
        numbers::DEBUGLOG => io::sys_debug_log(a0),
        numbers::MMAP => memory::sys_mmap(a0, a1, a2, a3, a4, a5),
        numbers::OPENAT => vfs::sys_openat(a0 as i64, a1, a2, a3),
        numbers::READ => vfs::sys_read(a0 as i64, a1, a2),
        numbers::WRITE => vfs::sys_write(a0 as i64, a1, a2),
        numbers::SEEK => vfs::sys_seek(a0 as i64, a1 as i64, a2 as i64),
        numbers::CLOSE => vfs::sys_close(a0 as i64),
        numbers::SET_FS_BASE => process::sys_set_fs_base(a0),
        numbers::IOCTL => vfs::sys_ioctl(a0 as i64, a1, a2),
        numbers::GETPID => process::sys_getpid(),
        numbers::FORK => process::sys_fork(frame),
        numbers::EXECVE => process::sys_execve(a0, a1, a2),
        numbers::GETPPID => process::sys_getppid(),
        numbers::EXIT => process::sys_exit(a0 as i64),
        numbers::FSTATAT | numbers::FSTAT | numbers::FCNTL => Err(ENOSYS),
        _ => Err(ENOSYS),
    };

    let cpu = crate::percpu::current_cpu();
    match result {
        Ok(value) => {
            frame.rax = value as u64;
            frame.rdx = 0;
            cpu.set_errno(0);
        }
        Err(errno) => {
            frame.rax = (-1i64) as u64;
            frame.rdx = errno as u64;
            cpu.set_errno(errno);
        }
    }
}
