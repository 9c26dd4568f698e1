//! Process syscalls.

use muon_core::errno::{EAGAIN, EINVAL, Errno};

use crate::arch::x86_64::instructions::{MSR_FS_BASE, write_msr};
use crate::sched::task::{TID_NONE, TaskRegs};

use super::{user_cstr, user_str_array};

/// `getpid`.
pub fn sys_getpid() -> Result<i64, Errno> {
    crate::sched::current_tid().map(i64::from).ok_or(EINVAL)
}

/// `getppid`.
pub fn sys_getppid() -> Result<i64, Errno> {
    crate::sched::with_current(|t| t.ptid)
        .filter(|&ptid| ptid != TID_NONE)
        .map(i64::from)
        .ok_or(EINVAL)
}

/// `set_fs_base`: thread-local storage pointer. Persisted in the task so
/// the scheduler restores it.
pub fn sys_set_fs_base(value: u64) -> Result<i64, Errno> {
    crate::sched::with_current(|t| t.fs_base = value);
    write_msr(MSR_FS_BASE, value);
    Ok(0)
}

/// `fork`: clones the calling task around its entry frame. The parent
/// gets the child tid; the child resumes from the cloned frame with 0.
pub fn sys_fork(frame: &mut TaskRegs) -> Result<i64, Errno> {
    let child = crate::sched::fork(frame);
    if child == TID_NONE {
        return Err(EAGAIN);
    }
    Ok(i64::from(child))
}

/// `execve(path, argv, envp)`: spawns the program as a child of the
/// calling task, inheriting its open files and working directory. Returns
/// the child tid.
pub fn sys_execve(path_ptr: u64, argv_ptr: u64, envp_ptr: u64) -> Result<i64, Errno> {
    let path = user_cstr(path_ptr)?;
    let argv = user_str_array(argv_ptr)?;
    let envp = user_str_array(envp_ptr)?;
    crate::proc::execve(&path, &argv, &envp)
        .map(i64::from)
        .map_err(|e| e.errno())
}

/// `exit`: never returns to the caller; the frame it leaves behind is
/// dead.
pub fn sys_exit(status: i64) -> Result<i64, Errno> {
    crate::sched::exit(status)
}
