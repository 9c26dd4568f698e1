//! Process management: program spawning and the console seam.

extern crate alloc;

mod exec;

use alloc::string::String;
use alloc::sync::Arc;

use muon_core::sync::SpinLock;

use crate::fs::{FileSystem, FsError, NodeIdent};
use crate::sched::task::Tid;

pub use exec::execve_with_parent;

/// The TTY instance behind stdout/stderr, set once at boot after the
/// `/dev/tty` mount.
#[allow(clippy::type_complexity)]
static SYSTEM_TTY: SpinLock<Option<(Arc<dyn FileSystem>, NodeIdent)>> = SpinLock::new(None);

/// Records the system TTY.
pub fn set_system_tty(fs: Arc<dyn FileSystem>, ident: NodeIdent) {
    *SYSTEM_TTY.lock() = Some((fs, ident));
}

/// Writes to the console through the system TTY; before the TTY exists
/// the bytes go to the kernel log sinks.
pub fn console_write(buf: &[u8]) -> usize {
    let tty = SYSTEM_TTY.lock().clone();
    match tty {
        Some((fs, ident)) => fs.write(&ident, 0, buf).unwrap_or(0),
        None => {
            muon_core::kprint!("{}", core::str::from_utf8(buf).unwrap_or("<bad utf8>"));
            buf.len()
        }
    }
}

/// Spawns a program as a child of the calling task (see
/// [`exec::execve_with_parent`]).
pub fn execve(path: &str, argv: &[String], envp: &[String]) -> Result<Tid, FsError> {
    let parent = crate::sched::current_tid();
    execve_with_parent(path, argv, envp, parent)
}

/// Spawns `/bin/init` as the first user task.
pub fn spawn_init() {
    let argv = [String::from("init")];
    match execve_with_parent("/bin/init", &argv, &[], None) {
        Ok(tid) => muon_core::kinfo!("proc: /bin/init spawned as tid {}", tid),
        Err(e) => panic!("failed to spawn /bin/init: {e:?}"),
    }
}
