//! Log syscall.

use muon_core::errno::Errno;
use muon_core::kdebug;

use super::user_cstr;

/// `debuglog(message)`: writes a string to the kernel log. Returns the
/// string length.
pub fn sys_debug_log(msg_ptr: u64) -> Result<i64, Errno> {
    let message = user_cstr(msg_ptr)?;
    let trimmed = message.strip_suffix('\n').unwrap_or(&message);
    kdebug!("{}", trimmed);
    Ok(message.len() as i64)
}
