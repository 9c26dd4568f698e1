//! Boot-relative and wall-clock time.
//!
//! [`boot_nanos`] is the HPET main counter; scheduler deadlines and the
//! timeslice math all use it. The wall-clock base is injected once by an
//! external RTC collaborator; VFS timestamps are `wall_clock_base +
//! boot_nanos`.

use core::sync::atomic::{AtomicU64, Ordering};

/// Wall-clock value (ns since the epoch) at boot_nanos() == 0.
static WALL_CLOCK_BASE: AtomicU64 = AtomicU64::new(0);

/// Nanoseconds since boot.
pub fn boot_nanos() -> u64 {
    crate::arch::x86_64::hpet::now_ns()
}

/// Records the wall-clock base (from the RTC driver).
pub fn set_wall_clock_base(epoch_ns: u64) {
    WALL_CLOCK_BASE.store(epoch_ns, Ordering::Release);
}

/// Nanoseconds since the epoch, as well as the kernel can know.
pub fn wall_nanos() -> u64 {
    WALL_CLOCK_BASE.load(Ordering::Acquire) + boot_nanos()
}

/// Timer ticks (milliseconds) since boot, for log timestamps.
pub fn ticks_ms() -> u64 {
    boot_nanos() / 1_000_000
}
