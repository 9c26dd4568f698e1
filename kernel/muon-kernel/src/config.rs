//! Compile-time kernel configuration.

/// Maximum CPUs the kernel will bring up.
pub const MAX_CPUS: usize = 32;

/// Kernel and user stack size per task.
pub const STACK_SIZE: usize = 4096;

/// Scheduler timeslice in nanoseconds (APIC timer period).
pub const TIMESLICE_NS: u64 = 1_000_000;

/// Base of the higher-half physical mirror.
pub const HHDM_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Virtual base the kernel image runs at.
pub const KERNEL_VIRT_BASE: u64 = 0xFFFF_FFFF_8020_0000;

/// Base address ET_DYN interpreters are rebased to.
pub const INTERP_BASE: u64 = 0x4000_0000;

/// Physical address the SMP trampoline blob is copied to.
pub const TRAMPOLINE_ADDR: u64 = 0x70000;

/// First file handle value handed to userspace.
pub const VFS_MIN_HANDLE: i64 = 100;

/// Maximum absolute path length.
pub const VFS_MAX_PATH_LEN: usize = 4096;

/// Maximum single path component length.
pub const VFS_MAX_NAME_LEN: usize = 256;

/// TTY input/output ring capacity in bytes.
pub const TTY_BUFFER_SIZE: usize = 4096;

/// Pipe ring capacity in bytes.
pub const PIPE_BUFFER_SIZE: usize = 4096;
