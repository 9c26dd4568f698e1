//! Task structure and lifecycle primitives.
//!
//! A task owns its kernel stack, optional user stack, address space and
//! mapping list. The saved register state lives in a [`TaskRegs`] trap
//! frame at the top of whichever stack took the last trap; the scheduler
//! only stores a pointer to it.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::fs::FileDesc;
use crate::mm::vmm::{AddressSpace, PageFlags};

use super::eventbus::Event;

/// Task identifier.
pub type Tid = u16;

/// Sentinel for "no task" (used as the parent id of orphans).
pub const TID_NONE: Tid = u16::MAX;

/// Scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Eligible to run, waiting in the queue.
    Ready,
    /// Occupying a CPU's running slot.
    Running,
    /// Waiting on a timer deadline or an event.
    Sleeping,
    /// Exited, but still holding live children.
    Dying,
    /// Exited and reapable.
    Dead,
}

/// Privilege mode the task was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// Ring 0; no user stack, no private low-half mappings.
    Kernel,
    /// Ring 3.
    User,
}

/// Trap frame: the register state saved across a context switch, in push
/// order. Lives at the top of the stack that took the trap.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TaskRegs {
    /// General registers, in the switch stubs' push order.
    pub r15: u64,
    /// See above.
    pub r14: u64,
    /// See above.
    pub r13: u64,
    /// See above.
    pub r12: u64,
    /// See above.
    pub r11: u64,
    /// See above.
    pub r10: u64,
    /// See above.
    pub r9: u64,
    /// See above.
    pub r8: u64,
    /// See above.
    pub rbp: u64,
    /// See above.
    pub rdi: u64,
    /// See above.
    pub rsi: u64,
    /// See above.
    pub rdx: u64,
    /// See above.
    pub rcx: u64,
    /// See above.
    pub rbx: u64,
    /// Syscall return value slot.
    pub rax: u64,
    /// Interrupt return frame.
    pub rip: u64,
    /// Code segment (selector | RPL).
    pub cs: u64,
    /// Saved RFLAGS.
    pub rflags: u64,
    /// Stack pointer to restore.
    pub rsp: u64,
    /// Stack segment (selector | RPL).
    pub ss: u64,
}

/// RFLAGS for fresh tasks: IF set, reserved bit 1.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// One user-visible mapping owned by a task, replicated on fork and torn
/// down on reap. Regions never overlap within one task.
#[derive(Debug, Clone, Copy)]
pub struct MemMap {
    /// Virtual base.
    pub vaddr: u64,
    /// Physical base.
    pub paddr: u64,
    /// Length in pages.
    pub pages: u64,
    /// Mapping flags.
    pub flags: PageFlags,
}

/// The scheduling unit.
pub struct Task {
    /// Unique id, never reused.
    pub tid: Tid,
    /// Parent id, or [`TID_NONE`].
    pub ptid: Tid,
    /// Scheduling state.
    pub status: TaskStatus,
    /// Privilege mode.
    pub mode: TaskMode,
    /// Priority tag, carried through fork (round-robin ignores it).
    pub priority: u8,
    /// Physical base of the kernel stack.
    pub kstack_phys: u64,
    /// Virtual (HHDM) top of the kernel stack, loaded into TSS.rsp0.
    pub kstack_top: u64,
    /// Physical base of the user stack (0 for kernel tasks).
    pub ustack_phys: u64,
    /// Current trap-frame pointer.
    pub frame_ptr: u64,
    /// The task's address space (None for kernel-only tasks).
    pub addr_space: Option<AddressSpace>,
    /// User-visible mappings.
    pub mmap_list: Vec<MemMap>,
    /// Open-file table; handle = index + VFS_MIN_HANDLE.
    pub open_files: Vec<Option<FileDesc>>,
    /// Pending (fd, newfd) pairs materialised on exec.
    pub dup_list: Vec<(i64, i64)>,
    /// Children tids.
    pub child_list: Vec<Tid>,
    /// Current working directory, absolute.
    pub cwd: String,
    /// Absolute wakeup deadline in ns; 0 = no timed wakeup.
    pub wakeup_time: u64,
    /// Event descriptor the task sleeps on, parameter filled on wakeup.
    pub wakeup_event: Option<Event>,
    /// Per-task errno, published through the per-CPU block while running.
    pub errno: i64,
    /// Tick of the last schedule, for fairness debugging.
    pub last_tick: u64,
    /// FS base MSR value to restore while running.
    pub fs_base: u64,
    /// Exit status recorded by exit().
    pub exit_status: i64,
    /// Child tid deposited by the fork switch for the parent to return.
    pub fork_child: Tid,
    /// Address of the syscall-entry frame to clone on a fork tick.
    pub fork_frame: u64,
}

/// Monotonic tid source. Ids are never reused; exhausting the space is a
/// kernel-lifetime bug.
static NEXT_TID: AtomicU16 = AtomicU16::new(1);

/// Allocates the next tid.
pub fn alloc_tid() -> Option<Tid> {
    let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    if tid == TID_NONE {
        NEXT_TID.store(TID_NONE, Ordering::Relaxed);
        return None;
    }
    Some(tid)
}

impl Task {
    /// Builds a task shell with no stacks or address space. The kernel
    /// constructors fill in the rest; tests use it directly.
    pub fn shell(tid: Tid, mode: TaskMode) -> Self {
        Self {
            tid,
            ptid: TID_NONE,
            status: TaskStatus::Ready,
            mode,
            priority: 0,
            kstack_phys: 0,
            kstack_top: 0,
            ustack_phys: 0,
            frame_ptr: 0,
            addr_space: None,
            mmap_list: Vec::new(),
            open_files: Vec::new(),
            dup_list: Vec::new(),
            child_list: Vec::new(),
            cwd: String::from("/"),
            wakeup_time: 0,
            wakeup_event: None,
            errno: 0,
            last_tick: 0,
            fs_base: 0,
            exit_status: 0,
            fork_child: TID_NONE,
            fork_frame: 0,
        }
    }

    /// The trap frame, through the HHDM so it is readable regardless of
    /// which address space is active.
    ///
    /// # Safety
    ///
    /// `frame_ptr` must point at a live frame and the caller must be the
    /// only accessor (scheduler lock held, task not running).
    #[cfg(target_os = "none")]
    pub unsafe fn frame_mut(&self) -> &mut TaskRegs {
        // SAFETY: Contract above; the frame address is either an HHDM
        // alias (kernel stack) or an identity-mapped user stack address,
        // both of which the HHDM view covers.
        unsafe { &mut *(frame_virt(self.frame_ptr) as *mut TaskRegs) }
    }
}

/// Translates a frame address into a pointer the kernel can dereference
/// with any CR3: HHDM addresses pass through, identity user-stack
/// addresses get the HHDM offset added.
#[cfg(target_os = "none")]
fn frame_virt(frame_ptr: u64) -> u64 {
    if frame_ptr < crate::config::HHDM_BASE {
        crate::mm::hhdm::phys_to_virt(muon_core::addr::PhysAddr::new(frame_ptr)).as_u64()
    } else {
        frame_ptr
    }
}

// ---------------------------------------------------------------------------
// Kernel-side constructors and teardown
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod kernel_impl {
    use super::*;
    use crate::arch::x86_64::gdt;
    use crate::config::STACK_SIZE;
    use crate::mm::num_pages;
    use crate::mm::vmm::HhdmMapper;
    use muon_core::addr::{PhysAddr, VirtAddr};

    /// Kernel stack size, same as the user stack.
    const KSTACK: usize = STACK_SIZE;

    /// Creates a task per the lifecycle rules: one kernel stack always, a
    /// user stack and address space in user mode, the trap frame seeded at
    /// the top of the trap stack with RDI = tid.
    ///
    /// Returns `None` when the tid space is exhausted.
    pub fn task_make(entry: u64, priority: u8, mode: TaskMode) -> Option<Task> {
        let tid = alloc_tid()?;
        let mut task = Task::shell(tid, mode);
        task.priority = priority;

        crate::mm::vmm::with_vmm(|vmm| {
            crate::mm::pmm::with_pmm(|pmm| {
                let mapper = HhdmMapper;
                let kstack_phys = pmm.get(num_pages(KSTACK as u64), 0);
                task.kstack_phys = kstack_phys;
                task.kstack_top = crate::mm::hhdm::phys_to_virt(PhysAddr::new(kstack_phys))
                    .as_u64()
                    + KSTACK as u64;

                let (frame_ptr, stack_top, cs, ss) = match mode {
                    TaskMode::User => {
                        let mut space = vmm.create_address_space(&mapper, pmm);
                        let ustack_phys = pmm.get(num_pages(STACK_SIZE as u64), 0);
                        // The user stack is identity-mapped at its physical
                        // address.
                        space.map(
                            &mapper,
                            pmm,
                            VirtAddr::new(ustack_phys),
                            PhysAddr::new(ustack_phys),
                            num_pages(STACK_SIZE as u64),
                            PageFlags::USER_DEFAULT,
                        );
                        task.mmap_list.push(MemMap {
                            vaddr: ustack_phys,
                            paddr: ustack_phys,
                            pages: num_pages(STACK_SIZE as u64),
                            flags: PageFlags::USER_DEFAULT,
                        });
                        task.ustack_phys = ustack_phys;
                        task.addr_space = Some(space);

                        let top = ustack_phys + STACK_SIZE as u64;
                        (
                            top - core::mem::size_of::<TaskRegs>() as u64,
                            top,
                            u64::from(gdt::USER_CODE),
                            u64::from(gdt::USER_DATA),
                        )
                    }
                    TaskMode::Kernel => {
                        let top = task.kstack_top;
                        (
                            top - core::mem::size_of::<TaskRegs>() as u64,
                            top,
                            u64::from(gdt::KERNEL_CODE),
                            u64::from(gdt::KERNEL_DATA),
                        )
                    }
                };

                task.frame_ptr = frame_ptr;
                // SAFETY: The frame slot was just carved out of a fresh
                // stack this task exclusively owns.
                let frame = unsafe { task.frame_mut() };
                *frame = TaskRegs::default();
                frame.rip = entry;
                frame.rsp = stack_top;
                frame.rflags = INITIAL_RFLAGS;
                frame.cs = cs;
                frame.ss = ss;
                frame.rdi = u64::from(tid);
            })
        });

        Some(task)
    }

    /// Clones `parent` for fork: fresh address space, every [`MemMap`]
    /// copied into newly allocated frames at the same virtual addresses,
    /// open files duplicated, and the given trap frame replayed on the
    /// child's kernel stack with `rax = 0`.
    pub fn task_fork(parent: &Task, parent_frame: &TaskRegs) -> Option<Task> {
        let tid = alloc_tid()?;
        let mut child = Task::shell(tid, parent.mode);
        child.ptid = parent.tid;
        child.priority = parent.priority;
        child.cwd = parent.cwd.clone();
        child.errno = parent.errno;
        child.fs_base = parent.fs_base;
        child.ustack_phys = parent.ustack_phys;
        child.open_files = parent.open_files.clone();
        child.dup_list = parent.dup_list.clone();
        // The duplicated descriptors are live references of their own.
        crate::fs::vfs::retain_descs(&child.open_files);

        crate::mm::vmm::with_vmm(|vmm| {
            crate::mm::pmm::with_pmm(|pmm| {
                let mapper = HhdmMapper;
                let mut space = vmm.create_address_space(&mapper, pmm);

                for m in &parent.mmap_list {
                    let bytes = m.pages * crate::mm::PAGE_SIZE;
                    let copy = pmm.get(m.pages, 0);
                    // SAFETY: Source and destination are distinct
                    // physical ranges owned by parent and child, both
                    // visible through the HHDM.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            crate::mm::hhdm::phys_to_virt(PhysAddr::new(m.paddr))
                                .as_ptr::<u8>(),
                            crate::mm::hhdm::phys_to_virt(PhysAddr::new(copy))
                                .as_mut_ptr::<u8>(),
                            bytes as usize,
                        );
                    }
                    space.map(
                        &mapper,
                        pmm,
                        VirtAddr::new(m.vaddr),
                        PhysAddr::new(copy),
                        m.pages,
                        m.flags,
                    );
                    child.mmap_list.push(MemMap { paddr: copy, ..*m });
                }
                child.addr_space = Some(space);

                let kstack_phys = pmm.get(num_pages(KSTACK as u64), 0);
                child.kstack_phys = kstack_phys;
                child.kstack_top = crate::mm::hhdm::phys_to_virt(PhysAddr::new(kstack_phys))
                    .as_u64()
                    + KSTACK as u64;
                child.frame_ptr =
                    child.kstack_top - core::mem::size_of::<TaskRegs>() as u64;
                // SAFETY: Fresh child stack, exclusively owned.
                let frame = unsafe { child.frame_mut() };
                *frame = *parent_frame;
                frame.rax = 0;
            })
        });

        Some(child)
    }

    /// Releases every resource a dead task still holds: user mappings and
    /// their frames, the address space tables, both stacks, and the open
    /// file handles (dropping refcounts through the VFS).
    pub fn task_free(mut task: Task) {
        for slot in task.open_files.drain(..).flatten() {
            crate::fs::vfs::release_desc(slot);
        }

        crate::mm::vmm::with_vmm(|_vmm| {
            crate::mm::pmm::with_pmm(|pmm| {
                let mapper = HhdmMapper;
                if let Some(mut space) = task.addr_space.take() {
                    for m in task.mmap_list.drain(..) {
                        space.unmap(&mapper, pmm, VirtAddr::new_truncate(m.vaddr), m.pages);
                        pmm.free(m.paddr, m.pages);
                    }
                    space.destroy(pmm);
                }
                pmm.free(task.kstack_phys, num_pages(KSTACK as u64));
            });
        });
    }
}

#[cfg(target_os = "none")]
pub use kernel_impl::{task_fork, task_free, task_make};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tids_are_monotonic_and_unique() {
        let a = alloc_tid().unwrap();
        let b = alloc_tid().unwrap();
        let c = alloc_tid().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn frame_layout_matches_push_order() {
        // The switch stubs push rax..r15 after the interrupt frame; the
        // struct must mirror that exactly (20 fields, 160 bytes).
        assert_eq!(core::mem::size_of::<TaskRegs>(), 160);
        let probe = TaskRegs {
            r15: 1,
            rax: 2,
            rip: 3,
            ss: 4,
            ..Default::default()
        };
        let words: &[u64; 20] =
            unsafe { &*(core::ptr::from_ref(&probe).cast::<[u64; 20]>()) };
        assert_eq!(words[0], 1); // r15 lowest
        assert_eq!(words[14], 2); // rax just below rip
        assert_eq!(words[15], 3); // hardware frame starts at rip
        assert_eq!(words[19], 4); // ss highest
    }

    #[test]
    fn shell_defaults() {
        let t = Task::shell(9, TaskMode::Kernel);
        assert_eq!(t.status, TaskStatus::Ready);
        assert_eq!(t.ptid, TID_NONE);
        assert_eq!(t.cwd, "/");
        assert!(t.child_list.is_empty());
    }
}
