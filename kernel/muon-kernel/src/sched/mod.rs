//! Preemptive round-robin scheduler.
//!
//! One global `active` queue of Ready/Sleeping tasks, one idle task and one
//! running slot per CPU, all under a single interrupt-safe lock. The switch
//! path is entered three ways: the APIC timer tick, a cooperative yield
//! (sleep, event wait, exit) and the fork fast-path, which clones the
//! caller's syscall-entry frame before the normal selection runs.
//!
//! Queue ordering: FIFO among Ready tasks; Sleeping tasks are skipped and
//! re-appended, so they never overtake a Ready task.

extern crate alloc;

pub mod eventbus;
pub mod task;

#[cfg(target_os = "none")]
mod switch;

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use muon_core::sync::IrqSpinLock;

use crate::config::MAX_CPUS;
use task::{Task, TaskStatus, Tid};

/// All mutable scheduler state, guarded by [`SCHED`].
pub struct SchedState {
    /// The global queue of Ready and Sleeping tasks.
    pub active: VecDeque<Box<Task>>,
    /// Per-CPU running slot.
    pub running: [Option<Box<Task>>; MAX_CPUS],
    /// Per-CPU idle task, parked here while not running.
    pub idle: [Option<Box<Task>>; MAX_CPUS],
    /// Tids of the idle tasks (to recognise them when saving).
    pub idle_tids: [Tid; MAX_CPUS],
    /// Per-CPU tick counters.
    pub coordinates: [u64; MAX_CPUS],
}

impl SchedState {
    /// Empty state.
    pub const fn new() -> Self {
        const NO_TASK: Option<Box<Task>> = None;
        Self {
            active: VecDeque::new(),
            running: [NO_TASK; MAX_CPUS],
            idle: [NO_TASK; MAX_CPUS],
            idle_tids: [task::TID_NONE; MAX_CPUS],
            coordinates: [0; MAX_CPUS],
        }
    }
}

impl Default for SchedState {
    fn default() -> Self {
        Self::new()
    }
}

/// The global scheduler lock. Everything that touches task status, the
/// queue or the running slots serialises here.
static SCHED: IrqSpinLock<SchedState> = IrqSpinLock::new(SchedState::new());

/// Pops the first schedulable task: Ready, or Sleeping with an expired
/// deadline. Skipped tasks are re-appended in order. Returns `None` when a
/// full pass over the queue finds nothing.
pub fn select_next(active: &mut VecDeque<Box<Task>>, now_ns: u64) -> Option<Box<Task>> {
    let mut skipped = 0;
    loop {
        if skipped >= active.len() {
            return None;
        }
        let task = active.pop_front()?;
        match task.status {
            TaskStatus::Ready => return Some(task),
            TaskStatus::Sleeping
                if task.wakeup_time > 0 && now_ns >= task.wakeup_time =>
            {
                return Some(task);
            }
            _ => {
                active.push_back(task);
                skipped += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel-side scheduler driver
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod kernel_impl {
    use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

    use muon_core::{kdebug, kinfo};

    use super::eventbus::{self, Event, EventKind};
    use super::switch;
    use super::task::{
        TID_NONE, Task, TaskMode, TaskRegs, TaskStatus, Tid, task_fork, task_free, task_make,
    };
    use super::{Box, SCHED, select_next};
    use crate::arch::x86_64::{apic, idt, instructions, isr};
    use crate::config::TIMESLICE_NS;
    use crate::percpu;

    /// Switch entry reasons.
    pub const REASON_TIMER: u64 = 0;
    /// Cooperative self-suspend.
    pub const REASON_YIELD: u64 = 1;
    /// Fork fast-path.
    pub const REASON_FORK: u64 = 2;

    /// CPUs expected to take part in scheduling (set by SMP bring-up;
    /// the sentinel keeps the gate closed until then).
    static EXPECTED_CPUS: AtomicU32 = AtomicU32::new(u32::MAX);
    /// CPUs whose scheduler is initialized.
    static STARTED_CPUS: AtomicU32 = AtomicU32::new(0);
    /// The dynamic vector the APIC timer fires on.
    static TIMER_VECTOR: AtomicU8 = AtomicU8::new(0);

    /// Declares how many CPUs will join before switching may begin.
    pub fn set_expected_cpus(count: u32) {
        EXPECTED_CPUS.store(count, Ordering::Release);
    }

    /// Whether every CPU has joined and preemption is live.
    pub fn all_cpus_started() -> bool {
        STARTED_CPUS.load(Ordering::Acquire) == EXPECTED_CPUS.load(Ordering::Acquire)
    }

    /// The scheduler entry, called from the switch stubs with the saved
    /// frame and the entry reason. Returns only while the SMP bring-up
    /// gate is still closed.
    pub extern "C" fn context_switch(frame: u64, reason: u64) {
        // APs must not switch until every CPU has published itself.
        if !all_cpus_started() {
            if reason == REASON_TIMER {
                apic::send_eoi();
            }
            return;
        }

        let now = crate::time::boot_nanos();
        let cpu = percpu::current_cpu();
        let cpu_id = cpu.cpu_id as usize;

        let mut state = SCHED.lock();
        eventbus::dispatch(&mut state);

        state.coordinates[cpu_id] += 1;
        let ticks = state.coordinates[cpu_id];

        if let Some(mut curr) = state.running[cpu_id].take() {
            curr.frame_ptr = frame;
            curr.last_tick = ticks;
            curr.errno = cpu.get_errno();
            if curr.status == TaskStatus::Running {
                curr.status = TaskStatus::Ready;
            }

            if reason == REASON_FORK {
                // Clone the live syscall-entry frame before requeueing.
                // SAFETY: fork() stored a pointer to the frame on the
                // caller's kernel stack; the caller is suspended here.
                let parent_frame = unsafe { &*(curr.fork_frame as *const TaskRegs) };
                if let Some(child) = task_fork(&curr, parent_frame) {
                    curr.fork_child = child.tid;
                    curr.child_list.push(child.tid);
                    state.active.push_back(Box::new(child));
                } else {
                    curr.fork_child = TID_NONE;
                }
                curr.fork_frame = 0;
            }

            if curr.tid == state.idle_tids[cpu_id] {
                state.idle[cpu_id] = Some(curr);
            } else {
                state.active.push_back(curr);
            }
        }

        let next = match select_next(&mut state.active, now) {
            Some(task) => task,
            None => state.idle[cpu_id]
                .take()
                .expect("scheduler: no idle task for this CPU"),
        };

        let mut next = next;
        next.status = TaskStatus::Running;
        cpu.set_errno(next.errno);

        // SAFETY: This CPU owns its TSS and per-CPU block; interrupts are
        // disabled under the scheduler lock.
        unsafe {
            cpu.tss_mut().rsp0 = next.kstack_top;
            percpu::set_kernel_rsp(next.kstack_top);
        }

        if next.fs_base != 0
            && instructions::read_msr(instructions::MSR_FS_BASE) != next.fs_base
        {
            instructions::write_msr(instructions::MSR_FS_BASE, next.fs_base);
        }

        let target_root = next
            .addr_space
            .as_ref()
            .map(|s| s.root())
            .unwrap_or_else(|| crate::mm::vmm::with_vmm(|vmm| vmm.kernel_root()));
        let cr3 = if instructions::read_cr3() == target_root {
            0
        } else {
            target_root.as_u64()
        };

        let frame = next.frame_ptr;
        state.running[cpu_id] = Some(next);

        if reason == REASON_TIMER {
            apic::send_eoi();
        }

        // Release the lock without re-enabling interrupts: the restore
        // path must not be preempted between here and the iretq, which
        // loads the incoming task's RFLAGS (and IF) atomically.
        state.unlock_keep_disabled();
        // SAFETY: `frame` is the saved trap frame of the chosen task and
        // `cr3` is its paging root (or 0 to keep the current one).
        unsafe { switch_to(frame, cr3) };
    }

    /// Loads the chosen task: optional CR3 switch, stack pointer to the
    /// frame, register pops, `iretq`.
    ///
    /// # Safety
    ///
    /// See [`context_switch`]; never returns.
    unsafe fn switch_to(frame: u64, cr3: u64) -> ! {
        // SAFETY: Caller contract.
        unsafe { switch::exit_switch(frame, cr3) }
    }

    // -----------------------------------------------------------------------
    // Public scheduling API
    // -----------------------------------------------------------------------

    /// Runs `f` on the calling CPU's current task, if any.
    pub fn with_current<R>(f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        let cpu_id = percpu::current_cpu().cpu_id as usize;
        let mut state = SCHED.lock();
        state.running[cpu_id].as_mut().map(|t| f(t))
    }

    /// The calling task's tid.
    pub fn current_tid() -> Option<Tid> {
        with_current(|t| t.tid)
    }

    /// Creates a task and adds it to the queue.
    pub fn spawn(entry: u64, priority: u8, mode: TaskMode) -> Option<Tid> {
        let task = task_make(entry, priority, mode)?;
        let tid = task.tid;
        SCHED.lock().active.push_back(Box::new(task));
        Some(tid)
    }

    /// Adds an already-built task to the queue.
    pub fn enqueue(task: Task) {
        SCHED.lock().active.push_back(Box::new(task));
    }

    /// Sleeps the calling task for at least `millis` milliseconds. Before
    /// scheduling starts this degrades to a busy wait.
    pub fn sleep_ms(millis: u64) {
        if !all_cpus_started() || current_tid().is_none() {
            crate::arch::x86_64::hpet::sleep_ms(millis);
            return;
        }
        with_current(|t| {
            t.wakeup_time = crate::time::boot_nanos() + millis * 1_000_000;
            t.wakeup_event = None;
            t.status = TaskStatus::Sleeping;
        });
        switch::cooperative_switch(REASON_YIELD);
    }

    /// Parks the calling task until an event of `kind` is published.
    /// Returns the event parameter.
    pub fn wait_event(kind: EventKind) -> u64 {
        let tid = match current_tid() {
            Some(tid) => tid,
            None => return 0,
        };
        with_current(|t| {
            t.wakeup_time = 0;
            t.wakeup_event = Some(Event {
                tid,
                kind,
                para: 0,
            });
            t.status = TaskStatus::Sleeping;
        });
        switch::cooperative_switch(REASON_YIELD);
        with_current(|t| {
            let para = t.wakeup_event.map(|e| e.para).unwrap_or(0);
            t.wakeup_event = None;
            para
        })
        .unwrap_or(0)
    }

    /// Forks the calling task around its syscall-entry frame. Returns the
    /// child tid in the parent; the child resumes straight into user mode
    /// with `rax = 0` from its cloned frame.
    pub fn fork(entry_frame: &mut TaskRegs) -> Tid {
        with_current(|t| {
            t.fork_frame = core::ptr::from_mut(entry_frame) as u64;
        });
        switch::cooperative_switch(REASON_FORK);
        with_current(|t| {
            let child = t.fork_child;
            t.fork_child = TID_NONE;
            child
        })
        .unwrap_or(TID_NONE)
    }

    /// Terminates the calling task. Dying until every child is Dead, Dead
    /// immediately otherwise; the idle task reclaims the resources.
    pub fn exit(status: i64) -> ! {
        {
            let cpu_id = percpu::current_cpu().cpu_id as usize;
            let mut state = SCHED.lock();
            let info = state.running[cpu_id].as_mut().map(|curr| {
                curr.exit_status = status;
                curr.status = TaskStatus::Dying;
                (curr.tid, curr.child_list.clone())
            });
            if let Some((tid, children)) = info {
                let all_dead = children
                    .iter()
                    .all(|&c| task_status(&state, c).is_none_or(|s| s == TaskStatus::Dead));
                if all_dead {
                    if let Some(curr) = state.running[cpu_id].as_mut() {
                        curr.status = TaskStatus::Dead;
                    }
                }
                kdebug!("sched: tid {} exiting with status {}", tid, status);
            }
        }
        switch::cooperative_switch(REASON_YIELD);
        unreachable!("exited task was rescheduled");
    }

    fn task_status(state: &super::SchedState, tid: Tid) -> Option<TaskStatus> {
        state
            .active
            .iter()
            .map(|t| t.as_ref())
            .chain(state.running.iter().flatten().map(|t| t.as_ref()))
            .find(|t| t.tid == tid)
            .map(|t| t.status)
    }

    // -----------------------------------------------------------------------
    // Idle task and reaping
    // -----------------------------------------------------------------------

    /// Removes one Dead task from the queue, detaching it from its parent
    /// (and promoting a Dying parent whose last child just vanished).
    fn take_dead_task() -> Option<Task> {
        let mut state = SCHED.lock();
        let idx = state
            .active
            .iter()
            .position(|t| t.status == TaskStatus::Dead)?;
        let dead = state.active.remove(idx)?;

        let ptid = dead.ptid;
        if ptid != TID_NONE {
            let parent = state
                .active
                .iter_mut()
                .map(|t| t.as_mut())
                .chain(state.running.iter_mut().flatten().map(|t| t.as_mut()))
                .find(|t| t.tid == ptid);
            if let Some(parent) = parent {
                parent.child_list.retain(|&c| c != dead.tid);
                if parent.status == TaskStatus::Dying && parent.child_list.is_empty() {
                    parent.status = TaskStatus::Dead;
                }
            }
        }
        Some(*dead)
    }

    /// Idle task body: reap dead tasks, otherwise halt until the next
    /// interrupt.
    extern "C" fn idle_main(_tid: u64) -> ! {
        loop {
            match take_dead_task() {
                Some(task) => {
                    kinfo!("sched: reaping tid {}", task.tid);
                    task_free(task);
                }
                None => instructions::hlt(),
            }
        }
    }

    /// Allocates the shared timer vector and installs the switch stub on
    /// it. Runs once on the BSP, after timer calibration and before any
    /// CPU (AP or BSP) joins the scheduler.
    pub fn init_timer() {
        let vector = isr::alloc_vector().expect("no vector for the APIC timer");
        idt::set_vector_handler(vector, switch::timer_switch_stub as usize as u64, 0);
        TIMER_VECTOR.store(vector, Ordering::Release);
        kinfo!("sched: APIC timer on vector {:#x}", vector);
    }

    /// Brings the calling CPU into the scheduler: creates its idle task,
    /// arms the APIC timer on the shared dynamic vector and counts the CPU
    /// as started.
    pub fn init_cpu() {
        let cpu = percpu::current_cpu();
        let cpu_id = cpu.cpu_id as usize;

        let idle = task_make(idle_main as usize as u64, u8::MAX, TaskMode::Kernel)
            .expect("scheduler: cannot create idle task");
        {
            let mut state = SCHED.lock();
            state.idle_tids[cpu_id] = idle.tid;
            state.idle[cpu_id] = Some(Box::new(idle));
        }

        let vector = TIMER_VECTOR.load(Ordering::Acquire);
        debug_assert!(vector != 0, "scheduler timer vector not installed");
        apic::start_timer(vector, TIMESLICE_NS);
        STARTED_CPUS.fetch_add(1, Ordering::AcqRel);
        kinfo!("sched: CPU {} joined (timer vector {:#x})", cpu_id, vector);
    }

    /// Logs a snapshot of the queue for debugging.
    pub fn debug_dump() {
        let state = SCHED.lock();
        kdebug!(
            "sched: {} active, running: {:?}",
            state.active.len(),
            state
                .running
                .iter()
                .map(|slot| slot.as_ref().map(|t| t.tid))
                .collect::<alloc::vec::Vec<_>>()
        );
    }
}

#[cfg(target_os = "none")]
pub use kernel_impl::{
    REASON_FORK, REASON_TIMER, REASON_YIELD, all_cpus_started, context_switch, current_tid,
    debug_dump, enqueue, exit, fork, init_cpu, init_timer, set_expected_cpus, sleep_ms, spawn,
    wait_event, with_current,
};

#[cfg(test)]
mod tests {
    use super::task::{Task, TaskMode, TaskStatus};
    use super::*;

    fn boxed(tid: Tid, status: TaskStatus, wakeup: u64) -> Box<Task> {
        let mut t = Task::shell(tid, TaskMode::Kernel);
        t.status = status;
        t.wakeup_time = wakeup;
        Box::new(t)
    }

    #[test]
    fn fifo_among_ready_tasks() {
        let mut q = VecDeque::new();
        q.push_back(boxed(1, TaskStatus::Ready, 0));
        q.push_back(boxed(2, TaskStatus::Ready, 0));
        let first = select_next(&mut q, 0).unwrap();
        assert_eq!(first.tid, 1);
        let second = select_next(&mut q, 0).unwrap();
        assert_eq!(second.tid, 2);
        assert!(select_next(&mut q, 0).is_none());
    }

    #[test]
    fn sleepers_are_skipped_until_deadline() {
        let mut q = VecDeque::new();
        q.push_back(boxed(1, TaskStatus::Sleeping, 1_000));
        q.push_back(boxed(2, TaskStatus::Ready, 0));

        // Before the deadline the sleeper is passed over.
        let picked = select_next(&mut q, 500).unwrap();
        assert_eq!(picked.tid, 2);
        q.push_back(picked);

        // After the deadline it becomes eligible (and queue order put it
        // first again).
        let picked = select_next(&mut q, 1_500).unwrap();
        assert_eq!(picked.tid, 1);
    }

    #[test]
    fn event_sleepers_never_picked_by_time() {
        // wakeup_time == 0 means "event wait": time alone can't wake it.
        let mut q = VecDeque::new();
        q.push_back(boxed(1, TaskStatus::Sleeping, 0));
        assert!(select_next(&mut q, u64::MAX).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn dying_and_dead_tasks_are_not_scheduled() {
        let mut q = VecDeque::new();
        q.push_back(boxed(1, TaskStatus::Dead, 0));
        q.push_back(boxed(2, TaskStatus::Dying, 0));
        assert!(select_next(&mut q, 0).is_none());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn empty_queue_yields_none() {
        let mut q: VecDeque<Box<Task>> = VecDeque::new();
        assert!(select_next(&mut q, 0).is_none());
    }
}
