//! Event bus: interrupt handlers publish, sleeping tasks consume.
//!
//! Publishers (ISRs, e.g. the keyboard) append events; subscribers park
//! themselves through [`super::wait_event`]. At every scheduler entry,
//! [`dispatch`] pops one pending event and moves every matching sleeper to
//! Ready with the event parameter deposited in its wakeup descriptor.

extern crate alloc;

use alloc::collections::VecDeque;

use muon_core::sync::IrqSpinLock;

use super::task::{TaskStatus, Tid};

/// Event classes the bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A key was pressed; the parameter carries the ASCII/scancode byte.
    KeyPressed,
}

/// One bus event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// Publishing (or subscribing) task; [`super::task::TID_NONE`] for
    /// interrupt context.
    pub tid: Tid,
    /// Event class.
    pub kind: EventKind,
    /// Payload.
    pub para: u64,
}

/// Pending events published by interrupt handlers.
static PUBLISHERS: IrqSpinLock<VecDeque<Event>> = IrqSpinLock::new(VecDeque::new());

/// Publishes an event. Safe from interrupt context.
pub fn publish(tid: Tid, kind: EventKind, para: u64) {
    PUBLISHERS.lock().push_back(Event { tid, kind, para });
}

/// Pops one pending event and wakes every sleeping task waiting on its
/// kind. Runs under the scheduler lock, so it receives the locked state.
pub fn dispatch(state: &mut super::SchedState) -> bool {
    let Some(event) = PUBLISHERS.lock().pop_front() else {
        return false;
    };

    let mut woke = false;
    for task in state.active.iter_mut() {
        if task.status == TaskStatus::Sleeping
            && task.wakeup_event.map(|e| e.kind) == Some(event.kind)
        {
            task.status = TaskStatus::Ready;
            if let Some(wait) = task.wakeup_event.as_mut() {
                wait.para = event.para;
            }
            woke = true;
        }
    }
    woke
}

#[cfg(test)]
mod tests {
    use super::super::SchedState;
    use super::super::task::{Task, TaskMode, TaskStatus};
    use super::*;

    fn sleeper(tid: Tid) -> Box<Task> {
        let mut t = Task::shell(tid, TaskMode::User);
        t.status = TaskStatus::Sleeping;
        t.wakeup_time = 0;
        t.wakeup_event = Some(Event {
            tid,
            kind: EventKind::KeyPressed,
            para: 0,
        });
        Box::new(t)
    }

    #[test]
    fn publish_then_dispatch_wakes_matching_sleepers() {
        let mut state = SchedState::new();
        state.active.push_back(sleeper(1));
        state.active.push_back(sleeper(2));

        // With nothing published, dispatch is a no-op.
        assert!(!dispatch(&mut state));
        assert_eq!(state.active[0].status, TaskStatus::Sleeping);

        publish(0, EventKind::KeyPressed, u64::from(b'A'));
        assert!(dispatch(&mut state));

        for task in &state.active {
            assert_eq!(task.status, TaskStatus::Ready);
            assert_eq!(task.wakeup_event.unwrap().para, u64::from(b'A'));
        }
    }
}
