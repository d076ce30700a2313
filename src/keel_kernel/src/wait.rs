//! Wait queues and the blocking machinery shared by every synchronization
//! object.
//!
//! A blocked task sits in up to two lists at once: its `event_item` in the
//! event list of the object it is waiting on (ordered by task priority,
//! FIFO within a priority), and its `state_item` in a delayed list (finite
//! timeout) or the suspended list (infinite timeout).
//!
//! Whoever ends a wait does so *on behalf of* the waiter while still inside
//! the critical section: the payload stored in the waiter's control block
//! carries everything needed to complete the operation (destination buffer,
//! queue position, ...), so by the time the waiter runs again there is
//! nothing left to retry. The highest-priority waiter therefore wins even if
//! a third task sneaks in between the wakeup and the reschedule.
use core::fmt;

use crate::{
    error::WaitTimeoutError,
    imask::{KernelCell, MaskTokenMut},
    queue, task,
    task::readyqueue::Queue,
    task::{TaskCb, TaskRef, TaskSt},
    utils::{
        intrusive_list::{List, ListItem},
        Init,
    },
    KernelTraits, PortThreading, Priority, UTicks, MAX_PRIORITY_LEVELS, WAIT_FOREVER,
};

/// A pointer to the blocked sender's item, kept alive by the sender's stack
/// frame for the duration of the wait.
pub(crate) struct SendPtr(pub(crate) *const u8);
// Safety: only dereferenced under CPU Lock while the owning task is blocked
unsafe impl Send for SendPtr {}

/// A pointer to the blocked receiver's buffer; see [`SendPtr`].
pub(crate) struct RecvPtr(pub(crate) *mut u8);
// Safety: ditto
unsafe impl Send for RecvPtr {}

/// Describes *what* a blocked task is waiting for, and carries the data the
/// wake-upper needs to complete the operation in the waiter's stead.
pub(crate) enum WaitPayload<Traits: PortThreading> {
    /// A plain delay; only a timeout or an abort can end it.
    Sleep,
    /// A semaphore acquisition; the signaller transfers the permit directly.
    Semaphore,
    /// A mutex acquisition; the unlocker transfers ownership directly.
    Mutex(&'static queue::QueueCb<Traits>),
    /// A task notification; the value lives in the waiter's own mailbox.
    Notify,
    /// A queue send blocked on a full queue; `src` is copied into the ring
    /// by whichever receive frees a slot.
    QueueSend {
        src: SendPtr,
        position: queue::SendPosition,
    },
    /// A queue receive blocked on an empty queue; the item is copied to
    /// `dst` by whichever send produces one.
    QueueRecv { dst: RecvPtr, peek: bool },
}

impl<Traits: PortThreading> fmt::Debug for WaitPayload<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sleep => f.write_str("Sleep"),
            Self::Semaphore => f.write_str("Semaphore"),
            Self::Mutex(q) => write!(f, "Mutex({:p})", *q as *const _),
            Self::Notify => f.write_str("Notify"),
            Self::QueueSend { .. } => f.write_str("QueueSend"),
            Self::QueueRecv { .. } => f.write_str("QueueRecv"),
        }
    }
}

/// The wait state embedded in every task control block.
pub(crate) struct TaskWait<Traits: PortThreading> {
    /// `Some` exactly while the task has an uncompleted wait operation. The
    /// completer takes the payload, which atomically claims the wait.
    payload: KernelCell<Traits, Option<WaitPayload<Traits>>>,

    /// The result of the last wait operation, written by the completer.
    result: KernelCell<Traits, Result<(), WaitTimeoutError>>,
}

impl<Traits: PortThreading> Init for TaskWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        payload: KernelCell::new(None),
        result: KernelCell::new(Ok(())),
    };
}

impl<Traits: KernelTraits> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WaitQueue { .. }")
    }
}

/// A queue of blocked tasks attached to a synchronization object, ordered so
/// that the highest-priority waiter is at the head and equal-priority waiters
/// keep their arrival order.
pub(crate) struct WaitQueue<Traits: PortThreading> {
    waiters: List<Traits, TaskCb<Traits>>,
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { waiters: List::INIT };
}

/// Event lists sort ascending by key, so store the priority inverted: the
/// most urgent waiter gets the smallest key.
fn priority_key(priority: Priority) -> u32 {
    (MAX_PRIORITY_LEVELS - 1) as u32 - u32::from(priority)
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Get the waiter that would be woken next.
    pub(crate) fn first_waiting_task(
        &'static self,
        lock: MaskTokenMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        self.waiters.first_owner(lock)
    }

    pub(crate) fn is_empty(&'static self, lock: MaskTokenMut<'_, Traits>) -> bool {
        self.waiters.is_empty(lock)
    }

    pub(crate) fn len(&'static self, lock: MaskTokenMut<'_, Traits>) -> u32 {
        self.waiters.len(lock)
    }
}

/// When does a wait expire?
pub(crate) enum Deadline {
    Forever,
    /// Relative to now.
    After(UTicks),
    /// At an absolute tick value (must not equal the current tick count).
    At(UTicks),
}

impl Deadline {
    pub(crate) fn from_timeout(timeout: UTicks) -> Self {
        if timeout == WAIT_FOREVER {
            Self::Forever
        } else {
            Self::After(timeout)
        }
    }
}

/// Block the currently running task.
///
/// The caller must have verified that the calling context is waitable and
/// that the wait condition is unsatisfied, all without releasing CPU Lock
/// since. Returns once the task has been woken up and scheduled again.
pub(crate) fn wait<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    wait_queue: Option<&'static WaitQueue<Traits>>,
    payload: WaitPayload<Traits>,
    deadline: Deadline,
) -> Result<(), WaitTimeoutError> {
    let state = Traits::state();
    let task = state.running_task(lock.borrow_mut()).unwrap();
    debug_assert_eq!(*task.st.read(&*lock), TaskSt::Running);

    task.wait.payload.replace(&mut *lock, Some(payload));
    task.wait.result.replace(&mut *lock, Ok(()));

    // The task loses the processor: out of the ready queue...
    // Safety: a Running task is in the ready queue
    unsafe { task::ready_queue::<Traits>().remove(lock.borrow_mut(), task.control_block()) };

    // ...onto the event list of the waited-on object...
    if let Some(wait_queue) = wait_queue {
        let key = priority_key(task.effective_priority.get(&*lock));
        wait_queue
            .waiters
            .insert(lock.borrow_mut(), &task.control_block().event_item, key);
    }

    // ...and onto a timed or untimed holding list.
    match deadline {
        Deadline::Forever => {
            state
                .suspended
                .insert_last(lock.borrow_mut(), &task.control_block().state_item);
        }
        Deadline::After(ticks) => {
            let now = state.timeout.tick_count(lock.borrow_mut());
            insert_delayed(lock.borrow_mut(), task.control_block(), now.wrapping_add(ticks));
        }
        Deadline::At(wake) => {
            insert_delayed(lock.borrow_mut(), task.control_block(), wake);
        }
    }

    task.st.replace(&mut *lock, TaskSt::Waiting);

    // Completes when the task is woken up and scheduled again
    task::wait_until_woken_up(lock.borrow_mut());

    debug_assert!(task.wait.payload.read(&*lock).is_none());
    task.wait.result.get(&*lock)
}

/// Place `task` on the delayed list appropriate for the absolute wake time,
/// keyed by it. A wake time numerically below the current tick count lies
/// beyond the counter wrap and goes to the overflow list.
fn insert_delayed<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    wake: UTicks,
) {
    let g = &Traits::state().timeout;
    let now = g.tick_count(lock.borrow_mut());
    let list = if wake < now {
        g.overflow_delayed_list(lock.borrow_mut())
    } else {
        g.current_delayed_list(lock.borrow_mut())
    };
    list.insert(lock.borrow_mut(), &task.state_item, wake);
}

/// Put `task` (currently Ready) into a timed sleep without blocking the
/// calling context. Unit-test plumbing for the tick machinery.
#[cfg(test)]
pub(crate) fn block_task_for_test<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    wake: UTicks,
) {
    use crate::task::readyqueue::Queue as _;

    task.wait
        .payload
        .replace(&mut *lock, Some(WaitPayload::Sleep));
    task.wait.result.replace(&mut *lock, Ok(()));
    // Safety: a Ready task is in the ready queue
    unsafe { task::ready_queue::<Traits>().remove(lock.borrow_mut(), task) };
    insert_delayed(lock.borrow_mut(), task, wake);
    task.st.replace(&mut *lock, TaskSt::Waiting);
}

/// The mutex the task is currently blocked on, if any.
pub(crate) fn blocked_on_mutex<Traits: KernelTraits>(
    lock: MaskTokenMut<'_, Traits>,
    task: &TaskRef<Traits>,
) -> Option<&'static queue::QueueCb<Traits>> {
    match *task.wait.payload.read(&*lock) {
        Some(WaitPayload::Mutex(cb)) => Some(cb),
        _ => None,
    }
}

/// Whether the task has an uncompleted wait operation.
pub(crate) fn has_active_wait<Traits: KernelTraits>(
    lock: MaskTokenMut<'_, Traits>,
    task: &TaskRef<Traits>,
) -> bool {
    task.wait.payload.read(&*lock).is_some()
}

/// End `task`'s wait with `result`, claiming and returning its payload.
///
/// Removes the task from its event list and holding list and transitions it
/// to Ready (or parks it on the pending-ready list while the scheduler is
/// suspended). Returns `None` without side effects if the wait was already
/// completed by someone else.
///
/// This may make a task Ready but doesn't yield the processor. Call
/// `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn complete_wait<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    result: Result<(), WaitTimeoutError>,
) -> Option<WaitPayload<Traits>> {
    let payload = task.wait.payload.replace(&mut *lock, None)?;
    debug_assert_eq!(*task.st.read(&*lock), TaskSt::Waiting);

    if task.event_item.is_linked(lock.borrow_mut()) {
        task.event_item.unlink(lock.borrow_mut());
    }
    if task.state_item.is_linked(lock.borrow_mut()) {
        task.state_item.unlink(lock.borrow_mut());
    }
    task.wait.result.replace(&mut *lock, result);

    let state = Traits::state();
    if state.sched_suspend_depth.get(&*lock) != 0 {
        // The ready lists must not be touched right now; leave the task
        // Waiting and let `resume_scheduler` finish the transition
        state
            .pending_ready
            .insert_last(lock.borrow_mut(), &task.event_item);
        if outranks_current(lock.borrow_mut(), task) {
            state.yield_on_resume.replace(&mut *lock, true);
        }
    } else {
        task::make_ready(lock.borrow_mut(), task);
    }

    Some(payload)
}

/// End `task`'s wait without making it schedulable; the caller decides where
/// the task goes next. Used when suspending or deleting a blocked task.
pub(crate) fn cancel_wait<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task: &TaskRef<Traits>,
    result: Result<(), WaitTimeoutError>,
) {
    let Some(payload) = task.wait.payload.replace(&mut *lock, None) else {
        return;
    };
    if task.event_item.is_linked(lock.borrow_mut()) {
        task.control_block().event_item.unlink(lock.borrow_mut());
    }
    if task.state_item.is_linked(lock.borrow_mut()) {
        task.control_block().state_item.unlink(lock.borrow_mut());
    }
    task.wait.result.replace(&mut *lock, result);

    notify_wait_failed(lock, payload);
}

/// Interrupt an ongoing wait, waking the task with the given result.
///
/// This may make a task Ready but doesn't yield the processor. Call
/// `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn interrupt_task<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task: &TaskRef<Traits>,
    result: Result<(), WaitTimeoutError>,
) {
    let Some(payload) = complete_wait(lock.borrow_mut(), task.control_block(), result) else {
        return;
    };
    notify_wait_failed(lock, payload);
}

/// An unsuccessfully ended wait may require object-specific cleanup; a mutex
/// owner's inherited priority has to be re-evaluated when a waiter gives up.
fn notify_wait_failed<Traits: KernelTraits>(
    lock: MaskTokenMut<'_, Traits>,
    payload: WaitPayload<Traits>,
) {
    if let WaitPayload::Mutex(mutex_cb) = payload {
        crate::mutex::disinherit_after_wait_failure(lock, mutex_cb);
    }
}

/// Whether `task`'s effective priority exceeds the running task's.
fn outranks_current<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task: &TaskCb<Traits>,
) -> bool {
    match Traits::state().running_task(lock.borrow_mut()) {
        Some(current) => {
            task.effective_priority.get(&*lock) > current.effective_priority.get(&*lock)
        }
        None => true,
    }
}

/// Reposition the task's `event_item` after a change of its effective
/// priority. No-op unless the task is blocked on a priority-ordered event
/// list.
pub(crate) fn reorder_wait_position<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task: &TaskRef<Traits>,
) {
    let Some(list) = task.event_item.container(lock.borrow_mut()) else {
        return;
    };
    // The pending-ready list borrows `event_item` too but is unordered
    if core::ptr::eq(list, &Traits::state().pending_ready) {
        return;
    }
    task.control_block().event_item.unlink(lock.borrow_mut());
    let key = priority_key(task.effective_priority.get(&*lock));
    list.insert(lock.borrow_mut(), &task.control_block().event_item, key);
}
