//! Mutexes with priority inheritance, built on the queue control block.
//!
//! Ownership is handed directly from the unlocking task to the
//! highest-priority waiter, so the mutex can never be stolen by a task that
//! was not first in line. While a mutex is contended, the owner's effective
//! priority is raised to the highest waiter's; the raise follows chains of
//! owners that are themselves blocked on other mutexes.
use core::fmt;

use crate::{
    error::{CreateError, DeleteError, LockMutexError, TryLockMutexError, UnlockMutexError},
    imask::{self, MaskTokenMut},
    queue::{create_queue_cb, delete_queue_cb, QueueCb, QueueKind, QueueRef},
    state, task,
    task::TaskRef,
    wait::{self, Deadline, WaitPayload},
    KernelTraits, PortThreading, Priority, System, UTicks,
};

/// A `Copy`able handle to a mutex. Using a handle after
/// [`System::delete_mutex`] is undefined behavior.
pub struct MutexRef<Traits: PortThreading>(pub(crate) QueueRef<Traits>);

impl<Traits: PortThreading> Clone for MutexRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for MutexRef<Traits> {}

impl<Traits: PortThreading> PartialEq for MutexRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: PortThreading> Eq for MutexRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for MutexRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MutexRef({:p})", self.0 .0 as *const _)
    }
}

impl<Traits: PortThreading> MutexRef<Traits> {
    fn cb(self) -> &'static QueueCb<Traits> {
        self.0 .0
    }
}

/// Mutexes.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a mutex. Mutexes must not be used from interrupt context.
    pub fn create_mutex() -> Result<MutexRef<Traits>, CreateError> {
        create_queue_cb(QueueKind::Mutex { recursive: false }, 1, 0, 1).map(MutexRef)
    }

    /// Create a recursive mutex: the owner may lock it repeatedly, and only
    /// the matching final unlock releases it.
    pub fn create_recursive_mutex() -> Result<MutexRef<Traits>, CreateError> {
        create_queue_cb(QueueKind::Mutex { recursive: true }, 1, 0, 1).map(MutexRef)
    }

    /// Delete a mutex. Fails with `BadObjectState` if any task is blocked on
    /// it or it is currently owned.
    pub fn delete_mutex(mutex: MutexRef<Traits>) -> Result<(), DeleteError> {
        let cb = mutex.cb();
        if !matches!(cb.kind, QueueKind::Mutex { .. }) {
            return Err(DeleteError::BadObjectState);
        }
        {
            let lock = imask::acquire::<Traits>()?;
            if cb.owner.get(&*lock).is_some() {
                return Err(DeleteError::BadObjectState);
            }
        }
        delete_queue_cb(mutex.0)
    }

    /// Acquire the mutex, blocking for up to `timeout` ticks while another
    /// task owns it.
    pub fn lock_mutex(mutex: MutexRef<Traits>, timeout: UTicks) -> Result<(), LockMutexError> {
        let cb = mutex.cb();
        state::expect_task_context::<Traits>()?;
        let mut lock = imask::acquire::<Traits>()?;

        let me = Traits::state().running_task(lock.borrow_mut()).unwrap();

        match cb.owner.get(&*lock) {
            None => {
                take_ownership(lock.borrow_mut(), cb, &me);
                Ok(())
            }
            Some(owner) if owner == me => {
                if let QueueKind::Mutex { recursive: true } = cb.kind {
                    cb.recursion.replace_with(&mut *lock, |x| *x + 1);
                    Ok(())
                } else {
                    Err(LockMutexError::WouldDeadlock)
                }
            }
            Some(owner) => {
                if timeout == 0 {
                    return Err(LockMutexError::Timeout);
                }
                state::expect_waitable_context::<Traits>(lock.borrow_mut())?;

                // Raise the owner (and, transitively, whatever the owner is
                // blocked behind) to our priority before going to sleep
                let my_priority = me.effective_priority.get(&*lock);
                inherit_priority(lock.borrow_mut(), owner, my_priority);

                // On success, ownership was transferred by the unlocker
                wait::wait(
                    lock.borrow_mut(),
                    Some(&cb.recv_wait),
                    WaitPayload::Mutex(cb),
                    Deadline::from_timeout(timeout),
                )?;
                debug_assert_eq!(cb.owner.get(&*lock), Some(me));
                Ok(())
            }
        }
    }

    /// Acquire the mutex without blocking.
    pub fn try_lock_mutex(mutex: MutexRef<Traits>) -> Result<(), TryLockMutexError> {
        let cb = mutex.cb();
        state::expect_task_context::<Traits>()?;
        let mut lock = imask::acquire::<Traits>()?;

        let me = Traits::state().running_task(lock.borrow_mut()).unwrap();

        match cb.owner.get(&*lock) {
            None => {
                take_ownership(lock.borrow_mut(), cb, &me);
                Ok(())
            }
            Some(owner) if owner == me => {
                if let QueueKind::Mutex { recursive: true } = cb.kind {
                    cb.recursion.replace_with(&mut *lock, |x| *x + 1);
                    Ok(())
                } else {
                    Err(TryLockMutexError::WouldDeadlock)
                }
            }
            Some(_) => Err(TryLockMutexError::WouldBlock),
        }
    }

    /// Release the mutex. Fails with `NotOwner` unless the calling task
    /// holds it. Releasing may lower the caller's effective priority and
    /// hand the mutex (and the processor) to a waiting task.
    pub fn unlock_mutex(mutex: MutexRef<Traits>) -> Result<(), UnlockMutexError> {
        let cb = mutex.cb();
        state::expect_task_context::<Traits>()?;
        let mut lock = imask::acquire::<Traits>()?;

        let me = Traits::state().running_task(lock.borrow_mut()).unwrap();

        if cb.owner.get(&*lock) != Some(me) {
            return Err(UnlockMutexError::NotOwner);
        }

        let recursion = cb.recursion.get(&*lock);
        if recursion > 1 {
            cb.recursion.replace(&mut *lock, recursion - 1);
            return Ok(());
        }

        let held = me.mutexes_held.get(&*lock) - 1;
        me.mutexes_held.replace(&mut *lock, held);

        // Undo priority inheritance once the last mutex is released
        if held == 0 {
            let base = me.base_priority.get(&*lock);
            task::change_effective_priority(lock.borrow_mut(), &me, base);
        }

        // Hand the mutex to the next waiter, if any
        if let Some(waiter) = cb.recv_wait.first_waiting_task(lock.borrow_mut()) {
            let waiter = TaskRef::new(waiter);
            let payload = wait::complete_wait(lock.borrow_mut(), waiter.control_block(), Ok(()))
                .expect("waiter on the event list had no active wait");
            debug_assert!(matches!(payload, WaitPayload::Mutex(_)));
            take_ownership(lock.borrow_mut(), cb, &waiter);
        } else {
            cb.owner.replace(&mut *lock, None);
            cb.recursion.replace(&mut *lock, 0);
            cb.count.replace(&mut *lock, 1);
        }

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// The task currently owning the mutex, if any.
    pub fn mutex_owner(mutex: MutexRef<Traits>) -> Option<TaskRef<Traits>> {
        let cb = mutex.cb();
        let Ok(lock) = imask::acquire::<Traits>() else {
            let lock = unsafe { imask::adopt::<Traits>() };
            let owner = cb.owner.get(&*lock);
            core::mem::forget(lock);
            return owner;
        };
        cb.owner.get(&*lock)
    }
}

/// Record `task` as the mutex owner. The task must be Running or about to be
/// made Ready by the caller.
fn take_ownership<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    cb: &'static QueueCb<Traits>,
    task: &TaskRef<Traits>,
) {
    cb.owner.replace(&mut *lock, Some(*task));
    cb.recursion.replace(&mut *lock, 1);
    cb.count.replace(&mut *lock, 0);
    task.mutexes_held.replace_with(&mut *lock, |x| *x + 1);
}

/// Raise `owner`'s effective priority to `priority` if it is lower,
/// following the chain of mutexes the raised tasks are themselves blocked
/// on.
fn inherit_priority<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    owner: TaskRef<Traits>,
    priority: Priority,
) {
    let mut target = owner;
    loop {
        if target.effective_priority.get(&*lock) >= priority {
            break;
        }
        task::change_effective_priority(lock.borrow_mut(), &target, priority);

        // If the boosted owner is itself waiting on a mutex, its owner needs
        // the boost too
        let Some(next_cb) = wait::blocked_on_mutex(lock.borrow_mut(), &target) else {
            break;
        };
        let Some(next_owner) = next_cb.owner.get(&*lock) else {
            break;
        };
        target = next_owner;
    }
}

/// Re-evaluate the owner's inherited priority after a waiter gave up
/// (timeout, abort, suspension, or deletion). Called with the departing
/// waiter already removed from the event list.
pub(crate) fn disinherit_after_wait_failure<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    cb: &'static QueueCb<Traits>,
) {
    let Some(owner) = cb.owner.get(&*lock) else {
        return;
    };

    // With several mutexes held there is no record of which waiter raised
    // what; the priority is then corrected when the last mutex is released
    if owner.mutexes_held.get(&*lock) != 1 {
        return;
    }

    let top_waiter = cb
        .recv_wait
        .first_waiting_task(lock.borrow_mut())
        .map(|t| t.effective_priority.get(&*lock));

    let new = owner
        .base_priority
        .get(&*lock)
        .max(top_waiter.unwrap_or(0));

    if new < owner.effective_priority.get(&*lock) {
        task::change_effective_priority(lock.borrow_mut(), &owner, new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{drain_terminated, serial_guard, set_running_for_test, TestPort},
        System,
    };

    fn noop(_: usize) {}

    type Sys = System<TestPort>;

    #[test]
    fn ownership_is_exclusive_and_checked() {
        let _serial = serial_guard();
        let holder = Sys::create_task_raw("mx_holder", 5, 1024, noop, 0).unwrap();
        let other = Sys::create_task_raw("mx_other", 5, 1024, noop, 0).unwrap();
        let mutex = Sys::create_mutex().unwrap();

        set_running_for_test(Some(holder));
        Sys::try_lock_mutex(mutex).unwrap();
        assert_eq!(Sys::mutex_owner(mutex), Some(holder));

        // Re-acquisition of a non-recursive mutex would self-deadlock
        assert_eq!(
            Sys::try_lock_mutex(mutex).unwrap_err(),
            TryLockMutexError::WouldDeadlock
        );

        // Only the owner may unlock
        set_running_for_test(Some(other));
        assert_eq!(
            Sys::unlock_mutex(mutex).unwrap_err(),
            UnlockMutexError::NotOwner
        );
        assert_eq!(
            Sys::try_lock_mutex(mutex).unwrap_err(),
            TryLockMutexError::WouldBlock
        );

        set_running_for_test(Some(holder));
        Sys::unlock_mutex(mutex).unwrap();
        assert_eq!(Sys::mutex_owner(mutex), None);

        set_running_for_test(None);
        Sys::delete_mutex(mutex).unwrap();
        Sys::delete_task(holder).unwrap();
        Sys::delete_task(other).unwrap();
        drain_terminated();
    }

    #[test]
    fn recursive_locking_counts_correctly() {
        let _serial = serial_guard();
        let holder = Sys::create_task_raw("rmx_holder", 5, 1024, noop, 0).unwrap();
        let mutex = Sys::create_recursive_mutex().unwrap();

        set_running_for_test(Some(holder));
        Sys::try_lock_mutex(mutex).unwrap();
        Sys::try_lock_mutex(mutex).unwrap();
        Sys::try_lock_mutex(mutex).unwrap();

        // Only the last unlock releases the mutex
        Sys::unlock_mutex(mutex).unwrap();
        Sys::unlock_mutex(mutex).unwrap();
        assert_eq!(Sys::mutex_owner(mutex), Some(holder));
        Sys::unlock_mutex(mutex).unwrap();
        assert_eq!(Sys::mutex_owner(mutex), None);
        assert_eq!(
            Sys::unlock_mutex(mutex).unwrap_err(),
            UnlockMutexError::NotOwner
        );

        set_running_for_test(None);
        Sys::delete_mutex(mutex).unwrap();
        Sys::delete_task(holder).unwrap();
        drain_terminated();
    }

    #[test]
    fn held_count_follows_ownership() {
        let _serial = serial_guard();
        let holder = Sys::create_task_raw("held_cnt", 5, 1024, noop, 0).unwrap();
        let m1 = Sys::create_mutex().unwrap();
        let m2 = Sys::create_mutex().unwrap();

        set_running_for_test(Some(holder));
        Sys::try_lock_mutex(m1).unwrap();
        Sys::try_lock_mutex(m2).unwrap();
        {
            let lock = crate::test_utils::lock_test_cpu();
            assert_eq!(holder.mutexes_held.get(&*lock), 2);
        }
        Sys::unlock_mutex(m2).unwrap();
        Sys::unlock_mutex(m1).unwrap();
        {
            let lock = crate::test_utils::lock_test_cpu();
            assert_eq!(holder.mutexes_held.get(&*lock), 0);
        }

        set_running_for_test(None);
        Sys::delete_mutex(m1).unwrap();
        Sys::delete_mutex(m2).unwrap();
        Sys::delete_task(holder).unwrap();
        drain_terminated();
    }
}
