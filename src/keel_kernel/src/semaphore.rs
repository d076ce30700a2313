//! Binary and counting semaphores, built on the queue control block: the
//! permit count is the queue's `count` field and there is no item storage.
use core::fmt;

use crate::{
    error::{CreateError, DeleteError, PollError, SignalError, WaitError},
    imask, state, task,
    queue::{create_queue_cb, delete_queue_cb, QueueCb, QueueKind, QueueRef},
    wait::{self, Deadline, WaitPayload},
    KernelTraits, PortThreading, System, UTicks,
};

/// A `Copy`able handle to a semaphore. Using a handle after
/// [`System::delete_semaphore`] is undefined behavior.
pub struct SemaphoreRef<Traits: PortThreading>(pub(crate) QueueRef<Traits>);

impl<Traits: PortThreading> Clone for SemaphoreRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for SemaphoreRef<Traits> {}

impl<Traits: PortThreading> PartialEq for SemaphoreRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: PortThreading> Eq for SemaphoreRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SemaphoreRef({:p})", self.0 .0 as *const _)
    }
}

impl<Traits: PortThreading> SemaphoreRef<Traits> {
    fn cb(self) -> &'static QueueCb<Traits> {
        self.0 .0
    }
}

fn is_semaphore<Traits: PortThreading>(queue: &QueueCb<Traits>) -> bool {
    matches!(
        queue.kind,
        QueueKind::BinarySemaphore | QueueKind::CountingSemaphore
    )
}

/// Semaphores.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a binary semaphore, initially available or not.
    pub fn create_binary_semaphore(
        initially_available: bool,
    ) -> Result<SemaphoreRef<Traits>, CreateError> {
        create_queue_cb(
            QueueKind::BinarySemaphore,
            1,
            0,
            usize::from(initially_available),
        )
        .map(SemaphoreRef)
    }

    /// Create a counting semaphore with the given maximum and initial count.
    pub fn create_counting_semaphore(
        max_count: usize,
        initial_count: usize,
    ) -> Result<SemaphoreRef<Traits>, CreateError> {
        create_queue_cb(QueueKind::CountingSemaphore, max_count, 0, initial_count)
            .map(SemaphoreRef)
    }

    /// Delete a semaphore. Fails with `BadObjectState` if any task is
    /// blocked on it.
    pub fn delete_semaphore(sem: SemaphoreRef<Traits>) -> Result<(), DeleteError> {
        if !is_semaphore(sem.cb()) {
            return Err(DeleteError::BadObjectState);
        }
        delete_queue_cb(sem.0)
    }

    /// Release one permit. If a task is blocked on the semaphore, the permit
    /// is transferred to the highest-priority waiter directly; otherwise the
    /// count is incremented, failing with `WouldBlock` at the maximum.
    pub fn semaphore_signal(sem: SemaphoreRef<Traits>) -> Result<(), SignalError> {
        let sem = sem.cb();
        let mut lock = imask::acquire::<Traits>()?;

        if let Some(waiter) = sem.recv_wait.first_waiting_task(lock.borrow_mut()) {
            let payload = wait::complete_wait(lock.borrow_mut(), waiter, Ok(()))
                .expect("waiter on the event list had no active wait");
            debug_assert!(matches!(payload, WaitPayload::Semaphore));
        } else {
            let count = sem.count.get(&*lock);
            if count >= sem.capacity() {
                return Err(SignalError::WouldBlock);
            }
            sem.count.replace(&mut *lock, count + 1);
        }

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`Self::semaphore_signal`] callable from interrupt context.
    pub fn semaphore_signal_from_isr(
        sem: SemaphoreRef<Traits>,
        higher_priority_task_woken: &mut bool,
    ) -> Result<(), SignalError> {
        let sem = sem.cb();
        let mut lock = imask::acquire::<Traits>()?;

        if let Some(waiter) = sem.recv_wait.first_waiting_task(lock.borrow_mut()) {
            let payload = wait::complete_wait(lock.borrow_mut(), waiter, Ok(()))
                .expect("waiter on the event list had no active wait");
            debug_assert!(matches!(payload, WaitPayload::Semaphore));
            *higher_priority_task_woken |= task::preemption_needed(lock.borrow_mut());
        } else {
            let count = sem.count.get(&*lock);
            if count >= sem.capacity() {
                return Err(SignalError::WouldBlock);
            }
            sem.count.replace(&mut *lock, count + 1);
        }
        Ok(())
    }

    /// Acquire one permit, blocking for up to `timeout` ticks.
    pub fn semaphore_wait(sem: SemaphoreRef<Traits>, timeout: UTicks) -> Result<(), WaitError> {
        let sem = sem.cb();
        let mut lock = imask::acquire::<Traits>()?;

        let count = sem.count.get(&*lock);
        if count > 0 {
            sem.count.replace(&mut *lock, count - 1);
            return Ok(());
        }
        if timeout == 0 {
            return Err(WaitError::Timeout);
        }
        state::expect_waitable_context::<Traits>(lock.borrow_mut())?;

        // Block; the permit will be handed over by a signaller
        wait::wait(
            lock.borrow_mut(),
            Some(&sem.recv_wait),
            WaitPayload::Semaphore,
            Deadline::from_timeout(timeout),
        )?;
        Ok(())
    }

    /// Acquire one permit without blocking.
    pub fn semaphore_poll(sem: SemaphoreRef<Traits>) -> Result<(), PollError> {
        let sem = sem.cb();
        let mut lock = imask::acquire::<Traits>()?;

        let count = sem.count.get(&*lock);
        if count > 0 {
            sem.count.replace(&mut *lock, count - 1);
            Ok(())
        } else {
            Err(PollError::WouldBlock)
        }
    }

    /// The number of available permits.
    pub fn semaphore_count(sem: SemaphoreRef<Traits>) -> usize {
        let sem = sem.cb();
        let Ok(lock) = imask::acquire::<Traits>() else {
            let lock = unsafe { imask::adopt::<Traits>() };
            let count = sem.count.get(&*lock);
            core::mem::forget(lock);
            return count;
        };
        sem.count.get(&*lock)
    }
}
