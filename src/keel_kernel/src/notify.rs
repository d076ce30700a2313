//! Direct-to-task notifications: a 32-bit mailbox embedded in every task
//! control block, with a three-state machine. Much lighter than a queue
//! because no kernel object or event list is involved; only the target's own
//! state item moves when it blocks.
use crate::{
    error::{NotifyError, WaitError},
    imask::{self, KernelCell, MaskTokenMut},
    state, task,
    task::{TaskRef, TaskSt},
    utils::Init,
    wait::{self, Deadline, WaitPayload},
    KernelTraits, PortThreading, System, UTicks,
};

/// How [`System::notify`] combines the notification value with the target's
/// mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    /// Leave the value unchanged (pure wakeup).
    None,
    /// OR the bits into the value.
    SetBits(u32),
    /// Add one to the value.
    Increment,
    /// Replace the value unconditionally.
    Overwrite(u32),
    /// Replace the value, failing with `WouldBlock` if a previous
    /// notification is still pending.
    SetValueWithoutOverwrite(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotifySt {
    NotWaiting,
    Waiting,
    Notified,
}

/// The notification mailbox embedded in every task control block.
pub(crate) struct TaskNotify<Traits: PortThreading> {
    value: KernelCell<Traits, u32>,
    st: KernelCell<Traits, NotifySt>,
}

impl<Traits: PortThreading> Init for TaskNotify<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        value: KernelCell::new(0),
        st: KernelCell::new(NotifySt::NotWaiting),
    };
}

fn notify_inner<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task: &TaskRef<Traits>,
    action: NotifyAction,
) -> Result<(), NotifyError> {
    let notify = &task.notify;
    let was = notify.st.get(&*lock);

    match action {
        NotifyAction::None => {}
        NotifyAction::SetBits(bits) => {
            notify.value.replace_with(&mut *lock, |x| *x | bits);
        }
        NotifyAction::Increment => {
            notify.value.replace_with(&mut *lock, |x| x.wrapping_add(1));
        }
        NotifyAction::Overwrite(value) => {
            notify.value.replace(&mut *lock, value);
        }
        NotifyAction::SetValueWithoutOverwrite(value) => {
            if was == NotifySt::Notified {
                return Err(NotifyError::WouldBlock);
            }
            notify.value.replace(&mut *lock, value);
        }
    }

    notify.st.replace(&mut *lock, NotifySt::Notified);

    if was == NotifySt::Waiting {
        debug_assert_eq!(*task.st.read(&*lock), TaskSt::Waiting);
        wait::interrupt_task(lock, task, Ok(()));
    }
    Ok(())
}

/// Block the current task until its mailbox is notified, with the state
/// already set to `Waiting` by the caller. Restores `NotWaiting` on failure.
fn block_for_notification<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    timeout: UTicks,
) -> Result<(), WaitError> {
    state::expect_waitable_context::<Traits>(lock.borrow_mut())?;

    let me = Traits::state().running_task(lock.borrow_mut()).unwrap();
    me.notify.st.replace(&mut *lock, NotifySt::Waiting);

    let result = wait::wait(
        lock.borrow_mut(),
        None,
        WaitPayload::Notify,
        Deadline::from_timeout(timeout),
    );

    if let Err(e) = result {
        me.notify.st.replace(&mut *lock, NotifySt::NotWaiting);
        return Err(e.into());
    }
    Ok(())
}

/// Task notifications.
impl<Traits: KernelTraits> System<Traits> {
    /// Notify a task, updating its mailbox according to `action` and waking
    /// it if it is blocked in [`Self::notify_take`] or [`Self::notify_wait`].
    pub fn notify(task: TaskRef<Traits>, action: NotifyAction) -> Result<(), NotifyError> {
        let mut lock = imask::acquire::<Traits>()?;
        notify_inner(lock.borrow_mut(), &task, action)?;
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`Self::notify`] callable from interrupt context.
    pub fn notify_from_isr(
        task: TaskRef<Traits>,
        action: NotifyAction,
        higher_priority_task_woken: &mut bool,
    ) -> Result<(), NotifyError> {
        let mut lock = imask::acquire::<Traits>()?;
        notify_inner(lock.borrow_mut(), &task, action)?;
        *higher_priority_task_woken |= task::preemption_needed(lock.borrow_mut());
        Ok(())
    }

    /// Wait for the mailbox to become non-zero, consuming it like a
    /// semaphore: the whole value if `clear_on_exit`, one count otherwise.
    /// Returns the value observed before consumption.
    pub fn notify_take(clear_on_exit: bool, timeout: UTicks) -> Result<u32, WaitError> {
        let mut lock = imask::acquire::<Traits>()?;
        let me = Traits::state().running_task(lock.borrow_mut()).unwrap();

        if me.notify.value.get(&*lock) == 0 {
            if timeout == 0 {
                return Err(WaitError::Timeout);
            }
            block_for_notification::<Traits>(lock.borrow_mut(), timeout)?;
        }

        // The value can still be zero if the notification carried no update
        // (`NotifyAction::None`)
        let value = me.notify.value.get(&*lock);
        me.notify.value.replace(
            &mut *lock,
            if clear_on_exit { 0 } else { value.saturating_sub(1) },
        );
        me.notify.st.replace(&mut *lock, NotifySt::NotWaiting);
        Ok(value)
    }

    /// Wait for a notification. `clear_bits_on_entry` is cleared from the
    /// value before waiting, `clear_bits_on_exit` after. Returns the value
    /// as it was when the notification arrived.
    pub fn notify_wait(
        clear_bits_on_entry: u32,
        clear_bits_on_exit: u32,
        timeout: UTicks,
    ) -> Result<u32, WaitError> {
        let mut lock = imask::acquire::<Traits>()?;
        let me = Traits::state().running_task(lock.borrow_mut()).unwrap();

        if me.notify.st.get(&*lock) != NotifySt::Notified {
            me.notify
                .value
                .replace_with(&mut *lock, |x| *x & !clear_bits_on_entry);
            if timeout == 0 {
                return Err(WaitError::Timeout);
            }
            block_for_notification::<Traits>(lock.borrow_mut(), timeout)?;
        }

        let value = me.notify.value.get(&*lock);
        me.notify
            .value
            .replace(&mut *lock, value & !clear_bits_on_exit);
        me.notify.st.replace(&mut *lock, NotifySt::NotWaiting);
        Ok(value)
    }

    /// Clear a pending notification without waiting. Returns whether one was
    /// pending.
    pub fn notify_clear(task: TaskRef<Traits>) -> bool {
        let mut lock = match imask::acquire::<Traits>() {
            Ok(lock) => lock,
            Err(_) => return false,
        };
        let was = task
            .notify
            .st
            .replace(&mut *lock, NotifySt::NotWaiting);
        was == NotifySt::Notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{drain_terminated, lock_test_cpu, serial_guard, TestPort},
        System,
    };

    fn noop(_: usize) {}

    type Sys = System<TestPort>;

    #[test]
    fn actions_update_the_mailbox() {
        let _serial = serial_guard();
        let t = Sys::create_task_raw("mailbox", 5, 1024, noop, 0).unwrap();

        Sys::notify(t, NotifyAction::SetBits(0b101)).unwrap();
        Sys::notify(t, NotifyAction::Increment).unwrap();
        {
            let lock = lock_test_cpu();
            assert_eq!(t.notify.value.get(&*lock), 0b101 + 1);
            assert_eq!(t.notify.st.get(&*lock), NotifySt::Notified);
        }

        assert!(Sys::notify_clear(t));
        assert!(!Sys::notify_clear(t));

        Sys::notify(t, NotifyAction::Overwrite(7)).unwrap();
        // A pending notification refuses to be clobbered...
        assert_eq!(
            Sys::notify(t, NotifyAction::SetValueWithoutOverwrite(9)).unwrap_err(),
            NotifyError::WouldBlock
        );
        {
            let lock = lock_test_cpu();
            assert_eq!(t.notify.value.get(&*lock), 7);
        }
        // ...until it is consumed
        assert!(Sys::notify_clear(t));
        Sys::notify(t, NotifyAction::SetValueWithoutOverwrite(9)).unwrap();
        {
            let lock = lock_test_cpu();
            assert_eq!(t.notify.value.get(&*lock), 9);
        }

        Sys::delete_task(t).unwrap();
        drain_terminated();
    }
}
