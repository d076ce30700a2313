//! Tick management and timed wakeups.
//!
//! The tick counter is a wrapping `u32`. Tasks awaiting a time-based wake sit
//! in one of two delayed lists keyed by their absolute wake tick: the
//! *current* list holds wake times on this side of the counter wrap, the
//! *overflow* list holds wake times beyond it. When the counter wraps to
//! zero the two lists trade roles, which keeps every list scan strictly
//! key-ordered without ever comparing across the wrap.
use crate::{
    error::WaitTimeoutError,
    imask::{self, KernelCell, MaskTokenMut},
    task::{self, readyqueue::Queue as _, TaskCb, TaskRef, TaskSt},
    utils::{
        intrusive_list::{owner_of, List},
        Init,
    },
    wait, KernelCfg, KernelTraits, System, UTicks,
};

/// Kernel-global state for tick accounting.
pub(crate) struct TimeoutGlobals<Traits: crate::PortThreading> {
    tick_count: KernelCell<Traits, UTicks>,

    /// The two delayed-task lists; see the module doc.
    delayed: [List<Traits, TaskCb<Traits>>; 2],

    /// Index of the current delayed list within `delayed`.
    current: KernelCell<Traits, u8>,

    /// Ticks that arrived while the scheduler was suspended, applied by
    /// `resume_scheduler`.
    pended_ticks: KernelCell<Traits, UTicks>,
}

impl<Traits: crate::PortThreading> Init for TimeoutGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        tick_count: KernelCell::new(0),
        delayed: [const { List::INIT }; 2],
        current: KernelCell::new(0),
        pended_ticks: KernelCell::new(0),
    };
}

impl<Traits: KernelTraits> TimeoutGlobals<Traits> {
    pub(crate) fn tick_count(&self, lock: MaskTokenMut<'_, Traits>) -> UTicks {
        self.tick_count.get(&*lock)
    }

    pub(crate) fn current_delayed_list(
        &'static self,
        lock: MaskTokenMut<'_, Traits>,
    ) -> &'static List<Traits, TaskCb<Traits>> {
        &self.delayed[self.current.get(&*lock) as usize]
    }

    pub(crate) fn overflow_delayed_list(
        &'static self,
        lock: MaskTokenMut<'_, Traits>,
    ) -> &'static List<Traits, TaskCb<Traits>> {
        &self.delayed[1 - self.current.get(&*lock) as usize]
    }

    pub(crate) fn delayed_lists(&'static self) -> &'static [List<Traits, TaskCb<Traits>>; 2] {
        &self.delayed
    }

    pub(crate) fn take_pended_ticks(&self, mut lock: MaskTokenMut<'_, Traits>) -> UTicks {
        self.pended_ticks.replace(&mut *lock, 0)
    }

    #[cfg(test)]
    pub(crate) fn set_tick_for_test(&self, mut lock: MaskTokenMut<'_, Traits>, tick: UTicks) {
        self.tick_count.replace(&mut *lock, tick);
    }
}

/// Advance the tick counter by one and wake every task whose wake time has
/// arrived. Returns whether a context switch should be requested: a woken
/// task outranks the running one, or time slicing found the running task has
/// ready peers.
pub(crate) fn increment_tick<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
) -> bool {
    let state = Traits::state();
    let g = &state.timeout;

    let now = g.tick_count.get(&*lock).wrapping_add(1);
    g.tick_count.replace(&mut *lock, now);

    if now == 0 {
        // The counter wrapped; every current wake time has been consumed, so
        // the overflow list takes over
        debug_assert!(g.current_delayed_list(lock.borrow_mut()).is_empty(lock.borrow_mut()));
        g.current.replace_with(&mut *lock, |x| 1 - *x);
    }

    loop {
        let list = g.current_delayed_list(lock.borrow_mut());
        let Some(item) = list.first_item(lock.borrow_mut()) else {
            break;
        };
        if item.key(lock.borrow_mut()) > now {
            break;
        }
        let task = owner_of(lock.borrow_mut(), item);
        wait::interrupt_task(
            lock.borrow_mut(),
            &TaskRef::new(task),
            Err(WaitTimeoutError::Timeout),
        );
    }

    let mut want_yield = task::preemption_needed(lock.borrow_mut());

    if Traits::TIME_SLICING && !want_yield {
        // Round-robin among equal-priority peers
        if let Some(current) = state.running_task(lock.borrow_mut()) {
            if *current.st.read(&*lock) == TaskSt::Running {
                let pri = current.effective_priority.get(&*lock);
                want_yield = task::ready_queue::<Traits>().peer_count(lock.borrow_mut(), pri) > 1;
            }
        }
    }

    want_yield
}

/// Apply a lump of `ticks` at once after a tickless-idle period.
pub(crate) fn step_ticks<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    ticks: UTicks,
) -> bool {
    let mut want_yield = false;
    for _ in 0..ticks {
        want_yield |= increment_tick(lock.borrow_mut());
    }
    want_yield
}

/// Implements `PortToKernel::timer_tick`.
///
/// Precondition: CPU Lock inactive, an interrupt context.
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = imask::acquire::<Traits>().unwrap();
    let state = Traits::state();

    if state.sched_suspend_depth.get(&*lock) != 0 {
        // Scheduling decisions are on hold; remember the tick for
        // `resume_scheduler`
        state
            .timeout
            .pended_ticks
            .replace_with(&mut *lock, |x| x.wrapping_add(1));
        drop(lock);
        if let Some(hook) = Traits::TICK_HOOK {
            hook();
        }
        return;
    }

    let want_yield = increment_tick(lock.borrow_mut());
    drop(lock);

    if let Some(hook) = Traits::TICK_HOOK {
        hook();
    }

    if want_yield {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// The current value of the tick counter.
    pub fn tick_count() -> UTicks {
        if let Ok(lock) = imask::acquire::<Traits>() {
            Traits::state().timeout.tick_count.get(&*lock)
        } else {
            // Inside a critical section; read with the already-active lock
            let lock = unsafe { imask::adopt::<Traits>() };
            let now = Traits::state().timeout.tick_count.get(&*lock);
            core::mem::forget(lock);
            now
        }
    }

    /// [`Self::tick_count`] callable from interrupt context.
    pub fn tick_count_from_isr() -> UTicks {
        Self::tick_count()
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

    #[test]
    fn unblocks_in_temporal_order_across_the_counter_wrap() {
        let _serial = serial_guard();
        let a = System::<TestPort>::create_task_raw("wrap_a", 5, 1024, noop, 0).unwrap();
        let b = System::<TestPort>::create_task_raw("wrap_b", 5, 1024, noop, 0).unwrap();

        {
            let mut lock = lock_test_cpu();
            let g = &<TestPort as KernelCfg>::state().timeout;
            g.set_tick_for_test(lock.borrow_mut(), u32::MAX - 2);

            // `a` wakes right before the counter wraps, `b` right after
            wait::block_task_for_test(lock.borrow_mut(), a.control_block(), u32::MAX);
            wait::block_task_for_test(lock.borrow_mut(), b.control_block(), 1);
            assert_eq!(*a.st.read(&*lock), TaskSt::Waiting);
            assert_eq!(*b.st.read(&*lock), TaskSt::Waiting);

            increment_tick(lock.borrow_mut()); // -> MAX - 1
            assert_eq!(*a.st.read(&*lock), TaskSt::Waiting);

            increment_tick(lock.borrow_mut()); // -> MAX
            assert_eq!(*a.st.read(&*lock), TaskSt::Ready);
            assert_eq!(*b.st.read(&*lock), TaskSt::Waiting);

            increment_tick(lock.borrow_mut()); // -> 0 (wrap, lists switch)
            assert_eq!(*b.st.read(&*lock), TaskSt::Waiting);

            increment_tick(lock.borrow_mut()); // -> 1
            assert_eq!(*b.st.read(&*lock), TaskSt::Ready);
        }

        System::<TestPort>::delete_task(a).unwrap();
        System::<TestPort>::delete_task(b).unwrap();
        drain_terminated();
    }

    #[test]
    fn pended_ticks_accumulate_while_the_scheduler_is_suspended() {
        let _serial = serial_guard();
        let mut lock = lock_test_cpu();
        let g = &<TestPort as KernelCfg>::state().timeout;

        assert_eq!(g.take_pended_ticks(lock.borrow_mut()), 0);
        g.pended_ticks.replace_with(&mut *lock, |x| *x + 3);
        assert_eq!(g.take_pended_ticks(lock.borrow_mut()), 3);
        assert_eq!(g.take_pended_ticks(lock.borrow_mut()), 0);
    }
}
