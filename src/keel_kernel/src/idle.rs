//! The idle task.
//!
//! Runs at priority 0 whenever nothing else is ready: reclaims the memory of
//! deleted tasks, runs the application idle hook, and optionally asks the
//! port to suppress ticks until the next scheduled wakeup.
use crate::{
    error::CreateError,
    imask,
    task::{self, readyqueue::Queue as _, TaskEntry},
    timeout, KernelTraits, System,
};

pub(crate) fn create_idle_task<Traits: KernelTraits>() -> Result<(), CreateError> {
    let idle = System::<Traits>::create_task_inner(
        "idle",
        0,
        Traits::IDLE_TASK_STACK_SIZE,
        TaskEntry::Func(idle_entry::<Traits>, 0),
        None,
        true,
    )?;

    let mut lock = imask::acquire::<Traits>()?;
    Traits::state().idle_task.replace(&mut *lock, Some(idle));
    Ok(())
}

fn idle_entry<Traits: KernelTraits>(_: usize) {
    loop {
        while task::reclaim_one_terminated::<Traits>() {}

        if let Some(hook) = Traits::IDLE_HOOK {
            hook();
        }

        if Traits::TICKLESS_IDLE {
            suppress_ticks_until_next_wake::<Traits>();
        }

        System::<Traits>::yield_now();
    }
}

/// Ask the port to stop the tick interrupt for as long as no task needs to
/// wake, then account for the skipped period in one lump.
fn suppress_ticks_until_next_wake<Traits: KernelTraits>() {
    let idle_ticks = {
        let Ok(mut lock) = imask::acquire::<Traits>() else {
            return;
        };

        // Only the idle task may be ready
        match task::ready_queue::<Traits>().highest_ready(lock.borrow_mut()) {
            Some(0) | None => {}
            Some(_) => return,
        }

        let g = &Traits::state().timeout;
        let now = g.tick_count(lock.borrow_mut());
        match g.current_delayed_list(lock.borrow_mut()).first_key(lock.borrow_mut()) {
            Some(wake) => wake.saturating_sub(now),
            // Nothing on this side of the wrap; sleep up to the wrap point
            None => u32::MAX - now,
        }
    };

    if idle_ticks < 2 {
        return;
    }

    // Safety: CPU Lock inactive
    let suppressed = unsafe { Traits::try_suppress_ticks(idle_ticks - 1) };
    if suppressed == 0 {
        return;
    }

    let Ok(mut lock) = imask::acquire::<Traits>() else {
        return;
    };
    let want_yield = timeout::step_ticks::<Traits>(lock.borrow_mut(), suppressed);
    drop(lock);
    if want_yield {
        System::<Traits>::yield_now();
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// The idle task's handle, once the scheduler has started.
    pub fn idle_task() -> Option<task::TaskRef<Traits>> {
        let lock = imask::acquire::<Traits>().ok()?;
        Traits::state().idle_task.get(&*lock)
    }
}
