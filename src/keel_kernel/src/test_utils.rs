//! A minimal port used by the in-crate unit tests.
//!
//! Only the CPU Lock flag is functional (one per test thread); everything
//! that would require a real scheduler is `unreachable!`. This is enough to
//! exercise the list, bitmap, and ready-queue primitives, which only need a
//! lock token.
use std::{
    cell::Cell,
    sync::{Mutex, MutexGuard},
};

use crate::{imask, task::TaskCb, PortThreading, PortTimer, UTicks};

pub(crate) struct TestPort;

std::thread_local! {
    static CPU_LOCK: Cell<bool> = const { Cell::new(false) };
}

/// Tests that touch the shared `TestPort` kernel state take this guard so
/// they don't interleave (the test harness runs tests on multiple threads).
pub(crate) fn serial_guard() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    let _ = env_logger::builder().is_test(true).try_init();
    let guard = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    log::trace!("serialized kernel-state test section entered");
    guard
}

unsafe impl PortThreading for TestPort {
    type PortTaskState = ();
    const PORT_TASK_STATE_INIT: () = ();

    unsafe fn dispatch_first_task() -> ! {
        unreachable!("unit tests never dispatch")
    }

    unsafe fn yield_cpu() {
        unreachable!("unit tests never context-switch")
    }

    unsafe fn exit_and_dispatch(_task: &'static TaskCb<Self>) -> ! {
        unreachable!("unit tests never context-switch")
    }

    unsafe fn enter_cpu_lock() {
        CPU_LOCK.with(|flag| {
            assert!(!flag.get());
            flag.set(true);
        });
    }

    unsafe fn try_enter_cpu_lock() -> bool {
        CPU_LOCK.with(|flag| {
            if flag.get() {
                false
            } else {
                flag.set(true);
                true
            }
        })
    }

    unsafe fn leave_cpu_lock() {
        CPU_LOCK.with(|flag| {
            assert!(flag.get());
            flag.set(false);
        });
    }

    unsafe fn initialize_task_state(_task: &'static TaskCb<Self>) {}

    fn is_cpu_lock_active() -> bool {
        CPU_LOCK.with(Cell::get)
    }

    fn is_task_context() -> bool {
        // Lets non-blocking operations that check for a task context be
        // exercised; anything that would actually block still fails before
        // reaching `yield_cpu` because the scheduler is never started.
        true
    }

    fn is_interrupt_context() -> bool {
        false
    }
}

unsafe impl PortTimer for TestPort {
    unsafe fn try_suppress_ticks(_max_ticks: UTicks) -> UTicks {
        0
    }
}

crate::configure_kernel! {
    impl KernelCfg for TestPort {
        num_priority_levels: 16,
        timer_daemon_priority: 14,
    }
}

/// Acquire the test CPU Lock for the calling test thread.
pub(crate) fn lock_test_cpu() -> imask::MaskGuard<TestPort> {
    imask::acquire().expect("the test CPU lock is already held")
}

/// Pretend that `task` is the currently running task (or that there is
/// none), so that operations which consult the running task can be exercised
/// without a scheduler.
pub(crate) fn set_running_for_test(task: Option<crate::TaskRef<TestPort>>) {
    use crate::task::TaskSt;

    let mut lock = lock_test_cpu();
    let state = <TestPort as crate::KernelCfg>::state();
    if let Some(prev) = state.running_task(lock.borrow_mut()) {
        if *prev.st.read(&*lock) == TaskSt::Running {
            prev.st.replace(&mut *lock, TaskSt::Ready);
        }
    }
    if let Some(task) = task {
        task.st.replace(&mut *lock, TaskSt::Running);
    }
    state.running_task_cell().replace(&mut *lock, task);
}

/// Free every control block parked on the terminated list. Tests that
/// delete tasks call this so that later tests see a clean slate.
pub(crate) fn drain_terminated() {
    while crate::task::reclaim_one_terminated::<TestPort>() {}
}
