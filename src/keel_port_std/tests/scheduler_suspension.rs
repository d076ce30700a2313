//! Suspending the scheduler defers wakeups: a notified high-priority task
//! runs only once the scheduler resumes.
use std::sync::atomic::{AtomicBool, Ordering};

use keel_kernel::{NotifyAction, System, WAIT_FOREVER};

mod common;
use common::{fallible, STACK};

keel_port_std::use_port!(unsafe struct SimSystem);
keel_kernel::configure_kernel! {
    impl KernelCfg for SimSystem {
        num_priority_levels: 16,
        timer_daemon_priority: 14,
    }
}

type Sys = System<SimSystem>;

static HI_RAN: AtomicBool = AtomicBool::new(false);
static DEFERRED: AtomicBool = AtomicBool::new(false);
static RAN_AFTER_RESUME: AtomicBool = AtomicBool::new(false);

#[test]
fn wakeups_are_deferred_while_suspended() {
    keel_port_std::boot::<SimSystem>(|| {
        let waiter = Sys::create_task(
            "hi_waiter",
            8,
            STACK,
            fallible::<SimSystem>(|| {
                Sys::notify_take(true, WAIT_FOREVER).unwrap();
                HI_RAN.store(true, Ordering::SeqCst);
                let _ = Sys::delay(WAIT_FOREVER);
            }),
        )
        .unwrap();

        Sys::create_task(
            "suspender",
            5,
            STACK,
            fallible::<SimSystem>(move || {
                // Let the waiter block first
                Sys::delay(2).unwrap();

                Sys::suspend_scheduler().unwrap();
                Sys::notify(waiter, NotifyAction::Increment).unwrap();

                // The higher-priority task must not have preempted us
                DEFERRED.store(!HI_RAN.load(Ordering::SeqCst), Ordering::SeqCst);

                Sys::resume_scheduler().unwrap();
                // The waiter ran the moment scheduling resumed
                RAN_AFTER_RESUME.store(HI_RAN.load(Ordering::SeqCst), Ordering::SeqCst);
                keel_port_std::shutdown::<SimSystem>();
            }),
        )
        .unwrap();
    });

    assert!(DEFERRED.load(Ordering::SeqCst));
    assert!(RAN_AFTER_RESUME.load(Ordering::SeqCst));
}
