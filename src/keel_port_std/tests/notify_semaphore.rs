//! A notification mailbox used as a counting semaphore: five increments are
//! consumed by one take, and a subsequent take times out.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use keel_kernel::{error::WaitError, NotifyAction, System, WAIT_FOREVER};

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

static TAKEN: AtomicU32 = AtomicU32::new(0);
static TIMED_OUT: AtomicBool = AtomicBool::new(false);

#[test]
fn notification_as_counting_semaphore() {
    keel_port_std::boot::<SimSystem>(|| {
        let receiver = Sys::create_task(
            "receiver",
            6,
            STACK,
            fallible::<SimSystem>(|| {
                let value = Sys::notify_take(true, WAIT_FOREVER).unwrap();
                TAKEN.store(value, Ordering::SeqCst);

                // The mailbox was drained; the next take starves
                let err = Sys::notify_take(true, 10).unwrap_err();
                TIMED_OUT.store(err == WaitError::Timeout, Ordering::SeqCst);
                keel_port_std::shutdown::<SimSystem>();
            }),
        )
        .unwrap();

        Sys::create_task(
            "sender",
            7,
            STACK,
            fallible::<SimSystem>(move || {
                // Let the receiver block first
                Sys::delay(5).unwrap();
                for _ in 0..5 {
                    Sys::notify(receiver, NotifyAction::Increment).unwrap();
                }
                let _ = Sys::delay(WAIT_FOREVER);
            }),
        )
        .unwrap();
    });

    assert_eq!(TAKEN.load(Ordering::SeqCst), 5);
    assert!(TIMED_OUT.load(Ordering::SeqCst));
}
