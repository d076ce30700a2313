//! Priority inheritance: while a high-priority task waits on a mutex held by
//! a low-priority task, the holder runs at the waiter's priority and a
//! middle-priority busybody gets no processor time.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use keel_kernel::{System, WAIT_FOREVER};

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

static MID_COUNT: AtomicU32 = AtomicU32::new(0);
static L_EFF_DURING: AtomicU32 = AtomicU32::new(u32::MAX);
static L_EFF_AFTER: AtomicU32 = AtomicU32::new(u32::MAX);
static H_GOT_MUTEX: AtomicBool = AtomicBool::new(false);
static DONE: AtomicBool = AtomicBool::new(false);

#[test]
fn mutex_priority_inheritance() {
    keel_port_std::boot::<SimSystem>(|| {
        let mutex = Sys::create_mutex().unwrap();

        // Holds the mutex for ~100 ticks while busy-working
        Sys::create_task(
            "l_task",
            3,
            STACK,
            fallible::<SimSystem>(move || {
                Sys::lock_mutex(mutex, WAIT_FOREVER).unwrap();
                let release_at = Sys::tick_count() + 100;
                while Sys::tick_count() < release_at {
                    Sys::yield_now();
                }
                Sys::unlock_mutex(mutex).unwrap();
                loop {
                    Sys::yield_now();
                }
            }),
        )
        .unwrap();

        // Busy work that should be starved while the holder is boosted
        Sys::create_task(
            "m_task",
            5,
            STACK,
            fallible::<SimSystem>(|| {
                Sys::delay(5).unwrap();
                loop {
                    let now = Sys::tick_count();
                    if (20..=90).contains(&now) {
                        MID_COUNT.fetch_add(1, Ordering::SeqCst);
                    }
                    Sys::yield_now();
                }
            }),
        )
        .unwrap();

        // Contends for the mutex after 10 ticks
        Sys::create_task(
            "h_task",
            8,
            STACK,
            fallible::<SimSystem>(move || {
                Sys::delay(10).unwrap();
                Sys::lock_mutex(mutex, 200).unwrap();
                H_GOT_MUTEX.store(true, Ordering::SeqCst);
                Sys::unlock_mutex(mutex).unwrap();
                loop {
                    Sys::yield_now();
                }
            }),
        )
        .unwrap();

        Sys::create_task(
            "observer",
            9,
            STACK,
            fallible::<SimSystem>(|| {
                Sys::delay(50).unwrap();
                let l_task = Sys::find_task_by_name("l_task").unwrap();
                L_EFF_DURING.store(
                    Sys::task_effective_priority(l_task).unwrap().into(),
                    Ordering::SeqCst,
                );

                Sys::delay(100).unwrap();
                L_EFF_AFTER.store(
                    Sys::task_effective_priority(l_task).unwrap().into(),
                    Ordering::SeqCst,
                );
                DONE.store(true, Ordering::SeqCst);
                keel_port_std::shutdown::<SimSystem>();
            }),
        )
        .unwrap();
    });

    assert!(DONE.load(Ordering::SeqCst));
    assert!(H_GOT_MUTEX.load(Ordering::SeqCst));
    // At t=50 the holder is boosted to the waiter's priority...
    assert_eq!(L_EFF_DURING.load(Ordering::SeqCst), 8);
    // ...and drops back to its base priority on release
    assert_eq!(L_EFF_AFTER.load(Ordering::SeqCst), 3);
    // The middle-priority task accumulated essentially no time meanwhile
    assert!(MID_COUNT.load(Ordering::SeqCst) <= 2);
}
