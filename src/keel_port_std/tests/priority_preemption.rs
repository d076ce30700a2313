//! A higher-priority task waking from a delay preempts a busy lower-priority
//! task; the value it writes is the one that sticks.
use std::sync::atomic::{AtomicU32, Ordering};

use keel_kernel::System;

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

static VALUE: AtomicU32 = AtomicU32::new(0);
static OBSERVED: AtomicU32 = AtomicU32::new(u32::MAX);

#[test]
fn priority_preemption() {
    keel_port_std::boot::<SimSystem>(|| {
        Sys::create_task(
            "writer_lo",
            5,
            STACK,
            fallible::<SimSystem>(|| {
                VALUE.store(1, Ordering::SeqCst);
                loop {
                    Sys::yield_now();
                }
            }),
        )
        .unwrap();

        Sys::create_task(
            "writer_hi",
            8,
            STACK,
            fallible::<SimSystem>(|| {
                Sys::delay(10).unwrap();
                VALUE.store(2, Ordering::SeqCst);
                let me = Sys::current_task().unwrap();
                let _ = Sys::delete_task(me);
                unreachable!("self-deletion returned");
            }),
        )
        .unwrap();

        Sys::create_task(
            "observer",
            9,
            STACK,
            fallible::<SimSystem>(|| {
                Sys::delay(25).unwrap();
                OBSERVED.store(VALUE.load(Ordering::SeqCst), Ordering::SeqCst);
                keel_port_std::shutdown::<SimSystem>();
            }),
        )
        .unwrap();
    });

    assert_eq!(OBSERVED.load(Ordering::SeqCst), 2);
}
