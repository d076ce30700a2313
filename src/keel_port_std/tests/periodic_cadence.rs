//! `delay_until` maintains a fixed cadence with no drift in the bookkeeping.
use std::sync::atomic::{AtomicBool, Ordering};

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

static PASSED: AtomicBool = AtomicBool::new(false);

#[test]
fn delay_until_keeps_cadence() {
    keel_port_std::boot::<SimSystem>(|| {
        Sys::create_task(
            "periodic",
            6,
            STACK,
            fallible::<SimSystem>(|| {
                let start = Sys::tick_count();
                let mut wake = start;
                for _ in 0..5 {
                    Sys::delay_until(&mut wake, 10).unwrap();
                }

                // The wake-time bookkeeping is exact even if a cycle ran late
                assert_eq!(wake, start.wrapping_add(50));
                let elapsed = Sys::tick_count().wrapping_sub(start);
                assert!(
                    (50..=60).contains(&elapsed),
                    "five 10-tick periods took {elapsed} ticks"
                );

                PASSED.store(true, Ordering::SeqCst);
                keel_port_std::shutdown::<SimSystem>();
            }),
        )
        .unwrap();
    });

    assert!(PASSED.load(Ordering::SeqCst));
}
