//! `abort_delay` forcibly ends another task's sleep with a distinguished
//! status.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use keel_kernel::{error::SleepError, System, WAIT_FOREVER};

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

static ELAPSED: AtomicU32 = AtomicU32::new(0);
static ABORTED: AtomicBool = AtomicBool::new(false);

#[test]
fn abort_delay_unblocks_early() {
    keel_port_std::boot::<SimSystem>(|| {
        let sleeper = Sys::create_task(
            "sleeper",
            5,
            STACK,
            fallible::<SimSystem>(|| {
                let before = Sys::tick_count();
                let result = Sys::delay(1000);
                ELAPSED.store(Sys::tick_count().wrapping_sub(before), Ordering::SeqCst);
                ABORTED.store(result == Err(SleepError::Aborted), Ordering::SeqCst);
                keel_port_std::shutdown::<SimSystem>();
            }),
        )
        .unwrap();

        Sys::create_task(
            "aborter",
            7,
            STACK,
            fallible::<SimSystem>(move || {
                Sys::delay(50).unwrap();
                Sys::abort_delay(sleeper).unwrap();
                let _ = Sys::delay(WAIT_FOREVER);
            }),
        )
        .unwrap();
    });

    assert!(ABORTED.load(Ordering::SeqCst));
    let elapsed = ELAPSED.load(Ordering::SeqCst);
    assert!(
        (45..=62).contains(&elapsed),
        "sleep was aborted after {elapsed} ticks"
    );
}
