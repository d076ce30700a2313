//! An auto-reload timer fires once per period until stopped.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use keel_kernel::{timer::TimerRef, System, WAIT_FOREVER};

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

static FIRED: AtomicU32 = AtomicU32::new(0);
static PASSED: AtomicBool = AtomicBool::new(false);

fn on_fire(_timer: TimerRef<SimSystem>) {
    FIRED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn auto_reload_timer() {
    keel_port_std::boot::<SimSystem>(|| {
        Sys::create_task(
            "driver",
            5,
            STACK,
            fallible::<SimSystem>(|| {
                let timer = Sys::create_timer("tick20", 20, true, 0, on_fire).unwrap();
                assert!(!Sys::timer_is_active(timer));

                Sys::timer_start(timer, WAIT_FOREVER).unwrap();
                Sys::delay(205).unwrap();
                Sys::timer_stop(timer, WAIT_FOREVER).unwrap();

                // A 20-tick period over 205 ticks must fire 10 times, or 11
                // depending on phase; anything less is a reload arithmetic
                // defect
                let fired = FIRED.load(Ordering::SeqCst);
                assert!((10..=11).contains(&fired), "fired {fired} times in 205 ticks");

                // A stopped timer stays quiet
                Sys::delay(50).unwrap();
                assert_eq!(FIRED.load(Ordering::SeqCst), fired);
                assert!(!Sys::timer_is_active(timer));

                PASSED.store(true, Ordering::SeqCst);
                keel_port_std::shutdown::<SimSystem>();
            }),
        )
        .unwrap();
    });

    assert!(PASSED.load(Ordering::SeqCst));
}
