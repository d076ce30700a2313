//! A send from interrupt context wakes a blocked receiver and reports the
//! need for a context switch through the out-parameter.
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

static RECEIVED: AtomicU32 = AtomicU32::new(0);
static WOKEN: AtomicBool = AtomicBool::new(false);

#[test]
fn queue_send_from_interrupt_context() {
    keel_port_std::boot::<SimSystem>(|| {
        let queue = Sys::create_queue(4, 4).unwrap();

        Sys::create_task(
            "rx",
            6,
            STACK,
            fallible::<SimSystem>(move || {
                let mut out = [0u8; 4];
                Sys::queue_recv(queue, &mut out, WAIT_FOREVER).unwrap();
                RECEIVED.store(u32::from_le_bytes(out), Ordering::SeqCst);
                keel_port_std::shutdown::<SimSystem>();
            }),
        )
        .unwrap();

        Sys::create_task(
            "trigger",
            4,
            STACK,
            fallible::<SimSystem>(move || {
                Sys::delay(5).unwrap();
                keel_port_std::queue_interrupt::<SimSystem>(move || {
                    let mut woken = false;
                    Sys::queue_send_from_isr(queue, &0x5Au32.to_le_bytes(), &mut woken)
                        .unwrap();
                    WOKEN.store(woken, Ordering::SeqCst);
                    if woken {
                        // What a real interrupt handler would do on exit
                        Sys::yield_now();
                    }
                });
                let _ = Sys::delay(WAIT_FOREVER);
            }),
        )
        .unwrap();
    });

    assert_eq!(RECEIVED.load(Ordering::SeqCst), 0x5A);
    assert!(WOKEN.load(Ordering::SeqCst));
}
