//! Queue ordering and send timeout: a full queue rejects a fourth send after
//! the requested timeout, leaving the contents intact and in order.
use std::sync::atomic::{AtomicBool, Ordering};

use keel_kernel::{error::QueueTransferError, System};

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
fn queue_fifo_with_timeout() {
    keel_port_std::boot::<SimSystem>(|| {
        Sys::create_task(
            "driver",
            5,
            STACK,
            fallible::<SimSystem>(|| {
                let queue = Sys::create_queue(3, 4).unwrap();

                for value in [0xAAu32, 0xBB, 0xCC] {
                    Sys::queue_send(queue, &value.to_le_bytes(), 0).unwrap();
                }

                // No receiver exists; the fourth send must time out
                let before = Sys::tick_count();
                let err = Sys::queue_send(queue, &0xDDu32.to_le_bytes(), 50).unwrap_err();
                let elapsed = Sys::tick_count().wrapping_sub(before);

                assert_eq!(err, QueueTransferError::Timeout);
                assert!(
                    (45..=62).contains(&elapsed),
                    "send timed out after {elapsed} ticks"
                );
                assert_eq!(Sys::queue_len(queue), 3);

                let mut out = [0u8; 4];
                for expected in [0xAAu32, 0xBB, 0xCC] {
                    Sys::queue_recv(queue, &mut out, 10).unwrap();
                    assert_eq!(u32::from_le_bytes(out), expected);
                }

                PASSED.store(true, Ordering::SeqCst);
                keel_port_std::shutdown::<SimSystem>();
            }),
        )
        .unwrap();
    });

    assert!(PASSED.load(Ordering::SeqCst));
}
