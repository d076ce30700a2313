//! A task created from caller-supplied storage runs without touching the
//! allocator; its storage stays claimed until reclamation.
use std::sync::atomic::{AtomicBool, Ordering};

use keel_kernel::{System, TaskStorage};

mod common;
use common::STACK;

keel_port_std::use_port!(unsafe struct SimSystem);
keel_kernel::configure_kernel! {
    impl KernelCfg for SimSystem {
        num_priority_levels: 16,
        timer_daemon_priority: 14,
    }
}

type Sys = System<SimSystem>;

static STORAGE: TaskStorage<SimSystem> = TaskStorage::new();
static RAN: AtomicBool = AtomicBool::new(false);

fn body(param: usize) {
    assert_eq!(param, 0xC0FFEE);
    RAN.store(true, Ordering::SeqCst);
    keel_port_std::shutdown::<SimSystem>();
}

#[test]
fn static_task_runs() {
    keel_port_std::boot::<SimSystem>(|| {
        Sys::create_task_static(&STORAGE, "static_task", 5, STACK, body, 0xC0FFEE).unwrap();
        assert!(STORAGE.is_claimed());

        // The storage is busy; a second claim must fail
        assert!(Sys::create_task_static(&STORAGE, "imposter", 5, STACK, body, 0).is_err());
    });

    assert!(RAN.load(Ordering::SeqCst));
}
