//! Helpers shared by the kernel integration tests.
use std::panic::{catch_unwind, AssertUnwindSafe};

/// The stack size given to every test task.
pub const STACK: usize = 64 * 1024;

/// Wrap a task body so that a panicking assertion shuts the simulated system
/// down (failing the test's final checks) instead of hanging it forever.
pub fn fallible<System: keel_port_std::PortInstance>(
    body: impl FnOnce() + Send + 'static,
) -> impl FnOnce() + Send + 'static {
    move || {
        if catch_unwind(AssertUnwindSafe(body)).is_err() {
            keel_port_std::shutdown::<System>();
        }
    }
}
