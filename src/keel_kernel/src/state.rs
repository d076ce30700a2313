//! Calling-context checks.
use crate::{error::BadContextError, imask::MaskTokenMut, KernelTraits};

/// If the current context is not a task context, return `Err(BadContext)`.
pub(super) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context may not block, return `Err(BadContext)`. Blocking
/// requires a task context with the scheduler running.
pub(super) fn expect_waitable_context<Traits: KernelTraits>(
    lock: MaskTokenMut<'_, Traits>,
) -> Result<(), BadContextError> {
    if !Traits::is_task_context()
        || Traits::state().sched_suspend_depth.get(&*lock) != 0
        || !Traits::state().started.get(&*lock)
    {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}
