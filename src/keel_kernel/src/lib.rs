//! A fixed-priority preemptive real-time microkernel for robotics firmware.
//!
//! The kernel provides preemptive multitasking with round-robin time slicing
//! among equal priorities, message queues, binary/counting semaphores,
//! mutexes with priority inheritance, direct-to-task notifications, software
//! timers, and critical-section primitives, all on a single core.
//!
//! # Structure
//!
//! The kernel is generic over a *system type* (the `Traits` parameter found
//! everywhere) that ties together:
//!
//!  - a **port**, implementing [`PortThreading`] and [`PortTimer`] — the
//!    architecture-specific mechanisms for context switching, interrupt
//!    masking, and the tick source;
//!  - a **configuration**, implementing [`KernelCfg`] — static parameters
//!    such as the number of priority levels and the timer daemon's priority,
//!    plus the kernel-state singleton. [`configure_kernel!`] writes this
//!    implementation for you.
//!
//! Applications call the associated functions of [`System`]`<Traits>`.
//!
//! # Contexts
//!
//! Every operation is callable from a *task context*. Operations with a
//! `_from_isr` suffix are the only ones callable from an *interrupt
//! context*; they never block and report the need for a context switch
//! through an out-parameter instead of performing one. Kernel services must
//! not be called inside a critical section entered with
//! [`System::critical_enter`].
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
mod idle;
mod imask;
pub mod mutex;
pub mod notify;
pub mod queue;
pub mod semaphore;
mod state;
pub mod task;
pub mod timer;
mod timeout;
pub mod utils;
mod wait;

#[cfg(test)]
mod test_utils;

use core::marker::PhantomData;

pub use crate::{
    error::ResultCode,
    mutex::MutexRef,
    notify::NotifyAction,
    queue::QueueRef,
    semaphore::SemaphoreRef,
    task::{TaskRef, TaskState, TaskStorage},
    timer::{TimerRef, TimerStorage},
    utils::Init,
};

/// Unsigned integer type representing a tick count or a duration in ticks.
pub type UTicks = u32;

/// A task priority. Numerically larger values are more urgent; priority `0`
/// is reserved for the idle task.
pub type Priority = u8;

/// Timeout value that blocks indefinitely.
pub const WAIT_FOREVER: UTicks = UTicks::MAX;

/// The hard upper bound on [`KernelCfg::NUM_PRIORITY_LEVELS`], dictated by
/// the one-word ready bitmap.
pub const MAX_PRIORITY_LEVELS: usize = 32;

/// Implemented by a port to provide the thread-management functionality of
/// the target processor.
///
/// # Safety
///
/// The kernel relies on the contracts documented on each method; implementing
/// them incorrectly breaks the kernel's memory safety.
pub unsafe trait PortThreading: Sized + 'static {
    /// Per-task state owned by the port (saved context, backing thread, ...),
    /// stored at the very beginning of each [`task::TaskCb`].
    type PortTaskState: Send + Sync + 'static;

    /// The initial value of [`task::TaskCb::port_task_state`].
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// Hand the processor to the first task chosen by
    /// `PortToKernel::choose_running_task`. Called once at the end of boot
    /// with CPU Lock active; releases it.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel during boot.
    unsafe fn dispatch_first_task() -> !;

    /// Request a context switch: run `PortToKernel::choose_running_task` and
    /// transfer control to the chosen task. On bare-metal ports this pends
    /// the lowest-priority software interrupt; the switch happens when no
    /// other interrupt is active.
    ///
    /// Precondition: CPU Lock inactive.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn yield_cpu();

    /// Discard the calling execution context, which belongs to `task`, and
    /// dispatch the next task. Called with CPU Lock active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel; invalidates everything on the
    /// task's stack.
    unsafe fn exit_and_dispatch(task: &'static task::TaskCb<Self>) -> !;

    /// Activate CPU Lock: mask interrupts up to the kernel's
    /// maximum-syscall priority.
    ///
    /// Precondition: CPU Lock inactive.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn enter_cpu_lock();

    /// Activate CPU Lock, returning `false` instead if the calling context
    /// already holds it.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Deactivate CPU Lock.
    ///
    /// Precondition: CPU Lock active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn leave_cpu_lock();

    /// Prepare the task's port state so that the next dispatch of the task
    /// enters its entry point ([`task::TaskCb::run_entry`]). Called with CPU
    /// Lock active, on creation and never again until the task is deleted.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn initialize_task_state(task: &'static task::TaskCb<Self>);

    /// Whether the calling context holds CPU Lock.
    fn is_cpu_lock_active() -> bool;

    /// Whether the calling context is a task (as opposed to boot or
    /// interrupt) context.
    fn is_task_context() -> bool;

    /// Whether the calling context is an interrupt context.
    fn is_interrupt_context() -> bool;

    /// Stack guard: whether the task's stack is still intact. Checked on
    /// every context switch; a `false` return invokes
    /// [`KernelCfg::STACK_OVERFLOW_HOOK`] and removes the task from
    /// scheduling.
    fn task_stack_ok(_task: &'static task::TaskCb<Self>) -> bool {
        true
    }

    /// Whether a deleted task's execution context has released every
    /// resource the port associates with it, so that the kernel may free the
    /// control block.
    fn is_task_context_reclaimable(_task: &'static task::TaskCb<Self>) -> bool {
        true
    }
}

/// Implemented by a port to provide tick-source control.
///
/// The port must invoke `PortToKernel::timer_tick` at the configured tick
/// frequency from an interrupt context.
///
/// # Safety
///
/// See [`PortThreading`].
pub unsafe trait PortTimer: Sized + 'static {
    /// Stop the tick interrupt for up to `max_ticks` tick periods (tickless
    /// idle). Returns how many ticks were actually skipped; the kernel
    /// applies them in one lump. Ports without this capability return `0`.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, from the idle task.
    unsafe fn try_suppress_ticks(max_ticks: UTicks) -> UTicks {
        let _ = max_ticks;
        0
    }
}

/// Static configuration of a kernel instance. Usually implemented through
/// [`configure_kernel!`].
///
/// # Safety
///
/// `state` must return the same, otherwise-unused instance on every call.
pub unsafe trait KernelCfg: PortThreading + PortTimer + Sized + 'static {
    /// The number of task priority levels, at most
    /// [`MAX_PRIORITY_LEVELS`]. Priorities range over
    /// `0..NUM_PRIORITY_LEVELS`, `0` being the idle task's.
    const NUM_PRIORITY_LEVELS: usize;

    /// The ready-queue type, fixing the priority-level count at the type
    /// level.
    type ReadyQueue: task::readyqueue::Queue<Self>;

    /// Whether a tick rotates equal-priority ready tasks.
    const TIME_SLICING: bool = true;

    /// Whether the idle task attempts to suppress ticks via
    /// [`PortTimer::try_suppress_ticks`].
    const TICKLESS_IDLE: bool = false;

    /// The timer daemon's priority, in `1..NUM_PRIORITY_LEVELS`.
    const TIMER_DAEMON_PRIORITY: Priority;

    /// The depth of the timer daemon's command queue.
    const TIMER_CMD_QUEUE_LEN: usize = 16;

    const TIMER_DAEMON_STACK_SIZE: usize = 64 * 1024;
    const IDLE_TASK_STACK_SIZE: usize = 16 * 1024;

    /// Called by the idle task on every cycle.
    const IDLE_HOOK: Option<fn()> = None;

    /// Called on every tick, from interrupt context, outside the critical
    /// section. Must not block.
    const TICK_HOOK: Option<fn()> = None;

    /// Called once in the timer daemon's context before it starts serving
    /// commands.
    const DAEMON_STARTUP_HOOK: Option<fn()> = None;

    /// Called when a dynamic creation fails for want of memory.
    const MALLOC_FAILED_HOOK: Option<fn()> = None;

    /// Called when the stack guard of a task trips; the task is removed from
    /// scheduling afterwards.
    const STACK_OVERFLOW_HOOK: Option<fn(task::TaskRef<Self>)> = None;

    /// The kernel-state singleton for this system type.
    fn state() -> &'static State<Self>;
}

/// The combination of every trait a system type must implement. Blanket-
/// implemented; never implement this manually.
pub trait KernelTraits: PortThreading + PortTimer + KernelCfg {}
impl<T: PortThreading + PortTimer + KernelCfg> KernelTraits for T {}

/// The global state of one kernel instance. Instantiated by
/// [`configure_kernel!`]; all access goes through [`KernelCfg::state`] and
/// requires CPU Lock.
pub struct State<Traits: KernelCfg> {
    running_task: imask::KernelCell<Traits, Option<task::TaskRef<Traits>>>,

    pub(crate) ready_queue: Traits::ReadyQueue,

    pub(crate) timeout: timeout::TimeoutGlobals<Traits>,

    /// Tasks that are explicitly suspended or blocked without a timeout, via
    /// their `state_item`.
    pub(crate) suspended: utils::intrusive_list::List<Traits, task::TaskCb<Traits>>,

    /// Tasks readied while the scheduler was suspended, via their
    /// `event_item`; drained by `resume_scheduler`.
    pub(crate) pending_ready: utils::intrusive_list::List<Traits, task::TaskCb<Traits>>,

    /// Deleted tasks awaiting reclamation by the idle task, via their
    /// `state_item`.
    pub(crate) terminated: utils::intrusive_list::List<Traits, task::TaskCb<Traits>>,

    /// Scheduler-suspension nesting depth (`suspend_scheduler`).
    pub(crate) sched_suspend_depth: imask::KernelCell<Traits, u32>,

    /// Whether `resume_scheduler` must request a context switch.
    pub(crate) yield_on_resume: imask::KernelCell<Traits, bool>,

    pub(crate) task_count: imask::KernelCell<Traits, usize>,

    /// Becomes `true` right before the first task is dispatched.
    pub(crate) started: imask::KernelCell<Traits, bool>,

    pub(crate) idle_task: imask::KernelCell<Traits, Option<task::TaskRef<Traits>>>,

    pub(crate) timer: timer::TimerGlobals<Traits>,
}

impl<Traits: KernelCfg> State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: Self = Self {
        running_task: imask::KernelCell::new(None),
        ready_queue: <Traits::ReadyQueue as Init>::INIT,
        timeout: Init::INIT,
        suspended: Init::INIT,
        pending_ready: Init::INIT,
        terminated: Init::INIT,
        sched_suspend_depth: imask::KernelCell::new(0),
        yield_on_resume: imask::KernelCell::new(false),
        task_count: imask::KernelCell::new(0),
        started: imask::KernelCell::new(false),
        idle_task: imask::KernelCell::new(None),
        timer: Init::INIT,
    };
}

impl<Traits: KernelTraits> State<Traits> {
    pub(crate) fn running_task(
        &self,
        lock: imask::MaskTokenMut<'_, Traits>,
    ) -> Option<task::TaskRef<Traits>> {
        self.running_task.get(&*lock)
    }

    pub(crate) fn running_task_cell(
        &self,
    ) -> &imask::KernelCell<Traits, Option<task::TaskRef<Traits>>> {
        &self.running_task
    }

    /// Get the task chosen by the last scheduling decision.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active. Only meant to be called by the port while
    /// dispatching.
    pub unsafe fn running_task_unchecked(&self) -> Option<task::TaskRef<Traits>> {
        debug_assert!(Traits::is_cpu_lock_active());
        let lock = unsafe { imask::adopt::<Traits>() };
        let task = self.running_task.get(&*lock);
        core::mem::forget(lock);
        task
    }
}

/// The API surface of a kernel instance: every kernel operation is an
/// associated function of this type.
pub struct System<Traits>(PhantomData<Traits>);

/// The kernel entry points invoked by the port.
pub trait PortToKernel {
    /// Boot the kernel: run the application's setup code (which typically
    /// creates the initial tasks), start the built-in services, and dispatch
    /// the first task.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port, once, with CPU Lock inactive, in
    /// a boot (non-task, non-interrupt) context.
    unsafe fn boot(setup: impl FnOnce()) -> !;

    /// Make a scheduling decision: update the running task according to the
    /// ready queue.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port while dispatching, with CPU Lock
    /// active.
    unsafe fn choose_running_task();

    /// Handle one period of the tick interrupt.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port from an interrupt context, with
    /// CPU Lock inactive.
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot(setup: impl FnOnce()) -> ! {
        setup();

        idle::create_idle_task::<Traits>().expect("failed to create the idle task");
        timer::start_timer_service::<Traits>().expect("failed to start the timer service");

        let mut lock = imask::acquire::<Traits>().expect("CPU Lock held during boot");
        Traits::state().started.replace(&mut *lock, true);
        core::mem::forget(lock);

        // Safety: CPU Lock active, boot context
        unsafe { Traits::dispatch_first_task() }
    }

    unsafe fn choose_running_task() {
        // Safety: the caller holds CPU Lock
        let mut lock = unsafe { imask::adopt::<Traits>() };
        task::choose_next_running_task(lock.borrow_mut());
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }
}

/// Implement [`KernelCfg`] for a system type.
///
/// ```ignore
/// keel_kernel::configure_kernel! {
///     impl KernelCfg for System {
///         num_priority_levels: 16,
///         timer_daemon_priority: 14,
///     }
/// }
/// ```
///
/// The optional fields `time_slicing`, `tickless_idle`,
/// `timer_cmd_queue_len`, `idle_hook`, `tick_hook`, and
/// `stack_overflow_hook` may follow, in this order.
#[macro_export]
macro_rules! configure_kernel {
    (
        impl KernelCfg for $Traits:ty {
            num_priority_levels: $levels:expr,
            timer_daemon_priority: $daemon_priority:expr
            $(, time_slicing: $time_slicing:expr )?
            $(, tickless_idle: $tickless:expr )?
            $(, timer_cmd_queue_len: $cmd_queue_len:expr )?
            $(, idle_hook: $idle_hook:expr )?
            $(, tick_hook: $tick_hook:expr )?
            $(, stack_overflow_hook: $stack_overflow_hook:expr )?
            $(,)?
        }
    ) => {
        unsafe impl $crate::KernelCfg for $Traits {
            const NUM_PRIORITY_LEVELS: usize = $levels;
            type ReadyQueue = $crate::task::readyqueue::BitmapQueue<$Traits, { $levels }>;
            const TIMER_DAEMON_PRIORITY: $crate::Priority = $daemon_priority;
            $( const TIME_SLICING: bool = $time_slicing; )?
            $( const TICKLESS_IDLE: bool = $tickless; )?
            $( const TIMER_CMD_QUEUE_LEN: usize = $cmd_queue_len; )?
            $( const IDLE_HOOK: Option<fn()> = $idle_hook; )?
            $( const TICK_HOOK: Option<fn()> = $tick_hook; )?
            $( const STACK_OVERFLOW_HOOK: Option<fn($crate::TaskRef<$Traits>)> =
                $stack_overflow_hook; )?

            fn state() -> &'static $crate::State<$Traits> {
                static STATE: $crate::State<$Traits> = $crate::State::INIT;
                &STATE
            }
        }
    };
}
