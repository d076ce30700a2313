//! Simulation environment for running the keel kernel in a hosted process.
//!
//! Every task is backed by an OS thread, but at most one task thread is
//! allowed to make progress through the kernel at any moment: the port's
//! scheduler state tracks which thread backs the kernel's notion of the
//! running task, and every other task thread parks at its next *dispatching
//! point* (a kernel entry or a yield). The tick interrupt and
//! test-injected interrupts run on a dedicated interrupt-dispatcher thread,
//! serialized against the kernel by the simulated CPU Lock.
//!
//! # Fidelity
//!
//! Kernel-visible state transitions are exact. The one approximation is
//! preemption of *pure user code*: a task that never calls the kernel keeps
//! its host thread physically running until its next dispatching point, even
//! though the kernel has already scheduled another task. Tests that busy-wait
//! should call [`keel_kernel::System::yield_now`] inside the loop.
//!
//! # Lifecycle
//!
//! [`boot`] starts the simulated system and returns once [`shutdown`] is
//! called. Task threads still alive at that point are abandoned (they park
//! forever); a simulated system cannot be restarted within the same process.
use once_cell::sync::OnceCell;
use slab::Slab;
use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Condvar, Mutex, MutexGuard,
    },
    thread,
};

use keel_kernel::{task::TaskCb, KernelTraits, PortThreading, PortToKernel, TaskRef};

/// Used by `use_port!`
#[doc(hidden)]
pub use env_logger;
/// Used by `use_port!`
#[doc(hidden)]
pub use keel_kernel;

/// The simulated tick period.
pub const TICK_PERIOD: std::time::Duration = std::time::Duration::from_millis(1);

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortTaskState = TaskState>
{
    fn port_state() -> &'static State;
}

/// Sentinel for "CPU Lock not held".
const NO_THREAD: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Boot,
    Interrupt,
    Task,
}

struct ThreadInfo {
    role: ThreadRole,
    /// The backing task was deleted or exited; the thread must never run
    /// kernel or user code again.
    defunct: bool,
}

struct PortCore {
    threads: Slab<ThreadInfo>,
    /// The thread backing the kernel's running task.
    running: Option<usize>,
    /// Becomes `true` when the first task is dispatched.
    started: bool,
    shutdown: bool,
}

struct Shared {
    core: Mutex<PortCore>,
    cv: Condvar,
    /// The thread key of the CPU Lock holder, or [`NO_THREAD`]. Written only
    /// with `core` held; read lock-free by `is_cpu_lock_active`.
    cpu_lock_owner: AtomicUsize,
}

enum IrqRequest {
    Tick,
    Call(Box<dyn FnOnce() + Send>),
}

/// The internal state of the port.
#[doc(hidden)]
pub struct State {
    shared: OnceCell<Shared>,
    irq_send: Mutex<Option<mpsc::Sender<IrqRequest>>>,
}

/// The port's per-task state: which host thread (if any) backs the task.
#[derive(Debug)]
pub struct TaskState {
    tsm: Mutex<Tsm>,
}

/// Task state machine
///
/// These don't exactly align with the task states defined in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tsm {
    /// No execution context. The kernel has to call `initialize_task_state`
    /// before this task can be dispatched.
    Uninit,
    /// Ready to run but no host thread has been spawned yet.
    Dormant,
    /// Backed by the host thread with the given key.
    Running(usize),
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: Mutex::new(Tsm::Uninit),
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    /// The slab key of the current thread, if it is managed by the port.
    static THREAD_KEY: Cell<Option<usize>> = const { Cell::new(None) };
}

fn current_thread_key() -> usize {
    THREAD_KEY
        .with(Cell::get)
        .expect("not a port-managed thread")
}

fn park_forever() -> ! {
    loop {
        thread::park();
    }
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            shared: OnceCell::new(),
            irq_send: Mutex::new(None),
        }
    }

    fn shared(&self) -> &Shared {
        self.shared.get().expect("the port has not booted")
    }

    pub unsafe fn enter_cpu_lock(&self) {
        let me = current_thread_key();
        let sh = self.shared();
        let mut core = sh.core.lock().unwrap();
        while sh.cpu_lock_owner.load(Ordering::SeqCst) != NO_THREAD {
            core = sh.cv.wait(core).unwrap();
        }
        sh.cpu_lock_owner.store(me, Ordering::SeqCst);
        drop(core);
    }

    pub unsafe fn try_enter_cpu_lock(&self) -> bool {
        let me = current_thread_key();
        let sh = self.shared();
        let mut core = sh.core.lock().unwrap();
        loop {
            if sh.cpu_lock_owner.load(Ordering::SeqCst) == me {
                // The calling context already holds CPU Lock (it is inside a
                // critical section)
                return false;
            }

            let info = &core.threads[me];
            if info.role == ThreadRole::Task && (info.defunct || core.shutdown) {
                drop(core);
                park_forever();
            }

            // A task thread may enter the kernel only while it backs the
            // running task; this is where preemption takes effect
            let gated = info.role == ThreadRole::Task
                && core.started
                && core.running != Some(me);

            if sh.cpu_lock_owner.load(Ordering::SeqCst) == NO_THREAD && !gated {
                sh.cpu_lock_owner.store(me, Ordering::SeqCst);
                return true;
            }

            core = sh.cv.wait(core).unwrap();
        }
    }

    pub unsafe fn leave_cpu_lock(&self) {
        let sh = self.shared();
        let _core = sh.core.lock().unwrap();
        debug_assert_eq!(
            sh.cpu_lock_owner.load(Ordering::SeqCst),
            current_thread_key()
        );
        sh.cpu_lock_owner.store(NO_THREAD, Ordering::SeqCst);
        sh.cv.notify_all();
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        let me = THREAD_KEY.with(Cell::get);
        match me {
            Some(me) => self.shared().cpu_lock_owner.load(Ordering::SeqCst) == me,
            None => false,
        }
    }

    pub fn is_task_context(&self) -> bool {
        self.role() == Some(ThreadRole::Task)
    }

    pub fn is_interrupt_context(&self) -> bool {
        self.role() == Some(ThreadRole::Interrupt)
    }

    fn role(&self) -> Option<ThreadRole> {
        let me = THREAD_KEY.with(Cell::get)?;
        let core = self.shared().core.lock().unwrap();
        Some(core.threads[me].role)
    }

    pub unsafe fn yield_cpu<System: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        let me = current_thread_key();
        let sh = self.shared();
        let mut core = sh.core.lock().unwrap();

        // The context-switch interrupt fires once interrupts are unmasked
        while sh.cpu_lock_owner.load(Ordering::SeqCst) != NO_THREAD {
            core = sh.cv.wait(core).unwrap();
        }
        sh.cpu_lock_owner.store(me, Ordering::SeqCst);

        self.dispatch::<System>(&mut core);

        sh.cpu_lock_owner.store(NO_THREAD, Ordering::SeqCst);
        sh.cv.notify_all();

        // A task thread that lost the processor stops here until it is
        // scheduled again
        if core.threads[me].role == ThreadRole::Task {
            while core.running != Some(me) {
                if core.shutdown || core.threads[me].defunct {
                    drop(core);
                    park_forever();
                }
                core = sh.cv.wait(core).unwrap();
            }
        }
    }

    /// Run the kernel's scheduling decision and retarget `running` to the
    /// chosen task's backing thread, spawning it on first dispatch.
    ///
    /// Precondition: CPU Lock held by the calling thread, `core` locked.
    fn dispatch<System: PortInstance>(&'static self, core: &mut PortCore) {
        // Safety: CPU Lock active
        unsafe { System::choose_running_task() };
        let next = unsafe { System::state().running_task_unchecked() };

        let next_key = next.map(|task| self.resolve_task_thread::<System>(core, task));
        core.running = next_key;
        log::trace!("dispatch -> {:?}", core.running);
    }

    fn resolve_task_thread<System: PortInstance>(
        &'static self,
        core: &mut PortCore,
        task: TaskRef<System>,
    ) -> usize {
        let mut tsm = task.port_task_state.tsm.lock().unwrap();
        match *tsm {
            Tsm::Running(key) => key,
            Tsm::Dormant => {
                let key = core.threads.insert(ThreadInfo {
                    role: ThreadRole::Task,
                    defunct: false,
                });
                *tsm = Tsm::Running(key);

                let cb = task.control_block();
                log::debug!("spawning a thread for task {:?} (key {})", cb.name(), key);
                thread::Builder::new()
                    .name(cb.name().to_owned())
                    .stack_size(cb.stack_size().max(128 * 1024))
                    .spawn(move || Self::task_thread_entry::<System>(key, cb))
                    .expect("failed to spawn a task thread");
                key
            }
            Tsm::Uninit => unreachable!("dispatching a task with no initialized context"),
        }
    }

    fn task_thread_entry<System: PortInstance>(key: usize, task: &'static TaskCb<System>) {
        THREAD_KEY.with(|k| k.set(Some(key)));
        let sh = System::port_state().shared();

        // Wait to be scheduled for the first time
        {
            let mut core = sh.core.lock().unwrap();
            while core.running != Some(key) {
                if core.shutdown || core.threads[key].defunct {
                    drop(core);
                    park_forever();
                }
                core = sh.cv.wait(core).unwrap();
            }
        }

        log::debug!("task {:?} is now running", task.name());
        task.run_entry();

        // Safety: returning from the entry function terminates the task
        unsafe { keel_kernel::System::<System>::exit_current_task() }
    }

    pub unsafe fn exit_and_dispatch<System: PortInstance>(
        &'static self,
        task: &'static TaskCb<System>,
    ) -> ! {
        log::trace!("exit_and_dispatch({:?})", task.name());
        let me = current_thread_key();
        let sh = self.shared();
        let mut core = sh.core.lock().unwrap();
        debug_assert_eq!(sh.cpu_lock_owner.load(Ordering::SeqCst), me);

        core.threads[me].defunct = true;

        // Dissociate the thread from the control block so the kernel may
        // reclaim it; this thread never touches `task` again
        *task.port_task_state.tsm.lock().unwrap() = Tsm::Uninit;

        self.dispatch::<System>(&mut core);

        sh.cpu_lock_owner.store(NO_THREAD, Ordering::SeqCst);
        sh.cv.notify_all();
        drop(core);

        park_forever()
    }

    pub unsafe fn dispatch_first_task<System: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        let me = current_thread_key();
        let sh = self.shared();
        let mut core = sh.core.lock().unwrap();
        debug_assert_eq!(sh.cpu_lock_owner.load(Ordering::SeqCst), me);

        core.started = true;
        self.dispatch::<System>(&mut core);

        sh.cpu_lock_owner.store(NO_THREAD, Ordering::SeqCst);
        sh.cv.notify_all();
        drop(core);

        // The boot context is never resumed
        park_forever()
    }

    pub unsafe fn initialize_task_state<System: PortInstance>(
        &self,
        task: &'static TaskCb<System>,
    ) {
        let mut tsm = task.port_task_state.tsm.lock().unwrap();
        match *tsm {
            Tsm::Uninit => *tsm = Tsm::Dormant,
            Tsm::Dormant => {}
            Tsm::Running(_) => {
                // The kernel initializes a task only while it has no live
                // context
                unreachable!("initializing a task that still has a live thread")
            }
        }
    }

    pub fn is_task_context_reclaimable<System: PortInstance>(
        &self,
        task: &'static TaskCb<System>,
    ) -> bool {
        !matches!(*task.port_task_state.tsm.lock().unwrap(), Tsm::Running(_))
    }

    fn register_thread(&self, role: ThreadRole) -> usize {
        let mut core = self.shared().core.lock().unwrap();
        core.threads.insert(ThreadInfo {
            role,
            defunct: false,
        })
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Boot the simulated system: start the tick source and the interrupt
/// dispatcher, run `setup` in a boot context (create the initial tasks
/// there), and schedule until [`shutdown`] is called.
pub fn boot<System: PortInstance>(setup: impl FnOnce() + Send + 'static) {
    let _ = env_logger::builder().is_test(true).try_init();

    let state = System::port_state();
    state
        .shared
        .set(Shared {
            core: Mutex::new(PortCore {
                threads: Slab::new(),
                running: None,
                started: false,
                shutdown: false,
            }),
            cv: Condvar::new(),
            cpu_lock_owner: AtomicUsize::new(NO_THREAD),
        })
        .ok()
        .expect("a simulated system can only boot once per process");

    let (irq_send, irq_recv) = mpsc::channel();
    *state.irq_send.lock().unwrap() = Some(irq_send.clone());

    // The interrupt-dispatcher thread: every simulated interrupt handler
    // runs here, in interrupt context
    let irq_key = state.register_thread(ThreadRole::Interrupt);
    let irq_join = thread::Builder::new()
        .name("interrupt-dispatcher".to_owned())
        .spawn(move || {
            THREAD_KEY.with(|k| k.set(Some(irq_key)));
            for request in irq_recv.iter() {
                if System::port_state().shared().core.lock().unwrap().shutdown {
                    break;
                }
                match request {
                    // Safety: CPU Lock inactive, interrupt context
                    IrqRequest::Tick => unsafe { System::timer_tick() },
                    IrqRequest::Call(f) => f(),
                }
            }
            log::trace!("interrupt dispatcher stopped");
        })
        .unwrap();

    // The tick source
    let ticker_join = thread::Builder::new()
        .name("ticker".to_owned())
        .spawn(move || loop {
            thread::sleep(TICK_PERIOD);
            if System::port_state().shared().core.lock().unwrap().shutdown {
                break;
            }
            if irq_send.send(IrqRequest::Tick).is_err() {
                break;
            }
        })
        .unwrap();

    // The boot context runs the kernel's startup path and becomes the first
    // dispatch; it is never resumed afterwards
    let boot_key = state.register_thread(ThreadRole::Boot);
    thread::Builder::new()
        .name("boot".to_owned())
        .spawn(move || {
            THREAD_KEY.with(|k| k.set(Some(boot_key)));
            // Safety: boot context, CPU Lock inactive, called once
            unsafe { System::boot(setup) }
        })
        .unwrap();

    // Wait for the simulated system to shut down
    {
        let sh = state.shared();
        let mut core = sh.core.lock().unwrap();
        while !core.shutdown {
            core = sh.cv.wait(core).unwrap();
        }
    }

    *state.irq_send.lock().unwrap() = None;
    ticker_join.join().unwrap();
    irq_join.join().unwrap();
}

/// Initiate shutdown. Callable from any context; [`boot`] returns once the
/// service threads have stopped. Task threads are abandoned.
pub fn shutdown<System: PortInstance>() {
    let sh = System::port_state().shared();
    let mut core = sh.core.lock().unwrap();
    core.shutdown = true;
    sh.cv.notify_all();
}

/// Run `handler` on the interrupt-dispatcher thread, in interrupt context.
/// Use this to exercise `_from_isr` APIs.
pub fn queue_interrupt<System: PortInstance>(handler: impl FnOnce() + Send + 'static) {
    let send = System::port_state().irq_send.lock().unwrap();
    send.as_ref()
        .expect("the port has not booted")
        .send(IrqRequest::Call(Box::new(handler)))
        .expect("the interrupt dispatcher has stopped");
}

/// Instantiate the port for a system type.
///
/// ```ignore
/// keel_port_std::use_port!(unsafe struct System);
/// keel_kernel::configure_kernel! {
///     impl KernelCfg for System { /* ... */ }
/// }
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe struct $sys:ident) => {
        pub struct $sys;

        mod port_std_impl {
            use super::$sys;
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $sys {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$sys: KernelCfg`
            unsafe impl $crate::keel_kernel::PortThreading for $sys {
                type PortTaskState = TaskState;
                const PORT_TASK_STATE_INIT: TaskState = TaskState::new();

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.dispatch_first_task::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(
                    task: &'static $crate::keel_kernel::task::TaskCb<Self>,
                ) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(task) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock() }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                unsafe fn initialize_task_state(
                    task: &'static $crate::keel_kernel::task::TaskCb<Self>,
                ) {
                    unsafe { PORT_STATE.initialize_task_state::<Self>(task) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }

                fn is_task_context_reclaimable(
                    task: &'static $crate::keel_kernel::task::TaskCb<Self>,
                ) -> bool {
                    PORT_STATE.is_task_context_reclaimable::<Self>(task)
                }
            }

            unsafe impl $crate::keel_kernel::PortTimer for $sys {}
        }
    };
}
