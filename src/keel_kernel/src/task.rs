//! Tasks and the scheduler core
use alloc::boxed::Box;
use arrayvec::ArrayString;
use core::{
    cell::UnsafeCell,
    fmt,
    mem::{self, MaybeUninit},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    error::{
        AbortDelayError, BadContextOnlyError, CreateError, NoMemoryError, SetTaskPriorityError,
        SleepError, TaskStateError, WaitTimeoutError,
    },
    imask::{self, KernelCell, MaskGuard, MaskTokenMut},
    notify, state, timeout,
    utils::{
        intrusive_list::{self, ListItem},
        mem as kmem,
        truncated_name, Init,
    },
    wait, KernelTraits, PortThreading, Priority, System, UTicks, WAIT_FOREVER,
};

#[doc(hidden)]
pub mod readyqueue;
use self::readyqueue::Queue as _;

/// *Task control block* - the state data of a task.
///
/// Control blocks are either leaked heap allocations (dynamic creation) or
/// caller-supplied statics ([`TaskStorage`]); in both cases the kernel only
/// ever handles `&'static TaskCb`.
#[repr(C)]
pub struct TaskCb<Traits: PortThreading> {
    /// The port's per-task state (saved context, backing-thread handle, ...).
    ///
    /// This is guaranteed to be placed at the beginning of the struct so that
    /// the port's context-switch code can refer to it with a fixed offset.
    pub port_task_state: Traits::PortTaskState,

    /// Links the task into exactly one of: a ready list, a delayed list, the
    /// suspended list, or the terminated list. The key is the absolute wake
    /// tick while the task is delayed.
    pub(crate) state_item: ListItem<Traits, TaskCb<Traits>>,

    /// Links the task into the event list of the synchronization object it is
    /// blocked on, if any, keyed by inverted task priority so that the
    /// highest-priority waiter sorts first. Doubles as the link into the
    /// pending-ready list.
    pub(crate) event_item: ListItem<Traits, TaskCb<Traits>>,

    pub(crate) st: KernelCell<Traits, TaskSt>,

    /// The priority the task was created with or assigned last.
    pub(crate) base_priority: KernelCell<Traits, Priority>,

    /// The priority the scheduler actually uses. Equal to `base_priority`
    /// except while raised by mutex priority inheritance.
    pub(crate) effective_priority: KernelCell<Traits, Priority>,

    /// Critical-section nesting depth of this task.
    pub(crate) critical_nesting: KernelCell<Traits, u32>,

    /// The number of mutexes currently held. Inheritance is undone when this
    /// drops to zero.
    pub(crate) mutexes_held: KernelCell<Traits, u32>,

    /// The wait state of the task.
    pub(crate) wait: wait::TaskWait<Traits>,

    /// The notification mailbox of the task.
    pub(crate) notify: notify::TaskNotify<Traits>,

    /// The entry point, consumed by the port when the task first runs.
    pub(crate) entry: KernelCell<Traits, Option<TaskEntry>>,

    name: ArrayString<32>,
    stack_size: usize,
    statically_allocated: bool,
}

impl<Traits: PortThreading> TaskCb<Traits> {
    /// The task's name, truncated to 32 bytes at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stack size requested at creation, in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// Take the entry point and invoke it. Called by the port in the task's
    /// own execution context, exactly once, with CPU Lock inactive.
    pub fn run_entry(&'static self) {
        let entry = {
            let mut lock = imask::acquire::<Traits>().expect("task started inside CPU Lock");
            self.entry.replace(&mut *lock, None)
        };
        match entry.expect("task entry invoked twice") {
            TaskEntry::Func(func, param) => func(param),
            TaskEntry::Boxed(f) => f(),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("name", &self.name())
            .field("st", &self.st)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("mutexes_held", &self.mutexes_held)
            .finish_non_exhaustive()
    }
}

pub(crate) enum TaskEntry {
    Func(fn(usize), usize),
    Boxed(Box<dyn FnOnce() + Send>),
}

/// An owning-by-convention handle to a task.
///
/// `TaskRef` is `Copy`; the kernel is the unique owner of the underlying
/// control block. Using a handle after the task has been deleted and
/// reclaimed by the idle task is undefined behavior.
pub struct TaskRef<Traits: PortThreading>(&'static TaskCb<Traits>);

impl<Traits: PortThreading> Clone for TaskRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for TaskRef<Traits> {}

impl<Traits: PortThreading> PartialEq for TaskRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}
impl<Traits: PortThreading> Eq for TaskRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for TaskRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskRef({:p} {:?})", self.0 as *const _, self.0.name())
    }
}

impl<Traits: PortThreading> core::ops::Deref for TaskRef<Traits> {
    type Target = TaskCb<Traits>;
    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl<Traits: PortThreading> TaskRef<Traits> {
    pub(crate) fn new(cb: &'static TaskCb<Traits>) -> Self {
        Self(cb)
    }

    /// Get the underlying control block.
    pub fn control_block(self) -> &'static TaskCb<Traits> {
        self.0
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSt {
    Ready,
    Running,
    Waiting,
    Suspended,
    /// Deleted; awaiting reclamation by the idle task.
    Zombie,
}

/// The scheduling state of a task as reported by [`System::task_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    /// Waiting for an event or a timeout.
    Blocked,
    Suspended,
    /// Deleted but not yet reclaimed.
    Deleted,
}

/// Caller-supplied backing memory for a statically allocated task.
///
/// The storage must have static lifetime. It can be reused for another task
/// only after the previous occupant has been deleted *and* the idle task has
/// detached it (observable via [`TaskStorage::is_claimed`]).
#[repr(C)]
pub struct TaskStorage<Traits: PortThreading> {
    cb: UnsafeCell<MaybeUninit<TaskCb<Traits>>>,
    claimed: AtomicBool,
}

// Safety: access to `cb` is serialized by `claimed`
unsafe impl<Traits: PortThreading> Sync for TaskStorage<Traits> {}

impl<Traits: PortThreading> TaskStorage<Traits> {
    pub const fn new() -> Self {
        Self {
            cb: UnsafeCell::new(MaybeUninit::uninit()),
            claimed: AtomicBool::new(false),
        }
    }

    /// Whether the storage currently backs a live (or not-yet-reclaimed)
    /// task.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

impl<Traits: PortThreading> Default for TaskStorage<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

/// Report an allocation failure to the application before surfacing it as an
/// error code.
pub(crate) fn malloc_failed<Traits: KernelTraits>() -> NoMemoryError {
    if let Some(hook) = Traits::MALLOC_FAILED_HOOK {
        hook();
    }
    NoMemoryError::NoMemory
}

/// Task creation and manipulation.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a task executing the given closure.
    ///
    /// The task is made ready immediately and will preempt the caller if it
    /// has a higher priority and the scheduler is running. `priority` must be
    /// in `1..NUM_PRIORITY_LEVELS`; priority `0` is reserved for the idle
    /// task.
    pub fn create_task(
        name: &str,
        priority: Priority,
        stack_size: usize,
        entry: impl FnOnce() + Send + 'static,
    ) -> Result<TaskRef<Traits>, CreateError> {
        let entry: Box<dyn FnOnce() + Send> =
            kmem::try_box(entry).ok_or_else(malloc_failed::<Traits>)?;
        Self::create_task_inner(
            name,
            priority,
            stack_size,
            TaskEntry::Boxed(entry),
            None,
            false,
        )
    }

    /// Create a task executing `func(param)`. Unlike [`Self::create_task`]
    /// this never allocates for the entry point.
    pub fn create_task_raw(
        name: &str,
        priority: Priority,
        stack_size: usize,
        func: fn(usize),
        param: usize,
    ) -> Result<TaskRef<Traits>, CreateError> {
        Self::create_task_inner(
            name,
            priority,
            stack_size,
            TaskEntry::Func(func, param),
            None,
            false,
        )
    }

    /// Create a task backed by caller-supplied storage. The kernel never
    /// frees the control block; the idle task merely detaches it after
    /// deletion.
    pub fn create_task_static(
        storage: &'static TaskStorage<Traits>,
        name: &str,
        priority: Priority,
        stack_size: usize,
        func: fn(usize),
        param: usize,
    ) -> Result<TaskRef<Traits>, CreateError> {
        if storage.claimed.swap(true, Ordering::AcqRel) {
            return Err(CreateError::BadParam);
        }
        Self::create_task_inner(
            name,
            priority,
            stack_size,
            TaskEntry::Func(func, param),
            Some(storage),
            false,
        )
        .map_err(|e| {
            storage.claimed.store(false, Ordering::Release);
            e
        })
    }

    pub(crate) fn create_task_inner(
        name: &str,
        priority: Priority,
        stack_size: usize,
        entry: TaskEntry,
        storage: Option<&'static TaskStorage<Traits>>,
        is_idle: bool,
    ) -> Result<TaskRef<Traits>, CreateError> {
        if !is_idle && (priority == 0 || (priority as usize) >= Traits::NUM_PRIORITY_LEVELS) {
            return Err(CreateError::BadParam);
        }

        let cb = TaskCb {
            port_task_state: Traits::PORT_TASK_STATE_INIT,
            state_item: ListItem::INIT,
            event_item: ListItem::INIT,
            st: KernelCell::new(TaskSt::Ready),
            base_priority: KernelCell::new(priority),
            effective_priority: KernelCell::new(priority),
            critical_nesting: KernelCell::new(0),
            mutexes_held: KernelCell::new(0),
            wait: Init::INIT,
            notify: Init::INIT,
            entry: KernelCell::new(Some(entry)),
            name: truncated_name(name),
            stack_size,
            statically_allocated: storage.is_some(),
        };

        let cb: &'static TaskCb<Traits> = if let Some(storage) = storage {
            // Safety: `claimed` was successfully acquired by the caller, so
            // nothing else is accessing the storage
            unsafe {
                let slot = (*storage.cb.get()).as_mut_ptr();
                slot.write(cb);
                &*slot
            }
        } else {
            Box::leak(kmem::try_box(cb).ok_or_else(malloc_failed::<Traits>)?)
        };

        let mut lock = imask::acquire::<Traits>()?;
        intrusive_list::set_owner(lock.borrow_mut(), &cb.state_item, cb);
        intrusive_list::set_owner(lock.borrow_mut(), &cb.event_item, cb);

        // Safety: CPU Lock active, the task state was never initialized
        unsafe { Traits::initialize_task_state(cb) };

        // Safety: `cb` is not in the ready queue
        unsafe { ready_queue::<Traits>().push_back(lock.borrow_mut(), cb) };

        Traits::state()
            .task_count
            .replace_with(&mut *lock, |x| *x + 1);

        // If the new task has a higher priority, perform a context switch.
        unlock_cpu_and_check_preemption(lock);

        Ok(TaskRef(cb))
    }

    /// Get the currently running task.
    pub fn current_task() -> Result<TaskRef<Traits>, BadContextOnlyError> {
        if !Traits::is_task_context() {
            return Err(BadContextOnlyError::BadContext);
        }
        let mut lock = imask::acquire::<Traits>()?;
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        Ok(task)
    }

    /// Relinquish the processor so that another ready task of the same
    /// priority can run. Has no effect if the current task is the only one at
    /// the highest ready priority.
    pub fn yield_now() {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }

    /// Block the calling task for `ticks` tick periods.
    ///
    /// `delay(0)` yields to equal-priority peers without blocking.
    /// `delay(WAIT_FOREVER)` blocks until [`System::abort_delay`].
    pub fn delay(ticks: UTicks) -> Result<(), SleepError> {
        let mut lock = imask::acquire::<Traits>()?;
        state::expect_waitable_context::<Traits>(lock.borrow_mut())?;

        if ticks == 0 {
            drop(lock);
            Self::yield_now();
            return Ok(());
        }

        match wait::wait(
            lock.borrow_mut(),
            None,
            wait::WaitPayload::Sleep,
            wait::Deadline::from_timeout(ticks),
        ) {
            // A sleep can only end by expiry or abort
            Ok(()) | Err(WaitTimeoutError::Timeout) => Ok(()),
            Err(WaitTimeoutError::Aborted) => Err(SleepError::Aborted),
        }
    }

    /// Block the calling task until the tick count reaches
    /// `*prev_wake + delta`, then store that value back into `*prev_wake`.
    ///
    /// Unlike [`Self::delay`], consecutive calls maintain a fixed cadence:
    /// if one cycle overruns, the next wake time does not drift.
    pub fn delay_until(prev_wake: &mut UTicks, delta: UTicks) -> Result<(), SleepError> {
        if delta == 0 || delta == WAIT_FOREVER {
            return Err(SleepError::BadParam);
        }
        let mut lock = imask::acquire::<Traits>()?;
        state::expect_waitable_context::<Traits>(lock.borrow_mut())?;

        let now = Traits::state().timeout.tick_count(lock.borrow_mut());
        let prev = *prev_wake;
        let wake = prev.wrapping_add(delta);

        // Decide whether the wake time is still in the future, taking the
        // counter wrap into account.
        let should_block = if now < prev {
            // The counter wrapped since the last wake
            wake < prev && wake > now
        } else {
            wake < prev || wake > now
        };
        *prev_wake = wake;

        if !should_block {
            // The deadline has already passed; run immediately to catch up
            return Ok(());
        }

        match wait::wait(
            lock.borrow_mut(),
            None,
            wait::WaitPayload::Sleep,
            wait::Deadline::At(wake),
        ) {
            Ok(()) | Err(WaitTimeoutError::Timeout) => Ok(()),
            Err(WaitTimeoutError::Aborted) => Err(SleepError::Aborted),
        }
    }

    /// Forcibly unblock a task that is delayed or waiting on a
    /// synchronization object. The unblocked call returns
    /// [`ResultCode::Aborted`](crate::ResultCode::Aborted).
    pub fn abort_delay(task: TaskRef<Traits>) -> Result<(), AbortDelayError> {
        let mut lock = imask::acquire::<Traits>()?;

        if *task.st.read(&*lock) != TaskSt::Waiting
            || !wait::has_active_wait(lock.borrow_mut(), &task)
        {
            return Err(AbortDelayError::BadObjectState);
        }

        wait::interrupt_task(
            lock.borrow_mut(),
            &task,
            Err(WaitTimeoutError::Aborted),
        );

        // The task is now awake, check dispatch
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Delete a task. Deleting the calling task never returns.
    ///
    /// The control block of a dynamically created task is reclaimed by the
    /// idle task once the port reports its execution context dead. Mutexes
    /// held by the deleted task remain locked.
    pub fn delete_task(task: TaskRef<Traits>) -> Result<(), TaskStateError> {
        let mut lock = imask::acquire::<Traits>()?;

        let current = Traits::state().running_task(lock.borrow_mut()) == Some(task);

        detach_task(lock.borrow_mut(), &task)?;

        if current {
            mem::forget(lock);
            // Safety: CPU Lock active; the task was detached from scheduling
            unsafe { Traits::exit_and_dispatch(task.0) };
        }

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Terminate the calling task as if it had been deleted.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port when a task's entry function
    /// returns. All data on the task's stack is invalidated.
    pub unsafe fn exit_current_task() -> ! {
        assert!(Traits::is_task_context());

        // If CPU Lock is inactive, activate it.
        let mut lock = unsafe {
            if !Traits::is_cpu_lock_active() {
                Traits::enter_cpu_lock();
            }
            imask::adopt::<Traits>()
        };

        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        detach_task(lock.borrow_mut(), &task).expect("exiting task was not schedulable");

        mem::forget(lock);
        // Safety: CPU Lock active; the task was detached from scheduling
        unsafe { Traits::exit_and_dispatch(task.0) }
    }

    /// Get a task's base priority.
    pub fn task_priority(task: TaskRef<Traits>) -> Result<Priority, SetTaskPriorityError> {
        let lock = imask::acquire::<Traits>()?;
        if *task.st.read(&*lock) == TaskSt::Zombie {
            return Err(SetTaskPriorityError::BadObjectState);
        }
        Ok(task.base_priority.get(&*lock))
    }

    /// Get a task's effective priority, which may be temporarily raised by
    /// mutex priority inheritance.
    pub fn task_effective_priority(
        task: TaskRef<Traits>,
    ) -> Result<Priority, SetTaskPriorityError> {
        let lock = imask::acquire::<Traits>()?;
        if *task.st.read(&*lock) == TaskSt::Zombie {
            return Err(SetTaskPriorityError::BadObjectState);
        }
        Ok(task.effective_priority.get(&*lock))
    }

    /// Change a task's base priority.
    ///
    /// While the task's priority is boosted by inheritance, lowering the base
    /// priority does not lower the effective priority; the new base takes
    /// effect when the boost ends.
    pub fn set_task_priority(
        task: TaskRef<Traits>,
        priority: Priority,
    ) -> Result<(), SetTaskPriorityError> {
        if priority == 0 || (priority as usize) >= Traits::NUM_PRIORITY_LEVELS {
            return Err(SetTaskPriorityError::BadParam);
        }
        let mut lock = imask::acquire::<Traits>()?;

        if *task.st.read(&*lock) == TaskSt::Zombie {
            return Err(SetTaskPriorityError::BadObjectState);
        }

        task.base_priority.replace(&mut *lock, priority);

        let new_effective = if task.mutexes_held.get(&*lock) > 0 {
            // Keep an inheritance boost; only raising above it takes effect
            task.effective_priority.get(&*lock).max(priority)
        } else {
            priority
        };
        change_effective_priority(lock.borrow_mut(), &task, new_effective);

        // The current task may have lowered itself below a ready task, or a
        // ready task may now outrank the current one.
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Remove a task from scheduling until [`Self::resume_task`].
    ///
    /// Suspending a task that is blocked on a timeout or a synchronization
    /// object aborts the wait; the blocked call returns `Aborted` once the
    /// task is resumed.
    pub fn suspend_task(task: TaskRef<Traits>) -> Result<(), TaskStateError> {
        let mut lock = imask::acquire::<Traits>()?;

        let current = Traits::state().running_task(lock.borrow_mut()) == Some(task);

        match *task.st.read(&*lock) {
            TaskSt::Zombie => return Err(TaskStateError::BadObjectState),
            TaskSt::Suspended => return Ok(()),
            TaskSt::Running | TaskSt::Ready => {
                // Safety: the task is in the ready queue
                unsafe { ready_queue::<Traits>().remove(lock.borrow_mut(), task.0) };
            }
            TaskSt::Waiting => {
                wait::cancel_wait(lock.borrow_mut(), &task, Err(WaitTimeoutError::Aborted));
            }
        }

        task.st.replace(&mut *lock, TaskSt::Suspended);
        Traits::state()
            .suspended
            .insert_last(lock.borrow_mut(), &task.0.state_item);

        if current {
            drop(lock);
            // Wait here until someone resumes us
            unsafe { Traits::yield_cpu() };
        }
        Ok(())
    }

    /// Make a suspended task schedulable again.
    pub fn resume_task(task: TaskRef<Traits>) -> Result<(), TaskStateError> {
        let mut lock = imask::acquire::<Traits>()?;
        resume_inner(lock.borrow_mut(), &task)?;
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`Self::resume_task`] callable from interrupt context. Never requests
    /// a context switch; instead `*higher_priority_task_woken` tells the
    /// caller whether it should yield on interrupt exit.
    pub fn resume_task_from_isr(
        task: TaskRef<Traits>,
        higher_priority_task_woken: &mut bool,
    ) -> Result<(), TaskStateError> {
        let mut lock = imask::acquire::<Traits>()?;
        resume_inner(lock.borrow_mut(), &task)?;
        *higher_priority_task_woken |= preemption_needed(lock.borrow_mut());
        Ok(())
    }

    /// Get the scheduling state of a task.
    pub fn task_state(task: TaskRef<Traits>) -> TaskState {
        let Ok(lock) = imask::acquire::<Traits>() else {
            // Inside a critical section the states can't change; read them
            // with the already-active lock.
            let lock = unsafe { imask::adopt::<Traits>() };
            let st = *task.st.read(&*lock);
            mem::forget(lock);
            return TaskState::from(st);
        };
        TaskState::from(*task.st.read(&*lock))
    }

    /// The number of live tasks, including the idle task and the timer
    /// daemon.
    pub fn task_count() -> usize {
        let Ok(lock) = imask::acquire::<Traits>() else {
            let lock = unsafe { imask::adopt::<Traits>() };
            let count = Traits::state().task_count.get(&*lock);
            mem::forget(lock);
            return count;
        };
        Traits::state().task_count.get(&*lock)
    }

    /// The name a task was created with.
    pub fn task_name(task: TaskRef<Traits>) -> &'static str {
        task.0.name()
    }

    /// Find a live task by its name. Returns the first match in an
    /// unspecified order.
    pub fn find_task_by_name(name: &str) -> Option<TaskRef<Traits>> {
        let mut lock = imask::acquire::<Traits>().ok()?;
        let state = Traits::state();

        if let Some(task) = ready_queue::<Traits>().task_by_name(lock.borrow_mut(), name) {
            return Some(TaskRef(task));
        }
        for list in state
            .timeout
            .delayed_lists()
            .iter()
            .chain([&state.suspended])
        {
            let mut cur = list.first_item(lock.borrow_mut());
            while let Some(item) = cur {
                let task = intrusive_list::owner_of(lock.borrow_mut(), item);
                if task.name() == name {
                    return Some(TaskRef(task));
                }
                cur = list.next_item(lock.borrow_mut(), item);
            }
        }
        None
    }

    /// Enter a critical section: mask interrupts up to the kernel's
    /// maximum-syscall priority and increment the calling task's nesting
    /// counter. Reentrant; each call must be balanced by
    /// [`Self::critical_exit`]. Kernel services must not be invoked inside a
    /// critical section.
    pub fn critical_enter() -> Result<(), BadContextOnlyError> {
        if !Traits::is_task_context() {
            return Err(BadContextOnlyError::BadContext);
        }
        let mut lock = if Traits::is_cpu_lock_active() {
            // Nested entry; the outermost level owns the actual interrupt mask
            unsafe { imask::adopt::<Traits>() }
        } else {
            imask::acquire::<Traits>()?
        };
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        task.critical_nesting.replace_with(&mut *lock, |x| *x + 1);
        mem::forget(lock);
        Ok(())
    }

    /// Leave a critical section, restoring the interrupt mask at the
    /// outermost level.
    pub fn critical_exit() -> Result<(), BadContextOnlyError> {
        if !Traits::is_task_context() || !Traits::is_cpu_lock_active() {
            return Err(BadContextOnlyError::BadContext);
        }
        let mut lock = unsafe { imask::adopt::<Traits>() };
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        let nesting = task.critical_nesting.get(&*lock);
        if nesting == 0 {
            mem::forget(lock);
            return Err(BadContextOnlyError::BadContext);
        }
        task.critical_nesting.replace(&mut *lock, nesting - 1);
        if nesting == 1 {
            drop(lock);
        } else {
            mem::forget(lock);
        }
        Ok(())
    }

    /// Suspend scheduling decisions without masking interrupts. Ticks that
    /// elapse meanwhile are accumulated and applied by
    /// [`Self::resume_scheduler`]. Reentrant.
    pub fn suspend_scheduler() -> Result<(), BadContextOnlyError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = imask::acquire::<Traits>()?;
        Traits::state()
            .sched_suspend_depth
            .replace_with(&mut *lock, |x| *x + 1);
        Ok(())
    }

    /// Re-enable scheduling, moving tasks readied meanwhile onto the ready
    /// lists, applying accumulated ticks, and yielding if required.
    pub fn resume_scheduler() -> Result<(), BadContextOnlyError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = imask::acquire::<Traits>()?;
        let state = Traits::state();

        let depth = state.sched_suspend_depth.get(&*lock);
        if depth == 0 {
            return Err(BadContextOnlyError::BadContext);
        }
        state.sched_suspend_depth.replace(&mut *lock, depth - 1);
        if depth > 1 {
            return Ok(());
        }

        // Move tasks that were readied while the scheduler was suspended
        while let Some(task) = state.pending_ready.first_owner(lock.borrow_mut()) {
            task.event_item.unlink(lock.borrow_mut());
            if task.state_item.is_linked(lock.borrow_mut()) {
                task.state_item.unlink(lock.borrow_mut());
            }
            make_ready(lock.borrow_mut(), task);
        }

        // Apply ticks that arrived while scheduling was off
        let pending = state.timeout.take_pended_ticks(lock.borrow_mut());
        let mut want_yield = state.yield_on_resume.replace(&mut *lock, false);
        for _ in 0..pending {
            want_yield |= timeout::increment_tick(lock.borrow_mut());
        }

        if want_yield {
            drop(lock);
            unsafe { Traits::yield_cpu() };
        } else {
            unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Heap interlock for the platform's allocator shims (`__malloc_lock`).
    pub fn heap_lock() {
        let _ = Self::suspend_scheduler();
    }

    /// Heap interlock for the platform's allocator shims (`__malloc_unlock`).
    pub fn heap_unlock() {
        let _ = Self::resume_scheduler();
    }
}

impl From<TaskSt> for TaskState {
    fn from(st: TaskSt) -> Self {
        match st {
            TaskSt::Ready => Self::Ready,
            TaskSt::Running => Self::Running,
            TaskSt::Waiting => Self::Blocked,
            TaskSt::Suspended => Self::Suspended,
            TaskSt::Zombie => Self::Deleted,
        }
    }
}

#[inline]
pub(crate) fn ready_queue<Traits: KernelTraits>() -> &'static Traits::ReadyQueue {
    &Traits::state().ready_queue
}

/// Reclaim one task from the terminated list, if the port reports its
/// execution context dead. Returns whether anything was reclaimed. Called
/// repeatedly by the idle task.
pub(crate) fn reclaim_one_terminated<Traits: KernelTraits>() -> bool {
    let victim = {
        let Ok(mut lock) = imask::acquire::<Traits>() else {
            return false;
        };
        let list = &Traits::state().terminated;
        let mut cur = list.first_item(lock.borrow_mut());
        loop {
            let Some(item) = cur else { break None };
            let task = intrusive_list::owner_of(lock.borrow_mut(), item);
            if Traits::is_task_context_reclaimable(task) {
                item.unlink(lock.borrow_mut());
                break Some(task);
            }
            cur = list.next_item(lock.borrow_mut(), item);
        }
    };

    let Some(task) = victim else {
        return false;
    };

    if task.statically_allocated {
        // Detach the backing storage so the application can reuse it
        let storage = (task as *const TaskCb<Traits>).cast::<TaskStorage<Traits>>();
        // Safety: statically allocated tasks are always created inside a
        // `TaskStorage`, whose first field is the control block
        unsafe { (*storage).claimed.store(false, Ordering::Release) };
    } else {
        // Safety: the control block was leaked in `create_task_inner` and is
        // unreachable from any list or from its (dead) execution context
        unsafe { drop(Box::from_raw((task as *const TaskCb<Traits>).cast_mut())) };
    }
    true
}

/// Transition the task into the Ready state and insert it into the ready
/// queue. The task must not currently be in any list via its `state_item`.
pub(crate) fn make_ready<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    task_cb.st.replace(&mut *lock, TaskSt::Ready);
    // Safety: `task_cb` is not in the ready queue
    unsafe { ready_queue::<Traits>().push_back(lock, task_cb) };
}

/// Remove the task from whatever scheduling structure holds it and mark it a
/// zombie pending reclamation.
fn detach_task<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task: &TaskRef<Traits>,
) -> Result<(), TaskStateError> {
    match *task.st.read(&*lock) {
        TaskSt::Zombie => return Err(TaskStateError::BadObjectState),
        TaskSt::Running | TaskSt::Ready => {
            // Safety: the task is in the ready queue
            unsafe { ready_queue::<Traits>().remove(lock.borrow_mut(), task.0) };
        }
        TaskSt::Waiting => {
            wait::cancel_wait(lock.borrow_mut(), task, Err(WaitTimeoutError::Aborted));
        }
        TaskSt::Suspended => {
            task.0.state_item.unlink(lock.borrow_mut());
        }
    }

    task.st.replace(&mut *lock, TaskSt::Zombie);
    let state = Traits::state();
    state.task_count.replace_with(&mut *lock, |x| *x - 1);
    state
        .terminated
        .insert_last(lock.borrow_mut(), &task.0.state_item);
    Ok(())
}

fn resume_inner<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task: &TaskRef<Traits>,
) -> Result<(), TaskStateError> {
    if *task.st.read(&*lock) != TaskSt::Suspended {
        return Err(TaskStateError::BadObjectState);
    }
    if task.event_item.is_linked(lock.borrow_mut()) {
        // Already sitting on the pending-ready list from an earlier resume
        // issued while the scheduler was suspended
        return Ok(());
    }
    task.0.state_item.unlink(lock.borrow_mut());

    if Traits::state().sched_suspend_depth.get(&*lock) != 0 {
        // The ready lists are off-limits; park the task on the pending-ready
        // list for `resume_scheduler` to pick up
        Traits::state()
            .pending_ready
            .insert_last(lock.borrow_mut(), &task.0.event_item);
        Traits::state().yield_on_resume.replace(&mut *lock, true);
    } else {
        make_ready(lock.borrow_mut(), task.0);
    }
    Ok(())
}

/// Change a task's effective priority, repositioning it in whatever ordered
/// structure currently holds it.
pub(crate) fn change_effective_priority<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    task: &TaskRef<Traits>,
    priority: Priority,
) {
    let old = task.effective_priority.replace(&mut *lock, priority);
    if old == priority {
        return;
    }

    match *task.st.read(&*lock) {
        TaskSt::Running | TaskSt::Ready => unsafe {
            // Safety: the task is in the ready queue, inserted with `old`
            ready_queue::<Traits>().reorder(lock.borrow_mut(), task.0, old, priority);
        },
        TaskSt::Waiting => {
            // Reposition the task in the event list it is blocked on
            wait::reorder_wait_position(lock.borrow_mut(), task);
        }
        TaskSt::Suspended | TaskSt::Zombie => {}
    }
}

/// Whether a ready task outranks the currently running one.
pub(crate) fn preemption_needed<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
) -> bool {
    let state = Traits::state();
    if !state.started.get(&*lock) {
        return false;
    }

    let current_priority = state
        .running_task(lock.borrow_mut())
        .filter(|t| *t.st.read(&*lock) == TaskSt::Running)
        .map(|t| t.effective_priority.get(&*lock));

    match (
        ready_queue::<Traits>().highest_ready(lock.borrow_mut()),
        current_priority,
    ) {
        (Some(top), Some(cur)) => top > cur,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Relinquish CPU Lock. After that, if there's a higher-priority ready task
/// than the current one, call `Port::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: MaskGuard<Traits>,
) {
    let state = Traits::state();
    if state.sched_suspend_depth.get(&*lock) != 0 {
        if preemption_needed(lock.borrow_mut()) {
            state.yield_on_resume.replace(&mut *lock, true);
        }
        return;
    }

    let preempt = preemption_needed(lock.borrow_mut());

    // Relinquish CPU Lock
    drop(lock);

    if preempt {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements `PortToKernel::choose_running_task`.
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
) {
    let state = Traits::state();
    if state.sched_suspend_depth.get(&*lock) != 0 {
        // Scheduling decisions are deferred until `resume_scheduler`
        return;
    }

    let prev = state.running_task(lock.borrow_mut());

    let next = loop {
        let Some(next) = ready_queue::<Traits>().rotate_and_choose(lock.borrow_mut()) else {
            break None;
        };
        if Traits::task_stack_ok(next) {
            break Some(TaskRef(next));
        }

        // The stack guard was tripped; report it and pull the task out of
        // scheduling before it can do more damage
        if let Some(hook) = Traits::STACK_OVERFLOW_HOOK {
            hook(TaskRef(next));
        }
        // Safety: the task was just returned from the ready queue
        unsafe { ready_queue::<Traits>().remove(lock.borrow_mut(), next) };
        next.st.replace(&mut *lock, TaskSt::Zombie);
    };

    if prev == next {
        return;
    }

    if let Some(prev) = prev {
        if *prev.st.read(&*lock) == TaskSt::Running {
            // The task remains in the ready list; it just loses the processor
            prev.st.replace(&mut *lock, TaskSt::Ready);
        }
    }
    if let Some(next) = next {
        next.st.replace(&mut *lock, TaskSt::Running);
    }
    state.running_task_cell().replace(&mut *lock, next);
}

/// Transition the currently running task into the Waiting (or Suspended)
/// state previously recorded in its control block. Returns when the task is
/// scheduled again.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
) {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    loop {
        // Temporarily release CPU Lock while yielding the processor
        // Safety: (1) no CPU-Lock-protected state is touched until it is
        //         re-acquired, (2) CPU Lock is currently active, (3) it is
        //         re-acquired before this function returns
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        unsafe { Traits::enter_cpu_lock() };

        match *task.st.read(&*lock) {
            TaskSt::Running => break,
            TaskSt::Waiting | TaskSt::Suspended => {}
            // Deleted while blocked; the execution context ends here
            TaskSt::Zombie => unsafe { Traits::exit_and_dispatch(task.0) },
            TaskSt::Ready => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{
            drain_terminated, lock_test_cpu, serial_guard, set_running_for_test, TestPort,
        },
        System,
    };

    fn noop(_: usize) {}

    type Sys = System<TestPort>;

    #[test]
    fn create_validates_priority() {
        let _serial = serial_guard();
        assert_eq!(
            Sys::create_task_raw("bad0", 0, 1024, noop, 0).unwrap_err(),
            CreateError::BadParam
        );
        assert_eq!(
            Sys::create_task_raw("bad16", 16, 1024, noop, 0).unwrap_err(),
            CreateError::BadParam
        );
    }

    #[test]
    fn finds_tasks_by_name() {
        let _serial = serial_guard();
        let t = Sys::create_task_raw("lookup_me", 6, 1024, noop, 0).unwrap();

        assert_eq!(Sys::find_task_by_name("lookup_me"), Some(t));
        assert_eq!(Sys::find_task_by_name("no_such_task"), None);

        // Still findable after moving to the suspended list
        Sys::suspend_task(t).unwrap();
        assert_eq!(Sys::find_task_by_name("lookup_me"), Some(t));
        Sys::resume_task(t).unwrap();

        Sys::delete_task(t).unwrap();
        drain_terminated();
    }

    #[test]
    fn suspend_and_resume() {
        let _serial = serial_guard();
        let t = Sys::create_task_raw("susp", 5, 1024, noop, 0).unwrap();

        assert_eq!(Sys::task_state(t), TaskState::Ready);
        Sys::suspend_task(t).unwrap();
        assert_eq!(Sys::task_state(t), TaskState::Suspended);
        // Suspension is idempotent
        Sys::suspend_task(t).unwrap();

        Sys::resume_task(t).unwrap();
        assert_eq!(Sys::task_state(t), TaskState::Ready);
        assert_eq!(
            Sys::resume_task(t).unwrap_err(),
            TaskStateError::BadObjectState
        );

        Sys::delete_task(t).unwrap();
        drain_terminated();
    }

    #[test]
    fn task_count_tracks_live_tasks() {
        let _serial = serial_guard();
        let before = Sys::task_count();
        let a = Sys::create_task_raw("cnt_a", 5, 1024, noop, 0).unwrap();
        let b = Sys::create_task_raw("cnt_b", 5, 1024, noop, 0).unwrap();
        assert_eq!(Sys::task_count(), before + 2);

        Sys::delete_task(a).unwrap();
        assert_eq!(Sys::task_count(), before + 1);
        assert_eq!(
            Sys::delete_task(a).unwrap_err(),
            TaskStateError::BadObjectState
        );
        Sys::delete_task(b).unwrap();
        assert_eq!(Sys::task_count(), before);
        drain_terminated();
    }

    #[test]
    fn base_priority_survives_while_boosted() {
        let _serial = serial_guard();
        let t = Sys::create_task_raw("boosted", 5, 1024, noop, 0).unwrap();

        // Fake an inheritance boost
        {
            let mut lock = lock_test_cpu();
            t.mutexes_held.replace(&mut *lock, 1);
        }
        change_effective_priority(lock_test_cpu().borrow_mut(), &t, 9);

        // Lowering the base priority leaves the boost in place
        Sys::set_task_priority(t, 3).unwrap();
        assert_eq!(Sys::task_priority(t).unwrap(), 3);
        assert_eq!(Sys::task_effective_priority(t).unwrap(), 9);

        // Raising the base priority above the boost takes effect
        Sys::set_task_priority(t, 11).unwrap();
        assert_eq!(Sys::task_effective_priority(t).unwrap(), 11);

        {
            let mut lock = lock_test_cpu();
            t.mutexes_held.replace(&mut *lock, 0);
        }
        Sys::delete_task(t).unwrap();
        drain_terminated();
    }

    #[test]
    fn critical_section_nests() {
        let _serial = serial_guard();
        let t = Sys::create_task_raw("crit", 5, 1024, noop, 0).unwrap();
        set_running_for_test(Some(t));

        assert!(!TestPort::is_cpu_lock_active());
        Sys::critical_enter().unwrap();
        assert!(TestPort::is_cpu_lock_active());
        Sys::critical_enter().unwrap();
        Sys::critical_exit().unwrap();
        // Still inside the outer level
        assert!(TestPort::is_cpu_lock_active());
        Sys::critical_exit().unwrap();
        assert!(!TestPort::is_cpu_lock_active());

        // Unbalanced exit is rejected
        assert!(Sys::critical_exit().is_err());

        set_running_for_test(None);
        Sys::delete_task(t).unwrap();
        drain_terminated();
    }
}
