//! Software timers, dispatched by a daemon task.
//!
//! User-facing timer operations never touch the timer lists themselves; they
//! post commands to the daemon's queue and the daemon applies them in its own
//! context. Active timers sit in one of two lists keyed by their absolute
//! expiry tick, with the same current/overflow split as the delayed-task
//! lists; the daemon switches the lists when it observes the tick counter
//! having wrapped.
//!
//! Callbacks execute in the daemon task's context. They must not block, and
//! any timer command they issue must use a zero timeout (the daemon cannot
//! wait on its own queue).
use alloc::boxed::Box;
use arrayvec::ArrayString;
use core::{
    cell::UnsafeCell,
    fmt,
    mem::{size_of, MaybeUninit},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    error::{CreateError, QueueTransferError, QueueTryTransferError, TimerCommandError},
    imask::{self, KernelCell, MaskTokenMut},
    queue::{self, QueueRef, SendPosition},
    task::{self, TaskEntry, TaskRef},
    utils::{
        intrusive_list::{self, List, ListItem},
        mem as kmem, truncated_name, Init,
    },
    KernelTraits, PortThreading, System, UTicks, WAIT_FOREVER,
};

/// *Timer control block* - the state data of a software timer.
pub struct TimerCb<Traits: PortThreading> {
    /// Links the timer into one of the two timer lists while it is active,
    /// keyed by the absolute expiry tick.
    list_item: ListItem<Traits, TimerCb<Traits>>,

    period: KernelCell<Traits, UTicks>,
    auto_reload: KernelCell<Traits, bool>,

    /// Opaque user data.
    id: KernelCell<Traits, usize>,

    callback: fn(TimerRef<Traits>),

    /// `true` between a processed start command and a stop command (or the
    /// expiry of a one-shot).
    active: KernelCell<Traits, bool>,

    name: ArrayString<32>,
    statically_allocated: bool,
}

impl<Traits: PortThreading> TimerCb<Traits> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("name", &self.name())
            .field("period", &self.period)
            .field("auto_reload", &self.auto_reload)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// A `Copy`able handle to a software timer. Using a handle after
/// [`System::delete_timer`] has been processed by the daemon is undefined
/// behavior.
pub struct TimerRef<Traits: PortThreading>(&'static TimerCb<Traits>);

impl<Traits: PortThreading> Clone for TimerRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for TimerRef<Traits> {}

impl<Traits: PortThreading> PartialEq for TimerRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}
impl<Traits: PortThreading> Eq for TimerRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for TimerRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerRef({:p} {:?})", self.0 as *const _, self.0.name())
    }
}

impl<Traits: PortThreading> core::ops::Deref for TimerRef<Traits> {
    type Target = TimerCb<Traits>;
    fn deref(&self) -> &Self::Target {
        self.0
    }
}

/// Caller-supplied backing memory for a statically allocated timer; see
/// [`crate::task::TaskStorage`].
#[repr(C)]
pub struct TimerStorage<Traits: PortThreading> {
    cb: UnsafeCell<MaybeUninit<TimerCb<Traits>>>,
    claimed: AtomicBool,
}

// Safety: access to `cb` is serialized by `claimed`
unsafe impl<Traits: PortThreading> Sync for TimerStorage<Traits> {}

impl<Traits: PortThreading> TimerStorage<Traits> {
    pub const fn new() -> Self {
        Self {
            cb: UnsafeCell::new(MaybeUninit::uninit()),
            claimed: AtomicBool::new(false),
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

impl<Traits: PortThreading> Default for TimerStorage<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel-global state of the timer service.
pub(crate) struct TimerGlobals<Traits: PortThreading> {
    lists: [List<Traits, TimerCb<Traits>>; 2],

    /// Index of the active (non-overflow) timer list within `lists`.
    active_list: KernelCell<Traits, u8>,

    /// The tick count the daemon sampled last; a smaller current value means
    /// the counter wrapped in between.
    last_sample: KernelCell<Traits, UTicks>,

    /// The daemon's command queue, created by `start_timer_service`.
    cmd_queue: KernelCell<Traits, Option<QueueRef<Traits>>>,

    daemon: KernelCell<Traits, Option<TaskRef<Traits>>>,
}

impl<Traits: PortThreading> Init for TimerGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        lists: [const { List::INIT }; 2],
        active_list: KernelCell::new(0),
        last_sample: KernelCell::new(0),
        cmd_queue: KernelCell::new(None),
        daemon: KernelCell::new(None),
    };
}

impl<Traits: KernelTraits> TimerGlobals<Traits> {
    fn active(&'static self, lock: MaskTokenMut<'_, Traits>) -> &'static List<Traits, TimerCb<Traits>> {
        &self.lists[self.active_list.get(&*lock) as usize]
    }

    fn overflow(
        &'static self,
        lock: MaskTokenMut<'_, Traits>,
    ) -> &'static List<Traits, TimerCb<Traits>> {
        &self.lists[1 - self.active_list.get(&*lock) as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerOp {
    Start,
    Stop,
    Reset,
    ChangePeriod,
    Delete,
}

/// A command posted to the daemon's queue. Sent by value through the
/// command queue's ring buffer.
enum TimerCmd<Traits: PortThreading> {
    Control {
        timer: TimerRef<Traits>,
        op: TimerOp,
        /// The tick count sampled when the command was posted; start/reset
        /// phase is measured from here, not from processing time.
        when: UTicks,
        /// The new period for `ChangePeriod`.
        value: UTicks,
    },
    /// Execute an arbitrary function in the daemon's context.
    CallFunction {
        func: fn(usize, u32),
        arg1: usize,
        arg2: u32,
    },
}

impl<Traits: PortThreading> Clone for TimerCmd<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for TimerCmd<Traits> {}

fn globals<Traits: KernelTraits>() -> &'static TimerGlobals<Traits> {
    &Traits::state().timer
}

fn cmd_queue<Traits: KernelTraits>() -> Result<QueueRef<Traits>, TimerCommandError> {
    let Ok(lock) = imask::acquire::<Traits>() else {
        return Err(TimerCommandError::BadContext);
    };
    globals::<Traits>()
        .cmd_queue
        .get(&*lock)
        .ok_or(TimerCommandError::BadObjectState)
}

fn post<Traits: KernelTraits>(
    cmd: TimerCmd<Traits>,
    timeout: UTicks,
) -> Result<(), TimerCommandError> {
    let queue = cmd_queue::<Traits>()?;
    queue::send_inner(
        queue.0,
        (&cmd as *const TimerCmd<Traits>).cast(),
        SendPosition::Back,
        timeout,
    )
    .map_err(|e| match e {
        QueueTransferError::Timeout => TimerCommandError::Timeout,
        QueueTransferError::Aborted => TimerCommandError::Aborted,
        QueueTransferError::BadContext => TimerCommandError::BadContext,
        QueueTransferError::BadParam => TimerCommandError::BadObjectState,
    })
}

fn post_from_isr<Traits: KernelTraits>(
    cmd: TimerCmd<Traits>,
    higher_priority_task_woken: &mut bool,
) -> Result<(), TimerCommandError> {
    let queue = cmd_queue::<Traits>()?;
    queue::send_from_isr_inner(
        queue.0,
        (&cmd as *const TimerCmd<Traits>).cast(),
        SendPosition::Back,
        higher_priority_task_woken,
    )
    .map_err(|e| match e {
        QueueTryTransferError::WouldBlock => TimerCommandError::Timeout,
        QueueTryTransferError::BadContext => TimerCommandError::BadContext,
        QueueTryTransferError::BadParam => TimerCommandError::BadObjectState,
    })
}

fn control<Traits: KernelTraits>(
    timer: TimerRef<Traits>,
    op: TimerOp,
    value: UTicks,
    timeout: UTicks,
) -> Result<(), TimerCommandError> {
    let when = System::<Traits>::tick_count();
    post(
        TimerCmd::Control {
            timer,
            op,
            when,
            value,
        },
        timeout,
    )
}

fn control_from_isr<Traits: KernelTraits>(
    timer: TimerRef<Traits>,
    op: TimerOp,
    value: UTicks,
    higher_priority_task_woken: &mut bool,
) -> Result<(), TimerCommandError> {
    let when = System::<Traits>::tick_count_from_isr();
    post_from_isr(
        TimerCmd::Control {
            timer,
            op,
            when,
            value,
        },
        higher_priority_task_woken,
    )
}

/// Software timers.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a timer firing `callback` every (auto-reload) or after
    /// (one-shot) `period` ticks once started. The timer is created
    /// inactive.
    pub fn create_timer(
        name: &str,
        period: UTicks,
        auto_reload: bool,
        id: usize,
        callback: fn(TimerRef<Traits>),
    ) -> Result<TimerRef<Traits>, CreateError> {
        if period == 0 || period == WAIT_FOREVER {
            return Err(CreateError::BadParam);
        }
        let cb = new_timer_cb(name, period, auto_reload, id, callback, false);
        let cb = Box::leak(kmem::try_box(cb).ok_or_else(task::malloc_failed::<Traits>)?);
        Ok(TimerRef(cb))
    }

    /// Create a timer backed by caller-supplied storage.
    pub fn create_timer_static(
        storage: &'static TimerStorage<Traits>,
        name: &str,
        period: UTicks,
        auto_reload: bool,
        id: usize,
        callback: fn(TimerRef<Traits>),
    ) -> Result<TimerRef<Traits>, CreateError> {
        if period == 0 || period == WAIT_FOREVER {
            return Err(CreateError::BadParam);
        }
        if storage.claimed.swap(true, Ordering::AcqRel) {
            return Err(CreateError::BadParam);
        }
        // Safety: `claimed` was successfully acquired, so nothing else is
        // accessing the storage
        let cb = unsafe {
            let slot = (*storage.cb.get()).as_mut_ptr();
            slot.write(new_timer_cb(name, period, auto_reload, id, callback, true));
            &*slot
        };
        Ok(TimerRef(cb))
    }

    /// Start the timer, (re)measuring its period from the moment this call
    /// was made. Blocks for up to `timeout` ticks if the command queue is
    /// full.
    pub fn timer_start(timer: TimerRef<Traits>, timeout: UTicks) -> Result<(), TimerCommandError> {
        control(timer, TimerOp::Start, 0, timeout)
    }

    /// Stop the timer. Pending expiry is discarded.
    pub fn timer_stop(timer: TimerRef<Traits>, timeout: UTicks) -> Result<(), TimerCommandError> {
        control(timer, TimerOp::Stop, 0, timeout)
    }

    /// Restart the timer's period from the moment this call was made,
    /// starting it if it was inactive.
    pub fn timer_reset(timer: TimerRef<Traits>, timeout: UTicks) -> Result<(), TimerCommandError> {
        control(timer, TimerOp::Reset, 0, timeout)
    }

    /// Change the timer's period and restart it.
    pub fn timer_change_period(
        timer: TimerRef<Traits>,
        period: UTicks,
        timeout: UTicks,
    ) -> Result<(), TimerCommandError> {
        if period == 0 || period == WAIT_FOREVER {
            return Err(TimerCommandError::BadObjectState);
        }
        control(timer, TimerOp::ChangePeriod, period, timeout)
    }

    /// Delete the timer once the daemon processes the command. Dynamic
    /// timer storage is freed at that point.
    pub fn delete_timer(timer: TimerRef<Traits>, timeout: UTicks) -> Result<(), TimerCommandError> {
        control(timer, TimerOp::Delete, 0, timeout)
    }

    /// [`Self::timer_start`] callable from interrupt context.
    pub fn timer_start_from_isr(
        timer: TimerRef<Traits>,
        higher_priority_task_woken: &mut bool,
    ) -> Result<(), TimerCommandError> {
        control_from_isr(timer, TimerOp::Start, 0, higher_priority_task_woken)
    }

    /// [`Self::timer_stop`] callable from interrupt context.
    pub fn timer_stop_from_isr(
        timer: TimerRef<Traits>,
        higher_priority_task_woken: &mut bool,
    ) -> Result<(), TimerCommandError> {
        control_from_isr(timer, TimerOp::Stop, 0, higher_priority_task_woken)
    }

    /// [`Self::timer_reset`] callable from interrupt context.
    pub fn timer_reset_from_isr(
        timer: TimerRef<Traits>,
        higher_priority_task_woken: &mut bool,
    ) -> Result<(), TimerCommandError> {
        control_from_isr(timer, TimerOp::Reset, 0, higher_priority_task_woken)
    }

    /// Run `func(arg1, arg2)` in the timer daemon's context.
    pub fn pend_function_call(
        func: fn(usize, u32),
        arg1: usize,
        arg2: u32,
        timeout: UTicks,
    ) -> Result<(), TimerCommandError> {
        post::<Traits>(TimerCmd::CallFunction { func, arg1, arg2 }, timeout)
    }

    /// [`Self::pend_function_call`] callable from interrupt context. The
    /// usual way to defer non-trivial interrupt work to task level.
    pub fn pend_function_call_from_isr(
        func: fn(usize, u32),
        arg1: usize,
        arg2: u32,
        higher_priority_task_woken: &mut bool,
    ) -> Result<(), TimerCommandError> {
        post_from_isr::<Traits>(
            TimerCmd::CallFunction { func, arg1, arg2 },
            higher_priority_task_woken,
        )
    }

    /// Whether the timer is active: started and, for a one-shot, not yet
    /// expired. Reflects commands only once the daemon has processed them.
    pub fn timer_is_active(timer: TimerRef<Traits>) -> bool {
        let Ok(lock) = imask::acquire::<Traits>() else {
            let lock = unsafe { imask::adopt::<Traits>() };
            let active = timer.active.get(&*lock);
            core::mem::forget(lock);
            return active;
        };
        timer.active.get(&*lock)
    }

    /// The timer's current period in ticks.
    pub fn timer_period(timer: TimerRef<Traits>) -> UTicks {
        let Ok(lock) = imask::acquire::<Traits>() else {
            let lock = unsafe { imask::adopt::<Traits>() };
            let period = timer.period.get(&*lock);
            core::mem::forget(lock);
            return period;
        };
        timer.period.get(&*lock)
    }

    /// The timer's opaque user datum.
    pub fn timer_id(timer: TimerRef<Traits>) -> usize {
        let Ok(lock) = imask::acquire::<Traits>() else {
            let lock = unsafe { imask::adopt::<Traits>() };
            let id = timer.id.get(&*lock);
            core::mem::forget(lock);
            return id;
        };
        timer.id.get(&*lock)
    }

    /// Replace the timer's opaque user datum.
    pub fn timer_set_id(timer: TimerRef<Traits>, id: usize) {
        if let Ok(mut lock) = imask::acquire::<Traits>() {
            timer.id.replace(&mut *lock, id);
        }
    }

    /// The timer daemon's task handle, once the scheduler has started.
    pub fn timer_daemon_task() -> Option<TaskRef<Traits>> {
        let lock = imask::acquire::<Traits>().ok()?;
        globals::<Traits>().daemon.get(&*lock)
    }
}

fn new_timer_cb<Traits: KernelTraits>(
    name: &str,
    period: UTicks,
    auto_reload: bool,
    id: usize,
    callback: fn(TimerRef<Traits>),
    statically_allocated: bool,
) -> TimerCb<Traits> {
    TimerCb {
        list_item: ListItem::INIT,
        period: KernelCell::new(period),
        auto_reload: KernelCell::new(auto_reload),
        id: KernelCell::new(id),
        callback,
        active: KernelCell::new(false),
        name: truncated_name(name),
        statically_allocated,
    }
}

/// Create the command queue and the daemon task. Called once during boot,
/// before the first task is dispatched.
pub(crate) fn start_timer_service<Traits: KernelTraits>() -> Result<(), CreateError> {
    let daemon_priority = Traits::TIMER_DAEMON_PRIORITY;
    if daemon_priority == 0 || (daemon_priority as usize) >= Traits::NUM_PRIORITY_LEVELS {
        return Err(CreateError::BadParam);
    }

    let queue = queue::create_queue_cb::<Traits>(
        queue::QueueKind::Fifo,
        Traits::TIMER_CMD_QUEUE_LEN,
        size_of::<TimerCmd<Traits>>(),
        0,
    )?;

    {
        let mut lock = imask::acquire::<Traits>()?;
        globals::<Traits>().cmd_queue.replace(&mut *lock, Some(queue));
    }

    let daemon = System::<Traits>::create_task_inner(
        "tmr_svc",
        daemon_priority,
        Traits::TIMER_DAEMON_STACK_SIZE,
        TaskEntry::Func(daemon_entry::<Traits>, 0),
        None,
        false,
    )?;

    let mut lock = imask::acquire::<Traits>()?;
    globals::<Traits>().daemon.replace(&mut *lock, Some(daemon));
    Ok(())
}

fn daemon_entry<Traits: KernelTraits>(_: usize) {
    if let Some(hook) = Traits::DAEMON_STARTUP_HOOK {
        hook();
    }

    let queue = cmd_queue::<Traits>().expect("timer service started without a command queue");

    loop {
        process_expired::<Traits>();

        let timeout = {
            let mut lock = imask::acquire::<Traits>().unwrap();
            next_wait_ticks(lock.borrow_mut())
        };

        let mut slot = MaybeUninit::<TimerCmd<Traits>>::uninit();
        match queue::recv_inner(queue.0, slot.as_mut_ptr().cast(), false, timeout) {
            Ok(()) => {
                // Safety: a successful receive filled the slot with a
                // command sent by `post`
                apply_command(unsafe { slot.assume_init() });

                // Drain the backlog before going back to sleep
                loop {
                    let mut slot = MaybeUninit::<TimerCmd<Traits>>::uninit();
                    if queue::recv_inner(queue.0, slot.as_mut_ptr().cast(), false, 0).is_err() {
                        break;
                    }
                    // Safety: see above
                    apply_command(unsafe { slot.assume_init() });
                }
            }
            Err(_) => {
                // Timed out waiting: the head timer is due; handled by the
                // next `process_expired`
            }
        }
    }
}

/// Fire every timer whose expiry has arrived, switching the lists if the
/// tick counter wrapped since the last look.
fn process_expired<Traits: KernelTraits>() {
    loop {
        let fire: Option<TimerRef<Traits>> = {
            let mut lock = imask::acquire::<Traits>().unwrap();
            let g = globals::<Traits>();
            let now = Traits::state().timeout.tick_count(lock.borrow_mut());
            let last = g.last_sample.get(&*lock);

            if now < last {
                // The tick counter wrapped. Everything left on the old
                // active list expired before the wrap; drain it before
                // switching the lists.
                if let Some(item) = g.active(lock.borrow_mut()).first_item(lock.borrow_mut()) {
                    Some(expire_timer(lock.borrow_mut(), item, now))
                } else {
                    g.active_list.replace_with(&mut *lock, |x| 1 - *x);
                    g.last_sample.replace(&mut *lock, now);
                    continue;
                }
            } else {
                g.last_sample.replace(&mut *lock, now);
                match g.active(lock.borrow_mut()).first_item(lock.borrow_mut()) {
                    Some(item) if item.key(lock.borrow_mut()) <= now => {
                        Some(expire_timer(lock.borrow_mut(), item, now))
                    }
                    _ => None,
                }
            }
        };

        match fire {
            Some(timer) => (timer.callback)(timer),
            None => break,
        }
    }
}

/// Unlink the due timer at `item`, reschedule it if auto-reloading, and
/// return it for its callback to be run (outside the critical section).
fn expire_timer<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    item: &'static ListItem<Traits, TimerCb<Traits>>,
    now: UTicks,
) -> TimerRef<Traits> {
    let expiry = item.key(lock.borrow_mut());
    let timer = intrusive_list::owner_of(lock.borrow_mut(), item);
    item.unlink(lock.borrow_mut());

    if timer.auto_reload.get(&*lock) {
        let period = timer.period.get(&*lock);
        insert_timer(lock, timer, expiry, expiry.wrapping_add(period), now);
    } else {
        timer.active.replace(&mut *lock, false);
    }

    TimerRef(timer)
}

/// Link `timer` at `expiry`, which was computed as `base + period`. An
/// expiry that wrapped past `u32::MAX` goes to the overflow list.
fn insert_timer<Traits: KernelTraits>(
    mut lock: MaskTokenMut<'_, Traits>,
    timer: &'static TimerCb<Traits>,
    base: UTicks,
    expiry: UTicks,
    _now: UTicks,
) {
    let g = globals::<Traits>();
    let list = if expiry < base {
        g.overflow(lock.borrow_mut())
    } else {
        g.active(lock.borrow_mut())
    };
    list.insert(lock.borrow_mut(), &timer.list_item, expiry);
}

fn apply_command<Traits: KernelTraits>(cmd: TimerCmd<Traits>) {
    let (timer, op, when, value) = match cmd {
        TimerCmd::CallFunction { func, arg1, arg2 } => {
            func(arg1, arg2);
            return;
        }
        TimerCmd::Control {
            timer,
            op,
            when,
            value,
        } => (timer, op, when, value),
    };

    let mut delete = false;
    {
        let mut lock = imask::acquire::<Traits>().unwrap();
        let now = Traits::state().timeout.tick_count(lock.borrow_mut());

        if timer.list_item.is_linked(lock.borrow_mut()) {
            timer.0.list_item.unlink(lock.borrow_mut());
        }

        match op {
            TimerOp::Start | TimerOp::Reset => {
                let period = timer.period.get(&*lock);
                insert_timer(
                    lock.borrow_mut(),
                    timer.0,
                    when,
                    when.wrapping_add(period),
                    now,
                );
                timer.active.replace(&mut *lock, true);
            }
            TimerOp::ChangePeriod => {
                timer.period.replace(&mut *lock, value);
                insert_timer(
                    lock.borrow_mut(),
                    timer.0,
                    when,
                    when.wrapping_add(value),
                    now,
                );
                timer.active.replace(&mut *lock, true);
            }
            TimerOp::Stop => {
                timer.active.replace(&mut *lock, false);
            }
            TimerOp::Delete => {
                timer.active.replace(&mut *lock, false);
                delete = true;
            }
        }
    }

    if delete {
        if timer.statically_allocated {
            // Detach the backing storage so it can be reused
            let storage = (timer.0 as *const TimerCb<Traits>).cast::<TimerStorage<Traits>>();
            // Safety: statically allocated timers are always created inside
            // a `TimerStorage`, whose first field is the control block
            unsafe { (*storage).claimed.store(false, Ordering::Release) };
        } else {
            // Safety: the control block was leaked in `create_timer` and the
            // daemon is the only context that can still reach it
            unsafe { drop(Box::from_raw((timer.0 as *const TimerCb<Traits>).cast_mut())) };
        }
    }
}

/// How long the daemon may sleep: until the head of the active list, or
/// until the tick counter wraps if only overflow timers exist, or forever.
fn next_wait_ticks<Traits: KernelTraits>(mut lock: MaskTokenMut<'_, Traits>) -> UTicks {
    let g = globals::<Traits>();
    let now = Traits::state().timeout.tick_count(lock.borrow_mut());

    if let Some(key) = g.active(lock.borrow_mut()).first_key(lock.borrow_mut()) {
        if key <= now {
            0
        } else {
            key - now
        }
    } else if !g.overflow(lock.borrow_mut()).is_empty(lock.borrow_mut()) {
        // Sleep until just before the wrap; the switch happens on the next
        // pass
        (u32::MAX - now).min(WAIT_FOREVER - 1).max(1)
    } else {
        WAIT_FOREVER
    }
}
