//! The queue primitive: a fixed-capacity ring of fixed-size items with
//! blocking send/receive. Semaphores and mutexes are thin layers over the
//! same control block (`count` becomes the permit count, the storage is
//! absent, and mutex kinds track an owning task instead).
//!
//! A wake-upper always completes the woken task's transfer itself, inside the
//! same critical section: a send copies straight into a blocked receiver's
//! buffer, a receive pulls a blocked sender's item into the slot it just
//! freed. See [`crate::wait`] for the rationale.
use alloc::boxed::Box;
use core::{fmt, ptr::NonNull};

use crate::{
    error::{CreateError, DeleteError, QueueTransferError, QueueTryTransferError},
    imask::{self, KernelCell, MaskTokenMut},
    state, task,
    task::TaskRef,
    utils::mem as kmem,
    wait::{self, Deadline, RecvPtr, SendPtr, WaitPayload, WaitQueue},
    KernelTraits, PortThreading, System, UTicks,
};

/// Where a send places its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendPosition {
    Back,
    Front,
    /// Replace the single item of a capacity-1 queue.
    Overwrite,
}

/// What a queue control block is being used as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueKind {
    Fifo,
    BinarySemaphore,
    CountingSemaphore,
    Mutex { recursive: bool },
}

struct RawBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the buffer is exclusively owned by the queue and only accessed
// under CPU Lock
unsafe impl Send for RawBuf {}
unsafe impl Sync for RawBuf {}

/// *Queue control block* - the state data of a queue, semaphore, or mutex.
pub struct QueueCb<Traits: PortThreading> {
    storage: Option<RawBuf>,
    item_size: usize,
    capacity: usize,

    /// Items present (FIFO), permits available (semaphores), or 1 while
    /// unowned (mutexes).
    pub(crate) count: KernelCell<Traits, usize>,

    /// Ring index of the oldest item. The write position is
    /// `(head + count) % capacity`.
    head: KernelCell<Traits, usize>,

    /// Tasks blocked because the queue was full.
    pub(crate) send_wait: WaitQueue<Traits>,

    /// Tasks blocked because the queue was empty (or the semaphore/mutex was
    /// unavailable).
    pub(crate) recv_wait: WaitQueue<Traits>,

    pub(crate) kind: QueueKind,

    /// The task owning the mutex. Unused for other kinds.
    pub(crate) owner: KernelCell<Traits, Option<TaskRef<Traits>>>,

    /// Recursive-acquisition depth of the mutex. Unused for other kinds.
    pub(crate) recursion: KernelCell<Traits, u32>,
}

impl<Traits: PortThreading> QueueCb<Traits> {
    /// The maximum number of items the queue can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The size of one item, in bytes.
    pub fn item_size(&self) -> usize {
        self.item_size
    }
}

impl<Traits: KernelTraits> fmt::Debug for QueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("self", &(self as *const _))
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("item_size", &self.item_size)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

/// A `Copy`able handle to a queue. Using a handle after
/// [`System::delete_queue`] is undefined behavior.
pub struct QueueRef<Traits: PortThreading>(pub(crate) &'static QueueCb<Traits>);

impl<Traits: PortThreading> Clone for QueueRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for QueueRef<Traits> {}

impl<Traits: PortThreading> PartialEq for QueueRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}
impl<Traits: PortThreading> Eq for QueueRef<Traits> {}

impl<Traits: PortThreading> core::ops::Deref for QueueRef<Traits> {
    type Target = QueueCb<Traits>;
    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl<Traits: KernelTraits> fmt::Debug for QueueRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueRef({:p})", self.0 as *const _)
    }
}

/// Create a queue, semaphore, or mutex control block.
pub(crate) fn create_queue_cb<Traits: KernelTraits>(
    kind: QueueKind,
    capacity: usize,
    item_size: usize,
    initial_count: usize,
) -> Result<QueueRef<Traits>, CreateError> {
    if capacity == 0 || initial_count > capacity {
        return Err(CreateError::BadParam);
    }

    let storage = if item_size > 0 {
        let len = capacity
            .checked_mul(item_size)
            .ok_or(CreateError::BadParam)?;
        let buf = Box::leak(kmem::try_byte_buffer(len).ok_or_else(task::malloc_failed::<Traits>)?);
        Some(RawBuf {
            // Safety: `Box::leak` never returns null
            ptr: unsafe { NonNull::new_unchecked(buf.as_mut_ptr()) },
            len,
        })
    } else {
        None
    };

    let cb = QueueCb {
        storage,
        item_size,
        capacity,
        count: KernelCell::new(initial_count),
        head: KernelCell::new(0),
        send_wait: crate::utils::Init::INIT,
        recv_wait: crate::utils::Init::INIT,
        kind,
        owner: KernelCell::new(None),
        recursion: KernelCell::new(0),
    };

    let cb = Box::leak(kmem::try_box(cb).ok_or_else(task::malloc_failed::<Traits>)?);
    Ok(QueueRef(cb))
}

/// Free a queue control block and its storage.
///
/// The queue must have no blocked tasks; destroying an object that tasks are
/// blocked on is rejected here, but the handle becoming dangling afterwards
/// is the caller's responsibility.
pub(crate) fn delete_queue_cb<Traits: KernelTraits>(
    queue: QueueRef<Traits>,
) -> Result<(), DeleteError> {
    {
        let mut lock = imask::acquire::<Traits>()?;
        if !queue.0.send_wait.is_empty(lock.borrow_mut())
            || !queue.0.recv_wait.is_empty(lock.borrow_mut())
        {
            return Err(DeleteError::BadObjectState);
        }
    }

    let cb: *const QueueCb<Traits> = queue.0;
    // Safety: the control block and its storage were leaked from the global
    // allocator in `create_queue_cb`, and no task can reach them anymore
    unsafe {
        if let Some(buf) = &(*cb).storage {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                buf.ptr.as_ptr(),
                buf.len,
            )));
        }
        drop(Box::from_raw(cb.cast_mut()));
    }
    Ok(())
}

// Ring-buffer primitives. All run under CPU Lock.
// ---------------------------------------------------------------------------

unsafe fn slot_ptr<Traits: PortThreading>(queue: &QueueCb<Traits>, index: usize) -> *mut u8 {
    debug_assert!(index < queue.capacity);
    let buf = queue.storage.as_ref().unwrap();
    // Safety: `index` is within the ring
    unsafe { buf.ptr.as_ptr().add(index * queue.item_size) }
}

fn write_item<Traits: KernelTraits>(
    queue: &'static QueueCb<Traits>,
    mut lock: MaskTokenMut<'_, Traits>,
    src: *const u8,
    position: SendPosition,
) {
    let count = queue.count.get(&*lock);
    let head = queue.head.get(&*lock);

    let index = match position {
        SendPosition::Back => {
            debug_assert!(count < queue.capacity);
            queue.count.replace(&mut *lock, count + 1);
            (head + count) % queue.capacity
        }
        SendPosition::Front => {
            debug_assert!(count < queue.capacity);
            let head = (head + queue.capacity - 1) % queue.capacity;
            queue.head.replace(&mut *lock, head);
            queue.count.replace(&mut *lock, count + 1);
            head
        }
        SendPosition::Overwrite => {
            debug_assert_eq!(queue.capacity, 1);
            queue.count.replace(&mut *lock, 1);
            head
        }
    };

    if queue.item_size != 0 {
        // Safety: `src` points to `item_size` readable bytes; the slot is in
        // bounds and accessed exclusively under CPU Lock
        unsafe { core::ptr::copy_nonoverlapping(src, slot_ptr(queue, index), queue.item_size) };
    }
}

fn read_item<Traits: KernelTraits>(
    queue: &'static QueueCb<Traits>,
    mut lock: MaskTokenMut<'_, Traits>,
    dst: *mut u8,
    peek: bool,
) {
    let count = queue.count.get(&*lock);
    let head = queue.head.get(&*lock);
    debug_assert!(count > 0);

    if queue.item_size != 0 {
        // Safety: see `write_item`
        unsafe { core::ptr::copy_nonoverlapping(slot_ptr(queue, head), dst, queue.item_size) };
    }

    if !peek {
        queue.head.replace(&mut *lock, (head + 1) % queue.capacity);
        queue.count.replace(&mut *lock, count - 1);
    }
}

// Handoff helpers
// ---------------------------------------------------------------------------

/// An item has just become available; serve blocked receivers. Consecutive
/// peekers all observe the item; the first non-peeking receiver consumes it.
fn wake_receivers<Traits: KernelTraits>(
    queue: &'static QueueCb<Traits>,
    mut lock: MaskTokenMut<'_, Traits>,
) {
    while queue.count.get(&*lock) > 0 {
        let Some(waiter) = queue.recv_wait.first_waiting_task(lock.borrow_mut()) else {
            break;
        };
        let payload = wait::complete_wait(lock.borrow_mut(), waiter, Ok(()))
            .expect("waiter on the event list had no active wait");
        match payload {
            WaitPayload::QueueRecv { dst, peek } => {
                read_item(queue, lock.borrow_mut(), dst.0, peek);
                if !peek {
                    break;
                }
            }
            _ => unreachable!("foreign payload on a queue receive wait"),
        }
    }
}

/// A slot has just been freed; pull in the highest-priority blocked sender.
fn wake_one_sender<Traits: KernelTraits>(
    queue: &'static QueueCb<Traits>,
    mut lock: MaskTokenMut<'_, Traits>,
) {
    if queue.count.get(&*lock) >= queue.capacity {
        return;
    }
    let Some(waiter) = queue.send_wait.first_waiting_task(lock.borrow_mut()) else {
        return;
    };
    let payload = wait::complete_wait(lock.borrow_mut(), waiter, Ok(()))
        .expect("waiter on the event list had no active wait");
    match payload {
        WaitPayload::QueueSend { src, position } => {
            write_item(queue, lock.borrow_mut(), src.0, position);
        }
        _ => unreachable!("foreign payload on a queue send wait"),
    }
}

// Core operations shared by the public API and the ISR variants
// ---------------------------------------------------------------------------

/// Try to deposit an item right now. Returns `false` if the queue is full
/// (and the position is not `Overwrite`).
fn poll_send<Traits: KernelTraits>(
    queue: &'static QueueCb<Traits>,
    mut lock: MaskTokenMut<'_, Traits>,
    src: *const u8,
    position: SendPosition,
) -> bool {
    if queue.count.get(&*lock) >= queue.capacity && position != SendPosition::Overwrite {
        return false;
    }
    write_item(queue, lock.borrow_mut(), src, position);
    wake_receivers(queue, lock);
    true
}

/// Try to obtain an item right now. Returns `false` if the queue is empty.
fn poll_recv<Traits: KernelTraits>(
    queue: &'static QueueCb<Traits>,
    mut lock: MaskTokenMut<'_, Traits>,
    dst: *mut u8,
    peek: bool,
) -> bool {
    if queue.count.get(&*lock) == 0 {
        return false;
    }
    read_item(queue, lock.borrow_mut(), dst, peek);
    if peek {
        // The item is still there; other blocked receivers can observe it
        wake_receivers(queue, lock);
    } else {
        wake_one_sender(queue, lock);
    }
    true
}

pub(crate) fn send_inner<Traits: KernelTraits>(
    queue: &'static QueueCb<Traits>,
    src: *const u8,
    position: SendPosition,
    timeout: UTicks,
) -> Result<(), QueueTransferError> {
    let mut lock = imask::acquire::<Traits>()?;

    if poll_send(queue, lock.borrow_mut(), src, position) {
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }
    if timeout == 0 {
        return Err(QueueTransferError::Timeout);
    }
    state::expect_waitable_context::<Traits>(lock.borrow_mut())?;

    // Block; whichever receive frees a slot will deposit our item
    wait::wait(
        lock.borrow_mut(),
        Some(&queue.send_wait),
        WaitPayload::QueueSend {
            src: SendPtr(src),
            position,
        },
        Deadline::from_timeout(timeout),
    )?;
    Ok(())
}

pub(crate) fn recv_inner<Traits: KernelTraits>(
    queue: &'static QueueCb<Traits>,
    dst: *mut u8,
    peek: bool,
    timeout: UTicks,
) -> Result<(), QueueTransferError> {
    let mut lock = imask::acquire::<Traits>()?;

    if poll_recv(queue, lock.borrow_mut(), dst, peek) {
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }
    if timeout == 0 {
        return Err(QueueTransferError::Timeout);
    }
    state::expect_waitable_context::<Traits>(lock.borrow_mut())?;

    // Block; whichever send produces an item will fill our buffer
    wait::wait(
        lock.borrow_mut(),
        Some(&queue.recv_wait),
        WaitPayload::QueueRecv {
            dst: RecvPtr(dst),
            peek,
        },
        Deadline::from_timeout(timeout),
    )?;
    Ok(())
}

fn try_send_inner<Traits: KernelTraits>(
    queue: &'static QueueCb<Traits>,
    src: *const u8,
    position: SendPosition,
) -> Result<(), QueueTryTransferError> {
    let mut lock = imask::acquire::<Traits>()?;
    if poll_send(queue, lock.borrow_mut(), src, position) {
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    } else {
        Err(QueueTryTransferError::WouldBlock)
    }
}

pub(crate) fn send_from_isr_inner<Traits: KernelTraits>(
    queue: &'static QueueCb<Traits>,
    src: *const u8,
    position: SendPosition,
    higher_priority_task_woken: &mut bool,
) -> Result<(), QueueTryTransferError> {
    let mut lock = imask::acquire::<Traits>()?;
    if poll_send(queue, lock.borrow_mut(), src, position) {
        *higher_priority_task_woken |= task::preemption_needed(lock.borrow_mut());
        Ok(())
    } else {
        Err(QueueTryTransferError::WouldBlock)
    }
}

fn check_fifo<Traits: KernelTraits>(
    queue: QueueRef<Traits>,
    item_len: Option<usize>,
) -> Result<(), QueueTryTransferError> {
    if queue.kind != QueueKind::Fifo {
        return Err(QueueTryTransferError::BadParam);
    }
    if let Some(len) = item_len {
        if len != queue.item_size {
            return Err(QueueTryTransferError::BadParam);
        }
    }
    Ok(())
}

/// Message queues.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a queue holding up to `capacity` items of `item_size` bytes.
    pub fn create_queue(
        capacity: usize,
        item_size: usize,
    ) -> Result<QueueRef<Traits>, CreateError> {
        create_queue_cb(QueueKind::Fifo, capacity, item_size, 0)
    }

    /// Delete a queue. Fails with `BadObjectState` if any task is blocked on
    /// it.
    pub fn delete_queue(queue: QueueRef<Traits>) -> Result<(), DeleteError> {
        if queue.kind != QueueKind::Fifo {
            return Err(DeleteError::BadObjectState);
        }
        delete_queue_cb(queue)
    }

    /// Append an item, blocking for up to `timeout` ticks while the queue is
    /// full. `item` must be exactly `item_size` bytes.
    pub fn queue_send(
        queue: QueueRef<Traits>,
        item: &[u8],
        timeout: UTicks,
    ) -> Result<(), QueueTransferError> {
        check_fifo(queue, Some(item.len())).map_err(widen_try_error)?;
        send_inner(queue.0, item.as_ptr(), SendPosition::Back, timeout)
    }

    /// Prepend an item so that it is received before everything already
    /// queued.
    pub fn queue_send_to_front(
        queue: QueueRef<Traits>,
        item: &[u8],
        timeout: UTicks,
    ) -> Result<(), QueueTransferError> {
        check_fifo(queue, Some(item.len())).map_err(widen_try_error)?;
        send_inner(queue.0, item.as_ptr(), SendPosition::Front, timeout)
    }

    /// Replace the contents of a capacity-1 queue. Never blocks.
    pub fn queue_overwrite(
        queue: QueueRef<Traits>,
        item: &[u8],
    ) -> Result<(), QueueTryTransferError> {
        check_fifo(queue, Some(item.len()))?;
        if queue.capacity != 1 {
            return Err(QueueTryTransferError::BadParam);
        }
        try_send_inner(queue.0, item.as_ptr(), SendPosition::Overwrite)
    }

    /// Append an item without blocking.
    pub fn try_queue_send(
        queue: QueueRef<Traits>,
        item: &[u8],
    ) -> Result<(), QueueTryTransferError> {
        check_fifo(queue, Some(item.len()))?;
        try_send_inner(queue.0, item.as_ptr(), SendPosition::Back)
    }

    /// [`Self::try_queue_send`] callable from interrupt context.
    /// `*higher_priority_task_woken` is set if the send unblocked a task
    /// that outranks the interrupted one, in which case the interrupt
    /// handler should yield on exit.
    pub fn queue_send_from_isr(
        queue: QueueRef<Traits>,
        item: &[u8],
        higher_priority_task_woken: &mut bool,
    ) -> Result<(), QueueTryTransferError> {
        check_fifo(queue, Some(item.len()))?;
        send_from_isr_inner(
            queue.0,
            item.as_ptr(),
            SendPosition::Back,
            higher_priority_task_woken,
        )
    }

    /// [`Self::queue_overwrite`] callable from interrupt context.
    pub fn queue_overwrite_from_isr(
        queue: QueueRef<Traits>,
        item: &[u8],
        higher_priority_task_woken: &mut bool,
    ) -> Result<(), QueueTryTransferError> {
        check_fifo(queue, Some(item.len()))?;
        if queue.capacity != 1 {
            return Err(QueueTryTransferError::BadParam);
        }
        send_from_isr_inner(
            queue.0,
            item.as_ptr(),
            SendPosition::Overwrite,
            higher_priority_task_woken,
        )
    }

    /// Receive the oldest item into `out`, blocking for up to `timeout`
    /// ticks while the queue is empty.
    pub fn queue_recv(
        queue: QueueRef<Traits>,
        out: &mut [u8],
        timeout: UTicks,
    ) -> Result<(), QueueTransferError> {
        check_fifo(queue, Some(out.len())).map_err(widen_try_error)?;
        recv_inner(queue.0, out.as_mut_ptr(), false, timeout)
    }

    /// Copy the oldest item into `out` without removing it.
    pub fn queue_peek(
        queue: QueueRef<Traits>,
        out: &mut [u8],
        timeout: UTicks,
    ) -> Result<(), QueueTransferError> {
        check_fifo(queue, Some(out.len())).map_err(widen_try_error)?;
        recv_inner(queue.0, out.as_mut_ptr(), true, timeout)
    }

    /// Receive without blocking.
    pub fn try_queue_recv(
        queue: QueueRef<Traits>,
        out: &mut [u8],
    ) -> Result<(), QueueTryTransferError> {
        check_fifo(queue, Some(out.len()))?;
        let mut lock = imask::acquire::<Traits>()?;
        if poll_recv(queue.0, lock.borrow_mut(), out.as_mut_ptr(), false) {
            task::unlock_cpu_and_check_preemption(lock);
            Ok(())
        } else {
            Err(QueueTryTransferError::WouldBlock)
        }
    }

    /// [`Self::try_queue_recv`] callable from interrupt context.
    pub fn queue_recv_from_isr(
        queue: QueueRef<Traits>,
        out: &mut [u8],
        higher_priority_task_woken: &mut bool,
    ) -> Result<(), QueueTryTransferError> {
        check_fifo(queue, Some(out.len()))?;
        let mut lock = imask::acquire::<Traits>()?;
        if poll_recv(queue.0, lock.borrow_mut(), out.as_mut_ptr(), false) {
            *higher_priority_task_woken |= task::preemption_needed(lock.borrow_mut());
            Ok(())
        } else {
            Err(QueueTryTransferError::WouldBlock)
        }
    }

    /// The number of items currently in the queue.
    pub fn queue_len(queue: QueueRef<Traits>) -> usize {
        let Ok(lock) = imask::acquire::<Traits>() else {
            let lock = unsafe { imask::adopt::<Traits>() };
            let count = queue.count.get(&*lock);
            core::mem::forget(lock);
            return count;
        };
        queue.count.get(&*lock)
    }

    /// The number of free item slots.
    pub fn queue_spaces(queue: QueueRef<Traits>) -> usize {
        queue.capacity - Self::queue_len(queue)
    }
}

fn widen_try_error(e: QueueTryTransferError) -> QueueTransferError {
    match e {
        QueueTryTransferError::WouldBlock => QueueTransferError::Timeout,
        QueueTryTransferError::BadContext => QueueTransferError::BadContext,
        QueueTryTransferError::BadParam => QueueTransferError::BadParam,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{serial_guard, TestPort};

    type Sys = System<TestPort>;

    #[test]
    fn ring_preserves_fifo_order() {
        let _serial = serial_guard();
        let q = Sys::create_queue(3, 4).unwrap();

        for value in [0xAAu32, 0xBB, 0xCC] {
            Sys::try_queue_send(q, &value.to_le_bytes()).unwrap();
        }
        assert_eq!(Sys::queue_len(q), 3);
        assert_eq!(
            Sys::try_queue_send(q, &0xDDu32.to_le_bytes()).unwrap_err(),
            QueueTryTransferError::WouldBlock
        );

        let mut out = [0u8; 4];
        for expected in [0xAAu32, 0xBB, 0xCC] {
            Sys::try_queue_recv(q, &mut out).unwrap();
            assert_eq!(u32::from_le_bytes(out), expected);
        }
        assert_eq!(
            Sys::try_queue_recv(q, &mut out).unwrap_err(),
            QueueTryTransferError::WouldBlock
        );

        Sys::delete_queue(q).unwrap();
    }

    #[test]
    fn send_to_front_jumps_the_line() {
        let _serial = serial_guard();
        let q = Sys::create_queue(3, 4).unwrap();

        Sys::try_queue_send(q, &1u32.to_le_bytes()).unwrap();
        Sys::try_queue_send(q, &2u32.to_le_bytes()).unwrap();
        Sys::queue_send_to_front(q, &3u32.to_le_bytes(), 0).unwrap();

        let mut out = [0u8; 4];
        let mut received = Vec::new();
        while Sys::try_queue_recv(q, &mut out).is_ok() {
            received.push(u32::from_le_bytes(out));
        }
        assert_eq!(received, [3, 1, 2]);

        Sys::delete_queue(q).unwrap();
    }

    #[test]
    fn peek_does_not_consume() {
        let _serial = serial_guard();
        let q = Sys::create_queue(2, 4).unwrap();

        Sys::try_queue_send(q, &42u32.to_le_bytes()).unwrap();

        let mut out = [0u8; 4];
        Sys::queue_peek(q, &mut out, 0).unwrap();
        assert_eq!(u32::from_le_bytes(out), 42);
        assert_eq!(Sys::queue_len(q), 1);

        Sys::try_queue_recv(q, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 42);
        assert_eq!(Sys::queue_len(q), 0);

        Sys::delete_queue(q).unwrap();
    }

    #[test]
    fn overwrite_replaces_the_single_item() {
        let _serial = serial_guard();
        let q = Sys::create_queue(1, 4).unwrap();

        Sys::queue_overwrite(q, &1u32.to_le_bytes()).unwrap();
        Sys::queue_overwrite(q, &2u32.to_le_bytes()).unwrap();
        assert_eq!(Sys::queue_len(q), 1);

        let mut out = [0u8; 4];
        Sys::try_queue_recv(q, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 2);

        // Overwrite is restricted to capacity-1 queues
        let wide = Sys::create_queue(2, 4).unwrap();
        assert_eq!(
            Sys::queue_overwrite(wide, &1u32.to_le_bytes()).unwrap_err(),
            QueueTryTransferError::BadParam
        );

        Sys::delete_queue(q).unwrap();
        Sys::delete_queue(wide).unwrap();
    }

    #[test]
    fn item_size_is_enforced() {
        let _serial = serial_guard();
        let q = Sys::create_queue(2, 4).unwrap();
        assert_eq!(
            Sys::try_queue_send(q, &[0u8; 2]).unwrap_err(),
            QueueTryTransferError::BadParam
        );
        Sys::delete_queue(q).unwrap();
    }
}
