//! Task ready queue implementation (internal use only).
//!
//! **This module is exempt from the API stability guarantee.**
use core::ops::RangeTo;

use crate::{
    imask::{KernelCell, MaskTokenMut},
    task::TaskCb,
    utils::{
        intrusive_list::{self, List},
        Init, PrioBitmap,
    },
    KernelTraits, Priority,
};

/// Represents a task ready queue: one list of Ready tasks per priority level
/// plus a bitmap of non-empty levels, with a round-robin cursor per level.
///
/// This trait is not intended to be implemented on custom types; it exists so
/// that the number of priority levels can be chosen per system type without
/// the kernel state depending on a const generic.
pub trait Queue<Traits>: Send + Sync + Init + 'static {
    /// The highest priority that currently has a ready task.
    fn highest_ready(&'static self, lock: MaskTokenMut<'_, Traits>) -> Option<Priority>
    where
        Traits: KernelTraits;

    /// Return a flag indicating whether there's a ready task whose priority
    /// is in the specified range.
    fn has_ready_task_in_priority_range(
        &'static self,
        lock: MaskTokenMut<'_, Traits>,
        range: RangeTo<Priority>,
    ) -> bool
    where
        Traits: KernelTraits;

    /// Append `task_cb` to the list of its effective priority, making it the
    /// last of its peers to be scheduled.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is already
    /// included in the queue.
    unsafe fn push_back(&'static self, lock: MaskTokenMut<'_, Traits>, task_cb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Remove `task_cb` from the queue.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is not in
    /// the queue or its effective priority changed since insertion.
    unsafe fn remove(&'static self, lock: MaskTokenMut<'_, Traits>, task_cb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Advance the round-robin cursor of the highest non-empty priority level
    /// and return the task it lands on. The task stays in the queue.
    fn rotate_and_choose(
        &'static self,
        lock: MaskTokenMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>>
    where
        Traits: KernelTraits;

    /// Reposition `task_cb` after a change of its effective priority from
    /// `old_priority` to `priority`.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is not in
    /// the queue or was lastly inserted with a priority other than
    /// `old_priority`.
    unsafe fn reorder(
        &'static self,
        lock: MaskTokenMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        old_priority: Priority,
        priority: Priority,
    ) where
        Traits: KernelTraits;

    /// The number of ready tasks at the given priority level.
    fn peer_count(&'static self, lock: MaskTokenMut<'_, Traits>, priority: Priority) -> u32
    where
        Traits: KernelTraits;

    /// Find a ready task by name.
    fn task_by_name(
        &'static self,
        lock: MaskTokenMut<'_, Traits>,
        name: &str,
    ) -> Option<&'static TaskCb<Traits>>
    where
        Traits: KernelTraits;
}

/// The ready queue implementation backed by a set of queues segregated by the
/// priorities of contained tasks.
pub struct BitmapQueue<Traits: crate::PortThreading, const LEN: usize> {
    /// Invariant: `!queues[i].is_empty() == bitmap bit i`
    queues: [List<Traits, TaskCb<Traits>>; LEN],

    /// One bit per priority level; bit `i` is set iff `queues[i]` contains a
    /// task.
    bitmap: KernelCell<Traits, u32>,
}

impl<Traits: crate::PortThreading, const LEN: usize> Init for BitmapQueue<Traits, LEN> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = {
        assert!(
            LEN <= crate::MAX_PRIORITY_LEVELS,
            "at most 32 priority levels are supported"
        );
        Self {
            queues: [const { List::INIT }; LEN],
            bitmap: KernelCell::new(0),
        }
    };
}

impl<Traits: KernelTraits, const LEN: usize> Queue<Traits> for BitmapQueue<Traits, LEN> {
    #[inline]
    fn highest_ready(&'static self, lock: MaskTokenMut<'_, Traits>) -> Option<Priority> {
        self.bitmap.get(&*lock).find_highest().map(|x| x as Priority)
    }

    #[inline]
    fn has_ready_task_in_priority_range(
        &'static self,
        lock: MaskTokenMut<'_, Traits>,
        range: RangeTo<Priority>,
    ) -> bool {
        matches!(self.highest_ready(lock), Some(p) if p < range.end)
    }

    #[inline]
    unsafe fn push_back(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) {
        let pri = task_cb.effective_priority.get(&*lock) as usize;
        self.queues[pri].insert_last(lock.borrow_mut(), &task_cb.state_item);
        self.bitmap.write(&mut *lock).set(pri);
    }

    #[inline]
    unsafe fn remove(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) {
        let pri = task_cb.effective_priority.get(&*lock) as usize;
        debug_assert!(self.queues[pri].contains(lock.borrow_mut(), &task_cb.state_item));
        if task_cb.state_item.unlink(lock.borrow_mut()) == 0 {
            self.bitmap.write(&mut *lock).clear(pri);
        }
    }

    #[inline]
    fn rotate_and_choose(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        let pri = self.bitmap.get(&*lock).find_highest()?;
        // The bitmap said so, so the list is non-empty
        Some(
            self.queues[pri]
                .advance_and_first_owner(lock.borrow_mut())
                .unwrap(),
        )
    }

    #[inline]
    unsafe fn reorder(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        old_priority: Priority,
        priority: Priority,
    ) {
        debug_assert_ne!(old_priority, priority);
        debug_assert!(
            self.queues[old_priority as usize].contains(lock.borrow_mut(), &task_cb.state_item)
        );

        let old_empty = task_cb.state_item.unlink(lock.borrow_mut()) == 0;
        self.queues[priority as usize].insert_last(lock.borrow_mut(), &task_cb.state_item);

        let bitmap = self.bitmap.write(&mut *lock);
        bitmap.set(priority as usize);
        if old_empty {
            bitmap.clear(old_priority as usize);
        }
    }

    #[inline]
    fn peer_count(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
        priority: Priority,
    ) -> u32 {
        self.queues[priority as usize].len(lock.borrow_mut())
    }

    fn task_by_name(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
        name: &str,
    ) -> Option<&'static TaskCb<Traits>> {
        for list in self.queues.iter() {
            let mut cur = list.first_item(lock.borrow_mut());
            while let Some(item) = cur {
                let task = intrusive_list::owner_of(lock.borrow_mut(), item);
                if task.name() == name {
                    return Some(task);
                }
                cur = list.next_item(lock.borrow_mut(), item);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        task,
        test_utils::{drain_terminated, lock_test_cpu, serial_guard, TestPort},
        System,
    };

    fn noop(_: usize) {}

    type Sys = System<TestPort>;

    #[test]
    fn rotates_among_equal_priorities() {
        let _serial = serial_guard();
        let a = Sys::create_task_raw("rr_a", 7, 1024, noop, 0).unwrap();
        let b = Sys::create_task_raw("rr_b", 7, 1024, noop, 0).unwrap();
        let c = Sys::create_task_raw("rr_c", 7, 1024, noop, 0).unwrap();

        {
            let mut lock = lock_test_cpu();
            let queue = task::ready_queue::<TestPort>();
            assert_eq!(queue.peer_count(lock.borrow_mut(), 7), 3);

            let mut seen = Vec::new();
            for _ in 0..6 {
                seen.push(
                    queue
                        .rotate_and_choose(lock.borrow_mut())
                        .unwrap()
                        .name()
                        .to_owned(),
                );
            }
            // A full rotation visits every peer once, then repeats
            assert_eq!(seen[..3], seen[3..]);
            let mut names: Vec<_> = seen[..3].to_vec();
            names.sort();
            assert_eq!(names, ["rr_a", "rr_b", "rr_c"]);
        }

        for t in [a, b, c] {
            Sys::delete_task(t).unwrap();
        }
        drain_terminated();
    }

    #[test]
    fn tracks_the_highest_ready_priority() {
        let _serial = serial_guard();
        let low = Sys::create_task_raw("hi_low", 4, 1024, noop, 0).unwrap();
        let high = Sys::create_task_raw("hi_high", 9, 1024, noop, 0).unwrap();

        {
            let mut lock = lock_test_cpu();
            let queue = task::ready_queue::<TestPort>();
            assert_eq!(queue.highest_ready(lock.borrow_mut()), Some(9));
        }

        Sys::set_task_priority(high, 3).unwrap();

        {
            let mut lock = lock_test_cpu();
            let queue = task::ready_queue::<TestPort>();
            assert_eq!(queue.highest_ready(lock.borrow_mut()), Some(4));
            assert_eq!(queue.peer_count(lock.borrow_mut(), 3), 1);
            assert_eq!(queue.peer_count(lock.borrow_mut(), 9), 0);
        }

        Sys::delete_task(low).unwrap();
        Sys::delete_task(high).unwrap();
        drain_terminated();
    }
}
