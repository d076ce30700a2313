//! Intrusive, key-ordered, circular doubly-linked lists.
//!
//! Every schedulable entity embeds its own link nodes ([`ListItem`]), so
//! placing a task on a ready list, a delayed list, or an event list never
//! allocates. A list is headed by a sentinel item whose key is `u32::MAX` and
//! which is always present at the tail, so link manipulation never has to
//! special-case an empty list. Items carry back-pointers to their owning
//! control block and to their current container.
//!
//! All link fields live in [`KernelCell`]s; the methods take a
//! [`MaskTokenMut`], so lists can only be walked or modified inside a
//! CPU Lock critical section.
//!
//! Invariants (checked by `debug_assert!` where cheap):
//!
//!  - An item is in at most one list; `container` is `Some` iff the item is
//!    linked.
//!  - Walking `next` from the sentinel `len` times returns to the sentinel,
//!    visiting keys in non-decreasing order.
use core::{fmt, ptr::NonNull};

use crate::{
    imask::{KernelCell, MaskTokenMut},
    utils::Init,
    PortThreading,
};

/// A reference to a [`ListItem`] with static lifetime.
pub(crate) struct ItemRef<Traits, Owner: 'static>(NonNull<ListItem<Traits, Owner>>);

// Safety: `ListItem` itself is `Send + Sync`; the pointee is `'static`
unsafe impl<Traits, Owner> Send for ItemRef<Traits, Owner> {}
unsafe impl<Traits, Owner> Sync for ItemRef<Traits, Owner> {}

impl<Traits, Owner> Clone for ItemRef<Traits, Owner> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits, Owner> Copy for ItemRef<Traits, Owner> {}

impl<Traits, Owner> PartialEq for ItemRef<Traits, Owner> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits, Owner> Eq for ItemRef<Traits, Owner> {}

impl<Traits, Owner> fmt::Debug for ItemRef<Traits, Owner> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ItemRef").field(&self.0).finish()
    }
}

impl<Traits, Owner: 'static> ItemRef<Traits, Owner> {
    fn new(item: &'static ListItem<Traits, Owner>) -> Self {
        Self(NonNull::from(item))
    }

    /// Get the pointed-to item.
    ///
    /// `ItemRef` is only ever constructed from `&'static ListItem`, so the
    /// pointee is always valid.
    #[inline]
    pub(crate) fn item(self) -> &'static ListItem<Traits, Owner> {
        // Safety: See above
        unsafe { &*self.0.as_ptr() }
    }
}

/// A reference to a [`List`] with static lifetime.
pub(crate) struct ListRef<Traits, Owner: 'static>(NonNull<List<Traits, Owner>>);

// Safety: Ditto
unsafe impl<Traits, Owner> Send for ListRef<Traits, Owner> {}
unsafe impl<Traits, Owner> Sync for ListRef<Traits, Owner> {}

impl<Traits, Owner> Clone for ListRef<Traits, Owner> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits, Owner> Copy for ListRef<Traits, Owner> {}

impl<Traits, Owner> PartialEq for ListRef<Traits, Owner> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits, Owner> Eq for ListRef<Traits, Owner> {}

impl<Traits, Owner> fmt::Debug for ListRef<Traits, Owner> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ListRef").field(&self.0).finish()
    }
}

impl<Traits, Owner: 'static> ListRef<Traits, Owner> {
    /// Get the pointed-to list. See [`ItemRef::item`] regarding validity.
    #[inline]
    pub(crate) fn list(self) -> &'static List<Traits, Owner> {
        // Safety: `ListRef` is only ever constructed from `&'static List`
        unsafe { &*self.0.as_ptr() }
    }
}

/// An untyped back-pointer to the control block containing a [`ListItem`].
struct OwnerRef<Owner: 'static>(NonNull<Owner>);

// Safety: only ever constructed from `&'static Owner`
unsafe impl<Owner> Send for OwnerRef<Owner> {}
unsafe impl<Owner> Sync for OwnerRef<Owner> {}

impl<Owner> Clone for OwnerRef<Owner> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Owner> Copy for OwnerRef<Owner> {}

/// A link node embedded in a control block of type `Owner`.
pub(crate) struct ListItem<Traits, Owner: 'static> {
    key: KernelCell<Traits, u32>,
    next: KernelCell<Traits, Option<ItemRef<Traits, Owner>>>,
    prev: KernelCell<Traits, Option<ItemRef<Traits, Owner>>>,
    container: KernelCell<Traits, Option<ListRef<Traits, Owner>>>,
    owner: KernelCell<Traits, Option<OwnerRef<Owner>>>,
}

impl<Traits, Owner> Init for ListItem<Traits, Owner> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::with_key(0);
}

impl<Traits, Owner: 'static> ListItem<Traits, Owner> {
    const fn with_key(key: u32) -> Self {
        Self {
            key: KernelCell::new(key),
            next: KernelCell::new(None),
            prev: KernelCell::new(None),
            container: KernelCell::new(None),
            owner: KernelCell::new(None),
        }
    }
}

impl<Traits: PortThreading, Owner: 'static> ListItem<Traits, Owner> {
    pub(crate) fn key(&self, lock: MaskTokenMut<'_, Traits>) -> u32 {
        self.key.get(&*lock)
    }

    pub(crate) fn is_linked(&self, lock: MaskTokenMut<'_, Traits>) -> bool {
        self.container.get(&*lock).is_some()
    }

    /// Get the list this item is currently linked into, if any.
    pub(crate) fn container(
        &self,
        lock: MaskTokenMut<'_, Traits>,
    ) -> Option<&'static List<Traits, Owner>> {
        self.container.get(&*lock).map(ListRef::list)
    }

    /// Unlink this item from its container, clearing the link fields.
    /// Returns the number of items remaining in the list.
    ///
    /// The item must currently be linked.
    pub(crate) fn unlink(&'static self, mut lock: MaskTokenMut<'_, Traits>) -> u32 {
        let list = self
            .container
            .replace(&mut *lock, None)
            .expect("unlinking an item that is not in a list")
            .list();

        let this = ItemRef::new(self);
        let next = self.next.replace(&mut *lock, None).unwrap();
        let prev = self.prev.replace(&mut *lock, None).unwrap();
        next.item().prev.replace(&mut *lock, Some(prev));
        prev.item().next.replace(&mut *lock, Some(next));

        // Keep the round-robin cursor on a live item
        if list.index.get(&*lock) == Some(this) {
            list.index.replace(&mut *lock, Some(prev));
        }

        let len = list.len.get(&*lock) - 1;
        list.len.replace(&mut *lock, len);
        len
    }
}

/// A list of `Owner` control blocks, linked through one of their embedded
/// [`ListItem`]s, ordered by a monotonic `u32` key.
pub(crate) struct List<Traits, Owner: 'static> {
    len: KernelCell<Traits, u32>,
    /// The round-robin cursor. `None` until the first operation on the list;
    /// afterwards it always points to a linked item or the sentinel.
    index: KernelCell<Traits, Option<ItemRef<Traits, Owner>>>,
    sentinel: ListItem<Traits, Owner>,
}

impl<Traits, Owner> Init for List<Traits, Owner> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        len: KernelCell::new(0),
        index: KernelCell::new(None),
        sentinel: ListItem::with_key(u32::MAX),
    };
}

impl<Traits: PortThreading, Owner: 'static> List<Traits, Owner> {
    #[inline]
    fn sentinel_ref(&'static self) -> ItemRef<Traits, Owner> {
        ItemRef::new(&self.sentinel)
    }

    /// Close the sentinel's link cycle if this list has never been touched.
    /// Lists are constructed by `const` initializers that can't know their
    /// final address, so this runs lazily on first use.
    fn ensure_init(&'static self, mut lock: MaskTokenMut<'_, Traits>) {
        if self.sentinel.next.get(&*lock).is_none() {
            let s = self.sentinel_ref();
            self.sentinel.next.replace(&mut *lock, Some(s));
            self.sentinel.prev.replace(&mut *lock, Some(s));
            self.index.replace(&mut *lock, Some(s));
        }
    }

    pub(crate) fn len(&self, lock: MaskTokenMut<'_, Traits>) -> u32 {
        self.len.get(&*lock)
    }

    pub(crate) fn is_empty(&self, lock: MaskTokenMut<'_, Traits>) -> bool {
        self.len.get(&*lock) == 0
    }

    pub(crate) fn contains(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
        item: &'static ListItem<Traits, Owner>,
    ) -> bool {
        item.container.get(&*lock.borrow_mut()) == Some(ListRef(NonNull::from(self)))
    }

    /// Link `item` at the position given by `key`: after every item whose key
    /// is less than or equal to `key` (so that equal keys are served in FIFO
    /// order) and before the rest.
    ///
    /// `item` must not currently be in a list.
    pub(crate) fn insert(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
        item: &'static ListItem<Traits, Owner>,
        key: u32,
    ) {
        self.ensure_init(lock.borrow_mut());
        item.key.replace(&mut *lock, key);

        let sentinel = self.sentinel_ref();
        let mut at = self.sentinel.next.get(&*lock).unwrap();
        while at != sentinel && at.item().key.get(&*lock) <= key {
            at = at.item().next.get(&*lock).unwrap();
        }

        self.insert_before(lock, item, at);
    }

    /// Link `item` immediately before the round-robin cursor, making it the
    /// last item to be visited by a full round of [`Self::advance_and_first_owner`].
    /// The item's key is left unchanged and ignored for ordering.
    ///
    /// `item` must not currently be in a list.
    pub(crate) fn insert_last(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
        item: &'static ListItem<Traits, Owner>,
    ) {
        self.ensure_init(lock.borrow_mut());
        let at = self.index.get(&*lock).unwrap();
        self.insert_before(lock, item, at);
    }

    fn insert_before(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
        item: &'static ListItem<Traits, Owner>,
        at: ItemRef<Traits, Owner>,
    ) {
        debug_assert!(
            item.container.get(&*lock).is_none(),
            "item is already in a list"
        );

        let this = ItemRef::new(item);
        let prev = at.item().prev.get(&*lock).unwrap();
        item.next.replace(&mut *lock, Some(at));
        item.prev.replace(&mut *lock, Some(prev));
        prev.item().next.replace(&mut *lock, Some(this));
        at.item().prev.replace(&mut *lock, Some(this));

        item.container
            .replace(&mut *lock, Some(ListRef(NonNull::from(self))));
        self.len.replace_with(&mut *lock, |x| *x + 1);
    }

    /// Advance the round-robin cursor to the next non-sentinel item and
    /// return its owner. Returns `None` if the list is empty.
    pub(crate) fn advance_and_first_owner(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
    ) -> Option<&'static Owner> {
        self.ensure_init(lock.borrow_mut());
        if self.len.get(&*lock) == 0 {
            return None;
        }

        let sentinel = self.sentinel_ref();
        let mut at = self.index.get(&*lock).unwrap();
        at = at.item().next.get(&*lock).unwrap();
        if at == sentinel {
            at = at.item().next.get(&*lock).unwrap();
        }
        self.index.replace(&mut *lock, Some(at));

        Some(owner_of(lock, at.item()))
    }

    /// Get the item at the head (the one with the smallest key).
    pub(crate) fn first_item(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
    ) -> Option<&'static ListItem<Traits, Owner>> {
        self.ensure_init(lock.borrow_mut());
        let first = self.sentinel.next.get(&*lock).unwrap();
        if first == self.sentinel_ref() {
            None
        } else {
            Some(first.item())
        }
    }

    /// Get the key of the head item.
    pub(crate) fn first_key(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
    ) -> Option<u32> {
        self.first_item(lock.borrow_mut())
            .map(|item| item.key.get(&*lock))
    }

    /// Get the owner of the head item.
    pub(crate) fn first_owner(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
    ) -> Option<&'static Owner> {
        self.first_item(lock.borrow_mut())
            .map(|item| owner_of(lock, item))
    }

    /// Get the item following `item`, skipping the sentinel.
    pub(crate) fn next_item(
        &'static self,
        mut lock: MaskTokenMut<'_, Traits>,
        item: &'static ListItem<Traits, Owner>,
    ) -> Option<&'static ListItem<Traits, Owner>> {
        debug_assert!(self.contains(lock.borrow_mut(), item));
        let next = item.next.get(&*lock).unwrap();
        if next == self.sentinel_ref() {
            None
        } else {
            Some(next.item())
        }
    }
}

/// Register `owner` as the owning control block of `item`.
///
/// Control blocks contain their own `ListItem`s, so the back-pointer can only
/// be written once the control block has reached its final address.
pub(crate) fn set_owner<Traits: PortThreading, Owner: 'static>(
    mut lock: MaskTokenMut<'_, Traits>,
    item: &'static ListItem<Traits, Owner>,
    owner: &'static Owner,
) {
    item.owner
        .replace(&mut *lock, Some(OwnerRef(NonNull::from(owner))));
}

/// Get the control block that `item` is embedded in. Panics if [`set_owner`]
/// was never called for the item.
pub(crate) fn owner_of<Traits: PortThreading, Owner: 'static>(
    lock: MaskTokenMut<'_, Traits>,
    item: &'static ListItem<Traits, Owner>,
) -> &'static Owner {
    let owner = item
        .owner
        .get(&*lock)
        .expect("list item has no registered owner");
    // Safety: the pointer was produced from `&'static Owner` in `set_owner`
    unsafe { &*owner.0.as_ptr() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lock_test_cpu, TestPort};
    use quickcheck_macros::quickcheck;

    struct Node {
        item: ListItem<TestPort, Node>,
        value: u32,
    }

    fn leak_node(value: u32) -> &'static Node {
        Box::leak(Box::new(Node {
            item: ListItem::INIT,
            value,
        }))
    }

    fn leak_list() -> &'static List<TestPort, Node> {
        Box::leak(Box::new(List::INIT))
    }

    fn collect(lock: &mut crate::imask::MaskGuard<TestPort>, list: &'static List<TestPort, Node>) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = list.first_item(lock.borrow_mut());
        while let Some(item) = cur {
            out.push(item.key(lock.borrow_mut()));
            cur = list.next_item(lock.borrow_mut(), item);
        }
        out
    }

    #[test]
    fn ordered_insert_is_stable() {
        let mut lock = lock_test_cpu();
        let list = leak_list();

        for &key in &[5u32, 1, 3, 3, 9, 0, 3] {
            let node = leak_node(key);
            set_owner(lock.borrow_mut(), &node.item, node);
            list.insert(lock.borrow_mut(), &node.item, key);
        }

        assert_eq!(collect(&mut lock, list), [0, 1, 3, 3, 3, 5, 9]);
        assert_eq!(list.len(lock.borrow_mut()), 7);
        assert_eq!(list.first_key(lock.borrow_mut()), Some(0));
    }

    #[test]
    fn unlink_returns_remaining_len() {
        let mut lock = lock_test_cpu();
        let list = leak_list();

        let a = leak_node(1);
        let b = leak_node(2);
        for n in [a, b] {
            set_owner(lock.borrow_mut(), &n.item, n);
            list.insert(lock.borrow_mut(), &n.item, n.value);
        }

        assert_eq!(a.item.unlink(lock.borrow_mut()), 1);
        assert!(!a.item.is_linked(lock.borrow_mut()));
        assert_eq!(b.item.unlink(lock.borrow_mut()), 0);
        assert!(list.is_empty(lock.borrow_mut()));
        assert_eq!(list.first_item(lock.borrow_mut()).map(|_| ()), None);
    }

    #[test]
    fn round_robin_visits_every_item() {
        let mut lock = lock_test_cpu();
        let list = leak_list();

        for value in 0..4 {
            let node = leak_node(value);
            set_owner(lock.borrow_mut(), &node.item, node);
            list.insert_last(lock.borrow_mut(), &node.item);
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(
                list.advance_and_first_owner(lock.borrow_mut())
                    .unwrap()
                    .value,
            );
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, [0, 1, 2, 3]);
    }

    #[test]
    fn unlinking_the_cursor_target_keeps_rotation_sound() {
        let mut lock = lock_test_cpu();
        let list = leak_list();

        let nodes: Vec<&'static Node> = (0..3).map(leak_node).collect();
        for n in &nodes {
            set_owner(lock.borrow_mut(), &n.item, n);
            list.insert_last(lock.borrow_mut(), &n.item);
        }

        let first = list.advance_and_first_owner(lock.borrow_mut()).unwrap();
        let first = nodes.iter().find(|n| n.value == first.value).unwrap();
        first.item.unlink(lock.borrow_mut());

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(
                list.advance_and_first_owner(lock.borrow_mut())
                    .unwrap()
                    .value,
            );
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 2);
    }

    #[quickcheck]
    fn insertion_matches_stable_sort(keys: Vec<u32>) -> bool {
        let mut lock = lock_test_cpu();
        let list = leak_list();

        for &key in &keys {
            let node = leak_node(key);
            set_owner(lock.borrow_mut(), &node.item, node);
            list.insert(lock.borrow_mut(), &node.item, key);
        }

        let mut expected = keys;
        expected.sort_unstable();
        collect(&mut lock, list) == expected
    }
}
