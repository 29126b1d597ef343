//! Intrusive doubly-linked list
//!
//! Link fields live inside the element itself, so insertion and removal
//! never allocate. Every scheduler queue (ready, sleep, terminate, and
//! each fiber's wait queue) is one of these lists over a different hook
//! of the same node type.
//!
//! Single-threaded by contract: links are `Cell`s, not atomics.

use core::cell::Cell;
use core::ptr;

/// Link slot embedded in a list element
///
/// One hook per queue class; a node can be in as many lists
/// simultaneously as it has hooks.
pub struct Hook<T> {
    next: Cell<*mut T>,
    prev: Cell<*mut T>,
    linked: Cell<bool>,
}

impl<T> Hook<T> {
    #[inline]
    pub const fn new() -> Self {
        Hook {
            next: Cell::new(ptr::null_mut()),
            prev: Cell::new(ptr::null_mut()),
            linked: Cell::new(false),
        }
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.linked.get()
    }

    #[inline]
    fn clear(&self) {
        self.next.set(ptr::null_mut());
        self.prev.set(ptr::null_mut());
        self.linked.set(false);
    }
}

impl<T> Default for Hook<T> {
    fn default() -> Self {
        Hook::new()
    }
}

/// Intrusive FIFO list threading elements through one of their hooks
///
/// The list stores raw pointers and never owns its elements.
///
/// # Safety
///
/// Callers must guarantee that every linked element outlives its
/// membership and that a hook is only ever threaded into one list at a
/// time. Violations are caught by debug assertions.
pub struct List<T> {
    head: Cell<*mut T>,
    tail: Cell<*mut T>,
    len: Cell<usize>,
    hook_of: fn(&T) -> &Hook<T>,
}

impl<T> List<T> {
    pub fn new(hook_of: fn(&T) -> &Hook<T>) -> Self {
        List {
            head: Cell::new(ptr::null_mut()),
            tail: Cell::new(ptr::null_mut()),
            len: Cell::new(0),
            hook_of,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.get()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len.get() == 0
    }

    /// First element, without unlinking it
    #[inline]
    pub fn front(&self) -> Option<*mut T> {
        let head = self.head.get();
        if head.is_null() {
            None
        } else {
            Some(head)
        }
    }

    /// Last element, without unlinking it
    #[inline]
    pub fn back(&self) -> Option<*mut T> {
        let tail = self.tail.get();
        if tail.is_null() {
            None
        } else {
            Some(tail)
        }
    }

    #[inline]
    fn hook(&self, node: *mut T) -> &Hook<T> {
        debug_assert!(!node.is_null());
        (self.hook_of)(unsafe { &*node })
    }

    /// Append `node` at the tail.
    ///
    /// # Safety
    ///
    /// `node` must be valid for the duration of its membership and its
    /// hook must not be linked anywhere.
    pub unsafe fn push_back(&self, node: *mut T) {
        let hook = self.hook(node);
        debug_assert!(!hook.is_linked(), "node already linked");

        hook.prev.set(self.tail.get());
        hook.next.set(ptr::null_mut());
        hook.linked.set(true);

        let tail = self.tail.get();
        if tail.is_null() {
            self.head.set(node);
        } else {
            self.hook(tail).next.set(node);
        }
        self.tail.set(node);
        self.len.set(self.len.get() + 1);
    }

    /// Unlink and return the head, if any.
    ///
    /// # Safety
    ///
    /// All linked nodes must still be valid.
    pub unsafe fn pop_front(&self) -> Option<*mut T> {
        let head = self.head.get();
        if head.is_null() {
            return None;
        }
        self.unlink(head);
        Some(head)
    }

    /// Unlink `node` from this list.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked in this list.
    pub unsafe fn unlink(&self, node: *mut T) {
        let hook = self.hook(node);
        debug_assert!(hook.is_linked(), "unlinking a node that is not linked");

        let prev = hook.prev.get();
        let next = hook.next.get();

        if prev.is_null() {
            debug_assert_eq!(self.head.get(), node);
            self.head.set(next);
        } else {
            self.hook(prev).next.set(next);
        }

        if next.is_null() {
            debug_assert_eq!(self.tail.get(), node);
            self.tail.set(prev);
        } else {
            self.hook(next).prev.set(prev);
        }

        hook.clear();
        self.len.set(self.len.get() - 1);
    }

    /// Insert `node` directly after `at`, or at the front when `at` is
    /// `None`.
    ///
    /// Used by the sleep queue to keep elements ordered by deadline.
    ///
    /// # Safety
    ///
    /// `at`, when present, must be linked in this list; `node` must be
    /// valid and unlinked.
    pub unsafe fn insert_after(&self, at: Option<*mut T>, node: *mut T) {
        let hook = self.hook(node);
        debug_assert!(!hook.is_linked(), "node already linked");

        match at {
            None => {
                let head = self.head.get();
                hook.prev.set(ptr::null_mut());
                hook.next.set(head);
                hook.linked.set(true);
                if head.is_null() {
                    self.tail.set(node);
                } else {
                    self.hook(head).prev.set(node);
                }
                self.head.set(node);
            }
            Some(at) => {
                debug_assert!(self.hook(at).is_linked());
                let next = self.hook(at).next.get();
                hook.prev.set(at);
                hook.next.set(next);
                hook.linked.set(true);
                self.hook(at).next.set(node);
                if next.is_null() {
                    self.tail.set(node);
                } else {
                    self.hook(next).prev.set(node);
                }
            }
        }
        self.len.set(self.len.get() + 1);
    }

    /// Element preceding `node`, if any.
    ///
    /// # Safety
    ///
    /// `node` must be linked in this list.
    pub unsafe fn prev_of(&self, node: *mut T) -> Option<*mut T> {
        let prev = self.hook(node).prev.get();
        if prev.is_null() {
            None
        } else {
            Some(prev)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        value: u32,
        hook: Hook<Node>,
        other_hook: Hook<Node>,
    }

    impl Node {
        fn new(value: u32) -> Self {
            Node {
                value,
                hook: Hook::new(),
                other_hook: Hook::new(),
            }
        }
    }

    fn hook_of(n: &Node) -> &Hook<Node> {
        &n.hook
    }

    fn other_hook_of(n: &Node) -> &Hook<Node> {
        &n.other_hook
    }

    fn drain(list: &List<Node>) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(n) = unsafe { list.pop_front() } {
            out.push(unsafe { (*n).value });
        }
        out
    }

    #[test]
    fn test_fifo_order() {
        let mut a = Node::new(1);
        let mut b = Node::new(2);
        let mut c = Node::new(3);

        let list = List::new(hook_of);
        unsafe {
            list.push_back(&mut a);
            list.push_back(&mut b);
            list.push_back(&mut c);
        }

        assert_eq!(list.len(), 3);
        assert_eq!(drain(&list), vec![1, 2, 3]);
        assert!(list.is_empty());
        assert!(!a.hook.is_linked());
    }

    #[test]
    fn test_unlink_middle() {
        let mut a = Node::new(1);
        let mut b = Node::new(2);
        let mut c = Node::new(3);

        let list = List::new(hook_of);
        unsafe {
            list.push_back(&mut a);
            list.push_back(&mut b);
            list.push_back(&mut c);
            list.unlink(&mut b);
        }

        assert!(!b.hook.is_linked());
        assert_eq!(drain(&list), vec![1, 3]);
    }

    #[test]
    fn test_unlink_endpoints() {
        let mut a = Node::new(1);
        let mut b = Node::new(2);
        let mut c = Node::new(3);

        let list = List::new(hook_of);
        unsafe {
            list.push_back(&mut a);
            list.push_back(&mut b);
            list.push_back(&mut c);
            list.unlink(&mut a);
            list.unlink(&mut c);
        }

        assert_eq!(list.front(), list.back());
        assert_eq!(drain(&list), vec![2]);
    }

    #[test]
    fn test_insert_after() {
        let mut a = Node::new(1);
        let mut b = Node::new(2);
        let mut c = Node::new(3);
        let mut d = Node::new(4);

        let list = List::new(hook_of);
        unsafe {
            list.insert_after(None, &mut b); // [2]
            list.insert_after(None, &mut a); // [1, 2]
            list.insert_after(Some(&mut b as *mut _), &mut d); // [1, 2, 4]
            list.insert_after(Some(&mut b as *mut _), &mut c); // [1, 2, 3, 4]
        }

        assert_eq!(drain(&list), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_prev_of_walk() {
        let mut a = Node::new(1);
        let mut b = Node::new(2);

        let list = List::new(hook_of);
        unsafe {
            list.push_back(&mut a);
            list.push_back(&mut b);

            let tail = list.back().unwrap();
            assert_eq!((*tail).value, 2);
            let prev = list.prev_of(tail).unwrap();
            assert_eq!((*prev).value, 1);
            assert!(list.prev_of(prev).is_none());
        }
    }

    #[test]
    fn test_independent_hooks() {
        let mut a = Node::new(1);

        let list = List::new(hook_of);
        let other = List::new(other_hook_of);
        unsafe {
            list.push_back(&mut a);
            other.push_back(&mut a);
        }

        assert!(a.hook.is_linked());
        assert!(a.other_hook.is_linked());

        unsafe { other.unlink(&mut a) };
        assert!(a.hook.is_linked());
        assert!(!a.other_hook.is_linked());

        assert_eq!(drain(&list), vec![1]);
    }
}
