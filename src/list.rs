use core::fmt;
use core::mem;
use core::ptr;

/// A node in the doubly linked list.
///
/// Contains a value and pointers to the previous and next entries.
/// This structure is not meant to be used directly by users of the `List`.
pub struct Entry<T> {
    /// The value stored in this entry. Uses MaybeUninit to allow for sigil nodes.
    val: mem::MaybeUninit<T>,
    /// Pointer to the previous entry in the list.
    prev: *mut Entry<T>,
    /// Pointer to the next entry in the list.
    next: *mut Entry<T>,
}

impl<T> Entry<T> {
    fn new(val: T) -> Self {
        Entry {
            val: mem::MaybeUninit::new(val),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }

    /// Creates a sentinel entry without initializing the value.
    fn new_sigil() -> Self {
        Entry {
            val: mem::MaybeUninit::uninit(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

/// An unbounded doubly linked list with O(1) reordering.
///
/// The front of the list is the most recently attached node and the back is
/// the oldest, which is where eviction candidates are taken from. Nodes are
/// addressed by raw pointer so the owner can keep a `key -> node` map and move
/// or unlink a node without searching.
///
/// The list owns every node it hands out a pointer for. A pointer stays valid
/// until the node is removed, popped, or detached and reattached elsewhere.
///
/// # Examples
///
/// ```ignore
/// let mut list = List::new();
/// let a = list.push_front("a");
/// list.push_front("b");
/// unsafe { list.move_to_front(a) };
/// assert_eq!(list.pop_back(), Some("b"));
/// ```
pub struct List<T> {
    /// Current number of items in the list.
    len: usize,
    /// Pointer to the head sentinel node.
    head: *mut Entry<T>,
    /// Pointer to the tail sentinel node.
    tail: *mut Entry<T>,
}

impl<T> List<T> {
    /// Creates an empty list.
    pub fn new() -> List<T> {
        let head = Box::into_raw(Box::new(Entry::new_sigil()));
        let tail = Box::into_raw(Box::new(Entry::new_sigil()));

        // SAFETY: head and tail are newly allocated and valid pointers
        unsafe {
            (*head).next = tail;
            (*tail).prev = head;
        }

        List { len: 0, head, tail }
    }

    /// Returns the current number of items in the list.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the list contains no items.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adds a value at the front and returns its node.
    pub fn push_front(&mut self, v: T) -> *mut Entry<T> {
        let node = Box::into_raw(Box::new(Entry::new(v)));
        // SAFETY: node was just allocated and is not part of any list
        unsafe { self.attach(node) };
        self.len += 1;
        node
    }

    /// Removes the back (oldest) value from the list.
    pub fn pop_back(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        // SAFETY: the list is non-empty, so tail.prev is a real node owned by us
        unsafe {
            let prev = (*self.tail).prev;
            self.remove(prev)
        }
    }

    /// Unlinks and frees a node, returning its value.
    ///
    /// # Safety
    ///
    /// `node` must have been returned by this list and not removed since.
    pub unsafe fn remove(&mut self, node: *mut Entry<T>) -> Option<T> {
        if self.is_empty() || node.is_null() || node == self.head || node == self.tail {
            return None;
        }
        // SAFETY: caller guarantees node is a live member of this list
        unsafe {
            self.detach(node);
            let boxed = Box::from_raw(node);
            Some(boxed.val.assume_init())
        }
    }

    /// Moves a node to the front of the list.
    ///
    /// # Safety
    ///
    /// `node` must be a live member of this list.
    pub unsafe fn move_to_front(&mut self, node: *mut Entry<T>) {
        // SAFETY: caller guarantees node is a live member of this list
        unsafe {
            if (*self.head).next == node {
                return;
            }
            self.unlink(node);
            self.attach(node);
        }
    }

    /// Unlinks a node without freeing it so it can be attached to another list.
    ///
    /// # Safety
    ///
    /// `node` must be a live member of this list. After the call the node
    /// belongs to the caller until passed to [`attach_from_other_list`].
    ///
    /// [`attach_from_other_list`]: List::attach_from_other_list
    pub unsafe fn detach(&mut self, node: *mut Entry<T>) {
        // SAFETY: caller guarantees node is a live member of this list
        unsafe { self.unlink(node) };
        self.len -= 1;
    }

    /// Attaches a node previously detached from another list at the front.
    ///
    /// # Safety
    ///
    /// `node` must be a detached node that is not a member of any list.
    pub unsafe fn attach_from_other_list(&mut self, node: *mut Entry<T>) {
        // SAFETY: caller guarantees node is detached
        unsafe { self.attach(node) };
        self.len += 1;
    }

    /// Removes and frees every node.
    pub fn clear(&mut self) {
        while self.pop_back().is_some() {}
    }

    /// # Safety
    ///
    /// `node` must be a live member of this list.
    unsafe fn unlink(&mut self, node: *mut Entry<T>) {
        // SAFETY: a live node's neighbours are valid nodes or sentinels
        unsafe {
            (*(*node).prev).next = (*node).next;
            (*(*node).next).prev = (*node).prev;
        }
    }

    /// # Safety
    ///
    /// `node` must be valid and not currently linked.
    unsafe fn attach(&mut self, node: *mut Entry<T>) {
        // SAFETY: head is a valid sentinel and node is unlinked
        unsafe {
            (*node).next = (*self.head).next;
            (*node).prev = self.head;
            (*self.head).next = node;
            (*(*node).next).prev = node;
        }
    }
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for List<T> {
    fn drop(&mut self) {
        self.clear();
        // SAFETY: the sentinels were allocated in `new` and are freed exactly once;
        // their values were never initialized so only the boxes are dropped
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
    }
}

impl<T> fmt::Debug for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List").field("len", &self.len).finish()
    }
}
