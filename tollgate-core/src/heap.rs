//! Binary min-heap ordered by a caller-supplied comparator.
//!
//! Whatever the comparator ranks lowest is popped first. The heap makes no
//! stability promise of its own: callers that need FIFO among equal keys
//! must carry a strictly increasing tie-break field and compare it when the
//! primary keys are equal.
//!
//! ```rust
//! use tollgate_core::heap::PriorityHeap;
//!
//! let mut heap = PriorityHeap::new(|a: &u32, b: &u32| b.cmp(a)); // max-first
//! heap.push(3);
//! heap.push(7);
//! heap.push(5);
//! assert_eq!(heap.pop(), Some(7));
//! assert_eq!(heap.peek(), Some(&5));
//! ```

use std::cmp::Ordering;
use std::fmt;

/// Binary heap over `T`; `compare(a, b) == Less` means `a` leaves first.
pub struct PriorityHeap<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    items: Vec<T>,
    compare: F,
}

impl<T, F> PriorityHeap<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    /// Create an empty heap with the given comparator
    pub fn new(compare: F) -> Self {
        Self { items: Vec::new(), compare }
    }

    /// Create an empty heap with room for `capacity` items
    pub fn with_capacity(capacity: usize, compare: F) -> Self {
        Self { items: Vec::with_capacity(capacity), compare }
    }

    /// Number of items in the heap
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the heap is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert an item. O(log n).
    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    /// Remove and return the item that must be dequeued first. O(log n).
    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }

        let top = self.items.swap_remove(0);
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        Some(top)
    }

    /// The item that would be popped next
    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    fn precedes(&self, a: usize, b: usize) -> bool {
        (self.compare)(&self.items[a], &self.items[b]) == Ordering::Less
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.precedes(idx, parent) {
                break;
            }
            self.items.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.items.len();

        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut best = idx;

            if left < len && self.precedes(left, best) {
                best = left;
            }
            if right < len && self.precedes(right, best) {
                best = right;
            }
            if best == idx {
                break;
            }

            self.items.swap(idx, best);
            idx = best;
        }
    }
}

impl<T: fmt::Debug, F> fmt::Debug for PriorityHeap<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityHeap").field("items", &self.items).finish()
    }
}
