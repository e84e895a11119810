//! Token slab backing the connection table.
//!
//! A `Slab` stores values in a contiguous array and returns stable
//! indices that can be reused after release.
//!
//! Beyond plain insert/remove, the slab supports temporarily *taking*
//! a value out of its slot while keeping the slot reserved. The event
//! dispatcher relies on this: a connection is taken out of the table,
//! handed to user code as `&mut`, and restored afterwards, so a
//! handler can safely open or close *other* connections through the
//! reactor without aliasing the one it is handling.

pub(crate) struct Slab<T> {
    /// Storage for items. `None` marks a free or taken slot.
    slots: Vec<Option<T>>,

    /// Stack of free indices that can be reused.
    free: Vec<usize>,
}

impl<T> Slab<T> {
    /// Creates an empty slab.
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Inserts a value and returns its index.
    ///
    /// Free slots are reused before the slab grows.
    pub(crate) fn insert(&mut self, item: T) -> usize {
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(item);
            index
        } else {
            self.slots.push(Some(item));
            self.slots.len() - 1
        }
    }

    /// Takes the value out of `index`, keeping the slot reserved.
    ///
    /// The index stays valid and will not be handed out again until
    /// [`release`](Self::release) is called. Returns `None` if the
    /// slot is free or already taken.
    pub(crate) fn take(&mut self, index: usize) -> Option<T> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Puts a value back into a slot previously emptied by
    /// [`take`](Self::take).
    pub(crate) fn restore(&mut self, index: usize, item: T) {
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(item);
    }

    /// Frees a slot so the index can be reused.
    ///
    /// The slot must be empty, either never filled back after a take
    /// or cleared through it.
    pub(crate) fn release(&mut self, index: usize) {
        debug_assert!(self.slots[index].is_none());
        self.free.push(index);
    }

    /// Removes and returns the value at `index`, freeing the slot.
    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        let item = self.take(index)?;
        self.release(index);
        Some(item)
    }

    /// Returns a reference to the value at `index`.
    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Returns a mutable reference to the value at `index`.
    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Returns the number of occupied slots.
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Returns a snapshot of the currently occupied indices.
    ///
    /// Taken as a snapshot so the caller can mutate the slab while
    /// iterating.
    pub(crate) fn indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reuses_released_slots() {
        let mut slab = Slab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_ne!(a, b);

        assert_eq!(slab.remove(a), Some("a"));
        let c = slab.insert("c");
        assert_eq!(c, a);
        assert_eq!(slab.get(c), Some(&"c"));
    }

    #[test]
    fn taken_slot_stays_reserved() {
        let mut slab = Slab::new();
        let a = slab.insert(1);

        let item = slab.take(a).unwrap();
        assert_eq!(slab.get(a), None);

        // The reserved slot must not be reused while taken.
        let b = slab.insert(2);
        assert_ne!(a, b);

        slab.restore(a, item);
        assert_eq!(slab.get(a), Some(&1));
    }

    #[test]
    fn indices_snapshot_skips_free_slots() {
        let mut slab = Slab::new();
        let a = slab.insert(10);
        let b = slab.insert(20);
        let c = slab.insert(30);

        slab.remove(b);
        let mut live = slab.indices();
        live.sort_unstable();
        assert_eq!(live, vec![a, c]);
        assert_eq!(slab.len(), 2);
    }
}
