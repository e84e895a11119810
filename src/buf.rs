//! Growable byte buffer used for connection receive and send queues.
//!
//! Every connection owns two [`Buf`] instances. Protocol codecs parse
//! directly out of the receive buffer and compose into the send buffer,
//! so the buffer supports insertion at arbitrary offsets (needed by
//! codecs that prepend a header after composing a body) as well as
//! removal from the front.
//!
//! Growth is fallible: an insertion that cannot be satisfied reports
//! zero bytes written instead of aborting the process.

use std::ops::{Deref, DerefMut};

/// Over-allocation factor applied when the buffer has to grow.
///
/// Growing to exactly the requested length would make repeated small
/// appends quadratic, so the buffer reserves 3/2 of the new length.
const GROWTH_NUM: usize = 3;
const GROWTH_DEN: usize = 2;

/// A contiguous, growable byte buffer.
///
/// `Buf` dereferences to `[u8]`, so parsed views can borrow straight
/// from it and in-place transforms (such as unmasking) can mutate it.
#[derive(Debug, Default)]
pub struct Buf {
    data: Vec<u8>,
}

impl Buf {
    /// Creates an empty buffer with no backing allocation.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Creates an empty buffer with at least `capacity` bytes reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of live bytes in the buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the buffer holds no live bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the current allocated capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Returns the live bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the live bytes as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Inserts `data` at byte offset `offset`, shifting the tail up.
    ///
    /// Returns the number of bytes inserted: `data.len()` on success,
    /// `0` if `offset` is past the end, if the resulting length would
    /// overflow `usize`, or if the allocation fails.
    pub fn insert(&mut self, offset: usize, data: &[u8]) -> usize {
        if offset > self.data.len() {
            return 0;
        }

        let n = data.len();
        let Some(new_len) = self.data.len().checked_add(n) else {
            return 0;
        };

        if new_len > self.data.capacity() {
            let target = new_len.saturating_mul(GROWTH_NUM) / GROWTH_DEN;
            let grow = target.max(new_len) - self.data.len();
            if self.data.try_reserve_exact(grow).is_err() {
                return 0;
            }
        }

        self.data.splice(offset..offset, data.iter().copied());
        n
    }

    /// Appends `data` at the end of the buffer.
    ///
    /// Returns the number of bytes appended (see [`insert`](Self::insert)).
    pub fn append(&mut self, data: &[u8]) -> usize {
        self.insert(self.data.len(), data)
    }

    /// Discards the first `n` bytes, shifting the rest to the front.
    ///
    /// Does nothing if `n` is zero or larger than the buffer length.
    pub fn remove(&mut self, n: usize) {
        if n > 0 && n <= self.data.len() {
            self.data.drain(..n);
        }
    }

    /// Truncates the buffer to `n` live bytes.
    ///
    /// Does nothing if `n` is not smaller than the current length.
    pub fn truncate(&mut self, n: usize) {
        self.data.truncate(n);
    }

    /// Removes all live bytes without releasing the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Adjusts the capacity to `new_cap` bytes.
    ///
    /// Only ever grows the allocation or shrinks it down to a capacity
    /// that still holds the live bytes; a `new_cap` below the current
    /// length is ignored.
    pub fn resize(&mut self, new_cap: usize) {
        if new_cap > self.data.capacity() {
            let _ = self.data.try_reserve_exact(new_cap - self.data.len());
        } else if new_cap >= self.data.len() {
            self.data.shrink_to(new_cap);
        }
    }

    /// Releases spare capacity, keeping only the live bytes allocated.
    pub fn trim(&mut self) {
        self.data.shrink_to_fit();
    }

    /// Consumes the buffer and returns the underlying bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl From<&[u8]> for Buf {
    fn from(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }
}

impl From<Vec<u8>> for Buf {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn append_and_remove() {
        let mut buf = Buf::new();
        assert_eq!(buf.append(b"hello"), 5);
        assert_eq!(buf.append(b" world"), 6);
        assert_eq!(buf.as_slice(), b"hello world");

        buf.remove(6);
        assert_eq!(buf.as_slice(), b"world");

        // Out-of-range removal is a no-op.
        buf.remove(100);
        assert_eq!(buf.as_slice(), b"world");
    }

    #[test]
    fn interior_insert_shifts_tail() {
        let mut buf = Buf::new();
        buf.append(b"payload");
        assert_eq!(buf.insert(0, b"hdr:"), 4);
        assert_eq!(buf.as_slice(), b"hdr:payload");

        assert_eq!(buf.insert(4, b"[mid]"), 5);
        assert_eq!(buf.as_slice(), b"hdr:[mid]payload");
    }

    #[test]
    fn insert_past_end_is_rejected() {
        let mut buf = Buf::new();
        buf.append(b"ab");
        assert_eq!(buf.insert(3, b"x"), 0);
        assert_eq!(buf.as_slice(), b"ab");
    }

    #[test]
    fn resize_never_truncates_live_bytes() {
        let mut buf = Buf::with_capacity(64);
        buf.append(b"0123456789");

        buf.resize(4);
        assert_eq!(buf.len(), 10);
        assert!(buf.capacity() >= 10);

        buf.resize(128);
        assert!(buf.capacity() >= 128);
        assert_eq!(buf.as_slice(), b"0123456789");
    }

    #[test]
    fn growth_over_allocates() {
        let mut buf = Buf::new();
        buf.append(&[0u8; 100]);
        assert!(buf.capacity() >= 150);
    }

    proptest! {
        // Drive Buf and a plain Vec<u8> with the same operation
        // sequence and require identical contents afterwards.
        #[test]
        fn matches_vec_reference(ops in proptest::collection::vec(
            (0u8..3, 0usize..32, proptest::collection::vec(any::<u8>(), 0..16)),
            0..64,
        )) {
            let mut buf = Buf::new();
            let mut model: Vec<u8> = Vec::new();

            for (op, at, data) in ops {
                match op {
                    0 => {
                        buf.append(&data);
                        model.extend_from_slice(&data);
                    }
                    1 => {
                        let n = buf.insert(at, &data);
                        if at <= model.len() {
                            prop_assert_eq!(n, data.len());
                            model.splice(at..at, data.iter().copied());
                        } else {
                            prop_assert_eq!(n, 0);
                        }
                    }
                    _ => {
                        buf.remove(at);
                        if at > 0 && at <= model.len() {
                            model.drain(..at);
                        }
                    }
                }
                prop_assert!(buf.len() <= buf.capacity());
            }

            prop_assert_eq!(buf.as_slice(), model.as_slice());
        }
    }
}
