//! Fixed-capacity ring buffer for bounded circular storage.
//!
//! Keeps the most recent N items; when full, a push overwrites the oldest.
//! Backs the recent-event display ledger.

/// A fixed-capacity ring buffer. Iteration yields items oldest to newest.
pub struct RingBuffer<T> {
    buf: Vec<Option<T>>,
    head: usize, // next write position
    len: usize,
    total: u64, // items ever pushed
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` items (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);
        Self {
            buf,
            head: 0,
            len: 0,
            total: 0,
        }
    }

    /// Push an item, returning the evicted oldest item when full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = self.buf[self.head].replace(item);
        self.head = (self.head + 1) % self.buf.len();
        self.total += 1;
        if self.len < self.buf.len() {
            self.len += 1;
        }
        evicted
    }

    fn start(&self) -> usize {
        if self.len < self.buf.len() {
            0
        } else {
            self.head
        }
    }

    /// Item at logical index (0 = oldest).
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.buf[(self.start() + index) % self.buf.len()].as_ref()
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            buf: &self.buf,
            start: self.start(),
            front: 0,
            back: self.len,
        }
    }

    /// Up to `limit` items, newest first.
    pub fn newest(&self, limit: usize) -> impl Iterator<Item = &T> + '_ {
        self.iter().rev().take(limit)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Total items ever pushed (including overwritten ones).
    #[must_use]
    pub fn total_pushed(&self) -> u64 {
        self.total
    }
}

/// Borrowing iterator over a [`RingBuffer`], walking the slots in place.
/// `front..back` are logical indices (0 = oldest).
pub struct Iter<'a, T> {
    buf: &'a [Option<T>],
    start: usize,
    front: usize,
    back: usize,
}

impl<'a, T> Iter<'a, T> {
    fn slot(&self, index: usize) -> Option<&'a T> {
        self.buf[(self.start + index) % self.buf.len()].as_ref()
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        let item = self.slot(self.front);
        self.front += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<T> DoubleEndedIterator for Iter<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        self.back -= 1;
        self.slot(self.back)
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.buf.len())
            .field("len", &self.len)
            .field("total_pushed", &self.total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_overwrites_oldest() {
        let mut rb = RingBuffer::new(3);
        assert_eq!(rb.push(1), None);
        rb.push(2);
        rb.push(3);
        assert_eq!(rb.push(4), Some(1));
        assert_eq!(rb.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(rb.total_pushed(), 4);
    }

    #[test]
    fn newest_is_reverse_order() {
        let mut rb = RingBuffer::new(4);
        for i in 0..6 {
            rb.push(i);
        }
        assert_eq!(rb.newest(2).copied().collect::<Vec<_>>(), vec![5, 4]);
        assert_eq!(rb.len(), 4);
    }

    #[test]
    fn iter_walks_wrapped_slots_from_both_ends() {
        let mut rb = RingBuffer::new(3);
        for i in 0..5 {
            rb.push(i);
        }
        let mut iter = rb.iter();
        assert_eq!(iter.len(), 3);
        assert_eq!(iter.next(), Some(&2));
        assert_eq!(iter.next_back(), Some(&4));
        assert_eq!(iter.len(), 1);
        assert_eq!(iter.next(), Some(&3));
        assert_eq!(iter.next_back(), None);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut rb = RingBuffer::new(0);
        rb.push("a");
        rb.push("b");
        assert_eq!(rb.capacity(), 1);
        assert_eq!(rb.get(0), Some(&"b"));
        assert_eq!(rb.get(1), None);
    }
}
