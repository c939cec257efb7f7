//! Fixed-capacity FIFO with overwrite-oldest eviction.
//!
//! Pushing into a full queue never fails and never grows the buffer: the
//! oldest element is evicted and handed back to the caller. Surviving
//! elements keep their FIFO order.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::Mutex;

use crate::governor::SizeProbe;
use crate::types::{Error, Result};

/// Ring buffer with a fixed capacity.
pub struct BoundedQueue<T> {
    buffer: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T> BoundedQueue<T> {
    /// Create an empty queue. Zero capacity is rejected.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::validation("BoundedQueue capacity must be at least 1"));
        }
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, || None);
        Ok(Self {
            buffer,
            head: 0,
            tail: 0,
            len: 0,
        })
    }

    /// Append an item. When full, the oldest item is evicted and returned.
    pub fn push(&mut self, item: T) -> Option<T> {
        let capacity = self.capacity();
        let evicted = self.buffer[self.tail].replace(item);
        self.tail = (self.tail + 1) % capacity;

        if self.len < capacity {
            self.len += 1;
            None
        } else {
            // Overwrote the slot at head
            self.head = (self.head + 1) % capacity;
            evicted
        }
    }

    /// Remove and return the oldest item.
    pub fn shift(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.buffer[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        item
    }

    /// Borrow the oldest item without removing it.
    pub fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.buffer[self.head].as_ref()
    }

    /// Drop every item and reset the ring.
    pub fn clear(&mut self) {
        for slot in &mut self.buffer {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }

    /// Remove up to `count` items from the front (all items when `None`).
    ///
    /// Only `start == 0` is supported; any other start is a usage error.
    pub fn splice(&mut self, start: usize, count: Option<usize>) -> Result<Vec<T>> {
        if start != 0 {
            return Err(Error::validation(format!(
                "BoundedQueue::splice only supports start index 0, got {}",
                start
            )));
        }
        let count = count.unwrap_or(self.len).min(self.len);
        let mut drained = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(item) = self.shift() {
                drained.push(item);
            }
        }
        Ok(drained)
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |offset| self.buffer[(self.head + offset) % capacity].as_ref())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Materialize the contents from oldest to newest.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T: fmt::Debug> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("items", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl<T: Send> SizeProbe for Mutex<BoundedQueue<T>> {
    async fn size(&self) -> Result<usize> {
        Ok(self.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            BoundedQueue::<u8>::new(0),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_fifo_until_full() {
        let mut q = BoundedQueue::new(3).unwrap();
        assert!(q.push(1).is_none());
        assert!(q.push(2).is_none());
        assert!(q.push(3).is_none());
        assert!(q.is_full());
        assert_eq!(q.peek(), Some(&1));
        assert_eq!(q.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn test_push_when_full_evicts_oldest() {
        let mut q = BoundedQueue::new(3).unwrap();
        for i in 1..=3 {
            q.push(i);
        }
        assert_eq!(q.push(4), Some(1));
        assert_eq!(q.push(5), Some(2));
        assert_eq!(q.len(), 3);
        assert_eq!(q.to_vec(), vec![3, 4, 5]);
        assert_eq!(q.shift(), Some(3));
    }

    #[test]
    fn test_shift_on_empty_returns_none() {
        let mut q: BoundedQueue<String> = BoundedQueue::new(2).unwrap();
        assert_eq!(q.shift(), None);
        assert_eq!(q.peek(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_drain_full_queue_leaves_it_empty() {
        let mut q = BoundedQueue::new(4).unwrap();
        for i in 0..10 {
            q.push(i);
        }
        let mut drained = Vec::new();
        while let Some(item) = q.shift() {
            drained.push(item);
        }
        assert_eq!(drained, vec![6, 7, 8, 9]);
        assert!(q.is_empty());
        assert!(!q.is_full());
    }

    #[test]
    fn test_clear_releases_items() {
        let shared = std::sync::Arc::new(());
        let mut q = BoundedQueue::new(2).unwrap();
        q.push(shared.clone());
        q.push(shared.clone());
        assert_eq!(std::sync::Arc::strong_count(&shared), 3);

        q.clear();
        assert_eq!(std::sync::Arc::strong_count(&shared), 1);
        assert!(q.is_empty());

        // Usable after clear
        q.push(shared.clone());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_splice_front_only() {
        let mut q = BoundedQueue::new(5).unwrap();
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.splice(0, Some(2)).unwrap(), vec![0, 1]);
        assert_eq!(q.splice(0, Some(10)).unwrap(), vec![2, 3, 4]);
        assert!(q.is_empty());

        for i in 0..3 {
            q.push(i);
        }
        assert_eq!(q.splice(0, None).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_splice_nonzero_start_fails_loudly() {
        let mut q = BoundedQueue::new(3).unwrap();
        q.push('a');
        assert!(matches!(q.splice(1, Some(1)), Err(Error::Validation(_))));
        // Nothing was removed
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_shared_queue_is_a_size_probe() {
        let q = std::sync::Arc::new(Mutex::new(BoundedQueue::new(8).unwrap()));
        q.lock().await.push("x");
        q.lock().await.push("y");
        let probe: std::sync::Arc<dyn SizeProbe> = q.clone();
        assert_eq!(probe.size().await.unwrap(), 2);
    }

    proptest! {
        #[test]
        fn prop_keeps_last_capacity_items(capacity in 1usize..32, items in proptest::collection::vec(any::<i32>(), 0..200)) {
            let mut q = BoundedQueue::new(capacity).unwrap();
            for &item in &items {
                q.push(item);
            }
            prop_assert_eq!(q.len(), items.len().min(capacity));
            let expected: Vec<i32> = items[items.len().saturating_sub(capacity)..].to_vec();
            prop_assert_eq!(q.to_vec(), expected);
        }

        #[test]
        fn prop_interleaved_push_shift_matches_vecdeque(capacity in 1usize..16, ops in proptest::collection::vec(proptest::option::of(any::<u16>()), 0..200)) {
            let mut q = BoundedQueue::new(capacity).unwrap();
            let mut model = std::collections::VecDeque::new();
            for op in ops {
                match op {
                    Some(item) => {
                        if model.len() == capacity {
                            model.pop_front();
                        }
                        model.push_back(item);
                        q.push(item);
                    }
                    None => {
                        prop_assert_eq!(q.shift(), model.pop_front());
                    }
                }
                prop_assert_eq!(q.len(), model.len());
            }
            prop_assert_eq!(q.to_vec(), model.into_iter().collect::<Vec<_>>());
        }
    }
}
