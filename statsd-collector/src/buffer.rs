//! A fixed-capacity, drop-oldest buffer of serialized data points.
use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// A fixed-capacity FIFO of serialized data points.
///
/// When the buffer is full, adding an entry evicts the oldest one. Every admitted entry is counted in
/// [`total`](BoundedBuffer::total), and every eviction in [`drops`](BoundedBuffer::drops), so `total - drops` is
/// always the number of entries that were ever retained.
#[derive(Debug)]
pub struct BoundedBuffer {
    entries: VecDeque<Bytes>,
    capacity: usize,
    total: u64,
    drops: u64,
}

impl BoundedBuffer {
    /// Creates a new `BoundedBuffer` holding at most `capacity` entries.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { entries: VecDeque::with_capacity(capacity), capacity, total: 0, drops: 0 }
    }

    /// Adds an entry, evicting the oldest one if the buffer is full.
    pub fn add(&mut self, entry: Bytes) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.drops += 1;
        }

        self.entries.push_back(entry);
        self.total += 1;
    }

    /// Removes up to `max` of the oldest entries and concatenates them.
    ///
    /// Returns an empty buffer when there is nothing to drain.
    pub fn batch(&mut self, max: usize) -> Bytes {
        let n = max.min(self.entries.len());
        match n {
            0 => Bytes::new(),
            // A single entry can be handed out without copying.
            1 => self.entries.pop_front().unwrap_or_default(),
            _ => {
                let len: usize = self.entries.iter().take(n).map(Bytes::len).sum();
                let mut batch = BytesMut::with_capacity(len);
                for entry in self.entries.drain(..n) {
                    batch.extend_from_slice(&entry);
                }
                batch.freeze()
            }
        }
    }

    /// Gets the number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the buffer holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Gets the maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Gets the number of entries evicted to make room for newer ones.
    pub fn drops(&self) -> u64 {
        self.drops
    }

    /// Gets the number of entries ever added.
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;

    use super::BoundedBuffer;

    fn entry(n: u32) -> Bytes {
        Bytes::from(format!("{}\n", n))
    }

    #[test]
    fn drops_oldest_when_full() {
        let mut buffer = BoundedBuffer::new(4);
        for n in 1..=6 {
            buffer.add(entry(n));
        }

        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.drops(), 2);
        assert_eq!(buffer.total(), 6);
        assert_eq!(&buffer.batch(10)[..], b"3\n4\n5\n6\n");
        assert!(buffer.is_empty());
    }

    #[test]
    fn batch_is_fifo_and_bounded() {
        let mut buffer = BoundedBuffer::new(8);
        for n in 0..5 {
            buffer.add(entry(n));
        }

        assert_eq!(&buffer.batch(2)[..], b"0\n1\n");
        assert_eq!(&buffer.batch(1)[..], b"2\n");
        assert_eq!(buffer.len(), 2);
        assert_eq!(&buffer.batch(5)[..], b"3\n4\n");
        assert!(buffer.batch(5).is_empty());
    }

    #[test]
    fn zero_capacity_is_raised() {
        let mut buffer = BoundedBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.add(entry(1));
        buffer.add(entry(2));
        assert_eq!(buffer.drops(), 1);
        assert_eq!(&buffer.batch(1)[..], b"2\n");
    }

    proptest! {
        #[test]
        fn accounting_holds(capacity in 1usize..32, adds in 0u32..128, drain in 0usize..16) {
            let mut buffer = BoundedBuffer::new(capacity);
            let mut drained = 0u64;
            for n in 0..adds {
                buffer.add(entry(n));
                if n % 7 == 0 {
                    let batch = buffer.batch(drain);
                    drained += batch.iter().filter(|b| **b == b'\n').count() as u64;
                }
            }

            prop_assert!(buffer.len() <= capacity);
            prop_assert_eq!(buffer.total(), u64::from(adds));
            prop_assert_eq!(buffer.total() - buffer.drops(), drained + buffer.len() as u64);
        }
    }
}
