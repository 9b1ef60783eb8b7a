/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use std::collections::BTreeMap;

/// FIFO keyed by a session-scoped sequence number.
///
/// Ordering comes from the sequence number rather than physical position, so entries can be
/// removed from the middle without disturbing the order of the rest.  The counter is never
/// reset, including by [`SequencedQueue::drain`].
pub(crate) struct SequencedQueue<T> {
    entries: BTreeMap<u64, T>,
    next_sequence: u64,
}

impl<T> SequencedQueue<T> {
    pub(crate) fn new() -> Self {
        SequencedQueue {
            entries: BTreeMap::new(),
            next_sequence: 1,
        }
    }

    /// Appends an entry and returns the sequence number assigned to it
    pub(crate) fn push(&mut self, entry: T) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(sequence, entry);
        sequence
    }

    pub(crate) fn pop_front(&mut self) -> Option<(u64, T)> {
        self.entries.pop_first()
    }

    pub(crate) fn front(&self) -> Option<(u64, &T)> {
        self.entries.first_key_value().map(|(sequence, entry)| (*sequence, entry))
    }

    pub(crate) fn remove(&mut self, sequence: u64) -> Option<T> {
        self.entries.remove(&sequence)
    }

    pub(crate) fn get(&self, sequence: u64) -> Option<&T> {
        self.entries.get(&sequence)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.entries.iter().map(|(sequence, entry)| (*sequence, entry))
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Removes every entry, in sequence order
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let entries = std::mem::take(&mut self.entries);
        entries.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_strictly_increase() {
        let mut queue = SequencedQueue::new();

        let mut previous = 0;
        for i in 0..10 {
            let sequence = queue.push(i);
            assert!(sequence > previous);
            previous = sequence;
        }

        assert_eq!(10, queue.len());
    }

    #[test]
    fn dequeue_order_survives_interior_removal() {
        let mut queue = SequencedQueue::new();

        let sequences : Vec<u64> = (0..6).map(|i| queue.push(i)).collect();

        assert_eq!(Some(2), queue.remove(sequences[2]));
        assert_eq!(Some(4), queue.remove(sequences[4]));
        assert_eq!(None, queue.remove(sequences[4]));

        let order : Vec<i32> = queue.iter().map(|(_, value)| *value).collect();
        assert_eq!(vec![0, 1, 3, 5], order);

        let mut popped = Vec::new();
        while let Some((_, value)) = queue.pop_front() {
            popped.push(value);
        }
        assert_eq!(vec![0, 1, 3, 5], popped);
        assert!(queue.is_empty());
    }

    #[test]
    fn counter_is_not_reset() {
        let mut queue = SequencedQueue::new();

        queue.push("a");
        let last = queue.push("b");

        assert_eq!(vec!["a", "b"], queue.drain());
        assert!(queue.is_empty());

        let next = queue.push("c");
        assert!(next > last);
        assert_eq!(next + 1, queue.next_sequence());
        assert_eq!(Some((next, &"c")), queue.front());
        assert_eq!(Some(&"c"), queue.get(next));
    }
}
