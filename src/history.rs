//! A bounded window of the most recent bytes a device produced.
//!
//! Viewers attaching late are handed a copy of this window so they see
//! recent context (a prompt, the tail of a boot log) before live output.

use std::collections::VecDeque;

/// How many bytes a [`HistoryBuffer`] keeps unless told otherwise.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100 * 1024;

/// Fixed capacity byte ring.
///
/// Once full, appending evicts the oldest bytes first.
/// There is no framing: this is a raw byte window.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryBuffer {
    /// A new empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append bytes, evicting from the front as needed.
    pub fn append(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }

        // Only the tail of an oversized chunk can survive anyway.
        let data = &data[data.len().saturating_sub(self.capacity)..];

        let overflow = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        self.bytes.drain(..overflow);
        self.bytes.extend(data);
    }

    /// A copy of the current contents, oldest byte first.
    pub fn snapshot(&self) -> Vec<u8> {
        let (front, back) = self.bytes.as_slices();

        let mut snapshot = Vec::with_capacity(self.bytes.len());
        snapshot.extend_from_slice(front);
        snapshot.extend_from_slice(back);
        snapshot
    }

    /// Number of bytes currently held.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if nothing has been appended (or capacity is zero).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The maximum number of bytes held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}
