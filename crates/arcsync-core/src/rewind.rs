//! In-memory rewind history.
//!
//! A bounded queue of complete save images, oldest first, each tagged with
//! the emulated time it was captured at. Pushing into a full history evicts
//! the oldest image. Rewinding pops from the newest end.

use std::collections::VecDeque;

use crate::fixed::FixedTime;

/// One captured save image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewindEntry {
    /// Emulated time at capture.
    pub time: FixedTime,
    /// A complete save file (header and body).
    pub data: Vec<u8>,
}

/// Bounded rewind history owned by a machine.
#[derive(Debug)]
pub struct RewindBuffer {
    /// Oldest at the front.
    entries: VecDeque<RewindEntry>,
    capacity: usize,
    /// Captures ever pushed, including evicted and popped ones.
    total_taken: u64,
}

impl RewindBuffer {
    /// An empty history holding at most `capacity` images. A capacity of 0
    /// is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            total_taken: 0,
        }
    }

    /// Append a capture as the newest entry, evicting the oldest when full.
    pub fn push(&mut self, entry: RewindEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.total_taken += 1;
    }

    /// Most captures held at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Captures currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there is nothing to rewind to.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every capture ever pushed, whether or not it is still held.
    pub fn total_taken(&self) -> u64 {
        self.total_taken
    }

    /// Bytes of save data currently held.
    pub fn byte_len(&self) -> usize {
        self.entries.iter().map(|e| e.data.len()).sum()
    }

    /// Entry by age: 0 is the oldest, `len - 1` the newest.
    pub fn get(&self, index: usize) -> Option<&RewindEntry> {
        self.entries.get(index)
    }

    /// The newest capture.
    pub fn latest(&self) -> Option<&RewindEntry> {
        self.entries.back()
    }

    /// The newest capture taken at or before `time`.
    pub fn latest_at_or_before(&self, time: FixedTime) -> Option<&RewindEntry> {
        self.entries.iter().rev().find(|e| e.time <= time)
    }

    /// Remove and return the newest entry.
    pub fn pop_latest(&mut self) -> Option<RewindEntry> {
        self.entries.pop_back()
    }

    /// Drop every held capture. The lifetime count is kept.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
