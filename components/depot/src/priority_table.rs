use std::collections::VecDeque;

use snafu::ensure;

use crate::err::{InvalidArgumentSnafu, Result};

/// FIFO buckets of slab indexes by priority, with a bitmap of non-empty
/// buckets so the highest can be found in one instruction.
#[derive(Debug, Clone)]
pub struct PriorityTable {
    buckets:       Vec<VecDeque<usize>>,
    search_vector: u64,
}

impl PriorityTable {
    pub fn new(max_priority: u32) -> Result<Self> {
        ensure!(
            max_priority < u64::BITS,
            InvalidArgumentSnafu {
                reason: format!("priority {max_priority} does not fit the table"),
            }
        );
        Ok(Self {
            buckets:       vec![VecDeque::new(); max_priority as usize + 1],
            search_vector: 0,
        })
    }

    pub fn max_priority(&self) -> u32 { self.buckets.len() as u32 - 1 }

    pub fn is_empty(&self) -> bool { self.search_vector == 0 }

    pub fn clear(&mut self) {
        self.buckets.iter_mut().for_each(VecDeque::clear);
        self.search_vector = 0;
    }

    /// Add `item` behind everything already at `priority`. Priorities past
    /// the maximum are clamped to it.
    pub fn enqueue(&mut self, priority: u32, item: usize) {
        let priority = priority.min(self.max_priority());
        self.buckets[priority as usize].push_back(item);
        self.search_vector |= 1 << priority;
    }

    /// Take the oldest item of the highest priority.
    pub fn dequeue(&mut self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let top = u64::BITS - 1 - self.search_vector.leading_zeros();
        let bucket = &mut self.buckets[top as usize];
        let item = bucket.pop_front();
        if bucket.is_empty() {
            self.search_vector &= !(1 << top);
        }
        item
    }

    /// Remove `item` wherever it is queued. Returns whether it was found.
    pub fn remove(&mut self, priority: u32, item: usize) -> bool {
        let priority = priority.min(self.max_priority());
        let bucket = &mut self.buckets[priority as usize];
        let Some(at) = bucket.iter().position(|i| *i == item) else {
            return false;
        };
        bucket.remove(at);
        if bucket.is_empty() {
            self.search_vector &= !(1 << priority);
        }
        true
    }
}
