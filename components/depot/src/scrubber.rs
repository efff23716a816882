use std::collections::VecDeque;

use serde::Serialize;

/// Slabs waiting to be scrubbed, by allocator-local index.
#[derive(Debug, Default)]
pub struct SlabScrubber {
    high_priority_slabs: VecDeque<usize>,
    slabs:               VecDeque<usize>,
    stopped:             bool,
    stats:               ScrubberStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScrubberStats {
    pub slabs_scrubbed:       u64,
    pub high_priority_scrubs: u64,
    pub entries_replayed:     u64,
}

impl SlabScrubber {
    pub fn register(&mut self, slab: usize, high_priority: bool) {
        if high_priority {
            self.high_priority_slabs.push_back(slab);
        } else {
            self.slabs.push_back(slab);
        }
    }

    /// Move `slab` to the high priority queue. Returns false if it was not
    /// waiting at all.
    pub fn escalate(&mut self, slab: usize) -> bool {
        if self.high_priority_slabs.contains(&slab) {
            return true;
        }
        let Some(at) = self.slabs.iter().position(|s| *s == slab) else {
            return false;
        };
        self.slabs.remove(at);
        self.high_priority_slabs.push_back(slab);
        true
    }

    /// The next slab to scrub and whether it was high priority.
    pub fn next(&mut self, high_priority_only: bool) -> Option<(usize, bool)> {
        if self.stopped {
            return None;
        }
        if let Some(slab) = self.high_priority_slabs.pop_front() {
            return Some((slab, true));
        }
        if high_priority_only {
            return None;
        }
        self.slabs.pop_front().map(|slab| (slab, false))
    }

    pub fn record(&mut self, high_priority: bool, entries: usize) {
        self.stats.slabs_scrubbed += 1;
        self.stats.entries_replayed += entries as u64;
        if high_priority {
            self.stats.high_priority_scrubs += 1;
        }
    }

    pub fn slab_count(&self) -> usize { self.high_priority_slabs.len() + self.slabs.len() }

    pub fn has_slabs(&self) -> bool { self.slab_count() > 0 }

    pub fn stop(&mut self) { self.stopped = true; }

    pub fn resume(&mut self) { self.stopped = false; }

    pub fn is_stopped(&self) -> bool { self.stopped }

    pub fn stats(&self) -> ScrubberStats { self.stats }

    pub fn clear(&mut self) {
        self.high_priority_slabs.clear();
        self.slabs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_priority_goes_first() {
        let mut scrubber = SlabScrubber::default();
        scrubber.register(1, false);
        scrubber.register(2, false);
        scrubber.register(3, true);
        assert!(scrubber.escalate(2));
        assert!(!scrubber.escalate(9));

        assert_eq!(scrubber.next(false), Some((3, true)));
        assert_eq!(scrubber.next(true), Some((2, true)));
        assert_eq!(scrubber.next(true), None);

        scrubber.stop();
        assert_eq!(scrubber.next(false), None);
        scrubber.resume();
        assert_eq!(scrubber.next(false), Some((1, false)));
        assert!(!scrubber.has_slabs());
    }
}
