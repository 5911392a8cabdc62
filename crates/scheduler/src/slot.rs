//! Batch slot bookkeeping
//!
//! Every request is pinned to one slot of its worker's shared batch buffer
//! for its whole lifetime. Slots are handed out lowest-free-first and
//! recycled when the request is dropped.

use parking_lot::Mutex;

/// Where one request's data lives in the shared batch buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSlot {
    /// Slot index, `0 <= batch_id < batch_size`
    pub batch_id: usize,

    /// Size of the batch context the slot belongs to
    pub batch_size: usize,
}

/// Hands out slot indices for one worker's batch context
pub struct SlotAllocator {
    occupied: Mutex<Vec<bool>>,
}

impl SlotAllocator {
    /// Create an allocator with `batch_size` free slots
    pub fn new(batch_size: usize) -> Self {
        Self {
            occupied: Mutex::new(vec![false; batch_size]),
        }
    }

    /// Claim the lowest free slot, if any
    pub fn acquire(&self) -> Option<usize> {
        let mut occupied = self.occupied.lock();
        let free = occupied.iter().position(|taken| !taken)?;
        occupied[free] = true;
        Some(free)
    }

    /// Return a slot to the free set
    pub fn release(&self, batch_id: usize) {
        let mut occupied = self.occupied.lock();
        if let Some(taken) = occupied.get_mut(batch_id) {
            *taken = false;
        }
    }

    /// Number of currently occupied slots
    pub fn occupied(&self) -> usize {
        self.occupied.lock().iter().filter(|taken| **taken).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_lowest_free_and_disjoint() {
        let allocator = SlotAllocator::new(3);

        assert_eq!(allocator.acquire(), Some(0));
        assert_eq!(allocator.acquire(), Some(1));
        assert_eq!(allocator.acquire(), Some(2));
        assert_eq!(allocator.acquire(), None);
        assert_eq!(allocator.occupied(), 3);
    }

    #[test]
    fn test_release_recycles_lowest_first() {
        let allocator = SlotAllocator::new(4);
        for _ in 0..4 {
            allocator.acquire();
        }

        allocator.release(2);
        allocator.release(0);
        assert_eq!(allocator.occupied(), 2);

        assert_eq!(allocator.acquire(), Some(0));
        assert_eq!(allocator.acquire(), Some(2));
        assert_eq!(allocator.acquire(), None);
    }
}
