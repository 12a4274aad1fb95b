// In-flight frame window
//
// At most N frames may have unretired GPU work. Frame f uses slot f % N, and
// the backend waits for frame f - N before frame f starts, so anything owned
// by a slot can be reused from then on.

use std::collections::VecDeque;

/// Slot index used by `frame` with `concurrent_frames` slots.
pub fn slot_of(frame: u64, concurrent_frames: usize) -> usize {
    (frame % concurrent_frames.max(1) as u64) as usize
}

/// First frame whose work may still be pending while `frame` is being built,
/// i.e. every frame `< oldest_unretired(frame, n)` has retired.
pub fn oldest_unretired(frame: u64, concurrent_frames: usize) -> u64 {
    (frame + 1).saturating_sub(concurrent_frames as u64)
}

/// One `T` per frame slot.
#[derive(Debug, Clone)]
pub struct PerFrame<T> {
    slots: Vec<T>,
}

impl<T> PerFrame<T> {
    pub fn new(concurrent_frames: usize, mut make: impl FnMut(usize) -> T) -> Self {
        Self { slots: (0..concurrent_frames.max(1)).map(&mut make).collect() }
    }

    pub fn try_new<E>(
        concurrent_frames: usize,
        make: impl FnMut(usize) -> Result<T, E>,
    ) -> Result<Self, E> {
        let slots = (0..concurrent_frames.max(1)).map(make).collect::<Result<Vec<_>, E>>()?;
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn for_frame(&self, frame: u64) -> &T {
        &self.slots[slot_of(frame, self.slots.len())]
    }

    pub fn for_frame_mut(&mut self, frame: u64) -> &mut T {
        let slot = slot_of(frame, self.slots.len());
        &mut self.slots[slot]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}

/// Deferred destruction: items handed over in frame f are released once
/// frame f + N starts.
#[derive(Debug)]
pub struct LifetimeQueue<T> {
    concurrent_frames: usize,
    pending: VecDeque<(u64, T)>,
}

impl<T> LifetimeQueue<T> {
    pub fn new(concurrent_frames: usize) -> Self {
        Self { concurrent_frames: concurrent_frames.max(1), pending: VecDeque::new() }
    }

    pub fn push(&mut self, frame: u64, item: T) {
        self.pending.push_back((frame, item));
    }

    /// Remove everything whose frame has retired by the time `current_frame`
    /// starts.
    pub fn release(&mut self, current_frame: u64) -> Vec<T> {
        let window = self.concurrent_frames as u64;
        let mut released = Vec::new();
        while self.pending.front().is_some_and(|(frame, _)| frame + window <= current_frame) {
            if let Some((_, item)) = self.pending.pop_front() {
                released.push(item);
            }
        }
        released
    }

    /// Drain everything; only valid once the device is idle.
    pub fn drain(&mut self) -> Vec<T> {
        self.pending.drain(..).map(|(_, item)| item).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_cycle_through_the_window() {
        let slots: Vec<usize> = (0..7).map(|f| slot_of(f, 3)).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn oldest_unretired_trails_by_window_size() {
        assert_eq!(oldest_unretired(0, 3), 0);
        assert_eq!(oldest_unretired(2, 3), 0);
        assert_eq!(oldest_unretired(3, 3), 1);
        assert_eq!(oldest_unretired(10, 3), 8);
    }

    #[test]
    fn per_frame_reuses_slot_after_n_frames() {
        let per_frame = PerFrame::new(3, |slot| slot * 10);
        assert_eq!(*per_frame.for_frame(1), 10);
        assert_eq!(*per_frame.for_frame(4), 10);
        assert_eq!(per_frame.len(), 3);
    }

    #[test]
    fn lifetime_queue_holds_items_for_n_frames() {
        let mut queue = LifetimeQueue::new(3);
        queue.push(0, "frame0");
        queue.push(1, "frame1");

        assert!(queue.release(1).is_empty());
        assert!(queue.release(2).is_empty());
        assert_eq!(queue.release(3), vec!["frame0"]);
        assert!(queue.release(3).is_empty());
        assert_eq!(queue.release(4), vec!["frame1"]);
        assert!(queue.is_empty());
    }
}
