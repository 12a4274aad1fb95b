// Frame-rate history
//
// Raw frame rates are accumulated in groups of ten; each group's average is
// pushed into a bounded history (oldest dropped first) for the overlay.

use std::collections::VecDeque;

pub const SAMPLES_PER_AVERAGE: usize = 10;
pub const HISTORY_LENGTH: usize = 90;

#[derive(Debug, Clone)]
pub struct FrameRateHistory {
    accumulated: f32,
    accumulated_count: usize,
    history: VecDeque<f32>,
    capacity: usize,
}

impl Default for FrameRateHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_LENGTH)
    }
}

impl FrameRateHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            accumulated: 0.0,
            accumulated_count: 0,
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record one frame's duration in seconds.
    pub fn record_frame_time(&mut self, seconds: f32) {
        if seconds > 0.0 && seconds.is_finite() {
            self.record(1.0 / seconds);
        }
    }

    pub fn record(&mut self, frames_per_second: f32) {
        self.accumulated += frames_per_second;
        self.accumulated_count += 1;
        if self.accumulated_count < SAMPLES_PER_AVERAGE {
            return;
        }
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(self.accumulated / self.accumulated_count as f32);
        self.accumulated = 0.0;
        self.accumulated_count = 0;
    }

    /// Averages, oldest first.
    pub fn history(&self) -> impl Iterator<Item = f32> + '_ {
        self.history.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn latest(&self) -> Option<f32> {
        self.history.back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_groups_of_ten() {
        let mut fps = FrameRateHistory::default();
        for i in 0..9 {
            fps.record(i as f32);
        }
        assert!(fps.is_empty());
        fps.record(9.0);
        assert_eq!(fps.latest(), Some(4.5));
    }

    #[test]
    fn drops_oldest_average() {
        let mut fps = FrameRateHistory::with_capacity(3);
        for group in 0..5 {
            for _ in 0..SAMPLES_PER_AVERAGE {
                fps.record(group as f32 * 10.0);
            }
        }
        assert_eq!(fps.history().collect::<Vec<_>>(), vec![20.0, 30.0, 40.0]);
    }

    #[test]
    fn default_keeps_ninety() {
        let mut fps = FrameRateHistory::default();
        for _ in 0..SAMPLES_PER_AVERAGE * 100 {
            fps.record_frame_time(1.0 / 60.0);
        }
        assert_eq!(fps.len(), HISTORY_LENGTH);
        assert!((fps.latest().unwrap() - 60.0).abs() < 0.01);
    }

    #[test]
    fn ignores_zero_frame_time() {
        let mut fps = FrameRateHistory::default();
        for _ in 0..SAMPLES_PER_AVERAGE {
            fps.record_frame_time(0.0);
        }
        assert!(fps.is_empty());
    }
}
