//! A fixed-size sliding window average.
//!
//! Used by the viewfinder to steady the focus figure of merit and the frame
//! rate readout, both of which jitter from frame to frame.

use std::collections::VecDeque;

/// Averages the most recent `window_size` samples.
pub struct SlidingWindowAverage {
    window: VecDeque<f64>,
    window_size: usize,
    /// Running sum of the window for O(1) averaging.
    sum: f64,
}

impl SlidingWindowAverage {
    /// `window_size` must be > 0.
    pub fn new(window_size: usize) -> Self {
        assert!(window_size > 0, "window_size must be positive");
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            sum: 0.0,
        }
    }

    /// Records a sample, evicting the oldest once the window is full.
    pub fn push(&mut self, sample: f64) {
        if self.window.len() == self.window_size
            && let Some(evicted) = self.window.pop_front()
        {
            self.sum -= evicted;
        }
        self.sum += sample;
        self.window.push_back(sample);
    }

    /// Returns `None` until the first sample arrives.
    pub fn average(&self) -> Option<f64> {
        if self.window.is_empty() {
            None
        } else {
            Some(self.sum / self.window.len() as f64)
        }
    }

    pub fn count(&self) -> usize {
        self.window.len()
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window() {
        let w = SlidingWindowAverage::new(3);
        assert_eq!(w.average(), None);
        assert_eq!(w.count(), 0);
    }

    #[test]
    fn test_partial_window() {
        let mut w = SlidingWindowAverage::new(4);
        w.push(2.0);
        w.push(4.0);
        assert_eq!(w.average(), Some(3.0));
    }

    #[test]
    fn test_eviction() {
        let mut w = SlidingWindowAverage::new(2);
        w.push(10.0);
        w.push(20.0);
        w.push(30.0);
        assert_eq!(w.count(), 2);
        assert_eq!(w.average(), Some(25.0));
    }

    #[test]
    fn test_clear() {
        let mut w = SlidingWindowAverage::new(2);
        w.push(1.0);
        w.clear();
        assert_eq!(w.average(), None);
    }

    #[test]
    #[should_panic(expected = "window_size must be positive")]
    fn test_zero_window_panics() {
        SlidingWindowAverage::new(0);
    }
}
