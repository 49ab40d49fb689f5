//! Sliding-window request counter.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window: Duration,
    max: usize,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            window,
            max,
            hits: VecDeque::with_capacity(max),
        }
    }

    /// Count a request at `now`, or report how long until one is allowed.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }

        if self.hits.len() >= self.max {
            let retry_after = self
                .hits
                .front()
                .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }

        self.hits.push_back(now);
        Ok(())
    }

    pub fn in_window(&self) -> usize {
        self.hits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_limits_and_slides() {
        let mut w = SlidingWindow::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..3 {
            assert!(w.try_acquire(start).is_ok());
        }
        let retry = w.try_acquire(start + Duration::from_secs(10)).unwrap_err();
        assert_eq!(retry, Duration::from_secs(50));

        // The first hits fall out of the window after 60s.
        assert!(w.try_acquire(start + Duration::from_secs(60)).is_ok());
        assert_eq!(w.in_window(), 1);
    }
}
