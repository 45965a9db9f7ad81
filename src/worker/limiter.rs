use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Rolling-window admission limiter: at most `max` starts within any window
/// of `duration`.
///
/// Start timestamps live behind a single mutex, so concurrent admissions
/// observe and update the window atomically. A reservation made for a claim
/// that found no job can be cancelled so idle polling does not consume the
/// window.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    /// Reserve a start slot now, or report how long until one frees up
    pub fn try_reserve(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut starts = self.starts.lock();

        while starts
            .front()
            .is_some_and(|start| *start + self.window <= now)
        {
            starts.pop_front();
        }

        if starts.len() < self.max {
            starts.push_back(now);
            return Ok(());
        }

        let wait = starts
            .front()
            .map(|start| (*start + self.window).saturating_duration_since(now))
            .unwrap_or(self.window);
        Err(wait)
    }

    /// Give back the most recent reservation (no job was started with it)
    pub fn cancel_reservation(&self) {
        self.starts.lock().pop_back();
    }

    /// Wait until a start slot is available and reserve it
    pub async fn reserve(&self) {
        loop {
            match self.try_reserve() {
                Ok(()) => return,
                Err(wait) => {
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }
}
