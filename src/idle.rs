//! Inactivity timer shared between request handlers and the shutdown race

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// A single resettable deadline.
///
/// There is always exactly one pending expiry: [`reset`](IdleTimer::reset)
/// replaces the deadline in place, and [`expired`](IdleTimer::expired)
/// re-reads it after every wake-up, so a reset that lands while the waiter is
/// sleeping pushes the expiry out instead of adding a second one.
#[derive(Debug)]
pub struct IdleTimer {
    idle: Duration,
    deadline: Mutex<Instant>,
}

impl IdleTimer {
    /// Create a timer that expires `idle` from now
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            deadline: Mutex::new(Instant::now() + idle),
        }
    }

    pub fn idle_duration(&self) -> Duration {
        self.idle
    }

    /// Push the deadline to a full idle duration from now
    pub fn reset(&self) {
        let mut deadline = self.deadline.lock();
        *deadline = Instant::now() + self.idle;
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Resolve once the deadline passes without being reset
    pub async fn expired(&self) {
        loop {
            let deadline = self.deadline();
            tokio::time::sleep_until(deadline).await;
            if self.deadline() <= Instant::now() {
                return;
            }
        }
    }
}
