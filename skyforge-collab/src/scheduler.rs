//! Trailing-edge debounce for collection write-backs.
//!
//! Every `schedule` pushes the deadline out by one window; the owner sleeps
//! until [`CoalescingScheduler::deadline`] and then calls `flush_now`. A burst
//! of N changes therefore costs one flush per key.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct CoalescingScheduler<K> {
    window: Duration,
    deadline: Option<Instant>,
    pending: Vec<K>,
}

impl<K: Copy + Eq> CoalescingScheduler<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            pending: Vec::new(),
        }
    }

    /// Mark `key` dirty and restart the window.
    pub fn schedule(&mut self, key: K) {
        if !self.pending.contains(&key) {
            self.pending.push(key);
        }
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Take every dirty key, in the order first scheduled.
    pub fn flush_now(&mut self) -> Vec<K> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }

    pub fn cancel_all(&mut self) {
        self.deadline = None;
        self.pending.clear();
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces() {
        let mut scheduler = CoalescingScheduler::new(Duration::from_millis(40));
        for _ in 0..10 {
            scheduler.schedule('n');
            tokio::time::advance(Duration::from_millis(5)).await;
        }
        scheduler.schedule('e');

        sleep_until_opt(scheduler.deadline()).await;
        assert_eq!(scheduler.flush_now(), vec!['n', 'e']);
        assert!(!scheduler.is_pending());
        assert!(scheduler.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_extends_deadline() {
        let mut scheduler = CoalescingScheduler::new(Duration::from_millis(40));
        scheduler.schedule(1u8);
        let first = scheduler.deadline().unwrap();
        tokio::time::advance(Duration::from_millis(30)).await;
        scheduler.schedule(1u8);
        assert!(scheduler.deadline().unwrap() > first);
    }

    #[test]
    fn test_cancel_all() {
        let mut scheduler = CoalescingScheduler::new(Duration::from_millis(40));
        scheduler.schedule(1u8);
        scheduler.cancel_all();
        assert!(!scheduler.is_pending());
        assert!(scheduler.flush_now().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_deadline_never_wakes() {
        let result =
            tokio::time::timeout(Duration::from_secs(60), sleep_until_opt(None)).await;
        assert!(result.is_err());
    }
}
