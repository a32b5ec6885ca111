use std::future::Future;

use tokio::{
    task::JoinHandle,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::debug;

/// A repeating background task owned by whoever holds the handle.
///
/// Each tick is awaited before the next one is scheduled and missed ticks are
/// skipped, so a slow tick never piles up concurrent runs. Dropping the handle
/// aborts the loop.
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn a task whose first tick fires immediately.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_at(name, Instant::now(), period, tick)
    }

    /// Spawn a task whose first tick fires one period from now.
    pub fn spawn_after<F, Fut>(name: &'static str, period: Duration, tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_at(name, Instant::now() + period, period, tick)
    }

    fn spawn_at<F, Fut>(name: &'static str, start: Instant, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        debug!(task = name, ?period, "periodic task started");
        Self { name, handle }
    }

    /// Stop the task. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
        debug!(task = self.name, "periodic task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test(start_paused = true)]
    async fn ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let task = PeriodicTask::spawn("test", Duration::from_secs(3), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        time::sleep(Duration::from_millis(7_500)).await;
        // ticks at 0s, 3s, 6s
        assert_eq!(count.load(Ordering::SeqCst), 3);
        task.cancel();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_start_skips_first_tick() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _task = PeriodicTask::spawn_after("test", Duration::from_secs(3), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_ticks_do_not_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let _task = PeriodicTask::spawn("slow", Duration::from_secs(1), move || {
            let (r, p) = (r.clone(), p.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                time::sleep(Duration::from_millis(2_500)).await;
                r.fetch_sub(1, Ordering::SeqCst);
            }
        });
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
