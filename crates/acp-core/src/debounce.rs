use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One deferred emission per owner. Every `touch` re-arms the quiescence
/// window; `emit` runs once the window passes without another touch, or once
/// `max_delay` has elapsed since the first pending touch.
pub struct Debouncer {
    trigger: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Debouncer {
    /// `emit` returns `false` to stop the debouncer for good.
    pub fn spawn<F, Fut>(window: Duration, max_delay: Duration, emit: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let trigger = Arc::new(Notify::new());
        let pending = trigger.clone();
        let max_delay = max_delay.max(window);
        let task = tokio::spawn(async move {
            loop {
                pending.notified().await;
                let hard_deadline = Instant::now() + max_delay;
                let mut deadline = Instant::now() + window;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline.min(hard_deadline)) => break,
                        _ = pending.notified() => {
                            deadline = Instant::now() + window;
                        }
                    }
                }
                if !emit().await {
                    break;
                }
            }
        });
        Self { trigger, task }
    }

    pub fn touch(&self) {
        self.trigger.notify_one();
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(window: Duration, max_delay: Duration) -> (Debouncer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let debouncer = Debouncer::spawn(window, max_delay, move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        (debouncer, count)
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_emission() {
        let (debouncer, count) = counting(Duration::from_secs(1), Duration::from_secs(4));
        settle().await;
        for _ in 0..5 {
            debouncer.touch();
            settle().await;
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_writes_still_emit_by_max_delay() {
        let (debouncer, count) = counting(Duration::from_secs(1), Duration::from_secs(2));
        settle().await;
        for _ in 0..30 {
            debouncer.touch();
            settle().await;
            tokio::time::advance(Duration::from_millis(500)).await;
            settle().await;
        }
        assert!(count.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn emit_returning_false_stops_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let debouncer = Debouncer::spawn(Duration::from_secs(1), Duration::from_secs(1), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                false
            }
        });
        settle().await;
        debouncer.touch();
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        debouncer.touch();
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
